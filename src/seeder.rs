//! Structured-data seeding for the INSERT stage.
//!
//! Elections are upserted by (municipality, state, position, election date) and
//! candidates by slug, all in one transaction per batch.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::db::to_db_time;
use crate::error::is_unique_violation;
use crate::models::{Candidate, Election, candidate, election};
use crate::payload::{InsertSummary, StructuredCandidate, StructuredElection, StructuredPayload};

#[derive(Debug, Error)]
pub enum SeedError {
    /// Another writer inserted the same natural key concurrently
    #[error("concurrent write on {0}")]
    Conflict(String),
    #[error("election is missing {0}")]
    MissingField(&'static str),
    #[error("database error: {0}")]
    Database(DbErr),
}

impl From<DbErr> for SeedError {
    fn from(err: DbErr) -> Self {
        if is_unique_violation(&err) {
            SeedError::Conflict(err.to_string())
        } else {
            SeedError::Database(err)
        }
    }
}

/// One batch's structured data to write.
#[derive(Debug, Clone, Copy)]
pub struct SeedRequest<'a> {
    pub upload_id: Uuid,
    pub payload: &'a StructuredPayload,
    pub force_hidden: bool,
}

#[async_trait]
pub trait Seeder: Send + Sync {
    async fn seed(&self, request: SeedRequest<'_>) -> Result<InsertSummary, SeedError>;
}

#[derive(Clone)]
pub struct DatabaseSeeder {
    db: DatabaseConnection,
}

impl DatabaseSeeder {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Seeder for DatabaseSeeder {
    async fn seed(&self, request: SeedRequest<'_>) -> Result<InsertSummary, SeedError> {
        let txn = self.db.begin().await?;
        let mut summary = InsertSummary::default();

        for entry in &request.payload.elections {
            let election_id = upsert_election(&txn, entry, &mut summary).await?;
            for person in &entry.candidates {
                if person.name.trim().is_empty() {
                    continue;
                }
                let slug = candidate_slug(&person.name, entry);
                upsert_candidate(&txn, election_id, &slug, person, &request, &mut summary)
                    .await?;
                if let Some(email) = person
                    .email
                    .as_deref()
                    .map(str::trim)
                    .filter(|email| !email.is_empty())
                {
                    summary
                        .email_to_slug
                        .insert(email.to_lowercase(), slug.clone());
                }
                summary.candidate_slugs.push(slug);
            }
        }

        txn.commit().await?;
        debug!(
            upload_id = %request.upload_id,
            elections_created = summary.elections_created,
            candidates_created = summary.candidates_created,
            "Seeded structured data"
        );
        Ok(summary)
    }
}

async fn upsert_election(
    txn: &DatabaseTransaction,
    entry: &StructuredElection,
    summary: &mut InsertSummary,
) -> Result<Uuid, SeedError> {
    let municipality = required(&entry.municipality, "municipality")?;
    let state = required(&entry.state, "state")?;
    let position = required(&entry.position, "position")?;
    let election_date = entry
        .election_date
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let now = to_db_time(Utc::now());

    let existing = Election::find()
        .filter(election::Column::Municipality.eq(municipality))
        .filter(election::Column::State.eq(state))
        .filter(election::Column::Position.eq(position))
        .filter(election::Column::ElectionDate.eq(election_date.as_str()))
        .one(txn)
        .await?;

    match existing {
        Some(found) => {
            let id = found.id;
            if let Some(description) = entry.description.clone() {
                let mut active: election::ActiveModel = found.into();
                active.description = Set(Some(description));
                active.updated_at = Set(now);
                active.update(txn).await?;
            }
            summary.elections_updated += 1;
            Ok(id)
        }
        None => {
            let id = Uuid::new_v4();
            election::ActiveModel {
                id: Set(id),
                municipality: Set(municipality.to_string()),
                state: Set(state.to_string()),
                position: Set(position.to_string()),
                election_date: Set(election_date),
                description: Set(entry.description.clone()),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(txn)
            .await?;
            summary.elections_created += 1;
            Ok(id)
        }
    }
}

async fn upsert_candidate(
    txn: &DatabaseTransaction,
    election_id: Uuid,
    slug: &str,
    person: &StructuredCandidate,
    request: &SeedRequest<'_>,
    summary: &mut InsertSummary,
) -> Result<(), SeedError> {
    let now = to_db_time(Utc::now());
    let existing = Candidate::find()
        .filter(candidate::Column::Slug.eq(slug))
        .one(txn)
        .await?;

    match existing {
        Some(found) => {
            let hidden = found.hidden || request.force_hidden;
            let mut active: candidate::ActiveModel = found.into();
            active.election_id = Set(election_id);
            active.upload_id = Set(Some(request.upload_id));
            active.full_name = Set(person.name.trim().to_string());
            if person.email.is_some() {
                active.email = Set(person.email.clone());
            }
            if person.party.is_some() {
                active.party = Set(person.party.clone());
            }
            if person.website.is_some() {
                active.website = Set(person.website.clone());
            }
            if person.bio.is_some() {
                active.bio = Set(person.bio.clone());
            }
            active.hidden = Set(hidden);
            active.updated_at = Set(now);
            active.update(txn).await?;
            summary.candidates_updated += 1;
        }
        None => {
            candidate::ActiveModel {
                id: Set(Uuid::new_v4()),
                election_id: Set(election_id),
                upload_id: Set(Some(request.upload_id)),
                slug: Set(slug.to_string()),
                full_name: Set(person.name.trim().to_string()),
                email: Set(person.email.clone()),
                party: Set(person.party.clone()),
                website: Set(person.website.clone()),
                bio: Set(person.bio.clone()),
                hidden: Set(request.force_hidden),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(txn)
            .await?;
            summary.candidates_created += 1;
        }
    }
    Ok(())
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, SeedError> {
    let value = value.trim();
    if value.is_empty() {
        Err(SeedError::MissingField(field))
    } else {
        Ok(value)
    }
}

/// `jane-doe-springfield-il` style profile slug.
pub fn candidate_slug(name: &str, election: &StructuredElection) -> String {
    slugify(&format!(
        "{} {} {}",
        name, election.municipality, election.state
    ))
}

pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_db;

    fn payload(name: &str, email: Option<&str>) -> StructuredPayload {
        StructuredPayload {
            elections: vec![StructuredElection {
                municipality: "Springfield".into(),
                state: "IL".into(),
                position: "Mayor".into(),
                election_date: Some("2026-11-03".into()),
                description: None,
                candidates: vec![StructuredCandidate {
                    name: name.into(),
                    email: email.map(str::to_string),
                    ..StructuredCandidate::default()
                }],
            }],
        }
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Jane  O'Doe, Jr. "), "jane-o-doe-jr");
        assert_eq!(slugify("---"), "");
    }

    #[tokio::test]
    async fn seeding_twice_updates_instead_of_duplicating() {
        let db = memory_db().await;
        let seeder = DatabaseSeeder::new(db.clone());
        let upload_id = Uuid::new_v4();
        let first = payload("Jane Doe", Some("Jane@Example.com"));

        let created = seeder
            .seed(SeedRequest {
                upload_id,
                payload: &first,
                force_hidden: false,
            })
            .await
            .unwrap();
        assert_eq!(created.elections_created, 1);
        assert_eq!(created.candidates_created, 1);
        assert_eq!(
            created.email_to_slug.get("jane@example.com").map(String::as_str),
            Some("jane-doe-springfield-il")
        );

        let updated = seeder
            .seed(SeedRequest {
                upload_id,
                payload: &first,
                force_hidden: true,
            })
            .await
            .unwrap();
        assert_eq!(updated.elections_updated, 1);
        assert_eq!(updated.candidates_updated, 1);

        let stored = Candidate::find().all(&db).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].hidden);
    }

    #[tokio::test]
    async fn election_without_state_is_rejected() {
        let db = memory_db().await;
        let mut bad = payload("Jane Doe", None);
        bad.elections[0].state = " ".into();

        let result = DatabaseSeeder::new(db)
            .seed(SeedRequest {
                upload_id: Uuid::new_v4(),
                payload: &bad,
                force_hidden: false,
            })
            .await;
        assert!(matches!(result, Err(SeedError::MissingField("state"))));
    }
}
