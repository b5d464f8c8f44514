//! Per-model admission control over one-minute usage windows.
//!
//! A reservation upserts the `(model, window_start)` row, checks the limits
//! against the counters it read, and then increments them with an update that
//! only matches the version it read. A concurrent writer bumps the version
//! first, so the losing reservation sees zero affected rows and starts over.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QuerySelect, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{AppConfig, ModelLimits, model_env_key};
use crate::db::to_db_time;
use crate::models::rate_window::{self, Entity as RateWindow};
use crate::telemetry::METRIC_RATE_LIMITER_CONFLICTS;

/// Conflicting reservations are retried this many times before giving up.
const MAX_CONFLICT_RETRIES: usize = 3;
/// Back-off handed out when every conflict retry was lost.
const CONTENTION_RETRY: TimeDelta = TimeDelta::seconds(1);

/// Constraint that rejected a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitReason {
    Rpm,
    Tpm,
    BatchTokens,
    Rpd,
    /// Lost every compare-and-increment race against other writers.
    Contention,
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RateLimitReason::Rpm => "rpm",
            RateLimitReason::Tpm => "tpm",
            RateLimitReason::BatchTokens => "batchTokens",
            RateLimitReason::Rpd => "rpd",
            RateLimitReason::Contention => "contention",
        };
        f.write_str(label)
    }
}

/// Outcome of [`RateLimiter::reserve_capacity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Allowed {
        window_start: DateTime<Utc>,
    },
    Rejected {
        retry_at: DateTime<Utc>,
        reason: RateLimitReason,
    },
}

impl Reservation {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Reservation::Allowed { .. })
    }
}

/// Token amounts a caller wants to reserve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageRequest {
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub batch_tokens: i64,
}

enum AttemptOutcome {
    Decided(Reservation),
    Conflict,
}

/// Database-backed rate limiter shared by all dispatcher workers.
#[derive(Clone)]
pub struct RateLimiter {
    db: DatabaseConnection,
    limits: BTreeMap<String, ModelLimits>,
}

impl RateLimiter {
    /// `limits` is keyed by [`model_env_key`].
    pub fn new(db: DatabaseConnection, limits: BTreeMap<String, ModelLimits>) -> Self {
        Self { db, limits }
    }

    pub fn from_config(db: DatabaseConnection, config: &AppConfig) -> Self {
        Self::new(db, config.model_limits.clone())
    }

    pub fn limits_for(&self, model: &str) -> ModelLimits {
        self.limits
            .get(&model_env_key(model))
            .copied()
            .unwrap_or_default()
    }

    pub async fn reserve_capacity(
        &self,
        model: &str,
        usage: UsageRequest,
    ) -> Result<Reservation, DbErr> {
        self.reserve_capacity_at(model, usage, Utc::now()).await
    }

    /// Same as [`Self::reserve_capacity`] with an explicit clock.
    pub async fn reserve_capacity_at(
        &self,
        model: &str,
        usage: UsageRequest,
        now: DateTime<Utc>,
    ) -> Result<Reservation, DbErr> {
        let limits = self.limits_for(model);
        let window_start = window_start_for(now);

        if limits.is_unlimited() {
            self.record_unlimited(model, window_start, usage, now).await?;
            return Ok(Reservation::Allowed { window_start });
        }

        let limits = &limits;
        retry_on_conflict(model, now, move || {
            self.try_reserve(model, limits, usage, window_start, now)
        })
        .await
    }

    async fn try_reserve(
        &self,
        model: &str,
        limits: &ModelLimits,
        usage: UsageRequest,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, DbErr> {
        let txn = self.db.begin().await?;

        ensure_window(&txn, model, window_start, now).await?;
        let window = RateWindow::find()
            .filter(rate_window::Column::Model.eq(model))
            .filter(rate_window::Column::WindowStart.eq(to_db_time(window_start)))
            .one(&txn)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("rate window {model}@{window_start}")))?;

        let day_requests = if limits.rpd.is_some() {
            day_request_count(&txn, model, window_start).await?
        } else {
            0
        };

        if let Some(reason) = check_limits(limits, &window, usage, day_requests) {
            txn.rollback().await?;
            let retry_at = match reason {
                RateLimitReason::Rpd => next_day_start(window_start),
                _ => window_start + TimeDelta::minutes(1),
            };
            debug!(model, %reason, %retry_at, "Rate reservation rejected");
            return Ok(AttemptOutcome::Decided(Reservation::Rejected {
                retry_at,
                reason,
            }));
        }

        if !increment_if_unchanged(&txn, &window, usage, now).await? {
            txn.rollback().await?;
            return Ok(AttemptOutcome::Conflict);
        }

        txn.commit().await?;
        Ok(AttemptOutcome::Decided(Reservation::Allowed { window_start }))
    }

    async fn record_unlimited(
        &self,
        model: &str,
        window_start: DateTime<Utc>,
        usage: UsageRequest,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let txn = self.db.begin().await?;
        ensure_window(&txn, model, window_start, now).await?;
        apply_delta(&txn, model, window_start, 1, usage, now).await?;
        txn.commit().await
    }

    /// Applies a signed correction once the real token counts are known.
    pub async fn adjust_usage(
        &self,
        model: &str,
        window_start: DateTime<Utc>,
        request_delta: i64,
        response_delta: i64,
    ) -> Result<(), DbErr> {
        if request_delta == 0 && response_delta == 0 {
            return Ok(());
        }
        let delta = UsageRequest {
            request_tokens: request_delta,
            response_tokens: response_delta,
            batch_tokens: 0,
        };
        apply_delta(&self.db, model, window_start, 0, delta, Utc::now()).await?;
        debug!(model, request_delta, response_delta, "Adjusted rate window usage");
        Ok(())
    }

    /// Deletes windows older than `retention`. Returns the number of rows removed.
    pub async fn purge_old_windows(&self, retention: Duration) -> Result<u64, DbErr> {
        let retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::days(2));
        let cutoff = Utc::now() - retention;
        let deleted = RateWindow::delete_many()
            .filter(rate_window::Column::WindowStart.lt(to_db_time(cutoff)))
            .exec(&self.db)
            .await?;
        if deleted.rows_affected > 0 {
            debug!(deleted = deleted.rows_affected, "Purged old rate windows");
        }
        Ok(deleted.rows_affected)
    }

    pub async fn find_window(
        &self,
        model: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<rate_window::Model>, DbErr> {
        RateWindow::find()
            .filter(rate_window::Column::Model.eq(model))
            .filter(rate_window::Column::WindowStart.eq(to_db_time(window_start)))
            .one(&self.db)
            .await
    }
}

/// Start of the one-minute window containing `now`.
pub fn window_start_for(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now)
}

fn next_day_start(window_start: DateTime<Utc>) -> DateTime<Utc> {
    let today = window_start
        .duration_trunc(TimeDelta::days(1))
        .unwrap_or(window_start);
    today + TimeDelta::days(1)
}

/// First violated limit, checked in the order rpm, tpm, batch tokens, rpd.
///
/// Token limits only bind once the window already holds a request, so a single
/// oversized request can still run in an empty window.
fn check_limits(
    limits: &ModelLimits,
    window: &rate_window::Model,
    usage: UsageRequest,
    day_requests: i64,
) -> Option<RateLimitReason> {
    let requests = i64::from(window.request_count);
    if limits
        .rpm
        .is_some_and(|rpm| requests + 1 > i64::from(rpm))
    {
        return Some(RateLimitReason::Rpm);
    }
    if requests > 0
        && limits
            .tpm
            .is_some_and(|tpm| exceeds(window.request_tokens, usage.request_tokens, tpm))
    {
        return Some(RateLimitReason::Tpm);
    }
    if requests > 0
        && limits
            .batch_tokens
            .is_some_and(|cap| exceeds(window.batch_tokens, usage.batch_tokens, cap))
    {
        return Some(RateLimitReason::BatchTokens);
    }
    if limits
        .rpd
        .is_some_and(|rpd| day_requests + 1 > i64::from(rpd))
    {
        return Some(RateLimitReason::Rpd);
    }
    None
}

fn exceeds(current: i64, requested: i64, limit: u64) -> bool {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    current.saturating_add(requested) > limit
}

async fn ensure_window<C: ConnectionTrait>(
    conn: &C,
    model: &str,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    let window = rate_window::ActiveModel {
        id: Set(Uuid::new_v4()),
        model: Set(model.to_string()),
        window_start: Set(to_db_time(window_start)),
        version: Set(0),
        request_count: Set(0),
        request_tokens: Set(0),
        response_tokens: Set(0),
        batch_tokens: Set(0),
        created_at: Set(to_db_time(now)),
        updated_at: Set(to_db_time(now)),
    };
    RateWindow::insert(window)
        .on_conflict(
            OnConflict::columns([rate_window::Column::Model, rate_window::Column::WindowStart])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

/// Runs `attempt` until it reaches a decision, giving up with
/// [`RateLimitReason::Contention`] after [`MAX_CONFLICT_RETRIES`] conflicts.
async fn retry_on_conflict<F, Fut>(
    model: &str,
    now: DateTime<Utc>,
    mut attempt: F,
) -> Result<Reservation, DbErr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<AttemptOutcome, DbErr>>,
{
    for attempt_number in 1..=MAX_CONFLICT_RETRIES {
        match attempt().await? {
            AttemptOutcome::Decided(reservation) => return Ok(reservation),
            AttemptOutcome::Conflict => {
                counter!(METRIC_RATE_LIMITER_CONFLICTS, "model" => model.to_string())
                    .increment(1);
                debug!(
                    model,
                    attempt = attempt_number,
                    "Rate window changed underneath reservation"
                );
            }
        }
    }

    warn!(model, "Rate reservation gave up after repeated conflicts");
    Ok(Reservation::Rejected {
        retry_at: now + CONTENTION_RETRY,
        reason: RateLimitReason::Contention,
    })
}

/// Adds one request plus `usage` to `window`, provided its version is still the one read.
async fn increment_if_unchanged<C: ConnectionTrait>(
    conn: &C,
    window: &rate_window::Model,
    usage: UsageRequest,
    now: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let updated = RateWindow::update_many()
        .col_expr(
            rate_window::Column::RequestCount,
            Expr::col(rate_window::Column::RequestCount).add(1),
        )
        .col_expr(
            rate_window::Column::RequestTokens,
            Expr::col(rate_window::Column::RequestTokens).add(usage.request_tokens),
        )
        .col_expr(
            rate_window::Column::ResponseTokens,
            Expr::col(rate_window::Column::ResponseTokens).add(usage.response_tokens),
        )
        .col_expr(
            rate_window::Column::BatchTokens,
            Expr::col(rate_window::Column::BatchTokens).add(usage.batch_tokens),
        )
        .col_expr(
            rate_window::Column::Version,
            Expr::col(rate_window::Column::Version).add(1),
        )
        .col_expr(rate_window::Column::UpdatedAt, Expr::value(to_db_time(now)))
        .filter(rate_window::Column::Id.eq(window.id))
        .filter(rate_window::Column::Version.eq(window.version))
        .exec(conn)
        .await?;
    Ok(updated.rows_affected > 0)
}

async fn apply_delta<C: ConnectionTrait>(
    conn: &C,
    model: &str,
    window_start: DateTime<Utc>,
    requests: i32,
    delta: UsageRequest,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    RateWindow::update_many()
        .col_expr(
            rate_window::Column::RequestCount,
            Expr::col(rate_window::Column::RequestCount).add(requests),
        )
        .col_expr(
            rate_window::Column::RequestTokens,
            Expr::col(rate_window::Column::RequestTokens).add(delta.request_tokens),
        )
        .col_expr(
            rate_window::Column::ResponseTokens,
            Expr::col(rate_window::Column::ResponseTokens).add(delta.response_tokens),
        )
        .col_expr(
            rate_window::Column::BatchTokens,
            Expr::col(rate_window::Column::BatchTokens).add(delta.batch_tokens),
        )
        .col_expr(
            rate_window::Column::Version,
            Expr::col(rate_window::Column::Version).add(1),
        )
        .col_expr(rate_window::Column::UpdatedAt, Expr::value(to_db_time(now)))
        .filter(rate_window::Column::Model.eq(model))
        .filter(rate_window::Column::WindowStart.eq(to_db_time(window_start)))
        .exec(conn)
        .await?;
    Ok(())
}

async fn day_request_count<C: ConnectionTrait>(
    conn: &C,
    model: &str,
    window_start: DateTime<Utc>,
) -> Result<i64, DbErr> {
    let day_start = window_start
        .duration_trunc(TimeDelta::days(1))
        .unwrap_or(window_start);
    let counts: Vec<i32> = RateWindow::find()
        .select_only()
        .column(rate_window::Column::RequestCount)
        .filter(rate_window::Column::Model.eq(model))
        .filter(rate_window::Column::WindowStart.gte(to_db_time(day_start)))
        .filter(rate_window::Column::WindowStart.lt(to_db_time(next_day_start(window_start))))
        .into_tuple()
        .all(conn)
        .await?;
    Ok(counts.into_iter().map(i64::from).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, h, m, s).unwrap()
    }

    fn limiter(db: DatabaseConnection, model: &str, limits: ModelLimits) -> RateLimiter {
        let mut map = BTreeMap::new();
        map.insert(model_env_key(model), limits);
        RateLimiter::new(db, map)
    }

    fn tokens(request_tokens: i64) -> UsageRequest {
        UsageRequest {
            request_tokens,
            ..UsageRequest::default()
        }
    }

    #[test]
    fn window_start_floors_to_minute() {
        assert_eq!(window_start_for(at(10, 5, 42)), at(10, 5, 0));
        assert_eq!(next_day_start(at(23, 59, 0)), at(0, 0, 0) + TimeDelta::days(1));
    }

    #[test]
    fn rpm_is_checked_before_tpm() {
        let limits = ModelLimits {
            rpm: Some(1),
            tpm: Some(10),
            ..ModelLimits::default()
        };
        let window = rate_window::Model {
            id: Uuid::new_v4(),
            model: "m".into(),
            window_start: to_db_time(at(0, 0, 0)),
            version: 1,
            request_count: 1,
            request_tokens: 100,
            response_tokens: 0,
            batch_tokens: 0,
            created_at: to_db_time(at(0, 0, 0)),
            updated_at: to_db_time(at(0, 0, 0)),
        };

        assert_eq!(
            check_limits(&limits, &window, tokens(5), 0),
            Some(RateLimitReason::Rpm)
        );
    }

    #[tokio::test]
    async fn rejects_after_rpm_and_reopens_next_minute() {
        let db = crate::db::memory_db().await;
        let limiter = limiter(
            db,
            "m1",
            ModelLimits {
                rpm: Some(2),
                ..ModelLimits::default()
            },
        );
        let now = at(10, 0, 30);

        for _ in 0..2 {
            let reservation = limiter.reserve_capacity_at("m1", tokens(10), now).await.unwrap();
            assert_eq!(
                reservation,
                Reservation::Allowed {
                    window_start: at(10, 0, 0)
                }
            );
        }

        let rejected = limiter.reserve_capacity_at("m1", tokens(10), now).await.unwrap();
        assert_eq!(
            rejected,
            Reservation::Rejected {
                retry_at: at(10, 1, 0),
                reason: RateLimitReason::Rpm
            }
        );

        let next = limiter
            .reserve_capacity_at("m1", tokens(10), at(10, 1, 5))
            .await
            .unwrap();
        assert!(next.is_allowed());
    }

    #[tokio::test]
    async fn tpm_admits_a_single_oversized_request_in_an_empty_window() {
        let db = crate::db::memory_db().await;
        let limiter = limiter(
            db,
            "m1",
            ModelLimits {
                tpm: Some(1_000),
                ..ModelLimits::default()
            },
        );
        let now = at(11, 0, 0);

        assert!(
            limiter
                .reserve_capacity_at("m1", tokens(5_000), now)
                .await
                .unwrap()
                .is_allowed()
        );
        let second = limiter.reserve_capacity_at("m1", tokens(1), now).await.unwrap();
        assert!(matches!(
            second,
            Reservation::Rejected {
                reason: RateLimitReason::Tpm,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rpd_counts_across_windows_and_retries_next_day() {
        let db = crate::db::memory_db().await;
        let limiter = limiter(
            db,
            "m1",
            ModelLimits {
                rpd: Some(2),
                ..ModelLimits::default()
            },
        );

        assert!(limiter.reserve_capacity_at("m1", tokens(1), at(1, 0, 0)).await.unwrap().is_allowed());
        assert!(limiter.reserve_capacity_at("m1", tokens(1), at(2, 0, 0)).await.unwrap().is_allowed());

        let rejected = limiter
            .reserve_capacity_at("m1", tokens(1), at(3, 0, 0))
            .await
            .unwrap();
        assert_eq!(
            rejected,
            Reservation::Rejected {
                retry_at: at(0, 0, 0) + TimeDelta::days(1),
                reason: RateLimitReason::Rpd
            }
        );
    }

    async fn current_window(db: &DatabaseConnection, window_start: DateTime<Utc>) -> rate_window::Model {
        RateWindow::find()
            .filter(rate_window::Column::Model.eq("m1"))
            .filter(rate_window::Column::WindowStart.eq(to_db_time(window_start)))
            .one(db)
            .await
            .unwrap()
            .unwrap()
    }

    /// Reads the window, lets another writer bump it, then increments from the stale read.
    async fn losing_attempt(
        db: &DatabaseConnection,
        window_start: DateTime<Utc>,
    ) -> Result<AttemptOutcome, DbErr> {
        let stale = current_window(db, window_start).await;
        apply_delta(db, "m1", window_start, 0, UsageRequest::default(), window_start).await?;
        if increment_if_unchanged(db, &stale, tokens(10), window_start).await? {
            Ok(AttemptOutcome::Decided(Reservation::Allowed { window_start }))
        } else {
            Ok(AttemptOutcome::Conflict)
        }
    }

    #[tokio::test]
    async fn increment_is_refused_after_version_moves() {
        let db = crate::db::memory_db().await;
        let start = at(9, 0, 0);
        ensure_window(&db, "m1", start, start).await.unwrap();

        let stale = current_window(&db, start).await;
        apply_delta(&db, "m1", start, 0, tokens(3), start).await.unwrap();
        assert!(!increment_if_unchanged(&db, &stale, tokens(10), start).await.unwrap());

        let fresh = current_window(&db, start).await;
        assert!(increment_if_unchanged(&db, &fresh, tokens(10), start).await.unwrap());
        let window = current_window(&db, start).await;
        assert_eq!(window.request_count, 1);
        assert_eq!(window.request_tokens, 13);
        assert_eq!(window.version, stale.version + 2);
    }

    #[tokio::test]
    async fn repeated_conflicts_end_in_contention() {
        let db = crate::db::memory_db().await;
        let start = at(9, 30, 0);
        ensure_window(&db, "m1", start, start).await.unwrap();
        let calls = AtomicUsize::new(0);
        let (db_ref, calls_ref) = (&db, &calls);

        let outcome = retry_on_conflict("m1", start, move || {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            losing_attempt(db_ref, start)
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), MAX_CONFLICT_RETRIES);
        assert_eq!(
            outcome,
            Reservation::Rejected {
                retry_at: start + CONTENTION_RETRY,
                reason: RateLimitReason::Contention
            }
        );
        assert_eq!(current_window(&db, start).await.request_count, 0);
    }

    #[tokio::test]
    async fn conflict_is_retried_until_a_decision() {
        let db = crate::db::memory_db().await;
        let start = at(9, 45, 0);
        ensure_window(&db, "m1", start, start).await.unwrap();
        let limiter = limiter(
            db.clone(),
            "m1",
            ModelLimits {
                rpm: Some(5),
                ..ModelLimits::default()
            },
        );
        let limits = limiter.limits_for("m1");
        let calls = AtomicUsize::new(0);
        let (db_ref, calls_ref, limiter_ref, limits_ref) = (&db, &calls, &limiter, &limits);

        let outcome = retry_on_conflict("m1", start, move || {
            let call = calls_ref.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    losing_attempt(db_ref, start).await
                } else {
                    limiter_ref
                        .try_reserve("m1", limits_ref, tokens(10), start, start)
                        .await
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome, Reservation::Allowed { window_start: start });
        assert_eq!(current_window(&db, start).await.request_count, 1);
    }

    #[tokio::test]
    async fn unlimited_models_are_always_allowed_and_tracked() {
        let db = crate::db::memory_db().await;
        let limiter = RateLimiter::new(db, BTreeMap::new());
        let now = at(12, 0, 0);

        for _ in 0..5 {
            assert!(limiter.reserve_capacity_at("free", tokens(100), now).await.unwrap().is_allowed());
        }

        let window = limiter.find_window("free", at(12, 0, 0)).await.unwrap().unwrap();
        assert_eq!(window.request_count, 5);
        assert_eq!(window.request_tokens, 500);
    }

    #[tokio::test]
    async fn adjust_usage_applies_signed_delta() {
        let db = crate::db::memory_db().await;
        let limiter = limiter(
            db,
            "m1",
            ModelLimits {
                rpm: Some(10),
                ..ModelLimits::default()
            },
        );
        let now = Utc::now();
        let Reservation::Allowed { window_start } = limiter
            .reserve_capacity_at("m1", tokens(1_000), now)
            .await
            .unwrap()
        else {
            panic!("reservation should be allowed");
        };

        limiter.adjust_usage("m1", window_start, -400, 250).await.unwrap();

        let window = limiter.find_window("m1", window_start).await.unwrap().unwrap();
        assert_eq!(window.request_tokens, 600);
        assert_eq!(window.response_tokens, 250);
        assert_eq!(window.version, 2);
    }

    #[tokio::test]
    async fn purge_removes_only_old_windows() {
        let db = crate::db::memory_db().await;
        let limiter = RateLimiter::new(db, BTreeMap::new());
        let now = Utc::now();

        limiter
            .reserve_capacity_at("m1", tokens(1), now - TimeDelta::days(3))
            .await
            .unwrap();
        limiter.reserve_capacity_at("m1", tokens(1), now).await.unwrap();

        let purged = limiter
            .purge_old_windows(Duration::from_secs(48 * 3600))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(limiter.find_window("m1", window_start_for(now)).await.unwrap().is_some());
    }
}
