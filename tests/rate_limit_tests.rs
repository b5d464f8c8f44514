//! Rate window admission and model fallback.

mod test_utils;

use std::collections::BTreeMap;

use chrono::{TimeDelta, Utc};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use tempfile::TempDir;

use intake::config::ModelLimits;
use intake::models::{AttemptStatus, JobAttempt, JobStatus, JobType, job_attempt};
use intake::rate_limiter::{RateLimitReason, RateLimiter, Reservation, UsageRequest, window_start_for};
use test_utils::{Harness, options, scenario_rows, setup_file_db, setup_test_db, test_config};

fn usage() -> UsageRequest {
    UsageRequest {
        request_tokens: 100,
        response_tokens: 50,
        batch_tokens: 150,
    }
}

#[tokio::test]
async fn concurrent_reservations_never_exceed_rpm() -> anyhow::Result<()> {
    let db = setup_test_db().await?;
    let limits = BTreeMap::from([(
        "M1".to_string(),
        ModelLimits {
            rpm: Some(3),
            ..ModelLimits::default()
        },
    )]);
    let limiter = RateLimiter::new(db, limits);
    let now = Utc::now();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let limiter = limiter.clone();
        tasks.spawn(async move { limiter.reserve_capacity_at("m1", usage(), now).await });
    }

    let mut allowed = 0;
    let mut rejected = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result?? {
            Reservation::Allowed { .. } => allowed += 1,
            Reservation::Rejected { reason, retry_at } => rejected.push((reason, retry_at)),
        }
    }
    assert_eq!(allowed, 3);
    assert_eq!(rejected.len(), 5);
    assert!(rejected.iter().all(|(reason, _)| *reason == RateLimitReason::Rpm));
    assert!(
        rejected
            .iter()
            .all(|(_, retry_at)| *retry_at > window_start_for(now))
    );

    let window = limiter
        .find_window("m1", window_start_for(now))
        .await?
        .expect("window row");
    assert_eq!(window.request_count, 3);
    assert_eq!(window.request_tokens, 300);
    Ok(())
}

#[tokio::test]
async fn racing_connections_never_exceed_rpm() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = setup_file_db(&dir, 8).await?;
    let limits = BTreeMap::from([(
        "M1".to_string(),
        ModelLimits {
            rpm: Some(3),
            ..ModelLimits::default()
        },
    )]);
    let limiter = RateLimiter::new(db, limits);
    let now = Utc::now();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let limiter = limiter.clone();
        tasks.spawn(async move { limiter.reserve_capacity_at("m1", usage(), now).await });
    }

    let mut allowed = 0;
    let mut rejected = 0;
    while let Some(result) = tasks.join_next().await {
        match result?? {
            Reservation::Allowed { .. } => allowed += 1,
            Reservation::Rejected { .. } => rejected += 1,
        }
    }
    assert_eq!(allowed, 3);
    assert_eq!(rejected, 5);

    let window = limiter
        .find_window("m1", window_start_for(now))
        .await?
        .expect("window row");
    assert_eq!(window.request_count, 3);
    assert_eq!(window.request_tokens, 300);
    Ok(())
}

#[tokio::test]
async fn token_limit_applies_once_window_has_usage() -> anyhow::Result<()> {
    let db = setup_test_db().await?;
    let limits = BTreeMap::from([(
        "M1".to_string(),
        ModelLimits {
            tpm: Some(50),
            ..ModelLimits::default()
        },
    )]);
    let limiter = RateLimiter::new(db, limits);
    let now = Utc::now();

    let first = limiter.reserve_capacity_at("m1", usage(), now).await?;
    assert!(first.is_allowed());

    let second = limiter.reserve_capacity_at("m1", usage(), now).await?;
    assert!(matches!(
        second,
        Reservation::Rejected {
            reason: RateLimitReason::Tpm,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn exhausted_primary_model_falls_back() -> anyhow::Result<()> {
    let mut config = test_config();
    config.model_limits.insert(
        "M1".to_string(),
        ModelLimits {
            rpm: Some(1),
            ..ModelLimits::default()
        },
    );
    let harness = Harness::with_ai(config.clone()).await?;

    let limiter = RateLimiter::from_config(harness.db.clone(), &config);
    assert!(limiter.reserve_capacity("m1", usage()).await?.is_allowed());

    let created = harness
        .pipeline
        .create_spreadsheet_upload(
            vec![scenario_rows().remove(0)],
            "clerk@example.gov",
            "one.csv",
            false,
        )
        .await?;
    let analyze = created
        .jobs
        .iter()
        .find(|job| job.job_type == JobType::Analyze)
        .unwrap();

    let stats = harness.pipeline.run_dispatcher(options()).await?;
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(harness.ai().calls(), vec!["m2"]);

    let attempts = JobAttempt::find()
        .filter(job_attempt::Column::JobId.eq(analyze.id))
        .all(&harness.db)
        .await?;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].model, "m2");
    assert!(attempts[0].is_fallback);
    assert_eq!(attempts[0].status, AttemptStatus::Succeeded);
    assert!(attempts[0].rate_window_start.is_some());
    Ok(())
}

#[tokio::test]
async fn provider_rate_limit_with_hint_moves_to_fallback() -> anyhow::Result<()> {
    let harness = Harness::with_ai(test_config()).await?;
    harness.ai().fail_next("m1", 429, Some(30));

    let created = harness
        .pipeline
        .create_spreadsheet_upload(
            vec![scenario_rows().remove(0)],
            "clerk@example.gov",
            "one.csv",
            false,
        )
        .await?;
    let analyze = created
        .jobs
        .iter()
        .find(|job| job.job_type == JobType::Analyze)
        .unwrap();

    let stats = harness.pipeline.run_dispatcher(options()).await?;
    assert_eq!(stats.succeeded, 1);
    assert_eq!(harness.ai().calls(), vec!["m1", "m2"]);

    let mut attempts = JobAttempt::find()
        .filter(job_attempt::Column::JobId.eq(analyze.id))
        .all(&harness.db)
        .await?;
    attempts.sort_by_key(|attempt| attempt.is_fallback);
    let summary: Vec<_> = attempts
        .iter()
        .map(|attempt| (attempt.model.as_str(), attempt.is_fallback, attempt.status))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("m1", false, AttemptStatus::Failed),
            ("m2", true, AttemptStatus::Succeeded),
        ]
    );
    assert_eq!(attempts[0].error_code.as_deref(), Some("rate_limited"));
    Ok(())
}

#[tokio::test]
async fn rejected_job_waits_for_the_earliest_model() -> anyhow::Result<()> {
    let mut config = test_config();
    config.model_limits.insert(
        "M1".to_string(),
        ModelLimits {
            rpm: Some(1),
            ..ModelLimits::default()
        },
    );
    config.model_limits.insert(
        "M2".to_string(),
        ModelLimits {
            rpd: Some(1),
            ..ModelLimits::default()
        },
    );
    let harness = Harness::with_ai(config.clone()).await?;

    let limiter = RateLimiter::from_config(harness.db.clone(), &config);
    assert!(limiter.reserve_capacity("m1", usage()).await?.is_allowed());
    assert!(limiter.reserve_capacity("m2", usage()).await?.is_allowed());

    let created = harness
        .pipeline
        .create_spreadsheet_upload(
            vec![scenario_rows().remove(0)],
            "clerk@example.gov",
            "one.csv",
            false,
        )
        .await?;
    let analyze = created
        .jobs
        .iter()
        .find(|job| job.job_type == JobType::Analyze)
        .unwrap();

    let stats = harness.pipeline.run_dispatcher(options()).await?;
    assert_eq!(stats.rate_limited, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.budget_skipped, 0);
    assert!(harness.ai().calls().is_empty());

    let job = harness.job(analyze.id).await?;
    assert_eq!(job.status, JobStatus::Ready);
    let wait = job.next_run_at.to_utc() - Utc::now();
    assert!(wait <= TimeDelta::minutes(2), "job parked for {wait}");
    Ok(())
}
