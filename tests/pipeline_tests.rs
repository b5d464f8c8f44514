//! Job queue lifecycle tests against an in-memory database, plus claim races on a
//! multi-connection file database.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use tempfile::TempDir;

use intake::error::{JobError, PipelineError};
use intake::jobs::{InsertHandler, JobContext, JobHandler};
use intake::models::{
    AttemptStatus, BatchStatus, Candidate, JobAttempt, JobStatus, JobType, UploadStatus, job,
    job_attempt,
};
use intake::payload::{AiGeneration, JobOutput, TokenUsage};
use intake::seeder::DatabaseSeeder;
use test_utils::{Harness, options, scenario_rows, test_config};

#[tokio::test]
async fn upload_is_grouped_into_batches_with_job_chains() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;

    assert_eq!(created.batches.len(), 2);
    assert_eq!(created.jobs.len(), 6);

    let mut sizes: Vec<i32> = created.batches.iter().map(|batch| batch.row_count).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 2]);

    for batch in &created.batches {
        assert_eq!(batch.status, BatchStatus::Queued);
        let chain: Vec<&job::Model> = created
            .jobs
            .iter()
            .filter(|job| job.batch_id == Some(batch.id))
            .collect();
        let analyze = chain.iter().find(|job| job.job_type == JobType::Analyze).unwrap();
        let structure = chain.iter().find(|job| job.job_type == JobType::Structure).unwrap();
        let insert = chain.iter().find(|job| job.job_type == JobType::Insert).unwrap();
        assert_eq!(analyze.status, JobStatus::Ready);
        assert_eq!(structure.dependency_job_id, Some(analyze.id));
        assert_eq!(insert.dependency_job_id, Some(structure.id));
        assert_eq!(structure.status, JobStatus::Pending);
        assert_eq!(insert.status, JobStatus::Pending);
    }

    let queued = harness.mailer.subjects();
    assert_eq!(queued, vec!["Upload received: roster.csv".to_string()]);
    Ok(())
}

#[tokio::test]
async fn pending_jobs_are_neither_listed_nor_claimable() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;

    let dispatchable = harness.queue().list_dispatchable(50, Utc::now()).await?;
    assert_eq!(dispatchable.len(), 2);
    assert!(dispatchable.iter().all(|job| job.job_type == JobType::Analyze));

    let structure = created
        .jobs
        .iter()
        .find(|job| job.job_type == JobType::Structure)
        .unwrap();
    let err = harness
        .queue()
        .claim(structure.id, "m1", false, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::JobNotReady {
            status: JobStatus::Pending,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;
    let analyze = created
        .jobs
        .iter()
        .find(|job| job.job_type == JobType::Analyze)
        .unwrap();

    let queue = harness.queue();
    let (first, second) = tokio::join!(
        queue.claim(analyze.id, "m1", false, None),
        queue.claim(analyze.id, "m2", true, None),
    );
    let winners = [first.is_ok(), second.is_ok()]
        .into_iter()
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    let loser = if first.is_err() { first } else { second };
    assert!(matches!(
        loser,
        Err(PipelineError::JobNotReady {
            status: JobStatus::InProgress,
            ..
        })
    ));

    let attempts = JobAttempt::find()
        .filter(job_attempt::Column::JobId.eq(analyze.id))
        .count(&harness.db)
        .await?;
    assert_eq!(attempts, 1);
    Ok(())
}

#[tokio::test]
async fn stale_in_progress_job_is_reclaimed() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;
    let analyze = created
        .jobs
        .iter()
        .find(|job| job.job_type == JobType::Analyze)
        .unwrap();
    let claimed = harness.queue().claim(analyze.id, "m1", false, None).await?;

    let fresh = harness
        .queue()
        .reset_stale_jobs_at(Duration::from_secs(600), Utc::now())
        .await?;
    assert_eq!(fresh, 0);

    let later = Utc::now() + TimeDelta::minutes(15);
    let reclaimed = harness
        .queue()
        .reset_stale_jobs_at(Duration::from_secs(600), later)
        .await?;
    assert_eq!(reclaimed, 1);

    let job = harness.job(analyze.id).await?;
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.retry_count, 1);
    assert!(job.started_at.is_none());

    let attempt = JobAttempt::find_by_id(claimed.attempt.id)
        .one(&harness.db)
        .await?
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn mock_upload_runs_to_completion_and_mails_once() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;

    let ticks = harness.drain(harness.pipeline.dispatcher()).await?;
    let failed: u32 = ticks.iter().map(|tick| tick.failed).sum();
    assert_eq!(failed, 0);

    let upload = harness.upload(created.upload.id).await?;
    assert_eq!(upload.status, UploadStatus::Completed);
    assert!(upload.completed_at.is_some());
    assert!(upload.raw_rows.is_none());

    for batch in &created.batches {
        assert_eq!(harness.batch(batch.id).await?.status, BatchStatus::Completed);
    }

    let candidates = Candidate::find().all(&harness.db).await?;
    assert_eq!(candidates.len(), 3);
    assert!(candidates.iter().all(|candidate| !candidate.hidden));

    let completion: Vec<_> = harness
        .mailer
        .sent()
        .into_iter()
        .filter(|message| message.subject == "Upload finished: roster.csv")
        .collect();
    assert_eq!(completion.len(), 1);
    assert_eq!(completion[0].to, vec!["clerk@example.gov".to_string()]);
    assert_eq!(completion[0].attachments.len(), 1);
    assert_eq!(completion[0].attachments[0].filename, "roster-results.csv");
    assert!(!completion[0].attachments[0].bytes.is_empty());

    let subjects = harness.mailer.subjects();
    for stage in ["Analysis finished", "Structuring finished", "Records saved"] {
        let count = subjects.iter().filter(|s| s.starts_with(stage)).count();
        assert_eq!(count, 1, "{stage}");
    }
    Ok(())
}

#[tokio::test]
async fn finalization_jobs_are_created_once() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;
    let upload_id = created.upload.id;

    assert!(!harness.queue().maybe_enqueue_finalization_jobs(upload_id).await?);

    harness.drain(harness.pipeline.dispatcher()).await?;

    let (again, concurrent) = tokio::join!(
        harness.queue().maybe_enqueue_finalization_jobs(upload_id),
        harness.queue().maybe_enqueue_finalization_jobs(upload_id),
    );
    assert!(!again?);
    assert!(!concurrent?);

    for job_type in [JobType::Workbook, JobType::Notification] {
        let count = intake::models::Job::find()
            .filter(job::Column::UploadId.eq(upload_id))
            .filter(job::Column::JobType.eq(job_type))
            .count(&harness.db)
            .await?;
        assert_eq!(count, 1, "{job_type}");
    }
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_flag_batch_for_reupload() -> anyhow::Result<()> {
    let harness = Harness::with_ai(test_config()).await?;
    for _ in 0..5 {
        harness.ai().fail_next("m1", 500, None);
    }
    let created = harness
        .pipeline
        .create_spreadsheet_upload(
            vec![scenario_rows().remove(2)],
            "clerk@example.gov",
            "austin.csv",
            false,
        )
        .await?;
    let batch_id = created.batches[0].id;

    harness.drain(harness.pipeline.dispatcher()).await?;

    assert_eq!(harness.ai().calls(), vec!["m1", "m1", "m1"]);

    let batch = harness.batch(batch_id).await?;
    assert_eq!(batch.status, BatchStatus::NeedsReupload);
    assert!(batch.error_reason.is_some());

    let analyze = harness.job(batch.analyze_job_id.unwrap()).await?;
    assert_eq!(analyze.status, JobStatus::Failed);
    assert_eq!(analyze.retry_count, 3);
    assert_eq!(
        harness.job(batch.structure_job_id.unwrap()).await?.status,
        JobStatus::Skipped
    );
    assert_eq!(
        harness.job(batch.insert_job_id.unwrap()).await?.status,
        JobStatus::Skipped
    );

    let upload = harness.upload(created.upload.id).await?;
    assert_eq!(upload.status, UploadStatus::Failed);
    assert!(
        harness
            .mailer
            .subjects()
            .contains(&"Upload finished: austin.csv".to_string())
    );
    Ok(())
}

/// Rejects inserts for one municipality with a client error, delegates the rest.
struct RejectingInsert {
    municipality: &'static str,
    inner: InsertHandler,
}

#[async_trait]
impl JobHandler for RejectingInsert {
    fn job_type(&self) -> JobType {
        JobType::Insert
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let batch = ctx.require_batch()?;
        if batch.municipality.eq_ignore_ascii_case(self.municipality) {
            return Err(JobError::from_status(400, "rejected by validation", None));
        }
        self.inner.run(ctx).await
    }
}

#[tokio::test]
async fn client_error_fails_only_its_batch() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let dispatcher = harness.dispatcher_with(Arc::new(RejectingInsert {
        municipality: "Austin",
        inner: InsertHandler::new(Arc::new(DatabaseSeeder::new(harness.db.clone()))),
    }));
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;

    harness.drain(&dispatcher).await?;

    let mut statuses = Vec::new();
    for batch in &created.batches {
        let batch = harness.batch(batch.id).await?;
        if batch.municipality.eq_ignore_ascii_case("Austin") {
            let insert = harness.job(batch.insert_job_id.unwrap()).await?;
            assert_eq!(insert.status, JobStatus::Failed);
            assert_eq!(insert.retry_count, 1);
        }
        statuses.push((batch.municipality.to_lowercase(), batch.status));
    }
    statuses.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        statuses,
        vec![
            ("austin".to_string(), BatchStatus::NeedsReupload),
            ("springfield".to_string(), BatchStatus::Completed),
        ]
    );

    let upload = harness.upload(created.upload.id).await?;
    assert_eq!(upload.status, UploadStatus::Failed);
    assert!(upload.raw_rows.is_some());

    let candidates = Candidate::find().count(&harness.db).await?;
    assert_eq!(candidates, 2);
    Ok(())
}

#[tokio::test]
async fn operator_retry_requeues_a_failed_batch() -> anyhow::Result<()> {
    let harness = Harness::with_ai(test_config()).await?;
    harness.ai().fail_next("m1", 403, None);
    let created = harness
        .pipeline
        .create_spreadsheet_upload(
            vec![scenario_rows().remove(2)],
            "clerk@example.gov",
            "austin.csv",
            false,
        )
        .await?;
    let upload_id = created.upload.id;
    let batch_id = created.batches[0].id;

    harness.pipeline.run_dispatcher(options()).await?;
    assert_eq!(harness.batch(batch_id).await?.status, BatchStatus::NeedsReupload);

    harness.drain(harness.pipeline.dispatcher()).await?;
    assert_eq!(harness.upload(upload_id).await?.status, UploadStatus::Failed);
    assert_eq!(completion_mails(&harness, "austin.csv"), 1);

    let retried = harness.pipeline.retry_batch(upload_id, batch_id).await?;
    assert_eq!(retried.status, BatchStatus::Queued);

    harness.drain(harness.pipeline.dispatcher()).await?;
    assert_eq!(harness.batch(batch_id).await?.status, BatchStatus::Completed);
    assert_eq!(harness.upload(upload_id).await?.status, UploadStatus::Completed);
    assert_eq!(completion_mails(&harness, "austin.csv"), 2);
    Ok(())
}

fn completion_mails(harness: &Harness, filename: &str) -> usize {
    let subject = format!("Upload finished: {filename}");
    harness
        .mailer
        .subjects()
        .iter()
        .filter(|sent| **sent == subject)
        .count()
}

#[tokio::test]
async fn claims_race_on_separate_connections() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = Harness::mock_on_file(test_config(), &dir).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;
    let analyze = created
        .jobs
        .iter()
        .find(|job| job.job_type == JobType::Analyze)
        .unwrap();

    let queue = harness.queue();
    let (a, b, c, d) = tokio::join!(
        queue.claim(analyze.id, "m1", false, None),
        queue.claim(analyze.id, "m1", false, None),
        queue.claim(analyze.id, "m2", true, None),
        queue.claim(analyze.id, "m2", true, None),
    );
    let results = [a, b, c, d];
    assert_eq!(results.iter().filter(|claim| claim.is_ok()).count(), 1);
    assert!(results.iter().filter(|claim| claim.is_err()).all(|claim| matches!(
        claim,
        Err(PipelineError::JobNotReady {
            status: JobStatus::InProgress,
            ..
        })
    )));

    let attempts = JobAttempt::find()
        .filter(job_attempt::Column::JobId.eq(analyze.id))
        .count(&harness.db)
        .await?;
    assert_eq!(attempts, 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_time_budget_leaves_jobs_for_next_tick() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;

    let stats = harness
        .pipeline
        .run_dispatcher(intake::dispatcher::DispatchOptions {
            time_budget: Duration::ZERO,
            ..options()
        })
        .await?;
    assert_eq!(stats.attempted, 0);
    assert_eq!(stats.budget_skipped, 2);
    assert_eq!(stats.skipped, 2);

    for original in created.jobs.iter().filter(|job| job.job_type == JobType::Analyze) {
        let job = harness.job(original.id).await?;
        assert_eq!(job.status, JobStatus::Ready);
        assert_eq!(job.retry_count, 0);
        assert!(job.next_run_at.to_utc() <= Utc::now());
    }

    let stats = harness.pipeline.run_dispatcher(options()).await?;
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.budget_skipped, 0);
    Ok(())
}

#[tokio::test]
async fn skipping_an_in_flight_job_makes_its_result_stale() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;
    let springfield = created
        .batches
        .iter()
        .find(|batch| batch.municipality.eq_ignore_ascii_case("Springfield"))
        .unwrap();
    let analyze_id = springfield.analyze_job_id.unwrap();

    let claimed = harness.queue().claim(analyze_id, "m1", false, None).await?;
    let skipped = harness.pipeline.skip_job(analyze_id, "duplicate roster").await?;
    assert_eq!(skipped.status, JobStatus::Skipped);

    let output = JobOutput::Analyze(AiGeneration {
        model: "m1".to_string(),
        text: "{}".to_string(),
        usage: TokenUsage::default(),
        mock: true,
    });
    let late = harness
        .queue()
        .record_success(analyze_id, claimed.attempt.id, &output)
        .await;
    assert!(matches!(late, Err(PipelineError::StaleAttempt { .. })));

    let attempt = JobAttempt::find_by_id(claimed.attempt.id)
        .one(&harness.db)
        .await?
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.error_code.as_deref(), Some("skipped"));

    let batch = harness.batch(springfield.id).await?;
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.error_reason.as_deref(), Some("duplicate roster"));
    for downstream in [batch.structure_job_id, batch.insert_job_id] {
        assert_eq!(
            harness.job(downstream.unwrap()).await?.status,
            JobStatus::Skipped
        );
    }

    harness.drain(harness.pipeline.dispatcher()).await?;
    let austin = created
        .batches
        .iter()
        .find(|batch| batch.municipality.eq_ignore_ascii_case("Austin"))
        .unwrap();
    assert_eq!(harness.batch(austin.id).await?.status, BatchStatus::Completed);
    assert_eq!(
        harness.upload(created.upload.id).await?.status,
        UploadStatus::Failed
    );
    assert_eq!(completion_mails(&harness, "roster.csv"), 1);
    Ok(())
}

#[tokio::test]
async fn skipped_batch_lets_siblings_finish() -> anyhow::Result<()> {
    let harness = Harness::mock(test_config()).await?;
    let created = harness
        .pipeline
        .create_spreadsheet_upload(scenario_rows(), "clerk@example.gov", "roster.csv", false)
        .await?;
    let upload_id = created.upload.id;
    let (austin, springfield): (Vec<_>, Vec<_>) = created
        .batches
        .iter()
        .partition(|batch| batch.municipality.eq_ignore_ascii_case("Austin"));
    let (austin, springfield) = (austin[0], springfield[0]);

    let skipped = harness
        .pipeline
        .skip_batch(upload_id, austin.id, "wrong county")
        .await?;
    assert_eq!(skipped.status, BatchStatus::Failed);
    for job_id in [austin.analyze_job_id, austin.structure_job_id, austin.insert_job_id] {
        assert_eq!(harness.job(job_id.unwrap()).await?.status, JobStatus::Skipped);
    }

    harness.drain(harness.pipeline.dispatcher()).await?;
    assert_eq!(
        harness.batch(springfield.id).await?.status,
        BatchStatus::Completed
    );
    assert_eq!(harness.upload(upload_id).await?.status, UploadStatus::Failed);
    assert_eq!(Candidate::find().count(&harness.db).await?, 2);

    let again = harness
        .pipeline
        .skip_batch(upload_id, springfield.id, "too late")
        .await;
    assert!(matches!(again, Err(PipelineError::InvalidState(_))));
    Ok(())
}
