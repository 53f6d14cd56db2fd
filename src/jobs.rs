use crate::device::AuthorizationStateMachine;
use crate::entities;
use crate::errors::FulcrumError;
use crate::storage;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, Set};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Background jobs and their cron schedules (sec min hour day month weekday).
pub const JOBS: &[(&str, &str)] = &[
    ("reclaim_device_authorizations", "0 */5 * * * *"),
    ("cleanup_user_code_attempts", "0 */10 * * * *"),
    ("cleanup_expired_access_tokens", "0 15 * * * *"),
    ("cleanup_expired_refresh_tokens", "0 30 * * * *"),
];

/// What the jobs operate on.
#[derive(Clone)]
pub struct JobContext {
    pub db: DatabaseConnection,
    pub machine: Arc<AuthorizationStateMachine>,
}

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(ctx: JobContext) -> Result<JobScheduler, FulcrumError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| FulcrumError::Other(format!("Failed to create job scheduler: {}", e)))?;

    for (name, schedule) in JOBS {
        let ctx = ctx.clone();
        let job = Job::new_async(*schedule, move |_uuid, _l| {
            let ctx = ctx.clone();
            Box::pin(async move {
                info!(job = name, "Running scheduled job");
                // failures are recorded in job_executions
                let _ = run_recorded(&ctx, name).await;
            })
        })
        .map_err(|e| FulcrumError::Other(format!("Failed to create job {}: {}", name, e)))?;

        sched
            .add(job)
            .await
            .map_err(|e| FulcrumError::Other(format!("Failed to add job {}: {}", name, e)))?;
    }

    sched
        .start()
        .await
        .map_err(|e| FulcrumError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", JOBS.len());

    Ok(sched)
}

async fn run_job(ctx: &JobContext, job_name: &str) -> Result<u64, FulcrumError> {
    match job_name {
        "reclaim_device_authorizations" => ctx.machine.reclaim().await,
        "cleanup_user_code_attempts" => {
            let now = ctx.machine.now();
            ctx.machine.guard().purge_stale(now).await
        }
        "cleanup_expired_access_tokens" => storage::cleanup_expired_access_tokens(&ctx.db).await,
        "cleanup_expired_refresh_tokens" => storage::cleanup_expired_refresh_tokens(&ctx.db).await,
        _ => Err(FulcrumError::Other(format!("Unknown job name: {}", job_name))),
    }
}

/// Run one job and record the outcome. Returns the number of records processed.
async fn run_recorded(ctx: &JobContext, job_name: &str) -> Result<u64, FulcrumError> {
    let execution_id = start_job_execution(&ctx.db, job_name).await?;

    match run_job(ctx, job_name).await {
        Ok(count) => {
            info!(job = job_name, count, "Job completed");
            complete_job_execution(&ctx.db, execution_id, true, None, Some(count as i64)).await?;
            Ok(count)
        }
        Err(e) => {
            error!(job = job_name, error = %e, "Job failed");
            complete_job_execution(&ctx.db, execution_id, false, Some(e.to_string()), None)
                .await?;
            Err(e)
        }
    }
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, FulcrumError> {
    let execution = entities::job_execution::ActiveModel {
        job_name: Set(job_name.to_string()),
        started_at: Set(Utc::now().timestamp()),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
        ..Default::default()
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), FulcrumError> {
    if let Some(execution) = entities::JobExecution::find_by_id(execution_id)
        .one(db)
        .await?
    {
        let mut active = execution.into_active_model();
        active.completed_at = Set(Some(Utc::now().timestamp()));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Run a job by name right now (the `run-job` subcommand).
pub async fn trigger_job_manually(ctx: &JobContext, job_name: &str) -> Result<u64, FulcrumError> {
    if !JOBS.iter().any(|(name, _)| *name == job_name) {
        return Err(FulcrumError::Other(format!("Unknown job name: {}", job_name)));
    }
    info!("Manually triggering job: {}", job_name);
    run_recorded(ctx, job_name).await
}
