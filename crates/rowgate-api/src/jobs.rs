//! The scheduled job runner: cron-triggered exec or script jobs reusing
//! the datasource and script machinery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Map;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use rowgate_config::{parse_cron_schedule, Job, JobKind};

use crate::error::{ServerError, ServerResult};
use crate::server::Engine;

/// Parse every job's schedule and spawn one scheduler task per job.
///
/// # Errors
///
/// Returns an error if a schedule fails to parse (the validator accepts
/// the same grammar, so this only fires for configs that skipped
/// validation).
pub(crate) fn spawn_jobs(engine: &Arc<Engine>) -> ServerResult<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(engine.config.jobs.len());
    for (idx, job) in engine.config.jobs.iter().enumerate() {
        let schedule = parse_cron_schedule(&job.schedule).map_err(|err| {
            error!(job = %job.name, error = %err, "failed to schedule job");
            ServerError::Schedule {
                job: job.name.clone(),
                detail: err.to_string(),
            }
        })?;
        let engine = Arc::clone(engine);
        handles.push(tokio::spawn(job_loop(engine, idx, schedule)));
    }
    Ok(handles)
}

async fn job_loop(engine: Arc<Engine>, idx: usize, schedule: cron::Schedule) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            break;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = tokio::time::sleep(delay) => {
                // Fires run detached; overlapping runs of the same job
                // are allowed.
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let engine = &engine;
                    let job = &engine.config.jobs[idx];
                    run_job(engine, job).await;
                });
            }
            () = engine.cancel.cancelled() => break,
        }
    }
}

pub(crate) async fn run_job<'a>(engine: &'a Engine, job: &'a Job) {
    let started = Instant::now();
    if job.debug {
        debug!(job = %job.name, "job starting");
    }

    match job.kind() {
        Some(JobKind::Exec) => {
            let timeout = job
                .timeout
                .filter(|t| *t > 0.0)
                .map(Duration::from_secs_f64);
            if let Err(err) = engine
                .datasources
                .execute(&job.datasource, job.tx_options.as_ref(), timeout, &job.script, &[])
                .await
            {
                error!(job = %job.name, error = %err, "exec failed");
                return;
            }
        }
        Some(JobKind::Script) => {
            let outcome = engine.script.run(&job.script, Map::new(), job.debug).await;
            if let Some(err) = outcome.error {
                error!(job = %job.name, error = %err, "script execution failed");
                return;
            }
        }
        None => {
            error!(job = %job.name, kind = %job.job_type, "job has an invalid type");
            return;
        }
    }

    if job.debug {
        debug!(job = %job.name, elapsed = started.elapsed().as_secs_f64() * 1e3, "job completed successfully");
    }
}
