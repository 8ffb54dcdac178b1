use crate::jobs::{self, JobKind, SchedulerState};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct OpsScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<SchedulerState>,
}

impl OpsScheduler {
    pub async fn new(state: Arc<SchedulerState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule_job(&self, kind: JobKind, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                if state.shutdown.is_cancelled() {
                    tracing::info!(job = %kind, "Shutting down, scheduled run not started");
                    return;
                }

                let _running = match state.try_begin(kind) {
                    Ok(running) => running,
                    Err(busy) => {
                        tracing::warn!(job = %kind, running = %busy, "Skipping scheduled run: another job is still in progress");
                        return;
                    }
                };

                tracing::info!(job = %kind, "Starting scheduled run");
                match kind {
                    JobKind::Backup => jobs::run_backup(&state).await,
                    JobKind::Drill => jobs::run_drills(&state).await,
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(job = %kind, cron = %cron_expression, "Job scheduled");
        Ok(())
    }

    /// Register every job that has a schedule configured.
    pub async fn init_schedules(&self) -> anyhow::Result<usize> {
        let schedule = self.state.config.schedule.clone();
        let mut count = 0;
        for (kind, cron) in [(JobKind::Backup, schedule.backup), (JobKind::Drill, schedule.drill)] {
            let Some(cron) = cron.filter(|c| !c.trim().is_empty()) else {
                continue;
            };
            self.schedule_job(kind, &cron).await?;
            count += 1;
        }

        tracing::info!(count, "Cron schedules initialized");
        Ok(count)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
