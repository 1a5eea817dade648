// =============================================================================
// Scheduler — run-guards, job registry and periodic triggers
// =============================================================================
//
// The candle cursor is derived from the store, so two writers on the same
// series would race.  Every job therefore runs under a per-job-type guard
// that is tried, never waited on: if a run is already in flight the new
// trigger is skipped.  Backfill and refresh write the same series and share
// the `candles` guard.
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::market_data::{CandleSyncEngine, InstrumentSynchronizer};

// =============================================================================
// Job names
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    Instruments,
    Backfill,
    Refresh,
}

impl JobName {
    pub const ALL: [JobName; 3] = [JobName::Instruments, JobName::Backfill, JobName::Refresh];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instruments => "instruments",
            Self::Backfill => "backfill",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instruments" => Ok(Self::Instruments),
            "backfill" => Ok(Self::Backfill),
            "refresh" => Ok(Self::Refresh),
            other => Err(format!("unknown job: {other}")),
        }
    }
}

// =============================================================================
// Job registry
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatus {
    pub running: bool,
    pub runs: u64,
    pub skipped: u64,
    pub last_run_id: Option<Uuid>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_ok: Option<bool>,
    pub last_outcome: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(String),
    Failed(String),
    Skipped,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobName, JobStatus>>,
}

impl JobRegistry {
    pub fn snapshot(&self) -> Vec<(JobName, JobStatus)> {
        let jobs = self.jobs.read();
        JobName::ALL
            .iter()
            .map(|name| (*name, jobs.get(name).cloned().unwrap_or_default()))
            .collect()
    }

    pub fn get(&self, job: JobName) -> JobStatus {
        self.jobs.read().get(&job).cloned().unwrap_or_default()
    }

    fn started(&self, job: JobName, run_id: Uuid) {
        let mut jobs = self.jobs.write();
        let status = jobs.entry(job).or_default();
        status.running = true;
        status.runs += 1;
        status.last_run_id = Some(run_id);
        status.last_started = Some(Utc::now());
    }

    fn finished(&self, job: JobName, outcome: &RunOutcome) {
        let mut jobs = self.jobs.write();
        let status = jobs.entry(job).or_default();
        status.running = false;
        status.last_finished = Some(Utc::now());
        match outcome {
            RunOutcome::Completed(summary) => {
                status.last_ok = Some(true);
                status.last_outcome = Some(summary.clone());
            }
            RunOutcome::Failed(reason) => {
                status.last_ok = Some(false);
                status.last_outcome = Some(reason.clone());
            }
            RunOutcome::Skipped => {}
        }
    }

    fn skipped(&self, job: JobName) {
        self.jobs.write().entry(job).or_default().skipped += 1;
    }
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct Scheduler {
    instruments: Arc<InstrumentSynchronizer>,
    candles: Arc<CandleSyncEngine>,
    registry: Arc<JobRegistry>,
    instruments_guard: Arc<Mutex<()>>,
    candles_guard: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(instruments: Arc<InstrumentSynchronizer>, candles: Arc<CandleSyncEngine>) -> Self {
        Self {
            instruments,
            candles,
            registry: Arc::new(JobRegistry::default()),
            instruments_guard: Arc::new(Mutex::new(())),
            candles_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    fn try_guard(&self, job: JobName) -> Option<OwnedMutexGuard<()>> {
        let lock = match job {
            JobName::Instruments => &self.instruments_guard,
            JobName::Backfill | JobName::Refresh => &self.candles_guard,
        };
        match lock.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                self.registry.skipped(job);
                info!(job = %job, "previous run still in flight; skipping");
                None
            }
        }
    }

    /// Run `job` to completion on the current task, or skip it if its guard
    /// is held.
    pub async fn run_job(&self, job: JobName) -> RunOutcome {
        match self.try_guard(job) {
            Some(guard) => self.execute(job, Uuid::new_v4(), guard).await,
            None => RunOutcome::Skipped,
        }
    }

    /// Start `job` on a background task.  Returns the run id, or `None` if a
    /// run holding the same guard is in flight.
    pub fn try_spawn(self: &Arc<Self>, job: JobName) -> Option<Uuid> {
        let guard = self.try_guard(job)?;
        let run_id = Uuid::new_v4();
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(job, run_id, guard).await;
        });
        Some(run_id)
    }

    async fn execute(&self, job: JobName, run_id: Uuid, guard: OwnedMutexGuard<()>) -> RunOutcome {
        let span = info_span!("job", job = %job, run_id = %run_id);
        async move {
            self.registry.started(job, run_id);
            info!("job started");

            let outcome = match job {
                JobName::Instruments => match self.instruments.synchronize_instruments().await {
                    Ok(count) => RunOutcome::Completed(format!("{count} instruments")),
                    Err(e) => RunOutcome::Failed(e.to_string()),
                },
                JobName::Backfill => {
                    let report = self.candles.run_historical_backfill().await;
                    report_outcome(report.is_clean(), report.to_string())
                }
                JobName::Refresh => {
                    let report = self.candles.run_incremental_refresh().await;
                    report_outcome(report.is_clean(), report.to_string())
                }
            };

            self.registry.finished(job, &outcome);
            match &outcome {
                RunOutcome::Failed(reason) => warn!(reason = %reason, "job failed"),
                _ => info!(outcome = ?outcome, "job finished"),
            }
            drop(guard);
            outcome
        }
        .instrument(span)
        .await
    }

    /// Trigger `job` every `every` until `cancel` fires.  With
    /// `run_immediately` the first run happens at once, otherwise after one
    /// period.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        job: JobName,
        every: Duration,
        run_immediately: bool,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let start = if run_immediately {
                tokio::time::Instant::now()
            } else {
                tokio::time::Instant::now() + every
            };
            let mut interval = tokio::time::interval_at(start, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(job = %job, every_secs = every.as_secs(), "periodic trigger armed");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        this.run_job(job).await;
                    }
                }
            }
            info!(job = %job, "periodic trigger stopped");
        })
    }
}

fn report_outcome(clean: bool, summary: String) -> RunOutcome {
    if clean {
        RunOutcome::Completed(summary)
    } else {
        RunOutcome::Failed(summary)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SyncError, SyncResult};
    use crate::market_data::candle_sync::{CandleSource, CandleSyncSettings, PageRequest};
    use crate::market_data::instrument_sync::InstrumentSource;
    use crate::store::MemoryStore;
    use crate::types::{Candle, Instrument};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSource {
        instrument_calls: AtomicUsize,
        candle_calls: AtomicUsize,
        fail_instruments: bool,
    }

    #[async_trait]
    impl InstrumentSource for CountingSource {
        async fn instruments(&self) -> SyncResult<Vec<Instrument>> {
            self.instrument_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_instruments {
                return Err(SyncError::Status {
                    status: 401,
                    body: "Invalid Sign".into(),
                });
            }
            Ok(vec![Instrument {
                code: "BTC".into(),
                chain: "BTC-Bitcoin".into(),
                can_deposit: true,
                can_withdraw: true,
            }])
        }
    }

    #[async_trait]
    impl CandleSource for CountingSource {
        async fn candles(&self, _req: &PageRequest) -> SyncResult<Vec<Candle>> {
            self.candle_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn scheduler(source: Arc<CountingSource>) -> Arc<Scheduler> {
        let store = Arc::new(MemoryStore::new());
        let instruments = Arc::new(InstrumentSynchronizer::new(source.clone(), store.clone()));
        let candles = Arc::new(CandleSyncEngine::new(
            source,
            store.clone(),
            store,
            CandleSyncSettings {
                pairs: vec!["BTC-USDT".into()],
                bar: "1D".into(),
                page_limit: 100,
                epoch_floor_ms: crate::config::DEFAULT_EPOCH_FLOOR_MS,
            },
        ));
        Arc::new(Scheduler::new(instruments, candles))
    }

    #[test]
    fn job_names_parse() {
        assert_eq!("backfill".parse::<JobName>().unwrap(), JobName::Backfill);
        assert_eq!(JobName::Refresh.to_string(), "refresh");
        assert!("vacuum".parse::<JobName>().is_err());
    }

    #[tokio::test]
    async fn completed_runs_are_recorded() {
        let source = Arc::new(CountingSource::default());
        let sched = scheduler(source.clone());

        let outcome = sched.run_job(JobName::Instruments).await;
        assert_eq!(outcome, RunOutcome::Completed("1 instruments".into()));

        let status = sched.registry().get(JobName::Instruments);
        assert_eq!(status.runs, 1);
        assert_eq!(status.last_ok, Some(true));
        assert!(!status.running);
        assert!(status.last_run_id.is_some());
    }

    #[tokio::test]
    async fn failures_are_recorded_not_raised() {
        let source = Arc::new(CountingSource {
            fail_instruments: true,
            ..Default::default()
        });
        let sched = scheduler(source);

        match sched.run_job(JobName::Instruments).await {
            RunOutcome::Failed(reason) => assert!(reason.contains("401")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(sched.registry().get(JobName::Instruments).last_ok, Some(false));
    }

    #[tokio::test]
    async fn held_candle_guard_skips_backfill_and_refresh() {
        let source = Arc::new(CountingSource::default());
        let sched = scheduler(source.clone());

        let held = sched.candles_guard.clone().try_lock_owned().unwrap();
        assert_eq!(sched.run_job(JobName::Refresh).await, RunOutcome::Skipped);
        assert_eq!(sched.run_job(JobName::Backfill).await, RunOutcome::Skipped);
        assert!(sched.try_spawn(JobName::Backfill).is_none());
        assert_eq!(source.candle_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sched.registry().get(JobName::Backfill).skipped, 2);

        // Other job types are unaffected.
        assert!(matches!(
            sched.run_job(JobName::Instruments).await,
            RunOutcome::Completed(_)
        ));

        drop(held);
        assert!(matches!(
            sched.run_job(JobName::Refresh).await,
            RunOutcome::Completed(_)
        ));
        assert_eq!(source.candle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn periodic_trigger_runs_and_stops_on_cancel() {
        let source = Arc::new(CountingSource::default());
        let sched = scheduler(source.clone());
        let cancel = CancellationToken::new();

        let handle = sched.spawn_periodic(
            JobName::Instruments,
            Duration::from_millis(20),
            true,
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(110)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let calls = source.instrument_calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "expected repeated runs, got {calls}");
        let after_cancel = calls;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.instrument_calls.load(Ordering::SeqCst), after_cancel);
    }
}
