//! Named jobs and the periodic runner.
//!
//! Each job holds its own lock while it runs. A run that finds its lock taken
//! is skipped, never queued. Different jobs run concurrently and rely on the
//! store's conditional commits instead of a shared lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::address_pool::AddressPool;
use crate::batcher::WithdrawalBatcher;
use crate::broadcast::BroadcastTracker;
use crate::config::{CustodyConfig, JobsConfig};
use crate::consolidation::ConsolidationEngine;
use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::fee_rate::{FeeRateRefresher, FeeRateSource, HttpFeeRateSource};
use crate::notify::DepositNotifier;
use crate::scanner::ChainScanner;
use crate::settings::Settings;
use crate::store::Store;
use crate::token_scanner::TokenScanner;

/// Granularity at which sleeping job threads notice shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobName {
    AddressPool,
    Scan,
    TokenScan,
    Withdraw,
    SweepDeposits,
    SweepTokens,
    Broadcast,
    Confirm,
    NotifyDeposits,
    RefreshFeeRates,
}

impl JobName {
    pub const ALL: [JobName; 10] = [
        JobName::AddressPool,
        JobName::Scan,
        JobName::TokenScan,
        JobName::Withdraw,
        JobName::SweepDeposits,
        JobName::SweepTokens,
        JobName::Broadcast,
        JobName::Confirm,
        JobName::NotifyDeposits,
        JobName::RefreshFeeRates,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobName::AddressPool => "address_pool",
            JobName::Scan => "scan",
            JobName::TokenScan => "token_scan",
            JobName::Withdraw => "withdraw",
            JobName::SweepDeposits => "sweep_deposits",
            JobName::SweepTokens => "sweep_tokens",
            JobName::Broadcast => "broadcast",
            JobName::Confirm => "confirm",
            JobName::NotifyDeposits => "notify_deposits",
            JobName::RefreshFeeRates => "refresh_fee_rates",
        }
    }

    /// Configured period, `None` when the job is disabled.
    pub fn interval(self, jobs: &JobsConfig) -> Option<Duration> {
        let secs = match self {
            JobName::AddressPool => jobs.address_pool_secs,
            JobName::Scan => jobs.scan_secs,
            JobName::TokenScan => jobs.token_scan_secs,
            JobName::Withdraw => jobs.withdraw_secs,
            JobName::SweepDeposits => jobs.sweep_secs,
            JobName::SweepTokens => jobs.token_sweep_secs,
            JobName::Broadcast => jobs.broadcast_secs,
            JobName::Confirm => jobs.confirm_secs,
            JobName::NotifyDeposits => jobs.notify_secs,
            JobName::RefreshFeeRates => jobs.fee_rate_secs,
        };
        jobs.interval(secs)
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One non-blocking lock per job.
pub struct JobLocks {
    locks: HashMap<JobName, Mutex<()>>,
}

impl Default for JobLocks {
    fn default() -> Self {
        Self {
            locks: JobName::ALL.iter().map(|j| (*j, Mutex::new(()))).collect(),
        }
    }
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The job's guard, or `None` if a run is already in flight.
    pub fn try_acquire(&self, job: JobName) -> Option<MutexGuard<'_, ()>> {
        self.locks.get(&job).and_then(|lock| lock.try_lock())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRun {
    Completed,
    Skipped,
}

/// Owns every component and runs them by name.
pub struct Custodian {
    locks: JobLocks,
    address_pool: AddressPool,
    scanner: ChainScanner,
    token_scanner: TokenScanner,
    batcher: WithdrawalBatcher,
    consolidation: ConsolidationEngine,
    broadcast: BroadcastTracker,
    notifier: DepositNotifier,
    fee_rates: Option<FeeRateRefresher>,
}

impl Custodian {
    pub fn new(ctx: CustodyContext, fee_source: Option<Box<dyn FeeRateSource>>) -> Self {
        Self {
            locks: JobLocks::new(),
            address_pool: AddressPool::new(ctx.clone()),
            scanner: ChainScanner::new(ctx.clone()),
            token_scanner: TokenScanner::new(ctx.clone()),
            batcher: WithdrawalBatcher::new(ctx.clone()),
            consolidation: ConsolidationEngine::new(ctx.clone()),
            broadcast: BroadcastTracker::new(ctx.clone()),
            notifier: DepositNotifier::new(ctx.clone()),
            fee_rates: fee_source.map(|source| FeeRateRefresher::new(ctx, source)),
        }
    }

    /// Wire a node client, key cipher and fee source from `config`.
    pub fn from_config(
        config: &CustodyConfig,
        store: Arc<dyn Store>,
        settings: Arc<dyn Settings>,
    ) -> Result<Self, CustodyError> {
        let ctx = CustodyContext::from_config(config, store, settings)?;
        let fee_source = HttpFeeRateSource::new(&config.fee_source)?;
        Ok(Self::new(ctx, Some(Box::new(fee_source))))
    }

    pub fn locks(&self) -> &JobLocks {
        &self.locks
    }

    /// Run `job` once unless it is already running.
    pub fn run(&self, job: JobName) -> Result<JobRun, CustodyError> {
        let Some(_guard) = self.locks.try_acquire(job) else {
            debug!(job = %job, "job already running, skipped");
            return Ok(JobRun::Skipped);
        };

        let started = Instant::now();
        match self.dispatch(job) {
            Ok(summary) => {
                info!(
                    job = %job,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    %summary,
                    "job finished"
                );
                Ok(JobRun::Completed)
            }
            Err(e) => {
                error!(job = %job, error = %e, transient = e.is_transient(), "job failed");
                Err(e)
            }
        }
    }

    fn dispatch(&self, job: JobName) -> Result<String, CustodyError> {
        Ok(match job {
            JobName::AddressPool => {
                format!("generated={}", self.address_pool.ensure_free_addresses()?)
            }
            JobName::Scan => format!("{:?}", self.scanner.scan()?),
            JobName::TokenScan => format!("{:?}", self.token_scanner.scan()?),
            JobName::Withdraw => match self.batcher.run()? {
                Some(batch) => {
                    format!("txid={} withdrawals={}", batch.txid, batch.withdrawals.len())
                }
                None => "no batch".to_string(),
            },
            JobName::SweepDeposits => format!("{:?}", self.consolidation.sweep_deposits()?),
            JobName::SweepTokens => format!("{:?}", self.consolidation.sweep_tokens()?),
            JobName::Broadcast => format!("{:?}", self.broadcast.broadcast_pending()?),
            JobName::Confirm => format!("{:?}", self.broadcast.confirm_sent()?),
            JobName::NotifyDeposits => {
                format!("notifications={}", self.notifier.notify_deposits()?)
            }
            JobName::RefreshFeeRates => match &self.fee_rates {
                Some(refresher) => format!("{:?}", refresher.refresh_fee_rates()?),
                None => "no fee source".to_string(),
            },
        })
    }

    /// Start one thread per enabled job. Threads exit once `shutdown` is set.
    pub fn spawn(
        self: &Arc<Self>,
        schedule: &JobsConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>, CustodyError> {
        let mut handles = Vec::new();
        for job in JobName::ALL {
            let Some(period) = job.interval(schedule) else {
                debug!(job = %job, "job disabled");
                continue;
            };
            let custodian = Arc::clone(self);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("job-{job}"))
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        // Failures are logged by `run`; the next tick retries.
                        let _ = custodian.run(job);
                        sleep_until_next(period, &shutdown);
                    }
                })
                .map_err(|e| CustodyError::Config(format!("spawn {job}: {e}")))?;
            handles.push(handle);
        }
        info!(jobs = handles.len(), "job threads started");
        Ok(handles)
    }
}

fn sleep_until_next(period: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + period;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}
