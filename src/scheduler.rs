//! Reconciliation scheduler.
//!
//! Four jobs ({minor, major} × {note, field}), each an explicit timer loop:
//! compute the next cron fire, sleep until it, then spawn the sweep as its
//! own task so a slow sweep never delays the next computation. A tick that
//! arrives while the same job's previous sweep is still running is skipped.
//!
//! A sweep pages candidate ids out of the note store by `(modified_at, id)`
//! in fixed-size batches, resuming each page after the last key seen. A
//! batch that fails to reconcile is logged with the window bounds and
//! batch offset and the sweep moves on. Shutdown is checked between
//! batches, never inside one.
//!
//! A major sweep then audits the hash ledger for the same index, which
//! catches records whose note left the store without ever entering a
//! window again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use notesync_core::cron::CronSchedule;
use notesync_core::{Cadence, IndexKind, OperationContext, SyncWindow, WindowPolicy};

use crate::config::Config;
use notesync_core::store::ModifiedKey;

use crate::sync::{IndexSyncService, LedgerAuditReport, ReconcileReport};

#[derive(Debug, Clone)]
pub struct SweepJob {
    pub cadence: Cadence,
    pub index: IndexKind,
    pub schedule: CronSchedule,
    pub batch_size: usize,
}

impl SweepJob {
    /// The enabled jobs from `sink.*` config.
    pub fn from_config(config: &Config) -> Result<Vec<SweepJob>> {
        let mut jobs = Vec::new();
        for index in IndexKind::ALL {
            for cadence in [Cadence::Minor, Cadence::Major] {
                let job = config.sink.job(index, cadence);
                if !job.enabled {
                    continue;
                }
                jobs.push(SweepJob {
                    cadence,
                    index,
                    schedule: CronSchedule::parse(&job.cron)
                        .with_context(|| format!("sink.{}-index.{}.cron", index, cadence))?,
                    batch_size: job.batch_size,
                });
            }
        }
        Ok(jobs)
    }

    pub fn name(&self) -> String {
        format!("{}-index/{}", self.index, self.cadence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub window: SyncWindow,
    pub batches: usize,
    pub failed_batches: usize,
    /// True when shutdown stopped the sweep before the window was exhausted.
    pub interrupted: bool,
    pub totals: ReconcileReport,
    /// Ledger audit totals; empty for minor sweeps.
    pub audit: LedgerAuditReport,
}

/// Runs one sweep over one window.
pub struct Sweeper {
    sync: Arc<IndexSyncService>,
    policy: WindowPolicy,
}

impl Sweeper {
    pub fn new(sync: Arc<IndexSyncService>, policy: WindowPolicy) -> Self {
        Self { sync, policy }
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    /// Sweep the `cadence` window anchored at `now` for one index.
    ///
    /// Only a failure to list candidates ends the sweep with an error,
    /// since the remaining page count is then unknown.
    pub async fn sweep(
        &self,
        cadence: Cadence,
        index: IndexKind,
        now: DateTime<Utc>,
        batch_size: usize,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<SweepReport> {
        let window = SyncWindow::for_cadence(cadence, now, &self.policy);
        let ctx = OperationContext::sweep(cadence, index);
        let batch_size = batch_size.max(1);
        let mut report = SweepReport {
            window,
            batches: 0,
            failed_batches: 0,
            interrupted: false,
            totals: ReconcileReport::default(),
            audit: LedgerAuditReport::default(),
        };

        info!(op_id = %ctx.id, origin = %ctx.origin, %window, batch_size, "sweep started");

        let mut offset = 0usize;
        let mut after: Option<ModifiedKey> = None;
        loop {
            if is_shutdown(shutdown) {
                report.interrupted = true;
                warn!(op_id = %ctx.id, %window, offset, "sweep interrupted by shutdown");
                break;
            }

            let keys = self
                .sync
                .notes()
                .list_modified(&window, after.as_ref(), batch_size)
                .await
                .with_context(|| format!("Failed to list candidates in {} at offset {}", window, offset))?;
            let Some(last) = keys.last().cloned() else {
                break;
            };
            let fetched = keys.len();
            let ids: Vec<String> = keys.into_iter().map(|k| k.id).collect();

            match self.sync.reconcile(&ctx, index, &ids, &window).await {
                Ok(r) => report.totals.merge(&r),
                Err(e) => {
                    report.failed_batches += 1;
                    error!(
                        op_id = %ctx.id,
                        %index,
                        window_start = ?window.start,
                        window_end = %window.end,
                        batch_offset = offset,
                        batch_len = fetched,
                        error = %format!("{:#}", e),
                        "sweep batch failed"
                    );
                }
            }
            report.batches += 1;
            offset += fetched;
            after = Some(last);

            if fetched < batch_size {
                break;
            }
        }

        if cadence == Cadence::Major && !report.interrupted {
            self.audit(&ctx, index, window.end, batch_size, shutdown, &mut report)
                .await?;
        }

        info!(
            op_id = %ctx.id,
            origin = %ctx.origin,
            %window,
            batches = report.batches,
            failed_batches = report.failed_batches,
            written = report.totals.written,
            removed = report.totals.removed + report.audit.removed,
            unchanged = report.totals.unchanged,
            orphaned = report.audit.orphaned,
            "sweep finished"
        );
        Ok(report)
    }

    /// Page through the ledger of `index` and audit each page.
    async fn audit(
        &self,
        ctx: &OperationContext,
        index: IndexKind,
        prune_before: DateTime<Utc>,
        batch_size: usize,
        shutdown: Option<&watch::Receiver<bool>>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let mut after: Option<String> = None;
        loop {
            if is_shutdown(shutdown) {
                report.interrupted = true;
                warn!(op_id = %ctx.id, %index, "ledger audit interrupted by shutdown");
                break;
            }

            let entries = self
                .sync
                .ledger()
                .list_after(index, after.as_deref(), batch_size)
                .await
                .with_context(|| format!("Failed to list {} ledger entries", index))?;
            let Some(last) = entries.last().map(|e| e.document_id.clone()) else {
                break;
            };
            let fetched = entries.len();

            match self.sync.audit_ledger(ctx, index, &entries, prune_before).await {
                Ok(r) => report.audit.merge(&r),
                Err(e) => {
                    report.failed_batches += 1;
                    error!(
                        op_id = %ctx.id,
                        %index,
                        after = ?after,
                        batch_len = fetched,
                        error = %format!("{:#}", e),
                        "ledger audit batch failed"
                    );
                }
            }
            after = Some(last);

            if fetched < batch_size {
                break;
            }
        }
        Ok(())
    }
}

fn is_shutdown(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

/// Clears a job's in-flight flag when the sweep task ends, panics included.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    sweeper: Arc<Sweeper>,
    jobs: Vec<SweepJob>,
    zone: FixedOffset,
}

impl Scheduler {
    /// `zone` is the offset cron expressions are evaluated in.
    pub fn new(sweeper: Arc<Sweeper>, jobs: Vec<SweepJob>, zone: FixedOffset) -> Self {
        Self {
            sweeper,
            jobs,
            zone,
        }
    }

    /// Start one timer loop per job.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|job| {
                tokio::spawn(job_loop(
                    self.sweeper.clone(),
                    job,
                    self.zone,
                    shutdown.clone(),
                ))
            })
            .collect()
    }
}

async fn job_loop(
    sweeper: Arc<Sweeper>,
    job: SweepJob,
    zone: FixedOffset,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = job.name();
    let running = Arc::new(AtomicBool::new(false));
    info!(job = %name, cron = %job.schedule.raw(), "sweep job scheduled");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Utc::now().with_timezone(&zone);
        let next = match job.schedule.next_after(&now) {
            Ok(t) => t,
            Err(e) => {
                error!(job = %name, error = %e, "no upcoming fire time; job stopped");
                break;
            }
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        if running.swap(true, Ordering::SeqCst) {
            warn!(job = %name, fire = %next, "previous sweep still running; tick skipped");
            continue;
        }

        let guard = InFlight(running.clone());
        let sweeper = sweeper.clone();
        let job = job.clone();
        let rx = shutdown.clone();
        let fire = next.with_timezone(&Utc);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = sweeper
                .sweep(job.cadence, job.index, fire, job.batch_size, Some(&rx))
                .await
            {
                error!(job = %job.name(), error = %format!("{:#}", e), "sweep aborted");
            }
        });
    }
    info!(job = %name, "sweep job stopped");
}
