//! Periodic reaper and vector flush loops.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

use crate::engine::EngineInner;

/// Periods of the background loops.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopTiming {
    pub(crate) reaper_interval: Duration,
    pub(crate) flush_interval: Duration,
    pub(crate) durable_sweep_every: NonZeroU32,
}

/// Summary of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Entries removed from the hot tier because their lifetime ended.
    pub expired: usize,
    /// Projected entries retracted from consumers.
    pub retracted: usize,
    /// Expired records deleted from the warm and cold tiers.
    pub swept: usize,
}

/// Runs one reaper pass, sweeping the durable tiers when `sweep` is set.
pub(crate) async fn reap_once(inner: &EngineInner, now: SystemTime, sweep: bool) -> ReapReport {
    let expired = inner.cache.reap(now).await.len();
    let retracted = inner.views.retract_expired(now).await;
    let swept = if sweep {
        inner.cache.sweep_durable(now).await
    } else {
        0
    };
    if expired + retracted + swept > 0 {
        debug!(expired, retracted, swept, "reaper pass finished");
    }
    ReapReport {
        expired,
        retracted,
        swept,
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Waits for the next tick. Returns `false` once shutdown was signalled.
async fn next_tick(interval: &mut tokio::time::Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = interval.tick() => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

pub(crate) async fn run_reaper_loop(
    inner: Arc<EngineInner>,
    timing: LoopTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(timing.reaper_interval);
    let mut ticks: u32 = 0;
    while next_tick(&mut interval, &mut shutdown).await {
        ticks = ticks.wrapping_add(1);
        let sweep = ticks % timing.durable_sweep_every.get() == 0;
        reap_once(&inner, SystemTime::now(), sweep).await;
    }
    debug!("reaper loop stopped");
}

pub(crate) async fn run_flush_loop(
    inner: Arc<EngineInner>,
    timing: LoopTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(timing.flush_interval);
    while next_tick(&mut interval, &mut shutdown).await {
        let report = inner.queue.flush_pending().await;
        if report.batches > 0 {
            debug!(
                batches = report.batches,
                delivered = report.delivered,
                requeued = report.requeued,
                "periodic vector flush"
            );
        }
    }
    debug!("flush loop stopped");
}
