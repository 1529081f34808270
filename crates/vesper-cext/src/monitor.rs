//! Background memory monitor.
//!
//! Managed values pinned by native references are invisible to the host
//! collector's own heuristics, so the bridge watches its native allocation
//! pressure itself: stub and type struct allocations feed an atomic byte
//! counter, and a background task asks the embedder for a collection when
//! that counter grows past the configured threshold.
//!
//! The task only reads atomics and sends requests; it never touches the
//! registry. The embedder drives the actual collection and then drains the
//! bridge at its next safe point.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use vesper_config::MonitorConfig;

use crate::bridge::BridgeStats;

/// Shared runtime for bridge background tasks.
///
/// One worker thread is plenty; the only tenant is the monitor's timer
/// loop.
fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("vesper-monitor")
            .enable_all()
            .build()
            .expect("Failed to initialize tokio runtime")
    })
}

/// One collection request sent to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectRequest {
    /// Native bytes live when the request fired.
    pub native_bytes: u64,
    /// The baseline those bytes were measured against.
    pub baseline: u64,
}

/// Stops the monitor task when dropped or stopped explicitly.
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Option<oneshot::Sender<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Starts the monitor task. Requests arrive on the returned channel; a
/// receiver that falls behind loses requests rather than blocking the
/// task.
pub fn spawn(
    config: MonitorConfig,
    stats: Arc<BridgeStats>,
) -> (MonitorHandle, mpsc::Receiver<CollectRequest>) {
    let (tx, rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel();
    runtime().spawn(run(config, stats, tx, stop_rx));
    (MonitorHandle { stop: Some(stop_tx) }, rx)
}

async fn run(
    config: MonitorConfig,
    stats: Arc<BridgeStats>,
    requests: mpsc::Sender<CollectRequest>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut baseline = config.floor_bytes;

    loop {
        tokio::select! {
            _ = &mut stop => return,
            _ = ticker.tick() => {
                let Some(request) = evaluate(&config, &stats, &mut baseline) else {
                    continue;
                };
                log::debug!(
                    "requesting collection: {} native bytes over baseline {}",
                    request.native_bytes,
                    request.baseline
                );
                if requests.try_send(request).is_err() {
                    log::warn!("collection request dropped: receiver not keeping up");
                }
            }
        }
    }
}

/// Applies the growth predicate against the current counters. Advances the
/// baseline when a request fires.
fn evaluate(
    config: &MonitorConfig,
    stats: &BridgeStats,
    baseline: &mut u64,
) -> Option<CollectRequest> {
    let bytes = stats.native_bytes.load(Ordering::Relaxed);
    if bytes < config.floor_bytes {
        // Falling back under the floor resets the baseline too.
        *baseline = config.floor_bytes;
        return None;
    }
    let threshold = (*baseline as f64) * (1.0 + config.growth_threshold);
    if (bytes as f64) < threshold {
        return None;
    }
    // Without a new collectable entry since the last drain, a collection
    // cannot reclaim anything; skip and keep the baseline.
    if !stats.weak_created.swap(false, Ordering::AcqRel) {
        return None;
    }
    let request = CollectRequest {
        native_bytes: bytes,
        baseline: *baseline,
    };
    *baseline = bytes;
    Some(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MonitorConfig {
        MonitorConfig {
            enabled: true,
            poll_interval_ms: 10,
            floor_bytes: 1000,
            growth_threshold: 0.3,
        }
    }

    fn stats_with(bytes: u64, collectable: bool) -> BridgeStats {
        let stats = BridgeStats::new();
        stats.native_bytes.store(bytes, Ordering::Relaxed);
        stats.weak_created.store(collectable, Ordering::Relaxed);
        stats
    }

    #[test]
    fn test_below_floor_never_fires() {
        let config = config();
        let stats = stats_with(999, true);
        let mut baseline = 5000;
        assert_eq!(evaluate(&config, &stats, &mut baseline), None);
        // Dropping under the floor resets an inflated baseline.
        assert_eq!(baseline, config.floor_bytes);
    }

    #[test]
    fn test_growth_over_baseline_fires_and_advances() {
        let config = config();
        let stats = stats_with(1400, true);
        let mut baseline = 1000;
        let request = evaluate(&config, &stats, &mut baseline).unwrap();
        assert_eq!(
            request,
            CollectRequest {
                native_bytes: 1400,
                baseline: 1000
            }
        );
        assert_eq!(baseline, 1400);
        // Same pressure again: growth is now measured from 1400.
        stats.weak_created.store(true, Ordering::Relaxed);
        assert_eq!(evaluate(&config, &stats, &mut baseline), None);
    }

    #[test]
    fn test_no_new_collectables_suppresses_request() {
        let config = config();
        let stats = stats_with(5000, false);
        let mut baseline = 1000;
        assert_eq!(evaluate(&config, &stats, &mut baseline), None);
        assert_eq!(baseline, 1000);
    }

    #[tokio::test]
    async fn test_task_sends_requests_and_stops() {
        let stats = Arc::new(stats_with(5000, true));
        let (handle, mut rx) = spawn(config(), stats.clone());
        let request = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("monitor did not fire")
            .expect("channel closed early");
        assert_eq!(request.native_bytes, 5000);
        handle.stop();
    }
}
