//! Periodic self-sampling of process resources

use crate::metrics::{names, HealthSnapshot, MetricUnit, ResourceKind, ResourceMetricsCollector};
use std::sync::{Arc, Weak};
use sysinfo::System;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Stop handle for a running sampler
pub(crate) struct SamplerHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ResourceMetricsCollector {
    /// Start the self-sampling timer; a second call while running is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            return;
        }

        let period = self.config.sample_interval;
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(Arc::downgrade(self), period, stop_rx));
        *sampler = Some(SamplerHandle { stop_tx, task });

        info!("Resource self-sampling started every {:?}", period);
    }

    /// Whether the self-sampling timer is running
    pub fn is_sampling(&self) -> bool {
        self.sampler.lock().is_some()
    }

    /// Stop the self-sampling timer; safe when it was never started
    pub async fn shutdown(&self) {
        let handle = self.sampler.lock().take();
        let Some(handle) = handle else {
            return;
        };

        let _ = handle.stop_tx.send(());
        if let Err(e) = handle.task.await {
            warn!("Resource sampler ended abnormally: {}", e);
        }
        info!("Resource self-sampling stopped");
    }

    /// Take one sample of process and system memory
    pub async fn sample_self(&self, system: &mut System) {
        system.refresh_memory();
        let total = system.total_memory();
        let saturation = if total > 0 {
            system.used_memory() as f64 / total as f64
        } else {
            0.0
        };

        if let Ok(pid) = sysinfo::get_current_pid() {
            if system.refresh_process(pid) {
                if let Some(process) = system.process(pid) {
                    self.record_metric(
                        names::PROCESS_MEMORY,
                        process.memory() as f64 / BYTES_PER_MB,
                        MetricUnit::Megabytes,
                        None,
                    );
                }
            }
        }

        self.record_utilization(ResourceKind::Memory, saturation);
        let snapshot = HealthSnapshot::new(1.0, self.error_rate(), saturation);
        self.record_health(snapshot).await;
        debug!("Self-sample recorded, memory saturation {:.3}", saturation);
    }
}

async fn run(
    collector: Weak<ResourceMetricsCollector>,
    period: std::time::Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut system = System::new();

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {
                let Some(collector) = collector.upgrade() else {
                    break;
                };
                collector.sample_self(&mut system).await;
            }
        }
    }
}
