//! Resource Monitor.
//!
//! Samples CPU and memory for a set of tracked process names on a fixed
//! cadence and broadcasts the results. Aggregation ("bot usage" = bridge +
//! runtime + interpreter) is the consumer's business; the monitor reports raw
//! per-name samples. A name absent from the process table produces a
//! zero-valued sample, which consumers read as "stopped".

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Sampling cadence. Matches the panel UI refresh rate.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// One sampling of one tracked process name. CPU is summed over every process
/// whose name matches (a runtime may fork workers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessResourceInfo {
    pub name: String,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// System-wide available memory, in megabytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AvailableMemory {
    pub available_mb: f64,
}

pub struct ResourceMonitor {
    tracked: Arc<Mutex<HashSet<String>>>,
    sample_tx: broadcast::Sender<ProcessResourceInfo>,
    memory_tx: broadcast::Sender<AvailableMemory>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let (sample_tx, _) = broadcast::channel(256);
        let (memory_tx, _) = broadcast::channel(64);
        Self {
            tracked: Arc::new(Mutex::new(HashSet::new())),
            sample_tx,
            memory_tx,
            cancel: Mutex::new(None),
        }
    }

    /// Add a process name to the sampling set.
    pub fn track(&self, name: &str) {
        if let Ok(mut set) = self.tracked.lock() {
            if set.insert(name.to_string()) {
                tracing::info!("Tracking resource usage for '{}'", name);
            }
        }
    }

    /// Remove a process name from the sampling set.
    pub fn untrack(&self, name: &str) {
        if let Ok(mut set) = self.tracked.lock() {
            set.remove(name);
        }
    }

    /// Subscribe to per-process samples.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessResourceInfo> {
        self.sample_tx.subscribe()
    }

    /// Subscribe to system-wide available-memory samples.
    pub fn subscribe_memory(&self) -> broadcast::Receiver<AvailableMemory> {
        self.memory_tx.subscribe()
    }

    /// Start the sampling loop. Calling while a loop is already running is a
    /// no-op. The loop idles (no samples emitted) while the tracked set is
    /// empty, but still publishes available memory.
    pub fn start_monitoring(&self) {
        let mut slot = match self.cancel.lock() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::error!("Resource monitor lock poisoned: {}", e);
                return;
            }
        };
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let tracked = self.tracked.clone();
        let sample_tx = self.sample_tx.clone();
        let memory_tx = self.memory_tx.clone();

        // sysinfo refreshes scan the OS process table synchronously, and CPU
        // percentages need deltas between two refreshes on the same System.
        // A dedicated blocking-pool thread owns the System for the loop's life.
        tokio::task::spawn_blocking(move || {
            let mut sys = System::new_all();
            tracing::info!("Resource monitor started");

            while !token.is_cancelled() {
                sys.refresh_processes();
                sys.refresh_memory();

                let names: Vec<String> = tracked
                    .lock()
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();

                for name in names {
                    let _ = sample_tx.send(sample_process(&sys, &name));
                }

                let _ = memory_tx.send(AvailableMemory {
                    available_mb: sys.available_memory() as f64 / 1_048_576.0,
                });

                std::thread::sleep(SAMPLE_INTERVAL);
            }
            tracing::info!("Resource monitor stopped");
        });
    }

    /// Stop the loop and forget every tracked name. The monitor can be
    /// restarted with `start_monitoring` afterwards.
    pub fn reset_state(&self) {
        if let Ok(mut slot) = self.cancel.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
        if let Ok(mut set) = self.tracked.lock() {
            set.clear();
        }
    }
}

/// Sum CPU/memory over every process whose name matches, case-insensitively.
/// No match yields the zero sample.
fn sample_process(sys: &System, name: &str) -> ProcessResourceInfo {
    let needle = name.to_lowercase();
    let mut cpu = 0.0_f32;
    let mut memory_bytes = 0_u64;

    for process in sys.processes().values() {
        if process.name().to_lowercase().contains(&needle) {
            cpu += process.cpu_usage();
            memory_bytes += process.memory();
        }
    }

    ProcessResourceInfo {
        name: name.to_string(),
        cpu_percent: cpu,
        memory_mb: memory_bytes as f64 / 1_048_576.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_process_yields_zero_sample() {
        let sys = System::new();
        let sample = sample_process(&sys, "no-such-process-xyz");
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_mb, 0.0);
        assert_eq!(sample.name, "no-such-process-xyz");
    }

    #[test]
    fn track_untrack_round_trip() {
        let monitor = ResourceMonitor::new();
        monitor.track("pmhq");
        monitor.track("pmhq"); // duplicate is fine
        monitor.untrack("pmhq");
        assert!(monitor.tracked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_allows_restart() {
        let monitor = ResourceMonitor::new();
        monitor.track("llbot");
        monitor.start_monitoring();
        monitor.reset_state();
        assert!(monitor.tracked.lock().unwrap().is_empty());
        // restart must not panic and must accept new subscriptions
        monitor.start_monitoring();
        let _rx = monitor.subscribe();
        monitor.reset_state();
    }

    #[tokio::test]
    async fn memory_stream_emits() {
        let monitor = ResourceMonitor::new();
        let mut rx = monitor.subscribe_memory();
        monitor.start_monitoring();

        let sample = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("memory sample within two intervals")
            .expect("channel open");
        assert!(sample.available_mb >= 0.0);
        monitor.reset_state();
    }
}
