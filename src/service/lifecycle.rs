// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service lifecycle: start the supervised workers, stop them within a bound.
//!
//! Every worker is a spawned task selecting over its own timer and a shared
//! stop signal. Shutdown flips the signal, waits up to the given timeout for
//! all workers, then aborts whatever is still running.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ServiceError, ServiceState, StorageService, Worker};

fn ticker(period: Duration, immediate: bool) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = if immediate {
        interval(period)
    } else {
        interval_at(Instant::now() + period, period)
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl StorageService {
    fn set_state(&self, state: ServiceState) {
        let _ = self.state.send(state);
        crate::metrics::set_service_state(state.as_str());
    }

    fn spawn_worker<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(worker = name, "Starting worker");
        let handle = tokio::spawn(task);
        self.workers.lock().push(Worker { name, handle });
    }

    /// Probe every backend once, then start the background workers.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ServiceError> {
        let current = self.state();
        if current != ServiceState::Created {
            return Err(ServiceError::InvalidState { action: "start", state: current });
        }
        self.set_state(ServiceState::Starting);
        info!(backends = self.registry.len(), "Starting storage service");

        // Health table reflects reality before the first write arrives.
        let transitions = self.monitor.probe_all().await;
        for t in &transitions {
            let _ = self.engine.handle_transition(t).await;
        }

        let health = &self.config.health;
        let sync = &self.config.sync;

        let monitor = self.monitor.clone();
        let mut stop = self.stop.subscribe();
        let mut tick = ticker(Duration::from_millis(health.probe_interval_ms), false);
        self.spawn_worker("probe", async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tick.tick() => {
                        monitor.probe_all().await;
                    }
                }
            }
        });

        let monitor = self.monitor.clone();
        let mut stop = self.stop.subscribe();
        let mut tick = ticker(Duration::from_millis(health.integrity_interval_ms), false);
        self.spawn_worker("integrity", async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tick.tick() => {
                        monitor.run_integrity_check().await;
                    }
                }
            }
        });

        let engine = self.engine.clone();
        let wake = engine.wake_handle();
        let batch_size = sync.batch_size;
        let mut stop = self.stop.subscribe();
        let mut tick = ticker(Duration::from_millis(sync.drain_interval_ms), true);
        self.spawn_worker("drain", async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tick.tick() => {}
                    _ = wake.notified() => {}
                }
                // Keep going while full batches make progress.
                loop {
                    let report = engine.drain_once().await;
                    let progressed = report.completed + report.partial > 0;
                    if report.attempted < batch_size || !progressed || *stop.borrow() {
                        break;
                    }
                }
            }
        });

        let engine = self.engine.clone();
        let requests = self.monitor.reconcile_requests();
        let mut stop = self.stop.subscribe();
        let mut tick = ticker(Duration::from_millis(sync.reconcile_interval_ms), false);
        self.spawn_worker("reconcile", async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tick.tick() => {}
                    _ = requests.notified() => {
                        info!("Reconciliation requested by integrity check");
                    }
                }
                engine.reconcile().await;
            }
        });

        let engine = self.engine.clone();
        let mut transitions = self.monitor.subscribe();
        let mut stop = self.stop.subscribe();
        self.spawn_worker("recovery", async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    received = transitions.recv() => match received {
                        Ok(t) => {
                            if let Err(e) = engine.handle_transition(&t).await {
                                warn!(backend = %t.backend, error = %e, "Failed to release queued operations");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // The drain timer still picks the work up; only the early wake is lost.
                            warn!(missed, "Health transitions dropped");
                            engine.wake_handle().notify_one();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        if let Some(watcher) = self.watcher.clone() {
            let mut stop = self.stop.subscribe();
            let mut tick = ticker(Duration::from_millis(self.config.watcher.poll_interval_ms), true);
            self.spawn_worker("watcher", async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tick.tick() => {
                            watcher.poll_once().await;
                        }
                    }
                }
            });
        }

        self.set_state(ServiceState::Running);
        info!(workers = self.workers.lock().len(), "Storage service running");
        Ok(())
    }

    /// Signal every worker to stop and wait at most `timeout` for them.
    ///
    /// Returns `true` if all workers finished in time; stragglers are aborted.
    /// Queue, conflict and watcher state is flushed on every mutation, so
    /// nothing is lost either way.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        match self.state() {
            ServiceState::Stopped | ServiceState::ShuttingDown => return true,
            _ => {}
        }
        self.set_state(ServiceState::ShuttingDown);
        info!("Shutting down storage service");
        let _ = self.stop.send(true);

        let workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = workers.iter().map(|w| (w.name, w.handle.abort_handle())).collect();
        let joined = tokio::time::timeout(timeout, join_all(workers.into_iter().map(|w| w.handle))).await;

        let clean = match joined {
            Ok(results) => {
                for (result, (name, _)) in results.iter().zip(&aborts) {
                    if let Err(e) = result {
                        warn!(worker = name, error = %e, "Worker ended abnormally");
                    }
                }
                true
            }
            Err(_) => {
                for (name, abort) in &aborts {
                    if !abort.is_finished() {
                        warn!(worker = name, "Worker did not stop in time, aborting");
                        abort.abort();
                    }
                }
                false
            }
        };

        self.set_state(ServiceState::Stopped);
        info!(clean, "Storage service stopped");
        clean
    }

    /// Wait until the service reaches `target`.
    pub async fn wait_for_state(&self, target: ServiceState) {
        let mut rx: watch::Receiver<ServiceState> = self.state_receiver();
        let _ = rx.wait_for(|s| *s == target).await;
    }
}
