//! Discovery session bridge.
//!
//! Turns the callback-driven [`DiscoveryTransport`] into one awaitable,
//! time-boxed, cancellable call. Whatever ends the call (a result, an error,
//! the deadline, [`DiscoveryBridge::cancel_pending`] or the caller dropping
//! the future), the session is stopped exactly once on the radio context.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SonarError, Subsystem};
use crate::health::HealthMonitor;
use crate::radio::{RadioExecutor, StopGuard};
use crate::transport::{DiscoveryCallback, DiscoveryEvent, DiscoveryTransport};
use crate::types::{DeviceAddress, ScannedDevice};

/// Owns the discovery session lifecycle.
pub struct DiscoveryBridge {
    transport: Arc<dyn DiscoveryTransport>,
    radio: RadioExecutor,
    health: Arc<HealthMonitor>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    last_start: Mutex<Option<Instant>>,
}

impl DiscoveryBridge {
    /// Create a bridge over `transport`, reporting session outcomes to
    /// `health`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn DiscoveryTransport>,
        radio: RadioExecutor,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            transport,
            radio,
            health,
            cancel: Mutex::new(None),
            last_start: Mutex::new(None),
        }
    }

    /// Run one discovery session for at most `limit`.
    ///
    /// Every batch is first handed to `forward`, then to `until`; the first
    /// `Some` returned by `until` ends the session. Returns `Ok(None)` if the
    /// session was cancelled through [`cancel_pending`](Self::cancel_pending).
    ///
    /// # Errors
    ///
    /// - [`SonarError::TransportStart`] if the platform refused to start or
    ///   the session reported an error
    /// - [`SonarError::Timeout`] if `limit` elapsed first
    /// - [`SonarError::RadioExecutorStopped`] if the radio context is gone
    pub async fn discover<T, F, U>(&self, limit: Duration, mut forward: F, mut until: U) -> Result<Option<T>>
    where
        F: FnMut(&[ScannedDevice]) + Send,
        U: FnMut(&[ScannedDevice]) -> Option<T> + Send,
        T: Send,
    {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let callback: DiscoveryCallback = Arc::new(move |event| {
            let _ = events_tx.send(event);
        });

        let (cancel_tx, mut cancelled) = oneshot::channel();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel_tx);

        // Armed before the start is queued, so a cancelled caller still stops
        // the session once the radio context has started it.
        let transport = self.transport.clone();
        let guard = StopGuard::new(self.radio.clone(), move || transport.stop());

        *self.last_start.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        let transport = self.transport.clone();
        let started = self.radio.run(move || transport.start(callback)).await?;
        if !started {
            warn!(subsystem = %Subsystem::Discovery, "discovery refused to start");
            self.health.record_discovery_failure();
            guard.finish().await;
            self.release_cancel(cancelled);
            return Err(SonarError::TransportStart {
                subsystem: Subsystem::Discovery,
                code: None,
            });
        }

        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        // The session counts as healthy on its first batch, or when it ends
        // without reporting a failure.
        let mut health_recorded = false;
        let mut cancel_live = true;

        let outcome = loop {
            tokio::select! {
                signal = &mut cancelled, if cancel_live => {
                    cancel_live = false;
                    if signal.is_ok() {
                        debug!("discovery cancelled");
                        break Ok(None);
                    }
                }
                () = &mut deadline => {
                    break Err(SonarError::Timeout {
                        subsystem: Subsystem::Discovery,
                        after: limit,
                    });
                }
                event = events.recv() => match event {
                    Some(DiscoveryEvent::Batch(batch)) => {
                        if !health_recorded {
                            self.health.record_discovery_success();
                            health_recorded = true;
                        }
                        forward(&batch);
                        if let Some(found) = until(&batch) {
                            break Ok(Some(found));
                        }
                    }
                    Some(DiscoveryEvent::Failed(code)) => {
                        warn!(subsystem = %Subsystem::Discovery, ?code, "discovery failed");
                        self.health.record_discovery_failure();
                        health_recorded = true;
                        break Err(SonarError::TransportStart {
                            subsystem: Subsystem::Discovery,
                            code,
                        });
                    }
                    None => break Ok(None),
                },
            }
        };

        if !health_recorded {
            self.health.record_discovery_success();
        }
        self.release_cancel(cancelled);
        guard.finish().await;
        outcome
    }

    /// Discover broadly until at least `min_results` scans arrived or
    /// `limit` elapsed. Returns how many scans were seen.
    ///
    /// Reaching the deadline is the normal end of a burst, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the session failed to start or reported an error.
    pub async fn discover_until_volume<F>(&self, limit: Duration, min_results: usize, forward: F) -> Result<usize>
    where
        F: FnMut(&[ScannedDevice]) + Send,
    {
        let mut seen = 0usize;
        let result = self
            .discover(limit, forward, |batch| {
                seen += batch.len();
                (seen >= min_results).then_some(())
            })
            .await;
        match result {
            Ok(_) | Err(SonarError::Timeout { .. }) => Ok(seen),
            Err(err) => Err(err),
        }
    }

    /// Discover until `address` shows up again. Returns its fresh scan, or
    /// `None` if the session was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`SonarError::Timeout`] if the device did not reappear within
    /// `limit`, or the session's start error.
    pub async fn discover_device<F>(&self, address: DeviceAddress, limit: Duration, forward: F) -> Result<Option<ScannedDevice>>
    where
        F: FnMut(&[ScannedDevice]) + Send,
    {
        self.discover(limit, forward, |batch| {
            batch.iter().find(|scan| scan.address == address).cloned()
        })
        .await
    }

    /// End the session currently awaiting results, if any.
    pub fn cancel_pending(&self) {
        let pending = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = pending {
            let _ = cancel.send(());
        }
    }

    /// Time since the last discovery start.
    #[must_use]
    pub fn since_last_start(&self) -> Option<Duration> {
        self.last_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed())
    }

    fn release_cancel(&self, cancelled: oneshot::Receiver<()>) {
        drop(cancelled);
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(oneshot::Sender::is_closed) {
            *slot = None;
        }
    }
}
