//! The radio context.
//!
//! Platform radio APIs want every session start and stop issued from one
//! controlling thread. [`RadioExecutor`] owns that thread and runs jobs on it
//! strictly in submission order, so a stop queued after a start always sees
//! the started session.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{Result, SonarError};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
enum Mode {
    Thread(mpsc::Sender<Job>),
    Inline,
}

/// Handle to the single controlling radio thread.
///
/// Cloning is cheap; the thread exits once every handle is dropped.
#[derive(Clone)]
pub struct RadioExecutor {
    mode: Mode,
}

impl RadioExecutor {
    /// Spawn the `sonar-radio` thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("sonar-radio".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("radio job panicked");
                    }
                }
                debug!("radio thread exiting");
            })?;
        Ok(Self {
            mode: Mode::Thread(tx),
        })
    }

    /// Run jobs directly on the calling task.
    ///
    /// For hosts whose radio API has no thread affinity, and for tests.
    #[must_use]
    pub const fn inline() -> Self {
        Self { mode: Mode::Inline }
    }

    /// Run `f` on the radio context and wait for its result.
    ///
    /// Once submitted, the job runs even if the returned future is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SonarError::RadioExecutorStopped`] if the radio thread is
    /// gone.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match &self.mode {
            Mode::Inline => Ok(f()),
            Mode::Thread(tx) => {
                let (done_tx, done_rx) = oneshot::channel();
                tx.send(Box::new(move || {
                    let _ = done_tx.send(f());
                }))
                .map_err(|_| SonarError::RadioExecutorStopped)?;
                done_rx.await.map_err(|_| SonarError::RadioExecutorStopped)
            }
        }
    }

    /// Queue `f` without waiting for it. Safe to call from `Drop`.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.mode {
            Mode::Inline => f(),
            Mode::Thread(tx) => {
                if tx.send(Box::new(f)).is_err() {
                    warn!("radio thread gone, dropping job");
                }
            }
        }
    }

    /// Wait until every previously queued job has run.
    ///
    /// # Errors
    ///
    /// Returns [`SonarError::RadioExecutorStopped`] if the radio thread is
    /// gone.
    pub async fn flush(&self) -> Result<()> {
        self.run(|| ()).await
    }
}

/// Stops a radio session exactly once.
///
/// [`finish`](Self::finish) issues the stop and waits for it. If the owning
/// task is cancelled before that, dropping the guard queues the stop on the
/// radio context instead.
pub struct StopGuard {
    radio: RadioExecutor,
    stop: Option<Job>,
}

impl StopGuard {
    /// Arm a guard that will run `stop` on `radio`.
    pub fn new<F>(radio: RadioExecutor, stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            radio,
            stop: Some(Box::new(stop)),
        }
    }

    /// Stop the session now and wait for the radio context to do it.
    pub async fn finish(mut self) {
        if let Some(stop) = self.stop.take() {
            if let Err(err) = self.radio.run(stop).await {
                warn!(error = %err, "session stop was not confirmed");
            }
        }
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            self.radio.dispatch(stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_jobs_run_on_radio_thread() {
        let radio = RadioExecutor::spawn().unwrap();
        let name = radio
            .run(|| thread::current().name().map(str::to_string))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("sonar-radio"));
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let radio = RadioExecutor::spawn().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            radio.dispatch(move || seen.lock().unwrap().push(i));
        }
        radio.flush().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_thread() {
        let radio = RadioExecutor::spawn().unwrap();
        radio.dispatch(|| panic!("boom"));
        assert_eq!(radio.run(|| 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_stop_guard_stops_once_on_finish() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let guard = StopGuard::new(RadioExecutor::inline(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        guard.finish().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_guard_stops_on_drop() {
        let radio = RadioExecutor::spawn().unwrap();
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let (armed_tx, armed_rx) = oneshot::channel();
        let task = tokio::spawn({
            let radio = radio.clone();
            async move {
                let _guard = StopGuard::new(radio, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                let _ = armed_tx.send(());
                std::future::pending::<()>().await;
            }
        });
        armed_rx.await.unwrap();
        task.abort();
        let _ = task.await;
        radio.flush().await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
