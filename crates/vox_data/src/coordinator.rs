//! The designated coordinator context
//!
//! Version bumps, and therefore snapshot construction and change dispatch,
//! happen on exactly one thread. Callers on other threads marshal work onto
//! it with [`Coordinator::execute`], which blocks until the job has run and
//! hands its return value back. Calls made on the coordinator thread itself
//! run inline.

use crate::config::DataModelConfig;
use crate::error::{DataError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Owner of the coordinator thread
pub struct Coordinator {
    name: String,
    sender: Option<Sender<Job>>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Start a coordinator thread with the given name
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Job>();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_jobs(receiver))
            .map_err(|e| {
                DataError::CoordinatorUnavailable(format!("failed to spawn '{}': {}", name, e))
            })?;

        log::debug!("Coordinator '{}' started", name);

        Ok(Self {
            thread_id: handle.thread().id(),
            name,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is the coordinator thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Fail with `InternalError` unless called on the coordinator thread
    pub fn check_current(&self, what: &str) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(DataError::internal(format!(
                "{} must run on coordinator '{}'",
                what, self.name
            )))
        }
    }

    /// Run `job` on the coordinator and wait for its result
    pub fn execute<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return catch_unwind(AssertUnwindSafe(job)).map_err(|_| {
                DataError::CoordinatorUnavailable(format!("job on '{}' panicked", self.name))
            });
        }

        let sender = self.sender.as_ref().ok_or_else(|| {
            DataError::CoordinatorUnavailable(format!("'{}' is shutting down", self.name))
        })?;

        let (reply_tx, reply_rx) = bounded(1);
        sender
            .send(Box::new(move || {
                let _ = reply_tx.send(job());
            }))
            .map_err(|_| DataError::CoordinatorUnavailable(format!("'{}' has stopped", self.name)))?;

        reply_rx.recv().map_err(|_| {
            DataError::CoordinatorUnavailable(format!("job on '{}' panicked", self.name))
        })
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Closing the channel ends the job loop
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if self.is_current() {
                return;
            }
            if handle.join().is_err() {
                log::error!("Coordinator '{}' terminated abnormally", self.name);
            }
        }
    }
}

fn run_jobs(receiver: Receiver<Job>) {
    for job in receiver {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("Coordinator job panicked");
        }
    }
}

/// Configuration plus coordinator shared by a family of objects
pub struct DataContext {
    config: DataModelConfig,
    coordinator: Coordinator,
}

impl DataContext {
    pub fn new(config: DataModelConfig) -> Result<Arc<Self>> {
        let coordinator = Coordinator::spawn(config.coordinator_thread_name.clone())?;
        Ok(Arc::new(Self { config, coordinator }))
    }

    /// Context with [`DataModelConfig::default`]
    pub fn with_defaults() -> Result<Arc<Self>> {
        Self::new(DataModelConfig::default())
    }

    pub fn config(&self) -> &DataModelConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_execute_runs_on_coordinator_thread() {
        let coordinator = Arc::new(Coordinator::spawn("test-coordinator").unwrap());
        assert!(!coordinator.is_current());

        let inner = coordinator.clone();
        let on_thread = coordinator.execute(move || inner.is_current()).unwrap();
        assert!(on_thread);
    }

    #[test]
    fn test_nested_execute_runs_inline() {
        let coordinator = Arc::new(Coordinator::spawn("nested").unwrap());
        let inner = coordinator.clone();
        let value = coordinator
            .execute(move || inner.execute(|| 21 * 2))
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let coordinator = Arc::new(Coordinator::spawn("ordered").unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        for expected in 0..50 {
            let counter = counter.clone();
            let seen = coordinator
                .execute(move || counter.fetch_add(1, Ordering::SeqCst))
                .unwrap();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_panicking_job_reports_error_and_coordinator_survives() {
        let coordinator = Coordinator::spawn("panicky").unwrap();
        let result: Result<()> = coordinator.execute(|| panic!("boom"));
        assert!(matches!(result, Err(DataError::CoordinatorUnavailable(_))));

        assert_eq!(coordinator.execute(|| 7).unwrap(), 7);
    }

    #[test]
    fn test_check_current() {
        let coordinator = Coordinator::spawn("check").unwrap();
        assert!(matches!(
            coordinator.check_current("bump"),
            Err(DataError::InternalError(_))
        ));
    }
}
