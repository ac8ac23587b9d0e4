use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::error::DockError;

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    Ok(T),
    Malformed(String),
}

impl<T, E: fmt::Display> From<Result<T, E>> for ItemOutcome<T> {
    fn from(value: Result<T, E>) -> Self {
        match value {
            Ok(value) => ItemOutcome::Ok(value),
            Err(err) => ItemOutcome::Malformed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskReport<K: Ord, T> {
    pub succeeded: BTreeMap<K, T>,
    pub failed: BTreeMap<K, String>,
}

impl<K: Ord, T> TaskReport<K, T> {
    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TaskRunner {
    pool: ThreadPool,
    workers: usize,
    cancel: CancelToken,
}

impl TaskRunner {
    pub fn new(workers: Option<usize>) -> Result<Self, DockError> {
        Self::with_cancel(workers, CancelToken::default())
    }

    pub fn with_cancel(workers: Option<usize>, cancel: CancelToken) -> Result<Self, DockError> {
        let workers = workers
            .filter(|count| *count > 0)
            .unwrap_or_else(default_workers);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("agandock-worker-{index}"))
            .build()
            .map_err(|err| DockError::Filesystem(format!("worker pool: {err}")))?;
        Ok(Self {
            pool,
            workers,
            cancel,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// An item's failure or panic is recorded against its key. On cancellation
    /// in-flight items drain and `Cancelled` is returned.
    pub fn run<K, I, T, F>(
        &self,
        label: &str,
        items: &[(K, I)],
        task: F,
    ) -> Result<TaskReport<K, T>, DockError>
    where
        K: Ord + Clone + fmt::Display + Send + Sync,
        I: Sync,
        T: Send,
        F: Fn(&K, &I) -> ItemOutcome<T> + Sync,
    {
        let cancel = &self.cancel;
        let outcomes: Vec<(K, Option<ItemOutcome<T>>)> = self.pool.install(|| {
            items
                .par_iter()
                .map(|(key, item)| {
                    if cancel.is_cancelled() {
                        return (key.clone(), None);
                    }
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(key, item)))
                        .unwrap_or_else(|payload| {
                            ItemOutcome::Malformed(format!("panicked: {}", panic_message(payload.as_ref())))
                        });
                    (key.clone(), Some(outcome))
                })
                .collect()
        });

        if cancel.is_cancelled() {
            warn!(stage = label, "cancelled; discarding partial results");
            return Err(DockError::Cancelled);
        }

        let mut report = TaskReport {
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
        };
        for (key, outcome) in outcomes {
            match outcome {
                Some(ItemOutcome::Ok(value)) => {
                    report.succeeded.insert(key, value);
                }
                Some(ItemOutcome::Malformed(reason)) => {
                    debug!(stage = label, item = %key, %reason, "item failed");
                    report.failed.insert(key, reason);
                }
                None => {}
            }
        }
        if !report.failed.is_empty() {
            warn!(
                stage = label,
                failed = report.failed.len(),
                succeeded = report.succeeded.len(),
                "items failed"
            );
        }
        Ok(report)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
