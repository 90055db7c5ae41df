//! Fixed-size worker pool for per-leaf backend calls
//!
//! Leaves are handed to workers through a channel of capacity one, so each
//! worker has at most one call in flight and nothing queues beyond the
//! hand-off. Results come back keyed by `LeafKey` in completion order.

use fpki_core::LeafKey;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::debug;

use crate::cancel::{Cancellation, Interrupt};
use crate::error::Result;

/// Why a pool run stopped before every leaf completed
#[derive(Debug)]
pub(crate) enum Halt {
    /// The caller's token fired
    Interrupted(Interrupt),
    /// A leaf failed and the run was fail-fast; the failure is the last outcome
    HardError,
    /// A worker panicked or the pool lost all its workers
    WorkerLost(String),
}

/// Outcomes collected by one pool run
#[derive(Debug)]
pub(crate) struct PoolRun<T> {
    pub outcomes: Vec<(LeafKey, Result<T>)>,
    pub halted: Option<Halt>,
}

impl<T> PoolRun<T> {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }
}

/// Run `work` on every leaf with at most `num_workers` calls in flight
///
/// With `fail_fast`, the first failed leaf aborts every in-flight call.
/// Aborted calls are abandoned, not rolled back.
pub(crate) async fn run_pool<T, F, Fut>(
    num_workers: usize,
    leaves: Vec<Vec<u8>>,
    cancel: &Cancellation,
    fail_fast: bool,
    work: F,
) -> PoolRun<T>
where
    T: Send + 'static,
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let total = leaves.len();
    let mut run = PoolRun {
        outcomes: Vec::with_capacity(total),
        halted: None,
    };
    if total == 0 {
        return run;
    }

    let (job_tx, job_rx) = mpsc::channel::<Vec<u8>>(1);
    // Sized so a worker never blocks on reporting
    let (result_tx, mut result_rx) = mpsc::channel::<(LeafKey, Result<T>)>(total);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let work = Arc::new(work);

    let mut workers = JoinSet::new();
    for _ in 0..num_workers.clamp(1, total) {
        let jobs = Arc::clone(&job_rx);
        let results = result_tx.clone();
        let work = Arc::clone(&work);
        workers.spawn(async move {
            loop {
                let next = jobs.lock().await.recv().await;
                let Some(leaf) = next else { break };
                let key = LeafKey::for_leaf(&leaf);
                let outcome = work(leaf).await;
                if results.send((key, outcome)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut pending = leaves.into_iter();
    let mut next_leaf = pending.next();

    while run.outcomes.len() < total {
        tokio::select! {
            biased;
            interrupt = cancel.fired() => {
                run.halted = Some(Halt::Interrupted(interrupt));
                break;
            }
            joined = workers.join_next(), if !workers.is_empty() => {
                if let Some(Err(e)) = joined {
                    run.halted = Some(Halt::WorkerLost(e.to_string()));
                    break;
                }
            }
            received = result_rx.recv() => match received {
                Some((key, outcome)) => {
                    let failed = outcome.is_err();
                    run.outcomes.push((key, outcome));
                    if failed && fail_fast {
                        // A failure caused by the token firing is reported as the interrupt
                        run.halted = Some(match cancel.interrupted() {
                            Some(interrupt) => Halt::Interrupted(interrupt),
                            None => Halt::HardError,
                        });
                        break;
                    }
                }
                None => {
                    run.halted = Some(Halt::WorkerLost("all workers exited".into()));
                    break;
                }
            },
            permit = job_tx.reserve(), if next_leaf.is_some() => match permit {
                Ok(permit) => {
                    if let Some(leaf) = next_leaf.take() {
                        permit.send(leaf);
                    }
                    next_leaf = pending.next();
                }
                Err(_) => {
                    run.halted = Some(Halt::WorkerLost("hand-off channel closed".into()));
                    break;
                }
            },
        }
    }

    // Closing the hand-off releases idle workers
    drop(job_tx);
    if let Some(halt) = &run.halted {
        debug!(halt = ?halt, completed = run.outcomes.len(), total = total, "Aborting workers");
        workers.abort_all();
    }
    while workers.join_next().await.is_some() {}

    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::error::{BackendError, LogClientError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn leaves(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i]).collect()
    }

    #[tokio::test]
    async fn test_every_leaf_completes() {
        let run = run_pool(4, leaves(25), &Cancellation::none(), false, |leaf| async move {
            Ok::<_, LogClientError>(leaf[0])
        })
        .await;

        assert!(run.halted.is_none());
        assert_eq!(run.outcomes.len(), 25);
        assert_eq!(run.succeeded(), 25);
    }

    #[tokio::test]
    async fn test_results_are_keyed_by_leaf() {
        let run = run_pool(3, leaves(10), &Cancellation::none(), false, |leaf| async move {
            // Later leaves finish first
            tokio::time::sleep(Duration::from_millis(10 - leaf[0] as u64)).await;
            Ok::<_, LogClientError>(leaf[0])
        })
        .await;

        for (key, value) in run.outcomes {
            assert_eq!(key, LeafKey::for_leaf(&[value.unwrap()]));
        }
    }

    #[tokio::test]
    async fn test_in_flight_bounded_by_workers() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max) = (Arc::clone(&in_flight), Arc::clone(&peak));

        let run = run_pool(3, leaves(30), &Cancellation::none(), false, move |_| {
            let current = Arc::clone(&current);
            let max = Arc::clone(&max);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, LogClientError>(())
            }
        })
        .await;

        assert_eq!(run.succeeded(), 30);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_on_first_error() {
        let run = run_pool(2, leaves(50), &Cancellation::none(), true, |leaf| async move {
            if leaf[0] == 3 {
                return Err(LogClientError::Backend(BackendError::Internal("boom".into())));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok::<_, LogClientError>(())
        })
        .await;

        assert!(matches!(run.halted, Some(Halt::HardError)));
        assert!(run.outcomes.len() < 50);
        let (key, last) = run.outcomes.last().unwrap();
        assert_eq!(*key, LeafKey::for_leaf(&[3]));
        assert!(last.is_err());
    }

    #[tokio::test]
    async fn test_collects_failures_without_fail_fast() {
        let run = run_pool(4, leaves(10), &Cancellation::none(), false, |leaf| async move {
            if leaf[0] % 2 == 0 {
                Err(LogClientError::Backend(BackendError::NotFound("later".into())))
            } else {
                Ok(())
            }
        })
        .await;

        assert!(run.halted.is_none());
        assert_eq!(run.outcomes.len(), 10);
        assert_eq!(run.succeeded(), 5);
    }

    #[tokio::test]
    async fn test_cancellation_releases_blocked_workers() {
        let (handle, token) = CancelHandle::new();
        let pool = tokio::spawn(async move {
            run_pool(4, leaves(8), &token, false, |_| async {
                std::future::pending::<Result<()>>().await
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let run = pool.await.unwrap();

        assert!(matches!(run.halted, Some(Halt::Interrupted(Interrupt::Cancelled))));
        assert!(run.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_worker_is_reported() {
        let run = run_pool(2, leaves(4), &Cancellation::none(), false, |leaf| async move {
            if leaf[0] == 1 {
                panic!("worker bug");
            }
            Ok::<_, LogClientError>(())
        })
        .await;

        assert!(matches!(run.halted, Some(Halt::WorkerLost(_))));
    }
}
