// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency fan-out: a fixed pool of workers drains a task
//! channel, the first failure is latched and cancels the peers.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Mutex;
use std::thread;

use crate::error::Error;

/// A cooperative stop signal shared by every task of a batch. Tasks poll it
/// at their I/O boundaries.
#[derive(Debug, Default)]
pub struct Cancellation(AtomicBool);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(())
    }

    /// Wraps a reader so a long transfer stops at the next chunk boundary
    /// once the signal is raised.
    pub fn guard<R: Read>(&self, inner: R) -> Guarded<'_, R> {
        Guarded {
            cancel: self,
            inner,
        }
    }
}

pub struct Guarded<'c, R> {
    cancel: &'c Cancellation,
    inner: R,
}

impl<R: Read> Read for Guarded<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // not Interrupted: io::copy would retry that kind forever
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "transfer cancelled",
            ));
        }

        self.inner.read(buf)
    }
}

pub type Task<'env> = Box<dyn FnOnce(&Cancellation) -> Result<(), Error> + Send + 'env>;

/// The submission handle passed to a batch producer.
pub struct Batch<'env> {
    tx: Sender<Task<'env>>,
}

impl<'env> Batch<'env> {
    pub fn submit(&self, task: Task<'env>) {
        // Delivery only fails once every worker is gone, and the workers
        // outlive the producer by construction.
        let _ = self.tx.send(task);
    }
}

/// A fixed pool of workers with first-error semantics.
pub struct WorkQueue {
    workers: usize,
}

impl WorkQueue {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Runs `produce` with a submission handle, executes every submitted
    /// task on the pool, and returns once all of them have terminated. The
    /// first task error is returned; once it is latched, queued tasks are
    /// discarded and running tasks observe the cancellation signal.
    pub fn batch<'env, F>(&self, cancel: &Cancellation, produce: F) -> Result<(), Error>
    where
        F: FnOnce(&Batch<'env>),
    {
        let (tx, rx) = channel::<Task<'env>>();
        let rx = Mutex::new(rx);
        let first: Mutex<Option<Error>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| loop {
                    let task = match rx.lock() {
                        Ok(receiver) => receiver.recv(),
                        Err(..) => break,
                    };

                    let Ok(task) = task else { break };
                    if cancel.is_cancelled() {
                        continue;
                    }

                    if let Err(err) = task(cancel) {
                        cancel.cancel();
                        if let Ok(mut latch) = first.lock() {
                            latch.get_or_insert(err);
                        }
                    }
                });
            }

            produce(&Batch { tx });
        });

        match first.into_inner() {
            Ok(Some(err)) => Err(err),
            Ok(None) => Ok(()),
            Err(..) => Err(Error::Fatal("worker pool poisoned".into())),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;

    use super::{Cancellation, WorkQueue};
    use crate::error::Error;

    #[test]
    fn runs_every_task() {
        let done = AtomicUsize::new(0);
        let cancel = Cancellation::new();

        let result = WorkQueue::new(4).batch(&cancel, |batch| {
            for _ in 0..32 {
                batch.submit(Box::new(|_| {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
        });

        assert!(result.is_ok());
        assert_eq!(done.load(Ordering::SeqCst), 32);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn first_error_wins_and_cancels_peers() {
        let started_after = AtomicUsize::new(0);
        let cancel = Cancellation::new();
        let (gate_tx, gate_rx) = channel::<()>();

        let result = WorkQueue::new(1).batch(&cancel, |batch| {
            batch.submit(Box::new(move |_| {
                // hold the single worker until every task is queued
                let _ = gate_rx.recv();
                Err(Error::Fatal("boom".into()))
            }));
            for _ in 0..8 {
                batch.submit(Box::new(|_| {
                    started_after.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
            let _ = gate_tx.send(());
        });

        assert!(matches!(result, Err(Error::Fatal(msg)) if msg == "boom"));
        assert!(cancel.is_cancelled());
        assert_eq!(started_after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn keeps_the_first_error_only() {
        let cancel = Cancellation::new();

        let result = WorkQueue::new(1).batch(&cancel, |batch| {
            batch.submit(Box::new(|_| Err(Error::Fatal("first".into()))));
            batch.submit(Box::new(|_| Err(Error::Fatal("second".into()))));
        });

        assert!(matches!(result, Err(Error::Fatal(msg)) if msg == "first"));
    }

    #[test]
    fn tasks_observe_the_signal() {
        let cancel = Cancellation::new();
        cancel.cancel();
        assert!(matches!(cancel.check(), Err(Error::Cancelled)));

        let mut guarded = cancel.guard(&b"data"[..]);
        let mut out = Vec::new();
        assert!(std::io::Read::read_to_end(&mut guarded, &mut out).is_err());
    }
}
