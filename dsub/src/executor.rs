//! Per-destination task serializer.
//!
//! Each destination owns one worker that runs submitted closures against the destination's
//! state, one at a time, in submission order. Nothing else touches that state, so the
//! subscription bookkeeping inside it needs no locks. Different destinations run in parallel.
//!
//! [`TaskSerializer::submit`] returns a [`TaskHandle`] that is waited on with an explicit
//! deadline. An expired deadline is reported as [`Error::Timeout`], separate from the task's
//! own failure; the task still runs to completion.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use dsub_utils::Counter;

use crate::types::DestinationName;
use crate::{Error, Result};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Command<S> {
    Run(Task<S>),
    Close,
}

#[derive(Default, Debug)]
pub struct SerializerStats {
    pub queued: Counter,
    pub completed: AtomicUsize,
    pub panicked: AtomicUsize,
}

pub struct TaskSerializer<S> {
    name: DestinationName,
    tx: mpsc::UnboundedSender<Command<S>>,
    closed: Arc<AtomicBool>,
    stats: Arc<SerializerStats>,
}

impl<S> Clone for TaskSerializer<S> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), tx: self.tx.clone(), closed: self.closed.clone(), stats: self.stats.clone() }
    }
}

impl<S: Send + 'static> TaskSerializer<S> {
    /// Start the worker owning `state`. Must be called inside a tokio runtime.
    pub fn spawn(name: DestinationName, mut state: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<S>>();
        let closed = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SerializerStats::default());

        let worker_name = name.clone();
        let worker_stats = stats.clone();
        let worker_closed = closed.clone();
        tokio::spawn(async move {
            scopeguard::defer! {
                worker_closed.store(true, Ordering::SeqCst);
            }
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Run(task) => {
                        worker_stats.queued.dec();
                        if catch_unwind(AssertUnwindSafe(|| task(&mut state))).is_err() {
                            worker_stats.panicked.fetch_add(1, Ordering::SeqCst);
                            log::error!("{} task panicked, continuing with next task", worker_name);
                        }
                        worker_stats.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Command::Close => break,
                }
            }
            log::debug!("{} task serializer exit", worker_name);
        });

        Self { name, tx, closed, stats }
    }

    /// Fire-and-forget.
    #[inline]
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::DestinationClosed(self.name.clone()));
        }
        self.stats.queued.inc();
        self.tx.send(Command::Run(Box::new(f))).map_err(|_| {
            self.stats.queued.dec();
            Error::DestinationClosed(self.name.clone())
        })
    }

    /// Queue `f` and hand back a handle to its result. If the serializer is already closed the
    /// handle resolves to [`Error::TaskCancelled`].
    #[inline]
    pub fn submit<F, R>(&self, f: F) -> TaskHandle<R>
    where
        F: FnOnce(&mut S) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (res_tx, res_rx) = oneshot::channel();
        let task = move |state: &mut S| {
            // The waiter may have given up already.
            let _ = res_tx.send(f(state));
        };
        if let Err(e) = self.execute(task) {
            log::debug!("{} submit rejected, {}", self.name, e);
        }
        TaskHandle { rx: res_rx }
    }

    /// Stop after the tasks already queued have run.
    #[inline]
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    #[inline]
    pub fn stats(&self) -> &SerializerStats {
        &self.stats
    }
}

/// Single-use result of a submitted task.
#[must_use = "a task handle does nothing unless waited on"]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> TaskHandle<R> {
    /// A handle that is already resolved, used when there is nothing to submit.
    pub fn ready(res: Result<R>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(res);
        Self { rx }
    }

    /// Wait at most `timeout`.
    ///
    /// - `Err(Error::Timeout)`: the deadline passed, the task keeps running
    /// - `Err(Error::TaskCancelled)`: the task was dropped without running
    /// - otherwise the task's own result
    pub async fn wait(self, timeout: Duration) -> Result<R> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(Error::TaskCancelled),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn runs_in_submission_order() {
        let exec = TaskSerializer::spawn("d".into(), Vec::<u32>::new());
        for i in 0..100 {
            exec.execute(move |v: &mut Vec<u32>| v.push(i)).unwrap();
        }
        let seen = exec.submit(|v: &mut Vec<u32>| Ok(v.clone())).wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_is_distinct_from_failure() {
        let exec = TaskSerializer::spawn("d".into(), ());
        let gate = Arc::new(Mutex::new(()));
        let guard = gate.lock().unwrap();
        let g = gate.clone();
        exec.execute(move |_| {
            let _unused = g.lock();
        })
        .unwrap();
        let res = exec.submit(|_| Ok(1)).wait(Duration::from_millis(50)).await;
        assert!(matches!(res, Err(Error::Timeout(_))));
        drop(guard);

        let res: Result<()> = exec.submit(|_| Err(Error::msg("boom"))).wait(Duration::from_secs(5)).await;
        assert!(matches!(res, Err(Error::Anyhow(_))));
    }

    #[tokio::test]
    async fn panic_does_not_stop_worker() {
        let exec = TaskSerializer::spawn("d".into(), 0u32);
        exec.execute(|_| panic!("bad task")).unwrap();
        let v = exec
            .submit(|n: &mut u32| {
                *n += 1;
                Ok(*n)
            })
            .wait(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(v, 1);
        assert_eq!(exec.stats().panicked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_serializer_cancels() {
        let exec = TaskSerializer::spawn("d".into(), ());
        exec.close();
        let _ = exec.submit(|_| Ok(())).wait(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(exec.is_closed());
        assert!(exec.execute(|_| ()).is_err());
        let res = exec.submit(|_| Ok(())).wait(Duration::from_secs(5)).await;
        assert!(res.unwrap_err().is_cancelled());
        assert!(TaskHandle::ready(Ok(3)).wait(Duration::from_millis(1)).await.is_ok());
    }
}
