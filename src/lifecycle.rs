use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::types::WorkerKind;

/// A worker body. Async blocks have anonymous types, so workers are boxed
/// and pinned before they cross the channel to the reaper.
type WorkerFuture = Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send>>;

struct SpawnRequest {
    kind: WorkerKind,
    body: WorkerFuture,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    reaped: AtomicU64,
}

/// Handle for starting workers. Cheap to clone; every worker started
/// through it is owned, joined and logged by a single reaper task.
#[derive(Clone)]
pub struct Lifecycle {
    requests: mpsc::UnboundedSender<SpawnRequest>,
    counters: Arc<Counters>,
}

impl Lifecycle {
    /// Start the reaper. Cancelling `shutdown` aborts every live worker; the
    /// returned handle completes once all of them have been joined.
    pub fn start(shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (requests, inbox) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let reaper = Reaper {
            inbox,
            workers: JoinSet::new(),
            counters: Arc::clone(&counters),
            shutdown,
        };
        let handle = tokio::spawn(reaper.run());
        (Self { requests, counters }, handle)
    }

    /// Hand a worker to the reaper. Returns `false` if the reaper has
    /// already stopped, in which case the worker is dropped unstarted.
    pub fn spawn<F>(&self, kind: WorkerKind, body: F) -> bool
    where
        F: Future<Output = Result<(), RelayError>> + Send + 'static,
    {
        let request = SpawnRequest {
            kind,
            body: Box::pin(body),
        };
        if self.requests.send(request).is_err() {
            warn!(%kind, "reaper stopped, worker not started");
            return false;
        }
        true
    }

    pub fn spawned(&self) -> u64 {
        self.counters.spawned.load(Ordering::SeqCst)
    }

    pub fn reaped(&self) -> u64 {
        self.counters.reaped.load(Ordering::SeqCst)
    }

    /// Workers started but not yet joined.
    pub fn live(&self) -> u64 {
        self.spawned().saturating_sub(self.reaped())
    }
}

struct Reaper {
    inbox: mpsc::UnboundedReceiver<SpawnRequest>,
    workers: JoinSet<(WorkerKind, Result<(), RelayError>)>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl Reaper {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(joined) = self.workers.join_next() => self.reap(joined),

                Some(request) = self.inbox.recv() => self.start(request),

                else => break,
            }
        }

        // Anything still queued never ran.
        self.inbox.close();
        while let Ok(request) = self.inbox.try_recv() {
            debug!(kind = %request.kind, "dropping worker queued during shutdown");
        }

        let live = self.workers.len();
        if live > 0 {
            info!(live, "aborting live workers");
        }
        self.workers.abort_all();
        while let Some(joined) = self.workers.join_next().await {
            self.reap(joined);
        }
        debug!("reaper finished");
    }

    fn start(&mut self, request: SpawnRequest) {
        let SpawnRequest { kind, body } = request;
        self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        self.workers.spawn(async move { (kind, body.await) });
        debug!(%kind, live = self.workers.len(), "worker started");
    }

    /// Each finished worker is joined exactly once, here.
    fn reap(&self, joined: Result<(WorkerKind, Result<(), RelayError>), JoinError>) {
        match joined {
            Ok((kind, Ok(()))) => debug!(%kind, "worker reaped"),
            Ok((kind, Err(e))) => warn!(%kind, error = %e, "worker ended with an error"),
            Err(e) if e.is_cancelled() => debug!("worker aborted"),
            Err(e) => error!(error = %e, "worker panicked"),
        }
        self.counters.reaped.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn wait_for(lifecycle: &Lifecycle, reaped: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while lifecycle.reaped() < reaped {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn finished_workers_are_reaped_once() {
        let token = CancellationToken::new();
        let (lifecycle, reaper) = Lifecycle::start(token.clone());

        for _ in 0..10 {
            assert!(lifecycle.spawn(WorkerKind::Chat, async { Ok(()) }));
        }
        lifecycle.spawn(WorkerKind::Upload, async {
            Err(RelayError::InvalidFileName("..".into()))
        });

        wait_for(&lifecycle, 11).await;
        assert_eq!(lifecycle.spawned(), 11);
        assert_eq!(lifecycle.live(), 0);

        token.cancel();
        reaper.await.unwrap();
        assert_eq!(lifecycle.reaped(), 11);
    }

    #[tokio::test]
    async fn shutdown_aborts_and_joins_live_workers() {
        let token = CancellationToken::new();
        let (lifecycle, reaper) = Lifecycle::start(token.clone());

        for _ in 0..3 {
            lifecycle.spawn(WorkerKind::Download, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            });
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while lifecycle.spawned() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(lifecycle.live(), 3);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), reaper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lifecycle.reaped(), 3);
        assert_eq!(lifecycle.live(), 0);
    }

    #[tokio::test]
    async fn spawn_after_shutdown_is_refused() {
        let token = CancellationToken::new();
        let (lifecycle, reaper) = Lifecycle::start(token.clone());
        token.cancel();
        reaper.await.unwrap();

        assert!(!lifecycle.spawn(WorkerKind::Directory, async { Ok(()) }));
    }
}
