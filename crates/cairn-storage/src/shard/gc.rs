//! Per-shard garbage collector runtime
//!
//! Two tasks run per shard: an event listener dispatching external events
//! (epoch changes) to the handlers registered for their kind, and a timer
//! driving the physical remover.
//!
//! Handler batches of one kind never overlap: before a new batch starts the
//! previous one is canceled and every handler in it has returned. Batches
//! of different kinds are independent.

use crate::util::WorkerPool;
use cairn_common::Epoch;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// External event delivered to the garbage collector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Network epoch advanced to the carried value
    NewEpoch(Epoch),
}

/// Class of an [`Event`]; handlers are registered per kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewEpoch,
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::NewEpoch(_) => EventKind::NewEpoch,
        }
    }
}

/// Event handler; must poll the token between units of work
pub type EventHandler = Arc<dyn Fn(CancellationToken, Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Physical removal pass, run on a blocking thread
pub type Remover = Arc<dyn Fn() + Send + Sync>;

/// Parameters of [`Gc::start`]
pub struct GcPrm {
    pub remover_interval: Duration,
    pub remover: Remover,
    pub handlers: HashMap<EventKind, Vec<EventHandler>>,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

struct HandlerGroup {
    cancel: CancellationToken,
    tracker: TaskTracker,
    handlers: Vec<EventHandler>,
}

#[derive(Debug, Default)]
struct GcStats {
    events: AtomicU64,
    batches: AtomicU64,
    rejected: AtomicU64,
    remover_runs: AtomicU64,
}

/// Point-in-time copy of the collector counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStatsSnapshot {
    pub events: u64,
    pub batches: u64,
    /// Handlers the worker pool refused
    pub rejected: u64,
    pub remover_runs: u64,
}

/// Running garbage collector of one shard
pub struct Gc {
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stats: Arc<GcStats>,
}

impl Gc {
    /// Spawn the listener and the remover; must be called within a tokio
    /// runtime
    #[must_use]
    pub fn start(prm: GcPrm) -> Self {
        let (events, rx) = mpsc::channel(prm.event_capacity.max(1));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let stats = Arc::new(GcStats::default());

        let pool = WorkerPool::new(prm.handlers.values().map(Vec::len).sum());
        let groups = prm
            .handlers
            .into_iter()
            .map(|(kind, handlers)| {
                let group = HandlerGroup {
                    cancel: CancellationToken::new(),
                    tracker: TaskTracker::new(),
                    handlers,
                };
                (kind, group)
            })
            .collect();

        tasks.spawn(listen_events(
            rx,
            shutdown.clone(),
            groups,
            pool,
            Arc::clone(&stats),
        ));
        tasks.spawn(tick_remover(
            shutdown.clone(),
            prm.remover_interval,
            prm.remover,
            Arc::clone(&stats),
        ));
        tasks.close();

        Self {
            events,
            shutdown,
            tasks,
            stats,
        }
    }

    /// Queue an event; waits while the channel is full
    pub async fn notify(&self, event: Event) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            res = self.events.send(event) => res.is_ok(),
        }
    }

    /// Handle for queueing events without holding the collector
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    /// Cancel running handlers and wait for every task to exit
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.wait().await;
    }

    #[must_use]
    pub fn stats(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            events: self.stats.events.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            remover_runs: self.stats.remover_runs.load(Ordering::Relaxed),
        }
    }
}

async fn listen_events(
    mut rx: mpsc::Receiver<Event>,
    shutdown: CancellationToken,
    mut groups: HashMap<EventKind, HandlerGroup>,
    pool: WorkerPool,
    stats: Arc<GcStats>,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => {
                    warn!("stop event listener by closed channel");
                    break;
                }
            },
        };
        stats.events.fetch_add(1, Ordering::Relaxed);

        let Some(group) = groups.get_mut(&event.kind()) else {
            continue;
        };

        // previous batch of this kind must be fully done first
        group.cancel.cancel();
        group.tracker.close();
        group.tracker.wait().await;

        group.cancel = shutdown.child_token();
        group.tracker = TaskTracker::new();
        stats.batches.fetch_add(1, Ordering::Relaxed);
        debug!(
            ?event,
            handlers = group.handlers.len(),
            free_workers = pool.available(),
            "GC: dispatching event"
        );

        for handler in &group.handlers {
            let task = handler(group.cancel.clone(), event);
            if !pool.submit(&group.tracker, task) {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(?event, "could not submit GC job to worker pool");
            }
        }
    }

    for group in groups.values() {
        group.cancel.cancel();
        group.tracker.close();
        group.tracker.wait().await;
    }
    debug!("GC: event listener stopped");
}

async fn tick_remover(
    shutdown: CancellationToken,
    interval: Duration,
    remover: Remover,
    stats: Arc<GcStats>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let remover = Arc::clone(&remover);
        if let Err(e) = tokio::task::spawn_blocking(move || remover()).await {
            error!(error = %e, "GC remover panicked");
        }
        stats.remover_runs.fetch_add(1, Ordering::Relaxed);
    }
    debug!("GC: remover stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Step {
        Start(Epoch),
        End { epoch: Epoch, canceled: bool },
    }

    fn recording_handler(log: Arc<Mutex<Vec<Step>>>) -> EventHandler {
        Arc::new(move |token, event| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                let Event::NewEpoch(epoch) = event;
                log.lock().push(Step::Start(epoch));
                let canceled = tokio::select! {
                    () = token.cancelled() => true,
                    () = tokio::time::sleep(Duration::from_millis(50)) => false,
                };
                log.lock().push(Step::End { epoch, canceled });
            })
        })
    }

    fn prm(handlers: Vec<EventHandler>, remover: Remover) -> GcPrm {
        GcPrm {
            remover_interval: Duration::from_millis(10),
            remover,
            handlers: HashMap::from([(EventKind::NewEpoch, handlers)]),
            event_capacity: 4,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batches_of_one_kind_never_overlap() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = vec![
            recording_handler(Arc::clone(&log)),
            recording_handler(Arc::clone(&log)),
        ];
        let gc = Gc::start(prm(handlers, Arc::new(|| {})));

        assert!(gc.notify(Event::NewEpoch(1)).await);
        wait_until(|| log.lock().len() == 2).await;
        assert!(gc.notify(Event::NewEpoch(2)).await);

        wait_until(|| {
            log.lock()
                .iter()
                .filter(|s| matches!(s, Step::End { epoch: 2, .. }))
                .count()
                == 2
        })
        .await;
        gc.stop().await;

        let log = log.lock().clone();
        let last_end_1 = log
            .iter()
            .rposition(|s| matches!(s, Step::End { epoch: 1, .. }))
            .unwrap();
        let first_start_2 = log.iter().position(|s| *s == Step::Start(2)).unwrap();
        assert!(last_end_1 < first_start_2, "batches interleaved: {log:?}");

        // the first batch was interrupted by the second event
        assert!(log.contains(&Step::End {
            epoch: 1,
            canceled: true
        }));
        assert!(log.contains(&Step::End {
            epoch: 2,
            canceled: false
        }));
        assert_eq!(gc.stats().batches, 2);
        assert_eq!(gc.stats().rejected, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remover_ticks_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let gc = Gc::start(prm(
            Vec::new(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        wait_until(|| runs.load(Ordering::SeqCst) >= 3).await;
        gc.stop().await;

        let after_stop = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
        assert!(!gc.notify(Event::NewEpoch(1)).await);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_batch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let gc = Gc::start(GcPrm {
            remover_interval: Duration::from_secs(3600),
            ..prm(vec![recording_handler(Arc::clone(&log))], Arc::new(|| {}))
        });

        assert!(gc.notify(Event::NewEpoch(7)).await);
        wait_until(|| log.lock().len() == 1).await;
        gc.stop().await;

        assert_eq!(
            *log.lock(),
            vec![
                Step::Start(7),
                Step::End {
                    epoch: 7,
                    canceled: true
                }
            ]
        );
    }
}
