// crates/server/src/jobs/bus.rs
//! Per-job fan-out of [`JobEvent`]s.
//!
//! Each job gets a topic: a bounded `broadcast` channel for live delivery
//! plus a bounded replay buffer. Record mutation, replay push and send all
//! happen under the topic lock, and so does subscription setup, so a new
//! subscriber sees every event exactly once: either folded into its opening
//! snapshot or delivered live.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use docjobs_core::{JobEvent, JobRecord, Stage, TransitionError};
use tokio::sync::broadcast::{self, error::RecvError};

use super::store::JobStore;
use crate::metrics::SubscriberGauge;

/// Events kept per job for late subscribers.
pub const DEFAULT_REPLAY_CAPACITY: usize = 256;
/// Live channel depth before a slow subscriber starts losing events.
pub const DEFAULT_LIVE_CAPACITY: usize = 1024;

struct Topic {
    tx: broadcast::Sender<JobEvent>,
    replay: Mutex<VecDeque<JobEvent>>,
}

impl Topic {
    fn lock(&self) -> MutexGuard<'_, VecDeque<JobEvent>> {
        match self.replay.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Mutex poisoned on job topic");
                poisoned.into_inner()
            }
        }
    }

    fn push(&self, replay: &mut VecDeque<JobEvent>, capacity: usize, event: JobEvent) {
        if replay.len() == capacity {
            replay.pop_front();
        }
        replay.push_back(event.clone());
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

pub struct EventBus {
    store: Arc<JobStore>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    replay_capacity: usize,
    live_capacity: usize,
}

impl EventBus {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self::with_capacity(store, DEFAULT_REPLAY_CAPACITY, DEFAULT_LIVE_CAPACITY)
    }

    pub fn with_capacity(store: Arc<JobStore>, replay_capacity: usize, live_capacity: usize) -> Self {
        Self {
            store,
            topics: RwLock::new(HashMap::new()),
            replay_capacity: replay_capacity.max(1),
            live_capacity: live_capacity.max(1),
        }
    }

    /// Create the topic for a newly submitted job.
    pub fn open(&self, job_id: &str) {
        let (tx, _) = broadcast::channel(self.live_capacity);
        let topic = Arc::new(Topic {
            tx,
            replay: Mutex::new(VecDeque::with_capacity(self.replay_capacity)),
        });
        match self.topics.write() {
            Ok(mut topics) => {
                topics.insert(job_id.to_string(), topic);
            }
            Err(e) => tracing::error!("RwLock poisoned writing topics: {e}"),
        }
    }

    /// Drop a job's topic. Open subscriptions end once drained.
    pub fn close(&self, job_id: &str) {
        match self.topics.write() {
            Ok(mut topics) => {
                topics.remove(job_id);
            }
            Err(e) => tracing::error!("RwLock poisoned writing topics: {e}"),
        }
    }

    /// Publish an event as-is. Unknown jobs are a logged no-op.
    pub fn publish(&self, job_id: &str, event: JobEvent) {
        let Some(topic) = self.topic(job_id) else {
            tracing::warn!(job_id = %job_id, "publish to unknown job dropped");
            return;
        };
        let mut replay = topic.lock();
        topic.push(&mut replay, self.replay_capacity, event);
    }

    /// Mutate the job's record and publish the resulting state as a
    /// `progress` event, atomically with respect to subscribers.
    ///
    /// Returns `Ok(None)` for unknown jobs. A rejected mutation publishes
    /// nothing.
    pub fn publish_state<F>(
        &self,
        job_id: &str,
        elapsed_ms: Option<u64>,
        mutate: F,
    ) -> Result<Option<JobRecord>, TransitionError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), TransitionError>,
    {
        let (Some(topic), Some(slot)) = (self.topic(job_id), self.store.get(job_id)) else {
            tracing::warn!(job_id = %job_id, "state update for unknown job dropped");
            return Ok(None);
        };
        let mut replay = topic.lock();
        let record = slot.update(mutate)?;
        let mut update = record.to_update();
        update.elapsed_ms = elapsed_ms;
        topic.push(&mut replay, self.replay_capacity, JobEvent::Progress(update));
        Ok(Some(record))
    }

    /// Subscribe to a job: a snapshot of the current record first, then
    /// the buffered log lines, then live events.
    pub fn subscribe(&self, job_id: &str) -> Option<Subscription> {
        let topic = self.topic(job_id)?;
        let replay = topic.lock();
        let record = self.store.snapshot(job_id)?;

        let mut backlog = VecDeque::with_capacity(replay.len() + 1);
        backlog.push_back(JobEvent::Snapshot(record.to_update()));
        backlog.extend(replay.iter().filter(|e| e.is_log()).cloned());
        let rx = topic.tx.subscribe();
        drop(replay);

        Some(Subscription {
            job_id: job_id.to_string(),
            store: Arc::clone(&self.store),
            backlog,
            rx,
            terminal_seen: false,
            floor: (0, 0),
            _gauge: SubscriberGauge::acquire(),
        })
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.topic(job_id)
            .map(|topic| topic.tx.receiver_count())
            .unwrap_or(0)
    }

    fn topic(&self, job_id: &str) -> Option<Arc<Topic>> {
        match self.topics.read() {
            Ok(topics) => topics.get(job_id).cloned(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading topics: {e}");
                None
            }
        }
    }
}

/// One subscriber's view of a job topic. Dropping it unsubscribes.
pub struct Subscription {
    job_id: String,
    store: Arc<JobStore>,
    backlog: VecDeque<JobEvent>,
    rx: broadcast::Receiver<JobEvent>,
    terminal_seen: bool,
    /// (stage rank, percent) of the last state delivered.
    floor: (u8, u8),
    _gauge: SubscriberGauge,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event, or `None` once the stream is over.
    ///
    /// After the terminal state has been yielded only log lines that are
    /// already queued are delivered. A subscriber that lagged behind the
    /// live channel gets a fresh snapshot in place of what it missed; state
    /// events still queued behind that snapshot are older than it and are
    /// dropped, so stage and percent never go backwards.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(self.observe(event));
        }

        if self.terminal_seen {
            return match self.rx.try_recv() {
                Ok(event) if event.is_log() => Some(event),
                _ => None,
            };
        }

        loop {
            match self.rx.recv().await {
                Ok(event) if self.is_stale(&event) => {
                    tracing::debug!(job_id = %self.job_id, "dropping stale state event");
                }
                Ok(event) => return Some(self.observe(event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        skipped,
                        "Subscriber lagged, re-sending snapshot"
                    );
                    let record = self.store.snapshot(&self.job_id)?;
                    return Some(self.observe(JobEvent::Snapshot(record.to_update())));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn is_stale(&self, event: &JobEvent) -> bool {
        let (rank, percent) = self.floor;
        event.state().is_some_and(|s| {
            s.stage.is_some_and(|stage| stage.rank() < rank)
                || s.percent.is_some_and(|p| p < percent)
        })
    }

    fn observe(&mut self, event: JobEvent) -> JobEvent {
        if let Some(state) = event.state() {
            if let Some(stage) = state.stage {
                self.floor.0 = self.floor.0.max(Stage::rank(stage));
            }
            if let Some(percent) = state.percent {
                self.floor.1 = self.floor.1.max(percent);
            }
        }
        if event.is_terminal() {
            self.terminal_seen = true;
        }
        event
    }
}
