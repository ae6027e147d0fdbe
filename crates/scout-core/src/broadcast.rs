//! Per-task publish/subscribe.
//!
//! Each task gets one channel: producers push into a bounded `mpsc`, and a fan-out
//! task appends every event to a bounded backlog and forwards it to each
//! subscriber's own bounded queue. A subscriber that cannot keep up is dropped
//! rather than slowing the producer; it can resubscribe and replay the backlog.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::{debug, warn};

use crate::config::EventsConfig;
use crate::domain::{TaskEvent, TaskId};
use crate::error::BroadcastError;

#[derive(Debug)]
struct FanOut {
    backlog: VecDeque<TaskEvent>,
    subscribers: Vec<Subscriber>,
    /// The producer side is gone and every queued event has been forwarded.
    drained: bool,
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<TaskEvent>,
    lagged: Arc<AtomicBool>,
}

#[derive(Debug)]
struct TaskChannel {
    producer: Mutex<Option<mpsc::Sender<TaskEvent>>>,
    fan_out: Arc<Mutex<FanOut>>,
}

/// Registry of per-task event channels.
#[derive(Debug)]
pub struct EventBroadcaster {
    channels: DashMap<TaskId, Arc<TaskChannel>>,
    config: EventsConfig,
}

impl EventBroadcaster {
    pub fn new(config: EventsConfig) -> Self {
        Self {
            channels: DashMap::new(),
            config,
        }
    }

    /// Create the channel for `task_id` and start its fan-out task.
    ///
    /// Must be called from within a tokio runtime. Opening an existing channel is a
    /// no-op.
    pub fn open(&self, task_id: TaskId) {
        self.channels.entry(task_id).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.config.producer_capacity.max(1));
            let fan_out = Arc::new(Mutex::new(FanOut {
                backlog: VecDeque::with_capacity(self.config.backlog),
                subscribers: Vec::new(),
                drained: false,
            }));
            tokio::spawn(run_fan_out(
                task_id,
                rx,
                Arc::clone(&fan_out),
                self.config.backlog,
            ));
            debug!(task_id = %task_id, "event channel opened");
            Arc::new(TaskChannel {
                producer: Mutex::new(Some(tx)),
                fan_out,
            })
        });
    }

    /// Queue `event` for delivery, waiting at most `publish_timeout` for room.
    pub async fn publish(&self, task_id: TaskId, event: TaskEvent) -> Result<(), BroadcastError> {
        let sender = {
            let channel = self.channel(task_id)?;
            let producer = channel.producer.lock();
            producer.clone().ok_or(BroadcastError::Closed(task_id))?
        };
        let waited = self.config.publish_timeout();
        sender
            .send_timeout(event, waited)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => {
                    warn!(task_id = %task_id, "event publish timed out");
                    BroadcastError::Timeout { task_id, waited }
                }
                SendTimeoutError::Closed(_) => BroadcastError::Closed(task_id),
            })
    }

    /// Replay the backlog, then receive live events until the channel closes.
    ///
    /// Replay and registration happen under the fan-out lock, so no event is missed
    /// or seen twice.
    pub fn subscribe(&self, task_id: TaskId) -> Result<EventSubscription, BroadcastError> {
        let channel = self.channel(task_id)?;
        let mut fan_out = channel.fan_out.lock();

        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1) + fan_out.backlog.len());
        for event in &fan_out.backlog {
            // capacity covers the whole backlog
            let _ = tx.try_send(event.clone());
        }
        let lagged = Arc::new(AtomicBool::new(false));
        if !fan_out.drained {
            fan_out.subscribers.push(Subscriber {
                tx,
                lagged: Arc::clone(&lagged),
            });
        }
        debug!(
            task_id = %task_id,
            replayed = fan_out.backlog.len(),
            live = !fan_out.drained,
            "subscriber attached"
        );
        Ok(EventSubscription {
            task_id,
            rx,
            lagged,
        })
    }

    /// Stop accepting events. Subscribers end after the queued events are delivered.
    pub fn close(&self, task_id: TaskId) {
        if let Some(channel) = self.channels.get(&task_id) {
            channel.producer.lock().take();
            debug!(task_id = %task_id, "event channel closed");
        }
    }

    /// Close and forget the channel; later calls report `UnknownTask`.
    pub fn remove(&self, task_id: TaskId) {
        self.close(task_id);
        self.channels.remove(&task_id);
    }

    pub fn is_open(&self, task_id: TaskId) -> bool {
        self.channels
            .get(&task_id)
            .is_some_and(|channel| channel.producer.lock().is_some())
    }

    pub fn backlog(&self, task_id: TaskId) -> Vec<TaskEvent> {
        self.channels.get(&task_id).map_or_else(Vec::new, |channel| {
            channel.fan_out.lock().backlog.iter().cloned().collect()
        })
    }

    pub fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.channels
            .get(&task_id)
            .map_or(0, |channel| channel.fan_out.lock().subscribers.len())
    }

    fn channel(&self, task_id: TaskId) -> Result<Arc<TaskChannel>, BroadcastError> {
        self.channels
            .get(&task_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(BroadcastError::UnknownTask(task_id))
    }
}

async fn run_fan_out(
    task_id: TaskId,
    mut rx: mpsc::Receiver<TaskEvent>,
    fan_out: Arc<Mutex<FanOut>>,
    backlog_cap: usize,
) {
    while let Some(event) = rx.recv().await {
        let mut state = fan_out.lock();
        if backlog_cap > 0 {
            if state.backlog.len() == backlog_cap {
                state.backlog.pop_front();
            }
            state.backlog.push_back(event.clone());
        }
        state.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(task_id = %task_id, seq = event.seq, "subscriber too slow; dropping it");
                sub.lagged.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    // producer gone: ending every subscriber stream
    let mut state = fan_out.lock();
    state.drained = true;
    state.subscribers.clear();
    debug!(task_id = %task_id, "event fan-out finished");
}

/// Live view of one task's events: backlog first, then live events.
#[derive(Debug)]
pub struct EventSubscription {
    task_id: TaskId,
    rx: mpsc::Receiver<TaskEvent>,
    lagged: Arc<AtomicBool>,
}

impl EventSubscription {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// `None` once the channel is closed and drained, or this subscriber was dropped.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    /// The broadcaster dropped this subscriber for falling behind. Its stream ends
    /// early, before the terminal event; resubscribe to replay the backlog.
    pub fn lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }
}

impl Stream for EventSubscription {
    type Item = TaskEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
