use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::compression::{compress_events, CompressionThresholds};
use crate::model::{LogEvent, TransmissionEvent};
use crate::transport::{ClientMessage, LogBatch};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Destination {
    Friends,
    Group(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    SizeThreshold,
    IdleTimer,
    Manual,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub size_threshold: usize,
    pub idle_delay: Duration,
    pub compression: CompressionThresholds,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            size_threshold: 8,
            idle_delay: Duration::from_millis(2_500),
            compression: CompressionThresholds::default(),
        }
    }
}

#[derive(Default)]
struct BatchState {
    buffers: BTreeMap<Destination, Vec<TransmissionEvent>>,
    group_ids: Vec<String>,
    idle_timer: Option<JoinHandle<()>>,
    /// Bumped on every flush; a timer armed under an older value is stale.
    timer_generation: u64,
}

impl BatchState {
    fn pending_len(&self) -> usize {
        self.buffers.values().map(Vec::len).max().unwrap_or(0)
    }
}

/// Buffers freshly classified events per destination and ships them as
/// `batch_logs` / `batch_group_logs` on size or idle.
pub struct OutboundBatcher {
    settings: BatchSettings,
    sink: mpsc::UnboundedSender<ClientMessage>,
    state: Mutex<BatchState>,
}

impl OutboundBatcher {
    pub fn new(settings: BatchSettings, sink: mpsc::UnboundedSender<ClientMessage>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            sink,
            state: Mutex::new(BatchState::default()),
        })
    }

    /// Replaces the known groups. Buffers of groups that went away are dropped;
    /// new groups only receive events enqueued from now on.
    pub fn set_groups(&self, group_ids: Vec<String>) {
        let Ok(mut state) = self.state.lock() else {
            tracing::error!("Outbound batch state is poisoned");
            return;
        };

        state.buffers.retain(|destination, _| match destination {
            Destination::Friends => true,
            Destination::Group(group_id) => group_ids.contains(group_id),
        });
        state.group_ids = group_ids;
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().map(|state| state.pending_len()).unwrap_or(0)
    }

    pub fn enqueue(self: &Arc<Self>, events: &[LogEvent]) {
        if events.is_empty() {
            return;
        }

        let reached_threshold = {
            let Ok(mut state) = self.state.lock() else {
                tracing::error!("Outbound batch state is poisoned");
                return;
            };

            let group_ids = state.group_ids.clone();
            for event in events {
                let wire = event.to_transmission();
                for group_id in &group_ids {
                    state
                        .buffers
                        .entry(Destination::Group(group_id.clone()))
                        .or_default()
                        .push(wire.clone());
                }
                state.buffers.entry(Destination::Friends).or_default().push(wire);
            }

            if state.pending_len() >= self.settings.size_threshold {
                true
            } else {
                if state.idle_timer.is_none() {
                    let generation = state.timer_generation;
                    state.idle_timer = Some(self.arm_idle_timer(generation));
                }
                false
            }
        };

        if reached_threshold {
            self.flush(FlushTrigger::SizeThreshold);
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let batcher: Weak<Self> = Arc::downgrade(self);
        let delay = self.settings.idle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(batcher) = batcher.upgrade() {
                batcher.fire_idle_timer(generation);
            }
        })
    }

    /// Idle timer expiry. A timer that woke while another flush held the lock
    /// belongs to an older generation and does nothing.
    fn fire_idle_timer(&self, generation: u64) -> usize {
        self.drain_and_send(FlushTrigger::IdleTimer, Some(generation))
    }

    /// Sends every non-empty buffer and cancels the idle timer. Returns the
    /// number of messages handed to the sink.
    pub fn flush(&self, trigger: FlushTrigger) -> usize {
        self.drain_and_send(trigger, None)
    }

    fn drain_and_send(&self, trigger: FlushTrigger, timer_generation: Option<u64>) -> usize {
        let drained: Vec<(Destination, Vec<TransmissionEvent>)> = {
            let Ok(mut state) = self.state.lock() else {
                tracing::error!("Outbound batch state is poisoned");
                return 0;
            };

            if timer_generation.is_some_and(|generation| generation != state.timer_generation) {
                tracing::trace!("Ignoring stale idle timer");
                return 0;
            }
            state.timer_generation = state.timer_generation.wrapping_add(1);

            if let Some(timer) = state.idle_timer.take() {
                if trigger != FlushTrigger::IdleTimer {
                    timer.abort();
                }
            }

            state
                .buffers
                .iter_mut()
                .filter(|(_, buffer)| !buffer.is_empty())
                .map(|(destination, buffer)| (destination.clone(), std::mem::take(buffer)))
                .collect()
        };

        let mut sent = 0;
        for (destination, events) in drained {
            let event_count = events.len();
            let message = self.build_message(destination, events);
            if self.sink.send(message).is_err() {
                tracing::warn!(event_count, "Outbound sink closed, dropping batch");
                continue;
            }
            sent += 1;
        }

        if sent > 0 {
            tracing::debug!(trigger = ?trigger, messages = sent, "Flushed outbound batches");
        }
        sent
    }

    fn build_message(&self, destination: Destination, events: Vec<TransmissionEvent>) -> ClientMessage {
        let serialized_bytes = serde_json::to_vec(&events)
            .map(|bytes| bytes.len())
            .unwrap_or(0);

        let mut batch = LogBatch::default();
        if self
            .settings
            .compression
            .should_compress(events.len(), serialized_bytes)
        {
            match compress_events(&events) {
                Ok(compressed_data) => {
                    batch.compressed = true;
                    batch.compressed_data = Some(compressed_data);
                }
                Err(error) => {
                    tracing::warn!(compress_error = %error, "Failed to compress batch, sending plain");
                    batch.logs = events;
                }
            }
        } else {
            batch.logs = events;
        }

        match destination {
            Destination::Friends => ClientMessage::BatchLogs(batch),
            Destination::Group(group_id) => {
                batch.group_id = Some(group_id);
                ClientMessage::BatchGroupLogs(batch)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchSettings, FlushTrigger, OutboundBatcher};
    use crate::compression::decompress_events;
    use crate::model::fixtures::event_at;
    use crate::model::LogEvent;
    use crate::transport::ClientMessage;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn events(count: usize) -> Vec<LogEvent> {
        (0..count)
            .map(|index| event_at(&format!("e{index}"), "2024-06-07T12:00:00.000Z"))
            .collect()
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn friend_ids(message: &ClientMessage) -> Vec<String> {
        match message {
            ClientMessage::BatchLogs(batch) => batch.logs.iter().map(|event| event.id.clone()).collect(),
            other => panic!("Expected a friends batch, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nine_events_flush_eight_then_one_on_idle() {
        let (sink, mut receiver) = mpsc::unbounded_channel();
        let batcher = OutboundBatcher::new(BatchSettings::default(), sink);

        for event in events(9) {
            batcher.enqueue(std::slice::from_ref(&event));
        }

        let first = drain(&mut receiver);
        assert_eq!(first.len(), 1, "Expected one immediate friends batch");
        assert_eq!(friend_ids(&first[0]).len(), 8);
        assert_eq!(batcher.pending_len(), 1);

        tokio::time::sleep(Duration::from_millis(2_600)).await;

        let second = drain(&mut receiver);
        assert_eq!(second.len(), 1, "Expected the idle timer to flush the remainder");
        assert_eq!(friend_ids(&second[0]), vec!["e8".to_string()]);

        let mut all: Vec<String> = friend_ids(&first[0]);
        all.extend(friend_ids(&second[0]));
        all.dedup();
        assert_eq!(all.len(), 9, "No event lost or duplicated");
    }

    #[tokio::test(start_paused = true)]
    async fn fans_out_to_every_group() {
        let (sink, mut receiver) = mpsc::unbounded_channel();
        let batcher = OutboundBatcher::new(BatchSettings::default(), sink);
        batcher.set_groups(vec!["g1".to_string(), "g2".to_string()]);

        batcher.enqueue(&events(2));
        assert!(drain(&mut receiver).is_empty(), "Below threshold nothing is sent yet");

        assert_eq!(batcher.flush(FlushTrigger::Manual), 3);
        let messages = drain(&mut receiver);
        let group_ids: Vec<Option<String>> = messages
            .iter()
            .filter_map(|message| match message {
                ClientMessage::BatchGroupLogs(batch) => Some(batch.group_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(group_ids, vec![Some("g1".to_string()), Some("g2".to_string())]);
        assert!(matches!(&messages[0], ClientMessage::BatchLogs(batch) if batch.logs.len() == 2));

        assert_eq!(batcher.flush(FlushTrigger::Manual), 0, "Second flush sees empty buffers");
    }

    #[tokio::test(start_paused = true)]
    async fn manual_flush_cancels_idle_timer() {
        let (sink, mut receiver) = mpsc::unbounded_channel();
        let batcher = OutboundBatcher::new(BatchSettings::default(), sink);

        batcher.enqueue(&events(1));
        assert_eq!(batcher.flush(FlushTrigger::Manual), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(drain(&mut receiver).len(), 1, "Timer must not send an extra batch");
    }

    #[tokio::test(start_paused = true)]
    async fn timer_woken_before_a_size_flush_does_not_flush_later_events() {
        let (sink, mut receiver) = mpsc::unbounded_channel();
        let batcher = OutboundBatcher::new(BatchSettings::default(), sink);

        batcher.enqueue(&events(1));
        let armed_generation = batcher.state.lock().expect("state lock").timer_generation;
        batcher.enqueue(&events(8)[1..]);
        assert_eq!(drain(&mut receiver).len(), 1, "Size threshold flushes immediately");

        batcher.enqueue(&[event_at("late", "2024-06-07T12:00:01.000Z")]);
        assert_eq!(
            batcher.fire_idle_timer(armed_generation),
            0,
            "A timer from before the size flush must not send"
        );
        assert_eq!(batcher.pending_len(), 1);
        assert!(batcher.state.lock().expect("state lock").idle_timer.is_some());

        tokio::time::sleep(Duration::from_millis(2_600)).await;
        let flushed = drain(&mut receiver);
        assert_eq!(flushed.len(), 1, "The current timer still flushes");
        assert_eq!(friend_ids(&flushed[0]), vec!["late".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn large_batches_are_compressed() {
        let (sink, mut receiver) = mpsc::unbounded_channel();
        let settings = BatchSettings {
            size_threshold: 50,
            ..BatchSettings::default()
        };
        let batcher = OutboundBatcher::new(settings, sink);

        batcher.enqueue(&events(11));
        batcher.flush(FlushTrigger::Manual);

        let messages = drain(&mut receiver);
        let ClientMessage::BatchLogs(batch) = &messages[0] else {
            panic!("Expected a friends batch");
        };
        assert!(batch.compressed);
        assert!(batch.logs.is_empty());
        let restored = decompress_events(batch.compressed_data.as_deref().expect("payload present"))
            .expect("payload decompresses");
        assert_eq!(restored.len(), 11);
        assert_eq!(restored[10].id, "e10");
    }

    #[tokio::test(start_paused = true)]
    async fn removed_groups_lose_their_buffers() {
        let (sink, mut receiver) = mpsc::unbounded_channel();
        let batcher = OutboundBatcher::new(BatchSettings::default(), sink);
        batcher.set_groups(vec!["g1".to_string()]);
        batcher.enqueue(&events(1));

        batcher.set_groups(Vec::new());
        batcher.flush(FlushTrigger::Manual);

        let messages = drain(&mut receiver);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], ClientMessage::BatchLogs(_)));
    }
}
