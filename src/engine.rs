use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::batcher::{FlushTrigger, OutboundBatcher};
use crate::classifier::{Classifier, ParserContext};
use crate::compression::decompress_events;
use crate::model::{LogEvent, TransmissionEvent};
use crate::roster::RosterState;
use crate::sequencer::{apply_retention_cap, merge_events};
use crate::settings::EngineSettings;
use crate::spree::{flatten_sprees, group_killing_sprees, SpreeSettings};
use crate::store::{KeyValueStore, LOGS_KEY};
use crate::sync::{tag_received, SyncPageSink, SyncReconciler, SyncTransport};
use crate::tailer::{spawn_tail_watch, LogTailer, TailRead};
use crate::timestamp::now_millis;
use crate::transport::{ClientMessage, InboundMessage, LogBatch, SyncLogsPage};
use crate::validation::{validate_batch, validate_compressed_payload};

const VIEW_CHANNEL_CAPACITY: usize = 16;
const MIN_SENT_LEDGER_CAPACITY: usize = 1_000;

pub type EventView = Arc<Vec<LogEvent>>;

struct EngineState {
    /// Flat, deduplicated, timestamp-ordered canonical set.
    events: Vec<LogEvent>,
    context: ParserContext,
    sent: SentLedger,
}

/// Bounded memory of local event ids already handed to the batcher, oldest
/// forgotten first.
struct SentLedger {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SentLedger {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(forgotten) = self.order.pop_front() {
                self.ids.remove(&forgotten);
            }
        }
    }
}

/// Owns the canonical event set and wires tailing, classification, batching
/// and peer sync around it.
pub struct Engine {
    settings: EngineSettings,
    spree: SpreeSettings,
    classifier: Classifier,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<EngineState>,
    batcher: Arc<OutboundBatcher>,
    reconciler: Arc<SyncReconciler>,
    roster: std::sync::Mutex<RosterState>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    views: broadcast::Sender<EventView>,
    tailer: Option<Arc<LogTailer>>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn KeyValueStore>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Arc<Self> {
        let (views, _) = broadcast::channel(VIEW_CHANNEL_CAPACITY);
        let tailer = settings
            .log_path
            .as_ref()
            .map(|log_path| Arc::new(LogTailer::new(log_path)));

        Arc::new(Self {
            spree: settings.spree_settings(),
            classifier: Classifier::new(settings.regex_budget()),
            batcher: OutboundBatcher::new(settings.batch_settings(), outbound.clone()),
            reconciler: SyncReconciler::new(settings.sync_settings(), Arc::clone(&store)),
            state: Mutex::new(EngineState {
                events: Vec::new(),
                context: ParserContext::new(settings.user_id.clone()),
                sent: SentLedger::new(settings.max_events.max(MIN_SENT_LEDGER_CAPACITY)),
            }),
            roster: std::sync::Mutex::new(RosterState::default()),
            store,
            outbound,
            views,
            tailer,
            settings,
        })
    }

    /// Loads the persisted canonical set and sync cursors.
    pub async fn restore(&self) -> Result<usize, String> {
        let restored = match self.store.get(LOGS_KEY).await? {
            Some(stored) => serde_json::from_value::<Vec<LogEvent>>(stored)
                .map_err(|error| format!("Failed to parse stored logs: {error}"))?,
            None => Vec::new(),
        };

        let count = {
            let mut state = self.state.lock().await;
            let mut events = merge_events(Vec::new(), flatten_sprees(restored));
            apply_retention_cap(&mut events, self.settings.max_events);
            state.events = events;
            self.broadcast_view(&state.events);
            state.events.len()
        };

        if let Err(error) = self.reconciler.load().await {
            tracing::warn!(restore_error = %error, "Failed to restore sync cursors");
        }

        tracing::info!(events = count, "Restored canonical log set");
        Ok(count)
    }

    /// Classifies freshly tailed lines, merges new events and queues the ones
    /// never sent before for friends and groups. Returns how many new events
    /// were added.
    ///
    /// Once the set is full, lines older than its oldest event are skipped:
    /// the cap would evict them anyway, and they were sent before eviction.
    pub async fn ingest_lines(&self, lines: &[String]) -> usize {
        let (new_events, outgoing, profile_change) = {
            let mut state = self.state.lock().await;
            let EngineState { events, context, sent } = &mut *state;

            let retention_floor = if events.len() >= self.settings.max_events {
                events.first().map(|oldest| oldest.timestamp)
            } else {
                None
            };

            let mut new_events: Vec<LogEvent> = Vec::new();
            {
                let known_ids: HashSet<&str> = events.iter().map(|event| event.id.as_str()).collect();
                for line in lines {
                    let Some(event) = self.classifier.classify(line, context) else {
                        continue;
                    };
                    if retention_floor.is_some_and(|floor| event.timestamp < floor) {
                        continue;
                    }
                    if known_ids.contains(event.id.as_str())
                        || new_events.iter().any(|existing| existing.id == event.id)
                    {
                        continue;
                    }
                    new_events.push(event);
                }
            }

            let outgoing: Vec<LogEvent> = new_events
                .iter()
                .filter(|event| !sent.contains(&event.id))
                .cloned()
                .collect();
            for event in &outgoing {
                sent.insert(event.id.clone());
            }

            let profile_change = context.take_profile_change();
            if !new_events.is_empty() {
                let merged = merge_events(std::mem::take(events), new_events.clone());
                *events = merged;
                apply_retention_cap(events, self.settings.max_events);
                self.persist_events(events).await;
                self.broadcast_view(events);
            }

            (new_events, outgoing, profile_change)
        };

        if let Some(profile_change) = profile_change {
            tracing::info!(display_name = %profile_change.display_name, "Local player profile changed");
            self.send_outbound(ClientMessage::UpdateProfile {
                display_name: profile_change.display_name,
                player_id: profile_change.player_id,
            });
        }

        if !new_events.is_empty() {
            tracing::debug!(
                count = new_events.len(),
                outgoing = outgoing.len(),
                "Classified new log events"
            );
            self.batcher.enqueue(&outgoing);
        }
        new_events.len()
    }

    pub async fn apply_tail_read(&self, read: TailRead) -> usize {
        match read {
            TailRead::Unchanged => 0,
            TailRead::Appended(lines) => self.ingest_lines(&lines).await,
            TailRead::Truncated(lines) => {
                self.reset_for_truncation().await;
                self.ingest_lines(&lines).await
            }
        }
    }

    /// Drops locally produced events after the game log was truncated or
    /// rotated; peer events are kept since the file cannot rebuild them.
    /// Dropped ids are remembered as sent so the re-read does not resend them.
    pub async fn reset_for_truncation(&self) {
        let mut state = self.state.lock().await;
        let EngineState { events, context, sent } = &mut *state;
        let local_user_id = context.source_user_id.clone();

        let (kept, dropped): (Vec<LogEvent>, Vec<LogEvent>) = std::mem::take(events)
            .into_iter()
            .partition(|event| event.source_user_id.is_some() && event.source_user_id != local_user_id);
        *events = kept;
        tracing::info!(dropped = dropped.len(), "Game log truncated, rebuilding local events");
        for event in dropped {
            sent.insert(event.id);
        }

        self.persist_events(events).await;
        self.broadcast_view(events);
    }

    /// Empties the canonical set and ignores everything already in the file.
    pub async fn clear_log(&self) -> Result<(), String> {
        {
            let mut state = self.state.lock().await;
            state.events.clear();
            state.context.only_process_after = Some(now_millis());
            self.store
                .set(LOGS_KEY, serde_json::Value::Array(Vec::new()))
                .await?;
            self.broadcast_view(&state.events);
        }

        if let Some(tailer) = self.tailer.as_ref() {
            tailer.reset().await;
        }
        tracing::info!("Cleared log");
        Ok(())
    }

    /// Validates, tags and merges events received from a peer or the server.
    pub async fn receive_remote(
        &self,
        events: Vec<TransmissionEvent>,
        sender_id: Option<&str>,
    ) -> Result<usize, String> {
        validate_batch(&events).map_err(|error| format!("Rejected inbound batch: {error}"))?;
        if events.is_empty() {
            return Ok(0);
        }

        let incoming = flatten_sprees(tag_received(events, sender_id));
        let mut state = self.state.lock().await;
        let before = state.events.len();

        let mut merged = merge_events(std::mem::take(&mut state.events), incoming);
        apply_retention_cap(&mut merged, self.settings.max_events);
        state.events = merged;
        self.persist_events(&state.events).await;
        self.broadcast_view(&state.events);

        Ok(state.events.len().saturating_sub(before))
    }

    pub async fn receive_batch(&self, batch: LogBatch) -> Result<usize, String> {
        let events = if batch.compressed {
            let payload = batch.compressed_data.as_deref().unwrap_or_default();
            validate_compressed_payload(payload)
                .map_err(|error| format!("Rejected compressed batch: {error}"))?;
            decompress_events(payload).map_err(|error| format!("Failed to decompress batch: {error}"))?
        } else {
            batch.logs
        };

        self.receive_remote(events, batch.from_user_id.as_deref()).await
    }

    /// Routes one server push.
    pub async fn handle_inbound(self: &Arc<Self>, message: InboundMessage, transport: Arc<dyn SyncTransport>) {
        let result = match message {
            InboundMessage::Log { log, from_user_id } => {
                self.receive_remote(vec![log], from_user_id.as_deref()).await.map(|_| ())
            }
            InboundMessage::BatchLogs(batch) | InboundMessage::BatchGroupLogs(batch) => {
                self.receive_batch(batch).await.map(|_| ())
            }
            InboundMessage::SyncLogs(page) => {
                let sender_id = page.from_user_id.clone();
                let result = self.receive_remote(page.logs, sender_id.as_deref()).await;
                if let (Ok(_), Some(sender_id)) = (&result, sender_id.as_deref()) {
                    self.reconciler.record_received(sender_id).await;
                }
                result.map(|_| ())
            }
            InboundMessage::PeerOnline { user_id } => {
                self.update_roster(|roster| roster.set_presence(&user_id, true));
                self.spawn_reconcile(user_id, transport);
                Ok(())
            }
            InboundMessage::PeerOffline { user_id } => {
                self.update_roster(|roster| roster.set_presence(&user_id, false));
                Ok(())
            }
            InboundMessage::FriendsList { friends } => {
                self.update_roster(|roster| roster.apply_friends(friends));
                Ok(())
            }
            InboundMessage::GroupsList { groups } => {
                let group_ids = self.update_roster(|roster| {
                    roster.apply_groups(groups);
                    roster.group_ids()
                });
                if let Some(group_ids) = group_ids {
                    self.batcher.set_groups(group_ids);
                }
                Ok(())
            }
            InboundMessage::GroupMembers { group_id, members } => {
                self.update_roster(|roster| roster.apply_group_members(&group_id, members));
                Ok(())
            }
            InboundMessage::Registered { .. } => Ok(()),
            InboundMessage::Error { message, code } => {
                tracing::warn!(server_message = %message, code = ?code, "Server reported an error");
                Ok(())
            }
            InboundMessage::Unknown => Ok(()),
        };

        if let Err(error) = result {
            tracing::warn!(inbound_error = %error, "Dropped inbound message");
        }
    }

    fn spawn_reconcile(self: &Arc<Self>, peer_id: String, transport: Arc<dyn SyncTransport>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let events = engine.events_snapshot().await;
            match engine
                .reconciler
                .reconcile_peer(&peer_id, &events, transport.as_ref(), &*engine)
                .await
            {
                Ok(summary) if !summary.complete => {
                    tracing::warn!(peer_id = %peer_id, pages = summary.pages, "Peer sync ended before its last page");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        peer_id = %peer_id,
                        sync_error = %error,
                        retryable = error.is_retryable(),
                        "Failed to reconcile logs with peer"
                    );
                }
            }
        });
    }

    fn update_roster<T>(&self, apply: impl FnOnce(&mut RosterState) -> T) -> Option<T> {
        match self.roster.lock() {
            Ok(mut roster) => Some(apply(&mut roster)),
            Err(error) => {
                tracing::error!(lock_error = %error, "Roster state is poisoned");
                None
            }
        }
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.update_roster(|roster| roster.group_ids()).unwrap_or_default()
    }

    /// Aggregated view: the canonical set with killing sprees grouped.
    pub async fn view(&self) -> Vec<LogEvent> {
        let state = self.state.lock().await;
        group_killing_sprees(&state.events, &self.spree)
    }

    pub async fn events_snapshot(&self) -> Vec<LogEvent> {
        self.state.lock().await.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventView> {
        self.views.subscribe()
    }

    pub fn flush_outbound(&self) -> usize {
        self.batcher.flush(FlushTrigger::Manual)
    }

    /// Reads the current file, then follows it. `None` when no log path is set.
    pub async fn start_log_watch(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let tailer = Arc::clone(self.tailer.as_ref()?);

        match tailer.read_new_lines().await {
            Ok(read) => {
                let added = self.apply_tail_read(read).await;
                tracing::info!(path = %tailer.path().display(), added, "Ingested existing game log");
            }
            Err(error) => tracing::warn!(read_error = %error, "Failed initial game log read"),
        }

        let (watch_handle, mut reads) = spawn_tail_watch(tailer, self.settings.poll_interval());
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(read) = reads.recv().await {
                engine.apply_tail_read(read).await;
            }
            watch_handle.abort();
        }))
    }

    async fn persist_events(&self, events: &[LogEvent]) {
        let serialized = match serde_json::to_value(events) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(persist_error = %error, "Failed to serialize canonical log set");
                return;
            }
        };
        if let Err(error) = self.store.set(LOGS_KEY, serialized).await {
            tracing::warn!(persist_error = %error, "Failed to persist canonical log set");
        }
    }

    fn broadcast_view(&self, events: &[LogEvent]) {
        if self.views.receiver_count() == 0 {
            return;
        }
        let view = group_killing_sprees(events, &self.spree);
        if self.views.send(Arc::new(view)).is_err() {
            tracing::debug!("No view subscribers");
        }
    }

    fn send_outbound(&self, message: ClientMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("Outbound channel closed");
        }
    }
}

#[async_trait]
impl SyncPageSink for Engine {
    async fn accept_page(&self, peer_id: &str, page: SyncLogsPage) {
        let sender_id = page.from_user_id.unwrap_or_else(|| peer_id.to_string());
        if let Err(error) = self.receive_remote(page.logs, Some(&sender_id)).await {
            tracing::warn!(peer_id = %peer_id, sync_error = %error, "Rejected sync page");
        }
    }
}
