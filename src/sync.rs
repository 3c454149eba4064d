use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::model::{LogEvent, TransmissionEvent};
use crate::store::{KeyValueStore, SYNC_CURSORS_KEY};
use crate::timestamp::{format_timestamp, parse_log_timestamp};
use crate::transport::{SyncLogsPage, SyncLogsRequest, TransportError};

/// Pages fetched from one peer per exchange before giving up on `hasMore`.
pub const MAX_SYNC_PAGES: usize = 50;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: usize,
    pub cursor_debounce: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            cursor_debounce: Duration::from_secs(2),
        }
    }
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn request_sync(&self, request: SyncLogsRequest) -> Result<SyncLogsPage, TransportError>;
}

/// Receives each page of a peer's events as it arrives.
#[async_trait]
pub trait SyncPageSink: Send + Sync {
    async fn accept_page(&self, peer_id: &str, page: SyncLogsPage);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub sent: usize,
    pub received: usize,
    pub pages: usize,
    /// False when paging stopped before the peer reported the end.
    pub complete: bool,
}

/// Tracks per-peer sync cursors and runs the exchange when a peer comes online.
pub struct SyncReconciler {
    settings: SyncSettings,
    store: Arc<dyn KeyValueStore>,
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
    peer_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncReconciler {
    pub fn new(settings: SyncSettings, store: Arc<dyn KeyValueStore>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            cursors: Mutex::new(HashMap::new()),
            peer_locks: Mutex::new(HashMap::new()),
            persist_task: Mutex::new(None),
        })
    }

    /// Restores cursors from the store. Unparsable entries are skipped.
    pub async fn load(&self) -> Result<usize, String> {
        let Some(stored) = self.store.get(SYNC_CURSORS_KEY).await? else {
            return Ok(0);
        };

        let raw_cursors: HashMap<String, String> = serde_json::from_value(stored)
            .map_err(|error| format!("Failed to parse stored sync cursors: {error}"))?;

        let restored: HashMap<String, DateTime<Utc>> = raw_cursors
            .into_iter()
            .filter_map(|(peer_id, raw)| match parse_log_timestamp(&raw) {
                Some(cursor) => Some((peer_id, cursor)),
                None => {
                    tracing::warn!(peer_id = %peer_id, cursor = %raw, "Skipping unparsable sync cursor");
                    None
                }
            })
            .collect();

        let count = restored.len();
        match self.cursors.lock() {
            Ok(mut cursors) => *cursors = restored,
            Err(error) => return Err(format!("Failed to restore sync cursors: {error}")),
        }
        Ok(count)
    }

    pub fn cursor(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.cursors.lock().ok()?.get(peer_id).copied()
    }

    /// Events newer than the peer's cursor, or everything for a first exchange.
    pub fn build_request(&self, peer_id: &str, events: &[LogEvent]) -> SyncLogsRequest {
        let since = self.cursor(peer_id);
        let logs: Vec<TransmissionEvent> = events
            .iter()
            .filter(|event| since.map_or(true, |cursor| event.timestamp > cursor))
            .map(LogEvent::to_transmission)
            .collect();

        SyncLogsRequest {
            target_peer_id: peer_id.to_string(),
            logs,
            since,
            limit: self.settings.page_size,
            offset: 0,
        }
    }

    /// Sends our delta to `peer_id`, then pages through whatever the peer has
    /// for us, handing every page to `sink`. Follow-up requests carry no logs.
    /// The cursor advances only when every request succeeded.
    pub async fn reconcile_peer(
        self: &Arc<Self>,
        peer_id: &str,
        events: &[LogEvent],
        transport: &dyn SyncTransport,
        sink: &dyn SyncPageSink,
    ) -> Result<SyncSummary, TransportError> {
        let peer_lock = self.peer_lock(peer_id);
        let _guard = peer_lock.lock().await;

        let mut request = self.build_request(peer_id, events);
        let mut summary = SyncSummary {
            sent: request.logs.len(),
            ..SyncSummary::default()
        };

        loop {
            let mut follow_up = SyncLogsRequest {
                target_peer_id: request.target_peer_id.clone(),
                logs: Vec::new(),
                since: request.since,
                limit: request.limit,
                offset: request.offset,
            };

            let page = transport.request_sync(request).await?;
            let page_len = page.logs.len();
            let has_more = page.has_more;
            summary.pages += 1;
            summary.received += page_len;
            sink.accept_page(peer_id, page).await;

            if !has_more {
                summary.complete = true;
                break;
            }
            if page_len == 0 {
                tracing::warn!(peer_id = %peer_id, "Peer reported more logs but sent an empty page");
                break;
            }
            if summary.pages >= MAX_SYNC_PAGES {
                tracing::warn!(peer_id = %peer_id, pages = summary.pages, "Stopped paging at the page limit");
                break;
            }

            follow_up.offset += page_len;
            request = follow_up;
        }

        self.advance_cursor(peer_id, Utc::now());
        tracing::info!(
            peer_id = %peer_id,
            sent = summary.sent,
            received = summary.received,
            pages = summary.pages,
            complete = summary.complete,
            "Reconciled logs with peer"
        );
        Ok(summary)
    }

    /// Advances the cursor after an unsolicited sync payload from `peer_id`.
    pub async fn record_received(self: &Arc<Self>, peer_id: &str) {
        let peer_lock = self.peer_lock(peer_id);
        let _guard = peer_lock.lock().await;
        self.advance_cursor(peer_id, Utc::now());
    }

    fn advance_cursor(self: &Arc<Self>, peer_id: &str, at: DateTime<Utc>) {
        match self.cursors.lock() {
            Ok(mut cursors) => {
                cursors.insert(peer_id.to_string(), at);
            }
            Err(error) => {
                tracing::error!(lock_error = %error, "Sync cursor table is poisoned");
                return;
            }
        }
        self.schedule_persist();
    }

    fn peer_lock(&self, peer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.peer_locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(peer_id.to_string()).or_default()),
            Err(error) => {
                tracing::error!(lock_error = %error, "Peer lock table is poisoned");
                Arc::new(tokio::sync::Mutex::new(()))
            }
        }
    }

    /// Coalesces cursor writes: the first change arms a timer, later changes
    /// inside the window ride along.
    fn schedule_persist(self: &Arc<Self>) {
        let Ok(mut slot) = self.persist_task.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let reconciler: Weak<Self> = Arc::downgrade(self);
        let debounce = self.settings.cursor_debounce;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(reconciler) = reconciler.upgrade() else {
                return;
            };
            if let Ok(mut slot) = reconciler.persist_task.lock() {
                slot.take();
            }
            if let Err(error) = reconciler.persist_now().await {
                tracing::warn!(persist_error = %error, "Failed to persist sync cursors");
            }
        }));
    }

    pub async fn persist_now(&self) -> Result<(), String> {
        let snapshot: serde_json::Map<String, serde_json::Value> = {
            let cursors = self
                .cursors
                .lock()
                .map_err(|error| format!("Failed to snapshot sync cursors: {error}"))?;
            cursors
                .iter()
                .map(|(peer_id, cursor)| {
                    (peer_id.clone(), serde_json::Value::String(format_timestamp(cursor)))
                })
                .collect()
        };

        self.store
            .set(SYNC_CURSORS_KEY, serde_json::Value::Object(snapshot))
            .await
    }
}

/// Rebuilds received events, attributing any without a source to the sender.
pub fn tag_received(events: Vec<TransmissionEvent>, sender_id: Option<&str>) -> Vec<LogEvent> {
    events
        .into_iter()
        .map(|event| {
            let mut event = event.into_log_event();
            if let Some(sender_id) = sender_id {
                tag_source(&mut event, sender_id);
            }
            event
        })
        .collect()
}

fn tag_source(event: &mut LogEvent, sender_id: &str) {
    if event.source_user_id.is_none() {
        event.source_user_id = Some(sender_id.to_string());
    }
    for child in event.children.iter_mut().flatten() {
        tag_source(child, sender_id);
    }
}
