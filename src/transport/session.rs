use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WebSocketError, Message};

use super::error::TransportError;
use super::pending::PendingCalls;
use super::protocol::{decode_frame, encode_message, ClientMessage, InboundMessage, SyncLogsPage, SyncLogsRequest};
use super::reconnect::{classify_close, CloseDisposition, ReconnectPolicy};
use crate::sync::SyncTransport;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const INBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
    /// The server refused the token; only a new login recovers from this.
    AuthenticationExpired,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub server_url: String,
    pub auth_token: String,
    pub user_id: String,
    pub request_timeout: Duration,
    pub send_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

enum OutboundFrame {
    Text(String),
    Close,
}

enum ConnectionOutcome {
    Shutdown,
    AuthenticationFailed,
    /// `error` carries the websocket failure when there was one; a clean
    /// close or stream end leaves it empty.
    Lost {
        was_registered: bool,
        error: Option<TransportError>,
    },
}

enum RegistrationOutcome {
    Registered,
    Rejected(String),
    Closed(Option<u16>),
}

/// Handle to the single persistent server connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Session {
    outbound: mpsc::Sender<OutboundFrame>,
    pending: Arc<PendingCalls>,
    status: watch::Receiver<ConnectionStatus>,
    request_timeout: Duration,
    send_timeout: Duration,
}

impl Session {
    /// Spawns the connection task and returns the session plus the stream of
    /// uncorrelated server pushes.
    pub fn connect(settings: TransportSettings) -> (Session, mpsc::Receiver<InboundMessage>) {
        let (outbound_sender, outbound_receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (inbound_sender, inbound_receiver) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (status_sender, status_receiver) = watch::channel(ConnectionStatus::Connecting);
        let pending = Arc::new(PendingCalls::default());

        let session = Session {
            outbound: outbound_sender,
            pending: Arc::clone(&pending),
            status: status_receiver,
            request_timeout: settings.request_timeout,
            send_timeout: settings.send_timeout,
        };

        tokio::spawn(run_connection_loop(
            settings,
            outbound_receiver,
            inbound_sender,
            pending,
            status_sender,
        ));

        (session, inbound_receiver)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Fire-and-forget send.
    pub async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let frame = encode_message(message, None)
            .map_err(|error| TransportError::Encode(error.to_string()))?;
        self.enqueue(frame, message.label()).await
    }

    /// Correlated request; resolves with the server's response frame.
    pub async fn request(&self, message: &ClientMessage) -> Result<serde_json::Value, TransportError> {
        self.ensure_connected()?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let frame = encode_message(message, Some(&correlation_id))
            .map_err(|error| TransportError::Encode(error.to_string()))?;
        let response = self.pending.register(&correlation_id);

        if let Err(error) = self.enqueue(frame, message.label()).await {
            self.pending.release(&correlation_id);
            return Err(error);
        }

        match timeout(self.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.pending.release(&correlation_id);
                tracing::warn!(
                    operation = message.label(),
                    correlation_id = %correlation_id,
                    still_pending = self.pending.len(),
                    "Request timed out"
                );
                Err(TransportError::Timeout {
                    operation: message.label(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    pub async fn close(&self) {
        if self.outbound.send(OutboundFrame::Close).await.is_err() {
            tracing::debug!("Connection task already stopped");
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match self.status() {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::AuthenticationExpired => Err(TransportError::AuthenticationExpired),
            _ => Err(TransportError::Disconnected),
        }
    }

    async fn enqueue(&self, frame: String, operation: &'static str) -> Result<(), TransportError> {
        match timeout(self.send_timeout, self.outbound.send(OutboundFrame::Text(frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => Err(TransportError::Timeout {
                operation,
                timeout: self.send_timeout,
            }),
        }
    }
}

#[async_trait::async_trait]
impl SyncTransport for Session {
    async fn request_sync(&self, request: SyncLogsRequest) -> Result<SyncLogsPage, TransportError> {
        let response = self.request(&ClientMessage::SyncLogs(request)).await?;
        serde_json::from_value(response)
            .map_err(|error| TransportError::Rejected(format!("malformed sync response: {error}")))
    }
}

async fn run_connection_loop(
    settings: TransportSettings,
    mut outbound_receiver: mpsc::Receiver<OutboundFrame>,
    inbound_sender: mpsc::Sender<InboundMessage>,
    pending: Arc<PendingCalls>,
    status_sender: watch::Sender<ConnectionStatus>,
) {
    let mut attempt: u32 = 0;

    loop {
        let outcome = run_connection(
            &settings,
            &mut outbound_receiver,
            &inbound_sender,
            &pending,
            &status_sender,
        )
        .await;

        let (rejection, final_status, was_registered) = match outcome {
            ConnectionOutcome::Shutdown => (
                TransportError::Disconnected,
                Some(ConnectionStatus::Disconnected),
                false,
            ),
            ConnectionOutcome::AuthenticationFailed => (
                TransportError::AuthenticationExpired,
                Some(ConnectionStatus::AuthenticationExpired),
                false,
            ),
            ConnectionOutcome::Lost { was_registered, error } => (
                error.unwrap_or(TransportError::Disconnected),
                None,
                was_registered,
            ),
        };

        let rejected = pending.reject_all(rejection);
        if rejected > 0 {
            tracing::debug!(rejected, "Rejected pending calls after connection closed");
        }

        if let Some(status) = final_status {
            if status == ConnectionStatus::AuthenticationExpired {
                tracing::error!("Server rejected authentication, re-login required");
            }
            status_sender.send_replace(status);
            return;
        }

        if was_registered {
            attempt = 0;
        }
        attempt = attempt.saturating_add(1);

        let Some(delay) = settings.reconnect.delay_for(attempt) else {
            tracing::error!(attempts = attempt - 1, "Giving up on reconnecting to server");
            status_sender.send_replace(ConnectionStatus::Disconnected);
            return;
        };

        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, scheduling reconnect"
        );
        status_sender.send_replace(ConnectionStatus::Reconnecting { attempt });

        if !wait_for_reconnect(delay, &mut outbound_receiver).await {
            status_sender.send_replace(ConnectionStatus::Disconnected);
            return;
        }
    }
}

/// Sleeps out the backoff delay while still honouring a close request.
/// Returns false when the session was closed meanwhile.
async fn wait_for_reconnect(delay: Duration, outbound_receiver: &mut mpsc::Receiver<OutboundFrame>) -> bool {
    let deadline = Instant::now() + delay;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            frame = outbound_receiver.recv() => match frame {
                Some(OutboundFrame::Text(_)) => {
                    tracing::debug!("Dropping outbound frame queued while disconnected");
                }
                Some(OutboundFrame::Close) | None => return false,
            },
        }
    }
}

async fn run_connection(
    settings: &TransportSettings,
    outbound_receiver: &mut mpsc::Receiver<OutboundFrame>,
    inbound_sender: &mpsc::Sender<InboundMessage>,
    pending: &PendingCalls,
    status_sender: &watch::Sender<ConnectionStatus>,
) -> ConnectionOutcome {
    let (socket, _response) = match connect_async(settings.server_url.as_str()).await {
        Ok(connection) => connection,
        Err(error) => {
            tracing::warn!(server_url = %settings.server_url, connect_error = %error, "Failed to connect to server");
            return lost_with(false, error);
        }
    };
    let (mut writer, mut reader) = socket.split();

    let register = ClientMessage::Register {
        token: settings.auth_token.clone(),
        user_id: settings.user_id.clone(),
    };
    let register_frame = match encode_message(&register, None) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::error!(encode_error = %error, "Failed to encode registration");
            return ConnectionOutcome::Shutdown;
        }
    };
    if let Err(error) = writer.send(Message::Text(register_frame)).await {
        tracing::warn!(send_error = %error, "Failed to send registration");
        return lost_with(false, error);
    }

    match timeout(settings.request_timeout, await_registration(&mut reader)).await {
        Ok(RegistrationOutcome::Registered) => {}
        Ok(RegistrationOutcome::Rejected(message)) => {
            tracing::error!(server_message = %message, "Registration rejected");
            return ConnectionOutcome::AuthenticationFailed;
        }
        Ok(RegistrationOutcome::Closed(close_code)) => {
            return outcome_for_close(close_code, false);
        }
        Err(_) => {
            tracing::warn!("Timed out waiting for registration acknowledgement");
            return ConnectionOutcome::Lost {
                was_registered: false,
                error: None,
            };
        }
    }

    tracing::info!(server_url = %settings.server_url, "Connected and registered");
    status_sender.send_replace(ConnectionStatus::Connected);

    loop {
        tokio::select! {
            frame = outbound_receiver.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if let Err(error) = writer.send(Message::Text(text)).await {
                        tracing::warn!(send_error = %error, "Failed to write to server");
                        return lost_with(true, error);
                    }
                }
                Some(OutboundFrame::Close) | None => {
                    if let Err(error) = writer.send(Message::Close(None)).await {
                        tracing::debug!(send_error = %error, "Failed to send close frame");
                    }
                    return ConnectionOutcome::Shutdown;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => dispatch_frame(&text, pending, inbound_sender).await,
                Some(Ok(Message::Close(frame))) => {
                    let close_code = frame.map(|frame| u16::from(frame.code));
                    return outcome_for_close(close_code, true);
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::warn!(read_error = %error, "Server connection read error");
                    return lost_with(true, error);
                }
                None => {
                    return ConnectionOutcome::Lost {
                        was_registered: true,
                        error: None,
                    }
                }
            },
        }
    }
}

fn outcome_for_close(close_code: Option<u16>, was_registered: bool) -> ConnectionOutcome {
    tracing::info!(close_code, "Server closed the connection");
    match classify_close(close_code) {
        CloseDisposition::ReAuthenticate => ConnectionOutcome::AuthenticationFailed,
        CloseDisposition::Reconnect => ConnectionOutcome::Lost {
            was_registered,
            error: None,
        },
    }
}

fn lost_with(was_registered: bool, error: WebSocketError) -> ConnectionOutcome {
    ConnectionOutcome::Lost {
        was_registered,
        error: Some(TransportError::WebSocket(error.to_string())),
    }
}

async fn await_registration<S>(reader: &mut S) -> RegistrationOutcome
where
    S: Stream<Item = Result<Message, WebSocketError>> + Unpin,
{
    while let Some(incoming) = reader.next().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                return RegistrationOutcome::Closed(frame.map(|frame| u16::from(frame.code)));
            }
            Ok(_) => continue,
            Err(error) => {
                tracing::warn!(read_error = %error, "Read error during registration");
                return RegistrationOutcome::Closed(None);
            }
        };

        match serde_json::from_str::<InboundMessage>(&text) {
            Ok(InboundMessage::Registered { .. }) => return RegistrationOutcome::Registered,
            Ok(InboundMessage::Error { message, .. }) => return RegistrationOutcome::Rejected(message),
            _ => tracing::debug!("Ignoring frame received before registration"),
        }
    }

    RegistrationOutcome::Closed(None)
}

/// Routes one text frame: correlated responses complete their pending call,
/// everything else is forwarded as a push.
async fn dispatch_frame(text: &str, pending: &PendingCalls, inbound_sender: &mpsc::Sender<InboundMessage>) {
    let frame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(decode_error = %error, "Dropping malformed server frame");
            return;
        }
    };

    if let Some(correlation_id) = frame.correlation_id.as_deref() {
        let result = if frame.message_type.as_deref() == Some("error") {
            let message = frame
                .value
                .get("message")
                .and_then(|message| message.as_str())
                .unwrap_or("request failed")
                .to_string();
            Err(TransportError::Rejected(message))
        } else {
            Ok(frame.value.clone())
        };

        if pending.resolve(correlation_id, result) {
            return;
        }
    }

    match serde_json::from_value::<InboundMessage>(frame.value) {
        Ok(InboundMessage::Unknown) => {
            tracing::debug!(message_type = ?frame.message_type, "Ignoring unknown server message");
        }
        Ok(message) => {
            if inbound_sender.send(message).await.is_err() {
                tracing::debug!("Inbound message receiver dropped");
            }
        }
        Err(error) => {
            tracing::warn!(
                message_type = ?frame.message_type,
                decode_error = %error,
                "Dropping server message with unexpected shape"
            );
        }
    }
}
