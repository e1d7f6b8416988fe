//! Chatbus bridge client implementation

use crate::config::ChatbusConfig;
use crate::error::{ChatbusError, Result};
use crate::messages::{ChatMessage, ClientMessage, Operation, ServerMessage};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to the bridge
    Disconnected,
    /// Opening the WebSocket
    Connecting,
    /// Connected and ready
    Connected,
}

type Ack = oneshot::Sender<Result<()>>;

/// Acknowledgements awaited per channel, answered in send order
type AckQueue = Mutex<HashMap<String, VecDeque<Ack>>>;

/// Internal client state
struct ClientInner {
    config: ChatbusConfig,
    state: watch::Sender<ConnectionState>,

    // Channel for sending messages to the connection task
    tx: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,

    // Pending operations awaiting acknowledgement
    pending_subscribes: AckQueue,
    pending_unsubscribes: AckQueue,
    pending_publishes: AckQueue,
    pending_pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    pending_requests: Mutex<HashMap<u64, (String, oneshot::Sender<Result<ChatMessage>>)>>,

    // Messages on subscribed channels
    messages_tx: mpsc::UnboundedSender<ChatMessage>,
    messages_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChatMessage>>,

    // Counters
    ping_seq: AtomicU64,
    request_seq: AtomicU64,
}

/// Message to send to the connection task
enum OutboundMessage {
    Send(ClientMessage),
    Shutdown,
}

/// Chatbus bridge client
///
/// This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct ChatbusClient {
    inner: Arc<ClientInner>,
}

impl ChatbusClient {
    /// Create a new client with the given configuration
    pub fn new(config: ChatbusConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            config,
            state,
            tx: Mutex::new(None),
            task: Mutex::new(None),
            pending_subscribes: Mutex::new(HashMap::new()),
            pending_unsubscribes: Mutex::new(HashMap::new()),
            pending_publishes: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            messages_tx,
            messages_rx: tokio::sync::Mutex::new(messages_rx),
            ping_seq: AtomicU64::new(0),
            request_seq: AtomicU64::new(0),
        });

        Self { inner }
    }

    /// Get the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Connect to the bridge
    pub async fn connect(&self) -> Result<()> {
        let current_state = self.connection_state();
        if current_state != ConnectionState::Disconnected {
            return Err(ChatbusError::Connection(format!(
                "Cannot connect in state: {:?}",
                current_state
            )));
        }

        self.inner.set_state(ConnectionState::Connecting);

        debug!("Connecting to {}", self.inner.config.url);
        let stream = match connect_async(self.inner.config.url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(ChatbusError::Connection(e.to_string()));
            }
        };

        let (tx, rx) = mpsc::channel::<OutboundMessage>(100);
        *self.inner.tx.lock() = Some(tx);
        self.inner.set_state(ConnectionState::Connected);

        let task = tokio::spawn(connection_task(self.inner.clone(), stream, rx));
        *self.inner.task.lock() = Some(task);

        info!(url = %self.inner.config.url, "Connected to bridge");
        Ok(())
    }

    /// Disconnect from the bridge
    pub async fn disconnect(&self) -> Result<()> {
        let tx = self.inner.tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(OutboundMessage::Shutdown).await;
        }

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.inner.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Start receiving messages published on `channel`
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        self.ensure_connected()?;
        self.inner
            .acknowledged(
                &self.inner.pending_subscribes,
                channel,
                ClientMessage::Subscribe {
                    channel: channel.to_string(),
                },
            )
            .await
    }

    /// Stop receiving messages on `channel`
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.ensure_connected()?;
        self.inner
            .acknowledged(
                &self.inner.pending_unsubscribes,
                channel,
                ClientMessage::Unsubscribe {
                    channel: channel.to_string(),
                },
            )
            .await
    }

    /// Publish `body` to `channel` with this client's handle and token
    ///
    /// Resolves once the bridge has forwarded the message.
    pub async fn publish(&self, channel: &str, body: impl Into<String>) -> Result<()> {
        self.ensure_connected()?;
        self.inner
            .acknowledged(
                &self.inner.pending_publishes,
                channel,
                ClientMessage::Publish {
                    channel: channel.to_string(),
                    body: body.into(),
                    headers: self.inner.identity_headers(),
                },
            )
            .await
    }

    /// Publish `body` to `channel` and wait for the first reply
    pub async fn request(&self, channel: &str, body: impl Into<String>) -> Result<ChatMessage> {
        self.ensure_connected()?;

        let id = self.inner.request_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_requests
            .lock()
            .insert(id, (channel.to_string(), tx));

        let sent = self
            .inner
            .send(ClientMessage::Request {
                id,
                channel: channel.to_string(),
                body: body.into(),
                headers: self.inner.identity_headers(),
            })
            .await;
        if let Err(e) = sent {
            self.inner.pending_requests.lock().remove(&id);
            return Err(e);
        }

        match timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatbusError::Shutdown),
            Err(_) => {
                self.inner.pending_requests.lock().remove(&id);
                Err(ChatbusError::Timeout)
            }
        }
    }

    /// Send a ping and return the round-trip time in milliseconds
    pub async fn ping(&self) -> Result<u64> {
        self.ensure_connected()?;

        let seq = self.inner.ping_seq.fetch_add(1, Ordering::SeqCst);
        let start = std::time::Instant::now();

        let (tx, rx) = oneshot::channel();
        self.inner.pending_pings.lock().insert(seq, tx);

        if let Err(e) = self.inner.send(ClientMessage::Ping { seq }).await {
            self.inner.pending_pings.lock().remove(&seq);
            return Err(e);
        }

        match timeout(self.inner.config.operation_timeout, rx).await {
            Ok(Ok(())) => Ok(start.elapsed().as_millis() as u64),
            Ok(Err(_)) => Err(ChatbusError::Shutdown),
            Err(_) => {
                self.inner.pending_pings.lock().remove(&seq);
                Err(ChatbusError::Timeout)
            }
        }
    }

    /// Next message on any subscribed channel
    pub async fn next_message(&self) -> Option<ChatMessage> {
        self.inner.messages_rx.lock().await.recv().await
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(ChatbusError::NotConnected);
        }
        Ok(())
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn identity_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        if let Some(handle) = &self.config.handle {
            headers.insert("handle".to_string(), handle.clone());
        }
        if let Some(token) = self.config.token.as_ref().filter(|t| !t.is_empty()) {
            headers.insert("token".to_string(), token.clone());
        }
        headers
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            tx.send(OutboundMessage::Send(msg))
                .await
                .map_err(|_| ChatbusError::NotConnected)
        } else {
            Err(ChatbusError::NotConnected)
        }
    }

    /// Send `msg` and wait for the bridge to acknowledge it on `channel`
    async fn acknowledged(&self, pending: &AckQueue, channel: &str, msg: ClientMessage) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push_back(tx);

        if let Err(e) = self.send(msg).await {
            prune(pending, channel);
            return Err(e);
        }

        let result = timeout(self.config.operation_timeout, rx).await;
        match result {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatbusError::Shutdown),
            Err(_) => {
                prune(pending, channel);
                Err(ChatbusError::Timeout)
            }
        }
    }

    fn handle_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Published { channel } => {
                complete(&self.pending_publishes, &channel, Ok(()));
            }
            ServerMessage::Subscribed { channel } => {
                complete(&self.pending_subscribes, &channel, Ok(()));
            }
            ServerMessage::Unsubscribed { channel } => {
                complete(&self.pending_unsubscribes, &channel, Ok(()));
            }
            ServerMessage::Denied {
                operation,
                channel,
                message,
            } => {
                let pending = match operation {
                    Operation::Publish => &self.pending_publishes,
                    Operation::Subscribe => &self.pending_subscribes,
                };
                let err = ChatbusError::Denied {
                    channel: channel.clone(),
                    message,
                };
                complete(pending, &channel, Err(err));
            }
            ServerMessage::Message {
                channel,
                body,
                headers,
            } => {
                let _ = self.messages_tx.send(ChatMessage {
                    channel,
                    body,
                    headers,
                });
            }
            ServerMessage::Reply { id, body, headers } => {
                if let Some((channel, tx)) = self.pending_requests.lock().remove(&id) {
                    let _ = tx.send(Ok(ChatMessage {
                        channel,
                        body,
                        headers,
                    }));
                }
            }
            ServerMessage::RequestFailed { id, reason } => {
                if let Some((_, tx)) = self.pending_requests.lock().remove(&id) {
                    let _ = tx.send(Err(ChatbusError::RequestFailed(reason)));
                }
            }
            ServerMessage::Pong { seq } => {
                if let Some(tx) = self.pending_pings.lock().remove(&seq) {
                    let _ = tx.send(());
                }
            }
            ServerMessage::Error { message } => {
                warn!("Bridge error: {}", message);
            }
        }
    }

    fn handle_disconnect(&self) {
        // Clear sender
        *self.tx.lock() = None;

        // Reject pending operations
        for queue in [
            &self.pending_subscribes,
            &self.pending_unsubscribes,
            &self.pending_publishes,
        ] {
            for (_, acks) in queue.lock().drain() {
                for tx in acks {
                    let _ = tx.send(Err(ChatbusError::NotConnected));
                }
            }
        }
        self.pending_pings.lock().clear();
        for (_, (_, tx)) in self.pending_requests.lock().drain() {
            let _ = tx.send(Err(ChatbusError::NotConnected));
        }

        self.set_state(ConnectionState::Disconnected);
    }
}

/// Answer the oldest acknowledgement waiting on `channel`
fn complete(pending: &AckQueue, channel: &str, result: Result<()>) {
    let mut pending = pending.lock();
    if let Some(queue) = pending.get_mut(channel) {
        if let Some(tx) = queue.pop_front() {
            let _ = tx.send(result);
        }
        if queue.is_empty() {
            pending.remove(channel);
        }
    }
}

/// Drop acknowledgements nobody is waiting for any more
fn prune(pending: &AckQueue, channel: &str) {
    let mut pending = pending.lock();
    if let Some(queue) = pending.get_mut(channel) {
        queue.retain(|tx| !tx.is_closed());
        if queue.is_empty() {
            pending.remove(channel);
        }
    }
}

/// Main connection task
async fn connection_task(
    inner: Arc<ClientInner>,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx: mpsc::Receiver<OutboundMessage>,
) {
    let (mut sink, mut source) = stream.split();

    let result: Result<()> = loop {
        tokio::select! {
            // Handle outbound messages
            msg = rx.recv() => {
                match msg {
                    Some(OutboundMessage::Send(client_msg)) => {
                        let text = match serde_json::to_string(&client_msg) {
                            Ok(text) => text,
                            Err(e) => break Err(e.into()),
                        };
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            break Err(ChatbusError::Transport(e.to_string()));
                        }
                    }
                    Some(OutboundMessage::Shutdown) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break Ok(());
                    }
                }
            }

            // Handle inbound messages
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(msg) => inner.handle_message(msg),
                            Err(e) => warn!("Failed to parse message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection closed by bridge");
                        break Err(ChatbusError::Connection("Connection closed".into()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break Err(ChatbusError::Transport(e.to_string()));
                    }
                }
            }
        }
    };

    if let Err(e) = result {
        warn!("Bridge connection lost: {}", e);
    }
    inner.handle_disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ChatbusClient {
        ChatbusClient::new(ChatbusConfig::new("ws://127.0.0.1:1/eventbus"))
    }

    #[test]
    fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(*client.state_receiver().borrow(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_identity_headers() {
        let client = ChatbusClient::new(
            ChatbusConfig::new("ws://localhost/eventbus")
                .handle("alice")
                .token(""),
        );
        let headers = client.inner.identity_headers();
        assert_eq!(headers.get("handle").map(String::as_str), Some("alice"));
        assert!(!headers.contains_key("token"));
    }

    #[test]
    fn test_complete_answers_in_order() {
        let pending: AckQueue = Mutex::new(HashMap::new());
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending
            .lock()
            .entry("general".to_string())
            .or_default()
            .extend([tx1, tx2]);

        complete(&pending, "general", Ok(()));
        assert!(matches!(rx1.try_recv(), Ok(Ok(()))));
        assert!(rx2.try_recv().is_err());

        complete(&pending, "general", Err(ChatbusError::Timeout));
        assert!(matches!(rx2.try_recv(), Ok(Err(ChatbusError::Timeout))));
        assert!(pending.lock().is_empty());
    }

    #[test]
    fn test_prune_drops_abandoned() {
        let pending: AckQueue = Mutex::new(HashMap::new());
        let (tx, rx) = oneshot::channel();
        pending.lock().entry("general".to_string()).or_default().push_back(tx);
        drop(rx);

        prune(&pending, "general");
        assert!(pending.lock().is_empty());
    }
}
