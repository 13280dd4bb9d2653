//! WebSocket transport
//!
//! One instance per dial: the factory builds the service URL from the
//! configured endpoint and query parameters, and `open` performs the
//! upgrade with the auth header and the client-generated `X-ConnectionId`.
//! A background task decodes incoming frames into a channel so reads never
//! block sends.

use super::frame::{self, MessageFrame, MessageType};
use super::{ConnectionEvent, ConnectionState, Transport, TransportError, TransportFactory};
use crate::auth::AuthInfo;
use crate::config::RecognizerConfig;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

/// Header echoing the client-generated connection id.
const CONNECTION_ID_HEADER: &str = "X-ConnectionId";

/// Handshake timeout; steady-state traffic has no client-side timeout.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 64;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Builds [`WebSocketTransport`]s from the configured endpoint.
#[derive(Debug, Default)]
pub struct WebSocketTransportFactory;

impl WebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(
        &self,
        config: &RecognizerConfig,
        auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let endpoint = config
            .endpoint()
            .ok_or_else(|| TransportError::Endpoint("no endpoint configured".to_string()))?;
        let url = build_url(endpoint, &config.query_params());
        Ok(Arc::new(WebSocketTransport::new(
            url,
            auth.clone(),
            connection_id,
        )))
    }
}

/// Percent-encode a query value. Unreserved characters pass through.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn build_url(endpoint: &str, params: &[(&'static str, String)]) -> String {
    if params.is_empty() {
        return endpoint.to_string();
    }
    let query: Vec<String> = params
        .iter()
        .map(|(name, value)| format!("{}={}", name, encode_component(value)))
        .collect();
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}{}", endpoint, separator, query.join("&"))
}

struct Inner {
    connection_id: String,
    url: String,
    auth: AuthInfo,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    reader_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Result<MessageFrame, TransportError>>>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Framed message channel over a WebSocket.
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

impl WebSocketTransport {
    pub fn new(url: String, auth: AuthInfo, connection_id: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connection_id: connection_id.to_string(),
                url,
                auth,
                state: Mutex::new(ConnectionState::None),
                writer: tokio::sync::Mutex::new(None),
                reader_rx: tokio::sync::Mutex::new(None),
                reader_task: Mutex::new(None),
                events,
            }),
        }
    }

    fn spawn_reader(
        inner: Arc<Inner>,
        mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        tx: mpsc::UnboundedSender<Result<MessageFrame, TransportError>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match frame::decode_text(&text) {
                        Ok(decoded) => {
                            let _ = inner.events.send(ConnectionEvent::MessageReceived {
                                connection_id: inner.connection_id.clone(),
                                path: decoded.path.clone(),
                            });
                            if tx.send(Ok(decoded)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(TransportError::Frame(e.to_string())));
                        }
                    },
                    Ok(Message::Binary(raw)) => match frame::decode_binary(&raw) {
                        Ok(decoded) => {
                            let _ = inner.events.send(ConnectionEvent::MessageReceived {
                                connection_id: inner.connection_id.clone(),
                                path: decoded.path.clone(),
                            });
                            if tx.send(Ok(decoded)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(TransportError::Frame(e.to_string())));
                        }
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("Connection {}: closed by service", inner.connection_id);
                        break;
                    }
                    Ok(_) => {} // ping/pong
                    Err(e) => {
                        let _ = tx.send(Err(TransportError::Receive(e.to_string())));
                        break;
                    }
                }
            }
            inner.set_state(ConnectionState::Disconnected);
            let _ = inner.events.send(ConnectionEvent::Closed {
                connection_id: inner.connection_id.clone(),
                status: None,
                reason: "read stream ended".to_string(),
            });
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn id(&self) -> &str {
        &self.inner.connection_id
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    async fn open(&self) -> Result<u16, TransportError> {
        let mut request = self
            .inner
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Endpoint(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_bytes(self.inner.auth.header_name.as_bytes())
                .map_err(|e| TransportError::Handshake(e.to_string()))?,
            HeaderValue::from_str(&self.inner.auth.token)
                .map_err(|e| TransportError::Handshake(e.to_string()))?,
        );
        headers.insert(
            CONNECTION_ID_HEADER,
            HeaderValue::from_str(&self.inner.connection_id)
                .map_err(|e| TransportError::Handshake(e.to_string()))?,
        );

        self.inner.set_state(ConnectionState::Connecting);
        log::info!("Connection {}: dialing service", self.inner.connection_id);

        // disable_nagle: audio frames are small and latency matters
        let result = timeout(
            HANDSHAKE_TIMEOUT,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| {
            self.inner.set_state(ConnectionState::Disconnected);
            TransportError::Handshake("handshake timeout".to_string())
        })?;

        match result {
            Ok((stream, response)) => {
                if let Some(echoed) = response.headers().get(CONNECTION_ID_HEADER) {
                    log::debug!(
                        "Connection {}: service echoed {:?}",
                        self.inner.connection_id,
                        echoed
                    );
                }
                let (write, read) = stream.split();
                let (tx, rx) = mpsc::unbounded_channel();
                let task = Self::spawn_reader(Arc::clone(&self.inner), read, tx);

                *self.inner.writer.lock().await = Some(write);
                *self.inner.reader_rx.lock().await = Some(rx);
                *self.inner.reader_task.lock().unwrap() = Some(task);
                self.inner.set_state(ConnectionState::Connected);
                let _ = self.inner.events.send(ConnectionEvent::Established {
                    connection_id: self.inner.connection_id.clone(),
                });
                // The upgrade succeeded; callers treat that as a 200.
                Ok(200)
            }
            Err(tungstenite::Error::Http(response)) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Ok(response.status().as_u16())
            }
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Err(TransportError::Handshake(e.to_string()))
            }
        }
    }

    async fn send(&self, frame: MessageFrame) -> Result<(), TransportError> {
        let path = frame.path.clone();
        let message = match frame.message_type {
            MessageType::Text => Message::Text(frame::encode_text(&frame)),
            MessageType::Binary => Message::Binary(frame::encode_binary(&frame)),
        };

        let mut guard = self.inner.writer.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotOpen)?;
        sink.send(message).await.map_err(|e| {
            self.inner.set_state(ConnectionState::Disconnected);
            TransportError::Send(e.to_string())
        })?;
        drop(guard);

        let _ = self.inner.events.send(ConnectionEvent::MessageSent {
            connection_id: self.inner.connection_id.clone(),
            path,
        });
        Ok(())
    }

    async fn read(&self) -> Result<Option<MessageFrame>, TransportError> {
        let mut guard = self.inner.reader_rx.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::NotOpen)?;
        match rx.recv().await {
            Some(Ok(decoded)) => Ok(Some(decoded)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    async fn dispose(&self, reason: &str) {
        log::info!(
            "Connection {}: disposing ({})",
            self.inner.connection_id,
            reason
        );
        if let Some(task) = self.inner.reader_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
        let _ = self.inner.events.send(ConnectionEvent::Closed {
            connection_id: self.inner.connection_id.clone(),
            status: None,
            reason: reason.to_string(),
        });
    }
}
