//! Connection management
//!
//! Two single-flight futures live here. `connect` resolves to an open
//! transport, fetching credentials first and absorbing one 403 by
//! refreshing them and redialing. `configure` resolves to a connection
//! that has `speech.config` (once per physical connection) and
//! `speech.context` (once per turn) on the wire, strictly in that order.
//! Both futures are cleared when they completed with an error or their
//! connection is observed `Disconnected`, so the next caller dials fresh
//! without a redial storm in between.

use super::controller::{ConnectFuture, SessionCore};
use super::{new_hex_id, SessionError};
use crate::protocol::{paths, SpeechContext, SpeechServiceConfig};
use crate::transport::{ConnectionEvent, ConnectionState, MessageFrame, Transport};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Drop a stored future that can no longer be reused.
fn clear_if_stale(slot: &Mutex<Option<ConnectFuture>>) {
    let mut guard = slot.lock().unwrap();
    if let Some(existing) = guard.as_ref() {
        let stale = match existing.peek() {
            Some(Ok(conn)) => conn.state() == ConnectionState::Disconnected,
            Some(Err(_)) => true,
            None => false, // still in flight
        };
        if stale {
            *guard = None;
        }
    }
}

impl SessionCore {
    /// Open (or reuse) the connection. Single-flight: concurrent callers
    /// await the same dial.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<Arc<dyn Transport>, SessionError> {
        let fut = {
            clear_if_stale(&self.connection_slot);
            let mut slot = self.connection_slot.lock().unwrap();
            slot.get_or_insert_with(|| dial(Arc::clone(self), false).shared())
                .clone()
        };
        fut.await
    }

    /// Resolve to a connection carrying `speech.config` and the current
    /// turn's `speech.context`. Single-flight with the same staleness rule
    /// as [`SessionCore::connect`].
    pub(crate) async fn configure(self: &Arc<Self>) -> Result<Arc<dyn Transport>, SessionError> {
        let fut = {
            clear_if_stale(&self.configured_slot);
            let mut slot = self.configured_slot.lock().unwrap();
            slot.get_or_insert_with(|| configure_connection(Arc::clone(self)).shared())
                .clone()
        };
        fut.await
    }

    /// Forget the configured-connection future so the next `configure`
    /// re-sends the context (and the config, if the connection changed).
    pub(crate) fn reset_configured(&self) {
        self.configured_slot.lock().unwrap().take();
    }

    /// The live connection, if one has already settled successfully.
    pub(crate) fn settled_connection(&self) -> Option<Arc<dyn Transport>> {
        for slot in [&self.configured_slot, &self.connection_slot] {
            let guard = slot.lock().unwrap();
            if let Some(fut) = guard.as_ref() {
                if let Some(Ok(conn)) = fut.peek() {
                    if conn.state() == ConnectionState::Connected {
                        return Some(Arc::clone(conn));
                    }
                }
            }
        }
        None
    }

    /// Drop both stored futures, disposing their connection immediately if
    /// settled or upon resolution otherwise.
    pub(crate) async fn dispose_connections(&self, reason: &str) {
        let connection = self.connection_slot.lock().unwrap().take();
        self.configured_slot.lock().unwrap().take();
        self.config_sent_on.lock().unwrap().take();

        if let Some(fut) = connection {
            match fut.peek() {
                Some(Ok(conn)) => conn.dispose(reason).await,
                Some(Err(_)) => {}
                None => {
                    let reason = reason.to_string();
                    tokio::spawn(async move {
                        if let Ok(conn) = fut.await {
                            conn.dispose(&reason).await;
                        }
                    });
                }
            }
        }
    }
}

/// One dial attempt: fetch credentials, create a transport, open it.
/// A 403 on the first attempt refreshes credentials and dials once more.
fn dial(
    core: Arc<SessionCore>,
    renewal: bool,
) -> BoxFuture<'static, Result<Arc<dyn Transport>, SessionError>> {
    async move {
        let auth_fetch_id = new_hex_id();
        let connection_id = new_hex_id();
        core.session
            .lock()
            .unwrap()
            .on_pre_connection_start(&auth_fetch_id, &connection_id);

        let auth_result = if renewal {
            core.auth.fetch_on_expiry(&auth_fetch_id).await
        } else {
            core.auth.fetch(&auth_fetch_id).await
        };
        let auth_info = match auth_result {
            Ok(info) => {
                core.session.lock().unwrap().on_auth_completed(None);
                info
            }
            Err(e) => {
                let message = e.to_string();
                core.session
                    .lock()
                    .unwrap()
                    .on_auth_completed(Some(&message));
                return Err(SessionError::AuthFailure(message));
            }
        };

        let transport = core
            .factory
            .create(&core.config, &auth_info, &connection_id)
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        listen_for_transport_events(&core, transport.as_ref());

        let endpoint = core
            .config
            .endpoint()
            .unwrap_or("<unconfigured endpoint>")
            .to_string();

        let status = match transport.open().await {
            Ok(status) => status,
            Err(e) => {
                let reason = e.to_string();
                core.session
                    .lock()
                    .unwrap()
                    .on_connection_establish_completed(0, Some(&reason));
                return Err(SessionError::ConnectionFailure {
                    status: None,
                    endpoint,
                    reason,
                });
            }
        };

        match status {
            200 => {
                core.session
                    .lock()
                    .unwrap()
                    .on_connection_establish_completed(200, None);
                log::info!("Connection {} established", connection_id);
                Ok(transport)
            }
            403 if !renewal => {
                core.session
                    .lock()
                    .unwrap()
                    .on_connection_establish_completed(403, Some("credentials expired"));
                transport.dispose("credentials expired").await;
                log::info!("Connection rejected with 403, refreshing credentials and redialing");
                dial(core, true).await
            }
            other => {
                let reason = "the service refused the connection".to_string();
                core.session
                    .lock()
                    .unwrap()
                    .on_connection_establish_completed(other, Some(&reason));
                Err(SessionError::ConnectionFailure {
                    status: Some(other),
                    endpoint,
                    reason,
                })
            }
        }
    }
    .boxed()
}

/// Forward transport events into session telemetry and the event stream.
fn listen_for_transport_events(core: &Arc<SessionCore>, transport: &dyn Transport) {
    let mut events = transport.events();
    let core = Arc::clone(core);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    core.session
                        .lock()
                        .unwrap()
                        .on_service_event(event.label());
                    match event {
                        ConnectionEvent::Established { connection_id } => {
                            core.emit(super::SessionEvent::ConnectionEstablished {
                                connection_id,
                            });
                        }
                        ConnectionEvent::Closed {
                            connection_id,
                            status,
                            reason,
                        } => {
                            core.emit(super::SessionEvent::ConnectionClosed {
                                connection_id,
                                status,
                                reason,
                            });
                        }
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Transport events: lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Body of the configured-connection future: obtain a connection, send
/// `speech.config` if this connection has not seen one, then the context
/// for the current request id. Audio for a turn is only sent by callers
/// that awaited this future, which is what guarantees the ordering.
fn configure_connection(
    core: Arc<SessionCore>,
) -> BoxFuture<'static, Result<Arc<dyn Transport>, SessionError>> {
    async move {
        let conn = core.connect().await?;

        let needs_config = {
            let sent_on = core.config_sent_on.lock().unwrap();
            sent_on.as_deref() != Some(conn.id())
        };
        if needs_config {
            let device = core.device.lock().unwrap().clone();
            let payload = SpeechServiceConfig::new(device, core.config.telemetry_enabled())
                .to_json()
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
            let request_id = core.session.lock().unwrap().request_id().to_string();
            conn.send(MessageFrame::text(paths::SPEECH_CONFIG, &request_id, payload))
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            *core.config_sent_on.lock().unwrap() = Some(conn.id().to_string());
        }

        let context = {
            let grammar = core.grammar.lock().unwrap();
            let device = core.device.lock().unwrap().clone();
            SpeechContext::new(grammar.build(), device)
        };
        let body = context
            .to_json()
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        let request_id = core.session.lock().unwrap().request_id().to_string();
        conn.send(MessageFrame::text(paths::SPEECH_CONTEXT, &request_id, body))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        log::debug!(
            "Connection {}: context sent for request {}",
            conn.id(),
            request_id
        );

        Ok(conn)
    }
    .boxed()
}
