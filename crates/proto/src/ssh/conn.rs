//! Tokio driver for the sans-IO transport engine.
//!
//! [`Connection`] owns an async stream and a [`Transport`], pumping bytes
//! between them. Outbound bytes queued by the engine are flushed in a
//! single write per batch. The handshake (version exchange through the
//! first NEWKEYS) runs under a timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use kedge_platform::{KedgeError, KedgeResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::ssh::dispatcher::Dispatcher;
use crate::ssh::kex_dh::{HostKeySigner, HostKeyVerifier};
use crate::ssh::message::disconnect_reason;
use crate::ssh::service::ServiceRegistry;
use crate::ssh::transport::{Transport, TransportConfig, TransportEvent};

/// Time allowed for the initial handshake to complete.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// An established SSH transport connection over an async stream.
pub struct Connection<S> {
    stream: S,
    transport: Transport,
    events: VecDeque<TransportEvent>,
    dispatcher: Option<Dispatcher>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Runs the client side of the handshake over `stream`.
    pub async fn client(
        stream: S,
        config: TransportConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> KedgeResult<Self> {
        let mut transport = Transport::client(config, verifier);
        transport.start()?;
        Self::handshake(stream, transport).await
    }

    /// Runs the server side of the handshake over `stream`.
    pub async fn server(
        stream: S,
        config: TransportConfig,
        signer: Arc<dyn HostKeySigner>,
        services: ServiceRegistry,
    ) -> KedgeResult<Self> {
        let mut transport = Transport::server(config, signer, services);
        transport.start()?;
        Self::handshake(stream, transport).await
    }

    async fn handshake(stream: S, transport: Transport) -> KedgeResult<Self> {
        let mut conn = Self {
            stream,
            transport,
            events: VecDeque::new(),
            dispatcher: None,
        };
        timeout(HANDSHAKE_TIMEOUT, async {
            while !conn.transport.is_established() {
                conn.flush().await?;
                conn.read_more().await?;
            }
            conn.flush().await
        })
        .await
        .map_err(|_| KedgeError::Negotiation("handshake timed out".to_string()))??;
        debug!("transport handshake complete");
        Ok(conn)
    }

    /// The underlying transport engine.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Routes application messages with a registered handler through
    /// `dispatcher` instead of surfacing them from [`next_event`].
    ///
    /// [`next_event`]: Self::next_event
    pub fn set_dispatcher(&mut self, dispatcher: Dispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    /// Waits for the next protocol event. Application messages whose id
    /// has a dispatcher handler are delivered to that handler and not
    /// returned here.
    pub async fn next_event(&mut self) -> KedgeResult<TransportEvent> {
        loop {
            match self.events.pop_front() {
                Some(TransportEvent::ApplicationMessage { payload })
                    if self.routes(&payload) =>
                {
                    let id = payload[0];
                    if let Some(dispatcher) = &self.dispatcher {
                        if !dispatcher.dispatch(id, payload).await {
                            warn!(id, "application handler hung up; dropping message");
                        }
                    }
                }
                Some(event) => return Ok(event),
                None => {
                    self.flush().await?;
                    self.read_more().await?;
                }
            }
        }
    }

    fn routes(&self, payload: &[u8]) -> bool {
        match (&self.dispatcher, payload.first()) {
            (Some(dispatcher), Some(id)) => dispatcher.handles(*id),
            _ => false,
        }
    }

    /// Requests a service and flushes.
    pub async fn request_service(&mut self, name: &str) -> KedgeResult<()> {
        self.transport.request_service(name)?;
        self.flush().await
    }

    /// Sends an application-layer message and flushes.
    pub async fn send_application(&mut self, payload: Vec<u8>) -> KedgeResult<()> {
        self.transport.send_application(payload)?;
        self.flush().await
    }

    /// Sends a disconnect and flushes. The connection is unusable after.
    pub async fn disconnect(&mut self, reason_code: u32, description: &str) -> KedgeResult<()> {
        self.transport.disconnect(reason_code, description)?;
        self.flush().await
    }

    async fn flush(&mut self) -> KedgeResult<()> {
        let outbound = self.transport.take_outbound();
        if !outbound.is_empty() {
            self.stream.write_all(&outbound).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    async fn read_more(&mut self) -> KedgeResult<()> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(KedgeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        match self.transport.feed(&buf[..n]) {
            Ok(events) => {
                self.events.extend(events);
                // Feeding may have queued replies (NEWKEYS, SERVICE_ACCEPT, ...).
                self.flush().await
            }
            Err(err) => {
                // Best effort: tell the peer before tearing down.
                if err.is_peer_fault() {
                    let reason = match &err {
                        KedgeError::Trust(_) if self.transport.is_established() => {
                            disconnect_reason::MAC_ERROR
                        }
                        KedgeError::Trust(_) => disconnect_reason::KEY_EXCHANGE_FAILED,
                        _ => disconnect_reason::PROTOCOL_ERROR,
                    };
                    let _ = self.transport.disconnect(reason, "protocol failure");
                    let _ = self.flush().await;
                }
                Err(err)
            }
        }
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
