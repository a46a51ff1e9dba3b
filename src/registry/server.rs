//! WebSocket endpoint feeding the registry.
//!
//! Accepts page connections, captures what the upgrade request reveals
//! about the page, and registers each socket with a [`ConnectionRegistry`].
//!
//! # Connection Flow
//!
//! 1. Page dials `ws://host:port/ws?sessionId=<id>`
//! 2. Upgrade request is inspected for `sessionId`, `User-Agent` and `Origin`
//! 3. Socket is wrapped in a [`WebSocketTransport`] and registered
//! 4. Page sends `page_info` / heartbeats / replies; controller sends commands

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{ORIGIN, USER_AGENT};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, SessionId};
use crate::protocol::PageInfo;
use crate::transport::WebSocketTransport;

use super::ConnectionRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Time allowed for the WebSocket upgrade after TCP accept.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Query parameter carrying the session identity.
const SESSION_QUERY_PARAM: &str = "sessionId";

// ============================================================================
// HandshakeInfo
// ============================================================================

/// What the upgrade request tells us about the page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Decoded `sessionId` query parameter.
    pub session_id: Option<SessionId>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
    /// `Origin` header.
    pub origin: Option<String>,
}

impl HandshakeInfo {
    /// Extracts handshake details from an upgrade request.
    #[must_use]
    pub fn from_request(request: &Request) -> Self {
        let header = |name| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            session_id: request.uri().query().and_then(session_from_query),
            user_agent: header(USER_AGENT),
            origin: header(ORIGIN),
        }
    }

    /// Converts to initial connection metadata.
    ///
    /// The origin stands in for the page URL until a `page_info` frame
    /// reports the full one.
    #[must_use]
    pub fn into_page_info(self) -> PageInfo {
        PageInfo {
            url: self.origin,
            title: None,
            user_agent: self.user_agent,
            session_id: self.session_id,
        }
    }
}

fn session_from_query(query: &str) -> Option<SessionId> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == SESSION_QUERY_PARAM)
        .and_then(|(_, value)| {
            urlencoding::decode(&value.replace('+', " "))
                .ok()
                .map(Cow::into_owned)
        })
        .and_then(SessionId::new)
}

// ============================================================================
// RegistryServer
// ============================================================================

/// A WebSocket server that registers every accepted page.
///
/// # Example
///
/// ```ignore
/// let registry = ConnectionRegistry::start(RegistryConfig::default());
/// let server = RegistryServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 8765, registry).await?;
/// println!("listening on {}", server.ws_url());
/// ```
pub struct RegistryServer {
    /// Port the server is bound to.
    port: u16,
    /// Bound address.
    local_addr: SocketAddr,
    /// Registry accepted sockets are added to.
    registry: Arc<ConnectionRegistry>,
    /// Shutdown flag polled by the accept loop.
    shutdown: Arc<AtomicBool>,
}

impl RegistryServer {
    /// Binds the server and starts the accept loop.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16, registry: Arc<ConnectionRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "RegistryServer bound");

        let shutdown = Arc::new(AtomicBool::new(false));
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            Arc::clone(&shutdown),
        ));

        info!(port = local_addr.port(), "RegistryServer started");

        Ok(Self {
            port: local_addr.port(),
            local_addr,
            registry,
            shutdown,
        })
    }

    /// Returns the port the server is bound to.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the bound socket address.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL for this server.
    ///
    /// Format: `ws://{ip}:{port}/ws`
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Returns the registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stops accepting connections. Registered connections are untouched.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(port = self.port, "RegistryServer shutting down");
        }
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Accept loop started");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Accept with timeout to allow checking shutdown flag
        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, &registry).await {
                        warn!(error = %e, %addr, "Connection handling failed");
                    }
                });
            }
            Ok(Err(e)) => {
                error!(error = %e, "Accept failed");
            }
            Err(_) => continue,
        }
    }

    debug!("Accept loop terminated");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: &Arc<ConnectionRegistry>,
) -> Result<ConnectionId> {
    debug!(%addr, "New TCP connection");

    let mut handshake = HandshakeInfo::default();
    let callback = |request: &Request,
                    response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        handshake = HandshakeInfo::from_request(request);
        Ok(response)
    };

    let ws_stream = timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    .map_err(|_| Error::connection_timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))?
    .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    let session_id = handshake.session_id.clone();
    let socket = Arc::new(WebSocketTransport::accepted(ws_stream));
    let id = registry.add_connection(socket, handshake.into_page_info());

    info!(
        connection_id = %id,
        %addr,
        session_id = ?session_id.as_ref().map(SessionId::as_str),
        "WebSocket connection registered"
    );

    Ok(id)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    use crate::protocol::Command;
    use crate::registry::RegistryConfig;

    async fn server() -> RegistryServer {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        RegistryServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, registry)
            .await
            .expect("bind")
    }

    async fn wait_for_count(registry: &ConnectionRegistry, count: usize) {
        timeout(Duration::from_secs(5), async {
            while registry.connection_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection count reached");
    }

    #[test]
    fn test_handshake_info_from_request() {
        let request = Request::builder()
            .uri("/ws?foo=1&sessionId=tab%201")
            .header("User-Agent", "TestAgent/1.0")
            .header("Origin", "https://example.com")
            .body(())
            .expect("request");

        let info = HandshakeInfo::from_request(&request);
        assert_eq!(info.session_id, SessionId::new("tab 1"));
        assert_eq!(info.user_agent.as_deref(), Some("TestAgent/1.0"));
        assert_eq!(info.origin.as_deref(), Some("https://example.com"));

        let page = info.into_page_info();
        assert_eq!(page.url.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_handshake_without_session() {
        let request = Request::builder()
            .uri("/ws?sessionId=")
            .body(())
            .expect("request");
        assert_eq!(HandshakeInfo::from_request(&request), HandshakeInfo::default());
    }

    #[test]
    fn test_session_query_decoding() {
        assert_eq!(session_from_query("sessionId=a+b%2Fc"), SessionId::new("a b/c"));
        assert_eq!(session_from_query("x=1&sessionId=%20%20"), None);
        assert_eq!(session_from_query("other=s1"), None);
    }

    #[tokio::test]
    async fn test_server_binds_random_port() {
        let server = server().await;
        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}/ws", server.port()));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_end_to_end_command() {
        let server = server().await;
        let url = format!("{}?sessionId=s1", server.ws_url());
        let mut request = url.into_client_request().expect("request");
        request
            .headers_mut()
            .insert(USER_AGENT, "TestAgent/1.0".parse().expect("header"));

        let (mut page, _) = connect_async(request).await.expect("connect");
        wait_for_count(server.registry(), 1).await;

        let session = SessionId::new("s1").expect("session");
        let connection = server
            .registry()
            .get_connection_by_session_id(&session)
            .expect("registered");
        assert_eq!(connection.info.user_agent.as_deref(), Some("TestAgent/1.0"));

        tokio::spawn(async move {
            while let Some(Ok(Message::Text(text))) = page.next().await {
                let command: Value = serde_json::from_str(&text).expect("json");
                let reply = json!({
                    "commandId": command["id"],
                    "success": true,
                    "data": command["payload"],
                });
                page.send(Message::Text(reply.to_string().into()))
                    .await
                    .expect("send");
            }
        });

        let result = server
            .registry()
            .send_command(
                &connection.id,
                Command::with_payload("echo", json!({ "v": 1 })),
                Duration::from_secs(5),
            )
            .await
            .expect("reply");
        assert_eq!(result, json!({ "v": 1 }));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_with_same_session_supersedes() {
        let server = server().await;
        let url = format!("{}?sessionId=s1", server.ws_url());

        let (mut first, _) = connect_async(url.as_str()).await.expect("connect");
        wait_for_count(server.registry(), 1).await;
        let first_id = server.registry().get_connections()[0].id;

        let (_second, _) = connect_async(url.as_str()).await.expect("connect");
        timeout(Duration::from_secs(5), async {
            loop {
                let ids: Vec<_> = server.registry().get_connections().iter().map(|c| c.id).collect();
                if ids.len() == 1 && ids[0] != first_id {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("takeover");

        let closed = timeout(Duration::from_secs(5), async {
            loop {
                match first.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_client_disconnect_unregisters() {
        let server = server().await;
        let (mut page, _) = connect_async(server.ws_url()).await.expect("connect");
        wait_for_count(server.registry(), 1).await;

        page.close(None).await.expect("close");
        wait_for_count(server.registry(), 0).await;

        server.shutdown();
    }
}
