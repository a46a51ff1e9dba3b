//! Transport configuration and factory.
//!
//! A [`TransportConfig`] names the transport kind and its connection
//! parameters; [`create_transport`] turns it into a live transport.
//!
//! # Selection
//!
//! | Kind | Result |
//! |------|--------|
//! | `websocket` | [`WebSocketTransport`] to `url`, or to the derived endpoint |
//! | `chrome_extension` | [`ExtensionTransport`] through the environment's runtime |
//! | `auto` | extension when the runtime is available, WebSocket otherwise |
//!
//! The derived endpoint is `ws://<page host>:8765/ws`, or `wss://` when the
//! page was served over `https`.
//!
//! # JSON
//!
//! ```json
//! {
//!   "type": "websocket",
//!   "url": "ws://127.0.0.1:8765/ws",
//!   "reconnect": true,
//!   "reconnectInterval": 3000,
//!   "maxReconnectAttempts": 10
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

use super::extension::{ExtensionRuntime, ExtensionTransport};
use super::websocket::{DEFAULT_RECONNECT_INTERVAL, WebSocketOptions, WebSocketTransport};
use super::Transport;

// ============================================================================
// Constants
// ============================================================================

/// Port of the derived WebSocket endpoint.
pub const DEFAULT_PORT: u16 = 8765;

/// Path of the derived WebSocket endpoint.
pub const DEFAULT_PATH: &str = "/ws";

// ============================================================================
// TransportKind
// ============================================================================

/// Which transport to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct WebSocket connection.
    #[serde(rename = "websocket")]
    WebSocket,
    /// Extension messaging relay.
    #[serde(rename = "chrome_extension")]
    ChromeExtension,
    /// Extension when available, WebSocket otherwise.
    #[default]
    #[serde(rename = "auto")]
    Auto,
}

impl TransportKind {
    /// Returns the wire name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::ChromeExtension => "chrome_extension",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TransportConfig
// ============================================================================

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Transport kind.
    #[serde(rename = "type")]
    pub kind: TransportKind,

    /// Explicit WebSocket URL. Derived from the page origin when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Relay extension id. Falls back to the runtime's own id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,

    /// Reconnect after the WebSocket drops.
    pub reconnect: bool,

    /// Fixed delay between reconnect attempts.
    #[serde(with = "duration_ms")]
    pub reconnect_interval: Duration,

    /// Upper bound on consecutive attempts. Unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Auto,
            url: None,
            extension_id: None,
            reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: None,
        }
    }
}

impl TransportConfig {
    /// Creates a WebSocket configuration for `url`.
    #[must_use]
    pub fn websocket(url: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::WebSocket,
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Creates an extension configuration.
    #[must_use]
    pub fn chrome_extension(extension_id: Option<String>) -> Self {
        Self {
            kind: TransportKind::ChromeExtension,
            extension_id,
            ..Self::default()
        }
    }

    /// Parses a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the text is not a valid configuration.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("invalid transport config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero reconnect interval with
    /// reconnection enabled, or an explicit URL that is not `ws`/`wss`.
    pub fn validate(&self) -> Result<()> {
        if self.reconnect && self.reconnect_interval.is_zero() {
            return Err(Error::config("reconnectInterval must be positive"));
        }
        if let Some(url) = &self.url {
            parse_ws_url(url)?;
        }
        Ok(())
    }

    /// Builds WebSocket options for `url` from this configuration.
    #[must_use]
    pub fn websocket_options(&self, url: impl Into<String>) -> WebSocketOptions {
        WebSocketOptions::new(url)
            .with_reconnect(self.reconnect)
            .with_reconnect_interval(self.reconnect_interval)
            .with_max_reconnect_attempts(self.max_reconnect_attempts)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// TransportEnvironment
// ============================================================================

/// What the host can offer the factory.
#[derive(Clone, Default)]
pub struct TransportEnvironment {
    /// Extension messaging runtime, if the host has one.
    pub extension_runtime: Option<Arc<dyn ExtensionRuntime>>,
    /// Origin of the hosting page, used to derive the WebSocket endpoint.
    pub page_url: Option<Url>,
}

impl TransportEnvironment {
    /// Creates an empty environment.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the extension runtime.
    #[must_use]
    pub fn with_extension_runtime(mut self, runtime: Arc<dyn ExtensionRuntime>) -> Self {
        self.extension_runtime = Some(runtime);
        self
    }

    /// Sets the hosting page URL.
    #[must_use]
    pub fn with_page_url(mut self, url: Url) -> Self {
        self.page_url = Some(url);
        self
    }

    fn available_runtime(&self) -> Option<&Arc<dyn ExtensionRuntime>> {
        self.extension_runtime.as_ref().filter(|r| r.is_available())
    }
}

impl fmt::Debug for TransportEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEnvironment")
            .field("extension_runtime", &self.extension_runtime.is_some())
            .field("page_url", &self.page_url.as_ref().map(Url::as_str))
            .finish()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Creates the transport described by `config`.
///
/// The transport is returned unconnected; attaching handlers starts it.
///
/// # Errors
///
/// - [`Error::Config`] if `chrome_extension` is requested without a runtime,
///   or no WebSocket URL is given and none can be derived.
pub fn create_transport(
    config: &TransportConfig,
    env: &TransportEnvironment,
) -> Result<Arc<dyn Transport>> {
    config.validate()?;

    match config.kind {
        TransportKind::WebSocket => create_websocket(config, env),
        TransportKind::ChromeExtension => {
            let runtime = env
                .extension_runtime
                .as_ref()
                .ok_or_else(|| Error::config("chrome_extension transport needs a runtime"))?;
            Ok(create_extension(config, runtime))
        }
        TransportKind::Auto => match env.available_runtime() {
            Some(runtime) => {
                debug!("Auto transport selected extension relay");
                Ok(create_extension(config, runtime))
            }
            None => {
                debug!("Auto transport selected WebSocket");
                create_websocket(config, env)
            }
        },
    }
}

fn create_extension(
    config: &TransportConfig,
    runtime: &Arc<dyn ExtensionRuntime>,
) -> Arc<dyn Transport> {
    Arc::new(ExtensionTransport::new(
        Arc::clone(runtime),
        config.extension_id.clone(),
    ))
}

fn create_websocket(
    config: &TransportConfig,
    env: &TransportEnvironment,
) -> Result<Arc<dyn Transport>> {
    let url = match (&config.url, &env.page_url) {
        (Some(url), _) => parse_ws_url(url)?,
        (None, Some(page)) => derive_websocket_url(page)?,
        (None, None) => {
            return Err(Error::config(
                "websocket transport needs a url or a page origin",
            ));
        }
    };

    Ok(Arc::new(WebSocketTransport::new(
        config.websocket_options(url.as_str()),
    )))
}

/// Derives the default endpoint for a page served from `page`.
///
/// # Errors
///
/// Returns [`Error::Config`] if `page` has no host.
pub fn derive_websocket_url(page: &Url) -> Result<Url> {
    let scheme = if page.scheme() == "https" { "wss" } else { "ws" };
    let host = page
        .host()
        .ok_or_else(|| Error::config(format!("page url has no host: {page}")))?;

    Url::parse(&format!("{scheme}://{host}:{DEFAULT_PORT}{DEFAULT_PATH}"))
        .map_err(|e| Error::config(format!("cannot derive websocket url: {e}")))
}

fn parse_ws_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::config(format!("invalid url '{url}': {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(Error::config(format!(
            "unsupported url scheme '{other}', expected ws or wss"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::transport::TransportState;
    use crate::transport::extension::{ListenerId, RuntimeListener};

    struct StubRuntime {
        id: Option<String>,
    }

    #[async_trait]
    impl ExtensionRuntime for StubRuntime {
        fn extension_id(&self) -> Option<String> {
            self.id.clone()
        }

        fn add_listener(&self, _listener: RuntimeListener) -> ListenerId {
            ListenerId(0)
        }

        fn remove_listener(&self, _id: ListenerId) {}

        async fn send_message(&self, _extension_id: &str, _message: Value) -> Result<Option<Value>> {
            Ok(None)
        }
    }

    fn runtime(id: Option<&str>) -> Arc<dyn ExtensionRuntime> {
        Arc::new(StubRuntime {
            id: id.map(str::to_string),
        })
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.kind, TransportKind::Auto);
        assert!(config.reconnect);
        assert_eq!(config.reconnect_interval, Duration::from_millis(3000));
        assert_eq!(config.max_reconnect_attempts, None);
    }

    #[test]
    fn test_from_json() {
        let config = TransportConfig::from_json(
            r#"{"type":"websocket","url":"ws://127.0.0.1:9000/ws","reconnectInterval":500,"maxReconnectAttempts":4}"#,
        )
        .expect("parse");

        assert_eq!(config.kind, TransportKind::WebSocket);
        assert_eq!(config.url.as_deref(), Some("ws://127.0.0.1:9000/ws"));
        assert!(config.reconnect);
        assert_eq!(config.reconnect_interval, Duration::from_millis(500));
        assert_eq!(config.max_reconnect_attempts, Some(4));
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(TransportKind::ChromeExtension).expect("serialize"),
            json!("chrome_extension")
        );
        let config = TransportConfig::from_json(r#"{"type":"auto"}"#).expect("parse");
        assert_eq!(config.kind, TransportKind::Auto);
    }

    #[test]
    fn test_rejects_unknown_kind_and_bad_values() {
        assert!(TransportConfig::from_json(r#"{"type":"carrier-pigeon"}"#).is_err());
        assert!(TransportConfig::from_json(r#"{"reconnectInterval":0}"#).is_err());
        assert!(TransportConfig::from_json(r#"{"url":"http://example.com"}"#).is_err());
    }

    #[test]
    fn test_derive_websocket_url() {
        let http = Url::parse("http://example.com/app/page.html").expect("url");
        assert_eq!(
            derive_websocket_url(&http).expect("derive").as_str(),
            "ws://example.com:8765/ws"
        );

        let https = Url::parse("https://example.com:8443/").expect("url");
        assert_eq!(
            derive_websocket_url(&https).expect("derive").as_str(),
            "wss://example.com:8765/ws"
        );

        let ipv6 = Url::parse("http://[::1]/").expect("url");
        assert_eq!(
            derive_websocket_url(&ipv6).expect("derive").as_str(),
            "ws://[::1]:8765/ws"
        );
    }

    #[test]
    fn test_websocket_without_url_or_origin_fails() {
        let err = create_transport(
            &TransportConfig {
                kind: TransportKind::WebSocket,
                ..TransportConfig::default()
            },
            &TransportEnvironment::new(),
        )
        .err()
        .expect("should fail");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_extension_without_runtime_fails() {
        let err = create_transport(
            &TransportConfig::chrome_extension(None),
            &TransportEnvironment::new(),
        )
        .err()
        .expect("should fail");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_explicit_websocket_is_closed_until_wired() {
        let transport = create_transport(
            &TransportConfig::websocket("ws://127.0.0.1:1/ws"),
            &TransportEnvironment::new(),
        )
        .expect("create");
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[test]
    fn test_auto_prefers_available_extension() {
        let env = TransportEnvironment::new()
            .with_extension_runtime(runtime(Some("relay")))
            .with_page_url(Url::parse("http://localhost/").expect("url"));

        let transport = create_transport(&TransportConfig::default(), &env).expect("create");
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[test]
    fn test_auto_falls_back_when_runtime_unavailable() {
        let env = TransportEnvironment::new().with_extension_runtime(runtime(None));
        let err = create_transport(&TransportConfig::default(), &env)
            .err()
            .expect("no origin to derive from");
        assert!(matches!(err, Error::Config { .. }));

        let env = env.with_page_url(Url::parse("https://example.com/").expect("url"));
        assert!(create_transport(&TransportConfig::default(), &env).is_ok());
    }
}
