//! Registry server with an in-process page.
//!
//! Demonstrates:
//! - Starting a registry with its background sweep
//! - Serving it over WebSocket
//! - A page-side WebSocket transport that answers `echo` commands
//! - Sending commands and handling a timeout
//!
//! Usage:
//!   cargo run --example registry_server
//!   cargo run --example registry_server -- --debug
//!   cargo run --example registry_server -- --no-wait
//!   cargo run --example registry_server -- --port 8765

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pagewire::{
    Command, ConnectionRegistry, RegistryConfig, RegistryServer, SessionId, Transport,
    TransportHandlers, WebSocketOptions, WebSocketTransport,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Args
// ============================================================================

#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    no_wait: bool,
    port: u16,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let port = args
            .iter()
            .position(|a| a == "--port")
            .and_then(|i| args.get(i + 1))
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        Self {
            debug: args.iter().any(|a| a == "--debug"),
            no_wait: args.iter().any(|a| a == "--no-wait"),
            port,
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug { "pagewire=debug" } else { "pagewire=info" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    println!("=== Registry Server ===\n");

    // ========================================================================
    // Start Registry
    // ========================================================================

    println!("[1] Starting registry...");

    let registry = ConnectionRegistry::start(RegistryConfig::default());
    let server = RegistryServer::bind(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        args.port,
        Arc::clone(&registry),
    )
    .await
    .context("binding registry server")?;

    println!("    ✓ Listening on {}\n", server.ws_url());

    // ========================================================================
    // Connect Page
    // ========================================================================

    println!("[2] Connecting page (session demo-1)...");

    let page = Arc::new(WebSocketTransport::new(WebSocketOptions::new(format!(
        "{}?sessionId=demo-1",
        server.ws_url()
    ))));
    let responder = Arc::downgrade(&page);
    page.set_handlers(TransportHandlers::new().on_message(move |message| {
        let Some(page) = responder.upgrade() else {
            return;
        };
        if message["type"] == "echo" {
            let _ = page.send(json!({
                "commandId": message["id"],
                "success": true,
                "data": message["payload"],
            }));
        }
    }));

    let session = SessionId::new("demo-1").context("session id")?;
    let connection = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(connection) = registry.get_connection_by_session_id(&session) {
                return connection;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("page did not register")?;

    println!("    ✓ Registered as {}\n", connection.id);

    // ========================================================================
    // Send Commands
    // ========================================================================

    println!("[3] Sending echo...");

    let reply = registry
        .send_command(
            &connection.id,
            Command::with_payload("echo", json!({ "v": 1 })),
            Duration::from_secs(5),
        )
        .await?;

    println!("    ✓ Reply: {reply}\n");

    println!("[4] Sending a command the page ignores...");

    match registry
        .send_command(&connection.id, Command::new("noop"), Duration::from_millis(500))
        .await
    {
        Err(e) if e.is_timeout() => println!("    ✓ {e}\n"),
        other => println!("    ✗ Unexpected: {other:?}\n"),
    }

    // ========================================================================
    // Wait / Shutdown
    // ========================================================================

    if args.no_wait {
        println!("[--no-wait] Skipping wait");
    } else {
        println!("Press Ctrl+C to exit...");
        tokio::signal::ctrl_c().await.ok();
    }

    page.close();
    server.shutdown();
    registry.shutdown();

    println!("\n=== Done ===");
    Ok(())
}
