//! Command correlation benchmark suite.
//!
//! Measures registry round trips over in-process transports:
//! - Single command latency
//! - Concurrent commands across connection counts: 1, 10, 50
//!
//! Run with: cargo bench --bench correlation
//! Results saved to: target/criterion/

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures_util::future::join_all;
use pagewire::{
    Command, ConnectionId, ConnectionRegistry, MemoryTransport, PageInfo, RegistryConfig,
    Transport, TransportHandlers,
};
use serde_json::json;
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const CONNECTION_COUNTS: &[usize] = &[1, 10, 50];
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

/// Registers an echoing page and returns its ID and page-side end.
fn echo_page(registry: &Arc<ConnectionRegistry>) -> (ConnectionId, Arc<MemoryTransport>) {
    let (server_side, page_side) = MemoryTransport::pair();
    let id = registry.add_connection(server_side, PageInfo::default());

    let weak = Arc::downgrade(&page_side);
    page_side.set_handlers(TransportHandlers::new().on_message(move |message| {
        if let Some(page) = weak.upgrade() {
            let _ = page.send(json!({
                "commandId": message["id"],
                "success": true,
                "data": message["payload"],
            }));
        }
    }));

    (id, page_side)
}

// ============================================================================
// Benchmark: Single Round Trip
// ============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let registry = rt.block_on(async { ConnectionRegistry::start(RegistryConfig::default()) });
    let (id, _page) = echo_page(&registry);

    c.bench_function("round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            registry
                .send_command(&id, Command::with_payload("echo", json!({ "v": 1 })), COMMAND_TIMEOUT)
                .await
                .expect("reply")
        });
    });

    registry.shutdown();
}

// ============================================================================
// Benchmark: Concurrent Commands
// ============================================================================

fn bench_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("concurrent");

    for &count in CONNECTION_COUNTS {
        let registry = rt.block_on(async { ConnectionRegistry::start(RegistryConfig::default()) });
        let pages: Vec<_> = (0..count).map(|_| echo_page(&registry)).collect();

        group.bench_with_input(BenchmarkId::new("connections", count), &pages, |b, pages| {
            b.to_async(&rt).iter(|| async {
                let commands = pages.iter().map(|(id, _)| {
                    registry.send_command(id, Command::new("echo"), COMMAND_TIMEOUT)
                });
                for result in join_all(commands).await {
                    result.expect("reply");
                }
            });
        });

        registry.shutdown();
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_concurrent);
criterion_main!(benches);
