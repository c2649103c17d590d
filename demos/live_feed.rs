//! Live feed with automatic reconnection.
//!
//! Demonstrates:
//! - Building a controller for a WebSocket or SSE endpoint
//! - Observing state transitions
//! - Keep-alive on WebSocket endpoints
//! - Suspending while "hidden" via the visibility coordinator
//!
//! Usage:
//!   cargo run --example live_feed -- wss://ws.postman-echo.com/raw
//!   cargo run --example live_feed -- https://sse.dev/test --sse
//!   cargo run --example live_feed -- <url> --debug
//!   cargo run --example live_feed -- <url> --blink

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use livewire::{
    ConnectionController, ConnectionState, TransportKind, VisibilityCoordinator,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_URL: &str = "wss://ws.postman-echo.com/raw";
const BLINK_PERIOD: Duration = Duration::from_secs(10);

// ============================================================================
// Args
// ============================================================================

/// Command-line arguments.
#[derive(Debug, Clone)]
struct Args {
    url: String,
    debug: bool,
    sse: bool,
    blink: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self {
            url: args
                .iter()
                .find(|a| !a.starts_with("--"))
                .cloned()
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            debug: args.iter().any(|a| a == "--debug"),
            sse: args.iter().any(|a| a == "--sse"),
            blink: args.iter().any(|a| a == "--blink"),
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug { "livewire=debug" } else { "livewire=info" };

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
    println!("=== Live Feed ===\n");

    let transport = if args.sse {
        TransportKind::EventStream
    } else {
        TransportKind::WebSocket
    };
    let visibility = VisibilityCoordinator::new();

    let controller = ConnectionController::<Value>::builder()
        .url(&args.url)
        .transport(transport)
        .max_retries(5)
        .retry_delay_ms(1_000)
        .ping_pong(!args.sse)
        .visibility(visibility.clone())
        .on_open(|| println!("[open]"))
        .on_message(|message| println!("[{}] {}", message.session, message.data))
        .on_error(|e| println!("[error] {e}"))
        .on_close(|info| println!("[close] code={} clean={}", info.code, info.was_clean))
        .spawn()?;

    println!("[Setup] Connecting to {} over {transport}\n", args.url);

    let mut changes = controller.state_changes();
    let mut blink = tokio::time::interval(BLINK_PERIOD);
    blink.tick().await;

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = changes.borrow_and_update().clone();
                println!(
                    "[state] {} (retries={}, error={:?})",
                    status.state, status.retry_count, status.error
                );

                if status.state == ConnectionState::Connected && !args.sse {
                    controller.send_json(&serde_json::json!({"type": "hello"}))?;
                }
            }

            _ = blink.tick(), if args.blink => {
                let visible = !visibility.is_visible();
                println!("[visibility] {}", if visible { "visible" } else { "hidden" });
                visibility.set_visible(visible);
            }

            _ = tokio::signal::ctrl_c() => {
                println!("\n[Ctrl+C] Closing");
                break;
            }
        }
    }

    controller.close();
    println!("Final status: {:?}", controller.status());

    Ok(())
}
