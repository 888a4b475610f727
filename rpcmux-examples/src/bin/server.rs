//! Example 1: WebSocket Server
//!
//! This example serves the demo procedures over a persistent connection:
//! - Queries and mutations answered with one `data` frame
//! - A subscription streaming ticks until stopped or exhausted
//! - Ctrl-C broadcasts a reconnect notification before shutting down
//!
//! Run with: cargo run --bin server
//! Test with: websocat ws://localhost:3000/ws

use rpcmux::RpcServer;
use rpcmux_examples::{app_router, create_context, server_addr};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rpcmux=debug")),
        )
        .init();

    let server = RpcServer::builder(app_router(), create_context).build();
    let app = server.clone().into_router::<()>("/ws");

    let addr = server_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    println!("=== Example 1: WebSocket Server ===");
    println!("Server listening on ws://{}/ws", addr);
    println!();
    println!("Procedures:");
    println!("  - getUser (query)");
    println!("  - whoami (query, uses the x-user header)");
    println!("  - add (mutation)");
    println!("  - onTick (subscription)");
    println!();
    println!("Try:");
    println!("  websocat ws://localhost:3000/ws");
    println!("  {{\"id\": 1, \"method\": \"query\", \"params\": {{\"path\": \"getUser\", \"input\": 1}}}}");
    println!("  {{\"id\": 2, \"method\": \"subscription\", \"params\": {{\"path\": \"onTick\", \"input\": 3}}}}");
    println!("  {{\"id\": 2, \"method\": \"subscription.stop\"}}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let reached = server.broadcast_reconnect_notification();
            tracing::info!(reached, "shutting down");
        })
        .await?;
    Ok(())
}
