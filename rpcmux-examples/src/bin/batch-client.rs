//! Example 2: Batching Client
//!
//! Issues several queries concurrently; they leave as a single HTTP request:
//!
//!   GET {base}/getUser,getUser,getUser?batch=1&input=[1,2,3]
//!
//! The client speaks the batched HTTP call format, so point it at any
//! endpoint serving it.
//!
//! Run with: BASE_URL=http://localhost:3000/trpc cargo run --bin batch-client

use std::time::Duration;

use rpcmux_client::{CancellationToken, RpcClient};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rpcmux_client=debug")),
        )
        .init();

    let base_url =
        std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000/trpc".into());
    let client = RpcClient::builder(&base_url)
        .timeout(Duration::from_secs(5))
        .header("x-user", "example")
        .build()?;

    println!("=== Example 2: Batching Client ===");
    println!("Base URL: {}", base_url);
    println!();

    let (first, second, third) = tokio::join!(
        client.query::<_, Value>("getUser", &1),
        client.query::<_, Value>("getUser", &2),
        client.query::<_, Value>("getUser", &3),
    );
    for (id, result) in [(1, first), (2, second), (3, third)] {
        match result {
            Ok(user) => println!("getUser({id}) -> {user}"),
            Err(e) => println!("getUser({id}) failed: {e}"),
        }
    }

    let sum: Result<Value, _> = client.mutation("add", &json!({"a": 2, "b": 40})).await;
    println!("add(2, 40) -> {sum:?}");

    // Cancelling a scope before the batch leaves drops only that call.
    let scope = CancellationToken::new();
    let cancelled = client.query_with_scope::<_, Value>("getUser", &1, &scope);
    scope.cancel();
    match cancelled.await {
        Ok(user) => println!("cancelled call still answered: {user}"),
        Err(e) => println!("cancelled call -> {e}"),
    }

    Ok(())
}
