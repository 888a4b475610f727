//! Shared pieces of the rpcmux examples.

use std::net::SocketAddr;
use std::time::Duration;

use rpcmux::{ConnectionInfo, ProcedureRouter, Status};
use serde::{Deserialize, Serialize};

/// Returns the server address from PORT env var, defaulting to 3000.
pub fn server_addr() -> SocketAddr {
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".into());
    format!("0.0.0.0:{port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3000)))
}

/// Per-connection context: the caller named by the `x-user` header.
#[derive(Clone, Debug)]
pub struct Ctx {
    pub user: Option<String>,
}

pub async fn create_context(info: ConnectionInfo) -> Result<Ctx, Status> {
    let user = info
        .headers
        .get("x-user")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    Ok(Ctx { user })
}

#[derive(Debug, Deserialize)]
pub struct AddInput {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Serialize)]
pub struct Tick {
    pub n: u64,
    pub user: Option<String>,
}

const USERS: [&str; 3] = ["Alice", "Bob", "Carol"];

/// The demo procedures.
pub fn app_router() -> ProcedureRouter<Ctx> {
    ProcedureRouter::new()
        .query("getUser", |_ctx, id: usize| async move {
            id.checked_sub(1)
                .and_then(|i| USERS.get(i))
                .copied()
                .ok_or_else(|| Status::not_found(format!("no user with id {id}")))
        })
        .query("whoami", |ctx: Ctx, _: ()| async move {
            ctx.user.ok_or_else(|| Status::unauthorized("send an x-user header"))
        })
        .mutation("add", |_ctx, input: AddInput| async move {
            input
                .a
                .checked_add(input.b)
                .ok_or_else(|| Status::bad_request("overflow"))
        })
        .subscription("onTick", |ctx: Ctx, count: Option<u64>| async move {
            let count = count.unwrap_or(5);
            Ok::<_, Status>(async_stream::stream! {
                for n in 0..count {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    yield Ok::<_, Status>(Tick { n, user: ctx.user.clone() });
                }
            })
        })
}
