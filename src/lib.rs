//! # Riptide client
//!
//! Rust client library for [Riptide], a reactive backend: server-evaluated
//! queries pushed to subscribed clients as consistent snapshots, with
//! mutations and actions multiplexed over the same connection.
//!
//! This crate's entry point is [`RiptideClient`], an asynchronous client
//! built on [`tokio`]:
//!
//! ```no_run
//! use futures::StreamExt;
//! use riptide::RiptideClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut client = RiptideClient::new("https://cool-music-123.riptide.host").await?;
//!     let mut sub = client.subscribe("messages:list", maplit::btreemap! {}).await?;
//!     while let Some(result) = sub.next().await {
//!         println!("{result:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Hosts with their own event loop can skip the tokio layer and drive
//! [`base_client::BaseRiptideClient`] directly: it is a sans-io state machine
//! that consumes inbound frames and produces outbound ones.
//!
//! [Riptide]: https://riptide.dev

pub mod base_client;
mod client;
pub mod sync;

pub use base_client::{
    BaseRiptideClient,
    FunctionResult,
    OptimisticLocalStore,
    QueryResults,
    SubscriberId,
};
pub use client::{
    auth::{
        AuthToken,
        AuthTokenFetcher,
    },
    subscription::{
        QuerySetSubscription,
        QuerySubscription,
    },
    ClientOptions,
    ConnectionState,
    RiptideClient,
};
pub use riptide_sync_types::{
    Timestamp,
    UdfPath,
};
pub use sync::WebSocketState;

/// Terminal failures surfaced through request futures: the operation will
/// never complete and the connection (or client) is gone or untrusted.
/// Application-level failures are [`FunctionResult::ErrorMessage`] instead.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The client was closed (or dropped) with the request in flight.
    #[error("Client is closed")]
    Closed,
    /// The server broke the sync protocol's invariants; its state cannot be
    /// trusted and the client has shut down.
    #[error("Protocol violation: {0}")]
    Protocol(String),
    /// The connection dropped after this action may have reached the server.
    /// Actions are not idempotent, so it cannot be safely retried; the
    /// caller decides whether to resubmit.
    #[error("Connection lost while action was in flight")]
    ActionLostWhileReconnecting,
    /// The server reported an unrecoverable error; the client has shut down.
    #[error("Fatal server error: {0}")]
    FatalServerError(String),
}
