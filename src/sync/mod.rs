use async_trait::async_trait;
use riptide_sync_types::{
    headers::ClientVersion,
    ClientMessage,
    SessionId,
    Timestamp,
};
use tokio::sync::{
    mpsc,
    watch,
};
use url::Url;

mod perf;
#[cfg(test)]
pub mod testing;
pub mod web_socket_manager;

pub use riptide_sync_types::ServerMessage;

/// Upon a protocol failure, an explanation of the failure to pass in on
/// reconnect
#[derive(Debug)]
pub struct ReconnectRequest {
    pub reason: ReconnectProtocolReason,
    pub max_observed_timestamp: Option<Timestamp>,
}

pub type ReconnectProtocolReason = String;

#[derive(Debug)]
pub enum ProtocolResponse {
    ServerMessage(ServerMessage),
    Failure,
}

/// Where the transport is in its connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebSocketState {
    Disconnected,
    Connecting,
    Ready,
    Paused,
    Stopping,
    Terminal,
}

/// Connection-independent configuration for a sync protocol.
pub struct ProtocolConfig {
    pub client_version: ClientVersion,
    /// Report reconnect telemetry to the server after long disconnects.
    pub report_debug_info: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            client_version: ClientVersion::new_rust_client(
                option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            ),
            report_debug_info: false,
        }
    }
}

/// The transport seam. [`web_socket_manager::WebSocketManager`] is the real
/// implementation; tests drive the client through
/// [`testing::TestProtocolManager`] instead of a socket.
#[async_trait]
pub trait SyncProtocol: Send + Sized + 'static {
    async fn open(
        ws_url: Url,
        on_response: mpsc::Sender<ProtocolResponse>,
        on_state_change: Option<watch::Sender<WebSocketState>>,
        session_id: SessionId,
        config: ProtocolConfig,
    ) -> anyhow::Result<Self>;

    /// Hand a frame to the transport. Returns `true` iff the frame was handed
    /// to an open socket. `false` means it was refused (no connection; the
    /// frame is dropped and the caller's restart resends its state) or
    /// deferred (paused; it flushes on [`Self::resume`]). Frames that reach
    /// the socket are delivered in send order.
    async fn send(&mut self, message: ClientMessage) -> anyhow::Result<bool>;

    /// Suspend sends, buffering outbound frames until [`Self::resume`].
    /// Used to keep credential rotations from interleaving with traffic.
    async fn pause(&mut self);

    async fn resume(&mut self);

    /// Tear down the current connection (if any) and dial a new one,
    /// returning once it is established (or the attempt failed and was
    /// reported). The caller resends its state immediately afterwards.
    async fn reconnect(&mut self, request: ReconnectRequest);

    /// Close the connection and stop reconnecting. The transport is unusable
    /// afterwards.
    async fn close(&mut self);
}
