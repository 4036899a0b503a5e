/// Testing helpers for the protocol module.
use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use riptide_sync_types::{
    ClientMessage,
    SessionId,
};
use tokio::sync::{
    mpsc,
    watch,
};
use url::Url;

use super::{
    ProtocolConfig,
    ProtocolResponse,
    ReconnectRequest,
    ServerMessage,
    SyncProtocol,
    WebSocketState,
};

#[derive(Debug)]
struct TestProtocolInner {
    closed: bool,
    paused: bool,
    /// While false, sends are refused (`Ok(false)`) the way a disconnected
    /// transport refuses them. Frames are still recorded for assertions.
    connected: bool,
    pause_count: usize,
    resume_count: usize,
    connection_count: u32,
    session_id: SessionId,
    sent_messages: Vec<ClientMessage>,
}

#[derive(Clone)]
pub struct TestProtocolManager {
    inner: Arc<Mutex<TestProtocolInner>>,
    response_sender: mpsc::Sender<ProtocolResponse>,
}

impl TestProtocolManager {
    pub async fn fake_server_response(&mut self, message: ServerMessage) -> anyhow::Result<()> {
        self.response_sender
            .send(ProtocolResponse::ServerMessage(message))
            .await?;
        Ok(())
    }

    /// Simulate the connection dropping out from under the client.
    pub async fn fake_connection_failure(&mut self) -> anyhow::Result<()> {
        self.response_sender.send(ProtocolResponse::Failure).await?;
        Ok(())
    }

    pub async fn wait_until_n_messages_sent(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.inner.lock().sent_messages.len() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Test timed out waiting for messages to be sent");
    }

    pub async fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.inner.lock().sent_messages)
    }

    /// Wait for the nth pause/resume cycle to complete.
    pub async fn wait_until_n_resumes(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.inner.lock().resume_count < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Test timed out waiting for the transport to resume");
    }

    pub fn pause_count(&self) -> usize {
        self.inner.lock().pause_count
    }

    pub fn resume_count(&self) -> usize {
        self.inner.lock().resume_count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Make the transport refuse sends, as if the socket were gone.
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().connected = connected;
    }

    fn push_connect(&mut self, last_close_reason: String, max_observed_timestamp: Option<riptide_sync_types::Timestamp>) {
        let mut inner = self.inner.lock();
        // A (re)connect produces an open socket.
        inner.connected = true;
        let connect = ClientMessage::Connect {
            session_id: inner.session_id,
            connection_count: inner.connection_count,
            last_close_reason,
            max_observed_timestamp,
        };
        inner.connection_count += 1;
        inner.sent_messages.push(connect);
    }
}

#[async_trait]
impl SyncProtocol for TestProtocolManager {
    async fn open(
        _ws_url: Url,
        response_sender: mpsc::Sender<ProtocolResponse>,
        on_state_change: Option<watch::Sender<WebSocketState>>,
        session_id: SessionId,
        _config: ProtocolConfig,
    ) -> anyhow::Result<Self> {
        let mut test_protocol = TestProtocolManager {
            inner: Arc::new(Mutex::new(TestProtocolInner {
                closed: false,
                paused: false,
                connected: true,
                pause_count: 0,
                resume_count: 0,
                connection_count: 0,
                session_id,
                sent_messages: vec![],
            })),
            response_sender,
        };
        if let Some(state_sender) = on_state_change {
            let _ = state_sender.send(WebSocketState::Ready);
        }
        test_protocol.push_connect("InitialConnect".to_string(), None);
        Ok(test_protocol)
    }

    async fn send(&mut self, message: ClientMessage) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(!inner.closed, "Websocket is closed");
        inner.sent_messages.push(message);
        Ok(inner.connected && !inner.paused)
    }

    async fn pause(&mut self) {
        let mut inner = self.inner.lock();
        inner.paused = true;
        inner.pause_count += 1;
    }

    async fn resume(&mut self) {
        let mut inner = self.inner.lock();
        inner.paused = false;
        inner.resume_count += 1;
    }

    async fn reconnect(&mut self, request: ReconnectRequest) {
        self.push_connect(request.reason, request.max_observed_timestamp);
    }

    async fn close(&mut self) {
        self.inner.lock().closed = true;
    }
}
