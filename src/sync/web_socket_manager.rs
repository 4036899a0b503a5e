use std::{
    collections::VecDeque,
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use futures::{
    SinkExt,
    StreamExt,
};
use riptide_sync_types::{
    backoff::Backoff,
    headers::RIPTIDE_CLIENT_HEADER_NAME,
    ClientMessage,
    CloseReason,
    SessionId,
    Timestamp,
};
use serde_json::Value as JsonValue;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc,
        oneshot,
        watch,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::Message,
    },
    MaybeTlsStream,
    WebSocketStream,
};
use url::Url;

use super::{
    perf::PerfMarkCollector,
    ProtocolConfig,
    ProtocolResponse,
    ReconnectRequest,
    ServerMessage,
    SyncProtocol,
    WebSocketState,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(15);
/// A connection that survived this long was healthy: its loss resets the
/// backoff so the redial is immediate.
const STABLE_CONNECTION_THRESHOLD: Duration = Duration::from_secs(30);
/// The server pings at least every few seconds; a minute of silence means
/// the connection is dead even if the socket hasn't noticed.
const SERVER_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
/// Gap after which a successful reconnect reports telemetry.
const LONG_DISCONNECT_THRESHOLD: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum WebSocketRequest {
    /// The ack reports whether the frame was handed to an open socket.
    SendMessage(ClientMessage, oneshot::Sender<bool>),
    Pause,
    Resume,
    /// The ack fires once the dial attempt has either produced an open
    /// connection or reported its failure, so the caller can resend its
    /// state right behind the new `Connect` frame.
    Reconnect(ReconnectRequest, oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Owns the websocket connection on a background task.
///
/// The first dial happens at spawn; afterwards the manager only dials when
/// the client worker asks via [`SyncProtocol::reconnect`], with this
/// transport's own exponential backoff in front of each attempt. Connection
/// loss and failed dials are reported as [`ProtocolResponse::Failure`].
/// While no connection is open, sends are refused (`false`) rather than
/// buffered: the worker rebuilds its full state on reconnect anyway, and
/// refusal is what keeps "was this request possibly sent?" answerable.
pub struct WebSocketManager {
    request_sender: mpsc::Sender<WebSocketRequest>,
    worker: Option<JoinHandle<()>>,
}

#[async_trait]
impl SyncProtocol for WebSocketManager {
    async fn open(
        ws_url: Url,
        on_response: mpsc::Sender<ProtocolResponse>,
        on_state_change: Option<watch::Sender<WebSocketState>>,
        session_id: SessionId,
        config: ProtocolConfig,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            matches!(ws_url.scheme(), "ws" | "wss"),
            "Websocket URL must have a ws:// or wss:// scheme: {ws_url}"
        );
        let (request_sender, request_receiver) = mpsc::channel(32);
        let perf = config
            .report_debug_info
            .then(|| PerfMarkCollector::init(session_id));
        let worker = WebSocketWorker {
            ws_url,
            session_id,
            config,
            response_sender: on_response,
            state_sender: on_state_change,
            request_receiver,
            connection_count: 0,
            last_close_reason: CloseReason::InitialConnect.to_string(),
            max_observed_timestamp: None,
            backoff: Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF),
            redial_delay: None,
            paused: false,
            pause_buffer: VecDeque::new(),
            disconnected_at: None,
            perf,
        };
        let worker = tokio::spawn(worker.go());
        Ok(Self {
            request_sender,
            worker: Some(worker),
        })
    }

    async fn send(&mut self, message: ClientMessage) -> anyhow::Result<bool> {
        let (ack_sender, ack_receiver) = oneshot::channel();
        self.request_sender
            .send(WebSocketRequest::SendMessage(message, ack_sender))
            .await
            .map_err(|_| anyhow::anyhow!("Websocket worker has gone away"))?;
        ack_receiver
            .await
            .map_err(|_| anyhow::anyhow!("Websocket worker dropped a send"))
    }

    async fn pause(&mut self) {
        let _ = self.request_sender.send(WebSocketRequest::Pause).await;
    }

    async fn resume(&mut self) {
        let _ = self.request_sender.send(WebSocketRequest::Resume).await;
    }

    async fn reconnect(&mut self, request: ReconnectRequest) {
        let (ack_sender, ack_receiver) = oneshot::channel();
        if self
            .request_sender
            .send(WebSocketRequest::Reconnect(request, ack_sender))
            .await
            .is_ok()
        {
            let _ = ack_receiver.await;
        }
    }

    async fn close(&mut self) {
        let (ack_sender, ack_receiver) = oneshot::channel();
        if self
            .request_sender
            .send(WebSocketRequest::Close(ack_sender))
            .await
            .is_ok()
        {
            let _ = ack_receiver.await;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for WebSocketManager {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}

enum NextStep {
    Dial(Option<oneshot::Sender<()>>),
    Run(Box<WsStream>),
    AwaitReconnect,
    Stop,
}

struct WebSocketWorker {
    ws_url: Url,
    session_id: SessionId,
    config: ProtocolConfig,
    response_sender: mpsc::Sender<ProtocolResponse>,
    state_sender: Option<watch::Sender<WebSocketState>>,
    request_receiver: mpsc::Receiver<WebSocketRequest>,
    connection_count: u32,
    last_close_reason: String,
    max_observed_timestamp: Option<Timestamp>,
    backoff: Backoff,
    /// Delay owed before the next dial attempt, set when an attempt fails or
    /// an unstable connection drops.
    redial_delay: Option<Duration>,
    paused: bool,
    /// Frames deferred during a pause on a live connection. Never used
    /// across connections: between connections sends are refused instead.
    pause_buffer: VecDeque<ClientMessage>,
    disconnected_at: Option<Instant>,
    perf: Option<PerfMarkCollector>,
}

impl WebSocketWorker {
    async fn go(mut self) {
        // The first dial is immediate; afterwards the client worker paces
        // redials via reconnect requests.
        let mut step = NextStep::Dial(None);
        loop {
            step = match step {
                NextStep::Dial(dial_ack) => self.dial(dial_ack).await,
                NextStep::Run(ws) => self.run_connection(*ws).await,
                NextStep::AwaitReconnect => self.await_reconnect().await,
                NextStep::Stop => {
                    self.set_state(WebSocketState::Terminal);
                    return;
                },
            };
        }
    }

    /// One connection attempt, preceded by whatever backoff delay previous
    /// failures have accrued.
    async fn dial(&mut self, mut dial_ack: Option<oneshot::Sender<()>>) -> NextStep {
        self.set_state(WebSocketState::Connecting);
        self.mark("connect_attempt");
        if let Some(delay) = self.redial_delay.take() {
            let deadline = tokio::time::Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    request = self.request_receiver.recv() => match request {
                        Some(WebSocketRequest::SendMessage(_message, ack)) => {
                            let _ = ack.send(false);
                        },
                        Some(WebSocketRequest::Pause) => self.paused = true,
                        Some(WebSocketRequest::Resume) => self.paused = false,
                        Some(WebSocketRequest::Reconnect(request, ack)) => {
                            // Already dialing; just take the metadata.
                            self.apply_reconnect_request(request);
                            dial_ack = Some(ack);
                        },
                        Some(WebSocketRequest::Close(ack)) => {
                            self.set_state(WebSocketState::Stopping);
                            let _ = ack.send(());
                            return NextStep::Stop;
                        },
                        None => return NextStep::Stop,
                    },
                }
            }
        }

        let mut ws = match self.try_connect().await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!("Failed to connect to {}: {e:?}", self.ws_url);
                return self.fail_dial(dial_ack, CloseReason::ConnectError).await;
            },
        };

        // The connect frame precedes everything, deferred frames included.
        let connect = ClientMessage::Connect {
            session_id: self.session_id,
            connection_count: self.connection_count,
            last_close_reason: self.last_close_reason.clone(),
            max_observed_timestamp: self.max_observed_timestamp,
        };
        self.connection_count += 1;
        if let Err(e) = send_frame(&mut ws, connect).await {
            tracing::error!("Failed to send connect frame: {e:?}");
            return self.fail_dial(dial_ack, CloseReason::ClientError).await;
        }
        self.mark("connected");
        if let Some(disconnected_at) = self.disconnected_at.take() {
            if disconnected_at.elapsed() >= LONG_DISCONNECT_THRESHOLD {
                if let Some(perf) = &mut self.perf {
                    let event = perf.drain_event("LongDisconnect");
                    let _ = send_frame(&mut ws, ClientMessage::Event(event)).await;
                }
            }
        }
        self.set_state(if self.paused {
            WebSocketState::Paused
        } else {
            WebSocketState::Ready
        });
        if let Some(ack) = dial_ack {
            let _ = ack.send(());
        }
        NextStep::Run(Box::new(ws))
    }

    /// Report a failed dial attempt and wait for the next reconnect request.
    async fn fail_dial(
        &mut self,
        dial_ack: Option<oneshot::Sender<()>>,
        reason: CloseReason,
    ) -> NextStep {
        self.last_close_reason = reason.to_string();
        self.redial_delay = Some(self.backoff.fail(&mut rand::rng()));
        if let Some(ack) = dial_ack {
            let _ = ack.send(());
        }
        self.set_state(WebSocketState::Disconnected);
        if self
            .response_sender
            .send(ProtocolResponse::Failure)
            .await
            .is_err()
        {
            return NextStep::Stop;
        }
        NextStep::AwaitReconnect
    }

    async fn try_connect(&self) -> anyhow::Result<WsStream> {
        let mut request = self.ws_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            RIPTIDE_CLIENT_HEADER_NAME.clone(),
            HeaderValue::from_str(&self.config.client_version.to_string())?,
        );
        let (ws, _response) = connect_async(request).await?;
        Ok(ws)
    }

    async fn run_connection(&mut self, mut ws: WsStream) -> NextStep {
        let opened_at = Instant::now();
        let mut last_server_activity = tokio::time::Instant::now();

        loop {
            tokio::select! {
                message = ws.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        last_server_activity = tokio::time::Instant::now();
                        let parsed = serde_json::from_str::<JsonValue>(text.as_str())
                            .map_err(anyhow::Error::from)
                            .and_then(ServerMessage::try_from);
                        match parsed {
                            Ok(message) => {
                                if self
                                    .response_sender
                                    .send(ProtocolResponse::ServerMessage(message))
                                    .await
                                    .is_err()
                                {
                                    // Client has gone away.
                                    let _ = ws.close(None).await;
                                    return NextStep::Stop;
                                }
                            },
                            Err(e) => {
                                tracing::error!("Received malformed server frame: {e:?}");
                                return self
                                    .connection_lost(ws, opened_at, CloseReason::ClientError)
                                    .await;
                            },
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        last_server_activity = tokio::time::Instant::now();
                        let _ = ws.send(Message::Pong(payload)).await;
                    },
                    Some(Ok(Message::Pong(_))) => {
                        last_server_activity = tokio::time::Instant::now();
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::warn!("Server closed the connection: {frame:?}");
                        return self
                            .connection_lost(ws, opened_at, CloseReason::ServerClose)
                            .await;
                    },
                    Some(Ok(_)) => (),
                    Some(Err(e)) => {
                        tracing::error!("Websocket error: {e:?}");
                        return self
                            .connection_lost(ws, opened_at, CloseReason::ClientError)
                            .await;
                    },
                    None => {
                        return self
                            .connection_lost(ws, opened_at, CloseReason::ServerClose)
                            .await;
                    },
                },
                request = self.request_receiver.recv() => match request {
                    Some(WebSocketRequest::SendMessage(message, ack)) => {
                        if self.paused {
                            self.pause_buffer.push_back(message);
                            let _ = ack.send(false);
                        } else {
                            // The frame is going onto an open socket; even a
                            // write error can't prove it didn't arrive.
                            let _ = ack.send(true);
                            if let Err(e) = send_frame(&mut ws, message).await {
                                tracing::error!("Failed to send frame: {e:?}");
                                return self
                                    .connection_lost(ws, opened_at, CloseReason::ClientError)
                                    .await;
                            }
                        }
                    },
                    Some(WebSocketRequest::Pause) => {
                        self.paused = true;
                        self.set_state(WebSocketState::Paused);
                    },
                    Some(WebSocketRequest::Resume) => {
                        self.paused = false;
                        if let Err(e) = self.flush_pause_buffer(&mut ws).await {
                            tracing::error!("Failed to flush on resume: {e:?}");
                            return self
                                .connection_lost(ws, opened_at, CloseReason::ClientError)
                                .await;
                        }
                        self.set_state(WebSocketState::Ready);
                    },
                    Some(WebSocketRequest::Reconnect(request, ack)) => {
                        let _ = ws.close(None).await;
                        self.apply_reconnect_request(request);
                        return NextStep::Dial(Some(ack));
                    },
                    Some(WebSocketRequest::Close(ack)) => {
                        self.set_state(WebSocketState::Stopping);
                        let _ = ws.close(None).await;
                        let _ = ack.send(());
                        return NextStep::Stop;
                    },
                    None => {
                        let _ = ws.close(None).await;
                        return NextStep::Stop;
                    },
                },
                _ = tokio::time::sleep_until(last_server_activity + SERVER_INACTIVITY_TIMEOUT) => {
                    tracing::warn!(
                        "No server activity for {SERVER_INACTIVITY_TIMEOUT:?}; reconnecting."
                    );
                    return self
                        .connection_lost(ws, opened_at, CloseReason::ServerInactivityTimeout)
                        .await;
                },
            }
        }
    }

    /// Tear the connection down and tell the client worker, which decides
    /// when to ask for a redial.
    async fn connection_lost(
        &mut self,
        mut ws: WsStream,
        opened_at: Instant,
        reason: CloseReason,
    ) -> NextStep {
        let _ = ws.close(None).await;
        if opened_at.elapsed() >= STABLE_CONNECTION_THRESHOLD {
            self.backoff.reset();
        } else {
            self.redial_delay = Some(self.backoff.fail(&mut rand::rng()));
        }
        self.last_close_reason = reason.to_string();
        self.disconnected_at = Some(Instant::now());
        self.mark("disconnected");
        self.set_state(WebSocketState::Disconnected);
        if self
            .response_sender
            .send(ProtocolResponse::Failure)
            .await
            .is_err()
        {
            return NextStep::Stop;
        }
        NextStep::AwaitReconnect
    }

    async fn await_reconnect(&mut self) -> NextStep {
        loop {
            match self.request_receiver.recv().await {
                Some(WebSocketRequest::SendMessage(_message, ack)) => {
                    // No socket to hand the frame to. The client worker
                    // resends its state once it asks for a reconnect.
                    let _ = ack.send(false);
                },
                Some(WebSocketRequest::Pause) => self.paused = true,
                Some(WebSocketRequest::Resume) => self.paused = false,
                Some(WebSocketRequest::Reconnect(request, ack)) => {
                    self.apply_reconnect_request(request);
                    return NextStep::Dial(Some(ack));
                },
                Some(WebSocketRequest::Close(ack)) => {
                    self.set_state(WebSocketState::Stopping);
                    let _ = ack.send(());
                    return NextStep::Stop;
                },
                None => return NextStep::Stop,
            }
        }
    }

    fn apply_reconnect_request(&mut self, request: ReconnectRequest) {
        self.last_close_reason = request.reason;
        if request.max_observed_timestamp.is_some() {
            self.max_observed_timestamp = request.max_observed_timestamp;
        }
        // The worker replays its state from scratch on the new connection;
        // frames deferred for the old one are stale.
        self.pause_buffer.clear();
    }

    async fn flush_pause_buffer(&mut self, ws: &mut WsStream) -> anyhow::Result<()> {
        while let Some(message) = self.pause_buffer.pop_front() {
            send_frame(ws, message).await?;
        }
        Ok(())
    }

    fn set_state(&self, state: WebSocketState) {
        if let Some(sender) = &self.state_sender {
            let _ = sender.send(state);
        }
    }

    fn mark(&mut self, name: &'static str) {
        if let Some(perf) = &mut self.perf {
            perf.mark(name);
        }
    }
}

async fn send_frame(ws: &mut WsStream, message: ClientMessage) -> anyhow::Result<()> {
    let json = JsonValue::from(message);
    ws.send(Message::text(json.to_string())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use riptide_sync_types::SessionId;
    use tokio::sync::{
        mpsc,
        watch,
    };

    use super::{
        SyncProtocol,
        WebSocketManager,
        WebSocketState,
    };
    use crate::sync::{
        ProtocolConfig,
        ProtocolResponse,
    };

    #[tokio::test]
    async fn test_rejects_non_websocket_scheme() {
        let (response_sender, _response_receiver) = mpsc::channel(1);
        let result = WebSocketManager::open(
            "https://example.riptide.host/api/1.1/sync".parse().unwrap(),
            response_sender,
            None,
            SessionId::nil(),
            ProtocolConfig::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_dial_reports_failure_and_refuses_sends() {
        let (response_sender, mut response_receiver) = mpsc::channel(1);
        let (state_sender, state_receiver) = watch::channel(WebSocketState::Disconnected);
        // Nothing listens on this port; the first dial fails.
        let mut manager = WebSocketManager::open(
            "ws://127.0.0.1:9/api/1.1/sync".parse().unwrap(),
            response_sender,
            Some(state_sender),
            SessionId::nil(),
            ProtocolConfig::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            response_receiver.recv().await,
            Some(ProtocolResponse::Failure)
        ));
        // With no connection, frames are refused rather than buffered.
        let handed_to_socket = manager
            .send(riptide_sync_types::ClientMessage::Event(
                riptide_sync_types::ClientEvent {
                    event_type: "test".to_owned(),
                    event: serde_json::json!({}),
                },
            ))
            .await
            .unwrap();
        assert!(!handed_to_socket);

        manager.close().await;
        assert_eq!(*state_receiver.borrow(), WebSocketState::Terminal);
    }
}
