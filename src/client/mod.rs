use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Instant,
};

#[cfg(doc)]
use futures::Stream;
use futures::StreamExt;
use riptide_sync_types::{
    headers::ClientVersion,
    SessionId,
    UdfPath,
    UserIdentityAttributes,
};
use serde_json::Value as JsonValue;
use tokio::{
    sync::{
        broadcast,
        mpsc,
        oneshot,
        watch,
    },
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use url::Url;
use uuid::Uuid;

use crate::{
    base_client::{
        BaseRiptideClient,
        FunctionResult,
        OptimisticLocalStore,
        QueryResults,
    },
    client::{
        auth::{
            AuthTokenFetcher,
            AuthChangeCallback,
        },
        subscription::{
            QuerySetSubscription,
            QuerySubscription,
        },
        worker::{
            worker,
            ActionRequest,
            ClientRequest,
            LocalQueryRequest,
            MutationRequest,
            SetAdminAuthRequest,
            SetAuthRequest,
            SubscribeRequest,
        },
    },
    sync::{
        web_socket_manager::WebSocketManager,
        ProtocolConfig,
        SyncProtocol,
        WebSocketState,
    },
};

pub mod auth;
pub mod subscription;
mod worker;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

/// The version of the sync protocol this client speaks, baked into the
/// websocket path so proxies can route by it.
const SYNC_PROTOCOL_VERSION: &str = "1.1";

/// Options for [`RiptideClient::new_with_options`].
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    /// Send connection telemetry (reconnects after long disconnects) to the
    /// deployment. Off by default.
    pub report_debug_info: bool,
}

/// A snapshot of the connection's health, for display in connection
/// indicators and debugging.
#[derive(Clone, Debug)]
pub struct ConnectionState {
    pub web_socket_state: WebSocketState,
    pub has_inflight_requests: bool,
    pub has_incomplete_requests: bool,
    pub time_of_oldest_inflight_request: Option<Instant>,
}

/// An asynchronous client to interact with a specific deployment to perform
/// mutations and manage query subscriptions using [`tokio`].
///
/// The client requires a deployment url, which can be found in the
/// deployment's dashboard settings.
///
/// ```no_run
/// use futures::StreamExt;
/// use riptide::RiptideClient;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut client = RiptideClient::new("https://cool-music-123.riptide.host").await?;
///     let mut sub = client.subscribe("messages:list", maplit::btreemap! {}).await?;
///     while let Some(result) = sub.next().await {
///         println!("{result:?}");
///     }
///     Ok(())
/// }
/// ```
///
/// The [`RiptideClient`] internally holds a connection and a [`tokio`]
/// background task to manage it. It is advised that you create one and
/// **reuse** it. You can safely clone with [`RiptideClient::clone()`] to
/// share the connection and outstanding subscriptions.
pub struct RiptideClient {
    listen_handle: Option<Arc<JoinHandle<()>>>,
    request_sender: mpsc::UnboundedSender<ClientRequest>,
    watch_receiver: broadcast::Receiver<QueryResults>,
}

/// Clone the [`RiptideClient`], sharing the connection and outstanding
/// subscriptions.
impl Clone for RiptideClient {
    fn clone(&self) -> Self {
        Self {
            listen_handle: self.listen_handle.clone(),
            request_sender: self.request_sender.clone(),
            watch_receiver: self.watch_receiver.resubscribe(),
        }
    }
}

/// Drop the [`RiptideClient`]. When the final reference to the
/// [`RiptideClient`] is dropped, the connection is cleaned up.
impl Drop for RiptideClient {
    fn drop(&mut self) {
        if let Some(listen_handle) = self.listen_handle.take() {
            if let Ok(j_handle) = Arc::try_unwrap(listen_handle) {
                j_handle.abort()
            }
        }
    }
}

impl RiptideClient {
    /// Constructs a new client for communicating with `deployment_url`.
    ///
    /// ```no_run
    /// # use riptide::RiptideClient;
    /// # #[tokio::main]
    /// # async fn main() -> anyhow::Result<()> {
    /// let client = RiptideClient::new("https://cool-music-123.riptide.host").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(deployment_url: &str) -> anyhow::Result<Self> {
        Self::new_with_options(deployment_url, ClientOptions::default()).await
    }

    pub async fn new_with_options(
        deployment_url: &str,
        options: ClientOptions,
    ) -> anyhow::Result<Self> {
        let ws_url = deployment_to_ws_url(deployment_url.try_into()?)?;
        let session_id = SessionId::new(Uuid::new_v4());

        // Channels for the `listen` background thread
        let (response_sender, response_receiver) = mpsc::channel(1);
        let (request_sender, request_receiver) = mpsc::unbounded_channel();

        // Listener for when each transition completes
        let (watch_sender, watch_receiver) = broadcast::channel(1);

        let (state_sender, state_receiver) = watch::channel(WebSocketState::Disconnected);

        let base_client = BaseRiptideClient::new();
        let config = ProtocolConfig {
            client_version: ClientVersion::new_rust_client(VERSION.unwrap_or("unknown")),
            report_debug_info: options.report_debug_info,
        };
        let protocol =
            WebSocketManager::open(ws_url, response_sender, Some(state_sender), session_id, config)
                .await?;

        let listen_handle = tokio::spawn(worker(
            response_receiver,
            request_receiver,
            watch_sender,
            base_client,
            protocol,
            state_receiver,
        ));
        Ok(RiptideClient {
            listen_handle: Some(Arc::new(listen_handle)),
            request_sender,
            watch_receiver,
        })
    }

    /// Subscribe to the results of query `name` called with `args`.
    ///
    /// Returns a [`QuerySubscription`] which implements
    /// [`Stream`]<[`FunctionResult`]>. A new value appears on the stream each
    /// time the query function produces a new result.
    ///
    /// The subscription is automatically unsubscribed when it is dropped.
    pub async fn subscribe(
        &mut self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
    ) -> anyhow::Result<QuerySubscription> {
        self.subscribe_inner(name, args, None).await
    }

    /// Subscribe, resuming from a journal returned by
    /// [`RiptideClient::query_journal`] for a previous subscription to the
    /// same query.
    pub async fn subscribe_with_journal(
        &mut self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
        journal: Option<String>,
    ) -> anyhow::Result<QuerySubscription> {
        self.subscribe_inner(name, args, journal).await
    }

    async fn subscribe_inner(
        &mut self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
        journal: Option<String>,
    ) -> anyhow::Result<QuerySubscription> {
        let (tx, rx) = oneshot::channel();
        let udf_path = name.parse()?;
        let request = SubscribeRequest {
            udf_path,
            args,
            journal,
        };
        self.send_request(ClientRequest::Subscribe(
            request,
            tx,
            self.request_sender.clone(),
        ))?;
        Ok(rx.await?)
    }

    /// Make a oneshot request to a query `name` with `args`.
    ///
    /// This method is syntactic sugar for waiting for a single result on a
    /// subscription.
    pub async fn query(
        &mut self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
    ) -> anyhow::Result<FunctionResult> {
        self.subscribe(name, args)
            .await?
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("Client dropped prematurely"))
    }

    /// Perform a mutation `name` with `args` and return a future containing
    /// the return value of the mutation once it completes.
    ///
    /// The future resolves only after the mutation's effects are visible in
    /// subscribed query results.
    pub async fn mutation(
        &mut self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
    ) -> anyhow::Result<FunctionResult> {
        self.mutation_inner(name, args, None).await
    }

    /// Perform a mutation, optimistically applying `update` to the local
    /// query view until the mutation completes.
    ///
    /// The update runs against every new view until the server acknowledges
    /// the mutation (or fails it), at which point it is rolled back in favor
    /// of the authoritative results.
    pub async fn mutation_with_optimistic_update(
        &mut self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
        update: impl Fn(&mut OptimisticLocalStore<'_>) + Send + 'static,
    ) -> anyhow::Result<FunctionResult> {
        self.mutation_inner(name, args, Some(Box::new(update))).await
    }

    async fn mutation_inner(
        &mut self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
        optimistic_update: Option<crate::base_client::OptimisticUpdate>,
    ) -> anyhow::Result<FunctionResult> {
        let (tx, rx) = oneshot::channel();
        let udf_path: UdfPath = name.parse()?;
        let request = MutationRequest {
            udf_path,
            args,
            optimistic_update,
        };
        self.send_request(ClientRequest::Mutation(request, tx))?;
        let res = rx.await?;
        Ok(res.await??)
    }

    /// Perform an action `name` with `args` and return a future containing
    /// the return value of the action once it completes.
    ///
    /// Actions are not retried across reconnects: if the connection drops
    /// while an action may have reached the server, its future fails.
    pub async fn action(
        &mut self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
    ) -> anyhow::Result<FunctionResult> {
        let (tx, rx) = oneshot::channel();
        let udf_path: UdfPath = name.parse()?;
        let request = ActionRequest { udf_path, args };
        self.send_request(ClientRequest::Action(request, tx))?;
        let res = rx.await?;
        Ok(res.await??)
    }

    /// Get a consistent view of the results of multiple queries (query set).
    ///
    /// Returns a [`QuerySetSubscription`] which implements
    /// [`Stream`]<[`QueryResults`]>. Each item in the stream contains a
    /// consistent view of the results of all the queries in the query set.
    pub fn watch_all(&self) -> QuerySetSubscription {
        QuerySetSubscription::new(BroadcastStream::new(self.watch_receiver.resubscribe()))
    }

    /// The current local result for a query, reflecting any optimistic
    /// updates in flight, or `None` if the query isn't subscribed or hasn't
    /// been evaluated yet.
    pub async fn local_query_result(
        &self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
    ) -> anyhow::Result<Option<FunctionResult>> {
        let (tx, rx) = oneshot::channel();
        let request = LocalQueryRequest {
            udf_path: name.parse()?,
            args,
        };
        self.send_request(ClientRequest::LocalQueryResult(request, tx))?;
        Ok(rx.await?)
    }

    /// The most recent journal the server issued for a subscribed query, for
    /// handing to [`RiptideClient::subscribe_with_journal`].
    pub async fn query_journal(
        &self,
        name: &str,
        args: BTreeMap<String, JsonValue>,
    ) -> anyhow::Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        let request = LocalQueryRequest {
            udf_path: name.parse()?,
            args,
        };
        self.send_request(ClientRequest::QueryJournal(request, tx))?;
        Ok(rx.await?)
    }

    /// Set auth for use when calling functions.
    ///
    /// The fetcher is called to acquire the initial token and again whenever
    /// the token needs refreshing; `on_change` observes transitions between
    /// authenticated and unauthenticated states.
    pub async fn set_auth(
        &mut self,
        fetcher: impl AuthTokenFetcher,
        on_change: impl FnMut(bool) + Send + 'static,
    ) -> anyhow::Result<()> {
        let request = SetAuthRequest {
            fetcher: Box::new(fetcher),
            on_change: Some(Box::new(on_change) as AuthChangeCallback),
        };
        self.send_request(ClientRequest::SetAuth(request))
    }

    /// Set admin auth for use when calling functions as a deployment admin.
    /// Not typically required.
    ///
    /// Deployment admins can act as users as part of their development flow
    /// to see how a function would act.
    #[doc(hidden)]
    pub async fn set_admin_auth(
        &mut self,
        deploy_key: String,
        acting_as: Option<UserIdentityAttributes>,
    ) -> anyhow::Result<()> {
        self.send_request(ClientRequest::SetAdminAuth(SetAdminAuthRequest {
            deploy_key,
            acting_as,
        }))
    }

    /// Unset auth, acting as an anonymous client again (logging out).
    pub async fn clear_auth(&mut self) -> anyhow::Result<()> {
        self.send_request(ClientRequest::ClearAuth)
    }

    /// A snapshot of the connection's current health.
    pub async fn connection_state(&self) -> anyhow::Result<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.send_request(ClientRequest::ConnectionState(tx))?;
        Ok(rx.await?)
    }

    /// Close the connection, failing every in-flight request with a terminal
    /// error, and wait for the socket to shut down. Affects all clones of
    /// this client.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.send_request(ClientRequest::Close(tx)).is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }

    fn send_request(&self, request: ClientRequest) -> anyhow::Result<()> {
        self.request_sender
            .send(request)
            .map_err(|_| anyhow::anyhow!(crate::ClientError::Closed))
    }
}

fn deployment_to_ws_url(mut deployment_url: Url) -> anyhow::Result<Url> {
    let ws_scheme = match deployment_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        scheme => anyhow::bail!("Unknown scheme {scheme}. Expected http or https."),
    };
    // The sync endpoint hangs off the deployment origin; a URL that already
    // has a path is some other endpoint the caller confused for it.
    anyhow::ensure!(
        matches!(deployment_url.path(), "" | "/"),
        "Deployment URL must not have a path: {deployment_url}"
    );
    deployment_url
        .set_scheme(ws_scheme)
        .expect("Scheme not supported");
    deployment_url.set_path(&format!("api/{SYNC_PROTOCOL_VERSION}/sync"));
    Ok(deployment_url)
}

#[cfg(test)]
pub mod tests {
    use std::{
        str::FromStr,
        sync::Arc,
        time::Duration,
    };

    use futures::StreamExt;
    use maplit::btreemap;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use riptide_sync_types::{
        AuthenticationToken,
        ClientMessage,
        LogLinesMessage,
        Query,
        QueryId,
        QuerySetModification,
        RequestId,
        ServerMessage,
        SessionId,
        StateModification,
        StateVersion,
        Timestamp,
        UdfPath,
    };
    use serde_json::json;
    use tokio::sync::{
        broadcast,
        mpsc,
        watch,
    };

    use super::{
        deployment_to_ws_url,
        worker::worker,
        RiptideClient,
    };
    use crate::{
        base_client::{
            BaseRiptideClient,
            FunctionResult,
        },
        client::auth::AuthToken,
        sync::{
            testing::TestProtocolManager,
            ProtocolConfig,
            SyncProtocol,
            WebSocketState,
        },
    };

    impl RiptideClient {
        pub async fn with_test_protocol() -> anyhow::Result<(Self, TestProtocolManager)> {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();

            // Channels for the `listen` background thread
            let (response_sender, response_receiver) = mpsc::channel(1);
            let (request_sender, request_receiver) = mpsc::unbounded_channel();

            // Listener for when each transaction completes
            let (watch_sender, watch_receiver) = broadcast::channel(1);

            let (state_sender, state_receiver) = watch::channel(WebSocketState::Disconnected);

            let test_protocol = TestProtocolManager::open(
                "ws://test.riptide.host".parse()?,
                response_sender,
                Some(state_sender),
                SessionId::nil(),
                ProtocolConfig::default(),
            )
            .await?;
            let base_client = BaseRiptideClient::new();

            let listen_handle = tokio::spawn(worker(
                response_receiver,
                request_receiver,
                watch_sender,
                base_client,
                test_protocol.clone(),
                state_receiver,
            ));

            let client = RiptideClient {
                listen_handle: Some(Arc::new(listen_handle)),
                request_sender,
                watch_receiver,
            };
            Ok((client, test_protocol))
        }
    }

    fn fake_mutation_response(result: Result<serde_json::Value, String>) -> (ServerMessage, ServerMessage) {
        let (transition_response, new_version) = fake_transition(StateVersion::initial(), vec![]);
        let mutation_response = ServerMessage::MutationResponse {
            request_id: RequestId::new(0),
            result,
            ts: Some(new_version.ts),
            log_lines: LogLinesMessage(vec![]),
        };
        (mutation_response, transition_response)
    }

    fn fake_action_response(result: Result<serde_json::Value, String>) -> ServerMessage {
        ServerMessage::ActionResponse {
            request_id: RequestId::new(0),
            result,
            log_lines: LogLinesMessage(vec![]),
        }
    }

    fn fake_transition(
        start_version: StateVersion,
        modifications: Vec<(QueryId, serde_json::Value)>,
    ) -> (ServerMessage, StateVersion) {
        let end_version = StateVersion {
            ts: start_version.ts.succ().expect("Succ failed"),
            ..start_version
        };
        (
            ServerMessage::Transition {
                start_version,
                end_version,
                modifications: modifications
                    .into_iter()
                    .map(|(query_id, value)| StateModification::QueryUpdated {
                        query_id,
                        value,
                        journal: None,
                        log_lines: LogLinesMessage(vec![]),
                    })
                    .collect(),
            },
            end_version,
        )
    }

    #[tokio::test]
    async fn test_mutation() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        test_protocol.take_sent().await;

        let mut res =
            tokio::spawn(async move { client.mutation("incrementCounter", btreemap! {}).await });
        test_protocol.wait_until_n_messages_sent(1).await;

        assert_eq!(
            test_protocol.take_sent().await,
            vec![ClientMessage::Mutation {
                request_id: RequestId::new(0),
                udf_path: UdfPath::from_str("incrementCounter")?,
                args: vec![json!({})],
            }]
        );

        let (mut_resp, transition) = fake_mutation_response(Ok(json!(null)));
        test_protocol.fake_server_response(mut_resp).await?;
        // Should not be ready until transition completes.
        tokio::time::timeout(Duration::from_millis(50), &mut res)
            .await
            .unwrap_err();

        // Once transition is sent, it is ready.
        test_protocol.fake_server_response(transition).await?;
        assert_eq!(res.await??, FunctionResult::Value(json!(null)));
        Ok(())
    }

    #[tokio::test]
    async fn test_mutation_error() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        test_protocol.take_sent().await;

        let res =
            tokio::spawn(async move { client.mutation("incrementCounter", btreemap! {}).await });
        test_protocol.wait_until_n_messages_sent(1).await;
        test_protocol.take_sent().await;

        let (mut_resp, _transition) = fake_mutation_response(Err("JEEPERS".into()));
        test_protocol.fake_server_response(mut_resp).await?;
        // Errors should be ready immediately (no transition needed)
        assert_eq!(res.await??, FunctionResult::ErrorMessage("JEEPERS".into()));

        Ok(())
    }

    #[tokio::test]
    async fn test_action() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        test_protocol.take_sent().await;

        let server_message = fake_action_response(Ok(json!(null)));

        let res = tokio::spawn(async move { client.action("runAction:hello", btreemap! {}).await });
        test_protocol.wait_until_n_messages_sent(1).await;

        assert_eq!(
            test_protocol.take_sent().await,
            vec![ClientMessage::Action {
                request_id: RequestId::new(0),
                udf_path: UdfPath::from_str("runAction:hello")?,
                args: vec![json!({})],
            }]
        );

        test_protocol.fake_server_response(server_message).await?;
        assert_eq!(res.await??, FunctionResult::Value(json!(null)));
        Ok(())
    }

    #[tokio::test]
    async fn test_admin_auth() -> anyhow::Result<()> {
        let (mut client, test_protocol) = RiptideClient::with_test_protocol().await?;
        test_protocol.take_sent().await;

        client.set_admin_auth("myadminauth".into(), None).await?;
        test_protocol.wait_until_n_messages_sent(1).await;
        assert_eq!(
            test_protocol.take_sent().await,
            vec![ClientMessage::Authenticate {
                base_version: 0,
                token: AuthenticationToken::Admin("myadminauth".into(), None),
            }]
        );

        client.clear_auth().await?;
        test_protocol.wait_until_n_messages_sent(1).await;
        assert_eq!(
            test_protocol.take_sent().await,
            vec![ClientMessage::Authenticate {
                base_version: 1,
                token: AuthenticationToken::None,
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_rotation() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        test_protocol.take_sent().await;

        let change_log = Arc::new(Mutex::new(Vec::new()));
        let change_log2 = change_log.clone();
        let mut calls = 0;
        client
            .set_auth(
                move |_force_refresh: bool| {
                    calls += 1;
                    let token = if calls == 1 { "T1" } else { "T2" };
                    async move { Some(AuthToken::new(token)) }
                },
                move |authenticated| change_log2.lock().push(authenticated),
            )
            .await?;

        // The first token goes out inside a pause/resume pair.
        test_protocol.wait_until_n_resumes(1).await;
        assert_eq!(
            test_protocol.take_sent().await,
            vec![ClientMessage::Authenticate {
                base_version: 0,
                token: AuthenticationToken::User("T1".into()),
            }]
        );
        assert_eq!(test_protocol.pause_count(), 1);
        assert_eq!(test_protocol.resume_count(), 1);

        // The server rejects T1; the client fetches and presents T2.
        test_protocol
            .fake_server_response(ServerMessage::AuthError {
                error_message: "Token expired".into(),
                base_version: Some(0),
                auth_update_attempted: true,
            })
            .await?;
        test_protocol.wait_until_n_resumes(2).await;
        assert_eq!(
            test_protocol.take_sent().await,
            vec![ClientMessage::Authenticate {
                base_version: 1,
                token: AuthenticationToken::User("T2".into()),
            }]
        );
        assert_eq!(test_protocol.pause_count(), 2);
        assert_eq!(test_protocol.resume_count(), 2);
        assert!(change_log.lock().is_empty());

        // The next transition confirms the new credential.
        let (transition, _) = fake_transition(StateVersion::initial(), vec![]);
        test_protocol.fake_server_response(transition).await?;
        tokio::time::timeout(Duration::from_secs(2), async {
            while change_log.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Timed out waiting for auth confirmation");
        assert_eq!(*change_log.lock(), vec![true]);
        Ok(())
    }

    #[tokio::test]
    async fn test_client_single_subscription() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;

        let mut subscription1 = client.subscribe("getValue1", btreemap! {}).await?;
        let query_id = subscription1.query_id();
        assert_eq!(
            test_protocol.take_sent().await,
            vec![
                ClientMessage::Connect {
                    session_id: SessionId::nil(),
                    connection_count: 0,
                    last_close_reason: "InitialConnect".to_string(),
                    max_observed_timestamp: None,
                },
                ClientMessage::ModifyQuerySet {
                    base_version: 0,
                    new_version: 1,
                    modifications: vec![QuerySetModification::Add(Query {
                        query_id,
                        udf_path: "getValue1".parse()?,
                        args: vec![json!({})],
                        journal: None,
                    })]
                },
            ]
        );

        test_protocol
            .fake_server_response(
                fake_transition(StateVersion::initial(), vec![(query_id, 10.into())]).0,
            )
            .await?;
        assert_eq!(
            subscription1.next().await,
            Some(FunctionResult::Value(10.into()))
        );
        assert_eq!(
            client.query("getValue1", btreemap! {}).await?,
            FunctionResult::Value(10.into())
        );

        let mut watch = client.watch_all();
        drop(subscription1);
        test_protocol.wait_until_n_messages_sent(1).await;
        assert_eq!(
            test_protocol.take_sent().await,
            vec![ClientMessage::ModifyQuerySet {
                base_version: 1,
                new_version: 2,
                modifications: vec![QuerySetModification::Remove { query_id }],
            }]
        );

        // A transition after the unsubscribe must not emit a new view.
        let start_version = StateVersion {
            ts: Timestamp::from(1),
            ..StateVersion::initial()
        };
        test_protocol
            .fake_server_response(ServerMessage::Transition {
                start_version,
                end_version: StateVersion {
                    ts: Timestamp::from(2),
                    ..start_version
                },
                modifications: vec![StateModification::QueryRemoved { query_id }],
            })
            .await?;
        tokio::time::timeout(Duration::from_millis(100), watch.next())
            .await
            .unwrap_err();

        Ok(())
    }

    #[tokio::test]
    async fn test_client_consistent_view_watch() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        let subscription1 = client.subscribe("getValue1", btreemap! {}).await?;
        let subscription2a = client.subscribe("getValue2", btreemap! {}).await?;
        let subscription2b = client.subscribe("getValue2", btreemap! {}).await?;
        let subscription3 = client.subscribe("getValue3", btreemap! {}).await?;
        test_protocol.take_sent().await;
        let mut watch = client.watch_all();

        test_protocol
            .fake_server_response(
                fake_transition(
                    StateVersion::initial(),
                    vec![(QueryId::new(0), 10.into()), (QueryId::new(1), 20.into())],
                )
                .0,
            )
            .await?;

        let results = watch.next().await.expect("Watch should have results");
        assert_eq!(
            results.get(&subscription1),
            Some(&FunctionResult::Value(10.into()))
        );
        assert_eq!(
            results.get(&subscription2a),
            Some(&FunctionResult::Value(20.into()))
        );
        assert_eq!(
            results.get(&subscription2b),
            Some(&FunctionResult::Value(20.into()))
        );
        assert_eq!(results.get(&subscription3), None);
        assert_eq!(
            results.iter().collect::<Vec<_>>(),
            vec![
                (subscription1.id(), Some(&FunctionResult::Value(10.into()))),
                (subscription2a.id(), Some(&FunctionResult::Value(20.into()))),
                (subscription2b.id(), Some(&FunctionResult::Value(20.into()))),
                (subscription3.id(), None),
            ]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_drop_client() -> anyhow::Result<()> {
        let (mut client, _test_protocol) = RiptideClient::with_test_protocol().await?;
        let mut subscription1 = client.subscribe("getValue1", btreemap! {}).await?;
        drop(client);
        tokio::task::yield_now().await;
        assert!(subscription1.next().await.is_none());
        drop(subscription1);
        Ok(())
    }

    #[tokio::test]
    async fn test_client_separate_queries() -> anyhow::Result<()> {
        let (mut client, test_protocol) = RiptideClient::with_test_protocol().await?;

        // All three of these should be considered separate
        let subscription1 = client.subscribe("getValue1", btreemap! {}).await?;
        let subscription2 = client.subscribe("getValue2", btreemap! {}).await?;
        let subscription3 = client
            .subscribe("getValue2", btreemap! {"hello".into() => "world".into()})
            .await?;
        assert_ne!(subscription1.query_id(), subscription2.query_id());
        assert_ne!(subscription2.query_id(), subscription3.query_id());

        assert_eq!(
            test_protocol.take_sent().await,
            vec![
                ClientMessage::Connect {
                    session_id: SessionId::nil(),
                    connection_count: 0,
                    last_close_reason: "InitialConnect".to_string(),
                    max_observed_timestamp: None,
                },
                ClientMessage::ModifyQuerySet {
                    base_version: 0,
                    new_version: 1,
                    modifications: vec![QuerySetModification::Add(Query {
                        query_id: subscription1.query_id(),
                        udf_path: "getValue1".parse()?,
                        args: vec![json!({})],
                        journal: None,
                    })]
                },
                ClientMessage::ModifyQuerySet {
                    base_version: 1,
                    new_version: 2,
                    modifications: vec![QuerySetModification::Add(Query {
                        query_id: subscription2.query_id(),
                        udf_path: "getValue2".parse()?,
                        args: vec![json!({})],
                        journal: None,
                    })]
                },
                ClientMessage::ModifyQuerySet {
                    base_version: 2,
                    new_version: 3,
                    modifications: vec![QuerySetModification::Add(Query {
                        query_id: subscription3.query_id(),
                        udf_path: "getValue2".parse()?,
                        args: vec![json!({"hello": "world"})],
                        journal: None,
                    })]
                },
            ]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_client_two_identical_queries() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;

        // These two should be considered the same query.
        let mut subscription1 = client.subscribe("getValue", btreemap! {}).await?;
        let mut subscription2 = client.subscribe("getValue", btreemap! {}).await?;

        assert_ne!(subscription1.id(), subscription2.id());
        assert_eq!(subscription1.query_id(), subscription2.query_id());
        let query_id = subscription1.query_id();

        assert_eq!(
            test_protocol.take_sent().await,
            vec![
                ClientMessage::Connect {
                    session_id: SessionId::nil(),
                    connection_count: 0,
                    last_close_reason: "InitialConnect".to_string(),
                    max_observed_timestamp: None,
                },
                ClientMessage::ModifyQuerySet {
                    base_version: 0,
                    new_version: 1,
                    modifications: vec![QuerySetModification::Add(Query {
                        query_id,
                        udf_path: "getValue".parse()?,
                        args: vec![json!({})],
                        journal: None,
                    })]
                },
            ]
        );

        let mut version = StateVersion::initial();
        for i in 1..5 {
            let (transition, new_version) = fake_transition(version, vec![(query_id, i.into())]);
            test_protocol.fake_server_response(transition).await?;
            version = new_version;

            assert_eq!(
                subscription1.next().await,
                Some(FunctionResult::Value(i.into()))
            );
            assert_eq!(
                subscription2.next().await,
                Some(FunctionResult::Value(i.into()))
            );
        }

        // A new subscription should auto-initialize with the value if available
        let mut subscription3 = client.subscribe("getValue", btreemap! {}).await?;
        assert_eq!(
            subscription3.next().await,
            Some(FunctionResult::Value(4.into())),
        );

        // Dropping sub1 and sub2 should still maintain subscription
        drop(subscription1);
        drop(subscription2);
        let (transition, _new_version) = fake_transition(version, vec![(query_id, 5.into())]);
        test_protocol.fake_server_response(transition).await?;
        assert_eq!(
            subscription3.next().await,
            Some(FunctionResult::Value(5.into())),
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_optimistic_mutation() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        let mut subscription = client.subscribe("posts:list", btreemap! {}).await?;
        let query_id = subscription.query_id();
        test_protocol.take_sent().await;

        let (transition, version) =
            fake_transition(StateVersion::initial(), vec![(query_id, json!([{"id": "a"}]))]);
        test_protocol.fake_server_response(transition).await?;
        assert_eq!(
            subscription.next().await,
            Some(FunctionResult::Value(json!([{"id": "a"}])))
        );

        let mut mutation_client = client.clone();
        let mut res = tokio::spawn(async move {
            mutation_client
                .mutation_with_optimistic_update(
                    "posts:add",
                    btreemap! {"id".to_owned() => json!("b")},
                    |store| {
                        let path = "posts:list".parse().unwrap();
                        store.set_query(
                            &path,
                            &maplit::btreemap! {},
                            Some(json!([{"id": "a"}, {"id": "b"}])),
                        );
                    },
                )
                .await
        });

        // The optimistic view lands before any server roundtrip.
        assert_eq!(
            subscription.next().await,
            Some(FunctionResult::Value(json!([{"id": "a"}, {"id": "b"}])))
        );
        assert_eq!(
            client.local_query_result("posts:list", btreemap! {}).await?,
            Some(FunctionResult::Value(json!([{"id": "a"}, {"id": "b"}])))
        );

        // Server confirms with the same value; the mutation resolves after
        // the transition and the view does not re-emit.
        let (transition, new_version) =
            fake_transition(version, vec![(query_id, json!([{"id": "a"}, {"id": "b"}]))]);
        test_protocol
            .fake_server_response(ServerMessage::MutationResponse {
                request_id: RequestId::new(0),
                result: Ok(json!(null)),
                ts: Some(new_version.ts),
                log_lines: LogLinesMessage(vec![]),
            })
            .await?;
        tokio::time::timeout(Duration::from_millis(50), &mut res)
            .await
            .unwrap_err();
        test_protocol.fake_server_response(transition).await?;
        assert_eq!(res.await??, FunctionResult::Value(json!(null)));

        tokio::time::timeout(Duration::from_millis(100), subscription.next())
            .await
            .unwrap_err();
        Ok(())
    }

    #[tokio::test]
    async fn test_reconnect_replays_inflight_mutations() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        let subscription = client.subscribe("getValue", btreemap! {}).await?;
        let query_id = subscription.query_id();
        test_protocol.take_sent().await;

        let mut mutation_client = client.clone();
        let res = tokio::spawn(async move {
            mutation_client.mutation("incrementCounter", btreemap! {}).await
        });
        test_protocol.wait_until_n_messages_sent(1).await;
        test_protocol.take_sent().await;

        // The socket drops before any response. After the backoff, the
        // client reconnects and replays the query set and the mutation.
        test_protocol.fake_connection_failure().await?;
        test_protocol.wait_until_n_messages_sent(3).await;
        assert_eq!(
            test_protocol.take_sent().await,
            vec![
                ClientMessage::Connect {
                    session_id: SessionId::nil(),
                    connection_count: 1,
                    last_close_reason: "ProtocolFailure".to_string(),
                    max_observed_timestamp: None,
                },
                ClientMessage::ModifyQuerySet {
                    base_version: 0,
                    new_version: 1,
                    modifications: vec![QuerySetModification::Add(Query {
                        query_id,
                        udf_path: "getValue".parse()?,
                        args: vec![json!({})],
                        journal: None,
                    })]
                },
                ClientMessage::Mutation {
                    request_id: RequestId::new(0),
                    udf_path: "incrementCounter".parse()?,
                    args: vec![json!({})],
                },
            ]
        );

        // A response on the new connection resolves the original future.
        let (mut_resp, transition) = fake_mutation_response(Ok(json!(1)));
        test_protocol.fake_server_response(mut_resp).await?;
        test_protocol.fake_server_response(transition).await?;
        assert_eq!(res.await??, FunctionResult::Value(json!(1)));
        Ok(())
    }

    #[tokio::test]
    async fn test_protocol_violation_is_fatal() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        let _subscription = client.subscribe("getValue", btreemap! {}).await?;
        test_protocol.take_sent().await;

        let mut mutation_client = client.clone();
        let res = tokio::spawn(async move {
            mutation_client.mutation("incrementCounter", btreemap! {}).await
        });
        test_protocol.wait_until_n_messages_sent(1).await;

        // A transition that doesn't start at our version is a protocol
        // violation: the pending mutation fails and the client is dead.
        let bogus_start = StateVersion {
            ts: Timestamp::from(5),
            ..StateVersion::initial()
        };
        test_protocol
            .fake_server_response(fake_transition(bogus_start, vec![]).0)
            .await?;

        let err = res.await?.unwrap_err();
        assert!(err.to_string().contains("Protocol violation"), "{err}");
        tokio::time::timeout(Duration::from_secs(2), async {
            while !test_protocol.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Timed out waiting for the protocol to close");
        assert!(client.mutation("incrementCounter", btreemap! {}).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_pings_are_inert() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        let mut subscription = client.subscribe("getValue", btreemap! {}).await?;
        let query_id = subscription.query_id();

        test_protocol
            .fake_server_response(
                fake_transition(StateVersion::initial(), vec![(query_id, 10.into())]).0,
            )
            .await?;
        assert_eq!(
            subscription.next().await,
            Some(FunctionResult::Value(10.into()))
        );

        for _ in 0..3 {
            test_protocol.fake_server_response(ServerMessage::Ping).await?;
        }
        // No new view, no new result.
        tokio::time::timeout(Duration::from_millis(100), subscription.next())
            .await
            .unwrap_err();
        Ok(())
    }

    #[tokio::test]
    async fn test_unsent_action_is_replayed_after_reconnect() -> anyhow::Result<()> {
        let (client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        test_protocol.take_sent().await;

        // The socket is already gone when the action is submitted: the
        // transport refuses the frame, so it was never sent.
        test_protocol.set_connected(false);
        let mut action_client = client.clone();
        let res = tokio::spawn(async move { action_client.action("email:send", btreemap! {}).await });
        test_protocol.wait_until_n_messages_sent(1).await;
        test_protocol.take_sent().await;

        // After the reconnect, the never-sent action is replayed instead of
        // being failed.
        test_protocol.fake_connection_failure().await?;
        test_protocol.wait_until_n_messages_sent(3).await;
        assert_eq!(
            test_protocol.take_sent().await,
            vec![
                ClientMessage::Connect {
                    session_id: SessionId::nil(),
                    connection_count: 1,
                    last_close_reason: "ProtocolFailure".to_string(),
                    max_observed_timestamp: None,
                },
                ClientMessage::ModifyQuerySet {
                    base_version: 0,
                    new_version: 1,
                    modifications: vec![],
                },
                ClientMessage::Action {
                    request_id: RequestId::new(0),
                    udf_path: "email:send".parse()?,
                    args: vec![json!({})],
                },
            ]
        );

        test_protocol
            .fake_server_response(fake_action_response(Ok(json!("sent"))))
            .await?;
        assert_eq!(res.await??, FunctionResult::Value(json!("sent")));

        // An action the transport did accept is not replayed: losing the
        // connection fails it with the distinct replay-unsafe error.
        let mut action_client = client.clone();
        let res = tokio::spawn(async move { action_client.action("email:send", btreemap! {}).await });
        test_protocol.wait_until_n_messages_sent(1).await;
        test_protocol.take_sent().await;
        test_protocol.fake_connection_failure().await?;
        let err = res.await?.unwrap_err();
        assert!(
            err.to_string()
                .contains("Connection lost while action was in flight"),
            "{err}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_response_is_fatal() -> anyhow::Result<()> {
        let (mut client, mut test_protocol) = RiptideClient::with_test_protocol().await?;
        test_protocol.take_sent().await;

        let mut mutation_client = client.clone();
        let res = tokio::spawn(async move {
            mutation_client.mutation("incrementCounter", btreemap! {}).await
        });
        test_protocol.wait_until_n_messages_sent(1).await;

        let (mut_resp, _transition) = fake_mutation_response(Ok(json!(null)));
        test_protocol.fake_server_response(mut_resp.clone()).await?;
        // A second response for the same request id means the server has
        // desynced: the client shuts down rather than trust the connection.
        test_protocol.fake_server_response(mut_resp).await?;

        let err = res.await?.unwrap_err();
        assert!(err.to_string().contains("Protocol violation"), "{err}");
        tokio::time::timeout(Duration::from_secs(2), async {
            while !test_protocol.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Timed out waiting for the protocol to close");
        assert!(client.query("getValue", btreemap! {}).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_fails_inflight_requests() -> anyhow::Result<()> {
        let (mut client, test_protocol) = RiptideClient::with_test_protocol().await?;
        test_protocol.take_sent().await;

        let mut mutation_client = client.clone();
        let res = tokio::spawn(async move {
            mutation_client.mutation("incrementCounter", btreemap! {}).await
        });
        test_protocol.wait_until_n_messages_sent(1).await;

        client.close().await?;
        let err = res.await?.unwrap_err();
        assert!(err.to_string().contains("Client is closed"), "{err}");
        assert!(test_protocol.is_closed());
        // The client is unusable afterwards.
        assert!(client.mutation("incrementCounter", btreemap! {}).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_state() -> anyhow::Result<()> {
        let (client, _test_protocol) = RiptideClient::with_test_protocol().await?;
        let state = client.connection_state().await?;
        assert_eq!(state.web_socket_state, WebSocketState::Ready);
        assert!(!state.has_inflight_requests);
        assert!(!state.has_incomplete_requests);
        assert!(state.time_of_oldest_inflight_request.is_none());
        Ok(())
    }

    #[test]
    fn test_deployment_url() -> anyhow::Result<()> {
        assert_eq!(
            deployment_to_ws_url("http://flying-shark-123.riptide.host".parse()?)?.to_string(),
            "ws://flying-shark-123.riptide.host/api/1.1/sync",
        );
        assert_eq!(
            deployment_to_ws_url("https://flying-shark-123.riptide.host".parse()?)?.to_string(),
            "wss://flying-shark-123.riptide.host/api/1.1/sync",
        );
        assert_eq!(
            deployment_to_ws_url("ws://flying-shark-123.riptide.host".parse()?)?.to_string(),
            "ws://flying-shark-123.riptide.host/api/1.1/sync",
        );
        assert_eq!(
            deployment_to_ws_url("wss://flying-shark-123.riptide.host".parse()?)?.to_string(),
            "wss://flying-shark-123.riptide.host/api/1.1/sync",
        );
        assert_eq!(
            deployment_to_ws_url("ftp://flying-shark-123.riptide.host".parse()?)
                .unwrap_err()
                .to_string(),
            "Unknown scheme ftp. Expected http or https.",
        );
        assert!(
            deployment_to_ws_url("https://flying-shark-123.riptide.host/http_actions".parse()?)
                .is_err()
        );
        Ok(())
    }
}
