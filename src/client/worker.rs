use std::{
    collections::BTreeMap,
    time::Duration,
};

use riptide_sync_types::{
    backoff::Backoff,
    AuthenticationToken,
    ClientMessage,
    ServerMessage,
    UdfPath,
    UserIdentityAttributes,
};
use serde_json::Value as JsonValue;
use tokio::sync::{
    broadcast,
    mpsc,
    oneshot,
    watch,
};
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    base_client::{
        BaseRiptideClient,
        FunctionResult,
        OptimisticUpdate,
        QueryResults,
        RequestCompletion,
        SubscriberId,
    },
    client::{
        auth::{
            AuthAction,
            AuthChangeCallback,
            AuthTokenFetcher,
            AuthenticationManager,
        },
        subscription::QuerySubscription,
        ConnectionState,
    },
    sync::{
        ProtocolResponse,
        ReconnectProtocolReason,
        ReconnectRequest,
        SyncProtocol,
        WebSocketState,
    },
    ClientError,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(15);

pub enum ClientRequest {
    Mutation(
        MutationRequest,
        oneshot::Sender<oneshot::Receiver<RequestCompletion>>,
    ),
    Action(
        ActionRequest,
        oneshot::Sender<oneshot::Receiver<RequestCompletion>>,
    ),
    Subscribe(
        SubscribeRequest,
        oneshot::Sender<QuerySubscription>,
        mpsc::UnboundedSender<ClientRequest>,
    ),
    Unsubscribe(UnsubscribeRequest),
    SetAuth(SetAuthRequest),
    SetAdminAuth(SetAdminAuthRequest),
    ClearAuth,
    LocalQueryResult(LocalQueryRequest, oneshot::Sender<Option<FunctionResult>>),
    QueryJournal(LocalQueryRequest, oneshot::Sender<Option<String>>),
    ConnectionState(oneshot::Sender<ConnectionState>),
    Close(oneshot::Sender<()>),
}

pub struct MutationRequest {
    pub udf_path: UdfPath,
    pub args: BTreeMap<String, JsonValue>,
    pub optimistic_update: Option<OptimisticUpdate>,
}

pub struct ActionRequest {
    pub udf_path: UdfPath,
    pub args: BTreeMap<String, JsonValue>,
}

pub struct SubscribeRequest {
    pub udf_path: UdfPath,
    pub args: BTreeMap<String, JsonValue>,
    pub journal: Option<String>,
}

pub struct SetAuthRequest {
    pub fetcher: Box<dyn AuthTokenFetcher>,
    pub on_change: Option<AuthChangeCallback>,
}

pub struct SetAdminAuthRequest {
    pub deploy_key: String,
    pub acting_as: Option<UserIdentityAttributes>,
}

pub struct LocalQueryRequest {
    pub udf_path: UdfPath,
    pub args: BTreeMap<String, JsonValue>,
}

#[derive(Debug)]
pub struct UnsubscribeRequest {
    pub subscriber_id: SubscriberId,
}

/// What a processing step decided about the worker's lifecycle.
enum Flow {
    Continue,
    /// Close the transport and exit, acking the close request if there was
    /// one.
    Shutdown(Option<oneshot::Sender<()>>),
}

/// What to do with one protocol response.
enum Handled {
    Continue,
    Shutdown,
    /// Auth errors need an async refresh; the caller drains these after the
    /// current flush completes.
    AuthError { auth_update_attempted: bool },
}

pub async fn worker<T: SyncProtocol>(
    mut protocol_response_receiver: mpsc::Receiver<ProtocolResponse>,
    mut client_request_receiver: mpsc::UnboundedReceiver<ClientRequest>,
    mut watch_sender: broadcast::Sender<QueryResults>,
    mut base_client: BaseRiptideClient,
    mut protocol_manager: T,
    web_socket_state: watch::Receiver<WebSocketState>,
) {
    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
    let mut auth = AuthenticationManager::new();
    loop {
        let e = loop {
            let step = _worker_once(
                &mut protocol_response_receiver,
                &mut client_request_receiver,
                &mut watch_sender,
                &mut base_client,
                &mut protocol_manager,
                &mut auth,
                &web_socket_state,
            )
            .await;
            match step {
                Ok(Flow::Continue) => backoff.reset(),
                Ok(Flow::Shutdown(ack)) => {
                    // Stop reading protocol responses first: a transport
                    // blocked mid-forward errors out instead of wedging the
                    // shutdown handshake.
                    drop(protocol_response_receiver);
                    protocol_manager.close().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                },
                Err(e) => break e,
            }
        };

        let delay = backoff.fail(&mut rand::rng());
        tracing::error!(
            "Riptide client worker failed: {e:?}. Backing off for {delay:?} and retrying."
        );
        tokio::time::sleep(delay).await;

        // Tell the sync protocol to reconnect followed by an immediate resend
        // of ongoing queries/mutations. It's important these happen together
        // to ensure mutation ordering.
        protocol_manager
            .reconnect(ReconnectRequest {
                reason: e,
                max_observed_timestamp: base_client.max_observed_timestamp(),
            })
            .await;
        base_client.resend_ongoing_queries_mutations();
        // We'll flush messages from base_client inside the next call to
        // `_worker_once`.
    }
}

#[allow(clippy::too_many_arguments)]
async fn _worker_once<T: SyncProtocol>(
    protocol_response_receiver: &mut mpsc::Receiver<ProtocolResponse>,
    client_request_receiver: &mut mpsc::UnboundedReceiver<ClientRequest>,
    watch_sender: &mut broadcast::Sender<QueryResults>,
    base_client: &mut BaseRiptideClient,
    protocol_manager: &mut T,
    auth: &mut AuthenticationManager,
    web_socket_state: &watch::Receiver<WebSocketState>,
) -> Result<Flow, ReconnectProtocolReason> {
    let mut pending_auth_errors = Vec::new();

    // If there are any outgoing messages to flush (e.g. from an outer
    // reconnect), do so first.
    if let Flow::Shutdown(ack) = communicate(
        base_client,
        protocol_response_receiver,
        watch_sender,
        protocol_manager,
        auth,
        &mut pending_auth_errors,
    )
    .await?
    {
        return Ok(Flow::Shutdown(ack));
    }

    let refresh_deadline = auth.refresh_deadline();
    tokio::select! {
        Some(protocol_response) = protocol_response_receiver.recv() => {
            match handle_protocol_response(base_client, watch_sender, auth, protocol_response)? {
                Handled::Continue => (),
                Handled::Shutdown => return Ok(Flow::Shutdown(None)),
                Handled::AuthError { auth_update_attempted } => {
                    pending_auth_errors.push(auth_update_attempted);
                },
            }
        }
        Some(client_request) = client_request_receiver.recv() => {
            match client_request {
                ClientRequest::Subscribe(query, tx, request_sender) => {
                    let watch = watch_sender.subscribe();
                    let SubscribeRequest {
                        udf_path,
                        args,
                        journal,
                    } = query;
                    let subscriber_id = base_client.subscribe_with_journal(udf_path, args, journal);
                    if let Flow::Shutdown(ack) = communicate(
                        base_client,
                        protocol_response_receiver,
                        watch_sender,
                        protocol_manager,
                        auth,
                        &mut pending_auth_errors,
                    )
                    .await?
                    {
                        return Ok(Flow::Shutdown(ack));
                    }

                    let watch = BroadcastStream::new(watch);
                    let subscription = QuerySubscription {
                        subscriber_id,
                        request_sender,
                        watch,
                        initial: base_client.latest_result(subscriber_id),
                    };
                    let _ = tx.send(subscription);
                },
                ClientRequest::Mutation(mutation, tx) => {
                    let MutationRequest {
                        udf_path,
                        args,
                        optimistic_update,
                    } = mutation;
                    let result_receiver = match optimistic_update {
                        Some(update) => {
                            let (receiver, results) =
                                base_client.mutation_with_optimistic_update(udf_path, args, update);
                            if let Some(results) = results {
                                let _ = watch_sender.send(results);
                            }
                            receiver
                        },
                        None => base_client.mutation(udf_path, args),
                    };
                    if let Flow::Shutdown(ack) = communicate(
                        base_client,
                        protocol_response_receiver,
                        watch_sender,
                        protocol_manager,
                        auth,
                        &mut pending_auth_errors,
                    )
                    .await?
                    {
                        return Ok(Flow::Shutdown(ack));
                    }
                    let _ = tx.send(result_receiver);
                },
                ClientRequest::Action(action, tx) => {
                    let ActionRequest {
                        udf_path,
                        args,
                    } = action;
                    let result_receiver = base_client.action(udf_path, args);
                    if let Flow::Shutdown(ack) = communicate(
                        base_client,
                        protocol_response_receiver,
                        watch_sender,
                        protocol_manager,
                        auth,
                        &mut pending_auth_errors,
                    )
                    .await?
                    {
                        return Ok(Flow::Shutdown(ack));
                    }
                    let _ = tx.send(result_receiver);
                },
                ClientRequest::Unsubscribe(unsubscribe) => {
                    let UnsubscribeRequest { subscriber_id } = unsubscribe;
                    base_client.unsubscribe(subscriber_id);
                    if let Flow::Shutdown(ack) = communicate(
                        base_client,
                        protocol_response_receiver,
                        watch_sender,
                        protocol_manager,
                        auth,
                        &mut pending_auth_errors,
                    )
                    .await?
                    {
                        return Ok(Flow::Shutdown(ack));
                    }
                },
                ClientRequest::SetAuth(request) => {
                    let action = auth.set_fetcher(request.fetcher, request.on_change).await;
                    if let Flow::Shutdown(ack) = apply_auth_action(
                        action,
                        base_client,
                        protocol_response_receiver,
                        watch_sender,
                        protocol_manager,
                        auth,
                        &mut pending_auth_errors,
                    )
                    .await?
                    {
                        return Ok(Flow::Shutdown(ack));
                    }
                },
                ClientRequest::SetAdminAuth(request) => {
                    base_client.set_auth(AuthenticationToken::Admin(
                        request.deploy_key,
                        request.acting_as,
                    ));
                    if let Flow::Shutdown(ack) = communicate(
                        base_client,
                        protocol_response_receiver,
                        watch_sender,
                        protocol_manager,
                        auth,
                        &mut pending_auth_errors,
                    )
                    .await?
                    {
                        return Ok(Flow::Shutdown(ack));
                    }
                },
                ClientRequest::ClearAuth => {
                    auth.clear();
                    base_client.clear_auth();
                    if let Flow::Shutdown(ack) = communicate(
                        base_client,
                        protocol_response_receiver,
                        watch_sender,
                        protocol_manager,
                        auth,
                        &mut pending_auth_errors,
                    )
                    .await?
                    {
                        return Ok(Flow::Shutdown(ack));
                    }
                },
                ClientRequest::LocalQueryResult(request, tx) => {
                    let _ = tx.send(
                        base_client.local_query_result(&request.udf_path, &request.args),
                    );
                },
                ClientRequest::QueryJournal(request, tx) => {
                    let _ = tx.send(base_client.query_journal(&request.udf_path, &request.args));
                },
                ClientRequest::ConnectionState(tx) => {
                    let _ = tx.send(ConnectionState {
                        web_socket_state: *web_socket_state.borrow(),
                        has_inflight_requests: base_client.has_inflight_requests(),
                        has_incomplete_requests: base_client.has_incomplete_requests(),
                        time_of_oldest_inflight_request: base_client
                            .time_of_oldest_inflight_request(),
                    });
                },
                ClientRequest::Close(ack) => {
                    base_client.fail_all_requests(ClientError::Closed);
                    return Ok(Flow::Shutdown(Some(ack)));
                },
            }
        },
        _ = tokio::time::sleep_until(refresh_deadline.unwrap_or_else(tokio::time::Instant::now)),
            if refresh_deadline.is_some() =>
        {
            let action = auth.refresh().await;
            if let Flow::Shutdown(ack) = apply_auth_action(
                action,
                base_client,
                protocol_response_receiver,
                watch_sender,
                protocol_manager,
                auth,
                &mut pending_auth_errors,
            )
            .await?
            {
                return Ok(Flow::Shutdown(ack));
            }
        }
        // Both channels closed: every client handle is gone.
        else => return Ok(Flow::Shutdown(None)),
    }

    while let Some(auth_update_attempted) = pending_auth_errors.pop() {
        let action = auth.on_auth_error(auth_update_attempted).await;
        if let Flow::Shutdown(ack) = apply_auth_action(
            action,
            base_client,
            protocol_response_receiver,
            watch_sender,
            protocol_manager,
            auth,
            &mut pending_auth_errors,
        )
        .await?
        {
            return Ok(Flow::Shutdown(ack));
        }
    }
    Ok(Flow::Continue)
}

/// Carry out an auth decision. Token rotations happen inside a transport
/// pause so no other frame interleaves with the credential change.
async fn apply_auth_action<P: SyncProtocol>(
    action: AuthAction,
    base_client: &mut BaseRiptideClient,
    protocol_response_receiver: &mut mpsc::Receiver<ProtocolResponse>,
    watch_sender: &mut broadcast::Sender<QueryResults>,
    protocol: &mut P,
    auth: &mut AuthenticationManager,
    pending_auth_errors: &mut Vec<bool>,
) -> Result<Flow, ReconnectProtocolReason> {
    match action {
        AuthAction::Rotate(token) => {
            protocol.pause().await;
            base_client.set_auth(AuthenticationToken::User(token));
            let flow = communicate(
                base_client,
                protocol_response_receiver,
                watch_sender,
                protocol,
                auth,
                pending_auth_errors,
            )
            .await?;
            protocol.resume().await;
            Ok(flow)
        },
        AuthAction::Unauthenticate => {
            base_client.clear_auth();
            communicate(
                base_client,
                protocol_response_receiver,
                watch_sender,
                protocol,
                auth,
                pending_auth_errors,
            )
            .await
        },
        AuthAction::None => Ok(Flow::Continue),
    }
}

/// Flush all messages to the protocol while processing server messages.
///
/// A request frame counts as possibly sent only when the transport reports
/// it was handed to an open socket; a refused frame stays safely replayable.
async fn communicate<P: SyncProtocol>(
    base_client: &mut BaseRiptideClient,
    protocol_response_receiver: &mut mpsc::Receiver<ProtocolResponse>,
    watch_sender: &mut broadcast::Sender<QueryResults>,
    protocol: &mut P,
    auth: &mut AuthenticationManager,
    pending_auth_errors: &mut Vec<bool>,
) -> Result<Flow, ReconnectProtocolReason> {
    while let Some(message) = base_client.pop_next_message() {
        let request_id = match &message {
            ClientMessage::Mutation { request_id, .. }
            | ClientMessage::Action { request_id, .. } => Some(*request_id),
            _ => None,
        };
        let mut send_future = protocol.send(message);
        loop {
            tokio::select! {
                result = &mut send_future => {
                    let handed_to_socket =
                        result.map_err(|e| format!("SendFailed: {e}"))?;
                    if handed_to_socket {
                        if let Some(request_id) = request_id {
                            base_client.mark_sent(request_id);
                        }
                    }
                    break;
                },
                // Keep processing protocol responses while waiting so that we
                // don't deadlock with the websocket worker.
                Some(protocol_response) = protocol_response_receiver.recv() => {
                    match handle_protocol_response(
                        base_client,
                        watch_sender,
                        auth,
                        protocol_response,
                    )? {
                        Handled::Continue => (),
                        Handled::Shutdown => return Ok(Flow::Shutdown(None)),
                        Handled::AuthError { auth_update_attempted } => {
                            pending_auth_errors.push(auth_update_attempted);
                        },
                    }
                }
            }
        }
    }
    Ok(Flow::Continue)
}

fn handle_protocol_response(
    base_client: &mut BaseRiptideClient,
    watch_sender: &mut broadcast::Sender<QueryResults>,
    auth: &mut AuthenticationManager,
    protocol_response: ProtocolResponse,
) -> Result<Handled, ReconnectProtocolReason> {
    match protocol_response {
        ProtocolResponse::ServerMessage(ServerMessage::FatalError { error_message }) => {
            tracing::error!("Fatal server error: {error_message}");
            base_client.fail_all_requests(ClientError::FatalServerError(error_message));
            Ok(Handled::Shutdown)
        },
        ProtocolResponse::ServerMessage(ServerMessage::AuthError {
            error_message,
            auth_update_attempted,
            ..
        }) => {
            tracing::warn!("Authentication error: {error_message}");
            Ok(Handled::AuthError {
                auth_update_attempted,
            })
        },
        ProtocolResponse::ServerMessage(msg) => {
            let is_transition = matches!(msg, ServerMessage::Transition { .. });
            match base_client.receive_message(msg) {
                Ok(Some(subscriber_id_to_latest_value)) => {
                    // Notify watchers of the new consistent query results at
                    // the new timestamp, then wake requesters whose results
                    // depend on it.
                    let _ = watch_sender.send(subscriber_id_to_latest_value);
                },
                Ok(None) => (),
                Err(e) => {
                    // Out-of-order or malformed state from the server: the
                    // connection can't be trusted, and neither could a new
                    // one. Stop and surface.
                    tracing::error!("Protocol violation: {e:?}");
                    base_client.fail_all_requests(ClientError::Protocol(e.to_string()));
                    return Ok(Handled::Shutdown);
                },
            }
            base_client.resolve_completed_requests();
            if is_transition {
                auth.observe_transition();
            }
            Ok(Handled::Continue)
        },
        ProtocolResponse::Failure => Err("ProtocolFailure".into()),
    }
}
