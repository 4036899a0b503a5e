//! The sans-io core of the client.
//!
//! [`BaseRiptideClient`] owns the local subscription state, the authoritative
//! server view, the in-flight request table, and the optimistic overlay. It
//! never touches the network: callers feed it inbound [`ServerMessage`]s and
//! drain outbound [`ClientMessage`]s, which makes every state machine in here
//! directly testable. The tokio client in [`crate::client`] wraps it in an
//! actor; a host with its own event loop can drive it directly.

use std::collections::{
    BTreeMap,
    VecDeque,
};

use riptide_sync_types::{
    serialize_path_and_args,
    AuthenticationToken,
    ClientMessage,
    QueryId,
    RequestId,
    ServerMessage,
    Timestamp,
    UdfPath,
};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

mod local_state;
mod optimistic;
mod remote_query_set;
mod request_manager;

pub use self::optimistic::{
    OptimisticLocalStore,
    OptimisticUpdate,
    QueryResultEntry,
};
use self::{
    local_state::LocalSyncState,
    optimistic::OptimisticQueryResults,
    remote_query_set::RemoteQuerySet,
    request_manager::RequestManager,
};
pub use self::request_manager::RequestCompletion;
use crate::ClientError;

/// Result of running a function on the backend: either its return value or
/// the application-level error it threw.
#[derive(Clone, Debug, PartialEq)]
pub enum FunctionResult {
    Value(JsonValue),
    ErrorMessage(String),
}

impl From<Result<JsonValue, String>> for FunctionResult {
    fn from(result: Result<JsonValue, String>) -> Self {
        match result {
            Ok(value) => FunctionResult::Value(value),
            Err(error_message) => FunctionResult::ErrorMessage(error_message),
        }
    }
}

impl From<FunctionResult> for Result<JsonValue, String> {
    fn from(result: FunctionResult) -> Self {
        match result {
            FunctionResult::Value(value) => Ok(value),
            FunctionResult::ErrorMessage(error_message) => Err(error_message),
        }
    }
}

/// Canonical identity of a (udf path, args) pair. Subscriptions with equal
/// tokens share one server-side query.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryToken(pub(crate) String);

impl QueryToken {
    pub(crate) fn new(udf_path: &UdfPath, args: &BTreeMap<String, JsonValue>) -> Self {
        Self(serialize_path_and_args(udf_path, args))
    }
}

/// Handle for a single subscriber to a query. Subscribers to the same query
/// token share a [`QueryId`] but get distinct ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub(crate) QueryId, pub(crate) usize);

impl SubscriberId {
    pub fn query_id(&self) -> QueryId {
        self.0
    }
}

impl AsRef<SubscriberId> for SubscriberId {
    fn as_ref(&self) -> &SubscriberId {
        self
    }
}

/// A consistent view of every subscriber's latest result, emitted whenever
/// the effective view changes. Copy-on-write, so cloning one out to each
/// watcher is cheap.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResults {
    results: imbl::OrdMap<SubscriberId, FunctionResult>,
    subscribers: imbl::OrdSet<SubscriberId>,
    changed: imbl::OrdSet<SubscriberId>,
}

impl QueryResults {
    pub fn get(&self, subscriber: impl AsRef<SubscriberId>) -> Option<&FunctionResult> {
        self.results.get(subscriber.as_ref())
    }

    /// Every active subscriber, paired with its result (`None` while the
    /// server hasn't evaluated the query yet).
    pub fn iter(&self) -> impl Iterator<Item = (SubscriberId, Option<&FunctionResult>)> {
        self.subscribers
            .iter()
            .map(|subscriber| (*subscriber, self.results.get(subscriber)))
    }

    /// The subscribers whose results changed in the step that produced this
    /// view.
    pub fn changed(&self, subscriber: impl AsRef<SubscriberId>) -> bool {
        self.changed.contains(subscriber.as_ref())
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// The client core: applies inbound server messages, queues outbound frames,
/// and recomputes the effective query view.
///
/// All methods are synchronous; the embedding is responsible for serializing
/// calls onto one logical executor.
pub struct BaseRiptideClient {
    local_state: LocalSyncState,
    remote_query_set: RemoteQuerySet,
    request_manager: RequestManager,
    optimistic_query_results: OptimisticQueryResults,
    next_request_id: RequestId,
    outgoing_message_queue: VecDeque<ClientMessage>,
}

impl BaseRiptideClient {
    pub fn new() -> Self {
        Self {
            local_state: LocalSyncState::new(),
            remote_query_set: RemoteQuerySet::new(),
            request_manager: RequestManager::new(),
            optimistic_query_results: OptimisticQueryResults::new(),
            next_request_id: RequestId::MIN,
            outgoing_message_queue: VecDeque::new(),
        }
    }

    /// Add a subscriber for `udf_path(args)`, queueing a query set update if
    /// this query wasn't subscribed yet.
    pub fn subscribe(
        &mut self,
        udf_path: UdfPath,
        args: BTreeMap<String, JsonValue>,
    ) -> SubscriberId {
        self.subscribe_with_journal(udf_path, args, None)
    }

    /// Subscribe, resuming from a journal saved by a previous subscription.
    pub fn subscribe_with_journal(
        &mut self,
        udf_path: UdfPath,
        args: BTreeMap<String, JsonValue>,
        journal: Option<String>,
    ) -> SubscriberId {
        let (subscriber_id, message) = self.local_state.subscribe(udf_path, args, journal);
        if let Some(message) = message {
            self.outgoing_message_queue.push_back(message);
        }
        subscriber_id
    }

    pub fn unsubscribe(&mut self, subscriber_id: SubscriberId) {
        if let Some(message) = self.local_state.unsubscribe(subscriber_id) {
            self.outgoing_message_queue.push_back(message);
        }
    }

    /// Run a mutation. The receiver resolves only once the mutation's effects
    /// are reflected in the query view.
    pub fn mutation(
        &mut self,
        udf_path: UdfPath,
        args: BTreeMap<String, JsonValue>,
    ) -> oneshot::Receiver<RequestCompletion> {
        let (receiver, _) = self.mutation_inner(udf_path, args, None);
        receiver
    }

    /// Run a mutation with an optimistic update applied to the local view
    /// until the mutation completes. Returns the updated view if the update
    /// changed anything, for immediate publication.
    pub fn mutation_with_optimistic_update(
        &mut self,
        udf_path: UdfPath,
        args: BTreeMap<String, JsonValue>,
        update: OptimisticUpdate,
    ) -> (oneshot::Receiver<RequestCompletion>, Option<QueryResults>) {
        self.mutation_inner(udf_path, args, Some(update))
    }

    fn mutation_inner(
        &mut self,
        udf_path: UdfPath,
        args: BTreeMap<String, JsonValue>,
        update: Option<OptimisticUpdate>,
    ) -> (oneshot::Receiver<RequestCompletion>, Option<QueryResults>) {
        let request_id = self.next_request_id.increment();
        let message = ClientMessage::Mutation {
            request_id,
            udf_path,
            args: vec![JsonValue::Object(args.into_iter().collect())],
        };
        let receiver = self.request_manager.track_request(request_id, message.clone());
        self.outgoing_message_queue.push_back(message);

        let results = update.and_then(|update| {
            let changed_tokens = self
                .optimistic_query_results
                .apply_optimistic_update(update, request_id);
            self.build_query_results(changed_tokens)
        });
        (receiver, results)
    }

    pub fn action(
        &mut self,
        udf_path: UdfPath,
        args: BTreeMap<String, JsonValue>,
    ) -> oneshot::Receiver<RequestCompletion> {
        let request_id = self.next_request_id.increment();
        let message = ClientMessage::Action {
            request_id,
            udf_path,
            args: vec![JsonValue::Object(args.into_iter().collect())],
        };
        let receiver = self.request_manager.track_request(request_id, message.clone());
        self.outgoing_message_queue.push_back(message);
        receiver
    }

    /// Apply one inbound message. Returns the new query view when the
    /// effective view changed. An error here is a protocol violation: the
    /// connection cannot be trusted and must be torn down.
    ///
    /// `AuthError` and `FatalError` are connection-level concerns routed by
    /// the embedding before messages reach this core.
    pub fn receive_message(
        &mut self,
        message: ServerMessage,
    ) -> anyhow::Result<Option<QueryResults>> {
        match message {
            ServerMessage::Transition {
                start_version,
                end_version,
                modifications,
            } => {
                self.local_state.save_query_journals(&modifications);
                self.remote_query_set
                    .transition(start_version, end_version, modifications)?;
                let completed = self
                    .request_manager
                    .remove_completed(self.remote_query_set.timestamp());
                Ok(self.ingest_server_view(&completed))
            },
            ServerMessage::MutationResponse {
                request_id,
                result,
                ts,
                log_lines,
            } => {
                trace_log_lines(request_id, &log_lines);
                match self
                    .request_manager
                    .on_mutation_response(request_id, result, ts)?
                {
                    // The failed mutation's optimistic update rolls back on
                    // the same tick as the failure is reported.
                    Some(failed_id) => Ok(self.ingest_server_view(&[failed_id])),
                    None => Ok(None),
                }
            },
            ServerMessage::ActionResponse {
                request_id,
                result,
                log_lines,
            } => {
                trace_log_lines(request_id, &log_lines);
                self.request_manager.on_action_response(request_id, result)?;
                Ok(None)
            },
            ServerMessage::Ping => Ok(None),
            message @ (ServerMessage::AuthError { .. } | ServerMessage::FatalError { .. }) => {
                anyhow::bail!("{message} must be routed by the connection worker")
            },
        }
    }

    /// Deliver all request completions decided since the last call. The
    /// embedding calls this after publishing the view those completions
    /// depend on, so a caller awaiting a mutation always wakes to a view
    /// that reflects it.
    pub fn resolve_completed_requests(&mut self) {
        self.request_manager.flush_ready_completions();
    }

    /// Pop the next outbound frame.
    pub fn pop_next_message(&mut self) -> Option<ClientMessage> {
        self.outgoing_message_queue.pop_front()
    }

    /// Record that a request frame was handed to an open socket, as reported
    /// by the transport. From here on the request might have reached the
    /// server, so it is no longer safe to replay unless the server
    /// deduplicates it.
    pub fn mark_sent(&mut self, request_id: RequestId) {
        self.request_manager.mark_sent(request_id);
    }

    /// Rebuild the outbound queue for a fresh connection: the full query set,
    /// current auth, and every request that must be replayed.
    pub fn resend_ongoing_queries_mutations(&mut self) {
        self.outgoing_message_queue.clear();
        self.remote_query_set.restart();
        let (query_set, auth) = self.local_state.restart();
        self.outgoing_message_queue.push_back(query_set);
        if let Some(auth) = auth {
            self.outgoing_message_queue.push_back(auth);
        }
        for message in self.request_manager.restart() {
            self.outgoing_message_queue.push_back(message);
        }
    }

    pub fn set_auth(&mut self, token: AuthenticationToken) {
        let message = self.local_state.set_auth(token);
        self.outgoing_message_queue.push_back(message);
    }

    pub fn clear_auth(&mut self) {
        let message = self.local_state.clear_auth();
        self.outgoing_message_queue.push_back(message);
    }

    pub fn has_auth(&self) -> bool {
        self.local_state.has_auth()
    }

    /// Resolve everything in flight with `error`. Used at shutdown and on
    /// fatal server errors; completions are delivered immediately.
    pub fn fail_all_requests(&mut self, error: ClientError) {
        self.request_manager.fail_all(error);
        self.request_manager.flush_ready_completions();
    }

    pub fn max_observed_timestamp(&self) -> Option<Timestamp> {
        self.remote_query_set.max_observed_timestamp()
    }

    pub fn observed_timestamp(&self) -> Timestamp {
        self.remote_query_set.timestamp()
    }

    /// The current effective (optimistic) result for a query, if any.
    pub fn local_query_result(
        &self,
        udf_path: &UdfPath,
        args: &BTreeMap<String, JsonValue>,
    ) -> Option<FunctionResult> {
        let token = QueryToken::new(udf_path, args);
        self.optimistic_query_results.query_result(&token).cloned()
    }

    /// The most recent journal the server issued for a query.
    pub fn query_journal(
        &self,
        udf_path: &UdfPath,
        args: &BTreeMap<String, JsonValue>,
    ) -> Option<String> {
        let token = QueryToken::new(udf_path, args);
        self.local_state.query_journal(&token).map(str::to_owned)
    }

    /// The latest result for one subscriber, used to prime new subscriptions
    /// whose query already has a value.
    pub fn latest_result(&self, subscriber_id: SubscriberId) -> Option<FunctionResult> {
        let token = self.local_state.query_token(subscriber_id.query_id())?;
        self.optimistic_query_results.query_result(token).cloned()
    }

    pub fn has_inflight_requests(&self) -> bool {
        self.request_manager.has_inflight_requests()
    }

    pub fn has_incomplete_requests(&self) -> bool {
        self.request_manager.has_incomplete_requests()
    }

    pub fn time_of_oldest_inflight_request(&self) -> Option<std::time::Instant> {
        self.request_manager.time_of_oldest_inflight_request()
    }

    /// Refresh the optimistic overlay from the authoritative view and build
    /// the publishable results if anything changed.
    fn ingest_server_view(&mut self, completed: &[RequestId]) -> Option<QueryResults> {
        let server_view: BTreeMap<QueryToken, QueryResultEntry> = self
            .local_state
            .queries()
            .map(|(token, query_id, udf_path, args)| {
                (
                    token.clone(),
                    QueryResultEntry {
                        udf_path: udf_path.clone(),
                        args: args.clone(),
                        result: self.remote_query_set.get(query_id).cloned(),
                    },
                )
            })
            .collect();
        let changed_tokens = self
            .optimistic_query_results
            .ingest_query_results_from_server(server_view, completed);
        self.build_query_results(changed_tokens)
    }

    fn build_query_results(&self, changed_tokens: Vec<QueryToken>) -> Option<QueryResults> {
        if changed_tokens.is_empty() {
            return None;
        }
        let mut results = imbl::OrdMap::new();
        let mut subscribers = imbl::OrdSet::new();
        let mut changed = imbl::OrdSet::new();
        for (token, _, _, _) in self.local_state.queries() {
            let result = self.optimistic_query_results.query_result(token);
            let token_changed = changed_tokens.contains(token);
            for subscriber in self.local_state.subscribers(token) {
                subscribers.insert(subscriber);
                if let Some(result) = result {
                    results.insert(subscriber, result.clone());
                }
                if token_changed {
                    changed.insert(subscriber);
                }
            }
        }
        // A change with no subscriber left to observe it (the query was
        // released while its update was in flight) is not worth emitting.
        if changed.is_empty() {
            return None;
        }
        Some(QueryResults {
            results,
            subscribers,
            changed,
        })
    }
}

fn trace_log_lines(request_id: RequestId, log_lines: &riptide_sync_types::LogLinesMessage) {
    for line in &log_lines.0 {
        tracing::debug!("[request {request_id}] {line}");
    }
}
