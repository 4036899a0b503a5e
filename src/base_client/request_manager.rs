use std::{
    collections::BTreeMap,
    time::Instant,
};

use riptide_sync_types::{
    ClientMessage,
    RequestId,
    Timestamp,
};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::{
    base_client::FunctionResult,
    ClientError,
};

pub type RequestCompletion = Result<FunctionResult, ClientError>;
type CompletionSender = oneshot::Sender<RequestCompletion>;

/// Tracks every mutation and action from submission until its caller has been
/// given a result.
///
/// Actions resolve as soon as their response arrives. Successful mutations are
/// held until the remote query set has observed the mutation's timestamp, so
/// a caller awaiting a mutation never sees a view that predates its effects.
pub struct RequestManager {
    inflight_requests: BTreeMap<RequestId, InflightRequest>,
    /// Completions that have been decided but not yet delivered. The
    /// orchestrator flushes these after publishing the query view the
    /// completion depends on.
    ready_completions: Vec<(CompletionSender, RequestCompletion)>,
}

struct InflightRequest {
    /// The original frame, retained so unresolved requests can be replayed on
    /// a fresh connection.
    message: ClientMessage,
    requested_at: Instant,
    /// Set when the transport reports the frame was handed to an open
    /// socket. A request the transport refused can safely be resent; one
    /// that might have reached the server cannot, unless it is a mutation
    /// (which the server serializes by request id).
    might_be_sent: bool,
    status: RequestStatus,
}

enum RequestStatus {
    /// Waiting for the server's response.
    Requested { sender: CompletionSender },
    /// Mutation succeeded at `ts`; held until the query view catches up.
    Completed {
        sender: CompletionSender,
        result: FunctionResult,
        ts: Timestamp,
    },
}

impl RequestManager {
    pub fn new() -> Self {
        Self {
            inflight_requests: BTreeMap::new(),
            ready_completions: Vec::new(),
        }
    }

    pub fn track_request(
        &mut self,
        request_id: RequestId,
        message: ClientMessage,
    ) -> oneshot::Receiver<RequestCompletion> {
        let (sender, receiver) = oneshot::channel();
        let prev = self.inflight_requests.insert(
            request_id,
            InflightRequest {
                message,
                requested_at: Instant::now(),
                might_be_sent: false,
                status: RequestStatus::Requested { sender },
            },
        );
        assert!(prev.is_none(), "Request id {request_id} reused");
        receiver
    }

    /// Record that a request frame was handed to an open socket, as reported
    /// by the transport.
    pub fn mark_sent(&mut self, request_id: RequestId) {
        if let Some(request) = self.inflight_requests.get_mut(&request_id) {
            request.might_be_sent = true;
        }
    }

    /// Handle a mutation response. Failures resolve immediately; successes
    /// are held until [`Self::remove_completed`] observes their timestamp.
    /// Returns the request id if the mutation failed, so its optimistic
    /// update can be rolled back on the same tick.
    ///
    /// A second response for a request that is already held is a protocol
    /// violation: the error propagates and the caller tears the connection
    /// down. Responses for ids this client no longer tracks (dropped during
    /// a reconnect) are ignored.
    pub fn on_mutation_response(
        &mut self,
        request_id: RequestId,
        result: Result<JsonValue, String>,
        ts: Option<Timestamp>,
    ) -> anyhow::Result<Option<RequestId>> {
        let Some(request) = self.inflight_requests.remove(&request_id) else {
            return Ok(None);
        };
        let InflightRequest {
            message,
            requested_at,
            might_be_sent,
            status,
        } = request;
        let sender = match status {
            RequestStatus::Requested { sender } => sender,
            RequestStatus::Completed { sender, result, ts } => {
                // Keep the held completion tracked so the teardown that
                // follows delivers a proper error to its caller.
                self.inflight_requests.insert(
                    request_id,
                    InflightRequest {
                        message,
                        requested_at,
                        might_be_sent,
                        status: RequestStatus::Completed { sender, result, ts },
                    },
                );
                anyhow::bail!("Mutation {request_id} received a second response");
            },
        };
        let outcome = match (result, ts) {
            (Ok(value), Some(ts)) => {
                self.inflight_requests.insert(
                    request_id,
                    InflightRequest {
                        message,
                        requested_at,
                        might_be_sent,
                        status: RequestStatus::Completed {
                            sender,
                            result: FunctionResult::Value(value),
                            ts,
                        },
                    },
                );
                None
            },
            (Ok(value), None) => {
                // No timestamp means there is no view to wait for.
                self.ready_completions
                    .push((sender, Ok(FunctionResult::Value(value))));
                None
            },
            (Err(error_message), _) => {
                self.ready_completions
                    .push((sender, Ok(FunctionResult::ErrorMessage(error_message))));
                Some(request_id)
            },
        };
        Ok(outcome)
    }

    pub fn on_action_response(
        &mut self,
        request_id: RequestId,
        result: Result<JsonValue, String>,
    ) -> anyhow::Result<()> {
        let Some(request) = self.inflight_requests.remove(&request_id) else {
            return Ok(());
        };
        let InflightRequest {
            message,
            requested_at,
            might_be_sent,
            status,
        } = request;
        let sender = match status {
            RequestStatus::Requested { sender } => sender,
            RequestStatus::Completed { sender, result, ts } => {
                self.inflight_requests.insert(
                    request_id,
                    InflightRequest {
                        message,
                        requested_at,
                        might_be_sent,
                        status: RequestStatus::Completed { sender, result, ts },
                    },
                );
                anyhow::bail!("Action {request_id} received a second response");
            },
        };
        let result = match result {
            Ok(value) => FunctionResult::Value(value),
            Err(error_message) => FunctionResult::ErrorMessage(error_message),
        };
        self.ready_completions.push((sender, Ok(result)));
        Ok(())
    }

    /// Queue completions for all held mutations whose timestamp the query
    /// view has reached, returning their ids for optimistic cleanup.
    pub fn remove_completed(&mut self, current_ts: Timestamp) -> Vec<RequestId> {
        let completed: Vec<RequestId> = self
            .inflight_requests
            .iter()
            .filter(|(_, request)| {
                matches!(&request.status, RequestStatus::Completed { ts, .. } if *ts <= current_ts)
            })
            .map(|(request_id, _)| *request_id)
            .collect();
        for request_id in &completed {
            let request = self
                .inflight_requests
                .remove(request_id)
                .expect("Completed request vanished");
            let RequestStatus::Completed { sender, result, .. } = request.status else {
                unreachable!()
            };
            self.ready_completions.push((sender, Ok(result)));
        }
        completed
    }

    /// Deliver all decided completions. Called after the query view they
    /// depend on has been published, so callers wake to a view that already
    /// reflects their request.
    pub fn flush_ready_completions(&mut self) {
        for (sender, completion) in self.ready_completions.drain(..) {
            // The caller may have dropped its receiver; that's fine.
            let _ = sender.send(completion);
        }
    }

    /// Frames to replay on a fresh connection, in request-id order.
    ///
    /// Unresolved mutations are always replayed: the server serializes them
    /// by request id, so a duplicate is deduplicated server-side. Actions are
    /// not idempotent by contract, so an action that might have reached the
    /// server fails with a distinct error instead of being replayed; one the
    /// transport never put on a socket is replayed.
    pub fn restart(&mut self) -> Vec<ClientMessage> {
        let mut failed_actions = Vec::new();
        let mut resend = Vec::new();
        for (request_id, request) in &mut self.inflight_requests {
            match (&request.message, &request.status) {
                (ClientMessage::Mutation { .. }, RequestStatus::Requested { .. }) => {
                    request.might_be_sent = false;
                    resend.push(request.message.clone());
                },
                (ClientMessage::Action { .. }, RequestStatus::Requested { .. }) => {
                    if request.might_be_sent {
                        failed_actions.push(*request_id);
                    } else {
                        resend.push(request.message.clone());
                    }
                },
                // Held mutations already ran server-side; they resolve once
                // the restored view reaches their timestamp.
                (_, RequestStatus::Completed { .. }) => (),
                (message, _) => panic!("Untrackable request frame {message:?}"),
            }
        }
        for request_id in failed_actions {
            let request = self
                .inflight_requests
                .remove(&request_id)
                .expect("Failed action vanished");
            let RequestStatus::Requested { sender } = request.status else {
                unreachable!()
            };
            self.ready_completions
                .push((sender, Err(ClientError::ActionLostWhileReconnecting)));
        }
        resend
    }

    /// Resolve everything with `error` and queue the completions for
    /// delivery. Used when the client shuts down or hits a fatal error.
    pub fn fail_all(&mut self, error: ClientError) {
        let inflight = std::mem::take(&mut self.inflight_requests);
        for (_, request) in inflight {
            let (RequestStatus::Requested { sender }
            | RequestStatus::Completed { sender, .. }) = request.status;
            self.ready_completions.push((sender, Err(error.clone())));
        }
    }

    pub fn has_inflight_requests(&self) -> bool {
        self.inflight_requests
            .values()
            .any(|request| matches!(request.status, RequestStatus::Requested { .. }))
    }

    /// True while any request, held or in flight, has not delivered a result.
    pub fn has_incomplete_requests(&self) -> bool {
        !self.inflight_requests.is_empty()
    }

    pub fn time_of_oldest_inflight_request(&self) -> Option<Instant> {
        self.inflight_requests
            .values()
            .filter(|request| matches!(request.status, RequestStatus::Requested { .. }))
            .map(|request| request.requested_at)
            .min()
    }
}
