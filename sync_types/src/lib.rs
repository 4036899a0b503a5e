//! Types for the Riptide websocket sync protocol.
//!
//! Every frame is a JSON object with a `type` tag. [`ClientMessage`] covers
//! the client → server direction and [`ServerMessage`] the reverse; both
//! convert to and from [`serde_json::Value`] with the exact wire layout.

use std::{
    collections::BTreeMap,
    fmt,
};

use serde_json::{
    json,
    Map as JsonMap,
    Value as JsonValue,
};
use uuid::Uuid;

pub mod backoff;
pub mod headers;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod timestamp;
mod udf_path;

pub use timestamp::Timestamp;
pub use udf_path::{
    check_valid_path_component,
    UdfPath,
    MAX_IDENTIFIER_LEN,
};

/// Unique identifier for a client instance, generated at construction and
/// included in every `Connect` frame and every telemetry event for the
/// lifetime of the client.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The all-zeros session id, used by deterministic tests.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

/// Identifier the client assigns to each query in its subscription set.
/// Query ids are injective for the lifetime of a session: once a query is
/// removed from the set, its id is never reused.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display,
)]
pub struct QueryId(u32);

impl QueryId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Identifier the client assigns to each mutation or action, increasing in
/// submission order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display,
)]
pub struct RequestId(u32);

impl RequestId {
    pub const MIN: RequestId = RequestId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn increment(&mut self) -> RequestId {
        let id = *self;
        self.0 += 1;
        id
    }
}

/// Version of the client's query set, advancing by one with every
/// `ModifyQuerySet` frame.
pub type QuerySetVersion = u32;

/// Version of the client's identity, advancing by one with every
/// `Authenticate` frame.
pub type IdentityVersion = u32;

/// A point in the session's logical time: which query set and identity the
/// client had presented, and the backend timestamp its view reflects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StateVersion {
    pub query_set: QuerySetVersion,
    pub identity: IdentityVersion,
    pub ts: Timestamp,
}

impl StateVersion {
    pub fn initial() -> Self {
        Self {
            query_set: 0,
            identity: 0,
            ts: Timestamp::MIN,
        }
    }
}

impl From<StateVersion> for JsonValue {
    fn from(version: StateVersion) -> Self {
        json!({
            "querySet": version.query_set,
            "identity": version.identity,
            "ts": JsonValue::from(version.ts),
        })
    }
}

impl TryFrom<JsonValue> for StateVersion {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let mut obj = expect_object(value, "StateVersion")?;
        Ok(Self {
            query_set: remove_u32(&mut obj, "querySet")?,
            identity: remove_u32(&mut obj, "identity")?,
            ts: Timestamp::try_from(remove_field(&mut obj, "ts")?)?,
        })
    }
}

/// A query in the subscription set: which function to run, with which
/// arguments, and optionally the journal left behind by a previous
/// subscription to pick up from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub query_id: QueryId,
    pub udf_path: UdfPath,
    pub args: Vec<JsonValue>,
    pub journal: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuerySetModification {
    Add(Query),
    Remove { query_id: QueryId },
}

/// Credential presented with an `Authenticate` frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthenticationToken {
    /// No authentication; act as an anonymous client.
    None,
    /// An OpenID Connect id token from the deployment's auth provider.
    User(String),
    /// A deploy key, optionally impersonating a user for development flows.
    Admin(String, Option<UserIdentityAttributes>),
}

/// Identity attributes an admin client forwards when impersonating a user.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentityAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Best-effort client telemetry, tagged with a type so the server can route
/// it without parsing the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientEvent {
    pub event_type: String,
    pub event: JsonValue,
}

/// Why the previous websocket connection went away, reported to the server in
/// the next `Connect` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum CloseReason {
    InitialConnect,
    ServerInactivityTimeout,
    ServerClose,
    ConnectError,
    ClientError,
    RotatingAuth,
    ClientClosed,
}

/// Server log lines produced while running a function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogLinesMessage(pub Vec<String>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    Connect {
        session_id: SessionId,
        connection_count: u32,
        last_close_reason: String,
        max_observed_timestamp: Option<Timestamp>,
    },
    ModifyQuerySet {
        base_version: QuerySetVersion,
        new_version: QuerySetVersion,
        modifications: Vec<QuerySetModification>,
    },
    Mutation {
        request_id: RequestId,
        udf_path: UdfPath,
        args: Vec<JsonValue>,
    },
    Action {
        request_id: RequestId,
        udf_path: UdfPath,
        args: Vec<JsonValue>,
    },
    Authenticate {
        base_version: IdentityVersion,
        token: AuthenticationToken,
    },
    Event(ClientEvent),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateModification {
    QueryUpdated {
        query_id: QueryId,
        value: JsonValue,
        journal: Option<String>,
        log_lines: LogLinesMessage,
    },
    QueryFailed {
        query_id: QueryId,
        error_message: String,
        log_lines: LogLinesMessage,
    },
    QueryRemoved {
        query_id: QueryId,
    },
}

impl StateModification {
    pub fn query_id(&self) -> QueryId {
        match self {
            StateModification::QueryUpdated { query_id, .. }
            | StateModification::QueryFailed { query_id, .. }
            | StateModification::QueryRemoved { query_id } => *query_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    Transition {
        start_version: StateVersion,
        end_version: StateVersion,
        modifications: Vec<StateModification>,
    },
    MutationResponse {
        request_id: RequestId,
        result: Result<JsonValue, String>,
        ts: Option<Timestamp>,
        log_lines: LogLinesMessage,
    },
    ActionResponse {
        request_id: RequestId,
        result: Result<JsonValue, String>,
        log_lines: LogLinesMessage,
    },
    AuthError {
        error_message: String,
        base_version: Option<IdentityVersion>,
        auth_update_attempted: bool,
    },
    FatalError {
        error_message: String,
    },
    Ping,
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ServerMessage::Transition { .. } => "Transition",
            ServerMessage::MutationResponse { .. } => "MutationResponse",
            ServerMessage::ActionResponse { .. } => "ActionResponse",
            ServerMessage::AuthError { .. } => "AuthError",
            ServerMessage::FatalError { .. } => "FatalError",
            ServerMessage::Ping => "Ping",
        };
        write!(f, "{name}")
    }
}

impl From<Query> for JsonValue {
    fn from(query: Query) -> Self {
        let mut obj = json!({
            "type": "Add",
            "queryId": query.query_id.get(),
            "udfPath": query.udf_path.to_string(),
            "args": JsonValue::Array(query.args),
        });
        if let Some(journal) = query.journal {
            obj["journal"] = JsonValue::String(journal);
        }
        obj
    }
}

impl From<QuerySetModification> for JsonValue {
    fn from(modification: QuerySetModification) -> Self {
        match modification {
            QuerySetModification::Add(query) => query.into(),
            QuerySetModification::Remove { query_id } => json!({
                "type": "Remove",
                "queryId": query_id.get(),
            }),
        }
    }
}

impl TryFrom<JsonValue> for QuerySetModification {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let mut obj = expect_object(value, "QuerySetModification")?;
        let modification = match remove_string(&mut obj, "type")?.as_str() {
            "Add" => QuerySetModification::Add(Query {
                query_id: QueryId::new(remove_u32(&mut obj, "queryId")?),
                udf_path: remove_string(&mut obj, "udfPath")?.parse()?,
                args: expect_array(remove_field(&mut obj, "args")?, "args")?,
                journal: remove_opt_string(&mut obj, "journal")?,
            }),
            "Remove" => QuerySetModification::Remove {
                query_id: QueryId::new(remove_u32(&mut obj, "queryId")?),
            },
            t => anyhow::bail!("Unexpected QuerySetModification type {t}"),
        };
        Ok(modification)
    }
}

impl From<ClientMessage> for JsonValue {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Connect {
                session_id,
                connection_count,
                last_close_reason,
                max_observed_timestamp,
            } => {
                let mut obj = json!({
                    "type": "Connect",
                    "sessionId": session_id.to_string(),
                    "connectionCount": connection_count,
                    "lastCloseReason": last_close_reason,
                });
                if let Some(ts) = max_observed_timestamp {
                    obj["maxObservedTimestamp"] = ts.into();
                }
                obj
            },
            ClientMessage::ModifyQuerySet {
                base_version,
                new_version,
                modifications,
            } => json!({
                "type": "ModifyQuerySet",
                "baseVersion": base_version,
                "newVersion": new_version,
                "modifications": modifications
                    .into_iter()
                    .map(JsonValue::from)
                    .collect::<Vec<_>>(),
            }),
            ClientMessage::Mutation {
                request_id,
                udf_path,
                args,
            } => json!({
                "type": "Mutation",
                "requestId": request_id.get(),
                "udfPath": udf_path.to_string(),
                "args": JsonValue::Array(args),
            }),
            ClientMessage::Action {
                request_id,
                udf_path,
                args,
            } => json!({
                "type": "Action",
                "requestId": request_id.get(),
                "udfPath": udf_path.to_string(),
                "args": JsonValue::Array(args),
            }),
            ClientMessage::Authenticate {
                base_version,
                token,
            } => {
                let mut obj = json!({
                    "type": "Authenticate",
                    "baseVersion": base_version,
                });
                match token {
                    AuthenticationToken::None => {
                        obj["tokenType"] = "None".into();
                    },
                    AuthenticationToken::User(value) => {
                        obj["tokenType"] = "User".into();
                        obj["value"] = value.into();
                    },
                    AuthenticationToken::Admin(value, impersonating) => {
                        obj["tokenType"] = "Admin".into();
                        obj["value"] = value.into();
                        if let Some(attributes) = impersonating {
                            obj["impersonating"] = serde_json::to_value(attributes)
                                .expect("UserIdentityAttributes is always JSON-serializable");
                        }
                    },
                }
                obj
            },
            ClientMessage::Event(ClientEvent { event_type, event }) => json!({
                "type": "Event",
                "eventType": event_type,
                "event": event,
            }),
        }
    }
}

impl TryFrom<JsonValue> for ClientMessage {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let mut obj = expect_object(value, "ClientMessage")?;
        let message = match remove_string(&mut obj, "type")?.as_str() {
            "Connect" => ClientMessage::Connect {
                session_id: SessionId::new(remove_string(&mut obj, "sessionId")?.parse()?),
                connection_count: remove_u32(&mut obj, "connectionCount")?,
                last_close_reason: remove_string(&mut obj, "lastCloseReason")?,
                max_observed_timestamp: obj
                    .remove("maxObservedTimestamp")
                    .map(Timestamp::try_from)
                    .transpose()?,
            },
            "ModifyQuerySet" => ClientMessage::ModifyQuerySet {
                base_version: remove_u32(&mut obj, "baseVersion")?,
                new_version: remove_u32(&mut obj, "newVersion")?,
                modifications: expect_array(remove_field(&mut obj, "modifications")?, "modifications")?
                    .into_iter()
                    .map(QuerySetModification::try_from)
                    .collect::<anyhow::Result<Vec<_>>>()?,
            },
            "Mutation" => ClientMessage::Mutation {
                request_id: RequestId::new(remove_u32(&mut obj, "requestId")?),
                udf_path: remove_string(&mut obj, "udfPath")?.parse()?,
                args: expect_array(remove_field(&mut obj, "args")?, "args")?,
            },
            "Action" => ClientMessage::Action {
                request_id: RequestId::new(remove_u32(&mut obj, "requestId")?),
                udf_path: remove_string(&mut obj, "udfPath")?.parse()?,
                args: expect_array(remove_field(&mut obj, "args")?, "args")?,
            },
            "Authenticate" => {
                let base_version = remove_u32(&mut obj, "baseVersion")?;
                let token = match remove_string(&mut obj, "tokenType")?.as_str() {
                    "None" => AuthenticationToken::None,
                    "User" => AuthenticationToken::User(remove_string(&mut obj, "value")?),
                    "Admin" => AuthenticationToken::Admin(
                        remove_string(&mut obj, "value")?,
                        obj.remove("impersonating")
                            .map(serde_json::from_value)
                            .transpose()?,
                    ),
                    t => anyhow::bail!("Unexpected tokenType {t}"),
                };
                ClientMessage::Authenticate {
                    base_version,
                    token,
                }
            },
            "Event" => ClientMessage::Event(ClientEvent {
                event_type: remove_string(&mut obj, "eventType")?,
                event: remove_field(&mut obj, "event")?,
            }),
            t => anyhow::bail!("Unexpected ClientMessage type {t}"),
        };
        Ok(message)
    }
}

fn function_result_json(
    obj: &mut JsonMap<String, JsonValue>,
    result: Result<JsonValue, String>,
) {
    match result {
        Ok(value) => {
            obj.insert("success".to_owned(), true.into());
            obj.insert("result".to_owned(), value);
        },
        Err(error_message) => {
            obj.insert("success".to_owned(), false.into());
            obj.insert("errorMessage".to_owned(), error_message.into());
        },
    }
}

fn function_result_from_json(
    obj: &mut JsonMap<String, JsonValue>,
) -> anyhow::Result<Result<JsonValue, String>> {
    let success = remove_bool(obj, "success")?;
    if success {
        Ok(Ok(remove_field(obj, "result")?))
    } else {
        Ok(Err(remove_string(obj, "errorMessage")?))
    }
}

fn log_lines_json(log_lines: LogLinesMessage) -> JsonValue {
    JsonValue::Array(log_lines.0.into_iter().map(JsonValue::String).collect())
}

fn log_lines_from_json(value: JsonValue) -> anyhow::Result<LogLinesMessage> {
    let lines = expect_array(value, "logLines")?
        .into_iter()
        .map(|line| match line {
            JsonValue::String(s) => Ok(s),
            v => anyhow::bail!("Log line must be a string, got {v}"),
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(LogLinesMessage(lines))
}

impl From<StateModification> for JsonValue {
    fn from(modification: StateModification) -> Self {
        match modification {
            StateModification::QueryUpdated {
                query_id,
                value,
                journal,
                log_lines,
            } => json!({
                "type": "QueryUpdated",
                "queryId": query_id.get(),
                "value": value,
                "journal": journal,
                "logLines": log_lines_json(log_lines),
            }),
            StateModification::QueryFailed {
                query_id,
                error_message,
                log_lines,
            } => json!({
                "type": "QueryFailed",
                "queryId": query_id.get(),
                "errorMessage": error_message,
                "logLines": log_lines_json(log_lines),
            }),
            StateModification::QueryRemoved { query_id } => json!({
                "type": "QueryRemoved",
                "queryId": query_id.get(),
            }),
        }
    }
}

impl TryFrom<JsonValue> for StateModification {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let mut obj = expect_object(value, "StateModification")?;
        let modification = match remove_string(&mut obj, "type")?.as_str() {
            "QueryUpdated" => StateModification::QueryUpdated {
                query_id: QueryId::new(remove_u32(&mut obj, "queryId")?),
                value: remove_field(&mut obj, "value")?,
                journal: remove_opt_string(&mut obj, "journal")?,
                log_lines: log_lines_from_json(remove_field(&mut obj, "logLines")?)?,
            },
            "QueryFailed" => StateModification::QueryFailed {
                query_id: QueryId::new(remove_u32(&mut obj, "queryId")?),
                error_message: remove_string(&mut obj, "errorMessage")?,
                log_lines: log_lines_from_json(remove_field(&mut obj, "logLines")?)?,
            },
            "QueryRemoved" => StateModification::QueryRemoved {
                query_id: QueryId::new(remove_u32(&mut obj, "queryId")?),
            },
            t => anyhow::bail!("Unexpected StateModification type {t}"),
        };
        Ok(modification)
    }
}

impl From<ServerMessage> for JsonValue {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::Transition {
                start_version,
                end_version,
                modifications,
            } => json!({
                "type": "Transition",
                "startVersion": JsonValue::from(start_version),
                "endVersion": JsonValue::from(end_version),
                "modifications": modifications
                    .into_iter()
                    .map(JsonValue::from)
                    .collect::<Vec<_>>(),
            }),
            ServerMessage::MutationResponse {
                request_id,
                result,
                ts,
                log_lines,
            } => {
                let mut obj = JsonMap::new();
                obj.insert("type".to_owned(), "MutationResponse".into());
                obj.insert("requestId".to_owned(), request_id.get().into());
                function_result_json(&mut obj, result);
                if let Some(ts) = ts {
                    obj.insert("ts".to_owned(), ts.into());
                }
                obj.insert("logLines".to_owned(), log_lines_json(log_lines));
                JsonValue::Object(obj)
            },
            ServerMessage::ActionResponse {
                request_id,
                result,
                log_lines,
            } => {
                let mut obj = JsonMap::new();
                obj.insert("type".to_owned(), "ActionResponse".into());
                obj.insert("requestId".to_owned(), request_id.get().into());
                function_result_json(&mut obj, result);
                obj.insert("logLines".to_owned(), log_lines_json(log_lines));
                JsonValue::Object(obj)
            },
            ServerMessage::AuthError {
                error_message,
                base_version,
                auth_update_attempted,
            } => {
                let mut obj = json!({
                    "type": "AuthError",
                    "error": error_message,
                    "authUpdateAttempted": auth_update_attempted,
                });
                if let Some(base_version) = base_version {
                    obj["baseVersion"] = base_version.into();
                }
                obj
            },
            ServerMessage::FatalError { error_message } => json!({
                "type": "FatalError",
                "error": error_message,
            }),
            ServerMessage::Ping => json!({ "type": "Ping" }),
        }
    }
}

impl TryFrom<JsonValue> for ServerMessage {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let mut obj = expect_object(value, "ServerMessage")?;
        let message = match remove_string(&mut obj, "type")?.as_str() {
            "Transition" => ServerMessage::Transition {
                start_version: StateVersion::try_from(remove_field(&mut obj, "startVersion")?)?,
                end_version: StateVersion::try_from(remove_field(&mut obj, "endVersion")?)?,
                modifications: expect_array(remove_field(&mut obj, "modifications")?, "modifications")?
                    .into_iter()
                    .map(StateModification::try_from)
                    .collect::<anyhow::Result<Vec<_>>>()?,
            },
            "MutationResponse" => ServerMessage::MutationResponse {
                request_id: RequestId::new(remove_u32(&mut obj, "requestId")?),
                result: function_result_from_json(&mut obj)?,
                ts: obj.remove("ts").map(Timestamp::try_from).transpose()?,
                log_lines: log_lines_from_json(remove_field(&mut obj, "logLines")?)?,
            },
            "ActionResponse" => ServerMessage::ActionResponse {
                request_id: RequestId::new(remove_u32(&mut obj, "requestId")?),
                result: function_result_from_json(&mut obj)?,
                log_lines: log_lines_from_json(remove_field(&mut obj, "logLines")?)?,
            },
            "AuthError" => ServerMessage::AuthError {
                error_message: remove_string(&mut obj, "error")?,
                base_version: obj
                    .remove("baseVersion")
                    .map(|v| {
                        v.as_u64()
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| anyhow::anyhow!("baseVersion must be a u32, got {v}"))
                    })
                    .transpose()?,
                auth_update_attempted: remove_bool(&mut obj, "authUpdateAttempted")?,
            },
            "FatalError" => ServerMessage::FatalError {
                error_message: remove_string(&mut obj, "error")?,
            },
            "Ping" => ServerMessage::Ping,
            t => anyhow::bail!("Unexpected ServerMessage type {t}"),
        };
        Ok(message)
    }
}

/// Canonical token identifying a (udf path, args) pair. Two subscriptions
/// with the same token share a query id and a result.
pub fn serialize_path_and_args(udf_path: &UdfPath, args: &BTreeMap<String, JsonValue>) -> String {
    json!({
        "udfPath": udf_path.to_string(),
        "args": [args],
    })
    .to_string()
}

fn expect_object(
    value: JsonValue,
    context: &'static str,
) -> anyhow::Result<JsonMap<String, JsonValue>> {
    match value {
        JsonValue::Object(obj) => Ok(obj),
        v => anyhow::bail!("{context} must be an object, got {v}"),
    }
}

fn expect_array(value: JsonValue, context: &'static str) -> anyhow::Result<Vec<JsonValue>> {
    match value {
        JsonValue::Array(values) => Ok(values),
        v => anyhow::bail!("{context} must be an array, got {v}"),
    }
}

fn remove_field(
    obj: &mut JsonMap<String, JsonValue>,
    field: &'static str,
) -> anyhow::Result<JsonValue> {
    obj.remove(field)
        .ok_or_else(|| anyhow::anyhow!("Missing field {field}"))
}

fn remove_string(
    obj: &mut JsonMap<String, JsonValue>,
    field: &'static str,
) -> anyhow::Result<String> {
    match remove_field(obj, field)? {
        JsonValue::String(s) => Ok(s),
        v => anyhow::bail!("Field {field} must be a string, got {v}"),
    }
}

fn remove_opt_string(
    obj: &mut JsonMap<String, JsonValue>,
    field: &'static str,
) -> anyhow::Result<Option<String>> {
    match obj.remove(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(v) => anyhow::bail!("Field {field} must be a string, got {v}"),
    }
}

fn remove_u32(obj: &mut JsonMap<String, JsonValue>, field: &'static str) -> anyhow::Result<u32> {
    let value = remove_field(obj, field)?;
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| anyhow::anyhow!("Field {field} must be a u32, got {value}"))
}

fn remove_bool(obj: &mut JsonMap<String, JsonValue>, field: &'static str) -> anyhow::Result<bool> {
    match remove_field(obj, field)? {
        JsonValue::Bool(b) => Ok(b),
        v => anyhow::bail!("Field {field} must be a bool, got {v}"),
    }
}
