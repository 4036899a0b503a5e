use std::collections::BTreeMap;

use riptide_sync_types::{
    QueryId,
    StateModification,
    StateVersion,
    Timestamp,
};

use crate::base_client::FunctionResult;

/// The authoritative view pushed by the server: each subscribed query's
/// latest result at the current logical timestamp.
pub struct RemoteQuerySet {
    version: StateVersion,
    remote_query_set: BTreeMap<QueryId, FunctionResult>,
    /// High-water mark across all connections in this session, reported to
    /// the server on reconnect so the restored view never moves backwards.
    max_observed_timestamp: Option<Timestamp>,
}

impl RemoteQuerySet {
    pub fn new() -> Self {
        Self {
            version: StateVersion::initial(),
            remote_query_set: BTreeMap::new(),
            max_observed_timestamp: None,
        }
    }

    /// Apply a transition. The transition's start version must match the held
    /// version exactly; anything else means the server and client disagree
    /// about the session state and the connection cannot be trusted.
    pub fn transition(
        &mut self,
        start_version: StateVersion,
        end_version: StateVersion,
        modifications: Vec<StateModification>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.version == start_version,
            "Protocol violation: transition started at {start_version:?} but the client was at \
             {:?}",
            self.version,
        );
        anyhow::ensure!(
            end_version.ts >= start_version.ts,
            "Protocol violation: transition moved backwards from {start_version:?} to \
             {end_version:?}",
        );
        for modification in modifications {
            match modification {
                StateModification::QueryUpdated {
                    query_id,
                    value,
                    log_lines,
                    ..
                } => {
                    trace_log_lines(query_id, &log_lines);
                    self.remote_query_set
                        .insert(query_id, FunctionResult::Value(value));
                },
                StateModification::QueryFailed {
                    query_id,
                    error_message,
                    log_lines,
                } => {
                    trace_log_lines(query_id, &log_lines);
                    self.remote_query_set
                        .insert(query_id, FunctionResult::ErrorMessage(error_message));
                },
                StateModification::QueryRemoved { query_id } => {
                    self.remote_query_set.remove(&query_id);
                },
            }
        }
        self.version = end_version;
        if self.max_observed_timestamp.map_or(true, |ts| ts < end_version.ts) {
            self.max_observed_timestamp = Some(end_version.ts);
        }
        Ok(())
    }

    /// Reset the version chain for a fresh connection, keeping the previous
    /// results so the view doesn't blank out before the first transition.
    pub fn restart(&mut self) {
        self.version = StateVersion::initial();
    }

    pub fn timestamp(&self) -> Timestamp {
        self.version.ts
    }

    pub fn max_observed_timestamp(&self) -> Option<Timestamp> {
        self.max_observed_timestamp
    }

    pub fn get(&self, query_id: QueryId) -> Option<&FunctionResult> {
        self.remote_query_set.get(&query_id)
    }
}

fn trace_log_lines(query_id: QueryId, log_lines: &riptide_sync_types::LogLinesMessage) {
    for line in &log_lines.0 {
        tracing::debug!("[query {query_id}] {line}");
    }
}
