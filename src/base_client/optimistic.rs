use std::collections::BTreeMap;

use riptide_sync_types::{
    RequestId,
    UdfPath,
};
use serde_json::Value as JsonValue;

use crate::base_client::{
    FunctionResult,
    QueryToken,
};

/// A caller-supplied edit to the local query view, applied while its mutation
/// is in flight. Updates are re-run from the authoritative base every time
/// the view changes, so they must be pure functions of the store.
pub type OptimisticUpdate = Box<dyn Fn(&mut OptimisticLocalStore<'_>) + Send>;

/// One query's entry in the effective view: identity plus its current result,
/// `None` while the server hasn't evaluated it yet.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResultEntry {
    pub udf_path: UdfPath,
    pub args: BTreeMap<String, JsonValue>,
    pub result: Option<FunctionResult>,
}

/// Mutable handle handed to optimistic updates. Writes only affect queries
/// currently in the subscription set; anything else is dropped.
pub struct OptimisticLocalStore<'a> {
    view: &'a mut BTreeMap<QueryToken, QueryResultEntry>,
}

impl OptimisticLocalStore<'_> {
    pub fn get_query(
        &self,
        udf_path: &UdfPath,
        args: &BTreeMap<String, JsonValue>,
    ) -> Option<&FunctionResult> {
        let token = QueryToken::new(udf_path, args);
        self.view.get(&token).and_then(|entry| entry.result.as_ref())
    }

    /// All subscribed queries for one udf path, with their arguments. Lets an
    /// update rewrite every variant of a paginated or filtered query.
    pub fn get_all_queries(
        &self,
        udf_path: &UdfPath,
    ) -> Vec<(BTreeMap<String, JsonValue>, Option<&FunctionResult>)> {
        self.view
            .values()
            .filter(|entry| entry.udf_path == *udf_path)
            .map(|entry| (entry.args.clone(), entry.result.as_ref()))
            .collect()
    }

    /// Set a query's value in the local view, or clear it back to loading
    /// with `None`.
    pub fn set_query(
        &mut self,
        udf_path: &UdfPath,
        args: &BTreeMap<String, JsonValue>,
        value: Option<JsonValue>,
    ) {
        let token = QueryToken::new(udf_path, args);
        if let Some(entry) = self.view.get_mut(&token) {
            entry.result = value.map(FunctionResult::Value);
        }
    }
}

struct TrackedUpdate {
    mutation_id: RequestId,
    update: OptimisticUpdate,
}

/// The effective query view: the authoritative server results with all
/// active optimistic updates layered on top, in submission order.
pub struct OptimisticQueryResults {
    query_results: BTreeMap<QueryToken, QueryResultEntry>,
    optimistic_updates: Vec<TrackedUpdate>,
}

impl OptimisticQueryResults {
    pub fn new() -> Self {
        Self {
            query_results: BTreeMap::new(),
            optimistic_updates: Vec::new(),
        }
    }

    /// Replace the authoritative base, drop updates for completed mutations,
    /// re-apply the survivors, and report which tokens changed relative to
    /// the previously emitted view.
    pub fn ingest_query_results_from_server(
        &mut self,
        server_query_results: BTreeMap<QueryToken, QueryResultEntry>,
        completed_mutation_ids: &[RequestId],
    ) -> Vec<QueryToken> {
        self.optimistic_updates
            .retain(|tracked| !completed_mutation_ids.contains(&tracked.mutation_id));
        let old_query_results =
            std::mem::replace(&mut self.query_results, server_query_results);
        let mut store = OptimisticLocalStore {
            view: &mut self.query_results,
        };
        for tracked in &self.optimistic_updates {
            (tracked.update)(&mut store);
        }
        Self::diff(&old_query_results, &self.query_results)
    }

    /// Layer a new update on the current view. Later updates observe earlier
    /// ones' writes.
    pub fn apply_optimistic_update(
        &mut self,
        update: OptimisticUpdate,
        mutation_id: RequestId,
    ) -> Vec<QueryToken> {
        let old_query_results = self.query_results.clone();
        {
            let mut store = OptimisticLocalStore {
                view: &mut self.query_results,
            };
            update(&mut store);
        }
        self.optimistic_updates.push(TrackedUpdate {
            mutation_id,
            update,
        });
        Self::diff(&old_query_results, &self.query_results)
    }

    pub fn query_result(&self, query_token: &QueryToken) -> Option<&FunctionResult> {
        self.query_results
            .get(query_token)
            .and_then(|entry| entry.result.as_ref())
    }

    fn diff(
        old: &BTreeMap<QueryToken, QueryResultEntry>,
        new: &BTreeMap<QueryToken, QueryResultEntry>,
    ) -> Vec<QueryToken> {
        let mut changed = Vec::new();
        for (token, entry) in new {
            if old.get(token).map(|e| &e.result) != Some(&entry.result) {
                changed.push(token.clone());
            }
        }
        for token in old.keys() {
            if !new.contains_key(token) {
                changed.push(token.clone());
            }
        }
        changed
    }
}
