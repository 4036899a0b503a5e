use std::collections::{
    BTreeMap,
    BTreeSet,
};

use riptide_sync_types::{
    AuthenticationToken,
    ClientMessage,
    IdentityVersion,
    Query,
    QueryId,
    QuerySetModification,
    QuerySetVersion,
    StateModification,
    UdfPath,
};
use serde_json::Value as JsonValue;

use crate::base_client::{
    QueryToken,
    SubscriberId,
};

/// Client-side record of the subscription set: which queries the client is
/// subscribed to, their assigned ids, and the journals to resume from.
///
/// Subscriptions are interned by [`QueryToken`], so two subscribers to the
/// same (path, args) pair share one query id and one server-side evaluation.
pub struct LocalSyncState {
    next_query_id: u32,
    query_set_version: QuerySetVersion,
    query_set: BTreeMap<QueryToken, LocalQuery>,
    query_id_to_token: BTreeMap<QueryId, QueryToken>,
    identity_version: IdentityVersion,
    auth: Option<AuthenticationToken>,
}

struct LocalQuery {
    id: QueryId,
    udf_path: UdfPath,
    args: BTreeMap<String, JsonValue>,
    journal: Option<String>,
    next_subscriber_ix: usize,
    subscribers: BTreeSet<usize>,
}

impl LocalSyncState {
    pub fn new() -> Self {
        Self {
            next_query_id: 0,
            query_set_version: 0,
            query_set: BTreeMap::new(),
            query_id_to_token: BTreeMap::new(),
            identity_version: 0,
            auth: None,
        }
    }

    /// Add a subscriber for the given query. Returns the frame describing the
    /// query set change if this was the first subscriber for its token.
    pub fn subscribe(
        &mut self,
        udf_path: UdfPath,
        args: BTreeMap<String, JsonValue>,
        journal: Option<String>,
    ) -> (SubscriberId, Option<ClientMessage>) {
        let query_token = QueryToken::new(&udf_path, &args);
        if let Some(existing) = self.query_set.get_mut(&query_token) {
            let subscriber_ix = existing.next_subscriber_ix;
            existing.next_subscriber_ix += 1;
            existing.subscribers.insert(subscriber_ix);
            return (SubscriberId(existing.id, subscriber_ix), None);
        }

        // Query ids are never reused within a session, even if the same token
        // is resubscribed after being fully released.
        let query_id = QueryId::new(self.next_query_id);
        self.next_query_id += 1;

        let base_version = self.query_set_version;
        self.query_set_version += 1;

        let query = Query {
            query_id,
            udf_path: udf_path.clone(),
            args: vec![JsonValue::Object(
                args.clone().into_iter().collect(),
            )],
            journal: journal.clone(),
        };
        self.query_set.insert(
            query_token.clone(),
            LocalQuery {
                id: query_id,
                udf_path,
                args,
                journal,
                next_subscriber_ix: 1,
                subscribers: BTreeSet::from([0]),
            },
        );
        self.query_id_to_token.insert(query_id, query_token);

        let message = ClientMessage::ModifyQuerySet {
            base_version,
            new_version: self.query_set_version,
            modifications: vec![QuerySetModification::Add(query)],
        };
        (SubscriberId(query_id, 0), Some(message))
    }

    /// Drop a subscriber. Returns the removal frame if this was the last
    /// subscriber for its query.
    pub fn unsubscribe(&mut self, subscriber_id: SubscriberId) -> Option<ClientMessage> {
        let SubscriberId(query_id, subscriber_ix) = subscriber_id;
        let query_token = self.query_id_to_token.get(&query_id)?.clone();
        let query = self
            .query_set
            .get_mut(&query_token)
            .expect("Query id mapped to a token without a query");
        query.subscribers.remove(&subscriber_ix);
        if !query.subscribers.is_empty() {
            return None;
        }

        self.query_set.remove(&query_token);
        self.query_id_to_token.remove(&query_id);

        let base_version = self.query_set_version;
        self.query_set_version += 1;
        Some(ClientMessage::ModifyQuerySet {
            base_version,
            new_version: self.query_set_version,
            modifications: vec![QuerySetModification::Remove { query_id }],
        })
    }

    /// Record server-provided journals so a future resubscribe picks up where
    /// this subscription left off.
    pub fn save_query_journals(&mut self, modifications: &[StateModification]) {
        for modification in modifications {
            if let StateModification::QueryUpdated {
                query_id,
                journal: Some(journal),
                ..
            } = modification
            {
                if let Some(token) = self.query_id_to_token.get(query_id) {
                    let query = self
                        .query_set
                        .get_mut(token)
                        .expect("Query id mapped to a token without a query");
                    query.journal = Some(journal.clone());
                }
            }
        }
    }

    /// Frames that rebuild the full subscription set and re-present auth on a
    /// fresh connection. Resets both version chains: the server's view of this
    /// session starts over.
    pub fn restart(&mut self) -> (ClientMessage, Option<ClientMessage>) {
        self.query_set_version = 1;
        let modifications = self
            .query_set
            .values()
            .map(|query| {
                QuerySetModification::Add(Query {
                    query_id: query.id,
                    udf_path: query.udf_path.clone(),
                    args: vec![JsonValue::Object(query.args.clone().into_iter().collect())],
                    journal: query.journal.clone(),
                })
            })
            .collect();
        let query_set = ClientMessage::ModifyQuerySet {
            base_version: 0,
            new_version: 1,
            modifications,
        };

        let auth = self.auth.clone().map(|token| {
            self.identity_version = 1;
            ClientMessage::Authenticate {
                base_version: 0,
                token,
            }
        });
        if auth.is_none() {
            self.identity_version = 0;
        }
        (query_set, auth)
    }

    pub fn set_auth(&mut self, token: AuthenticationToken) -> ClientMessage {
        let base_version = self.identity_version;
        self.identity_version += 1;
        self.auth = match token {
            AuthenticationToken::None => None,
            ref token => Some(token.clone()),
        };
        ClientMessage::Authenticate {
            base_version,
            token,
        }
    }

    pub fn clear_auth(&mut self) -> ClientMessage {
        self.set_auth(AuthenticationToken::None)
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    pub fn query_token(&self, query_id: QueryId) -> Option<&QueryToken> {
        self.query_id_to_token.get(&query_id)
    }

    pub fn query_id(&self, query_token: &QueryToken) -> Option<QueryId> {
        self.query_set.get(query_token).map(|query| query.id)
    }

    pub fn query_path(&self, query_token: &QueryToken) -> Option<&UdfPath> {
        self.query_set.get(query_token).map(|query| &query.udf_path)
    }

    pub fn query_args(&self, query_token: &QueryToken) -> Option<&BTreeMap<String, JsonValue>> {
        self.query_set.get(query_token).map(|query| &query.args)
    }

    pub fn query_journal(&self, query_token: &QueryToken) -> Option<&str> {
        self.query_set
            .get(query_token)
            .and_then(|query| query.journal.as_deref())
    }

    pub fn queries(
        &self,
    ) -> impl Iterator<Item = (&QueryToken, QueryId, &UdfPath, &BTreeMap<String, JsonValue>)> {
        self.query_set
            .iter()
            .map(|(token, query)| (token, query.id, &query.udf_path, &query.args))
    }

    pub fn subscribers(&self, query_token: &QueryToken) -> impl Iterator<Item = SubscriberId> + '_ {
        self.query_set
            .get(query_token)
            .into_iter()
            .flat_map(|query| {
                query
                    .subscribers
                    .iter()
                    .map(move |ix| SubscriberId(query.id, *ix))
            })
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use proptest::prelude::*;
    use riptide_sync_types::{
        ClientMessage,
        QuerySetModification,
    };

    use super::LocalSyncState;

    fn subscribed_tokens(state: &LocalSyncState) -> Vec<String> {
        state.queries().map(|(token, ..)| token.0.clone()).collect()
    }

    #[test]
    fn test_shared_token_sends_one_add() {
        let mut state = LocalSyncState::new();
        let (sub1, message1) =
            state.subscribe("messages:list".parse().unwrap(), btreemap! {}, None);
        let (sub2, message2) =
            state.subscribe("messages:list".parse().unwrap(), btreemap! {}, None);
        assert!(message1.is_some());
        assert!(message2.is_none());
        assert_eq!(sub1.query_id(), sub2.query_id());
        assert_ne!(sub1, sub2);

        // Only the last unsubscribe produces a removal.
        assert!(state.unsubscribe(sub1).is_none());
        let removal = state.unsubscribe(sub2).expect("Last unsubscribe removes");
        let ClientMessage::ModifyQuerySet { modifications, .. } = removal else {
            panic!("Expected ModifyQuerySet");
        };
        assert_eq!(
            modifications,
            vec![QuerySetModification::Remove {
                query_id: sub1.query_id(),
            }]
        );
    }

    #[test]
    fn test_query_ids_are_not_reused() {
        let mut state = LocalSyncState::new();
        let (sub1, _) = state.subscribe("counter:get".parse().unwrap(), btreemap! {}, None);
        state.unsubscribe(sub1);
        let (sub2, _) = state.subscribe("counter:get".parse().unwrap(), btreemap! {}, None);
        assert_ne!(sub1.query_id(), sub2.query_id());
    }

    #[test]
    fn test_restart_replays_live_queries_with_journals() {
        let mut state = LocalSyncState::new();
        let (sub1, _) = state.subscribe("a:list".parse().unwrap(), btreemap! {}, None);
        let (_sub2, _) = state.subscribe(
            "b:list".parse().unwrap(),
            btreemap! {},
            Some("journal-b".to_owned()),
        );
        state.unsubscribe(sub1);

        let (query_set, auth) = state.restart();
        assert!(auth.is_none());
        let ClientMessage::ModifyQuerySet {
            base_version,
            new_version,
            modifications,
        } = query_set
        else {
            panic!("Expected ModifyQuerySet");
        };
        assert_eq!((base_version, new_version), (0, 1));
        let [QuerySetModification::Add(query)] = &modifications[..] else {
            panic!("Expected a single Add, got {modifications:?}");
        };
        assert_eq!(query.udf_path.to_string(), "b:list");
        assert_eq!(query.journal.as_deref(), Some("journal-b"));
    }

    #[test]
    fn test_auth_versions_advance() {
        let mut state = LocalSyncState::new();
        let message = state.set_auth(riptide_sync_types::AuthenticationToken::User(
            "token1".to_owned(),
        ));
        let ClientMessage::Authenticate { base_version, .. } = message else {
            panic!("Expected Authenticate");
        };
        assert_eq!(base_version, 0);

        let message = state.clear_auth();
        let ClientMessage::Authenticate { base_version, .. } = message else {
            panic!("Expected Authenticate");
        };
        assert_eq!(base_version, 1);
        assert!(!state.has_auth());

        // Restart after clearing auth does not re-present credentials.
        let (_, auth) = state.restart();
        assert!(auth.is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        // Invariant: the set of live tokens always equals the set reachable
        // through query-id introspection, no matter the op order.
        #[test]
        fn proptest_active_tokens_match_introspection(ops in prop::collection::vec((0u8..8, any::<bool>()), 0..64)) {
            let mut state = LocalSyncState::new();
            let mut live = Vec::new();
            for (path_ix, subscribe) in ops {
                if subscribe || live.is_empty() {
                    let path = format!("module{path_ix}:get");
                    let (sub, _) = state.subscribe(path.parse().unwrap(), maplit::btreemap! {}, None);
                    live.push(sub);
                } else {
                    let sub = live.swap_remove(path_ix as usize % live.len());
                    state.unsubscribe(sub);
                }
            }
            let mut from_introspection: Vec<_> = live
                .iter()
                .map(|sub| {
                    state
                        .query_token(sub.query_id())
                        .expect("Live subscriber must have a token")
                        .0
                        .clone()
                })
                .collect();
            from_introspection.sort();
            from_introspection.dedup();
            prop_assert_eq!(from_introspection, subscribed_tokens(&state));
        }
    }
}
