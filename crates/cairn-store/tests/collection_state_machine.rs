//! Stateful property testing for live collection membership.
//!
//! Random sequences of puts and unloads, optionally grouped into one unit
//! of work, must leave the live collection holding exactly the resources the
//! cache still has, each once.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::{Map, Value, json};

use cairn_store::{
    CacheDocument, Collection, RecordFactory, RecordObject, ResourceIdentity, ResourceRef, Store,
    StoreConfig,
};

/// Operations that can be performed against the store.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Put a collection document listing these users.
    Put(Vec<u8>),
    /// Unload one user.
    Unload(u8),
    /// Several puts and unloads inside a single unit of work.
    Batch(Vec<(bool, u8)>),
    /// Read the live collection.
    Read,
}

/// Reference model: the set of user ids currently cached.
#[derive(Clone, Debug, Default)]
pub struct MembershipModel {
    pub loaded: BTreeSet<u8>,
}

impl ReferenceStateMachine for MembershipModel {
    type State = Self;
    type Transition = StoreOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            3 => prop::collection::vec(0u8..12, 1..6).prop_map(StoreOperation::Put),
            2 => (0u8..12).prop_map(StoreOperation::Unload),
            2 => prop::collection::vec((any::<bool>(), 0u8..12), 1..10)
                .prop_map(StoreOperation::Batch),
            1 => Just(StoreOperation::Read),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            StoreOperation::Put(ids) => state.loaded.extend(ids.iter().copied()),
            StoreOperation::Unload(id) => {
                state.loaded.remove(id);
            }
            StoreOperation::Batch(ops) => {
                for (put, id) in ops {
                    if *put {
                        state.loaded.insert(*id);
                    } else {
                        state.loaded.remove(id);
                    }
                }
            }
            StoreOperation::Read => {}
        }
        state
    }

    fn preconditions(_state: &Self::State, _transition: &Self::Transition) -> bool {
        true
    }
}

struct NoopFactory;

impl RecordFactory for NoopFactory {
    fn instantiate_record(
        &self,
        identity: &ResourceIdentity,
        _properties: &Map<String, Value>,
    ) -> RecordObject {
        Arc::new(identity.lid().to_string())
    }

    fn teardown_record(&self, _record: &RecordObject) {}
}

/// Test harness holding a store and its live user collection.
pub struct StoreHarness {
    store: Arc<Store>,
    live: Collection,
}

impl StoreHarness {
    fn new() -> Self {
        let store = Store::builder()
            .config(StoreConfig::builder().collection_batch_size(3).build())
            .record_factory(NoopFactory)
            .build()
            .expect("store should build");
        let live = store.live_array_for("user");
        Self { store, live }
    }

    fn put(&self, ids: &[u8]) {
        let data: Vec<Value> = ids
            .iter()
            .map(|id| json!({"type": "user", "id": id.to_string()}))
            .collect();
        self.store
            .put(CacheDocument {
                identity: None,
                content: json!({ "data": data }),
                is_error: false,
            })
            .expect("put should succeed");
    }

    fn unload(&self, id: u8) {
        if let Some(identity) = self
            .store
            .registry()
            .peek(&ResourceRef::new("user", id.to_string()))
        {
            self.store.unload_record(&identity);
        }
    }

    fn apply_operation(&self, op: &StoreOperation) {
        match op {
            StoreOperation::Put(ids) => self.put(ids),
            StoreOperation::Unload(id) => self.unload(*id),
            StoreOperation::Batch(ops) => self.store.batch(|| {
                for (put, id) in ops {
                    if *put {
                        self.put(&[*id]);
                    } else {
                        self.unload(*id);
                    }
                }
            }),
            StoreOperation::Read => {
                let _ = self.live.len();
            }
        }
    }
}

impl StateMachineTest for StoreHarness {
    type SystemUnderTest = Self;
    type Reference = MembershipModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let items = state.live.items();

        // Invariant: no identity appears twice
        let distinct: BTreeSet<&str> = items.iter().map(|identity| identity.lid()).collect();
        assert_eq!(distinct.len(), items.len());

        // Invariant: membership matches the cached resources
        let ids: BTreeSet<u8> = items
            .iter()
            .filter_map(|identity| identity.id())
            .filter_map(|id| id.parse().ok())
            .collect();
        assert_eq!(ids, ref_state.loaded);

        // Invariant: no stale identity survives a read
        assert!(items.iter().all(|identity| !identity.is_stale()));
        assert!(!state.live.is_dirty());
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn live_collection_state_machine_test(sequential 1..40 => StoreHarness);
}
