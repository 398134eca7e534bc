//! Tracing garbage collection over the request graph.
//!
//! Roots are retained documents and materialized records the UI still holds.
//! Everything else flagged as a candidate is removed unless a non-candidate
//! reaches it through an edge created by a local mutation. Edges that came
//! from payloads, and implicit inverse edges, never keep anything alive.
//!
//! A resource kept through a mutation edge is only attached to its owner's
//! documents. When the owner has none, it is re-examined on every pass, so it
//! is collected once the edge or the owner goes away.

use std::collections::VecDeque;

use indexmap::IndexSet;
use tracing::{debug, info};

use crate::cache::EdgeOrigin;
use crate::identity::ResourceIdentity;
use crate::materialize::MaterializedObjects;

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Candidates examined.
    pub examined: usize,
    /// Candidates kept through a mutation edge.
    pub kept: Vec<ResourceIdentity>,
    /// Identities unloaded and forgotten.
    pub removed: Vec<ResourceIdentity>,
}

impl MaterializedObjects {
    /// Run one full pass and remove everything unreachable.
    #[tracing::instrument(skip(self))]
    pub fn collect_garbage(&self) -> GcReport {
        let (mut candidates, frontier) = {
            let mut state = self.state.lock();
            state.requeue_kept();
            let mut candidates = IndexSet::new();
            let mut frontier = VecDeque::new();
            for (identity, entry) in &state.entries {
                if entry.candidate {
                    candidates.insert(identity.clone());
                } else {
                    frontier.push_back(identity.clone());
                }
            }
            (candidates, frontier)
        };

        let examined = candidates.len();
        if examined == 0 {
            return GcReport::default();
        }

        let kept = self.promote(&mut candidates, frontier);
        let removed: Vec<ResourceIdentity> = candidates.into_iter().collect();

        // Resources kept only through a removed owner lose that hold
        let orphaned: IndexSet<ResourceIdentity> = removed
            .iter()
            .flat_map(|identity| self.cache.relationships(identity))
            .filter(|edge| edge.origin == EdgeOrigin::Mutation && !removed.contains(&edge.target))
            .map(|edge| edge.target)
            .collect();

        self.scope.join(|| {
            for identity in &removed {
                self.teardown(identity);
                self.cache.unload_record(identity);
                self.disconnect(identity);
            }
        });

        if !orphaned.is_empty() {
            let mut state = self.state.lock();
            for identity in &orphaned {
                if state.entries.contains_key(identity) {
                    state.mark_if_unheld(identity);
                }
            }
        }

        if !removed.is_empty() {
            info!(
                examined,
                kept = kept.len(),
                removed = removed.len(),
                "garbage collected"
            );
        }

        GcReport {
            examined,
            kept,
            removed,
        }
    }

    /// Walk mutation edges out of the frontier until nothing new is kept.
    ///
    /// Kept candidates join the frontier and are attached to the documents
    /// of the resource that reached them.
    fn promote(
        &self,
        candidates: &mut IndexSet<ResourceIdentity>,
        mut frontier: VecDeque<ResourceIdentity>,
    ) -> Vec<ResourceIdentity> {
        let mut kept = Vec::new();

        while let Some(owner) = frontier.pop_front() {
            if candidates.is_empty() {
                break;
            }
            for edge in self.cache.relationships(&owner) {
                if edge.origin != EdgeOrigin::Mutation || !candidates.contains(&edge.target) {
                    continue;
                }
                candidates.shift_remove(&edge.target);

                {
                    let mut state = self.state.lock();
                    let documents = state.membership.get(&owner).cloned().unwrap_or_default();
                    for document in &documents {
                        state.attach(document, &edge.target);
                    }
                    if let Some(entry) = state.entries.get_mut(&edge.target) {
                        entry.candidate = false;
                        entry.kept = true;
                    }
                }

                debug!(owner = %owner, kept = %edge.target, field = %edge.field, "kept through mutation edge");
                kept.push(edge.target.clone());
                frontier.push_back(edge.target);
            }
        }

        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Mutation;
    use crate::identity::{Identifier, ResourceRef};
    use crate::materialize::tests::{fixture, load, user};
    use serde_json::json;

    #[test]
    fn test_nothing_to_collect() {
        let f = fixture();
        load(&f, "/users", json!([{"type": "user", "id": "1"}]));
        assert_eq!(f.objects.collect_garbage(), GcReport::default());
    }

    #[test]
    fn test_never_materialized_unrooted_resources_are_removed() {
        let f = fixture();
        let stray = user(&f, "1");
        f.scope
            .run(|| f.cache.upsert(&stray, json!({"attributes": {}}), false));

        let report = f.objects.collect_garbage();
        assert_eq!(report.examined, 1);
        assert_eq!(report.removed, vec![stray.clone()]);
        assert!(f.cache.is_empty(&stray));
        assert!(!f.registry.is_registered(&Identifier::Resource(stray)));
    }

    #[test]
    fn test_held_records_survive() {
        let f = fixture();
        let held = user(&f, "1");
        f.scope
            .run(|| f.cache.upsert(&held, json!({"attributes": {}}), false));
        f.objects.get_record(&held, None);

        let report = f.objects.collect_garbage();
        assert_eq!(report.examined, 0);
        assert!(!f.cache.is_empty(&held));
    }

    #[test]
    fn test_remote_edges_do_not_retain() {
        let f = fixture();
        let (posts, _) = load(
            &f,
            "/posts",
            json!([{"type": "post", "id": "1",
                    "relationships": {"author": {"data": {"type": "user", "id": "1"}}}}]),
        );
        let (authors, _) = load(&f, "/authors", json!([{"type": "user", "id": "1"}]));
        let post = f.registry.peek(&ResourceRef::new("post", "1")).unwrap();
        let author = user(&f, "1");
        f.objects.get_record(&post, None);

        f.objects.release_document(&posts);
        f.objects.release_document(&authors);
        let report = f.objects.collect_garbage();

        assert_eq!(report.removed, vec![author]);
        assert!(report.kept.is_empty());
    }

    #[test]
    fn test_mutation_edges_chain_to_fixed_point() {
        let f = fixture();
        let (root, _) = load(&f, "/users/1", json!({"type": "user", "id": "1"}));
        let (others, _) = load(
            &f,
            "/others",
            json!([{"type": "user", "id": "2"}, {"type": "user", "id": "3"}]),
        );
        let (one, two, three) = (user(&f, "1"), user(&f, "2"), user(&f, "3"));

        f.scope.run(|| {
            f.cache.mutate(Mutation::AddToRelationship {
                record: one.clone(),
                field: "friends".into(),
                value: vec![two.clone()],
                index: None,
            });
            f.cache.mutate(Mutation::AddToRelationship {
                record: two.clone(),
                field: "friends".into(),
                value: vec![three.clone()],
                index: None,
            });
        });
        f.objects.release_document(&others);

        let report = f.objects.collect_garbage();
        assert_eq!(report.kept, vec![two.clone(), three.clone()]);
        assert!(report.removed.is_empty());

        // Kept resources now belong to the root document
        f.objects.release_document(&root);
        let report = f.objects.collect_garbage();
        assert_eq!(report.removed.len(), 3);
    }

    #[test]
    fn test_kept_resource_is_collected_with_its_owner() {
        let f = fixture();
        let (owners, _) = load(&f, "/owners", json!([{"type": "user", "id": "1"}]));
        let (others, _) = load(&f, "/others", json!([{"type": "user", "id": "2"}]));
        let (one, two) = (user(&f, "1"), user(&f, "2"));
        f.objects.get_record(&one, None);
        f.scope.run(|| {
            f.cache.mutate(Mutation::ReplaceRelatedRecord {
                record: one.clone(),
                field: "best_friend".into(),
                value: Some(two.clone()),
            });
        });

        f.objects.release_document(&owners);
        f.objects.release_document(&others);
        assert_eq!(f.objects.collect_garbage().kept, vec![two.clone()]);

        // Still reachable: kept again on the next pass
        let report = f.objects.collect_garbage();
        assert_eq!(report.kept, vec![two.clone()]);
        assert!(report.removed.is_empty());

        f.objects.release_record(&one);
        let mut removed = f.objects.collect_garbage().removed;
        removed.sort_by(|a, b| a.lid().cmp(b.lid()));
        let mut expected = vec![one, two.clone()];
        expected.sort_by(|a, b| a.lid().cmp(b.lid()));
        assert_eq!(removed, expected);
        assert!(f.cache.is_empty(&two));
    }

    #[test]
    fn test_removed_edge_releases_kept_resource() {
        let f = fixture();
        let (owner, stray) = (user(&f, "1"), user(&f, "2"));
        f.scope.run(|| {
            f.cache.upsert(&owner, json!({"attributes": {}}), false);
            f.cache.upsert(&stray, json!({"attributes": {}}), false);
        });
        f.objects.get_record(&owner, None);
        f.scope.run(|| {
            f.cache.mutate(Mutation::AddToRelationship {
                record: owner.clone(),
                field: "friends".into(),
                value: vec![stray.clone()],
                index: None,
            });
        });
        assert_eq!(f.objects.collect_garbage().kept, vec![stray.clone()]);

        f.scope.run(|| {
            f.cache.mutate(Mutation::RemoveFromRelationship {
                record: owner.clone(),
                field: "friends".into(),
                value: vec![stray.clone()],
            });
        });
        let report = f.objects.collect_garbage();

        assert_eq!(report.examined, 1);
        assert_eq!(report.removed, vec![stray.clone()]);
        assert!(f.cache.is_empty(&stray));
        assert!(!f.cache.is_empty(&owner));
    }
}
