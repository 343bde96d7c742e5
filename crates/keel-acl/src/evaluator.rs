//! The access evaluator.
//!
//! Evaluation order for one question:
//!   1. decision cache (a definitive cached answer wins)
//!   2. direct lookup: relations for (subject, object), then the
//!      role-operation reduction — any explicit grant wins, an
//!      explicit deny stands, silence is Unknown
//!   3. subject hierarchy: re-ask for each subject ancestor; a Deny
//!      does NOT stop the iteration (a later ancestor may hold the
//!      grant)
//!   4. object hierarchy: re-ask for each object ancestor; Grant AND
//!      Deny are both terminal here — promoting to a parent object may
//!      introduce an explicit deny
//!   5. nothing answered → Deny
//!
//! Store failures deny: the evaluator never upgrades on infrastructure
//! error. Hierarchies guarantee neither acyclicity nor finiteness, so
//! recursion carries a depth bound.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cache::DecisionCache;
use crate::error::AclError;
use crate::hierarchy::HierarchyProvider;
use crate::store::AclStore;
use crate::types::{AccessArgs, AccessStatus};

/// Hierarchy recursion bound.
const MAX_DEPTH: u32 = 64;

pub struct AclEvaluator {
    store: Arc<dyn AclStore>,
    subject_hierarchy: Option<Arc<dyn HierarchyProvider>>,
    object_hierarchy: Option<Arc<dyn HierarchyProvider>>,
    cache: Option<Arc<dyn DecisionCache>>,
    cache_negative: bool,
    max_depth: u32,
}

pub struct AclEvaluatorBuilder {
    inner: AclEvaluator,
}

impl AclEvaluatorBuilder {
    pub fn new(store: Arc<dyn AclStore>) -> Self {
        Self {
            inner: AclEvaluator {
                store,
                subject_hierarchy: None,
                object_hierarchy: None,
                cache: None,
                cache_negative: false,
                max_depth: MAX_DEPTH,
            },
        }
    }

    pub fn subject_hierarchy(mut self, provider: Arc<dyn HierarchyProvider>) -> Self {
        self.inner.subject_hierarchy = Some(provider);
        self
    }

    pub fn object_hierarchy(mut self, provider: Arc<dyn HierarchyProvider>) -> Self {
        self.inner.object_hierarchy = Some(provider);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn DecisionCache>) -> Self {
        self.inner.cache = Some(cache);
        self
    }

    /// Also cache Deny outcomes. Off by default: a cached negative can
    /// shadow a rule edit until it expires.
    pub fn cache_negative(mut self, enable: bool) -> Self {
        self.inner.cache_negative = enable;
        self
    }

    pub fn max_depth(mut self, depth: u32) -> Self {
        self.inner.max_depth = depth;
        self
    }

    pub fn build(self) -> AclEvaluator {
        self.inner
    }
}

impl AclEvaluator {
    pub fn builder(store: Arc<dyn AclStore>) -> AclEvaluatorBuilder {
        AclEvaluatorBuilder::new(store)
    }

    /// Decide Grant or Deny for one question. `Err` means Deny with
    /// the failure attached.
    pub async fn check_access(&self, args: &AccessArgs) -> Result<AccessStatus, AclError> {
        let status = self.check(args.clone(), args, 0).await?;
        tracing::debug!(
            object = %args.object,
            subject = %args.subject,
            operation = %args.operation,
            topic = %args.topic,
            ?status,
            "access decision"
        );
        Ok(status)
    }

    fn check<'a>(
        &'a self,
        args: AccessArgs,
        initial: &'a AccessArgs,
        depth: u32,
    ) -> BoxFuture<'a, Result<AccessStatus, AclError>> {
        Box::pin(async move {
            if depth > self.max_depth {
                return Err(AclError::DepthExceeded(self.max_depth));
            }
            if let Some(cache) = &self.cache {
                match cache.find(&args, initial).await {
                    Some(AccessStatus::Grant) => return Ok(AccessStatus::Grant),
                    Some(AccessStatus::Deny) => return Ok(AccessStatus::Deny),
                    // A cached Unknown falls through to the store.
                    _ => {}
                }
            }
            self.find(args, initial, depth).await
        })
    }

    /// Direct lookup, then hierarchy fallthrough.
    async fn find(
        &self,
        args: AccessArgs,
        initial: &AccessArgs,
        depth: u32,
    ) -> Result<AccessStatus, AclError> {
        let relations = self
            .store
            .find_relations(&args.subject, &args.object, &args.topic)
            .await?;

        let mut status = AccessStatus::Unknown;
        if !relations.is_empty() {
            let role_ids: Vec<String> =
                relations.iter().map(|r| r.role_id.clone()).collect();
            let role_operations = self
                .store
                .find_role_operations(&role_ids, &args.operation, &args.topic)
                .await?;
            for role_operation in &role_operations {
                if role_operation.grant {
                    status = AccessStatus::Grant;
                    break;
                }
                status = AccessStatus::Deny;
            }
            if status == AccessStatus::Grant {
                if let Some(cache) = &self.cache {
                    cache.set(&args, initial, AccessStatus::Grant).await;
                }
                return Ok(AccessStatus::Grant);
            }
        }

        let result = self
            .iterate_subject_hierarchy(&args, initial, status, depth)
            .await;
        if self.cache_negative {
            if let (Ok(AccessStatus::Deny), Some(cache)) = (&result, &self.cache) {
                cache.set(&args, initial, AccessStatus::Deny).await;
            }
        }
        result
    }

    /// Re-ask for each subject ancestor. Grant and errors are
    /// terminal; Deny is not — the iteration continues.
    async fn iterate_subject_hierarchy(
        &self,
        args: &AccessArgs,
        initial: &AccessArgs,
        prev_status: AccessStatus,
        depth: u32,
    ) -> Result<AccessStatus, AclError> {
        if let Some(hierarchy) = &self.subject_hierarchy {
            let parents = hierarchy.parents_of(&args.subject).await?;
            for parent in parents {
                let next = args.with_subject(parent);
                match self.check(next, initial, depth + 1).await? {
                    AccessStatus::Grant => return Ok(AccessStatus::Grant),
                    _ => continue,
                }
            }
        }
        self.iterate_object_hierarchy(args, initial, prev_status, depth)
            .await
    }

    /// Re-ask for each object ancestor. Grant AND Deny are terminal.
    async fn iterate_object_hierarchy(
        &self,
        args: &AccessArgs,
        initial: &AccessArgs,
        prev_status: AccessStatus,
        depth: u32,
    ) -> Result<AccessStatus, AclError> {
        let hierarchy = match &self.object_hierarchy {
            Some(hierarchy) if prev_status != AccessStatus::Deny => hierarchy,
            _ => return Ok(AccessStatus::Deny),
        };
        let parents = hierarchy.parents_of(&args.object).await?;
        for parent in parents {
            let next = args.with_object(parent);
            match self.check(next, initial, depth + 1).await? {
                AccessStatus::Grant => return Ok(AccessStatus::Grant),
                AccessStatus::Deny => return Ok(AccessStatus::Deny),
                AccessStatus::Unknown => continue,
            }
        }
        Ok(AccessStatus::Deny)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryDecisionCache;
    use crate::hierarchy::StaticHierarchy;
    use crate::store::MemAclStore;
    use crate::types::{Relation, RoleOperation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "t1";

    fn grant_role(store: &MemAclStore, role: &str, operation: &str) {
        store.create_role_operation(
            TOPIC,
            RoleOperation {
                id: format!("{role}-{operation}"),
                role_id: role.into(),
                operation: operation.into(),
                grant: true,
            },
        );
    }

    fn deny_role(store: &MemAclStore, role: &str, operation: &str) {
        store.create_role_operation(
            TOPIC,
            RoleOperation {
                id: format!("{role}-{operation}-deny"),
                role_id: role.into(),
                operation: operation.into(),
                grant: false,
            },
        );
    }

    fn relate(store: &MemAclStore, subject: &str, object: &str, role: &str) {
        store.create_relation(
            TOPIC,
            Relation {
                id: format!("{subject}:{object}:{role}"),
                subject: subject.into(),
                object: object.into(),
                role_id: role.into(),
            },
        );
    }

    /// Counts store queries so tests can observe cache hits.
    struct CountingStore {
        inner: MemAclStore,
        relation_queries: AtomicUsize,
    }

    #[async_trait]
    impl AclStore for CountingStore {
        async fn find_relations(
            &self,
            subject: &str,
            object: &str,
            topic: &str,
        ) -> Result<Vec<Relation>, AclError> {
            self.relation_queries.fetch_add(1, Ordering::Relaxed);
            self.inner.find_relations(subject, object, topic).await
        }

        async fn find_role_operations(
            &self,
            role_ids: &[String],
            operation: &str,
            topic: &str,
        ) -> Result<Vec<RoleOperation>, AclError> {
            self.inner
                .find_role_operations(role_ids, operation, topic)
                .await
        }
    }

    /// A store whose queries always fail.
    struct BrokenStore;

    #[async_trait]
    impl AclStore for BrokenStore {
        async fn find_relations(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Vec<Relation>, AclError> {
            Err(AclError::Store("backend down".into()))
        }

        async fn find_role_operations(
            &self,
            _: &[String],
            _: &str,
            _: &str,
        ) -> Result<Vec<RoleOperation>, AclError> {
            Err(AclError::Store("backend down".into()))
        }
    }

    #[tokio::test]
    async fn direct_grant_via_role() {
        let store = MemAclStore::new();
        grant_role(&store, "r1", "op_grant");
        relate(&store, "s1", "o1", "r1");

        let evaluator = AclEvaluator::builder(Arc::new(store)).build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op_grant", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Grant);
    }

    #[tokio::test]
    async fn no_rule_is_deny() {
        let store = MemAclStore::new();
        let evaluator = AclEvaluator::builder(Arc::new(store)).build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Deny);
    }

    #[tokio::test]
    async fn grant_wins_over_deny_within_roles() {
        let store = MemAclStore::new();
        deny_role(&store, "r_deny", "op");
        grant_role(&store, "r_grant", "op");
        relate(&store, "s1", "o1", "r_deny");
        relate(&store, "s1", "o1", "r_grant");

        let evaluator = AclEvaluator::builder(Arc::new(store)).build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Grant);
    }

    #[tokio::test]
    async fn grant_via_subject_parent() {
        let store = MemAclStore::new();
        grant_role(&store, "r1", "op_grant");
        relate(&store, "s_parent", "o1", "r1");

        let mut hierarchy = StaticHierarchy::new();
        hierarchy.add_parent("s1", "s_parent");

        let evaluator = AclEvaluator::builder(Arc::new(store))
            .subject_hierarchy(Arc::new(hierarchy))
            .build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op_grant", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Grant);
    }

    #[tokio::test]
    async fn subject_iteration_continues_past_deny() {
        let store = MemAclStore::new();
        // First ancestor denies, second grants. The grant must be
        // found: subject iteration does not stop on Deny.
        deny_role(&store, "r_deny", "op");
        grant_role(&store, "r_grant", "op");
        relate(&store, "s_first", "o1", "r_deny");
        relate(&store, "s_second", "o1", "r_grant");

        let mut hierarchy = StaticHierarchy::new();
        hierarchy.add_parent("s1", "s_first");
        hierarchy.add_parent("s1", "s_second");

        let evaluator = AclEvaluator::builder(Arc::new(store))
            .subject_hierarchy(Arc::new(hierarchy))
            .build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Grant);
    }

    #[tokio::test]
    async fn deny_on_object_parent_is_terminal() {
        let store = MemAclStore::new();
        // Scenario: no direct rule on o1; the object parent carries an
        // explicit deny AND a further grandparent carries a grant. The
        // deny must win: object iteration stops on Deny.
        deny_role(&store, "r_deny", "op_x");
        grant_role(&store, "r_grant", "op_x");
        relate(&store, "s1", "o_parent", "r_deny");
        relate(&store, "s1", "o_grandparent", "r_grant");

        let mut hierarchy = StaticHierarchy::new();
        hierarchy.add_parent("o1", "o_parent");
        hierarchy.add_parent("o_parent", "o_grandparent");

        let evaluator = AclEvaluator::builder(Arc::new(store))
            .object_hierarchy(Arc::new(hierarchy))
            .build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op_x", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Deny);
    }

    #[tokio::test]
    async fn grant_via_object_parent() {
        let store = MemAclStore::new();
        grant_role(&store, "r1", "op");
        relate(&store, "s1", "o_parent", "r1");

        let mut hierarchy = StaticHierarchy::new();
        hierarchy.add_parent("o1", "o_parent");

        let evaluator = AclEvaluator::builder(Arc::new(store))
            .object_hierarchy(Arc::new(hierarchy))
            .build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Grant);
    }

    #[tokio::test]
    async fn direct_deny_skips_object_hierarchy() {
        let store = MemAclStore::new();
        deny_role(&store, "r_deny", "op");
        grant_role(&store, "r_grant", "op");
        relate(&store, "s1", "o1", "r_deny");
        relate(&store, "s1", "o_parent", "r_grant");

        let mut hierarchy = StaticHierarchy::new();
        hierarchy.add_parent("o1", "o_parent");

        let evaluator = AclEvaluator::builder(Arc::new(store))
            .object_hierarchy(Arc::new(hierarchy))
            .build();
        // The direct explicit deny stands; the object parent's grant
        // is never consulted.
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Deny);
    }

    #[tokio::test]
    async fn store_error_denies_with_cause() {
        let evaluator = AclEvaluator::builder(Arc::new(BrokenStore)).build();
        let result = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
            .await;
        assert!(matches!(result, Err(AclError::Store(_))));
    }

    #[tokio::test]
    async fn grant_is_cached_and_reused() {
        let store = CountingStore {
            inner: MemAclStore::new(),
            relation_queries: AtomicUsize::new(0),
        };
        grant_role(&store.inner, "r1", "op");
        relate(&store.inner, "s1", "o1", "r1");
        let store = Arc::new(store);
        let cache = Arc::new(MemoryDecisionCache::new(None));

        let evaluator = AclEvaluator::builder(store.clone())
            .cache(cache.clone())
            .build();
        let args = AccessArgs::new("o1", "s1", "op", TOPIC);

        assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Grant);
        let after_first = store.relation_queries.load(Ordering::Relaxed);
        assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Grant);
        // Second answer came from the cache, not the store.
        assert_eq!(store.relation_queries.load(Ordering::Relaxed), after_first);
    }

    #[tokio::test]
    async fn deny_is_not_cached_by_default() {
        let store = CountingStore {
            inner: MemAclStore::new(),
            relation_queries: AtomicUsize::new(0),
        };
        let store = Arc::new(store);
        let cache = Arc::new(MemoryDecisionCache::new(None));

        let evaluator = AclEvaluator::builder(store.clone())
            .cache(cache.clone())
            .build();
        let args = AccessArgs::new("o1", "s1", "op", TOPIC);

        assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Deny);
        assert!(cache.is_empty());
        let after_first = store.relation_queries.load(Ordering::Relaxed);
        let _ = evaluator.check_access(&args).await.unwrap();
        // The store was asked again.
        assert!(store.relation_queries.load(Ordering::Relaxed) > after_first);
    }

    #[tokio::test]
    async fn negative_caching_behind_the_knob() {
        let store = CountingStore {
            inner: MemAclStore::new(),
            relation_queries: AtomicUsize::new(0),
        };
        let store = Arc::new(store);
        let cache = Arc::new(MemoryDecisionCache::new(None));

        let evaluator = AclEvaluator::builder(store.clone())
            .cache(cache.clone())
            .cache_negative(true)
            .build();
        let args = AccessArgs::new("o1", "s1", "op", TOPIC);

        assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Deny);
        assert!(!cache.is_empty());
        let after_first = store.relation_queries.load(Ordering::Relaxed);
        assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Deny);
        assert_eq!(store.relation_queries.load(Ordering::Relaxed), after_first);
    }

    #[tokio::test]
    async fn cyclic_hierarchy_terminates() {
        let store = MemAclStore::new();
        let mut hierarchy = StaticHierarchy::new();
        hierarchy.add_parent("s1", "s2");
        hierarchy.add_parent("s2", "s1");

        let evaluator = AclEvaluator::builder(Arc::new(store))
            .subject_hierarchy(Arc::new(hierarchy))
            .max_depth(16)
            .build();
        let result = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
            .await;
        assert!(matches!(result, Err(AclError::DepthExceeded(16))));
    }

    #[tokio::test]
    async fn adding_an_ancestor_grant_never_revokes() {
        // Monotonicity: s1 already granted directly; granting the same
        // operation to an ancestor must not flip the answer.
        let store = MemAclStore::new();
        grant_role(&store, "r1", "op");
        relate(&store, "s1", "o1", "r1");
        relate(&store, "s_parent", "o1", "r1");

        let mut hierarchy = StaticHierarchy::new();
        hierarchy.add_parent("s1", "s_parent");

        let evaluator = AclEvaluator::builder(Arc::new(store))
            .subject_hierarchy(Arc::new(hierarchy))
            .build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Grant);
    }

    #[tokio::test]
    async fn topics_partition_rules() {
        let store = MemAclStore::new();
        grant_role(&store, "r1", "op");
        relate(&store, "s1", "o1", "r1");

        let evaluator = AclEvaluator::builder(Arc::new(store)).build();
        let status = evaluator
            .check_access(&AccessArgs::new("o1", "s1", "op", "other-topic"))
            .await
            .unwrap();
        assert_eq!(status, AccessStatus::Deny);
    }
}
