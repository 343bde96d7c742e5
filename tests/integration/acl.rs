//! ACL scenarios over subject/object hierarchies.

use std::sync::Arc;

use keel_acl::{
    AccessArgs, AccessStatus, AclEvaluator, MemAclStore, MemoryDecisionCache, Relation,
    RoleOperation, StaticHierarchy,
};

const TOPIC: &str = "t1";

fn grant(store: &MemAclStore, role: &str, operation: &str) {
    store.create_role_operation(
        TOPIC,
        RoleOperation {
            id: format!("{role}/{operation}/grant"),
            role_id: role.into(),
            operation: operation.into(),
            grant: true,
        },
    );
}

fn deny(store: &MemAclStore, role: &str, operation: &str) {
    store.create_role_operation(
        TOPIC,
        RoleOperation {
            id: format!("{role}/{operation}/deny"),
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
            id: format!("{subject}@{object}#{role}"),
            subject: subject.into(),
            object: object.into(),
            role_id: role.into(),
        },
    );
}

#[tokio::test]
async fn grant_via_direct_role() {
    // Role r1 grants op_grant; (s1, o1) related through r1.
    let store = MemAclStore::new();
    grant(&store, "r1", "op_grant");
    relate(&store, "s1", "o1", "r1");

    let evaluator = AclEvaluator::builder(Arc::new(store)).build();
    let status = evaluator
        .check_access(&AccessArgs::new("o1", "s1", "op_grant", TOPIC))
        .await
        .unwrap();
    assert_eq!(status, AccessStatus::Grant);
}

#[tokio::test]
async fn unknown_falls_back_to_subject_parent() {
    // No direct rule for s1; its parent holds the grant.
    let store = MemAclStore::new();
    grant(&store, "r1", "op_grant");
    relate(&store, "s_parent", "o1", "r1");

    let mut subjects = StaticHierarchy::new();
    subjects.add_parent("s1", "s_parent");

    let evaluator = AclEvaluator::builder(Arc::new(store))
        .subject_hierarchy(Arc::new(subjects))
        .build();
    let status = evaluator
        .check_access(&AccessArgs::new("o1", "s1", "op_grant", TOPIC))
        .await
        .unwrap();
    assert_eq!(status, AccessStatus::Grant);
}

#[tokio::test]
async fn deny_on_object_parent() {
    // No rule on o1 itself; the object's parent carries an explicit
    // deny for this subject.
    let store = MemAclStore::new();
    deny(&store, "r_deny", "op_x");
    relate(&store, "s1", "o_parent", "r_deny");

    let mut objects = StaticHierarchy::new();
    objects.add_parent("o1", "o_parent");

    let evaluator = AclEvaluator::builder(Arc::new(store))
        .object_hierarchy(Arc::new(objects))
        .build();
    let status = evaluator
        .check_access(&AccessArgs::new("o1", "s1", "op_x", TOPIC))
        .await
        .unwrap();
    assert_eq!(status, AccessStatus::Deny);
}

#[tokio::test]
async fn subject_and_object_hierarchies_compose() {
    // The grant lives on (s_parent, o_parent): reachable only by
    // ascending both hierarchies.
    let store = MemAclStore::new();
    grant(&store, "r1", "op");
    relate(&store, "s_parent", "o_parent", "r1");

    let mut subjects = StaticHierarchy::new();
    subjects.add_parent("s1", "s_parent");
    let mut objects = StaticHierarchy::new();
    objects.add_parent("o1", "o_parent");

    let evaluator = AclEvaluator::builder(Arc::new(store))
        .subject_hierarchy(Arc::new(subjects))
        .object_hierarchy(Arc::new(objects))
        .build();
    let status = evaluator
        .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
        .await
        .unwrap();
    assert_eq!(status, AccessStatus::Grant);
}

#[tokio::test]
async fn adding_rules_is_monotonic_for_grants() {
    // For a fixed (object, operation, topic): once Grant, adding a
    // grant for the subject's ancestor never turns it into non-Grant.
    let store = Arc::new(MemAclStore::new());
    grant(&store, "r1", "op");
    relate(&store, "s1", "o1", "r1");

    let mut subjects = StaticHierarchy::new();
    subjects.add_parent("s1", "s_parent");

    let evaluator = AclEvaluator::builder(store.clone())
        .subject_hierarchy(Arc::new(subjects))
        .build();
    let args = AccessArgs::new("o1", "s1", "op", TOPIC);

    assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Grant);

    // Grant the ancestor too; the answer must not regress.
    relate(&store, "s_parent", "o1", "r1");
    assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Grant);
}

#[tokio::test]
async fn subject_iteration_visits_all_ancestors_object_iteration_stops() {
    // Asymmetry between the two hierarchies:
    //   - subject side: an ancestor's deny does not stop the scan, a
    //     later ancestor's grant is still found
    //   - object side: a parent's deny is terminal even when a
    //     grandparent would grant
    let store = MemAclStore::new();
    deny(&store, "r_deny", "op");
    grant(&store, "r_grant", "op");

    // Subject side.
    relate(&store, "s_deny", "o1", "r_deny");
    relate(&store, "s_grant", "o1", "r_grant");
    let mut subjects = StaticHierarchy::new();
    subjects.add_parent("s1", "s_deny");
    subjects.add_parent("s1", "s_grant");

    let evaluator = AclEvaluator::builder(Arc::new(store))
        .subject_hierarchy(Arc::new(subjects))
        .build();
    let status = evaluator
        .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
        .await
        .unwrap();
    assert_eq!(status, AccessStatus::Grant);

    // Object side.
    let store = MemAclStore::new();
    deny(&store, "r_deny", "op");
    grant(&store, "r_grant", "op");
    relate(&store, "s1", "o_parent", "r_deny");
    relate(&store, "s1", "o_grandparent", "r_grant");
    let mut objects = StaticHierarchy::new();
    objects.add_parent("o1", "o_parent");
    objects.add_parent("o_parent", "o_grandparent");

    let evaluator = AclEvaluator::builder(Arc::new(store))
        .object_hierarchy(Arc::new(objects))
        .build();
    let status = evaluator
        .check_access(&AccessArgs::new("o1", "s1", "op", TOPIC))
        .await
        .unwrap();
    assert_eq!(status, AccessStatus::Deny);
}

#[tokio::test]
async fn cached_grants_survive_rule_removal_until_cleared() {
    let store = Arc::new(MemAclStore::new());
    grant(&store, "r1", "op");
    relate(&store, "s1", "o1", "r1");

    let cache = Arc::new(MemoryDecisionCache::new(None));
    let evaluator = AclEvaluator::builder(store.clone())
        .cache(cache.clone())
        .build();
    let args = AccessArgs::new("o1", "s1", "op", TOPIC);

    assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Grant);

    // Remove the relation; the cached grant still answers.
    store.remove_relation(TOPIC, "s1@o1#r1");
    assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Grant);

    // Clearing the cache exposes the new truth.
    cache.clear();
    assert_eq!(evaluator.check_access(&args).await.unwrap(), AccessStatus::Deny);
}
