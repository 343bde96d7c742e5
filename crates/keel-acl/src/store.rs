//! The document-store contract the evaluator queries.
//!
//! The real store is external (an async indexed KV store); this trait
//! captures the two queries the evaluator issues, each scoped by
//! topic. [`MemAclStore`] is an in-memory implementation used by tests
//! and small deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::AclError;
use crate::types::{Relation, Role, RoleOperation};

#[async_trait]
pub trait AclStore: Send + Sync {
    /// Relations matching (subject == .. AND object == ..) in a topic.
    async fn find_relations(
        &self,
        subject: &str,
        object: &str,
        topic: &str,
    ) -> Result<Vec<Relation>, AclError>;

    /// Role-operations matching (role IN role_ids AND operation == ..)
    /// in a topic.
    async fn find_role_operations(
        &self,
        role_ids: &[String],
        operation: &str,
        topic: &str,
    ) -> Result<Vec<RoleOperation>, AclError>;
}

/// In-memory store keyed by topic.
#[derive(Default)]
pub struct MemAclStore {
    roles: DashMap<String, Vec<Role>>,
    relations: DashMap<String, Vec<Relation>>,
    role_operations: DashMap<String, Vec<RoleOperation>>,
}

impl MemAclStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_role(&self, topic: &str, role: Role) {
        self.roles.entry(topic.to_string()).or_default().push(role);
    }

    pub fn create_relation(&self, topic: &str, relation: Relation) {
        self.relations
            .entry(topic.to_string())
            .or_default()
            .push(relation);
    }

    pub fn create_role_operation(&self, topic: &str, role_operation: RoleOperation) {
        self.role_operations
            .entry(topic.to_string())
            .or_default()
            .push(role_operation);
    }

    pub fn remove_relation(&self, topic: &str, relation_id: &str) {
        if let Some(mut relations) = self.relations.get_mut(topic) {
            relations.retain(|r| r.id != relation_id);
        }
    }

    /// Roles defined in a topic. Management surface, not consulted by
    /// the evaluator (decisions go through relations and
    /// role-operations).
    pub fn find_roles(&self, topic: &str) -> Vec<Role> {
        self.roles
            .get(topic)
            .map(|roles| roles.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AclStore for MemAclStore {
    async fn find_relations(
        &self,
        subject: &str,
        object: &str,
        topic: &str,
    ) -> Result<Vec<Relation>, AclError> {
        Ok(self
            .relations
            .get(topic)
            .map(|relations| {
                relations
                    .iter()
                    .filter(|r| r.subject == subject && r.object == object)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_role_operations(
        &self,
        role_ids: &[String],
        operation: &str,
        topic: &str,
    ) -> Result<Vec<RoleOperation>, AclError> {
        Ok(self
            .role_operations
            .get(topic)
            .map(|role_operations| {
                role_operations
                    .iter()
                    .filter(|ro| ro.operation == operation && role_ids.contains(&ro.role_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
