//! Subject/object hierarchy providers.
//!
//! A provider yields the parents of an id, one generation at a time.
//! Nothing guarantees acyclicity or finiteness — the evaluator
//! carries its own visited set and depth bound.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::AclError;

#[async_trait]
pub trait HierarchyProvider: Send + Sync {
    /// Direct parents of `id`, in iteration order.
    async fn parents_of(&self, id: &str) -> Result<Vec<String>, AclError>;
}

/// A fixed parent map.
#[derive(Default)]
pub struct StaticHierarchy {
    parents: HashMap<String, Vec<String>>,
}

impl StaticHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parent(&mut self, child: impl Into<String>, parent: impl Into<String>) {
        self.parents
            .entry(child.into())
            .or_default()
            .push(parent.into());
    }
}

#[async_trait]
impl HierarchyProvider for StaticHierarchy {
    async fn parents_of(&self, id: &str) -> Result<Vec<String>, AclError> {
        Ok(self.parents.get(id).cloned().unwrap_or_default())
    }
}
