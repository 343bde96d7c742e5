//! ACL record and query types.

use serde::{Deserialize, Serialize};

/// A named role within a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub description: String,
    pub topic: String,
}

/// Whether a role grants or denies one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOperation {
    pub id: String,
    pub role_id: String,
    pub operation: String,
    pub grant: bool,
}

/// Relates a subject to an object via a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub subject: String,
    pub object: String,
    pub role_id: String,
}

/// One access question: (object, subject, operation, topic).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessArgs {
    pub object: String,
    pub subject: String,
    pub operation: String,
    pub topic: String,
}

impl AccessArgs {
    pub fn new(
        object: impl Into<String>,
        subject: impl Into<String>,
        operation: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            object: object.into(),
            subject: subject.into(),
            operation: operation.into(),
            topic: topic.into(),
        }
    }

    /// The same question asked for a different subject (subject
    /// hierarchy ascent).
    pub fn with_subject(&self, subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..self.clone()
        }
    }

    /// The same question asked for a different object (object
    /// hierarchy ascent).
    pub fn with_object(&self, object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            ..self.clone()
        }
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessStatus {
    Grant,
    Deny,
    /// No rule said anything. Internal to the evaluation; the
    /// top-level answer collapses Unknown to Deny.
    Unknown,
}
