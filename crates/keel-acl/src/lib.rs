//! Keel ACL — grant/deny decisions over subject and object hierarchies.
//!
//! The evaluator answers "may `subject` perform `operation` on
//! `object` within `topic`?" by consulting relation and
//! role-operation records in an external document store, then walking
//! the subject's ancestors and the object's ancestors until a
//! definitive answer appears. Decisions can be cached through a
//! pluggable cache; persistence of the records themselves is the
//! store's business, not ours.

pub mod cache;
pub mod error;
pub mod evaluator;
pub mod hierarchy;
pub mod store;
pub mod types;

pub use cache::{DecisionCache, MemoryDecisionCache};
pub use error::AclError;
pub use evaluator::{AclEvaluator, AclEvaluatorBuilder};
pub use hierarchy::{HierarchyProvider, StaticHierarchy};
pub use store::{AclStore, MemAclStore};
pub use types::{AccessArgs, AccessStatus, Relation, Role, RoleOperation};
