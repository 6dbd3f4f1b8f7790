use super::{Path, Tree, Value};
use crate::encoding;
use crate::error::{Error, Result};
use crate::raft::Index;

use serde::{Deserialize, Serialize};

/// A write operation on the node at a path. Operations are total: they never
/// fail, whatever the current node value is, so a transaction whose
/// preconditions hold always applies in full.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Sets the node to the value.
    Set(Value),
    /// Deletes the node and its subtree.
    Delete,
    /// Adds a number to the node. A missing or non-numeric node counts as 0.
    Increment(Value),
    /// Subtracts a number from the node. A missing or non-numeric node counts
    /// as 0.
    Decrement(Value),
    /// Appends a value to an array. A non-array node becomes [value].
    Push(Value),
    /// Prepends a value to an array. A non-array node becomes [value].
    Prepend(Value),
    /// Removes the last array element. A non-array node becomes [].
    Pop,
    /// Removes the first array element. A non-array node becomes [].
    Shift,
    /// Removes all array elements equal to the value. A non-array node
    /// becomes [], and a missing node stays missing.
    Erase(Value),
    /// Removes the array element at the position, if any. A non-array node
    /// becomes [], and a missing node stays missing.
    EraseAt(usize),
    /// Replaces all array elements equal to the first value with the second.
    /// A non-array node becomes [], and a missing node stays missing.
    Replace(Value, Value),
}

impl Operation {
    /// Applies the operation to the node at the path.
    pub fn apply(&self, tree: &mut Tree, path: &Path) {
        match self {
            Self::Set(value) => tree.set(path, value.clone()),
            Self::Delete => {
                tree.delete(path);
            }
            Self::Increment(by) => tree.update(path, |v| v.unwrap_or_default().add(by)),
            Self::Decrement(by) => tree.update(path, |v| v.unwrap_or_default().add(&by.negate())),
            Self::Push(value) => Self::update_array(tree, path, |a| a.push(value.clone())),
            Self::Prepend(value) => {
                Self::update_array(tree, path, |a| a.insert(0, value.clone()))
            }
            Self::Pop => Self::update_array(tree, path, |a| {
                a.pop();
            }),
            Self::Shift => Self::update_array(tree, path, |a| {
                if !a.is_empty() {
                    a.remove(0);
                }
            }),
            Self::Erase(value) => Self::update_existing_array(tree, path, |a| {
                a.retain(|v| v != value);
            }),
            Self::EraseAt(position) => Self::update_existing_array(tree, path, |a| {
                if *position < a.len() {
                    a.remove(*position);
                }
            }),
            Self::Replace(old, new) => Self::update_existing_array(tree, path, |a| {
                for v in a.iter_mut().filter(|v| *v == old) {
                    *v = new.clone();
                }
            }),
        }
    }

    /// Updates an array node. A non-array node is replaced by an empty array,
    /// and the update is then applied to it.
    fn update_array(tree: &mut Tree, path: &Path, f: impl FnOnce(&mut Vec<Value>)) {
        tree.update(path, |value| {
            let mut array = match value {
                Some(Value::Array(array)) => array,
                _ => Vec::new(),
            };
            f(&mut array);
            Value::Array(array)
        })
    }

    /// Like update_array, but leaves a missing node missing.
    fn update_existing_array(tree: &mut Tree, path: &Path, f: impl FnOnce(&mut Vec<Value>)) {
        if tree.exists(path) {
            Self::update_array(tree, path, f)
        }
    }
}

/// A transaction precondition on the node at a path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    /// The node equals the value. Objects compare regardless of key order,
    /// and integers equal floats holding the same number.
    Equals(Value),
    /// The node exists.
    Exists,
    /// The node doesn't exist.
    Missing,
    /// The node is an array (true) or is not an array (false). A missing node
    /// is not an array.
    IsArray(bool),
    /// The node is an array containing the value.
    Contains(Value),
    /// The node is not an array containing the value.
    NotContains(Value),
    /// The node is an array sharing no element with the values.
    IntersectionEmpty(Vec<Value>),
}

impl Precondition {
    /// Checks the precondition against the node's current value.
    pub fn check(&self, current: Option<&Value>) -> bool {
        match (self, current) {
            (Self::Equals(expect), Some(value)) => value == expect,
            (Self::Equals(_), None) => false,
            (Self::Exists, current) => current.is_some(),
            (Self::Missing, current) => current.is_none(),
            (Self::IsArray(expect), current) => current.is_some_and(Value::is_array) == *expect,
            (Self::Contains(expect), Some(Value::Array(array))) => array.contains(expect),
            (Self::Contains(_), _) => false,
            (Self::NotContains(expect), Some(Value::Array(array))) => !array.contains(expect),
            (Self::NotContains(_), _) => true,
            (Self::IntersectionEmpty(values), Some(Value::Array(array))) => {
                !array.iter().any(|v| values.contains(v))
            }
            (Self::IntersectionEmpty(_), _) => false,
        }
    }
}

/// A client tag, which identifies a logical write for deduplication. Clients
/// must use increasing sequence numbers, and retry a write with the same tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTag {
    pub id: String,
    pub seq: u64,
}

/// An atomic transaction. If any precondition fails, no operation takes
/// effect. Otherwise the operations are applied in order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub operations: Vec<(Path, Operation)>,
    pub preconditions: Vec<(Path, Precondition)>,
    pub client: Option<ClientTag>,
}

impl encoding::Value for Transaction {}

impl Transaction {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags the transaction with a client ID and sequence number.
    pub fn client(mut self, id: impl Into<String>, seq: u64) -> Self {
        self.client = Some(ClientTag { id: id.into(), seq });
        self
    }

    /// Adds an operation.
    pub fn operation(mut self, path: impl Into<Path>, operation: Operation) -> Self {
        self.operations.push((path.into(), operation));
        self
    }

    /// Adds a precondition.
    pub fn precondition(mut self, path: impl Into<Path>, precondition: Precondition) -> Self {
        self.preconditions.push((path.into(), precondition));
        self
    }

    pub fn set(self, path: impl Into<Path>, value: impl Into<Value>) -> Self {
        self.operation(path, Operation::Set(value.into()))
    }

    pub fn delete(self, path: impl Into<Path>) -> Self {
        self.operation(path, Operation::Delete)
    }

    pub fn increment(self, path: impl Into<Path>, by: impl Into<Value>) -> Self {
        self.operation(path, Operation::Increment(by.into()))
    }

    pub fn push(self, path: impl Into<Path>, value: impl Into<Value>) -> Self {
        self.operation(path, Operation::Push(value.into()))
    }

    pub fn equals(self, path: impl Into<Path>, value: impl Into<Value>) -> Self {
        self.precondition(path, Precondition::Equals(value.into()))
    }

    pub fn exists(self, path: impl Into<Path>) -> Self {
        self.precondition(path, Precondition::Exists)
    }

    pub fn missing(self, path: impl Into<Path>) -> Self {
        self.precondition(path, Precondition::Missing)
    }

    /// Applies the transaction at the given log index. Preconditions are all
    /// checked before any operation runs, and operations can't fail, so the
    /// tree is either fully updated or untouched.
    pub fn apply(&self, tree: &mut Tree, index: Index) -> Outcome {
        for (path, precondition) in &self.preconditions {
            if !precondition.check(tree.get(path).as_ref()) {
                return Outcome::Rejected { index, path: path.clone() };
            }
        }
        for (path, operation) in &self.operations {
            operation.apply(tree, path);
        }
        Outcome::Applied { index }
    }
}

/// The outcome of a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// The transaction was applied at the index.
    Applied { index: Index },
    /// A precondition failed at the path. The transaction still consumed the
    /// log index.
    Rejected { index: Index, path: Path },
    /// The transaction was already applied earlier, but its outcome is no
    /// longer retained. See `ClientProgress`.
    Duplicate { seq: u64 },
    /// The transaction was appended to the leader's log at the index, but the
    /// client didn't wait for it to be applied. Its outcome can be looked up
    /// via its client tag once applied.
    Accepted { index: Index },
}

impl encoding::Value for Outcome {}

impl Outcome {
    /// Returns the log index of the transaction, if known.
    pub fn index(&self) -> Option<Index> {
        match self {
            Self::Applied { index } | Self::Rejected { index, .. } | Self::Accepted { index } => {
                Some(*index)
            }
            Self::Duplicate { .. } => None,
        }
    }

    /// Converts the outcome into a result, where a rejection is
    /// Error::PreconditionFailed. Returns the log index, if known.
    pub fn into_result(self) -> Result<Option<Index>> {
        match self {
            Self::Rejected { path, .. } => Err(Error::PreconditionFailed(path.to_string())),
            outcome => Ok(outcome.index()),
        }
    }
}
