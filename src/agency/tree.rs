use super::{Path, Value};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The Agency document tree. Branches map keys to child nodes, and leaves
/// hold non-object values. Objects written into the tree are stored as
/// branches, so later writes can address their members.
///
/// Children are reference counted and mutated via copy-on-write
/// (Arc::make_mut), so cloning the tree is O(1). A clone taken for a snapshot
/// is unaffected by later writes, which only copy the nodes along the written
/// path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Tree {
    root: Arc<Node>,
}

/// A tree node.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Node {
    Branch(BTreeMap<String, Arc<Node>>),
    Leaf(Value),
}

impl Default for Node {
    fn default() -> Self {
        Node::Branch(BTreeMap::new())
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(object) => Node::Branch(
                object.into_iter().map(|(key, value)| (key, Arc::new(Node::from(value)))).collect(),
            ),
            value => Node::Leaf(value),
        }
    }
}

impl Node {
    /// Converts the node into a value.
    fn to_value(&self) -> Value {
        match self {
            Node::Branch(children) => Value::Object(
                children.iter().map(|(key, child)| (key.clone(), child.to_value())).collect(),
            ),
            Node::Leaf(value) => value.clone(),
        }
    }

    /// Returns the node's children, replacing a leaf with an empty branch.
    fn children_mut(&mut self) -> &mut BTreeMap<String, Arc<Node>> {
        if let Node::Leaf(_) = self {
            *self = Node::default();
        }
        match self {
            Node::Branch(children) => children,
            Node::Leaf(_) => unreachable!("leaf replaced by branch"),
        }
    }
}

impl Tree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the node at the given path.
    fn node(&self, path: &Path) -> Option<&Node> {
        let mut node = self.root.as_ref();
        for segment in path.segments() {
            node = match node {
                Node::Branch(children) => children.get(segment)?,
                Node::Leaf(_) => return None,
            };
        }
        Some(node)
    }

    /// Returns the node at the given path for writing, creating missing nodes
    /// and replacing leaves along the path with branches.
    fn node_mut(&mut self, path: &Path) -> &mut Node {
        let mut node = Arc::make_mut(&mut self.root);
        for segment in path.segments() {
            let child = node.children_mut().entry(segment.clone()).or_default();
            node = Arc::make_mut(child);
        }
        node
    }

    /// Returns the value at the given path, if any. Branches are returned as
    /// objects.
    pub fn get(&self, path: &Path) -> Option<Value> {
        self.node(path).map(Node::to_value)
    }

    /// Returns true if a node exists at the given path. The root always exists.
    pub fn exists(&self, path: &Path) -> bool {
        self.node(path).is_some()
    }

    /// Sets the value at the given path.
    pub fn set(&mut self, path: &Path, value: Value) {
        *self.node_mut(path) = Node::from(value);
    }

    /// Replaces the value at the given path with the result of a function of
    /// the current value.
    pub fn update(&mut self, path: &Path, f: impl FnOnce(Option<Value>) -> Value) {
        let value = f(self.get(path));
        self.set(path, value);
    }

    /// Deletes the subtree at the given path, returning true if it existed.
    /// Deleting the root empties the tree.
    pub fn delete(&mut self, path: &Path) -> bool {
        let Some((parents, last)) = path.split_last() else {
            self.root = Arc::default();
            return true;
        };
        if !self.exists(path) {
            return false;
        }
        let mut node = Arc::make_mut(&mut self.root);
        for segment in parents {
            node = match node {
                Node::Branch(children) => match children.get_mut(segment) {
                    Some(child) => Arc::make_mut(child),
                    None => return false,
                },
                Node::Leaf(_) => return false,
            };
        }
        match node {
            Node::Branch(children) => children.remove(last).is_some(),
            Node::Leaf(_) => false,
        }
    }

    /// Returns the whole tree as an object.
    pub fn dump(&self) -> Value {
        self.root.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn json(json: &str) -> Value {
        Value::from_json(json).expect("invalid json")
    }

    #[test]
    fn set_get() {
        let mut tree = Tree::new();
        assert_eq!(tree.get(&"/".into()), Some(json("{}")));
        assert_eq!(tree.get(&"/a".into()), None);

        tree.set(&"/a/b".into(), Value::Integer(5));
        assert_eq!(tree.get(&"/a/b".into()), Some(Value::Integer(5)));
        assert_eq!(tree.get(&"/a".into()), Some(json(r#"{"b": 5}"#)));
        assert!(tree.exists(&"/a".into()));
        assert!(!tree.exists(&"/a/b/c".into()));

        // Objects become branches that can be written through.
        tree.set(&"/x".into(), json(r#"{"y": {"z": 1}}"#));
        tree.set(&"/x/y/w".into(), Value::Integer(2));
        assert_eq!(tree.get(&"/x".into()), Some(json(r#"{"y": {"w": 2, "z": 1}}"#)));

        // Writing through a scalar replaces it with a branch.
        tree.set(&"/a/b/c".into(), Value::from("deep"));
        assert_eq!(tree.dump(), json(r#"{"a": {"b": {"c": "deep"}}, "x": {"y": {"w": 2, "z": 1}}}"#));
    }

    #[test]
    fn delete() {
        let mut tree = Tree::new();
        tree.set(&"/a".into(), json(r#"{"b": 1, "c": {"d": 2}}"#));
        assert!(tree.delete(&"/a/c".into()));
        assert!(!tree.delete(&"/a/c".into()));
        assert!(!tree.delete(&"/a/b/x".into()));
        assert!(!tree.delete(&"/missing/x".into()));
        assert_eq!(tree.dump(), json(r#"{"a": {"b": 1}}"#));

        assert!(tree.delete(&"/".into()));
        assert_eq!(tree.dump(), json("{}"));
    }

    #[test]
    fn update() {
        let mut tree = Tree::new();
        tree.update(&"/n".into(), |v| v.unwrap_or_default().add(&Value::Integer(2)));
        tree.update(&"/n".into(), |v| v.unwrap_or_default().add(&Value::Integer(2)));
        assert_eq!(tree.get(&"/n".into()), Some(Value::Integer(4)));
    }

    #[test]
    /// Clones are isolated from later writes, and share untouched subtrees.
    fn copy_on_write() {
        let mut tree = Tree::new();
        tree.set(&"/a/x".into(), Value::Integer(1));
        tree.set(&"/b/y".into(), Value::Integer(2));

        let capture = tree.clone();
        tree.set(&"/a/x".into(), Value::Integer(3));
        tree.delete(&"/b".into());

        assert_eq!(capture.dump(), json(r#"{"a": {"x": 1}, "b": {"y": 2}}"#));
        assert_eq!(tree.dump(), json(r#"{"a": {"x": 3}}"#));

        let mut tree = capture.clone();
        tree.set(&"/a/z".into(), Value::Integer(4));
        let (Node::Branch(old), Node::Branch(new)) = (capture.root.as_ref(), tree.root.as_ref())
        else {
            panic!("root is not a branch");
        };
        assert!(Arc::ptr_eq(&old["b"], &new["b"]));
        assert!(!Arc::ptr_eq(&old["a"], &new["a"]));
    }
}
