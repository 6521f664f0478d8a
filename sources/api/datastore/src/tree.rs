//! The configuration tree model.
//!
//! A configuration is a single rooted, ordered, labeled tree.  Each node has a name, optional
//! text, an ordered list of attributes, and an ordered list of children.  Trees are plain owned
//! values; cloning a tree produces an independent duplicate.

use serde::{Deserialize, Serialize};

/// Name of the root element of every stored configuration.
pub const ROOT_NAME: &str = "config";

/// One element in a configuration tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
}

impl Node {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            text: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Creates a leaf node with the given text.
    pub fn leaf<S1, S2>(name: S1, text: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            text: Some(text.into()),
            ..Self::new(name)
        }
    }

    /// Builder-style helper to add a child.
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Builder-style helper to add an attribute.
    pub fn with_attribute<S1, S2>(mut self, name: S1, value: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// A leaf has no child elements.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Removes the named attribute, returning its value if it was present.
    pub fn take_attribute(&mut self, name: &str) -> Option<String> {
        let pos = self.attributes.iter().position(|(n, _)| n == name)?;
        Some(self.attributes.remove(pos).1)
    }

    /// Returns the first child with the given name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns the text of the first child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.text.as_deref())
    }

    /// The key of a list entry, by convention its first child when that child is a leaf.
    pub fn key_leaf(&self) -> Option<&Node> {
        self.children.first().filter(|c| c.is_leaf())
    }

    /// Counts this node and all of its descendants.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(Node::len).sum::<usize>()
    }
}

/// A full configuration, as held by one datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigTree {
    root: Node,
}

impl ConfigTree {
    /// The canonical empty configuration, a bare root element.
    pub fn empty() -> Self {
        Self {
            root: Node::new(ROOT_NAME),
        }
    }

    pub fn from_root(root: Node) -> Self {
        Self { root }
    }

    /// Wraps the given nodes in a root element.
    pub fn from_children(children: Vec<Node>) -> Self {
        Self {
            root: Node {
                children,
                ..Node::new(ROOT_NAME)
            },
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    pub fn into_root(self) -> Node {
        self.root
    }

    /// A tree is empty when its root has no children and no text.
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && self.root.text.is_none()
    }
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_tree() {
        let tree = ConfigTree::empty();
        assert!(tree.is_empty());
        assert_eq!(tree.root().name, ROOT_NAME);
        assert_eq!(tree, ConfigTree::default());
    }

    #[test]
    fn key_leaf_is_first_leaf_child() {
        let entry = Node::new("interface")
            .with_child(Node::leaf("name", "eth0"))
            .with_child(Node::leaf("mtu", "1500"));
        assert_eq!(entry.key_leaf().map(|k| k.name.as_str()), Some("name"));
        assert_eq!(entry.child_text("mtu"), Some("1500"));

        let container = Node::new("system").with_child(Node::new("ntp").with_child(Node::leaf("server", "a")));
        assert!(container.key_leaf().is_none());
    }

    #[test]
    fn take_attribute_removes() {
        let mut node = Node::new("x").with_attribute("operation", "delete");
        assert_eq!(node.attribute("operation"), Some("delete"));
        assert_eq!(node.take_attribute("operation"), Some("delete".to_string()));
        assert!(node.attributes.is_empty());
        assert_eq!(node.take_attribute("operation"), None);
    }

    #[test]
    fn clone_is_independent() {
        let mut a = ConfigTree::from_children(vec![Node::leaf("x", "1")]);
        let b = a.clone();
        a.root_mut().children[0].text = Some("2".to_string());
        assert_eq!(b.root().child_text("x"), Some("1"));
        assert_eq!(a.root().len(), 2);
    }
}
