//! Selecting parts of a configuration tree.
//!
//! Two selection languages are supported: a small absolute path language (`/a/b[name='v']/c`)
//! and subtree filters, where a filter tree describes the shape of the wanted data.  Both return
//! a new tree rooted at a `config` element that keeps the ancestors of every matched node.

use snafu::{ensure, OptionExt};
use std::fmt;
use std::str::FromStr;

use crate::tree::{ConfigTree, Node, ROOT_NAME};

/// Name of the element that conventionally wraps the nodes of a subtree filter.
pub const FILTER_NAME: &str = "filter";

/// Matches any element name in a path step.
const WILDCARD: &str = "*";

/// What part of a tree to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Path(Path),
    Subtree(Node),
}

impl Selector {
    /// Returns the selected part of `tree`.  The result is always a complete tree; if nothing
    /// matches, it's the empty tree.
    pub fn select(&self, tree: &ConfigTree) -> ConfigTree {
        match self {
            Selector::All => tree.clone(),
            Selector::Path(path) => path.select(tree),
            Selector::Subtree(filter) => select_subtree(tree, filter),
        }
    }
}

/// One step of a path: an element name plus child-value predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    name: String,
    predicates: Vec<(String, String)>,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn predicates(&self) -> &[(String, String)] {
        &self.predicates
    }

    /// Whether `node` is named by this step and has a child for each predicate with the given
    /// text.
    pub fn matches(&self, node: &Node) -> bool {
        (self.name == WILDCARD || self.name == node.name)
            && self
                .predicates
                .iter()
                .all(|(child, value)| node.child_text(child) == Some(value.as_str()))
    }
}

/// An absolute path into a configuration tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    raw: String,
    steps: Vec<Step>,
}

impl Path {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Returns the steps that apply below the root.  A leading step naming the root itself is
    /// optional, so `/config/a` and `/a` are the same path.
    pub fn steps_below(&self, root: &Node) -> &[Step] {
        match self.steps.first() {
            Some(first) if first.name == ROOT_NAME && first.matches(root) => &self.steps[1..],
            _ => &self.steps,
        }
    }

    /// Returns a tree holding every node reached by this path, along with its ancestors.
    pub fn select(&self, tree: &ConfigTree) -> ConfigTree {
        let root = tree.root();
        let steps = self.steps_below(root);
        match prune(root, steps) {
            Some(selected) => ConfigTree::from_root(selected),
            None => ConfigTree::empty(),
        }
    }

    /// Returns every node reached by this path.
    pub fn find<'a>(&self, tree: &'a ConfigTree) -> Vec<&'a Node> {
        let root = tree.root();
        let mut current = vec![root];
        for step in self.steps_below(root) {
            current = current
                .into_iter()
                .flat_map(|n| n.children.iter().filter(|c| step.matches(c)))
                .collect();
        }
        current
    }
}

/// Keeps the parts of `node` reached by `steps`.  `node` has already matched; with no steps left,
/// its whole subtree is kept.
fn prune(node: &Node, steps: &[Step]) -> Option<Node> {
    let (step, rest) = match steps.split_first() {
        Some(split) => split,
        None => return Some(node.clone()),
    };

    let mut kept = Vec::new();
    for child in node.children.iter().filter(|c| step.matches(c)) {
        if let Some(pruned) = prune(child, rest) {
            kept.push(keep_predicate_leaves(child, step, pruned, rest.is_empty()));
        }
    }
    if kept.is_empty() {
        return None;
    }
    Some(Node {
        name: node.name.clone(),
        text: None,
        attributes: node.attributes.clone(),
        children: kept,
    })
}

/// Ancestors reached through a predicate keep the leaves the predicate tested, so list entries in
/// the result still carry their keys.
fn keep_predicate_leaves(original: &Node, step: &Step, mut pruned: Node, whole: bool) -> Node {
    if whole {
        return pruned;
    }
    let mut keys: Vec<Node> = step
        .predicates
        .iter()
        .filter(|(child, _)| !pruned.children.iter().any(|c| &c.name == child))
        .filter_map(|(child, _)| original.child(child).cloned())
        .collect();
    keys.append(&mut pruned.children);
    pruned.children = keys;
    pruned
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let raw = input.trim();
        let mut chars = raw.chars().peekable();
        ensure!(
            chars.next() == Some('/'),
            error::NotAbsoluteSnafu { path: raw }
        );

        let mut steps = Vec::new();
        // A bare "/" is the root; it selects everything.
        while chars.peek().is_some() {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c == '/' || c == '[' {
                    break;
                }
                name.push(c);
                chars.next();
            }
            let name = name.trim().to_string();
            ensure!(!name.is_empty(), error::EmptyStepSnafu { path: raw });

            let mut predicates = Vec::new();
            while chars.peek() == Some(&'[') {
                chars.next();
                let mut child = String::new();
                loop {
                    match chars.next() {
                        Some('=') => break,
                        Some(c) => child.push(c),
                        None => return error::UnterminatedPredicateSnafu { path: raw }.fail(),
                    }
                }
                let child = child.trim().to_string();
                ensure!(!child.is_empty(), error::EmptyStepSnafu { path: raw });

                while chars.peek().map_or(false, |c| c.is_whitespace()) {
                    chars.next();
                }
                let quote = chars
                    .next()
                    .filter(|c| *c == '\'' || *c == '"')
                    .context(error::UnquotedValueSnafu { path: raw })?;
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => value.push(c),
                        None => return error::UnterminatedPredicateSnafu { path: raw }.fail(),
                    }
                }
                while chars.peek().map_or(false, |c| c.is_whitespace()) {
                    chars.next();
                }
                ensure!(
                    chars.next() == Some(']'),
                    error::UnterminatedPredicateSnafu { path: raw }
                );
                predicates.push((child, value));
            }

            steps.push(Step { name, predicates });
            match chars.next() {
                Some('/') => {
                    ensure!(chars.peek().is_some(), error::EmptyStepSnafu { path: raw });
                }
                None => break,
                Some(_) => return error::UnexpectedCharacterSnafu { path: raw }.fail(),
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            steps,
        })
    }
}

/// Applies a subtree filter.  If the filter node is a wrapper (`filter` or `config`), its children
/// are the top-level filters; otherwise the node itself is the single top-level filter.
fn select_subtree(tree: &ConfigTree, filter: &Node) -> ConfigTree {
    let wrapper;
    let filter = if filter.name == ROOT_NAME || filter.name == FILTER_NAME {
        filter
    } else {
        wrapper = Node::new(ROOT_NAME).with_child(filter.clone());
        &wrapper
    };
    // An empty wrapper selects nothing.
    if filter.children.is_empty() {
        return ConfigTree::empty();
    }
    match filter_node(tree.root(), filter) {
        Some(selected) => ConfigTree::from_root(selected),
        None => ConfigTree::empty(),
    }
}

/// Applies `filter` to `node`, which already matched it by name.
///
/// Filter children are classified the usual way: a leaf with text is a content match node, a leaf
/// without text is a selection node, and a node with children is a containment node.
fn filter_node(node: &Node, filter: &Node) -> Option<Node> {
    if filter.children.is_empty() {
        return Some(node.clone());
    }

    let content_matches: Vec<&Node> = filter
        .children
        .iter()
        .filter(|f| f.is_leaf() && f.text.is_some())
        .collect();
    for wanted in &content_matches {
        let found = node
            .children
            .iter()
            .any(|c| c.name == wanted.name && c.text == wanted.text);
        if !found {
            return None;
        }
    }
    // Only content matches: the whole matching node is selected.
    if content_matches.len() == filter.children.len() {
        return Some(node.clone());
    }

    let mut kept = Vec::new();
    let mut selected_any = false;
    for child in &node.children {
        if content_matches
            .iter()
            .any(|f| f.name == child.name && f.text == child.text)
        {
            kept.push(child.clone());
            continue;
        }
        let mut candidates = filter
            .children
            .iter()
            .filter(|f| f.name == child.name && !(f.is_leaf() && f.text.is_some()));
        let selected = candidates.find_map(|f| {
            if f.is_leaf() {
                Some(child.clone())
            } else {
                filter_node(child, f)
            }
        });
        if let Some(selected) = selected {
            kept.push(selected);
            selected_any = true;
        }
    }
    if !selected_any {
        return None;
    }
    Some(Node {
        name: node.name.clone(),
        text: None,
        attributes: node.attributes.clone(),
        children: kept,
    })
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Path '{}' must start with '/'", path))]
        NotAbsolute { path: String },

        #[snafu(display("Path '{}' has an empty step", path))]
        EmptyStep { path: String },

        #[snafu(display("Path '{}' has an unterminated predicate", path))]
        UnterminatedPredicate { path: String },

        #[snafu(display("Path '{}' has a predicate value that isn't quoted", path))]
        UnquotedValue { path: String },

        #[snafu(display("Path '{}' has unexpected characters after a predicate", path))]
        UnexpectedCharacter { path: String },
    }
}

pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
