//! Applying edit fragments to configuration trees.
//!
//! A fragment is merged, replaced, or walked (`none`) into the tree at a target node.  Nodes in
//! the fragment may carry an `operation` attribute that overrides the operation inherited from
//! their parent for their own subtree; the attribute is never stored.
//!
//! Sibling elements are considered the same entry when their names are equal and, if both have a
//! leaf as their first child and those leaves share a name, the leaves have the same text.  This
//! lets list entries keyed by their first leaf be addressed without a schema.
//!
//! On error the tree may be partially edited; callers edit a copy and only keep it on success.

use log::trace;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt};
use std::fmt;
use std::str::FromStr;

use crate::select::Path;
use crate::tree::{ConfigTree, Node, ROOT_NAME};

/// Name of the attribute that carries a per-node operation.
pub const OPERATION_ATTRIBUTE: &str = "operation";

/// Operation requested for a node of an edit fragment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
    None,
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge" => Ok(Operation::Merge),
            "replace" => Ok(Operation::Replace),
            "create" => Ok(Operation::Create),
            "delete" => Ok(Operation::Delete),
            "remove" => Ok(Operation::Remove),
            "none" => Ok(Operation::None),
            _ => error::InvalidOperationSnafu { operation: s }.fail(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Merge => "merge",
            Operation::Replace => "replace",
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::Remove => "remove",
            Operation::None => "none",
        };
        write!(f, "{}", name)
    }
}

/// The operation applied where the fragment doesn't say otherwise.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultOperation {
    #[default]
    Merge,
    Replace,
    None,
}

impl DefaultOperation {
    fn as_operation(self) -> Operation {
        match self {
            DefaultOperation::Merge => Operation::Merge,
            DefaultOperation::Replace => Operation::Replace,
            DefaultOperation::None => Operation::None,
        }
    }
}

impl FromStr for DefaultOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge" => Ok(DefaultOperation::Merge),
            "replace" => Ok(DefaultOperation::Replace),
            "none" => Ok(DefaultOperation::None),
            _ => error::InvalidOperationSnafu { operation: s }.fail(),
        }
    }
}

/// Applies `fragment` to `tree` at the node named by `path` (the root if no path is given).
///
/// A fragment rooted at a `config` element contributes its children; any other fragment root is
/// itself the single node to apply.
pub fn apply(
    tree: &mut ConfigTree,
    default_operation: DefaultOperation,
    path: Option<&Path>,
    fragment: ConfigTree,
) -> Result<()> {
    let fragment = fragment.into_root();
    let nodes = if fragment.name == ROOT_NAME {
        fragment.children
    } else {
        vec![fragment]
    };

    let target = match path {
        Some(path) => resolve(tree.root_mut(), path)?,
        None => tree.root_mut(),
    };

    if default_operation == DefaultOperation::Replace {
        trace!("Replacing contents of '{}'", target.name);
        target.children.clear();
        target.text = None;
    }
    let inherited = default_operation.as_operation();
    for node in nodes {
        edit_node(target, node, inherited)?;
    }
    Ok(())
}

/// Whether two sibling elements are the same entry.
pub fn same_entry(a: &Node, b: &Node) -> bool {
    if a.name != b.name {
        return false;
    }
    match (a.key_leaf(), b.key_leaf()) {
        (Some(key_a), Some(key_b)) if key_a.name == key_b.name => key_a.text == key_b.text,
        _ => true,
    }
}

fn resolve<'a>(root: &'a mut Node, path: &Path) -> Result<&'a mut Node> {
    let steps = path.steps_below(root).to_vec();
    let mut node = root;
    for step in &steps {
        node = node
            .children
            .iter_mut()
            .find(|c| step.matches(c))
            .context(error::PathNotFoundSnafu {
                path: path.to_string(),
            })?;
    }
    Ok(node)
}

fn take_operation(node: &mut Node, inherited: Operation) -> Result<Operation> {
    match node.take_attribute(OPERATION_ATTRIBUTE) {
        Some(value) => value.parse(),
        None => Ok(inherited),
    }
}

fn edit_node(parent: &mut Node, mut fragment: Node, inherited: Operation) -> Result<()> {
    let operation = take_operation(&mut fragment, inherited)?;
    let position = parent
        .children
        .iter()
        .position(|existing| same_entry(existing, &fragment));
    trace!(
        "Applying {} to '{}' under '{}' ({})",
        operation,
        fragment.name,
        parent.name,
        if position.is_some() { "exists" } else { "new" }
    );

    match (operation, position) {
        (Operation::Create, Some(_)) => error::DataExistsSnafu {
            name: fragment.name,
        }
        .fail(),
        (Operation::Delete, None) | (Operation::None, None) => error::DataMissingSnafu {
            name: fragment.name,
        }
        .fail(),
        (Operation::Delete, Some(i)) | (Operation::Remove, Some(i)) => {
            parent.children.remove(i);
            Ok(())
        }
        (Operation::Remove, None) => Ok(()),
        (Operation::Replace, Some(i)) => {
            if let Some(node) = build(fragment, Operation::Replace)? {
                parent.children[i] = node;
            }
            Ok(())
        }
        (Operation::Merge, Some(i)) | (Operation::None, Some(i)) => {
            merge_into(&mut parent.children[i], fragment, operation)
        }
        (Operation::Create, None) | (Operation::Merge, None) | (Operation::Replace, None) => {
            if let Some(node) = build(fragment, operation)? {
                parent.children.push(node);
            }
            Ok(())
        }
    }
}

fn merge_into(existing: &mut Node, fragment: Node, operation: Operation) -> Result<()> {
    if operation == Operation::Merge {
        if fragment.text.is_some() {
            existing.text = fragment.text;
        }
        for (name, value) in fragment.attributes {
            match existing.attributes.iter_mut().find(|(n, _)| *n == name) {
                Some(attribute) => attribute.1 = value,
                None => existing.attributes.push((name, value)),
            }
        }
    }
    for child in fragment.children {
        edit_node(existing, child, operation)?;
    }
    Ok(())
}

/// Builds a node that doesn't exist yet from the fragment.  Returns None if the fragment removes
/// itself.
fn build(mut fragment: Node, inherited: Operation) -> Result<Option<Node>> {
    let operation = take_operation(&mut fragment, inherited)?;
    ensure!(
        !matches!(operation, Operation::Delete | Operation::None),
        error::DataMissingSnafu {
            name: &fragment.name
        }
    );
    if operation == Operation::Remove {
        return Ok(None);
    }

    let children = std::mem::take(&mut fragment.children);
    for child in children {
        if let Some(node) = build(child, Operation::Merge)? {
            fragment.children.push(node);
        }
    }
    Ok(Some(fragment))
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Element '{}' already exists", name))]
        DataExists { name: String },

        #[snafu(display("Element '{}' does not exist", name))]
        DataMissing { name: String },

        #[snafu(display("Unknown edit operation '{}'", operation))]
        InvalidOperation { operation: String },

        #[snafu(display("Edit target '{}' not found", path))]
        PathNotFound { path: String },
    }
}

pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
