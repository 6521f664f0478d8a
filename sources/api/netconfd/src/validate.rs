//! Semantic validation of configuration trees.
//!
//! The engine only needs to know whether a tree is acceptable; what "acceptable" means is up to
//! the Validator it's given.  StructuralValidator checks the rules that hold for any tree this
//! daemon stores.

use datastore::tree::{ConfigTree, Node, ROOT_NAME};
use std::collections::HashSet;

/// The outcome of validating a well-formed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// The tree was rejected; the string holds human-readable diagnostics, one per line.
    Rejected(String),
}

pub trait Validator {
    /// Validates the tree.  Err means the validator itself failed and no verdict was reached.
    fn validate(&self, tree: &ConfigTree) -> Result<Validation, String>;
}

impl<F> Validator for F
where
    F: Fn(&ConfigTree) -> Result<Validation, String>,
{
    fn validate(&self, tree: &ConfigTree) -> Result<Validation, String> {
        self(tree)
    }
}

/// Checks that the root is a `config` element, that every element has a name, and that no list
/// holds two entries with the same key.  List entries are siblings of the same name whose first
/// child is a leaf of the same name, which is their key.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

impl Validator for StructuralValidator {
    fn validate(&self, tree: &ConfigTree) -> Result<Validation, String> {
        let mut diagnostics = Vec::new();
        let root = tree.root();
        if root.name != ROOT_NAME {
            diagnostics.push(format!(
                "root element is '{}', expected '{}'",
                root.name, ROOT_NAME
            ));
        }
        check_node(root, &format!("/{}", root.name), &mut diagnostics);

        if diagnostics.is_empty() {
            Ok(Validation::Valid)
        } else {
            Ok(Validation::Rejected(diagnostics.join("\n")))
        }
    }
}

fn check_node(node: &Node, path: &str, diagnostics: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for child in &node.children {
        if child.name.is_empty() {
            diagnostics.push(format!("element without a name under {}", path));
            continue;
        }
        if let Some(key) = child.key_leaf() {
            let value = key.text.as_deref().unwrap_or_default();
            if !seen.insert((&child.name, &key.name, value)) {
                diagnostics.push(format!(
                    "duplicate entry {}[{}='{}'] under {}",
                    child.name, key.name, value, path
                ));
            }
        }
        check_node(child, &format!("{}/{}", path, child.name), diagnostics);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use datastore::codec;

    fn validate(xml: &str) -> Validation {
        StructuralValidator
            .validate(&codec::parse(xml).unwrap())
            .unwrap()
    }

    #[test]
    fn valid_trees() {
        assert_eq!(validate("<config/>"), Validation::Valid);
        assert_eq!(
            validate(
                "<config><interfaces>\
                   <interface><name>eth0</name></interface>\
                   <interface><name>eth1</name></interface>\
                 </interfaces></config>"
            ),
            Validation::Valid
        );
        // Plain leaves may repeat; they have no key.
        assert_eq!(
            validate("<config><dns><server>a</server><server>b</server></dns></config>"),
            Validation::Valid
        );
    }

    #[test]
    fn wrong_root() {
        assert!(matches!(validate("<data/>"), Validation::Rejected(_)));
    }

    #[test]
    fn duplicate_keys_are_all_reported() {
        let result = validate(
            "<config>\
               <a><name>x</name></a><a><name>x</name></a>\
               <b><id>1</id></b><b><id>1</id></b>\
             </config>",
        );
        match result {
            Validation::Rejected(diagnostics) => {
                assert_eq!(diagnostics.lines().count(), 2);
                assert!(diagnostics.contains("a[name='x']"));
                assert!(diagnostics.contains("b[id='1']"));
            }
            Validation::Valid => panic!("duplicates accepted"),
        }
    }

    #[test]
    fn closures_are_validators() {
        let reject_all =
            |_: &ConfigTree| -> Result<Validation, String> { Ok(Validation::Rejected("no".into())) };
        assert_eq!(
            reject_all.validate(&ConfigTree::empty()).unwrap(),
            Validation::Rejected("no".to_string())
        );
    }
}
