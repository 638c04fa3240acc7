//! Schema document parsing.
//!
//! XML tokenization is delegated to `roxmltree`; this module converts the
//! parsed document into arena nodes, records per-element namespace
//! snapshots, and rejects anything outside the RELAX NG namespace.

use crate::tree::{Child, NodeId, NsBindings, Tree, RELAXNG_NS, XML_NS};
use std::fmt;
use std::rc::Rc;

#[derive(Debug)]
pub enum SyntaxError {
    /// The document is not well-formed XML.
    Xml { base: String, detail: String },
    /// An element outside the RELAX NG namespace appeared in the schema.
    ForeignElement {
        path: String,
        namespace: String,
        name: String,
    },
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyntaxError::Xml { base, detail } => {
                write!(f, "malformed XML in {}: {}", base, detail)
            }
            SyntaxError::ForeignElement {
                path,
                namespace,
                name,
            } => write!(
                f,
                "foreign element {{{}}}{} at {}",
                namespace, name, path
            ),
        }
    }
}

impl std::error::Error for SyntaxError {}

/// Parse schema text into the arena, returning the root element.
///
/// `base` is the URL the text was loaded from; it is stamped on every node
/// so later rewrites can resolve relative `href`s against the right file.
pub fn parse_into(tree: &mut Tree, text: &str, base: &str) -> Result<NodeId, SyntaxError> {
    let doc = roxmltree::Document::parse(text).map_err(|e| SyntaxError::Xml {
        base: base.to_string(),
        detail: e.to_string(),
    })?;
    let base: Rc<str> = Rc::from(base);
    let empty = Rc::new(NsBindings::default());
    convert(tree, doc.root_element(), &base, &empty)
}

fn convert(
    tree: &mut Tree,
    node: roxmltree::Node<'_, '_>,
    base: &Rc<str>,
    parent_ns: &Rc<NsBindings>,
) -> Result<NodeId, SyntaxError> {
    let tag = node.tag_name();
    if tag.namespace() != Some(RELAXNG_NS) {
        return Err(SyntaxError::ForeignElement {
            path: roxml_path(&node),
            namespace: tag.namespace().unwrap_or("").to_string(),
            name: tag.name().to_string(),
        });
    }

    let ns = snapshot(node, parent_ns);
    let id = tree.create(tag.name(), Rc::clone(&ns), Rc::clone(base));

    for attr in node.attributes() {
        match attr.namespace() {
            // Unqualified attributes carry the RELAX NG vocabulary.
            None => tree.set_attr(id, attr.name(), attr.value()),
            // xml:* attributes are recorded; any other foreign attribute is
            // dropped, as the inclusion rewrite would remove it anyway.
            Some(XML_NS) => tree.set_attr(id, &format!("xml:{}", attr.name()), attr.value()),
            Some(_) => {}
        }
    }

    // Whitespace-only text separates schema elements and is dropped, except
    // inside `param` and `value` where the body is significant byte-for-byte.
    let preserve_ws = matches!(tag.name(), "param" | "value");
    for child in node.children() {
        if child.is_element() {
            let child_id = convert(tree, child, base, &ns)?;
            tree.push_child(id, Child::Element(child_id));
        } else if child.is_text() {
            let text = child.text().unwrap_or("");
            if preserve_ws || !is_xml_whitespace(text) {
                tree.push_child(id, Child::Text(text.to_string()));
            }
        }
    }
    Ok(id)
}

fn snapshot(node: roxmltree::Node<'_, '_>, parent: &Rc<NsBindings>) -> Rc<NsBindings> {
    let mut bindings = Vec::new();
    for decl in node.namespaces() {
        let prefix = decl.name().unwrap_or("");
        if prefix == "xml" {
            continue;
        }
        bindings.push((prefix.to_string(), decl.uri().to_string()));
    }
    let fresh = NsBindings::new(bindings);
    if fresh == **parent {
        Rc::clone(parent)
    } else {
        Rc::new(fresh)
    }
}

fn roxml_path(node: &roxmltree::Node<'_, '_>) -> String {
    let mut names: Vec<&str> = node
        .ancestors()
        .filter(|a| a.is_element())
        .map(|a| a.tag_name().name())
        .collect();
    names.reverse();
    let mut out = String::new();
    for name in names {
        out.push('/');
        out.push_str(name);
    }
    out
}

pub fn is_xml_whitespace(text: &str) -> bool {
    text.chars().all(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
}

/// Does the schema still reference another file? Step 1 of the pipeline
/// re-runs until this is false.
pub fn depends_on_external_file(tree: &Tree, root: NodeId) -> bool {
    if matches!(tree.name(root), "include" | "externalRef") {
        return true;
    }
    tree.element_children(root)
        .into_iter()
        .any(|child| depends_on_external_file(tree, child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse(text: &str) -> (Tree, NodeId) {
        let mut tree = Tree::new();
        let root = parse_into(&mut tree, text, "file:///main.rng").expect("parse");
        (tree, root)
    }

    #[test]
    fn element_names_and_attrs() {
        let (tree, root) = parse(
            r#"<element name="doc" xmlns="http://relaxng.org/ns/structure/1.0">
                 <empty/>
               </element>"#,
        );
        assert_eq!(tree.name(root), "element");
        assert_eq!(tree.attr(root, "name"), Some("doc"));
        let children = tree.element_children(root);
        assert_eq!(children.len(), 1);
        assert_eq!(tree.name(children[0]), "empty");
        // the separating whitespace was dropped
        assert_eq!(tree.children(root).len(), 1);
    }

    #[test]
    fn value_body_survives_byte_for_byte() {
        let (tree, root) = parse(
            "<value xmlns=\"http://relaxng.org/ns/structure/1.0\">  two  spaces \n</value>",
        );
        assert_eq!(tree.text_content(root), "  two  spaces \n");
    }

    #[test]
    fn namespace_snapshot_resolves_prefixes() {
        let (tree, root) = parse(
            r#"<element name="doc" xmlns="http://relaxng.org/ns/structure/1.0"
                        xmlns:foo="urn:x">
                 <value type="QName">foo:bar</value>
               </element>"#,
        );
        let value = tree.element_children(root)[0];
        assert_eq!(tree.resolve_prefix(value, "foo"), Some("urn:x"));
        assert_eq!(tree.resolve_prefix(value, "bar"), None);
    }

    #[test]
    fn foreign_element_rejected() {
        let mut tree = Tree::new();
        let err = parse_into(
            &mut tree,
            r#"<element xmlns="http://relaxng.org/ns/structure/1.0" name="a">
                 <odd xmlns="urn:other"/>
               </element>"#,
            "file:///main.rng",
        )
        .unwrap_err();
        assert_matches!(err, SyntaxError::ForeignElement { ref namespace, ref name, .. } => {
            assert_eq!(namespace, "urn:other");
            assert_eq!(name, "odd");
        });
    }

    #[test]
    fn external_dependency_predicate() {
        let (tree, root) = parse(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><externalRef href="other.rng"/></start>
               </grammar>"#,
        );
        assert!(depends_on_external_file(&tree, root));
        let (tree2, root2) = parse(
            r#"<element name="a" xmlns="http://relaxng.org/ns/structure/1.0"><empty/></element>"#,
        );
        assert!(!depends_on_external_file(&tree2, root2));
    }

    #[test]
    fn xml_attributes_are_recorded() {
        let (tree, root) = parse(
            r#"<element name="a" xml:lang="en"
                        xmlns="http://relaxng.org/ns/structure/1.0"><text/></element>"#,
        );
        assert_eq!(tree.attr(root, "xml:lang"), Some("en"));
    }
}
