//! Arena element tree for schema documents.
//!
//! Nodes are addressed by [`NodeId`]; all files contributing to one schema
//! parse into the same arena, so inlining an `externalRef` is a matter of
//! rewiring child lists. Elements keep an immutable snapshot of the
//! namespace bindings that were in scope at parse time, which later steps
//! use to resolve QName-valued attributes and `value` bodies.

use std::rc::Rc;

/// The RELAX NG structure namespace.
pub const RELAXNG_NS: &str = "http://relaxng.org/ns/structure/1.0";

/// The XML 1.0 namespace, bound to the `xml` prefix on every element.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Prefix → URI bindings in scope at one point of a source document.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct NsBindings {
    bindings: Vec<(String, String)>,
}

impl NsBindings {
    pub fn new(bindings: Vec<(String, String)>) -> NsBindings {
        NsBindings { bindings }
    }

    /// Look up a prefix; the empty string is the default namespace prefix.
    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NS);
        }
        self.bindings
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| &uri[..])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings.iter().map(|(p, u)| (&p[..], &u[..]))
    }
}

#[derive(Clone, Debug)]
pub enum Child {
    Element(NodeId),
    Text(String),
}

#[derive(Debug)]
struct ElementData {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Child>,
    parent: Option<NodeId>,
    ns: Rc<NsBindings>,
    base: Rc<str>,
}

/// The arena. A `Tree` may hold several detached roots while step 1 of the
/// simplification is still splicing loaded files together.
#[derive(Debug, Default)]
pub struct Tree {
    nodes: Vec<ElementData>,
}

impl Tree {
    pub fn new() -> Tree {
        Tree::default()
    }

    /// Create a detached element.
    pub fn create(&mut self, name: &str, ns: Rc<NsBindings>, base: Rc<str>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(ElementData {
            name: name.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
            parent: None,
            ns,
            base,
        });
        id
    }

    /// Create a detached element sharing the namespace snapshot and base URL
    /// of an existing node (used by rewrite steps synthesizing wrappers).
    pub fn create_like(&mut self, name: &str, like: NodeId) -> NodeId {
        let ns = Rc::clone(&self.nodes[like.index()].ns);
        let base = Rc::clone(&self.nodes[like.index()].base);
        self.create(name, ns, base)
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.index()].name
    }

    pub fn set_name(&mut self, id: NodeId, name: &str) {
        self.nodes[id.index()].name = name.to_string();
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id.index()]
            .attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| &v[..])
    }

    pub fn attrs(&self, id: NodeId) -> &[(String, String)] {
        &self.nodes[id.index()].attrs
    }

    /// Set an attribute, replacing any existing value but keeping the
    /// original position in the ordered list.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        let attrs = &mut self.nodes[id.index()].attrs;
        if let Some(slot) = attrs.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value.to_string();
        } else {
            attrs.push((name.to_string(), value.to_string()));
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> Option<String> {
        let attrs = &mut self.nodes[id.index()].attrs;
        let pos = attrs.iter().position(|(n, _)| n == name)?;
        Some(attrs.remove(pos).1)
    }

    pub fn children(&self, id: NodeId) -> &[Child] {
        &self.nodes[id.index()].children
    }

    /// Element children only, collected so the caller may mutate while
    /// iterating.
    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id.index()]
            .children
            .iter()
            .filter_map(|c| match c {
                Child::Element(e) => Some(*e),
                Child::Text(_) => None,
            })
            .collect()
    }

    /// Replace the whole child list, fixing up parent pointers.
    pub fn set_children(&mut self, id: NodeId, children: Vec<Child>) {
        for child in &children {
            if let Child::Element(e) = child {
                self.nodes[e.index()].parent = Some(id);
            }
        }
        self.nodes[id.index()].children = children;
    }

    pub fn push_child(&mut self, id: NodeId, child: Child) {
        if let Child::Element(e) = child {
            self.nodes[e.index()].parent = Some(id);
        }
        self.nodes[id.index()].children.push(child);
    }

    pub fn insert_child(&mut self, id: NodeId, index: usize, child: Child) {
        if let Child::Element(e) = child {
            self.nodes[e.index()].parent = Some(id);
        }
        self.nodes[id.index()].children.insert(index, child);
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    pub fn detach(&mut self, id: NodeId) {
        self.nodes[id.index()].parent = None;
    }

    /// Swap `old` for `new` in `old`'s parent's child list. `old` becomes
    /// detached; a detached `old` is a no-op.
    pub fn replace_element(&mut self, old: NodeId, new: NodeId) {
        if let Some(parent) = self.nodes[old.index()].parent {
            for child in &mut self.nodes[parent.index()].children {
                if let Child::Element(e) = child {
                    if *e == old {
                        *child = Child::Element(new);
                    }
                }
            }
            self.nodes[new.index()].parent = Some(parent);
            self.nodes[old.index()].parent = None;
        }
    }

    /// Concatenated text of the element's direct text children.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        for child in &self.nodes[id.index()].children {
            if let Child::Text(t) = child {
                out.push_str(t);
            }
        }
        out
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) {
        self.nodes[id.index()]
            .children
            .retain(|c| matches!(c, Child::Element(_)));
        self.nodes[id.index()]
            .children
            .push(Child::Text(text.to_string()));
    }

    pub fn ns_bindings(&self, id: NodeId) -> &Rc<NsBindings> {
        &self.nodes[id.index()].ns
    }

    pub fn resolve_prefix(&self, id: NodeId, prefix: &str) -> Option<&str> {
        self.nodes[id.index()].ns.resolve(prefix)
    }

    /// URL of the file this element was parsed from.
    pub fn base(&self, id: NodeId) -> &Rc<str> {
        &self.nodes[id.index()].base
    }

    /// Render a `/grammar/define[2]/data` style path for diagnostics. The
    /// index is the 1-based position among same-named siblings and is
    /// omitted when the element is the only one of its name.
    pub fn path(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            let name = self.name(current);
            let segment = match self.parent(current) {
                Some(parent) => {
                    let siblings: Vec<NodeId> = self
                        .element_children(parent)
                        .into_iter()
                        .filter(|&s| self.name(s) == name)
                        .collect();
                    if siblings.len() > 1 {
                        let nth = siblings.iter().position(|&s| s == current).unwrap() + 1;
                        format!("{}[{}]", name, nth)
                    } else {
                        name.to_string()
                    }
                }
                None => name.to_string(),
            };
            segments.push(segment);
            match self.parent(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        segments.reverse();
        let mut out = String::new();
        for segment in segments {
            out.push('/');
            out.push_str(&segment);
        }
        out
    }

    /// Serialize a subtree back to XML, default-binding the RELAX NG
    /// namespace on the given root.
    pub fn write_xml(&self, root: NodeId) -> String {
        let mut out = String::new();
        self.write_element(root, true, 0, &mut out);
        out
    }

    fn write_element(&self, id: NodeId, is_root: bool, depth: usize, out: &mut String) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push('<');
        out.push_str(self.name(id));
        if is_root {
            out.push_str(" xmlns=\"");
            out.push_str(RELAXNG_NS);
            out.push('"');
        }
        for (name, value) in self.attrs(id) {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            escape_into(value, out);
            out.push('"');
        }
        let children = self.children(id);
        if children.is_empty() {
            out.push_str("/>\n");
            return;
        }
        // Mixed layout: elements are indented on their own lines, text-only
        // content is emitted inline so that `param`/`value` bodies survive
        // byte-for-byte.
        let has_elements = children.iter().any(|c| matches!(c, Child::Element(_)));
        out.push('>');
        if has_elements {
            out.push('\n');
            for child in children {
                match child {
                    Child::Element(e) => self.write_element(*e, false, depth + 1, out),
                    Child::Text(t) => escape_into(t, out),
                }
            }
            for _ in 0..depth {
                out.push_str("  ");
            }
        } else {
            for child in children {
                if let Child::Text(t) = child {
                    escape_into(t, out);
                }
            }
        }
        out.push_str("</");
        out.push_str(self.name(id));
        out.push_str(">\n");
    }
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Tree, NodeId, NodeId, NodeId) {
        let mut tree = Tree::new();
        let ns = Rc::new(NsBindings::default());
        let base: Rc<str> = Rc::from("file:///t.rng");
        let grammar = tree.create("grammar", Rc::clone(&ns), Rc::clone(&base));
        let start = tree.create("start", Rc::clone(&ns), Rc::clone(&base));
        let define = tree.create("define", ns, base);
        tree.push_child(grammar, Child::Element(start));
        tree.push_child(grammar, Child::Element(define));
        (tree, grammar, start, define)
    }

    #[test]
    fn parents_track_surgery() {
        let (mut tree, grammar, start, define) = fixture();
        assert_eq!(tree.parent(start), Some(grammar));
        let replacement = tree.create_like("choice", start);
        tree.replace_element(define, replacement);
        assert_eq!(tree.parent(replacement), Some(grammar));
        assert_eq!(tree.parent(define), None);
        assert_eq!(tree.element_children(grammar), vec![start, replacement]);
    }

    #[test]
    fn paths_index_repeated_siblings() {
        let (mut tree, grammar, _, define) = fixture();
        let second = tree.create_like("define", define);
        tree.push_child(grammar, Child::Element(second));
        assert_eq!(tree.path(define), "/grammar/define[1]");
        assert_eq!(tree.path(second), "/grammar/define[2]");
        assert_eq!(tree.path(grammar), "/grammar");
    }

    #[test]
    fn attrs_keep_order() {
        let (mut tree, _, start, _) = fixture();
        tree.set_attr(start, "combine", "choice");
        tree.set_attr(start, "ns", "urn:x");
        tree.set_attr(start, "combine", "interleave");
        assert_eq!(
            tree.attrs(start),
            &[
                ("combine".to_string(), "interleave".to_string()),
                ("ns".to_string(), "urn:x".to_string())
            ]
        );
        assert_eq!(tree.remove_attr(start, "combine").as_deref(), Some("interleave"));
        assert_eq!(tree.attr(start, "combine"), None);
    }

    #[test]
    fn xml_prefix_is_predefined() {
        let ns = NsBindings::new(vec![("".to_string(), "urn:default".to_string())]);
        assert_eq!(ns.resolve("xml"), Some(XML_NS));
        assert_eq!(ns.resolve(""), Some("urn:default"));
        assert_eq!(ns.resolve("missing"), None);
    }
}
