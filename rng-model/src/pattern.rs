//! The compiled pattern tree.
//!
//! Patterns live in an arena indexed by [`PatId`] with structural
//! interning, so identical subpatterns share a node and walkers can refer
//! to patterns by copyable handles. `Ref` stores a [`DefineId`] instead of
//! a pointer; cycles through define bodies are therefore harmless, since
//! they are only followed lazily, when an element walker starts its
//! content.

use crate::datatype::{self, xsd, Datatypes, DatatypeValues, Namespaces, Param};
use crate::name_class::{ExpandedName, NameClass};
use crate::SchemaError;
use fnv::FnvHashMap;
use rng_syntax::tree::{NodeId, Tree};
use std::collections::{BTreeSet, HashMap};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PatId(u32);

impl PatId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct DefineId(u32);

impl DefineId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

// Large payloads are boxed to keep the enum small; patterns are interned
// and hashed during compilation.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Pattern {
    Empty,
    NotAllowed,
    Text,
    Choice(PatId, PatId),
    Group(PatId, PatId),
    Interleave(PatId, PatId),
    OneOrMore(PatId),
    List(PatId),
    Attribute(Box<NameClass>, PatId),
    Element(Box<NameClass>, PatId),
    Ref(DefineId),
    Data(Box<Datatypes>),
    DataExcept(Box<Datatypes>, PatId),
    Value(Box<DatatypeValues>),
}

#[derive(Debug)]
pub struct Define {
    pub name: String,
    pub pattern: PatId,
}

/// An immutable compiled schema. Shared freely across validation sessions;
/// all mutable state lives in the walkers.
#[derive(Debug)]
pub struct Schema {
    patterns: Vec<Pattern>,
    defines: Vec<Define>,
    start: PatId,
    namespaces: Vec<String>,
    element_index: FnvHashMap<ExpandedName, Vec<PatId>>,
    context_independent: bool,
}

impl Schema {
    pub fn pattern(&self, id: PatId) -> &Pattern {
        &self.patterns[id.index()]
    }

    pub fn define(&self, id: DefineId) -> &Define {
        &self.defines[id.index()]
    }

    pub fn start(&self) -> PatId {
        self.start
    }

    /// Namespaces mentioned by element and attribute name classes, with the
    /// `*` / `::except` wildcard markers.
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Element patterns whose name class names this expanded name exactly.
    /// Drives misplaced-tag recovery.
    pub fn element_definitions(&self, name: &ExpandedName) -> &[PatId] {
        self.element_index
            .get(name)
            .map(|v| &v[..])
            .unwrap_or(&[])
    }

    /// True when every element name maps to exactly one element pattern, so
    /// a tag name alone determines its content model.
    pub fn context_independent(&self) -> bool {
        self.context_independent
    }

    /// Build the pattern tree from a fully simplified grammar.
    pub fn compile(tree: &Tree, root: NodeId) -> Result<Schema, SchemaError> {
        if tree.name(root) != "grammar" {
            return Err(SchemaError::InvalidSchema {
                path: tree.path(root),
                detail: "expected a simplified grammar root".to_string(),
            });
        }
        let mut builder = Builder {
            tree,
            memo: FnvHashMap::default(),
            patterns: Vec::new(),
            define_ids: HashMap::new(),
            defines: Vec::new(),
        };

        let components = tree.element_children(root);
        let mut start_node = None;
        for &component in &components {
            match tree.name(component) {
                "start" => start_node = Some(component),
                "define" => {
                    let name = tree
                        .attr(component, "name")
                        .ok_or_else(|| builder.invalid(component, "define without a name"))?
                        .to_string();
                    let id = DefineId(builder.defines.len() as u32);
                    builder.defines.push(Define {
                        name: name.clone(),
                        // patched below once the body has been compiled
                        pattern: PatId(0),
                    });
                    builder.define_ids.insert(name, id);
                }
                other => {
                    let detail = format!("unexpected {} among grammar components", other);
                    return Err(builder.invalid(component, &detail));
                }
            }
        }

        for &component in &components {
            if tree.name(component) == "define" {
                let name = tree.attr(component, "name").unwrap().to_string();
                let body = tree
                    .element_children(component)
                    .first()
                    .copied()
                    .ok_or_else(|| builder.invalid(component, "define without content"))?;
                let pattern = builder.compile_pattern(body)?;
                let id = builder.define_ids[&name];
                builder.defines[id.index()].pattern = pattern;
            }
        }

        // A define whose body is nothing but a chain of refs back to itself
        // would loop forever when a walker is built for it.
        for index in 0..builder.defines.len() {
            let mut seen = std::collections::HashSet::new();
            let mut cursor = builder.defines[index].pattern;
            while let Pattern::Ref(next) = builder.patterns[cursor.index()].clone() {
                if !seen.insert(next) {
                    return Err(SchemaError::RefError {
                        path: tree.path(root),
                        name: builder.defines[index].name.clone(),
                    });
                }
                cursor = builder.defines[next.index()].pattern;
            }
        }

        let start_node =
            start_node.ok_or_else(|| SchemaError::MissingStart { path: tree.path(root) })?;
        let start_body = tree
            .element_children(start_node)
            .first()
            .copied()
            .ok_or_else(|| builder.invalid(start_node, "start without content"))?;
        let start = builder.compile_pattern(start_body)?;

        let mut namespaces = BTreeSet::new();
        let mut element_index: FnvHashMap<ExpandedName, Vec<PatId>> = FnvHashMap::default();
        let mut all_simple = true;
        for (i, pattern) in builder.patterns.iter().enumerate() {
            match pattern {
                Pattern::Element(nc, _) => {
                    namespaces.extend(nc.namespaces());
                    match nc.names() {
                        Some(names) => {
                            for name in names {
                                element_index.entry(name).or_default().push(PatId(i as u32));
                            }
                        }
                        None => all_simple = false,
                    }
                }
                Pattern::Attribute(nc, _) => {
                    namespaces.extend(nc.namespaces());
                }
                _ => {}
            }
        }
        let context_independent =
            all_simple && element_index.values().all(|pats| pats.len() == 1);

        Ok(Schema {
            patterns: builder.patterns,
            defines: builder.defines,
            start,
            namespaces: namespaces.into_iter().collect(),
            element_index,
            context_independent,
        })
    }
}

struct Builder<'a> {
    tree: &'a Tree,
    memo: FnvHashMap<Pattern, PatId>,
    patterns: Vec<Pattern>,
    define_ids: HashMap<String, DefineId>,
    defines: Vec<Define>,
}

/// Context-free lookup for datatypes that do not need one.
struct NoContext;

impl Namespaces for NoContext {
    fn resolve(&self, _prefix: &str) -> Option<&str> {
        None
    }
}

impl<'a> Builder<'a> {
    fn invalid(&self, node: NodeId, detail: &str) -> SchemaError {
        SchemaError::InvalidSchema {
            path: self.tree.path(node),
            detail: detail.to_string(),
        }
    }

    fn push(&mut self, pattern: Pattern) -> PatId {
        if let Some(&id) = self.memo.get(&pattern) {
            return id;
        }
        let id = PatId(self.patterns.len() as u32);
        self.memo.insert(pattern.clone(), id);
        self.patterns.push(pattern);
        id
    }

    fn binary(
        &mut self,
        node: NodeId,
        ctor: fn(PatId, PatId) -> Pattern,
    ) -> Result<PatId, SchemaError> {
        let kids = self.tree.element_children(node);
        if kids.len() != 2 {
            return Err(self.invalid(node, "combinator is not binary"));
        }
        let a = self.compile_pattern(kids[0])?;
        let b = self.compile_pattern(kids[1])?;
        Ok(self.push(ctor(a, b)))
    }

    fn unary_child(&mut self, node: NodeId) -> Result<PatId, SchemaError> {
        let kids = self.tree.element_children(node);
        if kids.len() != 1 {
            return Err(self.invalid(node, "expected exactly one child pattern"));
        }
        self.compile_pattern(kids[0])
    }

    fn compile_pattern(&mut self, node: NodeId) -> Result<PatId, SchemaError> {
        match self.tree.name(node) {
            "empty" => Ok(self.push(Pattern::Empty)),
            "notAllowed" => Ok(self.push(Pattern::NotAllowed)),
            "text" => Ok(self.push(Pattern::Text)),
            "choice" => self.binary(node, Pattern::Choice),
            "group" => self.binary(node, Pattern::Group),
            "interleave" => self.binary(node, Pattern::Interleave),
            "oneOrMore" => {
                let child = self.unary_child(node)?;
                Ok(self.push(Pattern::OneOrMore(child)))
            }
            "list" => {
                let child = self.unary_child(node)?;
                Ok(self.push(Pattern::List(child)))
            }
            "attribute" | "element" => {
                let kids = self.tree.element_children(node);
                if kids.len() != 2 {
                    return Err(self.invalid(node, "expected a name class and a content pattern"));
                }
                let nc = Box::new(name_class_of(self.tree, kids[0])?);
                let child = self.compile_pattern(kids[1])?;
                if self.tree.name(node) == "attribute" {
                    Ok(self.push(Pattern::Attribute(nc, child)))
                } else {
                    Ok(self.push(Pattern::Element(nc, child)))
                }
            }
            "ref" => {
                let name = self
                    .tree
                    .attr(node, "name")
                    .ok_or_else(|| self.invalid(node, "ref without a name"))?;
                let id = self
                    .define_ids
                    .get(name)
                    .copied()
                    .ok_or_else(|| SchemaError::RefError {
                        path: self.tree.path(node),
                        name: name.to_string(),
                    })?;
                Ok(self.push(Pattern::Ref(id)))
            }
            "data" => self.compile_data(node),
            "value" => self.compile_value(node),
            other => {
                let detail = format!("unexpected pattern element {}", other);
                Err(self.invalid(node, &detail))
            }
        }
    }

    fn compile_data(&mut self, node: NodeId) -> Result<PatId, SchemaError> {
        let path = self.tree.path(node);
        let library = self.tree.attr(node, "datatypeLibrary").unwrap_or("");
        let type_name = self
            .tree
            .attr(node, "type")
            .ok_or_else(|| self.invalid(node, "data without a type"))?;
        let mut params = Vec::new();
        let mut except = None;
        for child in self.tree.element_children(node) {
            match self.tree.name(child) {
                "param" => {
                    let name = self
                        .tree
                        .attr(child, "name")
                        .ok_or_else(|| self.invalid(child, "param without a name"))?
                        .to_string();
                    params.push(Param {
                        name,
                        value: self.tree.text_content(child),
                    });
                }
                "except" => {
                    let body = self
                        .tree
                        .element_children(child)
                        .first()
                        .copied()
                        .ok_or_else(|| self.invalid(child, "except without content"))?;
                    except = Some(self.compile_pattern(body)?);
                }
                other => {
                    let detail = format!("unexpected {} inside data", other);
                    return Err(self.invalid(child, &detail));
                }
            }
        }
        let datatype = Box::new(datatype::compile_datatype(
            &path, library, type_name, &params,
        )?);
        Ok(match except {
            Some(except) => self.push(Pattern::DataExcept(datatype, except)),
            None => self.push(Pattern::Data(datatype)),
        })
    }

    fn compile_value(&mut self, node: NodeId) -> Result<PatId, SchemaError> {
        let path = self.tree.path(node);
        let library = self.tree.attr(node, "datatypeLibrary").unwrap_or("");
        let type_name = self.tree.attr(node, "type").unwrap_or("token");
        let text = self.tree.text_content(node);
        let value = if datatype::needs_context(library, type_name) {
            // Step 18 rewrote the body to `(ns attribute, local name)` form.
            let qname = xsd::QNameVal {
                namespace_uri: self.tree.attr(node, "ns").unwrap_or("").to_string(),
                local_name: text.trim().to_string(),
            };
            if type_name == "NOTATION" {
                DatatypeValues::Xsd(xsd::XsdDatatypeValues::Notation(qname))
            } else {
                DatatypeValues::Xsd(xsd::XsdDatatypeValues::QName(qname))
            }
        } else {
            datatype::compile_value(&path, library, type_name, &text, &NoContext)?
        };
        Ok(self.push(Pattern::Value(Box::new(value))))
    }
}

/// Read a name-class element (`name`, `anyName`, `nsName`, `choice`) into a
/// [`NameClass`].
pub fn name_class_of(tree: &Tree, node: NodeId) -> Result<NameClass, SchemaError> {
    match tree.name(node) {
        "name" => Ok(NameClass::Named {
            namespace_uri: tree.attr(node, "ns").unwrap_or("").to_string(),
            name: tree.text_content(node).trim().to_string(),
        }),
        "anyName" => Ok(NameClass::AnyName {
            except: except_of(tree, node)?,
        }),
        "nsName" => Ok(NameClass::NsName {
            namespace_uri: tree.attr(node, "ns").unwrap_or("").to_string(),
            except: except_of(tree, node)?,
        }),
        "choice" => {
            let kids = tree.element_children(node);
            if kids.len() != 2 {
                return Err(SchemaError::InvalidSchema {
                    path: tree.path(node),
                    detail: "name-class choice is not binary".to_string(),
                });
            }
            Ok(NameClass::alt(
                name_class_of(tree, kids[0])?,
                name_class_of(tree, kids[1])?,
            ))
        }
        other => Err(SchemaError::InvalidSchema {
            path: tree.path(node),
            detail: format!("{} is not a name class", other),
        }),
    }
}

fn except_of(tree: &Tree, node: NodeId) -> Result<Option<Box<NameClass>>, SchemaError> {
    for child in tree.element_children(node) {
        if tree.name(child) == "except" {
            let body = tree
                .element_children(child)
                .first()
                .copied()
                .ok_or_else(|| SchemaError::InvalidSchema {
                    path: tree.path(child),
                    detail: "except without content".to_string(),
                })?;
            return Ok(Some(Box::new(name_class_of(tree, body)?)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simplify::tests::MapResources;
    use crate::Compiler;
    use std::collections::HashMap as Map;
    use url::Url;

    const NS: &str = "http://relaxng.org/ns/structure/1.0";

    fn compile(schema: &str) -> Schema {
        let mut map = Map::new();
        map.insert("file:///main.rng".to_string(), schema.to_string());
        let compiler = Compiler::new(MapResources(map));
        let url = Url::parse("file:///main.rng").unwrap();
        compiler.compile(&url).expect("compile failed").schema
    }

    #[test]
    fn empty_element_schema() {
        let schema = compile(&format!(
            r#"<element name="a" xmlns="{}"><empty/></element>"#,
            NS
        ));
        match schema.pattern(schema.start()) {
            Pattern::Element(nc, child) => {
                assert!(nc.contains("", "a"));
                assert!(matches!(schema.pattern(*child), Pattern::Empty));
            }
            other => panic!("unexpected start pattern {:?}", other),
        }
        assert!(schema.context_independent());
        assert_eq!(
            schema
                .element_definitions(&ExpandedName::new("", "a"))
                .len(),
            1
        );
    }

    #[test]
    fn refs_resolve_to_defines() {
        let schema = compile(&format!(
            r#"<grammar xmlns="{}">
                 <start><ref name="doc"/></start>
                 <define name="doc"><element name="doc"><text/></element></define>
               </grammar>"#,
            NS
        ));
        match schema.pattern(schema.start()) {
            Pattern::Ref(id) => {
                let define = schema.define(*id);
                assert!(matches!(
                    schema.pattern(define.pattern),
                    Pattern::Element(_, _)
                ));
            }
            other => panic!("unexpected start pattern {:?}", other),
        }
    }

    #[test]
    fn identical_subpatterns_are_interned() {
        let schema = compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <choice>
                   <element name="b"><empty/></element>
                   <element name="c"><empty/></element>
                 </choice>
               </element>"#,
            NS
        ));
        let (b, c) = match schema.pattern(schema.start()) {
            Pattern::Element(_, content) => match schema.pattern(*content) {
                Pattern::Choice(b, c) => (*b, *c),
                other => panic!("expected a choice, got {:?}", other),
            },
            other => panic!("unexpected start {:?}", other),
        };
        let empty_of = |id: PatId| match schema.pattern(id) {
            Pattern::Element(_, child) => *child,
            other => panic!("expected element, got {:?}", other),
        };
        assert_eq!(empty_of(b), empty_of(c));
    }

    #[test]
    fn wildcard_elements_are_not_context_independent() {
        let schema = compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <zeroOrMore><element><anyName/><text/></element></zeroOrMore>
               </element>"#,
            NS
        ));
        assert!(!schema.context_independent());
        assert!(schema.namespaces().contains(&"*".to_string()));
    }

    #[test]
    fn qname_value_uses_rewritten_form() {
        let schema = compile(&format!(
            r#"<element name="a" xmlns="{}" xmlns:p="urn:q"
                    datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
                 <value type="QName">p:local</value>
               </element>"#,
            NS
        ));
        let value = match schema.pattern(schema.start()) {
            Pattern::Element(_, content) => match schema.pattern(*content) {
                Pattern::Value(v) => (**v).clone(),
                other => panic!("expected value, got {:?}", other),
            },
            other => panic!("unexpected start {:?}", other),
        };
        match value {
            DatatypeValues::Xsd(xsd::XsdDatatypeValues::QName(q)) => {
                assert_eq!(q.namespace_uri, "urn:q");
                assert_eq!(q.local_name, "local");
            }
            other => panic!("unexpected value {:?}", other),
        }
    }
}
