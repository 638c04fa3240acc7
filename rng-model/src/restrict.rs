//! Contextual restrictions on the simplified schema (RELAX NG sections
//! 7.1–7.4).
//!
//! One recursive traversal carries a record of the restriction-relevant
//! contexts and computes, for each subtree, its content type, the
//! attribute name classes it can start with, and whether it can match
//! text. The checks run on the fully simplified tree, so every combinator
//! here is strictly binary and `notAllowed`/`empty` have already been
//! propagated away.

use crate::name_class::NameClass;
use crate::pattern::name_class_of;
use crate::SchemaError;
use rng_syntax::tree::{NodeId, Tree};
use std::collections::{HashMap, HashSet};

const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns";

pub fn check(tree: &Tree, grammar: NodeId) -> Result<(), SchemaError> {
    let mut defines = HashMap::new();
    let mut start = None;
    for child in tree.element_children(grammar) {
        match tree.name(child) {
            "start" => start = Some(child),
            "define" => {
                if let Some(name) = tree.attr(child, "name") {
                    defines.insert(name.to_string(), child);
                }
            }
            _ => {}
        }
    }
    let checker = Checker { tree, defines };

    if let Some(start) = start {
        if let Some(body) = tree.element_children(start).first().copied() {
            let ctx = Ctx {
                in_start: true,
                ..Ctx::default()
            };
            let mut seen = HashSet::new();
            checker.check_pattern(body, ctx, &mut seen)?;
        }
    }

    for &define in checker.defines.values() {
        if let Some(body) = tree.element_children(define).first().copied() {
            let mut seen = HashSet::new();
            let info = checker.check_pattern(body, Ctx::default(), &mut seen)?;
            if info.content.is_none() {
                return Err(SchemaError::StringValueConstraint {
                    path: tree.path(body),
                });
            }
        }
    }
    Ok(())
}

/// Which restriction-relevant constructs enclose the current pattern.
#[derive(Default, Clone, Copy)]
struct Ctx {
    in_start: bool,
    in_attribute: bool,
    in_list: bool,
    in_data_except: bool,
    in_one_or_more: bool,
    in_group_of_one_or_more: bool,
    in_interleave_of_one_or_more: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum ContentType {
    Empty,
    Complex,
    Simple,
}

struct Info {
    /// `None` is the undefined content type of section 7.2.
    content: Option<ContentType>,
    attributes: Vec<NameClass>,
    text: bool,
}

impl Info {
    fn leaf(content: ContentType) -> Info {
        Info {
            content: Some(content),
            attributes: Vec::new(),
            text: false,
        }
    }
}

fn forbidden(ctx: Ctx, element: &str) -> Option<&'static str> {
    if ctx.in_start
        && matches!(
            element,
            "attribute"
                | "data"
                | "value"
                | "text"
                | "list"
                | "group"
                | "interleave"
                | "oneOrMore"
                | "empty"
        )
    {
        return Some("start");
    }
    if ctx.in_attribute && matches!(element, "attribute" | "ref" | "element") {
        return Some("attribute");
    }
    if ctx.in_list
        && matches!(
            element,
            "list" | "ref" | "attribute" | "text" | "interleave" | "element"
        )
    {
        return Some("list");
    }
    if ctx.in_data_except
        && matches!(
            element,
            "attribute"
                | "ref"
                | "text"
                | "list"
                | "group"
                | "interleave"
                | "oneOrMore"
                | "empty"
                | "element"
        )
    {
        return Some("data/except");
    }
    if ctx.in_group_of_one_or_more && element == "attribute" {
        return Some("oneOrMore//group");
    }
    if ctx.in_interleave_of_one_or_more && element == "attribute" {
        return Some("oneOrMore//interleave");
    }
    None
}

struct Checker<'a> {
    tree: &'a Tree,
    defines: HashMap<String, NodeId>,
}

impl<'a> Checker<'a> {
    fn check_pattern(
        &self,
        node: NodeId,
        ctx: Ctx,
        seen: &mut HashSet<String>,
    ) -> Result<Info, SchemaError> {
        let element = self.tree.name(node);
        if let Some(context) = forbidden(ctx, element) {
            return Err(SchemaError::ProhibitedPath {
                path: self.tree.path(node),
                context,
                element: element.to_string(),
            });
        }

        match element {
            "empty" | "notAllowed" => Ok(Info::leaf(ContentType::Empty)),
            "text" => Ok(Info {
                content: Some(ContentType::Complex),
                attributes: Vec::new(),
                text: true,
            }),
            "value" => Ok(Info::leaf(ContentType::Simple)),
            "data" => {
                for child in self.tree.element_children(node) {
                    if self.tree.name(child) == "except" {
                        if let Some(body) = self.tree.element_children(child).first().copied() {
                            let except_ctx = Ctx {
                                in_data_except: true,
                                ..Ctx::default()
                            };
                            self.check_pattern(body, except_ctx, seen)?;
                        }
                    }
                }
                Ok(Info::leaf(ContentType::Simple))
            }
            "list" => {
                let body = self.single_child(node)?;
                let list_ctx = Ctx {
                    in_list: true,
                    ..Ctx::default()
                };
                self.check_pattern(body, list_ctx, seen)?;
                Ok(Info::leaf(ContentType::Simple))
            }
            "element" => {
                let (nc, body) = self.name_class_and_body(node)?;
                self.check_except_structure(&nc, node)?;
                let info = self.check_pattern(body, Ctx::default(), seen)?;
                if info.content.is_none() {
                    return Err(SchemaError::StringValueConstraint {
                        path: self.tree.path(body),
                    });
                }
                Ok(Info::leaf(ContentType::Complex))
            }
            "attribute" => {
                let (nc, body) = self.name_class_and_body(node)?;
                self.check_except_structure(&nc, node)?;
                self.check_attribute_name(&nc, node)?;
                if !nc.simple() && !ctx.in_one_or_more {
                    return Err(SchemaError::UnboundedAttributeName {
                        path: self.tree.path(node),
                    });
                }
                let attr_ctx = Ctx {
                    in_attribute: true,
                    ..Ctx::default()
                };
                let info = self.check_pattern(body, attr_ctx, seen)?;
                if info.content.is_none() {
                    return Err(SchemaError::StringValueConstraint {
                        path: self.tree.path(body),
                    });
                }
                Ok(Info {
                    content: Some(ContentType::Empty),
                    attributes: vec![nc],
                    text: false,
                })
            }
            "ref" => {
                let name = self
                    .tree
                    .attr(node, "name")
                    .ok_or_else(|| SchemaError::RefError {
                        path: self.tree.path(node),
                        name: String::new(),
                    })?;
                let define =
                    self.defines
                        .get(name)
                        .copied()
                        .ok_or_else(|| SchemaError::RefError {
                            path: self.tree.path(node),
                            name: name.to_string(),
                        })?;
                if !seen.insert(name.to_string()) {
                    // a cycle is necessarily element-mediated
                    return Ok(Info::leaf(ContentType::Complex));
                }
                let body = self.single_child(define)?;
                let followed = self.check_pattern(body, ctx, seen)?;
                Ok(Info {
                    content: Some(ContentType::Complex),
                    attributes: followed.attributes,
                    text: followed.text,
                })
            }
            "choice" => {
                let (a, b) = self.two_children(node)?;
                let left = self.check_pattern(a, ctx, seen)?;
                let right = self.check_pattern(b, ctx, seen)?;
                let content = match (left.content, right.content) {
                    (Some(l), Some(r)) => Some(l.max(r)),
                    _ => None,
                };
                Ok(Info {
                    content,
                    attributes: concat(left.attributes, right.attributes),
                    text: left.text || right.text,
                })
            }
            "group" | "interleave" => {
                let (a, b) = self.two_children(node)?;
                let mut child_ctx = ctx;
                if ctx.in_one_or_more {
                    if element == "group" {
                        child_ctx.in_group_of_one_or_more = true;
                    } else {
                        child_ctx.in_interleave_of_one_or_more = true;
                    }
                }
                let left = self.check_pattern(a, child_ctx, seen)?;
                let right = self.check_pattern(b, child_ctx, seen)?;

                for x in &left.attributes {
                    for y in &right.attributes {
                        if x.intersects(y) {
                            return Err(SchemaError::AttributeNameClash {
                                path: self.tree.path(node),
                            });
                        }
                    }
                }
                if element == "interleave" {
                    if left.text && right.text {
                        return Err(SchemaError::InterleaveTextClash {
                            path: self.tree.path(node),
                        });
                    }
                    let mut left_elems = Vec::new();
                    let mut right_elems = Vec::new();
                    self.collect_elements(a, &mut left_elems, &mut HashSet::new())?;
                    self.collect_elements(b, &mut right_elems, &mut HashSet::new())?;
                    for x in &left_elems {
                        for y in &right_elems {
                            if x.intersects(y) {
                                return Err(SchemaError::InterleaveElementClash {
                                    path: self.tree.path(node),
                                });
                            }
                        }
                    }
                }

                let content = match (left.content, right.content) {
                    (Some(ContentType::Empty), r) => r,
                    (l, Some(ContentType::Empty)) => l,
                    (Some(ContentType::Complex), Some(ContentType::Complex)) => {
                        Some(ContentType::Complex)
                    }
                    _ => None,
                };
                Ok(Info {
                    content,
                    attributes: concat(left.attributes, right.attributes),
                    text: left.text || right.text,
                })
            }
            "oneOrMore" => {
                let body = self.single_child(node)?;
                let mut child_ctx = ctx;
                child_ctx.in_one_or_more = true;
                let info = self.check_pattern(body, child_ctx, seen)?;
                let content = match info.content {
                    Some(ContentType::Simple) => None,
                    other => other,
                };
                Ok(Info {
                    content,
                    attributes: info.attributes,
                    text: info.text,
                })
            }
            other => Err(SchemaError::InvalidSchema {
                path: self.tree.path(node),
                detail: format!("unexpected pattern element {}", other),
            }),
        }
    }

    fn single_child(&self, node: NodeId) -> Result<NodeId, SchemaError> {
        self.tree
            .element_children(node)
            .first()
            .copied()
            .ok_or_else(|| SchemaError::InvalidSchema {
                path: self.tree.path(node),
                detail: "missing content pattern".to_string(),
            })
    }

    fn two_children(&self, node: NodeId) -> Result<(NodeId, NodeId), SchemaError> {
        let kids = self.tree.element_children(node);
        if kids.len() != 2 {
            return Err(SchemaError::InvalidSchema {
                path: self.tree.path(node),
                detail: "combinator is not binary".to_string(),
            });
        }
        Ok((kids[0], kids[1]))
    }

    fn name_class_and_body(&self, node: NodeId) -> Result<(NameClass, NodeId), SchemaError> {
        let kids = self.tree.element_children(node);
        if kids.len() != 2 {
            return Err(SchemaError::InvalidSchema {
                path: self.tree.path(node),
                detail: "expected a name class and a content pattern".to_string(),
            });
        }
        Ok((name_class_of(self.tree, kids[0])?, kids[1]))
    }

    /// 7.1.1: an `except` inside `anyName` must not contain `anyName`; an
    /// `except` inside `nsName` must contain neither `nsName` nor `anyName`.
    fn check_except_structure(&self, nc: &NameClass, node: NodeId) -> Result<(), SchemaError> {
        match nc {
            NameClass::AnyName { except: Some(e) } => self.forbid_in_except(e, node, false),
            NameClass::NsName {
                except: Some(e), ..
            } => self.forbid_in_except(e, node, true),
            NameClass::Alt { a, b } => {
                self.check_except_structure(a, node)?;
                self.check_except_structure(b, node)
            }
            _ => Ok(()),
        }
    }

    fn forbid_in_except(
        &self,
        nc: &NameClass,
        node: NodeId,
        ns_context: bool,
    ) -> Result<(), SchemaError> {
        match nc {
            NameClass::AnyName { .. } => Err(SchemaError::ProhibitedPath {
                path: self.tree.path(node),
                context: if ns_context {
                    "nsName//except"
                } else {
                    "anyName//except"
                },
                element: "anyName".to_string(),
            }),
            NameClass::NsName { except, .. } => {
                if ns_context {
                    return Err(SchemaError::ProhibitedPath {
                        path: self.tree.path(node),
                        context: "nsName//except",
                        element: "nsName".to_string(),
                    });
                }
                match except {
                    Some(e) => self.forbid_in_except(e, node, ns_context),
                    None => Ok(()),
                }
            }
            NameClass::Alt { a, b } => {
                self.forbid_in_except(a, node, ns_context)?;
                self.forbid_in_except(b, node, ns_context)
            }
            NameClass::Named { .. } => Ok(()),
        }
    }

    /// 7.1.1: attributes may not be named `xmlns` nor live in the xmlns
    /// namespace.
    fn check_attribute_name(&self, nc: &NameClass, node: NodeId) -> Result<(), SchemaError> {
        let bad = |detail: &str| SchemaError::InvalidSchema {
            path: self.tree.path(node),
            detail: detail.to_string(),
        };
        match nc {
            NameClass::Named {
                namespace_uri,
                name,
            } => {
                if namespace_uri.is_empty() && name == "xmlns" {
                    return Err(bad("attribute must not be named xmlns"));
                }
                if namespace_uri == XMLNS_NAMESPACE {
                    return Err(bad("attribute must not be in the xmlns namespace"));
                }
                Ok(())
            }
            NameClass::NsName { namespace_uri, .. } => {
                if namespace_uri == XMLNS_NAMESPACE {
                    return Err(bad("attribute must not be in the xmlns namespace"));
                }
                Ok(())
            }
            NameClass::AnyName { .. } => Ok(()),
            NameClass::Alt { a, b } => {
                self.check_attribute_name(a, node)?;
                self.check_attribute_name(b, node)
            }
        }
    }

    /// Element name classes reachable without entering element content,
    /// following refs.
    fn collect_elements(
        &self,
        node: NodeId,
        out: &mut Vec<NameClass>,
        seen: &mut HashSet<String>,
    ) -> Result<(), SchemaError> {
        match self.tree.name(node) {
            "element" => {
                let kids = self.tree.element_children(node);
                if let Some(&nc_node) = kids.first() {
                    out.push(name_class_of(self.tree, nc_node)?);
                }
                Ok(())
            }
            "ref" => {
                let name = self.tree.attr(node, "name").unwrap_or("");
                if !seen.insert(name.to_string()) {
                    return Ok(());
                }
                if let Some(&define) = self.defines.get(name) {
                    if let Some(body) = self.tree.element_children(define).first().copied() {
                        self.collect_elements(body, out, seen)?;
                    }
                }
                Ok(())
            }
            "choice" | "group" | "interleave" | "oneOrMore" | "list" => {
                for child in self.tree.element_children(node) {
                    self.collect_elements(child, out, seen)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn concat(mut a: Vec<NameClass>, b: Vec<NameClass>) -> Vec<NameClass> {
    a.extend(b);
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simplify::tests::MapResources;
    use crate::Compiler;
    use std::collections::HashMap as Map;
    use url::Url;

    const NS: &str = "http://relaxng.org/ns/structure/1.0";

    fn try_compile(schema: &str) -> Result<(), SchemaError> {
        let mut map = Map::new();
        map.insert("file:///main.rng".to_string(), schema.to_string());
        let compiler = Compiler::new(MapResources(map));
        let url = Url::parse("file:///main.rng").unwrap();
        compiler.compile(&url).map(|_| ())
    }

    #[test]
    fn interleave_text_clash_is_fatal() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <interleave><text/><text/></interleave>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::InterleaveTextClash { .. }));
    }

    #[test]
    fn interleave_element_clash_is_fatal() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <interleave>
                   <element name="b"><empty/></element>
                   <element name="b"><text/></element>
                 </interleave>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::InterleaveElementClash { .. }));
    }

    #[test]
    fn interleave_element_clash_reaches_through_refs() {
        let err = try_compile(&format!(
            r#"<grammar xmlns="{}">
                 <start><ref name="root"/></start>
                 <define name="root">
                   <element name="root">
                     <interleave><ref name="x"/><ref name="y"/></interleave>
                   </element>
                 </define>
                 <define name="x"><element name="same"><empty/></element></define>
                 <define name="y"><element name="same"><empty/></element></define>
               </grammar>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::InterleaveElementClash { .. }));
    }

    #[test]
    fn attribute_name_clash_in_group() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <group>
                   <attribute name="x"><text/></attribute>
                   <attribute name="x"><text/></attribute>
                 </group>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::AttributeNameClash { .. }));
    }

    #[test]
    fn attribute_forbidden_under_start() {
        let err = try_compile(&format!(
            r#"<grammar xmlns="{}">
                 <start><attribute name="a"><text/></attribute></start>
               </grammar>"#,
            NS
        ))
        .unwrap_err();
        assert!(
            matches!(err, SchemaError::ProhibitedPath { context: "start", .. }),
            "got {:?}",
            err
        );
    }

    #[test]
    fn attribute_forbidden_in_one_or_more_group() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <oneOrMore>
                   <group>
                     <attribute name="x"><text/></attribute>
                     <element name="b"><empty/></element>
                   </group>
                 </oneOrMore>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::ProhibitedPath {
                context: "oneOrMore//group",
                ..
            }
        ));
    }

    #[test]
    fn wildcard_attribute_requires_one_or_more() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <attribute><anyName/><text/></attribute>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnboundedAttributeName { .. }));

        assert!(try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <zeroOrMore><attribute><anyName/><text/></attribute></zeroOrMore>
               </element>"#,
            NS
        ))
        .is_ok());
    }

    #[test]
    fn text_forbidden_in_list() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <list><text/></list>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::ProhibitedPath { context: "list", .. }
        ));
    }

    #[test]
    fn data_except_rejects_text() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}"
                    datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
                 <data type="token"><except><text/></except></data>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::ProhibitedPath {
                context: "data/except",
                ..
            }
        ));
    }

    #[test]
    fn simple_content_cannot_be_grouped_with_complex() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}"
                    datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
                 <group><data type="int"/><text/></group>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::StringValueConstraint { .. }));
    }

    #[test]
    fn xmlns_attribute_is_rejected() {
        let err = try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <attribute name="xmlns"><text/></attribute>
               </element>"#,
            NS
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidSchema { .. }));
    }

    #[test]
    fn clean_schemas_pass() {
        assert!(try_compile(&format!(
            r#"<element name="a" xmlns="{}">
                 <interleave>
                   <element name="b"><empty/></element>
                   <group><element name="c"><empty/></element><text/></group>
                 </interleave>
               </element>"#,
            NS
        ))
        .is_ok());
    }
}
