//! The expanded-name resolver.
//!
//! A stack of namespace contexts, one per document scope. Each context maps
//! prefixes to URIs and keeps the reverse mapping so diagnostics can turn
//! an expanded name back into something the document author recognizes.
//! Single-session use; the validator owns exactly one.

use rng_model::datatype::Namespaces;
use rng_model::ExpandedName;
use std::collections::HashMap;
use std::fmt;

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
pub const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

#[derive(Debug, PartialEq, Eq)]
pub enum ResolverError {
    /// More than one colon, or an empty prefix/local part.
    MalformedName { name: String },
    UndefinedPrefix { prefix: String },
    /// `xmlns` may not be bound; `xml` may not be re-bound elsewhere.
    ReservedPrefix { prefix: String },
    /// Attempted to pop the default context.
    NoOpenContext,
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverError::MalformedName { name } => {
                write!(f, "malformed qualified name {:?}", name)
            }
            ResolverError::UndefinedPrefix { prefix } => {
                write!(f, "undefined namespace prefix {:?}", prefix)
            }
            ResolverError::ReservedPrefix { prefix } => {
                write!(f, "prefix {:?} is reserved", prefix)
            }
            ResolverError::NoOpenContext => f.write_str("no context to leave"),
        }
    }
}

impl std::error::Error for ResolverError {}

#[derive(Default)]
struct Context {
    forward: HashMap<String, String>,
    backward: HashMap<String, Vec<String>>,
}

impl Context {
    fn bind(&mut self, prefix: &str, uri: &str) {
        if let Some(old) = self.forward.insert(prefix.to_string(), uri.to_string()) {
            if let Some(prefixes) = self.backward.get_mut(&old) {
                prefixes.retain(|p| p != prefix);
            }
        }
        self.backward
            .entry(uri.to_string())
            .or_default()
            .push(prefix.to_string());
    }
}

pub struct NameResolver {
    contexts: Vec<Context>,
}

impl Default for NameResolver {
    fn default() -> Self {
        NameResolver::new()
    }
}

impl NameResolver {
    pub fn new() -> NameResolver {
        let mut base = Context::default();
        base.bind("xml", XML_NAMESPACE);
        base.bind("xmlns", XMLNS_NAMESPACE);
        NameResolver {
            contexts: vec![base],
        }
    }

    pub fn enter_context(&mut self) {
        self.contexts.push(Context::default());
    }

    pub fn leave_context(&mut self) -> Result<(), ResolverError> {
        if self.contexts.len() == 1 {
            return Err(ResolverError::NoOpenContext);
        }
        self.contexts.pop();
        Ok(())
    }

    pub fn define_prefix(&mut self, prefix: &str, uri: &str) -> Result<(), ResolverError> {
        if prefix == "xmlns" {
            return Err(ResolverError::ReservedPrefix {
                prefix: prefix.to_string(),
            });
        }
        if prefix == "xml" && uri != XML_NAMESPACE {
            return Err(ResolverError::ReservedPrefix {
                prefix: prefix.to_string(),
            });
        }
        self.contexts
            .last_mut()
            .expect("default context always present")
            .bind(prefix, uri);
        Ok(())
    }

    fn prefix_to_uri(&self, prefix: &str) -> Option<&str> {
        self.contexts
            .iter()
            .rev()
            .find_map(|ctx| ctx.forward.get(prefix))
            .map(|s| &s[..])
    }

    /// Split a qualified name on its single colon and resolve the prefix.
    /// Unprefixed attribute names live in no namespace; unprefixed element
    /// names use the default prefix.
    pub fn resolve_name(
        &self,
        name: &str,
        is_attribute: bool,
    ) -> Result<ExpandedName, ResolverError> {
        let mut parts = name.split(':');
        let first = parts.next().unwrap_or("");
        match (parts.next(), parts.next()) {
            (None, _) => {
                if is_attribute {
                    Ok(ExpandedName::new("", name))
                } else {
                    Ok(ExpandedName::new(
                        self.prefix_to_uri("").unwrap_or(""),
                        name,
                    ))
                }
            }
            (Some(local), None) => {
                if first.is_empty() || local.is_empty() {
                    return Err(ResolverError::MalformedName {
                        name: name.to_string(),
                    });
                }
                let uri = self
                    .prefix_to_uri(first)
                    .ok_or_else(|| ResolverError::UndefinedPrefix {
                        prefix: first.to_string(),
                    })?;
                Ok(ExpandedName::new(uri, local))
            }
            (Some(_), Some(_)) => Err(ResolverError::MalformedName {
                name: name.to_string(),
            }),
        }
    }

    /// Turn an expanded name back into a qualified name using any in-scope
    /// prefix for the URI. The prefix may differ from the one originally
    /// seen when several alias the same URI.
    pub fn unresolve_name(&self, uri: &str, local: &str) -> Option<String> {
        if uri.is_empty() {
            return Some(local.to_string());
        }
        for ctx in self.contexts.iter().rev() {
            if let Some(prefixes) = ctx.backward.get(uri) {
                for prefix in prefixes.iter().rev() {
                    // a deeper context may have re-bound this prefix
                    if self.prefix_to_uri(prefix) == Some(uri) {
                        return Some(if prefix.is_empty() {
                            local.to_string()
                        } else {
                            format!("{}:{}", prefix, local)
                        });
                    }
                }
            }
        }
        None
    }
}

impl Namespaces for NameResolver {
    fn resolve(&self, prefix: &str) -> Option<&str> {
        self.prefix_to_uri(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn reserved_bindings() {
        let mut resolver = NameResolver::new();
        assert_eq!(
            resolver.resolve_name("xml:lang", true),
            Ok(ExpandedName::new(XML_NAMESPACE, "lang"))
        );
        assert_matches!(
            resolver.define_prefix("xmlns", "urn:x"),
            Err(ResolverError::ReservedPrefix { .. })
        );
        assert_matches!(
            resolver.define_prefix("xml", "urn:x"),
            Err(ResolverError::ReservedPrefix { .. })
        );
        // re-declaring xml at its own URI is fine
        assert!(resolver.define_prefix("xml", XML_NAMESPACE).is_ok());
    }

    #[test]
    fn unprefixed_names() {
        let mut resolver = NameResolver::new();
        resolver.enter_context();
        resolver.define_prefix("", "urn:default").unwrap();
        assert_eq!(
            resolver.resolve_name("a", false),
            Ok(ExpandedName::new("urn:default", "a"))
        );
        // unprefixed attributes never pick up the default namespace
        assert_eq!(
            resolver.resolve_name("a", true),
            Ok(ExpandedName::new("", "a"))
        );
    }

    #[test]
    fn two_colons_are_malformed() {
        let resolver = NameResolver::new();
        assert_matches!(
            resolver.resolve_name("a:b:c", false),
            Err(ResolverError::MalformedName { .. })
        );
    }

    #[test]
    fn cannot_leave_the_default_context() {
        let mut resolver = NameResolver::new();
        resolver.enter_context();
        assert!(resolver.leave_context().is_ok());
        assert_matches!(resolver.leave_context(), Err(ResolverError::NoOpenContext));
    }

    #[test]
    fn round_trip() {
        let mut resolver = NameResolver::new();
        resolver.enter_context();
        resolver.define_prefix("p", "urn:x").unwrap();
        resolver.define_prefix("q", "urn:x").unwrap();
        let qname = resolver.unresolve_name("urn:x", "leaf").unwrap();
        let name = resolver.resolve_name(&qname, false).unwrap();
        assert_eq!(name, ExpandedName::new("urn:x", "leaf"));
    }

    #[test]
    fn inner_contexts_shadow_outer() {
        let mut resolver = NameResolver::new();
        resolver.enter_context();
        resolver.define_prefix("p", "urn:outer").unwrap();
        resolver.enter_context();
        resolver.define_prefix("p", "urn:inner").unwrap();
        assert_eq!(
            resolver.resolve_name("p:x", false),
            Ok(ExpandedName::new("urn:inner", "x"))
        );
        // the outer binding is no longer reachable through p
        assert_eq!(resolver.unresolve_name("urn:outer", "x"), None);
        resolver.leave_context().unwrap();
        assert_eq!(
            resolver.unresolve_name("urn:outer", "x").as_deref(),
            Some("p:x")
        );
    }
}
