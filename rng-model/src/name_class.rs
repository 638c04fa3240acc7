//! RELAX NG name classes.
//!
//! A name class is a pattern over expanded names. Besides the membership
//! test used during validation, the restriction checker needs a
//! constructive intersection (to detect clashing attribute and element
//! name classes) and subtraction (for `anyName`/`nsName` minus `except`).

use std::collections::BTreeSet;
use std::fmt;

/// A `(namespace URI, local name)` pair with value equality.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ExpandedName {
    pub namespace_uri: String,
    pub local_name: String,
}

impl ExpandedName {
    pub fn new(namespace_uri: &str, local_name: &str) -> ExpandedName {
        ExpandedName {
            namespace_uri: namespace_uri.to_string(),
            local_name: local_name.to_string(),
        }
    }
}

impl fmt::Display for ExpandedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_uri.is_empty() {
            f.write_str(&self.local_name)
        } else {
            write!(f, "{{{}}}{}", self.namespace_uri, self.local_name)
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum NameClass {
    Named {
        namespace_uri: String,
        name: String,
    },
    NsName {
        namespace_uri: String,
        except: Option<Box<NameClass>>,
    },
    AnyName {
        except: Option<Box<NameClass>>,
    },
    Alt {
        a: Box<NameClass>,
        b: Box<NameClass>,
    },
}

impl NameClass {
    pub fn named(namespace_uri: &str, name: &str) -> NameClass {
        NameClass::Named {
            namespace_uri: namespace_uri.to_string(),
            name: name.to_string(),
        }
    }

    pub fn alt(a: NameClass, b: NameClass) -> NameClass {
        NameClass::Alt {
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    /// Membership test for an expanded name.
    pub fn contains(&self, namespace_uri: &str, name: &str) -> bool {
        match self {
            NameClass::Named {
                namespace_uri: ns,
                name: n,
            } => ns == namespace_uri && n == name,
            NameClass::NsName {
                namespace_uri: ns,
                except,
            } => {
                ns == namespace_uri
                    && !except
                        .as_ref()
                        .map(|e| e.contains(namespace_uri, name))
                        .unwrap_or(false)
            }
            NameClass::AnyName { except } => !except
                .as_ref()
                .map(|e| e.contains(namespace_uri, name))
                .unwrap_or(false),
            NameClass::Alt { a, b } => {
                a.contains(namespace_uri, name) || b.contains(namespace_uri, name)
            }
        }
    }

    pub fn contains_name(&self, name: &ExpandedName) -> bool {
        self.contains(&name.namespace_uri, &name.local_name)
    }

    /// True when the class names a finite set explicitly (no wildcard and no
    /// except anywhere).
    pub fn simple(&self) -> bool {
        match self {
            NameClass::Named { .. } => true,
            NameClass::Alt { a, b } => a.simple() && b.simple(),
            NameClass::NsName { .. } | NameClass::AnyName { .. } => false,
        }
    }

    /// The names of a simple class, `None` when a wildcard is involved.
    pub fn names(&self) -> Option<Vec<ExpandedName>> {
        match self {
            NameClass::Named {
                namespace_uri,
                name,
            } => Some(vec![ExpandedName::new(namespace_uri, name)]),
            NameClass::Alt { a, b } => {
                let mut out = a.names()?;
                out.extend(b.names()?);
                Some(out)
            }
            NameClass::NsName { .. } | NameClass::AnyName { .. } => None,
        }
    }

    /// The set of namespaces this class mentions; `*` marks `anyName` and
    /// `::except` marks the presence of an except constraint.
    pub fn namespaces(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.record_namespaces(&mut out);
        out
    }

    fn record_namespaces(&self, out: &mut BTreeSet<String>) {
        match self {
            NameClass::Named { namespace_uri, .. } => {
                out.insert(namespace_uri.clone());
            }
            NameClass::NsName {
                namespace_uri,
                except,
            } => {
                out.insert(namespace_uri.clone());
                if except.is_some() {
                    out.insert("::except".to_string());
                }
            }
            NameClass::AnyName { except } => {
                out.insert("*".to_string());
                if except.is_some() {
                    out.insert("::except".to_string());
                }
            }
            NameClass::Alt { a, b } => {
                a.record_namespaces(out);
                b.record_namespaces(out);
            }
        }
    }

    pub fn intersects(&self, other: &NameClass) -> bool {
        self.intersection(other).is_some()
    }

    /// The product of two name classes; `None` is the empty class.
    pub fn intersection(&self, other: &NameClass) -> Option<NameClass> {
        use NameClass::*;
        match (self, other) {
            (Alt { a, b }, x) => union(a.intersection(x), b.intersection(x)),
            (x, Alt { a, b }) => union(x.intersection(a), x.intersection(b)),
            (AnyName { except }, x) => match except {
                None => Some(x.clone()),
                Some(e) => x.subtract(e),
            },
            (x, AnyName { except }) => match except {
                None => Some(x.clone()),
                Some(e) => x.subtract(e),
            },
            (
                Named { .. },
                Named { .. },
            ) => {
                if self == other {
                    Some(self.clone())
                } else {
                    None
                }
            }
            (
                Named {
                    namespace_uri,
                    name,
                },
                NsName { .. },
            ) => {
                if other.contains(namespace_uri, name) {
                    Some(self.clone())
                } else {
                    None
                }
            }
            (
                NsName { .. },
                Named {
                    namespace_uri,
                    name,
                },
            ) => {
                if self.contains(namespace_uri, name) {
                    Some(other.clone())
                } else {
                    None
                }
            }
            (
                NsName {
                    namespace_uri: ns1,
                    except: e1,
                },
                NsName {
                    namespace_uri: ns2,
                    except: e2,
                },
            ) => {
                if ns1 != ns2 {
                    None
                } else {
                    Some(NsName {
                        namespace_uri: ns1.clone(),
                        except: merge_excepts(e1.as_deref(), e2.as_deref()),
                    })
                }
            }
        }
    }

    /// The names matched by `self` but not by `other`; `None` is the empty
    /// class. Defined for every operand combination the simplified grammar
    /// can produce (the restriction rules bar wildcard excepts inside
    /// `nsName`, which is what keeps the `nsName − nsName` case finite).
    pub fn subtract(&self, other: &NameClass) -> Option<NameClass> {
        use NameClass::*;
        match (self, other) {
            (Alt { a, b }, x) => union(a.subtract(x), b.subtract(x)),
            (x, Alt { a, b }) => x.subtract(a).and_then(|rest| rest.subtract(b)),
            (x, AnyName { except }) => match except {
                None => None,
                Some(e) => x.intersection(e),
            },
            (
                Named {
                    namespace_uri,
                    name,
                },
                _,
            ) => {
                if other.contains(namespace_uri, name) {
                    None
                } else {
                    Some(self.clone())
                }
            }
            (
                NsName {
                    namespace_uri: ns,
                    except,
                },
                Named {
                    namespace_uri: ons,
                    ..
                },
            ) => {
                if ons != ns {
                    Some(self.clone())
                } else {
                    Some(NsName {
                        namespace_uri: ns.clone(),
                        except: push_except(except.as_deref(), other),
                    })
                }
            }
            (
                NsName {
                    namespace_uri: ns, ..
                },
                NsName {
                    namespace_uri: ons,
                    except: oe,
                },
            ) => {
                if ons != ns {
                    Some(self.clone())
                } else {
                    // Whatever survives is re-admitted by the other side's
                    // except, restricted to the names we actually match.
                    let survivors = oe.as_ref().and_then(|e| e.names())?;
                    let kept: Vec<NameClass> = survivors
                        .into_iter()
                        .filter(|n| self.contains(&n.namespace_uri, &n.local_name))
                        .map(|n| NameClass::named(&n.namespace_uri, &n.local_name))
                        .collect();
                    fold_alt(kept)
                }
            }
            (AnyName { except }, _) => Some(AnyName {
                except: push_except(except.as_deref(), other),
            }),
        }
    }
}

fn union(a: Option<NameClass>, b: Option<NameClass>) -> Option<NameClass> {
    match (a, b) {
        (Some(a), Some(b)) => Some(NameClass::alt(a, b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

fn leaves(nc: &NameClass, out: &mut Vec<NameClass>) {
    match nc {
        NameClass::Alt { a, b } => {
            leaves(a, out);
            leaves(b, out);
        }
        other => {
            if !out.contains(other) {
                out.push(other.clone());
            }
        }
    }
}

fn fold_alt(mut parts: Vec<NameClass>) -> Option<NameClass> {
    let last = parts.pop()?;
    Some(
        parts
            .into_iter()
            .rev()
            .fold(last, |acc, part| NameClass::alt(part, acc)),
    )
}

/// Add one more name class to an except set, deduplicating leaves.
fn push_except(existing: Option<&NameClass>, add: &NameClass) -> Option<Box<NameClass>> {
    let mut parts = Vec::new();
    if let Some(e) = existing {
        leaves(e, &mut parts);
    }
    leaves(add, &mut parts);
    fold_alt(parts).map(Box::new)
}

fn merge_excepts(a: Option<&NameClass>, b: Option<&NameClass>) -> Option<Box<NameClass>> {
    let mut parts = Vec::new();
    if let Some(a) = a {
        leaves(a, &mut parts);
    }
    if let Some(b) = b {
        leaves(b, &mut parts);
    }
    fold_alt(parts).map(Box::new)
}

impl fmt::Display for NameClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameClass::Named {
                namespace_uri,
                name,
            } => {
                if namespace_uri.is_empty() {
                    f.write_str(name)
                } else {
                    write!(f, "{{{}}}{}", namespace_uri, name)
                }
            }
            NameClass::NsName {
                namespace_uri,
                except,
            } => {
                write!(f, "{{{}}}:*", namespace_uri)?;
                if let Some(except) = except {
                    write!(f, "-{}", except)?;
                }
                Ok(())
            }
            NameClass::AnyName { except } => {
                f.write_str("*")?;
                if let Some(except) = except {
                    write!(f, "-{}", except)?;
                }
                Ok(())
            }
            NameClass::Alt { a, b } => write!(f, "{}|{}", a, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(ns: &str, n: &str) -> NameClass {
        NameClass::named(ns, n)
    }

    fn ns_name(ns: &str, except: Option<NameClass>) -> NameClass {
        NameClass::NsName {
            namespace_uri: ns.to_string(),
            except: except.map(Box::new),
        }
    }

    fn any_name(except: Option<NameClass>) -> NameClass {
        NameClass::AnyName {
            except: except.map(Box::new),
        }
    }

    fn samples() -> Vec<NameClass> {
        vec![
            named("", "a"),
            named("urn:x", "a"),
            named("urn:x", "b"),
            ns_name("urn:x", None),
            ns_name("urn:x", Some(named("urn:x", "a"))),
            ns_name("urn:y", None),
            any_name(None),
            any_name(Some(ns_name("urn:x", None))),
            NameClass::alt(named("", "a"), named("urn:x", "b")),
        ]
    }

    #[test]
    fn intersection_is_symmetric() {
        for x in samples() {
            for y in samples() {
                assert_eq!(
                    x.intersects(&y),
                    y.intersects(&x),
                    "asymmetric for {} vs {}",
                    x,
                    y
                );
            }
        }
    }

    #[test]
    fn self_intersection_matches_the_same_names() {
        let probes = [
            ("", "a"),
            ("urn:x", "a"),
            ("urn:x", "b"),
            ("urn:y", "c"),
            ("urn:z", "d"),
        ];
        for x in samples() {
            let xx = x.intersection(&x).expect("self intersection is never empty");
            for (ns, local) in &probes {
                assert_eq!(x.contains(ns, local), xx.contains(ns, local));
            }
        }
    }

    #[test]
    fn name_vs_ns_name() {
        let nc = ns_name("urn:x", Some(named("urn:x", "banned")));
        assert_eq!(
            named("urn:x", "ok").intersection(&nc),
            Some(named("urn:x", "ok"))
        );
        assert_eq!(named("urn:x", "banned").intersection(&nc), None);
        assert_eq!(named("urn:y", "ok").intersection(&nc), None);
    }

    #[test]
    fn ns_name_merge_dedups_except() {
        let a = ns_name("urn:x", Some(named("urn:x", "dup")));
        let b = ns_name(
            "urn:x",
            Some(NameClass::alt(named("urn:x", "dup"), named("urn:x", "other"))),
        );
        let merged = a.intersection(&b).unwrap();
        assert!(!merged.contains("urn:x", "dup"));
        assert!(!merged.contains("urn:x", "other"));
        assert!(merged.contains("urn:x", "fine"));
        // the duplicate leaf was folded away
        if let NameClass::NsName { except, .. } = merged {
            let mut parts = Vec::new();
            leaves(&except.unwrap(), &mut parts);
            assert_eq!(parts.len(), 2);
        } else {
            panic!("expected nsName");
        }
    }

    #[test]
    fn any_name_intersection_subtracts() {
        let any = any_name(Some(named("urn:x", "no")));
        let got = ns_name("urn:x", None).intersection(&any).unwrap();
        assert!(!got.contains("urn:x", "no"));
        assert!(got.contains("urn:x", "yes"));
    }

    #[test]
    fn disjoint_namespaces_do_not_intersect() {
        assert!(!ns_name("urn:x", None).intersects(&ns_name("urn:y", None)));
        assert!(!named("urn:x", "a").intersects(&named("urn:y", "a")));
    }

    #[test]
    fn subtract_readmits_through_except() {
        // (urn:x minus a) − (urn:x minus {a, b}) leaves exactly b
        let lhs = ns_name("urn:x", Some(named("urn:x", "a")));
        let rhs = ns_name(
            "urn:x",
            Some(NameClass::alt(named("urn:x", "a"), named("urn:x", "b"))),
        );
        let diff = lhs.subtract(&rhs).unwrap();
        assert!(diff.contains("urn:x", "b"));
        assert!(!diff.contains("urn:x", "a"));
        assert!(!diff.contains("urn:x", "c"));
    }

    #[test]
    fn namespaces_report_wildcards() {
        let nc = NameClass::alt(
            named("urn:x", "a"),
            any_name(Some(ns_name("urn:y", None))),
        );
        let got = nc.namespaces();
        assert!(got.contains("urn:x"));
        assert!(got.contains("*"));
        assert!(got.contains("::except"));
    }

    #[test]
    fn simple_and_names() {
        let simple = NameClass::alt(named("", "a"), named("urn:x", "b"));
        assert!(simple.simple());
        assert_eq!(
            simple.names(),
            Some(vec![
                ExpandedName::new("", "a"),
                ExpandedName::new("urn:x", "b")
            ])
        );
        assert!(!any_name(None).simple());
        assert_eq!(any_name(None).names(), None);
    }
}
