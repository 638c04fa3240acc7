//! Datatype libraries.
//!
//! Two libraries are built in: the empty-URI library (`string`, `token`)
//! and the XML Schema datatypes library. Compiled datatypes and typed
//! constants are enums so that patterns stay hashable and cheap to clone.

pub mod relax;
pub mod xsd;

use std::fmt;

/// Prefix → URI lookup, needed only by context-dependent datatypes
/// (`QName` and `NOTATION`).
pub trait Namespaces {
    fn resolve(&self, prefix: &str) -> Option<&str>;
}

impl Namespaces for rng_syntax::tree::NsBindings {
    fn resolve(&self, prefix: &str) -> Option<&str> {
        rng_syntax::tree::NsBindings::resolve(self, prefix)
    }
}

pub trait Datatype {
    fn is_valid(&self, value: &str) -> bool;
}

/// A `name="value"` facet from a `param` element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: String,
}

#[derive(Debug)]
pub enum DatatypeError {
    UnknownLibrary {
        path: String,
        uri: String,
    },
    UnknownDatatype {
        path: String,
        library: String,
        name: String,
    },
    /// A facet was rejected at compile time.
    Parameter {
        path: String,
        type_name: String,
        detail: String,
    },
    /// A `value` body was rejected at compile time.
    Value {
        path: String,
        type_name: String,
        detail: String,
    },
}

impl fmt::Display for DatatypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatatypeError::UnknownLibrary { path, uri } => {
                write!(f, "unknown datatype library {:?} at {}", uri, path)
            }
            DatatypeError::UnknownDatatype {
                path,
                library,
                name,
            } => write!(
                f,
                "unknown datatype {:?} in library {:?} at {}",
                name, library, path
            ),
            DatatypeError::Parameter {
                path,
                type_name,
                detail,
            } => write!(f, "bad parameter for {} at {}: {}", type_name, path, detail),
            DatatypeError::Value {
                path,
                type_name,
                detail,
            } => write!(f, "bad {} value at {}: {}", type_name, path, detail),
        }
    }
}

impl std::error::Error for DatatypeError {}

/// A compiled `data` restriction.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Datatypes {
    Relax(relax::RelaxDatatypes),
    Xsd(xsd::XsdDatatypes),
}

impl Datatypes {
    pub fn is_valid(&self, value: &str) -> bool {
        match self {
            Datatypes::Relax(dt) => dt.is_valid(value),
            Datatypes::Xsd(dt) => dt.is_valid(value),
        }
    }

    /// A regular expression loosely describing the lexical space, for
    /// event-set and diagnostic rendering only.
    pub fn lexical_pattern(&self) -> Option<&'static regex::Regex> {
        match self {
            Datatypes::Relax(_) => None,
            Datatypes::Xsd(dt) => dt.lexical_pattern(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Datatypes::Relax(dt) => dt.type_name(),
            Datatypes::Xsd(dt) => dt.type_name(),
        }
    }
}

/// A compiled `value` constant.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum DatatypeValues {
    Relax(relax::RelaxDatatypeValues),
    Xsd(xsd::XsdDatatypeValues),
}

impl DatatypeValues {
    /// Typed equality against a candidate lexical value. Context-dependent
    /// values (QName) always fail here; use [`is_valid_with_ns`].
    ///
    /// [`is_valid_with_ns`]: DatatypeValues::is_valid_with_ns
    pub fn is_valid(&self, value: &str) -> bool {
        match self {
            DatatypeValues::Relax(v) => v.is_valid(value),
            DatatypeValues::Xsd(v) => v.is_valid(value),
        }
    }

    pub fn is_valid_with_ns(&self, value: &str, ns: &dyn Namespaces) -> bool {
        match self {
            DatatypeValues::Relax(v) => v.is_valid(value),
            DatatypeValues::Xsd(v) => v.is_valid_with_ns(value, ns),
        }
    }
}

/// True when validating a value of this datatype requires a name resolver.
pub fn needs_context(library_uri: &str, name: &str) -> bool {
    library_uri == xsd::NAMESPACE_URI && matches!(name, "QName" | "NOTATION")
}

pub fn known_library(library_uri: &str) -> bool {
    library_uri.is_empty() || library_uri == xsd::NAMESPACE_URI
}

/// Compile a `data` element's type and params.
pub fn compile_datatype(
    path: &str,
    library_uri: &str,
    name: &str,
    params: &[Param],
) -> Result<Datatypes, DatatypeError> {
    if library_uri.is_empty() {
        relax::compile(path, name, params).map(Datatypes::Relax)
    } else if library_uri == xsd::NAMESPACE_URI {
        xsd::compile(path, name, params).map(Datatypes::Xsd)
    } else {
        Err(DatatypeError::UnknownLibrary {
            path: path.to_string(),
            uri: library_uri.to_string(),
        })
    }
}

/// Compile a `value` element's body against its type.
pub fn compile_value(
    path: &str,
    library_uri: &str,
    name: &str,
    value: &str,
    ns: &dyn Namespaces,
) -> Result<DatatypeValues, DatatypeError> {
    if library_uri.is_empty() {
        relax::compile_value(path, name, value).map(DatatypeValues::Relax)
    } else if library_uri == xsd::NAMESPACE_URI {
        xsd::compile_value(path, name, value, ns).map(DatatypeValues::Xsd)
    } else {
        Err(DatatypeError::UnknownLibrary {
            path: path.to_string(),
            uri: library_uri.to_string(),
        })
    }
}
