//! The built-in datatype library (the empty library URI).
//!
//! It has exactly two types, `string` and `token`, and accepts no
//! parameters.

use super::{Datatype, DatatypeError, Param};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RelaxDatatypes {
    String,
    Token,
}

impl Datatype for RelaxDatatypes {
    fn is_valid(&self, _value: &str) -> bool {
        // Both built-in types accept every string; they differ only in how
        // `value` comparison treats whitespace.
        true
    }
}

impl RelaxDatatypes {
    pub fn is_valid(&self, value: &str) -> bool {
        Datatype::is_valid(self, value)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RelaxDatatypes::String => "string",
            RelaxDatatypes::Token => "token",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum RelaxDatatypeValues {
    String(String),
    Token(String),
}

impl RelaxDatatypeValues {
    pub fn is_valid(&self, value: &str) -> bool {
        match self {
            RelaxDatatypeValues::String(s) => s == value,
            RelaxDatatypeValues::Token(s) => *s == normalize_whitespace(value),
        }
    }
}

/// Collapse runs of XML whitespace to single spaces and trim the ends.
pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<&str>>().join(" ")
}

pub fn compile(path: &str, name: &str, params: &[Param]) -> Result<RelaxDatatypes, DatatypeError> {
    if let Some(param) = params.first() {
        return Err(DatatypeError::Parameter {
            path: path.to_string(),
            type_name: name.to_string(),
            detail: format!("the built-in library accepts no parameters ({:?})", param.name),
        });
    }
    match name {
        "string" => Ok(RelaxDatatypes::String),
        "token" => Ok(RelaxDatatypes::Token),
        _ => Err(DatatypeError::UnknownDatatype {
            path: path.to_string(),
            library: String::new(),
            name: name.to_string(),
        }),
    }
}

pub fn compile_value(
    path: &str,
    name: &str,
    value: &str,
) -> Result<RelaxDatatypeValues, DatatypeError> {
    match name {
        "string" => Ok(RelaxDatatypeValues::String(value.to_string())),
        "token" => Ok(RelaxDatatypeValues::Token(normalize_whitespace(value))),
        _ => Err(DatatypeError::UnknownDatatype {
            path: path.to_string(),
            library: String::new(),
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_value_collapses_whitespace() {
        let v = compile_value("/value", "token", "  a\t b \n").unwrap();
        assert!(v.is_valid("a b"));
        assert!(v.is_valid(" a  b "));
        assert!(!v.is_valid("ab"));
    }

    #[test]
    fn string_value_is_exact() {
        let v = compile_value("/value", "string", "a b").unwrap();
        assert!(v.is_valid("a b"));
        assert!(!v.is_valid("a  b"));
    }

    #[test]
    fn params_are_rejected() {
        let err = compile(
            "/data",
            "token",
            &[Param {
                name: "maxLength".to_string(),
                value: "3".to_string(),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, DatatypeError::Parameter { .. }));
    }

    #[test]
    fn unknown_name() {
        assert!(matches!(
            compile("/data", "decimal", &[]),
            Err(DatatypeError::UnknownDatatype { .. })
        ));
    }
}
