//! Per-event validation errors.
//!
//! These are non-fatal: the validator reports them and keeps going. Two
//! errors are equal exactly when their rendered messages are equal, which
//! is what callers deduplicate on.

use rng_model::NameClass;
use std::fmt;

#[derive(Clone, Debug)]
pub enum ValidationError {
    ElementName {
        msg: &'static str,
        name: NameClass,
    },
    AttributeName {
        msg: &'static str,
        name: NameClass,
    },
    AttributeValue {
        msg: &'static str,
        name: NameClass,
    },
    /// Both sides of a choice failed with element-name errors; the
    /// alternatives are listed together.
    Choice {
        msg: &'static str,
        names: Vec<NameClass>,
    },
    Validation {
        msg: String,
    },
    /// The caller drove the event API incorrectly.
    ApiMisuse {
        msg: &'static str,
    },
}

impl ValidationError {
    pub fn validation(msg: impl Into<String>) -> ValidationError {
        ValidationError::Validation { msg: msg.into() }
    }

    pub fn is_element_name(&self) -> bool {
        matches!(self, ValidationError::ElementName { .. })
    }

    /// The name classes an element-name error expected, for choice merging.
    pub fn expected_names(&self) -> Vec<NameClass> {
        match self {
            ValidationError::ElementName { name, .. } => vec![name.clone()],
            ValidationError::Choice { names, .. } => names.clone(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::ElementName { msg, name } => write!(f, "{}: {}", msg, name),
            ValidationError::AttributeName { msg, name } => write!(f, "{}: {}", msg, name),
            ValidationError::AttributeValue { msg, name } => write!(f, "{}: {}", msg, name),
            ValidationError::Choice { msg, names } => {
                write!(f, "{}: ", msg)?;
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" or ")?;
                    }
                    write!(f, "{}", name)?;
                }
                Ok(())
            }
            ValidationError::Validation { msg } => f.write_str(msg),
            ValidationError::ApiMisuse { msg } => write!(f, "API misuse: {}", msg),
        }
    }
}

impl PartialEq for ValidationError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_tracks_rendered_message() {
        let a = ValidationError::ElementName {
            msg: "tag not allowed here",
            name: NameClass::named("", "b"),
        };
        let b = ValidationError::ElementName {
            msg: "tag not allowed here",
            name: NameClass::named("", "b"),
        };
        let c = ValidationError::ElementName {
            msg: "tag not allowed here",
            name: NameClass::named("urn:x", "b"),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn choice_lists_every_alternative() {
        let err = ValidationError::Choice {
            msg: "tag not allowed here, expected",
            names: vec![NameClass::named("", "a"), NameClass::named("", "b")],
        };
        assert_eq!(err.to_string(), "tag not allowed here, expected: a or b");
    }
}
