//! Validation events.
//!
//! Fired events carry concrete names and strings; possible events (what a
//! walker would accept next) carry name classes. Both are value objects
//! compared by kind plus stringified parameter.

use fnv::FnvHashSet;
use rng_model::{ExpandedName, NameClass};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    EnterStartTag(ExpandedName),
    LeaveStartTag,
    EndTag(ExpandedName),
    AttributeName(ExpandedName),
    AttributeValue(String),
    Text(String),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::EnterStartTag(_) => "enterStartTag",
            Event::LeaveStartTag => "leaveStartTag",
            Event::EndTag(_) => "endTag",
            Event::AttributeName(_) => "attributeName",
            Event::AttributeValue(_) => "attributeValue",
            Event::Text(_) => "text",
        }
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self, Event::AttributeName(_) | Event::AttributeValue(_))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::EnterStartTag(name) => write!(f, "enterStartTag({})", name),
            Event::LeaveStartTag => f.write_str("leaveStartTag"),
            Event::EndTag(name) => write!(f, "endTag({})", name),
            Event::AttributeName(name) => write!(f, "attributeName({})", name),
            Event::AttributeValue(value) => write!(f, "attributeValue({:?})", value),
            Event::Text(text) => write!(f, "text({:?})", text),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PossibleEvent {
    EnterStartTag(NameClass),
    LeaveStartTag,
    EndTag(ExpandedName),
    AttributeName(NameClass),
    /// The parameter loosely describes acceptable values.
    AttributeValue(String),
    Text(String),
}

impl PossibleEvent {
    pub fn is_attribute(&self) -> bool {
        matches!(
            self,
            PossibleEvent::AttributeName(_) | PossibleEvent::AttributeValue(_)
        )
    }
}

pub type EventSet = FnvHashSet<PossibleEvent>;
