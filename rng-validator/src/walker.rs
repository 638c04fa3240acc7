//! The walker engine.
//!
//! One walker struct per pattern kind, dispatched through the [`Walker`]
//! enum. A walker is a cursor into an immutable pattern: firing an event
//! either advances it (`Accepted`), reports that the event belongs to some
//! other walker (`NotMatched`, with no state change), or accepts the event
//! while recording what went wrong (`Errors`). Walkers clone cheaply:
//! pattern structure stays behind [`PatId`] handles and only cursor state
//! is copied, which is what lets `choice`, `interleave` and `oneOrMore`
//! probe speculative continuations.

use crate::error::ValidationError;
use crate::event::{Event, EventSet, PossibleEvent};
use rng_model::datatype::{Datatypes, DatatypeValues, Namespaces};
use rng_model::{ExpandedName, NameClass, PatId, Pattern, Schema};

#[derive(Debug)]
pub enum FireResult {
    /// The walker consumed the event without error.
    Accepted,
    /// The event is not for this walker; the caller should try elsewhere.
    /// A `NotMatched` return never changes walker state.
    NotMatched,
    /// The event was for this walker but violated its state.
    Errors(Vec<ValidationError>),
}

pub fn is_whitespace(text: &str) -> bool {
    text.chars().all(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
}

/// Build a walker for a pattern. `Ref` elides itself: the walker comes from
/// the referenced define's body. Cycles are safe because element walkers
/// only build their content walker once their start tag arrives.
pub fn walker_for(schema: &Schema, id: PatId) -> Walker {
    match schema.pattern(id) {
        Pattern::Empty => Walker::Empty(EmptyWalker),
        Pattern::NotAllowed => Walker::NotAllowed(NotAllowedWalker),
        Pattern::Text => Walker::Text(TextWalker),
        Pattern::Choice(a, b) => Walker::Choice(Box::new(ChoiceWalker {
            a: Some(walker_for(schema, *a)),
            b: Some(walker_for(schema, *b)),
        })),
        Pattern::Group(a, b) => Walker::Group(Box::new(GroupWalker {
            a: walker_for(schema, *a),
            b: walker_for(schema, *b),
            a_done: false,
        })),
        Pattern::Interleave(a, b) => Walker::Interleave(Box::new(InterleaveWalker {
            a: walker_for(schema, *a),
            b: walker_for(schema, *b),
            active: None,
        })),
        Pattern::OneOrMore(child) => Walker::OneOrMore(Box::new(OneOrMoreWalker {
            child: *child,
            current: walker_for(schema, *child),
            suppressed: false,
        })),
        Pattern::List(child) => Walker::List(Box::new(ListWalker {
            sub: walker_for(schema, *child),
        })),
        Pattern::Attribute(nc, content) => Walker::Attribute(Box::new(AttributeWalker {
            name_class: (**nc).clone(),
            content: *content,
            state: AttributeState::Initial,
            seen_name: None,
            suppressed: false,
        })),
        Pattern::Element(nc, content) => Walker::Element(Box::new(ElementWalker {
            name_class: (**nc).clone(),
            content: *content,
            state: ElementState::Initial,
            seen_name: None,
            sub: None,
        })),
        Pattern::Ref(define) => walker_for(schema, schema.define(*define).pattern),
        Pattern::Data(datatype) => Walker::Data(Box::new(DataWalker {
            datatype: (**datatype).clone(),
            except: None,
            matched: false,
        })),
        Pattern::DataExcept(datatype, except) => Walker::Data(Box::new(DataWalker {
            datatype: (**datatype).clone(),
            except: Some(*except),
            matched: false,
        })),
        Pattern::Value(value) => Walker::Value(Box::new(ValueWalker {
            value: (**value).clone(),
            matched: false,
        })),
    }
}

#[derive(Clone, Debug)]
pub enum Walker {
    Empty(EmptyWalker),
    NotAllowed(NotAllowedWalker),
    Text(TextWalker),
    Choice(Box<ChoiceWalker>),
    Group(Box<GroupWalker>),
    Interleave(Box<InterleaveWalker>),
    OneOrMore(Box<OneOrMoreWalker>),
    List(Box<ListWalker>),
    Attribute(Box<AttributeWalker>),
    Element(Box<ElementWalker>),
    Data(Box<DataWalker>),
    Value(Box<ValueWalker>),
}

impl Walker {
    pub fn possible(&self, schema: &Schema) -> EventSet {
        match self {
            Walker::Empty(w) => w.possible(schema),
            Walker::NotAllowed(w) => w.possible(schema),
            Walker::Text(w) => w.possible(schema),
            Walker::Choice(w) => w.possible(schema),
            Walker::Group(w) => w.possible(schema),
            Walker::Interleave(w) => w.possible(schema),
            Walker::OneOrMore(w) => w.possible(schema),
            Walker::List(w) => w.possible(schema),
            Walker::Attribute(w) => w.possible(schema),
            Walker::Element(w) => w.possible(schema),
            Walker::Data(w) => w.possible(schema),
            Walker::Value(w) => w.possible(schema),
        }
    }

    pub fn fire_event(
        &mut self,
        schema: &Schema,
        ns: &dyn Namespaces,
        event: &Event,
    ) -> FireResult {
        match self {
            Walker::Empty(w) => w.fire_event(schema, ns, event),
            Walker::NotAllowed(w) => w.fire_event(schema, ns, event),
            Walker::Text(w) => w.fire_event(schema, ns, event),
            Walker::Choice(w) => w.fire_event(schema, ns, event),
            Walker::Group(w) => w.fire_event(schema, ns, event),
            Walker::Interleave(w) => w.fire_event(schema, ns, event),
            Walker::OneOrMore(w) => w.fire_event(schema, ns, event),
            Walker::List(w) => w.fire_event(schema, ns, event),
            Walker::Attribute(w) => w.fire_event(schema, ns, event),
            Walker::Element(w) => w.fire_event(schema, ns, event),
            Walker::Data(w) => w.fire_event(schema, ns, event),
            Walker::Value(w) => w.fire_event(schema, ns, event),
        }
    }

    pub fn can_end(&self, schema: &Schema, attribute_phase: bool) -> bool {
        match self {
            Walker::Empty(w) => w.can_end(schema, attribute_phase),
            Walker::NotAllowed(w) => w.can_end(schema, attribute_phase),
            Walker::Text(w) => w.can_end(schema, attribute_phase),
            Walker::Choice(w) => w.can_end(schema, attribute_phase),
            Walker::Group(w) => w.can_end(schema, attribute_phase),
            Walker::Interleave(w) => w.can_end(schema, attribute_phase),
            Walker::OneOrMore(w) => w.can_end(schema, attribute_phase),
            Walker::List(w) => w.can_end(schema, attribute_phase),
            Walker::Attribute(w) => w.can_end(schema, attribute_phase),
            Walker::Element(w) => w.can_end(schema, attribute_phase),
            Walker::Data(w) => w.can_end(schema, attribute_phase),
            Walker::Value(w) => w.can_end(schema, attribute_phase),
        }
    }

    pub fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        match self {
            Walker::Empty(w) => w.end(schema, attribute_phase),
            Walker::NotAllowed(w) => w.end(schema, attribute_phase),
            Walker::Text(w) => w.end(schema, attribute_phase),
            Walker::Choice(w) => w.end(schema, attribute_phase),
            Walker::Group(w) => w.end(schema, attribute_phase),
            Walker::Interleave(w) => w.end(schema, attribute_phase),
            Walker::OneOrMore(w) => w.end(schema, attribute_phase),
            Walker::List(w) => w.end(schema, attribute_phase),
            Walker::Attribute(w) => w.end(schema, attribute_phase),
            Walker::Element(w) => w.end(schema, attribute_phase),
            Walker::Data(w) => w.end(schema, attribute_phase),
            Walker::Value(w) => w.end(schema, attribute_phase),
        }
    }

    /// The host has left the start-tag phase; attribute events are no
    /// longer possible for this walker.
    pub fn suppress_attributes(&mut self) {
        match self {
            Walker::Empty(_) | Walker::NotAllowed(_) | Walker::Text(_) => {}
            Walker::Choice(w) => w.suppress_attributes(),
            Walker::Group(w) => w.suppress_attributes(),
            Walker::Interleave(w) => w.suppress_attributes(),
            Walker::OneOrMore(w) => w.suppress_attributes(),
            Walker::List(_) => {}
            Walker::Attribute(w) => w.suppressed = true,
            // an element's own attributes come with its own start tag
            Walker::Element(_) => {}
            Walker::Data(_) | Walker::Value(_) => {}
        }
    }
}

fn merge_result(mut errors: Vec<ValidationError>, result: FireResult) -> FireResult {
    match result {
        FireResult::Accepted => {
            if errors.is_empty() {
                FireResult::Accepted
            } else {
                FireResult::Errors(errors)
            }
        }
        FireResult::Errors(more) => {
            errors.extend(more);
            FireResult::Errors(errors)
        }
        FireResult::NotMatched => FireResult::NotMatched,
    }
}

// --- Terminals ---

#[derive(Clone, Copy, Debug)]
pub struct EmptyWalker;

impl EmptyWalker {
    fn possible(&self, _schema: &Schema) -> EventSet {
        EventSet::default()
    }

    fn fire_event(&mut self, _schema: &Schema, _ns: &dyn Namespaces, event: &Event) -> FireResult {
        match event {
            // stray whitespace between tags satisfies empty
            Event::Text(t) if is_whitespace(t) => FireResult::Accepted,
            _ => FireResult::NotMatched,
        }
    }

    fn can_end(&self, _schema: &Schema, _attribute_phase: bool) -> bool {
        true
    }

    fn end(&mut self, _schema: &Schema, _attribute_phase: bool) -> Vec<ValidationError> {
        Vec::new()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NotAllowedWalker;

impl NotAllowedWalker {
    fn possible(&self, _schema: &Schema) -> EventSet {
        EventSet::default()
    }

    fn fire_event(&mut self, _schema: &Schema, _ns: &dyn Namespaces, _event: &Event) -> FireResult {
        FireResult::NotMatched
    }

    fn can_end(&self, _schema: &Schema, attribute_phase: bool) -> bool {
        attribute_phase
    }

    fn end(&mut self, _schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        if attribute_phase {
            Vec::new()
        } else {
            vec![ValidationError::validation("no content allowed here")]
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TextWalker;

impl TextWalker {
    fn possible(&self, _schema: &Schema) -> EventSet {
        let mut set = EventSet::default();
        set.insert(PossibleEvent::Text("*".to_string()));
        set
    }

    fn fire_event(&mut self, _schema: &Schema, _ns: &dyn Namespaces, event: &Event) -> FireResult {
        match event {
            Event::Text(_) => FireResult::Accepted,
            _ => FireResult::NotMatched,
        }
    }

    fn can_end(&self, _schema: &Schema, _attribute_phase: bool) -> bool {
        true
    }

    fn end(&mut self, _schema: &Schema, _attribute_phase: bool) -> Vec<ValidationError> {
        Vec::new()
    }
}

// --- Typed content ---

#[derive(Clone, Debug)]
pub struct ValueWalker {
    value: DatatypeValues,
    matched: bool,
}

impl ValueWalker {
    fn possible(&self, _schema: &Schema) -> EventSet {
        let mut set = EventSet::default();
        set.insert(PossibleEvent::Text(format!("{:?}", self.value)));
        set
    }

    fn fire_event(&mut self, _schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        match event {
            Event::Text(text) => {
                if self.value.is_valid_with_ns(text, ns) {
                    self.matched = true;
                    FireResult::Accepted
                } else {
                    FireResult::NotMatched
                }
            }
            _ => FireResult::NotMatched,
        }
    }

    fn can_end(&self, _schema: &Schema, attribute_phase: bool) -> bool {
        attribute_phase || self.matched || self.value.is_valid("")
    }

    fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        if self.can_end(schema, attribute_phase) {
            Vec::new()
        } else {
            vec![ValidationError::validation("expected a fixed value here")]
        }
    }
}

#[derive(Clone, Debug)]
pub struct DataWalker {
    datatype: Datatypes,
    except: Option<PatId>,
    matched: bool,
}

impl DataWalker {
    fn possible(&self, _schema: &Schema) -> EventSet {
        let mut set = EventSet::default();
        set.insert(PossibleEvent::Text(self.datatype.type_name().to_string()));
        set
    }

    fn fire_event(&mut self, schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        match event {
            Event::Text(text) => {
                if !self.datatype.is_valid(text) {
                    return FireResult::NotMatched;
                }
                if let Some(except) = self.except {
                    let mut excluded = walker_for(schema, except);
                    if let FireResult::Accepted = excluded.fire_event(schema, ns, event) {
                        if excluded.can_end(schema, false) {
                            return FireResult::NotMatched;
                        }
                    }
                }
                self.matched = true;
                FireResult::Accepted
            }
            _ => FireResult::NotMatched,
        }
    }

    fn can_end(&self, _schema: &Schema, attribute_phase: bool) -> bool {
        attribute_phase || self.matched || self.datatype.is_valid("")
    }

    fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        if self.can_end(schema, attribute_phase) {
            Vec::new()
        } else {
            vec![ValidationError::validation(format!(
                "expected {} content here",
                self.datatype.type_name()
            ))]
        }
    }
}

#[derive(Clone, Debug)]
pub struct ListWalker {
    sub: Walker,
}

impl ListWalker {
    fn possible(&self, _schema: &Schema) -> EventSet {
        let mut set = EventSet::default();
        set.insert(PossibleEvent::Text("list".to_string()));
        set
    }

    fn fire_event(&mut self, schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        match event {
            Event::Text(text) => {
                // Probe on a clone: a failing token must leave this walker
                // untouched so the caller can try alternatives.
                let mut probe = self.sub.clone();
                for token in text.split_whitespace() {
                    let item = Event::Text(token.to_string());
                    match probe.fire_event(schema, ns, &item) {
                        FireResult::Accepted => {}
                        FireResult::NotMatched | FireResult::Errors(_) => {
                            return FireResult::NotMatched;
                        }
                    }
                }
                self.sub = probe;
                FireResult::Accepted
            }
            _ => FireResult::NotMatched,
        }
    }

    fn can_end(&self, schema: &Schema, attribute_phase: bool) -> bool {
        attribute_phase || self.sub.can_end(schema, false)
    }

    fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        if attribute_phase {
            return Vec::new();
        }
        self.sub.end(schema, false)
    }
}

// --- Attributes and elements ---

#[derive(Clone, Copy, PartialEq, Debug)]
enum AttributeState {
    Initial,
    NameSeen,
    ValueSeen,
}

#[derive(Clone, Debug)]
pub struct AttributeWalker {
    name_class: NameClass,
    content: PatId,
    state: AttributeState,
    seen_name: Option<ExpandedName>,
    suppressed: bool,
}

impl AttributeWalker {
    fn possible(&self, _schema: &Schema) -> EventSet {
        let mut set = EventSet::default();
        if self.suppressed {
            return set;
        }
        match self.state {
            AttributeState::Initial => {
                set.insert(PossibleEvent::AttributeName(self.name_class.clone()));
            }
            AttributeState::NameSeen => {
                set.insert(PossibleEvent::AttributeValue("*".to_string()));
            }
            AttributeState::ValueSeen => {}
        }
        set
    }

    fn fire_event(&mut self, schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        match (self.state, event) {
            (AttributeState::Initial, Event::AttributeName(name)) => {
                if self.suppressed || !self.name_class.contains_name(name) {
                    return FireResult::NotMatched;
                }
                self.state = AttributeState::NameSeen;
                self.seen_name = Some(name.clone());
                FireResult::Accepted
            }
            (AttributeState::NameSeen, Event::AttributeValue(value)) => {
                self.state = AttributeState::ValueSeen;
                let error = || {
                    let name = self
                        .seen_name
                        .as_ref()
                        .map(|n| NameClass::named(&n.namespace_uri, &n.local_name))
                        .unwrap_or_else(|| self.name_class.clone());
                    FireResult::Errors(vec![ValidationError::AttributeValue {
                        msg: "invalid attribute value",
                        name,
                    }])
                };
                // Attributes end immediately: convert to a text event, fire
                // it at a fresh content walker, then end that walker.
                let mut sub = walker_for(schema, self.content);
                let text_event = Event::Text(value.clone());
                match sub.fire_event(schema, ns, &text_event) {
                    FireResult::Accepted => {
                        if sub.end(schema, false).is_empty() {
                            FireResult::Accepted
                        } else {
                            error()
                        }
                    }
                    FireResult::NotMatched => {
                        // a whitespace-only value can satisfy a nullable
                        // content pattern without matching anything
                        if is_whitespace(value) && sub.can_end(schema, false) {
                            FireResult::Accepted
                        } else {
                            error()
                        }
                    }
                    FireResult::Errors(_) => error(),
                }
            }
            _ => FireResult::NotMatched,
        }
    }

    fn can_end(&self, _schema: &Schema, attribute_phase: bool) -> bool {
        if attribute_phase {
            self.state == AttributeState::ValueSeen
        } else {
            true
        }
    }

    fn end(&mut self, _schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        if attribute_phase && self.state != AttributeState::ValueSeen {
            vec![ValidationError::AttributeName {
                msg: "attribute missing",
                name: self.name_class.clone(),
            }]
        } else {
            Vec::new()
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum ElementState {
    Initial,
    NameSeen,
    Closed,
    Done,
}

#[derive(Clone, Debug)]
pub struct ElementWalker {
    name_class: NameClass,
    content: PatId,
    state: ElementState,
    seen_name: Option<ExpandedName>,
    sub: Option<Walker>,
}

impl ElementWalker {
    fn possible(&self, schema: &Schema) -> EventSet {
        let mut set = EventSet::default();
        match self.state {
            ElementState::Initial => {
                set.insert(PossibleEvent::EnterStartTag(self.name_class.clone()));
            }
            ElementState::NameSeen => {
                if let Some(sub) = &self.sub {
                    set.extend(sub.possible(schema));
                }
                set.insert(PossibleEvent::LeaveStartTag);
            }
            ElementState::Closed => {
                if let Some(sub) = &self.sub {
                    set.extend(sub.possible(schema));
                }
                if let Some(name) = &self.seen_name {
                    set.insert(PossibleEvent::EndTag(name.clone()));
                }
            }
            ElementState::Done => {}
        }
        set
    }

    fn fire_event(&mut self, schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        match self.state {
            ElementState::Initial => match event {
                Event::EnterStartTag(name) => {
                    if !self.name_class.contains_name(name) {
                        return FireResult::NotMatched;
                    }
                    self.state = ElementState::NameSeen;
                    self.seen_name = Some(name.clone());
                    self.sub = Some(walker_for(schema, self.content));
                    FireResult::Accepted
                }
                Event::Text(t) if is_whitespace(t) => FireResult::Accepted,
                _ => FireResult::NotMatched,
            },
            ElementState::NameSeen => match event {
                Event::LeaveStartTag => {
                    self.state = ElementState::Closed;
                    let sub = self.sub.as_mut().expect("content walker exists");
                    // finalize the attribute phase; other obligations are
                    // reported when the end tag arrives
                    let errors = sub.end(schema, true);
                    sub.suppress_attributes();
                    if errors.is_empty() {
                        FireResult::Accepted
                    } else {
                        FireResult::Errors(errors)
                    }
                }
                _ => self
                    .sub
                    .as_mut()
                    .expect("content walker exists")
                    .fire_event(schema, ns, event),
            },
            ElementState::Closed => match event {
                Event::EndTag(name) if Some(name) == self.seen_name.as_ref() => {
                    let errors = self
                        .sub
                        .as_mut()
                        .expect("content walker exists")
                        .end(schema, false);
                    self.state = ElementState::Done;
                    if errors.is_empty() {
                        FireResult::Accepted
                    } else {
                        FireResult::Errors(errors)
                    }
                }
                _ => self
                    .sub
                    .as_mut()
                    .expect("content walker exists")
                    .fire_event(schema, ns, event),
            },
            ElementState::Done => match event {
                Event::Text(t) if is_whitespace(t) => FireResult::Accepted,
                _ => FireResult::NotMatched,
            },
        }
    }

    fn can_end(&self, _schema: &Schema, attribute_phase: bool) -> bool {
        attribute_phase || self.state == ElementState::Done
    }

    fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        if attribute_phase {
            return Vec::new();
        }
        match self.state {
            ElementState::Done => Vec::new(),
            ElementState::Initial => vec![ValidationError::ElementName {
                msg: "element missing",
                name: self.name_class.clone(),
            }],
            // an unclosed element means the host stream was cut short
            ElementState::NameSeen | ElementState::Closed => {
                let mut errors = self
                    .sub
                    .as_mut()
                    .map(|sub| sub.end(schema, false))
                    .unwrap_or_default();
                errors.push(ValidationError::ElementName {
                    msg: "element not closed",
                    name: self.name_class.clone(),
                });
                errors
            }
        }
    }
}

// --- Combinators ---

#[derive(Clone, Debug)]
pub struct ChoiceWalker {
    a: Option<Walker>,
    b: Option<Walker>,
}

impl ChoiceWalker {
    fn possible(&self, schema: &Schema) -> EventSet {
        let mut set = EventSet::default();
        if let Some(a) = &self.a {
            set.extend(a.possible(schema));
        }
        if let Some(b) = &self.b {
            set.extend(b.possible(schema));
        }
        set
    }

    fn fire_event(&mut self, schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        match (&mut self.a, &mut self.b) {
            (Some(a), Some(b)) => {
                // the first side to produce a result other than NotMatched
                // commits; the other side is dropped
                match a.fire_event(schema, ns, event) {
                    FireResult::NotMatched => {}
                    result => {
                        self.b = None;
                        return result;
                    }
                }
                match b.fire_event(schema, ns, event) {
                    FireResult::NotMatched => FireResult::NotMatched,
                    result => {
                        self.a = None;
                        result
                    }
                }
            }
            (Some(only), None) | (None, Some(only)) => only.fire_event(schema, ns, event),
            (None, None) => FireResult::NotMatched,
        }
    }

    fn can_end(&self, schema: &Schema, attribute_phase: bool) -> bool {
        self.a
            .as_ref()
            .map(|a| a.can_end(schema, attribute_phase))
            .unwrap_or(false)
            || self
                .b
                .as_ref()
                .map(|b| b.can_end(schema, attribute_phase))
                .unwrap_or(false)
    }

    fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        match (&mut self.a, &mut self.b) {
            (Some(a), Some(b)) => {
                if a.can_end(schema, attribute_phase) {
                    return a.end(schema, attribute_phase);
                }
                if b.can_end(schema, attribute_phase) {
                    return b.end(schema, attribute_phase);
                }
                let left = a.end(schema, attribute_phase);
                let right = b.end(schema, attribute_phase);
                let only_element_names = !left.is_empty()
                    && !right.is_empty()
                    && left.iter().chain(right.iter()).all(|e| e.is_element_name());
                if only_element_names {
                    let mut names = Vec::new();
                    for error in left.iter().chain(right.iter()) {
                        for name in error.expected_names() {
                            if !names.contains(&name) {
                                names.push(name);
                            }
                        }
                    }
                    vec![ValidationError::Choice {
                        msg: "element missing, expected",
                        names,
                    }]
                } else {
                    // mixed failures degrade to whichever side failed first
                    left
                }
            }
            (Some(only), None) | (None, Some(only)) => only.end(schema, attribute_phase),
            (None, None) => Vec::new(),
        }
    }

    fn suppress_attributes(&mut self) {
        if let Some(a) = &mut self.a {
            a.suppress_attributes();
        }
        if let Some(b) = &mut self.b {
            b.suppress_attributes();
        }
    }
}

#[derive(Clone, Debug)]
pub struct GroupWalker {
    a: Walker,
    b: Walker,
    a_done: bool,
}

impl GroupWalker {
    fn possible(&self, schema: &Schema) -> EventSet {
        if self.a_done {
            return self.b.possible(schema);
        }
        let mut set = self.a.possible(schema);
        if self.a.can_end(schema, false) {
            set.extend(self.b.possible(schema));
        } else {
            // attribute order is free, so the right side's attributes are
            // reachable before the left side's content is finished
            set.extend(
                self.b
                    .possible(schema)
                    .into_iter()
                    .filter(|e| e.is_attribute()),
            );
        }
        set
    }

    fn fire_event(&mut self, schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        if self.a_done {
            return self.b.fire_event(schema, ns, event);
        }
        match self.a.fire_event(schema, ns, event) {
            FireResult::NotMatched => {}
            result => return result,
        }
        if event.is_attribute() {
            // cross into the right side without retiring the left
            return self.b.fire_event(schema, ns, event);
        }
        match self.b.fire_event(schema, ns, event) {
            FireResult::NotMatched => FireResult::NotMatched,
            result => {
                // only the right side accepts: the left is over, and owes
                // us its residual errors
                let errors = self.a.end(schema, false);
                self.a_done = true;
                merge_result(errors, result)
            }
        }
    }

    fn can_end(&self, schema: &Schema, attribute_phase: bool) -> bool {
        (self.a_done || self.a.can_end(schema, attribute_phase))
            && self.b.can_end(schema, attribute_phase)
    }

    fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        let mut errors = if self.a_done {
            Vec::new()
        } else {
            self.a.end(schema, attribute_phase)
        };
        errors.extend(self.b.end(schema, attribute_phase));
        errors
    }

    fn suppress_attributes(&mut self) {
        self.a.suppress_attributes();
        self.b.suppress_attributes();
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum Side {
    A,
    B,
}

#[derive(Clone, Debug)]
pub struct InterleaveWalker {
    a: Walker,
    b: Walker,
    /// Which side consumed the last non-attribute event. That side keeps
    /// the floor until it can end; the restrictions guarantee the handoff
    /// is unambiguous.
    active: Option<Side>,
}

impl InterleaveWalker {
    fn possible(&self, schema: &Schema) -> EventSet {
        if let Some(side) = self.active {
            let (active, other) = match side {
                Side::A => (&self.a, &self.b),
                Side::B => (&self.b, &self.a),
            };
            if !active.can_end(schema, false) {
                let mut set = active.possible(schema);
                set.extend(other.possible(schema).into_iter().filter(|e| e.is_attribute()));
                return set;
            }
        }
        let mut set = self.a.possible(schema);
        set.extend(self.b.possible(schema));
        set
    }

    fn fire_event(&mut self, schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        if event.is_attribute() {
            match self.a.fire_event(schema, ns, event) {
                FireResult::NotMatched => {}
                result => return result,
            }
            return self.b.fire_event(schema, ns, event);
        }
        match self.active {
            Some(side) => {
                let (active, other) = match side {
                    Side::A => (&mut self.a, &mut self.b),
                    Side::B => (&mut self.b, &mut self.a),
                };
                match active.fire_event(schema, ns, event) {
                    FireResult::NotMatched => {}
                    result => return result,
                }
                if active.can_end(schema, false) {
                    match other.fire_event(schema, ns, event) {
                        FireResult::NotMatched => FireResult::NotMatched,
                        result => {
                            self.active = Some(match side {
                                Side::A => Side::B,
                                Side::B => Side::A,
                            });
                            result
                        }
                    }
                } else {
                    FireResult::NotMatched
                }
            }
            None => {
                match self.a.fire_event(schema, ns, event) {
                    FireResult::NotMatched => {}
                    result => {
                        self.active = Some(Side::A);
                        return result;
                    }
                }
                match self.b.fire_event(schema, ns, event) {
                    FireResult::NotMatched => FireResult::NotMatched,
                    result => {
                        self.active = Some(Side::B);
                        result
                    }
                }
            }
        }
    }

    fn can_end(&self, schema: &Schema, attribute_phase: bool) -> bool {
        self.a.can_end(schema, attribute_phase) && self.b.can_end(schema, attribute_phase)
    }

    fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        let mut errors = self.a.end(schema, attribute_phase);
        errors.extend(self.b.end(schema, attribute_phase));
        errors
    }

    fn suppress_attributes(&mut self) {
        self.a.suppress_attributes();
        self.b.suppress_attributes();
    }
}

#[derive(Clone, Debug)]
pub struct OneOrMoreWalker {
    child: PatId,
    current: Walker,
    suppressed: bool,
}

impl OneOrMoreWalker {
    fn possible(&self, schema: &Schema) -> EventSet {
        let mut set = self.current.possible(schema);
        if self.current.can_end(schema, false) {
            let mut next = walker_for(schema, self.child);
            if self.suppressed {
                next.suppress_attributes();
            }
            set.extend(next.possible(schema));
        }
        set
    }

    fn fire_event(&mut self, schema: &Schema, ns: &dyn Namespaces, event: &Event) -> FireResult {
        match self.current.fire_event(schema, ns, event) {
            FireResult::NotMatched => {}
            result => return result,
        }
        if !self.current.can_end(schema, event.is_attribute()) {
            return FireResult::NotMatched;
        }
        let mut next = walker_for(schema, self.child);
        if self.suppressed {
            next.suppress_attributes();
        }
        match next.fire_event(schema, ns, event) {
            FireResult::NotMatched => FireResult::NotMatched,
            result => {
                let errors = self.current.end(schema, false);
                self.current = next;
                merge_result(errors, result)
            }
        }
    }

    fn can_end(&self, schema: &Schema, attribute_phase: bool) -> bool {
        self.current.can_end(schema, attribute_phase)
    }

    fn end(&mut self, schema: &Schema, attribute_phase: bool) -> Vec<ValidationError> {
        self.current.end(schema, attribute_phase)
    }

    fn suppress_attributes(&mut self) {
        self.suppressed = true;
        self.current.suppress_attributes();
    }
}
