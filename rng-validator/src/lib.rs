//! Event-driven document validation against a compiled schema.
//!
//! [`Validator`] is the public surface: feed it the event stream of one
//! document and collect per-event error lists (empty list = the document
//! conforms so far). [`DocumentDriver`] adapts an `xmlparser` token stream
//! to that event API, resolving namespaces and expanding entities, and can
//! render failures through `codemap-diagnostic`.

mod error;
pub mod event;
pub mod resolver;
pub mod walker;

pub use error::ValidationError;
pub use event::{Event, EventSet, PossibleEvent};
pub use resolver::{NameResolver, ResolverError};
pub use walker::{walker_for, FireResult, Walker};

use rng_model::{ExpandedName, NameClass, Schema};
use std::collections::HashMap;
use std::ops::Range;
use walker::is_whitespace;
use xmlparser::{ElementEnd, EntityDefinition, StrSpan, Token, Tokenizer};

enum RecoveryFrame {
    /// A misplaced element with exactly one definition: validate it in
    /// isolation so nested errors still get reported.
    Misplaced { walker: Walker, depth: u32 },
    /// Unknown content: count nesting and swallow events until it closes.
    Skip { depth: u32 },
}

/// Owns one validation session: the name resolver, the root walker, the
/// whitespace suspension buffer, and the misplaced-element stack. The
/// schema is shared and immutable; many sessions may validate against it
/// concurrently.
pub struct Validator<'s> {
    schema: &'s Schema,
    resolver: NameResolver,
    root: Walker,
    suspended_text: Option<String>,
    prev_was_text: bool,
    swallow_attribute_value: bool,
    recovery: Vec<RecoveryFrame>,
}

impl<'s> Validator<'s> {
    pub fn new(schema: &'s Schema) -> Validator<'s> {
        Validator {
            schema,
            resolver: NameResolver::new(),
            root: walker_for(schema, schema.start()),
            suspended_text: None,
            prev_was_text: false,
            swallow_attribute_value: false,
            recovery: Vec::new(),
        }
    }

    // The three pseudo-events. They only mutate the resolver.

    pub fn enter_context(&mut self) {
        self.resolver.enter_context();
    }

    pub fn leave_context(&mut self) -> Result<(), ResolverError> {
        self.resolver.leave_context()
    }

    pub fn define_prefix(&mut self, prefix: &str, uri: &str) -> Result<(), ResolverError> {
        self.resolver.define_prefix(prefix, uri)
    }

    pub fn resolve_name(
        &self,
        name: &str,
        is_attribute: bool,
    ) -> Result<ExpandedName, ResolverError> {
        self.resolver.resolve_name(name, is_attribute)
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    /// Events the document could legally produce next.
    pub fn possible(&self) -> EventSet {
        match self.recovery.last() {
            Some(RecoveryFrame::Misplaced { walker, .. }) => walker.possible(self.schema),
            Some(RecoveryFrame::Skip { .. }) => EventSet::default(),
            None => self.root.possible(self.schema),
        }
    }

    /// Advance by one event. The returned list is empty when the document
    /// still conforms; validation always continues regardless.
    pub fn fire_event(&mut self, event: Event) -> Vec<ValidationError> {
        if matches!(event, Event::Text(_)) {
            if self.prev_was_text {
                return vec![ValidationError::ApiMisuse {
                    msg: "two text events in a row",
                }];
            }
            self.prev_was_text = true;
        } else {
            self.prev_was_text = false;
        }

        if self.swallow_attribute_value {
            self.swallow_attribute_value = false;
            if matches!(event, Event::AttributeValue(_)) {
                return Vec::new();
            }
        }

        match event {
            // Whitespace between tags is suspended: dropped when a start
            // tag follows, fired late otherwise. This is what keeps
            // "text not allowed here" from firing on pretty-printing.
            Event::Text(text) => {
                if is_whitespace(&text) {
                    match &mut self.suspended_text {
                        Some(buffer) => buffer.push_str(&text),
                        None => self.suspended_text = Some(text),
                    }
                    Vec::new()
                } else {
                    let merged = match self.suspended_text.take() {
                        Some(mut ws) => {
                            ws.push_str(&text);
                            ws
                        }
                        None => text,
                    };
                    self.dispatch(Event::Text(merged))
                }
            }
            Event::EnterStartTag(_) => {
                self.suspended_text = None;
                self.dispatch(event)
            }
            other => {
                let mut errors = Vec::new();
                if let Some(ws) = self.suspended_text.take() {
                    errors.extend(self.dispatch(Event::Text(ws)));
                }
                errors.extend(self.dispatch(other));
                errors
            }
        }
    }

    /// Close the session and report anything the document still owes.
    pub fn end(&mut self) -> Vec<ValidationError> {
        self.suspended_text = None;
        self.root.end(self.schema, false)
    }

    fn dispatch(&mut self, event: Event) -> Vec<ValidationError> {
        if let Some(frame) = self.recovery.last_mut() {
            match frame {
                RecoveryFrame::Skip { depth } => {
                    match &event {
                        Event::EnterStartTag(_) => *depth += 1,
                        Event::EndTag(_) => {
                            *depth -= 1;
                            if *depth == 0 {
                                self.recovery.pop();
                            }
                        }
                        _ => {}
                    }
                    return Vec::new();
                }
                RecoveryFrame::Misplaced { walker, depth } => {
                    match &event {
                        Event::EnterStartTag(_) => *depth += 1,
                        Event::EndTag(_) => *depth -= 1,
                        _ => {}
                    }
                    let result = walker.fire_event(self.schema, &self.resolver, &event);
                    let done = *depth == 0;
                    if done {
                        self.recovery.pop();
                    }
                    return match result {
                        FireResult::Accepted | FireResult::NotMatched => Vec::new(),
                        FireResult::Errors(errors) => errors,
                    };
                }
            }
        }

        match self.root.fire_event(self.schema, &self.resolver, &event) {
            FireResult::Accepted => Vec::new(),
            FireResult::Errors(errors) => errors,
            FireResult::NotMatched => self.not_matched(event),
        }
    }

    /// No walker claimed the event: synthesize a diagnostic and, for start
    /// tags, arrange recovery so the rest of the subtree does not cascade.
    fn not_matched(&mut self, event: Event) -> Vec<ValidationError> {
        match event {
            Event::EnterStartTag(name) => {
                let options: Vec<NameClass> = self
                    .root
                    .possible(self.schema)
                    .into_iter()
                    .filter_map(|e| match e {
                        PossibleEvent::EnterStartTag(nc) => Some(nc),
                        _ => None,
                    })
                    .collect();
                let error = if options.len() >= 2 {
                    ValidationError::Choice {
                        msg: "tag not allowed here, expected",
                        names: options,
                    }
                } else {
                    ValidationError::ElementName {
                        msg: "tag not allowed here",
                        name: NameClass::named(&name.namespace_uri, &name.local_name),
                    }
                };

                let candidates = self.schema.element_definitions(&name);
                log::debug!(
                    "recovering from misplaced {} ({} candidate definitions)",
                    name,
                    candidates.len()
                );
                if candidates.len() == 1 {
                    let mut walker = walker_for(self.schema, candidates[0]);
                    // matches by construction of the index
                    let _ = walker.fire_event(
                        self.schema,
                        &self.resolver,
                        &Event::EnterStartTag(name),
                    );
                    self.recovery
                        .push(RecoveryFrame::Misplaced { walker, depth: 1 });
                } else {
                    self.recovery.push(RecoveryFrame::Skip { depth: 1 });
                }
                vec![error]
            }
            Event::AttributeName(name) => {
                self.swallow_attribute_value = true;
                vec![ValidationError::AttributeName {
                    msg: "attribute not allowed here",
                    name: NameClass::named(&name.namespace_uri, &name.local_name),
                }]
            }
            Event::AttributeValue(_) => {
                vec![ValidationError::validation("unexpected attribute value")]
            }
            Event::Text(_) => vec![ValidationError::validation("text not allowed here")],
            Event::LeaveStartTag => {
                vec![ValidationError::validation("unexpected end of start tag")]
            }
            Event::EndTag(name) => vec![ValidationError::ElementName {
                msg: "unexpected end tag",
                name: NameClass::named(&name.namespace_uri, &name.local_name),
            }],
        }
    }
}

// --- Driving a raw XML document through the event API ---

#[derive(Debug)]
pub enum DriverError {
    Xml(xmlparser::Error),
    UndefinedNamespacePrefix { prefix: String, span: Range<usize> },
    UndefinedEntity { name: String, span: Range<usize> },
    InvalidOrUnclosedEntity { span: Range<usize> },
    Resolver(ResolverError),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Xml(e) => e.fmt(f),
            DriverError::UndefinedNamespacePrefix { prefix, .. } => {
                write!(f, "the prefix {:?} is not defined", prefix)
            }
            DriverError::UndefinedEntity { name, .. } => {
                write!(f, "the entity &{}; is not defined", name)
            }
            DriverError::InvalidOrUnclosedEntity { .. } => {
                f.write_str("invalid or unclosed entity reference")
            }
            DriverError::Resolver(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for DriverError {}

/// Validation errors a single token produced, with its byte span.
#[derive(Debug)]
pub struct Report {
    pub errors: Vec<ValidationError>,
    pub span: Range<usize>,
}

struct PendingAttr {
    qname: String,
    value: String,
    span: Range<usize>,
}

/// Streams `xmlparser` tokens into a [`Validator`]: buffers attributes
/// until the start tag closes, maintains namespace contexts, expands the
/// predefined and locally declared entities, and merges text runs split
/// by CDATA sections or character references.
pub struct DocumentDriver<'a, 's> {
    tokenizer: Tokenizer<'a>,
    validator: Validator<'s>,
    pending_element: Option<(String, Range<usize>)>,
    pending_attrs: Vec<PendingAttr>,
    pending_ns: Vec<(String, String)>,
    open_names: Vec<ExpandedName>,
    text_buffer: String,
    text_span: Range<usize>,
    entity_definitions: HashMap<String, String>,
}

impl<'a, 's> DocumentDriver<'a, 's> {
    pub fn new(schema: &'s Schema, text: &'a str) -> DocumentDriver<'a, 's> {
        let mut entity_definitions = HashMap::new();
        entity_definitions.insert("lt".to_string(), "<".to_string());
        entity_definitions.insert("gt".to_string(), ">".to_string());
        entity_definitions.insert("amp".to_string(), "&".to_string());
        entity_definitions.insert("apos".to_string(), "'".to_string());
        entity_definitions.insert("quot".to_string(), "\"".to_string());
        DocumentDriver {
            tokenizer: Tokenizer::from(text),
            validator: Validator::new(schema),
            pending_element: None,
            pending_attrs: Vec::new(),
            pending_ns: Vec::new(),
            open_names: Vec::new(),
            text_buffer: String::new(),
            text_span: 0..0,
            entity_definitions,
        }
    }

    pub fn validator(&self) -> &Validator<'s> {
        &self.validator
    }

    /// Validate the next token. `None` once the document is exhausted; the
    /// final residual errors come from [`DocumentDriver::finish`].
    pub fn validate_next(&mut self) -> Option<Result<Report, DriverError>> {
        match self.tokenizer.next() {
            Some(Ok(token)) => Some(self.consume(token)),
            Some(Err(e)) => Some(Err(DriverError::Xml(e))),
            None => None,
        }
    }

    pub fn finish(&mut self) -> Report {
        Report {
            errors: self.validator.end(),
            span: self.text_span.clone(),
        }
    }

    fn consume(&mut self, token: Token<'a>) -> Result<Report, DriverError> {
        let mut errors = Vec::new();
        let span: Range<usize>;
        match token {
            Token::ElementStart { prefix, local, span: s } => {
                span = s.start()..s.end();
                errors.extend(self.flush_text());
                self.pending_element = Some((qname_of(&prefix, &local), span.clone()));
                self.pending_attrs.clear();
                self.pending_ns.clear();
            }
            Token::Attribute {
                prefix,
                local,
                value,
                span: s,
            } => {
                span = s.start()..s.end();
                if prefix.as_str() == "xmlns" {
                    self.pending_ns
                        .push((local.as_str().to_string(), value.as_str().to_string()));
                } else if prefix.as_str().is_empty() && local.as_str() == "xmlns" {
                    self.pending_ns
                        .push((String::new(), value.as_str().to_string()));
                } else {
                    let decoded = self.decode(value)?;
                    self.pending_attrs.push(PendingAttr {
                        qname: qname_of(&prefix, &local),
                        value: decoded,
                        span: span.clone(),
                    });
                }
            }
            Token::ElementEnd { end, span: s } => {
                span = s.start()..s.end();
                match end {
                    ElementEnd::Open => {
                        errors.extend(self.open_element(&span)?);
                    }
                    ElementEnd::Empty => {
                        errors.extend(self.open_element(&span)?);
                        errors.extend(self.close_element(None, &span)?);
                    }
                    ElementEnd::Close(prefix, local) => {
                        errors.extend(self.flush_text());
                        errors.extend(
                            self.close_element(Some(qname_of(&prefix, &local)), &span)?,
                        );
                    }
                }
            }
            Token::Text { text } => {
                span = text.start()..text.end();
                let decoded = self.decode(text)?;
                if self.text_buffer.is_empty() {
                    self.text_span = span.clone();
                } else {
                    self.text_span.end = span.end;
                }
                self.text_buffer.push_str(&decoded);
            }
            Token::Cdata { text, span: s } => {
                span = s.start()..s.end();
                if self.text_buffer.is_empty() {
                    self.text_span = span.clone();
                } else {
                    self.text_span.end = span.end;
                }
                self.text_buffer.push_str(text.as_str());
            }
            Token::EntityDeclaration {
                name, definition, ..
            } => {
                span = name.start()..name.end();
                if let EntityDefinition::EntityValue(value) = definition {
                    self.entity_definitions
                        .insert(name.as_str().to_string(), value.as_str().to_string());
                }
            }
            Token::Declaration { span: s, .. }
            | Token::ProcessingInstruction { span: s, .. }
            | Token::Comment { span: s, .. }
            | Token::DtdStart { span: s, .. }
            | Token::EmptyDtd { span: s, .. }
            | Token::DtdEnd { span: s } => {
                span = s.start()..s.end();
            }
        }
        Ok(Report { errors, span })
    }

    fn flush_text(&mut self) -> Vec<ValidationError> {
        if self.text_buffer.is_empty() {
            return Vec::new();
        }
        let text = std::mem::take(&mut self.text_buffer);
        self.validator.fire_event(Event::Text(text))
    }

    fn open_element(&mut self, span: &Range<usize>) -> Result<Vec<ValidationError>, DriverError> {
        let (qname, _element_span) = self
            .pending_element
            .take()
            .expect("start tag is pending");
        self.validator.enter_context();
        for (prefix, uri) in self.pending_ns.drain(..) {
            self.validator
                .define_prefix(&prefix, &uri)
                .map_err(DriverError::Resolver)?;
        }
        let name = self
            .validator
            .resolve_name(&qname, false)
            .map_err(|e| resolver_to_driver(e, span))?;
        self.open_names.push(name.clone());
        let mut errors = self.validator.fire_event(Event::EnterStartTag(name));
        let attrs = std::mem::take(&mut self.pending_attrs);
        for attr in attrs {
            let attr_name = self
                .validator
                .resolve_name(&attr.qname, true)
                .map_err(|e| resolver_to_driver(e, &attr.span))?;
            errors.extend(self.validator.fire_event(Event::AttributeName(attr_name)));
            errors.extend(self.validator.fire_event(Event::AttributeValue(attr.value)));
        }
        errors.extend(self.validator.fire_event(Event::LeaveStartTag));
        Ok(errors)
    }

    fn close_element(
        &mut self,
        qname: Option<String>,
        span: &Range<usize>,
    ) -> Result<Vec<ValidationError>, DriverError> {
        // For <e/>, xmlparser reports Empty without repeating the name;
        // the start tag's resolved name sits on top of the open stack. A
        // plain close tag is resolved afresh so prefixes are checked.
        let name = match qname {
            Some(qname) => {
                self.open_names.pop();
                self.validator
                    .resolve_name(&qname, false)
                    .map_err(|e| resolver_to_driver(e, span))?
            }
            None => match self.open_names.pop() {
                Some(name) => name,
                None => return Ok(Vec::new()),
            },
        };
        let errors = self.validator.fire_event(Event::EndTag(name));
        self.validator
            .leave_context()
            .map_err(DriverError::Resolver)?;
        Ok(errors)
    }

    fn decode(&self, text: StrSpan<'a>) -> Result<String, DriverError> {
        decode_entities(text.as_str(), text.start(), &self.entity_definitions)
    }
}

fn qname_of(prefix: &StrSpan<'_>, local: &StrSpan<'_>) -> String {
    if prefix.as_str().is_empty() {
        local.as_str().to_string()
    } else {
        format!("{}:{}", prefix.as_str(), local.as_str())
    }
}

fn resolver_to_driver(error: ResolverError, span: &Range<usize>) -> DriverError {
    match error {
        ResolverError::UndefinedPrefix { prefix } => DriverError::UndefinedNamespacePrefix {
            prefix,
            span: span.clone(),
        },
        other => DriverError::Resolver(other),
    }
}

/// Expand character references and named entities against the predefined
/// set plus local `<!ENTITY>` declarations.
fn decode_entities(
    text: &str,
    offset: usize,
    entities: &HashMap<String, String>,
) -> Result<String, DriverError> {
    if !text.contains('&') {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut pos = offset;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or(DriverError::InvalidOrUnclosedEntity {
                span: pos + amp..pos + amp + 1,
            })?;
        let name = &after[..semi];
        let name_span = pos + amp + 1..pos + amp + 1 + semi;
        if let Some(code) = name.strip_prefix('#') {
            let value = if let Some(hex) = code.strip_prefix('x') {
                u32::from_str_radix(hex, 16).ok()
            } else {
                code.parse().ok()
            };
            let c = value.and_then(std::char::from_u32).ok_or(
                DriverError::InvalidOrUnclosedEntity {
                    span: name_span.clone(),
                },
            )?;
            out.push(c);
        } else {
            let expansion =
                entities
                    .get(name)
                    .ok_or_else(|| DriverError::UndefinedEntity {
                        name: name.to_string(),
                        span: name_span.clone(),
                    })?;
            out.push_str(expansion);
        }
        rest = &after[semi + 1..];
        pos = pos + amp + 1 + semi + 1;
    }
    out.push_str(rest);
    Ok(out)
}

/// Render a report as compiler-style diagnostics over the document source.
pub fn diagnostics(
    name: String,
    source: String,
    report: &Report,
) -> (codemap::CodeMap, Vec<codemap_diagnostic::Diagnostic>) {
    let mut map = codemap::CodeMap::new();
    let file = map.add_file(name, source);
    let span = file
        .span
        .subspan(report.span.start as u64, report.span.end as u64);
    let diagnostics = report
        .errors
        .iter()
        .map(|error| codemap_diagnostic::Diagnostic {
            level: codemap_diagnostic::Level::Error,
            message: error.to_string(),
            code: None,
            spans: vec![codemap_diagnostic::SpanLabel {
                span,
                label: None,
                style: codemap_diagnostic::SpanStyle::Primary,
            }],
        })
        .collect();
    (map, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_predefined_and_numeric_entities() {
        let mut entities = HashMap::new();
        entities.insert("amp".to_string(), "&".to_string());
        assert_eq!(
            decode_entities("a &amp; b &#x41;&#66;", 0, &entities).unwrap(),
            "a & b AB"
        );
    }

    #[test]
    fn undefined_entity_is_reported_with_its_span() {
        let entities = HashMap::new();
        match decode_entities("xx&nope;", 10, &entities) {
            Err(DriverError::UndefinedEntity { name, span }) => {
                assert_eq!(name, "nope");
                assert_eq!(span, 13..17);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unclosed_entity_is_an_error() {
        let entities = HashMap::new();
        assert!(matches!(
            decode_entities("a&b", 0, &entities),
            Err(DriverError::InvalidOrUnclosedEntity { .. })
        ));
    }
}
