//! End-to-end validation scenarios driven through the public event API.

use rng_model::{Compiler, Resource, Resources, Schema, SchemaError};
use rng_validator::walker::walker_for;
use rng_validator::{DocumentDriver, Event, ValidationError, Validator};
use rng_model::ExpandedName;
use std::collections::HashMap;
use url::Url;

const NS: &str = "http://relaxng.org/ns/structure/1.0";

struct MapResources(HashMap<String, String>);

impl Resources for MapResources {
    fn load(&self, url: &Url) -> Result<Resource, SchemaError> {
        let text = self
            .0
            .get(url.as_str())
            .ok_or_else(|| SchemaError::ResourceLoad {
                url: url.to_string(),
                detail: "no such entry".to_string(),
            })?;
        Ok(Resource::new(url.clone(), text.clone()))
    }
}

struct Fixture {
    schema: Schema,
}

impl Fixture {
    fn correct(body: &str) -> Fixture {
        let mut map = HashMap::new();
        map.insert("file:///main.rng".to_string(), body.to_string());
        let compiler = Compiler::new(MapResources(map));
        let url = Url::parse("file:///main.rng").unwrap();
        let compiled = match compiler.compile(&url) {
            Ok(compiled) => compiled,
            Err(e) => panic!("schema failed to compile: {}", e),
        };
        Fixture {
            schema: compiled.schema,
        }
    }

    fn invalid_schema(body: &str) -> SchemaError {
        let mut map = HashMap::new();
        map.insert("file:///main.rng".to_string(), body.to_string());
        let compiler = Compiler::new(MapResources(map));
        let url = Url::parse("file:///main.rng").unwrap();
        match compiler.compile(&url) {
            Ok(_) => panic!("schema unexpectedly compiled"),
            Err(e) => e,
        }
    }

    /// Fire the events in order, returning one error list per event.
    fn run(&self, events: Vec<Event>) -> Vec<Vec<ValidationError>> {
        let mut validator = Validator::new(&self.schema);
        let mut out = Vec::new();
        for event in events {
            out.push(validator.fire_event(event));
        }
        out
    }
}

fn name(local: &str) -> ExpandedName {
    ExpandedName::new("", local)
}

fn enter(local: &str) -> Event {
    Event::EnterStartTag(name(local))
}

fn end_tag(local: &str) -> Event {
    Event::EndTag(name(local))
}

fn text(t: &str) -> Event {
    Event::Text(t.to_string())
}

fn no_errors(results: &[Vec<ValidationError>]) {
    for (i, errors) in results.iter().enumerate() {
        assert!(errors.is_empty(), "event {} produced {:?}", i, errors);
    }
}

// --- S1: empty element ---

#[test]
fn empty_element_accepts_an_empty_document() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}"><empty/></element>"#,
        NS
    ));
    no_errors(&fx.run(vec![enter("a"), Event::LeaveStartTag, end_tag("a")]));
}

#[test]
fn empty_element_absorbs_whitespace_text() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}"><empty/></element>"#,
        NS
    ));
    no_errors(&fx.run(vec![
        enter("a"),
        Event::LeaveStartTag,
        text(" "),
        end_tag("a"),
    ]));
}

#[test]
fn empty_element_rejects_real_text() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}"><empty/></element>"#,
        NS
    ));
    let results = fx.run(vec![
        enter("a"),
        Event::LeaveStartTag,
        text("x"),
        end_tag("a"),
    ]);
    assert!(results[0].is_empty());
    assert!(results[1].is_empty());
    assert_eq!(
        results[2],
        vec![ValidationError::validation("text not allowed here")]
    );
    assert!(results[3].is_empty());
}

// --- S2: required attribute ---

#[test]
fn missing_attribute_is_reported_on_leave_start_tag() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}">
             <attribute name="x"><text/></attribute>
           </element>"#,
        NS
    ));
    let results = fx.run(vec![enter("a"), Event::LeaveStartTag, end_tag("a")]);
    assert!(results[0].is_empty());
    assert_eq!(results[1].len(), 1, "got {:?}", results[1]);
    assert_eq!(results[1][0].to_string(), "attribute missing: x");
    assert!(results[2].is_empty());
}

#[test]
fn present_attribute_validates() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}">
             <attribute name="x"><text/></attribute>
           </element>"#,
        NS
    ));
    no_errors(&fx.run(vec![
        enter("a"),
        Event::AttributeName(name("x")),
        Event::AttributeValue("v".to_string()),
        Event::LeaveStartTag,
        end_tag("a"),
    ]));
}

#[test]
fn unexpected_attribute_swallows_its_value() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}"><empty/></element>"#,
        NS
    ));
    let results = fx.run(vec![
        enter("a"),
        Event::AttributeName(name("bogus")),
        Event::AttributeValue("v".to_string()),
        Event::LeaveStartTag,
        end_tag("a"),
    ]);
    assert_eq!(results[1].len(), 1);
    assert_eq!(
        results[1][0].to_string(),
        "attribute not allowed here: bogus"
    );
    // the orphaned value produces no second report
    assert!(results[2].is_empty());
    no_errors(&results[3..]);
}

// --- S3: choice ---

const CHOICE_SCHEMA: &str = r#"<element name="r" xmlns="http://relaxng.org/ns/structure/1.0">
  <choice>
    <element name="a"><empty/></element>
    <element name="b"><empty/></element>
  </choice>
</element>"#;

#[test]
fn choice_accepts_either_branch() {
    let fx = Fixture::correct(CHOICE_SCHEMA);
    no_errors(&fx.run(vec![
        enter("r"),
        Event::LeaveStartTag,
        enter("a"),
        Event::LeaveStartTag,
        end_tag("a"),
        end_tag("r"),
    ]));
    no_errors(&fx.run(vec![
        enter("r"),
        Event::LeaveStartTag,
        enter("b"),
        Event::LeaveStartTag,
        end_tag("b"),
        end_tag("r"),
    ]));
}

#[test]
fn choice_miss_lists_both_alternatives() {
    let fx = Fixture::correct(CHOICE_SCHEMA);
    let results = fx.run(vec![
        enter("r"),
        Event::LeaveStartTag,
        enter("c"),
        Event::LeaveStartTag,
        end_tag("c"),
        end_tag("r"),
    ]);
    assert_eq!(results[2].len(), 1, "got {:?}", results[2]);
    let message = results[2][0].to_string();
    assert!(
        message.contains("a") && message.contains("b"),
        "expected both alternatives in {:?}",
        message
    );
    assert!(matches!(
        results[2][0],
        ValidationError::Choice { ref names, .. } if names.len() == 2
    ));
    // no cascading errors after recovery
    no_errors(&results[3..]);
    // the missing alternative is still reported at the end of r
    assert_eq!(results[5].len(), 1, "got {:?}", results[5]);
}

// --- S4: interleave restriction ---

#[test]
fn interleave_text_clash_fails_before_validation() {
    let err = Fixture::invalid_schema(&format!(
        r#"<element name="a" xmlns="{}">
             <interleave><text/><text/></interleave>
           </element>"#,
        NS
    ));
    assert!(matches!(err, SchemaError::InterleaveTextClash { .. }));
}

// --- S5: QName values resolve through the live context ---

#[test]
fn qname_value_matches_any_alias_prefix() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}" xmlns:foo="urn:x"
                datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
             <value type="QName">foo:bar</value>
           </element>"#,
        NS
    ));
    let mut validator = Validator::new(&fx.schema);
    validator.enter_context();
    validator.define_prefix("other", "urn:x").unwrap();
    assert!(validator.fire_event(enter("a")).is_empty());
    assert!(validator.fire_event(Event::LeaveStartTag).is_empty());
    assert!(validator.fire_event(text("other:bar")).is_empty());
    assert!(validator.fire_event(end_tag("a")).is_empty());

    // an unbound prefix cannot match
    let mut validator = Validator::new(&fx.schema);
    assert!(validator.fire_event(enter("a")).is_empty());
    assert!(validator.fire_event(Event::LeaveStartTag).is_empty());
    assert!(!validator.fire_event(text("foo:bar")).is_empty());
}

// --- S6: misplaced-tag recovery ---

#[test]
fn misplaced_tag_reports_once() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}"><empty/></element>"#,
        NS
    ));
    let results = fx.run(vec![
        enter("a"),
        Event::LeaveStartTag,
        enter("b"),
        Event::LeaveStartTag,
        end_tag("b"),
        end_tag("a"),
    ]);
    assert_eq!(results[2].len(), 1, "got {:?}", results[2]);
    assert_eq!(results[2][0].to_string(), "tag not allowed here: b");
    no_errors(&results[3..]);
}

#[test]
fn misplaced_known_element_is_still_validated() {
    // `b` is defined elsewhere in the schema, so the recovered subtree is
    // checked against its definition.
    let fx = Fixture::correct(&format!(
        r#"<grammar xmlns="{}">
             <start><ref name="root"/></start>
             <define name="root">
               <element name="root"><element name="a"><ref name="b"/></element></element>
             </define>
             <define name="b">
               <element name="b"><attribute name="must"><text/></attribute></element>
             </define>
           </grammar>"#,
        NS
    ));
    let results = fx.run(vec![
        enter("root"),
        Event::LeaveStartTag,
        // b appears where only a is allowed
        enter("b"),
        Event::LeaveStartTag,
        end_tag("b"),
        enter("a"),
        Event::LeaveStartTag,
        enter("b"),
        Event::AttributeName(name("must")),
        Event::AttributeValue("v".to_string()),
        Event::LeaveStartTag,
        end_tag("b"),
        end_tag("a"),
        end_tag("root"),
    ]);
    // the misplacement is reported...
    assert_eq!(results[2].len(), 1);
    // ...and so is the missing attribute inside the recovered subtree
    assert_eq!(results[3].len(), 1, "got {:?}", results[3]);
    assert_eq!(results[3][0].to_string(), "attribute missing: must");
    no_errors(&results[4..]);
}

// --- Structured content ---

#[test]
fn one_or_more_loops() {
    let fx = Fixture::correct(&format!(
        r#"<element name="l" xmlns="{}">
             <oneOrMore><element name="i"><text/></element></oneOrMore>
           </element>"#,
        NS
    ));
    no_errors(&fx.run(vec![
        enter("l"),
        Event::LeaveStartTag,
        enter("i"),
        Event::LeaveStartTag,
        text("one"),
        end_tag("i"),
        enter("i"),
        Event::LeaveStartTag,
        text("two"),
        end_tag("i"),
        end_tag("l"),
    ]));
}

#[test]
fn group_enforces_order() {
    let fx = Fixture::correct(&format!(
        r#"<element name="g" xmlns="{}">
             <group>
               <element name="a"><empty/></element>
               <element name="b"><empty/></element>
             </group>
           </element>"#,
        NS
    ));
    no_errors(&fx.run(vec![
        enter("g"),
        Event::LeaveStartTag,
        enter("a"),
        Event::LeaveStartTag,
        end_tag("a"),
        enter("b"),
        Event::LeaveStartTag,
        end_tag("b"),
        end_tag("g"),
    ]));
    let results = fx.run(vec![
        enter("g"),
        Event::LeaveStartTag,
        enter("b"),
        Event::LeaveStartTag,
        end_tag("b"),
        end_tag("g"),
    ]);
    // b-before-a surfaces the missing a
    assert!(!results[2].is_empty() || !results[5].is_empty());
}

#[test]
fn interleave_accepts_both_orders() {
    let schema = format!(
        r#"<element name="r" xmlns="{}">
             <interleave>
               <element name="a"><empty/></element>
               <element name="b"><empty/></element>
             </interleave>
           </element>"#,
        NS
    );
    for order in [["a", "b"], ["b", "a"]] {
        let fx = Fixture::correct(&schema);
        let mut events = vec![enter("r"), Event::LeaveStartTag];
        for tag in order {
            events.push(enter(tag));
            events.push(Event::LeaveStartTag);
            events.push(end_tag(tag));
        }
        events.push(end_tag("r"));
        no_errors(&fx.run(events));
    }
}

#[test]
fn list_splits_tokens() {
    let fx = Fixture::correct(&format!(
        r#"<element name="e" xmlns="{}"
                datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
             <list><oneOrMore><data type="int"/></oneOrMore></list>
           </element>"#,
        NS
    ));
    no_errors(&fx.run(vec![
        enter("e"),
        Event::LeaveStartTag,
        text("1 2 3"),
        end_tag("e"),
    ]));
    let results = fx.run(vec![
        enter("e"),
        Event::LeaveStartTag,
        text("1 x 3"),
        end_tag("e"),
    ]);
    assert!(!results[2].is_empty(), "got {:?}", results);
}

#[test]
fn data_except_rejects_excluded_values() {
    let fx = Fixture::correct(&format!(
        r#"<element name="e" xmlns="{}"
                datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
             <data type="token">
               <except><value type="token">forbidden</value></except>
             </data>
           </element>"#,
        NS
    ));
    no_errors(&fx.run(vec![
        enter("e"),
        Event::LeaveStartTag,
        text("allowed"),
        end_tag("e"),
    ]));
    let results = fx.run(vec![
        enter("e"),
        Event::LeaveStartTag,
        text("forbidden"),
        end_tag("e"),
    ]);
    assert!(!results[2].is_empty());
}

// --- API contract ---

#[test]
fn two_text_events_are_a_misuse() {
    let fx = Fixture::correct(&format!(
        r#"<element name="a" xmlns="{}"><text/></element>"#,
        NS
    ));
    let results = fx.run(vec![
        enter("a"),
        Event::LeaveStartTag,
        text("one"),
        text("two"),
    ]);
    assert!(matches!(
        results[3].first(),
        Some(ValidationError::ApiMisuse { .. })
    ));
}

#[test]
fn walker_clones_are_independent() {
    let fx = Fixture::correct(CHOICE_SCHEMA);
    let resolver = rng_validator::NameResolver::new();
    let mut original = walker_for(&fx.schema, fx.schema.start());

    let mut probe = original.clone();
    let result = probe.fire_event(&fx.schema, &resolver, &enter("r"));
    assert!(matches!(result, rng_validator::FireResult::Accepted));

    // the original is untouched: it still accepts the same start tag, and
    // replaying the sequence on original and clone gives identical outcomes
    let events = vec![
        enter("r"),
        Event::LeaveStartTag,
        enter("a"),
        Event::LeaveStartTag,
        end_tag("a"),
        end_tag("r"),
    ];
    let mut clone = original.clone();
    for event in &events {
        let a = original.fire_event(&fx.schema, &resolver, event);
        let b = clone.fire_event(&fx.schema, &resolver, event);
        assert_eq!(
            std::mem::discriminant(&a),
            std::mem::discriminant(&b),
            "diverged on {}",
            event
        );
        assert!(matches!(a, rng_validator::FireResult::Accepted));
    }
}

// --- Driving raw XML ---

#[test]
fn document_driver_runs_a_real_document() {
    let fx = Fixture::correct(&format!(
        r#"<element name="doc" xmlns="{}" ns="urn:d">
             <attribute name="id"><text/></attribute>
             <zeroOrMore>
               <element name="item"><text/></element>
             </zeroOrMore>
           </element>"#,
        NS
    ));
    let xml = r#"<?xml version="1.0"?>
<doc xmlns="urn:d" id="d1">
  <item>first &amp; foremost</item>
  <item><![CDATA[second]]></item>
</doc>"#;
    let mut driver = DocumentDriver::new(&fx.schema, xml);
    while let Some(step) = driver.validate_next() {
        let report = step.expect("well-formed document");
        assert!(report.errors.is_empty(), "unexpected {:?}", report.errors);
    }
    assert!(driver.finish().errors.is_empty());
}

#[test]
fn document_driver_reports_invalid_content() {
    let fx = Fixture::correct(&format!(
        r#"<element name="doc" xmlns="{}"><empty/></element>"#,
        NS
    ));
    let xml = "<doc>stray</doc>";
    let mut driver = DocumentDriver::new(&fx.schema, xml);
    let mut total = 0;
    while let Some(step) = driver.validate_next() {
        total += step.expect("well-formed document").errors.len();
    }
    total += driver.finish().errors.len();
    assert!(total > 0);
}
