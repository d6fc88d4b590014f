//! End-to-end translation tests: wire record in, structured document out,
//! wire fragments back again.

use bibrules::{
    fragments_to_marcxml, produce, Document, DumpOptions, FunctionRegistry, Reader,
    RegistryBuilder,
};
use serde_json::json;
use std::sync::Arc;

const DEFINITIONS: &str = r#"recid:
    creator:
        marcxml, "001", value
    producer:
        json_for_marc(), { '001': '' }

title:
    creator:
        marcxml, "245..", { 'title': value['a'], 'subtitle': value['b'] }
    producer:
        json_for_marc("245__"), { '245__a': 'title.title', '245__b': 'title.subtitle' }

authors[n]:
    creator:
        marcxml, "700..", { 'full_name': value['a'] }
    producer:
        json_for_marc("700__"), { '700__a': 'full_name' }
"#;

const RECORD: &str = r#"<record xmlns="http://www.loc.gov/MARC21/slim">
    <controlfield tag="001">12345</controlfield>
    <datafield tag="245" ind1=" " ind2=" ">
        <subfield code="a">Main title</subfield>
        <subfield code="b">A subtitle</subfield>
    </datafield>
    <datafield tag="700" ind1=" " ind2=" ">
        <subfield code="a">First, Author</subfield>
    </datafield>
    <datafield tag="700" ind1=" " ind2=" ">
        <subfield code="a">Second, Author</subfield>
    </datafield>
</record>"#;

fn reader() -> Reader {
    let mut builder = RegistryBuilder::new("test");
    builder.add_field_source("test.cfg", DEFINITIONS).unwrap();
    Reader::new(
        Arc::new(builder.build(1).unwrap()),
        Arc::new(FunctionRegistry::with_builtins()),
    )
}

#[test]
fn test_translate_then_produce_round_trips() {
    let reader = reader();
    let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
    assert!(!doc.has_warnings());

    let fragments = produce(&mut doc, "json_for_marc", None);
    let xml = fragments_to_marcxml(&fragments).unwrap();
    let mut doc2 = reader.translate(&xml, "marcxml", &[]).unwrap();

    assert_eq!(doc2.get("recid"), doc.get("recid"));
    assert_eq!(doc2.get("title"), doc.get("title"));
    assert_eq!(doc2.get("authors"), doc.get("authors"));
}

#[test]
fn test_translation_is_deterministic() {
    let reader = reader();
    let mut first = reader.translate(RECORD, "marcxml", &[]).unwrap();
    let mut second = reader.translate(RECORD, "marcxml", &[]).unwrap();
    let options = DumpOptions::default();
    assert_eq!(first.dumps(&options), second.dumps(&options));
}

#[test]
fn test_produced_fragments_carry_wire_keys() {
    let reader = reader();
    let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
    let fragments = produce(&mut doc, "json_for_marc", None);

    // recid, title, one fragment per author
    assert_eq!(fragments.len(), 4);
    assert!(fragments
        .iter()
        .any(|f| f.get("001") == Some(&json!("12345"))));
    assert!(fragments
        .iter()
        .any(|f| f.get("245__a") == Some(&json!("Main title"))
            && f.get("245__b") == Some(&json!("A subtitle"))));
    let author_fragments: Vec<_> = fragments
        .iter()
        .filter_map(|f| f.get("700__a"))
        .collect();
    assert_eq!(
        author_fragments,
        vec![&json!("First, Author"), &json!("Second, Author")]
    );
}

#[test]
fn test_persisted_form_restores() {
    let reader = reader();
    let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
    let dumped = doc.dumps(&DumpOptions::default());

    let mut restored = Document::loads(
        Arc::clone(reader.registry()),
        Arc::new(FunctionRegistry::with_builtins()),
        &dumped,
    );
    assert_eq!(restored.get("title"), doc.get("title"));
    assert_eq!(restored.get("authors"), doc.get("authors"));
    // Provenance survives the trip.
    assert_eq!(
        restored.metadata("title").unwrap().source_tags,
        vec!["245__".to_string()]
    );
}

#[test]
fn test_field_failure_never_poisons_the_record() {
    let mut builder = RegistryBuilder::new("test");
    builder
        .add_field_source(
            "test.cfg",
            "broken:\n    creator:\n        marcxml, \"245..\", value['nope']\ntitle:\n    creator:\n        marcxml, \"245..\", value['a']\n",
        )
        .unwrap();
    let reader = Reader::new(
        Arc::new(builder.build(1).unwrap()),
        Arc::new(FunctionRegistry::with_builtins()),
    );
    let mut doc = reader.translate(RECORD, "marcxml", &[]).unwrap();
    assert_eq!(doc.get("title"), Some(json!("Main title")));
    assert!(doc.get("broken").is_none());
    assert!(doc.has_warnings());
}
