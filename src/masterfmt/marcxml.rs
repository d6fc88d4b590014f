//! MARCXML master format, as defined by the Library of Congress
//! (<https://www.loc.gov/standards/marcxml/>).
//!
//! `tag`, `ind1`, `ind2` and `code` are XML **attributes**; the root
//! `<record>` element carries `xmlns="http://www.loc.gov/MARC21/slim"`.
//! Both default-namespace (`<record xmlns="...">`) and prefix-namespace
//! (`<marc:record xmlns:marc="...">`) inputs are accepted.
//!
//! Pre-parsing builds tag keys of tag plus both indicators, blanks written
//! as `_` (`245_0`, `909C1`); control fields keep their bare tag and the
//! leader lands under `leader`. Subfields become a JSON object, repeated
//! codes collected into arrays:
//!
//! ```ignore
//! <datafield tag="245" ind1=" " ind2="0">
//!     <subfield code="a">Title</subfield>
//! </datafield>
//! ```
//!
//! becomes the element `("245_0", {"a": "Title"})`.
//!
//! [`fragments_to_marcxml`] is the inverse formatting step, composing
//! producer fragments back into a MARCXML record string.

use crate::error::FatalInputError;
use crate::masterfmt::{IntermediateTree, MasterFormat};
use crate::producer::Fragment;
use lazy_static::lazy_static;
use quick_xml::de::from_str as xml_from_str;
use quick_xml::se::to_string as xml_to_string;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The MARCXML namespace URI.
pub const MARCXML_NS: &str = "http://www.loc.gov/MARC21/slim";

/// Registered name of this format.
pub const FORMAT_NAME: &str = "marcxml";

/// MARCXML record representation for serialization.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "record")]
pub struct XmlRecord {
    /// MARC leader string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    /// Control fields (tags 001-009)
    #[serde(default)]
    pub controlfield: Vec<XmlControlField>,
    /// Data fields (tags 010+)
    #[serde(default)]
    pub datafield: Vec<XmlDataField>,
}

/// MARCXML control field representation.
#[derive(Debug, Serialize, Deserialize)]
pub struct XmlControlField {
    /// Field tag as an XML attribute (e.g., "001", "008")
    #[serde(rename = "@tag")]
    pub tag: String,
    /// Control field value (text content)
    #[serde(rename = "$value")]
    pub value: String,
}

/// MARCXML data field representation.
#[derive(Debug, Serialize, Deserialize)]
pub struct XmlDataField {
    /// Field tag as an XML attribute (e.g., "245", "650")
    #[serde(rename = "@tag")]
    pub tag: String,
    /// First indicator as an XML attribute
    #[serde(rename = "@ind1")]
    pub ind1: String,
    /// Second indicator as an XML attribute
    #[serde(rename = "@ind2")]
    pub ind2: String,
    /// Subfields
    #[serde(default)]
    pub subfield: Vec<XmlSubfield>,
}

/// MARCXML subfield representation.
#[derive(Debug, Serialize, Deserialize)]
pub struct XmlSubfield {
    /// Subfield code as an XML attribute (e.g., "a", "b", "c")
    #[serde(rename = "@code")]
    pub code: String,
    /// Subfield value (text content)
    #[serde(rename = "$value")]
    pub value: String,
}

/// MARCXML collection wrapper for multiple records.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "collection")]
pub struct XmlCollection {
    /// Records in the collection
    #[serde(default, rename = "record")]
    pub records: Vec<XmlRecord>,
}

// ---------------------------------------------------------------------------
// Namespace stripping
// ---------------------------------------------------------------------------

lazy_static! {
    static ref RE_XMLNS: Regex = Regex::new(r#"\s+xmlns(?::\w+)?="[^"]*""#).unwrap();
    static ref RE_PREFIX: Regex = Regex::new(r"<(/?)(\w+):").unwrap();
}

/// Strip XML namespace prefixes and declarations from MARCXML input.
///
/// Handles both `marc:record` → `record` (prefixed namespace) and
/// `xmlns="..."` / `xmlns:marc="..."` (namespace declarations).
fn strip_marcxml_ns(xml: &str) -> String {
    let stripped = RE_XMLNS.replace_all(xml, "");
    RE_PREFIX.replace_all(&stripped, "<$1").to_string()
}

// ---------------------------------------------------------------------------
// Master format implementation
// ---------------------------------------------------------------------------

/// The MARCXML reference master format.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarcxmlFormat;

impl MasterFormat for MarcxmlFormat {
    fn name(&self) -> &str {
        FORMAT_NAME
    }

    fn split_blob(&self, text: &str) -> Result<Vec<String>, FatalInputError> {
        let cleaned = strip_marcxml_ns(text);
        if cleaned.contains("<collection") {
            let collection: XmlCollection = xml_from_str(&cleaned)
                .map_err(|e| FatalInputError::SplitFailed(e.to_string()))?;
            collection
                .records
                .iter()
                .map(|record| {
                    xml_to_string(record)
                        .map_err(|e| FatalInputError::SplitFailed(e.to_string()))
                })
                .collect()
        } else {
            Ok(vec![cleaned])
        }
    }

    fn prepare(&self, blob: &str) -> Result<IntermediateTree, FatalInputError> {
        let cleaned = strip_marcxml_ns(blob);
        let record: XmlRecord = xml_from_str(&cleaned)
            .map_err(|e| FatalInputError::PrepareFailed(e.to_string()))?;

        let mut tree = IntermediateTree::new();
        if let Some(leader) = record.leader {
            tree.push("leader", Value::String(leader));
        }
        for cf in record.controlfield {
            tree.push(cf.tag, Value::String(cf.value));
        }
        for df in record.datafield {
            let tag = tag_key(&df.tag, &df.ind1, &df.ind2);
            let mut map = serde_json::Map::new();
            for sf in df.subfield {
                let value = Value::String(sf.value);
                match map.get_mut(&sf.code) {
                    None => {
                        map.insert(sf.code, value);
                    },
                    Some(Value::Array(items)) => items.push(value),
                    Some(existing) => {
                        let first = existing.take();
                        *existing = Value::Array(vec![first, value]);
                    },
                }
            }
            tree.push(tag, Value::Object(map));
        }
        Ok(tree)
    }
}

/// Build the tag key of one data field: tag plus both indicators, blanks
/// written as `_`.
fn tag_key(tag: &str, ind1: &str, ind2: &str) -> String {
    let ind = |s: &str| match s.chars().next() {
        None | Some(' ') => '_',
        Some(c) => c,
    };
    format!("{tag}{}{}", ind(ind1), ind(ind2))
}

// ---------------------------------------------------------------------------
// Inverse formatting: fragments → MARCXML
// ---------------------------------------------------------------------------

/// Compose producer fragments back into one MARCXML record string.
///
/// Fragment keys address wire elements the same way tag keys do:
/// `245__a` is tag `245`, blank indicators, subfield `a`; a bare 3-char
/// key (`001`) is a control field; `leader` sets the leader. Array values
/// emit one repeated subfield per element. Within one fragment, entries
/// sharing a tag-plus-indicators prefix land in the same `<datafield>`.
///
/// # Errors
///
/// [`FatalInputError::FormatFailed`] for malformed keys or serialization
/// failures.
pub fn fragments_to_marcxml(fragments: &[Fragment]) -> Result<String, FatalInputError> {
    let mut leader = None;
    let mut controlfields: Vec<XmlControlField> = Vec::new();
    let mut datafields: Vec<XmlDataField> = Vec::new();

    for fragment in fragments {
        // Tag+indicators prefix → index into `datafields` for this fragment.
        let mut open: Vec<(String, usize)> = Vec::new();
        for (key, value) in fragment.entries() {
            if key == "leader" {
                leader = Some(scalar_text(value));
                continue;
            }
            if key.len() == 3 {
                controlfields.push(XmlControlField {
                    tag: key.clone(),
                    value: scalar_text(value),
                });
                continue;
            }
            if key.len() < 6 || !key.is_ascii() {
                return Err(FatalInputError::FormatFailed(format!(
                    "malformed fragment key '{key}'"
                )));
            }
            let (prefix, code) = key.split_at(5);
            let index = match open.iter().find(|(p, _)| p == prefix) {
                Some((_, index)) => *index,
                None => {
                    let tag = &prefix[..3];
                    let unblank = |c: char| if c == '_' { ' ' } else { c };
                    datafields.push(XmlDataField {
                        tag: tag.to_string(),
                        ind1: unblank(prefix.as_bytes()[3] as char).to_string(),
                        ind2: unblank(prefix.as_bytes()[4] as char).to_string(),
                        subfield: Vec::new(),
                    });
                    let index = datafields.len() - 1;
                    open.push((prefix.to_string(), index));
                    index
                },
            };
            let values: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for item in values {
                datafields[index].subfield.push(XmlSubfield {
                    code: code.to_string(),
                    value: scalar_text(item),
                });
            }
        }
    }

    let record = XmlRecord {
        leader,
        controlfield: controlfields,
        datafield: datafields,
    };
    let body = xml_to_string(&record)
        .map_err(|e| FatalInputError::FormatFailed(e.to_string()))?;
    let body = body.replacen("<record>", &format!("<record xmlns=\"{MARCXML_NS}\">"), 1);
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{body}"))
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
