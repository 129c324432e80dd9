//! Canonical signing representation.
//!
//! Signatures are verified by recomputing this string later, possibly on
//! a different device, so it must depend only on the record's logical
//! state: field names are sorted, never taken in declaration order, and
//! empty values are omitted entirely.

use crate::sync::record::SyncMeta;
use std::collections::BTreeMap;

/// Field names included in every canonical representation, prepended
/// when a record type supplies an explicit list that omits them.
pub const ALWAYS_SIGNED_FIELDS: [&str; 2] = ["signed_version", "id"];

/// A single payload field value, as seen by canonicalization and the
/// wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    /// A reference to another identified entity; carries its primary id.
    Reference(String),
    Null,
}

impl FieldValue {
    /// Render for the canonical string, or `None` when the value is
    /// empty and must be omitted. Empty means: empty text, zero
    /// numerics, `false`, or an absent value.
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) | FieldValue::Reference(s) => {
                (!s.is_empty()).then(|| s.clone())
            }
            FieldValue::Integer(i) => (*i != 0).then(|| i.to_string()),
            FieldValue::Float(f) => (*f != 0.0).then(|| f.to_string()),
            FieldValue::Bool(b) => b.then(|| "true".to_string()),
            FieldValue::Null => None,
        }
    }
}

/// Build the canonical representation of a record.
///
/// The default field set is every declared field except `signature` and
/// `signed_by`, sorted lexicographically by name. A record type may pass
/// an explicit `fields` list instead, in which case the always-signed
/// fields are prepended when missing. Non-empty values are emitted as
/// `name=value` and joined with `&`.
pub fn canonical_representation(
    meta: &SyncMeta,
    payload: &[(&'static str, FieldValue)],
    fields: Option<&[&str]>,
) -> String {
    let mut values: BTreeMap<&str, String> = BTreeMap::new();

    if let Some(id) = &meta.id {
        if !id.is_empty() {
            values.insert("id", id.clone());
        }
    }
    if let Some(counter) = meta.counter {
        if counter != 0 {
            values.insert("counter", counter.to_string());
        }
    }
    if meta.signed_version != 0 {
        values.insert("signed_version", meta.signed_version.to_string());
    }
    for (name, value) in payload {
        if let Some(rendered) = value.render() {
            values.insert(*name, rendered);
        }
    }

    let chunks: Vec<String> = match fields {
        Some(list) => {
            let mut order: Vec<&str> = list.to_vec();
            for always in ALWAYS_SIGNED_FIELDS {
                if !order.contains(&always) {
                    order.insert(0, always);
                }
            }
            order
                .iter()
                .filter_map(|name| values.get(name).map(|v| format!("{}={}", name, v)))
                .collect()
        }
        // BTreeMap iteration gives the sorted default order.
        None => values
            .iter()
            .map(|(name, v)| format!("{}={}", name, v))
            .collect(),
    };

    chunks.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SyncMeta {
        SyncMeta {
            id: Some("0123456789abcdef0123456789abcdef".to_string()),
            counter: Some(7),
            signature: "sig-is-never-included".to_string(),
            signed_by: Some("some-device".to_string()),
            signed_version: 1,
        }
    }

    #[test]
    fn default_order_is_lexicographic() {
        let repr = canonical_representation(
            &meta(),
            &[
                ("name", FieldValue::Text("Main".to_string())),
                ("address", FieldValue::Text("1 Elm St".to_string())),
            ],
            None,
        );
        assert_eq!(
            repr,
            "address=1 Elm St&counter=7&id=0123456789abcdef0123456789abcdef&name=Main&signed_version=1"
        );
    }

    #[test]
    fn independent_of_declaration_order() {
        let forward = [
            ("name", FieldValue::Text("Main".to_string())),
            ("notes", FieldValue::Text("x".to_string())),
            ("role", FieldValue::Text("analytics".to_string())),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        assert_eq!(
            canonical_representation(&meta(), &forward, None),
            canonical_representation(&meta(), &reversed, None),
        );
    }

    #[test]
    fn empty_values_are_omitted() {
        let repr = canonical_representation(
            &meta(),
            &[
                ("description", FieldValue::Text(String::new())),
                ("revoked", FieldValue::Bool(false)),
                ("latitude", FieldValue::Null),
                ("weight", FieldValue::Integer(0)),
                ("name", FieldValue::Text("Main".to_string())),
            ],
            None,
        );
        assert_eq!(
            repr,
            "counter=7&id=0123456789abcdef0123456789abcdef&name=Main&signed_version=1"
        );
    }

    #[test]
    fn explicit_fields_get_always_fields_prepended() {
        let repr = canonical_representation(
            &meta(),
            &[
                ("name", FieldValue::Text("central".to_string())),
                ("public_key", FieldValue::Text("AAAA".to_string())),
            ],
            Some(&["signed_version", "name", "public_key"]),
        );
        assert_eq!(
            repr,
            "id=0123456789abcdef0123456789abcdef&signed_version=1&name=central&public_key=AAAA"
        );
    }

    #[test]
    fn explicit_fields_exclude_counter() {
        let repr = canonical_representation(
            &meta(),
            &[("name", FieldValue::Text("central".to_string()))],
            Some(&["signed_version", "name"]),
        );
        assert!(!repr.contains("counter="));
    }

    #[test]
    fn references_contribute_their_id() {
        let repr = canonical_representation(
            &meta(),
            &[("organization", FieldValue::Reference("feedbeef".to_string()))],
            None,
        );
        assert!(repr.contains("organization=feedbeef"));
    }

    #[test]
    fn true_and_nonzero_values_are_emitted() {
        let repr = canonical_representation(
            &meta(),
            &[
                ("is_primary", FieldValue::Bool(true)),
                ("latitude", FieldValue::Float(12.5)),
            ],
            None,
        );
        assert!(repr.contains("is_primary=true"));
        assert!(repr.contains("latitude=12.5"));
    }
}
