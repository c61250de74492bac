use std::collections::BTreeMap;

use beacon_core::MessageId;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Practical byte budget for one record's encoded key/value set.
pub const MAX_RECORD_BYTES: usize = 768;
/// Delimiter between ids in list-valued fields.
pub const ID_LIST_DELIMITER: char = ',';

/// Ordered key/value field set of one substrate record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordFields(BTreeMap<String, String>);

impl RecordFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Inserts only non-empty values; empty optional fields are left off the wire.
    pub fn insert_non_empty(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.0.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn required(&self, key: &'static str) -> Result<&str, CodecError> {
        self.get(key).ok_or(CodecError::MissingField(key))
    }

    pub fn required_u64(&self, key: &'static str) -> Result<u64, CodecError> {
        let raw = self.required(key)?;
        raw.trim()
            .parse::<u64>()
            .map_err(|_| CodecError::InvalidField {
                field: key,
                value: raw.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Size as laid out in a TXT-style record: one length byte per entry
    /// plus `key=value`.
    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(|(k, v)| 1 + k.len() + 1 + v.len()).sum()
    }

    pub fn ensure_within_budget(&self) -> Result<(), CodecError> {
        let size = self.encoded_len();
        if size > MAX_RECORD_BYTES {
            return Err(CodecError::TooLarge {
                size,
                limit: MAX_RECORD_BYTES,
            });
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for RecordFields {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Joins ids into a delimited field value.
pub fn encode_id_list(ids: &[MessageId]) -> String {
    let mut out = String::new();
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push(ID_LIST_DELIMITER);
        }
        out.push_str(id.as_str());
    }
    out
}

/// Splits a delimited field value, skipping blank entries.
pub fn decode_id_list(value: Option<&str>) -> Vec<MessageId> {
    value
        .unwrap_or_default()
        .split(ID_LIST_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(MessageId::from_wire)
        .collect()
}

/// Truncates `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use beacon_core::MessageId;

    use super::{decode_id_list, encode_id_list, truncate_text, RecordFields, MAX_RECORD_BYTES};
    use crate::error::CodecError;

    #[test]
    fn id_list_skips_blank_entries() {
        let ids = decode_id_list(Some(" a_1_1, ,b_2_2,,"));
        assert_eq!(
            ids,
            vec![MessageId::from_wire("a_1_1"), MessageId::from_wire("b_2_2")]
        );
        assert!(decode_id_list(None).is_empty());
        assert_eq!(encode_id_list(&ids), "a_1_1,b_2_2");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_text("héllo wörld", 4), "héll");
        assert_eq!(truncate_text("short", 120), "short");
        assert_eq!(truncate_text("", 3), "");
    }

    #[test]
    fn empty_values_read_as_absent() {
        let mut fields = RecordFields::new();
        fields.insert("a", "");
        fields.insert_non_empty("b", "");
        assert_eq!(fields.get("a"), None);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.required("a"), Err(CodecError::MissingField("a")));
    }

    #[test]
    fn numeric_fields_reject_garbage() {
        let mut fields = RecordFields::new();
        fields.insert("ts", "12x");
        assert!(matches!(
            fields.required_u64("ts"),
            Err(CodecError::InvalidField { field: "ts", .. })
        ));
    }

    #[test]
    fn budget_is_enforced() {
        let mut fields = RecordFields::new();
        fields.insert("txt", "x".repeat(MAX_RECORD_BYTES));
        assert!(matches!(
            fields.ensure_within_budget(),
            Err(CodecError::TooLarge { .. })
        ));
    }
}
