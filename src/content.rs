use serde_json::{Map, Value};

use crate::errors::StepError;
use crate::types::TypeTag;

/// Parsed content for one step: a single content-type tag mapped to the
/// ordered records fetched under it.
///
/// Invariant: exactly one tag per envelope. Steps expecting a different tag
/// fail before any sink work happens.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentEnvelope {
    type_tag: TypeTag,
    records: Vec<Value>,
}

impl ContentEnvelope {
    /// Wrap already-normalized records under `type_tag`.
    pub fn from_records(type_tag: impl Into<TypeTag>, records: Vec<Value>) -> Self {
        Self {
            type_tag: type_tag.into(),
            records,
        }
    }

    /// Extract the envelope for `expected_tag` from a fetched JSON document.
    ///
    /// The document must be an object carrying `expected_tag` as a key whose
    /// value is a record array. A missing key is a per-step failure, not a
    /// malformed response: the document may legitimately serve other tags.
    pub fn from_document(
        document: &Value,
        expected_tag: &str,
        source_url: &str,
    ) -> Result<Self, StepError> {
        let object = document
            .as_object()
            .ok_or_else(|| StepError::MalformedResponse {
                url: source_url.to_string(),
                reason: "top-level JSON value is not an object".to_string(),
            })?;
        let entry = object
            .get(expected_tag)
            .ok_or_else(|| StepError::MissingContentType(expected_tag.to_string()))?;
        let records = entry
            .as_array()
            .ok_or_else(|| StepError::MalformedResponse {
                url: source_url.to_string(),
                reason: format!("'{expected_tag}' element is not an array"),
            })?;
        Ok(Self {
            type_tag: expected_tag.to_string(),
            records: records.clone(),
        })
    }

    /// The single content-type tag this envelope carries.
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Records in fetch order.
    pub fn records(&self) -> &[Value] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the envelope carries no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fail unless this envelope carries `expected_tag`.
    pub fn expect_tag(&self, expected_tag: &str) -> Result<(), StepError> {
        if self.type_tag == expected_tag {
            Ok(())
        } else {
            Err(StepError::MissingContentType(expected_tag.to_string()))
        }
    }

    /// Rebuild the `{tag: [records]}` document form used by file sinks.
    pub fn as_document(&self) -> Value {
        let mut object = Map::new();
        object.insert(self.type_tag.clone(), Value::Array(self.records.clone()));
        Value::Object(object)
    }
}

/// Parse body text as JSON, tolerating a UTF-8 byte-order mark.
pub fn parse_json_lenient(body: &str, source_url: &str) -> Result<Value, StepError> {
    let trimmed = body.strip_prefix('\u{feff}').unwrap_or(body);
    serde_json::from_str(trimmed).map_err(|err| StepError::MalformedResponse {
        url: source_url.to_string(),
        reason: err.to_string(),
    })
}
