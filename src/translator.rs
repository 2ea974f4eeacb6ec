//! Query translation
//!
//! Turns the string/list options of a [`DbRequest`] into store-level BSON:
//! filter, projection, sort and the fixed aggregation pipeline.

use bson::{doc, Bson, Document};
use serde_json::Value;
use tracing::warn;

use crate::messages::{DbRequest, JsonDocument};
use crate::store::FindSpec;
use crate::timestamp::DATETIME_FIELD;
use crate::types::{BusError, Result};

/// Parse a filter expression.
///
/// Empty input matches everything. Input that is not a JSON object (or not
/// valid extended JSON) is logged and also degrades to match-everything.
pub fn parse_filter(raw: &str) -> Document {
    let raw = raw.trim();
    if raw.is_empty() {
        return Document::new();
    }

    let value = match serde_json::from_str::<Value>(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(query = %raw, error = %e, "Filter is not valid JSON, matching all documents");
            return Document::new();
        }
    };

    match json_to_document(value) {
        Ok(filter) => filter,
        Err(e) => {
            warn!(query = %raw, error = %e, "Filter is not a document, matching all documents");
            Document::new()
        }
    }
}

/// Inclusive projection of the named fields; `None` returns all fields
pub fn build_projection(fields: &[String]) -> Option<Document> {
    let fields = ordered_unique(fields);
    if fields.is_empty() {
        return None;
    }
    let mut projection = Document::new();
    for field in fields {
        projection.insert(field, true);
    }
    Some(projection)
}

/// Descending sort on each named field; `None` keeps store order
pub fn build_sort(fields: &[String]) -> Option<Document> {
    let fields = ordered_unique(fields);
    if fields.is_empty() {
        return None;
    }
    let mut sort = Document::new();
    for field in fields {
        sort.insert(field, -1);
    }
    Some(sort)
}

/// Fixed four-stage pipeline: match, group by `datetime`, reshape, sort.
///
/// Each output row is `{min, avg, max, last, time}` with `time` in epoch millis.
/// The reshape drops `datetime`, so rows are ordered on `time`, oldest first.
pub fn build_aggregation_pipeline(filter: Document, field: &str) -> Vec<Document> {
    let value = format!("${}", field);
    let datetime = format!("${}", DATETIME_FIELD);

    vec![
        doc! { "$match": filter },
        doc! {
            "$group": {
                "_id": datetime.clone(),
                "min": { "$min": value.clone() },
                "avg": { "$avg": value.clone() },
                "max": { "$max": value.clone() },
                "last": { "$last": value },
                "time": { "$last": datetime },
            }
        },
        doc! {
            "$project": {
                "_id": 0,
                "min": "$min",
                "avg": "$avg",
                "max": "$max",
                "last": "$last",
                "time": { "$toLong": "$time" },
            }
        },
        doc! { "$sort": { "time": 1 } },
    ]
}

/// Translate the find options of a request
pub fn find_spec(request: &DbRequest) -> FindSpec {
    FindSpec {
        projection: build_projection(&request.fields),
        sort: build_sort(&request.sort),
        limit: (request.limit > 0).then_some(request.limit),
        skip: request.skip,
    }
}

/// Convert an extended-JSON object into a BSON document
pub fn json_to_document(value: Value) -> Result<Document> {
    match Bson::try_from(value)? {
        Bson::Document(document) => Ok(document),
        other => Err(BusError::BadRequest(format!(
            "Expected a JSON object, got {:?}",
            other.element_type()
        ))),
    }
}

/// Convert a BSON document into relaxed extended JSON
pub fn document_to_json(document: Document) -> JsonDocument {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => JsonDocument::new(),
    }
}

fn ordered_unique(fields: &[String]) -> Vec<&str> {
    let mut seen = Vec::with_capacity(fields.len());
    for field in fields {
        if !field.is_empty() && !seen.contains(&field.as_str()) {
            seen.push(field.as_str());
        }
    }
    seen
}
