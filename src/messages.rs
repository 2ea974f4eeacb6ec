//! Wire messages exchanged over bus addresses
//!
//! All messages are JSON objects. Field names follow the established wire
//! format (`operationParams`, `typeName`, `firstBatch`), hence the renames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{BusError, Result};

/// A JSON document as it travels over the bus
pub type JsonDocument = Map<String, Value>;

/// Request for a find or aggregate against one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbRequest {
    /// Target collection
    pub collection: String,

    /// Filter expression as a JSON string; empty matches everything.
    ///
    /// IN: `{ "key": { "$in": ["v1", "v2"] } }`,
    /// AND: `{ "k1": "v1", "k2": { "$lt": 3 } }`,
    /// OR: `{ "$or": [{ "k1": "v1" }, { "k2": { "$gt": 2 } }] }`
    pub query: String,

    /// Fields to project; empty returns all fields
    pub fields: Vec<String>,

    /// Fields to sort by, each descending
    pub sort: Vec<String>,

    /// Maximum number of documents; -1 is unbounded
    pub limit: i64,

    /// Number of documents to skip
    pub skip: u64,

    /// Numeric field to aggregate; empty selects a plain find
    pub aggregate: String,
}

impl Default for DbRequest {
    fn default() -> Self {
        Self {
            collection: String::new(),
            query: String::new(),
            fields: Vec::new(),
            sort: Vec::new(),
            limit: -1,
            skip: 0,
            aggregate: String::new(),
        }
    }
}

impl DbRequest {
    /// Create a request matching everything in `collection`
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Set the filter expression
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Set the projected fields
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    /// Set the sort fields
    pub fn with_sort(mut self, sort: Vec<String>) -> Self {
        self.sort = sort;
        self
    }

    /// Set the limit
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set the number of skipped documents
    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// Select the aggregate path on `field`
    pub fn with_aggregate(mut self, field: impl Into<String>) -> Self {
        self.aggregate = field.into();
        self
    }

    /// Whether this request runs on the aggregate path
    pub fn is_aggregate(&self) -> bool {
        !self.aggregate.is_empty()
    }

    /// Serialize to a JSON value
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from a JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Rows returned by a find
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbResponse {
    pub result: Vec<JsonDocument>,
}

impl DbResponse {
    pub fn new(result: Vec<JsonDocument>) -> Self {
        Self { result }
    }

    pub fn is_empty(&self) -> bool {
        self.result.is_empty()
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Request handled by the data service: fetch, then optionally transform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataRequest {
    /// Collection to fetch from; empty skips the transformation hop
    pub collection: String,

    /// Filter expression for the fetch
    pub query: String,

    /// Address of the transformation service
    pub operation: String,

    /// Parameters handed to the transformation
    pub operation_params: JsonDocument,
}

impl DataRequest {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>, params: JsonDocument) -> Self {
        self.operation = operation.into();
        self.operation_params = params;
        self
    }
}

/// Payload forwarded to a transformation address
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataOperation {
    /// Fetched data under the `data` key
    pub data: JsonDocument,
    /// Operation-specific parameters
    pub params: JsonDocument,
}

impl DataOperation {
    /// Wrap a fetch result as `{data: result}`
    pub fn wrap(result: Value, params: JsonDocument) -> Self {
        let mut data = Map::new();
        data.insert("data".to_string(), result);
        Self { data, params }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Document to save, tagged with the type that names its collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveEnvelope {
    pub type_name: String,
    pub payload: JsonDocument,
}

impl SaveEnvelope {
    pub fn new(type_name: impl Into<String>, payload: JsonDocument) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }

    /// Decide the envelope at the boundary.
    ///
    /// Accepts `{"typeName": .., "payload": {..}}`, or a self-describing
    /// document carrying a `className` string, which is saved as-is.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(BusError::BadRequest("Save message must be a JSON object".into()));
        };

        if let (Some(Value::String(type_name)), Some(Value::Object(payload))) =
            (object.get("typeName"), object.get("payload"))
        {
            return Self::validated(type_name.clone(), payload.clone());
        }

        let type_name = match object.get("className") {
            Some(Value::String(class_name)) => class_name.clone(),
            _ => {
                return Err(BusError::BadRequest(
                    "Save message has neither typeName/payload nor className".into(),
                ))
            }
        };
        Self::validated(type_name, object)
    }

    fn validated(type_name: String, payload: JsonDocument) -> Result<Self> {
        if type_name.is_empty() {
            return Err(BusError::BadRequest("Save message has an empty type name".into()));
        }
        Ok(Self { type_name, payload })
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Acknowledgement of a save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAck {
    pub collection: String,
    /// Whether an existing document was replaced
    pub updated: bool,
}

/// Reply frame carried over request/reply addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReplyEnvelope {
    Ok { body: Value },
    Failed { code: u16, message: String },
}

impl ReplyEnvelope {
    /// Frame a handler outcome
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(body) => Self::Ok { body },
            Err(e) => Self::Failed {
                code: e.reply_code(),
                message: e.reply_message(),
            },
        }
    }

    /// Unframe a reply; failures become [`BusError::Remote`]
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Ok { body } => Ok(body),
            Self::Failed { message, .. } => Err(BusError::Remote(message)),
        }
    }

    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        Ok(serde_json::to_vec(self).map(Into::into)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
