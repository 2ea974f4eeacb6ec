//! In-process document store
//!
//! Keeps collections in memory and evaluates the subset of the query and
//! aggregation language the gateway emits. Used when MongoDB is not
//! available (development mode) and throughout the test suite.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::RwLock;
use tracing::debug;

use super::{DocumentStore, FindSpec, SaveOutcome};
use crate::types::{BusError, Result};

/// In-memory [`DocumentStore`]; documents keep insertion order
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Whether [`DocumentStore::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Database("Memory store is closed".into()));
        }
        Ok(())
    }

    fn snapshot(&self, collection: &str) -> Result<Vec<Document>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| BusError::Internal("Memory store lock poisoned".into()))?;
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn save(&self, collection: &str, document: Document) -> Result<SaveOutcome> {
        self.ensure_open()?;
        let mut collections = self
            .collections
            .write()
            .map_err(|_| BusError::Internal("Memory store lock poisoned".into()))?;
        let documents = collections.entry(collection.to_string()).or_default();

        if let Some(id) = document.get("_id").cloned() {
            if let Some(existing) = documents.iter_mut().find(|d| d.get("_id") == Some(&id)) {
                *existing = document;
                return Ok(SaveOutcome::Updated(id));
            }
            documents.push(document);
            return Ok(SaveOutcome::Inserted(id));
        }

        let id = Bson::ObjectId(ObjectId::new());
        let mut stored = doc! { "_id": id.clone() };
        stored.extend(document);
        documents.push(stored);
        Ok(SaveOutcome::Inserted(id))
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        spec: FindSpec,
    ) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let mut rows = Vec::new();
        for document in self.snapshot(collection)? {
            if matches(&document, &filter)? {
                rows.push(document);
            }
        }

        if let Some(ref sort) = spec.sort {
            sort_rows(&mut rows, sort);
        }

        let skip = usize::try_from(spec.skip).unwrap_or(usize::MAX);
        let limit = spec
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);

        let rows = rows
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|d| match spec.projection {
                Some(ref p) => project_fields(&d, p),
                None => d,
            })
            .collect::<Vec<_>>();

        debug!(collection = %collection, count = rows.len(), "Memory find completed");
        Ok(rows)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<Document> {
        self.ensure_open()?;
        let mut rows = self.snapshot(collection)?;

        for stage in &pipeline {
            let (name, spec) = stage
                .iter()
                .next()
                .ok_or_else(|| BusError::BadRequest("Empty pipeline stage".into()))?;
            rows = match (name.as_str(), spec) {
                ("$match", Bson::Document(filter)) => {
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if matches(&row, filter)? {
                            kept.push(row);
                        }
                    }
                    kept
                }
                ("$group", Bson::Document(spec)) => group(rows, spec)?,
                ("$project", Bson::Document(spec)) => {
                    let mut projected = Vec::with_capacity(rows.len());
                    for row in &rows {
                        projected.push(project_stage(row, spec)?);
                    }
                    projected
                }
                ("$sort", Bson::Document(spec)) => {
                    sort_rows(&mut rows, spec);
                    rows
                }
                ("$skip", n) => {
                    let n = as_f64(n).unwrap_or(0.0).max(0.0) as usize;
                    rows.into_iter().skip(n).collect()
                }
                ("$limit", n) => {
                    let n = as_f64(n).unwrap_or(0.0).max(0.0) as usize;
                    rows.into_iter().take(n).collect()
                }
                (other, _) => {
                    return Err(BusError::BadRequest(format!(
                        "Unsupported aggregation stage: {}",
                        other
                    )))
                }
            };
        }

        let batch: Vec<Bson> = rows.into_iter().map(Bson::Document).collect();
        Ok(doc! {
            "cursor": {
                "firstBatch": batch,
                "id": 0_i64,
                "ns": format!("memory.{}", collection),
            },
            "ok": 1.0,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Resolve a dotted field path
fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate a query filter against one document
fn matches(document: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_clauses(condition)?
                .iter()
                .map(|c| matches(document, c))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .all(|b| b),
            "$or" => all_clauses(condition)?
                .iter()
                .map(|c| matches(document, c))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|b| b),
            "$nor" => !all_clauses(condition)?
                .iter()
                .map(|c| matches(document, c))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|b| b),
            op if op.starts_with('$') => {
                return Err(BusError::BadRequest(format!("Unsupported query operator: {}", op)))
            }
            path => field_matches(lookup(document, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_clauses(condition: &Bson) -> Result<Vec<&Document>> {
    match condition {
        Bson::Array(items) => items
            .iter()
            .map(|item| match item {
                Bson::Document(d) => Ok(d),
                _ => Err(BusError::BadRequest("Logical clauses must be documents".into())),
            })
            .collect(),
        _ => Err(BusError::BadRequest("Logical operator expects an array".into())),
    }
}

fn is_operator_document(condition: &Bson) -> bool {
    match condition {
        Bson::Document(d) => d.keys().next().is_some_and(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> Result<bool> {
    let Bson::Document(operators) = condition else {
        return Ok(equals(value, condition));
    };
    if !is_operator_document(condition) {
        return Ok(equals(value, condition));
    }

    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            "$gt" => compares(value, operand, |o| o == Ordering::Greater),
            "$gte" => compares(value, operand, |o| o != Ordering::Less),
            "$lt" => compares(value, operand, |o| o == Ordering::Less),
            "$lte" => compares(value, operand, |o| o != Ordering::Greater),
            "$in" => in_array(value, operand)?,
            "$nin" => !in_array(value, operand)?,
            "$exists" => value.is_some() == truthy(operand),
            other => {
                return Err(BusError::BadRequest(format!(
                    "Unsupported query operator: {}",
                    other
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| same(item, expected))
        }
        Some(v) => same(v, expected),
    }
}

fn same(a: &Bson, b: &Bson) -> bool {
    compare(a, b) == Some(Ordering::Equal) || a == b
}

fn compares(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(v) => compare(v, operand).is_some_and(accept),
        None => false,
    }
}

fn in_array(value: Option<&Bson>, operand: &Bson) -> Result<bool> {
    match operand {
        Bson::Array(candidates) => Ok(candidates.iter().any(|c| equals(value, c))),
        _ => Err(BusError::BadRequest("$in/$nin expects an array".into())),
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null => false,
        other => as_f64(other).map_or(true, |n| n != 0.0),
    }
}

/// Compare two values of comparable types; `None` across type families
fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(x.cmp(y)),
        (Bson::Int64(x), Bson::Int64(y)) => Some(x.cmp(y)),
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

/// Canonical cross-type order used for sorting; missing sorts as null
fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None | Some(Bson::Null) => 0,
        Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => 1,
        Some(Bson::String(_)) => 2,
        Some(Bson::Document(_)) => 3,
        Some(Bson::Array(_)) => 4,
        Some(Bson::ObjectId(_)) => 5,
        Some(Bson::Boolean(_)) => 6,
        Some(Bson::DateTime(_)) => 7,
        Some(_) => 8,
    }
}

fn sort_order(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    type_rank(a).cmp(&type_rank(b)).then_with(|| match (a, b) {
        (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    })
}

/// Stable multi-key sort; each value is 1 (ascending) or -1 (descending)
fn sort_rows(rows: &mut [Document], spec: &Document) {
    rows.sort_by(|a, b| {
        for (field, direction) in spec {
            let order = sort_order(lookup(a, field), lookup(b, field));
            let order = if as_f64(direction).unwrap_or(1.0) < 0.0 {
                order.reverse()
            } else {
                order
            };
            if order != Ordering::Equal {
                return order;
            }
        }
        Ordering::Equal
    });
}

/// Find projection: inclusion of top-level fields, `_id` unless excluded
fn project_fields(document: &Document, projection: &Document) -> Document {
    let exclude_id = projection.get("_id").is_some_and(|v| !truthy(v));
    let inclusion = projection
        .iter()
        .any(|(k, v)| k != "_id" && truthy(v));

    if !inclusion {
        let mut out = document.clone();
        for (k, v) in projection {
            if !truthy(v) {
                out.remove(k);
            }
        }
        return out;
    }

    let mut out = Document::new();
    if !exclude_id {
        if let Some(id) = document.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (k, v) in projection {
        if k != "_id" && truthy(v) {
            if let Some(value) = document.get(k) {
                out.insert(k.clone(), value.clone());
            }
        }
    }
    out
}

/// Evaluate an aggregation expression against a row
fn evaluate(expression: &Bson, row: &Document) -> Result<Bson> {
    match expression {
        Bson::String(s) if s.starts_with('$') => {
            Ok(lookup(row, &s[1..]).cloned().unwrap_or(Bson::Null))
        }
        Bson::Document(d) if is_operator_document(expression) => {
            let (op, arg) = d
                .iter()
                .next()
                .ok_or_else(|| BusError::BadRequest("Empty expression".into()))?;
            match op.as_str() {
                "$toLong" => to_long(evaluate(arg, row)?),
                "$literal" => Ok(arg.clone()),
                other => Err(BusError::BadRequest(format!(
                    "Unsupported expression operator: {}",
                    other
                ))),
            }
        }
        literal => Ok(literal.clone()),
    }
}

fn to_long(value: Bson) -> Result<Bson> {
    match value {
        Bson::DateTime(dt) => Ok(Bson::Int64(dt.timestamp_millis())),
        Bson::Int32(i) => Ok(Bson::Int64(i64::from(i))),
        Bson::Int64(i) => Ok(Bson::Int64(i)),
        Bson::Double(d) => Ok(Bson::Int64(d.trunc() as i64)),
        Bson::Boolean(b) => Ok(Bson::Int64(i64::from(b))),
        Bson::String(s) => s
            .parse::<i64>()
            .map(Bson::Int64)
            .map_err(|e| BusError::BadRequest(format!("$toLong failed on '{}': {}", s, e))),
        Bson::Null => Ok(Bson::Null),
        other => Err(BusError::BadRequest(format!(
            "$toLong unsupported for {:?}",
            other.element_type()
        ))),
    }
}

/// Running state of one `$group` accumulator
enum Accumulator {
    Min(Option<Bson>),
    Max(Option<Bson>),
    Avg { sum: f64, count: u64 },
    Sum { total: f64, integral: bool },
    First(Option<Bson>),
    Last(Bson),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$avg" => Self::Avg { sum: 0.0, count: 0 },
            "$sum" => Self::Sum {
                total: 0.0,
                integral: true,
            },
            "$first" => Self::First(None),
            "$last" => Self::Last(Bson::Null),
            other => {
                return Err(BusError::BadRequest(format!(
                    "Unsupported accumulator: {}",
                    other
                )))
            }
        })
    }

    fn push(&mut self, value: Bson) {
        match self {
            Self::Min(_) | Self::Max(_) if matches!(value, Bson::Null) => {}
            Self::Min(current) => {
                let replace = current
                    .as_ref()
                    .map_or(true, |c| sort_order(Some(&value), Some(c)) == Ordering::Less);
                if replace {
                    *current = Some(value);
                }
            }
            Self::Max(current) => {
                let replace = current
                    .as_ref()
                    .map_or(true, |c| sort_order(Some(&value), Some(c)) == Ordering::Greater);
                if replace {
                    *current = Some(value);
                }
            }
            Self::Avg { sum, count } => {
                if let Some(n) = as_f64(&value) {
                    *sum += n;
                    *count += 1;
                }
            }
            Self::Sum { total, integral } => {
                if let Some(n) = as_f64(&value) {
                    *total += n;
                    *integral &= !matches!(value, Bson::Double(_));
                }
            }
            Self::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Self::Last(current) => *current = value,
        }
    }

    fn finish(self) -> Bson {
        match self {
            Self::Min(v) | Self::Max(v) | Self::First(v) => v.unwrap_or(Bson::Null),
            Self::Avg { sum, count } if count > 0 => Bson::Double(sum / count as f64),
            Self::Avg { .. } => Bson::Null,
            Self::Sum { total, integral } if integral => Bson::Int64(total as i64),
            Self::Sum { total, .. } => Bson::Double(total),
            Self::Last(v) => v,
        }
    }
}

/// `$group` stage; groups are emitted in order of first appearance
fn group(rows: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let key_expression = spec
        .get("_id")
        .ok_or_else(|| BusError::BadRequest("$group requires an _id".into()))?;

    let mut fields = Vec::new();
    for (name, accumulator) in spec {
        if name == "_id" {
            continue;
        }
        let Bson::Document(acc) = accumulator else {
            return Err(BusError::BadRequest(format!("Accumulator for {} must be a document", name)));
        };
        let (op, expression) = acc
            .iter()
            .next()
            .ok_or_else(|| BusError::BadRequest(format!("Empty accumulator for {}", name)))?;
        fields.push((name.clone(), op.clone(), expression.clone()));
    }

    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();
    for row in &rows {
        let key = evaluate(key_expression, row)?;
        let index = match groups.iter().position(|(k, _)| *k == key) {
            Some(i) => i,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>>>()?;
                groups.push((key, accumulators));
                groups.len() - 1
            }
        };
        for (acc, (_, _, expression)) in groups[index].1.iter_mut().zip(&fields) {
            acc.push(evaluate(expression, row)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut out = doc! { "_id": key };
            for (acc, (name, _, _)) in accumulators.into_iter().zip(&fields) {
                out.insert(name.clone(), acc.finish());
            }
            out
        })
        .collect())
}

/// `$project` stage: inclusion, exclusion and computed fields
fn project_stage(row: &Document, spec: &Document) -> Result<Document> {
    let is_flag = |v: &Bson| matches!(v, Bson::Boolean(_)) || as_f64(v).is_some();
    let exclusion_only = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .all(|(_, v)| is_flag(v) && !truthy(v));

    if exclusion_only {
        return Ok(project_fields(row, spec));
    }

    let exclude_id = spec.get("_id").is_some_and(|v| is_flag(v) && !truthy(v));
    let mut out = Document::new();
    if !exclude_id {
        if let Some(id) = row.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (name, value) in spec {
        if name == "_id" {
            continue;
        }
        if is_flag(value) {
            if truthy(value) {
                if let Some(v) = lookup(row, name) {
                    out.insert(name.clone(), v.clone());
                }
            }
            continue;
        }
        out.insert(name.clone(), evaluate(value, row)?);
    }
    Ok(out)
}
