//! Periodic poller
//!
//! On a fixed interval, asks the gateway for records newer than the last one
//! already emitted and publishes them to an output address.
//!
//! Two modes share the loop:
//! - **aggregate**: per-`datetime` statistics of one field, watermark from the
//!   rows' `time` (epoch millis); armed at "now" when started
//! - **find**: configured query/fields/sort, watermark from the rows'
//!   `datetime.$date`; starts empty, so the first tick emits everything matched.
//!   With `aggregate` set the gateway runs the aggregation instead and rows
//!   are read the aggregate way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::messages::DbRequest;
use crate::timestamp::{self, TimestampFormat, DATETIME_FIELD};
use crate::types::{BusError, Result};

/// What a poller asks for on each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PollMode {
    Aggregate {
        /// Numeric field to aggregate
        field: String,
    },
    Find {
        #[serde(default)]
        query: String,
        #[serde(default)]
        fields: Vec<String>,
        /// Each applied descending; leave empty to keep store order
        #[serde(default)]
        sort: Vec<String>,
        /// Aggregate this field instead of returning rows
        #[serde(default)]
        aggregate: String,
    },
}

/// One poller definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerConfig {
    pub collection: String,
    /// Requests per second
    pub rate: u32,
    /// Address the new records are published to
    pub out_address: String,
    #[serde(flatten)]
    pub mode: PollMode,
}

impl PollerConfig {
    /// Check the definition before anything is scheduled
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(BusError::Config("Poller collection must not be empty".into()));
        }
        if self.out_address.is_empty() {
            return Err(BusError::Config(format!(
                "Poller for {} has no output address",
                self.collection
            )));
        }
        if let PollMode::Aggregate { ref field } = self.mode {
            if field.is_empty() {
                return Err(BusError::Config(format!(
                    "Aggregating poller for {} has no field",
                    self.collection
                )));
            }
        }
        interval_from_rate(self.rate).map(|_| ())
    }

    /// Time between ticks
    pub fn interval(&self) -> Result<Duration> {
        interval_from_rate(self.rate)
    }
}

/// Invert a rate (per second) into a tick interval, rounding half up
pub fn interval_from_rate(rate: u32) -> Result<Duration> {
    if rate == 0 {
        return Err(BusError::Config("Poll rate must be greater than zero".into()));
    }
    let millis = ((1.0 / f64::from(rate)) * 1000.0 + 0.5).round();
    Ok(Duration::from_millis(millis as u64))
}

/// Timestamp of the last record emitted; never moves backwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark(Option<DateTime<Utc>>);

impl Watermark {
    pub fn starting_now() -> Self {
        Self(Some(Utc::now()))
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(Some(instant))
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// Move to `candidate` unless that would go backwards
    pub fn advance(&mut self, candidate: DateTime<Utc>) -> bool {
        match self.0 {
            Some(current) if candidate < current => false,
            _ => {
                self.0 = Some(candidate);
                true
            }
        }
    }
}

impl PollMode {
    /// Whether replies arrive as aggregation rows (`cursor.firstBatch`, `time`)
    pub fn reads_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Find { aggregate, .. } => !aggregate.is_empty(),
        }
    }
}

/// Result of one successful tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing newer than the watermark
    Empty,
    /// `count` records were published
    Published { count: usize },
}

/// Polls one collection on a timer
pub struct Poller {
    config: PollerConfig,
    bus: Arc<dyn MessageBus>,
    /// Gateway address answering this poller's requests
    request_address: String,
    timestamps: TimestampFormat,
    watermark: RwLock<Watermark>,
}

impl Poller {
    /// Validate `config`; fails on a zero rate before any timer exists.
    ///
    /// The watermark starts empty; [`Poller::start`] arms an aggregating
    /// poller at "now".
    pub fn new(
        config: PollerConfig,
        bus: Arc<dyn MessageBus>,
        request_address: impl Into<String>,
        timestamps: TimestampFormat,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            bus,
            request_address: request_address.into(),
            timestamps,
            watermark: RwLock::new(Watermark::default()),
        })
    }

    /// Replace the starting watermark; [`Poller::start`] keeps a preset one
    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.watermark = RwLock::new(watermark);
        self
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub async fn watermark(&self) -> Watermark {
        *self.watermark.read().await
    }

    fn newer_than(&self, instant: DateTime<Utc>) -> Value {
        json!({ DATETIME_FIELD: { "$gt": timestamp::date_value(&self.timestamps.format(instant)) } })
    }

    /// Request for the next tick, scoped to records after the watermark
    pub async fn next_request(&self) -> DbRequest {
        let watermark = self.watermark().await.get();
        let request = DbRequest::new(self.config.collection.clone());

        match self.config.mode {
            PollMode::Aggregate { ref field } => {
                let query = watermark
                    .map(|wm| self.newer_than(wm).to_string())
                    .unwrap_or_default();
                request.with_query(query).with_aggregate(field.clone())
            }
            PollMode::Find {
                ref query,
                ref fields,
                ref sort,
                ref aggregate,
            } => {
                let query = match watermark {
                    None => query.clone(),
                    Some(wm) => merge_query(query, self.newer_than(wm)),
                };
                request
                    .with_query(query)
                    .with_fields(fields.clone())
                    .with_sort(sort.clone())
                    .with_aggregate(aggregate.clone())
            }
        }
    }

    /// Pull out the rows of a reply
    fn batch(&self, reply: &Value) -> Result<Vec<Value>> {
        let rows = if self.config.mode.reads_aggregate() {
            reply.pointer("/cursor/firstBatch")
        } else {
            reply.get("result")
        };
        rows.and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| BusError::BadRequest("Reply carries no result batch".into()))
    }

    /// Timestamp of a row, used as the candidate watermark
    fn row_time(&self, row: &Value) -> Result<DateTime<Utc>> {
        let raw = if self.config.mode.reads_aggregate() {
            row.get("time")
        } else {
            row.pointer("/datetime/$date")
        };
        match raw {
            Some(Value::String(s)) => match s.parse::<i64>() {
                Ok(millis) => from_millis(millis),
                Err(_) => timestamp::parse(s),
            },
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| BusError::BadRequest(format!("Row time {} is not an integer", n)))
                .and_then(from_millis),
            Some(Value::Object(o)) => match o.get("$numberLong").and_then(Value::as_str) {
                Some(s) => s
                    .parse::<i64>()
                    .map_err(|e| BusError::BadRequest(format!("Invalid row time: {}", e)))
                    .and_then(from_millis),
                None => Err(BusError::BadRequest("Row time has an unknown shape".into())),
            },
            _ => Err(BusError::BadRequest("Row carries no timestamp".into())),
        }
    }

    /// Newest row timestamp of a non-empty batch; every row must carry one
    fn newest_time(&self, rows: &[Value]) -> Result<Option<DateTime<Utc>>> {
        let mut newest = None;
        for row in rows {
            let time = self.row_time(row)?;
            newest = Some(newest.map_or(time, |n: DateTime<Utc>| n.max(time)));
        }
        Ok(newest)
    }

    /// Run one tick: request, publish what is new, advance the watermark.
    ///
    /// On any failure nothing is published and the watermark is unchanged.
    pub async fn poll_once(&self) -> Result<TickOutcome> {
        let request = self.next_request().await;
        let reply = self
            .bus
            .request(&self.request_address, request.to_value()?)
            .await?;

        let rows = self.batch(&reply)?;
        let Some(candidate) = self.newest_time(&rows)? else {
            debug!(collection = %self.config.collection, "No new records");
            return Ok(TickOutcome::Empty);
        };

        let count = rows.len();
        self.bus
            .publish(&self.config.out_address, Value::Array(rows))
            .await?;

        if !self.watermark.write().await.advance(candidate) {
            warn!(collection = %self.config.collection, "Newest record is older than the watermark");
        }
        debug!(
            collection = %self.config.collection,
            out = %self.config.out_address,
            count,
            "Published new records"
        );
        Ok(TickOutcome::Published { count })
    }

    /// Arm the watermark and the timer. Ticks never overlap; a tick that
    /// outlives the interval delays the next one.
    pub async fn start(self: Arc<Self>) -> Result<PollerHandle> {
        let period = self.config.interval()?;
        if let PollMode::Aggregate { .. } = self.config.mode {
            let mut watermark = self.watermark.write().await;
            if watermark.get().is_none() {
                *watermark = Watermark::starting_now();
            }
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let collection = self.config.collection.clone();

        info!(
            collection = %collection,
            out = %self.config.out_address,
            interval_ms = period.as_millis() as u64,
            "Starting poller"
        );

        let poller = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = poller.poll_once().await {
                            error!(
                                collection = %poller.config.collection,
                                error = %e,
                                "Poll failed, retrying next tick"
                            );
                        }
                    }
                }
            }
            debug!(collection = %poller.config.collection, "Poller loop ended");
        });

        Ok(PollerHandle {
            collection,
            stop_tx,
            task,
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| BusError::BadRequest(format!("Epoch millis out of range: {}", millis)))
}

/// Combine a configured query with the watermark condition
fn merge_query(configured: &str, newer: Value) -> String {
    let configured = configured.trim();
    if configured.is_empty() {
        return newer.to_string();
    }
    match serde_json::from_str::<Value>(configured) {
        Ok(Value::Object(map)) if map.is_empty() => newer.to_string(),
        Ok(Value::Object(map)) => json!({ "$and": [Value::Object(map), newer] }).to_string(),
        _ => {
            warn!(query = %configured, "Configured query is not a JSON object, polling on watermark only");
            newer.to_string()
        }
    }
}

/// Running poller; dropping it also ends the loop after the current tick
pub struct PollerHandle {
    collection: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Deschedule the timer and wait for an in-flight tick to finish
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(collection = %self.collection, error = %e, "Poller task ended abnormally");
        }
        info!(collection = %self.collection, "Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler_fn, LocalBus};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn aggregate_config(rate: u32) -> PollerConfig {
        PollerConfig {
            collection: "Position".into(),
            rate,
            out_address: "out".into(),
            mode: PollMode::Aggregate { field: "x".into() },
        }
    }

    fn find_config(query: &str) -> PollerConfig {
        PollerConfig {
            collection: "Position".into(),
            rate: 1,
            out_address: "out".into(),
            mode: PollMode::Find {
                query: query.into(),
                fields: vec![],
                sort: vec![],
                aggregate: String::new(),
            },
        }
    }

    /// Serves `db` with canned replies and records the requests
    async fn canned(bus: &LocalBus, reply: Value) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.serve(
            "db",
            handler_fn(move |body| {
                log.lock().unwrap().push(body);
                let reply = reply.clone();
                async move { Ok(reply) }
            }),
        )
        .await
        .unwrap();
        seen
    }

    fn millis(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_interval_from_rate() {
        assert_eq!(interval_from_rate(1).unwrap(), Duration::from_millis(1001));
        assert_eq!(interval_from_rate(3).unwrap(), Duration::from_millis(334));
        assert_eq!(interval_from_rate(4).unwrap(), Duration::from_millis(251));
        assert_eq!(interval_from_rate(10).unwrap(), Duration::from_millis(101));
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(matches!(interval_from_rate(0), Err(BusError::Config(_))));
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let err = Poller::new(aggregate_config(0), bus, "db", TimestampFormat::Legacy).err();
        assert!(matches!(err, Some(BusError::Config(_))));
    }

    #[test]
    fn test_config_wire_format() {
        let config: PollerConfig = serde_json::from_value(json!({
            "mode": "find",
            "collection": "Position",
            "rate": 2,
            "outAddress": "out",
            "query": "{\"x\": 1}"
        }))
        .unwrap();
        assert_eq!(config.rate, 2);
        assert!(matches!(config.mode, PollMode::Find { ref query, .. } if query == "{\"x\": 1}"));
        assert!(!config.mode.reads_aggregate());

        let config: PollerConfig = serde_json::from_value(json!({
            "mode": "find",
            "collection": "Position",
            "rate": 2,
            "outAddress": "out",
            "aggregate": "x"
        }))
        .unwrap();
        assert!(matches!(config.mode, PollMode::Find { ref aggregate, .. } if aggregate == "x"));
        assert!(config.mode.reads_aggregate());

        let config: PollerConfig = serde_json::from_value(json!({
            "mode": "aggregate",
            "collection": "Position",
            "rate": 1,
            "outAddress": "out",
            "field": "x"
        }))
        .unwrap();
        assert_eq!(config, aggregate_config(1));
    }

    #[test]
    fn test_watermark_never_moves_backwards() {
        let mut wm = Watermark::at(millis(2000));
        assert!(!wm.advance(millis(1000)));
        assert_eq!(wm.get(), Some(millis(2000)));
        assert!(wm.advance(millis(3000)));
        assert_eq!(wm.get(), Some(millis(3000)));

        let mut empty = Watermark::default();
        assert!(empty.advance(millis(1)));
    }

    #[tokio::test]
    async fn test_aggregate_tick_publishes_and_advances() {
        let bus = Arc::new(LocalBus::new());
        let batch = json!([
            { "min": 1, "avg": 2.0, "max": 3, "last": 3, "time": 5000 },
            { "min": 5, "avg": 5.0, "max": 5, "last": 5, "time": 6000 }
        ]);
        let seen = canned(&bus, json!({ "cursor": { "firstBatch": batch.clone() }, "ok": 1.0 })).await;
        let mut out = bus.subscribe("out").await.unwrap();

        let poller = Poller::new(aggregate_config(1), bus.clone(), "db", TimestampFormat::Utc)
            .unwrap()
            .with_watermark(Watermark::at(millis(1000)));

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(outcome, TickOutcome::Published { count: 2 });
        assert_eq!(out.next().await, Some(batch));
        assert_eq!(poller.watermark().await.get(), Some(millis(6000)));

        let request = seen.lock().unwrap()[0].clone();
        assert_eq!(request["aggregate"], "x");
        let query: Value = serde_json::from_str(request["query"].as_str().unwrap()).unwrap();
        assert_eq!(
            query,
            json!({ "datetime": { "$gt": { "$date": "1970-01-01T00:00:01.000Z" } } })
        );
    }

    #[tokio::test]
    async fn test_watermark_takes_newest_row() {
        let bus = Arc::new(LocalBus::new());
        let batch = json!([{ "min": 1, "time": 3000 }, { "min": 2, "time": 2000 }]);
        canned(&bus, json!({ "cursor": { "firstBatch": batch } })).await;

        let poller = Poller::new(aggregate_config(1), bus.clone(), "db", TimestampFormat::Utc)
            .unwrap()
            .with_watermark(Watermark::at(millis(1000)));

        assert_eq!(poller.poll_once().await.unwrap(), TickOutcome::Published { count: 2 });
        assert_eq!(poller.watermark().await.get(), Some(millis(3000)));
    }

    #[tokio::test]
    async fn test_start_arms_aggregate_watermark() {
        let bus = Arc::new(LocalBus::new());
        let poller = Arc::new(
            Poller::new(aggregate_config(1), bus.clone(), "db", TimestampFormat::Utc).unwrap(),
        );
        assert_eq!(poller.watermark().await.get(), None);

        let before = Utc::now();
        let handle = poller.clone().start().await.unwrap();
        let armed = poller.watermark().await.get().unwrap();
        assert!(armed >= before);
        handle.stop().await;

        let preset = Arc::new(
            Poller::new(aggregate_config(1), bus.clone(), "db", TimestampFormat::Utc)
                .unwrap()
                .with_watermark(Watermark::at(millis(1000))),
        );
        preset.clone().start().await.unwrap().stop().await;
        assert_eq!(preset.watermark().await.get(), Some(millis(1000)));
    }

    #[tokio::test]
    async fn test_find_with_aggregate_reads_cursor_rows() {
        let bus = Arc::new(LocalBus::new());
        let batch = json!([{ "min": 4, "avg": 4.0, "max": 4, "last": 4, "time": 7000 }]);
        let seen = canned(&bus, json!({ "cursor": { "firstBatch": batch.clone() }, "ok": 1.0 })).await;
        let mut out = bus.subscribe("out").await.unwrap();

        let mut config = find_config("");
        if let PollMode::Find { ref mut aggregate, .. } = config.mode {
            *aggregate = "x".into();
        }
        let poller = Poller::new(config, bus.clone(), "db", TimestampFormat::Utc).unwrap();

        assert_eq!(poller.poll_once().await.unwrap(), TickOutcome::Published { count: 1 });
        assert_eq!(out.next().await, Some(batch));
        assert_eq!(poller.watermark().await.get(), Some(millis(7000)));
        assert_eq!(seen.lock().unwrap()[0]["aggregate"], "x");
    }

    #[tokio::test]
    async fn test_empty_batch_keeps_watermark() {
        let bus = Arc::new(LocalBus::new());
        canned(&bus, json!({ "cursor": { "firstBatch": [] }, "ok": 1.0 })).await;

        let poller = Poller::new(aggregate_config(1), bus.clone(), "db", TimestampFormat::Utc)
            .unwrap()
            .with_watermark(Watermark::at(millis(1000)));

        assert_eq!(poller.poll_once().await.unwrap(), TickOutcome::Empty);
        assert_eq!(poller.watermark().await.get(), Some(millis(1000)));
    }

    #[tokio::test]
    async fn test_failed_request_keeps_watermark() {
        let bus = Arc::new(LocalBus::new());
        bus.serve(
            "db",
            handler_fn(|_| async { Err(BusError::Database("unreachable".into())) }),
        )
        .await
        .unwrap();

        let poller = Poller::new(aggregate_config(1), bus.clone(), "db", TimestampFormat::Utc)
            .unwrap()
            .with_watermark(Watermark::at(millis(1000)));

        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.watermark().await.get(), Some(millis(1000)));
    }

    #[tokio::test]
    async fn test_row_without_time_fails_tick() {
        let bus = Arc::new(LocalBus::new());
        canned(&bus, json!({ "cursor": { "firstBatch": [{ "min": 1 }] } })).await;
        let mut out = bus.subscribe("out").await.unwrap();

        let poller = Poller::new(aggregate_config(1), bus.clone(), "db", TimestampFormat::Utc)
            .unwrap()
            .with_watermark(Watermark::at(millis(1000)));

        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.watermark().await.get(), Some(millis(1000)));

        bus.publish("out", json!("marker")).await.unwrap();
        assert_eq!(out.next().await, Some(json!("marker")));
    }

    #[tokio::test]
    async fn test_find_mode_starts_without_watermark() {
        let bus = Arc::new(LocalBus::new());
        let rows = json!([
            { "x": 1, "datetime": { "$date": "2021-05-07T10:15:30.000Z" } },
            { "x": 2, "datetime": { "$date": "2021-05-07T12:15:31.000+02:00" } }
        ]);
        let seen = canned(&bus, json!({ "result": rows })).await;

        let poller = Poller::new(find_config(r#"{"x": {"$gt": 0}}"#), bus.clone(), "db", TimestampFormat::Utc)
            .unwrap();
        assert_eq!(poller.watermark().await.get(), None);

        poller.poll_once().await.unwrap();
        poller.poll_once().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0]["query"], r#"{"x": {"$gt": 0}}"#);

        let merged: Value = serde_json::from_str(seen[1]["query"].as_str().unwrap()).unwrap();
        assert_eq!(
            merged,
            json!({ "$and": [
                { "x": { "$gt": 0 } },
                { "datetime": { "$gt": { "$date": "2021-05-07T10:15:31.000Z" } } }
            ] })
        );
    }

    #[test]
    fn test_merge_query_without_configured_filter() {
        let newer = json!({ "datetime": { "$gt": 1 } });
        assert_eq!(merge_query("", newer.clone()), newer.to_string());
        assert_eq!(merge_query("{}", newer.clone()), newer.to_string());
        assert_eq!(merge_query("not json", newer.clone()), newer.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let bus = Arc::new(LocalBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bus.serve(
            "db",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!({ "cursor": { "firstBatch": [] } })) }
            }),
        )
        .await
        .unwrap();

        let poller = Arc::new(
            Poller::new(aggregate_config(10), bus.clone(), "db", TimestampFormat::Utc).unwrap(),
        );
        let handle = poller.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
