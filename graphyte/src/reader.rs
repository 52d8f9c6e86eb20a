//! Iterative polling reader over the Graphite render API.
//!
//! An [`IterativeReader`] runs one background poll loop per generation. Each
//! cycle builds a render query from the [`PollCursor`], executes it, turns
//! every non-null datapoint newer than the cursor into a [`Record`], and
//! publishes the batch as a [`ResultEnvelope`] on a bounded channel. Cycles
//! are separated by a fixed delay measured from the end of the previous
//! cycle.
//!
//! A failed cycle never ends the loop: it is counted, logged, and published
//! as an empty envelope so consumers keep a steady cadence.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──► Initializing ──► Running ──stop()──► Stopping ──► Stopped
//! ```
//!
//! Every `start()` builds a fresh query client, channel, cursor, and task,
//! and bumps [`IterativeReader::generation`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use graphyte::reader::{IterativeReader, ReaderConfig};
//! use graphyte::render::RenderConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReaderConfig::new(RenderConfig::new("http://graphite.local:8080"))
//!     .with_target("servers.*.load")
//!     .with_from("-10min")
//!     .with_poll_interval(Duration::from_secs(30));
//!
//! let mut reader = IterativeReader::http(config, tokio::runtime::Handle::current());
//! reader.start()?;
//! while let Some(envelope) = reader.next().await {
//!     for record in &envelope.records {
//!         println!("{} {} {}", record.path(), record.value(), record.epoch_seconds());
//!     }
//! }
//! reader.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cursor::PollCursor;
use crate::error::{ConfigError, QueryError, ReaderError};
use crate::record::Record;
use crate::render::{HttpRenderClient, RenderConfig, RenderQuery, RenderSeries, RenderSource, TimeBound};
use crate::telemetry::{
    Counter, EventKind, EventLogger, FAILURES, MeterRegistry, RECEIVED, TIME_TO_RESPONSE, Timer,
};

/// What to poll and how often.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Render endpoint.
    pub render: RenderConfig,
    /// Target expressions.
    pub targets: Vec<String>,
    /// Lower bound of the first query.
    #[serde(default)]
    pub from: Option<TimeBound>,
    /// Upper bound of every query.
    #[serde(default)]
    pub until: Option<TimeBound>,
    /// `noNullPoints` sent with every query.
    #[serde(default)]
    pub no_null_points: Option<bool>,
    /// Delay between the end of one cycle and the start of the next.
    pub poll_interval: Duration,
    /// Envelopes buffered before the loop waits for the consumer.
    pub channel_capacity: usize,
}

impl ReaderConfig {
    /// Creates a config with no targets, a 60s interval, and room for 16
    /// envelopes.
    pub fn new(render: RenderConfig) -> Self {
        Self {
            render,
            targets: Vec::new(),
            from: None,
            until: None,
            no_null_points: None,
            poll_interval: Duration::from_secs(60),
            channel_capacity: 16,
        }
    }

    /// Adds a target expression.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Sets the lower bound of the first query.
    #[must_use]
    pub fn with_from(mut self, from: impl Into<TimeBound>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the upper bound of every query.
    #[must_use]
    pub fn with_until(mut self, until: impl Into<TimeBound>) -> Self {
        self.until = Some(until.into());
        self
    }

    /// Sets `noNullPoints`.
    #[must_use]
    pub fn with_no_null_points(mut self, enabled: bool) -> Self {
        self.no_null_points = Some(enabled);
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if there are no targets, the channel capacity
    /// is zero, or the render settings are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.render.validate()?;
        if self.targets.is_empty() {
            return Err(ConfigError::Missing { field: "targets" });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The query for the next cycle given the current cursor.
    ///
    /// An empty cursor uses the configured `from`; otherwise the query starts
    /// one second after the cursor.
    pub fn query(&self, cursor: &PollCursor) -> RenderQuery {
        let mut query = RenderQuery::new(self.render.url.clone()).with_targets(self.targets.iter().cloned());

        match (cursor.next_from(), &self.from) {
            (Some(from), _) => query = query.with_from(from),
            (None, Some(from)) => query = query.with_from(from.clone()),
            (None, None) => {}
        }
        if let Some(until) = &self.until {
            query = query.with_until(until.clone());
        }
        if let Some(enabled) = self.no_null_points {
            query = query.with_no_null_points(enabled);
        }
        query
    }
}

/// Lifecycle state of an [`IterativeReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No loop running.
    Stopped,
    /// Building the query client and channel.
    ///
    /// Only held inside [`IterativeReader::start`], which takes `&mut self`,
    /// so callers see it in trace output and never through
    /// [`IterativeReader::state`].
    Initializing,
    /// Loop running.
    Running,
    /// The loop is cancelled but not yet joined.
    ///
    /// Observable when a [`stop`](IterativeReader::stop) future is dropped
    /// before it completes; calling `stop` again finishes the join.
    Stopping,
}

/// Measurements taken for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollMeters {
    /// Records delivered in this envelope.
    pub fetched_count: usize,
    /// Wall time spent on the render query.
    pub elapsed: Duration,
}

/// The output of one poll cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultEnvelope {
    /// New records, in series order then datapoint order.
    pub records: Vec<Record>,
    /// Cycle measurements.
    pub meters: PollMeters,
}

impl ResultEnvelope {
    fn new(records: Vec<Record>, elapsed: Duration) -> Self {
        Self {
            meters: PollMeters {
                fetched_count: records.len(),
                elapsed,
            },
            records,
        }
    }

    /// Whether the cycle delivered nothing.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Runs one poll cycle against `source` and advances `cursor`.
///
/// The cursor only moves when the query succeeds and returns at least one
/// new datapoint.
///
/// # Errors
///
/// Returns the [`QueryError`] of the render call; the cursor is untouched.
pub async fn poll_once<S: RenderSource>(
    source: &S,
    config: &ReaderConfig,
    cursor: &mut PollCursor,
) -> Result<ResultEnvelope, QueryError> {
    let query = config.query(cursor);
    let started = Instant::now();
    let series = source.render(&query).await?;
    let elapsed = started.elapsed();

    let fresh = new_records(&series, cursor);
    let mut records = Vec::with_capacity(fresh.len());
    for (ts, record) in fresh {
        cursor.advance(record.path(), ts);
        records.push(record);
    }
    Ok(ResultEnvelope::new(records, elapsed))
}

/// Flattens `series` into `(timestamp, record)` pairs, keeping datapoints
/// newer than `cursor`.
fn new_records(series: &[RenderSeries], cursor: &PollCursor) -> Vec<(i64, Record)> {
    series
        .iter()
        .flat_map(|s| {
            s.points()
                .filter(|&(ts, _)| cursor.is_new(ts))
                .map(move |(ts, value)| {
                    let record = Record::at_epoch_seconds(s.target.clone(), value, ts)
                        .with_tags(s.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                    (ts, record)
                })
        })
        .collect()
}

type SourceFactory<S> = Arc<dyn Fn(&RenderConfig) -> Result<S, QueryError> + Send + Sync>;

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    receiver: mpsc::Receiver<ResultEnvelope>,
}

/// Polls a render source on a fixed delay and hands results to a consumer.
pub struct IterativeReader<S: RenderSource> {
    config: Arc<ReaderConfig>,
    scheduler: Handle,
    factory: SourceFactory<S>,
    meters: Option<Arc<dyn MeterRegistry>>,
    events: Option<Arc<dyn EventLogger>>,
    state: ReaderState,
    generation: u64,
    running: Option<Running>,
}

impl IterativeReader<HttpRenderClient> {
    /// A reader that queries over HTTP, spawning its loop on `scheduler`.
    pub fn http(config: ReaderConfig, scheduler: Handle) -> Self {
        Self::new(config, scheduler, |render| HttpRenderClient::new(render.clone()))
    }
}

impl<S: RenderSource> IterativeReader<S> {
    /// A reader that builds its query client with `factory` on every start.
    pub fn new<F>(config: ReaderConfig, scheduler: Handle, factory: F) -> Self
    where
        F: Fn(&RenderConfig) -> Result<S, QueryError> + Send + Sync + 'static,
    {
        Self {
            config: Arc::new(config),
            scheduler,
            factory: Arc::new(factory),
            meters: None,
            events: None,
            state: ReaderState::Stopped,
            generation: 0,
            running: None,
        }
    }

    /// Reports `received`, `time_to_response`, and `failures` to `registry`.
    #[must_use]
    pub fn with_meters(mut self, registry: Arc<dyn MeterRegistry>) -> Self {
        self.meters = Some(registry);
        self
    }

    /// Logs one event per cycle to `logger`.
    #[must_use]
    pub fn with_event_logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.events = Some(logger);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Number of times the reader has been started.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts a new poll loop.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::AlreadyRunning`] if a loop is running,
    /// [`ReaderError::StillStopping`] if an earlier `stop` was abandoned
    /// before the loop was joined, or [`ReaderError::Init`] if the query
    /// client cannot be built.
    pub fn start(&mut self) -> Result<(), ReaderError> {
        if self.running.is_some() {
            return Err(match self.state {
                ReaderState::Stopping => ReaderError::StillStopping,
                _ => ReaderError::AlreadyRunning,
            });
        }
        self.state = ReaderState::Initializing;
        tracing::debug!(generation = self.generation + 1, state = ?self.state, "reader starting");

        let source = match (self.factory)(&self.config.render) {
            Ok(source) => source,
            Err(e) => {
                self.state = ReaderState::Stopped;
                return Err(ReaderError::Init(e));
            }
        };

        self.generation += 1;
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();

        let poller = Poller {
            source,
            config: Arc::clone(&self.config),
            meters: self.meters.as_deref().map(Meters::resolve),
            events: self.events.clone(),
            generation: self.generation,
        };
        let task = self.scheduler.spawn(poller.run(sender, cancel.clone()));

        self.running = Some(Running {
            cancel,
            task,
            receiver,
        });
        self.state = ReaderState::Running;
        tracing::info!(
            generation = self.generation,
            targets = self.config.targets.len(),
            interval_ms = self.config.poll_interval.as_millis(),
            "reader started"
        );
        Ok(())
    }

    /// Whether the poll loop is alive and may deliver more envelopes.
    pub fn has_next(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled() && !r.task.is_finished())
    }

    /// Waits for the next envelope; `None` once the reader is stopped.
    pub async fn next(&mut self) -> Option<ResultEnvelope> {
        self.running.as_mut()?.receiver.recv().await
    }

    /// Cancels and joins the loop, then drops the channel and cursor.
    ///
    /// Stopping a stopped reader does nothing. If this future is dropped
    /// early the reader stays [`ReaderState::Stopping`] until `stop` is
    /// called again.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        self.state = ReaderState::Stopping;

        running.cancel.cancel();
        if let Err(e) = (&mut running.task).await {
            tracing::warn!(generation = self.generation, error = %e, "poll loop ended abnormally");
        }
        self.running = None;

        self.state = ReaderState::Stopped;
        tracing::info!(generation = self.generation, "reader stopped");
    }
}

impl<S: RenderSource> Drop for IterativeReader<S> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

impl<S: RenderSource> std::fmt::Debug for IterativeReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterativeReader")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

struct Meters {
    received: Arc<dyn Counter>,
    time_to_response: Arc<dyn Timer>,
    failures: Arc<dyn Counter>,
}

impl Meters {
    fn resolve(registry: &dyn MeterRegistry) -> Self {
        Self {
            received: registry.counter(RECEIVED),
            time_to_response: registry.timer(TIME_TO_RESPONSE),
            failures: registry.counter(FAILURES),
        }
    }
}

/// State owned by one generation's poll loop.
struct Poller<S> {
    source: S,
    config: Arc<ReaderConfig>,
    meters: Option<Meters>,
    events: Option<Arc<dyn EventLogger>>,
    generation: u64,
}

impl<S: RenderSource> Poller<S> {
    async fn run(self, sender: mpsc::Sender<ResultEnvelope>, cancel: CancellationToken) {
        let mut cursor = PollCursor::new();

        loop {
            let envelope = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                envelope = self.cycle(&mut cursor) => envelope,
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                sent = sender.send(envelope) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::debug!(generation = self.generation, "poll loop exited");
    }

    async fn cycle(&self, cursor: &mut PollCursor) -> ResultEnvelope {
        let started = Instant::now();
        match poll_once(&self.source, &self.config, cursor).await {
            Ok(envelope) => {
                if let Some(meters) = &self.meters {
                    meters.received.increment(envelope.records.len() as u64);
                    meters.time_to_response.record(envelope.meters.elapsed);
                }
                if let Some(events) = &self.events {
                    events.log(
                        EventKind::PollSucceeded,
                        &format!("fetched {} records", envelope.records.len()),
                    );
                }
                tracing::debug!(
                    generation = self.generation,
                    records = envelope.records.len(),
                    cursor = ?cursor.last_seen(),
                    "poll cycle complete"
                );
                envelope
            }
            Err(e) => {
                if let Some(meters) = &self.meters {
                    meters.failures.increment(1);
                }
                if let Some(events) = &self.events {
                    events.log(EventKind::PollFailed, &e.to_string());
                }
                tracing::warn!(generation = self.generation, error = %e, "poll cycle failed");
                ResultEnvelope::new(Vec::new(), started.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{InMemoryEventLogger, InMemoryRegistry};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Render source backed by a shared in-memory series list.
    #[derive(Clone, Default)]
    struct MemorySource {
        series: Arc<Mutex<Vec<RenderSeries>>>,
        fail: Arc<AtomicBool>,
        queries: Arc<Mutex<Vec<RenderQuery>>>,
    }

    impl MemorySource {
        fn push_points(&self, target: &str, points: impl IntoIterator<Item = (i64, f64)>) {
            let mut series = self.series.lock().unwrap();
            let datapoints = points.into_iter().map(|(ts, v)| (Some(v), Some(ts)));
            match series.iter_mut().find(|s| s.target == target) {
                Some(existing) => existing.datapoints.extend(datapoints),
                None => series.push(RenderSeries {
                    target: target.to_string(),
                    tags: BTreeMap::new(),
                    datapoints: datapoints.collect(),
                }),
            }
        }
    }

    impl RenderSource for MemorySource {
        async fn render(&self, query: &RenderQuery) -> Result<Vec<RenderSeries>, QueryError> {
            self.queries.lock().unwrap().push(query.clone());
            if self.fail.load(Ordering::SeqCst) {
                return Err(QueryError::HttpStatus {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(self.series.lock().unwrap().clone())
        }
    }

    fn config() -> ReaderConfig {
        ReaderConfig::new(RenderConfig::new("http://graphite.test"))
            .with_target("a")
            .with_from("-1h")
            .with_poll_interval(Duration::from_millis(10))
    }

    fn reader(source: &MemorySource) -> IterativeReader<MemorySource> {
        let source = source.clone();
        IterativeReader::new(config(), Handle::current(), move |_| Ok(source.clone()))
    }

    #[test]
    fn test_query_uses_from_until_cursor_set() {
        let config = config().with_until("now").with_no_null_points(true);
        let query = config.query(&PollCursor::new());
        assert_eq!(query.from(), Some(&TimeBound::Relative("-1h".to_string())));
        assert_eq!(query.until(), Some(&TimeBound::Relative("now".to_string())));

        let mut cursor = PollCursor::new();
        cursor.advance("a", 500);
        let query = config.query(&cursor);
        assert_eq!(query.from(), Some(&TimeBound::Epoch(501)));
        assert_eq!(query.until(), Some(&TimeBound::Relative("now".to_string())));
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        let no_targets = ReaderConfig::new(RenderConfig::new("http://g"));
        assert!(matches!(
            no_targets.validate(),
            Err(ConfigError::Missing { field: "targets" })
        ));
        assert!(config().with_channel_capacity(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_poll_once_filters_and_advances() {
        let source = MemorySource::default();
        source.push_points("a", [(100, 1.0), (160, 2.0)]);
        source.push_points("b", [(130, 3.0)]);
        source.series.lock().unwrap()[0].datapoints.push((None, Some(220)));

        let mut cursor = PollCursor::new();
        let first = poll_once(&source, &config(), &mut cursor).await.unwrap();
        assert_eq!(first.meters.fetched_count, 3);
        assert_eq!(cursor.last_seen(), Some(160));
        assert_eq!(cursor.target_max("b"), Some(130));

        source.push_points("b", [(150, 4.0), (170, 5.0)]);
        let second = poll_once(&source, &config(), &mut cursor).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].path(), "b");
        assert_eq!(second.records[0].epoch_seconds(), 170);

        let queries = source.queries.lock().unwrap();
        assert_eq!(queries[1].from(), Some(&TimeBound::Epoch(161)));
    }

    #[tokio::test]
    async fn test_poll_once_survives_extreme_timestamps() {
        let source = MemorySource::default();
        source.push_points("a", [(i64::MIN, 1.0), (i64::MAX, 2.0)]);

        let mut cursor = PollCursor::new();
        let envelope = poll_once(&source, &config(), &mut cursor).await.unwrap();
        assert_eq!(envelope.records.len(), 2);
        assert_eq!(envelope.records[0].epoch_seconds(), i64::MIN);
        assert_eq!(cursor.last_seen(), Some(i64::MAX));
        assert_eq!(cursor.next_from(), Some(i64::MAX));

        let again = poll_once(&source, &config(), &mut cursor).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_poll_once_failure_leaves_cursor() {
        let source = MemorySource::default();
        source.push_points("a", [(100, 1.0)]);
        source.fail.store(true, Ordering::SeqCst);

        let mut cursor = PollCursor::new();
        assert!(poll_once(&source, &config(), &mut cursor).await.is_err());
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn test_series_tags_become_record_tags() {
        let source = MemorySource::default();
        source.series.lock().unwrap().push(RenderSeries {
            target: "cpu".to_string(),
            tags: BTreeMap::from([("host".to_string(), "web1".to_string())]),
            datapoints: vec![(Some(0.5), Some(10))],
        });

        let mut cursor = PollCursor::new();
        let envelope = poll_once(&source, &config(), &mut cursor).await.unwrap();
        assert_eq!(
            envelope.records[0].tags(),
            &[("host".to_string(), "web1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_backend_yields_empty_envelope() {
        let source = MemorySource::default();
        let mut reader = reader(&source);
        reader.start().unwrap();

        let envelope = reader.next().await.unwrap();
        assert!(envelope.is_empty());
        assert_eq!(envelope.meters.fetched_count, 0);
        reader.stop().await;
    }

    #[tokio::test]
    async fn test_fifty_then_zero() {
        let source = MemorySource::default();
        source.push_points("a", (1..=50).map(|ts: i32| (i64::from(ts), f64::from(ts))));

        let mut reader = reader(&source);
        reader.start().unwrap();

        let first = reader.next().await.unwrap();
        assert_eq!(first.records.len(), 50);
        let second = reader.next().await.unwrap();
        assert_eq!(second.records.len(), 0);

        reader.stop().await;
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_is_a_new_generation() {
        let source = MemorySource::default();
        source.push_points("a", [(1, 1.0)]);
        let mut reader = reader(&source);

        reader.start().unwrap();
        assert_eq!(reader.generation(), 1);
        assert!(matches!(reader.start(), Err(ReaderError::AlreadyRunning)));
        assert_eq!(reader.next().await.unwrap().records.len(), 1);

        reader.stop().await;
        assert_eq!(reader.state(), ReaderState::Stopped);
        assert!(!reader.has_next());

        reader.start().unwrap();
        assert_eq!(reader.generation(), 2);
        assert_eq!(reader.state(), ReaderState::Running);
        assert!(reader.has_next());

        // Fresh cursor: the old datapoint is delivered again.
        assert_eq!(reader.next().await.unwrap().records.len(), 1);
        reader.stop().await;
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_counted() {
        let source = MemorySource::default();
        source.push_points("a", [(1, 1.0), (2, 2.0)]);
        source.fail.store(true, Ordering::SeqCst);

        let registry = Arc::new(InMemoryRegistry::new());
        let logger = Arc::new(InMemoryEventLogger::new());
        let mut reader = reader(&source)
            .with_meters(Arc::clone(&registry) as Arc<dyn MeterRegistry>)
            .with_event_logger(Arc::clone(&logger) as Arc<dyn EventLogger>);
        reader.start().unwrap();

        let failed = reader.next().await.unwrap();
        assert!(failed.is_empty());
        assert!(reader.has_next());

        source.fail.store(false, Ordering::SeqCst);
        let mut delivered = 0;
        while delivered == 0 {
            delivered = reader.next().await.unwrap().records.len();
        }
        reader.stop().await;

        assert_eq!(delivered, 2);
        assert!(registry.counter_value(FAILURES) >= 1);
        assert_eq!(registry.counter_value(RECEIVED), 2);
        assert!(registry.timer_count(TIME_TO_RESPONSE) >= 1);
        assert!(logger.count(EventKind::PollFailed) >= 1);
        assert!(logger.count(EventKind::PollSucceeded) >= 1);
    }

    #[tokio::test]
    async fn test_init_failure_leaves_reader_stopped() {
        let mut reader: IterativeReader<MemorySource> =
            IterativeReader::new(config(), Handle::current(), |render| {
                Err(QueryError::InvalidUrl {
                    url: render.url.clone(),
                    reason: "test".to_string(),
                })
            });

        assert!(matches!(reader.start(), Err(ReaderError::Init(_))));
        assert_eq!(reader.state(), ReaderState::Stopped);
        assert_eq!(reader.generation(), 0);
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_stop_leaves_reader_stopping() {
        use futures::FutureExt;

        let source = MemorySource::default();
        source.push_points("a", [(1, 1.0)]);
        let mut reader = reader(&source);
        reader.start().unwrap();
        assert_eq!(reader.next().await.unwrap().records.len(), 1);

        // The loop task cannot run before this single poll returns.
        assert!(reader.stop().now_or_never().is_none());
        assert_eq!(reader.state(), ReaderState::Stopping);
        assert!(!reader.has_next());
        assert!(matches!(reader.start(), Err(ReaderError::StillStopping)));

        reader.stop().await;
        assert_eq!(reader.state(), ReaderState::Stopped);
        reader.start().unwrap();
        assert_eq!(reader.generation(), 2);
        reader.stop().await;
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let source = MemorySource::default();
        let mut reader = reader(&source);
        reader.stop().await;
        assert_eq!(reader.state(), ReaderState::Stopped);
    }
}
