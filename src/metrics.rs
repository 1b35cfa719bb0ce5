use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Prometheus collectors for the admission gate, cache and store layer
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    admission_decisions: CounterVec,

    // Cache metrics
    cache_requests: CounterVec,
    cache_evictions: Counter,
    cache_warmup_entries: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,

    // HTTP metrics
    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let admission_decisions = CounterVec::new(
            Opts::new(
                "admission_decisions_total",
                "Admission decisions by outcome",
            ),
            &["outcome"],
        )?;

        let cache_requests = CounterVec::new(
            Opts::new(
                "cache_requests_total",
                "Cache lookups by result",
            ),
            &["result"],
        )?;

        let cache_evictions = Counter::new(
            "cache_evictions_total",
            "Number of cache keys invalidated",
        )?;

        let cache_warmup_entries = CounterVec::new(
            Opts::new(
                "cache_warmup_entries_total",
                "Cache warmup entries by result",
            ),
            &["result"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "store_operations_total",
                "Number of store operations by type",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_operation_duration_seconds",
                "Duration of store operations in seconds",
            ),
            &["operation"],
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "http_request_duration_seconds",
            "Duration of governed HTTP requests in seconds",
        ))?;

        // Register all metrics
        registry.register(Box::new(admission_decisions.clone()))?;
        registry.register(Box::new(cache_requests.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(cache_warmup_entries.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            admission_decisions,
            cache_requests,
            cache_evictions,
            cache_warmup_entries,
            store_operations,
            store_operation_duration,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an admission decision (`allowed`, `rejected`, `banned`, `fail_open`, `disabled`)
    pub fn record_admission(&self, outcome: &str) {
        self.admission_decisions.with_label_values(&[outcome]).inc();
    }

    /// Record a cache lookup (`hit`, `miss`, `error`)
    pub fn record_cache_request(&self, result: &str) {
        self.cache_requests.with_label_values(&[result]).inc();
    }

    pub fn record_cache_evictions(&self, count: u64) {
        self.cache_evictions.inc_by(count as f64);
    }

    pub fn record_warmup_entry(&self, result: &str) {
        self.cache_warmup_entries.with_label_values(&[result]).inc();
    }

    /// Record a store operation
    pub fn record_store_operation(&self, operation: &str, result: &str) {
        self.store_operations.with_label_values(&[operation, result]).inc();
    }

    /// Record store operation duration
    pub fn record_store_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Create a timer for measuring request duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        prometheus::TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
