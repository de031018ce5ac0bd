use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Metric name prefix for all Fileshare metrics
const PREFIX: &str = "fileshare";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Transfer Metrics
    pub static ref UPLOADED_BYTES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_uploaded_bytes_total"),
        "Total bytes received from uploads"
    ).expect("Failed to create uploaded_bytes_total metric");

    pub static ref DOWNLOADED_BYTES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_downloaded_bytes_total"), "Total bytes served to downloads"),
        &["origin_ip"]
    ).expect("Failed to create downloaded_bytes_total metric");

    // Dedup Metrics
    pub static ref DEDUP_RESOLUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_dedup_resolutions_total"), "Finalized uploads by dedup outcome"),
        &["outcome"]
    ).expect("Failed to create dedup_resolutions_total metric");

    // Download Cache Metrics
    pub static ref CACHE_HITS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_cache_hits_total"),
        "Download cache hits"
    ).expect("Failed to create cache_hits_total metric");

    pub static ref CACHE_MISSES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_cache_misses_total"),
        "Download cache misses"
    ).expect("Failed to create cache_misses_total metric");

    pub static ref CACHE_SIZE_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_cache_size_bytes"),
        "Bytes currently held by the download cache"
    ).expect("Failed to create cache_size_bytes metric");

    // Metadata Pipeline Metrics
    pub static ref PIPELINE_ITEMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_pipeline_items_total"), "Metadata pipeline items by outcome"),
        &["outcome"]
    ).expect("Failed to create pipeline_items_total metric");

    pub static ref PIPELINE_QUEUE_DEPTH: Gauge = Gauge::new(
        format!("{PREFIX}_pipeline_queue_depth"),
        "Items waiting in the metadata queue"
    ).expect("Failed to create pipeline_queue_depth metric");

    // Reconciliation Metrics
    pub static ref SWEEP_REPAIRS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_sweep_repairs_total"), "Reconciliation sweep repairs by kind"),
        &["kind"]
    ).expect("Failed to create sweep_repairs_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(UPLOADED_BYTES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DOWNLOADED_BYTES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DEDUP_RESOLUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_SIZE_BYTES.clone()));
    let _ = REGISTRY.register(Box::new(PIPELINE_ITEMS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PIPELINE_QUEUE_DEPTH.clone()));
    let _ = REGISTRY.register(Box::new(SWEEP_REPAIRS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record bytes served to a client
pub fn record_downloaded_bytes(origin_ip: &str, bytes: u64) {
    DOWNLOADED_BYTES_TOTAL
        .with_label_values(&[origin_ip])
        .inc_by(bytes as f64);
}

/// Record a dedup resolution outcome ("canonical", "alias" or "repeat")
pub fn record_dedup_resolution(outcome: &str) {
    DEDUP_RESOLUTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a metadata pipeline item outcome ("processed", "skipped" or "failed")
pub fn record_pipeline_item(outcome: &str) {
    PIPELINE_ITEMS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a reconciliation repair by kind
pub fn record_sweep_repair(kind: &str) {
    SWEEP_REPAIRS_TOTAL.with_label_values(&[kind]).inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}
