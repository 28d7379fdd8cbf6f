use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CHECKINS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_checkins_total",
        "Total device check-ins handled"
    ))
    .unwrap();
    pub static ref CHECKIN_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_checkin_failures_total",
        "Total check-ins rolled back and reported as retryable"
    ))
    .unwrap();
    pub static ref CHECKIN_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "coordinator_checkin_latency_seconds",
            "Time taken to handle one check-in"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref COMMANDS_CLAIMED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_commands_claimed_total",
        "Total command deliveries, retries included"
    ))
    .unwrap();
    pub static ref CLAIM_CONFLICTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_claim_conflicts_total",
        "Total command claims lost to a concurrent claimer"
    ))
    .unwrap();
    pub static ref COMMANDS_EXPIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_commands_expired_total",
        "Total commands expired by the sweeper"
    ))
    .unwrap();
    pub static ref COMMANDS_EXHAUSTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_commands_exhausted_total",
        "Total commands failed after running out of attempts"
    ))
    .unwrap();
    pub static ref READINGS_INGESTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_readings_ingested_total",
        "Total canonical telemetry readings stored"
    ))
    .unwrap();
    pub static ref LINKS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_links_rejected_total",
        "Total owner links skipped because the owner does not exist"
    ))
    .unwrap();
    pub static ref RANGES_OPENED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_ranges_opened_total",
        "Total owner link ranges opened instead of extended"
    ))
    .unwrap();
    pub static ref ALARMS_FIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_alarms_fired_total",
        "Total alarm notifications emitted"
    ))
    .unwrap();
    pub static ref DEVICES_MARKED_INACTIVE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_devices_marked_inactive_total",
        "Total devices marked inactive by the sweeper"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_db_failures_total",
        "Total transient database failures that were retried"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(CHECKINS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(CHECKIN_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHECKIN_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMANDS_CLAIMED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CLAIM_CONFLICTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMANDS_EXPIRED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMANDS_EXHAUSTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(READINGS_INGESTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LINKS_REJECTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RANGES_OPENED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALARMS_FIRED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DEVICES_MARKED_INACTIVE_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
