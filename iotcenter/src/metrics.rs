use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref DEVICES_CREATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotcenter_devices_created_total",
        "Total device records created"
    ))
    .expect("valid metric definition");
    pub static ref AUTHORIZATIONS_ISSUED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotcenter_authorizations_issued_total",
        "Total device authorizations issued by the store"
    ))
    .expect("valid metric definition");
    pub static ref MEASUREMENTS_WRITTEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotcenter_measurements_written_total",
        "Total telemetry points acknowledged by the store"
    ))
    .expect("valid metric definition");
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotcenter_store_failures_total",
        "Total failed requests to the time-series store"
    ))
    .expect("valid metric definition");
    pub static ref GEOLOCATION_FALLBACKS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotcenter_geolocation_fallbacks_total",
        "Total readings that used fallback coordinates"
    ))
    .expect("valid metric definition");
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(DEVICES_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AUTHORIZATIONS_ISSUED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MEASUREMENTS_WRITTEN_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GEOLOCATION_FALLBACKS_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
