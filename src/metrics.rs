use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static::lazy_static! {
    pub static ref SEARCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiver_searches_total", "Filtered and cluster-restricted searches", &["kind"]
    ).unwrap();
    pub static ref SEARCH_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiver_search_failures_total", "Searches that returned an error", &["kind"]
    ).unwrap();
    pub static ref SEARCH_DURATION: HistogramVec = register_histogram_vec!(
        "quiver_search_duration_seconds", "Search duration", &["kind"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();
    pub static ref DEVICE_TRANSFERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiver_device_transfers_total", "Index transfers between host and device", &["direction", "status"]
    ).unwrap();
    pub static ref KMEANS_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiver_kmeans_runs_total", "Completed k-means trainings", &["mode"]
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&SEARCHES_TOTAL);
    lazy_static::initialize(&SEARCH_FAILURES_TOTAL);
    lazy_static::initialize(&SEARCH_DURATION);
    lazy_static::initialize(&DEVICE_TRANSFERS_TOTAL);
    lazy_static::initialize(&KMEANS_RUNS_TOTAL);
}

/// Current metric families in the Prometheus text exposition format.
pub fn gather_text() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
