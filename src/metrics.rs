use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram, HistogramOpts, Opts};

lazy_static! {
    // Firehose metrics
    pub static ref COMMITS_PROCESSED: Counter = register_counter!(Opts::new(
        "commits_processed_total",
        "Total number of firehose commits processed"
    ))
    .unwrap();

    pub static ref POSTS_PUBLISHED: Counter = register_counter!(Opts::new(
        "posts_published_total",
        "Total number of posts published to the broker"
    ))
    .unwrap();

    pub static ref LIKES_PUBLISHED: Counter = register_counter!(Opts::new(
        "likes_published_total",
        "Total number of likes published to the broker"
    ))
    .unwrap();

    pub static ref OPS_SKIPPED: Counter = register_counter!(Opts::new(
        "ops_skipped_total",
        "Total number of firehose operations dropped on decode errors"
    ))
    .unwrap();

    // Classifier metrics
    pub static ref CLASSIFIER_INVOCATIONS: Counter = register_counter!(Opts::new(
        "classifier_invocations_total",
        "Total number of classifier invocations"
    ))
    .unwrap();

    pub static ref CLASSIFIER_TIMEOUTS: Counter = register_counter!(Opts::new(
        "classifier_timeouts_total",
        "Total number of classifier invocations stopped at the deadline"
    ))
    .unwrap();

    pub static ref POSTS_INDEXED: Counter = register_counter!(Opts::new(
        "posts_indexed_total",
        "Total number of feed-post rows upserted"
    ))
    .unwrap();

    // Timing metrics
    pub static ref CLASSIFY_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "classify_time_seconds",
            "Time taken to fan a post out across all classifiers"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5])
    )
    .unwrap();
}

// Function to expose metrics endpoint
pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
