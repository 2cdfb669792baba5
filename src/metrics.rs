use std::sync::LazyLock;

use prometheus::*;

static METRIC_PROCESSED_IMAGES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "booru_index_processed_images",
        "count of the processed queued images",
        &["outcome"]
    )
    .unwrap()
});

static METRIC_DOWNLOAD_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "booru_index_download_failures",
        "count of the failed image downloads",
        &["site"]
    )
    .unwrap()
});

static METRIC_CRAWLED_PAGES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("booru_index_crawled_pages", "count of the crawled api pages", &["site"])
        .unwrap()
});

static METRIC_CRAWL_ABORTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "booru_index_crawl_aborts",
        "count of the crawls given up after too many retries",
        &["site"]
    )
    .unwrap()
});

static METRIC_JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "booru_index_job_duration",
        "duration of the per-job processing in seconds",
        &["job", "status"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 3600.0]
    )
    .unwrap()
});

/// 图片处理结果计数，outcome 为 new / duplicate / skipped
pub fn inc_processed_image(outcome: &str) {
    METRIC_PROCESSED_IMAGES.with_label_values(&[outcome]).inc();
}

pub fn inc_download_failure(site: &str) {
    METRIC_DOWNLOAD_FAILURES.with_label_values(&[site]).inc();
}

pub fn inc_crawled_page(site: &str) {
    METRIC_CRAWLED_PAGES.with_label_values(&[site]).inc();
}

pub fn inc_crawl_abort(site: &str) {
    METRIC_CRAWL_ABORTS.with_label_values(&[site]).inc();
}

pub fn observe_job_duration(job: &str, status: &str, seconds: f64) {
    METRIC_JOB_DURATION.with_label_values(&[job, status]).observe(seconds);
}
