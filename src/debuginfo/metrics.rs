use crate::metrics::{Counter, DurationSummary, Gauge};

#[derive(Debug, Default)]
pub struct Metrics {
    pub ensure_uploaded_success: Counter,
    pub ensure_uploaded_fail: Counter,
    /// Requests answered from the should-initiate cache without any work.
    pub ensure_uploaded_shared: Counter,
    pub ensure_uploaded_errors_extract_or_find: Counter,
    pub ensure_uploaded_errors_upload: Counter,

    pub found_success: Counter,
    pub found_fail: Counter,
    pub find_duration: DurationSummary,

    pub extracted_success: Counter,
    pub extracted_fail: Counter,
    pub extract_duration: DurationSummary,

    pub upload_requests: Counter,
    pub upload_attempts: Counter,
    pub uploaded_success: Counter,
    pub uploaded_fail: Counter,
    /// Uploads satisfied by another caller's in-flight upload.
    pub uploaded_shared: Counter,
    pub upload_inflight: Gauge,
    pub upload_request_wait_duration: DurationSummary,
    pub upload_duration: DurationSummary,

    pub should_initiate_cache_hit: Counter,
    pub should_initiate_cache_miss: Counter,
    pub hash_cache_hit: Counter,
    pub hash_cache_miss: Counter,
}
