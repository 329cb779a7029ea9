//! Cache metrics recorded through the `metrics` facade.
//!
//! Nothing is exported unless the host process installs a recorder (the server
//! binary installs the Prometheus exporter).

use metrics::counter;

use crate::error::EntityKind;

/// Metric names.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "discord_state_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "discord_state_cache_misses_total";
    pub const CACHE_NEGATIVE_HITS_TOTAL: &str = "discord_state_cache_negative_hits_total";
    pub const CACHE_DECODE_ERRORS_TOTAL: &str = "discord_state_cache_decode_errors_total";
    pub const REMOTE_FETCHES_TOTAL: &str = "discord_state_remote_fetches_total";
    pub const SINGLEFLIGHT_JOINS_TOTAL: &str = "discord_state_singleflight_joins_total";
    pub const MEMBER_REQUESTS_TOTAL: &str = "discord_state_member_requests_total";
    pub const INVALIDATIONS_TOTAL: &str = "discord_state_invalidations_total";
    pub const GATEWAY_EVENTS_DROPPED_TOTAL: &str = "discord_state_gateway_events_dropped_total";
}

pub fn record_cache_hit(kind: EntityKind) {
    counter!(names::CACHE_HITS_TOTAL, "entity" => kind.as_str()).increment(1);
}

pub fn record_cache_miss(kind: EntityKind) {
    counter!(names::CACHE_MISSES_TOTAL, "entity" => kind.as_str()).increment(1);
}

pub fn record_negative_hit(kind: EntityKind) {
    counter!(names::CACHE_NEGATIVE_HITS_TOTAL, "entity" => kind.as_str()).increment(1);
}

pub fn record_decode_error(kind: EntityKind) {
    counter!(names::CACHE_DECODE_ERRORS_TOTAL, "entity" => kind.as_str()).increment(1);
}

/// Record a remote fetch and how it ended (`ok`, `not_found`, `error`).
pub fn record_remote_fetch(kind: EntityKind, outcome: &'static str) {
    counter!(names::REMOTE_FETCHES_TOTAL, "entity" => kind.as_str(), "outcome" => outcome)
        .increment(1);
}

pub fn record_singleflight_join() {
    counter!(names::SINGLEFLIGHT_JOINS_TOTAL).increment(1);
}

/// Record a batch member request and how many ids were actually requested.
pub fn record_member_request(requested: usize, skipped: usize) {
    counter!(names::MEMBER_REQUESTS_TOTAL, "ids" => "requested").increment(requested as u64);
    counter!(names::MEMBER_REQUESTS_TOTAL, "ids" => "cached").increment(skipped as u64);
}

/// Record an applied gateway event (`ok` or `error`).
pub fn record_invalidation(event: &'static str, outcome: &'static str) {
    counter!(names::INVALIDATIONS_TOTAL, "event" => event, "outcome" => outcome).increment(1);
}

/// Record a gateway event dropped because the listener fell behind.
pub fn record_dropped_event(event: &'static str) {
    counter!(names::GATEWAY_EVENTS_DROPPED_TOTAL, "event" => event).increment(1);
}
