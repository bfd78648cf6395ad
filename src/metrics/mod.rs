//! Prometheus metrics for the signaling relay.
//!
//! This module provides metrics for monitoring the relay:
//! - Connection metrics (accepted, refused, pending/authenticated gauges)
//! - Authentication metrics (promotions, evictions)
//! - Relay metrics (outcomes by label)
//! - Sweeper and room metrics

mod helpers;

pub use helpers::{
    encode_metrics, ConnectionMetrics, RelayMetrics, RoomMetrics, SweepMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "signaling";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Connections admitted as pending
    pub static ref CONNECTIONS_ACCEPTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_accepted_total", METRIC_PREFIX),
        "Total connections admitted as pending"
    ).unwrap();

    /// Connections refused at the capacity limit
    pub static ref CONNECTIONS_REFUSED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_refused_total", METRIC_PREFIX),
        "Total connections refused because the limit was reached"
    ).unwrap();

    /// Pending connections right now
    pub static ref CONNECTIONS_PENDING: IntGauge = register_int_gauge!(
        format!("{}_connections_pending", METRIC_PREFIX),
        "Number of connections awaiting authentication"
    ).unwrap();

    /// Authenticated connections right now
    pub static ref CONNECTIONS_AUTHENTICATED: IntGauge = register_int_gauge!(
        format!("{}_connections_authenticated", METRIC_PREFIX),
        "Number of authenticated connections"
    ).unwrap();

    /// Connection lifetime
    pub static ref CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_connection_duration_seconds", METRIC_PREFIX),
        "Connection lifetime in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0]
    ).unwrap();

    // ============================================================================
    // Authentication Metrics
    // ============================================================================

    /// Successful promotions
    pub static ref AUTHENTICATIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_authentications_total", METRIC_PREFIX),
        "Total connections promoted to authenticated"
    ).unwrap();

    /// Sessions evicted by a newer session of the same user
    pub static ref EVICTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_evictions_total", METRIC_PREFIX),
        "Total sessions evicted by a newer session of the same user"
    ).unwrap();

    // ============================================================================
    // Relay Metrics
    // ============================================================================

    /// Relay attempts by outcome
    pub static ref RELAY_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_relay_total", METRIC_PREFIX),
        "Relay attempts by outcome",
        &["outcome"]
    ).unwrap();

    // ============================================================================
    // Sweeper Metrics
    // ============================================================================

    /// Connections expired by the sweeper
    pub static ref SWEEP_EXPIRED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_sweep_expired_total", METRIC_PREFIX),
        "Connections closed by the sweeper",
        &["reason"]
    ).unwrap();

    /// Sweep duration
    pub static ref SWEEP_DURATION: Histogram = register_histogram!(
        format!("{}_sweep_duration_seconds", METRIC_PREFIX),
        "Duration of a sweep pass",
        vec![0.0001, 0.001, 0.01, 0.1, 1.0]
    ).unwrap();

    // ============================================================================
    // Room Metrics
    // ============================================================================

    /// Room members right now
    pub static ref ROOM_MEMBERS: IntGauge = register_int_gauge!(
        format!("{}_room_members", METRIC_PREFIX),
        "Number of users in the room"
    ).unwrap();

    /// Membership broadcasts
    pub static ref ROOM_BROADCASTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_room_broadcasts_total", METRIC_PREFIX),
        "Total room membership broadcasts"
    ).unwrap();
}
