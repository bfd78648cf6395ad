use prometheus::{Encoder, TextEncoder};

use super::*;

/// Render every registered collector in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_accepted() {
        CONNECTIONS_ACCEPTED_TOTAL.inc();
    }

    pub fn record_refused() {
        CONNECTIONS_REFUSED_TOTAL.inc();
    }

    pub fn record_authenticated() {
        AUTHENTICATIONS_TOTAL.inc();
    }

    pub fn record_eviction() {
        EVICTIONS_TOTAL.inc();
    }

    pub fn record_closed(duration_secs: f64) {
        CONNECTION_DURATION.observe(duration_secs);
    }

    pub fn set_counts(pending: usize, authenticated: usize) {
        CONNECTIONS_PENDING.set(pending as i64);
        CONNECTIONS_AUTHENTICATED.set(authenticated as i64);
    }
}

pub struct RelayMetrics;

impl RelayMetrics {
    pub fn record(outcome: &str) {
        RELAY_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn count(outcome: &str) -> u64 {
        RELAY_TOTAL.with_label_values(&[outcome]).get()
    }
}

pub struct SweepMetrics;

impl SweepMetrics {
    pub fn record_expired(reason: &str, count: usize) {
        if count > 0 {
            SWEEP_EXPIRED_TOTAL
                .with_label_values(&[reason])
                .inc_by(count as u64);
        }
    }

    pub fn record_duration(duration_secs: f64) {
        SWEEP_DURATION.observe(duration_secs);
    }
}

pub struct RoomMetrics;

impl RoomMetrics {
    pub fn record_broadcast(members: usize) {
        ROOM_BROADCASTS_TOTAL.inc();
        ROOM_MEMBERS.set(members as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_relay_counter() {
        RelayMetrics::record("delivered");
        let output = encode_metrics().unwrap();
        assert!(output.contains("signaling_relay_total"));
    }
}
