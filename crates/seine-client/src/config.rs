use std::time::Duration;

/// Per-connection tunables. The defaults match the deployed servers; tests
/// shrink the timeouts.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Well-known server port, used when a host string carries no port of its
    /// own.
    pub port: u16,
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
    /// Capacity of the session-wide merged result queue. Producers block once
    /// it fills, which is what ultimately throttles credit back to servers.
    pub blast_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: seine_wire::proto::PORT,
            handshake_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(30),
            blast_queue_capacity: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_the_well_known_port() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.port, seine_wire::proto::PORT);
        assert_eq!(cfg.blast_queue_capacity, 20);
    }
}
