//! Proxy counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by every listener and session of one proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Client connections accepted.
    pub sessions_accepted: AtomicU64,
    /// Sessions currently forwarding (or dialing).
    pub sessions_active: AtomicU64,
    /// Sessions that have ended, for any reason.
    pub sessions_closed: AtomicU64,
    /// Sessions dropped because the local socket could not be dialed.
    pub dial_failures: AtomicU64,
    /// Failed `accept` calls.
    pub accept_errors: AtomicU64,
    /// Bytes forwarded client to socket.
    pub bytes_to_backend: AtomicU64,
    /// Bytes forwarded socket to client.
    pub bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_accepted: u64,
    pub sessions_active: u64,
    pub sessions_closed: u64,
    pub dial_failures: u64,
    pub accept_errors: u64,
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
}

impl ProxyStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn session_opened(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counters() {
        let stats = ProxyStats::default();
        stats.session_opened();
        stats.session_opened();
        stats.session_closed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sessions_accepted, 2);
        assert_eq!(snapshot.sessions_active, 1);
        assert_eq!(snapshot.sessions_closed, 1);
    }
}
