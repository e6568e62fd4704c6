//! Heartbeat schedule and the thread that drives it.
//!
//! The first beat after Hello always carries `null`; later beats carry the
//! last sequence seen on the connection. A beat sent while the previous one
//! is still unacknowledged is logged, but no action is taken.

use std::sync::Arc;
use std::time::Duration;

use relay_ws::{CancelToken, Connection};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::Shared;
use crate::opcode::GatewayOpcode;
use crate::payload::{heartbeat_data, packet};

#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    interval: Duration,
    beats: u64,
    acked: bool,
}

impl HeartbeatSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            beats: 0,
            acked: true,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Record a HeartbeatAck from the server.
    pub fn ack(&mut self) {
        self.acked = true;
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    /// `d` for the next scheduled beat.
    pub fn tick(&mut self, last_sequence: Option<u64>) -> Value {
        if !self.acked {
            warn!(beats = self.beats, "previous heartbeat was not acknowledged");
        }
        let data = if self.beats == 0 {
            Value::Null
        } else {
            heartbeat_data(last_sequence)
        };
        self.beats += 1;
        self.acked = false;
        data
    }
}

/// Body of the heartbeat task. Exits on cancellation, once the connection
/// is no longer open, or when a beat cannot be written. The schedule is
/// cleared on every exit.
pub(crate) fn run(conn: Connection, shared: Arc<Shared>, interval: Duration, token: CancelToken) {
    loop {
        if token.wait(interval) {
            break;
        }
        if !conn.is_open() {
            debug!(state = ?conn.state(), "connection left open, heartbeat stopping");
            break;
        }
        let sequence = shared.last_sequence();
        let data = match shared.heartbeat.lock().as_mut() {
            Some(schedule) => schedule.tick(sequence),
            None => break,
        };
        debug!(d = %data, "sending heartbeat");
        if let Err(e) = conn.write(&packet(GatewayOpcode::Heartbeat, data)) {
            warn!(error = %e, "heartbeat not sent");
            break;
        }
    }
    shared.heartbeat_exited();
    debug!("heartbeat task exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_beat_is_null_even_with_a_sequence() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_millis(10));
        assert_eq!(schedule.tick(Some(7)), Value::Null);
        assert_eq!(schedule.tick(Some(42)), Value::from(42));
        assert_eq!(schedule.beats(), 2);
    }

    #[test]
    fn test_later_beats_without_sequence_are_null() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_millis(10));
        schedule.tick(None);
        assert_eq!(schedule.tick(None), Value::Null);
    }

    #[test]
    fn test_ack_state_resets_each_beat() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(41));
        assert!(schedule.is_acked());
        schedule.tick(None);
        assert!(!schedule.is_acked());
        schedule.ack();
        assert!(schedule.is_acked());
        assert_eq!(schedule.interval(), Duration::from_secs(41));
    }
}
