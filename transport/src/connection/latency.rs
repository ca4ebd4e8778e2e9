use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use crate::sequence_number::SequenceNumber;

/// weight of a new sample in the exponentially weighted moving average
const SMOOTHING_FACTOR: f64 = 0.3;

/// Round-trip time estimate, updated from ping / pong exchanges. This is read on every resend
///  decision, so it is kept in an atomic rather than behind the connection's lock.
#[derive(Default)]
pub struct LatencyEstimate {
    /// in microseconds, 0 if there is no measurement yet
    average_micros: AtomicU64,
    last_micros: AtomicU64,
}

impl LatencyEstimate {
    pub fn record_sample(&self, rtt: Duration) {
        let sample = (rtt.as_micros() as u64).max(1);
        self.last_micros.store(sample, Ordering::Release);

        let previous = self.average_micros.load(Ordering::Acquire);
        let average = if previous == 0 {
            sample
        }
        else {
            ((1.0 - SMOOTHING_FACTOR) * previous as f64 + SMOOTHING_FACTOR * sample as f64).round() as u64
        };
        trace!("latency sample {:?}, average {:?}", rtt, Duration::from_micros(average));
        self.average_micros.store(average.max(1), Ordering::Release);
    }

    pub fn average(&self) -> Option<Duration> {
        match self.average_micros.load(Ordering::Acquire) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub fn last(&self) -> Option<Duration> {
        match self.last_micros.load(Ordering::Acquire) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }
}

/// Keep-alive state: there is at most one outstanding ping, and a pong for anything else is
///  ignored
pub struct PingState {
    next_ping_id: SequenceNumber,
    outstanding: Option<(SequenceNumber, Instant)>,
    last_sent: Option<Instant>,
}

impl PingState {
    pub fn new() -> PingState {
        PingState {
            next_ping_id: SequenceNumber::ZERO,
            outstanding: None,
            last_sent: None,
        }
    }

    /// Returns the id for a new ping if one is due
    pub fn ping_due(&mut self, now: Instant, interval: Duration) -> Option<SequenceNumber> {
        if let Some(last_sent) = self.last_sent {
            if now.duration_since(last_sent) < interval {
                return None;
            }
        }

        let id = self.next_ping_id;
        self.next_ping_id = id.next();
        self.outstanding = Some((id, now));
        self.last_sent = Some(now);
        Some(id)
    }

    /// Returns the round-trip time if the pong matches the outstanding ping
    pub fn on_pong(&mut self, id: SequenceNumber, now: Instant) -> Option<Duration> {
        match self.outstanding {
            Some((outstanding_id, sent_at)) if outstanding_id == id => {
                self.outstanding = None;
                Some(now.duration_since(sent_at))
            }
            _ => None,
        }
    }
}
