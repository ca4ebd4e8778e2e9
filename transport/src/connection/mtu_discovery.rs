//! Path MTU discovery by probing: the initiator periodically sends an `ExpandMtuRequest`
//!  datagram padded to a candidate size. If the peer receives it, it confirms with
//!  `ExpandMtuSuccess`, and both sides adopt the new size. A probe that goes unanswered counts as
//!  a failure, and later candidates bisect between the current MTU and the smallest failed size.
//!
//! Probe payload:
//! ```ascii
//! 0: candidate size (u16) - the total datagram length including header
//! 2: zero padding up to the candidate size
//! ```
//!
//! Confirmation payload:
//! ```ascii
//! 0: accepted size (u16)
//! 2: fix flag (u8) - 1 if the confirming side's limit constrained the accepted size
//! ```

use std::time::Duration;
use anyhow::bail;
use bytes::{Buf, BufMut};
use tokio::time::Instant;
use tracing::{debug, info};
use crate::config::UdpConfig;
use crate::datagram::HEADER_SIZE;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub struct MtuDiscovery {
    current: usize,
    limit: usize,
    fixed: bool,
    smallest_failed: Option<usize>,
    failed_attempts: u32,
    max_fail_attempts: u32,
    expand_interval: Duration,
    /// size and send time of the probe that awaits confirmation
    outstanding: Option<(usize, Instant)>,
    last_attempt: Option<Instant>,
}

impl MtuDiscovery {
    pub fn new(config: &UdpConfig) -> MtuDiscovery {
        MtuDiscovery {
            current: config.initial_mtu,
            limit: config.limit_mtu,
            fixed: !config.mtu_discovery || config.initial_mtu >= config.limit_mtu,
            smallest_failed: None,
            failed_attempts: 0,
            max_fail_attempts: config.mtu_expand_max_fail_attempts,
            expand_interval: config.mtu_expand_interval,
            outstanding: None,
            last_attempt: None,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    fn next_candidate(&self) -> usize {
        match self.smallest_failed {
            Some(failed) => (self.current + failed) / 2,
            None => self.limit.min(self.current * 5 / 4),
        }
    }

    /// Returns the size of the next probe if one is due. An outstanding probe that was not
    ///  confirmed within `probe_timeout` is registered as failed.
    pub fn poll(&mut self, now: Instant, probe_timeout: Duration) -> Option<usize> {
        if self.fixed {
            return None;
        }

        if let Some((size, sent_at)) = self.outstanding {
            if now.duration_since(sent_at) < probe_timeout {
                return None;
            }
            debug!("MTU probe with {} bytes timed out", size);
            self.on_probe_failed(size);
            if self.fixed {
                return None;
            }
        }

        if let Some(last_attempt) = self.last_attempt {
            if now.duration_since(last_attempt) < self.expand_interval {
                return None;
            }
        }

        let candidate = self.next_candidate();
        if candidate <= self.current {
            info!("MTU discovery finished at {} bytes", self.current);
            self.fixed = true;
            return None;
        }

        self.outstanding = Some((candidate, now));
        self.last_attempt = Some(now);
        Some(candidate)
    }

    pub fn on_probe_failed(&mut self, size: usize) {
        if matches!(self.outstanding, Some((outstanding, _)) if outstanding == size) {
            self.outstanding = None;
        }
        self.smallest_failed = Some(self.smallest_failed.map_or(size, |failed| failed.min(size)));
        self.failed_attempts += 1;

        if self.failed_attempts >= self.max_fail_attempts {
            info!("MTU discovery gave up after {} failed attempts, staying at {} bytes", self.failed_attempts, self.current);
            self.fixed = true;
        }
    }

    /// initiator side: the peer confirmed a probe
    pub fn on_success(&mut self, size: usize, fix: bool) {
        self.outstanding = None;
        if size > self.current {
            debug!("MTU expanded from {} to {} bytes", self.current, size);
            self.current = size.min(self.limit);
        }
        if fix || self.current >= self.limit {
            info!("MTU fixed at {} bytes", self.current);
            self.fixed = true;
        }
    }

    /// Receiver side of a probe with a given size. Returns the accepted size and whether this
    ///  side's limit constrained it.
    pub fn on_request(&mut self, proposed: usize) -> (usize, bool) {
        let accepted = proposed.min(self.limit);
        if accepted > self.current {
            debug!("MTU expanded from {} to {} bytes on request by peer", self.current, accepted);
            self.current = accepted;
        }
        (accepted, proposed > self.limit)
    }
}

pub fn probe_payload(size: usize) -> Vec<u8> {
    let mut result = vec![0u8; size - HEADER_SIZE];
    (&mut result[..2]).put_u16(size.prechecked_cast());
    result
}

/// Returns the declared size of a probe, failing if it does not match the probe's actual size
pub fn parse_probe(mut payload: &[u8], datagram_len: usize) -> anyhow::Result<usize> {
    let declared: usize = payload.try_get_u16()?.safe_cast();
    if declared != datagram_len {
        bail!("MTU probe declares {} bytes but has {}", declared, datagram_len);
    }
    Ok(declared)
}

pub fn success_payload(size: usize, fix: bool) -> Vec<u8> {
    let mut result = Vec::with_capacity(3);
    result.put_u16(size.prechecked_cast());
    result.put_u8(fix as u8);
    result
}

pub fn parse_success(mut payload: &[u8]) -> anyhow::Result<(usize, bool)> {
    let size: usize = payload.try_get_u16()?.safe_cast();
    let fix = payload.try_get_u8()? != 0;
    Ok((size, fix))
}
