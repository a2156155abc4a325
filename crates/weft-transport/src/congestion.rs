//! # Congestion Control
//!
//! Two mechanisms gate outbound traffic:
//!
//! - a per-peer AIMD congestion window over unacknowledged reliable bytes:
//!   one additive increment per window's-worth of acknowledged data, halved
//!   on any retransmission event (at most once per RTT);
//! - a host-level leaky-bucket [`Throttle`] enforcing the configured
//!   byte-rate ceilings across all peers combined. Sends that would exceed
//!   the budget defer to the next service tick; they are never dropped.

use quanta::Instant;
use std::time::Duration;

use crate::config::{Bandwidth, ConnectionConfig};
use crate::MAX_MTU;

// ─── AIMD Window ────────────────────────────────────────────────────────────

/// Additive-increase/multiplicative-decrease congestion window for one peer.
#[derive(Debug)]
pub struct AimdController {
    window: u32,
    in_flight: u32,
    acked_since_growth: u32,
    min: u32,
    max: u32,
    increment: u32,
    /// Last multiplicative decrease; a loss burst only cuts once per RTT.
    last_cut: Option<Instant>,
}

impl AimdController {
    pub fn new(config: &ConnectionConfig) -> Self {
        AimdController {
            window: config.window_initial.clamp(config.window_min, config.window_max),
            in_flight: 0,
            acked_since_growth: 0,
            min: config.window_min,
            max: config.window_max,
            increment: config.window_increment,
            last_cut: None,
        }
    }

    /// Whether `bytes` more reliable payload fits in the window right now.
    pub fn can_send(&self, bytes: usize) -> bool {
        // Always admit at least one command when nothing is outstanding,
        // otherwise a window smaller than one payload deadlocks.
        self.in_flight == 0 || self.in_flight.saturating_add(bytes as u32) <= self.window
    }

    /// Account a reliable first transmission.
    pub fn on_transmit(&mut self, bytes: usize) {
        self.in_flight = self.in_flight.saturating_add(bytes as u32);
    }

    /// Account an acknowledgment. Grows the window by one increment per
    /// window's-worth of acknowledged bytes.
    pub fn on_ack(&mut self, bytes: usize) {
        self.in_flight = self.in_flight.saturating_sub(bytes as u32);
        self.acked_since_growth = self.acked_since_growth.saturating_add(bytes as u32);
        if self.acked_since_growth >= self.window {
            self.acked_since_growth = 0;
            self.window = (self.window + self.increment).min(self.max);
        }
    }

    /// Account a retransmission event. Halves the window unless a cut
    /// already happened within the last `rtt`.
    pub fn on_loss(&mut self, now: Instant, rtt: Duration) {
        if let Some(last) = self.last_cut {
            if now.duration_since(last) < rtt {
                return;
            }
        }
        self.last_cut = Some(now);
        self.acked_since_growth = 0;
        self.window = (self.window / 2).max(self.min);
    }

    /// Discard in-flight accounting (peer reset).
    pub fn clear_in_flight(&mut self) {
        self.in_flight = 0;
        self.acked_since_growth = 0;
    }

    /// Current window in bytes.
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Unacknowledged reliable bytes outstanding.
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }
}

// ─── Host Throttle ──────────────────────────────────────────────────────────

/// Leaky-bucket rate limiter for one traffic direction of a host.
#[derive(Debug)]
pub struct Throttle {
    rate: Bandwidth,
    /// Bytes currently spendable.
    allowance: f64,
    /// Bucket depth: a quarter second of budget, never below two max MTUs.
    burst: f64,
    last_refill: Instant,
}

impl Throttle {
    pub fn new(rate: Bandwidth, now: Instant) -> Self {
        let burst = match rate {
            Bandwidth::Unlimited => 0.0,
            Bandwidth::BytesPerSec(r) => (r as f64 / 4.0).max((2 * MAX_MTU) as f64),
        };
        Throttle {
            rate,
            allowance: burst,
            burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let Bandwidth::BytesPerSec(rate) = self.rate else {
            return;
        };
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.allowance = (self.allowance + elapsed * rate as f64).min(self.burst);
    }

    /// Whether `bytes` would fit the current budget, without spending it.
    /// Callers peek with a worst-case size, build the datagram, then spend
    /// the actual size.
    pub fn check(&mut self, bytes: usize, now: Instant) -> bool {
        match self.rate {
            Bandwidth::Unlimited => true,
            Bandwidth::BytesPerSec(_) => {
                self.refill(now);
                self.allowance >= bytes as f64
            }
        }
    }

    /// Spend budget for `bytes` if available.
    pub fn try_take(&mut self, bytes: usize, now: Instant) -> bool {
        match self.rate {
            Bandwidth::Unlimited => true,
            Bandwidth::BytesPerSec(_) => {
                self.refill(now);
                if self.allowance >= bytes as f64 {
                    self.allowance -= bytes as f64;
                    true
                } else {
                    false
                }
            }
        }
    }
}
