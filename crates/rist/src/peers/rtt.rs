// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! RTT and loss-rate estimation per peer.
//!
//! RTT samples come from keepalive echo round-trips and feed the
//! classic EWMA (alpha = 1/8 for the mean, beta = 1/4 for jitter).
//! Loss rate is retransmit requests over packets received in a sliding
//! one-second window, used by the bonding cutoff.

/// Smoothed RTT estimator.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f32,
    jitter_ms: f32,
    min_ms: f32,
    max_ms: f32,
    samples: u64,
    /// Clamp window from peer config (rtt-min / rtt-max).
    floor_ms: f32,
    ceil_ms: f32,
}

impl RttEstimator {
    /// Smoothing factor for the mean (1/8, RFC 6298).
    const ALPHA: f32 = 0.125;
    /// Smoothing factor for jitter (1/4).
    const BETA: f32 = 0.25;

    pub fn new(floor_ms: u32, ceil_ms: u32) -> Self {
        Self {
            srtt_ms: floor_ms as f32,
            jitter_ms: 0.0,
            min_ms: f32::MAX,
            max_ms: 0.0,
            samples: 0,
            floor_ms: floor_ms as f32,
            ceil_ms: ceil_ms as f32,
        }
    }

    /// Fold in one round-trip sample (milliseconds).
    pub fn update(&mut self, sample_ms: f32) {
        let sample = sample_ms.clamp(0.0, self.ceil_ms);
        self.samples += 1;
        self.min_ms = self.min_ms.min(sample);
        self.max_ms = self.max_ms.max(sample);

        if self.samples == 1 {
            self.srtt_ms = sample;
            self.jitter_ms = sample / 2.0;
            return;
        }
        let diff = sample - self.srtt_ms;
        self.srtt_ms += Self::ALPHA * diff;
        self.jitter_ms += Self::BETA * (diff.abs() - self.jitter_ms);
    }

    /// Current estimate, floored at the configured rtt-min.
    pub fn rtt_ms(&self) -> f32 {
        self.srtt_ms.max(self.floor_ms)
    }

    pub fn rtt_ns(&self) -> u64 {
        (self.rtt_ms() * 1_000_000.0) as u64
    }

    pub fn jitter_ms(&self) -> f32 {
        self.jitter_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Sliding one-second loss window.
///
/// Two rotating buckets approximate the window without a sample log:
/// the rate always covers between one and two seconds of history.
#[derive(Debug, Clone)]
pub struct LossWindow {
    window_ns: u64,
    bucket_start: u64,
    cur_received: u32,
    cur_requests: u32,
    prev_received: u32,
    prev_requests: u32,
}

impl LossWindow {
    pub fn new() -> Self {
        Self {
            window_ns: 1_000_000_000,
            bucket_start: 0,
            cur_received: 0,
            cur_requests: 0,
            prev_received: 0,
            prev_requests: 0,
        }
    }

    fn rotate(&mut self, now: u64) {
        if now.saturating_sub(self.bucket_start) >= self.window_ns {
            // Drop the stale bucket entirely on a long quiet gap.
            if now.saturating_sub(self.bucket_start) >= 2 * self.window_ns {
                self.prev_received = 0;
                self.prev_requests = 0;
            } else {
                self.prev_received = self.cur_received;
                self.prev_requests = self.cur_requests;
            }
            self.cur_received = 0;
            self.cur_requests = 0;
            self.bucket_start = now;
        }
    }

    pub fn on_received(&mut self, now: u64) {
        self.rotate(now);
        self.cur_received += 1;
    }

    pub fn on_retransmit_request(&mut self, now: u64) {
        self.rotate(now);
        self.cur_requests += 1;
    }

    /// Loss estimate in [0, 1]; zero until traffic exists.
    pub fn rate(&self) -> f32 {
        let received = self.cur_received + self.prev_received;
        let requests = self.cur_requests + self.prev_requests;
        if received == 0 {
            return if requests > 0 { 1.0 } else { 0.0 };
        }
        (requests as f32 / (received + requests) as f32).min(1.0)
    }
}

impl Default for LossWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_initializes() {
        let mut rtt = RttEstimator::new(10, 500);
        rtt.update(40.0);
        assert_eq!(rtt.rtt_ms(), 40.0);
        assert_eq!(rtt.jitter_ms(), 20.0);
    }

    #[test]
    fn test_ewma_converges() {
        let mut rtt = RttEstimator::new(1, 500);
        for _ in 0..100 {
            rtt.update(80.0);
        }
        assert!((rtt.rtt_ms() - 80.0).abs() < 1.0);
        assert!(rtt.jitter_ms() < 1.0);
    }

    #[test]
    fn test_rtt_floor_applies() {
        let mut rtt = RttEstimator::new(50, 500);
        rtt.update(5.0);
        assert_eq!(rtt.rtt_ms(), 50.0, "rtt-min floor ignored");
    }

    #[test]
    fn test_sample_clamped_to_ceiling() {
        let mut rtt = RttEstimator::new(1, 200);
        rtt.update(10_000.0);
        assert!(rtt.rtt_ms() <= 200.0);
    }

    #[test]
    fn test_loss_window_clean() {
        let mut loss = LossWindow::new();
        for i in 0..100 {
            loss.on_received(i * 1_000_000);
        }
        assert_eq!(loss.rate(), 0.0);
    }

    #[test]
    fn test_loss_window_rate() {
        let mut loss = LossWindow::new();
        for i in 0..80 {
            loss.on_received(i);
        }
        for i in 0..20 {
            loss.on_retransmit_request(i);
        }
        assert!((loss.rate() - 0.2).abs() < 0.01);
    }

    #[test]
    fn test_loss_window_forgets_old_history() {
        let mut loss = LossWindow::new();
        for i in 0..50 {
            loss.on_retransmit_request(i);
        }
        assert!(loss.rate() > 0.9);
        // Three quiet seconds later a clean burst resets the view.
        for i in 0..50 {
            loss.on_received(3_000_000_000 + i);
        }
        assert_eq!(loss.rate(), 0.0);
    }
}
