//! Round-trip latency from a burst of pings echoed back as pongs.

use std::collections::HashMap;

use crate::error::LinkError;
use crate::protocol::Probe;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub samples: usize,
}

impl LatencyStats {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        Some(Self {
            min,
            max,
            mean,
            samples: samples.len(),
        })
    }

    /// Half the mean round trip, used to back-date received timestamps.
    pub fn one_way(&self) -> f64 {
        self.mean / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PongOutcome {
    Rejected(&'static str),
    Recorded { rtt: f64, received: usize },
    Completed(LatencyStats),
}

/// Single-flight measurement state. Times are milliseconds on the caller's
/// clock; the peer echoes the sent timestamp unchanged.
#[derive(Debug)]
pub struct LatencyEstimator {
    burst: u32,
    sent: u32,
    pending: HashMap<u32, f64>,
    samples: Vec<f64>,
    in_progress: bool,
    run: u64,
}

impl LatencyEstimator {
    pub fn new(burst: u32) -> Self {
        Self {
            burst: burst.max(1),
            sent: 0,
            pending: HashMap::new(),
            samples: Vec::new(),
            in_progress: false,
            run: 0,
        }
    }

    /// Starts a run and returns its number. A run already in flight is left
    /// untouched.
    pub fn begin(&mut self) -> Result<u64, LinkError> {
        if self.in_progress {
            return Err(LinkError::PingInProgress);
        }
        self.pending.clear();
        self.samples.clear();
        self.sent = 0;
        self.in_progress = true;
        self.run += 1;
        Ok(self.run)
    }

    /// Next ping of the burst, recorded as sent at `now`. `None` once the
    /// whole burst is out or no run is active.
    pub fn next_ping(&mut self, now: f64) -> Option<Probe> {
        if !self.in_progress || self.sent >= self.burst {
            return None;
        }
        self.sent += 1;
        self.pending.insert(self.sent, now);
        Some(Probe {
            timestamp: Some(now),
            ping_id: Some(self.sent),
        })
    }

    pub fn has_more_pings(&self) -> bool {
        self.in_progress && self.sent < self.burst
    }

    pub fn record_pong(&mut self, probe: &Probe, now: f64) -> PongOutcome {
        if !self.in_progress {
            return PongOutcome::Rejected("no measurement in progress");
        }
        let Some(ping_id) = probe.ping_id else {
            return PongOutcome::Rejected("missing pingId");
        };
        let Some(sent_at) = probe.timestamp.filter(|ts| ts.is_finite()) else {
            return PongOutcome::Rejected("missing or non-numeric timestamp");
        };
        if self.pending.remove(&ping_id).is_none() {
            return PongOutcome::Rejected("unknown or duplicate pingId");
        }

        let rtt = (now - sent_at).max(0.0);
        self.samples.push(rtt);
        if self.samples.len() as u32 >= self.burst {
            self.in_progress = false;
            self.pending.clear();
            match LatencyStats::from_samples(&self.samples) {
                Some(stats) => PongOutcome::Completed(stats),
                None => PongOutcome::Rejected("no samples"),
            }
        } else {
            PongOutcome::Recorded {
                rtt,
                received: self.samples.len(),
            }
        }
    }

    /// Ends run `run` if it is still active. The inner option carries partial
    /// statistics when at least one pong made it back.
    pub fn expire(&mut self, run: u64) -> Option<Option<LatencyStats>> {
        if !self.in_progress || self.run != run {
            return None;
        }
        self.in_progress = false;
        self.pending.clear();
        Some(LatencyStats::from_samples(&self.samples))
    }

    pub fn reset(&mut self) {
        self.in_progress = false;
        self.pending.clear();
        self.samples.clear();
        self.sent = 0;
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn current_run(&self) -> u64 {
        self.run
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn received(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_burst(estimator: &mut LatencyEstimator, times: &[f64]) -> Vec<Probe> {
        times
            .iter()
            .map(|now| estimator.next_ping(*now).expect("ping"))
            .collect()
    }

    #[test_timeout::timeout]
    fn fixed_round_trip_gives_half_one_way() {
        let mut estimator = LatencyEstimator::new(5);
        estimator.begin().unwrap();
        let probes = send_burst(&mut estimator, &[0.0, 100.0, 200.0, 300.0, 400.0]);
        assert!(estimator.next_ping(500.0).is_none());

        let mut outcome = None;
        for probe in &probes {
            outcome = Some(estimator.record_pong(probe, probe.timestamp.unwrap() + 50.0));
        }
        let Some(PongOutcome::Completed(stats)) = outcome else {
            panic!("run did not complete: {outcome:?}");
        };
        assert_eq!(stats.mean, 50.0);
        assert_eq!(stats.one_way(), 25.0);
        assert_eq!(stats.samples, 5);
        assert!(!estimator.is_in_progress());
    }

    #[test_timeout::timeout]
    fn second_run_rejected_without_resetting_records() {
        let mut estimator = LatencyEstimator::new(5);
        estimator.begin().unwrap();
        send_burst(&mut estimator, &[0.0, 100.0, 200.0]);

        assert!(matches!(estimator.begin(), Err(LinkError::PingInProgress)));
        assert_eq!(estimator.pending(), 3);
        assert!(estimator.is_in_progress());
    }

    #[test_timeout::timeout]
    fn malformed_pongs_leave_state_alone() {
        let mut estimator = LatencyEstimator::new(5);
        estimator.begin().unwrap();
        let probes = send_burst(&mut estimator, &[0.0, 100.0]);

        let missing_id = Probe {
            timestamp: Some(0.0),
            ping_id: None,
        };
        assert_eq!(
            estimator.record_pong(&missing_id, 40.0),
            PongOutcome::Rejected("missing pingId")
        );
        let bad_timestamp = Probe {
            timestamp: None,
            ping_id: Some(1),
        };
        assert!(matches!(
            estimator.record_pong(&bad_timestamp, 40.0),
            PongOutcome::Rejected(_)
        ));
        assert_eq!(estimator.received(), 0);
        assert_eq!(estimator.pending(), 2);

        assert_eq!(
            estimator.record_pong(&probes[0], 30.0),
            PongOutcome::Recorded {
                rtt: 30.0,
                received: 1
            }
        );
        assert!(matches!(
            estimator.record_pong(&probes[0], 31.0),
            PongOutcome::Rejected(_)
        ));
    }

    #[test_timeout::timeout]
    fn expiry_reports_partial_run_once() {
        let mut estimator = LatencyEstimator::new(5);
        let run = estimator.begin().unwrap();
        let probes = send_burst(&mut estimator, &[0.0, 100.0]);
        estimator.record_pong(&probes[1], 180.0);

        let partial = estimator.expire(run).expect("run was active");
        assert_eq!(partial.map(|stats| stats.mean), Some(80.0));
        assert_eq!(estimator.expire(run), None);
        assert!(estimator.begin().is_ok());
    }

    #[test_timeout::timeout]
    fn stale_expiry_ignored_after_new_run() {
        let mut estimator = LatencyEstimator::new(1);
        let first = estimator.begin().unwrap();
        let probe = estimator.next_ping(0.0).unwrap();
        assert!(matches!(
            estimator.record_pong(&probe, 10.0),
            PongOutcome::Completed(_)
        ));
        estimator.begin().unwrap();
        assert_eq!(estimator.expire(first), None);
        assert!(estimator.is_in_progress());
    }
}
