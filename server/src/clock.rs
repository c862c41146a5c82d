//! Per-connection clock synchronization.
//!
//! The server probes each client on a sliding window of round trips and
//! clock readings, filters outliers, and keeps a running latency and clock
//! offset estimate that session relays consult when stamping actions.

use crate::utils::sync_time;
use std::time::{Duration, Instant};

/// Samples kept in the sliding window.
pub const PROBE_WINDOW: usize = 12;
/// Delay between periodic probes once the window has filled.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(1000);
/// Round trips above this are discarded instead of sampled.
pub const MAX_ROUND_TRIP: i64 = 5000;

/// What the caller must do after feeding a probe reply into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDirective {
    /// Send the next probe immediately, echoing `echo`.
    Probe { echo: i64 },
    /// Estimates were recomputed: push them to the client and fire a
    /// `seq`-tagged timer after [`PROBE_INTERVAL`].
    Report { ping: i64, offset: i64, seq: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
struct ClockSample {
    remote: i64,
    local: i64,
}

#[derive(Debug)]
struct PendingProbe {
    seq: u64,
    echo: i64,
    since: Instant,
}

#[derive(Debug)]
pub struct ClockSync {
    round_trips: [i64; PROBE_WINDOW],
    samples: [ClockSample; PROBE_WINDOW],
    cursor: usize,
    sliding: bool,
    ping: i64,
    offset: i64,
    pending: Option<PendingProbe>,
    probe_seq: u64,
}

impl ClockSync {
    pub fn new() -> Self {
        ClockSync {
            round_trips: [0; PROBE_WINDOW],
            samples: [ClockSample::default(); PROBE_WINDOW],
            cursor: 0,
            sliding: false,
            ping: 0,
            offset: 0,
            pending: None,
            probe_seq: 0,
        }
    }

    /// Feeds one probe reply into the window. `remote_time` is the client's
    /// normalized clock reading, `round_trip` the latency it measured and
    /// `local_time` the server's own normalized reading at receipt.
    pub fn on_probe_reply(
        &mut self,
        remote_time: i64,
        round_trip: i64,
        local_time: i64,
    ) -> ProbeDirective {
        // Extreme round trips are noise; ask again without consuming a slot.
        if round_trip > MAX_ROUND_TRIP {
            return ProbeDirective::Probe { echo: remote_time };
        }

        self.round_trips[self.cursor] = round_trip;
        self.samples[self.cursor] = ClockSample {
            remote: remote_time,
            local: local_time,
        };

        let directive = if !self.sliding && self.cursor < PROBE_WINDOW - 1 {
            // Still filling the window for the first time.
            ProbeDirective::Probe { echo: remote_time }
        } else {
            let ping = round_half_up(filtered_mean(&self.round_trips) as f64 * 0.5);
            let deltas: Vec<i64> = self
                .samples
                .iter()
                .map(|sample| (sample.remote + ping) - sample.local)
                .collect();
            let offset = filtered_mean(&deltas);

            self.ping = ping;
            self.offset = offset;
            self.sliding = true;

            self.probe_seq += 1;
            self.pending = Some(PendingProbe {
                seq: self.probe_seq,
                echo: remote_time,
                since: Instant::now(),
            });

            ProbeDirective::Report {
                ping,
                offset,
                seq: self.probe_seq,
            }
        };

        self.cursor = (self.cursor + 1) % PROBE_WINDOW;
        directive
    }

    /// Resolves a fired probe timer. Returns the echo value for the next
    /// probe, advanced by the time the timer actually waited, or `None` when
    /// the timer no longer matches the pending probe.
    pub fn on_probe_timer(&mut self, seq: u64) -> Option<i64> {
        match self.pending.take() {
            Some(pending) if pending.seq == seq => {
                let elapsed = pending.since.elapsed().as_millis() as i64;
                Some(pending.echo + sync_time(elapsed))
            }
            other => {
                self.pending = other;
                None
            }
        }
    }

    pub fn ping(&self) -> i64 {
        self.ping
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// True once the window has filled at least once.
    pub fn is_synced(&self) -> bool {
        self.sliding
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        ClockSync::new()
    }
}

/// Mean with crude outlier rejection: values further than twice the
/// magnitude of the plain mean from it are dropped. Returns 0 when nothing
/// survives the filter.
pub fn filtered_mean(values: &[i64]) -> i64 {
    if values.is_empty() {
        return 0;
    }

    let total: i64 = values.iter().sum();
    let center = (total.abs() as f64) / values.len() as f64;

    let survivors: Vec<i64> = values
        .iter()
        .copied()
        .filter(|&value| (value as f64 - center).abs() <= center * 2.0)
        .collect();

    if survivors.is_empty() {
        return 0;
    }

    let sum: i64 = survivors.iter().sum();
    round_half_up(sum as f64 / survivors.len() as f64)
}

// Ties round toward positive infinity.
fn round_half_up(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}
