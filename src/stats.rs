//! Per-receiver throughput and CPU accounting.
//!
//! Each engine owns one [`RxStats`] and calls it from the loop: the
//! `start_wait`/`done_wait` pair brackets the single blocking kernel entry
//! per iteration, and `done_loop` hands over the cumulative byte and
//! request counters. Roughly once a second a summary line is emitted and
//! the interval counters reset.

use std::time::{Duration, Instant};

use tracing::info;

/// Wait intervals shorter than this are treated as not-idle; the clock
/// sources are too noisy below it to mean anything.
const IDLE_EPSILON: Duration = Duration::from_micros(100);

/// Reads-per-loop percentile summary, computed per flushed interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadStats {
    pub p10: u32,
    pub p50: u32,
    pub p90: u32,
    pub avg: f64,
}

/// Compute p10/p50/p90/avg over an interval's reads-per-loop samples.
/// Sorts in place. Returns `None` for an empty interval.
pub fn read_stats(samples: &mut [u32]) -> Option<ReadStats> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let total: u64 = samples.iter().map(|&r| r as u64).sum();
    Some(ReadStats {
        p10: samples[samples.len() / 10],
        p50: samples[samples.len() / 2],
        p90: samples[(samples.len() as f64 * 0.9) as usize],
        avg: total as f64 / samples.len() as f64,
    })
}

/// Per-loop statistics recorder for one receiver.
pub struct RxStats {
    name: String,
    count_reads: bool,
    reads: Vec<u32>,

    last_stats: Instant,
    wait_started: Instant,
    idle: Duration,

    ticks_per_second: u64,
    last_times: libc::tms,
    last_clock: libc::clock_t,

    loops: u64,
    overflows: u64,
    last_bytes: u64,
    last_requests: u64,
    last_rps: f64,
}

impl RxStats {
    pub fn new(name: impl Into<String>, count_reads: bool) -> Self {
        let now = Instant::now();
        let mut times: libc::tms = unsafe { std::mem::zeroed() };
        let clock = unsafe { libc::times(&mut times) };
        Self {
            name: name.into(),
            count_reads,
            reads: if count_reads { Vec::with_capacity(32_000) } else { Vec::new() },
            last_stats: now,
            wait_started: now,
            idle: Duration::ZERO,
            ticks_per_second: unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as u64,
            last_times: times,
            last_clock: clock,
            loops: 0,
            overflows: 0,
            last_bytes: 0,
            last_requests: 0,
            last_rps: 0.0,
        }
    }

    /// Mark the start of the loop's blocking wait.
    pub fn start_wait(&mut self) {
        self.wait_started = Instant::now();
    }

    /// Mark the end of the blocking wait; intervals over the epsilon count
    /// as idle time.
    pub fn done_wait(&mut self) {
        let waited = self.wait_started.elapsed();
        if waited > IDLE_EPSILON {
            self.idle += waited;
        }
    }

    /// Record one loop iteration with the cumulative engine counters, and
    /// flush a summary line if a second has elapsed.
    pub fn done_loop(&mut self, bytes: u64, requests: u64, reads: u32, is_overflow: bool) {
        self.loops += 1;
        if is_overflow {
            self.overflows += 1;
        }
        if self.count_reads {
            self.reads.push(reads);
        }

        let elapsed = self.last_stats.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.flush(bytes, requests, elapsed);
        }
    }

    fn flush(&mut self, bytes: u64, requests: u64, elapsed: Duration) {
        let millis = elapsed.as_millis() as u64;
        let bps = (bytes - self.last_bytes) as f64 * 1000.0 / millis as f64;
        let rps = (requests - self.last_requests) as f64 * 1000.0 / millis as f64;

        let mut times_now: libc::tms = unsafe { std::mem::zeroed() };
        let clock_now = unsafe { libc::times(&mut times_now) };

        // Skip the first interval and idle intervals; a line with no
        // traffic (or no previous rate to compare against) is just noise.
        if requests > self.last_requests && self.last_rps > 0.0 {
            let suffix = if self.count_reads {
                match read_stats(&mut self.reads) {
                    Some(r) => format!(
                        " read_per_loop: p10={} p50={} p90={} avg={:.2}",
                        r.p10, r.p50, r.p90, r.avg
                    ),
                    None => String::new(),
                }
            } else {
                String::new()
            };

            info!(
                "{}: rps:{:6.2}k Bps:{:6.2}M idle={}ms user={}ms system={}ms wall={}ms \
                 loops={} overflows={}{}",
                self.name,
                rps / 1000.0,
                bps / 1_000_000.0,
                self.idle.as_millis(),
                self.cpu_ms(self.last_times.tms_utime, times_now.tms_utime),
                self.cpu_ms(self.last_times.tms_stime, times_now.tms_stime),
                self.cpu_ms(self.last_clock, clock_now),
                self.loops,
                self.overflows,
                suffix,
            );
        }

        self.reads.clear();
        self.loops = 0;
        self.overflows = 0;
        self.idle = Duration::ZERO;
        self.last_clock = clock_now;
        self.last_times = times_now;
        self.last_bytes = bytes;
        self.last_requests = requests;
        self.last_stats = Instant::now();
        self.last_rps = rps;
    }

    fn cpu_ms(&self, from: libc::clock_t, to: libc::clock_t) -> u64 {
        if to <= from || self.ticks_per_second == 0 {
            0
        } else {
            (to - from) as u64 * 1000 / self.ticks_per_second
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_stats_percentiles() {
        let mut samples: Vec<u32> = (1..=100).collect();
        let r = read_stats(&mut samples).unwrap();
        assert_eq!(r.p10, 11);
        assert_eq!(r.p50, 51);
        assert_eq!(r.p90, 91);
        assert!((r.avg - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_read_stats_empty() {
        assert_eq!(read_stats(&mut []), None);
    }

    #[test]
    fn test_read_stats_single_sample() {
        let mut samples = vec![7u32];
        let r = read_stats(&mut samples).unwrap();
        assert_eq!((r.p10, r.p50, r.p90), (7, 7, 7));
        assert_eq!(r.avg, 7.0);
    }

    #[test]
    fn test_done_loop_accumulates_without_flush() {
        let mut stats = RxStats::new("test", true);
        for i in 0..10 {
            stats.done_loop(i * 100, i, 2, i % 3 == 0);
        }
        assert_eq!(stats.loops, 10);
        assert_eq!(stats.overflows, 4);
        assert_eq!(stats.reads.len(), 10);
    }

    #[test]
    fn test_idle_epsilon_filters_short_waits() {
        let mut stats = RxStats::new("test", false);
        stats.start_wait();
        stats.done_wait(); // immediate: below epsilon
        assert_eq!(stats.idle, Duration::ZERO);

        stats.start_wait();
        std::thread::sleep(Duration::from_millis(2));
        stats.done_wait();
        assert!(stats.idle >= Duration::from_millis(1));
    }
}
