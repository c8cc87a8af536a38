use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clock used to pace phases and device reads
pub trait Timer: Clone + Send + Sync + 'static {
    type Timestamp: Copy + Clone + Send + Sync;
    fn now(&self) -> Self::Timestamp;
    fn elapsed(&self, ts: Self::Timestamp) -> Duration;
    fn sleep(&self, d: Duration);
    fn record_read(&mut self, d: Duration);
    fn read_stats(&self) -> ReadStats;
}

/// Latency statistics over the most recent device reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadStats {
    pub reads: usize,
    pub average_read_ns: f64,
    pub jitter_ns: f64,
    pub min_read_ns: f64,
    pub max_read_ns: f64,
    pub effective_read_rate_hz: f64,
}

impl ReadStats {
    fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let times: Vec<f64> = samples.iter().map(|d| d.as_nanos() as f64).collect();
        let avg = times.iter().sum::<f64>() / times.len() as f64;
        let var = times.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / times.len() as f64;
        let min = times.iter().copied().fold(f64::INFINITY, f64::min);
        let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        ReadStats {
            reads: times.len(),
            average_read_ns: avg,
            jitter_ns: var.sqrt(),
            min_read_ns: min,
            max_read_ns: max,
            effective_read_rate_hz: if avg > 0.0 { 1e9 / avg } else { 0.0 },
        }
    }
}

#[derive(Debug, Clone)]
struct ReadWindow {
    samples: Vec<Duration>,
    max_samples: usize,
}

impl ReadWindow {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    fn push(&mut self, d: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(d);
    }
}

/// Monotonic wall clock with sub-millisecond sleeps
#[derive(Debug, Clone)]
pub struct HighPrecisionTimer {
    start: Instant,
    reads: ReadWindow,
}

impl Timer for HighPrecisionTimer {
    type Timestamp = u64;
    fn now(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
    fn elapsed(&self, ts: u64) -> Duration {
        Duration::from_nanos(self.now().saturating_sub(ts))
    }
    fn sleep(&self, d: Duration) {
        self.high_precision_sleep(d)
    }
    fn record_read(&mut self, d: Duration) {
        self.reads.push(d);
    }
    fn read_stats(&self) -> ReadStats {
        ReadStats::from_samples(&self.reads.samples)
    }
}

impl HighPrecisionTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            reads: ReadWindow::new(1000),
        }
    }

    pub fn high_precision_sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        #[cfg(target_os = "linux")]
        self.linux_sleep(duration);
        #[cfg(not(target_os = "linux"))]
        std::thread::sleep(duration);
    }

    #[cfg(target_os = "linux")]
    fn linux_sleep(&self, duration: Duration) {
        use libc::{clock_nanosleep, timespec, CLOCK_MONOTONIC, EINTR};

        let mut req = timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        };
        let mut rem = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // Resume with the remainder when a signal interrupts the sleep.
        loop {
            let rc = unsafe { clock_nanosleep(CLOCK_MONOTONIC, 0, &req, &mut rem) };
            if rc != EINTR {
                break;
            }
            req = rem;
        }
    }
}

impl Default for HighPrecisionTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulated clock. Time only moves when someone sleeps or calls
/// [`VirtualTimer::advance`]; clones share the same clock.
#[derive(Debug, Clone)]
pub struct VirtualTimer {
    clock_ns: Arc<AtomicU64>,
    reads: ReadWindow,
}

impl VirtualTimer {
    pub fn new() -> Self {
        Self {
            clock_ns: Arc::new(AtomicU64::new(0)),
            reads: ReadWindow::new(1000),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.clock_ns
            .fetch_add(d.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Default for VirtualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for VirtualTimer {
    type Timestamp = u64;
    fn now(&self) -> u64 {
        self.clock_ns.load(Ordering::Acquire)
    }
    fn elapsed(&self, ts: u64) -> Duration {
        Duration::from_nanos(self.now().saturating_sub(ts))
    }
    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
    fn record_read(&mut self, d: Duration) {
        self.reads.push(d);
    }
    fn read_stats(&self) -> ReadStats {
        ReadStats::from_samples(&self.reads.samples)
    }
}
