//! High-resolution timestamps for the timing kernel
//!
//! A [`Clock`] hands out raw tick counts and converts the difference between
//! two reads into seconds. The difference is signed: a counter that steps
//! backwards between reads yields a negative duration, which the engine treats
//! as an invalid sample instead of hiding it.
//!
//! - x86_64: `lfence; rdtsc`
//! - aarch64: `isb; mrs cntvct_el0`
//! - elsewhere: [`MonotonicTimer`]

use std::time::{Duration, Instant};

/// Source of timestamps used by the measurement engine
pub trait Clock: Send + Sync {
    /// Determine the tick rate. Called once per run before any read.
    fn calibrate(&mut self);

    /// Current tick count
    fn read(&self) -> u64;

    /// Seconds elapsed from `start` to `end`, negative if `end` precedes `start`
    fn seconds(&self, start: u64, end: u64) -> f64;

    /// Short name for reports
    fn name(&self) -> &'static str;
}

/// Read the CPU cycle counter with serialization.
#[inline]
pub fn read_cycle_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        rdtsc_x86_64()
    }

    #[cfg(target_arch = "aarch64")]
    {
        cntvct_aarch64()
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        monotonic_nanos()
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn rdtsc_x86_64() -> u64 {
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);

    let cycles: u64;
    unsafe {
        std::arch::asm!(
            "lfence",
            "rdtsc",
            "shl rdx, 32",
            "or rax, rdx",
            out("rax") cycles,
            out("rdx") _,
            options(nostack, nomem),
        );
    }

    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    cycles
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn cntvct_aarch64() -> u64 {
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);

    let ticks: u64;
    unsafe {
        std::arch::asm!(
            "isb",
            "mrs {}, cntvct_el0",
            out(reg) ticks,
            options(nostack, nomem),
        );
    }

    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    ticks
}

/// Nanoseconds since the first call in this process
#[inline]
fn monotonic_nanos() -> u64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();

    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

#[inline]
fn signed_delta(start: u64, end: u64) -> f64 {
    (i128::from(end) - i128::from(start)) as f64
}

/// Calibrated CPU cycle counter
#[derive(Debug, Clone)]
pub struct CycleTimer {
    ticks_per_ns: f64,
    window: Duration,
    rounds: usize,
}

impl Default for CycleTimer {
    fn default() -> Self {
        Self {
            ticks_per_ns: 0.0,
            window: Duration::from_millis(2),
            rounds: 5,
        }
    }
}

impl CycleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks per nanosecond found by the last calibration, 0 before calibration
    pub fn ticks_per_ns(&self) -> f64 {
        self.ticks_per_ns
    }

    /// Median ratio of counter ticks to wall-clock nanoseconds over short busy windows
    fn measure_ticks_per_ns(&self) -> f64 {
        let mut ratios = Vec::with_capacity(self.rounds);

        for _ in 0..self.rounds {
            let start_ticks = read_cycle_counter();
            let start_time = Instant::now();
            while start_time.elapsed() < self.window {
                std::hint::spin_loop();
            }
            let end_ticks = read_cycle_counter();
            let elapsed_nanos = start_time.elapsed().as_nanos() as u64;

            if elapsed_nanos == 0 {
                continue;
            }
            ratios.push(end_ticks.saturating_sub(start_ticks) as f64 / elapsed_nanos as f64);
        }

        if ratios.is_empty() {
            return 1.0;
        }

        ratios.sort_by(|a, b| a.total_cmp(b));
        let mid = ratios.len() / 2;
        if ratios.len() % 2 == 0 {
            (ratios[mid - 1] + ratios[mid]) / 2.0
        } else {
            ratios[mid]
        }
    }
}

impl Clock for CycleTimer {
    fn calibrate(&mut self) {
        let measured = self.measure_ticks_per_ns();
        self.ticks_per_ns = if measured.is_finite() && measured > 0.0 { measured } else { 1.0 };
    }

    #[inline]
    fn read(&self) -> u64 {
        read_cycle_counter()
    }

    fn seconds(&self, start: u64, end: u64) -> f64 {
        let ticks_per_ns = if self.ticks_per_ns > 0.0 { self.ticks_per_ns } else { 1.0 };
        signed_delta(start, end) / ticks_per_ns / 1e9
    }

    fn name(&self) -> &'static str {
        "cycle"
    }
}

/// Clock backed by `std::time::Instant`, ticks are nanoseconds
#[derive(Debug, Clone, Default)]
pub struct MonotonicTimer;

impl Clock for MonotonicTimer {
    fn calibrate(&mut self) {}

    #[inline]
    fn read(&self) -> u64 {
        monotonic_nanos()
    }

    fn seconds(&self, start: u64, end: u64) -> f64 {
        signed_delta(start, end) / 1e9
    }

    fn name(&self) -> &'static str {
        "monotonic"
    }
}

/// Deterministic clock that advances by a fixed step on every read
#[derive(Debug, Default)]
pub struct StepClock {
    next: std::sync::atomic::AtomicU64,
    step_ns: u64,
}

impl StepClock {
    pub fn new(step_ns: u64) -> Self {
        Self {
            next: std::sync::atomic::AtomicU64::new(0),
            step_ns,
        }
    }
}

impl Clock for StepClock {
    fn calibrate(&mut self) {}

    fn read(&self) -> u64 {
        self.next.fetch_add(self.step_ns, std::sync::atomic::Ordering::Relaxed)
    }

    fn seconds(&self, start: u64, end: u64) -> f64 {
        signed_delta(start, end) / 1e9
    }

    fn name(&self) -> &'static str {
        "step"
    }
}

/// Best clock for this platform
pub fn default_clock() -> Box<dyn Clock> {
    if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
        Box::new(CycleTimer::new())
    } else {
        Box::new(MonotonicTimer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_seconds() {
        let clock = MonotonicTimer;
        assert_eq!(clock.seconds(1_000, 3_000), 2e-6);
        assert!(clock.seconds(3_000, 1_000) < 0.0);

        let a = clock.read();
        let b = clock.read();
        assert!(clock.seconds(a, b) >= 0.0);
    }

    #[test]
    fn test_cycle_timer_calibrates() {
        let mut timer = CycleTimer::new();
        timer.calibrate();
        assert!(timer.ticks_per_ns() > 0.0);

        let start = timer.read();
        let wall = Instant::now();
        while wall.elapsed() < Duration::from_millis(5) {
            std::hint::spin_loop();
        }
        let end = timer.read();
        let measured = timer.seconds(start, end);
        assert!(measured > 0.001, "measured {} s for a 5 ms spin", measured);
        assert!(measured < 1.0, "measured {} s for a 5 ms spin", measured);
    }

    #[test]
    fn test_step_clock() {
        let clock = StepClock::new(250);
        let t1 = clock.read();
        let t2 = clock.read();
        let t3 = clock.read();
        assert_eq!(clock.seconds(t1, t2), 250e-9);
        assert_eq!(clock.seconds(t2, t3), 250e-9);
    }

    #[test]
    fn test_default_clock_name() {
        let clock = default_clock();
        assert!(["cycle", "monotonic"].contains(&clock.name()));
    }
}
