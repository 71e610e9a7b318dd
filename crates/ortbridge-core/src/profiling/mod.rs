//! Profiling support: clock reconciliation and engine trace parsing.
//!
//! The engine stamps its profiling start on its own clock, while hosts
//! correlate events on the wall clock. [`compute_offset_with`] estimates the
//! difference between the two so engine timestamps can be shifted.

mod trace;

pub use trace::{Trace, TraceEvent, SESSION_OVERHEAD_EVENTS};

/// A nanosecond clock.
pub trait Clock {
    fn now_ns(&self) -> i64;
}

/// The monotonic clock the engine stamps its profiling start with.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[cfg(unix)]
    fn now_ns(&self) -> i64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return 0;
        }
        (ts.tv_sec as i64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as i64)
    }

    #[cfg(not(unix))]
    fn now_ns(&self) -> i64 {
        use std::sync::OnceLock;
        use std::time::Instant;

        static ANCHOR: OnceLock<Instant> = OnceLock::new();
        let anchor = ANCHOR.get_or_init(Instant::now);
        i64::try_from(anchor.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// The clock ONNX Runtime stamps its profiling start with
/// (`std::chrono::high_resolution_clock`).
///
/// libstdc++ aliases that clock to the system clock, so on Linux it counts
/// from the Unix epoch. Elsewhere it is the steady clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighResolutionClock;

impl Clock for HighResolutionClock {
    fn now_ns(&self) -> i64 {
        if cfg!(target_os = "linux") {
            WallClock.now_ns()
        } else {
            MonotonicClock.now_ns()
        }
    }
}

/// System wall clock, nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_ns(&self) -> i64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    }
}

/// Offset to add to a `monotonic` reading to land on the `wall` clock.
///
/// Samples mono, wall, wall, mono and averages the two differences, which
/// cancels first-order jitter from the reads themselves.
pub fn compute_offset_with(monotonic: &dyn Clock, wall: &dyn Clock) -> i64 {
    let t1 = monotonic.now_ns();
    let t2 = wall.now_ns();
    let t3 = wall.now_ns();
    let t4 = monotonic.now_ns();
    ((t2 - t1) + (t3 - t4)) / 2
}

/// Offset between the process monotonic clock and the wall clock.
pub fn compute_offset() -> i64 {
    compute_offset_with(&MonotonicClock, &WallClock)
}

/// Translate a start time read from `engine_clock` to wall-clock nanoseconds.
pub fn wall_clock_start_ns(engine_start_ns: i64, engine_clock: &dyn Clock) -> i64 {
    engine_start_ns + compute_offset_with(engine_clock, &WallClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Shared simulated time that advances a fixed step per read.
    struct Timeline {
        now: Cell<i64>,
        step: i64,
    }

    impl Timeline {
        fn new(step: i64) -> Self {
            Self {
                now: Cell::new(0),
                step,
            }
        }

        fn tick(&self) -> i64 {
            let t = self.now.get();
            self.now.set(t + self.step);
            t
        }
    }

    struct SkewedClock<'a> {
        timeline: &'a Timeline,
        base: i64,
        jitter: Vec<i64>,
        reads: Cell<usize>,
    }

    impl<'a> SkewedClock<'a> {
        fn new(timeline: &'a Timeline, base: i64, jitter: Vec<i64>) -> Self {
            Self {
                timeline,
                base,
                jitter,
                reads: Cell::new(0),
            }
        }
    }

    impl Clock for SkewedClock<'_> {
        fn now_ns(&self) -> i64 {
            let n = self.reads.get();
            self.reads.set(n + 1);
            let jitter = self.jitter.get(n).copied().unwrap_or(0);
            self.timeline.tick() + self.base + jitter
        }
    }

    #[test]
    fn test_lockstep_clocks_have_zero_offset() {
        let timeline = Timeline::new(1);
        let mono = SkewedClock::new(&timeline, 0, vec![]);
        let wall = SkewedClock::new(&timeline, 0, vec![]);
        assert_eq!(compute_offset_with(&mono, &wall), 0);

        let timeline = Timeline::new(250);
        let mono = SkewedClock::new(&timeline, 0, vec![]);
        let wall = SkewedClock::new(&timeline, 0, vec![]);
        assert_eq!(compute_offset_with(&mono, &wall), 0);
    }

    #[test]
    fn test_constant_skew_is_recovered() {
        let timeline = Timeline::new(10);
        let mono = SkewedClock::new(&timeline, 0, vec![]);
        let wall = SkewedClock::new(&timeline, 1_700_000_000_000_000_000, vec![]);
        assert_eq!(compute_offset_with(&mono, &wall), 1_700_000_000_000_000_000);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let bound = 40;
        let base = 5_000_000;
        let cases = [
            vec![bound, bound],
            vec![-bound, -bound],
            vec![bound, -bound],
            vec![-17, 33],
        ];

        for jitter in cases {
            let timeline = Timeline::new(10);
            let mono = SkewedClock::new(&timeline, 0, vec![]);
            let wall = SkewedClock::new(&timeline, base, jitter.clone());
            let offset = compute_offset_with(&mono, &wall);
            assert!(
                (offset - base).abs() <= bound,
                "offset {} drifted past bound for jitter {:?}",
                offset,
                jitter
            );
        }
    }

    #[test]
    fn test_real_clocks() {
        let a = MonotonicClock.now_ns();
        let b = MonotonicClock.now_ns();
        assert!(b >= a);
        assert!(WallClock.now_ns() > 0);

        // The reconciled monotonic "now" should land near the wall clock.
        let reconciled = wall_clock_start_ns(MonotonicClock.now_ns(), &MonotonicClock);
        let wall = WallClock.now_ns();
        assert!((wall - reconciled).abs() < 1_000_000_000);
    }

    #[test]
    fn test_epoch_based_start_stays_on_the_epoch() {
        let engine_start = WallClock.now_ns();
        let reconciled = wall_clock_start_ns(engine_start, &WallClock);
        assert!((reconciled - engine_start).abs() < 1_000_000_000);

        let reconciled = wall_clock_start_ns(HighResolutionClock.now_ns(), &HighResolutionClock);
        assert!((WallClock.now_ns() - reconciled).abs() < 1_000_000_000);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_high_resolution_clock_is_system_clock_on_linux() {
        let hr = HighResolutionClock.now_ns();
        let wall = WallClock.now_ns();
        assert!((wall - hr).abs() < 1_000_000_000);
    }
}
