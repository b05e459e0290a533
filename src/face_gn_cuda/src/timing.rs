//! Detailed timing instrumentation for profiling.
//!
//! This module provides timing collection when the `profiling` feature is enabled.
//! Without the feature, all timing macros compile to no-ops.

use serde::{Deserialize, Serialize};
#[cfg(feature = "profiling")]
use std::time::Instant;

/// Timing breakdown for a single `solve()` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitTiming {
    /// Total solve time
    pub total_ms: f64,
    /// Time to regenerate face geometry
    pub geometry_ms: f64,
    /// Time to build feature rows (both builders on the device path)
    pub jacobian_ms: f64,
    /// Time to build regularizer rows (host builder only)
    pub regularizer_ms: f64,
    /// Time to solve the normal equations
    pub solver_ms: f64,
    /// Time to apply updates
    pub update_ms: f64,
    /// Per-iteration timing breakdown
    pub iterations: Vec<IterationTiming>,
}

/// Timing for a single Gauss-Newton iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IterationTiming {
    pub iteration: usize,
    pub total_ms: f64,
    pub geometry_ms: f64,
    pub jacobian_ms: f64,
    pub regularizer_ms: f64,
    pub solver_ms: f64,
    pub update_ms: f64,
}

/// Wall-clock timer for one phase.
#[cfg(feature = "profiling")]
pub struct Timer {
    start: Instant,
}

#[cfg(feature = "profiling")]
impl Timer {
    #[inline]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Collector for timing data during a solve.
#[cfg(feature = "profiling")]
#[derive(Debug, Default)]
pub struct TimingCollector {
    solve_start: Option<Instant>,
    current_iteration: usize,
    timing: FitTiming,
    iteration_start: Option<Instant>,
    phase_times: IterationTiming,
}

#[cfg(feature = "profiling")]
impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_solve(&mut self) {
        self.solve_start = Some(Instant::now());
        self.current_iteration = 0;
        self.timing = FitTiming::default();
    }

    pub fn start_iteration(&mut self) {
        self.iteration_start = Some(Instant::now());
        self.phase_times = IterationTiming {
            iteration: self.current_iteration,
            ..Default::default()
        };
    }

    pub fn record_phase(&mut self, phase: &str, duration_ms: f64) {
        let (iteration, total) = match phase {
            "geometry" => (
                &mut self.phase_times.geometry_ms,
                &mut self.timing.geometry_ms,
            ),
            "jacobian" => (
                &mut self.phase_times.jacobian_ms,
                &mut self.timing.jacobian_ms,
            ),
            "regularizer" => (
                &mut self.phase_times.regularizer_ms,
                &mut self.timing.regularizer_ms,
            ),
            "solver" => (&mut self.phase_times.solver_ms, &mut self.timing.solver_ms),
            "update" => (&mut self.phase_times.update_ms, &mut self.timing.update_ms),
            _ => return,
        };
        *iteration += duration_ms;
        *total += duration_ms;
    }

    pub fn end_iteration(&mut self) {
        let mut entry = std::mem::take(&mut self.phase_times);
        entry.total_ms = self
            .iteration_start
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        self.timing.iterations.push(entry);
        self.current_iteration += 1;
    }

    pub fn finish(&mut self) -> FitTiming {
        self.timing.total_ms = self
            .solve_start
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        std::mem::take(&mut self.timing)
    }
}

/// No-op collector when profiling is disabled.
#[cfg(not(feature = "profiling"))]
#[derive(Debug, Default)]
pub struct TimingCollector;

#[cfg(not(feature = "profiling"))]
impl TimingCollector {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn start_solve(&mut self) {}

    #[inline(always)]
    pub fn start_iteration(&mut self) {}

    #[inline(always)]
    pub fn record_phase(&mut self, _phase: &str, _duration_ms: f64) {}

    #[inline(always)]
    pub fn end_iteration(&mut self) {}

    #[inline(always)]
    pub fn finish(&mut self) -> FitTiming {
        FitTiming::default()
    }
}

/// Convenience macro for timing a block of code.
///
/// Usage:
/// ```ignore
/// let system = time_phase!(collector, "jacobian", {
///     build_system_cpu(layout, &geometry, features, weight)
/// });
/// ```
#[macro_export]
macro_rules! time_phase {
    ($collector:expr, $phase:expr, $block:expr) => {{
        #[cfg(feature = "profiling")]
        let _timer = $crate::timing::Timer::new();

        let result = $block;

        #[cfg(feature = "profiling")]
        $collector.record_phase($phase, _timer.elapsed_ms());
        #[cfg(not(feature = "profiling"))]
        let _ = &$collector;

        result
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_collector() {
        let mut collector = TimingCollector::new();

        collector.start_solve();
        collector.start_iteration();
        collector.record_phase("geometry", 1.0);
        collector.record_phase("jacobian", 2.0);
        collector.record_phase("regularizer", 0.25);
        collector.record_phase("solver", 3.0);
        collector.record_phase("update", 0.5);
        collector.end_iteration();
        collector.start_iteration();
        collector.record_phase("solver", 1.0);
        collector.end_iteration();

        let timing = collector.finish();

        #[cfg(feature = "profiling")]
        {
            assert_eq!(timing.iterations.len(), 2);
            assert_eq!(timing.geometry_ms, 1.0);
            assert_eq!(timing.jacobian_ms, 2.0);
            assert_eq!(timing.regularizer_ms, 0.25);
            assert_eq!(timing.solver_ms, 4.0);
            assert_eq!(timing.update_ms, 0.5);
            assert_eq!(timing.iterations[1].iteration, 1);
            assert_eq!(timing.iterations[1].solver_ms, 1.0);
        }

        #[cfg(not(feature = "profiling"))]
        {
            // No-op, timing is zero
            assert_eq!(timing.total_ms, 0.0);
        }
    }
}
