//! Contention-adaptive activation of accounting instances.
//!
//! The cache starts with one active instance. Every contention-checked
//! lock of an instance records whether it had to block. When an instance
//! collects `stall_threshold` blocking acquisitions before
//! `sample_window` non-blocking ones, one more instance is activated.
//! The active count never decreases, so instance indices handed out
//! earlier stay valid.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::deadlock::ExecContext;

/// Per-instance contention sample, protected by the instance lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContentionSample {
    pub(crate) stalls: u32,
    pub(crate) nowaits: u32,
}

impl ContentionSample {
    fn reset(&mut self) {
        self.stalls = 0;
        self.nowaits = 0;
    }
}

/// Decides how many accounting instances are in use.
#[derive(Debug)]
pub(crate) struct ShardController {
    active: AtomicUsize,
    max: usize,
    warned: AtomicBool,
    stall_threshold: u32,
    sample_window: u32,
}

impl ShardController {
    pub(crate) fn new(max: usize, stall_threshold: u32, sample_window: u32) -> Self {
        Self {
            active: AtomicUsize::new(1),
            max,
            warned: AtomicBool::new(false),
            stall_threshold,
            sample_window,
        }
    }

    /// Number of active instances.
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    /// Pick the instance for `ctx`. Also returns the active count observed.
    pub(crate) fn instance_for(&self, ctx: &ExecContext) -> (usize, usize) {
        let active = self.active();
        ((ctx.id() % active as u64) as usize, active)
    }

    /// Record one lock acquisition on `instance`.
    ///
    /// `observed_active` is the active count the caller used to pick the
    /// instance; activation only succeeds if nobody changed it since.
    /// Returns the new active count when this call activated an instance.
    pub(crate) fn record(
        &self,
        sample: &mut ContentionSample,
        instance: usize,
        observed_active: usize,
        stalled: bool,
    ) -> Option<usize> {
        if !stalled {
            sample.nowaits += 1;
            if sample.nowaits >= self.sample_window {
                sample.reset();
            }
            return None;
        }

        sample.stalls += 1;
        if sample.stalls < self.stall_threshold {
            return None;
        }

        let mut activated = None;
        if observed_active < self.max {
            if self
                .active
                .compare_exchange(
                    observed_active,
                    observed_active + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                tracing::info!(
                    instance,
                    active = observed_active + 1,
                    max = self.max,
                    "detected table cache mutex contention, activated new instance"
                );
                activated = Some(observed_active + 1);
            }
        } else if !self.warned.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                instance,
                max = self.max,
                "detected table cache mutex contention at maximum instance count, \
                 consider raising max_instances"
            );
        }

        sample.reset();
        activated
    }
}
