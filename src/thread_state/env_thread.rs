//! State one environment keeps about one thread.

use std::collections::BTreeSet;

use crate::event::{EventKind, EventSet};
use crate::payload::{Location, MethodHandle};

/// Per environment-thread pair bookkeeping.
///
/// Only the owning thread reads or writes its markers; the enclosing mutex
/// exists for enablement writers and teardown.
#[derive(Debug, Clone, Default)]
pub struct EnvThreadState {
    /// Kinds this environment enabled for this thread only
    pub(crate) enabled: EventSet,
    current: Option<(MethodHandle, Location)>,
    single_step_posted: bool,
    breakpoint_posted: bool,
    frame_pops: BTreeSet<i32>,
}

/// Outcome of a location-gated check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationGate {
    Deliver,
    Duplicate,
}

impl EnvThreadState {
    pub fn enabled(&self) -> EventSet {
        self.enabled
    }

    pub fn current_location(&self) -> Option<(MethodHandle, Location)> {
        self.current
    }

    /// Move the location marker, re-arming both gates if it changed.
    pub(crate) fn compare_and_set_location(&mut self, method: MethodHandle, location: Location) {
        if self.current != Some((method, location)) {
            self.current = Some((method, location));
            self.single_step_posted = false;
            self.breakpoint_posted = false;
        }
    }

    pub(crate) fn clear_location(&mut self) {
        self.current = None;
        self.single_step_posted = false;
        self.breakpoint_posted = false;
    }

    /// Decide delivery of a location-gated event at the current marker and
    /// mark it posted.
    pub(crate) fn gate(&mut self, kind: EventKind) -> LocationGate {
        let posted = match kind {
            EventKind::SingleStep => &mut self.single_step_posted,
            EventKind::Breakpoint => &mut self.breakpoint_posted,
            _ => return LocationGate::Deliver,
        };
        if *posted {
            LocationGate::Duplicate
        } else {
            *posted = true;
            LocationGate::Deliver
        }
    }

    pub(crate) fn set_frame_pop(&mut self, depth: i32) {
        self.frame_pops.insert(depth);
    }

    pub(crate) fn take_frame_pop(&mut self, depth: i32) -> bool {
        self.frame_pops.remove(&depth)
    }

    /// Drop requests for frames that no longer exist.
    pub(crate) fn clear_frame_pops_above(&mut self, depth: i32) {
        self.frame_pops.retain(|d| *d <= depth);
    }

    pub fn has_frame_pop(&self, depth: i32) -> bool {
        self.frame_pops.contains(&depth)
    }
}
