//! Single-shot timers driving timeouts and the key-refresh sweep

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Timers owned by a commissioning context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Response, passkey-entry and passkey-wait timeouts
    Process,
    /// Periodic coordinator key refresh
    KeyRefresh,
}

/// Clock service. Starting a running timer restarts it.
pub trait TimerService {
    fn start(&mut self, kind: TimerKind, duration_ms: u32);

    /// Stop a timer; returns whether it was running
    fn stop(&mut self, kind: TimerKind) -> bool;

    fn is_active(&self, kind: TimerKind) -> bool;
}

impl<T: TimerService + ?Sized> TimerService for Rc<RefCell<T>> {
    fn start(&mut self, kind: TimerKind, duration_ms: u32) {
        self.borrow_mut().start(kind, duration_ms)
    }

    fn stop(&mut self, kind: TimerKind) -> bool {
        self.borrow_mut().stop(kind)
    }

    fn is_active(&self, kind: TimerKind) -> bool {
        self.borrow().is_active(kind)
    }
}

/// Timer driven by hand: arming records the duration and the owner calls
/// [`ManualTimer::expire`] to model the timeout.
#[derive(Debug, Default)]
pub struct ManualTimer {
    armed: HashMap<TimerKind, u32>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration a running timer was armed with
    pub fn armed(&self, kind: TimerKind) -> Option<u32> {
        self.armed.get(&kind).copied()
    }

    /// Consume a running timer; returns whether it was running
    pub fn expire(&mut self, kind: TimerKind) -> bool {
        self.armed.remove(&kind).is_some()
    }
}

impl TimerService for ManualTimer {
    fn start(&mut self, kind: TimerKind, duration_ms: u32) {
        self.armed.insert(kind, duration_ms);
    }

    fn stop(&mut self, kind: TimerKind) -> bool {
        self.armed.remove(&kind).is_some()
    }

    fn is_active(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }
}
