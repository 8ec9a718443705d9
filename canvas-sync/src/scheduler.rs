//! Frame-coalesced pass scheduling.
//!
//! Change notifications call [`FrameScheduler::request`]; the host calls
//! [`FrameScheduler::begin_frame`] once per paint frame and runs a pass only
//! when it returns `true`. Requests that arrive while a pass is running, or
//! during the settle window that follows it, are folded into one follow-up
//! pass instead of overlapping.
//!
//! Time is a caller-supplied millisecond clock so the machine stays
//! deterministic under test.

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassState {
    /// Nothing pending.
    #[default]
    Idle,
    /// A pass will run on the next frame.
    Scheduled,
    /// A pass is running.
    Running {
        /// A request arrived during the pass.
        follow_up: bool,
    },
    /// A pass just finished; requests are being absorbed.
    Settling {
        /// End of the settle window.
        until_ms: u64,
        /// A request arrived during the pass or the window.
        follow_up: bool,
    },
}

/// Coalescing scheduler for reconciliation passes.
#[derive(Debug, Clone, Default)]
pub struct FrameScheduler {
    state: PassState,
    settle_window_ms: u64,
    passes: u64,
}

impl FrameScheduler {
    /// Create a scheduler with the given settle window.
    #[must_use]
    pub fn new(settle_window_ms: u64) -> Self {
        Self {
            state: PassState::Idle,
            settle_window_ms,
            passes: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> PassState {
        self.state
    }

    /// Number of passes started so far.
    #[must_use]
    pub const fn passes(&self) -> u64 {
        self.passes
    }

    /// Whether a pass is scheduled or owed after the settle window.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self.state,
            PassState::Scheduled | PassState::Settling { follow_up: true, .. }
        )
    }

    /// Ask for a pass. Returns `true` if this request scheduled a new one.
    pub fn request(&mut self) -> bool {
        match &mut self.state {
            PassState::Idle => {
                self.state = PassState::Scheduled;
                true
            }
            PassState::Scheduled => false,
            PassState::Running { follow_up } | PassState::Settling { follow_up, .. } => {
                *follow_up = true;
                false
            }
        }
    }

    /// Called once per frame. Returns `true` when the caller should run a pass now.
    pub fn begin_frame(&mut self, now_ms: u64) -> bool {
        match self.state {
            PassState::Scheduled => self.start(),
            PassState::Settling { until_ms, follow_up } if now_ms >= until_ms => {
                if follow_up {
                    self.start()
                } else {
                    self.state = PassState::Idle;
                    false
                }
            }
            _ => false,
        }
    }

    fn start(&mut self) -> bool {
        self.state = PassState::Running { follow_up: false };
        self.passes += 1;
        true
    }

    /// Mark the running pass as finished and open the settle window.
    pub fn finish(&mut self, now_ms: u64) {
        if let PassState::Running { follow_up } = self.state {
            self.state = PassState::Settling {
                until_ms: now_ms.saturating_add(self.settle_window_ms),
                follow_up,
            };
        }
    }

    /// Drop any pending work.
    pub fn reset(&mut self) {
        self.state = PassState::Idle;
    }
}

/// Leading-edge limiter: fires at most once per window.
#[derive(Debug, Clone, Default)]
pub struct Debounce {
    window_ms: u64,
    last_fired_ms: Option<u64>,
}

impl Debounce {
    /// Create a limiter with the given window.
    #[must_use]
    pub const fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_fired_ms: None,
        }
    }

    /// Returns `true` if the event should fire at `now_ms`, and records it.
    pub fn fire(&mut self, now_ms: u64) -> bool {
        match self.last_fired_ms {
            Some(last) if now_ms.saturating_sub(last) < self.window_ms => false,
            _ => {
                self.last_fired_ms = Some(now_ms);
                true
            }
        }
    }

    /// Forget the last firing.
    pub fn reset(&mut self) {
        self.last_fired_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_coalesce_into_one_pass() {
        let mut scheduler = FrameScheduler::new(16);
        assert!(scheduler.request());
        assert!(!scheduler.request());
        assert!(!scheduler.request());
        assert!(scheduler.begin_frame(0));
        assert!(!scheduler.begin_frame(0));
        assert_eq!(scheduler.passes(), 1);
    }

    #[test]
    fn test_requests_during_pass_fold_into_follow_up() {
        let mut scheduler = FrameScheduler::new(16);
        scheduler.request();
        assert!(scheduler.begin_frame(0));
        scheduler.request();
        scheduler.request();
        scheduler.finish(1);
        assert!(scheduler.is_pending());
        assert!(!scheduler.begin_frame(10));
        assert!(scheduler.begin_frame(17));
        scheduler.finish(18);
        assert!(!scheduler.begin_frame(40));
        assert_eq!(scheduler.state(), PassState::Idle);
        assert_eq!(scheduler.passes(), 2);
    }

    #[test]
    fn test_settle_without_follow_up_goes_idle() {
        let mut scheduler = FrameScheduler::new(16);
        scheduler.request();
        scheduler.begin_frame(0);
        scheduler.finish(0);
        assert!(!scheduler.is_pending());
        assert!(!scheduler.begin_frame(16));
        assert_eq!(scheduler.state(), PassState::Idle);
    }

    #[test]
    fn test_debounce_window() {
        let mut debounce = Debounce::new(800);
        assert!(debounce.fire(1000));
        assert!(!debounce.fire(1200));
        assert!(!debounce.fire(1799));
        assert!(debounce.fire(1800));
        debounce.reset();
        assert!(debounce.fire(1801));
    }
}
