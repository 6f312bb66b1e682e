//! Named interval timers for the periodic work cycle.
//!
//! A timer fires once strictly more than its interval has passed since it
//! was last marked. Marking is left to the caller so that, for example, a
//! failed send can be deferred instead of rearmed for a full interval.

use crate::config::TimingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTimer {
    name: &'static str,
    interval_ms: u64,
    /// `None` until first marked; such a timer is due immediately
    last_ms: Option<u64>,
}

impl IntervalTimer {
    /// Timer considered last fired at boot.
    pub const fn new(name: &'static str, interval_ms: u64) -> Self {
        Self {
            name,
            interval_ms,
            last_ms: Some(0),
        }
    }

    /// Timer that is due on the first check.
    pub const fn immediate(name: &'static str, interval_ms: u64) -> Self {
        Self {
            name,
            interval_ms,
            last_ms: None,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn last_ms(&self) -> Option<u64> {
        self.last_ms
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        match self.last_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) > self.interval_ms,
        }
    }

    pub fn mark(&mut self, now_ms: u64) {
        self.last_ms = Some(now_ms);
    }

    /// Rearms the timer so it next fires `delay_ms` from now.
    pub fn defer(&mut self, now_ms: u64, delay_ms: u64) {
        self.last_ms = Some(now_ms.saturating_add(delay_ms).saturating_sub(self.interval_ms));
    }

    /// Milliseconds until the timer becomes due; `0` when already due.
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        match self.last_ms {
            None => 0,
            Some(last) => (last + self.interval_ms + 1).saturating_sub(now_ms),
        }
    }
}

/// What the current tick should do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub check_wifi: bool,
    pub sample: bool,
    pub send: bool,
}

/// Timers of the periodic cycle. The cleanup cooldown lives with the
/// uploader because it is keyed off successful sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    pub wifi_check: IntervalTimer,
    pub sample: IntervalTimer,
    pub send: IntervalTimer,
}

impl Scheduler {
    pub const fn new(timing: &TimingConfig) -> Self {
        Self {
            wifi_check: IntervalTimer::new("wifi-check", timing.wifi_check_interval_ms),
            sample: IntervalTimer::immediate("sample", timing.sample_interval_ms),
            send: IntervalTimer::new("send", timing.send_interval_ms),
        }
    }

    pub fn plan(&self, now_ms: u64) -> TickPlan {
        TickPlan {
            check_wifi: self.wifi_check.is_due(now_ms),
            sample: self.sample.is_due(now_ms),
            send: self.send.is_due(now_ms),
        }
    }

    /// Time until the next timer is due, for sleeping between ticks. The
    /// send timer only counts while there is a link to send over.
    pub fn next_due_in_ms(&self, now_ms: u64, include_send: bool) -> u64 {
        let send = include_send.then_some(self.send);
        [Some(self.wifi_check), Some(self.sample), send]
            .iter()
            .flatten()
            .map(|timer| timer.remaining_ms(now_ms))
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_requires_strictly_elapsed_interval() {
        let mut timer = IntervalTimer::new("t", 10_000);
        assert!(!timer.is_due(10_000));
        assert!(timer.is_due(10_001));

        timer.mark(10_001);
        assert!(!timer.is_due(15_000));
        assert_eq!(timer.remaining_ms(15_000), 5_002);
    }

    #[test]
    fn test_immediate_timer() {
        let mut timer = IntervalTimer::immediate("sample", 10_000);
        assert!(timer.is_due(0));
        assert_eq!(timer.remaining_ms(0), 0);
        timer.mark(0);
        assert!(!timer.is_due(5_000));
    }

    #[test]
    fn test_initial_plan() {
        let scheduler = Scheduler::new(&TimingConfig::default());
        assert_eq!(
            scheduler.plan(0),
            TickPlan {
                check_wifi: false,
                sample: true,
                send: false
            }
        );

        let plan = scheduler.plan(60_001);
        assert!(plan.check_wifi && plan.send);
    }

    #[test]
    fn test_next_due() {
        let mut scheduler = Scheduler::new(&TimingConfig::default());
        scheduler.sample.mark(0);
        assert_eq!(scheduler.next_due_in_ms(0, true), 10_001);
        assert_eq!(scheduler.next_due_in_ms(20_000, true), 0);
    }

    #[test]
    fn test_overdue_send_ignored_while_offline() {
        let mut scheduler = Scheduler::new(&TimingConfig::default());
        scheduler.sample.mark(60_000);
        scheduler.wifi_check.mark(60_000);
        assert_eq!(scheduler.next_due_in_ms(61_000, true), 0);
        assert_eq!(scheduler.next_due_in_ms(61_000, false), 9_001);
    }

    #[test]
    fn test_defer_postpones_due_timer() {
        let mut timer = IntervalTimer::new("send", 60_000);
        assert!(timer.is_due(60_001));

        timer.defer(60_001, 10_000);
        assert!(!timer.is_due(60_001));
        assert!(!timer.is_due(70_001));
        assert!(timer.is_due(70_002));
        assert_eq!(timer.remaining_ms(60_001), 10_001);

        // Delays longer than the interval still hold
        timer.defer(0, 90_000);
        assert!(!timer.is_due(60_001));
        assert_eq!(timer.remaining_ms(0), 90_001);
    }
}
