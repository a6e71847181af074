//! Scheduled gain automation
//!
//! Every gain change in the engine is either a value set at a time or a
//! linear ramp ending at a time, scheduled against the audio clock. The
//! render thread and analytic readers both evaluate the same event list, so
//! a value computed for a progress callback matches what the output
//! actually does.

/// One scheduled automation event
#[derive(Debug, Clone, Copy, PartialEq)]
enum AutomationEvent {
    /// Step to `value` at `time`
    Set { time: f64, value: f32 },

    /// Ramp linearly from the previous event's value to `value`, ending at
    /// `time`
    Ramp { time: f64, value: f32 },
}

impl AutomationEvent {
    fn time(&self) -> f64 {
        match self {
            AutomationEvent::Set { time, .. } | AutomationEvent::Ramp { time, .. } => *time,
        }
    }

    fn value(&self) -> f32 {
        match self {
            AutomationEvent::Set { value, .. } | AutomationEvent::Ramp { value, .. } => *value,
        }
    }
}

/// Piecewise-linear automation timeline for one gain parameter
///
/// Events are kept sorted by time; equal times preserve insertion order so
/// a set-then-ramp pair scheduled at the same instant behaves as written.
#[derive(Debug, Clone)]
pub struct GainAutomation {
    initial: f32,
    events: Vec<AutomationEvent>,
}

impl GainAutomation {
    pub fn new(initial: f32) -> Self {
        Self {
            initial,
            events: Vec::new(),
        }
    }

    /// Schedule a step to `value` at time `at`
    pub fn set_value_at(&mut self, value: f32, at: f64) {
        self.insert(AutomationEvent::Set { time: at, value });
    }

    /// Schedule a linear ramp to `value` ending at `end_time`
    ///
    /// The ramp starts from the value and time of the preceding event (or
    /// the initial value), matching set-at-time/ramp-to-value-at-time
    /// scheduling semantics.
    pub fn ramp_to(&mut self, value: f32, end_time: f64) {
        self.insert(AutomationEvent::Ramp {
            time: end_time,
            value,
        });
    }

    /// Drop all events after `t`, freezing the value they would have
    /// produced at `t`
    pub fn cancel_after(&mut self, t: f64) {
        let frozen = self.value_at(t);
        self.events.retain(|e| e.time() <= t);
        self.insert(AutomationEvent::Set {
            time: t,
            value: frozen,
        });
    }

    /// Evaluate the automation at time `t`
    pub fn value_at(&self, t: f64) -> f32 {
        let mut last_time = f64::NEG_INFINITY;
        let mut last_value = self.initial;

        for event in &self.events {
            if event.time() <= t {
                last_time = event.time();
                last_value = event.value();
                continue;
            }
            // First event past t: a ramp interpolates, a set does not apply yet.
            if let AutomationEvent::Ramp { time, value } = event {
                let span = time - last_time;
                if span <= 0.0 || !span.is_finite() {
                    return *value;
                }
                let frac = ((t - last_time) / span).clamp(0.0, 1.0) as f32;
                return last_value + (value - last_value) * frac;
            }
            break;
        }

        last_value
    }

    fn insert(&mut self, event: AutomationEvent) {
        let at = self
            .events
            .partition_point(|e| e.time() <= event.time());
        self.events.insert(at, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_value() {
        let automation = GainAutomation::new(0.5);
        assert_eq!(automation.value_at(0.0), 0.5);
        assert_eq!(automation.value_at(100.0), 0.5);
    }

    #[test]
    fn test_set_steps() {
        let mut automation = GainAutomation::new(0.0);
        automation.set_value_at(0.8, 1.0);
        assert_eq!(automation.value_at(0.5), 0.0);
        assert_eq!(automation.value_at(1.0), 0.8);
        assert_eq!(automation.value_at(2.0), 0.8);
    }

    #[test]
    fn test_linear_ramp_interpolates() {
        let mut automation = GainAutomation::new(0.0);
        automation.set_value_at(0.0, 1.0);
        automation.ramp_to(1.0, 3.0);

        assert_eq!(automation.value_at(1.0), 0.0);
        assert!((automation.value_at(2.0) - 0.5).abs() < 1e-6);
        assert_eq!(automation.value_at(3.0), 1.0);
        assert_eq!(automation.value_at(4.0), 1.0);
    }

    #[test]
    fn test_ramp_from_initial_without_set() {
        let mut automation = GainAutomation::new(0.4);
        automation.ramp_to(0.4, 10.0);
        // degenerate ramp from -inf start collapses to its end value
        assert_eq!(automation.value_at(5.0), 0.4);
    }

    #[test]
    fn test_cancel_freezes_mid_ramp() {
        let mut automation = GainAutomation::new(0.0);
        automation.set_value_at(0.0, 0.0);
        automation.ramp_to(1.0, 2.0);
        automation.cancel_after(1.0);

        assert!((automation.value_at(1.0) - 0.5).abs() < 1e-6);
        assert!((automation.value_at(2.0) - 0.5).abs() < 1e-6);
        assert!((automation.value_at(10.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_crossfade_pair_conserves_total() {
        // An equal-time out/in ramp pair sums to the source volume at every
        // point of the fade.
        let volume = 0.6f32;
        let mut g_out = GainAutomation::new(volume);
        let mut g_in = GainAutomation::new(0.001);
        g_out.set_value_at(volume, 0.0);
        g_out.ramp_to(0.001, 2.0);
        g_in.set_value_at(0.001, 0.0);
        g_in.ramp_to(volume, 2.0);

        for i in 0..=20 {
            let t = i as f64 * 0.1;
            let total = g_out.value_at(t) + g_in.value_at(t);
            assert!(
                (total - (volume + 0.001)).abs() < volume * 0.01,
                "t={t}: total={total}"
            );
        }
    }
}
