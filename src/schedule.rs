use serde::{Deserialize, Serialize};

/// Step-indexed geometric decay.
///
/// `current_value(step) = initial_value * decay_rate ^ floor(step / decay_step)`
///
/// Used for the learning rate, the routing softmax temperature and the
/// information-gain balance coefficient. Pure function of the step: the same
/// step always yields the same value, which is what lets validation and test
/// passes re-derive training-time values from a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepDecay {
    pub initial_value: f32,
    pub decay_rate: f32,
    pub decay_step: usize,
}

impl StepDecay {
    /// # Panics
    ///
    /// Panics if `decay_step == 0`. Config validation rejects that value
    /// before any schedule is constructed.
    pub fn new(initial_value: f32, decay_rate: f32, decay_step: usize) -> Self {
        assert!(decay_step >= 1, "decay_step must be >= 1, got {}", decay_step);
        Self {
            initial_value,
            decay_rate,
            decay_step,
        }
    }

    pub fn current_value(&self, step: usize) -> f32 {
        let exponent = (step / self.decay_step) as i32;
        self.initial_value * self.decay_rate.powi(exponent)
    }
}

/// Monotonic interpolation between two values over a step range.
///
/// Below `start_step` the value is pinned to `start_value`, above `end_step`
/// to `end_value`; in between it interpolates linearly. Works for increasing
/// and decreasing ramps alike. Used for the information-gain loss weight,
/// which ramps up from zero so early routing noise does not dominate the
/// classification objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearRamp {
    pub start_value: f32,
    pub end_value: f32,
    pub start_step: usize,
    pub end_step: usize,
}

impl LinearRamp {
    /// # Panics
    ///
    /// Panics if `end_step <= start_step`. Config validation rejects that
    /// range before any schedule is constructed.
    pub fn new(start_value: f32, end_value: f32, start_step: usize, end_step: usize) -> Self {
        assert!(
            end_step > start_step,
            "ramp range must be non-empty: start_step {} end_step {}",
            start_step,
            end_step
        );
        Self {
            start_value,
            end_value,
            start_step,
            end_step,
        }
    }

    pub fn current_value(&self, step: usize) -> f32 {
        if step <= self.start_step {
            return self.start_value;
        }
        if step >= self.end_step {
            return self.end_value;
        }
        let progress =
            (step - self.start_step) as f32 / (self.end_step - self.start_step) as f32;
        self.start_value + (self.end_value - self.start_value) * progress
    }
}
