use std::fs;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TrellisError};
use crate::schedule::{LinearRamp, StepDecay};

/// Backbone selection. The LeNet-scale variants are implemented; the ResNet
/// variants are recognized configuration values that fail fast at model
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "LENET")]
    Lenet,
    #[serde(rename = "LENET_SLIM")]
    LenetSlim,
    #[serde(rename = "RESNET18")]
    Resnet18,
    #[serde(rename = "RESNET18_SLIM")]
    Resnet18Slim,
}

/// Run configuration. Field names mirror the experiment config keys, so a
/// config file reads the same as the experiment dashboards:
///
/// ```json
/// { "MODEL": "LENET_SLIM", "USE_ROUTING": true, ... }
/// ```
///
/// Unknown keys are rejected at load time; `validate` runs before training
/// starts and every violation is fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct TrainerConfig {
    pub model: ModelKind,
    pub use_routing: bool,
    pub decouple_routing_gradients: bool,
    pub num_classes: usize,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub lr_initial: f32,
    pub lr_decay_rate: f32,
    pub lr_decay_step: usize,
    pub random_routing_warmup_steps: usize,
    pub information_gain_weight_initial: f32,
    pub information_gain_weight_final: f32,
    pub information_gain_weight_ramp_start_step: usize,
    pub information_gain_weight_ramp_end_step: usize,
    pub information_gain_softmax_temperature_initial: f32,
    pub information_gain_softmax_temperature_decay_rate: f32,
    pub information_gain_softmax_temperature_decay_step: usize,
    pub information_gain_balance_coefficient_initial: f32,
    pub information_gain_balance_coefficient_decay_rate: f32,
    pub information_gain_balance_coefficient_decay_step: usize,
    pub validation_interval_epochs: usize,
    pub random_seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::LenetSlim,
            use_routing: true,
            decouple_routing_gradients: false,
            num_classes: 10,
            num_epochs: 100,
            batch_size: 125,
            lr_initial: 0.001,
            lr_decay_rate: 0.9,
            lr_decay_step: 2000,
            random_routing_warmup_steps: 1000,
            information_gain_weight_initial: 0.0,
            information_gain_weight_final: 1.0,
            information_gain_weight_ramp_start_step: 500,
            information_gain_weight_ramp_end_step: 5000,
            information_gain_softmax_temperature_initial: 25.0,
            information_gain_softmax_temperature_decay_rate: 0.9999,
            information_gain_softmax_temperature_decay_step: 2,
            information_gain_balance_coefficient_initial: 1.0,
            information_gain_balance_coefficient_decay_rate: 0.9999,
            information_gain_balance_coefficient_decay_step: 2,
            validation_interval_epochs: 10,
            random_seed: 42,
        }
    }
}

impl TrainerConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(TrellisError::from)?;
        let config: TrainerConfig =
            serde_json::from_str(&raw).map_err(|e| TrellisError::Configuration {
                message: format!("invalid config {}: {}", path, e),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn fail(message: String) -> Result<()> {
            Err(TrellisError::Configuration { message })
        }

        if self.num_classes < 2 {
            return fail(format!("NUM_CLASSES must be >= 2, got {}", self.num_classes));
        }
        if self.num_epochs == 0 {
            return fail("NUM_EPOCHS must be positive".to_string());
        }
        if self.batch_size == 0 {
            return fail("BATCH_SIZE must be positive".to_string());
        }
        if self.lr_initial <= 0.0 {
            return fail(format!("LR_INITIAL must be positive, got {}", self.lr_initial));
        }
        for (name, rate) in [
            ("LR_DECAY_RATE", self.lr_decay_rate),
            (
                "INFORMATION_GAIN_SOFTMAX_TEMPERATURE_DECAY_RATE",
                self.information_gain_softmax_temperature_decay_rate,
            ),
            (
                "INFORMATION_GAIN_BALANCE_COEFFICIENT_DECAY_RATE",
                self.information_gain_balance_coefficient_decay_rate,
            ),
        ] {
            if rate <= 0.0 || rate > 1.0 {
                return fail(format!("{} must be in (0, 1], got {}", name, rate));
            }
        }
        for (name, step) in [
            ("LR_DECAY_STEP", self.lr_decay_step),
            (
                "INFORMATION_GAIN_SOFTMAX_TEMPERATURE_DECAY_STEP",
                self.information_gain_softmax_temperature_decay_step,
            ),
            (
                "INFORMATION_GAIN_BALANCE_COEFFICIENT_DECAY_STEP",
                self.information_gain_balance_coefficient_decay_step,
            ),
        ] {
            if step == 0 {
                return fail(format!("{} must be >= 1", name));
            }
        }
        if self.information_gain_softmax_temperature_initial <= 0.0 {
            return fail("INFORMATION_GAIN_SOFTMAX_TEMPERATURE_INITIAL must be positive".to_string());
        }
        let balance = self.information_gain_balance_coefficient_initial;
        if balance <= 0.0 || balance > 1.0 {
            return fail(format!(
                "INFORMATION_GAIN_BALANCE_COEFFICIENT_INITIAL must be in (0, 1], got {}",
                balance
            ));
        }
        if self.information_gain_weight_ramp_end_step <= self.information_gain_weight_ramp_start_step
        {
            return fail("INFORMATION_GAIN_WEIGHT ramp range must be non-empty".to_string());
        }
        if self.validation_interval_epochs == 0 {
            return fail("VALIDATION_INTERVAL_EPOCHS must be >= 1".to_string());
        }
        if !self.use_routing && self.random_routing_warmup_steps > 0 {
            return fail(
                "RANDOM_ROUTING_WARMUP_STEPS requires USE_ROUTING to be true".to_string(),
            );
        }
        Ok(())
    }

    pub fn lr_schedule(&self) -> StepDecay {
        StepDecay::new(self.lr_initial, self.lr_decay_rate, self.lr_decay_step)
    }

    pub fn temperature_schedule(&self) -> StepDecay {
        StepDecay::new(
            self.information_gain_softmax_temperature_initial,
            self.information_gain_softmax_temperature_decay_rate,
            self.information_gain_softmax_temperature_decay_step,
        )
    }

    pub fn balance_schedule(&self) -> StepDecay {
        StepDecay::new(
            self.information_gain_balance_coefficient_initial,
            self.information_gain_balance_coefficient_decay_rate,
            self.information_gain_balance_coefficient_decay_step,
        )
    }

    pub fn information_gain_weight_schedule(&self) -> LinearRamp {
        LinearRamp::new(
            self.information_gain_weight_initial,
            self.information_gain_weight_final,
            self.information_gain_weight_ramp_start_step,
            self.information_gain_weight_ramp_end_step,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_keys_round_trip_screaming_snake() {
        let config = TrainerConfig::default();
        let json = serde_json::to_string(&config).unwrap();

        assert!(json.contains("\"MODEL\":\"LENET_SLIM\""));
        assert!(json.contains("\"USE_ROUTING\""));
        assert!(json.contains("\"LR_INITIAL\""));

        let parsed: TrainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.num_classes, config.num_classes);
        assert_eq!(parsed.model, config.model);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let config = TrainerConfig::default();
        let mut value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        value["TOTALLY_UNKNOWN"] = serde_json::json!(1);

        let result: std::result::Result<TrainerConfig, _> =
            serde_json::from_value(value);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_decay_rate() {
        let mut config = TrainerConfig::default();
        config.lr_decay_rate = 1.5;
        assert!(config.validate().is_err());

        config.lr_decay_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_decay_step() {
        let mut config = TrainerConfig::default();
        config.information_gain_softmax_temperature_decay_step = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_warmup_without_routing() {
        let mut config = TrainerConfig::default();
        config.use_routing = false;
        config.random_routing_warmup_steps = 10;
        assert!(config.validate().is_err());

        config.random_routing_warmup_steps = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(TrainerConfig::default().validate().is_ok());
    }
}
