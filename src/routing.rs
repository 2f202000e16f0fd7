/// Shared routing utilities for the trellis forward pass.
///
/// This module provides the routing strategy type, the pure per-step policy
/// that selects it, and the numerically stable softmax helpers used both for
/// branch selection and for the information-gain probability estimates.
use ndarray::Array2;

use crate::config::TrainerConfig;

/// Which policy governs branch selection for a training step.
///
/// A closed set: every consumption site matches exhaustively, so adding a
/// strategy is a compile-time-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Routing disabled: every example takes the first branch at each
    /// routing point and no information-gain loss is computed.
    NoRouting,
    /// Uniform random branch per example. Used as a warm-up phase so the
    /// branches receive gradient signal before the routing heads commit.
    Random,
    /// Branch chosen by the routing head's tempered softmax distribution.
    InformationGain,
}

impl RoutingStrategy {
    /// Resolve the strategy for a step. Pure function of `(step, config)`:
    /// re-querying the same step always yields the same strategy, which is
    /// what lets evaluation passes re-derive the strategy from the last
    /// training step instead of persisting it.
    pub fn select(step: usize, config: &TrainerConfig) -> RoutingStrategy {
        if !config.use_routing {
            return RoutingStrategy::NoRouting;
        }
        if step < config.random_routing_warmup_steps {
            RoutingStrategy::Random
        } else {
            RoutingStrategy::InformationGain
        }
    }

    /// Whether this strategy produces an adaptive branch distribution worth
    /// accumulating in per-class routing reports.
    pub fn is_adaptive(&self) -> bool {
        match self {
            RoutingStrategy::NoRouting => false,
            RoutingStrategy::Random | RoutingStrategy::InformationGain => true,
        }
    }
}

/// Numerically stable row-wise softmax.
///
/// Subtracts the row maximum before exponentiating so large logits cannot
/// overflow `exp()`.
pub fn softmax(x: &Array2<f32>) -> Array2<f32> {
    softmax_with_temperature(x, 1.0)
}

/// Row-wise softmax of `x / temperature`.
///
/// Temperatures above 1 smooth the branch distribution, temperatures below 1
/// sharpen it; the trainer anneals the temperature downward so routing heads
/// commit gradually.
pub fn softmax_with_temperature(x: &Array2<f32>, temperature: f32) -> Array2<f32> {
    let (rows, cols) = x.dim();
    let mut result = Array2::<f32>::zeros((rows, cols));

    for row_idx in 0..rows {
        let row = x.row(row_idx);

        let max_val = row
            .iter()
            .map(|&v| v / temperature)
            .fold(f32::NEG_INFINITY, f32::max);
        let exp_row: Vec<f32> = row
            .iter()
            .map(|&v| (v / temperature - max_val).exp())
            .collect();
        let sum_exp: f32 = exp_row.iter().sum();

        for (col_idx, &exp_val) in exp_row.iter().enumerate() {
            result[[row_idx, col_idx]] = exp_val / sum_exp;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn routing_config(use_routing: bool, warmup: usize) -> TrainerConfig {
        let mut config = TrainerConfig::default();
        config.use_routing = use_routing;
        config.random_routing_warmup_steps = warmup;
        config
    }

    #[test]
    fn test_select_routing_disabled_is_always_no_routing() {
        let config = routing_config(false, 100);

        for step in [0usize, 1, 99, 100, 10_000] {
            assert_eq!(
                RoutingStrategy::select(step, &config),
                RoutingStrategy::NoRouting
            );
        }
    }

    #[test]
    fn test_select_warmup_then_information_gain() {
        let config = routing_config(true, 3);

        assert_eq!(RoutingStrategy::select(0, &config), RoutingStrategy::Random);
        assert_eq!(RoutingStrategy::select(2, &config), RoutingStrategy::Random);
        assert_eq!(
            RoutingStrategy::select(3, &config),
            RoutingStrategy::InformationGain
        );
        assert_eq!(
            RoutingStrategy::select(50_000, &config),
            RoutingStrategy::InformationGain
        );
    }

    #[test]
    fn test_select_is_deterministic() {
        let config = routing_config(true, 10);

        for step in 0..40 {
            assert_eq!(
                RoutingStrategy::select(step, &config),
                RoutingStrategy::select(step, &config)
            );
        }
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = array![[1.0, 2.0, 3.0], [-4.0, 0.0, 4.0]];
        let probs = softmax(&x);

        for row in probs.rows() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_numerical_stability() {
        let x = array![[1000.0, 1001.0, 1002.0]];
        let probs = softmax(&x);

        assert!(probs.iter().all(|&p| p.is_finite()));
        let sum: f32 = probs.sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_temperature_smooths_distribution() {
        let x = array![[2.0, 0.0]];

        let sharp = softmax_with_temperature(&x, 0.5);
        let smooth = softmax_with_temperature(&x, 4.0);

        assert!(sharp[[0, 0]] > smooth[[0, 0]]);
        assert!(smooth[[0, 0]] > 0.5); // still favors the larger logit
    }

    #[test]
    fn test_no_routing_is_not_adaptive() {
        assert!(!RoutingStrategy::NoRouting.is_adaptive());
        assert!(RoutingStrategy::Random.is_adaptive());
        assert!(RoutingStrategy::InformationGain.is_adaptive());
    }
}
