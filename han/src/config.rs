use std::{fs, path::Path};

use hetgraph::ReachabilityConfig;
use serde::{Deserialize, Serialize};

use crate::{
    HanErr, Result,
    optimization::{Adam, GradientDescent, GradientDescentWithMomentum, Optimizer},
};

/// The hyperparameters of a `Han` model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HanConfig {
    pub in_size: usize,
    pub hidden_size: usize,
    pub out_size: usize,
    /// One entry per HAN layer.
    pub num_heads: Vec<usize>,
    #[serde(default)]
    pub dropout: f32,
    /// Metapaths whose reachable graph is denser than this are pruned.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_semantic_hidden")]
    pub semantic_hidden: usize,
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    #[serde(default = "default_topk_factor")]
    pub topk_factor: usize,
    /// The entry of a feature dictionary that replaces the input features.
    #[serde(default = "default_feature_key")]
    pub feature_key: String,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_threshold() -> f64 {
    ReachabilityConfig::default().threshold
}

fn default_semantic_hidden() -> usize {
    64
}

fn default_fanout() -> usize {
    500
}

fn default_topk_factor() -> usize {
    ReachabilityConfig::default().topk_factor
}

fn default_feature_key() -> String {
    "business_features".to_string()
}

impl HanConfig {
    /// Creates a new `HanConfig` with every optional field set to its default.
    pub fn new(in_size: usize, hidden_size: usize, out_size: usize, num_heads: Vec<usize>) -> Self {
        Self {
            in_size,
            hidden_size,
            out_size,
            num_heads,
            dropout: 0.,
            threshold: default_threshold(),
            semantic_hidden: default_semantic_hidden(),
            fanout: default_fanout(),
            topk_factor: default_topk_factor(),
            feature_key: default_feature_key(),
            seed: None,
        }
    }

    /// Parses and validates a JSON config.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn reachability(&self) -> ReachabilityConfig {
        ReachabilityConfig {
            threshold: self.threshold,
            topk_factor: self.topk_factor,
        }
    }

    /// Checks that the config describes a buildable model.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(HanErr::InvalidConfig(msg.to_string()));

        if self.num_heads.is_empty() {
            return invalid("num_heads must have at least one layer");
        }
        if self.num_heads.contains(&0) {
            return invalid("every layer needs at least one head");
        }
        if self.in_size == 0 || self.hidden_size == 0 || self.out_size == 0 {
            return invalid("sizes must be positive");
        }
        if self.semantic_hidden == 0 || self.fanout == 0 || self.topk_factor == 0 {
            return invalid("semantic_hidden, fanout and topk_factor must be positive");
        }
        if !(0. ..1.).contains(&self.dropout) {
            return invalid("dropout must be in [0, 1)");
        }
        if self.threshold.is_nan() || self.threshold <= 0. {
            return invalid("threshold must be positive");
        }

        Ok(())
    }
}

/// The optimizer every parameter group gets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    GradientDescent {
        learning_rate: f32,
    },
    GradientDescentWithMomentum {
        learning_rate: f32,
        momentum: f32,
    },
}

impl OptimizerConfig {
    /// Adam with the usual hyperparameters.
    pub fn adam(learning_rate: f32) -> Self {
        Self::Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    /// Builds an optimizer for a group of `len` parameters.
    pub fn build(&self, len: usize) -> Box<dyn Optimizer + Send> {
        match *self {
            Self::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(len, learning_rate, beta1, beta2, epsilon)),
            Self::GradientDescent { learning_rate } => {
                Box::new(GradientDescent::new(learning_rate))
            }
            Self::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => Box::new(GradientDescentWithMomentum::new(
                len,
                learning_rate,
                momentum,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_filled_in() {
        let config = HanConfig::from_json_str(
            r#"{ "in_size": 8, "hidden_size": 4, "out_size": 3, "num_heads": [2, 1] }"#,
        )
        .unwrap();

        assert_eq!(config, HanConfig::new(8, 4, 3, vec![2, 1]));
        assert_eq!(config.threshold, 0.75);
        assert_eq!(config.semantic_hidden, 64);
        assert_eq!(config.fanout, 500);
        assert_eq!(config.topk_factor, 5000);
        assert_eq!(config.feature_key, "business_features");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = HanConfig::from_json_str(
            r#"{ "in_size": 8, "hidden_size": 4, "out_size": 3, "num_heads": [2], "heads": 1 }"#,
        );

        assert!(matches!(err, Err(HanErr::Json(_))));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = HanConfig::new(8, 4, 3, vec![]);
        assert!(matches!(config.validate(), Err(HanErr::InvalidConfig(_))));

        config.num_heads = vec![2];
        config.dropout = 1.;
        assert!(matches!(config.validate(), Err(HanErr::InvalidConfig(_))));

        config.dropout = 0.5;
        config.threshold = 0.;
        assert!(matches!(config.validate(), Err(HanErr::InvalidConfig(_))));

        config.threshold = 0.75;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn optimizer_from_json() {
        let config: OptimizerConfig = serde_json::from_str(
            r#"{ "gradient_descent_with_momentum": { "learning_rate": 0.1, "momentum": 0.9 } }"#,
        )
        .unwrap();

        assert_eq!(
            config,
            OptimizerConfig::GradientDescentWithMomentum {
                learning_rate: 0.1,
                momentum: 0.9
            }
        );

        let mut optimizer = config.build(1);
        let mut params = [1.0];
        optimizer.update_params(&[1.0], &mut params).unwrap();
        assert!((params[0] - 0.9).abs() < 1e-6);
    }
}
