//! Graph engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// How batch/broadcast axes with unequal extents are resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Unequal extents are compatible only when one of them is 1.
    #[default]
    Strict,
    /// Take the larger extent without checking compatibility.
    LargestWins,
}

/// Settings for the rewrite driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// Repeat rewrite passes until nothing changes.
    pub fixpoint: bool,
    /// Upper bound on passes when `fixpoint` is set.
    pub max_rounds: usize,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            fixpoint: false,
            max_rounds: 8,
        }
    }
}

impl OptimizeConfig {
    pub fn fixpoint(max_rounds: usize) -> Self {
        Self {
            fixpoint: true,
            max_rounds,
        }
    }
}

/// Configuration of a [`Graph`](crate::Graph).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub broadcast: BroadcastPolicy,
    pub optimize: OptimizeConfig,
    /// Run the invariant validator at the end of every phase.
    pub validate_after_each_phase: bool,
}

impl GraphConfig {
    pub fn with_broadcast(mut self, broadcast: BroadcastPolicy) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_optimize(mut self, optimize: OptimizeConfig) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_after_each_phase = enabled;
        self
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let config: GraphConfig =
            serde_json::from_str(json).map_err(|e| GraphError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string_pretty(self).map_err(|e| GraphError::Config(e.to_string()))
    }

    pub fn check(&self) -> Result<(), GraphError> {
        if self.optimize.fixpoint && self.optimize.max_rounds == 0 {
            return Err(GraphError::Config(
                "optimize.max_rounds must be positive when fixpoint is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
