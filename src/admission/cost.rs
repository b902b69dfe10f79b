//! Cost accounting for inference calls.
//!
//! Converts reported usage units (tokens) into a dollar delta using fixed
//! per-million rates.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GateError;

/// Per-million-unit pricing in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRates {
    #[serde(default = "default_input_rate")]
    pub input_per_million: f64,
    #[serde(default = "default_output_rate")]
    pub output_per_million: f64,
}

impl CostRates {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Rates must be finite and non-negative.
    pub fn validate(&self) -> Result<(), GateError> {
        for (name, rate) in [
            ("input_per_million", self.input_per_million),
            ("output_per_million", self.output_per_million),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(GateError::InvalidConfig(format!(
                    "admission.rates.{name} must be a finite non-negative number, got {rate}"
                )));
            }
        }
        Ok(())
    }

    /// Cost in USD of one call with the given usage.
    pub fn cost(&self, input_units: u64, output_units: u64) -> f64 {
        let input_cost = (input_units as f64 / 1_000_000.0) * self.input_per_million;
        let output_cost = (output_units as f64 / 1_000_000.0) * self.output_per_million;
        let cost = input_cost + output_cost;

        debug!(
            input_units,
            output_units,
            cost_usd = %format!("${cost:.6}"),
            "Calculated call cost"
        );
        cost
    }
}

impl Default for CostRates {
    fn default() -> Self {
        Self::new(default_input_rate(), default_output_rate())
    }
}

const fn default_input_rate() -> f64 {
    3.0
}
const fn default_output_rate() -> f64 {
    15.0
}

/// Usage reported by a completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_units: u64,
    pub output_units: u64,
}

impl Usage {
    pub const fn new(input_units: u64, output_units: u64) -> Self {
        Self {
            input_units,
            output_units,
        }
    }
}

// MARK: - Tests
