//! Sampling parameters with documented ranges.

use serde::{Deserialize, Serialize};

/// Inclusive temperature range.
pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 2.0);
/// Half-open top-p range (zero disables nucleus sampling entirely).
pub const TOP_P_RANGE: (f32, f32) = (0.0, 1.0);
/// Inclusive top-k range; zero disables top-k.
pub const TOP_K_RANGE: (u32, u32) = (0, 500);
/// Inclusive max-tokens range.
pub const MAX_TOKENS_RANGE: (u32, u32) = (1, 131_072);
/// Inclusive repetition-penalty range.
pub const REPETITION_PENALTY_RANGE: (f32, f32) = (0.5, 2.0);

/// A sampling parameter outside its documented range.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{name} = {value} outside [{min}, {max}]")]
pub struct ParamsError {
    /// Field name.
    pub name: &'static str,
    /// Offending value.
    pub value: f64,
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

/// Sampling parameters for a runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Softmax temperature.
    pub temperature: f32,
    /// Completion length cap.
    pub max_tokens: u32,
    /// Nucleus sampling mass.
    pub top_p: f32,
    /// Top-k cutoff; zero disables.
    pub top_k: u32,
    /// Repetition penalty.
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
        }
    }
}

impl SamplingParams {
    /// Checks every field against its documented range.
    pub fn validate(&self) -> Result<(), ParamsError> {
        check_f32("temperature", self.temperature, TEMPERATURE_RANGE)?;
        if self.top_p <= TOP_P_RANGE.0 || self.top_p > TOP_P_RANGE.1 {
            return Err(ParamsError {
                name: "top_p",
                value: self.top_p as f64,
                min: TOP_P_RANGE.0 as f64,
                max: TOP_P_RANGE.1 as f64,
            });
        }
        check_u32("top_k", self.top_k, TOP_K_RANGE)?;
        check_u32("max_tokens", self.max_tokens, MAX_TOKENS_RANGE)?;
        check_f32(
            "repetition_penalty",
            self.repetition_penalty,
            REPETITION_PENALTY_RANGE,
        )?;
        Ok(())
    }
}

fn check_f32(name: &'static str, value: f32, (min, max): (f32, f32)) -> Result<(), ParamsError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ParamsError {
            name,
            value: value as f64,
            min: min as f64,
            max: max as f64,
        });
    }
    Ok(())
}

fn check_u32(name: &'static str, value: u32, (min, max): (u32, u32)) -> Result<(), ParamsError> {
    if value < min || value > max {
        return Err(ParamsError {
            name,
            value: value as f64,
            min: min as f64,
            max: max as f64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SamplingParams::default().validate().is_ok());
    }

    #[test]
    fn nan_temperature_rejected() {
        let mut p = SamplingParams::default();
        p.temperature = f32::NAN;
        assert!(p.validate().is_err());
    }

    #[test]
    fn zero_top_p_rejected() {
        let mut p = SamplingParams::default();
        p.top_p = 0.0;
        assert_eq!(p.validate().unwrap_err().name, "top_p");
    }

    #[test]
    fn zero_max_tokens_rejected() {
        let mut p = SamplingParams::default();
        p.max_tokens = 0;
        assert_eq!(p.validate().unwrap_err().name, "max_tokens");
    }
}
