//! Search space definitions: parameter axes, their domains and concrete values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::SuggestError;

/// Concrete parameter vector of a trial, keyed by axis name.
pub type ParameterSet = BTreeMap<String, ParameterValue>;

/// A single parameter axis in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Axis name as known to the suggester (e.g. "lambda").
    pub name: String,
    /// The value domain the suggester draws from.
    pub domain: ParameterDomain,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterDomain {
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
}

impl ParameterDomain {
    /// Check the bounds are usable for sampling.
    pub fn validate(&self, parameter: &str) -> Result<(), SuggestError> {
        let invalid = |message: String| SuggestError::InvalidDomain {
            parameter: parameter.to_string(),
            message,
        };
        match *self {
            Self::IntRange { low, high } => {
                if low > high {
                    return Err(invalid(format!("low {low} exceeds high {high}")));
                }
            }
            Self::LogUniform { low, high } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid("bounds must be finite".into()));
                }
                if low <= 0.0 {
                    return Err(invalid(format!("log-uniform low must be positive, got {low}")));
                }
                if low > high {
                    return Err(invalid(format!("low {low} exceeds high {high}")));
                }
            }
        }
        Ok(())
    }

    /// Whether `value` is of the right kind and lies inside the bounds.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (*self, value) {
            (Self::LogUniform { low, high }, ParameterValue::Float(v)) => *v >= low && *v <= high,
            (Self::IntRange { low, high }, ParameterValue::Int(v)) => *v >= low && *v <= high,
            _ => false,
        }
    }
}

/// A concrete parameter value produced by a suggester.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
}

impl ParameterValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    /// Stable textual form handed to the evaluator on its command line.
    ///
    /// Floats use fixed six-digit precision, integers their plain decimal form.
    pub fn to_arg(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => format!("{v:.6}"),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

/// The full search space: an ordered list of parameter axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            domain: ParameterDomain::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            domain: ParameterDomain::LogUniform { low, high },
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Validate every axis, and reject duplicate names.
    pub fn validate(&self) -> Result<(), SuggestError> {
        for (idx, param) in self.parameters.iter().enumerate() {
            param.domain.validate(&param.name)?;
            if self.parameters[..idx].iter().any(|p| p.name == param.name) {
                return Err(SuggestError::InvalidDomain {
                    parameter: param.name.clone(),
                    message: "duplicate parameter name".into(),
                });
            }
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_space_builder_chain() {
        let space = SearchSpace::new()
            .add_log_uniform("lambda", 1e-6, 1.0)
            .add_log_uniform("eta", 1e-6, 1.0)
            .add_int("latent", 1, 16);
        assert_eq!(space.parameters.len(), 3);
        assert!(space.validate().is_ok());
        assert_eq!(
            space.get("latent").map(|p| p.domain),
            Some(ParameterDomain::IntRange { low: 1, high: 16 })
        );
    }

    #[test]
    fn rejects_bad_domains() {
        let inverted = ParameterDomain::IntRange { low: 5, high: 1 };
        assert!(inverted.validate("k").is_err());

        let zero_log = ParameterDomain::LogUniform { low: 0.0, high: 1.0 };
        match zero_log.validate("lambda") {
            Err(SuggestError::InvalidDomain { parameter, .. }) => assert_eq!(parameter, "lambda"),
            other => panic!("expected InvalidDomain, got {other:?}"),
        }

        let dup = SearchSpace::new().add_int("a", 1, 2).add_int("a", 1, 3);
        assert!(dup.validate().is_err());
    }

    #[test]
    fn domain_contains_checks_kind_and_bounds() {
        let log = ParameterDomain::LogUniform { low: 1e-6, high: 1.0 };
        assert!(log.contains(&ParameterValue::Float(0.01)));
        assert!(!log.contains(&ParameterValue::Float(2.0)));
        assert!(!log.contains(&ParameterValue::Int(1)));

        let int = ParameterDomain::IntRange { low: 1, high: 16 };
        assert!(int.contains(&ParameterValue::Int(16)));
        assert!(!int.contains(&ParameterValue::Int(17)));
    }

    #[test]
    fn values_format_for_command_line() {
        assert_eq!(ParameterValue::Float(0.000123).to_arg(), "0.000123");
        assert_eq!(ParameterValue::Float(0.5).to_arg(), "0.500000");
        assert_eq!(ParameterValue::Int(8).to_arg(), "8");
    }

    #[test]
    fn untagged_values_keep_their_kind() {
        let ints: ParameterValue = serde_json::from_str("4").unwrap();
        assert_eq!(ints, ParameterValue::Int(4));
        let floats: ParameterValue = serde_json::from_str("0.25").unwrap();
        assert_eq!(floats, ParameterValue::Float(0.25));
    }
}
