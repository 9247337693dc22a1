//! Search space definitions and sampling primitives.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sl_types::{config_error, validation_error, SlResult};
use std::collections::BTreeMap;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Dotted path into the model configuration (e.g. "fit.loss.kappa").
    pub name: String,
    /// The kind of search range.
    #[serde(flatten)]
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// A concrete parameter value.
///
/// `Int` is tried before `Float` when deserializing so integers survive a
/// round trip through a snapshot unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(serde_json::Value::String(s)) => f.write_str(s),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// An ordered point in the search space, one value per parameter.
pub type Point = Vec<ParameterValue>;

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    pub fn dimensions(&self) -> usize {
        self.parameters.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    pub fn validate(&self) -> SlResult<()> {
        if self.parameters.is_empty() {
            return Err(config_error!("hyper_search.space", "needs at least one parameter"));
        }
        let mut seen = std::collections::HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(config_error!(param.name, "declared twice"));
            }
            let valid = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    low.is_finite() && high.is_finite() && low < high
                }
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => {
                    *low > 0.0 && high.is_finite() && low < high
                }
                ParameterKind::Choice { values } => !values.is_empty(),
            };
            if !valid {
                return Err(config_error!(param.name, "invalid range {:?}", param.kind));
            }
        }
        Ok(())
    }

    /// Draw an independent uniform sample.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Point {
        self.parameters
            .iter()
            .map(|param| sample_dimension(&param.kind, rng))
            .collect()
    }

    /// Perturb `base` by up to `scale` of each dimension's range. Categorical
    /// dimensions are resampled.
    pub fn perturb<R: Rng + ?Sized>(
        &self,
        base: &[ParameterValue],
        scale: f64,
        rng: &mut R,
    ) -> Point {
        self.parameters
            .iter()
            .zip(base)
            .map(|(param, value)| match (&param.kind, value) {
                (ParameterKind::FloatRange { low, high }, ParameterValue::Float(v)) => {
                    let noise = rng.gen_range(-scale..=scale) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, ParameterValue::Int(v)) => {
                    let span = (((high - low) as f64) * scale).ceil().max(1.0) as i64;
                    let delta: i64 = rng.gen_range(-span..=span);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, ParameterValue::Float(v)) => {
                    let noise = rng.gen_range(-scale..=scale) * (high.ln() - low.ln());
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                (kind, _) => sample_dimension(kind, rng),
            })
            .collect()
    }

    /// Name each value of `point`.
    pub fn named(&self, point: &[ParameterValue]) -> BTreeMap<String, ParameterValue> {
        self.names()
            .map(str::to_string)
            .zip(point.iter().cloned())
            .collect()
    }

    /// Inverse of [`SearchSpace::named`]: order a named set by declaration.
    pub fn point_from(&self, named: &BTreeMap<String, ParameterValue>) -> SlResult<Point> {
        self.parameters
            .iter()
            .map(|param| {
                named
                    .get(&param.name)
                    .cloned()
                    .ok_or_else(|| validation_error!("parameter {} has no value", param.name))
            })
            .collect()
    }
}

fn sample_dimension<R: Rng + ?Sized>(kind: &ParameterKind, rng: &mut R) -> ParameterValue {
    match kind {
        ParameterKind::FloatRange { low, high } => {
            ParameterValue::Float(rng.gen_range(*low..=*high))
        }
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
        ParameterKind::Choice { values } => {
            let idx = rng.gen_range(0..values.len());
            ParameterValue::Json(values[idx].clone())
        }
    }
}
