//! Core types for bit-width exploration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One bit width per registered layer, in registry order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BitWidthVector(pub Vec<u32>);

impl BitWidthVector {
    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// From an engine decision vector; `None` if any entry is not a valid width.
    pub fn from_decision(x: &[i64]) -> Option<Self> {
        x.iter()
            .map(|&v| u32::try_from(v).ok())
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }
}

impl From<Vec<u32>> for BitWidthVector {
    fn from(v: Vec<u32>) -> Self {
        Self(v)
    }
}

/// `4-4-8`: unique key for caching and reporting.
impl fmt::Display for BitWidthVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("-"))
    }
}

/// Accuracy and cost of one evaluated vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub accuracy: f64,
    pub cost: f64,
}

impl Score {
    /// Both minimised: `[-accuracy, cost]`.
    pub fn objectives(&self) -> [f64; 2] {
        [-self.accuracy, self.cost]
    }
}

/// A scored individual as stored in history and result artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    pub bit_widths: BitWidthVector,
    /// `[-accuracy, cost]`.
    pub objectives: [f64; 2],
    /// `min_accuracy - accuracy`; feasible when `<= 0`.
    pub constraint: f64,
    pub generation: usize,
}

impl Individual {
    pub fn accuracy(&self) -> f64 {
        -self.objectives[0]
    }

    pub fn cost(&self) -> f64 {
        self.objectives[1]
    }

    pub fn is_feasible(&self) -> bool {
        self.constraint <= 0.0
    }
}

/// Sign-corrected point of the Pareto front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoPoint {
    pub bit_widths: BitWidthVector,
    pub accuracy: f64,
    pub cost: f64,
}
