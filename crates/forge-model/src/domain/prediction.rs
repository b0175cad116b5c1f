use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One prediction record as exported by the platform.
///
/// Only `pk` is interpreted; every other field is kept verbatim so a unit can read whatever
/// the record carries (outputs, algorithm image, status, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub pk: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("invalid predictions document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate prediction pk: {0}")]
    DuplicatePk(String),
    #[error("prediction pk must not be empty (entry #{0})")]
    EmptyPk(usize),
}

impl Prediction {
    pub fn new(pk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            rest: Map::new(),
        }
    }

    /// Parse a JSON array of predictions, rejecting empty and duplicate primary keys.
    pub fn list_from_json(s: &str) -> Result<Vec<Prediction>, PredictionError> {
        let list: Vec<Prediction> = serde_json::from_str(s)?;

        let mut seen = HashSet::with_capacity(list.len());
        for (i, p) in list.iter().enumerate() {
            if p.pk.trim().is_empty() {
                return Err(PredictionError::EmptyPk(i));
            }
            if !seen.insert(p.pk.as_str()) {
                return Err(PredictionError::DuplicatePk(p.pk.clone()));
            }
        }
        Ok(list)
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prediction {}", self.pk)
    }
}
