//! Column-oriented containers for segment data and prediction grids

use std::collections::BTreeMap;

use ndarray::{Array1, ArrayView1};
use crate::{DsmError, Result};

/// A set of equally long, named numeric columns.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    nrows: usize,
    columns: BTreeMap<String, Array1<f64>>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Frame::insert`]
    pub fn with_column(mut self, name: &str, values: Array1<f64>) -> Result<Self> {
        self.insert(name, values)?;
        Ok(self)
    }

    /// Add or replace a column. The first column fixes the row count.
    pub fn insert(&mut self, name: &str, values: Array1<f64>) -> Result<()> {
        if !self.columns.is_empty() && values.len() != self.nrows {
            return Err(DsmError::DimensionMismatch(format!(
                "column '{}' has {} rows, frame has {}", name, values.len(), self.nrows
            )));
        }
        self.nrows = values.len();
        self.columns.insert(name.to_string(), values);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<f64>> {
        self.columns
            .get(name)
            .map(|c| c.view())
            .ok_or_else(|| DsmError::Validation(format!("missing column '{}'", name)))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }
}

/// Survey segments: the sampling units the spatial model is fitted to.
///
/// `effort` is the searched area of each segment. `stratum` selects which of
/// several detection functions applies to a segment; it is only required
/// with a stratified detection model.
#[derive(Debug, Clone)]
pub struct Segments {
    pub data: Frame,
    pub effort: Array1<f64>,
    pub response: Array1<f64>,
    pub stratum: Option<Vec<usize>>,
}

impl Segments {
    pub fn new(data: Frame, effort: Array1<f64>, response: Array1<f64>) -> Result<Self> {
        let n = effort.len();
        if response.len() != n {
            return Err(DsmError::DimensionMismatch(format!(
                "{} effort values but {} responses", n, response.len()
            )));
        }
        if data.names().next().is_some() && data.nrows() != n {
            return Err(DsmError::DimensionMismatch(format!(
                "{} effort values but {} covariate rows", n, data.nrows()
            )));
        }
        if effort.iter().any(|&a| !(a > 0.0) || !a.is_finite()) {
            return Err(DsmError::Validation("segment effort must be positive and finite".to_string()));
        }
        if response.iter().any(|&y| !y.is_finite() || y < 0.0) {
            return Err(DsmError::Validation("segment responses must be non-negative".to_string()));
        }
        Ok(Self {
            data,
            effort,
            response,
            stratum: None,
        })
    }

    pub fn with_strata(mut self, stratum: Vec<usize>) -> Result<Self> {
        if stratum.len() != self.len() {
            return Err(DsmError::DimensionMismatch(format!(
                "{} stratum labels for {} segments", stratum.len(), self.len()
            )));
        }
        self.stratum = Some(stratum);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.effort.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effort.is_empty()
    }
}

/// Cells over which abundance is predicted; `offset` is the cell area.
#[derive(Debug, Clone)]
pub struct PredictionGrid {
    pub data: Frame,
    pub offset: Array1<f64>,
}

impl PredictionGrid {
    pub fn new(data: Frame, offset: Array1<f64>) -> Result<Self> {
        if data.nrows() != offset.len() {
            return Err(DsmError::Validation(format!(
                "prediction grid has {} rows but {} offsets", data.nrows(), offset.len()
            )));
        }
        if offset.iter().any(|&a| !(a >= 0.0) || !a.is_finite()) {
            return Err(DsmError::Validation("prediction offsets must be non-negative".to_string()));
        }
        Ok(Self { data, offset })
    }

    pub fn len(&self) -> usize {
        self.offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offset.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_ragged_columns() {
        let frame = Frame::new()
            .with_column("x", Array1::linspace(0.0, 1.0, 5))
            .unwrap();
        let err = frame.clone().with_column("y", Array1::zeros(4)).unwrap_err();
        assert!(matches!(err, DsmError::DimensionMismatch(_)));
        assert!(frame.has_column("x"));
        assert!(!frame.has_column("z"));
        assert!(matches!(frame.column("z"), Err(DsmError::Validation(_))));
    }

    #[test]
    fn test_grid_offset_length_checked() {
        let frame = Frame::new().with_column("x", Array1::zeros(3)).unwrap();
        assert!(PredictionGrid::new(frame.clone(), Array1::ones(3)).is_ok());
        assert!(matches!(
            PredictionGrid::new(frame, Array1::ones(2)),
            Err(DsmError::Validation(_))
        ));
    }

    #[test]
    fn test_segments_validate_effort() {
        let frame = Frame::new().with_column("x", Array1::zeros(2)).unwrap();
        let bad = Segments::new(frame, Array1::from_vec(vec![1.0, 0.0]), Array1::zeros(2));
        assert!(bad.is_err());
    }
}
