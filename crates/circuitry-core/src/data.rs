// DataBatch — A table of variable assignments, one row per example
//
// Values are stored row-major as f64 (categorical / bernoulli values are the
// category index). Each cell carries an "observed" flag; an unobserved cell is
// integrated out by the leaf that covers it, which turns `forward` into a
// marginal query.

use std::ops::Range;

use crate::error::{Error, Result};

/// Marker for an unobserved cell in [`DataBatch::from_dense`].
pub const UNOBSERVED: f64 = f64::NAN;

/// A batch of (possibly partial) variable assignments.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBatch {
    num_vars: usize,
    num_examples: usize,
    values: Vec<f64>,
    observed: Vec<bool>,
}

impl DataBatch {
    /// Build from rows of optional values; `None` marks an unobserved variable.
    pub fn from_rows(rows: &[Vec<Option<f64>>]) -> Result<Self> {
        let num_vars = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut values = Vec::with_capacity(rows.len() * num_vars);
        let mut observed = Vec::with_capacity(rows.len() * num_vars);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != num_vars {
                return Err(Error::Data(format!(
                    "row {i} has {} values, expected {num_vars}",
                    row.len()
                )));
            }
            for v in row {
                values.push(v.unwrap_or(0.0));
                observed.push(v.is_some());
            }
        }
        Ok(Self {
            num_vars,
            num_examples: rows.len(),
            values,
            observed,
        })
    }

    /// Build from a flat row-major buffer. NaN cells ([`UNOBSERVED`]) are unobserved.
    pub fn from_dense(num_vars: usize, values: Vec<f64>) -> Result<Self> {
        if num_vars == 0 {
            if !values.is_empty() {
                return Err(Error::Data("values given for zero variables".into()));
            }
            return Ok(Self::unobserved(0, 0));
        }
        if values.len() % num_vars != 0 {
            return Err(Error::Data(format!(
                "{} values do not divide into rows of {num_vars}",
                values.len()
            )));
        }
        let num_examples = values.len() / num_vars;
        let observed = values.iter().map(|v| !v.is_nan()).collect();
        let values = values
            .into_iter()
            .map(|v| if v.is_nan() { 0.0 } else { v })
            .collect();
        Ok(Self {
            num_vars,
            num_examples,
            values,
            observed,
        })
    }

    /// A batch with every cell unobserved.
    pub fn unobserved(num_examples: usize, num_vars: usize) -> Self {
        Self {
            num_vars,
            num_examples,
            values: vec![0.0; num_examples * num_vars],
            observed: vec![false; num_examples * num_vars],
        }
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    pub fn is_empty(&self) -> bool {
        self.num_examples == 0
    }

    /// Value of `var` in `example`, `None` when unobserved.
    pub fn get(&self, example: usize, var: usize) -> Option<f64> {
        let i = example * self.num_vars + var;
        if self.observed[i] {
            Some(self.values[i])
        } else {
            None
        }
    }

    /// Set (or clear, with `None`) one cell.
    pub fn set(&mut self, example: usize, var: usize, value: Option<f64>) {
        let i = example * self.num_vars + var;
        self.values[i] = value.unwrap_or(0.0);
        self.observed[i] = value.is_some();
    }

    pub fn row(&self, example: usize) -> Vec<Option<f64>> {
        (0..self.num_vars).map(|v| self.get(example, v)).collect()
    }

    /// Rows `range` as a new batch.
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.end > self.num_examples || range.start > range.end {
            return Err(Error::Data(format!(
                "row range {:?} out of bounds for {} examples",
                range, self.num_examples
            )));
        }
        let (lo, hi) = (range.start * self.num_vars, range.end * self.num_vars);
        Ok(Self {
            num_vars: self.num_vars,
            num_examples: range.end - range.start,
            values: self.values[lo..hi].to_vec(),
            observed: self.observed[lo..hi].to_vec(),
        })
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let mut rows = Vec::with_capacity(indices.len());
        for &i in indices {
            if i >= self.num_examples {
                return Err(Error::Data(format!(
                    "row {i} out of bounds for {} examples",
                    self.num_examples
                )));
            }
            rows.push(self.row(i));
        }
        let mut out = Self::from_rows(&rows)?;
        out.num_vars = self.num_vars;
        Ok(out)
    }

    /// Split into consecutive batches of at most `batch_size` rows.
    pub fn chunks(&self, batch_size: usize) -> Vec<Self> {
        let batch_size = batch_size.max(1);
        (0..self.num_examples)
            .step_by(batch_size)
            .map(|start| {
                let end = (start + batch_size).min(self.num_examples);
                let (lo, hi) = (start * self.num_vars, end * self.num_vars);
                Self {
                    num_vars: self.num_vars,
                    num_examples: end - start,
                    values: self.values[lo..hi].to_vec(),
                    observed: self.observed[lo..hi].to_vec(),
                }
            })
            .collect()
    }

    /// Fully observed rows as a dense row-major matrix (unobserved cells as NaN).
    pub fn to_dense(&self) -> Vec<f64> {
        self.values
            .iter()
            .zip(&self.observed)
            .map(|(v, o)| if *o { *v } else { UNOBSERVED })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_and_get() {
        let batch = DataBatch::from_rows(&[vec![Some(1.0), None], vec![Some(0.0), Some(2.5)]])
            .unwrap();
        assert_eq!(batch.num_examples(), 2);
        assert_eq!(batch.num_vars(), 2);
        assert_eq!(batch.get(0, 0), Some(1.0));
        assert_eq!(batch.get(0, 1), None);
        assert_eq!(batch.get(1, 1), Some(2.5));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let err = DataBatch::from_rows(&[vec![Some(1.0)], vec![Some(1.0), None]]).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_dense_nan_is_unobserved() {
        let batch = DataBatch::from_dense(2, vec![1.0, UNOBSERVED, 3.0, 4.0]).unwrap();
        assert_eq!(batch.num_examples(), 2);
        assert_eq!(batch.get(0, 1), None);
        assert_eq!(batch.row(1), vec![Some(3.0), Some(4.0)]);
        assert!(DataBatch::from_dense(3, vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_slice_select_chunks() {
        let batch = DataBatch::from_dense(1, vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        let s = batch.slice(1..3).unwrap();
        assert_eq!(s.to_dense(), vec![1.0, 2.0]);
        let sel = batch.select(&[4, 0]).unwrap();
        assert_eq!(sel.to_dense(), vec![4.0, 0.0]);
        let chunks = batch.chunks(2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].num_examples(), 1);
        assert!(batch.slice(3..9).is_err());
    }
}
