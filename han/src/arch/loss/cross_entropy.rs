use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;
use crate::{HanErr, Result};

/// Softmax cross entropy over raw logits, averaged over the rows.
#[derive(Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }
}

fn softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = logits.to_owned();

    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    probs
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let nrows = y_pred.nrows();
        if nrows == 0 {
            return 0.0;
        }

        let log_probs = softmax_rows(y_pred).mapv(|p| p.max(f32::MIN_POSITIVE).ln());
        -(&log_probs * &y).sum() / nrows as f32
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let nrows = y_pred.nrows().max(1);
        (softmax_rows(y_pred) - &y) / nrows as f32
    }
}

/// Encodes class labels as one hot rows.
///
/// # Returns
/// An error if a label is not below `classes`.
pub fn one_hot(labels: &[usize], classes: usize) -> Result<Array2<f32>> {
    let mut y = Array2::zeros((labels.len(), classes));

    for (i, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(HanErr::UnknownLabel { label, classes });
        }
        y[[i, label]] = 1.0;
    }

    Ok(y)
}
