//! Multinomial naive Bayes.

use serde::{Deserialize, Serialize};

use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::{Aggregation, PartialResult};

#[derive(Debug, Clone)]
pub struct MultinomialNaiveBayes {
    pub n_classes: usize,
    /// Additive smoothing; 1 is Laplace, below 1 is Lidstone
    pub alpha: f64,
}

impl MultinomialNaiveBayes {
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            alpha: 1.0,
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    fn class_of(&self, partition: usize, row: usize, label: f64) -> AggResult<usize> {
        if label.fract() != 0.0 || label < 0.0 || label >= self.n_classes as f64 {
            return Err(AggregationError::data_shape(
                partition,
                format!(
                    "row {}: label {} is not a class id in 0..{}",
                    row, label, self.n_classes
                ),
            ));
        }
        Ok(label as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassTotals {
    pub features: usize,
    pub class_counts: Vec<u64>,
    /// Row-major `n_classes x features`
    pub feature_totals: Vec<f64>,
}

impl PartialResult for ClassTotals {
    fn row_count(&self) -> u64 {
        self.class_counts.iter().sum()
    }

    fn num_features(&self) -> usize {
        self.features
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaiveBayesModel {
    pub n_classes: usize,
    pub log_priors: Vec<f64>,
    /// Row-major `n_classes x features`
    pub log_likelihoods: Vec<f64>,
}

impl NaiveBayesModel {
    pub fn num_features(&self) -> usize {
        self.log_likelihoods.len() / self.n_classes
    }

    /// Unnormalized log posterior of every class.
    pub fn scores(&self, row: &[f64]) -> Vec<f64> {
        let p = self.num_features();
        (0..self.n_classes)
            .map(|c| {
                let likelihoods = &self.log_likelihoods[c * p..(c + 1) * p];
                self.log_priors[c]
                    + row
                        .iter()
                        .zip(likelihoods)
                        .filter(|(x, _)| **x != 0.0)
                        .map(|(x, l)| x * l)
                        .sum::<f64>()
            })
            .collect()
    }

    /// Most probable class; ties go to the lower class id.
    pub fn predict(&self, row: &[f64]) -> usize {
        let scores = self.scores(row);
        let mut best = 0;
        for (c, score) in scores.iter().enumerate() {
            if *score > scores[best] {
                best = c;
            }
        }
        best
    }

    pub fn predict_partition(&self, partition: &DataPartition) -> AggResult<Vec<usize>> {
        partition.ensure_features(self.num_features())?;
        let mut out = Vec::with_capacity(partition.num_rows());
        partition.for_each_row(|_, row| out.push(self.predict(row)));
        Ok(out)
    }
}

impl Aggregation for MultinomialNaiveBayes {
    type Partial = ClassTotals;
    type Output = NaiveBayesModel;

    fn name(&self) -> &str {
        "multinomial_naive_bayes"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<ClassTotals> {
        if self.n_classes == 0 {
            return Err(AggregationError::invalid_parameter(
                "naive Bayes needs at least one class",
            ));
        }
        partition.ensure_non_empty()?;
        let labels = partition.require_labels()?;
        let p = partition.num_cols();
        let index = partition.index();

        let classes = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| self.class_of(index, i, label))
            .collect::<AggResult<Vec<_>>>()?;

        let mut class_counts = vec![0u64; self.n_classes];
        let mut feature_totals = vec![0.0; self.n_classes * p];
        let mut negative = None;
        partition.for_each_row(|i, row| {
            let c = classes[i];
            class_counts[c] += 1;
            for (j, &x) in row.iter().enumerate() {
                if x < 0.0 && negative.is_none() {
                    negative = Some((i, j, x));
                }
                feature_totals[c * p + j] += x;
            }
        });
        if let Some((row, column, value)) = negative {
            return Err(AggregationError::data_shape(
                index,
                format!(
                    "row {} column {}: negative count {} in multinomial data",
                    row, column, value
                ),
            ));
        }

        Ok(ClassTotals {
            features: p,
            class_counts,
            feature_totals,
        })
    }

    fn merge(&self, left: ClassTotals, right: ClassTotals) -> AggResult<ClassTotals> {
        if left.features != right.features {
            return Err(AggregationError::feature_mismatch(
                left.features,
                right.features,
            ));
        }
        if left.class_counts.len() != right.class_counts.len() {
            return Err(AggregationError::invalid_parameter(format!(
                "cannot merge totals over {} and {} classes",
                left.class_counts.len(),
                right.class_counts.len()
            )));
        }
        let mut merged = left;
        for (a, b) in merged.class_counts.iter_mut().zip(&right.class_counts) {
            *a += b;
        }
        for (a, b) in merged.feature_totals.iter_mut().zip(&right.feature_totals) {
            *a += b;
        }
        Ok(merged)
    }

    fn finalize(&self, merged: ClassTotals) -> AggResult<NaiveBayesModel> {
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(AggregationError::invalid_parameter(format!(
                "smoothing alpha must be positive, got {}",
                self.alpha
            )));
        }
        let p = merged.features;
        if merged.class_counts.len() != self.n_classes
            || merged.feature_totals.len() != self.n_classes * p
        {
            return Err(AggregationError::invalid_parameter(format!(
                "totals cover {} classes, the model expects {}",
                merged.class_counts.len(),
                self.n_classes
            )));
        }
        let total: u64 = merged.class_counts.iter().sum();
        let log_priors = merged
            .class_counts
            .iter()
            .map(|&count| (count as f64 / total as f64).ln())
            .collect();

        let mut log_likelihoods = Vec::with_capacity(self.n_classes * p);
        for c in 0..self.n_classes {
            let row = &merged.feature_totals[c * p..(c + 1) * p];
            let denominator = row.iter().sum::<f64>() + self.alpha * p as f64;
            log_likelihoods.extend(
                row.iter().map(|t| ((t + self.alpha) / denominator).ln()),
            );
        }

        Ok(NaiveBayesModel {
            n_classes: self.n_classes,
            log_priors,
            log_likelihoods,
        })
    }
}
