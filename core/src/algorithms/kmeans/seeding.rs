//! Initial centroid selection.
//!
//! Every strategy works from global row numbers: rows are numbered in
//! partition-index order and then in row order inside a partition. Random
//! choices are made on that numbering with a seeded [`ChaCha8Rng`], so the
//! chosen rows depend only on the seed and the data, not on how the rows are
//! split into partitions. Each step that has to look at the data is a small
//! aggregation pass of its own.

use std::collections::{BTreeMap, BTreeSet};

use rand::prelude::*;
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Centroids, KMeans, squared_distance};
use crate::aggregator::DistributedAggregator;
use crate::error::{AggResult, AggregationError};
use crate::partition::DataPartition;
use crate::traits::{Aggregation, PartialResult};

/// Strategy used to seed initial centroids.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitStrategy {
    /// The first `k` rows
    #[default]
    FirstRows,
    /// `k` distinct rows chosen uniformly at random
    Random,
    /// D²-weighted sequential choice (Arthur and Vassilvitskii)
    #[serde(alias = "kmeans++", alias = "k-means++")]
    KMeansPlusPlus,
    /// Oversampling rounds followed by weighted k-means++ on the candidates
    /// (Bahmani et al.)
    Parallel { oversampling: f64, rounds: usize },
}

impl InitStrategy {
    /// k-means|| with oversampling factor `2k` and 5 rounds.
    pub fn parallel_for(k: usize) -> Self {
        InitStrategy::Parallel {
            oversampling: 2.0 * k as f64,
            rounds: 5,
        }
    }
}

pub(super) fn seed_centroids(
    kmeans: &KMeans,
    aggregator: &DistributedAggregator,
    partitions: &[DataPartition],
) -> AggResult<Centroids> {
    let layout = aggregator.run(&LayoutPass, partitions)?;
    let k = kmeans.k;
    if layout.total < k as u64 {
        return Err(AggregationError::invalid_parameter(format!(
            "cannot seed {} centroids from {} rows",
            k, layout.total
        )));
    }
    debug!(k, rows = layout.total, strategy = ?kmeans.init, "seeding centroids");

    let mut rng = ChaCha8Rng::seed_from_u64(kmeans.seed);
    let rows = match kmeans.init {
        InitStrategy::FirstRows => {
            let wanted: Vec<u64> = (0..k as u64).collect();
            gather(aggregator, partitions, &layout, &wanted)?
        }
        InitStrategy::Random => {
            let wanted: Vec<u64> = sample(&mut rng, layout.total as usize, k)
                .into_iter()
                .map(|i| i as u64)
                .collect();
            gather(aggregator, partitions, &layout, &wanted)?
        }
        InitStrategy::KMeansPlusPlus => {
            let first = rng.gen_range(0..layout.total);
            let mut chosen = gather(aggregator, partitions, &layout, &[first])?;
            while chosen.len() < k {
                let centers = Centroids::from_rows(chosen.clone())?;
                let next = pick_weighted(aggregator, partitions, &centers, &mut rng, k)?;
                chosen.push(next);
            }
            chosen
        }
        InitStrategy::Parallel {
            oversampling,
            rounds,
        } => {
            if !oversampling.is_finite() || oversampling <= 0.0 || rounds == 0 {
                return Err(AggregationError::invalid_parameter(format!(
                    "k-means|| needs a positive oversampling factor and at least one round, got {} and {}",
                    oversampling, rounds
                )));
            }
            let first = rng.gen_range(0..layout.total);
            let mut candidates = gather(aggregator, partitions, &layout, &[first])?;
            for round in 0..rounds {
                let centers = Centroids::from_rows(candidates.clone())?;
                let pass = CostPass {
                    centers: centers.clone(),
                };
                let cost = aggregator.run(&pass, partitions)?;
                let phi: f64 = cost.values().sum();
                if phi <= 0.0 {
                    break;
                }
                let pass = Oversample {
                    layout: layout.clone(),
                    centers,
                    factor: oversampling / phi,
                    stream_seed: rng.next_u64(),
                };
                let picked = aggregator.run(&pass, partitions)?;
                debug!(round, picked = picked.len(), phi, "k-means|| oversampling round");
                candidates.extend(picked.into_values());
            }
            if candidates.len() < k {
                return Err(AggregationError::invalid_parameter(format!(
                    "k-means|| produced {} candidates for k = {}",
                    candidates.len(),
                    k
                )));
            }
            let centers = Centroids::from_rows(candidates.clone())?;
            let weights = aggregator.run(&WeightPass { centers }, partitions)?;
            weighted_plus_plus(&candidates, &weights, k, &mut rng)?
        }
    };

    Centroids::from_rows(rows)
}

/// Fetch rows by global number; output follows the order of `wanted`.
fn gather(
    aggregator: &DistributedAggregator,
    partitions: &[DataPartition],
    layout: &Layout,
    wanted: &[u64],
) -> AggResult<Vec<Vec<f64>>> {
    let pass = GatherPass {
        layout: layout.clone(),
        wanted: wanted.iter().copied().collect(),
    };
    let mut found = aggregator.run(&pass, partitions)?;
    wanted
        .iter()
        .map(|g| {
            found.remove(g).ok_or_else(|| {
                AggregationError::invalid_parameter(format!("row {} not found in any partition", g))
            })
        })
        .collect()
}

/// One D²-weighted draw: a cost pass to locate the partition, then a pass
/// that walks that partition's rows.
fn pick_weighted(
    aggregator: &DistributedAggregator,
    partitions: &[DataPartition],
    centers: &Centroids,
    rng: &mut ChaCha8Rng,
    k: usize,
) -> AggResult<Vec<f64>> {
    let pass = CostPass {
        centers: centers.clone(),
    };
    let costs = aggregator.run(&pass, partitions)?;
    let phi: f64 = costs.values().sum();
    if phi <= 0.0 {
        return Err(AggregationError::invalid_parameter(format!(
            "cannot seed {} centroids: every row coincides with one of the {} already chosen",
            k, centers.k
        )));
    }

    let mut target = rng.r#gen::<f64>() * phi;
    let mut partition = None;
    for (&index, &cost) in &costs {
        if cost <= 0.0 {
            continue;
        }
        partition = Some(index);
        if target < cost {
            break;
        }
        target -= cost;
    }
    let partition = partition.ok_or_else(|| AggregationError::numerical("no row carries weight"))?;

    let pass = WalkPass {
        partition,
        target,
        centers: centers.clone(),
    };
    aggregator
        .run(&pass, partitions)?
        .ok_or_else(|| AggregationError::numerical("weighted draw found no row"))
}

/// Weighted k-means++ over the k-means|| candidates, run on the driver.
fn weighted_plus_plus(
    candidates: &[Vec<f64>],
    weights: &[u64],
    k: usize,
    rng: &mut ChaCha8Rng,
) -> AggResult<Vec<Vec<f64>>> {
    let draw = |scores: &[f64], rng: &mut ChaCha8Rng| -> Option<usize> {
        let total: f64 = scores.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let mut target = rng.r#gen::<f64>() * total;
        let mut last = None;
        for (i, &s) in scores.iter().enumerate() {
            if s <= 0.0 {
                continue;
            }
            last = Some(i);
            if target < s {
                return Some(i);
            }
            target -= s;
        }
        last
    };

    let mass: Vec<f64> = weights.iter().map(|&w| w as f64).collect();
    let first = draw(&mass, &mut *rng)
        .ok_or_else(|| AggregationError::numerical("k-means|| candidates carry no weight"))?;
    let mut chosen = vec![candidates[first].clone()];
    let mut nearest: Vec<f64> = candidates
        .iter()
        .map(|c| squared_distance(c, &chosen[0]))
        .collect();

    while chosen.len() < k {
        let scores: Vec<f64> = nearest.iter().zip(&mass).map(|(d, w)| d * w).collect();
        let next = draw(&scores, &mut *rng).ok_or_else(|| {
            AggregationError::invalid_parameter(format!(
                "k-means|| candidates hold fewer than {} distinct weighted rows",
                k
            ))
        })?;
        let picked = candidates[next].clone();
        for (d, c) in nearest.iter_mut().zip(candidates) {
            *d = d.min(squared_distance(c, &picked));
        }
        chosen.push(picked);
    }
    Ok(chosen)
}

/// Row count of every partition, keyed by partition index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayoutPartial {
    features: usize,
    rows: BTreeMap<usize, u64>,
}

impl PartialResult for LayoutPartial {
    fn row_count(&self) -> u64 {
        self.rows.values().sum()
    }

    fn num_features(&self) -> usize {
        self.features
    }
}

/// First global row number of every partition.
#[derive(Debug, Clone)]
struct Layout {
    offsets: BTreeMap<usize, u64>,
    total: u64,
}

impl Layout {
    fn offset(&self, partition: usize) -> AggResult<u64> {
        self.offsets.get(&partition).copied().ok_or_else(|| {
            AggregationError::invalid_parameter(format!("partition {} was not laid out", partition))
        })
    }
}

#[derive(Debug)]
struct LayoutPass;

impl Aggregation for LayoutPass {
    type Partial = LayoutPartial;
    type Output = Layout;

    fn name(&self) -> &str {
        "kmeans_layout"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<LayoutPartial> {
        partition.ensure_non_empty()?;
        Ok(LayoutPartial {
            features: partition.num_cols(),
            rows: BTreeMap::from([(partition.index(), partition.num_rows() as u64)]),
        })
    }

    fn merge(&self, left: LayoutPartial, right: LayoutPartial) -> AggResult<LayoutPartial> {
        let mut merged = left;
        for (index, rows) in right.rows {
            if merged.rows.insert(index, rows).is_some() {
                return Err(AggregationError::invalid_parameter(format!(
                    "partition index {} appears more than once",
                    index
                )));
            }
        }
        Ok(merged)
    }

    fn finalize(&self, merged: LayoutPartial) -> AggResult<Layout> {
        let mut offsets = BTreeMap::new();
        let mut total = 0;
        for (index, rows) in merged.rows {
            offsets.insert(index, total);
            total += rows;
        }
        Ok(Layout { offsets, total })
    }
}

/// Rows keyed by global row number.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RowSample {
    features: usize,
    rows: u64,
    picked: BTreeMap<u64, Vec<f64>>,
}

impl PartialResult for RowSample {
    fn row_count(&self) -> u64 {
        self.rows
    }

    fn num_features(&self) -> usize {
        self.features
    }
}

fn merge_samples(left: RowSample, right: RowSample) -> RowSample {
    let mut merged = left;
    merged.rows += right.rows;
    merged.picked.extend(right.picked);
    merged
}

#[derive(Debug)]
struct GatherPass {
    layout: Layout,
    wanted: BTreeSet<u64>,
}

impl Aggregation for GatherPass {
    type Partial = RowSample;
    type Output = BTreeMap<u64, Vec<f64>>;

    fn name(&self) -> &str {
        "kmeans_gather"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<RowSample> {
        let offset = self.layout.offset(partition.index())?;
        let end = offset + partition.num_rows() as u64;
        let mut picked = BTreeMap::new();
        for &g in self.wanted.range(offset..end) {
            if let Some(row) = partition.row((g - offset) as usize) {
                picked.insert(g, row);
            }
        }
        Ok(RowSample {
            features: partition.num_cols(),
            rows: partition.num_rows() as u64,
            picked,
        })
    }

    fn merge(&self, left: RowSample, right: RowSample) -> AggResult<RowSample> {
        Ok(merge_samples(left, right))
    }

    fn finalize(&self, merged: RowSample) -> AggResult<BTreeMap<u64, Vec<f64>>> {
        Ok(merged.picked)
    }
}

/// Sum of squared distances to the nearest center, per partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CostPartial {
    features: usize,
    rows: u64,
    by_partition: BTreeMap<usize, f64>,
}

impl PartialResult for CostPartial {
    fn row_count(&self) -> u64 {
        self.rows
    }

    fn num_features(&self) -> usize {
        self.features
    }
}

#[derive(Debug)]
struct CostPass {
    centers: Centroids,
}

impl Aggregation for CostPass {
    type Partial = CostPartial;
    type Output = BTreeMap<usize, f64>;

    fn name(&self) -> &str {
        "kmeans_cost"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<CostPartial> {
        partition.ensure_features(self.centers.dim)?;
        let mut cost = 0.0;
        partition.for_each_row(|_, row| cost += self.centers.nearest(row).1);
        Ok(CostPartial {
            features: partition.num_cols(),
            rows: partition.num_rows() as u64,
            by_partition: BTreeMap::from([(partition.index(), cost)]),
        })
    }

    fn merge(&self, left: CostPartial, right: CostPartial) -> AggResult<CostPartial> {
        let mut merged = left;
        merged.rows += right.rows;
        merged.by_partition.extend(right.by_partition);
        Ok(merged)
    }

    fn finalize(&self, merged: CostPartial) -> AggResult<BTreeMap<usize, f64>> {
        Ok(merged.by_partition)
    }
}

/// Walks one partition's rows until the cumulative cost passes `target`.
#[derive(Debug)]
struct WalkPass {
    partition: usize,
    target: f64,
    centers: Centroids,
}

impl Aggregation for WalkPass {
    type Partial = RowSample;
    type Output = Option<Vec<f64>>;

    fn name(&self) -> &str {
        "kmeans_weighted_draw"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<RowSample> {
        let mut picked = BTreeMap::new();
        if partition.index() == self.partition {
            partition.ensure_features(self.centers.dim)?;
            let mut remaining = self.target;
            let mut last_positive = None;
            let mut found = None;
            partition.for_each_row(|i, row| {
                if found.is_some() {
                    return;
                }
                let d = self.centers.nearest(row).1;
                if d <= 0.0 {
                    return;
                }
                last_positive = Some(i);
                if remaining < d {
                    found = Some(i);
                } else {
                    remaining -= d;
                }
            });
            // Rounding can leave the target just past the last row
            if let Some(i) = found.or(last_positive) {
                if let Some(row) = partition.row(i) {
                    picked.insert(i as u64, row);
                }
            }
        }
        Ok(RowSample {
            features: partition.num_cols(),
            rows: partition.num_rows() as u64,
            picked,
        })
    }

    fn merge(&self, left: RowSample, right: RowSample) -> AggResult<RowSample> {
        Ok(merge_samples(left, right))
    }

    fn finalize(&self, merged: RowSample) -> AggResult<Option<Vec<f64>>> {
        Ok(merged.picked.into_values().next())
    }
}

/// Keeps each row independently with probability `min(1, factor * d²)`.
#[derive(Debug)]
struct Oversample {
    layout: Layout,
    centers: Centroids,
    factor: f64,
    stream_seed: u64,
}

impl Aggregation for Oversample {
    type Partial = RowSample;
    type Output = BTreeMap<u64, Vec<f64>>;

    fn name(&self) -> &str {
        "kmeans_oversample"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<RowSample> {
        partition.ensure_features(self.centers.dim)?;
        let offset = self.layout.offset(partition.index())?;
        let mut picked = BTreeMap::new();
        partition.for_each_row(|i, row| {
            let d = self.centers.nearest(row).1;
            if d <= 0.0 {
                return;
            }
            let g = offset + i as u64;
            // One stream per global row keeps the draw independent of the split
            let mut rng = ChaCha8Rng::seed_from_u64(self.stream_seed);
            rng.set_stream(g);
            if rng.r#gen::<f64>() < (self.factor * d).min(1.0) {
                picked.insert(g, row.to_vec());
            }
        });
        Ok(RowSample {
            features: partition.num_cols(),
            rows: partition.num_rows() as u64,
            picked,
        })
    }

    fn merge(&self, left: RowSample, right: RowSample) -> AggResult<RowSample> {
        Ok(merge_samples(left, right))
    }

    fn finalize(&self, merged: RowSample) -> AggResult<BTreeMap<u64, Vec<f64>>> {
        Ok(merged.picked)
    }
}

/// Number of rows closest to each candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WeightPartial {
    features: usize,
    rows: u64,
    weights: Vec<u64>,
}

impl PartialResult for WeightPartial {
    fn row_count(&self) -> u64 {
        self.rows
    }

    fn num_features(&self) -> usize {
        self.features
    }
}

#[derive(Debug)]
struct WeightPass {
    centers: Centroids,
}

impl Aggregation for WeightPass {
    type Partial = WeightPartial;
    type Output = Vec<u64>;

    fn name(&self) -> &str {
        "kmeans_candidate_weights"
    }

    fn local_compute(&self, partition: &DataPartition) -> AggResult<WeightPartial> {
        partition.ensure_features(self.centers.dim)?;
        let mut weights = vec![0u64; self.centers.k];
        partition.for_each_row(|_, row| weights[self.centers.nearest(row).0] += 1);
        Ok(WeightPartial {
            features: partition.num_cols(),
            rows: partition.num_rows() as u64,
            weights,
        })
    }

    fn merge(&self, left: WeightPartial, right: WeightPartial) -> AggResult<WeightPartial> {
        let mut merged = left;
        merged.rows += right.rows;
        for (a, b) in merged.weights.iter_mut().zip(&right.weights) {
            *a += b;
        }
        Ok(merged)
    }

    fn finalize(&self, merged: WeightPartial) -> AggResult<Vec<u64>> {
        Ok(merged.weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::split_rows;
    use sumstat_common::{AggregationConfig, ReduceStrategy};

    fn aggregator() -> DistributedAggregator {
        DistributedAggregator::new(AggregationConfig {
            parallelism: 2,
            reduce_strategy: ReduceStrategy::Tree,
            ..Default::default()
        })
        .unwrap()
    }

    fn rows() -> Vec<Vec<f64>> {
        (0..12)
            .map(|i| {
                let base = match i % 3 {
                    0 => 0.0,
                    1 => 50.0,
                    _ => 100.0,
                };
                vec![base + i as f64 * 0.25, base]
            })
            .collect()
    }

    fn seed_with(strategy: InitStrategy, partitions: usize) -> Centroids {
        let kmeans = KMeans::new(3).with_init(strategy).with_seed(7);
        let partitions = split_rows(rows(), partitions).unwrap();
        seed_centroids(&kmeans, &aggregator(), &partitions).unwrap()
    }

    #[test]
    fn test_first_rows() {
        let centroids = seed_with(InitStrategy::FirstRows, 4);
        assert_eq!(centroids.rows(), rows()[..3].to_vec());
    }

    #[test]
    fn test_strategies_ignore_the_split() {
        for strategy in [
            InitStrategy::Random,
            InitStrategy::KMeansPlusPlus,
            InitStrategy::parallel_for(3),
        ] {
            let one = seed_with(strategy, 1);
            assert_eq!(one.k, 3);
            assert_eq!(one, seed_with(strategy, 3), "{:?}", strategy);
            assert_eq!(one, seed_with(strategy, 5), "{:?}", strategy);
        }
    }

    #[test]
    fn test_plus_plus_spreads_centers() {
        let centroids = seed_with(InitStrategy::KMeansPlusPlus, 2);
        let mut bases: Vec<f64> = centroids.rows().iter().map(|r| r[1]).collect();
        bases.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(bases, vec![0.0, 50.0, 100.0]);
    }

    #[test]
    fn test_too_few_rows() {
        let kmeans = KMeans::new(20);
        let err = seed_centroids(&kmeans, &aggregator(), &split_rows(rows(), 2).unwrap())
            .unwrap_err();
        assert!(matches!(err, AggregationError::InvalidParameter(_)));
    }

    #[test]
    fn test_duplicate_partition_index() {
        let a = DataPartition::from_rows(0, vec![vec![1.0]]).unwrap();
        let b = DataPartition::from_rows(0, vec![vec![2.0]]).unwrap();
        let err = aggregator().run(&LayoutPass, &[a, b]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
