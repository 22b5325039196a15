//! Reference algorithms built on the aggregation protocol.

pub mod column_sum;
pub mod covariance;
pub mod kmeans;
pub mod linear_regression;
pub mod moments;
pub mod naive_bayes;
pub mod pca;

pub use column_sum::{ColumnSum, ColumnSumPartial, ColumnTotals};
pub use covariance::{Covariance, CovariancePartial, CovarianceResult, ResultId};
pub use kmeans::{Centroids, ClusterSums, InitStrategy, KMeans, KMeansRound};
pub use linear_regression::{LinearModel, LinearRegression, NormalEquations};
pub use moments::{LowOrderMoments, Moments, MomentsPartial};
pub use naive_bayes::{ClassTotals, MultinomialNaiveBayes, NaiveBayesModel};
pub use pca::{Pca, PcaMethod, PcaResult};
