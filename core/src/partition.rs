//! Data partitions
//!
//! A [`DataPartition`] is one independently loaded shard of the input. It is
//! immutable once built; algorithms only ever read it. Partitions are built
//! from in-memory rows, compressed sparse rows, or CSV text.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sumstat_common::error::context::ErrorContext;

use crate::error::{AggResult, AggregationError};

/// Numeric payload of a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NumericTable {
    /// Row-major dense matrix.
    Dense {
        rows: usize,
        cols: usize,
        values: Vec<f64>,
    },
    /// Compressed sparse rows with 0-based column indices.
    Csr {
        rows: usize,
        cols: usize,
        values: Vec<f64>,
        col_indices: Vec<usize>,
        row_offsets: Vec<usize>,
    },
}

impl NumericTable {
    pub fn num_rows(&self) -> usize {
        match self {
            NumericTable::Dense { rows, .. } | NumericTable::Csr { rows, .. } => *rows,
        }
    }

    pub fn num_cols(&self) -> usize {
        match self {
            NumericTable::Dense { cols, .. } | NumericTable::Csr { cols, .. } => *cols,
        }
    }

    /// Visit every row as a dense slice, in row order.
    ///
    /// Sparse rows are expanded into a scratch buffer that is reused between
    /// calls, so the slice is only valid for the duration of the callback.
    pub fn for_each_row<F>(&self, mut f: F)
    where
        F: FnMut(usize, &[f64]),
    {
        match self {
            NumericTable::Dense { rows, cols, values } => {
                if *cols == 0 {
                    for i in 0..*rows {
                        f(i, &[]);
                    }
                    return;
                }
                for (i, row) in values.chunks_exact(*cols).enumerate() {
                    f(i, row);
                }
            }
            NumericTable::Csr {
                rows,
                cols,
                values,
                col_indices,
                row_offsets,
            } => {
                let mut scratch = vec![0.0; *cols];
                for i in 0..*rows {
                    scratch.iter_mut().for_each(|v| *v = 0.0);
                    for k in row_offsets[i]..row_offsets[i + 1] {
                        scratch[col_indices[k]] = values[k];
                    }
                    f(i, &scratch);
                }
            }
        }
    }

    /// Copy of row `i` as a dense vector.
    pub fn row(&self, i: usize) -> Option<Vec<f64>> {
        if i >= self.num_rows() {
            return None;
        }
        match self {
            NumericTable::Dense { cols, values, .. } => {
                Some(values[i * cols..(i + 1) * cols].to_vec())
            }
            NumericTable::Csr {
                cols,
                values,
                col_indices,
                row_offsets,
                ..
            } => {
                let mut row = vec![0.0; *cols];
                for k in row_offsets[i]..row_offsets[i + 1] {
                    row[col_indices[k]] = values[k];
                }
                Some(row)
            }
        }
    }
}

/// Options for CSV loading.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// Skip the first record
    pub has_header: bool,
    /// Field delimiter
    pub delimiter: u8,
    /// Column holding the per-row label; removed from the features
    pub label_column: Option<usize>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            has_header: false,
            delimiter: b',',
            label_column: None,
        }
    }
}

impl CsvOptions {
    pub fn with_header(mut self) -> Self {
        self.has_header = true;
        self
    }

    pub fn with_label_column(mut self, column: usize) -> Self {
        self.label_column = Some(column);
        self
    }
}

/// One shard of the input dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPartition {
    index: usize,
    table: NumericTable,
    labels: Option<Vec<f64>>,
}

impl DataPartition {
    /// Build a dense partition from rows. Every row must have the same length.
    pub fn from_rows(index: usize, rows: Vec<Vec<f64>>) -> AggResult<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut values = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(AggregationError::data_shape(
                    index,
                    format!("row {} has {} columns, expected {}", i, row.len(), cols),
                ));
            }
            values.extend_from_slice(row);
        }

        Ok(Self {
            index,
            table: NumericTable::Dense {
                rows: rows.len(),
                cols,
                values,
            },
            labels: None,
        })
    }

    /// Build a dense partition from a row-major buffer.
    pub fn from_dense(index: usize, cols: usize, values: Vec<f64>) -> AggResult<Self> {
        if cols == 0 || values.len() % cols != 0 {
            return Err(AggregationError::data_shape(
                index,
                format!("{} values cannot be laid out in {} columns", values.len(), cols),
            ));
        }
        Ok(Self {
            index,
            table: NumericTable::Dense {
                rows: values.len() / cols,
                cols,
                values,
            },
            labels: None,
        })
    }

    /// Build a sparse partition from CSR triples.
    pub fn from_csr(
        index: usize,
        cols: usize,
        values: Vec<f64>,
        col_indices: Vec<usize>,
        row_offsets: Vec<usize>,
    ) -> AggResult<Self> {
        if values.len() != col_indices.len() {
            return Err(AggregationError::data_shape(
                index,
                format!(
                    "{} values but {} column indices",
                    values.len(),
                    col_indices.len()
                ),
            ));
        }
        if row_offsets.first() != Some(&0) || row_offsets.last() != Some(&values.len()) {
            return Err(AggregationError::data_shape(
                index,
                "row offsets must start at 0 and end at the number of values",
            ));
        }
        if row_offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(AggregationError::data_shape(
                index,
                "row offsets must be non-decreasing",
            ));
        }
        if let Some(bad) = col_indices.iter().find(|&&c| c >= cols) {
            return Err(AggregationError::data_shape(
                index,
                format!("column index {} out of range for {} columns", bad, cols),
            ));
        }

        Ok(Self {
            index,
            table: NumericTable::Csr {
                rows: row_offsets.len() - 1,
                cols,
                values,
                col_indices,
                row_offsets,
            },
            labels: None,
        })
    }

    /// Parse CSV text into a dense partition.
    pub fn from_csv_str(index: usize, text: &str, options: &CsvOptions) -> AggResult<Self> {
        Self::from_csv_reader(index, text.as_bytes(), options)
    }

    /// Read a CSV file into a dense partition.
    pub fn from_csv_path(
        index: usize,
        path: impl AsRef<Path>,
        options: &CsvOptions,
    ) -> AggResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_io_context(|| format!("cannot open partition {} at {}", index, path.display()))?;
        Self::from_csv_reader(index, file, options)
    }

    fn from_csv_reader<R: std::io::Read>(
        index: usize,
        reader: R,
        options: &CsvOptions,
    ) -> AggResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(options.has_header)
            .delimiter(options.delimiter)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for record in reader.records() {
            let record = record
                .map_err(|e| AggregationError::data_shape(index, format!("CSV error: {}", e)))?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let mut row = Vec::with_capacity(record.len());
            for (column, field) in record.iter().enumerate() {
                let value: f64 = field.parse().map_err(|_| {
                    AggregationError::data_shape(
                        index,
                        format!("line {}: column {} is not numeric: '{}'", line, column, field),
                    )
                })?;
                if options.label_column == Some(column) {
                    labels.push(value);
                } else {
                    row.push(value);
                }
            }
            if let Some(column) = options.label_column {
                if labels.len() != rows.len() + 1 {
                    return Err(AggregationError::data_shape(
                        index,
                        format!("line {}: missing label column {}", line, column),
                    ));
                }
            }
            rows.push(row);
        }

        let partition = Self::from_rows(index, rows)?;
        match options.label_column {
            Some(_) => partition.with_labels(labels),
            None => Ok(partition),
        }
    }

    /// Attach one label per row.
    pub fn with_labels(mut self, labels: Vec<f64>) -> AggResult<Self> {
        if labels.len() != self.num_rows() {
            return Err(AggregationError::data_shape(
                self.index,
                format!(
                    "{} labels supplied for {} rows",
                    labels.len(),
                    self.num_rows()
                ),
            ));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn table(&self) -> &NumericTable {
        &self.table
    }

    pub fn num_rows(&self) -> usize {
        self.table.num_rows()
    }

    pub fn num_cols(&self) -> usize {
        self.table.num_cols()
    }

    pub fn labels(&self) -> Option<&[f64]> {
        self.labels.as_deref()
    }

    pub fn for_each_row<F>(&self, f: F)
    where
        F: FnMut(usize, &[f64]),
    {
        self.table.for_each_row(f)
    }

    pub fn row(&self, i: usize) -> Option<Vec<f64>> {
        self.table.row(i)
    }

    /// Fails with a `DataShape` error when the partition has no rows.
    pub fn ensure_non_empty(&self) -> AggResult<()> {
        if self.num_rows() == 0 || self.num_cols() == 0 {
            return Err(AggregationError::data_shape(self.index, "empty partition"));
        }
        Ok(())
    }

    /// Fails with a `DataShape` error unless the partition has `expected` columns.
    pub fn ensure_features(&self, expected: usize) -> AggResult<()> {
        if self.num_cols() != expected {
            return Err(AggregationError::data_shape(
                self.index,
                format!("expected {} columns, found {}", expected, self.num_cols()),
            ));
        }
        Ok(())
    }

    /// Labels, or a `DataShape` error when none were attached.
    pub fn require_labels(&self) -> AggResult<&[f64]> {
        self.labels()
            .ok_or_else(|| AggregationError::data_shape(self.index, "partition has no labels"))
    }
}

/// Split rows into `num_partitions` contiguous partitions, preserving order.
///
/// Sizes differ by at most one row; earlier partitions take the remainder.
pub fn split_rows(rows: Vec<Vec<f64>>, num_partitions: usize) -> AggResult<Vec<DataPartition>> {
    split_inner(rows, None, num_partitions)
}

/// Like [`split_rows`], carrying one label per row along.
pub fn split_labeled_rows(
    rows: Vec<Vec<f64>>,
    labels: Vec<f64>,
    num_partitions: usize,
) -> AggResult<Vec<DataPartition>> {
    if labels.len() != rows.len() {
        return Err(AggregationError::invalid_parameter(format!(
            "{} labels supplied for {} rows",
            labels.len(),
            rows.len()
        )));
    }
    split_inner(rows, Some(labels), num_partitions)
}

fn split_inner(
    rows: Vec<Vec<f64>>,
    labels: Option<Vec<f64>>,
    num_partitions: usize,
) -> AggResult<Vec<DataPartition>> {
    if num_partitions == 0 || num_partitions > rows.len() {
        return Err(AggregationError::invalid_parameter(format!(
            "cannot split {} rows into {} non-empty partitions",
            rows.len(),
            num_partitions
        )));
    }

    let base = rows.len() / num_partitions;
    let remainder = rows.len() % num_partitions;
    let mut rows = rows.into_iter();
    let mut labels = labels.map(Vec::into_iter);

    (0..num_partitions)
        .map(|index| {
            let size = base + usize::from(index < remainder);
            let chunk: Vec<Vec<f64>> = rows.by_ref().take(size).collect();
            let partition = DataPartition::from_rows(index, chunk)?;
            match labels.as_mut() {
                Some(labels) => partition.with_labels(labels.by_ref().take(size).collect()),
                None => Ok(partition),
            }
        })
        .collect()
}
