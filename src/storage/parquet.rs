//! Parquet encoding of the canonical dataset format
//!
//! Based on `DuckDB` (Raasveldt et al., SIGMOD 2019) columnar storage patterns.
//!
//! # Format
//!
//! One Parquet file, one row per point:
//! - `targets: List<UInt32>` (required): destinations of the point's outgoing edges
//! - `x`, `y` (optional, numeric): initial position; absent → circular layout
//! - `label: Utf8` (optional): display label
//! - any other numeric or UTF-8 column becomes a point attribute column
//!
//! Other column types are skipped.

use super::{Column, ColumnData, CsrGraph, GraphFrame, PointId};
use anyhow::{ensure, Context, Result};
use arrow::array::{
    Array, ArrayRef, AsArray, Float32Array, Float64Array, ListArray, StringArray, UInt32Array,
};
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int32Type, Int64Type, Schema, UInt32Type,
    UInt64Type,
};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::path::Path;
use std::sync::Arc;

const TARGETS: &str = "targets";
const LABEL: &str = "label";

#[allow(clippy::cast_precision_loss)]
fn numeric_values(array: &dyn Array) -> Option<Vec<f64>> {
    let values = match array.data_type() {
        DataType::Float32 => array
            .as_primitive::<Float32Type>()
            .iter()
            .map(|v| v.map_or(f64::NAN, f64::from))
            .collect(),
        DataType::Float64 => array
            .as_primitive::<Float64Type>()
            .iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect(),
        DataType::Int32 => array
            .as_primitive::<Int32Type>()
            .iter()
            .map(|v| v.map_or(f64::NAN, f64::from))
            .collect(),
        DataType::Int64 => array
            .as_primitive::<Int64Type>()
            .iter()
            .map(|v| v.map_or(f64::NAN, |v| v as f64))
            .collect(),
        DataType::UInt32 => array
            .as_primitive::<UInt32Type>()
            .iter()
            .map(|v| v.map_or(f64::NAN, f64::from))
            .collect(),
        DataType::UInt64 => array
            .as_primitive::<UInt64Type>()
            .iter()
            .map(|v| v.map_or(f64::NAN, |v| v as f64))
            .collect(),
        _ => return None,
    };
    Some(values)
}

fn text_values(array: &dyn Array) -> Option<Vec<Option<String>>> {
    let own = |v: Option<&str>| v.map(str::to_owned);
    match array.data_type() {
        DataType::Utf8 => Some(array.as_string::<i32>().iter().map(own).collect()),
        DataType::LargeUtf8 => Some(array.as_string::<i64>().iter().map(own).collect()),
        _ => None,
    }
}

/// Per-column accumulator across record batches
enum Accum {
    Targets,
    Label(Vec<Option<String>>),
    Numeric(String, Vec<f64>),
    Text(String, Vec<String>),
    Skip,
}

impl Accum {
    fn plan(field: &Field) -> Self {
        let name = field.name().clone();
        let text = matches!(field.data_type(), DataType::Utf8 | DataType::LargeUtf8);
        if name == TARGETS {
            return Self::Targets;
        }
        if text {
            return if name == LABEL {
                Self::Label(Vec::new())
            } else {
                Self::Text(name, Vec::new())
            };
        }
        match field.data_type() {
            DataType::Float32
            | DataType::Float64
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt32
            | DataType::UInt64 => Self::Numeric(name, Vec::new()),
            other => {
                tracing::debug!(column = %name, data_type = %other, "skipping unsupported column");
                Self::Skip
            }
        }
    }

    fn push(&mut self, array: &ArrayRef) -> Result<()> {
        match self {
            Self::Label(values) => values.extend(text_values(array).context("label column")?),
            Self::Text(name, values) => values.extend(
                text_values(array)
                    .with_context(|| format!("text column `{name}`"))?
                    .into_iter()
                    .map(Option::unwrap_or_default),
            ),
            Self::Numeric(name, values) => values.extend(
                numeric_values(array).with_context(|| format!("numeric column `{name}`"))?,
            ),
            Self::Targets | Self::Skip => {}
        }
        Ok(())
    }
}

fn read_targets(array: &ArrayRef, first_row: u32, edges: &mut Vec<(u32, u32)>) -> Result<()> {
    let lists = array
        .as_any()
        .downcast_ref::<ListArray>()
        .context("Invalid targets column type")?;
    for (row, src) in (0..lists.len()).zip(first_row..) {
        if lists.is_null(row) {
            continue;
        }
        let value = lists.value(row);
        let targets = value
            .as_any()
            .downcast_ref::<UInt32Array>()
            .context("targets must be a list of u32")?;
        edges.extend(targets.iter().flatten().map(|dst| (src, dst)));
    }
    Ok(())
}

impl GraphFrame {
    /// Encode as a canonical dataset (ZSTD-compressed Parquet)
    ///
    /// # Errors
    ///
    /// Returns error if Arrow conversion or Parquet encoding fails
    pub fn to_parquet_bytes(&self) -> Result<Vec<u8>> {
        let graph = self.graph();
        let n = graph.num_points();

        let targets = ListArray::from_iter_primitive::<UInt32Type, _, _>((0..n).map(|i| {
            #[allow(clippy::cast_possible_truncation)] // point count checked at construction
            let point = PointId(i as u32);
            Some(
                graph
                    .outgoing(point)
                    .map(|t| t.iter().copied().map(Some).collect::<Vec<_>>())
                    .unwrap_or_default(),
            )
        }));

        let mut fields = vec![Field::new(TARGETS, targets.data_type().clone(), false)];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(targets)];

        let (xs, ys): (Vec<f32>, Vec<f32>) = self.positions().iter().map(|[x, y]| (*x, *y)).unzip();
        fields.push(Field::new("x", DataType::Float32, false));
        arrays.push(Arc::new(Float32Array::from(xs)));
        fields.push(Field::new("y", DataType::Float32, false));
        arrays.push(Arc::new(Float32Array::from(ys)));

        #[allow(clippy::cast_possible_truncation)]
        let labels: Vec<Option<&str>> = (0..n).map(|i| graph.label(PointId(i as u32))).collect();
        if labels.iter().any(Option::is_some) {
            fields.push(Field::new(LABEL, DataType::Utf8, true));
            arrays.push(Arc::new(StringArray::from(labels)));
        }

        for column in self.columns() {
            let (data_type, array): (_, ArrayRef) = match &column.data {
                ColumnData::Numeric(v) => (DataType::Float64, Arc::new(Float64Array::from(v.clone()))),
                ColumnData::Text(v) => (DataType::Utf8, Arc::new(StringArray::from(v.clone()))),
            };
            fields.push(Field::new(&column.name, data_type, false));
            arrays.push(array);
        }

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema.clone(), arrays)
            .context("Failed to create RecordBatch")?;

        let props = WriterProperties::builder()
            .set_compression(parquet::basic::Compression::ZSTD(
                parquet::basic::ZstdLevel::try_new(3)?,
            ))
            .build();

        let mut out = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut out, schema, Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(out)
    }

    /// Decode a canonical dataset
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not Parquet, the `targets` column is
    /// missing or malformed, or an edge points past the last row
    pub fn from_parquet_bytes(bytes: Bytes) -> Result<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .context("Failed to open Parquet dataset")?;
        let schema = builder.schema().clone();
        let targets_idx = schema
            .index_of(TARGETS)
            .with_context(|| format!("dataset has no `{TARGETS}` column"))?;

        let mut accums: Vec<Accum> = schema.fields().iter().map(|f| Accum::plan(f)).collect();
        let mut edges = Vec::new();
        let mut rows = 0_u32;

        for batch in builder.build()? {
            let batch: RecordBatch = batch?;
            read_targets(batch.column(targets_idx), rows, &mut edges)?;
            for (accum, array) in accums.iter_mut().zip(batch.columns()) {
                accum.push(array)?;
            }
            let batch_rows = u32::try_from(batch.num_rows()).context("batch too large")?;
            rows = rows.checked_add(batch_rows).context("dataset exceeds u32 points")?;
        }

        let mut graph = CsrGraph::from_edges(rows as usize, &edges)?;
        let mut xs = None;
        let mut ys = None;
        let mut columns = Vec::new();
        for accum in accums {
            match accum {
                Accum::Label(labels) => {
                    for (id, label) in (0..).zip(labels) {
                        if let Some(label) = label {
                            graph.set_label(PointId(id), label);
                        }
                    }
                }
                Accum::Numeric(name, values) if name == "x" => xs = Some(values),
                Accum::Numeric(name, values) if name == "y" => ys = Some(values),
                Accum::Numeric(name, values) => columns.push(Column::numeric(name, values)),
                Accum::Text(name, values) => columns.push(Column::text(name, values)),
                Accum::Targets | Accum::Skip => {}
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let positions = match (xs, ys) {
            (Some(xs), Some(ys)) => xs.iter().zip(&ys).map(|(x, y)| [*x as f32, *y as f32]).collect(),
            (None, None) => GraphFrame::default_positions(graph.num_points()),
            _ => anyhow::bail!("dataset has only one of the `x`/`y` columns"),
        };
        ensure!(positions.len() == graph.num_points(), "position count mismatch");

        Self::new(graph, positions, columns)
    }

    /// Write the canonical encoding to `path`
    ///
    /// # Errors
    ///
    /// Returns error if encoding or file I/O fails
    pub async fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_parquet_bytes()?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Read a canonical dataset from `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or decoded
    pub async fn read_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Self::from_parquet_bytes(Bytes::from(bytes))
    }
}
