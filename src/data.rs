//! Batched record streams backed by CSV files.
//!
//! Each row holds one sample: every field flattened over its non-batch dims,
//! concatenated in declaration order. Reading yields one [`Variable`] per
//! field whose leading dim is the batch size.

use crate::array::Array;
use crate::error::Error;
use crate::graph::OpKind;
use crate::tape::Tape;
use crate::variable::Variable;

use csv::{ReaderBuilder, StringRecord};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Declared layout of one field; `dims[0]` is the batch size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub dims: Vec<usize>,
}

impl FieldSpec {
    /// Elements per sample.
    pub fn sample_len(&self) -> usize {
        self.dims[1..].iter().product()
    }
}

pub struct RecordReader {
    path: PathBuf,
    fields: Vec<FieldSpec>,
    batch_size: usize,
    reader: csv::Reader<File>,
    record: StringRecord,
    row: usize,
}

impl std::fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader")
            .field("path", &self.path)
            .field("fields", &self.fields)
            .field("batch_size", &self.batch_size)
            .field("row", &self.row)
            .finish()
    }
}

/// Opens a record stream.
///
/// `shapes` is the concatenation of every field's shape and `ranks` splits
/// it per field, so `shapes = [32, 1, 28, 28, 32, 1]` with `ranks = [4, 2]`
/// declares an image field `[32, 1, 28, 28]` and a label field `[32, 1]`.
/// All fields must share the leading batch dim. Only LoD level 0 is
/// supported.
pub fn create_reader<P: AsRef<Path>>(
    path: P,
    shapes: &[usize],
    ranks: &[usize],
    lod_levels: &[usize],
) -> Result<RecordReader, Error> {
    if ranks.is_empty() {
        return Err(Error::attribute("ranks", "at least one field is required"));
    }
    if ranks.iter().sum::<usize>() != shapes.len() {
        return Err(Error::attribute(
            "ranks",
            format!(
                "ranks {:?} do not split shapes of length {}",
                ranks,
                shapes.len()
            ),
        ));
    }
    if !lod_levels.is_empty() && lod_levels.len() != ranks.len() {
        return Err(Error::attribute(
            "lod_levels",
            format!("expected {} entries, got {}", ranks.len(), lod_levels.len()),
        ));
    }
    if let Some(&level) = lod_levels.iter().find(|&&level| level != 0) {
        return Err(Error::Unimplemented(format!(
            "LoD level {} in record reader",
            level
        )));
    }

    let mut fields = Vec::with_capacity(ranks.len());
    let mut offset = 0;
    for &rank in ranks {
        if rank == 0 {
            return Err(Error::attribute("ranks", "a field rank must be positive"));
        }
        let dims = shapes[offset..offset + rank].to_vec();
        offset += rank;
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::attribute(
                "shapes",
                format!("zero-sized dim in {:?}", dims),
            ));
        }
        fields.push(FieldSpec { dims });
    }
    let batch_size = fields[0].dims[0];
    if let Some(field) = fields.iter().find(|f| f.dims[0] != batch_size) {
        return Err(Error::attribute(
            "shapes",
            format!(
                "batch dim {} disagrees with {} of the first field",
                field.dims[0], batch_size
            ),
        ));
    }

    let path = path.as_ref().to_path_buf();
    let reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(&path)?;
    debug!(path = %path.display(), fields = fields.len(), batch_size, "opened record reader");
    Ok(RecordReader {
        path,
        fields,
        batch_size,
        reader,
        record: StringRecord::new(),
        row: 0,
    })
}

impl RecordReader {
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Rows consumed so far.
    pub fn rows_read(&self) -> usize {
        self.row
    }

    fn row_len(&self) -> usize {
        self.fields.iter().map(FieldSpec::sample_len).sum()
    }

    /// Reads up to one batch and returns one array per field. A short final
    /// batch comes back with a smaller leading dim.
    pub fn next_batch(&mut self) -> Result<Vec<Array>, Error> {
        let row_len = self.row_len();
        let mut columns: Vec<Vec<f32>> = self
            .fields
            .iter()
            .map(|f| Vec::with_capacity(self.batch_size * f.sample_len()))
            .collect();
        let mut rows = 0;
        while rows < self.batch_size && self.reader.read_record(&mut self.record)? {
            if self.record.len() != row_len {
                return Err(Error::ShapeError(format!(
                    "Row {} of {} has {} values, expected {}",
                    self.row,
                    self.path.display(),
                    self.record.len(),
                    row_len
                )));
            }
            let mut values = self.record.iter().enumerate().map(|(col, s)| {
                s.parse::<f32>().map_err(|e| {
                    Error::InvalidOperation(format!(
                        "Invalid value at row {}, column {}: '{}' - {}",
                        self.row, col, s, e
                    ))
                })
            });
            for (field, column) in self.fields.iter().zip(columns.iter_mut()) {
                for _ in 0..field.sample_len() {
                    let value = values.next().ok_or_else(|| {
                        Error::InternalLogicError("row ended before its fields".to_string())
                    })??;
                    column.push(value);
                }
            }
            self.row += 1;
            rows += 1;
        }
        if rows == 0 {
            return Err(Error::EndOfStream);
        }
        self.fields
            .iter()
            .zip(columns)
            .map(|(field, column)| {
                let mut dims = field.dims.clone();
                dims[0] = rows;
                Array::from_vec(column, &dims)
            })
            .collect()
    }
}

/// Reads the next batch into fresh variables and records a `Read` source op.
pub fn read_next(tape: &mut Tape, reader: &mut RecordReader) -> Result<Vec<Variable>, Error> {
    let outputs: Vec<Variable> = reader
        .next_batch()?
        .into_iter()
        .map(|array| Variable::from_array("data", array))
        .collect();
    tape.record(
        OpKind::Read {
            fields: outputs.len(),
        },
        Vec::new(),
        outputs.clone(),
    )?;
    Ok(outputs)
}
