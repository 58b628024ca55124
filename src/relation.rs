use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::domain::Delimiter;
use crate::error::AlignError;
use crate::hits;
use crate::lineage::{Enricher, PARENT_COLUMN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationLayout {
    header: Vec<String>,
    quoted: Vec<bool>,
}

impl RelationLayout {
    pub fn new(header: Vec<String>, quoted_columns: &[&str]) -> Self {
        let quoted = header
            .iter()
            .map(|column| quoted_columns.contains(&column.as_str()))
            .collect();
        Self { header, quoted }
    }

    pub fn hits() -> Self {
        Self::new(hits::header(), &hits::QUOTED_COLUMNS)
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn columns(&self) -> usize {
        self.header.len()
    }

    fn is_quoted(&self, index: usize) -> bool {
        self.quoted.get(index).copied().unwrap_or(false)
    }
}

fn push_field(line: &mut String, value: &str, force_quotes: bool, delimiter: char) {
    let needs_quotes = force_quotes
        || value.contains(delimiter)
        || value.contains('"')
        || value.contains('\n')
        || value.contains('\r');
    if needs_quotes {
        line.push('"');
        line.push_str(&value.replace('"', "\"\""));
        line.push('"');
    } else {
        line.push_str(value);
    }
}

struct WriterState<W> {
    out: W,
    rows: usize,
}

// The header is written by the constructor; each append holds the lock until flushed.
pub struct RelationWriter<W: Write = BufWriter<File>> {
    state: Mutex<WriterState<W>>,
    layout: RelationLayout,
    delimiter: Delimiter,
    enricher: Option<Enricher>,
}

impl RelationWriter<BufWriter<File>> {
    pub fn create(
        path: &Path,
        layout: RelationLayout,
        delimiter: Delimiter,
        enricher: Option<Enricher>,
    ) -> Result<Self, AlignError> {
        let file = File::create(path).map_err(|err| {
            AlignError::OutputWrite(format!("create {}: {err}", path.display()))
        })?;
        Self::from_writer(BufWriter::new(file), layout, delimiter, enricher)
    }
}

impl<W: Write> RelationWriter<W> {
    pub fn from_writer(
        mut out: W,
        layout: RelationLayout,
        delimiter: Delimiter,
        enricher: Option<Enricher>,
    ) -> Result<Self, AlignError> {
        let mut line = String::new();
        for (index, column) in layout.header().iter().enumerate() {
            if index > 0 {
                line.push(delimiter.as_char());
            }
            push_field(&mut line, column, false, delimiter.as_char());
        }
        if enricher.is_some() {
            line.push(delimiter.as_char());
            line.push_str(PARENT_COLUMN);
        }
        line.push('\n');
        out.write_all(line.as_bytes())
            .and_then(|()| out.flush())
            .map_err(|err| AlignError::OutputWrite(err.to_string()))?;

        Ok(Self {
            state: Mutex::new(WriterState { out, rows: 0 }),
            layout,
            delimiter,
            enricher,
        })
    }

    pub fn layout(&self) -> &RelationLayout {
        &self.layout
    }

    pub fn is_enriched(&self) -> bool {
        self.enricher.is_some()
    }

    pub fn append<'r, I>(&self, rows: I) -> Result<usize, AlignError>
    where
        I: IntoIterator<Item = &'r [String]>,
    {
        let delimiter = self.delimiter.as_char();
        let mut buffer = String::new();
        let mut count = 0;
        for row in rows {
            if row.len() != self.layout.columns() {
                return Err(AlignError::OutputWrite(format!(
                    "row has {} fields, relation has {} columns",
                    row.len(),
                    self.layout.columns()
                )));
            }
            for (index, value) in row.iter().enumerate() {
                if index > 0 {
                    buffer.push(delimiter);
                }
                push_field(&mut buffer, value, self.layout.is_quoted(index), delimiter);
            }
            if let Some(enricher) = &self.enricher {
                buffer.push(delimiter);
                push_field(&mut buffer, enricher.parent_for(row), false, delimiter);
            }
            buffer.push('\n');
            count += 1;
        }
        if count == 0 {
            return Ok(0);
        }

        let mut state = self.state.lock();
        state
            .out
            .write_all(buffer.as_bytes())
            .and_then(|()| state.out.flush())
            .map_err(|err| AlignError::OutputWrite(err.to_string()))?;
        state.rows += count;
        Ok(count)
    }

    pub fn rows_written(&self) -> usize {
        self.state.lock().rows
    }

    pub fn finish(self) -> Result<usize, AlignError> {
        let mut state = self.state.into_inner();
        state
            .out
            .flush()
            .map_err(|err| AlignError::OutputWrite(err.to_string()))?;
        Ok(state.rows)
    }

    pub fn into_inner(self) -> Result<W, AlignError> {
        let mut state = self.state.into_inner();
        state
            .out
            .flush()
            .map_err(|err| AlignError::OutputWrite(err.to_string()))?;
        Ok(state.out)
    }
}

pub struct RelationReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    header: Vec<String>,
    record: csv::StringRecord,
}

impl RelationReader {
    pub fn open(path: &Path, delimiter: Delimiter) -> Result<Self, AlignError> {
        let malformed = |message: String| AlignError::MalformedRelation {
            path: path.to_path_buf(),
            message,
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter.as_byte())
            .has_headers(true)
            .from_path(path)
            .map_err(|err| malformed(err.to_string()))?;
        let header = reader
            .headers()
            .map_err(|err| malformed(err.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            header,
            record: csv::StringRecord::new(),
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn next_row(&mut self) -> Result<Option<Vec<String>>, AlignError> {
        let more = self
            .reader
            .read_record(&mut self.record)
            .map_err(|err| AlignError::MalformedRelation {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        if !more {
            return Ok(None);
        }
        Ok(Some(self.record.iter().map(str::to_string).collect()))
    }
}

pub fn read_relation(
    path: &Path,
    delimiter: Delimiter,
) -> Result<(Vec<String>, Vec<Vec<String>>), AlignError> {
    let mut reader = RelationReader::open(path, delimiter)?;
    let mut rows = Vec::new();
    while let Some(row) = reader.next_row()? {
        rows.push(row);
    }
    Ok((reader.header().to_vec(), rows))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendBlock {
    pub unit_seq: usize,
    pub rows: usize,
}

// `blocks` must describe the input's data rows in file order.
pub fn reorder_by_unit(
    input: &Path,
    output: &Path,
    blocks: &[AppendBlock],
    delimiter: Delimiter,
    quoted: &[&str],
) -> Result<usize, AlignError> {
    let (header, rows) = read_relation(input, delimiter)?;
    let expected: usize = blocks.iter().map(|block| block.rows).sum();
    if expected != rows.len() {
        return Err(AlignError::MalformedRelation {
            path: input.to_path_buf(),
            message: format!("expected {expected} rows, found {}", rows.len()),
        });
    }

    let mut spans = Vec::with_capacity(blocks.len());
    let mut start = 0;
    for block in blocks {
        spans.push((block.unit_seq, start..start + block.rows));
        start += block.rows;
    }
    spans.sort_by_key(|(seq, _)| *seq);

    let writer = RelationWriter::create(output, RelationLayout::new(header, quoted), delimiter, None)?;
    for (_, span) in spans {
        writer.append(rows[span].iter().map(Vec::as_slice))?;
    }
    writer.finish()
}
