use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::domain::{ColumnSelector, Delimiter};
use crate::error::AlignError;
use crate::relation::{RelationLayout, RelationReader, RelationWriter};

pub const DEFAULT_LINEAGE_FILE: &str = "taxonomy4blast.sqlite3";

pub const PARENT_COLUMN: &str = "taxid_parent";

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineageMap {
    parents: HashMap<String, String>,
}

impl LineageMap {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            parents: pairs
                .into_iter()
                .map(|(taxid, parent)| (taxid.into(), parent.into()))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, AlignError> {
        if !path.is_file() {
            return Err(AlignError::MissingLineage(path.display().to_string()));
        }
        let map = if is_sqlite(path)? {
            Self::load_sqlite(path)?
        } else {
            Self::load_tsv(path)?
        };
        info!(path = %path.display(), entries = map.len(), "lineage table loaded");
        Ok(map)
    }

    pub fn load_sqlite(path: &Path) -> Result<Self, AlignError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|err| AlignError::LineageLoad(err.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT taxid, parent FROM TaxidInfo")
            .map_err(|err| AlignError::LineageLoad(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let taxid: Value = row.get(0)?;
                let parent: Value = row.get(1)?;
                Ok((value_text(taxid), value_text(parent)))
            })
            .map_err(|err| AlignError::LineageLoad(err.to_string()))?;

        let mut parents = HashMap::new();
        for row in rows {
            let (taxid, parent) = row.map_err(|err| AlignError::LineageLoad(err.to_string()))?;
            parents.insert(taxid, parent);
        }
        Ok(Self { parents })
    }

    pub fn load_tsv(path: &Path) -> Result<Self, AlignError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|err| AlignError::LineageLoad(err.to_string()))?;

        let mut parents = HashMap::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|err| AlignError::LineageLoad(err.to_string()))?;
            let taxid = record.get(0).unwrap_or("").trim();
            if taxid.is_empty() || (index == 0 && taxid.eq_ignore_ascii_case("taxid")) {
                continue;
            }
            let parent = record.get(1).unwrap_or("").trim();
            parents.insert(taxid.to_string(), parent.to_string());
        }
        Ok(Self { parents })
    }

    pub fn parent_of(&self, taxid: &str) -> &str {
        self.parents
            .get(taxid.trim())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

fn is_sqlite(path: &Path) -> Result<bool, AlignError> {
    let mut file = File::open(path).map_err(|err| AlignError::LineageLoad(err.to_string()))?;
    let mut magic = [0u8; 16];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == SQLITE_MAGIC),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(AlignError::LineageLoad(err.to_string())),
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(number) => number.to_string(),
        Value::Real(number) => number.to_string(),
        Value::Text(text) => text,
        Value::Blob(bytes) => String::from_utf8_lossy(&bytes).to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Enricher {
    lineage: Arc<LineageMap>,
    column: usize,
}

impl Enricher {
    pub fn new(lineage: Arc<LineageMap>, column: usize) -> Self {
        Self { lineage, column }
    }

    pub fn column(&self) -> usize {
        self.column
    }

    pub fn parent_for(&self, row: &[String]) -> &str {
        row.get(self.column)
            .map(|taxid| self.lineage.parent_of(taxid))
            .unwrap_or("")
    }

    pub fn enrich(&self, mut row: Vec<String>) -> Vec<String> {
        let parent = self.parent_for(&row).to_string();
        row.push(parent);
        row
    }
}

pub fn enrich_relation(
    input: &Path,
    output: &Path,
    lineage: Arc<LineageMap>,
    column: &ColumnSelector,
    delimiter: Delimiter,
    quoted: &[&str],
) -> Result<usize, AlignError> {
    let mut reader = RelationReader::open(input, delimiter)?;
    let header = reader.header().to_vec();
    let index = column.resolve(Some(&header))?;
    let layout = RelationLayout::new(header, quoted);
    let writer = RelationWriter::create(
        output,
        layout,
        delimiter,
        Some(Enricher::new(lineage, index)),
    )?;

    let mut rows = Vec::new();
    while let Some(row) = reader.next_row()? {
        rows.push(row);
        if rows.len() == 1024 {
            writer.append(rows.iter().map(Vec::as_slice))?;
            rows.clear();
        }
    }
    writer.append(rows.iter().map(Vec::as_slice))?;
    let written = writer.finish()?;
    info!(
        input = %input.display(),
        output = %output.display(),
        rows = written,
        "relation enriched"
    );
    Ok(written)
}
