use std::path::Path;

use tracing::{info, warn};

use crate::domain::{AccessionId, ColumnSelector, Delimiter};
use crate::error::AlignError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessionSource {
    pub column: ColumnSelector,
    pub delimiter: Delimiter,
    pub has_header: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessionList {
    pub accessions: Vec<AccessionId>,
    pub rejected: Vec<String>,
}

pub fn read_accessions(path: &Path, source: &AccessionSource) -> Result<AccessionList, AlignError> {
    let read_error = |message: String| AlignError::AccessionRead {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(source.delimiter.as_byte())
        .has_headers(source.has_header)
        .flexible(true)
        .from_path(path)
        .map_err(|err| read_error(err.to_string()))?;

    let header: Option<Vec<String>> = if source.has_header {
        let record = reader.headers().map_err(|err| read_error(err.to_string()))?;
        Some(record.iter().map(|name| name.trim().to_string()).collect())
    } else {
        None
    };
    let index = source.column.resolve(header.as_deref())?;

    let mut list = AccessionList::default();
    let mut short_rows = 0usize;
    for record in reader.records() {
        let record = record.map_err(|err| read_error(err.to_string()))?;
        let Some(cell) = record.get(index) else {
            short_rows += 1;
            continue;
        };
        if cell.trim().is_empty() {
            continue;
        }
        match cell.parse::<AccessionId>() {
            Ok(id) => list.accessions.push(id),
            Err(err) => {
                let line = record.position().map(|pos| pos.line()).unwrap_or_default();
                warn!(line, error = %err, "skipping unusable accession");
                list.rejected.push(cell.trim().to_string());
            }
        }
    }
    if short_rows > 0 {
        warn!(rows = short_rows, column = %source.column, "rows without the accession column were ignored");
    }
    info!(
        path = %path.display(),
        count = list.accessions.len(),
        rejected = list.rejected.len(),
        "accessions loaded"
    );
    Ok(list)
}
