use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::domain::Delimiter;
use crate::error::AlignError;
use crate::lineage::{Enricher, LineageMap};
use crate::relation::{RelationLayout, RelationWriter};
use crate::tools::{EntrySelector, FetchRequest, SequenceTools, ToolKind};

pub const CATALOG_TEMPLATE: &str =
    "%o,%a,%i,\"%t\",%s,%g,%l,%h,%T,%X,%e,%L,%C,%S,%N,%B,%K,%P";

pub const CATALOG_COLUMNS: [&str; 18] = [
    "ordinal_number",
    "accession",
    "sequence_id",
    "sequence_title",
    "sequence",
    "gi",
    "sequence_length",
    "sequence_hash_value",
    "taxid",
    "taxid_leaf",
    "membership_integer",
    "common_taxonomic_name",
    "common_taxonomic_name_leaf",
    "scientific_name",
    "scientific_name_leaf",
    "blast_name",
    "taxonomic_super_kingdom",
    "pig",
];

pub const CATALOG_LINEAGE_COLUMN: usize = 9;

pub const CATALOG_QUOTED: [&str; 1] = ["sequence_title"];

pub fn catalog_layout() -> RelationLayout {
    RelationLayout::new(
        CATALOG_COLUMNS.iter().map(|column| column.to_string()).collect(),
        &CATALOG_QUOTED,
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub records: usize,
    pub enriched: bool,
    pub output: String,
}

pub fn parse_catalog(output: &[u8]) -> Result<Vec<Vec<String>>, AlignError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(output);
    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|err| AlignError::Catalog(err.to_string()))?;
        if record.len() != CATALOG_COLUMNS.len() {
            return Err(AlignError::Catalog(format!(
                "record {}: expected {} fields, found {}",
                index + 1,
                CATALOG_COLUMNS.len(),
                record.len()
            )));
        }
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

pub fn dump_catalog<T: SequenceTools>(
    tools: &T,
    collection: &Path,
    output: &Path,
    lineage: Option<Arc<LineageMap>>,
) -> Result<CatalogSummary, AlignError> {
    info!(collection = %collection.display(), "dumping collection catalog");
    let request = FetchRequest {
        selector: EntrySelector::All,
        template: Some(CATALOG_TEMPLATE),
    };
    let dump = tools
        .fetch(collection, &request, None)
        .and_then(|out| out.require_success(ToolKind::Fetch))
        .map_err(|failure| AlignError::Catalog(failure.to_string()))?;
    let rows = parse_catalog(&dump.stdout)?;

    let enricher = lineage.map(|map| Enricher::new(map, CATALOG_LINEAGE_COLUMN));
    let enriched = enricher.is_some();
    let writer = RelationWriter::create(output, catalog_layout(), Delimiter::Tab, enricher)?;
    writer.append(rows.iter().map(Vec::as_slice))?;
    let records = writer.finish()?;
    info!(records, output = %output.display(), "catalog written");

    Ok(CatalogSummary {
        records,
        enriched,
        output: output.display().to_string(),
    })
}
