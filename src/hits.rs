use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignField {
    pub specifier: &'static str,
    pub column: &'static str,
}

const fn field(specifier: &'static str, column: &'static str) -> AlignField {
    AlignField { specifier, column }
}

pub const ALIGN_FIELDS: [AlignField; 50] = [
    field("qseqid", "query_sequence_id"),
    field("qgi", "query_gi"),
    field("qacc", "query_accession"),
    field("qaccver", "query_accession_version"),
    field("qlen", "query_sequence_length"),
    field("sseqid", "subject_sequence_id"),
    field("sallseqid", "subject_all_sequence_id"),
    field("sgi", "subject_gi"),
    field("sallgi", "subject_all_gi"),
    field("sacc", "subject_accession"),
    field("saccver", "subject_accession_version"),
    field("sallacc", "subject_all_accession"),
    field("slen", "subject_sequence_length"),
    field("qstart", "query_start"),
    field("qend", "query_end"),
    field("sstart", "subject_start"),
    field("send", "subject_end"),
    field("qseq", "query_sequence"),
    field("sseq", "subject_sequence"),
    field("evalue", "expect_value"),
    field("bitscore", "bit_score"),
    field("score", "raw_score"),
    field("length", "alignment_length"),
    field("pident", "percentage_identity"),
    field("nident", "number_of_identical_matches"),
    field("mismatch", "number_of_mismatches"),
    field("positive", "number_of_positive_scoring_matches"),
    field("gapopen", "number_of_gap_opens"),
    field("gaps", "number_of_gaps"),
    field("ppos", "percentage_of_positive_scoring_matches"),
    field("frames", "query/subject_frame"),
    field("qframe", "query_frames"),
    field("sframe", "subject_frames"),
    field("btop", "blast_traceback_operations"),
    field("staxid", "subject_taxid"),
    field("ssciname", "subject_scientific_name"),
    field("scomname", "subject_common_name"),
    field("sblastname", "subject_blast_name"),
    field("sskingdom", "subject_super_kingdom"),
    field("staxids", "subject_all_taxids"),
    field("sscinames", "subject_all_scientific_names"),
    field("scomnames", "subject_all_common_names"),
    field("sblastnames", "subject_all_blast_names"),
    field("sskingdoms", "subject_all_super_kingdoms"),
    field("sstrand", "subject_strand"),
    field("qcovs", "query_coverage_per_subject"),
    field("qcovhsp", "query_coverage_per_hsp"),
    field("qcovus", "query_coverage_per_unique_subject"),
    field("stitle", "subject_title"),
    field("salltitles", "subject_all_titles"),
];

pub const FIELD_COUNT: usize = ALIGN_FIELDS.len();

pub const SUBJECT_TAXID_COLUMN: &str = "subject_taxid";

pub const QUOTED_COLUMNS: [&str; 2] = ["subject_title", "subject_all_titles"];

pub fn outfmt_argument() -> String {
    let specifiers: Vec<&str> = ALIGN_FIELDS.iter().map(|field| field.specifier).collect();
    format!("6 {}", specifiers.join(" "))
}

pub fn header() -> Vec<String> {
    ALIGN_FIELDS
        .iter()
        .map(|field| field.column.to_string())
        .collect()
}

pub fn column_index(column: &str) -> Option<usize> {
    ALIGN_FIELDS.iter().position(|field| field.column == column)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("aligner output is not valid UTF-8: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitRow {
    values: Vec<String>,
}

impl HitRow {
    pub fn from_values(values: Vec<String>) -> Result<Self, ParseError> {
        if values.len() != FIELD_COUNT {
            return Err(ParseError::FieldCount {
                line: 0,
                expected: FIELD_COUNT,
                found: values.len(),
            });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn into_values(self) -> Vec<String> {
        self.values
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        column_index(column).map(|index| self.values[index].as_str())
    }

    pub fn query_accession(&self) -> &str {
        &self.values[2]
    }

    pub fn subject_taxid(&self) -> &str {
        &self.values[34]
    }
}

pub fn parse_hits(output: &[u8]) -> Result<Vec<HitRow>, ParseError> {
    let text =
        std::str::from_utf8(output).map_err(|err| ParseError::Encoding(err.to_string()))?;
    let mut rows = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let values: Vec<String> = line.split('\t').map(str::to_string).collect();
        if values.len() != FIELD_COUNT {
            return Err(ParseError::FieldCount {
                line: index + 1,
                expected: FIELD_COUNT,
                found: values.len(),
            });
        }
        rows.push(HitRow { values });
    }
    Ok(rows)
}
