use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AlignError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessionId(String);

impl AccessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccessionId {
    type Err = AlignError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        // Commas would be read as a list separator by blastdbcmd -entry.
        let is_valid = !normalized.is_empty()
            && !normalized
                .chars()
                .any(|ch| ch.is_whitespace() || ch == ',' || ch.is_control());
        if !is_valid {
            return Err(AlignError::InvalidAccession(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    seq: usize,
    accessions: Vec<AccessionId>,
}

impl WorkUnit {
    pub fn new(seq: usize, accessions: Vec<AccessionId>) -> Self {
        Self { seq, accessions }
    }

    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn accessions(&self) -> &[AccessionId] {
        &self.accessions
    }

    pub fn len(&self) -> usize {
        self.accessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessions.is_empty()
    }

    pub fn label(&self) -> String {
        match self.accessions.as_slice() {
            [single] => format!("unit {} ({single})", self.seq),
            many => format!("unit {} ({} accessions)", self.seq, many.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", tag = "mode", content = "size")]
pub enum BatchStrategy {
    #[default]
    Single,
    Batch(usize),
}

impl fmt::Display for BatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStrategy::Single => write!(f, "single"),
            BatchStrategy::Batch(size) => write!(f, "batch({size})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    #[default]
    Tab,
    Comma,
}

impl Delimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Tab => b'\t',
            Delimiter::Comma => b',',
        }
    }

    pub fn as_char(self) -> char {
        self.as_byte() as char
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delimiter::Tab => write!(f, "tab"),
            Delimiter::Comma => write!(f, "comma"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnrichMode {
    #[default]
    Auto,
    Inline,
    Post,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderPolicy {
    #[default]
    Completion,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    #[default]
    Drain,
    Abandon,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSelector {
    Index(usize),
    Name(String),
}

impl Default for ColumnSelector {
    fn default() -> Self {
        ColumnSelector::Index(0)
    }
}

impl fmt::Display for ColumnSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnSelector::Index(index) => write!(f, "#{index}"),
            ColumnSelector::Name(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for ColumnSelector {
    type Err = AlignError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AlignError::InvalidColumn(value.to_string()));
        }
        match trimmed.parse::<usize>() {
            Ok(index) => Ok(ColumnSelector::Index(index)),
            Err(_) => Ok(ColumnSelector::Name(trimmed.to_string())),
        }
    }
}

impl ColumnSelector {
    pub fn resolve(&self, header: Option<&[String]>) -> Result<usize, AlignError> {
        match (self, header) {
            (ColumnSelector::Index(index), Some(header)) if *index >= header.len() => Err(
                AlignError::InvalidColumn(format!("column {index} out of range ({} columns)", header.len())),
            ),
            (ColumnSelector::Index(index), _) => Ok(*index),
            (ColumnSelector::Name(name), Some(header)) => header
                .iter()
                .position(|column| column == name)
                .ok_or_else(|| AlignError::InvalidColumn(format!("no column named {name}"))),
            (ColumnSelector::Name(name), None) => Err(AlignError::InvalidColumn(format!(
                "column {name} requires a header row"
            ))),
        }
    }
}
