// Declarative description of where the lending data lives inside the published
// spreadsheets.  Row and dates_row are 1-based row numbers as shown in Excel,
// sheet and from_column are 0-based.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;

use crate::interval::month::Month;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([a-z_]+)(?::([^}]*))?\}").unwrap();
    static ref SQL_IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

static CREDIT_SCHEMA: &str = include_str!("../../../schemas/credit.json5");
static MORTGAGES_SCHEMA: &str = include_str!("../../../schemas/mortgages.json5");

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("failed to parse schema: {0}")]
    Parse(#[from] json5::Error),
    #[error("failed to read schema file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("table name {0:?} is not a valid SQL identifier")]
    InvalidTable(String),
    #[error("unsupported placeholder {placeholder} in url template {template}")]
    UnknownPlaceholder { template: String, placeholder: String },
    #[error("source {source_name}, row {row}: label {label} is required")]
    MissingLabel {
        source_name: String,
        row: u32,
        label: Label,
    },
    #[error("source {source_name}, row {row}: label {label} is not part of this ledger")]
    UnexpectedLabel {
        source_name: String,
        row: u32,
        label: Label,
    },
    #[error("source {source_name}: row numbers are 1-based, got {row}")]
    InvalidRowIndex { source_name: String, row: u32 },
    #[error("source {0} is declared more than once")]
    DuplicateSource(String),
    #[error("source {0} is calendar anchored but the schema has no calendar_url")]
    MissingCalendarUrl(String),
    #[error("source names can't be empty")]
    EmptySourceName,
}

/// A url with `{year}`, `{month}` or `{month:02d}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct UrlTemplate(String);

impl TryFrom<String> for UrlTemplate {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        for caps in PLACEHOLDER.captures_iter(&value) {
            let ok = matches!(
                (&caps[1], caps.get(2).map(|m| m.as_str())),
                ("year", None) | ("month", None) | ("month", Some("02d")) | ("month", Some("02"))
            );
            if !ok {
                return Err(SchemaError::UnknownPlaceholder {
                    template: value.clone(),
                    placeholder: caps[0].to_string(),
                });
            }
        }
        Ok(UrlTemplate(value))
    }
}

impl UrlTemplate {
    pub fn format(&self, month: &Month) -> String {
        PLACEHOLDER
            .replace_all(&self.0, |caps: &Captures| {
                match (&caps[1], caps.get(2).is_some()) {
                    ("year", _) => month.year().to_string(),
                    ("month", false) => month.month().to_string(),
                    ("month", true) => format!("{:02}", month.month()),
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The optional classification labels.  `institute` is always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Sector,
    Industry,
    Category,
}

impl Label {
    pub const ALL: [Label; 3] = [Label::Sector, Label::Industry, Label::Category];

    pub fn column(&self) -> &'static str {
        match self {
            Label::Sector => "sector",
            Label::Industry => "industry",
            Label::Category => "category",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Required,
    #[default]
    Optional,
    Absent,
}

/// Which labels the ledger carries.  Schemas evolved over time to add sector
/// and industry, so each one is declared per deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelSpec {
    #[serde(default)]
    pub sector: Requirement,
    #[serde(default)]
    pub industry: Requirement,
    #[serde(default)]
    pub category: Requirement,
}

impl LabelSpec {
    pub fn requirement(&self, label: Label) -> Requirement {
        match label {
            Label::Sector => self.sector,
            Label::Industry => self.industry,
            Label::Category => self.category,
        }
    }

    /// Labels that are columns of the ledger table, in a fixed order.
    pub fn columns(&self) -> Vec<Label> {
        Label::ALL
            .into_iter()
            .filter(|l| self.requirement(*l) != Requirement::Absent)
            .collect()
    }
}

/// Metadata attached to every value extracted from one row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RowLabels {
    pub institute: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub category: Option<String>,
}

impl RowLabels {
    pub fn get(&self, label: Label) -> Option<&str> {
        match label {
            Label::Sector => self.sector.as_deref(),
            Label::Industry => self.industry.as_deref(),
            Label::Category => self.category.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowSpec {
    pub row: u32,
    pub institute: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl RowSpec {
    pub fn labels(&self) -> RowLabels {
        RowLabels {
            institute: self.institute.clone(),
            sector: self.sector.clone(),
            industry: self.industry.clone(),
            category: self.category.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sheet {
    #[serde(default)]
    pub sheet: usize,
    pub dates_row: u32,
    /// Columns before this one hold labels, not data.
    pub from_column: usize,
    pub rows: Vec<RowSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workbook {
    pub url: UrlTemplate,
    #[serde(default)]
    pub sheets: Option<Vec<Sheet>>,
}

impl Workbook {
    /// A workbook without sheets is kept for reference only and is never fetched.
    pub fn is_inert(&self) -> bool {
        self.sheets.as_ref().map_or(true, |s| s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// Start from the latest past release of this event in the publication calendar.
    Calendar { event: String },
    /// Start from the current month.
    #[default]
    Unanchored,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSchema {
    pub name: String,
    #[serde(default)]
    pub resolution: Resolution,
    pub workbooks: Vec<Workbook>,
}

impl SourceSchema {
    pub fn active_workbooks(&self) -> impl Iterator<Item = &Workbook> {
        self.workbooks.iter().filter(|wb| !wb.is_inert())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerSchema {
    pub table: String,
    #[serde(default)]
    pub labels: LabelSpec,
    #[serde(default)]
    pub calendar_url: Option<UrlTemplate>,
    pub sources: Vec<SourceSchema>,
}

impl LedgerSchema {
    pub fn from_json5(text: &str) -> Result<LedgerSchema, SchemaError> {
        let schema: LedgerSchema = json5::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_file(path: &Path) -> Result<LedgerSchema, SchemaError> {
        let text = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        LedgerSchema::from_json5(&text)
    }

    /// Business lending by banks, other financial institutions and pension funds.
    pub fn credit() -> Result<LedgerSchema, SchemaError> {
        LedgerSchema::from_json5(CREDIT_SCHEMA)
    }

    /// Household mortgages, no publication calendar.
    pub fn mortgages() -> Result<LedgerSchema, SchemaError> {
        LedgerSchema::from_json5(MORTGAGES_SCHEMA)
    }

    /// Either one of the embedded schema names or a path to a JSON5 file.
    pub fn load(name_or_path: &str) -> Result<LedgerSchema, SchemaError> {
        match name_or_path {
            "credit" => LedgerSchema::credit(),
            "mortgages" => LedgerSchema::mortgages(),
            path => LedgerSchema::from_file(Path::new(path)),
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if !SQL_IDENTIFIER.is_match(&self.table) {
            return Err(SchemaError::InvalidTable(self.table.clone()));
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(SchemaError::EmptySourceName);
            }
            if !names.insert(source.name.as_str()) {
                return Err(SchemaError::DuplicateSource(source.name.clone()));
            }
            if matches!(source.resolution, Resolution::Calendar { .. })
                && self.calendar_url.is_none()
            {
                return Err(SchemaError::MissingCalendarUrl(source.name.clone()));
            }
            for sheet in source.workbooks.iter().flat_map(|wb| wb.sheets.iter().flatten()) {
                if sheet.dates_row == 0 {
                    return Err(SchemaError::InvalidRowIndex {
                        source_name: source.name.clone(),
                        row: 0,
                    });
                }
                for row in &sheet.rows {
                    self.validate_row(&source.name, row)?;
                }
            }
        }
        Ok(())
    }

    fn validate_row(&self, source_name: &str, row: &RowSpec) -> Result<(), SchemaError> {
        if row.row == 0 {
            return Err(SchemaError::InvalidRowIndex {
                source_name: source_name.to_string(),
                row: 0,
            });
        }
        let labels = row.labels();
        for label in Label::ALL {
            match (self.labels.requirement(label), labels.get(label)) {
                (Requirement::Required, None) => {
                    return Err(SchemaError::MissingLabel {
                        source_name: source_name.to_string(),
                        row: row.row,
                        label,
                    })
                }
                (Requirement::Absent, Some(_)) => {
                    return Err(SchemaError::UnexpectedLabel {
                        source_name: source_name.to_string(),
                        row: row.row,
                        label,
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}
