use std::io::Cursor;

use calamine::{Data, DataType, Range, Reader, Xlsx, XlsxError};
use log::warn;
use thiserror::Error;

use super::schema::{RowLabels, Sheet, Workbook};

static EMPTY_CELL: Data = Data::Empty;

#[derive(Error, Debug, PartialEq)]
pub enum ExtractError {
    #[error("sheet {sheet}: row {row} has {values} value cells but dates row {dates_row} has {dates}, the layout has drifted from the schema")]
    SchemaMismatch {
        sheet: usize,
        row: u32,
        dates_row: u32,
        dates: usize,
        values: usize,
    },
    #[error("workbook has {available} sheets, no sheet with index {sheet}")]
    MissingSheet { sheet: usize, available: usize },
    #[error("sheet {sheet}, row {row}, column {column}: {value:?} is not a number")]
    NonNumeric {
        sheet: usize,
        row: u32,
        column: u32,
        value: String,
    },
}

/// The (date, value) pairs read from one schema row.  Values are in whole
/// currency units.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSeries {
    pub labels: RowLabels,
    pub points: Vec<(Option<String>, Option<i64>)>,
}

/// All the worksheets of a downloaded spreadsheet, in workbook order.
#[derive(Debug, Clone, Default)]
pub struct LoadedWorkbook {
    sheets: Vec<(String, Range<Data>)>,
}

impl LoadedWorkbook {
    pub fn new(sheets: Vec<(String, Range<Data>)>) -> LoadedWorkbook {
        LoadedWorkbook { sheets }
    }

    pub fn from_xlsx(bytes: Vec<u8>) -> Result<LoadedWorkbook, XlsxError> {
        let mut xlsx: Xlsx<_> = Xlsx::new(Cursor::new(bytes))?;
        Ok(LoadedWorkbook {
            sheets: xlsx.worksheets(),
        })
    }

    pub fn sheet(&self, index: usize) -> Option<&Range<Data>> {
        self.sheets.get(index).map(|(_, range)| range)
    }

    pub fn len(&self) -> usize {
        self.sheets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }
}

/// Convert an amount in millions to whole units.  Falsy inputs (missing or
/// zero) map to `None`, so a zero balance can't be told apart from no data.
pub fn millions_to_units(value: Option<f64>) -> Option<i64> {
    match value {
        Some(v) if v != 0.0 => Some((v * 1_000_000.0).round() as i64),
        _ => None,
    }
}

/// A `true` cell counts as 1 (million), `false` as no data.
fn cell_value(cell: &Data) -> Result<Option<i64>, String> {
    match cell {
        Data::Empty | Data::Bool(false) => Ok(None),
        Data::Bool(true) => Ok(millions_to_units(Some(1.0))),
        Data::String(s) if s.is_empty() => Ok(None),
        Data::Int(v) => Ok(millions_to_units(Some(*v as f64))),
        Data::Float(v) if v.is_finite() => Ok(millions_to_units(Some(*v))),
        other => Err(other.to_string()),
    }
}

/// Header cells are kept as they are, dates get formatted as `YYYY-MM-DD`.
pub fn period_marker(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::DateTime(dt) if dt.is_datetime() => Some(
            dt.as_datetime()
                .map(|d| d.date().to_string())
                .unwrap_or_else(|| dt.as_f64().to_string()),
        ),
        other => Some(other.to_string()),
    }
}

/// Absolute (0-based) last row and column that hold a value.
fn populated_extent(grid: &Range<Data>) -> Option<(u32, u32)> {
    let (start_row, start_col) = grid.start()?;
    grid.used_cells()
        .filter(|(_, _, c)| !c.is_empty())
        .fold(None, |acc, (r, c, _)| {
            let (r, c) = (start_row + r as u32, start_col + c as u32);
            match acc {
                None => Some((r, c)),
                Some((mr, mc)) => Some((mr.max(r), mc.max(c))),
            }
        })
}

/// Cells of a 1-based row from `from_column` through the last populated column.
/// Rows past the end of the sheet have no cells at all.
fn row_span<'a>(
    grid: &'a Range<Data>,
    extent: Option<(u32, u32)>,
    row: u32,
    from_column: usize,
) -> Vec<(u32, &'a Data)> {
    let Some((last_row, last_col)) = extent else {
        return vec![];
    };
    let Some(abs_row) = row.checked_sub(1) else {
        return vec![];
    };
    if abs_row > last_row {
        return vec![];
    }
    (from_column as u32..=last_col)
        .map(|col| (col, grid.get_value((abs_row, col)).unwrap_or(&EMPTY_CELL)))
        .collect()
}

/// Read the dates row and every declared row of one sheet.
pub fn extract(grid: &Range<Data>, sheet: &Sheet) -> Result<Vec<LabeledSeries>, ExtractError> {
    let extent = populated_extent(grid);
    let dates: Vec<Option<String>> = row_span(grid, extent, sheet.dates_row, sheet.from_column)
        .into_iter()
        .map(|(_, c)| period_marker(c))
        .collect();
    if dates.is_empty() {
        warn!(
            "sheet {}: no dates found in row {} from column {}",
            sheet.sheet, sheet.dates_row, sheet.from_column
        );
    }

    let mut out: Vec<LabeledSeries> = Vec::with_capacity(sheet.rows.len());
    for spec in &sheet.rows {
        let cells = row_span(grid, extent, spec.row, sheet.from_column);
        if cells.len() != dates.len() {
            return Err(ExtractError::SchemaMismatch {
                sheet: sheet.sheet,
                row: spec.row,
                dates_row: sheet.dates_row,
                dates: dates.len(),
                values: cells.len(),
            });
        }
        let mut points = Vec::with_capacity(cells.len());
        for (date, (col, cell)) in dates.iter().zip(cells) {
            let value = cell_value(cell).map_err(|value| ExtractError::NonNumeric {
                sheet: sheet.sheet,
                row: spec.row,
                column: col,
                value,
            })?;
            points.push((date.clone(), value));
        }
        out.push(LabeledSeries {
            labels: spec.labels(),
            points,
        });
    }
    Ok(out)
}

/// Extract every sheet the schema declares for this workbook.  Inert workbooks
/// give nothing.
pub fn extract_workbook(
    workbook: &LoadedWorkbook,
    schema: &Workbook,
) -> Result<Vec<LabeledSeries>, ExtractError> {
    let mut out = Vec::new();
    for sheet in schema.sheets.iter().flatten() {
        let grid = workbook
            .sheet(sheet.sheet)
            .ok_or(ExtractError::MissingSheet {
                sheet: sheet.sheet,
                available: workbook.len(),
            })?;
        out.extend(extract(grid, sheet)?);
    }
    Ok(out)
}
