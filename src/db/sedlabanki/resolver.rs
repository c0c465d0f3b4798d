// Find the most recent published release of a source by stepping back one
// calendar month at a time, a 404 meaning "not published yet".

use calamine::XlsxError;
use jiff::civil::Date;
use jiff::tz::TimeZone;
use log::{debug, info};
use thiserror::Error;

use super::calendar::{CalendarError, PublicationCalendar};
use super::grid::LoadedWorkbook;
use super::schema::{SourceSchema, Workbook};
use crate::interval::month::Month;
use crate::utils::lib_http::{Download, FetchError, HttpClient};

#[derive(Error, Debug)]
pub enum WorkbookError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed spreadsheet: {0}")]
    Xlsx(#[from] XlsxError),
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("{source_name}: nothing published from {oldest} to {start}")]
    NotFoundWithinLookback {
        source_name: String,
        start: Month,
        oldest: Month,
    },
    #[error("{source_name}: failed to get {url} for {month}: {source}")]
    Transport {
        source_name: String,
        url: String,
        month: Month,
        source: WorkbookError,
    },
}

/// Get and open a spreadsheet.  `Ok(None)` when it's not published.
pub trait WorkbookFetcher {
    fn fetch_workbook(&self, url: &str) -> Result<Option<LoadedWorkbook>, WorkbookError>;
}

impl WorkbookFetcher for HttpClient {
    fn fetch_workbook(&self, url: &str) -> Result<Option<LoadedWorkbook>, WorkbookError> {
        match self.download(url)? {
            Some(bytes) => Ok(Some(LoadedWorkbook::from_xlsx(bytes)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct ResolvedWorkbook<'a> {
    pub schema: &'a Workbook,
    pub url: String,
    pub workbook: LoadedWorkbook,
}

#[derive(Debug)]
pub struct ResolvedSource<'a> {
    pub month: Month,
    pub workbooks: Vec<ResolvedWorkbook<'a>>,
}

/// Releases carry the previous month's data, so start one month before the
/// latest past release of `event`.
pub fn anchored_start(
    calendar: &PublicationCalendar,
    event: &str,
    today: Date,
) -> Result<Month, CalendarError> {
    let release = calendar
        .latest_release(event, today)
        .ok_or_else(|| CalendarError::NoRelease(event.to_string()))?;
    Ok(Month::containing(release.to_zoned(TimeZone::UTC).date()).previous())
}

/// Try `start`, then each earlier month, at most `max_lookback` steps back.
fn step_back<T, F>(
    source_name: &str,
    start: Month,
    max_lookback: u32,
    mut attempt: F,
) -> Result<(Month, T), ResolveError>
where
    F: FnMut(Month) -> Result<Option<T>, ResolveError>,
{
    let mut month = start;
    for step in 0..=max_lookback {
        if let Some(value) = attempt(month)? {
            return Ok((month, value));
        }
        debug!("{}: nothing published for {}", source_name, month);
        if step < max_lookback {
            month = month.previous();
        }
    }
    Err(ResolveError::NotFoundWithinLookback {
        source_name: source_name.to_string(),
        start,
        oldest: month,
    })
}

fn fetch<W: WorkbookFetcher>(
    fetcher: &W,
    source_name: &str,
    schema: &Workbook,
    month: Month,
) -> Result<Option<(String, LoadedWorkbook)>, ResolveError> {
    let url = schema.url.format(&month);
    match fetcher.fetch_workbook(&url) {
        Ok(Some(workbook)) => Ok(Some((url, workbook))),
        Ok(None) => Ok(None),
        Err(source) => Err(ResolveError::Transport {
            source_name: source_name.to_string(),
            url,
            month,
            source,
        }),
    }
}

/// Latest release of a single workbook.  Return the opened workbook, its url
/// and the month it was found for.
pub fn resolve_latest<W: WorkbookFetcher>(
    fetcher: &W,
    source_name: &str,
    schema: &Workbook,
    start: Month,
    max_lookback: u32,
) -> Result<(LoadedWorkbook, String, Month), ResolveError> {
    let (month, (url, workbook)) = step_back(source_name, start, max_lookback, |month| {
        fetch(fetcher, source_name, schema, month)
    })?;
    Ok((workbook, url, month))
}

/// Latest month for which every workbook of the source with sheets is
/// published.  Workbooks without sheets are never fetched.
pub fn resolve_source<'a, W: WorkbookFetcher>(
    fetcher: &W,
    source: &'a SourceSchema,
    start: Month,
    max_lookback: u32,
) -> Result<ResolvedSource<'a>, ResolveError> {
    let (month, workbooks) = step_back(&source.name, start, max_lookback, |month| {
        let mut found = Vec::new();
        for schema in source.active_workbooks() {
            match fetch(fetcher, &source.name, schema, month)? {
                Some((url, workbook)) => found.push(ResolvedWorkbook {
                    schema,
                    url,
                    workbook,
                }),
                None => return Ok(None),
            }
        }
        Ok(Some(found))
    })?;
    info!("{}: latest release is for {}", source.name, month);
    Ok(ResolvedSource { month, workbooks })
}
