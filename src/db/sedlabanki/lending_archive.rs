use std::sync::Arc;

use jiff::civil::Date;
use log::{error, info, warn};
use thiserror::Error;

use super::calendar::{CalendarError, PublicationCalendar};
use super::grid::{extract_workbook, ExtractError, LabeledSeries};
use super::ledger::{Ledger, LedgerError};
use super::resolver::{anchored_start, resolve_source, ResolveError, WorkbookFetcher};
use super::schema::{LedgerSchema, Resolution, SourceSchema};
use crate::interval::month::Month;
use crate::utils::cancel::CancelToken;
use crate::utils::lib_http::{Download, HttpClient};
use crate::utils::retry::RetryPolicy;

pub type CalendarResult = Result<PublicationCalendar, Arc<CalendarError>>;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("{source_name}: {source}")]
    Calendar {
        source_name: String,
        source: Arc<CalendarError>,
    },
    #[error("{source_name}: {url} ({month}): {source}")]
    Extract {
        source_name: String,
        url: String,
        month: Month,
        source: ExtractError,
    },
    #[error("{source_name}: failed to load release {month}: {source}")]
    Ledger {
        source_name: String,
        month: Month,
        source: LedgerError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    pub source_name: String,
    pub month: Month,
    pub rows: usize,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub loaded: Vec<SourceReport>,
    pub failed: Vec<SourceError>,
    /// Sources not attempted because the run was cancelled.
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Monthly lending statistics from the central bank, appended to a DuckDB
/// ledger one source at a time.
pub struct LendingArchive {
    pub duckdb_path: String,
    pub schema: LedgerSchema,
    /// How many months to step back before giving up on a source.
    pub max_lookback: u32,
    pub retry: RetryPolicy,
}

impl LendingArchive {
    /// Download the publication calendar if any source is anchored to it.
    /// Early in the year, before every anchored source has had a release,
    /// last year's calendar is added as well.
    pub fn fetch_calendar(&self, client: &impl Download, today: Date) -> Option<CalendarResult> {
        let events: Vec<&str> = self
            .schema
            .sources
            .iter()
            .filter_map(|s| match &s.resolution {
                Resolution::Calendar { event } => Some(event.as_str()),
                Resolution::Unanchored => None,
            })
            .collect();
        if events.is_empty() {
            return None;
        }
        let template = self.schema.calendar_url.as_ref()?;
        let this_month = Month::containing(today);
        let current = PublicationCalendar::fetch(client, &template.format(&this_month));
        let complete = matches!(
            &current,
            Ok(calendar) if events.iter().all(|e| calendar.latest_release(e, today).is_some())
        );
        if complete {
            return Some(current.map_err(Arc::new));
        }

        let previous = PublicationCalendar::fetch(client, &template.format(&this_month.year_before()));
        let calendar = match (current, previous) {
            (Ok(current), Ok(previous)) => Ok(current.merge(previous)),
            (Ok(current), Err(e)) => {
                warn!("{}", e);
                Ok(current)
            }
            // this year's calendar isn't out yet
            (Err(CalendarError::NotFound(url)), Ok(previous)) => {
                warn!("publication calendar {} not found, using last year's", url);
                Ok(previous)
            }
            (Err(e), _) => Err(e),
        };
        Some(calendar.map_err(Arc::new))
    }

    fn start_month(
        &self,
        source: &SourceSchema,
        calendar: Option<&CalendarResult>,
        today: Date,
    ) -> Result<Month, SourceError> {
        match &source.resolution {
            Resolution::Unanchored => Ok(Month::containing(today)),
            Resolution::Calendar { event } => {
                let err = |e: Arc<CalendarError>| SourceError::Calendar {
                    source_name: source.name.clone(),
                    source: e,
                };
                match calendar {
                    Some(Ok(cal)) => {
                        anchored_start(cal, event, today).map_err(|e| err(Arc::new(e)))
                    }
                    Some(Err(e)) => Err(err(e.clone())),
                    None => Err(err(Arc::new(CalendarError::NoRelease(event.clone())))),
                }
            }
        }
    }

    /// Resolve, extract and load one source.  All the workbooks of the source
    /// are extracted before anything is written, then loaded in one transaction.
    pub fn update_source<W: WorkbookFetcher>(
        &self,
        fetcher: &W,
        calendar: Option<&CalendarResult>,
        ledger: &mut Ledger,
        source: &SourceSchema,
        today: Date,
    ) -> Result<SourceReport, SourceError> {
        let start = self.start_month(source, calendar, today)?;
        let resolved = resolve_source(fetcher, source, start, self.max_lookback)?;
        info!("{} - {}", source.name, resolved.month);

        let mut series: Vec<LabeledSeries> = Vec::new();
        for wb in &resolved.workbooks {
            let extracted =
                extract_workbook(&wb.workbook, wb.schema).map_err(|e| SourceError::Extract {
                    source_name: source.name.clone(),
                    url: wb.url.clone(),
                    month: resolved.month,
                    source: e,
                })?;
            series.extend(extracted);
        }

        let rows = ledger.load(&series).map_err(|e| SourceError::Ledger {
            source_name: source.name.clone(),
            month: resolved.month,
            source: e,
        })?;
        Ok(SourceReport {
            source_name: source.name.clone(),
            month: resolved.month,
            rows,
        })
    }

    /// Process every source in declaration order.  A failing source doesn't
    /// stop the others; cancellation is checked between sources.
    pub fn run<W: WorkbookFetcher>(
        &self,
        fetcher: &W,
        calendar: Option<&CalendarResult>,
        ledger: &mut Ledger,
        today: Date,
        cancel: &CancelToken,
    ) -> RunReport {
        let mut report = RunReport::default();
        for source in &self.schema.sources {
            if cancel.is_cancelled() {
                warn!("run cancelled, skipping {}", source.name);
                report.skipped.push(source.name.clone());
                continue;
            }
            match self.update_source(fetcher, calendar, ledger, source, today) {
                Ok(r) => report.loaded.push(r),
                Err(e) => {
                    error!("{}", e);
                    report.failed.push(e);
                }
            }
        }
        report
    }

    /// Update the DuckDB ledger with the latest release of every source.
    pub fn update_duckdb(
        &self,
        client: &HttpClient,
        today: Date,
        cancel: &CancelToken,
    ) -> Result<RunReport, LedgerError> {
        let mut ledger = Ledger::open(&self.duckdb_path, &self.schema, self.retry)?;
        let calendar = self.fetch_calendar(client, today);
        Ok(self.run(client, calendar.as_ref(), &mut ledger, today, cancel))
    }
}

#[cfg(test)]
mod tests {
    use calamine::{Data, Range};
    use jiff::civil::date;

    use super::*;
    use crate::db::sedlabanki::grid::LoadedWorkbook;
    use crate::db::sedlabanki::resolver::tests::{one_sheet_workbook, StubFetcher};
    use crate::db::sedlabanki::schema::RowLabels;
    use crate::interval::month::month;
    use crate::utils::lib_http::FetchError;

    fn archive(text: &str) -> LendingArchive {
        LendingArchive {
            duckdb_path: ":memory:".to_string(),
            schema: LedgerSchema::from_json5(text).unwrap(),
            max_lookback: 24,
            retry: RetryPolicy::none(),
        }
    }

    const ONE_SOURCE: &str = r#"{
        table: "credit",
        labels: { sector: "required" },
        sources: [{
            name: "Lífeyrissjóðir",
            workbooks: [
                {
                    url: "https://x.is/{year}/LIF_geirum_{year}M{month}.xlsx",
                    sheets: [{ dates_row: 1, from_column: 1, rows: [
                        { institute: "pension", sector: "household", category: "indexed", row: 3 },
                    ]}],
                },
                { url: "https://x.is/{year}/LIF_tegund_{year}M{month}.xlsx" },
            ],
        }],
    }"#;

    const TWO_SOURCES: &str = r#"{
        table: "credit",
        calendar_url: "https://x.is/Birtingar_{year}.ics",
        sources: [
            {
                name: "Bankakerfi",
                resolution: { kind: "calendar", event: "Bankakerfi" },
                workbooks: [{
                    url: "https://x.is/{year}/INN_Utlan_{month:02d}{year}.xlsx",
                    sheets: [{ dates_row: 1, from_column: 1, rows: [
                        { institute: "bank", sector: "household", category: "indexed", row: 3 },
                    ]}],
                }],
            },
            {
                name: "Lífeyrissjóðir",
                workbooks: [{
                    url: "https://x.is/{year}/LIF_geirum_{year}M{month}.xlsx",
                    sheets: [{ dates_row: 1, from_column: 1, rows: [
                        { institute: "pension", sector: "household", category: "indexed", row: 3 },
                    ]}],
                }],
            },
        ],
    }"#;

    fn pension_indexed() -> RowLabels {
        RowLabels {
            institute: "pension".to_string(),
            sector: Some("household".to_string()),
            industry: None,
            category: Some("indexed".to_string()),
        }
    }

    #[test]
    fn end_to_end() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
        let archive = archive(ONE_SOURCE);
        let fetcher = StubFetcher::default()
            .publish("https://x.is/2024/LIF_geirum_2024M2.xlsx", one_sheet_workbook());
        let mut ledger = Ledger::in_memory(&archive.schema).unwrap();

        let report = archive.run(&fetcher, None, &mut ledger, date(2024, 3, 18), &CancelToken::new());
        assert!(report.is_success());
        assert_eq!(
            report.loaded,
            vec![SourceReport {
                source_name: "Lífeyrissjóðir".to_string(),
                month: month(2024, 2),
                rows: 2,
            }]
        );
        assert_eq!(
            ledger.get_series(&pension_indexed()).unwrap(),
            vec![
                (Some("2024-01".to_string()), Some(5_000_000)),
                (Some("2024-02".to_string()), None),
            ]
        );

        // a second run appends the same rows again
        let report = archive.run(&fetcher, None, &mut ledger, date(2024, 3, 18), &CancelToken::new());
        assert!(report.is_success());
        assert_eq!(ledger.row_count().unwrap(), 4);
    }

    #[test]
    fn schema_mismatch_loads_nothing() {
        let archive = archive(&ONE_SOURCE.replace("row: 3 }", "row: 30 }"));
        let fetcher = StubFetcher::default()
            .publish("https://x.is/2024/LIF_geirum_2024M3.xlsx", one_sheet_workbook());
        let mut ledger = Ledger::in_memory(&archive.schema).unwrap();

        let report = archive.run(&fetcher, None, &mut ledger, date(2024, 3, 18), &CancelToken::new());
        assert!(!report.is_success());
        assert!(report.loaded.is_empty());
        match &report.failed[0] {
            SourceError::Extract { url, source, .. } => {
                assert_eq!(url, "https://x.is/2024/LIF_geirum_2024M3.xlsx");
                assert!(matches!(source, ExtractError::SchemaMismatch { row: 30, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ledger.row_count().unwrap(), 0);
    }

    #[test]
    fn calendar_failure_leaves_unanchored_sources_alone() {
        let archive = archive(TWO_SOURCES);
        let fetcher = StubFetcher::default()
            .publish("https://x.is/2024/LIF_geirum_2024M3.xlsx", one_sheet_workbook());
        let mut ledger = Ledger::in_memory(&archive.schema).unwrap();
        let calendar: CalendarResult = Err(Arc::new(CalendarError::NotFound(
            "https://x.is/Birtingar_2024.ics".to_string(),
        )));

        let report = archive.run(
            &fetcher,
            Some(&calendar),
            &mut ledger,
            date(2024, 3, 18),
            &CancelToken::new(),
        );
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            &report.failed[0],
            SourceError::Calendar { source_name, .. } if source_name == "Bankakerfi"
        ));
        assert_eq!(report.loaded.len(), 1);
        assert_eq!(report.loaded[0].source_name, "Lífeyrissjóðir");
        assert_eq!(ledger.row_count().unwrap(), 2);
    }

    #[test]
    fn calendar_anchored_source() {
        let archive = archive(TWO_SOURCES);
        let mut range: Range<Data> = Range::new((0, 0), (2, 1));
        range.set_value((0, 1), Data::String("2024-01".to_string()));
        range.set_value((2, 1), Data::Float(2.5));
        let fetcher = StubFetcher::default()
            .publish(
                "https://x.is/2024/INN_Utlan_012024.xlsx",
                LoadedWorkbook::new(vec![("Sheet1".to_string(), range)]),
            )
            .publish("https://x.is/2024/LIF_geirum_2024M3.xlsx", one_sheet_workbook());
        let mut ledger = Ledger::in_memory(&archive.schema).unwrap();
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nSUMMARY:Bankakerfi\nDTSTART:20240305T090000Z\nEND:VEVENT\nEND:VCALENDAR\n";
        let calendar: CalendarResult = PublicationCalendar::parse_ics(ics).map_err(Arc::new);

        let report = archive.run(
            &fetcher,
            Some(&calendar),
            &mut ledger,
            date(2024, 3, 18),
            &CancelToken::new(),
        );
        assert!(report.is_success());
        // released in March, carries February, found for January
        assert_eq!(report.loaded[0].month, month(2024, 1));
        assert_eq!(
            fetcher.calls.borrow()[0],
            "https://x.is/2024/INN_Utlan_022024.xlsx"
        );
        let bank = RowLabels {
            institute: "bank".to_string(),
            ..pension_indexed()
        };
        assert_eq!(
            ledger.get_series(&bank).unwrap(),
            vec![(Some("2024-01".to_string()), Some(2_500_000))]
        );
    }

    #[test]
    fn cancelled_run_skips_sources() {
        let archive = archive(TWO_SOURCES);
        let fetcher = StubFetcher::default();
        let mut ledger = Ledger::in_memory(&archive.schema).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = archive.run(&fetcher, None, &mut ledger, date(2024, 3, 18), &cancel);
        assert!(!report.is_success());
        assert_eq!(report.skipped, vec!["Bankakerfi", "Lífeyrissjóðir"]);
        assert!(fetcher.calls.borrow().is_empty());
    }

    struct NoCalendar;

    impl Download for NoCalendar {
        fn download(&self, _url: &str) -> Result<Option<Vec<u8>>, FetchError> {
            Ok(None)
        }
    }

    /// Serves calendar files by url, 404 for anything else.
    struct Calendars(Vec<(&'static str, &'static str)>);

    impl Download for Calendars {
        fn download(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
            Ok(self
                .0
                .iter()
                .find(|(u, _)| *u == url)
                .map(|(_, body)| body.as_bytes().to_vec()))
        }
    }

    const CALENDAR_2024: &str = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nSUMMARY:Bankakerfi\nDTSTART:20241205T090000Z\nEND:VEVENT\nEND:VCALENDAR\n";
    const CALENDAR_2025: &str = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nSUMMARY:Bankakerfi\nDTSTART:20250107T090000Z\nEND:VEVENT\nEND:VCALENDAR\n";

    #[test]
    fn early_january_uses_last_years_calendar() {
        let archive = archive(TWO_SOURCES);
        let calendars = Calendars(vec![
            ("https://x.is/Birtingar_2024.ics", CALENDAR_2024),
            ("https://x.is/Birtingar_2025.ics", CALENDAR_2025),
        ]);
        let today = date(2025, 1, 3);
        let calendar = archive.fetch_calendar(&calendars, today);
        let fetcher = StubFetcher::default()
            .publish("https://x.is/2024/INN_Utlan_112024.xlsx", one_sheet_workbook())
            .publish("https://x.is/2024/LIF_geirum_2024M12.xlsx", one_sheet_workbook());
        let mut ledger = Ledger::in_memory(&archive.schema).unwrap();

        let report = archive.run(&fetcher, calendar.as_ref(), &mut ledger, today, &CancelToken::new());
        assert!(report.is_success(), "{:?}", report.failed);
        // released in December, carries November
        assert_eq!(report.loaded[0].source_name, "Bankakerfi");
        assert_eq!(report.loaded[0].month, month(2024, 11));
        assert_eq!(fetcher.calls.borrow()[0], "https://x.is/2024/INN_Utlan_112024.xlsx");
    }

    #[test]
    fn last_years_calendar_when_this_years_is_missing() {
        let archive = archive(TWO_SOURCES);
        let calendars = Calendars(vec![("https://x.is/Birtingar_2024.ics", CALENDAR_2024)]);
        match archive.fetch_calendar(&calendars, date(2025, 1, 3)) {
            Some(Ok(calendar)) => assert_eq!(
                calendar.latest_release("Bankakerfi", date(2025, 1, 3)),
                Some("2024-12-05T09:00:00Z".parse().unwrap())
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn calendar_only_fetched_when_needed() {
        let archive1 = archive(ONE_SOURCE);
        assert!(archive1.fetch_calendar(&NoCalendar, date(2024, 3, 18)).is_none());

        let archive2 = archive(TWO_SOURCES);
        match archive2.fetch_calendar(&NoCalendar, date(2024, 3, 18)) {
            Some(Err(e)) => {
                assert!(matches!(*e, CalendarError::NotFound(ref url) if url == "https://x.is/Birtingar_2024.ics"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
