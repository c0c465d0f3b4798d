// The statistics publication calendar, an iCalendar feed with one event per
// scheduled release.

use jiff::civil::{Date, DateTime};
use jiff::tz::TimeZone;
use jiff::Timestamp;
use log::info;
use thiserror::Error;

use crate::utils::lib_http::{Download, FetchError};

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("failed to download publication calendar {url}: {source}")]
    Fetch { url: String, source: FetchError },
    #[error("publication calendar {0} not found")]
    NotFound(String),
    #[error("invalid publication calendar, line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("no past release of {0} in the publication calendar")]
    NoRelease(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub name: String,
    pub start: Timestamp,
}

/// Release events sorted by start time.  Built once per run and not modified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublicationCalendar {
    events: Vec<CalendarEvent>,
}

impl PublicationCalendar {
    pub fn new(mut events: Vec<CalendarEvent>) -> PublicationCalendar {
        events.sort_by_key(|e| e.start);
        PublicationCalendar { events }
    }

    /// Combine the events of two calendars, e.g. this year's and last year's.
    pub fn merge(self, other: PublicationCalendar) -> PublicationCalendar {
        let mut events = self.events;
        events.extend(other.events);
        PublicationCalendar::new(events)
    }

    pub fn fetch(client: &impl Download, url: &str) -> Result<PublicationCalendar, CalendarError> {
        info!("downloading publication calendar {}", url);
        let bytes = client
            .download(url)
            .map_err(|source| CalendarError::Fetch {
                url: url.to_string(),
                source,
            })?
            .ok_or_else(|| CalendarError::NotFound(url.to_string()))?;
        let calendar = PublicationCalendar::parse_ics(&String::from_utf8_lossy(&bytes))?;
        info!("  found {} events", calendar.events.len());
        Ok(calendar)
    }

    /// The start of the most recent release of `name` on or before `today`.
    pub fn latest_release(&self, name: &str, today: Date) -> Option<Timestamp> {
        self.events
            .iter()
            .filter(|e| e.name == name)
            .filter(|e| e.start.to_zoned(TimeZone::UTC).date() <= today)
            .map(|e| e.start)
            .max()
    }

    pub fn parse_ics(text: &str) -> Result<PublicationCalendar, CalendarError> {
        let lines = unfold(text);
        if !lines.iter().any(|(_, l)| l.trim() == "BEGIN:VCALENDAR") {
            return Err(CalendarError::Parse {
                line: 1,
                message: "not an iCalendar document".to_string(),
            });
        }

        let mut events: Vec<CalendarEvent> = Vec::new();
        let mut in_event = false;
        let mut name: Option<String> = None;
        let mut start: Option<Timestamp> = None;
        for (n, line) in lines {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let mut parts = key.split(';');
            let property = parts.next().unwrap_or_default().to_ascii_uppercase();
            let params: Vec<&str> = parts.collect();
            match (property.as_str(), value) {
                ("BEGIN", "VEVENT") => {
                    in_event = true;
                    name = None;
                    start = None;
                }
                ("END", "VEVENT") => {
                    if let (Some(name), Some(start)) = (name.take(), start.take()) {
                        events.push(CalendarEvent { name, start });
                    }
                    in_event = false;
                }
                ("SUMMARY", _) if in_event => name = Some(unescape(value)),
                ("DTSTART", _) if in_event => {
                    let ts = parse_dtstart(&params, value)
                        .map_err(|message| CalendarError::Parse { line: n, message })?;
                    start = Some(ts);
                }
                _ => {}
            }
        }
        Ok(PublicationCalendar::new(events))
    }
}

/// Join continuation lines, keeping the line number where each property starts.
fn unfold(text: &str) -> Vec<(usize, String)> {
    let mut out: Vec<(usize, String)> = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix([' ', '\t']) {
            if let Some((_, last)) = out.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        out.push((i + 1, line.to_string()));
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out.trim().to_string()
}

fn parse_dtstart(params: &[&str], value: &str) -> Result<Timestamp, String> {
    let tz = params
        .iter()
        .find_map(|p| p.strip_prefix("TZID="))
        .and_then(|name| TimeZone::get(name.trim_matches('"')).ok())
        .unwrap_or(TimeZone::UTC);
    let value = value.trim();
    if value.len() == 8 {
        let day = Date::strptime("%Y%m%d", value).map_err(|e| e.to_string())?;
        return day
            .to_zoned(tz)
            .map(|z| z.timestamp())
            .map_err(|e| e.to_string());
    }
    let (value, tz) = match value.strip_suffix('Z') {
        Some(v) => (v, TimeZone::UTC),
        None => (value, tz),
    };
    let dt = DateTime::strptime("%Y%m%dT%H%M%S", value).map_err(|e| e.to_string())?;
    dt.to_zoned(tz).map(|z| z.timestamp()).map_err(|e| e.to_string())
}
