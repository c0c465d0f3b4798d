use std::fmt;
use std::str::FromStr;

use jiff::civil::Date;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("{0}")]
pub struct ParseError(pub String);

/// A calendar month, e.g. 2024-03.  This is the period of a monthly release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    year: i16,
    month: i8,
}

/// Construct a month.  Panics if the month of year is not in 1..=12.
#[cfg(test)]
pub fn month(year: i16, month: i8) -> Month {
    match Month::new(year, month) {
        Ok(m) => m,
        Err(e) => panic!("{}", e),
    }
}

impl Month {
    pub fn new(year: i16, month: i8) -> Result<Month, ParseError> {
        if !(1..=12).contains(&month) {
            return Err(ParseError(format!("Month of year {} not in 1..=12", month)));
        }
        if !(-9999..=9999).contains(&year) {
            return Err(ParseError(format!("Year {} out of range", year)));
        }
        Ok(Month { year, month })
    }

    /// Return the month that contains this date.
    pub fn containing(day: Date) -> Month {
        Month {
            year: day.year(),
            month: day.month(),
        }
    }

    pub fn year(&self) -> i16 {
        self.year
    }

    pub fn month(&self) -> i8 {
        self.month
    }

    /// Step back exactly one calendar month, rolling over the year boundary.
    pub fn previous(&self) -> Month {
        if self.month == 1 {
            Month {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Month {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// The same month a year earlier.
    pub fn year_before(&self) -> Month {
        Month {
            year: self.year - 1,
            month: self.month,
        }
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| ParseError(format!("Failed parsing {} as a month", s)))?;
        let year = y
            .parse::<i16>()
            .map_err(|_| ParseError(format!("Failed parsing {} as a month", s)))?;
        let month = m
            .parse::<i8>()
            .map_err(|_| ParseError(format!("Failed parsing {} as a month", s)))?;
        Month::new(year, month)
    }
}
