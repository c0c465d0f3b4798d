// Lending statistics published by Seðlabanki Íslands as monthly spreadsheets.

pub mod calendar;
pub mod grid;
pub mod ledger;
pub mod lending_archive;
pub mod resolver;
pub mod schema;
