pub mod cancel;
pub mod lib_duckdb;
pub mod lib_http;
pub mod retry;
