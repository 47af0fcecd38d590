//! Output datasets.

pub mod generator;

pub use generator::{write_csv_report, write_json_report};
