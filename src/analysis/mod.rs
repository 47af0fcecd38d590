//! Build-time aggregation.
//!
//! [`AggregationPipeline`] drives one collection pass; the aggregator
//! holds the filters and the report builder it is made of.

pub mod aggregator;
pub mod pipeline;

pub use aggregator::slowest_packages;
pub use pipeline::{AggregationPipeline, PipelineConfig};
