//! riskdash core library: cache-or-compute resolution of AI enrichments
//! over the controls, internal loss, external loss and issues datasets.
//!
//! The main entry point is [`resolver::FunctionResolver`], which answers
//! "give me function F's result for record R in dataset D" from the result
//! cache or by invoking a registered [`compute::Computable`]. Storage goes
//! through [`store::Database`], which rewrites one portable SQL vocabulary
//! into the dialect of whichever backend was selected at startup.

pub mod batch;
pub mod compute;
pub mod config;
pub mod datasets;
pub mod error;
pub mod export;
pub mod ingest;
pub mod progress;
pub mod resolver;
pub mod store;
pub mod types;
