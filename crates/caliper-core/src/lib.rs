//! caliper-core: model-maturity measurement for MBSE tool exports.
//!
//! One XML export goes through a fixed pipeline: schema discovery, vendor
//! normalization into a canonical SQLite store, derived IR tables, a levelled
//! ladder of maturity predicates, evidence documents, and an FTS retrieval
//! index that grounds question answering.
//!
//! ```no_run
//! use std::path::Path;
//! use caliper_core::ingest::{run_pipeline, PipelineOptions};
//!
//! let report = run_pipeline(
//!     Path::new("export.xml"),
//!     Path::new("data"),
//!     &PipelineOptions::default(),
//! )?;
//! println!("maturity level {}", report.maturity_level);
//! # Ok::<(), caliper_core::CaliperError>(())
//! ```

pub mod errors;
pub mod ingest;
pub mod ladder;
pub mod models;
pub mod rag;
pub mod store;

pub use errors::{CaliperError, CaliperResult};
pub use ingest::{run_pipeline, PipelineOptions};
pub use ladder::{run_ladder, LadderOutcome, RunContext};
pub use models::{RunReport, Verdict};
pub use rag::{ask, Answer, OllamaProvider, ProviderOptions};
pub use store::Store;
