//! Ingest: XML schema discovery, vendor adapters, the batched loader, IR
//! derivation, and the orchestrating pipeline.

pub mod adapter;
pub mod discovery;
pub mod ir;
pub mod loader;
pub mod pipeline;

pub use adapter::{AdapterRegistry, AdapterRegistryOptions, VendorAdapter};
pub use discovery::{discover_schema, DiscoveredSchema, SchemaConfig};
pub use ir::build_ir;
pub use loader::{Loader, LoaderOptions};
pub use pipeline::{run_pipeline, PipelineOptions};
