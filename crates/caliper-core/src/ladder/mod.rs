//! Maturity ladder: levelled predicates, the execution engine, and the
//! evidence documents derived from their results.

pub mod engine;
pub mod evidence;
pub mod level1;
pub mod level2;
pub mod level3;

pub use engine::{
    default_predicates, run_ladder, LadderOutcome, Predicate, RunContext, DEFAULT_FACT_BOUND,
    PREDICATE_SLA_MS,
};
pub use evidence::build_evidence;
