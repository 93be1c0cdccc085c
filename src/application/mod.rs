//! Application layer: the query scheduler and the matching pipeline.
//!
//! The Calc Manager admits queries, Calc Workers claim them, narrow the
//! candidates with the inverted indexes and run the homomorphic equality
//! test chunk by chunk.

mod calc_manager;
pub mod matching;
pub mod merge;
mod queue;
mod worker;

pub use calc_manager::{CalcManager, ManagerSettings};
pub use matching::MatchEvaluator;
pub use queue::{ConcurrentMapQueue, Rejected};
