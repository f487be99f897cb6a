pub mod config;
pub mod context;
pub mod events;
pub mod ledger;
pub mod lifecycle;
pub mod normalize;
pub mod rollup;
pub mod types;
pub mod visibility;

pub use config::Config;
pub use context::{Caller, RequestContext};
pub use ledger::Ledger;
pub use normalize::normalize;
pub use rollup::{AssignmentSummary, OverallResult, TestStatistics};
pub use types::*;
