pub mod allocation;
pub mod coverage;
pub mod engine;
pub mod equity;
pub mod reserve;
pub mod tranche;

pub use allocation::{allocate_loans, AllocationConstraints, AllocationReport};
pub use coverage::{CoverageState, CoverageTestConfig, CoverageTestKind};
pub use engine::{calculate_waterfall, WaterfallEngine, WaterfallInput, WaterfallResult};
pub use reserve::ReserveConfig;
pub use tranche::{TrancheConfig, TrancheTerms, TrancheType};
