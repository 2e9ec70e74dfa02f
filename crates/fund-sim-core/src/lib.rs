pub mod cashflow;
pub mod config;
pub mod error;
pub mod loans;
pub mod metrics;
pub mod monte_carlo;
pub mod notify;
pub mod pipeline;
pub mod price_path;
pub mod reinvestment;
pub mod rng;
pub mod time_value;
pub mod types;
pub mod waterfall;

pub use config::FundConfig;
pub use error::FundSimError;
pub use types::*;

/// Standard result type for all fund simulation operations
pub type FundSimResult<T> = Result<T, FundSimError>;
