// Fee estimation for scheduled transfers
pub mod estimator;

pub use estimator::{CongestionLevel, FeeConfig, FeeEstimator, FeeQuote, QuoteSource};
