// Order execution module
pub mod executor;

pub use crate::broker::OrderError;
pub use executor::{affordable_quantity, OrderExecutor};
