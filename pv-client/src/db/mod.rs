pub mod pv_queries;

pub use pv_queries::*;
