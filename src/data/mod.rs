//! Restricted numeric and tabular engines.
//!
//! These are the Rust-side counterparts of the `safe_data` module shipped
//! to sandboxed scripts. Callers use them to prepare context values and
//! to post-process a run's JSON output.

pub mod array;
pub mod table;
pub mod value;

pub use array::{SafeArray, Summary};
pub use table::{
    AggOutput, Aggregation, ColumnSummary, Dtype, GroupBy, GroupValue, JoinHow, Operator, RowRef,
    SafeTable,
};
