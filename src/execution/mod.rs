pub mod join;
pub mod operator;
pub mod sort;

pub use join::SortMergeJoinOperator;
pub use operator::{BacktrackingIter, MemScan, QueryOperator, Run};
pub use sort::SortOperator;
