pub mod cache;
pub mod distance;
pub mod grouped_op;
pub mod hypothesis;
pub mod preprocess;
pub mod qc;
pub mod trajectory;
