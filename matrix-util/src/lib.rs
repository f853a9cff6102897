pub mod common_io; // buffered, gzip-aware file helpers
pub mod dmatrix_util; // covariance, inversion and PCA with nalgebra
pub mod ndarray_stat; // running and order statistics
pub mod ndarray_util; // column operations on ndarray
pub mod traits;
pub mod utils; // membership partitioning and block intervals
