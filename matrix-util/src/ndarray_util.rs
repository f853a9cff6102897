pub use ndarray::prelude::*;

use crate::traits::*;
use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive, ToPrimitive};

impl<T> MatOps for ndarray::Array2<T>
where
    T: Float + FromPrimitive,
{
    type Mat = Self;
    type Scalar = T;

    fn scale_columns_inplace(&mut self) {
        let nrow = self.nrows();
        let ncol = self.ncols();
        if nrow == 0 {
            return;
        }
        let ddof = if nrow > 1 { T::one() } else { T::zero() };
        let Some(mu) = self.mean_axis(Axis(0)) else {
            return;
        };
        let sig = self.std_axis(Axis(0), ddof);

        for j in 0..ncol {
            if sig[j] > T::zero() {
                self.column_mut(j).mapv_inplace(|x| (x - mu[j]) / sig[j]);
            } else {
                self.column_mut(j).mapv_inplace(|x| x - mu[j]);
            }
        }
    }

    fn scale_columns(&self) -> Self::Mat {
        let mut xx = self.clone();
        xx.scale_columns_inplace();
        xx
    }

    fn centre_columns_inplace(&mut self) {
        let Some(mu) = self.mean_axis(Axis(0)) else {
            return;
        };
        for j in 0..self.ncols() {
            self.column_mut(j).mapv_inplace(|x| x - mu[j]);
        }
    }

    fn centre_columns(&self) -> Self::Mat {
        let mut xx = self.clone();
        xx.centre_columns_inplace();
        xx
    }
}

impl<T> ConvertMatOps for ndarray::Array2<T>
where
    T: Float + ToPrimitive,
{
    type Other = DMatrix<f64>;

    fn to_dmatrix(&self) -> Self::Other {
        DMatrix::<f64>::from_fn(self.nrows(), self.ncols(), |i, j| {
            self[(i, j)].to_f64().unwrap_or(f64::NAN)
        })
    }
}

/// Copy a `nalgebra` matrix into a row-major `ndarray` matrix
pub fn dmatrix_to_array2(xx: &DMatrix<f64>) -> Array2<f32> {
    Array2::from_shape_fn((xx.nrows(), xx.ncols()), |(i, j)| xx[(i, j)] as f32)
}
