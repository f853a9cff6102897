/// Centre or scale columns (rows = observations, columns = features)
pub trait MatOps {
    type Mat;
    type Scalar;

    /// z-score each column with the unbiased standard deviation;
    /// constant columns are only centred
    fn scale_columns_inplace(&mut self);
    fn scale_columns(&self) -> Self::Mat;
    fn centre_columns_inplace(&mut self);
    fn centre_columns(&self) -> Self::Mat;
}

/// Conversion between `ndarray` and `nalgebra` dense matrices
pub trait ConvertMatOps {
    type Other;

    fn to_dmatrix(&self) -> Self::Other;
}
