use approx::assert_abs_diff_eq;
use matrix_util::traits::{ConvertMatOps, MatOps};
use ndarray::{array, Axis};

#[test]
fn scaled_columns_have_unit_sd() {
    let mut xx = array![[1.0_f32, 10.0, 3.0], [2.0, 20.0, 3.0], [3.0, 60.0, 3.0]];
    xx.scale_columns_inplace();

    let mu = xx.mean_axis(Axis(0)).unwrap();
    let sd = xx.std_axis(Axis(0), 1.0);

    for j in 0..2 {
        assert_abs_diff_eq!(mu[j], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sd[j], 1.0, epsilon = 1e-6);
    }
    // constant column is centred only
    assert_abs_diff_eq!(sd[2], 0.0);
    assert_abs_diff_eq!(mu[2], 0.0);
}

#[test]
fn dmatrix_conversion_keeps_layout() {
    let xx = array![[1.0_f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
    let dm = xx.to_dmatrix();
    assert_eq!(dm.shape(), (3, 2));
    assert_abs_diff_eq!(dm[(2, 1)], 6.0);
    let back = matrix_util::ndarray_util::dmatrix_to_array2(&dm);
    assert_eq!(back, xx);
}
