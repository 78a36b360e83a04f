use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

use crate::TractResult;

/// Sigmoid of the linear combination of prototypes: `(K, nm) x (nm, Hp, Wp)`
/// to `(K, Hp, Wp)`.
pub fn coarse_masks(coeffs: ArrayView2<f32>, proto: ArrayView3<f32>) -> TractResult<Array3<f32>> {
    let (nm, hp, wp) = proto.dim();
    let flat = proto.to_shape((nm, hp * wp))?;
    let masks = coeffs.dot(&flat).mapv(|x| 1.0 / (1.0 + (-x).exp()));
    Ok(masks.into_shape_with_order((coeffs.nrows(), hp, wp))?)
}

/// ONNX `Resize`, linear mode, `half_pixel` coordinates.
pub fn resize_bilinear(input: ArrayView2<f32>, (oh, ow): (usize, usize)) -> Array2<f32> {
    let (ih, iw) = input.dim();
    let source = |dst: usize, len_in: usize, len_out: usize| {
        let x = (dst as f32 + 0.5) * len_in as f32 / len_out as f32 - 0.5;
        let x = x.clamp(0.0, (len_in - 1) as f32);
        let lo = x.floor() as usize;
        (lo, (lo + 1).min(len_in - 1), x - lo as f32)
    };
    Array2::from_shape_fn((oh, ow), |(y, x)| {
        let (y0, y1, ly) = source(y, ih, oh);
        let (x0, x1, lx) = source(x, iw, ow);
        let top = input[(y0, x0)] * (1.0 - lx) + input[(y0, x1)] * lx;
        let bottom = input[(y1, x0)] * (1.0 - lx) + input[(y1, x1)] * lx;
        top * (1.0 - ly) + bottom * ly
    })
}

fn bilinear_at(input: ArrayView2<f32>, mut y: f32, mut x: f32) -> f32 {
    let (h, w) = input.dim();
    if y < -1.0 || y > h as f32 || x < -1.0 || x > w as f32 {
        return 0.0;
    }
    y = y.max(0.0);
    x = x.max(0.0);
    let (mut y0, mut x0) = (y as usize, x as usize);
    let (y1, x1);
    if y0 >= h - 1 {
        y0 = h - 1;
        y1 = h - 1;
        y = y0 as f32;
    } else {
        y1 = y0 + 1;
    }
    if x0 >= w - 1 {
        x0 = w - 1;
        x1 = w - 1;
        x = x0 as f32;
    } else {
        x1 = x0 + 1;
    }
    let (ly, lx) = (y - y0 as f32, x - x0 as f32);
    let (hy, hx) = (1.0 - ly, 1.0 - lx);
    hy * hx * input[(y0, x0)]
        + hy * lx * input[(y0, x1)]
        + ly * hx * input[(y1, x0)]
        + ly * lx * input[(y1, x1)]
}

/// Average pooling RoI align of one single-channel map, legacy (non
/// half-pixel) coordinates. `sampling_ratio` 0 samples
/// `ceil(roi_size / resolution)` points per bin and axis.
pub fn roi_align(
    input: ArrayView2<f32>,
    roi: [f32; 4],
    spatial_scale: f32,
    resolution: usize,
    sampling_ratio: usize,
) -> Array2<f32> {
    let [x1, y1, x2, y2] = roi.map(|c| c * spatial_scale);
    let roi_w = (x2 - x1).max(1.0);
    let roi_h = (y2 - y1).max(1.0);
    let bin_w = roi_w / resolution as f32;
    let bin_h = roi_h / resolution as f32;
    let grid_h = if sampling_ratio > 0 { sampling_ratio } else { bin_h.ceil() as usize };
    let grid_w = if sampling_ratio > 0 { sampling_ratio } else { bin_w.ceil() as usize };
    let count = (grid_h * grid_w).max(1) as f32;
    Array2::from_shape_fn((resolution, resolution), |(ph, pw)| {
        let mut sum = 0.0;
        for iy in 0..grid_h {
            let y = y1 + ph as f32 * bin_h + (iy as f32 + 0.5) * bin_h / grid_h as f32;
            for ix in 0..grid_w {
                let x = x1 + pw as f32 * bin_w + (ix as f32 + 0.5) * bin_w / grid_w as f32;
                sum += bilinear_at(input, y, x);
            }
        }
        sum / count
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, arr2};

    #[test]
    fn zero_coefficients_give_half() {
        let coeffs = Array2::<f32>::zeros((2, 3));
        let proto = Array3::<f32>::ones((3, 4, 5));
        let masks = coarse_masks(coeffs.view(), proto.view()).unwrap();
        assert_eq!(masks.dim(), (2, 4, 5));
        assert!(masks.iter().all(|&m| m == 0.5));
    }

    #[test]
    fn coefficients_weight_prototypes() {
        let coeffs = arr2(&[[2.0f32, -1.0]]);
        let proto = Array3::from_shape_vec((2, 1, 1), vec![1.0f32, 3.0]).unwrap();
        let masks = coarse_masks(coeffs.view(), proto.view()).unwrap();
        assert_abs_diff_eq!(masks[(0, 0, 0)], 1.0 / (1.0 + 1f32.exp()), epsilon = 1e-6);
    }

    #[test]
    fn resize_constant_is_constant() {
        let up = resize_bilinear(Array2::from_elem((4, 4), 0.25f32).view(), (16, 16));
        assert_eq!(up.dim(), (16, 16));
        assert!(up.iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn resize_half_pixel_interpolates() {
        let up = resize_bilinear(arr2(&[[0.0f32, 1.0]]).view(), (1, 4));
        for (got, want) in up.iter().zip([0.0f32, 0.25, 0.75, 1.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn roi_align_on_a_ramp() {
        let ramp = Array::from_shape_fn((8, 8), |(_, x)| x as f32);
        let pooled = roi_align(ramp.view(), [0.0, 0.0, 4.0, 4.0], 1.0, 2, 2);
        assert_eq!(pooled.dim(), (2, 2));
        for (got, want) in pooled.iter().zip([1.0f32, 3.0, 1.0, 3.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn roi_align_adaptive_sampling_and_scale() {
        let flat = Array2::from_elem((4, 4), 0.75f32);
        let pooled = roi_align(flat.view(), [0.0, 0.0, 16.0, 16.0], 0.25, 3, 0);
        assert!(pooled.iter().all(|&v| (v - 0.75).abs() < 1e-6));
    }
}
