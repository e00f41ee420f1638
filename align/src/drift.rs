//! Sub-pixel drift estimation by phase correlation
//!
//! The coarse shift is the peak of the inverse transform of the cross-power
//! spectrum. When more precision is requested, the same spectrum is
//! evaluated again on a small window of upsampled points around the coarse
//! peak, using a matrix-multiply DFT instead of zero-padding the whole frame.

use crate::error::AlignError;
use crate::hardware::Frame;
use ndarray::Array2;
use rustfft::num_complex::Complex64;
use rustfft::{FftDirection, FftPlanner};
use std::f64::consts::PI;

/// Estimate the translation between two frames.
///
/// Returns `(row_shift, col_shift)` in pixels, such that `previous[r, c]` is
/// roughly `current[r - row_shift, c - col_shift]`. The shift is resolved to
/// `1 / precision` pixel.
pub fn estimate_drift(
    previous: &Frame,
    current: &Frame,
    precision: u32,
) -> Result<(f64, f64), AlignError> {
    if precision < 1 {
        return Err(AlignError::InvalidPrecision(precision));
    }
    if previous.dim() != current.dim() {
        return Err(AlignError::ShapeMismatch {
            previous: previous.dim(),
            current: current.dim(),
        });
    }
    let (rows, cols) = previous.dim();
    if rows == 0 || cols == 0 {
        return Err(AlignError::EmptyFrame);
    }

    let mut planner = FftPlanner::new();
    let f_previous = fft2(&mut planner, to_complex(previous), FftDirection::Forward);
    let f_current = fft2(&mut planner, to_complex(current), FftDirection::Forward);
    let cross = &f_previous * &f_current.mapv(|v| v.conj());

    let correlation = fft2(&mut planner, cross.clone(), FftDirection::Inverse);
    let (peak_r, peak_c) = argmax_magnitude_from(&correlation, (0, 0));
    let mut shift = (wrap(peak_r, rows), wrap(peak_c, cols));

    if precision > 1 {
        let p = f64::from(precision);
        let window = (1.5 * p).ceil() as usize;
        let center = window / 2;
        let upsampled = upsampled_dft(&cross, window, p, shift, center);
        let (up_r, up_c) = argmax_magnitude_from(&upsampled, (center, center));
        shift.0 += (up_r as f64 - center as f64) / p;
        shift.1 += (up_c as f64 - center as f64) / p;
    }

    // No information along a single-sample axis
    if rows == 1 {
        shift.0 = 0.0;
    }
    if cols == 1 {
        shift.1 = 0.0;
    }

    tracing::trace!("Estimated drift ({:.3}, {:.3}) px", shift.0, shift.1);
    Ok(shift)
}

fn to_complex(frame: &Frame) -> Array2<Complex64> {
    frame.mapv(|v| Complex64::new(v, 0.0))
}

/// Unnormalized 2D DFT: rows, then columns
fn fft2(
    planner: &mut FftPlanner<f64>,
    mut data: Array2<Complex64>,
    direction: FftDirection,
) -> Array2<Complex64> {
    let (rows, cols) = data.dim();

    let row_fft = planner.plan_fft(cols, direction);
    let mut buffer = vec![Complex64::new(0.0, 0.0); cols];
    for mut row in data.rows_mut() {
        buffer.iter_mut().zip(row.iter()).for_each(|(b, v)| *b = *v);
        row_fft.process(&mut buffer);
        row.iter_mut().zip(&buffer).for_each(|(v, b)| *v = *b);
    }

    let col_fft = planner.plan_fft(rows, direction);
    let mut buffer = vec![Complex64::new(0.0, 0.0); rows];
    for mut col in data.columns_mut() {
        buffer.iter_mut().zip(col.iter()).for_each(|(b, v)| *b = *v);
        col_fft.process(&mut buffer);
        col.iter_mut().zip(&buffer).for_each(|(v, b)| *v = *b);
    }

    data
}

/// Inverse DFT of `spectrum` on a `window`×`window` grid of points spaced by
/// `1 / upsampling`, with sample `center` on `offset`.
fn upsampled_dft(
    spectrum: &Array2<Complex64>,
    window: usize,
    upsampling: f64,
    offset: (f64, f64),
    center: usize,
) -> Array2<Complex64> {
    let (rows, cols) = spectrum.dim();
    let position = |j: usize, origin: f64| origin + (j as f64 - center as f64) / upsampling;

    let row_kernel = Array2::from_shape_fn((window, rows), |(j, k)| {
        let phase = 2.0 * PI * signed_frequency(k, rows) * position(j, offset.0) / rows as f64;
        Complex64::from_polar(1.0, phase)
    });
    let col_kernel = Array2::from_shape_fn((cols, window), |(k, j)| {
        let phase = 2.0 * PI * signed_frequency(k, cols) * position(j, offset.1) / cols as f64;
        Complex64::from_polar(1.0, phase)
    });

    row_kernel.dot(spectrum).dot(&col_kernel)
}

/// Frequency of DFT bin `k` over `len` samples, in (-len/2, len/2]
fn signed_frequency(k: usize, len: usize) -> f64 {
    if k < (len + 1) / 2 {
        k as f64
    } else {
        k as f64 - len as f64
    }
}

fn wrap(idx: usize, dim: usize) -> f64 {
    if idx > dim / 2 {
        idx as f64 - dim as f64
    } else {
        idx as f64
    }
}

/// Position of the largest magnitude; ties keep `start`
fn argmax_magnitude_from(data: &Array2<Complex64>, start: (usize, usize)) -> (usize, usize) {
    let mut best = start;
    let mut best_norm = data[start].norm_sqr();
    for ((r, c), v) in data.indexed_iter() {
        let norm = v.norm_sqr();
        if norm > best_norm {
            best_norm = norm;
            best = (r, c);
        }
    }
    best
}
