//! Similarity transform between beam and optical coordinates
//!
//! The model is `optical = scale * R(rotation) * beam + translation`, all
//! coordinates in meters. Fitting is linear in `a = s cos(θ)` and
//! `b = s sin(θ)` once both point sets are centred on their centroids.

use crate::error::AlignError;
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Relative singular value below which the fit is considered degenerate
const RANK_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityTransform {
    /// (x, y) in meters
    pub translation: (f64, f64),
    pub scale: f64,
    /// Counter-clockwise, in radians
    pub rotation: f64,
}

impl Default for SimilarityTransform {
    fn default() -> Self {
        Self {
            translation: (0.0, 0.0),
            scale: 1.0,
            rotation: 0.0,
        }
    }
}

impl SimilarityTransform {
    fn matrix(&self) -> Matrix2<f64> {
        let (sin, cos) = self.rotation.sin_cos();
        Matrix2::new(cos, -sin, sin, cos) * self.scale
    }

    pub fn apply(&self, point: (f64, f64)) -> (f64, f64) {
        let p = self.matrix() * Vector2::new(point.0, point.1);
        (p.x + self.translation.0, p.y + self.translation.1)
    }

    /// Least-squares fit mapping each `source` point onto its `target`.
    ///
    /// A single pair only determines a translation.
    pub fn fit(source: &[(f64, f64)], target: &[(f64, f64)]) -> Result<TransformFit, AlignError> {
        if source.len() != target.len() {
            return Err(AlignError::InvalidParameter(format!(
                "{} source points for {} target points",
                source.len(),
                target.len()
            )));
        }
        if source.is_empty() {
            return Err(AlignError::NotEnoughPoints);
        }

        let src_c = centroid(source);
        let dst_c = centroid(target);

        let (a, b) = if source.len() == 1 {
            (1.0, 0.0)
        } else {
            let n = source.len();
            let mut design = DMatrix::<f64>::zeros(2 * n, 2);
            let mut observed = DVector::<f64>::zeros(2 * n);
            for (i, (s, t)) in source.iter().zip(target).enumerate() {
                let (x, y) = (s.0 - src_c.x, s.1 - src_c.y);
                design[(2 * i, 0)] = x;
                design[(2 * i, 1)] = -y;
                design[(2 * i + 1, 0)] = y;
                design[(2 * i + 1, 1)] = x;
                observed[2 * i] = t.0 - dst_c.x;
                observed[2 * i + 1] = t.1 - dst_c.y;
            }

            let svd = design.svd(true, true);
            let max_sv = svd.singular_values.max();
            if max_sv <= 0.0 || svd.singular_values.min() < max_sv * RANK_TOLERANCE {
                return Err(AlignError::DegenerateFit(
                    "source points are all at the same position".to_string(),
                ));
            }
            let solution = svd
                .solve(&observed, max_sv * RANK_TOLERANCE)
                .map_err(|e| AlignError::DegenerateFit(e.to_string()))?;
            (solution[0], solution[1])
        };

        let scale = a.hypot(b);
        if scale <= 0.0 || !scale.is_finite() {
            return Err(AlignError::DegenerateFit(format!("scale {}", scale)));
        }
        let rotation = b.atan2(a);

        let mut transform = SimilarityTransform {
            translation: (0.0, 0.0),
            scale,
            rotation,
        };
        let moved = transform.matrix() * src_c;
        transform.translation = (dst_c.x - moved.x, dst_c.y - moved.y);

        let residual = transform.residual(source, target);
        Ok(TransformFit {
            transform,
            residual,
        })
    }

    /// Distance between where `source` lands and `target`
    pub fn error(&self, source: (f64, f64), target: (f64, f64)) -> f64 {
        let p = self.apply(source);
        (p.0 - target.0).hypot(p.1 - target.1)
    }

    /// Root mean square of the point errors
    pub fn residual(&self, source: &[(f64, f64)], target: &[(f64, f64)]) -> f64 {
        if source.is_empty() {
            return 0.0;
        }
        let sum: f64 = source
            .iter()
            .zip(target)
            .map(|(s, t)| self.error(*s, *t).powi(2))
            .sum();
        (sum / source.len() as f64).sqrt()
    }

    /// Corrections to apply to the optical image so it overlays the beam image
    pub fn metadata(&self) -> TransformMetadata {
        TransformMetadata {
            rotation_cor: self.rotation,
            position_cor: (-self.translation.0, -self.translation.1),
            pixel_size_cor: 1.0 / self.scale,
        }
    }
}

fn centroid(points: &[(f64, f64)]) -> Vector2<f64> {
    let sum = points
        .iter()
        .fold(Vector2::zeros(), |acc, p| acc + Vector2::new(p.0, p.1));
    sum / points.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformFit {
    pub transform: SimilarityTransform,
    /// RMS distance in meters
    pub residual: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformMetadata {
    pub rotation_cor: f64,
    pub position_cor: (f64, f64),
    pub pixel_size_cor: f64,
}

/// X/Y aspect ratio of a scanned grid, from its observed positions.
///
/// Compares the distance between the mean of the leftmost and rightmost
/// columns with the one between the bottom and top rows, both per grid
/// step. `None` when the grid has a single row or column.
pub fn grid_ratio(points: &[(f64, f64)], grid: (usize, usize)) -> Option<f64> {
    let (rows, cols) = grid;
    if rows < 2 || cols < 2 || points.len() < rows.max(cols) {
        return None;
    }

    let extent = |mut values: Vec<f64>, take: usize| {
        values.sort_by(|a, b| a.total_cmp(b));
        let low: f64 = values[..take].iter().sum::<f64>() / take as f64;
        let high: f64 = values[values.len() - take..].iter().sum::<f64>() / take as f64;
        high - low
    };

    let x_step = extent(points.iter().map(|p| p.0).collect(), rows) / (cols - 1) as f64;
    let y_step = extent(points.iter().map(|p| p.1).collect(), cols) / (rows - 1) as f64;
    if y_step == 0.0 {
        return None;
    }
    Some(x_step / y_step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points(n: usize, spacing: f64) -> Vec<(f64, f64)> {
        (0..n * n)
            .map(|i| ((i % n) as f64 * spacing, (i / n) as f64 * spacing))
            .collect()
    }

    #[test]
    fn test_fit_recovers_exact_transform() {
        let truth = SimilarityTransform {
            translation: (3e-7, -2e-7),
            scale: 1.05,
            rotation: 0.02,
        };
        let source = grid_points(4, 1e-6);
        let target: Vec<_> = source.iter().map(|p| truth.apply(*p)).collect();

        let fit = SimilarityTransform::fit(&source, &target).unwrap();
        assert!((fit.transform.scale - 1.05).abs() < 1e-9);
        assert!((fit.transform.rotation - 0.02).abs() < 1e-9);
        assert!((fit.transform.translation.0 - 3e-7).abs() < 1e-15);
        assert!((fit.transform.translation.1 + 2e-7).abs() < 1e-15);
        assert!(fit.residual < 1e-15);
    }

    #[test]
    fn test_single_point_gives_translation() {
        let fit = SimilarityTransform::fit(&[(1.0, 2.0)], &[(1.5, 1.0)]).unwrap();
        assert_eq!(fit.transform.scale, 1.0);
        assert_eq!(fit.transform.rotation, 0.0);
        assert_eq!(fit.transform.translation, (0.5, -1.0));
        assert_eq!(fit.residual, 0.0);
    }

    #[test]
    fn test_residual_is_rms_distance() {
        let identity = SimilarityTransform::default();
        let source = [(0.0, 0.0), (1.0, 0.0)];
        let target = [(3.0, 4.0), (1.0, 0.0)];
        // errors 5 and 0
        let expected = (25.0f64 / 2.0).sqrt();
        assert!((identity.residual(&source, &target) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        assert!(matches!(
            SimilarityTransform::fit(&[], &[]),
            Err(AlignError::NotEnoughPoints)
        ));
        assert!(matches!(
            SimilarityTransform::fit(&[(0.0, 0.0)], &[]),
            Err(AlignError::InvalidParameter(_))
        ));
        assert!(matches!(
            SimilarityTransform::fit(&[(1.0, 1.0), (1.0, 1.0)], &[(0.0, 0.0), (2.0, 2.0)]),
            Err(AlignError::DegenerateFit(_))
        ));
    }

    #[test]
    fn test_metadata_inverts_transform() {
        let t = SimilarityTransform {
            translation: (1e-6, -4e-7),
            scale: 2.0,
            rotation: 0.1,
        };
        let md = t.metadata();
        assert_eq!(md.rotation_cor, 0.1);
        assert_eq!(md.position_cor, (-1e-6, 4e-7));
        assert_eq!(md.pixel_size_cor, 0.5);
    }

    #[test]
    fn test_grid_ratio() {
        let square = grid_points(5, 1e-6);
        assert!((grid_ratio(&square, (5, 5)).unwrap() - 1.0).abs() < 1e-9);

        let stretched: Vec<_> = square.iter().map(|p| (p.0 * 1.3, p.1)).collect();
        assert!((grid_ratio(&stretched, (5, 5)).unwrap() - 1.3).abs() < 1e-9);

        assert!(grid_ratio(&square[..5], (1, 5)).is_none());
    }
}
