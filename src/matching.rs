//! Rigid alignment of seam boundaries.
//!
//! Before two charts can be merged, one side of the seam is mapped onto the
//! other by the least-squares rigid motion (rotation plus translation, no
//! reflection and no scaling) between the two ordered boundary point
//! sequences. The summed residual after alignment is the matching error that
//! drives the merge cost.

use nalgebra::{Matrix2, Point2, Vector2};

/// A direct rigid motion in UV space: `p ↦ R p + t`.
#[derive(Debug, Clone, Copy)]
pub struct RigidMatch {
    /// Rotation part (a proper rotation, det = +1).
    pub rotation: Matrix2<f64>,
    /// Translation part.
    pub translation: Vector2<f64>,
}

impl RigidMatch {
    /// The identity motion.
    pub fn identity() -> Self {
        Self {
            rotation: Matrix2::identity(),
            translation: Vector2::zeros(),
        }
    }

    /// Apply the motion to a point.
    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::from(self.rotation * p.coords + self.translation)
    }
}

/// Least-squares rigid motion taking `from` onto `to`.
///
/// Both sequences must be non-empty, of equal length, and ordered so that
/// `from[i]` corresponds to `to[i]`. The rotation is extracted from the SVD
/// of the cross-covariance; a reflection in the best orthogonal fit is
/// projected to the closest proper rotation, since mirroring a chart would
/// flip its texture content.
pub fn rigid_align(from: &[Point2<f64>], to: &[Point2<f64>]) -> RigidMatch {
    assert_eq!(from.len(), to.len());
    assert!(!from.is_empty());

    let n = from.len() as f64;
    let mut centroid_from = Vector2::zeros();
    let mut centroid_to = Vector2::zeros();
    for (pf, pt) in from.iter().zip(to) {
        centroid_from += pf.coords;
        centroid_to += pt.coords;
    }
    centroid_from /= n;
    centroid_to /= n;

    let mut cov = Matrix2::zeros();
    for (pf, pt) in from.iter().zip(to) {
        cov += (pt.coords - centroid_to) * (pf.coords - centroid_from).transpose();
    }

    let rotation = closest_rotation(&cov);
    let translation = centroid_to - rotation * centroid_from;
    RigidMatch { rotation, translation }
}

/// Closest proper rotation to a 2×2 matrix, via SVD with a determinant fix.
pub(crate) fn closest_rotation(m: &Matrix2<f64>) -> Matrix2<f64> {
    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Matrix2::identity(),
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        // flip the column of U paired with the smallest singular value
        let mut u = u;
        u.set_column(1, &(-u.column(1)));
        r = u * v_t;
    }
    r
}

/// Total residual after applying `m` to `from`: `Σ ‖m(from[i]) − to[i]‖`.
pub fn matching_error_total(
    m: &RigidMatch,
    from: &[Point2<f64>],
    to: &[Point2<f64>],
) -> f64 {
    from.iter()
        .zip(to)
        .map(|(pf, pt)| (m.apply(*pf) - *pt).norm())
        .sum()
}

/// Average per-point residual after alignment.
pub fn matching_error_avg(
    m: &RigidMatch,
    from: &[Point2<f64>],
    to: &[Point2<f64>],
) -> f64 {
    if from.is_empty() {
        return 0.0;
    }
    matching_error_total(m, from, to) / from.len() as f64
}
