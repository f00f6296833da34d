//! Closest-point queries against interface facets (points, segments, triangles).
//!
//! Results carry the barycentric weights of the closest point so callers can
//! interpolate facet nodal values at that point.

use nalgebra::Vector3;
use smallvec::{SmallVec, smallvec};

/// Closest point on a facet and its barycentric weights.
#[derive(Clone, Debug, PartialEq)]
pub struct FacetProjection {
    pub point: Vector3<f64>,
    pub weights: SmallVec<[f64; 3]>,
    pub distance_squared: f64,
}

/// Project `x` onto the simplex spanned by `vertices` (1, 2 or 3 points).
pub fn closest_point(vertices: &[Vector3<f64>], x: &Vector3<f64>) -> FacetProjection {
    match vertices.len() {
        1 => finish(vertices, x, smallvec![1.0]),
        2 => {
            let (a, b) = (vertices[0], vertices[1]);
            let ab = b - a;
            let len2 = ab.norm_squared();
            let t = if len2 > 0.0 {
                ((x - a).dot(&ab) / len2).clamp(0.0, 1.0)
            } else {
                0.0
            };
            finish(vertices, x, smallvec![1.0 - t, t])
        }
        _ => finish(vertices, x, triangle_weights(vertices[0], vertices[1], vertices[2], x)),
    }
}

fn finish(vertices: &[Vector3<f64>], x: &Vector3<f64>, weights: SmallVec<[f64; 3]>) -> FacetProjection {
    let point = vertices
        .iter()
        .zip(&weights)
        .fold(Vector3::zeros(), |acc, (v, w)| acc + v * *w);
    FacetProjection {
        distance_squared: (point - x).norm_squared(),
        point,
        weights,
    }
}

// Voronoi-region walk over the triangle features.
fn triangle_weights(
    a: Vector3<f64>,
    b: Vector3<f64>,
    c: Vector3<f64>,
    p: &Vector3<f64>,
) -> SmallVec<[f64; 3]> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return smallvec![1.0, 0.0, 0.0];
    }
    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return smallvec![0.0, 1.0, 0.0];
    }
    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return smallvec![1.0 - v, v, 0.0];
    }
    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return smallvec![0.0, 0.0, 1.0];
    }
    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return smallvec![1.0 - w, 0.0, w];
    }
    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return smallvec![0.0, 1.0 - w, w];
    }
    let denom = va + vb + vc;
    if denom == 0.0 {
        return smallvec![1.0, 0.0, 0.0];
    }
    let v = vb / denom;
    let w = vc / denom;
    smallvec![1.0 - v - w, v, w]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn v(x: f64, y: f64, z: f64) -> Vector3<f64> {
        Vector3::new(x, y, z)
    }

    #[test]
    fn segment_projection_clamps() {
        let seg = [v(0., 0., 0.), v(2., 0., 0.)];
        let inside = closest_point(&seg, &v(0.5, 1.0, 0.));
        assert_relative_eq!(inside.weights[1], 0.25);
        assert_relative_eq!(inside.distance_squared, 1.0);
        let beyond = closest_point(&seg, &v(3.0, 0.0, 0.));
        assert_eq!(beyond.weights.as_slice(), &[0.0, 1.0]);
        assert_relative_eq!(beyond.distance_squared, 1.0);
    }

    #[test]
    fn triangle_interior_and_edge_regions() {
        let tri = [v(0., 0., 0.), v(1., 0., 0.), v(0., 1., 0.)];
        let above = closest_point(&tri, &v(0.25, 0.25, 2.0));
        assert_relative_eq!(above.point, v(0.25, 0.25, 0.0), epsilon = 1e-14);
        assert_relative_eq!(above.distance_squared, 4.0, epsilon = 1e-14);
        let weights_sum: f64 = above.weights.iter().sum();
        assert_relative_eq!(weights_sum, 1.0);

        let off_edge = closest_point(&tri, &v(0.5, -1.0, 0.0));
        assert_relative_eq!(off_edge.point, v(0.5, 0.0, 0.0), epsilon = 1e-14);
    }
}
