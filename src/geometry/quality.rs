//! Simplex measures and shape quality on explicit vertex coordinates.
//!
//! Coordinates are always carried as `Vector3<f64>`; 1D and 2D meshes leave the
//! unused components at zero. Measures are signed: positive for the vertex ordering
//! documented in [`crate::topology::cell_topology`], negative when inverted.

use crate::mesh_error::MeshError;
use crate::topology::cell_topology::CellTopology;
use nalgebra::{Matrix3, Vector3};

/// Signed length / area / volume of a linear simplex.
pub fn simplex_measure(dim: usize, v: &[Vector3<f64>]) -> f64 {
    match dim {
        1 => v[1].x - v[0].x,
        2 => {
            let a = v[1] - v[0];
            let b = v[2] - v[0];
            0.5 * (a.x * b.y - a.y * b.x)
        }
        3 => {
            let m = Matrix3::from_columns(&[v[1] - v[0], v[2] - v[0], v[3] - v[0]]);
            m.determinant() / 6.0
        }
        _ => 0.0,
    }
}

/// Signed measure of a cell from the coordinates of its nodes (vertices first).
pub fn cell_measure(topology: CellTopology, nodes: &[Vector3<f64>]) -> Result<f64, MeshError> {
    if !topology.is_simplex() {
        return Err(MeshError::UnsupportedTopology(topology));
    }
    let nv = topology.num_vertices();
    if nodes.len() < nv {
        return Err(MeshError::InvalidGeometry(format!(
            "vertex count mismatch: expected {nv}, got {}",
            nodes.len()
        )));
    }
    Ok(simplex_measure(topology.dimension(), &nodes[..nv]))
}

/// Minimum over vertices of the scaled Jacobian, normalized so the regular simplex
/// scores one. Degenerate simplices score zero, inverted ones score below zero.
pub fn scaled_jacobian(dim: usize, v: &[Vector3<f64>]) -> f64 {
    let (factorial, regular) = match dim {
        1 => (1.0, 1.0),
        2 => (2.0, 2.0 / 3f64.sqrt()),
        3 => (6.0, std::f64::consts::SQRT_2),
        _ => return 0.0,
    };
    let jacobian = simplex_measure(dim, v) * factorial;
    let mut worst = f64::INFINITY;
    for i in 0..=dim {
        let lengths: f64 = (0..=dim).filter(|&k| k != i).map(|k| (v[k] - v[i]).norm()).product();
        if lengths == 0.0 {
            return 0.0;
        }
        worst = worst.min(jacobian / lengths);
    }
    worst * regular
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn v(x: f64, y: f64, z: f64) -> Vector3<f64> {
        Vector3::new(x, y, z)
    }

    #[test]
    fn measures_of_reference_simplices() {
        assert_relative_eq!(simplex_measure(1, &[v(0., 0., 0.), v(2., 0., 0.)]), 2.0);
        let tri = [v(0., 0., 0.), v(1., 0., 0.), v(0., 1., 0.)];
        assert_relative_eq!(simplex_measure(2, &tri), 0.5);
        let tet = [v(0., 0., 0.), v(1., 0., 0.), v(0., 1., 0.), v(0., 0., 1.)];
        assert_relative_eq!(simplex_measure(3, &tet), 1.0 / 6.0);
    }

    #[test]
    fn inverted_triangle_is_negative() {
        let tri = [v(0., 0., 0.), v(0., 1., 0.), v(1., 0., 0.)];
        assert_relative_eq!(cell_measure(CellTopology::Triangle3, &tri).unwrap(), -0.5);
        let hex = [v(0., 0., 0.); 8];
        assert!(matches!(
            cell_measure(CellTopology::Hexahedron8, &hex),
            Err(MeshError::UnsupportedTopology(_))
        ));
    }

    #[test]
    fn scaled_jacobian_rates_shape() {
        let equilateral = [v(0., 0., 0.), v(1., 0., 0.), v(0.5, 0.75f64.sqrt(), 0.)];
        assert_relative_eq!(scaled_jacobian(2, &equilateral), 1.0, epsilon = 1e-12);
        let right = [v(0., 0., 0.), v(1., 0., 0.), v(0., 1., 0.)];
        assert_relative_eq!(scaled_jacobian(2, &right), (2.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        let regular = [
            v(1., 1., 1.),
            v(1., -1., -1.),
            v(-1., 1., -1.),
            v(-1., -1., 1.),
        ];
        assert_relative_eq!(scaled_jacobian(3, &regular).abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(scaled_jacobian(1, &[v(0., 0., 0.), v(3., 0., 0.)]), 1.0);
    }

    #[test]
    fn flat_and_inverted_simplices() {
        let flat = [v(0., 0., 0.), v(1., 0., 0.), v(2., 0., 0.)];
        assert_eq!(scaled_jacobian(2, &flat), 0.0);
        let collapsed = [v(0., 0., 0.), v(0., 0., 0.), v(0., 1., 0.)];
        assert_eq!(scaled_jacobian(2, &collapsed), 0.0);
        let inverted = [v(0., 0., 0.), v(0., 1., 0.), v(1., 0., 0.)];
        assert!(scaled_jacobian(2, &inverted) < 0.0);
        let sliver = [v(0., 0., 0.), v(1., 0., 0.), v(0.5, 1e-9, 0.)];
        assert!(scaled_jacobian(2, &sliver) < 1e-8);
    }
}
