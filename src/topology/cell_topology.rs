//! Element topology metadata: vertices, edges, sides and midside numbering.
//!
//! Node ordering follows the usual exodus/shards conventions:
//!
//! - **Line2/Line3**: `[v0, v1]`, midside `2`.
//! - **Triangle3/6**: `[v0, v1, v2]` counter-clockwise; edges `(0,1) (1,2) (2,0)`
//!   with midside nodes `3 4 5`.
//! - **Tetrahedron4/10**: edges `(0,1) (1,2) (2,0) (0,3) (1,3) (2,3)` with
//!   midside nodes `4..=9`; sides `(0,1,3) (1,2,3) (0,3,2) (0,2,1)`.
//!
//! Quadrilateral and hexahedral topologies are representable so that meshes
//! carrying them can be loaded, but they cannot be decomposed.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CellTopology {
    Line2,
    Line3,
    Triangle3,
    Triangle6,
    Tetrahedron4,
    Tetrahedron10,
    Quadrilateral4,
    Hexahedron8,
}

const LINE_EDGES: [[usize; 2]; 1] = [[0, 1]];
const TRI_EDGES: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];
const TET_EDGES: [[usize; 2]; 6] = [[0, 1], [1, 2], [2, 0], [0, 3], [1, 3], [2, 3]];

const LINE_SIDES: [&[usize]; 2] = [&[0], &[1]];
const TRI_SIDES: [&[usize]; 3] = [&[0, 1], &[1, 2], &[2, 0]];
const TET_SIDES: [&[usize]; 4] = [&[0, 1, 3], &[1, 2, 3], &[0, 3, 2], &[0, 2, 1]];

const TRI6_SIDES: [&[usize]; 3] = [&[0, 1, 3], &[1, 2, 4], &[2, 0, 5]];
const TET10_SIDES: [&[usize]; 4] = [
    &[0, 1, 3, 4, 8, 7],
    &[1, 2, 3, 5, 9, 8],
    &[0, 3, 2, 7, 9, 6],
    &[0, 2, 1, 6, 5, 4],
];

impl CellTopology {
    /// Topological dimension.
    pub fn dimension(self) -> usize {
        match self {
            CellTopology::Line2 | CellTopology::Line3 => 1,
            CellTopology::Triangle3 | CellTopology::Triangle6 | CellTopology::Quadrilateral4 => 2,
            CellTopology::Tetrahedron4 | CellTopology::Tetrahedron10 | CellTopology::Hexahedron8 => 3,
        }
    }

    pub fn num_nodes(self) -> usize {
        match self {
            CellTopology::Line2 => 2,
            CellTopology::Line3 => 3,
            CellTopology::Triangle3 => 3,
            CellTopology::Triangle6 => 6,
            CellTopology::Tetrahedron4 => 4,
            CellTopology::Tetrahedron10 => 10,
            CellTopology::Quadrilateral4 => 4,
            CellTopology::Hexahedron8 => 8,
        }
    }

    pub fn num_vertices(self) -> usize {
        self.linear().num_nodes()
    }

    pub fn is_quadratic(self) -> bool {
        matches!(
            self,
            CellTopology::Line3 | CellTopology::Triangle6 | CellTopology::Tetrahedron10
        )
    }

    pub fn is_simplex(self) -> bool {
        !matches!(self, CellTopology::Quadrilateral4 | CellTopology::Hexahedron8)
    }

    /// Only simplex families can be cut by the templates in this crate.
    pub fn is_supported_for_decomposition(self) -> bool {
        self.is_simplex()
    }

    /// Vertex-only topology of the same family.
    pub fn linear(self) -> CellTopology {
        match self {
            CellTopology::Line3 => CellTopology::Line2,
            CellTopology::Triangle6 => CellTopology::Triangle3,
            CellTopology::Tetrahedron10 => CellTopology::Tetrahedron4,
            other => other,
        }
    }

    /// Quadratic topology of the same family (identity for non-simplex cells).
    pub fn quadratic(self) -> CellTopology {
        match self {
            CellTopology::Line2 => CellTopology::Line3,
            CellTopology::Triangle3 => CellTopology::Triangle6,
            CellTopology::Tetrahedron4 => CellTopology::Tetrahedron10,
            other => other,
        }
    }

    /// Linear simplex of the given dimension.
    pub fn simplex(dim: usize) -> Option<CellTopology> {
        match dim {
            1 => Some(CellTopology::Line2),
            2 => Some(CellTopology::Triangle3),
            3 => Some(CellTopology::Tetrahedron4),
            _ => None,
        }
    }

    /// Vertex pairs of every edge, in midside-node order.
    pub fn edges(self) -> &'static [[usize; 2]] {
        match self.linear() {
            CellTopology::Line2 => &LINE_EDGES,
            CellTopology::Triangle3 => &TRI_EDGES,
            CellTopology::Tetrahedron4 => &TET_EDGES,
            _ => &[],
        }
    }

    /// Local node index of the midside node on edge `edge` (quadratic only).
    pub fn edge_midside_node(self, edge: usize) -> Option<usize> {
        (self.is_quadratic() && edge < self.edges().len()).then(|| self.num_vertices() + edge)
    }

    pub fn num_sides(self) -> usize {
        self.side_vertices_all().len()
    }

    fn side_vertices_all(self) -> &'static [&'static [usize]] {
        match self.linear() {
            CellTopology::Line2 => &LINE_SIDES,
            CellTopology::Triangle3 => &TRI_SIDES,
            CellTopology::Tetrahedron4 => &TET_SIDES,
            _ => &[],
        }
    }

    /// Vertices of side `side`, oriented outward.
    pub fn side_vertices(self, side: usize) -> &'static [usize] {
        self.side_vertices_all()[side]
    }

    /// All nodes of side `side`, including midside nodes for quadratic cells.
    pub fn side_nodes(self, side: usize) -> &'static [usize] {
        match self {
            CellTopology::Triangle6 => TRI6_SIDES[side],
            CellTopology::Tetrahedron10 => TET10_SIDES[side],
            CellTopology::Line3 => LINE_SIDES[side],
            _ => self.side_vertices(side),
        }
    }

    /// Topology of a side entity; `None` for lines whose sides are nodes.
    pub fn side_topology(self) -> Option<CellTopology> {
        match self {
            CellTopology::Triangle3 => Some(CellTopology::Line2),
            CellTopology::Triangle6 => Some(CellTopology::Line3),
            CellTopology::Tetrahedron4 => Some(CellTopology::Triangle3),
            CellTopology::Tetrahedron10 => Some(CellTopology::Triangle6),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadratic_side_nodes_close_over_edges() {
        let topo = CellTopology::Tetrahedron10;
        for side in 0..topo.num_sides() {
            let nodes = topo.side_nodes(side);
            let verts = topo.side_vertices(side);
            assert_eq!(&nodes[..3], verts);
            for (i, &mid) in nodes[3..].iter().enumerate() {
                let (a, b) = (verts[i], verts[(i + 1) % 3]);
                let edge = topo
                    .edges()
                    .iter()
                    .position(|e| (e[0] == a && e[1] == b) || (e[0] == b && e[1] == a))
                    .unwrap();
                assert_eq!(topo.edge_midside_node(edge), Some(mid));
            }
        }
    }

    #[test]
    fn families() {
        assert_eq!(CellTopology::Triangle6.linear(), CellTopology::Triangle3);
        assert_eq!(CellTopology::Line2.quadratic(), CellTopology::Line3);
        assert_eq!(CellTopology::Tetrahedron4.num_sides(), 4);
        assert!(!CellTopology::Hexahedron8.is_supported_for_decomposition());
        assert_eq!(CellTopology::Line3.edge_midside_node(0), Some(2));
        assert_eq!(CellTopology::Triangle3.edge_midside_node(0), None);
    }
}
