//! Structured simplex mesh generators, partitioned into slabs along x.
//!
//! Elements are numbered column-major in x and dealt to ranks in contiguous runs, so
//! rank `r` of `size` owns a slab of the domain. A node lives on every rank that has
//! an element using it, is owned by the lowest such rank and shared with the rest.

use crate::geometry::quality::simplex_measure;
use crate::mesh::bulk::BulkData;
use crate::mesh::meta::{MetaData, PartId};
use crate::mesh_error::MeshError;
use crate::topology::cell_topology::CellTopology;
use crate::topology::entity::{EntityId, EntityKey, EntityRank};
use nalgebra::Vector3;
use std::collections::{BTreeMap, BTreeSet};

/// Default element block name.
pub const DEFAULT_BLOCK: &str = "block_1";

/// Which piece of the mesh this rank builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub rank: usize,
    pub size: usize,
}

impl Partition {
    pub fn serial() -> Self {
        Self { rank: 0, size: 1 }
    }

    fn owner_of(&self, elem: usize, n_elems: usize) -> usize {
        (elem * self.size / n_elems.max(1)).min(self.size - 1)
    }
}

/// Optional configuration for mesh generation.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshGenerationOptions {
    /// Generate Line3 / Triangle6 / Tetrahedron10 instead of linear simplices.
    pub quadratic: bool,
    /// Report node pairs identified across the x-min / x-max faces.
    pub periodic_x: bool,
}

#[derive(Debug)]
pub struct GeneratedMesh {
    pub mesh: BulkData,
    pub block: PartId,
    /// `(x-min node, x-max node)` pairs when `periodic_x` was requested.
    pub periodic_pairs: Vec<(EntityId, EntityId)>,
}

fn invalid_geometry(message: impl Into<String>) -> MeshError {
    MeshError::InvalidGeometry(message.into())
}

/// `n` Line2 elements on `[x0, x1]`.
pub fn interval_mesh(
    meta: MetaData,
    n: usize,
    x0: f64,
    x1: f64,
    partition: Partition,
    options: MeshGenerationOptions,
) -> Result<GeneratedMesh, MeshError> {
    if n == 0 || x1 <= x0 {
        return Err(invalid_geometry("interval needs n > 0 and x1 > x0"));
    }
    let h = (x1 - x0) / n as f64;
    let coords: Vec<[f64; 3]> = (0..=n).map(|i| [x0 + h * i as f64, 0.0, 0.0]).collect();
    let cells: Vec<Vec<usize>> = (0..n).map(|i| vec![i, i + 1]).collect();
    let pairs = if options.periodic_x { vec![(0, n)] } else { Vec::new() };
    build(meta, coords, cells, CellTopology::Line2, partition, options, pairs)
}

/// `nx * ny` squares on `[0, lx] x [0, ly]`, each split into two triangles.
pub fn triangle_mesh(
    meta: MetaData,
    nx: usize,
    ny: usize,
    lx: f64,
    ly: f64,
    partition: Partition,
    options: MeshGenerationOptions,
) -> Result<GeneratedMesh, MeshError> {
    if nx == 0 || ny == 0 || lx <= 0.0 || ly <= 0.0 {
        return Err(invalid_geometry("triangle mesh needs positive counts and lengths"));
    }
    let vid = |i: usize, j: usize| i * (ny + 1) + j;
    let mut coords = Vec::with_capacity((nx + 1) * (ny + 1));
    for i in 0..=nx {
        for j in 0..=ny {
            coords.push([lx * i as f64 / nx as f64, ly * j as f64 / ny as f64, 0.0]);
        }
    }
    let mut cells = Vec::with_capacity(2 * nx * ny);
    for i in 0..nx {
        for j in 0..ny {
            let (a, b, c, d) = (vid(i, j), vid(i + 1, j), vid(i + 1, j + 1), vid(i, j + 1));
            cells.push(vec![a, b, c]);
            cells.push(vec![a, c, d]);
        }
    }
    let pairs = if options.periodic_x {
        (0..=ny).map(|j| (vid(0, j), vid(nx, j))).collect()
    } else {
        Vec::new()
    };
    build(meta, coords, cells, CellTopology::Triangle3, partition, options, pairs)
}

/// `nx * ny * nz` cubes on `[0, l]^3` boxes, each split into six tetrahedra along
/// the main diagonal.
pub fn tetrahedron_mesh(
    meta: MetaData,
    n: [usize; 3],
    l: [f64; 3],
    partition: Partition,
    options: MeshGenerationOptions,
) -> Result<GeneratedMesh, MeshError> {
    let [nx, ny, nz] = n;
    if n.contains(&0) || l.iter().any(|&v| v <= 0.0) {
        return Err(invalid_geometry("tetrahedron mesh needs positive counts and lengths"));
    }
    let vid = |i: usize, j: usize, k: usize| (i * (ny + 1) + j) * (nz + 1) + k;
    let mut coords = Vec::with_capacity((nx + 1) * (ny + 1) * (nz + 1));
    for i in 0..=nx {
        for j in 0..=ny {
            for k in 0..=nz {
                coords.push([
                    l[0] * i as f64 / nx as f64,
                    l[1] * j as f64 / ny as f64,
                    l[2] * k as f64 / nz as f64,
                ]);
            }
        }
    }
    const PATHS: [[usize; 3]; 6] = [[1, 2, 4], [1, 4, 2], [2, 1, 4], [2, 4, 1], [4, 1, 2], [4, 2, 1]];
    let mut cells = Vec::with_capacity(6 * nx * ny * nz);
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                let corner = |bits: usize| vid(i + (bits & 1), j + ((bits >> 1) & 1), k + ((bits >> 2) & 1));
                for [a, b, _] in PATHS {
                    let mut tet = vec![corner(0), corner(a), corner(a | b), corner(7)];
                    let verts: Vec<Vector3<f64>> = tet.iter().map(|&v| Vector3::from(coords[v])).collect();
                    if simplex_measure(3, &verts) < 0.0 {
                        tet.swap(1, 2);
                    }
                    cells.push(tet);
                }
            }
        }
    }
    let pairs = if options.periodic_x {
        let mut pairs = Vec::new();
        for j in 0..=ny {
            for k in 0..=nz {
                pairs.push((vid(0, j, k), vid(nx, j, k)));
            }
        }
        pairs
    } else {
        Vec::new()
    };
    build(meta, coords, cells, CellTopology::Tetrahedron4, partition, options, pairs)
}

/// Append one midside node per distinct edge.
fn add_midside_nodes(coords: &mut Vec<[f64; 3]>, cells: &mut [Vec<usize>], topology: CellTopology) {
    let mut midside: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for cell in cells.iter_mut() {
        let verts = cell.clone();
        for e in topology.edges() {
            let (a, b) = (verts[e[0]], verts[e[1]]);
            let key = (a.min(b), a.max(b));
            let idx = *midside.entry(key).or_insert_with(|| {
                let (pa, pb) = (coords[a], coords[b]);
                coords.push([0.5 * (pa[0] + pb[0]), 0.5 * (pa[1] + pb[1]), 0.5 * (pa[2] + pb[2])]);
                coords.len() - 1
            });
            cell.push(idx);
        }
    }
}

fn build(
    mut meta: MetaData,
    mut coords: Vec<[f64; 3]>,
    mut cells: Vec<Vec<usize>>,
    topology: CellTopology,
    partition: Partition,
    options: MeshGenerationOptions,
    pairs: Vec<(usize, usize)>,
) -> Result<GeneratedMesh, MeshError> {
    if partition.size == 0 || partition.rank >= partition.size {
        return Err(invalid_geometry("partition rank out of range"));
    }
    let topology = if options.quadratic {
        add_midside_nodes(&mut coords, &mut cells, topology);
        topology.quadratic()
    } else {
        topology
    };
    let block = meta.declare_part(DEFAULT_BLOCK, Some(EntityRank::Element));
    let node_id = |v: usize| EntityId::new(v as u64 + 1);

    let n_elems = cells.len();
    let mut users: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (e, cell) in cells.iter().enumerate() {
        let r = partition.owner_of(e, n_elems);
        for &v in cell {
            users.entry(v).or_default().insert(r);
        }
    }

    let mut mesh = BulkData::new(meta, partition.rank, partition.size);
    mesh.modification_begin()?;
    for (&v, ranks) in &users {
        if !ranks.contains(&partition.rank) {
            continue;
        }
        let id = node_id(v)?;
        let key = mesh.declare_node(id, Vector3::from(coords[v]), &[])?;
        let owner = ranks.iter().next().copied().unwrap_or(partition.rank);
        mesh.set_owner(key, owner)?;
        for &p in ranks.iter().filter(|&&p| p != partition.rank) {
            mesh.add_sharing(key, p)?;
        }
    }
    for (e, cell) in cells.iter().enumerate() {
        if partition.owner_of(e, n_elems) != partition.rank {
            continue;
        }
        let nodes = cell.iter().map(|&v| node_id(v)).collect::<Result<Vec<_>, _>>()?;
        mesh.declare_element(EntityId::new(e as u64 + 1)?, topology, &nodes, &[block])?;
    }
    mesh.modification_end()?;

    let mut periodic_pairs = Vec::with_capacity(pairs.len());
    for (a, b) in pairs {
        let (a, b) = (node_id(a)?, node_id(b)?);
        if mesh.is_valid(EntityKey::node(a)) || mesh.is_valid(EntityKey::node(b)) {
            periodic_pairs.push((a, b));
        }
    }
    Ok(GeneratedMesh {
        mesh,
        block,
        periodic_pairs,
    })
}
