//! Post-cut diagnostics: element quality and the interface CFL number.
//!
//! Both read the mesh database only, so they run on whatever the last mutation left.

use crate::algs::communicator::{Communicator, tags};
use crate::algs::sparse_exchange::all_reduce_max_f64;
use crate::cdfem::cdmesh::entity_measure;
use crate::cdfem::phase::PhaseSupport;
use crate::geometry::quality::scaled_jacobian;
use crate::mesh::bulk::BulkData;
use crate::mesh::meta::{FieldId, PartId};
use crate::mesh_error::MeshError;
use crate::topology::entity::{EntityId, EntityKey, EntityRank};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

fn vertex_coordinates(mesh: &BulkData, key: EntityKey, vertices: usize) -> Result<Vec<Vector3<f64>>, MeshError> {
    mesh.nodes_of(key)[..vertices]
        .iter()
        .map(|n| mesh.coordinates(*n))
        .collect()
}

/// Worst scaled Jacobian over the active simplices of every rank, `None` when there
/// are none. Collective.
pub fn quality_after_cut<C: Communicator>(
    mesh: &BulkData,
    phases: &PhaseSupport,
    comm: &C,
) -> Result<Option<f64>, MeshError> {
    let mut worst = f64::INFINITY;
    for key in mesh.owned_keys(EntityRank::Element) {
        if !mesh.has_part(key, phases.active_part()) {
            continue;
        }
        let Some(topology) = mesh.topology(key).filter(|t| t.is_simplex()) else {
            continue;
        };
        let x = vertex_coordinates(mesh, key, topology.num_vertices())?;
        worst = worst.min(scaled_jacobian(topology.dimension(), &x));
    }
    // min as the max of negated values
    let global = -all_reduce_max_f64(comm, tags::COLLECTIVE, -worst)?;
    let quality = global.is_finite().then_some(global);
    match quality {
        Some(q) => log::info!("quality after cut: worst scaled jacobian {q:.4e}"),
        None => log::info!("quality after cut: no active elements"),
    }
    Ok(quality)
}

/// Length an interface side's displacement is compared against.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum CflLengthScale {
    Constant(f64),
    /// Average measure of the active elements touching the side, to the power `1/dim`.
    Local,
}

/// Unit normal of an interface side; in 1D the interface is a node and the normal the
/// x axis.
fn side_normal(x: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    let n = match x.len() {
        1 => Vector3::x(),
        2 => {
            let t = x[1] - x[0];
            Vector3::new(t.y, -t.x, 0.0)
        }
        3 => (x[1] - x[0]).cross(&(x[2] - x[0])),
        _ => return None,
    };
    n.try_normalize(0.0)
}

fn local_length(mesh: &BulkData, side: EntityKey, active: PartId) -> Result<Option<f64>, MeshError> {
    let elements: Vec<EntityId> = if side.rank == EntityRank::Node {
        mesh.node_elements(side.id)
    } else {
        mesh.side_elements(side.id)
    };
    let mut total = 0.0;
    let mut count = 0usize;
    for e in elements {
        let key = EntityKey::element(e);
        if mesh.has_part(key, active) {
            total += entity_measure(mesh, key)?;
            count += 1;
        }
    }
    if count == 0 {
        return Ok(None);
    }
    Ok(Some((total / count as f64).powf(1.0 / mesh.spatial_dim() as f64)))
}

/// Largest `|v dt . n| / L` over the owned active interface sides of every rank, with
/// `v` the average of the nodal `velocity` over the side. Collective.
pub fn interface_velocity_cfl<C: Communicator>(
    mesh: &BulkData,
    phases: &PhaseSupport,
    velocity: FieldId,
    dt: f64,
    length_scale: CflLengthScale,
    comm: &C,
) -> Result<f64, MeshError> {
    let rank = EntityRank::side_rank(mesh.spatial_dim()).unwrap_or(EntityRank::Node);
    let active = phases.active_part();
    let mut worst = 0.0f64;
    for key in mesh.owned_keys(rank) {
        if !mesh.has_part(key, active) || !phases.interface_parts().iter().any(|p| mesh.has_part(key, *p)) {
            continue;
        }
        let nodes: Vec<EntityId> = if rank == EntityRank::Node {
            vec![key.id]
        } else {
            let vertices = mesh.topology(key).map_or(0, |t| t.num_vertices());
            mesh.nodes_of(key)[..vertices].to_vec()
        };
        let x = nodes.iter().map(|n| mesh.coordinates(*n)).collect::<Result<Vec<_>, _>>()?;
        let Some(normal) = side_normal(&x) else {
            continue;
        };
        let mut v = Vector3::zeros();
        for n in &nodes {
            let node = EntityKey::node(*n);
            let data = mesh.field_data(velocity, node).ok_or_else(|| MeshError::FieldNotDefined {
                field: mesh.meta().field(velocity).name.clone(),
                key: node,
            })?;
            for (i, c) in data.iter().take(3).enumerate() {
                v[i] += *c;
            }
        }
        v /= nodes.len() as f64;
        let length = match length_scale {
            CflLengthScale::Constant(l) => l,
            CflLengthScale::Local => match local_length(mesh, key, active)? {
                Some(l) => l,
                None => continue,
            },
        };
        if length > 0.0 {
            worst = worst.max((v * dt).dot(&normal).abs() / length);
        }
    }
    let global = all_reduce_max_f64(comm, tags::COLLECTIVE, worst)?;
    log::info!("interface velocity CFL {global:.4e}");
    Ok(global)
}
