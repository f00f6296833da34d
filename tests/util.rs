#![allow(dead_code)]
use mesh_cdfem::cdfem::{CdfemOptions, PhaseSupport, PhaseSupportConfig, SnapshotManager, entity_measure};
use mesh_cdfem::geometry::{AnalyticGeometry, LevelSet, SurfaceId};
use mesh_cdfem::mesh::{BulkData, MetaData, PartId};
use mesh_cdfem::mesh_generation::{DEFAULT_BLOCK, Partition, triangle_mesh};
use mesh_cdfem::topology::{EntityKey, EntityRank};

/// Route `log` output through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn plane(normal: [f64; 3], offset: f64) -> AnalyticGeometry {
    AnalyticGeometry::new(vec![LevelSet::Plane { normal, offset }])
}

pub fn plane_x(offset: f64) -> AnalyticGeometry {
    plane([1.0, 0.0, 0.0], offset)
}

/// Register two phases split by surface 0 on the default block.
pub fn two_phases(mesh: &mut BulkData) -> PhaseSupport {
    let config = PhaseSupportConfig::two_phase(DEFAULT_BLOCK, SurfaceId(0));
    PhaseSupport::declare(mesh.meta_mut(), &config).unwrap()
}

/// 4 x 2 squares on [0, 1] x [0, 0.5], this rank's slab of it.
pub fn strip(partition: Partition) -> (BulkData, PhaseSupport) {
    let mut mesh = triangle_mesh(MetaData::new(2), 4, 2, 1.0, 0.5, partition, Default::default())
        .unwrap()
        .mesh;
    let phases = two_phases(&mut mesh);
    (mesh, phases)
}

pub fn manager(phases: &PhaseSupport) -> SnapshotManager {
    SnapshotManager::new(phases.clone(), CdfemOptions::default()).unwrap()
}

/// The conformal parts (phase A, phase B) of the default block.
pub fn phase_parts(mesh: &BulkData, phases: &PhaseSupport) -> (PartId, PartId) {
    let block = mesh.meta().require_part(DEFAULT_BLOCK).unwrap();
    let parts = phases.conformal_parts(block);
    (parts[0], parts[1])
}

/// Measure of the locally owned active elements in `part`.
pub fn owned_measure(mesh: &BulkData, phases: &PhaseSupport, part: PartId) -> f64 {
    mesh.owned_keys(EntityRank::Element)
        .filter(|k| mesh.has_part(*k, part) && mesh.has_part(*k, phases.active_part()))
        .map(|k| entity_measure(mesh, k).unwrap())
        .sum()
}

pub fn crossing_nodes(mesh: &BulkData, phases: &PhaseSupport) -> Vec<EntityKey> {
    mesh.keys(EntityRank::Node)
        .filter(|k| mesh.has_part(*k, phases.child_edge_node_part()))
        .collect()
}

/// Every entity with its nodes, part names and coordinate bits, in key order.
pub fn fingerprint(mesh: &BulkData) -> Vec<String> {
    let meta = mesh.meta();
    let mut out = Vec::new();
    for rank in [EntityRank::Node, EntityRank::Edge, EntityRank::Face, EntityRank::Element] {
        for key in mesh.keys(rank) {
            let parts: Vec<&str> = mesh.parts_of(key).into_iter().map(|p| meta.part_name(p)).collect();
            let coords = if rank == EntityRank::Node {
                let x = mesh.coordinates(key.id).unwrap();
                format!("{:x}/{:x}/{:x}", x.x.to_bits(), x.y.to_bits(), x.z.to_bits())
            } else {
                String::new()
            };
            out.push(format!("{key:?} {:?} {parts:?} {coords}", mesh.nodes_of(key)));
        }
    }
    out
}
