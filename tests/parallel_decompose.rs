mod util;
use util::*;

use approx::assert_relative_eq;
use mesh_cdfem::algs::communicator::{Communicator, RayonComm};
use mesh_cdfem::cdfem::{CdfemOptions, SnapshotManager, check_element_side_parts};
use mesh_cdfem::mesh_error::MeshError;
use mesh_cdfem::mesh_generation::Partition;
use mesh_cdfem::topology::{EntityKey, EntityRank};
use serial_test::serial;

/// `(id, x bits, y bits, parent node ids)` of the crossing nodes on x = 0.5, plus this
/// rank's share of the phase A area.
type RankView = (Vec<(u64, u64, u64, Vec<u64>)>, f64);

fn decompose_on(comm: &RayonComm) -> RankView {
    let partition = Partition { rank: comm.rank(), size: comm.size() };
    let (mut mesh, phases) = strip(partition);
    let mut manager = manager(&phases);
    // y = 0.1 crosses the vertical edge on x = 0.5 that both slabs hold
    let mut g = plane([0.0, 1.0, 0.0], 0.1);
    manager.decompose_mesh(&mut mesh, &mut g, comm, 0, &[]).unwrap();

    let parents = phases.parent_node_ids_field();
    let mut seam: Vec<_> = crossing_nodes(&mesh, &phases)
        .into_iter()
        .filter_map(|k| {
            let x = mesh.coordinates(k.id).unwrap();
            ((x.x - 0.5).abs() < 1e-12).then(|| {
                let mut ids: Vec<u64> = mesh.field_data(parents, k).unwrap()[..2].iter().map(|v| *v as u64).collect();
                ids.sort();
                (k.id.get(), x.x.to_bits(), x.y.to_bits(), ids)
            })
        })
        .collect();
    seam.sort();
    let (a, _) = phase_parts(&mesh, &phases);
    (seam, owned_measure(&mesh, &phases, a))
}

fn run_world(world: &[RayonComm]) -> Vec<RankView> {
    std::thread::scope(|s| {
        let handles: Vec<_> = world.iter().map(|comm| s.spawn(move || decompose_on(comm))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn shared_cut_edge_gets_one_node() {
    let views = run_world(&RayonComm::world(2));
    let (seam0, area0) = &views[0];
    let (seam1, area1) = &views[1];
    assert_eq!(seam0.len(), 1);
    assert_eq!(seam0, seam1);
    assert_relative_eq!(f64::from_bits(seam0[0].2), 0.1, epsilon = 1e-12);
    assert_relative_eq!(area0 + area1, 0.1, epsilon = 1e-12);
    assert_relative_eq!(*area0, 0.05, epsilon = 1e-12);
}

#[test]
fn parallel_runs_are_reproducible() {
    let first = run_world(&RayonComm::world(2));
    let second = run_world(&RayonComm::world(2));
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.0, b.0);
        assert_eq!(a.1.to_bits(), b.1.to_bits());
    }
}

#[test]
#[serial]
fn process_wide_mailbox_world() {
    let world = [RayonComm::new(0, 2), RayonComm::new(1, 2)];
    let views = run_world(&world);
    assert_eq!(views[0].0, views[1].0);
}

fn on_ranks<T, F>(world: &[RayonComm], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&RayonComm) -> T + Sync,
{
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = world.iter().map(|comm| s.spawn(move || f(comm))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn side_part_check_sees_both_slabs() {
    // the interface lies on the slab seam, so no rank holds both sides of it
    let results = on_ranks(&RayonComm::world(2), |comm| {
        let partition = Partition { rank: comm.rank(), size: comm.size() };
        let (mut mesh, phases) = strip(partition);
        let mut manager = manager(&phases);
        manager.decompose_mesh(&mut mesh, &mut plane_x(0.5), comm, 0, &[]).unwrap();
        let healthy = check_element_side_parts(&mesh, &phases, comm).is_ok();

        let surface = *phases.interface_parts().iter().next().unwrap();
        let seam: Vec<EntityKey> = mesh.keys(EntityRank::Edge).filter(|k| mesh.has_part(*k, surface)).collect();
        if comm.rank() == 1 {
            mesh.modification_begin().unwrap();
            for key in &seam {
                mesh.change_entity_parts(*key, &[], &[surface]).unwrap();
            }
            mesh.modification_end().unwrap();
        }
        let broken = check_element_side_parts(&mesh, &phases, comm);
        (healthy, seam.len(), matches!(broken, Err(MeshError::InvariantViolation(_))))
    });
    for (healthy, seam, broken) in results {
        assert!(healthy);
        assert_eq!(seam, 2);
        assert!(broken);
    }
}

#[test]
fn remote_only_facets_fall_back_to_nodes_on_the_last_round() {
    init_logging();
    let reports = on_ranks(&RayonComm::world(2), |comm| {
        let partition = Partition { rank: comm.rank(), size: comm.size() };
        let (mut mesh, phases) = strip(partition);
        let temperature = mesh.meta_mut().declare_field("temperature", EntityRank::Node, 1);
        mesh.modification_begin().unwrap();
        mesh.modification_end().unwrap();
        let nodes: Vec<EntityKey> = mesh.keys(EntityRank::Node).collect();
        for k in nodes {
            let x = mesh.coordinates(k.id).unwrap().x;
            mesh.field_data_mut(temperature, k).unwrap()[0] = x;
        }
        // padding far below the distance to the old facets, and no second round
        let options = CdfemOptions { padding_multiplier: 1e-3, max_padding_rounds: 1, ..CdfemOptions::default() };
        let mut manager = SnapshotManager::new(phases.clone(), options).unwrap();
        // facets of the old interface exist only on rank 1
        manager.decompose_mesh(&mut mesh, &mut plane_x(0.7), comm, 0, &[]).unwrap();
        manager.decompose_mesh(&mut mesh, &mut plane_x(0.3), comm, 1, &[]).unwrap();

        let bottom = crossing_nodes(&mesh, &phases)
            .into_iter()
            .find(|k| mesh.coordinates(k.id).unwrap().y.abs() < 1e-12)
            .map(|k| mesh.field_data(temperature, k).unwrap()[0]);
        (*manager.last_prolongation().unwrap(), bottom)
    });
    let (report, bottom) = &reports[0];
    assert_eq!(report.rounds, 1);
    assert_eq!(report.nodes_missing, 0);
    assert!(report.nodes_from_nodes >= 1);
    assert_relative_eq!(bottom.unwrap(), 0.25, epsilon = 1e-12);
    assert_eq!(reports[1].0.nodes_missing, 0);
}
