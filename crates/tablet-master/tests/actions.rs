//! Tablet action tests

mod common;

use common::{chunk, Cluster};
use tablet_master::config::{TabletActionConfig, TabletManagerConfig};
use tablet_master::hive::CellMessage;
use tablet_master::manager::TabletActionRequest;
use tablet_master::metadata::{ActionKind, ActionState, CellId, TabletId, TabletState};
use tablet_master::Error;

fn move_request(tablet_ids: Vec<TabletId>, cell_ids: Vec<CellId>) -> TabletActionRequest {
    TabletActionRequest {
        kind: ActionKind::Move,
        tablet_ids,
        cell_ids,
        pivot_keys: Vec::new(),
        tablet_count: None,
        skip_freezing: false,
        freeze: None,
        keep_finished: false,
    }
}

fn reshard_request(tablet_ids: Vec<TabletId>, tablet_count: usize) -> TabletActionRequest {
    TabletActionRequest {
        kind: ActionKind::Reshard,
        tablet_count: Some(tablet_count),
        ..move_request(tablet_ids, Vec::new())
    }
}

/// Cluster with a mounted single-tablet table; returns the tablet, its cell
/// and another good cell
fn mounted_tablet(cluster: &mut Cluster, path: &str) -> (TabletId, CellId, CellId) {
    cluster.create_sorted_table(path, &[]);
    cluster.mount_and_confirm(path);
    let tablet_id = cluster.tablet_ids(path)[0];
    let source = cluster.tablet(tablet_id).cell.unwrap();
    let target = *cluster.cells.iter().find(|c| **c != source).unwrap();
    (tablet_id, source, target)
}

#[test]
fn test_move_action_completes() {
    let mut cluster = Cluster::new(2);
    let (tablet_id, source, target) = mounted_tablet(&mut cluster, "//t");

    let action_id = cluster
        .manager
        .create_tablet_action(move_request(vec![tablet_id], vec![target]))
        .unwrap();

    let action = &cluster.manager.metadata().actions[&action_id];
    assert_eq!(action.state, ActionState::Freezing);
    assert_eq!(cluster.state(tablet_id), TabletState::Freezing);
    assert_eq!(cluster.tablet(tablet_id).action, Some(action_id));
    assert!(cluster.manager.metadata().cells[&target].actions.contains(&action_id));

    let delivered = cluster.run_cells();

    let unmounts: Vec<_> = delivered
        .iter()
        .filter(|e| matches!(e.message, CellMessage::UnmountTablet { .. }))
        .collect();
    assert_eq!(unmounts.len(), 1);
    assert_eq!(unmounts[0].cell_id, source);
    let mounts: Vec<_> = delivered
        .iter()
        .filter(|e| matches!(e.message, CellMessage::MountTablet { .. }))
        .collect();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].cell_id, target);

    let metadata = cluster.manager.metadata();
    assert!(!metadata.actions.contains_key(&action_id));
    assert!(metadata.cells[&target].actions.is_empty());
    assert_eq!(metadata.bundles[&cluster.bundle_id].active_action_count, 0);

    let tablet = cluster.tablet(tablet_id);
    assert_eq!(tablet.state, TabletState::Mounted);
    assert_eq!(tablet.cell, Some(target));
    assert_eq!(tablet.action, None);
}

#[test]
fn test_move_keeps_frozen_tablets_frozen() {
    let mut cluster = Cluster::new(2);
    let (tablet_id, _, target) = mounted_tablet(&mut cluster, "//t");
    cluster.manager.freeze_table("//t", None, None).unwrap();
    cluster.run_cells();
    assert_eq!(cluster.state(tablet_id), TabletState::Frozen);

    cluster
        .manager
        .create_tablet_action(move_request(vec![tablet_id], vec![target]))
        .unwrap();
    cluster.run_cells();

    let tablet = cluster.tablet(tablet_id);
    assert_eq!(tablet.state, TabletState::Frozen);
    assert_eq!(tablet.cell, Some(target));
}

#[test]
fn test_finished_action_is_kept_until_expiration() {
    let mut cluster = Cluster::new(2);
    let (tablet_id, _, target) = mounted_tablet(&mut cluster, "//t");

    let mut request = move_request(vec![tablet_id], vec![target]);
    request.keep_finished = true;
    let action_id = cluster.manager.create_tablet_action(request).unwrap();
    cluster.run_cells();

    let action = &cluster.manager.metadata().actions[&action_id];
    assert_eq!(action.state, ActionState::Completed);
    assert!(action.tablets.is_empty());
    assert_eq!(action.finished_at, Some(cluster.manager.now()));
    assert_eq!(
        cluster.manager.metadata().bundles[&cluster.bundle_id].active_action_count,
        0
    );

    cluster.advance(60);
    assert_eq!(cluster.manager.cleanup_expired_tablet_actions(), 0);

    cluster.advance(601);
    assert_eq!(cluster.manager.cleanup_expired_tablet_actions(), 1);
    assert!(cluster.manager.metadata().actions.is_empty());
    assert!(cluster.manager.metadata().bundles[&cluster.bundle_id]
        .actions
        .is_empty());
}

#[test]
fn test_reshard_action_splits_by_data_size() {
    let mut cluster = Cluster::new(2);
    cluster.create_sorted_table("//t", &[]);
    cluster
        .manager
        .attach_chunk("//t", 0, chunk(100, b"a", b"c", 100))
        .unwrap();
    cluster
        .manager
        .attach_chunk("//t", 0, chunk(101, b"m", b"z", 100))
        .unwrap();
    cluster.mount_and_confirm("//t");
    let old_tablet = cluster.tablet_ids("//t")[0];

    let action_id = cluster
        .manager
        .create_tablet_action(reshard_request(vec![old_tablet], 2))
        .unwrap();
    cluster.run_cells();

    let metadata = cluster.manager.metadata();
    assert!(!metadata.actions.contains_key(&action_id));
    assert!(!metadata.tablets.contains_key(&old_tablet));

    let tablet_ids = cluster.tablet_ids("//t");
    assert_eq!(tablet_ids.len(), 2);
    let pivots: Vec<Vec<u8>> = tablet_ids
        .iter()
        .map(|id| cluster.tablet(*id).pivot_key.clone())
        .collect();
    assert_eq!(pivots, vec![b"".to_vec(), b"m".to_vec()]);
    assert_eq!(cluster.states("//t"), vec![TabletState::Mounted; 2]);

    let chunks = &cluster.manager.metadata().chunks;
    assert_eq!(chunks.chunk_ids(tablet_ids[0]).len(), 1);
    assert_eq!(chunks.chunk_ids(tablet_ids[1]).len(), 1);
}

#[test]
fn test_user_unmount_fails_running_action() {
    let mut cluster = Cluster::new(2);
    let (tablet_id, _, target) = mounted_tablet(&mut cluster, "//t");

    let action_id = cluster
        .manager
        .create_tablet_action(move_request(vec![tablet_id], vec![target]))
        .unwrap();
    assert_eq!(cluster.state(tablet_id), TabletState::Freezing);

    cluster.manager.unmount_table("//t", None, None, false).unwrap();

    let metadata = cluster.manager.metadata();
    assert!(!metadata.actions.contains_key(&action_id));
    assert!(metadata.cells[&target].actions.is_empty());
    assert_eq!(metadata.bundles[&cluster.bundle_id].active_action_count, 0);
    let tablet = cluster.tablet(tablet_id);
    assert_eq!(tablet.action, None);
    assert_eq!(tablet.state, TabletState::Unmounting);
}

#[test]
fn test_failed_move_remounts_on_source_cell() {
    let mut cluster = Cluster::new(2);
    let (tablet_id, source, target) = mounted_tablet(&mut cluster, "//t");

    let mut request = move_request(vec![tablet_id], vec![target]);
    request.keep_finished = true;
    let action_id = cluster.manager.create_tablet_action(request).unwrap();
    cluster.manager.drain_outbox();

    assert!(cluster.confirm_frozen(tablet_id));
    assert_eq!(
        cluster.manager.metadata().actions[&action_id].state,
        ActionState::Unmounting
    );
    assert_eq!(cluster.state(tablet_id), TabletState::Unmounting);

    cluster.manager.destroy_tablet_cell(target).unwrap();
    assert_eq!(
        cluster.manager.metadata().actions[&action_id].state,
        ActionState::Unmounting
    );

    assert!(cluster.confirm_unmounted(tablet_id));

    let action = &cluster.manager.metadata().actions[&action_id];
    assert_eq!(action.state, ActionState::Failed);
    assert!(action.error.as_deref().unwrap().contains("has been removed"));
    assert!(action.tablets.is_empty());

    let tablet = cluster.tablet(tablet_id);
    assert_eq!(tablet.state, TabletState::Mounting);
    assert_eq!(tablet.cell, Some(source));
    assert_eq!(tablet.action, None);
}

#[test]
fn test_remove_running_action_releases_tablets() {
    let mut cluster = Cluster::new(2);
    let (tablet_id, _, target) = mounted_tablet(&mut cluster, "//t");

    let action_id = cluster
        .manager
        .create_tablet_action(move_request(vec![tablet_id], vec![target]))
        .unwrap();
    cluster.manager.remove_tablet_action(action_id).unwrap();

    let metadata = cluster.manager.metadata();
    assert!(metadata.actions.is_empty());
    assert!(metadata.cells[&target].actions.is_empty());
    assert_eq!(metadata.bundles[&cluster.bundle_id].active_action_count, 0);
    let tablet = cluster.tablet(tablet_id);
    assert_eq!(tablet.action, None);
    assert_eq!(tablet.state, TabletState::Freezing);

    let err = cluster.manager.remove_tablet_action(action_id).unwrap_err();
    assert!(matches!(err, Error::NoSuchObject { .. }));
}

#[test]
fn test_create_action_validation() {
    let mut cluster = Cluster::new(2);
    let (tablet_id, _, target) = mounted_tablet(&mut cluster, "//t");
    cluster.create_sorted_table("//unmounted", &[]);
    let unmounted = cluster.tablet_ids("//unmounted")[0];

    let err = cluster
        .manager
        .create_tablet_action(move_request(Vec::new(), Vec::new()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = cluster
        .manager
        .create_tablet_action(move_request(vec![unmounted], Vec::new()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let err = cluster
        .manager
        .create_tablet_action(move_request(vec![tablet_id, tablet_id], Vec::new()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = cluster
        .manager
        .create_tablet_action(move_request(vec![tablet_id], vec![target, target]))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let mut request = move_request(vec![tablet_id], Vec::new());
    request.tablet_count = Some(2);
    let err = cluster.manager.create_tablet_action(request).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let mut request = reshard_request(vec![tablet_id], 2);
    request.pivot_keys = vec![b"".to_vec(), b"k".to_vec()];
    let err = cluster.manager.create_tablet_action(request).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Nothing was created along the way
    assert!(cluster.manager.metadata().actions.is_empty());
    assert_eq!(cluster.tablet(tablet_id).action, None);

    cluster
        .manager
        .create_tablet_action(move_request(vec![tablet_id], Vec::new()))
        .unwrap();
    let err = cluster
        .manager
        .create_tablet_action(move_request(vec![tablet_id], Vec::new()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[test]
fn test_reshard_action_requires_contiguous_range() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[b"", b"g", b"p"]);
    cluster.mount_and_confirm("//t");
    let tablet_ids = cluster.tablet_ids("//t");

    let err = cluster
        .manager
        .create_tablet_action(reshard_request(vec![tablet_ids[0], tablet_ids[2]], 1))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_active_action_limit() {
    let config = TabletManagerConfig {
        max_active_actions_per_bundle: 1,
        ..Default::default()
    };
    let mut cluster = Cluster::with_config(2, config, TabletActionConfig::default());
    let (first, _, _) = mounted_tablet(&mut cluster, "//a");
    let (second, _, _) = mounted_tablet(&mut cluster, "//b");

    cluster
        .manager
        .create_tablet_action(move_request(vec![first], Vec::new()))
        .unwrap();
    let err = cluster
        .manager
        .create_tablet_action(move_request(vec![second], Vec::new()))
        .unwrap_err();
    assert!(matches!(err, Error::LimitExceeded(_)));

    cluster.run_cells();
    cluster
        .manager
        .create_tablet_action(move_request(vec![second], Vec::new()))
        .unwrap();
}
