//! Tablet mount lifecycle tests

mod common;

use common::{chunk, Cluster, BUNDLE};
use tablet_master::hive::CellMessage;
use tablet_master::manager::CellNotification;
use tablet_master::metadata::{
    BundleOptions, CellHealth, ChunkId, CloneMode, TableOptions, TabletState,
};
use tablet_master::Error;

#[test]
fn test_mount_places_tablets_on_good_cells() {
    let mut cluster = Cluster::new(2);
    cluster.create_sorted_table("//t", &[b"", b"m"]);

    cluster.manager.mount_table("//t", None, None, None, false).unwrap();

    let tablet_ids = cluster.tablet_ids("//t");
    for tablet_id in &tablet_ids {
        let tablet = cluster.tablet(*tablet_id);
        assert_eq!(tablet.state, TabletState::Mounting);
        let cell_id = tablet.cell.unwrap();
        assert!(cluster.cells.contains(&cell_id));
        assert!(cluster.manager.metadata().cells[&cell_id].tablets.contains(tablet_id));
    }

    let envelopes = cluster.manager.drain_outbox();
    assert_eq!(envelopes.len(), 2);
    for envelope in &envelopes {
        match &envelope.message {
            CellMessage::MountTablet {
                tablet_id,
                pivot_key,
                next_pivot_key,
                freeze,
                ..
            } => {
                assert!(!freeze);
                if *tablet_id == tablet_ids[0] {
                    assert!(pivot_key.is_empty());
                    assert_eq!(next_pivot_key.as_deref(), Some(&b"m"[..]));
                } else {
                    assert_eq!(pivot_key.as_slice(), b"m");
                    assert_eq!(*next_pivot_key, None);
                }
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    for tablet_id in &tablet_ids {
        assert!(cluster.confirm_mounted(*tablet_id));
    }
    assert_eq!(cluster.states("//t"), vec![TabletState::Mounted; 2]);
}

#[test]
fn test_mount_without_healthy_cells_is_unavailable() {
    let mut cluster = Cluster::new(0);
    cluster.create_sorted_table("//t", &[]);

    let err = cluster
        .manager
        .mount_table("//t", None, None, None, false)
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
    assert_eq!(cluster.states("//t"), vec![TabletState::Unmounted]);
    assert!(cluster.manager.drain_outbox().is_empty());
}

#[test]
fn test_mount_into_cell_of_other_bundle_is_refused() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    let other = cluster
        .manager
        .create_tablet_cell_bundle("other", BundleOptions::default())
        .unwrap();
    let foreign_cell = cluster.manager.create_tablet_cell(other).unwrap();

    let err = cluster
        .manager
        .mount_table("//t", None, None, Some(foreign_cell), false)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_static_table_cannot_be_mounted() {
    let mut cluster = Cluster::new(1);
    let options = TableOptions {
        bundle: BUNDLE.to_string(),
        dynamic: false,
        ..Default::default()
    };
    cluster.manager.create_table("//static", options).unwrap();

    let err = cluster
        .manager
        .mount_table("//static", None, None, None, false)
        .unwrap_err();
    assert_eq!(
        err,
        Error::InvalidState("Cannot mount a static table".to_string())
    );
}

#[test]
fn test_invalid_range_is_rejected() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[b"", b"m"]);

    let err = cluster
        .manager
        .mount_table("//t", Some(1), Some(5), None, false)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = cluster
        .manager
        .unmount_table("//t", Some(1), Some(0), false)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_unmount_detaches_tablet_from_cell() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    cluster
        .manager
        .attach_chunk("//t", 0, chunk(100, b"a", b"z", 1000))
        .unwrap();
    cluster.mount_and_confirm("//t");

    let tablet_id = cluster.tablet_ids("//t")[0];
    let cell_id = cluster.tablet(tablet_id).cell.unwrap();
    let statistics = &cluster.manager.metadata().cells[&cell_id].total_statistics;
    assert_eq!(statistics.uncompressed_data_size, 1000);
    assert_eq!(statistics.tablet_count, 1);

    cluster.manager.unmount_table("//t", None, None, false).unwrap();

    let tablet = cluster.tablet(tablet_id);
    assert_eq!(tablet.state, TabletState::Unmounting);
    assert_eq!(tablet.cell, None);
    let cell = &cluster.manager.metadata().cells[&cell_id];
    assert!(cell.tablets.is_empty());
    assert_eq!(cell.total_statistics.uncompressed_data_size, 0);
    assert_eq!(cell.total_statistics.tablet_count, 0);

    let envelopes = cluster.manager.drain_outbox();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].cell_id, cell_id);
    assert!(matches!(
        envelopes[0].message,
        CellMessage::UnmountTablet { force: false, .. }
    ));

    assert!(cluster.confirm_unmounted(tablet_id));
    assert_eq!(cluster.state(tablet_id), TabletState::Unmounted);
}

#[test]
fn test_forced_unmount_completes_at_once() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    cluster.manager.mount_table("//t", None, None, None, false).unwrap();

    cluster.manager.unmount_table("//t", None, None, true).unwrap();

    assert_eq!(cluster.states("//t"), vec![TabletState::Unmounted]);
}

#[test]
fn test_stale_notification_is_ignored() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    let tablet_id = cluster.tablet_ids("//t")[0];

    cluster.manager.mount_table("//t", None, None, None, false).unwrap();
    let old_revision = cluster.tablet(tablet_id).mount_revision;
    cluster.manager.unmount_table("//t", None, None, true).unwrap();
    cluster.manager.mount_table("//t", None, None, None, false).unwrap();
    assert!(cluster.tablet(tablet_id).mount_revision > old_revision);

    let applied = cluster
        .manager
        .on_cell_notification(CellNotification::TabletMounted {
            tablet_id,
            mount_revision: old_revision,
            frozen: false,
        });
    assert!(!applied);
    assert_eq!(cluster.state(tablet_id), TabletState::Mounting);

    // Notification for a state the tablet is not in
    assert!(!cluster.confirm_unmounted(tablet_id));
    assert_eq!(cluster.state(tablet_id), TabletState::Mounting);
}

#[test]
fn test_repeated_mounted_notification_is_noop() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    let tablet_id = cluster.tablet_ids("//t")[0];
    cluster.manager.mount_table("//t", None, None, None, false).unwrap();
    cluster.manager.drain_outbox();

    let notification = CellNotification::TabletMounted {
        tablet_id,
        mount_revision: cluster.tablet(tablet_id).mount_revision,
        frozen: false,
    };
    assert!(cluster.manager.on_cell_notification(notification.clone()));
    assert_eq!(cluster.state(tablet_id), TabletState::Mounted);
    let before = serde_json::to_value(cluster.manager.metadata()).unwrap();

    assert!(!cluster.manager.on_cell_notification(notification));
    assert_eq!(serde_json::to_value(cluster.manager.metadata()).unwrap(), before);
    assert!(cluster.manager.drain_outbox().is_empty());
}

#[test]
fn test_cell_with_pending_unmount_cannot_be_destroyed() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    cluster.mount_and_confirm("//t");
    let tablet_id = cluster.tablet_ids("//t")[0];
    let cell_id = cluster.cells[0];

    cluster.manager.unmount_table("//t", None, None, false).unwrap();
    assert_eq!(cluster.tablet(tablet_id).unmounting_cell, Some(cell_id));

    let err = cluster.manager.destroy_tablet_cell(cell_id).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(cluster.manager.metadata().cells.contains_key(&cell_id));
    // The unmount request is still queued for the cell
    let envelopes = cluster.manager.drain_outbox();
    assert_eq!(envelopes.len(), 1);
    assert!(matches!(
        envelopes[0].message,
        CellMessage::UnmountTablet { force: false, .. }
    ));

    assert!(cluster.confirm_unmounted(tablet_id));
    assert_eq!(cluster.tablet(tablet_id).unmounting_cell, None);
    cluster.manager.destroy_tablet_cell(cell_id).unwrap();
    assert!(!cluster.manager.metadata().cells.contains_key(&cell_id));
}

#[test]
fn test_forced_unmount_releases_destroy_of_cell() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    cluster.mount_and_confirm("//t");
    let cell_id = cluster.cells[0];

    cluster.manager.unmount_table("//t", None, None, false).unwrap();
    assert!(cluster.manager.destroy_tablet_cell(cell_id).is_err());

    cluster.manager.unmount_table("//t", None, None, true).unwrap();
    assert_eq!(cluster.states("//t"), vec![TabletState::Unmounted]);
    cluster.manager.destroy_tablet_cell(cell_id).unwrap();
}

#[test]
fn test_freeze_and_unfreeze() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    cluster.mount_and_confirm("//t");
    let tablet_id = cluster.tablet_ids("//t")[0];

    cluster.manager.freeze_table("//t", None, None).unwrap();
    assert_eq!(cluster.state(tablet_id), TabletState::Freezing);
    let envelopes = cluster.manager.drain_outbox();
    assert!(matches!(envelopes[0].message, CellMessage::FreezeTablet { .. }));

    assert!(cluster.confirm_frozen(tablet_id));
    assert_eq!(cluster.state(tablet_id), TabletState::Frozen);

    cluster.manager.unfreeze_table("//t", Some(0), Some(0)).unwrap();
    assert_eq!(cluster.state(tablet_id), TabletState::Unfreezing);
    assert!(cluster.confirm_unfrozen(tablet_id));
    assert_eq!(cluster.state(tablet_id), TabletState::Mounted);
}

#[test]
fn test_mount_frozen() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    cluster.manager.mount_table("//t", None, None, None, true).unwrap();
    let tablet_id = cluster.tablet_ids("//t")[0];
    assert_eq!(cluster.state(tablet_id), TabletState::FrozenMounting);

    assert!(cluster.confirm_mounted(tablet_id));
    assert_eq!(cluster.state(tablet_id), TabletState::Frozen);

    // Mounting again with freeze is a no-op for frozen tablets
    cluster.manager.drain_outbox();
    cluster.manager.mount_table("//t", None, None, None, true).unwrap();
    assert!(cluster.manager.drain_outbox().is_empty());

    let err = cluster
        .manager
        .mount_table("//t", None, None, None, false)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[test]
fn test_freeze_refused_for_unmounted_tablet() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);

    let err = cluster.manager.freeze_table("//t", None, None).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[test]
fn test_remount_posts_to_mounted_tablets() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[b"", b"m"]);
    cluster.mount_and_confirm("//t");

    cluster.manager.remount_table("//t", None, None).unwrap();

    let envelopes = cluster.manager.drain_outbox();
    assert_eq!(envelopes.len(), 2);
    assert!(envelopes
        .iter()
        .all(|e| matches!(e.message, CellMessage::RemountTablet { .. })));
}

#[test]
fn test_stores_updated_recharges_cell() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    cluster
        .manager
        .attach_chunk("//t", 0, chunk(100, b"a", b"k", 1000))
        .unwrap();
    cluster.mount_and_confirm("//t");
    let tablet_id = cluster.tablet_ids("//t")[0];
    let cell_id = cluster.tablet(tablet_id).cell.unwrap();

    let applied = cluster.notify(tablet_id, |tablet_id, mount_revision| {
        CellNotification::StoresUpdated {
            tablet_id,
            mount_revision,
            stores_to_add: vec![chunk(101, b"a", b"z", 400)],
            stores_to_remove: vec![ChunkId(100)],
        }
    });
    assert!(applied);

    let metadata = cluster.manager.metadata();
    assert_eq!(
        metadata.cells[&cell_id].total_statistics.uncompressed_data_size,
        400
    );
    assert!(metadata.chunks.chunk(ChunkId(100)).is_none());
}

#[test]
fn test_remove_table_requires_unmounted_tablets() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//t", &[]);
    cluster.mount_and_confirm("//t");

    let err = cluster.manager.remove_table("//t").unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    cluster.manager.unmount_table("//t", None, None, true).unwrap();
    cluster.manager.remove_table("//t").unwrap();

    let metadata = cluster.manager.metadata();
    assert!(metadata.find_table_by_path("//t").is_none());
    assert!(metadata.tablets.is_empty());
}

#[test]
fn test_clone_copy_shares_chunks() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//src", &[]);
    cluster
        .manager
        .attach_chunk("//src", 0, chunk(100, b"a", b"z", 1000))
        .unwrap();
    cluster.mount_and_confirm("//src");

    // Mounted tablets cannot be copied
    let err = cluster
        .manager
        .clone_table("//src", "//dst", CloneMode::Copy)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    cluster.manager.freeze_table("//src", None, None).unwrap();
    let tablet_id = cluster.tablet_ids("//src")[0];
    cluster.confirm_frozen(tablet_id);

    cluster
        .manager
        .clone_table("//src", "//dst", CloneMode::Copy)
        .unwrap();

    let copy_id = cluster.tablet_ids("//dst")[0];
    assert_eq!(cluster.state(copy_id), TabletState::Unmounted);
    let chunks = &cluster.manager.metadata().chunks;
    assert_eq!(chunks.chunk_ids(copy_id), chunks.chunk_ids(tablet_id));

    // Moving requires every tablet unmounted
    let err = cluster
        .manager
        .clone_table("//src", "//moved", CloneMode::Move)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[test]
fn test_clone_move_removes_source() {
    let mut cluster = Cluster::new(1);
    cluster.create_sorted_table("//src", &[b"", b"m"]);

    cluster
        .manager
        .clone_table("//src", "//dst", CloneMode::Move)
        .unwrap();

    let metadata = cluster.manager.metadata();
    assert!(metadata.find_table_by_path("//src").is_none());
    assert_eq!(cluster.tablet_ids("//dst").len(), 2);
    assert_eq!(metadata.tablets.len(), 2);
}

#[test]
fn test_cell_health_follows_peer_reports() {
    let mut cluster = Cluster::new(1);
    let cell_id = cluster.cells[0];
    assert_eq!(
        cluster.manager.metadata().cells[&cell_id].health(),
        CellHealth::Good
    );

    cluster.create_sorted_table("//t", &[]);
    cluster.mount_and_confirm("//t");
    cluster.fail_cell(cell_id);

    assert_eq!(
        cluster.manager.metadata().cells[&cell_id].health(),
        CellHealth::Failed
    );
    // Failed cells keep their tablets
    let tablet_id = cluster.tablet_ids("//t")[0];
    assert_eq!(cluster.tablet(tablet_id).cell, Some(cell_id));
}
