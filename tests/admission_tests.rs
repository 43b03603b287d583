//! Integration tests for capacity admission in the volume service

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use common::*;
use lvm_backup_operator::config::ScriptConf;
use lvm_backup_operator::error::{Code, Error};
use lvm_backup_operator::lvm::{DeviceClass, DeviceClassManager, LvService};
use lvm_backup_operator::orchestrator::{BackupService, DataSource, RestoreRequest};
use lvm_backup_operator::script::{Progress, ScriptRunner};

const GIB: u64 = 1 << 30;

// ============================================================================
// Test Helpers
// ============================================================================

fn device_classes() -> DeviceClassManager {
    DeviceClassManager::new(vec![
        DeviceClass {
            name: "ssd".to_string(),
            volume_group: "vg-ssd".to_string(),
            default: true,
        },
        DeviceClass {
            name: "hdd".to_string(),
            volume_group: "vg-missing".to_string(),
            default: false,
        },
    ])
}

fn runner(dir: &TempDir, kind: &'static str, body: &str) -> ScriptRunner {
    let conf = ScriptConf {
        script_path: write_script(dir.path(), &format!("{}.sh", kind), body),
        workdir: dir.path().join(kind),
    };
    ScriptRunner::new(kind, &conf).with_poll_interval(Duration::from_millis(20))
}

fn service_with(dir: &TempDir, vg: Arc<FakeVolumeGroup>, restore_body: &str) -> LvService {
    LvService::with_runners(
        device_classes(),
        Arc::new(FakeAccessor::default().with_group(vg)),
        runner(dir, "backup", "exit 0"),
        runner(dir, "restore", restore_body),
    )
}

fn restore_request(id: &str, synchronous: bool) -> RestoreRequest {
    RestoreRequest {
        id: id.to_string(),
        source: DataSource {
            path: "s3://backups/data".to_string(),
            synchronous,
            ..Default::default()
        },
    }
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_admits_up_to_free_capacity() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg.clone(), "exit 0");

    let lv = service
        .create_volume("ssd", "pvc-a", 4 * GIB, &[], None)
        .await
        .unwrap();
    assert_eq!(lv.size, 4 * GIB);
    assert_eq!(vg.free_now(), 6 * GIB);

    // exactly the remaining capacity still fits
    service
        .create_volume("", "pvc-b", 6 * GIB, &[], None)
        .await
        .unwrap();
    assert_eq!(vg.free_now(), 0);

    let err = service
        .create_volume("ssd", "pvc-c", 1, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CapacityExhausted { free: 0, requested: 1 }));
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(vg.volume_names(), vec!["pvc-a".to_string(), "pvc-b".to_string()]);
}

#[tokio::test]
async fn test_create_passes_tags() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg, "exit 0");

    let lv = service
        .create_volume("ssd", "pvc-a", GIB, &["owner=csi".to_string()], None)
        .await
        .unwrap();

    assert_eq!(lv.tags, vec!["owner=csi".to_string()]);
}

#[tokio::test]
async fn test_unknown_device_class_is_not_found() {
    let dir = tempdir().unwrap();
    let service = service_with(&dir, FakeVolumeGroup::new("vg-ssd", GIB), "exit 0");

    let err = service
        .create_volume("nvme", "pvc-a", 1, &[], None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = service
        .create_volume("hdd", "pvc-a", 1, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VolumeGroupNotFound(_)));
}

#[tokio::test]
async fn test_concurrent_creates_never_overcommit() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = Arc::new(service_with(&dir, vg.clone(), "exit 0"));

    let mut handles = Vec::new();
    for i in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .create_volume("ssd", &format!("pvc-{}", i), 3 * GIB, &[], None)
                .await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert!(matches!(e, Error::CapacityExhausted { .. })),
        }
    }

    assert_eq!(admitted, 3);
    assert_eq!(vg.used(), 9 * GIB);
}

// ============================================================================
// Resize
// ============================================================================

#[tokio::test]
async fn test_resize_rejects_shrink() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg.clone(), "exit 0");
    service
        .create_volume("ssd", "pvc-a", 4 * GIB, &[], None)
        .await
        .unwrap();

    let err = service
        .resize_volume("ssd", "pvc-a", 2 * GIB)
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::OutOfRange);
    assert_eq!(vg.size_of("pvc-a"), Some(4 * GIB));
}

#[tokio::test]
async fn test_resize_admits_growth_within_free() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg.clone(), "exit 0");
    service
        .create_volume("ssd", "pvc-a", 4 * GIB, &[], None)
        .await
        .unwrap();

    // growth of exactly the free capacity
    service
        .resize_volume("ssd", "pvc-a", 10 * GIB)
        .await
        .unwrap();
    assert_eq!(vg.size_of("pvc-a"), Some(10 * GIB));

    let err = service
        .resize_volume("ssd", "pvc-a", 10 * GIB + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CapacityExhausted { free: 0, requested: 1 }));
}

#[tokio::test]
async fn test_resize_to_same_size_is_a_no_op() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 4 * GIB);
    let service = service_with(&dir, vg.clone(), "exit 0");
    service
        .create_volume("ssd", "pvc-a", 4 * GIB, &[], None)
        .await
        .unwrap();
    let changes = service.subscribe();

    service.resize_volume("ssd", "pvc-a", 4 * GIB).await.unwrap();

    assert!(!changes.has_changed().unwrap());
}

#[tokio::test]
async fn test_resize_missing_volume_is_not_found() {
    let dir = tempdir().unwrap();
    let service = service_with(&dir, FakeVolumeGroup::new("vg-ssd", GIB), "exit 0");

    let err = service.resize_volume("ssd", "ghost", GIB).await.unwrap_err();

    assert!(matches!(err, Error::VolumeNotFound(_)));
}

// ============================================================================
// Remove and Notifications
// ============================================================================

#[tokio::test]
async fn test_remove_is_idempotent() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg.clone(), "exit 0");
    service
        .create_volume("ssd", "pvc-a", 4 * GIB, &[], None)
        .await
        .unwrap();

    service.remove_volume("ssd", "pvc-a").await.unwrap();
    service.remove_volume("ssd", "pvc-a").await.unwrap();

    assert!(vg.volume_names().is_empty());
    assert_eq!(vg.free_now(), 10 * GIB);
}

#[tokio::test]
async fn test_concurrent_removes_both_succeed() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg.clone(), "exit 0");
    service
        .create_volume("ssd", "pvc-1", GIB, &[], None)
        .await
        .unwrap();
    let mut changes = service.subscribe();
    let before = *changes.borrow_and_update();

    let (first, second) = tokio::join!(
        service.remove_volume("ssd", "pvc-1"),
        service.remove_volume("ssd", "pvc-1"),
    );

    first.unwrap();
    second.unwrap();
    assert!(vg.volume_names().is_empty());
    assert_eq!(*changes.borrow_and_update(), before + 1);
}

#[tokio::test]
async fn test_mutations_notify_subscribers() {
    let dir = tempdir().unwrap();
    let service = service_with(&dir, FakeVolumeGroup::new("vg-ssd", 10 * GIB), "exit 0");
    let mut changes = service.subscribe();

    service
        .create_volume("ssd", "pvc-a", GIB, &[], None)
        .await
        .unwrap();
    assert!(changes.has_changed().unwrap());
    let after_create = *changes.borrow_and_update();

    let _ = service.create_volume("ssd", "pvc-b", 100 * GIB, &[], None).await;
    assert!(!changes.has_changed().unwrap());

    service.remove_volume("ssd", "pvc-a").await.unwrap();
    assert!(*changes.borrow_and_update() > after_create);
}

// ============================================================================
// Restore Seeding
// ============================================================================

#[tokio::test]
async fn test_synchronous_restore_failure_removes_volume() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg.clone(), "echo 'object not found' >&2\nexit 1");

    let err = service
        .create_volume("ssd", "pvc-a", GIB, &[], Some(&restore_request("default.seed", true)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Restore(ref message) if message == "object not found"));
    assert_eq!(err.code(), Code::Internal);
    assert!(vg.volume_names().is_empty());
    assert_eq!(vg.free_now(), 10 * GIB);
}

#[tokio::test]
async fn test_synchronous_restore_success_keeps_volume() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg.clone(), "test -n \"$S3_PATH\"\nexit 0");

    service
        .create_volume("ssd", "pvc-a", GIB, &[], Some(&restore_request("default.seed", true)))
        .await
        .unwrap();

    assert_eq!(vg.volume_names(), vec!["pvc-a".to_string()]);
}

#[tokio::test]
async fn test_asynchronous_restore_returns_before_completion() {
    let dir = tempdir().unwrap();
    let vg = FakeVolumeGroup::new("vg-ssd", 10 * GIB);
    let service = service_with(&dir, vg.clone(), "sleep 1\nexit 0");

    service
        .create_volume("ssd", "pvc-a", GIB, &[], Some(&restore_request("default.seed", false)))
        .await
        .unwrap();

    assert_eq!(
        service.restore_progress("default.seed").await.unwrap(),
        Progress::Running
    );
    assert_eq!(vg.volume_names(), vec!["pvc-a".to_string()]);

    let mut progress = Progress::Running;
    for _ in 0..100 {
        progress = service.restore_progress("default.seed").await.unwrap();
        if progress != Progress::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(progress, Progress::Complete);
}
