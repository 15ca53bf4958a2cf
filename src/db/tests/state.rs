use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_shutdown_state_initial() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    // Nothing recorded yet counts as unclean
    assert!(db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_clean_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.set_clean_start().await.unwrap();
    assert!(
        db.was_unclean_shutdown().await.unwrap(),
        "After clean start, should still indicate unclean (not yet shut down)"
    );

    db.set_clean_shutdown().await.unwrap();
    assert!(!db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_unclean_detection() {
    let temp_file = NamedTempFile::new().unwrap();

    // First session: start but never shut down (simulated crash)
    {
        let db = Database::new(temp_file.path()).await.unwrap();
        db.set_clean_start().await.unwrap();
        db.close().await;
    }

    // Second session: detect it, then shut down properly
    {
        let db = Database::new(temp_file.path()).await.unwrap();
        assert!(db.was_unclean_shutdown().await.unwrap());
        db.set_clean_start().await.unwrap();
        db.set_clean_shutdown().await.unwrap();
        db.close().await;
    }

    {
        let db = Database::new(temp_file.path()).await.unwrap();
        assert!(!db.was_unclean_shutdown().await.unwrap());
        db.close().await;
    }
}

#[tokio::test]
async fn test_disk_budget_round_trip() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    assert!(db.load_disk_budget().await.unwrap().is_none());

    let budget = DiskBudget {
        ceiling_bytes: Some(50 * 1024 * 1024),
        margin_bytes: 5 * 1024 * 1024,
        resident_bytes: 20 * 1024 * 1024,
        reservations: vec![crate::types::Reservation {
            unit_id: UnitId::from("u1"),
            bytes: 20 * 1024 * 1024,
        }],
    };
    db.save_disk_budget(&budget).await.unwrap();
    assert_eq!(db.load_disk_budget().await.unwrap(), Some(budget.clone()));

    // Single slot: saving again replaces
    let emptied = DiskBudget {
        resident_bytes: 0,
        reservations: vec![],
        ..budget
    };
    db.save_disk_budget(&emptied).await.unwrap();
    assert_eq!(db.load_disk_budget().await.unwrap(), Some(emptied));

    db.close().await;
}

#[tokio::test]
async fn test_export_snapshot_serializes_everything() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.insert_discovered_unit(&super::listed("u1", 1024))
        .await
        .unwrap();
    let file = FileRecord::extracted(UnitId::from("u1"), "Trip/a.jpg".into(), 10, "Trip".into());
    db.insert_file_if_absent(&file).await.unwrap();
    db.set_checkpoint(&Checkpoint::new(Stage::Unpack, UnitId::from("u1"), None))
        .await
        .unwrap();

    let snapshot = db.export_snapshot().await.unwrap();
    assert_eq!(snapshot.units.len(), 1);
    assert_eq!(snapshot.files.len(), 1);
    assert!(snapshot.checkpoint.is_some());

    let json: serde_json::Value =
        serde_json::from_str(&snapshot.to_json_pretty().unwrap()).unwrap();
    assert_eq!(json["units"][0]["state"], "pending");
    assert_eq!(json["files"][0]["path"], "Trip/a.jpg");
    assert_eq!(json["checkpoint"]["stage"], "unpack");

    db.close().await;
}
