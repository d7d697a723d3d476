//! Session persistence scenarios: save, restore, and on-disk reconciliation.

#![allow(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use raad::{
    DownloadManager, DownloadRequest, ManagerConfig, ManagerHandle, NoopPlatform, StaticPower,
    TaskOptions,
};

fn test_config(temp: &TempDir) -> ManagerConfig {
    ManagerConfig {
        session_path: Some(temp.path().join("state").join("downloads.json")),
        download_dir: temp.path().join("downloads"),
        auto_retry_max: 0,
        scheduler_interval: Duration::from_millis(200),
        power_poll_interval: Duration::from_millis(200),
        ..ManagerConfig::default()
    }
}

fn spawn(config: ManagerConfig) -> ManagerHandle {
    let (handle, manager, _notices) = DownloadManager::new(
        config,
        Arc::new(StaticPower::new(false)),
        Arc::new(NoopPlatform),
    );
    tokio::spawn(manager.run());
    // The notice stream is dropped; sends are best-effort by design.
    handle
}

#[tokio::test]
async fn test_session_save_then_restore_reproduces_fields() {
    let temp = TempDir::new().unwrap();
    let session_path = temp.path().join("state").join("downloads.json");

    // First life: configure and enqueue a paused download, then shut down.
    {
        let handle = spawn(test_config(&temp));
        handle.create_queue("Media");
        handle.set_queue_max_speed("Media", 500_000);
        handle.set_queue_schedule("Media", true, 22 * 60, 6 * 60);
        handle.set_domain_rule("cdn.example.com", "Media");
        handle.set_category_folder("Video", temp.path().join("video").display().to_string());
        handle.set_max_concurrent(7);
        handle.set_global_max_speed(123_456);

        let id = handle
            .add_download(DownloadRequest {
                url: "https://cdn.example.com/show.mp4".to_string(),
                file_path: Some(temp.path().join("downloads").join("show.mp4")),
                start_paused: true,
                options: TaskOptions {
                    mirrors: vec![
                        "https://cdn.example.com/show.mp4".to_string(),
                        "https://backup.example.com/show.mp4".to_string(),
                    ],
                    checksum_expected: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
                    headers: vec!["X-Token: abc".to_string()],
                    cookie_header: Some("session=1".to_string()),
                    retry_max: Some(5),
                    retry_delay_sec: Some(30),
                    post_reveal_folder: Some(true),
                    segments: Some(4),
                    ..TaskOptions::default()
                },
                ..DownloadRequest::default()
            })
            .await
            .unwrap();

        let info = handle.task_info(id).await.unwrap();
        assert_eq!(info.state, "Paused");
        // Domain rule routed the task even though no queue was named.
        assert_eq!(info.queue_name, "Media");
        assert_eq!(info.category, "Video");

        handle.shutdown().await;
    }

    let raw = std::fs::read_to_string(&session_path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["version"], 4);
    assert_eq!(json["maxConcurrent"], 7);
    assert_eq!(json["globalMaxSpeed"], 123_456);
    assert_eq!(json["domainRules"]["cdn.example.com"], "Media");
    let queue = json["queues"]
        .as_array()
        .unwrap()
        .iter()
        .find(|q| q["name"] == "Media")
        .unwrap();
    assert_eq!(queue["maxSpeed"], 500_000);
    assert_eq!(queue["scheduleEnabled"], true);
    assert_eq!(queue["startMinutes"], 22 * 60);
    let item = &json["items"][0];
    assert_eq!(item["state"], "Paused");
    assert_eq!(item["segments"], 4);
    assert_eq!(item["retryMax"], 5);
    assert_eq!(item["mirrors"].as_array().unwrap().len(), 2);
    assert_eq!(item["checksumState"], "Pending");

    // Second life: everything comes back, still paused, nothing started.
    {
        let handle = spawn(test_config(&temp));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let rows = handle.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "Paused");
        assert_eq!(rows[0].queue_name, "Media");
        assert_eq!(rows[0].category, "Video");

        let queues = handle.queue_names().await;
        assert!(queues.contains(&"General".to_string()));
        assert!(queues.contains(&"Media".to_string()));

        let counts = handle.counts().await;
        assert_eq!(counts.active, 0, "restore must not start paused tasks");

        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_restore_recomputes_bytes_from_disk() {
    let temp = TempDir::new().unwrap();
    let session_path = temp.path().join("state").join("downloads.json");
    let target = temp.path().join("downloads").join("data.bin");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(format!("{}.part0", target.display()), vec![0u8; 700]).unwrap();
    std::fs::write(format!("{}.part1", target.display()), vec![0u8; 300]).unwrap();

    // A hand-written session with no persisted byte count.
    let session = serde_json::json!({
        "version": 4,
        "queues": [],
        "items": [{
            "url": "https://example.com/data.bin",
            "filePath": target.display().to_string(),
            "segments": 2,
            "state": "Paused",
            "bytesTotal": 2000
        }]
    });
    std::fs::create_dir_all(session_path.parent().unwrap()).unwrap();
    std::fs::write(&session_path, serde_json::to_string_pretty(&session).unwrap()).unwrap();

    let handle = spawn(test_config(&temp));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let rows = handle.snapshot().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "Paused");
    assert_eq!(rows[0].received, 1000, "byte count must come from the part files");
    assert_eq!(rows[0].total, 2000);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_restore_seeds_terminal_states_without_starting() {
    let temp = TempDir::new().unwrap();
    let session_path = temp.path().join("state").join("downloads.json");
    let session = serde_json::json!({
        "version": 4,
        "items": [
            { "url": "https://example.com/a.bin", "filePath": "/tmp/raad-none/a.bin", "state": "Done" },
            { "url": "https://example.com/b.bin", "filePath": "/tmp/raad-none/b.bin", "state": "Error" },
            { "url": "https://example.com/c.bin", "filePath": "/tmp/raad-none/c.bin", "state": "Canceled" }
        ]
    });
    std::fs::create_dir_all(session_path.parent().unwrap()).unwrap();
    std::fs::write(&session_path, serde_json::to_string(&session).unwrap()).unwrap();

    let handle = spawn(test_config(&temp));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let rows = handle.snapshot().await;
    assert_eq!(rows.len(), 3);
    let statuses: Vec<&str> = rows.iter().map(|r| r.status.as_str()).collect();
    assert!(statuses.contains(&"Done"));
    assert!(statuses.contains(&"Error"));
    assert!(statuses.contains(&"Canceled"));
    assert!(rows.iter().all(|r| r.finished), "terminal rows are marked finished");

    let counts = handle.counts().await;
    assert_eq!(counts.active, 0);
    assert_eq!(counts.queued, 0);
    assert_eq!(counts.completed, 3);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_restored_guid_name_takes_url_filename() {
    let temp = TempDir::new().unwrap();
    let session_path = temp.path().join("state").join("downloads.json");
    let downloads = temp.path().join("downloads");
    std::fs::create_dir_all(&downloads).unwrap();

    let guid_path = downloads.join("6f9619ff-8b86-d011-b42d-00cf4fc964ff");
    std::fs::write(format!("{}.part0", guid_path.display()), vec![1u8; 64]).unwrap();

    let session = serde_json::json!({
        "version": 4,
        "items": [{
            "url": "https://example.com/files/movie.mp4",
            "filePath": guid_path.display().to_string(),
            "segments": 2,
            "state": "Paused"
        }]
    });
    std::fs::create_dir_all(session_path.parent().unwrap()).unwrap();
    std::fs::write(&session_path, serde_json::to_string(&session).unwrap()).unwrap();

    let handle = spawn(test_config(&temp));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let rows = handle.snapshot().await;
    assert_eq!(rows.len(), 1);
    assert!(
        rows[0].file_name.ends_with("movie.mp4"),
        "GUID name must be replaced: {}",
        rows[0].file_name
    );
    let renamed_part: PathBuf = downloads.join("movie.mp4.part0");
    assert!(renamed_part.exists(), "part files must be renamed with the task");

    handle.shutdown().await;
}
