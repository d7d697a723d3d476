//! End-to-end engine scenarios against a mock HTTP origin.

#![allow(clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use raad::{
    DownloadManager, DownloadRequest, ManagerConfig, ManagerHandle, NoopPlatform, Notice,
    StaticPower, TaskId, TaskInfo, TaskOptions,
};

const MIB: usize = 1024 * 1024;

/// Serves byte ranges of a fixed body: 206 with the requested slice, 200
/// with the whole body when no Range header is present.
struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some(range) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range)
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };
        let (start, end) = range;
        let end = end.unwrap_or(self.body.len() as u64 - 1);
        if start >= self.body.len() as u64 || end >= self.body.len() as u64 || start > end {
            return ResponseTemplate::new(416);
        }
        #[allow(clippy::cast_possible_truncation)]
        let slice = self.body[start as usize..=end as usize].to_vec();
        ResponseTemplate::new(206)
            .insert_header(
                "Content-Range",
                format!("bytes {start}-{end}/{}", self.body.len()).as_str(),
            )
            .set_body_bytes(slice)
    }
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let ranges = value.strip_prefix("bytes=")?;
    let (start, end) = ranges.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() { None } else { Some(end.parse().ok()?) };
    Some((start, end))
}

/// A deterministic, non-repeating body.
fn patterned_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Harness {
    handle: ManagerHandle,
    power: StaticPower,
    _notices: UnboundedReceiver<Notice>,
    temp: TempDir,
}

impl Harness {
    fn download_path(&self, name: &str) -> PathBuf {
        self.temp.path().join("downloads").join(name)
    }
}

async fn spawn_manager(configure: impl FnOnce(&mut ManagerConfig)) -> Harness {
    let temp = TempDir::new().unwrap();
    let mut config = ManagerConfig {
        session_path: Some(temp.path().join("state").join("downloads.json")),
        download_dir: temp.path().join("downloads"),
        auto_retry_max: 0,
        auto_retry_delay_secs: 0,
        scheduler_interval: Duration::from_millis(100),
        power_poll_interval: Duration::from_millis(100),
        ..ManagerConfig::default()
    };
    configure(&mut config);

    let power = StaticPower::new(false);
    let (handle, manager, notices) = DownloadManager::new(
        config,
        Arc::new(power.clone()),
        Arc::new(NoopPlatform),
    );
    tokio::spawn(manager.run());
    Harness {
        handle,
        power,
        _notices: notices,
        temp,
    }
}

async fn wait_for_state(
    handle: &ManagerHandle,
    id: TaskId,
    state: &str,
    timeout: Duration,
) -> TaskInfo {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let info = handle.task_info(id).await;
        if let Some(info) = &info {
            if info.state == state {
                return info.clone();
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {state}; last: {info:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn assert_no_part_files(file_path: &Path, segments: u32) {
    for i in 0..segments {
        let part = PathBuf::from(format!("{}.part{i}", file_path.display()));
        assert!(!part.exists(), "leftover part file: {}", part.display());
    }
    let single = PathBuf::from(format!("{}.part", file_path.display()));
    assert!(!single.exists(), "leftover temp file: {}", single.display());
}

#[tokio::test]
async fn test_small_file_without_ranges_downloads_single_stream() {
    let server = MockServer::start().await;
    let body = patterned_body(100_000);
    // No Accept-Ranges header: the engine must not segment.
    Mock::given(path("/out.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let harness = spawn_manager(|_| {}).await;
    let target = harness.download_path("out.bin");
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/out.bin", server.uri()),
            file_path: Some(target.clone()),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    let info = wait_for_state(&harness.handle, id, "Done", Duration::from_secs(10)).await;
    assert_eq!(info.received, 100_000);
    assert_eq!(std::fs::read(&target).unwrap(), body);
    assert_no_part_files(&target, 8);
}

#[tokio::test]
async fn test_segmented_download_merges_in_order() {
    let server = MockServer::start().await;
    let body = patterned_body(4 * MIB);
    Mock::given(method("HEAD"))
        .and(path("/big.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .insert_header("ETag", "\"v1\"")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/big.bin"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;

    let harness = spawn_manager(|_| {}).await;
    let target = harness.download_path("big.bin");
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/big.bin", server.uri()),
            file_path: Some(target.clone()),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    let info = wait_for_state(&harness.handle, id, "Done", Duration::from_secs(30)).await;
    assert_eq!(info.total, (4 * MIB) as u64);
    let merged = std::fs::read(&target).unwrap();
    assert_eq!(merged.len(), body.len());
    assert_eq!(merged, body, "merged bytes must equal the origin body");
    assert_no_part_files(&target, 8);
}

#[tokio::test]
async fn test_pause_then_resume_completes_from_disk_state() {
    let server = MockServer::start().await;
    let body = patterned_body(4 * MIB);
    Mock::given(method("HEAD"))
        .and(path("/resume.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .insert_header("ETag", "\"v1\"")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/resume.bin"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;

    // Cap the speed so the transfer is still in flight when we pause.
    let harness = spawn_manager(|config| config.global_max_speed = 512 * 1024).await;
    let target = harness.download_path("resume.bin");
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/resume.bin", server.uri()),
            file_path: Some(target.clone()),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    wait_for_state(&harness.handle, id, "Active", Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    harness.handle.pause_task(id);
    let paused = wait_for_state(&harness.handle, id, "Paused", Duration::from_secs(10)).await;
    assert!(paused.received > 0, "some bytes must have landed before pause");

    // Partial segment files survive the pause.
    let on_disk: u64 = (0..2)
        .filter_map(|i| {
            std::fs::metadata(format!("{}.part{i}", target.display()))
                .ok()
                .map(|m| m.len())
        })
        .sum();
    assert!(on_disk > 0, "pause must leave partial part files");
    assert!(on_disk < (4 * MIB) as u64);

    // Full speed for the rest of the transfer.
    harness.handle.set_global_max_speed(0);
    harness.handle.resume_task(id);
    let done = wait_for_state(&harness.handle, id, "Done", Duration::from_secs(30)).await;
    assert_eq!(done.received, (4 * MIB) as u64, "no duplicated bytes after resume");
    assert_eq!(std::fs::read(&target).unwrap(), body);
    assert_no_part_files(&target, 8);
}

#[tokio::test]
async fn test_range_ignored_falls_back_to_single_stream() {
    let server = MockServer::start().await;
    let body = patterned_body(4 * MIB);
    // HEAD advertises ranges, but every GET returns 200 with the whole body.
    Mock::given(method("HEAD"))
        .and(path("/liar.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/liar.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let harness = spawn_manager(|_| {}).await;
    let target = harness.download_path("liar.bin");
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/liar.bin", server.uri()),
            file_path: Some(target.clone()),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    let info = wait_for_state(&harness.handle, id, "Done", Duration::from_secs(30)).await;
    assert_eq!(info.resume_warning, "Range ignored; switched to single stream");
    assert_eq!(std::fs::read(&target).unwrap(), body);
    assert_no_part_files(&target, 8);
}

#[tokio::test]
async fn test_resume_rejected_restarts_from_zero() {
    let server = MockServer::start().await;
    let body = patterned_body(200_000);
    Mock::given(method("HEAD"))
        .and(path("/strict.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;
    // Ranged GETs are rejected outright; plain GETs serve the file.
    Mock::given(method("GET"))
        .and(path("/strict.bin"))
        .and(header("Range", "bytes=1000-"))
        .respond_with(ResponseTemplate::new(416))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/strict.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .with_priority(5)
        .mount(&server)
        .await;

    let harness = spawn_manager(|_| {}).await;
    let target = harness.download_path("strict.bin");
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/strict.bin", server.uri()),
            file_path: Some(target.clone()),
            start_paused: true,
            options: TaskOptions {
                segments: Some(1),
                ..TaskOptions::default()
            },
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    // Fake a stale partial from an earlier run, then resume onto it.
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(format!("{}.part", target.display()), vec![0xAA; 1000]).unwrap();
    harness.handle.resume_task(id);

    let info = wait_for_state(&harness.handle, id, "Done", Duration::from_secs(10)).await;
    assert_eq!(info.resume_warning, "Resume rejected; restarting");
    assert_eq!(std::fs::read(&target).unwrap(), body);
    assert_no_part_files(&target, 1);
}

#[tokio::test]
async fn test_mirror_failover_switches_to_next_url() {
    let broken = MockServer::start().await;
    Mock::given(path("/file.bin"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;

    let healthy = MockServer::start().await;
    let body = patterned_body(50_000);
    Mock::given(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&healthy)
        .await;

    let harness = spawn_manager(|_| {}).await;
    let target = harness.download_path("file.bin");
    let primary = format!("{}/file.bin", broken.uri());
    let mirror = format!("{}/file.bin", healthy.uri());
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: primary.clone(),
            file_path: Some(target.clone()),
            options: TaskOptions {
                mirrors: vec![primary, mirror.clone()],
                ..TaskOptions::default()
            },
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    let info = wait_for_state(&harness.handle, id, "Done", Duration::from_secs(15)).await;
    assert_eq!(info.mirror_index, 1, "second mirror must be active");
    assert_eq!(info.url, mirror);
    assert_eq!(std::fs::read(&target).unwrap(), body);
}

#[tokio::test]
async fn test_battery_policy_pauses_and_resumes() {
    let server = MockServer::start().await;
    let body = patterned_body(2 * MIB);
    Mock::given(path("/slow.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let harness = spawn_manager(|config| {
        config.pause_on_battery = true;
        config.resume_on_ac = true;
        // Slow enough to stay in flight for the whole test.
        config.global_max_speed = 64 * 1024;
    })
    .await;
    let target = harness.download_path("slow.bin");
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/slow.bin", server.uri()),
            file_path: Some(target),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    wait_for_state(&harness.handle, id, "Active", Duration::from_secs(10)).await;

    harness.power.set_on_battery(true);
    let paused = wait_for_state(&harness.handle, id, "Paused", Duration::from_secs(10)).await;
    assert_eq!(paused.pause_reason, "Battery");

    harness.power.set_on_battery(false);
    wait_for_state(&harness.handle, id, "Active", Duration::from_secs(10)).await;
}

#[tokio::test]
async fn test_quota_pauses_and_lifting_it_resumes() {
    let server = MockServer::start().await;
    let body = patterned_body(2 * MIB);
    Mock::given(path("/quota.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let harness = spawn_manager(|config| config.global_max_speed = 256 * 1024).await;
    harness.handle.set_queue_quota("General", true, 128 * 1024);

    let target = harness.download_path("quota.bin");
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/quota.bin", server.uri()),
            file_path: Some(target),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    let paused = wait_for_state(&harness.handle, id, "Paused", Duration::from_secs(15)).await;
    assert_eq!(paused.pause_reason, "Quota");

    // Lifting the quota clears the pause reason on the next enforcement
    // pass, exactly like the midnight counter reset does.
    harness.handle.set_queue_quota("General", false, 0);
    wait_for_state(&harness.handle, id, "Active", Duration::from_secs(10)).await;
}

#[tokio::test]
async fn test_bulk_cancel_clears_parts_and_totals() {
    let server = MockServer::start().await;
    let body = patterned_body(MIB);
    Mock::given(path("/bulk.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let harness = spawn_manager(|config| {
        config.max_concurrent = 3;
        config.global_max_speed = 64 * 1024;
    })
    .await;

    let mut ids = Vec::new();
    let mut targets = Vec::new();
    for i in 0..3 {
        let target = harness.download_path(&format!("bulk-{i}.bin"));
        targets.push(target.clone());
        let id = harness
            .handle
            .add_download(DownloadRequest {
                url: format!("{}/bulk.bin", server.uri()),
                file_path: Some(target),
                ..DownloadRequest::default()
            })
            .await
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        wait_for_state(&harness.handle, *id, "Active", Duration::from_secs(10)).await;
    }

    harness.handle.cancel_all();
    for id in &ids {
        wait_for_state(&harness.handle, *id, "Canceled", Duration::from_secs(10)).await;
    }

    let totals = harness.handle.totals().await;
    assert_eq!(totals.received, 0);
    assert_eq!(totals.speed, 0);
    for target in &targets {
        assert_no_part_files(target, 8);
        assert!(!target.exists(), "canceled download must not leave a final file");
    }
}

#[tokio::test]
async fn test_domain_rule_routes_to_queue() {
    let server = MockServer::start().await;
    Mock::given(path("/routed.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(patterned_body(1000)))
        .mount(&server)
        .await;

    let harness = spawn_manager(|_| {}).await;
    harness.handle.create_queue("Nightly");
    // wiremock binds to the loopback address; rules are keyed by bare host.
    harness.handle.set_domain_rule("127.0.0.1", "Nightly");

    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/routed.bin", server.uri()),
            file_path: Some(harness.download_path("routed.bin")),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    let info = wait_for_state(&harness.handle, id, "Done", Duration::from_secs(10)).await;
    assert_eq!(info.queue_name, "Nightly");
}

#[tokio::test]
async fn test_checksum_verification_detects_mismatch() {
    let server = MockServer::start().await;
    Mock::given(path("/sum.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
        .mount(&server)
        .await;

    let harness = spawn_manager(|_| {}).await;
    let id = harness
        .handle
        .add_download(DownloadRequest {
            url: format!("{}/sum.bin", server.uri()),
            file_path: Some(harness.download_path("sum.bin")),
            options: TaskOptions {
                // sha256("abc"), so verification must pass.
                checksum_expected: Some(
                    "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_string(),
                ),
                ..TaskOptions::default()
            },
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    wait_for_state(&harness.handle, id, "Done", Duration::from_secs(10)).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let info = harness.handle.task_info(id).await.unwrap();
        if info.checksum_state == raad::ChecksumState::Ok {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "checksum never verified: {info:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
