//! CLI entry point for the raad download engine.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raad::{
    DownloadManager, DownloadRequest, ManagerConfig, ManagerHandle, Notice, Severity,
    SystemPlatform, SystemPower, TaskOptions,
};

mod cli;

use cli::{AddArgs, Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(failed) if failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(error) => {
            eprintln!("{error}");
            ExitCode::from(2)
        }
    }
}

/// Runs the selected command; returns the number of failed downloads.
async fn run(cli: Cli) -> Result<usize> {
    let (handle, manager, notices) =
        DownloadManager::new(ManagerConfig::default(), Arc::new(SystemPower), Arc::new(SystemPlatform));
    let manager_task = tokio::spawn(manager.run());
    tokio::spawn(forward_notices(notices));

    let failed = match cli.command {
        Command::Add(args) => {
            configure(&handle, &args);
            enqueue(&handle, args).await?;
            wait_until_settled(&handle).await
        }
        Command::Import(args) => {
            handle.import_list(args.path);
            wait_until_settled(&handle).await
        }
        Command::Export(args) => {
            // Give the restored session a moment to settle before exporting.
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.export_list(args.path);
            0
        }
        Command::List => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            for row in handle.snapshot().await {
                println!(
                    "{:<10} {:>12}/{:<12} {:<10} {:<10} {}",
                    row.status, row.received, row.total, row.queue_name, row.category, row.file_name
                );
            }
            0
        }
    };

    handle.shutdown().await;
    let _ = manager_task.await;
    Ok(failed)
}

fn configure(handle: &ManagerHandle, args: &AddArgs) {
    if let Some(max_speed) = args.max_speed {
        handle.set_global_max_speed(max_speed);
    }
    if let Some(max_concurrent) = args.max_concurrent {
        handle.set_max_concurrent(max_concurrent);
    }
}

async fn enqueue(handle: &ManagerHandle, args: AddArgs) -> Result<()> {
    for url in &args.urls {
        let request = DownloadRequest {
            url: url.clone(),
            // Directories are resolved to a URL-derived filename by the manager.
            file_path: args.output.clone(),
            queue: args.queue.clone(),
            category: args.category.clone(),
            start_paused: args.paused,
            options: TaskOptions {
                mirrors: args.mirrors.clone(),
                checksum_expected: args.checksum.clone(),
                segments: args.segments,
                ..TaskOptions::default()
            },
        };
        if handle.add_download(request).await.is_none() {
            anyhow::bail!("invalid URL: {url}");
        }
    }
    Ok(())
}

/// Polls until no task is Active or Queued; returns the Error-state count.
async fn wait_until_settled(handle: &ManagerHandle) -> usize {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let rows = handle.snapshot().await;
        if rows
            .iter()
            .all(|row| !matches!(row.status.as_str(), "Active" | "Queued"))
        {
            let failed = rows.iter().filter(|row| row.status == "Error").count();
            info!(total = rows.len(), failed, "all downloads settled");
            return failed;
        }
    }
}

async fn forward_notices(mut notices: tokio::sync::mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        match notice.severity {
            Severity::Danger => tracing::error!("{}", notice.text),
            Severity::Warning => tracing::warn!("{}", notice.text),
            Severity::Info | Severity::Success | Severity::Muted => {
                tracing::info!("{}", notice.text);
            }
        }
    }
}
