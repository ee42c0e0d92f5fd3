//! CLI command implementations

use crate::output::{
    format_bytes, format_progress, format_transferred, print_json, status_icon, truncate,
};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use rdm_core::{RdmCore, RunReport, Storage, DISPATCH_FAILED};
use rdm_types::{CoreEvent, NewTask, Settings, TaskId, TaskRecord, TaskStatus};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

// ============================================================================
// Download Commands
// ============================================================================

pub struct AddRequest {
    pub url: String,
    pub output: Option<PathBuf>,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub headers: Vec<String>,
    pub user_agent: Option<String>,
}

/// Last non-empty path segment of `url`, or `download`
fn file_name_from_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string)
        .unwrap_or_else(|| "download".to_string())
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Header must look like 'Name: value', got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Header name is empty in '{}'", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub async fn add_download(
    core: &RdmCore,
    request: AddRequest,
    start_now: bool,
    format: OutputFormat,
) -> Result<()> {
    let url = url::Url::parse(&request.url).context("Invalid URL")?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("Only http and https URLs are supported");
    }

    let save_path = request
        .output
        .unwrap_or_else(|| core.settings().default_save_path.clone());
    tokio::fs::create_dir_all(&save_path)
        .await
        .with_context(|| format!("Cannot create {}", save_path.display()))?;

    let file_name = request.name.unwrap_or_else(|| file_name_from_url(&url));

    let mut task = NewTask::new(url.as_str(), file_name, save_path);
    task.mime_type = request.mime_type;
    task.user_agent = request.user_agent;
    for raw in &request.headers {
        let (name, value) = parse_header(raw)?;
        task = task.with_header(name, value);
    }

    let id = core.create_task_with(task).await;
    if id == DISPATCH_FAILED {
        bail!("Failed to add download");
    }
    let record = core
        .get_task(id)
        .await
        .ok_or_else(|| anyhow!("Download {} vanished after creation", id))?;

    match format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Added download: {}",
                style("✓").green().bold(),
                style(&record.file_name).cyan()
            );
            println!("  ID: {}", record.id);
            println!("  Saving to: {}", record.destination_path.display());
        }
    }

    if start_now {
        start_downloads(core, &[id], format).await?;
    }

    Ok(())
}

pub async fn list_downloads(
    core: &RdmCore,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let records = core.list_tasks().await;

    let filtered: Vec<_> = records
        .into_iter()
        .filter(|r| match &status_filter {
            Some(status) => r
                .status
                .to_string()
                .contains(&status.to_lowercase()),
            None => true,
        })
        .collect();

    match format {
        OutputFormat::Json => print_json(&filtered)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DownloadRow {
                id: TaskId,
                file: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<DownloadRow> = filtered
                .iter()
                .map(|r| DownloadRow {
                    id: r.id,
                    file: truncate(&r.file_name, 30),
                    size: r
                        .total_bytes
                        .map(format_bytes)
                        .unwrap_or_else(|| "?".to_string()),
                    progress: format_progress(r),
                    status: r.status.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for record in &filtered {
                print_download_summary(record, show_all);
            }
            println!();
            println!("{} download(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

fn print_download_summary(record: &TaskRecord, detailed: bool) {
    println!(
        "{} {} {} {} [{}]",
        status_icon(record.status),
        style(record.id).dim(),
        style(&record.file_name).bold(),
        style(format_progress(record)).dim(),
        style(record.status).dim()
    );

    if detailed {
        println!("    URL: {}", record.source_uri);
        println!("    File: {}", record.destination_path.display());
        println!("    Transferred: {}", format_transferred(record));
        if let Some(mime_type) = &record.mime_type {
            println!("    Type: {}", mime_type);
        }
        println!(
            "    Resumable: {}",
            if record.resumption_tag.is_some() {
                style("Yes").green()
            } else {
                style("No").yellow()
            }
        );
        if record.failure_count > 0 {
            println!("    Failures: {}", style(record.failure_count).red());
        }
        println!(
            "    Last modified: {}",
            record.last_modified.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
    }
}

pub async fn show_info(core: &RdmCore, id: TaskId, format: OutputFormat) -> Result<()> {
    let record = core
        .get_task(id)
        .await
        .ok_or_else(|| anyhow!("Download {} not found", id))?;

    match format {
        OutputFormat::Json => print_json(&record)?,
        _ => print_download_summary(&record, true),
    }

    Ok(())
}

/// Run the given downloads in the foreground. Ctrl-C pauses them.
pub async fn start_downloads(core: &RdmCore, ids: &[TaskId], format: OutputFormat) -> Result<()> {
    let mut records = Vec::new();
    for &id in ids {
        let record = core
            .get_task(id)
            .await
            .ok_or_else(|| anyhow!("Download {} not found", id))?;
        // A complete file would be asked for a range past its end
        if record.status == TaskStatus::Success {
            println!(
                "{} {} is already complete",
                style("✓").green(),
                style(&record.file_name).cyan()
            );
            continue;
        }
        records.push(record);
    }

    if records.is_empty() {
        return Ok(());
    }

    let show_bars = !matches!(format, OutputFormat::Json);
    let progress = Arc::new(DownloadProgress::new());
    if show_bars {
        for record in &records {
            progress.add_download(record).await;
        }
    }

    let mut events = core.subscribe();
    let pump = {
        let progress = progress.clone();
        let mut running: HashSet<TaskId> = records.iter().map(|r| r.id).collect();
        tokio::spawn(async move {
            while !running.is_empty() {
                match events.recv().await {
                    Ok(event) => {
                        if let CoreEvent::StatusChanged { id, status } = &event {
                            if status.ends_run() {
                                running.remove(id);
                            }
                        }
                        progress.handle_event(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => debug!("Progress display skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let mut started = Vec::new();
    for record in &records {
        if core.start_task(record.id).await == DISPATCH_FAILED {
            eprintln!(
                "{} Could not start download {}",
                style("✗").red().bold(),
                record.id
            );
        } else {
            started.push(record.id);
        }
    }

    let waits = futures::future::join_all(started.iter().map(|&id| core.wait_task(id)));
    tokio::pin!(waits);

    let reports = tokio::select! {
        reports = &mut waits => reports,
        _ = tokio::signal::ctrl_c() => {
            for &id in &started {
                core.pause_task(id).await;
            }
            waits.await
        }
    };

    // Let the bars render their final state
    if tokio::time::timeout(Duration::from_secs(1), pump).await.is_err() {
        debug!("Progress display did not see every final status");
    }
    progress.clear().await;

    let reports: Vec<RunReport> = reports.into_iter().flatten().collect();
    match format {
        OutputFormat::Json => {
            let mut finished = Vec::new();
            for report in &reports {
                if let Some(record) = core.get_task(report.id).await {
                    finished.push(record);
                }
            }
            print_json(&finished)?;
        }
        OutputFormat::Human | OutputFormat::Table => {
            for report in &reports {
                print_report(core, report).await;
            }
        }
    }

    let complete = reports.iter().filter(|r| r.status.is_success()).count();
    if complete < records.len() {
        bail!(
            "{} of {} download(s) did not complete",
            records.len() - complete,
            records.len()
        );
    }
    Ok(())
}

async fn print_report(core: &RdmCore, report: &RunReport) {
    let name = core
        .get_task(report.id)
        .await
        .map(|r| r.file_name)
        .unwrap_or_else(|| report.id.to_string());

    let mut line = format!("{} {}: {}", status_icon(report.status), style(name).bold(), report.status);
    if let Some(delay) = report.retry_after {
        line.push_str(&format!(" (server asks to retry in {}s)", delay.as_secs()));
    }
    if report.status == TaskStatus::Paused || report.status.is_waiting() {
        line.push_str(&format!(", run `rdm start {}` to resume", report.id));
    }
    println!("{}", line);
}

pub async fn delete_download(
    core: &RdmCore,
    id: TaskId,
    with_file: bool,
    _format: OutputFormat,
) -> Result<()> {
    if core.remove_task(id, with_file).await == DISPATCH_FAILED {
        bail!("Download {} not found", id);
    }
    println!("{} Download deleted", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

fn settings_map(settings: &Settings) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(settings)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(anyhow!("Settings did not serialize to an object")),
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub async fn config_action(
    storage: &Storage,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = storage.load_settings().await?;

            match format {
                OutputFormat::Json => print_json(&settings)?,
                _ => {
                    println!("RDM Configuration ({}):", storage.data_dir().display());
                    println!();
                    for (key, value) in settings_map(&settings)? {
                        println!("  {}: {}", key, display_value(&value));
                    }
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = storage.load_settings().await?;
            let map = settings_map(&settings)?;
            let value = map
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            println!("{}", display_value(value));
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = storage.load_settings().await?;
            let mut map = settings_map(&settings)?;
            if !map.contains_key(&key) {
                bail!("Unknown config key: {}", key);
            }

            // Numbers and booleans parse as JSON, anything else is a string
            let parsed = serde_json::from_str(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            map.insert(key.clone(), parsed);

            let updated: Settings = serde_json::from_value(serde_json::Value::Object(map))
                .with_context(|| format!("Invalid value for {}: {}", key, value))?;
            storage.save_settings(&updated.validated()).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                storage.save_settings(&Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
