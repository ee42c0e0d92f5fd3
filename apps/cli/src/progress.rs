//! Progress bar utilities for CLI downloads

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rdm_types::{CoreEvent, TaskId, TaskRecord, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const KNOWN_SIZE_TEMPLATE: &str =
    "{spinner:.green} {msg:20} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const UNKNOWN_SIZE_TEMPLATE: &str =
    "{spinner:.green} {msg:20} [{elapsed_precise}] {bytes} ({bytes_per_sec})";

fn bar_style(known_size: bool) -> ProgressStyle {
    let template = if known_size {
        KNOWN_SIZE_TEMPLATE
    } else {
        UNKNOWN_SIZE_TEMPLATE
    };
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

/// Manages progress bars for multiple downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: Arc<RwLock<HashMap<TaskId, ProgressBar>>>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a progress bar for a download
    pub async fn add_download(&self, record: &TaskRecord) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(record.total_bytes.unwrap_or(0)));
        pb.set_style(bar_style(record.total_bytes.is_some()));
        pb.set_message(record.file_name.clone());
        pb.set_position(record.bytes_so_far);

        self.bars.write().await.insert(record.id, pb.clone());
        pb
    }

    /// Update a progress bar from an event
    pub async fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::Progress {
                id,
                bytes_so_far,
                total_bytes,
            } => {
                let bars = self.bars.read().await;
                if let Some(pb) = bars.get(id) {
                    match total_bytes {
                        Some(total) if pb.length() != Some(*total) => {
                            pb.set_style(bar_style(true));
                            pb.set_length(*total);
                        }
                        None if pb.length() != Some(0) => {
                            pb.set_style(bar_style(false));
                            pb.set_length(0);
                        }
                        _ => {}
                    }
                    pb.set_position(*bytes_so_far);
                }
            }

            CoreEvent::StatusChanged { id, status } => {
                let bars = self.bars.read().await;
                if let Some(pb) = bars.get(id) {
                    match status {
                        TaskStatus::Success => {
                            pb.finish_with_message(format!(
                                "{} Download complete",
                                style("✓").green().bold()
                            ));
                        }
                        TaskStatus::Paused => {
                            pb.abandon_with_message(format!("{} Paused", style("⏸").yellow()));
                        }
                        TaskStatus::Canceled => {
                            pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
                        }
                        s if s.is_waiting() => {
                            pb.abandon_with_message(format!("{} {}", style("…").yellow(), s));
                        }
                        s if s.is_error() => {
                            pb.abandon_with_message(format!(
                                "{} Failed: {}",
                                style("✗").red().bold(),
                                s
                            ));
                        }
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub async fn clear(&self) {
        for (_, pb) in self.bars.write().await.drain() {
            if !pb.is_finished() {
                pb.abandon();
            }
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
