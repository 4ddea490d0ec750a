use crate::server::store::{ChatStore, StoreStats};
use crate::server::websocket::ChatWebSocketManager;
use chrono::Utc;
use log::{error, info, warn};
use std::{fs::OpenOptions, io::Write, sync::Arc, time::Duration};
use sysinfo::System;
use tokio::time;

pub const HEADER: &str = "# Timestamp, Connections, Conversations, Active_Conversations, Messages, Unread_Backlog, CPU_Usage";

pub fn format_line(timestamp: &str, connections: usize, stats: &StoreStats, cpu_usage: f32) -> String {
    format!(
        "{}, {}, {}, {}, {}, {}, {:.1}%",
        timestamp,
        connections,
        stats.conversations,
        stats.active_conversations,
        stats.messages,
        stats.unread_backlog,
        cpu_usage
    )
}

fn average_cpu(system: &System) -> f32 {
    let cpus = system.cpus();
    if cpus.is_empty() {
        return 0.0;
    }
    cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
}

/// Appends a stats line every `interval` until the task is dropped.
pub async fn start_stats_logger(
    store: Arc<dyn ChatStore>,
    connections: Arc<ChatWebSocketManager>,
    log_path: &str,
    interval: Duration,
) {
    if let Some(parent) = std::path::Path::new(log_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Unable to create stats log directory '{}': {}", parent.display(), e);
            }
        }
    }

    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("Unable to open stats log file '{}': {}", log_path, e);
            return;
        }
    };

    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        if let Err(e) = writeln!(file, "# Marketchat Server Stats Log").and_then(|_| writeln!(file, "{}", HEADER)) {
            error!("Failed to write header to stats log: {}", e);
            return;
        }
        info!("📊 Stats log initialized: {}", log_path);
    }

    let mut system = System::new_all();
    let mut ticker = time::interval(interval);
    loop {
        ticker.tick().await;
        system.refresh_cpu();

        let stats = match store.stats().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to query store stats: {}", e);
                StoreStats {
                    conversations: -1,
                    active_conversations: -1,
                    messages: -1,
                    unread_backlog: -1,
                }
            }
        };
        let open = connections.connection_count().await;
        let cpu = average_cpu(&system);
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

        info!(
            "📊 Stats - Connections: {}, Conversations: {} ({} active), Messages: {}, Unread: {}, CPU: {:.1}%",
            open, stats.conversations, stats.active_conversations, stats.messages, stats.unread_backlog, cpu
        );

        if let Err(e) = writeln!(file, "{}", format_line(&timestamp, open, &stats, cpu)) {
            error!("Failed to write to stats log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("Failed to flush stats log: {}", e);
        }
    }
}
