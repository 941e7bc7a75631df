use crate::{models::DiagnosticsResponse, AppState};
use axum::{extract::State, Json};
use chrono::Utc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Session and host statistics
pub async fn diagnostics(State(state): State<AppState>) -> Json<DiagnosticsResponse> {
    let stats = state.sessions.stats().await;

    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Sessions: {}, Conn: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.sessions,
        stats.members
    );

    Json(DiagnosticsResponse {
        n_sessions: stats.sessions as u32,
        n_conn: stats.members as u32,
        n_active_writers: stats.active_writers as u32,
        n_dirty_sessions: stats.dirty as u32,
        durable_storage: state.sessions.is_durable(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        cpu_usage,
        memory_alloc,
        memory_total,
        memory_free,
    })
}
