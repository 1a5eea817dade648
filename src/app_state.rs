// =============================================================================
// Central Application State — market-data sync service
// =============================================================================
//
// Ties together the pieces the operational API reports on: the scheduler
// (job registry and manual triggers) and the live trade stream counters.
// Subsystems manage their own interior mutability; AppState only holds Arcs.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::AppConfig;
use crate::market_data::trade_stream::StreamSnapshot;
use crate::market_data::StreamStats;
use crate::scheduler::{JobStatus, Scheduler};

pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub stream_stats: Arc<StreamStats>,

    // ── Configuration echoed by /status ─────────────────────────────────
    pub pairs: Vec<String>,
    pub bar: String,
    pub trades_topic: String,
    /// Bearer token for authenticated routes. `None` rejects them all.
    pub admin_token: Option<String>,

    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub name: &'static str,
    #[serde(flatten)]
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub pairs: Vec<String>,
    pub bar: String,
    pub trades_topic: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub jobs: Vec<JobView>,
    pub trade_stream: StreamSnapshot,
}

impl AppState {
    pub fn new(config: &AppConfig, scheduler: Arc<Scheduler>, stream_stats: Arc<StreamStats>) -> Self {
        Self {
            scheduler,
            stream_stats,
            pairs: config.pairs(),
            bar: config.exchange.candles_bar.clone(),
            trades_topic: config.bus.trades_topic.clone(),
            admin_token: config.api.admin_token.clone().filter(|t| !t.is_empty()),
            started_at: Utc::now(),
        }
    }

    pub fn build_snapshot(&self) -> StatusSnapshot {
        let now = Utc::now();
        StatusSnapshot {
            pairs: self.pairs.clone(),
            bar: self.bar.clone(),
            trades_topic: self.trades_topic.clone(),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            jobs: self
                .scheduler
                .registry()
                .snapshot()
                .into_iter()
                .map(|(name, status)| JobView {
                    name: name.as_str(),
                    status,
                })
                .collect(),
            trade_stream: self.stream_stats.snapshot(),
        }
    }
}
