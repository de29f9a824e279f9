//! Account record - everything persisted about one automated account.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionSnapshot;

/// Bounded length of the per-account rolling log.
pub const MAX_LOG_ENTRIES: usize = 200;

/// Whether the operator wants this account's loop running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Stopped,
    Running,
}

/// Where in its cycle an account currently is.
///
/// `Captcha` and `Error` are terminal until the operator restarts the
/// account; there is no automatic path out of either.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    #[default]
    Stopped,
    Starting,
    Checking,
    Verified,
    Captcha,
    Error,
}

/// Severity of one rolling-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

/// One entry in the account's rolling log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Last observed resource amounts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Resources {
    pub wood: i64,
    pub stone: i64,
    pub iron: i64,
}

/// Last observed population usage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Population {
    pub current: i64,
    pub max: i64,
}

/// One step in the operator-configured construction queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTarget {
    /// Building key as the game names it (`main`, `farm`, `barracks`, ...)
    pub key: String,
}

/// Feature-module configuration owned by the modules themselves; the engine
/// only stores and hands it over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub build_queue: Vec<BuildTarget>,
}

/// Everything persisted about one automated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: String,

    /// Server/market code, e.g. `br` or `en`
    pub server: String,

    /// World identifier, e.g. `br123`
    pub world: String,

    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Captured session; absent means cycles cannot run
    #[serde(default)]
    pub session: Option<SessionSnapshot>,

    /// Bound proxy, if any
    #[serde(default)]
    pub proxy_id: Option<String>,

    #[serde(default)]
    pub status: RunStatus,

    #[serde(default)]
    pub cycle_state: CyclePhase,

    #[serde(default)]
    pub resources: Resources,

    #[serde(default)]
    pub storage: i64,

    #[serde(default)]
    pub population: Population,

    #[serde(default)]
    pub points: i64,

    #[serde(default)]
    pub incomings: i64,

    /// Wall-clock time the last cycle finished, `HH:MM:SS`
    #[serde(default)]
    pub last_cycle: Option<String>,

    #[serde(default)]
    pub logs: VecDeque<LogEntry>,

    #[serde(default)]
    pub features: FeatureConfig,
}

impl AccountRecord {
    pub fn new(server: &str, world: &str, username: &str, proxy_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            server: server.to_lowercase(),
            world: world.to_string(),
            username: username.to_string(),
            password: None,
            session: None,
            proxy_id,
            status: RunStatus::default(),
            cycle_state: CyclePhase::default(),
            resources: Resources::default(),
            storage: 0,
            population: Population::default(),
            points: 0,
            incomings: 0,
            last_cycle: None,
            logs: VecDeque::new(),
            features: FeatureConfig::default(),
        }
    }

    /// Display label used when binding proxies: `[SERVER] user - world`.
    pub fn label(&self) -> String {
        format!("[{}] {} - {}", self.server.to_uppercase(), self.username, self.world)
    }

    /// Append to the rolling log, evicting the oldest entries past the cap.
    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push_back(LogEntry {
            at: Utc::now(),
            level,
            message: message.into(),
        });
        while self.logs.len() > MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_is_bounded() {
        let mut record = AccountRecord::new("en", "en123", "alice", None);
        for i in 0..(MAX_LOG_ENTRIES + 50) {
            record.push_log(LogLevel::Info, format!("entry {i}"));
        }
        assert_eq!(record.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(record.logs.front().unwrap().message, "entry 50");
    }

    #[test]
    fn label_format() {
        let record = AccountRecord::new("BR", "br77", "bob", None);
        assert_eq!(record.label(), "[BR] bob - br77");
        assert_eq!(record.server, "br");
    }
}
