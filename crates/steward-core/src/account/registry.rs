//! Shared account store, persisted as one JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::warn;

use crate::proxy::ProxyPool;

use super::record::{AccountRecord, LogLevel, RunStatus};

/// Shared store of account records.
///
/// All mutation runs as a critical section over the whole collection, so a
/// worker updating its record never races a CLI mutation on another account.
#[derive(Clone)]
pub struct AccountRegistry {
    path: PathBuf,
    accounts: Arc<Mutex<Vec<AccountRecord>>>,
}

impl AccountRegistry {
    /// Load the registry from `accounts.json` in the data dir, empty when
    /// absent. Run intent and cycle phase are not trusted across restarts.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("accounts.json");
        let mut accounts: Vec<AccountRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read accounts from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse accounts from {}", path.display()))?
        } else {
            Vec::new()
        };
        for account in &mut accounts {
            account.status = RunStatus::Stopped;
            account.cycle_state = Default::default();
        }
        Ok(Self {
            path,
            accounts: Arc::new(Mutex::new(accounts)),
        })
    }

    /// Persist the whole collection.
    pub fn save(&self) -> Result<()> {
        let accounts = self.accounts.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&*accounts)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write accounts to {}", self.path.display()))?;
        Ok(())
    }

    /// Add a new account, binding its proxy if one was given.
    pub fn add_account(
        &self,
        server: &str,
        world: &str,
        username: &str,
        proxy_id: Option<String>,
        pool: &ProxyPool,
    ) -> Result<AccountRecord> {
        let record = AccountRecord::new(server, world, username, proxy_id.clone());
        if let Some(ref id) = proxy_id {
            pool.assign(id, Some(record.label()))?;
        }
        self.accounts.lock().push(record.clone());
        self.save()?;
        Ok(record)
    }

    /// Remove an account and release its proxy binding.
    pub fn delete_account(&self, id: &str, pool: &ProxyPool) -> Result<Option<AccountRecord>> {
        let removed = {
            let mut accounts = self.accounts.lock();
            let idx = accounts.iter().position(|a| a.id == id);
            idx.map(|i| accounts.remove(i))
        };
        if let Some(ref record) = removed {
            if let Some(ref proxy_id) = record.proxy_id {
                if let Err(err) = pool.assign(proxy_id, None) {
                    warn!(proxy = %proxy_id, %err, "failed to release proxy binding");
                }
            }
            self.save()?;
        }
        Ok(removed)
    }

    /// Snapshot of one account.
    pub fn get(&self, id: &str) -> Option<AccountRecord> {
        self.accounts.lock().iter().find(|a| a.id == id).cloned()
    }

    /// Snapshot of the whole collection.
    pub fn list(&self) -> Vec<AccountRecord> {
        self.accounts.lock().clone()
    }

    /// Current run intent, `None` for an unknown id.
    pub fn status(&self, id: &str) -> Option<RunStatus> {
        self.accounts.lock().iter().find(|a| a.id == id).map(|a| a.status)
    }

    /// Run `f` against one record under the collection lock. Returns `None`
    /// when the id is unknown. `f` must not block.
    pub fn with_account<R>(&self, id: &str, f: impl FnOnce(&mut AccountRecord) -> R) -> Option<R> {
        let mut accounts = self.accounts.lock();
        accounts.iter_mut().find(|a| a.id == id).map(f)
    }

    /// Append to an account's rolling log.
    pub fn append_log(&self, id: &str, level: LogLevel, message: impl Into<String>) {
        self.with_account(id, |account| account.push_log(level, message));
    }
}

/// Logger bound to one account: every message lands in the account's rolling
/// log and in the tracing stream.
#[derive(Clone)]
pub struct CycleLog {
    registry: AccountRegistry,
    account_id: String,
    label: String,
}

impl CycleLog {
    pub fn new(registry: AccountRegistry, account: &AccountRecord) -> Self {
        Self {
            registry,
            account_id: account.id.clone(),
            label: account.label(),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.write(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.write(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.write(LogLevel::Error, message.into());
    }

    pub fn success(&self, message: impl Into<String>) {
        self.write(LogLevel::Success, message.into());
    }

    fn write(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Warn => tracing::warn!(account = %self.label, "{message}"),
            LogLevel::Error => tracing::error!(account = %self.label, "{message}"),
            _ => tracing::info!(account = %self.label, "{message}"),
        }
        self.registry.append_log(&self.account_id, level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::CyclePhase;

    fn fixtures() -> (AccountRegistry, ProxyPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = AccountRegistry::load(dir.path()).unwrap();
        let pool = ProxyPool::load(dir.path()).unwrap();
        (registry, pool, dir)
    }

    #[test]
    fn add_persist_reload() {
        let (registry, pool, dir) = fixtures();
        let record = registry.add_account("en", "en123", "alice", None, &pool).unwrap();

        let reloaded = AccountRegistry::load(dir.path()).unwrap();
        let found = reloaded.get(&record.id).unwrap();
        assert_eq!(found.username, "alice");
        assert_eq!(found.world, "en123");
    }

    #[test]
    fn reload_resets_run_state() {
        let (registry, pool, dir) = fixtures();
        let record = registry.add_account("en", "en123", "alice", None, &pool).unwrap();
        registry.with_account(&record.id, |a| {
            a.status = RunStatus::Running;
            a.cycle_state = CyclePhase::Verified;
        });
        registry.save().unwrap();

        let reloaded = AccountRegistry::load(dir.path()).unwrap();
        let found = reloaded.get(&record.id).unwrap();
        assert_eq!(found.status, RunStatus::Stopped);
        assert_eq!(found.cycle_state, CyclePhase::Stopped);
    }

    #[test]
    fn delete_releases_proxy() {
        let (registry, pool, _dir) = fixtures();
        let proxies = pool.add_from_text("10.0.0.1:8080").unwrap();
        let proxy_id = proxies[0].id.clone();

        let record = registry
            .add_account("en", "en123", "alice", Some(proxy_id.clone()), &pool)
            .unwrap();
        assert_eq!(
            pool.get(&proxy_id).unwrap().assigned_to.as_deref(),
            Some(record.label().as_str())
        );

        registry.delete_account(&record.id, &pool).unwrap();
        assert!(pool.get(&proxy_id).unwrap().assigned_to.is_none());
        assert!(registry.get(&record.id).is_none());
    }

    #[test]
    fn with_account_unknown_id() {
        let (registry, _pool, _dir) = fixtures();
        assert!(registry.with_account("missing", |_| ()).is_none());
        assert!(registry.status("missing").is_none());
    }
}
