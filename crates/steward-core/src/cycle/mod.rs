//! Per-account cycle workers and the controller that owns them.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::account::{AccountRegistry, CycleLog, CyclePhase, Population, Resources, RunStatus};
use crate::client::{ClientError, GameClient};
use crate::config::Settings;
use crate::extract::{self, SecurityStatus};
use crate::features::{self, FeatureCtx, FeatureModule, RewardsModule};
use crate::proxy::ProxyPool;

/// Consecutive unreadable overviews tolerated before the worker gives up.
const MAX_PARSE_MISSES: u32 = 5;

/// What `start` did for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    UnknownAccount,
}

struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns one worker task per running account.
pub struct BotController {
    registry: AccountRegistry,
    proxies: ProxyPool,
    settings: Settings,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl BotController {
    pub fn new(registry: AccountRegistry, proxies: ProxyPool, settings: Settings) -> Self {
        Self {
            registry,
            proxies,
            settings,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Start a worker for the account. Starting a live account is a no-op.
    pub fn start(&self, account_id: &str) -> Result<StartOutcome> {
        let mut workers = self.workers.lock();
        workers.retain(|_, handle| !handle.join.is_finished());
        if workers.contains_key(account_id) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let known = self
            .registry
            .with_account(account_id, |account| {
                account.logs.clear();
                account.status = RunStatus::Running;
                account.cycle_state = CyclePhase::Starting;
            })
            .is_some();
        if !known {
            return Ok(StartOutcome::UnknownAccount);
        }
        self.registry.save()?;

        let token = CancellationToken::new();
        let worker = Worker {
            registry: self.registry.clone(),
            proxies: self.proxies.clone(),
            settings: self.settings.clone(),
            account_id: account_id.to_string(),
            cancel: token.clone(),
            #[cfg(test)]
            endpoints: None,
        };
        let join = tokio::spawn(worker.run());
        workers.insert(account_id.to_string(), WorkerHandle { token, join });
        Ok(StartOutcome::Started)
    }

    /// Ask an account's worker to stop. The worker notices within a second
    /// of its current network call finishing.
    pub fn stop(&self, account_id: &str) -> Result<()> {
        if let Some(handle) = self.workers.lock().get(account_id) {
            handle.token.cancel();
        }
        self.registry.with_account(account_id, |account| {
            account.status = RunStatus::Stopped;
        });
        self.registry.save()
    }

    /// Cancel every worker and wait for all of them to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, WorkerHandle)> = {
            let mut workers = self.workers.lock();
            workers.drain().collect()
        };
        for (_, handle) in &handles {
            handle.token.cancel();
        }
        for (account_id, handle) in handles {
            self.registry.with_account(&account_id, |account| {
                account.status = RunStatus::Stopped;
            });
            if let Err(err) = handle.join.await {
                error!(account = %account_id, %err, "worker task panicked");
            }
        }
        if let Err(err) = self.registry.save() {
            error!(%err, "failed to persist accounts on shutdown");
        }
    }
}

struct Worker {
    registry: AccountRegistry,
    proxies: ProxyPool,
    settings: Settings,
    account_id: String,
    cancel: CancellationToken,
    /// Test-only stand-in for the game and lobby hosts.
    #[cfg(test)]
    endpoints: Option<(String, String)>,
}

impl Worker {
    async fn run(self) {
        let Some(account) = self.registry.get(&self.account_id) else {
            return;
        };
        let log = CycleLog::new(self.registry.clone(), &account);
        log.info("Cycle worker starting");

        let final_phase = match self.drive(&log).await {
            Ok(phase) => phase,
            Err(err) => {
                log.error(format!("Worker crashed: {err:#}"));
                CyclePhase::Error
            }
        };

        self.registry.with_account(&self.account_id, |account| {
            account.status = RunStatus::Stopped;
            account.cycle_state = final_phase;
        });
        if let Err(err) = self.registry.save() {
            error!(account = %self.account_id, %err, "failed to persist accounts");
        }
        log.info("Worker stopped");
    }

    async fn drive(&self, log: &CycleLog) -> Result<CyclePhase> {
        let Some(record) = self.registry.get(&self.account_id) else {
            return Ok(CyclePhase::Stopped);
        };

        log.info("Connecting to the game server");

        let mut client =
            match GameClient::new(&record, &self.proxies, self.settings.markers.clone()) {
                Ok(client) => client,
                Err(err @ (ClientError::NoSession | ClientError::ProxyUnsafe(_))) => {
                    log.error(format!("Cannot start: {err}"));
                    return Ok(CyclePhase::Error);
                }
                Err(err) => return Err(err.into()),
            };

        #[cfg(test)]
        if let Some((base, lobby)) = &self.endpoints {
            client.override_endpoints(base.clone(), lobby.clone());
        }

        if client.ensure_connection().await.is_none() {
            log.error("Could not reach the server after retries");
            return Ok(CyclePhase::Error);
        }
        // the account stays in `Starting` until the world answers
        self.set_phase(CyclePhase::Checking);
        self.persist_session(&client)?;
        log.success("Connected");

        let rewards = RewardsModule;
        let modules = features::builtin_modules();
        let mut parse_misses = 0u32;

        while self.should_run() {
            self.set_phase(CyclePhase::Checking);
            log.info("Starting village analysis");

            let Some(page) = client.safe_get("/game.php?screen=overview").await else {
                log.error("Network error loading the overview");
                if !self.wait(Duration::from_secs(10)).await {
                    break;
                }
                continue;
            };

            match extract::classify_security(&page.body, client.markers()) {
                SecurityStatus::CaptchaChallenge => {
                    log.error("Captcha challenge detected, stopping");
                    return Ok(CyclePhase::Captcha);
                }
                SecurityStatus::SessionExpired => {
                    log.warn("Session expired, renewing");
                    if client.ensure_connection().await.is_some() {
                        self.persist_session(&client)?;
                        log.success("Session renewed");
                        continue;
                    }
                    log.error("Could not renew the session");
                    return Ok(CyclePhase::Error);
                }
                SecurityStatus::Ok => {}
            }

            let Some(mut state) = extract::extract_game_state(&page.body) else {
                parse_misses += 1;
                if parse_misses >= MAX_PARSE_MISSES {
                    log.error("Game data unreadable repeatedly, stopping");
                    return Ok(CyclePhase::Error);
                }
                log.warn("Could not read game data from the overview");
                if !self.wait(Duration::from_secs(5)).await {
                    break;
                }
                continue;
            };
            parse_misses = 0;
            // readable snapshot with no challenge on screen: the cycle is
            // verified before any module runs
            self.set_phase(CyclePhase::Verified);

            log.info(format!(
                "Resources: wood {} stone {} iron {}",
                state.wood, state.stone, state.iron
            ));

            let feature_config = self
                .registry
                .get(&self.account_id)
                .map(|a| a.features)
                .unwrap_or_default();

            // rewards always run first so gains land before anything spends
            {
                let mut ctx = FeatureCtx {
                    client: &mut client,
                    state: &mut state,
                    overview_body: &page.body,
                    settings: &self.settings,
                    features: &feature_config,
                    log,
                };
                if let Err(err) = rewards.execute(&mut ctx).await {
                    log.error(format!("Module rewards failed: {err:#}"));
                }
            }

            let mut order: Vec<usize> = (0..modules.len()).collect();
            order.shuffle(&mut rand::thread_rng());
            let names: Vec<&str> = order.iter().map(|&i| modules[i].name()).collect();
            log.info(format!("Cycle order: {}", names.join(" -> ")));

            for (pos, &idx) in order.iter().enumerate() {
                if !self.should_run() {
                    break;
                }
                let module = &modules[idx];
                log.info(format!("Running module {}", module.name()));
                let mut ctx = FeatureCtx {
                    client: &mut client,
                    state: &mut state,
                    overview_body: &page.body,
                    settings: &self.settings,
                    features: &feature_config,
                    log,
                };
                if let Err(err) = module.execute(&mut ctx).await {
                    log.error(format!("Module {} failed: {err:#}", module.name()));
                }
                if pos + 1 < order.len() {
                    let pause = rand::thread_rng().gen_range(2.5..5.5);
                    if !self.wait(Duration::from_secs_f64(pause)).await {
                        break;
                    }
                }
            }

            self.finish_cycle(&mut client, log).await;

            self.registry.with_account(&self.account_id, |account| {
                account.last_cycle = Some(Local::now().format("%H:%M:%S").to_string());
            });

            let rest = compute_rest_secs(
                self.settings.min_interval_min,
                self.settings.max_interval_min,
                &mut rand::thread_rng(),
            );
            log.info(format!("Cycle complete, resting {rest}s"));
            for _ in 0..rest {
                if !self.should_run() {
                    return Ok(CyclePhase::Stopped);
                }
                if !self.wait(Duration::from_secs(1)).await {
                    return Ok(CyclePhase::Stopped);
                }
            }
        }
        Ok(CyclePhase::Stopped)
    }

    /// Fetch the overview once more and persist the end-of-cycle summary.
    async fn finish_cycle(&self, client: &mut GameClient, log: &CycleLog) {
        let Some(page) = client.safe_get("/game.php?screen=overview").await else {
            return;
        };
        let Some(fresh) = extract::extract_game_state(&page.body) else {
            return;
        };
        let points = extract::points(&page.body);
        let incomings = extract::incoming_attacks(&page.body);

        self.registry.with_account(&self.account_id, |account| {
            account.resources = Resources {
                wood: fresh.wood,
                stone: fresh.stone,
                iron: fresh.iron,
            };
            account.storage = fresh.storage;
            account.population = Population {
                current: fresh.pop_current,
                max: fresh.pop_max,
            };
            account.points = points;
            account.incomings = incomings;
            account.session = Some(client.export_session());
        });
        if incomings > 0 {
            log.error(format!("{incomings} incoming attacks"));
        }
        if let Err(err) = self.registry.save() {
            error!(account = %self.account_id, %err, "failed to persist cycle summary");
        }
    }

    fn should_run(&self) -> bool {
        !self.cancel.is_cancelled()
            && self.registry.status(&self.account_id) == Some(RunStatus::Running)
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.registry
            .with_account(&self.account_id, |account| account.cycle_state = phase);
    }

    fn persist_session(&self, client: &GameClient) -> Result<()> {
        let snapshot = client.export_session();
        self.registry
            .with_account(&self.account_id, |account| account.session = Some(snapshot));
        self.registry.save()
    }

    /// Sleep unless cancelled first; `false` means cancelled.
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Rest between cycles: a uniform draw over the configured window plus a
/// 15..59s jitter so wakeups never align to a minute boundary.
fn compute_rest_secs(min_minutes: u64, max_minutes: u64, rng: &mut impl Rng) -> u64 {
    let lo = min_minutes.min(max_minutes) * 60;
    let hi = min_minutes.max(max_minutes) * 60;
    rng.gen_range(lo..=hi) + rng.gen_range(15..60)
}
