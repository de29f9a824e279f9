//! Construction queue management.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::account::FeatureConfig;
use crate::config::Settings;
use crate::extract::{self, GameState};

use super::{FeatureCtx, FeatureModule};

/// Priority upgrades stop applying once the building reaches this level.
const PRIORITY_LEVEL_CAP: i64 = 30;

/// Population or warehouse usage at which priority rules kick in.
const PRESSURE_RATIO: f64 = 0.90;

/// Queues building upgrades from the operator's queue, with optional farm
/// and warehouse priority overrides when the village is under pressure.
pub struct BuildModule;

#[async_trait]
impl FeatureModule for BuildModule {
    fn name(&self) -> &'static str {
        "build"
    }

    async fn execute(&self, ctx: &mut FeatureCtx<'_>) -> Result<()> {
        let Some(target) = determine_target(ctx.settings, ctx.features, ctx.state) else {
            return Ok(());
        };
        let Some(village) = ctx.state.village_id else {
            return Ok(());
        };

        let path = format!("/game.php?village={village}&screen=main");
        let Some(page) = ctx.client.safe_get(&path).await else {
            return Ok(());
        };
        let body = page.body;

        // The main screen carries fresher numbers than the overview we
        // verified on; trust it before deciding anything.
        if let Some(fresh) = extract::extract_game_state(&body) {
            ctx.state.wood = fresh.wood;
            ctx.state.stone = fresh.stone;
            ctx.state.iron = fresh.iron;
            ctx.state.storage = fresh.storage;
            ctx.state.pop_current = fresh.pop_current;
            ctx.state.pop_max = fresh.pop_max;
            if !fresh.buildings.is_empty() {
                ctx.state.buildings = fresh.buildings;
            }
        }

        // The page count is authoritative; the tally on top of it tracks
        // orders sent later in this cycle.
        ctx.state.build_orders = extract::build_order_count(&body);
        let max_queue = if extract::premium_active(&body) { 5 } else { 2 };
        if ctx.state.build_orders >= max_queue {
            ctx.log.info(format!(
                "Build queue full ({}/{max_queue})",
                ctx.state.build_orders
            ));
            return Ok(());
        }

        let buildings =
            extract::extract_json_after(&body, "BuildingMain.buildings").unwrap_or(Value::Null);
        let Some(info) = buildings.get(target.as_str()) else {
            ctx.log.warn(format!("No construction data for {target}"));
            return Ok(());
        };

        if let Some(error) = info
            .get("error")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
        {
            ctx.log.warn(format!("Game refused {target}: {error}"));
            let lowered = error.to_lowercase();
            if target != "farm" && (lowered.contains("popul") || lowered.contains("farm")) {
                self.send_order(ctx, village, "farm").await;
            }
            return Ok(());
        }

        let wood = cost(info, "wood");
        let stone = cost(info, "stone");
        let iron = cost(info, "iron");
        if ctx.state.wood < wood || ctx.state.stone < stone || ctx.state.iron < iron {
            ctx.log.info(format!("Not enough resources for {target}"));
            return Ok(());
        }

        self.send_order(ctx, village, &target).await;
        Ok(())
    }
}

impl BuildModule {
    async fn send_order(&self, ctx: &mut FeatureCtx<'_>, village: i64, target: &str) {
        let mut path = format!(
            "/game.php?village={village}&screen=main&ajaxaction=upgrade_building&type={target}"
        );
        if let Some(token) = ctx.client.token() {
            let suffix = format!("&h={token}");
            path.push_str(&suffix);
        }
        let form = [
            ("id", target.to_string()),
            ("force", "1".to_string()),
            ("destroy", "0".to_string()),
            ("source", village.to_string()),
        ];
        match ctx.client.safe_post_ajax(&path, &form).await {
            Some(page) if page.status == 200 => {
                ctx.state.build_orders += 1;
                ctx.log.success(format!("Queued upgrade of {target}"));
            }
            Some(page) => {
                ctx.log
                    .warn(format!("Upgrade of {target} answered HTTP {}", page.status));
            }
            None => ctx.log.error(format!("Upgrade of {target} failed")),
        }
    }
}

/// Pure target decision: priority rules first, then the operator's queue.
fn determine_target(
    settings: &Settings,
    features: &FeatureConfig,
    state: &GameState,
) -> Option<String> {
    if settings.farm_priority && state.pop_max > 0 {
        let ratio = state.pop_current as f64 / state.pop_max as f64;
        let farm = state.buildings.get("farm").copied().unwrap_or(0);
        if ratio >= PRESSURE_RATIO && farm < PRIORITY_LEVEL_CAP {
            return Some("farm".to_string());
        }
    }
    if settings.storage_priority && state.storage > 0 {
        let peak = state.wood.max(state.stone).max(state.iron) as f64;
        let storage = state.buildings.get("storage").copied().unwrap_or(0);
        if peak / state.storage as f64 >= PRESSURE_RATIO && storage < PRIORITY_LEVEL_CAP {
            return Some("storage".to_string());
        }
    }
    features.build_queue.first().map(|t| t.key.clone())
}

/// Upgrade cost from the game's building JSON; unparseable means never
/// affordable.
fn cost(info: &Value, key: &str) -> i64 {
    match info.get(key) {
        Some(Value::Number(n)) => n.as_f64().map(|f| f as i64).unwrap_or(i64::MAX),
        Some(Value::String(s)) => s.parse::<f64>().map(|f| f as i64).unwrap_or(i64::MAX),
        _ => i64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountRegistry, BuildTarget, CycleLog};
    use crate::client::GameClient;
    use crate::config::ChallengeMarkers;
    use crate::proxy::ProxyPool;
    use crate::session::{SessionSnapshot, DEFAULT_USER_AGENT};
    use crate::testutil::{ok, StubServer};
    use serde_json::json;

    fn state() -> GameState {
        GameState {
            wood: 500,
            stone: 500,
            iron: 500,
            storage: 1000,
            pop_current: 50,
            pop_max: 200,
            village_id: Some(42),
            buildings: [("farm".to_string(), 5), ("storage".to_string(), 4)]
                .into_iter()
                .collect(),
            build_orders: 0,
        }
    }

    fn queue(keys: &[&str]) -> FeatureConfig {
        FeatureConfig {
            build_queue: keys
                .iter()
                .map(|k| BuildTarget { key: k.to_string() })
                .collect(),
        }
    }

    #[test]
    fn queue_head_is_the_default_target() {
        let settings = Settings::default();
        let target = determine_target(&settings, &queue(&["barracks", "main"]), &state());
        assert_eq!(target.as_deref(), Some("barracks"));
        assert!(determine_target(&settings, &queue(&[]), &state()).is_none());
    }

    #[test]
    fn farm_priority_overrides_queue_under_pressure() {
        let mut settings = Settings::default();
        settings.farm_priority = true;

        let mut crowded = state();
        crowded.pop_current = 190;
        let target = determine_target(&settings, &queue(&["barracks"]), &crowded);
        assert_eq!(target.as_deref(), Some("farm"));

        // below the pressure threshold the queue wins
        let target = determine_target(&settings, &queue(&["barracks"]), &state());
        assert_eq!(target.as_deref(), Some("barracks"));
    }

    #[test]
    fn farm_priority_stops_at_the_level_cap() {
        let mut settings = Settings::default();
        settings.farm_priority = true;

        let mut crowded = state();
        crowded.pop_current = 190;
        crowded.buildings.insert("farm".to_string(), 30);
        let target = determine_target(&settings, &queue(&["barracks"]), &crowded);
        assert_eq!(target.as_deref(), Some("barracks"));
    }

    #[test]
    fn storage_priority_triggers_near_the_cap() {
        let mut settings = Settings::default();
        settings.storage_priority = true;

        let mut full = state();
        full.wood = 950;
        let target = determine_target(&settings, &queue(&["barracks"]), &full);
        assert_eq!(target.as_deref(), Some("storage"));
    }

    #[test]
    fn costs_accept_numbers_and_strings() {
        let info = json!({"wood": 120, "stone": "85", "iron": null});
        assert_eq!(cost(&info, "wood"), 120);
        assert_eq!(cost(&info, "stone"), 85);
        assert_eq!(cost(&info, "iron"), i64::MAX);
        assert_eq!(cost(&info, "missing"), i64::MAX);
    }

    const MAIN: &str = r#"<html><script>
var csrf_token = 'ab12cd34';
BuildingMain.order_count = 0;
BuildingMain.buildings = {"barracks":{"wood":100,"stone":80,"iron":60,"error":""}};
</script></html>"#;

    #[tokio::test]
    async fn queued_upgrade_bumps_the_order_tally() {
        let server = StubServer::spawn(|method, target, _| match (method, target) {
            ("GET", t) if t.contains("screen=main") => (0, ok(MAIN)),
            ("POST", t) if t.contains("upgrade_building") => (0, ok("{}")),
            _ => (0, ok("")),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let registry = AccountRegistry::load(dir.path()).unwrap();
        let pool = ProxyPool::load(dir.path()).unwrap();
        let record = registry
            .add_account("br", "w1", "alice", None, &pool)
            .unwrap();
        registry.with_account(&record.id, |a| {
            a.session = Some(SessionSnapshot::new(
                Vec::new(),
                DEFAULT_USER_AGENT.to_string(),
            ));
        });
        let record = registry.get(&record.id).unwrap();
        let log = CycleLog::new(registry.clone(), &record);

        let mut client = GameClient::new(&record, &pool, ChallengeMarkers::default()).unwrap();
        client.override_endpoints(
            format!("http://{}/w1", server.addr),
            format!("http://{}/lobby", server.addr),
        );

        let mut village = state();
        let settings = Settings::default();
        let features = queue(&["barracks"]);
        let mut ctx = FeatureCtx {
            client: &mut client,
            state: &mut village,
            overview_body: "",
            settings: &settings,
            features: &features,
            log: &log,
        };
        BuildModule.execute(&mut ctx).await.unwrap();
        drop(ctx);

        assert_eq!(village.build_orders, 1);
        assert_eq!(
            server.count(
                "POST /w1/game.php?village=42&screen=main&ajaxaction=upgrade_building\
                 &type=barracks&h=ab12cd34"
            ),
            1
        );
    }
}
