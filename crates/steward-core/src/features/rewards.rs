//! Daily bonus collection, quest completion and reward claiming.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::extract::{self, GameState, RewardItem};

use super::{FeatureCtx, FeatureModule};

/// Collects the daily bonus, completes finished quests and claims quest
/// rewards that fit in the warehouse. Always runs before other modules so
/// resource gains land before anything spends.
pub struct RewardsModule;

#[async_trait]
impl FeatureModule for RewardsModule {
    fn name(&self) -> &'static str {
        "rewards"
    }

    async fn execute(&self, ctx: &mut FeatureCtx<'_>) -> Result<()> {
        self.claim_daily_bonus(ctx).await;
        self.handle_quests(ctx).await;
        Ok(())
    }
}

impl RewardsModule {
    async fn claim_daily_bonus(&self, ctx: &mut FeatureCtx<'_>) {
        if !extract::daily_bonus_pending(ctx.overview_body) {
            return;
        }
        ctx.log.info("Daily bonus window detected, collecting");

        let path = match ctx.state.village_id {
            Some(village) => format!("/game.php?village={village}&screen=daily_bonus"),
            None => "/game.php?screen=daily_bonus".to_string(),
        };
        let Some(page) = ctx.client.safe_get(&path).await else {
            return;
        };
        let Some(day) = extract::daily_bonus_day(&page.body) else {
            ctx.log.warn("Daily bonus page had no claimable day");
            return;
        };

        let post_path = format!("{path}&ajaxaction=open");
        let form = [
            ("day", day.clone()),
            ("from_screen", "login".to_string()),
            ("client_time", Utc::now().timestamp().to_string()),
        ];
        if ctx.client.safe_post_ajax(&post_path, &form).await.is_some() {
            ctx.log.success(format!("Daily bonus for day {day} collected"));
        }
    }

    async fn handle_quests(&self, ctx: &mut FeatureCtx<'_>) {
        let Some(village) = ctx.state.village_id else {
            return;
        };

        let quests = extract::completable_quests(ctx.overview_body);
        for quest in &quests {
            ctx.log.info(format!("Completing quest {quest}"));
            let path = format!(
                "/game.php?village={village}&screen=api&ajaxaction=quest_complete&quest={quest}&skip=false"
            );
            if ctx.client.safe_post_ajax(&path, &[]).await.is_some() {
                ctx.log.success(format!("Quest {quest} completed"));
            }
        }

        let popup_path = format!(
            "/game.php?village={village}&screen=new_quests&ajax=quest_popup&tab=main-tab&quest=0"
        );
        let Some(page) = ctx.client.safe_get(&popup_path).await else {
            return;
        };

        let rewards = extract::claimable_rewards(&page.body);
        if quests.is_empty() && rewards.is_empty() {
            ctx.log.info("No quests or rewards pending");
            return;
        }

        for reward in rewards {
            if would_overflow(ctx.state, &reward) {
                ctx.log
                    .warn(format!("{}: warehouse would overflow, skipping", reward.label));
                continue;
            }
            ctx.log.info(format!("Claiming reward {}", reward.label));
            let claim_path =
                format!("/game.php?village={village}&screen=new_quests&ajax=claim_reward");
            let form = [("reward_id", reward.id.clone())];
            if ctx.client.safe_post_ajax(&claim_path, &form).await.is_some() {
                ctx.state.wood += reward.wood;
                ctx.state.stone += reward.stone;
                ctx.state.iron += reward.iron;
            }
        }
    }
}

/// Whether claiming would push any resource past the warehouse cap.
fn would_overflow(state: &GameState, reward: &RewardItem) -> bool {
    state.wood + reward.wood > state.storage
        || state.stone + reward.stone > state.storage
        || state.iron + reward.iron > state.storage
}
