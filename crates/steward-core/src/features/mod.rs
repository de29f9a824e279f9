//! Pluggable per-cycle behaviors.
//!
//! Recruiting, scavenging and research plug in through the same trait from
//! outside this crate; the built-ins cover rewards and construction.

mod build;
mod rewards;

pub use build::BuildModule;
pub use rewards::RewardsModule;

use anyhow::Result;
use async_trait::async_trait;

use crate::account::{CycleLog, FeatureConfig};
use crate::client::GameClient;
use crate::config::Settings;
use crate::extract::GameState;

/// Everything a feature module may touch during one cycle.
pub struct FeatureCtx<'a> {
    pub client: &'a mut GameClient,

    /// Running view of the village; modules update it as they spend or gain
    pub state: &'a mut GameState,

    /// Body of the overview page the cycle verified on
    pub overview_body: &'a str,

    pub settings: &'a Settings,
    pub features: &'a FeatureConfig,
    pub log: &'a CycleLog,
}

/// One per-cycle behavior. Modules are fault isolated: an `Err` skips the
/// rest of the module but never aborts the cycle.
#[async_trait]
pub trait FeatureModule: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut FeatureCtx<'_>) -> Result<()>;
}

/// Built-in modules that run after rewards, in shuffled order.
pub fn builtin_modules() -> Vec<Box<dyn FeatureModule>> {
    vec![Box::new(BuildModule)]
}
