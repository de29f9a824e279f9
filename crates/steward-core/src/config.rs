//! Operator settings loading and management.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global operator settings, loaded from `settings.yaml` in the data dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minimum rest between cycles, in minutes
    pub min_interval_min: u64,

    /// Maximum rest between cycles, in minutes
    pub max_interval_min: u64,

    /// Prefer upgrading the farm when population runs out
    pub farm_priority: bool,

    /// Prefer upgrading storage when resources cap out
    pub storage_priority: bool,

    /// Keep resources reserved for the configured build queue
    pub reserve_for_building: bool,

    /// Security-signal marker set; a moving target, kept as data
    pub markers: ChallengeMarkers,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_interval_min: 3,
            max_interval_min: 5,
            farm_priority: false,
            storage_priority: false,
            reserve_for_building: true,
            markers: ChallengeMarkers::default(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings from {}", path.display()))?;
        Ok(settings)
    }

    /// Load from the data dir, falling back to defaults when absent
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("settings.yaml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist settings to the data dir
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("settings.yaml");
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }
}

/// Marker substrings used to classify response bodies.
///
/// The game operator changes these over time; they are configuration data
/// rather than a hard-coded contract, and the defaults carry the currently
/// known set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeMarkers {
    /// Any of these means a bot-protection challenge is on screen
    pub challenge: Vec<String>,

    /// Any of these means the session no longer authenticates
    pub session_expiry: Vec<String>,
}

impl Default for ChallengeMarkers {
    fn default() -> Self {
        Self {
            challenge: vec![
                "bot-protection-row".to_string(),
                "bot-protection-blur".to_string(),
                r#"data-bot-protect="forced""#.to_string(),
                r#"id="bot_check""#.to_string(),
                // visible challenge text, caught even when the CSS hooks rotate
                "Proteção contra Bots".to_string(),
                "Inicia a verificação".to_string(),
                "g-recaptcha".to_string(),
                "recaptcha-token".to_string(),
            ],
            session_expiry: vec![
                "sso/login".to_string(),
                r#"id="login_form""#.to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipping_values() {
        let settings = Settings::default();
        assert_eq!(settings.min_interval_min, 3);
        assert_eq!(settings.max_interval_min, 5);
        assert!(!settings.farm_priority);
        assert!(settings.reserve_for_building);
        assert!(!settings.markers.challenge.is_empty());
    }

    #[test]
    fn default_markers_include_visible_challenge_text() {
        let markers = ChallengeMarkers::default();
        assert!(markers.challenge.iter().any(|m| m == "Proteção contra Bots"));
        assert!(markers.challenge.iter().any(|m| m == "Inicia a verificação"));
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let settings: Settings = serde_yaml::from_str("min_interval_min: 10\n").unwrap();
        assert_eq!(settings.min_interval_min, 10);
        assert_eq!(settings.max_interval_min, 5);
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.max_interval_min = 9;
        settings.save(dir.path()).unwrap();

        let loaded = Settings::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.max_interval_min, 9);
    }
}
