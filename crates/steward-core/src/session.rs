//! Captured browser session state, reusable for automated requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User agent reported when a capture did not record one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Cookies + user agent + last URL captured from an authenticated browser
/// session. Embedded in the account record; without one, cycles cannot run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub cookies: Vec<SessionCookie>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Last page the session was seen on
    #[serde(default)]
    pub last_url: Option<String>,

    /// When the cookies were last synchronized
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

/// One captured cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

impl SessionSnapshot {
    pub fn new(cookies: Vec<SessionCookie>, user_agent: String) -> Self {
        Self {
            cookies,
            user_agent,
            last_url: None,
            captured_at: Some(Utc::now()),
        }
    }
}
