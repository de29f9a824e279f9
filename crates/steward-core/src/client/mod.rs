//! Resilient HTTP client speaking for one account.
//!
//! Every request goes through the account's captured cookies and user agent,
//! optionally over its bound proxy, with human-like pacing between calls.
//! Transport failures degrade to `None`; the cycle decides what to do next.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cookie_store::CookieStore;
use rand::Rng;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest_cookie_store::CookieStoreMutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::account::AccountRecord;
use crate::config::ChallengeMarkers;
use crate::extract::{self, SecurityStatus};
use crate::proxy::ProxyPool;
use crate::session::{SessionCookie, SessionSnapshot};

/// Why a client could not be constructed for an account.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("account has no captured session")]
    NoSession,

    #[error("bound proxy {0} is missing or failing")]
    ProxyUnsafe(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// One fetched page: final URL after redirects, status, and body.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Whether a final URL indicates the session bounced to a login surface.
pub fn is_expiry_url(url: &str) -> bool {
    url.contains("session_expired") || url.contains("login.php") || url.contains("sso/login")
}

/// HTTP client bound to one account's session, world and proxy.
#[derive(Debug)]
pub struct GameClient {
    http: reqwest::Client,
    jar: Arc<CookieStoreMutex>,
    base_url: String,
    lobby_url: String,
    world: String,
    user_agent: String,
    markers: ChallengeMarkers,
    token: Option<String>,
    last_url: Option<String>,
}

impl GameClient {
    /// Build a client for the account. Fails fast when the account has no
    /// captured session, or when its bound proxy is missing or flagged as
    /// failing. An account without a proxy binding connects directly.
    pub fn new(
        record: &AccountRecord,
        pool: &ProxyPool,
        markers: ChallengeMarkers,
    ) -> Result<Self, ClientError> {
        let session = record.session.as_ref().ok_or(ClientError::NoSession)?;
        let base_url = format!("https://{}.tribalwars.com.{}", record.world, record.server);
        let lobby_url = format!("https://www.tribalwars.com.{}", record.server);

        let mut store = CookieStore::default();
        for cookie in &session.cookies {
            let domain = normalize_cookie_domain(&cookie.domain, &record.server);
            let request_url = format!("https://{}/", domain.trim_start_matches('.'));
            let Ok(url) = reqwest::Url::parse(&request_url) else {
                continue;
            };
            let header = format!(
                "{}={}; Domain={}; Path={}",
                cookie.name, cookie.value, domain, cookie.path
            );
            if let Err(err) = store.parse(&header, &url) {
                warn!(cookie = %cookie.name, %err, "skipping unparseable session cookie");
            }
        }
        let jar = Arc::new(CookieStoreMutex::new(store));

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let mut builder = reqwest::Client::builder()
            .user_agent(session.user_agent.clone())
            .default_headers(headers)
            .cookie_provider(Arc::clone(&jar))
            .timeout(Duration::from_secs(20));

        if let Some(ref proxy_id) = record.proxy_id {
            let proxy = pool
                .get(proxy_id)
                .filter(|_| pool.is_healthy(proxy_id))
                .ok_or_else(|| ClientError::ProxyUnsafe(proxy_id.clone()))?;
            builder = builder.proxy(reqwest::Proxy::all(proxy.proxy_url())?);
        }

        Ok(Self {
            http: builder.build()?,
            jar,
            base_url,
            lobby_url,
            world: record.world.clone(),
            user_agent: session.user_agent.clone(),
            markers,
            token: None,
            last_url: session.last_url.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn lobby_url(&self) -> &str {
        &self.lobby_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn markers(&self) -> &ChallengeMarkers {
        &self.markers
    }

    /// Point the client at arbitrary base and lobby URLs so tests can stand
    /// in for the game servers with a local listener.
    #[cfg(test)]
    pub(crate) fn override_endpoints(&mut self, base_url: String, lobby_url: String) {
        self.base_url = base_url;
        self.lobby_url = lobby_url;
    }

    fn overview_url(&self) -> String {
        format!("{}/game.php?screen=overview", self.base_url)
    }

    /// Reach the world's overview page, trying up to three times with short
    /// backoffs. Success means the final URL is still a `game.php` page on
    /// this world and the body does not read as expired; anything else, a
    /// login bounce or a redirect to the lobby or another world included,
    /// triggers one lobby re-entry per try. `None` means the network or the
    /// session is beyond quick repair.
    pub async fn ensure_connection(&mut self) -> Option<PageResponse> {
        for attempt in 1u32..=3 {
            let url = self.overview_url();
            match self.get_inner(&url, None).await {
                Ok(page) => {
                    let status = extract::classify_security(&page.body, &self.markers);
                    let in_world =
                        page.url.contains(self.world.as_str()) && page.url.contains("game.php");
                    if in_world
                        && !is_expiry_url(&page.url)
                        && status != SecurityStatus::SessionExpired
                    {
                        return Some(page);
                    }
                    debug!(attempt, url = %page.url, "not on a world page, re-entering");
                    if let Some(page) = self.reenter_world().await {
                        return Some(page);
                    }
                }
                Err(err) => warn!(attempt, %err, "overview fetch failed"),
            }
            if attempt < 3 {
                let backoff = if attempt == 1 { 2 } else { 3 };
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }
        None
    }

    /// Re-enter the world from the lobby: fetch the lobby page, follow its
    /// `play` link for this world after a short pause, referred by the lobby.
    pub async fn reenter_world(&mut self) -> Option<PageResponse> {
        let lobby = self.lobby_url.clone();
        // arriving from a search result looks more ordinary than a bare visit
        let page = match self.get_inner(&lobby, Some("https://www.google.com/")).await {
            Ok(page) => page,
            Err(err) => {
                warn!(%err, "lobby fetch failed");
                return None;
            }
        };
        if is_expiry_url(&page.url) {
            warn!("lobby bounced to login, session is gone");
            return None;
        }

        let link = find_play_link(&page.body, &self.world)?;
        let target = if link.starts_with("http") {
            link
        } else {
            format!("{}{}", self.lobby_url, link)
        };

        self.pace(1.2, 2.5).await;
        match self.get_inner(&target, Some(&lobby)).await {
            Ok(page) if page.url.contains("game.php") => Some(page),
            Ok(page) => {
                warn!(url = %page.url, "world re-entry landed outside the game");
                None
            }
            Err(err) => {
                warn!(%err, "world re-entry failed");
                None
            }
        }
    }

    /// GET a path under the world's base URL with human-like pacing. On a
    /// login bounce, re-enters the world and replays the request exactly
    /// once.
    pub async fn safe_get(&mut self, path: &str) -> Option<PageResponse> {
        self.pace(0.6, 1.8).await;
        let url = format!("{}{}", self.base_url, path);
        self.get_with_recovery(&url, None).await
    }

    /// GET an absolute URL, optionally with a referer, with pacing and the
    /// same single-replay recovery as `safe_get`.
    pub async fn safe_get_absolute(
        &mut self,
        url: &str,
        referer: Option<&str>,
    ) -> Option<PageResponse> {
        self.pace(0.8, 1.5).await;
        self.get_with_recovery(url, referer).await
    }

    async fn get_with_recovery(
        &mut self,
        url: &str,
        referer: Option<&str>,
    ) -> Option<PageResponse> {
        match self.get_inner(url, referer).await {
            Ok(page) if is_expiry_url(&page.url) => {
                debug!(%url, "request bounced to login, re-entering world once");
                self.reenter_world().await?;
                match self.get_inner(url, referer).await {
                    Ok(page) if is_expiry_url(&page.url) => None,
                    Ok(page) => Some(page),
                    Err(err) => {
                        warn!(%err, %url, "replayed request failed");
                        None
                    }
                }
            }
            Ok(page) => Some(page),
            Err(err) => {
                warn!(%err, %url, "request failed");
                None
            }
        }
    }

    /// POST a form to a path under the base URL, carrying the CSRF token as
    /// the `h` field. On a login bounce, re-enters the world and replays the
    /// request exactly once.
    pub async fn safe_post(
        &mut self,
        path: &str,
        form: &[(&str, String)],
    ) -> Option<PageResponse> {
        self.post_with(path, form, false).await
    }

    /// `safe_post` with the in-game AJAX headers attached.
    pub async fn safe_post_ajax(
        &mut self,
        path: &str,
        form: &[(&str, String)],
    ) -> Option<PageResponse> {
        self.post_with(path, form, true).await
    }

    async fn post_with(
        &mut self,
        path: &str,
        form: &[(&str, String)],
        ajax: bool,
    ) -> Option<PageResponse> {
        if self.token.is_none() {
            self.ensure_connection().await?;
        }
        let token = self.token.clone()?;

        self.pace(1.0, 2.5).await;
        match self.post_inner(path, form, &token, ajax).await {
            Ok(page) if is_expiry_url(&page.url) => {
                debug!(path, "post bounced to login, re-entering world once");
                self.reenter_world().await?;
                let token = self.token.clone()?;
                match self.post_inner(path, form, &token, ajax).await {
                    Ok(page) if is_expiry_url(&page.url) => None,
                    Ok(page) => Some(page),
                    Err(err) => {
                        warn!(%err, path, "replayed post failed");
                        None
                    }
                }
            }
            Ok(page) => Some(page),
            Err(err) => {
                warn!(%err, path, "post failed");
                None
            }
        }
    }

    async fn get_inner(
        &mut self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<PageResponse, reqwest::Error> {
        let mut request = self.http.get(url);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        let response = request.send().await?;
        self.finish(response).await
    }

    async fn post_inner(
        &mut self,
        path: &str,
        form: &[(&str, String)],
        token: &str,
        ajax: bool,
    ) -> Result<PageResponse, reqwest::Error> {
        let url = format!("{}{}", self.base_url, path);
        let referer = self.overview_url();

        let mut params: Vec<(&str, &str)> = form.iter().map(|(k, v)| (*k, v.as_str())).collect();
        params.push(("h", token));

        let mut request = self.http.post(&url).form(&params).header(REFERER, referer);
        if ajax {
            request = request
                .header("X-Requested-With", "XMLHttpRequest")
                .header("TribalWars-Ajax", "1");
        }
        let response = request.send().await?;
        self.finish(response).await
    }

    async fn finish(&mut self, response: reqwest::Response) -> Result<PageResponse, reqwest::Error> {
        let url = response.url().to_string();
        let status = response.status().as_u16();
        let body = response.text().await?;
        if let Some(token) = extract::extract_token(&body) {
            self.token = Some(token);
        }
        self.last_url = Some(url.clone());
        Ok(PageResponse { url, status, body })
    }

    /// Snapshot the live cookie jar back into a persistable session.
    pub fn export_session(&self) -> SessionSnapshot {
        let store = self.jar.lock().expect("cookie store poisoned");
        let cookies = store
            .iter_any()
            .map(|c| SessionCookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
                domain: c.domain().unwrap_or("").to_string(),
                path: c.path().unwrap_or("/").to_string(),
            })
            .collect();
        SessionSnapshot {
            cookies,
            user_agent: self.user_agent.clone(),
            last_url: self.last_url.clone(),
            captured_at: Some(Utc::now()),
        }
    }

    async fn pace(&self, lo: f64, hi: f64) {
        let secs = {
            let mut rng = rand::thread_rng();
            rng.gen_range(lo..hi)
        };
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

/// Rewrite a captured cookie domain so it matches both the lobby and world
/// subdomains: `www.` hosts collapse to the bare game domain, and every
/// domain gets a leading dot.
fn normalize_cookie_domain(domain: &str, server: &str) -> String {
    let domain = domain.trim();
    if domain.is_empty() {
        return format!(".tribalwars.com.{server}");
    }
    let stripped = domain.strip_prefix("www.").unwrap_or(domain);
    if stripped.starts_with('.') {
        stripped.to_string()
    } else {
        format!(".{stripped}")
    }
}

/// Find the lobby's `play` link for a world, unescaping HTML ampersands.
fn find_play_link(body: &str, world: &str) -> Option<String> {
    let pattern = format!(r#"href="([^"]*?/page/play/{}[^"]*)""#, regex::escape(world));
    let re = Regex::new(&pattern).ok()?;
    let link = re.captures(body)?.get(1)?.as_str();
    Some(link.replace("&amp;", "&"))
}
