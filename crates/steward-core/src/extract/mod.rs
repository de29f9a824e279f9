//! State extraction from raw server responses.
//!
//! Everything here is stateless and side-effect free: one body in, one
//! structured answer out. Responses may be full HTML documents, bare JSON
//! objects, or HTML fragments wrapped in a JSON envelope; the fallback
//! chains below handle all three without the caller knowing which arrived.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::config::ChallengeMarkers;

/// Security judgment for a single response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityStatus {
    /// Normal operation.
    Ok,
    /// Bot-protection challenge present; the account must halt.
    CaptchaChallenge,
    /// The session no longer authenticates; re-entry may recover it.
    SessionExpired,
}

/// Structured game state rebuilt every cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GameState {
    pub wood: i64,
    pub stone: i64,
    pub iron: i64,
    pub storage: i64,
    pub pop_current: i64,
    pub pop_max: i64,
    pub village_id: Option<i64>,
    pub buildings: HashMap<String, i64>,
    /// Orders sitting in the construction queue. Modules bump this when
    /// they queue an upgrade so later decisions in the same cycle see it
    /// before the next page read confirms it.
    pub build_orders: i64,
}

/// A claimable quest reward parsed out of the reward popup.
#[derive(Clone, Debug, PartialEq)]
pub struct RewardItem {
    pub id: String,
    pub label: String,
    pub wood: i64,
    pub stone: i64,
    pub iron: i64,
}

static META_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name="csrf-token" content="([a-f0-9]+)""#).expect("static regex"));
static JS_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"csrf_token\s*=\s*['"]([a-f0-9]+)['"]"#).expect("static regex"));
static ORDER_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"BuildingMain\.order_count = (\d+);").expect("static regex"));
static CLAIM_REWARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RewardSystem\.claimReward\(\s*(\d+)").expect("static regex"));
static BONUS_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""day"\s*:\s*(\d+)\s*,\s*"is_locked"\s*:\s*false\s*,\s*"is_collected"\s*:\s*false"#)
        .expect("static regex")
});
static LOGIN_FORM_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("form#login_form").expect("static selector"));

/// Classify a response body against the configured challenge/expiry markers.
///
/// Challenge markers outrank the login-form signal: a challenge page can
/// resemble a login form, and misreading it as a mere expired session would
/// trigger re-entry attempts against an account that must halt instead.
/// Malformed input classifies as [`SecurityStatus::Ok`]; this never panics.
pub fn classify_security(body: &str, markers: &ChallengeMarkers) -> SecurityStatus {
    if markers.challenge.iter().any(|m| body.contains(m.as_str())) {
        return SecurityStatus::CaptchaChallenge;
    }

    if markers.session_expiry.iter().any(|m| body.contains(m.as_str())) {
        return SecurityStatus::SessionExpired;
    }
    // Attribute order or quoting may defeat the substring form of the
    // login-form marker, so also check structurally.
    if Html::parse_document(body).select(&LOGIN_FORM_SEL).next().is_some() {
        return SecurityStatus::SessionExpired;
    }

    SecurityStatus::Ok
}

/// Extract the anti-forgery token from any of its three response shapes:
/// meta tag (lobby pages), inline script assignment (game pages), or JSON
/// field (AJAX envelopes). First match wins.
pub fn extract_token(body: &str) -> Option<String> {
    if let Some(caps) = META_TOKEN_RE.captures(body) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = JS_TOKEN_RE.captures(body) {
        return Some(caps[1].to_string());
    }
    if let Some(start) = body.find(r#""csrf":""#) {
        let rest = &body[start + 8..];
        let token = &rest[..rest.find('"')?];
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

/// Extract the structured game state from a response body, or `None` if no
/// usable data is present. Callers treat `None` as "retry next cycle".
///
/// Fallback chain, in order:
/// 1. the whole body as a JSON envelope carrying a `game_data` object,
/// 2. the `TribalWars.updateGameData` assignment, located with a
///    balanced-brace scan (payloads nest objects and contain braces inside
///    string literals, which greedy patterns mangle),
/// 3. scraping the resource elements by their known ids.
pub fn extract_game_state(body: &str) -> Option<GameState> {
    if let Ok(envelope) = serde_json::from_str::<Value>(body) {
        let game_data = envelope
            .get("game_data")
            .or_else(|| envelope.get("response").and_then(|r| r.get("game_data")));
        if let Some(state) = game_data.and_then(state_from_value) {
            return Some(state);
        }
    }

    if let Some(payload) = extract_json_after(body, "TribalWars.updateGameData") {
        if let Some(state) = state_from_value(&payload) {
            return Some(state);
        }
    }

    scrape_state(body)
}

/// Locate `marker` in the body and parse the first balanced `{...}` or
/// `[...]` that follows it. Exposed for feature modules that read screen
/// payloads like `BuildingMain.buildings`.
pub fn extract_json_after(body: &str, marker: &str) -> Option<Value> {
    let marker_at = body.find(marker)?;
    let offset = body[marker_at..].find(|c| c == '{' || c == '[')?;
    let raw = balanced_slice(body, marker_at + offset)?;
    serde_json::from_str(raw).ok()
}

/// Current rank points scraped from the overview header, 0 when absent.
pub fn points(body: &str) -> i64 {
    element_text(body, "#rank_points").map(|t| parse_count(&t)).unwrap_or(0)
}

/// Number of incoming attacks shown on the overview, 0 when absent.
pub fn incoming_attacks(body: &str) -> i64 {
    element_text(body, "span#incomings_amount")
        .map(|t| parse_count(&t))
        .unwrap_or(0)
}

/// Construction orders already queued, read from the main-screen script.
pub fn build_order_count(body: &str) -> i64 {
    ORDER_COUNT_RE
        .captures(body)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

/// Ids of main-line quests that are finished but not yet collected.
pub fn completable_quests(body: &str) -> Vec<String> {
    let Some(data) = extract_json_after(body, "Quests.setQuestData") else {
        return Vec::new();
    };
    let Some(quests) = data.as_object() else {
        return Vec::new();
    };

    let mut ready = BTreeSet::new();
    for (qid, quest) in quests {
        let Some(quest) = quest.as_object() else { continue };
        let finished = quest.get("finished").map(is_truthy).unwrap_or(false)
            || quest.get("state").and_then(Value::as_str) == Some("finished");
        let closed = quest.get("closed").map(is_truthy).unwrap_or(false);
        if finished && !closed {
            ready.insert(qid.clone());
        }
    }
    ready.into_iter().collect()
}

/// Rewards that can be claimed right now. The popup arrives either as an
/// HTML fragment inside a JSON envelope or as a plain document; both forms
/// are unwrapped before scanning.
pub fn claimable_rewards(body: &str) -> Vec<RewardItem> {
    let context = dialog_context(body);
    let mut found: Vec<RewardItem> = Vec::new();

    let mut candidates = Vec::new();
    if let Some(Value::Array(items)) = extract_json_after(&context, "RewardSystem.setRewards") {
        candidates.extend(items);
    }
    if let Some(Value::Array(items)) = extract_json_after(&context, "\"rewards\"") {
        candidates.extend(items);
    }

    for item in &candidates {
        let unlocked = item.get("status").and_then(Value::as_str) == Some("unlocked")
            || item.get("claimable").map(is_truthy).unwrap_or(false);
        if !unlocked {
            continue;
        }
        let Some(id) = item.get("id").map(value_to_string) else { continue };
        if found.iter().any(|r| r.id == id) {
            continue;
        }
        let reward = item.get("reward").cloned().unwrap_or(Value::Null);
        found.push(RewardItem {
            id,
            label: item
                .get("building")
                .and_then(Value::as_str)
                .unwrap_or("reward")
                .to_string(),
            wood: reward.get("wood").map(value_to_i64).unwrap_or(0),
            stone: reward.get("stone").map(value_to_i64).unwrap_or(0),
            iron: reward.get("iron").map(value_to_i64).unwrap_or(0),
        });
    }

    if found.is_empty() {
        for caps in CLAIM_REWARD_RE.captures_iter(&context) {
            let id = caps[1].to_string();
            if found.iter().any(|r| r.id == id) {
                continue;
            }
            found.push(RewardItem {
                id,
                label: "reward".to_string(),
                wood: 0,
                stone: 0,
                iron: 0,
            });
        }
    }

    found
}

/// Whether the daily bonus dialog is pending on this page.
pub fn daily_bonus_pending(body: &str) -> bool {
    body.contains("DailyBonus.showDialog")
        || body.contains("DailyBonus.init")
        || body.contains("mode=daily_bonus")
}

/// The day slot that is unlocked and uncollected on the daily bonus screen.
pub fn daily_bonus_day(body: &str) -> Option<String> {
    BONUS_DAY_RE.captures(body).map(|c| c[1].to_string())
}

/// Whether the premium account flag is active in the page's feature JSON.
pub fn premium_active(body: &str) -> bool {
    body.contains(r#""Premium":{"possible":true,"active":true}"#)
}

fn state_from_value(game_data: &Value) -> Option<GameState> {
    // Some payloads nest the fields under `village`, some are the village
    // object itself.
    let village = match game_data.get("village") {
        Some(v) if v.is_object() => v,
        _ => game_data,
    };
    let obj = village.as_object()?;
    if !obj.contains_key("wood") && !obj.contains_key("buildings") {
        return None;
    }

    let field = |name: &str| obj.get(name).map(value_to_i64).unwrap_or(0);
    let buildings = obj
        .get("buildings")
        .and_then(Value::as_object)
        .map(|b| {
            b.iter()
                .map(|(name, level)| (name.clone(), value_to_i64(level)))
                .collect()
        })
        .unwrap_or_default();

    Some(GameState {
        wood: field("wood"),
        stone: field("stone"),
        iron: field("iron"),
        storage: field("storage_max"),
        pop_current: field("pop"),
        pop_max: field("pop_max"),
        village_id: obj.get("id").map(value_to_i64).filter(|id| *id != 0),
        buildings,
        build_orders: 0,
    })
}

fn scrape_state(body: &str) -> Option<GameState> {
    let doc = Html::parse_document(body);
    let grab = |css: &str| -> Option<i64> {
        let selector = Selector::parse(css).ok()?;
        let el = doc.select(&selector).next()?;
        Some(parse_count(&el.text().collect::<String>()))
    };

    // Without at least the wood indicator this is not a game page.
    let wood = grab("#wood")?;
    Some(GameState {
        wood,
        stone: grab("#stone").unwrap_or(0),
        iron: grab("#iron").unwrap_or(0),
        storage: grab("#storage").unwrap_or(0),
        pop_current: grab("#pop_current_label").unwrap_or(0),
        pop_max: grab("#pop_max_label").unwrap_or(0),
        village_id: None,
        buildings: HashMap::new(),
        build_orders: 0,
    })
}

/// Return the balanced bracket slice starting at `start` (which must index
/// an ASCII `{` or `[`). Depth-counting, string-literal and escape aware.
fn balanced_slice(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let open = *bytes.get(start)?;
    let close = match open {
        b'{' => b'}',
        b'[' => b']',
        _ => return None,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..=i]);
            }
        }
    }
    None
}

/// Unwrap an AJAX envelope down to the HTML fragment under `response.dialog`
/// (or a bare string `response`), or hand back the body untouched.
fn dialog_context(body: &str) -> Cow<'_, str> {
    if let Ok(envelope) = serde_json::from_str::<Value>(body) {
        if let Some(response) = envelope.get("response") {
            if let Some(dialog) = response.get("dialog").and_then(Value::as_str) {
                return Cow::Owned(dialog.to_string());
            }
            if let Some(text) = response.as_str() {
                return Cow::Owned(text.to_string());
            }
        }
    }
    Cow::Borrowed(body)
}

fn element_text(body: &str, css: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    let doc = Html::parse_document(body);
    let el = doc.select(&selector).next()?;
    Some(el.text().collect::<String>())
}

/// Parse a displayed number: thousands separators stripped, parsed as
/// floating point, truncated to integer.
fn parse_count(text: &str) -> i64 {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, '.' | ',' | ' ' | '\u{a0}'))
        .collect();
    cleaned.parse::<f64>().map(|v| v as i64).unwrap_or(0)
}

fn value_to_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_f64().map(|v| v as i64).unwrap_or(0),
        Value::String(s) => parse_count(s),
        Value::Bool(true) => 1,
        _ => 0,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> ChallengeMarkers {
        ChallengeMarkers::default()
    }

    const VILLAGE_JSON: &str = r#"{"village":{"id":12345,"wood":"1.512","stone":2048.7,"iron":512,"storage_max":24000,"pop":240,"pop_max":317,"buildings":{"main":12,"farm":"9"}}}"#;

    #[test]
    fn game_state_from_bare_json_envelope() {
        let body = format!(r#"{{"game_data":{}}}"#, VILLAGE_JSON);
        let state = extract_game_state(&body).unwrap();
        assert_eq!(state.wood, 1512);
        assert_eq!(state.stone, 2048);
        assert_eq!(state.iron, 512);
        assert_eq!(state.storage, 24000);
        assert_eq!(state.pop_current, 240);
        assert_eq!(state.pop_max, 317);
        assert_eq!(state.village_id, Some(12345));
        assert_eq!(state.buildings.get("main"), Some(&12));
        assert_eq!(state.buildings.get("farm"), Some(&9));
    }

    #[test]
    fn game_state_from_nested_response_envelope() {
        let body = format!(r#"{{"response":{{"game_data":{}}},"error":null}}"#, VILLAGE_JSON);
        let nested = extract_game_state(&body).unwrap();
        let bare = extract_game_state(&format!(r#"{{"game_data":{}}}"#, VILLAGE_JSON)).unwrap();
        assert_eq!(nested, bare);
    }

    #[test]
    fn game_state_from_script_assignment() {
        let body = format!(
            "<html><script>TribalWars.updateGameData({});</script></html>",
            VILLAGE_JSON
        );
        let from_script = extract_game_state(&body).unwrap();
        let from_json = extract_game_state(&format!(r#"{{"game_data":{}}}"#, VILLAGE_JSON)).unwrap();
        assert_eq!(from_script, from_json);
    }

    #[test]
    fn game_state_from_element_scrape() {
        let body = r#"<html><body>
            <span id="wood">1.512</span><span id="stone">2.048</span>
            <span id="iron">512</span><span id="storage">24.000</span>
            <span id="pop_current_label">240</span><span id="pop_max_label">317</span>
        </body></html>"#;
        let state = extract_game_state(body).unwrap();
        assert_eq!(state.wood, 1512);
        assert_eq!(state.storage, 24000);
        assert_eq!(state.pop_max, 317);
        assert!(state.village_id.is_none());
    }

    #[test]
    fn game_state_none_when_all_shapes_fail() {
        assert!(extract_game_state("<html><body>nothing here</body></html>").is_none());
        assert!(extract_game_state("").is_none());
    }

    #[test]
    fn brace_scanner_survives_nesting_and_strings() {
        let body = concat!(
            r#"junk TribalWars.updateGameData({"village":{"wood":10,"name":"a {weird} place","note":"esc \" brace }","buildings":{"main":3}},"units":["spear","sword"]});"#,
            r#" Quests.setQuestData({"9":{"finished":true}}); trailing { garbage"#
        );
        let payload = extract_json_after(body, "TribalWars.updateGameData").unwrap();
        // Exactly the outermost object: the sibling assignment is not consumed.
        assert_eq!(payload["village"]["name"], "a {weird} place");
        assert_eq!(payload["village"]["note"], "esc \" brace }");
        assert_eq!(payload["units"][1], "sword");
        assert!(payload.get("9").is_none());
    }

    #[test]
    fn brace_scanner_handles_unterminated_payload() {
        assert!(extract_json_after("Data.load({\"a\": {\"b\": 1}", "Data.load").is_none());
    }

    #[test]
    fn token_meta_form_wins_over_js_form() {
        let body = r#"<meta name="csrf-token" content="ab12cd"> var csrf_token = 'ffffff';"#;
        assert_eq!(extract_token(body).as_deref(), Some("ab12cd"));
    }

    #[test]
    fn token_js_and_json_forms() {
        assert_eq!(
            extract_token("var csrf_token = '403d5aba';").as_deref(),
            Some("403d5aba")
        );
        assert_eq!(
            extract_token(r#"{"csrf":"deadbeef","response":{}}"#).as_deref(),
            Some("deadbeef")
        );
        assert!(extract_token("no token here").is_none());
    }

    #[test]
    fn challenge_outranks_login_form() {
        let body = r#"<div class="bot-protection-row"></div><form id="login_form"></form>"#;
        assert_eq!(classify_security(body, &markers()), SecurityStatus::CaptchaChallenge);
    }

    #[test]
    fn expiry_only_without_challenge_marker() {
        let body = r#"<html><form id="login_form"><input name="user"></form></html>"#;
        assert_eq!(classify_security(body, &markers()), SecurityStatus::SessionExpired);
        assert_eq!(
            classify_security("redirecting to sso/login please wait", &markers()),
            SecurityStatus::SessionExpired
        );
    }

    #[test]
    fn visible_challenge_text_is_a_challenge() {
        let body = "<html><body><h2>Proteção contra Bots</h2><p>humano?</p></body></html>";
        assert_eq!(classify_security(body, &markers()), SecurityStatus::CaptchaChallenge);
        let body = "<html><body><a>Inicia a verificação</a></body></html>";
        assert_eq!(classify_security(body, &markers()), SecurityStatus::CaptchaChallenge);
    }

    #[test]
    fn forced_body_attribute_is_a_challenge() {
        let body = r#"<body data-bot-protect="forced"><form id="login_form"></form></body>"#;
        assert_eq!(classify_security(body, &markers()), SecurityStatus::CaptchaChallenge);
    }

    #[test]
    fn ordinary_page_classifies_ok() {
        assert_eq!(classify_security("<html><body>game</body></html>", &markers()), SecurityStatus::Ok);
        assert_eq!(classify_security("", &markers()), SecurityStatus::Ok);
        assert_eq!(classify_security("{not even html", &markers()), SecurityStatus::Ok);
    }

    #[test]
    fn quests_finished_and_not_closed() {
        let body = r#"Quests.setQuestData({"3":{"finished":true,"closed":false},"4":{"finished":1},"5":{"state":"finished","closed":true},"6":{"finished":false}});"#;
        assert_eq!(completable_quests(body), vec!["3".to_string(), "4".to_string()]);
    }

    #[test]
    fn rewards_from_list_and_regex_fallback() {
        let body = r#"RewardSystem.setRewards([
            {"id":11,"status":"unlocked","building":"barracks","reward":{"wood":100,"stone":50,"iron":25}},
            {"id":12,"status":"locked","reward":{"wood":9}}
        ]);"#;
        let rewards = claimable_rewards(body);
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].id, "11");
        assert_eq!(rewards[0].wood, 100);

        let fallback = claimable_rewards("onclick=\"RewardSystem.claimReward( 77 )\"");
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].id, "77");
    }

    #[test]
    fn rewards_unwrap_json_dialog_envelope() {
        let dialog = r#"RewardSystem.setRewards([{\"id\":9,\"claimable\":true,\"reward\":{\"wood\":10}}]);"#;
        let body = format!(r#"{{"response":{{"dialog":"{}"}}}}"#, dialog);
        let rewards = claimable_rewards(&body);
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].id, "9");
    }

    #[test]
    fn overview_counters() {
        let body = r#"<span id="rank_points">1.234</span><span id="incomings_amount"> 2 </span>
                      <script>BuildingMain.order_count = 3;</script>"#;
        assert_eq!(points(body), 1234);
        assert_eq!(incoming_attacks(body), 2);
        assert_eq!(build_order_count(body), 3);
    }

    #[test]
    fn daily_bonus_detection() {
        assert!(daily_bonus_pending("DailyBonus.showDialog(1)"));
        assert!(!daily_bonus_pending("<html>plain</html>"));
        let screen = r#"{"day": 4, "is_locked": false, "is_collected": false}"#;
        assert_eq!(daily_bonus_day(screen).as_deref(), Some("4"));
        let collected = r#"{"day": 4, "is_locked": false, "is_collected": true}"#;
        assert!(daily_bonus_day(collected).is_none());
    }
}
