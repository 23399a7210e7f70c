//! Bot-Config Reconciler.
//!
//! Safe, idempotent mutation of the bot runtime's JSON configuration, one
//! file per logged-in account. Every patch loads the whole document, touches
//! only the relevant sub-section, validates, and rewrites it pretty-printed.
//! Fields this model does not know about are carried in per-section extra
//! bags so a load-modify-save cycle never drops them.

use std::net::TcpListener;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::FrameworkKind;

/// Number of candidate ports probed before giving up and returning the start.
const PORT_SEARCH_SPAN: u16 = 100;

#[derive(Error, Debug)]
pub enum BotConfigError {
    #[error("{0}")]
    Validation(String),
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Data model ───────────────────────────────────────────────

/// Protocol endpoint kinds of the OneBot 11 surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    #[serde(rename = "ws")]
    Ws,
    #[serde(rename = "ws-reverse")]
    WsReverse,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "http-post")]
    HttpPost,
}

impl ConnectionKind {
    /// Outbound kinds connect out to a URL; listening kinds bind a local port.
    /// This decides the identity key for idempotent reconciliation.
    pub fn is_outbound(&self) -> bool {
        matches!(self, ConnectionKind::WsReverse | ConnectionKind::HttpPost)
    }
}

/// One configured protocol endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ob11Connection {
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_heart_interval", rename = "heartInterval")]
    pub heart_interval: u32,
    #[serde(default = "default_message_format", rename = "messagePostFormat")]
    pub message_post_format: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_heart_interval() -> u32 {
    30000
}

fn default_message_format() -> String {
    "array".to_string()
}

impl Ob11Connection {
    pub fn ws_listener(host: HostMode, port: u16, token: &str) -> Self {
        Self {
            kind: ConnectionKind::Ws,
            enable: true,
            host: host.to_host(),
            port,
            url: String::new(),
            token: token.to_string(),
            heart_interval: default_heart_interval(),
            message_post_format: default_message_format(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn ws_reverse(url: &str, token: &str) -> Self {
        Self {
            kind: ConnectionKind::WsReverse,
            enable: true,
            host: String::new(),
            port: 0,
            url: url.to_string(),
            token: token.to_string(),
            heart_interval: default_heart_interval(),
            message_post_format: default_message_format(),
            extra: serde_json::Map::new(),
        }
    }

    /// Identity for idempotent reconciliation: `(type, url)` for outbound
    /// kinds, `(type, port)` for listening kinds.
    fn matches_target(&self, other: &Ob11Connection) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.kind.is_outbound() {
            self.url == other.url
        } else {
            self.port == other.port
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ob11Config {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub connect: Vec<Ob11Connection>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebUiConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_webui_port")]
    pub port: u16,
    #[serde(default)]
    pub token: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_webui_port() -> u16 {
    6099
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: "127.0.0.1".to_string(),
            port: default_webui_port(),
            token: String::new(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SatoriConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub token: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MilkyConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub token: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The bot runtime's on-disk configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlBotConfig {
    #[serde(default, rename = "webui")]
    pub webui: WebUiConfig,
    #[serde(default)]
    pub ob11: Ob11Config,
    #[serde(default)]
    pub satori: SatoriConfig,
    #[serde(default)]
    pub milky: MilkyConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LlBotConfig {
    /// Ensure an equivalent endpoint exists and is enabled. Existing entries
    /// are matched by their identity key and re-enabled in place; a match is
    /// never duplicated. Returns true when the document changed.
    pub fn ensure_connection(&mut self, desired: Ob11Connection) -> bool {
        if let Some(existing) = self
            .ob11
            .connect
            .iter_mut()
            .find(|c| c.matches_target(&desired))
        {
            if existing.enable {
                return false;
            }
            existing.enable = true;
            return true;
        }
        self.ob11.connect.push(desired);
        true
    }

    /// Refuse any endpoint that binds all interfaces without an access token.
    pub fn validate(&self) -> Result<(), BotConfigError> {
        if self.webui.enable
            && HostMode::from_host(&self.webui.host) == HostMode::AllInterfaces
            && self.webui.token.is_empty()
        {
            return Err(BotConfigError::Validation(
                "WebUI listens on all interfaces without a token; set a token or bind localhost"
                    .to_string(),
            ));
        }
        for conn in &self.ob11.connect {
            if conn.enable
                && !conn.kind.is_outbound()
                && HostMode::from_host(&conn.host) == HostMode::AllInterfaces
                && conn.token.is_empty()
            {
                return Err(BotConfigError::Validation(format!(
                    "OB11 endpoint on port {} listens on all interfaces without a token",
                    conn.port
                )));
            }
        }
        if self.satori.enable
            && HostMode::from_host(&self.satori.host) == HostMode::AllInterfaces
            && self.satori.token.is_empty()
        {
            return Err(BotConfigError::Validation(format!(
                "Satori endpoint on port {} listens on all interfaces without a token",
                self.satori.port
            )));
        }
        if self.milky.enable
            && HostMode::from_host(&self.milky.host) == HostMode::AllInterfaces
            && self.milky.token.is_empty()
        {
            return Err(BotConfigError::Validation(format!(
                "Milky endpoint on port {} listens on all interfaces without a token",
                self.milky.port
            )));
        }
        Ok(())
    }
}

// ── Host-mode mapping ────────────────────────────────────────

/// UI-facing host-binding modes. The mapping to the literal bind string must
/// be exact and reversible so loading and re-saving an existing config never
/// alters a bind the user didn't touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMode {
    AllInterfaces,
    Localhost,
    Custom(String),
}

impl HostMode {
    pub fn from_host(host: &str) -> Self {
        match host {
            "" => HostMode::AllInterfaces,
            "127.0.0.1" => HostMode::Localhost,
            other => HostMode::Custom(other.to_string()),
        }
    }

    pub fn to_host(&self) -> String {
        match self {
            HostMode::AllInterfaces => String::new(),
            HostMode::Localhost => "127.0.0.1".to_string(),
            HostMode::Custom(s) => s.clone(),
        }
    }
}

/// Probe `[start, start + 100)` for a bindable port, releasing each candidate
/// immediately. Falls back to `start` when the whole range is occupied; the
/// caller must tolerate a possible collision in that case.
pub fn find_available_port(start: u16) -> u16 {
    for offset in 0..PORT_SEARCH_SPAN {
        let Some(candidate) = start.checked_add(offset) else {
            break;
        };
        if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
            return candidate;
        }
    }
    tracing::warn!(
        "No free port in [{}, {}), falling back to {}",
        start,
        start as u32 + PORT_SEARCH_SPAN as u32,
        start
    );
    start
}

// ── Store ────────────────────────────────────────────────────

/// Filesystem owner of per-account runtime configs. The in-memory model is a
/// cache; each patch reloads, mutates, validates and rewrites.
pub struct BotConfigStore {
    data_dir: PathBuf,
}

impl BotConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn config_path(&self, uin: &str) -> PathBuf {
        self.data_dir.join(format!("config_{}.json", uin))
    }

    /// Absent or unparsable files yield the built-in defaults; load never
    /// fails the caller.
    pub fn load(&self, uin: &str) -> LlBotConfig {
        let path = self.config_path(uin);
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        "Bot config {} is unparsable ({}), using defaults",
                        path.display(),
                        e
                    );
                    LlBotConfig::default()
                }
            },
            Err(_) => LlBotConfig::default(),
        }
    }

    /// Validate, then rewrite the whole document pretty-printed. A validation
    /// failure leaves the file untouched.
    pub fn save(&self, uin: &str, config: &LlBotConfig) -> Result<(), BotConfigError> {
        config.validate()?;
        let path = self.config_path(uin);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(config)?;
        std::fs::write(&path, text)?;
        tracing::debug!("Bot config saved to {}", path.display());
        Ok(())
    }

    /// Targeted patch: load, mutate, save. The mutation result reports whether
    /// anything changed; an unchanged document is rewritten anyway so repeated
    /// reconciliation converges on identical file content.
    pub fn patch<F>(&self, uin: &str, mutate: F) -> Result<bool, BotConfigError>
    where
        F: FnOnce(&mut LlBotConfig) -> bool,
    {
        let mut config = self.load(uin);
        let changed = mutate(&mut config);
        self.save(uin, &config)?;
        Ok(changed)
    }

    /// Wire a freshly installed framework to the runtime: reverse frameworks
    /// get an outbound reverse-WebSocket endpoint at their conventional URL,
    /// forward frameworks get a listening endpoint on a free port.
    pub fn wire_framework(&self, uin: &str, kind: FrameworkKind) -> Result<u16, BotConfigError> {
        let port = match kind.reverse_path() {
            Some(_) => kind.default_port(),
            None => find_available_port(kind.default_port()),
        };
        self.patch(uin, |config| {
            config.ob11.enable = true;
            let desired = match kind.reverse_path() {
                Some(path) => Ob11Connection::ws_reverse(
                    &format!("ws://127.0.0.1:{}{}", port, path),
                    "",
                ),
                None => Ob11Connection::ws_listener(HostMode::Localhost, port, ""),
            };
            config.ensure_connection(desired)
        })?;
        tracing::info!(
            "Wired {} to the bot runtime on port {}",
            kind.display_name(),
            port
        );
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BotConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BotConfigStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn absent_file_loads_defaults() {
        let (_dir, store) = store();
        let config = store.load("10001");
        assert!(config.ob11.connect.is_empty());
        assert_eq!(config.webui.host, "127.0.0.1");
    }

    #[test]
    fn corrupt_file_loads_defaults() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("config_10001.json"), "{not json").unwrap();
        let config = store.load("10001");
        assert_eq!(config, LlBotConfig::default());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let (_dir, store) = store();
        let url = "ws://127.0.0.1:6199/ws";

        let add = |cfg: &mut LlBotConfig| cfg.ensure_connection(Ob11Connection::ws_reverse(url, ""));
        assert!(store.patch("10001", add).unwrap());
        let once = std::fs::read_to_string(store.config_path("10001")).unwrap();

        assert!(!store.patch("10001", add).unwrap());
        let twice = std::fs::read_to_string(store.config_path("10001")).unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.load("10001").ob11.connect.len(), 1);
    }

    #[test]
    fn disabled_matching_endpoint_is_reenabled_not_duplicated() {
        let (_dir, store) = store();
        let url = "ws://127.0.0.1:6199/ws";

        let mut config = LlBotConfig::default();
        let mut existing = Ob11Connection::ws_reverse(url, "");
        existing.enable = false;
        config.ob11.connect.push(existing);
        store.save("10001", &config).unwrap();

        let changed = store
            .patch("10001", |cfg| {
                cfg.ensure_connection(Ob11Connection::ws_reverse(url, ""))
            })
            .unwrap();
        assert!(changed);

        let after = store.load("10001");
        assert_eq!(after.ob11.connect.len(), 1);
        assert!(after.ob11.connect[0].enable);

        // a different URL appends, leaving the first untouched
        store
            .patch("10001", |cfg| {
                cfg.ensure_connection(Ob11Connection::ws_reverse("ws://127.0.0.1:5140/onebot", ""))
            })
            .unwrap();
        let after = store.load("10001");
        assert_eq!(after.ob11.connect.len(), 2);
        assert_eq!(after.ob11.connect[0].url, url);
    }

    #[test]
    fn listening_endpoints_match_by_port() {
        let mut config = LlBotConfig::default();
        config.ensure_connection(Ob11Connection::ws_listener(HostMode::Localhost, 3001, "t"));
        // same port, different host string: still the same endpoint identity
        let changed =
            config.ensure_connection(Ob11Connection::ws_listener(HostMode::Localhost, 3001, "t"));
        assert!(!changed);
        assert_eq!(config.ob11.connect.len(), 1);

        config.ensure_connection(Ob11Connection::ws_listener(HostMode::Localhost, 3002, "t"));
        assert_eq!(config.ob11.connect.len(), 2);
    }

    #[test]
    fn host_mode_round_trip_is_exact() {
        for host in ["", "127.0.0.1", "192.168.1.5"] {
            assert_eq!(HostMode::from_host(host).to_host(), host);
        }
        assert_eq!(HostMode::from_host(""), HostMode::AllInterfaces);
        assert_eq!(HostMode::from_host("127.0.0.1"), HostMode::Localhost);
        assert_eq!(
            HostMode::from_host("192.168.1.5"),
            HostMode::Custom("192.168.1.5".to_string())
        );
    }

    #[test]
    fn free_port_search_returns_free_start_immediately() {
        // grab a port, then release it so it is known-free
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        assert_eq!(find_available_port(port), port);
    }

    #[test]
    fn free_port_search_skips_occupied_start() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        let found = find_available_port(port);
        assert_ne!(found, port);
        assert!(found > port && found < port.saturating_add(PORT_SEARCH_SPAN));
    }

    #[test]
    fn all_interfaces_without_token_is_rejected_and_file_untouched() {
        let (_dir, store) = store();
        let mut config = LlBotConfig::default();
        config.webui.token = "secret".to_string();
        store.save("10001", &config).unwrap();
        let before = std::fs::read_to_string(store.config_path("10001")).unwrap();

        let mut bad = store.load("10001");
        bad.webui.host = HostMode::AllInterfaces.to_host();
        bad.webui.token.clear();
        let err = store.save("10001", &bad).unwrap_err();
        assert!(matches!(err, BotConfigError::Validation(_)));
        assert!(err.to_string().contains("WebUI"));

        let after = std::fs::read_to_string(store.config_path("10001")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn exposed_ob11_listener_without_token_is_rejected() {
        let mut config = LlBotConfig::default();
        config.ensure_connection(Ob11Connection::ws_listener(HostMode::AllInterfaces, 3001, ""));
        assert!(config.validate().is_err());

        let mut with_token = LlBotConfig::default();
        with_token
            .ensure_connection(Ob11Connection::ws_listener(HostMode::AllInterfaces, 3001, "s3"));
        assert!(with_token.validate().is_ok());
    }

    #[test]
    fn exposed_satori_listener_without_token_is_rejected() {
        let (_dir, store) = store();
        let mut config = LlBotConfig::default();
        config.satori.enable = true;
        config.satori.host = HostMode::AllInterfaces.to_host();
        config.satori.port = 5500;
        assert!(matches!(
            config.validate(),
            Err(BotConfigError::Validation(_))
        ));
        assert!(store.save("10001", &config).is_err());

        config.satori.token = "s3".to_string();
        assert!(config.validate().is_ok());

        // localhost binds never need a token
        config.satori.token.clear();
        config.satori.host = HostMode::Localhost.to_host();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn exposed_milky_listener_without_token_is_rejected() {
        let mut config = LlBotConfig::default();
        config.milky.enable = true;
        config.milky.host = HostMode::AllInterfaces.to_host();
        config.milky.port = 5600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Milky"));

        config.milky.token = "m1lk".to_string();
        assert!(config.validate().is_ok());

        // a disabled section is not an exposure
        config.milky.token.clear();
        config.milky.enable = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_fields_survive_a_patch_cycle() {
        let (dir, store) = store();
        let original = serde_json::json!({
            "webui": { "enable": true, "host": "127.0.0.1", "port": 6099, "token": "t",
                       "loginRate": 3 },
            "ob11": { "enable": false, "connect": [] },
            "experimental": { "flag": true }
        });
        std::fs::write(
            dir.path().join("config_10001.json"),
            serde_json::to_string_pretty(&original).unwrap(),
        )
        .unwrap();

        store
            .patch("10001", |cfg| {
                cfg.ensure_connection(Ob11Connection::ws_reverse("ws://127.0.0.1:5140/onebot", ""))
            })
            .unwrap();

        let text = std::fs::read_to_string(store.config_path("10001")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["experimental"]["flag"], serde_json::json!(true));
        assert_eq!(value["webui"]["loginRate"], serde_json::json!(3));
        assert_eq!(value["ob11"]["connect"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn wire_reverse_framework_uses_conventional_url() {
        let (_dir, store) = store();
        let port = store
            .wire_framework("10001", FrameworkKind::AstrBot)
            .unwrap();
        assert_eq!(port, 6199);

        let config = store.load("10001");
        assert!(config.ob11.enable);
        assert_eq!(config.ob11.connect.len(), 1);
        assert_eq!(config.ob11.connect[0].kind, ConnectionKind::WsReverse);
        assert_eq!(config.ob11.connect[0].url, "ws://127.0.0.1:6199/ws");

        // wiring again converges without duplicating
        store
            .wire_framework("10001", FrameworkKind::AstrBot)
            .unwrap();
        assert_eq!(store.load("10001").ob11.connect.len(), 1);
    }

    #[test]
    fn wire_forward_framework_gets_a_listening_endpoint() {
        let (_dir, store) = store();
        let port = store.wire_framework("10001", FrameworkKind::DdBot).unwrap();
        let config = store.load("10001");
        assert_eq!(config.ob11.connect.len(), 1);
        let conn = &config.ob11.connect[0];
        assert_eq!(conn.kind, ConnectionKind::Ws);
        assert!(!conn.kind.is_outbound());
        assert_eq!(conn.port, port);
        assert_eq!(conn.host, "127.0.0.1");
    }
}
