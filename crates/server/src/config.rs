use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use server_api::auth::{DEFAULT_TOKEN_TTL_SECONDS, DEV_JWT_SECRET};
use tracing::warn;
use url::Url;

const DEFAULT_ORIGINS: [&str; 3] = [
    "http://localhost:5173",
    "http://localhost:3000",
    "https://med-frontend-eta.vercel.app",
];

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_ttl_seconds: i64,
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:5000".into(),
            database_url: "sqlite://./data/chat.db".into(),
            jwt_secret: DEV_JWT_SECRET.into(),
            jwt_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            allowed_origins: DEFAULT_ORIGINS.iter().map(|o| o.to_string()).collect(),
            max_body_bytes: 100 * 1024,
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new("server.toml"), |key| std::env::var(key).ok())
}

/// Defaults, then the flat `server.toml` keys, then environment variables.
/// Later sources win.
pub fn load_settings_from(
    config_file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();
    let mut extra_origins = Vec::new();

    if let Ok(raw) = fs::read_to_string(config_file) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("bind_addr") {
                    settings.server_bind = v.clone();
                }
                if let Some(v) = file_cfg.get("database_url") {
                    settings.database_url = v.clone();
                }
                if let Some(v) = file_cfg.get("jwt_secret") {
                    settings.jwt_secret = v.clone();
                }
                if let Some(v) = file_cfg.get("jwt_ttl_seconds") {
                    apply_parsed(&mut settings.jwt_ttl_seconds, "jwt_ttl_seconds", v);
                }
                if let Some(v) = file_cfg.get("max_body_bytes") {
                    apply_parsed(&mut settings.max_body_bytes, "max_body_bytes", v);
                }
                if let Some(v) = file_cfg.get("allowed_origins") {
                    extra_origins.extend(v.split(',').map(str::to_string));
                }
            }
            Err(error) => warn!(path = %config_file.display(), %error, "ignoring unreadable config file"),
        }
    }

    if let Some(port) = env("PORT") {
        settings.server_bind = format!("0.0.0.0:{}", port.trim());
    }
    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("JWT_SECRET") {
        settings.jwt_secret = v;
    }
    if let Some(v) = env("APP__JWT_SECRET") {
        settings.jwt_secret = v;
    }

    if let Some(v) = env("APP__JWT_TTL_SECONDS") {
        apply_parsed(&mut settings.jwt_ttl_seconds, "APP__JWT_TTL_SECONDS", &v);
    }

    if let Some(v) = env("FRONTEND_URL") {
        extra_origins.push(v);
    }
    if let Some(v) = env("FRONTEND_URLS") {
        extra_origins.extend(v.split(',').map(str::to_string));
    }

    settings.allowed_origins = merge_origins(&settings.allowed_origins, &extra_origins);
    settings
}

fn apply_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = raw, "ignoring unparseable setting"),
    }
}

/// Appends `extra` to `base`, keeping first occurrences and dropping anything
/// that is not an http(s) origin.
fn merge_origins(base: &[String], extra: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    base.iter()
        .chain(extra)
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
        .filter_map(|raw| {
            let origin = normalize_origin(raw);
            if origin.is_none() {
                warn!(origin = raw, "skipping invalid allowed origin");
            }
            origin
        })
        .filter(|origin| seen.insert(origin.clone()))
        .collect()
}

fn normalize_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(url.origin().ascii_serialization())
}

/// Turns bare paths and `sqlite:` shorthands into a `sqlite://` URL.
/// `Storage::new` creates the file's parent directory.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
