//! `SWITCHBOARD_*` environment overrides, applied after the config file.

use std::str::FromStr;

use tracing::warn;

use crate::schema::SwitchboardConfig;

pub const MAX_RECONNECT_RETRIES: &str = "SWITCHBOARD_MAX_RECONNECT_RETRIES";
pub const BACKOFF_BASE_MS: &str = "SWITCHBOARD_BACKOFF_BASE_MS";
pub const BACKOFF_CAP_MS: &str = "SWITCHBOARD_BACKOFF_CAP_MS";
pub const COOLDOWN_TRIGGER_COUNT: &str = "SWITCHBOARD_COOLDOWN_TRIGGER_COUNT";
pub const COOLDOWN_WINDOW_MS: &str = "SWITCHBOARD_COOLDOWN_WINDOW_MS";
pub const COOLDOWN_MS: &str = "SWITCHBOARD_COOLDOWN_MS";
pub const MAX_QR_GENERATIONS: &str = "SWITCHBOARD_MAX_QR_GENERATIONS";
pub const WORKERS: &str = "SWITCHBOARD_WORKERS";
pub const BASE_PORT: &str = "SWITCHBOARD_BASE_PORT";
pub const BIND: &str = "SWITCHBOARD_BIND";
pub const DATABASE_URL: &str = "SWITCHBOARD_DATABASE_URL";
pub const BRIDGE_URL: &str = "SWITCHBOARD_BRIDGE_URL";

/// Apply overrides read through `lookup`. Values that fail to parse are
/// logged and skipped.
pub fn apply_env_overrides(config: &mut SwitchboardConfig, lookup: impl Fn(&str) -> Option<String>) {
    let reconnect = &mut config.reconnect;
    set_parsed(&lookup, MAX_RECONNECT_RETRIES, &mut reconnect.max_retries);
    set_parsed(&lookup, BACKOFF_BASE_MS, &mut reconnect.backoff_base_ms);
    set_parsed(&lookup, BACKOFF_CAP_MS, &mut reconnect.backoff_cap_ms);
    set_parsed(&lookup, COOLDOWN_TRIGGER_COUNT, &mut reconnect.cooldown_trigger_count);
    set_parsed(&lookup, COOLDOWN_WINDOW_MS, &mut reconnect.cooldown_window_ms);
    set_parsed(&lookup, COOLDOWN_MS, &mut reconnect.cooldown_ms);

    set_parsed(
        &lookup,
        MAX_QR_GENERATIONS,
        &mut config.handshake.max_qr_generations,
    );

    set_parsed_opt(&lookup, WORKERS, |n: usize| config.server.workers = Some(n));
    set_parsed(&lookup, BASE_PORT, &mut config.server.base_port);
    set_parsed(&lookup, BIND, &mut config.server.bind);
    set_parsed(&lookup, DATABASE_URL, &mut config.database.url);
    set_parsed(&lookup, BRIDGE_URL, &mut config.protocol.bridge_url);
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    set_parsed_opt(lookup, key, |v| *slot = v);
}

fn set_parsed_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    apply: impl FnOnce(T),
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    match raw.parse::<T>() {
        Ok(v) => apply(v),
        Err(_) => warn!(key, value = raw, "ignoring unparseable environment override"),
    }
}
