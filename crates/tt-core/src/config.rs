use std::env;
use std::path::PathBuf;

pub const APP_DIR: &str = "thread-tracker";

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join(APP_DIR)
}

pub fn resolve_socket_path(flag: &str) -> PathBuf {
    resolve_path(flag, "TT_SOCKET").unwrap_or_else(|| data_dir().join("hub.sock"))
}

pub fn resolve_db_path(flag: &str) -> PathBuf {
    resolve_path(flag, "TT_DB").unwrap_or_else(|| data_dir().join("threads.sqlite"))
}

pub fn resolve_log_dir(flag: &str) -> String {
    if let Some(value) = non_empty(flag).or_else(|| env_value("TT_LOG_DIR")) {
        return value;
    }
    data_dir().join("logs").to_string_lossy().to_string()
}

pub fn resolve_log_level() -> String {
    env_value("TT_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
}

pub fn resolve_log_stdout(default: bool) -> bool {
    env_value("TT_LOG_STDOUT")
        .and_then(|value| parse_bool(&value))
        .unwrap_or(default)
}

pub fn resolve_client_id(flag: &str, prefix: &str) -> String {
    non_empty(flag)
        .or_else(|| env_value("TT_CLIENT_ID"))
        .unwrap_or_else(|| format!("{prefix}-{}", std::process::id()))
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" => Some(false),
        _ => None,
    }
}

pub fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn resolve_path(flag: &str, var: &str) -> Option<PathBuf> {
    non_empty(flag).or_else(|| env_value(var)).map(PathBuf::from)
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn env_value(var: &str) -> Option<String> {
    env::var(var).ok().and_then(|value| non_empty(&value))
}
