// ABOUTME: Tests for configuration loading from files and the process environment
// ABOUTME: Verifies config file discovery, env var overrides, and validation at load time

use serial_test::serial;
use std::io::Write;
use warelay::config::Config;

/// Helper to clear all config-related env vars
fn clear_config_env_vars() {
    for name in [
        "WARELAY_CONFIG_PATH",
        "GROQ_API_KEY",
        "COMPLETION_API_KEY",
        "COMPLETION_BASE_URL",
        "COMPLETION_MODEL",
        "DIRECT_ONLY",
        "FALLBACK_REPLY",
        "SESSION_DIR",
        "PAIRING_LOCAL_PREFIX",
        "SIDECAR_COMMAND",
        "MAX_RESTARTS",
    ] {
        std::env::remove_var(name);
    }
}

fn write_raw_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let config_path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&config_path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    config_path
}

/// Write a config that also names the sidecar, which has no default
fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    write_raw_config(
        dir,
        &format!("{}\n[transport]\ncommand = \"warelay-sidecar\"\n", content),
    )
}

#[test]
#[serial]
fn test_config_loads_from_env_path() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
[completion]
model = "llama-3.1-8b-instant"

[relay]
direct_only = true

[session]
dir = "/var/lib/warelay/session"
"#,
    );
    std::env::set_var("WARELAY_CONFIG_PATH", config_path.to_str().unwrap());

    let config = Config::load(None).unwrap();
    assert_eq!(config.completion.model, "llama-3.1-8b-instant");
    assert!(config.relay.direct_only);
    assert_eq!(config.session.dir, "/var/lib/warelay/session");
    assert!(config.completion.api_key.is_none());

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_explicit_path_beats_env_path() {
    clear_config_env_vars();
    let env_dir = tempfile::tempdir().unwrap();
    let env_path = write_config(&env_dir, "[pairing]\nlocal_prefix = \"44\"\n");
    std::env::set_var("WARELAY_CONFIG_PATH", env_path.to_str().unwrap());

    let explicit_dir = tempfile::tempdir().unwrap();
    let explicit_path = write_config(&explicit_dir, "[pairing]\nlocal_prefix = \"91\"\n");

    let config = Config::load(Some(&explicit_path)).unwrap();
    assert_eq!(config.pairing.local_prefix, "91");

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
[completion]
api_key = "from-file"

[relay]
direct_only = false
"#,
    );
    std::env::set_var("GROQ_API_KEY", "from-env");
    std::env::set_var("DIRECT_ONLY", "1");
    std::env::set_var("MAX_RESTARTS", "3");

    let config = Config::load(Some(&config_path)).unwrap();
    assert_eq!(config.completion.api_key.as_deref(), Some("from-env"));
    assert!(config.relay.direct_only);
    assert_eq!(config.reconnect.max_restarts, 3);

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_invalid_file_fails_to_load() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&temp_dir, "[completion]\ntemperature = 5.0\n");

    let err = Config::load(Some(&config_path)).unwrap_err();
    assert!(err.to_string().contains("temperature"));

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_bad_max_restarts_env_fails() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&temp_dir, "");
    std::env::set_var("MAX_RESTARTS", "lots");

    assert!(Config::load(Some(&config_path)).is_err());

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_missing_sidecar_command_is_a_startup_error() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = write_raw_config(&temp_dir, "[relay]\ndirect_only = true\n");

    let err = Config::load(Some(&config_path)).unwrap_err();
    assert!(err.to_string().contains("transport.command"));

    std::env::set_var("SIDECAR_COMMAND", "/usr/local/bin/warelay-sidecar");
    let config = Config::load(Some(&config_path)).unwrap();
    assert_eq!(config.transport.command, "/usr/local/bin/warelay-sidecar");

    clear_config_env_vars();
}
