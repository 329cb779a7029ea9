use std::time::Duration;
use std::{env, fs};

use discord_state_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    // Create a temporary TOML configuration file
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("discord-state.toml");

    let toml_content = r#"
[discord]
token = "file-token"
request_timeout_ms = 2500
event_buffer = 64

[redis]
host = "redis.internal"
port = 6380
password = "hunter2"
db = 3
pool_size = 4

[cache]
guild_ttl_secs = 600
member_absent_ttl_secs = 3600

[logging]
level = "debug"

[metrics]
enabled = true
listen = "127.0.0.1:9100"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.discord.token, "file-token");
    assert_eq!(cfg.discord.rest_config().timeout, Duration::from_millis(2500));
    assert_eq!(cfg.discord.gateway_config().event_buffer, 64);
    assert_eq!(cfg.redis.connection_url(), "redis://:hunter2@redis.internal:6380/3");
    assert_eq!(cfg.logging.level, "debug");
    assert!(cfg.metrics.enabled);

    let ttl = cfg.cache.ttl_policy();
    assert_eq!(ttl.guild, Duration::from_secs(600));
    assert_eq!(ttl.member_absent, Duration::from_secs(3600));
    // Unset values keep their defaults
    assert_eq!(ttl.member, Duration::from_secs(24 * 60 * 60));

    // 2) Env override should win over file
    unsafe {
        env::set_var("DISCORD_STATE__REDIS__PORT", "6390");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.redis.port, 6390);
    unsafe {
        env::remove_var("DISCORD_STATE__REDIS__PORT");
    }

    // 3) Invalid values are rejected
    let bad = dir.path().join("bad.toml");
    fs::write(
        &bad,
        r#"
[discord]
token = "t"

[cache]
user_ttl_secs = 0
"#,
    )
    .expect("write bad toml");
    let err = load_config(bad.to_str()).expect_err("zero ttl must fail validation");
    assert!(err.contains("user_ttl_secs"));

    let bad_level = dir.path().join("bad_level.toml");
    fs::write(
        &bad_level,
        r#"
[discord]
token = "t"

[logging]
level = "loud"
"#,
    )
    .expect("write bad level toml");
    assert!(load_config(bad_level.to_str()).is_err());
}

#[test]
fn missing_file_without_token_fails_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let missing = dir.path().join("absent.toml");
    let err = load_config(missing.to_str()).expect_err("token is required");
    assert!(err.contains("discord.token"));
}
