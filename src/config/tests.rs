use super::*;

fn raw_feature(stale_time_ms: u64, cache_time_ms: u64, retries: u32) -> RawFeaturePolicy {
    RawFeaturePolicy {
        stale_time_ms: Some(stale_time_ms),
        cache_time_ms: Some(cache_time_ms),
        retries: Some(retries),
        ..Default::default()
    }
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.max_entries = 64;
    raw.logging.level = Some("info".to_string());

    let overrides = EngineOverrides {
        cache_max_entries: Some(16),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.engine.cache.max_entries, 16);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.engine.cache, CacheConfig::default());
    assert_eq!(settings.engine.defaults, FeaturePolicy::default());
    assert!(settings.engine.features.is_empty());
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = EngineOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn feature_sections_inherit_defaults() {
    let mut raw = RawSettings::default();
    raw.defaults.timeout_ms = Some(5_000);
    raw.features
        .insert("chat".to_string(), raw_feature(10_000, 60_000, 1));

    let settings = Settings::from_raw(raw).expect("valid settings");
    let chat = settings.engine.policy("chat");

    assert_eq!(chat.stale_time_ms, 10_000);
    assert_eq!(chat.cache_time_ms, 60_000);
    assert_eq!(chat.retries, 1);
    assert_eq!(chat.timeout_ms, Some(5_000));
    assert_eq!(chat.backoff_base_ms, FeaturePolicy::default().backoff_base_ms);
}

#[test]
fn unknown_feature_falls_back_to_defaults() {
    let engine = EngineConfig::default();
    assert_eq!(engine.policy("missing"), &engine.defaults);
}

#[test]
fn stale_time_beyond_cache_time_is_rejected() {
    let mut raw = RawSettings::default();
    raw.features
        .insert("profile".to_string(), raw_feature(60_000, 1_000, 3));

    let error = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(error, LoadError::Invalid { ref key, .. } if key == "features.profile"));
}

#[test]
fn zero_cache_time_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.default_cache_time_ms = 0;

    let error = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(error, LoadError::Invalid { ref key, .. } if key == "cache.default_cache_time_ms"));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { ref key, .. }) if key == "logging.level"
    ));
}

#[test]
fn default_to_check_command() {
    let args = CliArgs::parse_from(["reactive-query"]);
    let command = args.command.unwrap_or_default();
    assert!(matches!(command, Command::Check(_)));
}

#[test]
fn parse_check_overrides() {
    let args = CliArgs::parse_from([
        "reactive-query",
        "--config-file",
        "engine.toml",
        "check",
        "--log-level",
        "warn",
        "--log-json",
        "true",
        "--cache-max-entries",
        "32",
        "--json",
    ]);

    assert_eq!(
        args.config_file.as_deref(),
        Some(std::path::Path::new("engine.toml"))
    );
    let Some(Command::Check(check)) = args.command else {
        panic!("expected check command");
    };
    assert!(check.json);
    assert_eq!(check.overrides.log_level.as_deref(), Some("warn"));
    assert_eq!(check.overrides.log_json, Some(true));
    assert_eq!(check.overrides.cache_max_entries, Some(32));
}

#[test]
fn toml_sources_deserialize_into_settings() {
    let source = r#"
        [cache]
        max_entries = 200

        [defaults]
        retries = 2

        [features.chat]
        stale_time_ms = 1000
        cache_time_ms = 2000
    "#;
    let raw: RawSettings = Config::builder()
        .add_source(File::from_str(source, config::FileFormat::Toml))
        .build()
        .and_then(Config::try_deserialize::<RawSettings>)
        .expect("valid toml");

    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.engine.cache.max_entries, 200);
    assert_eq!(settings.engine.defaults.retries, 2);
    assert_eq!(settings.engine.policy("chat").retries, 2);
    assert_eq!(settings.engine.policy("chat").cache_time_ms, 2_000);
}
