use super::*;
use crate::cache::CacheConfig;

fn key_args(extra: &[&str]) -> CliArgs {
    let mut argv = vec![
        "pagecache",
        "key",
        "--host",
        "example1.com",
        "--path",
        "/foo/",
    ];
    argv.extend_from_slice(extra);
    CliArgs::parse_from(argv)
}

#[test]
fn defaults_match_cache_config_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let from_settings = CacheConfig::from(&settings.cache);
    let defaults = CacheConfig::default();

    assert_eq!(from_settings.cookie_name, defaults.cookie_name);
    assert_eq!(from_settings.ttl_seconds, defaults.ttl_seconds);
    assert_eq!(from_settings.minify_html, defaults.minify_html);
    assert_eq!(from_settings.use_lookup_table, defaults.use_lookup_table);
    assert_eq!(
        from_settings.include_secure_requests,
        defaults.include_secure_requests
    );
    assert_eq!(from_settings.key_prefix, defaults.key_prefix);
    assert_eq!(from_settings.memory_store_limit, defaults.memory_store_limit);
    assert_eq!(from_settings.max_body_bytes, defaults.max_body_bytes);
}

#[test]
fn default_settings() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert!(settings.database.url.is_none());
    assert_eq!(settings.database.max_connections.get(), 8);
    assert_eq!(settings.cache.cookie_name, "pv");
    assert_eq!(settings.cache.ttl, Duration::from_secs(86_400));
    assert!(settings.cache.include_secure_requests);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.cache.cookie_name = Some("fromfile".to_string());

    let args = key_args(&["--cookie-name", "fromcli", "--key-prefix", "edge"]);
    let Command::Key(key) = &args.command else {
        panic!("expected key command");
    };
    raw.apply_key_overrides(key);
    raw.apply_logging_overrides(&LoggingOverrides {
        log_level: Some("debug".to_string()),
        log_json: None,
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.cookie_name, "fromcli");
    assert_eq!(settings.cache.key_prefix, "edge");
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.apply_logging_overrides(&LoggingOverrides {
        log_level: None,
        log_json: Some(true),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn blank_database_url_is_ignored() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn zero_pool_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.database.max_connections = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero pool");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "database.max_connections",
            ..
        }
    ));
}

#[test]
fn cookie_name_must_be_a_token() {
    for bad in ["", "  ", "page version", "pv;", "a=b"] {
        let mut raw = RawSettings::default();
        raw.cache.cookie_name = Some(bad.to_string());
        let err = Settings::from_raw(raw).expect_err("invalid cookie name");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "cache.cookie_name",
                ..
            }
        ));
    }
}

#[test]
fn zero_ttl_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.ttl_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero ttl");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.ttl_seconds",
            ..
        }
    ));
}

#[test]
fn memory_store_limit_is_clamped() {
    let mut raw = RawSettings::default();
    raw.cache.memory_store_limit = Some(0);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.memory_store_limit, 1);
}

#[test]
fn parse_key_arguments() {
    let args = key_args(&["--page-version", "3", "--json"]);

    match args.command {
        Command::Key(key) => {
            assert_eq!(key.host, "example1.com");
            assert_eq!(key.path, "/foo/");
            assert_eq!(key.page_version, "3");
            assert!(key.cookie_name.is_none());
            assert!(key.json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn page_version_defaults_to_empty() {
    let args = key_args(&[]);
    let Command::Key(key) = args.command else {
        panic!("expected key command");
    };
    assert_eq!(key.page_version, "");
}

#[test]
fn parse_records_arguments() {
    let args = CliArgs::parse_from([
        "pagecache",
        "records",
        "testsite",
        "--supplementary",
        "category-1",
        "--database-url",
        "postgres://example",
    ]);

    match args.command {
        Command::Records(records) => {
            assert_eq!(records.lookup_identifier, "testsite");
            assert_eq!(
                records.supplementary_identifier.as_deref(),
                Some("category-1")
            );
            assert_eq!(
                records.database.database_url.as_deref(),
                Some("postgres://example")
            );
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_migrate_with_global_logging_flags() {
    let args = CliArgs::parse_from([
        "pagecache",
        "migrate",
        "--database-url",
        "postgres://example",
        "--log-level",
        "warn",
        "--log-json",
        "true",
    ]);

    assert_eq!(args.logging.log_level.as_deref(), Some("warn"));
    assert_eq!(args.logging.log_json, Some(true));
    assert!(matches!(args.command, Command::Migrate(_)));
}

#[test]
#[serial_test::serial]
fn load_reads_explicit_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("custom.toml");
    std::fs::write(
        &path,
        "[cache]\ncookie_name = \"variant\"\nuse_lookup_table = true\n\n[database]\nmax_connections = 3\n",
    )
    .expect("write config");

    let mut args = key_args(&[]);
    args.config_file = Some(path);
    let settings = load(&args).expect("settings");

    assert_eq!(settings.cache.cookie_name, "variant");
    assert!(settings.cache.use_lookup_table);
    assert_eq!(settings.database.max_connections.get(), 3);
}

#[test]
#[serial_test::serial]
fn environment_overrides_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("custom.toml");
    std::fs::write(&path, "[cache]\ncookie_name = \"fromfile\"\nttl_seconds = 60\n")
        .expect("write config");

    let mut args = key_args(&[]);
    args.config_file = Some(path);

    // SAFETY: serialised with every other test touching the environment.
    unsafe { std::env::set_var("PAGECACHE__CACHE__COOKIE_NAME", "fromenv") };
    let result = load(&args);
    unsafe { std::env::remove_var("PAGECACHE__CACHE__COOKIE_NAME") };

    let settings = result.expect("settings");
    assert_eq!(settings.cache.cookie_name, "fromenv");
    assert_eq!(settings.cache.ttl, Duration::from_secs(60));
}
