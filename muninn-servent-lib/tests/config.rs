use muninn_servent_lib::EngineConfig;

#[test]
fn empty_table_yields_defaults() {
    let cfg: EngineConfig = toml::from_str("").unwrap();
    assert_eq!(cfg.connect_ms, 30_000);
    assert_eq!(cfg.exchange_ms, 60_000);
    assert_eq!(cfg.sweep_ms, 1000);
    assert_eq!(cfg.max_header_bytes, 16 * 1024);
    assert!(cfg.user_agent.starts_with("muninn/"));
}

#[test]
fn partial_tables_override_selectively() {
    let cfg: EngineConfig = toml::from_str(
        r#"
exchange_ms = 120000
user_agent = "muninn/9.9 (test)"
"#,
    )
    .unwrap();
    assert_eq!(cfg.connect_ms, 30_000);
    assert_eq!(cfg.exchange_ms, 120_000);
    assert_eq!(cfg.user_agent, "muninn/9.9 (test)");
}

#[test]
fn durations_are_derived_from_millis() {
    let cfg = EngineConfig::default();
    assert_eq!(cfg.connect_timeout().as_millis(), 30_000);
    assert_eq!(cfg.exchange_timeout().as_millis(), 60_000);
    assert_eq!(cfg.sweep_interval().as_millis(), 1000);
}
