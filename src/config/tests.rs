use std::time::Duration;

use serial_test::serial;

use super::*;
use crate::balancer::Strategy;

#[test]
fn defaults_are_sane() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.cache.max_entries, 1000);
    assert_eq!(config.cache.default_ttl, Duration::from_secs(3600));
    assert_eq!(config.cache.cleanup_interval, Duration::from_secs(300));
    assert_eq!(config.balancer.strategy, Strategy::RoundRobin);
    assert_eq!(config.memory.max_tokens, 300);
    assert_eq!(config.memory.importance_threshold, 0.5);
    assert_eq!(config.vector_dimension, 384);
    assert_eq!(config.dispatcher.default_timeout, Duration::from_secs(30));
    assert_eq!(config.probe_interval, Duration::from_secs(1));
    assert!(!config.router_variants.is_empty());
}

#[test]
fn derived_paths_live_under_data_dir() {
    let config = Config::default();
    assert!(config.experience_log_path().ends_with("experience.log"));
    assert!(config.vector_index_path().ends_with("vector.index"));
}

#[test]
fn variant_list_parses_triples() {
    let variants =
        parse_variants("big|10737418240|0.9, small|3221225472|0.5").expect("valid triples");
    assert_eq!(variants.len(), 2);
    assert_eq!(variants[0].name, "big");
    assert_eq!(variants[0].min_ram_bytes, 10_737_418_240);
    assert_eq!(variants[1].quality_score, 0.5);
}

#[test]
fn variant_list_rejects_malformed_fragments() {
    assert!(parse_variants("just-a-name").is_err());
    assert!(parse_variants("name|not-a-number|0.5").is_err());
    assert!(parse_variants("").is_err());
}

#[test]
fn validation_rejects_zero_workers() {
    let mut config = Config::default();
    config.dispatcher.parallel_workers = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid { .. })
    ));
}

#[test]
fn validation_rejects_out_of_range_threshold() {
    let mut config = Config::default();
    config.memory.importance_threshold = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn validation_rejects_zero_dimension() {
    let mut config = Config::default();
    config.vector_dimension = 0;
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn environment_overrides_apply() {
    // All overrides in one test: the process environment is shared state.
    unsafe {
        std::env::set_var("AGENTD_CACHE_MAX_ENTRIES", "42");
        std::env::set_var("AGENTD_BALANCER_STRATEGY", "least_inflight");
        std::env::set_var("AGENTD_MEMORY_MAX_TOKENS", "512");
        std::env::set_var("AGENTD_DISPATCHER_DEFAULT_TIMEOUT_SECS", "5");
        std::env::set_var("AGENTD_ROUTER_VARIANTS", "only|1073741824|0.8");
    }

    let config = Config::from_env().expect("overrides parse");
    assert_eq!(config.cache.max_entries, 42);
    assert_eq!(config.balancer.strategy, Strategy::LeastInflight);
    assert_eq!(config.memory.max_tokens, 512);
    assert_eq!(config.dispatcher.default_timeout, Duration::from_secs(5));
    assert_eq!(config.router_variants.len(), 1);
    assert_eq!(config.router_variants[0].name, "only");

    unsafe {
        std::env::remove_var("AGENTD_CACHE_MAX_ENTRIES");
        std::env::remove_var("AGENTD_BALANCER_STRATEGY");
        std::env::remove_var("AGENTD_MEMORY_MAX_TOKENS");
        std::env::remove_var("AGENTD_DISPATCHER_DEFAULT_TIMEOUT_SECS");
        std::env::remove_var("AGENTD_ROUTER_VARIANTS");
    }
}

#[test]
#[serial]
fn malformed_strategy_fails_loudly() {
    unsafe {
        std::env::set_var("AGENTD_BALANCER_STRATEGY", "fastest-please");
    }
    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidStrategy { .. }));
    unsafe {
        std::env::remove_var("AGENTD_BALANCER_STRATEGY");
    }
}
