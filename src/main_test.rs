use super::*;

#[test]
fn test_verbosity_maps_to_filter() {
    assert_eq!(default_filter(0), "info");
    assert_eq!(default_filter(1), "debug");
    assert_eq!(default_filter(5), "trace");
}

#[test]
fn test_run_args_override_environment() {
    let args = RunArgs {
        port: Some(9191),
        workers: Some(1),
        state_file: Some("/tmp/kulku.json".to_string()),
        prometheus_address: None,
        cdevents_sink_url: Some("http://sink:8080".to_string()),
    };
    let config = load_config(&args).unwrap();
    assert_eq!(config.http_port, 9191);
    assert_eq!(config.workers, 1);
    assert_eq!(config.state_file.as_deref(), Some("/tmp/kulku.json"));
    assert!(config.cdevents_enabled);
}
