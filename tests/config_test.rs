use plug_dutycycle::Config;
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn example() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/config.example.yaml")
}

#[test]
#[serial]
fn test_example_config_loads() {
    std::env::remove_var("PLUG_TARGETS");
    std::env::remove_var("CHECKPOINT_FILE");
    std::env::set_var("CHECKPOINT_DIR", "/var/lib/dutycycle");

    let cfg = Config::load(example()).unwrap();
    cfg.validate().unwrap();

    let c = &cfg.collector;
    assert_eq!(c.targets, vec!["192.168.1.50", "192.168.1.51:9999"]);
    assert_eq!(c.interval(), Duration::from_secs(60));
    assert_eq!(c.checkpoint_max_age(), Duration::from_secs(3600));
    assert_eq!(c.threshold_watts, 5.0);
    assert_eq!(
        c.checkpoint_file.as_deref(),
        Some(Path::new("/var/lib/dutycycle/dutycycle.json"))
    );
    assert!(c.checkpoint_on_shutdown);
    assert_eq!(c.query_timeout(), Some(Duration::from_secs(10)));
    assert_eq!(cfg.http.listen_address, "0.0.0.0:8080");
    assert_eq!(cfg.device.default_port, 9999);

    std::env::remove_var("CHECKPOINT_DIR");
}

#[test]
#[serial]
fn test_env_overrides_example_targets() {
    std::env::set_var("CHECKPOINT_DIR", "/tmp");
    std::env::set_var("PLUG_TARGETS", "10.1.1.1, 10.1.1.2");
    std::env::set_var("CHECKPOINT_FILE", "");

    let cfg = Config::load(example()).unwrap();
    assert_eq!(cfg.collector.targets, vec!["10.1.1.1", "10.1.1.2"]);
    assert!(cfg.collector.checkpoint_file.is_none());

    std::env::remove_var("PLUG_TARGETS");
    std::env::remove_var("CHECKPOINT_FILE");
    std::env::remove_var("CHECKPOINT_DIR");
}
