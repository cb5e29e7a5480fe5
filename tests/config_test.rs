use wearlink::AppConfig;

#[test]
fn test_config_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wearlink.json");
    let path = path.to_str().unwrap();

    let config = AppConfig {
        initial_capabilities: vec!["voice".to_string(), "camera".to_string()],
        blocking_timeout_ms: 250,
        ..AppConfig::with_data_dir(dir.path().join("data"))
    };
    config.save_to_file(path).unwrap();

    let loaded = AppConfig::load_or_default(Some(path));
    assert_eq!(loaded.initial_capabilities, config.initial_capabilities);
    assert_eq!(loaded.blocking_timeout().as_millis(), 250);
    assert_eq!(loaded.download_dir_path(), dir.path().join("data").join("downloads"));
    assert!(loaded.validate().is_ok());
}

#[test]
fn test_missing_or_corrupt_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    let loaded = AppConfig::load_or_default(missing.to_str());
    assert_eq!(loaded.max_message_bytes, AppConfig::default().max_message_bytes);

    let corrupt = dir.path().join("corrupt.json");
    std::fs::write(&corrupt, "{ not json").unwrap();
    let loaded = AppConfig::load_or_default(corrupt.to_str());
    assert_eq!(loaded.copy_buffer_bytes, AppConfig::default().copy_buffer_bytes);
}

#[test]
fn test_ensure_directories_creates_tree() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::with_data_dir(dir.path().join("nested"));
    config.ensure_directories().unwrap();
    assert!(config.data_dir_path().is_dir());
    assert!(config.download_dir_path().is_dir());
}
