use std::io::Write;

use gamenet::{AppError, AppResult, BackendKind, ServerConfig};
use tempfile::NamedTempFile;

fn config_file(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("gamenet")
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_full_config_file() -> AppResult<()> {
    let file = config_file(
        r#"
[network]
ip = "127.0.0.1"
port = 9100
max_connection = 16
nodelay = false

[buffers]
read_buffer_size = 70000
write_buffer_size = 262144

[multiplexer]
backend = "poll"
workers = 2
poll_timeout_ms = 20
shutdown_timeout_ms = 1000
"#,
    );
    let config = ServerConfig::set_up_config(file.path())?;
    assert_eq!(config.listen_address(), "127.0.0.1:9100");
    assert_eq!(config.network.max_connection, 16);
    assert!(!config.network.nodelay);
    assert_eq!(config.buffers.read_buffer_size, 70000);
    assert_eq!(config.multiplexer.backend, BackendKind::Poll);
    assert_eq!(config.worker_count(), 2);
    Ok(())
}

#[test]
fn test_missing_sections_use_defaults() -> AppResult<()> {
    let file = config_file(
        r#"
[network]
port = 7000
"#,
    );
    let config = ServerConfig::set_up_config(file.path())?;
    let defaults = ServerConfig::default();
    assert_eq!(config.network.port, 7000);
    assert_eq!(config.network.ip, defaults.network.ip);
    assert_eq!(config.buffers, defaults.buffers);
    assert_eq!(config.multiplexer.backend, BackendKind::Auto);
    Ok(())
}

#[test]
fn test_too_small_read_buffer_is_rejected() {
    let file = config_file(
        r#"
[buffers]
read_buffer_size = 4096
"#,
    );
    assert!(matches!(
        ServerConfig::set_up_config(file.path()),
        Err(AppError::InvalidValue(_))
    ));
}

#[test]
fn test_unknown_backend_is_rejected() {
    let file = config_file(
        r#"
[multiplexer]
backend = "select"
"#,
    );
    assert!(matches!(
        ServerConfig::set_up_config(file.path()),
        Err(AppError::ConfigFileError(_))
    ));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(ServerConfig::set_up_config(path).is_err());
}

#[test]
fn test_environment_overrides_file() -> AppResult<()> {
    let file = config_file(
        r#"
[multiplexer]
shutdown_timeout_ms = 1500
"#,
    );
    std::env::set_var("GAMENET__MULTIPLEXER__SHUTDOWN_TIMEOUT_MS", "250");
    let config = ServerConfig::set_up_config(file.path());
    std::env::remove_var("GAMENET__MULTIPLEXER__SHUTDOWN_TIMEOUT_MS");
    assert_eq!(config?.multiplexer.shutdown_timeout_ms, 250);
    Ok(())
}
