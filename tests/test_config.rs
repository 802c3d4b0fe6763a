//! Tests for configuration layering and validation

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use porthold::config::{DEFAULT_LISTEN, PartialConfig, RestartPolicy};
use porthold::error::ConfigError;
use porthold::proxy::Endpoint;

fn minimal() -> PartialConfig {
    PartialConfig {
        backend: Some("unix:/tmp/app.sock".to_string()),
        command: Some(vec!["node".to_string(), "server.js".to_string()]),
        ..PartialConfig::default()
    }
}

#[test]
fn test_config_defaults() {
    let cfg = minimal().resolve().unwrap();

    assert_eq!(cfg.listen_addr, DEFAULT_LISTEN);
    assert_eq!(cfg.backend, Endpoint::Unix(PathBuf::from("/tmp/app.sock")));
    assert_eq!(cfg.restart_policy, RestartPolicy::OnFailure);
    assert_eq!(cfg.max_restarts, 3);
    assert_eq!(cfg.shutdown_grace, Duration::from_secs(10));
    assert_eq!(cfg.command_line(), "node server.js");
    assert!(cfg.preload.is_none());
}

#[test]
fn test_config_from_yaml() {
    let yaml = r#"
listen: "0.0.0.0:3000"
backend: "127.0.0.1:4312"
command: ["python3", "app.py", "4312"]
env:
  MODE: production
restart_policy: always
max_restarts: 5
startup_timeout_ms: 2000
connect_retry_ms: 750
shutdown_grace_ms: 500
"#;

    let cfg = PartialConfig::from_yaml_str(yaml).unwrap().resolve().unwrap();

    assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    assert_eq!(
        cfg.backend,
        Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 4312
        }
    );
    assert_eq!(cfg.command.len(), 3);
    assert_eq!(cfg.env.get("MODE").map(String::as_str), Some("production"));
    assert_eq!(cfg.restart_policy, RestartPolicy::Always);
    assert_eq!(cfg.max_restarts, 5);
    assert_eq!(cfg.startup_timeout, Duration::from_secs(2));
    assert_eq!(cfg.connect_retry, Duration::from_millis(750));
    assert_eq!(cfg.shutdown_grace, Duration::from_millis(500));
}

#[test]
fn test_config_yaml_rejects_unknown_keys() {
    let err = PartialConfig::from_yaml_str("listen: \"127.0.0.1:1\"\nlisten_addr: x\n").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "backend: /tmp/x.sock").unwrap();
    writeln!(file, "command: [\"sleep\", \"1\"]").unwrap();

    let cfg = PartialConfig::from_file(file.path()).unwrap().resolve().unwrap();
    assert_eq!(cfg.backend, Endpoint::Unix(PathBuf::from("/tmp/x.sock")));
}

#[test]
fn test_config_missing_file() {
    let err = PartialConfig::from_file(std::path::Path::new("/nonexistent/porthold.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_config_from_vars() {
    let vars = vec![
        ("PORTHOLD_LISTEN", "127.0.0.1:9999"),
        ("PORTHOLD_RESTART_POLICY", "never"),
        ("PORTHOLD_MAX_RESTARTS", "7"),
        ("PORTHOLD_SHUTDOWN_GRACE_MS", "250"),
        ("UNRELATED", "ignored"),
    ];

    let partial = PartialConfig::from_vars(vars).unwrap();
    assert_eq!(partial.listen.as_deref(), Some("127.0.0.1:9999"));
    assert_eq!(partial.restart_policy, Some(RestartPolicy::Never));
    assert_eq!(partial.max_restarts, Some(7));
    assert_eq!(partial.shutdown_grace_ms, Some(250));
    assert!(partial.backend.is_none());
}

#[test]
fn test_config_from_vars_rejects_bad_numbers() {
    let err = PartialConfig::from_vars([("PORTHOLD_MAX_RESTARTS", "lots")]).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "max_restarts", .. }));
}

#[test]
fn test_config_merge_priority() {
    let file = PartialConfig {
        listen: Some("0.0.0.0:1000".to_string()),
        max_restarts: Some(1),
        env: [("A".to_string(), "file".to_string()), ("B".to_string(), "file".to_string())]
            .into_iter()
            .collect(),
        ..minimal()
    };
    let env = PartialConfig {
        listen: Some("0.0.0.0:2000".to_string()),
        ..PartialConfig::default()
    };
    let cli = PartialConfig {
        max_restarts: Some(9),
        env: [("B".to_string(), "cli".to_string())].into_iter().collect(),
        ..PartialConfig::default()
    };

    let cfg = file.merge(env).merge(cli).resolve().unwrap();

    assert_eq!(cfg.listen_addr, "0.0.0.0:2000");
    assert_eq!(cfg.max_restarts, 9);
    assert_eq!(cfg.env.get("A").map(String::as_str), Some("file"));
    assert_eq!(cfg.env.get("B").map(String::as_str), Some("cli"));
    // untouched by later layers
    assert_eq!(cfg.command_line(), "node server.js");
}

#[test]
fn test_config_empty_command_does_not_override() {
    let cli = PartialConfig {
        command: Some(vec![]),
        ..PartialConfig::default()
    };
    let cfg = minimal().merge(cli).resolve().unwrap();
    assert_eq!(cfg.command[0], "node");
}

#[test]
fn test_config_requires_backend_and_command() {
    let no_backend = PartialConfig {
        backend: None,
        ..minimal()
    };
    assert!(matches!(no_backend.resolve(), Err(ConfigError::Missing("backend"))));

    let no_command = PartialConfig {
        command: None,
        ..minimal()
    };
    assert!(matches!(no_command.resolve(), Err(ConfigError::Missing("command"))));
}

#[test]
fn test_config_rejects_invalid_values() {
    let bad_listen = PartialConfig {
        listen: Some("8080".to_string()),
        ..minimal()
    };
    assert!(matches!(bad_listen.resolve(), Err(ConfigError::Invalid { field: "listen", .. })));

    let bad_backend = PartialConfig {
        backend: Some("ftp://host:21".to_string()),
        ..minimal()
    };
    assert!(matches!(bad_backend.resolve(), Err(ConfigError::Endpoint { .. })));

    let zero_timeout = PartialConfig {
        startup_timeout_ms: Some(0),
        ..minimal()
    };
    assert!(zero_timeout.resolve().is_err());

    let missing_preload = PartialConfig {
        preload: Some(PathBuf::from("/nonexistent/libhook.so")),
        ..minimal()
    };
    assert!(matches!(missing_preload.resolve(), Err(ConfigError::Invalid { field: "preload", .. })));
}

#[test]
fn test_config_preload_hook_needs_intercept_port_for_unix_backend() {
    let library = tempfile::NamedTempFile::new().unwrap();

    let without_port = PartialConfig {
        preload: Some(library.path().to_path_buf()),
        ..minimal()
    };
    assert!(matches!(without_port.resolve(), Err(ConfigError::Missing("intercept_port"))));

    let yaml = format!(
        "backend: unix:/tmp/app.sock\ncommand: [node, server.js]\npreload: {}\nintercept_port: 3000\n",
        library.path().display()
    );
    let cfg = PartialConfig::from_yaml_str(&yaml).unwrap().resolve().unwrap();
    assert_eq!(cfg.intercept_port, Some(3000));
    assert!(cfg.launch_env().contains(&("PORTHOLD_PORT".to_string(), "3000".to_string())));
}

#[test]
fn test_config_intercept_port_from_vars() {
    let partial = PartialConfig::from_vars([("PORTHOLD_INTERCEPT_PORT", "4000")]).unwrap();
    assert_eq!(partial.intercept_port, Some(4000));

    let err = PartialConfig::from_vars([("PORTHOLD_INTERCEPT_PORT", "70000")]).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "intercept_port", .. }));
}
