//! Configuration for the authgate enforcement proxy.
//!
//! A single YAML document declares the route table, verification keys, the
//! policy service and the upstreams. It is loaded and validated once at
//! startup; the running gate never sees a partially valid configuration.

pub mod duration_format;
mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ValidationResult, ValidationWarning};
pub use loader::{
    default_config_paths, find_config_file, load_and_validate, load_config, parse_config,
    substitute_env_vars, validate,
};
pub use schema::{
    Access, AuthConfig, Config, CredentialConfig, IamConfig, KeyConfig, RouteConfig,
    SanitizerConfig, UpstreamConfig,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_full_loading_flow() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
schema: 1

auth:
  leeway: 30s
  keys:
    - id: iam-hs
      algorithm: HS256
      secret: s3cr3t

iam:
  url: http://127.0.0.1:8101
  timeout: 250ms

sanitizer:
  allow_headers: [x-forwarded-for]

upstreams:
  iam:
    url: http://127.0.0.1:8101
  exhibitor:
    url: http://127.0.0.1:8181
    strip_prefix: /exhibitor
    credential:
      username: admin
      password: hunter2
  ui:
    url: http://127.0.0.1:8080

unmatched_upstream: ui

routes:
  - path: /exhibitor/*
    access: acl
    resource: dcos:adminrouter:ops:exhibitor
    upstream: exhibitor
  - path: /service/{{serviceName}}/*
    access: acl
    resource: dcos:adminrouter:service:{{serviceName}}
    upstream: ui
  - path: /acs/api/v1/users/{{uid}}/permissions
    access: self_permission
    resource: dcos:iam:users:{{uid}}:permissions
    uid_capture: uid
    others_resource: dcos:adminrouter:acs
    upstream: iam
  - path: /capabilities
    access: authenticated
    resource: dcos:adminrouter:capabilities
    upstream: iam
"#
        )
        .unwrap();

        let path = find_config_file(Some(file.path())).unwrap();
        let (config, result) = load_and_validate(&path).unwrap();

        assert!(result.is_clean(), "unexpected warnings: {:?}", result.warnings);
        assert_eq!(config.routes.len(), 4);
        assert_eq!(config.auth.leeway, std::time::Duration::from_secs(30));
        assert_eq!(config.iam.timeout, std::time::Duration::from_millis(250));
        assert_eq!(config.unmatched_upstream.as_deref(), Some("ui"));
        assert_eq!(
            config.upstreams["exhibitor"].strip_prefix.as_deref(),
            Some("/exhibitor")
        );
        assert_eq!(config.routes[2].access, Access::SelfPermission);
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = CredentialConfig {
            basic: Some("dXNlcjpwYXNz".to_string()),
            username: None,
            password: None,
        };
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("dXNlcjpwYXNz"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
