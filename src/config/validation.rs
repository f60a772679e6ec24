//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::{Config, RouterMode};
use imgate_proto::DiscoveryType;
use imgate_proto::action::is_valid;
use std::collections::HashSet;
use thiserror::Error;

/// Smallest accepted `limits.max_frame_bytes`.
pub const MIN_FRAME_BYTES: usize = 1024;

/// Validation errors for configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("server.node_id is required")]
    MissingNodeId,
    #[error("limits.outbound_capacity must be at least 1")]
    ZeroOutboundCapacity,
    #[error("limits.registry_shards must be at least 1")]
    ZeroShards,
    #[error("limits.max_frame_bytes must be at least {MIN_FRAME_BYTES}, got {0}")]
    FrameTooSmall(usize),
    #[error("router.remote_address is required when router.mode = \"remote\"")]
    RemoteRouterWithoutAddress,
    #[error("router.call_timeout_ms must be at least 1")]
    ZeroCallTimeout,
    #[error("discovery.lease_ttl_secs must be at least 1")]
    ZeroLeaseTtl,
    #[error("gateway.auth_action is not a dotted action: '{0}'")]
    InvalidAuthAction(String),
    #[error("invalid service or namespace name: '{0}'")]
    InvalidServiceName(String),
    #[error("service '{0}' is declared more than once")]
    DuplicateService(String),
    #[error("static service '{0}' has no endpoints")]
    StaticServiceWithoutEndpoints(String),
    #[error("backend '{name}' uses unknown handler '{handler}'")]
    UnknownBackendHandler { name: String, handler: String },
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // Required fields
    if config.server.name.is_empty() {
        errors.push(ValidationError::MissingServerName);
    }
    if config.server.node_id.is_empty() {
        errors.push(ValidationError::MissingNodeId);
    }

    // Limits
    if config.limits.outbound_capacity == 0 {
        errors.push(ValidationError::ZeroOutboundCapacity);
    }
    if config.limits.registry_shards == 0 {
        errors.push(ValidationError::ZeroShards);
    }
    if config.limits.max_frame_bytes < MIN_FRAME_BYTES {
        errors.push(ValidationError::FrameTooSmall(config.limits.max_frame_bytes));
    }

    // Router and discovery
    if config.router.mode == RouterMode::Remote
        && config.router.remote_address.as_deref().is_none_or(str::is_empty)
    {
        errors.push(ValidationError::RemoteRouterWithoutAddress);
    }
    if config.router.call_timeout_ms == 0 {
        errors.push(ValidationError::ZeroCallTimeout);
    }
    if config.discovery.lease_ttl_secs == 0 {
        errors.push(ValidationError::ZeroLeaseTtl);
    }
    if !is_valid(&config.gateway.auth_action) {
        errors.push(ValidationError::InvalidAuthAction(
            config.gateway.auth_action.clone(),
        ));
    }

    // Service names are unique across [[services]] and [[backends]]
    let mut seen = HashSet::new();
    let names = config
        .services
        .iter()
        .map(|s| (&s.name, &s.namespaces))
        .chain(config.backends.iter().map(|b| (&b.name, &b.namespaces)));
    for (name, namespaces) in names {
        for ns in std::iter::once(name).chain(namespaces) {
            if !is_valid(ns) {
                errors.push(ValidationError::InvalidServiceName(ns.clone()));
            }
        }
        if !seen.insert(name.as_str()) {
            errors.push(ValidationError::DuplicateService(name.clone()));
        }
    }

    for service in &config.services {
        if service.discovery == DiscoveryType::Static && service.endpoints.is_empty() {
            errors.push(ValidationError::StaticServiceWithoutEndpoints(
                service.name.clone(),
            ));
        }
    }

    for backend in &config.backends {
        if crate::services::builtin(&backend.handler, &backend.name).is_none() {
            errors.push(ValidationError::UnknownBackendHandler {
                name: backend.name.clone(),
                handler: backend.handler.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[server]
name = "gw1"
node_id = "gw1"

[listen]
address = "127.0.0.1:0"
"#;

    #[test]
    fn minimal_config_is_valid() {
        let config = Config::parse(MINIMAL).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.outbound_capacity, 256);
        assert_eq!(config.router.call_timeout_ms, 3000);
        assert_eq!(config.gateway.auth_action, "api.auth.signin");
        assert!(config.listen.rpc.is_none());
    }

    #[test]
    fn collects_every_error() {
        let text = format!(
            "{MINIMAL}
[limits]
outbound_capacity = 0
max_frame_bytes = 10

[router]
mode = \"remote\"

[[services]]
name = \"api\"
discovery = \"static\"

[[backends]]
name = \"api\"
handler = \"nope\"
"
        );
        let config = Config::parse(&text).unwrap();
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&ValidationError::ZeroOutboundCapacity));
        assert!(errors.contains(&ValidationError::FrameTooSmall(10)));
        assert!(errors.contains(&ValidationError::RemoteRouterWithoutAddress));
        assert!(errors.contains(&ValidationError::StaticServiceWithoutEndpoints("api".into())));
        assert!(errors.contains(&ValidationError::DuplicateService("api".into())));
        assert!(errors.contains(&ValidationError::UnknownBackendHandler {
            name: "api".into(),
            handler: "nope".into(),
        }));
    }

    #[test]
    fn rejects_bad_names() {
        let text = format!(
            "{MINIMAL}
[[services]]
name = \"api..x\"
discovery = \"static\"
endpoints = [\"127.0.0.1:1\"]
namespaces = [\"\"]
"
        );
        let errors = Config::parse(&text).unwrap().validate().unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::InvalidServiceName("api..x".into()),
                ValidationError::InvalidServiceName(String::new()),
            ]
        );
    }

    #[test]
    fn parses_service_blocks() {
        let text = format!(
            "{MINIMAL}
[[services]]
name = \"im\"
policy = \"consistent_hash\"
discovery = \"static\"
endpoints = [\"127.0.0.1:9001\", \"127.0.0.1:9002\"]

[[backends]]
name = \"api\"
handler = \"echo\"
"
        );
        let config = Config::parse(&text).unwrap();
        config.validate().unwrap();
        let req = config.services[0].to_request();
        assert_eq!(req.srv_id, "im");
        assert_eq!(req.route_policy, imgate_proto::RoutePolicy::ConsistentHash);
        assert_eq!(req.discovery_srv_url.len(), 2);
        assert_eq!(config.backends[0].address.port(), 0);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.name, "gw1");
        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(super::super::ConfigError::Io(_))
        ));
    }
}
