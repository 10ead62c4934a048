use std::fs;
use std::path::Path;

use http::Uri;

use crate::config::{CacheBackend, Config, GuardConfig, ServiceConfig};
use crate::error::{ProxyError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| ProxyError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| ProxyError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.services.is_empty() {
        return Err(ProxyError::NoServices);
    }

    for (idx, service) in cfg.services.iter().enumerate() {
        validate_service(idx, service)?;
    }

    match cfg.cache.backend {
        CacheBackend::File if cfg.cache.file_root.is_none() => {
            return Err(ProxyError::Config("File cache requires cache.file_root".to_string()));
        }
        CacheBackend::Redis if cfg.cache.redis.is_none() => {
            return Err(ProxyError::Config("Redis cache requires [cache.redis]".to_string()));
        }
        _ => {}
    }

    let bw = &cfg.botwatch;
    if bw.watched_time_window_secs == 0 || bw.num_requests_threshold == 0 {
        return Err(ProxyError::Config(
            "botwatch window and request threshold must be > 0".to_string(),
        ));
    }
    if bw.rsd_threshold <= 0.0 || bw.queue_capacity == 0 {
        return Err(ProxyError::Config(
            "botwatch rsd_threshold and queue_capacity must be > 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_service(idx: usize, service: &ServiceConfig) -> Result<()> {
    let name = service.service_path(idx);
    if service.service_type.is_empty() || service.service_type.contains('/') {
        return Err(ProxyError::Config(format!(
            "Service {idx} has an invalid type: {:?}",
            service.service_type
        )));
    }
    validate_url(&name, "internal_url", &service.internal_url, false)?;
    if let Some(url) = &service.external_url {
        validate_url(&name, "external_url", url, true)?;
    }
    if let Some(login) = &service.login {
        validate_url(&name, "login.url", &login.url, false)?;
        if login.fallback_token.as_deref() == Some("") {
            return Err(ProxyError::Config(format!(
                "{name}: login.fallback_token cannot be empty"
            )));
        }
    }
    for limit in &service.limits {
        if limit.req_per_time_threshold == 0 || limit.req_checking_interval_secs == 0 {
            return Err(ProxyError::Config(format!(
                "{name}: limit threshold and checking interval must be > 0"
            )));
        }
    }
    if let GuardConfig::Token { header, tokens, .. } = &service.guard {
        if header.is_empty() {
            return Err(ProxyError::Config(format!("{name}: token guard header cannot be empty")));
        }
        if tokens.is_empty() {
            return Err(ProxyError::Config(format!("{name}: token guard requires tokens")));
        }
        if let Some(bad) = tokens
            .iter()
            .find(|t| t.value.len() != 64 || !t.value.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(ProxyError::Config(format!(
                "{name}: token of user {} is not a SHA-256 hex digest",
                bad.user_id
            )));
        }
    }
    Ok(())
}

/// Backend facing URLs must be plain http, public ones may use https.
fn validate_url(service: &str, field: &str, url: &str, allow_https: bool) -> Result<()> {
    let uri: Uri = url
        .parse()
        .map_err(|e| ProxyError::Config(format!("{service}: invalid {field} {url:?}: {e}")))?;
    let scheme_ok = match uri.scheme_str() {
        Some("http") => true,
        Some("https") => allow_https,
        _ => false,
    };
    if !scheme_ok {
        return Err(ProxyError::Config(format!("{service}: unsupported scheme in {field}")));
    }
    if uri.authority().is_none() {
        return Err(ProxyError::Config(format!("{service}: {field} has no host")));
    }
    Ok(())
}
