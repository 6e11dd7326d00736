use anyhow::{Context, Result};
use courier_common::LongpollConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Courier service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    // Long-poll HTTP listener bind address.
    pub http_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Pending events buffered in front of the shard task.
    pub shard_queue_depth: usize,
    // Messages retained per channel for resuming subscribers.
    pub store_log_capacity: usize,
    // Subscriber behavior shared by every long-poll location.
    pub longpoll: LongpollConfig,
}

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9090";
const DEFAULT_SHARD_QUEUE_DEPTH: usize = 1024;
const DEFAULT_STORE_LOG_CAPACITY: usize = 1024;
const DEFAULT_SUBSCRIBER_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
struct CourierConfigOverride {
    http_bind: Option<String>,
    metrics_bind: Option<String>,
    shard_queue_depth: Option<usize>,
    store_log_capacity: Option<usize>,
    longpoll: Option<LongpollOverride>,
}

#[derive(Debug, Default, Deserialize)]
struct LongpollOverride {
    multimsg: Option<bool>,
    raw_stream_separator: Option<String>,
    subscriber_timeout_secs: Option<u64>,
    act_as_interval_poll: Option<bool>,
    unsubscribe_url: Option<String>,
}

impl CourierConfig {
    pub fn from_env() -> Result<Self> {
        let http_bind = std::env::var("COURIER_HTTP_BIND")
            .unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_HTTP_BIND")?;
        let metrics_bind = std::env::var("COURIER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_METRICS_BIND")?;
        let shard_queue_depth = std::env::var("COURIER_SHARD_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SHARD_QUEUE_DEPTH);
        let store_log_capacity = std::env::var("COURIER_STORE_LOG_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STORE_LOG_CAPACITY);

        let mut longpoll = LongpollConfig {
            subscriber_timeout_secs: DEFAULT_SUBSCRIBER_TIMEOUT_SECS,
            ..LongpollConfig::default()
        };
        longpoll.multimsg = env_flag("COURIER_LONGPOLL_MULTIMSG").unwrap_or(false);
        if let Ok(value) = std::env::var("COURIER_LONGPOLL_RAW_SEPARATOR") {
            longpoll.use_raw_stream_separator = true;
            longpoll.raw_stream_separator = unescape_separator(&value);
        }
        // Zero is meaningful here: it disables the timeout.
        if let Some(value) = std::env::var("COURIER_SUBSCRIBER_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            longpoll.subscriber_timeout_secs = value;
        }
        longpoll.act_as_interval_poll =
            env_flag("COURIER_LONGPOLL_INTERVAL_POLL").unwrap_or(false);
        longpoll.unsubscribe_url = std::env::var("COURIER_UNSUBSCRIBE_URL")
            .ok()
            .filter(|value| !value.is_empty());

        let config = Self {
            http_bind,
            metrics_bind,
            shard_queue_depth,
            store_log_capacity,
            longpoll,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read COURIER_CONFIG: {path}"))?;
            let override_cfg: CourierConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse courier config yaml")?;
            config.apply(override_cfg)?;
            config.validate()?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: CourierConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.http_bind {
            self.http_bind = value.parse().with_context(|| "parse http_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.shard_queue_depth
            && value > 0
        {
            self.shard_queue_depth = value;
        }
        if let Some(value) = override_cfg.store_log_capacity
            && value > 0
        {
            self.store_log_capacity = value;
        }
        let Some(longpoll) = override_cfg.longpoll else {
            return Ok(());
        };
        if let Some(value) = longpoll.multimsg {
            self.longpoll.multimsg = value;
        }
        if let Some(value) = longpoll.raw_stream_separator {
            self.longpoll.use_raw_stream_separator = true;
            self.longpoll.raw_stream_separator = value;
        }
        if let Some(value) = longpoll.subscriber_timeout_secs {
            self.longpoll.subscriber_timeout_secs = value;
        }
        if let Some(value) = longpoll.act_as_interval_poll {
            self.longpoll.act_as_interval_poll = value;
        }
        if let Some(value) = longpoll.unsubscribe_url {
            self.longpoll.unsubscribe_url = Some(value);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.longpoll
            .validate()
            .with_context(|| "invalid long-poll configuration")
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

// Env values cannot carry raw newlines in most deployments.
fn unescape_separator(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use serial_test::serial;
    use std::io::Write;

    const ALL_VARS: [&str; 10] = [
        "COURIER_HTTP_BIND",
        "COURIER_METRICS_BIND",
        "COURIER_SHARD_QUEUE_DEPTH",
        "COURIER_STORE_LOG_CAPACITY",
        "COURIER_LONGPOLL_MULTIMSG",
        "COURIER_LONGPOLL_RAW_SEPARATOR",
        "COURIER_SUBSCRIBER_TIMEOUT_SECS",
        "COURIER_LONGPOLL_INTERVAL_POLL",
        "COURIER_UNSUBSCRIBE_URL",
        "COURIER_CONFIG",
    ];

    fn clear_env() -> Vec<EnvGuard> {
        ALL_VARS.into_iter().map(EnvGuard::unset).collect()
    }

    #[test]
    #[serial]
    fn defaults_without_env() -> Result<()> {
        let _guards = clear_env();
        let config = CourierConfig::from_env()?;
        assert_eq!(config.http_bind, DEFAULT_HTTP_BIND.parse::<SocketAddr>()?);
        assert_eq!(config.metrics_bind, DEFAULT_METRICS_BIND.parse::<SocketAddr>()?);
        assert_eq!(config.shard_queue_depth, DEFAULT_SHARD_QUEUE_DEPTH);
        assert_eq!(config.longpoll.subscriber_timeout_secs, 30);
        assert!(!config.longpoll.multimsg);
        assert!(!config.longpoll.use_raw_stream_separator);
        assert!(config.longpoll.unsubscribe_url.is_none());
        Ok(())
    }

    #[test]
    #[serial]
    fn env_overrides_longpoll_settings() -> Result<()> {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("COURIER_LONGPOLL_MULTIMSG", "true");
        let _g2 = EnvGuard::set("COURIER_LONGPOLL_RAW_SEPARATOR", "\\r\\n");
        let _g3 = EnvGuard::set("COURIER_SUBSCRIBER_TIMEOUT_SECS", "0");
        let _g4 = EnvGuard::set("COURIER_SHARD_QUEUE_DEPTH", "0");
        let config = CourierConfig::from_env()?;
        assert!(config.longpoll.multimsg);
        assert!(config.longpoll.use_raw_stream_separator);
        assert_eq!(config.longpoll.raw_stream_separator, "\r\n");
        assert!(config.longpoll.subscriber_timeout().is_none());
        // Zero depth falls back to the default.
        assert_eq!(config.shard_queue_depth, DEFAULT_SHARD_QUEUE_DEPTH);
        Ok(())
    }

    #[test]
    #[serial]
    fn empty_raw_separator_is_rejected() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("COURIER_LONGPOLL_MULTIMSG", "1");
        let _g2 = EnvGuard::set("COURIER_LONGPOLL_RAW_SEPARATOR", "");
        assert!(CourierConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn invalid_bind_is_an_error() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("COURIER_HTTP_BIND", "not-an-addr");
        let err = CourierConfig::from_env().expect_err("bad bind");
        assert!(err.to_string().contains("COURIER_HTTP_BIND"));
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() -> Result<()> {
        let _guards = clear_env();
        let dir = std::env::temp_dir();
        let path = dir.join(format!("courier-config-{}.yaml", std::process::id()));
        let mut file = fs::File::create(&path)?;
        writeln!(
            file,
            "http_bind: 127.0.0.1:7000\nstore_log_capacity: 8\nlongpoll:\n  multimsg: true\n  subscriber_timeout_secs: 5\n  unsubscribe_url: /unsub"
        )?;
        let _g1 = EnvGuard::set("COURIER_CONFIG", path.to_str().unwrap_or_default());
        let config = CourierConfig::from_env_or_yaml()?;
        fs::remove_file(&path)?;
        assert_eq!(config.http_bind, "127.0.0.1:7000".parse::<SocketAddr>()?);
        assert_eq!(config.store_log_capacity, 8);
        assert!(config.longpoll.multimsg);
        assert_eq!(config.longpoll.subscriber_timeout_secs, 5);
        assert_eq!(config.longpoll.unsubscribe_url.as_deref(), Some("/unsub"));
        Ok(())
    }

    #[test]
    fn unescape_handles_known_escapes() {
        assert_eq!(unescape_separator("a\\nb"), "a\nb");
        assert_eq!(unescape_separator("\\t"), "\t");
        assert_eq!(unescape_separator("\\x"), "\\x");
        assert_eq!(unescape_separator("end\\"), "end\\");
    }
}
