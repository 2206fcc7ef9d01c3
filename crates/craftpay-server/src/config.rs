//! Server configuration from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use crate::gateway::DarajaConfig;
use crate::scheduler::SchedulerConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DARAJA_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const DEFAULT_SLA_HOURS: u64 = 24;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;
const DEFAULT_GATEWAY_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_CLAIM_TIMEOUT_MINUTES: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Which gateway implementation the server talks to.
#[derive(Debug, Clone)]
pub enum GatewayMode {
    Daraja(DarajaConfig),
    /// In-process mock; every call succeeds. For local development only.
    Mock,
}

/// Timing knobs for the escrow engine. Each is independent.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub gateway_timeout: Duration,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECONDS),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub gateway: GatewayMode,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let database_url = require("DATABASE_URL")?;

        let bind_raw = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "BIND_ADDR",
            value: bind_raw.clone(),
        })?;

        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(name) {
                None => Ok(default),
                Some(raw) => {
                    let parsed = raw.trim().parse::<u64>();
                    match parsed {
                        Ok(n) if n > 0 => Ok(n),
                        _ => Err(ConfigError::Invalid { name, value: raw }),
                    }
                }
            }
        };

        let gateway_timeout = Duration::from_secs(number(
            "GATEWAY_TIMEOUT_SECONDS",
            DEFAULT_GATEWAY_TIMEOUT_SECONDS,
        )?);

        let scheduler = SchedulerConfig {
            interval: Duration::from_secs(number(
                "SWEEP_INTERVAL_SECONDS",
                DEFAULT_SWEEP_INTERVAL_SECONDS,
            )?),
            sla: chrono::Duration::hours(number("AUTO_RELEASE_SLA_HOURS", DEFAULT_SLA_HOURS)? as i64),
            claim_timeout: chrono::Duration::minutes(
                number("CLAIM_TIMEOUT_MINUTES", DEFAULT_CLAIM_TIMEOUT_MINUTES)? as i64,
            ),
        };

        let mode = get("CRAFTPAY_GATEWAY").unwrap_or_else(|| "daraja".to_string());
        let gateway = match mode.to_ascii_lowercase().as_str() {
            "mock" => GatewayMode::Mock,
            "daraja" => GatewayMode::Daraja(DarajaConfig {
                base_url: get("DARAJA_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_DARAJA_BASE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                consumer_key: require("DARAJA_CONSUMER_KEY")?,
                consumer_secret: require("DARAJA_CONSUMER_SECRET")?,
                shortcode: require("DARAJA_SHORTCODE")?,
                passkey: require("DARAJA_PASSKEY")?,
                b2c_shortcode: get("DARAJA_B2C_SHORTCODE")
                    .map(Ok)
                    .unwrap_or_else(|| require("DARAJA_SHORTCODE"))?,
                initiator_name: require("DARAJA_INITIATOR_NAME")?,
                security_credential: require("DARAJA_SECURITY_CREDENTIAL")?,
                callback_url: require("DARAJA_CALLBACK_URL")?,
                result_url: require("DARAJA_RESULT_URL")?,
                queue_timeout_url: get("DARAJA_QUEUE_TIMEOUT_URL")
                    .map(Ok)
                    .unwrap_or_else(|| require("DARAJA_RESULT_URL"))?,
                request_timeout: gateway_timeout,
            }),
            _ => {
                return Err(ConfigError::Invalid {
                    name: "CRAFTPAY_GATEWAY",
                    value: mode,
                })
            }
        };

        Ok(Self {
            database_url,
            bind_addr,
            gateway,
            engine: EngineSettings {
                gateway_timeout,
                scheduler,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const DARAJA_VARS: &[(&str, &str)] = &[
        ("DATABASE_URL", "postgres://localhost/craftpay"),
        ("DARAJA_CONSUMER_KEY", "key"),
        ("DARAJA_CONSUMER_SECRET", "secret"),
        ("DARAJA_SHORTCODE", "174379"),
        ("DARAJA_PASSKEY", "passkey"),
        ("DARAJA_INITIATOR_NAME", "testapi"),
        ("DARAJA_SECURITY_CREDENTIAL", "cred"),
        ("DARAJA_CALLBACK_URL", "https://example.com/api/v1/payments/callback"),
        ("DARAJA_RESULT_URL", "https://example.com/api/v1/payments/result"),
    ];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(DARAJA_VARS)).unwrap();

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.engine.gateway_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.scheduler.interval, Duration::from_secs(300));
        assert_eq!(config.engine.scheduler.sla, chrono::Duration::hours(24));
        assert_eq!(config.engine.scheduler.claim_timeout, chrono::Duration::minutes(15));

        match config.gateway {
            GatewayMode::Daraja(daraja) => {
                assert_eq!(daraja.base_url, DEFAULT_DARAJA_BASE_URL);
                assert_eq!(daraja.b2c_shortcode, "174379");
                assert_eq!(daraja.queue_timeout_url, daraja.result_url);
                assert_eq!(daraja.request_timeout, Duration::from_secs(30));
            }
            GatewayMode::Mock => panic!("expected daraja"),
        }
    }

    #[test]
    fn test_overrides() {
        let mut vars = DARAJA_VARS.to_vec();
        vars.extend([
            ("AUTO_RELEASE_SLA_HOURS", "48"),
            ("SWEEP_INTERVAL_SECONDS", "60"),
            ("GATEWAY_TIMEOUT_SECONDS", "10"),
            ("CLAIM_TIMEOUT_MINUTES", "5"),
            ("BIND_ADDR", "127.0.0.1:9000"),
        ]);
        let config = Config::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.engine.scheduler.sla, chrono::Duration::hours(48));
        assert_eq!(config.engine.scheduler.interval, Duration::from_secs(60));
        assert_eq!(config.engine.gateway_timeout, Duration::from_secs(10));
        assert_eq!(config.engine.scheduler.claim_timeout, chrono::Duration::minutes(5));
    }

    #[test]
    fn test_missing_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));

        let err = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DARAJA_CONSUMER_KEY")));
    }

    #[test]
    fn test_mock_gateway_needs_no_credentials() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("CRAFTPAY_GATEWAY", "mock"),
        ]))
        .unwrap();
        assert!(matches!(config.gateway, GatewayMode::Mock));
    }

    #[test]
    fn test_invalid_numbers() {
        let mut vars = DARAJA_VARS.to_vec();
        vars.push(("SWEEP_INTERVAL_SECONDS", "0"));
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "SWEEP_INTERVAL_SECONDS",
                ..
            }
        ));
    }
}
