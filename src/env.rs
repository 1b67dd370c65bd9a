// src/env.rs
// Environment overrides on top of file configuration.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;

use crate::config::RpcSettings;

pub const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USERNAME: &str = "RABBITMQ_USERNAME";
pub const RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_EXCHANGE: &str = "RABBITMQ_EXCHANGE";
pub const RABBITMQ_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const RPC_TIMEOUT_SECONDS: &str = "RPC_TIMEOUT_SECONDS";

/// Apply overrides from the process environment (and `.env`, if present).
pub fn apply_overrides(settings: &mut RpcSettings) -> Result<()> {
    dotenv().ok();
    apply_with(settings, |key| env::var(key).ok())
}

/// Apply overrides read through `lookup`; unset or empty values are skipped.
pub fn apply_with<F>(settings: &mut RpcSettings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(host) = get(RABBITMQ_HOST) {
        settings.host = host;
    }
    if let Some(port) = get(RABBITMQ_PORT) {
        settings.port = parse(RABBITMQ_PORT, &port)?;
    }
    if let Some(username) = get(RABBITMQ_USERNAME) {
        settings.username = username;
    }
    if let Some(password) = get(RABBITMQ_PASSWORD) {
        settings.password = password;
    }
    if let Some(vhost) = get(RABBITMQ_VHOST) {
        settings.vhost = vhost;
    }
    if let Some(exchange) = get(RABBITMQ_EXCHANGE) {
        settings.exchange = exchange;
    }
    if let Some(prefetch) = get(RABBITMQ_PREFETCH_COUNT) {
        settings.prefetch_count = parse(RABBITMQ_PREFETCH_COUNT, &prefetch)?;
    }
    if let Some(timeout) = get(RPC_TIMEOUT_SECONDS) {
        settings.reply_timeout_secs = parse(RPC_TIMEOUT_SECONDS, &timeout)?;
    }

    Ok(())
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Environment variable {key} has invalid value '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut settings = RpcSettings::default();
        apply_with(
            &mut settings,
            lookup(&[
                (RABBITMQ_HOST, "rabbitmq"),
                (RABBITMQ_PORT, "5673"),
                (RABBITMQ_PREFETCH_COUNT, "20"),
                (RPC_TIMEOUT_SECONDS, "15"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.host, "rabbitmq");
        assert_eq!(settings.port, 5673);
        assert_eq!(settings.prefetch_count, 20);
        assert_eq!(settings.reply_timeout_secs, 15);
        assert_eq!(settings.username, "guest");
    }

    #[test]
    fn test_empty_values_are_ignored() {
        let mut settings = RpcSettings::default();
        apply_with(&mut settings, lookup(&[(RABBITMQ_HOST, "  ")])).unwrap();
        assert_eq!(settings.host, "localhost");
    }

    #[test]
    fn test_invalid_number_names_the_variable() {
        let mut settings = RpcSettings::default();
        let err = apply_with(&mut settings, lookup(&[(RABBITMQ_PORT, "amqp")])).unwrap_err();
        assert!(err.to_string().contains(RABBITMQ_PORT));
    }
}
