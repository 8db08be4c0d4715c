use std::env;

use event_consumer::{ConfigError, ConsumerConfig};

pub const SERVICE_NAME: &str = "reminder-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Amqp,
    InMemory,
}

impl BusType {
    fn from_value(value: Option<String>) -> Self {
        match value
            .unwrap_or_else(|| "amqp".to_string())
            .to_lowercase()
            .as_str()
        {
            "amqp" | "rabbitmq" => BusType::Amqp,
            "inmemory" => BusType::InMemory,
            other => {
                tracing::warn!(bus_type = other, "Unknown BUS_TYPE, defaulting to amqp");
                BusType::Amqp
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub host: String,
    pub port: u16,
    pub consumer: ConsumerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let consumer = ConsumerConfig::from_lookup(SERVICE_NAME, &lookup)?;
        let bus_type = BusType::from_value(lookup("BUS_TYPE"));
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match lookup("PORT") {
            Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                var: "PORT",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => 8089,
        };

        Ok(Self {
            bus_type,
            host,
            port,
            consumer,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
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
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://db")])).unwrap();
        assert_eq!(config.bus_type, BusType::Amqp);
        assert_eq!(config.bind_addr(), "0.0.0.0:8089");
        assert_eq!(config.consumer.service_name, SERVICE_NAME);
        assert_eq!(config.consumer.queue_name(), "reminder-service.events");
    }

    #[test]
    fn test_overrides_and_errors() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("BUS_TYPE", "InMemory"),
            ("PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(config.bus_type, BusType::InMemory);
        assert_eq!(config.port, 9000);

        let err = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://db"), ("PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PORT", .. }));

        assert_eq!(
            Config::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }
}
