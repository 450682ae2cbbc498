use std::env;
use std::time::Duration;

use jsonwebtoken::Algorithm;

/// Server configuration, assembled once at startup from the process
/// environment. Mirrors [`crate::hub::SessionHub`]'s and [`crate::auth`]'s
/// needs directly rather than going through a generic config crate.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: Environment,
    pub frontend_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_algorithm: Algorithm,
    pub jwt_expiration: Duration,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{0} is not a valid {1}")]
    Invalid(&'static str, &'static str),
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// `JWT_SECRET` is required in production; in development it falls
    /// back to a fixed insecure default so `cargo run` works out of the
    /// box, matching the posture of the system this was adapted from.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = env::var("ENV")
            .map(|v| Environment::parse(&v))
            .unwrap_or(Environment::Development);

        let frontend_url =
            env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("PORT", "u16"))?,
            Err(_) => 8000,
        };

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(secret) => secret,
            Err(_) if env.is_production() => return Err(ConfigError::Missing("JWT_SECRET")),
            Err(_) => {
                tracing::warn!(
                    "JWT_SECRET is not set; falling back to an insecure placeholder secret. Do not run production traffic like this."
                );
                "dev-insecure-secret-do-not-use-in-production".to_string()
            }
        };

        let jwt_algorithm = match env::var("JWT_ALGORITHM") {
            Ok(raw) => parse_algorithm(&raw)?,
            Err(_) => Algorithm::HS256,
        };

        let jwt_expiration_hours: u64 = match env::var("JWT_EXPIRATION") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("JWT_EXPIRATION", "hours (u64)"))?,
            Err(_) => 24,
        };

        let redis_url = env::var("REDIS_URL").ok();

        Ok(Config {
            env,
            frontend_url,
            port,
            jwt_secret,
            jwt_algorithm,
            jwt_expiration: Duration::from_secs(jwt_expiration_hours * 3600),
            redis_url,
        })
    }
}

fn parse_algorithm(raw: &str) -> Result<Algorithm, ConfigError> {
    match raw.to_ascii_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        _ => Err(ConfigError::Invalid("JWT_ALGORITHM", "HS256|HS384|HS512")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parse_defaults_to_development() {
        assert_eq!(Environment::parse("staging"), Environment::Development);
        assert_eq!(Environment::parse("Production"), Environment::Production);
    }

    #[test]
    fn algorithm_parse_rejects_unknown() {
        assert!(parse_algorithm("RS256").is_err());
        assert!(matches!(parse_algorithm("hs512"), Ok(Algorithm::HS512)));
    }
}
