use serde::Deserialize;

use crate::auth::AuthMethod;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_connections: usize,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub method: AuthMethod,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub listen_addr: String,
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_connections == 0 {
            return Err(anyhow::anyhow!("max_connections must be at least 1"));
        }
        if self.auth.method != AuthMethod::Trust && self.auth.users.is_empty() {
            return Err(anyhow::anyhow!(
                "password authentication enabled but no users configured"
            ));
        }
        for user in &self.auth.users {
            if user.username.is_empty() {
                return Err(anyhow::anyhow!("user with empty username configured"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:5432"
            max_connections = 64

            [auth]
            method = "md5"
            users = [{ username = "postgres", password = "test" }]

            [metrics]
            listen_addr = "127.0.0.1:9898"
            "#,
        )
        .expect("parse");
        assert_eq!(config.auth.method, AuthMethod::Md5);
        assert_eq!(config.server.max_connections, 64);
        assert!(config.server.idle_timeout_secs.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_password_auth_without_users() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:5432"
            max_connections = 64

            [auth]
            method = "cleartext"

            [metrics]
            listen_addr = "127.0.0.1:9898"
            "#,
        )
        .expect("parse");
        assert!(config.validate().is_err());
    }
}
