use serde::Deserialize;

fn default_server_port() -> u16 {
    8000
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    pub database_url: String,
    /// Public origin used when building referral URLs.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}
