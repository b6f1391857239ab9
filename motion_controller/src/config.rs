use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug)]
pub struct Config {
    pub gateway_host: String,
    pub gateway_port: u16,

    pub response_timeout_ms: u64,
    pub step_timeout_ms: u64,
    pub monitor_period_ms: u64,

    pub tool_retry_count: u32,
    pub tool_ready_wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_host: "192.168.6.1".to_string(),
            gateway_port: 9999,

            response_timeout_ms: 500,
            step_timeout_ms: 60_000,
            monitor_period_ms: 250,

            tool_retry_count: 5,
            tool_ready_wait_ms: 1_000,
        }
    }
}

impl Config {
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.gateway_host, self.gateway_port)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }

    pub fn tool_ready_wait(&self) -> Duration {
        Duration::from_millis(self.tool_ready_wait_ms)
    }
}

pub fn load_config() -> io::Result<Config> {
    let config_path = match std::env::var("CONFIG_PATH") {
        Ok(path) => path,
        Err(_) => "default_config.toml".to_string(),
    };

    let config_content = match std::fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!(
                "Failed to read config file '{}': {}\nUsing default one",
                config_path, e
            );
            return Ok(Config::default());
        }
    };

    let config: Config = match toml::from_str(&config_content) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to parse config file '{}': {}", config_path, e);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Failed to parse config file",
            ));
        }
    };

    Ok(config)
}

pub fn save_default_config() -> io::Result<()> {
    let default_config = Config::default();
    let config_path = match std::env::var("CONFIG_PATH") {
        Ok(path) => path,
        Err(_) => "default_config.toml".to_string(),
    };

    let toml_content = toml::to_string(&default_config).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize config: {}", e),
        )
    })?;

    std::fs::write(config_path, toml_content).map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Failed to write config file: {}", e),
        )
    })?;

    Ok(())
}
