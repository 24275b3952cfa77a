use crate::config::ServerConfig;
use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments of the relay binary.
#[derive(Debug, Parser)]
#[command(name = "proxygate")]
#[command(about = "Admission-checked, throttled TCP relay", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "PROXYGATE_CONFIG", default_value = "/etc/proxygate/proxygate.toml")]
    pub config: PathBuf,

    /// Overrides `listen_addr`.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Overrides `upstream_addr`.
    #[arg(short, long)]
    pub upstream: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Loads the config file, falling back to defaults when it does not
    /// exist, and applies command-line overrides.
    pub fn load_config(&self) -> Result<ServerConfig> {
        let mut config = if self.config.exists() {
            ServerConfig::from_file(&self.config)?
        } else {
            ServerConfig::default()
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(upstream) = &self.upstream {
            config.upstream_addr = upstream.clone();
        }
        if self.log_json {
            config.log_json = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "listen_addr = \"127.0.0.1:1000\"\nupstream_addr = \"a:1\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from(["proxygate", "--config", &path, "--upstream", "b:2"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.listen_addr, SocketAddr::from(([127, 0, 0, 1], 1000)));
        assert_eq!(config.upstream_addr, "b:2");
        assert!(!config.log_json);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cli = Cli::parse_from([
            "proxygate",
            "--config",
            "/nonexistent/proxygate.toml",
            "--listen",
            "127.0.0.1:7000",
            "--log-json",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.listen_addr.port(), 7000);
        assert!(config.log_json);
        assert_eq!(config.upstream_addr, ServerConfig::default().upstream_addr);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, "{{ \"throttle\": {{ \"rate_bytes_per_sec\": 0 }} }}").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from(["proxygate", "--config", &path]);
        assert!(cli.load_config().is_err());
    }
}
