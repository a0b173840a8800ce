//! Cluster-topology configuration for the demo binary: which node this
//! process is, how many slaves to expect, and the addresses the master and
//! slaves use to reach each other. The library itself never reads this —
//! `Multiplexer::new` takes plain constructor arguments — so nothing here
//! is referenced outside `src/bin/node.rs`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
struct CliOpt {
    #[structopt(short, long, parse(from_os_str), default_value = "/etc/mpipe.toml")]
    config: PathBuf,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct NodeConfig {
    /// 0 for the master, 1..=num_slaves for a slave.
    pub node_index: u32,
    pub num_slaves: u32,
    pub master_host: String,
    pub master_port: u16,
    pub slave_group: String,
    pub slave_port: u16,
    #[serde(default)]
    pub log: LogOpt,
}

pub fn from_args() -> Result<NodeConfig> {
    let cli_opt = CliOpt::from_args();

    let content = read_to_string(cli_opt.config)?;
    let mut config: NodeConfig = toml::from_str(&content)?;

    config.log.level = match &config.log.level[..] {
        "error" | "warn" | "info" | "debug" | "trace" => config.log.level,
        _ => "info".to_string(),
    };
    config.log.timestamps = match &config.log.timestamps[..] {
        "sec" | "ms" | "us" | "ns" => config.log.timestamps,
        _ => "none".to_string(),
    };

    Ok(config)
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct LogOpt {
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub timestamps: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_parses_from_toml() {
        let toml_str = r#"
            node_index = 1
            num_slaves = 3
            master_host = "master.local"
            master_port = 9001
            slave_group = "239.0.0.1"
            slave_port = 9002
        "#;
        let config: NodeConfig = toml::from_str(toml_str).expect("valid config");
        assert_eq!(config.node_index, 1);
        assert_eq!(config.num_slaves, 3);
        assert_eq!(config.master_host, "master.local");
        assert_eq!(config.log.level, "");
    }
}
