use crate::config::Config;
use crate::error::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Poll smart plugs and export their duty cycles to Prometheus.
#[derive(Parser, Debug, Default)]
#[command(name = "plug-dutycycle", version)]
pub struct Cli {
    /// YAML config file; flags below override its values
    #[arg(short, long, env = "APP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device(s) to monitor, `host` or `host:port`; repeatable
    #[arg(long = "targets", value_name = "ADDR", value_delimiter = ',')]
    pub targets: Vec<String>,

    /// Sample interval in seconds
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Checkpoint interval in seconds
    #[arg(long)]
    pub checkpoint_interval_secs: Option<u64>,

    /// Ignore checkpointed devices last sampled longer ago than this
    #[arg(long)]
    pub checkpoint_max_age_secs: Option<u64>,

    /// Wattage at or above which a device is considered running
    #[arg(long)]
    pub threshold_watts: Option<f64>,

    /// Path to save checkpoints (preserves continuity across restarts)
    #[arg(long)]
    pub checkpoint_file: Option<PathBuf>,

    /// Write a final checkpoint on shutdown
    #[arg(long, action = ArgAction::SetTrue)]
    pub checkpoint_on_shutdown: bool,

    /// Give up on a device query after this many seconds
    #[arg(long)]
    pub query_timeout_secs: Option<u64>,

    /// Address for the Prometheus HTTP server ([address]:port)
    #[arg(long)]
    pub http_listen_address: Option<String>,
}

impl Cli {
    /// Resolve the effective configuration: file (or defaults), then env, then flags.
    pub fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::from_env(),
        };
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(self, cfg: &mut Config) {
        let c = &mut cfg.collector;
        if !self.targets.is_empty() {
            c.targets = self.targets;
        }
        if let Some(v) = self.interval_secs {
            c.interval_secs = v;
        }
        if let Some(v) = self.checkpoint_interval_secs {
            c.checkpoint_interval_secs = v;
        }
        if let Some(v) = self.checkpoint_max_age_secs {
            c.checkpoint_max_age_secs = v;
        }
        if let Some(v) = self.threshold_watts {
            c.threshold_watts = v;
        }
        if let Some(v) = self.checkpoint_file {
            c.checkpoint_file = Some(v);
        }
        if self.checkpoint_on_shutdown {
            c.checkpoint_on_shutdown = true;
        }
        if let Some(v) = self.query_timeout_secs {
            c.query_timeout_secs = Some(v);
        }
        if let Some(v) = self.http_listen_address {
            cfg.http.listen_address = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "plug-dutycycle",
            "--targets",
            "10.0.0.1",
            "--targets",
            "10.0.0.2,10.0.0.3:9999",
            "--interval-secs",
            "15",
            "--threshold-watts",
            "2.5",
            "--checkpoint-file",
            "/var/lib/plug-dutycycle/checkpoint.json",
            "--checkpoint-on-shutdown",
            "--http-listen-address",
            "0.0.0.0:9100",
        ]);

        let mut cfg = Config::default();
        cli.apply(&mut cfg);

        assert_eq!(
            cfg.collector.targets,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3:9999"]
        );
        assert_eq!(cfg.collector.interval_secs, 15);
        assert_eq!(cfg.collector.checkpoint_interval_secs, 60);
        assert_eq!(cfg.collector.threshold_watts, 2.5);
        assert_eq!(
            cfg.collector.checkpoint_file,
            Some(PathBuf::from("/var/lib/plug-dutycycle/checkpoint.json"))
        );
        assert!(cfg.collector.checkpoint_on_shutdown);
        assert_eq!(cfg.http.listen_address, "0.0.0.0:9100");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let mut cfg = Config::default();
        cfg.collector.targets = vec!["plug.lan".into()];
        cfg.collector.threshold_watts = 40.0;

        Cli::default().apply(&mut cfg);

        assert_eq!(cfg.collector.targets, vec!["plug.lan"]);
        assert_eq!(cfg.collector.threshold_watts, 40.0);
    }
}
