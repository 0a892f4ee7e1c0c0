use anyhow::Result;
use cadence_common::AppConfig;
use std::path::PathBuf;
use tracing::info;

/// Resolved configuration with the source path for reloading.
pub struct ServerConfig {
    pub config: AppConfig,
    pub config_path: PathBuf,
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self> {
        info!(path = path, "loading configuration");
        let config = AppConfig::load(path)?;
        Ok(Self {
            config,
            config_path: PathBuf::from(path),
        })
    }

    /// Re-read and validate the file without adopting it. The running
    /// configuration changes only through [`ServerConfig::commit`].
    pub fn reload(&self) -> Result<AppConfig> {
        let path_str = self.config_path.to_string_lossy().to_string();
        info!(path = %path_str, "reloading configuration");
        let config = AppConfig::load(&path_str)?;
        if config.admin.listen != self.config.admin.listen {
            tracing::warn!(
                current = %self.config.admin.listen,
                requested = %config.admin.listen,
                "admin.listen changes take effect on restart"
            );
        }
        Ok(config)
    }

    /// Adopt a reloaded configuration once the ledger has accepted it.
    pub fn commit(&mut self, config: AppConfig) {
        self.config = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(path: &std::path::Path, name: &str, rate: f64) {
        let mut file = std::fs::File::create(path).unwrap();
        write!(
            file,
            "ledger:\n  buckets:\n    - {{ name: {}, strategy: subnet, netmask: 32, rate: {} }}\n",
            name, rate
        )
        .unwrap();
    }

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("cadence-{}-{}.yaml", tag, std::process::id()))
    }

    #[test]
    fn reload_keeps_previous_on_error() {
        let path = temp_path("reload");
        write_config(&path, "slash32", 2.0);

        let mut server = ServerConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(server.config.ledger.buckets[0].rate, 2.0);

        write_config(&path, "slash32", 4.0);
        let reloaded = server.reload().unwrap();
        assert_eq!(reloaded.ledger.buckets[0].rate, 4.0);
        assert_eq!(server.config.ledger.buckets[0].rate, 2.0);
        server.commit(reloaded);
        assert_eq!(server.config.ledger.buckets[0].rate, 4.0);

        write_config(&path, "slash32", -1.0);
        assert!(server.reload().is_err());
        assert_eq!(server.config.ledger.buckets[0].rate, 4.0);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejected_reload_is_not_adopted() {
        let path = temp_path("rejected");
        write_config(&path, "slash32", 2.0);

        let server = ServerConfig::load(path.to_str().unwrap()).unwrap();
        let ledger = cadence_ledger::Ledger::new(&server.config.ledger).unwrap();

        // Parses and validates, but renames a running bucket.
        write_config(&path, "host", 2.0);
        let reloaded = server.reload().unwrap();
        assert!(ledger.reconfigure(&reloaded.ledger).is_err());

        assert_eq!(server.config.ledger.buckets[0].name, "slash32");
        assert_eq!(*ledger.config(), server.config.ledger);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn sample_config_is_valid() {
        let sample = include_str!("../../../config/cadence.yaml");
        let config: AppConfig = serde_yaml::from_str(sample).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ledger.buckets.len(), 4);
    }
}
