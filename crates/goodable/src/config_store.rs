use anyhow::{Context as _, Result};
use goodable_core::config::ConfigFile;
use goodable_core::paths::GoodablePaths;

pub async fn load(paths: &GoodablePaths) -> Result<ConfigFile> {
    let path = &paths.config_file;
    match tokio::fs::read_to_string(path).await {
        Ok(s) => {
            let cfg: ConfigFile = toml::from_str(&s).context("parse config.toml")?;
            cfg.validate().context("validate config.toml")?;
            if !cfg.extra.is_empty() {
                let keys = cfg.extra.keys().cloned().collect::<Vec<_>>().join(", ");
                tracing::warn!(keys = %keys, "ignoring unknown config keys");
            }
            Ok(cfg)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(err) => Err(err).with_context(|| format!("read config: {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use goodable_core::paths::{compute_paths, PathInputs};

    fn paths_in(dir: &Path) -> GoodablePaths {
        compute_paths(PathInputs {
            home_dir: dir.to_path_buf(),
            xdg_config_home: None,
            goodable_dir_override: Some(dir.join("goodable")),
        })
    }

    #[tokio::test]
    async fn load_defaults_when_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = load(&paths_in(dir.path())).await.unwrap();
        assert_eq!(cfg.effective_default_cli(), "claude");
    }

    #[tokio::test]
    async fn load_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = paths_in(dir.path());
        tokio::fs::create_dir_all(&paths.config_dir).await.unwrap();
        tokio::fs::write(&paths.config_file, "default-cli = \"nope\"\n")
            .await
            .unwrap();

        let err = load(&paths).await.unwrap_err();
        assert!(format!("{err:#}").contains("validate config.toml"));
    }
}
