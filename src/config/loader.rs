use super::Config;
use anyhow::{Context, Result};
use directories::UserDirs;
use std::fs;
use std::path::Path;

impl Config {
    /// Load `~/.loopguard/config.toml`, creating it with defaults on first run.
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let config_path = home.join(".loopguard").join("config.toml");
        Self::load_or_init_at(&config_path)
    }

    /// Load the config at `config_path`, creating it with defaults if absent.
    /// The workspace is the directory holding the config file.
    pub fn load_or_init_at(config_path: &Path) -> Result<Self> {
        let workspace_dir = config_path
            .parent()
            .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);

        if !workspace_dir.exists() {
            fs::create_dir_all(&workspace_dir).with_context(|| {
                format!(
                    "Failed to create workspace directory {}",
                    workspace_dir.display()
                )
            })?;
        }

        if config_path.exists() {
            let mut config = load_from_path(config_path)?;
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        } else {
            let mut config = Self {
                config_path: config_path.to_path_buf(),
                workspace_dir,
                ..Self::default()
            };
            config.validate()?;
            config.save()?;
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Environment overrides for container deployments.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(workspace) = std::env::var("LOOPGUARD_WORKSPACE")
            && !workspace.is_empty()
        {
            self.workspace_dir = workspace.into();
        }

        if let Ok(tick_str) = std::env::var("LOOPGUARD_TICK_SECS")
            && let Ok(tick) = tick_str.parse::<u64>()
            && tick > 0
        {
            self.decision_loop.tick_secs = tick;
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }
}

/// Parse a config file without touching the filesystem beyond reading it.
pub fn load_from_path(config_path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
    let mut config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;
    config.config_path = config_path.to_path_buf();
    config.workspace_dir = config_path
        .parent()
        .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
    Ok(config)
}
