mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    LoggingSettings, RelaySettings, ServerSettings, SessionSettings, Settings,
};

/// Prefix for environment overrides, e.g. `FABRIC_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "FABRIC";

/// Loads the configuration from `config/default` (if present) and `FABRIC_*`
/// environment variables, then fills the gaps with defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// As `load_config`, reading the file at `path` (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}
