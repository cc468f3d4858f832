pub mod ask;
pub mod config_cmd;
pub mod history;
pub mod serve;

use quarry_config::AppConfig;

pub type CmdResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub(crate) fn load_config() -> Result<AppConfig, String> {
    AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))
}
