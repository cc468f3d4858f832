//! `quarry serve`: start the HTTP gateway.

use super::{CmdResult, load_config};

pub async fn run(port_override: Option<u16>) -> CmdResult {
    let mut config = load_config()?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    if !config.has_api_key() {
        eprintln!("  warning: no API key configured; set QUARRY_API_KEY or OPENAI_API_KEY");
    }

    println!("Quarry gateway");
    println!("   Listening: http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.provider.model);

    quarry_gateway::start(config).await
}
