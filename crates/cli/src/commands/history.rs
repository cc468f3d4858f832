//! `quarry history` and `quarry clear-history`.

use super::{CmdResult, load_config};

pub async fn show(json: bool) -> CmdResult {
    let config = load_config()?;
    let service = quarry_gateway::build_service(&config).await?;
    let turns = service.history().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&turns)?);
        return Ok(());
    }

    if turns.is_empty() {
        println!("No chat history.");
        return Ok(());
    }

    for turn in &turns {
        println!("[{}] {}", turn.created_at.format("%Y-%m-%d %H:%M:%S"), turn.message);
        for line in turn.response.lines() {
            println!("    {line}");
        }
        println!();
    }
    Ok(())
}

pub async fn clear() -> CmdResult {
    let config = load_config()?;
    let service = quarry_gateway::build_service(&config).await?;
    service.clear_history().await?;
    println!("Chat history cleared.");
    Ok(())
}
