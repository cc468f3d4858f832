//! `quarry ask`: run one request in the terminal.
//!
//! Progress events go to stderr as `kind: content` lines; answer fragments
//! and the final statement go to stdout.

use std::io::Write;

use futures::StreamExt;
use quarry_agent::Request;
use quarry_core::event::EventKind;

use super::{CmdResult, load_config};

pub async fn run(message: String, session: Option<String>) -> CmdResult {
    let config = load_config()?;
    if !config.has_api_key() {
        return Err("No API key found. Set QUARRY_API_KEY or OPENAI_API_KEY.".into());
    }

    let service = quarry_gateway::build_service(&config).await?;
    let mut request = Request::new(message);
    if let Some(session) = session {
        request = request.with_session(session);
    }

    let mut stream = service.start(request);
    let mut stdout = std::io::stdout();
    let mut answering = false;

    while let Some(event) = stream.next().await {
        match event.kind {
            EventKind::PartialAnswer => {
                answering = true;
                write!(stdout, "{}", event.content)?;
                stdout.flush()?;
            }
            EventKind::EndOfStream => break,
            kind => {
                if answering {
                    writeln!(stdout)?;
                    answering = false;
                }
                eprintln!("{kind}: {}", event.content);
            }
        }
    }
    if answering {
        writeln!(stdout)?;
    }

    let Some(result) = stream.finish().await else {
        return Err("request did not complete".into());
    };

    if let Some(statement) = &result.statement {
        println!();
        println!("{statement}");
    }
    if !result.success {
        let reason = result.error.as_deref().unwrap_or("unknown error");
        return Err(format!("request failed after {} attempt(s): {reason}", result.attempts).into());
    }

    Ok(())
}
