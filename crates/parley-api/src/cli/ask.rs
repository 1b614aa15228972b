//! Direct streaming question to the remote service, bypassing aggregation.

use std::io::Write;

use anyhow::Result;
use console::style;

use parley_types::error::PipelineError;
use parley_types::remote::RemoteChatRequest;

use crate::state::AppState;

/// Chunks buffered between the reader task and the terminal.
const STREAM_BUFFER: usize = 32;

pub async fn ask(
    state: &AppState,
    query: String,
    remote_conversation: Option<String>,
    json: bool,
) -> Result<()> {
    let settings = state.active_settings().await?.ok_or_else(|| {
        PipelineError::Configuration(
            "no active service settings; run `parley settings activate`".into(),
        )
    })?;

    let request = RemoteChatRequest {
        query,
        conversation_id: remote_conversation,
        user: settings.user_id.clone(),
    };
    let mut chunks = state.backend.stream(&settings, &request, STREAM_BUFFER);

    let mut answer = String::new();
    let mut conversation_id = None;
    let mut message_id = None;
    let mut stdout = std::io::stdout();

    if !json {
        println!();
        print!("  ");
    }
    while let Some(item) = chunks.recv().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                if !json {
                    println!();
                }
                return Err(PipelineError::from(e).into());
            }
        };
        if !json {
            print!("{}", chunk.answer.replace('\n', "\n  "));
            stdout.flush()?;
        }
        answer.push_str(&chunk.answer);
        conversation_id = chunk.conversation_id.or(conversation_id);
        message_id = chunk.message_id.or(message_id);
    }

    if json {
        let out = serde_json::json!({
            "answer": answer,
            "conversation_id": conversation_id,
            "message_id": message_id,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!();
        if let Some(id) = conversation_id {
            println!("  {}", style(format!("remote conversation: {id}")).dim());
            println!();
        }
    }
    Ok(())
}
