use std::path::PathBuf;

use anyhow::Result;
use chorus_core::api::v1::{self, ChatRequest};
use chorus_core::app::{AppConfig, AppContext};
use chorus_core::logging;
use directories::ProjectDirs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn workspace_dir() -> PathBuf {
    if let Some(proj) = ProjectDirs::from("com", "Chorus", "Chorus") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("Chorus")
    }
}

const HELP: &str = "Commands: /new starts a conversation, /providers lists providers, \
/events shows recent routing decisions, /delete removes the current conversation, \
/key <provider> [api-key] stores or clears a key for next start, /settings shows settings, /quit exits.";

#[tokio::main]
async fn main() -> Result<()> {
    let event_log = logging::install(std::env::var("CHORUS_LOG").ok().as_deref());
    let ctx = AppContext::bootstrap(AppConfig::from_env(Some(workspace_dir())))?;
    if let Some(pool) = &ctx.db {
        event_log.attach(pool.clone());
    }

    let available = ctx.available_providers();
    if available.is_empty() {
        tracing::warn!("no provider credentials found; set e.g. OPENAI_API_KEY");
    }

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("Chorus ready ({}). {HELP}\n", available.join(", ")).as_bytes())
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut conversation: Option<String> = None;
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        let output = match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => HELP.to_string(),
            "/new" => {
                let created = v1::new_conversation(&ctx);
                let message = format!("Started conversation {}", created.conversation_id);
                conversation = Some(created.conversation_id);
                message
            }
            "/delete" => match conversation.take() {
                Some(id) => {
                    v1::delete_conversation(&ctx, &id);
                    format!("Deleted conversation {id}")
                }
                None => "No active conversation".to_string(),
            },
            "/providers" => v1::list_providers(&ctx)
                .iter()
                .map(|p| {
                    let mark = if p.has_credentials { "*" } else { " " };
                    format!("{mark} {:<10} {:<10} {}", p.id, p.display_name, p.model)
                })
                .collect::<Vec<_>>()
                .join("\n"),
            "/events" => match v1::list_routing_events(&ctx, Some(10)).await {
                Ok(events) => events
                    .iter()
                    .map(|e| format!("{} {}", e.ts, e.data.as_ref().map(|d| d.to_string()).unwrap_or_default()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(err) => format!("error: {err}"),
            },
            "/settings" => format!("{:#?}", v1::get_settings(&ctx)),
            command if command.starts_with("/key ") => {
                let mut parts = command["/key ".len()..].split_whitespace();
                match parts.next() {
                    Some(provider) => {
                        let key = parts.next().unwrap_or_default();
                        match v1::set_provider_secret(&ctx, provider, key).await {
                            Ok(()) if key.is_empty() => format!("Cleared key for {provider}; restart to apply"),
                            Ok(()) => format!("Stored key for {provider}; restart to apply"),
                            Err(err) => format!("error: {err}"),
                        }
                    }
                    None => "usage: /key <provider> [api-key]".to_string(),
                }
            }
            message => {
                let request = ChatRequest {
                    conversation_id: conversation.clone(),
                    message: message.to_string(),
                };
                match v1::chat(&ctx, request).await {
                    Ok(reply) => {
                        conversation = Some(reply.conversation_id);
                        reply.response
                    }
                    Err(err) => format!("error: {err}"),
                }
            }
        };
        stdout.write_all(format!("{output}\n").as_bytes()).await?;
    }

    ctx.shutdown().await;
    Ok(())
}
