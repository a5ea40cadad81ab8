pub mod chat;

use anyhow::{Context, Result};

use conclave_session::{
    ConversationId, ConversationStore, HttpConversationStore, Message, Role, SessionError,
};

use crate::config::ClientConfig;

pub use chat::{ChatOptions, chat_command};

fn store(config: &ClientConfig) -> HttpConversationStore {
    HttpConversationStore::new(config.api_url.clone(), config.token.clone())
}

/// Turn a storage error into a message the user can act on.
fn describe(err: SessionError, config: &ClientConfig) -> anyhow::Error {
    match err {
        SessionError::Transport(_) => {
            anyhow::anyhow!("Server not reachable at {} ({})", config.api_url, err)
        }
        SessionError::NotAuthenticated => {
            anyhow::anyhow!("Not authorized. Set CONCLAVE_AUTH__TOKEN or pass --token")
        }
        other => anyhow::Error::new(other),
    }
}

pub async fn list_command(config: &ClientConfig, json: bool) -> Result<()> {
    let conversations = store(config)
        .list_conversations()
        .await
        .map_err(|e| describe(e, config))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
        return Ok(());
    }
    if conversations.is_empty() {
        eprintln!("No conversations");
        return Ok(());
    }
    for c in &conversations {
        let updated = c
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<16} {:>5}  {}",
            c.id,
            updated,
            c.message_count,
            c.title_or_id()
        );
    }
    Ok(())
}

pub async fn history_command(config: &ClientConfig, id: &str, json: bool) -> Result<()> {
    let id = ConversationId::new(id);
    let messages = store(config)
        .fetch_history(&id)
        .await
        .map_err(|e| describe(e, config))
        .with_context(|| format!("Failed to fetch history for {}", id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    for m in &messages {
        println!("{}", format_message(m));
    }
    Ok(())
}

pub async fn delete_command(config: &ClientConfig, id: &str) -> Result<()> {
    let id = ConversationId::new(id);
    store(config)
        .delete_conversation(&id)
        .await
        .map_err(|e| describe(e, config))?;
    eprintln!("Deleted {}", id);
    Ok(())
}

pub async fn models_command(config: &ClientConfig, json: bool) -> Result<()> {
    let catalog = store(config)
        .list_models()
        .await
        .map_err(|e| describe(e, config))?;

    if json {
        let models: Vec<_> = catalog.iter().collect();
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }
    for m in catalog.iter() {
        let provider = m.provider.as_deref().unwrap_or("-");
        println!("{:<24} {:<12} {}", m.id, provider, m.display_name());
    }
    Ok(())
}

/// One-line rendering of a complete message.
pub fn format_message(m: &Message) -> String {
    match m.role {
        Role::User => format!("> {}", m.text),
        Role::Assistant => match &m.model_source {
            Some(model) => format!("[{}] {}", model, m.text),
            None => m.text.clone(),
        },
        Role::System => format!("! {}", m.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_session::ModelRef;

    #[test]
    fn test_format_message_roles() {
        assert_eq!(format_message(&Message::user("hi")), "> hi");
        assert_eq!(
            format_message(&Message::assistant("yo", Some(ModelRef::new("m1")))),
            "[m1] yo"
        );
        assert_eq!(format_message(&Message::assistant("yo", None)), "yo");
    }
}
