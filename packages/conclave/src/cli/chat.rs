//! `conclave chat`: interactive session on top of the session controller.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conclave_session::{
    AuthSnapshot, CombineMode, ConnectionEvent, ConnectionManager, ConnectionState,
    ControllerEvent, ConversationId, HttpConversationStore, Message, ModelRef, Recovery, Role,
    SessionController, SessionError, WsConnector,
};

use crate::cli::format_message;
use crate::config::ClientConfig;

type Controller = SessionController<WsConnector, HttpConversationStore>;

/// How long a send waits for the connection before giving up.
const SEND_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Clone)]
pub struct ChatOptions {
    /// Resume this conversation instead of starting fresh.
    pub conversation: Option<String>,
    pub models: Option<Vec<String>>,
    pub mode: Option<CombineMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Empty,
    Send(String),
    NewChat,
    Switch(ConversationId),
    List,
    Delete(ConversationId),
    Models(Vec<ModelRef>),
    Mode(CombineMode),
    Reveal(bool),
    Status,
    Help,
    Quit,
}

const HELP: &str = "\
  /new               start a new conversation
  /switch <id>       show another conversation
  /list              list conversations
  /delete <id>       delete a conversation
  /models a,b        choose the models that answer
  /mode <m>          single | consensus | debate
  /reveal on|off     show intermediate model outputs
  /status            connection and session status
  /quit              leave";

fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Send(line.to_string()));
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    let require = |what: &str| {
        if arg.is_empty() {
            Err(format!("/{name} needs {what}"))
        } else {
            Ok(arg)
        }
    };
    match name {
        "new" => Ok(Input::NewChat),
        "switch" => Ok(Input::Switch(ConversationId::new(require("a conversation id")?))),
        "list" | "ls" => Ok(Input::List),
        "delete" | "rm" => Ok(Input::Delete(ConversationId::new(require(
            "a conversation id",
        )?))),
        "models" => {
            let models: Vec<ModelRef> = require("a comma-separated model list")?
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ModelRef::from)
                .collect();
            Ok(Input::Models(models))
        }
        "mode" => require("a mode")?.parse().map(Input::Mode),
        "reveal" => match require("on or off")? {
            "on" | "true" => Ok(Input::Reveal(true)),
            "off" | "false" => Ok(Input::Reveal(false)),
            other => Err(format!("/reveal expects on or off, got {other}")),
        },
        "status" => Ok(Input::Status),
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" | "q" => Ok(Input::Quit),
        other => Err(format!("unknown command /{other} (try /help)")),
    }
}

/// Incremental printer for the displayed log.
#[derive(Debug, Default)]
struct Renderer {
    session: Option<ConversationId>,
    printed: usize,
    mid_line: bool,
}

impl Renderer {
    /// Text to print so the terminal catches up with `entries`.
    fn render(&mut self, session: Option<&ConversationId>, entries: &[Message]) -> String {
        let mut out = String::new();
        if session != self.session.as_ref() {
            // a new conversation that just got its id keeps its lines
            let continues =
                self.session.is_none() && self.printed > 0 && entries.len() >= self.printed;
            if !continues {
                self.close_line(&mut out);
                self.printed = 0;
                if let Some(id) = session {
                    out.push_str(&format!("── {} ──\n", id));
                }
            }
            self.session = session.cloned();
        }
        if entries.len() < self.printed {
            self.printed = 0;
        }
        for entry in &entries[self.printed..] {
            match (entry.role, entry.partial) {
                (Role::Assistant, true) => {
                    if !self.mid_line {
                        if let Some(model) = &entry.model_source {
                            out.push_str(&format!("[{}] ", model));
                        }
                        self.mid_line = true;
                    }
                    out.push_str(&entry.text);
                }
                (Role::Assistant, false) if self.mid_line => {
                    // the final frame closes the streamed answer
                    self.close_line(&mut out);
                }
                _ => {
                    self.close_line(&mut out);
                    if entry.role != Role::User || self.printed == 0 {
                        out.push_str(&format_message(entry));
                        out.push('\n');
                    }
                }
            }
        }
        self.printed = entries.len();
        out
    }

    /// Redraw `session` from the top, e.g. after history was inserted in
    /// front of what is already on screen.
    fn redraw(&mut self, session: Option<&ConversationId>, entries: &[Message]) -> String {
        let mut out = String::new();
        self.close_line(&mut out);
        self.reset();
        out.push_str(&self.render(session, entries));
        out
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn close_line(&mut self, out: &mut String) {
        if self.mid_line {
            out.push('\n');
            self.mid_line = false;
        }
    }
}

fn print_out(text: &str) {
    if text.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

fn describe_connection(event: &ConnectionEvent) -> Option<String> {
    match event {
        ConnectionEvent::StateChanged(ConnectionState::Reconnecting { attempt }) => {
            Some(format!("[conclave: reconnecting, attempt {}]", attempt))
        }
        ConnectionEvent::Resumed { .. } => Some("[conclave: reconnected]".to_string()),
        ConnectionEvent::AuthRejected { reason } => Some(format!(
            "[conclave: authentication rejected: {}. Sign in again]",
            reason
        )),
        ConnectionEvent::RetriesExhausted { attempts } => Some(format!(
            "[conclave: connection lost after {} attempts. Use /status, or restart]",
            attempts
        )),
        ConnectionEvent::StateChanged(_) => None,
    }
}

async fn render_loop(controller: Arc<Controller>, cancel: CancellationToken) {
    let mut events = controller.events();
    let mut renderer = Renderer::default();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ControllerEvent::LogUpdated { .. }) | Ok(ControllerEvent::Bound { .. }) => {
                let active = controller.active_conversation().await;
                let entries = controller.messages().await;
                print_out(&renderer.render(active.as_ref(), &entries));
            }
            Ok(ControllerEvent::HistoryLoaded { session_id }) => {
                let active = controller.active_conversation().await;
                if active.as_ref() == Some(&session_id) {
                    let entries = controller.messages().await;
                    print_out(&renderer.redraw(active.as_ref(), &entries));
                }
            }
            Ok(ControllerEvent::CreationTimedOut) => {
                renderer.reset();
                eprintln!("\n[conclave: the server did not start the conversation. Please resend]");
            }
            Ok(ControllerEvent::Connection(event)) => {
                if let Some(line) = describe_connection(&event) {
                    eprintln!("{}", line);
                }
            }
            Ok(ControllerEvent::OffscreenUpdated { session_id }) => {
                debug!(session_id = %session_id, "off-screen conversation updated");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "render loop lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Send, waiting for the connection to come back once if it is down.
async fn send(controller: &Controller, text: &str) -> Result<(), SessionError> {
    match controller.send(text).await {
        Err(e) if e.recovery() == Recovery::WaitForConnection => {
            eprintln!("[conclave: not connected, waiting for connection]");
            tokio::time::timeout(SEND_WAIT, controller.connection().wait_for_authenticated())
                .await
                .map_err(|_| SessionError::NotAuthenticated)??;
            controller.send(text).await
        }
        other => other,
    }
}

async fn status(controller: &Controller) -> String {
    let selection = controller.model_selection().await;
    let models: Vec<&str> = selection.enabled_models.iter().map(|m| m.as_str()).collect();
    let active = controller
        .active_conversation()
        .await
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let stats = controller.stats();
    format!(
        "connection:   {}\nbinding:      {}\nconversation: {}\nmodels:       {} ({}, reveal {})\ncached logs:  {}\nframes:       {} applied, {} off-screen, {} duplicates dropped",
        controller.connection_state().name(),
        controller.binding_state().await.name(),
        active,
        if models.is_empty() { "-".to_string() } else { models.join(",") },
        selection.combine_mode,
        if selection.reveal_intermediate { "on" } else { "off" },
        controller.cached_conversations().await,
        stats.applied,
        stats.applied_offscreen,
        stats.sequence_regressions,
    )
}

/// Apply one parsed input. Returns false to leave the chat.
async fn handle(controller: &Controller, input: Input) -> bool {
    let result = match input {
        Input::Empty => Ok(()),
        Input::Quit => return false,
        Input::Help => {
            eprintln!("{}", HELP);
            Ok(())
        }
        Input::Send(text) => send(controller, &text).await,
        Input::NewChat => {
            controller.new_chat().await;
            eprintln!("[conclave: new conversation]");
            Ok(())
        }
        Input::Switch(id) => controller.switch_to(id).await,
        Input::List => controller.list_conversations().await.map(|list| {
            for c in &list {
                eprintln!("  {}  {}", c.id, c.title_or_id());
            }
        }),
        Input::Delete(id) => controller.delete_conversation(&id).await,
        Input::Models(models) => {
            let mut selection = controller.model_selection().await;
            selection.enabled_models = models.into_iter().collect();
            let catalog = controller.catalog().await;
            if let Err(e) = selection.validate(&catalog) {
                eprintln!("[conclave: {}]", e);
            }
            controller.set_model_selection(selection).await;
            Ok(())
        }
        Input::Mode(mode) => {
            let mut selection = controller.model_selection().await;
            selection.combine_mode = mode;
            if selection.normalized().combine_mode != mode {
                eprintln!("[conclave: {} needs at least two models; sending as single]", mode);
            }
            controller.set_model_selection(selection).await;
            Ok(())
        }
        Input::Reveal(on) => {
            let selection = controller.model_selection().await.with_reveal_intermediate(on);
            controller.set_model_selection(selection).await;
            Ok(())
        }
        Input::Status => {
            eprintln!("{}", status(controller).await);
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("[conclave: {} ({}){}]", e, e.error_code(), recovery_hint(&e));
    }
    true
}

fn recovery_hint(err: &SessionError) -> &'static str {
    match err.recovery() {
        Recovery::Reauthenticate => ". Sign in again",
        Recovery::WaitForConnection => ". Still offline, try again shortly",
        Recovery::Retry => ". Please try again",
        Recovery::None => "",
    }
}

pub async fn chat_command(config: &ClientConfig, options: ChatOptions) -> Result<()> {
    let token = config
        .token
        .clone()
        .context("No auth token. Set CONCLAVE_AUTH__TOKEN, [auth] token in config.toml, or pass --token")?;

    let connection = Arc::new(ConnectionManager::new(
        WsConnector::new(config.ws_url.clone()),
        config.reconnect.clone(),
    ));
    let store = Arc::new(HttpConversationStore::new(config.api_url.clone(), None));
    let controller = Arc::new(SessionController::new(
        connection,
        store,
        config.session.clone(),
    ));

    let mut selection = config.selection.clone();
    if let Some(models) = options.models {
        selection.enabled_models = models.iter().map(|m| ModelRef::new(m.as_str())).collect();
    }
    if let Some(mode) = options.mode {
        selection.combine_mode = mode;
    }
    controller.set_model_selection(selection).await;

    let cancel = CancellationToken::new();
    let driver = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };
    let renderer = tokio::spawn(render_loop(controller.clone(), cancel.clone()));

    controller
        .on_auth_changed(AuthSnapshot::signed_in(token))
        .await
        .with_context(|| format!("Failed to connect to {}", config.ws_url))?;

    if let Err(e) = controller.refresh_models().await {
        warn!(error = %e, "could not fetch model catalog");
    }
    if let Some(id) = options.conversation {
        controller.switch_to(ConversationId::new(id)).await?;
    }
    eprintln!("[conclave: connected. /help for commands]");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        match parse_input(&line) {
            Ok(input) => {
                if !handle(&controller, input).await {
                    break;
                }
            }
            Err(msg) => eprintln!("[conclave: {}]", msg),
        }
    }

    controller.on_auth_changed(AuthSnapshot::signed_out()).await?;
    cancel.cancel();
    let _ = tokio::join!(driver, renderer);
    Ok(())
}
