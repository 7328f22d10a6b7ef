//! # cobrowse
//!
//! Terminal client for shared browser sessions: watch live session state,
//! start tasks, and hand control between the agent and yourself.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::warn;

use cobrowse_client::{
    ConnectionEvent, EventFilter, ListenerId, RegistryEvent, SessionClient, SessionRegistry,
    TransitionOrigin,
};
use cobrowse_core::errors::TerminalReconnectError;
use cobrowse_core::ids::{ContextId, SessionId};
use cobrowse_core::session::{ConnectionState, ControlPhase, Session};
use cobrowse_settings::CobrowseSettings;

/// Shared browser session client.
#[derive(Parser, Debug)]
#[command(name = "cobrowse", about = "Watch and steer shared browser sessions")]
struct Cli {
    /// Settings file (defaults to `~/.cobrowse/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Real-time endpoint, overriding settings.
    #[arg(long, global = true)]
    ws_url: Option<String>,

    /// HTTP backend base URL, overriding settings.
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream session state until interrupted.
    Watch {
        /// Follow a single session instead of all of them.
        #[arg(long)]
        session: Option<String>,
        /// Only show sessions bound to this context.
        #[arg(long)]
        context: Option<String>,
    },
    /// Start a task in a new session.
    Start {
        /// Task description for the agent.
        task: String,
        /// Context to bind the session to.
        #[arg(long)]
        context: Option<String>,
    },
    /// Take control of a session from the agent.
    TakeControl {
        /// Session ID.
        id: String,
        /// Note passed to the agent with the handoff.
        #[arg(long)]
        message: Option<String>,
    },
    /// Hand control back to the agent.
    Release {
        /// Session ID.
        id: String,
        /// Instructions for the agent when it resumes.
        #[arg(long)]
        message: Option<String>,
    },
    /// Send guidance to the agent without taking control.
    Guide {
        /// Session ID.
        id: String,
        /// Guidance text.
        message: String,
    },
    /// Ask the backend to push a fresh screenshot.
    Screenshot {
        /// Session ID.
        id: String,
    },
    /// Close one session.
    Close {
        /// Session ID.
        id: String,
    },
    /// Close every session.
    CloseAll,
}

impl Cli {
    /// Settings file (or defaults) with command-line overrides on top.
    fn load_settings(&self) -> Result<CobrowseSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(cobrowse_settings::settings_path);
        let mut settings = cobrowse_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(url) = &self.ws_url {
            settings.connection.ws_url.clone_from(url);
        }
        if let Some(url) = &self.api_url {
            settings.backend.api_url.clone_from(url);
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

fn init_logging(settings: &CobrowseSettings) {
    if settings.logging.json {
        cobrowse_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        cobrowse_core::logging::init_subscriber(&settings.logging.level);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// One-line summary of a session.
fn describe(session: &Session) -> String {
    let control = match session.control_phase() {
        ControlPhase::AgentActive => "agent".to_owned(),
        ControlPhase::HumanActive => "human".to_owned(),
        ControlPhase::Transition { from, to } => format!("{from}->{to}..."),
    };
    let mut line = format!("{} [{}] control={control}", session.session_id, session.status);
    if let Some(step) = &session.step {
        if let Some(number) = step.number {
            line.push_str(&format!(" step={number}"));
        }
    }
    match (&session.current_title, &session.current_url) {
        (Some(title), Some(url)) => line.push_str(&format!(" {title} <{url}>")),
        (Some(title), None) => line.push_str(&format!(" {title}")),
        (None, Some(url)) => line.push_str(&format!(" <{url}>")),
        (None, None) => {}
    }
    if let Some(error) = &session.last_error {
        line.push_str(&format!(" error={error:?}"));
    }
    line
}

/// Render a registry event, or `None` if it is filtered out.
fn render_event(
    registry: &SessionRegistry,
    event: &RegistryEvent,
    context: Option<&ContextId>,
) -> Option<String> {
    let visible = |id: &SessionId| match context {
        None => true,
        Some(context) => registry.get(id).is_some_and(|s| s.belongs_to(context)),
    };

    match event {
        RegistryEvent::Upserted { session_id, .. } => {
            let session = registry.get(session_id)?;
            visible(session_id).then(|| describe(&session))
        }
        RegistryEvent::Removed { session_id } => {
            context.is_none().then(|| format!("{session_id} closed"))
        }
        RegistryEvent::ControlChanged {
            session_id,
            owner,
            previous,
        } => visible(session_id).then(|| format!("{session_id} control {previous} -> {owner}")),
        RegistryEvent::TransitionStarted {
            session_id,
            target,
            origin,
        } => visible(session_id).then(|| match origin {
            TransitionOrigin::Local => format!("{session_id} switching control to {target}"),
            TransitionOrigin::Remote => format!("{session_id} backend handed control to {target}"),
        }),
        RegistryEvent::TransitionFailed {
            session_id,
            restored,
            reason,
        } => visible(session_id).then(|| {
            format!("{session_id} switch failed ({reason}); control stays with {restored}, retry")
        }),
        RegistryEvent::Step { session_id, step } => visible(session_id).then(|| {
            let number = step.number.map_or_else(|| "?".to_owned(), |n| n.to_string());
            let verb = if step.finished { "finished" } else { "started" };
            match &step.description {
                Some(description) => format!("{session_id} step {number} {verb}: {description}"),
                None => format!("{session_id} step {number} {verb}"),
            }
        }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Load a session from the backend and follow it on the real-time channel.
async fn attach(client: &SessionClient, id: &SessionId) -> Result<Session> {
    let session = client
        .refresh_session(id)
        .await
        .with_context(|| format!("Failed to fetch session {id}"))?;
    let Some(session) = session else {
        bail!("session '{id}' does not exist");
    };
    client
        .connect(Some(id))
        .await
        .context("Failed to open real-time channel")?;
    let _ = client
        .subscriptions()
        .subscribe_to_session(id)
        .await
        .context("Failed to subscribe to session")?;
    Ok(session)
}

/// Forward the terminal reconnect failure to the returned receiver. The
/// listener runs on the connection's read path, so the event cannot be lost
/// to a lagging subscriber.
fn notify_when_offline(
    client: &SessionClient,
) -> (ListenerId, mpsc::UnboundedReceiver<TerminalReconnectError>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = client.connection().on(EventFilter::State, move |event| {
        if let ConnectionEvent::ReconnectExhausted(e) = event {
            let _ = tx.send(e.clone());
        }
    });
    (listener, rx)
}

async fn watch(
    client: &SessionClient,
    session: Option<SessionId>,
    context: Option<ContextId>,
) -> Result<()> {
    let (listener, offline) = notify_when_offline(client);
    let result = follow(client, session, context, offline).await;
    let _ = client.connection().off(listener);
    result
}

async fn follow(
    client: &SessionClient,
    session: Option<SessionId>,
    context: Option<ContextId>,
    mut offline: mpsc::UnboundedReceiver<TerminalReconnectError>,
) -> Result<()> {
    let mut events = client.registry().subscribe();
    let mut state = client.connection().watch_state();

    if let Some(id) = &session {
        let session = attach(client, id).await?;
        println!("{}", describe(&session));
    } else {
        client
            .connect(None)
            .await
            .context("Failed to open real-time channel")?;
        let _ = client
            .subscriptions()
            .subscribe_to_browser_sessions()
            .await
            .context("Failed to subscribe to browser sessions")?;
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            Some(e) = offline.recv() => {
                return Err(e).with_context(|| {
                    format!("Lost connection to {}", client.settings().connection.ws_url)
                });
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                eprintln!("connection {current}");
                if current == ConnectionState::Connected {
                    if let Err(e) = client.subscriptions().resubscribe_lapsed().await {
                        warn!(error = %e, "failed to restore subscriptions");
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = render_event(client.registry(), &event, context.as_ref()) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "watch fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

async fn run(client: &SessionClient, command: Command) -> Result<()> {
    match command {
        Command::Watch { session, context } => {
            watch(
                client,
                session.map(SessionId::from),
                context.map(ContextId::from),
            )
            .await
        }
        Command::Start { task, context } => {
            let session = client
                .start_task(&task, context.map(ContextId::from))
                .await
                .context("Failed to start task")?;
            println!("{}", describe(&session));
            if let Some(url) = &session.browser_url {
                println!("live view: {url}");
            }
            Ok(())
        }
        Command::TakeControl { id, message } => {
            let id = SessionId::from(id);
            let _ = attach(client, &id).await?;
            let owner = client
                .take_control(&id, message)
                .await
                .context("Switch failed, retry")?;
            println!("{id} control={owner}");
            Ok(())
        }
        Command::Release { id, message } => {
            let id = SessionId::from(id);
            let _ = attach(client, &id).await?;
            let owner = client
                .release_control(&id, message)
                .await
                .context("Switch failed, retry")?;
            println!("{id} control={owner}");
            Ok(())
        }
        Command::Guide { id, message } => {
            let id = SessionId::from(id);
            let _ = attach(client, &id).await?;
            let _ = client
                .send_guidance(&id, message)
                .await
                .context("Failed to send guidance")?;
            println!("{id} guidance sent");
            Ok(())
        }
        Command::Screenshot { id } => {
            let id = SessionId::from(id);
            client
                .request_screenshot(&id)
                .await
                .context("Failed to request screenshot")?;
            println!("{id} screenshot requested");
            Ok(())
        }
        Command::Close { id } => {
            let id = SessionId::from(id);
            client
                .close_session(&id)
                .await
                .with_context(|| format!("Failed to close session {id}"))?;
            println!("{id} closed");
            Ok(())
        }
        Command::CloseAll => {
            client.close_all().await.context("Failed to close sessions")?;
            println!("all sessions closed");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    init_logging(&settings);

    let client = SessionClient::from_settings(settings).context("Failed to build client")?;
    let result = run(&client, cli.command).await;
    client.shutdown().await;
    result
}
