//! Terminal client for the admissions chat relay.

use std::io::Write;
use std::sync::Arc;

use admissions_chat::client::ChatStreamClient;
use admissions_chat::config::{load_client_config, ClientConfig};
use admissions_chat::credentials::{CredentialStore, Credentials};
use admissions_chat::observability::init_tracing;
use admissions_chat::session::{
    ChatTurn, HttpSessionBackend, MessagesOutcome, SessionError, SessionManager, TurnOutcome,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

const GREETING: &str = "Hi! Ask me anything about admissions, programs, tuition or deadlines.";

#[derive(Parser, Debug)]
#[command(name = "chat-cli", version, about = "Chat with the admissions assistant")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", env = "CHAT_CLI_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store credentials issued by the sign-in page
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value = "")]
        full_name: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Forget stored credentials
    Logout,
    /// List conversations, most recent first
    Sessions,
    /// Start a new conversation
    New,
    /// Delete a conversation
    Delete { session_id: String },
    /// Show a conversation's messages
    History {
        /// Defaults to the most recent conversation
        #[arg(short, long)]
        session: Option<String>,
        /// Extra pages of older messages to load
        #[arg(long, default_value_t = 0)]
        older: usize,
    },
    /// Ask a question and stream the answer
    Ask {
        question: String,
        /// Defaults to the most recent conversation
        #[arg(short, long)]
        session: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] admissions_chat::config::ConfigError),
    #[error(transparent)]
    Credentials(#[from] admissions_chat::credentials::CredentialsError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Backend(#[from] admissions_chat::session::BackendError),
    #[error(transparent)]
    Chat(#[from] admissions_chat::error::ChatError),
    #[error("not signed in; run `chat-cli login` first")]
    NotSignedIn,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_client_config(&cli.config)?;
    init_tracing(&config.features.log_level);
    let client_config = config.client;
    let store = Arc::new(CredentialStore::new(&client_config.credentials_path));
    store.load()?;

    match cli.command {
        Command::Login {
            token,
            user_id,
            full_name,
            email,
        } => {
            store.save(&Credentials {
                token,
                user_id: Some(user_id),
                full_name,
                email,
            })?;
            println!("Signed in.");
            Ok(())
        }
        Command::Logout => {
            store.clear()?;
            println!("Signed out.");
            Ok(())
        }
        command => run_session_command(command, &client_config, store).await,
    }
}

async fn run_session_command(
    command: Command,
    client_config: &ClientConfig,
    store: Arc<CredentialStore>,
) -> Result<(), CliError> {
    let credentials = store.current().ok_or(CliError::NotSignedIn)?;
    let user_id = credentials.user_id.clone().ok_or(CliError::NotSignedIn)?;
    let backend = Arc::new(HttpSessionBackend::new(client_config, Arc::clone(&store))?);
    let manager = SessionManager::new(backend, user_id, client_config.page_size);
    manager.load_sessions().await?;

    match command {
        Command::Sessions => {
            let current = manager.current_session_id();
            for session in manager.sessions() {
                let marker = if current.as_deref() == Some(session.id.as_str()) { '*' } else { ' ' };
                println!(
                    "{marker} {}  {}  {}",
                    session.id,
                    session.last_updated_at.format("%Y-%m-%d %H:%M"),
                    session.title
                );
            }
        }
        Command::New => {
            let id = manager.create_session().await?;
            println!("{id}");
        }
        Command::Delete { session_id } => {
            manager.delete_session(&session_id).await?;
            println!("Deleted {session_id}.");
        }
        Command::History { session, older } => {
            let session_id = select(&manager, session.as_deref()).await?;
            for _ in 0..older {
                if manager.backfill_older(&session_id).await?.is_none() {
                    break;
                }
            }
            let Some(session) = manager.session(&session_id) else {
                return Ok(());
            };
            println!("# {}", session.title);
            if session.messages.is_empty() {
                println!("assistant> {GREETING}");
            }
            for message in &session.messages {
                let who = if message.is_user { "you" } else { "assistant" };
                println!("{who}> {}", message.content);
            }
        }
        Command::Ask { question, session } => {
            select(&manager, session.as_deref()).await?;
            ask(&manager, client_config, &credentials.token, &question).await?;
        }
        Command::Login { .. } | Command::Logout => {}
    }
    Ok(())
}

async fn select(
    manager: &SessionManager<HttpSessionBackend>,
    session_id: Option<&str>,
) -> Result<String, CliError> {
    if let Some(id) = session_id {
        if let Some(MessagesOutcome::Empty) = manager.select_session(id).await? {
            tracing::debug!(session_id = id, "selected conversation has no history");
        }
        return Ok(id.to_string());
    }
    manager
        .current_session_id()
        .ok_or(CliError::Session(SessionError::NoCurrentSession))
}

async fn ask(
    manager: &SessionManager<HttpSessionBackend>,
    client_config: &ClientConfig,
    token: &str,
    question: &str,
) -> Result<(), CliError> {
    let client = ChatStreamClient::new(client_config)?;
    let endpoint = client_config.chat_endpoint();
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let turn = ChatTurn::new(manager, &client, &endpoint, token);
    let mut stdout = std::io::stdout();
    print!("assistant> ");
    stdout.flush()?;
    let outcome = turn
        .send(question, &cancel, |fragment| {
            print!("{}", fragment.text);
            let _ = std::io::stdout().flush();
        })
        .await?;
    println!();

    match outcome {
        TurnOutcome::Completed { reply, warnings } => {
            tracing::debug!(message_id = %reply.id, "turn complete");
            for warning in warnings {
                eprintln!("warning: message not saved: {warning}");
            }
        }
        TurnOutcome::Failed {
            category,
            message,
            retry_label,
            detail,
            warnings,
        } => {
            tracing::debug!(%category, %detail, "turn failed");
            println!("assistant> {message} [{retry_label}]");
            for warning in warnings {
                eprintln!("warning: message not saved: {warning}");
            }
        }
        TurnOutcome::Cancelled { .. } => println!("(stopped)"),
    }
    Ok(())
}
