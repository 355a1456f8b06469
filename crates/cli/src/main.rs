use clap::{Parser, Subcommand};
use lib::backend::{Backend, BackendClient, StatusResponse};
use lib::chat::{send_message, ChatError, ChatOptions, ReplyStatus};
use lib::config::{self, Config};
use lib::poller::{CancelToken, PollProgress, ProgressSnapshot};
use lib::session::{ChatSession, Message, Model, Sender};
use lib::upload::{
    clear_documents, describe_progress, upload_document, Document, UploadOptions, UploadOutcome,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Parser)]
#[command(name = "docchat")]
#[command(about = "Chat with an analysis backend about an uploaded PDF", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: DOCCHAT_CONFIG_PATH or ~/.docchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Interactive chat. Type /help inside the session for commands.
    Chat {
        /// Config file path (default: DOCCHAT_CONFIG_PATH or ~/.docchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Model to answer with: gemini, azure or ollama (default from config).
        #[arg(long, short)]
        model: Option<String>,

        /// PDF to upload before the first question.
        #[arg(long, short, value_name = "PDF")]
        document: Option<PathBuf>,
    },

    /// Upload a PDF and wait until the backend has indexed it.
    Upload {
        /// Config file path (default: DOCCHAT_CONFIG_PATH or ~/.docchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// PDF file to upload.
        path: PathBuf,
    },

    /// Show backend health and document processing status.
    Status {
        /// Config file path (default: DOCCHAT_CONFIG_PATH or ~/.docchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Remove every uploaded document from the backend.
    Clear {
        /// Config file path (default: DOCCHAT_CONFIG_PATH or ~/.docchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("docchat {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Chat {
            config,
            model,
            document,
        }) => run_chat(config, model, document).await,
        Some(Commands::Upload { config, path }) => run_upload(config, path).await,
        Some(Commands::Status { config }) => run_status(config).await,
        Some(Commands::Clear { config }) => run_clear(config).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

fn connect(config: &Config) -> BackendClient {
    let base_url = config::resolve_base_url(config);
    log::info!("using backend at {}", base_url);
    BackendClient::new(Some(base_url))
}

async fn run_chat(
    config_path: Option<PathBuf>,
    model: Option<String>,
    document: Option<PathBuf>,
) -> anyhow::Result<()> {
    let (config, _path) = config::load_config(config_path)?;
    let client = connect(&config);
    let model = match model {
        Some(m) => m.parse::<Model>().map_err(anyhow::Error::msg)?,
        None => config.chat.default_model,
    };
    let chat_options = ChatOptions::from_config(&config);
    let upload_options = UploadOptions::from_config(&config);

    if config.backend.clear_on_start {
        match client.clear().await {
            Ok(res) => log::info!(
                "cleared previous documents: {}",
                res.message.unwrap_or_default()
            ),
            Err(e) => log::warn!("could not clear previous documents: {}", e),
        }
    }

    let interrupts = Interrupts::install();
    let mut session = ChatSession::new(model);
    let mut printed = print_new(&session, 0);
    println!("(model: {}; type /help for commands)", session.selected_model().display_name());

    if let Some(path) = document {
        upload_interactive(&mut session, &client, &interrupts, &path, &upload_options).await;
        printed = print_new(&session, printed);
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            let (name, arg) = match command.split_once(char::is_whitespace) {
                Some((name, arg)) => (name, arg.trim()),
                None => (command, ""),
            };
            match name.to_ascii_lowercase().as_str() {
                "exit" | "quit" => break,
                "help" => print_help(),
                "upload" => {
                    if arg.is_empty() {
                        println!("usage: /upload <path to pdf>");
                    } else {
                        upload_interactive(
                            &mut session,
                            &client,
                            &interrupts,
                            Path::new(arg),
                            &upload_options,
                        )
                        .await;
                    }
                }
                "model" => {
                    if arg.is_empty() {
                        let ids: Vec<&str> = Model::ALL.iter().map(|m| m.id()).collect();
                        println!(
                            "model: {} (available: {})",
                            session.selected_model(),
                            ids.join(", ")
                        );
                    } else {
                        match arg.parse::<Model>() {
                            Ok(m) => {
                                session.select_model(m);
                                println!("model set to {}", m.display_name());
                            }
                            Err(e) => println!("{}", e),
                        }
                    }
                }
                "clear" => {
                    // The outcome is already recorded as a session message.
                    let _ = clear_documents(&mut session, &client).await;
                }
                "reset" => {
                    session.reset_session();
                    printed = 0;
                }
                "status" => {
                    if let Err(e) = print_status(&client).await {
                        println!("status unavailable: {}", e);
                    }
                }
                other => println!("unknown command /{} (try /help)", other),
            }
            printed = print_new(&session, printed);
            continue;
        }

        let result = send_message(
            &mut session,
            &client,
            input,
            &chat_options,
            &mut |chunk| {
                print!("{}", chunk);
                let _ = io::stdout().flush();
            },
        )
        .await;
        match result {
            Ok(outcome) => {
                println!();
                if let Some(reply) = session.message(outcome.reply) {
                    match &outcome.status {
                        ReplyStatus::Completed => print_sources(reply),
                        ReplyStatus::Truncated => {
                            print_sources(reply);
                            println!("(the reply ended before the server finished)");
                        }
                        ReplyStatus::Failed(_) => println!("! {}", reply.text()),
                    }
                }
                printed = session.messages().len();
            }
            Err(ChatError::UploadRequired) => {
                println!("Upload a PDF first with /upload <path>.");
            }
            Err(e) => println!("{}", e),
        }
    }

    Ok(())
}

fn print_help() {
    println!("/upload <path>  upload a PDF (replaces earlier documents)");
    println!("/model [id]     show or change the model");
    println!("/clear          remove uploaded documents from the server");
    println!("/reset          start over with an empty conversation");
    println!("/status         show document processing status");
    println!("/exit           leave");
}

/// Print messages from index `from` on; returns the new printed count.
fn print_new(session: &ChatSession, from: usize) -> usize {
    let messages = session.messages();
    for message in messages.iter().skip(from) {
        match (message.sender(), message.is_error()) {
            (Sender::User, _) => {}
            (_, true) => println!("! {}", message.text()),
            (Sender::System, false) => println!("* {}", message.text()),
            (Sender::Assistant, false) => println!("< {}", message.text()),
        }
    }
    messages.len()
}

fn print_sources(reply: &Message) {
    if reply.sources().is_empty() {
        return;
    }
    println!("Sources:");
    for source in reply.sources() {
        let page = source
            .page
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  - {} (page {}, score {:.2})",
            source.file_name,
            page,
            source.score.unwrap_or(0.0)
        );
    }
}

fn print_progress(progress: &PollProgress) {
    match &progress.snapshot {
        Some(snapshot) => eprintln!(
            "  [{}/{}] {:?}: {}",
            progress.attempt,
            progress.max_attempts,
            progress.job_status,
            describe_progress(snapshot)
        ),
        None => eprintln!(
            "  [{}/{}] server unreachable, retrying",
            progress.attempt, progress.max_attempts
        ),
    }
}

/// Routes Ctrl-C for the whole process. While an upload is in progress the signal cancels
/// it; otherwise the process exits as it would without a handler.
#[derive(Clone, Default)]
struct Interrupts {
    active: Arc<Mutex<Option<CancelToken>>>,
}

impl Interrupts {
    /// Spawn the single signal listener. Installing a handler replaces the default SIGINT
    /// action for good, so there must be exactly one per command.
    fn install() -> Self {
        let interrupts = Self::default();
        let listener = interrupts.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !listener.interrupt() {
                    std::process::exit(130);
                }
            }
        });
        interrupts
    }

    /// Cancel the current operation, if any. Returns false when nothing was running.
    fn interrupt(&self) -> bool {
        match self.slot().take() {
            Some(token) => {
                log::info!("interrupted, cancelling current upload");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(&self) -> CancelToken {
        let token = CancelToken::new();
        *self.slot() = Some(token.clone());
        token
    }

    fn end(&self) {
        self.slot().take();
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancelToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Upload with Ctrl-C wired to cancel the POST and the polling.
async fn upload_interactive(
    session: &mut ChatSession,
    client: &BackendClient,
    interrupts: &Interrupts,
    path: &Path,
    options: &UploadOptions,
) -> Option<UploadOutcome> {
    let document = match Document::from_path(path).await {
        Ok(d) => d,
        Err(e) => {
            session.append_system_message(e.to_string(), true);
            return None;
        }
    };
    let cancel = interrupts.begin();
    let result = upload_document(
        session,
        client,
        &document,
        options,
        &cancel,
        &mut |p: &PollProgress| print_progress(p),
    )
    .await;
    interrupts.end();
    result.ok()
}

async fn run_upload(config_path: Option<PathBuf>, path: PathBuf) -> anyhow::Result<()> {
    let (config, _path) = config::load_config(config_path)?;
    let client = connect(&config);
    let interrupts = Interrupts::install();
    let mut session = ChatSession::new(config.chat.default_model);
    let printed = session.messages().len();
    let options = UploadOptions::from_config(&config);
    let outcome = upload_interactive(&mut session, &client, &interrupts, &path, &options).await;
    print_new(&session, printed);
    match outcome {
        Some(UploadOutcome::Ready) => Ok(()),
        Some(other) => anyhow::bail!("upload of {} did not complete: {:?}", path.display(), other),
        None => anyhow::bail!("upload of {} was rejected", path.display()),
    }
}

async fn print_status(client: &BackendClient) -> anyhow::Result<()> {
    let status: StatusResponse = client.status().await?;
    println!(
        "{} ({})",
        describe_progress(&ProgressSnapshot::from(&status)),
        status.status.as_deref().unwrap_or("unknown")
    );
    for file in &status.files_detail {
        match &file.error {
            Some(error) => println!("  - {}: {} ({})", file.filename, file.status, error),
            None => println!("  - {}: {}", file.filename, file.status),
        }
    }
    Ok(())
}

async fn run_status(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _path) = config::load_config(config_path)?;
    let client = connect(&config);
    let health = client.health().await?;
    println!(
        "backend {}: {}{}",
        client.base_url(),
        health.status,
        health
            .message
            .map(|m| format!(" ({})", m))
            .unwrap_or_default()
    );
    print_status(&client).await
}

async fn run_clear(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _path) = config::load_config(config_path)?;
    let client = connect(&config);
    let res = client.clear().await?;
    println!(
        "{}",
        res.message
            .unwrap_or_else(|| "All documents cleared.".to_string())
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_cancels_only_the_active_upload() {
        let interrupts = Interrupts::default();
        assert!(!interrupts.interrupt());

        let first = interrupts.begin();
        assert!(interrupts.interrupt());
        assert!(first.is_cancelled());
        assert!(!interrupts.interrupt());

        let second = interrupts.begin();
        assert!(!second.is_cancelled());
        interrupts.end();
        assert!(!interrupts.interrupt());
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn repeated_uploads_share_one_listener() {
        let interrupts = Interrupts::install();
        for _ in 0..3 {
            let token = interrupts.begin();
            assert!(interrupts.interrupt());
            token.cancelled().await;
            interrupts.end();
        }
        assert!(!interrupts.interrupt());
    }
}
