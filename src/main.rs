use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use colored::*;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use ragdesk_cli::{ChatSession, UploadPipeline, ui};
use ragdesk_client::{ApiClient, AuthContext, ChatApi, ClientConfig, KnowledgeBaseApi};
use ragdesk_core::{NewChat, RetrievalQuery, UploadStatus};

/// How long to wait for citation source names before printing without them
const CITATION_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "ragdesk")]
#[command(about = "Terminal client for a retrieval-augmented chat backend", long_about = None)]
struct Cli {
    /// Backend API base URL (overrides RAGDESK_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and print the access token to export
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// List your conversations
    Chats,
    /// Start a conversation over one or more knowledge bases
    NewChat {
        title: String,
        #[arg(long = "kb", required = true)]
        kb_ids: Vec<i64>,
    },
    /// List the documents stored in a knowledge base
    Documents { kb_id: i64 },
    /// Print the history of a conversation
    History { chat_id: i64 },
    /// Chat interactively in an existing conversation
    Chat { chat_id: i64 },
    /// Upload documents into a knowledge base and process them
    Upload {
        kb_id: i64,
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Show how each uploaded file would be chunked
        #[arg(long)]
        preview: bool,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
        /// Upload only; leave processing for later
        #[arg(long)]
        no_process: bool,
    },
    /// Run a retrieval query without generating an answer
    Retrieve {
        kb_id: i64,
        query: String,
        #[arg(long, default_value_t = 3)]
        top_k: usize,
    },
}

struct UploadOptions {
    preview: bool,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
    process: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = ClientConfig::from_env(cli.api_url)?;
    let poll_interval = config.poll_interval;
    tracing::debug!(api_url = %config.api_url, "using backend");
    let auth = Arc::new(
        AuthContext::with_token(config.token.clone()).with_unauthorized_handler(ui::print_relogin_hint),
    );
    let client = Arc::new(ApiClient::new(config, auth)?);

    match cli.command {
        Commands::Login { username, password } => {
            let token = client.login(&username, &password).await?;
            println!("{} Logged in as {}", "✅".green(), username.bold());
            println!("export RAGDESK_TOKEN={}", token);
        }
        Commands::Chats => ui::print_chat_list(&client.list_chats().await?),
        Commands::NewChat { title, kb_ids } => {
            let chat = client
                .create_chat(&NewChat {
                    title,
                    knowledge_base_ids: kb_ids,
                })
                .await?;
            println!(
                "{} Created chat {} ({})",
                "✅".green(),
                chat.id.to_string().bold(),
                chat.title
            );
            println!("Continue with: ragdesk chat {}", chat.id);
        }
        Commands::Documents { kb_id } => ui::print_document_list(&client.list_documents(kb_id).await?),
        Commands::History { chat_id } => show_history(client, chat_id).await?,
        Commands::Chat { chat_id } => run_chat(client, chat_id).await?,
        Commands::Upload {
            kb_id,
            files,
            preview,
            chunk_size,
            chunk_overlap,
            no_process,
        } => {
            let options = UploadOptions {
                preview,
                chunk_size,
                chunk_overlap,
                process: !no_process,
            };
            run_upload(client, kb_id, files, options, poll_interval).await?;
        }
        Commands::Retrieve {
            kb_id,
            query,
            top_k,
        } => {
            let hits = client
                .test_retrieval(&RetrievalQuery { query, kb_id, top_k })
                .await?;
            ui::print_retrieval_hits(&hits);
        }
    }

    Ok(())
}

/// Give citation source lookups a moment so answers print with source names
async fn wait_for_citations(session: &mut ChatSession<ApiClient>) {
    if tokio::time::timeout(CITATION_WAIT, session.resolve_citations())
        .await
        .is_err()
    {
        tracing::debug!("citation sources still loading, printing without them");
    }
}

async fn show_history(client: Arc<ApiClient>, chat_id: i64) -> Result<()> {
    let mut session = ChatSession::open(client, chat_id).await?;
    wait_for_citations(&mut session).await;
    ui::display_chat_banner(session.title(), chat_id);
    for message in session.messages() {
        ui::print_message(message, &session.render(message));
    }
    Ok(())
}

async fn run_chat(client: Arc<ApiClient>, chat_id: i64) -> Result<()> {
    let mut session = ChatSession::open(client, chat_id).await?;
    wait_for_citations(&mut session).await;
    ui::display_chat_banner(session.title(), chat_id);
    for message in session.messages() {
        ui::print_message(message, &session.render(message));
    }

    while let Some(input) = ui::read_prompt()? {
        if input.is_empty() {
            continue;
        }

        match input.to_lowercase().as_str() {
            "exit" | "quit" => {
                println!("{}", "👋 Goodbye!".green());
                break;
            }
            "help" => {
                ui::print_help();
                continue;
            }
            _ => {}
        }

        println!("{}", "assistant>".blue().bold());
        let live = ui::LiveAnswer::new();
        let on_delta = |delta: &str| live.push(delta);
        let sent = session.send(&input, &on_delta).await.map(|reply| reply.clone());
        match sent {
            Ok(reply) => {
                wait_for_citations(&mut session).await;
                if session.scroll().take_scroll_request() {
                    live.finish(&session.render(&reply))?;
                    println!();
                }
            }
            Err(e) if e.is_unauthorized() => return Err(e.into()),
            Err(e) => {
                println!();
                ui::print_error(&e);
            }
        }
    }

    Ok(())
}

async fn run_upload(
    client: Arc<ApiClient>,
    kb_id: i64,
    files: Vec<PathBuf>,
    options: UploadOptions,
    poll_interval: Duration,
) -> Result<()> {
    let pipeline = UploadPipeline::new(client, kb_id, poll_interval);
    let added = pipeline.add_files(files);
    println!("{} Uploading {} file(s)...", "📤".blue(), added);

    let uploaded = match pipeline.upload().await {
        Ok(files) => files,
        Err(e) => {
            ui::print_file_table(&pipeline.files());
            return Err(e.into());
        }
    };
    ui::print_file_table(&uploaded);

    if options.preview {
        for file in uploaded.iter().filter(|f| f.document_id.or(f.upload_id).is_some()) {
            match pipeline
                .preview(&file.path, options.chunk_size, options.chunk_overlap)
                .await
            {
                Ok(preview) => ui::print_preview(&file.file_name, &preview),
                Err(e) => println!("{} Preview of {} failed: {}", "⚠️".yellow(), file.file_name, e),
            }
        }
    }

    if !options.process {
        return Ok(());
    }

    pipeline.start_processing().await?;

    let mut updates = pipeline.subscribe();
    let settled = loop {
        let snapshot = updates.borrow_and_update().clone();
        if !snapshot.polling {
            break snapshot;
        }
        let done = snapshot.files.iter().filter(|f| f.status.is_terminal()).count();
        print!("\r{} Processing... {}/{}", "🔄".yellow(), done, snapshot.files.len());
        io::stdout().flush()?;
        if updates.changed().await.is_err() {
            break pipeline.snapshot();
        }
    };
    println!();
    ui::print_file_table(&settled.files);

    let failed = settled
        .files
        .iter()
        .filter(|f| f.status == UploadStatus::Error)
        .count();
    if failed > 0 {
        bail!("{} file(s) failed", failed);
    }
    println!("{} All files processed", "✅".green());
    Ok(())
}
