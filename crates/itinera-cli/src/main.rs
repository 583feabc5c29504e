use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itinera_channels::WebChannel;
use itinera_config::{
    data_dir, find_config_path, load_config, resolve_path, save_config, Config, EmbeddingProvider,
};
use itinera_core::agent::{AgentLoop, RigModel};
use itinera_core::index::{
    ChunkingConfig, Document, DocumentIndex, Embedder, HashingEmbedder, IndexCache, RigEmbedder,
};
use itinera_core::{
    AgentError, ChatSession, Presenter, ResetScope, Role, SessionFactory, TranscriptBuffer,
};
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, EmbeddingsClient, Nothing};
use rig::providers::{anthropic, deepseek, groq, ollama, openai, openrouter};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio_util::sync::CancellationToken;

/// Render markdown text to the terminal using termimad.
fn render_markdown(text: &str) {
    let skin = termimad::MadSkin::default();
    skin.print_text(text);
}

/// Save terminal attributes for later restoration.
#[cfg(unix)]
fn save_terminal_state() -> Option<nix::sys::termios::Termios> {
    nix::sys::termios::tcgetattr(std::io::stdin()).ok()
}

/// Restore previously saved terminal attributes.
#[cfg(unix)]
fn restore_terminal_state(saved: &nix::sys::termios::Termios) {
    let _ = nix::sys::termios::tcsetattr(
        std::io::stdin(),
        nix::sys::termios::SetArg::TCSADRAIN,
        saved,
    );
}

/// Flush any pending input from the terminal.
#[cfg(unix)]
fn flush_pending_input() {
    let _ = nix::sys::termios::tcflush(std::io::stdin(), nix::sys::termios::FlushArg::TCIFLUSH);
}

#[derive(Parser)]
#[command(name = "itinera", about = "Travel itinerary assistant", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant
    Chat {
        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,

        /// Session ID used in logs
        #[arg(short, long, default_value = "cli")]
        session: String,
    },
    /// Index documents and report what was indexed
    Index {
        /// Extra files or glob patterns, added to index.documents
        paths: Vec<String>,
    },
    /// Search the indexed documents directly
    Search {
        query: String,

        /// Number of results
        #[arg(short, default_value_t = 4)]
        k: usize,
    },
    /// Serve the web chat widget
    Serve,
    /// Create a config file
    Onboard {
        /// Skip interactive prompts and write defaults
        #[arg(long)]
        non_interactive: bool,
    },
    /// Show configuration summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Provider keys may live in a .env next to the working directory
    let _ = dotenvy::dotenv();

    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},itinera_core::agent=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(find_config_path);

    match cli.command {
        Commands::Onboard { non_interactive } => run_onboard(&config_path, non_interactive),
        Commands::Status => run_status(&config_path),
        Commands::Index { paths } => {
            let config = load_checked_config(&config_path)?;
            run_index(&config, &paths).await
        }
        Commands::Search { query, k } => {
            let config = load_checked_config(&config_path)?;
            run_search(&config, &query, k).await
        }
        Commands::Chat { message, session } => {
            let config = load_checked_config(&config_path)?;
            let factory = build_session_factory(&config).await?;
            let mut chat = factory.new_session(session)?;
            match message {
                Some(msg) => run_single_message(&mut chat, &msg).await,
                None => run_interactive(&mut chat).await,
            }
        }
        Commands::Serve => {
            let config = load_checked_config(&config_path)?;
            run_serve(&config).await
        }
    }
}

fn load_checked_config(path: &Path) -> Result<Config> {
    let config = load_config(path)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Resolve an API key from config, falling back to an environment variable.
fn resolve_api_key(
    provider_cfg: &Option<itinera_config::ProviderConfig>,
    env_var: &str,
) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

fn api_base(provider_cfg: &Option<itinera_config::ProviderConfig>) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_base.clone())
        .filter(|b| !b.is_empty())
}

fn missing_key(provider: &str, field: &str, env_var: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "{provider} provider selected but no API key found. \
         Set providers.{field}.apiKey in config.json or {env_var} env var."
    )
}

/// Create a completion model for a specific provider + model combination.
///
/// Errors clearly if provider is unknown or has no API key.
#[allow(deprecated)]
fn create_model_for(
    provider: &str,
    model_name: &str,
    config: &Config,
) -> Result<CompletionModelHandle<'static>> {
    if model_name.is_empty() {
        anyhow::bail!("No model configured for provider '{provider}'.");
    }

    match provider {
        "anthropic" => {
            let key = resolve_api_key(&config.providers.anthropic, "ANTHROPIC_API_KEY")
                .ok_or_else(|| missing_key("Anthropic", "anthropic", "ANTHROPIC_API_KEY"))?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Anthropic provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openai" => {
            let key = resolve_api_key(&config.providers.openai, "OPENAI_API_KEY")
                .ok_or_else(|| missing_key("OpenAI", "openai", "OPENAI_API_KEY"))?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(ref base) = api_base(&config.providers.openai) {
                builder = builder.base_url(base);
                tracing::info!("Using OpenAI provider with custom base: {base}");
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(ref base) = api_base(&config.providers.ollama) {
                builder = builder.base_url(base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openrouter" => {
            let key = resolve_api_key(&config.providers.openrouter, "OPENROUTER_API_KEY")
                .ok_or_else(|| missing_key("OpenRouter", "openrouter", "OPENROUTER_API_KEY"))?;
            let client: openrouter::Client = openrouter::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create OpenRouter client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenRouter provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "deepseek" => {
            let key = resolve_api_key(&config.providers.deepseek, "DEEPSEEK_API_KEY")
                .ok_or_else(|| missing_key("DeepSeek", "deepseek", "DEEPSEEK_API_KEY"))?;
            let client: deepseek::Client = deepseek::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create DeepSeek client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using DeepSeek provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "groq" => {
            let key = resolve_api_key(&config.providers.groq, "GROQ_API_KEY")
                .ok_or_else(|| missing_key("Groq", "groq", "GROQ_API_KEY"))?;
            let client: groq::Client = groq::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create Groq client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Groq provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        other => {
            anyhow::bail!(
                "Unknown provider '{other}'. \
                 Valid providers: anthropic, openai, ollama, openrouter, deepseek, groq"
            );
        }
    }
}

fn create_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let embedding = &config.index.embedding;
    match embedding.provider {
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedder::new(embedding.dimensions))),
        EmbeddingProvider::Openai => {
            let key = resolve_api_key(&config.providers.openai, "OPENAI_API_KEY")
                .ok_or_else(|| missing_key("OpenAI embedding", "openai", "OPENAI_API_KEY"))?;
            let mut builder = openai::Client::builder().api_key(&key);
            if let Some(ref base) = api_base(&config.providers.openai) {
                builder = builder.base_url(base);
            }
            let client: openai::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.embedding_model(&embedding.model);
            tracing::info!("Using OpenAI embeddings with model '{}'", embedding.model);
            Ok(Arc::new(RigEmbedder::new(model, embedding.model.clone())))
        }
    }
}

/// Expand configured documents plus `extra` (files or glob patterns).
fn document_paths(config: &Config, extra: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in config.index.documents.iter().chain(extra) {
        let resolved = resolve_path(pattern);
        let pattern_str = resolved.to_string_lossy().to_string();
        let matches: Vec<PathBuf> = glob::glob(&pattern_str)
            .map_err(|e| anyhow::anyhow!("Invalid glob pattern '{pattern}': {e}"))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        if matches.is_empty() {
            anyhow::bail!("No documents match '{pattern}'");
        }
        for path in matches {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    Ok(paths)
}

async fn build_index(config: &Config, extra: &[String]) -> Result<Option<DocumentIndex>> {
    let paths = document_paths(config, extra)?;
    if paths.is_empty() {
        tracing::warn!("No documents configured (index.documents); retriever tool disabled");
        return Ok(None);
    }

    let documents = paths
        .iter()
        .map(|p| Document::load(p))
        .collect::<Result<Vec<_>, _>>()?;

    let chunking = ChunkingConfig::new(config.index.chunk_size, config.index.chunk_overlap)?;
    let embedder = create_embedder(config)?;

    let cache = match config.index.cache_path.as_deref().filter(|p| !p.is_empty()) {
        Some(path) => Some(
            IndexCache::new(&resolve_path(path)).context("failed to open index cache")?,
        ),
        None => None,
    };

    let index = DocumentIndex::build_with_cache(documents, &chunking, embedder, cache.as_ref())
        .await
        .context("failed to index documents")?;
    Ok(Some(index))
}

fn brave_api_key(config: &Config) -> String {
    if config.tools.web.search.api_key.is_empty() {
        std::env::var("BRAVE_API_KEY").unwrap_or_default()
    } else {
        config.tools.web.search.api_key.clone()
    }
}

async fn build_session_factory(config: &Config) -> Result<SessionFactory> {
    let mut config = config.clone();
    config.tools.web.search.api_key = brave_api_key(&config);

    let handle = create_model_for(&config.model.provider, &config.model.model, &config)?;
    let model = Arc::new(RigModel::new(handle, config.model.model.clone()));
    let agent = Arc::new(AgentLoop::from_config(model, &config.agent));

    let index = build_index(&config, &[]).await?.map(Arc::new);
    Ok(SessionFactory::new(agent, &config, index))
}

/// Prints each streamed fragment once: only the part of the reply not yet
/// on screen.
struct TerminalPresenter<W: Write> {
    out: W,
    buffer: TranscriptBuffer,
    printed: usize,
}

impl<W: Write> TerminalPresenter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            buffer: TranscriptBuffer::new(),
            printed: 0,
        }
    }

    fn print_pending(&mut self) {
        let text = self.buffer.text();
        if let Some(rest) = text.get(self.printed..) {
            let _ = write!(self.out, "{rest}");
            let _ = self.out.flush();
        }
        self.printed = text.len();
    }
}

/// What is left to print of `full` once `shown` is on screen, or `None`
/// when the final text does not extend what was streamed.
fn unprinted<'a>(shown: &str, full: &'a str) -> Option<&'a str> {
    full.strip_prefix(shown)
}

impl<W: Write + Send> Presenter for TerminalPresenter<W> {
    fn on_token(&mut self, fragment: &str) {
        self.buffer.push(fragment);
        self.print_pending();
    }

    fn on_tool_call(&mut self, name: &str, query: &str) {
        if self.printed > 0 {
            let _ = writeln!(self.out);
        }
        let _ = writeln!(self.out, "  [{name}: {query}]");
        self.buffer.reset();
        self.printed = 0;
    }

    fn on_complete(&mut self, full_text: &str) {
        match unprinted(self.buffer.text(), full_text) {
            Some(rest) => {
                let _ = write!(self.out, "{rest}");
            }
            None => {
                // Final text differs from what streamed (e.g. fallback reply)
                if self.printed > 0 {
                    let _ = writeln!(self.out);
                }
                let _ = write!(self.out, "{full_text}");
            }
        }
        self.buffer.finish(full_text);
        self.printed = full_text.len();
        let _ = writeln!(self.out);
        let _ = self.out.flush();
    }

    fn on_error(&mut self, error: &AgentError) {
        if self.printed > 0 {
            let _ = writeln!(self.out);
        }
        eprintln!("Error: {error}");
    }
}

/// Run one turn; Ctrl-C cancels it.
async fn send_with_interrupt(session: &mut ChatSession, input: &str) -> Result<(), AgentError> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut presenter = TerminalPresenter::new(std::io::stdout());
    let result = session.send(input, &mut presenter, &cancel).await;
    watcher.abort();
    result.map(|_| ())
}

async fn run_single_message(session: &mut ChatSession, message: &str) -> Result<()> {
    send_with_interrupt(session, message).await?;
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  /reset [memory|transcript|all] - Forget the conversation (default: all)");
    println!("  /clear   - Clear the screen and transcript, keep memory");
    println!("  /history - Show this session's transcript");
    println!("  /help    - Show this help");
    println!("  /quit    - Exit");
    println!("  Ctrl-C while a reply streams cancels it");
    println!();
}

fn print_history(session: &ChatSession) {
    if session.transcript().is_empty() {
        println!("(no messages yet)");
        println!();
        return;
    }
    let mut md = String::new();
    for entry in session.transcript() {
        let who = match entry.role {
            Role::User => "you",
            _ => "itinera",
        };
        md.push_str(&format!(
            "**{who}** _{}_\n\n{}\n\n",
            entry.timestamp.with_timezone(&chrono::Local).format("%H:%M"),
            entry.content
        ));
    }
    render_markdown(&md);
}

async fn run_interactive(session: &mut ChatSession) -> Result<()> {
    // Save terminal state for restoration on exit
    #[cfg(unix)]
    let saved_term = save_terminal_state();

    let history_dir = data_dir().join("history");
    std::fs::create_dir_all(&history_dir)?;
    let history_path = history_dir.join("cli_history");

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!(
        "itinera chat with {} tools [{}] (type /help for commands, Ctrl-D to quit)",
        session.tools().len(),
        session.tools().names().join(", ")
    );
    println!();

    let result = loop {
        // Flush any pending input before reading
        #[cfg(unix)]
        flush_pending_input();

        let readline = rl.readline("you> ");
        match readline {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(input);

                if matches!(input, "exit" | "quit" | "/exit" | "/quit" | ":q") {
                    break Ok(());
                }

                if let Some(command) = input.strip_prefix('/') {
                    let mut parts = command.splitn(2, ' ');
                    match (parts.next().unwrap_or(""), parts.next().unwrap_or("").trim()) {
                        ("help", _) => print_help(),
                        ("reset", arg) => match arg.parse::<ResetScope>() {
                            Ok(scope) => {
                                session.reset(scope);
                                println!("Reset {}.", format!("{scope:?}").to_lowercase());
                                println!();
                            }
                            Err(e) => println!("{e}"),
                        },
                        ("clear", _) => {
                            session.reset(ResetScope::Transcript);
                            print!("\x1B[2J\x1B[H");
                            let _ = std::io::stdout().flush();
                        }
                        ("history", _) => print_history(session),
                        (other, _) => {
                            println!("Unknown command /{other}. Type /help for commands.");
                            println!();
                        }
                    }
                    continue;
                }

                println!();
                let _ = send_with_interrupt(session, input).await;
                println!();
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break Ok(());
            }
            Err(err) => {
                eprintln!("Error: {err}");
                break Ok(());
            }
        }
    };

    let _ = rl.save_history(&history_path);

    // Restore terminal state on exit
    #[cfg(unix)]
    if let Some(ref saved) = saved_term {
        restore_terminal_state(saved);
    }

    result
}

async fn run_index(config: &Config, paths: &[String]) -> Result<()> {
    let Some(index) = build_index(config, paths).await? else {
        println!("Nothing to index. Add files to index.documents or pass paths.");
        return Ok(());
    };

    println!("Indexed {} chunks:", index.len());
    for source in index.sources() {
        let count = index.chunks().iter().filter(|c| c.source == source).count();
        println!("  {source}: {count} chunks");
    }
    Ok(())
}

async fn run_search(config: &Config, query: &str, k: usize) -> Result<()> {
    let Some(index) = build_index(config, &[]).await? else {
        println!("No documents configured (index.documents).");
        return Ok(());
    };

    let hits = index.search(query, k).await?;
    if hits.is_empty() {
        println!("No results found.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (lines {}-{})",
            i + 1,
            hit.score,
            hit.chunk.source,
            hit.chunk.start_line,
            hit.chunk.end_line
        );
        println!("{}", hit.chunk.text);
        println!();
    }
    Ok(())
}

async fn run_serve(config: &Config) -> Result<()> {
    let factory = Arc::new(build_session_factory(config).await?);
    let channel = WebChannel::new(config.gateway.clone(), factory);
    let addr = channel.start().await?;
    println!("itinera web chat on http://{addr} (Ctrl-C to stop)");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down web channel");
    channel.stop().await
}

fn prompt_with_default(prompt: &str, default: &str) -> Result<String> {
    print!("{prompt} [{default}]: ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let trimmed = input.trim();
    if trimmed.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Write a config file, asking for the essentials unless `non_interactive`.
fn run_onboard(config_path: &Path, non_interactive: bool) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `itinera onboard` again.");
        return Ok(());
    }

    let mut cfg = Config::default();
    if !non_interactive {
        println!("Interactive setup");
        cfg.model.provider = prompt_with_default(
            "LLM provider (openai/anthropic/ollama/openrouter/deepseek/groq)",
            &cfg.model.provider,
        )?;
        cfg.model.model = prompt_with_default("Model", &cfg.model.model)?;

        let docs = prompt_with_default("Travel documents (comma-separated paths or globs)", "")?;
        cfg.index.documents = docs
            .split(',')
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        let embedding = prompt_with_default("Embeddings (hashing/openai)", "hashing")?;
        if embedding.eq_ignore_ascii_case("openai") {
            cfg.index.embedding.provider = EmbeddingProvider::Openai;
        }

        cfg.gateway.password =
            prompt_with_default("Web chat password (empty for open access)", "")?;
    }

    save_config(config_path, &cfg)?;
    println!("Created config: {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Put provider keys in .env or config.json (e.g. OPENAI_API_KEY, BRAVE_API_KEY)");
    println!("  2. Run `itinera index` to check your documents");
    println!("  3. Run `itinera chat` or `itinera serve`");
    Ok(())
}

/// Show configuration summary.
fn run_status(config_path: &Path) -> Result<()> {
    println!("itinera status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, run `itinera onboard`)",
            config_path.display()
        );
        return Ok(());
    }

    let config = load_config(config_path)?;
    if let Err(e) = config.validate() {
        println!("  Invalid:   {e}");
    }

    println!("  Provider:  {}", config.model.provider);
    println!("  Model:     {}", config.model.model);
    println!(
        "  Agent:     max {} tool attempts, {}s tool timeout, memory key '{}'",
        config.agent.max_iterations, config.agent.tool_timeout_secs, config.agent.memory_key
    );
    println!();

    println!("  Index:");
    println!(
        "    Chunking: {} chars, {} overlap, top {}",
        config.index.chunk_size, config.index.chunk_overlap, config.index.top_k
    );
    println!("    Embeddings: {:?}", config.index.embedding.provider);
    match document_paths(&config, &[]) {
        Ok(paths) => println!("    Documents: {}", paths.len()),
        Err(e) => println!("    Documents: {e}"),
    }
    if let Some(cache) = config.index.cache_path.as_deref() {
        let path = resolve_path(cache);
        println!(
            "    Cache: {} ({})",
            path.display(),
            if path.exists() { "found" } else { "not built" }
        );
    }
    println!();

    println!("  Tools:");
    println!(
        "    Brave Search: {}",
        if !config.tools.web.search.enabled {
            "disabled"
        } else if brave_api_key(&config).is_empty() {
            "not configured"
        } else {
            "configured"
        }
    );
    println!("    Retriever: {}", config.tools.retriever.name);
    println!();

    println!(
        "  Web:       http://{}:{} ({})",
        config.gateway.host,
        config.gateway.port,
        if config.gateway.password.is_empty() {
            "open"
        } else {
            "password protected"
        }
    );

    Ok(())
}
