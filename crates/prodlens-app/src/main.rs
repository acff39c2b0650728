//! ProdLens application binary - composition root.
//!
//! 1. Load configuration from TOML
//! 2. Open the product catalog, vector snapshot and session store
//! 3. Build the model clients and wire them into the orchestrator
//! 4. Run the chosen subcommand (HTTP API, REPL, one-shot question, ...)

mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use prodlens_api::state::AppState;
use prodlens_chat::{ChatError, ChatOrchestrator, Collaborators, QueryResponse, SessionSummary};
use prodlens_core::config::{LlmConfig, ProdLensConfig};
use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::prompts::PromptLibrary;
use prodlens_core::services::{EmbeddingService, StatementExecutor};
use prodlens_core::types::{HistoryEntry, SessionId, TabularResult};
use prodlens_llm::{HttpLlmClient, HttpLlmClientConfig, LlmQueryTranslator};
use prodlens_storage::{
    Database, InMemorySessionStore, SessionStore, SqliteSessionStore, SqliteStatementExecutor,
};
use prodlens_vector::{MockEmbedding, VectorIndex, MOCK_MODEL_NAME};

use cli::{CliArgs, Command};

type BoxError = Box<dyn std::error::Error>;

/// Stands in for the catalog when none could be opened, so structured
/// lookups degrade to an apology instead of preventing startup.
struct MissingCatalog {
    reason: String,
}

#[async_trait]
impl StatementExecutor for MissingCatalog {
    async fn execute(&self, _statement: &str) -> Result<TabularResult> {
        Err(ProdLensError::Sql(self.reason.clone()))
    }
}

fn init_tracing(args: &CliArgs, config: &ProdLensConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.resolve_log_level(&config.general.log_level)));
    // stdout belongs to answers; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_catalog(config: &ProdLensConfig) -> (Arc<dyn StatementExecutor>, String) {
    let db_path = config.data_path(&config.catalog.database_path);
    let catalog = match SqliteStatementExecutor::open(&db_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::warn!(
                path = %db_path.display(),
                error = %e,
                "Catalog unavailable, structured lookups will fail"
            );
            return (
                Arc::new(MissingCatalog {
                    reason: e.to_string(),
                }),
                String::new(),
            );
        }
    };

    let schema_path = config.data_path(&config.catalog.schema_path);
    let schema = match std::fs::read_to_string(&schema_path) {
        Ok(schema) => schema,
        Err(_) => {
            tracing::info!(path = %schema_path.display(), "No schema file, describing catalog");
            catalog.describe_schema().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to describe catalog schema");
                String::new()
            })
        }
    };
    (Arc::new(catalog), schema)
}

/// Load the vector snapshot. A missing or unreadable snapshot leaves the
/// index empty; one built with embeddings of another length is an error.
fn open_index(path: &Path, dimensions: usize) -> Result<VectorIndex> {
    if !path.is_file() {
        tracing::warn!(path = %path.display(), "No vector snapshot, retrieval will find nothing");
        return Ok(VectorIndex::new());
    }
    let index = match VectorIndex::load_jsonl(path) {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to load vector snapshot");
            return Ok(VectorIndex::new());
        }
    };
    match index.dimensions() {
        Some(found) if found != dimensions => Err(ProdLensError::Config(format!(
            "vector snapshot {} holds {}-dimensional embeddings but the embedding model produces {}",
            path.display(),
            found,
            dimensions
        ))),
        _ => Ok(index),
    }
}

fn embedding_service(config: &LlmConfig, llm: &HttpLlmClient) -> Arc<dyn EmbeddingService> {
    if config.embedding_model == MOCK_MODEL_NAME {
        tracing::info!(dimensions = config.embedding_dimensions, "Using offline mock embeddings");
        return Arc::new(MockEmbedding::with_dimensions(config.embedding_dimensions));
    }
    Arc::new(llm.clone())
}

/// Write the default configuration to `path`, refusing to replace an
/// existing file unless `force` is set.
fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(ProdLensError::Config(format!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        )));
    }
    ProdLensConfig::default().save(path)
}

fn open_sessions(config: &ProdLensConfig) -> Result<Arc<dyn SessionStore>> {
    if config.storage.session_db.trim().is_empty() {
        tracing::info!("Sessions kept in memory");
        return Ok(Arc::new(InMemorySessionStore::new()));
    }
    let path = config.data_path(&config.storage.session_db);
    let db = Database::new(&path)?;
    tracing::info!(path = %path.display(), "Session store opened");
    Ok(Arc::new(SqliteSessionStore::new(Arc::new(db))))
}

fn build_orchestrator(config: &ProdLensConfig) -> std::result::Result<ChatOrchestrator, BoxError> {
    std::fs::create_dir_all(config.data_dir())?;

    let prompts = Arc::new(PromptLibrary::from_config(&config.prompts)?);
    let llm = HttpLlmClient::new(HttpLlmClientConfig::from_llm_config(&config.llm))?;
    if !llm.has_api_key() {
        tracing::warn!(env = %config.llm.api_key_env, "No API key set, model calls will fail");
    }
    let chat_model = config.llm.chat_model.clone();
    let translator_llm = llm
        .with_profile(config.llm.translator_model.clone(), config.llm.translator_temperature)
        .with_max_tokens(config.llm.translator_max_tokens);

    let (statements, schema_description) = open_catalog(config);
    let embeddings = embedding_service(&config.llm, &llm);
    let index = open_index(
        &config.data_path(&config.retrieval.index_path),
        embeddings.dimensions(),
    )?;

    let collaborators = Collaborators {
        rewriter: Arc::new(llm.with_profile(chat_model.clone(), config.llm.rewrite_temperature)),
        responder: Arc::new(llm.with_profile(chat_model.clone(), config.llm.synthesis_temperature)),
        decisions: Arc::new(llm.with_profile(chat_model, config.llm.decision_temperature)),
        translator: Arc::new(LlmQueryTranslator::new(Arc::new(translator_llm), prompts.clone())),
        statements,
        embeddings,
        search: Arc::new(index),
        sessions: open_sessions(config)?,
        prompts,
        schema_description,
    };
    Ok(ChatOrchestrator::new(config, collaborators))
}

/// Periodically drop idle sessions. No-op when the TTL is zero.
fn spawn_eviction(orchestrator: Arc<ChatOrchestrator>, ttl_minutes: u64) {
    if ttl_minutes == 0 {
        return;
    }
    let period = Duration::from_secs((ttl_minutes * 60 / 4).clamp(30, 600));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = orchestrator.evict_idle(chrono::Utc::now()).await {
                tracing::warn!(error = %e, "Idle session eviction failed");
            }
        }
    });
}

fn print_history(history: &[HistoryEntry]) {
    if history.is_empty() {
        println!("(no messages)");
    }
    for entry in history {
        println!(
            "[{}] {}: {}",
            entry.at.format("%Y-%m-%d %H:%M:%S"),
            entry.speaker.label(),
            entry.text
        );
    }
}

fn print_sessions(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("(no sessions)");
    }
    for session in sessions {
        println!(
            "{}  {} messages  last active {}",
            session.session_id,
            session.message_count,
            session.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_metadata(response: &QueryResponse) {
    println!("  standalone query: {}", response.standalone_query);
    println!("  route: {}", response.route);
    println!("  reasoning: {}", response.reasoning);
    if let Some(filter) = response.content_filter {
        println!("  content: {}", filter);
    }
    if let Some(reasoning) = &response.content_reasoning {
        println!("  content reasoning: {}", reasoning);
    }
    if let Some(id) = response.resolved_entity_id {
        println!("  product_id: {}", id);
    }
    if let Some(statement) = response.statement() {
        println!("  statement: {}", statement);
    }
    if let Some(error) = &response.error {
        println!("  error: {}", error);
    }
}

async fn repl(
    orchestrator: &ChatOrchestrator,
    session: Option<String>,
    show_metadata: bool,
) -> std::result::Result<(), BoxError> {
    // A named session resumes where it left off.
    let mut session_id = match session {
        Some(name) => SessionId::parse(&name).ok_or(ChatError::InvalidSessionId(name))?,
        None => orchestrator.new_conversation(None).await?,
    };
    println!("ProdLens chat, session {}. /new, /history, /quit", session_id);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                session_id = orchestrator.new_conversation(None).await?;
                println!("New conversation {}", session_id);
            }
            "/history" => print_history(&orchestrator.history(session_id.as_str()).await?),
            message => match orchestrator.query(message, Some(session_id.as_str())).await {
                Ok(response) => {
                    println!("{}", response.final_answer);
                    if show_metadata {
                        print_metadata(&response);
                    }
                }
                Err(e) if e.is_caller_error() => println!("{}", e),
                Err(e) => return Err(e.into()),
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), BoxError> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = ProdLensConfig::load_or_default(&config_file);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    init_tracing(&args, &config);

    if let Command::Init { force } = args.command {
        write_default_config(&config_file, force)?;
        println!("Wrote {}", config_file.display());
        return Ok(());
    }
    tracing::info!(
        path = %config_file.display(),
        "Starting ProdLens v{}",
        env!("CARGO_PKG_VERSION")
    );

    let orchestrator = Arc::new(build_orchestrator(&config)?);

    match args.command {
        Command::Serve { .. } => {
            config.api.port = args.resolve_port(config.api.port);
            spawn_eviction(orchestrator.clone(), config.conversation.session_ttl_minutes);
            let state = AppState::new(orchestrator, config.api.clone());
            prodlens_api::start_server(&config.api, state).await?;
        }
        Command::Chat {
            ref session,
            show_metadata,
        } => {
            spawn_eviction(orchestrator.clone(), config.conversation.session_ttl_minutes);
            repl(&orchestrator, session.clone(), show_metadata).await?;
        }
        Command::Ask {
            ref question,
            ref session,
            json,
        } => {
            let response = orchestrator.query(question, session.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.final_answer);
                eprintln!("session: {}", response.session_id);
            }
        }
        Command::History { ref session } => {
            print_history(&orchestrator.history(session).await?);
        }
        Command::Sessions => print_sessions(&orchestrator.list_conversations().await?),
        Command::Forget { ref session } => {
            if orchestrator.delete_conversation(session).await? {
                println!("Deleted {}", session);
            } else {
                println!("No session {}", session);
            }
        }
        Command::Graph => println!("{}", orchestrator.graph_mermaid()),
        Command::Init { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prodlens_vector::IndexEntry;
    use serde_json::Map;

    fn snapshot(dir: &Path, dimensions: usize) -> std::path::PathBuf {
        let path = dir.join("vectors.jsonl");
        let entry = IndexEntry {
            id: "spec-1".to_string(),
            content: "Refresh rate is measured in Hz.".to_string(),
            metadata: Map::new(),
            embedding: vec![0.5; dimensions],
        };
        std::fs::write(&path, serde_json::to_string(&entry).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_open_index_checks_embedding_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot(dir.path(), 4);
        assert_eq!(open_index(&path, 4).unwrap().len(), 1);
        let err = open_index(&path, 1536).unwrap_err();
        assert!(matches!(err, ProdLensError::Config(_)));
        assert!(err.to_string().contains("4-dimensional"));
    }

    #[test]
    fn test_open_index_without_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir.path().join("missing.jsonl"), 1536).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_mock_embedding_model_selects_offline_embeddings() {
        let remote = ProdLensConfig::default();
        let llm = HttpLlmClient::new(HttpLlmClientConfig::from_llm_config(&remote.llm)).unwrap();
        assert_eq!(embedding_service(&remote.llm, &llm).dimensions(), 1536);

        let mut offline = ProdLensConfig::default();
        offline.llm.embedding_model = MOCK_MODEL_NAME.to_string();
        offline.llm.embedding_dimensions = 32;
        assert_eq!(embedding_service(&offline.llm, &llm).dimensions(), 32);
    }

    #[test]
    fn test_write_default_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path, false).unwrap();
        let loaded = ProdLensConfig::load(&path).unwrap();
        assert_eq!(loaded.api.port, ProdLensConfig::default().api.port);

        assert!(matches!(
            write_default_config(&path, false),
            Err(ProdLensError::Config(_))
        ));
        write_default_config(&path, true).unwrap();
    }
}
