//! Carga y gestión de configuración de la aplicación (Neo4j + LLM + límites
//! de recuperación y rutas de trabajo).

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Backend del almacén de notas. El de memoria no necesita Neo4j ni
/// embeddings y reindexa el directorio de notas al arrancar.
#[derive(Clone, Debug)]
pub enum StoreBackend {
    Neo4j,
    Memory,
}

impl StoreBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "neo4j" => Ok(Self::Neo4j),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("Backend de almacén no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub store_backend: StoreBackend,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,
    pub llm_vision_model: String,

    /// Directorio con los JSON estructurados que alimentan el índice.
    pub notes_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub raw_dir: PathBuf,
    pub summary_dir: PathBuf,

    pub default_top_k: usize,
    pub max_context_chars_per_doc: usize,
    pub max_total_context_chars: usize,
    pub store_timeout_secs: u64,
    pub llm_timeout_secs: u64,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let store_backend_str =
            env::var("STORE_BACKEND").unwrap_or_else(|_| "neo4j".to_string());
        let store_backend = StoreBackend::from_str(&store_backend_str)?;

        // Las credenciales de Neo4j sólo son obligatorias con ese backend.
        let (neo4j_uri, neo4j_user, neo4j_password) = match store_backend {
            StoreBackend::Neo4j => (
                env::var("NEO4J_URI").map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?,
                env::var("NEO4J_USER").map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?,
                env::var("NEO4J_PASSWORD")
                    .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?,
            ),
            StoreBackend::Memory => (
                env::var("NEO4J_URI").unwrap_or_default(),
                env::var("NEO4J_USER").unwrap_or_default(),
                env::var("NEO4J_PASSWORD").unwrap_or_default(),
            ),
        };

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8001".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let llm_vision_model =
            env::var("LLM_VISION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let notes_dir = env_path("NOTES_DIR", "outputs/clean");
        let uploads_dir = env_path("UPLOADS_DIR", "uploads");
        let raw_dir = env_path("RAW_DIR", "outputs/raw");
        let summary_dir = env_path("SUMMARY_DIR", "outputs/task2");

        let default_top_k = env_usize("DEFAULT_TOP_K", 10)?;
        let max_context_chars_per_doc = env_usize("MAX_CONTEXT_CHARS_PER_DOC", 1200)?;
        let max_total_context_chars = env_usize("MAX_TOTAL_CONTEXT_CHARS", 3500)?;
        let store_timeout_secs = env_u64("STORE_TIMEOUT_SECS", 30)?;
        let llm_timeout_secs = env_u64("LLM_TIMEOUT_SECS", 60)?;

        Ok(Self {
            store_backend,
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            llm_vision_model,
            notes_dir,
            uploads_dir,
            raw_dir,
            summary_dir,
            default_top_k,
            max_context_chars_per_doc,
            max_total_context_chars,
            store_timeout_secs,
            llm_timeout_secs,
        })
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow!("{key} debe ser un entero, no '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow!("{key} debe ser un entero, no '{raw}'")),
        Err(_) => Ok(default),
    }
}
