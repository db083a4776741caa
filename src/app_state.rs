use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::{config::AppConfig, llm::LlmManager, ocr::TextExtractor, vector_store::NoteStore};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn NoteStore>,
    pub llm_manager: LlmManager,
    pub extractor: Arc<dyn TextExtractor>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}
