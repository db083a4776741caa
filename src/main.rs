// Módulos de la aplicación
mod analytics;
mod api;
mod app_state;
mod canonical;
mod config;
mod ingest;
mod llm;
mod models;
mod neo4j_client;
mod ocr;
mod rag;
mod vector_store;

use crate::app_state::{AppState, Status};
use crate::config::StoreBackend;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Inicializar gestor de LLMs y almacén de notas según el backend
    let llm_manager = llm::LlmManager::from_config(&cfg).expect("Error inicializando LLM Manager");

    let store: Arc<dyn vector_store::NoteStore> = match cfg.store_backend {
        StoreBackend::Neo4j => {
            let graph = neo4j_client::connect_from_config(&cfg)
                .await
                .expect("Error conectando a Neo4j");
            neo4j_client::ensure_schema(&graph)
                .await
                .expect("Error asegurando el esquema de Neo4j");
            let graph = Arc::new(graph);
            vector_store::ensure_note_vector_index(&graph)
                .await
                .expect("Error asegurando el índice vectorial");
            Arc::new(vector_store::Neo4jNoteStore::new(
                graph,
                llm_manager.clone(),
            ))
        }
        StoreBackend::Memory => {
            info!("Backend de almacén en memoria: sin Neo4j, índice volátil.");
            Arc::new(vector_store::InMemoryNoteStore::new())
        }
    };

    let extractor: Arc<dyn ocr::TextExtractor> = Arc::new(ocr::VisionOcr::new(
        cfg.llm_vision_model.clone(),
        cfg.llm_timeout_secs,
    ));

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let status = Arc::new(Mutex::new(Status {
        is_busy: false,
        message: "Servidor listo.".to_string(),
        progress: 0.0,
    }));

    // 4. Con almacén volátil, indexar el directorio de notas al arrancar
    if matches!(cfg.store_backend, StoreBackend::Memory) {
        match ingest::reindex_notes_dir(store.as_ref(), &cfg.notes_dir, status.clone()).await {
            Ok(summary) => info!("Índice inicial en memoria listo. {}", summary),
            Err(e) => warn!("No se pudo indexar el directorio de notas al arrancar: {e}"),
        }
        let mut st = status.lock().unwrap();
        st.message = "Servidor listo.".to_string();
        st.progress = 0.0;
    }

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        store,
        llm_manager,
        extractor,
        status,
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API
    let app = api::create_router(app_state.clone()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("El servidor terminó con error");

    info!("✅ Servidor cerrado correctamente.");
}
