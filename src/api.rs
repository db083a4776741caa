use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::{
    extract::{Json, Multipart, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::spawn;
use tokio::time::timeout;
use tracing::{error, info};

use crate::{
    app_state::{AppState, Status},
    ingest,
    models::{Provenance, StructuredAnswer},
    rag::{self, SearchFilters},
};

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct AskPayload {
    question: String,
    top_k: Option<i64>,
    return_docs: Option<bool>,
}

#[derive(Deserialize)]
pub struct SearchParams {
    q: String,
    top_k: Option<i64>,
    patient: Option<String>,
    doctor: Option<String>,
    gender: Option<String>,
}

/// Las tres formas de respuesta de `/ask`. `untagged` mantiene el contrato
/// plano: los clientes distinguen por las claves presentes.
#[derive(Serialize)]
#[serde(untagged)]
pub enum AskResponse {
    Structured(StructuredAnswer),
    Fallback {
        raw_model_output: String,
        context_preview: String,
        provenance: Vec<Provenance>,
        used_documents: Vec<String>,
    },
    Empty {
        answer: Option<String>,
        provenance: Vec<Provenance>,
        used_documents: Vec<String>,
    },
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/search", get(search_handler))
        .route("/ask", post(ask_handler))
        .route("/upload", post(upload_handler))
        .route("/api/reindex", post(reindex_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn home_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "Medical RAG API running",
        "endpoints": ["/search", "/ask", "/upload", "/api/reindex", "/api/status"]
    }))
}

#[axum::debug_handler]
async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let top_k = rag::clamp_top_k(params.top_k.unwrap_or(5));
    let filters = SearchFilters {
        patient: params.patient,
        doctor: params.doctor,
        gender: params.gender,
    };

    let hits = rag::search_notes(
        state.store.as_ref(),
        &state.config,
        &params.q,
        top_k,
        &filters,
    )
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("Error en la búsqueda: {}", e)})),
        )
    })?;

    let results: Vec<serde_json::Value> = hits
        .iter()
        .map(|hit| {
            json!({
                "id": hit.id,
                "similarity": rag::round4(hit.similarity),
                "text": hit.text,
                "metadata": {
                    "patient": {
                        "name": hit.metadata.patient_name,
                        "age": hit.metadata.age,
                        "gender": hit.metadata.gender,
                    },
                    "doctor": hit.metadata.doctor,
                    "diagnosis": hit.metadata.diagnosis,
                    "file": hit.metadata.source,
                }
            })
        })
        .collect();

    Ok(Json(json!({
        "query": params.q,
        "count": results.len(),
        "results": results,
    })))
}

#[axum::debug_handler]
async fn ask_handler(
    State(state): State<AppState>,
    Json(payload): Json<AskPayload>,
) -> Result<Json<AskResponse>, (StatusCode, Json<serde_json::Value>)> {
    let top_k = payload.top_k.unwrap_or(state.config.default_top_k as i64);
    let return_docs = payload.return_docs.unwrap_or(true);

    let outcome = rag::ask_question(
        state.store.as_ref(),
        &state.llm_manager,
        &state.config,
        &payload.question,
        top_k,
    )
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("Error al procesar la pregunta: {}", e)})),
        )
    })?;

    Ok(Json(to_ask_response(outcome, return_docs)))
}

fn round_scores(mut provenance: Vec<Provenance>) -> Vec<Provenance> {
    for entry in &mut provenance {
        entry.score = rag::round4(entry.score);
    }
    provenance
}

/// Serializa el resultado del pipeline. Con `return_docs = false` se omite
/// la procedencia completa pero se conservan los ids de documento.
fn to_ask_response(outcome: rag::AskOutcome, return_docs: bool) -> AskResponse {
    match outcome {
        rag::AskOutcome::Structured(mut answer) => {
            answer.provenance = if return_docs {
                round_scores(answer.provenance)
            } else {
                Vec::new()
            };
            AskResponse::Structured(answer)
        }
        rag::AskOutcome::Empty => AskResponse::Empty {
            answer: None,
            provenance: Vec::new(),
            used_documents: Vec::new(),
        },
        rag::AskOutcome::Fallback {
            raw_model_output,
            context_preview,
            provenance,
            used_documents,
        } => AskResponse::Fallback {
            raw_model_output,
            context_preview,
            provenance: if return_docs {
                round_scores(provenance)
            } else {
                Vec::new()
            },
            used_documents,
        },
    }
}

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Json<serde_json::Value> {
    match process_upload(&state, multipart).await {
        Ok(message) => Json(json!({"status": "success", "message": message})),
        Err(e) => {
            error!("Error procesando la subida: {e}");
            Json(json!({"status": "error", "message": format!("{e}")}))
        }
    }
}

/// Cadena completa de una subida: guardar el original, extraer texto,
/// estructurar, escribir los tres artefactos e indexar la nota.
async fn process_upload(state: &AppState, mut multipart: Multipart) -> Result<String> {
    // 1) Localizar el campo de fichero
    let mut file_name = None;
    let mut file_bytes = None;

    while let Some(field) = multipart.next_field().await? {
        let is_file = field.name() == Some("file") || field.file_name().is_some();
        if !is_file {
            continue;
        }
        let original = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("El campo de fichero no tiene nombre"))?;
        let bytes = field.bytes().await?;
        file_name = Some(sanitize_file_name(&original));
        file_bytes = Some(bytes);
        break;
    }

    let file_name = file_name.ok_or_else(|| anyhow!("La petición no contiene ningún fichero"))?;
    let file_bytes = file_bytes.ok_or_else(|| anyhow!("La petición no contiene ningún fichero"))?;
    if file_bytes.is_empty() {
        return Err(anyhow!("El fichero subido está vacío"));
    }

    // 2) Guardar el original
    fs::create_dir_all(&state.config.uploads_dir)?;
    let save_path = state.config.uploads_dir.join(&file_name);
    fs::write(&save_path, &file_bytes)?;

    let mime = MimeGuess::from_path(&save_path)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    // 3) Extracción de texto
    let raw_text = state.extractor.extract_raw_text(&file_bytes, &mime).await?;
    if raw_text.trim().is_empty() {
        return Err(anyhow!("No se extrajo ningún texto del fichero"));
    }

    fs::create_dir_all(&state.config.raw_dir)?;
    fs::write(state.config.raw_dir.join(format!("{file_name}.txt")), &raw_text)?;

    // 4) Estructuración con límite de tiempo
    let deadline = Duration::from_secs(state.config.llm_timeout_secs);
    let record = timeout(deadline, state.llm_manager.structure_note(&raw_text))
        .await
        .map_err(|_| {
            anyhow!(
                "La estructuración superó los {} segundos",
                state.config.llm_timeout_secs
            )
        })??;

    let json_name = format!("{file_name}.json");
    fs::create_dir_all(&state.config.notes_dir)?;
    fs::write(
        state.config.notes_dir.join(&json_name),
        serde_json::to_string_pretty(&record)?,
    )?;

    // 5) Resumen de caso
    let summary = ingest::case_summary(&record);
    fs::create_dir_all(&state.config.summary_dir)?;
    fs::write(
        state.config.summary_dir.join(format!("{file_name}_summary.json")),
        serde_json::to_string_pretty(&summary)?,
    )?;

    // 6) Indexado inmediato
    let doc = ingest::normalize_record(&record, &json_name)
        .ok_or_else(|| anyhow!("La nota no contiene texto utilizable"))?;
    let doc_id = doc.id.clone();
    state.store.add_or_replace(&doc).await?;

    info!("Nota subida y procesada: {file_name} (doc id '{doc_id}')");
    Ok(format!(
        "Fichero procesado e indexado: {file_name} (doc id '{doc_id}')"
    ))
}

#[axum::debug_handler]
async fn reindex_handler(State(state): State<AppState>) -> impl IntoResponse {
    let notes_dir = state.config.notes_dir.clone();

    spawn(async move {
        {
            let mut status = state.status.lock().unwrap();
            status.is_busy = true;
            status.message = "Iniciando reindexado...".to_string();
            status.progress = 0.0;
        }

        let result =
            ingest::reindex_notes_dir(state.store.as_ref(), &notes_dir, state.status.clone())
                .await;

        let mut status = state.status.lock().unwrap();
        status.is_busy = false;
        status.progress = 0.0;
        match result {
            Ok(summary) => {
                status.message = format!("¡Reindexado completado! {}", summary);
            }
            Err(err) => {
                status.message = format!("Error en el reindexado: {}", err);
                error!("Error de reindexado: {}", err);
            }
        }
    });

    StatusCode::ACCEPTED
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

// --- Handler de Apagado y Utilidades ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

/// El nombre guardado es sólo el componente final del nombre recibido.
fn sanitize_file_name(original: &str) -> String {
    Path::new(original)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.bin".to_string())
}
