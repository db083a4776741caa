//! Pipeline de pregunta-respuesta sobre las notas indexadas.
//!
//! Flujo:
//!   1. Búsqueda vectorial de las notas más cercanas a la pregunta.
//!   2. Registro de la consulta como auditoría (mejor esfuerzo).
//!   3. Construcción de una ventana de contexto acotada, con procedencia
//!      sincronizada bloque a bloque.
//!   4. Clasificación de la pregunta: pertenencia y frecuencia se calculan
//!      localmente sobre los metadatos; el resto lo responde el compositor.
//!   5. Respuesta estructurada estable, con fallback si el modelo no
//!      devuelve un objeto JSON.

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::timeout;
use tracing::warn;

use crate::{
    analytics::{self, QueryIntent},
    config::AppConfig,
    llm::{self, AnswerComposer, ComposerVerdict},
    models::{AnswerKind, Confidence, NoteMetadata, Provenance, ScoredNote, StructuredAnswer},
    vector_store::NoteStore,
};

/// Tope duro de documentos recuperables por consulta.
pub const MAX_TOP_K: usize = 10;

/// Caracteres de contexto que se devuelven en una respuesta de fallback.
const CONTEXT_PREVIEW_CHARS: usize = 1200;

/// Lleva cualquier `top_k` pedido al rango válido en vez de rechazarlo.
pub fn clamp_top_k(requested: i64) -> usize {
    requested.clamp(1, MAX_TOP_K as i64) as usize
}

/// Similitud decreciente en (0, 1] a partir de una distancia no negativa.
pub fn normalize_score(distance: f64) -> f64 {
    1.0 / (1.0 + distance)
}

/// Redondeo a 4 decimales para la superficie HTTP. Los cálculos internos
/// usan siempre el valor sin redondear.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Corta por número de caracteres sin partir ninguno por la mitad.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Documento recuperado, ya con la distancia convertida en similitud y el
/// texto reducido al fragmento que cabe en un bloque de contexto.
#[derive(Debug, Clone)]
pub struct RetrievedHit {
    pub id: String,
    pub similarity: f64,
    pub text: String,
    pub metadata: NoteMetadata,
}

impl RetrievedHit {
    fn from_scored(note: ScoredNote, per_doc_cap: usize) -> Self {
        let flattened = note.text.trim().replace('\n', " ");
        Self {
            id: note.id,
            similarity: normalize_score(note.distance),
            text: truncate_chars(&flattened, per_doc_cap).to_string(),
            metadata: note.metadata,
        }
    }
}

/// Filtros de metadatos de `/search`. Un filtro vacío no restringe nada.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub patient: Option<String>,
    pub doctor: Option<String>,
    pub gender: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl SearchFilters {
    fn matches(&self, metadata: &NoteMetadata) -> bool {
        if let Some(patient) = non_empty(&self.patient) {
            if !metadata
                .patient_name
                .to_lowercase()
                .contains(&patient.to_lowercase())
            {
                return false;
            }
        }
        if let Some(doctor) = non_empty(&self.doctor) {
            if !metadata.doctor.to_lowercase().contains(&doctor.to_lowercase()) {
                return false;
            }
        }
        if let Some(gender) = non_empty(&self.gender) {
            if !metadata.gender.eq_ignore_ascii_case(gender) {
                return false;
            }
        }
        true
    }
}

/// Recupera las notas más cercanas y aplica los filtros de metadatos.
/// Filtrar después de recuperar puede devolver menos de `top_k` resultados.
pub async fn search_notes(
    store: &dyn NoteStore,
    cfg: &AppConfig,
    question: &str,
    top_k: usize,
    filters: &SearchFilters,
) -> Result<Vec<RetrievedHit>> {
    let deadline = Duration::from_secs(cfg.store_timeout_secs);
    let notes = timeout(deadline, store.nearest(question, top_k))
        .await
        .map_err(|_| {
            anyhow!(
                "La búsqueda en el almacén superó los {} segundos",
                cfg.store_timeout_secs
            )
        })??;

    Ok(notes
        .into_iter()
        .map(|note| RetrievedHit::from_scored(note, cfg.max_context_chars_per_doc))
        .filter(|hit| filters.matches(&hit.metadata))
        .collect())
}

/// Ventana de contexto acotada. `provenance` y `used_documents` contienen
/// exactamente los documentos cuyos bloques entraron en `text`.
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    pub text: String,
    pub provenance: Vec<Provenance>,
    pub used_documents: Vec<String>,
}

/// Construye la ventana en orden de ranking. Cada bloque se corta a
/// `per_doc_cap` caracteres y se descarta entero si no cabe en el
/// presupuesto total, contando también el separador entre bloques.
pub fn build_context(
    hits: &[RetrievedHit],
    per_doc_cap: usize,
    total_budget: usize,
) -> ContextWindow {
    let mut window = ContextWindow::default();
    let mut blocks: Vec<String> = Vec::new();
    let mut total_chars = 0usize;

    for hit in hits {
        let flattened = hit.text.trim().replace('\n', " ");
        let snippet = truncate_chars(&flattened, per_doc_cap);

        let patient = if hit.metadata.patient_name.is_empty() {
            "unknown"
        } else {
            hit.metadata.patient_name.as_str()
        };
        let date = if hit.metadata.date.is_empty() {
            hit.metadata.source.as_str()
        } else {
            hit.metadata.date.as_str()
        };

        let block = format!(
            "---DOC ID: {} | patient: {} | date: {}---\n{}\n",
            hit.id, patient, date, snippet
        );

        let separator_chars = if blocks.is_empty() { 0 } else { 1 };
        let block_chars = block.chars().count() + separator_chars;
        if total_chars + block_chars > total_budget {
            break;
        }
        total_chars += block_chars;

        window.provenance.push(Provenance {
            id: hit.id.clone(),
            patient: hit.metadata.patient_name.clone(),
            doctor: hit.metadata.doctor.clone(),
            diagnosis: hit.metadata.diagnosis.clone(),
            treatments: hit.metadata.treatments.clone(),
            score: hit.similarity,
        });
        window.used_documents.push(hit.id.clone());
        blocks.push(block);
    }

    window.text = blocks.join("\n");
    window
}

/// Resultado de `/ask` antes de serializarse.
#[derive(Debug)]
pub enum AskOutcome {
    /// Respuesta estructurada completa.
    Structured(StructuredAnswer),
    /// La búsqueda no devolvió ningún documento.
    Empty,
    /// El compositor no devolvió un objeto JSON utilizable.
    Fallback {
        raw_model_output: String,
        context_preview: String,
        provenance: Vec<Provenance>,
        used_documents: Vec<String>,
    },
}

/// Contesta una pregunta sobre las notas indexadas.
pub async fn ask_question(
    store: &dyn NoteStore,
    composer: &dyn AnswerComposer,
    cfg: &AppConfig,
    question: &str,
    requested_top_k: i64,
) -> Result<AskOutcome> {
    // 1) Recuperación
    let top_k = clamp_top_k(requested_top_k);
    let hits = search_notes(store, cfg, question, top_k, &SearchFilters::default()).await?;

    if hits.is_empty() {
        return Ok(AskOutcome::Empty);
    }

    // 2) Auditoría: nunca tumba la petición
    let matched: Vec<(String, f64)> = hits
        .iter()
        .map(|hit| (hit.id.clone(), hit.similarity))
        .collect();
    if let Err(e) = store.log_question(question, &matched).await {
        warn!("No se pudo registrar la consulta: {e}");
    }

    // 3) Ventana de contexto
    let window = build_context(
        &hits,
        cfg.max_context_chars_per_doc,
        cfg.max_total_context_chars,
    );

    // 4) Respuesta según la intención
    match analytics::classify_question(question) {
        QueryIntent::PatientsByDiagnosis(fragment) => Ok(AskOutcome::Structured(
            answer_diagnosis_query(composer, cfg, question, &window, &fragment).await,
        )),
        QueryIntent::MostFrequentTreatment => Ok(AskOutcome::Structured(
            answer_treatment_frequency(composer, cfg, question, &window).await,
        )),
        QueryIntent::Normal => Ok(answer_normal(composer, cfg, question, window).await),
    }
}

/// Pregunta de pertenencia: la lista de pacientes sale siempre del conteo
/// local; el compositor sólo puede mejorar la redacción de la respuesta.
async fn answer_diagnosis_query(
    composer: &dyn AnswerComposer,
    cfg: &AppConfig,
    question: &str,
    window: &ContextWindow,
    fragment: &str,
) -> StructuredAnswer {
    let patients = analytics::patients_with_diagnosis(&window.provenance, fragment);

    let local_answer = if patients.is_empty() {
        format!("No retrieved document mentions a diagnosis matching '{fragment}'.")
    } else {
        format!(
            "Patients with a diagnosis matching '{fragment}': {}.",
            patients.join(", ")
        )
    };
    let confidence = if patients.is_empty() {
        Confidence::Low
    } else {
        Confidence::High
    };
    let answer = phrase_or_local(composer, cfg, question, window, local_answer).await;

    StructuredAnswer {
        answer: Some(answer),
        kind: AnswerKind::DiagnosisQuery,
        patients,
        treatment_stats: None,
        used_documents: window.used_documents.clone(),
        provenance: window.provenance.clone(),
        confidence,
    }
}

/// Pregunta de frecuencia: el conteo es local y determinista.
async fn answer_treatment_frequency(
    composer: &dyn AnswerComposer,
    cfg: &AppConfig,
    question: &str,
    window: &ContextWindow,
) -> StructuredAnswer {
    let stats = analytics::most_frequent_treatment(&window.provenance);

    let (local_answer, confidence) = match &stats {
        Some(stats) => (
            format!(
                "The most frequently prescribed treatment is '{}' ({} prescriptions).",
                stats.treatment, stats.count
            ),
            Confidence::High,
        ),
        None => (
            "No prescriptions were found in the retrieved documents.".to_string(),
            Confidence::Low,
        ),
    };
    let answer = phrase_or_local(composer, cfg, question, window, local_answer).await;

    StructuredAnswer {
        answer: Some(answer),
        kind: AnswerKind::TreatmentFrequency,
        patients: Vec::new(),
        treatment_stats: stats,
        used_documents: window.used_documents.clone(),
        provenance: window.provenance.clone(),
        confidence,
    }
}

/// Pregunta libre: la respuesta es del compositor, pero la contabilidad de
/// documentos usados y procedencia es siempre la de la ventana local.
async fn answer_normal(
    composer: &dyn AnswerComposer,
    cfg: &AppConfig,
    question: &str,
    window: ContextWindow,
) -> AskOutcome {
    let provenance_json = provenance_as_json(&window.provenance);
    let deadline = Duration::from_secs(cfg.llm_timeout_secs);

    let raw = match timeout(
        deadline,
        composer.compose(question, &window.text, &provenance_json),
    )
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            warn!("El compositor falló: {e}");
            return fallback(format!("composer error: {e}"), window);
        }
        Err(_) => {
            warn!("El compositor superó los {} segundos", cfg.llm_timeout_secs);
            return fallback(
                format!("composer timeout after {}s", cfg.llm_timeout_secs),
                window,
            );
        }
    };

    match llm::parse_composer_output(&raw) {
        ComposerVerdict::Parsed(parsed) => AskOutcome::Structured(StructuredAnswer {
            answer: parsed.answer,
            kind: AnswerKind::Normal,
            patients: Vec::new(),
            treatment_stats: None,
            used_documents: window.used_documents,
            provenance: window.provenance,
            confidence: parsed.confidence,
        }),
        ComposerVerdict::Unparsed(raw) => fallback(raw, window),
    }
}

fn fallback(raw_model_output: String, window: ContextWindow) -> AskOutcome {
    AskOutcome::Fallback {
        raw_model_output,
        context_preview: truncate_chars(&window.text, CONTEXT_PREVIEW_CHARS).to_string(),
        provenance: window.provenance,
        used_documents: window.used_documents,
    }
}

/// Pide redacción al compositor y cae a la respuesta local calculada si el
/// modelo falla, tarda demasiado o no devuelve JSON.
async fn phrase_or_local(
    composer: &dyn AnswerComposer,
    cfg: &AppConfig,
    question: &str,
    window: &ContextWindow,
    local_answer: String,
) -> String {
    let provenance_json = provenance_as_json(&window.provenance);
    let deadline = Duration::from_secs(cfg.llm_timeout_secs);

    match timeout(
        deadline,
        composer.compose(question, &window.text, &provenance_json),
    )
    .await
    {
        Ok(Ok(raw)) => match llm::parse_composer_output(&raw) {
            ComposerVerdict::Parsed(parsed) => parsed.answer.unwrap_or(local_answer),
            ComposerVerdict::Unparsed(_) => local_answer,
        },
        Ok(Err(e)) => {
            warn!("El compositor falló; se usa la respuesta local: {e}");
            local_answer
        }
        Err(_) => {
            warn!(
                "El compositor superó los {} segundos; se usa la respuesta local",
                cfg.llm_timeout_secs
            );
            local_answer
        }
    }
}

fn provenance_as_json(provenance: &[Provenance]) -> String {
    serde_json::to_string_pretty(provenance).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmProvider, StoreBackend};
    use crate::models::NoteDocument;
    use crate::vector_store::InMemoryNoteStore;
    use async_trait::async_trait;
    use std::path::PathBuf;

    fn test_config() -> AppConfig {
        AppConfig {
            store_backend: StoreBackend::Memory,
            neo4j_uri: "bolt://localhost:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "password".to_string(),
            server_addr: "127.0.0.1:8001".to_string(),
            llm_provider: LlmProvider::OpenAI,
            llm_embedding_model: String::new(),
            llm_chat_model: String::new(),
            llm_vision_model: "gpt-4o-mini".to_string(),
            notes_dir: PathBuf::from("outputs/clean"),
            uploads_dir: PathBuf::from("uploads"),
            raw_dir: PathBuf::from("outputs/raw"),
            summary_dir: PathBuf::from("outputs/task2"),
            default_top_k: 10,
            max_context_chars_per_doc: 1200,
            max_total_context_chars: 3500,
            store_timeout_secs: 5,
            llm_timeout_secs: 5,
        }
    }

    fn hit(id: &str, text: &str, patient: &str, date: &str, source: &str) -> RetrievedHit {
        RetrievedHit {
            id: id.to_string(),
            similarity: 0.8,
            text: text.to_string(),
            metadata: NoteMetadata {
                source: source.to_string(),
                patient_name: patient.to_string(),
                date: date.to_string(),
                ..NoteMetadata::default()
            },
        }
    }

    struct MockComposer {
        reply: String,
    }

    #[async_trait]
    impl AnswerComposer for MockComposer {
        async fn compose(&self, _q: &str, _c: &str, _p: &str) -> Result<String> {
            Ok(self.reply.clone())
        }
    }

    struct FailingComposer;

    #[async_trait]
    impl AnswerComposer for FailingComposer {
        async fn compose(&self, _q: &str, _c: &str, _p: &str) -> Result<String> {
            Err(anyhow!("sin conexión"))
        }
    }

    async fn seeded_store() -> InMemoryNoteStore {
        let store = InMemoryNoteStore::new();
        let seeds = [
            (
                "n1",
                "Paciente con diabetes tipo 2 en control con metformina.",
                "Ana García",
                "Type 2 Diabetes",
                "metformin 500mg twice daily",
            ),
            (
                "n2",
                "Seguimiento de diabetes, añade insulina basal.",
                "Luis Pérez",
                "type 2 diabetes mellitus",
                "insulin 10 units iv daily | metformin 500mg twice daily",
            ),
            (
                "n3",
                "Asma leve intermitente, broncodilatador a demanda.",
                "Marta Ruiz",
                "Asthma",
                "salbutamol 100mcg as needed",
            ),
        ];
        for (id, text, patient, diagnosis, treatments) in seeds {
            store
                .add_or_replace(&NoteDocument {
                    id: id.to_string(),
                    text: text.to_string(),
                    metadata: NoteMetadata {
                        source: format!("{id}.json"),
                        patient_name: patient.to_string(),
                        diagnosis: diagnosis.to_string(),
                        treatments: treatments.to_string(),
                        ..NoteMetadata::default()
                    },
                })
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn top_k_is_clamped_not_rejected() {
        assert_eq!(clamp_top_k(0), 1);
        assert_eq!(clamp_top_k(-1), 1);
        assert_eq!(clamp_top_k(5), 5);
        assert_eq!(clamp_top_k(10), 10);
        assert_eq!(clamp_top_k(50), 10);
    }

    #[test]
    fn normalized_score_stays_in_range_and_decreases() {
        assert_eq!(normalize_score(0.0), 1.0);
        assert!(normalize_score(0.3) > normalize_score(0.9));
        let tiny = normalize_score(1.0e9);
        assert!(tiny > 0.0 && tiny < 1.0e-6);
    }

    #[test]
    fn round4_is_display_only_precision() {
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round4(1.0), 1.0);
        assert_eq!(round4(0.00004), 0.0);
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("ñandú", 2), "ña");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 5), "");
    }

    #[test]
    fn context_block_has_the_expected_header() {
        let window = build_context(
            &[hit("doc1", "línea1\nlínea2", "Ana", "2024-03-01", "doc1.json")],
            1200,
            3500,
        );
        assert_eq!(
            window.text,
            "---DOC ID: doc1 | patient: Ana | date: 2024-03-01---\nlínea1 línea2\n"
        );
        assert_eq!(window.used_documents, vec!["doc1"]);
    }

    #[test]
    fn context_falls_back_to_unknown_patient_and_source_date() {
        let window = build_context(&[hit("doc1", "texto", "", "", "doc1.json")], 1200, 3500);
        assert!(window
            .text
            .starts_with("---DOC ID: doc1 | patient: unknown | date: doc1.json---"));
        // En la procedencia el paciente vacío se conserva tal cual.
        assert_eq!(window.provenance[0].patient, "");
    }

    #[test]
    fn context_never_exceeds_the_total_budget() {
        let hits: Vec<RetrievedHit> = (0..10)
            .map(|i| {
                hit(
                    &format!("h{i}"),
                    &"x".repeat(300),
                    "",
                    "",
                    &format!("h{i}.json"),
                )
            })
            .collect();

        let budget = 500;
        let window = build_context(&hits, 1200, budget);
        assert!(window.text.chars().count() <= budget);
        assert!(window.provenance.len() < hits.len());
        assert_eq!(window.provenance.len(), window.used_documents.len());
    }

    #[test]
    fn each_snippet_is_capped_per_document() {
        let window = build_context(&[hit("doc1", &"y".repeat(50), "", "", "doc1.json")], 10, 3500);
        assert!(window.text.contains(&"y".repeat(10)));
        assert!(!window.text.contains(&"y".repeat(11)));
    }

    #[test]
    fn empty_hits_build_an_empty_window() {
        let window = build_context(&[], 1200, 3500);
        assert_eq!(window.text, "");
        assert!(window.provenance.is_empty());
        assert!(window.used_documents.is_empty());
    }

    #[test]
    fn filters_only_shrink_the_result_set() {
        let meta_ana = NoteMetadata {
            patient_name: "Ana García".to_string(),
            doctor: "Dr. Emily Carter".to_string(),
            gender: "F".to_string(),
            ..NoteMetadata::default()
        };
        let meta_luis = NoteMetadata {
            patient_name: "Luis Pérez".to_string(),
            doctor: "Dr. John Smith".to_string(),
            gender: "M".to_string(),
            ..NoteMetadata::default()
        };

        let empty = SearchFilters::default();
        assert!(empty.matches(&meta_ana) && empty.matches(&meta_luis));

        let by_patient = SearchFilters {
            patient: Some("garcía".to_string()),
            ..SearchFilters::default()
        };
        assert!(by_patient.matches(&meta_ana));
        assert!(!by_patient.matches(&meta_luis));

        let by_doctor = SearchFilters {
            doctor: Some("CARTER".to_string()),
            ..SearchFilters::default()
        };
        assert!(by_doctor.matches(&meta_ana));
        assert!(!by_doctor.matches(&meta_luis));

        let by_gender = SearchFilters {
            gender: Some("f".to_string()),
            ..SearchFilters::default()
        };
        assert!(by_gender.matches(&meta_ana));
        assert!(!by_gender.matches(&meta_luis));

        // Cadena vacía = sin filtro, no "igual a vacío".
        let blank = SearchFilters {
            gender: Some(String::new()),
            ..SearchFilters::default()
        };
        assert!(blank.matches(&meta_ana) && blank.matches(&meta_luis));
    }

    #[tokio::test]
    async fn search_applies_filters_after_retrieval() {
        let store = seeded_store().await;
        let cfg = test_config();
        let filters = SearchFilters {
            patient: Some("ana".to_string()),
            ..SearchFilters::default()
        };

        let hits = search_notes(&store, &cfg, "diabetes", 10, &filters)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "n1");
    }

    #[tokio::test]
    async fn retrieved_text_is_flattened_and_capped() {
        let store = InMemoryNoteStore::new();
        store
            .add_or_replace(&NoteDocument {
                id: "largo".to_string(),
                text: format!("  línea1\nlínea2 {}", "z".repeat(2000)),
                metadata: NoteMetadata::default(),
            })
            .await
            .unwrap();
        let mut cfg = test_config();
        cfg.max_context_chars_per_doc = 20;

        let hits = search_notes(&store, &cfg, "línea1", 5, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits[0].text, "línea1 línea2 zzzzzz");
        assert_eq!(hits[0].text.chars().count(), 20);
    }

    #[tokio::test]
    async fn empty_retrieval_short_circuits_before_the_composer() {
        let store = InMemoryNoteStore::new();
        let cfg = test_config();

        let outcome = ask_question(&store, &FailingComposer, &cfg, "¿algo?", 10)
            .await
            .unwrap();
        assert!(matches!(outcome, AskOutcome::Empty));
    }

    #[tokio::test]
    async fn membership_answer_survives_a_broken_composer() {
        let store = seeded_store().await;
        let cfg = test_config();

        let outcome = ask_question(
            &store,
            &FailingComposer,
            &cfg,
            "Which patients had diabetes?",
            10,
        )
        .await
        .unwrap();

        let AskOutcome::Structured(answer) = outcome else {
            panic!("esperaba respuesta estructurada");
        };
        assert_eq!(answer.kind, AnswerKind::DiagnosisQuery);
        assert_eq!(answer.patients.len(), 2);
        assert!(answer.patients.contains(&"Ana García".to_string()));
        assert!(answer.patients.contains(&"Luis Pérez".to_string()));
        assert_eq!(answer.confidence, Confidence::High);
        assert!(answer.answer.unwrap().contains("diabetes"));
        assert_eq!(answer.used_documents.len(), answer.provenance.len());
    }

    #[tokio::test]
    async fn frequency_answer_counts_locally_even_with_garbage_output() {
        let store = seeded_store().await;
        let cfg = test_config();
        let composer = MockComposer {
            reply: "esto no es JSON".to_string(),
        };

        let outcome = ask_question(
            &store,
            &composer,
            &cfg,
            "What treatment was prescribed most frequently?",
            10,
        )
        .await
        .unwrap();

        let AskOutcome::Structured(answer) = outcome else {
            panic!("esperaba respuesta estructurada");
        };
        assert_eq!(answer.kind, AnswerKind::TreatmentFrequency);
        let stats = answer.treatment_stats.unwrap();
        assert_eq!(stats.treatment, "metformin 500mg twice daily");
        assert_eq!(stats.count, 2);
        assert_eq!(answer.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn unparseable_normal_answer_becomes_a_fallback() {
        let store = seeded_store().await;
        let cfg = test_config();
        let composer = MockComposer {
            reply: "Respuesta libre sin estructura.".to_string(),
        };

        let outcome = ask_question(&store, &composer, &cfg, "Resume la primera nota", 10)
            .await
            .unwrap();

        let AskOutcome::Fallback {
            raw_model_output,
            context_preview,
            provenance,
            used_documents,
        } = outcome
        else {
            panic!("esperaba fallback");
        };
        assert_eq!(raw_model_output, "Respuesta libre sin estructura.");
        assert!(context_preview.chars().count() <= 1200);
        assert_eq!(provenance.len(), used_documents.len());
        assert!(!used_documents.is_empty());
    }

    #[tokio::test]
    async fn composer_failure_on_a_normal_question_keeps_the_bookkeeping() {
        let store = seeded_store().await;
        let cfg = test_config();

        let outcome = ask_question(&store, &FailingComposer, &cfg, "Resume la primera nota", 10)
            .await
            .unwrap();

        let AskOutcome::Fallback {
            raw_model_output,
            used_documents,
            ..
        } = outcome
        else {
            panic!("esperaba fallback");
        };
        assert!(raw_model_output.contains("composer error"));
        assert!(!used_documents.is_empty());
    }

    #[tokio::test]
    async fn normal_answer_keeps_server_side_bookkeeping() {
        let store = seeded_store().await;
        let cfg = test_config();
        // El modelo intenta colar su propia contabilidad.
        let composer = MockComposer {
            reply: r#"{"answer": "Nota de control de diabetes.", "type": "normal", "patients": ["Inventado"], "used_documents": ["fake-doc"], "provenance": [{"id": "fake"}], "confidence": "medium"}"#
                .to_string(),
        };

        let outcome = ask_question(&store, &composer, &cfg, "Resume la primera nota", 10)
            .await
            .unwrap();

        let AskOutcome::Structured(answer) = outcome else {
            panic!("esperaba respuesta estructurada");
        };
        assert_eq!(answer.kind, AnswerKind::Normal);
        assert_eq!(answer.answer.as_deref(), Some("Nota de control de diabetes."));
        assert_eq!(answer.confidence, Confidence::Medium);
        assert!(answer.patients.is_empty());
        assert!(answer.treatment_stats.is_none());
        assert!(!answer.used_documents.contains(&"fake-doc".to_string()));
        assert_eq!(answer.used_documents.len(), 3);
        assert!(answer.provenance.iter().all(|p| p.id != "fake"));
    }
}
