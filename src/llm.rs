//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.

use crate::config::{AppConfig, LlmProvider};
use crate::models::{ClinicalRecord, Confidence};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel; // <- para .embed_texts
use tracing::warn;

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        })
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    /// Calcula embeddings para una lista de textos, en el mismo orden.
    ///
    /// Nota: sólo implementado para OpenAI. Para otros proveedores
    /// se podrían añadir ramas adicionales al `match`.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(texts).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para embeddings",
                other
            )),
        }
    }

    async fn embed_with_openai(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;

        // Cliente OpenAI de Rig
        let client = openai::Client::from_env();

        // Modelo de embeddings: config o default
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };

        let embedding_model = client.embedding_model(model_name);

        // Embeddings en bloque (.embed_texts viene de EmbeddingModel)
        let embeddings = embedding_model.embed_texts(texts.to_vec()).await?;

        if embeddings.len() != texts.len() {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                texts.len()
            ));
        }

        Ok(embeddings.iter().map(|emb| emb.vec.clone()).collect())
    }

    // ---------------------------------------------------------------------
    // ESTRUCTURACIÓN DE NOTAS (OCR -> registro clínico)
    // ---------------------------------------------------------------------

    /// Convierte el texto OCR de una nota manuscrita en un registro
    /// clínico estructurado. El texto original se conserva en `raw_text`.
    pub async fn structure_note(&self, raw_text: &str) -> Result<ClinicalRecord> {
        match self.provider {
            LlmProvider::OpenAI => self.structure_with_openai(raw_text).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para estructuración",
                other
            )),
        }
    }

    async fn structure_with_openai(&self, raw_text: &str) -> Result<ClinicalRecord> {
        use rig::providers::openai;
        use rig::client::CompletionClient as _;

        const STRUCTURE_PROMPT: &str = r#"
Eres un asistente de estructuración de texto médico.

Dado el texto OCR de una nota médica manuscrita, devuelve JSON ESTRICTO:

{
  "patient": {"name": "", "age": "", "gender": ""},
  "doctor": "",
  "hospital": "",
  "date": "",
  "diagnosis": "",
  "prescriptions": [
    {"drug": "", "dose": "", "frequency": "", "duration": ""}
  ],
  "cleaned_text": ""
}

Reglas:
- Usa SOLO lo que aparece en el texto.
- Sin alucinaciones.
- cleaned_text = versión corregida del texto OCR.
- Devuelve siempre JSON válido, sin markdown ni explicaciones.
"#;

        let client = openai::Client::from_env();
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let agent = client
            .agent(model_name)
            .preamble(STRUCTURE_PROMPT)
            .build();

        let response = agent.prompt(raw_text).await?;
        let json_response = strip_code_fences(&response);

        let mut record: ClinicalRecord = serde_json::from_str(json_response).map_err(|e| {
            anyhow!("El modelo no devolvió un JSON de registro clínico válido: {e}")
        })?;
        record.raw_text = Some(raw_text.to_string());
        Ok(record)
    }
}

// -------------------------------------------------------------------------
// COMPOSICIÓN DE RESPUESTAS RAG
// -------------------------------------------------------------------------

/// Contrato del compositor de respuestas. El pipeline RAG depende de este
/// trait, no del proveedor concreto, para poder simularlo en los tests.
#[async_trait]
pub trait AnswerComposer: Send + Sync {
    /// Genera la respuesta del modelo a partir de la pregunta, la ventana
    /// de contexto y los metadatos de los documentos recuperados.
    async fn compose(
        &self,
        question: &str,
        context: &str,
        provenance_json: &str,
    ) -> Result<String>;
}

#[async_trait]
impl AnswerComposer for LlmManager {
    async fn compose(
        &self,
        question: &str,
        context: &str,
        provenance_json: &str,
    ) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => {
                self.compose_with_openai(question, context, provenance_json)
                    .await
            }
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para chat",
                other
            )),
        }
    }
}

impl LlmManager {
    async fn compose_with_openai(
        &self,
        question: &str,
        context: &str,
        provenance_json: &str,
    ) -> Result<String> {
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        const COMPOSER_PROMPT: &str = r#"
Eres un asistente clínico que responde preguntas sobre notas médicas.
Sólo puedes usar la información de los bloques de contexto y los metadatos suministrados.
Si el contexto no contiene la respuesta, devuelve "answer": null.

Hay tres tipos de pregunta:
- "diagnosis_query": qué pacientes tienen cierto diagnóstico.
- "treatment_frequency": qué tratamiento se prescribe con más frecuencia.
- "normal": cualquier otra pregunta.

La salida DEBE ser un único objeto JSON válido con estas claves:
{
  "answer": "respuesta en texto o null",
  "type": "diagnosis_query" | "treatment_frequency" | "normal",
  "patients": ["nombres de pacientes relevantes"],
  "treatment_stats": {"treatment": "...", "count": 0},
  "used_documents": ["ids de documento usados"],
  "provenance": [],
  "confidence": "low" | "medium" | "high"
}

Sin markdown. Sin explicaciones. Sólo el JSON.
"#;

        let client = openai::Client::from_env();

        // Modelo de chat por defecto si no se ha configurado otro
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let full_context = format!(
            "BLOQUES DE CONTEXTO (uno por documento recuperado):\n{}\n\nMETADATOS (JSON por documento recuperado):\n{}\n\nPregunta del usuario:\n{}",
            context, provenance_json, question
        );

        let agent = client
            .agent(model_name)
            .preamble(COMPOSER_PROMPT)
            .context(&full_context)
            .build();

        let answer = agent.prompt(question).await?;
        Ok(answer)
    }
}

/// Resultado de interpretar la salida del compositor.
#[derive(Debug, Clone)]
pub enum ComposerVerdict {
    /// El modelo devolvió un objeto JSON del que se extrajo lo esencial.
    Parsed(ComposerAnswer),
    /// La salida no era un objeto JSON; se conserva el texto literal.
    Unparsed(String),
}

/// Campos del compositor que el pipeline consume tal cual. El resto de la
/// respuesta estructurada (pacientes, estadísticas, procedencia) lo calcula
/// siempre el servidor a partir de los documentos recuperados.
#[derive(Debug, Clone, Default)]
pub struct ComposerAnswer {
    pub answer: Option<String>,
    pub confidence: Confidence,
}

/// Limpia la respuesta del LLM para quedarse sólo con el JSON.
pub fn strip_code_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Interpreta la salida del compositor con tolerancia: cualquier cosa que
/// no sea un objeto JSON se devuelve como `Unparsed` sin abortar.
pub fn parse_composer_output(raw: &str) -> ComposerVerdict {
    let cleaned = strip_code_fences(raw);

    let value: serde_json::Value = match serde_json::from_str(cleaned) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                "No se pudo parsear el JSON del compositor. Error: {}. Respuesta LLM: '{}'",
                e, raw
            );
            return ComposerVerdict::Unparsed(raw.to_string());
        }
    };

    let Some(obj) = value.as_object() else {
        warn!(
            "El compositor devolvió JSON que no es un objeto. Respuesta LLM: '{}'",
            raw
        );
        return ComposerVerdict::Unparsed(raw.to_string());
    };

    let answer = obj
        .get("answer")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let confidence = obj
        .get("confidence")
        .and_then(serde_json::Value::as_str)
        .map(Confidence::from_text)
        .unwrap_or_default();

    ComposerVerdict::Parsed(ComposerAnswer { answer, confidence })
}
