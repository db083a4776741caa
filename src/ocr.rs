//! Extracción de texto de notas subidas (imágenes y PDFs).
//!
//! Los PDFs con capa de texto se leen directamente; todo lo demás pasa por
//! el endpoint de visión de OpenAI con la imagen embebida en base64.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine as _;
use serde_json::json;
use tracing::{info, warn};

const RAW_TEXT_PROMPT: &str =
    "Extract ALL readable text from this medical note. Return plain text only.";

/// Un PDF con menos texto que esto se trata como escaneado sin capa de texto.
const MIN_PDF_TEXT_CHARS: usize = 32;

/// Contrato de extracción de texto en bruto a partir de bytes subidos.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_raw_text(&self, bytes: &[u8], mime: &str) -> Result<String>;
}

/// Extractor de producción: capa de texto de PDF si existe, OCR de visión
/// en caso contrario.
pub struct VisionOcr {
    http: reqwest::Client,
    vision_model: String,
    timeout: Duration,
}

impl VisionOcr {
    pub fn new(vision_model: String, timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            vision_model,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    async fn extract_with_vision(&self, bytes: &[u8], mime: &str) -> Result<String> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| anyhow!("Falta OPENAI_API_KEY en el entorno"))?;
        let base = env::var("OPENAI_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let base = base.trim_end_matches('/');

        let body = json!({
            "model": self.vision_model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": RAW_TEXT_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url(mime, bytes) } }
                ]
            }]
        });

        let response = self
            .http
            .post(format!("{base}/chat/completions"))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: serde_json::Value = response.json().await?;
        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("Respuesta del modelo de visión sin contenido de texto"))?;

        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl TextExtractor for VisionOcr {
    async fn extract_raw_text(&self, bytes: &[u8], mime: &str) -> Result<String> {
        if mime == "application/pdf" {
            match pdf_extract::extract_text_from_mem(bytes) {
                Ok(text) if pdf_text_is_useful(&text) => {
                    info!(
                        "Texto extraído directamente del PDF ({} caracteres).",
                        text.trim().chars().count()
                    );
                    return Ok(text.trim().to_string());
                }
                Ok(_) => {
                    info!("El PDF no contiene capa de texto útil; se usa OCR de visión.");
                }
                Err(e) => {
                    warn!("No se pudo leer la capa de texto del PDF ({e}); se usa OCR de visión.");
                }
            }
        }

        self.extract_with_vision(bytes, mime).await
    }
}

fn data_url(mime: &str, bytes: &[u8]) -> String {
    let encoded = general_purpose::STANDARD.encode(bytes);
    format!("data:{mime};base64,{encoded}")
}

fn pdf_text_is_useful(text: &str) -> bool {
    text.trim().chars().count() >= MIN_PDF_TEXT_CHARS
}
