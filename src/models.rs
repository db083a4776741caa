//! Modelos de dominio (registros clínicos estructurados, metadatos de las
//! notas indexadas y formas de respuesta de la API).

use serde::{Deserialize, Deserializer, Serialize};

/// Una línea de prescripción tal y como la emite el LLM de estructuración.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrescriptionEntry {
    #[serde(default)]
    pub drug: Option<String>,
    #[serde(default)]
    pub dose: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

/// Datos del paciente dentro de un registro clínico.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patient {
    #[serde(default)]
    pub name: Option<String>,
    /// La edad llega a veces como número JSON; se conserva siempre como texto.
    #[serde(default, deserialize_with = "age_as_text")]
    pub age: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
}

/// Registro clínico estructurado: la salida del LLM de estructuración o el
/// contenido de un fichero de `outputs/clean`. Los campos nulos o ausentes
/// son normales; el normalizador decide qué hacer con ellos.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClinicalRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub patient: Patient,
    #[serde(default)]
    pub doctor: Option<String>,
    #[serde(default)]
    pub hospital: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub diagnosis: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub prescriptions: Vec<PrescriptionEntry>,
    #[serde(default)]
    pub cleaned_text: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
}

/// Metadatos planos de una nota indexada. Todos los valores son texto; un
/// campo ausente en el registro se guarda como cadena vacía, nunca se omite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteMetadata {
    pub source: String,
    pub patient_name: String,
    pub age: String,
    pub gender: String,
    pub doctor: String,
    pub hospital: String,
    pub date: String,
    pub diagnosis: String,
    /// Lista canónica de tratamientos, ordenada y unida con " | ".
    pub treatments: String,
}

/// Nota lista para indexar: texto completo más metadatos, con id estable
/// derivado del nombre del fichero de origen.
#[derive(Debug, Clone)]
pub struct NoteDocument {
    pub id: String,
    pub text: String,
    pub metadata: NoteMetadata,
}

/// Resultado crudo del almacén vectorial. La distancia es ascendente:
/// 0 significa idéntico y los resultados llegan del más al menos cercano.
#[derive(Debug, Clone)]
pub struct ScoredNote {
    pub id: String,
    pub distance: f64,
    pub text: String,
    pub metadata: NoteMetadata,
}

/// Registro de una consulta realizada (nodo :Query en Neo4j).
#[derive(Debug, Clone)]
pub struct QueryNode {
    pub id: String,
    pub question: String,
    pub created_at: String,
}

/// Procedencia de un documento incluido en el contexto de una respuesta.
#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub id: String,
    pub patient: String,
    pub doctor: String,
    pub diagnosis: String,
    pub treatments: String,
    pub score: f64,
}

/// Tratamiento más frecuente dentro de la ventana recuperada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreatmentStats {
    pub treatment: String,
    pub count: usize,
}

/// Tipo de pregunta detectado para una respuesta estructurada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AnswerKind {
    #[serde(rename = "diagnosis_query")]
    DiagnosisQuery,
    #[serde(rename = "treatment_frequency")]
    TreatmentFrequency,
    #[default]
    #[serde(rename = "normal")]
    Normal,
}

/// Confianza declarada de una respuesta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Interpreta el valor textual que devuelve el LLM; desconocido => Low.
    pub fn from_text(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Respuesta estructurada del endpoint /ask. `treatment_stats` sólo aparece
/// en respuestas de frecuencia de tratamiento; `patients` siempre se
/// serializa (vacío salvo en consultas de diagnóstico).
#[derive(Debug, Clone, Serialize)]
pub struct StructuredAnswer {
    pub answer: Option<String>,
    #[serde(rename = "type")]
    pub kind: AnswerKind,
    pub patients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treatment_stats: Option<TreatmentStats>,
    pub used_documents: Vec<String>,
    pub provenance: Vec<Provenance>,
    pub confidence: Confidence,
}

/// Resumen compacto de caso que acompaña a cada nota procesada.
#[derive(Debug, Clone, Serialize)]
pub struct CaseSummary {
    #[serde(rename = "Patient")]
    pub patient: Option<String>,
    #[serde(rename = "Diagnosis")]
    pub diagnosis: Option<String>,
    #[serde(rename = "Treatment")]
    pub treatment: Option<String>,
    #[serde(rename = "Follow-up")]
    pub follow_up: Option<String>,
}

/// `null` explícito en el JSON se trata igual que un campo ausente.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let value = Option::<T>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

fn age_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AgeRepr {
        Text(String),
        Int(i64),
        Float(f64),
    }

    let raw = Option::<AgeRepr>::deserialize(deserializer)?;
    Ok(raw.map(|v| match v {
        AgeRepr::Text(s) => s,
        AgeRepr::Int(n) => n.to_string(),
        AgeRepr::Float(n) => n.to_string(),
    }))
}
