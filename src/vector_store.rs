//! Almacén de notas con búsqueda por similitud.
//!
//! El trait `NoteStore` aísla al resto de la aplicación del backend:
//! la implementación de producción usa Neo4j como vector store y la de
//! memoria sirve de referencia determinista para los tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use neo4rs::{query, Graph};
use tracing::info;
use uuid::Uuid;

use crate::llm::LlmManager;
use crate::models::{NoteDocument, NoteMetadata, QueryNode, ScoredNote};

const NOTE_INDEX_NAME: &str = "noteEmbeddingIndex";

/// Contrato del almacén de notas indexadas.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Inserta o reemplaza (por id) una nota completa. La escritura es
    /// atómica por documento; no hay transacciones entre documentos.
    async fn add_or_replace(&self, doc: &NoteDocument) -> Result<()>;

    /// Devuelve las `k` notas más cercanas a la consulta, ordenadas por
    /// distancia ascendente (0 = idéntica), con texto y metadatos.
    async fn nearest(&self, query_text: &str, k: usize) -> Result<Vec<ScoredNote>>;

    /// Registro de auditoría de una consulta. Por defecto no hace nada.
    async fn log_question(&self, _question: &str, _matched: &[(String, f64)]) -> Result<()> {
        Ok(())
    }
}

/// Garantiza que el índice vectorial sobre `:Note(embedding)` exista.
pub async fn ensure_note_vector_index(graph: &Graph) -> Result<()> {
    // ¿Ya existe el índice? Usamos la sintaxis moderna SHOW VECTOR INDEXES.
    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", NOTE_INDEX_NAME),
        )
        .await?;

    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{NOTE_INDEX_NAME}' ya existe.");
        return Ok(());
    }

    // Crear índice vectorial para :Note(embedding)
    let cypher = format!(
        "\
CREATE VECTOR INDEX {index_name}
FOR (n:Note)
ON (n.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: 1536,
    `vector.similarity_function`: 'cosine'
  }}
}}",
        index_name = NOTE_INDEX_NAME
    );

    graph.run(query(&cypher)).await?;
    info!("Índice vectorial '{NOTE_INDEX_NAME}' creado.");

    Ok(())
}

/// Implementación de producción sobre Neo4j. Los embeddings se calculan a
/// través del gestor de LLMs tanto al indexar como al consultar.
pub struct Neo4jNoteStore {
    graph: Arc<Graph>,
    llm: LlmManager,
}

impl Neo4jNoteStore {
    pub fn new(graph: Arc<Graph>, llm: LlmManager) -> Self {
        Self { graph, llm }
    }
}

#[async_trait]
impl NoteStore for Neo4jNoteStore {
    async fn add_or_replace(&self, doc: &NoteDocument) -> Result<()> {
        let mut vectors = self.llm.embed_texts(&[doc.text.clone()]).await?;
        let embedding = vectors
            .pop()
            .ok_or_else(|| anyhow!("No se pudo generar el embedding de la nota {}", doc.id))?;

        // MERGE sobre el id único: la última escritura gana.
        let m = &doc.metadata;
        self.graph
            .run(
                query(
                    "MERGE (n:Note {id: $id})
                     SET n.text = $text, n.embedding = $embedding,
                         n.source = $source, n.patient_name = $patient_name,
                         n.age = $age, n.gender = $gender,
                         n.doctor = $doctor, n.hospital = $hospital,
                         n.date = $date, n.diagnosis = $diagnosis,
                         n.treatments = $treatments",
                )
                .param("id", doc.id.clone())
                .param("text", doc.text.clone())
                .param("embedding", embedding)
                .param("source", m.source.clone())
                .param("patient_name", m.patient_name.clone())
                .param("age", m.age.clone())
                .param("gender", m.gender.clone())
                .param("doctor", m.doctor.clone())
                .param("hospital", m.hospital.clone())
                .param("date", m.date.clone())
                .param("diagnosis", m.diagnosis.clone())
                .param("treatments", m.treatments.clone()),
            )
            .await?;

        Ok(())
    }

    async fn nearest(&self, query_text: &str, k: usize) -> Result<Vec<ScoredNote>> {
        // 1) Embedding de la consulta
        let mut vectors = self.llm.embed_texts(&[query_text.to_string()]).await?;
        let query_vec = vectors
            .pop()
            .ok_or_else(|| anyhow!("No se pudo generar embedding de la consulta"))?;

        // 2) Vector search en Neo4j
        let mut cursor = self
            .graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node, score
                     RETURN node.id AS id, score, node.text AS text,
                            node.source AS source, node.patient_name AS patient_name,
                            node.age AS age, node.gender AS gender,
                            node.doctor AS doctor, node.hospital AS hospital,
                            node.date AS date, node.diagnosis AS diagnosis,
                            node.treatments AS treatments
                     ORDER BY score DESC",
                )
                .param("index_name", NOTE_INDEX_NAME)
                .param("k", k as i64)
                .param("embedding", query_vec),
            )
            .await?;

        // 3) Convertir filas a ScoredNote con distancia ascendente
        let mut output = Vec::new();
        while let Some(row) = cursor.next().await? {
            let id: String = row
                .get("id")
                .ok_or_else(|| anyhow!("Falta campo 'id' en resultado de Neo4j"))?;
            let score: f64 = row
                .get("score")
                .ok_or_else(|| anyhow!("Falta campo 'score' en resultado de Neo4j"))?;
            let text: String = row.get("text").unwrap_or_default();

            let metadata = NoteMetadata {
                source: row.get("source").unwrap_or_default(),
                patient_name: row.get("patient_name").unwrap_or_default(),
                age: row.get("age").unwrap_or_default(),
                gender: row.get("gender").unwrap_or_default(),
                doctor: row.get("doctor").unwrap_or_default(),
                hospital: row.get("hospital").unwrap_or_default(),
                date: row.get("date").unwrap_or_default(),
                diagnosis: row.get("diagnosis").unwrap_or_default(),
                treatments: row.get("treatments").unwrap_or_default(),
            };

            // El índice coseno devuelve similitud en [0, 1]; el resto del
            // código trabaja con distancias ascendentes.
            output.push(ScoredNote {
                id,
                distance: (1.0 - score).max(0.0),
                text,
                metadata,
            });
        }

        Ok(output)
    }

    async fn log_question(&self, question: &str, matched: &[(String, f64)]) -> Result<()> {
        let node = QueryNode {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        // Crear nodo :Query
        self.graph
            .run(
                query("MERGE (q:Query {id: $id}) SET q.question = $question, q.created_at = datetime($created_at)")
                    .param("id", node.id.clone())
                    .param("question", node.question.clone())
                    .param("created_at", node.created_at.clone()),
            )
            .await?;

        // Crear relaciones :MATCHED_NOTE con la similitud de cada acierto
        for (note_id, score) in matched {
            self.graph
                .run(
                    query(
                        "MATCH (q:Query {id: $qid}), (n:Note {id: $nid})
                         MERGE (q)-[r:MATCHED_NOTE]->(n) SET r.score = $score",
                    )
                    .param("qid", node.id.clone())
                    .param("nid", note_id.clone())
                    .param("score", *score),
                )
                .await?;
        }

        Ok(())
    }
}

/// Implementación en memoria con ranking determinista por coseno sobre
/// frecuencias de términos. Pensada para tests y entornos sin Neo4j.
#[derive(Default)]
pub struct InMemoryNoteStore {
    notes: RwLock<HashMap<String, NoteDocument>>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn term_counts(text: &str) -> HashMap<String, f64> {
    let mut counts = HashMap::new();
    for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        *counts.entry(token.to_string()).or_insert(0.0) += 1.0;
    }
    counts
}

fn cosine_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, va)| b.get(term).map(|vb| va * vb))
        .sum();
    let norm = |m: &HashMap<String, f64>| m.values().map(|v| v * v).sum::<f64>().sqrt();
    let (na, nb) = (norm(a), norm(b));
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn add_or_replace(&self, doc: &NoteDocument) -> Result<()> {
        let mut notes = self
            .notes
            .write()
            .map_err(|_| anyhow!("Lock del almacén en memoria envenenado"))?;
        notes.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn nearest(&self, query_text: &str, k: usize) -> Result<Vec<ScoredNote>> {
        let query_terms = term_counts(query_text);
        let notes = self
            .notes
            .read()
            .map_err(|_| anyhow!("Lock del almacén en memoria envenenado"))?;

        let mut scored: Vec<ScoredNote> = notes
            .values()
            .map(|doc| ScoredNote {
                id: doc.id.clone(),
                distance: 1.0 - cosine_similarity(&query_terms, &term_counts(&doc.text)),
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
            })
            .collect();

        // Orden estable: distancia ascendente y, a igualdad, por id.
        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);
        Ok(scored)
    }
}
