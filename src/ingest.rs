//! Ingesta de notas clínicas: normalización de registros estructurados,
//! resumen de caso y reindexado del directorio de notas limpias.

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::{
    app_state::Status,
    canonical,
    models::{CaseSummary, ClinicalRecord, NoteDocument, NoteMetadata},
    vector_store::NoteStore,
};

/// Resumen de los resultados de una operación de reindexado.
#[derive(Debug, Default)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_indexed: u32,
    pub files_skipped: u32,
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} indexados, {} omitidos.",
            self.files_scanned, self.files_indexed, self.files_skipped
        )
    }
}

fn text_or_empty(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Convierte un registro clínico en la nota indexable, o `None` si el
/// registro no contiene texto utilizable.
///
/// El texto es `cleaned_text` y, en su defecto, `raw_text`. El id del
/// documento es el nombre del fichero origen sin su última extensión, de
/// modo que reprocesar la misma nota reemplaza el documento anterior.
pub fn normalize_record(record: &ClinicalRecord, source_name: &str) -> Option<NoteDocument> {
    let text = record
        .cleaned_text
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| record.raw_text.as_deref().filter(|t| !t.trim().is_empty()))?
        .to_string();

    let id = Path::new(source_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| source_name.to_string());

    let metadata = NoteMetadata {
        source: source_name.to_string(),
        patient_name: text_or_empty(&record.patient.name),
        age: text_or_empty(&record.patient.age),
        gender: text_or_empty(&record.patient.gender),
        doctor: text_or_empty(&record.doctor),
        hospital: text_or_empty(&record.hospital),
        date: text_or_empty(&record.date),
        diagnosis: text_or_empty(&record.diagnosis),
        treatments: canonical::treatments_field(&record.prescriptions),
    };

    Some(NoteDocument { id, text, metadata })
}

/// Resumen compacto de caso para una nota procesada. Las prescripciones sin
/// fármaco se ignoran; el seguimiento no se infiere nunca.
pub fn case_summary(record: &ClinicalRecord) -> CaseSummary {
    let mut lines = Vec::new();
    for entry in &record.prescriptions {
        let Some(drug) = entry.drug.as_deref().filter(|d| !d.trim().is_empty()) else {
            continue;
        };
        let mut line = drug.trim().to_string();
        if let Some(dose) = entry.dose.as_deref().filter(|d| !d.trim().is_empty()) {
            line.push(' ');
            line.push_str(dose.trim());
        }
        if let Some(freq) = entry.frequency.as_deref().filter(|f| !f.trim().is_empty()) {
            line.push_str(", ");
            line.push_str(freq.trim());
        }
        lines.push(line);
    }

    CaseSummary {
        patient: record.patient.name.clone().filter(|n| !n.trim().is_empty()),
        diagnosis: record.diagnosis.clone().filter(|d| !d.trim().is_empty()),
        treatment: if lines.is_empty() {
            None
        } else {
            Some(lines.join("; "))
        },
        follow_up: None,
    }
}

/// Recorre el directorio de notas limpias e indexa cada fichero `.json`
/// como un documento, informando del progreso a través del estado
/// compartido del servidor.
pub async fn reindex_notes_dir(
    store: &dyn NoteStore,
    notes_dir: &Path,
    status_arc: Arc<Mutex<Status>>,
) -> Result<IngestionSummary> {
    if !notes_dir.is_dir() {
        return Err(anyhow!(
            "La ruta no es un directorio: {}",
            notes_dir.display()
        ));
    }

    let mut summary = IngestionSummary::default();
    let mut file_entries: Vec<_> = WalkDir::new(notes_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(std::ffi::OsStr::to_str)
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        })
        .collect();
    // Orden estable para que el progreso sea reproducible.
    file_entries.sort_by(|a, b| a.path().cmp(b.path()));

    let total_files = file_entries.len() as f32;

    for (index, entry) in file_entries.iter().enumerate() {
        summary.files_scanned += 1;
        let path = entry.path().to_path_buf();
        let filename_str = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let progress = (index + 1) as f32 / total_files;

        {
            let mut status = status_arc.lock().unwrap();
            status.message = format!(
                "[{}/{}] Indexando: {}...",
                index + 1,
                total_files as u32,
                filename_str
            );
            status.progress = progress;
        }

        match index_note_file(store, &path, &filename_str).await {
            Ok(true) => summary.files_indexed += 1,
            Ok(false) => {
                summary.files_skipped += 1;
                let mut status = status_arc.lock().unwrap();
                status.message = format!(
                    "[{}/{}] Omitido: {}",
                    index + 1,
                    total_files as u32,
                    filename_str
                );
                status.progress = progress;
            }
            Err(err) => {
                summary.files_skipped += 1;
                let error_message = format!("ERROR en {}: {}", path.display(), err);
                error!("Error indexando {}: {err}", path.display());
                {
                    let mut status = status_arc.lock().unwrap();
                    status.message = error_message;
                    status.progress = progress;
                }
            }
        }
    }

    info!("{summary}");
    Ok(summary)
}

/// Indexa un fichero de nota. Devuelve `Ok(false)` cuando el fichero se
/// omite por ilegible, JSON inválido o falta de texto; sólo los fallos del
/// almacén se propagan como error.
async fn index_note_file(store: &dyn NoteStore, path: &Path, filename: &str) -> Result<bool> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("Saltando fichero ilegible {}: {}", path.display(), e);
            return Ok(false);
        }
    };

    let record: ClinicalRecord = match serde_json::from_str(&contents) {
        Ok(record) => record,
        Err(e) => {
            warn!("Saltando JSON inválido {}: {}", path.display(), e);
            return Ok(false);
        }
    };

    let Some(doc) = normalize_record(&record, filename) else {
        warn!("Saltando nota sin texto utilizable: {}", path.display());
        return Ok(false);
    };

    store.add_or_replace(&doc).await?;
    info!("Indexada nota '{}' desde {}.", doc.id, path.display());
    Ok(true)
}
