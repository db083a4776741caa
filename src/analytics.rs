//! Clasificación de preguntas y agregados deterministas sobre los
//! documentos recuperados.
//!
//! Las preguntas de pertenencia ("qué pacientes tienen X") y de frecuencia
//! de tratamiento se responden contando sobre los metadatos recuperados,
//! nunca a partir del texto libre del modelo.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{Provenance, TreatmentStats};

static PATIENTS_WITH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:which|what)\s+patients?\s+(?:had|has|have|were\s+diagnosed\s+with|was\s+diagnosed\s+with|with)\s+(.+)",
    )
    .unwrap()
});

const TREATMENT_TERMS: [&str; 4] = ["treatment", "medication", "drug", "prescription"];
const FREQUENCY_PHRASES: [&str; 5] = [
    "most frequent",
    "most common",
    "most often",
    "most prescribed",
    "prescribed most",
];

/// Intención detectada en una pregunta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryIntent {
    /// Pertenencia: pacientes cuyo diagnóstico contiene el fragmento.
    PatientsByDiagnosis(String),
    /// Tratamiento más prescrito dentro de los documentos recuperados.
    MostFrequentTreatment,
    /// Todo lo demás se delega al compositor.
    Normal,
}

fn mentions_treatment(question: &str) -> bool {
    TREATMENT_TERMS.iter().any(|term| question.contains(term))
}

fn asks_for_most_frequent(question: &str) -> bool {
    FREQUENCY_PHRASES
        .iter()
        .any(|phrase| question.contains(phrase))
}

/// Extrae el fragmento de diagnóstico de una pregunta de pertenencia ya
/// pasada a minúsculas. Quita signos finales, la palabra "diagnosis" y el
/// artículo inicial.
fn diagnosis_fragment(question: &str) -> Option<String> {
    let captures = PATIENTS_WITH.captures(question)?;
    let mut fragment = captures
        .get(1)?
        .as_str()
        .trim()
        .trim_end_matches(|c: char| c == '?' || c == '.' || c == '!')
        .trim()
        .to_string();

    for suffix in ["diagnoses", "diagnosis"] {
        if let Some(stripped) = fragment.strip_suffix(suffix) {
            fragment = stripped.trim().to_string();
        }
    }

    for article in ["a ", "an ", "the "] {
        if let Some(stripped) = fragment.strip_prefix(article) {
            fragment = stripped.trim().to_string();
            break;
        }
    }

    if fragment.is_empty() {
        None
    } else {
        Some(fragment)
    }
}

/// Clasifica la pregunta. Si encajan a la vez la pertenencia y la
/// frecuencia, no hay agregado local fiable y se delega al compositor.
pub fn classify_question(question: &str) -> QueryIntent {
    let lowered = question.to_lowercase();
    let frequency = mentions_treatment(&lowered) && asks_for_most_frequent(&lowered);
    let membership = diagnosis_fragment(&lowered);

    match (membership, frequency) {
        (Some(_), true) => QueryIntent::Normal,
        (Some(fragment), false) => QueryIntent::PatientsByDiagnosis(fragment),
        (None, true) => QueryIntent::MostFrequentTreatment,
        (None, false) => QueryIntent::Normal,
    }
}

/// Pacientes cuyos documentos recuperados mencionan un diagnóstico que
/// contiene el fragmento (sin distinguir mayúsculas). Sin duplicados,
/// conservando la primera grafía y el orden del ranking.
pub fn patients_with_diagnosis(provenance: &[Provenance], fragment: &str) -> Vec<String> {
    let needle = fragment.to_lowercase();
    let mut seen = HashSet::new();
    let mut patients = Vec::new();

    for entry in provenance {
        if entry.diagnosis.is_empty() || !entry.diagnosis.to_lowercase().contains(&needle) {
            continue;
        }
        if entry.patient.is_empty() {
            continue;
        }
        if seen.insert(entry.patient.to_lowercase()) {
            patients.push(entry.patient.clone());
        }
    }

    patients
}

/// Tratamiento canónico más repetido en los documentos recuperados. Cada
/// cadena canónica completa cuenta como una unidad; a igual conteo gana la
/// primera vista. `None` si ningún documento trae tratamientos.
pub fn most_frequent_treatment(provenance: &[Provenance]) -> Option<TreatmentStats> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen: Vec<String> = Vec::new();

    for entry in provenance {
        for treatment in entry.treatments.split(" | ") {
            let treatment = treatment.trim();
            if treatment.is_empty() {
                continue;
            }
            let count = counts.entry(treatment.to_string()).or_insert(0);
            if *count == 0 {
                first_seen.push(treatment.to_string());
            }
            *count += 1;
        }
    }

    let mut best: Option<TreatmentStats> = None;
    for treatment in first_seen {
        let count = counts[&treatment];
        let better = match &best {
            None => true,
            Some(current) => count > current.count,
        };
        if better {
            best = Some(TreatmentStats { treatment, count });
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prov(id: &str, patient: &str, diagnosis: &str, treatments: &str) -> Provenance {
        Provenance {
            id: id.to_string(),
            patient: patient.to_string(),
            doctor: String::new(),
            diagnosis: diagnosis.to_string(),
            treatments: treatments.to_string(),
            score: 0.9,
        }
    }

    #[test]
    fn membership_questions_capture_the_diagnosis_fragment() {
        assert_eq!(
            classify_question("Which patients had Type 2 Diabetes?"),
            QueryIntent::PatientsByDiagnosis("type 2 diabetes".to_string())
        );
        assert_eq!(
            classify_question("which patients were diagnosed with asthma"),
            QueryIntent::PatientsByDiagnosis("asthma".to_string())
        );
        assert_eq!(
            classify_question("What patients have a hypertension diagnosis?"),
            QueryIntent::PatientsByDiagnosis("hypertension".to_string())
        );
    }

    #[test]
    fn fragment_drops_trailing_diagnosis_word_and_articles() {
        assert_eq!(
            classify_question("Which patients had diabetes diagnosis?"),
            QueryIntent::PatientsByDiagnosis("diabetes".to_string())
        );
        assert_eq!(
            classify_question("Which patients had the flu?"),
            QueryIntent::PatientsByDiagnosis("flu".to_string())
        );
    }

    #[test]
    fn frequency_questions_need_treatment_and_superlative() {
        assert_eq!(
            classify_question("What treatment was prescribed most frequently?"),
            QueryIntent::MostFrequentTreatment
        );
        assert_eq!(
            classify_question("Which treatment was prescribed most?"),
            QueryIntent::MostFrequentTreatment
        );
        assert_eq!(
            classify_question("Which medication is most common across the notes?"),
            QueryIntent::MostFrequentTreatment
        );
        // Superlativo sin mención de tratamiento: no hay agregado local.
        assert_eq!(
            classify_question("Which hospital appears most often?"),
            QueryIntent::Normal
        );
    }

    #[test]
    fn everything_else_is_normal() {
        assert_eq!(
            classify_question("What did the cardiologist recommend for Ana?"),
            QueryIntent::Normal
        );
        assert_eq!(classify_question(""), QueryIntent::Normal);
    }

    #[test]
    fn hybrid_question_matching_both_patterns_is_normal() {
        assert_eq!(
            classify_question("Which patients had the most frequent treatment?"),
            QueryIntent::Normal
        );
    }

    #[test]
    fn membership_keeps_ranking_order_and_first_spelling() {
        let provenance = vec![
            prov("d1", "Ana García", "Type 2 Diabetes", ""),
            prov("d2", "Luis Pérez", "type 2 diabetes mellitus", ""),
            prov("d3", "Marta Ruiz", "Asthma", ""),
            prov("d4", "ANA GARCÍA", "diabetes", ""),
        ];

        let patients = patients_with_diagnosis(&provenance, "diabetes");
        assert_eq!(patients, vec!["Ana García", "Luis Pérez"]);
    }

    #[test]
    fn membership_skips_entries_without_patient_or_diagnosis() {
        let provenance = vec![
            prov("d1", "", "diabetes", ""),
            prov("d2", "Luis Pérez", "", ""),
            prov("d3", "Marta Ruiz", "prediabetes", ""),
        ];

        let patients = patients_with_diagnosis(&provenance, "diabetes");
        assert_eq!(patients, vec!["Marta Ruiz"]);
    }

    #[test]
    fn most_frequent_counts_whole_canonical_strings() {
        let provenance = vec![
            prov(
                "d1",
                "Ana",
                "",
                "insulin 10 units iv daily | metformin 500mg twice daily",
            ),
            prov("d2", "Luis", "", "metformin 500mg twice daily"),
            prov("d3", "Marta", "", "metformin 850mg daily"),
        ];

        let stats = most_frequent_treatment(&provenance).unwrap();
        assert_eq!(stats.treatment, "metformin 500mg twice daily");
        assert_eq!(stats.count, 2);
    }

    #[test]
    fn most_frequent_breaks_ties_by_first_appearance() {
        let provenance = vec![
            prov("d1", "Ana", "", "amlodipine 5mg daily"),
            prov("d2", "Luis", "", "atorvastatin 20mg daily"),
        ];

        let stats = most_frequent_treatment(&provenance).unwrap();
        assert_eq!(stats.treatment, "amlodipine 5mg daily");
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn most_frequent_is_none_without_treatments() {
        let provenance = vec![prov("d1", "Ana", "diabetes", ""), prov("d2", "Luis", "", "")];
        assert_eq!(most_frequent_treatment(&provenance), None);
    }
}
