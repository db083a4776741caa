//! Canonicalización de prescripciones.
//!
//! Dos recetas que sólo difieren en mayúsculas, espaciado, la grafía de
//! "i.v." o el hueco entre cifra y "mg" deben producir la MISMA cadena
//! canónica; de lo contrario los conteos de tratamientos se fragmentan.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::PrescriptionEntry;

static WHITESPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static IV_VARIANTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"i\.?v\.?").unwrap());
static MG_SPACING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s*mg").unwrap());

/// Recorta y comprime los tramos de espacios internos a uno solo.
fn squeeze(text: &str) -> String {
    WHITESPACE_RUNS.replace_all(text.trim(), " ").to_string()
}

fn clean_component(raw: Option<&str>) -> String {
    squeeze(&raw.unwrap_or("").to_lowercase())
}

/// Convierte una entrada de prescripción en su forma canónica estable:
/// minúsculas, espaciado comprimido, "i.v."/"iv." => "iv" en dosis y
/// frecuencia, "500 mg" => "500mg" en la dosis, y los tres componentes
/// unidos por espacios. Una entrada sin fármaco, dosis ni frecuencia
/// produce la cadena vacía. La función es pura e idempotente.
pub fn canonicalize_prescription(entry: &PrescriptionEntry) -> String {
    let drug = clean_component(entry.drug.as_deref());
    let mut dose = clean_component(entry.dose.as_deref());
    let mut freq = clean_component(entry.frequency.as_deref());

    dose = IV_VARIANTS.replace_all(&dose, "iv").to_string();
    freq = IV_VARIANTS.replace_all(&freq, "iv").to_string();
    dose = MG_SPACING.replace_all(&dose, "${1}mg").to_string();

    squeeze(&format!("{drug} {dose} {freq}"))
}

/// Deriva el campo `treatments` de los metadatos: canonicaliza cada
/// prescripción, descarta las vacías, ordena lexicográficamente y une con
/// " | ". El orden de entrada no influye en el resultado.
pub fn treatments_field(prescriptions: &[PrescriptionEntry]) -> String {
    let mut canonical: Vec<String> = prescriptions
        .iter()
        .map(canonicalize_prescription)
        .filter(|c| !c.is_empty())
        .collect();
    canonical.sort();
    canonical.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(drug: &str, dose: &str, freq: &str) -> PrescriptionEntry {
        let opt = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        };
        PrescriptionEntry {
            drug: opt(drug),
            dose: opt(dose),
            frequency: opt(freq),
            duration: None,
        }
    }

    #[test]
    fn lowercases_and_squeezes_whitespace() {
        let canonical = canonicalize_prescription(&entry("  Amoxicillin ", "500mg", "3  times   daily"));
        assert_eq!(canonical, "amoxicillin 500mg 3 times daily");
    }

    #[test]
    fn mg_spacing_is_normalized_in_dose() {
        let spaced = canonicalize_prescription(&entry("Paracetamol", "500 MG", "daily"));
        let tight = canonicalize_prescription(&entry("paracetamol", "500mg", "daily"));
        assert_eq!(spaced, tight);
        assert_eq!(spaced, "paracetamol 500mg daily");
    }

    #[test]
    fn iv_spellings_collapse_in_dose_and_frequency() {
        let dotted = canonicalize_prescription(&entry("Ceftriaxone", "1g I.V.", "once daily i.v."));
        let plain = canonicalize_prescription(&entry("ceftriaxone", "1g iv", "once daily iv"));
        assert_eq!(dotted, plain);
    }

    #[test]
    fn iv_is_not_rewritten_inside_drug_name() {
        let canonical = canonicalize_prescription(&entry("I.V.-Globulin", "", ""));
        assert_eq!(canonical, "i.v.-globulin");
    }

    #[test]
    fn empty_entry_yields_empty_string() {
        assert_eq!(canonicalize_prescription(&PrescriptionEntry::default()), "");
        assert_eq!(canonicalize_prescription(&entry("", "   ", "")), "");
    }

    #[test]
    fn missing_components_do_not_leave_gaps() {
        let canonical = canonicalize_prescription(&entry("Ibuprofen", "", "twice daily"));
        assert_eq!(canonical, "ibuprofen twice daily");
    }

    #[test]
    fn canonical_output_is_a_fixed_point() {
        let first = canonicalize_prescription(&entry("Amoxicillin", "500 MG I.V.", "3 Times Daily"));
        let again = canonicalize_prescription(&entry(&first, "", ""));
        assert_eq!(first, again);
    }

    #[test]
    fn treatments_field_sorts_and_joins() {
        let field = treatments_field(&[
            entry("Zinc", "20mg", "daily"),
            entry("Amoxicillin", "500mg", "twice daily"),
        ]);
        assert_eq!(field, "amoxicillin 500mg twice daily | zinc 20mg daily");
    }

    #[test]
    fn treatments_field_is_order_independent() {
        let a = entry("Metformin", "850 mg", "with meals");
        let b = entry("Lisinopril", "10mg", "morning");
        let c = entry("Aspirin", "100 mg", "daily");

        let forward = treatments_field(&[a.clone(), b.clone(), c.clone()]);
        let backward = treatments_field(&[c, b, a]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn treatments_field_drops_empty_entries() {
        let field = treatments_field(&[entry("", "", ""), entry("Omeprazole", "20mg", "daily")]);
        assert_eq!(field, "omeprazole 20mg daily");
    }

    #[test]
    fn treatments_field_empty_without_prescriptions() {
        assert_eq!(treatments_field(&[]), "");
    }
}
