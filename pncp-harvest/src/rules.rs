//! Versioned relevance rule table
//!
//! All keyword lists, weights, code ranges and value bands live in one
//! data-driven table constructed at startup and injected into the scorer.
//! The built-in table is the medical-supply rule set the pipeline ships
//! with; a TOML file can replace it wholesale for other target domains.

use pncp_common::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// A keyword with the score contribution it carries when matched
#[derive(Debug, Clone, Deserialize)]
pub struct WeightedTerm {
    pub term: String,
    pub weight: i32,
}

/// Score boost applied when the tender value is at or above `floor`.
/// Bands are checked highest-floor first; only the first match applies.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ValueBand {
    pub floor: f64,
    pub boost: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleTable {
    /// Bumped whenever the shipped table changes meaningfully
    pub version: u32,

    /// Terms that mark a tender as definitively out of domain
    pub disqualifiers: Vec<String>,
    /// Penalty subtracted when a disqualifier matches the descriptive text
    pub disqualifier_penalty: i32,

    /// Weighted terms matched against the issuing organization's name
    pub org_keywords: Vec<WeightedTerm>,
    /// Weighted terms matched against the tender's descriptive text
    pub object_keywords: Vec<WeightedTerm>,
    /// High-signal terms used for auto-approval and sub-record analysis
    pub strong_keywords: Vec<String>,

    /// Classification-code prefixes that confirm relevance outright
    pub target_code_prefixes: Vec<String>,

    pub value_bands: Vec<ValueBand>,
    /// Modality codes that carry a small boost (electronic bidding)
    pub boosted_modalities: Vec<u16>,
    pub modality_boost: i32,
}

impl RuleTable {
    /// The shipped medical-supply rule set (v1).
    ///
    /// Target code range: federal supply group 65 (medical, dental and
    /// veterinary equipment and supplies).
    pub fn builtin() -> Self {
        fn w(term: &str, weight: i32) -> WeightedTerm {
            WeightedTerm {
                term: term.to_string(),
                weight,
            }
        }
        fn s(term: &str) -> String {
            term.to_string()
        }

        Self {
            version: 1,
            disqualifiers: vec![
                s("educação"),
                s("educacao"),
                s("escola"),
                s("ensino"),
                s("transporte"),
                s("ônibus"),
                s("onibus"),
                s("veículo"),
                s("veiculo"),
                s("pavimentação"),
                s("pavimentacao"),
                s("asfalto"),
                s("saneamento"),
                s("esgoto"),
                s("iluminação"),
                s("iluminacao"),
                s("informática"),
                s("informatica"),
                s("computador"),
                s("merenda"),
                s("combustível"),
                s("combustivel"),
                s("material de limpeza"),
            ],
            disqualifier_penalty: 60,
            org_keywords: vec![
                w("hospital", 30),
                w("saúde", 25),
                w("saude", 25),
                w("santa casa", 25),
                w("hemocentro", 25),
                w("clínica", 20),
                w("clinica", 20),
                w("sus", 20),
                w("upa", 20),
                w("samu", 20),
                w("maternidade", 20),
                w("policlínica", 20),
                w("policlinica", 20),
                w("pronto socorro", 20),
                w("pronto-socorro", 20),
                w("vigilância sanitária", 20),
                w("vigilancia sanitaria", 20),
                w("ambulatório", 15),
                w("ambulatorio", 15),
                w("posto de saúde", 15),
                w("posto de saude", 15),
            ],
            object_keywords: vec![
                w("medicamento", 25),
                w("curativo", 25),
                w("material médico", 25),
                w("material medico", 25),
                w("material hospitalar", 25),
                w("médico", 20),
                w("medico", 20),
                w("hospitalar", 20),
                w("cirúrgico", 20),
                w("cirurgico", 20),
                w("seringa", 20),
                w("cateter", 20),
                w("equipo", 20),
                w("material penso", 20),
                w("insumo médico", 20),
                w("equipamento médico", 20),
                w("laboratório", 15),
                w("laboratorio", 15),
                w("gaze", 15),
                w("luva", 10),
                w("máscara", 10),
                w("mascara", 10),
            ],
            strong_keywords: vec![
                s("medicamento"),
                s("hospitalar"),
                s("hospital"),
                s("cirúrgico"),
                s("cirurgico"),
                s("curativo"),
                s("seringa"),
                s("agulha"),
                s("cateter"),
                s("equipo"),
                s("gaze"),
                s("estéril"),
                s("esteril"),
                s("laboratório"),
                s("laboratorio"),
                s("ambulância"),
                s("ambulancia"),
                s("uti"),
            ],
            target_code_prefixes: vec![s("65")],
            value_bands: vec![
                ValueBand {
                    floor: 100_000.0,
                    boost: 15,
                },
                ValueBand {
                    floor: 50_000.0,
                    boost: 10,
                },
            ],
            boosted_modalities: vec![6, 8],
            modality_boost: 5,
        }
    }

    /// Replace the shipped table with one loaded from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read rule table {} failed: {}", path.display(), e)))?;
        let table: RuleTable = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse rule table {} failed: {}", path.display(), e)))?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_code_prefixes.is_empty() {
            return Err(Error::Config(
                "rule table has no target code prefixes".to_string(),
            ));
        }
        if self.object_keywords.is_empty() && self.org_keywords.is_empty() {
            return Err(Error::Config("rule table has no keywords".to_string()));
        }
        Ok(())
    }
}
