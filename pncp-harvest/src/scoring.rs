//! Deterministic relevance scoring
//!
//! Pure functions over the injected rule table: the same text and value
//! always produce the same score, so the quick-filter stage is replayable
//! in tests without any fixtures beyond the table itself.

use crate::rules::RuleTable;
use crate::types::ItemDto;
use regex::Regex;
use std::collections::BTreeSet;

/// Outcome of the zero-network quick score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickScore {
    /// Definitively out of domain; the candidate is dropped immediately
    Rejected,
    /// Heuristic confidence, clamped to 0-100
    Score(i32),
}

pub struct RelevanceScorer {
    rules: RuleTable,
    explicit_code: Regex,
    catalog_code: Regex,
    labeled_code: Regex,
    bare_code: Regex,
}

impl RelevanceScorer {
    /// # Panics
    /// Panics if the built-in code patterns fail to compile (they are
    /// static and covered by tests)
    pub fn new(rules: RuleTable) -> Self {
        Self {
            rules,
            // "CATMAT: 6515", "CATMAT 651510"
            explicit_code: Regex::new(r"(?i)CATMAT[\s:]*(\d{4,8})").expect("static pattern"),
            // "BR 0439626", "BR0439626" (catalog references)
            catalog_code: Regex::new(r"(?i)\bBR[\s]*(\d{7,9})").expect("static pattern"),
            // "CÓDIGO 6515", "Classe: 651510"
            labeled_code: Regex::new(r"(?i)(?:CÓDIGO|CODIGO|CLASSE|CLASSIFICAÇÃO|CLASSIFICACAO)[\s:]*(\d{4,8})")
                .expect("static pattern"),
            // Standalone group-65 codes
            bare_code: Regex::new(r"\b(65\d{2,6})\b").expect("static pattern"),
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Zero-network heuristic score for one candidate.
    ///
    /// Disqualifiers in the organization name reject outright; in the
    /// descriptive text one match costs the configured penalty and two or
    /// more reject. Matched keyword groups then add their weights, with
    /// value-band and modality boosts on top.
    pub fn quick_score(
        &self,
        org_name: &str,
        description: &str,
        value: Option<f64>,
        modality: u16,
    ) -> QuickScore {
        let org = org_name.to_lowercase();
        let text = description.to_lowercase();

        if self
            .rules
            .disqualifiers
            .iter()
            .any(|term| org.contains(term.as_str()))
        {
            return QuickScore::Rejected;
        }

        let mut score = 0i32;

        let text_disqualifiers = self
            .rules
            .disqualifiers
            .iter()
            .filter(|term| text.contains(term.as_str()))
            .count();
        match text_disqualifiers {
            0 => {}
            1 => score -= self.rules.disqualifier_penalty,
            _ => return QuickScore::Rejected,
        }

        for keyword in &self.rules.org_keywords {
            if org.contains(keyword.term.as_str()) {
                score += keyword.weight;
            }
        }
        for keyword in &self.rules.object_keywords {
            if text.contains(keyword.term.as_str()) {
                score += keyword.weight;
            }
        }

        if let Some(value) = value {
            if let Some(band) = self
                .rules
                .value_bands
                .iter()
                .find(|band| value >= band.floor)
            {
                score += band.boost;
            }
        }

        if self.rules.boosted_modalities.contains(&modality) {
            score += self.rules.modality_boost;
        }

        QuickScore::Score(score.clamp(0, 100))
    }

    /// Extract structured classification codes from descriptive text.
    /// Deduplicated and sorted, so output is stable for tests.
    pub fn extract_classification_codes(&self, text: &str) -> Vec<String> {
        let mut codes = BTreeSet::new();

        for pattern in [
            &self.explicit_code,
            &self.catalog_code,
            &self.labeled_code,
            &self.bare_code,
        ] {
            for capture in pattern.captures_iter(text) {
                if let Some(code) = capture.get(1) {
                    codes.insert(code.as_str().to_string());
                }
            }
        }

        codes.into_iter().collect()
    }

    /// True when a code falls in the target domain's range
    pub fn is_target_code(&self, code: &str) -> bool {
        self.rules
            .target_code_prefixes
            .iter()
            .any(|prefix| code.starts_with(prefix.as_str()))
    }

    /// Number of distinct strong keywords present in the text
    pub fn strong_keyword_count(&self, text: &str) -> usize {
        let text = text.to_lowercase();
        self.rules
            .strong_keywords
            .iter()
            .filter(|term| text.contains(term.as_str()))
            .count()
    }

    /// Confidence (0-100) that a sampled sub-record set is in domain.
    ///
    /// Two checks per item: a target-range classification code counts
    /// double, a strong keyword counts once.
    pub fn analyze_sampled_items(&self, items: &[ItemDto]) -> u8 {
        if items.is_empty() {
            return 0;
        }

        let mut indicators = 0usize;
        let total_checks = items.len() * 2;

        for item in items {
            let codes = self.extract_classification_codes(&item.description);
            if codes.iter().any(|code| self.is_target_code(code)) {
                indicators += 2;
            }
            if self.strong_keyword_count(&item.description) > 0 {
                indicators += 1;
            }
        }

        ((indicators as f64 / total_checks as f64) * 100.0).round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleTable;

    fn scorer() -> RelevanceScorer {
        RelevanceScorer::new(RuleTable::builtin())
    }

    fn item(description: &str) -> ItemDto {
        ItemDto {
            item_number: 1,
            description: description.to_string(),
            quantity: None,
            unit_price: None,
        }
    }

    #[test]
    fn scoring_is_deterministic() {
        let scorer = scorer();
        let first = scorer.quick_score(
            "HOSPITAL DAS CLINICAS",
            "aquisição de curativos e seringas",
            Some(150_000.0),
            6,
        );
        for _ in 0..10 {
            let again = scorer.quick_score(
                "HOSPITAL DAS CLINICAS",
                "aquisição de curativos e seringas",
                Some(150_000.0),
                6,
            );
            assert_eq!(again, first);
        }
    }

    #[test]
    fn medical_org_and_object_score_high() {
        let scorer = scorer();
        match scorer.quick_score(
            "SECRETARIA DE SAÚDE",
            "registro de preços de material hospitalar",
            Some(80_000.0),
            6,
        ) {
            QuickScore::Score(score) => assert!(score >= 60, "score was {score}"),
            QuickScore::Rejected => panic!("should not reject"),
        }
    }

    #[test]
    fn disqualifying_org_is_rejected() {
        let scorer = scorer();
        assert_eq!(
            scorer.quick_score(
                "SECRETARIA DE EDUCAÇÃO",
                "aquisição de luvas",
                Some(50_000.0),
                6,
            ),
            QuickScore::Rejected
        );
    }

    #[test]
    fn single_text_disqualifier_penalizes_two_reject() {
        let scorer = scorer();
        // One off-domain term drags the score down but keywords can recover
        let one = scorer.quick_score(
            "PREFEITURA MUNICIPAL",
            "aquisição de material hospitalar e combustível",
            None,
            6,
        );
        assert!(matches!(one, QuickScore::Score(_)));

        let two = scorer.quick_score(
            "PREFEITURA MUNICIPAL",
            "combustível e material de limpeza para frota",
            None,
            6,
        );
        assert_eq!(two, QuickScore::Rejected);
    }

    #[test]
    fn score_never_leaves_bounds() {
        let scorer = scorer();
        match scorer.quick_score(
            "HOSPITAL SANTA CASA SAÚDE CLÍNICA UPA SAMU",
            "medicamento curativo seringa cateter equipo gaze material hospitalar material médico",
            Some(1_000_000.0),
            6,
        ) {
            QuickScore::Score(score) => assert_eq!(score, 100),
            QuickScore::Rejected => panic!("should not reject"),
        }
    }

    #[test]
    fn extracts_codes_in_all_formats() {
        let scorer = scorer();
        let codes = scorer.extract_classification_codes(
            "CATMAT: 6515 curativo BR 0439626 CÓDIGO 651510 e também 6510",
        );
        assert!(codes.contains(&"6515".to_string()));
        assert!(codes.contains(&"0439626".to_string()));
        assert!(codes.contains(&"651510".to_string()));
        assert!(codes.contains(&"6510".to_string()));
    }

    #[test]
    fn target_code_detection_uses_prefixes() {
        let scorer = scorer();
        assert!(scorer.is_target_code("6515"));
        assert!(scorer.is_target_code("651510"));
        assert!(!scorer.is_target_code("7610"));
    }

    #[test]
    fn sampled_item_analysis_scales_with_signal() {
        let scorer = scorer();

        let strong = vec![
            item("Curativo transparente estéril CATMAT 651510"),
            item("Seringa descartável 10ml"),
        ];
        // 2 (code) + 1 (keyword) + 0 + 1 = 4 of 4 checks
        assert_eq!(scorer.analyze_sampled_items(&strong), 100);

        let none = vec![item("Cadeira de escritório giratória")];
        assert_eq!(scorer.analyze_sampled_items(&none), 0);

        assert_eq!(scorer.analyze_sampled_items(&[]), 0);
    }
}
