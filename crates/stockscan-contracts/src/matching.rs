use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attributes::{extract_json_value, AttributeRecord};
use crate::inventory::InventoryItem;

pub const NOT_FOUND: &str = "Artículo no encontrado";
pub const INVENTORY_EMPTY: &str = "Inventario vacío";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { name: String, score: usize },
    NotFound,
    InventoryEmpty,
}

impl MatchOutcome {
    /// The name shown to the user: the matched candidate or one of the sentinels.
    pub fn label(&self) -> &str {
        match self {
            Self::Matched { name, .. } => name,
            Self::NotFound => NOT_FOUND,
            Self::InventoryEmpty => INVENTORY_EMPTY,
        }
    }
}

/// Number of whitespace tokens of `candidate` that occur as substrings of `blob`.
///
/// `blob` is expected lower-cased already; the candidate is lower-cased here.
pub fn overlap_score(blob: &str, candidate: &str) -> usize {
    candidate
        .to_lowercase()
        .split_whitespace()
        .filter(|token| blob.contains(token))
        .count()
}

/// Lexical-overlap ranking of `candidates` against the attribute text of `record`.
///
/// Ties keep the earliest candidate; a best score of zero is reported as not found.
pub fn match_attributes<S: AsRef<str>>(record: &AttributeRecord, candidates: &[S]) -> MatchOutcome {
    if candidates.is_empty() {
        return MatchOutcome::InventoryEmpty;
    }
    let blob = record.text_blob();
    let mut best: Option<(&str, usize)> = None;
    for candidate in candidates {
        let name = candidate.as_ref();
        let score = overlap_score(&blob, name);
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((name, score));
        }
    }
    match best {
        Some((name, score)) if score > 0 => MatchOutcome::Matched {
            name: name.to_string(),
            score,
        },
        _ => MatchOutcome::NotFound,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Local,
    Remote,
}

/// Outcome of one identification, shown to the user and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub best_match: String,
    pub source: MatchSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<AttributeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default)]
    pub ambiguous: bool,
}

impl MatchResult {
    pub fn local(outcome: &MatchOutcome, attributes: Option<AttributeRecord>) -> Self {
        Self {
            best_match: outcome.label().to_string(),
            source: MatchSource::Local,
            reasoning: None,
            attributes,
            item_id: None,
            ambiguous: false,
        }
    }

    pub fn remote(verdict: RemoteVerdict, attributes: Option<AttributeRecord>) -> Self {
        Self {
            best_match: verdict.best_match,
            source: MatchSource::Remote,
            reasoning: verdict.reasoning,
            attributes,
            item_id: None,
            ambiguous: false,
        }
    }

    pub fn is_match(&self) -> bool {
        self.best_match != NOT_FOUND && self.best_match != INVENTORY_EMPTY
    }

    /// Links the matched name back to a stored item.
    ///
    /// Matching works on display names, so the first item carrying the name wins and
    /// `ambiguous` records whether other items share it.
    pub fn resolve_item(mut self, items: &[InventoryItem]) -> Self {
        let mut same_name = items.iter().filter(|item| item.name == self.best_match);
        self.item_id = same_name.next().map(|item| item.id.clone());
        self.ambiguous = self.item_id.is_some() && same_name.next().is_some();
        self
    }
}

/// Decoded answer of the remote ranking prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVerdict {
    pub best_match: String,
    pub reasoning: Option<String>,
}

/// Accepts a remote ranking answer only when it names a candidate or the not-found sentinel.
///
/// Candidate names are compared after trimming and case folding; the canonical spelling
/// from `candidates` is returned.
pub fn parse_remote_verdict<S: AsRef<str>>(raw: &str, candidates: &[S]) -> Option<RemoteVerdict> {
    let value = extract_json_value(raw)?;
    let object = value.as_object()?;
    let answer = object
        .get("best_match")
        .or_else(|| object.get("match"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();
    let reasoning = object
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let folded = answer.to_lowercase();
    if folded == NOT_FOUND.to_lowercase() || folded == "not found" {
        return Some(RemoteVerdict {
            best_match: NOT_FOUND.to_string(),
            reasoning,
        });
    }
    let canonical = candidates
        .iter()
        .map(AsRef::as_ref)
        .find(|name| name.trim().to_lowercase() == folded)?;
    Some(RemoteVerdict {
        best_match: canonical.to_string(),
        reasoning,
    })
}

#[cfg(test)]
mod tests {
    use crate::attributes::AttributeRecord;
    use crate::inventory::NewInventoryItem;

    use super::{
        match_attributes, overlap_score, parse_remote_verdict, MatchOutcome, MatchResult,
        MatchSource, INVENTORY_EMPTY, NOT_FOUND,
    };

    fn mug() -> AttributeRecord {
        AttributeRecord {
            main_object: "taza".to_string(),
            main_color: "blanco".to_string(),
            secondary_colors: Vec::new(),
            shape: "cilíndrica".to_string(),
            material: "cerámica".to_string(),
            features: vec!["tiene un asa".to_string()],
        }
    }

    #[test]
    fn scores_token_overlap_against_attribute_text() {
        let blob = mug().text_blob();
        assert_eq!(overlap_score(&blob, "Taza de cerámica blanca con asa"), 3);
        assert_eq!(overlap_score(&blob, "Teclado negro"), 0);

        let outcome = match_attributes(
            &mug(),
            &["Teclado negro", "Taza de cerámica blanca con asa", "Plato"],
        );
        assert_eq!(
            outcome,
            MatchOutcome::Matched {
                name: "Taza de cerámica blanca con asa".to_string(),
                score: 3,
            }
        );
    }

    #[test]
    fn empty_inventory_returns_its_own_sentinel() {
        let empty: [&str; 0] = [];
        let outcome = match_attributes(&mug(), &empty);
        assert_eq!(outcome, MatchOutcome::InventoryEmpty);
        assert_eq!(outcome.label(), INVENTORY_EMPTY);
        assert_ne!(outcome.label(), NOT_FOUND);
    }

    #[test]
    fn zero_overlap_is_not_found() {
        let outcome = match_attributes(&mug(), &["Silla", "Laptop"]);
        assert_eq!(outcome, MatchOutcome::NotFound);
        assert_eq!(outcome.label(), NOT_FOUND);

        let blank = match_attributes(&AttributeRecord::default(), &["Taza"]);
        assert_eq!(blank, MatchOutcome::NotFound);
    }

    #[test]
    fn ties_keep_the_earliest_candidate() {
        let record = AttributeRecord {
            main_object: "taza".to_string(),
            main_color: "blanca".to_string(),
            ..AttributeRecord::default()
        };
        assert_eq!(match_attributes(&record, &["Taza", "Plato"]).label(), "Taza");
        assert_eq!(match_attributes(&record, &["Vaso", "Taza"]).label(), "Taza");
        assert_eq!(
            match_attributes(&record, &["Taza roja", "Taza azul"]).label(),
            "Taza roja"
        );
    }

    #[test]
    fn result_is_always_a_candidate_or_sentinel_and_deterministic() {
        let candidates = ["Botella de Agua", "Caja de Tornillos", "Lata de Pintura"];
        let records = [
            mug(),
            AttributeRecord::default(),
            AttributeRecord {
                main_object: "lata".to_string(),
                material: "metal".to_string(),
                ..AttributeRecord::default()
            },
        ];
        for record in &records {
            let first = match_attributes(record, &candidates);
            let label = first.label().to_string();
            assert!(candidates.contains(&label.as_str()) || label == NOT_FOUND);
            assert_eq!(match_attributes(record, &candidates), first);
        }
    }

    #[test]
    fn substring_containment_counts_partial_words() {
        let record = AttributeRecord {
            features: vec!["destornilladores".to_string()],
            ..AttributeRecord::default()
        };
        assert_eq!(match_attributes(&record, &["Destornillador"]).label(), "Destornillador");
    }

    #[test]
    fn resolve_item_links_by_name_and_flags_duplicates() {
        let items = vec![
            NewInventoryItem::named("Taza").into_item("a"),
            NewInventoryItem::named("Plato").into_item("b"),
            NewInventoryItem::named("Taza").into_item("c"),
        ];
        let outcome = MatchOutcome::Matched {
            name: "Taza".to_string(),
            score: 1,
        };
        let resolved = MatchResult::local(&outcome, None).resolve_item(&items);
        assert_eq!(resolved.item_id.as_deref(), Some("a"));
        assert!(resolved.ambiguous);
        assert_eq!(resolved.source, MatchSource::Local);

        let plate = MatchResult::local(
            &MatchOutcome::Matched {
                name: "Plato".to_string(),
                score: 1,
            },
            None,
        )
        .resolve_item(&items);
        assert_eq!(plate.item_id.as_deref(), Some("b"));
        assert!(!plate.ambiguous);

        let missing = MatchResult::local(&MatchOutcome::NotFound, None).resolve_item(&items);
        assert!(missing.item_id.is_none());
        assert!(!missing.is_match());
    }

    #[test]
    fn remote_verdict_must_name_a_candidate() {
        let candidates = ["Laptop", "Taza", "Silla"];
        let verdict = parse_remote_verdict(
            "```json\n{\"best_match\": \" taza \", \"reasoning\": \"asa visible\"}\n```",
            &candidates,
        );
        let verdict = verdict.expect("verdict");
        assert_eq!(verdict.best_match, "Taza");
        assert_eq!(verdict.reasoning.as_deref(), Some("asa visible"));

        let not_found = parse_remote_verdict(r#"{"best_match": "Artículo no encontrado"}"#, &candidates)
            .expect("sentinel verdict");
        assert_eq!(not_found.best_match, NOT_FOUND);
        assert!(not_found.reasoning.is_none());

        assert!(parse_remote_verdict(r#"{"best_match": "Mesa"}"#, &candidates).is_none());
        assert!(parse_remote_verdict("Taza", &candidates).is_none());
        assert!(parse_remote_verdict(r#"{"error": "boom"}"#, &candidates).is_none());
    }
}
