//! Filler normalization for lex fields.
//!
//! A lex field has excess filler when a filler term occurs in it more often
//! than in the record's query. The first `query_count` occurrences are kept
//! and the rest removed. Matching is case-insensitive and whole-word.
//!
//! Stateless and single-pass: no service calls, no checkpoint.

use crate::dataset::{load_records, write_records};
use crate::models::{NormalizeStats, Record, RepairError, Result, LEX};
use regex::Regex;
use std::path::Path;
use tracing::{debug, info};

/// Before/after text of one cleaned lex field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedSample {
    pub query: String,
    pub before: String,
    pub after: String,
}

/// Result of normalizing a full record set.
#[derive(Debug, Clone)]
pub struct NormalizeOutcome {
    pub records: Vec<Record>,
    pub stats: NormalizeStats,
    pub samples: Vec<CleanedSample>,
}

struct FillerTerm {
    term: String,
    pattern: Regex,
}

/// Removes excess filler terms from lex fields.
pub struct FillerNormalizer {
    terms: Vec<FillerTerm>,
}

impl FillerNormalizer {
    /// Compile the ordered filler list.
    pub fn new(fillers: &[String]) -> Result<Self> {
        let terms = fillers
            .iter()
            .map(|term| {
                if term.trim().is_empty() {
                    return Err(RepairError::InvalidInput("empty filler term".to_string()));
                }
                let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term)))
                    .map_err(|e| RepairError::InvalidInput(format!("filler {term:?}: {e}")))?;
                Ok(FillerTerm {
                    term: term.clone(),
                    pattern,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { terms })
    }

    /// Whether any filler term occurs more often in `text` than in `query`.
    pub fn has_excess(&self, text: &str, query: &str) -> bool {
        self.terms
            .iter()
            .any(|t| t.pattern.find_iter(text).count() > t.pattern.find_iter(query).count())
    }

    /// Cleaned form of `text`. Returned unchanged when nothing is in excess.
    pub fn clean(&self, text: &str, query: &str) -> String {
        let mut current = text.to_string();

        for t in &self.terms {
            let allowed = t.pattern.find_iter(query).count();
            // Removal can join words into a new phrase match; repeat until settled.
            while t.pattern.find_iter(&current).count() > allowed {
                let mut kept = String::with_capacity(current.len());
                let mut last = 0;
                for m in t.pattern.find_iter(&current).skip(allowed) {
                    kept.push_str(&current[last..m.start()]);
                    last = m.end();
                }
                kept.push_str(&current[last..]);
                debug!(term = %t.term, allowed, "Removed excess filler");
                current = collapse_whitespace(&kept);
            }
        }

        current
    }

    /// Clean every lex field of `record` in place, returning one sample per changed field.
    pub fn normalize_record(&self, record: &mut Record) -> Vec<CleanedSample> {
        let mut cleaned = Vec::new();
        for field in record.output.iter_mut().filter(|f| f.is(LEX)) {
            let after = self.clean(&field.text, &record.query);
            if after == field.text {
                continue;
            }
            let before = std::mem::replace(&mut field.text, after);
            cleaned.push(CleanedSample {
                query: record.query.clone(),
                before,
                after: field.text.clone(),
            });
        }
        cleaned
    }

    /// Normalize a full record set, keeping up to `sample_limit` samples.
    pub fn normalize_all(&self, mut records: Vec<Record>, sample_limit: usize) -> NormalizeOutcome {
        let mut stats = NormalizeStats {
            total_records: records.len(),
            ..Default::default()
        };
        let mut samples = Vec::new();

        for record in &mut records {
            let cleaned = self.normalize_record(record);
            if cleaned.is_empty() {
                continue;
            }
            stats.records_modified += 1;
            stats.fields_cleaned += cleaned.len();
            let room = sample_limit.saturating_sub(samples.len());
            samples.extend(cleaned.into_iter().take(room));
        }

        NormalizeOutcome {
            records,
            stats,
            samples,
        }
    }

    /// Load `input`, normalize it, and write `output`.
    pub fn run(&self, input: &Path, output: &Path, sample_limit: usize) -> Result<NormalizeStats> {
        let records = load_records(input)?;
        let outcome = self.normalize_all(records, sample_limit);

        for sample in &outcome.samples {
            info!(
                query = %sample.query,
                before = %sample.before,
                after = %sample.after,
                "Cleaned lex"
            );
        }

        write_records(output, &outcome.records)?;
        info!(
            modified = outcome.stats.records_modified,
            fields = outcome.stats.fields_cleaned,
            path = %output.display(),
            "Lex normalization written"
        );
        Ok(outcome.stats)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{default_fillers, Field, HYDE};
    use tempfile::TempDir;

    fn normalizer() -> FillerNormalizer {
        FillerNormalizer::new(&default_fillers()).unwrap()
    }

    #[test]
    fn test_repeated_query_term_and_extra_filler() {
        let n = normalizer();
        assert_eq!(
            n.clean("kubernetes tutorial tutorial guide", "kubernetes tutorial"),
            "kubernetes tutorial"
        );
    }

    #[test]
    fn test_phrase_filler_keeps_first_occurrence() {
        let n = normalizer();
        assert_eq!(
            n.clean("best practices for caching best practices", "best practices for caching"),
            "best practices for caching"
        );
    }

    #[test]
    fn test_filler_in_query_is_kept() {
        let n = normalizer();
        assert_eq!(n.clean("docker overview guide", "docker overview"), "docker overview");
    }

    #[test]
    fn test_clean_is_idempotent() {
        let n = normalizer();
        let cases = [
            ("kubernetes tutorial tutorial guide", "kubernetes tutorial"),
            ("best guide practices examples", "caching"),
            ("Guide to   rust GUIDE documentation", "rust"),
        ];
        for (text, query) in cases {
            let once = n.clean(text, query);
            assert_eq!(n.clean(&once, query), once);
            assert!(!n.has_excess(&once, query));
        }
    }

    #[test]
    fn test_removal_that_forms_new_phrase_is_settled() {
        let n = normalizer();
        assert_eq!(n.clean("best guide practices", "x"), "");
    }

    #[test]
    fn test_case_insensitive() {
        let n = normalizer();
        assert_eq!(n.clean("React OVERVIEW Overview", "react overview"), "React OVERVIEW");
    }

    #[test]
    fn test_whole_word_only() {
        let n = normalizer();
        assert!(!n.has_excess("style guidelines tutorials", "style"));
        assert_eq!(n.clean("style guidelines tutorials", "style"), "style guidelines tutorials");
    }

    #[test]
    fn test_untouched_field_keeps_whitespace() {
        let n = normalizer();
        assert_eq!(n.clean("  rust   ownership ", "rust"), "  rust   ownership ");
    }

    #[test]
    fn test_normalize_record_only_touches_lex() {
        let n = normalizer();
        let mut record = Record::new(
            "rust",
            vec![
                Field::new(LEX, "rust guide"),
                Field::new(HYDE, "a guide to rust"),
                Field::new(LEX, "rust ownership"),
            ],
        );

        let cleaned = n.normalize_record(&mut record);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].before, "rust guide");
        assert_eq!(record.output[0].text, "rust");
        assert_eq!(record.output[1].text, "a guide to rust");
        assert_eq!(record.output[2].text, "rust ownership");
    }

    #[test]
    fn test_normalize_all_counts_and_samples() {
        let n = normalizer();
        let records = vec![
            Record::new(
                "docker overview",
                vec![Field::new(LEX, "docker overview guide"), Field::new(LEX, "docker tutorial")],
            ),
            Record::new("rust", vec![Field::new(LEX, "rust borrow checker")]),
            Record::new("go", vec![Field::new(LEX, "go examples")]),
        ];

        let outcome = n.normalize_all(records, 2);
        assert_eq!(
            outcome.stats,
            NormalizeStats {
                total_records: 3,
                records_modified: 2,
                fields_cleaned: 3,
            }
        );
        assert_eq!(outcome.samples.len(), 2);
        assert_eq!(outcome.samples[0].after, "docker overview");
        assert_eq!(outcome.records[2].output[0].text, "go");
    }

    #[test]
    fn test_empty_filler_list_changes_nothing() {
        let n = FillerNormalizer::new(&[]).unwrap();
        assert_eq!(n.clean("guide guide", "x"), "guide guide");
    }

    #[test]
    fn test_blank_filler_rejected() {
        let err = FillerNormalizer::new(&["guide".to_string(), " ".to_string()]);
        assert!(matches!(err, Err(RepairError::InvalidInput(_))));
    }

    #[test]
    fn test_run_writes_output() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in.jsonl");
        let output = temp_dir.path().join("out.jsonl");
        std::fs::write(
            &input,
            concat!(
                r#"{"query":"kubernetes tutorial","output":[["lex","kubernetes tutorial tutorial guide"]],"source":"v2"}"#,
                "\n\n",
                r#"{"query":"rust","output":[["hyde","rust guide"]]}"#,
                "\n"
            ),
        )
        .unwrap();

        let stats = normalizer().run(&input, &output, 15).unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.records_modified, 1);

        let written = load_records(&output).unwrap();
        assert_eq!(written[0].field(LEX), Some("kubernetes tutorial"));
        assert_eq!(written[0].extra["source"], "v2");
        assert_eq!(written[1].field(HYDE), Some("rust guide"));
    }
}
