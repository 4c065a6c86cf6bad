//! Statistics over experiment and validation-set items
//!
//! Works on raw JSON items rather than typed [`sdk::model::QA`]s so listings
//! can summarise documents that would not fully deserialize. Missing
//! collections count as empty.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub questions: usize,
    pub facts: usize,
    pub chunks: usize,
    pub answers: usize,

    /// Answers with a non-null human score
    pub human_eval: usize,

    /// Answers with a non-null automatic score
    pub auto_eval: usize,

    /// Size of the first item's answer collection
    pub models: usize,

    /// Distinct answer model names across all items
    pub distinct_models: usize,

    /// False when items carry different numbers of answers, in which case
    /// `models` is not meaningful
    pub uniform_models: bool,
}

/// `items` of an `{"items": [...]}` collection field
fn collection<'a>(item: &'a Value, field: &str) -> &'a [Value] {
    item.get(field)
        .and_then(|c| c.get("items"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn has_score(answer: &Value, kind: &str) -> bool {
    answer
        .get("eval")
        .and_then(|e| e.get(kind))
        .is_some_and(|v| !v.is_null())
}

pub fn stats(items: &[Value]) -> Stats {
    let mut stats = Stats {
        questions: items.len(),
        uniform_models: true,
        ..Default::default()
    };
    let mut names: Vec<&str> = Vec::new();

    for item in items {
        stats.facts += collection(item, "facts").len();
        stats.chunks += collection(item, "chunks").len();

        let answers = collection(item, "answers");
        stats.answers += answers.len();
        for answer in answers {
            stats.human_eval += usize::from(has_score(answer, "human"));
            stats.auto_eval += usize::from(has_score(answer, "auto"));
            let name = answer
                .get("llm_answer")
                .and_then(|l| l.get("name"))
                .and_then(Value::as_str);
            if let Some(name) = name {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }

    stats.models = items.first().map_or(0, |i| collection(i, "answers").len());
    stats.distinct_models = names.len();
    stats.uniform_models = items
        .iter()
        .all(|i| collection(i, "answers").len() == stats.models);
    if !stats.uniform_models {
        tracing::warn!(
            "Items carry different numbers of answers; 'models' reflects the first item only ({} distinct models)",
            stats.distinct_models
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_items_are_all_zero() {
        let s = stats(&[]);
        assert_eq!(s.questions, 0);
        assert_eq!(s.facts + s.chunks + s.answers + s.models, 0);
        assert_eq!(s.human_eval + s.auto_eval + s.distinct_models, 0);
        assert!(s.uniform_models);
    }

    #[test]
    fn test_counts_across_items() {
        let items = vec![
            json!({
                "question": {"text": "Q1"},
                "facts": {"items": [{"text": "F1"}, {"text": "F2"}]},
                "chunks": {"items": [{"text": "C1"}]},
                "answers": {"items": [
                    {"llm_answer": {"name": "a"}, "eval": {"human": 0.0, "auto": 0.5}},
                    {"llm_answer": {"name": "b"}, "eval": {"human": null, "auto": 1.0}}
                ]}
            }),
            json!({
                "question": {"text": "Q2"},
                "answers": {"items": [
                    {"llm_answer": {"name": "a"}},
                    {"llm_answer": {"name": "b"}, "eval": {}}
                ]}
            }),
        ];

        let s = stats(&items);
        assert_eq!(s.questions, 2);
        assert_eq!(s.facts, 2);
        assert_eq!(s.chunks, 1);
        assert_eq!(s.answers, 4);
        assert_eq!(s.human_eval, 1);
        assert_eq!(s.auto_eval, 2);
        assert_eq!(s.models, 2);
        assert_eq!(s.distinct_models, 2);
        assert!(s.uniform_models);
    }

    #[test]
    fn test_models_uses_first_item_and_flags_non_uniform_sets() {
        let items = vec![
            json!({"answers": {"items": [{"llm_answer": {"name": "a"}}]}}),
            json!({"answers": {"items": [{"llm_answer": {"name": "a"}}, {"llm_answer": {"name": "b"}}]}}),
        ];
        let s = stats(&items);
        assert_eq!(s.models, 1);
        assert_eq!(s.distinct_models, 2);
        assert!(!s.uniform_models);
    }

    #[test]
    fn test_malformed_collections_count_as_empty() {
        let items = vec![json!({"facts": "oops", "chunks": {"items": null}, "answers": []})];
        let s = stats(&items);
        assert_eq!((s.facts, s.chunks, s.answers), (0, 0, 0));
    }
}
