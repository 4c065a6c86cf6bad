//! Experiment record model
//!
//! The nested entity graph every pipeline stage reads and mutates:
//! `Experiment -> QA -> {Question, Facts, Chunks, Answers -> {LLMAnswer, Eval}}`.
//!
//! The serialized layout is the persisted experiment document:
//!
//! ```json
//! {"meta": {"validation_set": "V1", "retriever_name": "No retriever"},
//!  "items": [{"question": {"text": "Q1", "meta": {}},
//!             "facts": {"items": [{"text": "F1", "meta": {}}]},
//!             "chunks": {"items": []},
//!             "answers": {"items": [{"text": "...", "llm_answer": {...}, "eval": {...}}]}}]}
//! ```
//!
//! Every collection and metadata field tolerates being absent on input, so
//! documents produced by other tools (or by hand) load without ceremony.
//! Timestamps are naive ISO-8601 strings.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::{Deref, DerefMut};

/// Free-form metadata mapping
pub type Meta = serde_json::Map<String, Value>;

/// Keys every evaluated answer carries in `eval.meta`
pub const EVAL_COUNTERS: [(&str, CounterKind); 6] = [
    ("missing", CounterKind::List),
    ("nb_missing", CounterKind::Count),
    ("ok", CounterKind::List),
    ("nb_ok", CounterKind::Count),
    ("hallu", CounterKind::List),
    ("nb_hallu", CounterKind::Count),
];

/// Shape of an eval counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    List,
    Count,
}

impl CounterKind {
    fn empty(self) -> Value {
        match self {
            CounterKind::List => Value::Array(Vec::new()),
            CounterKind::Count => Value::from(0),
        }
    }
}

/// An `{"items": [...]}` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Items<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> Items<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T> Default for Items<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Deref for Items<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl<T> DerefMut for Items<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.items
    }
}

impl<T> From<Vec<T>> for Items<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}

pub type Facts = Items<Fact>;
pub type Chunks = Items<Chunk>;
pub type Answers = Items<Answer>;

/// Question text plus routing hints (e.g. `folder_id` for retrieval)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub meta: Meta,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            meta: Meta::new(),
        }
    }
}

/// Atomic expected-truth statement an answer is graded against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub meta: Meta,

    /// Set when the fact was extracted by an LLM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_answer: Option<LLMAnswer>,
}

impl Fact {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Retrieved passage with relevance metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub meta: Meta,
}

impl Chunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            meta: Meta::new(),
        }
    }
}

/// The exact text sent to an LLM
///
/// Fields are read-only once built so the stored prompt always matches what
/// was sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(default)]
    system: String,

    #[serde(default)]
    user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

/// One LLM call as persisted with its answer, fact or eval
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LLMAnswer {
    /// Model identifier used to resolve the provider
    #[serde(default)]
    pub name: String,

    /// Display name reported by the provider
    #[serde(default)]
    pub full_name: String,

    #[serde(default)]
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Prompt>,

    #[serde(default)]
    pub meta: Meta,

    /// Start of the successful attempt
    #[serde(default, with = "iso_timestamp")]
    pub timestamp: Option<NaiveDateTime>,

    /// Wall-clock seconds of the successful attempt
    #[serde(default)]
    pub duration: f64,

    /// Chunks retrieved by the model itself (built-in retrievers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Chunks>,
}

/// Grading outcome of an answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Eval {
    #[serde(default)]
    pub human: Option<f64>,

    #[serde(default)]
    pub auto: Option<f64>,

    #[serde(default)]
    pub meta: Meta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_answer: Option<LLMAnswer>,
}

impl Eval {
    /// Insert the six grading counters that are absent, leaving present ones alone
    pub fn init_counters(&mut self) {
        for (key, kind) in EVAL_COUNTERS {
            self.meta.entry(key).or_insert_with(|| kind.empty());
        }
    }

    /// True when all six grading counters are present
    pub fn has_counters(&self) -> bool {
        EVAL_COUNTERS
            .iter()
            .all(|(key, _)| self.meta.contains_key(*key))
    }

    /// Strings stored under a list counter such as `"missing"`
    pub fn list(&self, key: &str) -> Vec<String> {
        self.meta
            .get(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One model's response to a QA
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub meta: Meta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_answer: Option<LLMAnswer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval: Option<Eval>,
}

impl Answer {
    /// Build an answer from a completed LLM call
    pub fn from_llm(llm_answer: LLMAnswer) -> Self {
        Self {
            text: llm_answer.text.clone(),
            meta: Meta::new(),
            llm_answer: Some(llm_answer),
            eval: None,
        }
    }

    /// Name of the model that produced this answer, if any
    pub fn llm_name(&self) -> Option<&str> {
        self.llm_answer.as_ref().map(|a| a.name.as_str())
    }

    /// The eval, created empty when absent
    pub fn eval_mut(&mut self) -> &mut Eval {
        self.eval.get_or_insert_with(Eval::default)
    }

    /// Chunks the model retrieved itself, when it did
    pub fn own_chunks(&self) -> Option<&Chunks> {
        self.llm_answer
            .as_ref()
            .and_then(|a| a.chunks.as_ref())
            .filter(|c| !c.is_empty())
    }
}

/// One evaluation unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QA {
    #[serde(default)]
    pub question: Question,

    #[serde(default)]
    pub facts: Facts,

    #[serde(default)]
    pub chunks: Chunks,

    #[serde(default)]
    pub answers: Answers,

    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

impl QA {
    pub fn new(question: Question) -> Self {
        Self {
            question,
            ..Default::default()
        }
    }

    /// Index of the answer produced by `llm_name`
    pub fn answer_index(&self, llm_name: &str) -> Option<usize> {
        self.answers
            .iter()
            .position(|a| a.llm_name() == Some(llm_name))
    }

    pub fn has_answer_from(&self, llm_name: &str) -> bool {
        self.answer_index(llm_name).is_some()
    }
}

/// Experiment-level metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_set: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retriever_name: Option<String>,

    #[serde(flatten)]
    pub extra: Meta,
}

/// Top-level container: ordered QAs plus metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(default)]
    pub meta: ExperimentMeta,

    #[serde(default)]
    pub items: Vec<QA>,
}

impl Experiment {
    pub fn new(items: Vec<QA>) -> Self {
        Self {
            meta: ExperimentMeta::default(),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Make sure every answer has an eval carrying the six grading counters
    pub fn init_eval_counters(&mut self) {
        for qa in &mut self.items {
            for answer in qa.answers.iter_mut() {
                answer.eval_mut().init_counters();
            }
        }
    }

    /// Distinct answer model names in first-seen order
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for qa in &self.items {
            for answer in qa.answers.iter() {
                if let Some(name) = answer.llm_name() {
                    if !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names
    }
}

/// Naive ISO-8601 timestamps
///
/// Writes `YYYY-MM-DDTHH:MM:SS.ffffff`. Reads that form with or without a
/// fractional part, a space separator, an RFC 3339 offset (converted to UTC),
/// and the HTTP date form `Tue, 15 Nov 1994 08:12:31 GMT` that JSON encoders
/// of web frameworks emit.
pub mod iso_timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, SubsecRound};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    /// Fractional digits kept by [`FORMAT`]
    pub const PRECISION: u16 = 6;

    /// Current local time, truncated to what [`FORMAT`] writes
    pub fn now() -> NaiveDateTime {
        Local::now().naive_local().trunc_subsecs(PRECISION)
    }

    const INPUT_FORMATS: [&str; 3] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%a, %d %b %Y %H:%M:%S GMT",
    ];

    /// Parse any accepted timestamp form
    pub fn parse(s: &str) -> Option<NaiveDateTime> {
        let s = s.trim();
        INPUT_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.naive_utc())
            })
    }

    pub fn format(ts: &NaiveDateTime) -> String {
        ts.format(FORMAT).to_string()
    }

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&format(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", s))),
        }
    }
}
