//! Fact-based grading prompters
//!
//! Both prompters number the facts and ask for one verdict line per fact:
//!
//! ```text
//! 1: OK
//! 2: MISSING
//! HALLU: the answer claims the office opens on Sundays
//! ```
//!
//! Facts without a verdict line count as missing. `HALLU` lines are only
//! meaningful for answer grading.

use super::{numbered, ChunkEvalPrompter, EvalPrompter, PromptError};
use regex::Regex;
use sdk::model::{Answer, Chunks, Facts, Prompt, QA};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Parsed answer grading
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub ok: Vec<String>,
    pub missing: Vec<String>,
    pub hallu: Vec<String>,
    /// `nb_ok / (nb_facts + nb_hallu)`
    pub auto: f64,
}

/// Parsed chunk grading
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEvalOutcome {
    /// Facts the chunks support
    pub found: Vec<String>,
    /// Facts absent from the chunks
    pub not_found: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Ok,
    Missing,
}

struct Verdicts {
    by_fact: BTreeMap<usize, Verdict>,
    hallu: Vec<String>,
}

fn verdict_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\W*(?:fact\s*)?(\d+)\s*[:.)\-]\s*\W*(ok|missing|found|not\s+found)\b")
            .expect("Invalid verdict pattern")
    })
}

fn hallu_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\W*hallu\w*\s*:\s*(.+)$")
            .expect("Invalid hallucination pattern")
    })
}

/// Collect verdict and hallucination lines; unknown lines are ignored
fn parse_verdicts(reply: &str, nb_facts: usize) -> Result<Verdicts, PromptError> {
    let mut by_fact = BTreeMap::new();
    let mut hallu = Vec::new();

    for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = verdict_line().captures(line) {
            let index: usize = caps[1].parse().unwrap_or(0);
            if index == 0 || index > nb_facts {
                tracing::warn!("Ignoring verdict for unknown fact {}", &caps[1]);
                continue;
            }
            let verdict = match caps[2].to_ascii_lowercase().as_str() {
                "ok" | "found" => Verdict::Ok,
                _ => Verdict::Missing,
            };
            by_fact.insert(index, verdict);
        } else if let Some(caps) = hallu_line().captures(line) {
            let text = caps[1].trim();
            if !text.eq_ignore_ascii_case("none") {
                hallu.push(text.to_string());
            }
        }
    }

    if by_fact.is_empty() && hallu.is_empty() {
        let excerpt: String = reply.chars().take(80).collect();
        return Err(PromptError::Unparseable(excerpt));
    }
    Ok(Verdicts { by_fact, hallu })
}

/// Split facts into (ok, missing); facts without a verdict are missing
fn split_facts(facts: &Facts, verdicts: &Verdicts) -> (Vec<String>, Vec<String>) {
    let mut ok = Vec::new();
    let mut missing = Vec::new();
    for (i, fact) in facts.iter().enumerate() {
        match verdicts.by_fact.get(&(i + 1)) {
            Some(Verdict::Ok) => ok.push(fact.text.clone()),
            _ => missing.push(fact.text.clone()),
        }
    }
    (ok, missing)
}

const EVAL_SYSTEM: &str = "You grade an answer against a numbered list of facts.
For each fact, write one line `<number>: OK` if the answer states it, or `<number>: MISSING` if it does not.
Then write one line `HALLU: <statement>` for each statement in the answer that contradicts the facts or is unsupported by them.
Write nothing else.";

const CHUNK_EVAL_SYSTEM: &str = "You check whether numbered facts are supported by numbered source passages.
For each fact, write one line `<number>: OK` if some passage supports it, or `<number>: MISSING` if none does.
Write nothing else.";

/// Grades an answer fact by fact
#[derive(Debug, Default, Clone)]
pub struct FactEvalPrompter;

impl EvalPrompter for FactEvalPrompter {
    fn eval_prompt(&self, qa: &QA, answer: &Answer) -> Prompt {
        let facts = numbered(qa.facts.iter().map(|f| f.text.as_str()));
        Prompt::new(
            EVAL_SYSTEM,
            format!(
                "Question: {}\n\nFacts:\n{}\n\nAnswer:\n{}",
                qa.question.text, facts, answer.text
            ),
        )
    }

    fn parse_eval(&self, facts: &Facts, reply: &str) -> Result<EvalOutcome, PromptError> {
        if facts.is_empty() {
            return Err(PromptError::NothingToGrade("no facts".to_string()));
        }
        let verdicts = parse_verdicts(reply, facts.len())?;
        let (ok, missing) = split_facts(facts, &verdicts);
        let hallu = verdicts.hallu;
        let auto = ok.len() as f64 / (facts.len() + hallu.len()) as f64;
        Ok(EvalOutcome {
            ok,
            missing,
            hallu,
            auto,
        })
    }
}

/// Checks which facts the retrieved chunks support
#[derive(Debug, Default, Clone)]
pub struct FactChunkPrompter;

impl ChunkEvalPrompter for FactChunkPrompter {
    fn chunk_eval_prompt(&self, facts: &Facts, chunks: &Chunks) -> Prompt {
        let facts = numbered(facts.iter().map(|f| f.text.as_str()));
        let passages = numbered(chunks.iter().map(|c| c.text.as_str()));
        Prompt::new(
            CHUNK_EVAL_SYSTEM,
            format!("Facts:\n{}\n\nPassages:\n{}", facts, passages),
        )
    }

    fn parse_chunk_eval(
        &self,
        facts: &Facts,
        reply: &str,
    ) -> Result<ChunkEvalOutcome, PromptError> {
        if facts.is_empty() {
            return Err(PromptError::NothingToGrade("no facts".to_string()));
        }
        let verdicts = parse_verdicts(reply, facts.len())?;
        let (found, not_found) = split_facts(facts, &verdicts);
        Ok(ChunkEvalOutcome { found, not_found })
    }
}
