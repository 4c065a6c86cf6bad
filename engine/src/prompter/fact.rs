//! Fact extraction prompter

use super::FactPrompter;
use regex::Regex;
use sdk::model::{Answer, Fact, Prompt, Question};
use std::sync::OnceLock;

const FACT_SYSTEM: &str = "You extract the key facts from a reference answer.
Write one short, self-contained fact per line, each starting with `- `.
Keep only facts that answer the question. Write nothing else.";

fn list_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*•]|\d+\s*[.)])\s+(.+)$").expect("Invalid list marker pattern")
    })
}

/// One fact per bullet or numbered line of the reply
#[derive(Debug, Default, Clone)]
pub struct FactExtractionPrompter;

impl FactPrompter for FactExtractionPrompter {
    fn fact_prompt(&self, question: &Question, reference: &Answer) -> Prompt {
        Prompt::new(
            FACT_SYSTEM,
            format!(
                "Question: {}\n\nReference answer:\n{}",
                question.text, reference.text
            ),
        )
    }

    /// Bullet and numbered lines become facts; a reply without any list
    /// markers yields one fact per non-empty line
    fn parse_facts(&self, reply: &str) -> Vec<Fact> {
        let listed: Vec<Fact> = reply
            .lines()
            .filter_map(|line| list_marker().captures(line))
            .map(|caps| Fact::new(caps[1].trim()))
            .collect();
        if !listed.is_empty() {
            return listed;
        }

        reply
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(Fact::new)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(facts: Vec<Fact>) -> Vec<String> {
        facts.into_iter().map(|f| f.text).collect()
    }

    #[test]
    fn test_bullets_and_numbers() {
        let reply = "Here are the facts:\n- The fee is 10 euros\n2. Payment is online\n* Refunds take a week\n";
        assert_eq!(
            texts(FactExtractionPrompter.parse_facts(reply)),
            vec!["The fee is 10 euros", "Payment is online", "Refunds take a week"]
        );
    }

    #[test]
    fn test_plain_lines_without_markers() {
        let reply = "The fee is 10 euros\n\nPayment is online";
        assert_eq!(
            texts(FactExtractionPrompter.parse_facts(reply)),
            vec!["The fee is 10 euros", "Payment is online"]
        );
    }

    #[test]
    fn test_prompt_carries_reference_answer() {
        let reference = Answer {
            text: "Ten euros, paid online.".into(),
            ..Default::default()
        };
        let prompt = FactExtractionPrompter.fact_prompt(&Question::new("How much?"), &reference);
        assert!(prompt.user().contains("Ten euros, paid online."));
        assert!(prompt.user().starts_with("Question: How much?"));
    }
}
