//! Keyword-matching responder used by the bundled `bot-worker` binary
//!
//! Real deployments plug their dialogue engine in through [`Responder`];
//! this one only needs a JSON definition of the form
//!
//! ```json
//! { "intents": [ { "name": "greet", "keywords": ["hi", "hello"], "answer": "hello" } ],
//!   "fallback": "Sorry, I did not understand." }
//! ```

use serde::Deserialize;

use super::runtime::Responder;
use crate::types::BotDefinition;

fn default_fallback() -> String {
    "Sorry, I did not understand.".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Intent {
    #[serde(default)]
    pub name: String,
    pub keywords: Vec<String>,
    pub answer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordResponder {
    #[serde(default)]
    intents: Vec<Intent>,
    #[serde(default = "default_fallback")]
    fallback: String,
}

impl KeywordResponder {
    pub fn from_definition(definition: &BotDefinition) -> Result<Self, String> {
        let mut bot: Self = serde_json::from_slice(definition.as_bytes())
            .map_err(|e| format!("invalid bot definition: {}", e))?;
        for intent in &mut bot.intents {
            for keyword in &mut intent.keywords {
                *keyword = keyword.to_lowercase();
            }
        }
        Ok(bot)
    }

    /// Index of the intent sharing the most keywords with the question
    fn best_intent(&self, question: &str) -> Option<usize> {
        let words: Vec<String> = question
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        self.intents
            .iter()
            .enumerate()
            .map(|(i, intent)| {
                let hits = intent
                    .keywords
                    .iter()
                    .filter(|k| words.iter().any(|w| w == *k))
                    .count();
                (i, hits)
            })
            .filter(|(_, hits)| *hits > 0)
            // First intent wins ties
            .fold(None, |best: Option<(usize, usize)>, (i, hits)| match best {
                Some((_, top)) if top >= hits => best,
                _ => Some((i, hits)),
            })
            .map(|(i, _)| i)
    }
}

impl Responder for KeywordResponder {
    fn respond(&mut self, question: &str) -> Result<String, String> {
        Ok(match self.best_intent(question) {
            Some(i) => self.intents[i].answer.clone(),
            None => self.fallback.clone(),
        })
    }
}
