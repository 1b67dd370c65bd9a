// src/rabbitmq/topology.rs
// Queue bindings and topic matching.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Patterns bound by the courses service queue.
pub const COURSES_PATTERNS: &[&str] = &[
    "courses.*",
    "lessons.*",
    "slides.*",
    "posts.*",
    "quizzes.*",
    "quiz-questions.*",
    "quiz-attempts.*",
    "progress.*",
    "activity.*",
    "users.*",
    "admin.*",
];

/// Routing patterns implied by a queue's name.
///
/// `USER_ACCOUNT` is checked before `USER` so the account queue does not
/// fall into the user domain.
pub fn derive_patterns(queue_name: &str) -> Vec<String> {
    let upper = queue_name.to_ascii_uppercase();

    if upper.contains("USER_ACCOUNT") {
        vec!["useraccount.*".to_string()]
    } else if upper.contains("COURSES") {
        COURSES_PATTERNS.iter().map(|p| p.to_string()).collect()
    } else if upper.contains("USER") {
        vec!["user.*".to_string()]
    } else {
        vec![format!("{}.*", queue_name.to_lowercase())]
    }
}

/// Statically declared `{queue -> patterns}` table.
///
/// Queues without an explicit entry fall back to [`derive_patterns`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingTable {
    bindings: HashMap<String, Vec<String>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding<I, S>(mut self, queue: &str, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.bindings.entry(queue.to_string()).or_default();
        for pattern in patterns {
            let pattern = pattern.into();
            if !entry.contains(&pattern) {
                entry.push(pattern);
            }
        }
        self
    }

    pub fn patterns_for(&self, queue: &str) -> Vec<String> {
        match self.bindings.get(queue) {
            Some(patterns) if !patterns.is_empty() => patterns.clone(),
            _ => derive_patterns(queue),
        }
    }

    pub fn is_explicit(&self, queue: &str) -> bool {
        self.bindings.contains_key(queue)
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && match_words(rest, key_rest)
        }
        _ => false,
    }
}
