//! Canned replies for trivial messages

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;

/// Longest message, in words, that can still be an instant match
const MAX_INSTANT_WORDS: usize = 4;

struct InstantEntry {
    phrases: &'static [&'static str],
    replies: &'static [&'static str],
}

static INSTANT_TABLE: Lazy<Vec<InstantEntry>> = Lazy::new(|| {
    vec![
        InstantEntry {
            phrases: &["hi", "hello", "hey", "hey there", "hello there", "hiya", "yo"],
            replies: &[
                "Hello! How can I help you today?",
                "Hi there! What can I do for you?",
                "Hey! What would you like to talk about?",
            ],
        },
        InstantEntry {
            phrases: &["good morning", "good afternoon", "good evening"],
            replies: &["Good to see you! How can I help?"],
        },
        InstantEntry {
            phrases: &["thanks", "thank you", "thx", "ty", "thanks a lot", "much appreciated"],
            replies: &[
                "You're welcome!",
                "Happy to help!",
                "Anytime! Let me know if you need anything else.",
            ],
        },
        InstantEntry {
            phrases: &["ok", "okay", "got it", "cool", "great", "perfect", "nice", "sounds good"],
            replies: &["Great! Anything else I can help with?", "Glad that works. What's next?"],
        },
        InstantEntry {
            phrases: &["bye", "goodbye", "see you", "see ya", "good night"],
            replies: &["Goodbye! Have a great day.", "See you next time!"],
        },
        InstantEntry {
            phrases: &["how are you", "how are you doing", "how's it going"],
            replies: &["I'm doing well, thanks for asking! How can I help you?"],
        },
    ]
});

/// Lowercase, collapse whitespace and drop trailing punctuation
pub fn normalize_prompt(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim_end()
        .to_string()
}

/// Phrase-table entry matched by `text`, if any.
///
/// A message matches when, after normalization, it equals a phrase or is a
/// short message that contains a phrase as whole words.
fn lookup(text: &str) -> Option<&'static InstantEntry> {
    let normalized = normalize_prompt(text);
    if normalized.is_empty() {
        return None;
    }
    let words: Vec<&str> = normalized
        .split(' ')
        .map(|w| w.trim_matches(|c: char| c.is_ascii_punctuation() && c != '\''))
        .filter(|w| !w.is_empty())
        .collect();
    if words.len() > MAX_INSTANT_WORDS {
        return None;
    }

    INSTANT_TABLE.iter().find(|entry| {
        entry.phrases.iter().any(|phrase| {
            let phrase_words: Vec<&str> = phrase.split(' ').collect();
            words
                .windows(phrase_words.len())
                .any(|window| window == phrase_words.as_slice())
        })
    })
}

pub fn is_instant_match(text: &str) -> bool {
    lookup(text).is_some()
}

/// A canned reply for `text`, chosen at random among the entry's replies
pub fn instant_reply(text: &str) -> Option<&'static str> {
    lookup(text).and_then(|entry| entry.replies.choose(&mut rand::thread_rng()).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greetings_match() {
        assert!(is_instant_match("Hi"));
        assert!(is_instant_match("  hello!!  "));
        assert!(is_instant_match("Hey there, bot"));
        assert!(is_instant_match("thank you!"));
        assert!(instant_reply("thanks").is_some());
    }

    #[test]
    fn test_substring_of_word_does_not_match() {
        assert!(!is_instant_match("this"));
        assert!(!is_instant_match("okapi facts"));
    }

    #[test]
    fn test_long_messages_never_match() {
        assert!(!is_instant_match("hi, can you explain how the token bucket refills?"));
        assert!(instant_reply("").is_none());
    }

    #[test]
    fn test_normalize_prompt() {
        assert_eq!(normalize_prompt("  What   IS Rust?? "), "what is rust");
    }
}
