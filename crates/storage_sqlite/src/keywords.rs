use std::collections::HashSet;

const MIN_KEYWORD_CHARS: usize = 3;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "in", "on", "at", "to", "for", "of", "with", "by", "is", "are", "was",
    "were", "be", "been", "being", "it", "this", "that", "these", "those", "i", "you", "he",
    "she", "we", "they", "me", "him", "her", "us", "them", "what", "which", "who", "whom",
    "whose", "can", "could", "will", "would", "shall", "should", "have", "has", "had", "do",
    "does", "did", "but", "and", "or", "so", "if", "when", "where", "how", "why",
];

pub fn extract_keywords(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();

    let mut seen = HashSet::new();
    cleaned
        .split_whitespace()
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS)
        .filter(|word| !STOP_WORDS.contains(word))
        .filter(|word| seen.insert(*word))
        .map(str::to_string)
        .collect()
}

/// A quarter of the UTF-16 length, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.encode_utf16().count().div_ceil(4)
}
