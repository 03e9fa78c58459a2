use std::collections::HashMap;
use std::path::Path;

/// Lowercased alphanumeric runs (underscore counts as a word character).
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Term frequencies for a document: tokens of its file name plus its text.
pub fn term_frequencies(path: &str, text: &str) -> HashMap<String, u32> {
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut terms: HashMap<String, u32> = HashMap::new();
    for token in tokenize(&name).chain(tokenize(text)) {
        *terms.entry(token).or_insert(0) += 1;
    }
    terms
}
