//! Stop-phrase detection

/// Ends generation once the generated text ends with one of its phrases.
///
/// Phrases keep their insertion order and duplicates are allowed; the first
/// matching phrase is reported. An empty matcher never matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopMatcher {
    phrases: Vec<String>,
}

impl StopMatcher {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut matcher = Self::default();
        for phrase in phrases {
            matcher.push(phrase);
        }
        matcher
    }

    /// Appends `phrase`. Empty phrases are ignored and `false` is returned.
    pub fn push(&mut self, phrase: impl Into<String>) -> bool {
        let phrase = phrase.into();
        if phrase.is_empty() {
            return false;
        }
        self.phrases.push(phrase);
        true
    }

    pub fn clear(&mut self) {
        self.phrases.clear();
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// The first phrase `text` ends with, if any.
    pub fn find_suffix(&self, text: &str) -> Option<&str> {
        self.phrases
            .iter()
            .find(|phrase| text.ends_with(phrase.as_str()))
            .map(String::as_str)
    }
}

/// Strips one trailing stop phrase (and the whitespace before it) from `text`.
///
/// Generation leaves the matched phrase in the output; callers that display
/// the text use this to clean it up.
pub fn trim_stop_suffix<'a, S: AsRef<str>>(text: &'a str, phrases: &[S]) -> &'a str {
    for phrase in phrases {
        let phrase = phrase.as_ref();
        if phrase.is_empty() {
            continue;
        }
        if let Some(stripped) = text.strip_suffix(phrase) {
            return stripped.trim_end();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_matcher_never_matches() {
        let matcher = StopMatcher::default();
        assert!(matcher.is_empty());
        assert_eq!(matcher.find_suffix("anything END"), None);
        assert_eq!(matcher.find_suffix(""), None);
    }

    #[test]
    fn test_suffix_only() {
        let matcher = StopMatcher::new(["END"]);
        assert_eq!(matcher.find_suffix("the answerEND"), Some("END"));
        assert_eq!(matcher.find_suffix("END of story"), None);
        assert_eq!(matcher.find_suffix("EN"), None);
    }

    #[test]
    fn test_empty_phrases_are_ignored() {
        let mut matcher = StopMatcher::new(["", "User:"]);
        assert_eq!(matcher.phrases(), ["User:"]);
        assert!(!matcher.push(""));
        assert!(matcher.push("User:"));
        assert_eq!(matcher.phrases().len(), 2);
    }

    #[test]
    fn test_first_match_in_insertion_order() {
        let matcher = StopMatcher::new(["<|end|>", "end|>"]);
        assert_eq!(matcher.find_suffix("done<|end|>"), Some("<|end|>"));
    }

    #[test]
    fn test_multibyte_phrases() {
        let matcher = StopMatcher::new(["<｜User｜>"]);
        assert_eq!(matcher.find_suffix("hello <｜User｜>"), Some("<｜User｜>"));
        assert_eq!(matcher.find_suffix("hello <｜User"), None);
    }

    #[test]
    fn test_clear() {
        let mut matcher = StopMatcher::new(["a"]);
        matcher.clear();
        assert_eq!(matcher.find_suffix("a"), None);
    }

    #[test]
    fn test_trim_stop_suffix() {
        let phrases = ["User:", "Assistant:"];
        assert_eq!(trim_stop_suffix("Sure thing.\nUser:", &phrases), "Sure thing.");
        assert_eq!(trim_stop_suffix("No stop here", &phrases), "No stop here");
        assert_eq!(trim_stop_suffix("User: hi", &phrases), "User: hi");
    }
}
