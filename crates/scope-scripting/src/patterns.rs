//! Per-plugin pattern cache.
//!
//! Compilation is on demand and memoized by source; the cache lives with the
//! plugin and is released on unload. Sources that fail to compile never
//! match and are only diagnosed once.

use regex::Regex;
use std::collections::HashMap;

/// Characters `literal` escapes so the result matches its input verbatim.
const META: &str = r".^$*+?()[]{}|\";

/// Escape regex metacharacters, yielding a pattern that matches `text`
/// literally.
pub fn literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if META.contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[derive(Default)]
pub struct PatternCache {
    compiled: HashMap<String, Option<Regex>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(&mut self, source: &str) -> Option<&Regex> {
        self.compiled
            .entry(source.to_string())
            .or_insert_with(|| match Regex::new(source) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::debug!(source, %err, "skipping uncompilable pattern");
                    None
                }
            })
            .as_ref()
    }

    pub fn is_match(&mut self, text: &str, source: &str) -> bool {
        self.compile(source).is_some_and(|re| re.is_match(text))
    }

    /// The source of the first pattern, in declared order, matching `text`.
    pub fn first_match(&mut self, text: &str, sources: &[String]) -> Option<String> {
        sources
            .iter()
            .find(|source| self.is_match(text, source))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}
