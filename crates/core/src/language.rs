//! Heuristic language tagging for saved code.
//!
//! The tag only annotates persisted snapshots; nothing executes or gates on it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Language tag attached to a code snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Cpp,
    Html,
    Css,
    #[serde(rename = "javascript")]
    JavaScript,
}

impl Language {
    /// Wire tag used by the progress service.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Html => "html",
            Language::Css => "css",
            Language::JavaScript => "javascript",
        }
    }

    /// Parse a wire tag. Unknown tags map to `None`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "python" => Some(Language::Python),
            "java" => Some(Language::Java),
            "cpp" | "c" | "c++" => Some(Language::Cpp),
            "html" => Some(Language::Html),
            "css" => Some(Language::Css),
            "javascript" | "js" => Some(Language::JavaScript),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const HTML_MARKERS: [&str; 5] = ["<html", "<div", "<!doctype", "<body", "<head"];

/// Detect the language of `source`. First match wins; the fallback is JavaScript.
#[must_use]
pub fn detect(source: &str) -> Language {
    let code = source.trim().to_lowercase();
    let has = |needle: &str| code.contains(needle);

    if has("def ") && has(":") && has("import ") {
        return Language::Python;
    }
    if has("public class") || has("system.out.print") {
        return Language::Java;
    }
    if has("#include") || has("printf(") || has("cout") {
        return Language::Cpp;
    }
    if HTML_MARKERS.iter().any(|marker| has(marker)) {
        return Language::Html;
    }
    if has("{") && has("}") && has(":") {
        return Language::Css;
    }
    Language::JavaScript
}
