//! Generated files and refiner output blocks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source language of a generated file, inferred from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Rust
    Rust,
    /// TypeScript
    TypeScript,
    /// JavaScript
    JavaScript,
    /// Python
    Python,
    /// Go
    Go,
    /// JSON documents
    Json,
    /// Markdown documents
    Markdown,
    /// Anything else
    Text,
}

impl Language {
    /// Infer language from a file path
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "rs" => Language::Rust,
            "ts" | "tsx" => Language::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "py" => Language::Python,
            "go" => Language::Go,
            "json" => Language::Json,
            "md" => Language::Markdown,
            _ => Language::Text,
        }
    }

    /// Get human-readable name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Go => "go",
            Language::Json => "json",
            Language::Markdown => "markdown",
            Language::Text => "text",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of module a file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    /// Event or API step
    Step,
    /// Shared service code
    #[default]
    Service,
    /// Type definitions
    Types,
    /// Configuration
    Config,
    /// Tests shipped with the module
    Test,
}

/// A single generated file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    /// Relative path inside the generated artifact
    pub path: String,
    /// Full file content
    pub content: String,
    /// Source language
    pub language: Language,
    /// Module kind
    pub module_type: ModuleType,
    /// Iteration that produced or last carried this file
    pub iteration: u32,
    /// When the content was produced
    pub generated_at: DateTime<Utc>,
}

impl GeneratedFile {
    /// Create a file at iteration 0, language inferred from the path
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<String>, module_type: ModuleType) -> Self {
        let path = path.into();
        Self {
            language: Language::from_path(&path),
            path,
            content: content.into(),
            module_type,
            iteration: 0,
            generated_at: Utc::now(),
        }
    }

    /// With iteration stamp
    #[inline]
    #[must_use]
    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Re-stamp with a new iteration, keeping content and timestamp
    #[inline]
    #[must_use]
    pub fn carried_to(&self, iteration: u32) -> Self {
        Self {
            iteration,
            ..self.clone()
        }
    }
}

/// One labeled block parsed from backend output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    /// Path label from the start marker
    pub path: String,
    /// Content between the markers
    pub content: String,
}

impl FileBlock {
    /// Create a block
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Turn the block into a generated file
    #[must_use]
    pub fn into_file(self, module_type: ModuleType, iteration: u32) -> GeneratedFile {
        GeneratedFile::new(self.path, self.content, module_type).with_iteration(iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_from_extension() {
        assert_eq!(Language::from_path("src/lib.rs"), Language::Rust);
        assert_eq!(Language::from_path("steps/api.step.ts"), Language::TypeScript);
        assert_eq!(Language::from_path("steps/handler.PY"), Language::Python);
        assert_eq!(Language::from_path("Makefile"), Language::Text);
    }

    #[test]
    fn carried_file_keeps_content_and_timestamp() {
        let original = GeneratedFile::new("a.ts", "export {}", ModuleType::Step);
        let carried = original.carried_to(2);
        assert_eq!(carried.iteration, 2);
        assert_eq!(carried.content, original.content);
        assert_eq!(carried.generated_at, original.generated_at);
    }

    #[test]
    fn serializes_camel_case() {
        let file = GeneratedFile::new("a.ts", "x", ModuleType::Types);
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["moduleType"], "types");
        assert_eq!(json["language"], "typescript");
        assert!(json.get("generatedAt").is_some());
    }
}
