//! Adapters from a text generation backend to the collaborator roles
//!
//! The backend takes a prompt and returns text. File-producing roles expect
//! the reply in the file-block grammar; the designer expects a JSON design
//! document, optionally wrapped in prose.

use crate::collaborators::{CodeGenerator, DesignGenerator, Generated, Refiner, TestDesigner};
use async_trait::async_trait;
use foundry_artifact::{parse_blocks, render_blocks, FileBlock, GeneratedFile, ParsedBlocks};
use foundry_core::{
    CodeModule, CollaboratorError, ComponentSpec, DesignDocument, TestCase, TestResult, Usage,
};
use std::fmt::Write as _;
use std::sync::Arc;

/// Raw backend reply
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Reply text
    pub text: String,
    /// Tokens and cost spent
    pub usage: Usage,
}

/// Prompt-in, text-out generation service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Complete a prompt
    async fn complete(&self, prompt: &str) -> Result<Completion, CollaboratorError>;
}

fn log_diagnostics(role: &str, parsed: &ParsedBlocks) {
    for diagnostic in &parsed.diagnostics {
        tracing::warn!(role, "backend output: {}", diagnostic);
    }
}

/// Design generator backed by a [`GenerationBackend`]
#[derive(Clone)]
pub struct BackendDesigner {
    backend: Arc<dyn GenerationBackend>,
}

impl BackendDesigner {
    /// Create the adapter
    #[must_use]
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }
}

// Accepts a bare JSON object or one surrounded by prose or code fences.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

#[async_trait]
impl DesignGenerator for BackendDesigner {
    async fn design(&self, request: &str) -> Result<Generated<DesignDocument>, CollaboratorError> {
        let prompt = format!(
            "Design the application below. Reply with a JSON object \
             {{\"summary\": string, \"components\": [{{\"id\", \"name\", \"description\", \"moduleType\"}}]}}.\n\n{request}"
        );
        let completion = self.backend.complete(&prompt).await?;
        let json = extract_json(&completion.text)
            .ok_or_else(|| CollaboratorError::malformed("design reply contains no JSON object"))?;
        let design: DesignDocument = serde_json::from_str(json)
            .map_err(|e| CollaboratorError::malformed(format!("design reply is not a design document: {e}")))?;
        if design.components.is_empty() {
            return Err(CollaboratorError::malformed("design has no components"));
        }
        Ok(Generated::new(design, completion.usage))
    }
}

/// Code generator backed by a [`GenerationBackend`]
#[derive(Clone)]
pub struct BackendCoder {
    backend: Arc<dyn GenerationBackend>,
}

impl BackendCoder {
    /// Create the adapter
    #[must_use]
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl CodeGenerator for BackendCoder {
    async fn generate(
        &self,
        component: &ComponentSpec,
        design: &DesignDocument,
    ) -> Result<Generated<Vec<GeneratedFile>>, CollaboratorError> {
        let prompt = format!(
            "Application: {}\n\nImplement component '{}' ({}): {}\n\n\
             Return every file as `--- FILE: <path> ---` ... `--- END FILE ---`.",
            design.summary, component.name, component.id, component.description
        );
        let completion = self.backend.complete(&prompt).await?;
        let parsed = parse_blocks(&completion.text);
        log_diagnostics("coder", &parsed);
        if parsed.is_empty() {
            return Err(CollaboratorError::malformed(format!(
                "no file blocks in code for {}",
                component.id
            )));
        }
        let files = parsed
            .blocks
            .into_iter()
            .map(|block| block.into_file(component.module_type, 0))
            .collect();
        Ok(Generated::new(files, completion.usage))
    }
}

/// Test designer backed by a [`GenerationBackend`]; one test case per
/// returned block
#[derive(Clone)]
pub struct BackendTestDesigner {
    backend: Arc<dyn GenerationBackend>,
}

impl BackendTestDesigner {
    /// Create the adapter
    #[must_use]
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TestDesigner for BackendTestDesigner {
    async fn design_tests(
        &self,
        module: &CodeModule,
    ) -> Result<Generated<Vec<TestCase>>, CollaboratorError> {
        let sources = render_blocks(module.files.iter().map(|f| (f.path.as_str(), f.content.as_str())));
        let prompt = format!(
            "Write tests for module '{}'. Return each test file as a file block.\n\n{sources}",
            module.name
        );
        let completion = self.backend.complete(&prompt).await?;
        let parsed = parse_blocks(&completion.text);
        log_diagnostics("test_designer", &parsed);
        if parsed.is_empty() {
            return Err(CollaboratorError::malformed(format!(
                "no test blocks for {}",
                module.module_id
            )));
        }

        let target = module.files.first().map(|f| f.path.clone()).unwrap_or_default();
        let cases = parsed
            .blocks
            .into_iter()
            .map(|block| {
                TestCase::new(
                    format!("{}:{}", module.module_id, block.path),
                    module.module_id.clone(),
                    block.path,
                    block.content,
                    target.clone(),
                )
            })
            .collect();
        Ok(Generated::new(cases, completion.usage))
    }
}

/// Refiner backed by a [`GenerationBackend`]
///
/// Returns whatever blocks parse, possibly none; the module loop decides
/// what an empty answer means.
#[derive(Clone)]
pub struct BackendRefiner {
    backend: Arc<dyn GenerationBackend>,
}

impl BackendRefiner {
    /// Create the adapter
    #[must_use]
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }
}

fn refine_prompt(module: &CodeModule, failures: &[TestResult], tests: &[TestCase]) -> String {
    let mut prompt = format!(
        "Module '{}' fails {} test(s) at iteration {}. Return only the files you change.\n\n",
        module.name,
        failures.len(),
        module.iteration
    );
    for failure in failures {
        let _ = writeln!(
            prompt,
            "- {}: {}",
            failure.test_id,
            failure.error_message.as_deref().unwrap_or("failed")
        );
        if let Some(trace) = &failure.stack_trace {
            let _ = writeln!(prompt, "  {trace}");
        }
    }
    prompt.push('\n');
    prompt.push_str(&render_blocks(
        module.files.iter().map(|f| (f.path.as_str(), f.content.as_str())),
    ));
    prompt.push_str(&render_blocks(tests.iter().map(|t| (t.name.as_str(), t.code.as_str()))));
    prompt
}

#[async_trait]
impl Refiner for BackendRefiner {
    async fn refine(
        &self,
        module: &CodeModule,
        failures: &[TestResult],
        tests: &[TestCase],
    ) -> Result<Generated<Vec<FileBlock>>, CollaboratorError> {
        let completion = self.backend.complete(&refine_prompt(module, failures, tests)).await?;
        let parsed = parse_blocks(&completion.text);
        log_diagnostics("refiner", &parsed);
        Ok(Generated::new(parsed.blocks, completion.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_artifact::ModuleType;
    use foundry_core::ModuleId;

    fn replying(text: &'static str) -> Arc<dyn GenerationBackend> {
        let mut backend = MockGenerationBackend::new();
        backend.expect_complete().returning(move |_| {
            Ok(Completion {
                text: text.to_string(),
                usage: Usage::new(42, 0.002),
            })
        });
        Arc::new(backend)
    }

    fn code_module() -> CodeModule {
        CodeModule {
            module_id: ModuleId::new("api"),
            name: "API".into(),
            module_type: ModuleType::Step,
            files: vec![GeneratedFile::new("api.ts", "broken", ModuleType::Step)],
            iteration: 0,
        }
    }

    #[tokio::test]
    async fn designer_extracts_json_from_prose() {
        let designer = BackendDesigner::new(replying(
            "Sure!\n```json\n{\"summary\":\"todo\",\"components\":[{\"id\":\"api\",\"name\":\"API\",\"description\":\"routes\",\"moduleType\":\"step\"}]}\n```",
        ));
        let design = designer.design("todo app").await.unwrap();
        assert_eq!(design.value.component_count(), 1);
        assert_eq!(design.value.components[0].module_type, ModuleType::Step);
        assert_eq!(design.usage.tokens, 42);
    }

    #[tokio::test]
    async fn designer_rejects_prose_only() {
        let err = BackendDesigner::new(replying("I cannot help with that."))
            .design("x")
            .await
            .unwrap_err();
        assert_eq!(err.kind, foundry_core::CollaboratorErrorKind::Malformed);
    }

    #[tokio::test]
    async fn coder_stamps_module_type_and_iteration_zero() {
        let coder = BackendCoder::new(replying("--- FILE: a.ts ---\nx\n--- END FILE ---\n"));
        let component = ComponentSpec::new("a", "A", "", ModuleType::Types);
        let files = coder.generate(&component, &DesignDocument::default()).await.unwrap().value;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].module_type, ModuleType::Types);
        assert_eq!(files[0].iteration, 0);
    }

    #[tokio::test]
    async fn coder_without_blocks_is_malformed() {
        let coder = BackendCoder::new(replying("no code today"));
        let component = ComponentSpec::new("a", "A", "", ModuleType::Step);
        let err = coder.generate(&component, &DesignDocument::default()).await.unwrap_err();
        assert_eq!(err.kind, foundry_core::CollaboratorErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_designer_makes_one_case_per_block() {
        let designer = BackendTestDesigner::new(replying(
            "--- FILE: api.test.ts ---\nit()\n--- END FILE ---\n--- FILE: api2.test.ts ---\nit()\n--- END FILE ---\n",
        ));
        let cases = designer.design_tests(&code_module()).await.unwrap().value;
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].id, "api:api.test.ts");
        assert_eq!(cases[0].target_file, "api.ts");
    }

    #[tokio::test]
    async fn refiner_passes_through_empty_parse() {
        let refiner = BackendRefiner::new(replying("Looks fine to me."));
        let blocks = refiner
            .refine(&code_module(), &[TestResult::fail("t1", "boom")], &[])
            .await
            .unwrap();
        assert!(blocks.value.is_empty());
    }

    #[test]
    fn refine_prompt_lists_failures_and_files() {
        let prompt = refine_prompt(
            &code_module(),
            &[TestResult::fail("t1", "expected 2").with_stack_trace("at api.ts:1")],
            &[],
        );
        assert!(prompt.contains("- t1: expected 2"));
        assert!(prompt.contains("at api.ts:1"));
        assert!(prompt.contains("--- FILE: api.ts ---"));
    }
}
