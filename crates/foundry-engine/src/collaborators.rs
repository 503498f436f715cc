//! External collaborator seams
//!
//! Every role the engine delegates to is a trait. Generating roles return
//! their [`Usage`] alongside the value so metrics can be folded into the
//! workflow in the same mutation that stores the result.

use async_trait::async_trait;
use foundry_artifact::{ContentHash, FileBlock, GeneratedFile};
use foundry_core::{
    AssembledArtifact, CodeModule, CollaboratorError, ComponentSpec, DesignDocument, TestCase,
    TestResult, Usage,
};
use std::sync::Arc;

/// A collaborator result with its cost
#[derive(Debug, Clone, PartialEq)]
pub struct Generated<T> {
    /// Produced value
    pub value: T,
    /// Tokens and cost spent
    pub usage: Usage,
}

impl<T> Generated<T> {
    /// Wrap a value
    #[inline]
    #[must_use]
    pub fn new(value: T, usage: Usage) -> Self {
        Self { value, usage }
    }

    /// Wrap a value that cost nothing
    #[inline]
    #[must_use]
    pub fn free(value: T) -> Self {
        Self::new(value, Usage::ZERO)
    }
}

/// Produces the design document for a request
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DesignGenerator: Send + Sync {
    /// Design the artifact described by `request`
    async fn design(&self, request: &str) -> Result<Generated<DesignDocument>, CollaboratorError>;
}

/// Produces the first version of a module's files
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Generate files for one component
    async fn generate(
        &self,
        component: &ComponentSpec,
        design: &DesignDocument,
    ) -> Result<Generated<Vec<GeneratedFile>>, CollaboratorError>;
}

/// Designs the test cases for a module, once
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TestDesigner: Send + Sync {
    /// Design tests for the module's first iteration
    async fn design_tests(
        &self,
        module: &CodeModule,
    ) -> Result<Generated<Vec<TestCase>>, CollaboratorError>;
}

/// Runs test cases against a module's current files
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// Execute every test case
    async fn execute(
        &self,
        module: &CodeModule,
        tests: &[TestCase],
    ) -> Result<Vec<TestResult>, CollaboratorError>;
}

/// Produces a partial set of corrected files
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Refiner: Send + Sync {
    /// Fix `module` given the failing results only
    async fn refine(
        &self,
        module: &CodeModule,
        failures: &[TestResult],
        tests: &[TestCase],
    ) -> Result<Generated<Vec<FileBlock>>, CollaboratorError>;
}

/// Assembles passed modules into the final artifact
#[async_trait]
pub trait Assembler: Send + Sync {
    /// Assemble every module
    async fn assemble(
        &self,
        design: Option<&DesignDocument>,
        modules: &[CodeModule],
    ) -> Result<AssembledArtifact, CollaboratorError>;
}

/// The full set of collaborators an engine needs
#[derive(Clone)]
pub struct Collaborators {
    /// Design generator
    pub designer: Arc<dyn DesignGenerator>,
    /// Code generator
    pub coder: Arc<dyn CodeGenerator>,
    /// Test designer
    pub test_designer: Arc<dyn TestDesigner>,
    /// Test executor
    pub executor: Arc<dyn TestExecutor>,
    /// Refiner
    pub refiner: Arc<dyn Refiner>,
    /// Assembler
    pub assembler: Arc<dyn Assembler>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Assembler that lists every file and hashes the whole set
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestAssembler;

#[async_trait]
impl Assembler for ManifestAssembler {
    async fn assemble(
        &self,
        _design: Option<&DesignDocument>,
        modules: &[CodeModule],
    ) -> Result<AssembledArtifact, CollaboratorError> {
        let files: Vec<GeneratedFile> = modules.iter().flat_map(|m| m.files.iter().cloned()).collect();
        if files.is_empty() {
            return Err(CollaboratorError::malformed("nothing to assemble"));
        }
        Ok(AssembledArtifact {
            module_count: modules.len(),
            file_count: files.len(),
            content_hash: ContentHash::of_files(&files),
            paths: files.into_iter().map(|f| f.path).collect(),
        })
    }
}
