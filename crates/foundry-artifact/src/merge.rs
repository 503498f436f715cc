//! Refinement merge policy
//!
//! A refiner answers with a *partial* file set. The merged result for the
//! next iteration is:
//!
//! - every prior file named by the refiner, replaced by the refined content;
//! - every prior file not named, carried over unchanged;
//! - every refined path unknown to the prior set, appended;
//! - all of it stamped with the next iteration number.
//!
//! When the refiner names nothing (usually a parse failure upstream) every
//! prior file is carried over and the outcome is flagged as a fallback. The
//! iteration still advances; callers decide how loudly to report it.

use crate::file::{FileBlock, GeneratedFile, ModuleType};
use crate::hash::ContentHash;
use chrono::Utc;
use std::collections::HashMap;

/// What a merge did
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Merged file set, prior order first, new paths appended
    pub files: Vec<GeneratedFile>,
    /// Iteration every file is stamped with
    pub iteration: u32,
    /// Prior paths whose content was replaced
    pub replaced: Vec<String>,
    /// Prior paths carried over untouched
    pub carried: Vec<String>,
    /// Paths introduced by the refiner
    pub added: Vec<String>,
    /// Refiner named zero files; everything was carried
    pub fallback: bool,
    /// Hash of the prior file set
    pub before: ContentHash,
    /// Hash of the merged file set
    pub after: ContentHash,
}

impl MergeOutcome {
    /// Merged content differs from the prior iteration
    #[inline]
    #[must_use]
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Merge refiner output over the prior iteration's files
#[must_use]
pub fn merge_refinement(
    prior: &[GeneratedFile],
    refined: Vec<FileBlock>,
    next_iteration: u32,
) -> MergeOutcome {
    let before = ContentHash::of_files(prior);

    if refined.is_empty() {
        let files: Vec<GeneratedFile> = prior.iter().map(|f| f.carried_to(next_iteration)).collect();
        tracing::warn!(
            iteration = next_iteration,
            files = files.len(),
            "refiner named no files; carrying prior iteration forward"
        );
        return MergeOutcome {
            carried: prior.iter().map(|f| f.path.clone()).collect(),
            after: ContentHash::of_files(&files),
            files,
            iteration: next_iteration,
            replaced: Vec::new(),
            added: Vec::new(),
            fallback: true,
            before,
        };
    }

    let mut incoming: HashMap<String, FileBlock> = HashMap::with_capacity(refined.len());
    let mut order: Vec<String> = Vec::with_capacity(refined.len());
    for block in refined {
        if !incoming.contains_key(&block.path) {
            order.push(block.path.clone());
        }
        incoming.insert(block.path.clone(), block);
    }

    let now = Utc::now();
    let mut files = Vec::with_capacity(prior.len() + incoming.len());
    let mut replaced = Vec::new();
    let mut carried = Vec::new();

    for file in prior {
        if let Some(block) = incoming.remove(&file.path) {
            replaced.push(file.path.clone());
            files.push(GeneratedFile {
                content: block.content,
                iteration: next_iteration,
                generated_at: now,
                ..file.clone()
            });
        } else {
            carried.push(file.path.clone());
            files.push(file.carried_to(next_iteration));
        }
    }

    let default_type = prior.first().map_or(ModuleType::default(), |f| f.module_type);
    let mut added = Vec::new();
    for path in order {
        if let Some(block) = incoming.remove(&path) {
            added.push(path);
            files.push(block.into_file(default_type, next_iteration));
        }
    }

    let after = ContentHash::of_files(&files);
    tracing::debug!(
        iteration = next_iteration,
        replaced = replaced.len(),
        carried = carried.len(),
        added = added.len(),
        "merged refinement"
    );

    MergeOutcome {
        files,
        iteration: next_iteration,
        replaced,
        carried,
        added,
        fallback: false,
        before,
        after,
    }
}
