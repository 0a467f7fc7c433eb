use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{ChangesetTemplate, Task};

/// Version byte mixed into every fingerprint. Bump when the canonical form
/// changes so stale cache entries miss instead of aliasing.
const FINGERPRINT_VERSION: u8 = 1;

/// Content fingerprint of a task's semantic inputs. Equal fingerprints mean
/// the tasks must accept each other's results.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    /// Steps must be resolved to digests before execution; a fingerprint over
    /// a user-written tag would alias across image updates.
    #[error("step {index} ({container:?}) has no resolved image digest")]
    UnresolvedStep { index: usize, container: String },
    #[error("serializing fingerprint document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Canonical forms. Field order is fixed by struct declaration, env maps are
/// `BTreeMap` so key order is sorted, and only the resolved image digest
/// identifies a step.
#[derive(Serialize)]
struct CanonicalStep<'a> {
    image: &'a str,
    run: &'a str,
    env: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct CanonicalTask<'a> {
    repository: &'a str,
    rev: &'a str,
    steps: Vec<CanonicalStep<'a>>,
    template: &'a ChangesetTemplate,
}

/// Derive the execution-cache key for a task. Stable across runs and hosts
/// for identical inputs.
pub fn task_fingerprint(task: &Task) -> Result<Fingerprint, FingerprintError> {
    let mut steps = Vec::with_capacity(task.steps.len());
    for (index, step) in task.steps.iter().enumerate() {
        if step.resolved_image.is_empty() {
            return Err(FingerprintError::UnresolvedStep {
                index,
                container: step.container.clone(),
            });
        }
        steps.push(CanonicalStep {
            image: &step.resolved_image,
            run: &step.run,
            env: &step.env,
        });
    }

    let doc = CanonicalTask {
        repository: &task.repository.id,
        rev: &task.repository.rev,
        steps,
        template: &task.template,
    };
    let bytes = serde_json::to_vec(&doc)?;

    let mut hasher = Sha256::new();
    hasher.update([FINGERPRINT_VERSION]);
    hasher.update(&bytes);
    Ok(Fingerprint(hex::encode(hasher.finalize())))
}
