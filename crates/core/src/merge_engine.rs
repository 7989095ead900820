//! Optimistic merge coordinator.
//!
//! A merge captures the current head, merges the builder's changes into it,
//! validates the result and tries to publish it with a single
//! compare-and-publish. Everything before the publish is pure computation
//! over immutable snapshots, so a lost race is handled by recomputing from
//! the new head.
//!
//! ```text
//! PREPARING -> DIFFING -> RESOLVING -> APPLYING -> DONE
//!     ^                                   |
//!     +------------- RETRY <--------------+----> FAILED
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commit::{ConflictValidatorProvider, ValidatorPipeline};
use crate::config::MergeConfig;
use crate::conflict::{merge_trees, ConflictReport, PolicyChain};
use crate::errors::{ConfigError, MergeError};
use crate::store::{Head, HeadRef};
use crate::tree::MutationBuilder;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// States of a single merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Preparing,
    Diffing,
    Resolving,
    Applying,
    Done,
    Retry,
    Failed,
}

impl std::fmt::Display for MergeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Diffing => write!(f, "diffing"),
            Self::Resolving => write!(f, "resolving"),
            Self::Applying => write!(f, "applying"),
            Self::Done => write!(f, "done"),
            Self::Retry => write!(f, "retry"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A merge that reached [`MergeState::Done`].
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The head the merge published.
    pub head: Head,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Conflicts met on the successful attempt, resolved or not.
    pub conflicts: Vec<ConflictReport>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Merges builders into a shared head. One engine serves any number of
/// concurrent writers.
pub struct MergeEngine {
    head: Arc<dyn HeadRef>,
    policies: PolicyChain,
    validators: ValidatorPipeline,
    max_attempts: u32,
}

impl MergeEngine {
    pub fn new(
        head: Arc<dyn HeadRef>,
        policies: PolicyChain,
        validators: ValidatorPipeline,
        max_attempts: u32,
    ) -> Self {
        Self {
            head,
            policies,
            validators,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Engine with the configured policy chain and the conflict gate.
    pub fn from_config(head: Arc<dyn HeadRef>, config: &MergeConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            head,
            config.policy_chain()?,
            ValidatorPipeline::new().with(ConflictValidatorProvider),
            config.store.max_merge_attempts,
        ))
    }

    pub fn head(&self) -> &Arc<dyn HeadRef> {
        &self.head
    }

    /// Merge the changes recorded in `builder` into the current head.
    ///
    /// Unresolved conflicts do not fail the merge; they are recorded in the
    /// tree and left for the validators to judge.
    pub fn merge(&self, builder: &MutationBuilder) -> Result<MergeOutcome, MergeError> {
        let id = Uuid::new_v4();
        let base = builder.base();
        let ours = builder.snapshot();

        for attempt in 1..=self.max_attempts {
            transition(&id, attempt, MergeState::Preparing);
            let theirs = match self.head.head() {
                Ok(head) => head,
                Err(e) => return Err(fail(&id, attempt, e.into())),
            };

            let (candidate, conflicts) = if theirs.root.same_as(base) {
                (ours.clone(), Vec::new())
            } else {
                transition(&id, attempt, MergeState::Diffing);
                let result = match merge_trees(base, &ours, &theirs.root, &self.policies) {
                    Ok(result) => result,
                    Err(e) => return Err(fail(&id, attempt, e.into())),
                };
                transition(&id, attempt, MergeState::Resolving);
                debug!(
                    merge = %id,
                    conflicts = result.conflicts.len(),
                    unresolved = result.unresolved().count(),
                    "conflicts classified"
                );
                (result.tree, result.conflicts)
            };

            transition(&id, attempt, MergeState::Applying);
            if let Err(e) = self.validators.validate(&theirs.root, &candidate) {
                return Err(fail(&id, attempt, e.into()));
            }

            match self.head.compare_and_publish(&theirs, &candidate) {
                Ok(Some(head)) => {
                    transition(&id, attempt, MergeState::Done);
                    info!(
                        merge = %id,
                        revision = %head.revision,
                        attempts = attempt,
                        conflicts = conflicts.len(),
                        "merge committed"
                    );
                    return Ok(MergeOutcome {
                        head,
                        attempts: attempt,
                        conflicts,
                    });
                }
                Ok(None) => {
                    transition(&id, attempt, MergeState::Retry);
                    warn!(merge = %id, attempt, expected = %theirs.revision, "head moved during merge, retrying");
                }
                Err(e) if e.is_transient() => {
                    transition(&id, attempt, MergeState::Retry);
                    warn!(merge = %id, attempt, error = %e, "transient publish failure, retrying");
                }
                Err(e) => return Err(fail(&id, attempt, e.into())),
            }
        }

        Err(fail(
            &id,
            self.max_attempts,
            MergeError::NotConverged {
                attempts: self.max_attempts,
            },
        ))
    }
}

fn transition(id: &Uuid, attempt: u32, state: MergeState) {
    debug!(merge = %id, attempt, state = %state, "merge state");
}

fn fail(id: &Uuid, attempt: u32, error: MergeError) -> MergeError {
    transition(id, attempt, MergeState::Failed);
    warn!(merge = %id, attempt, error = %error, "merge failed");
    error
}
