//! Pure, total change classification.
//!
//! `classify` is a deterministic function of the declared change kind and the
//! touched module boundaries. It never fails and has no side effects; ties
//! break toward the more expensive tier, so structurally risky changes can
//! never be mis-scheduled as cheap ones.

use crate::scheduler::changeset::{ChangeKind, ChangeSet};
use crate::scheduler::job::Tier;

/// Assign a scheduling tier to a change.
///
/// - UI-only edits confined to declared view units are HOT.
/// - Logic, new screens, or state-contract changes are WARM.
/// - Dependency manifests, build configuration, or code signing are COLD.
/// - Unrecognized kinds default to COLD.
pub fn classify(change: &ChangeSet) -> Tier {
    // Structural files invalidate every cheap-rebuild assumption, whatever
    // the submitter declared.
    if change.touches_structure() {
        return Tier::Cold;
    }

    match change.kind {
        ChangeKind::UiOnly => {
            // Declared UI-only but touching non-view units is ambiguous;
            // round up to WARM.
            if change.confined_to_views() {
                Tier::Hot
            } else {
                Tier::Warm
            }
        }
        ChangeKind::Logic => Tier::Warm,
        ChangeKind::Dependency => Tier::Cold,
        ChangeKind::Unknown => Tier::Cold,
    }
}
