//! Recall Duplicator: one running instance per template, group and owner.

use crate::config::EngineConfig;
use crate::context::GroupId;
use crate::error::Result;
use crate::graph::{Graph, Owner};
use crate::invariant_ppt::{assert_invariant, DUPLICATE_UNIQUE};
use crate::recall::{RecallInstance, RecallScope};
use crate::states::Purpose;
use std::sync::Arc;

/// What one [`duplicate`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateReport {
    /// Instances created.
    pub created: usize,
    /// Existing instances whose dependency count went up.
    pub reused: usize,
    /// Templates skipped because they do not serve the purpose.
    pub skipped: usize,
}

/// Instantiate `owner`'s templates for `group`.
///
/// Top-level groups (`parent == None`) use the play templates, nested ones
/// the recall templates. A template already instantiated under `group` has
/// its dependency count bumped instead of getting a second instance.
pub fn duplicate(
    graph: &Graph,
    owner: Owner,
    group: GroupId,
    parent: Option<GroupId>,
    purpose: Purpose,
    config: &EngineConfig,
) -> Result<DuplicateReport> {
    let scope = RecallScope::for_parent(parent);
    let slots = graph.recalls(owner)?;
    let list = slots.list(scope);
    let mut report = DuplicateReport::default();

    for template in slots.templates(scope) {
        if !template.purposes().contains(purpose) {
            report.skipped += 1;
            continue;
        }
        match list.find(template.name(), group) {
            Some(existing) => {
                let count = existing.add_dependency();
                tracing::debug!(
                    "duplicate: {owner} {} under {group} reused, dependencies={count}",
                    template.name()
                );
                report.reused += 1;
            }
            None => {
                let instance =
                    RecallInstance::instantiate(template, group, config.samplerate, config.buffer_size);
                tracing::debug!(
                    "duplicate: {owner} {} under {group} as {}",
                    template.name(),
                    instance.id()
                );
                list.push(Arc::new(instance));
                report.created += 1;
            }
        }
        assert_invariant(
            DUPLICATE_UNIQUE,
            list.load()
                .iter()
                .filter(|r| r.matches(template.name(), group))
                .count()
                == 1,
            "At most one live instance per behavior, group and owner",
            Some("duplicate"),
        );
    }
    Ok(report)
}
