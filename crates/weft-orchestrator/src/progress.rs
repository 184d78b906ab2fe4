//! Step-tree helpers: weighted progress, lookup, validation.

use crate::types::{ProgressStep, StepDefinition, StepStatus};
use std::collections::HashSet;
use weft_core::{WeftError, WeftResult};

/// Weight-normalized progress of `steps`, 0 to 100.
pub fn overall_progress(steps: &[ProgressStep]) -> f64 {
    let total: f64 = steps.iter().map(|s| s.weight).sum();
    if total <= 0.0 {
        return 0.0;
    }
    steps
        .iter()
        .map(|s| s.weight * effective_progress(s))
        .sum::<f64>()
        / total
}

/// A completed step counts fully; a step with substeps derives its progress
/// from them.
pub fn effective_progress(step: &ProgressStep) -> f64 {
    if step.status == StepStatus::Completed {
        100.0
    } else if step.substeps.is_empty() {
        step.progress
    } else {
        overall_progress(&step.substeps)
    }
}

/// Reject weights outside (0, 1] and duplicate ids anywhere in the tree.
pub(crate) fn validate(steps: &[StepDefinition]) -> WeftResult<()> {
    fn walk<'a>(steps: &'a [StepDefinition], seen: &mut HashSet<&'a str>) -> WeftResult<()> {
        for step in steps {
            if !(step.weight > 0.0 && step.weight <= 1.0) {
                return Err(WeftError::Workflow(format!(
                    "Step '{}' has weight {}, expected a value in (0, 1]",
                    step.id, step.weight
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(WeftError::Workflow(format!(
                    "Duplicate step id '{}'",
                    step.id
                )));
            }
            walk(&step.substeps, seen)?;
        }
        Ok(())
    }
    if steps.is_empty() {
        return Err(WeftError::Workflow("Workflow has no steps".into()));
    }
    walk(steps, &mut HashSet::new())
}

pub(crate) fn find_mut<'a>(steps: &'a mut [ProgressStep], id: &str) -> Option<&'a mut ProgressStep> {
    for step in steps.iter_mut() {
        if step.id == id {
            return Some(step);
        }
        if let Some(found) = find_mut(&mut step.substeps, id) {
            return Some(found);
        }
    }
    None
}

pub(crate) fn find<'a>(steps: &'a [ProgressStep], id: &str) -> Option<&'a ProgressStep> {
    steps.iter().find_map(|s| {
        if s.id == id {
            Some(s)
        } else {
            find(&s.substeps, id)
        }
    })
}

/// Id of the step whose substeps include `id`.
pub(crate) fn parent_of(steps: &[ProgressStep], id: &str) -> Option<String> {
    steps.iter().find_map(|s| {
        if s.substeps.iter().any(|c| c.id == id) {
            Some(s.id.clone())
        } else {
            parent_of(&s.substeps, id)
        }
    })
}

/// Ids of completed steps, depth first.
pub(crate) fn completed_ids(steps: &[ProgressStep]) -> Vec<String> {
    let mut ids = Vec::new();
    for step in steps {
        if step.status == StepStatus::Completed {
            ids.push(step.id.clone());
        }
        ids.extend(completed_ids(&step.substeps));
    }
    ids
}

/// Apply `f` to `step` and every descendant.
pub(crate) fn for_each_mut(step: &mut ProgressStep, f: &mut impl FnMut(&mut ProgressStep)) {
    f(step);
    for child in &mut step.substeps {
        for_each_mut(child, f);
    }
}

pub(crate) fn all_terminal(steps: &[ProgressStep]) -> bool {
    steps.iter().all(|s| s.status.is_terminal())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tree() -> Vec<ProgressStep> {
        let defs = vec![
            StepDefinition::new("fetch", 0.2),
            StepDefinition::new("process", 0.6).with_substeps(vec![
                StepDefinition::new("clean", 0.5),
                StepDefinition::new("embed", 1.0),
            ]),
            StepDefinition::new("publish", 0.2),
        ];
        defs.iter().map(ProgressStep::from_definition).collect()
    }

    #[test]
    fn test_weighted_average() {
        let mut steps = tree();
        assert_eq!(overall_progress(&steps), 0.0);

        steps[0].status = StepStatus::Completed;
        // 0.2 * 100 / 1.0
        assert!((overall_progress(&steps) - 20.0).abs() < 1e-9);

        find_mut(&mut steps, "embed").unwrap().progress = 50.0;
        // process = (0.5*0 + 1.0*50) / 1.5 = 33.33..., weighted by 0.6
        let expected = 20.0 + 0.6 * (50.0 / 1.5);
        assert!((overall_progress(&steps) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_validate_weights_and_ids() {
        assert!(validate(&[StepDefinition::new("a", 1.0)]).is_ok());
        assert!(validate(&[StepDefinition::new("a", 0.0)]).is_err());
        assert!(validate(&[StepDefinition::new("a", 1.5)]).is_err());
        assert!(validate(&[StepDefinition::new("a", f64::NAN)]).is_err());
        assert!(validate(&[]).is_err());
        let dup = StepDefinition::new("a", 0.5).with_substeps(vec![StepDefinition::new("a", 1.0)]);
        assert!(validate(&[dup]).is_err());
    }

    #[test]
    fn test_lookup_helpers() {
        let mut steps = tree();
        assert_eq!(parent_of(&steps, "embed").as_deref(), Some("process"));
        assert!(parent_of(&steps, "fetch").is_none());
        assert!(find(&steps, "clean").is_some());

        find_mut(&mut steps, "clean").unwrap().status = StepStatus::Completed;
        steps[2].status = StepStatus::Completed;
        assert_eq!(completed_ids(&steps), vec!["clean", "publish"]);
        assert!(!all_terminal(&steps));

        for_each_mut(&mut steps[1], &mut |s| s.status = StepStatus::Cancelled);
        steps[0].status = StepStatus::Failed;
        assert!(all_terminal(&steps));
        assert_eq!(find(&steps, "embed").unwrap().status, StepStatus::Cancelled);
    }
}
