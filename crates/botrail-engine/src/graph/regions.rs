//! Map region discovery and legality.
//!
//! A region starts at a step routed with `MapFanOut(element)` and follows the
//! element step's static routes until it reaches a fold step. Nested fan-outs
//! along the chain are followed through their own fold.

use std::collections::{BTreeMap, BTreeSet};

use botrail_core::ValidationError;
use serde::{Deserialize, Serialize};

use super::descriptor::{Routing, StepDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRegion {
    pub fan_out_step: String,
    pub element_step: String,
    pub fold_step: String,
    /// Steps run once per element, element step first. Excludes the fold.
    pub members: Vec<String>,
}

impl MapRegion {
    pub fn contains(&self, step: &str) -> bool {
        self.members.iter().any(|m| m == step)
    }
}

/// Trace every map region, keyed by fan-out step.
pub(crate) fn discover(
    steps: &BTreeMap<String, StepDescriptor>,
    cycles: &[Vec<String>],
) -> Result<BTreeMap<String, MapRegion>, ValidationError> {
    let on_cycle: BTreeSet<&str> = cycles.iter().flatten().map(String::as_str).collect();
    let mut regions = BTreeMap::new();
    let mut closed_by: BTreeMap<String, String> = BTreeMap::new();

    for step in steps.values() {
        if !matches!(step.routing, Routing::MapFanOut(_)) {
            continue;
        }
        let region = trace(steps, &step.name, &mut Vec::new())?;

        for name in std::iter::once(&region.fan_out_step).chain(region.members.iter()) {
            if on_cycle.contains(name.as_str()) {
                return Err(ValidationError::MapRegionInCycle {
                    fan_out: region.fan_out_step.clone(),
                    step: name.clone(),
                });
            }
        }

        if let Some(first) = closed_by.get(&region.fold_step) {
            return Err(ValidationError::SharedFold {
                fold: region.fold_step.clone(),
                first: first.clone(),
                second: region.fan_out_step.clone(),
            });
        }
        closed_by.insert(region.fold_step.clone(), region.fan_out_step.clone());
        regions.insert(region.fan_out_step.clone(), region);
    }

    if let Some(orphan) = steps
        .values()
        .find(|s| s.is_fold && !closed_by.contains_key(&s.name))
    {
        return Err(ValidationError::OrphanFold(orphan.name.clone()));
    }

    Ok(regions)
}

fn lookup<'a>(
    steps: &'a BTreeMap<String, StepDescriptor>,
    from: &str,
    to: &str,
) -> Result<&'a StepDescriptor, ValidationError> {
    steps.get(to).ok_or_else(|| ValidationError::UnknownTarget {
        from: from.to_string(),
        to: to.to_string(),
    })
}

fn trace(
    steps: &BTreeMap<String, StepDescriptor>,
    fan_out: &str,
    open: &mut Vec<String>,
) -> Result<MapRegion, ValidationError> {
    if open.iter().any(|f| f == fan_out) {
        return Err(ValidationError::MapRegionInCycle {
            fan_out: fan_out.to_string(),
            step: fan_out.to_string(),
        });
    }
    open.push(fan_out.to_string());

    let origin = lookup(steps, fan_out, fan_out)?;
    let Routing::MapFanOut(element) = &origin.routing else {
        return Err(ValidationError::MissingFold {
            fan_out: fan_out.to_string(),
        });
    };
    let element_desc = lookup(steps, fan_out, element)?;
    if element_desc.is_fold {
        return Err(ValidationError::FoldAsElement {
            fan_out: fan_out.to_string(),
            fold: element.clone(),
        });
    }

    let mut members = Vec::new();
    let mut seen = BTreeSet::new();
    let mut enter = |name: &str, members: &mut Vec<String>| {
        if !seen.insert(name.to_string()) {
            return Err(ValidationError::MapRegionInCycle {
                fan_out: fan_out.to_string(),
                step: name.to_string(),
            });
        }
        members.push(name.to_string());
        Ok(())
    };

    enter(&element_desc.name, &mut members)?;
    let mut current = element_desc;
    let fold_step = loop {
        match &current.routing {
            Routing::Static(target) => {
                let next = lookup(steps, &current.name, target)?;
                if next.is_fold {
                    break next.name.clone();
                }
                enter(&next.name, &mut members)?;
                current = next;
            }
            Routing::MapFanOut(_) => {
                let inner = trace(steps, &current.name, open)?;
                for name in inner.members.iter().chain(std::iter::once(&inner.fold_step)) {
                    enter(name, &mut members)?;
                }
                current = lookup(steps, &current.name, &inner.fold_step)?;
            }
            Routing::Conditional(_) | Routing::Dynamic { .. } => {
                return Err(ValidationError::BranchInMapRegion {
                    fan_out: fan_out.to_string(),
                    step: current.name.clone(),
                });
            }
            Routing::None => {
                return Err(ValidationError::MissingFold {
                    fan_out: fan_out.to_string(),
                });
            }
        }
    };

    open.pop();
    Ok(MapRegion {
        fan_out_step: fan_out.to_string(),
        element_step: element.clone(),
        fold_step,
        members,
    })
}
