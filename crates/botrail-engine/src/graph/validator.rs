use std::collections::{BTreeMap, BTreeSet, VecDeque};

use botrail_core::{CompileConfig, TypeTag, ValidationError};
use tracing::{debug, warn};

use super::cycles::{self, Adjacency};
use super::descriptor::{Routing, StepDescriptor, StepRegistry};
use super::edge::Edge;
use super::regions::{self, MapRegion};
use crate::typing;

/// An immutable, fully checked workflow graph.
///
/// Produced only by [`compile`]; shareable read-only across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedGraph {
    steps: BTreeMap<String, StepDescriptor>,
    start: String,
    edges: Vec<Edge>,
    regions: BTreeMap<String, MapRegion>,
    cycles: Vec<Vec<String>>,
    warnings: Vec<ValidationError>,
}

impl ValidatedGraph {
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of one step, in declaration order.
    pub fn edges_from<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == step)
    }

    /// Map regions keyed by their fan-out step.
    pub fn regions(&self) -> impl Iterator<Item = &MapRegion> {
        self.regions.values()
    }

    pub fn region(&self, fan_out_step: &str) -> Option<&MapRegion> {
        self.regions.get(fan_out_step)
    }

    /// Legal name-based cycles, each starting at its smallest member.
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    /// Non-fatal findings, such as unreachable steps.
    pub fn warnings(&self) -> &[ValidationError] {
        &self.warnings
    }
}

/// Validate a registry with the default compile settings.
pub fn compile(registry: StepRegistry) -> Result<ValidatedGraph, ValidationError> {
    compile_with(registry, &CompileConfig::default())
}

/// Validate a registry. Either every check passes or no graph is produced.
pub fn compile_with(
    registry: StepRegistry,
    config: &CompileConfig,
) -> Result<ValidatedGraph, ValidationError> {
    let steps = registry.into_steps();

    let start = find_start(&steps)?;
    check_routing(&steps)?;

    let edges: Vec<Edge> = steps.values().flat_map(Edge::outgoing).collect();

    if config.type_checking {
        check_types(&steps, &edges)?;
    }

    let mut adjacency: Adjacency = steps.keys().map(|k| (k.clone(), BTreeSet::new())).collect();
    for edge in &edges {
        adjacency
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.to.clone());
    }
    let cycles = cycles::elementary_cycles(&adjacency);
    if !config.allow_cycles {
        if let Some(cycle) = cycles.first() {
            return Err(ValidationError::CyclesDisabled {
                cycle: cycle.clone(),
            });
        }
    }
    cycles::check_nesting(&cycles)?;

    let regions = regions::discover(&steps, &cycles)?;

    let mut warnings = Vec::new();
    for name in unreachable(&start, &adjacency) {
        if config.reject_unreachable {
            return Err(ValidationError::UnreachableStep(name));
        }
        warn!(step = %name, "Step is unreachable from the start step");
        warnings.push(ValidationError::UnreachableStep(name));
    }

    debug!(
        start = %start,
        steps = steps.len(),
        edges = edges.len(),
        regions = regions.len(),
        cycles = cycles.len(),
        "Compiled graph"
    );

    Ok(ValidatedGraph {
        steps,
        start,
        edges,
        regions,
        cycles,
        warnings,
    })
}

fn find_start(steps: &BTreeMap<String, StepDescriptor>) -> Result<String, ValidationError> {
    let starts: Vec<String> = steps
        .values()
        .filter(|s| s.is_start)
        .map(|s| s.name.clone())
        .collect();
    match starts.as_slice() {
        [] => Err(ValidationError::NoStartStep),
        [only] => Ok(only.clone()),
        _ => Err(ValidationError::MultipleStartSteps(starts)),
    }
}

fn check_routing(steps: &BTreeMap<String, StepDescriptor>) -> Result<(), ValidationError> {
    for step in steps.values() {
        match &step.routing {
            Routing::Conditional(map) if map.is_empty() => {
                return Err(ValidationError::EmptyConditional {
                    step: step.name.clone(),
                });
            }
            Routing::Dynamic { targets, .. } if targets.is_empty() => {
                return Err(ValidationError::UndeclaredDynamicTargets {
                    step: step.name.clone(),
                });
            }
            _ => {}
        }
        for target in step.routing.targets() {
            if !steps.contains_key(target) {
                return Err(ValidationError::UnknownTarget {
                    from: step.name.clone(),
                    to: target.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_types(
    steps: &BTreeMap<String, StepDescriptor>,
    edges: &[Edge],
) -> Result<(), ValidationError> {
    for edge in edges {
        let (Some(from), Some(to)) = (steps.get(&edge.from), steps.get(&edge.to)) else {
            continue;
        };
        let ok = if to.is_fold && !edge.is_fan_out() {
            let produced = if from.is_fold {
                TypeTag::list(from.output_type.clone())
            } else {
                from.output_type.clone()
            };
            typing::compatible_into_fold(&produced, &to.input_type)
        } else {
            typing::compatible(
                &from.output_type,
                &to.input_type,
                edge.is_fan_out(),
                from.is_fold,
            )
        };
        if !ok {
            return Err(ValidationError::TypeMismatch {
                from: from.name.clone(),
                to: to.name.clone(),
                produced: from.output_type.clone(),
                expected: to.input_type.clone(),
            });
        }
    }
    Ok(())
}

fn unreachable(start: &str, adjacency: &Adjacency) -> Vec<String> {
    let mut seen: BTreeSet<&str> = BTreeSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        if let Some(next) = adjacency.get(current) {
            for n in next {
                if seen.insert(n.as_str()) {
                    queue.push_back(n.as_str());
                }
            }
        }
    }
    adjacency
        .keys()
        .filter(|k| !seen.contains(k.as_str()))
        .cloned()
        .collect()
}
