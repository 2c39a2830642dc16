//! Name-based cycle discovery: Tarjan SCCs, then elementary cycles per component.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use botrail_core::ValidationError;

pub(crate) type Adjacency = BTreeMap<String, BTreeSet<String>>;

/// Strongly connected components, each sorted by name.
pub(crate) fn strongly_connected(adj: &Adjacency) -> Vec<Vec<String>> {
    let mut tarjan = Tarjan {
        adj,
        next_index: 0,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        components: Vec::new(),
    };
    for node in adj.keys() {
        if !tarjan.index.contains_key(node.as_str()) {
            tarjan.visit(node);
        }
    }
    tarjan.components
}

struct Tarjan<'a> {
    adj: &'a Adjacency,
    next_index: usize,
    index: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    on_stack: HashSet<&'a str>,
    stack: Vec<&'a str>,
    components: Vec<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn visit(&mut self, node: &'a str) {
        self.index.insert(node, self.next_index);
        self.lowlink.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        let adj = self.adj;
        if let Some(successors) = adj.get(node) {
            for next in successors {
                let next = next.as_str();
                if !self.index.contains_key(next) {
                    self.visit(next);
                    let low = self.lowlink[node].min(self.lowlink[next]);
                    self.lowlink.insert(node, low);
                } else if self.on_stack.contains(next) {
                    let low = self.lowlink[node].min(self.index[next]);
                    self.lowlink.insert(node, low);
                }
            }
        }

        if self.lowlink[node] == self.index[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(member);
                component.push(member.to_string());
                if member == node {
                    break;
                }
            }
            component.sort();
            self.components.push(component);
        }
    }
}

/// Every elementary cycle of the graph. Each cycle starts at its smallest
/// member and follows edge order; the list is sorted.
///
/// Johnson's search: for each start in ascending order, circuits are found in
/// the strongly connected piece of the steps not smaller than it, with blocked
/// sets so no dead end is walked twice.
pub(crate) fn elementary_cycles(adj: &Adjacency) -> Vec<Vec<String>> {
    let mut cycles = Vec::new();
    for component in strongly_connected(adj) {
        for (i, start) in component.iter().enumerate() {
            let keep: BTreeSet<&str> = component[i..].iter().map(String::as_str).collect();
            let sub = induced(adj, &keep);
            let Some(piece) = strongly_connected(&sub)
                .into_iter()
                .find(|c| c.contains(start))
            else {
                continue;
            };
            let keep: BTreeSet<&str> = piece.iter().map(String::as_str).collect();
            let sub = induced(&sub, &keep);

            let mut search = Johnson {
                adj: &sub,
                start: start.as_str(),
                blocked: BTreeSet::new(),
                blocked_by: BTreeMap::new(),
                path: Vec::new(),
                cycles: Vec::new(),
            };
            search.circuit(start.as_str());
            cycles.append(&mut search.cycles);
        }
    }
    cycles.sort();
    cycles
}

fn induced(adj: &Adjacency, keep: &BTreeSet<&str>) -> Adjacency {
    keep.iter()
        .map(|&node| {
            let next = adj
                .get(node)
                .map(|succ| {
                    succ.iter()
                        .filter(|t| keep.contains(t.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (node.to_string(), next)
        })
        .collect()
}

struct Johnson<'a> {
    adj: &'a Adjacency,
    start: &'a str,
    blocked: BTreeSet<&'a str>,
    blocked_by: BTreeMap<&'a str, BTreeSet<&'a str>>,
    path: Vec<&'a str>,
    cycles: Vec<Vec<String>>,
}

impl<'a> Johnson<'a> {
    fn circuit(&mut self, node: &'a str) -> bool {
        let adj = self.adj;
        let mut found = false;
        self.path.push(node);
        self.blocked.insert(node);

        if let Some(successors) = adj.get(node) {
            for next in successors {
                let next = next.as_str();
                if next == self.start {
                    self.cycles
                        .push(self.path.iter().map(|s| s.to_string()).collect());
                    found = true;
                } else if !self.blocked.contains(next) && self.circuit(next) {
                    found = true;
                }
            }
        }

        if found {
            self.unblock(node);
        } else if let Some(successors) = adj.get(node) {
            for next in successors {
                self.blocked_by.entry(next.as_str()).or_default().insert(node);
            }
        }
        self.path.pop();
        found
    }

    fn unblock(&mut self, node: &'a str) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if self.blocked.remove(current) {
                if let Some(waiting) = self.blocked_by.remove(current) {
                    stack.extend(waiting);
                }
            }
        }
    }
}

/// Reject a cycle whose member set lies wholly inside another cycle's.
pub(crate) fn check_nesting(cycles: &[Vec<String>]) -> Result<(), ValidationError> {
    let sets: Vec<BTreeSet<&str>> = cycles
        .iter()
        .map(|c| c.iter().map(String::as_str).collect())
        .collect();
    for (i, inner) in sets.iter().enumerate() {
        for (j, outer) in sets.iter().enumerate() {
            if i != j && inner.len() <= outer.len() && inner.is_subset(outer) {
                return Err(ValidationError::NestedCycle {
                    inner: cycles[i].clone(),
                    outer: cycles[j].clone(),
                });
            }
        }
    }
    Ok(())
}
