//! Dependency graph over task names.

use std::collections::{HashMap, HashSet, VecDeque};

/// Execution order of `names` such that every task comes after the tasks it
/// depends on.
///
/// Uses Kahn's algorithm. When several tasks are ready at once they are taken
/// in the order of `names` (registration order), so the result is
/// deterministic. Dependencies on names not in `names` are ignored.
///
/// Returns the names left over if the graph contains a cycle.
pub fn topological_order(
    names: &[String],
    depends_on: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, Vec<String>> {
    let position: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; names.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
    for (i, name) in names.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in depends_on.get(name).into_iter().flatten() {
            if let Some(&d) = position.get(dep.as_str()) {
                if seen.insert(d) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..names.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(names.len());

    while let Some(i) = ready.pop_front() {
        order.push(names[i].clone());

        let mut unlocked = Vec::new();
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                unlocked.push(dependent);
            }
        }
        // Keep ties in registration order
        unlocked.sort_unstable();
        for dependent in unlocked {
            let at = ready.partition_point(|&r| r < dependent);
            ready.insert(at, dependent);
        }
    }

    if order.len() != names.len() {
        let remaining = names
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, name)| name.clone())
            .collect();
        return Err(remaining);
    }

    Ok(order)
}

/// A dependency cycle reachable in the graph, as a path whose first and last
/// names are equal. Found by depth-first search over the whole graph.
pub fn find_cycle(
    names: &[String],
    depends_on: &HashMap<String, Vec<String>>,
) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        depends_on: &'a HashMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return None,
            Mark::InProgress => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            Mark::Unvisited => {}
        }

        marks.insert(name, Mark::InProgress);
        path.push(name);
        for dep in depends_on.get(name).into_iter().flatten() {
            if let Some(cycle) = visit(dep, depends_on, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    for name in names {
        let mut path = Vec::new();
        if let Some(cycle) = visit(name, depends_on, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}
