//! Three-colour DFS cycle detection over the egress graph (rule 5, §4.2).
//!
//! Sibling services are visited in lexicographic order so that, when a
//! cycle exists, the reported path is deterministic.

use std::collections::HashMap;

use rig_domain::Environment;

use crate::ValidationError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Returns the first cycle found, as a forward-ordered path, or `None`.
pub fn detect_cycle(env: &Environment) -> Option<ValidationError> {
    let mut names: Vec<&str> = env.services.keys().map(String::as_str).collect();
    names.sort_unstable();

    let mut colors: HashMap<&str, Color> = names.iter().map(|n| (*n, Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    for &start in &names {
        if colors[start] == Color::White {
            if let Some(cycle) = visit(env, start, &mut colors, &mut stack) {
                let path = cycle.join(" -> ");
                return Some(ValidationError {
                    service: None,
                    message: format!("cycle detected in egress graph: {path}"),
                });
            }
        }
    }
    None
}

fn visit<'a>(
    env: &'a Environment,
    node: &'a str,
    colors: &mut HashMap<&'a str, Color>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(node, Color::Gray);
    stack.push(node);

    let Some(service) = env.services.get(node) else {
        colors.insert(node, Color::Black);
        stack.pop();
        return None;
    };

    let mut targets: Vec<&str> = service
        .egresses
        .values()
        .map(|e| e.service.as_str())
        .filter(|target| env.services.contains_key(*target))
        .collect();
    targets.sort_unstable();
    targets.dedup();

    for target in targets {
        match colors.get(target).copied().unwrap_or(Color::White) {
            Color::White => {
                if let Some(cycle) = visit(env, target, colors, stack) {
                    return Some(cycle);
                }
            }
            Color::Gray => {
                // Back edge: build the cycle path starting at `target`.
                let start_idx = stack.iter().position(|&n| n == target).unwrap();
                let mut path: Vec<String> = stack[start_idx..].iter().map(|s| s.to_string()).collect();
                path.push(target.to_string());
                return Some(path);
            }
            Color::Black => {}
        }
    }

    colors.insert(node, Color::Black);
    stack.pop();
    None
}
