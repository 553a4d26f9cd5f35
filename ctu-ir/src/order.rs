#![forbid(unsafe_code)]

use std::collections::HashMap;

use crate::ir::IrAggregate;

/// Aggregates that embed each other by value, in the order the embedding was
/// discovered. The first name is repeated at the end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateCycle {
    pub path: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Orders aggregates so that every aggregate embedded by value in another
/// comes first. Ties keep declaration order, so the result is deterministic.
///
/// Returns indices into `aggregates`. Opaque aggregates are included but
/// contribute no edges.
pub fn aggregate_order(aggregates: &[IrAggregate]) -> Result<Vec<usize>, AggregateCycle> {
    let index: HashMap<&str, usize> = aggregates
        .iter()
        .enumerate()
        .map(|(i, a)| (a.name.as_str(), i))
        .collect();

    let deps: Vec<Vec<usize>> = aggregates
        .iter()
        .map(|agg| {
            agg.fields
                .iter()
                .filter_map(|f| f.ty.embedded_name())
                .filter_map(|name| index.get(name).copied())
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; aggregates.len()];
    let mut order = Vec::with_capacity(aggregates.len());
    let mut stack = Vec::new();

    for root in 0..aggregates.len() {
        if marks[root] == Mark::Unvisited {
            visit(root, &deps, &mut marks, &mut stack, &mut order).map_err(|cycle| AggregateCycle {
                path: cycle.into_iter().map(|i| aggregates[i].name.clone()).collect(),
            })?;
        }
    }
    Ok(order)
}

fn visit(
    node: usize,
    deps: &[Vec<usize>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> Result<(), Vec<usize>> {
    marks[node] = Mark::InProgress;
    stack.push(node);
    for &dep in &deps[node] {
        match marks[dep] {
            Mark::Done => {}
            Mark::InProgress => {
                let from = stack.iter().position(|&n| n == dep).unwrap_or(0);
                let mut cycle = stack[from..].to_vec();
                cycle.push(dep);
                return Err(cycle);
            }
            Mark::Unvisited => visit(dep, deps, marks, stack, order)?,
        }
    }
    stack.pop();
    marks[node] = Mark::Done;
    order.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AggregateKind, BuiltinType, IrField, IrType};

    fn agg(name: &str, fields: &[(&str, IrType)]) -> IrAggregate {
        IrAggregate {
            kind: AggregateKind::Struct,
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(n, t)| IrField {
                    name: n.to_string(),
                    ty: t.clone(),
                })
                .collect(),
            capabilities: vec![],
            opaque: false,
        }
    }

    fn named(n: &str) -> IrType {
        IrType::Named(n.to_string())
    }

    #[test]
    fn embedded_aggregates_come_first() {
        let aggs = vec![
            agg("Outer", &[("inner", named("Inner"))]),
            agg("Inner", &[("v", IrType::Builtin(BuiltinType::Int))]),
        ];
        assert_eq!(aggregate_order(&aggs).unwrap(), vec![1, 0]);
    }

    #[test]
    fn pointers_do_not_create_edges() {
        let aggs = vec![
            agg("Node", &[("next", IrType::Pointer(Box::new(named("Node"))))]),
            agg("List", &[("head", IrType::Pointer(Box::new(named("Node"))))]),
        ];
        assert_eq!(aggregate_order(&aggs).unwrap(), vec![0, 1]);
    }

    #[test]
    fn by_value_cycle_is_reported_with_its_path() {
        let aggs = vec![
            agg("A", &[("b", named("B"))]),
            agg("B", &[("a", named("A"))]),
        ];
        let cycle = aggregate_order(&aggs).unwrap_err();
        assert_eq!(cycle.path, vec!["A", "B", "A"]);
    }
}
