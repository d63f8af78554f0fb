//! Topological scheduling of stages.
//!
//! Kahn's algorithm over the producer/consumer dependencies, always picking
//! the ready stage that was inserted first so the order is deterministic.
//!
//! Memory feedback is not a dependency: a `MemoryRead` observes the state
//! left by the previous execution, so the write→read edge counts as
//! satisfied when scheduling starts. Instead, the `MemoryWrite` of a state
//! waits for its `MemoryRead` and for every stage consuming the value read,
//! since the write overwrites that buffer. The write has no outputs, so these
//! extra edges cannot close a cycle.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use tracing::trace;
use vesper_core::{Error, Graph, Op, Result, StageId, StateId};

/// Order every live stage so producers precede their consumers.
///
/// Ties between ready stages are broken by insertion order. A dependency
/// cycle is reported as [`Error::Cycle`] naming the stages involved.
pub fn schedule(graph: &Graph) -> Result<Vec<StageId>> {
    let stages = graph.stages();
    let position: HashMap<StageId, usize> =
        stages.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let readers = state_readers(graph)?;
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    let mut in_degree = vec![0usize; stages.len()];
    for (consumer, &id) in stages.iter().enumerate() {
        for producer in dependencies(graph, id, &position, &readers)? {
            successors[producer].push(consumer);
            in_degree[consumer] += 1;
        }
    }

    let mut seq = Vec::with_capacity(stages.len());
    for &id in stages {
        seq.push(graph.stage(id)?.seq());
    }

    let mut ready: BinaryHeap<Reverse<(u64, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| Reverse((seq[i], i)))
        .collect();

    let mut order = Vec::with_capacity(stages.len());
    while let Some(Reverse((_, next))) = ready.pop() {
        order.push(stages[next]);
        for &succ in &successors[next] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.push(Reverse((seq[succ], succ)));
            }
        }
    }

    if order.len() != stages.len() {
        return Err(cycle_error(stages, &successors, &in_degree));
    }
    trace!(stages = order.len(), "scheduled");
    Ok(order)
}

/// Positions of the stages `id` must wait for.
fn dependencies(
    graph: &Graph,
    id: StageId,
    position: &HashMap<StageId, usize>,
    readers: &HashMap<StateId, Vec<StageId>>,
) -> Result<BTreeSet<usize>> {
    let node = graph.stage(id)?;
    let mut deps = BTreeSet::new();
    for &input in node.inputs() {
        if let Some(edge) = graph.producer(input) {
            if edge.stage != id {
                if let Some(&pos) = position.get(&edge.stage) {
                    deps.insert(pos);
                }
            }
        }
    }
    if let Op::MemoryWrite(write) = node.op() {
        for reader in readers.get(&write.state).into_iter().flatten() {
            if *reader == id {
                continue;
            }
            if let Some(&pos) = position.get(reader) {
                deps.insert(pos);
            }
        }
    }
    Ok(deps)
}

/// Every `MemoryRead` of each state together with the consumers of the
/// value it reads.
fn state_readers(graph: &Graph) -> Result<HashMap<StateId, Vec<StageId>>> {
    let mut readers: HashMap<StateId, Vec<StageId>> = HashMap::new();
    for &id in graph.stages() {
        let node = graph.stage(id)?;
        let Op::MemoryRead(read) = node.op() else {
            continue;
        };
        let entry = readers.entry(read.state).or_default();
        entry.push(id);
        for &output in node.outputs() {
            entry.extend(graph.consumers(output).iter().map(|edge| edge.stage));
        }
    }
    Ok(readers)
}

/// Name the stages of every cycle among the stages Kahn's algorithm could
/// not release.
fn cycle_error(stages: &[StageId], successors: &[Vec<usize>], in_degree: &[usize]) -> Error {
    let mut dep_graph = DiGraph::<usize, ()>::new();
    let mut nodes = HashMap::new();
    for (i, &degree) in in_degree.iter().enumerate() {
        if degree > 0 {
            nodes.insert(i, dep_graph.add_node(i));
        }
    }
    for (from, succs) in successors.iter().enumerate() {
        for to in succs {
            if let (Some(&a), Some(&b)) = (nodes.get(&from), nodes.get(to)) {
                dep_graph.add_edge(a, b, ());
            }
        }
    }

    let mut cyclic: Vec<usize> = tarjan_scc(&dep_graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .flatten()
        .map(|node| stages[dep_graph[node]].index())
        .collect();
    if cyclic.is_empty() {
        // Stages downstream of a cycle only; report everything left over.
        cyclic = nodes.keys().map(|&i| stages[i].index()).collect();
    }
    cyclic.sort_unstable();
    Error::Cycle { stages: cyclic }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::ops::{Activation, BinaryOp, MemoryRead, MemoryWrite};
    use vesper_core::{DataType, TensorDesc, TensorId};

    fn tensor(graph: &mut Graph, name: &str) -> TensorId {
        graph.add_tensor(TensorDesc::new(name, DataType::F32, vec![1, 8]))
    }

    #[test]
    fn test_simple_schedule() {
        // c is inserted first but depends on b, which depends on a.
        let mut graph = Graph::new();
        let x = graph.add_input("x", DataType::F32, vec![1, 8]);
        let t0 = tensor(&mut graph, "t0");
        let t1 = tensor(&mut graph, "t1");
        let t2 = tensor(&mut graph, "t2");
        let relu = || Op::Activation(Activation::Relu);

        let c = graph.add_stage("c", relu(), vec![t1], vec![t2]).unwrap();
        let b = graph.add_stage("b", relu(), vec![t0], vec![t1]).unwrap();
        let a = graph.add_stage("a", relu(), vec![x], vec![t0]).unwrap();

        assert_eq!(schedule(&graph).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", DataType::F32, vec![1, 8]);
        let t0 = tensor(&mut graph, "t0");
        let t1 = tensor(&mut graph, "t1");
        let t2 = tensor(&mut graph, "t2");
        let relu = || Op::Activation(Activation::Relu);

        let a = graph.add_stage("a", relu(), vec![x], vec![t0]).unwrap();
        let b = graph.add_stage("b", relu(), vec![x], vec![t1]).unwrap();
        let join = graph
            .add_stage("join", Op::Binary(BinaryOp::Add), vec![t0, t1], vec![t2])
            .unwrap();

        assert_eq!(schedule(&graph).unwrap(), vec![a, b, join]);
    }

    #[test]
    fn test_memory_read_precedes_write() {
        let mut graph = Graph::new();
        let state = StateId(0);
        let x = graph.add_input("x", DataType::F32, vec![1, 8]);
        let h = tensor(&mut graph, "h");
        let next = tensor(&mut graph, "next");

        // Write inserted before read: only the ordering constraint places it.
        let write = graph
            .add_stage("write", Op::MemoryWrite(MemoryWrite { state }), vec![x], vec![])
            .unwrap();
        let read = graph
            .add_stage("read", Op::MemoryRead(MemoryRead { state }), vec![], vec![h])
            .unwrap();
        let step = graph
            .add_stage("step", Op::Binary(BinaryOp::Add), vec![h, x], vec![next])
            .unwrap();

        let order = schedule(&graph).unwrap();
        let pos = |id| order.iter().position(|&s| s == id).unwrap();
        assert!(pos(read) < pos(write));
        assert!(pos(read) < pos(step));
    }

    #[test]
    fn test_write_waits_for_late_readers() {
        let mut graph = Graph::new();
        let state = StateId(3);
        let h = tensor(&mut graph, "h");
        let next = tensor(&mut graph, "next");
        let out = tensor(&mut graph, "out");

        let read = graph
            .add_stage("read", Op::MemoryRead(MemoryRead { state }), vec![], vec![h])
            .unwrap();
        graph
            .add_stage("step", Op::Activation(Activation::Sigmoid), vec![h], vec![next])
            .unwrap();
        let write = graph
            .add_stage("write", Op::MemoryWrite(MemoryWrite { state }), vec![next], vec![])
            .unwrap();
        // Inserted last, so only the reader constraint keeps it before the write.
        let late = graph
            .add_stage("late", Op::Activation(Activation::Relu), vec![h], vec![out])
            .unwrap();

        let order = schedule(&graph).unwrap();
        let pos = |id| order.iter().position(|&s| s == id).unwrap();
        assert!(pos(read) < pos(late));
        assert!(pos(late) < pos(write));
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", DataType::F32, vec![1, 8]);
        let t0 = tensor(&mut graph, "t0");
        let t1 = tensor(&mut graph, "t1");
        let add = || Op::Binary(BinaryOp::Add);

        let a = graph.add_stage("a", add(), vec![x, x], vec![t0]).unwrap();
        let b = graph.add_stage("b", add(), vec![t0, x], vec![t1]).unwrap();
        graph.rewire_input(a, 1, t1).unwrap();

        match schedule(&graph) {
            Err(Error::Cycle { stages }) => {
                assert_eq!(stages, vec![a.index(), b.index()]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }
}
