//! DOT graph visualization of the IR.
//!
//! Stages are boxes, tensors are ellipses annotated with their layout state;
//! constants are dashed and boundary tensors bold.

use std::fmt::Write;

use crate::ir::Graph;
use crate::plan::Region;

/// Generate a Graphviz DOT description of a graph.
///
/// Stages are listed in the graph's iteration order (schedule order once
/// scheduled) and labeled with their position.
///
/// # Example
///
/// ```ignore
/// std::fs::write("model.dot", to_dot(&graph))?;
/// // Render with: dot -Tpng model.dot -o model.png
/// ```
pub fn to_dot(graph: &Graph) -> String {
    let mut dot = String::new();
    dot.push_str("digraph vesper_graph {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=rounded];\n\n");

    for (id, desc) in graph.tensors() {
        let order = desc
            .order
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "?".to_string());
        let mut label = format!(
            "{}\\n{:?} {:?}\\norder={} scale={} strides={:?}",
            escape(&desc.name),
            desc.dtype,
            desc.shape,
            order,
            desc.scale,
            desc.strides
        );
        if let Some(region) = graph.memory_plan().and_then(|p| p.tensor(id)) {
            if let Region::Arena { offset, size } = region.region {
                let _ = write!(label, "\\narena[{offset}..{}]", offset + size);
            }
        }

        let style = if desc.is_constant() {
            ", style=dashed, color=blue"
        } else if graph.is_boundary(id) {
            ", style=bold, color=green"
        } else if desc.persistent.is_some() {
            ", style=bold, color=purple"
        } else {
            ""
        };
        let _ = writeln!(
            dot,
            "  t{} [label=\"{}\", shape=ellipse{}];",
            id.index(),
            label,
            style
        );
    }
    dot.push('\n');

    for (position, &stage) in graph.stages().iter().enumerate() {
        let Ok(node) = graph.stage(stage) else {
            continue;
        };
        let _ = writeln!(
            dot,
            "  s{} [label=\"{} [#{}]\\n{}\"];",
            stage.index(),
            node.kind(),
            position,
            escape(&node.name)
        );
        for (port, &input) in node.inputs().iter().enumerate() {
            let _ = writeln!(
                dot,
                "  t{} -> s{} [label=\"{}\"];",
                input.index(),
                stage.index(),
                port
            );
        }
        for (port, &output) in node.outputs().iter().enumerate() {
            let _ = writeln!(
                dot,
                "  s{} -> t{} [label=\"{}\"];",
                stage.index(),
                output.index(),
                port
            );
        }
    }

    dot.push_str("}\n");
    dot
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
