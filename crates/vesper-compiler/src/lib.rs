//! Lowering pipeline for vesper graphs.
//!
//! This crate takes a graph built by a front end and lowers it into a form a
//! backend can execute. The pipeline runs one pass per compile phase, in a
//! fixed order:
//! 1. **Folding** - Replace compile-time-constant stages by their outputs,
//!    then collapse permute chains
//! 2. **Scales** - Propagate quantization scales
//! 3. **Orders** - Propagate memory orders to a fixed point, inserting
//!    conversions where consumers disagree
//! 4. **Strides** - Merge stride requirements
//! 5. **Batch** - Classify ports as batch-splittable
//! 6. **Finalize** - Lock layouts and finalize stages
//! 7. **Check** - Validate every stage against its finalized layout
//! 8. **Schedule** - Order stages topologically
//! 9. **Memory** - Assign buffers with lifetime-based reuse
//!
//! # Example
//!
//! ```no_run
//! use vesper_compiler::{compile, CompileOptions};
//! use vesper_core::{FoldRegistry, Graph, StageRecord};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = Graph::new();
//! let registry = FoldRegistry::new();
//!
//! let compiled = compile(graph, &registry, CompileOptions::default())?;
//! let mut records: Vec<StageRecord> = Vec::new();
//! compiled.serialize(&mut records)?;
//! println!("Arena of {} bytes", compiled.memory_plan().arena_size());
//! # Ok(())
//! # }
//! ```

pub mod compiled;
pub mod memory;
pub mod passes;
pub mod scheduler;

pub use compiled::CompiledGraph;
pub use memory::{plan_memory, plan_memory_with};
pub use passes::{
    BatchClassificationPass, ConstantFoldingPass, FinalCheckPass, FinalizeLayoutPass,
    MemoryPlanningPass, OrderPropagationPass, PermuteFusionPass, ScalePropagationPass,
    SchedulingPass, StridePropagationPass,
};
pub use scheduler::schedule;

use tracing::debug;
use vesper_core::{Diagnostic, Error, FoldRegistry, Graph, Pass, Result};

/// Compiler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Upper bound on order propagation sweeps before the layout is declared
    /// cyclic.
    pub max_order_sweeps: usize,

    /// Verify edge integrity after every pass.
    pub verify_integrity: bool,

    /// Run the constant evaluators. When off the folding phase is still
    /// established but nothing is folded.
    pub fold_constants: bool,

    /// Collapse permute chains and drop identity permutes after folding.
    pub fuse_permutes: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_order_sweeps: passes::DEFAULT_MAX_SWEEPS,
            verify_integrity: true,
            fold_constants: true,
            fuse_permutes: true,
        }
    }
}

/// Compiler pipeline with pluggable passes.
///
/// The built-in passes cover every phase in order. Extra passes can be added
/// with `add_pass()`; they run right after the built-in pass of their phase.
pub struct CompilerPipeline {
    /// All passes to run, ordered by (phase, registration order).
    passes: Vec<Box<dyn Pass>>,
    options: CompileOptions,
}

impl CompilerPipeline {
    /// Create a pipeline with the built-in passes.
    pub fn new(options: CompileOptions) -> Self {
        let max_sweeps = options.max_order_sweeps;
        let folding = if options.fold_constants {
            ConstantFoldingPass::new()
        } else {
            ConstantFoldingPass::disabled()
        };

        let fuse_permutes = options.fuse_permutes;

        let mut pipeline = Self {
            passes: Vec::new(),
            options,
        };
        pipeline
            .add_pass(folding);
        if fuse_permutes {
            pipeline.add_pass(PermuteFusionPass::new());
        }
        pipeline
            .add_pass(ScalePropagationPass::new())
            .add_pass(OrderPropagationPass::new(max_sweeps))
            .add_pass(StridePropagationPass::new())
            .add_pass(BatchClassificationPass::new())
            .add_pass(FinalizeLayoutPass::new())
            .add_pass(FinalCheckPass::new())
            .add_pass(SchedulingPass::new())
            .add_pass(MemoryPlanningPass::new());

        pipeline
    }

    /// Add a pass. It runs after every pass already registered for its phase.
    ///
    /// # Returns
    ///
    /// Returns a mutable reference to self for method chaining.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self.passes.sort_by_key(|p| p.phase());
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Pass names in execution order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run one pass, enforcing the phase order.
    ///
    /// A pass may run on a graph sitting at the phase before its own, or at
    /// its own phase (re-running the latest pass). Anything else is an
    /// internal error and the graph is left untouched.
    pub fn run_pass(
        &self,
        pass: &dyn Pass,
        graph: &mut Graph,
        registry: &FoldRegistry,
    ) -> Result<bool> {
        let phase = pass.phase();
        if !phase.can_run_after(graph.phase()) {
            return Err(Error::Internal(Diagnostic::new(
                pass.name(),
                format!(
                    "cannot establish {:?} on a graph at {:?}; {:?} must complete first",
                    phase,
                    graph.phase(),
                    phase.previous()
                ),
            )));
        }

        let _span = tracing::debug_span!("pass", name = pass.name(), phase = ?phase).entered();
        let changed = pass.run(graph, registry)?;
        graph.set_phase(phase);

        if self.options.verify_integrity {
            graph
                .verify_integrity()
                .map_err(|e| Error::Internal(Diagnostic::new(pass.name(), e.to_string())))?;
        }
        debug!(changed, "pass complete");
        Ok(changed)
    }

    /// Run every pass in phase order on a graph.
    pub fn run(&self, graph: &mut Graph, registry: &FoldRegistry) -> Result<()> {
        for pass in &self.passes {
            self.run_pass(pass.as_ref(), graph, registry)?;
        }
        Ok(())
    }

    /// Run the full pipeline and package the result.
    ///
    /// # Errors
    ///
    /// Returns an error if any pass fails; the graph is dropped and no
    /// partial result is returned.
    #[tracing::instrument(skip_all, fields(num_stages = graph.stage_count(), num_tensors = graph.tensor_count()))]
    pub fn compile(&self, mut graph: Graph, registry: &FoldRegistry) -> Result<CompiledGraph> {
        self.run(&mut graph, registry)?;
        CompiledGraph::new(graph)
    }
}

impl Default for CompilerPipeline {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

/// Compile a graph with the built-in pipeline.
pub fn compile(
    graph: Graph,
    registry: &FoldRegistry,
    options: CompileOptions,
) -> Result<CompiledGraph> {
    CompilerPipeline::new(options).compile(graph, registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::{DataType, Phase};

    #[test]
    fn test_builtin_pass_order() {
        let pipeline = CompilerPipeline::default();
        assert_eq!(
            pipeline.pass_names(),
            vec![
                "constant_folding",
                "permute_fusion",
                "scale_propagation",
                "order_propagation",
                "stride_propagation",
                "batch_classification",
                "finalize_layout",
                "final_check",
                "scheduling",
                "memory_planning",
            ]
        );
    }

    #[test]
    fn test_permute_fusion_can_be_turned_off() {
        let pipeline = CompilerPipeline::new(CompileOptions {
            fuse_permutes: false,
            ..CompileOptions::default()
        });
        assert!(!pipeline.pass_names().contains(&"permute_fusion"));
        assert_eq!(pipeline.pass_names()[1], "scale_propagation");
    }

    #[test]
    fn test_out_of_order_pass_is_internal() {
        let pipeline = CompilerPipeline::default();
        let mut graph = Graph::new();
        graph.add_input("x", DataType::F32, vec![4]);

        let err = pipeline
            .run_pass(&SchedulingPass::new(), &mut graph, &FoldRegistry::new())
            .unwrap_err();
        assert!(err.is_internal());
        assert_eq!(graph.phase(), Phase::Raw);
    }

    #[test]
    fn test_empty_graph_compiles() {
        let compiled = compile(Graph::new(), &FoldRegistry::new(), CompileOptions::default())
            .unwrap();
        assert!(compiled.schedule().is_empty());
        assert_eq!(compiled.graph().phase(), Phase::MemoryPlanned);
    }
}
