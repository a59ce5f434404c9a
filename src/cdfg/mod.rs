//! Control and data flow graphs of CIL method bodies.
//!
//! [`build`] runs up to four passes over a decoded body:
//!
//! 1. control flow: split the code into [`BasicBlock`]s at branch targets, after transfers, at
//!    exception region bounds and, when a [`LocalScopeProvider`] is given, at scope bounds; then
//!    connect them, branch targets before the fall through
//! 2. data flow: simulate the evaluation stack, so every [`Instruction`] knows the instructions
//!    whose values it pops. Values meeting at a join are collected by a synthetic instruction
//!    at the head of the block's operand stack
//! 3. types ([`GraphOptions::infer_types`]): the static type of each value
//! 4. handlers ([`GraphOptions::infer_handlers`]) and definitions
//!    ([`GraphOptions::track_locals`]): the protected regions and handler of each block, and
//!    for each local and argument read the definition it sees
//!
//! Everything the passes need to know about tokens is asked from a [`MetadataHost`].
//! [`ControlFlowQueries`] answers order and dominance questions over a finished graph, and
//! [`BlockPc`] walks it through `finally` handlers.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::assembly::{decode_operations, MethodBody};
//! use dotsym::cdfg::{build, GraphOptions};
//! use dotsym::host::{MethodContext, MethodSignature, SimpleHost, TypeRef};
//! use dotsym::token::Token;
//!
//! // ldarg.0; brtrue.s L; ldc.i4.0; ret; L: ldc.i4.1; ret
//! let body = MethodBody {
//!     max_stack: 1,
//!     local_signature_token: Token(0),
//!     init_locals: false,
//!     code: vec![0x02, 0x2D, 0x02, 0x16, 0x2A, 0x17, 0x2A],
//!     exception_handlers: Vec::new(),
//! };
//! let context = MethodContext::new(
//!     Token(0x0600_0001),
//!     MethodSignature::new(TypeRef::I32, vec![TypeRef::Boolean]),
//!     Vec::new(),
//! );
//!
//! let operations = decode_operations(&body.code)?;
//! let graph = build(
//!     &body,
//!     &operations,
//!     &context,
//!     &SimpleHost::new(),
//!     None,
//!     GraphOptions::full(),
//! )?;
//! assert_eq!(graph.all_blocks.len(), 3);
//! assert_eq!(graph.successors_of(graph.root_blocks[0]).len(), 2);
//! # Ok::<(), dotsym::Error>(())
//! ```

mod blockpc;
mod control;
mod dataflow;
mod graph;
mod handlers;
mod queries;
mod types;

use rayon::prelude::*;
use tracing::debug;

pub use blockpc::{successors, BlockPc};
pub use graph::{
    BasicBlock, BlockId, ControlAndDataFlowGraph, InstrId, InstrIndex, Instruction, Operand2,
};
pub use queries::ControlFlowQueries;

use crate::{
    assembly::{decode_operations, LocalScopeProvider, MethodBody, Operation},
    host::{MetadataHost, MethodContext},
    Result,
};

/// Which of the optional passes [`build`] runs.
///
/// Control and data flow are always inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphOptions {
    /// Assign [`Instruction::ty`]
    pub infer_types: bool,
    /// Fill [`BasicBlock::handlers`] and [`BasicBlock::containing_handler`]
    pub infer_handlers: bool,
    /// Fill the local and argument definitions of each block and the `aux` of reads
    pub track_locals: bool,
}

impl GraphOptions {
    /// Every pass
    #[must_use]
    pub const fn full() -> Self {
        GraphOptions {
            infer_types: true,
            infer_handlers: true,
            track_locals: true,
        }
    }

    /// Blocks, edges and operands only
    #[must_use]
    pub const fn control_flow_only() -> Self {
        GraphOptions {
            infer_types: false,
            infer_handlers: false,
            track_locals: false,
        }
    }
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self::full()
    }
}

/// Build the graph of one method body.
///
/// `operations` must be the decoded instructions of `body.code`, in order. Definition
/// tracking follows paths through `finally` handlers and therefore computes the handler
/// nesting even when [`GraphOptions::infer_handlers`] is off.
///
/// # Errors
/// - [`crate::Error::InvalidBranchTarget`] for a branch into the middle of an instruction
/// - [`crate::Error::Malformed`] for an exception region bound inside an instruction
/// - [`crate::Error::StackUnderflow`] for an instruction that pops more values than the stack
///   holds
/// - [`crate::Error::GraphError`] for non-contiguous operations, call sites the host has no
///   signature for, inconsistent stack depths at a join and overlapping protected regions
pub fn build(
    body: &MethodBody,
    operations: &[Operation],
    context: &MethodContext,
    host: &dyn MetadataHost,
    scopes: Option<&dyn LocalScopeProvider>,
    options: GraphOptions,
) -> Result<ControlAndDataFlowGraph> {
    let mut graph = control::infer(body, operations, scopes)?;
    dataflow::infer(&mut graph, context, host)?;

    if options.infer_types {
        types::infer(&mut graph, context, host);
    }
    if options.infer_handlers || options.track_locals {
        handlers::infer_handlers(&mut graph)?;
    }
    if options.track_locals {
        handlers::infer_locals(&mut graph, context, host, options.infer_types);
    }

    debug!(
        method = %context.token,
        blocks = graph.all_blocks.len(),
        instructions = graph.instruction_count(),
        "graph built"
    );
    Ok(graph)
}

/// One body for [`build_many`].
#[derive(Clone, Copy)]
pub struct MethodInput<'a> {
    /// The body
    pub body: &'a MethodBody,
    /// The method the body belongs to
    pub context: &'a MethodContext,
    /// Scopes of the method, if symbols are loaded
    pub scopes: Option<&'a (dyn LocalScopeProvider + Sync)>,
}

/// Decode and build several bodies in parallel. Results are in input order.
#[must_use]
pub fn build_many(
    inputs: &[MethodInput<'_>],
    host: &(dyn MetadataHost + Sync),
    options: GraphOptions,
) -> Vec<Result<ControlAndDataFlowGraph>> {
    inputs
        .par_iter()
        .map(|input| {
            let operations = decode_operations(&input.body.code)?;
            build(
                input.body,
                &operations,
                input.context,
                host,
                input.scopes.map(|scopes| scopes as &dyn LocalScopeProvider),
                options,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use crate::{
        assembly::{ExceptionHandler, HandlerKind, OperationValue, VariableKind},
        host::{MethodSignature, SimpleHost, TypeRef},
        token::Token,
    };

    fn body(code: Vec<u8>) -> MethodBody {
        MethodBody {
            max_stack: 8,
            local_signature_token: Token(0),
            init_locals: false,
            code,
            exception_handlers: Vec::new(),
        }
    }

    fn context(return_type: TypeRef, parameters: Vec<TypeRef>) -> MethodContext {
        MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(return_type, parameters),
            vec![TypeRef::I32],
        )
    }

    fn graph(body: &MethodBody, context: &MethodContext) -> ControlAndDataFlowGraph {
        let operations = decode_operations(&body.code).unwrap();
        build(
            body,
            &operations,
            context,
            &SimpleHost::new(),
            None,
            GraphOptions::full(),
        )
        .unwrap()
    }

    /// try { nop x 0x4B; leave 0x80 } finally { nop x 15; endfinally } nop x 32; ret
    fn finally_body() -> MethodBody {
        let mut code = vec![0x00; 0x4B];
        code.extend([0xDD, 0x30, 0x00, 0x00, 0x00]);
        code.extend([0x00; 15]);
        code.push(0xDC);
        code.extend([0x00; 32]);
        code.push(0x2A);

        let mut body = body(code);
        body.exception_handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_offset: 0,
            try_length: 0x50,
            handler_offset: 0x50,
            handler_length: 0x10,
            class_token: Token(0),
            filter_offset: 0,
        });
        body
    }

    fn samples() -> Vec<(MethodBody, MethodContext)> {
        vec![
            (
                body(vec![0x17, 0x2D, 0x01, 0x16, 0x2A]),
                context(TypeRef::Void, Vec::new()),
            ),
            (
                // ldarg.0; brtrue.s T; ldc.i4.0; br.s J; T: ldc.i4.1; J: ret
                body(vec![0x02, 0x2D, 0x03, 0x16, 0x2B, 0x01, 0x17, 0x2A]),
                context(TypeRef::I32, vec![TypeRef::Boolean]),
            ),
            (
                // ldc.i4.0; stloc.0; L: ldloc.0; ldc.i4.1; add; dup; stloc.0; ldc.i4.s 10;
                // blt.s L; ret
                body(vec![
                    0x16, 0x0A, 0x06, 0x17, 0x58, 0x25, 0x0A, 0x1F, 0x0A, 0x32, 0xF7, 0x2A,
                ]),
                context(TypeRef::Void, Vec::new()),
            ),
            (finally_body(), context(TypeRef::Void, Vec::new())),
            (
                // ldc.i4.0; L: ldc.i4.1; add; dup; ldc.i4.s 10; blt.s L; pop; ret
                body(vec![0x16, 0x17, 0x58, 0x25, 0x1F, 0x0A, 0x32, 0xF9, 0x26, 0x2A]),
                context(TypeRef::Void, Vec::new()),
            ),
        ]
    }

    /// Values on the stack when `id` exits
    fn exit_stack(
        graph: &ControlAndDataFlowGraph,
        id: BlockId,
        context: &MethodContext,
    ) -> Vec<InstrId> {
        let block = &graph.all_blocks[id.index()];
        let mut stack: Vec<InstrId> = (0..block.operand_stack.len())
            .map(|index| InstrId::stack(id, index))
            .collect();
        for (index, instruction) in block.instructions.iter().enumerate() {
            let Some(operation) = &instruction.operation else {
                continue;
            };
            if operation.opcode.is_leave() {
                stack.clear();
                continue;
            }
            let (pop, push) =
                super::dataflow::stack_effect(operation, context, &SimpleHost::new()).unwrap();
            stack.truncate(stack.len() - pop);
            stack.extend(std::iter::repeat(InstrId::body(id, index)).take(push));
        }
        stack
    }

    /// Definition of each variable when `id` exits, keyed by (is argument, index)
    fn exit_definitions(
        graph: &ControlAndDataFlowGraph,
        id: BlockId,
    ) -> BTreeMap<(bool, u16), InstrId> {
        let block = &graph.all_blocks[id.index()];
        let mut current = entry_definitions(block);
        for instruction in &block.instructions {
            let Some(operation) = &instruction.operation else {
                continue;
            };
            let Some((kind, implied)) = operation.opcode.variable_access() else {
                continue;
            };
            if !operation.opcode.is_store() {
                continue;
            }
            let index = implied.or(match operation.value {
                OperationValue::Local(index) | OperationValue::Argument(index) => Some(index),
                _ => None,
            });
            if let (Some(index), Some(value)) = (index, instruction.operand1) {
                current.insert((kind == VariableKind::Argument, index), value);
            }
        }
        current
    }

    fn entry_definitions(block: &BasicBlock) -> BTreeMap<(bool, u16), InstrId> {
        block
            .local_defs
            .iter()
            .map(|(index, id)| ((false, *index), *id))
            .chain(block.param_defs.iter().map(|(index, id)| ((true, *index), *id)))
            .collect()
    }

    #[test]
    fn conditional_example() {
        // ldc.i4.1; brtrue L; ldc.i4.0; L: ret
        let (body, context) = samples().remove(0);
        let graph = graph(&body, &context);
        assert_eq!(graph.all_blocks.len(), 3);
        assert_eq!(graph.successors_of(graph.root_blocks[0]).len(), 2);
    }

    #[test]
    fn finally_threading() {
        let body = finally_body();
        let graph = graph(&body, &context(TypeRef::Void, Vec::new()));

        let after_try = successors(&graph, &BlockPc::new(0));
        assert_eq!(after_try.len(), 1);
        assert_eq!(after_try[0].offsets(), vec![0x50, 0x80]);

        let after_finally = successors(&graph, &after_try[0]);
        assert_eq!(after_finally.len(), 1);
        assert_eq!(after_finally[0].offsets(), vec![0x80]);
        assert!(successors(&graph, &after_finally[0]).is_empty());
    }

    #[test]
    fn finally_threading_without_handler_inference() {
        let body = finally_body();
        let operations = decode_operations(&body.code).unwrap();
        let graph = build(
            &body,
            &operations,
            &context(TypeRef::Void, Vec::new()),
            &SimpleHost::new(),
            None,
            GraphOptions::control_flow_only(),
        )
        .unwrap();
        assert!(graph.all_blocks.iter().all(|block| block.handlers.is_empty()));

        let after_try = successors(&graph, &BlockPc::new(0));
        assert_eq!(after_try.len(), 1);
        assert_eq!(after_try[0].offsets(), vec![0x50, 0x80]);
        assert_eq!(successors(&graph, &after_try[0])[0].offsets(), vec![0x80]);
    }

    #[test]
    fn well_formed() {
        for (body, context) in samples() {
            let graph = graph(&body, &context);

            let mut expected = 0;
            for (id, block) in graph.blocks() {
                assert_eq!(block.offset, expected, "blocks must cover the code");
                assert!(block.end > block.offset);
                assert_eq!(graph.block_at(block.offset), Some(id));
                for instruction in &block.instructions {
                    let offset = instruction.offset().unwrap();
                    assert!(block.offset <= offset && offset < block.end);
                }
                for successor in graph.successors_of(id) {
                    assert!(successor.index() < graph.all_blocks.len());
                }
                expected = block.end;
            }
            assert_eq!(expected as usize, body.code.len());
            assert_eq!(graph.block_for.len(), graph.all_blocks.len());
        }
    }

    #[test]
    fn merges_are_sound() {
        for (body, context) in samples() {
            let graph = graph(&body, &context);
            let queries = ControlFlowQueries::new(&graph);

            for (id, block) in graph.blocks() {
                for entry in block.operand_stack.iter().chain(&block.definitions) {
                    assert!(entry.operation.is_none());
                    let operands: Vec<InstrId> = entry.operands().collect();
                    assert_eq!(entry.is_merge, operands.len() > 1);
                    for (position, operand) in operands.iter().enumerate() {
                        assert!(!operands[..position].contains(operand));
                        assert!(graph.instruction(*operand).is_some());
                    }
                }

                // Each stack slot merges exactly the distinct values the predecessors leave
                let incoming: Vec<Vec<InstrId>> = queries
                    .predecessors_of(id)
                    .iter()
                    .map(|predecessor| exit_stack(&graph, *predecessor, &context))
                    .filter(|stack| !stack.is_empty())
                    .collect();
                if !incoming.is_empty() {
                    assert_eq!(block.operand_stack.len(), incoming[0].len());
                }
                for (position, entry) in block.operand_stack.iter().enumerate() {
                    let expected: BTreeSet<InstrId> =
                        incoming.iter().map(|stack| stack[position]).collect();
                    let actual: BTreeSet<InstrId> = entry.operands().collect();
                    assert_eq!(actual, expected, "stack slot {position} of {id:?}");
                }

                // Handler entries also receive definitions from the protected blocks
                if !body.exception_handlers.is_empty() {
                    continue;
                }
                let mut expected: BTreeMap<(bool, u16), BTreeSet<InstrId>> = BTreeMap::new();
                for predecessor in queries.predecessors_of(id) {
                    for (variable, definition) in exit_definitions(&graph, *predecessor) {
                        expected.entry(variable).or_default().insert(definition);
                    }
                }
                if graph.root_blocks.first() == Some(&id) {
                    for index in 0..graph.parameters.len() {
                        let parameter = InstrId {
                            block: id,
                            index: InstrIndex::Parameter(index),
                        };
                        let key = (true, u16::try_from(index).unwrap());
                        expected.entry(key).or_default().insert(parameter);
                    }
                }
                let actual: BTreeMap<(bool, u16), BTreeSet<InstrId>> = entry_definitions(block)
                    .into_iter()
                    .map(|(variable, id)| {
                        let merge = graph.instruction(id).unwrap();
                        (variable, merge.operands().collect())
                    })
                    .collect();
                assert_eq!(actual, expected, "definitions at {id:?}");
            }
        }
    }

    #[test]
    fn stack_merge_across_a_back_edge() {
        let (body, context) = samples().remove(4);
        let graph = graph(&body, &context);
        assert_eq!(graph.all_blocks.len(), 3);

        let header = graph.block_at(1).unwrap();
        let slot = &graph.block(header).unwrap().operand_stack;
        assert_eq!(slot.len(), 1);
        assert!(slot[0].is_merge);
        let operands: Vec<InstrId> = slot[0].operands().collect();
        assert_eq!(
            operands,
            vec![InstrId::body(graph.root_blocks[0], 0), InstrId::body(header, 2)]
        );
    }

    #[test]
    fn loop_carries_a_merge() {
        let (body, context) = samples().remove(2);
        let graph = graph(&body, &context);
        assert_eq!(graph.all_blocks.len(), 3);

        let ldloc = graph.instruction(graph.instruction_at(2).unwrap()).unwrap();
        let definition = graph.instruction(ldloc.aux.unwrap()).unwrap();
        assert!(definition.is_merge);
        assert_eq!(definition.operands().count(), 2);
        assert_eq!(definition.ty, TypeRef::I32);
    }

    #[test]
    fn control_flow_only_skips_types() {
        let (body, context) = samples().remove(1);
        let operations = decode_operations(&body.code).unwrap();
        let graph = build(
            &body,
            &operations,
            &context,
            &SimpleHost::new(),
            None,
            GraphOptions::control_flow_only(),
        )
        .unwrap();
        assert!(graph
            .all_blocks
            .iter()
            .flat_map(|block| &block.instructions)
            .all(|instruction| instruction.ty.is_unknown() && instruction.aux.is_none()));
        assert!(graph.parameters.is_empty());
    }

    #[test]
    fn parallel_build() {
        let samples = samples();
        let inputs: Vec<MethodInput<'_>> = samples
            .iter()
            .map(|(body, context)| MethodInput {
                body,
                context,
                scopes: None,
            })
            .collect();
        let graphs = build_many(&inputs, &SimpleHost::new(), GraphOptions::full());

        assert_eq!(graphs.len(), samples.len());
        for ((body, context), built) in samples.iter().zip(graphs) {
            assert_eq!(built.unwrap(), graph(body, context));
        }
    }
}
