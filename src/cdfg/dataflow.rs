//! Operand stack simulation: connect every instruction to the instructions that produced the
//! values it pops.

use tracing::trace;

use crate::{
    assembly::{HandlerKind, OpCode, Operation, StackPop, StackPush},
    cdfg::graph::{BlockId, ControlAndDataFlowGraph, InstrId, Instruction, Operand2},
    host::{MetadataHost, MethodContext, TypeRef},
    Error, Result,
};

/// Values popped and pushed by `operation`
pub(crate) fn stack_effect(
    operation: &Operation,
    context: &MethodContext,
    host: &dyn MetadataHost,
) -> Result<(usize, usize)> {
    let signature_error = || {
        Error::GraphError(format!(
            "no signature for the operand of {} at 0x{:04X}",
            operation.opcode, operation.offset
        ))
    };

    match operation.opcode {
        OpCode::Ret => Ok((usize::from(context.signature.returns_value()), 0)),
        OpCode::Call | OpCode::Callvirt => {
            let token = operation.token().ok_or_else(signature_error)?;
            let signature = host.method_signature(token).ok_or_else(signature_error)?;
            Ok((
                signature.argument_count(),
                usize::from(signature.returns_value()),
            ))
        }
        OpCode::Newobj => {
            let token = operation.token().ok_or_else(signature_error)?;
            let signature = host.method_signature(token).ok_or_else(signature_error)?;
            Ok((signature.parameters.len(), 1))
        }
        OpCode::Calli => {
            let token = operation.token().ok_or_else(signature_error)?;
            let signature = host
                .standalone_signature(token)
                .ok_or_else(signature_error)?;
            Ok((
                signature.argument_count() + 1,
                usize::from(signature.returns_value()),
            ))
        }
        opcode => match opcode.stack_behaviour() {
            (StackPop::Fixed(pop), StackPush::Fixed(push)) => {
                Ok((usize::from(pop), usize::from(push)))
            }
            _ => Err(signature_error()),
        },
    }
}

/// Fill operands and operand stacks. Blocks are visited in [`ControlAndDataFlowGraph::flow_order`].
pub(crate) fn infer(
    graph: &mut ControlAndDataFlowGraph,
    context: &MethodContext,
    host: &dyn MetadataHost,
) -> Result<()> {
    add_exception_values(graph, host);

    for block_id in graph.flow_order() {
        let stack = simulate_block(graph, block_id, context, host)?;
        let successors = graph.successors_of(block_id).to_vec();
        for successor in successors {
            flow_into(graph, successor, &stack)?;
        }
    }
    Ok(())
}

/// Catch handlers and filters start with the exception object on the stack
fn add_exception_values(graph: &mut ControlAndDataFlowGraph, host: &dyn MetadataHost) {
    let mut entries = Vec::new();
    for clause in &graph.body.exception_handlers {
        match clause.kind {
            HandlerKind::Catch => {
                let ty = host
                    .resolve_type(clause.class_token)
                    .unwrap_or(TypeRef::Object);
                entries.push((clause.handler_offset, ty));
            }
            HandlerKind::Filter => {
                entries.push((clause.filter_offset, TypeRef::Object));
                entries.push((clause.handler_offset, TypeRef::Object));
            }
            HandlerKind::Finally | HandlerKind::Fault => {}
        }
    }

    for (offset, ty) in entries {
        if let Some(id) = graph.block_at(offset) {
            graph.all_blocks[id.0].operand_stack = vec![Instruction {
                ty,
                ..Instruction::default()
            }];
        }
    }
}

fn simulate_block(
    graph: &mut ControlAndDataFlowGraph,
    block_id: BlockId,
    context: &MethodContext,
    host: &dyn MetadataHost,
) -> Result<Vec<InstrId>> {
    let block = &mut graph.all_blocks[block_id.0];
    let mut stack: Vec<InstrId> = (0..block.operand_stack.len())
        .map(|index| InstrId::stack(block_id, index))
        .collect();

    for (index, instruction) in block.instructions.iter_mut().enumerate() {
        let Some(operation) = &instruction.operation else {
            continue;
        };
        if operation.opcode.is_leave() {
            stack.clear();
            continue;
        }

        let (pop, push) = stack_effect(operation, context, host)?;
        if stack.len() < pop {
            return Err(Error::StackUnderflow(operation.offset));
        }
        let popped = stack.split_off(stack.len() - pop);
        instruction.operand1 = popped.first().copied();
        instruction.operand2 = popped
            .get(1..)
            .map_or(Operand2::None, Operand2::from_slice);

        let produced = InstrId::body(block_id, index);
        stack.extend(std::iter::repeat(produced).take(push));
    }
    Ok(stack)
}

/// Record the values left on the stack as incoming values of `successor`'s operand stack.
///
/// An empty stack contributes nothing. The first non-empty stack fixes the depth; later stacks
/// must match it.
fn flow_into(
    graph: &mut ControlAndDataFlowGraph,
    successor: BlockId,
    stack: &[InstrId],
) -> Result<()> {
    if stack.is_empty() {
        return Ok(());
    }

    let block = &mut graph.all_blocks[successor.0];
    if block.operand_stack.is_empty() {
        block.operand_stack = stack
            .iter()
            .map(|value| Instruction::incoming(*value))
            .collect();
        return Ok(());
    }
    if block.operand_stack.len() != stack.len() {
        return Err(Error::GraphError(format!(
            "stack depth {} flows into block 0x{:04X} entered with depth {}",
            stack.len(),
            block.offset,
            block.operand_stack.len()
        )));
    }

    for (slot, value) in block.operand_stack.iter_mut().zip(stack) {
        slot.add_incoming(*value);
    }
    trace!(block = block.offset, depth = stack.len(), "merged operand stack");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{decode_operations, MethodBody},
        cdfg::control,
        host::{MethodSignature, SimpleHost},
        token::Token,
    };

    fn build(
        code: &[u8],
        context: &MethodContext,
        host: &SimpleHost,
    ) -> Result<ControlAndDataFlowGraph> {
        let body = MethodBody {
            max_stack: 8,
            local_signature_token: Token(0),
            init_locals: false,
            code: code.to_vec(),
            exception_handlers: Vec::new(),
        };
        let operations = decode_operations(&body.code)?;
        let mut graph = control::infer(&body, &operations, None)?;
        infer(&mut graph, context, host)?;
        Ok(graph)
    }

    fn returning(ty: TypeRef, parameters: Vec<TypeRef>) -> MethodContext {
        MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(ty, parameters),
            Vec::new(),
        )
    }

    #[test]
    fn straight_line_operands() {
        // ldarg.0; ldarg.1; add; ret
        let context = returning(TypeRef::I32, vec![TypeRef::I32, TypeRef::I32]);
        let graph = build(&[0x02, 0x03, 0x58, 0x2A], &context, &SimpleHost::new()).unwrap();
        let block = &graph.all_blocks[0];

        let add = &block.instructions[2];
        assert_eq!(add.operand1, Some(InstrId::body(BlockId(0), 0)));
        assert_eq!(add.operand2, Operand2::One(InstrId::body(BlockId(0), 1)));
        assert_eq!(block.instructions[3].operand1, Some(InstrId::body(BlockId(0), 2)));
    }

    #[test]
    fn call_arguments() {
        // ldc.i4.1; ldc.i4.2; ldc.i4.3; call M; pop; ret
        let method = Token(0x0A00_0001);
        let host = SimpleHost::new().with_method(
            method,
            MethodSignature::new(TypeRef::I32, vec![TypeRef::I32; 3]),
        );
        #[rustfmt::skip]
        let code = [0x17, 0x18, 0x19, 0x28, 0x01, 0x00, 0x00, 0x0A, 0x26, 0x2A];
        let graph = build(&code, &returning(TypeRef::Void, Vec::new()), &host).unwrap();

        let call = &graph.all_blocks[0].instructions[3];
        assert_eq!(call.operand1, Some(InstrId::body(BlockId(0), 0)));
        assert_eq!(
            call.operand2,
            Operand2::Many(vec![
                InstrId::body(BlockId(0), 1),
                InstrId::body(BlockId(0), 2)
            ])
        );
        let pop = &graph.all_blocks[0].instructions[4];
        assert_eq!(pop.operand1, Some(InstrId::body(BlockId(0), 3)));

        let unknown = build(&code, &returning(TypeRef::Void, Vec::new()), &SimpleHost::new());
        assert!(matches!(unknown, Err(Error::GraphError(_))));
    }

    #[test]
    fn merge_at_join() {
        // ldarg.0; brtrue.s T; ldc.i4.0; br.s J; T: ldc.i4.1; J: ret
        let context = returning(TypeRef::I32, vec![TypeRef::Boolean]);
        let code = [0x02, 0x2D, 0x03, 0x16, 0x2B, 0x01, 0x17, 0x2A];
        let graph = build(&code, &context, &SimpleHost::new()).unwrap();

        let join = graph.block_at(7).unwrap();
        let entry = &graph.all_blocks[join.0].operand_stack;
        assert_eq!(entry.len(), 1);
        assert!(entry[0].is_merge);

        let incoming: Vec<u32> = entry[0]
            .operands()
            .map(|id| graph.instruction(id).unwrap().offset().unwrap())
            .collect();
        assert_eq!(incoming.len(), 2);
        assert!(incoming.contains(&3) && incoming.contains(&6));

        let ret = &graph.all_blocks[join.0].instructions[0];
        assert_eq!(ret.operand1, Some(InstrId::stack(join, 0)));
    }

    #[test]
    fn dup_pushes_itself_twice() {
        // ldc.i4.5; dup; add; ret
        let context = returning(TypeRef::I32, Vec::new());
        let graph = build(&[0x1B, 0x25, 0x58, 0x2A], &context, &SimpleHost::new()).unwrap();
        let add = &graph.all_blocks[0].instructions[2];
        assert_eq!(add.operand1, Some(InstrId::body(BlockId(0), 1)));
        assert_eq!(add.operand2, Operand2::One(InstrId::body(BlockId(0), 1)));
    }

    #[test]
    fn underflow_is_reported() {
        // pop; ret
        let context = returning(TypeRef::Void, Vec::new());
        let result = build(&[0x26, 0x2A], &context, &SimpleHost::new());
        assert!(matches!(result, Err(Error::StackUnderflow(0))));
    }
}
