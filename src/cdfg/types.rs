//! Static types of the values instructions produce.

use tracing::trace;

use crate::{
    assembly::{OpCode, OperationValue, StackPush},
    cdfg::graph::{ControlAndDataFlowGraph, InstrId, Instruction},
    host::{MetadataHost, MethodContext, TypeRef},
    token::Token,
};

/// Combine the types of values that reach the same slot.
///
/// Equal types merge to themselves, reference types to their common base, values whose stack
/// types agree to that stack type. Anything else is [`TypeRef::Unknown`]; unknown inputs are
/// ignored.
pub(crate) fn merge_types<'a>(
    types: impl IntoIterator<Item = &'a TypeRef>,
    host: &dyn MetadataHost,
) -> TypeRef {
    let mut merged: Option<TypeRef> = None;
    for ty in types {
        if ty.is_unknown() {
            continue;
        }
        merged = Some(match merged {
            None => ty.clone(),
            Some(current) if current == *ty => current,
            Some(current) if host.is_reference_type(&current) && host.is_reference_type(ty) => {
                host.common_base(&current, ty)
            }
            Some(current) if current.stack_type() == ty.stack_type() => current.stack_type(),
            Some(_) => return TypeRef::Unknown,
        });
    }
    merged.unwrap_or_default()
}

/// Assign [`Instruction::ty`] to every real instruction and operand stack entry.
///
/// Operand stack entries depend on instructions in predecessor blocks, so the pass repeats
/// until no type changes.
pub(crate) fn infer(
    graph: &mut ControlAndDataFlowGraph,
    context: &MethodContext,
    host: &dyn MetadataHost,
) {
    let order = graph.flow_order();
    let limit = graph.all_blocks.len() + 2;
    for round in 0..limit {
        let mut changed = false;
        for block_id in &order {
            let block = &graph.all_blocks[block_id.0];
            let mut updates = Vec::new();

            for (index, entry) in block.operand_stack.iter().enumerate() {
                if entry.operand1.is_none() {
                    continue;
                }
                let ty = merge_types(
                    entry
                        .operands()
                        .filter_map(|id| graph.instruction(id))
                        .map(|incoming| &incoming.ty),
                    host,
                );
                if ty != entry.ty {
                    updates.push((InstrId::stack(*block_id, index), ty));
                }
            }
            for (index, instruction) in block.instructions.iter().enumerate() {
                let ty = result_type(graph, instruction, context, host);
                if ty != instruction.ty {
                    updates.push((InstrId::body(*block_id, index), ty));
                }
            }

            changed |= !updates.is_empty();
            for (id, ty) in updates {
                if let Some(instruction) = graph.instruction_mut(id) {
                    instruction.ty = ty;
                }
            }
        }
        if !changed {
            trace!(rounds = round + 1, "types inferred");
            return;
        }
    }
}

fn operand_type(graph: &ControlAndDataFlowGraph, id: Option<InstrId>) -> TypeRef {
    id.and_then(|id| graph.instruction(id))
        .map(|instruction| instruction.ty.clone())
        .unwrap_or_default()
}

/// Type of a value computed from two operands of the given types
fn binary_numeric(left: &TypeRef, right: &TypeRef) -> TypeRef {
    let (left, right) = (left.stack_type(), right.stack_type());
    match (&left, &right) {
        _ if left == right => left,
        (TypeRef::I32, TypeRef::NativeInt) | (TypeRef::NativeInt, TypeRef::I32) => {
            TypeRef::NativeInt
        }
        (pointer, TypeRef::I32 | TypeRef::NativeInt) if pointer.is_pointer() => left,
        (TypeRef::I32 | TypeRef::NativeInt, pointer) if pointer.is_pointer() => right,
        (TypeRef::ManagedPointer(_), TypeRef::ManagedPointer(_)) => TypeRef::NativeInt,
        _ => TypeRef::Unknown,
    }
}

fn resolve(host: &dyn MetadataHost, token: Option<Token>) -> TypeRef {
    token.and_then(|token| host.resolve_type(token)).unwrap_or_default()
}

/// The type `instruction` pushes, [`TypeRef::Void`] if it pushes nothing
#[allow(clippy::too_many_lines)]
fn result_type(
    graph: &ControlAndDataFlowGraph,
    instruction: &Instruction,
    context: &MethodContext,
    host: &dyn MetadataHost,
) -> TypeRef {
    let Some(operation) = &instruction.operation else {
        return instruction.ty.clone();
    };
    let token = operation.token();
    let first = || operand_type(graph, instruction.operand1);
    let second = || operand_type(graph, instruction.operand2.as_slice().first().copied());

    match operation.opcode {
        OpCode::LdcI4M1
        | OpCode::LdcI40
        | OpCode::LdcI41
        | OpCode::LdcI42
        | OpCode::LdcI43
        | OpCode::LdcI44
        | OpCode::LdcI45
        | OpCode::LdcI46
        | OpCode::LdcI47
        | OpCode::LdcI48
        | OpCode::LdcI4S
        | OpCode::LdcI4 => TypeRef::I32,
        OpCode::LdcI8 => TypeRef::I64,
        OpCode::LdcR4 => TypeRef::F32,
        OpCode::LdcR8 => TypeRef::F64,
        OpCode::Ldnull => TypeRef::Object,
        OpCode::Ldstr => TypeRef::String,

        OpCode::Ldarg0
        | OpCode::Ldarg1
        | OpCode::Ldarg2
        | OpCode::Ldarg3
        | OpCode::LdargS
        | OpCode::Ldarg => match operation.value {
            OperationValue::Argument(index) => context.argument_type(index),
            _ => TypeRef::Unknown,
        },
        OpCode::LdargaS | OpCode::Ldarga => match operation.value {
            OperationValue::Argument(index) => TypeRef::by_ref(context.argument_type(index)),
            _ => TypeRef::Unknown,
        },
        OpCode::Ldloc0
        | OpCode::Ldloc1
        | OpCode::Ldloc2
        | OpCode::Ldloc3
        | OpCode::LdlocS
        | OpCode::Ldloc => match operation.value {
            OperationValue::Local(index) => context.local_type(index),
            _ => TypeRef::Unknown,
        },
        OpCode::LdlocaS | OpCode::Ldloca => match operation.value {
            OperationValue::Local(index) => TypeRef::by_ref(context.local_type(index)),
            _ => TypeRef::Unknown,
        },

        OpCode::Dup | OpCode::Neg | OpCode::Not | OpCode::Ckfinite => first(),
        OpCode::Shl | OpCode::Shr | OpCode::ShrUn => first().stack_type(),
        OpCode::Add
        | OpCode::AddOvf
        | OpCode::AddOvfUn
        | OpCode::Sub
        | OpCode::SubOvf
        | OpCode::SubOvfUn
        | OpCode::Mul
        | OpCode::MulOvf
        | OpCode::MulOvfUn
        | OpCode::Div
        | OpCode::DivUn
        | OpCode::Rem
        | OpCode::RemUn
        | OpCode::And
        | OpCode::Or
        | OpCode::Xor => binary_numeric(&first(), &second()),
        OpCode::Ceq | OpCode::Cgt | OpCode::CgtUn | OpCode::Clt | OpCode::CltUn => {
            TypeRef::Boolean
        }

        OpCode::ConvI1 | OpCode::ConvOvfI1 | OpCode::ConvOvfI1Un => TypeRef::I8,
        OpCode::ConvU1 | OpCode::ConvOvfU1 | OpCode::ConvOvfU1Un => TypeRef::U8,
        OpCode::ConvI2 | OpCode::ConvOvfI2 | OpCode::ConvOvfI2Un => TypeRef::I16,
        OpCode::ConvU2 | OpCode::ConvOvfU2 | OpCode::ConvOvfU2Un => TypeRef::U16,
        OpCode::ConvI4 | OpCode::ConvOvfI4 | OpCode::ConvOvfI4Un => TypeRef::I32,
        OpCode::ConvU4 | OpCode::ConvOvfU4 | OpCode::ConvOvfU4Un => TypeRef::U32,
        OpCode::ConvI8 | OpCode::ConvOvfI8 | OpCode::ConvOvfI8Un => TypeRef::I64,
        OpCode::ConvU8 | OpCode::ConvOvfU8 | OpCode::ConvOvfU8Un => TypeRef::U64,
        OpCode::ConvI | OpCode::ConvOvfI | OpCode::ConvOvfIUn => TypeRef::NativeInt,
        OpCode::ConvU | OpCode::ConvOvfU | OpCode::ConvOvfUUn => TypeRef::NativeUInt,
        OpCode::ConvR4 => TypeRef::F32,
        OpCode::ConvR8 | OpCode::ConvRUn => TypeRef::F64,

        OpCode::LdindI1 | OpCode::LdelemI1 => TypeRef::I8,
        OpCode::LdindU1 | OpCode::LdelemU1 => TypeRef::U8,
        OpCode::LdindI2 | OpCode::LdelemI2 => TypeRef::I16,
        OpCode::LdindU2 | OpCode::LdelemU2 => TypeRef::U16,
        OpCode::LdindI4 | OpCode::LdelemI4 => TypeRef::I32,
        OpCode::LdindU4 | OpCode::LdelemU4 => TypeRef::U32,
        OpCode::LdindI8 | OpCode::LdelemI8 => TypeRef::I64,
        OpCode::LdindI | OpCode::LdelemI => TypeRef::NativeInt,
        OpCode::LdindR4 | OpCode::LdelemR4 => TypeRef::F32,
        OpCode::LdindR8 | OpCode::LdelemR8 => TypeRef::F64,
        OpCode::LdindRef => first().pointee().cloned().unwrap_or(TypeRef::Object),
        OpCode::LdelemRef => first().element().cloned().unwrap_or(TypeRef::Object),
        OpCode::Ldelem | OpCode::Ldobj | OpCode::UnboxAny | OpCode::Castclass | OpCode::Isinst => {
            resolve(host, token)
        }
        OpCode::Ldelema | OpCode::Unbox | OpCode::Refanyval => {
            TypeRef::by_ref(resolve(host, token))
        }
        OpCode::Ldlen => TypeRef::NativeUInt,
        OpCode::Newarr => TypeRef::vector(resolve(host, token)),
        OpCode::Box => TypeRef::Object,
        OpCode::Mkrefany => TypeRef::TypedReference,
        OpCode::Refanytype => TypeRef::TypeHandle,
        OpCode::Arglist => TypeRef::ArgumentHandle,
        OpCode::Sizeof => TypeRef::U32,
        OpCode::Ldftn | OpCode::Ldvirtftn | OpCode::Localloc => TypeRef::NativeInt,

        OpCode::Ldfld | OpCode::Ldsfld => token
            .and_then(|token| host.field_type(token))
            .unwrap_or_default(),
        OpCode::Ldflda | OpCode::Ldsflda => TypeRef::by_ref(
            token
                .and_then(|token| host.field_type(token))
                .unwrap_or_default(),
        ),
        OpCode::Ldtoken => match token.map(|token| token.table()) {
            Some(Token::TABLE_TYPE_DEF | Token::TABLE_TYPE_REF | Token::TABLE_TYPE_SPEC) => {
                TypeRef::TypeHandle
            }
            Some(Token::TABLE_FIELD) => TypeRef::FieldHandle,
            Some(Token::TABLE_MEMBER_REF)
                if token.and_then(|token| host.field_type(token)).is_some() =>
            {
                TypeRef::FieldHandle
            }
            _ => TypeRef::MethodHandle,
        },

        OpCode::Call | OpCode::Callvirt => token
            .and_then(|token| host.method_signature(token))
            .map_or(TypeRef::Unknown, |signature| signature.return_type),
        OpCode::Calli => token
            .and_then(|token| host.standalone_signature(token))
            .map_or(TypeRef::Unknown, |signature| signature.return_type),
        OpCode::Newobj => token
            .and_then(|token| host.declaring_type(token))
            .unwrap_or(TypeRef::Object),

        opcode => {
            debug_assert!(
                matches!(opcode.stack_behaviour().1, StackPush::Fixed(0)),
                "{opcode} pushes a value without a result type"
            );
            TypeRef::Void
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    use crate::{
        assembly::{decode_operations, MethodBody, Operation},
        cdfg::{control, dataflow},
        host::{MethodSignature, SimpleHost},
    };

    fn typed(code: &[u8], context: &MethodContext, host: &SimpleHost) -> ControlAndDataFlowGraph {
        let body = MethodBody {
            max_stack: 8,
            local_signature_token: Token(0),
            init_locals: false,
            code: code.to_vec(),
            exception_handlers: Vec::new(),
        };
        let operations = decode_operations(&body.code).unwrap();
        let mut graph = control::infer(&body, &operations, None).unwrap();
        dataflow::infer(&mut graph, context, host).unwrap();
        infer(&mut graph, context, host);
        graph
    }

    #[test]
    fn merging() {
        let host = SimpleHost::new();
        assert_eq!(
            merge_types([&TypeRef::I32, &TypeRef::I32], &host),
            TypeRef::I32
        );
        assert_eq!(
            merge_types([&TypeRef::Boolean, &TypeRef::I32], &host),
            TypeRef::I32
        );
        assert_eq!(
            merge_types([&TypeRef::String, &TypeRef::vector(TypeRef::I32)], &host),
            TypeRef::Object
        );
        assert_eq!(
            merge_types([&TypeRef::Unknown, &TypeRef::F32], &host),
            TypeRef::F32
        );
        assert_eq!(
            merge_types([&TypeRef::I64, &TypeRef::String], &host),
            TypeRef::Unknown
        );
        assert_eq!(merge_types([], &host), TypeRef::Unknown);
    }

    #[test]
    fn constants_and_arguments() {
        // ldarg.0; conv.i8; ldc.i8 2; mul; ret
        #[rustfmt::skip]
        let code = [0x02, 0x6A, 0x21, 2, 0, 0, 0, 0, 0, 0, 0, 0x5A, 0x2A];
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::I64, vec![TypeRef::I32]),
            Vec::new(),
        );
        let graph = typed(&code, &context, &SimpleHost::new());
        let types: Vec<TypeRef> = graph.all_blocks[0]
            .instructions
            .iter()
            .map(|instruction| instruction.ty.clone())
            .collect();
        assert_eq!(
            types,
            vec![
                TypeRef::I32,
                TypeRef::I64,
                TypeRef::I64,
                TypeRef::I64,
                TypeRef::Void
            ]
        );
    }

    #[test]
    fn merged_stack_entry() {
        // ldarg.0; brtrue.s T; ldstr s; br.s J; T: ldnull; J: ret
        #[rustfmt::skip]
        let code = [
            0x02,
            0x2D, 0x07,
            0x72, 0x01, 0x00, 0x00, 0x70,
            0x2B, 0x01,
            0x14,
            0x2A,
        ];
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::Object, vec![TypeRef::Boolean]),
            Vec::new(),
        );
        let graph = typed(&code, &context, &SimpleHost::new());
        let join = graph.block_at(11).unwrap();
        let entry = &graph.all_blocks[join.0].operand_stack[0];
        assert!(entry.is_merge);
        assert_eq!(entry.ty, TypeRef::Object);
    }

    #[test]
    fn pushing_opcodes_have_a_type() {
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::Void, Vec::new()),
            Vec::new(),
        );
        let host = SimpleHost::new();
        let graph = typed(&[0x2A], &context, &host);

        for opcode in OpCode::iter() {
            let StackPush::Fixed(push) = opcode.stack_behaviour().1 else {
                continue;
            };
            let instruction = Instruction::real(Operation {
                offset: 0,
                opcode,
                value: OperationValue::None,
            });
            let ty = result_type(&graph, &instruction, &context, &host);
            assert_eq!(ty == TypeRef::Void, push == 0, "{opcode}");
        }
    }

    #[test]
    fn host_resolved_types() {
        let field = Token(0x0400_0001);
        let element = Token(0x0100_0002);
        let host = SimpleHost::new()
            .with_field(field, TypeRef::String)
            .with_type(element, TypeRef::value_type(element));
        // ldsfld F; pop; ldc.i4.4; newarr E; pop; ldtoken F; pop; ret
        #[rustfmt::skip]
        let code = [
            0x7E, 0x01, 0x00, 0x00, 0x04,
            0x26,
            0x1A,
            0x8D, 0x02, 0x00, 0x00, 0x01,
            0x26,
            0xD0, 0x01, 0x00, 0x00, 0x04,
            0x26,
            0x2A,
        ];
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::Void, Vec::new()),
            Vec::new(),
        );
        let graph = typed(&code, &context, &host);
        let instructions = &graph.all_blocks[0].instructions;
        assert_eq!(instructions[0].ty, TypeRef::String);
        assert_eq!(
            instructions[3].ty,
            TypeRef::vector(TypeRef::value_type(element))
        );
        assert_eq!(instructions[5].ty, TypeRef::FieldHandle);
        assert_eq!(instructions[1].ty, TypeRef::Void);
    }
}
