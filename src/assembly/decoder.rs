//! CIL byte stream decoding.
//!
//! Turns the code bytes of a method body into a flat list of [`Operation`]s in program order.
//! Branch operands are resolved to absolute offsets and the abbreviated variable and constant
//! opcodes are expanded to the value they imply.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::assembly::{decode_operations, OpCode, OperationValue};
//!
//! // ldc.i4.1; brtrue.s +1; ldc.i4.0; ret
//! let operations = decode_operations(&[0x17, 0x2D, 0x01, 0x16, 0x2A])?;
//!
//! assert_eq!(operations.len(), 4);
//! assert_eq!(operations[1].opcode, OpCode::BrtrueS);
//! assert_eq!(operations[1].value, OperationValue::Target(4));
//! # Ok::<(), dotsym::Error>(())
//! ```

use crate::{
    assembly::{
        opcodes::VariableKind, OpCode, OperandKind, Operation, OperationValue, FE_PREFIX,
    },
    file::parser::Parser,
    token::Token,
    writer::BinaryWriter,
    Error::OutOfBounds,
    Result,
};

/// Decode a complete code stream.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for reserved opcodes or branches to negative offsets, and
/// [`crate::Error::OutOfBounds`] if an operand runs past the end of the code.
pub fn decode_operations(code: &[u8]) -> Result<Vec<Operation>> {
    let mut parser = Parser::new(code);
    let mut operations = Vec::with_capacity(code.len() / 2);

    while parser.has_more_data() {
        operations.push(decode_operation(&mut parser)?);
    }

    Ok(operations)
}

/// Decode the single instruction at the parser's position.
///
/// # Errors
/// See [`decode_operations`].
pub fn decode_operation(parser: &mut Parser) -> Result<Operation> {
    let offset = parser.pos() as u32;

    let first = parser.read_le::<u8>()?;
    let value = if first == FE_PREFIX {
        0xFE00 | u16::from(parser.read_le::<u8>()?)
    } else {
        u16::from(first)
    };

    let Some(opcode) = OpCode::from_value(value) else {
        return Err(malformed_error!(
            "Invalid opcode 0x{:X} at offset 0x{:04X}",
            value,
            offset
        ));
    };

    let value = match opcode.operand_kind() {
        OperandKind::None => match (opcode.variable_access(), opcode.implicit_i4()) {
            (Some((kind, Some(index))), _) => variable(kind, index),
            (_, Some(constant)) => OperationValue::I32(constant),
            _ => OperationValue::None,
        },
        OperandKind::Int8 => OperationValue::I32(i32::from(parser.read_le::<i8>()?)),
        OperandKind::UInt8 => {
            let raw = parser.read_le::<u8>()?;
            match opcode.variable_access() {
                Some((kind, _)) => variable(kind, u16::from(raw)),
                None => OperationValue::I32(i32::from(raw)),
            }
        }
        OperandKind::Int16 => OperationValue::I32(i32::from(parser.read_le::<i16>()?)),
        OperandKind::UInt16 => {
            let raw = parser.read_le::<u16>()?;
            match opcode.variable_access() {
                Some((kind, _)) => variable(kind, raw),
                None => OperationValue::I32(i32::from(raw)),
            }
        }
        OperandKind::Int32 => OperationValue::I32(parser.read_le::<i32>()?),
        OperandKind::Int64 => OperationValue::I64(parser.read_le::<i64>()?),
        OperandKind::Float32 => OperationValue::F32(parser.read_le::<f32>()?),
        OperandKind::Float64 => OperationValue::F64(parser.read_le::<f64>()?),
        OperandKind::Token => OperationValue::Token(Token(parser.read_le::<u32>()?)),
        OperandKind::ShortBranch => {
            let displacement = i64::from(parser.read_le::<i8>()?);
            OperationValue::Target(absolute(parser.pos(), displacement, offset)?)
        }
        OperandKind::Branch => {
            let displacement = i64::from(parser.read_le::<i32>()?);
            OperationValue::Target(absolute(parser.pos(), displacement, offset)?)
        }
        OperandKind::Switch => {
            let count = parser.read_le::<u32>()? as usize;
            if count > parser.remaining() / 4 {
                return Err(OutOfBounds);
            }

            let mut displacements = Vec::with_capacity(count);
            for _ in 0..count {
                displacements.push(i64::from(parser.read_le::<i32>()?));
            }

            let next = parser.pos();
            let targets = displacements
                .into_iter()
                .map(|displacement| absolute(next, displacement, offset))
                .collect::<Result<Vec<u32>>>()?;
            OperationValue::Switch(targets)
        }
    };

    Ok(Operation {
        offset,
        opcode,
        value,
    })
}

/// Encode operations back into a code stream. Each operation is written with its own opcode at
/// its recorded offset; the offsets must be contiguous.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if an operation's offset does not follow its predecessor
/// or an operand does not fit its encoding.
pub fn encode_operations(operations: &[Operation]) -> Result<Vec<u8>> {
    let mut writer = BinaryWriter::new();
    for operation in operations {
        if writer.position() != operation.offset as usize {
            return Err(malformed_error!(
                "Operation {} is not at the expected offset 0x{:04X}",
                operation,
                writer.position()
            ));
        }
        operation.write_to(&mut writer)?;
    }
    Ok(writer.into_vec())
}

fn variable(kind: VariableKind, index: u16) -> OperationValue {
    match kind {
        VariableKind::Local => OperationValue::Local(index),
        VariableKind::Argument => OperationValue::Argument(index),
    }
}

fn absolute(next: usize, displacement: i64, offset: u32) -> Result<u32> {
    let target = next as i64 + displacement;
    u32::try_from(target).map_err(|_| {
        malformed_error!(
            "Branch at 0x{:04X} targets negative offset {}",
            offset,
            target
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_operands() {
        let operations = decode_operations(&[0x02, 0x07, 0x0D, 0x15, 0x1E, 0x00]).unwrap();
        let values: Vec<_> = operations.iter().map(|op| op.value.clone()).collect();
        assert_eq!(
            values,
            vec![
                OperationValue::Argument(0),
                OperationValue::Local(1),
                OperationValue::Local(3),
                OperationValue::I32(-1),
                OperationValue::I32(8),
                OperationValue::None,
            ]
        );
        assert_eq!(operations[5].offset, 5);
    }

    #[test]
    fn inline_operands() {
        #[rustfmt::skip]
        let code = [
            0x1F, 0xF6,                                     // ldc.i4.s -10
            0x20, 0x78, 0x56, 0x34, 0x12,                   // ldc.i4 0x12345678
            0x21, 0x01, 0, 0, 0, 0, 0, 0, 0x80,             // ldc.i8
            0x22, 0x00, 0x00, 0x80, 0x3F,                   // ldc.r4 1.0
            0x13, 0x05,                                     // stloc.s 5
            0xFE, 0x09, 0x01, 0x01,                         // ldarg 257
            0x72, 0x01, 0x00, 0x00, 0x70,                   // ldstr
            0xFE, 0x12, 0x04,                               // unaligned. 4
        ];
        let operations = decode_operations(&code).unwrap();
        assert_eq!(operations[0].value, OperationValue::I32(-10));
        assert_eq!(operations[1].value, OperationValue::I32(0x1234_5678));
        assert_eq!(operations[2].value, OperationValue::I64(i64::MIN + 1));
        assert_eq!(operations[3].value, OperationValue::F32(1.0));
        assert_eq!(operations[4].value, OperationValue::Local(5));
        assert_eq!(operations[5].value, OperationValue::Argument(257));
        assert_eq!(operations[6].value, OperationValue::Token(Token(0x7000_0001)));
        assert_eq!(operations[7].opcode, OpCode::Unaligned);
        assert_eq!(operations[7].value, OperationValue::I32(4));
    }

    #[test]
    fn branches() {
        // br.s -2 loops onto itself; switch targets are relative to the end of the table
        #[rustfmt::skip]
        let code = [
            0x2B, 0xFE,
            0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF1, 0xFF, 0xFF, 0xFF,
            0x2A,
        ];
        let operations = decode_operations(&code).unwrap();
        assert_eq!(operations[0].value, OperationValue::Target(0));
        assert_eq!(operations[1].value, OperationValue::Switch(vec![15, 0]));
        assert_eq!(operations[2].offset, 15);
    }

    #[test]
    fn errors() {
        assert!(matches!(
            decode_operations(&[0x24]),
            Err(crate::Error::Malformed { .. })
        ));
        assert!(matches!(
            decode_operations(&[0x20, 0x01]),
            Err(crate::Error::OutOfBounds)
        ));
        assert!(matches!(
            decode_operations(&[0x45, 0xFF, 0xFF, 0x00, 0x00]),
            Err(crate::Error::OutOfBounds)
        ));
        assert!(matches!(
            decode_operations(&[0x2B, 0x80]),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn encode_reproduces_code() {
        #[rustfmt::skip]
        let code = vec![
            0x17, 0x2D, 0x03, 0x16, 0x2B, 0x01, 0x17, 0x0A,
            0xFE, 0x0C, 0x00, 0x00, 0x38, 0xF0, 0xFF, 0xFF, 0xFF, 0x2A,
        ];
        let operations = decode_operations(&code).unwrap();
        assert_eq!(encode_operations(&operations).unwrap(), code);
        assert!(encode_operations(&operations[1..]).is_err());
    }
}
