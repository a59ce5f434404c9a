//! Decoded CIL instructions.

use std::fmt;

use crate::{
    assembly::{OpCode, OperandKind, FE_PREFIX},
    token::Token,
    writer::BinaryWriter,
    Result,
};

/// The operand of an [`Operation`] after decoding.
///
/// Branch displacements are stored as absolute target offsets, and the abbreviated variable
/// opcodes (`ldloc.0`, `ldarg.3`, ...) carry their implied index, so two operations that mean
/// the same thing compare equal regardless of the encoding they were read from.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationValue {
    /// No operand
    None,
    /// Integer constant (`ldc.i4*`, `unaligned.`, `no.`)
    I32(i32),
    /// `ldc.i8` constant
    I64(i64),
    /// `ldc.r4` constant
    F32(f32),
    /// `ldc.r8` constant
    F64(f64),
    /// Metadata token
    Token(Token),
    /// Absolute branch target
    Target(u32),
    /// Absolute switch targets
    Switch(Vec<u32>),
    /// Local variable index
    Local(u16),
    /// Argument index
    Argument(u16),
}

/// One CIL instruction at a known offset within its method body.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Offset of the opcode from the start of the code
    pub offset: u32,
    /// The opcode
    pub opcode: OpCode,
    /// The decoded operand
    pub value: OperationValue,
}

impl Operation {
    /// Create an operation
    #[must_use]
    pub fn new(offset: u32, opcode: OpCode, value: OperationValue) -> Self {
        Operation {
            offset,
            opcode,
            value,
        }
    }

    /// Encoded size in bytes, including the switch table
    #[must_use]
    pub fn size(&self) -> usize {
        match &self.value {
            OperationValue::Switch(targets) if self.opcode == OpCode::Switch => {
                self.opcode.encoded_size() + 4 * targets.len()
            }
            _ => self.opcode.encoded_size(),
        }
    }

    /// Offset of the instruction that follows this one
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        self.offset + self.size() as u32
    }

    /// Every branch target of this operation, in operand order
    #[must_use]
    pub fn targets(&self) -> &[u32] {
        match &self.value {
            OperationValue::Target(target) => std::slice::from_ref(target),
            OperationValue::Switch(targets) => targets,
            _ => &[],
        }
    }

    /// Integer operand, if any
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self.value {
            OperationValue::I32(value) => Some(value),
            _ => self.opcode.implicit_i4(),
        }
    }

    /// Token operand, if any
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.value {
            OperationValue::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Encode the operation. Branch targets become displacements relative to
    /// [`Operation::next_offset`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the operand does not fit the opcode's encoding,
    /// including short branches whose displacement is out of `i8` range.
    pub fn write_to(&self, writer: &mut BinaryWriter) -> Result<()> {
        let value = self.opcode.value();
        if value > 0xFF {
            writer.write_u8(FE_PREFIX)?;
        }
        writer.write_u8((value & 0xFF) as u8)?;

        let next = i64::from(self.next_offset());
        let displacement = |target: u32| i64::from(target) - next;

        match (self.opcode.operand_kind(), &self.value) {
            (OperandKind::None, _) => Ok(()),
            (OperandKind::Int8, OperationValue::I32(v)) => writer.write_i8(self.narrow(*v)?),
            (OperandKind::UInt8, OperationValue::I32(v)) => writer.write_u8(self.narrow(*v)?),
            (
                OperandKind::UInt8,
                OperationValue::Local(index) | OperationValue::Argument(index),
            ) => writer.write_u8(self.narrow(*index)?),
            (OperandKind::Int16, OperationValue::I32(v)) => writer.write_i16(self.narrow(*v)?),
            (
                OperandKind::UInt16,
                OperationValue::Local(index) | OperationValue::Argument(index),
            ) => writer.write_u16(*index),
            (OperandKind::Int32, OperationValue::I32(v)) => writer.write_i32(*v),
            (OperandKind::Int64, OperationValue::I64(v)) => writer.write_i64(*v),
            (OperandKind::Float32, OperationValue::F32(v)) => writer.write_f32(*v),
            (OperandKind::Float64, OperationValue::F64(v)) => writer.write_f64(*v),
            (OperandKind::Token, OperationValue::Token(token)) => writer.write_u32(token.value()),
            (OperandKind::ShortBranch, OperationValue::Target(target)) => {
                writer.write_i8(self.narrow(displacement(*target))?)
            }
            (OperandKind::Branch, OperationValue::Target(target)) => {
                writer.write_i32(self.narrow(displacement(*target))?)
            }
            (OperandKind::Switch, OperationValue::Switch(targets)) => {
                writer.write_u32(targets.len() as u32)?;
                for target in targets {
                    writer.write_i32(self.narrow(displacement(*target))?)?;
                }
                Ok(())
            }
            (kind, operand) => Err(malformed_error!(
                "Operand {:?} can not be encoded as {:?} for {} at 0x{:04X}",
                operand,
                kind,
                self.opcode,
                self.offset
            )),
        }
    }

    fn narrow<S, T>(&self, value: S) -> Result<T>
    where
        S: Copy + fmt::Display,
        T: TryFrom<S>,
    {
        T::try_from(value).map_err(|_| {
            malformed_error!(
                "Operand {} is out of range for {} at 0x{:04X}",
                value,
                self.opcode,
                self.offset
            )
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.opcode)?;
        match &self.value {
            OperationValue::None => Ok(()),
            OperationValue::I32(v) => write!(f, " {v}"),
            OperationValue::I64(v) => write!(f, " {v}"),
            OperationValue::F32(v) => write!(f, " {v}"),
            OperationValue::F64(v) => write!(f, " {v}"),
            OperationValue::Token(token) => write!(f, " {token}"),
            OperationValue::Target(target) => write!(f, " IL_{target:04x}"),
            OperationValue::Switch(targets) => {
                f.write_str(" (")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "IL_{target:04x}")?;
                }
                f.write_str(")")
            }
            OperationValue::Local(index) => write!(f, " V_{index}"),
            OperationValue::Argument(index) => write!(f, " A_{index}"),
        }
    }
}
