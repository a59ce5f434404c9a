//! CIL opcode table (ECMA-335 Partition III).
//!
//! Every opcode is a variant of [`OpCode`]. Single-byte opcodes have values `0x00`-`0xE0`;
//! opcodes that use the `0xFE` prefix are stored as `0xFExx`. Each variant knows its mnemonic,
//! operand encoding, control flow classification and stack transition.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::assembly::{FlowControl, OpCode, OperandKind};
//!
//! let op = OpCode::from_value(0xFE01).unwrap();
//! assert_eq!(op, OpCode::Ceq);
//! assert_eq!(op.mnemonic(), "ceq");
//! assert_eq!(op.size(), 2);
//!
//! assert_eq!(OpCode::BrS.operand_kind(), OperandKind::ShortBranch);
//! assert_eq!(OpCode::BrS.long_form(), OpCode::Br);
//! assert_eq!(OpCode::Switch.flow(), FlowControl::CondBranch);
//! ```

use strum::EnumIter;

/// Prefix byte of two-byte opcodes
pub const FE_PREFIX: u8 = 0xFE;

/// Encoding of the inline operand that follows an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// No operand
    None,
    /// Signed byte (`ldc.i4.s`)
    Int8,
    /// Unsigned byte (short variable index, `unaligned.`, `no.`)
    UInt8,
    /// Signed 16-bit value
    Int16,
    /// Unsigned 16-bit variable index
    UInt16,
    /// Signed 32-bit value
    Int32,
    /// Signed 64-bit value
    Int64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Metadata token
    Token,
    /// Signed byte branch displacement
    ShortBranch,
    /// Signed 32-bit branch displacement
    Branch,
    /// Target count followed by that many 32-bit displacements
    Switch,
}

impl OperandKind {
    /// Encoded operand size in bytes. For [`OperandKind::Switch`] this is the size of the count
    /// only; each target adds another 4 bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Int8 | OperandKind::UInt8 | OperandKind::ShortBranch => 1,
            OperandKind::Int16 | OperandKind::UInt16 => 2,
            OperandKind::Int32
            | OperandKind::Float32
            | OperandKind::Token
            | OperandKind::Branch
            | OperandKind::Switch => 4,
            OperandKind::Int64 | OperandKind::Float64 => 8,
        }
    }

    /// True for branch displacements and switch tables
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(
            self,
            OperandKind::ShortBranch | OperandKind::Branch | OperandKind::Switch
        )
    }
}

/// Control flow classification of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowControl {
    /// Execution continues with the next instruction
    Next,
    /// Unconditional branch
    Branch,
    /// Conditional branch or switch
    CondBranch,
    /// Method call
    Call,
    /// Return from the method, finally or filter
    Return,
    /// Raise an exception
    Throw,
    /// Prefix that modifies the next instruction
    Meta,
    /// Debugger break
    Break,
}

/// Number of stack slots an opcode consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackPop {
    /// Exactly this many slots
    Fixed(u8),
    /// Depends on the signature of the operand (calls, `ret`)
    Variable,
}

/// Number of stack slots an opcode produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackPush {
    /// Exactly this many slots
    Fixed(u8),
    /// Depends on the signature of the operand (calls)
    Variable,
}

macro_rules! stack_change {
    ($kind:ident, var) => {
        $kind::Variable
    };
    ($kind:ident, $n:literal) => {
        $kind::Fixed($n)
    };
}

macro_rules! opcodes {
    ($( $name:ident = $value:literal, $mnemonic:literal, $operand:ident, $flow:ident, $pop:tt, $push:tt; )*) => {
        /// A CIL opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
        pub enum OpCode {
            $(
                #[doc = concat!("`", $mnemonic, "`")]
                $name,
            )*
        }

        impl OpCode {
            /// The opcode value, `0xFExx` for two-byte opcodes
            #[must_use]
            pub const fn value(self) -> u16 {
                match self {
                    $( OpCode::$name => $value, )*
                }
            }

            /// Look up an opcode by value, `None` for reserved encodings
            #[must_use]
            pub const fn from_value(value: u16) -> Option<OpCode> {
                match value {
                    $( $value => Some(OpCode::$name), )*
                    _ => None,
                }
            }

            /// The assembler mnemonic
            #[must_use]
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( OpCode::$name => $mnemonic, )*
                }
            }

            /// The inline operand encoding
            #[must_use]
            pub const fn operand_kind(self) -> OperandKind {
                match self {
                    $( OpCode::$name => OperandKind::$operand, )*
                }
            }

            /// The control flow classification
            #[must_use]
            pub const fn flow(self) -> FlowControl {
                match self {
                    $( OpCode::$name => FlowControl::$flow, )*
                }
            }

            /// Slots popped and pushed
            #[must_use]
            pub const fn stack_behaviour(self) -> (StackPop, StackPush) {
                match self {
                    $( OpCode::$name => (stack_change!(StackPop, $pop), stack_change!(StackPush, $push)), )*
                }
            }
        }
    };
}

#[rustfmt::skip]
opcodes! {
    Nop = 0x00, "nop", None, Next, 0, 0;
    Break = 0x01, "break", None, Break, 0, 0;
    Ldarg0 = 0x02, "ldarg.0", None, Next, 0, 1;
    Ldarg1 = 0x03, "ldarg.1", None, Next, 0, 1;
    Ldarg2 = 0x04, "ldarg.2", None, Next, 0, 1;
    Ldarg3 = 0x05, "ldarg.3", None, Next, 0, 1;
    Ldloc0 = 0x06, "ldloc.0", None, Next, 0, 1;
    Ldloc1 = 0x07, "ldloc.1", None, Next, 0, 1;
    Ldloc2 = 0x08, "ldloc.2", None, Next, 0, 1;
    Ldloc3 = 0x09, "ldloc.3", None, Next, 0, 1;
    Stloc0 = 0x0A, "stloc.0", None, Next, 1, 0;
    Stloc1 = 0x0B, "stloc.1", None, Next, 1, 0;
    Stloc2 = 0x0C, "stloc.2", None, Next, 1, 0;
    Stloc3 = 0x0D, "stloc.3", None, Next, 1, 0;
    LdargS = 0x0E, "ldarg.s", UInt8, Next, 0, 1;
    LdargaS = 0x0F, "ldarga.s", UInt8, Next, 0, 1;
    StargS = 0x10, "starg.s", UInt8, Next, 1, 0;
    LdlocS = 0x11, "ldloc.s", UInt8, Next, 0, 1;
    LdlocaS = 0x12, "ldloca.s", UInt8, Next, 0, 1;
    StlocS = 0x13, "stloc.s", UInt8, Next, 1, 0;
    Ldnull = 0x14, "ldnull", None, Next, 0, 1;
    LdcI4M1 = 0x15, "ldc.i4.m1", None, Next, 0, 1;
    LdcI40 = 0x16, "ldc.i4.0", None, Next, 0, 1;
    LdcI41 = 0x17, "ldc.i4.1", None, Next, 0, 1;
    LdcI42 = 0x18, "ldc.i4.2", None, Next, 0, 1;
    LdcI43 = 0x19, "ldc.i4.3", None, Next, 0, 1;
    LdcI44 = 0x1A, "ldc.i4.4", None, Next, 0, 1;
    LdcI45 = 0x1B, "ldc.i4.5", None, Next, 0, 1;
    LdcI46 = 0x1C, "ldc.i4.6", None, Next, 0, 1;
    LdcI47 = 0x1D, "ldc.i4.7", None, Next, 0, 1;
    LdcI48 = 0x1E, "ldc.i4.8", None, Next, 0, 1;
    LdcI4S = 0x1F, "ldc.i4.s", Int8, Next, 0, 1;
    LdcI4 = 0x20, "ldc.i4", Int32, Next, 0, 1;
    LdcI8 = 0x21, "ldc.i8", Int64, Next, 0, 1;
    LdcR4 = 0x22, "ldc.r4", Float32, Next, 0, 1;
    LdcR8 = 0x23, "ldc.r8", Float64, Next, 0, 1;
    Dup = 0x25, "dup", None, Next, 1, 2;
    Pop = 0x26, "pop", None, Next, 1, 0;
    Jmp = 0x27, "jmp", Token, Call, 0, 0;
    Call = 0x28, "call", Token, Call, var, var;
    Calli = 0x29, "calli", Token, Call, var, var;
    Ret = 0x2A, "ret", None, Return, var, 0;
    BrS = 0x2B, "br.s", ShortBranch, Branch, 0, 0;
    BrfalseS = 0x2C, "brfalse.s", ShortBranch, CondBranch, 1, 0;
    BrtrueS = 0x2D, "brtrue.s", ShortBranch, CondBranch, 1, 0;
    BeqS = 0x2E, "beq.s", ShortBranch, CondBranch, 2, 0;
    BgeS = 0x2F, "bge.s", ShortBranch, CondBranch, 2, 0;
    BgtS = 0x30, "bgt.s", ShortBranch, CondBranch, 2, 0;
    BleS = 0x31, "ble.s", ShortBranch, CondBranch, 2, 0;
    BltS = 0x32, "blt.s", ShortBranch, CondBranch, 2, 0;
    BneUnS = 0x33, "bne.un.s", ShortBranch, CondBranch, 2, 0;
    BgeUnS = 0x34, "bge.un.s", ShortBranch, CondBranch, 2, 0;
    BgtUnS = 0x35, "bgt.un.s", ShortBranch, CondBranch, 2, 0;
    BleUnS = 0x36, "ble.un.s", ShortBranch, CondBranch, 2, 0;
    BltUnS = 0x37, "blt.un.s", ShortBranch, CondBranch, 2, 0;
    Br = 0x38, "br", Branch, Branch, 0, 0;
    Brfalse = 0x39, "brfalse", Branch, CondBranch, 1, 0;
    Brtrue = 0x3A, "brtrue", Branch, CondBranch, 1, 0;
    Beq = 0x3B, "beq", Branch, CondBranch, 2, 0;
    Bge = 0x3C, "bge", Branch, CondBranch, 2, 0;
    Bgt = 0x3D, "bgt", Branch, CondBranch, 2, 0;
    Ble = 0x3E, "ble", Branch, CondBranch, 2, 0;
    Blt = 0x3F, "blt", Branch, CondBranch, 2, 0;
    BneUn = 0x40, "bne.un", Branch, CondBranch, 2, 0;
    BgeUn = 0x41, "bge.un", Branch, CondBranch, 2, 0;
    BgtUn = 0x42, "bgt.un", Branch, CondBranch, 2, 0;
    BleUn = 0x43, "ble.un", Branch, CondBranch, 2, 0;
    BltUn = 0x44, "blt.un", Branch, CondBranch, 2, 0;
    Switch = 0x45, "switch", Switch, CondBranch, 1, 0;
    LdindI1 = 0x46, "ldind.i1", None, Next, 1, 1;
    LdindU1 = 0x47, "ldind.u1", None, Next, 1, 1;
    LdindI2 = 0x48, "ldind.i2", None, Next, 1, 1;
    LdindU2 = 0x49, "ldind.u2", None, Next, 1, 1;
    LdindI4 = 0x4A, "ldind.i4", None, Next, 1, 1;
    LdindU4 = 0x4B, "ldind.u4", None, Next, 1, 1;
    LdindI8 = 0x4C, "ldind.i8", None, Next, 1, 1;
    LdindI = 0x4D, "ldind.i", None, Next, 1, 1;
    LdindR4 = 0x4E, "ldind.r4", None, Next, 1, 1;
    LdindR8 = 0x4F, "ldind.r8", None, Next, 1, 1;
    LdindRef = 0x50, "ldind.ref", None, Next, 1, 1;
    StindRef = 0x51, "stind.ref", None, Next, 2, 0;
    StindI1 = 0x52, "stind.i1", None, Next, 2, 0;
    StindI2 = 0x53, "stind.i2", None, Next, 2, 0;
    StindI4 = 0x54, "stind.i4", None, Next, 2, 0;
    StindI8 = 0x55, "stind.i8", None, Next, 2, 0;
    StindR4 = 0x56, "stind.r4", None, Next, 2, 0;
    StindR8 = 0x57, "stind.r8", None, Next, 2, 0;
    Add = 0x58, "add", None, Next, 2, 1;
    Sub = 0x59, "sub", None, Next, 2, 1;
    Mul = 0x5A, "mul", None, Next, 2, 1;
    Div = 0x5B, "div", None, Next, 2, 1;
    DivUn = 0x5C, "div.un", None, Next, 2, 1;
    Rem = 0x5D, "rem", None, Next, 2, 1;
    RemUn = 0x5E, "rem.un", None, Next, 2, 1;
    And = 0x5F, "and", None, Next, 2, 1;
    Or = 0x60, "or", None, Next, 2, 1;
    Xor = 0x61, "xor", None, Next, 2, 1;
    Shl = 0x62, "shl", None, Next, 2, 1;
    Shr = 0x63, "shr", None, Next, 2, 1;
    ShrUn = 0x64, "shr.un", None, Next, 2, 1;
    Neg = 0x65, "neg", None, Next, 1, 1;
    Not = 0x66, "not", None, Next, 1, 1;
    ConvI1 = 0x67, "conv.i1", None, Next, 1, 1;
    ConvI2 = 0x68, "conv.i2", None, Next, 1, 1;
    ConvI4 = 0x69, "conv.i4", None, Next, 1, 1;
    ConvI8 = 0x6A, "conv.i8", None, Next, 1, 1;
    ConvR4 = 0x6B, "conv.r4", None, Next, 1, 1;
    ConvR8 = 0x6C, "conv.r8", None, Next, 1, 1;
    ConvU4 = 0x6D, "conv.u4", None, Next, 1, 1;
    ConvU8 = 0x6E, "conv.u8", None, Next, 1, 1;
    Callvirt = 0x6F, "callvirt", Token, Call, var, var;
    Cpobj = 0x70, "cpobj", Token, Next, 2, 0;
    Ldobj = 0x71, "ldobj", Token, Next, 1, 1;
    Ldstr = 0x72, "ldstr", Token, Next, 0, 1;
    Newobj = 0x73, "newobj", Token, Call, var, 1;
    Castclass = 0x74, "castclass", Token, Next, 1, 1;
    Isinst = 0x75, "isinst", Token, Next, 1, 1;
    ConvRUn = 0x76, "conv.r.un", None, Next, 1, 1;
    Unbox = 0x79, "unbox", Token, Next, 1, 1;
    Throw = 0x7A, "throw", None, Throw, 1, 0;
    Ldfld = 0x7B, "ldfld", Token, Next, 1, 1;
    Ldflda = 0x7C, "ldflda", Token, Next, 1, 1;
    Stfld = 0x7D, "stfld", Token, Next, 2, 0;
    Ldsfld = 0x7E, "ldsfld", Token, Next, 0, 1;
    Ldsflda = 0x7F, "ldsflda", Token, Next, 0, 1;
    Stsfld = 0x80, "stsfld", Token, Next, 1, 0;
    Stobj = 0x81, "stobj", Token, Next, 2, 0;
    ConvOvfI1Un = 0x82, "conv.ovf.i1.un", None, Next, 1, 1;
    ConvOvfI2Un = 0x83, "conv.ovf.i2.un", None, Next, 1, 1;
    ConvOvfI4Un = 0x84, "conv.ovf.i4.un", None, Next, 1, 1;
    ConvOvfI8Un = 0x85, "conv.ovf.i8.un", None, Next, 1, 1;
    ConvOvfU1Un = 0x86, "conv.ovf.u1.un", None, Next, 1, 1;
    ConvOvfU2Un = 0x87, "conv.ovf.u2.un", None, Next, 1, 1;
    ConvOvfU4Un = 0x88, "conv.ovf.u4.un", None, Next, 1, 1;
    ConvOvfU8Un = 0x89, "conv.ovf.u8.un", None, Next, 1, 1;
    ConvOvfIUn = 0x8A, "conv.ovf.i.un", None, Next, 1, 1;
    ConvOvfUUn = 0x8B, "conv.ovf.u.un", None, Next, 1, 1;
    Box = 0x8C, "box", Token, Next, 1, 1;
    Newarr = 0x8D, "newarr", Token, Next, 1, 1;
    Ldlen = 0x8E, "ldlen", None, Next, 1, 1;
    Ldelema = 0x8F, "ldelema", Token, Next, 2, 1;
    LdelemI1 = 0x90, "ldelem.i1", None, Next, 2, 1;
    LdelemU1 = 0x91, "ldelem.u1", None, Next, 2, 1;
    LdelemI2 = 0x92, "ldelem.i2", None, Next, 2, 1;
    LdelemU2 = 0x93, "ldelem.u2", None, Next, 2, 1;
    LdelemI4 = 0x94, "ldelem.i4", None, Next, 2, 1;
    LdelemU4 = 0x95, "ldelem.u4", None, Next, 2, 1;
    LdelemI8 = 0x96, "ldelem.i8", None, Next, 2, 1;
    LdelemI = 0x97, "ldelem.i", None, Next, 2, 1;
    LdelemR4 = 0x98, "ldelem.r4", None, Next, 2, 1;
    LdelemR8 = 0x99, "ldelem.r8", None, Next, 2, 1;
    LdelemRef = 0x9A, "ldelem.ref", None, Next, 2, 1;
    StelemI = 0x9B, "stelem.i", None, Next, 3, 0;
    StelemI1 = 0x9C, "stelem.i1", None, Next, 3, 0;
    StelemI2 = 0x9D, "stelem.i2", None, Next, 3, 0;
    StelemI4 = 0x9E, "stelem.i4", None, Next, 3, 0;
    StelemI8 = 0x9F, "stelem.i8", None, Next, 3, 0;
    StelemR4 = 0xA0, "stelem.r4", None, Next, 3, 0;
    StelemR8 = 0xA1, "stelem.r8", None, Next, 3, 0;
    StelemRef = 0xA2, "stelem.ref", None, Next, 3, 0;
    Ldelem = 0xA3, "ldelem", Token, Next, 2, 1;
    Stelem = 0xA4, "stelem", Token, Next, 3, 0;
    UnboxAny = 0xA5, "unbox.any", Token, Next, 1, 1;
    ConvOvfI1 = 0xB3, "conv.ovf.i1", None, Next, 1, 1;
    ConvOvfU1 = 0xB4, "conv.ovf.u1", None, Next, 1, 1;
    ConvOvfI2 = 0xB5, "conv.ovf.i2", None, Next, 1, 1;
    ConvOvfU2 = 0xB6, "conv.ovf.u2", None, Next, 1, 1;
    ConvOvfI4 = 0xB7, "conv.ovf.i4", None, Next, 1, 1;
    ConvOvfU4 = 0xB8, "conv.ovf.u4", None, Next, 1, 1;
    ConvOvfI8 = 0xB9, "conv.ovf.i8", None, Next, 1, 1;
    ConvOvfU8 = 0xBA, "conv.ovf.u8", None, Next, 1, 1;
    Refanyval = 0xC2, "refanyval", Token, Next, 1, 1;
    Ckfinite = 0xC3, "ckfinite", None, Next, 1, 1;
    Mkrefany = 0xC6, "mkrefany", Token, Next, 1, 1;
    Ldtoken = 0xD0, "ldtoken", Token, Next, 0, 1;
    ConvU2 = 0xD1, "conv.u2", None, Next, 1, 1;
    ConvU1 = 0xD2, "conv.u1", None, Next, 1, 1;
    ConvI = 0xD3, "conv.i", None, Next, 1, 1;
    ConvOvfI = 0xD4, "conv.ovf.i", None, Next, 1, 1;
    ConvOvfU = 0xD5, "conv.ovf.u", None, Next, 1, 1;
    AddOvf = 0xD6, "add.ovf", None, Next, 2, 1;
    AddOvfUn = 0xD7, "add.ovf.un", None, Next, 2, 1;
    MulOvf = 0xD8, "mul.ovf", None, Next, 2, 1;
    MulOvfUn = 0xD9, "mul.ovf.un", None, Next, 2, 1;
    SubOvf = 0xDA, "sub.ovf", None, Next, 2, 1;
    SubOvfUn = 0xDB, "sub.ovf.un", None, Next, 2, 1;
    Endfinally = 0xDC, "endfinally", None, Return, 0, 0;
    Leave = 0xDD, "leave", Branch, Branch, 0, 0;
    LeaveS = 0xDE, "leave.s", ShortBranch, Branch, 0, 0;
    StindI = 0xDF, "stind.i", None, Next, 2, 0;
    ConvU = 0xE0, "conv.u", None, Next, 1, 1;
    Arglist = 0xFE00, "arglist", None, Next, 0, 1;
    Ceq = 0xFE01, "ceq", None, Next, 2, 1;
    Cgt = 0xFE02, "cgt", None, Next, 2, 1;
    CgtUn = 0xFE03, "cgt.un", None, Next, 2, 1;
    Clt = 0xFE04, "clt", None, Next, 2, 1;
    CltUn = 0xFE05, "clt.un", None, Next, 2, 1;
    Ldftn = 0xFE06, "ldftn", Token, Next, 0, 1;
    Ldvirtftn = 0xFE07, "ldvirtftn", Token, Next, 1, 1;
    Ldarg = 0xFE09, "ldarg", UInt16, Next, 0, 1;
    Ldarga = 0xFE0A, "ldarga", UInt16, Next, 0, 1;
    Starg = 0xFE0B, "starg", UInt16, Next, 1, 0;
    Ldloc = 0xFE0C, "ldloc", UInt16, Next, 0, 1;
    Ldloca = 0xFE0D, "ldloca", UInt16, Next, 0, 1;
    Stloc = 0xFE0E, "stloc", UInt16, Next, 1, 0;
    Localloc = 0xFE0F, "localloc", None, Next, 1, 1;
    Endfilter = 0xFE11, "endfilter", None, Return, 1, 0;
    Unaligned = 0xFE12, "unaligned.", UInt8, Meta, 0, 0;
    Volatile = 0xFE13, "volatile.", None, Meta, 0, 0;
    Tail = 0xFE14, "tail.", None, Meta, 0, 0;
    Initobj = 0xFE15, "initobj", Token, Next, 1, 0;
    Constrained = 0xFE16, "constrained.", Token, Meta, 0, 0;
    Cpblk = 0xFE17, "cpblk", None, Next, 3, 0;
    Initblk = 0xFE18, "initblk", None, Next, 3, 0;
    No = 0xFE19, "no.", UInt8, Meta, 0, 0;
    Rethrow = 0xFE1A, "rethrow", None, Throw, 0, 0;
    Sizeof = 0xFE1C, "sizeof", Token, Next, 0, 1;
    Refanytype = 0xFE1D, "refanytype", None, Next, 1, 1;
    Readonly = 0xFE1E, "readonly.", None, Meta, 0, 0;
}

/// Kind of variable an access opcode addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    /// A local variable
    Local,
    /// A method argument (index 0 is `this` on instance methods)
    Argument,
}

impl OpCode {
    /// Encoded opcode size: 2 for `0xFE`-prefixed opcodes, 1 otherwise
    #[must_use]
    pub const fn size(self) -> usize {
        if self.value() > 0xFF {
            2
        } else {
            1
        }
    }

    /// Opcode plus inline operand size. Switch tables add `4 * targets` on top of this.
    #[must_use]
    pub const fn encoded_size(self) -> usize {
        self.size() + self.operand_kind().size()
    }

    /// The long form of a short branch, the opcode itself otherwise
    #[must_use]
    pub const fn long_form(self) -> OpCode {
        match self {
            OpCode::BrS => OpCode::Br,
            OpCode::BrfalseS => OpCode::Brfalse,
            OpCode::BrtrueS => OpCode::Brtrue,
            OpCode::BeqS => OpCode::Beq,
            OpCode::BgeS => OpCode::Bge,
            OpCode::BgtS => OpCode::Bgt,
            OpCode::BleS => OpCode::Ble,
            OpCode::BltS => OpCode::Blt,
            OpCode::BneUnS => OpCode::BneUn,
            OpCode::BgeUnS => OpCode::BgeUn,
            OpCode::BgtUnS => OpCode::BgtUn,
            OpCode::BleUnS => OpCode::BleUn,
            OpCode::BltUnS => OpCode::BltUn,
            OpCode::LeaveS => OpCode::Leave,
            other => other,
        }
    }

    /// The short form of a long branch, `None` if the opcode has none
    #[must_use]
    pub const fn short_form(self) -> Option<OpCode> {
        Some(match self {
            OpCode::Br => OpCode::BrS,
            OpCode::Brfalse => OpCode::BrfalseS,
            OpCode::Brtrue => OpCode::BrtrueS,
            OpCode::Beq => OpCode::BeqS,
            OpCode::Bge => OpCode::BgeS,
            OpCode::Bgt => OpCode::BgtS,
            OpCode::Ble => OpCode::BleS,
            OpCode::Blt => OpCode::BltS,
            OpCode::BneUn => OpCode::BneUnS,
            OpCode::BgeUn => OpCode::BgeUnS,
            OpCode::BgtUn => OpCode::BgtUnS,
            OpCode::BleUn => OpCode::BleUnS,
            OpCode::BltUn => OpCode::BltUnS,
            OpCode::Leave => OpCode::LeaveS,
            _ => return None,
        })
    }

    /// True if execution never falls through to the next instruction
    #[must_use]
    pub const fn is_unconditional_transfer(self) -> bool {
        matches!(
            self,
            OpCode::Br
                | OpCode::BrS
                | OpCode::Leave
                | OpCode::LeaveS
                | OpCode::Endfilter
                | OpCode::Endfinally
                | OpCode::Jmp
                | OpCode::Ret
                | OpCode::Rethrow
                | OpCode::Throw
        )
    }

    /// True for `leave` and `leave.s`
    #[must_use]
    pub const fn is_leave(self) -> bool {
        matches!(self, OpCode::Leave | OpCode::LeaveS)
    }

    /// The variable an opcode reads or writes, with the index for the abbreviated forms that
    /// encode it in the opcode (`ldloc.2`, `ldarg.0`, ...).
    #[must_use]
    pub const fn variable_access(self) -> Option<(VariableKind, Option<u16>)> {
        use VariableKind::{Argument, Local};
        Some(match self {
            OpCode::Ldarg0 => (Argument, Some(0)),
            OpCode::Ldarg1 => (Argument, Some(1)),
            OpCode::Ldarg2 => (Argument, Some(2)),
            OpCode::Ldarg3 => (Argument, Some(3)),
            OpCode::Ldloc0 | OpCode::Stloc0 => (Local, Some(0)),
            OpCode::Ldloc1 | OpCode::Stloc1 => (Local, Some(1)),
            OpCode::Ldloc2 | OpCode::Stloc2 => (Local, Some(2)),
            OpCode::Ldloc3 | OpCode::Stloc3 => (Local, Some(3)),
            OpCode::LdargS
            | OpCode::LdargaS
            | OpCode::StargS
            | OpCode::Ldarg
            | OpCode::Ldarga
            | OpCode::Starg => (Argument, None),
            OpCode::LdlocS
            | OpCode::LdlocaS
            | OpCode::StlocS
            | OpCode::Ldloc
            | OpCode::Ldloca
            | OpCode::Stloc => (Local, None),
            _ => return None,
        })
    }

    /// The canonical 16-bit index form of a variable access opcode (`ldloc.1` → `ldloc`,
    /// `starg.s` → `starg`), the opcode itself otherwise
    #[must_use]
    pub const fn canonical_variable_form(self) -> OpCode {
        match self {
            OpCode::Ldarg0
            | OpCode::Ldarg1
            | OpCode::Ldarg2
            | OpCode::Ldarg3
            | OpCode::LdargS => OpCode::Ldarg,
            OpCode::LdargaS => OpCode::Ldarga,
            OpCode::StargS => OpCode::Starg,
            OpCode::Ldloc0
            | OpCode::Ldloc1
            | OpCode::Ldloc2
            | OpCode::Ldloc3
            | OpCode::LdlocS => OpCode::Ldloc,
            OpCode::LdlocaS => OpCode::Ldloca,
            OpCode::Stloc0
            | OpCode::Stloc1
            | OpCode::Stloc2
            | OpCode::Stloc3
            | OpCode::StlocS => OpCode::Stloc,
            other => other,
        }
    }

    /// True for opcodes that store into a variable
    #[must_use]
    pub const fn is_store(self) -> bool {
        matches!(
            self,
            OpCode::Stloc0
                | OpCode::Stloc1
                | OpCode::Stloc2
                | OpCode::Stloc3
                | OpCode::StlocS
                | OpCode::Stloc
                | OpCode::StargS
                | OpCode::Starg
        )
    }

    /// The constant pushed by the `ldc.i4.<n>` shorthands
    #[must_use]
    pub const fn implicit_i4(self) -> Option<i32> {
        Some(match self {
            OpCode::LdcI4M1 => -1,
            OpCode::LdcI40 => 0,
            OpCode::LdcI41 => 1,
            OpCode::LdcI42 => 2,
            OpCode::LdcI43 => 3,
            OpCode::LdcI44 => 4,
            OpCode::LdcI45 => 5,
            OpCode::LdcI46 => 6,
            OpCode::LdcI47 => 7,
            OpCode::LdcI48 => 8,
            _ => return None,
        })
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn table_is_consistent() {
        let mut count = 0;
        for op in OpCode::iter() {
            assert_eq!(OpCode::from_value(op.value()), Some(op), "{op}");
            if op.size() == 2 {
                assert_eq!(op.value() >> 8, u16::from(FE_PREFIX));
            }
            count += 1;
        }
        assert_eq!(count, 219);
    }

    #[test]
    fn reserved_values() {
        assert_eq!(OpCode::from_value(0x24), None);
        assert_eq!(OpCode::from_value(0xA6), None);
        assert_eq!(OpCode::from_value(0xFE08), None);
        assert_eq!(OpCode::from_value(0xFE1B), None);
        assert_eq!(OpCode::from_value(0xFF), None);
    }

    #[test]
    fn branch_pairs() {
        let mut pairs = 0;
        for op in OpCode::iter() {
            if let Some(short) = op.short_form() {
                assert_eq!(short.long_form(), op);
                assert_eq!(short.operand_kind(), OperandKind::ShortBranch);
                assert_eq!(op.operand_kind(), OperandKind::Branch);
                pairs += 1;
            }
        }
        assert_eq!(pairs, 14);
        assert_eq!(OpCode::Switch.short_form(), None);
        assert_eq!(OpCode::Nop.long_form(), OpCode::Nop);
    }

    #[test]
    fn unconditional_transfers() {
        let transfers: Vec<_> = OpCode::iter()
            .filter(|op| op.is_unconditional_transfer())
            .collect();
        assert_eq!(transfers.len(), 10);
        assert!(!OpCode::Brtrue.is_unconditional_transfer());
        assert!(!OpCode::Call.is_unconditional_transfer());
    }

    #[test]
    fn sizes() {
        assert_eq!(OpCode::Nop.encoded_size(), 1);
        assert_eq!(OpCode::LdcI4S.encoded_size(), 2);
        assert_eq!(OpCode::LdcI8.encoded_size(), 9);
        assert_eq!(OpCode::Ldloc.encoded_size(), 4);
        assert_eq!(OpCode::Call.encoded_size(), 5);
        assert_eq!(OpCode::Switch.encoded_size(), 5);
        assert_eq!(OpCode::Unaligned.encoded_size(), 3);
    }

    #[test]
    fn variable_forms() {
        assert_eq!(
            OpCode::Ldloc2.variable_access(),
            Some((VariableKind::Local, Some(2)))
        );
        assert_eq!(
            OpCode::StargS.variable_access(),
            Some((VariableKind::Argument, None))
        );
        assert_eq!(OpCode::Add.variable_access(), None);

        assert_eq!(OpCode::Stloc3.canonical_variable_form(), OpCode::Stloc);
        assert_eq!(OpCode::LdargaS.canonical_variable_form(), OpCode::Ldarga);
        assert_eq!(OpCode::Ldarg0.canonical_variable_form(), OpCode::Ldarg);
        assert!(OpCode::StlocS.is_store());
        assert!(!OpCode::Ldloca.is_store());
        assert_eq!(OpCode::LdcI4M1.implicit_i4(), Some(-1));
    }

    #[test]
    fn stack_behaviour() {
        assert_eq!(
            OpCode::Dup.stack_behaviour(),
            (StackPop::Fixed(1), StackPush::Fixed(2))
        );
        assert_eq!(
            OpCode::Call.stack_behaviour(),
            (StackPop::Variable, StackPush::Variable)
        );
        assert_eq!(
            OpCode::StelemRef.stack_behaviour(),
            (StackPop::Fixed(3), StackPush::Fixed(0))
        );
    }
}
