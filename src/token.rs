//! Metadata tokens.
//!
//! A token is a 32-bit reference into the metadata of an image: the high byte names the table
//! and the low 24 bits carry the 1-based row. Tokens appear as instruction operands, as method
//! identifiers in debug symbols, and as signature references of locals and constants.

use std::fmt;

/// A metadata table reference (`table << 24 | row`).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// `TypeRef` table
    pub const TABLE_TYPE_REF: u8 = 0x01;
    /// `TypeDef` table
    pub const TABLE_TYPE_DEF: u8 = 0x02;
    /// `Field` table
    pub const TABLE_FIELD: u8 = 0x04;
    /// `MethodDef` table
    pub const TABLE_METHOD_DEF: u8 = 0x06;
    /// `MemberRef` table
    pub const TABLE_MEMBER_REF: u8 = 0x0A;
    /// `StandAloneSig` table
    pub const TABLE_STANDALONE_SIG: u8 = 0x11;
    /// `TypeSpec` table
    pub const TABLE_TYPE_SPEC: u8 = 0x1B;
    /// `MethodSpec` table
    pub const TABLE_METHOD_SPEC: u8 = 0x2B;
    /// User string heap (`ldstr` operands)
    pub const TABLE_USER_STRING: u8 = 0x70;

    /// Wrap a raw token value
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Token(value)
    }

    /// Build a token from a table id and a row
    #[must_use]
    pub const fn from_parts(table: u8, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// The raw token value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// The table id (high byte)
    #[must_use]
    pub const fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The row (low 24 bits)
    #[must_use]
    pub const fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// True for the nil token `0`
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// True for `MethodDef` tokens, the only tokens debug symbols are keyed by
    #[must_use]
    pub const fn is_method_def(&self) -> bool {
        self.table() == Self::TABLE_METHOD_DEF
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
