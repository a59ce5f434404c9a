//! Decoders for the blobs referenced by the portable PDB tables.
//!
//! # Reference
//! - Portable PDB v1.0: "Document Name Blob", "Sequence Points Blob", "Imports Blob",
//!   "LocalConstant Signature Blob", "State Machine Hoisted Local Scopes" and
//!   "Async Method Stepping Information"

use tracing::debug;

use crate::{
    file::parser::Parser,
    pdb::{portable::root::Heaps, IteratorScope, PdbConstantValue, PdbLine},
    token::Token,
    Result,
};

const ELEMENT_TYPE_BOOLEAN: u8 = 0x02;
const ELEMENT_TYPE_CHAR: u8 = 0x03;
const ELEMENT_TYPE_I1: u8 = 0x04;
const ELEMENT_TYPE_U1: u8 = 0x05;
const ELEMENT_TYPE_I2: u8 = 0x06;
const ELEMENT_TYPE_U2: u8 = 0x07;
const ELEMENT_TYPE_I4: u8 = 0x08;
const ELEMENT_TYPE_U4: u8 = 0x09;
const ELEMENT_TYPE_I8: u8 = 0x0A;
const ELEMENT_TYPE_U8: u8 = 0x0B;
const ELEMENT_TYPE_R4: u8 = 0x0C;
const ELEMENT_TYPE_R8: u8 = 0x0D;
const ELEMENT_TYPE_STRING: u8 = 0x0E;
const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
const ELEMENT_TYPE_CLASS: u8 = 0x12;
const ELEMENT_TYPE_OBJECT: u8 = 0x1C;
const ELEMENT_TYPE_CMOD_REQD: u8 = 0x1F;
const ELEMENT_TYPE_CMOD_OPT: u8 = 0x20;

const TABLE_ASSEMBLY_REF: u8 = 0x23;

/// Join the parts of a document name blob with its separator.
pub(crate) fn document_name(blob: &[u8], heaps: &Heaps) -> Result<String> {
    let mut parser = Parser::new(blob);
    let separator = parser.read_le::<u8>()?;

    let mut name = String::new();
    let mut first = true;
    while parser.has_more_data() {
        let part = parser.read_compressed_uint()?;
        if !first && separator != 0 {
            name.push(char::from(separator));
        }
        first = false;
        name.push_str(&String::from_utf8_lossy(heaps.blob(part)?));
    }
    Ok(name)
}

/// Sequence points of one method
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MethodSequencePoints {
    /// `StandAloneSig` row of the local signature, 0 for none
    pub local_signature: u32,
    /// Each point with the `Document` row it belongs to
    pub points: Vec<(u32, PdbLine)>,
}

/// Decode a sequence points blob. `document` is the row's `Document` column; when it is 0 the
/// initial document is stored in the blob.
pub(crate) fn sequence_points(blob: &[u8], document: u32) -> Result<MethodSequencePoints> {
    let mut parser = Parser::new(blob);
    let local_signature = parser.read_compressed_uint()?;
    let mut document = if document == 0 {
        parser.read_compressed_uint()?
    } else {
        document
    };

    let mut points = Vec::new();
    let mut offset = 0u32;
    let mut previous: Option<(u32, u32)> = None;
    let mut first = true;

    while parser.has_more_data() {
        let delta_offset = parser.read_compressed_uint()?;
        if !first && delta_offset == 0 {
            document = parser.read_compressed_uint()?;
            continue;
        }
        offset = if first {
            delta_offset
        } else {
            offset
                .checked_add(delta_offset)
                .ok_or_else(|| malformed_error!("Sequence point offset overflow"))?
        };
        first = false;

        let delta_lines = parser.read_compressed_uint()?;
        let delta_columns = if delta_lines == 0 {
            i64::from(parser.read_compressed_uint()?)
        } else {
            i64::from(parser.read_compressed_int()?)
        };

        if delta_lines == 0 && delta_columns == 0 {
            points.push((document, PdbLine::hidden(offset)));
            continue;
        }

        let (start_line, start_column) = match previous {
            None => (
                i64::from(parser.read_compressed_uint()?),
                i64::from(parser.read_compressed_uint()?),
            ),
            Some((line, column)) => (
                i64::from(line) + i64::from(parser.read_compressed_int()?),
                i64::from(column) + i64::from(parser.read_compressed_int()?),
            ),
        };
        let start_line = u32::try_from(start_line)
            .map_err(|_| malformed_error!("Sequence point line {} out of range", start_line))?;
        let start_column = u16::try_from(start_column).map_err(|_| {
            malformed_error!("Sequence point column {} out of range", start_column)
        })?;
        let end_column = u16::try_from(i64::from(start_column) + delta_columns)
            .map_err(|_| malformed_error!("Sequence point end column out of range"))?;
        previous = Some((start_line, u32::from(start_column)));

        points.push((
            document,
            PdbLine {
                offset,
                line_begin: start_line,
                col_begin: start_column,
                line_end: start_line.saturating_add(delta_lines),
                col_end: end_column,
            },
        ));
    }

    Ok(MethodSequencePoints {
        local_signature,
        points,
    })
}

fn type_token(encoded: u32) -> Token {
    let table = match encoded & 0x3 {
        0 => Token::TABLE_TYPE_DEF,
        1 => Token::TABLE_TYPE_REF,
        _ => Token::TABLE_TYPE_SPEC,
    };
    Token::from_parts(table, encoded >> 2)
}

/// Decode an imports blob into using strings.
///
/// | Kind | Import | String |
/// |------|--------|--------|
/// | 1 | namespace | `U<namespace>` |
/// | 2 | namespace of an assembly | `E<namespace> <assembly ref>` |
/// | 3 | type | `T<type token>` |
/// | 4 | XML namespace | `X<prefix> <namespace>` |
/// | 5 | assembly reference alias | `Z<alias>` |
/// | 6 | aliased assembly reference | `Z<alias> <assembly ref>` |
/// | 7 | aliased namespace | `A<alias> U<namespace>` |
/// | 8 | aliased namespace of an assembly | `A<alias> E<namespace> <assembly ref>` |
/// | 9 | aliased type | `A<alias> T<type token>` |
pub(crate) fn imports(blob: &[u8], heaps: &Heaps) -> Result<Vec<String>> {
    let mut parser = Parser::new(blob);
    let text = |parser: &mut Parser| -> Result<String> {
        Ok(String::from_utf8_lossy(heaps.blob(parser.read_compressed_uint()?)?).into_owned())
    };
    let assembly = |parser: &mut Parser| -> Result<Token> {
        Ok(Token::from_parts(
            TABLE_ASSEMBLY_REF,
            parser.read_compressed_uint()?,
        ))
    };

    let mut usings = Vec::new();
    while parser.has_more_data() {
        let kind = parser.read_compressed_uint()?;
        let using = match kind {
            1 => format!("U{}", text(&mut parser)?),
            2 => {
                let assembly = assembly(&mut parser)?;
                format!("E{} {}", text(&mut parser)?, assembly)
            }
            3 => format!("T{}", type_token(parser.read_compressed_uint()?)),
            4 => {
                let alias = text(&mut parser)?;
                format!("X{} {}", alias, text(&mut parser)?)
            }
            5 => format!("Z{}", text(&mut parser)?),
            6 => {
                let alias = text(&mut parser)?;
                format!("Z{} {}", alias, assembly(&mut parser)?)
            }
            7 => {
                let alias = text(&mut parser)?;
                format!("A{} U{}", alias, text(&mut parser)?)
            }
            8 => {
                let alias = text(&mut parser)?;
                let assembly = assembly(&mut parser)?;
                format!("A{} E{} {}", alias, text(&mut parser)?, assembly)
            }
            9 => {
                let alias = text(&mut parser)?;
                format!(
                    "A{} T{}",
                    alias,
                    type_token(parser.read_compressed_uint()?)
                )
            }
            _ => return Err(malformed_error!("Invalid import kind {}", kind)),
        };
        usings.push(using);
    }
    Ok(usings)
}

/// Decode a local constant signature blob. Values without a CodeView representation, such as
/// `decimal` and `DateTime`, yield `None`; null references decode as `I32(0)`.
pub(crate) fn constant(blob: &[u8]) -> Result<Option<PdbConstantValue>> {
    let mut parser = Parser::new(blob);
    let mut code = parser.read_le::<u8>()?;
    while code == ELEMENT_TYPE_CMOD_REQD || code == ELEMENT_TYPE_CMOD_OPT {
        let _modifier = parser.read_compressed_uint()?;
        code = parser.read_le::<u8>()?;
    }

    let value = match code {
        ELEMENT_TYPE_BOOLEAN => PdbConstantValue::I8(i8::from(parser.read_le::<u8>()? != 0)),
        ELEMENT_TYPE_CHAR | ELEMENT_TYPE_U2 => PdbConstantValue::U16(parser.read_le::<u16>()?),
        ELEMENT_TYPE_I1 => PdbConstantValue::I8(parser.read_le::<i8>()?),
        ELEMENT_TYPE_U1 => PdbConstantValue::U16(u16::from(parser.read_le::<u8>()?)),
        ELEMENT_TYPE_I2 => PdbConstantValue::I16(parser.read_le::<i16>()?),
        ELEMENT_TYPE_I4 => PdbConstantValue::I32(parser.read_le::<i32>()?),
        ELEMENT_TYPE_U4 => PdbConstantValue::U32(parser.read_le::<u32>()?),
        ELEMENT_TYPE_I8 => PdbConstantValue::I64(parser.read_le::<i64>()?),
        ELEMENT_TYPE_U8 => PdbConstantValue::U64(parser.read_le::<u64>()?),
        ELEMENT_TYPE_R4 => PdbConstantValue::F32(parser.read_le::<f32>()?),
        ELEMENT_TYPE_R8 => PdbConstantValue::F64(parser.read_le::<f64>()?),
        ELEMENT_TYPE_STRING => {
            let rest = &blob[parser.pos()..];
            if rest == [0xFF] {
                PdbConstantValue::I32(0)
            } else {
                let units: Vec<u16> = rest
                    .chunks_exact(2)
                    .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
                    .collect();
                PdbConstantValue::String(
                    widestring::U16Str::from_slice(&units)
                        .to_string()
                        .map_err(|_| malformed_error!("Invalid UTF-16 in constant"))?,
                )
            }
        }
        ELEMENT_TYPE_VALUETYPE | ELEMENT_TYPE_CLASS => {
            let _type = parser.read_compressed_uint()?;
            if parser.has_more_data() {
                debug!(kind = code, "skipping constant without a CodeView encoding");
                return Ok(None);
            }
            PdbConstantValue::I32(0)
        }
        ELEMENT_TYPE_OBJECT => PdbConstantValue::I32(0),
        _ => return Err(malformed_error!("Invalid constant type 0x{:02X}", code)),
    };
    Ok(Some(value))
}

/// Async stepping information: catch handler offset and `(yield, resume, MoveNext row)` triples
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AsyncStepping {
    pub catch_handler_offset: Option<u32>,
    pub steps: Vec<(u32, u32, u32)>,
}

/// Decode an async method stepping information blob
pub(crate) fn async_stepping(blob: &[u8]) -> Result<AsyncStepping> {
    let mut parser = Parser::new(blob);
    let catch = parser.read_le::<u32>()?;

    let mut steps = Vec::new();
    while parser.has_more_data() {
        let yield_offset = parser.read_le::<u32>()?;
        let resume_offset = parser.read_le::<u32>()?;
        let method = parser.read_compressed_uint()?;
        steps.push((yield_offset, resume_offset, method));
    }

    Ok(AsyncStepping {
        catch_handler_offset: catch.checked_sub(1),
        steps,
    })
}

/// Decode a state machine hoisted local scopes blob
pub(crate) fn hoisted_scopes(blob: &[u8]) -> Result<Vec<IteratorScope>> {
    let mut parser = Parser::new(blob);
    let mut scopes = Vec::with_capacity(blob.len() / 8);
    while parser.has_more_data() {
        scopes.push(IteratorScope {
            offset: parser.read_le::<u32>()?,
            length: parser.read_le::<u32>()?,
        });
    }
    Ok(scopes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heaps() -> Heaps<'static> {
        Heaps {
            strings: &[0],
            blobs: &[
                0x00, 0x02, b'C', b':', 0x03, b's', b'r', b'c', 0x04, b'A', b'.', b'c', b's',
                0x06, b'S', b'y', b's', b't', b'e', b'm', 0x01, b'L',
            ],
            guids: &[],
        }
    }

    #[test]
    fn document_names() {
        assert_eq!(
            document_name(&[b'\\', 0x01, 0x04, 0x08], &heaps()).unwrap(),
            "C:\\src\\A.cs"
        );
        assert_eq!(document_name(&[0x00, 0x08], &heaps()).unwrap(), "A.cs");
        assert_eq!(
            document_name(&[b'/', 0x00, 0x04], &heaps()).unwrap(),
            "/src"
        );
    }

    #[test]
    fn sequence_point_deltas() {
        #[rustfmt::skip]
        let blob = [
            0x02,                   // local signature
            0x01,                   // initial document
            0x00, 0x00, 0x05, 0x0A, 0x03, // IL 0, lines 0, columns 5, line 10, column 3
            0x04, 0x02, 0x08, 0x02, 0x02, // IL +4, lines 2, columns +4, line +1, column +1
            0x00, 0x02,             // document 2
            0x03, 0x00, 0x00,       // IL +3 hidden
            0x01, 0x00, 0x02, 0x7F, 0x02, // IL +1, lines 0, columns 2, line -1, column +1
        ];
        let decoded = sequence_points(&blob, 0).unwrap();
        assert_eq!(decoded.local_signature, 2);
        assert_eq!(
            decoded.points,
            vec![
                (
                    1,
                    PdbLine {
                        offset: 0,
                        line_begin: 10,
                        col_begin: 3,
                        line_end: 10,
                        col_end: 8,
                    }
                ),
                (
                    1,
                    PdbLine {
                        offset: 4,
                        line_begin: 11,
                        col_begin: 4,
                        line_end: 13,
                        col_end: 8,
                    }
                ),
                (2, PdbLine::hidden(7)),
                (
                    2,
                    PdbLine {
                        offset: 8,
                        line_begin: 10,
                        col_begin: 5,
                        line_end: 10,
                        col_end: 7,
                    }
                ),
            ]
        );

        let single = sequence_points(&[0x00, 0x00, 0x00, 0x01, 0x01, 0x01], 3).unwrap();
        assert_eq!(single.points[0].0, 3);
        assert_eq!(single.points[0].1.col_end, 2);
    }

    #[test]
    fn import_strings() {
        #[rustfmt::skip]
        let blob = [
            0x01, 0x0D,             // using System
            0x02, 0x01, 0x0D,       // System from assembly ref 1
            0x03, 0x09,             // type ref row 2
            0x07, 0x14, 0x0D,       // L = System
            0x05, 0x14,             // extern alias L
        ];
        assert_eq!(
            imports(&blob, &heaps()).unwrap(),
            vec![
                "USystem".to_string(),
                "ESystem 0x23000001".to_string(),
                "T0x01000002".to_string(),
                "AL USystem".to_string(),
                "ZL".to_string(),
            ]
        );
        assert!(imports(&[0x0A], &heaps()).is_err());
    }

    #[test]
    fn constants() {
        assert_eq!(
            constant(&[ELEMENT_TYPE_I4, 0x2A, 0, 0, 0]).unwrap(),
            Some(PdbConstantValue::I32(42))
        );
        assert_eq!(
            constant(&[ELEMENT_TYPE_BOOLEAN, 0x01]).unwrap(),
            Some(PdbConstantValue::I8(1))
        );
        assert_eq!(
            constant(&[ELEMENT_TYPE_STRING, b'h', 0, b'i', 0]).unwrap(),
            Some(PdbConstantValue::String("hi".into()))
        );
        assert_eq!(
            constant(&[ELEMENT_TYPE_STRING, 0xFF]).unwrap(),
            Some(PdbConstantValue::I32(0))
        );
        assert_eq!(
            constant(&[ELEMENT_TYPE_CMOD_OPT, 0x05, ELEMENT_TYPE_U1, 0x07]).unwrap(),
            Some(PdbConstantValue::U16(7))
        );
        assert_eq!(
            constant(&[ELEMENT_TYPE_I2, 0xFE, 0xFF, 0x09]).unwrap(),
            Some(PdbConstantValue::I16(-2))
        );
        assert_eq!(constant(&[ELEMENT_TYPE_CLASS, 0x05]).unwrap(), Some(PdbConstantValue::I32(0)));
        assert_eq!(
            constant(&[ELEMENT_TYPE_VALUETYPE, 0x05, 1, 2, 3, 4]).unwrap(),
            None
        );
        assert!(constant(&[0x50]).is_err());
    }

    #[test]
    fn state_machine_blobs() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&10u32.to_le_bytes());
        blob.extend_from_slice(&20u32.to_le_bytes());
        blob.push(0x04);
        let stepping = async_stepping(&blob).unwrap();
        assert_eq!(stepping.catch_handler_offset, None);
        assert_eq!(stepping.steps, vec![(10, 20, 4)]);

        blob[0] = 0x31;
        assert_eq!(async_stepping(&blob).unwrap().catch_handler_offset, Some(0x30));

        let mut scopes = Vec::new();
        for value in [2u32, 8, 12, 4] {
            scopes.extend_from_slice(&value.to_le_bytes());
        }
        assert_eq!(
            hoisted_scopes(&scopes).unwrap(),
            vec![
                IteratorScope {
                    offset: 2,
                    length: 8
                },
                IteratorScope {
                    offset: 12,
                    length: 4
                },
            ]
        );
    }
}
