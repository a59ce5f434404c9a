//! The `#~` stream of a portable PDB and its debug tables.
//!
//! A portable PDB only stores the tables `0x30` to `0x37`; indices into the type system tables
//! are sized by the row counts the `#Pdb` stream carries for the described image.

use crate::{
    file::io::{read_le_at, read_le_at_dyn},
    token::Token,
    Error::OutOfBounds,
    Result,
};

pub(crate) const TABLE_DOCUMENT: usize = 0x30;
pub(crate) const TABLE_METHOD_DEBUG_INFORMATION: usize = 0x31;
pub(crate) const TABLE_LOCAL_SCOPE: usize = 0x32;
pub(crate) const TABLE_LOCAL_VARIABLE: usize = 0x33;
pub(crate) const TABLE_LOCAL_CONSTANT: usize = 0x34;
pub(crate) const TABLE_IMPORT_SCOPE: usize = 0x35;
pub(crate) const TABLE_STATE_MACHINE_METHOD: usize = 0x36;
pub(crate) const TABLE_CUSTOM_DEBUG_INFORMATION: usize = 0x37;

const HEAP_STRINGS_LARGE: u8 = 0x01;
const HEAP_GUID_LARGE: u8 = 0x02;
const HEAP_BLOB_LARGE: u8 = 0x04;

/// Tables of the `HasCustomDebugInformation` coded index, by tag
const HAS_CUSTOM_DEBUG_INFORMATION: [u8; 27] = [
    0x06, 0x04, 0x01, 0x02, 0x08, 0x09, 0x0A, 0x00, 0x0E, 0x17, 0x14, 0x11, 0x1A, 0x1B, 0x20,
    0x23, 0x26, 0x27, 0x28, 0x2A, 0x2C, 0x2B, 0x30, 0x32, 0x33, 0x34, 0x35,
];
const HAS_CUSTOM_DEBUG_INFORMATION_BITS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocumentRow {
    pub name: u32,
    pub hash_algorithm: u32,
    pub hash: u32,
    pub language: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MethodDebugInformationRow {
    pub document: u32,
    pub sequence_points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalScopeRow {
    pub method: u32,
    pub import_scope: u32,
    pub variable_list: u32,
    pub constant_list: u32,
    pub start_offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalVariableRow {
    pub attributes: u16,
    pub index: u16,
    pub name: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalConstantRow {
    pub name: u32,
    pub signature: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportScopeRow {
    pub parent: u32,
    pub imports: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateMachineMethodRow {
    pub move_next_method: u32,
    pub kickoff_method: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CustomDebugInformationRow {
    pub parent: Token,
    pub kind: u32,
    pub value: u32,
}

/// Column widths derived from the heap size flags and the row counts
struct Layout {
    rows: [u32; 64],
    strings_large: bool,
    guid_large: bool,
    blob_large: bool,
}

impl Layout {
    fn table_large(&self, table: usize) -> bool {
        self.rows[table] > u32::from(u16::MAX)
    }

    fn coded_large(&self) -> bool {
        let max_rows = HAS_CUSTOM_DEBUG_INFORMATION
            .iter()
            .map(|table| self.rows[*table as usize])
            .max()
            .unwrap_or(0);
        max_rows >= 1 << (16 - HAS_CUSTOM_DEBUG_INFORMATION_BITS)
    }
}

/// Cursor over the table rows of the `#~` stream
struct RowReader<'a> {
    data: &'a [u8],
    offset: usize,
    layout: &'a Layout,
}

impl RowReader<'_> {
    fn table(&mut self, table: usize) -> Result<u32> {
        read_le_at_dyn(self.data, &mut self.offset, self.layout.table_large(table))
    }

    fn string(&mut self) -> Result<u32> {
        read_le_at_dyn(self.data, &mut self.offset, self.layout.strings_large)
    }

    fn guid(&mut self) -> Result<u32> {
        read_le_at_dyn(self.data, &mut self.offset, self.layout.guid_large)
    }

    fn blob(&mut self) -> Result<u32> {
        read_le_at_dyn(self.data, &mut self.offset, self.layout.blob_large)
    }

    fn u16(&mut self) -> Result<u16> {
        read_le_at::<u16>(self.data, &mut self.offset)
    }

    fn u32(&mut self) -> Result<u32> {
        read_le_at::<u32>(self.data, &mut self.offset)
    }

    fn has_custom_debug_information(&mut self) -> Result<Token> {
        let value = read_le_at_dyn(self.data, &mut self.offset, self.layout.coded_large())?;
        let tag = (value & ((1 << HAS_CUSTOM_DEBUG_INFORMATION_BITS) - 1)) as usize;
        let table = HAS_CUSTOM_DEBUG_INFORMATION
            .get(tag)
            .ok_or_else(|| malformed_error!("Invalid HasCustomDebugInformation tag {}", tag))?;
        Ok(Token::from_parts(
            *table,
            value >> HAS_CUSTOM_DEBUG_INFORMATION_BITS,
        ))
    }

    fn rows<T>(
        &mut self,
        count: u32,
        mut read: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut rows = Vec::with_capacity((count as usize).min(self.data.len()));
        for _ in 0..count {
            rows.push(read(self)?);
        }
        Ok(rows)
    }
}

/// The debug tables of a portable PDB; row `n` of a table is at index `n - 1`.
#[derive(Debug)]
pub(crate) struct Tables {
    pub rows: [u32; 64],
    pub documents: Vec<DocumentRow>,
    pub methods: Vec<MethodDebugInformationRow>,
    pub local_scopes: Vec<LocalScopeRow>,
    pub local_variables: Vec<LocalVariableRow>,
    pub local_constants: Vec<LocalConstantRow>,
    pub import_scopes: Vec<ImportScopeRow>,
    pub state_machines: Vec<StateMachineMethodRow>,
    pub custom_debug_information: Vec<CustomDebugInformationRow>,
}

impl Tables {
    /// Decode the `#~` stream. `type_system_rows` sizes indices into the image's tables.
    pub fn read(data: &[u8], type_system_rows: &[u32; 64]) -> Result<Tables> {
        if data.len() < 24 {
            return Err(OutOfBounds);
        }
        let heap_sizes = data[6];
        let valid = read_le_at::<u64>(data, &mut 8)?;

        let mut rows = *type_system_rows;
        let mut offset = 24;
        for (table, count) in rows.iter_mut().enumerate() {
            if valid & (1 << table) != 0 {
                if table < TABLE_DOCUMENT {
                    return Err(malformed_error!(
                        "Type system table 0x{:02X} in a standalone PDB",
                        table
                    ));
                }
                *count = read_le_at::<u32>(data, &mut offset)?;
            }
        }
        if valid >> (TABLE_CUSTOM_DEBUG_INFORMATION + 1) != 0 {
            return Err(malformed_error!("Unknown tables in mask 0x{:016X}", valid));
        }

        let layout = Layout {
            rows,
            strings_large: heap_sizes & HEAP_STRINGS_LARGE != 0,
            guid_large: heap_sizes & HEAP_GUID_LARGE != 0,
            blob_large: heap_sizes & HEAP_BLOB_LARGE != 0,
        };
        let mut reader = RowReader {
            data,
            offset,
            layout: &layout,
        };

        let documents = reader.rows(rows[TABLE_DOCUMENT], |r| {
            Ok(DocumentRow {
                name: r.blob()?,
                hash_algorithm: r.guid()?,
                hash: r.blob()?,
                language: r.guid()?,
            })
        })?;
        let methods = reader.rows(rows[TABLE_METHOD_DEBUG_INFORMATION], |r| {
            Ok(MethodDebugInformationRow {
                document: r.table(TABLE_DOCUMENT)?,
                sequence_points: r.blob()?,
            })
        })?;
        let local_scopes = reader.rows(rows[TABLE_LOCAL_SCOPE], |r| {
            Ok(LocalScopeRow {
                method: r.table(usize::from(Token::TABLE_METHOD_DEF))?,
                import_scope: r.table(TABLE_IMPORT_SCOPE)?,
                variable_list: r.table(TABLE_LOCAL_VARIABLE)?,
                constant_list: r.table(TABLE_LOCAL_CONSTANT)?,
                start_offset: r.u32()?,
                length: r.u32()?,
            })
        })?;
        let local_variables = reader.rows(rows[TABLE_LOCAL_VARIABLE], |r| {
            Ok(LocalVariableRow {
                attributes: r.u16()?,
                index: r.u16()?,
                name: r.string()?,
            })
        })?;
        let local_constants = reader.rows(rows[TABLE_LOCAL_CONSTANT], |r| {
            Ok(LocalConstantRow {
                name: r.string()?,
                signature: r.blob()?,
            })
        })?;
        let import_scopes = reader.rows(rows[TABLE_IMPORT_SCOPE], |r| {
            Ok(ImportScopeRow {
                parent: r.table(TABLE_IMPORT_SCOPE)?,
                imports: r.blob()?,
            })
        })?;
        let state_machines = reader.rows(rows[TABLE_STATE_MACHINE_METHOD], |r| {
            Ok(StateMachineMethodRow {
                move_next_method: r.table(usize::from(Token::TABLE_METHOD_DEF))?,
                kickoff_method: r.table(usize::from(Token::TABLE_METHOD_DEF))?,
            })
        })?;
        let custom_debug_information = reader.rows(rows[TABLE_CUSTOM_DEBUG_INFORMATION], |r| {
            Ok(CustomDebugInformationRow {
                parent: r.has_custom_debug_information()?,
                kind: r.guid()?,
                value: r.blob()?,
            })
        })?;

        Ok(Tables {
            rows,
            documents,
            methods,
            local_scopes,
            local_variables,
            local_constants,
            import_scopes,
            state_machines,
            custom_debug_information,
        })
    }

    /// Rows `[list, next)` of a list column, where `next` is the list start of the following
    /// row or the end of the target table.
    pub fn list_range(list: u32, next: Option<u32>, target_rows: usize) -> std::ops::Range<usize> {
        let start = (list as usize).saturating_sub(1).min(target_rows);
        let end = next
            .map_or(target_rows, |next| (next as usize).saturating_sub(1))
            .clamp(start, target_rows);
        start..end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_tables() {
        let mut data = vec![0, 0, 0, 0, 2, 0, 0, 1];
        let valid: u64 = (1 << TABLE_DOCUMENT) | (1 << TABLE_CUSTOM_DEBUG_INFORMATION);
        data.extend_from_slice(&valid.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        #[rustfmt::skip]
        let rows = [
            0x01, 0x00, 0x01, 0x00, 0x05, 0x00, 0x02, 0x00,
            0x20, 0x00, 0x03, 0x00, 0x09, 0x00,
        ];
        data.extend_from_slice(&rows);

        let mut type_system = [0u32; 64];
        type_system[0x06] = 3;
        let tables = Tables::read(&data, &type_system).unwrap();
        assert_eq!(
            tables.documents,
            vec![DocumentRow {
                name: 1,
                hash_algorithm: 1,
                hash: 5,
                language: 2,
            }]
        );
        assert_eq!(
            tables.custom_debug_information,
            vec![CustomDebugInformationRow {
                parent: Token(0x0600_0001),
                kind: 3,
                value: 9,
            }]
        );
        assert_eq!(tables.rows[0x06], 3);
    }

    #[test]
    fn type_system_tables_are_rejected() {
        let mut data = vec![0, 0, 0, 0, 2, 0, 0, 1];
        data.extend_from_slice(&(1u64 << 0x02).to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        assert!(Tables::read(&data, &[0; 64]).is_err());
    }

    #[test]
    fn list_ranges() {
        assert_eq!(Tables::list_range(1, Some(3), 5), 0..2);
        assert_eq!(Tables::list_range(3, None, 5), 2..5);
        assert_eq!(Tables::list_range(4, Some(4), 5), 3..3);
        assert_eq!(Tables::list_range(7, None, 5), 5..5);
        assert_eq!(Tables::list_range(3, Some(2), 5), 2..2);
    }
}
