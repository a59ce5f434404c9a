//! Debug symbol integration tests.
//!
//! Symbols are produced the way a compiler back end would: an [`IlGenerator`] records sequence
//! points and scopes, the result is replayed into a [`LegacyPdbWriter`], and the bytes are read
//! back through format detection.

use dotsym::{
    assembly::{IlGenerator, OpCode},
    pdb::{
        convert_to_legacy, emit_function, load_pdb, sniff, ChecksumAlgorithm, LegacyPdbWriter,
        PdbFormat, PdbFunction, PdbSlot, PdbSource, PdbWriter, PdbWriterOptions,
        PeDebugDirectory, SourceLocation,
    },
    token::Token,
    Error, Result,
};
use uguid::guid;

const METHOD: Token = Token(0x0600_0001);

fn location(line: u32) -> SourceLocation {
    SourceLocation {
        source: 0,
        start_line: line,
        start_column: 9,
        end_line: line,
        end_column: 20,
    }
}

/// int x = 1; return x;
fn compiled_function() -> Result<PdbFunction> {
    let mut generator = IlGenerator::new(METHOD);
    generator.begin_scope()?;
    generator.add_variable(PdbSlot {
        index: 0,
        name: "x".into(),
        compiler_generated: false,
        signature_token: Token(0x1100_0001),
    })?;
    generator.mark_sequence_point(location(3));
    generator.emit(OpCode::LdcI41)?;
    generator.emit_local(OpCode::Stloc0, 0)?;
    generator.mark_sequence_point(location(4));
    generator.emit_local(OpCode::Ldloc0, 0)?;
    generator.emit(OpCode::Ret)?;
    generator.end_scope()?;

    Ok(generator.finish()?.to_pdb_function(METHOD))
}

fn legacy_bytes(options: PdbWriterOptions) -> Result<Vec<u8>> {
    let sources = vec![PdbSource::with_checksum_of(
        "C:\\src\\Program.cs",
        b"class Program { }",
        ChecksumAlgorithm::Sha1,
    )];

    let mut writer = LegacyPdbWriter::new(options);
    emit_function(&mut writer, &compiled_function()?, &sources)?;
    writer.set_entry_point(METHOD)?;
    writer.finish()
}

#[test]
fn generated_symbols_survive_the_legacy_format() -> Result<()> {
    let guid = guid!("01234567-89ab-cdef-0123-456789abcdef");
    let bytes = legacy_bytes(PdbWriterOptions::new(guid, 2, "Program.pdb"))?;
    assert_eq!(sniff(&bytes), Some(PdbFormat::Legacy));

    let info = load_pdb(&bytes)?;
    assert_eq!(info.format, PdbFormat::Legacy);
    assert_eq!(info.age, 2);
    assert_eq!(info.guid, guid);
    assert_eq!(info.entry_point, Some(METHOD));
    assert_eq!(info.sources.len(), 1);
    assert_eq!(info.sources[0].algorithm(), Some(ChecksumAlgorithm::Sha1));

    let function = info.function(METHOD).expect("function is present");
    assert_eq!(function.length, 4);
    assert_eq!(function.line_count(), 2);
    assert_eq!(function.line_for(1).map(|(_, line)| line.line_begin), Some(3));
    assert_eq!(function.line_for(3).map(|(_, line)| line.line_begin), Some(4));

    let names: Vec<&str> = function
        .all_scopes()
        .iter()
        .flat_map(|scope| scope.slots.iter().map(|slot| slot.name.as_str()))
        .collect();
    assert_eq!(names, vec!["x"]);
    Ok(())
}

#[test]
fn conversion_changes_only_the_page_size() -> Result<()> {
    let bytes = legacy_bytes(PdbWriterOptions::default())?;
    let converted = convert_to_legacy(&bytes, 4096)?;
    assert_eq!(converted.len() % 4096, 0);
    assert_eq!(load_pdb(&converted)?, load_pdb(&bytes)?);
    Ok(())
}

#[test]
fn unknown_data_is_rejected() {
    assert_eq!(sniff(b"not a pdb at all"), None);
    assert!(matches!(load_pdb(b"not a pdb at all"), Err(Error::NotSupported)));
}

#[test]
fn codeview_debug_directory() -> Result<()> {
    let guid = guid!("01234567-89ab-cdef-0123-456789abcdef");
    let directory = PeDebugDirectory::codeview(&guid, 1, "Program.pdb")?;
    assert_eq!(directory.header_bytes()?.len(), 28);
    assert!(directory.data.starts_with(b"RSDS"));
    assert!(directory.data.ends_with(b"Program.pdb\0"));
    Ok(())
}
