//! Method body codec integration tests.
//!
//! Bodies are produced with the public generator and rewriter, serialized, and parsed back.

use dotsym::{
    assembly::{
        decode_operations, encode_operations, HandlerKind, IlGenerator, IlRewriter, MethodBody,
        OpCode, OperationValue, RewriterOptions,
    },
    token::Token,
    Error, Result,
};

const METHOD: Token = Token(0x0600_0001);

/// try { nop; leave END } finally { endfinally } END: ret
fn try_finally() -> Result<MethodBody> {
    let mut generator = IlGenerator::new(METHOD);
    let end = generator.define_label();

    generator.begin_try_body()?;
    generator.emit(OpCode::Nop)?;
    generator.emit_label(OpCode::Leave, end)?;
    generator.begin_finally_block()?;
    generator.emit(OpCode::Endfinally)?;
    generator.end_try_body()?;
    generator.mark_label(end)?;
    generator.emit(OpCode::Ret)?;

    Ok(generator.finish()?.to_method_body(Token(0), false))
}

#[test]
fn tiny_body_round_trip() -> Result<()> {
    let bytes = [0x0A, 0x17, 0x2A];
    let body = MethodBody::parse(&bytes)?;
    assert!(body.is_tiny());
    assert_eq!(body.code, vec![0x17, 0x2A]);
    assert!(body.exception_handlers.is_empty());
    assert_eq!(body.to_bytes()?, bytes);
    Ok(())
}

#[test]
fn fat_body_with_handlers_round_trip() -> Result<()> {
    let body = try_finally()?;
    assert_eq!(body.exception_handlers.len(), 1);
    assert_eq!(body.exception_handlers[0].kind, HandlerKind::Finally);

    let bytes = body.to_bytes()?;
    assert_eq!(bytes[0] & 0x03, 0x03, "handlers need a fat header");

    let parsed = MethodBody::parse(&bytes)?;
    assert_eq!(parsed, body);
    Ok(())
}

#[test]
fn truncated_and_empty_bodies() {
    assert!(matches!(MethodBody::parse(&[]), Err(Error::Empty)));
    // Tiny header announcing four bytes of code, only one present
    assert!(MethodBody::parse(&[0x12, 0x00]).is_err());
}

#[test]
fn branches_decode_to_absolute_targets() -> Result<()> {
    // ldarg.0; brtrue.s +1; ret; ldc.i4.1; pop; ret
    let code = [0x02, 0x2D, 0x01, 0x2A, 0x17, 0x26, 0x2A];
    let operations = decode_operations(&code)?;
    assert_eq!(operations.len(), 6);
    assert_eq!(operations[1].opcode, OpCode::BrtrueS);
    assert_eq!(operations[1].targets(), &[4]);
    assert_eq!(operations[3].value, OperationValue::I32(1));
    assert_eq!(encode_operations(&operations)?, code);
    Ok(())
}

#[test]
fn switch_targets() -> Result<()> {
    // ldarg.0; switch (2 targets: +0, +1); nop; ret
    let code = [
        0x02, 0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x00, 0x2A,
    ];
    let operations = decode_operations(&code)?;
    assert_eq!(operations[1].targets(), &[14, 15]);
    Ok(())
}

#[test]
fn code_only_rewrite_keeps_the_code() -> Result<()> {
    // ldc.i4.0; stloc.0; ldloc.0; ret
    let body = MethodBody {
        max_stack: 1,
        local_signature_token: Token(0x1100_0001),
        init_locals: true,
        code: vec![0x16, 0x0A, 0x06, 0x2A],
        exception_handlers: Vec::new(),
    };
    let operations = decode_operations(&body.code)?;

    let rewritten =
        IlRewriter::new(METHOD, RewriterOptions::code_only()).rewrite(&body, &operations, None)?;
    assert_eq!(rewritten.body.code, body.code);
    assert_eq!(rewritten.body.local_signature_token, body.local_signature_token);
    assert!(rewritten.body.init_locals);
    assert_eq!(rewritten.locals, vec![0]);
    Ok(())
}

#[test]
fn canonical_rewrite_keeps_the_semantics() -> Result<()> {
    let body = try_finally()?;
    let operations = decode_operations(&body.code)?;

    let rewritten =
        IlRewriter::new(METHOD, RewriterOptions::new()).rewrite(&body, &operations, None)?;
    let rewritten_operations = decode_operations(&rewritten.body.code)?;

    assert_eq!(rewritten_operations.len(), operations.len());
    for (before, after) in operations.iter().zip(&rewritten_operations) {
        assert_eq!(before.opcode.long_form(), after.opcode.long_form());
    }
    assert_eq!(rewritten.body.exception_handlers, body.exception_handlers);
    assert_eq!(rewritten.generated.scopes.len(), 1);
    Ok(())
}
