//! Native boundary tests
//!
//! Covers `sysreq.c`/`sysreq.n` dispatch, argument passing, native errors,
//! unbound natives and re-entrant calls back into bytecode.

use smx_bytecode::{Cell, CodeWriter, ImageBuilder, Opcode, PluginImage};
use smx_core::{
    Fault, Machine, NativeError, NativeRegistry, NativeSignature, ParamKind, VmError, VmOptions,
};
use std::sync::Arc;

struct Plugin {
    machine: Machine,
    entry: u32,
}

/// Assemble `Test` (the body below) plus an optional `Inner` that doubles its argument
fn plugin(natives: &[&str], registry: NativeRegistry, body: impl FnOnce(&mut CodeWriter)) -> Plugin {
    let mut code = CodeWriter::new();
    let entry = code.begin_function();
    body(&mut code);
    code.emit(Opcode::Retn, &[]);

    let inner = code.begin_function();
    code.emit(Opcode::LoadSPri, &[12]);
    code.emit(Opcode::SmulC, &[2]);
    code.emit(Opcode::Retn, &[]);

    let mut builder = ImageBuilder::new();
    builder.add_string("hello");
    for name in natives {
        builder.native(name);
    }
    builder.code(code).unwrap();
    builder.public("Test", entry);
    builder.public("Inner", inner);
    let image = PluginImage::load(&builder.build().unwrap()).unwrap();
    Plugin {
        machine: Machine::with_natives(Arc::new(image), VmOptions::default(), registry),
        entry,
    }
}

fn sum_registry() -> NativeRegistry {
    let mut registry = NativeRegistry::new();
    registry.register("Sum", |_, params| Ok(params.args().iter().sum()));
    registry
}

#[test_log::test]
fn test_sysreq_c_passes_arguments() {
    let mut p = plugin(&["Sum"], sum_registry(), |c| {
        c.emit(Opcode::PushC, &[2]);
        c.emit(Opcode::PushC, &[40]);
        c.emit(Opcode::PushC, &[2]);
        c.emit(Opcode::SysreqC, &[0]);
        c.emit(Opcode::Stack, &[12]);
    });
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 42);
}

#[test_log::test]
fn test_sysreq_n_cleans_up_stack() {
    let mut p = plugin(&["Sum"], sum_registry(), |c| {
        c.emit(Opcode::Lctrl, &[4]);
        c.emit(Opcode::MoveAlt, &[]);
        c.emit(Opcode::PushC, &[1]);
        c.emit(Opcode::PushC, &[2]);
        c.emit(Opcode::SysreqN, &[0, 2]);
        c.emit(Opcode::Lctrl, &[4]);
        c.emit(Opcode::Sub, &[]);
    });
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 0);
}

#[test_log::test]
fn test_native_argument_order() {
    let mut registry = NativeRegistry::new();
    registry.register("First", |_, params| params.cell(0));
    let mut p = plugin(&["First"], registry, |c| {
        c.emit(Opcode::PushC, &[2]);
        c.emit(Opcode::PushC, &[1]);
        c.emit(Opcode::SysreqN, &[0, 2]);
    });
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 1);
}

#[test_log::test]
fn test_native_reads_plugin_string() {
    let mut registry = NativeRegistry::new();
    registry.register("StrLen", |ctx, params| {
        let text = ctx.read_string(params.cell(0)?)?;
        Ok(text.len() as Cell)
    });
    let mut p = plugin(&["StrLen"], registry, |c| {
        c.emit(Opcode::PushC, &[0]);
        c.emit(Opcode::SysreqN, &[0, 1]);
    });
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 5);
}

#[test_log::test]
fn test_typed_native_writes_through_reference() {
    let mut registry = NativeRegistry::new();
    let signature = NativeSignature::new(vec![ParamKind::CellRef, ParamKind::Cell]).unwrap();
    registry.register_typed("Store", signature, |ctx, args| {
        let addr = args[0].as_cell().unwrap_or_default();
        let value = args[1].as_cell().unwrap_or_default();
        ctx.write_cell(addr, value)?;
        Ok(1)
    });
    let mut p = plugin(&["Store"], registry, |c| {
        c.emit(Opcode::Stack, &[-4]);
        c.emit(Opcode::ZeroS, &[-4]);
        c.emit(Opcode::PushC, &[99]);
        c.emit(Opcode::PushAdr, &[-4]);
        c.emit(Opcode::SysreqN, &[0, 2]);
        c.emit(Opcode::LoadSPri, &[-4]);
        c.emit(Opcode::Stack, &[4]);
    });
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 99);
}

#[test_log::test]
fn test_unbound_native_is_named() {
    let mut p = plugin(&["Sum", "Missing"], sum_registry(), |c| {
        c.emit(Opcode::PushC, &[0]);
        c.emit(Opcode::SysreqC, &[1]);
    });
    let err = p.machine.invoke(p.entry, &[]).unwrap_err();
    assert_eq!(
        err.fault(),
        Some(&Fault::NativeNotImplemented("Missing".to_string()))
    );
    assert!(err.to_string().contains("Missing"));
}

#[test_log::test]
fn test_invalid_native_index() {
    let mut p = plugin(&[], NativeRegistry::new(), |c| {
        c.emit(Opcode::PushC, &[0]);
        c.emit(Opcode::SysreqC, &[3]);
    });
    let err = p.machine.invoke(p.entry, &[]).unwrap_err();
    assert_eq!(err.fault(), Some(&Fault::InvalidNativeIndex(3)));
}

#[test_log::test]
fn test_native_error_is_reported_with_name() {
    let mut registry = NativeRegistry::new();
    registry.register("Fail", |_, _| Err(NativeError::raised("boom")));
    let mut p = plugin(&["Fail"], registry, |c| {
        c.emit(Opcode::SysreqN, &[0, 0]);
    });
    let err = p.machine.invoke(p.entry, &[]).unwrap_err();
    match &err {
        VmError::Native { native, error, trace } => {
            assert_eq!(native, "Fail");
            assert_eq!(error.to_string(), "boom");
            assert_eq!(trace.top().and_then(|f| f.function.as_deref()), Some("Test"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(p.machine.registers().stk, p.machine.stp());
}

#[test_log::test]
fn test_native_registered_after_init() {
    let mut p = plugin(&["Late"], NativeRegistry::new(), |c| {
        c.emit(Opcode::SysreqN, &[0, 0]);
    });
    assert!(p.machine.invoke(p.entry, &[]).is_err());

    p.machine.register_native("Late", |_, _| Ok(5));
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 5);
}

// ===== Re-entrancy =====

#[test_log::test]
fn test_native_calls_back_into_plugin() {
    let mut registry = NativeRegistry::new();
    registry.register("CallInner", |ctx, params| {
        let value = ctx.invoke_public("Inner", &[params.cell(0)?])?;
        Ok(value + 1)
    });
    let mut p = plugin(&["CallInner"], registry, |c| {
        c.emit(Opcode::Stack, &[-4]);
        c.emit(Opcode::ConstS, &[-4, 1000]);
        c.emit(Opcode::PushC, &[20]);
        c.emit(Opcode::SysreqN, &[0, 1]);
        // The local must survive the nested call
        c.emit(Opcode::LoadSAlt, &[-4]);
        c.emit(Opcode::Add, &[]);
        c.emit(Opcode::Stack, &[4]);
    });
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 1041);
    assert_eq!(p.machine.registers().stk, p.machine.stp());
}

#[test_log::test]
fn test_failed_nested_call_restores_stack() {
    let mut registry = NativeRegistry::new();
    registry.register("CallBad", |ctx, _| {
        let stk_before = ctx.machine().registers().stk;
        let result = ctx.invoke(3, &[1, 2, 3]);
        assert!(result.is_err());
        assert_eq!(ctx.machine().registers().stk, stk_before);
        Ok(7)
    });
    let mut p = plugin(&["CallBad"], registry, |c| {
        c.emit(Opcode::SysreqN, &[0, 0]);
    });
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 7);
}

#[test_log::test]
fn test_nested_error_propagates() {
    let mut registry = NativeRegistry::new();
    registry.register("CallMissing", |ctx, _| {
        ctx.invoke_public("NoSuchFunction", &[])?;
        Ok(0)
    });
    let mut p = plugin(&["CallMissing"], registry, |c| {
        c.emit(Opcode::SysreqN, &[0, 0]);
    });
    let err = p.machine.invoke(p.entry, &[]).unwrap_err();
    assert!(err.to_string().contains("NoSuchFunction"), "{err}");
}

#[test_log::test]
fn test_reentrancy_limit() {
    let mut registry = NativeRegistry::new();
    registry.register("Recurse", |ctx, _| {
        ctx.invoke_public("Test", &[])?;
        Ok(0)
    });
    let mut p = plugin(&["Recurse"], registry, |c| {
        c.emit(Opcode::SysreqN, &[0, 0]);
    });
    let err = p.machine.invoke(p.entry, &[]).unwrap_err();
    assert!(err.to_string().contains("Re-entrancy limit"), "{err}");
    assert_eq!(p.machine.registers().stk, p.machine.stp());
}

// ===== Handles =====

#[test_log::test]
fn test_handles_across_natives() {
    let mut registry = NativeRegistry::new();
    registry.register("CreateList", |ctx, _| {
        Ok(ctx.handles().create("List", Vec::<Cell>::new(), None))
    });
    registry.register("ListPush", |ctx, params| {
        let (id, value) = (params.cell(0)?, params.cell(1)?);
        Ok(ctx.handles().with(id, "List", |list: &mut Vec<Cell>| {
            list.push(value);
            list.len() as Cell
        })?)
    });
    let mut p = plugin(&["CreateList", "ListPush"], registry, |c| {
        c.emit(Opcode::SysreqN, &[0, 0]);
        c.emit(Opcode::PushC, &[5]);
        c.emit(Opcode::PushPri, &[]);
        c.emit(Opcode::SysreqN, &[1, 2]);
    });
    assert_eq!(p.machine.invoke(p.entry, &[]).unwrap(), 1);
    assert_eq!(p.machine.handles().len(), 1);
}

#[test_log::test]
fn test_bad_handle_is_native_error() {
    let mut registry = NativeRegistry::new();
    registry.register("Use", |ctx, params| {
        Ok(ctx.handles().with(params.cell(0)?, "List", |_: &mut Vec<Cell>| 0)?)
    });
    let mut p = plugin(&["Use"], registry, |c| {
        c.emit(Opcode::PushC, &[12345]);
        c.emit(Opcode::SysreqN, &[0, 1]);
    });
    let err = p.machine.invoke(p.entry, &[]).unwrap_err();
    assert!(matches!(err, VmError::Native { ref native, .. } if native == "Use"));
    assert!(err.to_string().contains("Use"));
}
