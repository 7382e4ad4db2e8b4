//! Plugin Call Layer Test Suite
//!
//! Images are assembled with [`CodeWriter`]/[`ImageBuilder`] and driven
//! through [`Plugin`]: typed and manual calls, copy-back, entry points,
//! stack discipline after nested and failing calls, and summaries.
//!
//! # Running Tests
//! ```bash
//! cargo test -p smx-runtime --test plugin_tests
//! ```

use smx_bytecode::{
    Cell, CodeWriter, FunctionSignature, ImageBuilder, Opcode, ParamType, PluginInfo, TypeInfo,
    TypeKind,
};
use smx_core::VmError;
use smx_runtime::{CallError, Error, Plugin, RuntimeOptions, Value};

fn int() -> TypeInfo {
    TypeInfo::new(TypeKind::Int32)
}

fn param(ty: TypeInfo, by_ref: bool) -> ParamType {
    ParamType { ty, by_ref }
}

fn signature(return_type: TypeInfo, params: Vec<ParamType>) -> FunctionSignature {
    FunctionSignature {
        return_type,
        params,
        variadic: false,
    }
}

/// Load an image assembled by `build` with the given options
fn load_with(
    options: RuntimeOptions,
    build: impl FnOnce(&mut ImageBuilder, &mut CodeWriter),
) -> Plugin {
    let mut builder = ImageBuilder::new();
    let mut code = CodeWriter::new();
    build(&mut builder, &mut code);
    builder.code(code).unwrap();
    Plugin::load_with(&builder.build().unwrap(), options).unwrap()
}

fn load(build: impl FnOnce(&mut ImageBuilder, &mut CodeWriter)) -> Plugin {
    load_with(RuntimeOptions::default(), build)
}

/// Stack and heap are back where a fresh call starts
fn assert_clean(plugin: &Plugin) {
    let registers = plugin.machine().registers();
    assert_eq!(registers.stk, plugin.machine().stp());
    assert_eq!(registers.hea, plugin.image().data_size() as Cell);
}

/// `ReturnTwentyThree() -> int`
fn return_twenty_three(builder: &mut ImageBuilder, code: &mut CodeWriter) -> u32 {
    let addr = code.begin_function();
    code.emit(Opcode::ConstPri, &[23]);
    code.emit(Opcode::Retn, &[]);
    builder.typed_public("ReturnTwentyThree", addr, signature(int(), vec![]));
    addr
}

// ===== Entry Points =====

mod entry {
    use super::*;

    #[test_log::test]
    fn test_return_twenty_three() {
        let mut plugin = load(|b, c| {
            return_twenty_three(b, c);
        });
        let result = plugin.call("ReturnTwentyThree", &[]).unwrap();
        assert_eq!(result.value, Value::Int(23));
        assert_eq!(result.raw, 23);
        assert!(result.args.is_empty());
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_run_uses_main() {
        let mut plugin = load(|b, c| {
            let addr = return_twenty_three(b, c);
            b.main(addr);
        });
        assert_eq!(plugin.run().unwrap(), Some(23));
    }

    #[test_log::test]
    fn test_run_without_entry_point() {
        let mut plugin = load(|b, c| {
            return_twenty_three(b, c);
        });
        assert_eq!(plugin.run().unwrap(), None);
    }

    #[test_log::test]
    fn test_run_collects_console_output() {
        let mut plugin = load(|b, c| {
            let print = b.native("PrintToServer") as Cell;
            let hello = b.add_string("Hello %s") as Cell;
            let world = b.add_string("world") as Cell;
            let count_fmt = b.add_string("Count %d") as Cell;
            let seven = b.add_cells(&[7]) as Cell;

            let start = c.begin_function();
            c.emit(Opcode::PushC, &[world]);
            c.emit(Opcode::PushC, &[hello]);
            c.emit(Opcode::SysreqN, &[print, 2]);
            c.emit(Opcode::PushC, &[seven]);
            c.emit(Opcode::PushC, &[count_fmt]);
            c.emit(Opcode::SysreqN, &[print, 2]);
            c.emit(Opcode::ZeroPri, &[]);
            c.emit(Opcode::Retn, &[]);
            b.public("OnPluginStart", start);
        });

        assert_eq!(plugin.run().unwrap(), Some(0));
        assert_eq!(plugin.console_output(), "Hello world\nCount 7\n");
        assert_eq!(plugin.take_console_output(), "Hello world\nCount 7\n");
        assert_eq!(plugin.console_output(), "");
        assert_clean(&plugin);
    }
}

// ===== Typed Calls =====

mod typed {
    use super::*;

    /// `AddRef(int &total, int amount) -> int`
    fn add_ref(builder: &mut ImageBuilder, code: &mut CodeWriter) {
        let addr = code.begin_function();
        code.emit(Opcode::LrefSPri, &[12]);
        code.emit(Opcode::LoadSAlt, &[16]);
        code.emit(Opcode::Add, &[]);
        code.emit(Opcode::SrefSPri, &[12]);
        code.emit(Opcode::Retn, &[]);
        builder.typed_public(
            "AddRef",
            addr,
            signature(int(), vec![param(int(), true), param(int(), false)]),
        );
    }

    #[test_log::test]
    fn test_reference_copy_back() {
        let mut plugin = load(add_ref);
        let result = plugin
            .call("AddRef", &[Value::Int(10), Value::Int(5)])
            .unwrap();
        assert_eq!(result.value, Value::Int(15));
        assert_eq!(result.args, [Value::Int(15), Value::Int(5)]);
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_fixed_array_return() {
        let mut plugin = load(|b, c| {
            let addr = c.begin_function();
            for (index, value) in [7, 8, 9].into_iter().enumerate() {
                c.emit(Opcode::LoadSPri, &[12]);
                c.emit(Opcode::AddC, &[index as Cell * 4]);
                c.emit(Opcode::MoveAlt, &[]);
                c.emit(Opcode::ConstPri, &[value]);
                c.emit(Opcode::StorI, &[]);
            }
            c.emit(Opcode::Retn, &[]);
            b.typed_public(
                "Triple",
                addr,
                signature(TypeInfo::fixed_array(int(), 3), vec![]),
            );
        });

        let result = plugin.call("Triple", &[]).unwrap();
        assert_eq!(
            result.value,
            Value::Array(vec![Value::Int(7), Value::Int(8), Value::Int(9)])
        );
        assert!(result.args.is_empty());
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_fixed_array_return_not_counted() {
        // Pair(int a) -> int[2] returns { argc, a }
        let mut plugin = load(|b, c| {
            let addr = c.begin_function();
            for (slot, source) in [(0, 8), (4, 12)] {
                c.emit(Opcode::LoadSPri, &[16]);
                c.emit(Opcode::AddC, &[slot]);
                c.emit(Opcode::MoveAlt, &[]);
                c.emit(Opcode::LoadSPri, &[source]);
                c.emit(Opcode::StorI, &[]);
            }
            c.emit(Opcode::Retn, &[]);
            b.typed_public(
                "Pair",
                addr,
                signature(TypeInfo::fixed_array(int(), 2), vec![param(int(), false)]),
            );
        });

        let result = plugin.call("Pair", &[Value::Int(7)]).unwrap();
        assert_eq!(result.value, Value::Array(vec![Value::Int(1), Value::Int(7)]));
        assert_eq!(result.args, [Value::Int(7)]);
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_float_natives() {
        let mut plugin = load(|b, c| {
            let div = b.native("FloatDiv") as Cell;
            let round = b.native("RoundToNearest") as Cell;
            let float = TypeInfo::new(TypeKind::Float32);

            let half = c.begin_function();
            c.emit(Opcode::PushC, &[2.0f32.to_bits() as Cell]);
            c.emit(Opcode::PushS, &[12]);
            c.emit(Opcode::SysreqN, &[div, 2]);
            c.emit(Opcode::Retn, &[]);
            b.typed_public(
                "Half",
                half,
                signature(float.clone(), vec![param(float.clone(), false)]),
            );

            let nearest = c.begin_function();
            c.emit(Opcode::PushS, &[12]);
            c.emit(Opcode::SysreqN, &[round, 1]);
            c.emit(Opcode::Retn, &[]);
            b.typed_public("Nearest", nearest, signature(int(), vec![param(float, false)]));
        });

        let half = plugin.call("Half", &[Value::Float(2.5)]).unwrap();
        assert_eq!(half.value, Value::Float(1.25));
        let up = plugin.call("Nearest", &[Value::Float(2.5)]).unwrap();
        assert_eq!(up.value, Value::Int(3));
        let down = plugin.call("Nearest", &[Value::Float(-2.6)]).unwrap();
        assert_eq!(down.value, Value::Int(-3));
    }

    #[test_log::test]
    fn test_argument_errors() {
        let mut plugin = load(add_ref);
        let err = plugin.call("AddRef", &[Value::Int(1)]).unwrap_err();
        assert!(matches!(
            err,
            Error::Call(CallError::ArgumentCount {
                expected: 2,
                actual: 1,
                ..
            })
        ));

        let err = plugin
            .call("AddRef", &[Value::from("x"), Value::Int(1)])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Call(CallError::ArgumentType { index: 0, .. })
        ));

        let err = plugin.call("Missing", &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Call(CallError::UnknownFunction(ref name)) if name == "Missing"
        ));
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_mixed_arguments_rejected() {
        let mut plugin = load(add_ref);
        let mut function = plugin.function("AddRef").unwrap();
        function.push_cell_ref(1).push_cell(2);
        let err = plugin
            .call_function(&mut function, &[Value::Int(1)])
            .unwrap_err();
        assert!(matches!(err, Error::Call(CallError::MixedArguments(_))));
    }

    #[test_log::test]
    fn test_missing_signature() {
        let build = |b: &mut ImageBuilder, c: &mut CodeWriter| {
            let addr = c.begin_function();
            c.emit(Opcode::LoadSPri, &[12]);
            c.emit(Opcode::Retn, &[]);
            b.public("Untyped", addr);
        };

        let mut plugin = load(build);
        let result = plugin.call("Untyped", &[Value::Int(41)]).unwrap();
        assert_eq!(result.value, Value::Int(41));

        let options = RuntimeOptions {
            require_signatures: true,
            ..Default::default()
        };
        let mut strict = load_with(options, build);
        let err = strict.call("Untyped", &[Value::Int(41)]).unwrap_err();
        assert!(matches!(err, Error::Call(CallError::MissingSignature(_))));
    }
}

// ===== Manual Parameters =====

mod manual {
    use super::*;

    /// `Copy(char[] dest, int maxlen) -> int` copying "hello" with strcopy
    fn copy_plugin() -> Plugin {
        load(|b, c| {
            let strcopy = b.native("strcopy") as Cell;
            let hello = b.add_string("hello") as Cell;
            let addr = c.begin_function();
            c.emit(Opcode::PushC, &[hello]);
            c.emit(Opcode::PushS, &[16]);
            c.emit(Opcode::PushS, &[12]);
            c.emit(Opcode::SysreqN, &[strcopy, 3]);
            c.emit(Opcode::Retn, &[]);
            b.public("Copy", addr);
        })
    }

    #[test_log::test]
    fn test_string_copy_back_sizes() {
        let mut plugin = copy_plugin();
        for (size, expected, written) in [
            (0, "", 0),
            (1, "", 0),
            (6, "hello", 5),
            (32, "hello", 5),
            (4, "hel", 3),
        ] {
            let mut function = plugin.function("Copy").unwrap();
            function
                .push_string_ex(b"", size, true)
                .push_cell(size as Cell);
            let result = plugin.invoke(&mut function).unwrap();
            assert_eq!(result.raw, written, "size {size}");
            assert_eq!(result.args[0], Value::String(expected.into()), "size {size}");
            assert!(function.params().is_empty());
            assert_clean(&plugin);
        }
    }

    #[test_log::test]
    fn test_read_only_string_is_not_copied_back() {
        let mut plugin = copy_plugin();
        let mut function = plugin.function("Copy").unwrap();
        function.push_string_ex(b"abcdefgh", 9, false).push_cell(9);
        let result = plugin.invoke(&mut function).unwrap();
        assert_eq!(result.raw, 5);
        assert_eq!(result.args[0], Value::String("abcdefgh".into()));
    }

    #[test_log::test]
    fn test_array_copy_back() {
        let mut plugin = load(|b, c| {
            let addr = c.begin_function();
            // arr[1] += 100
            c.emit(Opcode::LoadSPri, &[12]);
            c.emit(Opcode::AddC, &[4]);
            c.emit(Opcode::MoveAlt, &[]);
            c.emit(Opcode::LoadI, &[]);
            c.emit(Opcode::AddC, &[100]);
            c.emit(Opcode::StorI, &[]);
            c.emit(Opcode::Retn, &[]);
            b.public("Bump", addr);
        });
        let mut function = plugin.function("Bump").unwrap();
        function.push_array(&[1, 2, 3], true);
        let result = plugin.invoke(&mut function).unwrap();
        assert_eq!(
            result.args[0],
            Value::Array(vec![Value::Int(1), Value::Int(102), Value::Int(3)])
        );
        assert_clean(&plugin);
    }
}

// ===== Stack Discipline =====

mod discipline {
    use super::*;

    #[test_log::test]
    fn test_nested_call_from_native() {
        let mut plugin = load(|b, c| {
            return_twenty_three(b, c);
            let nested = b.native("Nested") as Cell;
            let addr = c.begin_function();
            c.emit(Opcode::SysreqN, &[nested, 0]);
            c.emit(Opcode::Retn, &[]);
            b.public("Outer", addr);
        });
        plugin.register_native("Nested", |ctx, _| {
            Ok(ctx.invoke_public("ReturnTwentyThree", &[])? + 1)
        });

        let result = plugin.call("Outer", &[]).unwrap();
        assert_eq!(result.raw, 24);
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_failing_call_restores_state() {
        let mut plugin = load(|b, c| {
            return_twenty_three(b, c);
            let throw = b.native("ThrowError") as Cell;
            let fmt = b.add_string("bad value %d") as Cell;
            let value = b.add_cells(&[-1]) as Cell;
            let addr = c.begin_function();
            c.emit(Opcode::Stack, &[-8]);
            c.emit(Opcode::PushC, &[value]);
            c.emit(Opcode::PushC, &[fmt]);
            c.emit(Opcode::SysreqN, &[throw, 2]);
            c.emit(Opcode::Stack, &[8]);
            c.emit(Opcode::Retn, &[]);
            b.public("Fail", addr);
        });

        let mut function = plugin.function("Fail").unwrap();
        function.push_string("scratch").push_cell_ref(3);
        let err = plugin.invoke(&mut function).unwrap_err();
        match &err {
            Error::Vm(VmError::Native { native, error, .. }) => {
                assert_eq!(native, "ThrowError");
                assert_eq!(error.to_string(), "bad value -1");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.as_vm().is_some());
        assert_clean(&plugin);

        let result = plugin.call("ReturnTwentyThree", &[]).unwrap();
        assert_eq!(result.raw, 23);
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_set_fail_state() {
        let mut plugin = load(|b, c| {
            let fail = b.native("SetFailState") as Cell;
            let message = b.add_string("config missing") as Cell;
            let addr = c.begin_function();
            c.emit(Opcode::PushC, &[message]);
            c.emit(Opcode::SysreqN, &[fail, 1]);
            c.emit(Opcode::Retn, &[]);
            b.public("OnPluginStart", addr);
        });
        let err = plugin.run().unwrap_err();
        assert!(err.to_string().contains("plugin failed: config missing"));
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_unbound_native_is_named() {
        let mut plugin = load(|b, c| {
            let missing = b.native("NotThere") as Cell;
            let addr = c.begin_function();
            c.emit(Opcode::SysreqN, &[missing, 0]);
            c.emit(Opcode::Retn, &[]);
            b.public("CallsMissing", addr);
        });
        let err = plugin.call("CallsMissing", &[]).unwrap_err();
        assert!(err.to_string().contains("NotThere"));
        assert_clean(&plugin);

        plugin.register_native("NotThere", |_, _| Ok(5));
        assert_eq!(plugin.call("CallsMissing", &[]).unwrap().raw, 5);
    }
}

// ===== Standard Natives =====

mod natives {
    use super::*;

    #[test_log::test]
    fn test_format_into_buffer() {
        let mut plugin = load(|b, c| {
            let format = b.native("Format") as Cell;
            let fmt = b.add_string("%d-%s|%5.2f") as Cell;
            let number = b.add_cells(&[42]) as Cell;
            let text = b.add_string("abc") as Cell;
            let ratio = b.add_cells(&[1.5f32.to_bits() as Cell]) as Cell;

            let addr = c.begin_function();
            c.emit(Opcode::PushC, &[ratio]);
            c.emit(Opcode::PushC, &[text]);
            c.emit(Opcode::PushC, &[number]);
            c.emit(Opcode::PushC, &[fmt]);
            c.emit(Opcode::PushS, &[16]);
            c.emit(Opcode::PushS, &[12]);
            c.emit(Opcode::SysreqN, &[format, 6]);
            c.emit(Opcode::Retn, &[]);
            b.typed_public(
                "Render",
                addr,
                signature(
                    int(),
                    vec![
                        param(TypeInfo::fixed_array(TypeInfo::new(TypeKind::Char8), 32), false),
                        param(int(), false),
                    ],
                ),
            );
        });

        let result = plugin
            .call("Render", &[Value::from(""), Value::Int(32)])
            .unwrap();
        assert_eq!(result.args[0], Value::String("42-abc| 1.50".into()));
        assert_eq!(result.raw, 12);
    }

    #[test_log::test]
    fn test_format_missing_argument() {
        let mut plugin = load(|b, c| {
            let print = b.native("PrintToServer") as Cell;
            let fmt = b.add_string("%d and %d") as Cell;
            let one = b.add_cells(&[1]) as Cell;
            let addr = c.begin_function();
            c.emit(Opcode::PushC, &[one]);
            c.emit(Opcode::PushC, &[fmt]);
            c.emit(Opcode::SysreqN, &[print, 2]);
            c.emit(Opcode::Retn, &[]);
            b.public("Print", addr);
        });
        let err = plugin.call("Print", &[]).unwrap_err();
        assert!(err
            .to_string()
            .contains("String formatted incorrectly - parameter 2 (total 1)"));
        assert_eq!(plugin.console_output(), "");
    }

    #[test_log::test]
    fn test_format_width_limit() {
        let mut plugin = load(|b, c| {
            let print = b.native("PrintToServer") as Cell;
            let fmt = b.add_string("%200000000d") as Cell;
            let zero = b.add_cells(&[0]) as Cell;
            let addr = c.begin_function();
            c.emit(Opcode::PushC, &[zero]);
            c.emit(Opcode::PushC, &[fmt]);
            c.emit(Opcode::SysreqN, &[print, 2]);
            c.emit(Opcode::Retn, &[]);
            b.public("Wide", addr);
        });
        let err = plugin.call("Wide", &[]).unwrap_err();
        assert!(err.to_string().contains("format width exceeds 4096"), "{err}");
        assert_eq!(plugin.console_output(), "");
        assert_clean(&plugin);
    }

    #[test_log::test]
    fn test_string_natives() {
        let mut plugin = load(|b, c| {
            let strcmp = b.native("strcmp") as Cell;
            let parse = b.native("StringToInt") as Cell;
            let upper = b.add_string("ABC") as Cell;
            let lower = b.add_string("abc") as Cell;
            let hex = b.add_string("ff") as Cell;

            let insensitive = c.begin_function();
            c.emit(Opcode::PushC, &[0]);
            c.emit(Opcode::PushC, &[lower]);
            c.emit(Opcode::PushC, &[upper]);
            c.emit(Opcode::SysreqN, &[strcmp, 3]);
            c.emit(Opcode::Retn, &[]);
            b.public("CompareInsensitive", insensitive);

            let sensitive = c.begin_function();
            c.emit(Opcode::PushC, &[lower]);
            c.emit(Opcode::PushC, &[upper]);
            c.emit(Opcode::SysreqN, &[strcmp, 2]);
            c.emit(Opcode::Retn, &[]);
            b.public("CompareSensitive", sensitive);

            let hex_fn = c.begin_function();
            c.emit(Opcode::PushC, &[16]);
            c.emit(Opcode::PushC, &[hex]);
            c.emit(Opcode::SysreqN, &[parse, 2]);
            c.emit(Opcode::Retn, &[]);
            b.public("ParseHex", hex_fn);
        });

        assert_eq!(plugin.call("CompareInsensitive", &[]).unwrap().raw, 0);
        assert_eq!(plugin.call("CompareSensitive", &[]).unwrap().raw, -1);
        assert_eq!(plugin.call("ParseHex", &[]).unwrap().raw, 255);
    }

    #[test_log::test]
    fn test_array_list_handles() {
        let mut plugin = load(|b, c| {
            let create = b.native("CreateArray") as Cell;
            let push = b.native("PushArrayCell") as Cell;
            let get = b.native("GetArrayCell") as Cell;
            let close = b.native("CloseHandle") as Cell;

            let addr = c.begin_function();
            c.emit(Opcode::Stack, &[-8]);
            c.emit(Opcode::SysreqN, &[create, 0]);
            c.emit(Opcode::StorSPri, &[-4]);
            c.emit(Opcode::PushC, &[11]);
            c.emit(Opcode::PushS, &[-4]);
            c.emit(Opcode::SysreqN, &[push, 2]);
            c.emit(Opcode::PushC, &[0]);
            c.emit(Opcode::PushS, &[-4]);
            c.emit(Opcode::SysreqN, &[get, 2]);
            c.emit(Opcode::StorSPri, &[-8]);
            c.emit(Opcode::PushS, &[-4]);
            c.emit(Opcode::SysreqN, &[close, 1]);
            c.emit(Opcode::LoadSPri, &[-8]);
            c.emit(Opcode::Stack, &[8]);
            c.emit(Opcode::Retn, &[]);
            b.public("UseList", addr);
        });

        assert_eq!(plugin.call("UseList", &[]).unwrap().raw, 11);
        assert!(plugin.machine().handles().is_empty());
    }

    #[test_log::test]
    fn test_bare_options_register_nothing() {
        let mut plugin = load_with(RuntimeOptions::bare(), |b, c| {
            let print = b.native("PrintToServer") as Cell;
            let addr = c.begin_function();
            c.emit(Opcode::SysreqN, &[print, 0]);
            c.emit(Opcode::Retn, &[]);
            b.public("Print", addr);
        });
        assert!(plugin.machine().natives().is_empty());
        let err = plugin.call("Print", &[]).unwrap_err();
        assert!(err.to_string().contains("PrintToServer"));
    }
}

// ===== Summary =====

mod summary {
    use super::*;

    #[test_log::test]
    fn test_summary_json() {
        let plugin = load(|b, c| {
            b.info(&PluginInfo {
                name: "Sample".into(),
                author: "smx".into(),
                description: "summary test".into(),
                version: "1.0".into(),
                url: "".into(),
            });
            b.native("PrintToServer");
            b.native_signature(
                "Unknown",
                signature(int(), vec![param(int(), false)]),
            );
            return_twenty_three(b, c);
        });

        let summary = plugin.summary();
        assert_eq!(summary.publics.len(), 1);
        assert_eq!(summary.publics[0].name, "ReturnTwentyThree");
        assert!(summary.publics[0].signature.is_some());
        assert_eq!(plugin.info().map(|i| i.name.as_str()), Some("Sample"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["info"]["name"], "Sample");
        assert_eq!(json["natives"][0]["name"], "PrintToServer");
        assert_eq!(json["natives"][0]["bound"], true);
        assert_eq!(json["natives"][1]["bound"], false);
        assert_eq!(json["natives"][0]["signature"], serde_json::Value::Null);
        assert_eq!(
            summary.natives[1].signature,
            Some(signature(int(), vec![param(int(), false)]).to_string())
        );
    }
}
