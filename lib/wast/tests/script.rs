//! End-to-end tests of the test-command parser.

use breakwater_types::Features;
use breakwater_wast::{
    parse_test_commands, Action, Command, ExpectedTrapType, InvalidOrMalformed, QuotedModuleType,
};
use breakwater_vm::Value;

fn parse_ok(source: &str) -> Vec<Command> {
    let (commands, errors) = parse_test_commands(source, &Features::default());
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    commands
}

#[test]
fn module_then_assert_return() {
    let commands = parse_ok(
        r#"(module (func (export "f") (result i32) i32.const 42))
           (assert_return (invoke "f") (i32.const 42))"#,
    );
    assert_eq!(commands.len(), 2);

    match &commands[0] {
        Command::Action {
            action: Action::Module(module_action),
            ..
        } => {
            assert_eq!(module_action.internal_module_name, "");
            assert_eq!(module_action.module.functions.len(), 1);
        }
        other => panic!("expected a module action, got {other:?}"),
    }

    match &commands[1] {
        Command::AssertReturn {
            action: Action::Invoke(invoke),
            expected_values,
            ..
        } => {
            assert_eq!(invoke.export_name, "f");
            assert!(invoke.arguments.is_empty());
            assert_eq!(expected_values, &[Value::I32(42)]);
        }
        other => panic!("expected assert_return, got {other:?}"),
    }
}

#[test]
fn binary_module_with_no_sections() {
    let commands = parse_ok(r#"(module binary "\00asm\01\00\00\00")"#);
    assert_eq!(commands.len(), 1);
    match &commands[0] {
        Command::Action {
            action: Action::Module(module_action),
            ..
        } => {
            assert!(module_action.module.is_empty());
        }
        other => panic!("expected a module action, got {other:?}"),
    }
}

#[test]
fn quoted_binary_kind_is_recorded_by_assertions() {
    let (commands, errors) = parse_test_commands(
        r#"(assert_malformed (module binary "\00asm") "unexpected end")"#,
        &Features::default(),
    );
    assert!(errors.is_empty(), "{errors:?}");
    match &commands[0] {
        Command::AssertInvalidOrMalformed {
            expected,
            actual,
            quoted_module_type,
            quoted_module_bytes,
            ..
        } => {
            assert_eq!(*expected, InvalidOrMalformed::Malformed);
            assert_eq!(*actual, InvalidOrMalformed::Malformed);
            assert_eq!(*quoted_module_type, QuotedModuleType::Binary);
            assert_eq!(quoted_module_bytes, b"\0asm");
        }
        other => panic!("expected assert_malformed, got {other:?}"),
    }
}

#[test]
fn invalid_vs_malformed_classification() {
    // Two memories: parses, but fails validation -> invalid.
    let commands = parse_ok(
        r#"(assert_malformed (module quote "(memory 0) (memory 0)") "multiple memories")"#,
    );
    match &commands[0] {
        Command::AssertInvalidOrMalformed { actual, .. } => {
            assert_eq!(*actual, InvalidOrMalformed::Invalid);
        }
        other => panic!("unexpected {other:?}"),
    }

    // A syntax error -> malformed.
    let commands =
        parse_ok(r#"(assert_malformed (module quote "(nonsense)") "unknown field")"#);
    match &commands[0] {
        Command::AssertInvalidOrMalformed { actual, .. } => {
            assert_eq!(*actual, InvalidOrMalformed::Malformed);
        }
        other => panic!("unexpected {other:?}"),
    }

    // A well-formed, valid module classifies as such, and still parses
    // into a command.
    let commands = parse_ok(r#"(assert_invalid (module quote "(memory 1)") "whatever")"#);
    match &commands[0] {
        Command::AssertInvalidOrMalformed { actual, expected, .. } => {
            assert_eq!(*actual, InvalidOrMalformed::WellFormedAndValid);
            assert_eq!(*expected, InvalidOrMalformed::Invalid);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn scoped_errors_do_not_leak() {
    // The malformed module's parse errors must not surface as script
    // errors, and parsing continues afterwards.
    let commands = parse_ok(
        r#"(assert_malformed (module quote "(what)") "msg")
           (module (memory 1))"#,
    );
    assert_eq!(commands.len(), 2);
}

#[test]
fn trap_string_mapping() {
    let cases: &[(&str, ExpectedTrapType)] = &[
        ("out of bounds memory access", ExpectedTrapType::OutOfBoundsMemoryAccess),
        (
            "out of bounds data segment access at 4",
            ExpectedTrapType::OutOfBoundsDataSegmentAccess,
        ),
        (
            "out of bounds elem segment access at 0",
            ExpectedTrapType::OutOfBoundsElemSegmentAccess,
        ),
        ("out of bounds table access", ExpectedTrapType::OutOfBounds),
        ("call stack exhausted", ExpectedTrapType::StackOverflow),
        (
            "integer overflow",
            ExpectedTrapType::IntegerDivideByZeroOrIntegerOverflow,
        ),
        (
            "integer divide by zero",
            ExpectedTrapType::IntegerDivideByZeroOrIntegerOverflow,
        ),
        (
            "invalid conversion to integer",
            ExpectedTrapType::InvalidFloatOperation,
        ),
        ("unaligned atomic", ExpectedTrapType::MisalignedAtomicMemoryAccess),
        ("unreachable executed", ExpectedTrapType::ReachedUnreachable),
        (
            "indirect call type mismatch",
            ExpectedTrapType::IndirectCallSignatureMismatch,
        ),
        ("undefined element", ExpectedTrapType::OutOfBoundsTableAccess),
        ("uninitialized element 7", ExpectedTrapType::UninitializedTableElement),
        ("invalid argument", ExpectedTrapType::InvalidArgument),
        ("element segment dropped", ExpectedTrapType::InvalidArgument),
        ("data segment dropped", ExpectedTrapType::InvalidArgument),
    ];
    for (message, expected) in cases {
        let source = format!(r#"(assert_trap (invoke "f") "{message}")"#);
        let commands = parse_ok(&source);
        match &commands[0] {
            Command::AssertTrap {
                expected_trap_type, ..
            } => {
                assert_eq!(expected_trap_type, expected, "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn unrecognized_trap_strings_are_errors() {
    let (commands, errors) =
        parse_test_commands(r#"(assert_trap (invoke "f") "nonsense")"#, &Features::default());
    assert!(commands.is_empty());
    assert!(errors.iter().any(|e| e.message == "unrecognized trap type"));
}

#[test]
fn assert_exhaustion_shares_the_trap_command() {
    let commands = parse_ok(r#"(assert_exhaustion (invoke "loop") "call stack exhausted")"#);
    assert!(matches!(
        &commands[0],
        Command::AssertTrap {
            expected_trap_type: ExpectedTrapType::StackOverflow,
            ..
        }
    ));
}

#[test]
fn host_refs_are_interned_across_commands() {
    let commands = parse_ok(
        r#"(invoke "f" (ref.host 7))
           (invoke "g" (ref.host 7) (ref.host 8))"#,
    );
    let first = match &commands[0] {
        Command::Action {
            action: Action::Invoke(invoke),
            ..
        } => invoke.arguments[0].clone(),
        other => panic!("unexpected {other:?}"),
    };
    let (second, third) = match &commands[1] {
        Command::Action {
            action: Action::Invoke(invoke),
            ..
        } => (invoke.arguments[0].clone(), invoke.arguments[1].clone()),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(first, second, "equal indices intern to the same function");
    assert_ne!(first, third);
}

#[test]
fn inline_module_form() {
    let commands = parse_ok(r#"(memory (export "m") 1) (func (export "f") (result i32) i32.const 1)"#);
    assert_eq!(commands.len(), 1);
    match &commands[0] {
        Command::Action {
            action: Action::Module(module_action),
            ..
        } => {
            assert_eq!(module_action.module.memories.len(), 1);
            assert_eq!(module_action.module.functions.len(), 1);
            assert_eq!(module_action.module.exports.len(), 2);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn register_and_named_modules() {
    let commands = parse_ok(
        r#"(module $m (func (export "f") (result i32) i32.const 3))
           (register "mod" $m)
           (assert_return (invoke $m "f") (i32.const 3))"#,
    );
    assert_eq!(commands.len(), 3);
    match &commands[0] {
        Command::Action {
            action: Action::Module(module_action),
            ..
        } => assert_eq!(module_action.internal_module_name, "m"),
        other => panic!("unexpected {other:?}"),
    }
    match &commands[1] {
        Command::Register {
            module_name,
            internal_name,
            ..
        } => {
            assert_eq!(module_name, "mod");
            assert_eq!(internal_name, "m");
        }
        other => panic!("unexpected {other:?}"),
    }
    match &commands[2] {
        Command::AssertReturn {
            action: Action::Invoke(invoke),
            ..
        } => assert_eq!(invoke.internal_module_name, "m"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn benchmark_requires_an_invoke() {
    let commands = parse_ok(r#"(benchmark "fib" (invoke "fib" (i32.const 25)))"#);
    match &commands[0] {
        Command::Benchmark { name, invoke, .. } => {
            assert_eq!(name, "fib");
            assert_eq!(invoke.export_name, "fib");
        }
        other => panic!("unexpected {other:?}"),
    }

    let (commands, errors) = parse_test_commands(
        r#"(benchmark "fib" (get "g"))"#,
        &Features::default(),
    );
    assert!(commands.is_empty());
    assert!(errors.iter().any(|e| e.message == "expected invoke"));
}

#[test]
fn assert_unlinkable_discards_the_message() {
    let commands = parse_ok(
        r#"(assert_unlinkable
             (module (import "m" "missing" (func)))
             "unknown import")"#,
    );
    match &commands[0] {
        Command::AssertUnlinkable { module_action, .. } => {
            assert_eq!(module_action.module.imports.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn assert_throws_carries_the_exception_reference() {
    let commands = parse_ok(
        r#"(assert_throws (invoke "throws") $exmod "ex" (i32.const 1))"#,
    );
    match &commands[0] {
        Command::AssertThrows {
            exception_type_internal_module_name,
            exception_type_export_name,
            expected_arguments,
            ..
        } => {
            assert_eq!(exception_type_internal_module_name, "exmod");
            assert_eq!(exception_type_export_name, "ex");
            assert_eq!(expected_arguments.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn nan_assertions_record_their_kind() {
    use breakwater_wast::NanAssertKind;
    let commands = parse_ok(
        r#"(assert_return_canonical_nan (invoke "f"))
           (assert_return_arithmetic_nan_f32x4 (invoke "g"))"#,
    );
    assert!(matches!(
        &commands[0],
        Command::AssertReturnNan {
            kind: NanAssertKind::Canonical,
            ..
        }
    ));
    assert!(matches!(
        &commands[1],
        Command::AssertReturnNan {
            kind: NanAssertKind::ArithmeticF32x4,
            ..
        }
    ));
}

#[test]
fn recovery_resumes_at_the_next_command() {
    let (commands, errors) = parse_test_commands(
        r#"(frobnicate "x")
           (register "ok")"#,
        &Features::default(),
    );
    assert!(errors.iter().any(|e| e.message == "unknown script command"));
    assert_eq!(commands.len(), 1);
    assert!(matches!(&commands[0], Command::Register { .. }));
}

#[test]
fn loci_point_at_the_command() {
    let (commands, _) = parse_test_commands(
        "\n\n  (register \"m\")",
        &Features::default(),
    );
    let locus = commands[0].locus();
    assert_eq!(locus.line, 3);
    assert_eq!(locus.column, 4);
}

#[test]
fn commands_drive_a_minimal_interpreter_shape() -> anyhow::Result<()> {
    // A driver walks the command list; make sure the data it needs is
    // reachable without re-parsing anything.
    let (commands, errors) = parse_test_commands(
        r#"(module $m (func (export "f") (result i32) i32.const 9))
           (assert_return (invoke $m "f") (i32.const 9))"#,
        &Features::default(),
    );
    anyhow::ensure!(errors.is_empty(), "parse errors: {errors:?}");

    let mut defined_modules = Vec::new();
    for command in &commands {
        match command {
            Command::Action {
                action: Action::Module(module_action),
                ..
            } => defined_modules.push(module_action.internal_module_name.clone()),
            Command::AssertReturn {
                action: Action::Invoke(invoke),
                ..
            } => {
                anyhow::ensure!(defined_modules.contains(&invoke.internal_module_name));
            }
            other => anyhow::bail!("unexpected command {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn wellformed_scripts_produce_no_errors() {
    let source = r#"
        ;; a comment
        (module $lib
          (memory (export "mem") 1)
          (table (export "tab") 2 8 funcref)
          (global (export "g") (mut i32) (i32.const 0))
          (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))
        (register "lib" $lib)
        (assert_return (invoke "add" (i32.const 1) (i32.const 2)) (i32.const 3))
        (assert_trap (invoke "add" (i32.const 1) (i32.const 0)) "unreachable")
        (assert_return (invoke "f" (f64.const -0x1.8p2) (f32.const nan:0x7))
                       (v128.const i32x4 1 2 3 4))
    "#;
    let (commands, errors) = parse_test_commands(source, &Features::default());
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(commands.len(), 5);
}
