//! Embedding API tests: instance lifecycle, native functions, global
//! constants, compiled programs, tracebacks, timeouts and allocator
//! accounting (zero leaks, clean behavior under injected failures).

use ape_runtime::{
    Ape, ApeError, CountingAllocator, ErrorKind, FailingAllocator, ObjectType, TypeMask, Value,
};
use proptest::prelude::*;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;

/// Shared capture buffer usable as the instance's stdout hook
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    fn take(&self) -> String {
        let bytes = std::mem::take(&mut *self.0.borrow_mut());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

const PROGRAM: &str = r#"external_fn_test()
assert(test == 42)
assert(test_str == "lorem ipsum")

const squared = square_array(1, 2, 3)
assert(len(squared) == 3)
assert(squared[0] == 1)
assert(squared[1] == 4)
assert(squared[2] == 9)

const dict = make_test_dict(3)
assert(len(dict) == 3)
assert(dict["0"] == 0)
assert(dict["1"] == 1)
assert(dict["2"] == 2)

assert(test_check_args(1, [1], {}, "str", true, fn() { return 1 }, null) == 42)

const v1 = {x: 1, y: 2}
const v2 = {x: 10, y: 20}
const sum = vec2_add(v1, v2)
assert(sum.x == 11)
assert(sum.y == 22)
const diff = vec2_sub(v2, v1)
assert(diff.x == 9)
assert(diff.y == 18)

var val = 0
for (i in range(0, 124)) {
    val = i
}
"#;

fn register_test_natives(ape: &mut Ape, counter: &Rc<Cell<i32>>) -> Result<(), ApeError> {
    let hits = Rc::clone(counter);
    ape.set_native_function("external_fn_test", move |_ctx, _args| {
        hits.set(42);
        Value::null()
    })?;

    ape.set_native_function("square_array", |ctx, args| {
        let result = ctx.make_array();
        if ctx.has_error() {
            return Value::null();
        }
        for arg in args {
            match arg.as_number() {
                Some(n) => {
                    ctx.array_push(result, Value::number(n * n));
                }
                None => {
                    ctx.set_runtime_error("invalid type passed to square_array");
                    return Value::null();
                }
            }
        }
        result
    })?;

    ape.set_native_function("make_test_dict", |ctx, args| {
        if !ctx.check_args(true, args, &[TypeMask::NUMBER]) {
            return Value::null();
        }
        let count = args[0].as_number().unwrap_or(0.0) as usize;
        let result = ctx.make_map();
        if ctx.has_error() {
            return Value::null();
        }
        for i in 0..count {
            let key = ctx.make_string(i.to_string());
            ctx.map_set(result, key, Value::number(i as f64));
        }
        result
    })?;

    ape.set_native_function("test_check_args", |ctx, args| {
        if !ctx.check_args(
            true,
            args,
            &[
                TypeMask::NUMBER,
                TypeMask::ARRAY | TypeMask::MAP,
                TypeMask::MAP,
                TypeMask::STRING,
                TypeMask::NUMBER | TypeMask::BOOL,
                TypeMask::FUNCTION | TypeMask::NATIVE_FUNCTION,
                TypeMask::ANY,
            ],
        ) {
            return Value::null();
        }
        Value::number(42.0)
    })?;

    ape.set_native_function("vec2_add", |ctx, args| {
        if !ctx.check_args(true, args, &[TypeMask::MAP, TypeMask::MAP]) {
            return Value::null();
        }
        let ax = ctx.map_get_number(args[0], "x");
        let ay = ctx.map_get_number(args[0], "y");
        let bx = ctx.map_get_number(args[1], "x");
        let by = ctx.map_get_number(args[1], "y");
        let result = ctx.make_map();
        if ctx.has_error() {
            return Value::null();
        }
        ctx.map_set_number(result, "x", ax + bx);
        ctx.map_set_number(result, "y", ay + by);
        result
    })?;

    ape.set_native_function("vec2_sub", |ctx, args| {
        if !ctx.check_args(true, args, &[TypeMask::MAP, TypeMask::MAP]) {
            return Value::null();
        }
        let ax = ctx.map_get_number(args[0], "x");
        let ay = ctx.map_get_number(args[0], "y");
        let bx = ctx.map_get_number(args[1], "x");
        let by = ctx.map_get_number(args[1], "y");
        let result = ctx.make_map();
        if ctx.has_error() {
            return Value::null();
        }
        ctx.map_set_number(result, "x", ax - bx);
        ctx.map_set_number(result, "y", ay - by);
        result
    })?;

    Ok(())
}

fn setup_program_instance(
    ape: &mut Ape,
    counter: &Rc<Cell<i32>>,
) -> Result<(), ApeError> {
    register_test_natives(ape, counter)?;
    ape.set_global_constant("test", Value::number(42.0))?;
    let lorem_ipsum = ape.make_string(format!("{} {}", "lorem", "ipsum"))?;
    ape.set_global_constant("test_str", lorem_ipsum)?;
    Ok(())
}

#[test]
fn test_repl() {
    let lines = [
        "var x = 10",
        "x",
        "x + 5",
        "const add = fn(a, b) { return a + b }",
        "add(x, 32)",
        "const arr = [1, 2, 3]",
        "append(arr, 4)",
        "arr[3]",
        "const m = {name: \"ape\", tag: 1}",
        "m.name",
        "var i = 0",
        "while (i < 3) { i += 1 }",
        "i",
        "for (j in range(0, 3)) { x += j }",
        "x",
    ];

    let allocator = Rc::new(CountingAllocator::new());
    {
        let mut ape = Ape::with_allocator(allocator.clone()).expect("instance");
        ape.set_repl_mode(true);
        ape.set_stdout(SharedBuf::default());

        let mut last = Value::null();
        for line in lines {
            last = ape
                .execute(line)
                .unwrap_or_else(|err| panic!("line {:?} failed: {}", line, err));
            assert!(!ape.has_errors(), "line {:?}", line);
        }
        // x accumulated 0 + 1 + 2 on top of the initial 10
        assert_eq!(last.as_number(), Some(13.0));
    }
    assert_eq!(allocator.live_count(), 0);
}

#[test]
fn test_program() {
    let allocator = Rc::new(CountingAllocator::new());
    let counter = Rc::new(Cell::new(0));
    {
        let mut ape = Ape::with_allocator(allocator.clone()).expect("instance");
        ape.set_stdout(SharedBuf::default());
        setup_program_instance(&mut ape, &counter).expect("setup");

        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), PROGRAM).expect("write program");

        ape.execute_file(file.path())
            .unwrap_or_else(|err| panic!("program failed: {}", err));
        assert!(!ape.has_errors());

        let val = ape.get_object("val");
        assert_eq!(val.as_number(), Some(123.0));
    }
    assert_eq!(allocator.live_count(), 0);
    assert_eq!(counter.get(), 42);
}

#[test]
fn test_compiling() {
    let allocator = Rc::new(CountingAllocator::new());
    let counter = Rc::new(Cell::new(0));
    {
        let mut ape = Ape::with_allocator(allocator.clone()).expect("instance");
        ape.set_stdout(SharedBuf::default());
        setup_program_instance(&mut ape, &counter).expect("setup");

        let program = ape.compile(PROGRAM).expect("compile");
        assert!(!ape.has_errors());

        for _ in 0..1000 {
            ape.execute_program(&program)
                .unwrap_or_else(|err| panic!("program run failed: {}", err));
            assert!(!ape.has_errors());
            let val = ape.get_object("val");
            assert_eq!(val.as_number(), Some(123.0));
        }
    }
    assert_eq!(allocator.live_count(), 0);
    assert_eq!(counter.get(), 42);
}

#[test]
fn test_fails() {
    let fails = [
        "const x =",
        "fn (",
        "const x = 1; const x = 2",
        "const x = 1; x = 2",
        "unknownsym",
        "1()",
        "crash()",
        "var a = [1]; a[5] = 1",
        "var d = {}; d[[1]] = 1",
        "len(1)",
        "-true",
        "\"a\" - \"b\"",
        "break",
        "fn f() { recover (e) { e } }",
    ];

    for source in fails {
        let allocator = Rc::new(CountingAllocator::new());
        {
            let mut ape = Ape::with_allocator(allocator.clone()).expect("instance");
            let result = ape.execute(source);
            assert!(result.is_err(), "{:?} unexpectedly succeeded", source);
            assert!(ape.has_errors(), "{:?}", source);
        }
        assert_eq!(allocator.live_count(), 0, "leak after {:?}", source);
    }
}

#[test]
fn test_calling_functions() {
    let allocator = Rc::new(CountingAllocator::new());
    {
        let mut ape = Ape::with_allocator(allocator.clone()).expect("instance");
        let out = SharedBuf::default();
        ape.set_stdout(out.clone());

        ape.set_native_function("add", |ctx, args| {
            if !ctx.check_args(true, args, &[TypeMask::NUMBER, TypeMask::NUMBER]) {
                return Value::null();
            }
            let a = args[0].as_number().unwrap_or(0.0);
            let b = args[1].as_number().unwrap_or(0.0);
            Value::number(a + b)
        })
        .expect("register add");
        ape.set_native_function("fourtytwo", |ctx, args| {
            if !ctx.check_args(true, args, &[]) {
                return Value::null();
            }
            Value::number(42.0)
        })
        .expect("register fourtytwo");

        ape.execute("fn test_calling_external() { var res = fourtytwo(); println(res);}")
            .expect("define test_calling_external");
        let res = ape.call("test_calling_external", &[]).expect("call");
        assert_eq!(res.object_type(), ObjectType::Null);
        assert_eq!(out.take(), "42\n");

        let stack_corruption_code = "\
fn check_map(m) {
    return m.val == 0
}
fn test_stack_corruption() {
    var tests = [{val: 0}, {val: 1}]
    for (test in tests) {
        assert(is_map(test))
        if (check_map(test)) {
            while (check_map(test)) {
                test.val -= 1
            }
        }
    }
}";
        ape.execute(stack_corruption_code).expect("define");
        let res = ape.call("test_stack_corruption", &[]).expect("call");
        assert_eq!(res.object_type(), ObjectType::Null);

        ape.execute("fn test_calling(a, b) { var res = add(a, b); println(res); return res; }")
            .expect("define test_calling");
        let res = ape
            .call(
                "test_calling",
                &[Value::number(21.0), Value::number(37.0)],
            )
            .expect("call");
        assert_eq!(res.as_number(), Some(58.0));
        assert_eq!(out.take(), "58\n");

        // Builtins are callable by name from the host too
        let hello = ape.make_string("hello world").expect("make string");
        ape.call("println", &[hello]).expect("println");
        assert_eq!(out.take(), "hello world\n");

        let lorem = ape.make_string("lorem").expect("make string");
        let res = ape.call("len", &[lorem]).expect("len");
        assert_eq!(res.as_number(), Some(5.0));
    }
    assert_eq!(allocator.live_count(), 0);
}

const TRACEBACKS: &str = r#"const c = fn() {
    return 1()
}
const b = fn() {
    return c()
}
const a = fn() {
    return b()
}
fn traceback() {
    return a()
}
const c2 = fn() {
    return len(1)
}
const b2 = fn() {
    return c2()
}
const a2 = fn() {
    return b2()
}
fn traceback_native_function() {
    return a2()
}
const c3 = fn() {
    return custom_error()
}
const b3 = fn() {
    return c3()
}
const a3 = fn() {
    return b3()
}
fn traceback_native_function_error() {
    return a3()
}"#;

#[test]
fn test_traceback() {
    let allocator = Rc::new(CountingAllocator::new());
    {
        let mut ape = Ape::with_allocator(allocator.clone()).expect("instance");
        ape.set_native_function("custom_error", |ctx, _args| ctx.make_error("Error"))
            .expect("register custom_error");

        ape.execute(TRACEBACKS).expect("load tracebacks script");
        assert!(!ape.has_errors());

        // A VM-raised error: script frames only, innermost first.
        {
            assert!(ape.call("traceback", &[]).is_err());
            let err = ape.error(0).expect("error recorded");
            let tb = err.traceback.as_ref().expect("traceback");
            let expected = [("c", 1, 12), ("b", 4, 12), ("a", 7, 12), ("traceback", 10, 12)];
            assert_eq!(tb.depth(), expected.len());
            for (i, (name, line, column)) in expected.iter().enumerate() {
                assert_eq!(tb.function_name(i), *name, "frame {}", i);
                assert_eq!(tb.line(i), *line, "frame {}", i);
                assert_eq!(tb.column(i), *column, "frame {}", i);
            }
        }

        // An error raised inside a builtin: the native frame leads with an
        // unknown position.
        {
            assert!(ape.call("traceback_native_function", &[]).is_err());
            let err = ape.error(0).expect("error recorded");
            let tb = err.traceback.as_ref().expect("traceback");
            let expected = [
                ("len", -1, -1),
                ("c2", 13, 14),
                ("b2", 16, 13),
                ("a2", 19, 13),
                ("traceback_native_function", 22, 13),
            ];
            assert_eq!(tb.depth(), expected.len());
            for (i, (name, line, column)) in expected.iter().enumerate() {
                assert_eq!(tb.function_name(i), *name, "frame {}", i);
                assert_eq!(tb.line(i), *line, "frame {}", i);
                assert_eq!(tb.column(i), *column, "frame {}", i);
            }
        }

        // A native *returning* an error value does not raise; the VM stamps
        // the traceback onto the value and it propagates as data.
        {
            let res = ape
                .call("traceback_native_function_error", &[])
                .expect("call succeeds");
            assert!(!ape.has_errors());
            assert_eq!(res.object_type(), ObjectType::Error);
            assert_eq!(ape.error_message(res), Some("Error"));

            let tb = ape.error_traceback(res).expect("traceback on value");
            let expected = [
                ("custom_error", -1, -1),
                ("c3", 25, 23),
                ("b3", 28, 13),
                ("a3", 31, 13),
                ("traceback_native_function_error", 34, 13),
            ];
            assert_eq!(tb.depth(), expected.len());
            for (i, (name, line, column)) in expected.iter().enumerate() {
                assert_eq!(tb.function_name(i), *name, "frame {}", i);
                assert_eq!(tb.line(i), *line, "frame {}", i);
                assert_eq!(tb.column(i), *column, "frame {}", i);
            }
        }
    }
    assert_eq!(allocator.live_count(), 0);
}

#[test]
fn test_error_serialization() {
    let mut ape = Ape::new();
    let err = ape.execute(TRACEBACKS).and_then(|_| ape.call("traceback", &[])).unwrap_err();
    let rendered = err.serialize();
    assert!(rendered.contains("RUNTIME ERROR"));
    assert!(rendered.contains("Traceback:"));
    assert!(rendered.contains("1:12: c"));

    let json = err.serialize_json().expect("json");
    assert!(json.contains("\"kind\": \"runtime\""));
    assert!(json.contains("\"traceback\""));
}

#[test]
fn test_nan_boxing_round_trip() {
    let nan0 = f64::from_bits(0x7ff8_0000_0000_0000);
    let nan1 = f64::from_bits(0xfff8_0000_0000_0000);

    let nan0_value = Value::number(nan0);
    let nan1_value = Value::number(nan1);

    let nan0_retrieved = nan0_value.as_number().expect("number");
    let nan1_retrieved = nan1_value.as_number().expect("number");

    assert!(nan0_retrieved.is_nan());
    assert_eq!(nan0_retrieved.to_bits(), 0x7ff8_0000_0000_0000);
    assert!(nan1_retrieved.is_nan());
    assert_eq!(nan1_retrieved.to_bits(), 0x7ff8_0000_0000_0000);
}

proptest! {
    /// Every non-NaN double survives the boxing round trip bit-for-bit;
    /// every NaN canonicalizes to the positive quiet NaN.
    #[test]
    fn prop_double_round_trip(bits in any::<u64>()) {
        let n = f64::from_bits(bits);
        let back = Value::number(n).as_number().expect("still a number");
        if n.is_nan() {
            prop_assert_eq!(back.to_bits(), 0x7ff8_0000_0000_0000u64);
        } else {
            prop_assert_eq!(back.to_bits(), bits);
        }
    }

    /// Script arithmetic on integers matches the host's f64 arithmetic
    #[test]
    fn prop_arithmetic_matches_host(a in -10_000i64..10_000, b in -10_000i64..10_000) {
        let mut ape = Ape::new();
        ape.set_repl_mode(true);
        let source = format!("[{a} + {b}, {a} - {b}, {a} * {b}]");
        let result = ape.execute(&source).expect("execute");
        let expected = [(a + b) as f64, (a - b) as f64, (a * b) as f64];
        for (i, want) in expected.iter().enumerate() {
            let got = ape.array_get(result, i as i64).expect("element");
            prop_assert_eq!(got.as_number(), Some(*want));
        }
    }
}

#[test]
fn test_time_limit() {
    let scripts = ["while (true) {}", "fn(){ while (true) {}}()"];
    for script in scripts {
        let allocator = Rc::new(CountingAllocator::new());
        {
            let mut ape = Ape::with_allocator(allocator.clone()).expect("instance");
            assert!(ape.set_timeout(0.2));
            ape.set_stdout(SharedBuf::default());

            let started = std::time::Instant::now();
            let result = ape.execute(script);
            assert!(result.is_err(), "{:?}", script);
            assert!(ape.has_errors());
            assert_eq!(ape.error_count(), 1);
            assert_eq!(ape.error(0).expect("error").kind, ErrorKind::Timeout);
            // Within the limit plus generous scheduler slack
            assert!(started.elapsed() < std::time::Duration::from_secs(5));
        }
        assert_eq!(allocator.live_count(), 0);
    }
}

#[test]
fn test_allocation_fails() {
    let mut fail_at = 0;
    loop {
        let allocator = Rc::new(FailingAllocator::new(fail_at));
        fail_at += 1;

        let mut ape = match Ape::with_allocator(allocator.clone()) {
            Ok(ape) => ape,
            Err(err) => {
                // Creation itself failed cleanly.
                assert_eq!(err.kind, ErrorKind::Allocation);
                assert_eq!(allocator.live_count(), 0);
                continue;
            }
        };
        ape.set_stdout(SharedBuf::default());

        let counter = Rc::new(Cell::new(0));
        let setup = setup_program_instance(&mut ape, &counter);
        let result = match setup {
            Ok(()) => ape.execute(PROGRAM),
            Err(err) => Err(err),
        };

        if allocator.has_failed() {
            let err = result.expect_err("failed allocation must surface");
            assert_eq!(err.kind, ErrorKind::Allocation);

            // After the failure is observed the instance keeps working.
            allocator.disarm();
            ape.execute("println(\"hello world\")")
                .expect("instance usable after allocation failure");
            assert!(!ape.has_errors());

            drop(ape);
            assert_eq!(
                allocator.live_count(),
                0,
                "leak after failing allocation {}",
                fail_at - 1
            );
        } else {
            result.expect("run succeeds when nothing fails");
            drop(ape);
            assert_eq!(allocator.live_count(), 0);
            break;
        }
    }
}
