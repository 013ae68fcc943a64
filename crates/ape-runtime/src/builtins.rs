//! Builtin functions
//!
//! The table order is part of the bytecode contract: `GET_BUILTIN n`
//! addresses the n-th entry, so entries are only ever appended.

use crate::heap::NativeContext;
use crate::value::{ObjectType, TypeMask, Value};

type BuiltinFn = fn(&mut NativeContext<'_>, &[Value]) -> Value;

/// One builtin table entry
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

pub(crate) static BUILTINS: &[Builtin] = &[
    Builtin { name: "len", func: builtin_len },
    Builtin { name: "println", func: builtin_println },
    Builtin { name: "print", func: builtin_print },
    Builtin { name: "first", func: builtin_first },
    Builtin { name: "last", func: builtin_last },
    Builtin { name: "append", func: builtin_append },
    Builtin { name: "rest", func: builtin_rest },
    Builtin { name: "remove", func: builtin_remove },
    Builtin { name: "remove_at", func: builtin_remove_at },
    Builtin { name: "keys", func: builtin_keys },
    Builtin { name: "values", func: builtin_values },
    Builtin { name: "range", func: builtin_range },
    Builtin { name: "concat", func: builtin_concat },
    Builtin { name: "reverse", func: builtin_reverse },
    Builtin { name: "copy", func: builtin_copy },
    Builtin { name: "to_str", func: builtin_to_str },
    Builtin { name: "to_num", func: builtin_to_num },
    Builtin { name: "assert", func: builtin_assert },
    Builtin { name: "crash", func: builtin_crash },
    Builtin { name: "error", func: builtin_error },
    Builtin { name: "is_null", func: |ctx, args| is_type(ctx, args, ObjectType::Null) },
    Builtin { name: "is_bool", func: |ctx, args| is_type(ctx, args, ObjectType::Bool) },
    Builtin { name: "is_number", func: |ctx, args| is_type(ctx, args, ObjectType::Number) },
    Builtin { name: "is_string", func: |ctx, args| is_type(ctx, args, ObjectType::String) },
    Builtin { name: "is_array", func: |ctx, args| is_type(ctx, args, ObjectType::Array) },
    Builtin { name: "is_map", func: |ctx, args| is_type(ctx, args, ObjectType::Map) },
    Builtin { name: "is_function", func: |ctx, args| is_type(ctx, args, ObjectType::Function) },
    Builtin {
        name: "is_native_function",
        func: |ctx, args| is_type(ctx, args, ObjectType::NativeFunction),
    },
    Builtin { name: "is_error", func: |ctx, args| is_type(ctx, args, ObjectType::Error) },
];

/// Index of a builtin by name
pub fn lookup(name: &str) -> Option<usize> {
    BUILTINS.iter().position(|b| b.name == name)
}

/// Builtin by table index
pub(crate) fn get(index: usize) -> Option<&'static Builtin> {
    BUILTINS.get(index)
}

/// Number of builtins
pub fn count() -> usize {
    BUILTINS.len()
}

fn builtin_len(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(
        true,
        args,
        &[TypeMask::STRING | TypeMask::ARRAY | TypeMask::MAP],
    ) {
        return Value::null();
    }
    let len = match args[0].object_type() {
        ObjectType::String => ctx.string(args[0]).map_or(0, str::len),
        ObjectType::Array => ctx.array_len(args[0]).unwrap_or(0),
        _ => ctx.heap.map_len(args[0]).unwrap_or(0),
    };
    Value::number(len as f64)
}

fn render_args(ctx: &mut NativeContext<'_>, args: &[Value]) -> String {
    args.iter()
        .map(|a| ctx.to_display_string(*a))
        .collect::<Vec<_>>()
        .join(" ")
}

fn builtin_println(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    let mut text = render_args(ctx, args);
    text.push('\n');
    ctx.write_stdout(text.as_bytes());
    Value::null()
}

fn builtin_print(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    let text = render_args(ctx, args);
    ctx.write_stdout(text.as_bytes());
    Value::null()
}

fn builtin_first(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ARRAY]) {
        return Value::null();
    }
    ctx.array_get(args[0], 0).unwrap_or_else(Value::null)
}

fn builtin_last(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ARRAY]) {
        return Value::null();
    }
    ctx.array_get(args[0], -1).unwrap_or_else(Value::null)
}

fn builtin_append(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ARRAY, TypeMask::ANY]) {
        return Value::null();
    }
    ctx.array_push(args[0], args[1]);
    Value::number(ctx.array_len(args[0]).unwrap_or(0) as f64)
}

fn builtin_rest(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ARRAY]) {
        return Value::null();
    }
    match ctx.heap.array_values(args[0]) {
        Some([]) | None => Value::null(),
        Some(values) => {
            let tail = values[1..].to_vec();
            ctx.make_array_with(tail)
        }
    }
}

fn builtin_remove(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ARRAY, TypeMask::ANY]) {
        return Value::null();
    }
    let mut found = None;
    if let Some(values) = ctx.heap.array_values(args[0]) {
        for (i, value) in values.iter().enumerate() {
            if ctx.heap.equals(*value, args[1]) {
                found = Some(i);
                break;
            }
        }
    }
    match found {
        Some(i) => {
            ctx.heap.array_remove(args[0], i);
            Value::bool(true)
        }
        None => Value::bool(false),
    }
}

fn builtin_remove_at(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ARRAY, TypeMask::NUMBER]) {
        return Value::null();
    }
    let index = args[1].as_number().unwrap_or(-1.0);
    if index < 0.0 || index.fract() != 0.0 {
        ctx.set_runtime_error(format!("invalid index {} passed to remove_at", index));
        return Value::null();
    }
    ctx.heap
        .array_remove(args[0], index as usize)
        .unwrap_or_else(Value::null)
}

fn builtin_keys(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::MAP]) {
        return Value::null();
    }
    let len = ctx.heap.map_len(args[0]).unwrap_or(0);
    let keys: Vec<Value> = (0..len)
        .filter_map(|i| ctx.heap.map_key_at(args[0], i))
        .collect();
    ctx.make_array_with(keys)
}

fn builtin_values(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::MAP]) {
        return Value::null();
    }
    let len = ctx.heap.map_len(args[0]).unwrap_or(0);
    let values: Vec<Value> = (0..len)
        .filter_map(|i| ctx.heap.map_value_at(args[0], i))
        .collect();
    ctx.make_array_with(values)
}

fn builtin_range(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    let (start, end, step) = match args.len() {
        1 => (0.0, args[0].as_number(), 1.0),
        2 => (args[0].as_number().unwrap_or(f64::NAN), args[1].as_number(), 1.0),
        3 => (
            args[0].as_number().unwrap_or(f64::NAN),
            args[1].as_number(),
            args[2].as_number().unwrap_or(f64::NAN),
        ),
        n => {
            ctx.set_runtime_error(format!("invalid number of arguments to range, got {}", n));
            return Value::null();
        }
    };
    let end = match end {
        Some(e) if start.is_finite() && step.is_finite() => e,
        _ => {
            ctx.set_runtime_error("invalid arguments to range, expected numbers");
            return Value::null();
        }
    };
    if step == 0.0 {
        ctx.set_runtime_error("range step cannot be 0");
        return Value::null();
    }
    let mut values = Vec::new();
    let mut n = start;
    while (step > 0.0 && n < end) || (step < 0.0 && n > end) {
        values.push(Value::number(n));
        n += step;
    }
    ctx.make_array_with(values)
}

fn builtin_concat(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(
        true,
        args,
        &[
            TypeMask::ARRAY | TypeMask::STRING,
            TypeMask::ARRAY | TypeMask::STRING,
        ],
    ) {
        return Value::null();
    }
    match (args[0].object_type(), args[1].object_type()) {
        (ObjectType::Array, ObjectType::Array) => {
            let mut values = ctx.heap.array_values(args[0]).unwrap_or(&[]).to_vec();
            values.extend_from_slice(ctx.heap.array_values(args[1]).unwrap_or(&[]));
            ctx.make_array_with(values)
        }
        (ObjectType::String, ObjectType::String) => {
            let joined = format!(
                "{}{}",
                ctx.string(args[0]).unwrap_or(""),
                ctx.string(args[1]).unwrap_or("")
            );
            ctx.make_string(joined)
        }
        (a, b) => {
            ctx.set_runtime_error(format!("cannot concat {} and {}", a.name(), b.name()));
            Value::null()
        }
    }
}

fn builtin_reverse(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ARRAY | TypeMask::STRING]) {
        return Value::null();
    }
    match args[0].object_type() {
        ObjectType::Array => {
            let mut values = ctx.heap.array_values(args[0]).unwrap_or(&[]).to_vec();
            values.reverse();
            ctx.make_array_with(values)
        }
        _ => {
            let reversed: String = ctx.string(args[0]).unwrap_or("").chars().rev().collect();
            ctx.make_string(reversed)
        }
    }
}

fn builtin_copy(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ANY]) {
        return Value::null();
    }
    match args[0].object_type() {
        ObjectType::Array => {
            let values = ctx.heap.array_values(args[0]).unwrap_or(&[]).to_vec();
            ctx.make_array_with(values)
        }
        ObjectType::Map => {
            let map = ctx.make_map();
            let len = ctx.heap.map_len(args[0]).unwrap_or(0);
            for i in 0..len {
                if let (Some(k), Some(v)) = (
                    ctx.heap.map_key_at(args[0], i),
                    ctx.heap.map_value_at(args[0], i),
                ) {
                    ctx.map_set(map, k, v);
                }
            }
            map
        }
        _ => args[0],
    }
}

fn builtin_to_str(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ANY]) {
        return Value::null();
    }
    let text = ctx.to_display_string(args[0]);
    ctx.make_string(text)
}

fn builtin_to_num(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(
        true,
        args,
        &[TypeMask::STRING | TypeMask::NUMBER | TypeMask::BOOL | TypeMask::NULL],
    ) {
        return Value::null();
    }
    match args[0].object_type() {
        ObjectType::Number => args[0],
        ObjectType::Bool => Value::number(if args[0].as_bool() == Some(true) { 1.0 } else { 0.0 }),
        ObjectType::Null => Value::number(0.0),
        _ => {
            let text = ctx.string(args[0]).unwrap_or("").to_string();
            match text.trim().parse::<f64>() {
                Ok(n) => Value::number(n),
                Err(_) => {
                    ctx.set_runtime_error(format!("cannot convert \"{}\" to number", text));
                    Value::null()
                }
            }
        }
    }
}

fn builtin_assert(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ANY]) {
        return Value::null();
    }
    if !ctx.is_truthy(args[0]) {
        ctx.set_runtime_error("assertion failed");
        return Value::null();
    }
    Value::bool(true)
}

fn builtin_crash(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    let message = args
        .first()
        .map(|a| ctx.to_display_string(*a))
        .unwrap_or_else(|| "crash".to_string());
    ctx.set_runtime_error(message);
    Value::null()
}

fn builtin_error(ctx: &mut NativeContext<'_>, args: &[Value]) -> Value {
    let message = args
        .first()
        .map(|a| ctx.to_display_string(*a))
        .unwrap_or_default();
    ctx.make_error(message)
}

fn is_type(ctx: &mut NativeContext<'_>, args: &[Value], ty: ObjectType) -> Value {
    if !ctx.check_args(true, args, &[TypeMask::ANY]) {
        return Value::null();
    }
    Value::bool(args[0].object_type() == ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{CountingAllocator, Heap};
    use std::rc::Rc;

    fn with_ctx<R>(f: impl FnOnce(&mut NativeContext<'_>) -> R) -> R {
        let mut heap = Heap::new(Rc::new(CountingAllocator::new()));
        let mut sink = std::io::sink();
        let mut ctx = NativeContext::new(&mut heap, &mut sink);
        f(&mut ctx)
    }

    #[test]
    fn test_table_indices_are_stable() {
        assert_eq!(lookup("len"), Some(0));
        assert_eq!(lookup("println"), Some(1));
        assert_eq!(lookup("append"), Some(5));
        assert_eq!(lookup("no_such_builtin"), None);
    }

    #[test]
    fn test_len() {
        with_ctx(|ctx| {
            let s = ctx.make_string("hello world");
            assert_eq!(builtin_len(ctx, &[s]).as_number(), Some(11.0));
            let arr = ctx.make_array_with(vec![Value::null(), Value::null()]);
            assert_eq!(builtin_len(ctx, &[arr]).as_number(), Some(2.0));
            builtin_len(ctx, &[Value::number(1.0)]);
            assert!(ctx.has_error());
        });
    }

    #[test]
    fn test_range() {
        with_ctx(|ctx| {
            let r = builtin_range(ctx, &[Value::number(0.0), Value::number(10.0)]);
            assert_eq!(ctx.array_len(r), Some(10));
            assert_eq!(ctx.array_get(r, 9).unwrap().as_number(), Some(9.0));

            let r = builtin_range(ctx, &[Value::number(3.0)]);
            assert_eq!(ctx.array_len(r), Some(3));

            builtin_range(ctx, &[Value::number(0.0), Value::number(1.0), Value::number(0.0)]);
            assert!(ctx.has_error());
        });
    }

    #[test]
    fn test_first_last_rest() {
        with_ctx(|ctx| {
            let arr = ctx.make_array_with(vec![
                Value::number(1.0),
                Value::number(2.0),
                Value::number(3.0),
            ]);
            assert_eq!(builtin_first(ctx, &[arr]).as_number(), Some(1.0));
            assert_eq!(builtin_last(ctx, &[arr]).as_number(), Some(3.0));
            let rest = builtin_rest(ctx, &[arr]);
            assert_eq!(ctx.array_len(rest), Some(2));
            assert_eq!(ctx.array_get(rest, 1).unwrap().as_number(), Some(3.0));

            let empty = ctx.make_array();
            assert!(builtin_first(ctx, &[empty]).is_null());
            assert!(builtin_rest(ctx, &[empty]).is_null());
        });
    }

    #[test]
    fn test_crash_flags_error() {
        with_ctx(|ctx| {
            builtin_crash(ctx, &[]);
            assert!(ctx.has_error());
        });
    }

    #[test]
    fn test_error_builds_user_error_value() {
        with_ctx(|ctx| {
            let err = builtin_error(ctx, &[]);
            assert_eq!(err.object_type(), ObjectType::Error);
            assert!(!ctx.has_error());
        });
    }
}
