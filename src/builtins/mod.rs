//! # Built-in Modules
//!
//! Pure arithmetic, string, comparison, and boolean modules registered under
//! the `math`, `str`, `cmp`, and `bool` namespaces (with short-name
//! aliases). The same table doubles as the constant-folding whitelist: a
//! module call folds at compile time exactly when its name appears here and
//! evaluation succeeds. Division and modulo by zero never fold, so the
//! runtime observes them.
//!
//! This is an explicit table keyed by module name; there is no generic
//! arithmetic dispatch.

use crate::registry::{
    Module, ModuleError, ModuleErrorKind, ModuleMetadata, ModuleRegistry, ModuleSchema,
    RegistryError,
};
use crate::types::SemType;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const BUILTIN_VERSION: &str = "1.0.0";

/// (namespace, short name, parameter types, result type)
type BuiltinSpec = (
    &'static str,
    &'static str,
    Vec<(&'static str, SemType)>,
    SemType,
);

fn builtin_table() -> Vec<BuiltinSpec> {
    use SemType::{Boolean, Float, Int, String as Str};
    vec![
        // Integer arithmetic
        ("math", "add", vec![("a", Int), ("b", Int)], Int),
        ("math", "sub", vec![("a", Int), ("b", Int)], Int),
        ("math", "mul", vec![("a", Int), ("b", Int)], Int),
        ("math", "div", vec![("a", Int), ("b", Int)], Int),
        ("math", "mod", vec![("a", Int), ("b", Int)], Int),
        // Float arithmetic
        ("math", "addf", vec![("a", Float), ("b", Float)], Float),
        ("math", "subf", vec![("a", Float), ("b", Float)], Float),
        ("math", "mulf", vec![("a", Float), ("b", Float)], Float),
        ("math", "divf", vec![("a", Float), ("b", Float)], Float),
        ("math", "modf", vec![("a", Float), ("b", Float)], Float),
        // Strings
        ("str", "concat", vec![("a", Str), ("b", Str)], Str),
        ("str", "length", vec![("value", Str)], Int),
        ("str", "upper", vec![("value", Str)], Str),
        ("str", "lower", vec![("value", Str)], Str),
        // Integer comparison
        ("cmp", "eq", vec![("a", Int), ("b", Int)], Boolean),
        ("cmp", "ne", vec![("a", Int), ("b", Int)], Boolean),
        ("cmp", "lt", vec![("a", Int), ("b", Int)], Boolean),
        ("cmp", "le", vec![("a", Int), ("b", Int)], Boolean),
        ("cmp", "gt", vec![("a", Int), ("b", Int)], Boolean),
        ("cmp", "ge", vec![("a", Int), ("b", Int)], Boolean),
        // Boolean
        ("bool", "not", vec![("value", Boolean)], Boolean),
    ]
}

/// Is this fully-qualified name a pure built-in the folder may evaluate?
pub fn is_foldable(full_name: &str) -> bool {
    builtin_table()
        .iter()
        .any(|(ns, short, _, _)| format!("{ns}.{short}") == full_name)
}

fn param<'a>(input: &'a Value, name: &str, module: &str) -> Result<&'a Value, ModuleError> {
    input.field(name).ok_or_else(|| {
        ModuleError::new(
            ModuleErrorKind::TypeError,
            format!("{module}: missing parameter '{name}'"),
        )
    })
}

fn int_param(input: &Value, name: &str, module: &str) -> Result<i64, ModuleError> {
    match param(input, name, module)? {
        Value::Int(i) => Ok(*i),
        other => Err(ModuleError::new(
            ModuleErrorKind::TypeError,
            format!("{module}: parameter '{name}' must be Int, got {}", other.sem_type()),
        )),
    }
}

fn float_param(input: &Value, name: &str, module: &str) -> Result<f64, ModuleError> {
    match param(input, name, module)? {
        Value::Float(x) => Ok(*x),
        other => Err(ModuleError::new(
            ModuleErrorKind::TypeError,
            format!("{module}: parameter '{name}' must be Float, got {}", other.sem_type()),
        )),
    }
}

fn str_param<'a>(input: &'a Value, name: &str, module: &str) -> Result<&'a str, ModuleError> {
    match param(input, name, module)? {
        Value::String(s) => Ok(s),
        other => Err(ModuleError::new(
            ModuleErrorKind::TypeError,
            format!("{module}: parameter '{name}' must be String, got {}", other.sem_type()),
        )),
    }
}

fn bool_param(input: &Value, name: &str, module: &str) -> Result<bool, ModuleError> {
    match param(input, name, module)? {
        Value::Boolean(b) => Ok(*b),
        other => Err(ModuleError::new(
            ModuleErrorKind::TypeError,
            format!("{module}: parameter '{name}' must be Boolean, got {}", other.sem_type()),
        )),
    }
}

/// Evaluate a built-in by fully-qualified name
///
/// Runtime entry point shared with constant folding. Unknown names are a
/// `NotFound` module error; arithmetic on a zero divisor is a
/// `RuntimeError`.
#[allow(clippy::too_many_lines)]
pub fn apply(full_name: &str, input: &Value) -> Result<Value, ModuleError> {
    let checked_div = |a: i64, b: i64, op: &str| -> Result<i64, ModuleError> {
        if b == 0 {
            Err(ModuleError::runtime(format!("{full_name}: {op} by zero")))
        } else if op == "division" {
            Ok(a / b)
        } else {
            Ok(a % b)
        }
    };

    match full_name {
        "math.add" => Ok(Value::Int(
            int_param(input, "a", full_name)?.wrapping_add(int_param(input, "b", full_name)?),
        )),
        "math.sub" => Ok(Value::Int(
            int_param(input, "a", full_name)?.wrapping_sub(int_param(input, "b", full_name)?),
        )),
        "math.mul" => Ok(Value::Int(
            int_param(input, "a", full_name)?.wrapping_mul(int_param(input, "b", full_name)?),
        )),
        "math.div" => {
            let (a, b) = (int_param(input, "a", full_name)?, int_param(input, "b", full_name)?);
            Ok(Value::Int(checked_div(a, b, "division")?))
        }
        "math.mod" => {
            let (a, b) = (int_param(input, "a", full_name)?, int_param(input, "b", full_name)?);
            Ok(Value::Int(checked_div(a, b, "modulo")?))
        }
        "math.addf" => Ok(Value::Float(
            float_param(input, "a", full_name)? + float_param(input, "b", full_name)?,
        )),
        "math.subf" => Ok(Value::Float(
            float_param(input, "a", full_name)? - float_param(input, "b", full_name)?,
        )),
        "math.mulf" => Ok(Value::Float(
            float_param(input, "a", full_name)? * float_param(input, "b", full_name)?,
        )),
        "math.divf" => {
            let (a, b) = (
                float_param(input, "a", full_name)?,
                float_param(input, "b", full_name)?,
            );
            if b == 0.0 {
                Err(ModuleError::runtime(format!("{full_name}: division by zero")))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        "math.modf" => {
            let (a, b) = (
                float_param(input, "a", full_name)?,
                float_param(input, "b", full_name)?,
            );
            if b == 0.0 {
                Err(ModuleError::runtime(format!("{full_name}: modulo by zero")))
            } else {
                Ok(Value::Float(a % b))
            }
        }
        "str.concat" => Ok(Value::String(format!(
            "{}{}",
            str_param(input, "a", full_name)?,
            str_param(input, "b", full_name)?
        ))),
        "str.length" => Ok(Value::Int(
            str_param(input, "value", full_name)?.chars().count() as i64,
        )),
        "str.upper" => Ok(Value::String(
            str_param(input, "value", full_name)?.to_uppercase(),
        )),
        "str.lower" => Ok(Value::String(
            str_param(input, "value", full_name)?.to_lowercase(),
        )),
        "cmp.eq" => Ok(Value::Boolean(
            int_param(input, "a", full_name)? == int_param(input, "b", full_name)?,
        )),
        "cmp.ne" => Ok(Value::Boolean(
            int_param(input, "a", full_name)? != int_param(input, "b", full_name)?,
        )),
        "cmp.lt" => Ok(Value::Boolean(
            int_param(input, "a", full_name)? < int_param(input, "b", full_name)?,
        )),
        "cmp.le" => Ok(Value::Boolean(
            int_param(input, "a", full_name)? <= int_param(input, "b", full_name)?,
        )),
        "cmp.gt" => Ok(Value::Boolean(
            int_param(input, "a", full_name)? > int_param(input, "b", full_name)?,
        )),
        "cmp.ge" => Ok(Value::Boolean(
            int_param(input, "a", full_name)? >= int_param(input, "b", full_name)?,
        )),
        "bool.not" => Ok(Value::Boolean(!bool_param(input, "value", full_name)?)),
        other => Err(ModuleError::new(
            ModuleErrorKind::NotFound,
            format!("no built-in named '{other}'"),
        )),
    }
}

/// Attempt to fold a whitelisted built-in at compile time
///
/// Returns `None` when the name is not whitelisted, the arguments do not
/// fit, or evaluation would fail at runtime (division by zero stays
/// observable).
pub fn try_fold(full_name: &str, args: &BTreeMap<String, Value>) -> Option<Value> {
    if !is_foldable(full_name) {
        return None;
    }
    let input = Value::Record(
        args.iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    );
    apply(full_name, &input).ok()
}

/// Register every built-in under its namespace, with short-name aliases
pub fn register_builtins(registry: &ModuleRegistry) -> Result<(), RegistryError> {
    for (ns, short, params, result) in builtin_table() {
        let full = format!("{ns}.{short}");
        let consumes: ModuleSchema = params
            .iter()
            .map(|(name, ty)| ((*name).to_string(), ty.clone()))
            .collect();
        let produces: ModuleSchema =
            [("out".to_string(), result.clone())].into_iter().collect();

        let invoke_name = full.clone();
        let module = Module::new(
            ModuleMetadata {
                name: full.clone(),
                description: format!("built-in {full}"),
                version: BUILTIN_VERSION.to_string(),
            },
            consumes,
            produces,
            Arc::new(move |input| {
                let name = invoke_name.clone();
                Box::pin(async move { apply(&name, &input) })
            }),
        );
        registry.register_namespaced(ns, short, module)?;
    }
    Ok(())
}
