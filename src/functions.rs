//! Enumerated function registry for rule expressions.
//!
//! Every callable a configuration expression can reach lives in a
//! [`FunctionRegistry`]: a fixed set of built-ins plus whatever the host
//! registers explicitly. This is the only way configuration text can invoke
//! host computation — there is no open-ended evaluation.
//!
//! The registry also carries the optional host hook for free-form
//! expressions ([`Expr::HostEval`](crate::expr::Expr::HostEval)). A
//! namespace that registers no hook simply rejects free-form expressions at
//! run time with a continuable error.
//!
//! # Examples
//!
//! ```ignore
//! use bibrules::functions::FunctionRegistry;
//! use serde_json::{json, Value};
//!
//! let mut functions = FunctionRegistry::with_builtins();
//! functions.register("shout", |args| {
//!     Ok(Value::String(args[0].as_str().unwrap_or("").to_uppercase()))
//! });
//! ```

use crate::error::{EvalError, EvalResult};
use crate::expr::Bindings;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A host-registered function callable from rule expressions.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> EvalResult<Value> + Send + Sync>;

/// The host hook evaluating free-form escape expressions.
pub type HostEvalFn = Arc<dyn Fn(&str, &Bindings) -> EvalResult<Value> + Send + Sync>;

/// Registry of functions reachable from compiled expressions.
///
/// Shared read-only across all documents of a namespace once the registry
/// is built.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: IndexMap<String, NativeFn>,
    host_eval: Option<HostEvalFn>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("host_eval", &self.host_eval.is_some())
            .finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry (no built-ins, no host hook).
    #[must_use]
    pub fn new() -> Self {
        FunctionRegistry::default()
    }

    /// Create a registry pre-populated with the built-in helpers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) a function under `name`.
    ///
    /// Dotted names are allowed and matched verbatim against dotted call
    /// syntax in configuration expressions.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> EvalResult<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Register the host hook for free-form expressions.
    pub fn register_host_eval<F>(&mut self, hook: F)
    where
        F: Fn(&str, &Bindings) -> EvalResult<Value> + Send + Sync + 'static,
    {
        self.host_eval = Some(Arc::new(hook));
    }

    /// Look up and invoke a registered function.
    ///
    /// # Errors
    ///
    /// [`EvalError::UnknownFunction`] if the name is not registered, or
    /// whatever the function itself returns.
    pub fn call(&self, name: &str, args: &[Value]) -> EvalResult<Value> {
        match self.functions.get(name) {
            Some(function) => function(args),
            None => Err(EvalError::UnknownFunction(name.to_string())),
        }
    }

    /// True when `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Evaluate a free-form expression through the host hook.
    ///
    /// # Errors
    ///
    /// [`EvalError::NoHostEvaluator`] when the host registered no hook.
    pub fn host_eval(&self, raw: &str, bindings: &Bindings) -> EvalResult<Value> {
        match &self.host_eval {
            Some(hook) => hook(raw, bindings),
            None => Err(EvalError::NoHostEvaluator),
        }
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn func_err(function: &str, msg: impl Into<String>) -> EvalError {
    EvalError::Function {
        function: function.to_string(),
        msg: msg.into(),
    }
}

fn arg<'a>(function: &str, args: &'a [Value], index: usize) -> EvalResult<&'a Value> {
    args.get(index)
        .ok_or_else(|| func_err(function, format!("missing argument {index}")))
}

fn str_arg<'a>(function: &str, args: &'a [Value], index: usize) -> EvalResult<&'a str> {
    arg(function, args, index)?
        .as_str()
        .ok_or_else(|| func_err(function, format!("argument {index} must be a string")))
}

#[allow(clippy::too_many_lines)]
fn register_builtins(registry: &mut FunctionRegistry) {
    // get(obj, key[, default]) — tolerant lookup; missing key yields the
    // default (or null) instead of an error.
    registry.register("get", |args| {
        let container = arg("get", args, 0)?;
        let key = arg("get", args, 1)?;
        let default = args.get(2).cloned().unwrap_or(Value::Null);
        let found = match (container, key) {
            (Value::Object(map), Value::String(k)) => map.get(k).cloned(),
            (Value::Array(items), Value::Number(n)) => n
                .as_u64()
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| items.get(i).cloned()),
            _ => None,
        };
        Ok(found.unwrap_or(default))
    });

    registry.register("first", |args| {
        match arg("first", args, 0)? {
            Value::Array(items) => Ok(items.first().cloned().unwrap_or(Value::Null)),
            other => Ok(other.clone()),
        }
    });

    registry.register("last", |args| {
        match arg("last", args, 0)? {
            Value::Array(items) => Ok(items.last().cloned().unwrap_or(Value::Null)),
            other => Ok(other.clone()),
        }
    });

    registry.register("len", |args| {
        let n = match arg("len", args, 0)? {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            Value::String(s) => s.chars().count(),
            Value::Null => 0,
            _ => return Err(func_err("len", "value has no length")),
        };
        Ok(Value::from(n))
    });

    registry.register("join", |args| {
        let items = match arg("join", args, 0)? {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        let sep = args.get(1).and_then(Value::as_str).unwrap_or(" ");
        let parts: Vec<String> = items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        Ok(Value::String(parts.join(sep)))
    });

    registry.register("concat", |args| {
        let mut out = String::new();
        for value in args {
            match value {
                Value::String(s) => out.push_str(s),
                Value::Null => {},
                other => out.push_str(&other.to_string()),
            }
        }
        Ok(Value::String(out))
    });

    registry.register("split", |args| {
        let s = str_arg("split", args, 0)?;
        let sep = str_arg("split", args, 1)?;
        Ok(Value::Array(
            s.split(sep).map(|p| Value::String(p.to_string())).collect(),
        ))
    });

    registry.register("strip", |args| {
        Ok(Value::String(str_arg("strip", args, 0)?.trim().to_string()))
    });

    registry.register("lower", |args| {
        Ok(Value::String(str_arg("lower", args, 0)?.to_lowercase()))
    });

    registry.register("upper", |args| {
        Ok(Value::String(str_arg("upper", args, 0)?.to_uppercase()))
    });

    registry.register("replace", |args| {
        let s = str_arg("replace", args, 0)?;
        let from = str_arg("replace", args, 1)?;
        let to = str_arg("replace", args, 2)?;
        Ok(Value::String(s.replace(from, to)))
    });

    registry.register("int", |args| {
        let value = arg("int", args, 0)?;
        match value {
            Value::Number(n) => Ok(Value::from(n.as_i64().unwrap_or(0))),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| func_err("int", format!("cannot parse '{s}'"))),
            _ => Err(func_err("int", "value is not numeric")),
        }
    });

    registry.register("eq", |args| {
        Ok(Value::Bool(arg("eq", args, 0)? == arg("eq", args, 1)?))
    });

    registry.register("neq", |args| {
        Ok(Value::Bool(arg("neq", args, 0)? != arg("neq", args, 1)?))
    });

    registry.register("not", |args| {
        Ok(Value::Bool(!crate::expr::is_truthy(arg("not", args, 0)?)))
    });

    registry.register("contains", |args| {
        let container = arg("contains", args, 0)?;
        let needle = arg("contains", args, 1)?;
        let found = match container {
            Value::Array(items) => items.contains(needle),
            Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
            Value::String(s) => needle.as_str().is_some_and(|sub| s.contains(sub)),
            _ => false,
        };
        Ok(Value::Bool(found))
    });

    registry.register("is_empty", |args| {
        Ok(Value::Bool(!crate::expr::is_truthy(arg(
            "is_empty", args, 0,
        )?)))
    });

    registry.register("flatten", |args| {
        let mut out = Vec::new();
        fn push_flat(value: &Value, out: &mut Vec<Value>) {
            match value {
                Value::Array(items) => {
                    for item in items {
                        push_flat(item, out);
                    }
                },
                Value::Null => {},
                other => out.push(other.clone()),
            }
        }
        push_flat(arg("flatten", args, 0)?, &mut out);
        Ok(Value::Array(out))
    });

    registry.register("unique", |args| {
        let items = match arg("unique", args, 0)? {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        let mut out: Vec<Value> = Vec::new();
        for item in items {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        Ok(Value::Array(out))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_with_default() {
        let registry = FunctionRegistry::with_builtins();
        let obj = json!({"a": 1});
        assert_eq!(registry.call("get", &[obj.clone(), json!("a")]).unwrap(), json!(1));
        assert_eq!(
            registry.call("get", &[obj.clone(), json!("b")]).unwrap(),
            Value::Null
        );
        assert_eq!(
            registry
                .call("get", &[obj, json!("b"), json!("fallback")])
                .unwrap(),
            json!("fallback")
        );
    }

    #[test]
    fn test_join_skips_nulls() {
        let registry = FunctionRegistry::with_builtins();
        let out = registry
            .call("join", &[json!(["a", null, "b"]), json!("-")])
            .unwrap();
        assert_eq!(out, json!("a-b"));
    }

    #[test]
    fn test_flatten() {
        let registry = FunctionRegistry::with_builtins();
        let out = registry
            .call("flatten", &[json!([["a"], ["b", ["c"]], null])])
            .unwrap();
        assert_eq!(out, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_unknown_function() {
        let registry = FunctionRegistry::with_builtins();
        assert!(matches!(
            registry.call("nope", &[]),
            Err(EvalError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = FunctionRegistry::with_builtins();
        registry.register("util.double", |args| {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(Value::from(n * 2))
        });
        assert_eq!(registry.call("util.double", &[json!(21)]).unwrap(), json!(42));
    }
}
