//! Property tests for the expression parser and evaluator.

use bibrules::expr::{compile, compile_strict, eval, Bindings, Expr};
use bibrules::FunctionRegistry;
use proptest::prelude::*;
use serde_json::{json, Value};

proptest! {
    /// Arbitrary input never panics; at worst it becomes a free-form node.
    #[test]
    fn compile_total_on_arbitrary_input(source in ".*") {
        let _ = compile(&source);
    }

    #[test]
    fn string_literals_parse_back(s in "[a-zA-Z0-9 ,.;:_-]*") {
        prop_assert_eq!(compile(&format!("'{s}'")), Expr::Str(s.clone()));
        prop_assert_eq!(compile(&format!("\"{s}\"")), Expr::Str(s));
    }

    #[test]
    fn int_literals_parse_back(n in any::<i64>()) {
        prop_assert_eq!(compile(&n.to_string()), Expr::Int(n));
    }

    #[test]
    fn int_lists_evaluate_elementwise(items in proptest::collection::vec(-1000i64..1000, 0..8)) {
        let source = format!(
            "[{}]",
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        let expr = compile_strict(&source).unwrap();
        let out = eval(&expr, &Bindings::new(), &FunctionRegistry::with_builtins()).unwrap();
        let expected: Vec<Value> = items.into_iter().map(|n| json!(n)).collect();
        prop_assert_eq!(out, Value::Array(expected));
    }

    #[test]
    fn dict_preserves_key_order(keys in proptest::collection::vec("[a-z]{1,6}", 1..6)) {
        let source = format!(
            "{{{}}}",
            keys.iter()
                .map(|k| format!("'{k}': 1"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        match compile(&source) {
            Expr::Dict(entries) => {
                let parsed: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
                let written: Vec<&str> = keys.iter().map(String::as_str).collect();
                prop_assert_eq!(parsed, written);
            },
            other => prop_assert!(false, "expected dict, got {:?}", other),
        }
    }

    #[test]
    fn strict_rejects_trailing_tokens(ident in "[a-z]{1,8}") {
        let source = format!("'literal' {ident}");
        prop_assert!(compile_strict(&source).is_err());
    }

    /// Whatever `compile` cannot express stays verbatim, so nothing is ever
    /// silently reinterpreted.
    #[test]
    fn fallback_preserves_source(lhs in "[a-z]{1,6}", rhs in "[a-z]{1,6}") {
        let source = format!("{lhs} + {rhs}");
        prop_assert_eq!(compile(&source), Expr::HostEval(source));
    }
}

#[test]
fn subscript_chains_nest_left_to_right() {
    let expr = compile_strict("value['a'][0]['b']").unwrap();
    let bindings = Bindings::new().with_value(json!({"a": [{"b": "deep"}]}));
    let out = eval(&expr, &bindings, &FunctionRegistry::with_builtins()).unwrap();
    assert_eq!(out, json!("deep"));
}
