//! Compiled value expressions for rule bodies and guards.
//!
//! The rule language embeds small value expressions: literal dicts and
//! lists, subscripted access into the master value, and calls into an
//! enumerated function registry. These are compiled once into [`Expr`]
//! trees and interpreted by [`eval`] with explicit bindings — there is no
//! general-purpose evaluator anywhere in the engine.
//!
//! Anything the closed grammar cannot express is kept verbatim as
//! [`Expr::HostEval`], the single escape hatch. At evaluation time it is
//! handed to a host-registered hook; if the host registered none, the
//! expression fails with [`EvalError::NoHostEvaluator`] and the failure is
//! recorded as a continuable error by the interpreter.
//!
//! # Examples
//!
//! ```ignore
//! use bibrules::expr::{compile, eval, Bindings};
//! use bibrules::functions::FunctionRegistry;
//!
//! let expr = compile("{'title': value['a'], 'subtitle': value['b']}");
//! let bindings = Bindings::new().with_value(serde_json::json!({"a": "X", "b": "Y"}));
//! let out = eval(&expr, &bindings, &FunctionRegistry::with_builtins())?;
//! assert_eq!(out["title"], "X");
//! # Ok::<(), bibrules::error::EvalError>(())
//! ```

use crate::error::{EvalError, EvalResult};
use crate::functions::FunctionRegistry;
use indexmap::IndexMap;
use serde_json::{Number, Value};

/// A compiled value expression.
///
/// The grammar is deliberately closed: literals, dict/list construction,
/// subscripted access and function calls. Free-form text that does not fit
/// is preserved in [`Expr::HostEval`].
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `None` literal.
    Null,
    /// `True`/`False` literal.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// Quoted string literal.
    Str(String),
    /// `[expr, expr, ...]` list constructor.
    List(Vec<Expr>),
    /// `{'key': expr, ...}` dict constructor; keys are string literals.
    Dict(Vec<(String, Expr)>),
    /// A bare identifier resolved against the bindings (`value`, `self`).
    Var(String),
    /// `base['key']` / `base[0]` subscript chain.
    Subscript {
        /// The subscripted expression.
        base: Box<Expr>,
        /// Subscript keys, applied left to right.
        keys: Vec<Expr>,
    },
    /// `name(arg, ...)` call into the function registry. Dotted names are
    /// allowed and looked up verbatim.
    Call {
        /// Registered function name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// Free-form escape: raw text handed to the host evaluator hook.
    HostEval(String),
}

impl Expr {
    /// True when the expression is a bare string literal.
    ///
    /// Producer output rules use this to distinguish literal value paths
    /// (`'title.subtitle'`) from computed expressions.
    #[must_use]
    pub fn as_str_literal(&self) -> Option<&str> {
        match self {
            Expr::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Compile a source snippet into an [`Expr`].
///
/// Never fails: input that does not match the closed grammar (or has
/// trailing tokens after a valid prefix) is preserved whole as
/// [`Expr::HostEval`].
#[must_use]
pub fn compile(source: &str) -> Expr {
    let trimmed = source.trim();
    let mut parser = Parser::new(trimmed);
    match parser.parse_expr() {
        Ok(expr) if parser.at_end() => expr,
        _ => Expr::HostEval(trimmed.to_string()),
    }
}

/// Compile a snippet, rejecting anything outside the closed grammar.
///
/// Used where a free-form escape makes no sense, e.g. schema defaults.
pub fn compile_strict(source: &str) -> Result<Expr, String> {
    let trimmed = source.trim();
    let mut parser = Parser::new(trimmed);
    let expr = parser.parse_expr().map_err(|e| e.to_string())?;
    if parser.at_end() {
        Ok(expr)
    } else {
        Err(format!("trailing input after expression: '{trimmed}'"))
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Named values visible to an expression.
///
/// Creator rules see `value` (the matched element) and `self` (a snapshot of
/// the document so far); virtual rules and `only_if` guards see `self`;
/// `only_if_master_value` sees `value` only.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    map: IndexMap<String, Value>,
}

impl Bindings {
    /// Create an empty binding set.
    #[must_use]
    pub fn new() -> Self {
        Bindings {
            map: IndexMap::new(),
        }
    }

    /// Bind `value` to the given element.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.map.insert("value".to_string(), value);
        self
    }

    /// Bind `self` to the given document snapshot.
    #[must_use]
    pub fn with_document(mut self, snapshot: Value) -> Self {
        self.map.insert("self".to_string(), snapshot);
        self
    }

    /// Bind an arbitrary name.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.map.insert(name.into(), value);
    }

    /// Look up a bound name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a compiled expression against bindings and a function registry.
///
/// # Errors
///
/// Returns [`EvalError`] for unknown names or functions, failed subscripts,
/// function failures, or a [`Expr::HostEval`] node with no registered host
/// hook. The interpreter records these as continuable errors.
pub fn eval(expr: &Expr, bindings: &Bindings, functions: &FunctionRegistry) -> EvalResult<Value> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Number(Number::from(*i))),
        Expr::Float(f) => Ok(Number::from_f64(*f).map_or(Value::Null, Value::Number)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, bindings, functions)?);
            }
            Ok(Value::Array(out))
        },
        Expr::Dict(entries) => {
            let mut map = serde_json::Map::new();
            for (key, value_expr) in entries {
                map.insert(key.clone(), eval(value_expr, bindings, functions)?);
            }
            Ok(Value::Object(map))
        },
        Expr::Var(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownName(name.clone())),
        Expr::Subscript { base, keys } => {
            let mut current = eval(base, bindings, functions)?;
            for key_expr in keys {
                let key = eval(key_expr, bindings, functions)?;
                current = subscript(&current, &key)?;
            }
            Ok(current)
        },
        Expr::Call { name, args } => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, bindings, functions)?);
            }
            functions.call(name, &evaluated)
        },
        Expr::HostEval(raw) => functions.host_eval(raw, bindings),
    }
}

/// Evaluate a guard expression, reducing list results with logical AND.
///
/// A scalar result is truthy unless it is `null`, `false`, `0`, an empty
/// string, or an empty collection. A list result is the AND of its
/// elements' truthiness, matching how multi-part guards behave.
pub fn eval_guard(
    expr: &Expr,
    bindings: &Bindings,
    functions: &FunctionRegistry,
) -> EvalResult<bool> {
    let result = eval(expr, bindings, functions)?;
    Ok(match result {
        Value::Array(items) => items.iter().all(is_truthy),
        other => is_truthy(&other),
    })
}

/// Python-style truthiness for guard results.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn subscript(value: &Value, key: &Value) -> EvalResult<Value> {
    match (value, key) {
        (Value::Object(map), Value::String(k)) => map
            .get(k)
            .cloned()
            .ok_or_else(|| EvalError::KeyNotFound(k.clone())),
        (Value::Array(items), Value::Number(n)) => {
            let idx = n
                .as_u64()
                .ok_or_else(|| EvalError::BadSubscript {
                    kind: "array",
                    key: n.to_string(),
                })?
                .try_into()
                .unwrap_or(usize::MAX);
            items
                .get(idx)
                .cloned()
                .ok_or(EvalError::IndexOutOfBounds(idx))
        },
        // String subscript on an array maps over object elements; elements
        // missing the key are skipped. This is what aggregate selectors
        // rely on to pull one subfield out of every matched element.
        (Value::Array(items), Value::String(k)) => {
            let collected: Vec<Value> = items
                .iter()
                .filter_map(|item| item.as_object().and_then(|m| m.get(k)).cloned())
                .collect();
            Ok(Value::Array(collected))
        },
        (other, k) => Err(EvalError::BadSubscript {
            kind: kind_name(other),
            key: k.to_string(),
        }),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Punct(char),
}

#[derive(Debug)]
struct ParseErr {
    msg: String,
}

impl std::fmt::Display for ParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

fn err(msg: impl Into<String>) -> ParseErr {
    ParseErr { msg: msg.into() }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    broken: bool,
}

impl Parser {
    fn new(source: &str) -> Self {
        match tokenize(source) {
            Ok(tokens) => Parser {
                tokens,
                pos: 0,
                broken: false,
            },
            Err(_) => Parser {
                tokens: Vec::new(),
                pos: 0,
                broken: true,
            },
        }
    }

    fn at_end(&self) -> bool {
        !self.broken && self.pos == self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), ParseErr> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(err(format!("expected '{c}'")))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseErr> {
        if self.broken {
            return Err(err("unreadable input"));
        }
        match self.peek().cloned() {
            Some(Token::Str(s)) => {
                self.next();
                Ok(Expr::Str(s))
            },
            Some(Token::Int(i)) => {
                self.next();
                Ok(Expr::Int(i))
            },
            Some(Token::Float(f)) => {
                self.next();
                Ok(Expr::Float(f))
            },
            Some(Token::Punct('[')) => self.parse_list(),
            Some(Token::Punct('{')) => self.parse_dict(),
            Some(Token::Ident(_)) => self.parse_postfix(),
            _ => Err(err("expected expression")),
        }
    }

    fn parse_list(&mut self) -> Result<Expr, ParseErr> {
        self.expect_punct('[')?;
        let mut items = Vec::new();
        if self.eat_punct(']') {
            return Ok(Expr::List(items));
        }
        loop {
            items.push(self.parse_expr()?);
            if self.eat_punct(']') {
                return Ok(Expr::List(items));
            }
            self.expect_punct(',')?;
            // Tolerate a trailing comma before the closing bracket.
            if self.eat_punct(']') {
                return Ok(Expr::List(items));
            }
        }
    }

    fn parse_dict(&mut self) -> Result<Expr, ParseErr> {
        self.expect_punct('{')?;
        let mut entries = Vec::new();
        if self.eat_punct('}') {
            return Ok(Expr::Dict(entries));
        }
        loop {
            let key = match self.next() {
                Some(Token::Str(s)) => s,
                _ => return Err(err("dict keys must be string literals")),
            };
            self.expect_punct(':')?;
            let value = self.parse_expr()?;
            entries.push((key, value));
            if self.eat_punct('}') {
                return Ok(Expr::Dict(entries));
            }
            self.expect_punct(',')?;
            if self.eat_punct('}') {
                return Ok(Expr::Dict(entries));
            }
        }
    }

    /// Identifier followed by an optional dotted path, call arguments and
    /// any number of subscripts.
    fn parse_postfix(&mut self) -> Result<Expr, ParseErr> {
        let mut name = match self.next() {
            Some(Token::Ident(s)) => s,
            _ => return Err(err("expected identifier")),
        };
        // Dotted name: only meaningful in call position (`util.flatten(...)`).
        while self.peek() == Some(&Token::Punct('.')) {
            let checkpoint = self.pos;
            self.next();
            match self.next() {
                Some(Token::Ident(part)) => {
                    name.push('.');
                    name.push_str(&part);
                },
                _ => {
                    self.pos = checkpoint;
                    break;
                },
            }
        }

        let mut expr = if self.eat_punct('(') {
            let mut args = Vec::new();
            if !self.eat_punct(')') {
                loop {
                    args.push(self.parse_expr()?);
                    if self.eat_punct(')') {
                        break;
                    }
                    self.expect_punct(',')?;
                }
            }
            Expr::Call { name, args }
        } else if name.contains('.') {
            return Err(err("dotted name outside call position"));
        } else {
            match name.as_str() {
                "None" => Expr::Null,
                "True" => Expr::Bool(true),
                "False" => Expr::Bool(false),
                _ => Expr::Var(name),
            }
        };

        // Subscript chain.
        let mut keys = Vec::new();
        while self.eat_punct('[') {
            let key = self.parse_expr()?;
            self.expect_punct(']')?;
            keys.push(key);
        }
        if !keys.is_empty() {
            expr = Expr::Subscript {
                base: Box::new(expr),
                keys,
            };
        }
        Ok(expr)
    }
}

#[allow(clippy::too_many_lines)]
fn tokenize(source: &str) -> Result<Vec<Token>, ParseErr> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => {
                i += 1;
            },
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        },
                        Some('\\') => {
                            // Minimal escape handling for quotes and backslash.
                            match chars.get(i + 1) {
                                Some(&esc) if esc == quote || esc == '\\' => {
                                    s.push(esc);
                                    i += 2;
                                },
                                _ => {
                                    s.push('\\');
                                    i += 1;
                                },
                            }
                        },
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        },
                        None => return Err(err("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            },
            '0'..='9' | '-' => {
                let start = i;
                if c == '-' {
                    i += 1;
                    if !chars.get(i).is_some_and(char::is_ascii_digit) {
                        return Err(err("stray '-'"));
                    }
                }
                let mut is_float = false;
                while let Some(&ch) = chars.get(i) {
                    if ch.is_ascii_digit() {
                        i += 1;
                    } else if ch == '.' && !is_float && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                        is_float = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    tokens.push(Token::Float(
                        text.parse().map_err(|_| err("bad float literal"))?,
                    ));
                } else {
                    tokens.push(Token::Int(
                        text.parse().map_err(|_| err("bad int literal"))?,
                    ));
                }
            },
            '_' | 'a'..='z' | 'A'..='Z' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|&ch| ch.is_ascii_alphanumeric() || ch == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            },
            '[' | ']' | '{' | '}' | '(' | ')' | ',' | ':' | '.' => {
                tokens.push(Token::Punct(c));
                i += 1;
            },
            _ => return Err(err(format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn funcs() -> FunctionRegistry {
        FunctionRegistry::with_builtins()
    }

    #[test]
    fn test_compile_string_literal() {
        assert_eq!(compile("'hello'"), Expr::Str("hello".to_string()));
        assert_eq!(compile("\"hello\""), Expr::Str("hello".to_string()));
    }

    #[test]
    fn test_compile_subscript_chain() {
        let expr = compile("value['a'][0]");
        match expr {
            Expr::Subscript { base, keys } => {
                assert_eq!(*base, Expr::Var("value".to_string()));
                assert_eq!(keys.len(), 2);
            },
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_compile_dict() {
        let expr = compile("{'title': value['a'], 'form': value['k']}");
        match &expr {
            Expr::Dict(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, "title");
            },
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_freeform_fallback() {
        // Arithmetic is outside the closed grammar.
        let expr = compile("value['a'] + value['b']");
        assert_eq!(
            expr,
            Expr::HostEval("value['a'] + value['b']".to_string())
        );
    }

    #[test]
    fn test_eval_dict_with_value_binding() {
        let expr = compile("{'title': value['a']}");
        let bindings = Bindings::new().with_value(json!({"a": "X"}));
        let out = eval(&expr, &bindings, &funcs()).unwrap();
        assert_eq!(out, json!({"title": "X"}));
    }

    #[test]
    fn test_eval_missing_key_is_error() {
        let expr = compile("value['b']");
        let bindings = Bindings::new().with_value(json!({"a": "X"}));
        let result = eval(&expr, &bindings, &funcs());
        assert_eq!(result, Err(EvalError::KeyNotFound("b".to_string())));
    }

    #[test]
    fn test_eval_array_string_subscript_maps() {
        let expr = compile("value['a']");
        let bindings =
            Bindings::new().with_value(json!([{"a": "one"}, {"b": "skip"}, {"a": "two"}]));
        let out = eval(&expr, &bindings, &funcs()).unwrap();
        assert_eq!(out, json!(["one", "two"]));
    }

    #[test]
    fn test_eval_call() {
        let expr = compile("join(value['a'], ', ')");
        let bindings = Bindings::new().with_value(json!({"a": ["x", "y"]}));
        let out = eval(&expr, &bindings, &funcs()).unwrap();
        assert_eq!(out, json!("x, y"));
    }

    #[test]
    fn test_eval_unknown_function() {
        let expr = compile("frobnicate(value)");
        let bindings = Bindings::new().with_value(json!(1));
        assert!(matches!(
            eval(&expr, &bindings, &funcs()),
            Err(EvalError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_hosteval_without_hook_fails() {
        let expr = Expr::HostEval("whatever".to_string());
        assert_eq!(
            eval(&expr, &Bindings::new(), &funcs()),
            Err(EvalError::NoHostEvaluator)
        );
    }

    #[test]
    fn test_guard_list_is_and_reduced() {
        let expr = compile("[True, False]");
        assert!(!eval_guard(&expr, &Bindings::new(), &funcs()).unwrap());
        let expr = compile("[True, True]");
        assert!(eval_guard(&expr, &Bindings::new(), &funcs()).unwrap());
    }

    #[test]
    fn test_literals() {
        assert_eq!(compile("None"), Expr::Null);
        assert_eq!(compile("True"), Expr::Bool(true));
        assert_eq!(compile("-12"), Expr::Int(-12));
        assert_eq!(compile("3.5"), Expr::Float(3.5));
    }
}
