//! Pure evaluation of parsed expressions against a JSON scope.
//!
//! The scope is the instance variable bag rendered as a JSON object. Missing
//! paths evaluate to `null`. Logical operators short-circuit and coerce with
//! JavaScript-like truthiness; comparisons are strict about types.

use serde_json::{Map, Number, Value};

use super::{BinaryOp, Expr, ExpressionError, Function, PathSegment, UnaryOp, parse};

/// Evaluate a parsed expression against a scope.
pub fn evaluate(expr: &Expr, scope: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(resolve_path(segments, scope)),
        Expr::Unary { op, expr } => {
            let value = evaluate(expr, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => match &value {
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            Ok(Value::Number((-i).into()))
                        } else if let Some(f) = n.as_f64() {
                            Number::from_f64(-f)
                                .map(Value::Number)
                                .ok_or_else(|| ExpressionError::Eval("negation overflow".into()))
                        } else {
                            Err(ExpressionError::Eval("negation of non-finite number".into()))
                        }
                    }
                    other => Err(ExpressionError::TypeMismatch {
                        op: "-",
                        lhs: type_name(other),
                        rhs: "number",
                    }),
                },
            }
        }
        Expr::Binary { op, lhs, rhs } => evaluate_binary(*op, lhs, rhs, scope),
        Expr::Call { function, args } => evaluate_call(*function, args, scope),
    }
}

/// Evaluate and coerce to boolean with truthiness rules.
pub fn evaluate_bool(expr: &Expr, scope: &Value) -> Result<bool, ExpressionError> {
    Ok(truthy(&evaluate(expr, scope)?))
}

/// JavaScript-like truthiness: null/false/0/"" are false, everything else true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

fn resolve_path(segments: &[PathSegment], scope: &Value) -> Value {
    let mut current = scope;
    for segment in segments {
        let next = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key),
            (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

// ---------------------------------------------------------------------------
// Binary operators
// ---------------------------------------------------------------------------

fn evaluate_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &Value,
) -> Result<Value, ExpressionError> {
    // Short-circuit forms first.
    match op {
        BinaryOp::And => {
            let left = evaluate(lhs, scope)?;
            if !truthy(&left) {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(truthy(&evaluate(rhs, scope)?)));
        }
        BinaryOp::Or => {
            let left = evaluate(lhs, scope)?;
            if truthy(&left) {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(truthy(&evaluate(rhs, scope)?)));
        }
        _ => {}
    }

    let left = evaluate(lhs, scope)?;
    let right = evaluate(rhs, scope)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            compare(op, &left, &right).map(Value::Bool)
        }
        BinaryOp::Add => add(&left, &right),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, &left, &right)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    // Two nulls order as equal-but-incomparable: every strict ordering is
    // false, and <=/>= degrade to equality.
    if left.is_null() && right.is_null() {
        return Ok(matches!(op, BinaryOp::Le | BinaryOp::Ge));
    }
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| ExpressionError::Eval("comparison of non-finite number".into()))?
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (a, b) => {
            return Err(ExpressionError::TypeMismatch {
                op: op.symbol(),
                lhs: type_name(a),
                rhs: type_name(b),
            });
        }
    };
    Ok(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    })
}

fn add(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::Number(_), Value::Number(_)) => arithmetic(BinaryOp::Add, left, right),
        (a, b) => Err(ExpressionError::TypeMismatch {
            op: "+",
            lhs: type_name(a),
            rhs: type_name(b),
        }),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        return Err(ExpressionError::TypeMismatch {
            op: op.symbol(),
            lhs: type_name(left),
            rhs: type_name(right),
        });
    };

    // Integer arithmetic when both sides are integers, except division by
    // zero which is always an error.
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return match op {
            BinaryOp::Add => Ok(Value::Number((x + y).into())),
            BinaryOp::Sub => Ok(Value::Number((x - y).into())),
            BinaryOp::Mul => Ok(Value::Number((x * y).into())),
            BinaryOp::Div if y == 0 => Err(ExpressionError::Eval("division by zero".into())),
            BinaryOp::Div => Ok(Value::Number((x / y).into())),
            BinaryOp::Rem if y == 0 => Err(ExpressionError::Eval("division by zero".into())),
            BinaryOp::Rem => Ok(Value::Number((x % y).into())),
            _ => unreachable!(),
        };
    }

    let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div if y == 0.0 => return Err(ExpressionError::Eval("division by zero".into())),
        BinaryOp::Div => x / y,
        BinaryOp::Rem if y == 0.0 => return Err(ExpressionError::Eval("division by zero".into())),
        BinaryOp::Rem => x % y,
        _ => unreachable!(),
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Eval("arithmetic produced non-finite number".into()))
}

fn type_name(value: &Value) -> &'static str {
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
// Functions
// ---------------------------------------------------------------------------

fn evaluate_call(
    function: Function,
    args: &[Expr],
    scope: &Value,
) -> Result<Value, ExpressionError> {
    let values: Vec<Value> = args
        .iter()
        .map(|arg| evaluate(arg, scope))
        .collect::<Result<_, _>>()?;

    let arity = |expected: usize| -> Result<(), ExpressionError> {
        if values.len() == expected {
            Ok(())
        } else {
            Err(ExpressionError::InvalidArgument {
                function: function.name(),
                message: format!("expected {expected} argument(s), got {}", values.len()),
            })
        }
    };

    match function {
        Function::Len => {
            arity(1)?;
            let len = match &values[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                other => {
                    return Err(ExpressionError::InvalidArgument {
                        function: "len",
                        message: format!("cannot take length of {}", type_name(other)),
                    });
                }
            };
            Ok(Value::Number((len as i64).into()))
        }
        Function::Contains => {
            arity(2)?;
            match (&values[0], &values[1]) {
                (Value::String(haystack), Value::String(needle)) => {
                    Ok(Value::Bool(haystack.contains(needle.as_str())))
                }
                (Value::Array(items), needle) => Ok(Value::Bool(items.contains(needle))),
                (a, b) => Err(ExpressionError::InvalidArgument {
                    function: "contains",
                    message: format!("({}, {}) is not searchable", type_name(a), type_name(b)),
                }),
            }
        }
        Function::StartsWith | Function::EndsWith => {
            arity(2)?;
            let (Value::String(subject), Value::String(probe)) = (&values[0], &values[1]) else {
                return Err(ExpressionError::InvalidArgument {
                    function: function.name(),
                    message: "both arguments must be strings".to_string(),
                });
            };
            Ok(Value::Bool(match function {
                Function::StartsWith => subject.starts_with(probe.as_str()),
                _ => subject.ends_with(probe.as_str()),
            }))
        }
        Function::Lower | Function::Upper => {
            arity(1)?;
            let Value::String(s) = &values[0] else {
                return Err(ExpressionError::InvalidArgument {
                    function: function.name(),
                    message: format!("expected string, got {}", type_name(&values[0])),
                });
            };
            Ok(Value::String(match function {
                Function::Lower => s.to_lowercase(),
                _ => s.to_uppercase(),
            }))
        }
        Function::Int => {
            arity(1)?;
            let n = match &values[0] {
                Value::Number(n) => n.as_f64().unwrap_or(0.0) as i64,
                Value::String(s) => s.trim().parse::<i64>().map_err(|_| {
                    ExpressionError::InvalidArgument {
                        function: "int",
                        message: format!("'{s}' is not an integer"),
                    }
                })?,
                Value::Bool(b) => i64::from(*b),
                other => {
                    return Err(ExpressionError::InvalidArgument {
                        function: "int",
                        message: format!("cannot convert {}", type_name(other)),
                    });
                }
            };
            Ok(Value::Number(n.into()))
        }
        Function::Float => {
            arity(1)?;
            let f = match &values[0] {
                Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
                    ExpressionError::InvalidArgument {
                        function: "float",
                        message: format!("'{s}' is not a number"),
                    }
                })?,
                Value::Bool(b) => f64::from(u8::from(*b)),
                other => {
                    return Err(ExpressionError::InvalidArgument {
                        function: "float",
                        message: format!("cannot convert {}", type_name(other)),
                    });
                }
            };
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| ExpressionError::Eval("non-finite float".into()))
        }
        Function::Str => {
            arity(1)?;
            Ok(Value::String(value_to_string(&values[0])))
        }
        Function::Bool => {
            arity(1)?;
            Ok(Value::Bool(truthy(&values[0])))
        }
        Function::Coalesce => {
            if values.is_empty() {
                return Err(ExpressionError::InvalidArgument {
                    function: "coalesce",
                    message: "expected at least one argument".to_string(),
                });
            }
            Ok(values
                .into_iter()
                .find(|v| !v.is_null())
                .unwrap_or(Value::Null))
        }
    }
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

/// Resolve `${expr}` markers in a template string.
///
/// String results splice in raw; other values splice as compact JSON.
/// Closing braces inside quoted strings within the expression are honored.
pub fn interpolate(template: &str, scope: &Value) -> Result<String, ExpressionError> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let inner = &rest[start + 2..];
        let end = find_closing_brace(inner).ok_or_else(|| ExpressionError::Parse {
            source_text: template.to_string(),
            message: "unterminated ${ interpolation".to_string(),
        })?;
        let expr = parse(&inner[..end])?;
        let value = evaluate(&expr, scope)?;
        result.push_str(&value_to_string(&value));
        rest = &inner[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

/// Interpolate every string inside a JSON value, recursively.
///
/// A string that is exactly one `${expr}` marker substitutes the typed
/// result instead of its string rendering, so payload fields can carry
/// structured values.
pub fn interpolate_value(value: &Value, scope: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(inner) = trimmed
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
            {
                // Whole-string marker: keep the evaluated type, unless the
                // "inner" contains another closing brace (mixed template).
                if find_closing_brace(inner).is_none() {
                    let expr = parse(inner)?;
                    return evaluate(&expr, scope);
                }
            }
            Ok(Value::String(interpolate(s, scope)?))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, scope))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), interpolate_value(item, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Find the index of the `}` closing an interpolation, skipping braces
/// inside single- or double-quoted string literals.
fn find_closing_brace(input: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in input.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' && q == '"' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '}' => return Some(idx),
                _ => {}
            },
        }
    }
    None
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str, scope: &Value) -> Result<Value, ExpressionError> {
        evaluate(&parse(src)?, scope)
    }

    // -------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------

    #[test]
    fn path_access_nested() {
        let scope = json!({"a": {"b": [{"c": 7}]}});
        assert_eq!(eval("$.a.b[0].c", &scope).unwrap(), json!(7));
    }

    #[test]
    fn missing_path_is_null() {
        let scope = json!({"a": 1});
        assert_eq!(eval("$.nope.deeper", &scope).unwrap(), Value::Null);
        assert_eq!(eval("$.a.b", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn root_path_is_whole_scope() {
        let scope = json!({"x": 1});
        assert_eq!(eval("$", &scope).unwrap(), scope);
    }

    // -------------------------------------------------------------------
    // Operators
    // -------------------------------------------------------------------

    #[test]
    fn arithmetic_integer_and_float() {
        let scope = json!({});
        assert_eq!(eval("2 + 3 * 4", &scope).unwrap(), json!(14));
        assert_eq!(eval("10 / 4", &scope).unwrap(), json!(2));
        assert_eq!(eval("10.0 / 4", &scope).unwrap(), json!(2.5));
        assert_eq!(eval("7 % 3", &scope).unwrap(), json!(1));
        assert_eq!(eval("-(2 + 3)", &scope).unwrap(), json!(-5));
    }

    #[test]
    fn division_by_zero_errors() {
        assert!(matches!(
            eval("1 / 0", &json!({})),
            Err(ExpressionError::Eval(_))
        ));
    }

    #[test]
    fn string_concatenation() {
        let scope = json!({"region": "east"});
        assert_eq!(
            eval("$.region + '-done'", &scope).unwrap(),
            json!("east-done")
        );
    }

    #[test]
    fn comparison_and_equality() {
        let scope = json!({"x": 5, "name": "beta"});
        assert_eq!(eval("$.x > 10", &scope).unwrap(), json!(false));
        assert_eq!(eval("$.x <= 5", &scope).unwrap(), json!(true));
        assert_eq!(eval("$.name == 'beta'", &scope).unwrap(), json!(true));
        assert_eq!(eval("'abc' < 'abd'", &scope).unwrap(), json!(true));
    }

    #[test]
    fn comparison_type_mismatch_errors() {
        let scope = json!({"x": 5});
        assert!(matches!(
            eval("$.x > 'ten'", &scope),
            Err(ExpressionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn null_comparisons() {
        let scope = json!({});
        // Both sides null: equality holds, strict ordering does not.
        assert_eq!(eval("$.a == $.b", &scope).unwrap(), json!(true));
        assert_eq!(eval("$.a != null", &scope).unwrap(), json!(false));
        assert_eq!(eval("$.a < $.b", &scope).unwrap(), json!(false));
        assert_eq!(eval("$.a <= $.b", &scope).unwrap(), json!(true));
        // One-sided null in an ordering is a type mismatch.
        assert!(eval("$.a < 3", &scope).is_err());
    }

    #[test]
    fn logical_short_circuit() {
        // The right side would error (type mismatch), but the left side
        // decides first.
        let scope = json!({"ok": false});
        assert_eq!(eval("$.ok && (1 < 'x')", &scope).unwrap(), json!(false));
        let scope = json!({"ok": true});
        assert_eq!(eval("$.ok || (1 < 'x')", &scope).unwrap(), json!(true));
    }

    #[test]
    fn not_operator_uses_truthiness() {
        let scope = json!({"empty": "", "list": [1]});
        assert_eq!(eval("!$.empty", &scope).unwrap(), json!(true));
        assert_eq!(eval("!$.list", &scope).unwrap(), json!(false));
        assert_eq!(eval("!$.missing", &scope).unwrap(), json!(true));
    }

    // -------------------------------------------------------------------
    // Functions
    // -------------------------------------------------------------------

    #[test]
    fn function_len() {
        let scope = json!({"items": [1, 2, 3], "name": "abc"});
        assert_eq!(eval("len($.items)", &scope).unwrap(), json!(3));
        assert_eq!(eval("len($.name)", &scope).unwrap(), json!(3));
        assert_eq!(eval("len($.missing)", &scope).unwrap(), json!(0));
    }

    #[test]
    fn function_contains() {
        let scope = json!({"msg": "fatal error", "tags": ["a", "b"]});
        assert_eq!(eval("contains($.msg, 'error')", &scope).unwrap(), json!(true));
        assert_eq!(eval("contains($.tags, 'b')", &scope).unwrap(), json!(true));
        assert_eq!(eval("contains($.tags, 'z')", &scope).unwrap(), json!(false));
    }

    #[test]
    fn function_string_predicates() {
        let scope = json!({"path": "/api/v1"});
        assert_eq!(
            eval("startsWith($.path, '/api')", &scope).unwrap(),
            json!(true)
        );
        assert_eq!(eval("endsWith($.path, 'v1')", &scope).unwrap(), json!(true));
        assert_eq!(eval("upper($.path)", &scope).unwrap(), json!("/API/V1"));
        assert_eq!(eval("lower('ABC')", &scope).unwrap(), json!("abc"));
    }

    #[test]
    fn function_conversions() {
        let scope = json!({});
        assert_eq!(eval("int('42')", &scope).unwrap(), json!(42));
        assert_eq!(eval("int(3.9)", &scope).unwrap(), json!(3));
        assert_eq!(eval("float('2.5')", &scope).unwrap(), json!(2.5));
        assert_eq!(eval("str(12)", &scope).unwrap(), json!("12"));
        assert_eq!(eval("bool('')", &scope).unwrap(), json!(false));
        assert_eq!(eval("bool(1)", &scope).unwrap(), json!(true));
    }

    #[test]
    fn function_coalesce() {
        let scope = json!({"a": null, "b": 2});
        assert_eq!(eval("coalesce($.a, $.b, 3)", &scope).unwrap(), json!(2));
        assert_eq!(eval("coalesce($.a, $.z)", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn function_arity_errors() {
        assert!(matches!(
            eval("len()", &json!({})),
            Err(ExpressionError::InvalidArgument { .. })
        ));
        assert!(matches!(
            eval("contains('x')", &json!({})),
            Err(ExpressionError::InvalidArgument { .. })
        ));
    }

    // -------------------------------------------------------------------
    // Purity
    // -------------------------------------------------------------------

    #[test]
    fn evaluation_does_not_mutate_scope() {
        let scope = json!({"a": {"b": 1}, "list": [1, 2]});
        let before = scope.clone();
        let _ = eval("$.a.b + len($.list)", &scope).unwrap();
        let _ = eval("$.missing == null && contains($.list, 2)", &scope).unwrap();
        assert_eq!(scope, before);
    }

    // -------------------------------------------------------------------
    // Interpolation
    // -------------------------------------------------------------------

    #[test]
    fn interpolate_mixed_template() {
        let scope = json!({"name": "fleet", "count": 3});
        let out = interpolate("deploying ${$.name} to ${$.count + 1} hosts", &scope).unwrap();
        assert_eq!(out, "deploying fleet to 4 hosts");
    }

    #[test]
    fn interpolate_plain_text_passthrough() {
        let out = interpolate("no markers here", &json!({})).unwrap();
        assert_eq!(out, "no markers here");
    }

    #[test]
    fn interpolate_brace_inside_string_literal() {
        let scope = json!({"a": "x"});
        let out = interpolate("v=${coalesce($.a, '}')}", &scope).unwrap();
        assert_eq!(out, "v=x");
    }

    #[test]
    fn interpolate_unterminated_errors() {
        assert!(interpolate("broken ${$.a", &json!({})).is_err());
    }

    #[test]
    fn interpolate_value_keeps_types_for_whole_markers() {
        let scope = json!({"hosts": ["a", "b"], "n": 2});
        let payload = json!({
            "targets": "${$.hosts}",
            "label": "run-${$.n}",
            "nested": {"count": "${$.n * 2}"}
        });
        let out = interpolate_value(&payload, &scope).unwrap();
        assert_eq!(out["targets"], json!(["a", "b"]));
        assert_eq!(out["label"], json!("run-2"));
        assert_eq!(out["nested"]["count"], json!(4));
    }
}
