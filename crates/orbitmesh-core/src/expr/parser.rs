//! Recursive-descent expression parser built on nom combinators.
//!
//! Precedence, loosest first: `||`, `&&`, equality, comparison, additive,
//! multiplicative, unary, primary. Function names are checked against the
//! whitelist during parsing so unknown calls fail at admission time rather
//! than mid-run.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, none_of},
    combinator::{map, map_res, opt, recognize, value},
    error::ParseError,
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
};
use serde_json::{Number, Value};

use super::{BinaryOp, Expr, ExpressionError, Function, PathSegment, UnaryOp};

/// Parse a complete expression; trailing garbage is an error.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    match ws(parse_or)(input) {
        Ok(("", expr)) => Ok(expr),
        Ok((rest, _)) => Err(ExpressionError::Parse {
            source_text: input.to_string(),
            message: format!("unexpected trailing input '{rest}'"),
        }),
        Err(err) => Err(ExpressionError::Parse {
            source_text: input.to_string(),
            message: err.to_string(),
        }),
    }
}

// Whitespace wrapper
fn ws<'a, F, O, E: ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

// ---------------------------------------------------------------------------
// Literals
// ---------------------------------------------------------------------------

fn parse_number(input: &str) -> IResult<&str, Value> {
    map_res(
        recognize(tuple((digit1, opt(tuple((char('.'), digit1)))))),
        |s: &str| {
            if s.contains('.') {
                s.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or("invalid float")
            } else {
                s.parse::<i64>()
                    .map(|n| Value::Number(n.into()))
                    .map_err(|_| "invalid integer")
            }
        },
    )(input)
}

fn parse_string_literal(input: &str) -> IResult<&str, Value> {
    alt((
        // Double-quoted with escape sequences
        map(
            delimited(
                char('"'),
                many0(alt((
                    value('"', tag("\\\"")),
                    value('\\', tag("\\\\")),
                    value('\n', tag("\\n")),
                    value('\t', tag("\\t")),
                    value('\r', tag("\\r")),
                    none_of("\"\\"),
                ))),
                char('"'),
            ),
            |chars: Vec<char>| Value::String(chars.into_iter().collect()),
        ),
        // Single-quoted, no escapes
        map(
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
            |s: &str| Value::String(s.to_string()),
        ),
    ))(input)
}

fn parse_keyword_literal(input: &str) -> IResult<&str, Value> {
    alt((
        value(Value::Bool(true), keyword("true")),
        value(Value::Bool(false), keyword("false")),
        value(Value::Null, keyword("null")),
    ))(input)
}

/// Match a bare word that is not a prefix of a longer identifier.
fn keyword(word: &'static str) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input: &str| {
        let (rest, matched) = tag(word)(input)?;
        if rest
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        } else {
            Ok((rest, matched))
        }
    }
}

// ---------------------------------------------------------------------------
// Paths: $.a.b[0].c
// ---------------------------------------------------------------------------

fn parse_identifier(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0(alt((alphanumeric1, tag("_"), tag("-")))),
        )),
        String::from,
    )(input)
}

fn parse_path(input: &str) -> IResult<&str, Expr> {
    let (input, _) = char('$')(input)?;
    let (input, segments) = many0(alt((
        map(preceded(char('.'), parse_identifier), PathSegment::Key),
        map(
            delimited(char('['), map_res(digit1, str::parse::<usize>), char(']')),
            PathSegment::Index,
        ),
    )))(input)?;
    Ok((input, Expr::Path(segments)))
}

// ---------------------------------------------------------------------------
// Function calls
// ---------------------------------------------------------------------------

fn parse_call(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = parse_identifier(input)?;
    let Some(function) = Function::from_name(&name) else {
        // Not a whitelisted function -- reject so `parse` reports it.
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    };
    let (rest, args) = delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), parse_or),
        ws(char(')')),
    )(rest)?;
    Ok((rest, Expr::Call { function, args }))
}

// ---------------------------------------------------------------------------
// Precedence ladder
// ---------------------------------------------------------------------------

fn parse_primary(input: &str) -> IResult<&str, Expr> {
    alt((
        delimited(ws(char('(')), parse_or, ws(char(')'))),
        parse_path,
        map(parse_keyword_literal, Expr::Literal),
        parse_call,
        map(parse_number, Expr::Literal),
        map(parse_string_literal, Expr::Literal),
    ))(input)
}

fn parse_unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), parse_unary), |expr| Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(expr),
        }),
        map(preceded(ws(char('-')), parse_unary), |expr| Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(expr),
        }),
        ws(parse_primary),
    ))(input)
}

/// Left-fold a level of same-precedence binary operators.
fn binary_level<'a>(
    operand: fn(&'a str) -> IResult<&'a str, Expr>,
    ops: &'static [(&'static str, BinaryOp)],
) -> impl FnMut(&'a str) -> IResult<&'a str, Expr> {
    move |input: &'a str| {
        let (mut input, mut lhs) = operand(input)?;
        loop {
            let mut matched = None;
            for (symbol, op) in ops {
                if let Ok((rest, _)) = ws::<_, _, nom::error::Error<&str>>(tag(*symbol))(input) {
                    matched = Some((rest, *op));
                    break;
                }
            }
            let Some((rest, op)) = matched else {
                return Ok((input, lhs));
            };
            let (rest, rhs) = operand(rest)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
            input = rest;
        }
    }
}

fn parse_multiplicative(input: &str) -> IResult<&str, Expr> {
    binary_level(
        parse_unary,
        &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
    )(input)
}

fn parse_additive(input: &str) -> IResult<&str, Expr> {
    binary_level(
        parse_multiplicative,
        &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
    )(input)
}

fn parse_comparison(input: &str) -> IResult<&str, Expr> {
    // Two-character symbols first so `<` does not shadow `<=`.
    binary_level(
        parse_additive,
        &[
            ("<=", BinaryOp::Le),
            (">=", BinaryOp::Ge),
            ("<", BinaryOp::Lt),
            (">", BinaryOp::Gt),
        ],
    )(input)
}

fn parse_equality(input: &str) -> IResult<&str, Expr> {
    binary_level(
        parse_comparison,
        &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
    )(input)
}

fn parse_and(input: &str) -> IResult<&str, Expr> {
    binary_level(parse_equality, &[("&&", BinaryOp::And)])(input)
}

fn parse_or(input: &str) -> IResult<&str, Expr> {
    binary_level(parse_and, &[("||", BinaryOp::Or)])(input)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_literals() {
        assert_eq!(parse("42").unwrap(), Expr::Literal(json!(42)));
        assert_eq!(parse("3.5").unwrap(), Expr::Literal(json!(3.5)));
        assert_eq!(parse("true").unwrap(), Expr::Literal(json!(true)));
        assert_eq!(parse("null").unwrap(), Expr::Literal(Value::Null));
        assert_eq!(
            parse("\"a \\\"b\\\"\"").unwrap(),
            Expr::Literal(json!("a \"b\""))
        );
        assert_eq!(parse("'plain'").unwrap(), Expr::Literal(json!("plain")));
    }

    #[test]
    fn parse_paths() {
        let expr = parse("$.a.b[0].c").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec![
                PathSegment::Key("a".to_string()),
                PathSegment::Key("b".to_string()),
                PathSegment::Index(0),
                PathSegment::Key("c".to_string()),
            ])
        );
        // Bare `$` is the scope root.
        assert_eq!(parse("$").unwrap(), Expr::Path(vec![]));
    }

    #[test]
    fn parse_precedence() {
        // 1 + 2 * 3 groups the multiplication first
        let expr = parse("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                rhs,
                ..
            } => assert!(matches!(
                *rhs,
                Expr::Binary {
                    op: BinaryOp::Mul,
                    ..
                }
            )),
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parse_logical_chain() {
        let expr = parse("$.a > 1 && $.b == 'x' || !$.c").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Or, .. }));
    }

    #[test]
    fn parse_comparison_two_char_ops() {
        assert!(matches!(
            parse("$.n <= 10").unwrap(),
            Expr::Binary { op: BinaryOp::Le, .. }
        ));
        assert!(matches!(
            parse("$.n >= 10").unwrap(),
            Expr::Binary { op: BinaryOp::Ge, .. }
        ));
    }

    #[test]
    fn parse_whitelisted_call() {
        let expr = parse("coalesce($.a, $.b, 0)").unwrap();
        match expr {
            Expr::Call { function, args } => {
                assert_eq!(function, Function::Coalesce);
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_unknown_function() {
        let err = parse("exec('rm -rf /')").unwrap_err();
        assert!(matches!(err, ExpressionError::Parse { .. }));
    }

    #[test]
    fn parse_rejects_trailing_garbage() {
        let err = parse("1 + 2 extra").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("trailing"), "got: {msg}");
    }

    #[test]
    fn parse_nested_parens_and_unary() {
        let expr = parse("!($.flag && ($.n - 1) > 0)").unwrap();
        assert!(matches!(
            expr,
            Expr::Unary {
                op: UnaryOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn keyword_prefix_is_not_a_literal() {
        // `truestep` must not parse as `true` followed by garbage; it is an
        // unknown function-ish identifier and fails cleanly.
        assert!(parse("truestep").is_err());
    }
}
