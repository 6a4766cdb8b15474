//! Constraint DSL parser (§4.1): string -> [`ParsedExpr`].
//!
//! Grammar is parsed with `nom` combinator functions (no macros). Syntax
//! (precedence, grouping, call forms, the conditional-leaf notation) is
//! handled here; catalog/arity validation happens in a second pass
//! ([`validate`]) so a syntactically-accepted but semantically-invalid
//! expression (unknown measure, wrong call arity, unsupported operator
//! symbol) reports the right [`ParseError`] kind rather than a raw nom
//! parse failure.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::char,
    combinator::{map, opt, recognize},
    multi::{many0, separated_list0},
    number::complete::double,
    sequence::{delimited, pair, tuple},
    IResult,
};

use crate::catalog::{Measure, Operator};
use crate::error::ParseError;

/// Syntax tree before catalog/arity validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Number(f64),
    Euler,
    /// Bare or conditional measure reference; `columns` is empty for a bare one.
    MeasureRef(String, Vec<String>),
    Call(String, Vec<Ast>),
    BinOp(String, Box<Ast>, Box<Ast>),
}

/// Validated expression: every node is either an accepted operator, a
/// constant, or a catalog measure with resolved conditional columns.
#[derive(Debug, Clone)]
pub enum ParsedExpr {
    Internal(Operator, Box<ParsedExpr>, Option<Box<ParsedExpr>>),
    Constant(f64),
    Base(Measure, Vec<String>),
}

fn ws0(input: &str) -> IResult<&str, &str> {
    nom::character::complete::multispace0(input)
}

fn ws<'a, F, O>(mut inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    move |input: &'a str| {
        let (input, _) = ws0(input)?;
        let (input, out) = inner(input)?;
        let (input, _) = ws0(input)?;
        Ok((input, out))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn identifier(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            nom::character::complete::satisfy(is_ident_start),
            nom::multi::many0_count(nom::character::complete::satisfy(is_ident_continue)),
        )),
        |s: &str| s.to_string(),
    )(input)
}

fn bracket_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        ws(char('[')),
        separated_list0(ws(char(',')), ws(identifier)),
        ws(char(']')),
    )(input)
}

fn conditional_measure(input: &str) -> IResult<&str, Ast> {
    map(
        delimited(
            ws(char('(')),
            tuple((ws(identifier), ws(char('|')), bracket_list)),
            ws(char(')')),
        ),
        |(name, _, cols)| Ast::MeasureRef(name, cols),
    )(input)
}

fn grouped(input: &str) -> IResult<&str, Ast> {
    delimited(ws(char('(')), parse_expr, ws(char(')')))(input)
}

fn call_args(input: &str) -> IResult<&str, Vec<Ast>> {
    delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), parse_expr),
        ws(char(')')),
    )(input)
}

fn ident_or_call(input: &str) -> IResult<&str, Ast> {
    let (input, name) = identifier(input)?;
    let (input, maybe_args) = opt(call_args)(input)?;
    match maybe_args {
        Some(args) => Ok((input, Ast::Call(name, args))),
        None => {
            if name == "e" {
                Ok((input, Ast::Euler))
            } else {
                Ok((input, Ast::MeasureRef(name, Vec::new())))
            }
        }
    }
}

fn number(input: &str) -> IResult<&str, Ast> {
    map(double, Ast::Number)(input)
}

fn atom(input: &str) -> IResult<&str, Ast> {
    ws(alt((number, conditional_measure, grouped, ident_or_call)))(input)
}

fn parse_pow(input: &str) -> IResult<&str, Ast> {
    let (input, base) = atom(input)?;
    let (input, maybe_op) = opt(ws(alt((tag("**"), tag("^")))))(input)?;
    match maybe_op {
        Some(op) => {
            let (input, rhs) = parse_pow(input)?;
            Ok((
                input,
                Ast::BinOp(op.to_string(), Box::new(base), Box::new(rhs)),
            ))
        }
        None => Ok((input, base)),
    }
}

fn parse_term(input: &str) -> IResult<&str, Ast> {
    let (input, first) = parse_pow(input)?;
    let (input, rest) = many0(pair(
        ws(alt((tag("*"), tag("/"), tag("%")))),
        parse_pow,
    ))(input)?;
    Ok((
        input,
        rest.into_iter().fold(first, |acc, (op, rhs)| {
            Ast::BinOp(op.to_string(), Box::new(acc), Box::new(rhs))
        }),
    ))
}

fn parse_expr(input: &str) -> IResult<&str, Ast> {
    let (input, first) = parse_term(input)?;
    let (input, rest) = many0(pair(ws(alt((tag("+"), tag("-")))), parse_term))(input)?;
    Ok((
        input,
        rest.into_iter().fold(first, |acc, (op, rhs)| {
            Ast::BinOp(op.to_string(), Box::new(acc), Box::new(rhs))
        }),
    ))
}

/// Parses `input` into an [`Ast`], failing with [`ParseError::MalformedInput`]
/// or [`ParseError::BadConditional`] on a syntax error (no trailing garbage
/// allowed: "more than one top-level expression" is rejected here).
pub fn parse(input: &str) -> Result<Ast, ParseError> {
    match parse_expr(input) {
        Ok((remaining, ast)) => {
            if remaining.trim().is_empty() {
                Ok(ast)
            } else {
                Err(ParseError::MalformedInput(format!(
                    "unexpected trailing input: `{}`",
                    remaining.trim()
                )))
            }
        }
        Err(_) => {
            if input.contains('|') {
                Err(ParseError::BadConditional(format!(
                    "expected `(Measure | [Col1, Col2])` in `{}`",
                    input.trim()
                )))
            } else {
                Err(ParseError::MalformedInput(format!(
                    "could not parse expression `{}`",
                    input.trim()
                )))
            }
        }
    }
}

/// Resolves catalog membership, conditional-column legality, operator
/// symbols, and call arity, turning a bare [`Ast`] into a [`ParsedExpr`].
pub fn validate(ast: Ast, known_columns: &[String]) -> Result<ParsedExpr, ParseError> {
    match ast {
        Ast::Number(v) => Ok(ParsedExpr::Constant(v)),
        Ast::Euler => Ok(ParsedExpr::Constant(std::f64::consts::E)),
        Ast::MeasureRef(name, cols) => {
            let measure: Measure = name.parse()?;
            for col in &cols {
                if !known_columns.iter().any(|c| c == col) {
                    return Err(ParseError::BadConditional(format!(
                        "`{}` is not a known sensitive column",
                        col
                    )));
                }
            }
            if measure.is_pairwise() && cols.len() != 2 {
                return Err(ParseError::BadConditional(format!(
                    "`{}` names the two compared groups and needs exactly 2 conditional columns, found {}",
                    measure,
                    cols.len()
                )));
            }
            Ok(ParsedExpr::Base(measure, cols))
        }
        Ast::Call(name, args) => {
            let (op, expected) = Operator::from_call_name(&name)
                .ok_or_else(|| ParseError::UnsupportedOperator(name.clone()))?;
            if args.len() != expected {
                return Err(ParseError::BadArity {
                    name,
                    expected,
                    found: args.len(),
                });
            }
            let mut it = args.into_iter();
            let left = Box::new(validate(it.next().unwrap(), known_columns)?);
            let right = match it.next() {
                Some(a) => Some(Box::new(validate(a, known_columns)?)),
                None => None,
            };
            Ok(ParsedExpr::Internal(op, left, right))
        }
        Ast::BinOp(sym, l, r) => {
            let op = Operator::from_symbol(&sym)
                .ok_or_else(|| ParseError::UnsupportedOperator(sym.clone()))?;
            let left = Box::new(validate(*l, known_columns)?);
            let right = Box::new(validate(*r, known_columns)?);
            Ok(ParsedExpr::Internal(op, left, Some(right)))
        }
    }
}

/// Parses and validates `expr` in one step, the entry point `tree::build` uses.
pub fn parse_constraint(expr: &str, known_columns: &[String]) -> Result<ParsedExpr, ParseError> {
    let ast = parse(expr)?;
    validate(ast, known_columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_constant_expression() {
        let ast = parse("0.15").unwrap();
        assert_eq!(ast, Ast::Number(0.15));
    }

    #[test]
    fn parses_conditional_measure() {
        let ast = parse("(PR | [M])").unwrap();
        assert_eq!(ast, Ast::MeasureRef("PR".to_string(), vec!["M".to_string()]));
    }

    #[test]
    fn parses_demographic_parity_expression() {
        let ast = parse("abs((PR | [M]) - (PR | [F])) - 0.15").unwrap();
        match ast {
            Ast::BinOp(op, _, _) => assert_eq!(op, "-"),
            other => panic!("expected top-level subtraction, got {:?}", other),
        }
    }

    #[test]
    fn parses_leading_negative_constant() {
        let ast = parse("-0.25 - J_pi_new").unwrap();
        match ast {
            Ast::BinOp(op, left, _) => {
                assert_eq!(op, "-");
                assert_eq!(*left, Ast::Number(-0.25));
            }
            other => panic!("unexpected ast {:?}", other),
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        let err = parse("0.15 0.2").unwrap_err();
        assert!(matches!(err, ParseError::MalformedInput(_)));
    }

    #[test]
    fn validate_rejects_unknown_measure() {
        let ast = parse("NOT_A_MEASURE").unwrap();
        let err = validate(ast, &[]).unwrap_err();
        assert!(matches!(err, ParseError::UnknownMeasure(_)));
    }

    #[test]
    fn validate_rejects_bad_arity() {
        let ast = parse("min(1)").unwrap();
        let err = validate(ast, &[]).unwrap_err();
        assert!(matches!(err, ParseError::BadArity { .. }));
    }

    #[test]
    fn validate_rejects_unsupported_operator() {
        let ast = parse("1 % 2").unwrap();
        let err = validate(ast, &[]).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedOperator(_)));
    }

    #[test]
    fn validate_rejects_unknown_conditional_column() {
        let ast = parse("(PR | [Z])").unwrap();
        let err = validate(ast, &["M".to_string(), "F".to_string()]).unwrap_err();
        assert!(matches!(err, ParseError::BadConditional(_)));
    }

    #[test]
    fn validate_rejects_med_with_wrong_conditional_arity() {
        let ast = parse("(MED | [M])").unwrap();
        let err = validate(ast, &["M".to_string(), "F".to_string()]).unwrap_err();
        assert!(matches!(err, ParseError::BadConditional(_)));
    }

    #[test]
    fn validate_accepts_med_with_two_groups() {
        let ast = parse("(MED | [M, F])").unwrap();
        let parsed = validate(ast, &["M".to_string(), "F".to_string()]).unwrap();
        match parsed {
            ParsedExpr::Base(Measure::Med, cols) => assert_eq!(cols, vec!["M", "F"]),
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn parse_constraint_builds_full_tree() {
        let columns = vec!["M".to_string(), "F".to_string()];
        let parsed = parse_constraint("0.8 - min((PR | [M])/(PR | [F]), (PR | [F])/(PR | [M]))", &columns)
            .unwrap();
        match parsed {
            ParsedExpr::Internal(Operator::Sub, _, _) => {}
            other => panic!("unexpected top node {:?}", other),
        }
    }
}
