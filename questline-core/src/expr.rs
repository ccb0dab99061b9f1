//! Arithmetic formulas compiled to reverse-Polish token lists.
//!
//! Formulas appear in switch subjects, condition operands, variable
//! modifications and effect scripts. They are compiled once (shunting-yard)
//! and evaluated on a small value stack, so hot paths never re-parse text.
//!
//! Grammar: numbers, bare identifiers (`baseX`, `i`), scoped placeholders
//! (`{var:count}`, `{counter:main:n1}`), `+ - * / % ^`, unary minus,
//! parentheses and the functions `sin cos tan abs sqrt floor ceil round min
//! max pow`. Unset variables read as `0`.

use std::fmt;

use thiserror::Error;
use tracing::warn;

/// A variable reference inside a formula or text template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    /// Scope prefix (`var`, `user`, `server`, `counter`, ...); `None` for bare names.
    pub scope: Option<String>,
    /// Variable name.
    pub name: String,
}

impl VarRef {
    /// Parse the inside of a `{...}` placeholder. The scope ends at the first `:`.
    #[must_use]
    pub fn parse_placeholder(inner: &str) -> Self {
        match inner.split_once(':') {
            Some((scope, name)) => Self {
                scope: Some(scope.trim().to_string()),
                name: name.trim().to_string(),
            },
            None => Self {
                scope: None,
                name: inner.trim().to_string(),
            },
        }
    }

    /// A bare (unscoped) reference.
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            scope: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{{{scope}:{}}}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Supplies numeric values for variable references during evaluation.
pub trait Resolve {
    /// Look up a variable; `None` means unset.
    fn resolve(&self, var: &VarRef) -> Option<f64>;
}

impl<F> Resolve for F
where
    F: Fn(&VarRef) -> Option<f64>,
{
    fn resolve(&self, var: &VarRef) -> Option<f64> {
        self(var)
    }
}

/// A resolver with no variables at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVars;

impl Resolve for NoVars {
    fn resolve(&self, _var: &VarRef) -> Option<f64> {
        None
    }
}

/// Errors from compiling or evaluating a formula.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    /// Character the tokenizer does not understand.
    #[error("unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),
    /// Operand or operator in the wrong place.
    #[error("unexpected token at position {0}")]
    UnexpectedToken(usize),
    /// Unbalanced parentheses or braces.
    #[error("mismatched parentheses")]
    Mismatched,
    /// Unknown function name.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    /// Function called with the wrong number of arguments.
    #[error("function '{name}' takes {expected} arguments, got {got}")]
    Arity {
        /// Function name.
        name: &'static str,
        /// Expected argument count.
        expected: usize,
        /// Actual argument count.
        got: usize,
    },
    /// Empty formula.
    #[error("empty expression")]
    Empty,
    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Value stack underflow or leftover values.
    #[error("malformed expression")]
    Malformed,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `^`
    Pow,
}

impl BinOp {
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '+' => Self::Add,
            '-' => Self::Sub,
            '*' => Self::Mul,
            '/' => Self::Div,
            '%' => Self::Rem,
            '^' => Self::Pow,
            _ => return None,
        })
    }

    fn precedence(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div | Self::Rem => 2,
            Self::Pow => 4,
        }
    }

    fn right_assoc(self) -> bool {
        matches!(self, Self::Pow)
    }

    fn apply(self, l: f64, r: f64) -> Result<f64, ExprError> {
        Ok(match self {
            Self::Add => l + r,
            Self::Sub => l - r,
            Self::Mul => l * r,
            Self::Div if r == 0.0 => return Err(ExprError::DivisionByZero),
            Self::Div => l / r,
            Self::Rem if r == 0.0 => return Err(ExprError::DivisionByZero),
            Self::Rem => l % r,
            Self::Pow => l.powf(r),
        })
    }
}

const NEG_PRECEDENCE: u8 = 3;

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    /// Sine (radians).
    Sin,
    /// Cosine (radians).
    Cos,
    /// Tangent (radians).
    Tan,
    /// Absolute value.
    Abs,
    /// Square root.
    Sqrt,
    /// Round down.
    Floor,
    /// Round up.
    Ceil,
    /// Round to nearest.
    Round,
    /// Smaller of two values.
    Min,
    /// Larger of two values.
    Max,
    /// `pow(a, b)`.
    Pow,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "abs" => Self::Abs,
            "sqrt" => Self::Sqrt,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "round" => Self::Round,
            "min" => Self::Min,
            "max" => Self::Max,
            "pow" => Self::Pow,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Round => "round",
            Self::Min => "min",
            Self::Max => "max",
            Self::Pow => "pow",
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Min | Self::Max | Self::Pow => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match (self, args) {
            (Self::Sin, [a]) => a.sin(),
            (Self::Cos, [a]) => a.cos(),
            (Self::Tan, [a]) => a.tan(),
            (Self::Abs, [a]) => a.abs(),
            (Self::Sqrt, [a]) => a.max(0.0).sqrt(),
            (Self::Floor, [a]) => a.floor(),
            (Self::Ceil, [a]) => a.ceil(),
            (Self::Round, [a]) => a.round(),
            (Self::Min, [a, b]) => a.min(*b),
            (Self::Max, [a, b]) => a.max(*b),
            (Self::Pow, [a, b]) => a.powf(*b),
            _ => 0.0,
        }
    }
}

/// One instruction of a compiled formula.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Push a literal.
    Num(f64),
    /// Push a variable's value.
    Load(VarRef),
    /// Negate the top of stack.
    Neg,
    /// Pop two, push the result.
    Bin(BinOp),
    /// Pop `n` arguments, push the result.
    Call(Func, usize),
}

/// A compiled formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    ops: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Var(VarRef),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Tok)>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text.parse::<f64>().map_err(|_| ExprError::UnexpectedToken(start))?;
            out.push((start, Tok::Num(n)));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            out.push((start, Tok::Ident(text)));
        } else if c == '{' {
            let start = i;
            let close = chars[i..]
                .iter()
                .position(|&ch| ch == '}')
                .ok_or(ExprError::Mismatched)?;
            let inner: String = chars[i + 1..i + close].iter().collect();
            out.push((start, Tok::Var(VarRef::parse_placeholder(&inner))));
            i += close + 1;
        } else if BinOp::from_char(c).is_some() {
            out.push((i, Tok::Op(c)));
            i += 1;
        } else {
            let tok = match c {
                '(' => Tok::LParen,
                ')' => Tok::RParen,
                ',' => Tok::Comma,
                _ => return Err(ExprError::UnexpectedChar(c, i)),
            };
            out.push((i, tok));
            i += 1;
        }
    }
    Ok(out)
}

enum Pending {
    Bin(BinOp),
    Neg,
    LParen,
    Func(Func),
}

impl Expr {
    /// Compile a formula into reverse-Polish form.
    ///
    /// # Errors
    /// Returns an [`ExprError`] describing the first syntax problem.
    pub fn compile(src: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }

        let mut out: Vec<Op> = Vec::with_capacity(tokens.len());
        let mut stack: Vec<Pending> = Vec::new();
        let mut argc: Vec<usize> = Vec::new();
        let mut expect_operand = true;

        for (idx, (pos, tok)) in tokens.iter().enumerate() {
            let next_is_paren = matches!(tokens.get(idx + 1), Some((_, Tok::LParen)));
            let prev_is_paren = idx > 0 && matches!(tokens[idx - 1].1, Tok::LParen);
            match tok {
                Tok::Num(n) => {
                    if !expect_operand {
                        return Err(ExprError::UnexpectedToken(*pos));
                    }
                    out.push(Op::Num(*n));
                    expect_operand = false;
                }
                Tok::Var(v) => {
                    if !expect_operand {
                        return Err(ExprError::UnexpectedToken(*pos));
                    }
                    out.push(Op::Load(v.clone()));
                    expect_operand = false;
                }
                Tok::Ident(name) => {
                    if !expect_operand {
                        return Err(ExprError::UnexpectedToken(*pos));
                    }
                    if next_is_paren {
                        let f = Func::from_name(name)
                            .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                        stack.push(Pending::Func(f));
                    } else if name.eq_ignore_ascii_case("pi") {
                        out.push(Op::Num(std::f64::consts::PI));
                        expect_operand = false;
                    } else {
                        out.push(Op::Load(VarRef::bare(name.clone())));
                        expect_operand = false;
                    }
                }
                Tok::Op(c) if expect_operand => match c {
                    '-' => stack.push(Pending::Neg),
                    '+' => {}
                    _ => return Err(ExprError::UnexpectedToken(*pos)),
                },
                Tok::Op(c) => {
                    let op = BinOp::from_char(*c).ok_or(ExprError::UnexpectedToken(*pos))?;
                    while let Some(top) = stack.last() {
                        let top_prec = match top {
                            Pending::Bin(t) => t.precedence(),
                            Pending::Neg => NEG_PRECEDENCE,
                            _ => break,
                        };
                        let pops = top_prec > op.precedence()
                            || (top_prec == op.precedence() && !op.right_assoc());
                        if !pops {
                            break;
                        }
                        match stack.pop() {
                            Some(Pending::Bin(t)) => out.push(Op::Bin(t)),
                            Some(Pending::Neg) => out.push(Op::Neg),
                            _ => break,
                        }
                    }
                    stack.push(Pending::Bin(op));
                    expect_operand = true;
                }
                Tok::LParen => {
                    if !expect_operand {
                        return Err(ExprError::UnexpectedToken(*pos));
                    }
                    if matches!(stack.last(), Some(Pending::Func(_))) {
                        argc.push(1);
                    }
                    stack.push(Pending::LParen);
                    expect_operand = true;
                }
                Tok::Comma => {
                    Self::drain_to_paren(&mut stack, &mut out)?;
                    let count = argc.last_mut().ok_or(ExprError::UnexpectedToken(*pos))?;
                    *count += 1;
                    expect_operand = true;
                }
                Tok::RParen => {
                    if expect_operand && !prev_is_paren {
                        return Err(ExprError::UnexpectedToken(*pos));
                    }
                    Self::drain_to_paren(&mut stack, &mut out)?;
                    stack.pop();
                    if let Some(Pending::Func(f)) = stack.last() {
                        let f = *f;
                        stack.pop();
                        let mut count = argc.pop().ok_or(ExprError::Mismatched)?;
                        if prev_is_paren {
                            count = 0;
                        }
                        if count != f.arity() {
                            return Err(ExprError::Arity {
                                name: f.name(),
                                expected: f.arity(),
                                got: count,
                            });
                        }
                        out.push(Op::Call(f, count));
                    } else if prev_is_paren {
                        return Err(ExprError::UnexpectedToken(*pos));
                    }
                    expect_operand = false;
                }
            }
        }

        if expect_operand {
            return Err(ExprError::Malformed);
        }
        while let Some(p) = stack.pop() {
            match p {
                Pending::Bin(b) => out.push(Op::Bin(b)),
                Pending::Neg => out.push(Op::Neg),
                Pending::LParen | Pending::Func(_) => return Err(ExprError::Mismatched),
            }
        }
        Ok(Self { ops: out })
    }

    fn drain_to_paren(stack: &mut Vec<Pending>, out: &mut Vec<Op>) -> Result<(), ExprError> {
        loop {
            match stack.last() {
                Some(Pending::LParen) => return Ok(()),
                Some(_) => match stack.pop() {
                    Some(Pending::Bin(b)) => out.push(Op::Bin(b)),
                    Some(Pending::Neg) => out.push(Op::Neg),
                    _ => return Err(ExprError::Mismatched),
                },
                None => return Err(ExprError::Mismatched),
            }
        }
    }

    /// A formula that always evaluates to `value`.
    #[must_use]
    pub fn constant(value: f64) -> Self {
        Self {
            ops: vec![Op::Num(value)],
        }
    }

    /// The compiled token list.
    #[must_use]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Variables the formula reads.
    pub fn variables(&self) -> impl Iterator<Item = &VarRef> {
        self.ops.iter().filter_map(|op| match op {
            Op::Load(v) => Some(v),
            _ => None,
        })
    }

    /// Evaluate against `vars`.
    ///
    /// # Errors
    /// Returns [`ExprError::DivisionByZero`] or [`ExprError::Malformed`].
    pub fn eval(&self, vars: &dyn Resolve) -> Result<f64, ExprError> {
        let mut stack: Vec<f64> = Vec::with_capacity(8);
        for op in &self.ops {
            match op {
                Op::Num(n) => stack.push(*n),
                Op::Load(v) => stack.push(vars.resolve(v).unwrap_or(0.0)),
                Op::Neg => {
                    let a = stack.pop().ok_or(ExprError::Malformed)?;
                    stack.push(-a);
                }
                Op::Bin(b) => {
                    let r = stack.pop().ok_or(ExprError::Malformed)?;
                    let l = stack.pop().ok_or(ExprError::Malformed)?;
                    stack.push(b.apply(l, r)?);
                }
                Op::Call(f, n) => {
                    if stack.len() < *n {
                        return Err(ExprError::Malformed);
                    }
                    let args = stack.split_off(stack.len() - n);
                    stack.push(f.apply(&args));
                }
            }
        }
        match stack.as_slice() {
            [v] => Ok(*v),
            _ => Err(ExprError::Malformed),
        }
    }

    /// Evaluate, degrading any failure to `0.0`.
    #[must_use]
    pub fn eval_or_zero(&self, vars: &dyn Resolve) -> f64 {
        self.eval(vars).unwrap_or(0.0)
    }
}

/// Compile and evaluate `src` in one go, degrading any failure to `0.0`.
///
/// Plain numbers skip compilation entirely.
#[must_use]
pub fn evaluate(src: &str, vars: &dyn Resolve) -> f64 {
    if let Ok(n) = src.trim().parse::<f64>() {
        return n;
    }
    match Expr::compile(src) {
        Ok(expr) => expr.eval(vars).unwrap_or_else(|e| {
            warn!(formula = src, error = %e, "Formula evaluation failed; using 0");
            0.0
        }),
        Err(e) => {
            warn!(formula = src, error = %e, "Malformed formula; using 0");
            0.0
        }
    }
}

/// Replace `{...}` placeholders in `template` using `lookup`.
///
/// Placeholders the lookup does not know are left verbatim.
#[must_use]
pub fn interpolate(template: &str, lookup: &dyn Fn(&VarRef) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let inner = &after[..close];
        match lookup(&VarRef::parse_placeholder(inner)) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(inner);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Render a number the way variables are stored: integers without a fraction.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, f64)]) -> impl Fn(&VarRef) -> Option<f64> {
        let map: HashMap<String, f64> = pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect();
        move |v: &VarRef| map.get(&v.name).copied()
    }

    fn eval(src: &str) -> f64 {
        Expr::compile(src).expect("compile").eval(&NoVars).expect("eval")
    }

    #[test]
    fn precedence_and_associativity() {
        assert!((eval("1 + 2 * 3") - 7.0).abs() < 1e-9);
        assert!((eval("(1 + 2) * 3") - 9.0).abs() < 1e-9);
        assert!((eval("2 ^ 3 ^ 2") - 512.0).abs() < 1e-9);
        assert!((eval("-2 ^ 2") + 4.0).abs() < 1e-9);
        assert!((eval("10 - 4 - 3") - 3.0).abs() < 1e-9);
        assert!((eval("7 % 4") - 3.0).abs() < 1e-9);
    }

    #[test]
    fn functions_and_arity() {
        assert!((eval("max(2, min(5, 3))") - 3.0).abs() < 1e-9);
        assert!((eval("abs(-4) + floor(1.7)") - 5.0).abs() < 1e-9);
        assert!(matches!(Expr::compile("max(1)"), Err(ExprError::Arity { .. })));
        assert!(matches!(Expr::compile("nope(1)"), Err(ExprError::UnknownFunction(_))));
    }

    #[test]
    fn variables_and_placeholders() {
        let expr = Expr::compile("baseX + i * 2 + {var:count}").expect("compile");
        let v = vars(&[("baseX", 10.0), ("i", 3.0), ("count", 1.0)]);
        assert!((expr.eval(&v).expect("eval") - 17.0).abs() < 1e-9);
        let scoped: Vec<_> = expr.variables().filter(|v| v.scope.is_some()).collect();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].scope.as_deref(), Some("var"));
    }

    #[test]
    fn unset_variables_read_as_zero() {
        let expr = Expr::compile("{user:missing} + 1").expect("compile");
        assert!((expr.eval(&NoVars).expect("eval") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn malformed_formulas_degrade_to_zero() {
        assert!(evaluate("1 +", &NoVars).abs() < f64::EPSILON);
        assert!(evaluate("(1", &NoVars).abs() < f64::EPSILON);
        assert!(evaluate("4 / 0", &NoVars).abs() < f64::EPSILON);
        assert!((evaluate("42", &NoVars) - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counter_keys_keep_inner_colons() {
        let v = VarRef::parse_placeholder("counter:main:n1");
        assert_eq!(v.scope.as_deref(), Some("counter"));
        assert_eq!(v.name, "main:n1");
    }

    #[test]
    fn interpolation_leaves_unknown_placeholders() {
        let out = interpolate("Hi {player}, you have {var:gold} gold {x}", &|v: &VarRef| {
            match (v.scope.as_deref(), v.name.as_str()) {
                (None, "player") => Some("Ada".to_string()),
                (Some("var"), "gold") => Some("12".to_string()),
                _ => None,
            }
        });
        assert_eq!(out, "Hi Ada, you have 12 gold {x}");
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(2.5), "2.5");
    }
}
