use std::cell::OnceCell;

use serde_json::{Number, Value};

use crate::error::ExprError;
use crate::quantity::compare_quantities;

/// Hard ceiling on evaluation steps. Expressions are user-supplied; the
/// evaluator must terminate regardless of input.
const STEP_BUDGET: u64 = 10_000;

// ── Context ───────────────────────────────────────────────────────────────────

type LazyValue<'a> = Box<dyn Fn() -> Value + Send + 'a>;
type LazyBool<'a> = Box<dyn Fn() -> bool + Send + 'a>;

/// Variable bindings for one evaluation.
///
/// `self` is always available. `composition` and `pathManagedByEno` are
/// lazy: their providers run at most once, and only if the expression
/// actually references them.
pub struct Context<'a> {
    self_: &'a Value,
    composition: Option<LazyValue<'a>>,
    composition_cache: OnceCell<Value>,
    path_managed_by_eno: Option<LazyBool<'a>>,
    path_managed_cache: OnceCell<bool>,
}

impl<'a> Context<'a> {
    pub fn new(self_: &'a Value) -> Self {
        Context {
            self_,
            composition: None,
            composition_cache: OnceCell::new(),
            path_managed_by_eno: None,
            path_managed_cache: OnceCell::new(),
        }
    }

    pub fn with_composition(mut self, f: impl Fn() -> Value + Send + 'a) -> Self {
        self.composition = Some(Box::new(f));
        self
    }

    pub fn with_path_managed_by_eno(mut self, f: impl Fn() -> bool + Send + 'a) -> Self {
        self.path_managed_by_eno = Some(Box::new(f));
        self
    }

    fn composition(&self) -> Result<Value, ExprError> {
        match &self.composition {
            Some(f) => Ok(self.composition_cache.get_or_init(f).clone()),
            None => Err(ExprError::Eval(
                "composition is not available in this context".into(),
            )),
        }
    }

    fn path_managed(&self) -> bool {
        match &self.path_managed_by_eno {
            Some(f) => *self.path_managed_cache.get_or_init(f),
            None => false,
        }
    }
}

// ── Program ───────────────────────────────────────────────────────────────────

/// A compiled expression. Compile once per manifest ingestion; evaluate on
/// every reconcile.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    src: String,
    ast: Ast,
}

impl Program {
    pub fn compile(src: &str) -> Result<Self, ExprError> {
        let tokens = lex(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::parse(
                parser.offset(),
                "unexpected trailing input",
            ));
        }
        Ok(Program {
            src: src.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.src
    }

    pub fn eval(&self, ctx: &Context<'_>) -> Result<Value, ExprError> {
        let mut steps = 0u64;
        eval(&self.ast, ctx, &mut steps)
    }

    /// Evaluate and require a boolean result.
    pub fn eval_bool(&self, ctx: &Context<'_>) -> Result<bool, ExprError> {
        match self.eval(ctx)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::Eval(format!(
                "expected a boolean result, got {}",
                type_name(&other)
            ))),
        }
    }
}

// ── Tokens ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    EqEq,
    NotEq,
    Le,
    Ge,
    Lt,
    Gt,
    AndAnd,
    OrOr,
    Not,
    Plus,
    Minus,
    Question,
    Colon,
}

fn lex(src: &str) -> Result<Vec<(usize, Tok)>, ExprError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
            }
            b'(' => {
                out.push((start, Tok::LParen));
                i += 1;
            }
            b')' => {
                out.push((start, Tok::RParen));
                i += 1;
            }
            b'[' => {
                out.push((start, Tok::LBracket));
                i += 1;
            }
            b']' => {
                out.push((start, Tok::RBracket));
                i += 1;
            }
            b'.' => {
                out.push((start, Tok::Dot));
                i += 1;
            }
            b',' => {
                out.push((start, Tok::Comma));
                i += 1;
            }
            b'?' => {
                out.push((start, Tok::Question));
                i += 1;
            }
            b':' => {
                out.push((start, Tok::Colon));
                i += 1;
            }
            b'+' => {
                out.push((start, Tok::Plus));
                i += 1;
            }
            b'-' => {
                out.push((start, Tok::Minus));
                i += 1;
            }
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((start, Tok::EqEq));
                    i += 2;
                } else {
                    return Err(ExprError::parse(i, "single '=' is not an operator"));
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((start, Tok::NotEq));
                    i += 2;
                } else {
                    out.push((start, Tok::Not));
                    i += 1;
                }
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((start, Tok::Le));
                    i += 2;
                } else {
                    out.push((start, Tok::Lt));
                    i += 1;
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((start, Tok::Ge));
                    i += 2;
                } else {
                    out.push((start, Tok::Gt));
                    i += 1;
                }
            }
            b'&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    out.push((start, Tok::AndAnd));
                    i += 2;
                } else {
                    return Err(ExprError::parse(i, "single '&' is not an operator"));
                }
            }
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    out.push((start, Tok::OrOr));
                    i += 2;
                } else {
                    return Err(ExprError::parse(i, "single '|' is not an operator"));
                }
            }
            b'"' | b'\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match bytes.get(i) {
                        Some(b'\\') => {
                            match bytes.get(i + 1) {
                                Some(b'n') => s.push('\n'),
                                Some(b't') => s.push('\t'),
                                Some(&e) => s.push(e as char),
                                None => {
                                    return Err(ExprError::parse(i, "unterminated escape"))
                                }
                            }
                            i += 2;
                        }
                        Some(&e) if e == quote => {
                            i += 1;
                            break;
                        }
                        Some(&e) => {
                            s.push(e as char);
                            i += 1;
                        }
                        None => return Err(ExprError::parse(start, "unterminated string")),
                    }
                }
                out.push((start, Tok::Str(s)));
            }
            b'0'..=b'9' => {
                let mut is_float = false;
                while i < bytes.len() {
                    match bytes[i] {
                        b'0'..=b'9' => i += 1,
                        b'.' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                            is_float = true;
                            i += 1;
                        }
                        b'e' | b'E'
                            if bytes
                                .get(i + 1)
                                .is_some_and(|n| n.is_ascii_digit() || *n == b'-') =>
                        {
                            is_float = true;
                            i += 2;
                        }
                        _ => break,
                    }
                }
                let text = String::from_utf8_lossy(&bytes[start..i]);
                if is_float {
                    let f: f64 = text
                        .parse()
                        .map_err(|_| ExprError::parse(start, "invalid number"))?;
                    out.push((start, Tok::Float(f)));
                } else {
                    let n: i64 = text
                        .parse()
                        .map_err(|_| ExprError::parse(start, "invalid number"))?;
                    out.push((start, Tok::Int(n)));
                }
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = String::from_utf8_lossy(&bytes[start..i]).into_owned();
                out.push((
                    start,
                    match word.as_str() {
                        "in" => Tok::In,
                        _ => Tok::Ident(word),
                    },
                ));
            }
            other => {
                return Err(ExprError::parse(
                    i,
                    format!("unexpected character {:?}", other as char),
                ));
            }
        }
    }
    Ok(out)
}

// ── AST & parser ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Lit(Value),
    Ident(String),
    List(Vec<Ast>),
    Member(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    Call {
        target: Option<Box<Ast>>,
        name: String,
        args: Vec<Ast>,
    },
    Not(Box<Ast>),
    Neg(Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Ternary(Box<Ast>, Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    And,
    Or,
    Add,
    Sub,
}

struct Parser {
    tokens: Vec<(usize, Tok)>,
    pos: usize,
}

impl Parser {
    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |(o, _)| *o)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: Tok) -> Result<(), ExprError> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError::parse(
                self.offset(),
                format!("expected {:?}", tok),
            ))
        }
    }

    fn expression(&mut self) -> Result<Ast, ExprError> {
        let cond = self.or_expr()?;
        if self.peek() == Some(&Tok::Question) {
            self.pos += 1;
            let then = self.expression()?;
            self.expect(Tok::Colon)?;
            let otherwise = self.expression()?;
            return Ok(Ast::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or_expr(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Tok::OrOr) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Ast::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.rel_expr()?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.pos += 1;
            let right = self.rel_expr()?;
            left = Ast::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn rel_expr(&mut self) -> Result<Ast, ExprError> {
        let left = self.add_expr()?;
        let op = match self.peek() {
            Some(Tok::EqEq) => BinOp::Eq,
            Some(Tok::NotEq) => BinOp::Ne,
            Some(Tok::Lt) => BinOp::Lt,
            Some(Tok::Le) => BinOp::Le,
            Some(Tok::Gt) => BinOp::Gt,
            Some(Tok::Ge) => BinOp::Ge,
            Some(Tok::In) => BinOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.add_expr()?;
        Ok(Ast::Binary(op, Box::new(left), Box::new(right)))
    }

    fn add_expr(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary_expr()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary_expr(&mut self) -> Result<Ast, ExprError> {
        match self.peek() {
            Some(Tok::Not) => {
                self.pos += 1;
                Ok(Ast::Not(Box::new(self.unary_expr()?)))
            }
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Ast::Neg(Box::new(self.unary_expr()?)))
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> Result<Ast, ExprError> {
        let mut node = self.primary()?;
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    let name = match self.bump() {
                        Some(Tok::Ident(name)) => name,
                        _ => {
                            return Err(ExprError::parse(
                                self.offset(),
                                "expected field name after '.'",
                            ))
                        }
                    };
                    // A parenthesis after `.name` makes it a method call.
                    if self.peek() == Some(&Tok::LParen) {
                        self.pos += 1;
                        let args = self.arguments()?;
                        node = Ast::Call {
                            target: Some(Box::new(node)),
                            name,
                            args,
                        };
                    } else {
                        node = Ast::Member(Box::new(node), name);
                    }
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.expect(Tok::RBracket)?;
                    node = Ast::Index(Box::new(node), Box::new(index));
                }
                Some(Tok::LParen) => {
                    // Global function call: only valid directly on an identifier.
                    let name = match &node {
                        Ast::Ident(name) => name.clone(),
                        _ => {
                            return Err(ExprError::parse(
                                self.offset(),
                                "only named functions can be called",
                            ))
                        }
                    };
                    self.pos += 1;
                    let args = self.arguments()?;
                    node = Ast::Call {
                        target: None,
                        name,
                        args,
                    };
                }
                _ => break,
            }
        }
        Ok(node)
    }

    /// Arguments up to and including the closing parenthesis.
    fn arguments(&mut self) -> Result<Vec<Ast>, ExprError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Tok::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            match self.bump() {
                Some(Tok::Comma) => continue,
                Some(Tok::RParen) => return Ok(args),
                _ => return Err(ExprError::parse(self.offset(), "expected ',' or ')'")),
            }
        }
    }

    fn primary(&mut self) -> Result<Ast, ExprError> {
        match self.bump() {
            Some(Tok::Int(n)) => Ok(Ast::Lit(Value::Number(n.into()))),
            Some(Tok::Float(f)) => Ok(Ast::Lit(
                Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Tok::Str(s)) => Ok(Ast::Lit(Value::String(s))),
            Some(Tok::Ident(word)) => match word.as_str() {
                "true" => Ok(Ast::Lit(Value::Bool(true))),
                "false" => Ok(Ast::Lit(Value::Bool(false))),
                "null" => Ok(Ast::Lit(Value::Null)),
                _ => Ok(Ast::Ident(word)),
            },
            Some(Tok::LParen) => {
                let inner = self.expression()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Tok::RBracket) {
                    self.pos += 1;
                    return Ok(Ast::List(items));
                }
                loop {
                    items.push(self.expression()?);
                    match self.bump() {
                        Some(Tok::Comma) => continue,
                        Some(Tok::RBracket) => return Ok(Ast::List(items)),
                        _ => {
                            return Err(ExprError::parse(
                                self.offset(),
                                "expected ',' or ']'",
                            ))
                        }
                    }
                }
            }
            other => Err(ExprError::parse(
                self.offset(),
                format!("unexpected token {:?}", other),
            )),
        }
    }
}

// ── Evaluation ────────────────────────────────────────────────────────────────

fn eval(ast: &Ast, ctx: &Context<'_>, steps: &mut u64) -> Result<Value, ExprError> {
    *steps += 1;
    if *steps > STEP_BUDGET {
        return Err(ExprError::StepBudget(STEP_BUDGET));
    }

    match ast {
        Ast::Lit(v) => Ok(v.clone()),

        Ast::Ident(name) => match name.as_str() {
            "self" => Ok(ctx.self_.clone()),
            "composition" => ctx.composition(),
            "pathManagedByEno" => Ok(Value::Bool(ctx.path_managed())),
            other => Err(ExprError::Eval(format!("unknown variable {:?}", other))),
        },

        Ast::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx, steps)?);
            }
            Ok(Value::Array(out))
        }

        Ast::Member(base, name) => {
            let base = eval(base, ctx, steps)?;
            match base {
                Value::Object(map) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ExprError::Eval(format!("no such field {:?}", name))),
                other => Err(ExprError::Eval(format!(
                    "cannot select field {:?} from {}",
                    name,
                    type_name(&other)
                ))),
            }
        }

        Ast::Index(base, index) => {
            let base = eval(base, ctx, steps)?;
            let index = eval(index, ctx, steps)?;
            match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    let i = n
                        .as_u64()
                        .ok_or_else(|| ExprError::Eval("negative index".into()))?
                        as usize;
                    items.get(i).cloned().ok_or(ExprError::IndexOutOfRange {
                        index: i,
                        len: items.len(),
                    })
                }
                (Value::Object(map), Value::String(key)) => map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ExprError::Eval(format!("no such field {:?}", key))),
                _ => Err(ExprError::Eval(format!(
                    "cannot index {} with {}",
                    type_name(&base),
                    type_name(&index)
                ))),
            }
        }

        Ast::Not(inner) => match eval(inner, ctx, steps)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::Eval(format!(
                "'!' requires a boolean, got {}",
                type_name(&other)
            ))),
        },

        Ast::Neg(inner) => {
            let v = eval(inner, ctx, steps)?;
            let n = as_f64(&v).ok_or_else(|| {
                ExprError::Eval(format!("'-' requires a number, got {}", type_name(&v)))
            })?;
            Ok(number(-n))
        }

        Ast::Binary(op, left, right) => eval_binary(*op, left, right, ctx, steps),

        Ast::Ternary(cond, then, otherwise) => match eval(cond, ctx, steps)? {
            Value::Bool(true) => eval(then, ctx, steps),
            Value::Bool(false) => eval(otherwise, ctx, steps),
            other => Err(ExprError::Eval(format!(
                "ternary condition must be boolean, got {}",
                type_name(&other)
            ))),
        },

        Ast::Call { target, name, args } => eval_call(target.as_deref(), name, args, ctx, steps),
    }
}

fn eval_binary(
    op: BinOp,
    left: &Ast,
    right: &Ast,
    ctx: &Context<'_>,
    steps: &mut u64,
) -> Result<Value, ExprError> {
    // Short-circuiting operators evaluate the right side lazily.
    match op {
        BinOp::And | BinOp::Or => {
            let l = match eval(left, ctx, steps)? {
                Value::Bool(b) => b,
                other => {
                    return Err(ExprError::Eval(format!(
                        "logical operator requires booleans, got {}",
                        type_name(&other)
                    )))
                }
            };
            if (op == BinOp::And && !l) || (op == BinOp::Or && l) {
                return Ok(Value::Bool(l));
            }
            return match eval(right, ctx, steps)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(ExprError::Eval(format!(
                    "logical operator requires booleans, got {}",
                    type_name(&other)
                ))),
            };
        }
        _ => {}
    }

    let l = eval(left, ctx, steps)?;
    let r = eval(right, ctx, steps)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(&l, &r)?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinOp::In => match &r {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| loose_eq(i, &l)))),
            Value::Object(map) => match &l {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                other => Err(ExprError::Eval(format!(
                    "'in' on a map requires a string key, got {}",
                    type_name(other)
                ))),
            },
            other => Err(ExprError::Eval(format!(
                "'in' requires a list or map, got {}",
                type_name(other)
            ))),
        },
        BinOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => {
                Ok(Value::String(format!("{}{}", a, b)))
            }
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => numeric_op(&l, &r, |a, b| a + b),
        },
        BinOp::Sub => numeric_op(&l, &r, |a, b| a - b),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn eval_call(
    target: Option<&Ast>,
    name: &str,
    args: &[Ast],
    ctx: &Context<'_>,
    steps: &mut u64,
) -> Result<Value, ExprError> {
    if let Some(target) = target {
        let recv = eval(target, ctx, steps)?;
        let mut vals = Vec::with_capacity(args.len());
        for a in args {
            vals.push(eval(a, ctx, steps)?);
        }
        return match (name, recv, vals.as_slice()) {
            ("startsWith", Value::String(s), [Value::String(p)]) => {
                Ok(Value::Bool(s.starts_with(p.as_str())))
            }
            ("endsWith", Value::String(s), [Value::String(p)]) => {
                Ok(Value::Bool(s.ends_with(p.as_str())))
            }
            ("contains", Value::String(s), [Value::String(p)]) => {
                Ok(Value::Bool(s.contains(p.as_str())))
            }
            (name, recv, _) => Err(ExprError::Eval(format!(
                "unknown method {:?} on {}",
                name,
                type_name(&recv)
            ))),
        };
    }

    match name {
        // has() tests presence without erroring on missing fields.
        "has" => {
            let [arg] = args else {
                return Err(ExprError::Eval("has() takes one argument".into()));
            };
            eval_presence(arg, ctx, steps).map(Value::Bool)
        }
        "size" => {
            let [arg] = args else {
                return Err(ExprError::Eval("size() takes one argument".into()));
            };
            match eval(arg, ctx, steps)? {
                Value::String(s) => Ok(Value::Number((s.chars().count() as u64).into())),
                Value::Array(a) => Ok(Value::Number((a.len() as u64).into())),
                Value::Object(m) => Ok(Value::Number((m.len() as u64).into())),
                other => Err(ExprError::Eval(format!(
                    "size() requires a string, list or map, got {}",
                    type_name(&other)
                ))),
            }
        }
        "string" => {
            let [arg] = args else {
                return Err(ExprError::Eval("string() takes one argument".into()));
            };
            match eval(arg, ctx, steps)? {
                Value::String(s) => Ok(Value::String(s)),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(ExprError::Eval(format!(
                    "string() cannot convert {}",
                    type_name(&other)
                ))),
            }
        }
        "int" => {
            let [arg] = args else {
                return Err(ExprError::Eval("int() takes one argument".into()));
            };
            match eval(arg, ctx, steps)? {
                Value::Number(n) => {
                    let f = n.as_f64().unwrap_or(0.0);
                    Ok(Value::Number((f as i64).into()))
                }
                Value::String(s) => s
                    .parse::<i64>()
                    .map(|n| Value::Number(n.into()))
                    .map_err(|_| ExprError::Eval(format!("int() cannot parse {:?}", s))),
                other => Err(ExprError::Eval(format!(
                    "int() cannot convert {}",
                    type_name(&other)
                ))),
            }
        }
        "compareResourceQuantities" => {
            let [a, b] = args else {
                return Err(ExprError::Eval(
                    "compareResourceQuantities() takes two arguments".into(),
                ));
            };
            let a = eval(a, ctx, steps)?;
            let b = eval(b, ctx, steps)?;
            let (a, b) = match (&a, &b) {
                (Value::String(a), Value::String(b)) => (a.as_str(), b.as_str()),
                _ => {
                    return Err(ExprError::Eval(
                        "compareResourceQuantities() requires two strings".into(),
                    ))
                }
            };
            Ok(Value::Number(compare_quantities(a, b)?.into()))
        }
        other => Err(ExprError::Eval(format!("unknown function {:?}", other))),
    }
}

/// Presence semantics for `has()`: the base of the selection must evaluate,
/// but a missing final field yields `false` instead of an error.
fn eval_presence(ast: &Ast, ctx: &Context<'_>, steps: &mut u64) -> Result<bool, ExprError> {
    match ast {
        Ast::Member(base, name) => {
            let base = match eval_present_value(base, ctx, steps)? {
                Some(v) => v,
                None => return Ok(false),
            };
            match base {
                Value::Object(map) => Ok(map.contains_key(name)),
                _ => Ok(false),
            }
        }
        Ast::Index(base, index) => {
            let base = match eval_present_value(base, ctx, steps)? {
                Some(v) => v,
                None => return Ok(false),
            };
            let index = eval(index, ctx, steps)?;
            Ok(match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    n.as_u64().map_or(false, |i| (i as usize) < items.len())
                }
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                _ => false,
            })
        }
        _ => Err(ExprError::Eval(
            "has() requires a field selection argument".into(),
        )),
    }
}

/// Evaluate a selection chain, treating missing intermediate fields as
/// absence rather than errors.
fn eval_present_value(
    ast: &Ast,
    ctx: &Context<'_>,
    steps: &mut u64,
) -> Result<Option<Value>, ExprError> {
    match ast {
        Ast::Member(base, name) => {
            let base = match eval_present_value(base, ctx, steps)? {
                Some(v) => v,
                None => return Ok(None),
            };
            match base {
                Value::Object(mut map) => Ok(map.remove(name)),
                _ => Ok(None),
            }
        }
        Ast::Index(base, index) => {
            let base = match eval_present_value(base, ctx, steps)? {
                Some(v) => v,
                None => return Ok(None),
            };
            let index = eval(index, ctx, steps)?;
            Ok(match (base, index) {
                (Value::Array(mut items), Value::Number(n)) => n
                    .as_u64()
                    .map(|i| i as usize)
                    .filter(|i| *i < items.len())
                    .map(|i| items.swap_remove(i)),
                (Value::Object(mut map), Value::String(key)) => map.remove(&key),
                _ => None,
            })
        }
        other => eval(other, ctx, steps).map(Some),
    }
}

// ── Value helpers ─────────────────────────────────────────────────────────────

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn number(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn numeric_op(l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    match (as_f64(l), as_f64(r)) {
        (Some(a), Some(b)) => Ok(number(f(a, b))),
        _ => Err(ExprError::Eval(format!(
            "arithmetic requires numbers, got {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

/// Equality with numeric normalization: `1 == 1.0` holds.
fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).map_or(a == b, |(a, b)| a == b)
        }
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => {
            let (a, b) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b)
                .ok_or_else(|| ExprError::Eval("numbers are not comparable".into()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExprError::Eval(format!(
            "cannot order {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
