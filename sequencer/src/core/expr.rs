//! Arithmetic expressions evaluated by worker commands against the object store.

use std::fmt;

use crate::core::error::ControlError;
use crate::core::objects::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "sqrt" => Some(Func::Sqrt),
            "abs" => Some(Func::Abs),
            "sin" => Some(Func::Sin),
            "cos" => Some(Func::Cos),
            "tan" => Some(Func::Tan),
            "exp" => Some(Func::Exp),
            "ln" => Some(Func::Ln),
            _ => None,
        }
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Func::Sqrt => x.sqrt(),
            Func::Abs => x.abs(),
            Func::Sin => x.sin(),
            Func::Cos => x.cos(),
            Func::Tan => x.tan(),
            Func::Exp => x.exp(),
            Func::Ln => x.ln(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Name(String),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(Func, Box<Node>),
}

/// Parsed expression plus the text it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ControlError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            source,
        };
        let root = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.trim().to_string(),
            root,
        })
    }

    pub fn constant(value: f64) -> Self {
        Self {
            source: value.to_string(),
            root: Node::Number(value),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the bare name if the expression is a single object reference.
    pub fn as_name(&self) -> Option<&str> {
        match &self.root {
            Node::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn eval(&self, objects: &ObjectStore) -> Result<f64, ControlError> {
        let value = eval_node(&self.root, objects)?;
        if !value.is_finite() {
            return Err(ControlError::Evaluation {
                expr: self.source.clone(),
                reason: format!("non-finite result {value}"),
            });
        }
        Ok(value)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval_node(node: &Node, objects: &ObjectStore) -> Result<f64, ControlError> {
    Ok(match node {
        Node::Number(value) => *value,
        Node::Name(name) => objects.get(name)?,
        Node::Neg(inner) => -eval_node(inner, objects)?,
        Node::Call(func, arg) => func.apply(eval_node(arg, objects)?),
        Node::Binary(op, lhs, rhs) => {
            let l = eval_node(lhs, objects)?;
            let r = eval_node(rhs, objects)?;
            match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
                BinOp::Pow => l.powf(r),
            }
        }
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    Open,
    Close,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ControlError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                i += 1;
                if i < chars.len() && matches!(chars[i], '+' | '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text.parse::<f64>().map_err(|_| ControlError::Evaluation {
                expr: source.to_string(),
                reason: format!("bad number '{text}'"),
            })?;
            tokens.push(Token::Number(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if matches!(c, '+' | '-' | '*' | '/' | '^') {
            tokens.push(Token::Op(c));
            i += 1;
        } else if c == '(' {
            tokens.push(Token::Open);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::Close);
            i += 1;
        } else {
            return Err(ControlError::Evaluation {
                expr: source.to_string(),
                reason: format!("unexpected character '{c}'"),
            });
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> ControlError {
        ControlError::Evaluation {
            expr: self.source.to_string(),
            reason: format!("{reason} at token {}", self.pos + 1),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Node, ControlError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = if *op == '+' { BinOp::Add } else { BinOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Node, ControlError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = if *op == '*' { BinOp::Mul } else { BinOp::Div };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node, ControlError> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        if let Some(Token::Op('+')) = self.peek() {
            self.pos += 1;
            return self.unary();
        }
        self.power()
    }

    // Right associative: a^b^c == a^(b^c), and -a^b == -(a^b).
    fn power(&mut self) -> Result<Node, ControlError> {
        let base = self.atom()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Node::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Node, ControlError> {
        match self.bump() {
            Some(Token::Number(value)) => Ok(Node::Number(value)),
            Some(Token::Ident(name)) => {
                if let Some(Token::Open) = self.peek() {
                    let func = Func::lookup(&name)
                        .ok_or_else(|| self.error(&format!("unknown function '{name}'")))?;
                    self.pos += 1;
                    let arg = self.expr()?;
                    self.expect_close()?;
                    return Ok(Node::Call(func, Box::new(arg)));
                }
                Ok(Node::Name(name))
            }
            Some(Token::Open) => {
                let inner = self.expr()?;
                self.expect_close()?;
                Ok(inner)
            }
            _ => Err(self.error("expected a number, name or '('")),
        }
    }

    fn expect_close(&mut self) -> Result<(), ControlError> {
        match self.bump() {
            Some(Token::Close) => Ok(()),
            _ => Err(self.error("expected ')'")),
        }
    }
}
