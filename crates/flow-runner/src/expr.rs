//! Restricted boolean-expression interpreter for `while` conditions.
//!
//! Grammar: variable references (with dotted access into objects), number,
//! string, `true`/`false`/`null` literals, comparisons
//! (`==` `!=` `<` `<=` `>` `>=`), boolean `&&`/`||`/`!`, and parentheses.
//! Deliberately no function calls, no assignment, no arbitrary code. Any
//! parse or evaluation failure yields `false`, matching the permissive
//! behavior flows were authored against.

use serde_json::Value;

use crate::vars::VarStore;

/// Evaluate `expression` against the variable store. Never panics; malformed
/// input is simply false.
pub fn eval_expression(expression: &str, vars: &VarStore) -> bool {
    let tokens = match tokenize(expression) {
        Some(tokens) => tokens,
        None => return false,
    };
    let mut parser = Parser { tokens, pos: 0 };
    match parser.parse_or() {
        Some(node) if parser.at_end() => is_truthy(&eval(&node, vars)),
        _ => false,
    }
}

/// JavaScript-flavored truthiness: `false`, `0`, `""`, `null` and absent
/// values are falsy; everything else (including empty arrays/objects) is
/// truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Dot,
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return None;
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return None;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                    // Tolerate strict equality spelling.
                    if chars.get(i) == Some(&'=') {
                        i += 1;
                    }
                } else {
                    return None;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    let ch = *chars.get(i)?;
                    if ch == quote {
                        i += 1;
                        break;
                    }
                    value.push(ch);
                    i += 1;
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(text.parse().ok()?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            _ => return None,
        }
    }
    Some(tokens)
}

#[derive(Debug)]
enum Node {
    Literal(Value),
    Var(Vec<String>),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Cmp(Box<Node>, CmpOp, Box<Node>),
}

#[derive(Clone, Copy, Debug)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos == self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Option<Node> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Some(left)
    }

    fn parse_and(&mut self) -> Option<Node> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_cmp()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Some(left)
    }

    fn parse_cmp(&mut self) -> Option<Node> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Some(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Some(Node::Cmp(Box::new(left), op, Box::new(right)))
    }

    fn parse_unary(&mut self) -> Option<Node> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Some(Node::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Option<Node> {
        match self.advance()? {
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.advance()? {
                    Token::RParen => Some(inner),
                    _ => None,
                }
            }
            Token::Number(n) => Some(Node::Literal(
                serde_json::Number::from_f64(n).map(Value::Number)?,
            )),
            Token::Str(s) => Some(Node::Literal(Value::String(s))),
            Token::True => Some(Node::Literal(Value::Bool(true))),
            Token::False => Some(Node::Literal(Value::Bool(false))),
            Token::Null => Some(Node::Literal(Value::Null)),
            Token::Ident(first) => {
                let mut path = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance()? {
                        Token::Ident(next) => path.push(next),
                        _ => return None,
                    }
                }
                Some(Node::Var(path))
            }
            _ => None,
        }
    }
}

fn eval(node: &Node, vars: &VarStore) -> Value {
    match node {
        Node::Literal(value) => value.clone(),
        Node::Var(path) => {
            let mut current = match vars.get(&path[0]) {
                Some(value) => value.clone(),
                None => return Value::Null,
            };
            for segment in &path[1..] {
                current = match current.get(segment) {
                    Some(value) => value.clone(),
                    None => return Value::Null,
                };
            }
            current
        }
        Node::Not(inner) => Value::Bool(!is_truthy(&eval(inner, vars))),
        Node::And(left, right) => {
            let lhs = eval(left, vars);
            if !is_truthy(&lhs) {
                return Value::Bool(false);
            }
            Value::Bool(is_truthy(&eval(right, vars)))
        }
        Node::Or(left, right) => {
            let lhs = eval(left, vars);
            if is_truthy(&lhs) {
                return Value::Bool(true);
            }
            Value::Bool(is_truthy(&eval(right, vars)))
        }
        Node::Cmp(left, op, right) => {
            let lhs = eval(left, vars);
            let rhs = eval(right, vars);
            Value::Bool(compare(&lhs, *op, &rhs))
        }
    }
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq => loose_eq(lhs, rhs),
        CmpOp::Ne => !loose_eq(lhs, rhs),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => match (as_f64(lhs), as_f64(rhs)) {
            (Some(a), Some(b)) => match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                _ => unreachable!(),
            },
            _ => match (lhs.as_str(), rhs.as_str()) {
                (Some(a), Some(b)) => match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                },
                _ => false,
            },
        },
    }
}

pub(crate) fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if lhs == rhs {
        return true;
    }
    match (as_f64(lhs), as_f64(rhs)) {
        (Some(a), Some(b)) => a == b,
        // Mixed-type equality compares textual form, the way recorded flows
        // expect "3" == 3 to hold.
        _ => !lhs.is_null() && !rhs.is_null() && text_form(lhs) == text_form(rhs),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
