//! Built-in text template engine with named sub-templates.
//!
//! Syntax: `{{define "name"}}...{{end}}`, `{{template "name" .}}`,
//! `{{if cond}}...{{else if cond}}...{{else}}...{{end}}`,
//! `{{range .Items}}...{{end}}`, `{{.Field.Sub}}`, comments `{{/* */}}` and
//! `{{-`/`-}}` whitespace trimming. Functions: `eq ne lt le gt ge and or not len`.
//! Comparisons are typed: an integer never equals a float.

use super::{TemplateEngine, TemplateSet};
use crate::error::TemplateError;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

const MAX_DEPTH: usize = 64;

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("static regex"))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TextTemplateEngine;

impl TemplateEngine for TextTemplateEngine {
    fn parse(&self, source: &str) -> Result<Arc<dyn TemplateSet>, TemplateError> {
        Ok(Arc::new(TextTemplates::parse(source)?))
    }
}

/// Parsed set of named templates.
#[derive(Debug, Default)]
pub struct TextTemplates {
    defines: BTreeMap<String, Vec<Node>>,
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Output(Expr),
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    Range {
        expr: Expr,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Template {
        name: String,
        arg: Option<Expr>,
    },
}

#[derive(Debug, Clone)]
enum Expr {
    Dot(Vec<String>),
    Root(Vec<String>),
    Literal(Value),
    Call(String, Vec<Expr>),
}

#[derive(Debug)]
enum Token {
    Text(String),
    Action(String),
}

enum Terminator {
    End,
    Else,
    ElseIf(Expr),
    Eof,
}

fn lex(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut last = 0;
    let mut trim_next_text = false;
    for cap in action_re().captures_iter(source) {
        let (Some(whole), Some(inner)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let mut text = source[last..whole.start()].to_string();
        if trim_next_text {
            text = text.trim_start().to_string();
        }
        let mut body = inner.as_str();
        let trim_left = body.starts_with("- ") || body.starts_with("-\n") || body.starts_with("-\t");
        if trim_left {
            body = &body[1..];
            text = text.trim_end().to_string();
        }
        trim_next_text = body.ends_with(" -") || body.ends_with("\n-") || body.ends_with("\t-");
        if trim_next_text {
            body = &body[..body.len() - 1];
        }
        if !text.is_empty() {
            tokens.push(Token::Text(text));
        }
        tokens.push(Token::Action(body.trim().to_string()));
        last = whole.end();
    }
    let mut tail = source[last..].to_string();
    if trim_next_text {
        tail = tail.trim_start().to_string();
    }
    if !tail.is_empty() {
        tokens.push(Token::Text(tail));
    }
    tokens
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_list(&mut self) -> Result<(Vec<Node>, Terminator), TemplateError> {
        let mut nodes = Vec::new();
        while self.pos < self.tokens.len() {
            let idx = self.pos;
            self.pos += 1;
            let action = match &self.tokens[idx] {
                Token::Text(t) => {
                    nodes.push(Node::Text(t.clone()));
                    continue;
                }
                Token::Action(a) => a.clone(),
            };
            if action.starts_with("/*") {
                continue;
            }
            let (keyword, rest) = split_keyword(&action);
            match keyword {
                "end" => return Ok((nodes, Terminator::End)),
                "else" => {
                    let (k2, cond) = split_keyword(rest);
                    if k2 == "if" {
                        return Ok((nodes, Terminator::ElseIf(parse_expr(cond)?)));
                    }
                    return Ok((nodes, Terminator::Else));
                }
                "if" => nodes.push(self.parse_if(parse_expr(rest)?)?),
                "range" => {
                    let expr = parse_expr(rest)?;
                    let (body, term) = self.parse_list()?;
                    let otherwise = match term {
                        Terminator::End => Vec::new(),
                        Terminator::Else => self.expect_end()?,
                        _ => return Err(TemplateError::Parse("unterminated range".into())),
                    };
                    nodes.push(Node::Range { expr, body, otherwise });
                }
                "template" => {
                    let words = tokenize(rest)?;
                    let mut it = words.into_iter();
                    let name = match it.next() {
                        Some(Word::Str(s)) => s,
                        _ => return Err(TemplateError::Parse(format!("template needs a quoted name: {}", action))),
                    };
                    let remaining: Vec<Word> = it.collect();
                    let arg = if remaining.is_empty() {
                        None
                    } else {
                        Some(parse_command(&remaining)?)
                    };
                    nodes.push(Node::Template { name, arg });
                }
                "define" => return Err(TemplateError::Parse("define may only appear at top level".into())),
                _ => nodes.push(Node::Output(parse_expr(&action)?)),
            }
        }
        Ok((nodes, Terminator::Eof))
    }

    fn parse_if(&mut self, first: Expr) -> Result<Node, TemplateError> {
        let mut branches = Vec::new();
        let mut cond = first;
        loop {
            let (body, term) = self.parse_list()?;
            branches.push((cond, body));
            match term {
                Terminator::End => {
                    return Ok(Node::If {
                        branches,
                        otherwise: Vec::new(),
                    })
                }
                Terminator::Else => {
                    let otherwise = self.expect_end()?;
                    return Ok(Node::If { branches, otherwise });
                }
                Terminator::ElseIf(next) => cond = next,
                Terminator::Eof => return Err(TemplateError::Parse("unterminated if".into())),
            }
        }
    }

    fn expect_end(&mut self) -> Result<Vec<Node>, TemplateError> {
        match self.parse_list()? {
            (nodes, Terminator::End) => Ok(nodes),
            _ => Err(TemplateError::Parse("expected {{end}}".into())),
        }
    }
}

fn split_keyword(action: &str) -> (&str, &str) {
    match action.find(char::is_whitespace) {
        Some(i) => (&action[..i], action[i..].trim()),
        None => (action, ""),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Word {
    Str(String),
    Open,
    Close,
    Bare(String),
}

fn tokenize(src: &str) -> Result<Vec<Word>, TemplateError> {
    let mut words = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                words.push(Word::Open);
            }
            ')' => {
                chars.next();
                words.push(Word::Close);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => {
                            if let Some(esc) = chars.next() {
                                s.push(match esc {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => other,
                                });
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(TemplateError::Parse(format!("unterminated string in '{}'", src)));
                }
                words.push(Word::Str(s));
            }
            _ => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || ch == '(' || ch == ')' {
                        break;
                    }
                    s.push(ch);
                    chars.next();
                }
                words.push(Word::Bare(s));
            }
        }
    }
    Ok(words)
}

fn parse_expr(src: &str) -> Result<Expr, TemplateError> {
    let words = tokenize(src)?;
    if words.is_empty() {
        return Err(TemplateError::Parse("empty action".into()));
    }
    parse_command(&words)
}

/// A command is either a single operand or a function name followed by operands.
fn parse_command(words: &[Word]) -> Result<Expr, TemplateError> {
    let mut pos = 0;
    let head = match words.first() {
        Some(Word::Bare(name)) if is_function(name) => {
            pos = 1;
            Some(name.clone())
        }
        _ => None,
    };
    let mut operands = Vec::new();
    while pos < words.len() {
        let (expr, next) = parse_operand(words, pos)?;
        operands.push(expr);
        pos = next;
    }
    match head {
        Some(name) => Ok(Expr::Call(name, operands)),
        None if operands.len() == 1 => Ok(operands.remove(0)),
        None => Err(TemplateError::Parse("expected a function before arguments".into())),
    }
}

fn parse_operand(words: &[Word], pos: usize) -> Result<(Expr, usize), TemplateError> {
    match &words[pos] {
        Word::Open => {
            let mut depth = 1;
            let mut end = pos + 1;
            while end < words.len() {
                match words[end] {
                    Word::Open => depth += 1,
                    Word::Close => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                end += 1;
            }
            if depth != 0 {
                return Err(TemplateError::Parse("unbalanced parentheses".into()));
            }
            Ok((parse_command(&words[pos + 1..end])?, end + 1))
        }
        Word::Close => Err(TemplateError::Parse("unexpected ')'".into())),
        Word::Str(s) => Ok((Expr::Literal(Value::String(s.clone())), pos + 1)),
        Word::Bare(b) => Ok((parse_bare(b)?, pos + 1)),
    }
}

fn parse_bare(word: &str) -> Result<Expr, TemplateError> {
    if word == "." {
        return Ok(Expr::Dot(Vec::new()));
    }
    if let Some(path) = word.strip_prefix('.') {
        return Ok(Expr::Dot(path.split('.').map(str::to_string).collect()));
    }
    if word == "$" {
        return Ok(Expr::Root(Vec::new()));
    }
    if let Some(path) = word.strip_prefix("$.") {
        return Ok(Expr::Root(path.split('.').map(str::to_string).collect()));
    }
    match word {
        "true" => return Ok(Expr::Literal(Value::Bool(true))),
        "false" => return Ok(Expr::Literal(Value::Bool(false))),
        "nil" => return Ok(Expr::Literal(Value::Null)),
        _ => {}
    }
    if let Ok(i) = word.parse::<i64>() {
        return Ok(Expr::Literal(Value::Number(i.into())));
    }
    if let Some(n) = word.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return Ok(Expr::Literal(Value::Number(n)));
    }
    Err(TemplateError::Parse(format!("unexpected '{}'", word)))
}

fn is_function(name: &str) -> bool {
    matches!(name, "eq" | "ne" | "lt" | "le" | "gt" | "ge" | "and" | "or" | "not" | "len")
}

impl TextTemplates {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut parser = Parser {
            tokens: lex(source),
            pos: 0,
        };
        let mut defines = BTreeMap::new();
        while parser.pos < parser.tokens.len() {
            let idx = parser.pos;
            parser.pos += 1;
            let action = match &parser.tokens[idx] {
                Token::Text(_) => continue,
                Token::Action(a) => a.clone(),
            };
            let (keyword, rest) = split_keyword(&action);
            match keyword {
                "define" => {
                    let name = match tokenize(rest)?.as_slice() {
                        [Word::Str(s)] => s.clone(),
                        _ => return Err(TemplateError::Parse(format!("define needs a quoted name: {}", action))),
                    };
                    let body = parser.expect_end()?;
                    if defines.insert(name.clone(), body).is_some() {
                        return Err(TemplateError::Parse(format!("template '{}' defined twice", name)));
                    }
                }
                _ if action.starts_with("/*") => {}
                _ => {
                    return Err(TemplateError::Parse(format!(
                        "'{{{{{}}}}}' outside of a define block",
                        action
                    )))
                }
            }
        }
        Ok(TextTemplates { defines })
    }
}

impl TemplateSet for TextTemplates {
    fn defined_names(&self) -> Vec<String> {
        self.defines.keys().cloned().collect()
    }

    fn execute(&self, name: &str, data: &Value) -> Result<String, TemplateError> {
        let mut out = String::new();
        let mut state = ExecState {
            set: self,
            root: data,
            name,
            depth: 0,
        };
        state.call(name, data, &mut out)?;
        Ok(out)
    }
}

struct ExecState<'a> {
    set: &'a TextTemplates,
    root: &'a Value,
    name: &'a str,
    depth: usize,
}

impl<'a> ExecState<'a> {
    fn fail(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Execute {
            name: self.name.to_string(),
            message: message.into(),
        }
    }

    fn call(&mut self, name: &str, dot: &Value, out: &mut String) -> Result<(), TemplateError> {
        let body = self
            .set
            .defines
            .get(name)
            .ok_or_else(|| TemplateError::NotDefined(name.to_string()))?;
        if self.depth >= MAX_DEPTH {
            return Err(self.fail(format!("exceeded maximum template depth calling '{}'", name)));
        }
        self.depth += 1;
        let result = self.walk(body, dot, out);
        self.depth -= 1;
        result
    }

    fn walk(&mut self, nodes: &[Node], dot: &Value, out: &mut String) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Output(expr) => {
                    let v = self.eval(expr, dot)?;
                    out.push_str(&display(&v));
                }
                Node::If { branches, otherwise } => {
                    let mut taken = false;
                    for (cond, body) in branches {
                        if truthy(&self.eval(cond, dot)?) {
                            self.walk(body, dot, out)?;
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        self.walk(otherwise, dot, out)?;
                    }
                }
                Node::Range { expr, body, otherwise } => {
                    let items: Vec<Value> = match self.eval(expr, dot)? {
                        Value::Array(items) => items,
                        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                        Value::Null => Vec::new(),
                        other => return Err(self.fail(format!("range can't iterate over {}", other))),
                    };
                    if items.is_empty() {
                        self.walk(otherwise, dot, out)?;
                    }
                    for item in &items {
                        self.walk(body, item, out)?;
                    }
                }
                Node::Template { name, arg } => {
                    let next = match arg {
                        Some(e) => self.eval(e, dot)?,
                        None => Value::Null,
                    };
                    self.call(name, &next, out)?;
                }
            }
        }
        Ok(())
    }

    fn eval(&self, expr: &Expr, dot: &Value) -> Result<Value, TemplateError> {
        match expr {
            Expr::Dot(path) => Ok(walk_path(dot, path)),
            Expr::Root(path) => Ok(walk_path(self.root, path)),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Call(name, args) => {
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(self.eval(a, dot)?);
                }
                self.apply(name, vals)
            }
        }
    }

    fn apply(&self, name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
        let need = |n: usize| -> Result<(), TemplateError> {
            if args.len() < n {
                Err(self.fail(format!("wrong number of args for {}: want at least {} got {}", name, n, args.len())))
            } else {
                Ok(())
            }
        };
        match name {
            "eq" => {
                need(2)?;
                for other in &args[1..] {
                    if self.equal(&args[0], other)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            "ne" => {
                need(2)?;
                Ok(Value::Bool(!self.equal(&args[0], &args[1])?))
            }
            "lt" | "le" | "gt" | "ge" => {
                need(2)?;
                let ord = self.compare(&args[0], &args[1])?;
                Ok(Value::Bool(match name {
                    "lt" => ord.is_lt(),
                    "le" => ord.is_le(),
                    "gt" => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            "and" => {
                need(1)?;
                let mut last = Value::Null;
                for a in args {
                    if !truthy(&a) {
                        return Ok(a);
                    }
                    last = a;
                }
                Ok(last)
            }
            "or" => {
                need(1)?;
                let mut last = Value::Null;
                for a in args {
                    if truthy(&a) {
                        return Ok(a);
                    }
                    last = a;
                }
                Ok(last)
            }
            "not" => {
                need(1)?;
                Ok(Value::Bool(!truthy(&args[0])))
            }
            "len" => {
                need(1)?;
                let n = match &args[0] {
                    Value::Array(a) => a.len(),
                    Value::Object(m) => m.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Null => 0,
                    other => return Err(self.fail(format!("len of {}", other))),
                };
                Ok(Value::Number(n.into()))
            }
            other => Err(self.fail(format!("function '{}' not defined", other))),
        }
    }

    fn equal(&self, a: &Value, b: &Value) -> Result<bool, TemplateError> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let xi = x.is_i64() || x.is_u64();
                let yi = y.is_i64() || y.is_u64();
                match (xi, yi) {
                    (true, true) => Ok(x.as_i64() == y.as_i64() && x.as_u64() == y.as_u64()),
                    (false, false) => Ok(x.as_f64() == y.as_f64()),
                    _ => Err(self.fail(format!("incompatible types for comparison: {} and {}", a, b))),
                }
            }
            (Value::String(x), Value::String(y)) => Ok(x == y),
            (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
            (Value::Null, _) | (_, Value::Null) => Ok(a.is_null() && b.is_null()),
            _ => Err(self.fail(format!("incompatible types for comparison: {} and {}", a, b))),
        }
    }

    fn compare(&self, a: &Value, b: &Value) -> Result<std::cmp::Ordering, TemplateError> {
        let incompatible = || self.fail(format!("incompatible types for comparison: {} and {}", a, b));
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let xi = x.is_i64() || x.is_u64();
                let yi = y.is_i64() || y.is_u64();
                if xi != yi {
                    return Err(incompatible());
                }
                if let (Some(p), Some(q)) = (x.as_i64(), y.as_i64()) {
                    return Ok(p.cmp(&q));
                }
                x.as_f64()
                    .zip(y.as_f64())
                    .and_then(|(p, q)| p.partial_cmp(&q))
                    .ok_or_else(incompatible)
            }
            (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
            _ => Err(incompatible()),
        }
    }
}

fn walk_path(start: &Value, path: &[String]) -> Value {
    let mut cur = start;
    for key in path {
        match cur.get(key.as_str()) {
            Some(v) => cur = v,
            None => return Value::Null,
        }
    }
    cur.clone()
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGINATE: &str = r#"
    {{define "PaginateWhere"}}{{if .Key}} and key = :Key{{end}}{{end}}
    {{define "PaginateTotal"}}select count(*) as count from component where 1=1 {{template "PaginateWhere" .}} and deleted_at is null;{{end}}
    {{define "Paginate"}}select * from component where 1=1 {{template "PaginateWhere" .}} and deleted_at is null order by updated_at desc limit :Offset, :Limit;{{end}}
    "#;

    #[test]
    fn lists_defined_names_sorted() {
        let set = TextTemplates::parse(PAGINATE).unwrap();
        assert_eq!(set.defined_names(), vec!["Paginate", "PaginateTotal", "PaginateWhere"]);
    }

    #[test]
    fn executes_nested_template_calls() {
        let set = TextTemplates::parse(PAGINATE).unwrap();
        let out = set.execute("PaginateTotal", &json!({"Key": "pay"})).unwrap();
        assert_eq!(
            out,
            "select count(*) as count from component where 1=1  and key = :Key and deleted_at is null;"
        );
    }

    #[test]
    fn integer_equality_is_typed() {
        let set = TextTemplates::parse(r#"{{define "s"}}{{if eq .Status 1}}on{{else}}off{{end}}{{end}}"#).unwrap();
        assert_eq!(set.execute("s", &json!({"Status": 1})).unwrap(), "on");
        assert_eq!(set.execute("s", &json!({"Status": 2})).unwrap(), "off");
        assert!(matches!(
            set.execute("s", &json!({"Status": 1.0})),
            Err(TemplateError::Execute { .. })
        ));
    }

    #[test]
    fn else_if_range_and_trim_markers() {
        let src = r#"{{define "t"}}
            {{- range .Ids -}} [{{.}}] {{- end}}
            {{- if gt (len .Ids) 2 }} many{{else if .Ids}} few{{else}} none{{end}}{{end}}"#;
        let set = TextTemplates::parse(src).unwrap();
        assert_eq!(set.execute("t", &json!({"Ids": [1, 2, 3]})).unwrap(), "[1][2][3] many");
        assert_eq!(set.execute("t", &json!({"Ids": [7]})).unwrap(), "[7] few");
        assert_eq!(set.execute("t", &json!({"Ids": []})).unwrap(), " none");
    }

    #[test]
    fn parse_errors() {
        assert!(TextTemplates::parse(r#"{{define "a"}}{{if .X}}x{{end}}"#).is_err());
        assert!(TextTemplates::parse(r#"{{define "a"}}{{end}}{{define "a"}}{{end}}"#).is_err());
        assert!(TextTemplates::parse(r#"select {{.X}}"#).is_err());
    }

    #[test]
    fn undefined_template_is_reported() {
        let set = TextTemplates::parse(r#"{{define "a"}}{{template "b" .}}{{end}}"#).unwrap();
        assert_eq!(set.execute("a", &json!({})), Err(TemplateError::NotDefined("b".into())));
    }
}
