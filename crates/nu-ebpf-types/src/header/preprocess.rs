//! Preprocessor for header units
//!
//! Handles what type definitions in tracing scripts actually use:
//! object-like and function-like macros, conditional blocks and includes of
//! the built-in headers. Stringification and token pasting are not
//! supported.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::builtins::{PREDEFINED, builtin_header};
use super::lexer::{Token, TokenKind, tokenize};
use super::parser::eval_condition;
use crate::error::Diagnostic;

const MAX_INCLUDE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
struct Macro {
    /// `None` for object-like macros
    params: Option<Vec<String>>,
    body: Vec<Token>,
}

/// Result of preprocessing one unit
#[derive(Debug, Default)]
pub struct Preprocessed {
    pub tokens: Vec<Token>,
    /// Macros defined by the unit itself, name to replacement text
    pub macros: BTreeMap<String, String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// One `#if` level
struct Conditional {
    /// Tokens in the current branch are kept
    active: bool,
    /// Some branch of this level was already taken
    taken: bool,
    parent_active: bool,
    seen_else: bool,
    opened_at: Token,
}

struct Preprocessor {
    main_file: Arc<str>,
    macros: HashMap<String, Macro>,
    recorded: BTreeMap<String, String>,
    diagnostics: Vec<Diagnostic>,
    output: Vec<Token>,
    depth: usize,
}

/// Run the preprocessor over `text`, attributing locations to `unit`
pub fn preprocess(unit: &Arc<str>, text: &str) -> Preprocessed {
    let mut pp = Preprocessor {
        main_file: unit.clone(),
        macros: HashMap::new(),
        recorded: BTreeMap::new(),
        diagnostics: Vec::new(),
        output: Vec::new(),
        depth: 0,
    };

    let builtin: Arc<str> = Arc::from("<built-in>");
    pp.run_text(&builtin, PREDEFINED);
    pp.run_text(unit, text);

    Preprocessed {
        tokens: pp.output,
        macros: pp.recorded,
        diagnostics: pp.diagnostics,
    }
}

/// Render tokens back to text, keeping single spaces where there were any
fn spell(tokens: &[Token]) -> String {
    let mut text = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 && token.space_before {
            text.push(' ');
        }
        text.push_str(&token.text);
    }
    text
}

/// Arguments of a function-like macro call whose `(` is at `open`.
/// Returns the arguments and the index just past the closing `)`.
fn collect_args(tokens: &[Token], open: usize) -> Option<(Vec<Vec<Token>>, usize)> {
    let mut args = vec![Vec::new()];
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open + 1) {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            if depth == 0 {
                return Some((args, i + 1));
            }
            depth -= 1;
        } else if token.is_punct(",") && depth == 0 {
            args.push(Vec::new());
            continue;
        }
        args.last_mut()?.push(token.clone());
    }
    None
}

impl Preprocessor {
    fn run_text(&mut self, file: &Arc<str>, text: &str) {
        match tokenize(file, text) {
            Ok(tokens) => self.process(&tokens),
            Err(diagnostic) => self.diagnostics.push(diagnostic),
        }
    }

    fn process(&mut self, tokens: &[Token]) {
        let mut conditionals: Vec<Conditional> = Vec::new();
        let mut pending = Vec::new();

        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            if token.line_start && token.is_punct("#") {
                let end = (i + 1..tokens.len())
                    .find(|&j| tokens[j].line_start)
                    .unwrap_or(tokens.len());
                self.flush(&mut pending);
                self.directive(&tokens[i + 1..end], &mut conditionals);
                i = end;
                continue;
            }
            if conditionals.last().is_none_or(|c| c.active) {
                pending.push(token.clone());
            }
            i += 1;
        }
        self.flush(&mut pending);

        for open in conditionals {
            self.error(&open.opened_at, "unterminated conditional directive");
        }
    }

    fn flush(&mut self, pending: &mut Vec<Token>) {
        if pending.is_empty() {
            return;
        }
        let expanded = self.expand(pending, &mut Vec::new());
        self.output.extend(expanded);
        pending.clear();
    }

    fn error(&mut self, at: &Token, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(at.location(), message));
    }

    fn directive(&mut self, line: &[Token], conditionals: &mut Vec<Conditional>) {
        // A lone `#` is a null directive
        let Some(name) = line.first() else {
            return;
        };
        let live = conditionals.last().is_none_or(|c| c.active);

        match name.text.as_str() {
            "if" | "ifdef" | "ifndef" => {
                let value = live
                    && match name.text.as_str() {
                        "ifdef" => self.is_defined(line.get(1)),
                        "ifndef" => !self.is_defined(line.get(1)),
                        _ => self.condition(name, &line[1..]),
                    };
                conditionals.push(Conditional {
                    active: value,
                    taken: value,
                    parent_active: live,
                    seen_else: false,
                    opened_at: name.clone(),
                });
            }
            "elif" => {
                let Some(level) = conditionals.last_mut() else {
                    self.error(name, "#elif without #if");
                    return;
                };
                if level.seen_else {
                    self.error(name, "#elif after #else");
                    return;
                }
                if level.parent_active && !level.taken {
                    let value = self.condition(name, &line[1..]);
                    level.active = value;
                    level.taken = value;
                } else {
                    level.active = false;
                }
            }
            "else" => {
                let Some(level) = conditionals.last_mut() else {
                    self.error(name, "#else without #if");
                    return;
                };
                if level.seen_else {
                    self.error(name, "#else after #else");
                    return;
                }
                level.seen_else = true;
                level.active = level.parent_active && !level.taken;
                level.taken = true;
            }
            "endif" => {
                if conditionals.pop().is_none() {
                    self.error(name, "#endif without #if");
                }
            }
            _ if !live => {}
            "define" => self.define(name, &line[1..]),
            "undef" => match line.get(1) {
                Some(macro_name) if macro_name.kind == TokenKind::Ident => {
                    self.macros.remove(&macro_name.text);
                }
                _ => self.error(name, "macro name must be an identifier"),
            },
            "include" => self.include(name, &line[1..]),
            "error" => {
                let message = format!("#error {}", spell(&line[1..]));
                self.error(name, message);
            }
            "pragma" | "ident" | "line" | "warning" => {}
            other => {
                let message = format!("invalid preprocessing directive '#{other}'");
                self.error(name, message);
            }
        }
    }

    fn is_defined(&self, name: Option<&Token>) -> bool {
        name.is_some_and(|t| self.macros.contains_key(&t.text))
    }

    fn define(&mut self, directive: &Token, rest: &[Token]) {
        let Some(name) = rest.first().filter(|t| t.kind == TokenKind::Ident) else {
            self.error(directive, "macro name must be an identifier");
            return;
        };

        let mut body_start = 1;
        let mut params = None;
        if rest.get(1).is_some_and(|t| t.is_punct("(") && !t.space_before) {
            let mut names = Vec::new();
            let mut j = 2;
            loop {
                match rest.get(j) {
                    Some(t) if t.is_punct(")") => break,
                    Some(t) if t.kind == TokenKind::Ident => names.push(t.text.clone()),
                    Some(t) if t.is_punct("...") => names.push("__VA_ARGS__".to_string()),
                    Some(t) if t.is_punct(",") => {}
                    _ => {
                        self.error(name, "expected ')' in macro parameter list");
                        return;
                    }
                }
                j += 1;
            }
            params = Some(names);
            body_start = j + 1;
        }

        let body = rest[body_start..].to_vec();
        if name.file == self.main_file {
            self.recorded.insert(name.text.clone(), spell(&body));
        }
        self.macros.insert(name.text.clone(), Macro { params, body });
    }

    fn include(&mut self, directive: &Token, rest: &[Token]) {
        let header = match rest.first() {
            Some(t) if t.is_punct("<") => {
                let close = rest.iter().position(|t| t.is_punct(">"));
                close.map(|end| rest[1..end].iter().map(|t| t.text.as_str()).collect::<String>())
            }
            Some(t) if t.kind == TokenKind::Str => Some(t.text.trim_matches('"').to_string()),
            _ => None,
        };
        let Some(header) = header else {
            self.error(directive, "expected \"FILENAME\" or <FILENAME>");
            return;
        };
        let Some(text) = builtin_header(&header) else {
            self.error(directive, format!("'{header}' file not found"));
            return;
        };
        if self.depth >= MAX_INCLUDE_DEPTH {
            self.error(directive, "#include nested too deeply");
            return;
        }

        self.depth += 1;
        let file: Arc<str> = Arc::from(header.as_str());
        self.run_text(&file, text);
        self.depth -= 1;
    }

    /// Evaluate an `#if`/`#elif` expression
    fn condition(&mut self, directive: &Token, tokens: &[Token]) -> bool {
        let mut resolved = Vec::with_capacity(tokens.len());
        let mut j = 0;
        while j < tokens.len() {
            let token = &tokens[j];
            if !token.is_ident("defined") {
                resolved.push(token.clone());
                j += 1;
                continue;
            }
            let parenthesized = tokens.get(j + 1).is_some_and(|t| t.is_punct("("));
            let name_at = if parenthesized { j + 2 } else { j + 1 };
            let Some(name) = tokens.get(name_at).filter(|t| t.kind == TokenKind::Ident) else {
                self.error(token, "macro name missing after 'defined'");
                return false;
            };
            if parenthesized && !tokens.get(name_at + 1).is_some_and(|t| t.is_punct(")")) {
                self.error(name, "missing ')' after 'defined'");
                return false;
            }
            resolved.push(Token::int_at(self.macros.contains_key(&name.text) as u64, token));
            j = name_at + if parenthesized { 2 } else { 1 };
        }

        // Identifiers left after expansion evaluate to 0
        let expanded = self
            .expand(&resolved, &mut Vec::new())
            .into_iter()
            .map(|t| if t.kind == TokenKind::Ident { Token::int_at(0, &t) } else { t })
            .collect();

        match eval_condition(expanded, directive) {
            Ok(value) => value != 0,
            Err(diagnostic) => {
                self.diagnostics.push(diagnostic);
                false
            }
        }
    }

    /// Macro-expand `tokens`. Names in `hiding` are being expanded already
    /// and are left alone.
    fn expand(&mut self, tokens: &[Token], hiding: &mut Vec<String>) -> Vec<Token> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            i += 1;
            if token.kind != TokenKind::Ident || hiding.contains(&token.text) {
                out.push(token.clone());
                continue;
            }
            let Some(mac) = self.macros.get(&token.text).cloned() else {
                out.push(token.clone());
                continue;
            };

            let replacement: Vec<Token> = match &mac.params {
                None => mac.body.iter().map(|t| t.relocated(token)).collect(),
                Some(params) => {
                    // A function-like macro name without arguments is left as is
                    if !tokens.get(i).is_some_and(|t| t.is_punct("(")) {
                        out.push(token.clone());
                        continue;
                    }
                    let Some((args, end)) = collect_args(tokens, i) else {
                        self.error(token, "unterminated function-like macro invocation");
                        out.push(token.clone());
                        continue;
                    };
                    i = end;
                    substitute(&mac.body, params, &args, token)
                }
            };

            hiding.push(token.text.clone());
            let expanded = self.expand(&replacement, hiding);
            hiding.pop();
            out.extend(expanded);
        }
        out
    }
}

/// Replace parameter names in `body` with the call's arguments
fn substitute(body: &[Token], params: &[String], args: &[Vec<Token>], site: &Token) -> Vec<Token> {
    let mut out = Vec::new();
    for token in body {
        let position = (token.kind == TokenKind::Ident)
            .then(|| params.iter().position(|p| *p == token.text))
            .flatten();
        match position {
            Some(k) if params[k] == "__VA_ARGS__" => {
                for (n, arg) in args.iter().enumerate().skip(k) {
                    if n > k {
                        let mut comma = token.relocated(site);
                        comma.kind = TokenKind::Punct(",");
                        comma.text = ",".to_string();
                        out.push(comma);
                    }
                    out.extend(arg.iter().map(|t| t.relocated(site)));
                }
            }
            Some(k) => {
                if let Some(arg) = args.get(k) {
                    out.extend(arg.iter().map(|t| t.relocated(site)));
                }
            }
            None => out.push(token.relocated(site)),
        }
    }
    out
}
