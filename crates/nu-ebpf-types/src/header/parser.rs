//! Declaration parser for header units
//!
//! Recursive descent over preprocessed tokens. Only what affects record
//! layout is kept: record and enum definitions, typedefs and the types of
//! members. Function bodies and initializers are skipped.

use std::collections::HashMap;

use super::layout::{CType, MemberDef, NoSize, RecordDef, RecordId, layout_record, size_align};
use super::lexer::{Token, TokenKind};
use crate::error::{Diagnostic, SourceLocation};
use crate::types::RecordKind;

type ParseResult<T> = Result<T, Diagnostic>;

/// Supplies typedefs the unit uses without defining them
pub trait TypedefFallback {
    fn typedef(&self, name: &str) -> Option<CType>;
}

/// Everything a unit declared
#[derive(Debug, Default)]
pub struct Unit {
    pub records: Vec<RecordDef>,
}

const STORAGE_WORDS: &[&str] = &[
    "typedef",
    "extern",
    "static",
    "auto",
    "register",
    "inline",
    "__inline",
    "__inline__",
    "_Noreturn",
    "_Thread_local",
    "__thread",
    "__extension__",
];

const QUALIFIER_WORDS: &[&str] = &[
    "const",
    "volatile",
    "restrict",
    "__restrict",
    "__restrict__",
    "__const",
    "__const__",
    "__volatile",
    "__volatile__",
    "_Atomic",
];

const TYPE_WORDS: &[&str] = &[
    "void",
    "char",
    "short",
    "int",
    "long",
    "signed",
    "__signed",
    "__signed__",
    "unsigned",
    "_Bool",
    "float",
    "double",
    "__int128",
    "struct",
    "union",
    "enum",
];

fn is_keyword(name: &str) -> bool {
    STORAGE_WORDS.contains(&name)
        || QUALIFIER_WORDS.contains(&name)
        || TYPE_WORDS.contains(&name)
        || matches!(
            name,
            "__attribute__" | "__attribute" | "_Alignas" | "sizeof" | "__asm__" | "asm"
        )
}

/// Base type words seen in one specifier list
#[derive(Default)]
struct BaseWords {
    void: bool,
    bool_: bool,
    char_: bool,
    short: bool,
    int: bool,
    long: u8,
    signed: bool,
    unsigned: bool,
    float: bool,
    double: bool,
    int128: bool,
}

impl BaseWords {
    fn any(&self) -> bool {
        self.void
            || self.bool_
            || self.char_
            || self.short
            || self.int
            || self.long > 0
            || self.signed
            || self.unsigned
            || self.float
            || self.double
            || self.int128
    }

    fn resolve(&self) -> Option<CType> {
        let signed = !self.unsigned;
        let ty = if self.void {
            CType::Void
        } else if self.bool_ {
            CType::Bool
        } else if self.float {
            CType::Float(4)
        } else if self.double {
            CType::Float(if self.long > 0 { 16 } else { 8 })
        } else if self.char_ {
            CType::Int { size: 1, signed }
        } else if self.int128 {
            CType::Int { size: 16, signed }
        } else if self.short {
            CType::Int { size: 2, signed }
        } else if self.long > 0 {
            CType::Int { size: 8, signed }
        } else if self.int || self.signed || self.unsigned {
            CType::Int { size: 4, signed }
        } else {
            return None;
        };
        Some(ty)
    }
}

/// A parsed declaration-specifier list
struct Specifiers {
    ty: CType,
    is_typedef: bool,
    /// Record whose body was part of the specifiers
    defined_record: Option<RecordId>,
    align: Option<usize>,
}

#[derive(Default)]
struct Attributes {
    packed: bool,
    align: Option<usize>,
}

impl Attributes {
    fn merge(&mut self, other: Attributes) {
        self.packed |= other.packed;
        self.align = match (self.align, other.align) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Type derivations of a declarator, innermost first
enum Derive {
    Pointer,
    Array(Option<usize>),
    Function,
}

struct Declarator {
    name: Option<Token>,
    ty: CType,
    attributes: Attributes,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    end: SourceLocation,
    records: Vec<RecordDef>,
    tags: HashMap<(RecordKind, String), RecordId>,
    typedefs: HashMap<String, CType>,
    enum_constants: HashMap<String, i64>,
    /// Records whose bodies are being parsed
    enclosing: Vec<RecordId>,
    fallback: Option<&'a dyn TypedefFallback>,
}

/// Parse a preprocessed unit. Stops at the first error.
pub fn parse_unit(tokens: Vec<Token>, fallback: Option<&dyn TypedefFallback>) -> ParseResult<Unit> {
    let end = tokens
        .last()
        .map(|t| SourceLocation::new(t.file.as_ref(), t.line, t.column + t.text.len()))
        .unwrap_or_default();
    let mut parser = Parser::new(tokens, end, fallback);
    while parser.peek().is_some() {
        parser.external_declaration()?;
    }
    Ok(Unit {
        records: parser.records,
    })
}

/// Evaluate a preprocessor condition whose identifiers were already
/// replaced by numbers
pub fn eval_condition(tokens: Vec<Token>, site: &Token) -> ParseResult<i64> {
    let mut parser = Parser::new(tokens, site.location(), None);
    let value = parser.const_expr()?;
    if let Some(extra) = parser.peek() {
        return Err(Diagnostic::new(
            extra.location(),
            "token is not a valid binary operator in a preprocessor subexpression",
        ));
    }
    Ok(value)
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, end: SourceLocation, fallback: Option<&'a dyn TypedefFallback>) -> Self {
        Self {
            tokens,
            pos: 0,
            end,
            records: Vec::new(),
            tags: HashMap::new(),
            typedefs: HashMap::new(),
            enum_constants: HashMap::new(),
            enclosing: Vec::new(),
            fallback,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn bump(&mut self) -> ParseResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error_here("unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn at_punct(&self, p: &str) -> bool {
        self.peek().is_some_and(|t| t.is_punct(p))
    }

    fn at_ident(&self, name: &str) -> bool {
        self.peek().is_some_and(|t| t.is_ident(name))
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> ParseResult<Token> {
        if self.at_punct(p) {
            self.bump()
        } else {
            Err(self.error_here(format!("expected '{p}'")))
        }
    }

    /// Location of the current token
    fn here(&self) -> SourceLocation {
        self.peek().map_or_else(|| self.end.clone(), Token::location)
    }

    fn error_here(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(self.here(), message)
    }

    /// Skip a parenthesized or braced group starting at the current token
    fn skip_balanced(&mut self) -> ParseResult<()> {
        let mut depth = 0usize;
        loop {
            let token = self.bump()?;
            match token.kind {
                TokenKind::Punct("(" | "[" | "{") => depth += 1,
                TokenKind::Punct(")" | "]" | "}") => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    fn is_type_start(&self, token: Option<&Token>) -> bool {
        token.is_some_and(|t| {
            t.kind == TokenKind::Ident
                && (TYPE_WORDS.contains(&t.text.as_str())
                    || QUALIFIER_WORDS.contains(&t.text.as_str())
                    || matches!(t.text.as_str(), "__attribute__" | "__attribute" | "_Alignas")
                    || self.typedefs.contains_key(&t.text))
        })
    }

    fn external_declaration(&mut self) -> ParseResult<()> {
        if self.eat_punct(";") {
            return Ok(());
        }
        let Some(specs) = self.specifiers()? else {
            return Err(self.error_here("expected declaration"));
        };
        if self.declares_nothing(&specs) {
            // A missing ';' after a record definition is tolerated
            if !self.eat_punct(";") && specs.defined_record.is_none() {
                return Err(self.error_here("expected ';' after declaration"));
            }
            return Ok(());
        }

        loop {
            let declarator = self.declarator(specs.ty.clone())?;
            if declarator.ty == CType::Function && self.at_punct("{") {
                return self.skip_balanced();
            }
            if specs.is_typedef {
                let Some(name) = declarator.name else {
                    return Err(self.error_here("typedef requires a name"));
                };
                if let CType::Record(id) = declarator.ty {
                    let record = &mut self.records[id];
                    if record.tag.is_none() && record.typedef_name.is_none() {
                        record.typedef_name = Some(name.text.clone());
                    }
                }
                self.typedefs.insert(name.text, declarator.ty);
            }
            if self.eat_punct("=") {
                self.skip_initializer()?;
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(";").map(|_| ())
    }

    /// Whether a specifier list stands alone, as in `struct Foo { ... };`
    fn declares_nothing(&self, specs: &Specifiers) -> bool {
        match self.peek() {
            None => true,
            Some(t) if t.is_punct(";") || t.is_punct("}") => true,
            Some(_) => specs.defined_record.is_some() && !self.at_declarator_start(),
        }
    }

    fn at_declarator_start(&self) -> bool {
        self.peek().is_some_and(|t| match t.kind {
            TokenKind::Punct(p) => matches!(p, "*" | "(" | ":"),
            TokenKind::Ident => !is_keyword(&t.text) || t.text.starts_with("__attribute"),
            _ => false,
        })
    }

    fn skip_initializer(&mut self) -> ParseResult<()> {
        while let Some(token) = self.peek() {
            if token.is_punct(",") || token.is_punct(";") {
                return Ok(());
            }
            if token.is_punct("{") || token.is_punct("(") || token.is_punct("[") {
                self.skip_balanced()?;
            } else {
                self.pos += 1;
            }
        }
        Ok(())
    }

    fn specifiers(&mut self) -> ParseResult<Option<Specifiers>> {
        let mut words = BaseWords::default();
        let mut named: Option<CType> = None;
        let mut is_typedef = false;
        let mut defined_record = None;
        let mut attributes = Attributes::default();
        let mut consumed = false;

        while let Some(token) = self.peek() {
            if token.kind != TokenKind::Ident {
                break;
            }
            let word = token.text.clone();
            match word.as_str() {
                "typedef" => {
                    is_typedef = true;
                    self.pos += 1;
                }
                w if STORAGE_WORDS.contains(&w) || QUALIFIER_WORDS.contains(&w) => self.pos += 1,
                "__attribute__" | "__attribute" => {
                    let parsed = self.attributes()?;
                    attributes.merge(parsed);
                }
                "_Alignas" => {
                    self.pos += 1;
                    self.expect_punct("(")?;
                    let align = if self.is_type_start(self.peek()) {
                        let ty = self.type_name()?;
                        size_align(&ty, &self.records).map_or(1, |(_, a)| a)
                    } else {
                        self.const_expr()? as usize
                    };
                    self.expect_punct(")")?;
                    attributes.merge(Attributes {
                        packed: false,
                        align: Some(align),
                    });
                }
                "void" => {
                    words.void = true;
                    self.pos += 1;
                }
                "_Bool" => {
                    words.bool_ = true;
                    self.pos += 1;
                }
                "char" => {
                    words.char_ = true;
                    self.pos += 1;
                }
                "short" => {
                    words.short = true;
                    self.pos += 1;
                }
                "int" => {
                    words.int = true;
                    self.pos += 1;
                }
                "long" => {
                    words.long += 1;
                    self.pos += 1;
                }
                "signed" | "__signed" | "__signed__" => {
                    words.signed = true;
                    self.pos += 1;
                }
                "unsigned" => {
                    words.unsigned = true;
                    self.pos += 1;
                }
                "float" => {
                    words.float = true;
                    self.pos += 1;
                }
                "double" => {
                    words.double = true;
                    self.pos += 1;
                }
                "__int128" => {
                    words.int128 = true;
                    self.pos += 1;
                }
                "struct" | "union" | "enum" if named.is_some() || words.any() => break,
                "struct" | "union" => {
                    let kind = if word == "struct" {
                        RecordKind::Struct
                    } else {
                        RecordKind::Union
                    };
                    let (ty, defined) = self.record_specifier(kind)?;
                    self.set_named(&mut named, &words, ty)?;
                    if defined.is_some() {
                        defined_record = defined;
                    }
                }
                "enum" => {
                    let ty = self.enum_specifier()?;
                    self.set_named(&mut named, &words, ty)?;
                }
                _ => {
                    if named.is_some() || words.any() {
                        break;
                    }
                    if let Some(ty) = self.typedefs.get(&word).cloned() {
                        self.pos += 1;
                        named = Some(ty);
                    } else if self.peek_at(1).is_some_and(|t| {
                        (t.kind == TokenKind::Ident && !is_keyword(&t.text)) || t.is_punct("*")
                    }) {
                        let ty = self.fallback_typedef(&word)?;
                        self.pos += 1;
                        named = Some(ty);
                    } else {
                        break;
                    }
                }
            }
            consumed = true;
        }

        if !consumed {
            return Ok(None);
        }
        let ty = match named {
            Some(ty) => ty,
            None => words
                .resolve()
                .ok_or_else(|| self.error_here("type specifier missing"))?,
        };
        Ok(Some(Specifiers {
            ty,
            is_typedef,
            defined_record,
            align: attributes.align,
        }))
    }

    fn set_named(&self, named: &mut Option<CType>, words: &BaseWords, ty: CType) -> ParseResult<()> {
        if named.is_some() || words.any() {
            return Err(self.error_here("cannot combine with previous declaration specifier"));
        }
        *named = Some(ty);
        Ok(())
    }

    /// A type name the unit never defined
    fn fallback_typedef(&mut self, name: &str) -> ParseResult<CType> {
        let found = self.fallback.and_then(|f| f.typedef(name));
        match found {
            Some(ty) => {
                self.typedefs.insert(name.to_string(), ty.clone());
                Ok(ty)
            }
            None => Err(self.error_here(format!("unknown type name '{name}'"))),
        }
    }

    fn attributes(&mut self) -> ParseResult<Attributes> {
        let mut attributes = Attributes::default();
        while self.at_ident("__attribute__") || self.at_ident("__attribute") {
            self.pos += 1;
            self.expect_punct("(")?;
            self.expect_punct("(")?;
            while !self.at_punct(")") {
                let name = self.bump()?;
                match name.text.trim_matches('_') {
                    "packed" => attributes.packed = true,
                    "aligned" => {
                        let align = if self.eat_punct("(") {
                            let value = self.const_expr()?;
                            self.expect_punct(")")?;
                            if value <= 0 || (value & (value - 1)) != 0 {
                                return Err(Diagnostic::new(
                                    name.location(),
                                    "requested alignment is not a power of 2",
                                ));
                            }
                            value as usize
                        } else {
                            16
                        };
                        attributes.merge(Attributes {
                            packed: false,
                            align: Some(align),
                        });
                    }
                    _ => {
                        if self.at_punct("(") {
                            self.skip_balanced()?;
                        }
                    }
                }
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct(")")?;
            self.expect_punct(")")?;
        }
        Ok(attributes)
    }

    fn record_specifier(&mut self, kind: RecordKind) -> ParseResult<(CType, Option<RecordId>)> {
        let keyword = self.bump()?;
        let mut attributes = self.attributes()?;
        let tag = match self.peek() {
            Some(t) if t.kind == TokenKind::Ident && !is_keyword(&t.text) => Some(self.bump()?.text),
            _ => None,
        };

        if !self.at_punct("{") {
            let Some(tag) = tag else {
                return Err(self.error_here(format!("declaration of anonymous {kind} must be a definition")));
            };
            let id = self.tagged_record(kind, &tag, &keyword);
            return Ok((CType::Record(id), None));
        }

        let id = match &tag {
            Some(tag) => {
                let id = self.tagged_record(kind, tag, &keyword);
                if self.records[id].layout.is_some() {
                    return Err(Diagnostic::new(keyword.location(), format!("redefinition of '{kind} {tag}'")));
                }
                id
            }
            None => {
                self.records.push(RecordDef::new(kind, None, keyword.location()));
                self.records.len() - 1
            }
        };
        self.records[id].location = keyword.location();
        self.records[id].enclosing = self.enclosing.last().copied();

        self.pos += 1; // {
        self.enclosing.push(id);
        let members = self.record_body();
        self.enclosing.pop();
        let members = members?;
        attributes.merge(self.attributes()?);

        let record = &mut self.records[id];
        record.members = members;
        record.packed = attributes.packed;
        record.align = attributes.align;

        let layout = layout_record(&self.records[id], &self.records).map_err(|e| {
            Diagnostic::new(self.records[id].members[e.member].location.clone(), e.message)
        })?;
        self.records[id].layout = Some(layout);
        Ok((CType::Record(id), Some(id)))
    }

    /// Look up a tag, declaring it if this is the first mention
    fn tagged_record(&mut self, kind: RecordKind, tag: &str, at: &Token) -> RecordId {
        if let Some(&id) = self.tags.get(&(kind, tag.to_string())) {
            return id;
        }
        self.records.push(RecordDef::new(kind, Some(tag.to_string()), at.location()));
        let id = self.records.len() - 1;
        self.tags.insert((kind, tag.to_string()), id);
        id
    }

    /// Members up to and including the closing brace
    fn record_body(&mut self) -> ParseResult<Vec<MemberDef>> {
        let mut members = Vec::new();
        loop {
            if self.eat_punct("}") {
                return Ok(members);
            }
            if self.peek().is_none() {
                return Err(self.error_here("expected '}'"));
            }
            if self.eat_punct(";") {
                continue;
            }

            let location = self.here();
            let Some(specs) = self.specifiers()? else {
                return Err(self.error_here("type name requires a specifier or qualifier"));
            };

            if self.declares_nothing(&specs) {
                // An untagged record without a member name is anonymous:
                // its members belong to the enclosing record
                if let (Some(id), CType::Record(ty_id)) = (specs.defined_record, &specs.ty) {
                    if id == *ty_id && self.records[id].tag.is_none() {
                        members.push(MemberDef {
                            name: None,
                            ty: specs.ty.clone(),
                            bit_width: None,
                            align: specs.align,
                            location,
                        });
                    }
                }
                self.eat_punct(";");
                continue;
            }

            loop {
                let member_location = self.here();
                let mut member = if self.at_punct(":") {
                    MemberDef {
                        name: None,
                        ty: specs.ty.clone(),
                        bit_width: None,
                        align: specs.align,
                        location: member_location,
                    }
                } else {
                    let declarator = self.declarator(specs.ty.clone())?;
                    let Some(name) = declarator.name else {
                        return Err(self.error_here("expected member name or ';' after declaration specifiers"));
                    };
                    let align = match (specs.align, declarator.attributes.align) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        (a, b) => a.or(b),
                    };
                    MemberDef {
                        name: Some(name.text.clone()),
                        ty: declarator.ty,
                        bit_width: None,
                        align,
                        location: name.location(),
                    }
                };
                if self.eat_punct(":") {
                    let width = self.const_expr()?;
                    if width < 0 {
                        return Err(self.error_here("bit-field has negative width"));
                    }
                    member.bit_width = Some(width as usize);
                    let trailing = self.attributes()?;
                    if let Some(align) = trailing.align {
                        member.align = Some(member.align.map_or(align, |a| a.max(align)));
                    }
                }
                members.push(member);
                if !self.eat_punct(",") {
                    break;
                }
            }

            // A missing ';' before '}' is tolerated
            if !self.eat_punct(";") && !self.at_punct("}") {
                return Err(self.error_here("expected ';' at end of declaration list"));
            }
        }
    }

    fn enum_specifier(&mut self) -> ParseResult<CType> {
        self.pos += 1; // enum
        self.attributes()?;
        let tag = match self.peek() {
            Some(t) if t.kind == TokenKind::Ident && !is_keyword(&t.text) => Some(self.bump()?),
            _ => None,
        };
        if !self.eat_punct("{") {
            if tag.is_none() {
                return Err(self.error_here("declaration of anonymous enum must be a definition"));
            }
            return Ok(CType::Enum);
        }

        let mut next = 0i64;
        while !self.eat_punct("}") {
            let name = self.bump()?;
            if name.kind != TokenKind::Ident {
                return Err(Diagnostic::new(name.location(), "expected identifier"));
            }
            let value = if self.eat_punct("=") { self.const_expr()? } else { next };
            self.enum_constants.insert(name.text, value);
            next = value.wrapping_add(1);
            if !self.eat_punct(",") {
                self.expect_punct("}")?;
                break;
            }
        }
        self.attributes()?;
        Ok(CType::Enum)
    }

    fn declarator(&mut self, base: CType) -> ParseResult<Declarator> {
        let mut attributes = Attributes::default();
        let (name, derives) = self.declarator_parts(&mut attributes)?;
        let ty = derives.into_iter().fold(base, |ty, derive| match derive {
            Derive::Pointer => CType::Pointer(Box::new(ty)),
            Derive::Array(count) => CType::Array(Box::new(ty), count),
            Derive::Function => CType::Function,
        });
        Ok(Declarator {
            name,
            ty,
            attributes,
        })
    }

    /// Whether a `(` after the pointer part opens a nested declarator
    /// rather than a parameter list
    fn paren_opens_declarator(&self) -> bool {
        match self.peek_at(1) {
            Some(t) if t.is_punct("*") || t.is_punct("(") => true,
            Some(t) if t.kind == TokenKind::Ident => {
                !self.is_type_start(Some(t)) && !is_keyword(&t.text)
            }
            _ => false,
        }
    }

    fn declarator_parts(&mut self, attributes: &mut Attributes) -> ParseResult<(Option<Token>, Vec<Derive>)> {
        let mut pointers = 0;
        loop {
            if self.eat_punct("*") {
                pointers += 1;
            } else if self.peek().is_some_and(|t| QUALIFIER_WORDS.contains(&t.text.as_str())) {
                self.pos += 1;
            } else if self.at_ident("__attribute__") || self.at_ident("__attribute") {
                let parsed = self.attributes()?;
                attributes.merge(parsed);
            } else {
                break;
            }
        }

        let (name, inner) = if self.at_punct("(") && self.paren_opens_declarator() {
            self.pos += 1;
            let parts = self.declarator_parts(attributes)?;
            self.expect_punct(")")?;
            parts
        } else {
            match self.peek() {
                Some(t) if t.kind == TokenKind::Ident && !is_keyword(&t.text) => (Some(self.bump()?), Vec::new()),
                _ => (None, Vec::new()),
            }
        };

        let mut suffixes = Vec::new();
        loop {
            if self.eat_punct("[") {
                while self
                    .peek()
                    .is_some_and(|t| t.is_ident("static") || QUALIFIER_WORDS.contains(&t.text.as_str()))
                {
                    self.pos += 1;
                }
                if self.eat_punct("]") {
                    suffixes.push(Derive::Array(None));
                    continue;
                }
                let count = self.const_expr()?;
                if count < 0 {
                    return Err(self.error_here("array has negative size"));
                }
                self.expect_punct("]")?;
                suffixes.push(Derive::Array(Some(count as usize)));
            } else if self.at_punct("(") {
                self.skip_balanced()?;
                suffixes.push(Derive::Function);
            } else {
                break;
            }
        }

        loop {
            if self.at_ident("__attribute__") || self.at_ident("__attribute") {
                let parsed = self.attributes()?;
                attributes.merge(parsed);
            } else if self.at_ident("__asm__") || self.at_ident("asm") {
                self.pos += 1;
                self.skip_balanced()?;
            } else {
                break;
            }
        }

        let mut derives: Vec<Derive> = (0..pointers).map(|_| Derive::Pointer).collect();
        derives.extend(suffixes.into_iter().rev());
        derives.extend(inner);
        Ok((name, derives))
    }

    /// A type name as written in `sizeof(...)` or a cast
    fn type_name(&mut self) -> ParseResult<CType> {
        let Some(specs) = self.specifiers()? else {
            return Err(self.error_here("expected a type"));
        };
        let declarator = self.declarator(specs.ty)?;
        if let Some(name) = declarator.name {
            return Err(Diagnostic::new(name.location(), "unexpected name in type"));
        }
        Ok(declarator.ty)
    }

    fn const_expr(&mut self) -> ParseResult<i64> {
        let condition = self.binary(1)?;
        if !self.eat_punct("?") {
            return Ok(condition);
        }
        let then = self.const_expr()?;
        self.expect_punct(":")?;
        let otherwise = self.const_expr()?;
        Ok(if condition != 0 { then } else { otherwise })
    }

    fn binary_precedence(token: Option<&Token>) -> Option<(u8, &'static str)> {
        let TokenKind::Punct(p) = token?.kind else {
            return None;
        };
        let precedence = match p {
            "||" => 1,
            "&&" => 2,
            "|" => 3,
            "^" => 4,
            "&" => 5,
            "==" | "!=" => 6,
            "<" | ">" | "<=" | ">=" => 7,
            "<<" | ">>" => 8,
            "+" | "-" => 9,
            "*" | "/" | "%" => 10,
            _ => return None,
        };
        Some((precedence, p))
    }

    fn binary(&mut self, min_precedence: u8) -> ParseResult<i64> {
        let mut lhs = self.unary()?;
        while let Some((precedence, op)) = Self::binary_precedence(self.peek()) {
            if precedence < min_precedence {
                break;
            }
            let at = self.bump()?;
            let rhs = self.binary(precedence + 1)?;
            lhs = match op {
                "||" => ((lhs != 0) || (rhs != 0)) as i64,
                "&&" => ((lhs != 0) && (rhs != 0)) as i64,
                "|" => lhs | rhs,
                "^" => lhs ^ rhs,
                "&" => lhs & rhs,
                "==" => (lhs == rhs) as i64,
                "!=" => (lhs != rhs) as i64,
                "<" => (lhs < rhs) as i64,
                ">" => (lhs > rhs) as i64,
                "<=" => (lhs <= rhs) as i64,
                ">=" => (lhs >= rhs) as i64,
                "<<" => lhs.wrapping_shl(rhs as u32),
                ">>" => lhs.wrapping_shr(rhs as u32),
                "+" => lhs.wrapping_add(rhs),
                "-" => lhs.wrapping_sub(rhs),
                "*" => lhs.wrapping_mul(rhs),
                "/" | "%" if rhs == 0 => {
                    return Err(Diagnostic::new(at.location(), "division by zero in constant expression"));
                }
                "/" => lhs.wrapping_div(rhs),
                _ => lhs.wrapping_rem(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> ParseResult<i64> {
        let token = self.bump()?;
        match token.kind {
            TokenKind::Punct("-") => Ok(self.unary()?.wrapping_neg()),
            TokenKind::Punct("+") => self.unary(),
            TokenKind::Punct("!") => Ok((self.unary()? == 0) as i64),
            TokenKind::Punct("~") => Ok(!self.unary()?),
            TokenKind::Punct("(") => {
                if self.is_type_start(self.peek()) {
                    // cast
                    self.type_name()?;
                    self.expect_punct(")")?;
                    return self.unary();
                }
                let value = self.const_expr()?;
                self.expect_punct(")")?;
                Ok(value)
            }
            TokenKind::Int(value) | TokenKind::Char(value) => Ok(value as i64),
            TokenKind::Ident => match token.text.as_str() {
                "sizeof" | "_Alignof" | "__alignof__" | "__alignof" | "alignof" => {
                    self.expect_punct("(")?;
                    if !self.is_type_start(self.peek()) {
                        return Err(Diagnostic::new(token.location(), format!("'{}' requires a type name", token.text)));
                    }
                    let ty = self.type_name()?;
                    self.expect_punct(")")?;
                    let (size, align) = match size_align(&ty, &self.records) {
                        Ok(found) => found,
                        Err(NoSize::TooLarge) => {
                            return Err(Diagnostic::new(token.location(), "array is too large"));
                        }
                        Err(NoSize::Incomplete) => {
                            return Err(Diagnostic::new(
                                token.location(),
                                format!(
                                    "invalid application of '{}' to an incomplete type '{}'",
                                    token.text,
                                    ty.describe(&self.records)
                                ),
                            ));
                        }
                    };
                    let value = if token.text == "sizeof" { size } else { align };
                    Ok(value as i64)
                }
                name => self.enum_constants.get(name).copied().ok_or_else(|| {
                    Diagnostic::new(token.location(), format!("use of undeclared identifier '{name}'"))
                }),
            },
            _ => Err(Diagnostic::new(token.location(), "expected expression")),
        }
    }
}
