//! Declaration syntax for behaviour modules.
//!
//! Only the outer structure (`use`, `type`, fields, method signatures) is tokenised here.
//! Method bodies are Rhai code: the lexer captures them verbatim up to the matching brace
//! and notes any `module::` paths they use, so references can be resolved later.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::diagnostics::{Diagnostic, DiagnosticCode, SourceLocation};
use crate::reflect::FieldKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Colon,
    Semi,
    Comma,
    Eq,
    Minus,
    Hash,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Invalid(String),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "`{s}`"),
            Token::Int(n) => write!(f, "`{n}`"),
            Token::Float(n) => write!(f, "`{n}`"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Colon => write!(f, "`:`"),
            Token::Semi => write!(f, "`;`"),
            Token::Comma => write!(f, "`,`"),
            Token::Eq => write!(f, "`=`"),
            Token::Minus => write!(f, "`-`"),
            Token::Hash => write!(f, "`#`"),
            Token::LBrace => write!(f, "`{{`"),
            Token::RBrace => write!(f, "`}}`"),
            Token::LParen => write!(f, "`(`"),
            Token::RParen => write!(f, "`)`"),
            Token::LBracket => write!(f, "`[`"),
            Token::RBracket => write!(f, "`]`"),
            Token::Invalid(message) => write!(f, "{message}"),
            Token::Eof => write!(f, "end of file"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRef {
    pub name: String,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone)]
pub struct CapturedBody {
    pub text: String,
    pub line: usize,
    pub col: usize,
    pub module_refs: Vec<ModuleRef>,
}

pub struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input: input.as_bytes(), pos: 0, line: 1, col: 1 }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.input.get(self.pos).copied()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else if b & 0xC0 != 0x80 {
            // utf-8 continuation bytes do not start a new column
            self.col += 1;
        }
        Some(b)
    }

    fn skip_line_comment(&mut self) {
        while let Some(b) = self.advance() {
            if b == b'\n' {
                break;
            }
        }
    }

    /// Block comments nest, as they do in Rhai.
    fn skip_block_comment(&mut self) {
        self.advance();
        self.advance();
        let mut depth = 1usize;
        while depth > 0 {
            match self.advance() {
                None => break,
                Some(b'/') if self.peek_byte() == Some(b'*') => {
                    self.advance();
                    depth += 1;
                }
                Some(b'*') if self.peek_byte() == Some(b'/') => {
                    self.advance();
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while matches!(self.peek_byte(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
                self.advance();
            }
            match (self.peek_byte(), self.peek_at(1)) {
                (Some(b'/'), Some(b'/')) => self.skip_line_comment(),
                (Some(b'/'), Some(b'*')) => self.skip_block_comment(),
                _ => break,
            }
        }
    }

    pub fn next_token(&mut self) -> SpannedToken {
        self.skip_whitespace_and_comments();
        let line = self.line;
        let col = self.col;
        let Some(b) = self.peek_byte() else {
            return SpannedToken { token: Token::Eof, line, col };
        };

        let punct = match b {
            b':' => Some(Token::Colon),
            b';' => Some(Token::Semi),
            b',' => Some(Token::Comma),
            b'=' => Some(Token::Eq),
            b'-' => Some(Token::Minus),
            b'#' => Some(Token::Hash),
            b'{' => Some(Token::LBrace),
            b'}' => Some(Token::RBrace),
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            b'[' => Some(Token::LBracket),
            b']' => Some(Token::RBracket),
            _ => None,
        };
        if let Some(token) = punct {
            self.advance();
            return SpannedToken { token, line, col };
        }

        if b.is_ascii_digit() {
            return SpannedToken { token: self.lex_number(), line, col };
        }

        if b == b'"' {
            return SpannedToken { token: self.lex_string(), line, col };
        }

        if b.is_ascii_alphabetic() || b == b'_' {
            let word = self.lex_word();
            return SpannedToken { token: Token::Ident(word), line, col };
        }

        let ch = self.lex_unknown_char();
        SpannedToken { token: Token::Invalid(format!("unexpected character `{ch}`")), line, col }
    }

    fn lex_unknown_char(&mut self) -> char {
        let start = self.pos;
        self.advance();
        while matches!(self.peek_byte(), Some(b) if b & 0xC0 == 0x80) {
            self.advance();
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).chars().next().unwrap_or('?')
    }

    fn lex_word(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek_byte(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.advance();
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn lex_number(&mut self) -> Token {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek_byte() {
            if c.is_ascii_digit() || c == b'_' {
                self.advance();
            } else if c == b'.' && !is_float && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit()) {
                is_float = true;
                self.advance();
            } else if (c == b'e' || c == b'E') && is_float {
                self.advance();
                if matches!(self.peek_byte(), Some(b'-' | b'+')) {
                    self.advance();
                }
            } else {
                break;
            }
        }
        let text: String =
            String::from_utf8_lossy(&self.input[start..self.pos]).chars().filter(|c| *c != '_').collect();
        if is_float {
            match text.parse::<f64>() {
                Ok(value) => Token::Float(value),
                Err(_) => Token::Invalid(format!("malformed number `{text}`")),
            }
        } else {
            match text.parse::<i64>() {
                Ok(value) => Token::Int(value),
                Err(_) => Token::Invalid(format!("integer `{text}` is out of range")),
            }
        }
    }

    fn lex_string(&mut self) -> Token {
        self.advance();
        let mut out = Vec::new();
        loop {
            match self.advance() {
                None | Some(b'\n') => return Token::Invalid("unterminated string literal".to_string()),
                Some(b'"') => break,
                Some(b'\\') => match self.advance() {
                    Some(b'n') => out.push(b'\n'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b'0') => out.push(0),
                    Some(b'"') => out.push(b'"'),
                    Some(b'\\') => out.push(b'\\'),
                    Some(other) => return Token::Invalid(format!("unknown escape `\\{}`", other as char)),
                    None => return Token::Invalid("unterminated string literal".to_string()),
                },
                Some(other) => out.push(other),
            }
        }
        Token::Str(String::from_utf8_lossy(&out).into_owned())
    }

    /// Called right after a method's opening `{`. Returns everything up to (not including)
    /// the matching `}`, which is consumed.
    pub fn capture_block(&mut self) -> Result<CapturedBody, SpannedToken> {
        let line = self.line;
        let col = self.col;
        let start = self.pos;
        let mut module_refs = Vec::new();
        let end = self.scan_braced(&mut module_refs).ok_or_else(|| SpannedToken {
            token: Token::Invalid("method body is missing its closing `}`".to_string()),
            line,
            col,
        })?;
        let text = String::from_utf8_lossy(&self.input[start..end]).into_owned();
        Ok(CapturedBody { text, line, col, module_refs })
    }

    /// Scans Rhai code until the brace that closes the enclosing block. Returns the offset
    /// of that brace.
    fn scan_braced(&mut self, module_refs: &mut Vec<ModuleRef>) -> Option<usize> {
        let mut depth = 1usize;
        let mut after_path_sep = false;
        loop {
            let b = self.peek_byte()?;
            match b {
                b'{' => {
                    self.advance();
                    depth += 1;
                    after_path_sep = false;
                }
                b'}' => {
                    let close = self.pos;
                    self.advance();
                    depth -= 1;
                    if depth == 0 {
                        return Some(close);
                    }
                    after_path_sep = false;
                }
                b'/' if self.peek_at(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek_at(1) == Some(b'*') => self.skip_block_comment(),
                b'"' | b'\'' => {
                    self.skip_quoted(b);
                    after_path_sep = false;
                }
                b'`' => {
                    self.skip_backtick(module_refs)?;
                    after_path_sep = false;
                }
                b':' if self.peek_at(1) == Some(b':') => {
                    self.advance();
                    self.advance();
                    after_path_sep = true;
                }
                c if c.is_ascii_alphabetic() || c == b'_' => {
                    let line = self.line;
                    let col = self.col;
                    let word = self.lex_word();
                    let is_path_head =
                        !after_path_sep && self.peek_byte() == Some(b':') && self.peek_at(1) == Some(b':');
                    if is_path_head {
                        module_refs.push(ModuleRef { name: word, line, col });
                    }
                    after_path_sep = false;
                }
                c if c.is_ascii_whitespace() => {
                    self.advance();
                }
                _ => {
                    self.advance();
                    after_path_sep = false;
                }
            }
        }
    }

    fn skip_quoted(&mut self, quote: u8) {
        self.advance();
        while let Some(b) = self.advance() {
            if b == b'\\' {
                self.advance();
            } else if b == quote || b == b'\n' {
                break;
            }
        }
    }

    fn skip_backtick(&mut self, module_refs: &mut Vec<ModuleRef>) -> Option<()> {
        self.advance();
        loop {
            match self.advance()? {
                b'`' => return Some(()),
                b'$' if self.peek_byte() == Some(b'{') => {
                    self.advance();
                    self.scan_braced(module_refs)?;
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Vector(Vec<f64>),
    Array(Vec<Literal>),
    Map(Vec<(String, Literal)>),
}

impl Literal {
    pub fn describe(&self) -> String {
        match self {
            Literal::Int(_) => "integer".to_string(),
            Literal::Float(_) => "float".to_string(),
            Literal::Bool(_) => "bool".to_string(),
            Literal::Text(_) => "string".to_string(),
            Literal::Vector(items) => format!("vec{}", items.len()),
            Literal::Array(_) => "array".to_string(),
            Literal::Map(_) => "map".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub kind: FieldKind,
    pub visibility: Visibility,
    pub default: Option<Literal>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: CapturedBody,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub name: String,
    pub base: Option<(String, SourceLocation)>,
    pub is_abstract: bool,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<FnDecl>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct UseDecl {
    pub module: String,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Default)]
pub struct SyntaxTree {
    pub path: PathBuf,
    pub uses: Vec<UseDecl>,
    pub functions: Vec<FnDecl>,
    pub types: Vec<TypeDecl>,
}

#[derive(Debug, Clone)]
struct ParseError {
    line: usize,
    col: usize,
    message: String,
}

impl ParseError {
    fn at(token: &SpannedToken, message: impl Into<String>) -> Self {
        Self { line: token.line, col: token.col, message: message.into() }
    }
}

/// Parses one module. Never fails outright: syntax errors become diagnostics and the
/// parser resumes at the next item it recognises.
pub fn parse_module(path: &Path, source: &str) -> (SyntaxTree, Vec<Diagnostic>) {
    let mut parser = Parser {
        lexer: Lexer::new(source),
        peeked: None,
        path: path.to_path_buf(),
        diagnostics: Vec::new(),
    };
    let tree = parser.parse_file();
    (tree, parser.diagnostics)
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<SpannedToken>,
    path: PathBuf,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Parser<'a> {
    fn peek(&mut self) -> &SpannedToken {
        let lexer = &mut self.lexer;
        self.peeked.get_or_insert_with(|| lexer.next_token())
    }

    fn next(&mut self) -> SpannedToken {
        match self.peeked.take() {
            Some(token) => token,
            None => self.lexer.next_token(),
        }
    }

    fn at_keyword(&mut self, keyword: &str) -> bool {
        matches!(&self.peek().token, Token::Ident(word) if word == keyword)
    }

    fn location(&self, line: usize, col: usize) -> SourceLocation {
        SourceLocation::new(&self.path, line, col)
    }

    fn expect(&mut self, expected: Token) -> Result<SpannedToken, ParseError> {
        let token = self.next();
        if token.token == expected {
            Ok(token)
        } else {
            Err(ParseError::at(&token, format!("expected {expected}, found {}", token.token)))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, SpannedToken), ParseError> {
        let token = self.next();
        match &token.token {
            Token::Ident(name) => Ok((name.clone(), token.clone())),
            other => Err(ParseError::at(&token, format!("expected {what}, found {other}"))),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<SpannedToken, ParseError> {
        let token = self.next();
        match &token.token {
            Token::Ident(word) if word == keyword => Ok(token),
            other => Err(ParseError::at(&token, format!("expected `{keyword}`, found {other}"))),
        }
    }

    fn report(&mut self, err: ParseError) {
        let location = self.location(err.line, err.col);
        self.diagnostics.push(Diagnostic::new(DiagnosticCode::DeclarationSyntax, location, err.message));
    }

    fn parse_file(&mut self) -> SyntaxTree {
        let mut tree = SyntaxTree { path: self.path.clone(), ..SyntaxTree::default() };
        loop {
            let token = self.peek().clone();
            let result = match &token.token {
                Token::Eof => break,
                Token::Ident(word) if word == "use" => self.parse_use().map(|decl| tree.uses.push(decl)),
                Token::Ident(word) if word == "fn" => self.parse_fn().map(|decl| tree.functions.push(decl)),
                Token::Ident(word) if word == "type" || word == "abstract" => {
                    self.parse_type().map(|decl| tree.types.push(decl))
                }
                other => {
                    let message = format!("expected `use`, `fn` or `type`, found {other}");
                    self.next();
                    Err(ParseError::at(&token, message))
                }
            };
            if let Err(err) = result {
                self.report(err);
                self.synchronize_top_level();
            }
        }
        tree
    }

    fn synchronize_top_level(&mut self) {
        let mut depth = 0usize;
        loop {
            let token = self.peek().clone();
            match &token.token {
                Token::Eof => return,
                Token::Ident(word)
                    if depth == 0 && matches!(word.as_str(), "use" | "fn" | "type" | "abstract") =>
                {
                    return
                }
                Token::LBrace => depth += 1,
                Token::RBrace => depth = depth.saturating_sub(1),
                _ => {}
            }
            self.next();
        }
    }

    /// Skips to the end of the broken member. Stops before `}` closing the type body.
    fn synchronize_member(&mut self) {
        let mut depth = 0usize;
        loop {
            let token = self.peek().clone();
            match &token.token {
                Token::Eof => return,
                Token::Semi if depth == 0 => {
                    self.next();
                    return;
                }
                Token::RBrace if depth == 0 => return,
                Token::Ident(word) if depth == 0 && matches!(word.as_str(), "pub" | "let" | "fn") => return,
                Token::LBrace => depth += 1,
                Token::RBrace => depth -= 1,
                _ => {}
            }
            self.next();
        }
    }

    fn parse_use(&mut self) -> Result<UseDecl, ParseError> {
        let keyword = self.expect_keyword("use")?;
        let (module, _) = self.expect_ident("module name")?;
        self.expect(Token::Semi)?;
        Ok(UseDecl { module, location: self.location(keyword.line, keyword.col) })
    }

    fn parse_fn(&mut self) -> Result<FnDecl, ParseError> {
        self.expect_keyword("fn")?;
        let (name, name_token) = self.expect_ident("function name")?;
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if !matches!(self.peek().token, Token::RParen) {
            loop {
                let (param, param_token) = self.expect_ident("parameter name")?;
                if params.contains(&param) {
                    return Err(ParseError::at(&param_token, format!("duplicate parameter `{param}`")));
                }
                params.push(param);
                if matches!(self.peek().token, Token::Comma) {
                    self.next();
                    continue;
                }
                break;
            }
        }
        self.expect(Token::RParen)?;
        // The lexer must sit right after `{` when the body is captured, so nothing may be
        // peeked past it.
        self.expect(Token::LBrace)?;
        let body = self.lexer.capture_block().map_err(|token| ParseError::at(&token, token.token.to_string()))?;
        Ok(FnDecl { name, params, body, location: self.location(name_token.line, name_token.col) })
    }

    fn parse_type(&mut self) -> Result<TypeDecl, ParseError> {
        let is_abstract = if self.at_keyword("abstract") {
            self.next();
            true
        } else {
            false
        };
        self.expect_keyword("type")?;
        let (name, name_token) = self.expect_ident("type name")?;
        let base = if matches!(self.peek().token, Token::Colon) {
            self.next();
            let (base, base_token) = self.expect_ident("base type name")?;
            Some((base, self.location(base_token.line, base_token.col)))
        } else {
            None
        };
        self.expect(Token::LBrace)?;
        let mut decl = TypeDecl {
            name,
            base,
            is_abstract,
            fields: Vec::new(),
            methods: Vec::new(),
            location: self.location(name_token.line, name_token.col),
        };
        loop {
            let token = self.peek().clone();
            let result = match &token.token {
                Token::RBrace => {
                    self.next();
                    break;
                }
                Token::Eof => return Err(ParseError::at(&token, format!("type `{}` is missing its closing `}}`", decl.name))),
                Token::Ident(word) if word == "fn" => self.parse_fn().map(|method| decl.methods.push(method)),
                Token::Ident(word) if word == "pub" || word == "let" => {
                    self.parse_field().map(|field| decl.fields.push(field))
                }
                other => {
                    let message = format!("expected `pub`, `let`, `fn` or `}}`, found {other}");
                    self.next();
                    Err(ParseError::at(&token, message))
                }
            };
            if let Err(err) = result {
                self.report(err);
                self.synchronize_member();
            }
        }
        Ok(decl)
    }

    fn parse_field(&mut self) -> Result<FieldDecl, ParseError> {
        let (keyword, _) = self.expect_ident("`pub` or `let`")?;
        let visibility = if keyword == "pub" { Visibility::Public } else { Visibility::Private };
        let (name, name_token) = self.expect_ident("field name")?;
        self.expect(Token::Colon)?;
        let (kind_word, kind_token) = self.expect_ident("field kind")?;
        let kind = FieldKind::from_keyword(&kind_word).ok_or_else(|| {
            ParseError::at(
                &kind_token,
                format!("unknown field kind `{kind_word}` (expected int, float, bool, string, vec2, vec3, vec4, array or map)"),
            )
        })?;
        let default = if matches!(self.peek().token, Token::Eq) {
            self.next();
            Some(self.parse_literal()?)
        } else {
            None
        };
        self.expect(Token::Semi)?;
        Ok(FieldDecl { name, kind, visibility, default, location: self.location(name_token.line, name_token.col) })
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        let token = self.next();
        match token.token {
            Token::Int(value) => Ok(Literal::Int(value)),
            Token::Float(value) => Ok(Literal::Float(value)),
            Token::Str(value) => Ok(Literal::Text(value)),
            Token::Minus => {
                let operand = self.next();
                match operand.token {
                    Token::Int(value) => Ok(Literal::Int(-value)),
                    Token::Float(value) => Ok(Literal::Float(-value)),
                    ref other => Err(ParseError::at(&operand, format!("expected a number after `-`, found {other}"))),
                }
            }
            Token::Ident(ref word) if word == "true" => Ok(Literal::Bool(true)),
            Token::Ident(ref word) if word == "false" => Ok(Literal::Bool(false)),
            Token::Ident(ref word) if matches!(word.as_str(), "vec2" | "vec3" | "vec4") => {
                let arity = if word == "vec2" { 2 } else if word == "vec3" { 3 } else { 4 };
                self.parse_vector(&token, arity)
            }
            Token::LBracket => self.parse_array(),
            Token::Hash => self.parse_map(),
            ref other => Err(ParseError::at(&token, format!("expected a literal default value, found {other}"))),
        }
    }

    fn parse_vector(&mut self, head: &SpannedToken, arity: usize) -> Result<Literal, ParseError> {
        self.expect(Token::LParen)?;
        let mut components = Vec::with_capacity(arity);
        loop {
            match self.parse_literal()? {
                Literal::Int(value) => components.push(value as f64),
                Literal::Float(value) => components.push(value),
                other => {
                    return Err(ParseError::at(
                        head,
                        format!("vector components must be numbers, found {}", other.describe()),
                    ))
                }
            }
            if matches!(self.peek().token, Token::Comma) {
                self.next();
                continue;
            }
            break;
        }
        self.expect(Token::RParen)?;
        if components.len() != arity {
            return Err(ParseError::at(head, format!("vec{arity} takes {arity} components, found {}", components.len())));
        }
        Ok(Literal::Vector(components))
    }

    fn parse_array(&mut self) -> Result<Literal, ParseError> {
        let mut items = Vec::new();
        loop {
            if matches!(self.peek().token, Token::RBracket) {
                self.next();
                break;
            }
            items.push(self.parse_literal()?);
            match self.peek().token {
                Token::Comma => {
                    self.next();
                }
                Token::RBracket => {}
                _ => {
                    let token = self.next();
                    return Err(ParseError::at(&token, format!("expected `,` or `]`, found {}", token.token)));
                }
            }
        }
        Ok(Literal::Array(items))
    }

    fn parse_map(&mut self) -> Result<Literal, ParseError> {
        self.expect(Token::LBrace)?;
        let mut entries = Vec::new();
        loop {
            let token = self.next();
            let key = match token.token {
                Token::RBrace => break,
                Token::Ident(key) | Token::Str(key) => key,
                ref other => return Err(ParseError::at(&token, format!("expected a map key, found {other}"))),
            };
            self.expect(Token::Colon)?;
            let value = self.parse_literal()?;
            entries.push((key, value));
            match self.peek().token {
                Token::Comma => {
                    self.next();
                }
                Token::RBrace => {}
                _ => {
                    let token = self.next();
                    return Err(ParseError::at(&token, format!("expected `,` or `}}`, found {}", token.token)));
                }
            }
        }
        Ok(Literal::Map(entries))
    }
}
