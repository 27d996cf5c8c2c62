//! Hand-rolled scanner with line/column tracking.

use crate::error::CompileError;
use crate::token::{Token, TokenKind};

/// Tokenizes a whole source file, ending with an [`TokenKind::Eof`]
/// token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

/// Streaming scanner over source text.
pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    peeked: Option<Token>,
}

impl Lexer {
    /// A scanner positioned at the start of `source`.
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            peeked: None,
        }
    }

    /// The next token, consuming it.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Token, CompileError> {
        if let Some(token) = self.peeked.take() {
            return Ok(token);
        }
        self.scan()
    }

    /// The next token without consuming it.
    pub fn peek(&mut self) -> Result<&Token, CompileError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.scan()?);
        }
        Ok(self.peeked.as_ref().expect("just filled"))
    }

    /// Consumes the next token, requiring a kind.
    pub fn expect(&mut self, kind: TokenKind) -> Result<Token, CompileError> {
        let token = self.next()?;
        if token.kind == kind {
            Ok(token)
        } else {
            Err(CompileError::Parse {
                expected: kind.describe().to_owned(),
                got: token.lexeme,
                line: token.line,
                column: token.column,
            })
        }
    }

    fn error(&self, message: impl Into<String>, line: usize, column: usize) -> CompileError {
        CompileError::Lexical {
            message: message.into(),
            line,
            column,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn lookahead(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_trivia(&mut self) -> Result<(), CompileError> {
        loop {
            match self.current() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.lookahead() == Some('/') => {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.lookahead() == Some('*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        match (self.current(), self.lookahead()) {
                            (Some('*'), Some('/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(_), _) => {
                                self.bump();
                            }
                            (None, _) => {
                                return Err(self.error("unterminated block comment", line, column))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan(&mut self) -> Result<Token, CompileError> {
        self.skip_trivia()?;

        let (line, column) = (self.line, self.column);
        let token = |kind, lexeme: &str| Token {
            kind,
            lexeme: lexeme.to_owned(),
            line,
            column,
        };

        let ch = match self.current() {
            None => return Ok(token(TokenKind::Eof, "")),
            Some(c) => c,
        };

        if ch.is_ascii_digit() {
            return self.scan_number(line, column);
        }
        if ch.is_ascii_alphabetic() || ch == '_' {
            return Ok(self.scan_ident(line, column));
        }
        if ch == '"' {
            return self.scan_string(line, column);
        }

        self.bump();
        let two = |lexer: &mut Self, kind, lexeme: &str| {
            lexer.bump();
            Ok(token(kind, lexeme))
        };
        match (ch, self.current()) {
            ('-', Some('>')) => two(self, TokenKind::Arrow, "->"),
            ('=', Some('=')) => two(self, TokenKind::EqEq, "=="),
            ('!', Some('=')) => two(self, TokenKind::NotEq, "!="),
            ('<', Some('=')) => two(self, TokenKind::Le, "<="),
            ('>', Some('=')) => two(self, TokenKind::Ge, ">="),
            ('&', Some('&')) => two(self, TokenKind::AndAnd, "&&"),
            ('|', Some('|')) => two(self, TokenKind::OrOr, "||"),
            ('<', Some('<')) => two(self, TokenKind::Shl, "<<"),
            ('>', Some('>')) => two(self, TokenKind::Shr, ">>"),
            ('.', Some('.')) => two(self, TokenKind::DotDot, ".."),
            ('(', _) => Ok(token(TokenKind::LParen, "(")),
            (')', _) => Ok(token(TokenKind::RParen, ")")),
            ('{', _) => Ok(token(TokenKind::LBrace, "{")),
            ('}', _) => Ok(token(TokenKind::RBrace, "}")),
            ('[', _) => Ok(token(TokenKind::LBracket, "[")),
            (']', _) => Ok(token(TokenKind::RBracket, "]")),
            (',', _) => Ok(token(TokenKind::Comma, ",")),
            (';', _) => Ok(token(TokenKind::Semicolon, ";")),
            (':', _) => Ok(token(TokenKind::Colon, ":")),
            ('.', _) => Ok(token(TokenKind::Dot, ".")),
            ('=', _) => Ok(token(TokenKind::Assign, "=")),
            ('+', _) => Ok(token(TokenKind::Plus, "+")),
            ('-', _) => Ok(token(TokenKind::Minus, "-")),
            ('*', _) => Ok(token(TokenKind::Star, "*")),
            ('/', _) => Ok(token(TokenKind::Slash, "/")),
            ('%', _) => Ok(token(TokenKind::Percent, "%")),
            ('<', _) => Ok(token(TokenKind::Lt, "<")),
            ('>', _) => Ok(token(TokenKind::Gt, ">")),
            ('!', _) => Ok(token(TokenKind::Bang, "!")),
            ('&', _) => Ok(token(TokenKind::Amp, "&")),
            ('|', _) => Ok(token(TokenKind::Pipe, "|")),
            ('^', _) => Ok(token(TokenKind::Caret, "^")),
            ('~', _) => Ok(token(TokenKind::Tilde, "~")),
            _ => Err(self.error(format!("unknown character `{ch}`"), line, column)),
        }
    }

    fn scan_ident(&mut self, line: usize, column: usize) -> Token {
        let mut lexeme = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_alphanumeric() || c == '_' {
                lexeme.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let kind = TokenKind::keyword(&lexeme).unwrap_or(TokenKind::Ident);
        Token {
            kind,
            lexeme,
            line,
            column,
        }
    }

    fn scan_number(&mut self, line: usize, column: usize) -> Result<Token, CompileError> {
        let mut lexeme = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                lexeme.push(c);
                self.bump();
            } else {
                break;
            }
        }

        // `1..5` keeps the dots for the range operator; `1.5` is a float.
        let is_float = self.current() == Some('.') && self.lookahead() != Some('.');
        if is_float {
            lexeme.push('.');
            self.bump();
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    lexeme.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            lexeme
                .parse::<f64>()
                .map_err(|e| self.error(format!("bad float literal `{lexeme}`: {e}"), line, column))?;
            return Ok(Token {
                kind: TokenKind::FloatLit,
                lexeme,
                line,
                column,
            });
        }

        lexeme
            .parse::<i64>()
            .map_err(|e| self.error(format!("bad integer literal `{lexeme}`: {e}"), line, column))?;
        Ok(Token {
            kind: TokenKind::IntLit,
            lexeme,
            line,
            column,
        })
    }

    fn scan_string(&mut self, line: usize, column: usize) -> Result<Token, CompileError> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(self.error("unterminated string literal", line, column))
                }
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    Some('t') => value.push('\t'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some('0') => value.push('\0'),
                    other => {
                        return Err(self.error(
                            format!("unknown escape `\\{}`", other.unwrap_or(' ')),
                            line,
                            column,
                        ))
                    }
                },
                Some(c) => value.push(c),
            }
        }
        Ok(Token {
            kind: TokenKind::StrLit,
            lexeme: value,
            line,
            column,
        })
    }
}
