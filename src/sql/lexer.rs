//! SQL tokenizer.
//!
//! Understands enough of the MySQL and PostgreSQL lexical grammar to know where string
//! literals, quoted identifiers and comments begin and end. Whitespace is dropped; every
//! other token keeps its byte span into the source so callers can cut the original text.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Keyword or bare identifier.
    Word,
    /// `"ident"` or `` `ident` ``.
    QuotedIdent,
    /// `'...'`, `E'...'` or `$tag$...$tag$`.
    StringLit,
    Number,
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
    /// `-- ...` or `# ...`.
    LineComment,
    BlockComment,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn text<'a>(&self, sql: &'a str) -> &'a str {
        &sql[self.start..self.end]
    }

    pub fn is_keyword(&self, sql: &str, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text(sql).eq_ignore_ascii_case(keyword)
    }

    pub fn is_comment(&self) -> bool {
        matches!(self.kind, TokenKind::LineComment | TokenKind::BlockComment)
    }

    /// Identifier value: quotes removed and doubled quotes collapsed for quoted
    /// identifiers, lower-cased for bare words (PostgreSQL folding).
    pub fn identifier(&self, sql: &str) -> Option<String> {
        let text = self.text(sql);
        match self.kind {
            TokenKind::Word => Some(text.to_lowercase()),
            TokenKind::QuotedIdent => {
                let quote = &text[..1];
                let inner = &text[1..text.len() - 1];
                Some(inner.replace(&quote.repeat(2), quote))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unterminated {what} starting at byte {at}")]
    Unterminated { what: &'static str, at: usize },
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.rest().chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.bump();
        }
    }

    /// Consume up to and including the closing `quote`. A doubled quote is an escaped
    /// quote; with `backslash_escapes` a backslash escapes the next character.
    fn quoted(
        &mut self,
        quote: char,
        backslash_escapes: bool,
        start: usize,
        what: &'static str,
    ) -> Result<(), LexError> {
        loop {
            match self.bump() {
                None => return Err(LexError::Unterminated { what, at: start }),
                Some(c) if c == quote => {
                    if self.peek() == Some(quote) {
                        self.bump();
                    } else {
                        return Ok(());
                    }
                }
                Some('\\') if backslash_escapes => {
                    self.bump();
                }
                Some(_) => {}
            }
        }
    }

    fn block_comment(&mut self, start: usize) -> Result<(), LexError> {
        match self.rest().find("*/") {
            Some(idx) => {
                self.pos += idx + 2;
                Ok(())
            }
            None => Err(LexError::Unterminated {
                what: "block comment",
                at: start,
            }),
        }
    }

    /// Length of a `$tag$` opener at the current position, if there is one.
    fn dollar_tag(&self) -> Option<usize> {
        let rest = self.rest();
        let mut chars = rest.char_indices().skip(1);
        match chars.next() {
            Some((idx, '$')) => return Some(idx + 1),
            Some((_, c)) if c.is_alphabetic() || c == '_' => {}
            _ => return None,
        }
        for (idx, c) in chars {
            if c == '$' {
                return Some(idx + 1);
            }
            if !(c.is_alphanumeric() || c == '_') {
                return None;
            }
        }
        None
    }

    fn dollar_string(&mut self, start: usize, tag_len: usize) -> Result<(), LexError> {
        let tag = &self.rest()[..tag_len];
        let body = &self.rest()[tag_len..];
        match body.find(tag) {
            Some(idx) => {
                self.pos += tag_len + idx + tag_len;
                Ok(())
            }
            None => Err(LexError::Unterminated {
                what: "dollar-quoted string",
                at: start,
            }),
        }
    }
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>, LexError> {
    let mut lx = Lexer { src: sql, pos: 0 };
    let mut tokens = Vec::new();

    while let Some(c) = lx.peek() {
        let start = lx.pos;
        let kind = match c {
            c if c.is_whitespace() => {
                lx.bump();
                continue;
            }
            '-' if lx.peek_second() == Some('-') => {
                lx.eat_while(|c| c != '\n');
                TokenKind::LineComment
            }
            '#' => {
                lx.eat_while(|c| c != '\n');
                TokenKind::LineComment
            }
            '/' if lx.peek_second() == Some('*') => {
                lx.pos += 2;
                lx.block_comment(start)?;
                TokenKind::BlockComment
            }
            '\'' => {
                lx.bump();
                lx.quoted('\'', false, start, "string literal")?;
                TokenKind::StringLit
            }
            'e' | 'E' if lx.peek_second() == Some('\'') => {
                lx.bump();
                lx.bump();
                lx.quoted('\'', true, start, "string literal")?;
                TokenKind::StringLit
            }
            '"' => {
                lx.bump();
                lx.quoted('"', false, start, "quoted identifier")?;
                TokenKind::QuotedIdent
            }
            '`' => {
                lx.bump();
                lx.quoted('`', false, start, "quoted identifier")?;
                TokenKind::QuotedIdent
            }
            '$' => match lx.dollar_tag() {
                Some(tag_len) => {
                    lx.dollar_string(start, tag_len)?;
                    TokenKind::StringLit
                }
                None => {
                    lx.bump();
                    lx.eat_while(|c| c.is_ascii_digit());
                    TokenKind::Operator
                }
            },
            c if c.is_ascii_digit() => {
                lx.eat_while(|c| c.is_ascii_alphanumeric() || c == '.');
                TokenKind::Number
            }
            '.' if lx.peek_second().is_some_and(|c| c.is_ascii_digit()) => {
                lx.bump();
                lx.eat_while(|c| c.is_ascii_alphanumeric() || c == '.');
                TokenKind::Number
            }
            c if is_word_start(c) => {
                lx.eat_while(is_word_char);
                TokenKind::Word
            }
            '(' => {
                lx.bump();
                TokenKind::LParen
            }
            ')' => {
                lx.bump();
                TokenKind::RParen
            }
            ',' => {
                lx.bump();
                TokenKind::Comma
            }
            '.' => {
                lx.bump();
                TokenKind::Dot
            }
            ';' => {
                lx.bump();
                TokenKind::Semicolon
            }
            _ => {
                lx.bump();
                TokenKind::Operator
            }
        };
        tokens.push(Token {
            kind,
            start,
            end: lx.pos,
        });
    }

    Ok(tokens)
}
