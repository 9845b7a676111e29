//! Tokenizer shared by the measure expression parser and SQL source extraction.

use super::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare identifier or keyword.
    Ident(String),
    /// Double-quoted identifier, quotes removed.
    QuotedIdent(String),
    Number(f64),
    /// Single-quoted string, quotes removed and `''` unescaped.
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Dot,
    /// Any other punctuation (`=`, `<`, `;`, ...).
    Symbol(char),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Source text of the token.
    pub text: String,
    /// 0-based byte offset into the source.
    pub offset: usize,
}

impl Token {
    /// Case-insensitive keyword match on bare identifiers.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }

    /// Identifier name, bare or quoted.
    pub fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(s) | TokenKind::QuotedIdent(s) => Some(s),
            _ => None,
        }
    }
}

/// Tokenize `source`. Comments (`-- ...` and `/* ... */`) are skipped. The
/// returned list always ends with an `Eof` token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        if c == b'-' && bytes.get(pos + 1) == Some(&b'-') {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }

        if c == b'/' && bytes.get(pos + 1) == Some(&b'*') {
            let start = pos;
            pos += 2;
            loop {
                if pos + 1 >= bytes.len() {
                    return Err(SyntaxError::new("unterminated comment", "/*", start));
                }
                if bytes[pos] == b'*' && bytes[pos + 1] == b'/' {
                    pos += 2;
                    break;
                }
                pos += 1;
            }
            continue;
        }

        let start = pos;

        if c.is_ascii_alphabetic() || c == b'_' {
            while pos < bytes.len()
                && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_' || bytes[pos] == b'$')
            {
                pos += 1;
            }
            let text = &source[start..pos];
            tokens.push(token(TokenKind::Ident(text.to_string()), text, start));
            continue;
        }

        if c.is_ascii_digit() || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit))
        {
            pos = scan_number(bytes, pos);
            let text = &source[start..pos];
            let value: f64 = text
                .parse()
                .map_err(|_| SyntaxError::new("malformed number", text, start))?;
            tokens.push(token(TokenKind::Number(value), text, start));
            continue;
        }

        if c == b'\'' || c == b'"' {
            let (value, end) = scan_quoted(source, pos, c)?;
            pos = end;
            let kind = if c == b'\'' {
                TokenKind::Str(value)
            } else {
                TokenKind::QuotedIdent(value)
            };
            tokens.push(token(kind, &source[start..pos], start));
            continue;
        }

        let kind = match c {
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b',' => TokenKind::Comma,
            b'.' => TokenKind::Dot,
            _ => {
                // Multi-byte characters become a single symbol token.
                let ch = source[pos..].chars().next().unwrap_or('\u{fffd}');
                pos += ch.len_utf8();
                tokens.push(token(TokenKind::Symbol(ch), &source[start..pos], start));
                continue;
            }
        };
        pos += 1;
        tokens.push(token(kind, &source[start..pos], start));
    }

    tokens.push(token(TokenKind::Eof, "", source.len()));
    Ok(tokens)
}

fn token(kind: TokenKind, text: &str, offset: usize) -> Token {
    Token {
        kind,
        text: text.to_string(),
        offset,
    }
}

fn scan_number(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        let mut exp = pos + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            pos = exp;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
        }
    }
    pos
}

/// Scan a quoted run starting at `start`; a doubled quote is an escaped quote.
fn scan_quoted(source: &str, start: usize, quote: u8) -> Result<(String, usize), SyntaxError> {
    let bytes = source.as_bytes();
    let mut value = String::new();
    let mut pos = start + 1;
    let mut run_start = pos;

    loop {
        if pos >= bytes.len() {
            let what = if quote == b'\'' {
                "unterminated string literal"
            } else {
                "unterminated quoted identifier"
            };
            return Err(SyntaxError::new(what, &source[start..], start));
        }
        if bytes[pos] == quote {
            value.push_str(&source[run_start..pos]);
            if bytes.get(pos + 1) == Some(&quote) {
                value.push(quote as char);
                pos += 2;
                run_start = pos;
                continue;
            }
            return Ok((value, pos + 1));
        }
        pos += 1;
    }
}
