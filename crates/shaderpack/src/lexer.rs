//! Character and token helpers shared by the preprocessor and the const
//! directive scanner. Everything here works on byte offsets into the original
//! text so callers can report locations without re-scanning.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident,
    Number,
    Punct,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub offset: usize,
}

impl Token<'_> {
    pub fn is_punct(&self, punct: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == punct
    }

    pub fn is_ident(&self, ident: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == ident
    }
}

/// Two-character operators, longest match first.
const PUNCTUATORS: [&str; 9] = ["##", "&&", "||", "==", "!=", "<=", ">=", "<<", ">>"];

pub(crate) fn is_ident_start(byte: u8) -> bool {
    byte == b'_' || byte.is_ascii_alphabetic()
}

pub(crate) fn is_ident_continue(byte: u8) -> bool {
    byte == b'_' || byte.is_ascii_alphanumeric()
}

/// Returns the end of the comment starting at `pos`, or `None` if no comment
/// starts there. Unterminated block comments run to the end of `text`.
pub(crate) fn comment_end(text: &str, pos: usize) -> Option<usize> {
    let rest = &text.as_bytes()[pos..];
    if rest.starts_with(b"//") {
        let end = text[pos..].find('\n').map_or(text.len(), |nl| pos + nl);
        Some(end)
    } else if rest.starts_with(b"/*") {
        let end = text[pos + 2..]
            .find("*/")
            .map_or(text.len(), |close| pos + 2 + close + 2);
        Some(end)
    } else {
        None
    }
}

/// End of the identifier starting at `pos`.
pub(crate) fn ident_end(bytes: &[u8], pos: usize) -> usize {
    let mut end = pos;
    while end < bytes.len() && is_ident_continue(bytes[end]) {
        end += 1;
    }
    end
}

/// End of the preprocessing number starting at `pos`, so that `1e-5` or
/// `0x1Fu` stay a single token.
pub(crate) fn number_end(bytes: &[u8], pos: usize) -> usize {
    let mut end = pos;
    while end < bytes.len() {
        let byte = bytes[end];
        let exponent_sign = (byte == b'+' || byte == b'-')
            && end > pos
            && matches!(bytes[end - 1], b'e' | b'E')
            && !is_hex_literal(&bytes[pos..end]);
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'.' || exponent_sign {
            end += 1;
        } else {
            break;
        }
    }
    end
}

fn is_hex_literal(prefix: &[u8]) -> bool {
    prefix.len() >= 2 && prefix[0] == b'0' && matches!(prefix[1], b'x' | b'X')
}

pub(crate) fn starts_number(bytes: &[u8], pos: usize) -> bool {
    bytes[pos].is_ascii_digit()
        || (bytes[pos] == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit))
}

/// Tokenizer that drops whitespace and comments.
pub(crate) struct Tokens<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Tokens<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.text.as_bytes();
        loop {
            while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos >= bytes.len() {
                return None;
            }
            match comment_end(self.text, self.pos) {
                Some(end) => self.pos = end,
                None => break,
            }
        }

        let start = self.pos;
        let (kind, end) = if is_ident_start(bytes[start]) {
            (TokenKind::Ident, ident_end(bytes, start))
        } else if starts_number(bytes, start) {
            (TokenKind::Number, number_end(bytes, start))
        } else if let Some(punct) = PUNCTUATORS
            .iter()
            .find(|punct| bytes[start..].starts_with(punct.as_bytes()))
        {
            (TokenKind::Punct, start + punct.len())
        } else if bytes[start].is_ascii() {
            (TokenKind::Punct, start + 1)
        } else {
            let width = self.text[start..].chars().next().map_or(1, char::len_utf8);
            (TokenKind::Other, start + width)
        };

        self.pos = end;
        Some(Token {
            kind,
            text: &self.text[start..end],
            offset: start,
        })
    }
}

/// Replaces every comment in `text` with a single space.
pub(crate) fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    let mut copied = 0;
    let bytes = text.as_bytes();
    while pos < bytes.len() {
        if let Some(end) = comment_end(text, pos) {
            out.push_str(&text[copied..pos]);
            out.push(' ');
            pos = end;
            copied = end;
        } else {
            pos += 1;
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// Offset of the `/*` left open at the end of `line`, for a line that starts
/// outside any comment.
pub(crate) fn unclosed_block_comment(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos..].starts_with(b"//") {
            return None;
        }
        if bytes[pos..].starts_with(b"/*") {
            match line[pos + 2..].find("*/") {
                Some(close) => pos += 2 + close + 2,
                None => return Some(pos),
            }
        } else {
            pos += 1;
        }
    }
    None
}

/// Tracks whether a block comment is still open after `line`, given whether
/// one was open at its start.
pub(crate) fn block_comment_open_after(line: &str, mut in_block: bool) -> bool {
    let bytes = line.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        if in_block {
            match line[pos..].find("*/") {
                Some(close) => {
                    pos += close + 2;
                    in_block = false;
                }
                None => return true,
            }
        } else if bytes[pos..].starts_with(b"//") {
            return false;
        } else if bytes[pos..].starts_with(b"/*") {
            in_block = true;
            pos += 2;
        } else {
            pos += 1;
        }
    }
    in_block
}
