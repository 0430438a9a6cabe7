//! Top-level `const` declarations that double as configuration, e.g.
//! `const bool colortex2MipmapEnabled = true;`, and the registry that routes
//! them to typed handlers.
use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::lexer::{Token, TokenKind, Tokens};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Vec4([f32; 4]),
}

impl ConstValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Vec4(_) => "vec4",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstDirective {
    pub name: String,
    pub value: ConstValue,
    /// Byte offset of the `const` keyword.
    pub location: usize,
}

/// Scans `text` for `const <type> <name> = <literal>;` at brace depth zero,
/// in source order. Declarations whose initializer is not a plain literal are
/// skipped; shaders declare plenty of computed constants.
pub fn find_directives(text: &str) -> Vec<ConstDirective> {
    let tokens: Vec<Token<'_>> = Tokens::new(text).collect();
    let mut directives = Vec::new();
    let mut depth = 0usize;
    let mut index = 0;

    while index < tokens.len() {
        let token = tokens[index];
        if token.is_punct("{") {
            depth += 1;
        } else if token.is_punct("}") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && token.is_ident("const") {
            if let Some((directive, consumed)) = parse_declaration(&tokens[index..]) {
                directives.push(directive);
                index += consumed;
                continue;
            }
        }
        index += 1;
    }

    directives
}

/// Parses a declaration starting at a `const` token. Returns the directive
/// and the number of tokens consumed.
fn parse_declaration(tokens: &[Token<'_>]) -> Option<(ConstDirective, usize)> {
    let ty = tokens.get(1).filter(|token| token.kind == TokenKind::Ident)?;
    let name = tokens.get(2).filter(|token| token.kind == TokenKind::Ident)?;
    if !tokens.get(3)?.is_punct("=") {
        return None;
    }

    let literal = &tokens[4..];
    let (value, used) = match ty.text {
        "bool" => (ConstValue::Bool(parse_bool(literal.first()?)?), 1),
        "int" => {
            let (value, used) = signed_number(literal)?;
            (ConstValue::Int(parse_int(value.0, value.1)?), used)
        }
        "float" => {
            let (value, used) = signed_number(literal)?;
            (ConstValue::Float(parse_float(value.0, value.1)?), used)
        }
        "vec4" => {
            let (components, used) = parse_vec4(literal)?;
            (ConstValue::Vec4(components), used)
        }
        _ => return None,
    };

    if !literal.get(used)?.is_punct(";") {
        debug!(name = name.text, "skipping const declaration without terminating ';'");
        return None;
    }

    Some((
        ConstDirective {
            name: name.text.to_string(),
            value,
            location: tokens[0].offset,
        },
        4 + used + 1,
    ))
}

fn parse_bool(token: &Token<'_>) -> Option<bool> {
    match token.text {
        "true" if token.kind == TokenKind::Ident => Some(true),
        "false" if token.kind == TokenKind::Ident => Some(false),
        _ => None,
    }
}

/// Reads an optional sign followed by a number token. Returns
/// `(negative, digits)` and the tokens used.
fn signed_number<'a>(tokens: &[Token<'a>]) -> Option<((bool, &'a str), usize)> {
    let first = tokens.first()?;
    let (negative, number, used) = if first.is_punct("-") || first.is_punct("+") {
        (first.text == "-", tokens.get(1)?, 2)
    } else {
        (false, first, 1)
    };
    if number.kind != TokenKind::Number {
        return None;
    }
    Some(((negative, number.text), used))
}

fn parse_int(negative: bool, text: &str) -> Option<i32> {
    let digits = text.strip_suffix(['u', 'U']).unwrap_or(text);
    let magnitude: i64 = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        // Hex literals may use the full 32-bit pattern.
        i64::from(u32::from_str_radix(hex, 16).ok()? as i32)
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse().ok()?
    };
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).ok()
}

fn parse_float(negative: bool, text: &str) -> Option<f32> {
    let digits = text
        .strip_suffix("lf")
        .or_else(|| text.strip_suffix("LF"))
        .or_else(|| text.strip_suffix(['f', 'F']))
        .unwrap_or(text);
    if digits.starts_with("0x") || digits.starts_with("0X") {
        return None;
    }
    let value: f32 = digits.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

fn parse_vec4(tokens: &[Token<'_>]) -> Option<([f32; 4], usize)> {
    if !tokens.first()?.is_ident("vec4") || !tokens.get(1)?.is_punct("(") {
        return None;
    }

    let mut components = [0.0f32; 4];
    let mut pos = 2;
    for (slot, component) in components.iter_mut().enumerate() {
        let ((negative, text), used) = signed_number(&tokens[pos..])?;
        *component = parse_float(negative, text)?;
        pos += used;
        let separator = if slot == 3 { ")" } else { "," };
        if !tokens.get(pos)?.is_punct(separator) {
            return None;
        }
        pos += 1;
    }

    Some((components, pos))
}

/// Handler registered for one configuration key. The variant fixes the
/// literal type the key accepts.
pub enum DirectiveHandler<'a> {
    Bool(Box<dyn FnMut(bool) + 'a>),
    Int(Box<dyn FnMut(i32) + 'a>),
    Float(Box<dyn FnMut(f32) + 'a>),
    Vec4(Box<dyn FnMut([f32; 4]) + 'a>),
}

impl DirectiveHandler<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Vec4(_) => "vec4",
        }
    }
}

impl fmt::Debug for DirectiveHandler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectiveHandler::{}", self.type_name())
    }
}

/// Maps configuration key names to typed handlers. Directives for names that
/// were never registered are ignored.
#[derive(Debug, Default)]
pub struct DispatchingDirectiveHolder<'a> {
    handlers: HashMap<String, DirectiveHandler<'a>>,
}

impl<'a> DispatchingDirectiveHolder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_const_bool_directive(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut(bool) + 'a,
    ) {
        self.register(name.into(), DirectiveHandler::Bool(Box::new(handler)));
    }

    pub fn accept_const_int_directive(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut(i32) + 'a,
    ) {
        self.register(name.into(), DirectiveHandler::Int(Box::new(handler)));
    }

    pub fn accept_const_float_directive(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut(f32) + 'a,
    ) {
        self.register(name.into(), DirectiveHandler::Float(Box::new(handler)));
    }

    pub fn accept_const_vec4_directive(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut([f32; 4]) + 'a,
    ) {
        self.register(name.into(), DirectiveHandler::Vec4(Box::new(handler)));
    }

    fn register(&mut self, name: String, handler: DirectiveHandler<'a>) {
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(name, "replacing const directive handler");
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Feeds one directive to its handler. Returns `true` when a handler
    /// consumed it.
    pub fn process_directive(&mut self, directive: &ConstDirective) -> bool {
        let Some(handler) = self.handlers.get_mut(&directive.name) else {
            return false;
        };

        match (handler, directive.value) {
            (DirectiveHandler::Bool(handle), ConstValue::Bool(value)) => handle(value),
            (DirectiveHandler::Int(handle), ConstValue::Int(value)) => handle(value),
            (DirectiveHandler::Float(handle), ConstValue::Float(value)) => handle(value),
            // GLSL converts int initializers of float constants implicitly.
            (DirectiveHandler::Float(handle), ConstValue::Int(value)) => handle(value as f32),
            (DirectiveHandler::Vec4(handle), ConstValue::Vec4(value)) => handle(value),
            (handler, value) => {
                warn!(
                    name = %directive.name,
                    expected = handler.type_name(),
                    found = value.type_name(),
                    "ignoring const directive with mismatched type"
                );
                return false;
            }
        }
        true
    }

    pub fn process_all<'d>(&mut self, directives: impl IntoIterator<Item = &'d ConstDirective>) {
        for directive in directives {
            self.process_directive(directive);
        }
    }
}
