//! Runs the C-preprocessor subset GLSL relies on and hoists the `#version`
//! and `#extension` directives that survive conditional compilation to the
//! top of the output, where strict drivers insist on finding them.
//!
//! Types:
//!
//! - `Preprocessor` carries predefined macros and an optional
//!   `IncludeProvider`; it is reusable across stages and threads.
//! - `PreprocessedSource` keeps the hoist block and the body apart so callers
//!   can inspect either before joining them with `to_source`.
//!
//! Functions:
//!
//! - `Preprocessor::run` rejects sources that contain the reserved hoist
//!   markers, rewrites hoisted directives into marker warnings, expands
//!   macros, evaluates conditionals, and collects the marker warnings that
//!   were reached back into the hoist block.
//! - `glsl_preprocess_source` is the one-shot form producing the final text.
use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::error::ShaderPackError;
use crate::lexer::{
    block_comment_open_after, ident_end, is_ident_continue, is_ident_start, number_end,
    starts_number, strip_comments, unclosed_block_comment, Token, TokenKind, Tokens,
};

/// Reserved identifier standing in for `#version` while the source is
/// preprocessed. Identifiers containing `__` are reserved in GLSL.
pub const VERSION_MARKER: &str = "__SHADERPACK_HOIST_VERSION__";
/// Reserved identifier standing in for `#extension`.
pub const EXTENSION_MARKER: &str = "__SHADERPACK_HOIST_EXTENSION__";

const MAX_INCLUDE_DEPTH: usize = 32;
const MAX_EXPANSION_DEPTH: usize = 256;

/// Supplies the text of `#include` targets. Without one, `#include` fails.
pub trait IncludeProvider {
    fn include(&self, path: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessedSource {
    hoist: Vec<String>,
    body: String,
}

impl PreprocessedSource {
    /// Hoisted `#version`/`#extension` lines in original order, duplicates
    /// included.
    pub fn hoist(&self) -> &[String] {
        &self.hoist
    }

    pub fn hoist_block(&self) -> String {
        self.hoist.join("\n")
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn to_source(&self) -> String {
        format!("{}\n{}\n", self.hoist_block(), self.body)
    }
}

#[derive(Default)]
pub struct Preprocessor {
    defines: Vec<(String, String)>,
    includes: Option<Box<dyn IncludeProvider + Send + Sync>>,
}

impl fmt::Debug for Preprocessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preprocessor")
            .field("defines", &self.defines)
            .field("includes", &self.includes.is_some())
            .finish()
    }
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predefines an object-like macro, as if `#define name value` preceded
    /// every source.
    pub fn define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), value.into()));
        self
    }

    pub fn with_includes(mut self, provider: impl IncludeProvider + Send + Sync + 'static) -> Self {
        self.includes = Some(Box::new(provider));
        self
    }

    pub fn run(&self, source: &str) -> Result<PreprocessedSource, ShaderPackError> {
        reject_markers(source)?;

        let mut state = State::new(self);
        for (name, value) in &self.defines {
            state.macros.insert(
                name.clone(),
                Macro {
                    params: None,
                    body: value.clone(),
                },
            );
        }

        state.process(source, 0)?;
        let processed = state.finish();
        debug!(
            hoisted = processed.hoist.len(),
            body_bytes = processed.body.len(),
            "preprocessed shader stage"
        );
        Ok(processed)
    }
}

/// Preprocesses `source` with default settings and returns the hoist block
/// followed by the body.
pub fn glsl_preprocess_source(source: &str) -> Result<String, ShaderPackError> {
    Preprocessor::new()
        .run(source)
        .map(|processed| processed.to_source())
}

fn reject_markers(source: &str) -> Result<(), ShaderPackError> {
    for marker in [VERSION_MARKER, EXTENSION_MARKER] {
        if source.contains(marker) {
            return Err(ShaderPackError::InputRejected { marker });
        }
    }
    Ok(())
}

/// Rewrites `#version`/`#extension` lines outside block comments into
/// `#warning <marker> ...` so they only come back out of the preprocessor when
/// their conditional branch is taken.
fn protect_hoisted_directives(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    let mut in_block = false;

    for line in text.split_inclusive('\n') {
        let starts_in_comment = in_block;
        in_block = block_comment_open_after(line, in_block);

        if !starts_in_comment {
            let trimmed = line.trim_start();
            if let Some(directive) = trimmed.strip_prefix('#').map(str::trim_start) {
                let indent = &line[..line.len() - trimmed.len()];
                let replacement = [("version", VERSION_MARKER), ("extension", EXTENSION_MARKER)]
                    .into_iter()
                    .find_map(|(keyword, marker)| {
                        strip_keyword(directive, keyword).map(|rest| (marker, rest))
                    });
                if let Some((marker, rest)) = replacement {
                    out.push_str(indent);
                    out.push_str("#warning ");
                    out.push_str(marker);
                    out.push_str(rest);
                    continue;
                }
            }
        }

        out.push_str(line);
    }

    out
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(keyword)?;
    match rest.bytes().next() {
        Some(byte) if is_ident_continue(byte) => None,
        _ => Some(rest),
    }
}

struct LogicalLine {
    number: usize,
    text: String,
    /// Physical lines folded into this one by backslash continuations.
    spliced: usize,
}

fn logical_lines(text: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start = 1;
    let mut spliced = 0;

    for (index, raw) in text.lines().enumerate() {
        if spliced == 0 {
            start = index + 1;
        }
        if let Some(stripped) = raw.strip_suffix('\\') {
            current.push_str(stripped);
            spliced += 1;
            continue;
        }
        current.push_str(raw);
        lines.push(LogicalLine {
            number: start,
            text: std::mem::take(&mut current),
            spliced,
        });
        spliced = 0;
    }

    if spliced > 0 {
        lines.push(LogicalLine {
            number: start,
            text: current,
            spliced: spliced - 1,
        });
    }

    lines
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Macro {
    params: Option<Vec<String>>,
    body: String,
}

#[derive(Debug)]
struct Conditional {
    parent_active: bool,
    branch_taken: bool,
    active: bool,
    seen_else: bool,
    line: usize,
}

struct State<'p> {
    options: &'p Preprocessor,
    macros: HashMap<String, Macro>,
    conditions: Vec<Conditional>,
    /// Conditional depth at which the file being processed started.
    file_base: usize,
    out: Vec<String>,
    hoist: Vec<String>,
}

impl<'p> State<'p> {
    fn new(options: &'p Preprocessor) -> Self {
        Self {
            options,
            macros: HashMap::new(),
            conditions: Vec::new(),
            file_base: 0,
            out: Vec::new(),
            hoist: Vec::new(),
        }
    }

    fn active(&self) -> bool {
        self.conditions.last().map_or(true, |cond| cond.active)
    }

    fn process(&mut self, text: &str, depth: usize) -> Result<(), ShaderPackError> {
        let protected = protect_hoisted_directives(text);
        let outer_base = self.file_base;
        self.file_base = self.conditions.len();

        let mut in_block = false;
        let mut last_line = 0;
        let mut lines = logical_lines(&protected).into_iter().peekable();
        while let Some(line) = lines.next() {
            last_line = line.number;
            let starts_in_comment = in_block;
            let trimmed = line.text.trim_start();

            if !starts_in_comment && trimmed.starts_with('#') {
                let open_comment = unclosed_block_comment(&line.text);
                in_block = open_comment.is_some();
                let emitted = self.directive(&trimmed[1..], line.number, depth)?;
                // A comment opened on a directive line continues into the
                // body, so its opener has to be emitted with it.
                let tail = open_comment
                    .filter(|_| self.active())
                    .map(|start| &line.text[start..]);
                self.out.push(match (emitted, tail) {
                    (Some(text), Some(tail)) => format!("{text} {tail}"),
                    (Some(text), None) => text,
                    (None, Some(tail)) => tail.to_string(),
                    (None, None) => String::new(),
                });
            } else {
                in_block = block_comment_open_after(&line.text, starts_in_comment);
                if self.active() {
                    let mut text = line.text.clone();
                    let mut joined = 0;
                    while self.open_invocation(&text, starts_in_comment) {
                        let Some(next) =
                            lines.next_if(|next| !next.text.trim_start().starts_with('#'))
                        else {
                            break;
                        };
                        in_block = block_comment_open_after(&next.text, in_block);
                        text.push('\n');
                        text.push_str(&next.text);
                        joined += 1 + next.spliced;
                    }

                    let expanded = self.expand(&text, starts_in_comment, line.number)?;
                    let emitted_lines = expanded.matches('\n').count();
                    self.out.push(expanded);
                    for _ in emitted_lines..joined {
                        self.out.push(String::new());
                    }
                } else {
                    self.out.push(String::new());
                }
            }

            for _ in 0..line.spliced {
                self.out.push(String::new());
            }
        }

        if let Some(open) = self.conditions.get(self.file_base) {
            return Err(ShaderPackError::preprocess(
                last_line.max(open.line),
                format!("unterminated conditional opened at line {}", open.line),
            ));
        }
        self.file_base = outer_base;
        Ok(())
    }

    fn finish(self) -> PreprocessedSource {
        PreprocessedSource {
            hoist: self.hoist,
            body: trim_blank_lines(&self.out),
        }
    }

    /// Handles one directive (text after `#`). Returns a line to keep in the
    /// output for directives the driver still needs to see.
    fn directive(
        &mut self,
        raw: &str,
        line: usize,
        depth: usize,
    ) -> Result<Option<String>, ShaderPackError> {
        let stripped = strip_comments(raw);
        let text = stripped.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let name_end = ident_end(text.as_bytes(), 0);
        if name_end == 0 {
            if self.active() {
                return Err(ShaderPackError::preprocess(
                    line,
                    format!("invalid preprocessing directive '#{text}'"),
                ));
            }
            return Ok(None);
        }
        let name = &text[..name_end];
        let rest = text[name_end..].trim();

        match name {
            "if" => {
                let condition = self.active() && self.evaluate(rest, line)?;
                self.push_conditional(condition, line);
                Ok(None)
            }
            "ifdef" | "ifndef" => {
                let condition = if self.active() {
                    let defined = self.is_defined(macro_name(rest, name, line)?);
                    defined == (name == "ifdef")
                } else {
                    false
                };
                self.push_conditional(condition, line);
                Ok(None)
            }
            "elif" => {
                let (parent_active, branch_taken, seen_else) = {
                    let top = self.top_conditional("#elif", line)?;
                    (top.parent_active, top.branch_taken, top.seen_else)
                };
                if seen_else {
                    return Err(ShaderPackError::preprocess(line, "#elif after #else"));
                }
                let condition = parent_active && !branch_taken && self.evaluate(rest, line)?;
                let top = self.top_conditional("#elif", line)?;
                top.active = condition;
                top.branch_taken |= condition;
                Ok(None)
            }
            "else" => {
                let top = self.top_conditional("#else", line)?;
                if top.seen_else {
                    return Err(ShaderPackError::preprocess(line, "#else after #else"));
                }
                top.seen_else = true;
                top.active = top.parent_active && !top.branch_taken;
                top.branch_taken = true;
                Ok(None)
            }
            "endif" => {
                self.top_conditional("#endif", line)?;
                self.conditions.pop();
                Ok(None)
            }
            _ if !self.active() => Ok(None),
            "define" => {
                self.define(rest, line)?;
                Ok(None)
            }
            "undef" => {
                let target = macro_name(rest, name, line)?;
                self.macros.remove(target);
                Ok(None)
            }
            "include" => {
                self.include(rest, line, depth)?;
                Ok(None)
            }
            "error" => Err(ShaderPackError::preprocess(line, format!("#error {rest}"))),
            "warning" => {
                self.warning(rest, line);
                Ok(None)
            }
            // Only reached when a line continuation splits the keyword, e.g.
            // `#ver\` + `sion 330`; whole keywords arrive as marker warnings.
            "version" => {
                self.hoist.push(hoisted_line("#version", rest));
                Ok(None)
            }
            "extension" => {
                self.hoist.push(hoisted_line("#extension", rest));
                Ok(None)
            }
            "pragma" | "line" => Ok(Some(hoisted_line(&format!("#{name}"), rest))),
            other => {
                warn!(line, directive = other, "passing through unknown preprocessor directive");
                Ok(Some(format!("#{text}")))
            }
        }
    }

    fn push_conditional(&mut self, condition: bool, line: usize) {
        let parent_active = self.active();
        let active = parent_active && condition;
        self.conditions.push(Conditional {
            parent_active,
            branch_taken: active,
            active,
            seen_else: false,
            line,
        });
    }

    fn top_conditional(
        &mut self,
        directive: &str,
        line: usize,
    ) -> Result<&mut Conditional, ShaderPackError> {
        if self.conditions.len() <= self.file_base {
            return Err(ShaderPackError::preprocess(
                line,
                format!("unmatched {directive}"),
            ));
        }
        self.conditions
            .last_mut()
            .ok_or_else(|| ShaderPackError::preprocess(line, format!("unmatched {directive}")))
    }

    fn is_defined(&self, name: &str) -> bool {
        name == "__LINE__" || self.macros.contains_key(name)
    }

    fn define(&mut self, rest: &str, line: usize) -> Result<(), ShaderPackError> {
        let bytes = rest.as_bytes();
        if bytes.is_empty() || !is_ident_start(bytes[0]) {
            return Err(ShaderPackError::preprocess(
                line,
                "macro name must be an identifier",
            ));
        }
        let name_end = ident_end(bytes, 0);
        let name = &rest[..name_end];
        if name == "defined" {
            return Err(ShaderPackError::preprocess(line, "'defined' cannot be a macro name"));
        }

        let after = &rest[name_end..];
        let definition = if let Some(params) = after.strip_prefix('(') {
            let close = params.find(')').ok_or_else(|| {
                ShaderPackError::preprocess(line, format!("missing ')' in parameters of '{name}'"))
            })?;
            let list = params[..close].trim();
            let names: Vec<String> = if list.is_empty() {
                Vec::new()
            } else {
                list.split(',').map(|param| param.trim().to_string()).collect()
            };
            for param in &names {
                let valid = param.as_bytes().first().is_some_and(|b| is_ident_start(*b))
                    && ident_end(param.as_bytes(), 0) == param.len();
                if !valid {
                    return Err(ShaderPackError::preprocess(
                        line,
                        format!("invalid parameter '{param}' in macro '{name}'"),
                    ));
                }
            }
            Macro {
                params: Some(names),
                body: params[close + 1..].trim().to_string(),
            }
        } else {
            Macro {
                params: None,
                body: after.trim().to_string(),
            }
        };

        if let Some(previous) = self.macros.insert(name.to_string(), definition) {
            if self.macros.get(name) != Some(&previous) {
                debug!(line, name, "macro redefined");
            }
        }
        Ok(())
    }

    fn include(&mut self, rest: &str, line: usize, depth: usize) -> Result<(), ShaderPackError> {
        let path = include_path(rest).ok_or_else(|| {
            ShaderPackError::preprocess(line, format!("expected \"file\" or <file> after #include, found '{rest}'"))
        })?;

        let options = self.options;
        let Some(provider) = options.includes.as_deref() else {
            return Err(ShaderPackError::preprocess(
                line,
                format!("#include \"{path}\" is not enabled"),
            ));
        };
        if depth >= MAX_INCLUDE_DEPTH {
            return Err(ShaderPackError::preprocess(
                line,
                format!("#include \"{path}\" exceeds the maximum nesting depth of {MAX_INCLUDE_DEPTH}"),
            ));
        }

        let contents = provider.include(path).map_err(|err| {
            ShaderPackError::preprocess(line, format!("failed to include \"{path}\": {err:#}"))
        })?;
        reject_markers(&contents)?;
        debug!(line, path, "processing included source");
        self.process(&contents, depth + 1)
    }

    fn warning(&mut self, rest: &str, line: usize) {
        if let Some(args) = strip_keyword(rest, VERSION_MARKER) {
            self.hoist.push(hoisted_line("#version", args));
        } else if let Some(args) = strip_keyword(rest, EXTENSION_MARKER) {
            self.hoist.push(hoisted_line("#extension", args));
        } else {
            warn!(line, message = rest, "#warning in shader source");
        }
    }

    fn evaluate(&self, expression: &str, line: usize) -> Result<bool, ShaderPackError> {
        let resolved = self.replace_defined(expression, line)?;
        let expanded = self.expand(&resolved, false, line)?;
        let tokens: Vec<Token<'_>> = Tokens::new(&expanded).collect();
        if tokens.is_empty() {
            return Err(ShaderPackError::preprocess(line, "#if with no expression"));
        }

        let mut parser = ExprParser {
            tokens: &tokens,
            pos: 0,
            line,
        };
        let value = parser.conditional(true)?;
        if let Some(extra) = tokens.get(parser.pos) {
            return Err(ShaderPackError::preprocess(
                line,
                format!("unexpected '{}' in #if expression", extra.text),
            ));
        }
        Ok(value != 0)
    }

    /// Resolves `defined NAME` / `defined(NAME)` before macro expansion can
    /// touch the operand.
    fn replace_defined(&self, expression: &str, line: usize) -> Result<String, ShaderPackError> {
        let tokens: Vec<Token<'_>> = Tokens::new(expression).collect();
        let mut out = String::with_capacity(expression.len());
        let mut index = 0;

        while index < tokens.len() {
            let token = tokens[index];
            if !token.is_ident("defined") {
                out.push_str(token.text);
                out.push(' ');
                index += 1;
                continue;
            }

            let (name, consumed) = match tokens.get(index + 1) {
                Some(next) if next.kind == TokenKind::Ident => (next.text, 2),
                Some(next) if next.is_punct("(") => match (tokens.get(index + 2), tokens.get(index + 3)) {
                    (Some(name), Some(close)) if name.kind == TokenKind::Ident && close.is_punct(")") => {
                        (name.text, 4)
                    }
                    _ => {
                        return Err(ShaderPackError::preprocess(
                            line,
                            "malformed 'defined' operator in #if",
                        ))
                    }
                },
                _ => {
                    return Err(ShaderPackError::preprocess(
                        line,
                        "'defined' requires a macro name",
                    ))
                }
            };

            out.push_str(if self.is_defined(name) { "1 " } else { "0 " });
            index += consumed;
        }

        Ok(out)
    }

    /// Whether `text` ends inside the argument list of a function-like macro
    /// call, in which case the call continues on the next line.
    fn open_invocation(&self, text: &str, in_comment: bool) -> bool {
        let start = if in_comment {
            match text.find("*/") {
                Some(close) => close + 2,
                None => return false,
            }
        } else {
            0
        };

        let tokens: Vec<Token<'_>> = Tokens::new(&text[start..]).collect();
        let mut index = 0;
        while index < tokens.len() {
            let token = tokens[index];
            let function_like = token.kind == TokenKind::Ident
                && self
                    .macros
                    .get(token.text)
                    .is_some_and(|definition| definition.params.is_some());
            if !function_like || !tokens.get(index + 1).is_some_and(|next| next.is_punct("(")) {
                index += 1;
                continue;
            }

            let mut depth = 0usize;
            let mut close = None;
            for (offset, token) in tokens[index + 1..].iter().enumerate() {
                if token.is_punct("(") {
                    depth += 1;
                } else if token.is_punct(")") {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(index + 1 + offset);
                        break;
                    }
                }
            }
            match close {
                Some(end) => index = end + 1,
                None => return true,
            }
        }
        false
    }

    fn expand(&self, text: &str, in_comment: bool, line: usize) -> Result<String, ShaderPackError> {
        let mut hidden = Vec::new();
        self.expand_with(text, in_comment, line, &mut hidden, 0)
    }

    /// Expands macros in `text`, copying comments through untouched. `hidden`
    /// holds the macros currently being expanded so self-references stay
    /// literal.
    fn expand_with(
        &self,
        text: &str,
        mut in_comment: bool,
        line: usize,
        hidden: &mut Vec<String>,
        depth: usize,
    ) -> Result<String, ShaderPackError> {
        if depth > MAX_EXPANSION_DEPTH {
            return Err(ShaderPackError::preprocess(line, "macro expansion is too deeply nested"));
        }

        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len());
        let mut pos = 0;

        while pos < bytes.len() {
            if in_comment {
                match text[pos..].find("*/") {
                    Some(close) => {
                        let end = pos + close + 2;
                        out.push_str(&text[pos..end]);
                        pos = end;
                        in_comment = false;
                    }
                    None => {
                        out.push_str(&text[pos..]);
                        break;
                    }
                }
                continue;
            }

            if bytes[pos..].starts_with(b"//") {
                let end = text[pos..].find('\n').map_or(text.len(), |nl| pos + nl);
                out.push_str(&text[pos..end]);
                pos = end;
                continue;
            }
            if bytes[pos..].starts_with(b"/*") {
                out.push_str("/*");
                pos += 2;
                in_comment = true;
                continue;
            }

            if is_ident_start(bytes[pos]) {
                let end = ident_end(bytes, pos);
                let ident = &text[pos..end];
                pos = end;

                if ident == "__LINE__" && !self.macros.contains_key(ident) {
                    out.push_str(&line.to_string());
                    continue;
                }

                let Some(definition) = self
                    .macros
                    .get(ident)
                    .filter(|_| !hidden.iter().any(|name| name == ident))
                else {
                    out.push_str(ident);
                    continue;
                };

                let replacement = match &definition.params {
                    None => definition.body.clone(),
                    Some(params) => {
                        let mut look = pos;
                        while look < bytes.len() && bytes[look].is_ascii_whitespace() {
                            look += 1;
                        }
                        if look >= bytes.len() || bytes[look] != b'(' {
                            out.push_str(ident);
                            continue;
                        }
                        let (args, after) = split_arguments(text, look, ident, line)?;
                        pos = after;
                        self.substitute(ident, params, &definition.body, &args, line, hidden, depth)?
                    }
                };

                hidden.push(ident.to_string());
                let expanded = self.expand_with(&replacement, false, line, hidden, depth + 1);
                hidden.pop();
                out.push_str(&expanded?);
                continue;
            }

            if starts_number(bytes, pos) {
                let end = number_end(bytes, pos);
                out.push_str(&text[pos..end]);
                pos = end;
                continue;
            }

            let width = text[pos..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&text[pos..pos + width]);
            pos += width;
        }

        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn substitute(
        &self,
        name: &str,
        params: &[String],
        body: &str,
        args: &[String],
        line: usize,
        hidden: &mut Vec<String>,
        depth: usize,
    ) -> Result<String, ShaderPackError> {
        let args: &[String] = if params.is_empty() && args.len() == 1 && args[0].trim().is_empty() {
            &[]
        } else {
            args
        };
        if args.len() != params.len() {
            return Err(ShaderPackError::preprocess(
                line,
                format!(
                    "macro '{name}' expects {} argument(s), found {}",
                    params.len(),
                    args.len()
                ),
            ));
        }

        let mut expanded_args = Vec::with_capacity(args.len());
        for arg in args {
            expanded_args.push(self.expand_with(arg.trim(), false, line, hidden, depth + 1)?);
        }

        let bytes = body.as_bytes();
        let mut out = String::with_capacity(body.len());
        let mut pos = 0;
        while pos < bytes.len() {
            if is_ident_start(bytes[pos]) {
                let end = ident_end(bytes, pos);
                let ident = &body[pos..end];
                match params.iter().position(|param| param == ident) {
                    Some(index) => {
                        let pasted = out.trim_end().ends_with("##")
                            || body[end..].trim_start().starts_with("##");
                        if pasted {
                            out.push_str(args[index].trim());
                        } else {
                            out.push_str(&expanded_args[index]);
                        }
                    }
                    None => out.push_str(ident),
                }
                pos = end;
            } else if starts_number(bytes, pos) {
                let end = number_end(bytes, pos);
                out.push_str(&body[pos..end]);
                pos = end;
            } else {
                let width = body[pos..].chars().next().map_or(1, char::len_utf8);
                out.push_str(&body[pos..pos + width]);
                pos += width;
            }
        }

        Ok(paste_tokens(&out))
    }
}

/// Splits the argument list of a function-like macro call whose `(` sits at
/// `open`. Returns the raw arguments and the position after the closing `)`.
fn split_arguments(
    text: &str,
    open: usize,
    name: &str,
    line: usize,
) -> Result<(Vec<String>, usize), ShaderPackError> {
    let bytes = text.as_bytes();
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = open + 1;
    let mut pos = open + 1;

    while pos < bytes.len() {
        match bytes[pos] {
            b'(' => depth += 1,
            b')' if depth == 0 => {
                args.push(text[start..pos].to_string());
                return Ok((args, pos + 1));
            }
            b')' => depth -= 1,
            b',' if depth == 0 => {
                args.push(text[start..pos].to_string());
                start = pos + 1;
            }
            _ => {}
        }
        pos += 1;
    }

    Err(ShaderPackError::preprocess(
        line,
        format!("unterminated invocation of macro '{name}'"),
    ))
}

fn paste_tokens(text: &str) -> String {
    if !text.contains("##") {
        return text.to_string();
    }
    let mut pieces = text.split("##").peekable();
    let mut out = pieces.next().unwrap_or_default().trim_end().to_string();
    while let Some(piece) = pieces.next() {
        let piece = piece.trim_start();
        if pieces.peek().is_some() {
            out.push_str(piece.trim_end());
        } else {
            out.push_str(piece);
        }
    }
    out
}

fn macro_name<'a>(rest: &'a str, directive: &str, line: usize) -> Result<&'a str, ShaderPackError> {
    let candidate = rest.split_whitespace().next().unwrap_or_default();
    let bytes = candidate.as_bytes();
    let valid = bytes.first().is_some_and(|b| is_ident_start(*b))
        && ident_end(bytes, 0) == bytes.len();
    if valid {
        Ok(candidate)
    } else {
        Err(ShaderPackError::preprocess(
            line,
            format!("#{directive} requires a macro name"),
        ))
    }
}

fn include_path(rest: &str) -> Option<&str> {
    let (open, close) = match rest.chars().next()? {
        '"' => ('"', '"'),
        '<' => ('<', '>'),
        _ => return None,
    };
    let inner = rest.strip_prefix(open)?;
    let end = inner.find(close)?;
    Some(&inner[..end]).filter(|path| !path.is_empty())
}

fn hoisted_line(directive: &str, args: &str) -> String {
    let args = args.trim();
    if args.is_empty() {
        directive.to_string()
    } else {
        format!("{directive} {args}")
    }
}

fn trim_blank_lines(lines: &[String]) -> String {
    let Some(first) = lines.iter().position(|line| !line.trim().is_empty()) else {
        return String::new();
    };
    let last = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .unwrap_or(first);
    lines[first..=last].join("\n")
}

struct ExprParser<'t> {
    tokens: &'t [Token<'t>],
    pos: usize,
    line: usize,
}

impl ExprParser<'_> {
    fn error(&self, message: impl Into<String>) -> ShaderPackError {
        ShaderPackError::preprocess(self.line, message)
    }

    fn eat(&mut self, punct: &str) -> bool {
        if self.tokens.get(self.pos).is_some_and(|token| token.is_punct(punct)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Identifiers only fail the expression when they would be evaluated, so
    /// `defined(X) && X > 1` works with `X` undefined.
    fn conditional(&mut self, evaluate: bool) -> Result<i64, ShaderPackError> {
        let condition = self.binary(1, evaluate)?;
        if !self.eat("?") {
            return Ok(condition);
        }
        let when_true = self.conditional(evaluate && condition != 0)?;
        if !self.eat(":") {
            return Err(self.error("expected ':' in conditional expression"));
        }
        let when_false = self.conditional(evaluate && condition == 0)?;
        Ok(if condition != 0 { when_true } else { when_false })
    }

    fn binary(&mut self, min_precedence: u8, evaluate: bool) -> Result<i64, ShaderPackError> {
        let mut lhs = self.unary(evaluate)?;

        while let Some(token) = self.tokens.get(self.pos).copied() {
            let Some(precedence) = binary_precedence(&token) else {
                break;
            };
            if precedence < min_precedence {
                break;
            }
            self.pos += 1;

            let rhs_evaluate = match token.text {
                "&&" => evaluate && lhs != 0,
                "||" => evaluate && lhs == 0,
                _ => evaluate,
            };
            let rhs = self.binary(precedence + 1, rhs_evaluate)?;
            lhs = self.apply(token.text, lhs, rhs, evaluate)?;
        }

        Ok(lhs)
    }

    fn unary(&mut self, evaluate: bool) -> Result<i64, ShaderPackError> {
        let Some(token) = self.tokens.get(self.pos).copied() else {
            return Err(self.error("unexpected end of #if expression"));
        };
        self.pos += 1;

        match token.kind {
            TokenKind::Punct => match token.text {
                "!" => Ok(i64::from(self.unary(evaluate)? == 0)),
                "~" => Ok(!self.unary(evaluate)?),
                "-" => Ok(self.unary(evaluate)?.wrapping_neg()),
                "+" => self.unary(evaluate),
                "(" => {
                    let value = self.conditional(evaluate)?;
                    if !self.eat(")") {
                        return Err(self.error("missing ')' in #if expression"));
                    }
                    Ok(value)
                }
                other => Err(self.error(format!("unexpected '{other}' in #if expression"))),
            },
            TokenKind::Number => parse_int_literal(token.text).ok_or_else(|| {
                self.error(format!("invalid integer literal '{}' in #if", token.text))
            }),
            TokenKind::Ident if evaluate => Err(self.error(format!(
                "undefined macro '{}' in #if expression",
                token.text
            ))),
            TokenKind::Ident => Ok(0),
            TokenKind::Other => Err(self.error(format!(
                "unexpected '{}' in #if expression",
                token.text
            ))),
        }
    }

    fn apply(&self, op: &str, lhs: i64, rhs: i64, evaluate: bool) -> Result<i64, ShaderPackError> {
        let value = match op {
            "||" => i64::from(lhs != 0 || rhs != 0),
            "&&" => i64::from(lhs != 0 && rhs != 0),
            "|" => lhs | rhs,
            "^" => lhs ^ rhs,
            "&" => lhs & rhs,
            "==" => i64::from(lhs == rhs),
            "!=" => i64::from(lhs != rhs),
            "<" => i64::from(lhs < rhs),
            ">" => i64::from(lhs > rhs),
            "<=" => i64::from(lhs <= rhs),
            ">=" => i64::from(lhs >= rhs),
            "<<" => lhs.wrapping_shl(rhs as u32),
            ">>" => lhs.wrapping_shr(rhs as u32),
            "+" => lhs.wrapping_add(rhs),
            "-" => lhs.wrapping_sub(rhs),
            "*" => lhs.wrapping_mul(rhs),
            "/" | "%" if rhs == 0 => {
                if evaluate {
                    return Err(self.error("division by zero in #if expression"));
                }
                0
            }
            "/" => lhs.wrapping_div(rhs),
            "%" => lhs.wrapping_rem(rhs),
            other => return Err(self.error(format!("unsupported operator '{other}' in #if"))),
        };
        Ok(value)
    }
}

fn binary_precedence(token: &Token<'_>) -> Option<u8> {
    if token.kind != TokenKind::Punct {
        return None;
    }
    let precedence = match token.text {
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
    Some(precedence)
}

fn parse_int_literal(text: &str) -> Option<i64> {
    let digits = text.trim_end_matches(['u', 'U', 'l', 'L']);
    if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()
    } else {
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn run(source: &str) -> PreprocessedSource {
        Preprocessor::new().run(source).expect("preprocess")
    }

    fn failure_line(err: ShaderPackError) -> usize {
        match err {
            ShaderPackError::PreprocessFailed { line, .. } => line,
            other => panic!("expected PreprocessFailed, got {other:?}"),
        }
    }

    #[test]
    fn hoists_version_and_extensions_in_order() {
        let processed =
            run("#version 330\n#extension GL_ARB_foo : enable\nvoid main(){}");
        assert_eq!(
            processed.hoist(),
            ["#version 330", "#extension GL_ARB_foo : enable"]
        );
        assert_eq!(processed.body(), "void main(){}");
        assert!(processed
            .to_source()
            .starts_with("#version 330\n#extension GL_ARB_foo : enable\n"));
    }

    #[test]
    fn only_hoists_directives_from_taken_branches() {
        let processed = run(
            "#version 120\n#define USE_FOO\n#ifdef USE_FOO\n#extension GL_foo : require\n#else\n#extension GL_bar : require\n#endif\nvoid main(){}\n",
        );
        assert_eq!(
            processed.hoist(),
            ["#version 120", "#extension GL_foo : require"]
        );
    }

    #[test]
    fn keeps_duplicate_extensions() {
        let processed = run(
            "#extension GL_foo : enable\nfloat a;\n#extension GL_foo : enable\n",
        );
        assert_eq!(processed.hoist().len(), 2);
    }

    #[test]
    fn hoisting_is_idempotent() {
        let first = run(
            "// header\n#define SCALE 2.0\n\nfloat x = SCALE; /* DRAWBUFFERS:01 */\n#extension GL_foo : enable\n#version 330 core\nvoid main(){}\n\n",
        );
        let second = run(&first.to_source());
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_reserved_markers() {
        let err = Preprocessor::new()
            .run(&format!("// {VERSION_MARKER}\nvoid main(){{}}"))
            .unwrap_err();
        assert_eq!(
            err,
            ShaderPackError::InputRejected {
                marker: VERSION_MARKER
            }
        );
        let err = glsl_preprocess_source(EXTENSION_MARKER).unwrap_err();
        assert!(matches!(err, ShaderPackError::InputRejected { .. }));
    }

    #[test]
    fn preserves_comments() {
        let processed = run("#define N 4\n/* DRAWBUFFERS:0 N */\nint a = N; // N stays\n");
        assert_eq!(processed.body(), "/* DRAWBUFFERS:0 N */\nint a = 4; // N stays");
    }

    #[test]
    fn keeps_comment_opened_on_directive_line() {
        let processed = run("#version 120\n#define A 1 /* start\n DRAWBUFFERS:0 */\nvoid main(){}\n");
        assert_eq!(processed.body(), "/* start\n DRAWBUFFERS:0 */\nvoid main(){}");

        let processed = run("#if 0\nhidden\n#endif /* trailing\n note */\nvoid main(){}");
        assert_eq!(processed.body(), "/* trailing\n note */\nvoid main(){}");
    }

    #[test]
    fn drops_comment_opened_on_inactive_directive() {
        let processed = run("#if 0 /* note\n still */\nhidden\n#endif\nvoid main(){}");
        assert_eq!(processed.body(), "void main(){}");
    }

    #[test]
    fn hoists_version_split_by_line_continuation() {
        let processed = run("#ver\\\nsion 330\nvoid main(){}");
        assert_eq!(processed.hoist(), ["#version 330"]);
        assert_eq!(processed.body(), "void main(){}");
    }

    #[test]
    fn version_inside_block_comment_is_not_hoisted() {
        let processed = run("/*\n#version 150\n*/\nvoid main(){}");
        assert!(processed.hoist().is_empty());
        assert!(processed.body().contains("#version 150"));
    }

    #[test]
    fn expands_function_like_macros() {
        let processed = run(
            "#define MIX(a, b) ((a) + (b))\n#define TWICE(x) MIX(x, x)\nfloat v = TWICE(1.0 + y);\n",
        );
        assert_eq!(processed.body(), "float v = ((1.0 + y) + (1.0 + y));");
    }

    #[test]
    fn collects_macro_arguments_across_lines() {
        let processed = run(
            "#define MIX(a, b) ((a) + (b))\nfloat v = MIX(1.0,\n    2.0);\nint l = __LINE__;\n",
        );
        assert_eq!(processed.body(), "float v = ((1.0) + (2.0));\n\nint l = 4;");
    }

    #[test]
    fn line_comment_inside_multiline_call_ends_at_newline() {
        let processed = run("#define ID(x) x\nfloat v = ID( // value\n    2.0);\n");
        assert_eq!(processed.body(), "float v = // value\n    2.0;");
    }

    #[test]
    fn unclosed_macro_call_at_end_of_source_fails() {
        let err = Preprocessor::new()
            .run("#define F(x) x\nfloat v = F(1.0,\n")
            .unwrap_err();
        assert_eq!(failure_line(err), 2);
    }

    #[test]
    fn leaves_function_macro_without_arguments_alone() {
        let processed = run("#define F(x) x\nfloat F;\n");
        assert_eq!(processed.body(), "float F;");
    }

    #[test]
    fn stops_self_referencing_macros() {
        let processed = run("#define foo foo + 1\nint x = foo;\n");
        assert_eq!(processed.body(), "int x = foo + 1;");
    }

    #[test]
    fn pastes_tokens() {
        let processed = run("#define TEX(n) colortex ## n\nuniform sampler2D TEX(4);\n");
        assert_eq!(processed.body(), "uniform sampler2D colortex4;");
    }

    #[test]
    fn evaluates_conditional_expressions() {
        let processed = run(
            "#define QUALITY 3\n#if QUALITY >= 2 && defined(QUALITY)\nhigh\n#elif QUALITY == 1\nmid\n#else\nlow\n#endif\n#if (1 << 3) % 5 == 3 ? 1 : 0\nshift\n#endif\n",
        );
        assert_eq!(processed.body(), "high\n\n\n\n\n\n\nshift");
    }

    #[test]
    fn short_circuit_skips_undefined_identifiers() {
        let processed = run("#if defined(MISSING) && MISSING > 2\nyes\n#else\nno\n#endif\n");
        assert_eq!(processed.body(), "no");
    }

    #[test]
    fn undefined_macro_in_if_fails() {
        let err = Preprocessor::new()
            .run("void a();\n#if MISSING > 2\n#endif\n")
            .unwrap_err();
        assert_eq!(failure_line(err), 2);
    }

    #[test]
    fn unmatched_endif_fails() {
        let err = Preprocessor::new().run("#endif\n").unwrap_err();
        assert_eq!(failure_line(err), 1);
    }

    #[test]
    fn unterminated_if_fails() {
        let err = Preprocessor::new().run("#ifdef FOO\nfloat a;\n").unwrap_err();
        assert!(matches!(err, ShaderPackError::PreprocessFailed { .. }));
    }

    #[test]
    fn error_directive_fails_only_when_active() {
        run("#if 0\n#error never\n#endif\n");
        let err = Preprocessor::new().run("#error broken pack\n").unwrap_err();
        assert!(err.to_string().contains("broken pack"));
    }

    #[test]
    fn predefined_macros_apply() {
        let processed = Preprocessor::new()
            .define("MC_VERSION", "11605")
            .run("#if MC_VERSION >= 11500\nmodern\n#endif\n")
            .unwrap();
        assert_eq!(processed.body(), "modern");
    }

    #[test]
    fn splices_continuation_lines() {
        let processed = run("#define LONG 1 + \\\n    2\nint a = LONG;\n");
        assert_eq!(processed.body(), "int a = 1 +     2;");
    }

    #[test]
    fn passes_pragmas_through() {
        let processed = run("#pragma optimize(on)\nvoid main(){}\n");
        assert_eq!(processed.body(), "#pragma optimize(on)\nvoid main(){}");
    }

    #[test]
    fn expands_line_macro() {
        let processed = run("\nint l = __LINE__;\n");
        assert_eq!(processed.body(), "int l = 2;");
    }

    #[test]
    fn include_is_disabled_by_default() {
        let err = Preprocessor::new()
            .run("#include \"/lib/common.glsl\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("not enabled"));
    }

    struct MapIncludes(HashMap<String, String>);

    impl IncludeProvider for MapIncludes {
        fn include(&self, path: &str) -> anyhow::Result<String> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such include"))
        }
    }

    #[test]
    fn resolves_includes_through_provider() {
        let includes = MapIncludes(HashMap::from([(
            "/lib/settings.glsl".to_string(),
            "#extension GL_inc : enable\n#define SHADOWS 1\n".to_string(),
        )]));
        let processed = Preprocessor::new()
            .with_includes(includes)
            .run("#include \"/lib/settings.glsl\"\n#if SHADOWS\nshadows\n#endif\n")
            .unwrap();
        assert_eq!(processed.hoist(), ["#extension GL_inc : enable"]);
        assert_eq!(processed.body(), "shadows");
    }

    #[test]
    fn missing_include_fails() {
        let err = Preprocessor::new()
            .with_includes(MapIncludes(HashMap::new()))
            .run("\n#include <missing.glsl>\n")
            .unwrap_err();
        assert_eq!(failure_line(err), 2);
    }

    #[test]
    fn parses_integer_literals() {
        assert_eq!(parse_int_literal("0x1F"), Some(31));
        assert_eq!(parse_int_literal("017"), Some(15));
        assert_eq!(parse_int_literal("42u"), Some(42));
        assert_eq!(parse_int_literal("1.5"), None);
    }
}
