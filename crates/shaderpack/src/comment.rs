//! Finds `/* DRAWBUFFERS:... */` and `/* RENDERTARGETS:... */` in fragment
//! sources and parses their payloads into render-target indices.
use std::fmt;

use serde::Serialize;

use crate::error::ShaderPackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommentDirectiveKind {
    /// One digit per render target, so only indices 0-9 are expressible.
    DrawBuffers,
    /// Comma-separated decimal indices.
    RenderTargets,
}

impl CommentDirectiveKind {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::DrawBuffers => "DRAWBUFFERS",
            Self::RenderTargets => "RENDERTARGETS",
        }
    }
}

impl fmt::Display for CommentDirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentDirective {
    kind: CommentDirectiveKind,
    payload: String,
    location: usize,
}

impl CommentDirective {
    pub fn kind(&self) -> CommentDirectiveKind {
        self.kind
    }

    /// Payload text between the `:` and the closing `*/`, trimmed.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Byte offset of the opening `/*`.
    pub fn location(&self) -> usize {
        self.location
    }

    pub fn render_targets(&self) -> Result<Vec<u32>, ShaderPackError> {
        match self.kind {
            CommentDirectiveKind::DrawBuffers => parse_digits(&self.payload),
            CommentDirectiveKind::RenderTargets => parse_digit_list(&self.payload),
        }
    }

    fn malformed(kind: CommentDirectiveKind, payload: &str, reason: String) -> ShaderPackError {
        ShaderPackError::MalformedDirective {
            directive: kind.keyword(),
            payload: payload.to_string(),
            reason,
        }
    }
}

/// Returns the last well-formed `kind` directive in `text`. Earlier ones are
/// shadowed; authors tend to leave stale directives above the live one.
pub fn find_directive(text: &str, kind: CommentDirectiveKind) -> Option<CommentDirective> {
    let keyword = kind.keyword();

    text.rmatch_indices(keyword).find_map(|(index, _)| {
        let before = text[..index].trim_end();
        let opener = before.strip_suffix("/*")?;
        let after = text[index + keyword.len()..].strip_prefix(':')?;
        let close = after.find("*/")?;

        Some(CommentDirective {
            kind,
            payload: after[..close].trim().to_string(),
            location: opener.len(),
        })
    })
}

fn parse_digits(payload: &str) -> Result<Vec<u32>, ShaderPackError> {
    payload
        .chars()
        .map(|ch| {
            ch.to_digit(10).ok_or_else(|| {
                CommentDirective::malformed(
                    CommentDirectiveKind::DrawBuffers,
                    payload,
                    format!("'{ch}' is not a decimal digit"),
                )
            })
        })
        .collect()
}

fn parse_digit_list(payload: &str) -> Result<Vec<u32>, ShaderPackError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    payload
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            entry.parse::<u32>().map_err(|err| {
                CommentDirective::malformed(
                    CommentDirectiveKind::RenderTargets,
                    payload,
                    format!("'{entry}' is not a render target index: {err}"),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_drawbuffers_digits() {
        let directive =
            find_directive("/* DRAWBUFFERS:0247 */\nvoid main(){}", CommentDirectiveKind::DrawBuffers)
                .unwrap();
        assert_eq!(directive.location(), 0);
        assert_eq!(directive.payload(), "0247");
        assert_eq!(directive.render_targets().unwrap(), vec![0, 2, 4, 7]);
    }

    #[test]
    fn parses_rendertargets_list() {
        let directive = find_directive(
            "/* RENDERTARGETS: 0, 2,4 ,7,10,11 */",
            CommentDirectiveKind::RenderTargets,
        )
        .unwrap();
        assert_eq!(
            directive.render_targets().unwrap(),
            vec![0, 2, 4, 7, 10, 11]
        );
    }

    #[test]
    fn last_occurrence_wins() {
        let text = "/* DRAWBUFFERS:01 */\nfloat a;\n/*DRAWBUFFERS:3*/\n";
        let directive = find_directive(text, CommentDirectiveKind::DrawBuffers).unwrap();
        assert_eq!(directive.payload(), "3");
        assert_eq!(directive.location(), text.rfind("/*").unwrap());
    }

    #[test]
    fn skips_mentions_outside_block_comments() {
        let text = "/* DRAWBUFFERS:12 */\n// DRAWBUFFERS:7 */\n";
        let directive = find_directive(text, CommentDirectiveKind::DrawBuffers).unwrap();
        assert_eq!(directive.payload(), "12");
    }

    #[test]
    fn missing_directive_is_none() {
        assert!(find_directive("void main(){}", CommentDirectiveKind::RenderTargets).is_none());
        assert!(find_directive("/* DRAWBUFFERS:01", CommentDirectiveKind::DrawBuffers).is_none());
    }

    #[test]
    fn empty_payload_yields_no_targets() {
        for (text, kind) in [
            ("/* DRAWBUFFERS: */", CommentDirectiveKind::DrawBuffers),
            ("/* RENDERTARGETS:*/", CommentDirectiveKind::RenderTargets),
        ] {
            let directive = find_directive(text, kind).unwrap();
            assert!(directive.render_targets().unwrap().is_empty());
        }
    }

    #[test]
    fn rejects_non_digit_drawbuffers() {
        let directive =
            find_directive("/* DRAWBUFFERS:0,1 */", CommentDirectiveKind::DrawBuffers).unwrap();
        let err = directive.render_targets().unwrap_err();
        assert!(matches!(
            err,
            ShaderPackError::MalformedDirective {
                directive: "DRAWBUFFERS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_rendertargets_entry() {
        let directive =
            find_directive("/* RENDERTARGETS:0,x */", CommentDirectiveKind::RenderTargets).unwrap();
        assert!(directive.render_targets().is_err());
        let directive =
            find_directive("/* RENDERTARGETS:0,,1 */", CommentDirectiveKind::RenderTargets).unwrap();
        assert!(directive.render_targets().is_err());
    }
}
