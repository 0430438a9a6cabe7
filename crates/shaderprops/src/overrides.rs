//! Alpha-test and blend overrides a pack can request per program. Both carry
//! the OpenGL enum values the driver adapter forwards untouched.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlphaTestFunction {
    Never,
    Less,
    Equal,
    Lequal,
    Greater,
    #[serde(rename = "NOTEQUAL")]
    NotEqual,
    Gequal,
    Always,
    Off,
}

impl AlphaTestFunction {
    /// `None` for [`AlphaTestFunction::Off`], which disables the test instead
    /// of selecting a comparison.
    pub fn gl_enum(self) -> Option<u32> {
        match self {
            Self::Never => Some(0x0200),
            Self::Less => Some(0x0201),
            Self::Equal => Some(0x0202),
            Self::Lequal => Some(0x0203),
            Self::Greater => Some(0x0204),
            Self::NotEqual => Some(0x0205),
            Self::Gequal => Some(0x0206),
            Self::Always => Some(0x0207),
            Self::Off => None,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::Less => "LESS",
            Self::Equal => "EQUAL",
            Self::Lequal => "LEQUAL",
            Self::Greater => "GREATER",
            Self::NotEqual => "NOTEQUAL",
            Self::Gequal => "GEQUAL",
            Self::Always => "ALWAYS",
            Self::Off => "OFF",
        }
    }
}

impl fmt::Display for AlphaTestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for AlphaTestFunction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NEVER" => Ok(Self::Never),
            "LESS" => Ok(Self::Less),
            "EQUAL" => Ok(Self::Equal),
            "LEQUAL" => Ok(Self::Lequal),
            "GREATER" => Ok(Self::Greater),
            "NOTEQUAL" => Ok(Self::NotEqual),
            "GEQUAL" => Ok(Self::Gequal),
            "ALWAYS" => Ok(Self::Always),
            "OFF" | "FALSE" => Ok(Self::Off),
            other => Err(format!("unknown alpha test function '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AlphaTestOverride {
    pub function: AlphaTestFunction,
    #[serde(default)]
    pub reference: f32,
}

impl AlphaTestOverride {
    pub const OFF: Self = Self {
        function: AlphaTestFunction::Off,
        reference: 0.0,
    };

    /// Parses `off` or `<FUNCTION> <reference>`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parts = raw.split_whitespace();
        let function: AlphaTestFunction = parts
            .next()
            .ok_or_else(|| "alpha test override must not be empty".to_string())?
            .parse()?;

        if function == AlphaTestFunction::Off {
            return Ok(Self::OFF);
        }

        let reference = parts
            .next()
            .ok_or_else(|| format!("alpha test function {function} requires a reference value"))?;
        let reference: f32 = reference
            .parse()
            .map_err(|err| format!("invalid alpha test reference '{reference}': {err}"))?;
        if !reference.is_finite() {
            return Err(format!("alpha test reference {reference} is not finite"));
        }
        if let Some(extra) = parts.next() {
            return Err(format!("unexpected trailing token '{extra}'"));
        }

        Ok(Self {
            function,
            reference,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    SrcAlphaSaturate,
}

impl BlendFactor {
    pub fn gl_enum(self) -> u32 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::SrcColor => 0x0300,
            Self::OneMinusSrcColor => 0x0301,
            Self::SrcAlpha => 0x0302,
            Self::OneMinusSrcAlpha => 0x0303,
            Self::DstAlpha => 0x0304,
            Self::OneMinusDstAlpha => 0x0305,
            Self::DstColor => 0x0306,
            Self::OneMinusDstColor => 0x0307,
            Self::SrcAlphaSaturate => 0x0308,
        }
    }
}

impl FromStr for BlendFactor {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ZERO" => Ok(Self::Zero),
            "ONE" => Ok(Self::One),
            "SRC_COLOR" => Ok(Self::SrcColor),
            "ONE_MINUS_SRC_COLOR" => Ok(Self::OneMinusSrcColor),
            "DST_COLOR" => Ok(Self::DstColor),
            "ONE_MINUS_DST_COLOR" => Ok(Self::OneMinusDstColor),
            "SRC_ALPHA" => Ok(Self::SrcAlpha),
            "ONE_MINUS_SRC_ALPHA" => Ok(Self::OneMinusSrcAlpha),
            "DST_ALPHA" => Ok(Self::DstAlpha),
            "ONE_MINUS_DST_ALPHA" => Ok(Self::OneMinusDstAlpha),
            "SRC_ALPHA_SATURATE" => Ok(Self::SrcAlphaSaturate),
            other => Err(format!("unknown blend factor '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlendMode {
    pub src_rgb: BlendFactor,
    pub dst_rgb: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
}

/// `Off` disables blending outright, which is not the same as having no
/// override at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendModeOverride {
    Off,
    Mode(BlendMode),
}

impl BlendModeOverride {
    /// Parses `off` or four factors `srcRGB dstRGB srcAlpha dstAlpha`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        match parts.as_slice() {
            [single] if single.eq_ignore_ascii_case("off") => Ok(Self::Off),
            [src_rgb, dst_rgb, src_alpha, dst_alpha] => Ok(Self::Mode(BlendMode {
                src_rgb: src_rgb.parse()?,
                dst_rgb: dst_rgb.parse()?,
                src_alpha: src_alpha.parse()?,
                dst_alpha: dst_alpha.parse()?,
            })),
            _ => Err(format!(
                "expected 'off' or four blend factors, found {} token(s)",
                parts.len()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_alpha_test_with_reference() {
        let parsed = AlphaTestOverride::parse("greater 0.1").unwrap();
        assert_eq!(parsed.function, AlphaTestFunction::Greater);
        assert!((parsed.reference - 0.1).abs() < f32::EPSILON);
        assert_eq!(parsed.function.gl_enum(), Some(0x0204));
    }

    #[test]
    fn alpha_test_off_ignores_reference() {
        assert_eq!(AlphaTestOverride::parse("off").unwrap(), AlphaTestOverride::OFF);
        assert_eq!(AlphaTestOverride::OFF.function.gl_enum(), None);
    }

    #[test]
    fn alpha_test_requires_reference() {
        assert!(AlphaTestOverride::parse("LEQUAL").is_err());
        assert!(AlphaTestOverride::parse("SOMETIMES 0.5").is_err());
    }

    #[test]
    fn parses_blend_factors() {
        let parsed =
            BlendModeOverride::parse("SRC_ALPHA ONE_MINUS_SRC_ALPHA ONE ZERO").unwrap();
        let BlendModeOverride::Mode(mode) = parsed else {
            panic!("expected explicit blend mode");
        };
        assert_eq!(mode.src_rgb, BlendFactor::SrcAlpha);
        assert_eq!(mode.dst_rgb.gl_enum(), 0x0303);
        assert_eq!(mode.dst_alpha, BlendFactor::Zero);
    }

    #[test]
    fn blend_off_is_distinct() {
        assert_eq!(BlendModeOverride::parse("OFF").unwrap(), BlendModeOverride::Off);
        assert!(BlendModeOverride::parse("ONE ONE").is_err());
    }
}
