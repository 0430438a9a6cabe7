mod overrides;

pub use overrides::{
    AlphaTestFunction, AlphaTestOverride, BlendFactor, BlendMode, BlendModeOverride,
};

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PropertiesError {
    #[error("failed to parse shader properties: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid shader properties: {0}")]
    Invalid(String),
}

/// Pack-wide settings keyed by program name. Built once when a pack loads and
/// never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ShaderProperties {
    #[serde(default, rename = "scale")]
    viewport_scale_overrides: BTreeMap<String, f32>,
    #[serde(default, rename = "alpha_test")]
    alpha_test_overrides: BTreeMap<String, AlphaTestOverride>,
    #[serde(default, rename = "blend")]
    blend_mode_overrides: BTreeMap<String, BlendModeOverride>,
    #[serde(default, rename = "flip")]
    explicit_flips: BTreeMap<String, BTreeMap<String, bool>>,
}

impl ShaderProperties {
    /// Reads the `shaders.properties` syntax. Packs ship plenty of keys this
    /// core does not care about, so unknown keys are skipped and malformed
    /// values are logged rather than failing the whole pack.
    pub fn from_properties_str(input: &str) -> Self {
        let mut properties = Self::default();
        for entry in logical_entries(input) {
            properties.apply_entry(&entry);
        }
        properties
    }

    pub fn from_toml_str(input: &str) -> Result<Self, PropertiesError> {
        let raw: ShaderProperties = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn viewport_scale_overrides(&self) -> &BTreeMap<String, f32> {
        &self.viewport_scale_overrides
    }

    pub fn alpha_test_overrides(&self) -> &BTreeMap<String, AlphaTestOverride> {
        &self.alpha_test_overrides
    }

    pub fn blend_mode_overrides(&self) -> &BTreeMap<String, BlendModeOverride> {
        &self.blend_mode_overrides
    }

    /// Buffer names are kept as written; resolving them to render-target
    /// indices is left to the pack directives.
    pub fn explicit_flips(&self) -> &BTreeMap<String, BTreeMap<String, bool>> {
        &self.explicit_flips
    }

    pub fn validate(&self) -> Result<(), PropertiesError> {
        for (program, scale) in &self.viewport_scale_overrides {
            check_program_name("scale", program)?;
            if !scale.is_finite() || *scale <= 0.0 {
                return Err(PropertiesError::Invalid(format!(
                    "scale for program '{program}' must be > 0, found {scale}"
                )));
            }
        }

        for (program, alpha) in &self.alpha_test_overrides {
            check_program_name("alpha_test", program)?;
            if !alpha.reference.is_finite() {
                return Err(PropertiesError::Invalid(format!(
                    "alpha test reference for program '{program}' is not finite"
                )));
            }
        }

        for program in self.blend_mode_overrides.keys() {
            check_program_name("blend", program)?;
        }

        for (program, buffers) in &self.explicit_flips {
            check_program_name("flip", program)?;
            if buffers.keys().any(|buffer| buffer.trim().is_empty()) {
                return Err(PropertiesError::Invalid(format!(
                    "flip entry for program '{program}' has an empty buffer name"
                )));
            }
        }

        Ok(())
    }

    fn apply_entry(&mut self, entry: &Entry<'_>) {
        let line = entry.line;
        let key = entry.key;
        let value = entry.value.as_ref();

        if let Some(program) = key.strip_prefix("scale.") {
            match parse_scale(value) {
                Ok(scale) if !program.is_empty() => {
                    self.viewport_scale_overrides
                        .insert(program.to_string(), scale);
                }
                Ok(_) => warn!(line, key, "ignoring scale entry without a program name"),
                Err(reason) => warn!(line, key, %reason, "ignoring invalid viewport scale"),
            }
        } else if let Some(program) = key.strip_prefix("alphaTest.") {
            match AlphaTestOverride::parse(value) {
                Ok(alpha) if !program.is_empty() => {
                    self.alpha_test_overrides.insert(program.to_string(), alpha);
                }
                Ok(_) => warn!(line, key, "ignoring alphaTest entry without a program name"),
                Err(reason) => warn!(line, key, %reason, "ignoring invalid alpha test override"),
            }
        } else if let Some(program) = key.strip_prefix("blend.") {
            if program.contains('.') {
                debug!(line, key, "per-buffer blend overrides are not handled here");
                return;
            }
            match BlendModeOverride::parse(value) {
                Ok(blend) if !program.is_empty() => {
                    self.blend_mode_overrides.insert(program.to_string(), blend);
                }
                Ok(_) => warn!(line, key, "ignoring blend entry without a program name"),
                Err(reason) => warn!(line, key, %reason, "ignoring invalid blend override"),
            }
        } else if let Some(rest) = key.strip_prefix("flip.") {
            let Some((program, buffer)) = rest.split_once('.') else {
                warn!(line, key, "flip entry must name both a program and a buffer");
                return;
            };
            if program.is_empty() || buffer.is_empty() {
                warn!(line, key, "flip entry must name both a program and a buffer");
                return;
            }
            match parse_bool(value) {
                Some(flip) => {
                    self.explicit_flips
                        .entry(program.to_string())
                        .or_default()
                        .insert(buffer.to_string(), flip);
                }
                None => warn!(line, key, value, "ignoring flip entry with non-boolean value"),
            }
        } else {
            debug!(line, key, "skipping unrelated shader property");
        }
    }
}

fn check_program_name(table: &str, program: &str) -> Result<(), PropertiesError> {
    if program.trim().is_empty() {
        return Err(PropertiesError::Invalid(format!(
            "{table} table contains an empty program name"
        )));
    }
    Ok(())
}

fn parse_scale(raw: &str) -> Result<f32, String> {
    // Trailing offsets ("0.5 0.25 0.25") only matter to the framebuffer setup.
    let first = raw
        .split_whitespace()
        .next()
        .ok_or_else(|| "scale must not be empty".to_string())?;
    let scale: f32 = first
        .parse()
        .map_err(|err| format!("invalid scale '{first}': {err}"))?;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(format!("scale must be > 0, found {scale}"));
    }
    Ok(scale)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Entry<'a> {
    line: usize,
    key: &'a str,
    value: Cow<'a, str>,
}

/// Splits properties text into trimmed `key`/`value` pairs, joining lines
/// that end in a backslash. `line` is the 1-based line the entry starts on.
fn logical_entries(input: &str) -> Vec<Entry<'_>> {
    let mut entries = Vec::new();
    let mut lines = input.lines().enumerate();

    while let Some((index, raw)) = lines.next() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }

        let Some(separator) = trimmed.find(['=', ':']) else {
            warn!(line = index + 1, text = trimmed, "ignoring properties line without a separator");
            let mut continued = trimmed.ends_with('\\');
            while continued {
                match lines.next() {
                    Some((_, next)) => continued = next.trim_end().ends_with('\\'),
                    None => break,
                }
            }
            continue;
        };

        let key = trimmed[..separator].trim();
        let mut value = trimmed[separator + 1..].trim();
        if !value.ends_with('\\') {
            entries.push(Entry {
                line: index + 1,
                key,
                value: Cow::Borrowed(value),
            });
            continue;
        }

        let mut joined = String::new();
        while let Some(stripped) = value.strip_suffix('\\') {
            joined.push_str(stripped.trim_end());
            joined.push(' ');
            match lines.next() {
                Some((_, next)) => value = next.trim(),
                None => {
                    value = "";
                    break;
                }
            }
        }
        joined.push_str(value);

        entries.push(Entry {
            line: index + 1,
            key,
            value: Cow::Owned(joined.trim_end().to_string()),
        });
    }

    entries
}
