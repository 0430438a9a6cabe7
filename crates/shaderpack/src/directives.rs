//! Per-program directive resolution: draw buffers from the fragment stage's
//! comment directives, mipmap flags from its const declarations, and the
//! scale, alpha-test, blend and flip overrides supplied by the pack.
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use shaderprops::{AlphaTestOverride, BlendModeOverride, ShaderProperties};
use tracing::{debug, warn};

use crate::comment::{find_directive, CommentDirective, CommentDirectiveKind};
use crate::constant::{find_directives, ConstDirective, DispatchingDirectiveHolder};
use crate::error::ShaderPackError;
use crate::render_target::legacy_name;
use crate::source::ProgramSource;

const DEFAULT_DRAW_BUFFERS: [u32; 1] = [0];
const DEFAULT_VIEWPORT_SCALE: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramDirectives {
    draw_buffers: Vec<u32>,
    viewport_scale: f32,
    alpha_test_override: Option<AlphaTestOverride>,
    blend_mode_override: Option<BlendModeOverride>,
    mipmapped_buffers: BTreeSet<u32>,
    explicit_flips: BTreeMap<u32, bool>,
}

impl ProgramDirectives {
    /// Resolves the directives for `source`.
    ///
    /// `properties` is normally the parent pack's; passing `None` resolves as
    /// if the pack shipped no properties file, which also drops explicit
    /// flips. `supported` bounds both the draw buffers and the mipmap keys
    /// that are recognised.
    pub fn resolve(
        source: &ProgramSource,
        properties: Option<&ShaderProperties>,
        supported: &BTreeSet<u32>,
        default_blend: Option<BlendModeOverride>,
    ) -> Result<Self, ShaderPackError> {
        let name = source.name();
        let fragment = source.fragment_source();

        let draw_buffers = match fragment {
            Some(text) => resolve_draw_buffers(name, text, supported)?,
            None => DEFAULT_DRAW_BUFFERS.to_vec(),
        };

        let mipmapped_buffers = fragment
            .map(|text| resolve_mipmaps(name, text, supported))
            .unwrap_or_default();

        let (viewport_scale, alpha_test_override, blend_mode_override, explicit_flips) =
            match properties {
                Some(properties) => (
                    viewport_scale(name, properties),
                    properties.alpha_test_overrides().get(name).copied(),
                    properties
                        .blend_mode_overrides()
                        .get(name)
                        .copied()
                        .or(default_blend),
                    source.parent().directives().explicit_flips(name),
                ),
                None => (DEFAULT_VIEWPORT_SCALE, None, default_blend, BTreeMap::new()),
            };

        let directives = Self {
            draw_buffers,
            viewport_scale,
            alpha_test_override,
            blend_mode_override,
            mipmapped_buffers,
            explicit_flips,
        };
        debug!(
            program = %name,
            draw_buffers = ?directives.draw_buffers,
            mipmapped = ?directives.mipmapped_buffers,
            viewport_scale = directives.viewport_scale,
            "resolved program directives"
        );
        Ok(directives)
    }

    pub fn draw_buffers(&self) -> &[u32] {
        &self.draw_buffers
    }

    pub fn viewport_scale(&self) -> f32 {
        self.viewport_scale
    }

    pub fn alpha_test_override(&self) -> Option<AlphaTestOverride> {
        self.alpha_test_override
    }

    pub fn blend_mode_override(&self) -> Option<BlendModeOverride> {
        self.blend_mode_override
    }

    pub fn mipmapped_buffers(&self) -> &BTreeSet<u32> {
        &self.mipmapped_buffers
    }

    pub fn explicit_flips(&self) -> &BTreeMap<u32, bool> {
        &self.explicit_flips
    }
}

/// When both comment forms are present the one further into the text wins,
/// even if it sits inside code that is otherwise commented out.
fn select_comment_directive(text: &str) -> Option<CommentDirective> {
    let draw_buffers = find_directive(text, CommentDirectiveKind::DrawBuffers);
    let render_targets = find_directive(text, CommentDirectiveKind::RenderTargets);

    match (draw_buffers, render_targets) {
        (Some(a), Some(b)) => Some(if a.location() > b.location() { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn resolve_draw_buffers(
    program: &str,
    text: &str,
    supported: &BTreeSet<u32>,
) -> Result<Vec<u32>, ShaderPackError> {
    let Some(directive) = select_comment_directive(text) else {
        return Ok(DEFAULT_DRAW_BUFFERS.to_vec());
    };

    let targets = directive.render_targets()?;
    if targets.is_empty() {
        warn!(
            program = %program,
            directive = %directive.kind(),
            "empty draw buffer directive; writing to render target 0"
        );
        return Ok(DEFAULT_DRAW_BUFFERS.to_vec());
    }

    if let Some(index) = targets.iter().find(|index| !supported.contains(index)) {
        return Err(ShaderPackError::UnknownRenderTarget { index: *index });
    }
    Ok(targets)
}

fn resolve_mipmaps(program: &str, text: &str, supported: &BTreeSet<u32>) -> BTreeSet<u32> {
    let directives = find_directives(text);
    let mixed_naming = uses_colortex_mipmap_keys(&directives);
    let mipmaps = RefCell::new(BTreeSet::new());

    {
        let mut holder = DispatchingDirectiveHolder::new();
        for &index in supported {
            let mipmaps = &mipmaps;
            holder.accept_const_bool_directive(
                format!("colortex{index}MipmapEnabled"),
                move |enabled| set_member(&mut mipmaps.borrow_mut(), index, enabled),
            );

            if let Some(legacy) = legacy_name(index) {
                let key = format!("{legacy}MipmapEnabled");
                holder.accept_const_bool_directive(key.clone(), move |enabled| {
                    if mixed_naming {
                        warn!(
                            program = %program,
                            key = %key,
                            "legacy mipmap key mixed with colortex mipmap keys"
                        );
                    }
                    set_member(&mut mipmaps.borrow_mut(), index, enabled);
                });
            }
        }

        holder.process_all(&directives);
    }

    mipmaps.into_inner()
}

fn uses_colortex_mipmap_keys(directives: &[ConstDirective]) -> bool {
    directives.iter().any(|directive| {
        directive
            .name
            .strip_prefix("colortex")
            .and_then(|rest| rest.strip_suffix("MipmapEnabled"))
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
    })
}

fn set_member(set: &mut BTreeSet<u32>, index: u32, present: bool) {
    if present {
        set.insert(index);
    } else {
        set.remove(&index);
    }
}

fn viewport_scale(program: &str, properties: &ShaderProperties) -> f32 {
    match properties.viewport_scale_overrides().get(program) {
        Some(scale) if scale.is_finite() && *scale > 0.0 => *scale,
        Some(scale) => {
            warn!(program = %program, scale, "ignoring non-positive viewport scale");
            DEFAULT_VIEWPORT_SCALE
        }
        None => DEFAULT_VIEWPORT_SCALE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::render_target::{legacy_render_targets, modern_render_targets};
    use crate::source::{ShaderPack, StageKind};

    fn program(properties: &str, fragment: Option<&str>) -> ProgramSource {
        let pack = Arc::new(ShaderPack::new(ShaderProperties::from_properties_str(
            properties,
        )));
        let source = ProgramSource::new("composite", pack).with_stage(StageKind::Vertex, "");
        match fragment {
            Some(text) => source.with_stage(StageKind::Fragment, text),
            None => source,
        }
    }

    fn resolve(source: &ProgramSource) -> Result<ProgramDirectives, ShaderPackError> {
        let properties = source.parent().properties().clone();
        ProgramDirectives::resolve(source, Some(&properties), &modern_render_targets(), None)
    }

    #[test]
    fn defaults_without_directives() {
        let directives = resolve(&program("", Some("void main(){}"))).unwrap();
        assert_eq!(directives.draw_buffers(), &[0]);
        assert_eq!(directives.viewport_scale(), 1.0);
        assert_eq!(directives.alpha_test_override(), None);
        assert_eq!(directives.blend_mode_override(), None);
        assert!(directives.mipmapped_buffers().is_empty());
        assert!(directives.explicit_flips().is_empty());
    }

    #[test]
    fn missing_fragment_stage_is_tolerated() {
        let directives = resolve(&program("", None)).unwrap();
        assert_eq!(directives.draw_buffers(), &[0]);
        assert!(directives.mipmapped_buffers().is_empty());
    }

    #[test]
    fn later_comment_directive_wins() {
        let forward = resolve(&program(
            "",
            Some("/* DRAWBUFFERS:01 */\n/* RENDERTARGETS:3,4 */"),
        ))
        .unwrap();
        assert_eq!(forward.draw_buffers(), &[3, 4]);

        let swapped = resolve(&program(
            "",
            Some("/* RENDERTARGETS:3,4 */\n/* DRAWBUFFERS:01 */"),
        ))
        .unwrap();
        assert_eq!(swapped.draw_buffers(), &[0, 1]);
    }

    #[test]
    fn empty_payload_falls_back_to_target_zero() {
        let directives = resolve(&program("", Some("/* RENDERTARGETS: */"))).unwrap();
        assert_eq!(directives.draw_buffers(), &[0]);
    }

    #[test]
    fn unsupported_target_is_rejected() {
        let source = program("", Some("/* RENDERTARGETS:0,9 */"));
        let err = ProgramDirectives::resolve(&source, None, &legacy_render_targets(), None)
            .unwrap_err();
        assert_eq!(err, ShaderPackError::UnknownRenderTarget { index: 9 });
    }

    #[test]
    fn malformed_payload_propagates() {
        let err = resolve(&program("", Some("/* DRAWBUFFERS:0a */"))).unwrap_err();
        assert!(matches!(err, ShaderPackError::MalformedDirective { .. }));
    }

    #[test]
    fn mipmap_flags_follow_source_order() {
        let text = "const bool colortex2MipmapEnabled = true;\n\
                    const bool gaux1MipmapEnabled = true;\n\
                    const bool colortex4MipmapEnabled = false;\n\
                    const bool colortex7MipmapEnabled = true;\n";
        let directives = resolve(&program("", Some(text))).unwrap();
        assert_eq!(
            directives.mipmapped_buffers(),
            &BTreeSet::from([2, 7])
        );
    }

    #[test]
    fn detects_colortex_mipmap_keys() {
        let legacy_only =
            find_directives("const bool gaux1MipmapEnabled = true;\nconst int colortex2Format = 1;");
        assert!(!uses_colortex_mipmap_keys(&legacy_only));

        let mixed = find_directives(
            "const bool gaux1MipmapEnabled = true;\nconst bool colortex5MipmapEnabled = true;",
        );
        assert!(uses_colortex_mipmap_keys(&mixed));
    }

    #[test]
    fn legacy_keys_resolve_under_modern_driver() {
        let directives = resolve(&program(
            "",
            Some("const bool gaux1MipmapEnabled = true;\nconst bool gnormalMipmapEnabled = true;"),
        ))
        .unwrap();
        assert_eq!(directives.mipmapped_buffers(), &BTreeSet::from([2, 4]));
    }

    #[test]
    fn mipmap_keys_outside_supported_set_are_ignored() {
        let source = program("", Some("const bool colortex12MipmapEnabled = true;"));
        let directives =
            ProgramDirectives::resolve(&source, None, &legacy_render_targets(), None).unwrap();
        assert!(directives.mipmapped_buffers().is_empty());
    }

    #[test]
    fn mipmaps_ignore_other_stages() {
        let source = program("", Some("void main(){}")).with_stage(
            StageKind::Vertex,
            "const bool colortex1MipmapEnabled = true;",
        );
        let directives = resolve(&source).unwrap();
        assert!(directives.mipmapped_buffers().is_empty());
    }

    #[test]
    fn property_overrides_apply() {
        let properties = "scale.composite=0.5\n\
                          alphaTest.composite=GREATER 0.1\n\
                          blend.composite=off\n\
                          flip.composite.colortex3=true\n";
        let directives = resolve(&program(properties, Some(""))).unwrap();
        assert_eq!(directives.viewport_scale(), 0.5);
        assert_eq!(
            directives.alpha_test_override(),
            Some(AlphaTestOverride::parse("GREATER 0.1").unwrap())
        );
        assert_eq!(directives.blend_mode_override(), Some(BlendModeOverride::Off));
        assert_eq!(directives.explicit_flips(), &BTreeMap::from([(3, true)]));
    }

    #[test]
    fn default_blend_used_when_program_has_none() {
        let default_blend = BlendModeOverride::parse("ONE ZERO ONE ZERO").unwrap();
        let source = program("", Some(""));
        let properties = ShaderProperties::default();
        let directives = ProgramDirectives::resolve(
            &source,
            Some(&properties),
            &modern_render_targets(),
            Some(default_blend),
        )
        .unwrap();
        assert_eq!(directives.blend_mode_override(), Some(default_blend));
    }

    #[test]
    fn absent_properties_drop_flips() {
        let source = program("flip.composite.colortex1=true\n", Some(""));
        let directives =
            ProgramDirectives::resolve(&source, None, &modern_render_targets(), None).unwrap();
        assert!(directives.explicit_flips().is_empty());
        assert_eq!(directives.viewport_scale(), 1.0);
    }
}
