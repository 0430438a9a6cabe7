//! The record handed to the driver adapter once a program has been
//! preprocessed and its directives resolved.
use std::collections::BTreeSet;

use serde::Serialize;
use shaderprops::BlendModeOverride;
use tracing::{debug, warn};

use crate::directives::ProgramDirectives;
use crate::error::ShaderPackError;
use crate::preprocess::Preprocessor;
use crate::source::{ProgramSource, StageKind};

/// Vertex attributes packs read by name; the host binds them to fixed slots
/// before linking.
pub const ATTRIBUTE_BINDINGS: [(u32, &str); 3] =
    [(10, "mc_Entity"), (11, "mc_midTexCoord"), (12, "at_tangent")];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedStage {
    pub kind: StageKind,
    /// Hoist block followed by the preprocessed body.
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttributeBinding {
    pub location: u32,
    pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramConfig {
    name: String,
    stages: Vec<PreparedStage>,
    attribute_bindings: Vec<AttributeBinding>,
    directives: ProgramDirectives,
}

impl ProgramConfig {
    /// Preprocesses every present stage, then resolves directives against
    /// the preprocessed fragment stage so that only directives in live
    /// branches count.
    pub fn build(
        source: &ProgramSource,
        preprocessor: &Preprocessor,
        supported: &BTreeSet<u32>,
        default_blend: Option<BlendModeOverride>,
    ) -> Result<Self, ShaderPackError> {
        let prepared = source.map_stages(|kind, text| {
            debug!(program = %source.name(), stage = %kind, "preprocessing stage");
            preprocessor.run(text).map(|processed| processed.to_source())
        })?;

        let directives = ProgramDirectives::resolve(
            &prepared,
            Some(prepared.parent().properties()),
            supported,
            default_blend,
        )?;

        let stages = prepared
            .stages()
            .filter_map(|stage| {
                stage.text.map(|text| PreparedStage {
                    kind: stage.kind,
                    source: text.to_string(),
                })
            })
            .collect();

        Ok(Self {
            name: source.name().to_string(),
            stages,
            attribute_bindings: ATTRIBUTE_BINDINGS
                .iter()
                .map(|&(location, name)| AttributeBinding { location, name })
                .collect(),
            directives,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[PreparedStage] {
        &self.stages
    }

    pub fn stage(&self, kind: StageKind) -> Option<&PreparedStage> {
        self.stages.iter().find(|stage| stage.kind == kind)
    }

    pub fn attribute_bindings(&self) -> &[AttributeBinding] {
        &self.attribute_bindings
    }

    pub fn directives(&self) -> &ProgramDirectives {
        &self.directives
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Builds every program independently; a failing program is reported in
/// its own slot and does not stop the rest.
pub fn resolve_programs<'s>(
    sources: impl IntoIterator<Item = &'s ProgramSource>,
    preprocessor: &Preprocessor,
    supported: &BTreeSet<u32>,
    default_blend: Option<BlendModeOverride>,
) -> Vec<(String, Result<ProgramConfig, ShaderPackError>)> {
    sources
        .into_iter()
        .map(|source| {
            let result = ProgramConfig::build(source, preprocessor, supported, default_blend);
            if let Err(err) = &result {
                warn!(program = %source.name(), error = %err, "failed to resolve program");
            }
            (source.name().to_string(), result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use shaderprops::ShaderProperties;

    use crate::preprocess::VERSION_MARKER;
    use crate::render_target::modern_render_targets;
    use crate::source::ShaderPack;

    fn pack() -> Arc<ShaderPack> {
        Arc::new(ShaderPack::new(ShaderProperties::default()))
    }

    #[test]
    fn builds_preprocessed_stages() {
        let source = ProgramSource::new("gbuffers_basic", pack())
            .with_stage(StageKind::Vertex, "#version 120\nvoid main(){}")
            .with_stage(
                StageKind::Fragment,
                "#version 120\n/* DRAWBUFFERS:01 */\nvoid main(){}",
            );
        let config =
            ProgramConfig::build(&source, &Preprocessor::new(), &modern_render_targets(), None)
                .unwrap();

        assert_eq!(config.name(), "gbuffers_basic");
        assert_eq!(config.stages().len(), 2);
        let fragment = config.stage(StageKind::Fragment).unwrap();
        assert!(fragment.source.starts_with("#version 120\n"));
        assert_eq!(config.directives().draw_buffers(), &[0, 1]);
        assert_eq!(
            config
                .attribute_bindings()
                .iter()
                .map(|binding| (binding.location, binding.name))
                .collect::<Vec<_>>(),
            ATTRIBUTE_BINDINGS.to_vec()
        );
    }

    #[test]
    fn directives_in_dead_branches_are_ignored() {
        let fragment = "#ifdef BLOOM\n/* DRAWBUFFERS:7 */\n#else\n/* DRAWBUFFERS:3 */\n#endif\n";
        let source = ProgramSource::new("composite", pack())
            .with_stage(StageKind::Fragment, fragment);

        let plain =
            ProgramConfig::build(&source, &Preprocessor::new(), &modern_render_targets(), None)
                .unwrap();
        assert_eq!(plain.directives().draw_buffers(), &[3]);

        let bloom = ProgramConfig::build(
            &source,
            &Preprocessor::new().define("BLOOM", "1"),
            &modern_render_targets(),
            None,
        )
        .unwrap();
        assert_eq!(bloom.directives().draw_buffers(), &[7]);
    }

    #[test]
    fn failures_stay_per_program() {
        let good = ProgramSource::new("final", pack()).with_stage(StageKind::Fragment, "");
        let bad = ProgramSource::new("composite", pack())
            .with_stage(StageKind::Fragment, format!("int {VERSION_MARKER};"));

        let results = resolve_programs(
            [&bad, &good],
            &Preprocessor::new(),
            &modern_render_targets(),
            None,
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "composite");
        assert!(matches!(
            results[0].1,
            Err(ShaderPackError::InputRejected { .. })
        ));
        assert_eq!(results[1].0, "final");
        assert!(results[1].1.is_ok());
    }

    #[test]
    fn json_output_is_stable() {
        let source = ProgramSource::new("final", pack())
            .with_stage(StageKind::Fragment, "const bool colortex3MipmapEnabled = true;");
        let build = || {
            ProgramConfig::build(&source, &Preprocessor::new(), &modern_render_targets(), None)
                .unwrap()
                .to_json()
                .unwrap()
        };
        let json = build();
        assert_eq!(json, build());
        assert!(json.contains("\"mipmapped_buffers\""));
        assert!(json.contains("\"mc_Entity\""));
    }
}
