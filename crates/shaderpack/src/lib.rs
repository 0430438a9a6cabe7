mod comment;
mod constant;
mod directives;
mod error;
mod lexer;
mod preprocess;
mod program;
mod render_target;
mod source;

pub use comment::{find_directive, CommentDirective, CommentDirectiveKind};
pub use constant::{
    find_directives, ConstDirective, ConstValue, DirectiveHandler, DispatchingDirectiveHolder,
};
pub use directives::ProgramDirectives;
pub use error::ShaderPackError;
pub use preprocess::{
    glsl_preprocess_source, IncludeProvider, PreprocessedSource, Preprocessor, EXTENSION_MARKER,
    VERSION_MARKER,
};
pub use program::{
    resolve_programs, AttributeBinding, PreparedStage, ProgramConfig, ATTRIBUTE_BINDINGS,
};
pub use render_target::{
    legacy_name, legacy_render_targets, modern_render_targets, render_target_index,
    LEGACY_RENDER_TARGETS, MAX_MODERN_RENDER_TARGETS,
};
pub use source::{
    AssetProvider, DirAssets, MemoryAssets, PackDirectives, ProgramSource, ShaderPack, StageKind,
    StageSource, PROPERTIES_FILE,
};

pub use shaderprops::{
    AlphaTestFunction, AlphaTestOverride, BlendFactor, BlendMode, BlendModeOverride,
    ShaderProperties,
};
