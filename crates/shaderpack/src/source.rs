//! Stage sources grouped into programs, the pack they belong to, and the
//! `AssetProvider` seam through which stage text and `shaders.properties`
//! are read. Discovering which programs a pack contains is left to callers.
//!
//! Types:
//!
//! - `StageKind` and `StageSource` tag stage text with its pipeline step and
//!   owning program.
//! - `ProgramSource` bundles up to four stages under a program name and keeps
//!   a handle to the parent `ShaderPack`.
//! - `ShaderPack` pairs the parsed `ShaderProperties` with the
//!   `PackDirectives` derived from them.
//! - `MemoryAssets` and `DirAssets` implement `AssetProvider` over a map and a
//!   directory respectively.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use shaderprops::ShaderProperties;
use tracing::{debug, warn};

use crate::render_target::render_target_index;

pub const PROPERTIES_FILE: &str = "shaders.properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Vertex,
    Geometry,
    Fragment,
    Compute,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Vertex,
        StageKind::Geometry,
        StageKind::Fragment,
        StageKind::Compute,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vsh",
            Self::Geometry => "gsh",
            Self::Fragment => "fsh",
            Self::Compute => "csh",
        }
    }

    pub fn file_name(self, program: &str) -> String {
        format!("{program}.{}", self.extension())
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vertex => "vertex",
            Self::Geometry => "geometry",
            Self::Fragment => "fragment",
            Self::Compute => "compute",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSource<'a> {
    pub kind: StageKind,
    pub program: &'a str,
    pub text: Option<&'a str>,
}

/// Supplies raw asset text by file name, e.g. `gbuffers_terrain.fsh`.
pub trait AssetProvider {
    /// `Ok(None)` means the asset does not exist; errors are reserved for
    /// assets that exist but cannot be read.
    fn read(&self, name: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    files: HashMap<String, String>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }
}

impl AssetProvider for MemoryAssets {
    fn read(&self, name: &str) -> Result<Option<String>> {
        Ok(self.files.get(name).cloned())
    }
}

/// Reads assets from a pack's `shaders/` directory on disk.
#[derive(Debug, Clone)]
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }
}

impl AssetProvider for DirAssets {
    fn read(&self, name: &str) -> Result<Option<String>> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            bail!("asset name '{name}' must stay inside the pack directory");
        }

        let path = self.root.join(relative);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read shader asset {}", path.display()))?;
        Ok(Some(contents))
    }
}

/// Pack-level directives derived from the properties file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackDirectives {
    explicit_flips: BTreeMap<String, BTreeMap<u32, bool>>,
}

impl PackDirectives {
    pub fn from_properties(properties: &ShaderProperties) -> Self {
        let mut explicit_flips = BTreeMap::new();
        for (program, buffers) in properties.explicit_flips() {
            let mut resolved = BTreeMap::new();
            for (buffer, flip) in buffers {
                match render_target_index(buffer) {
                    Some(index) => {
                        resolved.insert(index, *flip);
                    }
                    None => warn!(
                        program = %program,
                        buffer = %buffer,
                        "ignoring flip for unknown render target"
                    ),
                }
            }
            if !resolved.is_empty() {
                explicit_flips.insert(program.clone(), resolved);
            }
        }
        Self { explicit_flips }
    }

    pub fn explicit_flips(&self, program: &str) -> BTreeMap<u32, bool> {
        self.explicit_flips.get(program).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShaderPack {
    properties: ShaderProperties,
    directives: PackDirectives,
}

impl ShaderPack {
    pub fn new(properties: ShaderProperties) -> Self {
        let directives = PackDirectives::from_properties(&properties);
        Self {
            properties,
            directives,
        }
    }

    /// Builds the pack from `shaders.properties`, falling back to empty
    /// properties when the pack ships none.
    pub fn load(assets: &dyn AssetProvider) -> Result<Self> {
        let properties = match assets
            .read(PROPERTIES_FILE)
            .with_context(|| format!("failed to load {PROPERTIES_FILE}"))?
        {
            Some(raw) => ShaderProperties::from_properties_str(&raw),
            None => {
                debug!("pack has no {PROPERTIES_FILE}; using defaults");
                ShaderProperties::default()
            }
        };
        Ok(Self::new(properties))
    }

    pub fn properties(&self) -> &ShaderProperties {
        &self.properties
    }

    pub fn directives(&self) -> &PackDirectives {
        &self.directives
    }
}

#[derive(Debug, Clone)]
pub struct ProgramSource {
    name: String,
    stages: BTreeMap<StageKind, String>,
    parent: Arc<ShaderPack>,
}

impl ProgramSource {
    pub fn new(name: impl Into<String>, parent: Arc<ShaderPack>) -> Self {
        Self {
            name: name.into(),
            stages: BTreeMap::new(),
            parent,
        }
    }

    pub fn with_stage(mut self, kind: StageKind, text: impl Into<String>) -> Self {
        self.stages.insert(kind, text.into());
        self
    }

    /// Reads `<name>.vsh`, `.gsh`, `.fsh` and `.csh`; missing stages stay
    /// absent.
    pub fn load(
        name: impl Into<String>,
        parent: Arc<ShaderPack>,
        assets: &dyn AssetProvider,
    ) -> Result<Self> {
        let mut program = Self::new(name, parent);
        for kind in StageKind::ALL {
            let file = kind.file_name(&program.name);
            let text = assets.read(&file).with_context(|| {
                format!("failed to read {kind} stage of program '{}'", program.name)
            })?;
            if let Some(text) = text {
                program.stages.insert(kind, text);
            }
        }
        debug!(
            program = %program.name,
            stages = program.stages.len(),
            "loaded program source"
        );
        Ok(program)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> &ShaderPack {
        &self.parent
    }

    pub fn stage(&self, kind: StageKind) -> StageSource<'_> {
        StageSource {
            kind,
            program: &self.name,
            text: self.stages.get(&kind).map(String::as_str),
        }
    }

    pub fn fragment_source(&self) -> Option<&str> {
        self.stages.get(&StageKind::Fragment).map(String::as_str)
    }

    /// Present stages in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = StageSource<'_>> {
        self.stages.iter().map(|(kind, text)| StageSource {
            kind: *kind,
            program: &self.name,
            text: Some(text.as_str()),
        })
    }

    /// A drawable program needs vertex and fragment stages; a compute
    /// program needs only its compute stage.
    pub fn is_valid(&self) -> bool {
        let has = |kind| self.stages.contains_key(&kind);
        (has(StageKind::Vertex) && has(StageKind::Fragment)) || has(StageKind::Compute)
    }

    /// Rewrites every present stage with `transform`, keeping name and parent.
    pub fn map_stages<E>(
        &self,
        mut transform: impl FnMut(StageKind, &str) -> Result<String, E>,
    ) -> Result<Self, E> {
        let mut stages = BTreeMap::new();
        for (kind, text) in &self.stages {
            stages.insert(*kind, transform(*kind, text)?);
        }
        Ok(Self {
            name: self.name.clone(),
            stages,
            parent: Arc::clone(&self.parent),
        })
    }
}
