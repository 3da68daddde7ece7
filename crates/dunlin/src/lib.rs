use std::hash::BuildHasherDefault;
use std::path::{Path, PathBuf};

use rustc_hash::{FxHashSet, FxHasher};

use crate::files::FileId;

pub mod cache;
pub mod cancellation;
pub mod db;
pub mod files;
pub mod lint;
pub mod module;
mod parse;
pub mod program;
pub mod semantic;
pub mod source;
pub mod system;
pub mod watch;

pub use parse::{ParseDiagnostic, Parsed, Parser};

pub(crate) type FxDashMap<K, V> = dashmap::DashMap<K, V, BuildHasherDefault<FxHasher>>;
pub(crate) type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;
pub(crate) type FxIndexSet<V> = indexmap::IndexSet<V, BuildHasherDefault<FxHasher>>;

/// The language version analysis targets. Drives the `str`/`bytes`/`unicode`
/// aliasing and the division rules.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum TargetVersion {
    Py27,
    Py37,
    #[default]
    Py38,
    Py39,
    Py310,
    Py311,
    Py312,
    Py313,
}

impl TargetVersion {
    pub const fn major(self) -> u8 {
        match self {
            TargetVersion::Py27 => 2,
            _ => 3,
        }
    }

    pub const fn is_py2(self) -> bool {
        self.major() == 2
    }

    const fn as_str(self) -> &'static str {
        match self {
            TargetVersion::Py27 => "py27",
            TargetVersion::Py37 => "py37",
            TargetVersion::Py38 => "py38",
            TargetVersion::Py39 => "py39",
            TargetVersion::Py310 => "py310",
            TargetVersion::Py311 => "py311",
            TargetVersion::Py312 => "py312",
            TargetVersion::Py313 => "py313",
        }
    }

    /// The `major.minor` tag used in stable qualified names of standard
    /// library modules.
    pub fn version_tag(self) -> &'static str {
        match self {
            TargetVersion::Py27 => "2.7",
            TargetVersion::Py37 => "3.7",
            TargetVersion::Py38 => "3.8",
            TargetVersion::Py39 => "3.9",
            TargetVersion::Py310 => "3.10",
            TargetVersion::Py311 => "3.11",
            TargetVersion::Py312 => "3.12",
            TargetVersion::Py313 => "3.13",
        }
    }
}

impl std::fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-supplied configuration threaded through [`program::Program`]; no
/// global state.
#[derive(Debug, Default)]
pub struct ProgramSettings {
    pub target_version: TargetVersion,
    /// Root of a typeshed checkout contributing stub search paths.
    pub typeshed: Option<PathBuf>,
    /// Additional user search paths, highest priority first.
    pub extra_search_paths: Vec<PathBuf>,
    /// Helper executable used to scrape the interface of compiled modules.
    pub introspection_helper: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    /// The files that are open in the workspace.
    ///
    /// * Editor: The files that are actively being edited in the editor.
    /// * CLI host: the resolved files passed as arguments.
    open_files: FxHashSet<FileId>,
}

impl Workspace {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            open_files: FxHashSet::default(),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub fn open_file(&mut self, file_id: FileId) {
        self.open_files.insert(file_id);
    }

    pub fn close_file(&mut self, file_id: FileId) {
        self.open_files.remove(&file_id);
    }

    pub fn open_files(&self) -> impl Iterator<Item = FileId> + '_ {
        self.open_files.iter().copied()
    }

    pub fn is_file_open(&self, file_id: FileId) -> bool {
        self.open_files.contains(&file_id)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Name(smol_str::SmolStr);

impl Name {
    #[inline]
    pub fn new(name: &str) -> Self {
        Self(smol_str::SmolStr::new(name))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Name {
    fn from(name: &str) -> Self {
        Name::new(name)
    }
}

impl From<&smol_str::SmolStr> for Name {
    fn from(name: &smol_str::SmolStr) -> Self {
        Name(name.clone())
    }
}
