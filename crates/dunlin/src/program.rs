pub mod check;
pub mod main_loop;
pub mod progress;

use std::path::Path;
use std::sync::Arc;

use crate::cancellation::{CancellationToken, CancellationTokenSource};
use crate::db::{HasJar, QueryResult, SemanticDb, SemanticJar, SourceDb, SourceJar};
use crate::files::{FileId, Files};
use crate::module::{typeshed_search_paths, ModuleSearchPath};
use crate::parse::{parse, Parsed, Parser};
use crate::source::{source_text, Source};
use crate::system::System;
use crate::{ProgramSettings, Workspace};

/// The analyzer's top-level context: files, jars, workspace and the host
/// collaborators, bundled so nothing lives in globals.
pub struct Program {
    files: Files,
    source: SourceJar,
    semantic: SemanticJar,
    workspace: Workspace,
    parser: Arc<dyn Parser>,
    system: Arc<dyn System>,
    settings: ProgramSettings,
    cancellation: CancellationTokenSource,
    token: CancellationToken,
}

impl Program {
    pub fn new(
        workspace: Workspace,
        module_search_paths: Vec<ModuleSearchPath>,
        parser: Arc<dyn Parser>,
        system: Arc<dyn System>,
        settings: ProgramSettings,
    ) -> Self {
        let semantic = SemanticJar::default();
        semantic.registry.set_search_paths(module_search_paths);
        if let Some(typeshed) = &settings.typeshed {
            semantic
                .registry
                .set_stub_paths(typeshed_search_paths(typeshed, settings.target_version));
        }

        let cancellation = CancellationTokenSource::new();
        let token = cancellation.token();

        Self {
            files: Files::default(),
            source: SourceJar::default(),
            semantic,
            workspace,
            parser,
            system,
            settings,
            cancellation,
            token,
        }
    }

    pub fn files(&self) -> &Files {
        &self.files
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    /// Applies document updates: cancels in-flight analyses, resets the
    /// affected modules to their initial content state and drops their
    /// caches. Dependents are invalidated lazily; subsequent requests
    /// recompute them.
    #[tracing::instrument(level = "debug", skip(self, changes))]
    pub fn apply_changes<I>(&mut self, changes: I)
    where
        I: IntoIterator<Item = FileChange>,
    {
        self.cancellation.cancel();
        self.cancellation = CancellationTokenSource::new();
        self.token = self.cancellation.token();

        for change in changes {
            self.source.sources.remove(&change.id);
            self.source.parsed.remove(&change.id);
            if let Some(module) = self.semantic.registry.file_to_module(change.id) {
                self.semantic.registry.invalidate(self, module);
            }
        }
    }

    /// Replaces a document's buffer with new content; the module restarts
    /// its lifecycle from `None` at the next request.
    pub fn update_document(&mut self, file_id: FileId, text: &str) {
        let next = match self.source.sources.try_get(&file_id) {
            Some(current) => current.update(text),
            None => Source::new(text),
        };
        let version = next.version();

        self.apply_changes([FileChange::new(file_id, FileChangeKind::Modified)]);
        self.source.sources.set(file_id, Source::with_version(text, version));
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

impl SourceDb for Program {
    fn file_id(&self, path: &Path) -> FileId {
        self.files.intern(path)
    }

    fn file_path(&self, file_id: FileId) -> Arc<Path> {
        self.files.path(file_id)
    }

    fn source(&self, file_id: FileId) -> QueryResult<Source> {
        source_text(self, file_id)
    }

    fn parse(&self, file_id: FileId) -> QueryResult<Parsed> {
        parse(self, file_id)
    }

    fn parser(&self) -> &dyn Parser {
        &*self.parser
    }

    fn system(&self) -> &dyn System {
        &*self.system
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

impl SemanticDb for Program {
    fn settings(&self) -> &ProgramSettings {
        &self.settings
    }
}

impl HasJar<SourceJar> for Program {
    fn jar(&self) -> &SourceJar {
        &self.source
    }

    fn jar_mut(&mut self) -> &mut SourceJar {
        &mut self.source
    }
}

impl HasJar<SemanticJar> for Program {
    fn jar(&self) -> &SemanticJar {
        &self.semantic
    }

    fn jar_mut(&mut self) -> &mut SemanticJar {
        &mut self.semantic
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FileChange {
    id: FileId,
    kind: FileChangeKind,
}

impl FileChange {
    pub fn new(file_id: FileId, kind: FileChangeKind) -> Self {
        Self { id: file_id, kind }
    }

    pub fn file_id(&self) -> FileId {
        self.id
    }

    pub fn kind(&self) -> FileChangeKind {
        self.kind
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}
