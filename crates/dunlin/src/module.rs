use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use filetime::FileTime;
use parking_lot::{Condvar, Mutex, RwLock};
use std::hash::{Hash, Hasher};

use crate::cache::AnalysisCache;
use crate::db::{HasJar, QueryResult, SemanticDb, SemanticJar};
use crate::files::FileId;
use crate::lint::{Diagnostic, Diagnostics};
use crate::semantic;
use crate::semantic::scope::{ScopeId, ScopeStore, VariableSource};
use crate::semantic::types::{BuiltinType, Type, Value};
use crate::{FxDashMap, Name};

/// How often a caller re-checks a module that another worker is loading.
const MAX_RESOLVE_ATTEMPTS: usize = 5;
const RESOLVE_WAIT: Duration = Duration::from_millis(100);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u32);

impl ModuleId {
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) fn from_u32(id: u32) -> Self {
        Self(id)
    }
}

/// A module name, e.g. `foo.bar`.
///
/// Always normalized to the absolute form (never a relative module name).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ModuleName(smol_str::SmolStr);

impl ModuleName {
    pub fn new(name: &str) -> Self {
        debug_assert!(!name.is_empty());

        Self(smol_str::SmolStr::new(name))
    }

    /// Resolves a relative spelling against the importing module.
    /// `from . import x` inside `pkg.mod` resolves against `pkg`.
    pub fn relative(
        dots: u32,
        name: Option<&str>,
        importer: &ModuleName,
        importer_is_package: bool,
    ) -> Option<Self> {
        let mut components: Vec<&str> = importer.components().collect();
        let strip = if importer_is_package {
            dots.saturating_sub(1)
        } else {
            dots
        };
        for _ in 0..strip {
            components.pop()?;
        }
        if let Some(name) = name {
            components.extend(name.split('.'));
        }
        if components.is_empty() {
            return None;
        }
        Some(Self::new(&components.join(".")))
    }

    pub fn components(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.0.split('.')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ModuleKind {
    User,
    Library,
    Stub,
    Builtin,
    CompiledBuiltin,
    Compiled,
    Specialized,
    Unresolved,
    Package,
}

/// Forward-only lifecycle of a module's content. A content update resets a
/// module to `None` and the chain restarts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum ContentState {
    None,
    Loading,
    Loaded,
    Parsing,
    Parsed,
    Analyzing,
    Analyzed,
}

/// A search path in which to locate modules, corresponding to one entry of
/// the interpreter's import path at runtime.
///
/// Cloning a search path is cheap because it's an `Arc`.
#[derive(Clone, PartialEq, Eq)]
pub struct ModuleSearchPath {
    inner: Arc<ModuleSearchPathInner>,
}

impl ModuleSearchPath {
    pub fn new(path: PathBuf, kind: ModuleSearchPathKind) -> Self {
        Self {
            inner: Arc::new(ModuleSearchPathInner { path, kind }),
        }
    }

    pub fn kind(&self) -> ModuleSearchPathKind {
        self.inner.kind
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl std::fmt::Debug for ModuleSearchPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

#[derive(Debug, Eq, PartialEq)]
struct ModuleSearchPathInner {
    path: PathBuf,
    kind: ModuleSearchPathKind,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ModuleSearchPathKind {
    // Project dependency
    FirstParty,

    // e.g. site packages
    ThirdParty,

    // e.g. the standard library
    StandardLibrary,
}

impl ModuleSearchPathKind {
    fn module_kind(self) -> ModuleKind {
        match self {
            ModuleSearchPathKind::FirstParty => ModuleKind::User,
            ModuleSearchPathKind::ThirdParty | ModuleSearchPathKind::StandardLibrary => {
                ModuleKind::Library
            }
        }
    }
}

/// The typeshed root contributes `stdlib/<ver>`, `stdlib/<major>` and
/// `stdlib/2and3`, and the same triple under `third_party/`.
pub fn typeshed_search_paths(root: &Path, version: crate::TargetVersion) -> Vec<ModuleSearchPath> {
    let mut paths = Vec::with_capacity(6);
    for section in ["stdlib", "third_party"] {
        for sub in [
            version.version_tag().to_string(),
            version.major().to_string(),
            "2and3".to_string(),
        ] {
            paths.push(ModuleSearchPath::new(
                root.join(section).join(sub),
                ModuleSearchPathKind::StandardLibrary,
            ));
        }
    }
    paths
}

/// The resolved on-disk location of one module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModulePath {
    root: ModuleSearchPath,
    file_id: FileId,
}

impl ModulePath {
    pub fn new(root: ModuleSearchPath, file_id: FileId) -> Self {
        Self { root, file_id }
    }

    pub fn root(&self) -> &ModuleSearchPath {
        &self.root
    }

    pub fn file(&self) -> FileId {
        self.file_id
    }
}

/// Outcome of a module resolution at the registry boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModuleResolution {
    Ok(ModuleId),
    /// The module could not be located or loaded; imports of it evaluate
    /// to Unknown.
    Unresolved(ModuleId),
    /// Another worker is still loading the module and the bounded retry
    /// budget ran out.
    NeedRetry,
}

impl ModuleResolution {
    pub fn module(self) -> Option<ModuleId> {
        match self {
            ModuleResolution::Ok(id) => Some(id),
            ModuleResolution::Unresolved(_) | ModuleResolution::NeedRetry => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: ModuleName,
    pub qualified_name: String,
    pub kind: ModuleKind,
    pub state: ContentState,
    pub path: Option<ModulePath>,
    pub uri: Option<String>,
    /// Paired stub, on a primary module.
    pub stub: Option<ModuleId>,
    /// Paired primary, on a stub module.
    pub primary: Option<ModuleId>,
    pub content_version: u32,
    pub last_modified: Option<FileTime>,
    pub diagnostics: Vec<Diagnostic>,
    analyzing_thread: Option<ThreadId>,
}

impl ModuleInfo {
    fn new(name: ModuleName) -> Self {
        Self {
            qualified_name: name.as_str().to_string(),
            name,
            kind: ModuleKind::Unresolved,
            state: ContentState::None,
            path: None,
            uri: None,
            stub: None,
            primary: None,
            content_version: 0,
            last_modified: None,
            diagnostics: Vec::new(),
            analyzing_thread: None,
        }
    }
}

#[derive(Debug)]
struct ModuleSlot {
    info: RwLock<ModuleInfo>,
    wait_lock: Mutex<()>,
    state_changed: Condvar,
}

impl ModuleSlot {
    fn new(name: ModuleName) -> Self {
        Self {
            info: RwLock::new(ModuleInfo::new(name)),
            wait_lock: Mutex::new(()),
            state_changed: Condvar::new(),
        }
    }

    fn notify(&self) {
        let _guard = self.wait_lock.lock();
        self.state_changed.notify_all();
    }
}

type SpecializedFactory = dyn Fn(&dyn SemanticDb, ModuleId) + Send + Sync;

/// Owns all modules. Resolution shares work across concurrent requesters:
/// the first requester of a name claims the slot and loads; others wait on
/// the slot and retry, bounded by [`MAX_RESOLVE_ATTEMPTS`].
#[derive(Default)]
pub struct ModuleRegistry {
    slots: RwLock<Vec<Arc<ModuleSlot>>>,
    by_name: FxDashMap<ModuleName, ModuleId>,
    by_file: FxDashMap<FileId, ModuleId>,
    search_paths: RwLock<Vec<ModuleSearchPath>>,
    /// Typeshed-style stub roots, consulted for stub pairing and as the
    /// fallback when no primary module exists.
    stub_paths: RwLock<Vec<ModuleSearchPath>>,
    specialized: FxDashMap<ModuleName, Arc<SpecializedFactory>>,
    analysis_cache: RwLock<Option<Arc<dyn AnalysisCache>>>,
    builtins: std::sync::OnceLock<ModuleId>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.slots.read().len())
            .finish_non_exhaustive()
    }
}

impl ModuleRegistry {
    pub fn set_search_paths(&self, paths: Vec<ModuleSearchPath>) {
        *self.search_paths.write() = paths;
    }

    /// Replaces the first-party entries, keeping library paths.
    pub fn set_user_search_paths(&self, paths: Vec<PathBuf>) {
        let mut search_paths = self.search_paths.write();
        search_paths.retain(|path| path.kind() != ModuleSearchPathKind::FirstParty);
        for (index, path) in paths.into_iter().enumerate() {
            search_paths.insert(
                index,
                ModuleSearchPath::new(path, ModuleSearchPathKind::FirstParty),
            );
        }
    }

    pub fn set_stub_paths(&self, paths: Vec<ModuleSearchPath>) {
        *self.stub_paths.write() = paths;
    }

    pub fn set_analysis_cache(&self, cache: Arc<dyn AnalysisCache>) {
        *self.analysis_cache.write() = Some(cache);
    }

    /// Registers a host factory for a synthetic module; its import bypasses
    /// the loader.
    pub fn specialize(&self, name: ModuleName, factory: Arc<SpecializedFactory>) {
        self.specialized.insert(name, factory);
    }

    pub fn get_specialized(&self, name: &ModuleName) -> Option<Arc<SpecializedFactory>> {
        self.specialized.get(name).map(|factory| factory.clone())
    }

    pub fn module_info(&self, id: ModuleId) -> Option<ModuleInfo> {
        let slots = self.slots.read();
        slots.get(id.0 as usize).map(|slot| slot.info.read().clone())
    }

    pub fn module_name(&self, id: ModuleId) -> Option<ModuleName> {
        let slots = self.slots.read();
        slots
            .get(id.0 as usize)
            .map(|slot| slot.info.read().name.clone())
    }

    /// Two imports of the same qualified name resolve to the same module.
    pub fn id_by_name(&self, name: &ModuleName) -> Option<ModuleId> {
        self.by_name.get(name).map(|id| *id)
    }

    pub fn file_to_module(&self, file: FileId) -> Option<ModuleId> {
        self.by_file.get(&file).map(|id| *id)
    }

    pub fn push_diagnostic(&self, id: ModuleId, diagnostic: Diagnostic) {
        if let Some(slot) = self.slot(id) {
            slot.info.write().diagnostics.push(diagnostic);
        }
    }

    /// Diagnostics are reported upward for user modules only; library,
    /// stub and builtin diagnostics are suppressed.
    pub fn reportable_diagnostics(&self, id: ModuleId) -> Diagnostics {
        let Some(info) = self.module_info(id) else {
            return Diagnostics::Empty;
        };
        match info.kind {
            ModuleKind::User | ModuleKind::Package => Diagnostics::from(info.diagnostics),
            _ => Diagnostics::Empty,
        }
    }

    fn slot(&self, id: ModuleId) -> Option<Arc<ModuleSlot>> {
        self.slots.read().get(id.0 as usize).cloned()
    }

    fn allocate(&self, name: ModuleName) -> ModuleId {
        let mut slots = self.slots.write();
        let id = ModuleId(u32::try_from(slots.len()).expect("module count exceeds u32"));
        slots.push(Arc::new(ModuleSlot::new(name)));
        id
    }

    /// Resets a module's content; analysis restarts from `None` on the
    /// next request.
    pub fn invalidate(&self, db: &dyn SemanticDb, id: ModuleId) {
        let Some(slot) = self.slot(id) else { return };
        let stub = {
            let mut info = slot.info.write();
            info.state = ContentState::None;
            info.content_version += 1;
            info.diagnostics.clear();
            info.analyzing_thread = None;
            info.stub
        };
        let jar: &SemanticJar = db.jar();
        jar.scopes.remove(id);
        jar.type_store.remove_module(id);
        if let Some(stub) = stub {
            self.invalidate(db, stub);
        }
        slot.notify();
    }

    /// The builtins module is a cached singleton, initialised once. The
    /// `typing` factory registers alongside it.
    pub fn builtins(&self, db: &dyn SemanticDb) -> ModuleId {
        *self.builtins.get_or_init(|| {
            self.specialize(
                ModuleName::new("typing"),
                Arc::new(|db, id| semantic::builtins::populate_typing(db, id)),
            );
            let id = self.allocate(ModuleName::new("builtins"));
            {
                let slot = self.slot(id).expect("slot was just allocated");
                let mut info = slot.info.write();
                info.kind = ModuleKind::Builtin;
                info.state = ContentState::Analyzed;
                info.qualified_name = "builtins".to_string();
            }
            self.by_name.insert(ModuleName::new("builtins"), id);
            semantic::builtins::populate_builtins(db, id);
            id
        })
    }

    /// Locates, loads and analyzes `name`, sharing work with concurrent
    /// requesters and breaking import cycles.
    #[tracing::instrument(level = "debug", skip(self, db))]
    pub fn resolve(
        &self,
        db: &dyn SemanticDb,
        name: &ModuleName,
    ) -> QueryResult<ModuleResolution> {
        if name.as_str() == "builtins" {
            return Ok(ModuleResolution::Ok(self.builtins(db)));
        }

        for _attempt in 0..MAX_RESOLVE_ATTEMPTS {
            db.cancelled()?;

            let id = match self.by_name.entry(name.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => *entry.get(),
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    let id = self.allocate(name.clone());
                    entry.insert(id);
                    id
                }
            };

            let slot = self.slot(id).expect("registered module should have a slot");

            let claimed = {
                let mut info = slot.info.write();
                match info.state {
                    ContentState::Analyzed => {
                        return Ok(if info.kind == ModuleKind::Unresolved {
                            ModuleResolution::Unresolved(id)
                        } else {
                            ModuleResolution::Ok(id)
                        });
                    }
                    ContentState::None => {
                        info.state = ContentState::Loading;
                        info.analyzing_thread = Some(std::thread::current().id());
                        true
                    }
                    _ => {
                        if info.analyzing_thread == Some(std::thread::current().id()) {
                            // A cyclic import re-entered on the loading
                            // thread: hand back the partially analyzed
                            // module instead of deadlocking.
                            return Ok(ModuleResolution::Ok(id));
                        }
                        false
                    }
                }
            };

            if claimed {
                let result = self.load_and_analyze(db, id, name);
                {
                    let mut info = slot.info.write();
                    info.analyzing_thread = None;
                    if result.is_err() {
                        // Cancelled mid-load; restart from scratch later.
                        info.state = ContentState::None;
                    }
                }
                slot.notify();
                return result;
            }

            // The module is in progress on another worker; wait on its
            // slot and re-check.
            let mut guard = slot.wait_lock.lock();
            self.state_changed_or_timeout(&slot, &mut guard);
        }

        tracing::debug!("module '{name}' still loading after bounded retries");
        Ok(ModuleResolution::NeedRetry)
    }

    fn state_changed_or_timeout(
        &self,
        slot: &ModuleSlot,
        guard: &mut parking_lot::MutexGuard<'_, ()>,
    ) {
        let _timed_out = slot.state_changed.wait_for(guard, RESOLVE_WAIT);
    }

    fn load_and_analyze(
        &self,
        db: &dyn SemanticDb,
        id: ModuleId,
        name: &ModuleName,
    ) -> QueryResult<ModuleResolution> {
        let slot = self.slot(id).expect("loading module should have a slot");

        // Specialized modules are constructed by their factory and skip the
        // loader entirely.
        if let Some(factory) = self.get_specialized(name) {
            {
                let mut info = slot.info.write();
                info.kind = ModuleKind::Specialized;
                info.qualified_name = name.as_str().to_string();
            }
            let jar: &SemanticJar = db.jar();
            jar.scopes.insert(id, ScopeStore::new(id, name.as_str()));
            factory(db, id);
            slot.info.write().state = ContentState::Analyzed;
            return Ok(ModuleResolution::Ok(id));
        }

        let search_paths = self.search_paths.read().clone();
        let found = find_in_search_paths(db, name, &search_paths)
            .or_else(|| self.find_compiled(db, name, &search_paths))
            .or_else(|| {
                let stub_paths = self.stub_paths.read().clone();
                find_in_search_paths(db, name, &stub_paths)
            });

        let Some(found) = found else {
            tracing::debug!("module '{name}' is unresolved");
            let mut info = slot.info.write();
            info.kind = ModuleKind::Unresolved;
            // Unresolved modules skip directly to Analyzed.
            info.state = ContentState::Analyzed;
            return Ok(ModuleResolution::Unresolved(id));
        };

        let qualified_name = calculate_qualified_name(db, name, &found);
        {
            let mut info = slot.info.write();
            info.kind = found.kind;
            info.qualified_name = qualified_name.clone();
            info.uri = Some(format!("file://{}", found.path.display()));
        }

        // The persistent store is consulted before parsing; a hit
        // materialises the module directly in the analyzed state.
        let cache = self.analysis_cache.read().clone();
        if let Some(cache) = &cache {
            if let Some(data) = cache.load(&qualified_name) {
                if decode_analysis(db, id, &data) {
                    let mut info = slot.info.write();
                    info.state = ContentState::Analyzed;
                    return Ok(ModuleResolution::Ok(id));
                }
            }
        }

        let file = db.file_id(&found.path);
        self.by_file.insert(file, id);
        let last_modified = found
            .path
            .metadata()
            .ok()
            .map(|metadata| FileTime::from_last_modification_time(&metadata));
        {
            let mut info = slot.info.write();
            info.path = Some(ModulePath::new(found.search_path.clone(), file));
            info.last_modified = last_modified;
            info.state = ContentState::Loaded;
        }

        {
            slot.info.write().state = ContentState::Parsing;
        }
        let parsed = db.parse(file)?;
        {
            let mut info = slot.info.write();
            info.state = ContentState::Parsed;
            for error in parsed.errors() {
                info.diagnostics
                    .push(Diagnostic::parse_error(error.message.clone(), error.span));
            }
        }

        {
            slot.info.write().state = ContentState::Analyzing;
        }
        semantic::analyze_parsed(db, id, &parsed)?;
        {
            slot.info.write().state = ContentState::Analyzed;
        }

        // Pair with a stub unless this module is itself a stub.
        if found.kind != ModuleKind::Stub {
            if let Some(stub_id) = self.load_stub(db, id, name)? {
                self.slot(stub_id)
                    .expect("stub should have a slot")
                    .info
                    .write()
                    .primary = Some(id);
                slot.info.write().stub = Some(stub_id);
            }
        }

        // Analyses of library modules feed the persistent store.
        if let Some(cache) = &cache {
            if found.kind == ModuleKind::Library {
                cache.save(&qualified_name, encode_analysis(db, id));
            }
        }

        Ok(ModuleResolution::Ok(id))
    }

    /// Loads the typeshed (or sibling `.pyi`) stub paired with `primary`.
    fn load_stub(
        &self,
        db: &dyn SemanticDb,
        primary: ModuleId,
        name: &ModuleName,
    ) -> QueryResult<Option<ModuleId>> {
        let stub_paths = self.stub_paths.read().clone();
        let mut found = find_in_search_paths(db, name, &stub_paths);

        if found.is_none() {
            // A sibling stub next to the primary file pairs as well.
            let sibling = self.slot(primary).and_then(|slot| {
                let info = slot.info.read();
                let path = info.path.as_ref()?;
                let primary_path = db.file_path(path.file());
                let stub_path = primary_path.with_extension("pyi");
                db.system().exists(&stub_path).then(|| FoundModule {
                    search_path: path.root().clone(),
                    path: stub_path,
                    kind: ModuleKind::Stub,
                })
            });
            found = sibling;
        }

        let Some(found) = found else {
            return Ok(None);
        };
        if found.kind != ModuleKind::Stub {
            return Ok(None);
        }

        let id = self.allocate(name.clone());
        let file = db.file_id(&found.path);
        self.by_file.insert(file, id);
        {
            let slot = self.slot(id).expect("stub slot was just allocated");
            let mut info = slot.info.write();
            info.kind = ModuleKind::Stub;
            info.qualified_name = format!("{name} (stub)");
            info.path = Some(ModulePath::new(found.search_path.clone(), file));
            info.state = ContentState::Analyzing;
            info.analyzing_thread = Some(std::thread::current().id());
        }

        let parsed = db.parse(file)?;
        semantic::analyze_parsed(db, id, &parsed)?;

        let slot = self.slot(id).expect("stub slot was just allocated");
        let mut info = slot.info.write();
        info.state = ContentState::Analyzed;
        info.analyzing_thread = None;
        Ok(Some(id))
    }

    fn find_compiled(
        &self,
        db: &dyn SemanticDb,
        name: &ModuleName,
        search_paths: &[ModuleSearchPath],
    ) -> Option<FoundModule> {
        let helper = db.settings().introspection_helper.clone()?;
        let module_name = name.components().next_back()?.to_string();

        for search_path in search_paths {
            let mut dir = search_path.path().to_path_buf();
            let mut components: Vec<&str> = name.components().collect();
            components.pop();
            for folder in components {
                dir.push(folder);
            }
            let entries = db
                .system()
                .list_entries(&dir, &format!("{module_name}.*"), false);
            let Some(compiled) = entries.iter().find(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("so" | "pyd")
                )
            }) else {
                continue;
            };

            let kind = if search_path.kind() == ModuleSearchPathKind::StandardLibrary {
                ModuleKind::CompiledBuiltin
            } else {
                ModuleKind::Compiled
            };

            // Scrape the compiled interface to source-like text and feed it
            // through the regular parse path.
            match db.system().run_process(
                &helper,
                &[name.as_str().to_string(), compiled.display().to_string()],
                None,
                crate::system::PROCESS_TIMEOUT,
            ) {
                Ok(scraped) => {
                    let file = db.file_id(compiled);
                    let jar: &crate::db::SourceJar = db.jar();
                    jar.sources.set(file, crate::source::Source::new(scraped));
                    return Some(FoundModule {
                        search_path: search_path.clone(),
                        path: compiled.clone(),
                        kind,
                    });
                }
                Err(err) => {
                    tracing::warn!("scraping compiled module '{name}' failed: {err}");
                    return None;
                }
            }
        }
        None
    }

    /// Reverse lookup: the module whose resolved location is `file_path`.
    pub fn find_module(
        &self,
        db: &dyn SemanticDb,
        file_path: &Path,
    ) -> QueryResult<Option<ModulePath>> {
        let Some(id) = self.path_to_module(db, file_path)? else {
            return Ok(None);
        };
        Ok(self.module_info(id).and_then(|info| info.path))
    }

    /// Resolves a file path to the module it would load as, honoring
    /// search path priority.
    pub fn path_to_module(
        &self,
        db: &dyn SemanticDb,
        path: &Path,
    ) -> QueryResult<Option<ModuleId>> {
        let file = db.file_id(path);
        if let Some(existing) = self.by_file.get(&file) {
            return Ok(Some(*existing));
        }

        let search_paths = self.search_paths.read().clone();
        let Some(root) = search_paths
            .iter()
            .find(|root| path.starts_with(root.path()))
        else {
            return Ok(None);
        };

        let relative = path
            .strip_prefix(root.path())
            .expect("the root is a prefix of the path");
        let Some(name) = module_name_from_relative_path(relative) else {
            return Ok(None);
        };

        let resolution = self.resolve(db, &name)?;
        let Some(id) = resolution.module() else {
            return Ok(None);
        };

        // The name must resolve back to this very path; a lower-priority
        // file shadowed by a package or stub of the same name is ignored.
        let resolved_path = self
            .module_info(id)
            .and_then(|info| info.path.map(|path| db.file_path(path.file())));
        match resolved_path {
            Some(resolved) if &*resolved == path => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    /// Lists immediate subpackages of a directory.
    pub fn get_packages(&self, db: &dyn SemanticDb, dir: &Path) -> Vec<String> {
        let mut packages = Vec::new();
        let system = db.system();
        for entry in system.list_entries(dir, "*", false) {
            if system.is_dir(&entry)
                && (system.exists(&entry.join("__init__.py"))
                    || system.exists(&entry.join("__init__.pyi")))
            {
                if let Some(name) = entry.file_name().and_then(|name| name.to_str()) {
                    packages.push(name.to_string());
                }
            }
        }
        packages.sort();
        packages
    }
}

#[derive(Debug, Clone)]
struct FoundModule {
    search_path: ModuleSearchPath,
    path: PathBuf,
    kind: ModuleKind,
}

fn module_name_from_relative_path(path: &Path) -> Option<ModuleName> {
    let mut name = String::new();
    if let Some(parent) = path.parent() {
        for component in parent.components() {
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(component.as_os_str().to_str()?);
        }
    }
    let stem = path.file_stem()?.to_str()?;
    if stem != "__init__" {
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(stem);
    }
    if name.is_empty() {
        return None;
    }
    Some(ModuleName::new(&name))
}

fn find_in_search_paths(
    db: &dyn SemanticDb,
    name: &ModuleName,
    search_paths: &[ModuleSearchPath],
) -> Option<FoundModule> {
    let system = db.system();

    'search_path: for search_path in search_paths {
        let mut package_path = search_path.path().to_path_buf();

        let mut components = name.components();
        let module_name = components.next_back()?;

        // For `foo.bar.baz`, every folder on the way must be a package.
        for folder in components {
            package_path.push(folder);

            if !system.exists(&package_path.join("__init__.py"))
                && !system.exists(&package_path.join("__init__.pyi"))
            {
                continue 'search_path;
            }
        }

        package_path.push(module_name);

        let is_package = system.is_dir(&package_path);
        if is_package {
            package_path.push("__init__");
        }

        let stub = package_path.with_extension("pyi");
        if system.exists(&stub) {
            return Some(FoundModule {
                search_path: search_path.clone(),
                path: stub,
                kind: ModuleKind::Stub,
            });
        }

        let module = package_path.with_extension("py");
        if system.exists(&module) {
            let kind = if is_package {
                ModuleKind::Package
            } else {
                search_path.kind().module_kind()
            };
            return Some(FoundModule {
                search_path: search_path.clone(),
                path: module,
                kind,
            });
        }
    }

    None
}

/// Stable module identity across analysis runs.
///
/// Site-packages distributions take their version from the single matching
/// `.dist-info` sibling; standard library modules take the language
/// version; everything else is tagged with a digest over the sizes of the
/// `.py` files next to the module, so the name is stable for unchanged
/// trees.
fn calculate_qualified_name(db: &dyn SemanticDb, name: &ModuleName, found: &FoundModule) -> String {
    let system = db.system();

    match found.search_path.kind() {
        ModuleSearchPathKind::ThirdParty => {
            let first = name.components().next().unwrap_or(name.as_str());
            let dist_infos = system.list_entries(
                found.search_path.path(),
                &format!("{first}-*.dist-info"),
                false,
            );
            if let [single] = dist_infos.as_slice() {
                if let Some(dir_name) = single.file_stem().and_then(|stem| stem.to_str()) {
                    if let Some(version) = dir_name
                        .strip_prefix(first)
                        .and_then(|rest| rest.strip_prefix('-'))
                    {
                        return format!("{name}({version})");
                    }
                }
            }
            size_digest_name(db, name, found)
        }
        ModuleSearchPathKind::StandardLibrary => {
            format!("{name}({})", db.settings().target_version.version_tag())
        }
        ModuleSearchPathKind::FirstParty => size_digest_name(db, name, found),
    }
}

fn size_digest_name(db: &dyn SemanticDb, name: &ModuleName, found: &FoundModule) -> String {
    let folder = found
        .path
        .parent()
        .unwrap_or_else(|| found.search_path.path());
    let mut entries: Vec<(String, u64)> = db
        .system()
        .list_entries(folder, "*.py", false)
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?.to_string();
            let size = path.metadata().ok()?.len();
            Some((file_name, size))
        })
        .collect();
    entries.sort();

    let mut hasher = rustc_hash::FxHasher::default();
    for (file_name, size) in entries {
        file_name.hash(&mut hasher);
        size.hash(&mut hasher);
    }
    let digest = URL_SAFE_NO_PAD.encode(hasher.finish().to_le_bytes());
    format!("{name}.{digest}")
}

// The persistent form of an analysis is a flat summary of the global
// scope: one `name\tkind` line per variable, where kind is a builtin name
// or a marker. Everything richer re-analyzes from source.

fn encode_analysis(db: &dyn SemanticDb, module: ModuleId) -> Vec<u8> {
    let jar: &SemanticJar = db.jar();
    let mut out = String::new();
    jar.scopes.with(module, |scopes| {
        for variable in scopes.scope(ScopeId::ROOT).variables() {
            let tag = match variable.value() {
                Value::Type(Type::Builtin(builtin)) => format!("type:{}", builtin.name()),
                Value::Instance(Type::Builtin(builtin)) => {
                    format!("instance:{}", builtin.name())
                }
                _ => "unknown".to_string(),
            };
            out.push_str(variable.name().as_str());
            out.push('\t');
            out.push_str(&tag);
            out.push('\n');
        }
    });
    out.into_bytes()
}

fn decode_analysis(db: &dyn SemanticDb, module: ModuleId, data: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(data) else {
        return false;
    };
    let jar: &SemanticJar = db.jar();
    let name = jar
        .registry
        .module_name(module)
        .map(|name| name.as_str().to_string())
        .unwrap_or_default();
    let mut scopes = ScopeStore::new(module, &name);

    for line in text.lines() {
        let Some((variable, tag)) = line.split_once('\t') else {
            return false;
        };
        let value = match tag.split_once(':') {
            Some(("type", builtin)) => builtin_by_name(builtin).map(|b| Value::Type(Type::Builtin(b))),
            Some(("instance", builtin)) => {
                builtin_by_name(builtin).map(|b| Value::Instance(Type::Builtin(b)))
            }
            _ => None,
        }
        .unwrap_or(Value::Unknown);
        scopes.declare(
            ScopeId::ROOT,
            &Name::new(variable),
            value,
            VariableSource::Declaration,
            None,
            true,
        );
    }

    jar.scopes.insert(module, scopes);
    true
}

fn builtin_by_name(name: &str) -> Option<BuiltinType> {
    [
        BuiltinType::Object,
        BuiltinType::Type,
        BuiltinType::Int,
        BuiltinType::Long,
        BuiltinType::Float,
        BuiltinType::Complex,
        BuiltinType::Bool,
        BuiltinType::Str,
        BuiltinType::Bytes,
        BuiltinType::Unicode,
        BuiltinType::List,
        BuiltinType::Tuple,
        BuiltinType::Dict,
        BuiltinType::Set,
        BuiltinType::FrozenSet,
        BuiltinType::None,
        BuiltinType::Ellipsis,
        BuiltinType::Function,
        BuiltinType::Module,
        BuiltinType::Iterator,
        BuiltinType::Slice,
        BuiltinType::Property,
        BuiltinType::StaticMethod,
        BuiltinType::ClassMethod,
    ]
    .into_iter()
    .find(|builtin| builtin.name() == name)
}

/// Resolves a module name to a loaded, analyzed module.
pub fn resolve_module(db: &dyn SemanticDb, name: &ModuleName) -> QueryResult<ModuleResolution> {
    let jar: &SemanticJar = db.jar();
    jar.registry.resolve(db, name)
}

pub fn path_to_module(db: &dyn SemanticDb, path: &Path) -> QueryResult<Option<ModuleId>> {
    let jar: &SemanticJar = db.jar();
    jar.registry.path_to_module(db, path)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::db::tests::TestDb;
    use crate::db::{HasJar, SemanticDb, SemanticJar, SourceDb};
    use crate::ProgramSettings;

    use super::{
        typeshed_search_paths, ModuleKind, ModuleName, ModuleResolution, ModuleSearchPath,
        ModuleSearchPathKind,
    };

    struct TestCase {
        temp_dir: tempfile::TempDir,
        db: TestDb,
        src: PathBuf,
        site_packages: PathBuf,
    }

    fn create_resolver() -> std::io::Result<TestCase> {
        let temp_dir = tempfile::tempdir()?;

        let src = temp_dir.path().canonicalize()?.join("src");
        let site_packages = temp_dir.path().canonicalize()?.join("site_packages");
        std::fs::create_dir(&src)?;
        std::fs::create_dir(&site_packages)?;

        let db = TestDb::new(ProgramSettings::default());
        let jar: &SemanticJar = db.jar();
        jar.registry.set_search_paths(vec![
            ModuleSearchPath::new(src.clone(), ModuleSearchPathKind::FirstParty),
            ModuleSearchPath::new(site_packages.clone(), ModuleSearchPathKind::ThirdParty),
        ]);

        Ok(TestCase {
            temp_dir,
            db,
            src,
            site_packages,
        })
    }

    fn resolve(case: &TestCase, name: &str) -> ModuleResolution {
        let jar: &SemanticJar = case.db.jar();
        jar.registry
            .resolve(&case.db, &ModuleName::new(name))
            .unwrap()
    }

    #[test]
    fn first_party_module() -> std::io::Result<()> {
        let case = create_resolver()?;
        std::fs::write(case.src.join("foo.py"), "")?;

        let ModuleResolution::Ok(foo) = resolve(&case, "foo") else {
            panic!("foo should resolve");
        };

        let jar: &SemanticJar = case.db.jar();
        let info = jar.registry.module_info(foo).unwrap();
        assert_eq!(info.kind, ModuleKind::User);
        assert_eq!(info.name, ModuleName::new("foo"));
        assert_eq!(
            &*case.db.file_path(info.path.unwrap().file()),
            case.src.join("foo.py")
        );

        Ok(())
    }

    #[test]
    fn module_identity_is_stable() -> std::io::Result<()> {
        let case = create_resolver()?;
        std::fs::write(case.src.join("foo.py"), "")?;

        let first = resolve(&case, "foo");
        let second = resolve(&case, "foo");

        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn package_priority_over_module() -> std::io::Result<()> {
        let case = create_resolver()?;

        let foo_dir = case.src.join("foo");
        std::fs::create_dir(&foo_dir)?;
        std::fs::write(foo_dir.join("__init__.py"), "")?;
        std::fs::write(case.src.join("foo.py"), "")?;

        let ModuleResolution::Ok(foo) = resolve(&case, "foo") else {
            panic!("foo should resolve");
        };

        let jar: &SemanticJar = case.db.jar();
        let info = jar.registry.module_info(foo).unwrap();
        assert_eq!(info.kind, ModuleKind::Package);
        assert_eq!(
            &*case.db.file_path(info.path.unwrap().file()),
            foo_dir.join("__init__.py")
        );

        Ok(())
    }

    #[test]
    fn stub_preferred_over_module() -> std::io::Result<()> {
        let case = create_resolver()?;
        std::fs::write(case.src.join("foo.pyi"), "")?;
        std::fs::write(case.src.join("foo.py"), "")?;

        let ModuleResolution::Ok(foo) = resolve(&case, "foo") else {
            panic!("foo should resolve");
        };

        let jar: &SemanticJar = case.db.jar();
        let info = jar.registry.module_info(foo).unwrap();
        assert_eq!(info.kind, ModuleKind::Stub);
        assert_eq!(
            &*case.db.file_path(info.path.unwrap().file()),
            case.src.join("foo.pyi")
        );

        Ok(())
    }

    #[test]
    fn sub_packages() -> std::io::Result<()> {
        let case = create_resolver()?;

        let bar = case.src.join("foo").join("bar");
        std::fs::create_dir_all(&bar)?;
        std::fs::write(case.src.join("foo").join("__init__.py"), "")?;
        std::fs::write(bar.join("__init__.py"), "")?;
        std::fs::write(bar.join("baz.py"), "")?;

        let ModuleResolution::Ok(baz) = resolve(&case, "foo.bar.baz") else {
            panic!("foo.bar.baz should resolve");
        };

        let jar: &SemanticJar = case.db.jar();
        let info = jar.registry.module_info(baz).unwrap();
        assert_eq!(
            &*case.db.file_path(info.path.unwrap().file()),
            bar.join("baz.py")
        );

        Ok(())
    }

    #[test]
    fn folder_without_init_py() -> std::io::Result<()> {
        let case = create_resolver()?;

        let bar = case.src.join("foo").join("bar");
        std::fs::create_dir_all(&bar)?;
        std::fs::write(case.src.join("foo").join("__init__.py"), "")?;
        // `bar` has no `__init__.py`.
        std::fs::write(bar.join("baz.py"), "")?;

        assert!(matches!(
            resolve(&case, "foo.bar.baz"),
            ModuleResolution::Unresolved(_)
        ));

        Ok(())
    }

    #[test]
    fn search_path_priority() -> std::io::Result<()> {
        let case = create_resolver()?;

        std::fs::write(case.src.join("foo.py"), "")?;
        std::fs::write(case.site_packages.join("foo.py"), "")?;

        let ModuleResolution::Ok(foo) = resolve(&case, "foo") else {
            panic!("foo should resolve");
        };

        let jar: &SemanticJar = case.db.jar();
        let info = jar.registry.module_info(foo).unwrap();
        assert_eq!(info.path.unwrap().root().kind(), ModuleSearchPathKind::FirstParty);

        Ok(())
    }

    #[test]
    fn missing_module_is_unresolved() -> std::io::Result<()> {
        let case = create_resolver()?;

        let resolution = resolve(&case, "does_not_exist");
        assert!(matches!(resolution, ModuleResolution::Unresolved(_)));

        // Unresolved modules keep their identity.
        assert_eq!(resolution, resolve(&case, "does_not_exist"));
        Ok(())
    }

    #[test]
    fn path_to_module_ignores_shadowed_files() -> std::io::Result<()> {
        let case = create_resolver()?;

        let foo_dir = case.src.join("foo");
        std::fs::create_dir(&foo_dir)?;
        std::fs::write(foo_dir.join("__init__.py"), "")?;
        let shadowed = case.src.join("foo.py");
        std::fs::write(&shadowed, "")?;

        let jar: &SemanticJar = case.db.jar();
        let by_init = jar
            .registry
            .path_to_module(&case.db, &foo_dir.join("__init__.py"))
            .unwrap();
        assert!(by_init.is_some());

        let by_shadowed = jar.registry.path_to_module(&case.db, &shadowed).unwrap();
        assert_eq!(by_shadowed, None);

        Ok(())
    }

    #[test]
    fn dist_info_qualified_name() -> std::io::Result<()> {
        let case = create_resolver()?;

        std::fs::write(case.site_packages.join("requests.py"), "")?;
        std::fs::create_dir(case.site_packages.join("requests-2.31.0.dist-info"))?;

        let ModuleResolution::Ok(requests) = resolve(&case, "requests") else {
            panic!("requests should resolve");
        };

        let jar: &SemanticJar = case.db.jar();
        let info = jar.registry.module_info(requests).unwrap();
        assert_eq!(info.qualified_name, "requests(2.31.0)");

        Ok(())
    }

    #[test]
    fn digest_qualified_name_is_stable() -> std::io::Result<()> {
        let case = create_resolver()?;
        std::fs::write(case.src.join("foo.py"), "x = 1")?;

        let ModuleResolution::Ok(foo) = resolve(&case, "foo") else {
            panic!("foo should resolve");
        };
        let jar: &SemanticJar = case.db.jar();
        let first = jar.registry.module_info(foo).unwrap().qualified_name;

        assert!(first.starts_with("foo."), "{first} should carry a digest");

        // Re-running over unchanged contents gives the same name.
        jar.registry.invalidate(&case.db, foo);
        let resolution = jar
            .registry
            .resolve(&case.db, &ModuleName::new("foo"))
            .unwrap();
        assert_eq!(resolution, ModuleResolution::Ok(foo));
        let second = jar.registry.module_info(foo).unwrap().qualified_name;
        assert_eq!(first, second);

        Ok(())
    }

    #[test]
    fn typeshed_triple() {
        let paths = typeshed_search_paths(
            std::path::Path::new("/typeshed"),
            crate::TargetVersion::Py38,
        );
        let rendered: Vec<_> = paths
            .iter()
            .map(|path| path.path().display().to_string())
            .collect();
        assert_eq!(
            rendered,
            vec![
                "/typeshed/stdlib/3.8",
                "/typeshed/stdlib/3",
                "/typeshed/stdlib/2and3",
                "/typeshed/third_party/3.8",
                "/typeshed/third_party/3",
                "/typeshed/third_party/2and3",
            ]
        );
    }

    #[test]
    fn relative_name_resolution() {
        let importer = ModuleName::new("pkg.sub.mod");
        assert_eq!(
            ModuleName::relative(1, Some("other"), &importer, false),
            Some(ModuleName::new("pkg.sub.other"))
        );
        assert_eq!(
            ModuleName::relative(2, Some("x"), &importer, false),
            Some(ModuleName::new("pkg.x"))
        );
        assert_eq!(ModuleName::relative(4, Some("x"), &importer, false), None);
    }

    #[test]
    fn get_packages_lists_init_folders() -> std::io::Result<()> {
        let case = create_resolver()?;

        std::fs::create_dir(case.src.join("alpha"))?;
        std::fs::write(case.src.join("alpha").join("__init__.py"), "")?;
        std::fs::create_dir(case.src.join("beta"))?;

        let jar: &SemanticJar = case.db.jar();
        let packages = jar.registry.get_packages(&case.db, &case.src);
        assert_eq!(packages, vec!["alpha".to_string()]);

        let _keep_alive = &case.temp_dir;
        Ok(())
    }
}
