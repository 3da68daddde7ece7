use bitflags::bitflags;
use rustc_hash::FxHashSet;

use dunlin_python_ast::Span;

use crate::module::ModuleId;
use crate::semantic::types::{BuiltinType, Type, Value};
use crate::{FxDashMap, FxIndexMap, Name};

/// Index of a scope within its module's [`ScopeStore`]. The global scope of
/// every module is [`ScopeId::ROOT`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Class,
    Function,
}

/// How a variable came to exist in its scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VariableSource {
    Declaration,
    Import,
    Builtin,
    Locality,
}

/// A position in some module's source. References are held as plain
/// location tuples, never as owning links, so reference tracking cannot
/// create cycles.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub module: ModuleId,
    pub span: Span,
}

bitflags! {
    /// Which scopes a name lookup consults.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct LookupOptions: u8 {
        /// Include the innermost scope.
        const LOCAL = 1 << 0;
        /// Include scopes strictly between the innermost and the global.
        const NONLOCAL = 1 << 1;
        /// Include the global scope.
        const GLOBAL = 1 << 2;
        /// On a miss, fall through to the builtins module's global scope.
        const BUILTINS = 1 << 3;
        /// Include class-body variables while evaluating methods.
        const CLASS_MEMBERS = 1 << 4;
    }
}

impl LookupOptions {
    pub const NORMAL: LookupOptions = LookupOptions::LOCAL
        .union(LookupOptions::NONLOCAL)
        .union(LookupOptions::GLOBAL)
        .union(LookupOptions::BUILTINS);
}

/// Back-link from an import binding to the variable it aliases, by name;
/// reference tracking forwards along it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportLink {
    pub module: ModuleId,
    pub name: Name,
}

#[derive(Clone, Debug)]
pub struct Variable {
    name: Name,
    value: Value,
    source: VariableSource,
    definition: Option<Location>,
    references: Vec<Location>,
    import_link: Option<ImportLink>,
}

impl Variable {
    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn source(&self) -> VariableSource {
        self.source
    }

    pub fn definition(&self) -> Option<Location> {
        self.definition
    }

    pub fn references(&self) -> &[Location] {
        &self.references
    }

    pub fn import_link(&self) -> Option<&ImportLink> {
        self.import_link.as_ref()
    }
}

#[derive(Debug)]
pub struct Scope {
    name: Name,
    kind: ScopeKind,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    variables: FxIndexMap<Name, Variable>,
    /// Names declared `nonlocal` in this scope.
    nonlocals: FxHashSet<Name>,
    /// Names declared `global` in this scope.
    globals: FxHashSet<Name>,
    /// Names bound by an import.
    imported: FxHashSet<Name>,
}

impl Scope {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    pub fn children(&self) -> &[ScopeId] {
        &self.children
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(&Name::new(name))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &Name> {
        self.variables.keys()
    }

    pub fn is_nonlocal(&self, name: &str) -> bool {
        self.nonlocals.contains(&Name::new(name))
    }

    pub fn is_declared_global(&self, name: &str) -> bool {
        self.globals.contains(&Name::new(name))
    }

    pub fn is_imported(&self, name: &str) -> bool {
        self.imported.contains(&Name::new(name))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LookupHit {
    pub scope: ScopeId,
}

/// All scopes of one module; the root scope is the module's global scope.
#[derive(Debug)]
pub struct ScopeStore {
    module: ModuleId,
    scopes: Vec<Scope>,
    /// The names listed in a literal `__all__`, when the module has one.
    dunder_all: Option<Vec<Name>>,
}

impl ScopeStore {
    pub fn new(module: ModuleId, module_name: &str) -> Self {
        Self {
            module,
            scopes: vec![Scope {
                name: Name::new(module_name),
                kind: ScopeKind::Module,
                parent: None,
                children: Vec::new(),
                variables: FxIndexMap::default(),
                nonlocals: FxHashSet::default(),
                globals: FxHashSet::default(),
                imported: FxHashSet::default(),
            }],
            dunder_all: None,
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn set_dunder_all(&mut self, names: Vec<Name>) {
        self.dunder_all = Some(names);
    }

    pub fn dunder_all(&self) -> Option<&[Name]> {
        self.dunder_all.as_deref()
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn add_scope(&mut self, parent: ScopeId, name: &str, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(u32::try_from(self.scopes.len()).expect("scope count exceeds u32"));
        self.scopes.push(Scope {
            name: Name::new(name),
            kind,
            parent: Some(parent),
            children: Vec::new(),
            variables: FxIndexMap::default(),
            nonlocals: FxHashSet::default(),
            globals: FxHashSet::default(),
            imported: FxHashSet::default(),
        });
        self.scopes[parent.0 as usize].children.push(id);
        self.declare_implicit_members(id, kind);
        id
    }

    /// Walks scope ids from `scope` towards (and including) the global
    /// scope.
    pub fn enumerate_towards_global(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(scope), |current| self.scope(*current).parent)
    }

    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: &Name,
        value: Value,
        source: VariableSource,
        location: Option<Location>,
        overwrite: bool,
    ) {
        let scope = &mut self.scopes[scope.0 as usize];
        if let Some(existing) = scope.variables.get_mut(name) {
            if matches!(value, Value::Unknown)
                && !matches!(existing.value, Value::Unknown)
                && !overwrite
            {
                // An Unknown re-declaration never clobbers a known value.
                return;
            }
            existing.value = value;
            existing.source = source;
            if let Some(location) = location {
                existing.references.push(location);
            }
        } else {
            scope.variables.insert(
                name.clone(),
                Variable {
                    name: name.clone(),
                    value,
                    source,
                    definition: location,
                    references: Vec::new(),
                    import_link: None,
                },
            );
        }
    }

    /// Binds an import alias: the new variable forwards its references to
    /// the parent variable in the source module.
    pub fn link(
        &mut self,
        scope: ScopeId,
        name: &Name,
        value: Value,
        link: ImportLink,
        location: Option<Location>,
    ) {
        let scope = &mut self.scopes[scope.0 as usize];
        scope.imported.insert(name.clone());
        scope.variables.insert(
            name.clone(),
            Variable {
                name: name.clone(),
                value,
                source: VariableSource::Import,
                definition: location,
                references: Vec::new(),
                import_link: Some(link),
            },
        );
    }

    /// Flags a binding that originated from an import without a parent
    /// variable to forward to (plain `import x`).
    pub fn mark_imported(&mut self, scope: ScopeId, name: &Name) {
        self.scopes[scope.0 as usize].imported.insert(name.clone());
    }

    pub fn declare_nonlocal(&mut self, scope: ScopeId, name: &Name) {
        self.scopes[scope.0 as usize].nonlocals.insert(name.clone());
    }

    pub fn declare_global(&mut self, scope: ScopeId, name: &Name) {
        self.scopes[scope.0 as usize].globals.insert(name.clone());
    }

    /// Removes a binding, preserving the insertion order of the rest.
    /// Comprehension iteration variables are removed on scope exit.
    pub fn remove_variable(&mut self, scope: ScopeId, name: &Name) -> Option<Variable> {
        self.scopes[scope.0 as usize].variables.shift_remove(name)
    }

    /// Appends a reference location and returns the import back-link, if
    /// any, so the caller can forward the reference to the parent module.
    pub fn record_reference(
        &mut self,
        scope: ScopeId,
        name: &Name,
        location: Location,
    ) -> Option<ImportLink> {
        let variable = self.scopes[scope.0 as usize].variables.get_mut(name)?;
        variable.references.push(location);
        variable.import_link.clone()
    }

    /// Resolves `name` per the lookup mask, walking from the innermost
    /// scope outward. The builtins fallback lives with the caller since the
    /// builtins scope belongs to another module.
    pub fn lookup(
        &self,
        from: ScopeId,
        name: &str,
        options: LookupOptions,
    ) -> Option<(Value, ScopeId)> {
        let key = Name::new(name);

        // A `global` declaration in the innermost scope redirects the
        // lookup straight to the global scope.
        if self.scope(from).globals.contains(&key) {
            if options.contains(LookupOptions::GLOBAL) {
                let root = self.scope(ScopeId::ROOT);
                return root
                    .variables
                    .get(&key)
                    .map(|variable| (variable.value.clone(), ScopeId::ROOT));
            }
            return None;
        }

        for scope_id in self.enumerate_towards_global(from) {
            let scope = self.scope(scope_id);
            let position = if scope_id == from {
                ScopePosition::Innermost
            } else if scope_id == ScopeId::ROOT {
                ScopePosition::Global
            } else {
                ScopePosition::Enclosing
            };

            let included = match position {
                ScopePosition::Innermost => options.contains(LookupOptions::LOCAL),
                ScopePosition::Enclosing => {
                    options.contains(LookupOptions::NONLOCAL)
                        && (scope.kind != ScopeKind::Class
                            || options.contains(LookupOptions::CLASS_MEMBERS))
                }
                ScopePosition::Global => options.contains(LookupOptions::GLOBAL),
            };

            if !included {
                continue;
            }

            if let Some(variable) = scope.variables.get(&key) {
                return Some((variable.value.clone(), scope_id));
            }
        }

        None
    }

    fn declare_implicit_members(&mut self, scope: ScopeId, kind: ScopeKind) {
        let str_instance = Value::Instance(Type::Builtin(BuiltinType::Str));
        let dict_instance = Value::Instance(Type::Builtin(BuiltinType::Dict));
        let tuple_instance = Value::Instance(Type::Builtin(BuiltinType::Tuple));

        let members: &[(&str, Value)] = match kind {
            ScopeKind::Class => &[
                ("__class__", Value::Instance(Type::Builtin(BuiltinType::Type))),
                ("__name__", str_instance.clone()),
                ("__doc__", str_instance.clone()),
                ("__dict__", dict_instance.clone()),
            ],
            ScopeKind::Function => &[
                ("__name__", str_instance.clone()),
                ("__doc__", str_instance.clone()),
                ("__dict__", dict_instance.clone()),
                ("__closure__", tuple_instance.clone()),
                ("__defaults__", tuple_instance.clone()),
                (
                    "__func__",
                    Value::Instance(Type::Builtin(BuiltinType::Function)),
                ),
                ("__globals__", dict_instance),
                ("__self__", Value::Instance(Type::Builtin(BuiltinType::Object))),
                ("__code__", Value::Instance(Type::Builtin(BuiltinType::Object))),
            ],
            ScopeKind::Module => &[],
        };

        for (name, value) in members {
            self.declare(
                scope,
                &Name::new(name),
                value.clone(),
                VariableSource::Builtin,
                None,
                false,
            );
        }
    }
}

enum ScopePosition {
    Innermost,
    Enclosing,
    Global,
}

/// Per-module scope stores, shared behind a concurrent map. Closures must
/// not re-enter the store for the same module.
#[derive(Debug, Default)]
pub struct ScopeStores {
    stores: FxDashMap<ModuleId, ScopeStore>,
}

impl ScopeStores {
    pub fn insert(&self, module: ModuleId, store: ScopeStore) {
        self.stores.insert(module, store);
    }

    pub fn contains(&self, module: ModuleId) -> bool {
        self.stores.contains_key(&module)
    }

    pub fn remove(&self, module: ModuleId) {
        self.stores.remove(&module);
    }

    pub fn with<R>(&self, module: ModuleId, f: impl FnOnce(&ScopeStore) -> R) -> Option<R> {
        self.stores.get(&module).map(|store| f(&store))
    }

    pub fn with_mut<R>(
        &self,
        module: ModuleId,
        f: impl FnOnce(&mut ScopeStore) -> R,
    ) -> Option<R> {
        self.stores.get_mut(&module).map(|mut store| f(&mut store))
    }
}

#[cfg(test)]
mod tests {
    use dunlin_python_ast::Span;

    use crate::module::ModuleId;
    use crate::semantic::types::{BuiltinType, Type, Value};
    use crate::Name;

    use super::{Location, LookupOptions, ScopeId, ScopeKind, ScopeStore, VariableSource};

    fn int_instance() -> Value {
        Value::Instance(Type::Builtin(BuiltinType::Int))
    }

    fn str_instance() -> Value {
        Value::Instance(Type::Builtin(BuiltinType::Str))
    }

    fn test_store() -> ScopeStore {
        ScopeStore::new(ModuleId::from_u32(0), "<module>")
    }

    #[test]
    fn unknown_never_clobbers_known() {
        let mut store = test_store();
        let name = Name::new("x");

        store.declare(
            ScopeId::ROOT,
            &name,
            int_instance(),
            VariableSource::Declaration,
            None,
            false,
        );
        store.declare(
            ScopeId::ROOT,
            &name,
            Value::Unknown,
            VariableSource::Declaration,
            None,
            false,
        );

        let (value, _) = store
            .lookup(ScopeId::ROOT, "x", LookupOptions::LOCAL)
            .unwrap();
        assert_eq!(value, int_instance());
    }

    #[test]
    fn known_value_updates_and_appends_reference() {
        let mut store = test_store();
        let name = Name::new("x");
        let location = Location {
            module: ModuleId::from_u32(0),
            span: Span::new(10, 11),
        };

        store.declare(
            ScopeId::ROOT,
            &name,
            int_instance(),
            VariableSource::Declaration,
            None,
            false,
        );
        store.declare(
            ScopeId::ROOT,
            &name,
            str_instance(),
            VariableSource::Declaration,
            Some(location),
            false,
        );

        let variable = store.scope(ScopeId::ROOT).variable("x").unwrap();
        assert_eq!(variable.value(), &str_instance());
        assert_eq!(variable.references(), &[location]);
    }

    #[test]
    fn lookup_local_never_reaches_outer_scopes() {
        let mut store = test_store();
        store.declare(
            ScopeId::ROOT,
            &Name::new("x"),
            int_instance(),
            VariableSource::Declaration,
            None,
            false,
        );
        let function = store.add_scope(ScopeId::ROOT, "f", ScopeKind::Function);

        assert_eq!(store.lookup(function, "x", LookupOptions::LOCAL), None);
        assert!(store
            .lookup(function, "x", LookupOptions::NORMAL)
            .is_some());
    }

    #[test]
    fn lookup_nonlocal_excludes_innermost_and_global() {
        let mut store = test_store();
        let outer = store.add_scope(ScopeId::ROOT, "outer", ScopeKind::Function);
        let inner = store.add_scope(outer, "inner", ScopeKind::Function);

        store.declare(
            ScopeId::ROOT,
            &Name::new("g"),
            int_instance(),
            VariableSource::Declaration,
            None,
            false,
        );
        store.declare(
            outer,
            &Name::new("n"),
            str_instance(),
            VariableSource::Declaration,
            None,
            false,
        );
        store.declare(
            inner,
            &Name::new("l"),
            int_instance(),
            VariableSource::Declaration,
            None,
            false,
        );

        assert_eq!(store.lookup(inner, "l", LookupOptions::NONLOCAL), None);
        assert_eq!(store.lookup(inner, "g", LookupOptions::NONLOCAL), None);
        let (_, scope) = store.lookup(inner, "n", LookupOptions::NONLOCAL).unwrap();
        assert_eq!(scope, outer);
    }

    #[test]
    fn class_body_names_hidden_from_methods_by_default() {
        let mut store = test_store();
        let class = store.add_scope(ScopeId::ROOT, "C", ScopeKind::Class);
        let method = store.add_scope(class, "m", ScopeKind::Function);

        store.declare(
            class,
            &Name::new("attr"),
            int_instance(),
            VariableSource::Declaration,
            None,
            false,
        );

        assert_eq!(store.lookup(method, "attr", LookupOptions::NORMAL), None);
        assert!(store
            .lookup(
                method,
                "attr",
                LookupOptions::NORMAL | LookupOptions::CLASS_MEMBERS
            )
            .is_some());
    }

    #[test]
    fn global_declaration_redirects_to_global_scope() {
        let mut store = test_store();
        let function = store.add_scope(ScopeId::ROOT, "f", ScopeKind::Function);
        let name = Name::new("counter");

        store.declare(
            ScopeId::ROOT,
            &name,
            int_instance(),
            VariableSource::Declaration,
            None,
            false,
        );
        store.declare_global(function, &name);
        // A local binding exists but must be bypassed.
        store.declare(
            function,
            &name,
            str_instance(),
            VariableSource::Declaration,
            None,
            true,
        );

        let (value, scope) = store
            .lookup(function, "counter", LookupOptions::NORMAL)
            .unwrap();
        assert_eq!(scope, ScopeId::ROOT);
        assert_eq!(value, int_instance());
    }

    #[test]
    fn implicit_members_present_per_scope_kind() {
        let mut store = test_store();
        let class = store.add_scope(ScopeId::ROOT, "C", ScopeKind::Class);
        let function = store.add_scope(ScopeId::ROOT, "f", ScopeKind::Function);

        assert!(store.scope(class).variable("__name__").is_some());
        assert!(store.scope(class).variable("__dict__").is_some());
        assert!(store.scope(class).variable("__closure__").is_none());

        assert!(store.scope(function).variable("__closure__").is_some());
        assert!(store.scope(function).variable("__code__").is_some());

        let variable = store.scope(function).variable("__name__").unwrap();
        assert_eq!(variable.source(), VariableSource::Builtin);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut store = test_store();
        for name in ["b", "a", "c"] {
            store.declare(
                ScopeId::ROOT,
                &Name::new(name),
                int_instance(),
                VariableSource::Declaration,
                None,
                false,
            );
        }

        let names: Vec<_> = store
            .scope(ScopeId::ROOT)
            .variable_names()
            .map(|name| name.as_str().to_string())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }
}
