use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use dunlin_python_ast as ast;
use dunlin_python_ast::{BinaryOp, UnaryOp};

use crate::db::{HasJar, QueryResult, SemanticDb, SemanticJar};
use crate::lint::Diagnostic;
use crate::module::{resolve_module, ModuleId, ModuleKind, ModuleName, ModuleRegistry};
use crate::semantic::builtins::builtin_member;
use crate::semantic::scope::{
    ImportLink, Location, LookupOptions, ScopeId, ScopeKind, VariableSource,
};
use crate::semantic::types::{
    BoundMethod, BuiltinType, ClassId, ConstantValue, Overload, OverloadBody, OverloadFlags,
    ParameterKind, ParameterSpec, SpecialForm, Type, TypeStore, Value,
};
use crate::{Name, TargetVersion};

/// Collection literals capture at most this many items; longer displays
/// are sampled and flagged inexact.
pub(crate) const COLLECTION_CAPTURE_LIMIT: usize = 1000;

/// Identity of a class, function or lambda definition node; keys the lazy
/// symbol table and the recursion guard.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum DefKey {
    Class(usize),
    Function(usize),
    Lambda(usize),
}

impl DefKey {
    pub(crate) fn class(def: &Arc<ast::ClassDef>) -> Self {
        DefKey::Class(Arc::as_ptr(def) as usize)
    }

    pub(crate) fn function(def: &Arc<ast::FunctionDef>) -> Self {
        DefKey::Function(Arc::as_ptr(def) as usize)
    }

    pub(crate) fn lambda(def: &Arc<ast::LambdaExpr>) -> Self {
        DefKey::Lambda(Arc::as_ptr(def) as usize)
    }
}

#[derive(Clone, Debug)]
enum DefNode {
    Class(Arc<ast::ClassDef>),
    Function(Arc<ast::FunctionDef>),
}

#[derive(Clone, Debug)]
enum EvalState {
    Pending,
    Done(Value),
}

#[derive(Debug)]
struct SymbolEntry {
    node: DefNode,
    scope: ScopeId,
    state: EvalState,
}

/// Per-module symbol table: definition nodes await lazy evaluation; a name
/// reference forces every definition bound to that name, in declaration
/// order, so overload groups collect completely.
#[derive(Debug, Default)]
struct SymbolTable {
    entries: FxHashMap<DefKey, SymbolEntry>,
    by_name: FxHashMap<(ScopeId, Name), Vec<DefKey>>,
}

/// Walks one module's tree, maintaining the scope stack and binding names
/// to values. Failures of one expression never escape
/// [`Evaluator::get_value_from_expression`]; the evaluator bottoms out at
/// `Value::Unknown`.
pub(crate) struct Evaluator<'db> {
    db: &'db dyn SemanticDb,
    pub(crate) module: ModuleId,
    pub(crate) builtins: ModuleId,
    module_kind: ModuleKind,
    scope_stack: Vec<ScopeId>,
    pub(crate) guard: Vec<DefKey>,
    symbols: SymbolTable,
    class_scopes: FxHashMap<ScopeId, ClassId>,
    /// Innermost call frame's `self` binding, for member updates from
    /// method bodies.
    pub(crate) self_frames: Vec<Option<(Name, ClassId)>>,
}

impl<'db> Evaluator<'db> {
    pub(crate) fn new(db: &'db dyn SemanticDb, module: ModuleId) -> Self {
        let jar: &SemanticJar = db.jar();
        let builtins = jar.registry.builtins(db);
        let module_kind = jar
            .registry
            .module_info(module)
            .map(|info| info.kind)
            .unwrap_or(ModuleKind::User);
        Self {
            db,
            module,
            builtins,
            module_kind,
            scope_stack: vec![ScopeId::ROOT],
            guard: Vec::new(),
            symbols: SymbolTable::default(),
            class_scopes: FxHashMap::default(),
            self_frames: Vec::new(),
        }
    }

    pub(crate) fn registry(&self) -> &'db ModuleRegistry {
        let jar: &SemanticJar = self.db.jar();
        &jar.registry
    }

    pub(crate) fn types(&self) -> &'db TypeStore {
        let jar: &SemanticJar = self.db.jar();
        &jar.type_store
    }

    fn scopes(&self) -> &'db crate::semantic::scope::ScopeStores {
        let jar: &SemanticJar = self.db.jar();
        &jar.scopes
    }

    fn version(&self) -> TargetVersion {
        self.db.settings().target_version
    }

    pub(crate) fn current_scope(&self) -> ScopeId {
        *self
            .scope_stack
            .last()
            .expect("scope stack is never empty")
    }

    /// Runs `f` with `scope` pushed; the scope pops on every exit path.
    pub(crate) fn with_scope<R>(
        &mut self,
        scope: ScopeId,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.scope_stack.push(scope);
        let result = f(self);
        self.scope_stack.pop();
        result
    }

    pub(crate) fn declaring_class_of_scope(&self, scope: ScopeId) -> Option<ClassId> {
        self.class_scopes.get(&scope).copied()
    }

    fn location(&self, span: dunlin_python_ast::Span) -> Location {
        Location {
            module: self.module,
            span,
        }
    }

    // --- module walking ---------------------------------------------------

    #[tracing::instrument(level = "debug", skip(self, module))]
    pub(crate) fn walk_module(&mut self, module: &ast::ModModule) -> QueryResult<()> {
        self.walk_statements(&module.body)?;

        // Settle the global scope: everything still pending evaluates now.
        loop {
            let pending: Vec<(ScopeId, Name)> = self
                .symbols
                .by_name
                .iter()
                .filter(|(_, keys)| {
                    keys.iter().any(|key| {
                        matches!(
                            self.symbols.entries.get(key).map(|entry| &entry.state),
                            Some(EvalState::Pending)
                        )
                    })
                })
                .map(|(key, _)| key.clone())
                .collect();
            if pending.is_empty() {
                break;
            }
            for (scope, name) in pending {
                self.ensure_name_evaluated(scope, &name)?;
            }
        }
        Ok(())
    }

    /// Walks a statement list; `Some` carries the first non-Unknown
    /// `return` value encountered.
    pub(crate) fn walk_statements(&mut self, body: &[ast::Stmt]) -> QueryResult<Option<Value>> {
        for stmt in body {
            self.db.cancelled()?;

            match stmt {
                ast::Stmt::Expr(stmt) => {
                    self.get_value_from_expression(&stmt.value)?;
                }
                ast::Stmt::Assignment(stmt) => {
                    self.walk_assignment(stmt)?;
                }
                ast::Stmt::Return(stmt) => {
                    let value = match &stmt.value {
                        Some(expr) => self.get_value_from_expression(expr)?,
                        None => Value::instance(Type::Builtin(BuiltinType::None)),
                    };
                    if !value.is_unknown() {
                        return Ok(Some(value));
                    }
                }
                ast::Stmt::ClassDef(def) => {
                    self.register_class(def.clone());
                }
                ast::Stmt::FunctionDef(def) => {
                    self.register_function(def.clone());
                }
                ast::Stmt::Import(stmt) => {
                    self.walk_import(stmt)?;
                }
                ast::Stmt::ImportFrom(stmt) => {
                    self.walk_import_from(stmt)?;
                }
                ast::Stmt::If(stmt) => {
                    self.get_value_from_expression(&stmt.test)?;
                    if let Some(value) = self.walk_statements(&stmt.body)? {
                        return Ok(Some(value));
                    }
                    if let Some(value) = self.walk_statements(&stmt.orelse)? {
                        return Ok(Some(value));
                    }
                }
                ast::Stmt::Global(stmt) => {
                    let scope = self.current_scope();
                    self.scopes().with_mut(self.module, |scopes| {
                        for name in &stmt.names {
                            scopes.declare_global(scope, &Name::new(&name.id));
                        }
                    });
                }
                ast::Stmt::Nonlocal(stmt) => {
                    let scope = self.current_scope();
                    self.scopes().with_mut(self.module, |scopes| {
                        for name in &stmt.names {
                            scopes.declare_nonlocal(scope, &Name::new(&name.id));
                        }
                    });
                }
                ast::Stmt::Pass(_) => {}
            }
        }
        Ok(None)
    }

    fn walk_assignment(&mut self, stmt: &ast::AssignmentStmt) -> QueryResult<()> {
        let annotated = stmt
            .annotation
            .as_ref()
            .map(|annotation| self.convert_annotation(annotation))
            .transpose()?
            .unwrap_or(Type::Unknown);

        let value = match &stmt.value {
            Some(expr) => self.get_value_from_expression(expr)?,
            None => Value::Unknown,
        };

        // An annotation wins over the inferred value of the right side.
        let binding = if annotated.is_unknown() {
            value
        } else {
            Value::instance(annotated)
        };

        self.capture_dunder_all(stmt);

        for target in &stmt.targets {
            self.assign_target(target, binding.clone())?;
        }
        Ok(())
    }

    /// Records a literal `__all__` so member enumeration can honor it.
    fn capture_dunder_all(&mut self, stmt: &ast::AssignmentStmt) {
        if self.current_scope() != ScopeId::ROOT {
            return;
        }
        let [ast::Expr::Name(target)] = stmt.targets.as_slice() else {
            return;
        };
        if target.id != "__all__" {
            return;
        }
        let items = match &stmt.value {
            Some(ast::Expr::List(list)) => &list.items,
            Some(ast::Expr::Tuple(tuple)) => &tuple.items,
            _ => return,
        };
        let mut names = Vec::with_capacity(items.len());
        for item in items {
            let ast::Expr::Constant(ast::ConstantExpr {
                value: ast::Constant::Str(name),
                ..
            }) = item
            else {
                return;
            };
            names.push(Name::new(name));
        }
        self.scopes().with_mut(self.module, |scopes| {
            scopes.set_dunder_all(names);
        });
    }

    pub(crate) fn assign_target(&mut self, target: &ast::Expr, value: Value) -> QueryResult<()> {
        match target {
            ast::Expr::Name(name) => {
                self.declare_in_current(
                    &Name::new(&name.id),
                    value,
                    VariableSource::Declaration,
                    Some(self.location(name.span)),
                );
            }
            ast::Expr::Tuple(tuple) => {
                let element = self.element_of(&value);
                for item in &tuple.items {
                    self.assign_target(item, Value::instance(element))?;
                }
            }
            ast::Expr::List(list) => {
                let element = self.element_of(&value);
                for item in &list.items {
                    self.assign_target(item, Value::instance(element))?;
                }
            }
            ast::Expr::Member(member) => {
                self.assign_member(member, value)?;
            }
            ast::Expr::Index(index) => {
                self.assign_index(index, value)?;
            }
            ast::Expr::Starred(starred) => {
                self.assign_target(&starred.value, value)?;
            }
            _ => {
                tracing::trace!("ignoring unsupported assignment target");
            }
        }
        Ok(())
    }

    /// `obj.attr = value`. Inside a method body, assignments through the
    /// receiver update the declaring class's member map.
    fn assign_member(&mut self, member: &ast::MemberExpr, value: Value) -> QueryResult<()> {
        if let (ast::Expr::Name(base), Some(Some((self_name, class)))) =
            (&*member.target, self.self_frames.last())
        {
            if base.id.as_str() == self_name.as_str() {
                let class = *class;
                if let Some(class_data) = self.types().class(class) {
                    let name = Name::new(&member.member.id);
                    let location = self.location(member.member.span);
                    self.scopes().with_mut(class.module(), |scopes| {
                        scopes.declare(
                            class_data.scope,
                            &name,
                            value,
                            VariableSource::Declaration,
                            Some(location),
                            false,
                        );
                    });
                }
                return Ok(());
            }
        }

        // Still evaluate the receiver for its reference side effects.
        self.get_value_from_expression(&member.target)?;
        Ok(())
    }

    /// `container[key] = value` widens a dict binding's captured contents.
    /// Constant keys compare structurally, so re-assigning the same literal
    /// key does not widen.
    fn assign_index(&mut self, index: &ast::IndexExpr, value: Value) -> QueryResult<()> {
        let key = self.get_value_from_expression(&index.index)?;
        let target = self.get_value_from_expression(&index.target)?;

        let ast::Expr::Name(name) = &*index.target else {
            return Ok(());
        };

        if let Value::Instance(Type::Collection(id)) = target {
            if let Some(collection) = self.types().collection(id) {
                if collection.kind == BuiltinType::Dict {
                    let old_key = collection.contents.first().copied().unwrap_or(Type::Unknown);
                    let old_value = collection.contents.get(1).copied().unwrap_or(Type::Unknown);
                    let new_key = self.union_of(&[old_key, key.ty()]);
                    let new_value = self.union_of(&[old_value, value.ty()]);
                    let widened = self.types().add_collection(
                        self.module,
                        BuiltinType::Dict,
                        smallvec![new_key, new_value],
                        collection.exact,
                    );
                    self.declare_in_current(
                        &Name::new(&name.id),
                        Value::instance(widened),
                        VariableSource::Declaration,
                        Some(self.location(name.span)),
                    );
                }
            }
        }
        Ok(())
    }

    pub(crate) fn declare_in_current(
        &mut self,
        name: &Name,
        value: Value,
        source: VariableSource,
        location: Option<Location>,
    ) {
        let scope = self.current_scope();
        self.scopes().with_mut(self.module, |scopes| {
            if scopes.scope(scope).is_declared_global(name.as_str()) {
                scopes.declare(ScopeId::ROOT, name, value, source, location, false);
            } else if scopes.scope(scope).is_nonlocal(name.as_str()) {
                let target = scopes
                    .enumerate_towards_global(scope)
                    .skip(1)
                    .take_while(|id| *id != ScopeId::ROOT)
                    .find(|id| scopes.scope(*id).variable(name.as_str()).is_some());
                let target = target.unwrap_or(scope);
                scopes.declare(target, name, value, source, location, false);
            } else {
                scopes.declare(scope, name, value, source, location, false);
            }
        });
    }

    // --- imports ----------------------------------------------------------

    fn walk_import(&mut self, stmt: &ast::ImportStmt) -> QueryResult<()> {
        for alias in &stmt.names {
            let full = ModuleName::new(&alias.name.id);
            let resolution = resolve_module(self.db, &full)?;
            let value = match resolution.module() {
                Some(id) => Value::Type(Type::Module(id)),
                None => {
                    self.report_unresolved_import(alias.name.as_str(), alias.span);
                    Value::Unknown
                }
            };

            let (bound_name, bound_value) = if let Some(asname) = &alias.asname {
                (Name::new(&asname.id), value)
            } else {
                // `import a.b` binds `a`.
                let first = alias.name.id.split('.').next().expect("name is not empty");
                let value = if first == alias.name.as_str() {
                    value
                } else {
                    match resolve_module(self.db, &ModuleName::new(first))?.module() {
                        Some(id) => Value::Type(Type::Module(id)),
                        None => Value::Unknown,
                    }
                };
                (Name::new(first), value)
            };

            let scope = self.current_scope();
            let location = self.location(alias.span);
            self.scopes().with_mut(self.module, |scopes| {
                scopes.declare(
                    scope,
                    &bound_name,
                    bound_value,
                    VariableSource::Import,
                    Some(location),
                    false,
                );
                scopes.mark_imported(scope, &bound_name);
            });
        }
        Ok(())
    }

    fn walk_import_from(&mut self, stmt: &ast::ImportFromStmt) -> QueryResult<()> {
        let target = self.resolve_import_source(stmt);
        let Some(target_name) = target else {
            for alias in &stmt.names {
                self.report_unresolved_import(alias.name.as_str(), alias.span);
                self.bind_import_alias(alias, Value::Unknown, None);
            }
            return Ok(());
        };

        let resolution = resolve_module(self.db, &target_name)?;
        let Some(source_module) = resolution.module() else {
            for alias in &stmt.names {
                self.report_unresolved_import(target_name.as_str(), alias.span);
                self.bind_import_alias(alias, Value::Unknown, None);
            }
            return Ok(());
        };

        for alias in &stmt.names {
            if alias.name.as_str() == "*" {
                for name in crate::semantic::member_names(self.db, source_module) {
                    let value = crate::semantic::global_scope_value(
                        self.db,
                        source_module,
                        name.as_str(),
                    )
                    .unwrap_or_default();
                    let scope = self.current_scope();
                    let link = ImportLink {
                        module: source_module,
                        name: name.clone(),
                    };
                    self.scopes().with_mut(self.module, |scopes| {
                        scopes.link(scope, &name, value, link, None);
                    });
                }
                continue;
            }

            let value =
                crate::semantic::global_scope_value(self.db, source_module, alias.name.as_str());
            if value.is_none() {
                self.report_unresolved_import(alias.name.as_str(), alias.span);
            }
            self.bind_import_alias(
                alias,
                value.unwrap_or_default(),
                Some(ImportLink {
                    module: source_module,
                    name: Name::new(&alias.name.id),
                }),
            );
        }
        Ok(())
    }

    fn resolve_import_source(&self, stmt: &ast::ImportFromStmt) -> Option<ModuleName> {
        let spelled = stmt.module.as_ref().map(|module| module.id.as_str());
        if stmt.level == 0 {
            return spelled.map(ModuleName::new);
        }
        let importer = self.registry().module_name(self.module)?;
        let is_package = matches!(self.module_kind, ModuleKind::Package);
        ModuleName::relative(stmt.level, spelled, &importer, is_package)
    }

    fn bind_import_alias(
        &mut self,
        alias: &ast::ImportAlias,
        value: Value,
        link: Option<ImportLink>,
    ) {
        let bound = alias
            .asname
            .as_ref()
            .map(|asname| Name::new(&asname.id))
            .unwrap_or_else(|| Name::new(&alias.name.id));
        let scope = self.current_scope();
        let location = self.location(alias.span);
        self.scopes().with_mut(self.module, |scopes| match link {
            Some(link) => scopes.link(scope, &bound, value, link, Some(location)),
            None => {
                scopes.declare(
                    scope,
                    &bound,
                    value,
                    VariableSource::Import,
                    Some(location),
                    false,
                );
                scopes.mark_imported(scope, &bound);
            }
        });
    }

    fn report_unresolved_import(&self, name: &str, span: dunlin_python_ast::Span) {
        tracing::debug!("unresolved import '{name}'");
        self.registry().push_diagnostic(
            self.module,
            Diagnostic::analysis("unresolved-import", format!("Unresolved import '{name}'"), span),
        );
    }

    // --- definitions and the lazy symbol table ----------------------------

    fn register_class(&mut self, def: Arc<ast::ClassDef>) {
        let key = DefKey::class(&def);
        let name = Name::new(&def.name.id);
        let span = def.name.span;
        self.register_definition(key, DefNode::Class(def), name, span);
    }

    fn register_function(&mut self, def: Arc<ast::FunctionDef>) {
        let key = DefKey::function(&def);
        let name = Name::new(&def.name.id);
        let span = def.name.span;
        self.register_definition(key, DefNode::Function(def), name, span);
    }

    fn register_definition(
        &mut self,
        key: DefKey,
        node: DefNode,
        name: Name,
        span: dunlin_python_ast::Span,
    ) {
        let scope = self.current_scope();
        if let std::collections::hash_map::Entry::Vacant(entry) =
            self.symbols.entries.entry(key)
        {
            entry.insert(SymbolEntry {
                node,
                scope,
                state: EvalState::Pending,
            });
            self.symbols
                .by_name
                .entry((scope, name.clone()))
                .or_default()
                .push(key);
        }
        let location = self.location(span);
        self.scopes().with_mut(self.module, |scopes| {
            scopes.declare(
                scope,
                &name,
                Value::Unknown,
                VariableSource::Declaration,
                Some(location),
                false,
            );
        });
    }

    /// Forces every pending definition bound to `name` in `scope`, in
    /// declaration order.
    pub(crate) fn ensure_name_evaluated(
        &mut self,
        scope: ScopeId,
        name: &Name,
    ) -> QueryResult<()> {
        let keys = self
            .symbols
            .by_name
            .get(&(scope, name.clone()))
            .cloned()
            .unwrap_or_default();
        for key in keys {
            self.ensure_evaluated(key)?;
        }
        Ok(())
    }

    /// Evaluates a pending definition. Idempotent and re-entrant: a
    /// definition already on the guard stack yields `Unknown` instead of
    /// recursing.
    pub(crate) fn ensure_evaluated(&mut self, key: DefKey) -> QueryResult<Value> {
        let Some(entry) = self.symbols.entries.get(&key) else {
            return Ok(Value::Unknown);
        };
        if let EvalState::Done(value) = &entry.state {
            return Ok(value.clone());
        }
        if self.guard.contains(&key) {
            return Ok(Value::Unknown);
        }

        let node = entry.node.clone();
        let scope = entry.scope;

        self.guard.push(key);
        let result = match &node {
            DefNode::Class(def) => self.evaluate_class_def(def, scope),
            DefNode::Function(def) => self.evaluate_function_def(def, scope),
        };
        self.guard.pop();
        let value = result?;

        if let Some(entry) = self.symbols.entries.get_mut(&key) {
            entry.state = EvalState::Done(value.clone());
        }

        let name = match &node {
            DefNode::Class(def) => Name::new(&def.name.id),
            DefNode::Function(def) => Name::new(&def.name.id),
        };
        self.scopes().with_mut(self.module, |scopes| {
            scopes.declare(
                scope,
                &name,
                value.clone(),
                VariableSource::Declaration,
                None,
                false,
            );
        });

        Ok(value)
    }

    fn evaluate_class_def(
        &mut self,
        def: &Arc<ast::ClassDef>,
        scope: ScopeId,
    ) -> QueryResult<Value> {
        let mut bases = Vec::with_capacity(def.bases.len());
        let mut generic_params: SmallVec<[_; 2]> = SmallVec::new();

        for base in &def.bases {
            let value = self.with_scope(scope, |this| this.get_value_from_expression(base))?;
            let ty = value.ty();
            if let Type::GenericMarker(marker) = ty {
                generic_params.extend(self.types().marker_params(marker));
            }
            bases.push(ty);
        }

        let class_scope = self.scopes().with_mut(self.module, |scopes| {
            scopes.add_scope(scope, &def.name.id, ScopeKind::Class)
        });
        let class_scope = class_scope.expect("module scope store should exist");

        let class = self.types().add_class(
            self.module,
            &def.name.id,
            class_scope,
            bases,
            generic_params,
        );
        self.class_scopes.insert(class_scope, class);

        self.with_scope(class_scope, |this| this.walk_statements(&def.body))?;

        Ok(Value::Type(Type::Class(class)))
    }

    fn evaluate_function_def(
        &mut self,
        def: &Arc<ast::FunctionDef>,
        scope: ScopeId,
    ) -> QueryResult<Value> {
        let mut flags = OverloadFlags::empty();
        let mut is_property = false;

        for decorator in &def.decorators {
            let value = self.with_scope(scope, |this| this.get_value_from_expression(decorator))?;
            match value.ty() {
                Type::SpecialForm(SpecialForm::Overload) => flags |= OverloadFlags::OVERLOAD,
                Type::Builtin(BuiltinType::StaticMethod) => flags |= OverloadFlags::STATIC,
                Type::Builtin(BuiltinType::ClassMethod) => flags |= OverloadFlags::CLASS_METHOD,
                Type::Builtin(BuiltinType::Property) => is_property = true,
                _ => {}
            }
        }

        if def.is_stub_body() || matches!(self.module_kind, ModuleKind::Stub) {
            flags |= OverloadFlags::STUB;
        }

        let declared_return = match &def.returns {
            Some(annotation) => {
                self.with_scope(scope, |this| this.convert_annotation(annotation))?
            }
            None => Type::Unknown,
        };

        let parameters = self.with_scope(scope, |this| {
            this.evaluate_parameters(&def.parameters)
        })?;

        let function_scope = self
            .scopes()
            .with_mut(self.module, |scopes| {
                scopes.add_scope(scope, &def.name.id, ScopeKind::Function)
            })
            .expect("module scope store should exist");

        let overload = Overload {
            parameters,
            declared_return,
            body: OverloadBody::Def(def.clone()),
            scope: function_scope,
            flags,
            walked: false,
        };

        let declaring_class = self.declaring_class_of_scope(scope);

        // Successive overload-decorated definitions of one name collect on
        // the existing function; a plain redefinition replaces it.
        let existing = self.scopes().with(self.module, |scopes| {
            scopes
                .scope(scope)
                .variable(&def.name.id)
                .map(|variable| variable.value().clone())
        });
        if let Some(Some(existing_value)) = existing {
            let existing_function = match existing_value.ty() {
                Type::Function(id) | Type::Property(id) => Some(id),
                _ => None,
            };
            if let Some(existing_function) = existing_function {
                let collects = flags.contains(OverloadFlags::OVERLOAD)
                    || self
                        .types()
                        .function(existing_function)
                        .is_some_and(|function| {
                            function.overloads.iter().any(|overload| {
                                overload.flags.contains(OverloadFlags::OVERLOAD)
                            })
                        });
                if collects {
                    self.types().push_overload(existing_function, overload);
                    return Ok(existing_value);
                }
            }
        }

        let function =
            self.types()
                .add_function(self.module, &def.name.id, declaring_class, overload);

        let ty = if is_property {
            Type::Property(function)
        } else {
            Type::Function(function)
        };
        Ok(Value::Type(ty))
    }

    pub(crate) fn evaluate_parameters(
        &mut self,
        parameters: &ast::Parameters,
    ) -> QueryResult<Vec<ParameterSpec>> {
        let mut specs = Vec::new();
        let groups: [(&[ast::Parameter], ParameterKind); 3] = [
            (&parameters.posonly, ParameterKind::PositionalOnly),
            (&parameters.args, ParameterKind::PositionalOrKeyword),
            (&parameters.kwonly, ParameterKind::KeywordOnly),
        ];
        for (group, kind) in groups {
            for parameter in group {
                specs.push(self.evaluate_parameter(parameter, kind)?);
            }
        }
        if let Some(vararg) = &parameters.vararg {
            specs.push(self.evaluate_parameter(vararg, ParameterKind::VarArgs)?);
        }
        if let Some(kwarg) = &parameters.kwarg {
            specs.push(self.evaluate_parameter(kwarg, ParameterKind::KwArgs)?);
        }
        Ok(specs)
    }

    fn evaluate_parameter(
        &mut self,
        parameter: &ast::Parameter,
        kind: ParameterKind,
    ) -> QueryResult<ParameterSpec> {
        let annotated = match &parameter.annotation {
            Some(annotation) => self.convert_annotation(annotation)?,
            None => Type::Unknown,
        };
        Ok(ParameterSpec {
            name: Name::new(&parameter.name.id),
            kind,
            annotated,
            has_annotation: parameter.annotation.is_some(),
            default: parameter.default.clone(),
        })
    }

    // --- expressions ------------------------------------------------------

    /// The evaluator's entry point for expressions; always produces a
    /// value, with `Unknown` as the bottom.
    pub(crate) fn get_value_from_expression(&mut self, expr: &ast::Expr) -> QueryResult<Value> {
        self.db.cancelled()?;

        match expr {
            ast::Expr::Constant(constant) => Ok(self.constant_value(&constant.value)),
            ast::Expr::Name(name) => self.lookup_name(&name.id, name.span),
            ast::Expr::Member(member) => self.evaluate_member(member),
            ast::Expr::Call(call) => self.evaluate_call(call),
            ast::Expr::Index(index) => self.evaluate_index(index),
            ast::Expr::Unary(unary) => self.evaluate_unary(unary),
            ast::Expr::Binary(binary) => self.evaluate_binary(binary),
            ast::Expr::And(and) => {
                self.get_value_from_expression(&and.left)?;
                self.get_value_from_expression(&and.right)?;
                Ok(Value::instance(Type::Builtin(BuiltinType::Bool)))
            }
            ast::Expr::Or(or) => {
                let left = self.get_value_from_expression(&or.left)?;
                let right = self.get_value_from_expression(&or.right)?;
                if !left.is_unknown() {
                    Ok(left)
                } else if !right.is_unknown() {
                    Ok(right)
                } else {
                    Ok(Value::instance(Type::Builtin(BuiltinType::Bool)))
                }
            }
            ast::Expr::Conditional(conditional) => {
                self.get_value_from_expression(&conditional.test)?;
                let body = self.get_value_from_expression(&conditional.body)?;
                let orelse = self.get_value_from_expression(&conditional.orelse)?;
                if body.is_unknown() {
                    Ok(orelse)
                } else if orelse.is_unknown() {
                    Ok(body)
                } else if body.ty() == orelse.ty() {
                    Ok(body)
                } else {
                    let union = self.union_of(&[body.ty(), orelse.ty()]);
                    Ok(Value::instance(union))
                }
            }
            ast::Expr::List(list) => self.evaluate_sequence_literal(BuiltinType::List, &list.items),
            ast::Expr::Tuple(tuple) => {
                self.evaluate_sequence_literal(BuiltinType::Tuple, &tuple.items)
            }
            ast::Expr::Set(set) => self.evaluate_sequence_literal(BuiltinType::Set, &set.items),
            ast::Expr::Dict(dict) => self.evaluate_dict_literal(dict),
            ast::Expr::Generator(generator) => self.evaluate_comprehension(generator),
            ast::Expr::Lambda(lambda) => self.evaluate_lambda(lambda),
            ast::Expr::FString(fstring) => {
                for part in &fstring.parts {
                    if let ast::FStringPart::Expression { value, .. } = part {
                        self.get_value_from_expression(value)?;
                    }
                }
                Ok(Value::instance(Type::Builtin(BuiltinType::Str)))
            }
            ast::Expr::Named(named) => {
                let value = self.get_value_from_expression(&named.value)?;
                self.declare_in_current(
                    &Name::new(&named.target.id),
                    value.clone(),
                    VariableSource::Declaration,
                    Some(self.location(named.target.span)),
                );
                Ok(value)
            }
            ast::Expr::Slice(slice) => {
                for bound in [&slice.lower, &slice.upper, &slice.step].into_iter().flatten() {
                    self.get_value_from_expression(bound)?;
                }
                Ok(Value::instance(Type::Builtin(BuiltinType::Slice)))
            }
            ast::Expr::Starred(starred) => self.get_value_from_expression(&starred.value),
            ast::Expr::Yield(yield_expr) => {
                if let Some(value) = &yield_expr.value {
                    self.get_value_from_expression(value)?;
                }
                Ok(Value::Unknown)
            }
            ast::Expr::Error(_) => Ok(Value::Unknown),
        }
    }

    fn constant_value(&self, constant: &ast::Constant) -> Value {
        let builtin = match constant {
            ast::Constant::None => BuiltinType::None,
            ast::Constant::Ellipsis => BuiltinType::Ellipsis,
            ast::Constant::Bool(_) => BuiltinType::Bool,
            ast::Constant::Int(_) => BuiltinType::Int,
            ast::Constant::Float(_) => BuiltinType::Float,
            ast::Constant::Complex { .. } => BuiltinType::Complex,
            ast::Constant::Str(_) => BuiltinType::Str,
            ast::Constant::Bytes(_) => BuiltinType::Bytes,
        };
        Value::Constant(ConstantValue::new(Type::Builtin(builtin), constant.clone()))
    }

    // --- names ------------------------------------------------------------

    pub(crate) fn lookup_name(
        &mut self,
        name: &str,
        span: dunlin_python_ast::Span,
    ) -> QueryResult<Value> {
        self.lookup_name_with(name, span, LookupOptions::NORMAL)
    }

    pub(crate) fn lookup_name_with(
        &mut self,
        name: &str,
        span: dunlin_python_ast::Span,
        options: LookupOptions,
    ) -> QueryResult<Value> {
        let scope = self.current_scope();
        let hit = self
            .scopes()
            .with(self.module, |scopes| scopes.lookup(scope, name, options))
            .flatten();

        if let Some((value, defining_scope)) = hit {
            // Make sure the definitions behind the binding have been
            // walked, then re-read the settled value.
            let key = Name::new(name);
            let value = if self.symbols.by_name.contains_key(&(defining_scope, key.clone())) {
                self.ensure_name_evaluated(defining_scope, &key)?;
                self.scopes()
                    .with(self.module, |scopes| {
                        scopes
                            .scope(defining_scope)
                            .variable(name)
                            .map(|variable| variable.value().clone())
                    })
                    .flatten()
                    .unwrap_or(value)
            } else {
                value
            };
            self.record_reference(self.module, defining_scope, &key, span);
            return Ok(value);
        }

        if options.contains(LookupOptions::BUILTINS) && self.module != self.builtins {
            let builtins = self.builtins;
            let hit = self
                .scopes()
                .with(builtins, |scopes| {
                    scopes
                        .lookup(ScopeId::ROOT, name, LookupOptions::LOCAL)
                        .map(|(value, _)| value)
                })
                .flatten();
            if let Some(value) = hit {
                self.record_reference(builtins, ScopeId::ROOT, &Name::new(name), span);
                return Ok(value);
            }
        }

        tracing::trace!("name '{name}' did not resolve");
        Ok(Value::Unknown)
    }

    /// Appends a reference, forwarding through import back-links so usages
    /// of an alias count against the original binding.
    pub(crate) fn record_reference(
        &self,
        module: ModuleId,
        scope: ScopeId,
        name: &Name,
        span: dunlin_python_ast::Span,
    ) {
        let location = self.location(span);
        let mut target = (module, scope, name.clone());
        for _ in 0..8 {
            let (module, scope, name) = target.clone();
            let link = self
                .scopes()
                .with_mut(module, |scopes| {
                    scopes.record_reference(scope, &name, location)
                })
                .flatten();
            match link {
                Some(link) => target = (link.module, ScopeId::ROOT, link.name),
                None => break,
            }
        }
    }

    // --- member access ----------------------------------------------------

    fn evaluate_member(&mut self, member: &ast::MemberExpr) -> QueryResult<Value> {
        let target = self.get_value_from_expression(&member.target)?;
        let value = self.member_of_value(&target, &member.member.id, member.member.span)?;
        Ok(value)
    }

    /// Member access dispatch: modules return the binding unchanged,
    /// classes hand out unbound functions, instances bind methods and
    /// invoke properties.
    pub(crate) fn member_of_value(
        &mut self,
        target: &Value,
        name: &str,
        span: dunlin_python_ast::Span,
    ) -> QueryResult<Value> {
        match target {
            Value::Unknown => Ok(Value::Unknown),
            Value::Type(Type::Module(module)) => {
                let module = *module;
                let value = crate::semantic::global_scope_value(self.db, module, name);
                match value {
                    Some(value) => {
                        self.record_reference(module, ScopeId::ROOT, &Name::new(name), span);
                        Ok(value)
                    }
                    None => {
                        tracing::trace!("module has no member '{name}'");
                        Ok(Value::Unknown)
                    }
                }
            }
            Value::Type(ty) => {
                // The receiver is a class literal: methods come back
                // unbound.
                let member = self.type_member(*ty, name)?;
                Ok(member.unwrap_or(Value::Unknown))
            }
            Value::Instance(_) | Value::Constant(_) => {
                let ty = match target {
                    Value::Instance(ty) => *ty,
                    Value::Constant(constant) => constant.ty(),
                    _ => unreachable!(),
                };
                let member = self.type_member(ty, name)?;
                match member {
                    Some(Value::Type(Type::Property(function))) => {
                        // Properties are invoked with an empty argument set
                        // when read.
                        self.call_function_with_values(
                            function,
                            Some(target.clone()),
                            Vec::new(),
                            Vec::new(),
                        )
                    }
                    Some(Value::Type(Type::Function(function))) => {
                        let is_static = self
                            .types()
                            .function(function)
                            .is_some_and(|f| {
                                f.overloads
                                    .iter()
                                    .all(|overload| overload.flags.contains(OverloadFlags::STATIC))
                            });
                        if is_static {
                            Ok(Value::Type(Type::Function(function)))
                        } else {
                            Ok(Value::BoundMethod(BoundMethod {
                                function,
                                receiver: Box::new(target.clone()),
                            }))
                        }
                    }
                    Some(value) => Ok(value),
                    None => {
                        tracing::trace!("no member '{name}' on instance");
                        Ok(Value::Unknown)
                    }
                }
            }
            Value::BoundMethod(_) => Ok(Value::Unknown),
        }
    }

    /// Searches a type's own members, then its bases depth-first in
    /// declaration order.
    pub(crate) fn type_member(&mut self, ty: Type, name: &str) -> QueryResult<Option<Value>> {
        match ty {
            Type::Unknown => Ok(Some(Value::Unknown)),
            Type::Class(class) => self.class_member(class, name),
            Type::Builtin(builtin) => {
                Ok(builtin_member(self.db, self.builtins, builtin, name))
            }
            Type::Collection(id) => {
                let Some(collection) = self.types().collection(id) else {
                    return Ok(None);
                };
                Ok(builtin_member(self.db, self.builtins, collection.kind, name))
            }
            Type::Union(id) => {
                for element in self.types().union_elements(id) {
                    if let Some(value) = self.type_member(element, name)? {
                        return Ok(Some(value));
                    }
                }
                Ok(None)
            }
            Type::GenericParam(id) => {
                let Some(param) = self.types().generic_param(id) else {
                    return Ok(None);
                };
                for bound in param.bound {
                    if let Some(value) = self.type_member(bound, name)? {
                        return Ok(Some(value));
                    }
                }
                Ok(None)
            }
            Type::Module(module) => {
                Ok(crate::semantic::global_scope_value(self.db, module, name))
            }
            Type::Iterator(_) => Ok(None),
            _ => Ok(None),
        }
    }

    pub(crate) fn class_member(
        &mut self,
        class: ClassId,
        name: &str,
    ) -> QueryResult<Option<Value>> {
        let Some(class_data) = self.types().class(class) else {
            return Ok(None);
        };

        let own = self
            .scopes()
            .with(class.module(), |scopes| {
                scopes
                    .scope(class_data.scope)
                    .variable(name)
                    .map(|variable| variable.value().clone())
            })
            .flatten();
        if let Some(own) = own {
            // A pending method definition in this module evaluates on
            // first touch.
            if own.is_unknown() && class.module() == self.module {
                let key = Name::new(name);
                if self
                    .symbols
                    .by_name
                    .contains_key(&(class_data.scope, key.clone()))
                {
                    self.ensure_name_evaluated(class_data.scope, &key)?;
                    let settled = self
                        .scopes()
                        .with(class.module(), |scopes| {
                            scopes
                                .scope(class_data.scope)
                                .variable(name)
                                .map(|variable| variable.value().clone())
                        })
                        .flatten();
                    if let Some(settled) = settled {
                        return Ok(Some(settled));
                    }
                }
            }
            // Substitute specialized generic parameters in member types.
            if let Some(specialization) = &class_data.specialization {
                if let Value::Instance(Type::GenericParam(param)) = &own {
                    if let Some(resolved) = specialization.get(param) {
                        return Ok(Some(Value::instance(*resolved)));
                    }
                }
            }
            return Ok(Some(own));
        }

        for base in &class_data.bases {
            match base {
                Type::Class(base_class) => {
                    if let Some(value) = self.class_member(*base_class, name)? {
                        return Ok(Some(value));
                    }
                }
                Type::Builtin(builtin) => {
                    if let Some(value) =
                        builtin_member(self.db, self.builtins, *builtin, name)
                    {
                        return Ok(Some(value));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    // --- operators --------------------------------------------------------

    fn evaluate_unary(&mut self, unary: &ast::UnaryExpr) -> QueryResult<Value> {
        let operand = self.get_value_from_expression(&unary.operand)?;

        match unary.op {
            UnaryOp::Not => Ok(Value::instance(Type::Builtin(BuiltinType::Bool))),
            UnaryOp::Neg | UnaryOp::Pos | UnaryOp::Invert => {
                // Literal integers fold.
                if let Value::Constant(constant) = &operand {
                    if let Some(value) = constant.try_int() {
                        let folded = match unary.op {
                            UnaryOp::Neg => value.checked_neg(),
                            UnaryOp::Pos => Some(value),
                            UnaryOp::Invert => Some(!value),
                            UnaryOp::Not => unreachable!(),
                        };
                        if let Some(folded) = folded {
                            return Ok(Value::Constant(ConstantValue::new(
                                Type::Builtin(BuiltinType::Int),
                                ast::Constant::Int(folded),
                            )));
                        }
                    }
                }

                match operand.ty() {
                    Type::Builtin(builtin) if builtin.is_integer_like() => {
                        let result = if builtin == BuiltinType::Bool {
                            BuiltinType::Int
                        } else {
                            builtin
                        };
                        Ok(Value::instance(Type::Builtin(result)))
                    }
                    Type::Builtin(BuiltinType::Float | BuiltinType::Complex)
                        if unary.op != UnaryOp::Invert =>
                    {
                        Ok(Value::instance(operand.ty()))
                    }
                    Type::Class(_) => {
                        let dunder = unary.op.dunder().expect("not is handled above");
                        match self.type_member(operand.ty(), dunder)? {
                            Some(Value::Type(Type::Function(function))) => self
                                .call_function_with_values(
                                    function,
                                    Some(operand.clone()),
                                    Vec::new(),
                                    Vec::new(),
                                ),
                            _ => Ok(Value::Unknown),
                        }
                    }
                    _ => Ok(Value::Unknown),
                }
            }
        }
    }

    fn evaluate_binary(&mut self, binary: &ast::BinaryExpr) -> QueryResult<Value> {
        let left = self.get_value_from_expression(&binary.left)?;
        let right = self.get_value_from_expression(&binary.right)?;
        let op = binary.op;

        let bool_instance = Value::instance(Type::Builtin(BuiltinType::Bool));

        // Identity and membership never dispatch.
        if matches!(op, BinaryOp::Is | BinaryOp::IsNot | BinaryOp::In | BinaryOp::NotIn) {
            return Ok(bool_instance);
        }

        // 1. Unknown on both sides.
        if left.is_unknown() && right.is_unknown() {
            return Ok(if op.is_comparison() {
                bool_instance
            } else {
                Value::Unknown
            });
        }

        // 2. Concatenation of two captured collections of the same kind.
        if op == BinaryOp::Add {
            if let (Value::Instance(Type::Collection(a)), Value::Instance(Type::Collection(b))) =
                (&left, &right)
            {
                if let (Some(a), Some(b)) =
                    (self.types().collection(*a), self.types().collection(*b))
                {
                    if a.kind == b.kind && a.exact && b.exact {
                        let mut contents: Vec<Type> = Vec::new();
                        contents.extend(a.contents.iter().copied());
                        contents.extend(b.contents.iter().copied());
                        let content = self.union_of(&contents);
                        let combined = self.types().add_collection(
                            self.module,
                            a.kind,
                            smallvec![content],
                            true,
                        );
                        return Ok(Value::instance(combined));
                    }
                }
            }
        }

        // 3. printf-style formatting preserves the string type.
        if op == BinaryOp::Mod {
            if let Type::Builtin(builtin) = left.ty() {
                if builtin.is_string_like() {
                    return Ok(Value::instance(Type::Builtin(builtin)));
                }
            }
        }

        // 4. Builtin arithmetic promotion; literal integers fold first.
        if let (Type::Builtin(lhs), Type::Builtin(rhs)) = (left.ty(), right.ty()) {
            if lhs.supports_arithmetic() && rhs.supports_arithmetic() {
                if let Some(folded) = self.fold_int_constants(&left, op, &right) {
                    return Ok(folded);
                }
                if let Some(promoted) = self.promote_builtins(lhs, op, rhs) {
                    return Ok(Value::instance(promoted));
                }
            }
        }

        // 5. Operator methods: forward on the left, reflected on the
        // right; builtin-vs-class comparisons swap and invert.
        if let Some((forward, reflected)) = op.dunders() {
            if matches!(left.ty(), Type::Class(_)) {
                if let Some(Value::Type(Type::Function(function))) =
                    self.type_member(left.ty(), forward)?
                {
                    let result = self.call_function_with_values(
                        function,
                        Some(left.clone()),
                        vec![right.clone()],
                        Vec::new(),
                    )?;
                    if !result.is_unknown() {
                        return Ok(result);
                    }
                }
            }
            if matches!(right.ty(), Type::Class(_)) {
                let method = if op.is_comparison() && matches!(left.ty(), Type::Builtin(_)) {
                    op.swapped().and_then(|swapped| swapped.dunders()).map(|(f, _)| f)
                } else {
                    Some(reflected)
                };
                if let Some(method) = method {
                    if let Some(Value::Type(Type::Function(function))) =
                        self.type_member(right.ty(), method)?
                    {
                        let result = self.call_function_with_values(
                            function,
                            Some(right.clone()),
                            vec![left.clone()],
                            Vec::new(),
                        )?;
                        if !result.is_unknown() {
                            return Ok(result);
                        }
                    }
                }
            }
        }

        // 6. Nothing resolved.
        if op.is_comparison() {
            Ok(bool_instance)
        } else if !left.is_unknown() {
            Ok(left)
        } else {
            Ok(right)
        }
    }

    fn fold_int_constants(&self, left: &Value, op: BinaryOp, right: &Value) -> Option<Value> {
        let (Value::Constant(lhs), Value::Constant(rhs)) = (left, right) else {
            return None;
        };
        let (a, b) = (lhs.try_int()?, rhs.try_int()?);
        let folded = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mult => a.checked_mul(b),
            BinaryOp::FloorDiv => a.checked_div(b),
            BinaryOp::Mod => a.checked_rem(b),
            _ => None,
        }?;
        Some(Value::Constant(ConstantValue::new(
            Type::Builtin(BuiltinType::Int),
            ast::Constant::Int(folded),
        )))
    }

    /// The builtin arithmetic promotion table.
    fn promote_builtins(
        &self,
        lhs: BuiltinType,
        op: BinaryOp,
        rhs: BuiltinType,
    ) -> Option<Type> {
        use BuiltinType::{Bool, Complex, Float, Int, Long, Unicode};

        let version = self.version();
        let lhs = lhs.normalized(version);
        let rhs = rhs.normalized(version);

        if op.is_comparison() {
            return Some(Type::Builtin(Bool));
        }

        let integer_pair = lhs.is_integer_like() && rhs.is_integer_like();
        let integer_result = || {
            if lhs == Long || rhs == Long {
                Long
            } else {
                Int
            }
        };

        match op {
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
                if lhs == Bool && rhs == Bool {
                    Some(Type::Builtin(Bool))
                } else if integer_pair {
                    Some(Type::Builtin(integer_result()))
                } else {
                    None
                }
            }
            BinaryOp::MatMult => None,
            BinaryOp::LShift | BinaryOp::RShift => {
                integer_pair.then(|| Type::Builtin(integer_result()))
            }
            BinaryOp::Div => {
                if version.is_py2() {
                    if lhs == Complex || rhs == Complex {
                        Some(Type::Builtin(Complex))
                    } else if integer_pair {
                        Some(Type::Builtin(integer_result()))
                    } else {
                        Some(Type::Builtin(Float))
                    }
                } else {
                    Some(Type::Builtin(Float))
                }
            }
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mult
            | BinaryOp::Pow
            | BinaryOp::FloorDiv
            | BinaryOp::Mod => {
                // String repetition and concatenation.
                if op == BinaryOp::Mult {
                    if lhs.is_string_like() && rhs.is_integer_like() {
                        return Some(Type::Builtin(lhs));
                    }
                    if rhs.is_string_like() && lhs.is_integer_like() {
                        return Some(Type::Builtin(rhs));
                    }
                }
                if op == BinaryOp::Add && lhs.is_string_like() && rhs.is_string_like() {
                    let result = if lhs == Unicode || rhs == Unicode {
                        Unicode
                    } else {
                        lhs
                    };
                    return Some(Type::Builtin(result));
                }
                if lhs.is_string_like() || rhs.is_string_like() {
                    return None;
                }

                if lhs == Complex || rhs == Complex {
                    if op == BinaryOp::FloorDiv && !version.is_py2() {
                        return None;
                    }
                    return Some(Type::Builtin(Complex));
                }
                if integer_pair {
                    Some(Type::Builtin(integer_result()))
                } else {
                    Some(Type::Builtin(Float))
                }
            }
            _ => None,
        }
    }

    // --- collection displays and comprehensions ---------------------------

    fn evaluate_sequence_literal(
        &mut self,
        kind: BuiltinType,
        items: &[ast::Expr],
    ) -> QueryResult<Value> {
        let exact = items.len() <= COLLECTION_CAPTURE_LIMIT;
        let mut types = Vec::new();
        for item in items.iter().take(COLLECTION_CAPTURE_LIMIT) {
            let value = self.get_value_from_expression(item)?;
            types.push(value.ty());
        }
        let content = self.union_of(&types);
        let ty = self
            .types()
            .add_collection(self.module, kind, smallvec![content], exact);
        Ok(Value::instance(ty))
    }

    fn evaluate_dict_literal(&mut self, dict: &ast::DictExpr) -> QueryResult<Value> {
        let exact = dict.items.len() <= COLLECTION_CAPTURE_LIMIT;
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for item in dict.items.iter().take(COLLECTION_CAPTURE_LIMIT) {
            match &item.key {
                Some(key) => {
                    keys.push(self.get_value_from_expression(key)?.ty());
                    values.push(self.get_value_from_expression(&item.value)?.ty());
                }
                None => {
                    // `**mapping` merges the other dict's captured types.
                    let spread = self.get_value_from_expression(&item.value)?;
                    if let Type::Collection(id) = spread.ty() {
                        if let Some(collection) = self.types().collection(id) {
                            if collection.kind == BuiltinType::Dict {
                                keys.extend(collection.contents.first().copied());
                                values.extend(collection.contents.get(1).copied());
                            }
                        }
                    }
                }
            }
        }
        let key = self.union_of(&keys);
        let value = self.union_of(&values);
        let ty = self.types().add_collection(
            self.module,
            BuiltinType::Dict,
            smallvec![key, value],
            exact,
        );
        Ok(Value::instance(ty))
    }

    /// Comprehensions declare their iteration variables in the current
    /// scope, evaluate one item to determine the content type, then remove
    /// the variables again: comprehension scope does not leak.
    fn evaluate_comprehension(&mut self, generator: &ast::GeneratorExpr) -> QueryResult<Value> {
        let scope = self.current_scope();
        let before: Vec<Name> = self
            .scopes()
            .with(self.module, |scopes| {
                scopes.scope(scope).variable_names().cloned().collect()
            })
            .unwrap_or_default();

        for clause in &generator.generators {
            let iterable = self.get_value_from_expression(&clause.iter)?;
            let element = self.element_of(&iterable);
            self.assign_target(&clause.target, Value::instance(element))?;
            for condition in &clause.conditions {
                self.get_value_from_expression(condition)?;
            }
        }

        let element = self.get_value_from_expression(&generator.element)?;
        let value = match &generator.value {
            Some(value) => Some(self.get_value_from_expression(value)?),
            None => None,
        };

        let result = match generator.kind {
            ast::ComprehensionKind::List => {
                let ty = self.types().add_collection(
                    self.module,
                    BuiltinType::List,
                    smallvec![element.ty()],
                    true,
                );
                Value::instance(ty)
            }
            ast::ComprehensionKind::Set => {
                let ty = self.types().add_collection(
                    self.module,
                    BuiltinType::Set,
                    smallvec![element.ty()],
                    true,
                );
                Value::instance(ty)
            }
            ast::ComprehensionKind::Dict => {
                let value_ty = value.map(|value| value.ty()).unwrap_or(Type::Unknown);
                let ty = self.types().add_collection(
                    self.module,
                    BuiltinType::Dict,
                    smallvec![element.ty(), value_ty],
                    true,
                );
                Value::instance(ty)
            }
            ast::ComprehensionKind::Generator => {
                let ty = self.types().add_iterator(self.module, element.ty());
                Value::instance(ty)
            }
        };

        // Drop everything the clauses introduced.
        self.scopes().with_mut(self.module, |scopes| {
            let introduced: Vec<Name> = scopes
                .scope(scope)
                .variable_names()
                .filter(|name| !before.contains(*name))
                .cloned()
                .collect();
            for name in introduced {
                scopes.remove_variable(scope, &name);
            }
        });

        Ok(result)
    }

    fn evaluate_lambda(&mut self, lambda: &Arc<ast::LambdaExpr>) -> QueryResult<Value> {
        let parameters = self.evaluate_parameters(&lambda.parameters)?;
        let scope = self.current_scope();
        let function_scope = self
            .scopes()
            .with_mut(self.module, |scopes| {
                scopes.add_scope(scope, "<lambda>", ScopeKind::Function)
            })
            .expect("module scope store should exist");

        let overload = Overload {
            parameters,
            declared_return: Type::Unknown,
            body: OverloadBody::Lambda(lambda.clone()),
            scope: function_scope,
            flags: OverloadFlags::LAMBDA,
            walked: false,
        };
        let function = self
            .types()
            .add_function(self.module, "<lambda>", None, overload);
        Ok(Value::Type(Type::Function(function)))
    }

    // --- indexing ---------------------------------------------------------

    fn evaluate_index(&mut self, index: &ast::IndexExpr) -> QueryResult<Value> {
        let target = self.get_value_from_expression(&index.target)?;

        // Generic parameterization comes first.
        if let Some(specialized) = self.index_generic(&target, &index.index)? {
            return Ok(specialized);
        }

        // Slicing (and tuple-of-slices) preserves the subject type.
        if matches!(&*index.index, ast::Expr::Slice(_) | ast::Expr::Tuple(_)) {
            self.get_value_from_expression(&index.index)?;
            return Ok(target);
        }

        let key = self.get_value_from_expression(&index.index)?;

        match target.ty() {
            Type::Collection(id) => {
                let Some(collection) = self.types().collection(id) else {
                    return Ok(Value::Unknown);
                };
                let content = match collection.kind {
                    BuiltinType::Dict => {
                        collection.contents.get(1).copied().unwrap_or(Type::Unknown)
                    }
                    _ => collection.contents.first().copied().unwrap_or(Type::Unknown),
                };
                Ok(Value::instance(content))
            }
            Type::Builtin(builtin) if builtin.is_string_like() => {
                Ok(Value::instance(Type::Builtin(builtin)))
            }
            Type::Class(_) => {
                match self.type_member(target.ty(), "__getitem__")? {
                    Some(Value::Type(Type::Function(function))) => self
                        .call_function_with_values(
                            function,
                            Some(target.clone()),
                            vec![key],
                            Vec::new(),
                        ),
                    _ => Ok(Value::Unknown),
                }
            }
            Type::Iterator(id) => Ok(self
                .types()
                .iterator(id)
                .map(|iterator| Value::instance(iterator.element))
                .unwrap_or(Value::Unknown)),
            _ => Ok(Value::Unknown),
        }
    }

    // --- shared helpers ---------------------------------------------------

    pub(crate) fn union_of(&self, types: &[Type]) -> Type {
        let filtered: Vec<Type> = types.iter().copied().filter(|ty| !ty.is_unknown()).collect();
        self.types().add_union(self.module, &filtered)
    }

    /// The element produced by iterating a value.
    pub(crate) fn element_of(&self, value: &Value) -> Type {
        match value.ty() {
            Type::Collection(id) => self
                .types()
                .collection(id)
                .map(|collection| {
                    collection.contents.first().copied().unwrap_or(Type::Unknown)
                })
                .unwrap_or(Type::Unknown),
            Type::Iterator(id) => self
                .types()
                .iterator(id)
                .map(|iterator| iterator.element)
                .unwrap_or(Type::Unknown),
            Type::Builtin(builtin) if builtin.is_string_like() => Type::Builtin(builtin),
            _ => Type::Unknown,
        }
    }
}
