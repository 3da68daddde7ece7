use smallvec::smallvec;

use dunlin_python_ast as ast;

use crate::db::QueryResult;
use crate::semantic::evaluator::{DefKey, Evaluator};
use crate::semantic::scope::VariableSource;
use crate::semantic::types::{
    BuiltinType, ClassId, FunctionId, FunctionType, Overload, OverloadBody, OverloadFlags,
    ParameterKind, ParameterSpec, SpecialForm, Type, Value,
};
use crate::Name;

/// One actual argument at a call site, already evaluated.
#[derive(Clone, Debug)]
pub(crate) enum CallArg {
    Positional(Value),
    /// `*seq`
    StarArgs(Value),
    Keyword(Name, Value),
    /// `**mapping`
    KwSplat(Value),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BindingError {
    TooManyPositional,
    UnknownKeyword(Name),
    MissingArgument(Name),
    DuplicateArgument(Name),
}

#[derive(Clone, Debug)]
struct ArgumentEntry {
    spec: ParameterSpec,
    actual: Option<Value>,
    /// Overflow bucket of a `*args`/`**kwargs` formal.
    extra: Vec<Value>,
}

/// The logical binding of one call site to one overload. Binding errors
/// are recorded, never thrown; overload selection consumes them.
#[derive(Clone, Debug)]
pub(crate) struct ArgumentSet {
    pub(crate) overload_index: usize,
    entries: Vec<ArgumentEntry>,
    errors: Vec<BindingError>,
}

impl ArgumentSet {
    pub(crate) fn build(
        evaluator: &Evaluator<'_>,
        overload_index: usize,
        overload: &Overload,
        receiver: Option<&Value>,
        args: &[CallArg],
    ) -> ArgumentSet {
        let mut entries: Vec<ArgumentEntry> = overload
            .parameters
            .iter()
            .map(|spec| ArgumentEntry {
                spec: spec.clone(),
                actual: None,
                extra: Vec::new(),
            })
            .collect();
        let mut errors = Vec::new();
        let mut saw_star = false;
        let mut saw_kw_splat = false;

        let receiver_slot = receiver.filter(|_| !overload.flags.contains(OverloadFlags::STATIC));

        let assign_positional = |entries: &mut Vec<ArgumentEntry>,
                                     errors: &mut Vec<BindingError>,
                                     value: Value| {
            let next = entries.iter_mut().find(|entry| {
                entry.actual.is_none()
                    && matches!(
                        entry.spec.kind,
                        ParameterKind::PositionalOnly | ParameterKind::PositionalOrKeyword
                    )
            });
            if let Some(entry) = next {
                entry.actual = Some(value);
                return;
            }
            if let Some(varargs) = entries
                .iter_mut()
                .find(|entry| entry.spec.kind == ParameterKind::VarArgs)
            {
                varargs.extra.push(value);
            } else {
                errors.push(BindingError::TooManyPositional);
            }
        };

        if let Some(receiver) = receiver_slot {
            assign_positional(&mut entries, &mut errors, receiver.clone());
        }

        for arg in args {
            match arg {
                CallArg::Positional(value) => {
                    assign_positional(&mut entries, &mut errors, value.clone());
                }
                CallArg::StarArgs(value) => {
                    // A sequence splat fills every remaining positional
                    // formal with the element type; its length is unknown,
                    // so arity stops being checkable.
                    saw_star = true;
                    let element = Value::instance(evaluator.element_of(value));
                    for entry in entries.iter_mut().filter(|entry| {
                        entry.actual.is_none()
                            && matches!(
                                entry.spec.kind,
                                ParameterKind::PositionalOnly
                                    | ParameterKind::PositionalOrKeyword
                            )
                    }) {
                        entry.actual = Some(element.clone());
                    }
                }
                CallArg::Keyword(name, value) => {
                    let matched = entries.iter_mut().find(|entry| {
                        matches!(
                            entry.spec.kind,
                            ParameterKind::PositionalOrKeyword | ParameterKind::KeywordOnly
                        ) && entry.spec.name == *name
                    });
                    match matched {
                        Some(entry) if entry.actual.is_some() => {
                            errors.push(BindingError::DuplicateArgument(name.clone()));
                        }
                        Some(entry) => {
                            entry.actual = Some(value.clone());
                        }
                        None => {
                            if let Some(kwargs) = entries
                                .iter_mut()
                                .find(|entry| entry.spec.kind == ParameterKind::KwArgs)
                            {
                                kwargs.extra.push(value.clone());
                            } else {
                                errors.push(BindingError::UnknownKeyword(name.clone()));
                            }
                        }
                    }
                }
                CallArg::KwSplat(value) => {
                    saw_kw_splat = true;
                    if let Some(kwargs) = entries
                        .iter_mut()
                        .find(|entry| entry.spec.kind == ParameterKind::KwArgs)
                    {
                        kwargs.extra.push(value.clone());
                    }
                }
            }
        }

        if !saw_star && !saw_kw_splat {
            for entry in &entries {
                if entry.actual.is_none()
                    && entry.spec.default.is_none()
                    && !matches!(
                        entry.spec.kind,
                        ParameterKind::VarArgs | ParameterKind::KwArgs
                    )
                {
                    errors.push(BindingError::MissingArgument(entry.spec.name.clone()));
                }
            }
        }

        ArgumentSet {
            overload_index,
            entries,
            errors,
        }
    }

    pub(crate) fn errors(&self) -> &[BindingError] {
        &self.errors
    }

    /// The loose match rule: every bound formal's annotated type must be
    /// absent or `==` the actual type. Deliberately ignores inheritance
    /// and union membership.
    fn annotations_match(&self) -> bool {
        self.entries.iter().all(|entry| {
            match (&entry.actual, entry.spec.has_annotation) {
                (Some(actual), true) => entry.spec.annotated == actual.ty(),
                _ => true,
            }
        })
    }

    /// Produces the concrete value for each formal: the actual if bound,
    /// else the evaluated default, else the annotated type's sentinel.
    pub(crate) fn evaluate(
        &self,
        evaluator: &mut Evaluator<'_>,
    ) -> QueryResult<Vec<(Name, Value)>> {
        let mut values = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let value = match entry.spec.kind {
                ParameterKind::VarArgs => {
                    let contents: Vec<Type> =
                        entry.extra.iter().map(|value| value.ty()).collect();
                    let content = evaluator.union_of(&contents);
                    let tuple = evaluator.types().add_collection(
                        evaluator.module,
                        BuiltinType::Tuple,
                        smallvec![content],
                        true,
                    );
                    Value::instance(tuple)
                }
                ParameterKind::KwArgs => {
                    let contents: Vec<Type> =
                        entry.extra.iter().map(|value| value.ty()).collect();
                    let content = evaluator.union_of(&contents);
                    let dict = evaluator.types().add_collection(
                        evaluator.module,
                        BuiltinType::Dict,
                        smallvec![Type::Builtin(BuiltinType::Str), content],
                        true,
                    );
                    Value::instance(dict)
                }
                _ => match (&entry.actual, &entry.spec.default) {
                    (Some(actual), _) => actual.clone(),
                    (None, Some(default)) => evaluator.get_value_from_expression(default)?,
                    (None, None) => Value::instance(entry.spec.annotated),
                },
            };
            values.push((entry.spec.name.clone(), value));
        }
        Ok(values)
    }

    /// Redeclares each parameter as a variable of the current (function)
    /// scope with its bound value.
    pub(crate) fn declare_parameters_in_scope(
        &self,
        evaluator: &mut Evaluator<'_>,
    ) -> QueryResult<()> {
        for (name, value) in self.evaluate(evaluator)? {
            evaluator.declare_in_current(&name, value, VariableSource::Declaration, None);
        }
        Ok(())
    }
}

impl Evaluator<'_> {
    pub(crate) fn evaluate_call(&mut self, call: &ast::CallExpr) -> QueryResult<Value> {
        let target = self.get_value_from_expression(&call.target)?;
        let args = self.evaluate_call_arguments(&call.arguments)?;
        self.call_value(&target, &args)
    }

    pub(crate) fn evaluate_call_arguments(
        &mut self,
        arguments: &ast::Arguments,
    ) -> QueryResult<Vec<CallArg>> {
        let mut args = Vec::with_capacity(arguments.args.len() + arguments.keywords.len());
        for arg in &arguments.args {
            match arg {
                ast::Expr::Starred(starred) => {
                    let value = self.get_value_from_expression(&starred.value)?;
                    args.push(CallArg::StarArgs(value));
                }
                _ => {
                    let value = self.get_value_from_expression(arg)?;
                    args.push(CallArg::Positional(value));
                }
            }
        }
        for keyword in &arguments.keywords {
            let value = self.get_value_from_expression(&keyword.value)?;
            match &keyword.name {
                Some(name) => args.push(CallArg::Keyword(Name::new(&name.id), value)),
                None => args.push(CallArg::KwSplat(value)),
            }
        }
        Ok(args)
    }

    /// The call dispatch ladder.
    pub(crate) fn call_value(&mut self, target: &Value, args: &[CallArg]) -> QueryResult<Value> {
        match target {
            Value::BoundMethod(bound) => {
                let receiver = (*bound.receiver).clone();
                self.call_function(bound.function, Some(receiver), args)
            }
            Value::Type(Type::Function(function)) => {
                // A method accessed unbound still knows its declaring
                // type; the receiver becomes an instance of it.
                let receiver = self
                    .types()
                    .function(*function)
                    .and_then(|f| f.declaring_class)
                    .map(|class| Value::Instance(Type::Class(class)));
                self.call_function(*function, receiver, args)
            }
            Value::Type(Type::Property(function)) => self.call_function(*function, None, args),
            Value::Type(Type::Class(class)) => self.call_constructor(*class, args),
            Value::Type(Type::Builtin(builtin)) => {
                // Builtin constructors ignore their arguments and yield a
                // bare instance.
                Ok(Value::instance(Type::Builtin(*builtin)))
            }
            Value::Type(Type::Collection(_)) => Ok(Value::instance(target.ty())),
            Value::Type(Type::SpecialForm(SpecialForm::TypeVar)) => self.create_type_var(args),
            Value::Instance(Type::Function(function)) => {
                self.call_function(*function, Some(target.clone()), args)
            }
            Value::Instance(Type::Class(_)) => {
                // Calling an instance dispatches to `__call__`.
                match self.type_member(target.ty(), "__call__")? {
                    Some(Value::Type(Type::Function(function))) => {
                        self.call_function(function, Some(target.clone()), args)
                    }
                    _ => Ok(Value::Unknown),
                }
            }
            Value::Unknown => Ok(Value::Unknown),
            _ => {
                tracing::debug!("value of kind {:?} is not callable", target.ty());
                Ok(Value::Unknown)
            }
        }
    }

    /// `T = TypeVar('T', bound=...)` creates a fresh generic placeholder.
    fn create_type_var(&mut self, args: &[CallArg]) -> QueryResult<Value> {
        let name = args.iter().find_map(|arg| match arg {
            CallArg::Positional(Value::Constant(constant)) => {
                constant.try_str().map(str::to_string)
            }
            _ => None,
        });
        let Some(name) = name else {
            return Ok(Value::Unknown);
        };
        let bound = args
            .iter()
            .filter_map(|arg| match arg {
                CallArg::Keyword(kw, value) if kw.as_str() == "bound" => Some(value.ty()),
                _ => None,
            })
            .collect();
        let param = self.types().add_generic_param(self.module, &name, bound);
        Ok(Value::Type(Type::GenericParam(param)))
    }

    /// Calls one function value with an already-evaluated argument list.
    pub(crate) fn call_function_with_values(
        &mut self,
        function: FunctionId,
        receiver: Option<Value>,
        positional: Vec<Value>,
        keywords: Vec<(Name, Value)>,
    ) -> QueryResult<Value> {
        let mut args: Vec<CallArg> = positional.into_iter().map(CallArg::Positional).collect();
        args.extend(
            keywords
                .into_iter()
                .map(|(name, value)| CallArg::Keyword(name, value)),
        );
        self.call_function(function, receiver, &args)
    }

    pub(crate) fn call_function(
        &mut self,
        function: FunctionId,
        receiver: Option<Value>,
        args: &[CallArg],
    ) -> QueryResult<Value> {
        let Some(function_data) = self.types().function(function) else {
            return Ok(Value::Unknown);
        };

        // Every overload's body must have been walked at least once before
        // a call is evaluated against it.
        for index in 0..function_data.overloads.len() {
            if !function_data.overloads[index].walked {
                self.walk_overload_declaration(function, &function_data, index)?;
            }
        }

        let argument_set = self.select_overload(&function_data, receiver.as_ref(), args);
        let overload = &function_data.overloads[argument_set.overload_index];

        // Cross-class dispatch, stubs and annotated returns take the
        // declared type; everything else walks the body.
        let cross_class = match (&receiver, function_data.declaring_class) {
            (Some(receiver), Some(declaring)) => receiver.ty() != Type::Class(declaring),
            _ => false,
        };
        if cross_class || overload.is_stub() || !overload.declared_return.is_unknown() {
            return Ok(Value::instance(overload.declared_return));
        }

        self.infer_return(function, &function_data, &argument_set, receiver)
    }

    /// Overload selection: a single overload is used as-is; otherwise the
    /// first zero-error candidate whose annotations match exactly wins,
    /// then the first zero-error candidate, then the candidate with the
    /// fewest errors. Deterministic for fixed inputs.
    fn select_overload(
        &mut self,
        function: &FunctionType,
        receiver: Option<&Value>,
        args: &[CallArg],
    ) -> ArgumentSet {
        if function.overloads.len() == 1 {
            return ArgumentSet::build(self, 0, &function.overloads[0], receiver, args);
        }

        let candidates: Vec<ArgumentSet> = function
            .overloads
            .iter()
            .enumerate()
            .map(|(index, overload)| ArgumentSet::build(self, index, overload, receiver, args))
            .collect();

        if let Some(exact) = candidates
            .iter()
            .find(|candidate| candidate.errors().is_empty() && candidate.annotations_match())
        {
            return exact.clone();
        }
        if let Some(clean) = candidates
            .iter()
            .find(|candidate| candidate.errors().is_empty())
        {
            return clean.clone();
        }
        candidates
            .into_iter()
            .min_by_key(|candidate| candidate.errors().len())
            .expect("functions have at least one overload")
    }

    /// Walks an overload body once with parameters bound to their
    /// annotated types, so nested definitions register and instance
    /// members settle.
    fn walk_overload_declaration(
        &mut self,
        function: FunctionId,
        function_data: &FunctionType,
        index: usize,
    ) -> QueryResult<()> {
        let overload = &function_data.overloads[index];
        let Some(key) = overload_def_key(overload) else {
            self.types().mark_overload_walked(function, index);
            return Ok(());
        };
        if self.guard.contains(&key) {
            return Ok(());
        }

        // Mark before walking so a recursive call does not re-enter.
        self.types().mark_overload_walked(function, index);

        let parameters = overload.parameters.clone();
        let body = overload.body.clone();
        let scope = overload.scope;

        self.guard.push(key);
        self.self_frames.push(None);
        let result = self.with_scope(scope, |this| {
            for spec in &parameters {
                let value = match spec.kind {
                    ParameterKind::VarArgs => {
                        Value::instance(Type::Builtin(BuiltinType::Tuple))
                    }
                    ParameterKind::KwArgs => Value::instance(Type::Builtin(BuiltinType::Dict)),
                    _ => Value::instance(spec.annotated),
                };
                this.declare_in_current(&spec.name, value, VariableSource::Declaration, None);
            }
            match &body {
                OverloadBody::Def(def) => this.walk_statements(&def.body).map(|_| ()),
                OverloadBody::Lambda(lambda) => {
                    this.get_value_from_expression(&lambda.body).map(|_| ())
                }
                OverloadBody::Synthetic => Ok(()),
            }
        });
        self.self_frames.pop();
        self.guard.pop();
        result
    }

    /// The call evaluator: re-walks the body with the call's concrete
    /// parameter bindings and returns the inferred value. Bails to
    /// `Unknown` when the definition is already in flight.
    fn infer_return(
        &mut self,
        function: FunctionId,
        function_data: &FunctionType,
        argument_set: &ArgumentSet,
        receiver: Option<Value>,
    ) -> QueryResult<Value> {
        let overload = &function_data.overloads[argument_set.overload_index];
        let Some(key) = overload_def_key(overload) else {
            return Ok(Value::Unknown);
        };
        if self.guard.contains(&key) {
            return Ok(Value::Unknown);
        }

        // Member updates through the receiver apply only when the first
        // parameter really is the declaring class's self.
        let self_frame = match (&receiver, function_data.declaring_class) {
            (Some(receiver), Some(declaring))
                if receiver.ty() == Type::Class(declaring)
                    && !overload.flags.contains(OverloadFlags::STATIC) =>
            {
                overload
                    .parameters
                    .first()
                    .map(|spec| (spec.name.clone(), declaring))
            }
            _ => None,
        };

        let body = overload.body.clone();
        let scope = overload.scope;
        let argument_set = argument_set.clone();

        self.guard.push(key);
        self.self_frames.push(self_frame);
        let result = self.with_scope(scope, |this| {
            argument_set.declare_parameters_in_scope(this)?;
            match &body {
                OverloadBody::Def(def) => this.walk_statements(&def.body),
                OverloadBody::Lambda(lambda) => {
                    this.get_value_from_expression(&lambda.body).map(Some)
                }
                OverloadBody::Synthetic => Ok(None),
            }
        });
        self.self_frames.pop();
        self.guard.pop();

        let returned = result?;
        Ok(returned.unwrap_or_else(|| Value::instance(Type::Builtin(BuiltinType::None))))
    }

    /// Constructor evaluation: `__init__` binds the argument set (walking
    /// its body settles instance members), generics specialize from the
    /// call, and the result is an instance.
    pub(crate) fn call_constructor(
        &mut self,
        class: ClassId,
        args: &[CallArg],
    ) -> QueryResult<Value> {
        let Some(class_data) = self.types().class(class) else {
            return Ok(Value::Unknown);
        };

        if let Some(Value::Type(Type::Function(init))) = self.class_member(class, "__init__")? {
            self.call_function(init, Some(Value::Instance(Type::Class(class))), args)?;
        }

        if !class_data.generic_params.is_empty() {
            if let Some(specialized) = self.specialize_from_constructor(class, &class_data, args)?
            {
                return Ok(Value::Instance(Type::Class(specialized)));
            }
        }

        Ok(Value::Instance(Type::Class(class)))
    }
}

fn overload_def_key(overload: &Overload) -> Option<DefKey> {
    match &overload.body {
        OverloadBody::Def(def) => Some(DefKey::function(def)),
        OverloadBody::Lambda(lambda) => Some(DefKey::lambda(lambda)),
        OverloadBody::Synthetic => None,
    }
}

#[cfg(test)]
mod tests {
    use dunlin_python_ast::builder::{
        assign, call, call_with, func_def, int, list, name, param, param_default, params, ret,
        starred, str_,
    };
    use dunlin_python_ast::ModModule;

    use crate::db::tests::TestDb;
    use crate::db::{HasJar, SemanticJar};
    use crate::module::{resolve_module, ModuleId, ModuleName, ModuleResolution, ModuleSearchPath, ModuleSearchPathKind};
    use crate::semantic::types::{BuiltinType, Type, Value};
    use crate::ProgramSettings;

    struct TestCase {
        temp_dir: tempfile::TempDir,
        db: TestDb,
    }

    fn create_test() -> TestCase {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = TestDb::new(ProgramSettings::default());
        let jar: &SemanticJar = db.jar();
        jar.registry.set_search_paths(vec![ModuleSearchPath::new(
            temp_dir.path().canonicalize().unwrap(),
            ModuleSearchPathKind::FirstParty,
        )]);
        TestCase { temp_dir, db }
    }

    fn analyze(case: &TestCase, name: &str, text: &str, tree: ModModule) -> ModuleId {
        std::fs::write(case.temp_dir.path().join(format!("{name}.py")), text).unwrap();
        case.db.parser().register(text, tree);
        match resolve_module(&case.db, &ModuleName::new(name)).unwrap() {
            ModuleResolution::Ok(id) => id,
            other => panic!("module '{name}' should analyze, got {other:?}"),
        }
    }

    fn global_ty(case: &TestCase, module: ModuleId, name: &str) -> Type {
        crate::semantic::global_scope_value(&case.db, module, name)
            .unwrap_or_else(|| panic!("'{name}' should be bound"))
            .ty()
    }

    #[test]
    fn defaults_fill_unbound_parameters() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "def f(a, b=2): return b\nr = f(1)\n",
            dunlin_python_ast::builder::module(vec![
                func_def(
                    "f",
                    params(vec![param("a"), param_default("b", int(2))]),
                    vec![ret(Some(name("b")))],
                ),
                assign("r", call(name("f"), vec![int(1)])),
            ]),
        );

        assert_eq!(global_ty(&case, module, "r"), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn keyword_arguments_bind_by_name() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "def f(a, b=2): return b\nr = f(1, b=\"s\")\n",
            dunlin_python_ast::builder::module(vec![
                func_def(
                    "f",
                    params(vec![param("a"), param_default("b", int(2))]),
                    vec![ret(Some(name("b")))],
                ),
                assign(
                    "r",
                    call_with(name("f"), vec![int(1)], vec![(Some("b"), str_("s"))]),
                ),
            ]),
        );

        assert_eq!(global_ty(&case, module, "r"), Type::Builtin(BuiltinType::Str));
    }

    #[test]
    fn sequence_splat_fills_positionals() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "def f(a, b): return b\nxs = [1, 2]\nr = f(*xs)\n",
            dunlin_python_ast::builder::module(vec![
                func_def(
                    "f",
                    params(vec![param("a"), param("b")]),
                    vec![ret(Some(name("b")))],
                ),
                assign("xs", list(vec![int(1), int(2)])),
                assign("r", call(name("f"), vec![starred(name("xs"))])),
            ]),
        );

        assert_eq!(global_ty(&case, module, "r"), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn binding_errors_never_abort_the_call() {
        let case = create_test();
        // An unknown keyword produces an error entry on the candidate, but
        // the call still evaluates.
        let module = analyze(
            &case,
            "a",
            "def f(a): return a\nr = f(1, wrong=2)\n",
            dunlin_python_ast::builder::module(vec![
                func_def("f", params(vec![param("a")]), vec![ret(Some(name("a")))]),
                assign(
                    "r",
                    call_with(name("f"), vec![int(1)], vec![(Some("wrong"), int(2))]),
                ),
            ]),
        );

        assert_eq!(global_ty(&case, module, "r"), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn constructor_settles_instance_members() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "class C:\n    def __init__(self, size):\n        self.size = size\nc = C(3)\nn = c.size\n",
            dunlin_python_ast::builder::module(vec![
                dunlin_python_ast::builder::class_def(
                    "C",
                    vec![],
                    vec![func_def(
                        "__init__",
                        params(vec![param("self"), param("size")]),
                        vec![dunlin_python_ast::builder::assign_to(
                            dunlin_python_ast::builder::member(name("self"), "size"),
                            name("size"),
                        )],
                    )],
                ),
                assign("c", call(name("C"), vec![int(3)])),
                assign("n", dunlin_python_ast::builder::member(name("c"), "size")),
            ]),
        );

        assert_eq!(global_ty(&case, module, "n"), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn cross_class_dispatch_uses_the_declared_return() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "class Base:\n    def f(self) -> int: return g()\nclass Sub(Base): pass\ns = Sub()\nr = s.f()\n",
            dunlin_python_ast::builder::module(vec![
                dunlin_python_ast::builder::class_def(
                    "Base",
                    vec![],
                    vec![dunlin_python_ast::builder::func_def_full(
                        "f",
                        params(vec![param("self")]),
                        Some(name("int")),
                        vec![],
                        vec![ret(Some(call(name("g"), vec![])))],
                    )],
                ),
                dunlin_python_ast::builder::class_def(
                    "Sub",
                    vec![name("Base")],
                    vec![dunlin_python_ast::builder::pass()],
                ),
                assign("s", call(name("Sub"), vec![])),
                assign("r", call(dunlin_python_ast::builder::member(name("s"), "f"), vec![])),
            ]),
        );

        let jar: &SemanticJar = case.db.jar();
        let s = crate::semantic::global_scope_value(&case.db, module, "s").unwrap();
        let Value::Instance(Type::Class(class)) = s else {
            panic!("s should be an instance of Sub");
        };
        assert_eq!(jar.type_store.class(class).unwrap().name.as_str(), "Sub");

        assert_eq!(global_ty(&case, module, "r"), Type::Builtin(BuiltinType::Int));
    }
}
