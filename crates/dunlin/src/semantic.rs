use dunlin_python_ast as ast;

use crate::db::{HasJar, QueryResult, SemanticDb, SemanticJar};
use crate::module::{ModuleId, ModuleName};
use crate::parse::Parsed;
use crate::semantic::evaluator::Evaluator;
use crate::semantic::scope::{ScopeId, ScopeStore};
use crate::semantic::types::{Type, Value};
use crate::Name;

pub(crate) mod builtins;
pub(crate) mod call;
pub(crate) mod evaluator;
pub(crate) mod generics;
pub mod scope;
pub mod types;

/// Analyzes a parsed module: builds its global scope and binds every
/// module-level name. The registry drives this as the `Analyzing` step of
/// the content lifecycle.
#[tracing::instrument(level = "debug", skip(db, parsed))]
pub(crate) fn analyze_parsed(
    db: &dyn SemanticDb,
    module: ModuleId,
    parsed: &Parsed,
) -> QueryResult<()> {
    let jar: &SemanticJar = db.jar();
    let name = jar
        .registry
        .module_name(module)
        .map(|name| name.as_str().to_string())
        .unwrap_or_default();
    jar.scopes.insert(module, ScopeStore::new(module, &name));

    let mut evaluator = Evaluator::new(db, module);
    evaluator.walk_module(parsed.ast())
}

/// The value bound to `name` in a module's global scope.
pub fn global_scope_value(db: &dyn SemanticDb, module: ModuleId, name: &str) -> Option<Value> {
    let jar: &SemanticJar = db.jar();
    jar.scopes
        .with(module, |scopes| {
            scopes
                .scope(ScopeId::ROOT)
                .variable(name)
                .map(|variable| variable.value().clone())
        })
        .flatten()
}

/// The member names a module exposes.
///
/// A literal `__all__` restricts the set. Otherwise re-exported modules
/// and re-exports from the typing module are excluded, except when the
/// module *is* the typing module.
pub fn member_names(db: &dyn SemanticDb, module: ModuleId) -> Vec<Name> {
    let jar: &SemanticJar = db.jar();
    let typing = jar.registry.id_by_name(&ModuleName::new("typing"));
    let is_typing = typing == Some(module);

    jar.scopes
        .with(module, |scopes| {
            if let Some(all) = scopes.dunder_all() {
                return all.to_vec();
            }
            scopes
                .scope(ScopeId::ROOT)
                .variables()
                .filter(|variable| {
                    if matches!(variable.value(), Value::Type(Type::Module(_))) {
                        return false;
                    }
                    if !is_typing {
                        if let Some(link) = variable.import_link() {
                            if typing == Some(link.module) {
                                return false;
                            }
                        }
                    }
                    true
                })
                .map(|variable| variable.name().clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Evaluates one expression in the context of a module's global scope:
/// the "what is the value of this expression" query.
pub fn evaluate_expression(
    db: &dyn SemanticDb,
    module: ModuleId,
    expression: &ast::Expr,
) -> QueryResult<Value> {
    let mut evaluator = Evaluator::new(db, module);
    evaluator.get_value_from_expression(expression)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use dunlin_python_ast::builder::{
        and, ann_assign, assign, assign_to, binary, bool_, call, class_def, comprehension,
        conditional, dict, ellipsis, expr_stmt, func_def, func_def_full, import_from, index, int,
        lambda, list, member, module, name, or, param, param_ann, params, ret, str_, unary,
    };
    use dunlin_python_ast::{BinaryOp, ComprehensionKind, Expr, ModModule, UnaryOp};

    use crate::db::tests::TestDb;
    use crate::db::{HasJar, SemanticJar};
    use crate::module::{resolve_module, ModuleId, ModuleName, ModuleResolution, ModuleSearchPath, ModuleSearchPathKind};
    use crate::semantic::scope::ScopeId;
    use crate::semantic::types::{BuiltinType, MemberKind, Type, Value};
    use crate::ProgramSettings;

    struct TestCase {
        temp_dir: tempfile::TempDir,
        db: TestDb,
        src: PathBuf,
    }

    fn create_test() -> TestCase {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().canonicalize().unwrap().join("src");
        std::fs::create_dir(&src).unwrap();

        let db = TestDb::new(ProgramSettings::default());
        let jar: &SemanticJar = db.jar();
        jar.registry.set_search_paths(vec![ModuleSearchPath::new(
            src.clone(),
            ModuleSearchPathKind::FirstParty,
        )]);

        TestCase { temp_dir, db, src }
    }

    /// Writes `name.py` with marker text and registers the tree the test
    /// parser hands back for it.
    fn add_module(case: &TestCase, name: &str, text: &str, tree: ModModule) {
        std::fs::write(case.src.join(format!("{name}.py")), text).unwrap();
        case.db.parser().register(text, tree);
    }

    fn analyze(case: &TestCase, name: &str) -> ModuleId {
        let resolution = resolve_module(&case.db, &ModuleName::new(name)).unwrap();
        match resolution {
            ModuleResolution::Ok(id) => id,
            other => panic!("module '{name}' should analyze, got {other:?}"),
        }
    }

    fn global_value(case: &TestCase, module: ModuleId, name: &str) -> Value {
        super::global_scope_value(&case.db, module, name)
            .unwrap_or_else(|| panic!("'{name}' should be bound"))
    }

    fn assert_instance_of(value: &Value, builtin: BuiltinType) {
        assert_eq!(
            value.ty(),
            Type::Builtin(builtin),
            "{value:?} should be a {} value",
            builtin.name()
        );
    }

    #[test]
    fn simple_inference() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "x = 1\ny = x + 2\n",
            module(vec![
                assign("x", int(1)),
                assign("y", binary(name("x"), BinaryOp::Add, int(2))),
            ]),
        );

        let a = analyze(&case, "a");

        let x = global_value(&case, a, "x");
        let Value::Constant(constant) = &x else {
            panic!("x should fold to a constant, got {x:?}");
        };
        assert_eq!(constant.try_int(), Some(1));
        assert_eq!(x.ty(), Type::Builtin(BuiltinType::Int));

        let y = global_value(&case, a, "y");
        assert_eq!(y.ty(), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn class_and_method() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "class C:\n    def f(self): return \"ok\"\nc = C()\nr = c.f()\n",
            module(vec![
                class_def(
                    "C",
                    vec![],
                    vec![func_def("f", params(vec![param("self")]), vec![ret(Some(str_("ok")))])],
                ),
                assign("c", call(name("C"), vec![])),
                assign("r", call(member(name("c"), "f"), vec![])),
            ]),
        );

        let a = analyze(&case, "a");

        let class = global_value(&case, a, "C");
        assert!(matches!(class, Value::Type(Type::Class(_))));

        let c = global_value(&case, a, "c");
        assert!(matches!(c, Value::Instance(Type::Class(_))));
        assert_eq!(c.ty(), class.ty());

        let r = global_value(&case, a, "r");
        assert_eq!(r.ty(), Type::Builtin(BuiltinType::Str));
    }

    #[test]
    fn generic_container() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "from typing import List\nxs: List[int] = []\ny = xs[0]\n",
            module(vec![
                import_from("typing", vec![("List", None)]),
                ann_assign("xs", index(name("List"), name("int")), Some(list(vec![]))),
                assign("y", index(name("xs"), int(0))),
            ]),
        );

        let a = analyze(&case, "a");

        let xs = global_value(&case, a, "xs");
        let Value::Instance(Type::Collection(id)) = xs else {
            panic!("xs should be a parameterized collection, got {xs:?}");
        };
        let jar: &SemanticJar = case.db.jar();
        let collection = jar.type_store.collection(id).unwrap();
        assert_eq!(collection.kind, BuiltinType::List);
        assert_eq!(collection.contents.as_slice(), &[Type::Builtin(BuiltinType::Int)]);

        let y = global_value(&case, a, "y");
        assert_instance_of(&y, BuiltinType::Int);
    }

    #[test]
    fn overload_selection() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "from typing import overload\n\
             @overload\n\
             def p(r: None) -> None: ...\n\
             @overload\n\
             def p(r: int) -> str: ...\n\
             a = p(None)\n\
             b = p(5)\n",
            module(vec![
                import_from("typing", vec![("overload", None)]),
                func_def_full(
                    "p",
                    params(vec![param_ann("r", dunlin_python_ast::builder::none())]),
                    Some(dunlin_python_ast::builder::none()),
                    vec![name("overload")],
                    vec![expr_stmt(ellipsis())],
                ),
                func_def_full(
                    "p",
                    params(vec![param_ann("r", name("int"))]),
                    Some(name("str")),
                    vec![name("overload")],
                    vec![expr_stmt(ellipsis())],
                ),
                assign("a", call(name("p"), vec![dunlin_python_ast::builder::none()])),
                assign("b", call(name("p"), vec![int(5)])),
            ]),
        );

        let a_module = analyze(&case, "a");

        let a = global_value(&case, a_module, "a");
        assert_instance_of(&a, BuiltinType::None);

        let b = global_value(&case, a_module, "b");
        assert_instance_of(&b, BuiltinType::Str);
    }

    #[test]
    fn overload_selection_is_deterministic() {
        for _ in 0..4 {
            overload_selection();
        }
    }

    #[test]
    fn operator_overload_dispatch() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "class V:\n    def __add__(self, o): return 7\nv = V() + V()\n",
            module(vec![
                class_def(
                    "V",
                    vec![],
                    vec![func_def(
                        "__add__",
                        params(vec![param("self"), param("o")]),
                        vec![ret(Some(int(7)))],
                    )],
                ),
                assign(
                    "v",
                    binary(call(name("V"), vec![]), BinaryOp::Add, call(name("V"), vec![])),
                ),
            ]),
        );

        let a = analyze(&case, "a");
        let v = global_value(&case, a, "v");
        assert_eq!(v.ty(), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn recursive_call_terminates() {
        let case = create_test();
        // def f(n): return f(n - 1) if n > 0 else 0
        add_module(
            &case,
            "a",
            "def f(n): return f(n - 1) if n > 0 else 0\nr = f(3)\n",
            module(vec![
                func_def(
                    "f",
                    params(vec![param("n")]),
                    vec![ret(Some(conditional(
                        binary(name("n"), BinaryOp::Gt, int(0)),
                        call(name("f"), vec![binary(name("n"), BinaryOp::Sub, int(1))]),
                        int(0),
                    )))],
                ),
                assign("r", call(name("f"), vec![int(3)])),
            ]),
        );

        let a = analyze(&case, "a");
        let r = global_value(&case, a, "r");
        assert_eq!(r.ty(), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn import_cycle_finishes() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "from b import x\ny = 1\n",
            module(vec![
                import_from("b", vec![("x", None)]),
                assign("y", int(1)),
            ]),
        );
        add_module(
            &case,
            "b",
            "from a import y\nx = 2\n",
            module(vec![
                import_from("a", vec![("y", None)]),
                assign("x", int(2)),
            ]),
        );

        // Both modules finish; neither hangs. The names resolve to
        // whichever side won the race, or Unknown.
        let a = analyze(&case, "a");
        let b = analyze(&case, "b");

        assert!(super::global_scope_value(&case.db, a, "x").is_some());
        assert!(super::global_scope_value(&case.db, b, "y").is_some());

        let y = global_value(&case, a, "y");
        assert_eq!(y.ty(), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn list_capture_limit() {
        let case = create_test();
        let items: Vec<Expr> = (0i64..1001).map(int).collect();
        add_module(
            &case,
            "a",
            "xs = [0, 1, 2]  # and 998 more\n",
            module(vec![assign("xs", list(items))]),
        );

        let a = analyze(&case, "a");
        let xs = global_value(&case, a, "xs");
        let Value::Instance(Type::Collection(id)) = xs else {
            panic!("xs should be a collection, got {xs:?}");
        };
        let jar: &SemanticJar = case.db.jar();
        let collection = jar.type_store.collection(id).unwrap();
        assert!(!collection.exact, "1001 items exceed the capture limit");
        assert_eq!(collection.contents.as_slice(), &[Type::Builtin(BuiltinType::Int)]);
    }

    #[test]
    fn int_min_literal() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "x = -2147483648\n",
            module(vec![assign("x", unary(UnaryOp::Neg, int(2_147_483_648)))]),
        );

        let a = analyze(&case, "a");
        let x = global_value(&case, a, "x");
        let Value::Constant(constant) = &x else {
            panic!("x should be a folded constant");
        };
        assert_eq!(constant.try_int(), Some(-2_147_483_648));
    }

    #[test]
    fn dict_key_assignment_widens_by_structural_equality() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "d = {\"a\": 1}\nd[\"b\"] = 2\nd[3] = True\n",
            module(vec![
                assign("d", dict(vec![(str_("a"), int(1))])),
                assign_to(index(name("d"), str_("b")), int(2)),
                assign_to(index(name("d"), int(3)), bool_(true)),
            ]),
        );

        let a = analyze(&case, "a");
        let d = global_value(&case, a, "d");
        let Value::Instance(Type::Collection(id)) = d else {
            panic!("d should be a dict collection");
        };
        let jar: &SemanticJar = case.db.jar();
        let collection = jar.type_store.collection(id).unwrap();
        assert_eq!(collection.kind, BuiltinType::Dict);

        // Re-assigning the same literal key type does not widen; the new
        // key type does.
        let Type::Union(key_union) = collection.contents[0] else {
            panic!("key type should have widened to a union");
        };
        assert_eq!(
            jar.type_store.union_elements(key_union),
            vec![Type::Builtin(BuiltinType::Str), Type::Builtin(BuiltinType::Int)]
        );
    }

    #[test]
    fn unknown_absorption() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "p = mystery + other\nq = mystery < other\nr = mystery and other\n",
            module(vec![
                assign("p", binary(name("mystery"), BinaryOp::Add, name("other"))),
                assign("q", binary(name("mystery"), BinaryOp::Lt, name("other"))),
                assign("r", and(name("mystery"), name("other"))),
            ]),
        );

        let a = analyze(&case, "a");

        assert!(global_value(&case, a, "p").is_unknown());
        assert_instance_of(&global_value(&case, a, "q"), BuiltinType::Bool);
        assert_instance_of(&global_value(&case, a, "r"), BuiltinType::Bool);
    }

    #[test]
    fn or_returns_first_known_side() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "x = mystery or 5\ny = 5 or mystery\n",
            module(vec![
                assign("x", or(name("mystery"), int(5))),
                assign("y", or(int(5), name("mystery"))),
            ]),
        );

        let a = analyze(&case, "a");
        assert_eq!(global_value(&case, a, "x").ty(), Type::Builtin(BuiltinType::Int));
        assert_eq!(global_value(&case, a, "y").ty(), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn comprehension_variables_do_not_leak() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "xs = [1, 2]\nys = [item for item in xs]\n",
            module(vec![
                assign("xs", list(vec![int(1), int(2)])),
                assign(
                    "ys",
                    comprehension(ComprehensionKind::List, name("item"), "item", name("xs")),
                ),
            ]),
        );

        let a = analyze(&case, "a");

        let ys = global_value(&case, a, "ys");
        let Value::Instance(Type::Collection(id)) = ys else {
            panic!("ys should be a list");
        };
        let jar: &SemanticJar = case.db.jar();
        assert_eq!(
            jar.type_store.collection(id).unwrap().contents.as_slice(),
            &[Type::Builtin(BuiltinType::Int)]
        );

        // The iteration variable is gone from the enclosing scope.
        assert!(super::global_scope_value(&case.db, a, "item").is_none());
    }

    #[test]
    fn builtin_function_and_method_calls() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "n = len([1])\ns = \"a\".upper()\n",
            module(vec![
                assign("n", call(name("len"), vec![list(vec![int(1)])])),
                assign("s", call(member(str_("a"), "upper"), vec![])),
            ]),
        );

        let a = analyze(&case, "a");
        assert_instance_of(&global_value(&case, a, "n"), BuiltinType::Int);
        assert_instance_of(&global_value(&case, a, "s"), BuiltinType::Str);
    }

    #[test]
    fn property_read_invokes_the_getter() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "class C:\n    @property\n    def size(self): return 3\nc = C()\nn = c.size\n",
            module(vec![
                class_def(
                    "C",
                    vec![],
                    vec![func_def_full(
                        "size",
                        params(vec![param("self")]),
                        None,
                        vec![name("property")],
                        vec![ret(Some(int(3)))],
                    )],
                ),
                assign("c", call(name("C"), vec![])),
                assign("n", member(name("c"), "size")),
            ]),
        );

        let a = analyze(&case, "a");
        let n = global_value(&case, a, "n");
        assert_eq!(n.ty(), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn lambda_calls_infer_from_the_body() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "f = lambda x: x + 1\nr = f(2)\n",
            module(vec![
                assign(
                    "f",
                    lambda(params(vec![param("x")]), binary(name("x"), BinaryOp::Add, int(1))),
                ),
                assign("r", call(name("f"), vec![int(2)])),
            ]),
        );

        let a = analyze(&case, "a");
        let r = global_value(&case, a, "r");
        assert_eq!(r.ty(), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn conditional_produces_union_of_branches() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "x = 1 if flag else \"s\"\n",
            module(vec![assign(
                "x",
                conditional(name("flag"), int(1), str_("s")),
            )]),
        );

        let a = analyze(&case, "a");
        let x = global_value(&case, a, "x");
        let Type::Union(id) = x.ty() else {
            panic!("x should be a union, got {x:?}");
        };
        let jar: &SemanticJar = case.db.jar();
        assert_eq!(
            jar.type_store.union_elements(id),
            vec![Type::Builtin(BuiltinType::Int), Type::Builtin(BuiltinType::Str)]
        );
    }

    #[test]
    fn member_names_honor_dunder_all() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "__all__ = [\"visible\"]\nvisible = 1\nhidden = 2\n",
            module(vec![
                assign("__all__", list(vec![str_("visible")])),
                assign("visible", int(1)),
                assign("hidden", int(2)),
            ]),
        );

        let a = analyze(&case, "a");
        let names: Vec<String> = super::member_names(&case.db, a)
            .into_iter()
            .map(|name| name.as_str().to_string())
            .collect();
        assert_eq!(names, vec!["visible"]);
    }

    #[test]
    fn member_names_hide_typing_reexports_and_modules() {
        let case = create_test();
        add_module(&case, "b", "z = 1\n", module(vec![assign("z", int(1))]));
        add_module(
            &case,
            "a",
            "import b\nfrom typing import List\nx = 1\n",
            module(vec![
                dunlin_python_ast::builder::import_("b", None),
                import_from("typing", vec![("List", None)]),
                assign("x", int(1)),
            ]),
        );

        let a = analyze(&case, "a");
        let names: Vec<String> = super::member_names(&case.db, a)
            .into_iter()
            .map(|name| name.as_str().to_string())
            .collect();
        assert_eq!(names, vec!["x"]);
    }

    #[test]
    fn reanalysis_is_idempotent() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "x = 1\ndef f(): return x\nclass C: pass\n",
            module(vec![
                assign("x", int(1)),
                func_def("f", params(vec![]), vec![ret(Some(name("x")))]),
                class_def("C", vec![], vec![dunlin_python_ast::builder::pass()]),
            ]),
        );

        let a = analyze(&case, "a");
        let jar: &SemanticJar = case.db.jar();

        let snapshot = |db: &TestDb, module: ModuleId| -> Vec<(String, MemberKind)> {
            let jar: &SemanticJar = db.jar();
            jar.scopes
                .with(module, |scopes| {
                    scopes
                        .scope(ScopeId::ROOT)
                        .variables()
                        .map(|variable| {
                            (
                                variable.name().as_str().to_string(),
                                variable.value().kind(&jar.type_store),
                            )
                        })
                        .collect()
                })
                .unwrap()
        };

        let before = snapshot(&case.db, a);

        jar.registry.invalidate(&case.db, a);
        let again = analyze(&case, "a");
        assert_eq!(a, again, "module identity survives re-analysis");

        let after = snapshot(&case.db, a);
        assert_eq!(before, after);
    }

    #[test]
    fn evaluate_expression_query() {
        let case = create_test();
        add_module(&case, "a", "x = 40\n", module(vec![assign("x", int(40))]));
        let a = analyze(&case, "a");

        let value = super::evaluate_expression(
            &case.db,
            a,
            &binary(name("x"), BinaryOp::Add, int(2)),
        )
        .unwrap();
        let Value::Constant(constant) = &value else {
            panic!("constant folding should apply, got {value:?}");
        };
        assert_eq!(constant.try_int(), Some(42));
    }

    #[test]
    fn cancellation_aborts_resolution() {
        let case = create_test();
        add_module(&case, "a", "x = 1\n", module(vec![assign("x", int(1))]));

        case.db.cancellation_source().cancel();

        let result = resolve_module(&case.db, &ModuleName::new("a"));
        assert!(result.is_err(), "a cancelled query must not complete");
    }

    #[test]
    fn unresolved_import_yields_unknown_and_diagnostic() {
        let case = create_test();
        add_module(
            &case,
            "a",
            "import missing\nx = missing.attr\n",
            module(vec![
                dunlin_python_ast::builder::import_("missing", None),
                assign("x", member(name("missing"), "attr")),
            ]),
        );

        let a = analyze(&case, "a");
        assert!(global_value(&case, a, "x").is_unknown());

        let jar: &SemanticJar = case.db.jar();
        let diagnostics = jar.registry.reportable_diagnostics(a);
        assert!(diagnostics
            .iter()
            .any(|diagnostic| diagnostic.code == "unresolved-import"));

        let _keep_alive = &case.temp_dir;
    }
}
