use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use dunlin_python_ast as ast;

use crate::db::QueryResult;
use crate::semantic::call::CallArg;
use crate::semantic::evaluator::Evaluator;
use crate::semantic::scope::LookupOptions;
use crate::semantic::types::{
    BuiltinType, ClassId, ClassType, GenericParamId, SpecialForm, Type, Value,
};

impl Evaluator<'_> {
    /// Type parameterization of `G[T1, ..., Tn]`. Returns `None` when the
    /// subject is not a generic type and ordinary indexing applies.
    pub(crate) fn index_generic(
        &mut self,
        target: &Value,
        index: &ast::Expr,
    ) -> QueryResult<Option<Value>> {
        let Value::Type(ty) = target else {
            return Ok(None);
        };
        let ty = *ty;

        let applies = match ty {
            Type::SpecialForm(_) => true,
            Type::Builtin(builtin) => builtin.is_container() || builtin == BuiltinType::Iterator,
            Type::Class(class) => self
                .types()
                .class(class)
                .is_some_and(|class| !class.generic_params.is_empty()),
            _ => false,
        };
        if !applies {
            return Ok(None);
        }

        let elements: Vec<&ast::Expr> = match index {
            ast::Expr::Tuple(tuple) => tuple.items.iter().collect(),
            other => vec![other],
        };
        let mut indices = Vec::with_capacity(elements.len());
        for element in elements {
            let value = self.get_value_from_expression(element)?;
            indices.push(self.value_to_type(&value)?);
        }

        Ok(Some(self.apply_type_index(ty, &indices)))
    }

    /// Applies index types to a generic subject: unions for the union
    /// formers, parameterized collections for builtin containers, and
    /// specialization for generic classes.
    pub(crate) fn apply_type_index(&mut self, ty: Type, indices: &[Type]) -> Value {
        match ty {
            Type::SpecialForm(SpecialForm::Union) => {
                Value::Type(self.union_of(indices))
            }
            Type::SpecialForm(SpecialForm::Optional) => {
                let mut with_none = indices.to_vec();
                with_none.push(Type::Builtin(BuiltinType::None));
                Value::Type(self.union_of(&with_none))
            }
            Type::SpecialForm(SpecialForm::Generic) => {
                // `Generic[...]` accepts only parameters; the result is the
                // base-class marker carrying them.
                let params: Option<SmallVec<[GenericParamId; 2]>> = indices
                    .iter()
                    .map(|index| match index {
                        Type::GenericParam(param) => Some(*param),
                        _ => None,
                    })
                    .collect();
                match params {
                    Some(params) if !params.is_empty() => {
                        let marker = self.types().add_marker(self.module, params);
                        Value::Type(Type::GenericMarker(marker))
                    }
                    _ => Value::Unknown,
                }
            }
            Type::SpecialForm(_) => Value::Unknown,
            Type::Builtin(builtin) if builtin == BuiltinType::Iterator => {
                if indices.iter().all(|index| matches!(index, Type::GenericParam(_))) {
                    return Value::Unknown;
                }
                let element = indices.first().copied().unwrap_or(Type::Unknown);
                Value::Type(self.types().add_iterator(self.module, element))
            }
            Type::Builtin(builtin) if builtin.is_container() => {
                // A generic is never resolved with a generic: indices that
                // are all placeholders yield Unknown.
                if indices.iter().all(|index| matches!(index, Type::GenericParam(_))) {
                    return Value::Unknown;
                }
                let contents: SmallVec<[Type; 2]> = if builtin == BuiltinType::Dict {
                    let key = indices.first().copied().unwrap_or(Type::Unknown);
                    let value = indices.get(1).copied().unwrap_or(Type::Unknown);
                    smallvec![key, value]
                } else {
                    smallvec![self.union_of(indices)]
                };
                Value::Type(
                    self.types()
                        .add_collection(self.module, builtin, contents, true),
                )
            }
            Type::Class(class) => {
                let Some(class_data) = self.types().class(class) else {
                    return Value::Unknown;
                };
                if class_data.generic_params.is_empty() {
                    return Value::Unknown;
                }
                if indices.iter().all(|index| matches!(index, Type::GenericParam(_))) {
                    return Value::Unknown;
                }
                let mut specialization = FxHashMap::default();
                for (param, index) in class_data.generic_params.iter().zip(indices) {
                    specialization.insert(*param, *index);
                }
                // Parameters without a supplied index stay themselves.
                for param in class_data
                    .generic_params
                    .iter()
                    .skip(indices.len())
                {
                    specialization.insert(*param, Type::GenericParam(*param));
                }
                match self
                    .types()
                    .specialize_class(class, self.module, specialization)
                {
                    Some(specialized) => Value::Type(Type::Class(specialized)),
                    None => Value::Unknown,
                }
            }
            _ => Value::Unknown,
        }
    }

    /// Maps a syntactic annotation to a type. Names resolve with the
    /// global-and-builtins lookup; subscripted annotations flow through
    /// the generic path; call annotations pass through the callable path.
    pub(crate) fn convert_annotation(&mut self, annotation: &ast::Expr) -> QueryResult<Type> {
        match annotation {
            ast::Expr::Name(name) => {
                let value = self.lookup_name_with(
                    &name.id,
                    name.span,
                    LookupOptions::GLOBAL | LookupOptions::BUILTINS,
                )?;
                self.value_to_type(&value)
            }
            ast::Expr::Constant(constant) => match &constant.value {
                ast::Constant::None => Ok(Type::Builtin(BuiltinType::None)),
                // A string annotation is a forward reference.
                ast::Constant::Str(name) => {
                    let value = self.lookup_name_with(
                        name,
                        constant.span,
                        LookupOptions::GLOBAL | LookupOptions::BUILTINS,
                    )?;
                    self.value_to_type(&value)
                }
                _ => Ok(Type::Unknown),
            },
            ast::Expr::Index(index) => {
                let subject = self.convert_annotation(&index.target)?;
                let elements: Vec<&ast::Expr> = match &*index.index {
                    ast::Expr::Tuple(tuple) => tuple.items.iter().collect(),
                    other => vec![other],
                };
                let mut indices = Vec::with_capacity(elements.len());
                for element in elements {
                    indices.push(self.convert_annotation(element)?);
                }
                Ok(self.apply_type_index(subject, &indices).ty())
            }
            ast::Expr::Member(_) => {
                let value = self.get_value_from_expression(annotation)?;
                self.value_to_type(&value)
            }
            ast::Expr::Call(_) => {
                let value = self.get_value_from_expression(annotation)?;
                Ok(value.ty())
            }
            _ => Ok(Type::Unknown),
        }
    }

    /// The type denoted by a type-expression value.
    pub(crate) fn value_to_type(&mut self, value: &Value) -> QueryResult<Type> {
        match value {
            Value::Type(ty) => Ok(*ty),
            Value::Constant(constant) => match constant.value() {
                ast::Constant::None => Ok(Type::Builtin(BuiltinType::None)),
                ast::Constant::Str(name) => {
                    let resolved = self.lookup_name_with(
                        name,
                        dunlin_python_ast::Span::default(),
                        LookupOptions::GLOBAL | LookupOptions::BUILTINS,
                    )?;
                    match resolved {
                        Value::Type(ty) => Ok(ty),
                        _ => Ok(Type::Unknown),
                    }
                }
                _ => Ok(Type::Unknown),
            },
            _ => Ok(Type::Unknown),
        }
    }

    /// Specialization of a generic class from a constructor call: the
    /// `__init__` parameter annotations bind placeholders when declared;
    /// otherwise arguments bind positionally.
    pub(crate) fn specialize_from_constructor(
        &mut self,
        class: ClassId,
        class_data: &ClassType,
        args: &[CallArg],
    ) -> QueryResult<Option<ClassId>> {
        let positional: Vec<Type> = args
            .iter()
            .filter_map(|arg| match arg {
                CallArg::Positional(value) => Some(value.ty()),
                _ => None,
            })
            .collect();

        let mut specialization: FxHashMap<GenericParamId, Type> = FxHashMap::default();

        if let Some(Value::Type(Type::Function(init))) = self.class_member(class, "__init__")? {
            if let Some(function) = self.types().function(init) {
                let overload = &function.overloads[0];
                // Parameters after the receiver line up with positionals.
                for (index, spec) in overload.parameters.iter().skip(1).enumerate() {
                    if let Type::GenericParam(param) = spec.annotated {
                        if let Some(actual) = positional.get(index) {
                            specialization.insert(param, *actual);
                        }
                    }
                }
            }
        }

        if specialization.is_empty() {
            for (param, actual) in class_data.generic_params.iter().zip(&positional) {
                specialization.insert(*param, *actual);
            }
        }

        if specialization.is_empty() {
            return Ok(None);
        }

        for param in &class_data.generic_params {
            specialization
                .entry(*param)
                .or_insert(Type::GenericParam(*param));
        }

        Ok(self
            .types()
            .specialize_class(class, self.module, specialization))
    }
}

#[cfg(test)]
mod tests {
    use dunlin_python_ast::builder::{
        ann_assign, assign, call, class_def, func_def, import_from, index, int, member, name,
        none, param, param_ann, params, pass, str_,
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

    fn global_value(case: &TestCase, module: ModuleId, name: &str) -> Value {
        crate::semantic::global_scope_value(&case.db, module, name)
            .unwrap_or_else(|| panic!("'{name}' should be bound"))
    }

    #[test]
    fn optional_annotation_unions_with_none() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "from typing import Optional\nx: Optional[int] = None\n",
            dunlin_python_ast::builder::module(vec![
                import_from("typing", vec![("Optional", None)]),
                ann_assign("x", index(name("Optional"), name("int")), Some(none())),
            ]),
        );

        let x = global_value(&case, module, "x");
        let Type::Union(id) = x.ty() else {
            panic!("x should be a union, got {x:?}");
        };
        let jar: &SemanticJar = case.db.jar();
        assert_eq!(
            jar.type_store.union_elements(id),
            vec![Type::Builtin(BuiltinType::Int), Type::Builtin(BuiltinType::None)]
        );
    }

    #[test]
    fn union_annotation_flattens_members() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "from typing import Union\nx: Union[int, str] = 1\n",
            dunlin_python_ast::builder::module(vec![
                import_from("typing", vec![("Union", None)]),
                ann_assign(
                    "x",
                    index(
                        name("Union"),
                        dunlin_python_ast::builder::tuple(vec![name("int"), name("str")]),
                    ),
                    Some(int(1)),
                ),
            ]),
        );

        let x = global_value(&case, module, "x");
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
    fn dict_annotation_takes_two_content_types() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "from typing import Dict\nx: Dict[str, int] = {}\n",
            dunlin_python_ast::builder::module(vec![
                import_from("typing", vec![("Dict", None)]),
                ann_assign(
                    "x",
                    index(
                        name("Dict"),
                        dunlin_python_ast::builder::tuple(vec![name("str"), name("int")]),
                    ),
                    Some(dunlin_python_ast::builder::dict(vec![])),
                ),
            ]),
        );

        let x = global_value(&case, module, "x");
        let Value::Instance(Type::Collection(id)) = x else {
            panic!("x should be a dict collection, got {x:?}");
        };
        let jar: &SemanticJar = case.db.jar();
        let collection = jar.type_store.collection(id).unwrap();
        assert_eq!(collection.kind, BuiltinType::Dict);
        assert_eq!(
            collection.contents.as_slice(),
            &[Type::Builtin(BuiltinType::Str), Type::Builtin(BuiltinType::Int)]
        );
    }

    #[test]
    fn generic_class_specializes_by_subscription() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "from typing import Generic, TypeVar\nT = TypeVar(\"T\")\nclass Box(Generic[T]): pass\nIntBox = Box[int]\n",
            dunlin_python_ast::builder::module(vec![
                import_from("typing", vec![("Generic", None), ("TypeVar", None)]),
                assign("T", call(name("TypeVar"), vec![str_("T")])),
                class_def("Box", vec![index(name("Generic"), name("T"))], vec![pass()]),
                assign("IntBox", index(name("Box"), name("int"))),
            ]),
        );

        let int_box = global_value(&case, module, "IntBox");
        let Value::Type(Type::Class(class)) = int_box else {
            panic!("IntBox should be a specialized class, got {int_box:?}");
        };
        let jar: &SemanticJar = case.db.jar();
        let class_data = jar.type_store.class(class).unwrap();
        let specialization = class_data
            .specialization
            .expect("subscription should specialize the class");
        assert_eq!(
            specialization.values().copied().collect::<Vec<_>>(),
            vec![Type::Builtin(BuiltinType::Int)]
        );
    }

    #[test]
    fn constructor_specializes_from_init_annotations() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "from typing import Generic, TypeVar\nT = TypeVar(\"T\")\nclass Box(Generic[T]):\n    def __init__(self, item: T):\n        self.item = item\nb = Box(5)\n",
            dunlin_python_ast::builder::module(vec![
                import_from("typing", vec![("Generic", None), ("TypeVar", None)]),
                assign("T", call(name("TypeVar"), vec![str_("T")])),
                class_def(
                    "Box",
                    vec![index(name("Generic"), name("T"))],
                    vec![func_def(
                        "__init__",
                        params(vec![param("self"), param_ann("item", name("T"))]),
                        vec![dunlin_python_ast::builder::assign_to(
                            member(name("self"), "item"),
                            name("item"),
                        )],
                    )],
                ),
                assign("b", call(name("Box"), vec![int(5)])),
            ]),
        );

        let b = global_value(&case, module, "b");
        let Value::Instance(Type::Class(class)) = b else {
            panic!("b should be an instance of a specialized Box, got {b:?}");
        };
        let jar: &SemanticJar = case.db.jar();
        let class_data = jar.type_store.class(class).unwrap();
        let specialization = class_data
            .specialization
            .expect("the constructor should specialize the class");
        assert_eq!(
            specialization.values().copied().collect::<Vec<_>>(),
            vec![Type::Builtin(BuiltinType::Int)]
        );
    }

    #[test]
    fn all_parameter_indices_stay_unresolved() {
        let case = create_test();
        let module = analyze(
            &case,
            "a",
            "from typing import List, TypeVar\nT = TypeVar(\"T\")\nx = List[T]\n",
            dunlin_python_ast::builder::module(vec![
                import_from("typing", vec![("List", None), ("TypeVar", None)]),
                assign("T", call(name("TypeVar"), vec![str_("T")])),
                assign("x", index(name("List"), name("T"))),
            ]),
        );

        // A generic is never resolved with a generic.
        let x = global_value(&case, module, "x");
        assert!(x.is_unknown(), "List[T] should stay unresolved, got {x:?}");
    }
}
