use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use dunlin_python_ast as ast;

use crate::module::ModuleId;
use crate::semantic::scope::ScopeId;
use crate::{FxDashMap, FxIndexSet, Name, TargetVersion};

/// The fixed enumeration of builtin types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinType {
    Object,
    Type,
    Int,
    Long,
    Float,
    Complex,
    Bool,
    Str,
    Bytes,
    Unicode,
    List,
    Tuple,
    Dict,
    Set,
    FrozenSet,
    None,
    Ellipsis,
    Function,
    Module,
    Iterator,
    Slice,
    Property,
    StaticMethod,
    ClassMethod,
}

impl BuiltinType {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinType::Object => "object",
            BuiltinType::Type => "type",
            BuiltinType::Int => "int",
            BuiltinType::Long => "long",
            BuiltinType::Float => "float",
            BuiltinType::Complex => "complex",
            BuiltinType::Bool => "bool",
            BuiltinType::Str => "str",
            BuiltinType::Bytes => "bytes",
            BuiltinType::Unicode => "unicode",
            BuiltinType::List => "list",
            BuiltinType::Tuple => "tuple",
            BuiltinType::Dict => "dict",
            BuiltinType::Set => "set",
            BuiltinType::FrozenSet => "frozenset",
            BuiltinType::None => "None",
            BuiltinType::Ellipsis => "ellipsis",
            BuiltinType::Function => "function",
            BuiltinType::Module => "module",
            BuiltinType::Iterator => "iterator",
            BuiltinType::Slice => "slice",
            BuiltinType::Property => "property",
            BuiltinType::StaticMethod => "staticmethod",
            BuiltinType::ClassMethod => "classmethod",
        }
    }

    /// Collapses the per-version string aliases: `unicode` is `str` on 3.x,
    /// `str` is `bytes` on 2.x.
    pub fn normalized(self, version: TargetVersion) -> BuiltinType {
        if version.is_py2() {
            match self {
                BuiltinType::Str => BuiltinType::Bytes,
                other => other,
            }
        } else {
            match self {
                BuiltinType::Unicode => BuiltinType::Str,
                other => other,
            }
        }
    }

    pub fn is_integer_like(self) -> bool {
        matches!(self, BuiltinType::Bool | BuiltinType::Int | BuiltinType::Long)
    }

    pub fn is_string_like(self) -> bool {
        matches!(
            self,
            BuiltinType::Str | BuiltinType::Bytes | BuiltinType::Unicode
        )
    }

    /// The builtins covered by the arithmetic promotion table.
    pub fn supports_arithmetic(self) -> bool {
        self.is_integer_like()
            || self.is_string_like()
            || matches!(self, BuiltinType::Float | BuiltinType::Complex)
    }

    pub fn is_container(self) -> bool {
        matches!(
            self,
            BuiltinType::List
                | BuiltinType::Tuple
                | BuiltinType::Dict
                | BuiltinType::Set
                | BuiltinType::FrozenSet
        )
    }
}

/// Names from the typing module that the analyzer treats structurally
/// rather than as ordinary classes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SpecialForm {
    Any,
    Union,
    Optional,
    Generic,
    TypeVar,
    Overload,
}

impl SpecialForm {
    pub fn name(self) -> &'static str {
        match self {
            SpecialForm::Any => "Any",
            SpecialForm::Union => "Union",
            SpecialForm::Optional => "Optional",
            SpecialForm::Generic => "Generic",
            SpecialForm::TypeVar => "TypeVar",
            SpecialForm::Overload => "overload",
        }
    }
}

macro_rules! local_type_id {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            module: ModuleId,
            local: u32,
        }

        impl $name {
            pub fn module(self) -> ModuleId {
                self.module
            }
        }
    };
}

local_type_id!(ClassId);
local_type_id!(FunctionId);
local_type_id!(UnionId);
local_type_id!(CollectionId);
local_type_id!(IteratorId);
local_type_id!(GenericParamId);
local_type_id!(MarkerId);

/// A type, as a tagged variant over arena ids. Copyable; all payload lives
/// in the [`TypeStore`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    /// The absorbing sentinel: unknown inputs produce unknown outputs, and
    /// no operation on it ever fails.
    Unknown,
    Builtin(BuiltinType),
    SpecialForm(SpecialForm),
    Class(ClassId),
    Function(FunctionId),
    /// A function invoked without arguments when read from an instance.
    Property(FunctionId),
    Module(ModuleId),
    Union(UnionId),
    Collection(CollectionId),
    Iterator(IteratorId),
    GenericParam(GenericParamId),
    /// The `Generic[T, ...]` base-class marker of a generic class
    /// declaration.
    GenericMarker(MarkerId),
}

impl Type {
    pub const fn is_unknown(self) -> bool {
        matches!(self, Type::Unknown)
    }

    /// The module whose source first introduced this type. `None` for the
    /// structural types that belong to no module.
    pub fn declaring_module(self) -> Option<ModuleId> {
        match self {
            Type::Unknown | Type::Builtin(_) | Type::SpecialForm(_) => None,
            Type::Class(id) => Some(id.module()),
            Type::Function(id) | Type::Property(id) => Some(id.module()),
            Type::Module(id) => Some(id),
            Type::Union(id) => Some(id.module()),
            Type::Collection(id) => Some(id.module()),
            Type::Iterator(id) => Some(id.module()),
            Type::GenericParam(id) => Some(id.module()),
            Type::GenericMarker(id) => Some(id.module()),
        }
    }

    pub fn display(self, store: &TypeStore) -> DisplayType<'_> {
        DisplayType { ty: self, store }
    }
}

/// The closed set of member kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemberKind {
    Unknown,
    Module,
    Class,
    Function,
    Property,
    Method,
    Instance,
    Constant,
    Variable,
    Generic,
    Union,
    Iterator,
    BoundMethod,
}

/// A constant: an instance carrying its literal payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstantValue {
    ty: Type,
    value: ast::Constant,
}

impl ConstantValue {
    pub fn new(ty: Type, value: ast::Constant) -> Self {
        Self { ty, value }
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn value(&self) -> &ast::Constant {
        &self.value
    }

    pub fn try_int(&self) -> Option<i64> {
        match self.value {
            ast::Constant::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn try_bool(&self) -> Option<bool> {
        match self.value {
            ast::Constant::Bool(value) => Some(value),
            _ => None,
        }
    }

    pub fn try_str(&self) -> Option<&str> {
        match &self.value {
            ast::Constant::Str(value) => Some(value),
            _ => None,
        }
    }
}

/// A callable with its first parameter pre-supplied.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundMethod {
    pub function: FunctionId,
    pub receiver: Box<Value>,
}

/// A runtime-observable entity: what a name can be bound to.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Unknown,
    /// A class literal, function object, module object or other
    /// type-valued entity.
    Type(Type),
    Instance(Type),
    Constant(ConstantValue),
    BoundMethod(BoundMethod),
}

impl Value {
    pub fn instance(ty: Type) -> Value {
        if ty.is_unknown() {
            Value::Unknown
        } else {
            Value::Instance(ty)
        }
    }

    pub const fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }

    /// The type of the value. A class literal's type is the class itself.
    pub fn ty(&self) -> Type {
        match self {
            Value::Unknown => Type::Unknown,
            Value::Type(ty) => *ty,
            Value::Instance(ty) => *ty,
            Value::Constant(constant) => constant.ty(),
            Value::BoundMethod(bound) => Type::Function(bound.function),
        }
    }

    pub fn kind(&self, store: &TypeStore) -> MemberKind {
        match self {
            Value::Unknown => MemberKind::Unknown,
            Value::Type(ty) => match ty {
                Type::Unknown => MemberKind::Unknown,
                Type::Module(_) => MemberKind::Module,
                Type::Class(_) | Type::Builtin(_) | Type::Collection(_) => MemberKind::Class,
                Type::SpecialForm(_) => MemberKind::Class,
                Type::Function(id) => {
                    if store
                        .function(*id)
                        .is_some_and(|function| function.declaring_class.is_some())
                    {
                        MemberKind::Method
                    } else {
                        MemberKind::Function
                    }
                }
                Type::Property(_) => MemberKind::Property,
                Type::Union(_) => MemberKind::Union,
                Type::Iterator(_) => MemberKind::Iterator,
                Type::GenericParam(_) | Type::GenericMarker(_) => MemberKind::Generic,
            },
            Value::Instance(_) => MemberKind::Instance,
            Value::Constant(_) => MemberKind::Constant,
            Value::BoundMethod(_) => MemberKind::BoundMethod,
        }
    }
}

/// A class: name, bases in declaration order, the scope holding its
/// members, and the generic machinery.
#[derive(Clone, Debug)]
pub struct ClassType {
    pub name: Name,
    pub module: ModuleId,
    pub bases: Vec<Type>,
    pub scope: ScopeId,
    pub generic_params: SmallVec<[GenericParamId; 2]>,
    pub specialization: Option<FxHashMap<GenericParamId, Type>>,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct OverloadFlags: u8 {
        const STUB = 1 << 0;
        const STATIC = 1 << 1;
        const CLASS_METHOD = 1 << 2;
        const LAMBDA = 1 << 3;
        const SPECIALIZED = 1 << 4;
        /// Declared under the `@overload` decorator.
        const OVERLOAD = 1 << 5;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParameterKind {
    PositionalOnly,
    PositionalOrKeyword,
    VarArgs,
    KeywordOnly,
    KwArgs,
}

#[derive(Clone, Debug)]
pub struct ParameterSpec {
    pub name: Name,
    pub kind: ParameterKind,
    /// The annotated type; `Unknown` when unannotated.
    pub annotated: Type,
    pub has_annotation: bool,
    pub default: Option<ast::Expr>,
}

#[derive(Clone, Debug)]
pub enum OverloadBody {
    Def(Arc<ast::FunctionDef>),
    Lambda(Arc<ast::LambdaExpr>),
    /// No walkable body; builtins and scraped interfaces.
    Synthetic,
}

#[derive(Clone, Debug)]
pub struct Overload {
    pub parameters: Vec<ParameterSpec>,
    /// Declared return type; `Unknown` when unannotated.
    pub declared_return: Type,
    pub body: OverloadBody,
    pub scope: ScopeId,
    pub flags: OverloadFlags,
    /// Whether the body has been walked at least once.
    pub walked: bool,
}

impl Overload {
    pub fn is_stub(&self) -> bool {
        self.flags.contains(OverloadFlags::STUB)
    }
}

/// A function with one or more overloads.
#[derive(Clone, Debug)]
pub struct FunctionType {
    pub name: Name,
    pub module: ModuleId,
    pub declaring_class: Option<ClassId>,
    pub overloads: Vec<Overload>,
}

/// A deduplicated, first-seen-ordered set of types.
#[derive(Clone, Debug)]
pub struct UnionType {
    elements: FxIndexSet<Type>,
}

impl UnionType {
    pub fn elements(&self) -> impl Iterator<Item = Type> + '_ {
        self.elements.iter().copied()
    }
}

/// A list/tuple/set/dict parameterized by one or two content types.
/// `exact` records whether literal contents were captured in full.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionType {
    pub kind: BuiltinType,
    pub contents: SmallVec<[Type; 2]>,
    pub exact: bool,
}

/// The element type produced by `__next__`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct IteratorType {
    pub element: Type,
}

/// A named generic placeholder with an optional bound set.
#[derive(Clone, Debug)]
pub struct GenericParamDef {
    pub name: Name,
    pub bound: SmallVec<[Type; 1]>,
}

#[derive(Debug, Default)]
struct ModuleTypeStore {
    classes: Vec<ClassType>,
    functions: Vec<FunctionType>,
    unions: Vec<UnionType>,
    collections: Vec<CollectionType>,
    iterators: Vec<IteratorType>,
    generic_params: Vec<GenericParamDef>,
    markers: Vec<SmallVec<[GenericParamId; 2]>>,
}

/// Arenas of all types, sharded per declaring module. Ids are
/// `(module, index)` pairs so cross-module references never need pointers.
#[derive(Debug, Default)]
pub struct TypeStore {
    modules: FxDashMap<ModuleId, ModuleTypeStore>,
}

impl TypeStore {
    pub fn remove_module(&self, module: ModuleId) {
        self.modules.remove(&module);
    }

    fn with_module<R>(&self, module: ModuleId, f: impl FnOnce(&mut ModuleTypeStore) -> R) -> R {
        let mut store = self.modules.entry(module).or_default();
        f(&mut store)
    }

    pub fn add_class(
        &self,
        module: ModuleId,
        name: &str,
        scope: ScopeId,
        bases: Vec<Type>,
        generic_params: SmallVec<[GenericParamId; 2]>,
    ) -> ClassId {
        self.with_module(module, |store| {
            let local = u32::try_from(store.classes.len()).expect("class count exceeds u32");
            store.classes.push(ClassType {
                name: Name::new(name),
                module,
                bases,
                scope,
                generic_params,
                specialization: None,
            });
            ClassId { module, local }
        })
    }

    /// Creates the specialized copy of a generic class in the requesting
    /// module.
    pub fn specialize_class(
        &self,
        class: ClassId,
        declaring_module: ModuleId,
        specialization: FxHashMap<GenericParamId, Type>,
    ) -> Option<ClassId> {
        let template = self.class(class)?;
        Some(self.with_module(declaring_module, |store| {
            let local = u32::try_from(store.classes.len()).expect("class count exceeds u32");
            store.classes.push(ClassType {
                specialization: Some(specialization),
                module: declaring_module,
                ..template
            });
            ClassId {
                module: declaring_module,
                local,
            }
        }))
    }

    pub fn class(&self, id: ClassId) -> Option<ClassType> {
        self.modules
            .get(&id.module)?
            .classes
            .get(id.local as usize)
            .cloned()
    }

    pub fn add_function(
        &self,
        module: ModuleId,
        name: &str,
        declaring_class: Option<ClassId>,
        overload: Overload,
    ) -> FunctionId {
        self.with_module(module, |store| {
            let local = u32::try_from(store.functions.len()).expect("function count exceeds u32");
            store.functions.push(FunctionType {
                name: Name::new(name),
                module,
                declaring_class,
                overloads: vec![overload],
            });
            FunctionId { module, local }
        })
    }

    pub fn function(&self, id: FunctionId) -> Option<FunctionType> {
        self.modules
            .get(&id.module)?
            .functions
            .get(id.local as usize)
            .cloned()
    }

    pub fn push_overload(&self, id: FunctionId, overload: Overload) {
        self.with_module(id.module, |store| {
            if let Some(function) = store.functions.get_mut(id.local as usize) {
                function.overloads.push(overload);
            }
        });
    }

    pub fn mark_overload_walked(&self, id: FunctionId, overload_index: usize) {
        self.with_module(id.module, |store| {
            if let Some(overload) = store
                .functions
                .get_mut(id.local as usize)
                .and_then(|function| function.overloads.get_mut(overload_index))
            {
                overload.walked = true;
            }
        });
    }

    /// Adds a union with normalization: nested unions flatten, duplicates
    /// collapse, the empty union is `Unknown` and the singleton union is
    /// its only element.
    pub fn add_union(&self, module: ModuleId, elements: &[Type]) -> Type {
        let mut flattened = FxIndexSet::default();
        for ty in elements {
            match ty {
                Type::Union(id) => {
                    for nested in self.union_elements(*id) {
                        flattened.insert(nested);
                    }
                }
                _ => {
                    flattened.insert(*ty);
                }
            }
        }

        match flattened.len() {
            0 => Type::Unknown,
            1 => flattened[0],
            _ => self.with_module(module, |store| {
                let local = u32::try_from(store.unions.len()).expect("union count exceeds u32");
                store.unions.push(UnionType {
                    elements: flattened,
                });
                Type::Union(UnionId { module, local })
            }),
        }
    }

    pub fn union_elements(&self, id: UnionId) -> Vec<Type> {
        self.modules
            .get(&id.module)
            .and_then(|store| {
                store
                    .unions
                    .get(id.local as usize)
                    .map(|union| union.elements().collect())
            })
            .unwrap_or_default()
    }

    pub fn add_collection(
        &self,
        module: ModuleId,
        kind: BuiltinType,
        contents: SmallVec<[Type; 2]>,
        exact: bool,
    ) -> Type {
        debug_assert!(kind.is_container());
        self.with_module(module, |store| {
            let local =
                u32::try_from(store.collections.len()).expect("collection count exceeds u32");
            store.collections.push(CollectionType {
                kind,
                contents,
                exact,
            });
            Type::Collection(CollectionId { module, local })
        })
    }

    pub fn collection(&self, id: CollectionId) -> Option<CollectionType> {
        self.modules
            .get(&id.module)?
            .collections
            .get(id.local as usize)
            .cloned()
    }

    pub fn add_iterator(&self, module: ModuleId, element: Type) -> Type {
        self.with_module(module, |store| {
            let local = u32::try_from(store.iterators.len()).expect("iterator count exceeds u32");
            store.iterators.push(IteratorType { element });
            Type::Iterator(IteratorId { module, local })
        })
    }

    pub fn iterator(&self, id: IteratorId) -> Option<IteratorType> {
        self.modules
            .get(&id.module)?
            .iterators
            .get(id.local as usize)
            .copied()
    }

    pub fn add_generic_param(
        &self,
        module: ModuleId,
        name: &str,
        bound: SmallVec<[Type; 1]>,
    ) -> GenericParamId {
        self.with_module(module, |store| {
            let local =
                u32::try_from(store.generic_params.len()).expect("parameter count exceeds u32");
            store.generic_params.push(GenericParamDef {
                name: Name::new(name),
                bound,
            });
            GenericParamId { module, local }
        })
    }

    pub fn generic_param(&self, id: GenericParamId) -> Option<GenericParamDef> {
        self.modules
            .get(&id.module)?
            .generic_params
            .get(id.local as usize)
            .cloned()
    }

    pub fn add_marker(
        &self,
        module: ModuleId,
        params: SmallVec<[GenericParamId; 2]>,
    ) -> MarkerId {
        self.with_module(module, |store| {
            let local = u32::try_from(store.markers.len()).expect("marker count exceeds u32");
            store.markers.push(params);
            MarkerId { module, local }
        })
    }

    pub fn marker_params(&self, id: MarkerId) -> SmallVec<[GenericParamId; 2]> {
        self.modules
            .get(&id.module)
            .and_then(|store| store.markers.get(id.local as usize).cloned())
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone)]
pub struct DisplayType<'a> {
    ty: Type,
    store: &'a TypeStore,
}

impl std::fmt::Display for DisplayType<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ty {
            Type::Unknown => f.write_str("Unknown"),
            Type::Builtin(builtin) => f.write_str(builtin.name()),
            Type::SpecialForm(form) => f.write_str(form.name()),
            Type::Class(id) => match self.store.class(id) {
                Some(class) => f.write_str(class.name.as_str()),
                None => f.write_str("<removed class>"),
            },
            Type::Function(id) | Type::Property(id) => match self.store.function(id) {
                Some(function) => f.write_str(function.name.as_str()),
                None => f.write_str("<removed function>"),
            },
            Type::Module(id) => write!(f, "<module {}>", id.as_u32()),
            Type::Union(id) => {
                for (index, element) in self.store.union_elements(id).into_iter().enumerate() {
                    if index > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{}", element.display(self.store))?;
                }
                Ok(())
            }
            Type::Collection(id) => match self.store.collection(id) {
                Some(collection) => {
                    f.write_str(collection.kind.name())?;
                    f.write_str("[")?;
                    for (index, content) in collection.contents.iter().enumerate() {
                        if index > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{}", content.display(self.store))?;
                    }
                    f.write_str("]")
                }
                None => f.write_str("<removed collection>"),
            },
            Type::Iterator(id) => match self.store.iterator(id) {
                Some(iterator) => {
                    write!(f, "iterator[{}]", iterator.element.display(self.store))
                }
                None => f.write_str("iterator"),
            },
            Type::GenericParam(id) => match self.store.generic_param(id) {
                Some(param) => f.write_str(param.name.as_str()),
                None => f.write_str("<removed parameter>"),
            },
            Type::GenericMarker(_) => f.write_str("Generic[...]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use smallvec::{smallvec, SmallVec};

    use dunlin_python_ast::Constant;

    use crate::module::ModuleId;
    use crate::semantic::scope::ScopeId;
    use crate::TargetVersion;

    use super::{BuiltinType, ConstantValue, Type, TypeStore, Value};

    fn test_module() -> ModuleId {
        ModuleId::from_u32(0)
    }

    #[test]
    fn constant_is_subordinate_to_its_type() {
        let constant = ConstantValue::new(Type::Builtin(BuiltinType::Int), Constant::Int(3));
        let value = Value::Constant(constant);

        assert_eq!(value.ty(), Type::Builtin(BuiltinType::Int));
    }

    #[test]
    fn version_aliasing() {
        assert_eq!(
            BuiltinType::Unicode.normalized(TargetVersion::Py38),
            BuiltinType::Str
        );
        assert_eq!(
            BuiltinType::Str.normalized(TargetVersion::Py27),
            BuiltinType::Bytes
        );
        assert_eq!(
            BuiltinType::Bytes.normalized(TargetVersion::Py38),
            BuiltinType::Bytes
        );
    }

    #[test]
    fn add_class_and_display() {
        let store = TypeStore::default();
        let id = store.add_class(test_module(), "C", ScopeId::ROOT, Vec::new(), SmallVec::new());

        assert_eq!(store.class(id).unwrap().name.as_str(), "C");
        assert_eq!(format!("{}", Type::Class(id).display(&store)), "C");
    }

    #[test]
    fn union_flattens_and_deduplicates() {
        let store = TypeStore::default();
        let int = Type::Builtin(BuiltinType::Int);
        let string = Type::Builtin(BuiltinType::Str);
        let none = Type::Builtin(BuiltinType::None);

        let inner = store.add_union(test_module(), &[int, string]);
        let outer = store.add_union(test_module(), &[inner, int, none]);

        let Type::Union(id) = outer else {
            panic!("{outer:?} should be a union");
        };
        assert_eq!(store.union_elements(id), vec![int, string, none]);
    }

    #[test]
    fn union_of_one_element_is_the_element() {
        let store = TypeStore::default();
        let int = Type::Builtin(BuiltinType::Int);

        assert_eq!(store.add_union(test_module(), &[int, int]), int);
        assert_eq!(store.add_union(test_module(), &[]), Type::Unknown);
    }

    #[test]
    fn collection_display() {
        let store = TypeStore::default();
        let ty = store.add_collection(
            test_module(),
            BuiltinType::Dict,
            smallvec![
                Type::Builtin(BuiltinType::Str),
                Type::Builtin(BuiltinType::Int)
            ],
            true,
        );

        assert_eq!(format!("{}", ty.display(&store)), "dict[str, int]");
    }

    #[test]
    fn unknown_instance_collapses_to_unknown() {
        assert_eq!(Value::instance(Type::Unknown), Value::Unknown);
        assert!(Value::instance(Type::Builtin(BuiltinType::Int)) != Value::Unknown);
    }
}
