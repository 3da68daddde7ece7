//! The synthetic builtins module and the `typing` module factory.
//!
//! Builtin classes are bound in the builtins global scope; their methods
//! live in one class scope per builtin, as stub functions whose declared
//! return types drive the call fast path.

use crate::db::{HasJar, SemanticDb, SemanticJar};
use crate::module::ModuleId;
use crate::semantic::scope::{ScopeId, ScopeKind, ScopeStore, VariableSource};
use crate::semantic::types::{
    BuiltinType, Overload, OverloadBody, OverloadFlags, ParameterKind, ParameterSpec,
    SpecialForm, Type, Value,
};
use crate::Name;

/// The builtin classes bound by name in the builtins global scope.
/// `long` and `unicode` only exist on 2.x; `bytes` only on 3.x.
fn builtin_classes(py2: bool) -> Vec<BuiltinType> {
    let mut classes = vec![
        BuiltinType::Object,
        BuiltinType::Type,
        BuiltinType::Int,
        BuiltinType::Float,
        BuiltinType::Complex,
        BuiltinType::Bool,
        BuiltinType::Str,
        BuiltinType::List,
        BuiltinType::Tuple,
        BuiltinType::Dict,
        BuiltinType::Set,
        BuiltinType::FrozenSet,
        BuiltinType::Slice,
        BuiltinType::Property,
        BuiltinType::StaticMethod,
        BuiltinType::ClassMethod,
    ];
    if py2 {
        classes.push(BuiltinType::Long);
        classes.push(BuiltinType::Unicode);
    } else {
        classes.push(BuiltinType::Bytes);
    }
    classes
}

fn string_methods() -> &'static [(&'static str, BuiltinType)] {
    &[
        ("upper", BuiltinType::Str),
        ("lower", BuiltinType::Str),
        ("strip", BuiltinType::Str),
        ("replace", BuiltinType::Str),
        ("format", BuiltinType::Str),
        ("join", BuiltinType::Str),
        ("split", BuiltinType::List),
        ("startswith", BuiltinType::Bool),
        ("endswith", BuiltinType::Bool),
        ("find", BuiltinType::Int),
        ("encode", BuiltinType::Bytes),
        ("decode", BuiltinType::Str),
    ]
}

fn methods_for(builtin: BuiltinType) -> &'static [(&'static str, BuiltinType)] {
    match builtin {
        BuiltinType::Str | BuiltinType::Unicode | BuiltinType::Bytes => string_methods(),
        BuiltinType::List => &[
            ("append", BuiltinType::None),
            ("extend", BuiltinType::None),
            ("insert", BuiltinType::None),
            ("sort", BuiltinType::None),
            ("reverse", BuiltinType::None),
            ("index", BuiltinType::Int),
            ("count", BuiltinType::Int),
            ("copy", BuiltinType::List),
        ],
        BuiltinType::Dict => &[
            ("keys", BuiltinType::List),
            ("values", BuiltinType::List),
            ("items", BuiltinType::List),
            ("update", BuiltinType::None),
            ("copy", BuiltinType::Dict),
        ],
        BuiltinType::Set | BuiltinType::FrozenSet => &[
            ("add", BuiltinType::None),
            ("discard", BuiltinType::None),
            ("union", BuiltinType::Set),
            ("intersection", BuiltinType::Set),
        ],
        BuiltinType::Tuple => &[("index", BuiltinType::Int), ("count", BuiltinType::Int)],
        BuiltinType::Int | BuiltinType::Long => {
            &[("bit_length", BuiltinType::Int), ("conjugate", BuiltinType::Int)]
        }
        BuiltinType::Float => &[("is_integer", BuiltinType::Bool), ("hex", BuiltinType::Str)],
        BuiltinType::Complex => &[("conjugate", BuiltinType::Complex)],
        BuiltinType::Object => &[("__str__", BuiltinType::Str), ("__repr__", BuiltinType::Str)],
        _ => &[],
    }
}

/// The free functions bound in the builtins global scope, with their
/// declared return types.
fn builtin_functions() -> &'static [(&'static str, BuiltinType)] {
    &[
        ("len", BuiltinType::Int),
        ("repr", BuiltinType::Str),
        ("isinstance", BuiltinType::Bool),
        ("issubclass", BuiltinType::Bool),
        ("callable", BuiltinType::Bool),
        ("hash", BuiltinType::Int),
        ("id", BuiltinType::Int),
        ("print", BuiltinType::None),
        ("sorted", BuiltinType::List),
        ("iter", BuiltinType::Iterator),
    ]
}

/// A stub overload that absorbs any call shape and yields its declared
/// return type through the fast path.
fn stub_overload(returns: Type) -> Overload {
    Overload {
        parameters: vec![
            ParameterSpec {
                name: Name::new("args"),
                kind: ParameterKind::VarArgs,
                annotated: Type::Unknown,
                has_annotation: false,
                default: None,
            },
            ParameterSpec {
                name: Name::new("kwargs"),
                kind: ParameterKind::KwArgs,
                annotated: Type::Unknown,
                has_annotation: false,
                default: None,
            },
        ],
        declared_return: returns,
        body: OverloadBody::Synthetic,
        scope: ScopeId::ROOT,
        flags: OverloadFlags::STUB | OverloadFlags::STATIC,
        walked: true,
    }
}

pub(crate) fn populate_builtins(db: &dyn SemanticDb, module: ModuleId) {
    let jar: &SemanticJar = db.jar();
    let py2 = db.settings().target_version.is_py2();

    let mut scopes = ScopeStore::new(module, "builtins");

    for builtin in builtin_classes(py2) {
        // One class scope per builtin holds its methods.
        let class_scope = scopes.add_scope(ScopeId::ROOT, builtin.name(), ScopeKind::Class);
        for (method, returns) in methods_for(builtin) {
            let function = jar.type_store.add_function(
                module,
                method,
                None,
                stub_overload(Type::Builtin(*returns)),
            );
            scopes.declare(
                class_scope,
                &Name::new(method),
                Value::Type(Type::Function(function)),
                VariableSource::Builtin,
                None,
                false,
            );
        }

        scopes.declare(
            ScopeId::ROOT,
            &Name::new(builtin.name()),
            Value::Type(Type::Builtin(builtin)),
            VariableSource::Builtin,
            None,
            false,
        );
    }

    for (name, returns) in builtin_functions() {
        let function =
            jar.type_store
                .add_function(module, name, None, stub_overload(Type::Builtin(*returns)));
        scopes.declare(
            ScopeId::ROOT,
            &Name::new(name),
            Value::Type(Type::Function(function)),
            VariableSource::Builtin,
            None,
            false,
        );
    }

    scopes.declare(
        ScopeId::ROOT,
        &Name::new("None"),
        Value::instance(Type::Builtin(BuiltinType::None)),
        VariableSource::Builtin,
        None,
        false,
    );
    scopes.declare(
        ScopeId::ROOT,
        &Name::new("Ellipsis"),
        Value::instance(Type::Builtin(BuiltinType::Ellipsis)),
        VariableSource::Builtin,
        None,
        false,
    );

    jar.scopes.insert(module, scopes);
}

/// Resolves a member on a builtin type by consulting the class scope of
/// that builtin inside the builtins module. The per-version string
/// aliases resolve to the scope that actually exists: `unicode` to `str`
/// on 3.x, `bytes` to `str` on 2.x.
pub(crate) fn builtin_member(
    db: &dyn SemanticDb,
    builtins_module: ModuleId,
    builtin: BuiltinType,
    name: &str,
) -> Option<Value> {
    let jar: &SemanticJar = db.jar();
    let py2 = db.settings().target_version.is_py2();
    let scope_name = match builtin {
        BuiltinType::Unicode if !py2 => BuiltinType::Str.name(),
        BuiltinType::Bytes if py2 => BuiltinType::Str.name(),
        other => other.name(),
    };
    jar.scopes.with(builtins_module, |scopes| {
        let root = scopes.scope(ScopeId::ROOT);
        let class_scope = root
            .children()
            .iter()
            .copied()
            .find(|child| scopes.scope(*child).name() == scope_name)?;
        scopes
            .scope(class_scope)
            .variable(name)
            .map(|variable| variable.value().clone())
    })?
}

/// Factory for the `typing` module; registered as a specialized module so
/// its import bypasses the loader.
pub(crate) fn populate_typing(db: &dyn SemanticDb, module: ModuleId) {
    let jar: &SemanticJar = db.jar();

    let special_forms = [
        SpecialForm::Any,
        SpecialForm::Union,
        SpecialForm::Optional,
        SpecialForm::Generic,
        SpecialForm::TypeVar,
        SpecialForm::Overload,
    ];
    let containers = [
        ("List", BuiltinType::List),
        ("Tuple", BuiltinType::Tuple),
        ("Dict", BuiltinType::Dict),
        ("Set", BuiltinType::Set),
        ("FrozenSet", BuiltinType::FrozenSet),
        ("Iterator", BuiltinType::Iterator),
        ("Text", BuiltinType::Str),
    ];

    jar.scopes.with_mut(module, |scopes| {
        for form in special_forms {
            scopes.declare(
                ScopeId::ROOT,
                &Name::new(form.name()),
                Value::Type(Type::SpecialForm(form)),
                VariableSource::Declaration,
                None,
                false,
            );
        }
        for (name, builtin) in containers {
            scopes.declare(
                ScopeId::ROOT,
                &Name::new(name),
                Value::Type(Type::Builtin(builtin)),
                VariableSource::Declaration,
                None,
                false,
            );
        }
    });
}
