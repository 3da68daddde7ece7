//! Terse construction helpers for building trees in tests and synthetic
//! modules. All nodes get an empty span unless one is supplied via
//! [`spanned`].

use std::sync::Arc;

use smol_str::SmolStr;

use crate::{
    AndExpr, Arguments, AssignmentStmt, BinaryExpr, BinaryOp, CallExpr, ClassDef,
    ComprehensionForClause, ComprehensionKind, ConditionalExpr, Constant, ConstantExpr, DictExpr,
    DictItem, Expr, ExprStmt, FunctionDef, GeneratorExpr, GlobalStmt, Identifier, IfStmt,
    ImportAlias, ImportFromStmt, ImportStmt, IndexExpr, Keyword, LambdaExpr, ListExpr, MemberExpr,
    ModModule, NameExpr, NamedExpr, NonlocalStmt, OrExpr, Parameter, Parameters, ReturnStmt,
    SetExpr, SliceExpr, Span, Stmt, StarredExpr, TupleExpr, UnaryExpr, UnaryOp, YieldExpr,
};

pub fn ident(name: &str) -> Identifier {
    Identifier::new(name, Span::default())
}

pub fn module(body: Vec<Stmt>) -> ModModule {
    ModModule {
        span: Span::default(),
        body,
    }
}

pub fn name(id: &str) -> Expr {
    Expr::Name(NameExpr {
        span: Span::default(),
        id: SmolStr::new(id),
    })
}

/// A name expression carrying a real span, for reference-tracking tests.
pub fn spanned(id: &str, start: u32, end: u32) -> Expr {
    Expr::Name(NameExpr {
        span: Span::new(start, end),
        id: SmolStr::new(id),
    })
}

pub fn constant(value: Constant) -> Expr {
    Expr::Constant(ConstantExpr {
        span: Span::default(),
        value,
    })
}

pub fn int(value: i64) -> Expr {
    constant(Constant::Int(value))
}

pub fn float(value: f64) -> Expr {
    constant(Constant::Float(value))
}

pub fn str_(value: &str) -> Expr {
    constant(Constant::Str(value.to_string()))
}

pub fn bytes(value: &[u8]) -> Expr {
    constant(Constant::Bytes(value.to_vec()))
}

pub fn bool_(value: bool) -> Expr {
    constant(Constant::Bool(value))
}

pub fn none() -> Expr {
    constant(Constant::None)
}

pub fn ellipsis() -> Expr {
    constant(Constant::Ellipsis)
}

pub fn member(target: Expr, attr: &str) -> Expr {
    Expr::Member(MemberExpr {
        span: Span::default(),
        target: Box::new(target),
        member: ident(attr),
    })
}

pub fn call(target: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call(CallExpr {
        span: Span::default(),
        target: Box::new(target),
        arguments: Arguments {
            args,
            keywords: Vec::new(),
        },
    })
}

pub fn call_with(target: Expr, args: Vec<Expr>, keywords: Vec<(Option<&str>, Expr)>) -> Expr {
    Expr::Call(CallExpr {
        span: Span::default(),
        target: Box::new(target),
        arguments: Arguments {
            args,
            keywords: keywords
                .into_iter()
                .map(|(kw, value)| Keyword {
                    span: Span::default(),
                    name: kw.map(ident),
                    value,
                })
                .collect(),
        },
    })
}

pub fn index(target: Expr, idx: Expr) -> Expr {
    Expr::Index(IndexExpr {
        span: Span::default(),
        target: Box::new(target),
        index: Box::new(idx),
    })
}

pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
    Expr::Unary(UnaryExpr {
        span: Span::default(),
        op,
        operand: Box::new(operand),
    })
}

pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary(BinaryExpr {
        span: Span::default(),
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

pub fn and(left: Expr, right: Expr) -> Expr {
    Expr::And(AndExpr {
        span: Span::default(),
        left: Box::new(left),
        right: Box::new(right),
    })
}

pub fn or(left: Expr, right: Expr) -> Expr {
    Expr::Or(OrExpr {
        span: Span::default(),
        left: Box::new(left),
        right: Box::new(right),
    })
}

pub fn conditional(test: Expr, body: Expr, orelse: Expr) -> Expr {
    Expr::Conditional(ConditionalExpr {
        span: Span::default(),
        test: Box::new(test),
        body: Box::new(body),
        orelse: Box::new(orelse),
    })
}

pub fn list(items: Vec<Expr>) -> Expr {
    Expr::List(ListExpr {
        span: Span::default(),
        items,
    })
}

pub fn tuple(items: Vec<Expr>) -> Expr {
    Expr::Tuple(TupleExpr {
        span: Span::default(),
        items,
    })
}

pub fn set(items: Vec<Expr>) -> Expr {
    Expr::Set(SetExpr {
        span: Span::default(),
        items,
    })
}

pub fn dict(items: Vec<(Expr, Expr)>) -> Expr {
    Expr::Dict(DictExpr {
        span: Span::default(),
        items: items
            .into_iter()
            .map(|(key, value)| DictItem {
                key: Some(key),
                value,
            })
            .collect(),
    })
}

pub fn comprehension(
    kind: ComprehensionKind,
    element: Expr,
    target: &str,
    iter: Expr,
) -> Expr {
    Expr::Generator(GeneratorExpr {
        span: Span::default(),
        kind,
        element: Box::new(element),
        value: None,
        generators: vec![ComprehensionForClause {
            span: Span::default(),
            target: name(target),
            iter,
            conditions: Vec::new(),
        }],
    })
}

pub fn lambda(parameters: Parameters, body: Expr) -> Expr {
    Expr::Lambda(Arc::new(LambdaExpr {
        span: Span::default(),
        parameters,
        body,
    }))
}

pub fn named(target: &str, value: Expr) -> Expr {
    Expr::Named(NamedExpr {
        span: Span::default(),
        target: ident(target),
        value: Box::new(value),
    })
}

pub fn slice(lower: Option<Expr>, upper: Option<Expr>) -> Expr {
    Expr::Slice(SliceExpr {
        span: Span::default(),
        lower: lower.map(Box::new),
        upper: upper.map(Box::new),
        step: None,
    })
}

pub fn starred(value: Expr) -> Expr {
    Expr::Starred(StarredExpr {
        span: Span::default(),
        value: Box::new(value),
    })
}

pub fn yield_(value: Option<Expr>) -> Expr {
    Expr::Yield(YieldExpr {
        span: Span::default(),
        value: value.map(Box::new),
    })
}

pub fn expr_stmt(value: Expr) -> Stmt {
    Stmt::Expr(ExprStmt {
        span: Span::default(),
        value,
    })
}

pub fn assign(target: &str, value: Expr) -> Stmt {
    assign_to(name(target), value)
}

pub fn assign_to(target: Expr, value: Expr) -> Stmt {
    Stmt::Assignment(AssignmentStmt {
        span: Span::default(),
        targets: vec![target],
        annotation: None,
        value: Some(value),
    })
}

pub fn ann_assign(target: &str, annotation: Expr, value: Option<Expr>) -> Stmt {
    Stmt::Assignment(AssignmentStmt {
        span: Span::default(),
        targets: vec![name(target)],
        annotation: Some(annotation),
        value,
    })
}

pub fn ret(value: Option<Expr>) -> Stmt {
    Stmt::Return(ReturnStmt {
        span: Span::default(),
        value,
    })
}

pub fn pass() -> Stmt {
    Stmt::Pass(Span::default())
}

pub fn if_(test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt>) -> Stmt {
    Stmt::If(IfStmt {
        span: Span::default(),
        test,
        body,
        orelse,
    })
}

pub fn global(names: Vec<&str>) -> Stmt {
    Stmt::Global(GlobalStmt {
        span: Span::default(),
        names: names.into_iter().map(ident).collect(),
    })
}

pub fn nonlocal(names: Vec<&str>) -> Stmt {
    Stmt::Nonlocal(NonlocalStmt {
        span: Span::default(),
        names: names.into_iter().map(ident).collect(),
    })
}

pub fn param(name: &str) -> Parameter {
    Parameter {
        span: Span::default(),
        name: ident(name),
        annotation: None,
        default: None,
    }
}

pub fn param_ann(name: &str, annotation: Expr) -> Parameter {
    Parameter {
        span: Span::default(),
        name: ident(name),
        annotation: Some(annotation),
        default: None,
    }
}

pub fn param_default(name: &str, default: Expr) -> Parameter {
    Parameter {
        span: Span::default(),
        name: ident(name),
        annotation: None,
        default: Some(default),
    }
}

pub fn params(args: Vec<Parameter>) -> Parameters {
    Parameters {
        args,
        ..Parameters::default()
    }
}

pub fn func_def(name: &str, parameters: Parameters, body: Vec<Stmt>) -> Stmt {
    func_def_full(name, parameters, None, Vec::new(), body)
}

pub fn func_def_full(
    name: &str,
    parameters: Parameters,
    returns: Option<Expr>,
    decorators: Vec<Expr>,
    body: Vec<Stmt>,
) -> Stmt {
    Stmt::FunctionDef(Arc::new(FunctionDef {
        span: Span::default(),
        name: ident(name),
        parameters,
        returns,
        decorators,
        body,
    }))
}

pub fn class_def(name: &str, bases: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
    Stmt::ClassDef(Arc::new(ClassDef {
        span: Span::default(),
        name: ident(name),
        bases,
        decorators: Vec::new(),
        body,
    }))
}

pub fn import_(name: &str, asname: Option<&str>) -> Stmt {
    Stmt::Import(ImportStmt {
        span: Span::default(),
        names: vec![ImportAlias {
            span: Span::default(),
            name: ident(name),
            asname: asname.map(ident),
        }],
    })
}

pub fn import_from(module: &str, names: Vec<(&str, Option<&str>)>) -> Stmt {
    Stmt::ImportFrom(ImportFromStmt {
        span: Span::default(),
        level: 0,
        module: Some(ident(module)),
        names: names
            .into_iter()
            .map(|(name, asname)| ImportAlias {
                span: Span::default(),
                name: ident(name),
                asname: asname.map(ident),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::{assign, binary, int, module, name};
    use crate::{BinaryOp, Expr, Stmt};

    #[test]
    fn build_simple_module() {
        let module = module(vec![
            assign("x", int(1)),
            assign("y", binary(name("x"), BinaryOp::Add, int(2))),
        ]);

        assert_eq!(module.body.len(), 2);
        let Stmt::Assignment(second) = &module.body[1] else {
            panic!("should be an assignment");
        };
        assert!(matches!(second.value, Some(Expr::Binary(_))));
    }
}
