use std::sync::Arc;

use smol_str::SmolStr;

use crate::{Span, Spanned};

/// An identifier together with the place it was spelled.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub id: SmolStr,
    pub span: Span,
}

impl Identifier {
    pub fn new(id: &str, span: Span) -> Self {
        Self {
            id: SmolStr::new(id),
            span,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl Spanned for Identifier {
    fn span(&self) -> Span {
        self.span
    }
}

/// A literal payload as spelled in source.
///
/// `Str` covers both `str` and `unicode` spellings; which builtin type a
/// string literal denotes is a per-language-version decision made by the
/// analyzer, not the tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { real: f64, imag: f64 },
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Pos,
    Neg,
    Invert,
}

impl UnaryOp {
    /// The method a unary operator dispatches to, if it dispatches at all
    /// (`not` never does; it always yields a bool).
    pub fn dunder(self) -> Option<&'static str> {
        match self {
            UnaryOp::Not => None,
            UnaryOp::Pos => Some("__pos__"),
            UnaryOp::Neg => Some("__neg__"),
            UnaryOp::Invert => Some("__invert__"),
        }
    }
}

/// Binary operators, arithmetic and comparison alike.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtE
                | BinaryOp::Gt
                | BinaryOp::GtE
                | BinaryOp::Is
                | BinaryOp::IsNot
                | BinaryOp::In
                | BinaryOp::NotIn
        )
    }

    /// The `(forward, reflected)` method pair an operator dispatches to.
    ///
    /// Identity and membership tests have no methods; they are handled
    /// structurally by the analyzer.
    pub fn dunders(self) -> Option<(&'static str, &'static str)> {
        Some(match self {
            BinaryOp::Add => ("__add__", "__radd__"),
            BinaryOp::Sub => ("__sub__", "__rsub__"),
            BinaryOp::Mult => ("__mul__", "__rmul__"),
            BinaryOp::MatMult => ("__matmul__", "__rmatmul__"),
            BinaryOp::Div => ("__truediv__", "__rtruediv__"),
            BinaryOp::FloorDiv => ("__floordiv__", "__rfloordiv__"),
            BinaryOp::Mod => ("__mod__", "__rmod__"),
            BinaryOp::Pow => ("__pow__", "__rpow__"),
            BinaryOp::LShift => ("__lshift__", "__rlshift__"),
            BinaryOp::RShift => ("__rshift__", "__rrshift__"),
            BinaryOp::BitOr => ("__or__", "__ror__"),
            BinaryOp::BitXor => ("__xor__", "__rxor__"),
            BinaryOp::BitAnd => ("__and__", "__rand__"),
            BinaryOp::Eq => ("__eq__", "__eq__"),
            BinaryOp::NotEq => ("__ne__", "__ne__"),
            BinaryOp::Lt => ("__lt__", "__gt__"),
            BinaryOp::LtE => ("__le__", "__ge__"),
            BinaryOp::Gt => ("__gt__", "__lt__"),
            BinaryOp::GtE => ("__ge__", "__le__"),
            BinaryOp::Is | BinaryOp::IsNot | BinaryOp::In | BinaryOp::NotIn => return None,
        })
    }

    /// The mirrored comparison: `a < b` becomes `b > a`.
    pub fn swapped(self) -> Option<BinaryOp> {
        Some(match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::LtE => BinaryOp::GtE,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::GtE => BinaryOp::LtE,
            BinaryOp::Eq => BinaryOp::Eq,
            BinaryOp::NotEq => BinaryOp::NotEq,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Constant(ConstantExpr),
    Name(NameExpr),
    Member(MemberExpr),
    Call(CallExpr),
    Index(IndexExpr),
    Unary(UnaryExpr),
    Binary(BinaryExpr),
    And(AndExpr),
    Or(OrExpr),
    Conditional(ConditionalExpr),
    List(ListExpr),
    Tuple(TupleExpr),
    Dict(DictExpr),
    Set(SetExpr),
    Generator(GeneratorExpr),
    Lambda(Arc<LambdaExpr>),
    FString(FStringExpr),
    Named(NamedExpr),
    Slice(SliceExpr),
    Starred(StarredExpr),
    Yield(YieldExpr),
    Error(ErrorExpr),
}

impl Spanned for Expr {
    fn span(&self) -> Span {
        match self {
            Expr::Constant(e) => e.span,
            Expr::Name(e) => e.span,
            Expr::Member(e) => e.span,
            Expr::Call(e) => e.span,
            Expr::Index(e) => e.span,
            Expr::Unary(e) => e.span,
            Expr::Binary(e) => e.span,
            Expr::And(e) => e.span,
            Expr::Or(e) => e.span,
            Expr::Conditional(e) => e.span,
            Expr::List(e) => e.span,
            Expr::Tuple(e) => e.span,
            Expr::Dict(e) => e.span,
            Expr::Set(e) => e.span,
            Expr::Generator(e) => e.span,
            Expr::Lambda(e) => e.span,
            Expr::FString(e) => e.span,
            Expr::Named(e) => e.span,
            Expr::Slice(e) => e.span,
            Expr::Starred(e) => e.span,
            Expr::Yield(e) => e.span,
            Expr::Error(e) => e.span,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstantExpr {
    pub span: Span,
    pub value: Constant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NameExpr {
    pub span: Span,
    pub id: SmolStr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemberExpr {
    pub span: Span,
    pub target: Box<Expr>,
    pub member: Identifier,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallExpr {
    pub span: Span,
    pub target: Box<Expr>,
    pub arguments: Arguments,
}

/// Call-site arguments. Splats appear as [`Expr::Starred`] positionals and
/// keywords without a name (`**kwargs`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Arguments {
    pub args: Vec<Expr>,
    pub keywords: Vec<Keyword>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Keyword {
    pub span: Span,
    /// `None` for a `**mapping` splat.
    pub name: Option<Identifier>,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexExpr {
    pub span: Span,
    pub target: Box<Expr>,
    pub index: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnaryExpr {
    pub span: Span,
    pub op: UnaryOp,
    pub operand: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinaryExpr {
    pub span: Span,
    pub left: Box<Expr>,
    pub op: BinaryOp,
    pub right: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AndExpr {
    pub span: Span,
    pub left: Box<Expr>,
    pub right: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrExpr {
    pub span: Span,
    pub left: Box<Expr>,
    pub right: Box<Expr>,
}

/// `body if test else orelse`
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionalExpr {
    pub span: Span,
    pub test: Box<Expr>,
    pub body: Box<Expr>,
    pub orelse: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListExpr {
    pub span: Span,
    pub items: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TupleExpr {
    pub span: Span,
    pub items: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DictExpr {
    pub span: Span,
    pub items: Vec<DictItem>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DictItem {
    /// `None` for a `**mapping` splat inside a display.
    pub key: Option<Expr>,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SetExpr {
    pub span: Span,
    pub items: Vec<Expr>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComprehensionKind {
    Generator,
    List,
    Set,
    Dict,
}

/// A comprehension of any display kind; `value` is the value part of a dict
/// comprehension and absent otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorExpr {
    pub span: Span,
    pub kind: ComprehensionKind,
    pub element: Box<Expr>,
    pub value: Option<Box<Expr>>,
    pub generators: Vec<ComprehensionForClause>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComprehensionForClause {
    pub span: Span,
    pub target: Expr,
    pub iter: Expr,
    pub conditions: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LambdaExpr {
    pub span: Span,
    pub parameters: Parameters,
    pub body: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FStringExpr {
    pub span: Span,
    pub parts: Vec<FStringPart>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FStringPart {
    Literal(String),
    Expression {
        value: Expr,
        format_spec: Option<FormatSpecifier>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FormatSpecifier {
    pub span: Span,
    pub spec: String,
}

/// `target := value`
#[derive(Clone, Debug, PartialEq)]
pub struct NamedExpr {
    pub span: Span,
    pub target: Identifier,
    pub value: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SliceExpr {
    pub span: Span,
    pub lower: Option<Box<Expr>>,
    pub upper: Option<Box<Expr>>,
    pub step: Option<Box<Expr>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StarredExpr {
    pub span: Span,
    pub value: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct YieldExpr {
    pub span: Span,
    pub value: Option<Box<Expr>>,
}

/// A placeholder produced by the parser where it could not build a node.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorExpr {
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Expr(ExprStmt),
    Assignment(AssignmentStmt),
    Return(ReturnStmt),
    ClassDef(Arc<ClassDef>),
    FunctionDef(Arc<FunctionDef>),
    Import(ImportStmt),
    ImportFrom(ImportFromStmt),
    If(IfStmt),
    Global(GlobalStmt),
    Nonlocal(NonlocalStmt),
    Pass(Span),
}

impl Spanned for Stmt {
    fn span(&self) -> Span {
        match self {
            Stmt::Expr(s) => s.span,
            Stmt::Assignment(s) => s.span,
            Stmt::Return(s) => s.span,
            Stmt::ClassDef(s) => s.span,
            Stmt::FunctionDef(s) => s.span,
            Stmt::Import(s) => s.span,
            Stmt::ImportFrom(s) => s.span,
            Stmt::If(s) => s.span,
            Stmt::Global(s) => s.span,
            Stmt::Nonlocal(s) => s.span,
            Stmt::Pass(span) => *span,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprStmt {
    pub span: Span,
    pub value: Expr,
}

/// Plain and annotated assignments. `x: T` with no value has `value: None`;
/// a plain `x = v` has `annotation: None`.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignmentStmt {
    pub span: Span,
    pub targets: Vec<Expr>,
    pub annotation: Option<Expr>,
    pub value: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStmt {
    pub span: Span,
    pub value: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassDef {
    pub span: Span,
    pub name: Identifier,
    pub bases: Vec<Expr>,
    pub decorators: Vec<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub span: Span,
    pub name: Identifier,
    pub parameters: Parameters,
    pub returns: Option<Expr>,
    pub decorators: Vec<Expr>,
    pub body: Vec<Stmt>,
}

impl FunctionDef {
    /// A stub body is `...` or `pass` and nothing else.
    pub fn is_stub_body(&self) -> bool {
        match self.body.as_slice() {
            [Stmt::Pass(_)] => true,
            [Stmt::Expr(ExprStmt { value, .. })] => matches!(
                value,
                Expr::Constant(ConstantExpr {
                    value: Constant::Ellipsis,
                    ..
                })
            ),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Parameters {
    pub posonly: Vec<Parameter>,
    pub args: Vec<Parameter>,
    pub vararg: Option<Parameter>,
    pub kwonly: Vec<Parameter>,
    pub kwarg: Option<Parameter>,
}

impl Parameters {
    pub fn is_empty(&self) -> bool {
        self.posonly.is_empty()
            && self.args.is_empty()
            && self.vararg.is_none()
            && self.kwonly.is_empty()
            && self.kwarg.is_none()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub span: Span,
    pub name: Identifier,
    pub annotation: Option<Expr>,
    pub default: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportStmt {
    pub span: Span,
    pub names: Vec<ImportAlias>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportFromStmt {
    pub span: Span,
    /// Number of leading dots of a relative import.
    pub level: u32,
    pub module: Option<Identifier>,
    pub names: Vec<ImportAlias>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportAlias {
    pub span: Span,
    pub name: Identifier,
    pub asname: Option<Identifier>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfStmt {
    pub span: Span,
    pub test: Expr,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GlobalStmt {
    pub span: Span,
    pub names: Vec<Identifier>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NonlocalStmt {
    pub span: Span,
    pub names: Vec<Identifier>,
}

/// The root of one module's tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModModule {
    pub span: Span,
    pub body: Vec<Stmt>,
}

#[cfg(test)]
mod tests {
    use super::{BinaryOp, UnaryOp};

    #[test]
    fn operator_dunder_table() {
        assert_eq!(BinaryOp::Add.dunders(), Some(("__add__", "__radd__")));
        assert_eq!(BinaryOp::Pow.dunders(), Some(("__pow__", "__rpow__")));
        assert_eq!(BinaryOp::Is.dunders(), None);
        assert_eq!(UnaryOp::Neg.dunder(), Some("__neg__"));
        assert_eq!(UnaryOp::Not.dunder(), None);
    }

    #[test]
    fn comparison_swap() {
        assert_eq!(BinaryOp::Lt.swapped(), Some(BinaryOp::Gt));
        assert_eq!(BinaryOp::GtE.swapped(), Some(BinaryOp::LtE));
        assert_eq!(BinaryOp::Add.swapped(), None);
        assert!(BinaryOp::Is.is_comparison());
        assert!(!BinaryOp::Mod.is_comparison());
    }
}
