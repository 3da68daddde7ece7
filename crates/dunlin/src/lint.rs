use std::ops::Deref;
use std::sync::Arc;

use dunlin_python_ast::Span;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Information,
    Warning,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiagnosticSource {
    Parser,
    Analysis,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub span: Span,
    pub code: &'static str,
    pub severity: Severity,
    pub source: DiagnosticSource,
}

impl Diagnostic {
    pub fn parse_error(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            code: "parse-error",
            severity: Severity::Error,
            source: DiagnosticSource::Parser,
        }
    }

    pub fn analysis(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            code,
            severity: Severity::Warning,
            source: DiagnosticSource::Analysis,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Diagnostics {
    #[default]
    Empty,
    List(Arc<[Diagnostic]>),
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        match self {
            Diagnostics::Empty => true,
            Diagnostics::List(list) => list.is_empty(),
        }
    }
}

impl Deref for Diagnostics {
    type Target = [Diagnostic];

    fn deref(&self) -> &Self::Target {
        match self {
            Diagnostics::Empty => &[],
            Diagnostics::List(list) => list,
        }
    }
}

impl From<Vec<Diagnostic>> for Diagnostics {
    fn from(diagnostics: Vec<Diagnostic>) -> Self {
        if diagnostics.is_empty() {
            Diagnostics::Empty
        } else {
            Diagnostics::List(Arc::from(diagnostics))
        }
    }
}

#[cfg(test)]
mod tests {
    use dunlin_python_ast::Span;

    use super::{Diagnostic, Diagnostics};

    #[test]
    fn empty_from_empty_vec() {
        let diagnostics = Diagnostics::from(Vec::new());
        assert!(diagnostics.is_empty());
        assert_eq!(diagnostics.len(), 0);
    }

    #[test]
    fn list_preserves_order() {
        let diagnostics = Diagnostics::from(vec![
            Diagnostic::parse_error("unexpected indent", Span::new(0, 4)),
            Diagnostic::analysis("unresolved-import", "Unresolved import 'foo'", Span::new(5, 8)),
        ]);

        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].code, "parse-error");
        assert_eq!(diagnostics[1].code, "unresolved-import");
    }
}
