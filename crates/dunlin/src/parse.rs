use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use dunlin_python_ast as ast;
use dunlin_python_ast::Span;

use crate::cache::KeyValueCache;
use crate::db::{HasJar, QueryResult, SourceDb, SourceJar};
use crate::files::FileId;

/// The parser is an external collaborator: hosts provide an implementation
/// that turns source text into the tree shapes in [`dunlin_python_ast`].
/// Parse failures are reported as diagnostics on a best-effort tree, never
/// as hard errors.
pub trait Parser: Send + Sync {
    fn parse(&self, text: &str) -> (ast::ModModule, Vec<ParseDiagnostic>);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseDiagnostic {
    pub message: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    inner: Arc<ParsedInner>,
}

#[derive(Debug, PartialEq)]
struct ParsedInner {
    ast: ast::ModModule,
    errors: Vec<ParseDiagnostic>,
}

impl Parsed {
    pub fn new(ast: ast::ModModule, errors: Vec<ParseDiagnostic>) -> Self {
        Self {
            inner: Arc::new(ParsedInner { ast, errors }),
        }
    }

    pub fn ast(&self) -> &ast::ModModule {
        &self.inner.ast
    }

    pub fn errors(&self) -> &[ParseDiagnostic] {
        &self.inner.errors
    }
}

#[tracing::instrument(level = "debug", skip(db))]
pub(crate) fn parse<Db>(db: &Db, file_id: FileId) -> QueryResult<Parsed>
where
    Db: SourceDb + HasJar<SourceJar> + ?Sized,
{
    db.cancelled()?;

    db.jar().parsed.get(&file_id, |file_id| {
        let source = db.source(*file_id)?;
        let (ast, errors) = db.parser().parse(source.text());

        Ok(Parsed::new(ast, errors))
    })
}

#[derive(Debug, Default)]
pub struct ParsedStorage(KeyValueCache<FileId, Parsed>);

impl Deref for ParsedStorage {
    type Target = KeyValueCache<FileId, Parsed>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ParsedStorage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
