use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::files::FileId;
use crate::module::ModuleRegistry;
use crate::parse::{Parsed, ParsedStorage, Parser};
use crate::semantic::scope::ScopeStores;
use crate::semantic::types::TypeStore;
use crate::source::{Source, SourceStorage};
use crate::system::System;
use crate::ProgramSettings;

/// Reason why a query operation failed.
#[derive(Debug, Clone, Copy)]
pub enum QueryError {
    /// The query was cancelled by the host, e.g. on a content update.
    Cancelled,
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Cancelled => f.write_str("query was cancelled"),
        }
    }
}

impl std::error::Error for QueryError {}

pub type QueryResult<T> = Result<T, QueryError>;

/// Gives access to a specific jar in the database.
///
/// Each jar bundles the storages of one layer; the combination of the
/// `*Db` traits and the jars lets queries be written in isolation from how
/// they are composed at the top level.
pub trait HasJar<T> {
    /// Gives a read-only reference to the jar.
    fn jar(&self) -> &T;

    /// Gives a mutable reference to the jar.
    fn jar_mut(&mut self) -> &mut T;
}

pub trait SourceDb: HasJar<SourceJar> + Send + Sync {
    fn file_id(&self, path: &Path) -> FileId;

    fn file_path(&self, file_id: FileId) -> Arc<Path>;

    fn source(&self, file_id: FileId) -> QueryResult<Source>;

    fn parse(&self, file_id: FileId) -> QueryResult<Parsed>;

    fn parser(&self) -> &dyn Parser;

    fn system(&self) -> &dyn System;

    fn cancellation(&self) -> &CancellationToken;

    /// Returns `Ok` if the current analysis has not been cancelled and
    /// `Err(QueryError::Cancelled)` otherwise.
    fn cancelled(&self) -> QueryResult<()> {
        if self.cancellation().is_cancelled() {
            Err(QueryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub trait SemanticDb: SourceDb + HasJar<SemanticJar> {
    fn settings(&self) -> &ProgramSettings;
}

#[derive(Debug, Default)]
pub struct SourceJar {
    pub sources: SourceStorage,
    pub parsed: ParsedStorage,
}

#[derive(Debug, Default)]
pub struct SemanticJar {
    pub registry: ModuleRegistry,
    pub scopes: ScopeStores,
    pub type_store: TypeStore,
}
