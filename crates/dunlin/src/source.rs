use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::cache::KeyValueCache;
use crate::db::{HasJar, QueryResult, SourceDb, SourceJar};
use crate::files::FileId;

pub(crate) fn source_text<Db>(db: &Db, file_id: FileId) -> QueryResult<Source>
where
    Db: SourceDb + HasJar<SourceJar> + ?Sized,
{
    db.cancelled()?;

    db.jar().sources.get(&file_id, |file_id| {
        let path = db.file_path(*file_id);

        let source_text = db.system().read_text(&path).unwrap_or_else(|err| {
            tracing::error!("Failed to read file '{path:?}: {err}'. Falling back to empty text");
            String::new()
        });

        Ok(Source::new(source_text))
    })
}

/// The text buffer of one module, stamped with a monotonically increasing
/// version. A content update produces a new `Source` with a higher version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    text: Arc<str>,
    version: u32,
}

impl Source {
    pub fn new<T: Into<Arc<str>>>(source: T) -> Self {
        Self {
            text: source.into(),
            version: 0,
        }
    }

    pub fn with_version<T: Into<Arc<str>>>(source: T, version: u32) -> Self {
        Self {
            text: source.into(),
            version,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// A successor buffer holding `text`, one version later.
    pub fn update<T: Into<Arc<str>>>(&self, text: T) -> Source {
        Source {
            text: text.into(),
            version: self.version + 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct SourceStorage(KeyValueCache<FileId, Source>);

impl Deref for SourceStorage {
    type Target = KeyValueCache<FileId, Source>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SourceStorage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
