use std::fmt::{Debug, Formatter};
use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use hashbrown::hash_map::RawEntryMut;
use parking_lot::RwLock;
use rustc_hash::FxHasher;

type Map<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FxHasher>>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Interner from absolute paths to [`FileId`]s, shared by cloning.
///
/// Interning through `&self` lets the registry assign ids while analysis is
/// in flight on other threads.
#[derive(Default, Clone)]
pub struct Files {
    inner: Arc<RwLock<FilesInner>>,
}

#[derive(Default)]
struct FilesInner {
    by_path: Map<FileId, ()>,
    by_id: Vec<Arc<Path>>,
}

impl Files {
    /// Inserts the path and returns a new id for it or returns the id of an
    /// existing path.
    pub fn intern(&self, path: &Path) -> FileId {
        let hash = hash_path(path);
        let mut inner = self.inner.write();
        let FilesInner { by_path, by_id } = &mut *inner;

        let entry = by_path
            .raw_entry_mut()
            .from_hash(hash, |existing| &*by_id[existing.0 as usize] == path);

        match entry {
            RawEntryMut::Occupied(entry) => *entry.key(),
            RawEntryMut::Vacant(entry) => {
                let id = FileId(u32::try_from(by_id.len()).expect("file count exceeds u32"));
                by_id.push(Arc::from(path));

                entry.insert_with_hasher(hash, id, (), |file| {
                    hash_path(&by_id[file.0 as usize])
                });

                id
            }
        }
    }

    /// Returns the id of an already interned path.
    pub fn try_get(&self, path: &Path) -> Option<FileId> {
        let hash = hash_path(path);
        let inner = self.inner.read();
        inner
            .by_path
            .raw_entry()
            .from_hash(hash, |existing| &*inner.by_id[existing.0 as usize] == path)
            .map(|(id, ())| *id)
    }

    /// Returns the path for the file with the given id.
    pub fn path(&self, id: FileId) -> Arc<Path> {
        self.inner.read().by_id[id.0 as usize].clone()
    }
}

fn hash_path(path: &Path) -> u64 {
    let mut hasher = FxHasher::default();
    path.hash(&mut hasher);
    hasher.finish()
}

impl Debug for Files {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        let mut debug = f.debug_map();
        for (index, path) in inner.by_id.iter().enumerate() {
            debug.entry(&index, path);
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::Files;

    #[test]
    fn intern_is_stable() {
        let files = Files::default();
        let foo = files.intern(Path::new("/src/foo.py"));
        let bar = files.intern(Path::new("/src/bar.py"));

        assert_ne!(foo, bar);
        assert_eq!(foo, files.intern(Path::new("/src/foo.py")));
        assert_eq!(&*files.path(foo), Path::new("/src/foo.py"));
    }

    #[test]
    fn try_get_misses_unknown_paths() {
        let files = Files::default();
        files.intern(Path::new("/src/foo.py"));

        assert!(files.try_get(Path::new("/src/bar.py")).is_none());
        assert!(files.try_get(Path::new("/src/foo.py")).is_some());
    }

    #[test]
    fn clones_share_state() {
        let files = Files::default();
        let clone = files.clone();

        let id = files.intern(Path::new("/src/foo.py"));
        assert_eq!(clone.try_get(Path::new("/src/foo.py")), Some(id));
    }
}
