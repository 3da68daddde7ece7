use std::path::Path;

use anyhow::Context;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::files::Files;
use crate::program::{FileChange, FileChangeKind};

pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

pub trait EventHandler: Send + 'static {
    fn handle(&self, changes: Vec<FileChange>);
}

impl<F> EventHandler for F
where
    F: Fn(Vec<FileChange>) + Send + 'static,
{
    fn handle(&self, changes: Vec<FileChange>) {
        let f = self;
        f(changes);
    }
}

impl FileWatcher {
    pub fn new<E>(handler: E, files: Files) -> anyhow::Result<Self>
    where
        E: EventHandler,
    {
        Self::from_handler(Box::new(handler), files)
    }

    fn from_handler(handler: Box<dyn EventHandler>, files: Files) -> anyhow::Result<Self> {
        let watcher = recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event) => {
                    let change_kind = match event.kind {
                        EventKind::Create(CreateKind::File) => FileChangeKind::Created,
                        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                            FileChangeKind::Created
                        }
                        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                            FileChangeKind::Deleted
                        }
                        EventKind::Modify(_) => FileChangeKind::Modified,
                        EventKind::Remove(RemoveKind::File) => FileChangeKind::Deleted,
                        _ => {
                            return;
                        }
                    };

                    let changes: Vec<_> = event
                        .paths
                        .iter()
                        .filter(|path| {
                            matches!(
                                path.extension().and_then(|extension| extension.to_str()),
                                Some("py" | "pyi")
                            )
                        })
                        .map(|path| FileChange::new(files.intern(path), change_kind))
                        .collect();

                    if !changes.is_empty() {
                        handler.handle(changes);
                    }
                }
                Err(err) => {
                    tracing::error!("file watcher error: {err}");
                }
            }
        })
        .context("Failed to create file watcher")?;

        Ok(Self { watcher })
    }

    pub fn watch_folder(&mut self, path: &Path) -> anyhow::Result<()> {
        self.watcher.watch(path, RecursiveMode::Recursive)?;

        Ok(())
    }
}
