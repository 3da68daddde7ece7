//! Host-facing driver: reacts to file changes by cancelling the running
//! analysis, debouncing the change burst, applying the invalidations and
//! scheduling a fresh check.

use std::collections::hash_map::Entry;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::cancellation::CancellationTokenSource;
use crate::files::FileId;
use crate::lint::Diagnostic;
use crate::program::check::{CheckError, RayonCheckScheduler};
use crate::program::{FileChange, FileChangeKind, Program};

/// Changes arriving within this window collapse into one re-analysis.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

pub struct MainLoop {
    orchestrator_sender: crossbeam_channel::Sender<OrchestratorMessage>,
    main_loop_receiver: crossbeam_channel::Receiver<MainLoopMessage>,
}

impl MainLoop {
    pub fn new() -> (Self, MainLoopCancellationToken) {
        let (orchestrator_sender, orchestrator_receiver) = crossbeam_channel::bounded(1);
        let (main_loop_sender, main_loop_receiver) = crossbeam_channel::bounded(1);

        let mut orchestrator = Orchestrator {
            pending_analysis: None,
            receiver: orchestrator_receiver,
            sender: main_loop_sender.clone(),
            aggregated_changes: AggregatedChanges::default(),
        };

        std::thread::spawn(move || {
            orchestrator.run();
        });

        (
            Self {
                orchestrator_sender,
                main_loop_receiver,
            },
            MainLoopCancellationToken {
                sender: main_loop_sender,
            },
        )
    }

    pub fn file_changes_notifier(&self) -> FileChangesNotifier {
        FileChangesNotifier {
            sender: self.orchestrator_sender.clone(),
        }
    }

    /// Runs until the cancellation token fires. `on_completion` receives
    /// the diagnostics of every finished check.
    pub fn run(
        self,
        program: &mut Program,
        mut on_completion: impl FnMut(Vec<Diagnostic>),
    ) {
        self.orchestrator_sender
            .send(OrchestratorMessage::Run)
            .unwrap();

        for message in &self.main_loop_receiver {
            tracing::trace!("main loop: tick");

            match message {
                MainLoopMessage::CheckProgram => {
                    let program = &*program;
                    let run_cancellation_token_source = CancellationTokenSource::new();
                    let run_cancellation_token = run_cancellation_token_source.token();
                    let sender = &self.orchestrator_sender;

                    sender
                        .send(OrchestratorMessage::CheckProgramStarted {
                            cancellation_token: run_cancellation_token_source,
                        })
                        .unwrap();

                    rayon::in_place_scope(|scope| {
                        let scheduler = RayonCheckScheduler::new(program, scope);

                        let result = program.check(&scheduler, run_cancellation_token, None);
                        match result {
                            Ok(result) => sender
                                .send(OrchestratorMessage::CheckProgramCompleted(result))
                                .unwrap(),
                            Err(CheckError::Cancelled) => sender
                                .send(OrchestratorMessage::CheckProgramCancelled)
                                .unwrap(),
                        }
                    });
                }
                MainLoopMessage::ApplyChanges(changes) => {
                    program.apply_changes(changes.iter());
                }
                MainLoopMessage::CheckCompleted(diagnostics) => {
                    on_completion(diagnostics);
                }
                MainLoopMessage::Exit => {
                    return;
                }
            }
        }
    }
}

impl Drop for MainLoop {
    fn drop(&mut self) {
        self.orchestrator_sender
            .send(OrchestratorMessage::Shutdown)
            .ok();
    }
}

#[derive(Debug, Clone)]
pub struct FileChangesNotifier {
    sender: crossbeam_channel::Sender<OrchestratorMessage>,
}

impl FileChangesNotifier {
    pub fn notify(&self, changes: Vec<FileChange>) {
        self.sender
            .send(OrchestratorMessage::FileChanges(changes))
            .unwrap();
    }
}

#[derive(Debug)]
pub struct MainLoopCancellationToken {
    sender: crossbeam_channel::Sender<MainLoopMessage>,
}

impl MainLoopCancellationToken {
    pub fn stop(self) {
        self.sender.send(MainLoopMessage::Exit).unwrap();
    }
}

struct Orchestrator {
    aggregated_changes: AggregatedChanges,
    pending_analysis: Option<PendingAnalysisState>,

    /// Sends messages to the main loop.
    sender: crossbeam_channel::Sender<MainLoopMessage>,
    /// Receives messages from the main loop.
    receiver: crossbeam_channel::Receiver<OrchestratorMessage>,
}

impl Orchestrator {
    fn run(&mut self) {
        while let Ok(message) = self.receiver.recv() {
            match message {
                OrchestratorMessage::Run => {
                    self.pending_analysis = None;
                    self.sender.send(MainLoopMessage::CheckProgram).unwrap();
                }

                OrchestratorMessage::CheckProgramStarted { cancellation_token } => {
                    debug_assert!(self.pending_analysis.is_none());

                    self.pending_analysis = Some(PendingAnalysisState { cancellation_token });
                }

                OrchestratorMessage::CheckProgramCompleted(diagnostics) => {
                    self.pending_analysis
                        .take()
                        .expect("an analysis should be pending");

                    self.sender
                        .send(MainLoopMessage::CheckCompleted(diagnostics))
                        .unwrap();
                }

                OrchestratorMessage::CheckProgramCancelled => {
                    self.pending_analysis
                        .take()
                        .expect("an analysis should be pending");

                    self.debounce_changes();
                }

                OrchestratorMessage::FileChanges(changes) => {
                    // Request cancellation, but wait until the analysis
                    // tasks have completed to avoid stale messages in the
                    // next main loop turn.
                    let pending = if let Some(pending_state) = self.pending_analysis.as_ref() {
                        pending_state.cancellation_token.cancel();
                        true
                    } else {
                        false
                    };

                    self.aggregated_changes.extend(changes);

                    if !pending {
                        self.debounce_changes();
                    }
                }
                OrchestratorMessage::Shutdown => {
                    return self.shutdown();
                }
            }
        }
    }

    fn debounce_changes(&mut self) {
        debug_assert!(self.pending_analysis.is_none());

        loop {
            // Consume incoming change messages, but don't wait for more
            // than the debounce window.
            crossbeam_channel::select! {
                recv(self.receiver) -> message => {
                    match message {
                        Ok(OrchestratorMessage::Shutdown) => {
                            return self.shutdown();
                        }
                        Ok(OrchestratorMessage::FileChanges(file_changes)) => {
                            self.aggregated_changes.extend(file_changes);
                        }

                        Ok(OrchestratorMessage::CheckProgramStarted {..}
                            | OrchestratorMessage::CheckProgramCompleted(_)
                            | OrchestratorMessage::CheckProgramCancelled) => {
                            unreachable!("the check should be complete at this point");
                        }
                        Ok(OrchestratorMessage::Run) => {
                            unreachable!("the orchestrator is already running");
                        }

                        Err(_) => {
                            // No more senders; no point in waiting.
                            return;
                        }
                    }
                },
                default(DEBOUNCE_WINDOW) => {
                    // The burst is over; apply the changes and schedule a
                    // new analysis.
                    self.sender.send(MainLoopMessage::ApplyChanges(std::mem::take(&mut self.aggregated_changes))).unwrap();
                    self.sender.send(MainLoopMessage::CheckProgram).unwrap();
                    return;
                }
            }
        }
    }

    #[allow(clippy::unused_self)]
    fn shutdown(&self) {
        tracing::trace!("shutting down the orchestrator");
    }
}

#[derive(Debug)]
struct PendingAnalysisState {
    cancellation_token: CancellationTokenSource,
}

/// Message sent from the orchestrator to the main loop.
#[derive(Debug)]
enum MainLoopMessage {
    CheckProgram,
    CheckCompleted(Vec<Diagnostic>),
    ApplyChanges(AggregatedChanges),
    Exit,
}

#[derive(Debug)]
enum OrchestratorMessage {
    Run,
    Shutdown,

    CheckProgramStarted {
        cancellation_token: CancellationTokenSource,
    },
    CheckProgramCompleted(Vec<Diagnostic>),
    CheckProgramCancelled,

    FileChanges(Vec<FileChange>),
}

#[derive(Default, Debug)]
pub(crate) struct AggregatedChanges {
    changes: FxHashMap<FileId, FileChangeKind>,
}

impl AggregatedChanges {
    fn add(&mut self, change: FileChange) {
        match self.changes.entry(change.file_id()) {
            Entry::Occupied(mut entry) => {
                let merged = entry.get_mut();

                match (merged, change.kind()) {
                    (FileChangeKind::Created, FileChangeKind::Deleted) => {
                        // Deletion after a creation means the analyzer
                        // never saw the file.
                        entry.remove();
                    }
                    (FileChangeKind::Created, FileChangeKind::Modified) => {
                        // Modifying a file the analyzer has not seen yet is
                        // still a creation.
                    }

                    (FileChangeKind::Modified, FileChangeKind::Created) => {
                        // Unexpected, but continue considering it a
                        // modification.
                    }

                    (FileChangeKind::Modified, FileChangeKind::Deleted) => {
                        *entry.get_mut() = FileChangeKind::Deleted;
                    }

                    (FileChangeKind::Deleted, FileChangeKind::Created) => {
                        *entry.get_mut() = FileChangeKind::Modified;
                    }

                    (FileChangeKind::Deleted, FileChangeKind::Modified) => {
                        *entry.get_mut() = FileChangeKind::Modified;
                    }

                    (FileChangeKind::Created, FileChangeKind::Created)
                    | (FileChangeKind::Modified, FileChangeKind::Modified)
                    | (FileChangeKind::Deleted, FileChangeKind::Deleted) => {}
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(change.kind());
            }
        }
    }

    fn extend<I>(&mut self, changes: I)
    where
        I: IntoIterator<Item = FileChange>,
        I::IntoIter: ExactSizeIterator,
    {
        let iter = changes.into_iter();
        self.changes.reserve(iter.len());

        for change in iter {
            self.add(change);
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = FileChange> + '_ {
        self.changes
            .iter()
            .map(|(id, kind)| FileChange::new(*id, *kind))
    }
}

#[cfg(test)]
mod tests {
    use crate::files::Files;
    use crate::program::{FileChange, FileChangeKind};

    use super::AggregatedChanges;

    #[test]
    fn create_then_delete_cancels_out() {
        let files = Files::default();
        let file = files.intern(std::path::Path::new("/src/a.py"));

        let mut changes = AggregatedChanges::default();
        changes.extend(vec![
            FileChange::new(file, FileChangeKind::Created),
            FileChange::new(file, FileChangeKind::Deleted),
        ]);

        assert_eq!(changes.iter().count(), 0);
    }

    #[test]
    fn delete_then_create_is_a_modification() {
        let files = Files::default();
        let file = files.intern(std::path::Path::new("/src/a.py"));

        let mut changes = AggregatedChanges::default();
        changes.extend(vec![
            FileChange::new(file, FileChangeKind::Deleted),
            FileChange::new(file, FileChangeKind::Created),
        ]);

        let collected: Vec<_> = changes.iter().collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].kind(), FileChangeKind::Modified);
    }

    #[test]
    fn changes_to_distinct_files_accumulate() {
        let files = Files::default();
        let a = files.intern(std::path::Path::new("/src/a.py"));
        let b = files.intern(std::path::Path::new("/src/b.py"));

        let mut changes = AggregatedChanges::default();
        changes.extend(vec![
            FileChange::new(a, FileChangeKind::Modified),
            FileChange::new(b, FileChangeKind::Modified),
        ]);

        assert_eq!(changes.iter().count(), 2);
    }
}
