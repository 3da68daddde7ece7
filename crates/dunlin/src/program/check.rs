use std::num::NonZeroUsize;

use rayon::max_num_threads;
use rustc_hash::FxHashSet;

use crate::cancellation::CancellationToken;
use crate::db::{HasJar, SemanticJar, SourceDb};
use crate::files::FileId;
use crate::lint::Diagnostic;
use crate::module::path_to_module;
use crate::program::progress::ProgressTicker;
use crate::program::Program;

impl Program {
    /// Analyzes all open files in the workspace. Independent modules are
    /// checked in parallel under the scheduler; each module's own walk is
    /// sequential.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn check(
        &self,
        scheduler: &dyn CheckScheduler,
        cancellation_token: CancellationToken,
        progress: Option<&ProgressTicker>,
    ) -> Result<Vec<Diagnostic>, CheckError> {
        let check_loop = CheckFilesLoop::new(scheduler, cancellation_token, progress);

        check_loop.run(self.workspace().open_files())
    }

    /// Analyzes a single file.
    #[tracing::instrument(level = "debug", skip(self, scheduler, cancellation_token))]
    pub fn check_file(
        &self,
        file: FileId,
        scheduler: &dyn CheckScheduler,
        cancellation_token: CancellationToken,
    ) -> Result<Vec<Diagnostic>, CheckError> {
        let check_loop = CheckFilesLoop::new(scheduler, cancellation_token, None);

        check_loop.run([file].into_iter())
    }

    fn check_file_with_context(
        &self,
        file: FileId,
        context: &CheckContext,
    ) -> Result<Vec<Diagnostic>, CheckError> {
        context.cancelled_ok()?;

        let path = self.file_path(file);
        let module = path_to_module(self, &path).map_err(|_| CheckError::Cancelled)?;

        let Some(module) = module else {
            tracing::debug!("file '{}' does not resolve to a module", path.display());
            return Ok(Vec::new());
        };

        let jar: &SemanticJar = self.jar();
        Ok(jar.registry.reportable_diagnostics(module).to_vec())
    }
}

/// Schedules checks for files.
pub trait CheckScheduler {
    /// Schedules a check for a file.
    ///
    /// The check can either run immediately on the current thread or be
    /// queued in a thread pool. The order in which scheduled checks
    /// execute is not guaranteed. The implementation calls
    /// [`CheckFileTask::run`] to execute the check.
    fn check_file(&self, file_task: CheckFileTask);

    /// The maximum number of checks that can run concurrently.
    ///
    /// `None` if the checks run on the current thread (no concurrency).
    fn max_concurrency(&self) -> Option<NonZeroUsize>;
}

/// Scheduler that runs checks on a rayon thread pool.
pub struct RayonCheckScheduler<'program, 'scope_ref, 'scope> {
    program: &'program Program,
    scope: &'scope_ref rayon::Scope<'scope>,
}

impl<'program, 'scope_ref, 'scope> RayonCheckScheduler<'program, 'scope_ref, 'scope> {
    pub fn new(program: &'program Program, scope: &'scope_ref rayon::Scope<'scope>) -> Self {
        Self { scope, program }
    }
}

impl<'program, 'scope_ref, 'scope> CheckScheduler
    for RayonCheckScheduler<'program, 'scope_ref, 'scope>
where
    'program: 'scope,
{
    fn check_file(&self, check_file_task: CheckFileTask) {
        let child_span =
            tracing::trace_span!("check_file", file_id = check_file_task.file_id.as_u32());
        let program = self.program;

        self.scope
            .spawn(move |_| child_span.in_scope(|| check_file_task.run(program)));
    }

    fn max_concurrency(&self) -> Option<NonZeroUsize> {
        Some(NonZeroUsize::new(max_num_threads()).unwrap_or(NonZeroUsize::MIN))
    }
}

/// Scheduler that runs all checks on the current thread.
pub struct SameThreadCheckScheduler<'a> {
    program: &'a Program,
}

impl<'a> SameThreadCheckScheduler<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self { program }
    }
}

impl CheckScheduler for SameThreadCheckScheduler<'_> {
    fn check_file(&self, task: CheckFileTask) {
        task.run(self.program)
    }

    fn max_concurrency(&self) -> Option<NonZeroUsize> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum CheckError {
    Cancelled,
}

#[derive(Debug)]
pub struct CheckFileTask {
    file_id: FileId,
    context: CheckContext,
}

impl CheckFileTask {
    /// Runs the check and communicates the result to the check loop.
    pub fn run(self, program: &Program) {
        match program.check_file_with_context(self.file_id, &self.context) {
            Ok(diagnostics) => self
                .context
                .sender
                .send(CheckFileMessage::Completed(diagnostics))
                .unwrap(),
            Err(CheckError::Cancelled) => self
                .context
                .sender
                .send(CheckFileMessage::Cancelled)
                .unwrap(),
        }
    }
}

#[derive(Clone, Debug)]
struct CheckContext {
    cancellation_token: CancellationToken,
    sender: crossbeam_channel::Sender<CheckFileMessage>,
}

impl CheckContext {
    fn new(
        cancellation_token: CancellationToken,
        sender: crossbeam_channel::Sender<CheckFileMessage>,
    ) -> Self {
        Self {
            sender,
            cancellation_token,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    fn cancelled_ok(&self) -> Result<(), CheckError> {
        if self.is_cancelled() {
            Err(CheckError::Cancelled)
        } else {
            Ok(())
        }
    }
}

struct CheckFilesLoop<'a> {
    scheduler: &'a dyn CheckScheduler,
    cancellation_token: CancellationToken,
    progress: Option<&'a ProgressTicker>,
    pending: usize,
    queued_files: FxHashSet<FileId>,
}

impl<'a> CheckFilesLoop<'a> {
    fn new(
        scheduler: &'a dyn CheckScheduler,
        cancellation_token: CancellationToken,
        progress: Option<&'a ProgressTicker>,
    ) -> Self {
        Self {
            scheduler,
            cancellation_token,
            progress,

            queued_files: FxHashSet::default(),
            pending: 0,
        }
    }

    fn run(
        mut self,
        files: impl Iterator<Item = FileId>,
    ) -> Result<Vec<Diagnostic>, CheckError> {
        let (sender, receiver) = if let Some(max_concurrency) = self.scheduler.max_concurrency() {
            crossbeam_channel::bounded(max_concurrency.get())
        } else {
            // Checks run on the current thread; an unbounded channel keeps
            // queued messages from deadlocking the loop that never gets a
            // chance to read them.
            crossbeam_channel::unbounded()
        };

        let context = CheckContext::new(self.cancellation_token.clone(), sender.clone());

        for file in files {
            self.queue_file(file, context.clone())?;
        }

        self.run_impl(receiver, context)
    }

    fn run_impl(
        mut self,
        receiver: crossbeam_channel::Receiver<CheckFileMessage>,
        context: CheckContext,
    ) -> Result<Vec<Diagnostic>, CheckError> {
        if self.cancellation_token.is_cancelled() {
            return Err(CheckError::Cancelled);
        }

        if self.pending == 0 {
            return Ok(Vec::new());
        }

        let mut result = Vec::default();

        for message in receiver {
            match message {
                CheckFileMessage::Completed(diagnostics) => {
                    result.extend(diagnostics);

                    self.pending -= 1;
                    if let Some(progress) = self.progress {
                        progress.update(self.pending);
                    }

                    if self.pending == 0 {
                        break;
                    }
                }
                CheckFileMessage::Queue(id) => {
                    self.queue_file(id, context.clone())?;
                }
                CheckFileMessage::Cancelled => {
                    return Err(CheckError::Cancelled);
                }
            }
        }

        Ok(result)
    }

    fn queue_file(&mut self, file_id: FileId, context: CheckContext) -> Result<(), CheckError> {
        if context.is_cancelled() {
            return Err(CheckError::Cancelled);
        }

        if self.queued_files.insert(file_id) {
            self.pending += 1;
            if let Some(progress) = self.progress {
                progress.update(self.pending);
            }

            self.scheduler
                .check_file(CheckFileTask { file_id, context });
        }

        Ok(())
    }
}

enum CheckFileMessage {
    Completed(Vec<Diagnostic>),
    Queue(FileId),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dunlin_python_ast::builder::{assign, int, module};

    use crate::cancellation::CancellationTokenSource;
    use crate::db::tests::TestParser;
    use crate::module::{ModuleSearchPath, ModuleSearchPathKind};
    use crate::system::OsSystem;
    use crate::{ProgramSettings, Workspace};

    use super::{CheckError, Program, SameThreadCheckScheduler};

    struct TestCase {
        temp_dir: tempfile::TempDir,
        program: Program,
        parser: Arc<TestParser>,
    }

    fn create_program() -> TestCase {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        let parser = Arc::new(TestParser::default());

        let program = Program::new(
            Workspace::new(root.clone()),
            vec![ModuleSearchPath::new(root, ModuleSearchPathKind::FirstParty)],
            parser.clone(),
            Arc::new(OsSystem),
            ProgramSettings::default(),
        );

        TestCase {
            temp_dir,
            program,
            parser,
        }
    }

    #[test]
    fn check_reports_parse_errors_of_open_user_files() {
        let mut case = create_program();

        // The tree for this text is never registered, so parsing degrades
        // to an empty module with one error attached.
        let path = case.temp_dir.path().canonicalize().unwrap().join("broken.py");
        std::fs::write(&path, "def broken(:\n").unwrap();

        let file = crate::db::SourceDb::file_id(&case.program, &path);
        case.program.workspace_mut().open_file(file);

        let cancellation = CancellationTokenSource::new();
        let scheduler = SameThreadCheckScheduler::new(&case.program);
        let diagnostics = case
            .program
            .check(&scheduler, cancellation.token(), None)
            .unwrap();

        assert!(diagnostics
            .iter()
            .any(|diagnostic| diagnostic.code == "parse-error"));
    }

    #[test]
    fn clean_file_produces_no_diagnostics() {
        let mut case = create_program();

        let text = "x = 1\n";
        let path = case.temp_dir.path().canonicalize().unwrap().join("clean.py");
        std::fs::write(&path, text).unwrap();
        case.parser.register(text, module(vec![assign("x", int(1))]));

        let file = crate::db::SourceDb::file_id(&case.program, &path);
        case.program.workspace_mut().open_file(file);

        let cancellation = CancellationTokenSource::new();
        let scheduler = SameThreadCheckScheduler::new(&case.program);
        let diagnostics = case
            .program
            .check(&scheduler, cancellation.token(), None)
            .unwrap();

        assert!(diagnostics.is_empty());
    }

    #[test]
    fn cancelled_check_is_reported_as_cancelled() {
        let mut case = create_program();

        let path = case.temp_dir.path().canonicalize().unwrap().join("a.py");
        std::fs::write(&path, "x = 1\n").unwrap();
        let file = crate::db::SourceDb::file_id(&case.program, &path);
        case.program.workspace_mut().open_file(file);

        let cancellation = CancellationTokenSource::new();
        cancellation.cancel();

        let scheduler = SameThreadCheckScheduler::new(&case.program);
        let result = case.program.check(&scheduler, cancellation.token(), None);

        assert!(matches!(result, Err(CheckError::Cancelled)));
    }
}
