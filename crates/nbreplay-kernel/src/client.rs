use crate::error::{KernelError, Result};
use crate::protocol::{self, AnalyzeReply, ExecuteReply, Request};
use nbreplay::{AnalyzeOptions, Analysis, NotebookState};
use nbreplay_session::{
    CollabError, DependencyAnalyzer, ExecOutcome, ExecRequest, ExecutionSandbox,
};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// How to start the kernel worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for KernelCommand {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), "nbreplay_worker".to_string()],
        }
    }
}

impl KernelCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// A request was written whose reply has not been read yet.
    in_flight: bool,
}

impl Worker {
    fn spawn(command: &KernelCommand) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| KernelError::Spawn {
                program: command.program.clone(),
                source,
            })?;
        let stdin = child.stdin.take().ok_or(KernelError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(KernelError::MissingPipe("stdout"))?;
        debug!(program = %command.program, pid = ?child.id(), "spawned kernel worker");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            in_flight: false,
        })
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill kernel worker");
        }
    }

    /// Send SIGINT so the worker abandons the running request and replies.
    #[cfg(unix)]
    fn signal_interrupt(&self) -> bool {
        let Some(pid) = self.child.id().and_then(|id| libc::pid_t::try_from(id).ok()) else {
            return false;
        };
        // SAFETY: `pid` is our own child, which has not been reaped.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc != 0 {
            warn!(pid, error = %std::io::Error::last_os_error(), "failed to signal kernel worker");
        }
        rc == 0
    }

    #[cfg(not(unix))]
    fn signal_interrupt(&self) -> bool {
        false
    }
}

/// Client for one kernel worker process.
///
/// The worker hosts both the interpreter that executes replayed cells and
/// the dependency analyzer, so the client implements [`ExecutionSandbox`]
/// and [`DependencyAnalyzer`]. Requests are serialized. When a caller gives
/// up on a request (a timeout), [`interrupt_worker`](Self::interrupt_worker)
/// stops it inside the live interpreter; a request abandoned without that is
/// answered by restarting the worker before the next request.
pub struct KernelClient {
    command: KernelCommand,
    worker: Mutex<Option<Worker>>,
    interrupt_grace: Duration,
}

impl std::fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelClient")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl KernelClient {
    /// Start the worker.
    pub fn spawn(command: KernelCommand) -> Result<Self> {
        let worker = Worker::spawn(&command)?;
        info!(program = %command.program, "kernel worker started");
        Ok(Self {
            command,
            worker: Mutex::new(Some(worker)),
            interrupt_grace: INTERRUPT_GRACE,
        })
    }

    /// How long an interrupted worker may take to answer before it is
    /// restarted.
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    pub fn command(&self) -> &KernelCommand {
        &self.command
    }

    /// Kill the worker in `slot` and start a fresh one. Interpreter state is
    /// lost.
    async fn respawn(&self, slot: &mut Option<Worker>) -> Result<()> {
        if let Some(worker) = slot.take() {
            worker.kill().await;
        }
        *slot = Some(Worker::spawn(&self.command)?);
        info!("kernel worker restarted");
        Ok(())
    }

    /// Stop a request that was abandoned in flight while keeping the
    /// interpreter alive.
    ///
    /// The worker receives SIGINT and is expected to answer the pending
    /// request, whose reply is discarded. A worker that exits or stays
    /// silent for the grace period is restarted. Does nothing when no
    /// request is pending.
    pub async fn interrupt_worker(&self) -> Result<()> {
        let mut guard = self.worker.lock().await;
        let Some(worker) = guard.as_mut() else {
            return Ok(());
        };
        if !worker.in_flight {
            return Ok(());
        }

        if worker.signal_interrupt() {
            let mut reply = String::new();
            let answered =
                tokio::time::timeout(self.interrupt_grace, worker.stdout.read_line(&mut reply))
                    .await;
            match answered {
                Ok(Ok(n)) if n > 0 => {
                    worker.in_flight = false;
                    debug!(reply = reply.trim_end(), "kernel worker answered interrupt");
                    return Ok(());
                }
                Ok(Ok(_)) => warn!("kernel worker exited on interrupt"),
                Ok(Err(e)) => warn!(error = %e, "failed to read interrupted reply"),
                Err(_) => warn!(grace = ?self.interrupt_grace, "kernel worker ignored interrupt"),
            }
        }
        self.respawn(&mut guard).await
    }

    /// Ask the worker to exit, killing it if it does not within a grace
    /// period.
    pub async fn shutdown(&self) -> Result<()> {
        let mut guard = self.worker.lock().await;
        let Some(mut worker) = guard.take() else {
            return Ok(());
        };
        let line = protocol::encode(&Request::Shutdown)?;
        let sent = match worker.stdin.write_all(line.as_bytes()).await {
            Ok(()) => worker.stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(error = %e, "could not send shutdown to kernel worker");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, worker.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "kernel worker exited"),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!("kernel worker ignored shutdown; killing it");
                worker.kill().await;
            }
        }
        Ok(())
    }

    async fn round_trip(&self, request: &Request<'_>) -> Result<String> {
        let line = protocol::encode(request)?;
        let mut guard = self.worker.lock().await;

        if guard.as_ref().is_some_and(|w| w.in_flight) {
            warn!("previous request was abandoned; restarting kernel worker");
            if let Some(worker) = guard.take() {
                worker.kill().await;
            }
        }
        if guard.is_none() {
            *guard = Some(Worker::spawn(&self.command)?);
        }
        let Some(worker) = guard.as_mut() else {
            return Err(KernelError::WorkerExited);
        };

        worker.in_flight = true;
        let mut reply = String::new();
        let exchanged = async {
            worker.stdin.write_all(line.as_bytes()).await?;
            worker.stdin.flush().await?;
            worker.stdout.read_line(&mut reply).await
        }
        .await;

        match exchanged {
            Ok(0) => {
                if let Some(worker) = guard.take() {
                    worker.kill().await;
                }
                Err(KernelError::WorkerExited)
            }
            Ok(_) => {
                worker.in_flight = false;
                Ok(reply)
            }
            Err(e) => {
                if let Some(worker) = guard.take() {
                    worker.kill().await;
                }
                Err(e.into())
            }
        }
    }

    pub async fn execute_cell(&self, request: ExecRequest<'_>) -> Result<ExecOutcome> {
        let reply = self
            .round_trip(&Request::Execute {
                cell_id: request.cell_id,
                source: request.source,
                tracked: request.tracked,
            })
            .await?;
        protocol::decode::<ExecuteReply>(&reply)?.into_outcome()
    }

    pub async fn analyze_cells(
        &self,
        notebook: &NotebookState,
        options: AnalyzeOptions,
    ) -> Result<Analysis> {
        let reply = self.round_trip(&Request::analyze(notebook, options)).await?;
        protocol::decode::<AnalyzeReply>(&reply)?.into_analysis()
    }
}

impl ExecutionSandbox for KernelClient {
    async fn execute(&self, request: ExecRequest<'_>) -> std::result::Result<ExecOutcome, CollabError> {
        self.execute_cell(request)
            .await
            .map_err(|e| CollabError::Collaborator(e.to_string()))
    }

    async fn interrupt(&self) -> std::result::Result<(), CollabError> {
        self.interrupt_worker()
            .await
            .map_err(|e| CollabError::Collaborator(e.to_string()))
    }
}

impl DependencyAnalyzer for KernelClient {
    async fn analyze(
        &self,
        notebook: &NotebookState,
        options: AnalyzeOptions,
    ) -> std::result::Result<Analysis, CollabError> {
        self.analyze_cells(notebook, options)
            .await
            .map_err(|e| CollabError::Collaborator(e.to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nbreplay::CellSet;

    const WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"op":"shutdown"'*) exit 0 ;;
    *'"op":"analyze"'*) echo '{"fresh_cells":[0],"stale_cells":[],"refresher_links":{"0":[]},"error":null}' ;;
    *'undefined_name'*) echo '{"exception":"NameError","violation":false,"error":null}' ;;
    *'worker_error'*) echo '{"exception":null,"violation":false,"error":"tracer crashed"}' ;;
    *'die_now'*) exit 1 ;;
    *'sleep_forever'*) sleep 3 ;;
    *) echo '{"exception":null,"violation":false,"error":null}' ;;
  esac
done
"#;

    fn client() -> KernelClient {
        KernelClient::spawn(KernelCommand::new("sh").with_args(["-c", WORKER])).unwrap()
    }

    #[tokio::test]
    async fn test_execute_success_and_exception() {
        let client = client();
        let ok = client.execute(ExecRequest::cell(0, "x = 1", true)).await.unwrap();
        assert!(ok.succeeded());

        let raised = client
            .execute(ExecRequest::cell(1, "print(undefined_name)", true))
            .await
            .unwrap();
        assert_eq!(raised.exception.as_deref(), Some("NameError"));
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_analyze() {
        let client = client();
        let notebook: NotebookState = [(0, "x = 1".to_string())].into();
        let analysis = client
            .analyze(&notebook, AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(analysis.fresh_cells, CellSet::from([0]));
        assert_eq!(analysis.refresher_cells(), CellSet::from([0]));
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_error_is_collaborator_failure() {
        let client = client();
        let err = client
            .execute(ExecRequest::cell(0, "worker_error()", true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tracer crashed"));
    }

    #[tokio::test]
    async fn test_dead_worker_is_respawned() {
        let client = client();
        let err = client.execute_cell(ExecRequest::cell(0, "die_now()", true)).await;
        assert!(matches!(err, Err(KernelError::WorkerExited)));

        let ok = client.execute(ExecRequest::cell(1, "y = 2", true)).await.unwrap();
        assert!(ok.succeeded());
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_request_restarts_worker() {
        let client = client();
        let res = tokio::time::timeout(
            Duration::from_millis(200),
            client.execute(ExecRequest::cell(0, "sleep_forever()", true)),
        )
        .await;
        assert!(res.is_err());

        // The stale reply of the abandoned request must not be read here.
        let ok = client
            .execute(ExecRequest::cell(1, "print(undefined_name)", true))
            .await
            .unwrap();
        assert_eq!(ok.exception.as_deref(), Some("NameError"));
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_when_idle_is_noop() {
        let client = client();
        client.interrupt().await.unwrap();
        let ok = client.execute(ExecRequest::cell(0, "z = 3", false)).await.unwrap();
        assert!(ok.succeeded());
        client.shutdown().await.unwrap();
    }

    /// Remembers `a = 1` and answers SIGINT during a long-running cell.
    const STATEFUL_WORKER: &str = r#"
trap ':' INT
A=
while IFS= read -r line; do
  case "$line" in
    *'"op":"shutdown"'*) exit 0 ;;
    *'a = 1'*) A=1; echo '{"exception":null,"violation":false,"error":null}' ;;
    *'print(a)'*)
      if [ "$A" = 1 ]; then
        echo '{"exception":null,"violation":false,"error":null}'
      else
        echo '{"exception":"NameError","violation":false,"error":null}'
      fi ;;
    *'while True'*)
      sleep 30 &
      pid=$!
      wait $pid
      kill $pid 2>/dev/null
      echo '{"exception":"KeyboardInterrupt","violation":false,"error":null}' ;;
    *) echo '{"exception":null,"violation":false,"error":null}' ;;
  esac
done
"#;

    #[tokio::test]
    async fn test_interrupt_keeps_interpreter_state() {
        let client =
            KernelClient::spawn(KernelCommand::new("sh").with_args(["-c", STATEFUL_WORKER])).unwrap();
        let set = client.execute(ExecRequest::cell(0, "a = 1", true)).await.unwrap();
        assert!(set.succeeded());

        let res = tokio::time::timeout(
            Duration::from_millis(200),
            client.execute(ExecRequest::cell(1, "while True: pass", true)),
        )
        .await;
        assert!(res.is_err());
        client.interrupt().await.unwrap();

        let read = client.execute(ExecRequest::cell(2, "print(a)", true)).await.unwrap();
        assert!(read.succeeded(), "state lost: {:?}", read.exception);
        client.shutdown().await.unwrap();
    }

    /// Ignores SIGINT, so an interrupted cell never answers.
    const DEAF_WORKER: &str = r#"
trap '' INT
while IFS= read -r line; do
  case "$line" in
    *'"op":"shutdown"'*) exit 0 ;;
    *'while True'*) sleep 5 ;;
    *) echo '{"exception":null,"violation":false,"error":null}' ;;
  esac
done
"#;

    #[tokio::test]
    async fn test_unanswered_interrupt_restarts_worker() {
        let client = KernelClient::spawn(KernelCommand::new("sh").with_args(["-c", DEAF_WORKER]))
            .unwrap()
            .with_interrupt_grace(Duration::from_millis(300));

        let res = tokio::time::timeout(
            Duration::from_millis(200),
            client.execute(ExecRequest::cell(0, "while True: pass", true)),
        )
        .await;
        assert!(res.is_err());
        client.interrupt().await.unwrap();

        let ok = client.execute(ExecRequest::cell(1, "y = 2", true)).await.unwrap();
        assert!(ok.succeeded());
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_after_worker_exited() {
        let client = KernelClient::spawn(KernelCommand::new("sh").with_args(["-c", "exit 0"])).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The shutdown request hits a closed pipe; that is not an error.
        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let err = KernelClient::spawn(KernelCommand::new("/nonexistent/kernel-worker")).unwrap_err();
        assert!(matches!(err, KernelError::Spawn { .. }));
    }
}
