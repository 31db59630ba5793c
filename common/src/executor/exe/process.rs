// Local process runner shared by the exe executor and the exe proxy server

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ExecutionError;
use crate::models::RunAsUser;
use crate::output::{MessageBuffer, OutputWriter, MAX_MESSAGE_LENGTH};

/// How long output readers may keep draining after the process exited
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes of one line kept in memory. A UTF-8 prefix this long always
/// holds at least a full message worth of characters.
const MAX_LINE_BYTES: usize = MAX_MESSAGE_LENGTH * 4;

/// Destination for lines read from a process stream
pub trait LineSink: Send + Sync {
    fn write_line(&self, line: &str);
}

impl LineSink for OutputWriter {
    fn write_line(&self, line: &str) {
        OutputWriter::write_line(self, line)
    }
}

impl LineSink for MessageBuffer {
    fn write_line(&self, line: &str) {
        self.push_line(line);
    }
}

/// What to start
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub file_path: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<String>,
    pub run_as: Option<RunAsUser>,
}

/// How waiting for a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exit code, None when terminated by a signal
    Exited(Option<i32>),
    /// The token fired and the process tree was killed
    Interrupted,
}

/// A started child process with its output readers
pub struct RunningProcess {
    child: Child,
    pid: u32,
    readers: Vec<JoinHandle<()>>,
}

impl RunningProcess {
    /// Spawn the process in its own process group with piped output
    pub fn start(
        spec: &ProcessSpec,
        stdout_sink: Arc<dyn LineSink>,
        stderr_sink: Arc<dyn LineSink>,
    ) -> Result<Self, ExecutionError> {
        let mut cmd = Command::new(&spec.file_path);
        cmd.args(&spec.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
            if let Some(user) = spec.run_as {
                cmd.uid(user.uid).gid(user.gid);
            }
        }
        #[cfg(not(unix))]
        if spec.run_as.is_some() {
            return Err(ExecutionError::InvalidStepConfiguration(
                "Running as another user is only supported on unix".to_string(),
            ));
        }

        let mut child = cmd.spawn().map_err(|e| {
            ExecutionError::ProcessSpawnFailed(format!("{}: {}", spec.file_path, e))
        })?;
        let pid = child.id().ok_or_else(|| {
            ExecutionError::ProcessSpawnFailed(format!("{}: process exited at once", spec.file_path))
        })?;
        info!(pid = pid, file_path = %spec.file_path, "Process started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, stdout_sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, stderr_sink)));
        }

        Ok(Self {
            child,
            pid,
            readers,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for exit, or kill the process tree when the token fires first
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<ProcessExit, ExecutionError> {
        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = self.child.wait() => Some(status),
        };

        let exit = match waited {
            None => {
                if let Err(e) = self.kill_tree().await {
                    warn!(pid = self.pid, error = %e, "Failed to kill process tree");
                }
                ProcessExit::Interrupted
            }
            Some(status) => {
                let status = status.map_err(|e| ExecutionError::ProcessFailed(e.to_string()))?;
                info!(pid = self.pid, exit_code = ?status.code(), "Process exited");
                ProcessExit::Exited(status.code())
            }
        };
        self.drain_readers().await;
        Ok(exit)
    }

    /// Kill the whole process group, then the child itself
    pub async fn kill_tree(&mut self) -> Result<(), ExecutionError> {
        #[cfg(unix)]
        {
            let group = format!("-{}", self.pid);
            match Command::new("kill").args(["-9", "--", &group]).status().await {
                Ok(status) if !status.success() => {
                    debug!(pid = self.pid, "Process group already gone");
                }
                Ok(_) => {}
                Err(e) => warn!(pid = self.pid, error = %e, "Failed to signal process group"),
            }
        }
        #[cfg(windows)]
        {
            let pid = self.pid.to_string();
            if let Err(e) = Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid])
                .status()
                .await
            {
                warn!(pid = self.pid, error = %e, "Failed to kill process tree");
            }
        }

        match self.child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => self
                .child
                .kill()
                .await
                .map_err(|e| ExecutionError::ProcessFailed(format!("kill failed: {}", e))),
        }
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                abort.abort();
                debug!(pid = self.pid, "Output reader still open after exit");
            }
        }
    }
}

async fn read_lines<R>(stream: R, sink: Arc<dyn LineSink>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        let (consumed, line_ended) = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(available) => {
                let newline = available.iter().position(|b| *b == b'\n');
                let taken = newline.map_or(available.len(), |i| i + 1);
                // Past the cap the rest of the line is dropped
                let room = MAX_LINE_BYTES.saturating_sub(line.len());
                line.extend_from_slice(&available[..taken.min(room)]);
                (taken, newline.is_some())
            }
            Err(e) => {
                debug!(error = %e, "Process output stream closed");
                break;
            }
        };
        reader.consume(consumed);
        if line_ended {
            emit_line(sink.as_ref(), &line);
            line.clear();
        }
    }
    if !line.is_empty() {
        emit_line(sink.as_ref(), &line);
    }
}

fn emit_line(sink: &dyn LineSink, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    sink.write_line(text.trim_end_matches(['\n', '\r']));
}

/// Split a command line into arguments, honouring single and double quotes
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in arguments.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    result.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        result.push(current);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_arguments() {
        assert_eq!(
            split_arguments(r#"--table orders  "C:\Data Files\in.csv" 'a b' """#),
            vec!["--table", "orders", r"C:\Data Files\in.csv", "a b", ""]
        );
        assert!(split_arguments("   ").is_empty());
    }

    #[cfg(unix)]
    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            file_path: "sh".to_string(),
            arguments: vec!["-c".to_string(), script.to_string()],
            working_directory: None,
            run_as: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let stdout = MessageBuffer::new();
        let stderr = MessageBuffer::new();
        let mut process = RunningProcess::start(
            &sh("echo one; echo two; echo oops >&2; exit 3"),
            Arc::new(stdout.clone()),
            Arc::new(stderr.clone()),
        )
        .unwrap();

        let exit = process.wait(&CancellationToken::new()).await.unwrap();

        assert_eq!(exit, ProcessExit::Exited(Some(3)));
        assert_eq!(stdout.snapshot().as_str(), "one\ntwo\n");
        assert_eq!(stderr.snapshot().as_str(), "oops\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process_tree() {
        let token = CancellationToken::new();
        let mut process = RunningProcess::start(
            &sh("sleep 30 & sleep 30"),
            Arc::new(MessageBuffer::new()),
            Arc::new(MessageBuffer::new()),
        )
        .unwrap();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let exit = process.wait(&token).await.unwrap();

        assert_eq!(exit, ProcessExit::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[derive(Default)]
    struct LineLengths(parking_lot::Mutex<Vec<usize>>);

    impl LineSink for LineLengths {
        fn write_line(&self, line: &str) {
            self.0.lock().push(line.len());
        }
    }

    #[tokio::test]
    async fn test_unterminated_line_is_capped() {
        use tokio::io::AsyncReadExt;

        let sink = Arc::new(LineLengths::default());
        let endless = tokio::io::repeat(b'a').take(3 * MAX_LINE_BYTES as u64);
        let tail: &[u8] = b"\nnext\n";

        read_lines(endless.chain(tail), sink.clone()).await;

        assert_eq!(*sink.0.lock(), vec![MAX_LINE_BYTES, 4]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_without_newline_fills_one_truncated_message() {
        let stdout = MessageBuffer::new();
        let mut process = RunningProcess::start(
            &sh("head -c 3000000 /dev/zero | tr '\\0' a"),
            Arc::new(stdout.clone()),
            Arc::new(MessageBuffer::new()),
        )
        .unwrap();

        let exit = process.wait(&CancellationToken::new()).await.unwrap();

        assert_eq!(exit, ProcessExit::Exited(Some(0)));
        let output = stdout.snapshot();
        assert_eq!(output.len(), MAX_MESSAGE_LENGTH);
        assert!(output.is_truncated());
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_spawn() {
        let spec = ProcessSpec {
            file_path: "/nonexistent/loader".to_string(),
            arguments: Vec::new(),
            working_directory: None,
            run_as: None,
        };
        let err = RunningProcess::start(
            &spec,
            Arc::new(MessageBuffer::new()),
            Arc::new(MessageBuffer::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExecutionError::ProcessSpawnFailed(_)));
    }
}
