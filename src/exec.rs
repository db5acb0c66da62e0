//! Run commands inside running containers
//!
//! All three exec modes share the same prelude: shape the command into an
//! argv, create the exec instance, then attach to its multiplexed stream.
//! The buffered path collects everything and inspects the exit code; the
//! streaming path hands frames to the caller one at a time and finalizes
//! lazily; the detached path lives in [`crate::process`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::StreamExt;

use crate::{
    engine::Engine,
    errors::{Error, Result},
    tty::TtyReader,
};

/// Cap on accumulated exec output before truncation (10 MiB)
pub const DEFAULT_MAX_OUTPUT: usize = 10 * 1024 * 1024;

/// Build the argv for a user command string.
///
/// `lang` `"python"` runs the command through the interpreter; anything
/// else, including unrecognized tags, falls through to `sh -c`.
pub(crate) fn shape_command(
    command: &str,
    lang: Option<&str>,
) -> Vec<String> {
    match lang {
        Some("python") => vec![
            "python3".to_owned(),
            "-c".to_owned(),
            command.to_owned(),
        ],
        _ => vec!["sh".to_owned(), "-c".to_owned(), command.to_owned()],
    }
}

/// Result of executing a command inside a container
#[derive(Clone, Debug, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: f64,
    pub timed_out: bool,
    pub truncated: bool,
}

impl ExecResult {
    /// True when the command exited successfully (exit code 0)
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// Which stdio stream a [`StreamChunk`] came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl fmt::Display for StdStream {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            StdStream::Stdout => f.write_str("stdout"),
            StdStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One decoded chunk of streaming exec output
#[derive(Clone, Debug)]
pub struct StreamChunk {
    pub stream: StdStream,
    pub data: String,
}

#[derive(Default)]
pub(crate) struct DemuxOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
}

/// Drain a frame stream into per-stream buffers, truncating once the
/// combined size reaches `max_output`
pub(crate) async fn collect_frames(
    mut frames: TtyReader,
    max_output: usize,
) -> Result<DemuxOutput> {
    let mut out = DemuxOutput::default();
    let mut total = 0usize;
    while let Some(item) = frames.next().await {
        let chunk = item?;
        let is_stdout = chunk.is_stdout();
        let mut payload = chunk.into_bytes();
        let remaining = max_output - total;
        if payload.len() > remaining {
            payload.truncate(remaining);
            out.truncated = true;
        }
        total += payload.len();
        if is_stdout {
            out.stdout.extend_from_slice(&payload);
        } else {
            out.stderr.extend_from_slice(&payload);
        }
        if out.truncated {
            break;
        }
    }
    Ok(out)
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Execute a command and buffer its complete output.
///
/// On timeout the attach connection is dropped and the exit code is not
/// inspected: the command may still be running, and a late inspect can
/// hang or mislead.
pub(crate) async fn exec_command(
    engine: &Engine,
    container_id: &str,
    cmd: Vec<String>,
    max_output: usize,
    timeout: Option<Duration>,
) -> Result<ExecResult> {
    let start = Instant::now();
    let exec_id = engine.exec_create(container_id, &cmd, false).await?;
    let frames = engine.exec_start(&exec_id);

    let collected = match timeout {
        Some(limit) => match tokio::time::timeout(limit, collect_frames(frames, max_output)).await
        {
            Ok(result) => Some(result?),
            Err(_elapsed) => None,
        },
        None => Some(collect_frames(frames, max_output).await?),
    };

    match collected {
        Some(demux) => {
            let exit_code = engine.exec_exit_code(&exec_id).await?;
            Ok(ExecResult {
                exit_code,
                stdout: lossy(demux.stdout),
                stderr: lossy(demux.stderr),
                duration_ms: elapsed_ms(start),
                timed_out: false,
                truncated: demux.truncated,
            })
        }
        None => Ok(ExecResult {
            exit_code: -1,
            duration_ms: elapsed_ms(start),
            timed_out: true,
            ..ExecResult::default()
        }),
    }
}

/// Cancellation flag shared between an [`ExecStream`] and the container
/// handle that registered it
#[derive(Clone, Debug, Default)]
pub(crate) struct StreamGuard {
    closed: Arc<AtomicBool>,
}

impl StreamGuard {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Async iterator over streaming exec output.
///
/// Yield chunks with [`next`](ExecStream::next) until it returns `None`;
/// the finalized [`ExecResult`] is available afterwards through
/// [`result`](ExecStream::result).
pub struct ExecStream {
    engine: Engine,
    exec_id: String,
    frames: TtyReader,
    started: Instant,
    stdout: String,
    stderr: String,
    result: Option<ExecResult>,
    finished: bool,
    guard: StreamGuard,
}

impl ExecStream {
    pub(crate) fn new(
        engine: Engine,
        exec_id: String,
        frames: TtyReader,
        guard: StreamGuard,
    ) -> ExecStream {
        ExecStream {
            engine,
            exec_id,
            frames,
            started: Instant::now(),
            stdout: String::new(),
            stderr: String::new(),
            result: None,
            finished: false,
            guard,
        }
    }

    /// The exec instance id backing this stream
    pub fn id(&self) -> &str {
        &self.exec_id
    }

    /// Yield the next output chunk, or `None` once the exec finishes.
    ///
    /// Exhaustion finalizes the stream: the exit code is inspected and the
    /// buffered [`ExecResult`] becomes available.
    pub async fn next(&mut self) -> Option<Result<StreamChunk>> {
        if self.finished {
            return None;
        }
        if self.guard.is_closed() {
            self.shut();
            return None;
        }
        match self.frames.next().await {
            Some(Ok(chunk)) => {
                let stream = if chunk.is_stdout() {
                    StdStream::Stdout
                } else {
                    StdStream::Stderr
                };
                let data = String::from_utf8_lossy(&chunk).into_owned();
                match stream {
                    StdStream::Stdout => self.stdout.push_str(&data),
                    StdStream::Stderr => self.stderr.push_str(&data),
                }
                Some(Ok(StreamChunk { stream, data }))
            }
            Some(Err(e)) => Some(Err(e)),
            None => {
                self.shut();
                if let Err(e) = self.finalize().await {
                    return Some(Err(e));
                }
                None
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.result.is_some() {
            return Ok(());
        }
        let exit_code = self.engine.exec_exit_code(&self.exec_id).await?;
        self.result = Some(ExecResult {
            exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            duration_ms: elapsed_ms(self.started),
            timed_out: false,
            truncated: false,
        });
        Ok(())
    }

    /// The finalized result. Fails with [`Error::StreamPending`] while
    /// iteration is still in progress.
    pub fn result(&self) -> Result<&ExecResult> {
        self.result.as_ref().ok_or(Error::StreamPending)
    }

    /// Stop iterating and drop the attach connection without inspecting
    /// the exit code. Idempotent.
    pub fn close(&mut self) {
        self.guard.close();
        self.shut();
    }

    fn shut(&mut self) {
        self.finished = true;
        // replacing the reader drops the underlying connection
        self.frames = Box::pin(futures_util::stream::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use bytes::Bytes;
    use futures_util::stream::iter;

    #[test]
    fn shapes_shell_commands() {
        assert_eq!(shape_command("echo hi", None), vec!["sh", "-c", "echo hi"]);
        assert_eq!(
            shape_command("print(1)", Some("python")),
            vec!["python3", "-c", "print(1)"]
        );
        // unknown tags fall through to sh
        assert_eq!(
            shape_command("echo hi", Some("ruby")),
            vec!["sh", "-c", "echo hi"]
        );
    }

    #[test]
    fn ok_tracks_exit_code() {
        let result = ExecResult {
            exit_code: 0,
            ..ExecResult::default()
        };
        assert!(result.ok());
        let result = ExecResult {
            exit_code: 2,
            ..ExecResult::default()
        };
        assert!(!result.ok());
    }

    fn frame_stream(frames: Vec<(u8, Vec<u8>)>) -> TtyReader {
        let mut wire = Vec::new();
        for (stream_type, payload) in frames {
            let mut header = vec![stream_type, 0, 0, 0, 0, 0, 0, 0];
            BigEndian::write_u32(&mut header[4..8], payload.len() as u32);
            wire.extend(header);
            wire.extend(payload);
        }
        Box::pin(crate::tty::decode(Box::pin(iter(vec![Ok(
            Bytes::from(wire),
        )]))))
    }

    #[tokio::test]
    async fn collect_separates_streams() {
        let frames = frame_stream(vec![
            (1, b"out".to_vec()),
            (2, b"err".to_vec()),
            (1, b"more".to_vec()),
        ]);
        let demux = collect_frames(frames, DEFAULT_MAX_OUTPUT).await.unwrap();
        assert_eq!(demux.stdout, b"outmore");
        assert_eq!(demux.stderr, b"err");
        assert!(!demux.truncated);
    }

    #[tokio::test]
    async fn collect_truncates_to_exact_budget() {
        let frames = frame_stream(vec![(1, vec![b'x'; 100]), (1, vec![b'y'; 100])]);
        let demux = collect_frames(frames, 150).await.unwrap();
        assert_eq!(demux.stdout.len(), 150);
        assert!(demux.truncated);
        // the partial payload keeps its leading bytes
        assert_eq!(&demux.stdout[100..], &vec![b'y'; 50][..]);
    }

    #[tokio::test]
    async fn collect_at_exact_boundary_is_not_truncated() {
        let frames = frame_stream(vec![(1, vec![b'x'; 64])]);
        let demux = collect_frames(frames, 64).await.unwrap();
        assert_eq!(demux.stdout.len(), 64);
        assert!(!demux.truncated);
    }

    #[tokio::test]
    async fn stream_result_unavailable_until_finished() {
        let engine = Engine::unix("/nonexistent/engine.sock");
        let frames = frame_stream(vec![(1, b"chunk".to_vec()), (2, b"err".to_vec())]);
        let mut stream = ExecStream::new(
            engine,
            "exec0000".to_owned(),
            frames,
            StreamGuard::default(),
        );

        match stream.result() {
            Err(Error::StreamPending) => {}
            _ => panic!("expected StreamPending before iteration"),
        }

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.stream, StdStream::Stdout);
        assert_eq!(first.data, "chunk");
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.stream, StdStream::Stderr);

        // exhaustion inspects the exit code, which fails over this socket
        match stream.next().await {
            Some(Err(_)) => {}
            _ => panic!("expected the finalize error to surface"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_stream_stops_yielding() {
        let engine = Engine::unix("/nonexistent/engine.sock");
        let frames = frame_stream(vec![(1, b"never seen".to_vec())]);
        let mut stream = ExecStream::new(
            engine,
            "exec0000".to_owned(),
            frames,
            StreamGuard::default(),
        );
        stream.close();
        stream.close();
        assert!(stream.next().await.is_none());
    }
}
