//! Detached process handle
//!
//! A background task reads the exec's frame stream into a bounded ring
//! buffer and dispatches decoded text to the container's callbacks. The
//! handle exposes the buffer and the completion state; it never blocks
//! the reader.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{
    future::{abortable, AbortHandle},
    StreamExt,
};
use tokio::sync::watch;

use crate::{
    buffer::{BufferSnapshot, RingBuffer},
    callbacks::CallbackRegistry,
    engine::Engine,
    errors::Result,
    exec::{exec_command, ExecResult, DEFAULT_MAX_OUTPUT},
    tty::{TtyChunk, TtyReader},
};

/// Capacity of the output ring buffer (1 MiB, split between streams)
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;

struct Shared {
    buffer: RingBuffer,
    exit_code: Mutex<i64>,
}

/// Handle to a detached exec running in a container.
///
/// Returned by running a command with `detach` set. Cloning the handle is
/// cheap; all clones observe the same process.
#[derive(Clone)]
pub struct Process {
    exec_id: String,
    container_id: String,
    engine: Engine,
    shared: Arc<Shared>,
    done: watch::Receiver<bool>,
    abort: AbortHandle,
}

impl Process {
    pub(crate) fn spawn(
        engine: Engine,
        container_id: String,
        exec_id: String,
        frames: TtyReader,
        callbacks: Arc<CallbackRegistry>,
        buffer_capacity: usize,
    ) -> Process {
        let shared = Arc::new(Shared {
            buffer: RingBuffer::new(buffer_capacity),
            exit_code: Mutex::new(-1),
        });
        let (done_tx, done_rx) = watch::channel(false);
        let (task, abort) = abortable(read_loop(
            frames,
            shared.clone(),
            callbacks,
            engine.clone(),
            exec_id.clone(),
            done_tx,
        ));
        tokio::spawn(task);

        Process {
            exec_id,
            container_id,
            engine,
            shared,
            done: done_rx,
            abort,
        }
    }

    /// The exec instance id
    pub fn id(&self) -> &str {
        &self.exec_id
    }

    /// True while the background process has not completed
    pub fn is_running(&self) -> bool {
        !*self.done.borrow()
    }

    /// Return buffered output without draining
    pub fn peek(&self) -> BufferSnapshot {
        self.shared.buffer.peek()
    }

    /// Drain and return all buffered output
    pub fn read(&self) -> BufferSnapshot {
        self.shared.buffer.read()
    }

    /// Current bytes held in the ring buffer
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer.size()
    }

    /// True if buffered output was ever evicted for capacity
    pub fn buffer_overflow(&self) -> bool {
        self.shared.buffer.overflow()
    }

    /// Block until the process exits, then build an [`ExecResult`] from
    /// the current buffer snapshot.
    ///
    /// With a timeout, elapsing yields a result with `timed_out` set
    /// instead of an error; the process keeps running.
    pub async fn wait(
        &self,
        timeout: Option<Duration>,
    ) -> ExecResult {
        let awaited = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_done()).await.is_ok(),
            None => {
                self.wait_done().await;
                true
            }
        };
        let snapshot = self.shared.buffer.peek();
        if awaited {
            ExecResult {
                exit_code: *self.shared.exit_code.lock().unwrap(),
                stdout: snapshot.stdout,
                stderr: snapshot.stderr,
                ..ExecResult::default()
            }
        } else {
            ExecResult {
                exit_code: -1,
                stdout: snapshot.stdout,
                stderr: snapshot.stderr,
                timed_out: true,
                ..ExecResult::default()
            }
        }
    }

    async fn wait_done(&self) {
        let mut done = self.done.clone();
        loop {
            match done.recv().await {
                Some(true) | None => return,
                Some(false) => continue,
            }
        }
    }

    /// Signal the process inside the container. Default is SIGTERM (15).
    ///
    /// Inspects the exec for its pid and runs `kill` through a fresh
    /// buffered exec, which lets the process handle the signal instead of
    /// having its attach socket cut. Failures are suppressed; this does
    /// not wait for the process to exit.
    pub async fn kill(
        &self,
        signal: i32,
    ) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let details = match self.engine.exec_inspect(&self.exec_id).await {
            Ok(details) => details,
            Err(_) => return Ok(()),
        };
        if details.pid > 0 {
            let cmd = vec![
                "kill".to_owned(),
                format!("-{}", signal),
                details.pid.to_string(),
            ];
            let _ = exec_command(
                &self.engine,
                &self.container_id,
                cmd,
                DEFAULT_MAX_OUTPUT,
                Some(Duration::from_secs(5)),
            )
            .await;
        }
        Ok(())
    }

    /// Abort the background reader. Used by container shutdown.
    pub(crate) fn cancel(&self) {
        self.abort.abort();
    }
}

async fn read_loop(
    mut frames: TtyReader,
    shared: Arc<Shared>,
    callbacks: Arc<CallbackRegistry>,
    engine: Engine,
    exec_id: String,
    done_tx: watch::Sender<bool>,
) {
    while let Some(item) = frames.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(_) => break,
        };
        shared.buffer.write(&chunk);
        let text = String::from_utf8_lossy(&chunk).into_owned();
        match chunk {
            TtyChunk::StdOut(_) => callbacks.dispatch_stdout(&text),
            TtyChunk::StdErr(_) => callbacks.dispatch_stderr(&text),
        }
    }
    // release the attach connection before inspecting
    drop(frames);

    if let Ok(code) = engine.exec_exit_code(&exec_id).await {
        *shared.exit_code.lock().unwrap() = code;
    }
    let exit_code = *shared.exit_code.lock().unwrap();
    let _ = done_tx.broadcast(true);
    callbacks.dispatch_exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::iter;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    fn frames(chunks: Vec<TtyChunk>) -> TtyReader {
        Box::pin(iter(chunks.into_iter().map(Ok).collect::<Vec<_>>()))
    }

    fn spawn_with_frames(
        chunks: Vec<TtyChunk>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Process {
        // the inspect call after stream end fails against this socket,
        // leaving the exit code at -1
        let engine = Engine::unix("/nonexistent/engine.sock");
        Process::spawn(
            engine,
            "deadbeef".to_owned(),
            "exec0000".to_owned(),
            frames(chunks),
            callbacks,
            DEFAULT_BUFFER_CAPACITY,
        )
    }

    #[tokio::test]
    async fn buffers_output_and_completes() {
        let callbacks = Arc::new(CallbackRegistry::default());
        let seen = Arc::new(Mutex::new(String::new()));
        {
            let seen = seen.clone();
            callbacks.on_stdout(move |data| seen.lock().unwrap().push_str(data));
        }

        let process = spawn_with_frames(
            vec![
                TtyChunk::StdOut(b"hello ".to_vec()),
                TtyChunk::StdOut(b"world".to_vec()),
                TtyChunk::StdErr(b"warn".to_vec()),
            ],
            callbacks,
        );

        let result = process.wait(None).await;
        assert_eq!(result.stdout, "hello world");
        assert_eq!(result.stderr, "warn");
        assert_eq!(result.exit_code, -1);
        assert!(!process.is_running());
        assert!(!process.buffer_overflow());

        // callbacks observed the same bytes the buffer holds
        assert_eq!(&*seen.lock().unwrap(), "hello world");

        // wait again returns the same snapshot; read drains it
        assert_eq!(process.wait(None).await.stdout, "hello world");
        assert_eq!(process.read().stdout, "hello world");
        assert_eq!(process.peek().stdout, "");
    }

    #[tokio::test]
    async fn exit_callback_fires_exactly_once_after_output() {
        let callbacks = Arc::new(CallbackRegistry::default());
        let exits = Arc::new(AtomicUsize::new(0));
        let last_exit = Arc::new(AtomicI64::new(0));
        {
            let exits = exits.clone();
            let last_exit = last_exit.clone();
            callbacks.on_exit(move |code| {
                exits.fetch_add(1, Ordering::SeqCst);
                last_exit.store(code, Ordering::SeqCst);
            });
        }

        let process =
            spawn_with_frames(vec![TtyChunk::StdOut(b"done\n".to_vec())], callbacks);
        let _ = process.wait(None).await;
        // the reader loop has broadcast completion; give its tail a turn
        tokio::task::yield_now().await;

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(last_exit.load(Ordering::SeqCst), -1);
    }

    #[tokio::test]
    async fn wait_timeout_yields_timed_out_result() {
        let callbacks = Arc::new(CallbackRegistry::default());
        let engine = Engine::unix("/nonexistent/engine.sock");
        // a stream that never ends keeps the process running
        let process = Process::spawn(
            engine,
            "deadbeef".to_owned(),
            "exec0000".to_owned(),
            Box::pin(futures_util::stream::pending()),
            callbacks,
            DEFAULT_BUFFER_CAPACITY,
        );

        let result = process.wait(Some(Duration::from_millis(50))).await;
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(process.is_running());
        process.cancel();
    }
}
