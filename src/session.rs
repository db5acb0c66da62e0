//! Persistent shell session over a long-lived exec
//!
//! A session keeps one bash process running inside the container; commands
//! sent through it share working directory, environment, and history.
//! Completion of a `send_and_wait` is detected with a sentinel echo: the
//! command is followed by `echo __PD_<token>_${?}__`, and the read loop
//! scans stdout lines for the token to recover the exit code. Sentinel
//! lines are consumed and never reach output consumers.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use futures_util::{future::abortable, future::AbortHandle, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    sync::{oneshot, Mutex as AsyncMutex},
};

use crate::{
    errors::{Error, Result},
    exec::ExecResult,
    tty::{Multiplexer, TtyChunk, TtyReader, TtyWriter},
    util,
};

type OutputFn = Box<dyn Fn(&str) + Send + Sync>;

struct Pending {
    token: String,
    started: Instant,
    stdout: String,
    stderr: String,
    exit_code: i64,
    signal: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct State {
    output: Mutex<String>,
    pending: Mutex<Option<Pending>>,
    callbacks: Mutex<Vec<OutputFn>>,
}

struct Inner {
    exec_id: String,
    writer: AsyncMutex<TtyWriter>,
    state: Arc<State>,
    abort: AbortHandle,
    closed: AtomicBool,
}

/// Handle to a persistent shell inside a container.
///
/// Created through the container's `session` method. Cloning the handle
/// is cheap; all clones drive the same shell.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub(crate) fn spawn(
        exec_id: String,
        multiplexer: Multiplexer,
    ) -> Session {
        let (frames, writer) = multiplexer.split();
        let state = Arc::new(State::default());
        let (task, abort) = abortable(read_loop(frames, state.clone()));
        tokio::spawn(task);

        Session {
            inner: Arc::new(Inner {
                exec_id,
                writer: AsyncMutex::new(writer),
                state,
                abort,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The exec instance id backing this session
    pub fn id(&self) -> &str {
        &self.inner.exec_id
    }

    /// Send a command to the shell without waiting for completion.
    ///
    /// Its output shows up in [`read`](Session::read) and `on_output`
    /// callbacks, but there is no way to know when it finishes.
    pub async fn send(
        &self,
        command: &str,
    ) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(format!("{}\n", command).as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a command and wait for it to finish, recovering its exit code.
    ///
    /// The shell executes commands sequentially, so only one
    /// `send_and_wait` may be outstanding at a time; a second concurrent
    /// call fails immediately with [`Error::CommandPending`]. On timeout
    /// the partial output is returned with `timed_out` set and the shell
    /// is left running.
    pub async fn send_and_wait(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }

        let token = util::generate_token();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.state.pending.lock().unwrap();
            if pending.is_some() {
                return Err(Error::CommandPending);
            }
            *pending = Some(Pending {
                token: token.clone(),
                started: Instant::now(),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: -1,
                signal: Some(tx),
            });
        }

        // ${?} expands to the exit code of the preceding command
        let payload = format!("{}\necho __PD_{}_${{?}}__\n", command, token);
        {
            let mut writer = self.inner.writer.lock().await;
            let written = async {
                writer.write_all(payload.as_bytes()).await?;
                writer.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await;
            if let Err(e) = written {
                self.inner.state.pending.lock().unwrap().take();
                return Err(Error::IO(e));
            }
        }

        let completed = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.is_ok(),
            None => {
                let _ = rx.await;
                true
            }
        };

        let pending = self.inner.state.pending.lock().unwrap().take();
        let pending = match pending {
            Some(p) => p,
            None => {
                return Ok(ExecResult {
                    exit_code: -1,
                    timed_out: !completed,
                    ..ExecResult::default()
                })
            }
        };

        Ok(ExecResult {
            exit_code: if completed { pending.exit_code } else { -1 },
            stdout: pending.stdout,
            stderr: pending.stderr,
            duration_ms: pending.started.elapsed().as_secs_f64() * 1000.0,
            timed_out: !completed,
            truncated: false,
        })
    }

    /// Drain and return all accumulated output
    pub fn read(&self) -> String {
        let mut output = self.inner.state.output.lock().unwrap();
        std::mem::replace(&mut *output, String::new())
    }

    /// Register a callback for output data. Panics in callbacks are
    /// swallowed.
    pub fn on_output<F>(
        &self,
        f: F,
    ) where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.state.callbacks.lock().unwrap().push(Box::new(f));
    }

    /// Close the session, terminating the shell exec. Idempotent.
    ///
    /// Does not stop or remove the container.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.inner.abort.abort();
        // a waiter parked on send_and_wait must not hang on a dead shell
        if let Some(pending) = self.inner.state.pending.lock().unwrap().as_mut() {
            if let Some(tx) = pending.signal.take() {
                let _ = tx.send(());
            }
        }
        Ok(())
    }
}

async fn read_loop(
    mut frames: TtyReader,
    state: Arc<State>,
) {
    let mut line_buf = String::new();
    while let Some(item) = frames.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(_) => break,
        };
        match chunk {
            TtyChunk::StdOut(bytes) => {
                line_buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = line_buf.find('\n') {
                    let rest = line_buf.split_off(pos + 1);
                    let mut line = std::mem::replace(&mut line_buf, rest);
                    line.pop();
                    if !consume_sentinel(&state, &line) {
                        line.push('\n');
                        emit(&state, &line, true);
                    }
                }
            }
            TtyChunk::StdErr(bytes) => {
                emit(&state, &String::from_utf8_lossy(&bytes), false);
            }
        }
    }
    // EOF with a command still in flight: report failure
    if let Some(pending) = state.pending.lock().unwrap().as_mut() {
        if let Some(tx) = pending.signal.take() {
            let _ = tx.send(());
        }
    }
}

/// Complete the in-flight command if *line* carries its sentinel,
/// consuming the line
fn consume_sentinel(
    state: &State,
    line: &str,
) -> bool {
    let (token, exit_code) = match find_sentinel(line) {
        Some(found) => found,
        None => return false,
    };
    let mut pending = state.pending.lock().unwrap();
    match pending.as_mut() {
        Some(p) if p.token == token => {
            p.exit_code = exit_code;
            if let Some(tx) = p.signal.take() {
                let _ = tx.send(());
            }
            true
        }
        _ => false,
    }
}

/// Scan a line for `__PD_<16 word chars>_<digits>__`, anywhere in the line
fn find_sentinel(line: &str) -> Option<(&str, i64)> {
    const MARKER: &str = "__PD_";
    const TOKEN_LEN: usize = 16;

    let bytes = line.as_bytes();
    for (idx, _) in line.match_indices(MARKER) {
        let token_start = idx + MARKER.len();
        let token_end = token_start + TOKEN_LEN;
        if token_end + 1 > bytes.len() {
            continue;
        }
        let token = &bytes[token_start..token_end];
        if !token
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            continue;
        }
        if bytes[token_end] != b'_' {
            continue;
        }
        let digits_start = token_end + 1;
        let mut digits_end = digits_start;
        while digits_end < bytes.len() && bytes[digits_end].is_ascii_digit() {
            digits_end += 1;
        }
        if digits_end == digits_start || !bytes[digits_end..].starts_with(b"__") {
            continue;
        }
        let exit_code = match line[digits_start..digits_end].parse() {
            Ok(code) => code,
            Err(_) => continue,
        };
        return Some((&line[token_start..token_end], exit_code));
    }
    None
}

fn emit(
    state: &State,
    text: &str,
    is_stdout: bool,
) {
    state.output.lock().unwrap().push_str(text);
    {
        let mut pending = state.pending.lock().unwrap();
        if let Some(p) = pending.as_mut() {
            // accumulate only while the command is still waiting
            if p.signal.is_some() {
                if is_stdout {
                    p.stdout.push_str(text);
                } else {
                    p.stderr.push_str(text);
                }
            }
        }
    }
    for cb in state.callbacks.lock().unwrap().iter() {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| cb(text)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_sentinel_with_exit_code() {
        let (token, code) = find_sentinel("__PD_0123456789abcdef_0__").unwrap();
        assert_eq!(token, "0123456789abcdef");
        assert_eq!(code, 0);

        let (_, code) = find_sentinel("__PD_0123456789abcdef_127__").unwrap();
        assert_eq!(code, 127);
    }

    #[test]
    fn finds_sentinel_embedded_in_a_line() {
        let (token, code) =
            find_sentinel("prompt$ __PD_aaaaaaaaaaaaaaaa_2__ trailing").unwrap();
        assert_eq!(token, "aaaaaaaaaaaaaaaa");
        assert_eq!(code, 2);
    }

    #[test]
    fn rejects_malformed_sentinels() {
        assert!(find_sentinel("__PD_short_0__").is_none());
        assert!(find_sentinel("__PD_0123456789abcdef_x__").is_none());
        assert!(find_sentinel("__PD_0123456789abcdef_0_").is_none());
        assert!(find_sentinel("no sentinel here").is_none());
        assert!(find_sentinel("__PD_0123456789abcdef_0").is_none());
    }

    #[test]
    fn first_valid_sentinel_wins() {
        let line = "__PD_not-a-valid-token!_1__ __PD_bbbbbbbbbbbbbbbb_3__";
        let (token, code) = find_sentinel(line).unwrap();
        assert_eq!(token, "bbbbbbbbbbbbbbbb");
        assert_eq!(code, 3);
    }

    #[test]
    fn sentinel_for_matching_token_completes_pending() {
        let state = State::default();
        let (tx, mut rx) = oneshot::channel();
        *state.pending.lock().unwrap() = Some(Pending {
            token: "0123456789abcdef".to_owned(),
            started: Instant::now(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            signal: Some(tx),
        });

        assert!(consume_sentinel(&state, "__PD_0123456789abcdef_42__"));
        assert_eq!(
            state.pending.lock().unwrap().as_ref().unwrap().exit_code,
            42
        );
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn sentinel_for_other_token_is_not_consumed() {
        let state = State::default();
        let (tx, _rx) = oneshot::channel();
        *state.pending.lock().unwrap() = Some(Pending {
            token: "0123456789abcdef".to_owned(),
            started: Instant::now(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            signal: Some(tx),
        });

        assert!(!consume_sentinel(&state, "__PD_ffffffffffffffff_0__"));
        assert_eq!(
            state.pending.lock().unwrap().as_ref().unwrap().exit_code,
            -1
        );
    }

    #[test]
    fn emit_routes_to_buffer_pending_and_callbacks() {
        let state = State::default();
        let seen = Arc::new(Mutex::new(String::new()));
        {
            let seen = seen.clone();
            state
                .callbacks
                .lock()
                .unwrap()
                .push(Box::new(move |text: &str| {
                    seen.lock().unwrap().push_str(text);
                }));
        }
        let (tx, _rx) = oneshot::channel();
        *state.pending.lock().unwrap() = Some(Pending {
            token: "0123456789abcdef".to_owned(),
            started: Instant::now(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            signal: Some(tx),
        });

        emit(&state, "out line\n", true);
        emit(&state, "err bytes", false);

        assert_eq!(&*state.output.lock().unwrap(), "out line\nerr bytes");
        let pending = state.pending.lock().unwrap();
        let p = pending.as_ref().unwrap();
        assert_eq!(p.stdout, "out line\n");
        assert_eq!(p.stderr, "err bytes");
        assert_eq!(&*seen.lock().unwrap(), "out line\nerr bytes");
    }

    #[tokio::test]
    async fn read_loop_assembles_lines_across_frames() {
        use futures_util::stream::iter;

        // frames split mid-line; sentinel consumed, other lines delivered
        let frames: Vec<crate::Result<TtyChunk>> = vec![
            Ok(TtyChunk::StdOut(b"hel".to_vec())),
            Ok(TtyChunk::StdOut(b"lo\n__PD_0123456789a".to_vec())),
            Ok(TtyChunk::StdOut(b"bcdef_0__\nworld\n".to_vec())),
        ];

        let state = Arc::new(State::default());
        let (tx, rx) = oneshot::channel();
        *state.pending.lock().unwrap() = Some(Pending {
            token: "0123456789abcdef".to_owned(),
            started: Instant::now(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            signal: Some(tx),
        });

        read_loop(Box::pin(iter(frames)), state.clone()).await;

        assert!(rx.await.is_ok());
        let output = state.output.lock().unwrap().clone();
        assert_eq!(output, "hello\nworld\n");
        assert!(!output.contains("__PD_"));
        assert_eq!(
            state.pending.lock().unwrap().as_ref().unwrap().exit_code,
            0
        );
    }
}
