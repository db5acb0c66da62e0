//! pocketdock is a client library for provisioning and driving sandbox
//! containers on a Docker- or Podman-compatible engine, speaking the
//! engine's HTTP API over its Unix socket.
//!
//! A [`Container`] handle is obtained from [`Container::create`] or
//! [`persistence::resume`]; commands run through it as buffered results,
//! live streams, detached processes, or persistent shell [`Session`]s.
//!
//! # examples
//!
//! ```no_run
//! # async fn run() -> pocketdock::Result<()> {
//! let engine = pocketdock::Engine::detect()?;
//! let container = pocketdock::Container::create(
//!     &engine,
//!     &pocketdock::SandboxOptions::builder()
//!         .image("alpine")
//!         .mem_limit("256m")
//!         .build(),
//! )
//! .await?;
//!
//! let result = container.exec("echo hello").await?;
//! assert!(result.ok());
//! println!("{}", result.stdout);
//!
//! container.shutdown(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
mod callbacks;
pub mod container;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod persistence;
pub mod process;
pub mod session;
mod tarball;
pub(crate) mod transport;
pub mod tty;
mod util;

pub use crate::{
    buffer::BufferSnapshot,
    container::{
        Container, ContainerInfo, ExecOutcome, RunOptions, SandboxOptions, DEFAULT_IMAGE,
    },
    engine::{Engine, SOCKET_ENV},
    errors::{Error, Result},
    exec::{ExecResult, ExecStream, StdStream, StreamChunk, DEFAULT_MAX_OUTPUT},
    persistence::{destroy, list, prune, resume, stop, ContainerSummary},
    process::{Process, DEFAULT_BUFFER_CAPACITY},
    session::Session,
    tty::TtyChunk,
    util::{format_bytes, parse_mem_limit},
};
