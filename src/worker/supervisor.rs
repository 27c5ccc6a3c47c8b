//! Lifecycle owner for the recognition worker process.
//!
//! The supervisor is the only component callers talk to. It spawns the
//! worker, correlates requests with replies, enforces the per-request
//! deadline, and recovers from a hung or dead worker by killing and
//! respawning it. Its outward contract never fails: every failure path
//! resolves to an empty string.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::worker::protocol::{read_message, write_message, Message, ProtocolError};

/// How the supervisor launches the worker. Defaults to re-invoking the
/// current executable with the `worker` subcommand.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment entries for the child, on top of the inherited
    /// environment. Used to hand the worker its recognizer command and
    /// segmentation tunables.
    pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn current_exe_worker() -> Result<Self> {
        let program = std::env::current_exe().context("cannot locate own executable")?;
        Ok(Self {
            program,
            args: vec!["worker".to_string()],
            envs: Vec::new(),
        })
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }
}

/// One live worker: the child process, the write end of its stdin, and a
/// channel drained by a dedicated reader thread. Recreated wholesale on
/// every restart; nothing in here survives across restarts.
struct WorkerHandle {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<Result<Message, ProtocolError>>,
    reader: Option<JoinHandle<()>>,
}

struct SupervisorState {
    handle: Option<WorkerHandle>,
    /// Monotonic across restarts so a stale reply from a worker being torn
    /// down can never be confused with a fresh request to its replacement.
    next_id: u64,
}

pub struct Supervisor {
    command: WorkerCommand,
    poll_interval: Duration,
    /// Bound on how long teardown waits for the child to exit before the
    /// kill is escalated.
    join_timeout: Duration,
    state: Mutex<SupervisorState>,
    /// Last liveness answer observed under the lock, so the health probe
    /// can respond while a request holds the mutex for its full deadline.
    last_alive: AtomicBool,
}

impl Supervisor {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            poll_interval: Duration::from_millis(10),
            join_timeout: Duration::from_secs(1),
            state: Mutex::new(SupervisorState {
                handle: None,
                next_id: 1,
            }),
            last_alive: AtomicBool::new(false),
        }
    }

    /// Run one image through the worker with a hard wall-clock deadline.
    ///
    /// Never fails outward: a broken channel, a dead worker, or a missed
    /// deadline all resolve to an empty string, and the worker is replaced
    /// so the next call starts clean. The in-flight request is abandoned,
    /// never retried.
    pub fn process(&self, image_bytes: Vec<u8>, timeout: Duration) -> String {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        if !handle_alive(&mut state.handle) {
            teardown_opt(state.handle.take(), self.join_timeout);
            if let Err(e) = spawn_worker(state, &self.command) {
                error!("failed to start worker: {}", e);
                self.last_alive.store(false, Ordering::Relaxed);
                return String::new();
            }
        }
        self.last_alive.store(true, Ordering::Relaxed);

        let id = state.next_id;
        state.next_id += 1;

        // The handle is taken out for the duration of the exchange and put
        // back only on a successful reply; every failure path below tears
        // it down and starts a replacement.
        let Some(mut handle) = state.handle.take() else {
            return String::new();
        };

        if let Err(e) = write_message(&mut handle.stdin, &Message::Request { id, image_bytes }) {
            warn!("request send failed ({}), restarting worker", e);
            self.replace_worker(state, handle);
            return String::new();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(self.poll_interval);

            match handle.replies.recv_timeout(wait) {
                Ok(Ok(Message::Reply { id: reply_id, text })) if reply_id == id => {
                    state.handle = Some(handle);
                    return text;
                }
                Ok(Ok(Message::Reply { id: reply_id, .. })) => {
                    // Should not happen by construction (one in-flight
                    // request at a time), but a stale reply must never be
                    // mistaken for ours.
                    warn!(
                        expected = id,
                        got = reply_id,
                        "ignoring reply with mismatched id"
                    );
                }
                Ok(Ok(Message::Request { .. })) | Ok(Ok(Message::Stop)) => {
                    warn!("ignoring request/stop frame on the reply stream");
                }
                Ok(Err(e)) => {
                    warn!("reply stream corrupted ({}), restarting worker", e);
                    self.replace_worker(state, handle);
                    return String::new();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("worker channel closed, restarting worker");
                    self.replace_worker(state, handle);
                    return String::new();
                }
            }
        }

        warn!(
            request_id = id,
            timeout_ms = timeout.as_millis() as u64,
            "OCR deadline missed, killing and restarting worker"
        );
        self.replace_worker(state, handle);
        String::new()
    }

    /// Start the worker eagerly instead of on first request.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if handle_alive(&mut state.handle) {
            self.last_alive.store(true, Ordering::Relaxed);
            return Ok(());
        }
        teardown_opt(state.handle.take(), self.join_timeout);
        let started = spawn_worker(state, &self.command);
        self.last_alive.store(started.is_ok(), Ordering::Relaxed);
        started
    }

    /// Send the stop sentinel and tear the worker down.
    pub fn stop(&self) {
        let mut guard = self.lock_state();
        teardown_opt(guard.handle.take(), self.join_timeout);
        self.last_alive.store(false, Ordering::Relaxed);
    }

    /// Full stop-then-start cycle. The id counter is not reset.
    pub fn restart(&self) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        teardown_opt(state.handle.take(), self.join_timeout);
        let started = spawn_worker(state, &self.command);
        self.last_alive.store(started.is_ok(), Ordering::Relaxed);
        started
    }

    /// Liveness probe for the health endpoint. This is the only channel
    /// through which callers can tell "no formula found" apart from "the
    /// worker is in trouble".
    ///
    /// Never blocks: if a request currently holds the state lock, the last
    /// answer observed under the lock is reported instead.
    pub fn worker_alive(&self) -> bool {
        let mut guard = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return self.last_alive.load(Ordering::Relaxed),
        };
        let alive = handle_alive(&mut guard.handle);
        self.last_alive.store(alive, Ordering::Relaxed);
        alive
    }

    /// The id the next request will be issued with. Diagnostic; ids are
    /// strictly increasing and survive restarts.
    pub fn next_request_id(&self) -> u64 {
        self.lock_state().next_id
    }

    /// Tear down a taken handle and spawn a fresh worker in its place.
    fn replace_worker(&self, state: &mut SupervisorState, handle: WorkerHandle) {
        teardown(handle, self.join_timeout);
        match spawn_worker(state, &self.command) {
            Ok(()) => self.last_alive.store(true, Ordering::Relaxed),
            Err(e) => {
                self.last_alive.store(false, Ordering::Relaxed);
                error!("failed to respawn worker: {}", e);
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        // A panicked holder leaves plain data behind; it is still coherent
        // enough to restart from.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A handle counts as alive only while the child has not been reaped.
fn handle_alive(handle: &mut Option<WorkerHandle>) -> bool {
    match handle {
        Some(h) => matches!(h.child.try_wait(), Ok(None)),
        None => false,
    }
}

fn spawn_worker(state: &mut SupervisorState, command: &WorkerCommand) -> Result<()> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn worker {:?}", command.program))?;

    let stdin = child
        .stdin
        .take()
        .context("worker child has no stdin pipe")?;
    let mut stdout = child
        .stdout
        .take()
        .context("worker child has no stdout pipe")?;

    let (tx, rx) = mpsc::channel();
    let reader = std::thread::Builder::new()
        .name("worker-reader".to_string())
        .spawn(move || loop {
            match read_message(&mut stdout) {
                Ok(message) => {
                    if tx.send(Ok(message)).is_err() {
                        break;
                    }
                }
                Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        })
        .context("failed to spawn worker reader thread")?;

    info!(pid = child.id(), "worker started");
    state.handle = Some(WorkerHandle {
        child,
        stdin,
        replies: rx,
        reader: Some(reader),
    });
    Ok(())
}

fn teardown_opt(handle: Option<WorkerHandle>, join_timeout: Duration) {
    if let Some(handle) = handle {
        teardown(handle, join_timeout);
    }
}

/// Tear down a worker: stop sentinel, bounded wait, then kill. The reader
/// thread is joined after the child is gone, when EOF is guaranteed.
fn teardown(mut handle: WorkerHandle, join_timeout: Duration) {
    // Best effort: a healthy worker exits on the sentinel; a hung one gets
    // killed below.
    let _ = write_message(&mut handle.stdin, &Message::Stop);
    let _ = handle.stdin.flush();
    drop(handle.stdin);

    let deadline = Instant::now() + join_timeout;
    let exited = loop {
        match handle.child.try_wait() {
            Ok(Some(_)) => break true,
            Ok(None) => {
                if Instant::now() >= deadline {
                    break false;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(_) => break false,
        }
    };

    if !exited {
        debug!(pid = handle.child.id(), "worker did not exit in time, killing");
        let _ = handle.child.kill();
        let _ = handle.child.wait();
    }

    if let Some(reader) = handle.reader.take() {
        let _ = reader.join();
    }
}
