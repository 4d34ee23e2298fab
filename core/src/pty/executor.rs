//! C1 PTY Executor: drives one interactive child process under a
//! pseudo-terminal and exposes a byte stream plus an input channel.
//!
//! Grounded on `ProcessManager::spawn_shell`/`kill_session`: a dedicated OS
//! reader thread (portable-pty's reader is a blocking `Read`) feeds a
//! bounded `tokio::sync::mpsc::channel`, drained by an async task that
//! forwards UTF-8-boundary-aligned chunks to every registered consumer in
//! registration order.

use std::io::{Read, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use rand::Rng;
use tokio::sync::Notify;

use crate::error::PtyError;

/// Consumer invoked for every byte chunk, in registration order, with the
/// chunk's execution-local sequence number. Consumers must not block for
/// long — they run inline on the drain task.
pub type ByteConsumer = Box<dyn Fn(u64, &[u8]) + Send + Sync>;

/// Consumer invoked once, the first time the drain task's periodic poll
/// observes the child has exited. Carries the child's exit code, or `None`
/// if the platform could not report one.
pub type ExitConsumer = Box<dyn Fn(Option<i64>) + Send + Sync>;

/// Consumer invoked when the reader thread drops a chunk because the
/// bounded channel stayed full past the configured grace period. Carries
/// the number of bytes dropped.
pub type OverflowConsumer = Box<dyn Fn(usize) + Send + Sync>;

/// What to run and how — the Supervisor builds this from task options.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for SpawnRequest {
    fn default() -> Self {
        Self {
            command: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            rows: 24,
            cols: 80,
        }
    }
}

/// Control-sequence configuration — these are configuration, not code
/// constants.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub inter_byte_delay_ms: Range<u64>,
    pub submission_sequence: Vec<u8>,
    pub interrupt_sequence: Vec<u8>,
    /// How long the reader thread keeps retrying a full output channel
    /// before it drops the chunk and reports it via `on_overflow`.
    pub stream_overflow_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            inter_byte_delay_ms: 40..150,
            submission_sequence: b"\r".to_vec(),
            interrupt_sequence: vec![0x03], // ETX, conventionally Ctrl-C
            stream_overflow_grace: Duration::from_millis(200),
        }
    }
}

/// Re-aligns a byte stream to UTF-8 boundaries without ever materializing a
/// `String` — downstream consumers want raw bytes, just never split mid
/// codepoint.
struct ByteAligner {
    incomplete: Vec<u8>,
}

impl ByteAligner {
    fn new() -> Self {
        Self {
            incomplete: Vec::with_capacity(4),
        }
    }

    fn align(&mut self, input: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let valid_up_to = match std::str::from_utf8(&data) {
            Ok(_) => data.len(),
            Err(e) => {
                let valid = e.valid_up_to();
                match e.error_len() {
                    None => valid,
                    Some(bad) => valid + bad,
                }
            }
        };

        if valid_up_to < data.len() {
            self.incomplete = data[valid_up_to..].to_vec();
        }
        data.truncate(valid_up_to);
        data
    }
}

struct Inner {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    child_pid: i32,
    #[cfg(unix)]
    pgid: i32,
    shutdown: Arc<Notify>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    write_lock: tokio::sync::Mutex<()>,
    consumers: RwLock<Vec<ByteConsumer>>,
    exit_consumers: RwLock<Vec<ExitConsumer>>,
    overflow_consumers: Arc<RwLock<Vec<OverflowConsumer>>>,
    seq: AtomicU64,
    last_output_at: Mutex<Instant>,
    last_interrupt_at: Mutex<Option<Instant>>,
    config: ExecutorConfig,
    heartbeat_cancel: Notify,
}

/// Handle to one running child process under a pseudo-terminal.
///
/// Cheap to clone (wraps an `Arc`); every clone refers to the same
/// underlying session.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// `start(command, args, env, cwd) → execution_handle`.
    ///
    /// Opens a PTY, spawns the child, and starts the dedicated reader
    /// thread plus its async drain task. Fails with `SpawnFailed` if the OS
    /// cannot allocate a PTY or exec the binary.
    pub fn start(request: SpawnRequest, config: ExecutorConfig) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::spawn_failed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&request.command);
        cmd.args(&request.args);
        for (k, v) in &request.env {
            cmd.env(k, v);
        }
        if let Some(ref dir) = request.cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::spawn_failed(format!("failed to spawn child: {e}")))?;

        let child_pid = child
            .process_id()
            .map(|pid| pid as i32)
            .ok_or_else(|| PtyError::spawn_failed("could not obtain child PID"))?;

        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(child_pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::spawn_failed(format!("failed to take PTY writer: {e}")))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::spawn_failed(format!("failed to clone PTY reader: {e}")))?;

        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();

        // Bounded mpsc: 256 slots of up to 4 KiB each, ~1 MiB — the same
        // shape as ProcessManager's reader-to-emitter handoff.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);

        let overflow_consumers: Arc<RwLock<Vec<OverflowConsumer>>> = Arc::new(RwLock::new(Vec::new()));
        let reader_overflow_consumers = overflow_consumers.clone();
        let overflow_grace = config.stream_overflow_grace;

        let reader_handle = std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut pending = buf[..n].to_vec();
                            let started = Instant::now();
                            loop {
                                match tx.try_send(pending) {
                                    Ok(()) => break,
                                    Err(tokio::sync::mpsc::error::TrySendError::Full(returned)) => {
                                        if started.elapsed() >= overflow_grace {
                                            log::warn!(
                                                "PTY reader: channel full after {overflow_grace:?} grace, dropping {} bytes",
                                                returned.len()
                                            );
                                            let consumers = reader_overflow_consumers.read().unwrap();
                                            for consumer in consumers.iter() {
                                                consumer(returned.len());
                                            }
                                            break;
                                        }
                                        pending = returned;
                                        std::thread::sleep(Duration::from_millis(5));
                                    }
                                    Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                                        log::debug!("PTY reader: channel closed, exiting");
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("PTY reader error: {e}");
                            break;
                        }
                    }
                }
                log::debug!("PTY reader exited");
            })
            .map_err(|e| PtyError::spawn_failed(format!("failed to spawn reader thread: {e}")))?;

        drop(pair.slave);

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            child_pid,
            #[cfg(unix)]
            pgid,
            shutdown,
            reader_handle: Mutex::new(Some(reader_handle)),
            write_lock: tokio::sync::Mutex::new(()),
            consumers: RwLock::new(Vec::new()),
            exit_consumers: RwLock::new(Vec::new()),
            overflow_consumers,
            seq: AtomicU64::new(0),
            last_output_at: Mutex::new(Instant::now()),
            last_interrupt_at: Mutex::new(None),
            config,
            heartbeat_cancel: Notify::new(),
        });

        let drain_inner = inner.clone();
        tokio::spawn(async move {
            let mut aligner = ByteAligner::new();
            let mut exit_poll = tokio::time::interval(Duration::from_millis(250));
            exit_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut exit_reported = false;
            loop {
                tokio::select! {
                    data = rx.recv() => {
                        match data {
                            Some(bytes) => {
                                let aligned = aligner.align(&bytes);
                                if aligned.is_empty() {
                                    continue;
                                }
                                let seq = drain_inner.seq.fetch_add(1, Ordering::Relaxed);
                                *drain_inner.last_output_at.lock().unwrap() = Instant::now();
                                let consumers = drain_inner.consumers.read().unwrap();
                                for consumer in consumers.iter() {
                                    consumer(seq, &aligned);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = exit_poll.tick(), if !exit_reported => {
                        let status = drain_inner.child.lock().unwrap().try_wait().ok().flatten();
                        if let Some(status) = status {
                            exit_reported = true;
                            let code = status.exit_code() as i64;
                            let exit_consumers = drain_inner.exit_consumers.read().unwrap();
                            for consumer in exit_consumers.iter() {
                                consumer(Some(code));
                            }
                        }
                    }
                    _ = drain_inner.shutdown.notified() => break,
                }
            }
            log::debug!("PTY drain task exited");
        });

        log::info!("spawned PTY child pid={child_pid} command={}", request.command);

        Ok(Self { inner })
    }

    /// `onBytes(fn)`. Registers a consumer invoked with `(seq, bytes)` in
    /// registration order. Consumers registered after bytes have already
    /// been delivered simply miss those earlier chunks.
    pub fn on_bytes(&self, consumer: ByteConsumer) {
        self.inner.consumers.write().unwrap().push(consumer);
    }

    /// `onExit(fn)`. Registers a consumer invoked once with the child's
    /// exit code the first time the drain task's periodic `try_wait` poll
    /// observes the child has exited. A consumer registered after the
    /// child has already exited simply never fires.
    pub fn on_exit(&self, consumer: ExitConsumer) {
        self.inner.exit_consumers.write().unwrap().push(consumer);
    }

    /// `onOverflow(fn)`. Registers a consumer invoked whenever the reader
    /// thread drops a chunk because the bounded channel stayed full past
    /// `ExecutorConfig::stream_overflow_grace`.
    pub fn on_overflow(&self, consumer: OverflowConsumer) {
        self.inner.overflow_consumers.write().unwrap().push(consumer);
    }

    /// `write(bytes)`. Enqueues bytes to the child's controlling terminal
    /// unchanged — control sequences pass straight through.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let _guard = self.inner.write_lock.lock().await;
        self.write_locked(data)
    }

    fn write_locked(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut writer = self
            .inner
            .writer
            .lock()
            .map_err(|e| PtyError::write_failed(format!("writer lock poisoned: {e}")))?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::write_failed(format!("write failed: {e}")))?;
        writer
            .flush()
            .map_err(|e| PtyError::write_failed(format!("flush failed: {e}")))?;
        Ok(())
    }

    /// Emulates a human operator: writes `data` one byte at a time with a
    /// randomized inter-byte delay, then the submission sequence. Atomic
    /// per call — the write lock is held for the whole injection so no
    /// other writer can interleave.
    pub async fn inject(&self, data: &[u8]) -> Result<(), PtyError> {
        let _guard = self.inner.write_lock.lock().await;
        let range = self.inner.config.inter_byte_delay_ms.clone();
        for &byte in data {
            self.write_locked(&[byte])?;
            let delay_ms = if range.end > range.start {
                rand::thread_rng().gen_range(range.clone())
            } else {
                range.start
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let submission = self.inner.config.submission_sequence.clone();
        self.write_locked(&submission)
    }

    /// `interrupt()`. Sends the configured interrupt sequence. Idempotent
    /// within 100 ms: a second call inside that window is a no-op.
    pub async fn interrupt(&self) -> Result<(), PtyError> {
        {
            let mut last = self.inner.last_interrupt_at.lock().unwrap();
            if let Some(prev) = *last {
                if prev.elapsed() < Duration::from_millis(100) {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        let _guard = self.inner.write_lock.lock().await;
        let seq = self.inner.config.interrupt_sequence.clone();
        self.write_locked(&seq)
    }

    /// Resizes the PTY, propagating the new size to the child.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let master = self
            .inner
            .master
            .lock()
            .map_err(|e| PtyError::resize_failed(format!("master lock poisoned: {e}")))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::resize_failed(format!("resize failed: {e}")))?;
        Ok(())
    }

    /// `kill(grace)`. Sends SIGTERM to the whole process group, waits up to
    /// `grace`, then SIGKILL. Always releases the PTY before returning,
    /// even if signaling failed.
    pub async fn kill(&self, grace: Duration) -> Result<(), PtyError> {
        let pid = self.inner.child_pid;

        #[cfg(unix)]
        {
            let pgid = self.inner.pgid;
            let term_result = unsafe { libc::kill(-pgid, libc::SIGTERM) };
            if term_result != 0 {
                log::warn!(
                    "failed to SIGTERM pgid={pgid}: {}",
                    std::io::Error::last_os_error()
                );
            }

            let exited = tokio::time::timeout(grace, async {
                loop {
                    if unsafe { libc::kill(pid, 0) } != 0 {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;

            if exited.is_err() {
                let kill_result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
                if kill_result != 0 {
                    log::warn!(
                        "failed to SIGKILL pgid={pgid}: {}",
                        std::io::Error::last_os_error()
                    );
                }
                log::warn!("pid={pid} pgid={pgid} required SIGKILL after {grace:?} grace");
            }
        }

        #[cfg(windows)]
        {
            let result = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output();
            if let Err(e) = result {
                log::warn!("failed to taskkill pid={pid}: {e}");
            }
        }

        self.inner.shutdown.notify_one();
        self.inner.heartbeat_cancel.notify_waiters();

        // Dropping master/writer closes the PTY fd; the reader thread sees
        // EOF and exits on its own.
        drop(self.inner.writer.lock().ok());
        drop(self.inner.master.lock().ok());

        let reader_handle = self
            .inner
            .reader_handle
            .lock()
            .map_err(|e| log::warn!("reader handle lock poisoned during cleanup: {e}"))
            .ok()
            .and_then(|mut h| h.take());

        if let Some(handle) = reader_handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        log::info!("killed pid={pid}");
        Ok(())
    }

    /// `heartbeat(interval)`. Spawns a periodic task that writes the
    /// configured heartbeat bytes (empty by default) only when no output
    /// has been seen in the last `interval`. Self-cancels via `kill`'s
    /// shutdown notification, and also stops permanently once the child
    /// has produced its first output.
    pub fn heartbeat(&self, interval: Duration, payload: Vec<u8>) {
        let inner = self.inner.clone();
        let executor = self.clone();
        tokio::spawn(async move {
            let mut produced_output_once = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let idle_for = inner.last_output_at.lock().unwrap().elapsed();
                        if idle_for >= interval {
                            if produced_output_once {
                                break;
                            }
                            if !payload.is_empty() {
                                if executor.write(&payload).await.is_err() {
                                    break;
                                }
                            }
                        } else {
                            produced_output_once = true;
                        }
                    }
                    _ = inner.heartbeat_cancel.notified() => break,
                }
            }
        });
    }

    pub fn child_pid(&self) -> i32 {
        self.inner.child_pid
    }

    /// Duration since the last byte chunk was observed from the child.
    pub fn idle_for(&self) -> Duration {
        self.inner.last_output_at.lock().unwrap().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_aligner_holds_back_incomplete_codepoint() {
        let mut aligner = ByteAligner::new();
        let bytes = "✅".as_bytes().to_vec(); // 3 bytes
        let first = aligner.align(&bytes[..2]);
        assert!(first.is_empty());
        let second = aligner.align(&bytes[2..]);
        assert_eq!(second, bytes);
    }

    #[tokio::test]
    async fn spawn_echo_and_observe_output() {
        let request = SpawnRequest {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo hello; sleep 10".to_string()],
            ..Default::default()
        };
        let executor = Executor::start(request, ExecutorConfig::default()).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        executor.on_bytes(Box::new(move |_seq, bytes| {
            let _ = tx.send(bytes.to_vec());
        }));

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(chunk)) =
                tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
            {
                collected.extend(chunk);
                if String::from_utf8_lossy(&collected).contains("hello") {
                    break;
                }
            }
        }

        assert!(String::from_utf8_lossy(&collected).contains("hello"));
        executor.kill(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn on_exit_fires_with_child_exit_code() {
        let request = SpawnRequest {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            ..Default::default()
        };
        let executor = Executor::start(request, ExecutorConfig::default()).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Option<i64>>();
        executor.on_exit(Box::new(move |code| {
            let _ = tx.send(code);
        }));

        let code = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("on_exit did not fire in time")
            .expect("channel closed without a value");
        assert_eq!(code, Some(3));
        executor.kill(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn interrupt_is_idempotent_within_window() {
        let request = SpawnRequest {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 10".to_string()],
            ..Default::default()
        };
        let executor = Executor::start(request, ExecutorConfig::default()).unwrap();
        executor.interrupt().await.unwrap();
        executor.interrupt().await.unwrap(); // should be a no-op, not an error
        executor.kill(Duration::from_secs(1)).await.unwrap();
    }
}
