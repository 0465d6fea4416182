//! PTY plumbing for the terminal worker, built on portable-pty.
//!
//! PTY reads and writes are blocking, so each handle owns a pair of
//! background threads bridged to async code through tokio channels.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const READ_BUFFER_SIZE: usize = 4096;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// An interactive shell running on a PTY, with async read/write access.
pub struct PtyHandle {
    write_tx: mpsc::Sender<Vec<u8>>,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
    /// Kept for resize (SIGWINCH); Mutex so the handle stays Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    reader_thread: Option<std::thread::JoinHandle<()>>,
    writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl PtyHandle {
    /// Spawn `shell` on a fresh PTY at the given size and start the I/O
    /// bridge threads.
    pub fn spawn(shell: &str, size: TermSize) -> Result<Self> {
        if shell.is_empty() {
            anyhow::bail!("shell must not be empty");
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .context("failed to open PTY")?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn shell '{}'", shell))?;

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(64);

        let reader_shutdown = shutdown.clone();
        let reader_thread = std::thread::spawn(move || {
            Self::reader_loop(reader, read_tx, reader_shutdown);
        });
        let writer_thread = std::thread::spawn(move || {
            Self::writer_loop(writer, write_rx);
        });

        Ok(Self {
            write_tx,
            read_rx: tokio::sync::Mutex::new(read_rx),
            shutdown,
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            reader_thread: Some(reader_thread),
            writer_thread: Some(writer_thread),
        })
    }

    /// Resize the PTY; the kernel delivers SIGWINCH to the shell.
    pub fn resize(&self, size: TermSize) -> Result<()> {
        self.master
            .lock()
            .map_err(|_| anyhow::anyhow!("master PTY mutex poisoned"))?
            .resize(size.into())
            .context("failed to resize PTY")
    }

    /// Queue bytes for the shell's stdin.
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.write_tx
            .send(data)
            .await
            .context("PTY input channel closed")
    }

    /// Next chunk of shell output, or `None` once the PTY has closed.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.read_rx.lock().await.recv().await
    }

    /// Non-blocking liveness check on the shell process.
    pub fn has_exited(&self) -> bool {
        self.child
            .lock()
            .ok()
            .and_then(|mut child| child.try_wait().ok())
            .map(|status| status.is_some())
            .unwrap_or(true)
    }

    /// Kill the shell and stop the bridge threads.
    pub async fn shutdown(&self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.kill() {
                debug!("shell already gone on shutdown: {}", e);
            }
            // Reap so the process doesn't linger as a zombie.
            let _ = child.try_wait();
        }

        self.shutdown.store(true, Ordering::SeqCst);
        self.read_rx.lock().await.close();
    }

    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        read_tx: mpsc::Sender<Vec<u8>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if read_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => {
                    warn!("PTY read error: {}", e);
                    break;
                }
            }
        }
    }

    fn writer_loop(mut writer: Box<dyn Write + Send>, mut write_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(data) = write_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                error!("PTY write error: {}", e);
                break;
            }
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.try_wait();
        }
        self.shutdown.store(true, Ordering::SeqCst);

        // Don't join the threads: the reader may be parked in a blocking
        // read that only returns when the PTY fd closes, which happens
        // when the master is dropped right after this. The writer exits
        // once write_tx is dropped.
        if let Some(handle) = &self.reader_thread {
            if !handle.is_finished() {
                debug!("PTY reader thread will stop on PTY close");
            }
        }
        if let Some(handle) = &self.writer_thread {
            if !handle.is_finished() {
                debug!("PTY writer thread will stop on channel close");
            }
        }
    }
}
