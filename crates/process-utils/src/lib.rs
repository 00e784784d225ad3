//! Child-process helpers for running external encoders.
//!
//! [`tokio_command`] builds a command that opens no console window on
//! Windows. [`BoundedBuffer`] is a capped sink for child output, and
//! [`drain_bounded`] pumps a pipe into such a sink until EOF without ever
//! growing past the cap.

#[cfg(feature = "tokio")]
use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Default cap for captured child-process output (32 KiB).
pub const DEFAULT_CAPTURE_LIMIT: usize = 32 * 1024;

/// Apply the Windows `CREATE_NO_WINDOW` flag to spawned encoder processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Byte sink with a hard capacity.
///
/// Bytes pushed after the cap is reached are counted and dropped, never
/// buffered, so runaway tool output cannot grow memory.
#[derive(Debug)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    cap: usize,
    discarded: u64,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(8192)),
            cap,
            discarded: 0,
        }
    }

    /// Append as much of `chunk` as fits; the rest is discarded.
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        let take = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        self.discarded = self
            .discarded
            .saturating_add((chunk.len() - take) as u64);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Number of bytes dropped because the cap was reached.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn is_truncated(&self) -> bool {
        self.discarded > 0
    }

    /// Lossy UTF-8 view of the captured bytes.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

impl Default for BoundedBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_LIMIT)
    }
}

/// Read `reader` to EOF, pushing every chunk into the shared `sink`.
///
/// The reader is always drained completely (so the child never blocks on a
/// full pipe); only the first `sink.capacity()` bytes are retained.
/// Returns the total number of bytes read.
#[cfg(feature = "tokio")]
pub async fn drain_bounded<R>(
    mut reader: R,
    sink: std::sync::Arc<parking_lot::Mutex<BoundedBuffer>>,
) -> std::io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut chunk = [0u8; 4096];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        sink.lock().push(&chunk[..n]);
    }
    Ok(total)
}
