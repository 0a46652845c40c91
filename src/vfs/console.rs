use std::io::{Read, Write};
use std::sync::Arc;

use farm_abi::{Errno, FdResult, Fdstat, Filestat, Filetype};
use parking_lot::Mutex;

use crate::fd::Fd;

enum Source {
    Bytes { data: Vec<u8>, pos: usize },
    Stdin,
}

/// A readable character device.
pub struct ConsoleIn {
    source: Source,
}

impl ConsoleIn {
    /// Serve `data`, then end of file.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            source: Source::Bytes {
                data: data.into(),
                pos: 0,
            },
        }
    }

    pub fn empty() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// Read from the host process's standard input.
    pub fn stdin() -> Self {
        Self { source: Source::Stdin }
    }
}

impl Fd for ConsoleIn {
    fn fd_fdstat_get(&self) -> FdResult<Fdstat> {
        Ok(Fdstat::new(Filetype::CharacterDevice, 0))
    }

    fn fd_filestat_get(&self) -> FdResult<Filestat> {
        Ok(Filestat::new(0, Filetype::CharacterDevice, 0))
    }

    fn fd_read(&mut self, len: usize) -> FdResult<Vec<u8>> {
        match &mut self.source {
            Source::Bytes { data, pos } => {
                let end = (*pos + len).min(data.len());
                let chunk = data[*pos..end].to_vec();
                *pos = end;
                Ok(chunk)
            }
            Source::Stdin => {
                let mut buf = vec![0u8; len];
                let n = std::io::stdin().read(&mut buf).map_err(|_| Errno::IO)?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }
}

enum Sink {
    Stdout,
    Stderr,
    Capture(Arc<Mutex<Vec<u8>>>),
}

/// A writable character device.
pub struct ConsoleOut {
    sink: Sink,
}

impl ConsoleOut {
    pub fn stdout() -> Self {
        Self { sink: Sink::Stdout }
    }

    pub fn stderr() -> Self {
        Self { sink: Sink::Stderr }
    }

    /// Collect everything written into a shared buffer.
    pub fn capture() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sink: Sink::Capture(Arc::clone(&buf)),
            },
            buf,
        )
    }
}

impl Fd for ConsoleOut {
    fn fd_fdstat_get(&self) -> FdResult<Fdstat> {
        Ok(Fdstat::new(Filetype::CharacterDevice, 0))
    }

    fn fd_filestat_get(&self) -> FdResult<Filestat> {
        Ok(Filestat::new(0, Filetype::CharacterDevice, 0))
    }

    fn fd_write(&mut self, data: &[u8]) -> FdResult<u32> {
        match &self.sink {
            Sink::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(data).and_then(|()| out.flush()).map_err(|_| Errno::IO)?
            }
            Sink::Stderr => std::io::stderr().write_all(data).map_err(|_| Errno::IO)?,
            Sink::Capture(buf) => buf.lock().extend_from_slice(data),
        }
        Ok(data.len() as u32)
    }

    fn fd_sync(&mut self) -> FdResult<()> {
        if let Sink::Stdout = self.sink {
            std::io::stdout().flush().map_err(|_| Errno::IO)?;
        }
        Ok(())
    }
}
