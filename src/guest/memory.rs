//! Guest memory access for host functions.

use thiserror::Error;
use wasmtime::{Caller, Memory, MemoryAccessError};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("module exports no memory")]
    NoMemory,

    #[error("{0} iovecs do not fit in guest memory")]
    TooLarge(u32),

    #[error("guest memory access out of bounds: {0}")]
    Access(#[from] MemoryAccessError),
}

/// A host call's view of the store and the guest's exported memory.
pub struct Ctx<'a, T> {
    caller: Caller<'a, T>,
}

impl<'a, T> Ctx<'a, T> {
    pub fn new(caller: Caller<'a, T>) -> Self {
        Self { caller }
    }

    pub fn data(&self) -> &T {
        self.caller.data()
    }

    pub fn data_mut(&mut self) -> &mut T {
        self.caller.data_mut()
    }

    fn memory(&mut self) -> Result<Memory, MemoryError> {
        self.caller
            .get_export("memory")
            .and_then(|e| e.into_memory())
            .ok_or(MemoryError::NoMemory)
    }

    pub fn read_bytes(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        let memory = self.memory()?;
        let mut buffer = vec![0u8; len as usize];
        memory.read(&self.caller, ptr as usize, &mut buffer)?;
        Ok(buffer)
    }

    pub fn write_bytes(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let memory = self.memory()?;
        memory.write(&mut self.caller, ptr as usize, bytes)?;
        Ok(())
    }

    pub fn read_u32(&mut self, ptr: u32) -> Result<u32, MemoryError> {
        let mut word = [0u8; 4];
        let memory = self.memory()?;
        memory.read(&self.caller, ptr as usize, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, ptr: u32, value: u64) -> Result<(), MemoryError> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    /// Decode `count` `(buf, buf_len)` pairs starting at `ptr`.
    pub fn read_iovecs(&mut self, ptr: u32, count: u32) -> Result<Vec<(u32, u32)>, MemoryError> {
        let len = count.checked_mul(8).ok_or(MemoryError::TooLarge(count))?;
        let raw = self.read_bytes(ptr, len)?;
        Ok(raw
            .chunks_exact(8)
            .map(|pair| {
                let buf = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
                let len = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
                (buf, len)
            })
            .collect())
    }

    /// Read `count` constant iovecs and concatenate their contents.
    pub fn gather(&mut self, ptr: u32, count: u32) -> Result<Vec<u8>, MemoryError> {
        let mut data = Vec::new();
        for (buf, len) in self.read_iovecs(ptr, count)? {
            data.extend(self.read_bytes(buf, len)?);
        }
        Ok(data)
    }

    /// Spread `data` over `iovecs` in order.
    pub fn scatter(&mut self, iovecs: &[(u32, u32)], data: &[u8]) -> Result<(), MemoryError> {
        let mut rest = data;
        for &(buf, len) in iovecs {
            if rest.is_empty() {
                break;
            }
            let n = rest.len().min(len as usize);
            self.write_bytes(buf, &rest[..n])?;
            rest = &rest[n..];
        }
        Ok(())
    }
}
