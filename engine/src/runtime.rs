//! Seam between the engine and the compute runtime it wraps

use crate::error::Result;
use retrace_shared::{Address, Call, ContentStore, Handle, ThreadId};

/// A compute runtime the engine can issue calls to.
///
/// During capture this is the runtime the application talks to; during
/// replay it is the runtime the trace is re-issued against. All reads are
/// blocking: the engine only reads memory it has to persist or restore.
pub trait Runtime {
    /// Execute `call`, filling its result slots (created handles, allocation
    /// results, mapped pointers, event outputs). Content references are
    /// resolved through `content`.
    fn dispatch(&mut self, call: &mut Call, content: &dyn ContentStore) -> Result<()>;

    /// Read `len` bytes of pointer-addressed memory. Device-only memory is
    /// copied to the host.
    fn read_memory(&mut self, ptr: Address, len: u64) -> Result<Vec<u8>>;

    fn write_memory(&mut self, ptr: Address, bytes: &[u8]) -> Result<()>;

    /// Read a byte range of a memory object
    fn read_buffer(&mut self, mem: Handle, offset: u64, len: u64) -> Result<Vec<u8>>;

    fn write_buffer(&mut self, mem: Handle, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Application thread subsequent calls are issued from
    fn set_thread(&mut self, _thread: ThreadId) {}

    /// Write-protect `[ptr, ptr + len)` so host writes to it are recorded at
    /// `page_size` granularity, forgetting writes seen so far. Returns false
    /// when the runtime cannot observe host writes to that range.
    fn protect_pages(&mut self, _ptr: Address, _len: u64, _page_size: u64) -> bool {
        false
    }

    /// Indices of the pages of a protected range the host wrote since it was
    /// last protected
    fn written_pages(&mut self, _ptr: Address, _len: u64, _page_size: u64) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }

    /// Stop recording writes to a protected range
    fn unprotect_pages(&mut self, _ptr: Address) {}
}
