//! Trace container encoding.
//!
//! Uses bincode with an explicit config so recorder and player always use the
//! same encoding (fixint for lengths and enum tags), avoiding version skew.
//!
//! # Layout
//!
//! ```text
//! magic "RTRC" | u32 format version | u32 header length | header (bincode)
//! { u32 record length | record (bincode) }*
//! ```
//!
//! All integers in the framing are little-endian. Records are read strictly in
//! order; there is no index, so a truncated final frame is reported as an error
//! rather than silently dropped.

use crate::types::calls::Call;
use crate::types::handles::ThreadId;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

/// File magic
pub const TRACE_MAGIC: [u8; 4] = *b"RTRC";

/// Format version
pub const FORMAT_VERSION: u32 = 1;

/// Upper bound for a single framed record; guards allocation on corrupt input
pub const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Single bincode config for the trace format.
fn wire_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a trace file (bad magic)")]
    InvalidMagic,

    #[error("unsupported trace format version {0}")]
    UnsupportedVersion(u32),

    #[error("record {index} exceeds maximum length ({len} bytes)")]
    RecordTooLarge { index: u64, len: u32 },

    #[error("truncated record after {0} complete records")]
    Truncated(u64),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Metadata written once at the start of a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub version: u32,

    /// RFC 3339 timestamp of the recording
    pub recorded_at: String,

    /// Free-form description of the recording environment
    pub description: String,

    /// Index of the first application call kept when the trace was truncated.
    /// A trace with this set starts with a synthetic state-restoration prefix
    /// and must be torn down when replay ends.
    pub subcapture_start: Option<u64>,
}

impl TraceHeader {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            version: FORMAT_VERSION,
            recorded_at: chrono::Utc::now().to_rfc3339(),
            description: description.into(),
            subcapture_start: None,
        }
    }

    pub fn is_subcapture(&self) -> bool {
        self.subcapture_start.is_some()
    }
}

/// Who produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordOrigin {
    /// Intercepted from the application
    Application,
    /// Emitted by the engine around application calls (updates, thread markers)
    Injected,
    /// Synthesized by the subcapture state reconstructor
    Reconstruction,
    /// Synthesized by the subcapture teardown pass
    Teardown,
}

/// One persisted call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Position in the stream, starting at 0
    pub index: u64,

    /// Application thread that issued the call
    pub thread: ThreadId,

    pub origin: RecordOrigin,

    pub call: Call,
}

/// Append-only trace writer
pub struct TraceWriter<W: Write> {
    inner: W,
    next_index: u64,
}

impl<W: Write> TraceWriter<W> {
    /// Write the container preamble and header
    pub fn new(mut inner: W, header: &TraceHeader) -> Result<Self, WireError> {
        let header_bytes = wire_bincode().serialize(header)?;
        inner.write_all(&TRACE_MAGIC)?;
        inner.write_all(&FORMAT_VERSION.to_le_bytes())?;
        inner.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        inner.write_all(&header_bytes)?;
        Ok(Self {
            inner,
            next_index: 0,
        })
    }

    /// Append a call, assigning it the next stream index
    pub fn append(
        &mut self,
        thread: ThreadId,
        origin: RecordOrigin,
        call: Call,
    ) -> Result<u64, WireError> {
        let index = self.next_index;
        let record = TraceRecord {
            index,
            thread,
            origin,
            call,
        };
        let bytes = wire_bincode().serialize(&record)?;
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        if len > MAX_RECORD_LEN {
            return Err(WireError::RecordTooLarge { index, len });
        }
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&bytes)?;
        self.next_index += 1;
        Ok(index)
    }

    pub fn records_written(&self) -> u64 {
        self.next_index
    }

    pub fn flush(&mut self) -> Result<(), WireError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Sequential trace reader
pub struct TraceReader<R: Read> {
    inner: R,
    header: TraceHeader,
    records_read: u64,
}

impl<R: Read> TraceReader<R> {
    /// Validate the preamble and decode the header
    pub fn open(mut inner: R) -> Result<Self, WireError> {
        let mut magic = [0u8; 4];
        inner.read_exact(&mut magic)?;
        if magic != TRACE_MAGIC {
            return Err(WireError::InvalidMagic);
        }
        let version = read_u32(&mut inner)?;
        if version != FORMAT_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let header_len = read_u32(&mut inner)?;
        if header_len > MAX_RECORD_LEN {
            return Err(WireError::RecordTooLarge {
                index: 0,
                len: header_len,
            });
        }
        let mut header_bytes = vec![0u8; header_len as usize];
        inner.read_exact(&mut header_bytes)?;
        let header: TraceHeader = wire_bincode().deserialize(&header_bytes)?;
        Ok(Self {
            inner,
            header,
            records_read: 0,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Next record, or `None` at a clean end of stream
    pub fn next_record(&mut self) -> Result<Option<TraceRecord>, WireError> {
        let mut len_bytes = [0u8; 4];
        match read_full(&mut self.inner, &mut len_bytes)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(WireError::Truncated(self.records_read)),
        }
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD_LEN {
            return Err(WireError::RecordTooLarge {
                index: self.records_read,
                len,
            });
        }
        let mut bytes = vec![0u8; len as usize];
        if read_full(&mut self.inner, &mut bytes)? != bytes.len() {
            return Err(WireError::Truncated(self.records_read));
        }
        let record: TraceRecord = wire_bincode().deserialize(&bytes)?;
        self.records_read += 1;
        Ok(Some(record))
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<TraceRecord, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32, WireError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
