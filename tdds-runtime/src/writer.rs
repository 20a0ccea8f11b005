//! Data-writer glue: from a user sample to a chunked RTPS hand-off.
//!
//! A write sizes the sample, allocates pool-backed chunks, marshalls
//! behind a CDR encapsulation header and passes the chunk list to the
//! registered RTPS sink. Chunks are recycled once the sink returns.
//! Samples submitted to the same writer are handed over in submission
//! order.

use crate::factory::Runtime;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use tdds_cdr::encaps;
use tdds_cdr::{DynValue, TypeSupport};
use tdds_kernel::error::{DdsError, Result};
use tdds_kernel::time::{now_ftime, FTime};
use tdds_transport::ChunkedMessage;

/// One sample handed to the RTPS layer.
pub struct SampleRecord<'a> {
    pub seq: u64,
    pub timestamp: FTime,
    /// Canonical packed key stream of the sample, when the type is
    /// keyed.
    pub key: Option<Vec<u8>>,
    pub message: &'a ChunkedMessage,
}

/// The external RTPS hand-off edge.
pub type RtpsSink = Arc<dyn Fn(&SampleRecord<'_>) + Send + Sync>;

/// Writer-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub bytes: u64,
    pub rejected: u64,
}

/// Thin writer binding a type to the transport chunks and RTPS edge.
pub struct DataWriter {
    runtime: Arc<Runtime>,
    ts: TypeSupport,
    sink: RtpsSink,
    state: Mutex<WriterState>,
}

struct WriterState {
    seq: u64,
    stats: WriterStats,
}

impl DataWriter {
    pub fn new(runtime: Arc<Runtime>, ts: TypeSupport, sink: RtpsSink) -> DataWriter {
        DataWriter {
            runtime,
            ts,
            sink,
            state: Mutex::new(WriterState {
                seq: 0,
                stats: WriterStats::default(),
            }),
        }
    }

    pub fn type_support(&self) -> &TypeSupport {
        &self.ts
    }

    /// Write a dynamic-data sample.
    pub fn write(&self, value: &DynValue<'_>) -> Result<u64> {
        let mutable = self.ts.ty().is_mutable();
        let size = self
            .ts
            .marshalled_size(encaps::HEADER_SIZE, value, false, false)?;
        if size as u32 > self.runtime.max_sample_size {
            self.state.lock().stats.rejected += 1;
            return Err(DdsError::out_of_resources("sample exceeds maximum size"));
        }

        let mut payload = Vec::new();
        let written = self
            .ts
            .marshall(&mut payload, encaps::HEADER_SIZE, value, false, false, false)?;
        debug_assert_eq!(written, size);

        let keyed = self
            .ts
            .ty()
            .as_struct()
            .map(|st| st.keyed())
            .unwrap_or(false);
        let key = if keyed {
            Some(
                self.ts
                    .key_fields(&payload, encaps::HEADER_SIZE, false, false)?,
            )
        } else {
            None
        };

        // Assemble pool-backed chunks: encapsulation header first, the
        // payload split at the largest buffer class.
        let mut chunks: SmallVec<[Vec<u8>; 4]> = SmallVec::new();
        let mut header = self.runtime.buffers.alloc(encaps::HEADER_SIZE)?;
        header.extend_from_slice(&encaps::header(mutable, false));
        chunks.push(header);
        let max_chunk = self.runtime.buffers.max_chunk();
        for part in payload.chunks(max_chunk) {
            let mut buf = self.runtime.buffers.alloc(part.len())?;
            buf.extend_from_slice(part);
            chunks.push(buf);
        }
        let message = ChunkedMessage { chunks };

        // Hold the writer lock across the hand-off to preserve
        // submission order.
        let mut st = self.state.lock();
        st.seq += 1;
        let seq = st.seq;
        {
            let record = SampleRecord {
                seq,
                timestamp: now_ftime(),
                key,
                message: &message,
            };
            (self.sink)(&record);
        }
        st.stats.written += 1;
        st.stats.bytes += message.total_len() as u64;
        drop(st);

        for chunk in message.chunks {
            self.runtime.buffers.recycle(chunk);
        }
        Ok(seq)
    }

    /// Write a native sample through the static data path.
    ///
    /// # Safety
    /// `data` must satisfy the codec's native-layout contract for this
    /// writer's type.
    pub unsafe fn write_native(&self, data: *const u8) -> Result<u64> {
        let v = tdds_cdr::native::native_to_value(data, self.ts.ty())?;
        self.write(&v)
    }

    pub fn stats(&self) -> WriterStats {
        self.state.lock().stats
    }
}
