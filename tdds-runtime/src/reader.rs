//! Data-reader glue: from a received payload to the user listener.
//!
//! Incoming samples reach the user either as a reference into the
//! receive buffer (loan: the handler runs inline on the worker, the
//! node borrows the datagram) or as a materialised copy queued behind
//! the notification queue, per the reader's lifetime policy.

use crate::factory::Runtime;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tdds_cdr::encaps;
use tdds_cdr::{DynValue, TypeSupport};
use tdds_kernel::error::{DdsError, Result};
use tdds_kernel::event::EntityHandle;

/// Notifier class used for reader status callbacks.
pub const READER_NOTIFIER_CLASS: usize = 0;

/// Status bit delivered when a sample is queued.
pub const STATUS_DATA_AVAILABLE: u32 = 1;

/// Sample lifetime policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLifetime {
    /// Hand the sample to the loan handler as a borrow of the receive
    /// buffer; nothing survives the callback.
    Loan,
    /// Materialise an owned copy and deliver through the notification
    /// queue.
    Copy,
}

/// Inline handler for loaned samples.
pub type LoanHandler = Arc<dyn Fn(&DynValue<'_>) + Send + Sync>;

/// Reader-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub received: u64,
    pub rejected: u64,
}

/// Thin reader binding the codec to the notification queue.
pub struct DataReader {
    runtime: Arc<Runtime>,
    ts: TypeSupport,
    entity: EntityHandle,
    lifetime: SampleLifetime,
    loan_handler: RwLock<Option<LoanHandler>>,
    samples: Mutex<VecDeque<DynValue<'static>>>,
    stats: Mutex<ReaderStats>,
}

impl DataReader {
    pub fn new(
        runtime: Arc<Runtime>,
        ts: TypeSupport,
        entity: EntityHandle,
        lifetime: SampleLifetime,
    ) -> DataReader {
        DataReader {
            runtime,
            ts,
            entity,
            lifetime,
            loan_handler: RwLock::new(None),
            samples: Mutex::new(VecDeque::new()),
            stats: Mutex::new(ReaderStats::default()),
        }
    }

    pub fn set_loan_handler(&self, handler: LoanHandler) {
        *self.loan_handler.write() = Some(handler);
    }

    pub fn entity(&self) -> EntityHandle {
        self.entity
    }

    /// Feed one received payload (encapsulation header included) into
    /// the reader. Called from the transport receive path.
    pub fn on_data(&self, payload: &[u8]) -> Result<()> {
        let (mutable, swap) = encaps::parse(payload)?;
        if mutable != self.ts.ty().is_mutable() {
            self.stats.lock().rejected += 1;
            return Err(DdsError::bad_parameter(
                "encapsulation does not match type extensibility",
            ));
        }
        let body = &payload[encaps::HEADER_SIZE..];
        match self.lifetime {
            SampleLifetime::Loan => {
                let value = self
                    .ts
                    .dynamic_data(body, encaps::HEADER_SIZE, false, false, swap)?;
                if let Some(handler) = self.loan_handler.read().clone() {
                    handler(&value);
                }
            }
            SampleLifetime::Copy => {
                // into_owned detaches the parse borrow for the queue.
                let value = self
                    .ts
                    .dynamic_data(body, encaps::HEADER_SIZE, false, false, swap)?
                    .into_owned();
                self.samples.lock().push_back(value);
                self.runtime.dispatcher.notify(
                    READER_NOTIFIER_CLASS,
                    self.entity,
                    STATUS_DATA_AVAILABLE,
                );
            }
        }
        self.stats.lock().received += 1;
        Ok(())
    }

    /// Take the oldest queued sample.
    pub fn take(&self) -> Option<DynValue<'static>> {
        self.samples.lock().pop_front()
    }

    pub fn queued(&self) -> usize {
        self.samples.lock().len()
    }

    /// Drop queued notifications for this reader before teardown.
    pub fn purge(&self) -> bool {
        self.runtime
            .dispatcher
            .purge_notifications(self.entity, 1 << STATUS_DATA_AVAILABLE, false)
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{DataWriter, RtpsSink};
    use parking_lot::Mutex as PlMutex;
    use std::borrow::Cow;
    use tdds_cdr::struct_value;
    use tdds_cdr::types::{build, Extensibility, Member, PrimitiveKind};

    fn test_type() -> TypeSupport {
        TypeSupport::from_type(build::structure(
            "msg",
            Extensibility::Final,
            vec![
                Member::new("name", 0, build::string(0)).key(),
                Member::new("value", 1, build::primitive(PrimitiveKind::Int32)),
            ],
        ))
    }

    fn encode(ts: &TypeSupport, v: &DynValue<'_>) -> Vec<u8> {
        let mut payload = Vec::new();
        ts.marshall(&mut payload, encaps::HEADER_SIZE, v, false, false, false)
            .unwrap();
        let mut out = encaps::header(ts.ty().is_mutable(), false).to_vec();
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn copy_reader_queues_and_notifies() {
        let rt = Runtime::init().unwrap();
        rt.dispatcher.attach_notifier(READER_NOTIFIER_CLASS, Arc::new(|_, _| {}));
        let r = DataReader::new(rt.clone(), test_type(), 71, SampleLifetime::Copy);
        let v = struct_value(vec![
            (0, DynValue::Str(Cow::Borrowed("a"))),
            (1, DynValue::Int32(5)),
        ]);
        r.on_data(&encode(&test_type(), &v)).unwrap();
        assert_eq!(r.queued(), 1);
        let got = r.take().unwrap();
        assert_eq!(got.field(1).and_then(|f| f.as_i32()), Some(5));
        assert!(r.take().is_none());
        assert!(r.purge());
        rt.shutdown();
    }

    #[test]
    fn loan_reader_runs_handler_inline() {
        let rt = Runtime::init().unwrap();
        let r = DataReader::new(rt.clone(), test_type(), 72, SampleLifetime::Loan);
        let seen = Arc::new(PlMutex::new(None));
        let seen2 = seen.clone();
        r.set_loan_handler(Arc::new(move |v| {
            *seen2.lock() = v.field(0).and_then(|f| f.as_str()).map(String::from);
        }));
        let v = struct_value(vec![
            (0, DynValue::Str(Cow::Borrowed("loaned"))),
            (1, DynValue::Int32(9)),
        ]);
        r.on_data(&encode(&test_type(), &v)).unwrap();
        assert_eq!(seen.lock().as_deref(), Some("loaned"));
        assert_eq!(r.queued(), 0);
        rt.shutdown();
    }

    #[test]
    fn extensibility_mismatch_rejected() {
        let rt = Runtime::init().unwrap();
        let r = DataReader::new(rt.clone(), test_type(), 73, SampleLifetime::Copy);
        let mut bogus = encaps::header(true, false).to_vec();
        bogus.extend_from_slice(&[0u8; 8]);
        assert!(r.on_data(&bogus).is_err());
        assert_eq!(r.stats().rejected, 1);
        rt.shutdown();
    }

    #[test]
    fn writer_to_reader_end_to_end() {
        let rt = Runtime::init().unwrap();
        let ts = test_type();
        let reader = Arc::new(DataReader::new(
            rt.clone(),
            ts.clone(),
            74,
            SampleLifetime::Copy,
        ));
        rt.dispatcher.attach_notifier(READER_NOTIFIER_CLASS, Arc::new(|_, _| {}));
        let r2 = reader.clone();
        let sink: RtpsSink = Arc::new(move |rec| {
            let mut flat = Vec::new();
            for c in &rec.message.chunks {
                flat.extend_from_slice(c);
            }
            r2.on_data(&flat).unwrap();
        });
        let writer = DataWriter::new(rt.clone(), ts, sink);
        writer
            .write(&struct_value(vec![
                (0, DynValue::Str(Cow::Borrowed("e2e"))),
                (1, DynValue::Int32(77)),
            ]))
            .unwrap();
        let got = reader.take().unwrap();
        assert_eq!(got.field(0).and_then(|f| f.as_str()), Some("e2e"));
        assert_eq!(got.field(1).and_then(|f| f.as_i32()), Some(77));
        rt.shutdown();
    }
}
