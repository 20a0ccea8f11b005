// tdds-runtime: factory, configuration and the reader/writer glue
//
// Binds the kernel (timers, sockets, event loop), the codec and the
// UDP transport into one runtime with two-phase initialisation, pool
// constraints resolved from configuration, and thin writer/reader
// bindings to the external RTPS and cache layers.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod buffers;
pub mod config;
pub mod constraints;
pub mod domain;
pub mod factory;
pub mod guid;
pub mod reader;
pub mod writer;

pub use buffers::DataBufferPools;
pub use config::{keys, Config};
pub use constraints::PoolConstraints;
pub use domain::{DomainRegistry, ParticipantId};
pub use factory::{pre_init, Runtime};
pub use guid::GuidPrefix;
pub use reader::{DataReader, LoanHandler, ReaderStats, SampleLifetime};
pub use writer::{DataWriter, RtpsSink, SampleRecord, WriterStats};
