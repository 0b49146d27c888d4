//! Real-time MPEG-2 transport stream processing pipeline.
//!
//! The crate streams fixed 188-byte TS packets through a linear chain of
//! pluggable stages (one input, processors, one output) coordinated by a
//! shared pre-allocated packet buffer, with one worker thread per stage.
//! On top of the pipeline it provides the PSI/SI section demultiplexer,
//! its packetizer inverse, typed table views (PAT, PMT, CAT, SDT) and a
//! DVB scrambler stage driving an external ECM generator.
//!
//! # Pipeline
//!
//! ```ignore
//! use tspipe_core::executor::{Pipeline, PipelineConfig};
//!
//! let handle = Pipeline::new(PipelineConfig::default())
//!     .input(my_input)
//!     .processor(my_processor)
//!     .output(my_output)
//!     .start()?;
//! handle.wait()?;
//! ```
//!
//! # Demux
//!
//! ```ignore
//! use tspipe_core::demux::SectionDemux;
//! use tspipe_core::packet::PidSet;
//!
//! let mut filter = PidSet::none();
//! filter.set(0x0000);
//! let mut demux = SectionDemux::new(Some(my_table_handler), None, filter);
//! demux.feed(&packet);
//! ```

pub mod demux;
pub mod error;
pub mod executor;
pub mod packet;
pub mod packetizer;
pub mod plugin;
pub mod reporter;
pub mod ring;
pub mod scramble;
pub mod section;
pub mod stage;
pub mod tables;

pub use error::{PipelineError, TableError};
pub use packet::{TsPacket, NULL_PACKET, TS_PACKET_SIZE};
