pub mod stream;
pub mod block;
pub mod record;
pub mod codec;
pub mod crypto;
pub mod attr;
pub mod dedup;
pub mod error;
pub mod context;
pub mod device;
pub mod io_stream;
pub mod dispatch;
pub mod filter;
pub mod extract;
pub mod migrate;

pub use stream::{StreamKind, StreamTag};
pub use block::{Block, BlockHeader, BlockOptions, HeaderLayout, encode_block, decode_header};
pub use record::{Record, RecordReader, pack};
pub use codec::{CodecId, get_codec};
pub use context::{CancelToken, JobOptions, JobStatus, Summary};
pub use device::{BlockSink, BlockSource, MemoryVolume, VolumeChain, VolumeFile};
pub use io_stream::{VolumeReader, VolumeWriter};
pub use dispatch::{Action, StreamDispatcher};
pub use extract::{ExtractionPipeline, LocalFs, extract_volume};
pub use migrate::{MigrationPipeline, NewSession};
pub use error::{Aborted, Error, Result};
