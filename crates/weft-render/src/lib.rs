//! weft-render: typed render resource handles, queue masks and the
//! drifter-backed command-stream encoder for the `weft` job system.
//!
//! Rendering work submitted to the job system records its GPU commands into
//! a [`CommandStream`]: a packed sequence of variable-length records written
//! into the recording fiber's drifter arena. Streams are cheap to build in
//! parallel (one per fiber, no locks, bump allocation) and are later handed
//! to a rendering backend for compilation into real API command buffers; the
//! backends themselves live outside this crate.
//!
//! ```
//! use weft::Drift;
//! use weft_render::{
//!     records::{Draw, FillBuffer},
//!     Buffer, CommandStream, DeviceMask,
//! };
//!
//! let drift = Drift::new();
//! let mut stream = CommandStream::new(&drift, DeviceMask::PRIMARY);
//! stream.fill_buffer(FillBuffer {
//!     dst: Buffer::pack(1, 1),
//!     dst_offset: 0,
//!     size: 64,
//!     data: 0x41,
//! });
//! stream.draw(Draw { vertex_count: 3, instance_count: 1, ..Draw::default() });
//!
//! assert_eq!(stream.records().count(), 2);
//! ```
//!
//! Inside a fiber the drifter comes from the job system instead:
//! `weft::with_drift(|drift| CommandStream::new(drift, mask))`.

mod handle;
mod queue;
pub mod records;
mod stream;

pub use handle::{
    Buffer, Bvh, CompiledCommands, QueryPool, RawId, Sampler, Shader, ShaderPipeline, Swapchain,
    Texture, TextureView,
};
pub use queue::{
    DeviceMask, Queue, QueueKind, QueueMask, MAX_COMPUTE_QUEUE_COUNT, MAX_DEVICES,
    MAX_TRANSFER_QUEUE_COUNT,
};
pub use records::RecordType;
pub use stream::{
    CommandStream, RecordHeader, RecordRef, Records, RECORD_ALIGN, RECORD_HEADER_SIZE,
};
