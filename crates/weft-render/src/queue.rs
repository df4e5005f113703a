//! Device queues and masks.
//!
//! Queue kinds compose into bitmasks used to schedule command streams; the
//! per-device queue index layout is fixed so a `Queue` value is meaningful
//! across backends: main at 0, compute at 1..9, transfer at 9..11, sparse
//! binding at 11, video decode/encode at 12/13.

/// Bitmask of queue kinds, accumulated per command stream.
pub type QueueMask = u8;

/// A queue kind. The discriminants are the mask bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QueueKind {
    /// No scheduling preference; contributes nothing to the stream mask.
    #[default]
    Any = 0,
    Main = 1 << 0,
    Compute = 1 << 1,
    Transfer = 1 << 2,
    SparseBinding = 1 << 3,
    VideoDecode = 1 << 4,
    VideoEncode = 1 << 5,
}

impl QueueKind {
    #[inline]
    pub const fn mask(self) -> QueueMask {
        self as QueueMask
    }
}

pub const MAX_COMPUTE_QUEUE_COUNT: usize = 8;
pub const MAX_TRANSFER_QUEUE_COUNT: usize = 2;

pub const QUEUE_MAIN_BEGIN_INDEX: i8 = 0;
pub const QUEUE_COMPUTE_BEGIN_INDEX: i8 = 1;
pub const QUEUE_TRANSFER_BEGIN_INDEX: i8 =
    QUEUE_COMPUTE_BEGIN_INDEX + MAX_COMPUTE_QUEUE_COUNT as i8;
pub const QUEUE_SPARSE_BINDING_BEGIN_INDEX: i8 =
    QUEUE_TRANSFER_BEGIN_INDEX + MAX_TRANSFER_QUEUE_COUNT as i8;
pub const QUEUE_VIDEO_DECODE_BEGIN_INDEX: i8 = QUEUE_SPARSE_BINDING_BEGIN_INDEX + 1;
pub const QUEUE_VIDEO_ENCODE_BEGIN_INDEX: i8 = QUEUE_SPARSE_BINDING_BEGIN_INDEX + 2;

/// A concrete queue of a device: kind plus the fixed per-device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Queue {
    pub kind: QueueKind,
    pub index: i8,
}

impl Queue {
    pub const MAIN: Queue = Queue {
        kind: QueueKind::Main,
        index: QUEUE_MAIN_BEGIN_INDEX,
    };
    pub const SPARSE_BINDING: Queue = Queue {
        kind: QueueKind::SparseBinding,
        index: QUEUE_SPARSE_BINDING_BEGIN_INDEX,
    };
    pub const VIDEO_DECODE: Queue = Queue {
        kind: QueueKind::VideoDecode,
        index: QUEUE_VIDEO_DECODE_BEGIN_INDEX,
    };
    pub const VIDEO_ENCODE: Queue = Queue {
        kind: QueueKind::VideoEncode,
        index: QUEUE_VIDEO_ENCODE_BEGIN_INDEX,
    };

    /// One of the compute queues.
    ///
    /// # Panics
    ///
    /// Panics if `index >= MAX_COMPUTE_QUEUE_COUNT`.
    pub const fn compute(index: usize) -> Queue {
        assert!(index < MAX_COMPUTE_QUEUE_COUNT);
        Queue {
            kind: QueueKind::Compute,
            index: QUEUE_COMPUTE_BEGIN_INDEX + index as i8,
        }
    }

    /// One of the transfer queues.
    ///
    /// # Panics
    ///
    /// Panics if `index >= MAX_TRANSFER_QUEUE_COUNT`.
    pub const fn transfer(index: usize) -> Queue {
        assert!(index < MAX_TRANSFER_QUEUE_COUNT);
        Queue {
            kind: QueueKind::Transfer,
            index: QUEUE_TRANSFER_BEGIN_INDEX + index as i8,
        }
    }
}

/// Rendering devices a stream broadcasts to, one bit per logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct DeviceMask(pub u32);

/// Device count is bounded by the mask width.
pub const MAX_DEVICES: usize = 32;
const _: () = assert!(MAX_DEVICES.is_power_of_two());

impl DeviceMask {
    pub const ALL: DeviceMask = DeviceMask(0xffff_ffff);
    pub const PRIMARY: DeviceMask = DeviceMask(1 << 0);
    pub const SECONDARIES: DeviceMask = DeviceMask(0xffff_fffe);

    #[inline]
    pub const fn device(index: usize) -> DeviceMask {
        assert!(index < MAX_DEVICES);
        DeviceMask(1 << index)
    }

    #[inline]
    pub const fn contains(self, other: DeviceMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DeviceMask {
    type Output = DeviceMask;

    fn bitor(self, rhs: DeviceMask) -> DeviceMask {
        DeviceMask(self.0 | rhs.0)
    }
}
