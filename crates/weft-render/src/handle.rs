//! Typed render resource handles.
//!
//! Every GPU-side object is addressed by a 64-bit id packing a 32-bit slot
//! index (low word) and a 32-bit generation (high word). The layout is
//! bit-exact with the chain handles of the job system, so debug logs
//! serialize both the same way. One newtype per resource kind keeps a buffer
//! id from ever being passed where a texture id is expected.

use std::fmt;

/// Packed 64-bit identifier: index in the low word, generation in the high
/// word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawId(u64);

impl RawId {
    /// The nil id; no live resource ever carries it.
    pub const NIL: RawId = RawId(u64::MAX);

    #[inline]
    pub const fn pack(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The raw 64-bit word, for serialization and logs.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NIL {
            write!(f, "nil")
        } else {
            write!(f, "{}v{}", self.index(), self.generation())
        }
    }
}

macro_rules! declare_handles {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash)]
            #[repr(transparent)]
            pub struct $name(pub RawId);

            impl $name {
                pub const NIL: Self = Self(RawId::NIL);

                #[inline]
                pub const fn pack(index: u32, generation: u32) -> Self {
                    Self(RawId::pack(index, generation))
                }

                #[inline]
                pub const fn id(self) -> RawId {
                    self.0
                }

                #[inline]
                pub fn is_nil(self) -> bool {
                    self.0 == RawId::NIL
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!(stringify!($name), "({:?})"), self.0)
                }
            }
        )+
    };
}

declare_handles! {
    /// A GPU buffer.
    Buffer,
    /// A GPU texture.
    Texture,
    /// A view over a texture subresource range.
    TextureView,
    /// A texture sampler.
    Sampler,
    /// A ray-tracing acceleration structure.
    Bvh,
    /// A single compiled shader.
    Shader,
    /// A bound pipeline of shaders.
    ShaderPipeline,
    /// A presentation swapchain.
    Swapchain,
    /// A pool of timestamp queries.
    QueryPool,
    /// Backend-compiled command streams.
    CompiledCommands,
}
