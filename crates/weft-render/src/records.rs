//! Command record payloads.
//!
//! Every record in a command stream is a header followed by one of the
//! `#[repr(C)]` payloads below, optionally followed by a trailing array
//! (copy regions, attachments, label text, root-constant bytes). Payloads
//! are written and read with unaligned accesses; records are packed
//! back-to-back and only the record as a whole is aligned.

use crate::handle::{Buffer, QueryPool, Sampler, ShaderPipeline, Texture, TextureView};
use std::fmt;

macro_rules! record_types {
    ($($name:ident = $value:literal),+ $(,)?) => {
        /// Record type tags, one per encoder entry point.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum RecordType {
            $($name = $value),+
        }

        impl RecordType {
            /// Decodes a header tag byte.
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$name),)+
                    _ => None,
                }
            }
        }
    };
}

record_types! {
    BindPipeline = 0,
    FillBuffer = 1,
    CopyBuffer = 2,
    CopyBufferToTexture = 3,
    CopyTextureToBuffer = 4,
    CopyTexture = 5,
    BlitTexture = 6,
    ClearTexture = 7,
    ResolveTexture = 8,
    DestroyBuffer = 9,
    DestroyTexture = 10,
    DestroyTextureView = 11,
    DestroySampler = 12,
    DiscardBuffer = 13,
    DiscardTexture = 14,
    PushConstants = 15,
    WriteTimestamp = 16,
    ResolveTimestamps = 17,
    BeginLabel = 18,
    EndLabel = 19,
    BeginRenderpass = 20,
    EndRenderpass = 21,
    Draw = 22,
    DrawIndexed = 23,
    DrawIndirect = 24,
    DrawIndirectCount = 25,
    DrawIndexedIndirect = 26,
    DrawIndexedIndirectCount = 27,
    DrawMeshTasks = 28,
    DrawMeshTasksIndirect = 29,
    DrawMeshTasksIndirectCount = 30,
    Dispatch = 31,
    DispatchIndirect = 32,
    TraceRays = 33,
    TraceRaysIndirect = 34,
}

// -----------------------------------------------------------------------------
// Shared value types
// -----------------------------------------------------------------------------

/// Resource access, used for the internal synchronization model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Access {
    #[default]
    None = 0,
    ShaderRead,
    ShaderWrite,
    ColorAttachmentRead,
    ColorAttachmentWrite,
    DepthStencilRead,
    DepthStencilWrite,
    TransferRead,
    TransferWrite,
    HostRead,
    HostWrite,
    Present,
}

/// Blit sampling filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Filter {
    #[default]
    Nearest = 0,
    Linear,
}

/// Multisample resolve mode bits.
pub type ResolveMode = u8;
pub const RESOLVE_MODE_SAMPLE_ZERO: ResolveMode = 1 << 0;
pub const RESOLVE_MODE_AVERAGE: ResolveMode = 1 << 1;
pub const RESOLVE_MODE_MIN: ResolveMode = 1 << 2;
pub const RESOLVE_MODE_MAX: ResolveMode = 1 << 3;

/// Attachment load behaviour at renderpass begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoadOp {
    #[default]
    Load = 0,
    Clear,
    DontCare,
}

/// Attachment store behaviour at renderpass end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StoreOp {
    #[default]
    Store = 0,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Offset3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Extent3 {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Render area in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// A mip level plus an array layer range of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TextureSlice {
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct DepthStencilValue {
    pub depth: f32,
    pub stencil: u32,
}

/// Clear value for color or depth/stencil targets; which arm is live is
/// recorded next to it (`ClearTexture::is_depth_stencil`, attachment
/// format).
#[derive(Clone, Copy)]
#[repr(C)]
pub union ClearValue {
    pub color: [f32; 4],
    pub depth_stencil: DepthStencilValue,
}

impl ClearValue {
    pub const fn color(color: [f32; 4]) -> Self {
        Self { color }
    }

    pub const fn depth_stencil(depth: f32, stencil: u32) -> Self {
        Self {
            depth_stencil: DepthStencilValue { depth, stencil },
        }
    }
}

impl Default for ClearValue {
    fn default() -> Self {
        Self::color([0.0; 4])
    }
}

impl fmt::Debug for ClearValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Which arm is live is not recorded here; show the raw color view.
        // SAFETY: both arms are plain old data of the same size class.
        write!(f, "ClearValue({:?})", unsafe { self.color })
    }
}

/// One attachment of a renderpass (color, depth or stencil).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Attachment {
    pub view: TextureView,
    pub access: Access,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: ClearValue,
}

// -----------------------------------------------------------------------------
// Trailing array element types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct BufferTextureRegion {
    pub buffer_offset: u64,
    pub texture_slice: TextureSlice,
    pub texture_offset: Offset3,
    pub extent: Extent3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TextureCopyRegion {
    pub src_slice: TextureSlice,
    pub src_offset: Offset3,
    pub dst_slice: TextureSlice,
    pub dst_offset: Offset3,
    pub extent: Extent3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct BlitRegion {
    pub src_slice: TextureSlice,
    pub src_offset: Offset3,
    pub dst_slice: TextureSlice,
    pub dst_offset: Offset3,
}

// -----------------------------------------------------------------------------
// Fixed payloads
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BindPipeline {
    pub pipeline: ShaderPipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FillBuffer {
    pub dst: Buffer,
    pub dst_offset: u64,
    pub size: u64,
    /// Repeated 32-bit fill pattern.
    pub data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CopyBuffer {
    pub src: Buffer,
    pub dst: Buffer,
    pub region_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CopyBufferToTexture {
    pub src: Buffer,
    pub dst: Texture,
    pub dst_access: Access,
    pub region_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CopyTextureToBuffer {
    pub src: Texture,
    pub dst: Buffer,
    pub src_access: Access,
    pub region_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CopyTexture {
    pub src: Texture,
    pub dst: Texture,
    pub src_access: Access,
    pub dst_access: Access,
    pub region_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlitTexture {
    pub src: Texture,
    pub dst: Texture,
    pub src_access: Access,
    pub dst_access: Access,
    pub filter: Filter,
    pub region_count: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ClearTexture {
    pub dst: Texture,
    pub slice: TextureSlice,
    pub access: Access,
    pub is_depth_stencil: bool,
    pub clear_value: ClearValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ResolveTexture {
    pub src: Texture,
    pub dst: Texture,
    pub mode: ResolveMode,
    pub region_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DestroyBuffer {
    pub buffer: Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DestroyTexture {
    pub texture: Texture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DestroyTextureView {
    pub view: TextureView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DestroySampler {
    pub sampler: Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DiscardBuffer {
    pub buffer: Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DiscardTexture {
    pub texture: Texture,
    pub slice: TextureSlice,
}

/// Root-constant words pushed to every stage in `stage_mask`.
pub const MAX_ROOT_CONSTANT_WORD_SIZE: usize = 32;
pub const MAX_ROOT_CONSTANT_BYTE_SIZE: usize = MAX_ROOT_CONSTANT_WORD_SIZE * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PushConstants {
    pub stage_mask: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct WriteTimestamp {
    pub pool: QueryPool,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ResolveTimestamps {
    pub pool: QueryPool,
    pub first: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct BeginLabel {
    pub color: [f32; 4],
    /// Trailing text length excluding the NUL terminator.
    pub name_length: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BeginRenderpass {
    pub color_count: u32,
    pub has_depth: bool,
    pub has_stencil: bool,
    pub render_area: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Draw {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct DrawIndexed {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Shared by the plain, indexed and mesh-task indirect draws; the record
/// type tag tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DrawIndirect {
    pub buffer: Buffer,
    pub offset: u64,
    pub draw_count: u32,
    pub stride: u32,
}

/// Shared by the `*_indirect_count` draw variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DrawIndirectCount {
    pub buffer: Buffer,
    pub offset: u64,
    pub count_buffer: Buffer,
    pub count_offset: u64,
    pub max_draw_count: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct DrawMeshTasks {
    pub group_x: u32,
    pub group_y: u32,
    pub group_z: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Dispatch {
    pub group_x: u32,
    pub group_y: u32,
    pub group_z: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DispatchIndirect {
    pub buffer: Buffer,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TraceRays {
    pub extent: Extent3,
    pub raygen_offset: u32,
    pub miss_offset: u32,
    pub hit_offset: u32,
    pub callable_offset: u32,
    pub sbt: Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TraceRaysIndirect {
    pub buffer: Buffer,
    pub offset: u64,
    pub sbt: Buffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_round_trips_through_u8() {
        for value in 0..=255u8 {
            if let Some(kind) = RecordType::from_u8(value) {
                assert_eq!(kind as u8, value);
            }
        }
        assert_eq!(RecordType::from_u8(0), Some(RecordType::BindPipeline));
        assert_eq!(
            RecordType::from_u8(RecordType::TraceRaysIndirect as u8),
            Some(RecordType::TraceRaysIndirect)
        );
        assert_eq!(RecordType::from_u8(200), None);
    }

    #[test]
    fn test_clear_value_arms() {
        let color = ClearValue::color([0.5, 0.25, 0.0, 1.0]);
        // SAFETY: the color arm was just written.
        assert_eq!(unsafe { color.color }[0], 0.5);

        let ds = ClearValue::depth_stencil(1.0, 3);
        // SAFETY: the depth_stencil arm was just written.
        let ds = unsafe { ds.depth_stencil };
        assert_eq!(ds.depth, 1.0);
        assert_eq!(ds.stencil, 3);
    }
}
