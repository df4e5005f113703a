use crate::handle::{Buffer, Texture};
use crate::queue::{DeviceMask, QueueKind, QueueMask};
use crate::records::*;
use std::ptr;
use weft::Drift;

// =============================================================================
// COMMAND STREAMS
// =============================================================================
//
// A command stream accumulates variable-length records into drifter memory.
// Each record is:
//
//   { kind: u8, queue: u8, _pad: u16, next: u32 }  +  payload  +  trailing
//
// `next` is the byte distance to the following record, which makes the
// stream forward-iterable without interpreting type tags. Records are packed
// back-to-back; payload and trailing bytes are written and read unaligned,
// and only the record as a whole is rounded up to 8 bytes so every header
// lands aligned.
//
// The backing buffer grows in powers of two; growth allocates a fresh
// drifter block and copies (the drifter has no realloc; the old block is
// reclaimed by the enclosing unshift like everything else). Every encoder
// entry point ORs its preferred queue class into the stream-level mask.
//
// A stream is single-threaded: it lives and dies inside one fiber's drifter
// scope, and holding `&Drift` keeps it both !Send and !Sync.
//
// =============================================================================

/// Size of the record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 8;
/// Alignment of every record start.
pub const RECORD_ALIGN: usize = 8;

/// Stamps out the encoder entry points whose record is a bare fixed
/// payload: method name, payload type, record tag, preferred queue class.
macro_rules! encode_fixed {
    ($($(#[$meta:meta])* $fn_name:ident($payload:ty) => $kind:ident @ $queue:ident;)+) => {
        $(
            $(#[$meta])*
            pub fn $fn_name(&mut self, payload: $payload) {
                self.encode(RecordType::$kind, QueueKind::$queue, payload, 0, |_| {});
            }
        )+
    };
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Type tag; see [`RecordType`].
    pub kind: u8,
    /// Preferred queue class bit; see [`QueueKind`].
    pub queue: u8,
    /// Byte distance to the next record.
    pub next: u32,
}

/// A typed variable-length record stream written into drifter memory.
///
/// Built by work submitted to the job system and handed to the rendering
/// backend for compilation. The stream (and every record in it) lives in the
/// drifter it was created over: it must not outlive the enclosing
/// shift/unshift scope.
pub struct CommandStream<'a> {
    drift: &'a Drift,
    bytes: *mut u8,
    len: usize,
    capacity: usize,
    device_mask: DeviceMask,
    queue_mask: QueueMask,
}

impl<'a> CommandStream<'a> {
    /// Creates an empty stream broadcasting to `device_mask`.
    pub fn new(drift: &'a Drift, device_mask: DeviceMask) -> Self {
        Self {
            drift,
            bytes: ptr::null_mut(),
            len: 0,
            capacity: 0,
            device_mask,
            queue_mask: 0,
        }
    }

    /// Encoded length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no record has been encoded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Devices this stream broadcasts to.
    #[inline]
    pub fn device_mask(&self) -> DeviceMask {
        self.device_mask
    }

    /// Union of the preferred queue classes of every encoded record.
    #[inline]
    pub fn queue_mask(&self) -> QueueMask {
        self.queue_mask
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: `bytes..bytes+len` is initialized drifter memory owned by
        // this stream.
        unsafe { std::slice::from_raw_parts(self.bytes, self.len) }
    }

    /// Iterates the records in submission order by walking `next` offsets.
    pub fn records(&self) -> Records<'_> {
        Records {
            bytes: self.as_bytes(),
            cursor: 0,
        }
    }

    // ---------------------------------------------------------------------
    // ENCODING CORE
    // ---------------------------------------------------------------------

    fn reserve(&mut self, additional: usize) {
        let needed = self.len + additional;
        if needed <= self.capacity {
            return;
        }
        let mut capacity = self.capacity.max(256);
        while capacity < needed {
            capacity *= 2;
        }
        let fresh = self.drift.alloc(capacity, RECORD_ALIGN).as_ptr();
        if self.len > 0 {
            // SAFETY: both blocks are live drifter memory; the regions are
            // disjoint allocations.
            unsafe { ptr::copy_nonoverlapping(self.bytes, fresh, self.len) };
        }
        self.bytes = fresh;
        self.capacity = capacity;
    }

    /// Appends one record: header, fixed payload, `trailing_len` bytes
    /// filled by `trailing`.
    fn encode<P: Copy>(
        &mut self,
        kind: RecordType,
        queue: QueueKind,
        payload: P,
        trailing_len: usize,
        trailing: impl FnOnce(*mut u8),
    ) {
        let body = RECORD_HEADER_SIZE + size_of::<P>() + trailing_len;
        let total = (body + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1);
        self.reserve(total);

        // SAFETY: `reserve` guarantees `total` writable bytes at `len`; all
        // writes below stay inside them.
        unsafe {
            let base = self.bytes.add(self.len);
            base.write(kind as u8);
            base.add(1).write(queue.mask());
            base.add(2).cast::<u16>().write_unaligned(0);
            base.add(4).cast::<u32>().write_unaligned(total as u32);
            base.add(RECORD_HEADER_SIZE)
                .cast::<P>()
                .write_unaligned(payload);
            trailing(base.add(RECORD_HEADER_SIZE + size_of::<P>()));
        }
        self.len += total;
        self.queue_mask |= queue.mask();
    }

    // ---------------------------------------------------------------------
    // FIXED-PAYLOAD ENTRY POINTS (macro-stamped)
    // ---------------------------------------------------------------------

    encode_fixed! {
        /// Binds a shader pipeline for subsequent draws and dispatches.
        bind_pipeline(BindPipeline) => BindPipeline @ Any;
        /// Fills a buffer range with a repeated 32-bit pattern.
        fill_buffer(FillBuffer) => FillBuffer @ Transfer;
        /// Clears a texture slice to a color or depth/stencil value.
        clear_texture(ClearTexture) => ClearTexture @ Transfer;
        /// Queues a buffer for destruction once the stream retires.
        destroy_buffer(DestroyBuffer) => DestroyBuffer @ Any;
        /// Queues a texture for destruction once the stream retires.
        destroy_texture(DestroyTexture) => DestroyTexture @ Any;
        /// Queues a texture view for destruction once the stream retires.
        destroy_texture_view(DestroyTextureView) => DestroyTextureView @ Any;
        /// Queues a sampler for destruction once the stream retires.
        destroy_sampler(DestroySampler) => DestroySampler @ Any;
        /// Marks buffer contents as dead without a write-back.
        discard_buffer(DiscardBuffer) => DiscardBuffer @ Any;
        /// Marks a texture subresource range as dead without a write-back.
        discard_texture(DiscardTexture) => DiscardTexture @ Any;
        /// Writes a timestamp into a query pool slot.
        write_timestamp(WriteTimestamp) => WriteTimestamp @ Any;
        /// Resolves a range of timestamp queries.
        resolve_timestamps(ResolveTimestamps) => ResolveTimestamps @ Any;
        /// Non-indexed draw.
        draw(Draw) => Draw @ Main;
        /// Indexed draw.
        draw_indexed(DrawIndexed) => DrawIndexed @ Main;
        /// Indirect non-indexed draw.
        draw_indirect(DrawIndirect) => DrawIndirect @ Main;
        /// Indirect non-indexed draw with a GPU-side draw count.
        draw_indirect_count(DrawIndirectCount) => DrawIndirectCount @ Main;
        /// Indirect indexed draw.
        draw_indexed_indirect(DrawIndirect) => DrawIndexedIndirect @ Main;
        /// Indirect indexed draw with a GPU-side draw count.
        draw_indexed_indirect_count(DrawIndirectCount) => DrawIndexedIndirectCount @ Main;
        /// Mesh/task shader draw.
        draw_mesh_tasks(DrawMeshTasks) => DrawMeshTasks @ Main;
        /// Indirect mesh/task shader draw.
        draw_mesh_tasks_indirect(DrawIndirect) => DrawMeshTasksIndirect @ Main;
        /// Indirect mesh/task shader draw with a GPU-side draw count.
        draw_mesh_tasks_indirect_count(DrawIndirectCount) => DrawMeshTasksIndirectCount @ Main;
        /// Compute dispatch.
        dispatch(Dispatch) => Dispatch @ Compute;
        /// Indirect compute dispatch.
        dispatch_indirect(DispatchIndirect) => DispatchIndirect @ Compute;
        /// Ray-tracing dispatch.
        trace_rays(TraceRays) => TraceRays @ Compute;
        /// Indirect ray-tracing dispatch.
        trace_rays_indirect(TraceRaysIndirect) => TraceRaysIndirect @ Compute;
    }

    // ---------------------------------------------------------------------
    // TRAILING-ARRAY ENTRY POINTS
    // ---------------------------------------------------------------------

    /// Copies `regions` between two buffers.
    pub fn copy_buffer(&mut self, src: Buffer, dst: Buffer, regions: &[BufferCopyRegion]) {
        let payload = CopyBuffer {
            src,
            dst,
            region_count: regions.len() as u32,
        };
        self.encode(
            RecordType::CopyBuffer,
            QueueKind::Transfer,
            payload,
            size_of_val(regions),
            |dst| write_trailing_slice(dst, regions),
        );
    }

    /// Copies buffer `regions` into a texture.
    pub fn copy_buffer_to_texture(
        &mut self,
        src: Buffer,
        dst: Texture,
        dst_access: Access,
        regions: &[BufferTextureRegion],
    ) {
        let payload = CopyBufferToTexture {
            src,
            dst,
            dst_access,
            region_count: regions.len() as u32,
        };
        self.encode(
            RecordType::CopyBufferToTexture,
            QueueKind::Transfer,
            payload,
            size_of_val(regions),
            |dst| write_trailing_slice(dst, regions),
        );
    }

    /// Copies texture `regions` into a buffer.
    pub fn copy_texture_to_buffer(
        &mut self,
        src: Texture,
        dst: Buffer,
        src_access: Access,
        regions: &[BufferTextureRegion],
    ) {
        let payload = CopyTextureToBuffer {
            src,
            dst,
            src_access,
            region_count: regions.len() as u32,
        };
        self.encode(
            RecordType::CopyTextureToBuffer,
            QueueKind::Transfer,
            payload,
            size_of_val(regions),
            |dst| write_trailing_slice(dst, regions),
        );
    }

    /// Copies `regions` between two textures.
    pub fn copy_texture(
        &mut self,
        src: Texture,
        dst: Texture,
        src_access: Access,
        dst_access: Access,
        regions: &[TextureCopyRegion],
    ) {
        let payload = CopyTexture {
            src,
            dst,
            src_access,
            dst_access,
            region_count: regions.len() as u32,
        };
        self.encode(
            RecordType::CopyTexture,
            QueueKind::Transfer,
            payload,
            size_of_val(regions),
            |dst| write_trailing_slice(dst, regions),
        );
    }

    /// Scaled/filtered blit of `regions` between two textures.
    #[allow(clippy::too_many_arguments)]
    pub fn blit_texture(
        &mut self,
        src: Texture,
        dst: Texture,
        src_access: Access,
        dst_access: Access,
        filter: Filter,
        regions: &[BlitRegion],
    ) {
        let payload = BlitTexture {
            src,
            dst,
            src_access,
            dst_access,
            filter,
            region_count: regions.len() as u32,
        };
        self.encode(
            RecordType::BlitTexture,
            QueueKind::Transfer,
            payload,
            size_of_val(regions),
            |dst| write_trailing_slice(dst, regions),
        );
    }

    /// Resolves multisampled `regions` into a single-sampled texture.
    pub fn resolve_texture(
        &mut self,
        src: Texture,
        dst: Texture,
        mode: ResolveMode,
        regions: &[TextureCopyRegion],
    ) {
        let payload = ResolveTexture {
            src,
            dst,
            mode,
            region_count: regions.len() as u32,
        };
        self.encode(
            RecordType::ResolveTexture,
            QueueKind::Transfer,
            payload,
            size_of_val(regions),
            |dst| write_trailing_slice(dst, regions),
        );
    }

    /// Pushes root constants to every stage in `stage_mask`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + bytes.len()` exceeds the root-constant budget of
    /// [`MAX_ROOT_CONSTANT_BYTE_SIZE`] bytes.
    pub fn push_constants(&mut self, stage_mask: u32, offset: u32, bytes: &[u8]) {
        assert!(
            offset as usize + bytes.len() <= MAX_ROOT_CONSTANT_BYTE_SIZE,
            "root constants exceed the {MAX_ROOT_CONSTANT_BYTE_SIZE}-byte budget"
        );
        let payload = PushConstants {
            stage_mask,
            offset,
            size: bytes.len() as u32,
        };
        self.encode(
            RecordType::PushConstants,
            QueueKind::Any,
            payload,
            bytes.len(),
            // SAFETY: `encode` hands us exactly `bytes.len()` writable bytes.
            |dst| unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) },
        );
    }

    /// Opens a debug label region. The name is stored NUL-terminated.
    pub fn begin_label(&mut self, color: [f32; 4], name: &str) {
        let text = name.as_bytes();
        let payload = BeginLabel {
            color,
            name_length: text.len() as u32,
        };
        self.encode(
            RecordType::BeginLabel,
            QueueKind::Any,
            payload,
            text.len() + 1,
            // SAFETY: `encode` hands us `text.len() + 1` writable bytes.
            |dst| unsafe {
                ptr::copy_nonoverlapping(text.as_ptr(), dst, text.len());
                dst.add(text.len()).write(0);
            },
        );
    }

    /// Closes the most recent debug label region.
    pub fn end_label(&mut self) {
        self.encode(RecordType::EndLabel, QueueKind::Any, (), 0, |_| {});
    }

    /// Begins a renderpass. Attachments trail the payload in the order
    /// colors, then depth, then stencil.
    pub fn begin_renderpass(
        &mut self,
        render_area: Rect,
        colors: &[Attachment],
        depth: Option<Attachment>,
        stencil: Option<Attachment>,
    ) {
        let payload = BeginRenderpass {
            color_count: colors.len() as u32,
            has_depth: depth.is_some(),
            has_stencil: stencil.is_some(),
            render_area,
        };
        let count =
            colors.len() + usize::from(depth.is_some()) + usize::from(stencil.is_some());
        self.encode(
            RecordType::BeginRenderpass,
            QueueKind::Main,
            payload,
            count * size_of::<Attachment>(),
            |dst| {
                // SAFETY: `encode` hands us `count` attachment slots.
                unsafe {
                    let mut cursor = dst;
                    for attachment in colors.iter().chain(&depth).chain(&stencil) {
                        cursor.cast::<Attachment>().write_unaligned(*attachment);
                        cursor = cursor.add(size_of::<Attachment>());
                    }
                }
            },
        );
    }

    /// Ends the open renderpass.
    pub fn end_renderpass(&mut self) {
        self.encode(RecordType::EndRenderpass, QueueKind::Main, (), 0, |_| {});
    }
}

fn write_trailing_slice<E: Copy>(dst: *mut u8, items: &[E]) {
    // SAFETY: the encoder reserved `size_of_val(items)` bytes at `dst`;
    // elements are written unaligned because records are packed.
    unsafe {
        let mut cursor = dst.cast::<E>();
        for item in items {
            cursor.write_unaligned(*item);
            cursor = cursor.add(1);
        }
    }
}

// -----------------------------------------------------------------------------
// Iteration
// -----------------------------------------------------------------------------

/// Forward iterator over the records of a stream, in submission order.
///
/// Single reader only; the stream is not thread-safe.
pub struct Records<'s> {
    bytes: &'s [u8],
    cursor: usize,
}

impl<'s> Iterator for Records<'s> {
    type Item = RecordRef<'s>;

    fn next(&mut self) -> Option<RecordRef<'s>> {
        if self.cursor >= self.bytes.len() {
            return None;
        }
        let at = self.cursor;
        debug_assert!(at + RECORD_HEADER_SIZE <= self.bytes.len(), "truncated record header");

        let kind = self.bytes[at];
        let queue = self.bytes[at + 1];
        // SAFETY: bounds checked above; headers are read unaligned.
        let next = unsafe {
            self.bytes
                .as_ptr()
                .add(at + 4)
                .cast::<u32>()
                .read_unaligned()
        } as usize;
        debug_assert!(next >= RECORD_HEADER_SIZE, "corrupt record distance");
        debug_assert!(at + next <= self.bytes.len(), "record overruns the stream");

        self.cursor = at + next;
        Some(RecordRef {
            kind,
            queue,
            body: &self.bytes[at + RECORD_HEADER_SIZE..at + next],
        })
    }
}

/// One record yielded by [`Records`].
pub struct RecordRef<'s> {
    /// Raw type tag.
    pub kind: u8,
    /// Raw preferred-queue bit.
    pub queue: u8,
    body: &'s [u8],
}

impl<'s> RecordRef<'s> {
    /// Decoded type tag, `None` for tags this build does not know.
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.kind)
    }

    /// The record header, reassembled.
    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            kind: self.kind,
            queue: self.queue,
            next: (RECORD_HEADER_SIZE + self.body.len()) as u32,
        }
    }

    /// Payload plus trailing bytes (including the alignment pad).
    pub fn body(&self) -> &'s [u8] {
        self.body
    }

    /// Reads the fixed payload and returns it together with the trailing
    /// bytes that follow it.
    ///
    /// # Safety
    ///
    /// `P` must be the payload type matching this record's tag.
    pub unsafe fn decode<P: Copy>(&self) -> (P, &'s [u8]) {
        debug_assert!(self.body.len() >= size_of::<P>(), "payload overruns the record");
        // SAFETY: caller guarantees the type; payloads are stored unaligned.
        let payload = unsafe { self.body.as_ptr().cast::<P>().read_unaligned() };
        (payload, &self.body[size_of::<P>()..])
    }

    /// Reads element `index` of the trailing array that follows payload `P`.
    ///
    /// # Safety
    ///
    /// `P` and `E` must match this record's tag, and `index` must be within
    /// the record's trailing count.
    pub unsafe fn trailing<P: Copy, E: Copy>(&self, index: usize) -> E {
        let offset = size_of::<P>() + index * size_of::<E>();
        debug_assert!(offset + size_of::<E>() <= self.body.len(), "trailing element overruns");
        // SAFETY: caller guarantees layout; elements are stored unaligned.
        unsafe { self.body.as_ptr().add(offset).cast::<E>().read_unaligned() }
    }
}
