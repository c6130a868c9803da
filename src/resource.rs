//! Buffer and texture resources.
//!
//! Buffers are permissive by design: every buffer is created with the full
//! set of usage flags its heap type allows, so views never need to recreate
//! the underlying object. Textures derive their usage, create flags and
//! format compatibility list from the resource description.
//!
//! A resource is backed one of four ways. Committed resources own a dedicated
//! memory allocation. Placed buffers alias their heap's spanning buffer and
//! own no Vulkan handle at all. Placed textures bind into heap memory at an
//! offset, falling back to a dedicated allocation when the heap's memory type
//! cannot serve the image. Reserved resources bind memory per 64 KiB tile
//! through sparse binding, and external resources wrap a caller-owned image.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::format::Format;
use crate::heap::{Heap, HeapFlags, HeapProperties, HeapType};
use crate::memory::{self, DeviceAllocation};
use crate::{
    align, Error, GpuVa, Result, DEFAULT_RESOURCE_ALIGNMENT, MSAA_RESOURCE_ALIGNMENT,
    SMALL_RESOURCE_ALIGNMENT, TILE_SIZE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceDimension {
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureLayout {
    Unknown,
    RowMajor,
    UndefinedSwizzle64Kb,
    StandardSwizzle64Kb,
}

bitflags! {
    pub struct ResourceFlags: u32 {
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
        const ALLOW_UNORDERED_ACCESS = 0x4;
        const DENY_SHADER_RESOURCE = 0x8;
        const ALLOW_CROSS_ADAPTER = 0x10;
        const ALLOW_SIMULTANEOUS_ACCESS = 0x20;
    }
}

bitflags! {
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
    }
}

impl ResourceState {
    const WRITE_STATES: ResourceState = ResourceState::from_bits_truncate(
        Self::RENDER_TARGET.bits
            | Self::UNORDERED_ACCESS.bits
            | Self::DEPTH_WRITE.bits
            | Self::STREAM_OUT.bits
            | Self::COPY_DEST.bits
            | Self::RESOLVE_DEST.bits,
    );

    /// Write states are exclusive; read states may be combined freely.
    pub fn is_valid_initial_state(self) -> bool {
        let writes = self & Self::WRITE_STATES;
        writes.is_empty() || (self == writes && writes.bits().count_ones() == 1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleDesc {
    pub count: u32,
    pub quality: u32,
}

impl Default for SampleDesc {
    fn default() -> Self {
        SampleDesc { count: 1, quality: 0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub alignment: u64,
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub sample_desc: SampleDesc,
    pub layout: TextureLayout,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    pub fn buffer(width: u64) -> Self {
        ResourceDesc {
            dimension: ResourceDimension::Buffer,
            alignment: 0,
            width,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: Format::Unknown,
            sample_desc: SampleDesc::default(),
            layout: TextureLayout::RowMajor,
            flags: ResourceFlags::empty(),
        }
    }

    pub fn texture_2d(format: Format, width: u64, height: u32) -> Self {
        ResourceDesc {
            dimension: ResourceDimension::Texture2D,
            alignment: 0,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            format,
            sample_desc: SampleDesc::default(),
            layout: TextureLayout::Unknown,
            flags: ResourceFlags::empty(),
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    pub fn is_texture(&self) -> bool {
        !self.is_buffer()
    }

    pub fn width(&self, mip_level: u32) -> u64 {
        (self.width >> mip_level).max(1)
    }

    pub fn height(&self, mip_level: u32) -> u32 {
        (self.height >> mip_level).max(1)
    }

    pub fn depth(&self, mip_level: u32) -> u32 {
        let depth = match self.dimension {
            ResourceDimension::Texture3D => u32::from(self.depth_or_array_size),
            _ => 1,
        };
        (depth >> mip_level).max(1)
    }

    pub fn layer_count(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Texture3D => 1,
            _ => u32::from(self.depth_or_array_size),
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.layer_count() * u32::from(self.mip_levels)
    }

    fn max_mip_level_count(&self) -> u32 {
        let size = self.width.max(u64::from(self.height)).max(u64::from(self.depth(0)));
        64 - size.leading_zeros().min(63)
    }
}

/// The Vulkan object behind a resource. Placed buffers carry their heap's
/// spanning buffer handle without owning it.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ResourceHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

pub(crate) enum ResourceBacking {
    Committed {
        allocation: DeviceAllocation,
        map_ptr: *mut u8,
    },
    PlacedBuffer {
        heap: Arc<Heap>,
        offset: u64,
    },
    Placed {
        heap: Arc<Heap>,
        offset: u64,
    },
    /// Placed texture that could not bind into its heap and got a dedicated
    /// allocation instead.
    PlacedFallback {
        allocation: DeviceAllocation,
    },
    Reserved,
    External,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackedMipInfo {
    pub standard_mip_count: u32,
    pub packed_mip_count: u32,
    pub packed_tile_count: u32,
    pub start_tile_index: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileShape {
    pub width_in_texels: u32,
    pub height_in_texels: u32,
    pub depth_in_texels: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub depth_in_tiles: u32,
    pub start_tile_index: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum TileBind {
    /// Buffer ranges and packed mip tails bind by byte offset.
    Memory { offset: u64, size: u64 },
    Image {
        subresource: vk::ImageSubresource,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct SparseTile {
    pub bind: TileBind,
    pub vk_memory: vk::DeviceMemory,
    pub vk_offset: u64,
}

pub(crate) struct SparseInfo {
    pub tile_count: u32,
    pub tiles: Vec<SparseTile>,
    pub tilings: Vec<SubresourceTiling>,
    pub packed_mips: PackedMipInfo,
    pub tile_shape: TileShape,
    pub metadata_allocation: Option<DeviceAllocation>,
}

/// Tiling layout of a reserved resource.
pub struct ResourceTiling<'a> {
    pub total_tile_count: u32,
    pub packed_mip_info: &'a PackedMipInfo,
    pub tile_shape: &'a TileShape,
    pub subresource_tilings: &'a [SubresourceTiling],
}

pub struct Resource {
    desc: ResourceDesc,
    pub(crate) handle: ResourceHandle,
    pub(crate) backing: ResourceBacking,
    pub(crate) gpu_va: GpuVa,
    pub(crate) common_layout: vk::ImageLayout,
    pub(crate) linear_tiling: bool,
    initial_state: ResourceState,
    pub(crate) sparse: Option<SparseInfo>,
}

// The committed mapping pointer is only dereferenced through offsets handed
// out by `map`, which validates CPU accessibility first.
unsafe impl Send for Resource {}
unsafe impl Sync for Resource {}

fn validate_texture_format(desc: &ResourceDesc) -> Result<()> {
    if !desc.format.is_block_compressed() {
        return Ok(());
    }
    let info = desc.format.info();

    if desc.dimension == ResourceDimension::Texture1D && info.block_height > 1 {
        warn!("1D texture with a block height above one");
        return Err(Error::InvalidArgument("texture format"));
    }
    if align(desc.width, u64::from(info.block_width)) != desc.width
        || align(u64::from(desc.height), u64::from(info.block_height)) != u64::from(desc.height)
    {
        warn!(
            "invalid size {}x{} for block compressed format {:?}",
            desc.width, desc.height, desc.format
        );
        return Err(Error::InvalidArgument("texture dimensions"));
    }
    Ok(())
}

fn validate_texture_alignment(desc: &ResourceDesc) -> Result<()> {
    if desc.alignment == 0 {
        return Ok(());
    }

    if desc.alignment != DEFAULT_RESOURCE_ALIGNMENT
        && desc.alignment != SMALL_RESOURCE_ALIGNMENT
        && (desc.sample_desc.count == 1 || desc.alignment != MSAA_RESOURCE_ALIGNMENT)
    {
        warn!("invalid resource alignment {:#x}", desc.alignment);
        return Err(Error::InvalidArgument("resource alignment"));
    }

    if desc.alignment < DEFAULT_RESOURCE_ALIGNMENT {
        // Small alignment eligibility is judged on the estimated slice size,
        // ignoring the array layer count.
        let info = desc.format.info();
        let estimated_size = desc.width * u64::from(desc.height) * u64::from(info.block_byte_count)
            / u64::from(info.block_width * info.block_height);
        if estimated_size > DEFAULT_RESOURCE_ALIGNMENT {
            warn!(
                "resource of estimated size {:#x} is not eligible for small alignment",
                estimated_size
            );
            return Err(Error::InvalidArgument("resource alignment"));
        }
    }
    Ok(())
}

pub(crate) fn validate_resource_desc(desc: &ResourceDesc) -> Result<()> {
    match desc.dimension {
        ResourceDimension::Buffer => {
            if desc.mip_levels != 1 {
                warn!("invalid mip level count {} for buffer", desc.mip_levels);
                return Err(Error::InvalidArgument("buffer mip levels"));
            }
            if desc.format != Format::Unknown
                || desc.layout != TextureLayout::RowMajor
                || desc.height != 1
                || desc.depth_or_array_size != 1
                || desc.sample_desc.count != 1
                || desc.sample_desc.quality != 0
                || (desc.alignment != 0 && desc.alignment != DEFAULT_RESOURCE_ALIGNMENT)
            {
                warn!("invalid parameters for a buffer resource");
                return Err(Error::InvalidArgument("buffer description"));
            }
        }
        ResourceDimension::Texture1D if desc.height != 1 => {
            warn!("1D texture with a height of {}", desc.height);
            return Err(Error::InvalidArgument("texture height"));
        }
        ResourceDimension::Texture1D
        | ResourceDimension::Texture2D
        | ResourceDimension::Texture3D => {
            if desc.format == Format::Unknown {
                warn!("unknown format for texture resource");
                return Err(Error::InvalidArgument("texture format"));
            }
            validate_texture_format(desc)?;
            validate_texture_alignment(desc)?;
        }
    }
    Ok(())
}

pub(crate) fn validate_heap_properties(
    desc: &ResourceDesc,
    properties: &HeapProperties,
    initial_state: ResourceState,
) -> Result<()> {
    if properties.heap_type == HeapType::Upload || properties.heap_type == HeapType::Readback {
        if desc.is_texture() {
            warn!("textures cannot be created on upload or readback heaps");
            return Err(Error::InvalidArgument("heap type"));
        }
        if desc
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_UNORDERED_ACCESS)
        {
            warn!("render target and UAV buffers cannot live on upload or readback heaps");
            return Err(Error::InvalidArgument("resource flags"));
        }
    }

    if properties.heap_type == HeapType::Upload && initial_state != ResourceState::GENERIC_READ {
        warn!("upload heap resources must start in the generic read state");
        return Err(Error::InvalidArgument("initial state"));
    }
    if properties.heap_type == HeapType::Readback && initial_state != ResourceState::COPY_DEST {
        warn!("readback heap resources must start in the copy dest state");
        return Err(Error::InvalidArgument("initial state"));
    }
    Ok(())
}

/// Image layout a texture settles into between explicit transitions.
pub(crate) fn common_image_layout_for_desc(desc: &ResourceDesc) -> vk::ImageLayout {
    if desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
        return vk::ImageLayout::GENERAL;
    }
    // DENY_SHADER_RESOURCE is only allowed together with ALLOW_DEPTH_STENCIL.
    if desc.flags.contains(ResourceFlags::DENY_SHADER_RESOURCE) {
        return vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) {
        return vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
    }
    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
}

/// Creates a `VkBuffer` with the full usage set its heap type allows.
/// Reserved resources pass no heap properties and get sparse create flags.
pub(crate) fn create_vk_buffer(
    device: &Device,
    heap_properties: Option<&HeapProperties>,
    size: u64,
    flags: ResourceFlags,
) -> Result<vk::Buffer> {
    let heap_type = heap_properties.map_or(HeapType::Default, |p| p.heap_type);

    if flags.intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL) {
        warn!("unsupported buffer resource flags {:?}", flags);
        return Err(Error::InvalidArgument("buffer resource flags"));
    }
    if flags.contains(ResourceFlags::ALLOW_SIMULTANEOUS_ACCESS) {
        // Buffers always behave as if simultaneous access were allowed.
        warn!("ALLOW_SIMULTANEOUS_ACCESS cannot be set for buffers");
        return Err(Error::InvalidArgument("buffer resource flags"));
    }

    let mut create_flags = vk::BufferCreateFlags::empty();
    if heap_properties.is_none() {
        create_flags |= vk::BufferCreateFlags::SPARSE_BINDING
            | vk::BufferCreateFlags::SPARSE_RESIDENCY
            | vk::BufferCreateFlags::SPARSE_ALIASED;
    }

    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::UNIFORM_BUFFER
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDIRECT_BUFFER;

    if heap_type == HeapType::Default && device.caps.transform_feedback {
        usage |= vk::BufferUsageFlags::TRANSFORM_FEEDBACK_BUFFER_EXT
            | vk::BufferUsageFlags::TRANSFORM_FEEDBACK_COUNTER_BUFFER_EXT;
    }

    match heap_type {
        HeapType::Upload => usage &= !vk::BufferUsageFlags::TRANSFER_DST,
        HeapType::Readback => usage = vk::BufferUsageFlags::TRANSFER_DST,
        _ => {}
    }

    if flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
        usage |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
        if device.caps.buffer_device_address {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
    }
    if !flags.contains(ResourceFlags::DENY_SHADER_RESOURCE) {
        usage |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER;
    }

    let buffer_info = vk::BufferCreateInfo::builder()
        .flags(create_flags)
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let vk_buffer = unsafe { device.raw.create_buffer(&buffer_info, None) }.map_err(|err| {
        warn!("failed to create buffer, {:?}", err);
        Error::from(err)
    })?;
    Ok(vk_buffer)
}

fn is_linear_tiling_supported(device: &Device, image_info: &vk::ImageCreateInfo) -> bool {
    let properties = match unsafe {
        device.instance.get_physical_device_image_format_properties(
            device.physical_device,
            image_info.format,
            image_info.image_type,
            vk::ImageTiling::LINEAR,
            image_info.usage,
            image_info.flags,
        )
    } {
        Ok(properties) => properties,
        Err(err) => {
            if err != vk::Result::ERROR_FORMAT_NOT_SUPPORTED {
                warn!("failed to get image format properties, {:?}", err);
            }
            return false;
        }
    };

    image_info.extent.depth <= properties.max_extent.depth
        && image_info.mip_levels <= properties.max_mip_levels
        && image_info.array_layers <= properties.max_array_layers
        && properties.sample_counts.contains(image_info.samples)
}

struct CreatedImage {
    vk_image: vk::Image,
    common_layout: vk::ImageLayout,
    linear_tiling: bool,
}

fn create_vk_image(
    device: &Device,
    heap_properties: Option<&HeapProperties>,
    desc: &ResourceDesc,
) -> Result<CreatedImage> {
    let sparse = heap_properties.is_none();
    let format_info = desc
        .format
        .info_for_usage(desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL));

    let mut create_flags = vk::ImageCreateFlags::empty();
    let view_formats = desc.format.vk_view_formats();
    let mut format_list = vk::ImageFormatListCreateInfo::builder()
        .view_formats(&view_formats)
        .build();
    let mut use_format_list = false;

    if desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
        // Format compatibility rules are more relaxed for UAVs.
        if !desc.format.is_uint() {
            create_flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        }
    } else if !desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) && desc.format.is_typeless()
    {
        create_flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        use_format_list = !view_formats.is_empty();
    }

    if desc.dimension == ResourceDimension::Texture2D
        && desc.width == u64::from(desc.height)
        && desc.depth_or_array_size >= 6
        && desc.sample_desc.count == 1
    {
        create_flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
    }
    if desc.dimension == ResourceDimension::Texture3D {
        create_flags |= vk::ImageCreateFlags::TYPE_2D_ARRAY_COMPATIBLE;
    }

    if sparse {
        create_flags |= vk::ImageCreateFlags::SPARSE_BINDING
            | vk::ImageCreateFlags::SPARSE_RESIDENCY
            | vk::ImageCreateFlags::SPARSE_ALIASED;

        if desc.dimension == ResourceDimension::Texture1D {
            warn!("tiled 1D textures are not supported");
            return Err(Error::InvalidArgument("resource dimension"));
        }
        if desc.dimension == ResourceDimension::Texture3D && !device.caps.sparse_residency_3d {
            warn!("tiled 3D textures are not supported by the device");
            return Err(Error::InvalidArgument("resource dimension"));
        }
        if format_info.aspect_mask.as_raw().count_ones() != 1 {
            warn!(
                "multi-aspect format {:?} is not supported for tiled resources",
                desc.format
            );
            return Err(Error::InvalidArgument("resource format"));
        }
    }

    let (image_type, extent, array_layers) = match desc.dimension {
        ResourceDimension::Texture1D => (
            vk::ImageType::TYPE_1D,
            vk::Extent3D {
                width: desc.width as u32,
                height: 1,
                depth: 1,
            },
            u32::from(desc.depth_or_array_size),
        ),
        ResourceDimension::Texture2D => (
            vk::ImageType::TYPE_2D,
            vk::Extent3D {
                width: desc.width as u32,
                height: desc.height,
                depth: 1,
            },
            u32::from(desc.depth_or_array_size),
        ),
        ResourceDimension::Texture3D => (
            vk::ImageType::TYPE_3D,
            vk::Extent3D {
                width: desc.width as u32,
                height: desc.height,
                depth: u32::from(desc.depth_or_array_size),
            },
            1,
        ),
        ResourceDimension::Buffer => return Err(Error::InvalidArgument("resource dimension")),
    };

    let tiling = if sparse {
        if desc.layout != TextureLayout::UndefinedSwizzle64Kb {
            warn!("reserved textures require the 64 KiB undefined swizzle layout");
            return Err(Error::InvalidArgument("texture layout"));
        }
        vk::ImageTiling::OPTIMAL
    } else {
        match desc.layout {
            TextureLayout::Unknown => vk::ImageTiling::OPTIMAL,
            TextureLayout::RowMajor => vk::ImageTiling::LINEAR,
            other => {
                warn!("unsupported texture layout {:?}", other);
                return Err(Error::NotImplemented("texture layout"));
            }
        }
    };

    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if desc.flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    if !desc.flags.contains(ResourceFlags::DENY_SHADER_RESOURCE) {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }

    let mip_levels = u32::from(desc.mip_levels).min(desc.max_mip_level_count());

    let mut builder = vk::ImageCreateInfo::builder()
        .flags(create_flags)
        .image_type(image_type)
        .format(format_info.vk_format)
        .extent(extent)
        .mip_levels(mip_levels)
        .array_layers(array_layers)
        .samples(crate::conv::map_sample_count(desc.sample_desc.count)?)
        .tiling(tiling)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    if use_format_list {
        builder = builder.push_next(&mut format_list);
    }
    let mut image_info = builder.build();

    if heap_properties.map_or(false, |p| p.is_cpu_accessible()) {
        image_info.initial_layout = vk::ImageLayout::PREINITIALIZED;
        if is_linear_tiling_supported(device, &image_info) {
            // Mapped readback of subresources needs linear tiling.
            warn!("forcing linear tiling for CPU accessible texture");
            image_info.tiling = vk::ImageTiling::LINEAR;
        }
    }

    let (common_layout, linear_tiling) = if image_info.tiling == vk::ImageTiling::LINEAR {
        (vk::ImageLayout::GENERAL, true)
    } else {
        (common_image_layout_for_desc(desc), false)
    };

    let vk_image = unsafe { device.raw.create_image(&image_info, None) }.map_err(|err| {
        warn!("failed to create image, {:?}", err);
        Error::from(err)
    })?;

    Ok(CreatedImage {
        vk_image,
        common_layout,
        linear_tiling,
    })
}

pub(crate) struct TilingInfo {
    pub tile_count: u32,
    pub packed_mips: PackedMipInfo,
    pub tile_shape: TileShape,
    pub tilings: Vec<SubresourceTiling>,
}

fn compute_buffer_tiling(desc: &ResourceDesc) -> TilingInfo {
    let tile_count = (align(desc.width, TILE_SIZE) / TILE_SIZE) as u32;
    TilingInfo {
        tile_count,
        packed_mips: PackedMipInfo::default(),
        tile_shape: TileShape {
            width_in_texels: TILE_SIZE as u32,
            height_in_texels: 1,
            depth_in_texels: 1,
        },
        tilings: vec![SubresourceTiling {
            width_in_tiles: tile_count,
            height_in_tiles: 1,
            depth_in_tiles: 1,
            start_tile_index: 0,
        }],
    }
}

fn compute_image_tiling(
    desc: &ResourceDesc,
    requirements: &vk::SparseImageMemoryRequirements,
) -> TilingInfo {
    let mip_levels = u32::from(desc.mip_levels);

    // No mip tail if its size is zero or the first LOD is out of range; it is
    // unclear what drivers report when an image has no tail.
    let standard_mips = if requirements.image_mip_tail_size != 0 {
        mip_levels.min(requirements.image_mip_tail_first_lod)
    } else {
        mip_levels
    };

    let mut packed_tiles = if standard_mips < mip_levels {
        (align(requirements.image_mip_tail_size, TILE_SIZE) / TILE_SIZE) as u32
    } else {
        0
    };
    if !requirements
        .format_properties
        .flags
        .contains(vk::SparseImageFormatFlags::SINGLE_MIPTAIL)
    {
        packed_tiles *= desc.layer_count();
    }

    let block_extent = requirements.format_properties.image_granularity;
    let mut tile_count = 0u32;
    let mut tilings = Vec::with_capacity(desc.subresource_count() as usize);

    for index in 0..desc.subresource_count() {
        let mip_level = index % mip_levels;
        let tiles_w = (align(desc.width(mip_level), u64::from(block_extent.width))
            / u64::from(block_extent.width)) as u32;
        let tiles_h = align(u64::from(desc.height(mip_level)), u64::from(block_extent.height))
            as u32
            / block_extent.height;
        let tiles_d = align(u64::from(desc.depth(mip_level)), u64::from(block_extent.depth)) as u32
            / block_extent.depth;

        if mip_level < standard_mips {
            tilings.push(SubresourceTiling {
                width_in_tiles: tiles_w,
                height_in_tiles: tiles_h,
                depth_in_tiles: tiles_d,
                start_tile_index: tile_count,
            });
            tile_count += tiles_w * tiles_h * tiles_d;
        } else {
            tilings.push(SubresourceTiling {
                width_in_tiles: 0,
                height_in_tiles: 0,
                depth_in_tiles: 0,
                start_tile_index: u32::MAX,
            });
        }
    }

    let packed_mips = PackedMipInfo {
        standard_mip_count: standard_mips,
        packed_mip_count: mip_levels - standard_mips,
        packed_tile_count: packed_tiles,
        start_tile_index: if packed_tiles != 0 { tile_count } else { 0 },
    };
    tile_count += packed_tiles;

    let tile_shape = if standard_mips != 0 {
        TileShape {
            width_in_texels: block_extent.width,
            height_in_texels: block_extent.height,
            depth_in_texels: block_extent.depth,
        }
    } else {
        TileShape::default()
    };

    TilingInfo {
        tile_count,
        packed_mips,
        tile_shape,
        tilings,
    }
}

fn build_sparse_tiles(
    desc: &ResourceDesc,
    requirements: &vk::SparseImageMemoryRequirements,
    tiling: &TilingInfo,
) -> Vec<SparseTile> {
    let mip_levels = u32::from(desc.mip_levels);
    let block_extent = requirements.format_properties.image_granularity;
    let mut tiles = Vec::with_capacity(tiling.tile_count as usize);

    let mut tile_offset = (0u32, 0u32, 0u32);
    let mut subresource = 0u32;

    for index in 0..tiling.tile_count {
        let bind = if desc.is_buffer() {
            let offset = TILE_SIZE * u64::from(index);
            TileBind::Memory {
                offset,
                size: TILE_SIZE.min(desc.width - offset),
            }
        } else if tiling.packed_mips.packed_mip_count != 0
            && index >= tiling.packed_mips.start_tile_index
        {
            let offset = TILE_SIZE * u64::from(index - tiling.packed_mips.start_tile_index);
            TileBind::Memory {
                offset: requirements.image_mip_tail_offset + offset,
                size: TILE_SIZE.min(requirements.image_mip_tail_size - offset),
            }
        } else {
            let entry = &tiling.tilings[subresource as usize];
            debug_assert!(entry.width_in_tiles != 0 && entry.height_in_tiles != 0);

            let mip_level = subresource % mip_levels;
            let offset = vk::Offset3D {
                x: (tile_offset.0 * block_extent.width) as i32,
                y: (tile_offset.1 * block_extent.height) as i32,
                z: (tile_offset.2 * block_extent.depth) as i32,
            };
            let mip_extent = vk::Extent3D {
                width: desc.width(mip_level) as u32,
                height: desc.height(mip_level),
                depth: desc.depth(mip_level),
            };
            let extent = vk::Extent3D {
                width: block_extent.width.min(mip_extent.width - offset.x as u32),
                height: block_extent.height.min(mip_extent.height - offset.y as u32),
                depth: block_extent.depth.min(mip_extent.depth - offset.z as u32),
            };
            let bind = TileBind::Image {
                subresource: vk::ImageSubresource {
                    aspect_mask: requirements.format_properties.aspect_mask,
                    mip_level,
                    array_layer: subresource / mip_levels,
                },
                offset,
                extent,
            };

            tile_offset.0 += 1;
            if tile_offset.0 == entry.width_in_tiles {
                tile_offset.0 = 0;
                tile_offset.1 += 1;
                if tile_offset.1 == entry.height_in_tiles {
                    tile_offset.1 = 0;
                    tile_offset.2 += 1;
                    if tile_offset.2 == entry.depth_in_tiles {
                        tile_offset.2 = 0;
                        // Skip subresources that are part of the packed mip tail.
                        loop {
                            subresource += 1;
                            if subresource % mip_levels < tiling.packed_mips.standard_mip_count {
                                break;
                            }
                        }
                    }
                }
            }
            bind
        };

        tiles.push(SparseTile {
            bind,
            vk_memory: vk::DeviceMemory::null(),
            vk_offset: 0,
        });
    }
    tiles
}

/// Allocates and binds device memory for the image's metadata aspect, if the
/// driver reports one. The application may use or destroy the resource right
/// after creation, so the bind waits for the queue to go idle.
fn bind_sparse_metadata(
    device: &Device,
    desc: &ResourceDesc,
    vk_image: vk::Image,
) -> Result<Option<DeviceAllocation>> {
    let requirements_list = unsafe { device.raw.get_image_sparse_memory_requirements(vk_image) };

    let mut metadata_size = 0u64;
    let mut bind_count = 0usize;
    for requirements in &requirements_list {
        if !requirements
            .format_properties
            .aspect_mask
            .contains(vk::ImageAspectFlags::METADATA)
        {
            continue;
        }
        let layer_count = if requirements
            .format_properties
            .flags
            .contains(vk::SparseImageFormatFlags::SINGLE_MIPTAIL)
        {
            1
        } else {
            desc.layer_count()
        };
        metadata_size += u64::from(layer_count) * requirements.image_mip_tail_size;
        bind_count += layer_count as usize;
    }

    if metadata_size == 0 {
        return Ok(None);
    }

    trace!("allocating {} bytes of sparse metadata", metadata_size);

    let memory_requirements = unsafe { device.raw.get_image_memory_requirements(vk_image) };
    let allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(metadata_size)
        .build();
    let allocation = memory::allocate_memory(
        device,
        allocate_info,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        memory_requirements.memory_type_bits,
    )?;

    let mut memory_binds = Vec::with_capacity(bind_count);
    let mut memory_offset = 0u64;
    for requirements in &requirements_list {
        if !requirements
            .format_properties
            .aspect_mask
            .contains(vk::ImageAspectFlags::METADATA)
        {
            continue;
        }
        let layer_count = if requirements
            .format_properties
            .flags
            .contains(vk::SparseImageFormatFlags::SINGLE_MIPTAIL)
        {
            1
        } else {
            desc.layer_count()
        };
        for layer in 0..u64::from(layer_count) {
            memory_binds.push(
                vk::SparseMemoryBind::builder()
                    .resource_offset(
                        requirements.image_mip_tail_offset
                            + requirements.image_mip_tail_stride * layer,
                    )
                    .size(requirements.image_mip_tail_size)
                    .memory(allocation.vk_memory)
                    .memory_offset(memory_offset)
                    .flags(vk::SparseMemoryBindFlags::METADATA)
                    .build(),
            );
            memory_offset += requirements.image_mip_tail_size;
        }
    }

    let opaque_bind = vk::SparseImageOpaqueMemoryBindInfo::builder()
        .image(vk_image)
        .binds(&memory_binds)
        .build();
    let bind_info = vk::BindSparseInfo::builder()
        .image_opaque_binds(std::slice::from_ref(&opaque_bind))
        .build();

    let queue = device.queue.lock();
    let result = unsafe {
        device
            .raw
            .queue_bind_sparse(*queue, &[bind_info], vk::Fence::null())
            .and_then(|_| device.raw.queue_wait_idle(*queue))
    };
    drop(queue);

    if let Err(err) = result {
        error!("failed to bind sparse metadata, {:?}", err);
        unsafe { device.raw.free_memory(allocation.vk_memory, None) };
        return Err(err.into());
    }
    Ok(Some(allocation))
}

fn init_sparse_info(device: &Device, desc: &ResourceDesc, handle: ResourceHandle) -> Result<SparseInfo> {
    let (tiling, requirements) = match handle {
        ResourceHandle::Buffer(_) => (compute_buffer_tiling(desc), None),
        ResourceHandle::Image(vk_image) => {
            let requirements_list =
                unsafe { device.raw.get_image_sparse_memory_requirements(vk_image) };
            let requirements = requirements_list
                .into_iter()
                .find(|requirements| {
                    !requirements
                        .format_properties
                        .aspect_mask
                        .contains(vk::ImageAspectFlags::METADATA)
                })
                .ok_or_else(|| {
                    error!("failed to query sparse memory requirements");
                    Error::InvalidArgument("sparse image")
                })?;
            (compute_image_tiling(desc, &requirements), Some(requirements))
        }
    };

    let tiles = match &requirements {
        Some(requirements) => build_sparse_tiles(desc, requirements, &tiling),
        None => build_sparse_tiles(desc, &vk::SparseImageMemoryRequirements::default(), &tiling),
    };

    let metadata_allocation = match handle {
        ResourceHandle::Image(vk_image) => bind_sparse_metadata(device, desc, vk_image)?,
        ResourceHandle::Buffer(_) => None,
    };

    Ok(SparseInfo {
        tile_count: tiling.tile_count,
        tiles,
        tilings: tiling.tilings,
        packed_mips: tiling.packed_mips,
        tile_shape: tiling.tile_shape,
        metadata_allocation,
    })
}

impl Resource {
    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub fn gpu_virtual_address(&self) -> GpuVa {
        self.gpu_va
    }

    pub fn initial_state(&self) -> ResourceState {
        self.initial_state
    }

    pub fn is_buffer(&self) -> bool {
        self.desc.is_buffer()
    }

    pub fn is_texture(&self) -> bool {
        self.desc.is_texture()
    }

    pub fn tiling(&self) -> Option<ResourceTiling<'_>> {
        self.sparse.as_ref().map(|sparse| ResourceTiling {
            total_tile_count: sparse.tile_count,
            packed_mip_info: &sparse.packed_mips,
            tile_shape: &sparse.tile_shape,
            subresource_tilings: &sparse.tilings,
        })
    }

    pub(crate) fn vk_buffer(&self) -> Option<vk::Buffer> {
        match self.handle {
            ResourceHandle::Buffer(vk_buffer) => Some(vk_buffer),
            ResourceHandle::Image(_) => None,
        }
    }

    pub(crate) fn vk_image(&self) -> Option<vk::Image> {
        match self.handle {
            ResourceHandle::Image(vk_image) => Some(vk_image),
            ResourceHandle::Buffer(_) => None,
        }
    }

    /// Byte offset of this resource within the Vulkan object it is bound to.
    /// Placed buffers alias the heap's spanning buffer, so views and copies
    /// must add this offset to any resource-relative address.
    pub(crate) fn heap_offset(&self) -> u64 {
        match &self.backing {
            ResourceBacking::PlacedBuffer { offset, .. } | ResourceBacking::Placed { offset, .. } => *offset,
            _ => 0,
        }
    }

    /// Linear images stay in GENERAL so CPU access never requires a layout
    /// transition.
    pub(crate) fn pick_layout(&self, layout: vk::ImageLayout) -> vk::ImageLayout {
        if self.linear_tiling {
            vk::ImageLayout::GENERAL
        } else {
            layout
        }
    }

    fn mapping(&self) -> Option<(&DeviceAllocation, *mut u8, u64)> {
        match &self.backing {
            ResourceBacking::Committed { allocation, map_ptr } if !map_ptr.is_null() => {
                Some((allocation, *map_ptr, 0))
            }
            ResourceBacking::PlacedBuffer { heap, offset }
            | ResourceBacking::Placed { heap, offset }
                if !heap.map_ptr.is_null() =>
            {
                Some((&heap.allocation, heap.map_ptr, *offset))
            }
            _ => None,
        }
    }

    /// Maps a buffer subresource, returning a pointer into the persistently
    /// mapped heap memory. Texture mapping is not supported.
    pub fn map(&self, device: &Device, sub_resource: u32) -> Result<*mut u8> {
        if sub_resource >= self.desc.subresource_count() {
            warn!("subresource index {} is out of range", sub_resource);
            return Err(Error::InvalidArgument("subresource index"));
        }
        if self.is_texture() {
            warn!("mapping is not implemented for textures");
            return Err(Error::InvalidArgument("resource dimension"));
        }
        let (allocation, map_ptr, offset) = self.mapping().ok_or_else(|| {
            warn!("resource is not CPU accessible");
            Error::InvalidArgument("resource heap type")
        })?;

        if !memory::is_host_coherent(device, allocation) {
            let range = vk::MappedMemoryRange::builder()
                .memory(allocation.vk_memory)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build();
            unsafe { device.raw.invalidate_mapped_memory_ranges(&[range])? };
        }
        Ok(unsafe { map_ptr.add(offset as usize) })
    }

    pub fn unmap(&self, device: &Device, sub_resource: u32) -> Result<()> {
        if sub_resource >= self.desc.subresource_count() {
            warn!("subresource index {} is out of range", sub_resource);
            return Err(Error::InvalidArgument("subresource index"));
        }
        if let Some((allocation, _, _)) = self.mapping() {
            if !memory::is_host_coherent(device, allocation) {
                let range = vk::MappedMemoryRange::builder()
                    .memory(allocation.vk_memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build();
                unsafe { device.raw.flush_mapped_memory_ranges(&[range])? };
            }
        }
        Ok(())
    }

    pub(crate) fn create_committed(
        device: &Device,
        properties: &HeapProperties,
        heap_flags: HeapFlags,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<Arc<Resource>> {
        let mut desc = *desc;
        validate_heap_properties(&desc, properties, initial_state)?;
        if !initial_state.is_valid_initial_state() {
            warn!("invalid initial resource state {:?}", initial_state);
            return Err(Error::InvalidArgument("initial state"));
        }
        validate_resource_desc(&desc)?;

        if desc.is_buffer() {
            let vk_buffer = create_vk_buffer(device, Some(properties), desc.width, desc.flags)?;
            let alignment = if desc.alignment != 0 {
                desc.alignment
            } else {
                DEFAULT_RESOURCE_ALIGNMENT
            };
            let gpu_va = match device.va_allocator.allocate(alignment, desc.width, vk_buffer) {
                Ok(va) => va,
                Err(err) => {
                    error!("failed to allocate GPU virtual address");
                    unsafe { device.raw.destroy_buffer(vk_buffer, None) };
                    return Err(err);
                }
            };

            let allocation = match memory::allocate_buffer_memory(
                device,
                vk_buffer,
                properties,
                heap_flags | HeapFlags::ALLOW_ONLY_BUFFERS,
            ) {
                Ok(allocation) => allocation,
                Err(err) => {
                    device.va_allocator.free(gpu_va);
                    unsafe { device.raw.destroy_buffer(vk_buffer, None) };
                    return Err(err);
                }
            };
            let map_ptr = match memory::map_and_zero(device, &allocation) {
                Ok(map_ptr) => map_ptr,
                Err(err) => {
                    device.va_allocator.free(gpu_va);
                    unsafe {
                        device.raw.destroy_buffer(vk_buffer, None);
                        device.raw.free_memory(allocation.vk_memory, None);
                    }
                    return Err(err);
                }
            };

            Ok(Arc::new(Resource {
                desc,
                handle: ResourceHandle::Buffer(vk_buffer),
                backing: ResourceBacking::Committed { allocation, map_ptr },
                gpu_va,
                common_layout: vk::ImageLayout::UNDEFINED,
                linear_tiling: false,
                initial_state,
                sparse: None,
            }))
        } else {
            if desc.mip_levels == 0 {
                desc.mip_levels = desc.max_mip_level_count() as u16;
            }
            let image = create_vk_image(device, Some(properties), &desc)?;
            let allocation = match memory::allocate_image_memory(
                device,
                image.vk_image,
                properties,
                heap_flags,
            ) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { device.raw.destroy_image(image.vk_image, None) };
                    return Err(err);
                }
            };
            let map_ptr = match memory::map_and_zero(device, &allocation) {
                Ok(map_ptr) => map_ptr,
                Err(err) => {
                    unsafe {
                        device.raw.destroy_image(image.vk_image, None);
                        device.raw.free_memory(allocation.vk_memory, None);
                    }
                    return Err(err);
                }
            };

            Ok(Arc::new(Resource {
                desc,
                handle: ResourceHandle::Image(image.vk_image),
                backing: ResourceBacking::Committed { allocation, map_ptr },
                gpu_va: 0,
                common_layout: image.common_layout,
                linear_tiling: image.linear_tiling,
                initial_state,
                sparse: None,
            }))
        }
    }

    pub(crate) fn create_placed(
        device: &Device,
        heap: &Arc<Heap>,
        heap_offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<Arc<Resource>> {
        let mut desc = *desc;
        let heap_desc = heap.desc();

        let deny_flag = if desc.is_buffer() {
            HeapFlags::DENY_BUFFERS
        } else if desc
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL)
        {
            HeapFlags::DENY_RT_DS_TEXTURES
        } else {
            HeapFlags::DENY_NON_RT_DS_TEXTURES
        };
        if heap_desc.flags.contains(deny_flag) {
            warn!(
                "cannot create placed resource on a heap that denies {:?}",
                deny_flag
            );
            return Err(Error::InvalidArgument("heap flags"));
        }

        validate_heap_properties(&desc, &heap_desc.properties, initial_state)?;
        if !initial_state.is_valid_initial_state() {
            warn!("invalid initial resource state {:?}", initial_state);
            return Err(Error::InvalidArgument("initial state"));
        }
        validate_resource_desc(&desc)?;

        if desc.is_buffer() {
            let spanning = heap.spanning.as_ref().ok_or_else(|| {
                warn!("heap has no buffer to place into");
                Error::InvalidArgument("heap flags")
            })?;
            return Ok(Arc::new(Resource {
                desc,
                handle: ResourceHandle::Buffer(spanning.vk_buffer),
                backing: ResourceBacking::PlacedBuffer {
                    heap: Arc::clone(heap),
                    offset: heap_offset,
                },
                gpu_va: spanning.va + heap_offset,
                common_layout: vk::ImageLayout::UNDEFINED,
                linear_tiling: false,
                initial_state,
                sparse: None,
            }));
        }

        if desc.mip_levels == 0 {
            desc.mip_levels = desc.max_mip_level_count() as u16;
        }
        let image = create_vk_image(device, Some(&heap_desc.properties), &desc)?;
        let requirements = unsafe { device.raw.get_image_memory_requirements(image.vk_image) };

        let fits_heap = heap_offset % requirements.alignment == 0
            && requirements.memory_type_bits & (1u32 << heap.allocation.type_index) != 0;

        let backing = if fits_heap {
            match unsafe {
                device
                    .raw
                    .bind_image_memory(image.vk_image, heap.allocation.vk_memory, heap_offset)
            } {
                Ok(()) => ResourceBacking::Placed {
                    heap: Arc::clone(heap),
                    offset: heap_offset,
                },
                Err(err) => {
                    warn!("failed to bind placed texture memory, {:?}", err);
                    unsafe { device.raw.destroy_image(image.vk_image, None) };
                    return Err(err.into());
                }
            }
        } else {
            warn!(
                "placed texture is incompatible with its heap (offset {:#x}, alignment {:#x}, \
                 allowed types {:#x}), allocating dedicated memory",
                heap_offset, requirements.alignment, requirements.memory_type_bits
            );
            let allocation = match memory::allocate_image_memory(
                device,
                image.vk_image,
                &heap_desc.properties,
                heap_desc.flags,
            ) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { device.raw.destroy_image(image.vk_image, None) };
                    return Err(err);
                }
            };
            ResourceBacking::PlacedFallback { allocation }
        };

        Ok(Arc::new(Resource {
            desc,
            handle: ResourceHandle::Image(image.vk_image),
            backing,
            gpu_va: 0,
            common_layout: image.common_layout,
            linear_tiling: image.linear_tiling,
            initial_state,
            sparse: None,
        }))
    }

    pub(crate) fn create_reserved(
        device: &Device,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<Arc<Resource>> {
        if !device.caps.sparse_binding {
            warn!("sparse binding is not supported by the device");
            return Err(Error::NotImplemented("sparse binding"));
        }
        let mut desc = *desc;
        if !initial_state.is_valid_initial_state() {
            warn!("invalid initial resource state {:?}", initial_state);
            return Err(Error::InvalidArgument("initial state"));
        }
        validate_resource_desc(&desc)?;

        let (handle, gpu_va, common_layout, linear_tiling) = if desc.is_buffer() {
            let vk_buffer = create_vk_buffer(device, None, desc.width, desc.flags)?;
            let gpu_va = match device.va_allocator.allocate(
                DEFAULT_RESOURCE_ALIGNMENT,
                desc.width,
                vk_buffer,
            ) {
                Ok(va) => va,
                Err(err) => {
                    error!("failed to allocate GPU virtual address");
                    unsafe { device.raw.destroy_buffer(vk_buffer, None) };
                    return Err(err);
                }
            };
            (
                ResourceHandle::Buffer(vk_buffer),
                gpu_va,
                vk::ImageLayout::UNDEFINED,
                false,
            )
        } else {
            if desc.mip_levels == 0 {
                desc.mip_levels = desc.max_mip_level_count() as u16;
            }
            let image = create_vk_image(device, None, &desc)?;
            (
                ResourceHandle::Image(image.vk_image),
                0,
                image.common_layout,
                image.linear_tiling,
            )
        };

        let sparse = match init_sparse_info(device, &desc, handle) {
            Ok(sparse) => sparse,
            Err(err) => {
                unsafe {
                    match handle {
                        ResourceHandle::Buffer(vk_buffer) => {
                            if gpu_va != 0 {
                                device.va_allocator.free(gpu_va);
                            }
                            device.raw.destroy_buffer(vk_buffer, None);
                        }
                        ResourceHandle::Image(vk_image) => device.raw.destroy_image(vk_image, None),
                    }
                }
                return Err(err);
            }
        };

        Ok(Arc::new(Resource {
            desc,
            handle,
            backing: ResourceBacking::Reserved,
            gpu_va,
            common_layout,
            linear_tiling,
            initial_state,
            sparse: Some(sparse),
        }))
    }

    /// Wraps an externally owned image, typically a swapchain image. The
    /// returned resource never destroys the Vulkan handle.
    pub fn from_external(desc: &ResourceDesc, vk_image: vk::Image) -> Arc<Resource> {
        Arc::new(Resource {
            desc: *desc,
            handle: ResourceHandle::Image(vk_image),
            backing: ResourceBacking::External,
            gpu_va: 0,
            common_layout: common_image_layout_for_desc(desc),
            linear_tiling: false,
            initial_state: ResourceState::COMMON,
            sparse: None,
        })
    }

    pub(crate) fn destroy(&self, device: &Device) {
        if let ResourceBacking::External = self.backing {
            return;
        }

        unsafe {
            if let Some(sparse) = &self.sparse {
                if let Some(allocation) = &sparse.metadata_allocation {
                    device.raw.free_memory(allocation.vk_memory, None);
                }
            }

            let placed_buffer = matches!(self.backing, ResourceBacking::PlacedBuffer { .. });
            if !placed_buffer {
                if self.gpu_va != 0 {
                    device.va_allocator.free(self.gpu_va);
                }
                match self.handle {
                    ResourceHandle::Buffer(vk_buffer) => device.raw.destroy_buffer(vk_buffer, None),
                    ResourceHandle::Image(vk_image) => device.raw.destroy_image(vk_image, None),
                }
            }

            match &self.backing {
                ResourceBacking::Committed { allocation, map_ptr } => {
                    if !map_ptr.is_null() {
                        device.raw.unmap_memory(allocation.vk_memory);
                    }
                    device.raw.free_memory(allocation.vk_memory, None);
                }
                ResourceBacking::PlacedFallback { allocation } => {
                    device.raw.free_memory(allocation.vk_memory, None);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod desc_tests {
    use super::*;

    #[test]
    fn buffer_validation() {
        assert!(validate_resource_desc(&ResourceDesc::buffer(0x10000)).is_ok());

        let mut desc = ResourceDesc::buffer(0x10000);
        desc.mip_levels = 2;
        assert!(validate_resource_desc(&desc).is_err());

        let mut desc = ResourceDesc::buffer(0x10000);
        desc.format = Format::R32Uint;
        assert!(validate_resource_desc(&desc).is_err());

        let mut desc = ResourceDesc::buffer(0x10000);
        desc.layout = TextureLayout::Unknown;
        assert!(validate_resource_desc(&desc).is_err());

        let mut desc = ResourceDesc::buffer(0x10000);
        desc.height = 2;
        assert!(validate_resource_desc(&desc).is_err());

        let mut desc = ResourceDesc::buffer(0x10000);
        desc.alignment = DEFAULT_RESOURCE_ALIGNMENT;
        assert!(validate_resource_desc(&desc).is_ok());
        desc.alignment = 0x100;
        assert!(validate_resource_desc(&desc).is_err());
    }

    #[test]
    fn texture_validation() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256);
        assert!(validate_resource_desc(&desc).is_ok());

        desc.format = Format::Unknown;
        assert!(validate_resource_desc(&desc).is_err());

        let mut desc = ResourceDesc::texture_2d(Format::Bc1Unorm, 256, 256);
        assert!(validate_resource_desc(&desc).is_ok());
        desc.width = 250;
        assert!(validate_resource_desc(&desc).is_err());

        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 128, 1);
        desc.dimension = ResourceDimension::Texture1D;
        assert!(validate_resource_desc(&desc).is_ok());
        desc.height = 4;
        assert!(validate_resource_desc(&desc).is_err());
    }

    #[test]
    fn small_alignment_eligibility() {
        // 64x64 RGBA8 is 16 KiB per slice and fits the small alignment.
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 64, 64);
        desc.alignment = SMALL_RESOURCE_ALIGNMENT;
        assert!(validate_resource_desc(&desc).is_ok());

        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 1024, 1024);
        desc.alignment = SMALL_RESOURCE_ALIGNMENT;
        assert!(validate_resource_desc(&desc).is_err());
    }

    #[test]
    fn heap_properties_validation() {
        let upload = HeapProperties::new(HeapType::Upload);
        let readback = HeapProperties::new(HeapType::Readback);
        let default = HeapProperties::new(HeapType::Default);

        let buffer = ResourceDesc::buffer(0x10000);
        assert!(validate_heap_properties(&buffer, &upload, ResourceState::GENERIC_READ).is_ok());
        assert!(validate_heap_properties(&buffer, &upload, ResourceState::COPY_DEST).is_err());
        assert!(validate_heap_properties(&buffer, &readback, ResourceState::COPY_DEST).is_ok());
        assert!(
            validate_heap_properties(&buffer, &readback, ResourceState::GENERIC_READ).is_err()
        );

        let texture = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 64, 64);
        assert!(validate_heap_properties(&texture, &upload, ResourceState::GENERIC_READ).is_err());
        assert!(validate_heap_properties(&texture, &default, ResourceState::COMMON).is_ok());

        let mut uav_buffer = ResourceDesc::buffer(0x10000);
        uav_buffer.flags = ResourceFlags::ALLOW_UNORDERED_ACCESS;
        assert!(
            validate_heap_properties(&uav_buffer, &upload, ResourceState::GENERIC_READ).is_err()
        );
    }

    #[test]
    fn initial_state_validity() {
        assert!(ResourceState::COMMON.is_valid_initial_state());
        assert!(ResourceState::GENERIC_READ.is_valid_initial_state());
        assert!(ResourceState::RENDER_TARGET.is_valid_initial_state());
        assert!((ResourceState::COPY_SOURCE | ResourceState::PIXEL_SHADER_RESOURCE)
            .is_valid_initial_state());
        assert!(!(ResourceState::RENDER_TARGET | ResourceState::COPY_DEST)
            .is_valid_initial_state());
        assert!(!(ResourceState::UNORDERED_ACCESS | ResourceState::COPY_SOURCE)
            .is_valid_initial_state());
    }

    #[test]
    fn common_layout_selection() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 64, 64);
        assert_eq!(
            common_image_layout_for_desc(&desc),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );

        desc.flags = ResourceFlags::ALLOW_UNORDERED_ACCESS;
        assert_eq!(common_image_layout_for_desc(&desc), vk::ImageLayout::GENERAL);

        desc.flags = ResourceFlags::ALLOW_DEPTH_STENCIL | ResourceFlags::DENY_SHADER_RESOURCE;
        assert_eq!(
            common_image_layout_for_desc(&desc),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );

        desc.flags = ResourceFlags::ALLOW_DEPTH_STENCIL;
        assert_eq!(
            common_image_layout_for_desc(&desc),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn mip_dimensions() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 128);
        desc.mip_levels = 9;
        assert_eq!(desc.width(0), 256);
        assert_eq!(desc.width(8), 1);
        assert_eq!(desc.height(7), 1);
        assert_eq!(desc.max_mip_level_count(), 9);

        desc.depth_or_array_size = 6;
        assert_eq!(desc.layer_count(), 6);
        assert_eq!(desc.subresource_count(), 54);

        desc.dimension = ResourceDimension::Texture3D;
        assert_eq!(desc.layer_count(), 1);
        assert_eq!(desc.depth(1), 3);
    }
}

#[cfg(test)]
mod tiling_tests {
    use super::*;

    fn sparse_requirements(
        granularity: vk::Extent3D,
        mip_tail_first_lod: u32,
        mip_tail_size: u64,
        single_miptail: bool,
    ) -> vk::SparseImageMemoryRequirements {
        vk::SparseImageMemoryRequirements {
            format_properties: vk::SparseImageFormatProperties {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                image_granularity: granularity,
                flags: if single_miptail {
                    vk::SparseImageFormatFlags::SINGLE_MIPTAIL
                } else {
                    vk::SparseImageFormatFlags::empty()
                },
            },
            image_mip_tail_first_lod: mip_tail_first_lod,
            image_mip_tail_size: mip_tail_size,
            image_mip_tail_offset: 0x100000,
            image_mip_tail_stride: 0x40000,
        }
    }

    #[test]
    fn buffer_tiling() {
        let desc = ResourceDesc::buffer(0x28000);
        let tiling = compute_buffer_tiling(&desc);
        assert_eq!(tiling.tile_count, 3);
        assert_eq!(tiling.tile_shape.width_in_texels, TILE_SIZE as u32);
        assert_eq!(tiling.tilings.len(), 1);
        assert_eq!(tiling.tilings[0].width_in_tiles, 3);

        let tiles = build_sparse_tiles(
            &desc,
            &vk::SparseImageMemoryRequirements::default(),
            &tiling,
        );
        assert_eq!(tiles.len(), 3);
        match tiles[2].bind {
            TileBind::Memory { offset, size } => {
                assert_eq!(offset, 2 * TILE_SIZE);
                assert_eq!(size, 0x8000);
            }
            _ => panic!("expected memory bind"),
        }
    }

    #[test]
    fn image_tiling_with_packed_tail() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 512, 512);
        desc.mip_levels = 4;
        desc.depth_or_array_size = 2;

        let requirements = sparse_requirements(
            vk::Extent3D {
                width: 128,
                height: 128,
                depth: 1,
            },
            2,
            0x20000,
            true,
        );
        let tiling = compute_image_tiling(&desc, &requirements);

        assert_eq!(tiling.packed_mips.standard_mip_count, 2);
        assert_eq!(tiling.packed_mips.packed_mip_count, 2);
        // Single mip tail is shared across both layers.
        assert_eq!(tiling.packed_mips.packed_tile_count, 2);

        // 16 + 4 standard tiles per layer.
        assert_eq!(tiling.packed_mips.start_tile_index, 40);
        assert_eq!(tiling.tile_count, 42);

        assert_eq!(tiling.tilings.len(), 8);
        assert_eq!(tiling.tilings[0].width_in_tiles, 4);
        assert_eq!(tiling.tilings[1].start_tile_index, 16);
        assert_eq!(tiling.tilings[2].width_in_tiles, 0);
        assert_eq!(tiling.tilings[2].start_tile_index, u32::MAX);
        assert_eq!(tiling.tilings[4].start_tile_index, 20);
    }

    #[test]
    fn mip_tail_multiplies_by_layers_without_single_miptail() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 512, 512);
        desc.mip_levels = 4;
        desc.depth_or_array_size = 3;

        let requirements = sparse_requirements(
            vk::Extent3D {
                width: 128,
                height: 128,
                depth: 1,
            },
            2,
            0x20000,
            false,
        );
        let tiling = compute_image_tiling(&desc, &requirements);
        assert_eq!(tiling.packed_mips.packed_tile_count, 6);
    }

    #[test]
    fn image_without_mip_tail() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256);
        desc.mip_levels = 2;

        let requirements = sparse_requirements(
            vk::Extent3D {
                width: 128,
                height: 128,
                depth: 1,
            },
            0,
            0,
            true,
        );
        let tiling = compute_image_tiling(&desc, &requirements);
        assert_eq!(tiling.packed_mips.standard_mip_count, 2);
        assert_eq!(tiling.packed_mips.packed_tile_count, 0);
        assert_eq!(tiling.packed_mips.start_tile_index, 0);
        assert_eq!(tiling.tile_count, 5);
    }

    #[test]
    fn tile_regions_clamp_to_mip_extent() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 192, 192);
        desc.mip_levels = 1;

        let requirements = sparse_requirements(
            vk::Extent3D {
                width: 128,
                height: 128,
                depth: 1,
            },
            1,
            0,
            true,
        );
        let tiling = compute_image_tiling(&desc, &requirements);
        assert_eq!(tiling.tile_count, 4);

        let tiles = build_sparse_tiles(&desc, &requirements, &tiling);
        match tiles[3].bind {
            TileBind::Image { offset, extent, subresource } => {
                assert_eq!(offset.x, 128);
                assert_eq!(offset.y, 128);
                assert_eq!(extent.width, 64);
                assert_eq!(extent.height, 64);
                assert_eq!(subresource.mip_level, 0);
            }
            _ => panic!("expected image bind"),
        }
        assert!(tiles
            .iter()
            .all(|tile| tile.vk_memory == vk::DeviceMemory::null()));
    }

    #[test]
    fn packed_tiles_bind_into_mip_tail() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256);
        desc.mip_levels = 3;

        let requirements = sparse_requirements(
            vk::Extent3D {
                width: 128,
                height: 128,
                depth: 1,
            },
            1,
            0x18000,
            true,
        );
        let tiling = compute_image_tiling(&desc, &requirements);
        assert_eq!(tiling.packed_mips.start_tile_index, 4);
        assert_eq!(tiling.tile_count, 6);

        let tiles = build_sparse_tiles(&desc, &requirements, &tiling);
        match tiles[5].bind {
            TileBind::Memory { offset, size } => {
                assert_eq!(offset, 0x100000 + TILE_SIZE);
                assert_eq!(size, 0x8000);
            }
            _ => panic!("expected memory bind"),
        }
    }
}
