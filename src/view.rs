//! Typed views over buffers, images and samplers.
//!
//! Descriptor slots never hold raw Vulkan handles; they hold reference
//! counted [`View`] objects so that copying a descriptor and concurrently
//! rewriting its source cannot leave a dangling handle behind. The last slot
//! to give up a view may do so on any thread, so a view carries its own
//! handle to the logical device and destroys its Vulkan objects on drop.
//!
//! Creation follows the D3D12 rules: a view description is optional wherever
//! D3D12 allows inheriting the shape of the resource, formats are resolved
//! against the resource format (typeless families, depth/stencil aspects),
//! and component swizzles forced by emulated formats are composed with the
//! caller's mapping.

use std::fmt;
use std::mem;
use std::sync::Arc;

use ash::vk;

use crate::bindless::BindlessFlags;
use crate::conv;
use crate::device::{Device, NULL_BUFFER_SIZE};
use crate::format::{Format, FormatInfo};
use crate::resource::{Resource, ResourceDimension, ResourceFlags};
use crate::root_signature::StaticSamplerDesc;
use crate::{ComparisonFunc, Error, Result};

/// Source of one output component of a shader resource view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentSwizzle {
    Identity,
    Zero,
    One,
    R,
    G,
    B,
    A,
}

/// Four-component shader swizzle applied on top of the format's own mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentMapping {
    pub r: ComponentSwizzle,
    pub g: ComponentSwizzle,
    pub b: ComponentSwizzle,
    pub a: ComponentSwizzle,
}

impl ComponentMapping {
    pub const IDENTITY: ComponentMapping = ComponentMapping {
        r: ComponentSwizzle::Identity,
        g: ComponentSwizzle::Identity,
        b: ComponentSwizzle::Identity,
        a: ComponentSwizzle::Identity,
    };
}

impl Default for ComponentMapping {
    fn default() -> Self {
        Self::IDENTITY
    }
}

bitflags! {
    /// Buffer view addressing flags.
    pub struct BufferViewFlags: u32 {
        /// Raw (byte address) buffer; the view format must be `R32Typeless`.
        const RAW = 0x1;
    }
}

/// Element window of a buffer view.
#[derive(Clone, Copy, Debug)]
pub struct BufferRange {
    pub first_element: u64,
    pub num_elements: u32,
    /// Non-zero for structured buffers; the view format must be `Unknown`.
    pub structure_byte_stride: u32,
    pub flags: BufferViewFlags,
}

#[derive(Clone, Copy, Debug)]
pub enum SrvDimension {
    Buffer(BufferRange),
    Texture1D {
        most_detailed_mip: u32,
        mip_levels: u32,
    },
    Texture1DArray {
        most_detailed_mip: u32,
        mip_levels: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    Texture2D {
        most_detailed_mip: u32,
        mip_levels: u32,
    },
    Texture2DArray {
        most_detailed_mip: u32,
        mip_levels: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    Texture2DMs,
    Texture2DMsArray {
        first_array_slice: u32,
        array_size: u32,
    },
    Texture3D {
        most_detailed_mip: u32,
        mip_levels: u32,
    },
    TextureCube {
        most_detailed_mip: u32,
        mip_levels: u32,
    },
    TextureCubeArray {
        most_detailed_mip: u32,
        mip_levels: u32,
        first_2d_array_face: u32,
        num_cubes: u32,
    },
}

/// Shader resource view description.
#[derive(Clone, Copy, Debug)]
pub struct SrvDesc {
    pub format: Format,
    pub component_mapping: ComponentMapping,
    pub dimension: SrvDimension,
}

#[derive(Clone, Copy, Debug)]
pub enum UavDimension {
    Buffer {
        range: BufferRange,
        counter_offset_in_bytes: u64,
    },
    Texture1D {
        mip_slice: u32,
    },
    Texture1DArray {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    Texture2D {
        mip_slice: u32,
    },
    Texture2DArray {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    Texture3D {
        mip_slice: u32,
        first_w_slice: u32,
        w_size: u32,
    },
}

/// Unordered access view description.
#[derive(Clone, Copy, Debug)]
pub struct UavDesc {
    pub format: Format,
    pub dimension: UavDimension,
}

#[derive(Clone, Copy, Debug)]
pub enum RtvDimension {
    Texture1D {
        mip_slice: u32,
    },
    Texture1DArray {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    Texture2D {
        mip_slice: u32,
    },
    Texture2DArray {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    Texture2DMs,
    Texture2DMsArray {
        first_array_slice: u32,
        array_size: u32,
    },
    /// Renders into a window of W slices through a 2D array view.
    Texture3D {
        mip_slice: u32,
        first_w_slice: u32,
        w_size: u32,
    },
}

/// Render target view description.
#[derive(Clone, Copy, Debug)]
pub struct RtvDesc {
    pub format: Format,
    pub dimension: RtvDimension,
}

bitflags! {
    /// Read-only aspects of a depth/stencil view.
    pub struct DsvFlags: u32 {
        const READ_ONLY_DEPTH = 0x1;
        const READ_ONLY_STENCIL = 0x2;
    }
}

#[derive(Clone, Copy, Debug)]
pub enum DsvDimension {
    Texture1D {
        mip_slice: u32,
    },
    Texture1DArray {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    Texture2D {
        mip_slice: u32,
    },
    Texture2DArray {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    Texture2DMs,
    Texture2DMsArray {
        first_array_slice: u32,
        array_size: u32,
    },
}

/// Depth/stencil view description.
#[derive(Clone, Copy, Debug)]
pub struct DsvDesc {
    pub format: Format,
    pub flags: DsvFlags,
    pub dimension: DsvDimension,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterType {
    Point,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterReduction {
    Standard,
    Comparison,
    Minimum,
    Maximum,
}

/// Decoded D3D12 filter: per-stage minification/magnification/mip filters
/// plus the reduction mode, with anisotropy as an orthogonal switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Filter {
    pub min: FilterType,
    pub mag: FilterType,
    pub mip: FilterType,
    pub anisotropic: bool,
    pub reduction: FilterReduction,
}

impl Filter {
    pub const MIN_MAG_MIP_POINT: Filter = Filter {
        min: FilterType::Point,
        mag: FilterType::Point,
        mip: FilterType::Point,
        anisotropic: false,
        reduction: FilterReduction::Standard,
    };

    pub const MIN_MAG_MIP_LINEAR: Filter = Filter {
        min: FilterType::Linear,
        mag: FilterType::Linear,
        mip: FilterType::Linear,
        anisotropic: false,
        reduction: FilterReduction::Standard,
    };

    pub const ANISOTROPIC: Filter = Filter {
        min: FilterType::Linear,
        mag: FilterType::Linear,
        mip: FilterType::Linear,
        anisotropic: true,
        reduction: FilterReduction::Standard,
    };

    /// Same filtering with depth-comparison reduction.
    pub fn comparison(mut self) -> Filter {
        self.reduction = FilterReduction::Comparison;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
    MirrorOnce,
}

/// Border colors representable in a static sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticBorderColor {
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

impl StaticBorderColor {
    pub fn color(self) -> [f32; 4] {
        match self {
            StaticBorderColor::TransparentBlack => [0.0, 0.0, 0.0, 0.0],
            StaticBorderColor::OpaqueBlack => [0.0, 0.0, 0.0, 1.0],
            StaticBorderColor::OpaqueWhite => [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// Sampler description.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison_func: ComparisonFunc,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

/// The Vulkan object a view wraps.
#[derive(Clone, Copy)]
pub enum ViewHandle {
    Buffer(vk::BufferView),
    Image(vk::ImageView),
    Sampler(vk::Sampler),
}

/// Per-kind metadata needed to write the view into a descriptor set later.
#[derive(Clone, Copy)]
pub enum ViewInfo {
    Buffer {
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    Texture {
        vk_view_type: vk::ImageViewType,
        vk_layout: vk::ImageLayout,
        miplevel_idx: u32,
        layer_idx: u32,
        layer_count: u32,
    },
    Sampler,
}

/// Structured buffer UAV counter attachment.
#[derive(Clone, Copy)]
pub enum UavCounter {
    None,
    /// Typed `R32Uint` view over the 4-byte counter slot.
    BufferView(vk::BufferView),
    /// Raw device address of the counter slot, for bindless counter arrays.
    Address(vk::DeviceAddress),
}

/// A created view plus the metadata descriptor writes need.
///
/// Slots share views across descriptor heaps through `Arc`; the Vulkan
/// objects are destroyed when the last slot releases its clone.
pub struct View {
    device: Arc<ash::Device>,
    pub(crate) handle: ViewHandle,
    pub(crate) format: Format,
    pub(crate) info: ViewInfo,
    pub(crate) counter: UavCounter,
}

impl View {
    fn buffer(
        device: &Device,
        vk_view: vk::BufferView,
        format: Format,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> View {
        View {
            device: device.raw.clone(),
            handle: ViewHandle::Buffer(vk_view),
            format,
            info: ViewInfo::Buffer { offset, size },
            counter: UavCounter::None,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn vk_buffer_view(&self) -> Option<vk::BufferView> {
        match self.handle {
            ViewHandle::Buffer(vk_view) => Some(vk_view),
            _ => None,
        }
    }

    pub fn vk_image_view(&self) -> Option<vk::ImageView> {
        match self.handle {
            ViewHandle::Image(vk_view) => Some(vk_view),
            _ => None,
        }
    }

    pub fn vk_sampler(&self) -> Option<vk::Sampler> {
        match self.handle {
            ViewHandle::Sampler(vk_sampler) => Some(vk_sampler),
            _ => None,
        }
    }

    /// Image layout shader access to this view expects.
    pub fn vk_layout(&self) -> vk::ImageLayout {
        match self.info {
            ViewInfo::Texture { vk_layout, .. } => vk_layout,
            _ => vk::ImageLayout::UNDEFINED,
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.handle {
            ViewHandle::Buffer(_) => fmt.write_str("View::Buffer"),
            ViewHandle::Image(_) => fmt.write_str("View::Image"),
            ViewHandle::Sampler(_) => fmt.write_str("View::Sampler"),
        }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        unsafe {
            match self.handle {
                ViewHandle::Buffer(vk_view) => self.device.destroy_buffer_view(vk_view, None),
                ViewHandle::Image(vk_view) => self.device.destroy_image_view(vk_view, None),
                ViewHandle::Sampler(vk_sampler) => self.device.destroy_sampler(vk_sampler, None),
            }
            if let UavCounter::BufferView(vk_view) = self.counter {
                self.device.destroy_buffer_view(vk_view, None);
            }
        }
    }
}

fn required_texel_buffer_alignment(device: &Device, info: &FormatInfo) -> vk::DeviceSize {
    if let Some(props) = &device.caps.texel_buffer_alignment {
        let alignment = props.storage_alignment.max(props.uniform_alignment);

        if props.storage_single_texel && props.uniform_single_texel {
            return vk::DeviceSize::from(info.block_byte_count).min(alignment);
        }

        return alignment;
    }

    device.limits.min_texel_buffer_offset_alignment
}

fn create_vk_buffer_view(
    device: &Device,
    vk_buffer: vk::Buffer,
    format: Format,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> Result<vk::BufferView> {
    if format.is_block_compressed() {
        warn!("invalid buffer view format {:?}", format);
        return Err(Error::InvalidArgument(
            "buffer views require an uncompressed format",
        ));
    }

    let alignment = required_texel_buffer_alignment(device, &format.info());
    if offset % alignment != 0 {
        warn!(
            "buffer view offset {:#x} violates the required alignment {:#x}",
            offset, alignment
        );
    }

    let view_info = vk::BufferViewCreateInfo::builder()
        .buffer(vk_buffer)
        .format(format.vk_format())
        .offset(offset)
        .range(range);

    let vk_view = unsafe { device.raw.create_buffer_view(&view_info, None) }?;
    Ok(vk_view)
}

/// Picks the element format and size for a buffer view: raw views read
/// `R32Uint` words, structured views use the stride with a nominal `R32Uint`
/// format, and typed views take the element size from the resolved format.
fn buffer_view_format(
    resource_format: Format,
    view_format: Format,
    structure_stride: u32,
    flags: BufferViewFlags,
) -> Result<(Format, vk::DeviceSize)> {
    if view_format == Format::R32Typeless && flags.contains(BufferViewFlags::RAW) {
        let format = Format::R32Uint;
        return Ok((format, vk::DeviceSize::from(format.info().block_byte_count)));
    }

    if view_format == Format::Unknown && structure_stride != 0 {
        return Ok((Format::R32Uint, vk::DeviceSize::from(structure_stride)));
    }

    let format = if view_format == Format::Unknown {
        resource_format
    } else {
        view_format
    };
    if format == Format::Unknown {
        warn!("no element format for buffer view over {:?}", resource_format);
        return Err(Error::InvalidArgument(
            "buffer views require a format or a structure stride",
        ));
    }

    Ok((format, vk::DeviceSize::from(format.info().block_byte_count)))
}

/// Creates a typed view over a window of a buffer resource. Placed buffers
/// alias their heap's spanning buffer, so the resource's heap offset is
/// folded into the view offset.
pub(crate) fn create_buffer_view_for_resource(
    device: &Device,
    resource: &Resource,
    view_format: Format,
    range: &BufferRange,
) -> Result<View> {
    let vk_buffer = resource
        .vk_buffer()
        .ok_or(Error::InvalidArgument("buffer views require a buffer resource"))?;

    let (format, element_size) = buffer_view_format(
        resource.desc().format,
        view_format,
        range.structure_byte_stride,
        range.flags,
    )?;

    let offset = resource.heap_offset() + range.first_element * element_size;
    let size = vk::DeviceSize::from(range.num_elements) * element_size;

    let vk_view = create_vk_buffer_view(device, vk_buffer, format, offset, size)?;
    Ok(View::buffer(device, vk_view, format, offset, size))
}

/// Fully resolved shape of an image view before it is created.
struct TextureViewDesc {
    format: Format,
    info: FormatInfo,
    view_type: vk::ImageViewType,
    layout: vk::ImageLayout,
    miplevel_idx: u32,
    miplevel_count: u32,
    layer_idx: u32,
    layer_count: u32,
    components: ComponentMapping,
    allowed_swizzle: bool,
}

/// Shape inherited from the resource when the caller gives no description:
/// first mip only, every layer, view type from the resource dimension.
fn default_texture_view_desc(resource: &Resource, view_format: Format) -> Result<TextureViewDesc> {
    let desc = resource.desc();
    let format = if view_format == Format::Unknown {
        desc.format
    } else {
        view_format
    };
    if format == Format::Unknown {
        warn!(
            "no format for view (resource format {:?}, view format {:?})",
            desc.format, view_format
        );
        return Err(Error::InvalidArgument("texture views require a format"));
    }
    let info = format.info_for_usage(desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL));

    let view_type = match desc.dimension {
        ResourceDimension::Texture1D => {
            if desc.depth_or_array_size > 1 {
                vk::ImageViewType::TYPE_1D_ARRAY
            } else {
                vk::ImageViewType::TYPE_1D
            }
        }
        ResourceDimension::Texture2D => {
            if desc.depth_or_array_size > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            }
        }
        ResourceDimension::Texture3D => vk::ImageViewType::TYPE_3D,
        ResourceDimension::Buffer => {
            return Err(Error::InvalidArgument(
                "texture views require a texture resource",
            ));
        }
    };

    Ok(TextureViewDesc {
        format,
        info,
        view_type,
        layout: resource.common_layout,
        miplevel_idx: 0,
        miplevel_count: 1,
        layer_idx: 0,
        layer_count: desc.layer_count(),
        components: ComponentMapping::IDENTITY,
        allowed_swizzle: false,
    })
}

/// Base component mapping forced by formats we emulate with a swizzle:
/// stencil-only aspects read into green, `A8Unorm` is backed by `R8Unorm`,
/// and the X8 channel of `B8G8R8X8Unorm` reads as one.
fn view_swizzle_for_format(
    format: Format,
    info: &FormatInfo,
    allowed_swizzle: bool,
) -> vk::ComponentMapping {
    let mut components = vk::ComponentMapping {
        r: vk::ComponentSwizzle::R,
        g: vk::ComponentSwizzle::G,
        b: vk::ComponentSwizzle::B,
        a: vk::ComponentSwizzle::A,
    };

    if info.aspect_mask == vk::ImageAspectFlags::STENCIL {
        if allowed_swizzle {
            components = vk::ComponentMapping {
                r: vk::ComponentSwizzle::ZERO,
                g: vk::ComponentSwizzle::R,
                b: vk::ComponentSwizzle::ZERO,
                a: vk::ComponentSwizzle::ZERO,
            };
        } else {
            warn!("stencil swizzle is not supported for {:?}", format);
        }
    }

    if format == Format::A8Unorm {
        if allowed_swizzle {
            components = vk::ComponentMapping {
                r: vk::ComponentSwizzle::ZERO,
                g: vk::ComponentSwizzle::ZERO,
                b: vk::ComponentSwizzle::ZERO,
                a: vk::ComponentSwizzle::R,
            };
        } else {
            warn!("alpha swizzle is not supported");
        }
    }

    if format == Format::B8G8R8X8Unorm {
        if allowed_swizzle {
            components = vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::ONE,
            };
        } else {
            warn!("B8G8R8X8 swizzle is not supported");
        }
    }

    components
}

fn swizzle_component(
    base: &vk::ComponentMapping,
    component: vk::ComponentSwizzle,
    swizzle: ComponentSwizzle,
) -> vk::ComponentSwizzle {
    match swizzle {
        ComponentSwizzle::Identity => component,
        ComponentSwizzle::Zero => vk::ComponentSwizzle::ZERO,
        ComponentSwizzle::One => vk::ComponentSwizzle::ONE,
        ComponentSwizzle::R => base.r,
        ComponentSwizzle::G => base.g,
        ComponentSwizzle::B => base.b,
        ComponentSwizzle::A => base.a,
    }
}

/// Applies the caller's mapping on top of the format's base mapping, so a
/// caller selecting "red" picks up whatever the format routed into red.
fn compose_component_mappings(
    base: vk::ComponentMapping,
    over: ComponentMapping,
) -> vk::ComponentMapping {
    vk::ComponentMapping {
        r: swizzle_component(&base, base.r, over.r),
        g: swizzle_component(&base, base.g, over.g),
        b: swizzle_component(&base, base.b, over.b),
        a: swizzle_component(&base, base.a, over.a),
    }
}

fn create_texture_view(device: &Device, vk_image: vk::Image, desc: &TextureViewDesc) -> Result<View> {
    let mut components = view_swizzle_for_format(desc.format, &desc.info, desc.allowed_swizzle);
    if desc.allowed_swizzle {
        components = compose_component_mappings(components, desc.components);
    }

    let view_info = vk::ImageViewCreateInfo::builder()
        .image(vk_image)
        .view_type(desc.view_type)
        .format(desc.info.vk_format)
        .components(components)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: desc.info.aspect_mask,
            base_mip_level: desc.miplevel_idx,
            level_count: desc.miplevel_count,
            base_array_layer: desc.layer_idx,
            layer_count: desc.layer_count,
        });

    let vk_view = unsafe { device.raw.create_image_view(&view_info, None) }?;
    Ok(View {
        device: device.raw.clone(),
        handle: ViewHandle::Image(vk_view),
        format: desc.format,
        info: ViewInfo::Texture {
            vk_view_type: desc.view_type,
            vk_layout: desc.layout,
            miplevel_idx: desc.miplevel_idx,
            layer_idx: desc.layer_idx,
            layer_count: desc.layer_count,
        },
        counter: UavCounter::None,
    })
}

/// Builds the descriptor payload for a shader resource view. `None` means
/// the device writes a robustness2 null descriptor for the slot.
pub(crate) fn create_srv(
    device: &Device,
    resource: Option<&Resource>,
    desc: Option<&SrvDesc>,
) -> Result<(Option<Arc<View>>, vk::DescriptorType)> {
    let resource = match resource {
        Some(resource) => resource,
        None => return create_null_srv(device, desc),
    };

    if resource.is_buffer() {
        return create_buffer_srv(device, resource, desc);
    }
    create_texture_srv(device, resource, desc)
}

fn create_null_srv(
    device: &Device,
    desc: Option<&SrvDesc>,
) -> Result<(Option<Arc<View>>, vk::DescriptorType)> {
    let desc = desc.ok_or(Error::InvalidArgument(
        "null shader resource views require a view description",
    ))?;

    match desc.dimension {
        SrvDimension::Buffer(_) => {
            if device.caps.null_descriptor {
                return Ok((None, vk::DescriptorType::UNIFORM_TEXEL_BUFFER));
            }

            let vk_view = create_vk_buffer_view(
                device,
                device.null_resources.vk_buffer,
                Format::R32Uint,
                0,
                NULL_BUFFER_SIZE,
            )?;
            let view = View::buffer(device, vk_view, Format::R32Uint, 0, NULL_BUFFER_SIZE);
            Ok((Some(Arc::new(view)), vk::DescriptorType::UNIFORM_TEXEL_BUFFER))
        }
        SrvDimension::Texture2D { .. } | SrvDimension::Texture2DArray { .. } => {
            if device.caps.null_descriptor {
                return Ok((None, vk::DescriptorType::SAMPLED_IMAGE));
            }

            let view_type = match desc.dimension {
                SrvDimension::Texture2D { .. } => vk::ImageViewType::TYPE_2D,
                _ => vk::ImageViewType::TYPE_2D_ARRAY,
            };
            let zero = ComponentSwizzle::Zero;
            let view_desc = TextureViewDesc {
                format: Format::R8G8B8A8Unorm,
                info: Format::R8G8B8A8Unorm.info(),
                view_type,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                miplevel_idx: 0,
                miplevel_count: 1,
                layer_idx: 0,
                layer_count: 1,
                components: ComponentMapping {
                    r: zero,
                    g: zero,
                    b: zero,
                    a: zero,
                },
                allowed_swizzle: true,
            };
            let view = create_texture_view(device, device.null_resources.vk_2d_image, &view_desc)?;
            Ok((Some(Arc::new(view)), vk::DescriptorType::SAMPLED_IMAGE))
        }
        _ => Err(Error::NotImplemented("null view dimension")),
    }
}

fn create_buffer_srv(
    device: &Device,
    resource: &Resource,
    desc: Option<&SrvDesc>,
) -> Result<(Option<Arc<View>>, vk::DescriptorType)> {
    let desc = desc.ok_or(Error::NotImplemented(
        "default shader resource views of buffers",
    ))?;

    let range = match &desc.dimension {
        SrvDimension::Buffer(range) => range,
        _ => {
            return Err(Error::InvalidArgument(
                "buffer resources require a buffer view dimension",
            ));
        }
    };

    let view = create_buffer_view_for_resource(device, resource, desc.format, range)?;
    Ok((Some(Arc::new(view)), vk::DescriptorType::UNIFORM_TEXEL_BUFFER))
}

fn texture_srv_view_desc(resource: &Resource, desc: Option<&SrvDesc>) -> Result<TextureViewDesc> {
    let mut view_desc =
        default_texture_view_desc(resource, desc.map_or(Format::Unknown, |desc| desc.format))?;

    view_desc.miplevel_count = vk::REMAINING_MIP_LEVELS;
    view_desc.allowed_swizzle = true;

    let desc = match desc {
        Some(desc) => desc,
        None => return Ok(view_desc),
    };
    view_desc.components = desc.component_mapping;

    match desc.dimension {
        SrvDimension::Buffer(_) => {
            return Err(Error::InvalidArgument(
                "texture resources cannot use a buffer view dimension",
            ));
        }
        SrvDimension::Texture1D {
            most_detailed_mip,
            mip_levels,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_1D;
            view_desc.miplevel_idx = most_detailed_mip;
            view_desc.miplevel_count = mip_levels;
            view_desc.layer_count = 1;
        }
        SrvDimension::Texture1DArray {
            most_detailed_mip,
            mip_levels,
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_1D_ARRAY;
            view_desc.miplevel_idx = most_detailed_mip;
            view_desc.miplevel_count = mip_levels;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        SrvDimension::Texture2D {
            most_detailed_mip,
            mip_levels,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D;
            view_desc.miplevel_idx = most_detailed_mip;
            view_desc.miplevel_count = mip_levels;
            view_desc.layer_count = 1;
        }
        SrvDimension::Texture2DArray {
            most_detailed_mip,
            mip_levels,
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
            view_desc.miplevel_idx = most_detailed_mip;
            view_desc.miplevel_count = mip_levels;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        SrvDimension::Texture2DMs => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D;
            view_desc.layer_count = 1;
        }
        SrvDimension::Texture2DMsArray {
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        SrvDimension::Texture3D {
            most_detailed_mip,
            mip_levels,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_3D;
            view_desc.miplevel_idx = most_detailed_mip;
            view_desc.miplevel_count = mip_levels;
        }
        SrvDimension::TextureCube {
            most_detailed_mip,
            mip_levels,
        } => {
            view_desc.view_type = vk::ImageViewType::CUBE;
            view_desc.miplevel_idx = most_detailed_mip;
            view_desc.miplevel_count = mip_levels;
            view_desc.layer_count = 6;
        }
        SrvDimension::TextureCubeArray {
            most_detailed_mip,
            mip_levels,
            first_2d_array_face,
            num_cubes,
        } => {
            view_desc.view_type = vk::ImageViewType::CUBE_ARRAY;
            view_desc.miplevel_idx = most_detailed_mip;
            view_desc.miplevel_count = mip_levels;
            view_desc.layer_idx = first_2d_array_face;
            view_desc.layer_count = num_cubes;
            if view_desc.layer_count != vk::REMAINING_ARRAY_LAYERS {
                view_desc.layer_count *= 6;
            }
        }
    }

    Ok(view_desc)
}

fn create_texture_srv(
    device: &Device,
    resource: &Resource,
    desc: Option<&SrvDesc>,
) -> Result<(Option<Arc<View>>, vk::DescriptorType)> {
    let view_desc = texture_srv_view_desc(resource, desc)?;
    let vk_image = resource
        .vk_image()
        .ok_or(Error::InvalidArgument("texture views require a texture resource"))?;

    let view = create_texture_view(device, vk_image, &view_desc)?;
    Ok((Some(Arc::new(view)), vk::DescriptorType::SAMPLED_IMAGE))
}

/// Builds the descriptor payload for an unordered access view, wiring up the
/// structured counter when a counter resource is given.
pub(crate) fn create_uav(
    device: &Device,
    resource: Option<&Resource>,
    counter_resource: Option<&Resource>,
    desc: Option<&UavDesc>,
) -> Result<(Option<Arc<View>>, vk::DescriptorType)> {
    let resource = match resource {
        Some(resource) => resource,
        None => {
            if counter_resource.is_some() {
                warn!("ignoring counter resource for a null view");
            }
            return create_null_uav(device, desc);
        }
    };

    if resource.is_buffer() {
        create_buffer_uav(device, resource, counter_resource, desc)
    } else {
        if counter_resource.is_some() {
            return Err(Error::InvalidArgument(
                "counter resources require a buffer view",
            ));
        }
        create_texture_uav(device, resource, desc)
    }
}

fn create_null_uav(
    device: &Device,
    desc: Option<&UavDesc>,
) -> Result<(Option<Arc<View>>, vk::DescriptorType)> {
    let desc = desc.ok_or(Error::InvalidArgument(
        "null unordered access views require a view description",
    ))?;

    match desc.dimension {
        UavDimension::Buffer { .. } => {
            if device.caps.null_descriptor {
                return Ok((None, vk::DescriptorType::STORAGE_TEXEL_BUFFER));
            }

            let vk_view = create_vk_buffer_view(
                device,
                device.null_resources.vk_buffer,
                Format::R32Uint,
                0,
                NULL_BUFFER_SIZE,
            )?;
            let view = View::buffer(device, vk_view, Format::R32Uint, 0, NULL_BUFFER_SIZE);
            Ok((Some(Arc::new(view)), vk::DescriptorType::STORAGE_TEXEL_BUFFER))
        }
        UavDimension::Texture2D { .. } | UavDimension::Texture2DArray { .. } => {
            if device.caps.null_descriptor {
                return Ok((None, vk::DescriptorType::STORAGE_IMAGE));
            }

            let view_type = match desc.dimension {
                UavDimension::Texture2D { .. } => vk::ImageViewType::TYPE_2D,
                _ => vk::ImageViewType::TYPE_2D_ARRAY,
            };
            let view_desc = TextureViewDesc {
                format: Format::R32Uint,
                info: Format::R32Uint.info(),
                view_type,
                layout: vk::ImageLayout::GENERAL,
                miplevel_idx: 0,
                miplevel_count: 1,
                layer_idx: 0,
                layer_count: 1,
                components: ComponentMapping::IDENTITY,
                allowed_swizzle: false,
            };
            let view =
                create_texture_view(device, device.null_resources.vk_2d_storage_image, &view_desc)?;
            Ok((Some(Arc::new(view)), vk::DescriptorType::STORAGE_IMAGE))
        }
        _ => Err(Error::NotImplemented("null view dimension")),
    }
}

fn create_buffer_uav(
    device: &Device,
    resource: &Resource,
    counter_resource: Option<&Resource>,
    desc: Option<&UavDesc>,
) -> Result<(Option<Arc<View>>, vk::DescriptorType)> {
    let desc = desc.ok_or(Error::NotImplemented(
        "default unordered access views of buffers",
    ))?;

    let (range, counter_offset) = match &desc.dimension {
        UavDimension::Buffer {
            range,
            counter_offset_in_bytes,
        } => (range, *counter_offset_in_bytes),
        _ => {
            return Err(Error::InvalidArgument(
                "buffer resources require a buffer view dimension",
            ));
        }
    };

    let mut view = create_buffer_view_for_resource(device, resource, desc.format, range)?;

    if let Some(counter_resource) = counter_resource {
        if !counter_resource.is_buffer() {
            return Err(Error::InvalidArgument("counter resources must be buffers"));
        }
        if range.structure_byte_stride == 0 {
            return Err(Error::InvalidArgument(
                "counter resources require a structured view",
            ));
        }
        let vk_counter_buffer = counter_resource
            .vk_buffer()
            .ok_or(Error::InvalidArgument("counter resources must be buffers"))?;

        view.counter = if device.bindless.flags.contains(BindlessFlags::UAV_COUNTER) {
            let address_info = vk::BufferDeviceAddressInfo::builder().buffer(vk_counter_buffer);
            let address = unsafe { device.raw.get_buffer_device_address(&address_info) };
            UavCounter::Address(address + counter_resource.heap_offset() + counter_offset)
        } else {
            let vk_counter_view = create_vk_buffer_view(
                device,
                vk_counter_buffer,
                Format::R32Uint,
                counter_resource.heap_offset() + counter_offset,
                mem::size_of::<u32>() as vk::DeviceSize,
            )?;
            UavCounter::BufferView(vk_counter_view)
        };
    }

    Ok((Some(Arc::new(view)), vk::DescriptorType::STORAGE_TEXEL_BUFFER))
}

fn texture_uav_view_desc(resource: &Resource, desc: Option<&UavDesc>) -> Result<TextureViewDesc> {
    let mut view_desc =
        default_texture_view_desc(resource, desc.map_or(Format::Unknown, |desc| desc.format))?;

    if view_desc.format.is_block_compressed() {
        warn!(
            "unordered access views cannot be created for {:?}",
            view_desc.format
        );
        return Err(Error::InvalidArgument(
            "unordered access views require an uncompressed format",
        ));
    }

    let desc = match desc {
        Some(desc) => desc,
        None => return Ok(view_desc),
    };

    match desc.dimension {
        UavDimension::Buffer { .. } => {
            return Err(Error::InvalidArgument(
                "texture resources cannot use a buffer view dimension",
            ));
        }
        UavDimension::Texture1D { mip_slice } => {
            view_desc.view_type = vk::ImageViewType::TYPE_1D;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_count = 1;
        }
        UavDimension::Texture1DArray {
            mip_slice,
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_1D_ARRAY;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        UavDimension::Texture2D { mip_slice } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_count = 1;
        }
        UavDimension::Texture2DArray {
            mip_slice,
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        UavDimension::Texture3D {
            mip_slice,
            first_w_slice,
            w_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_3D;
            view_desc.miplevel_idx = mip_slice;
            // Vulkan storage image views always cover the full depth.
            if first_w_slice != 0
                || (w_size != u32::from(resource.desc().depth_or_array_size) && w_size != u32::MAX)
            {
                warn!("unhandled depth slice window {}-{}", first_w_slice, w_size);
            }
        }
    }

    Ok(view_desc)
}

fn create_texture_uav(
    device: &Device,
    resource: &Resource,
    desc: Option<&UavDesc>,
) -> Result<(Option<Arc<View>>, vk::DescriptorType)> {
    let view_desc = texture_uav_view_desc(resource, desc)?;
    let vk_image = resource
        .vk_image()
        .ok_or(Error::InvalidArgument("texture views require a texture resource"))?;

    let view = create_texture_view(device, vk_image, &view_desc)?;
    Ok((Some(Arc::new(view)), vk::DescriptorType::STORAGE_IMAGE))
}

fn needs_border_color(u: AddressMode, v: AddressMode, w: AddressMode) -> bool {
    u == AddressMode::Border || v == AddressMode::Border || w == AddressMode::Border
}

fn standard_border_color(color: &[f32; 4]) -> Option<vk::BorderColor> {
    let standard = [
        ([0.0, 0.0, 0.0, 0.0], vk::BorderColor::FLOAT_TRANSPARENT_BLACK),
        ([0.0, 0.0, 0.0, 1.0], vk::BorderColor::FLOAT_OPAQUE_BLACK),
        ([1.0, 1.0, 1.0, 1.0], vk::BorderColor::FLOAT_OPAQUE_WHITE),
    ];

    standard
        .iter()
        .find(|(values, _)| values == color)
        .map(|(_, border_color)| *border_color)
}

fn map_border_color(device: &Device, color: &[f32; 4]) -> vk::BorderColor {
    if let Some(border_color) = standard_border_color(color) {
        return border_color;
    }

    if !device.caps.custom_border_color {
        warn!("unsupported border color {:?}", color);
        return vk::BorderColor::FLOAT_TRANSPARENT_BLACK;
    }

    vk::BorderColor::FLOAT_CUSTOM_EXT
}

fn map_address_mode(device: &Device, mode: AddressMode) -> vk::SamplerAddressMode {
    if mode == AddressMode::MirrorOnce && !device.caps.mirror_clamp_to_edge {
        warn!("mirror-once addressing is not supported by this device");
        return vk::SamplerAddressMode::REPEAT;
    }

    conv::map_address_mode(mode)
}

fn make_vk_sampler(
    device: &Device,
    desc: &SamplerDesc,
    border_color: vk::BorderColor,
) -> Result<vk::Sampler> {
    let mut custom_border_info = vk::SamplerCustomBorderColorCreateInfoEXT::builder()
        .custom_border_color(vk::ClearColorValue {
            float32: desc.border_color,
        })
        .format(vk::Format::UNDEFINED);

    let reduction = conv::map_reduction_mode(desc.filter.reduction);
    let mut reduction_info =
        vk::SamplerReductionModeCreateInfo::builder().reduction_mode(reduction);

    let compare_enable = desc.filter.reduction == FilterReduction::Comparison;
    let compare_op = if compare_enable {
        conv::map_comparison(desc.comparison_func)
    } else {
        vk::CompareOp::NEVER
    };

    let mut sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(conv::map_filter_type(desc.filter.mag))
        .min_filter(conv::map_filter_type(desc.filter.min))
        .mipmap_mode(conv::map_mipmap_mode(desc.filter.mip))
        .address_mode_u(map_address_mode(device, desc.address_u))
        .address_mode_v(map_address_mode(device, desc.address_v))
        .address_mode_w(map_address_mode(device, desc.address_w))
        .mip_lod_bias(desc.mip_lod_bias)
        .anisotropy_enable(desc.filter.anisotropic)
        .max_anisotropy(desc.max_anisotropy as f32)
        .compare_enable(compare_enable)
        .compare_op(compare_op)
        .min_lod(desc.min_lod)
        .max_lod(desc.max_lod)
        .border_color(border_color)
        .unnormalized_coordinates(false);

    if border_color == vk::BorderColor::FLOAT_CUSTOM_EXT {
        sampler_info = sampler_info.push_next(&mut custom_border_info);
    }
    if reduction != vk::SamplerReductionMode::WEIGHTED_AVERAGE && device.caps.sampler_filter_minmax
    {
        sampler_info = sampler_info.push_next(&mut reduction_info);
    }

    let vk_sampler = unsafe { device.raw.create_sampler(&sampler_info, None) }?;
    Ok(vk_sampler)
}

/// Creates a sampler wrapped as a view for descriptor slots.
pub(crate) fn create_sampler(device: &Device, desc: &SamplerDesc) -> Result<Arc<View>> {
    let border_color = if needs_border_color(desc.address_u, desc.address_v, desc.address_w) {
        map_border_color(device, &desc.border_color)
    } else {
        vk::BorderColor::FLOAT_TRANSPARENT_BLACK
    };

    let vk_sampler = make_vk_sampler(device, desc, border_color)?;
    Ok(Arc::new(View {
        device: device.raw.clone(),
        handle: ViewHandle::Sampler(vk_sampler),
        format: Format::Unknown,
        info: ViewInfo::Sampler,
        counter: UavCounter::None,
    }))
}

/// Creates the immutable sampler for one static sampler entry of a root
/// signature. The caller owns the returned handle; static samplers are
/// destroyed with their root signature, not through a [`View`].
pub(crate) fn create_static_sampler(
    device: &Device,
    desc: &StaticSamplerDesc,
) -> Result<vk::Sampler> {
    let sampler_desc = SamplerDesc {
        filter: desc.filter,
        address_u: desc.address_u,
        address_v: desc.address_v,
        address_w: desc.address_w,
        mip_lod_bias: desc.mip_lod_bias,
        max_anisotropy: desc.max_anisotropy,
        comparison_func: desc.comparison_func,
        border_color: desc.border_color.color(),
        min_lod: desc.min_lod,
        max_lod: desc.max_lod,
    };

    let border_color = if needs_border_color(desc.address_u, desc.address_v, desc.address_w) {
        conv::map_static_border_color(desc.border_color)
    } else {
        vk::BorderColor::FLOAT_TRANSPARENT_BLACK
    };

    make_vk_sampler(device, &sampler_desc, border_color)
}

/// A render target view plus the framebuffer metadata recorded alongside it
/// in an RTV heap slot.
#[derive(Clone)]
pub struct RenderTargetView {
    pub resource: Arc<Resource>,
    pub view: Arc<View>,
    pub format: Format,
    pub sample_count: vk::SampleCountFlags,
    pub width: u64,
    pub height: u32,
    pub layer_count: u32,
}

/// A depth/stencil view plus its framebuffer metadata.
#[derive(Clone)]
pub struct DepthStencilView {
    pub resource: Arc<Resource>,
    pub view: Arc<View>,
    pub format: Format,
    pub sample_count: vk::SampleCountFlags,
    pub width: u64,
    pub height: u32,
    pub layer_count: u32,
}

fn rtv_view_desc(resource: &Resource, desc: Option<&RtvDesc>) -> Result<TextureViewDesc> {
    let mut view_desc =
        default_texture_view_desc(resource, desc.map_or(Format::Unknown, |desc| desc.format))?;

    if view_desc.info.aspect_mask != vk::ImageAspectFlags::COLOR {
        warn!(
            "cannot create a render target view for {:?}",
            view_desc.format
        );
        return Err(Error::InvalidArgument(
            "render target views require a color format",
        ));
    }

    view_desc.layout = resource.pick_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let desc = match desc {
        Some(desc) => desc,
        None => {
            if resource.desc().dimension == ResourceDimension::Texture3D {
                view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
                view_desc.layer_idx = 0;
                view_desc.layer_count = u32::from(resource.desc().depth_or_array_size);
            }
            return Ok(view_desc);
        }
    };

    match desc.dimension {
        RtvDimension::Texture1D { mip_slice } => {
            view_desc.view_type = vk::ImageViewType::TYPE_1D;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_count = 1;
        }
        RtvDimension::Texture1DArray {
            mip_slice,
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_1D_ARRAY;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        RtvDimension::Texture2D { mip_slice } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_count = 1;
        }
        RtvDimension::Texture2DArray {
            mip_slice,
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        RtvDimension::Texture2DMs => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D;
            view_desc.layer_count = 1;
        }
        RtvDimension::Texture2DMsArray {
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        RtvDimension::Texture3D {
            mip_slice,
            first_w_slice,
            w_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_idx = first_w_slice;
            view_desc.layer_count = w_size;
        }
    }

    // An unbounded layer count makes the framebuffer dimension logic awkward,
    // so resolve it against the resource here.
    view_desc.layer_count = view_desc.layer_count.min(
        u32::from(resource.desc().depth_or_array_size).saturating_sub(view_desc.layer_idx),
    );

    Ok(view_desc)
}

pub(crate) fn create_rtv(
    device: &Device,
    resource: &Arc<Resource>,
    desc: Option<&RtvDesc>,
) -> Result<RenderTargetView> {
    let view_desc = rtv_view_desc(resource, desc)?;
    let vk_image = resource
        .vk_image()
        .ok_or(Error::InvalidArgument("render target views require a texture resource"))?;

    let view = create_texture_view(device, vk_image, &view_desc)?;
    Ok(RenderTargetView {
        resource: Arc::clone(resource),
        format: view_desc.format,
        sample_count: conv::map_sample_count(resource.desc().sample_desc.count)?,
        width: resource.desc().width(view_desc.miplevel_idx),
        height: resource.desc().height(view_desc.miplevel_idx),
        layer_count: view_desc.layer_count,
        view: Arc::new(view),
    })
}

fn dsv_layout_from_flags(flags: DsvFlags) -> vk::ImageLayout {
    let read_only_depth = flags.contains(DsvFlags::READ_ONLY_DEPTH);
    let read_only_stencil = flags.contains(DsvFlags::READ_ONLY_STENCIL);

    match (read_only_depth, read_only_stencil) {
        (false, false) => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        (true, false) => vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL,
        (false, true) => vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL,
        (true, true) => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    }
}

fn dsv_view_desc(resource: &Resource, desc: Option<&DsvDesc>) -> Result<TextureViewDesc> {
    if resource.desc().dimension == ResourceDimension::Texture3D {
        warn!("cannot create a depth/stencil view for a 3D texture");
        return Err(Error::InvalidArgument(
            "depth/stencil views cannot target 3D textures",
        ));
    }

    let mut view_desc =
        default_texture_view_desc(resource, desc.map_or(Format::Unknown, |desc| desc.format))?;

    if !view_desc
        .info
        .aspect_mask
        .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
    {
        warn!(
            "cannot create a depth/stencil view for {:?}",
            view_desc.format
        );
        return Err(Error::InvalidArgument(
            "depth/stencil views require a depth/stencil format",
        ));
    }

    let desc = match desc {
        Some(desc) => desc,
        None => {
            view_desc.layout =
                resource.pick_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
            return Ok(view_desc);
        }
    };

    view_desc.layout = resource.pick_layout(dsv_layout_from_flags(desc.flags));

    match desc.dimension {
        DsvDimension::Texture1D { mip_slice } => {
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_count = 1;
        }
        DsvDimension::Texture1DArray {
            mip_slice,
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_1D_ARRAY;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        DsvDimension::Texture2D { mip_slice } => {
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_count = 1;
        }
        DsvDimension::Texture2DArray {
            mip_slice,
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
            view_desc.miplevel_idx = mip_slice;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
        DsvDimension::Texture2DMs => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D;
            view_desc.layer_count = 1;
        }
        DsvDimension::Texture2DMsArray {
            first_array_slice,
            array_size,
        } => {
            view_desc.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
            view_desc.layer_idx = first_array_slice;
            view_desc.layer_count = array_size;
        }
    }

    view_desc.layer_count = view_desc.layer_count.min(
        u32::from(resource.desc().depth_or_array_size).saturating_sub(view_desc.layer_idx),
    );

    Ok(view_desc)
}

pub(crate) fn create_dsv(
    device: &Device,
    resource: &Arc<Resource>,
    desc: Option<&DsvDesc>,
) -> Result<DepthStencilView> {
    let view_desc = dsv_view_desc(resource, desc)?;
    let vk_image = resource
        .vk_image()
        .ok_or(Error::InvalidArgument("depth/stencil views require a texture resource"))?;

    let view = create_texture_view(device, vk_image, &view_desc)?;
    Ok(DepthStencilView {
        resource: Arc::clone(resource),
        format: view_desc.format,
        sample_count: conv::map_sample_count(resource.desc().sample_desc.count)?,
        width: resource.desc().width(view_desc.miplevel_idx),
        height: resource.desc().height(view_desc.miplevel_idx),
        layer_count: view_desc.layer_count,
        view: Arc::new(view),
    })
}

#[cfg(test)]
mod swizzle_tests {
    use super::*;

    type Parts = (
        vk::ComponentSwizzle,
        vk::ComponentSwizzle,
        vk::ComponentSwizzle,
        vk::ComponentSwizzle,
    );

    fn parts(mapping: vk::ComponentMapping) -> Parts {
        (mapping.r, mapping.g, mapping.b, mapping.a)
    }

    #[test]
    fn stencil_reads_into_green() {
        let format = Format::X24TypelessG8Uint;
        let info = format.info();
        assert_eq!(info.aspect_mask, vk::ImageAspectFlags::STENCIL);

        let base = view_swizzle_for_format(format, &info, true);
        assert_eq!(
            parts(base),
            (
                vk::ComponentSwizzle::ZERO,
                vk::ComponentSwizzle::R,
                vk::ComponentSwizzle::ZERO,
                vk::ComponentSwizzle::ZERO,
            )
        );

        // Without swizzle support the base mapping stays identity.
        let base = view_swizzle_for_format(format, &info, false);
        assert_eq!(
            parts(base),
            (
                vk::ComponentSwizzle::R,
                vk::ComponentSwizzle::G,
                vk::ComponentSwizzle::B,
                vk::ComponentSwizzle::A,
            )
        );
    }

    #[test]
    fn alpha_only_format_reads_red_into_alpha() {
        let info = Format::A8Unorm.info();
        let base = view_swizzle_for_format(Format::A8Unorm, &info, true);
        assert_eq!(
            parts(base),
            (
                vk::ComponentSwizzle::ZERO,
                vk::ComponentSwizzle::ZERO,
                vk::ComponentSwizzle::ZERO,
                vk::ComponentSwizzle::R,
            )
        );
    }

    #[test]
    fn caller_mapping_composes_over_forced_swizzle() {
        let base = vk::ComponentMapping {
            r: vk::ComponentSwizzle::ZERO,
            g: vk::ComponentSwizzle::R,
            b: vk::ComponentSwizzle::ZERO,
            a: vk::ComponentSwizzle::ZERO,
        };

        // Broadcasting the stencil channel: the caller selects "green" for
        // every output and gets the value the format routed into green.
        let over = ComponentMapping {
            r: ComponentSwizzle::G,
            g: ComponentSwizzle::G,
            b: ComponentSwizzle::G,
            a: ComponentSwizzle::One,
        };
        let composed = compose_component_mappings(base, over);
        assert_eq!(
            parts(composed),
            (
                vk::ComponentSwizzle::R,
                vk::ComponentSwizzle::R,
                vk::ComponentSwizzle::R,
                vk::ComponentSwizzle::ONE,
            )
        );
    }

    #[test]
    fn identity_mapping_composes_to_base() {
        let base = vk::ComponentMapping {
            r: vk::ComponentSwizzle::R,
            g: vk::ComponentSwizzle::G,
            b: vk::ComponentSwizzle::B,
            a: vk::ComponentSwizzle::ONE,
        };
        let composed = compose_component_mappings(base, ComponentMapping::IDENTITY);
        assert_eq!(parts(composed), parts(base));
    }
}

#[cfg(test)]
mod view_desc_tests {
    use super::*;
    use crate::resource::{ResourceDesc, SampleDesc};

    fn texture_2d(width: u64, height: u32, layers: u16, mips: u16, format: Format) -> Arc<Resource> {
        let desc = ResourceDesc {
            depth_or_array_size: layers,
            mip_levels: mips,
            ..ResourceDesc::texture_2d(format, width, height)
        };
        Resource::from_external(&desc, vk::Image::null())
    }

    #[test]
    fn default_srv_covers_every_mip_and_layer() {
        let resource = texture_2d(256, 256, 6, 9, Format::R8G8B8A8Unorm);
        let view_desc = texture_srv_view_desc(&resource, None).unwrap();

        assert_eq!(view_desc.view_type, vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(view_desc.miplevel_idx, 0);
        assert_eq!(view_desc.miplevel_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(view_desc.layer_idx, 0);
        assert_eq!(view_desc.layer_count, 6);
        assert!(view_desc.allowed_swizzle);
    }

    #[test]
    fn cube_array_multiplies_cube_count() {
        let resource = texture_2d(64, 64, 24, 1, Format::R8G8B8A8Unorm);
        let desc = SrvDesc {
            format: Format::Unknown,
            component_mapping: ComponentMapping::IDENTITY,
            dimension: SrvDimension::TextureCubeArray {
                most_detailed_mip: 0,
                mip_levels: vk::REMAINING_MIP_LEVELS,
                first_2d_array_face: 6,
                num_cubes: 3,
            },
        };
        let view_desc = texture_srv_view_desc(&resource, Some(&desc)).unwrap();

        assert_eq!(view_desc.view_type, vk::ImageViewType::CUBE_ARRAY);
        assert_eq!(view_desc.layer_idx, 6);
        assert_eq!(view_desc.layer_count, 18);
    }

    #[test]
    fn srv_of_buffer_dimension_on_texture_is_rejected() {
        let resource = texture_2d(64, 64, 1, 1, Format::R8G8B8A8Unorm);
        let desc = SrvDesc {
            format: Format::Unknown,
            component_mapping: ComponentMapping::IDENTITY,
            dimension: SrvDimension::Buffer(BufferRange {
                first_element: 0,
                num_elements: 16,
                structure_byte_stride: 0,
                flags: BufferViewFlags::RAW,
            }),
        };
        assert!(texture_srv_view_desc(&resource, Some(&desc)).is_err());
    }

    #[test]
    fn compressed_uav_is_rejected() {
        let resource = texture_2d(64, 64, 1, 1, Format::Bc1Unorm);
        assert!(texture_uav_view_desc(&resource, None).is_err());
    }

    #[test]
    fn rtv_of_3d_texture_renders_a_slice_window() {
        let desc = ResourceDesc {
            dimension: ResourceDimension::Texture3D,
            depth_or_array_size: 32,
            ..ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 128, 128)
        };
        let resource = Resource::from_external(&desc, vk::Image::null());

        let rtv = RtvDesc {
            format: Format::Unknown,
            dimension: RtvDimension::Texture3D {
                mip_slice: 0,
                first_w_slice: 8,
                w_size: u32::MAX,
            },
        };
        let view_desc = rtv_view_desc(&resource, Some(&rtv)).unwrap();

        assert_eq!(view_desc.view_type, vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(view_desc.layer_idx, 8);
        // The unbounded window is clamped to the remaining depth.
        assert_eq!(view_desc.layer_count, 24);
    }

    #[test]
    fn rtv_rejects_depth_formats() {
        let resource = texture_2d(64, 64, 1, 1, Format::D32Float);
        assert!(rtv_view_desc(&resource, None).is_err());
    }

    #[test]
    fn dsv_layout_tracks_read_only_flags() {
        assert_eq!(
            dsv_layout_from_flags(DsvFlags::empty()),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            dsv_layout_from_flags(DsvFlags::READ_ONLY_DEPTH),
            vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            dsv_layout_from_flags(DsvFlags::READ_ONLY_STENCIL),
            vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            dsv_layout_from_flags(DsvFlags::READ_ONLY_DEPTH | DsvFlags::READ_ONLY_STENCIL),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn dsv_rejects_3d_and_color_resources() {
        let desc = ResourceDesc {
            dimension: ResourceDimension::Texture3D,
            depth_or_array_size: 4,
            ..ResourceDesc::texture_2d(Format::D32Float, 64, 64)
        };
        let volume = Resource::from_external(&desc, vk::Image::null());
        assert!(dsv_view_desc(&volume, None).is_err());

        let color = texture_2d(64, 64, 1, 1, Format::R8G8B8A8Unorm);
        assert!(dsv_view_desc(&color, None).is_err());
    }

    #[test]
    fn multisampled_dsv_uses_single_sample_dimension_rules() {
        let desc = ResourceDesc {
            sample_desc: SampleDesc {
                count: 4,
                quality: 0,
            },
            ..ResourceDesc::texture_2d(Format::D32Float, 64, 64)
        };
        let resource = Resource::from_external(&desc, vk::Image::null());

        let dsv = DsvDesc {
            format: Format::Unknown,
            flags: DsvFlags::empty(),
            dimension: DsvDimension::Texture2DMs,
        };
        let view_desc = dsv_view_desc(&resource, Some(&dsv)).unwrap();
        assert_eq!(view_desc.view_type, vk::ImageViewType::TYPE_2D);
        assert_eq!(view_desc.layer_count, 1);
        assert_eq!(
            view_desc.layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }
}

#[cfg(test)]
mod buffer_view_tests {
    use super::*;

    #[test]
    fn raw_views_use_r32_words() {
        let (format, element_size) = buffer_view_format(
            Format::Unknown,
            Format::R32Typeless,
            0,
            BufferViewFlags::RAW,
        )
        .unwrap();
        assert_eq!(format, Format::R32Uint);
        assert_eq!(element_size, 4);
    }

    #[test]
    fn structured_views_use_the_stride() {
        let (format, element_size) =
            buffer_view_format(Format::Unknown, Format::Unknown, 24, BufferViewFlags::empty())
                .unwrap();
        assert_eq!(format, Format::R32Uint);
        assert_eq!(element_size, 24);
    }

    #[test]
    fn typed_views_use_the_format_size() {
        let (format, element_size) = buffer_view_format(
            Format::Unknown,
            Format::R16G16B16A16Float,
            0,
            BufferViewFlags::empty(),
        )
        .unwrap();
        assert_eq!(format, Format::R16G16B16A16Float);
        assert_eq!(element_size, 8);
    }

    #[test]
    fn formatless_unstructured_views_are_rejected() {
        assert!(
            buffer_view_format(Format::Unknown, Format::Unknown, 0, BufferViewFlags::empty())
                .is_err()
        );
    }
}

#[cfg(test)]
mod sampler_tests {
    use super::*;

    #[test]
    fn standard_border_colors_resolve_to_vulkan_constants() {
        assert_eq!(
            standard_border_color(&[0.0, 0.0, 0.0, 0.0]),
            Some(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
        );
        assert_eq!(
            standard_border_color(&[0.0, 0.0, 0.0, 1.0]),
            Some(vk::BorderColor::FLOAT_OPAQUE_BLACK)
        );
        assert_eq!(
            standard_border_color(&[1.0, 1.0, 1.0, 1.0]),
            Some(vk::BorderColor::FLOAT_OPAQUE_WHITE)
        );
        assert_eq!(standard_border_color(&[0.5, 0.0, 0.5, 1.0]), None);
    }

    #[test]
    fn border_color_only_matters_for_border_addressing() {
        assert!(!needs_border_color(
            AddressMode::Wrap,
            AddressMode::Clamp,
            AddressMode::MirrorOnce
        ));
        assert!(needs_border_color(
            AddressMode::Wrap,
            AddressMode::Border,
            AddressMode::Wrap
        ));
    }

    #[test]
    fn comparison_filters_enable_depth_compare() {
        let filter = Filter::MIN_MAG_MIP_LINEAR.comparison();
        assert_eq!(filter.reduction, FilterReduction::Comparison);
        assert_eq!(filter.min, FilterType::Linear);
    }
}
