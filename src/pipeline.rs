//! Graphics and compute pipeline state.
//!
//! A compute state compiles to exactly one `vk::Pipeline`. A graphics state
//! walks one of two tracks decided at creation time: with extended dynamic
//! state (and a topology class known up front) viewport, scissor, topology
//! and vertex strides become true dynamic state and a single pipeline is
//! compiled immediately; without it the state precreates only its render
//! pass and lazily compiles one variant per [`PipelineKey`] observed at draw
//! time. Render passes are shared through the device-wide
//! [`RenderPassCache`], keyed by attachment formats, depth/stencil usage and
//! sample count.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;

use arrayvec::ArrayVec;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::conv;
use crate::device::Device;
use crate::format::Format;
use crate::root_signature::{RootSignature, RootSignatureFlags};
use crate::shader::{
    find_signature_element, CompileArguments, SignatureElement, TransformFeedbackInfo,
};
use crate::view::{ComponentMapping, ComponentSwizzle};
use crate::{ComparisonFunc, Error, Result, MAX_RENDER_TARGETS, MAX_VERTEX_BUFFERS};

/// Sentinel aligned byte offset packing an input element directly after the
/// previous element of its slot.
pub const APPEND_ALIGNED_ELEMENT: u32 = u32::MAX;
/// Sentinel rasterized stream index disabling rasterization entirely.
pub const NO_RASTERIZED_STREAM: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveTopologyType {
    Undefined,
    Point,
    Line,
    Triangle,
    Patch,
}

/// Concrete draw-time topology. Patch lists carry their control point count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    PatchList { control_points: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Blend {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    DstColor,
    InvDstColor,
    SrcAlphaSat,
    BlendFactor,
    InvBlendFactor,
    Src1Color,
    InvSrc1Color,
    Src1Alpha,
    InvSrc1Alpha,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicOp {
    Clear,
    Set,
    Copy,
    CopyInverted,
    NoOp,
    Invert,
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Equiv,
    AndReverse,
    AndInverted,
    OrReverse,
    OrInverted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
    Incr,
    Decr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillMode {
    Wireframe,
    Solid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputClassification {
    PerVertex,
    PerInstance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StripCutValue {
    Disabled,
    U16Max,
    U32Max,
}

/// Blend state of one render target.
#[derive(Clone, Copy, Debug)]
pub struct RenderTargetBlendDesc {
    pub blend_enable: bool,
    pub logic_op_enable: bool,
    pub src_blend: Blend,
    pub dst_blend: Blend,
    pub blend_op: BlendOp,
    pub src_blend_alpha: Blend,
    pub dst_blend_alpha: Blend,
    pub blend_op_alpha: BlendOp,
    pub logic_op: LogicOp,
    pub render_target_write_mask: u8,
}

impl Default for RenderTargetBlendDesc {
    fn default() -> Self {
        RenderTargetBlendDesc {
            blend_enable: false,
            logic_op_enable: false,
            src_blend: Blend::One,
            dst_blend: Blend::Zero,
            blend_op: BlendOp::Add,
            src_blend_alpha: Blend::One,
            dst_blend_alpha: Blend::Zero,
            blend_op_alpha: BlendOp::Add,
            logic_op: LogicOp::NoOp,
            render_target_write_mask: 0xf,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BlendDesc {
    pub alpha_to_coverage_enable: bool,
    /// When clear, render target 0's blend state applies to every target.
    pub independent_blend_enable: bool,
    pub render_targets: [RenderTargetBlendDesc; MAX_RENDER_TARGETS],
}

#[derive(Clone, Copy, Debug)]
pub struct RasterizerDesc {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_bias: i32,
    pub depth_bias_clamp: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clip_enable: bool,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        RasterizerDesc {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_counter_clockwise: false,
            depth_bias: 0,
            depth_bias_clamp: 0.0,
            slope_scaled_depth_bias: 0.0,
            depth_clip_enable: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StencilOpDesc {
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub func: ComparisonFunc,
}

impl Default for StencilOpDesc {
    fn default() -> Self {
        StencilOpDesc {
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            func: ComparisonFunc::Always,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DepthStencilDesc {
    pub depth_enable: bool,
    pub depth_write_enable: bool,
    pub depth_func: ComparisonFunc,
    pub depth_bounds_test_enable: bool,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilOpDesc,
    pub back: StencilOpDesc,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        DepthStencilDesc {
            depth_enable: false,
            depth_write_enable: false,
            depth_func: ComparisonFunc::Always,
            depth_bounds_test_enable: false,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            front: StencilOpDesc::default(),
            back: StencilOpDesc::default(),
        }
    }
}

/// One vertex input layout element. `aligned_byte_offset` of
/// [`APPEND_ALIGNED_ELEMENT`] packs the element after the previous one in
/// its slot.
#[derive(Clone, Debug)]
pub struct InputElement {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub format: Format,
    pub input_slot: u32,
    pub aligned_byte_offset: u32,
    pub input_slot_class: InputClassification,
    pub instance_data_step_rate: u32,
}

/// Stream output layout. `rasterized_stream` of [`NO_RASTERIZED_STREAM`]
/// disables rasterization.
#[derive(Clone, Debug, Default)]
pub struct StreamOutputDesc {
    pub elements: Vec<crate::shader::StreamOutputElement>,
    pub buffer_strides: Vec<u32>,
    pub rasterized_stream: u32,
}

pub struct GraphicsPipelineDesc {
    pub root_signature: Arc<RootSignature>,
    pub vs: Option<Vec<u8>>,
    pub hs: Option<Vec<u8>>,
    pub ds: Option<Vec<u8>>,
    pub gs: Option<Vec<u8>>,
    pub ps: Option<Vec<u8>>,
    pub stream_output: StreamOutputDesc,
    pub blend: BlendDesc,
    pub sample_mask: u32,
    pub rasterizer: RasterizerDesc,
    pub depth_stencil: DepthStencilDesc,
    pub input_layout: Vec<InputElement>,
    pub strip_cut_value: StripCutValue,
    pub primitive_topology_type: PrimitiveTopologyType,
    pub rtv_formats: ArrayVec<[Format; MAX_RENDER_TARGETS]>,
    pub dsv_format: Format,
    pub sample_count: u32,
}

pub struct ComputePipelineDesc {
    pub root_signature: Arc<RootSignature>,
    pub cs: Vec<u8>,
}

/// Draw-time state a fallback-track pipeline bakes into its variants.
#[derive(Clone, Copy, Debug)]
pub struct DynamicState {
    pub primitive_topology: PrimitiveTopology,
    pub vertex_strides: [u32; MAX_VERTEX_BUFFERS],
    pub viewport_count: u32,
}

impl Default for DynamicState {
    fn default() -> Self {
        DynamicState {
            primitive_topology: PrimitiveTopology::TriangleList,
            vertex_strides: [0; MAX_VERTEX_BUFFERS],
            viewport_count: 1,
        }
    }
}

/// Identity of one compiled fallback variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineKey {
    topology: PrimitiveTopology,
    /// Strides of the referenced vertex buffer slots, in first-seen binding
    /// order over the attribute list.
    strides: ArrayVec<[u32; MAX_VERTEX_BUFFERS]>,
    viewport_count: u32,
    dsv_format: vk::Format,
}

fn pipeline_key(
    attributes: &[vk::VertexInputAttributeDescription],
    dyn_state: &DynamicState,
    dsv_format: vk::Format,
) -> PipelineKey {
    let mut strides = ArrayVec::new();
    let mut mask = 0u32;
    for attribute in attributes {
        if mask & (1 << attribute.binding) != 0 {
            continue;
        }
        mask |= 1 << attribute.binding;
        strides.push(dyn_state.vertex_strides[attribute.binding as usize]);
    }

    PipelineKey {
        topology: dyn_state.primitive_topology,
        strides,
        viewport_count: dyn_state.viewport_count.max(1),
        dsv_format,
    }
}

/// Render pass identity: attachment formats (depth/stencil last), which
/// aspects are enabled and written, and the sample count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RenderPassKey {
    vk_formats: [vk::Format; MAX_RENDER_TARGETS + 1],
    attachment_count: usize,
    depth_enable: bool,
    stencil_enable: bool,
    depth_write: bool,
    stencil_write: bool,
    sample_count: vk::SampleCountFlags,
}

impl Default for RenderPassKey {
    fn default() -> Self {
        RenderPassKey {
            vk_formats: [vk::Format::UNDEFINED; MAX_RENDER_TARGETS + 1],
            attachment_count: 0,
            depth_enable: false,
            stencil_enable: false,
            depth_write: false,
            stencil_write: false,
            sample_count: vk::SampleCountFlags::TYPE_1,
        }
    }
}

fn depth_stencil_layout(key: &RenderPassKey) -> vk::ImageLayout {
    if !key.depth_enable && !key.stencil_enable {
        vk::ImageLayout::UNDEFINED
    } else if key.depth_write && key.stencil_write {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if key.depth_write {
        vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
    } else if key.stencil_write {
        vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    }
}

struct RenderPassEntry {
    key: RenderPassKey,
    vk_render_pass: vk::RenderPass,
}

/// Device-wide cache of render passes shared by compatible pipelines.
/// Lookup and miss-then-create run under a single lock acquisition.
pub(crate) struct RenderPassCache {
    render_passes: Mutex<Vec<RenderPassEntry>>,
}

impl RenderPassCache {
    pub(crate) fn new() -> Self {
        RenderPassCache {
            render_passes: Mutex::new(Vec::new()),
        }
    }

    fn get_or_create(&self, device: &Device, key: &RenderPassKey) -> Result<vk::RenderPass> {
        let mut render_passes = self.render_passes.lock();

        if let Some(entry) = render_passes.iter().find(|entry| entry.key == *key) {
            return Ok(entry.vk_render_pass);
        }

        let vk_render_pass = create_render_pass(device, key)?;
        render_passes.push(RenderPassEntry {
            key: *key,
            vk_render_pass,
        });
        Ok(vk_render_pass)
    }

    pub(crate) fn cleanup(&self, device: &ash::Device) {
        let mut render_passes = self.render_passes.lock();
        for entry in render_passes.drain(..) {
            unsafe { device.destroy_render_pass(entry.vk_render_pass, None) };
        }
    }
}

fn create_render_pass(device: &Device, key: &RenderPassKey) -> Result<vk::RenderPass> {
    let have_depth_stencil = key.depth_enable || key.stencil_enable;
    let rt_count = key.attachment_count - have_depth_stencil as usize;

    let mut attachments: ArrayVec<[vk::AttachmentDescription; MAX_RENDER_TARGETS + 1]> =
        ArrayVec::new();
    let mut references: ArrayVec<[vk::AttachmentReference; MAX_RENDER_TARGETS + 1]> =
        ArrayVec::new();

    for index in 0..rt_count {
        if key.vk_formats[index] == vk::Format::UNDEFINED {
            references.push(vk::AttachmentReference {
                attachment: vk::ATTACHMENT_UNUSED,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            continue;
        }

        references.push(vk::AttachmentReference {
            attachment: attachments.len() as u32,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });
        attachments.push(vk::AttachmentDescription {
            flags: vk::AttachmentDescriptionFlags::empty(),
            format: key.vk_formats[index],
            samples: key.sample_count,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });
    }

    let mut stages = vk::PipelineStageFlags::empty();
    if !attachments.is_empty() {
        stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }

    if have_depth_stencil {
        let depth_layout = depth_stencil_layout(key);

        references.push(vk::AttachmentReference {
            attachment: attachments.len() as u32,
            layout: depth_layout,
        });
        attachments.push(vk::AttachmentDescription {
            flags: vk::AttachmentDescriptionFlags::empty(),
            format: key.vk_formats[rt_count],
            samples: key.sample_count,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::LOAD,
            stencil_store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: depth_layout,
            final_layout: depth_layout,
        });

        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    }

    let dependencies = [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            dst_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::empty(),
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: stages,
            dst_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::empty(),
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
    ];

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&references[..rt_count]);
    if have_depth_stencil {
        subpass = subpass.depth_stencil_attachment(&references[rt_count]);
    }
    let subpasses = [subpass.build()];

    let pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let vk_render_pass = unsafe { device.raw.create_render_pass(&pass_info, None) }?;
    Ok(vk_render_pass)
}

bitflags! {
    struct DynamicStateFlags: u32 {
        const VIEWPORT = 0x1;
        const SCISSOR = 0x2;
        const VIEWPORT_COUNT = 0x4;
        const SCISSOR_COUNT = 0x8;
        const BLEND_CONSTANTS = 0x10;
        const STENCIL_REFERENCE = 0x20;
        const DEPTH_BOUNDS = 0x40;
        const TOPOLOGY = 0x80;
        const VERTEX_BUFFER_STRIDE = 0x100;
    }
}

const DYNAMIC_STATE_LIST: [(DynamicStateFlags, vk::DynamicState); 9] = [
    (DynamicStateFlags::VIEWPORT, vk::DynamicState::VIEWPORT),
    (DynamicStateFlags::SCISSOR, vk::DynamicState::SCISSOR),
    (
        DynamicStateFlags::VIEWPORT_COUNT,
        vk::DynamicState::VIEWPORT_WITH_COUNT_EXT,
    ),
    (
        DynamicStateFlags::SCISSOR_COUNT,
        vk::DynamicState::SCISSOR_WITH_COUNT_EXT,
    ),
    (
        DynamicStateFlags::BLEND_CONSTANTS,
        vk::DynamicState::BLEND_CONSTANTS,
    ),
    (
        DynamicStateFlags::STENCIL_REFERENCE,
        vk::DynamicState::STENCIL_REFERENCE,
    ),
    (
        DynamicStateFlags::DEPTH_BOUNDS,
        vk::DynamicState::DEPTH_BOUNDS,
    ),
    (
        DynamicStateFlags::TOPOLOGY,
        vk::DynamicState::PRIMITIVE_TOPOLOGY_EXT,
    ),
    (
        DynamicStateFlags::VERTEX_BUFFER_STRIDE,
        vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE_EXT,
    ),
];

fn blend_factor_needs_constants(factor: vk::BlendFactor) -> bool {
    factor == vk::BlendFactor::CONSTANT_COLOR
        || factor == vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR
        || factor == vk::BlendFactor::CONSTANT_ALPHA
        || factor == vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA
}

fn blend_attachment_needs_constants(attachment: &vk::PipelineColorBlendAttachmentState) -> bool {
    attachment.blend_enable != vk::FALSE
        && (blend_factor_needs_constants(attachment.src_color_blend_factor)
            || blend_factor_needs_constants(attachment.dst_color_blend_factor)
            || blend_factor_needs_constants(attachment.src_alpha_blend_factor)
            || blend_factor_needs_constants(attachment.dst_alpha_blend_factor))
}

/// Picks the dynamic state lists for the static track and the fallback
/// track. Both tracks always leave viewport and scissor dynamic; the static
/// track additionally makes their count, the topology and (with vertex
/// buffers bound) the stride dynamic.
fn dynamic_state_lists(
    supports_extended_dynamic_state: bool,
    vertex_buffer_mask: u32,
    stencil_test_enable: bool,
    depth_bounds_test_enable: bool,
    blend_attachments: &[vk::PipelineColorBlendAttachmentState],
) -> (
    SmallVec<[vk::DynamicState; 9]>,
    SmallVec<[vk::DynamicState; 9]>,
) {
    let mut flags = DynamicStateFlags::empty();
    let mut flags_fallback = DynamicStateFlags::empty();

    if supports_extended_dynamic_state {
        flags |= DynamicStateFlags::VIEWPORT_COUNT
            | DynamicStateFlags::SCISSOR_COUNT
            | DynamicStateFlags::TOPOLOGY;
    } else {
        flags |= DynamicStateFlags::VIEWPORT | DynamicStateFlags::SCISSOR;
    }
    flags_fallback |= DynamicStateFlags::VIEWPORT | DynamicStateFlags::SCISSOR;

    if vertex_buffer_mask != 0 && supports_extended_dynamic_state {
        flags |= DynamicStateFlags::VERTEX_BUFFER_STRIDE;
    }

    if stencil_test_enable {
        flags |= DynamicStateFlags::STENCIL_REFERENCE;
        flags_fallback |= DynamicStateFlags::STENCIL_REFERENCE;
    }

    if depth_bounds_test_enable {
        flags |= DynamicStateFlags::DEPTH_BOUNDS;
        flags_fallback |= DynamicStateFlags::DEPTH_BOUNDS;
    }

    if blend_attachments.iter().any(blend_attachment_needs_constants) {
        flags |= DynamicStateFlags::BLEND_CONSTANTS;
        flags_fallback |= DynamicStateFlags::BLEND_CONSTANTS;
    }

    let mut states = SmallVec::new();
    let mut states_fallback = SmallVec::new();
    for &(flag, vk_state) in DYNAMIC_STATE_LIST.iter() {
        if flags.contains(flag) {
            states.push(vk_state);
        }
        if flags_fallback.contains(flag) {
            states_fallback.push(vk_state);
        }
    }

    (states, states_fallback)
}

fn is_dual_source_blend(blend: Blend) -> bool {
    matches!(
        blend,
        Blend::Src1Color | Blend::InvSrc1Color | Blend::Src1Alpha | Blend::InvSrc1Alpha
    )
}

fn is_dual_source_blending(desc: &RenderTargetBlendDesc) -> bool {
    desc.blend_enable
        && (is_dual_source_blend(desc.src_blend)
            || is_dual_source_blend(desc.dst_blend)
            || is_dual_source_blend(desc.src_blend_alpha)
            || is_dual_source_blend(desc.dst_blend_alpha))
}

fn blend_attachment(desc: &RenderTargetBlendDesc) -> vk::PipelineColorBlendAttachmentState {
    let mut attachment = vk::PipelineColorBlendAttachmentState::default();
    if desc.blend_enable {
        attachment.blend_enable = vk::TRUE;
        attachment.src_color_blend_factor = conv::map_blend_factor(desc.src_blend, false);
        attachment.dst_color_blend_factor = conv::map_blend_factor(desc.dst_blend, false);
        attachment.color_blend_op = conv::map_blend_op(desc.blend_op);
        attachment.src_alpha_blend_factor = conv::map_blend_factor(desc.src_blend_alpha, true);
        attachment.dst_alpha_blend_factor = conv::map_blend_factor(desc.dst_blend_alpha, true);
        attachment.alpha_blend_op = conv::map_blend_op(desc.blend_op_alpha);
    }
    attachment.color_write_mask =
        vk::ColorComponentFlags::from_raw((desc.render_target_write_mask & 0xf) as u32);
    attachment
}

fn stencil_op_state(desc: &StencilOpDesc, compare_mask: u8, write_mask: u8) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: conv::map_stencil_op(desc.fail_op),
        pass_op: conv::map_stencil_op(desc.pass_op),
        depth_fail_op: conv::map_stencil_op(desc.depth_fail_op),
        compare_op: conv::map_comparison(desc.func),
        compare_mask: compare_mask as u32,
        write_mask: write_mask as u32,
        // The stencil reference value is dynamic state.
        reference: 0,
    }
}

/// Render targets whose format stores alpha in the only channel are written
/// through a swizzle that moves the shader's alpha output into that channel.
fn rt_output_swizzle(format: Format) -> ComponentMapping {
    match format {
        Format::A8Unorm => ComponentMapping {
            r: ComponentSwizzle::A,
            g: ComponentSwizzle::R,
            b: ComponentSwizzle::G,
            a: ComponentSwizzle::B,
        },
        _ => ComponentMapping::IDENTITY,
    }
}

/// Resolves `APPEND_ALIGNED_ELEMENT` offsets: each slot packs appended
/// elements tightly behind the previous element, aligned to 4 bytes.
fn compute_input_layout_offsets(input_layout: &[InputElement]) -> Result<Vec<u32>> {
    let mut slot_offsets = [0u32; MAX_VERTEX_BUFFERS];
    let mut offsets = Vec::with_capacity(input_layout.len());

    for element in input_layout {
        if element.input_slot as usize >= MAX_VERTEX_BUFFERS {
            warn!("invalid input slot {}", element.input_slot);
            return Err(Error::InvalidArgument("input element slot"));
        }
        if element.format == Format::Unknown {
            warn!(
                "invalid format for input element \"{}\"",
                element.semantic_name
            );
            return Err(Error::InvalidArgument("input element format"));
        }

        let offset = if element.aligned_byte_offset != APPEND_ALIGNED_ELEMENT {
            element.aligned_byte_offset
        } else {
            slot_offsets[element.input_slot as usize]
        };
        offsets.push(offset);

        let byte_count = element.format.info().block_byte_count;
        slot_offsets[element.input_slot as usize] =
            crate::align((offset + byte_count) as u64, 4) as u32;
    }

    Ok(offsets)
}

fn can_use_dynamic_stride(
    vertex_buffer_mask: u32,
    minimum_strides: &[u32; MAX_VERTEX_BUFFERS],
    strides: &[u32; MAX_VERTEX_BUFFERS],
) -> bool {
    let mut mask = vertex_buffer_mask;
    while mask != 0 {
        let slot = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        // The bound stride must cover every attribute read from the slot;
        // the validation layers flag shorter strides and some drivers
        // misrender them.
        if strides[slot] < minimum_strides[slot] {
            trace!(
                "stride for slot {} is {} bytes, need at least {}",
                slot,
                strides[slot],
                minimum_strides[slot]
            );
            return false;
        }
    }
    true
}

fn shader_entry_point() -> &'static CStr {
    unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") }
}

struct ShaderStage {
    stage: vk::ShaderStageFlags,
    module: vk::ShaderModule,
}

struct CompiledPipeline {
    key: PipelineKey,
    vk_pipeline: vk::Pipeline,
    vk_render_pass: vk::RenderPass,
}

/// Fallback variant cache. Compilation happens outside the lock; `insert`
/// double-checks the key and reports whether the candidate won the race.
struct VariantCache {
    entries: Mutex<Vec<CompiledPipeline>>,
}

impl VariantCache {
    fn new() -> Self {
        VariantCache {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn find(&self, key: &PipelineKey) -> Option<(vk::Pipeline, vk::RenderPass)> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.key == *key)
            .map(|entry| (entry.vk_pipeline, entry.vk_render_pass))
    }

    /// Returns the cached pipeline for `key`, inserting the candidate if
    /// the key is still vacant. The flag is false when another thread's
    /// pipeline was already cached; the caller owns the rejected candidate.
    fn insert(
        &self,
        key: PipelineKey,
        vk_pipeline: vk::Pipeline,
        vk_render_pass: vk::RenderPass,
    ) -> (vk::Pipeline, vk::RenderPass, bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter().find(|entry| entry.key == key) {
            return (entry.vk_pipeline, entry.vk_render_pass, false);
        }
        entries.push(CompiledPipeline {
            key,
            vk_pipeline,
            vk_render_pass,
        });
        (vk_pipeline, vk_render_pass, true)
    }

    fn cleanup(&self, device: &ash::Device) {
        let mut entries = self.entries.lock();
        for entry in entries.drain(..) {
            unsafe { device.destroy_pipeline(entry.vk_pipeline, None) };
        }
    }
}

struct RasterizerInfo {
    depth_clamp_enable: bool,
    rasterizer_discard_enable: bool,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_bias_enable: bool,
    depth_bias_constant_factor: f32,
    depth_bias_clamp: f32,
    depth_bias_slope_factor: f32,
}

impl Default for RasterizerInfo {
    fn default() -> Self {
        RasterizerInfo {
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_bias_enable: false,
            depth_bias_constant_factor: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_factor: 0.0,
        }
    }
}

#[derive(Default)]
struct DepthStencilInfo {
    depth_test_enable: bool,
    depth_write_enable: bool,
    depth_compare_op: vk::CompareOp,
    depth_bounds_test_enable: bool,
    stencil_test_enable: bool,
    front: vk::StencilOpState,
    back: vk::StencilOpState,
}

struct GraphicsPipeline {
    root_signature: Arc<RootSignature>,
    stages: SmallVec<[ShaderStage; 5]>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    attribute_bindings: Vec<vk::VertexInputBindingDescription>,
    instance_divisors: Vec<vk::VertexInputBindingDivisorDescriptionEXT>,
    minimum_vertex_buffer_dynamic_stride: [u32; MAX_VERTEX_BUFFERS],
    vertex_buffer_mask: u32,
    blend_attachments: ArrayVec<[vk::PipelineColorBlendAttachmentState; MAX_RENDER_TARGETS]>,
    logic_op_enable: bool,
    logic_op: vk::LogicOp,
    rasterizer: RasterizerInfo,
    ds: DepthStencilInfo,
    sample_count: vk::SampleCountFlags,
    sample_mask: Option<u32>,
    alpha_to_coverage: bool,
    rtv_formats: [vk::Format; MAX_RENDER_TARGETS],
    rt_count: usize,
    /// Bit per attachment whose format was left unknown at creation; bit
    /// `rt_count` stands for the depth/stencil attachment.
    null_attachment_mask: u32,
    dsv_format: vk::Format,
    topology_type: PrimitiveTopologyType,
    strip_cut_value: StripCutValue,
    patch_vertex_count: u32,
    xfb_enabled: bool,
    dynamic_states: SmallVec<[vk::DynamicState; 9]>,
    dynamic_states_fallback: SmallVec<[vk::DynamicState; 9]>,
    /// Static-track pipeline; null on the fallback track.
    pipeline: vk::Pipeline,
    render_pass: vk::RenderPass,
    dsv_layout: vk::ImageLayout,
    variants: VariantCache,
}

struct ComputePipeline {
    vk_pipeline: vk::Pipeline,
}

enum PipelineKind {
    Compute(ComputePipeline),
    Graphics(GraphicsPipeline),
}

pub struct PipelineState {
    kind: PipelineKind,
}

impl PipelineState {
    pub(crate) fn new_compute(
        device: &Device,
        desc: &ComputePipelineDesc,
    ) -> Result<Arc<PipelineState>> {
        let interface = desc.root_signature.shader_interface(None);
        let module = create_shader_module(device, &desc.cs, &interface, &CompileArguments::default())?;

        let stage_info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(shader_entry_point())
            .build();
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage_info)
            .layout(desc.root_signature.vk_pipeline_layout)
            .base_pipeline_index(-1)
            .build();

        let result = unsafe {
            device
                .raw
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { device.raw.destroy_shader_module(module, None) };

        let pipelines = match result {
            Ok(pipelines) => pipelines,
            Err((_, err)) => {
                warn!("failed to create compute pipeline: {:?}", err);
                return Err(err.into());
            }
        };

        Ok(Arc::new(PipelineState {
            kind: PipelineKind::Compute(ComputePipeline {
                vk_pipeline: pipelines[0],
            }),
        }))
    }

    pub(crate) fn new_graphics(
        device: &Device,
        desc: &GraphicsPipelineDesc,
    ) -> Result<Arc<PipelineState>> {
        let mut graphics = GraphicsPipeline {
            root_signature: desc.root_signature.clone(),
            stages: SmallVec::new(),
            attributes: Vec::new(),
            attribute_bindings: Vec::new(),
            instance_divisors: Vec::new(),
            minimum_vertex_buffer_dynamic_stride: [0; MAX_VERTEX_BUFFERS],
            vertex_buffer_mask: 0,
            blend_attachments: ArrayVec::new(),
            logic_op_enable: false,
            logic_op: vk::LogicOp::NO_OP,
            rasterizer: RasterizerInfo::default(),
            ds: DepthStencilInfo::default(),
            sample_count: vk::SampleCountFlags::TYPE_1,
            sample_mask: None,
            alpha_to_coverage: false,
            rtv_formats: [vk::Format::UNDEFINED; MAX_RENDER_TARGETS],
            rt_count: 0,
            null_attachment_mask: 0,
            dsv_format: vk::Format::UNDEFINED,
            topology_type: desc.primitive_topology_type,
            strip_cut_value: desc.strip_cut_value,
            patch_vertex_count: 0,
            xfb_enabled: false,
            dynamic_states: SmallVec::new(),
            dynamic_states_fallback: SmallVec::new(),
            pipeline: vk::Pipeline::null(),
            render_pass: vk::RenderPass::null(),
            dsv_layout: vk::ImageLayout::UNDEFINED,
            variants: VariantCache::new(),
        };

        if let Err(err) = graphics.init(device, desc) {
            graphics.destroy(device);
            return Err(err);
        }

        Ok(Arc::new(PipelineState {
            kind: PipelineKind::Graphics(graphics),
        }))
    }

    pub fn vk_bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Compute(_) => vk::PipelineBindPoint::COMPUTE,
            PipelineKind::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
        }
    }

    pub fn compute_pipeline(&self) -> Option<vk::Pipeline> {
        match &self.kind {
            PipelineKind::Compute(compute) => Some(compute.vk_pipeline),
            PipelineKind::Graphics(_) => None,
        }
    }

    /// Image layout the depth/stencil attachment must be in while this
    /// state's render pass is active.
    pub fn dsv_layout(&self) -> vk::ImageLayout {
        match &self.kind {
            PipelineKind::Graphics(graphics) => graphics.dsv_layout,
            PipelineKind::Compute(_) => vk::ImageLayout::UNDEFINED,
        }
    }

    /// Fast path for the static track: the pipeline compiled at creation
    /// time, when the draw-time state is compatible with it. Returns `None`
    /// when the caller must take [`PipelineState::get_or_create_pipeline`].
    pub fn get_pipeline(
        &self,
        dyn_state: &DynamicState,
        dsv_format: vk::Format,
    ) -> Option<(vk::Pipeline, vk::RenderPass)> {
        let graphics = match &self.kind {
            PipelineKind::Graphics(graphics) => graphics,
            PipelineKind::Compute(_) => return None,
        };

        if graphics.pipeline == vk::Pipeline::null() {
            return None;
        }

        // Unknown-DSV-format workaround: some applications bind a depth
        // buffer the pipeline never declared.
        if dsv_format != graphics.dsv_format {
            trace!(
                "DSV format mismatch, expected {:?}, got {:?}",
                graphics.dsv_format,
                dsv_format
            );
            return None;
        }

        if !can_use_dynamic_stride(
            graphics.vertex_buffer_mask,
            &graphics.minimum_vertex_buffer_dynamic_stride,
            &dyn_state.vertex_strides,
        ) {
            return None;
        }

        // Using a different patch size for the topology than the pipeline
        // should be illegal, but tolerate it by falling back.
        if let PrimitiveTopology::PatchList { control_points } = dyn_state.primitive_topology {
            if control_points.max(1) != graphics.patch_vertex_count {
                return None;
            }
        }

        Some((graphics.pipeline, graphics.render_pass))
    }

    /// Fallback path: finds or compiles the variant for the draw-time key.
    /// Compilation runs outside the cache lock; when two threads race, the
    /// loser's pipeline is destroyed and the winner's returned.
    pub fn get_or_create_pipeline(
        &self,
        device: &Device,
        dyn_state: &DynamicState,
        dsv_format: vk::Format,
    ) -> Result<(vk::Pipeline, vk::RenderPass)> {
        let graphics = match &self.kind {
            PipelineKind::Graphics(graphics) => graphics,
            PipelineKind::Compute(_) => {
                return Err(Error::InvalidArgument("compute pipeline state"));
            }
        };

        let key = pipeline_key(&graphics.attributes, dyn_state, dsv_format);

        if let Some(found) = graphics.variants.find(&key) {
            return Ok(found);
        }

        if device.caps.extended_dynamic_state {
            warn!("extended dynamic state is supported, but compiling a fallback pipeline late");
        }

        let (vk_pipeline, vk_render_pass) =
            graphics.create_variant(device, Some(dyn_state), dsv_format)?;

        let (winner, winner_pass, inserted) =
            graphics.variants.insert(key, vk_pipeline, vk_render_pass);
        if !inserted {
            // Another thread compiled this variant first.
            unsafe { device.raw.destroy_pipeline(vk_pipeline, None) };
        }
        Ok((winner, winner_pass))
    }

    pub(crate) fn destroy(&self, device: &Device) {
        match &self.kind {
            PipelineKind::Compute(compute) => unsafe {
                device.raw.destroy_pipeline(compute.vk_pipeline, None);
            },
            PipelineKind::Graphics(graphics) => graphics.destroy(device),
        }
    }
}

fn create_shader_module(
    device: &Device,
    bytecode: &[u8],
    interface: &crate::shader::ShaderInterface,
    args: &CompileArguments,
) -> Result<vk::ShaderModule> {
    let spirv = device.compiler.compile(bytecode, interface, args)?;
    let module_info = vk::ShaderModuleCreateInfo::builder().code(&spirv);
    Ok(unsafe { device.raw.create_shader_module(&module_info, None) }?)
}

impl GraphicsPipeline {
    fn dsv_attachment_mask(&self) -> u32 {
        1 << self.rt_count
    }

    fn init(&mut self, device: &Device, desc: &GraphicsPipelineDesc) -> Result<()> {
        let rt_count = desc.rtv_formats.len();
        let mut ps_output_swizzles: ArrayVec<[ComponentMapping; MAX_RENDER_TARGETS]> =
            ArrayVec::new();

        for (index, &format) in desc.rtv_formats.iter().enumerate() {
            if format == Format::Unknown {
                self.null_attachment_mask |= 1 << index;
                ps_output_swizzles.push(ComponentMapping::IDENTITY);
            } else {
                ps_output_swizzles.push(rt_output_swizzle(format));
                self.rtv_formats[index] = format.vk_format();
            }

            let rt_desc = &desc.blend.render_targets[if desc.blend.independent_blend_enable {
                index
            } else {
                0
            }];
            if desc.blend.independent_blend_enable && rt_desc.logic_op_enable {
                warn!("independent blend cannot be combined with logic operations");
                return Err(Error::InvalidArgument("independent blend with logic op"));
            }
            if rt_desc.blend_enable && rt_desc.logic_op_enable {
                warn!("only one of blending and logic operations can be enabled");
                return Err(Error::InvalidArgument("blend with logic op"));
            }

            self.blend_attachments.push(blend_attachment(rt_desc));
        }
        self.rt_count = rt_count;

        self.logic_op_enable = desc.blend.render_targets[0].logic_op_enable;
        self.logic_op = conv::map_logic_op(desc.blend.render_targets[0].logic_op);
        if self.logic_op_enable && !device.caps.logic_op {
            error!("logic op not supported by device");
            return Err(Error::InvalidArgument("logic op"));
        }

        self.init_depth_stencil(device, desc)?;

        self.sample_count = conv::map_sample_count(desc.sample_count)?;

        let dual_source_blending = is_dual_source_blending(&desc.blend.render_targets[0]);
        if dual_source_blending {
            if rt_count > 1 {
                warn!("only one render target is allowed with dual source blending");
                return Err(Error::InvalidArgument("dual source blending"));
            }
            if desc.blend.independent_blend_enable {
                for rt_desc in &desc.blend.render_targets[1..] {
                    if rt_desc.blend_enable {
                        warn!(
                            "blending cannot be enabled on secondary render targets \
                             with dual source blending"
                        );
                        return Err(Error::InvalidArgument("dual source blending"));
                    }
                }
            }
        }
        let mut ps_args = CompileArguments::default();
        ps_args.sample_count = Some(desc.sample_count);
        ps_args.dual_source_blending = dual_source_blending;
        ps_args.output_swizzles = ps_output_swizzles;

        let input_signature = self.init_stages(device, desc, &ps_args)?;
        self.init_vertex_input(device, desc, &input_signature)?;

        self.init_rasterizer(desc);
        self.sample_mask = if desc.sample_mask != !0u32 {
            Some(desc.sample_mask)
        } else {
            None
        };
        self.alpha_to_coverage = desc.blend.alpha_to_coverage_enable;

        let supports_extended_dynamic_state = device.caps.extended_dynamic_state
            && desc.primitive_topology_type != PrimitiveTopologyType::Undefined
            && (desc.primitive_topology_type != PrimitiveTopologyType::Patch
                || self.patch_vertex_count != 0);

        let (dynamic_states, dynamic_states_fallback) = dynamic_state_lists(
            supports_extended_dynamic_state,
            self.vertex_buffer_mask,
            self.ds.stencil_test_enable,
            self.ds.depth_bounds_test_enable,
            &self.blend_attachments,
        );
        self.dynamic_states = dynamic_states;
        self.dynamic_states_fallback = dynamic_states_fallback;

        if supports_extended_dynamic_state {
            // Every draw-time parameter is dynamic, so one pipeline suffices
            // for the lifetime of the state.
            let (pipeline, render_pass) = self.create_variant(device, None, self.dsv_format)?;
            self.pipeline = pipeline;
            self.render_pass = render_pass;
            self.dsv_layout = depth_stencil_layout(&self.render_pass_key(self.dsv_format));
        } else {
            let (render_pass, dsv_layout) =
                self.create_render_pass(device, vk::Format::UNDEFINED)?;
            self.render_pass = render_pass;
            self.dsv_layout = dsv_layout;
        }

        Ok(())
    }

    fn init_depth_stencil(&mut self, device: &Device, desc: &GraphicsPipelineDesc) -> Result<()> {
        let ds_desc = &desc.depth_stencil;

        self.ds.depth_test_enable = ds_desc.depth_enable;
        if ds_desc.depth_enable {
            self.ds.depth_write_enable = ds_desc.depth_write_enable;
            self.ds.depth_compare_op = conv::map_comparison(ds_desc.depth_func);
        }
        self.ds.depth_bounds_test_enable = ds_desc.depth_bounds_test_enable;
        if ds_desc.depth_bounds_test_enable && !device.caps.depth_bounds {
            error!("depth bounds test not supported by device");
            return Err(Error::InvalidArgument("depth bounds test"));
        }
        self.ds.stencil_test_enable = ds_desc.stencil_enable;
        if ds_desc.stencil_enable {
            self.ds.front = stencil_op_state(
                &ds_desc.front,
                ds_desc.stencil_read_mask,
                ds_desc.stencil_write_mask,
            );
            self.ds.back = stencil_op_state(
                &ds_desc.back,
                ds_desc.stencil_read_mask,
                ds_desc.stencil_write_mask,
            );
        }

        // A depth test that neither compares nor writes is a no-op; dropping
        // it lets an unknown DSV format mean "no depth attachment at all".
        if desc.dsv_format == Format::Unknown
            && self.ds.depth_test_enable
            && !self.ds.depth_write_enable
            && self.ds.depth_compare_op == vk::CompareOp::ALWAYS
            && !self.ds.stencil_test_enable
        {
            trace!("disabling depth test");
            self.ds.depth_test_enable = false;
        }

        if self.ds.depth_test_enable || self.ds.stencil_test_enable {
            if desc.dsv_format == Format::Unknown {
                warn!("depth/stencil tests enabled without a DSV format");
                self.null_attachment_mask |= self.dsv_attachment_mask();
            } else if desc.dsv_format.is_depth_stencil() {
                self.dsv_format = desc.dsv_format.info_for_usage(true).vk_format;
            } else {
                warn!("format {:?} is not a depth/stencil format", desc.dsv_format);
            }
        }

        Ok(())
    }

    fn init_stages(
        &mut self,
        device: &Device,
        desc: &GraphicsPipelineDesc,
        ps_args: &CompileArguments,
    ) -> Result<Vec<SignatureElement>> {
        let mut input_signature = Vec::new();

        if !desc.stream_output.elements.is_empty() {
            if !desc
                .root_signature
                .flags
                .contains(RootSignatureFlags::ALLOW_STREAM_OUTPUT)
            {
                warn!("stream output requires the stream output root signature flag");
                return Err(Error::InvalidArgument("stream output"));
            }
            if !device.caps.transform_feedback {
                warn!("transform feedback is not supported by the device");
                return Err(Error::NotImplemented("stream output"));
            }
            self.xfb_enabled = true;
        }

        let xfb_info = TransformFeedbackInfo {
            elements: &desc.stream_output.elements,
            buffer_strides: &desc.stream_output.buffer_strides,
        };
        // Transform feedback attaches to the last stage before
        // rasterization.
        let xfb_stage = if !self.xfb_enabled {
            vk::ShaderStageFlags::empty()
        } else if desc.gs.is_some() {
            vk::ShaderStageFlags::GEOMETRY
        } else if desc.ds.is_some() {
            vk::ShaderStageFlags::TESSELLATION_EVALUATION
        } else {
            vk::ShaderStageFlags::VERTEX
        };

        let stage_list: [(vk::ShaderStageFlags, Option<&[u8]>); 5] = [
            (vk::ShaderStageFlags::VERTEX, desc.vs.as_deref()),
            (vk::ShaderStageFlags::TESSELLATION_CONTROL, desc.hs.as_deref()),
            (
                vk::ShaderStageFlags::TESSELLATION_EVALUATION,
                desc.ds.as_deref(),
            ),
            (vk::ShaderStageFlags::GEOMETRY, desc.gs.as_deref()),
            (vk::ShaderStageFlags::FRAGMENT, desc.ps.as_deref()),
        ];

        let default_args = CompileArguments::default();
        for &(stage, bytecode) in stage_list.iter() {
            let bytecode = match bytecode {
                Some(bytecode) if !bytecode.is_empty() => bytecode,
                _ => continue,
            };

            let mut args = &default_args;
            match stage {
                vk::ShaderStageFlags::VERTEX => {
                    input_signature = device.compiler.parse_input_signature(bytecode)?;
                }
                vk::ShaderStageFlags::TESSELLATION_CONTROL => {
                    self.patch_vertex_count = device.compiler.scan_patch_vertex_count(bytecode)?;
                    if desc.primitive_topology_type != PrimitiveTopologyType::Patch {
                        warn!("tessellation shaders require the patch topology type");
                        return Err(Error::InvalidArgument("tessellation topology type"));
                    }
                }
                vk::ShaderStageFlags::TESSELLATION_EVALUATION => {
                    if desc.primitive_topology_type != PrimitiveTopologyType::Patch {
                        warn!("tessellation shaders require the patch topology type");
                        return Err(Error::InvalidArgument("tessellation topology type"));
                    }
                }
                vk::ShaderStageFlags::FRAGMENT => {
                    args = ps_args;
                }
                _ => {}
            }

            let xfb = if stage == xfb_stage {
                Some(&xfb_info)
            } else {
                None
            };
            let interface = desc.root_signature.shader_interface(xfb);

            let module = create_shader_module(device, bytecode, &interface, args)?;
            self.stages.push(ShaderStage { stage, module });
        }

        Ok(input_signature)
    }

    fn init_vertex_input(
        &mut self,
        device: &Device,
        desc: &GraphicsPipelineDesc,
        input_signature: &[SignatureElement],
    ) -> Result<()> {
        if desc.input_layout.is_empty() {
            return Ok(());
        }
        if !desc
            .root_signature
            .flags
            .contains(RootSignatureFlags::ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT)
        {
            warn!("input layout requires the input assembler root signature flag");
            return Err(Error::InvalidArgument("input layout"));
        }

        let aligned_offsets = compute_input_layout_offsets(&desc.input_layout)?;

        let mut input_rates = [vk::VertexInputRate::VERTEX; MAX_VERTEX_BUFFERS];
        let mut divisors = [0u32; MAX_VERTEX_BUFFERS];
        let mut mask = 0u32;

        for (element, &aligned_offset) in desc.input_layout.iter().zip(&aligned_offsets) {
            let slot = element.input_slot as usize;

            let signature_element = match find_signature_element(
                input_signature,
                &element.semantic_name,
                element.semantic_index,
                0,
            ) {
                Some(signature_element) => signature_element,
                None => {
                    // Not consumed by the vertex shader.
                    trace!("unused input element \"{}\"", element.semantic_name);
                    continue;
                }
            };

            let offset = if element.aligned_byte_offset != APPEND_ALIGNED_ELEMENT {
                element.aligned_byte_offset
            } else {
                aligned_offset
            };

            self.attributes.push(vk::VertexInputAttributeDescription {
                location: signature_element.register_index,
                binding: element.input_slot,
                format: element.format.vk_format(),
                offset,
            });

            let byte_count = element.format.info().block_byte_count;
            self.minimum_vertex_buffer_dynamic_stride[slot] =
                self.minimum_vertex_buffer_dynamic_stride[slot].max(offset + byte_count);

            let (input_rate, instance_divisor) = match element.input_slot_class {
                InputClassification::PerVertex => (vk::VertexInputRate::VERTEX, 1),
                InputClassification::PerInstance => {
                    let mut divisor = element.instance_data_step_rate;
                    if divisor > device.limits.max_vertex_attrib_divisor
                        || (divisor == 0 && !device.caps.vertex_attrib_zero_divisor)
                    {
                        warn!("instance divisor {} not supported by device", divisor);
                        divisor = 1;
                    }
                    (vk::VertexInputRate::INSTANCE, divisor)
                }
            };

            if mask & (1 << slot) != 0
                && (input_rates[slot] != input_rate || divisors[slot] != instance_divisor)
            {
                warn!(
                    "input rate or divisor on slot {} conflicts with an earlier element",
                    slot
                );
                return Err(Error::InvalidArgument("conflicting input slot rates"));
            }

            input_rates[slot] = input_rate;
            divisors[slot] = instance_divisor;

            if mask & (1 << slot) == 0 {
                if instance_divisor != 1 {
                    self.instance_divisors
                        .push(vk::VertexInputBindingDivisorDescriptionEXT {
                            binding: element.input_slot,
                            divisor: instance_divisor,
                        });
                }
                self.attribute_bindings.push(vk::VertexInputBindingDescription {
                    binding: element.input_slot,
                    // Strides come from draw-time state.
                    stride: 0,
                    input_rate,
                });
            }
            mask |= 1 << slot;
        }
        self.vertex_buffer_mask = mask;

        Ok(())
    }

    fn init_rasterizer(&mut self, desc: &GraphicsPipelineDesc) {
        let raster = &desc.rasterizer;

        self.rasterizer.depth_clamp_enable = !raster.depth_clip_enable;
        self.rasterizer.polygon_mode = conv::map_fill_mode(raster.fill_mode);
        self.rasterizer.cull_mode = conv::map_cull_mode(raster.cull_mode);
        self.rasterizer.front_face = if raster.front_counter_clockwise {
            vk::FrontFace::COUNTER_CLOCKWISE
        } else {
            vk::FrontFace::CLOCKWISE
        };
        self.rasterizer.depth_bias_enable =
            raster.depth_bias != 0 || raster.slope_scaled_depth_bias != 0.0;
        self.rasterizer.depth_bias_constant_factor = raster.depth_bias as f32;
        self.rasterizer.depth_bias_clamp = raster.depth_bias_clamp;
        self.rasterizer.depth_bias_slope_factor = raster.slope_scaled_depth_bias;

        let is_dsv_format_unknown = self.null_attachment_mask & self.dsv_attachment_mask() != 0;
        let have_attachment = self.rt_count != 0
            || self.dsv_format != vk::Format::UNDEFINED
            || is_dsv_format_unknown;
        let have_ps = desc.ps.as_deref().map_or(false, |code| !code.is_empty());
        if (!have_attachment && !have_ps)
            || desc.stream_output.rasterized_stream == NO_RASTERIZED_STREAM
        {
            self.rasterizer.rasterizer_discard_enable = true;
        }

        if desc.stream_output.rasterized_stream != 0
            && desc.stream_output.rasterized_stream != NO_RASTERIZED_STREAM
        {
            warn!(
                "rasterization stream {} selection is not supported",
                desc.stream_output.rasterized_stream
            );
        }
    }

    fn render_pass_key(&self, dynamic_dsv_format: vk::Format) -> RenderPassKey {
        let mut key = RenderPassKey::default();
        key.vk_formats[..self.rt_count].copy_from_slice(&self.rtv_formats[..self.rt_count]);
        key.attachment_count = self.rt_count;
        key.sample_count = self.sample_count;

        let mut dsv_format = self.dsv_format;
        if dsv_format == vk::Format::UNDEFINED
            && self.null_attachment_mask & self.dsv_attachment_mask() != 0
        {
            dsv_format = dynamic_dsv_format;
        }

        if dsv_format != vk::Format::UNDEFINED {
            key.depth_enable = self.ds.depth_test_enable;
            key.stencil_enable = self.ds.stencil_test_enable;
            key.depth_write = key.depth_enable && self.ds.depth_write_enable;
            key.stencil_write = key.stencil_enable && self.ds.front.write_mask != 0;
            key.vk_formats[key.attachment_count] = dsv_format;
            key.attachment_count += 1;
        }

        key
    }

    fn create_render_pass(
        &self,
        device: &Device,
        dynamic_dsv_format: vk::Format,
    ) -> Result<(vk::RenderPass, vk::ImageLayout)> {
        let key = self.render_pass_key(dynamic_dsv_format);
        let dsv_layout = depth_stencil_layout(&key);
        let vk_render_pass = device.render_pass_cache.get_or_create(device, &key)?;
        Ok((vk_render_pass, dsv_layout))
    }

    fn create_variant(
        &self,
        device: &Device,
        dyn_state: Option<&DynamicState>,
        dsv_format: vk::Format,
    ) -> Result<(vk::Pipeline, vk::RenderPass)> {
        let mut bindings = self.attribute_bindings.clone();
        if let Some(state) = dyn_state {
            // Without extended dynamic state, strides are baked in.
            for binding in &mut bindings {
                binding.stride = state.vertex_strides[binding.binding as usize];
            }
        }

        let mut divisor_info = vk::PipelineVertexInputDivisorStateCreateInfoEXT::builder()
            .vertex_binding_divisors(&self.instance_divisors);
        let mut input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&self.attributes);
        if !self.instance_divisors.is_empty() {
            input_info = input_info.push_next(&mut divisor_info);
        }

        let restart = self.strip_cut_value != StripCutValue::Disabled;
        let topology = match dyn_state {
            Some(state) => conv::map_topology(state.primitive_topology),
            None => conv::map_topology_type(self.topology_type, restart)?,
        };
        let restart_enable = restart
            && match dyn_state {
                Some(_) => conv::topology_can_restart(topology),
                None => conv::topology_type_can_restart(self.topology_type),
            };
        let ia_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(topology)
            .primitive_restart_enable(restart_enable);

        let patch_control_points = match dyn_state {
            Some(state) => match state.primitive_topology {
                PrimitiveTopology::PatchList { control_points } => control_points.max(1),
                _ => 1,
            },
            None => self.patch_vertex_count,
        };
        let tessellation_info = vk::PipelineTessellationStateCreateInfo::builder()
            .patch_control_points(patch_control_points);

        // With-count dynamic viewports leave the static count at zero.
        let viewport_count = dyn_state.map_or(0, |state| state.viewport_count.max(1));
        let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(viewport_count)
            .scissor_count(viewport_count);

        let raster_info = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(self.rasterizer.depth_clamp_enable)
            .rasterizer_discard_enable(self.rasterizer.rasterizer_discard_enable)
            .polygon_mode(self.rasterizer.polygon_mode)
            .cull_mode(self.rasterizer.cull_mode)
            .front_face(self.rasterizer.front_face)
            .depth_bias_enable(self.rasterizer.depth_bias_enable)
            .depth_bias_constant_factor(self.rasterizer.depth_bias_constant_factor)
            .depth_bias_clamp(self.rasterizer.depth_bias_clamp)
            .depth_bias_slope_factor(self.rasterizer.depth_bias_slope_factor)
            .line_width(1.0);

        let sample_mask;
        let mut ms_info = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(self.sample_count)
            .alpha_to_coverage_enable(self.alpha_to_coverage);
        if let Some(mask) = self.sample_mask {
            sample_mask = [mask, !0u32];
            ms_info = ms_info.sample_mask(&sample_mask);
        }

        let ds_info = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.ds.depth_test_enable)
            .depth_write_enable(self.ds.depth_write_enable)
            .depth_compare_op(self.ds.depth_compare_op)
            .depth_bounds_test_enable(self.ds.depth_bounds_test_enable)
            .stencil_test_enable(self.ds.stencil_test_enable)
            .front(self.ds.front)
            .back(self.ds.back)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);

        let blend_info = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(self.logic_op_enable)
            .logic_op(self.logic_op)
            .attachments(&self.blend_attachments);

        let dynamic_states: &[vk::DynamicState] = match dyn_state {
            Some(_) => &self.dynamic_states_fallback,
            None => &self.dynamic_states,
        };
        let dynamic_info =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(dynamic_states);

        let entry_point = shader_entry_point();
        let stage_infos: SmallVec<[vk::PipelineShaderStageCreateInfo; 5]> = self
            .stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(entry_point)
                    .build()
            })
            .collect();

        // An unknown base DSV format is recompiled against the format
        // observed at draw time.
        let (vk_render_pass, _) = self.create_render_pass(device, dsv_format)?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&input_info)
            .input_assembly_state(&ia_info)
            .tessellation_state(&tessellation_info)
            .viewport_state(&viewport_info)
            .rasterization_state(&raster_info)
            .multisample_state(&ms_info)
            .depth_stencil_state(&ds_info)
            .color_blend_state(&blend_info)
            .dynamic_state(&dynamic_info)
            .layout(self.root_signature.vk_pipeline_layout)
            .render_pass(vk_render_pass)
            .subpass(0)
            .base_pipeline_index(-1)
            .build();

        let pipelines = match unsafe {
            device
                .raw
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines,
            Err((_, err)) => {
                warn!("failed to create graphics pipeline: {:?}", err);
                return Err(err.into());
            }
        };

        Ok((pipelines[0], vk_render_pass))
    }

    fn destroy(&self, device: &Device) {
        unsafe {
            for stage in &self.stages {
                device.raw.destroy_shader_module(stage.module, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                device.raw.destroy_pipeline(self.pipeline, None);
            }
        }
        self.variants.cleanup(&device.raw);
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use ash::vk::Handle;
    use std::thread;

    #[test]
    fn depth_stencil_layouts_follow_write_masks() {
        let mut key = RenderPassKey::default();
        assert_eq!(depth_stencil_layout(&key), vk::ImageLayout::UNDEFINED);

        key.depth_enable = true;
        key.stencil_enable = true;
        key.depth_write = true;
        key.stencil_write = true;
        assert_eq!(
            depth_stencil_layout(&key),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );

        key.stencil_write = false;
        assert_eq!(
            depth_stencil_layout(&key),
            vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
        );

        key.depth_write = false;
        key.stencil_write = true;
        assert_eq!(
            depth_stencil_layout(&key),
            vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        );

        key.stencil_write = false;
        assert_eq!(
            depth_stencil_layout(&key),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn render_pass_keys_compare_by_value() {
        let mut a = RenderPassKey::default();
        a.vk_formats[0] = vk::Format::B8G8R8A8_UNORM;
        a.attachment_count = 1;
        let mut b = a;
        assert_eq!(a, b);

        b.sample_count = vk::SampleCountFlags::TYPE_4;
        assert_ne!(a, b);

        b = a;
        b.vk_formats[0] = vk::Format::R8G8B8A8_UNORM;
        assert_ne!(a, b);
    }

    fn element(name: &str, slot: u32, offset: u32, format: Format) -> InputElement {
        InputElement {
            semantic_name: name.to_string(),
            semantic_index: 0,
            format,
            input_slot: slot,
            aligned_byte_offset: offset,
            input_slot_class: InputClassification::PerVertex,
            instance_data_step_rate: 0,
        }
    }

    #[test]
    fn appended_elements_pack_behind_their_slot() {
        let layout = [
            element("POSITION", 0, APPEND_ALIGNED_ELEMENT, Format::R32G32B32Float),
            element("NORMAL", 0, APPEND_ALIGNED_ELEMENT, Format::R32G32B32Float),
            element("COLOR", 1, APPEND_ALIGNED_ELEMENT, Format::R8G8B8A8Unorm),
            element("TEXCOORD", 0, 32, Format::R32G32Float),
            element("TANGENT", 0, APPEND_ALIGNED_ELEMENT, Format::R32G32Float),
        ];

        let offsets = compute_input_layout_offsets(&layout).unwrap();
        assert_eq!(offsets, vec![0, 12, 0, 32, 40]);
    }

    #[test]
    fn invalid_input_elements_are_rejected() {
        let bad_slot = element("POSITION", MAX_VERTEX_BUFFERS as u32, 0, Format::R32Float);
        assert!(compute_input_layout_offsets(&[bad_slot]).is_err());

        let bad_format = element("POSITION", 0, 0, Format::Unknown);
        assert!(compute_input_layout_offsets(&[bad_format]).is_err());
    }

    #[test]
    fn dual_source_blending_is_detected_from_any_factor() {
        let mut desc = RenderTargetBlendDesc::default();
        assert!(!is_dual_source_blending(&desc));

        desc.src_blend = Blend::Src1Color;
        assert!(!is_dual_source_blending(&desc), "requires blending enabled");

        desc.blend_enable = true;
        assert!(is_dual_source_blending(&desc));

        desc.src_blend = Blend::One;
        desc.dst_blend_alpha = Blend::InvSrc1Alpha;
        assert!(is_dual_source_blending(&desc));
    }

    #[test]
    fn static_track_gets_with_count_dynamic_states() {
        let (states, fallback) = dynamic_state_lists(true, 0x1, false, false, &[]);

        assert!(states.contains(&vk::DynamicState::VIEWPORT_WITH_COUNT_EXT));
        assert!(states.contains(&vk::DynamicState::SCISSOR_WITH_COUNT_EXT));
        assert!(states.contains(&vk::DynamicState::PRIMITIVE_TOPOLOGY_EXT));
        assert!(states.contains(&vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE_EXT));
        assert!(!states.contains(&vk::DynamicState::VIEWPORT));

        assert!(fallback.contains(&vk::DynamicState::VIEWPORT));
        assert!(fallback.contains(&vk::DynamicState::SCISSOR));
        assert!(!fallback.contains(&vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE_EXT));
        assert!(!fallback.contains(&vk::DynamicState::PRIMITIVE_TOPOLOGY_EXT));
    }

    #[test]
    fn conditional_dynamic_states_follow_the_enabled_features() {
        let blend = [vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::CONSTANT_COLOR,
            ..Default::default()
        }];
        let (states, fallback) = dynamic_state_lists(false, 0, true, true, &blend);

        for list in [&states, &fallback].iter() {
            assert!(list.contains(&vk::DynamicState::STENCIL_REFERENCE));
            assert!(list.contains(&vk::DynamicState::DEPTH_BOUNDS));
            assert!(list.contains(&vk::DynamicState::BLEND_CONSTANTS));
        }

        let (states, _) = dynamic_state_lists(false, 0, false, false, &[]);
        assert!(!states.contains(&vk::DynamicState::STENCIL_REFERENCE));
        assert!(!states.contains(&vk::DynamicState::BLEND_CONSTANTS));
    }

    fn attribute(binding: u32) -> vk::VertexInputAttributeDescription {
        vk::VertexInputAttributeDescription {
            location: 0,
            binding,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: 0,
        }
    }

    #[test]
    fn pipeline_keys_pack_strides_in_first_seen_binding_order() {
        let attributes = [attribute(3), attribute(1), attribute(3), attribute(0)];
        let mut dyn_state = DynamicState::default();
        dyn_state.vertex_strides[0] = 16;
        dyn_state.vertex_strides[1] = 32;
        dyn_state.vertex_strides[3] = 48;
        dyn_state.viewport_count = 0;

        let key = pipeline_key(&attributes, &dyn_state, vk::Format::UNDEFINED);
        assert_eq!(&key.strides[..], &[48, 32, 16]);
        assert_eq!(key.viewport_count, 1, "viewport count saturates at one");

        let same = pipeline_key(&attributes, &dyn_state, vk::Format::UNDEFINED);
        assert_eq!(key, same);

        let other = pipeline_key(&attributes, &dyn_state, vk::Format::D32_SFLOAT);
        assert_ne!(key, other);
    }

    #[test]
    fn dynamic_strides_must_cover_every_attribute() {
        let mut minimum = [0u32; MAX_VERTEX_BUFFERS];
        minimum[0] = 28;
        minimum[2] = 8;

        let mut strides = [0u32; MAX_VERTEX_BUFFERS];
        strides[0] = 32;
        strides[2] = 8;
        assert!(can_use_dynamic_stride(0b101, &minimum, &strides));

        strides[2] = 4;
        assert!(!can_use_dynamic_stride(0b101, &minimum, &strides));
        // Slots outside the mask are not checked.
        assert!(can_use_dynamic_stride(0b001, &minimum, &strides));
    }

    #[test]
    fn alpha_only_targets_swizzle_the_alpha_output_first() {
        let swizzle = rt_output_swizzle(Format::A8Unorm);
        assert_eq!(swizzle.r, ComponentSwizzle::A);
        assert_eq!(swizzle.g, ComponentSwizzle::R);
        assert_eq!(swizzle.b, ComponentSwizzle::G);
        assert_eq!(swizzle.a, ComponentSwizzle::B);

        assert_eq!(
            rt_output_swizzle(Format::R8G8B8A8Unorm),
            ComponentMapping::IDENTITY
        );
    }

    #[test]
    fn variant_cache_keeps_one_pipeline_per_key() {
        let cache = Arc::new(VariantCache::new());
        let key = pipeline_key(
            &[attribute(0)],
            &DynamicState::default(),
            vk::Format::UNDEFINED,
        );

        let handles: Vec<_> = (1..=8u64)
            .map(|raw| {
                let cache = Arc::clone(&cache);
                let key = key.clone();
                thread::spawn(move || {
                    cache.insert(key, vk::Pipeline::from_raw(raw), vk::RenderPass::null())
                })
            })
            .collect();
        let winners: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let inserted: Vec<_> = winners.iter().filter(|(_, _, won)| *won).collect();
        assert_eq!(inserted.len(), 1, "exactly one candidate wins the race");

        let (winner_pipeline, _, _) = *inserted[0];
        assert!(winners
            .iter()
            .all(|&(pipeline, _, _)| pipeline == winner_pipeline));
        assert_eq!(
            cache.find(&key),
            Some((winner_pipeline, vk::RenderPass::null()))
        );
    }

    #[test]
    fn variant_cache_distinguishes_keys() {
        let cache = VariantCache::new();
        let mut dyn_state = DynamicState::default();
        let key_a = pipeline_key(&[attribute(0)], &dyn_state, vk::Format::UNDEFINED);
        dyn_state.vertex_strides[0] = 16;
        let key_b = pipeline_key(&[attribute(0)], &dyn_state, vk::Format::UNDEFINED);

        let (_, _, inserted_a) =
            cache.insert(key_a.clone(), vk::Pipeline::from_raw(1), vk::RenderPass::null());
        let (_, _, inserted_b) =
            cache.insert(key_b.clone(), vk::Pipeline::from_raw(2), vk::RenderPass::null());
        assert!(inserted_a && inserted_b);
        assert_ne!(cache.find(&key_a), cache.find(&key_b));
    }

    #[test]
    fn blend_constant_factors_are_detected() {
        let mut attachment = vk::PipelineColorBlendAttachmentState::default();
        attachment.src_color_blend_factor = vk::BlendFactor::CONSTANT_COLOR;
        assert!(
            !blend_attachment_needs_constants(&attachment),
            "requires blending enabled"
        );

        attachment.blend_enable = vk::TRUE;
        assert!(blend_attachment_needs_constants(&attachment));

        attachment.src_color_blend_factor = vk::BlendFactor::SRC_ALPHA;
        attachment.dst_alpha_blend_factor = vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA;
        assert!(blend_attachment_needs_constants(&attachment));

        attachment.dst_alpha_blend_factor = vk::BlendFactor::ONE;
        assert!(!blend_attachment_needs_constants(&attachment));
    }

    #[test]
    fn blend_attachment_write_mask_maps_component_bits() {
        let mut desc = RenderTargetBlendDesc::default();
        desc.render_target_write_mask = 0x5;
        let attachment = blend_attachment(&desc);
        assert_eq!(
            attachment.color_write_mask,
            vk::ColorComponentFlags::R | vk::ColorComponentFlags::B
        );
        assert_eq!(attachment.blend_enable, vk::FALSE);
    }
}
