//! Root signature compilation.
//!
//! A root signature declares which shader registers a pipeline may touch
//! and whether each lives in a descriptor table, a root constant block or a
//! root descriptor. Compiling one is a two-pass job. The first pass walks
//! the parameter list, decides bindless versus packed per range type from
//! the device's bindless capability flags, and accumulates binding counts
//! plus the D3D12 root cost (constants cost their DWORD count, root
//! descriptors cost two, tables cost one). The second pass emits concrete
//! descriptor set layouts in a fixed order behind the per-device bindless
//! sets: the immutable static sampler set, the root descriptor set (push
//! descriptors when the device budget allows, an inline uniform block when
//! root constants overflow the push constant budget), and last the packed
//! set holding every unrolled non-bindless table descriptor. The pipeline
//! layout stitches these together with one push constant range carrying
//! root constants followed by a 32-bit table offset per descriptor table.

use std::sync::Arc;

use arrayvec::ArrayVec;
use ash::vk;

use crate::bindless::BindlessFlags;
use crate::device::Device;
use crate::shader::{
    BindingFlags, DescriptorBinding, DescriptorTableBuffer, PushConstantBuffer, ResourceBinding,
    ShaderInterface, ShaderInterfaceFlags, TransformFeedbackInfo,
};
use crate::view::{self, AddressMode, Filter, StaticBorderColor};
use crate::{
    ComparisonFunc, Error, Result, ShaderVisibility, MAX_DESCRIPTOR_SETS, MAX_ROOT_COST,
};

/// `NumDescriptors` value declaring an unbounded descriptor range.
pub const UNBOUNDED_RANGE: u32 = u32::MAX;

/// Range offset sentinel appending the range after the previous one.
pub const APPEND_RANGE_OFFSET: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorRangeType {
    Cbv,
    Srv,
    Uav,
    Sampler,
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorRange {
    pub range_type: DescriptorRangeType,
    /// [`UNBOUNDED_RANGE`] declares an unbounded range; only legal when the
    /// range type is bindless-capable on the device.
    pub num_descriptors: u32,
    pub base_shader_register: u32,
    pub register_space: u32,
    /// Offset in descriptors from the start of the table, or
    /// [`APPEND_RANGE_OFFSET`].
    pub offset: u32,
}

#[derive(Clone, Debug)]
pub enum RootParameterKind {
    DescriptorTable(Vec<DescriptorRange>),
    Constants {
        register_space: u32,
        shader_register: u32,
        num_32bit_values: u32,
    },
    Cbv {
        register_space: u32,
        shader_register: u32,
    },
    Srv {
        register_space: u32,
        shader_register: u32,
    },
    Uav {
        register_space: u32,
        shader_register: u32,
    },
}

impl RootParameterKind {
    fn root_descriptor_range_type(&self) -> Option<DescriptorRangeType> {
        match *self {
            RootParameterKind::Cbv { .. } => Some(DescriptorRangeType::Cbv),
            RootParameterKind::Srv { .. } => Some(DescriptorRangeType::Srv),
            RootParameterKind::Uav { .. } => Some(DescriptorRangeType::Uav),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RootParameter {
    pub kind: RootParameterKind,
    pub visibility: ShaderVisibility,
}

/// A sampler baked into the root signature as an immutable descriptor.
#[derive(Clone, Copy, Debug)]
pub struct StaticSamplerDesc {
    pub filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison_func: ComparisonFunc,
    pub border_color: StaticBorderColor,
    pub min_lod: f32,
    pub max_lod: f32,
    pub shader_register: u32,
    pub register_space: u32,
    pub visibility: ShaderVisibility,
}

bitflags! {
    pub struct RootSignatureFlags: u32 {
        const ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT = 0x1;
        const ALLOW_STREAM_OUTPUT = 0x8;
    }
}

#[derive(Clone, Debug)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
    pub static_samplers: Vec<StaticSamplerDesc>,
    pub flags: RootSignatureFlags,
}

impl Default for RootSignatureDesc {
    fn default() -> RootSignatureDesc {
        RootSignatureDesc {
            parameters: Vec::new(),
            static_samplers: Vec::new(),
            flags: RootSignatureFlags::empty(),
        }
    }
}

bitflags! {
    /// Layout strategy picked for the root descriptor set.
    struct LayoutFlags: u32 {
        const PUSH_DESCRIPTORS = 0x1;
        const INLINE_UNIFORM_BLOCK = 0x2;
        const BINDLESS_UAV_COUNTERS = 0x4;
    }
}

fn range_is_bindless(flags: BindlessFlags, range_type: DescriptorRangeType) -> bool {
    let flag = match range_type {
        DescriptorRangeType::Cbv => BindlessFlags::CBV,
        DescriptorRangeType::Srv => BindlessFlags::SRV,
        DescriptorRangeType::Uav => BindlessFlags::UAV,
        DescriptorRangeType::Sampler => BindlessFlags::SAMPLER,
    };
    flags.contains(flag)
}

/// Counts gathered by the first compilation pass.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RootSignatureInfo {
    pub binding_count: u32,
    /// Unrolled descriptors landing in the packed set.
    pub descriptor_count: u32,
    pub push_descriptor_count: u32,
    pub root_constant_count: u32,
    pub has_uav_counters: bool,
    pub cost: u32,
}

impl RootSignatureInfo {
    fn count_range(&mut self, bindless: BindlessFlags, range: &DescriptorRange) -> Result<()> {
        if range_is_bindless(bindless, range.range_type) {
            match range.range_type {
                DescriptorRangeType::Srv => {
                    // Separate buffer and image descriptors.
                    self.binding_count += 2;
                }
                DescriptorRangeType::Uav => {
                    self.binding_count += 2;

                    if bindless.contains(BindlessFlags::UAV_COUNTER) {
                        self.binding_count += 1;
                        self.has_uav_counters = true;
                    } else if range.num_descriptors != UNBOUNDED_RANGE {
                        self.binding_count += range.num_descriptors;
                        self.descriptor_count += range.num_descriptors;
                    }
                }
                DescriptorRangeType::Cbv | DescriptorRangeType::Sampler => {
                    self.binding_count += 1;
                }
            }
        } else {
            if range.num_descriptors == UNBOUNDED_RANGE {
                warn!(
                    "unbounded {:?} range requires bindless support",
                    range.range_type
                );
                return Err(Error::NotImplemented("unbounded descriptor range"));
            }

            let descriptor_count = match range.range_type {
                DescriptorRangeType::Srv => range.num_descriptors * 2,
                DescriptorRangeType::Uav => {
                    let mut count = range.num_descriptors * 2;
                    if bindless.contains(BindlessFlags::UAV_COUNTER) {
                        self.binding_count += 1;
                        self.has_uav_counters = true;
                    } else {
                        count += range.num_descriptors;
                    }
                    count
                }
                DescriptorRangeType::Cbv | DescriptorRangeType::Sampler => range.num_descriptors,
            };

            self.binding_count += descriptor_count;
            self.descriptor_count += descriptor_count;
        }
        Ok(())
    }

    pub(crate) fn from_desc(
        desc: &RootSignatureDesc,
        bindless: BindlessFlags,
    ) -> Result<RootSignatureInfo> {
        let mut info = RootSignatureInfo::default();

        for parameter in &desc.parameters {
            match parameter.kind {
                RootParameterKind::DescriptorTable(ref ranges) => {
                    for range in ranges {
                        info.count_range(bindless, range)?;
                    }
                    info.cost += 1;
                }
                RootParameterKind::Cbv { .. }
                | RootParameterKind::Srv { .. }
                | RootParameterKind::Uav { .. } => {
                    info.binding_count += 1;
                    info.push_descriptor_count += 1;
                    info.cost += 2;
                }
                RootParameterKind::Constants {
                    num_32bit_values, ..
                } => {
                    info.root_constant_count += 1;
                    info.cost += num_32bit_values;
                }
            }
        }

        info.binding_count += desc.static_samplers.len() as u32;

        if info.has_uav_counters {
            info.push_descriptor_count += 1;
        }

        if info.cost > MAX_ROOT_COST {
            warn!(
                "root signature cost {} exceeds the maximum of {}",
                info.cost, MAX_ROOT_COST
            );
            return Err(Error::InvalidArgument("root signature cost"));
        }

        Ok(info)
    }
}

/// Per-parameter data the command recorder binds against.
#[derive(Clone, Copy, Debug)]
pub enum RootParameterInfo {
    Constants {
        /// Offset into the push constant block, in 32-bit words.
        offset: u32,
        count: u32,
    },
    Descriptor {
        binding: DescriptorBinding,
        packed_descriptor: u32,
    },
    DescriptorTable {
        table_index: u32,
        /// Index of the table's first entry in the binding table.
        first_binding: u32,
        binding_count: u32,
        first_packed_descriptor: u32,
        has_packed_descriptors: bool,
    },
}

struct SetContext {
    packed_descriptor_index: u32,
    vk_set: u32,
    vk_binding: u32,
}

pub struct RootSignature {
    pub(crate) vk_pipeline_layout: vk::PipelineLayout,
    vk_sampler_descriptor_layout: vk::DescriptorSetLayout,
    vk_root_descriptor_layout: vk::DescriptorSetLayout,
    vk_packed_descriptor_layout: vk::DescriptorSetLayout,
    static_samplers: Vec<vk::Sampler>,
    pub flags: RootSignatureFlags,
    layout_flags: LayoutFlags,
    interface_flags: ShaderInterfaceFlags,
    /// One entry per logical register access, in set emission order.
    pub(crate) bindings: Vec<ResourceBinding>,
    root_constants: Vec<PushConstantBuffer>,
    pub parameters: Vec<RootParameterInfo>,
    pub(crate) push_constant_range: vk::PushConstantRange,
    descriptor_table_offset: u32,
    descriptor_table_count: u32,
    pub(crate) packed_descriptor_count: u32,
    pub(crate) sampler_descriptor_set: Option<u32>,
    pub(crate) root_descriptor_set: Option<u32>,
    pub(crate) packed_descriptor_set: Option<u32>,
    uav_counter_binding: Option<DescriptorBinding>,
    push_constant_ubo_binding: Option<DescriptorBinding>,
}

impl RootSignature {
    pub(crate) fn new(device: &Device, desc: &RootSignatureDesc) -> Result<Arc<RootSignature>> {
        let info = RootSignatureInfo::from_desc(desc, device.bindless.flags)?;

        let mut root_signature = RootSignature {
            vk_pipeline_layout: vk::PipelineLayout::null(),
            vk_sampler_descriptor_layout: vk::DescriptorSetLayout::null(),
            vk_root_descriptor_layout: vk::DescriptorSetLayout::null(),
            vk_packed_descriptor_layout: vk::DescriptorSetLayout::null(),
            static_samplers: Vec::new(),
            flags: desc.flags,
            layout_flags: LayoutFlags::empty(),
            interface_flags: ShaderInterfaceFlags::empty(),
            bindings: Vec::with_capacity(info.binding_count as usize),
            root_constants: Vec::with_capacity(info.root_constant_count as usize),
            parameters: Vec::new(),
            push_constant_range: vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::ALL,
                offset: 0,
                size: 0,
            },
            descriptor_table_offset: 0,
            descriptor_table_count: 0,
            packed_descriptor_count: info.descriptor_count,
            sampler_descriptor_set: None,
            root_descriptor_set: None,
            packed_descriptor_set: None,
            uav_counter_binding: None,
            push_constant_ubo_binding: None,
        };

        match root_signature.init(device, desc, &info) {
            Ok(()) => Ok(Arc::new(root_signature)),
            Err(err) => {
                root_signature.destroy(device);
                Err(err)
            }
        }
    }

    fn init(
        &mut self,
        device: &Device,
        desc: &RootSignatureDesc,
        info: &RootSignatureInfo,
    ) -> Result<()> {
        let mut set_layouts: ArrayVec<[vk::DescriptorSetLayout; MAX_DESCRIPTOR_SETS]> =
            ArrayVec::new();
        let mut context = SetContext {
            packed_descriptor_index: 0,
            vk_set: 0,
            vk_binding: 0,
        };

        // The bindless sets come first and are fixed per device, so one
        // descriptor heap bind covers every root signature.
        for set_info in device.bindless.set_info.iter() {
            set_layouts.push(set_info.vk_set_layout);
            context.vk_set += 1;
        }

        self.init_static_samplers(device, desc, &mut context)?;
        if self.vk_sampler_descriptor_layout != vk::DescriptorSetLayout::null() {
            self.sampler_descriptor_set = Some(context.vk_set);
            set_layouts.push(self.vk_sampler_descriptor_layout);
            context.vk_set += 1;
            context.vk_binding = 0;
        }

        self.init_push_constants(device, desc);

        if self.push_constant_range.size <= device.limits.max_push_constants_size {
            if device.caps.push_descriptors
                && info.push_descriptor_count <= device.limits.max_push_descriptors
            {
                self.layout_flags |= LayoutFlags::PUSH_DESCRIPTORS;
            }
        } else if device.caps.inline_uniform_block {
            // Push constant data moves into the root descriptor set, which
            // rules out pushing that set's descriptors.
            self.layout_flags |= LayoutFlags::INLINE_UNIFORM_BLOCK;
            self.interface_flags |= ShaderInterfaceFlags::PUSH_CONSTANTS_AS_UNIFORM_BLOCK;
        } else {
            error!(
                "root signature requires {} bytes of push constant space, device supports {}",
                self.push_constant_range.size, device.limits.max_push_constants_size
            );
            return Err(Error::InvalidArgument("push constant size"));
        }

        if info.has_uav_counters {
            self.layout_flags |= LayoutFlags::BINDLESS_UAV_COUNTERS;
        }
        if device.bindless.flags.contains(BindlessFlags::CBV_AS_SSBO) {
            self.interface_flags |= ShaderInterfaceFlags::CBV_AS_SSBO;
        }

        self.init_root_descriptors(device, desc, info, &mut context)?;
        if self.vk_root_descriptor_layout != vk::DescriptorSetLayout::null() {
            self.root_descriptor_set = Some(context.vk_set);
            set_layouts.push(self.vk_root_descriptor_layout);
            context.vk_set += 1;
            context.vk_binding = 0;
        }

        self.init_descriptor_tables(device, desc, info, &mut context)?;
        if self.vk_packed_descriptor_layout != vk::DescriptorSetLayout::null() {
            self.packed_descriptor_set = Some(context.vk_set);
            set_layouts.push(self.vk_packed_descriptor_layout);
            context.vk_set += 1;
        }

        let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let push_constant_ranges = [self.push_constant_range];
        if self.push_constant_range.size != 0
            && !self.layout_flags.contains(LayoutFlags::INLINE_UNIFORM_BLOCK)
        {
            layout_info = layout_info.push_constant_ranges(&push_constant_ranges);
        }
        self.vk_pipeline_layout =
            unsafe { device.raw.create_pipeline_layout(&layout_info, None) }?;

        Ok(())
    }

    fn init_static_samplers(
        &mut self,
        device: &Device,
        desc: &RootSignatureDesc,
        context: &mut SetContext,
    ) -> Result<()> {
        if desc.static_samplers.is_empty() {
            return Ok(());
        }

        for sampler_desc in &desc.static_samplers {
            let vk_sampler = view::create_static_sampler(device, sampler_desc)?;
            self.static_samplers.push(vk_sampler);
        }

        let mut vk_bindings = Vec::with_capacity(desc.static_samplers.len());
        for (i, sampler_desc) in desc.static_samplers.iter().enumerate() {
            vk_bindings.push(vk::DescriptorSetLayoutBinding {
                binding: context.vk_binding,
                descriptor_type: vk::DescriptorType::SAMPLER,
                descriptor_count: 1,
                stage_flags: crate::conv::map_shader_visibility(sampler_desc.visibility),
                p_immutable_samplers: &self.static_samplers[i],
            });

            self.bindings.push(ResourceBinding {
                kind: DescriptorRangeType::Sampler,
                register_space: sampler_desc.register_space,
                register_index: sampler_desc.shader_register,
                register_count: 1,
                descriptor_table: 0,
                descriptor_offset: 0,
                visibility: sampler_desc.visibility,
                flags: BindingFlags::IMAGE,
                binding: DescriptorBinding {
                    set: context.vk_set,
                    binding: context.vk_binding,
                    count: 1,
                },
            });
            context.vk_binding += 1;
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
        self.vk_sampler_descriptor_layout =
            unsafe { device.raw.create_descriptor_set_layout(&layout_info, None) }?;
        Ok(())
    }

    fn init_push_constants(&mut self, device: &Device, desc: &RootSignatureDesc) {
        self.parameters.clear();
        self.parameters.resize(
            desc.parameters.len(),
            RootParameterInfo::Constants {
                offset: 0,
                count: 0,
            },
        );

        for (i, parameter) in desc.parameters.iter().enumerate() {
            if let RootParameterKind::Constants {
                register_space,
                shader_register,
                num_32bit_values,
            } = parameter.kind
            {
                self.parameters[i] = RootParameterInfo::Constants {
                    offset: self.push_constant_range.size / 4,
                    count: num_32bit_values,
                };
                self.root_constants.push(PushConstantBuffer {
                    register_space,
                    register_index: shader_register,
                    visibility: parameter.visibility,
                    offset: self.push_constant_range.size,
                    size: num_32bit_values * 4,
                });
                self.push_constant_range.size += num_32bit_values * 4;
            }
        }

        // One 32-bit word per descriptor table carries the table's heap
        // offset into the bindless arrays at draw time.
        if !device.bindless.flags.is_empty() {
            self.descriptor_table_offset = self.push_constant_range.size;
            for parameter in &desc.parameters {
                if let RootParameterKind::DescriptorTable(_) = parameter.kind {
                    self.descriptor_table_count += 1;
                    self.push_constant_range.size += 4;
                }
            }
        }
    }

    fn init_root_descriptors(
        &mut self,
        device: &Device,
        desc: &RootSignatureDesc,
        info: &RootSignatureInfo,
        context: &mut SetContext,
    ) -> Result<()> {
        let aux_flags = LayoutFlags::INLINE_UNIFORM_BLOCK | LayoutFlags::BINDLESS_UAV_COUNTERS;
        if info.push_descriptor_count == 0 && !self.layout_flags.intersects(aux_flags) {
            return Ok(());
        }

        let mut vk_bindings = Vec::with_capacity(info.push_descriptor_count as usize + 1);

        for (i, parameter) in desc.parameters.iter().enumerate() {
            let range_type = match parameter.kind.root_descriptor_range_type() {
                Some(range_type) => range_type,
                None => continue,
            };
            let (register_space, shader_register) = match parameter.kind {
                RootParameterKind::Cbv {
                    register_space,
                    shader_register,
                }
                | RootParameterKind::Srv {
                    register_space,
                    shader_register,
                }
                | RootParameterKind::Uav {
                    register_space,
                    shader_register,
                } => (register_space, shader_register),
                _ => unreachable!(),
            };

            // Root SRV and UAV parameters are raw buffer views.
            let descriptor_type = match range_type {
                DescriptorRangeType::Cbv => vk::DescriptorType::UNIFORM_BUFFER,
                DescriptorRangeType::Srv => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                DescriptorRangeType::Uav => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
                DescriptorRangeType::Sampler => unreachable!(),
            };

            vk_bindings.push(vk::DescriptorSetLayoutBinding {
                binding: context.vk_binding,
                descriptor_type,
                descriptor_count: 1,
                stage_flags: crate::conv::map_shader_visibility(parameter.visibility),
                p_immutable_samplers: std::ptr::null(),
            });

            let binding = DescriptorBinding {
                set: context.vk_set,
                binding: context.vk_binding,
                count: 1,
            };
            self.bindings.push(ResourceBinding {
                kind: range_type,
                register_space,
                register_index: shader_register,
                register_count: 1,
                descriptor_table: 0,
                descriptor_offset: 0,
                visibility: parameter.visibility,
                flags: BindingFlags::BUFFER,
                binding,
            });
            self.parameters[i] = RootParameterInfo::Descriptor {
                binding,
                packed_descriptor: context.packed_descriptor_index,
            };

            context.packed_descriptor_index += 1;
            context.vk_binding += 1;
        }

        if self.layout_flags.contains(LayoutFlags::BINDLESS_UAV_COUNTERS) {
            vk_bindings.push(vk::DescriptorSetLayoutBinding {
                binding: context.vk_binding,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::ALL,
                p_immutable_samplers: std::ptr::null(),
            });
            self.uav_counter_binding = Some(DescriptorBinding {
                set: context.vk_set,
                binding: context.vk_binding,
                count: 1,
            });
            context.vk_binding += 1;
        }

        if self.layout_flags.contains(LayoutFlags::INLINE_UNIFORM_BLOCK) {
            vk_bindings.push(vk::DescriptorSetLayoutBinding {
                binding: context.vk_binding,
                descriptor_type: vk::DescriptorType::INLINE_UNIFORM_BLOCK_EXT,
                descriptor_count: self.push_constant_range.size,
                stage_flags: vk::ShaderStageFlags::ALL,
                p_immutable_samplers: std::ptr::null(),
            });
            self.push_constant_ubo_binding = Some(DescriptorBinding {
                set: context.vk_set,
                binding: context.vk_binding,
                count: 1,
            });
            context.vk_binding += 1;
        }

        let vk_flags = if self.layout_flags.contains(LayoutFlags::PUSH_DESCRIPTORS) {
            vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR
        } else {
            vk::DescriptorSetLayoutCreateFlags::empty()
        };
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk_flags)
            .bindings(&vk_bindings);
        self.vk_root_descriptor_layout =
            unsafe { device.raw.create_descriptor_set_layout(&layout_info, None) }?;
        Ok(())
    }

    fn init_descriptor_tables(
        &mut self,
        device: &Device,
        desc: &RootSignatureDesc,
        info: &RootSignatureInfo,
        context: &mut SetContext,
    ) -> Result<()> {
        let mut vk_bindings = Vec::with_capacity(info.descriptor_count as usize);
        let mut table_index = 0;

        for (i, parameter) in desc.parameters.iter().enumerate() {
            let ranges = match parameter.kind {
                RootParameterKind::DescriptorTable(ref ranges) => ranges,
                _ => continue,
            };

            let visibility = parameter.visibility;
            let stage_flags = crate::conv::map_shader_visibility(visibility);
            let first_binding = self.bindings.len() as u32;
            let first_packed_descriptor = context.packed_descriptor_index;
            let mut has_packed_descriptors = false;
            let mut range_descriptor_offset = 0;

            for range in ranges {
                let is_uav = range.range_type == DescriptorRangeType::Uav;
                let is_srv = range.range_type == DescriptorRangeType::Srv;

                if range.offset != APPEND_RANGE_OFFSET {
                    range_descriptor_offset = range.offset;
                }

                let mut binding = ResourceBinding {
                    kind: range.range_type,
                    register_space: range.register_space,
                    register_index: range.base_shader_register,
                    register_count: range.num_descriptors,
                    descriptor_table: table_index,
                    descriptor_offset: range_descriptor_offset,
                    visibility,
                    flags: BindingFlags::empty(),
                    binding: DescriptorBinding {
                        set: 0,
                        binding: 0,
                        count: 0,
                    },
                };

                if range_is_bindless(device.bindless.flags, range.range_type) {
                    if let Some(set_binding) = device
                        .bindless
                        .find_binding(range.range_type, BindingFlags::BUFFER)
                    {
                        binding.flags = BindingFlags::BINDLESS | BindingFlags::BUFFER;
                        binding.binding = set_binding;
                        self.bindings.push(binding);
                    }
                    if let Some(set_binding) = device
                        .bindless
                        .find_binding(range.range_type, BindingFlags::IMAGE)
                    {
                        binding.flags = BindingFlags::BINDLESS | BindingFlags::IMAGE;
                        binding.binding = set_binding;
                        self.bindings.push(binding);
                    }
                } else {
                    has_packed_descriptors = true;

                    // Packed descriptors cannot be indexed dynamically, so
                    // the range unrolls into one binding per register.
                    for k in 0..range.num_descriptors {
                        vk_bindings.push(vk::DescriptorSetLayoutBinding {
                            binding: context.vk_binding,
                            descriptor_type: device
                                .bindless
                                .vk_descriptor_type(range.range_type, true),
                            descriptor_count: 1,
                            stage_flags,
                            p_immutable_samplers: std::ptr::null(),
                        });

                        binding.register_index = range.base_shader_register + k;
                        binding.register_count = 1;
                        binding.descriptor_offset = range_descriptor_offset + k;
                        binding.flags = if range.range_type == DescriptorRangeType::Sampler {
                            BindingFlags::IMAGE
                        } else {
                            BindingFlags::BUFFER
                        };
                        binding.binding = DescriptorBinding {
                            set: context.vk_set,
                            binding: context.vk_binding,
                            count: 1,
                        };
                        self.bindings.push(binding);
                        context.vk_binding += 1;

                        if is_srv || is_uav {
                            vk_bindings.push(vk::DescriptorSetLayoutBinding {
                                binding: context.vk_binding,
                                descriptor_type: device
                                    .bindless
                                    .vk_descriptor_type(range.range_type, false),
                                descriptor_count: 1,
                                stage_flags,
                                p_immutable_samplers: std::ptr::null(),
                            });

                            binding.flags = BindingFlags::IMAGE;
                            binding.binding = DescriptorBinding {
                                set: context.vk_set,
                                binding: context.vk_binding,
                                count: 1,
                            };
                            self.bindings.push(binding);
                            context.vk_binding += 1;
                        }
                    }
                }

                if is_uav {
                    if self.layout_flags.contains(LayoutFlags::BINDLESS_UAV_COUNTERS) {
                        let counter_binding = self
                            .uav_counter_binding
                            .ok_or(Error::InvalidArgument("uav counter binding"))?;
                        binding.register_index = range.base_shader_register;
                        binding.register_count = range.num_descriptors;
                        binding.descriptor_offset = range_descriptor_offset;
                        binding.binding = counter_binding;
                        binding.flags = BindingFlags::BINDLESS | BindingFlags::COUNTER;
                        self.bindings.push(binding);
                    } else if range.num_descriptors != UNBOUNDED_RANGE {
                        has_packed_descriptors = true;

                        for k in 0..range.num_descriptors {
                            vk_bindings.push(vk::DescriptorSetLayoutBinding {
                                binding: context.vk_binding,
                                descriptor_type: device
                                    .bindless
                                    .vk_descriptor_type(range.range_type, true),
                                descriptor_count: 1,
                                stage_flags,
                                p_immutable_samplers: std::ptr::null(),
                            });

                            binding.register_index = range.base_shader_register + k;
                            binding.register_count = 1;
                            binding.descriptor_offset = range_descriptor_offset + k;
                            binding.flags = BindingFlags::COUNTER;
                            binding.binding = DescriptorBinding {
                                set: context.vk_set,
                                binding: context.vk_binding,
                                count: 1,
                            };
                            self.bindings.push(binding);
                            context.vk_binding += 1;
                        }
                    } else {
                        warn!("unbounded UAV counter range not supported");
                    }
                }

                range_descriptor_offset = binding.descriptor_offset + binding.register_count;
            }

            let binding_count = self.bindings.len() as u32 - first_binding;
            for binding in &self.bindings[first_binding as usize..] {
                if !binding.flags.contains(BindingFlags::BINDLESS) {
                    context.packed_descriptor_index += binding.register_count;
                }
            }

            self.parameters[i] = RootParameterInfo::DescriptorTable {
                table_index,
                first_binding,
                binding_count,
                first_packed_descriptor,
                has_packed_descriptors,
            };
            table_index += 1;
        }

        if info.descriptor_count != 0 {
            // Packed descriptors may be rewritten while a command list that
            // bound them is in flight; update-after-bind tolerates that.
            let binding_flags =
                vec![vk::DescriptorBindingFlags::UPDATE_AFTER_BIND; vk_bindings.len()];
            let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
                .binding_flags(&binding_flags);

            let use_update_after_bind = !device.bindless.flags.is_empty();
            let mut layout_info =
                vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
            if use_update_after_bind {
                layout_info = layout_info
                    .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                    .push_next(&mut flags_info);
            }
            self.vk_packed_descriptor_layout =
                unsafe { device.raw.create_descriptor_set_layout(&layout_info, None) }?;
        }
        Ok(())
    }

    /// The binding vocabulary shader translation resolves against.
    pub(crate) fn shader_interface<'a>(
        &'a self,
        xfb: Option<&'a TransformFeedbackInfo<'a>>,
    ) -> ShaderInterface<'a> {
        ShaderInterface {
            flags: self.interface_flags,
            bindings: &self.bindings,
            push_constant_buffers: &self.root_constants,
            descriptor_tables: DescriptorTableBuffer {
                offset: self.descriptor_table_offset,
                count: self.descriptor_table_count,
            },
            push_constant_ubo: self.push_constant_ubo_binding,
            xfb,
        }
    }

    pub(crate) fn destroy(&self, device: &Device) {
        unsafe {
            device
                .raw
                .destroy_pipeline_layout(self.vk_pipeline_layout, None);
            device
                .raw
                .destroy_descriptor_set_layout(self.vk_sampler_descriptor_layout, None);
            device
                .raw
                .destroy_descriptor_set_layout(self.vk_root_descriptor_layout, None);
            device
                .raw
                .destroy_descriptor_set_layout(self.vk_packed_descriptor_layout, None);
            for &vk_sampler in &self.static_samplers {
                device.raw.destroy_sampler(vk_sampler, None);
            }
        }
    }
}

#[cfg(test)]
mod root_signature_tests {
    use super::*;

    fn constants(num_32bit_values: u32) -> RootParameter {
        RootParameter {
            kind: RootParameterKind::Constants {
                register_space: 0,
                shader_register: 0,
                num_32bit_values,
            },
            visibility: ShaderVisibility::All,
        }
    }

    fn table(ranges: Vec<DescriptorRange>) -> RootParameter {
        RootParameter {
            kind: RootParameterKind::DescriptorTable(ranges),
            visibility: ShaderVisibility::All,
        }
    }

    fn range(range_type: DescriptorRangeType, num_descriptors: u32) -> DescriptorRange {
        DescriptorRange {
            range_type,
            num_descriptors,
            base_shader_register: 0,
            register_space: 0,
            offset: APPEND_RANGE_OFFSET,
        }
    }

    #[test]
    fn cost_at_the_limit_passes_and_one_more_fails() {
        let mut desc = RootSignatureDesc::default();
        desc.parameters.push(RootParameter {
            kind: RootParameterKind::Cbv {
                register_space: 0,
                shader_register: 0,
            },
            visibility: ShaderVisibility::All,
        });
        desc.parameters.push(table(vec![range(DescriptorRangeType::Srv, 4)]));
        desc.parameters.push(constants(MAX_ROOT_COST - 3));

        let info = RootSignatureInfo::from_desc(&desc, BindlessFlags::empty()).unwrap();
        assert_eq!(info.cost, MAX_ROOT_COST);

        desc.parameters.push(constants(1));
        assert!(matches!(
            RootSignatureInfo::from_desc(&desc, BindlessFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn unbounded_range_requires_bindless_support() {
        let mut desc = RootSignatureDesc::default();
        desc.parameters
            .push(table(vec![range(DescriptorRangeType::Srv, UNBOUNDED_RANGE)]));

        assert!(matches!(
            RootSignatureInfo::from_desc(&desc, BindlessFlags::empty()),
            Err(Error::NotImplemented(_))
        ));

        let info = RootSignatureInfo::from_desc(&desc, BindlessFlags::SRV).unwrap();
        // One buffer binding and one image binding cover the whole range.
        assert_eq!(info.binding_count, 2);
        assert_eq!(info.descriptor_count, 0);
    }

    #[test]
    fn packed_ranges_unroll_per_descriptor() {
        let mut desc = RootSignatureDesc::default();
        desc.parameters.push(table(vec![
            range(DescriptorRangeType::Cbv, 3),
            range(DescriptorRangeType::Srv, 2),
            range(DescriptorRangeType::Uav, 2),
        ]));

        let info = RootSignatureInfo::from_desc(&desc, BindlessFlags::empty()).unwrap();
        // 3 CBVs, 2 SRVs split buffer/image, 2 UAVs split buffer/image plus
        // a packed counter each.
        assert_eq!(info.descriptor_count, 3 + 4 + 4 + 2);
        assert_eq!(info.binding_count, info.descriptor_count);
        assert_eq!(info.cost, 1);
        assert!(!info.has_uav_counters);
    }

    #[test]
    fn bindless_uav_counters_replace_packed_counters() {
        let mut desc = RootSignatureDesc::default();
        desc.parameters
            .push(table(vec![range(DescriptorRangeType::Uav, 8)]));

        let flags = BindlessFlags::UAV | BindlessFlags::UAV_COUNTER;
        let info = RootSignatureInfo::from_desc(&desc, flags).unwrap();
        assert!(info.has_uav_counters);
        // Buffer + image bindless bindings + counter binding; the counter
        // set itself costs one push descriptor slot.
        assert_eq!(info.binding_count, 3);
        assert_eq!(info.descriptor_count, 0);
        assert_eq!(info.push_descriptor_count, 1);
    }

    #[test]
    fn root_descriptors_cost_double_and_tables_cost_one() {
        let mut desc = RootSignatureDesc::default();
        desc.parameters.push(RootParameter {
            kind: RootParameterKind::Srv {
                register_space: 0,
                shader_register: 0,
            },
            visibility: ShaderVisibility::Pixel,
        });
        desc.parameters
            .push(table(vec![range(DescriptorRangeType::Sampler, 2)]));
        desc.parameters.push(constants(5));

        let info = RootSignatureInfo::from_desc(&desc, BindlessFlags::empty()).unwrap();
        assert_eq!(info.cost, 2 + 1 + 5);
        assert_eq!(info.push_descriptor_count, 1);
        assert_eq!(info.root_constant_count, 1);
    }
}
