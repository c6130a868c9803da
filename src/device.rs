//! The device hub.
//!
//! `Device` bundles the raw `ash` handles the caller created with everything
//! probed or built once per device: memory capability masks, the GPU virtual
//! address allocator, the bindless descriptor set layouts, the render pass
//! cache and the shared null resources backing null descriptors on devices
//! without robustness support. Every other module receives `&Device`.
//!
//! Creation entry points for heaps, resources, descriptor heaps, root
//! signatures, pipeline states and query heaps live here so command-recording
//! collaborators see one surface; destruction is explicit through the
//! matching `destroy_*` calls since the Vulkan objects must not outlive the
//! device.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::bindless::{bindless_flags_from_features, BindlessState};
use crate::descriptor::{DescriptorHeap, DescriptorHeapDesc};
use crate::heap::{Heap, HeapDesc, HeapFlags, HeapProperties, HeapType};
use crate::memory::{self, DeviceAllocation, GpuVaAllocator, MemoryInfo};
use crate::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, PipelineState, RenderPassCache,
};
use crate::query::{QueryHeap, QueryHeapDesc};
use crate::resource::{Resource, ResourceDesc, ResourceState};
use crate::root_signature::{RootSignature, RootSignatureDesc};
use crate::shader::ShaderCompiler;
use crate::{Error, Result};

/// Size of the null buffer backing null buffer descriptors, in bytes.
pub(crate) const NULL_BUFFER_SIZE: vk::DeviceSize = 64;

/// Texel buffer offset alignment reported by the texel-buffer-alignment
/// extension; tighter than the core limit for single-texel views.
#[derive(Clone, Copy, Debug)]
pub struct TexelBufferAlignment {
    pub storage_alignment: vk::DeviceSize,
    pub uniform_alignment: vk::DeviceSize,
    pub storage_single_texel: bool,
    pub uniform_single_texel: bool,
}

/// Boolean device capabilities the crate keys behavior on. The caller fills
/// these from its feature and extension negotiation; absent capabilities
/// select fallbacks rather than failing device creation.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceCaps {
    /// Unified memory architecture; pool L1 does not exist.
    pub uma: bool,
    pub buffer_device_address: bool,
    /// Robustness null descriptors; without it null views wrap real objects.
    pub null_descriptor: bool,
    pub custom_border_color: bool,
    pub mirror_clamp_to_edge: bool,
    pub sampler_filter_minmax: bool,
    pub sparse_binding: bool,
    pub sparse_residency_3d: bool,
    pub transform_feedback: bool,
    pub transform_feedback_queries: bool,
    pub extended_dynamic_state: bool,
    pub inline_uniform_block: bool,
    pub push_descriptors: bool,
    pub depth_bounds: bool,
    pub logic_op: bool,
    pub vertex_attrib_zero_divisor: bool,
    pub texel_buffer_alignment: Option<TexelBufferAlignment>,
}

/// Numeric device limits consulted at creation time.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceLimits {
    pub min_texel_buffer_offset_alignment: vk::DeviceSize,
    pub max_push_constants_size: u32,
    pub max_push_descriptors: u32,
    pub max_inline_uniform_block_size: u32,
    pub max_vertex_attrib_divisor: u32,
}

/// Everything [`Device::new`] consumes. The instance, physical device,
/// logical device and queue are created and owned by the caller; the crate
/// never destroys them.
pub struct DeviceConfig {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    /// Queue used for sparse metadata binds and the init-time null resource
    /// fill; it must support transfer and sparse binding when those are used.
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub caps: DeviceCaps,
    pub limits: DeviceLimits,
    pub descriptor_indexing_features: vk::PhysicalDeviceDescriptorIndexingFeatures,
    pub descriptor_indexing_properties: vk::PhysicalDeviceDescriptorIndexingProperties,
    pub compiler: Arc<dyn ShaderCompiler>,
}

/// Shared objects backing null descriptors when the device cannot provide
/// them natively. The buffer carries the full usage union so one buffer
/// serves uniform, storage and texel views alike.
pub(crate) struct NullResources {
    pub vk_buffer: vk::Buffer,
    buffer_memory: DeviceAllocation,
    pub vk_2d_image: vk::Image,
    image_memory: DeviceAllocation,
    pub vk_2d_storage_image: vk::Image,
    storage_image_memory: DeviceAllocation,
}

impl NullResources {
    fn none() -> NullResources {
        NullResources {
            vk_buffer: vk::Buffer::null(),
            buffer_memory: DeviceAllocation {
                vk_memory: vk::DeviceMemory::null(),
                size: 0,
                type_index: 0,
            },
            vk_2d_image: vk::Image::null(),
            image_memory: DeviceAllocation {
                vk_memory: vk::DeviceMemory::null(),
                size: 0,
                type_index: 0,
            },
            vk_2d_storage_image: vk::Image::null(),
            storage_image_memory: DeviceAllocation {
                vk_memory: vk::DeviceMemory::null(),
                size: 0,
                type_index: 0,
            },
        }
    }
}

pub struct Device {
    pub(crate) raw: Arc<ash::Device>,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    /// Queue submissions are externally synchronized in Vulkan.
    pub(crate) queue: Mutex<vk::Queue>,
    pub queue_family_index: u32,
    pub caps: DeviceCaps,
    pub limits: DeviceLimits,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) memory_info: MemoryInfo,
    pub(crate) va_allocator: GpuVaAllocator,
    pub(crate) bindless: BindlessState,
    pub(crate) render_pass_cache: RenderPassCache,
    pub(crate) null_resources: NullResources,
    pub(crate) compiler: Arc<dyn ShaderCompiler>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Device> {
        let raw = Arc::new(config.device);

        let memory_properties = unsafe {
            config
                .instance
                .get_physical_device_memory_properties(config.physical_device)
        };
        let memory_info = MemoryInfo::probe(&raw)?;

        let bindless_flags = bindless_flags_from_features(
            &config.descriptor_indexing_features,
            &config.descriptor_indexing_properties,
            config.caps.buffer_device_address,
        );
        let bindless = BindlessState::new(&raw, bindless_flags)?;

        let mut device = Device {
            raw,
            instance: config.instance,
            physical_device: config.physical_device,
            queue: Mutex::new(config.queue),
            queue_family_index: config.queue_family_index,
            caps: config.caps,
            limits: config.limits,
            memory_properties,
            memory_info,
            va_allocator: GpuVaAllocator::new(),
            bindless,
            render_pass_cache: RenderPassCache::new(),
            null_resources: NullResources::none(),
            compiler: config.compiler,
        };

        if !device.caps.null_descriptor {
            match create_null_resources(&device) {
                Ok(null_resources) => device.null_resources = null_resources,
                Err(err) => {
                    device.bindless.cleanup(&device.raw);
                    return Err(err);
                }
            }
        }

        Ok(device)
    }

    /// Clone of the shared logical device handle, for objects that destroy
    /// their Vulkan handles from `Drop` on arbitrary threads.
    pub fn shared(&self) -> Arc<ash::Device> {
        self.raw.clone()
    }

    pub fn create_heap(&self, desc: &HeapDesc) -> Result<Arc<Heap>> {
        Heap::create(self, desc)
    }

    pub fn destroy_heap(&self, heap: &Heap) {
        heap.destroy(self);
    }

    pub fn create_committed_resource(
        &self,
        properties: &HeapProperties,
        heap_flags: HeapFlags,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<Arc<Resource>> {
        Resource::create_committed(self, properties, heap_flags, desc, initial_state)
    }

    pub fn create_placed_resource(
        &self,
        heap: &Arc<Heap>,
        heap_offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<Arc<Resource>> {
        Resource::create_placed(self, heap, heap_offset, desc, initial_state)
    }

    pub fn create_reserved_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<Arc<Resource>> {
        Resource::create_reserved(self, desc, initial_state)
    }

    pub fn destroy_resource(&self, resource: &Resource) {
        resource.destroy(self);
    }

    pub fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<Arc<DescriptorHeap>> {
        DescriptorHeap::new(self, desc)
    }

    pub fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<Arc<RootSignature>> {
        RootSignature::new(self, desc)
    }

    pub fn destroy_root_signature(&self, root_signature: &RootSignature) {
        root_signature.destroy(self);
    }

    pub fn create_graphics_pipeline_state(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<Arc<PipelineState>> {
        PipelineState::new_graphics(self, desc)
    }

    pub fn create_compute_pipeline_state(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<Arc<PipelineState>> {
        PipelineState::new_compute(self, desc)
    }

    pub fn destroy_pipeline_state(&self, state: &PipelineState) {
        state.destroy(self);
    }

    pub fn create_query_heap(&self, desc: &QueryHeapDesc) -> Result<Arc<QueryHeap>> {
        QueryHeap::new(self, desc)
    }

    pub fn destroy_query_heap(&self, heap: &QueryHeap) {
        heap.destroy(self);
    }

    /// Tears down everything the crate created on the device. Heaps,
    /// resources and the other per-object kinds must already be destroyed;
    /// the raw instance and device stay alive for the caller to destroy.
    pub fn destroy(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();

            self.raw
                .destroy_buffer(self.null_resources.vk_buffer, None);
            self.raw
                .free_memory(self.null_resources.buffer_memory.vk_memory, None);
            self.raw.destroy_image(self.null_resources.vk_2d_image, None);
            self.raw
                .free_memory(self.null_resources.image_memory.vk_memory, None);
            self.raw
                .destroy_image(self.null_resources.vk_2d_storage_image, None);
            self.raw
                .free_memory(self.null_resources.storage_image_memory.vk_memory, None);
        }
        self.null_resources = NullResources::none();

        self.render_pass_cache.cleanup(&self.raw);
        self.bindless.cleanup(&self.raw);
    }
}

fn create_null_buffer(device: &Device) -> Result<(vk::Buffer, DeviceAllocation)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(NULL_BUFFER_SIZE)
        .usage(
            vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
        )
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let vk_buffer = unsafe { device.raw.create_buffer(&buffer_info, None) }?;

    match memory::allocate_buffer_memory(
        device,
        vk_buffer,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::ALLOW_ONLY_BUFFERS,
    ) {
        Ok(allocation) => Ok((vk_buffer, allocation)),
        Err(err) => {
            unsafe { device.raw.destroy_buffer(vk_buffer, None) };
            Err(err)
        }
    }
}

fn create_null_image(
    device: &Device,
    usage: vk::ImageUsageFlags,
) -> Result<(vk::Image, DeviceAllocation)> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .extent(vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage | vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let vk_image = unsafe { device.raw.create_image(&image_info, None) }?;

    match memory::allocate_image_memory(
        device,
        vk_image,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::ALLOW_ONLY_NON_RT_DS_TEXTURES,
    ) {
        Ok(allocation) => Ok((vk_image, allocation)),
        Err(err) => {
            unsafe { device.raw.destroy_image(vk_image, None) };
            Err(err)
        }
    }
}

/// Creates and zero-fills the buffer and images null views wrap. The fill is
/// a one-shot submission waited on before creation returns, so a null
/// descriptor read observes zeroes from the very first draw.
fn create_null_resources(device: &Device) -> Result<NullResources> {
    let (vk_buffer, buffer_memory) = create_null_buffer(device)?;

    let destroy_buffer = |device: &Device| unsafe {
        device.raw.destroy_buffer(vk_buffer, None);
        device.raw.free_memory(buffer_memory.vk_memory, None);
    };

    let (vk_2d_image, image_memory) = match create_null_image(device, vk::ImageUsageFlags::SAMPLED)
    {
        Ok(image) => image,
        Err(err) => {
            destroy_buffer(device);
            return Err(err);
        }
    };
    let destroy_image = |device: &Device| unsafe {
        device.raw.destroy_image(vk_2d_image, None);
        device.raw.free_memory(image_memory.vk_memory, None);
    };

    let (vk_2d_storage_image, storage_image_memory) =
        match create_null_image(device, vk::ImageUsageFlags::STORAGE) {
            Ok(image) => image,
            Err(err) => {
                destroy_buffer(device);
                destroy_image(device);
                return Err(err);
            }
        };

    let null_resources = NullResources {
        vk_buffer,
        buffer_memory,
        vk_2d_image,
        image_memory,
        vk_2d_storage_image,
        storage_image_memory,
    };

    if let Err(err) = zero_fill_null_resources(device, &null_resources) {
        destroy_buffer(device);
        destroy_image(device);
        unsafe {
            device.raw.destroy_image(vk_2d_storage_image, None);
            device.raw.free_memory(storage_image_memory.vk_memory, None);
        }
        return Err(err);
    }

    Ok(null_resources)
}

fn zero_fill_null_resources(device: &Device, null_resources: &NullResources) -> Result<()> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::TRANSIENT)
        .queue_family_index(device.queue_family_index);
    let vk_command_pool = unsafe { device.raw.create_command_pool(&pool_info, None) }?;

    let result = (|| -> Result<()> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(vk_command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let vk_command_buffer =
            unsafe { device.raw.allocate_command_buffers(&allocate_info) }?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .raw
                .begin_command_buffer(vk_command_buffer, &begin_info)?;

            device.raw.cmd_fill_buffer(
                vk_command_buffer,
                null_resources.vk_buffer,
                0,
                vk::WHOLE_SIZE,
                0,
            );

            let subresource_range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };
            let to_transfer = |vk_image: vk::Image| vk::ImageMemoryBarrier {
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: vk_image,
                subresource_range,
                ..Default::default()
            };
            device.raw.cmd_pipeline_barrier(
                vk_command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[
                    to_transfer(null_resources.vk_2d_image),
                    to_transfer(null_resources.vk_2d_storage_image),
                ],
            );

            let clear_color = vk::ClearColorValue::default();
            device.raw.cmd_clear_color_image(
                vk_command_buffer,
                null_resources.vk_2d_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color,
                &[subresource_range],
            );
            device.raw.cmd_clear_color_image(
                vk_command_buffer,
                null_resources.vk_2d_storage_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color,
                &[subresource_range],
            );

            let to_final = |vk_image: vk::Image, layout: vk::ImageLayout| vk::ImageMemoryBarrier {
                src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: layout,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: vk_image,
                subresource_range,
                ..Default::default()
            };
            device.raw.cmd_pipeline_barrier(
                vk_command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[
                    to_final(
                        null_resources.vk_2d_image,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    ),
                    to_final(null_resources.vk_2d_storage_image, vk::ImageLayout::GENERAL),
                ],
            );

            device.raw.end_command_buffer(vk_command_buffer)?;

            let command_buffers = [vk_command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            let queue = device.queue.lock();
            device
                .raw
                .queue_submit(*queue, &[submit_info.build()], vk::Fence::null())
                .and_then(|_| device.raw.queue_wait_idle(*queue))
                .map_err(|err| {
                    error!("failed to zero-fill null resources, {:?}", err);
                    Error::from(err)
                })?;
        }
        Ok(())
    })();

    unsafe { device.raw.destroy_command_pool(vk_command_pool, None) };
    result
}
