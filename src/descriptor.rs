//! Descriptor heaps and the concurrent slot write/copy protocol.
//!
//! A descriptor heap is a CPU-addressed array of slots. Shader-visible heaps
//! additionally own one variable-count descriptor set per bindless array
//! that matches the heap type, and every slot write mirrors its content into
//! those sets at the same index, so a slot's heap offset doubles as its
//! bindless array index with no indirection table in between.
//!
//! Applications mutate slots from many threads at once; a slot may legally
//! be destroyed and rewritten on one thread while another thread copies it.
//! Each slot therefore carries its own lock, held only across the content
//! swap and the mirroring descriptor update. Two-slot copies take both locks
//! in slot address order, and displaced views are released only after the
//! locks drop.

use std::mem;
use std::ptr;
use std::sync::Arc;

use arrayvec::ArrayVec;
use ash::vk;
use parking_lot::Mutex;

use crate::bindless::{
    heap_set_index, BindlessFlags, MAX_BINDLESS_CBV_SRV_UAV_COUNT, MAX_BINDLESS_SAMPLER_COUNT,
    MAX_BINDLESS_SETS,
};
use crate::device::{Device, NULL_BUFFER_SIZE};
use crate::heap::{HeapFlags, HeapProperties, HeapType};
use crate::memory::{self, DeviceAllocation, GpuVaAllocator};
use crate::resource::{self, Resource, ResourceFlags};
use crate::root_signature::DescriptorRangeType;
use crate::view::{
    self, DepthStencilView, DsvDesc, RenderTargetView, RtvDesc, SamplerDesc, SrvDesc, UavCounter,
    UavDesc, View, ViewHandle,
};
use crate::{Error, GpuVa, Result, CONSTANT_BUFFER_ALIGNMENT};

/// The four descriptor heap types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorHeapType {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

bitflags! {
    pub struct DescriptorHeapFlags: u32 {
        const SHADER_VISIBLE = 0x1;
    }
}

/// Descriptor heap description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub heap_type: DescriptorHeapType,
    pub descriptor_count: u32,
    pub flags: DescriptorHeapFlags,
}

/// Constant buffer view description. A zero `buffer_location` requests a
/// null view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CbvDesc {
    pub buffer_location: GpuVa,
    pub size_in_bytes: u32,
}

/// What a shader-addressable descriptor slot currently holds.
///
/// Constant buffer views carry their buffer range inline since no Vulkan
/// view object exists for them; everything else holds a shared [`View`].
/// The Vulkan descriptor type is stored alongside because null descriptors
/// of different shapes (buffer vs image) target different bindless sets.
#[derive(Clone, Debug)]
pub(crate) enum DescriptorContent {
    Free,
    Cbv {
        vk_cbv_info: vk::DescriptorBufferInfo,
        vk_descriptor_type: vk::DescriptorType,
    },
    Srv {
        view: Option<Arc<View>>,
        vk_descriptor_type: vk::DescriptorType,
    },
    Uav {
        view: Option<Arc<View>>,
        vk_descriptor_type: vk::DescriptorType,
    },
    Sampler {
        view: Arc<View>,
    },
}

fn view_ptr_eq(a: &Option<Arc<View>>, b: &Option<Arc<View>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl DescriptorContent {
    /// Semantic equality used to skip redundant descriptor updates during
    /// copies: same kind, same view identity, and for constant buffers the
    /// same buffer range.
    fn equals(&self, other: &DescriptorContent) -> bool {
        match (self, other) {
            (DescriptorContent::Free, DescriptorContent::Free) => true,
            (
                DescriptorContent::Cbv {
                    vk_cbv_info: a,
                    vk_descriptor_type: a_type,
                },
                DescriptorContent::Cbv {
                    vk_cbv_info: b,
                    vk_descriptor_type: b_type,
                },
            ) => {
                a_type == b_type
                    && a.buffer == b.buffer
                    && a.offset == b.offset
                    && a.range == b.range
            }
            (
                DescriptorContent::Srv {
                    view: a,
                    vk_descriptor_type: a_type,
                },
                DescriptorContent::Srv {
                    view: b,
                    vk_descriptor_type: b_type,
                },
            ) => a_type == b_type && view_ptr_eq(a, b),
            (
                DescriptorContent::Uav {
                    view: a,
                    vk_descriptor_type: a_type,
                },
                DescriptorContent::Uav {
                    view: b,
                    vk_descriptor_type: b_type,
                },
            ) => a_type == b_type && view_ptr_eq(a, b),
            (DescriptorContent::Sampler { view: a }, DescriptorContent::Sampler { view: b }) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        }
    }

    /// Range type and Vulkan descriptor type of non-free content; these pick
    /// the bindless set the content mirrors into.
    fn binding_info(&self) -> Option<(DescriptorRangeType, vk::DescriptorType)> {
        match self {
            DescriptorContent::Free => None,
            DescriptorContent::Cbv {
                vk_descriptor_type, ..
            } => Some((DescriptorRangeType::Cbv, *vk_descriptor_type)),
            DescriptorContent::Srv {
                vk_descriptor_type, ..
            } => Some((DescriptorRangeType::Srv, *vk_descriptor_type)),
            DescriptorContent::Uav {
                vk_descriptor_type, ..
            } => Some((DescriptorRangeType::Uav, *vk_descriptor_type)),
            DescriptorContent::Sampler { .. } => {
                Some((DescriptorRangeType::Sampler, vk::DescriptorType::SAMPLER))
            }
        }
    }
}

/// One shader-addressable descriptor slot.
pub(crate) struct DescriptorSlot {
    content: Mutex<DescriptorContent>,
}

impl Default for DescriptorSlot {
    fn default() -> Self {
        DescriptorSlot {
            content: Mutex::new(DescriptorContent::Free),
        }
    }
}

fn vk_descriptor_type_is_buffer(vk_descriptor_type: vk::DescriptorType) -> bool {
    vk_descriptor_type == vk::DescriptorType::UNIFORM_TEXEL_BUFFER
        || vk_descriptor_type == vk::DescriptorType::STORAGE_TEXEL_BUFFER
        || vk_descriptor_type == vk::DescriptorType::UNIFORM_BUFFER
        || vk_descriptor_type == vk::DescriptorType::STORAGE_BUFFER
}

/// Replaces a slot's content, mirroring non-free content while the lock is
/// held. The displaced content is released only after the lock drops so that
/// view destruction never runs inside the critical section.
fn write_slot(slot: &DescriptorSlot, content: DescriptorContent, mirror: impl FnOnce(&DescriptorContent)) {
    let mut guard = slot.content.lock();
    let displaced = mem::replace(&mut *guard, content);
    if !matches!(*guard, DescriptorContent::Free) {
        mirror(&guard);
    }
    drop(guard);
    drop(displaced);
}

/// Copies one slot's content into another, mirroring the new content while
/// both locks are held.
///
/// Either slot may be rewritten from other threads mid-copy, so the source
/// view is cloned under both locks, and the locks are taken in slot address
/// order to avoid deadlock against a copy running in the other direction.
/// Redundant copies skip the descriptor update entirely.
fn copy_slot_contents(
    dst: &DescriptorSlot,
    src: &DescriptorSlot,
    mirror: impl FnOnce(&DescriptorContent),
) {
    if ptr::eq(dst, src) {
        return;
    }

    let dst_first = (dst as *const DescriptorSlot) < (src as *const DescriptorSlot);
    let (mut dst_guard, src_guard) = if dst_first {
        let dst_guard = dst.content.lock();
        let src_guard = src.content.lock();
        (dst_guard, src_guard)
    } else {
        let src_guard = src.content.lock();
        let dst_guard = dst.content.lock();
        (dst_guard, src_guard)
    };

    let mut displaced = None;
    if !dst_guard.equals(&src_guard) {
        displaced = Some(mem::replace(&mut *dst_guard, (*src_guard).clone()));
        if !matches!(*dst_guard, DescriptorContent::Free) {
            mirror(&dst_guard);
        }
    }

    drop(src_guard);
    drop(dst_guard);
    drop(displaced);
}

/// Persistently mapped upload buffer holding one raw counter address per
/// heap slot, read by shaders through the push constant path.
struct UavCounterArray {
    vk_buffer: vk::Buffer,
    allocation: DeviceAllocation,
    data: *mut vk::DeviceAddress,
}

// Array elements are only written while the owning slot's lock is held, so
// threads sharing the heap never race on the same element.
unsafe impl Send for UavCounterArray {}
unsafe impl Sync for UavCounterArray {}

enum HeapSlots {
    Shader(Vec<DescriptorSlot>),
    RenderTarget(Vec<Mutex<Option<RenderTargetView>>>),
    DepthStencil(Vec<Mutex<Option<DepthStencilView>>>),
}

/// A CPU-addressed array of descriptors, optionally shader visible.
///
/// CBV/SRV/UAV and sampler heaps hold shader descriptor slots; RTV and DSV
/// heaps hold render target metadata and may not be shader visible. The
/// indices of `vk_descriptor_sets` are heap-local: samplers and CBVs at 0,
/// buffer/image SRVs at 1/2, buffer/image UAVs at 3/4. Missing entries stay
/// null and mirror writes skip them.
pub struct DescriptorHeap {
    device: Arc<ash::Device>,
    desc: DescriptorHeapDesc,
    slots: HeapSlots,
    vk_descriptor_pool: vk::DescriptorPool,
    pub(crate) vk_descriptor_sets: [vk::DescriptorSet; MAX_BINDLESS_SETS],
    uav_counters: Option<UavCounterArray>,
}

fn validate_heap_desc(desc: &DescriptorHeapDesc) -> Result<()> {
    if desc.flags.contains(DescriptorHeapFlags::SHADER_VISIBLE) {
        let max_count = match desc.heap_type {
            DescriptorHeapType::CbvSrvUav => MAX_BINDLESS_CBV_SRV_UAV_COUNT,
            DescriptorHeapType::Sampler => MAX_BINDLESS_SAMPLER_COUNT,
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => {
                warn!("{:?} descriptor heaps cannot be shader visible", desc.heap_type);
                return Err(Error::InvalidArgument("descriptor heap flags"));
            }
        };
        if desc.descriptor_count > max_count {
            warn!(
                "descriptor heap size {} exceeds the bindless array size {}",
                desc.descriptor_count, max_count
            );
            return Err(Error::InvalidArgument("descriptor heap size"));
        }
    }
    Ok(())
}

/// Resolves a constant buffer view description into the buffer range the
/// descriptor will hold. The range is clamped to the end of the allocation
/// backing the GPU address.
fn cbv_buffer_info(
    va_allocator: &GpuVaAllocator,
    null_buffer: vk::Buffer,
    null_descriptor: bool,
    desc: &CbvDesc,
) -> Result<vk::DescriptorBufferInfo> {
    if u64::from(desc.size_in_bytes) & (CONSTANT_BUFFER_ALIGNMENT - 1) != 0 {
        warn!(
            "constant buffer size {} is not {} byte aligned",
            desc.size_in_bytes, CONSTANT_BUFFER_ALIGNMENT
        );
        return Err(Error::InvalidArgument("constant buffer size"));
    }

    if desc.buffer_location == 0 {
        if null_descriptor {
            return Ok(vk::DescriptorBufferInfo {
                buffer: vk::Buffer::null(),
                offset: 0,
                range: 0,
            });
        }
        return Ok(vk::DescriptorBufferInfo {
            buffer: null_buffer,
            offset: 0,
            range: NULL_BUFFER_SIZE,
        });
    }

    let target = match va_allocator.dereference(desc.buffer_location) {
        Some(target) => target,
        None => {
            warn!("failed to dereference GPU address {:#x}", desc.buffer_location);
            return Err(Error::InvalidArgument("constant buffer view address"));
        }
    };
    let offset = desc.buffer_location - target.base;
    Ok(vk::DescriptorBufferInfo {
        buffer: target.vk_buffer,
        offset,
        range: u64::from(desc.size_in_bytes).min(target.size - offset),
    })
}

impl DescriptorHeap {
    pub fn new(device: &Device, desc: &DescriptorHeapDesc) -> Result<Arc<DescriptorHeap>> {
        validate_heap_desc(desc)?;

        let count = desc.descriptor_count as usize;
        let slots = match desc.heap_type {
            DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler => {
                HeapSlots::Shader((0..count).map(|_| DescriptorSlot::default()).collect())
            }
            DescriptorHeapType::Rtv => {
                HeapSlots::RenderTarget((0..count).map(|_| Mutex::new(None)).collect())
            }
            DescriptorHeapType::Dsv => {
                HeapSlots::DepthStencil((0..count).map(|_| Mutex::new(None)).collect())
            }
        };

        let mut heap = DescriptorHeap {
            device: device.raw.clone(),
            desc: *desc,
            slots,
            vk_descriptor_pool: vk::DescriptorPool::null(),
            vk_descriptor_sets: [vk::DescriptorSet::null(); MAX_BINDLESS_SETS],
            uav_counters: None,
        };

        let result = (|| -> Result<()> {
            if heap.desc.flags.contains(DescriptorHeapFlags::SHADER_VISIBLE) {
                heap.create_descriptor_pool(device)?;
                heap.create_descriptor_sets(device)?;
            }
            if heap.desc.heap_type == DescriptorHeapType::CbvSrvUav
                && device.bindless.flags.contains(BindlessFlags::UAV_COUNTER)
            {
                heap.create_uav_counter_array(device)?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            heap.destroy_vk_objects();
            return Err(err);
        }
        Ok(Arc::new(heap))
    }

    pub fn desc(&self) -> &DescriptorHeapDesc {
        &self.desc
    }

    /// One pool size per bindless set matching the heap type, each sized for
    /// the full heap. Heaps without matching sets get no pool at all.
    fn create_descriptor_pool(&mut self, device: &Device) -> Result<()> {
        let mut pool_sizes = ArrayVec::<[vk::DescriptorPoolSize; MAX_BINDLESS_SETS]>::new();
        for set_info in &device.bindless.set_info {
            if set_info.heap_type == self.desc.heap_type {
                pool_sizes.push(vk::DescriptorPoolSize {
                    ty: set_info.vk_descriptor_type,
                    descriptor_count: self.desc.descriptor_count,
                });
            }
        }
        if pool_sizes.is_empty() {
            return Ok(());
        }

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(pool_sizes.len() as u32)
            .pool_sizes(&pool_sizes);
        self.vk_descriptor_pool = unsafe { device.raw.create_descriptor_pool(&pool_info, None) }
            .map_err(|err| {
                warn!("failed to create descriptor pool, {:?}", err);
                Error::from(err)
            })?;
        Ok(())
    }

    fn create_descriptor_sets(&mut self, device: &Device) -> Result<()> {
        for set_info in &device.bindless.set_info {
            if set_info.heap_type != self.desc.heap_type {
                continue;
            }
            let set_index = heap_set_index(
                set_info.range_type,
                vk_descriptor_type_is_buffer(set_info.vk_descriptor_type),
            );

            let descriptor_counts = [self.desc.descriptor_count];
            let mut variable_count_info =
                vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder()
                    .descriptor_counts(&descriptor_counts);
            let set_layouts = [set_info.vk_set_layout];
            let allocate_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(self.vk_descriptor_pool)
                .set_layouts(&set_layouts)
                .push_next(&mut variable_count_info);
            let sets = unsafe { device.raw.allocate_descriptor_sets(&allocate_info) }
                .map_err(|err| {
                    warn!("failed to allocate bindless descriptor set, {:?}", err);
                    Error::from(err)
                })?;
            self.vk_descriptor_sets[set_index] = sets[0];
        }
        Ok(())
    }

    fn create_uav_counter_array(&mut self, device: &Device) -> Result<()> {
        let properties = HeapProperties::new(HeapType::Upload);
        let size = u64::from(self.desc.descriptor_count)
            * mem::size_of::<vk::DeviceAddress>() as u64;
        let vk_buffer = resource::create_vk_buffer(
            device,
            Some(&properties),
            size,
            ResourceFlags::ALLOW_UNORDERED_ACCESS,
        )?;
        let allocation = memory::allocate_buffer_memory(
            device,
            vk_buffer,
            &properties,
            HeapFlags::ALLOW_ONLY_BUFFERS,
        )
        .map_err(|err| {
            unsafe { device.raw.destroy_buffer(vk_buffer, None) };
            err
        })?;
        let data = match memory::map_and_zero(device, &allocation) {
            Ok(data) if !data.is_null() => data as *mut vk::DeviceAddress,
            Ok(_) => {
                unsafe {
                    device.raw.free_memory(allocation.vk_memory, None);
                    device.raw.destroy_buffer(vk_buffer, None);
                }
                warn!("failed to map the UAV counter address buffer");
                return Err(Error::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
            }
            Err(err) => {
                unsafe {
                    device.raw.free_memory(allocation.vk_memory, None);
                    device.raw.destroy_buffer(vk_buffer, None);
                }
                return Err(err);
            }
        };
        self.uav_counters = Some(UavCounterArray {
            vk_buffer,
            allocation,
            data,
        });
        Ok(())
    }

    fn shader_slot(&self, index: u32) -> Result<&DescriptorSlot> {
        let slots = match &self.slots {
            HeapSlots::Shader(slots) => slots,
            _ => return Err(Error::InvalidArgument("descriptor heap type")),
        };
        slots
            .get(index as usize)
            .ok_or(Error::InvalidArgument("descriptor heap index"))
    }

    fn rtv_slot(&self, index: u32) -> Result<&Mutex<Option<RenderTargetView>>> {
        let slots = match &self.slots {
            HeapSlots::RenderTarget(slots) => slots,
            _ => return Err(Error::InvalidArgument("descriptor heap type")),
        };
        slots
            .get(index as usize)
            .ok_or(Error::InvalidArgument("descriptor heap index"))
    }

    fn dsv_slot(&self, index: u32) -> Result<&Mutex<Option<DepthStencilView>>> {
        let slots = match &self.slots {
            HeapSlots::DepthStencil(slots) => slots,
            _ => return Err(Error::InvalidArgument("descriptor heap type")),
        };
        slots
            .get(index as usize)
            .ok_or(Error::InvalidArgument("descriptor heap index"))
    }

    /// Mirrors new slot content into the heap's bindless sets and counter
    /// address array. Called with the owning slot's lock held.
    fn update_bindless_descriptor(&self, index: u32, content: &DescriptorContent) {
        if let Some(counters) = &self.uav_counters {
            if let DescriptorContent::Uav { view, .. } = content {
                let address = match view.as_deref().map(|view| view.counter) {
                    Some(UavCounter::Address(address)) => address,
                    _ => 0,
                };
                unsafe { *counters.data.add(index as usize) = address };
            }
        }

        let (range_type, vk_descriptor_type) = match content.binding_info() {
            Some(info) => info,
            None => return,
        };
        let set_index = heap_set_index(range_type, vk_descriptor_type_is_buffer(vk_descriptor_type));
        let vk_descriptor_set = self.vk_descriptor_sets[set_index];
        if vk_descriptor_set == vk::DescriptorSet::null() {
            return;
        }

        // All three info kinds are attached to the single write; the driver
        // reads only the one matching the descriptor type.
        let mut image_infos = [vk::DescriptorImageInfo::default()];
        let mut buffer_infos = [vk::DescriptorBufferInfo::default()];
        let mut texel_views = [vk::BufferView::null()];
        match content {
            DescriptorContent::Free => return,
            DescriptorContent::Cbv { vk_cbv_info, .. } => buffer_infos[0] = *vk_cbv_info,
            DescriptorContent::Srv { view, .. } | DescriptorContent::Uav { view, .. } => {
                if let Some(view) = view.as_deref() {
                    match view.handle {
                        ViewHandle::Buffer(vk_view) => texel_views[0] = vk_view,
                        ViewHandle::Image(vk_view) => {
                            image_infos[0] = vk::DescriptorImageInfo {
                                sampler: vk::Sampler::null(),
                                image_view: vk_view,
                                image_layout: view.vk_layout(),
                            };
                        }
                        ViewHandle::Sampler(_) => {}
                    }
                }
            }
            DescriptorContent::Sampler { view } => {
                image_infos[0] = vk::DescriptorImageInfo {
                    sampler: view.vk_sampler().unwrap_or_else(vk::Sampler::null),
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                };
            }
        }

        let vk_write = vk::WriteDescriptorSet::builder()
            .dst_set(vk_descriptor_set)
            .dst_binding(0)
            .dst_array_element(index)
            .descriptor_type(vk_descriptor_type)
            .image_info(&image_infos)
            .buffer_info(&buffer_infos)
            .texel_buffer_view(&texel_views);

        unsafe {
            self.device.update_descriptor_sets(&[vk_write.build()], &[]);
        }
    }

    pub(crate) fn write(&self, index: u32, content: DescriptorContent) -> Result<()> {
        let slot = self.shader_slot(index)?;
        write_slot(slot, content, |content| {
            self.update_bindless_descriptor(index, content)
        });
        Ok(())
    }

    pub fn create_cbv(&self, device: &Device, index: u32, desc: Option<&CbvDesc>) -> Result<()> {
        self.require_heap_type(DescriptorHeapType::CbvSrvUav)?;
        let desc = match desc {
            Some(desc) => desc,
            None => {
                warn!("constant buffer view desc is required");
                return Err(Error::InvalidArgument("constant buffer view desc"));
            }
        };
        let vk_cbv_info = cbv_buffer_info(
            &device.va_allocator,
            device.null_resources.vk_buffer,
            device.caps.null_descriptor,
            desc,
        )?;
        self.write(
            index,
            DescriptorContent::Cbv {
                vk_cbv_info,
                vk_descriptor_type: device.bindless.cbv_descriptor_type(),
            },
        )
    }

    pub fn create_srv(
        &self,
        device: &Device,
        index: u32,
        resource: Option<&Resource>,
        desc: Option<&SrvDesc>,
    ) -> Result<()> {
        self.require_heap_type(DescriptorHeapType::CbvSrvUav)?;
        let (view, vk_descriptor_type) = view::create_srv(device, resource, desc)?;
        self.write(
            index,
            DescriptorContent::Srv {
                view,
                vk_descriptor_type,
            },
        )
    }

    pub fn create_uav(
        &self,
        device: &Device,
        index: u32,
        resource: Option<&Resource>,
        counter_resource: Option<&Resource>,
        desc: Option<&UavDesc>,
    ) -> Result<()> {
        self.require_heap_type(DescriptorHeapType::CbvSrvUav)?;
        let (view, vk_descriptor_type) = view::create_uav(device, resource, counter_resource, desc)?;
        self.write(
            index,
            DescriptorContent::Uav {
                view,
                vk_descriptor_type,
            },
        )
    }

    pub fn create_sampler(&self, device: &Device, index: u32, desc: &SamplerDesc) -> Result<()> {
        self.require_heap_type(DescriptorHeapType::Sampler)?;
        let view = view::create_sampler(device, desc)?;
        self.write(index, DescriptorContent::Sampler { view })
    }

    /// Builds a render target view into the slot; passing no resource clears
    /// the slot instead.
    pub fn create_rtv(
        &self,
        device: &Device,
        index: u32,
        resource: Option<&Arc<Resource>>,
        desc: Option<&RtvDesc>,
    ) -> Result<()> {
        let slot = self.rtv_slot(index)?;
        let rtv = match resource {
            Some(resource) => Some(view::create_rtv(device, resource, desc)?),
            None => None,
        };
        let displaced = mem::replace(&mut *slot.lock(), rtv);
        drop(displaced);
        Ok(())
    }

    /// Builds a depth stencil view into the slot; passing no resource clears
    /// the slot instead.
    pub fn create_dsv(
        &self,
        device: &Device,
        index: u32,
        resource: Option<&Arc<Resource>>,
        desc: Option<&DsvDesc>,
    ) -> Result<()> {
        let slot = self.dsv_slot(index)?;
        let dsv = match resource {
            Some(resource) => Some(view::create_dsv(device, resource, desc)?),
            None => None,
        };
        let displaced = mem::replace(&mut *slot.lock(), dsv);
        drop(displaced);
        Ok(())
    }

    pub fn rtv(&self, index: u32) -> Option<RenderTargetView> {
        match &self.slots {
            HeapSlots::RenderTarget(slots) => (*slots.get(index as usize)?.lock()).clone(),
            _ => None,
        }
    }

    pub fn dsv(&self, index: u32) -> Option<DepthStencilView> {
        match &self.slots {
            HeapSlots::DepthStencil(slots) => (*slots.get(index as usize)?.lock()).clone(),
            _ => None,
        }
    }

    fn require_heap_type(&self, heap_type: DescriptorHeapType) -> Result<()> {
        if self.desc.heap_type != heap_type {
            warn!(
                "{:?} descriptor heaps do not hold this descriptor kind",
                self.desc.heap_type
            );
            return Err(Error::InvalidArgument("descriptor heap type"));
        }
        Ok(())
    }

    /// Copies a single descriptor between two heaps of the same type.
    pub fn copy_descriptor(
        dst: &DescriptorHeap,
        dst_index: u32,
        src: &DescriptorHeap,
        src_index: u32,
    ) -> Result<()> {
        if dst.desc.heap_type != src.desc.heap_type {
            warn!(
                "cannot copy descriptors from a {:?} heap to a {:?} heap",
                src.desc.heap_type, dst.desc.heap_type
            );
            return Err(Error::InvalidArgument("descriptor heap type"));
        }

        match dst.desc.heap_type {
            DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler => {
                let dst_slot = dst.shader_slot(dst_index)?;
                let src_slot = src.shader_slot(src_index)?;
                copy_slot_contents(dst_slot, src_slot, |content| {
                    dst.update_bindless_descriptor(dst_index, content)
                });
            }
            DescriptorHeapType::Rtv => {
                let dst_slot = dst.rtv_slot(dst_index)?;
                let src_slot = src.rtv_slot(src_index)?;
                if !ptr::eq(dst_slot, src_slot) {
                    let copied = (*src_slot.lock()).clone();
                    let displaced = mem::replace(&mut *dst_slot.lock(), copied);
                    drop(displaced);
                }
            }
            DescriptorHeapType::Dsv => {
                let dst_slot = dst.dsv_slot(dst_index)?;
                let src_slot = src.dsv_slot(src_index)?;
                if !ptr::eq(dst_slot, src_slot) {
                    let copied = (*src_slot.lock()).clone();
                    let displaced = mem::replace(&mut *dst_slot.lock(), copied);
                    drop(displaced);
                }
            }
        }
        Ok(())
    }

    /// Copies a contiguous descriptor range between two heaps.
    pub fn copy_descriptors(
        dst: &DescriptorHeap,
        dst_start: u32,
        src: &DescriptorHeap,
        src_start: u32,
        count: u32,
    ) -> Result<()> {
        if dst_start.checked_add(count).is_none() || src_start.checked_add(count).is_none() {
            return Err(Error::InvalidArgument("descriptor range"));
        }
        for i in 0..count {
            DescriptorHeap::copy_descriptor(dst, dst_start + i, src, src_start + i)?;
        }
        Ok(())
    }

    fn destroy_vk_objects(&mut self) {
        if let Some(counters) = self.uav_counters.take() {
            unsafe {
                self.device.free_memory(counters.allocation.vk_memory, None);
                self.device.destroy_buffer(counters.vk_buffer, None);
            }
        }
        if self.vk_descriptor_pool != vk::DescriptorPool::null() {
            unsafe {
                self.device
                    .destroy_descriptor_pool(self.vk_descriptor_pool, None)
            };
            self.vk_descriptor_pool = vk::DescriptorPool::null();
        }
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        self.destroy_vk_objects();
    }
}

#[cfg(test)]
mod content_tests {
    use super::*;

    fn cbv_content(offset: vk::DeviceSize) -> DescriptorContent {
        DescriptorContent::Cbv {
            vk_cbv_info: vk::DescriptorBufferInfo {
                buffer: vk::Buffer::null(),
                offset,
                range: 256,
            },
            vk_descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        }
    }

    #[test]
    fn equality_is_semantic() {
        assert!(DescriptorContent::Free.equals(&DescriptorContent::Free));
        assert!(cbv_content(0x100).equals(&cbv_content(0x100)));
        assert!(!cbv_content(0x100).equals(&cbv_content(0x200)));
        assert!(!cbv_content(0x100).equals(&DescriptorContent::Free));
    }

    #[test]
    fn null_views_of_different_shapes_are_distinct() {
        let buffer_srv = DescriptorContent::Srv {
            view: None,
            vk_descriptor_type: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        };
        let image_srv = DescriptorContent::Srv {
            view: None,
            vk_descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
        };
        assert!(buffer_srv.equals(&buffer_srv.clone()));
        // They mirror into different bindless sets, so a copy between them
        // must not be skipped as redundant.
        assert!(!buffer_srv.equals(&image_srv));
        assert!(!buffer_srv.equals(&DescriptorContent::Uav {
            view: None,
            vk_descriptor_type: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        }));
    }

    #[test]
    fn buffer_descriptor_types() {
        assert!(vk_descriptor_type_is_buffer(
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER
        ));
        assert!(vk_descriptor_type_is_buffer(
            vk::DescriptorType::STORAGE_TEXEL_BUFFER
        ));
        assert!(vk_descriptor_type_is_buffer(
            vk::DescriptorType::UNIFORM_BUFFER
        ));
        assert!(vk_descriptor_type_is_buffer(
            vk::DescriptorType::STORAGE_BUFFER
        ));
        assert!(!vk_descriptor_type_is_buffer(
            vk::DescriptorType::SAMPLED_IMAGE
        ));
        assert!(!vk_descriptor_type_is_buffer(vk::DescriptorType::SAMPLER));
    }
}

#[cfg(test)]
mod protocol_tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn cbv_content(offset: vk::DeviceSize) -> DescriptorContent {
        DescriptorContent::Cbv {
            vk_cbv_info: vk::DescriptorBufferInfo {
                buffer: vk::Buffer::null(),
                offset,
                range: 256,
            },
            vk_descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        }
    }

    fn cbv_offset(content: &DescriptorContent) -> Option<vk::DeviceSize> {
        match content {
            DescriptorContent::Cbv { vk_cbv_info, .. } => Some(vk_cbv_info.offset),
            _ => None,
        }
    }

    #[test]
    fn write_mirrors_new_content_and_skips_free() {
        let slot = DescriptorSlot::default();
        let mut seen = Vec::new();
        write_slot(&slot, cbv_content(0x500), |content| {
            seen.push(cbv_offset(content));
        });
        write_slot(&slot, DescriptorContent::Free, |content| {
            seen.push(cbv_offset(content));
        });
        assert_eq!(seen, [Some(0x500)]);
        assert!(matches!(*slot.content.lock(), DescriptorContent::Free));
    }

    #[test]
    fn redundant_copies_skip_the_mirror_write() {
        let src = DescriptorSlot::default();
        let dst = DescriptorSlot::default();
        *src.content.lock() = cbv_content(0x300);

        let mut mirrored = 0;
        copy_slot_contents(&dst, &src, |_| mirrored += 1);
        assert_eq!(mirrored, 1);
        assert_eq!(cbv_offset(&dst.content.lock()), Some(0x300));

        copy_slot_contents(&dst, &src, |_| mirrored += 1);
        assert_eq!(mirrored, 1);
    }

    #[test]
    fn copying_a_free_slot_clears_without_a_mirror_write() {
        let src = DescriptorSlot::default();
        let dst = DescriptorSlot::default();
        *dst.content.lock() = cbv_content(0x100);

        let mut mirrored = 0;
        copy_slot_contents(&dst, &src, |_| mirrored += 1);
        assert_eq!(mirrored, 0);
        assert!(matches!(*dst.content.lock(), DescriptorContent::Free));
    }

    #[test]
    fn self_copy_is_a_no_op() {
        let slot = DescriptorSlot::default();
        *slot.content.lock() = cbv_content(0x40);
        // A reentrant lock attempt would deadlock here.
        copy_slot_contents(&slot, &slot, |_| panic!("self copy must not mirror"));
        assert_eq!(cbv_offset(&slot.content.lock()), Some(0x40));
    }

    #[test]
    fn opposing_copies_do_not_deadlock() {
        let slots = Arc::new([DescriptorSlot::default(), DescriptorSlot::default()]);
        *slots[0].content.lock() = cbv_content(0x1000);
        *slots[1].content.lock() = cbv_content(0x2000);

        let forward = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                for _ in 0..2000 {
                    copy_slot_contents(&slots[0], &slots[1], |_| {});
                }
            })
        };
        let backward = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                for _ in 0..2000 {
                    copy_slot_contents(&slots[1], &slots[0], |_| {});
                }
            })
        };
        forward.join().unwrap();
        backward.join().unwrap();

        let first = cbv_offset(&slots[0].content.lock());
        let second = cbv_offset(&slots[1].content.lock());
        assert_eq!(first, second);
    }

    #[test]
    fn concurrent_writes_and_copies_never_tear() {
        let slots = Arc::new([DescriptorSlot::default(), DescriptorSlot::default()]);

        let writer = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                for i in 1..=1000u64 {
                    write_slot(&slots[0], cbv_content(i * 256), |_| {});
                }
            })
        };
        let copier = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                for _ in 0..1000 {
                    copy_slot_contents(&slots[1], &slots[0], |_| {});
                }
            })
        };
        writer.join().unwrap();
        copier.join().unwrap();

        assert_eq!(cbv_offset(&slots[0].content.lock()), Some(1000 * 256));
        match &*slots[1].content.lock() {
            DescriptorContent::Free => {}
            DescriptorContent::Cbv { vk_cbv_info, .. } => {
                assert_eq!(vk_cbv_info.offset % 256, 0);
                assert!(vk_cbv_info.offset <= 1000 * 256);
            }
            other => panic!("unexpected content {:?}", other),
        };
    }
}

#[cfg(test)]
mod heap_desc_tests {
    use super::*;

    #[test]
    fn render_target_heaps_cannot_be_shader_visible() {
        for heap_type in [DescriptorHeapType::Rtv, DescriptorHeapType::Dsv].iter() {
            let desc = DescriptorHeapDesc {
                heap_type: *heap_type,
                descriptor_count: 64,
                flags: DescriptorHeapFlags::SHADER_VISIBLE,
            };
            assert_eq!(
                validate_heap_desc(&desc),
                Err(Error::InvalidArgument("descriptor heap flags"))
            );
        }
    }

    #[test]
    fn shader_visible_heaps_are_bounded_by_the_bindless_array_size() {
        let sampler = |count| DescriptorHeapDesc {
            heap_type: DescriptorHeapType::Sampler,
            descriptor_count: count,
            flags: DescriptorHeapFlags::SHADER_VISIBLE,
        };
        assert_eq!(validate_heap_desc(&sampler(MAX_BINDLESS_SAMPLER_COUNT)), Ok(()));
        assert_eq!(
            validate_heap_desc(&sampler(MAX_BINDLESS_SAMPLER_COUNT + 1)),
            Err(Error::InvalidArgument("descriptor heap size"))
        );

        let shader = |count| DescriptorHeapDesc {
            heap_type: DescriptorHeapType::CbvSrvUav,
            descriptor_count: count,
            flags: DescriptorHeapFlags::SHADER_VISIBLE,
        };
        assert_eq!(
            validate_heap_desc(&shader(MAX_BINDLESS_CBV_SRV_UAV_COUNT)),
            Ok(())
        );
        assert_eq!(
            validate_heap_desc(&shader(MAX_BINDLESS_CBV_SRV_UAV_COUNT + 1)),
            Err(Error::InvalidArgument("descriptor heap size"))
        );
    }

    #[test]
    fn cpu_only_heaps_are_not_size_limited() {
        let desc = DescriptorHeapDesc {
            heap_type: DescriptorHeapType::CbvSrvUav,
            descriptor_count: MAX_BINDLESS_CBV_SRV_UAV_COUNT + 1,
            flags: DescriptorHeapFlags::empty(),
        };
        assert_eq!(validate_heap_desc(&desc), Ok(()));
    }
}

#[cfg(test)]
mod cbv_tests {
    use super::*;

    #[test]
    fn unaligned_sizes_are_rejected() {
        let allocator = GpuVaAllocator::new();
        let desc = CbvDesc {
            buffer_location: 0,
            size_in_bytes: 100,
        };
        assert_eq!(
            cbv_buffer_info(&allocator, vk::Buffer::null(), false, &desc).err(),
            Some(Error::InvalidArgument("constant buffer size"))
        );
    }

    #[test]
    fn null_address_with_null_descriptor_support_yields_an_empty_range() {
        let allocator = GpuVaAllocator::new();
        let desc = CbvDesc {
            buffer_location: 0,
            size_in_bytes: 512,
        };
        let info = cbv_buffer_info(&allocator, vk::Buffer::null(), true, &desc).unwrap();
        assert_eq!(info.buffer, vk::Buffer::null());
        assert_eq!(info.offset, 0);
        assert_eq!(info.range, 0);
    }

    #[test]
    fn null_address_falls_back_to_the_null_buffer() {
        let allocator = GpuVaAllocator::new();
        let desc = CbvDesc {
            buffer_location: 0,
            size_in_bytes: 512,
        };
        let info = cbv_buffer_info(&allocator, vk::Buffer::null(), false, &desc).unwrap();
        assert_eq!(info.offset, 0);
        assert_eq!(info.range, NULL_BUFFER_SIZE);
    }

    #[test]
    fn view_range_is_clamped_to_the_allocation() {
        let allocator = GpuVaAllocator::new();
        let base = allocator.allocate(256, 0x10000, vk::Buffer::null()).unwrap();

        let inside = CbvDesc {
            buffer_location: base + 0x100,
            size_in_bytes: 0x200,
        };
        let info = cbv_buffer_info(&allocator, vk::Buffer::null(), false, &inside).unwrap();
        assert_eq!(info.offset, 0x100);
        assert_eq!(info.range, 0x200);

        let clamped = CbvDesc {
            buffer_location: base + 0x100,
            size_in_bytes: 0x10000,
        };
        let info = cbv_buffer_info(&allocator, vk::Buffer::null(), false, &clamped).unwrap();
        assert_eq!(info.range, 0x10000 - 0x100);
    }

    #[test]
    fn unmapped_addresses_are_rejected() {
        let allocator = GpuVaAllocator::new();
        let base = allocator.allocate(256, 0x1000, vk::Buffer::null()).unwrap();
        allocator.free(base);

        let desc = CbvDesc {
            buffer_location: base,
            size_in_bytes: 256,
        };
        assert_eq!(
            cbv_buffer_info(&allocator, vk::Buffer::null(), false, &desc).err(),
            Some(Error::InvalidArgument("constant buffer view address"))
        );
    }
}
