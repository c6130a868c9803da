//! Device memory selection and allocation, and the GPU virtual address space.
//!
//! Memory types are chosen by intersecting the capability masks probed at
//! device creation with the heap's deny flags, then filtering by the property
//! flags implied by the heap type. Allocation retries without `DEVICE_LOCAL`
//! when a device-local request cannot be satisfied.

use ash::vk;

use crate::device::Device;
use crate::heap::{CpuPageProperty, HeapFlags, HeapProperties, HeapType, MemoryPool};
use crate::{align, Error, GpuVa, Result};

/// Memory type masks describing which memory types can back which resource
/// categories, probed once at device creation with dummy objects.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MemoryInfo {
    pub buffer_type_mask: u32,
    pub sampled_type_mask: u32,
    pub rt_ds_type_mask: u32,
}

impl MemoryInfo {
    pub(crate) fn probe(raw: &ash::Device) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(0x10000)
            .usage(
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                    | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer_type_mask = unsafe {
            let buffer = raw.create_buffer(&buffer_info, None)?;
            let requirements = raw.get_buffer_memory_requirements(buffer);
            raw.destroy_buffer(buffer, None);
            requirements.memory_type_bits
        };

        let mut image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::STORAGE,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build();

        let probe_image = |info: &vk::ImageCreateInfo| -> Result<u32> {
            unsafe {
                let image = raw.create_image(info, None)?;
                let requirements = raw.get_image_memory_requirements(image);
                raw.destroy_image(image, None);
                Ok(requirements.memory_type_bits)
            }
        };

        let sampled_type_mask = probe_image(&image_info)?;

        image_info.usage = vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::STORAGE;
        let mut rt_ds_type_mask = probe_image(&image_info)?;

        image_info.format = vk::Format::D32_SFLOAT_S8_UINT;
        image_info.usage = vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED;
        rt_ds_type_mask &= probe_image(&image_info)?;

        trace!("buffers supported on memory types {:#x}", buffer_type_mask);
        trace!("textures supported on memory types {:#x}", sampled_type_mask);
        trace!(
            "render targets supported on memory types {:#x}",
            rt_ds_type_mask
        );

        Ok(MemoryInfo {
            buffer_type_mask,
            sampled_type_mask,
            rt_ds_type_mask,
        })
    }
}

/// Intersects the probed capability masks with the heap's deny flags.
///
/// Render target capability is never required for `Upload` and `Readback`
/// heaps since those heap types cannot hold attachment textures.
pub(crate) fn select_memory_types(
    info: &MemoryInfo,
    memory_type_count: u32,
    properties: &HeapProperties,
    flags: HeapFlags,
) -> u32 {
    let mut type_mask = (1u32 << memory_type_count) - 1;

    if !flags.contains(HeapFlags::DENY_BUFFERS) {
        type_mask &= info.buffer_type_mask;
    }
    if !flags.contains(HeapFlags::DENY_NON_RT_DS_TEXTURES) {
        type_mask &= info.sampled_type_mask;
    }
    if !flags.contains(HeapFlags::DENY_RT_DS_TEXTURES)
        && properties.heap_type != HeapType::Upload
        && properties.heap_type != HeapType::Readback
    {
        type_mask &= info.rt_ds_type_mask;
    }

    if type_mask == 0 {
        error!("no memory type found for heap flags {:?}", flags);
    }
    type_mask
}

/// Maps a heap type to the Vulkan memory property flags it requires.
pub(crate) fn select_memory_property_flags(
    properties: &HeapProperties,
    uma: bool,
) -> Result<vk::MemoryPropertyFlags> {
    match properties.heap_type {
        HeapType::Default => Ok(vk::MemoryPropertyFlags::DEVICE_LOCAL),
        HeapType::Upload => {
            Ok(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT)
        }
        HeapType::Readback => {
            Ok(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED)
        }
        HeapType::Custom => {
            if properties.memory_pool == MemoryPool::Unknown
                || (properties.memory_pool == MemoryPool::L1
                    && (properties.is_cpu_accessible() || uma))
            {
                warn!("invalid memory pool preference {:?}", properties.memory_pool);
                return Err(Error::InvalidArgument("memory pool preference"));
            }
            match properties.cpu_page_property {
                CpuPageProperty::WriteBack => Ok(vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_CACHED),
                CpuPageProperty::WriteCombine => Ok(vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT),
                CpuPageProperty::NotAvailable => Ok(vk::MemoryPropertyFlags::DEVICE_LOCAL),
                CpuPageProperty::Unknown => {
                    warn!("invalid CPU page property");
                    Err(Error::InvalidArgument("CPU page property"))
                }
            }
        }
    }
}

/// A single `VkDeviceMemory` allocation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DeviceAllocation {
    pub vk_memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub type_index: u32,
}

fn try_allocate_memory(
    device: &Device,
    mut allocate_info: vk::MemoryAllocateInfo,
    type_flags: vk::MemoryPropertyFlags,
    type_mask: u32,
) -> Result<DeviceAllocation> {
    let count = device.memory_properties.memory_type_count as usize;
    for (index, memory_type) in device.memory_properties.memory_types[..count]
        .iter()
        .enumerate()
    {
        if type_mask & (1u32 << index) == 0 {
            continue;
        }
        if !memory_type.property_flags.contains(type_flags) {
            continue;
        }

        allocate_info.memory_type_index = index as u32;
        if let Ok(vk_memory) = unsafe { device.raw.allocate_memory(&allocate_info, None) } {
            return Ok(DeviceAllocation {
                vk_memory,
                size: allocate_info.allocation_size,
                type_index: index as u32,
            });
        }
    }
    Err(Error::OutOfDeviceMemory)
}

pub(crate) fn allocate_memory(
    device: &Device,
    allocate_info: vk::MemoryAllocateInfo,
    type_flags: vk::MemoryPropertyFlags,
    type_mask: u32,
) -> Result<DeviceAllocation> {
    match try_allocate_memory(device, allocate_info, type_flags, type_mask) {
        Err(_) if type_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) => {
            warn!("device memory allocation failed, falling back to system memory");
            try_allocate_memory(
                device,
                allocate_info,
                type_flags & !vk::MemoryPropertyFlags::DEVICE_LOCAL,
                type_mask,
            )
        }
        result => result,
    }
}

/// Allocates raw heap memory without any resource to derive requirements from.
pub(crate) fn allocate_device_memory(
    device: &Device,
    properties: &HeapProperties,
    flags: HeapFlags,
    size: vk::DeviceSize,
) -> Result<DeviceAllocation> {
    let type_flags = select_memory_property_flags(properties, device.caps.uma)?;
    let type_mask = select_memory_types(
        &device.memory_info,
        device.memory_properties.memory_type_count,
        properties,
        flags,
    );

    let mut allocate_flags = vk::MemoryAllocateFlags::empty();
    if !flags.contains(HeapFlags::DENY_BUFFERS) && device.caps.buffer_device_address {
        allocate_flags |= vk::MemoryAllocateFlags::DEVICE_ADDRESS;
    }
    let mut flags_info = vk::MemoryAllocateFlagsInfo::builder()
        .flags(allocate_flags)
        .build();

    let allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .push_next(&mut flags_info)
        .build();

    allocate_memory(device, allocate_info, type_flags, type_mask)
}

/// Allocates and binds memory for `vk_buffer` based on its requirements.
///
/// Internal buffer allocations pass `HeapFlags::ALLOW_ONLY_BUFFERS` exactly,
/// which skips the capability mask filter and enables dedicated allocations
/// when the driver prefers them.
pub(crate) fn allocate_buffer_memory(
    device: &Device,
    vk_buffer: vk::Buffer,
    properties: &HeapProperties,
    flags: HeapFlags,
) -> Result<DeviceAllocation> {
    let info = vk::BufferMemoryRequirementsInfo2::builder()
        .buffer(vk_buffer)
        .build();
    let mut dedicated_requirements = vk::MemoryDedicatedRequirements::default();
    let mut requirements2 = vk::MemoryRequirements2::builder()
        .push_next(&mut dedicated_requirements)
        .build();
    unsafe {
        device
            .raw
            .get_buffer_memory_requirements2(&info, &mut requirements2)
    };
    let requirements = requirements2.memory_requirements;

    let mut type_mask = requirements.memory_type_bits;
    if flags != HeapFlags::ALLOW_ONLY_BUFFERS {
        type_mask &= select_memory_types(
            &device.memory_info,
            device.memory_properties.memory_type_count,
            properties,
            flags,
        );
    }
    let type_flags = select_memory_property_flags(properties, device.caps.uma)?;

    let mut allocate_flags = vk::MemoryAllocateFlags::empty();
    if device.caps.buffer_device_address {
        allocate_flags |= vk::MemoryAllocateFlags::DEVICE_ADDRESS;
    }
    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder()
        .buffer(vk_buffer)
        .build();
    let mut flags_info = vk::MemoryAllocateFlagsInfo::builder()
        .flags(allocate_flags)
        .build();

    let mut builder = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .push_next(&mut flags_info);
    if flags == HeapFlags::ALLOW_ONLY_BUFFERS && dedicated_requirements.prefers_dedicated_allocation != 0
    {
        builder = builder.push_next(&mut dedicated_info);
    }
    let allocate_info = builder.build();

    let allocation = allocate_memory(device, allocate_info, type_flags, type_mask)?;

    if let Err(err) = unsafe { device.raw.bind_buffer_memory(vk_buffer, allocation.vk_memory, 0) } {
        warn!("failed to bind buffer memory, {:?}", err);
        unsafe { device.raw.free_memory(allocation.vk_memory, None) };
        return Err(err.into());
    }
    Ok(allocation)
}

/// Allocates and binds memory for `vk_image` based on its requirements.
pub(crate) fn allocate_image_memory(
    device: &Device,
    vk_image: vk::Image,
    properties: &HeapProperties,
    flags: HeapFlags,
) -> Result<DeviceAllocation> {
    let info = vk::ImageMemoryRequirementsInfo2::builder().image(vk_image).build();
    let mut dedicated_requirements = vk::MemoryDedicatedRequirements::default();
    let mut requirements2 = vk::MemoryRequirements2::builder()
        .push_next(&mut dedicated_requirements)
        .build();
    unsafe {
        device
            .raw
            .get_image_memory_requirements2(&info, &mut requirements2)
    };
    let requirements = requirements2.memory_requirements;

    let mut type_mask = requirements.memory_type_bits;
    type_mask &= select_memory_types(
        &device.memory_info,
        device.memory_properties.memory_type_count,
        properties,
        flags,
    );
    let type_flags = select_memory_property_flags(properties, device.caps.uma)?;

    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(vk_image).build();
    let mut builder = vk::MemoryAllocateInfo::builder().allocation_size(requirements.size);
    if dedicated_requirements.prefers_dedicated_allocation != 0 {
        builder = builder.push_next(&mut dedicated_info);
    }
    let allocate_info = builder.build();

    let allocation = allocate_memory(device, allocate_info, type_flags, type_mask)?;

    if let Err(err) = unsafe { device.raw.bind_image_memory(vk_image, allocation.vk_memory, 0) } {
        warn!("failed to bind image memory, {:?}", err);
        unsafe { device.raw.free_memory(allocation.vk_memory, None) };
        return Err(err.into());
    }
    Ok(allocation)
}

/// Maps host-visible memory persistently and zeroes it, flushing when the
/// memory type is not coherent. Returns a null pointer for device-local
/// allocations.
pub(crate) fn map_and_zero(device: &Device, allocation: &DeviceAllocation) -> Result<*mut u8> {
    let property_flags =
        device.memory_properties.memory_types[allocation.type_index as usize].property_flags;
    if !property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        return Ok(std::ptr::null_mut());
    }

    let map_ptr = unsafe {
        device.raw.map_memory(
            allocation.vk_memory,
            0,
            vk::WHOLE_SIZE,
            vk::MemoryMapFlags::empty(),
        )? as *mut u8
    };
    unsafe { std::ptr::write_bytes(map_ptr, 0, allocation.size as usize) };

    if !property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
        let range = vk::MappedMemoryRange::builder()
            .memory(allocation.vk_memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { device.raw.flush_mapped_memory_ranges(&[range])? };
    }
    Ok(map_ptr)
}

pub(crate) fn is_host_coherent(device: &Device, allocation: &DeviceAllocation) -> bool {
    device.memory_properties.memory_types[allocation.type_index as usize]
        .property_flags
        .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
}

pub(crate) const VA_SLAB_BASE: GpuVa = 0x0000_0010_0000_0000;
pub(crate) const VA_SLAB_SIZE_SHIFT: u32 = 32;
pub(crate) const VA_SLAB_SIZE: u64 = 1 << VA_SLAB_SIZE_SHIFT;
pub(crate) const VA_SLAB_COUNT: usize = 64 * 1024;
pub(crate) const VA_FALLBACK_BASE: GpuVa = 0x8000_0000_0000_0000;

/// The buffer an address range resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct VaTarget {
    pub vk_buffer: vk::Buffer,
    pub base: GpuVa,
    pub size: u64,
}

#[derive(Clone, Copy)]
struct VaSlab {
    size: u64,
    vk_buffer: vk::Buffer,
}

struct FallbackAllocation {
    base: GpuVa,
    size: u64,
    vk_buffer: vk::Buffer,
}

struct GpuVaAllocatorInner {
    free_slabs: Vec<u32>,
    slabs: Vec<VaSlab>,
    fallback_floor: GpuVa,
    fallback_allocations: Vec<FallbackAllocation>,
}

impl GpuVaAllocatorInner {
    fn find_fallback(&self, address: GpuVa) -> std::result::Result<usize, usize> {
        self.fallback_allocations.binary_search_by(|allocation| {
            use std::cmp::Ordering;
            if allocation.base + allocation.size <= address {
                Ordering::Less
            } else if allocation.base > address {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        })
    }
}

/// Process-wide GPU virtual address space.
///
/// Allocations of up to 4 GiB come from a fixed array of address slabs so
/// that lookup is a shift and an index. Larger allocations fall back to a
/// monotonic bump region above `VA_FALLBACK_BASE` with a sorted lookup table.
/// Addresses are purely software constructs used to identify buffer ranges.
pub(crate) struct GpuVaAllocator {
    inner: parking_lot::RwLock<GpuVaAllocatorInner>,
}

impl GpuVaAllocator {
    pub(crate) fn new() -> Self {
        let mut free_slabs = Vec::with_capacity(VA_SLAB_COUNT);
        free_slabs.extend((0..VA_SLAB_COUNT as u32).rev());
        GpuVaAllocator {
            inner: parking_lot::RwLock::new(GpuVaAllocatorInner {
                free_slabs,
                slabs: vec![
                    VaSlab {
                        size: 0,
                        vk_buffer: vk::Buffer::null(),
                    };
                    VA_SLAB_COUNT
                ],
                fallback_floor: VA_FALLBACK_BASE,
                fallback_allocations: Vec::new(),
            }),
        }
    }

    pub(crate) fn allocate(
        &self,
        alignment: u64,
        size: u64,
        vk_buffer: vk::Buffer,
    ) -> Result<GpuVa> {
        debug_assert!(alignment.is_power_of_two());
        if size == 0 {
            return Err(Error::InvalidArgument("GPU VA allocation size"));
        }

        let mut inner = self.inner.write();

        if size <= VA_SLAB_SIZE {
            if let Some(index) = inner.free_slabs.pop() {
                inner.slabs[index as usize] = VaSlab { size, vk_buffer };
                return Ok(VA_SLAB_BASE + u64::from(index) * VA_SLAB_SIZE);
            }
        }

        let base = align(inner.fallback_floor, alignment);
        let end = base
            .checked_add(size)
            .ok_or(Error::OutOfDeviceMemory)?;
        inner.fallback_floor = end;
        inner.fallback_allocations.push(FallbackAllocation {
            base,
            size,
            vk_buffer,
        });
        Ok(base)
    }

    /// Resolves an address to the buffer allocation containing it.
    ///
    /// Slab lookups take the shared lock only briefly; the fallback region
    /// needs a search of the sorted allocation list.
    pub(crate) fn dereference(&self, address: GpuVa) -> Option<VaTarget> {
        let inner = self.inner.read();

        if address < VA_FALLBACK_BASE {
            let base_offset = address.checked_sub(VA_SLAB_BASE)?;
            let index = (base_offset >> VA_SLAB_SIZE_SHIFT) as usize;
            if index >= VA_SLAB_COUNT {
                return None;
            }
            let slab = &inner.slabs[index];
            if base_offset & (VA_SLAB_SIZE - 1) >= slab.size {
                return None;
            }
            return Some(VaTarget {
                vk_buffer: slab.vk_buffer,
                base: VA_SLAB_BASE + index as u64 * VA_SLAB_SIZE,
                size: slab.size,
            });
        }

        inner
            .find_fallback(address)
            .ok()
            .map(|index| {
                let allocation = &inner.fallback_allocations[index];
                VaTarget {
                    vk_buffer: allocation.vk_buffer,
                    base: allocation.base,
                    size: allocation.size,
                }
            })
    }

    pub(crate) fn free(&self, address: GpuVa) {
        let mut inner = self.inner.write();

        if address < VA_FALLBACK_BASE {
            let base_offset = match address.checked_sub(VA_SLAB_BASE) {
                Some(offset) => offset,
                None => {
                    error!("invalid slab address {:#x}", address);
                    return;
                }
            };
            let index = (base_offset >> VA_SLAB_SIZE_SHIFT) as usize;
            if index >= VA_SLAB_COUNT {
                error!("invalid slab address {:#x}", address);
                return;
            }
            debug_assert_eq!(base_offset & (VA_SLAB_SIZE - 1), 0);
            inner.slabs[index] = VaSlab {
                size: 0,
                vk_buffer: vk::Buffer::null(),
            };
            inner.free_slabs.push(index as u32);
            return;
        }

        match inner.find_fallback(address) {
            Ok(index) => {
                inner.fallback_allocations.remove(index);
            }
            Err(_) => error!("failed to find fallback allocation {:#x}", address),
        }
    }
}

#[cfg(test)]
mod memory_type_tests {
    use super::*;

    fn custom_properties(page: CpuPageProperty, pool: MemoryPool) -> HeapProperties {
        HeapProperties {
            heap_type: HeapType::Custom,
            cpu_page_property: page,
            memory_pool: pool,
        }
    }

    #[test]
    fn property_flags_per_heap_type() {
        let flags =
            select_memory_property_flags(&HeapProperties::new(HeapType::Default), false).unwrap();
        assert_eq!(flags, vk::MemoryPropertyFlags::DEVICE_LOCAL);

        let flags =
            select_memory_property_flags(&HeapProperties::new(HeapType::Upload), false).unwrap();
        assert_eq!(
            flags,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        );

        let flags =
            select_memory_property_flags(&HeapProperties::new(HeapType::Readback), false).unwrap();
        assert_eq!(
            flags,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
        );
    }

    #[test]
    fn custom_heap_validation() {
        let properties = custom_properties(CpuPageProperty::WriteBack, MemoryPool::Unknown);
        assert!(select_memory_property_flags(&properties, false).is_err());

        let properties = custom_properties(CpuPageProperty::Unknown, MemoryPool::L0);
        assert!(select_memory_property_flags(&properties, false).is_err());

        // CPU-accessible pages cannot live in L1.
        let properties = custom_properties(CpuPageProperty::WriteBack, MemoryPool::L1);
        assert!(select_memory_property_flags(&properties, false).is_err());

        // L1 does not exist on UMA architectures.
        let properties = custom_properties(CpuPageProperty::NotAvailable, MemoryPool::L1);
        assert!(select_memory_property_flags(&properties, true).is_err());
        assert_eq!(
            select_memory_property_flags(&properties, false).unwrap(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        );

        let properties = custom_properties(CpuPageProperty::WriteCombine, MemoryPool::L0);
        assert_eq!(
            select_memory_property_flags(&properties, false).unwrap(),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        );
    }

    #[test]
    fn type_mask_respects_deny_flags() {
        let info = MemoryInfo {
            buffer_type_mask: 0b0111,
            sampled_type_mask: 0b1011,
            rt_ds_type_mask: 0b1101,
        };
        let default_heap = HeapProperties::new(HeapType::Default);
        let upload_heap = HeapProperties::new(HeapType::Upload);

        assert_eq!(
            select_memory_types(&info, 4, &default_heap, HeapFlags::empty()),
            0b0001
        );
        assert_eq!(
            select_memory_types(&info, 4, &default_heap, HeapFlags::ALLOW_ONLY_BUFFERS),
            0b0111
        );
        assert_eq!(
            select_memory_types(&info, 4, &default_heap, HeapFlags::DENY_BUFFERS),
            0b1001
        );
        // Upload heaps never need render target capability.
        assert_eq!(
            select_memory_types(&info, 4, &upload_heap, HeapFlags::empty()),
            0b0011
        );
    }
}

#[cfg(test)]
mod gpu_va_tests {
    use super::*;

    #[test]
    fn slab_allocation_and_dereference() {
        let allocator = GpuVaAllocator::new();
        let address = allocator
            .allocate(0x10000, 0x10000, vk::Buffer::null())
            .unwrap();
        assert_eq!(address, VA_SLAB_BASE);

        let target = allocator.dereference(address + 0x8000).unwrap();
        assert_eq!(target.base, address);
        assert_eq!(target.size, 0x10000);

        assert!(allocator.dereference(address + 0x10000).is_none());
        assert!(allocator.dereference(0x1234).is_none());
    }

    #[test]
    fn slab_reuse_after_free() {
        let allocator = GpuVaAllocator::new();
        let first = allocator.allocate(0x10000, 0x100, vk::Buffer::null()).unwrap();
        allocator.free(first);
        assert!(allocator.dereference(first).is_none());

        let second = allocator.allocate(0x10000, 0x100, vk::Buffer::null()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_slab_addresses() {
        let allocator = GpuVaAllocator::new();
        let first = allocator.allocate(0x10000, 0x100, vk::Buffer::null()).unwrap();
        let second = allocator.allocate(0x10000, 0x100, vk::Buffer::null()).unwrap();
        assert_eq!(second - first, VA_SLAB_SIZE);
    }

    #[test]
    fn oversized_allocations_use_fallback_region() {
        let allocator = GpuVaAllocator::new();
        let size = VA_SLAB_SIZE + 1;
        let address = allocator
            .allocate(0x40_0000, size, vk::Buffer::null())
            .unwrap();
        assert!(address >= VA_FALLBACK_BASE);
        assert_eq!(address % 0x40_0000, 0);

        let target = allocator.dereference(address + size - 1).unwrap();
        assert_eq!(target.base, address);
        assert_eq!(target.size, size);

        allocator.free(address);
        assert!(allocator.dereference(address).is_none());
    }

    #[test]
    fn fallback_allocations_do_not_overlap() {
        let allocator = GpuVaAllocator::new();
        let size = VA_SLAB_SIZE + 0x10000;
        let first = allocator.allocate(0x10000, size, vk::Buffer::null()).unwrap();
        let second = allocator.allocate(0x10000, size, vk::Buffer::null()).unwrap();
        assert!(second >= first + size);

        assert_eq!(allocator.dereference(first).unwrap().base, first);
        assert_eq!(allocator.dereference(second).unwrap().base, second);
    }

    #[test]
    fn zero_sized_allocation_is_rejected() {
        let allocator = GpuVaAllocator::new();
        assert!(allocator.allocate(0x10000, 0, vk::Buffer::null()).is_err());
    }
}
