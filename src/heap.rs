//! Memory heaps backing committed and placed resources.
//!
//! A heap that allows buffers creates one buffer spanning the entire heap at
//! creation time. Placed buffers alias into that buffer at their heap offset
//! instead of owning a `VkBuffer`, which keeps the number of GPU virtual
//! address allocations down. Host-visible heaps are persistently mapped and
//! zeroed on creation.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::memory::{self, DeviceAllocation};
use crate::resource::{self, ResourceFlags};
use crate::{
    Error, GpuVa, Result, DEFAULT_RESOURCE_ALIGNMENT, MSAA_RESOURCE_ALIGNMENT,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapType {
    Default,
    Upload,
    Readback,
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPageProperty {
    Unknown,
    NotAvailable,
    WriteCombine,
    WriteBack,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryPool {
    Unknown,
    L0,
    L1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapProperties {
    pub heap_type: HeapType,
    pub cpu_page_property: CpuPageProperty,
    pub memory_pool: MemoryPool,
}

impl HeapProperties {
    /// Standard properties for a non-custom heap type.
    pub fn new(heap_type: HeapType) -> Self {
        HeapProperties {
            heap_type,
            cpu_page_property: CpuPageProperty::Unknown,
            memory_pool: MemoryPool::Unknown,
        }
    }

    pub fn is_cpu_accessible(&self) -> bool {
        match self.heap_type {
            HeapType::Default => false,
            HeapType::Upload | HeapType::Readback => true,
            HeapType::Custom => matches!(
                self.cpu_page_property,
                CpuPageProperty::WriteCombine | CpuPageProperty::WriteBack
            ),
        }
    }
}

bitflags! {
    pub struct HeapFlags: u32 {
        const SHARED = 0x1;
        const DENY_BUFFERS = 0x4;
        const ALLOW_DISPLAY = 0x8;
        const SHARED_CROSS_ADAPTER = 0x20;
        const DENY_RT_DS_TEXTURES = 0x40;
        const DENY_NON_RT_DS_TEXTURES = 0x80;
        const ALLOW_ONLY_BUFFERS =
            Self::DENY_RT_DS_TEXTURES.bits | Self::DENY_NON_RT_DS_TEXTURES.bits;
        const ALLOW_ONLY_NON_RT_DS_TEXTURES =
            Self::DENY_BUFFERS.bits | Self::DENY_RT_DS_TEXTURES.bits;
        const ALLOW_ONLY_RT_DS_TEXTURES =
            Self::DENY_BUFFERS.bits | Self::DENY_NON_RT_DS_TEXTURES.bits;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapDesc {
    pub size_in_bytes: u64,
    pub properties: HeapProperties,
    /// Zero selects the default 64 KiB placement alignment.
    pub alignment: u64,
    pub flags: HeapFlags,
}

impl HeapDesc {
    pub fn new(size_in_bytes: u64, properties: HeapProperties, flags: HeapFlags) -> Self {
        HeapDesc {
            size_in_bytes,
            properties,
            alignment: 0,
            flags,
        }
    }
}

/// Buffer covering the whole heap, shared by all placed buffers on it.
pub(crate) struct SpanningBuffer {
    pub vk_buffer: vk::Buffer,
    pub va: GpuVa,
}

pub struct Heap {
    desc: HeapDesc,
    pub(crate) allocation: DeviceAllocation,
    pub(crate) map_ptr: *mut u8,
    pub(crate) spanning: Option<SpanningBuffer>,
}

// The mapping pointer is written only through offsets handed out by resource
// mapping and is valid until the heap is destroyed.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

pub(crate) fn validate_heap_desc(desc: &HeapDesc) -> Result<()> {
    if desc.size_in_bytes == 0 {
        warn!("invalid heap size 0");
        return Err(Error::InvalidArgument("heap size"));
    }
    if desc.alignment != DEFAULT_RESOURCE_ALIGNMENT && desc.alignment != MSAA_RESOURCE_ALIGNMENT {
        warn!("invalid heap alignment {:#x}", desc.alignment);
        return Err(Error::InvalidArgument("heap alignment"));
    }
    if desc.flags.contains(HeapFlags::ALLOW_DISPLAY) {
        warn!("ALLOW_DISPLAY is only valid for committed resources");
        return Err(Error::InvalidArgument("heap flags"));
    }
    Ok(())
}

impl Heap {
    pub fn desc(&self) -> &HeapDesc {
        &self.desc
    }

    pub(crate) fn create(device: &Device, desc: &HeapDesc) -> Result<Arc<Heap>> {
        let mut desc = *desc;
        if desc.alignment == 0 {
            desc.alignment = DEFAULT_RESOURCE_ALIGNMENT;
        }
        validate_heap_desc(&desc)?;

        let buffers_allowed = !desc.flags.contains(HeapFlags::DENY_BUFFERS);
        let spanning = if buffers_allowed {
            // Upload and readback heaps do not allow UAV access.
            let resource_flags = match desc.properties.heap_type {
                HeapType::Upload | HeapType::Readback => ResourceFlags::empty(),
                _ => ResourceFlags::ALLOW_UNORDERED_ACCESS,
            };
            let vk_buffer =
                resource::create_vk_buffer(device, Some(&desc.properties), desc.size_in_bytes, resource_flags)?;
            let va = match device.va_allocator.allocate(
                DEFAULT_RESOURCE_ALIGNMENT,
                desc.size_in_bytes,
                vk_buffer,
            ) {
                Ok(va) => va,
                Err(err) => {
                    unsafe { device.raw.destroy_buffer(vk_buffer, None) };
                    return Err(err);
                }
            };
            Some(SpanningBuffer { vk_buffer, va })
        } else {
            None
        };

        let allocation = {
            let result = match &spanning {
                Some(buffer) => memory::allocate_buffer_memory(
                    device,
                    buffer.vk_buffer,
                    &desc.properties,
                    desc.flags,
                ),
                None => {
                    memory::allocate_device_memory(device, &desc.properties, desc.flags, desc.size_in_bytes)
                }
            };
            match result {
                Ok(allocation) => allocation,
                Err(err) => {
                    if let Some(buffer) = spanning {
                        device.va_allocator.free(buffer.va);
                        unsafe { device.raw.destroy_buffer(buffer.vk_buffer, None) };
                    }
                    return Err(err);
                }
            }
        };

        let map_ptr = match memory::map_and_zero(device, &allocation) {
            Ok(map_ptr) => map_ptr,
            Err(err) => {
                error!("failed to map heap memory, {:?}", err);
                unsafe {
                    if let Some(buffer) = spanning {
                        device.va_allocator.free(buffer.va);
                        device.raw.destroy_buffer(buffer.vk_buffer, None);
                    }
                    device.raw.free_memory(allocation.vk_memory, None);
                }
                return Err(err);
            }
        };

        Ok(Arc::new(Heap {
            desc,
            allocation,
            map_ptr,
            spanning,
        }))
    }

    pub(crate) fn destroy(&self, device: &Device) {
        unsafe {
            if !self.map_ptr.is_null() {
                device.raw.unmap_memory(self.allocation.vk_memory);
            }
            if let Some(buffer) = &self.spanning {
                device.va_allocator.free(buffer.va);
                device.raw.destroy_buffer(buffer.vk_buffer, None);
            }
            device.raw.free_memory(self.allocation.vk_memory, None);
        }
    }
}

#[cfg(test)]
mod heap_desc_tests {
    use super::*;

    #[test]
    fn cpu_accessibility() {
        assert!(!HeapProperties::new(HeapType::Default).is_cpu_accessible());
        assert!(HeapProperties::new(HeapType::Upload).is_cpu_accessible());
        assert!(HeapProperties::new(HeapType::Readback).is_cpu_accessible());

        let mut custom = HeapProperties::new(HeapType::Custom);
        assert!(!custom.is_cpu_accessible());
        custom.cpu_page_property = CpuPageProperty::WriteCombine;
        assert!(custom.is_cpu_accessible());
        custom.cpu_page_property = CpuPageProperty::NotAvailable;
        assert!(!custom.is_cpu_accessible());
    }

    #[test]
    fn allow_only_flags_are_deny_combinations() {
        assert_eq!(
            HeapFlags::ALLOW_ONLY_BUFFERS,
            HeapFlags::DENY_RT_DS_TEXTURES | HeapFlags::DENY_NON_RT_DS_TEXTURES
        );
        assert!(HeapFlags::ALLOW_ONLY_RT_DS_TEXTURES.contains(HeapFlags::DENY_BUFFERS));
    }

    #[test]
    fn desc_validation() {
        let mut desc = HeapDesc::new(
            0x10000,
            HeapProperties::new(HeapType::Default),
            HeapFlags::empty(),
        );
        desc.alignment = DEFAULT_RESOURCE_ALIGNMENT;
        assert!(validate_heap_desc(&desc).is_ok());

        desc.alignment = MSAA_RESOURCE_ALIGNMENT;
        assert!(validate_heap_desc(&desc).is_ok());

        desc.alignment = 0x1000;
        assert!(validate_heap_desc(&desc).is_err());

        desc.alignment = DEFAULT_RESOURCE_ALIGNMENT;
        desc.size_in_bytes = 0;
        assert!(validate_heap_desc(&desc).is_err());

        desc.size_in_bytes = 0x10000;
        desc.flags = HeapFlags::ALLOW_DISPLAY;
        assert!(validate_heap_desc(&desc).is_err());
    }
}
