//! Bindless descriptor set layouts.
//!
//! When the device supports update-after-bind descriptor indexing, each
//! descriptor range type is backed by one huge variable-count descriptor
//! array per shader-visible heap, and a slot's heap offset doubles as its
//! index into that array. Range types toggle independently: a device may
//! index SRVs bindlessly while CBVs stay packed into per-root-signature
//! sets. CBVs additionally prefer storage buffers over uniform buffers,
//! which keeps them indexable on drivers with small uniform-buffer
//! update-after-bind limits.

use std::ptr;

use arrayvec::ArrayVec;
use ash::vk;

use crate::descriptor::DescriptorHeapType;
use crate::root_signature::DescriptorRangeType;
use crate::shader::{BindingFlags, DescriptorBinding};
use crate::Result;

/// One set per range type, plus separate buffer/image sets for SRV and UAV.
pub(crate) const MAX_BINDLESS_SETS: usize = 6;

bitflags! {
    /// Which descriptor range types the device can serve bindlessly.
    pub struct BindlessFlags: u32 {
        const SAMPLER = 0x1;
        const CBV = 0x2;
        const SRV = 0x4;
        const UAV = 0x8;
        /// UAV counters travel as raw device addresses in a per-heap array.
        const UAV_COUNTER = 0x10;
        /// CBVs bind as storage buffers instead of uniform buffers.
        const CBV_AS_SSBO = 0x20;
    }
}

/// Decides the bindless capability set from the device's descriptor
/// indexing features. A range type goes bindless only when its whole
/// update-after-bind and non-uniform-indexing feature group is present and
/// the per-stage update-after-bind limit fits a full descriptor heap.
pub(crate) fn bindless_flags_from_features(
    features: &vk::PhysicalDeviceDescriptorIndexingFeatures,
    properties: &vk::PhysicalDeviceDescriptorIndexingProperties,
    buffer_device_address: bool,
) -> BindlessFlags {
    let mut flags = BindlessFlags::empty();

    if features.runtime_descriptor_array == vk::FALSE
        || features.descriptor_binding_partially_bound == vk::FALSE
        || features.descriptor_binding_update_unused_while_pending == vk::FALSE
        || features.descriptor_binding_variable_descriptor_count == vk::FALSE
    {
        return flags;
    }

    if properties.max_per_stage_descriptor_update_after_bind_sampled_images
        >= MAX_BINDLESS_CBV_SRV_UAV_COUNT
        && features.descriptor_binding_sampled_image_update_after_bind != vk::FALSE
        && features.descriptor_binding_uniform_texel_buffer_update_after_bind != vk::FALSE
        && features.shader_sampled_image_array_non_uniform_indexing != vk::FALSE
        && features.shader_uniform_texel_buffer_array_non_uniform_indexing != vk::FALSE
    {
        flags |= BindlessFlags::SAMPLER | BindlessFlags::SRV;
    }

    if properties.max_per_stage_descriptor_update_after_bind_storage_images
        >= MAX_BINDLESS_CBV_SRV_UAV_COUNT
        && features.descriptor_binding_storage_image_update_after_bind != vk::FALSE
        && features.descriptor_binding_storage_texel_buffer_update_after_bind != vk::FALSE
        && features.shader_storage_image_array_non_uniform_indexing != vk::FALSE
        && features.shader_storage_texel_buffer_array_non_uniform_indexing != vk::FALSE
    {
        flags |= BindlessFlags::UAV;
    }

    if properties.max_per_stage_descriptor_update_after_bind_storage_buffers
        >= MAX_BINDLESS_CBV_SRV_UAV_COUNT
        && features.descriptor_binding_storage_buffer_update_after_bind != vk::FALSE
        && features.shader_storage_buffer_array_non_uniform_indexing != vk::FALSE
    {
        flags |= BindlessFlags::CBV | BindlessFlags::CBV_AS_SSBO;
    }

    if buffer_device_address && flags.contains(BindlessFlags::UAV) {
        flags |= BindlessFlags::UAV_COUNTER;
    }

    flags
}

pub(crate) const MAX_BINDLESS_CBV_SRV_UAV_COUNT: u32 = 1_000_000;
pub(crate) const MAX_BINDLESS_SAMPLER_COUNT: u32 = 2048;

pub(crate) fn max_bindless_descriptor_count(range_type: DescriptorRangeType) -> u32 {
    match range_type {
        DescriptorRangeType::Cbv | DescriptorRangeType::Srv | DescriptorRangeType::Uav => {
            MAX_BINDLESS_CBV_SRV_UAV_COUNT
        }
        DescriptorRangeType::Sampler => MAX_BINDLESS_SAMPLER_COUNT,
    }
}

fn heap_type_from_range_type(range_type: DescriptorRangeType) -> DescriptorHeapType {
    match range_type {
        DescriptorRangeType::Cbv | DescriptorRangeType::Srv | DescriptorRangeType::Uav => {
            DescriptorHeapType::CbvSrvUav
        }
        DescriptorRangeType::Sampler => DescriptorHeapType::Sampler,
    }
}

/// Index of a range type's descriptor set within a shader-visible heap.
/// CBV, SRV buffer/image and UAV buffer/image share the `CbvSrvUav` heap;
/// the sampler heap holds a single set.
pub(crate) fn heap_set_index(range_type: DescriptorRangeType, is_buffer: bool) -> usize {
    match range_type {
        DescriptorRangeType::Sampler => 0,
        DescriptorRangeType::Cbv => 0,
        DescriptorRangeType::Srv => 1 + usize::from(!is_buffer),
        DescriptorRangeType::Uav => 3 + usize::from(!is_buffer),
    }
}

/// One bindless descriptor set layout shared by every shader-visible heap.
pub struct BindlessSetInfo {
    pub vk_descriptor_type: vk::DescriptorType,
    pub heap_type: DescriptorHeapType,
    pub range_type: DescriptorRangeType,
    pub binding_flag: BindingFlags,
    pub vk_set_layout: vk::DescriptorSetLayout,
}

pub struct BindlessState {
    pub flags: BindlessFlags,
    pub set_info: ArrayVec<[BindlessSetInfo; MAX_BINDLESS_SETS]>,
}

impl BindlessState {
    pub(crate) fn new(device: &ash::Device, flags: BindlessFlags) -> Result<BindlessState> {
        let mut state = BindlessState {
            flags,
            set_info: ArrayVec::new(),
        };

        // Creation order fixes the pipeline layout set numbering shared by
        // every root signature on the device.
        let result = (|| -> Result<()> {
            if flags.contains(BindlessFlags::SAMPLER) {
                state.add_binding(device, DescriptorRangeType::Sampler, BindingFlags::IMAGE)?;
            }
            if flags.contains(BindlessFlags::CBV) {
                state.add_binding(device, DescriptorRangeType::Cbv, BindingFlags::BUFFER)?;
            }
            if flags.contains(BindlessFlags::SRV) {
                state.add_binding(device, DescriptorRangeType::Srv, BindingFlags::BUFFER)?;
                state.add_binding(device, DescriptorRangeType::Srv, BindingFlags::IMAGE)?;
            }
            if flags.contains(BindlessFlags::UAV) {
                state.add_binding(device, DescriptorRangeType::Uav, BindingFlags::BUFFER)?;
                state.add_binding(device, DescriptorRangeType::Uav, BindingFlags::IMAGE)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            state.cleanup(device);
            return Err(err);
        }
        Ok(state)
    }

    fn add_binding(
        &mut self,
        device: &ash::Device,
        range_type: DescriptorRangeType,
        binding_flag: BindingFlags,
    ) -> Result<()> {
        let is_buffer = binding_flag.contains(BindingFlags::BUFFER);
        let vk_descriptor_type = self.vk_descriptor_type(range_type, is_buffer);

        let binding_flags = [vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

        let bindings = [vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk_descriptor_type,
            descriptor_count: max_bindless_descriptor_count(range_type),
            stage_flags: vk::ShaderStageFlags::ALL,
            p_immutable_samplers: ptr::null(),
        }];

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let vk_set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;
        self.set_info.push(BindlessSetInfo {
            vk_descriptor_type,
            heap_type: heap_type_from_range_type(range_type),
            range_type,
            binding_flag,
            vk_set_layout,
        });
        Ok(())
    }

    /// The descriptor type CBVs bind as on this device.
    pub fn cbv_descriptor_type(&self) -> vk::DescriptorType {
        if self.flags.contains(BindlessFlags::CBV_AS_SSBO) {
            vk::DescriptorType::STORAGE_BUFFER
        } else {
            vk::DescriptorType::UNIFORM_BUFFER
        }
    }

    pub(crate) fn vk_descriptor_type(
        &self,
        range_type: DescriptorRangeType,
        is_buffer: bool,
    ) -> vk::DescriptorType {
        match range_type {
            DescriptorRangeType::Srv => {
                if is_buffer {
                    vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                } else {
                    vk::DescriptorType::SAMPLED_IMAGE
                }
            }
            DescriptorRangeType::Uav => {
                if is_buffer {
                    vk::DescriptorType::STORAGE_TEXEL_BUFFER
                } else {
                    vk::DescriptorType::STORAGE_IMAGE
                }
            }
            DescriptorRangeType::Cbv => self.cbv_descriptor_type(),
            DescriptorRangeType::Sampler => vk::DescriptorType::SAMPLER,
        }
    }

    /// Whether a range type can be served bindlessly on this device.
    pub(crate) fn supports_range_type(&self, range_type: DescriptorRangeType) -> bool {
        let flag = match range_type {
            DescriptorRangeType::Sampler => BindlessFlags::SAMPLER,
            DescriptorRangeType::Cbv => BindlessFlags::CBV,
            DescriptorRangeType::Srv => BindlessFlags::SRV,
            DescriptorRangeType::Uav => BindlessFlags::UAV,
        };
        self.flags.contains(flag)
    }

    /// Resolves a range access to its set in the shared pipeline layout
    /// numbering. The set layouts are created in a fixed order, so the
    /// position in `set_info` is the set index.
    pub(crate) fn find_binding(
        &self,
        range_type: DescriptorRangeType,
        binding_flag: BindingFlags,
    ) -> Option<DescriptorBinding> {
        self.set_info
            .iter()
            .position(|info| info.range_type == range_type && info.binding_flag == binding_flag)
            .map(|set| DescriptorBinding {
                set: set as u32,
                binding: 0,
                count: max_bindless_descriptor_count(range_type),
            })
    }

    pub(crate) fn cleanup(&mut self, device: &ash::Device) {
        for info in self.set_info.drain(..) {
            unsafe { device.destroy_descriptor_set_layout(info.vk_set_layout, None) };
        }
    }
}

#[cfg(test)]
mod bindless_tests {
    use super::*;

    fn full_features() -> vk::PhysicalDeviceDescriptorIndexingFeatures {
        vk::PhysicalDeviceDescriptorIndexingFeatures {
            runtime_descriptor_array: vk::TRUE,
            descriptor_binding_partially_bound: vk::TRUE,
            descriptor_binding_update_unused_while_pending: vk::TRUE,
            descriptor_binding_variable_descriptor_count: vk::TRUE,
            descriptor_binding_sampled_image_update_after_bind: vk::TRUE,
            descriptor_binding_uniform_texel_buffer_update_after_bind: vk::TRUE,
            shader_sampled_image_array_non_uniform_indexing: vk::TRUE,
            shader_uniform_texel_buffer_array_non_uniform_indexing: vk::TRUE,
            descriptor_binding_storage_image_update_after_bind: vk::TRUE,
            descriptor_binding_storage_texel_buffer_update_after_bind: vk::TRUE,
            shader_storage_image_array_non_uniform_indexing: vk::TRUE,
            shader_storage_texel_buffer_array_non_uniform_indexing: vk::TRUE,
            descriptor_binding_storage_buffer_update_after_bind: vk::TRUE,
            shader_storage_buffer_array_non_uniform_indexing: vk::TRUE,
            ..Default::default()
        }
    }

    fn full_properties() -> vk::PhysicalDeviceDescriptorIndexingProperties {
        vk::PhysicalDeviceDescriptorIndexingProperties {
            max_per_stage_descriptor_update_after_bind_sampled_images: 1 << 20,
            max_per_stage_descriptor_update_after_bind_storage_images: 1 << 20,
            max_per_stage_descriptor_update_after_bind_storage_buffers: 1 << 20,
            ..Default::default()
        }
    }

    #[test]
    fn full_feature_set_enables_everything() {
        let flags = bindless_flags_from_features(&full_features(), &full_properties(), true);
        assert_eq!(
            flags,
            BindlessFlags::SAMPLER
                | BindlessFlags::CBV
                | BindlessFlags::CBV_AS_SSBO
                | BindlessFlags::SRV
                | BindlessFlags::UAV
                | BindlessFlags::UAV_COUNTER
        );
    }

    #[test]
    fn missing_runtime_arrays_disable_bindless_entirely() {
        let features = vk::PhysicalDeviceDescriptorIndexingFeatures {
            runtime_descriptor_array: vk::FALSE,
            ..full_features()
        };
        let flags = bindless_flags_from_features(&features, &full_properties(), true);
        assert!(flags.is_empty());
    }

    #[test]
    fn small_update_after_bind_limits_keep_a_range_type_packed() {
        let properties = vk::PhysicalDeviceDescriptorIndexingProperties {
            max_per_stage_descriptor_update_after_bind_storage_images: 500_000,
            ..full_properties()
        };
        let flags = bindless_flags_from_features(&full_features(), &properties, true);
        assert!(flags.contains(BindlessFlags::SRV));
        assert!(!flags.contains(BindlessFlags::UAV));
        // Counters ride on bindless UAV support.
        assert!(!flags.contains(BindlessFlags::UAV_COUNTER));
    }

    #[test]
    fn counters_require_buffer_device_address() {
        let flags = bindless_flags_from_features(&full_features(), &full_properties(), false);
        assert!(flags.contains(BindlessFlags::UAV));
        assert!(!flags.contains(BindlessFlags::UAV_COUNTER));
    }

    #[test]
    fn heap_set_indices_pack_buffer_before_image() {
        assert_eq!(heap_set_index(DescriptorRangeType::Sampler, false), 0);
        assert_eq!(heap_set_index(DescriptorRangeType::Cbv, true), 0);
        assert_eq!(heap_set_index(DescriptorRangeType::Srv, true), 1);
        assert_eq!(heap_set_index(DescriptorRangeType::Srv, false), 2);
        assert_eq!(heap_set_index(DescriptorRangeType::Uav, true), 3);
        assert_eq!(heap_set_index(DescriptorRangeType::Uav, false), 4);
    }
}
