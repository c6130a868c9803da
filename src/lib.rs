//! Resource binding and pipeline state core of a D3D12-style translation
//! layer on Vulkan.
//!
//! The crate owns the hard middle of such a layer: heap and resource
//! lifecycle (committed, placed, reserved/sparse, imported), typed views and
//! samplers, CPU descriptor heaps with a concurrent write/copy protocol and a
//! bindless mirror, root signature compilation into a concrete Vulkan binding
//! plan, and graphics/compute pipeline compilation with lazily built variants
//! for state that is only known at draw time.
//!
//! Command recording, submission, presentation and the shader translator are
//! external collaborators. The shader translator is reached through the
//! [`shader::ShaderCompiler`] trait; everything else arrives as plain `ash`
//! handles owned by the caller.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

use ash::vk;

pub mod bindless;
pub mod conv;
pub mod descriptor;
pub mod device;
pub mod format;
pub mod heap;
pub mod memory;
pub mod pipeline;
pub mod query;
pub mod resource;
pub mod root_signature;
pub mod shader;
pub mod view;

pub use self::descriptor::{
    CbvDesc, DescriptorHeap, DescriptorHeapDesc, DescriptorHeapFlags, DescriptorHeapType,
};
pub use self::device::{Device, DeviceCaps, DeviceConfig, DeviceLimits};
pub use self::format::Format;
pub use self::heap::{Heap, HeapDesc, HeapFlags, HeapProperties, HeapType};
pub use self::pipeline::{DynamicState, PipelineState};
pub use self::resource::{
    Resource, ResourceDesc, ResourceDimension, ResourceFlags, ResourceState, SampleDesc,
    TextureLayout,
};
pub use self::root_signature::{RootSignature, RootSignatureDesc};
pub use self::view::{
    AddressMode, BufferRange, BufferViewFlags, ComponentMapping, ComponentSwizzle,
    DepthStencilView, DsvDesc, DsvDimension, DsvFlags, Filter, FilterReduction, FilterType,
    RenderTargetView, RtvDesc, RtvDimension, SamplerDesc, SrvDesc, SrvDimension,
    StaticBorderColor, UavDesc, UavDimension, View,
};

/// GPU virtual address handed out by the VA allocator.
pub type GpuVa = u64;

/// Shader stages a root parameter or binding is visible to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderVisibility {
    All,
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
}

/// Comparison operator shared by samplers and depth/stencil state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Limit on the combined root signature parameter cost, in DWORDs.
pub const MAX_ROOT_COST: u32 = 64;
/// Number of simultaneously bound render targets.
pub const MAX_RENDER_TARGETS: usize = 8;
/// Number of vertex input slots.
pub const MAX_VERTEX_BUFFERS: usize = 32;
/// Mip levels a texture description may request.
pub const MAX_MIP_LEVELS: u32 = 15;
/// Sparse resources are tiled at this granularity, in bytes.
pub const TILE_SIZE: u64 = 0x10000;
/// Default placement alignment for non-MSAA resources, in bytes.
pub const DEFAULT_RESOURCE_ALIGNMENT: u64 = 0x10000;
/// Placement alignment small textures may opt into, in bytes.
pub const SMALL_RESOURCE_ALIGNMENT: u64 = 0x1000;
/// Placement alignment for MSAA resources, in bytes.
pub const MSAA_RESOURCE_ALIGNMENT: u64 = 0x40_0000;
/// Required alignment of constant buffer views, in bytes.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;
/// Upper bound on descriptor set layouts a pipeline layout may reference:
/// six bindless sets plus static samplers, root descriptors and the packed set.
pub const MAX_DESCRIPTOR_SETS: usize = 9;

/// Errors surfaced by every fallible operation in the crate.
///
/// Creation paths report malformed descriptions as `InvalidArgument` and
/// capability gaps as `NotImplemented`; both are detected synchronously and
/// never leave a partially constructed object behind. Raw Vulkan failures are
/// folded into this taxonomy through [`From<vk::Result>`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// Malformed description or illegal parameter combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Host allocation failed.
    #[error("out of host memory")]
    OutOfHostMemory,
    /// Device allocation failed.
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// Legal request that this capability tier does not support.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// The logical device was lost.
    #[error("device lost")]
    DeviceLost,
    /// Any other failure code from the driver.
    #[error("Vulkan call failed: {0:?}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            other => Error::Vulkan(other),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn align(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod align_tests {
    use super::align;

    #[test]
    fn rounds_up_to_power_of_two() {
        assert_eq!(align(0, 256), 0);
        assert_eq!(align(1, 256), 256);
        assert_eq!(align(256, 256), 256);
        assert_eq!(align(257, 256), 512);
        assert_eq!(align(65535, 0x10000), 0x10000);
    }
}
