//! The shader translation seam.
//!
//! Bytecode translation is not performed here; the device is constructed
//! with a [`ShaderCompiler`] that turns D3D shader bytecode into SPIR-V.
//! This module defines the vocabulary crossing that seam: the binding table
//! a root signature compiles to, push constant layout, UAV counter wiring,
//! transform feedback declarations and the per-stage compile arguments.

use arrayvec::ArrayVec;

use crate::root_signature::DescriptorRangeType;
use crate::view::ComponentMapping;
use crate::{Result, ShaderVisibility, MAX_RENDER_TARGETS};

bitflags! {
    /// How a binding is realized. SRV and UAV ranges split into separate
    /// buffer and image bindings; UAV counters ride along as `COUNTER`
    /// entries for the same registers.
    pub struct BindingFlags: u32 {
        const BUFFER = 0x1;
        const IMAGE = 0x2;
        const COUNTER = 0x4;
        const BINDLESS = 0x8;
    }
}

/// Descriptor set slot a register access resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub set: u32,
    pub binding: u32,
    /// Descriptor array length; bindless bindings cover a whole heap.
    pub count: u32,
}

/// Maps a run of shader registers onto a descriptor binding.
///
/// Bindless entries cover a whole descriptor range through one
/// variable-count binding; packed entries are unrolled, one binding per
/// register. `descriptor_table` and `descriptor_offset` locate the run
/// within its root parameter so the translator can index the right heap
/// region; they are meaningless for root descriptors and static samplers.
#[derive(Clone, Copy, Debug)]
pub struct ResourceBinding {
    pub kind: DescriptorRangeType,
    pub register_space: u32,
    pub register_index: u32,
    pub register_count: u32,
    pub descriptor_table: u32,
    pub descriptor_offset: u32,
    pub visibility: ShaderVisibility,
    pub flags: BindingFlags,
    pub binding: DescriptorBinding,
}

/// Root constants exposed to the shader as a push constant window.
#[derive(Clone, Copy, Debug)]
pub struct PushConstantBuffer {
    pub register_space: u32,
    pub register_index: u32,
    pub visibility: ShaderVisibility,
    /// Byte offset into the pipeline layout's push constant block.
    pub offset: u32,
    pub size: u32,
}

/// Where the per-table descriptor offsets live in the push constant block.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorTableBuffer {
    pub offset: u32,
    pub count: u32,
}

bitflags! {
    /// Global translation switches derived from the root signature and the
    /// device's bindless configuration.
    pub struct ShaderInterfaceFlags: u32 {
        /// Root constants overflow the push constant budget and live in a
        /// uniform block in the root descriptor set instead.
        const PUSH_CONSTANTS_AS_UNIFORM_BLOCK = 0x1;
        /// Bindless CBVs are raw storage buffers rather than uniform buffers.
        const CBV_AS_SSBO = 0x2;
    }
}

/// One output declaration of a stream output layout. `semantic_name` of
/// `None` skips `component_count` components in the output buffer.
#[derive(Clone, Debug)]
pub struct StreamOutputElement {
    pub stream_index: u32,
    pub semantic_name: Option<String>,
    pub semantic_index: u32,
    pub start_component: u8,
    pub component_count: u8,
    pub output_slot: u8,
}

/// Transform feedback declarations handed to the pre-rasterization stage.
#[derive(Clone, Copy, Debug)]
pub struct TransformFeedbackInfo<'a> {
    pub elements: &'a [StreamOutputElement],
    pub buffer_strides: &'a [u32],
}

/// Everything the translator needs to resolve register accesses, built from
/// the root signature's binding table.
#[derive(Clone, Copy, Debug)]
pub struct ShaderInterface<'a> {
    pub flags: ShaderInterfaceFlags,
    pub bindings: &'a [ResourceBinding],
    pub push_constant_buffers: &'a [PushConstantBuffer],
    pub descriptor_tables: DescriptorTableBuffer,
    /// Binding of the uniform block replacing push constants, when
    /// `PUSH_CONSTANTS_AS_UNIFORM_BLOCK` is set.
    pub push_constant_ubo: Option<DescriptorBinding>,
    pub xfb: Option<&'a TransformFeedbackInfo<'a>>,
}

/// Compile-time specialization for a single stage. Only the fragment stage
/// carries sample count, dual source blending and output swizzles.
#[derive(Clone, Debug, Default)]
pub struct CompileArguments {
    pub sample_count: Option<u32>,
    pub dual_source_blending: bool,
    pub output_swizzles: ArrayVec<[ComponentMapping; MAX_RENDER_TARGETS]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentType {
    Float32,
    Uint32,
    Sint32,
}

/// One element of a parsed shader input signature.
#[derive(Clone, Debug)]
pub struct SignatureElement {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub stream_index: u32,
    /// System-value semantics are not fed from vertex buffers.
    pub sysval: bool,
    pub component_type: ComponentType,
    pub register_index: u32,
    pub mask: u8,
}

/// Finds the signature element an input layout entry feeds. Semantic names
/// compare case-insensitively, as D3D semantics do.
pub fn find_signature_element<'a>(
    elements: &'a [SignatureElement],
    semantic_name: &str,
    semantic_index: u32,
    stream_index: u32,
) -> Option<&'a SignatureElement> {
    elements.iter().find(|element| {
        element.semantic_name.eq_ignore_ascii_case(semantic_name)
            && element.semantic_index == semantic_index
            && element.stream_index == stream_index
    })
}

/// Translates D3D shader bytecode to SPIR-V.
///
/// The compiler is shared by every pipeline compilation on the device and
/// variant compilation runs outside the variant-cache lock, so
/// implementations must be callable from multiple threads at once.
pub trait ShaderCompiler: Send + Sync {
    /// Translates one stage, resolving register accesses through
    /// `interface` and specializing on `args`.
    fn compile(
        &self,
        bytecode: &[u8],
        interface: &ShaderInterface,
        args: &CompileArguments,
    ) -> Result<Vec<u32>>;

    /// Parses the input signature of a vertex shader.
    fn parse_input_signature(&self, bytecode: &[u8]) -> Result<Vec<SignatureElement>>;

    /// Reads the declared control point count of a hull shader.
    fn scan_patch_vertex_count(&self, bytecode: &[u8]) -> Result<u32>;
}

#[cfg(test)]
mod signature_tests {
    use super::*;

    fn element(name: &str, index: u32, register_index: u32) -> SignatureElement {
        SignatureElement {
            semantic_name: name.to_string(),
            semantic_index: index,
            stream_index: 0,
            sysval: false,
            component_type: ComponentType::Float32,
            register_index,
            mask: 0xf,
        }
    }

    #[test]
    fn semantic_names_match_case_insensitively() {
        let elements = [element("POSITION", 0, 0), element("TEXCOORD", 1, 2)];

        let found = find_signature_element(&elements, "texcoord", 1, 0);
        assert_eq!(found.map(|element| element.register_index), Some(2));

        assert!(find_signature_element(&elements, "TEXCOORD", 0, 0).is_none());
        assert!(find_signature_element(&elements, "TEXCOORD", 1, 1).is_none());
    }
}
