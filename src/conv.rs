//! Pure translation tables from the D3D12-flavored state enums to their
//! Vulkan equivalents. Anything that needs device capabilities or emits a
//! diagnostic lives with its caller; these functions are total maps.

use ash::vk;

use crate::pipeline::{
    Blend, BlendOp, CullMode, FillMode, LogicOp, PrimitiveTopology, PrimitiveTopologyType,
    StencilOp,
};
use crate::view::{AddressMode, FilterReduction, FilterType, StaticBorderColor};
use crate::{ComparisonFunc, Error, Result, ShaderVisibility};

pub(crate) fn map_sample_count(count: u32) -> Result<vk::SampleCountFlags> {
    Ok(match count {
        1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        _ => {
            warn!("unhandled sample count {}", count);
            return Err(Error::InvalidArgument("sample count"));
        }
    })
}

pub(crate) fn map_comparison(func: ComparisonFunc) -> vk::CompareOp {
    match func {
        ComparisonFunc::Never => vk::CompareOp::NEVER,
        ComparisonFunc::Less => vk::CompareOp::LESS,
        ComparisonFunc::Equal => vk::CompareOp::EQUAL,
        ComparisonFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        ComparisonFunc::Greater => vk::CompareOp::GREATER,
        ComparisonFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
        ComparisonFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        ComparisonFunc::Always => vk::CompareOp::ALWAYS,
    }
}

pub(crate) fn map_filter_type(filter: FilterType) -> vk::Filter {
    match filter {
        FilterType::Point => vk::Filter::NEAREST,
        FilterType::Linear => vk::Filter::LINEAR,
    }
}

pub(crate) fn map_mipmap_mode(filter: FilterType) -> vk::SamplerMipmapMode {
    match filter {
        FilterType::Point => vk::SamplerMipmapMode::NEAREST,
        FilterType::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub(crate) fn map_reduction_mode(reduction: FilterReduction) -> vk::SamplerReductionMode {
    match reduction {
        FilterReduction::Minimum => vk::SamplerReductionMode::MIN,
        FilterReduction::Maximum => vk::SamplerReductionMode::MAX,
        FilterReduction::Standard | FilterReduction::Comparison => {
            vk::SamplerReductionMode::WEIGHTED_AVERAGE
        }
    }
}

pub(crate) fn map_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        AddressMode::MirrorOnce => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
    }
}

pub(crate) fn map_static_border_color(color: StaticBorderColor) -> vk::BorderColor {
    match color {
        StaticBorderColor::TransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        StaticBorderColor::OpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        StaticBorderColor::OpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
    }
}

pub(crate) fn map_shader_visibility(visibility: ShaderVisibility) -> vk::ShaderStageFlags {
    match visibility {
        ShaderVisibility::All => vk::ShaderStageFlags::ALL,
        ShaderVisibility::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderVisibility::Hull => vk::ShaderStageFlags::TESSELLATION_CONTROL,
        ShaderVisibility::Domain => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        ShaderVisibility::Geometry => vk::ShaderStageFlags::GEOMETRY,
        ShaderVisibility::Pixel => vk::ShaderStageFlags::FRAGMENT,
    }
}

pub(crate) fn map_fill_mode(mode: FillMode) -> vk::PolygonMode {
    match mode {
        FillMode::Wireframe => vk::PolygonMode::LINE,
        FillMode::Solid => vk::PolygonMode::FILL,
    }
}

pub(crate) fn map_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub(crate) fn map_stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrSat => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrSat => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::Incr => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::Decr => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

/// Alpha channels have no dedicated color factors; the `*Color` factors
/// collapse to their alpha counterparts when used in the alpha slot.
pub(crate) fn map_blend_factor(blend: Blend, alpha: bool) -> vk::BlendFactor {
    match blend {
        Blend::Zero => vk::BlendFactor::ZERO,
        Blend::One => vk::BlendFactor::ONE,
        Blend::SrcColor if alpha => vk::BlendFactor::SRC_ALPHA,
        Blend::SrcColor => vk::BlendFactor::SRC_COLOR,
        Blend::InvSrcColor if alpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        Blend::InvSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        Blend::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        Blend::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        Blend::DstAlpha => vk::BlendFactor::DST_ALPHA,
        Blend::InvDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        Blend::DstColor if alpha => vk::BlendFactor::DST_ALPHA,
        Blend::DstColor => vk::BlendFactor::DST_COLOR,
        Blend::InvDstColor if alpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        Blend::InvDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        Blend::SrcAlphaSat => vk::BlendFactor::SRC_ALPHA_SATURATE,
        Blend::BlendFactor if alpha => vk::BlendFactor::CONSTANT_ALPHA,
        Blend::BlendFactor => vk::BlendFactor::CONSTANT_COLOR,
        Blend::InvBlendFactor if alpha => vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA,
        Blend::InvBlendFactor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
        Blend::Src1Color if alpha => vk::BlendFactor::SRC1_ALPHA,
        Blend::Src1Color => vk::BlendFactor::SRC1_COLOR,
        Blend::InvSrc1Color if alpha => vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
        Blend::InvSrc1Color => vk::BlendFactor::ONE_MINUS_SRC1_COLOR,
        Blend::Src1Alpha => vk::BlendFactor::SRC1_ALPHA,
        Blend::InvSrc1Alpha => vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
    }
}

pub(crate) fn map_blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::RevSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

pub(crate) fn map_logic_op(op: LogicOp) -> vk::LogicOp {
    match op {
        LogicOp::Clear => vk::LogicOp::CLEAR,
        LogicOp::Set => vk::LogicOp::SET,
        LogicOp::Copy => vk::LogicOp::COPY,
        LogicOp::CopyInverted => vk::LogicOp::COPY_INVERTED,
        LogicOp::NoOp => vk::LogicOp::NO_OP,
        LogicOp::Invert => vk::LogicOp::INVERT,
        LogicOp::And => vk::LogicOp::AND,
        LogicOp::Nand => vk::LogicOp::NAND,
        LogicOp::Or => vk::LogicOp::OR,
        LogicOp::Nor => vk::LogicOp::NOR,
        LogicOp::Xor => vk::LogicOp::XOR,
        LogicOp::Equiv => vk::LogicOp::EQUIVALENT,
        LogicOp::AndReverse => vk::LogicOp::AND_REVERSE,
        LogicOp::AndInverted => vk::LogicOp::AND_INVERTED,
        LogicOp::OrReverse => vk::LogicOp::OR_REVERSE,
        LogicOp::OrInverted => vk::LogicOp::OR_INVERTED,
    }
}

/// Maps a creation-time topology class to a concrete topology. List types
/// cannot legally enable primitive restart, so restartable pipelines use
/// the strip variant of the class instead.
pub(crate) fn map_topology_type(
    topology_type: PrimitiveTopologyType,
    restart: bool,
) -> Result<vk::PrimitiveTopology> {
    Ok(match topology_type {
        PrimitiveTopologyType::Point => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopologyType::Line if restart => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopologyType::Line => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopologyType::Triangle if restart => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopologyType::Triangle => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopologyType::Patch => vk::PrimitiveTopology::PATCH_LIST,
        PrimitiveTopologyType::Undefined => {
            warn!("undefined primitive topology type");
            return Err(Error::InvalidArgument("primitive topology type"));
        }
    })
}

pub(crate) fn map_topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::PatchList { .. } => vk::PrimitiveTopology::PATCH_LIST,
    }
}

/// Whether a topology may legally enable primitive restart.
pub(crate) fn topology_can_restart(topology: vk::PrimitiveTopology) -> bool {
    !matches!(
        topology,
        vk::PrimitiveTopology::POINT_LIST
            | vk::PrimitiveTopology::LINE_LIST
            | vk::PrimitiveTopology::TRIANGLE_LIST
            | vk::PrimitiveTopology::LINE_LIST_WITH_ADJACENCY
            | vk::PrimitiveTopology::TRIANGLE_LIST_WITH_ADJACENCY
            | vk::PrimitiveTopology::PATCH_LIST
    )
}

pub(crate) fn topology_type_can_restart(topology_type: PrimitiveTopologyType) -> bool {
    matches!(
        topology_type,
        PrimitiveTopologyType::Line | PrimitiveTopologyType::Triangle
    )
}

#[cfg(test)]
mod conv_tests {
    use super::*;

    #[test]
    fn sample_counts_map_to_power_of_two_flags() {
        assert_eq!(map_sample_count(1), Ok(vk::SampleCountFlags::TYPE_1));
        assert_eq!(map_sample_count(4), Ok(vk::SampleCountFlags::TYPE_4));
        assert!(map_sample_count(3).is_err());
        assert!(map_sample_count(0).is_err());
    }

    #[test]
    fn color_factors_collapse_in_the_alpha_slot() {
        assert_eq!(
            map_blend_factor(Blend::SrcColor, false),
            vk::BlendFactor::SRC_COLOR
        );
        assert_eq!(
            map_blend_factor(Blend::SrcColor, true),
            vk::BlendFactor::SRC_ALPHA
        );
        assert_eq!(
            map_blend_factor(Blend::InvDstColor, true),
            vk::BlendFactor::ONE_MINUS_DST_ALPHA
        );
    }

    #[test]
    fn restartable_classes_pick_strip_topologies() {
        assert_eq!(
            map_topology_type(PrimitiveTopologyType::Triangle, true),
            Ok(vk::PrimitiveTopology::TRIANGLE_STRIP)
        );
        assert_eq!(
            map_topology_type(PrimitiveTopologyType::Triangle, false),
            Ok(vk::PrimitiveTopology::TRIANGLE_LIST)
        );
        assert!(map_topology_type(PrimitiveTopologyType::Undefined, false).is_err());
        assert!(!topology_can_restart(vk::PrimitiveTopology::PATCH_LIST));
        assert!(topology_can_restart(vk::PrimitiveTopology::TRIANGLE_STRIP));
    }
}
