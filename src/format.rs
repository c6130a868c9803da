//! Pixel and buffer element formats.
//!
//! The format enum follows the translated API's format list (a DXGI-style
//! flat enumeration including typeless families), and each format maps to a
//! concrete `vk::Format` plus the block geometry and image aspects the rest
//! of the crate needs for validation, view creation and tiling math.

use ash::vk;

/// Translated-API texel/element format.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Format {
    Unknown,
    R32G32B32A32Typeless,
    R32G32B32A32Float,
    R32G32B32A32Uint,
    R32G32B32A32Sint,
    R32G32B32Float,
    R16G16B16A16Typeless,
    R16G16B16A16Float,
    R16G16B16A16Unorm,
    R16G16B16A16Uint,
    R16G16B16A16Snorm,
    R16G16B16A16Sint,
    R32G32Typeless,
    R32G32Float,
    R32G32Uint,
    R32G32Sint,
    R32G8X24Typeless,
    D32FloatS8X24Uint,
    R32FloatX8X24Typeless,
    X32TypelessG8X24Uint,
    R10G10B10A2Typeless,
    R10G10B10A2Unorm,
    R10G10B10A2Uint,
    R11G11B10Float,
    R8G8B8A8Typeless,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    R8G8B8A8Uint,
    R8G8B8A8Snorm,
    R8G8B8A8Sint,
    R16G16Typeless,
    R16G16Float,
    R16G16Unorm,
    R16G16Uint,
    R16G16Snorm,
    R16G16Sint,
    R32Typeless,
    D32Float,
    R32Float,
    R32Uint,
    R32Sint,
    R24G8Typeless,
    D24UnormS8Uint,
    R24UnormX8Typeless,
    X24TypelessG8Uint,
    R8G8Typeless,
    R8G8Unorm,
    R8G8Uint,
    R8G8Snorm,
    R8G8Sint,
    R16Typeless,
    R16Float,
    D16Unorm,
    R16Unorm,
    R16Uint,
    R16Snorm,
    R16Sint,
    R8Typeless,
    R8Unorm,
    R8Uint,
    R8Snorm,
    R8Sint,
    A8Unorm,
    B8G8R8A8Typeless,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    B8G8R8X8Unorm,
    Bc1Typeless,
    Bc1Unorm,
    Bc1UnormSrgb,
    Bc2Typeless,
    Bc2Unorm,
    Bc2UnormSrgb,
    Bc3Typeless,
    Bc3Unorm,
    Bc3UnormSrgb,
    Bc4Typeless,
    Bc4Unorm,
    Bc4Snorm,
    Bc5Typeless,
    Bc5Unorm,
    Bc5Snorm,
    Bc6hTypeless,
    Bc6hUf16,
    Bc6hSf16,
    Bc7Typeless,
    Bc7Unorm,
    Bc7UnormSrgb,
}

/// Static per-format properties.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FormatInfo {
    pub vk_format: vk::Format,
    /// Width of a compression block in texels; 1 for uncompressed formats.
    pub block_width: u32,
    /// Height of a compression block in texels; 1 for uncompressed formats.
    pub block_height: u32,
    /// Bytes per block (per texel for uncompressed formats).
    pub block_byte_count: u32,
    pub aspect_mask: vk::ImageAspectFlags,
}

const COLOR: vk::ImageAspectFlags = vk::ImageAspectFlags::COLOR;
const DEPTH: vk::ImageAspectFlags = vk::ImageAspectFlags::DEPTH;
const STENCIL: vk::ImageAspectFlags = vk::ImageAspectFlags::STENCIL;

const fn info(
    vk_format: vk::Format,
    block_width: u32,
    block_height: u32,
    block_byte_count: u32,
    aspect_mask: vk::ImageAspectFlags,
) -> FormatInfo {
    FormatInfo {
        vk_format,
        block_width,
        block_height,
        block_byte_count,
        aspect_mask,
    }
}

impl Format {
    /// Properties used when the format is consumed through shader or copy
    /// access. Typeless families resolve to a representative member here;
    /// pass `depth_stencil` to resolve them to the depth-capable member
    /// instead, which is what attachment and depth-sampling paths need.
    pub fn info_for_usage(self, depth_stencil: bool) -> FormatInfo {
        if depth_stencil {
            match self {
                Format::R32Typeless => {
                    return info(vk::Format::D32_SFLOAT, 1, 1, 4, DEPTH);
                }
                Format::R16Typeless => {
                    return info(vk::Format::D16_UNORM, 1, 1, 2, DEPTH);
                }
                Format::R24G8Typeless => {
                    return info(vk::Format::D24_UNORM_S8_UINT, 1, 1, 4, DEPTH | STENCIL);
                }
                Format::R32G8X24Typeless => {
                    return info(vk::Format::D32_SFLOAT_S8_UINT, 1, 1, 8, DEPTH | STENCIL);
                }
                _ => {}
            }
        }
        self.info()
    }

    /// Properties of the format itself.
    pub fn info(self) -> FormatInfo {
        use Format::*;
        match self {
            Unknown => info(vk::Format::UNDEFINED, 1, 1, 1, COLOR),
            R32G32B32A32Typeless => info(vk::Format::R32G32B32A32_UINT, 1, 1, 16, COLOR),
            R32G32B32A32Float => info(vk::Format::R32G32B32A32_SFLOAT, 1, 1, 16, COLOR),
            R32G32B32A32Uint => info(vk::Format::R32G32B32A32_UINT, 1, 1, 16, COLOR),
            R32G32B32A32Sint => info(vk::Format::R32G32B32A32_SINT, 1, 1, 16, COLOR),
            R32G32B32Float => info(vk::Format::R32G32B32_SFLOAT, 1, 1, 12, COLOR),
            R16G16B16A16Typeless => info(vk::Format::R16G16B16A16_UINT, 1, 1, 8, COLOR),
            R16G16B16A16Float => info(vk::Format::R16G16B16A16_SFLOAT, 1, 1, 8, COLOR),
            R16G16B16A16Unorm => info(vk::Format::R16G16B16A16_UNORM, 1, 1, 8, COLOR),
            R16G16B16A16Uint => info(vk::Format::R16G16B16A16_UINT, 1, 1, 8, COLOR),
            R16G16B16A16Snorm => info(vk::Format::R16G16B16A16_SNORM, 1, 1, 8, COLOR),
            R16G16B16A16Sint => info(vk::Format::R16G16B16A16_SINT, 1, 1, 8, COLOR),
            R32G32Typeless => info(vk::Format::R32G32_UINT, 1, 1, 8, COLOR),
            R32G32Float => info(vk::Format::R32G32_SFLOAT, 1, 1, 8, COLOR),
            R32G32Uint => info(vk::Format::R32G32_UINT, 1, 1, 8, COLOR),
            R32G32Sint => info(vk::Format::R32G32_SINT, 1, 1, 8, COLOR),
            R32G8X24Typeless => info(vk::Format::D32_SFLOAT_S8_UINT, 1, 1, 8, DEPTH | STENCIL),
            D32FloatS8X24Uint => info(vk::Format::D32_SFLOAT_S8_UINT, 1, 1, 8, DEPTH | STENCIL),
            R32FloatX8X24Typeless => info(vk::Format::D32_SFLOAT_S8_UINT, 1, 1, 8, DEPTH),
            X32TypelessG8X24Uint => info(vk::Format::D32_SFLOAT_S8_UINT, 1, 1, 8, STENCIL),
            R10G10B10A2Typeless => info(vk::Format::A2B10G10R10_UINT_PACK32, 1, 1, 4, COLOR),
            R10G10B10A2Unorm => info(vk::Format::A2B10G10R10_UNORM_PACK32, 1, 1, 4, COLOR),
            R10G10B10A2Uint => info(vk::Format::A2B10G10R10_UINT_PACK32, 1, 1, 4, COLOR),
            R11G11B10Float => info(vk::Format::B10G11R11_UFLOAT_PACK32, 1, 1, 4, COLOR),
            R8G8B8A8Typeless => info(vk::Format::R8G8B8A8_UINT, 1, 1, 4, COLOR),
            R8G8B8A8Unorm => info(vk::Format::R8G8B8A8_UNORM, 1, 1, 4, COLOR),
            R8G8B8A8UnormSrgb => info(vk::Format::R8G8B8A8_SRGB, 1, 1, 4, COLOR),
            R8G8B8A8Uint => info(vk::Format::R8G8B8A8_UINT, 1, 1, 4, COLOR),
            R8G8B8A8Snorm => info(vk::Format::R8G8B8A8_SNORM, 1, 1, 4, COLOR),
            R8G8B8A8Sint => info(vk::Format::R8G8B8A8_SINT, 1, 1, 4, COLOR),
            R16G16Typeless => info(vk::Format::R16G16_UINT, 1, 1, 4, COLOR),
            R16G16Float => info(vk::Format::R16G16_SFLOAT, 1, 1, 4, COLOR),
            R16G16Unorm => info(vk::Format::R16G16_UNORM, 1, 1, 4, COLOR),
            R16G16Uint => info(vk::Format::R16G16_UINT, 1, 1, 4, COLOR),
            R16G16Snorm => info(vk::Format::R16G16_SNORM, 1, 1, 4, COLOR),
            R16G16Sint => info(vk::Format::R16G16_SINT, 1, 1, 4, COLOR),
            R32Typeless => info(vk::Format::R32_UINT, 1, 1, 4, COLOR),
            D32Float => info(vk::Format::D32_SFLOAT, 1, 1, 4, DEPTH),
            R32Float => info(vk::Format::R32_SFLOAT, 1, 1, 4, COLOR),
            R32Uint => info(vk::Format::R32_UINT, 1, 1, 4, COLOR),
            R32Sint => info(vk::Format::R32_SINT, 1, 1, 4, COLOR),
            R24G8Typeless => info(vk::Format::D24_UNORM_S8_UINT, 1, 1, 4, DEPTH | STENCIL),
            D24UnormS8Uint => info(vk::Format::D24_UNORM_S8_UINT, 1, 1, 4, DEPTH | STENCIL),
            R24UnormX8Typeless => info(vk::Format::D24_UNORM_S8_UINT, 1, 1, 4, DEPTH),
            X24TypelessG8Uint => info(vk::Format::D24_UNORM_S8_UINT, 1, 1, 4, STENCIL),
            R8G8Typeless => info(vk::Format::R8G8_UINT, 1, 1, 2, COLOR),
            R8G8Unorm => info(vk::Format::R8G8_UNORM, 1, 1, 2, COLOR),
            R8G8Uint => info(vk::Format::R8G8_UINT, 1, 1, 2, COLOR),
            R8G8Snorm => info(vk::Format::R8G8_SNORM, 1, 1, 2, COLOR),
            R8G8Sint => info(vk::Format::R8G8_SINT, 1, 1, 2, COLOR),
            R16Typeless => info(vk::Format::R16_UINT, 1, 1, 2, COLOR),
            R16Float => info(vk::Format::R16_SFLOAT, 1, 1, 2, COLOR),
            D16Unorm => info(vk::Format::D16_UNORM, 1, 1, 2, DEPTH),
            R16Unorm => info(vk::Format::R16_UNORM, 1, 1, 2, COLOR),
            R16Uint => info(vk::Format::R16_UINT, 1, 1, 2, COLOR),
            R16Snorm => info(vk::Format::R16_SNORM, 1, 1, 2, COLOR),
            R16Sint => info(vk::Format::R16_SINT, 1, 1, 2, COLOR),
            R8Typeless => info(vk::Format::R8_UINT, 1, 1, 1, COLOR),
            R8Unorm => info(vk::Format::R8_UNORM, 1, 1, 1, COLOR),
            R8Uint => info(vk::Format::R8_UINT, 1, 1, 1, COLOR),
            R8Snorm => info(vk::Format::R8_SNORM, 1, 1, 1, COLOR),
            R8Sint => info(vk::Format::R8_SINT, 1, 1, 1, COLOR),
            A8Unorm => info(vk::Format::R8_UNORM, 1, 1, 1, COLOR),
            B8G8R8A8Typeless => info(vk::Format::B8G8R8A8_UNORM, 1, 1, 4, COLOR),
            B8G8R8A8Unorm => info(vk::Format::B8G8R8A8_UNORM, 1, 1, 4, COLOR),
            B8G8R8A8UnormSrgb => info(vk::Format::B8G8R8A8_SRGB, 1, 1, 4, COLOR),
            B8G8R8X8Unorm => info(vk::Format::B8G8R8A8_UNORM, 1, 1, 4, COLOR),
            Bc1Typeless => info(vk::Format::BC1_RGBA_UNORM_BLOCK, 4, 4, 8, COLOR),
            Bc1Unorm => info(vk::Format::BC1_RGBA_UNORM_BLOCK, 4, 4, 8, COLOR),
            Bc1UnormSrgb => info(vk::Format::BC1_RGBA_SRGB_BLOCK, 4, 4, 8, COLOR),
            Bc2Typeless => info(vk::Format::BC2_UNORM_BLOCK, 4, 4, 16, COLOR),
            Bc2Unorm => info(vk::Format::BC2_UNORM_BLOCK, 4, 4, 16, COLOR),
            Bc2UnormSrgb => info(vk::Format::BC2_SRGB_BLOCK, 4, 4, 16, COLOR),
            Bc3Typeless => info(vk::Format::BC3_UNORM_BLOCK, 4, 4, 16, COLOR),
            Bc3Unorm => info(vk::Format::BC3_UNORM_BLOCK, 4, 4, 16, COLOR),
            Bc3UnormSrgb => info(vk::Format::BC3_SRGB_BLOCK, 4, 4, 16, COLOR),
            Bc4Typeless => info(vk::Format::BC4_UNORM_BLOCK, 4, 4, 8, COLOR),
            Bc4Unorm => info(vk::Format::BC4_UNORM_BLOCK, 4, 4, 8, COLOR),
            Bc4Snorm => info(vk::Format::BC4_SNORM_BLOCK, 4, 4, 8, COLOR),
            Bc5Typeless => info(vk::Format::BC5_UNORM_BLOCK, 4, 4, 16, COLOR),
            Bc5Unorm => info(vk::Format::BC5_UNORM_BLOCK, 4, 4, 16, COLOR),
            Bc5Snorm => info(vk::Format::BC5_SNORM_BLOCK, 4, 4, 16, COLOR),
            Bc6hTypeless => info(vk::Format::BC6H_UFLOAT_BLOCK, 4, 4, 16, COLOR),
            Bc6hUf16 => info(vk::Format::BC6H_UFLOAT_BLOCK, 4, 4, 16, COLOR),
            Bc6hSf16 => info(vk::Format::BC6H_SFLOAT_BLOCK, 4, 4, 16, COLOR),
            Bc7Typeless => info(vk::Format::BC7_UNORM_BLOCK, 4, 4, 16, COLOR),
            Bc7Unorm => info(vk::Format::BC7_UNORM_BLOCK, 4, 4, 16, COLOR),
            Bc7UnormSrgb => info(vk::Format::BC7_SRGB_BLOCK, 4, 4, 16, COLOR),
        }
    }

    pub fn vk_format(self) -> vk::Format {
        self.info().vk_format
    }

    pub fn is_typeless(self) -> bool {
        !self.castable_formats().is_empty()
    }

    pub fn is_uint(self) -> bool {
        use Format::*;
        matches!(
            self,
            R32G32B32A32Uint
                | R16G16B16A16Uint
                | R32G32Uint
                | X32TypelessG8X24Uint
                | R10G10B10A2Uint
                | R8G8B8A8Uint
                | R16G16Uint
                | R32Uint
                | X24TypelessG8Uint
                | R8G8Uint
                | R16Uint
                | R8Uint
        )
    }

    pub fn is_block_compressed(self) -> bool {
        let info = self.info();
        info.block_width > 1 || info.block_height > 1
    }

    pub fn is_depth_stencil(self) -> bool {
        self.info()
            .aspect_mask
            .intersects(DEPTH | STENCIL)
    }

    /// Concrete formats an image of a typeless format may be viewed as.
    /// Non-typeless formats return an empty list. Feeds the mutable-format
    /// list at image creation and view-format validation afterwards.
    pub fn castable_formats(self) -> &'static [Format] {
        use Format::*;
        match self {
            R32G32B32A32Typeless => &[R32G32B32A32Float, R32G32B32A32Uint, R32G32B32A32Sint],
            R16G16B16A16Typeless => &[
                R16G16B16A16Float,
                R16G16B16A16Unorm,
                R16G16B16A16Uint,
                R16G16B16A16Snorm,
                R16G16B16A16Sint,
            ],
            R32G32Typeless => &[R32G32Float, R32G32Uint, R32G32Sint],
            R32G8X24Typeless => &[
                D32FloatS8X24Uint,
                R32FloatX8X24Typeless,
                X32TypelessG8X24Uint,
            ],
            R10G10B10A2Typeless => &[R10G10B10A2Unorm, R10G10B10A2Uint],
            R8G8B8A8Typeless => &[
                R8G8B8A8Unorm,
                R8G8B8A8UnormSrgb,
                R8G8B8A8Uint,
                R8G8B8A8Snorm,
                R8G8B8A8Sint,
            ],
            R16G16Typeless => &[R16G16Float, R16G16Unorm, R16G16Uint, R16G16Snorm, R16G16Sint],
            R32Typeless => &[D32Float, R32Float, R32Uint, R32Sint],
            R24G8Typeless => &[D24UnormS8Uint, R24UnormX8Typeless, X24TypelessG8Uint],
            R8G8Typeless => &[R8G8Unorm, R8G8Uint, R8G8Snorm, R8G8Sint],
            R16Typeless => &[R16Float, D16Unorm, R16Unorm, R16Uint, R16Snorm, R16Sint],
            R8Typeless => &[R8Unorm, R8Uint, R8Snorm, R8Sint],
            B8G8R8A8Typeless => &[B8G8R8A8Unorm, B8G8R8A8UnormSrgb],
            Bc1Typeless => &[Bc1Unorm, Bc1UnormSrgb],
            Bc2Typeless => &[Bc2Unorm, Bc2UnormSrgb],
            Bc3Typeless => &[Bc3Unorm, Bc3UnormSrgb],
            Bc4Typeless => &[Bc4Unorm, Bc4Snorm],
            Bc5Typeless => &[Bc5Unorm, Bc5Snorm],
            Bc6hTypeless => &[Bc6hUf16, Bc6hSf16],
            Bc7Typeless => &[Bc7Unorm, Bc7UnormSrgb],
            _ => &[],
        }
    }

    /// Distinct Vulkan formats an image of this format can be recreated as,
    /// used to populate `VkImageFormatListCreateInfo` for mutable-format
    /// images.
    pub fn vk_view_formats(self) -> Vec<vk::Format> {
        let mut formats = Vec::new();
        for &castable in self.castable_formats() {
            let vk_format = castable.vk_format();
            if !formats.contains(&vk_format) {
                formats.push(vk_format);
            }
        }
        formats
    }
}

#[cfg(test)]
mod format_tests {
    use super::*;

    #[test]
    fn typeless_families() {
        assert!(Format::R8G8B8A8Typeless.is_typeless());
        assert!(!Format::R8G8B8A8Unorm.is_typeless());
        assert!(Format::R24G8Typeless
            .castable_formats()
            .contains(&Format::D24UnormS8Uint));
    }

    #[test]
    fn view_formats_are_deduplicated() {
        // D24_UNORM_S8_UINT backs all three castable members.
        let formats = Format::R24G8Typeless.vk_view_formats();
        assert_eq!(formats, vec![vk::Format::D24_UNORM_S8_UINT]);
    }

    #[test]
    fn block_compressed_geometry() {
        let info = Format::Bc1Unorm.info();
        assert_eq!((info.block_width, info.block_height), (4, 4));
        assert_eq!(info.block_byte_count, 8);
        assert!(Format::Bc1Unorm.is_block_compressed());
        assert!(!Format::R8G8B8A8Unorm.is_block_compressed());
    }

    #[test]
    fn depth_resolution_for_typeless() {
        let plain = Format::R32Typeless.info_for_usage(false);
        assert_eq!(plain.vk_format, vk::Format::R32_UINT);
        let depth = Format::R32Typeless.info_for_usage(true);
        assert_eq!(depth.vk_format, vk::Format::D32_SFLOAT);
        assert_eq!(depth.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn stencil_only_aspect() {
        let info = Format::X24TypelessG8Uint.info();
        assert_eq!(info.aspect_mask, vk::ImageAspectFlags::STENCIL);
        assert_eq!(info.vk_format, vk::Format::D24_UNORM_S8_UINT);
    }
}
