//! Block-compressed format table
//!
//! Maps every supported compression variant to the GPU storage format, channel
//! count and block stride used to provision and fill a mipmapped resource.

use image_dds::ddsfile::DxgiFormat;
use image_dds::ImageFormat;
use std::fmt;
use std::str::FromStr;
use wgpu::TextureFormat;

/// Block-compressed formats that can be placed on the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatVariant {
    /// BC1 - DXT1, 4 channels, 1-bit alpha
    BC1Unorm,
    BC1UnormSrgb,
    /// BC2 - DXT3, explicit 4-bit alpha
    BC2Unorm,
    BC2UnormSrgb,
    /// BC3 - DXT5, interpolated alpha
    BC3Unorm,
    BC3UnormSrgb,
    /// BC4 - single channel
    BC4Unorm,
    BC4Snorm,
    /// BC5 - two channels, normal maps
    BC5Unorm,
    BC5Snorm,
    /// BC6H - HDR RGB half floats
    BC6HUfloat,
    BC6HSfloat,
    /// BC7 - high quality RGBA
    BC7Unorm,
    BC7UnormSrgb,
}

/// Everything the provisioning and transfer stages need to know about a variant
#[derive(Debug, Clone, Copy)]
pub struct FormatDescriptor {
    pub variant: FormatVariant,
    /// Native block-compressed storage format
    pub storage_format: TextureFormat,
    pub channel_count: u32,
    /// Bytes per 4x4 block (8 or 16)
    pub block_stride: u32,
    /// Format a sampling view reads through, without any gamma suffix
    pub view_format: TextureFormat,
    /// Whether reads should decode display gamma
    pub degamma: bool,
    /// DDS/DXGI tag for the same data
    pub dxgi_format: DxgiFormat,
}

/// The container's compression tag has no entry in the format table
#[derive(Debug, thiserror::Error)]
#[error("unsupported texture format: {0}")]
pub struct UnsupportedFormatError(pub String);

impl FormatVariant {
    pub const ALL: [FormatVariant; 14] = [
        FormatVariant::BC1Unorm,
        FormatVariant::BC1UnormSrgb,
        FormatVariant::BC2Unorm,
        FormatVariant::BC2UnormSrgb,
        FormatVariant::BC3Unorm,
        FormatVariant::BC3UnormSrgb,
        FormatVariant::BC4Unorm,
        FormatVariant::BC4Snorm,
        FormatVariant::BC5Unorm,
        FormatVariant::BC5Snorm,
        FormatVariant::BC6HUfloat,
        FormatVariant::BC6HSfloat,
        FormatVariant::BC7Unorm,
        FormatVariant::BC7UnormSrgb,
    ];

    /// Resolve the variant for a DDS image format
    pub fn from_image_format(format: ImageFormat) -> Result<Self, UnsupportedFormatError> {
        let variant = match format {
            ImageFormat::BC1RgbaUnorm => FormatVariant::BC1Unorm,
            ImageFormat::BC1RgbaUnormSrgb => FormatVariant::BC1UnormSrgb,
            ImageFormat::BC2RgbaUnorm => FormatVariant::BC2Unorm,
            ImageFormat::BC2RgbaUnormSrgb => FormatVariant::BC2UnormSrgb,
            ImageFormat::BC3RgbaUnorm => FormatVariant::BC3Unorm,
            ImageFormat::BC3RgbaUnormSrgb => FormatVariant::BC3UnormSrgb,
            ImageFormat::BC4RUnorm => FormatVariant::BC4Unorm,
            ImageFormat::BC4RSnorm => FormatVariant::BC4Snorm,
            ImageFormat::BC5RgUnorm => FormatVariant::BC5Unorm,
            ImageFormat::BC5RgSnorm => FormatVariant::BC5Snorm,
            ImageFormat::BC6hRgbUfloat => FormatVariant::BC6HUfloat,
            ImageFormat::BC6hRgbSfloat => FormatVariant::BC6HSfloat,
            ImageFormat::BC7RgbaUnorm => FormatVariant::BC7Unorm,
            ImageFormat::BC7RgbaUnormSrgb => FormatVariant::BC7UnormSrgb,
            other => return Err(UnsupportedFormatError(format!("{:?}", other))),
        };
        Ok(variant)
    }

    /// Variant whose storage or view format is `format`
    pub fn from_texture_format(format: TextureFormat) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.descriptor().storage_format == format)
    }

    /// Table entry for this variant
    pub fn descriptor(self) -> FormatDescriptor {
        use FormatVariant::*;

        let (storage_format, channel_count, block_stride, dxgi_format) = match self {
            BC1Unorm => (TextureFormat::Bc1RgbaUnorm, 4, 8, DxgiFormat::BC1_UNorm),
            BC1UnormSrgb => (TextureFormat::Bc1RgbaUnormSrgb, 4, 8, DxgiFormat::BC1_UNorm_sRGB),
            BC2Unorm => (TextureFormat::Bc2RgbaUnorm, 4, 16, DxgiFormat::BC2_UNorm),
            BC2UnormSrgb => (TextureFormat::Bc2RgbaUnormSrgb, 4, 16, DxgiFormat::BC2_UNorm_sRGB),
            BC3Unorm => (TextureFormat::Bc3RgbaUnorm, 4, 16, DxgiFormat::BC3_UNorm),
            BC3UnormSrgb => (TextureFormat::Bc3RgbaUnormSrgb, 4, 16, DxgiFormat::BC3_UNorm_sRGB),
            BC4Unorm => (TextureFormat::Bc4RUnorm, 1, 8, DxgiFormat::BC4_UNorm),
            BC4Snorm => (TextureFormat::Bc4RSnorm, 1, 8, DxgiFormat::BC4_SNorm),
            BC5Unorm => (TextureFormat::Bc5RgUnorm, 2, 16, DxgiFormat::BC5_UNorm),
            BC5Snorm => (TextureFormat::Bc5RgSnorm, 2, 16, DxgiFormat::BC5_SNorm),
            BC6HUfloat => (TextureFormat::Bc6hRgbUfloat, 3, 16, DxgiFormat::BC6H_UF16),
            BC6HSfloat => (TextureFormat::Bc6hRgbFloat, 3, 16, DxgiFormat::BC6H_SF16),
            BC7Unorm => (TextureFormat::Bc7RgbaUnorm, 4, 16, DxgiFormat::BC7_UNorm),
            BC7UnormSrgb => (TextureFormat::Bc7RgbaUnormSrgb, 4, 16, DxgiFormat::BC7_UNorm_sRGB),
        };

        FormatDescriptor {
            variant: self,
            storage_format,
            channel_count,
            block_stride,
            view_format: storage_format.remove_srgb_suffix(),
            degamma: self.is_srgb(),
            dxgi_format,
        }
    }

    /// sRGB-tagged sub-variants of the 4-channel formats
    pub fn is_srgb(self) -> bool {
        matches!(
            self,
            FormatVariant::BC1UnormSrgb
                | FormatVariant::BC2UnormSrgb
                | FormatVariant::BC3UnormSrgb
                | FormatVariant::BC7UnormSrgb
        )
    }

    /// Get format name for logging
    pub fn name(self) -> &'static str {
        match self {
            FormatVariant::BC1Unorm => "BC1_UNORM",
            FormatVariant::BC1UnormSrgb => "BC1_UNORM_SRGB",
            FormatVariant::BC2Unorm => "BC2_UNORM",
            FormatVariant::BC2UnormSrgb => "BC2_UNORM_SRGB",
            FormatVariant::BC3Unorm => "BC3_UNORM",
            FormatVariant::BC3UnormSrgb => "BC3_UNORM_SRGB",
            FormatVariant::BC4Unorm => "BC4_UNORM",
            FormatVariant::BC4Snorm => "BC4_SNORM",
            FormatVariant::BC5Unorm => "BC5_UNORM",
            FormatVariant::BC5Snorm => "BC5_SNORM",
            FormatVariant::BC6HUfloat => "BC6H_UF16",
            FormatVariant::BC6HSfloat => "BC6H_SF16",
            FormatVariant::BC7Unorm => "BC7_UNORM",
            FormatVariant::BC7UnormSrgb => "BC7_UNORM_SRGB",
        }
    }
}

impl fmt::Display for FormatVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FormatVariant {
    type Err = UnsupportedFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let variant = match s.to_uppercase().as_str() {
            "BC1" | "BC1_UNORM" | "DXT1" => FormatVariant::BC1Unorm,
            "BC1_UNORM_SRGB" | "BC1_SRGB" => FormatVariant::BC1UnormSrgb,
            "BC2" | "BC2_UNORM" | "DXT3" => FormatVariant::BC2Unorm,
            "BC2_UNORM_SRGB" | "BC2_SRGB" => FormatVariant::BC2UnormSrgb,
            "BC3" | "BC3_UNORM" | "DXT5" => FormatVariant::BC3Unorm,
            "BC3_UNORM_SRGB" | "BC3_SRGB" => FormatVariant::BC3UnormSrgb,
            "BC4" | "BC4_UNORM" | "ATI1" => FormatVariant::BC4Unorm,
            "BC4_SNORM" => FormatVariant::BC4Snorm,
            "BC5" | "BC5_UNORM" | "ATI2" => FormatVariant::BC5Unorm,
            "BC5_SNORM" => FormatVariant::BC5Snorm,
            "BC6H" | "BC6H_UF16" => FormatVariant::BC6HUfloat,
            "BC6H_SF16" => FormatVariant::BC6HSfloat,
            "BC7" | "BC7_UNORM" => FormatVariant::BC7Unorm,
            "BC7_UNORM_SRGB" | "BC7_SRGB" => FormatVariant::BC7UnormSrgb,
            _ => return Err(UnsupportedFormatError(s.to_string())),
        };
        Ok(variant)
    }
}

/// Look up the table entry for a container's compression tag
pub fn lookup(format: ImageFormat) -> Result<FormatDescriptor, UnsupportedFormatError> {
    FormatVariant::from_image_format(format).map(FormatVariant::descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_stride_is_8_only_for_bc1_and_bc4() {
        for variant in FormatVariant::ALL {
            let desc = variant.descriptor();
            assert!(desc.block_stride == 8 || desc.block_stride == 16);
            let expect_8 = matches!(
                variant,
                FormatVariant::BC1Unorm
                    | FormatVariant::BC1UnormSrgb
                    | FormatVariant::BC4Unorm
                    | FormatVariant::BC4Snorm
            );
            assert_eq!(desc.block_stride == 8, expect_8, "{}", variant);
        }
    }

    #[test]
    fn test_stride_matches_storage_format_block_size() {
        for variant in FormatVariant::ALL {
            let desc = variant.descriptor();
            assert_eq!(
                desc.storage_format.block_copy_size(None),
                Some(desc.block_stride),
                "{}",
                variant
            );
            assert_eq!(desc.storage_format.block_dimensions(), (4, 4));
        }
    }

    #[test]
    fn test_degamma_only_for_srgb_variants() {
        let degamma: Vec<_> = FormatVariant::ALL
            .into_iter()
            .filter(|v| v.descriptor().degamma)
            .collect();
        assert_eq!(
            degamma,
            vec![
                FormatVariant::BC1UnormSrgb,
                FormatVariant::BC2UnormSrgb,
                FormatVariant::BC3UnormSrgb,
                FormatVariant::BC7UnormSrgb,
            ]
        );
    }

    #[test]
    fn test_view_format_has_no_srgb_suffix() {
        for variant in FormatVariant::ALL {
            assert!(!variant.descriptor().view_format.is_srgb());
        }
    }

    #[test]
    fn test_channel_counts() {
        assert_eq!(FormatVariant::BC1Unorm.descriptor().channel_count, 4);
        assert_eq!(FormatVariant::BC4Snorm.descriptor().channel_count, 1);
        assert_eq!(FormatVariant::BC5Unorm.descriptor().channel_count, 2);
        assert_eq!(FormatVariant::BC6HSfloat.descriptor().channel_count, 3);
        assert_eq!(FormatVariant::BC7UnormSrgb.descriptor().channel_count, 4);
    }

    #[test]
    fn test_lookup_rejects_uncompressed() {
        let err = lookup(ImageFormat::Rgba8Unorm).unwrap_err();
        assert!(err.to_string().contains("Rgba8Unorm"));
        assert_eq!(
            lookup(ImageFormat::BC6hRgbSfloat).unwrap().variant,
            FormatVariant::BC6HSfloat
        );
    }

    #[test]
    fn test_variant_from_texture_format() {
        for variant in FormatVariant::ALL {
            let desc = variant.descriptor();
            assert_eq!(
                FormatVariant::from_texture_format(desc.storage_format),
                Some(variant)
            );
            assert!(FormatVariant::from_texture_format(desc.view_format).is_some());
        }
        assert_eq!(FormatVariant::from_texture_format(TextureFormat::Rg32Uint), None);
    }

    #[test]
    fn test_variant_from_str() {
        assert_eq!("dxt1".parse::<FormatVariant>().unwrap(), FormatVariant::BC1Unorm);
        assert_eq!(
            "BC7_UNORM_SRGB".parse::<FormatVariant>().unwrap(),
            FormatVariant::BC7UnormSrgb
        );
        assert!("R8G8B8A8".parse::<FormatVariant>().is_err());
        for variant in FormatVariant::ALL {
            assert_eq!(variant.name().parse::<FormatVariant>().unwrap(), variant);
        }
    }
}
