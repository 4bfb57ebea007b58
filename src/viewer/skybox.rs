//! Equirectangular environment loading for `_SkyboxTexture`.

use std::path::Path;

use image::{GenericImageView, ImageReader};

/// Decode an HDR/EXR (or any format `image` knows) into linear RGBA32F texels.
pub fn load(path: &Path) -> anyhow::Result<(u32, u32, Vec<[f32; 4]>)> {
    let img = ImageReader::open(path)?.decode()?;
    let (width, height) = img.dimensions();
    let rgba = img.to_rgba32f();
    let texels = rgba
        .as_raw()
        .chunks_exact(4)
        .map(|px| [px[0], px[1], px[2], 1.0])
        .collect();
    Ok((width, height, texels))
}
