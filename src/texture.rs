//! Texture-set handle.
//!
//! The defragmenter never touches texel data; it only needs the pixel
//! dimensions of the input textures to size packing containers and to reason
//! about UV-to-texel scale.

/// Pixel dimensions of the texture images behind an atlas.
#[derive(Debug, Clone)]
pub struct TextureSet {
    sizes: Vec<(u32, u32)>,
}

impl TextureSet {
    /// Create a handle from per-image `(width, height)` pixel sizes.
    pub fn new(sizes: Vec<(u32, u32)>) -> Self {
        Self { sizes }
    }

    /// A single-texture set, the common case.
    pub fn single(width: u32, height: u32) -> Self {
        Self { sizes: vec![(width, height)] }
    }

    /// Number of textures.
    #[inline]
    pub fn num_textures(&self) -> usize {
        self.sizes.len()
    }

    /// Pixel size of texture `i`.
    #[inline]
    pub fn size(&self, i: usize) -> (u32, u32) {
        self.sizes[i]
    }

    /// The largest pixel size in the set, used to size output containers.
    pub fn max_size(&self) -> Option<(u32, u32)> {
        self.sizes
            .iter()
            .copied()
            .max_by_key(|&(w, h)| (w as u64) * (h as u64))
    }
}
