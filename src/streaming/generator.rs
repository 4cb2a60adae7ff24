//! Procedural block generation, used when the stream has no saved data.

use cgmath::Point3;
use noise::{NoiseFn, Perlin};

use crate::math::block_to_voxel_po2;
use crate::voxel::{VoxelBuffer, AIR_VOXEL};

/// Produces voxel data for positions the backing stream has never seen.
pub trait VoxelGenerator: Send + Sync {
    /// Generates the data block at `position` (data-block coordinates).
    fn generate(&self, position: Point3<i32>, block_size_po2: u32) -> VoxelBuffer;
}

/// Generator that fills every block with a single value.
///
/// With [`AIR_VOXEL`] this is the empty-world generator used by tests.
pub struct UniformGenerator {
    value: u16,
}

impl UniformGenerator {
    /// Creates a generator producing blocks filled with `value`.
    pub fn new(value: u16) -> Self {
        UniformGenerator { value }
    }

    /// Generator producing only air.
    pub fn air() -> Self {
        Self::new(AIR_VOXEL)
    }
}

impl VoxelGenerator for UniformGenerator {
    fn generate(&self, _position: Point3<i32>, block_size_po2: u32) -> VoxelBuffer {
        VoxelBuffer::filled(block_size_po2, self.value)
    }
}

/// Threshold above which Perlin noise is considered solid.
pub const PERLIN_POSITIVE_THRESHOLD: f64 = 0.2;
/// Threshold below which Perlin noise is considered solid.
pub const PERLIN_NEGATIVE_THRESHOLD: f64 = -0.2;
/// Scaling factor applied to voxel coordinates when sampling the noise.
pub const PERLIN_SCALE_FACTOR: f64 = 0.02;

/// Perlin-noise terrain generator.
///
/// Samples 3D Perlin noise per voxel and marks a voxel solid when the sample
/// falls outside the `[negative, positive]` threshold band, which yields
/// cave-like natural terrain.
pub struct NoiseGenerator {
    perlin: Perlin,
    solid_value: u16,
}

impl NoiseGenerator {
    /// Creates a generator from a world seed.
    pub fn new(seed: u32, solid_value: u16) -> Self {
        NoiseGenerator {
            perlin: Perlin::new(seed),
            solid_value,
        }
    }

    fn to_perlin_pos(pos: Point3<i32>) -> [f64; 3] {
        [
            pos.x as f64 * PERLIN_SCALE_FACTOR,
            pos.y as f64 * PERLIN_SCALE_FACTOR,
            pos.z as f64 * PERLIN_SCALE_FACTOR,
        ]
    }
}

impl VoxelGenerator for NoiseGenerator {
    fn generate(&self, position: Point3<i32>, block_size_po2: u32) -> VoxelBuffer {
        let mut voxels = VoxelBuffer::new(block_size_po2);
        let origin = block_to_voxel_po2(position, block_size_po2);
        let side = voxels.size();

        for k in 0..side {
            for j in 0..side {
                for i in 0..side {
                    let sample = self.perlin.get(Self::to_perlin_pos(Point3::new(
                        origin.x + i,
                        origin.y + j,
                        origin.z + k,
                    )));
                    if !(PERLIN_NEGATIVE_THRESHOLD..=PERLIN_POSITIVE_THRESHOLD).contains(&sample) {
                        voxels.set_voxel(Point3::new(i, j, k), self.solid_value);
                    }
                }
            }
        }

        voxels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_generator_fills() {
        let gen = UniformGenerator::new(5);
        let voxels = gen.generate(Point3::new(0, 0, 0), 3);
        assert_eq!(voxels.uniform_value(), Some(5));
    }

    #[test]
    fn noise_generator_is_deterministic() {
        let a = NoiseGenerator::new(7, 1).generate(Point3::new(2, -1, 0), 4);
        let b = NoiseGenerator::new(7, 1).generate(Point3::new(2, -1, 0), 4);
        assert_eq!(a, b);
    }
}
