//! Loading the compiled ray tracing shader blobs.

use std::fs::File;
use std::path::Path;

use anyhow::Context;
use voxray_rt::ShaderSet;

/// File names expected inside the shader directory.
pub const RAYGEN_SHADER: &str = "raygen.spv";
pub const MISS_SHADER: &str = "miss.spv";
pub const CLOSEST_HIT_SHADER: &str = "closest_hit.spv";
pub const INTERSECTION_SHADER: &str = "intersection.spv";

fn load_spirv(dir: &Path, name: &str) -> anyhow::Result<Vec<u32>> {
    let path = dir.join(name);
    let mut file =
        File::open(&path).with_context(|| format!("Failed to open shader {}", path.display()))?;
    ash::util::read_spv(&mut file)
        .with_context(|| format!("Invalid SPIR-V in {}", path.display()))
}

/// Read the four stages from `dir`. Contents are only checked for SPIR-V
/// framing; the driver validates them at module creation.
pub fn load_shader_set(dir: &Path) -> anyhow::Result<ShaderSet> {
    let shaders = ShaderSet {
        raygen: load_spirv(dir, RAYGEN_SHADER)?,
        miss: load_spirv(dir, MISS_SHADER)?,
        closest_hit: load_spirv(dir, CLOSEST_HIT_SHADER)?,
        intersection: load_spirv(dir, INTERSECTION_SHADER)?,
    };
    tracing::debug!(dir = %dir.display(), "Ray tracing shaders loaded");
    Ok(shaders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("voxray-shaders-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_words(path: &Path, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn loads_all_stages() {
        let dir = scratch_dir("ok");
        for (i, name) in [RAYGEN_SHADER, MISS_SHADER, CLOSEST_HIT_SHADER, INTERSECTION_SHADER]
            .into_iter()
            .enumerate()
        {
            write_words(&dir.join(name), &[SPIRV_MAGIC, 0x0001_0500, i as u32]);
        }

        let shaders = load_shader_set(&dir).unwrap();
        assert_eq!(shaders.raygen[2], 0);
        assert_eq!(shaders.miss[2], 1);
        assert_eq!(shaders.closest_hit[2], 2);
        assert_eq!(shaders.intersection[2], 3);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_stage_names_the_file() {
        let dir = scratch_dir("missing");
        write_words(&dir.join(RAYGEN_SHADER), &[SPIRV_MAGIC, 0]);

        let err = load_shader_set(&dir).unwrap_err();
        assert!(format!("{err:#}").contains(MISS_SHADER));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn rejects_truncated_blob() {
        let dir = scratch_dir("truncated");
        std::fs::write(dir.join(RAYGEN_SHADER), [0x03, 0x02, 0x23]).unwrap();

        assert!(load_spirv(&dir, RAYGEN_SHADER).is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
