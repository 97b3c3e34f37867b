//! SPIR-V loading and shader module creation.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use ash::vk;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Reinterpret little-endian bytes as SPIR-V words.
///
/// Fails when the length is not a multiple of four. The input does not need
/// to be aligned.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(GpuError::InvalidShaderBinary { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

impl DeviceContext {
    /// Create a shader module from raw SPIR-V bytes, e.g. a file loaded
    /// with `vkh_platform::load_binary_file`.
    pub fn create_shader_module(&self, bytes: &[u8]) -> Result<vk::ShaderModule> {
        let words = spirv_words(bytes)?;
        if words.first() != Some(&SPIRV_MAGIC) {
            tracing::warn!("Shader binary of {} bytes lacks the SPIR-V magic number", bytes.len());
        }

        let shader_info = vk::ShaderModuleCreateInfo::default().code(&words);
        unsafe {
            self.device
                .create_shader_module(&shader_info, None)
                .map_err(GpuError::step("create shader module"))
        }
    }

    /// Destroy a module once no pipeline creation still needs it.
    pub fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn unaligned_lengths_are_rejected() {
        for len in [1usize, 2, 3, 5, 7] {
            let bytes = vec![0u8; len];
            assert!(matches!(
                spirv_words(&bytes),
                Err(GpuError::InvalidShaderBinary { len: l }) if l == len
            ));
        }
    }

    #[test]
    fn empty_input_is_empty_code() {
        assert!(spirv_words(&[]).unwrap().is_empty());
    }

    #[test]
    fn offset_slices_decode_the_same() {
        let backing = [0xAAu8, 0x03, 0x02, 0x23, 0x07];
        assert_eq!(spirv_words(&backing[1..]).unwrap(), vec![SPIRV_MAGIC]);
    }
}
