// SPIR-V shader module loading
//
// Bytecode is loaded from disk at startup; SPIR-V is a stream of 32-bit
// words, so the byte length must be a multiple of 4.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanContext;

pub fn load(ctx: &VulkanContext, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader file {:?}", path))?;
    anyhow::ensure!(
        bytes.len() % 4 == 0,
        "Shader {:?} is {} bytes, not a multiple of 4",
        path,
        bytes.len()
    );

    let code = ash::util::read_spv(&mut Cursor::new(&bytes))
        .with_context(|| format!("Shader {:?} is not valid SPIR-V", path))?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    unsafe { ctx.device.create_shader_module(&create_info, None) }
        .with_context(|| format!("Failed to create shader module from {:?}", path))
}

pub fn destroy(ctx: &VulkanContext, module: vk::ShaderModule) {
    unsafe {
        ctx.device.destroy_shader_module(module, None);
    }
}
