//! Subcommand implementations

pub mod disasm;
pub mod info;
pub mod run;

use anyhow::Context;
use smx_bytecode::PluginImage;
use std::path::Path;

/// Read and load an image file
pub fn load_image(path: &Path) -> anyhow::Result<PluginImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    PluginImage::load(&bytes).with_context(|| format!("failed to load {}", path.display()))
}
