//! `smx info` - display plugin metadata, publics and natives

use super::load_image;
use smx_runtime::{Plugin, PluginSummary, RuntimeOptions};
use std::path::Path;
use std::sync::Arc;

pub fn execute(path: &Path, json: bool) -> anyhow::Result<()> {
    let image = load_image(path)?;
    let plugin = Plugin::from_image(Arc::new(image), RuntimeOptions::default());
    let summary = plugin.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(path, &summary);
    }
    Ok(())
}

fn print_summary(path: &Path, summary: &PluginSummary) {
    println!("File:         {}", path.display());
    if let Some(info) = &summary.info {
        println!("Name:         {}", info.name);
        println!("Author:       {}", info.author);
        println!("Version:      {}", info.version);
        if !info.description.is_empty() {
            println!("Description:  {}", info.description);
        }
        if !info.url.is_empty() {
            println!("URL:          {}", info.url);
        }
    }
    println!(
        "Code:         {} bytes, data {} bytes, memory {} bytes",
        summary.code_size, summary.data_size, summary.mem_size
    );

    println!();
    println!("Publics ({}):", summary.publics.len());
    for public in &summary.publics {
        match &public.signature {
            Some(signature) => println!("  {:08x}  {} {}", public.address, public.name, signature),
            None => println!("  {:08x}  {}", public.address, public.name),
        }
    }

    println!();
    println!("Natives ({}):", summary.natives.len());
    for (index, native) in summary.natives.iter().enumerate() {
        let status = if native.bound { "" } else { "  (unbound)" };
        match &native.signature {
            Some(signature) => println!("  {index:4}  {} {signature}{status}", native.name),
            None => println!("  {index:4}  {}{status}", native.name),
        }
    }
}
