//! `smx run` - execute a plugin entry point or public function

use super::load_image;
use anyhow::Context;
use smx_core::{ResourceLimits, VmOptions};
use smx_runtime::{Plugin, RuntimeOptions, Value};
use std::path::PathBuf;
use std::sync::Arc;

pub struct RunArgs {
    pub file: PathBuf,
    pub function: Option<String>,
    pub args: Vec<String>,
    pub step_budget: Option<u64>,
}

pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let image = load_image(&args.file)?;

    let limits = args
        .step_budget
        .map(ResourceLimits::with_step_budget)
        .unwrap_or_default();
    let options = RuntimeOptions::with_vm(VmOptions::with_limits(limits));
    let mut plugin = Plugin::from_image(Arc::new(image), options);

    let outcome = match &args.function {
        Some(name) => {
            let values: Vec<Value> = args.args.iter().map(|arg| parse_arg(arg)).collect();
            plugin
                .call(name, &values)
                .map(|result| Some(result.value))
                .with_context(|| format!("call to '{name}' failed"))
        }
        None => {
            if !args.args.is_empty() {
                log::warn!("--arg is ignored without --function");
            }
            plugin
                .run()
                .map(|raw| raw.map(Value::Int))
                .context("plugin entry point failed")
        }
    };

    // Output gathered before a failure is still shown
    print!("{}", plugin.take_console_output());

    match outcome? {
        Some(value) => println!("=> {value}"),
        None => println!("(no entry point)"),
    }
    Ok(())
}

/// Interpret a command-line argument as an int, a float or a string
fn parse_arg(text: &str) -> Value {
    if let Ok(value) = text.parse::<i32>() {
        return Value::Int(value);
    }
    if text.contains(['.', 'e', 'E']) {
        if let Ok(value) = text.parse::<f32>() {
            return Value::Float(value);
        }
    }
    Value::String(text.to_string())
}
