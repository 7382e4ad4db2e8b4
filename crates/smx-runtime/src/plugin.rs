//! Plugin handle
//!
//! A [`Plugin`] pairs an immutable [`PluginImage`] with the [`Machine`]
//! that executes it. Functions are called either with typed [`Value`]
//! arguments, marshalled through the image's type information, or with
//! parameters pushed manually onto a [`Function`].

use crate::error::{CallError, Error};
use crate::marshal::{self, Marshalled};
use crate::natives;
use crate::options::RuntimeOptions;
use crate::param::{Param, ParamList};
use serde::Serialize;
use smx_bytecode::{Cell, FunctionSignature, PluginImage, PluginInfo, Value};
use smx_core::{Fault, Machine, NativeContext, NativeError, NativeParams, NativeRegistry};
use std::path::Path;
use std::sync::Arc;

/// Name of the public run when the image has no `main` entry
pub const PLUGIN_START: &str = "OnPluginStart";

/// A resolved public function with its manual parameter list
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    id: u32,
    address: u32,
    signature: Option<FunctionSignature>,
    params: ParamList,
}

impl Function {
    /// Exported name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index in the public table
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Code address
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Type information, when the image carries it
    pub fn signature(&self) -> Option<&FunctionSignature> {
        self.signature.as_ref()
    }

    /// Manually pushed parameters
    pub fn params(&self) -> &ParamList {
        &self.params
    }

    /// Mutable manual parameters
    pub fn params_mut(&mut self) -> &mut ParamList {
        &mut self.params
    }

    /// Push a plain cell
    pub fn push_cell(&mut self, value: Cell) -> &mut Self {
        self.params.push_cell(value);
        self
    }

    /// Push a float
    pub fn push_float(&mut self, value: f32) -> &mut Self {
        self.params.push_float(value);
        self
    }

    /// Push a cell by reference
    pub fn push_cell_ref(&mut self, value: Cell) -> &mut Self {
        self.params.push_cell_ref(value);
        self
    }

    /// Push a float by reference
    pub fn push_float_ref(&mut self, value: f32) -> &mut Self {
        self.params.push_float_ref(value);
        self
    }

    /// Push a read-only string
    pub fn push_string(&mut self, value: &str) -> &mut Self {
        self.params.push_string(value);
        self
    }

    /// Push a string buffer of `size` bytes
    pub fn push_string_ex(&mut self, value: &[u8], size: u32, copy_back: bool) -> &mut Self {
        self.params.push_string_ex(value, size, copy_back);
        self
    }

    /// Push a cell array
    pub fn push_array(&mut self, cells: &[Cell], copy_back: bool) -> &mut Self {
        self.params.push_array(cells, copy_back);
        self
    }
}

/// Outcome of a call
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// Return value, interpreted through the signature when available
    pub value: Value,
    /// Raw `PRI` at return
    pub raw: Cell,
    /// Argument values after the call, copy-back applied
    pub args: Vec<Value>,
}

/// Exported function as listed by [`Plugin::summary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSummary {
    /// Exported name
    pub name: String,
    /// Code address
    pub address: u32,
    /// Rendered signature, when known
    pub signature: Option<String>,
}

/// Imported native as listed by [`Plugin::summary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeSummary {
    /// Native name
    pub name: String,
    /// Whether the registry has an implementation
    pub bound: bool,
    /// Rendered signature, when the image declares one
    pub signature: Option<String>,
}

/// Overview of a loaded plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    /// Metadata from `myinfo`
    pub info: Option<PluginInfo>,
    /// Code size in bytes
    pub code_size: usize,
    /// Data segment size in bytes
    pub data_size: u32,
    /// Total memory in bytes
    pub mem_size: u32,
    /// Exported functions
    pub publics: Vec<FunctionSummary>,
    /// Imported natives
    pub natives: Vec<NativeSummary>,
}

/// A loaded plugin ready to be called
pub struct Plugin {
    image: Arc<PluginImage>,
    machine: Machine,
    options: RuntimeOptions,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("info", &self.image.info())
            .field("machine", &self.machine)
            .finish()
    }
}

impl Plugin {
    /// Load an image with default options
    pub fn load(bytes: &[u8]) -> Result<Self, Error> {
        Self::load_with(bytes, RuntimeOptions::default())
    }

    /// Load an image
    pub fn load_with(bytes: &[u8], options: RuntimeOptions) -> Result<Self, Error> {
        let image = PluginImage::load(bytes)?;
        Ok(Self::from_image(Arc::new(image), options))
    }

    /// Load an image file with default options
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        log::debug!("loading plugin {}", path.display());
        let bytes = std::fs::read(path)?;
        Self::load(&bytes)
    }

    /// Wrap an already loaded image
    pub fn from_image(image: Arc<PluginImage>, options: RuntimeOptions) -> Self {
        let mut registry = NativeRegistry::new();
        if options.register_std_natives {
            natives::register_std_natives(&mut registry);
        }
        let machine = Machine::with_natives(Arc::clone(&image), options.vm.clone(), registry);
        Self {
            image,
            machine,
            options,
        }
    }

    /// The loaded image
    pub fn image(&self) -> &Arc<PluginImage> {
        &self.image
    }

    /// Plugin metadata, if the image declares it
    pub fn info(&self) -> Option<&PluginInfo> {
        self.image.info()
    }

    /// Options the plugin was created with
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// The executing Machine
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Mutable access to the executing Machine
    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// Native registry; changes apply to later calls
    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        self.machine.natives_mut()
    }

    /// Register a raw native
    pub fn register_native(
        &mut self,
        name: &str,
        func: impl Fn(&mut NativeContext<'_>, &NativeParams) -> Result<Cell, NativeError>
            + Send
            + Sync
            + 'static,
    ) {
        self.machine.register_native(name, func);
    }

    /// Console output gathered so far
    pub fn console_output(&self) -> &str {
        self.machine.console()
    }

    /// Take and clear the console output
    pub fn take_console_output(&mut self) -> String {
        self.machine.take_console()
    }

    /// Resolve a public function by name
    pub fn function(&self, name: &str) -> Result<Function, Error> {
        let public = self
            .image
            .find_public(name)
            .ok_or_else(|| CallError::UnknownFunction(name.to_string()))?;
        self.make_function(public.id)
    }

    /// Resolve a public function by id
    pub fn function_by_id(&self, id: u32) -> Result<Function, Error> {
        self.make_function(id)
    }

    fn make_function(&self, id: u32) -> Result<Function, Error> {
        let public = self
            .image
            .public(id)
            .ok_or(CallError::UnknownFunctionId(id))?;
        let signature = self.image.method_signature(public)?;
        Ok(Function {
            name: public.name.clone(),
            id: public.id,
            address: public.address,
            signature,
            params: ParamList::new(),
        })
    }

    /// Call a public function with typed arguments
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<CallResult, Error> {
        let mut function = self.function(name)?;
        self.call_function(&mut function, args)
    }

    /// Call with the parameters pushed onto `function`
    ///
    /// The pushed parameters are consumed by the call.
    pub fn invoke(&mut self, function: &mut Function) -> Result<CallResult, Error> {
        self.call_function(function, &[])
    }

    /// Call `function` with typed arguments or its pushed parameters
    pub fn call_function(
        &mut self,
        function: &mut Function,
        args: &[Value],
    ) -> Result<CallResult, Error> {
        if !function.params.is_empty() {
            if !args.is_empty() {
                return Err(CallError::MixedArguments(function.name.clone()).into());
            }
            let params = std::mem::take(&mut function.params);
            let (raw, values, _) = self.execute(function, params, None)?;
            return Ok(CallResult {
                value: Value::Int(raw),
                raw,
                args: values,
            });
        }

        let marshalled = match &function.signature {
            Some(signature) => marshal::marshal_typed(&function.name, signature, args)?,
            None if self.options.require_signatures => {
                return Err(CallError::MissingSignature(function.name.clone()).into())
            }
            None => marshal::marshal_untyped(&function.name, args)?,
        };
        let Marshalled {
            params,
            return_buffer,
        } = marshalled;

        let (raw, values, returned) = self.execute(function, params, return_buffer)?;
        let value = match (&function.signature, returned) {
            (_, Some(value)) => value,
            (Some(signature), None) => {
                marshal::return_value(&signature.return_type, raw, self.machine.memory())?
            }
            (None, None) => Value::Int(raw),
        };
        Ok(CallResult {
            value,
            raw,
            args: values,
        })
    }

    /// Run the image entry point
    ///
    /// Executes `main` when the image sets one, otherwise the
    /// `OnPluginStart` public. Returns `None` when neither exists.
    pub fn run(&mut self) -> Result<Option<Cell>, Error> {
        let entry = match self.image.main() {
            0 => self.image.find_public(PLUGIN_START).map(|p| p.address),
            main => Some(main),
        };
        let Some(addr) = entry else {
            log::debug!("plugin has no entry point");
            return Ok(None);
        };
        let function = Function {
            name: self
                .image
                .lookup_function(addr)
                .unwrap_or(PLUGIN_START)
                .to_string(),
            id: 0,
            address: addr,
            signature: None,
            params: ParamList::new(),
        };
        let (raw, _, _) = self.execute(&function, ParamList::new(), None)?;
        Ok(Some(raw))
    }

    /// Save state, place buffers, execute, copy back, release, restore
    ///
    /// `return_buffer` holds the single buffer of a fixed-array return. It
    /// is allocated after the arguments and its value is handed back
    /// separately.
    fn execute(
        &mut self,
        function: &Function,
        mut params: ParamList,
        mut return_buffer: Option<ParamList>,
    ) -> Result<(Cell, Vec<Value>, Option<Value>), Error> {
        log::debug!(
            "calling {} at {:#x} with {} params",
            function.name,
            function.address,
            params.len()
        );
        let machine = &mut self.machine;
        machine.init();
        let saved = machine.save_state();
        let result = match allocate_all(machine, &mut params, return_buffer.as_mut()) {
            Ok(buffer) => {
                let cells = params.stack_cells();
                let result = match buffer {
                    Some(addr) => machine.invoke_with_buffer(function.address, &cells, addr),
                    None => machine.invoke(function.address, &cells),
                };
                let returned = return_buffer
                    .as_mut()
                    .and_then(|buffer| buffer.finish(machine).pop());
                let values = params.finish(machine);
                result
                    .map(|raw| (raw, values, returned))
                    .map_err(Error::from)
            }
            Err(fault) => Err(Error::from(machine.runtime_error(fault, function.address, None))),
        };
        machine.restore_state(saved);
        if let Err(err) = &result {
            log::debug!("call to {} failed: {err}", function.name);
        }
        result
    }

    /// Overview of publics, natives and metadata
    pub fn summary(&self) -> PluginSummary {
        let publics = self
            .image
            .publics()
            .iter()
            .map(|public| FunctionSummary {
                name: public.name.clone(),
                address: public.address,
                signature: self
                    .image
                    .method_signature(public)
                    .ok()
                    .flatten()
                    .map(|sig| sig.to_string()),
            })
            .collect();
        let natives = self
            .image
            .natives()
            .iter()
            .enumerate()
            .map(|(index, name)| NativeSummary {
                name: name.clone(),
                bound: self.machine.natives().contains(name),
                signature: self
                    .image
                    .native_signature(index as u32)
                    .ok()
                    .flatten()
                    .map(|sig| sig.to_string()),
            })
            .collect();
        PluginSummary {
            info: self.image.info().cloned(),
            code_size: self.image.code().len(),
            data_size: self.image.data_size(),
            mem_size: self.image.mem_size(),
            publics,
            natives,
        }
    }
}

/// Allocate the argument buffers, then the return buffer
///
/// Returns the address of the return buffer, if any.
fn allocate_all(
    machine: &mut Machine,
    params: &mut ParamList,
    return_buffer: Option<&mut ParamList>,
) -> Result<Option<Cell>, Fault> {
    params.allocate(machine)?;
    let Some(buffer) = return_buffer else {
        return Ok(None);
    };
    if let Err(fault) = buffer.allocate(machine) {
        params.finish(machine);
        return Err(fault);
    }
    Ok(buffer.params().first().and_then(Param::address))
}
