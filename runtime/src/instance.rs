//! Module instances and the linker that builds them.
//!
//! `Store` stands in for the instantiation subsystem: it resolves function
//! imports by `(module, name)`, allocates memory/table/globals, reserves a
//! registry address for every local function and registers the bodies.
//! The interpreter only ever reads instances built here.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::executor::Interpreter;
use crate::interpreter::{GlobalValue, Table, TrapError, WasmValue};
use crate::memory::LinearMemory;
use crate::module::{ExportKind, FunctionType, Module};
use crate::registry::{FunctionAddress, FunctionKind, FunctionRegistry, GuestBody, HostFunc};
use crate::{RuntimeConfig, RuntimeError};

/// Resolved export of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternVal {
    Function(FunctionAddress),
    Table,
    Memory,
    Global(u32),
}

/// Runtime state of one instantiated module.
///
/// Memory, table and globals are shared by every call chain executing
/// against this instance. Each accessor locks for the duration of a single
/// access only; whether concurrent chains may use one instance at all is
/// up to the embedder.
pub struct ModuleInstance {
    name: String,
    memory: Option<Arc<Mutex<LinearMemory>>>,
    table: Mutex<Option<Table>>,
    globals: Mutex<Vec<GlobalValue>>,
    types: Vec<FunctionType>,
    functions: Vec<FunctionAddress>,
    exports: BTreeMap<String, ExternVal>,
}

impl ModuleInstance {
    /// An instance with no state at all.
    pub fn empty(name: &str) -> Self {
        ModuleInstance {
            name: String::from(name),
            memory: None,
            table: Mutex::new(None),
            globals: Mutex::new(Vec::new()),
            types: Vec::new(),
            functions: Vec::new(),
            exports: BTreeMap::new(),
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Linear memory, if the module has one.
    pub fn memory(&self) -> Option<&Arc<Mutex<LinearMemory>>> {
        self.memory.as_ref()
    }

    /// Linear memory or a `NoMemory` trap.
    pub fn require_memory(&self) -> Result<&Arc<Mutex<LinearMemory>>, TrapError> {
        self.memory.as_ref().ok_or(TrapError::NoMemory)
    }

    /// Read a global.
    pub fn global(&self, idx: u32) -> Result<WasmValue, TrapError> {
        self.globals
            .lock()
            .get(idx as usize)
            .map(|g| g.value)
            .ok_or(TrapError::InvalidGlobal(idx))
    }

    /// Write a mutable global; the value must keep the global's type.
    pub fn set_global(&self, idx: u32, value: WasmValue) -> Result<(), TrapError> {
        let mut globals = self.globals.lock();
        let global = globals
            .get_mut(idx as usize)
            .ok_or(TrapError::InvalidGlobal(idx))?;
        if !global.mutable {
            return Err(TrapError::InvalidGlobal(idx));
        }
        if global.value.value_type() != value.value_type() {
            return Err(TrapError::TypeMismatch {
                expected: global.value.value_type(),
                got: value.value_type(),
            });
        }
        global.value = value;
        Ok(())
    }

    /// Number of globals.
    pub fn global_count(&self) -> usize {
        self.globals.lock().len()
    }

    /// Read a table element.
    pub fn table_get(&self, index: u32) -> Result<Option<FunctionAddress>, TrapError> {
        match self.table.lock().as_ref() {
            Some(table) => table.get(index),
            None => Err(TrapError::UndefinedElement { index }),
        }
    }

    /// Write a table element.
    pub fn table_set(&self, index: u32, value: Option<FunctionAddress>) -> Result<(), TrapError> {
        match self.table.lock().as_mut() {
            Some(table) => table.set(index, value),
            None => Err(TrapError::UndefinedElement { index }),
        }
    }

    /// Table size (0 without a table).
    pub fn table_size(&self) -> u32 {
        self.table.lock().as_ref().map_or(0, |t| t.size())
    }

    /// Signature at a type index.
    pub fn func_type(&self, type_idx: u32) -> Option<&FunctionType> {
        self.types.get(type_idx as usize)
    }

    /// Address of a function in this module's index space.
    pub fn function_address(&self, func_idx: u32) -> Option<FunctionAddress> {
        self.functions.get(func_idx as usize).copied()
    }

    /// Find an export by name.
    pub fn export(&self, name: &str) -> Option<ExternVal> {
        self.exports.get(name).copied()
    }

    /// Address of an exported function.
    pub fn exported_function(&self, name: &str) -> Result<FunctionAddress, TrapError> {
        match self.export(name) {
            Some(ExternVal::Function(addr)) => Ok(addr),
            _ => Err(TrapError::ExportNotFound(String::from(name))),
        }
    }
}

impl core::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field("has_memory", &self.memory.is_some())
            .field("functions", &self.functions.len())
            .finish()
    }
}

// ============================================================================
// Host modules
// ============================================================================

/// A set of host functions (and optionally a memory) registered under one
/// module name.
#[derive(Default)]
pub struct HostModule {
    functions: Vec<(String, FunctionType, HostFunc)>,
    memory: Option<LinearMemory>,
    globals: Vec<GlobalValue>,
}

impl HostModule {
    /// Create an empty host module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host function export.
    pub fn add_function(&mut self, name: &str, signature: FunctionType, func: HostFunc) -> &mut Self {
        self.functions.push((String::from(name), signature, func));
        self
    }

    /// Give the host module its own memory (exported as "memory").
    pub fn with_memory(&mut self, memory: LinearMemory) -> &mut Self {
        self.memory = Some(memory);
        self
    }

    /// Add a global.
    pub fn add_global(&mut self, value: WasmValue, mutable: bool) -> &mut Self {
        self.globals.push(GlobalValue { value, mutable });
        self
    }
}

// ============================================================================
// Store (linker)
// ============================================================================

/// Instances by name plus the registry they share.
pub struct Store {
    registry: Arc<FunctionRegistry>,
    modules: BTreeMap<String, Arc<ModuleInstance>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(FunctionRegistry::new()))
    }

    /// Create an empty store registering into `registry`.
    pub fn with_registry(registry: Arc<FunctionRegistry>) -> Self {
        Store {
            registry,
            modules: BTreeMap::new(),
        }
    }

    /// Registry shared by every instance in this store.
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Look up an instance by name.
    pub fn module(&self, name: &str) -> Option<&Arc<ModuleInstance>> {
        self.modules.get(name)
    }

    /// Interpreter reading this store's registry with the default config.
    pub fn interpreter(&self) -> Interpreter {
        Interpreter::new(self.registry.clone())
    }

    /// Interpreter with a custom config.
    pub fn interpreter_with_config(&self, config: &RuntimeConfig) -> Interpreter {
        Interpreter::with_config(self.registry.clone(), config)
    }

    /// Register a host module. Its functions are owned by this new instance.
    pub fn define_host_module(
        &mut self,
        name: &str,
        host: HostModule,
    ) -> Result<Arc<ModuleInstance>, RuntimeError> {
        self.check_name_free(name)?;
        self.check_capacity(name, host.functions.len())?;

        let first = self.registry.next_address().0;
        let mut exports = BTreeMap::new();
        let mut functions = Vec::with_capacity(host.functions.len());
        for (i, (fname, _, _)) in host.functions.iter().enumerate() {
            let addr = FunctionAddress(first + i as u32);
            functions.push(addr);
            exports.insert(fname.clone(), ExternVal::Function(addr));
        }
        if host.memory.is_some() {
            exports.insert(String::from("memory"), ExternVal::Memory);
        }

        let instance = Arc::new(ModuleInstance {
            name: String::from(name),
            memory: host.memory.map(|m| Arc::new(Mutex::new(m))),
            table: Mutex::new(None),
            globals: Mutex::new(host.globals),
            types: host.functions.iter().map(|(_, sig, _)| sig.clone()).collect(),
            functions,
            exports,
        });

        for (i, (fname, sig, func)) in host.functions.into_iter().enumerate() {
            let addr = self.registry.register(
                sig,
                FunctionKind::Host(func),
                instance.clone(),
                alloc::format!("{}.{}", name, fname),
            )?;
            Self::check_reserved(addr, first + i as u32)?;
        }

        log::debug!(
            "[KPIO Interp] defined host module '{}' ({} functions)",
            name,
            instance.functions.len()
        );
        self.modules.insert(String::from(name), instance.clone());
        Ok(instance)
    }

    /// Link and instantiate a validated guest module.
    pub fn instantiate(&mut self, module: &Module) -> Result<Arc<ModuleInstance>, RuntimeError> {
        self.check_name_free(&module.name)?;
        if module.code.len() != module.functions.len() {
            return Err(RuntimeError::InstantiationError(alloc::format!(
                "{}: {} function declarations but {} bodies",
                module.name,
                module.functions.len(),
                module.code.len()
            )));
        }

        // Everything that can fail is resolved before the first registration:
        // registry entries are permanent.
        let import_count = module.imports.len() as u32;
        let mut prepared = Vec::with_capacity(module.functions.len());
        for (i, (type_idx, body)) in module.functions.iter().zip(&module.code).enumerate() {
            let signature = module.types.get(*type_idx as usize).cloned().ok_or_else(|| {
                RuntimeError::InstantiationError(alloc::format!("unknown type index {}", type_idx))
            })?;
            let func_idx = import_count + i as u32;
            let name = module
                .exports
                .iter()
                .find(|e| e.kind == ExportKind::Function && e.index == func_idx)
                .map(|e| alloc::format!("{}.{}", module.name, e.name))
                .unwrap_or_else(|| alloc::format!("{}[{}]", module.name, func_idx));
            prepared.push((signature, Arc::new(GuestBody::new(body)), name));
        }
        self.check_capacity(&module.name, prepared.len())?;

        // Imports come first in the function index space.
        let mut functions = Vec::with_capacity(module.total_function_count());
        for import in &module.imports {
            let addr = self.resolve_import(module, &import.module, &import.name, import.type_idx)?;
            functions.push(addr);
        }

        let first = self.registry.next_address().0;
        for i in 0..module.functions.len() {
            functions.push(FunctionAddress(first + i as u32));
        }

        let memory = match &module.memory {
            Some(mt) => Some(Arc::new(Mutex::new(LinearMemory::new(mt.min, mt.max)?))),
            None => None,
        };

        let table = match &module.table {
            Some(tt) => {
                let mut table = Table::new(tt.min, tt.max);
                for elem in &module.elements {
                    for (i, func_idx) in elem.func_indices.iter().enumerate() {
                        let addr = functions.get(*func_idx as usize).copied().ok_or_else(|| {
                            RuntimeError::InstantiationError(alloc::format!(
                                "element references unknown function {}",
                                func_idx
                            ))
                        })?;
                        table
                            .set(elem.offset + i as u32, Some(addr))
                            .map_err(|e| RuntimeError::InstantiationError(alloc::format!("{}", e)))?;
                    }
                }
                Some(table)
            }
            None => None,
        };

        let globals = module
            .globals
            .iter()
            .map(|g| GlobalValue {
                value: g.init,
                mutable: g.mutable,
            })
            .collect();

        let mut exports = BTreeMap::new();
        for export in &module.exports {
            let val = match export.kind {
                ExportKind::Function => {
                    ExternVal::Function(functions.get(export.index as usize).copied().ok_or_else(
                        || {
                            RuntimeError::InstantiationError(alloc::format!(
                                "export '{}' references unknown function {}",
                                export.name,
                                export.index
                            ))
                        },
                    )?)
                }
                ExportKind::Table => ExternVal::Table,
                ExportKind::Memory => ExternVal::Memory,
                ExportKind::Global => ExternVal::Global(export.index),
            };
            exports.insert(export.name.clone(), val);
        }

        let instance = Arc::new(ModuleInstance {
            name: module.name.clone(),
            memory,
            table: Mutex::new(table),
            globals: Mutex::new(globals),
            types: module.types.clone(),
            functions,
            exports,
        });

        for (i, (signature, body, name)) in prepared.into_iter().enumerate() {
            let addr =
                self.registry
                    .register(signature, FunctionKind::Guest(body), instance.clone(), name)?;
            Self::check_reserved(addr, first + i as u32)?;
        }

        log::debug!(
            "[KPIO Interp] instantiated '{}' ({} imports, {} functions)",
            module.name,
            module.imports.len(),
            module.functions.len()
        );
        self.modules.insert(module.name.clone(), instance.clone());
        Ok(instance)
    }

    fn resolve_import(
        &self,
        module: &Module,
        import_module: &str,
        import_name: &str,
        type_idx: u32,
    ) -> Result<FunctionAddress, RuntimeError> {
        let unresolved = || {
            RuntimeError::InstantiationError(alloc::format!(
                "unresolved import {}.{}",
                import_module,
                import_name
            ))
        };
        let provider = self.modules.get(import_module).ok_or_else(unresolved)?;
        let addr = match provider.export(import_name) {
            Some(ExternVal::Function(addr)) => addr,
            _ => return Err(unresolved()),
        };
        let expected = module.types.get(type_idx as usize).ok_or_else(|| {
            RuntimeError::InstantiationError(alloc::format!("unknown type index {}", type_idx))
        })?;
        let entry = self
            .registry
            .lookup(addr)
            .map_err(|e| RuntimeError::InstantiationError(alloc::format!("{}", e)))?;
        if &entry.signature != expected {
            return Err(RuntimeError::InstantiationError(alloc::format!(
                "import {}.{} signature mismatch",
                import_module,
                import_name
            )));
        }
        Ok(addr)
    }

    fn check_name_free(&self, name: &str) -> Result<(), RuntimeError> {
        if self.modules.contains_key(name) {
            return Err(RuntimeError::InstantiationError(alloc::format!(
                "module '{}' already instantiated",
                name
            )));
        }
        Ok(())
    }

    fn check_capacity(&self, name: &str, count: usize) -> Result<(), RuntimeError> {
        if count > self.registry.remaining() {
            return Err(RuntimeError::InstantiationError(alloc::format!(
                "{}: {} functions exceed the remaining registry capacity of {}",
                name,
                count,
                self.registry.remaining()
            )));
        }
        Ok(())
    }

    fn check_reserved(got: FunctionAddress, reserved: u32) -> Result<(), RuntimeError> {
        if got.0 != reserved {
            return Err(RuntimeError::InstantiationError(alloc::format!(
                "registry modified during instantiation: expected address {}, got {}",
                reserved,
                got.0
            )));
        }
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Element, Export, FunctionBody, Global, Import, MemoryType, TableType, ValueType};
    use crate::opcodes::Instruction::*;
    use alloc::vec;

    fn host_env(store: &mut Store) -> Arc<ModuleInstance> {
        let mut env = HostModule::new();
        env.add_function(
            "double",
            FunctionType::new(&[ValueType::I32], &[ValueType::I32]),
            HostFunc::no_context(|args| {
                let v = args[0].as_i32().unwrap_or(0);
                Ok(vec![WasmValue::I32(v * 2)])
            }),
        )
        .with_memory(LinearMemory::new(1, None).unwrap());
        store.define_host_module("env", env).unwrap()
    }

    #[test]
    fn test_host_module_exports() {
        let mut store = Store::new();
        let env = host_env(&mut store);
        assert_eq!(env.name(), "env");
        assert!(env.memory().is_some());
        assert_eq!(env.export("memory"), Some(ExternVal::Memory));
        let addr = env.exported_function("double").unwrap();
        let entry = store.registry().lookup(addr).unwrap();
        assert_eq!(entry.name, "env.double");
        assert!(Arc::ptr_eq(&entry.module, &env));
    }

    #[test]
    fn test_instantiate_links_imports_and_table() {
        let mut store = Store::new();
        let env = host_env(&mut store);
        let sig = FunctionType::new(&[ValueType::I32], &[ValueType::I32]);
        let module = Module {
            name: String::from("app"),
            types: vec![sig],
            imports: vec![Import {
                module: String::from("env"),
                name: String::from("double"),
                type_idx: 0,
            }],
            functions: vec![0],
            code: vec![FunctionBody::new(vec![], vec![LocalGet(0), Call(0), End])],
            memory: Some(MemoryType { min: 1, max: None }),
            table: Some(TableType { min: 2, max: None }),
            globals: vec![Global {
                init: WasmValue::I32(5),
                mutable: true,
            }],
            elements: vec![Element {
                offset: 1,
                func_indices: vec![1],
            }],
            exports: vec![Export {
                name: String::from("run"),
                kind: ExportKind::Function,
                index: 1,
            }],
        };
        let app = store.instantiate(&module).unwrap();

        let imported = env.exported_function("double").unwrap();
        assert_eq!(app.function_address(0), Some(imported));
        let run = app.exported_function("run").unwrap();
        assert_eq!(app.function_address(1), Some(run));
        assert_eq!(app.table_get(0), Ok(None));
        assert_eq!(app.table_get(1), Ok(Some(run)));
        assert_eq!(app.table_size(), 2);
        assert_eq!(app.global(0), Ok(WasmValue::I32(5)));
        assert_eq!(store.registry().lookup(run).unwrap().name, "app.run");
        assert!(!Arc::ptr_eq(app.memory().unwrap(), env.memory().unwrap()));
    }

    #[test]
    fn test_unresolved_import_fails() {
        let mut store = Store::new();
        let mut module = Module::named("app");
        module.types.push(FunctionType::default());
        module.imports.push(Import {
            module: String::from("env"),
            name: String::from("missing"),
            type_idx: 0,
        });
        assert!(matches!(
            store.instantiate(&module),
            Err(RuntimeError::InstantiationError(_))
        ));
        assert!(store.module("app").is_none());
    }

    #[test]
    fn test_import_signature_mismatch_fails() {
        let mut store = Store::new();
        host_env(&mut store);
        let mut module = Module::named("app");
        module.types.push(FunctionType::default());
        module.imports.push(Import {
            module: String::from("env"),
            name: String::from("double"),
            type_idx: 0,
        });
        assert!(store.instantiate(&module).is_err());
    }

    #[test]
    fn test_failed_instantiation_registers_nothing() {
        let mut store = Store::new();
        let module = Module {
            name: String::from("app"),
            types: vec![FunctionType::default()],
            functions: vec![0, 7],
            code: vec![
                FunctionBody::new(vec![], vec![End]),
                FunctionBody::new(vec![], vec![End]),
            ],
            ..Module::default()
        };
        assert!(matches!(
            store.instantiate(&module),
            Err(RuntimeError::InstantiationError(_))
        ));
        assert_eq!(store.registry().len(), 0);
        assert!(store.module("app").is_none());
    }

    #[test]
    fn test_registry_capacity_checked_up_front() {
        let mut store = Store::with_registry(Arc::new(FunctionRegistry::with_max_functions(2)));
        host_env(&mut store);
        let module = Module {
            name: String::from("app"),
            types: vec![FunctionType::default()],
            functions: vec![0, 0],
            code: vec![
                FunctionBody::new(vec![], vec![End]),
                FunctionBody::new(vec![], vec![End]),
            ],
            ..Module::default()
        };
        assert!(store.instantiate(&module).is_err());
        assert_eq!(store.registry().len(), 1);
        assert!(store.module("app").is_none());

        let mut small = Module::named("small");
        small.types.push(FunctionType::default());
        small.functions.push(0);
        small.code.push(FunctionBody::new(vec![], vec![End]));
        store.instantiate(&small).unwrap();
        assert_eq!(store.registry().remaining(), 0);
    }

    #[test]
    fn test_duplicate_module_name_rejected() {
        let mut store = Store::new();
        host_env(&mut store);
        assert!(store.define_host_module("env", HostModule::new()).is_err());
    }

    #[test]
    fn test_globals_mutability_and_type() {
        let mut store = Store::new();
        let mut host = HostModule::new();
        host.add_global(WasmValue::I32(1), false)
            .add_global(WasmValue::I64(2), true);
        let m = store.define_host_module("g", host).unwrap();
        assert_eq!(m.set_global(0, WasmValue::I32(3)), Err(TrapError::InvalidGlobal(0)));
        assert!(m.set_global(1, WasmValue::I32(3)).is_err());
        m.set_global(1, WasmValue::I64(7)).unwrap();
        assert_eq!(m.global(1), Ok(WasmValue::I64(7)));
        assert_eq!(m.global(2), Err(TrapError::InvalidGlobal(2)));
        assert_eq!(m.global_count(), 2);
    }
}
