//! Validated module definitions.
//!
//! A `Module` is what the decoder/validator hands to the linker: types,
//! function imports, function bodies, memory/table/global shapes and the
//! export list. Nothing here is checked again; the interpreter trusts that
//! indices inside bodies are in range for a module that passed validation.

use alloc::string::String;
use alloc::vec::Vec;

use crate::interpreter::WasmValue;
use crate::opcodes::Instruction;

/// A validated WASM module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Module name used for registration in the store.
    pub name: String,
    /// Type section: function signatures.
    pub types: Vec<FunctionType>,
    /// Function imports, in function index order.
    pub imports: Vec<Import>,
    /// Function section: type index per local function.
    pub functions: Vec<u32>,
    /// Code section: bodies of the local functions.
    pub code: Vec<FunctionBody>,
    /// Memory definition (MVP: at most one).
    pub memory: Option<MemoryType>,
    /// Table definition (MVP: at most one).
    pub table: Option<TableType>,
    /// Global definitions with their evaluated initial value.
    pub globals: Vec<Global>,
    /// Active element segments for the table.
    pub elements: Vec<Element>,
    /// Export section.
    pub exports: Vec<Export>,
}

impl Module {
    /// Create an empty module with a name.
    pub fn named(name: &str) -> Self {
        Module {
            name: String::from(name),
            ..Module::default()
        }
    }

    /// Get the function type for a function index (including imports).
    pub fn function_type(&self, func_idx: u32) -> Option<&FunctionType> {
        let import_count = self.imports.len();
        let type_idx = if (func_idx as usize) < import_count {
            self.imports[func_idx as usize].type_idx
        } else {
            *self.functions.get(func_idx as usize - import_count)?
        };
        self.types.get(type_idx as usize)
    }

    /// Count total functions (imports + local).
    pub fn total_function_count(&self) -> usize {
        self.imports.len() + self.functions.len()
    }

    /// Find an export by name.
    pub fn find_export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }
}

/// An exported item.
#[derive(Debug, Clone)]
pub struct Export {
    /// Export name.
    pub name: String,
    /// Export kind.
    pub kind: ExportKind,
    /// Index in the respective index space.
    pub index: u32,
}

/// Export kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Table,
    Memory,
    Global,
}

/// An imported function.
#[derive(Debug, Clone)]
pub struct Import {
    /// Module name.
    pub module: String,
    /// Import name.
    pub name: String,
    /// Type index of the expected signature.
    pub type_idx: u32,
}

/// Function type (signature).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionType {
    /// Parameter types.
    pub params: Vec<ValueType>,
    /// Return types.
    pub results: Vec<ValueType>,
}

impl FunctionType {
    /// Build a signature from parameter and result slices.
    pub fn new(params: &[ValueType], results: &[ValueType]) -> Self {
        FunctionType {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }
}

/// Value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    FuncRef,
    ExternRef,
}

/// Table type.
#[derive(Debug, Clone)]
pub struct TableType {
    /// Minimum size.
    pub min: u32,
    /// Maximum size (if specified).
    pub max: Option<u32>,
}

/// Memory type.
#[derive(Debug, Clone)]
pub struct MemoryType {
    /// Minimum pages (64KB each).
    pub min: u32,
    /// Maximum pages (if specified).
    pub max: Option<u32>,
}

/// Global variable definition.
#[derive(Debug, Clone)]
pub struct Global {
    /// Initial value; its type is the global's value type.
    pub init: WasmValue,
    /// Is mutable.
    pub mutable: bool,
}

/// Active element segment for table initialization.
#[derive(Debug, Clone)]
pub struct Element {
    /// Offset into the table.
    pub offset: u32,
    /// Function indices (module index space).
    pub func_indices: Vec<u32>,
}

/// Function body (locals + instructions).
#[derive(Debug, Clone, Default)]
pub struct FunctionBody {
    /// Local variable declarations: (count, type).
    pub locals: Vec<(u32, ValueType)>,
    /// Decoded instructions, terminated by the function's `End`.
    pub instructions: Vec<Instruction>,
}

impl FunctionBody {
    /// Create a body from locals and instructions.
    pub fn new(locals: Vec<(u32, ValueType)>, instructions: Vec<Instruction>) -> Self {
        FunctionBody {
            locals,
            instructions,
        }
    }

    /// Get the total number of declared local variables.
    pub fn local_count(&self) -> u32 {
        self.locals.iter().map(|(count, _)| count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::Instruction::*;
    use alloc::vec;

    #[test]
    fn test_function_type_spans_imports() {
        let mut module = Module::named("m");
        module.types = vec![
            FunctionType::new(&[ValueType::I32], &[]),
            FunctionType::new(&[], &[ValueType::I64]),
        ];
        module.imports.push(Import {
            module: String::from("env"),
            name: String::from("log"),
            type_idx: 0,
        });
        module.functions.push(1);
        module.code.push(FunctionBody::new(vec![], vec![I64Const(1), End]));

        assert_eq!(module.total_function_count(), 2);
        assert_eq!(module.function_type(0).map(|t| t.params.len()), Some(1));
        assert_eq!(module.function_type(1).map(|t| t.results.clone()), Some(vec![ValueType::I64]));
        assert!(module.function_type(2).is_none());
    }

    #[test]
    fn test_find_export_and_local_count() {
        let mut module = Module::named("m");
        module.exports.push(Export {
            name: String::from("main"),
            kind: ExportKind::Function,
            index: 0,
        });
        assert_eq!(module.find_export("main").map(|e| e.index), Some(0));
        assert!(module.find_export("other").is_none());

        let body = FunctionBody::new(vec![(3, ValueType::I32), (2, ValueType::F64)], vec![End]);
        assert_eq!(body.local_count(), 5);
    }
}
