//! Module/operation metadata lookup shared read-only by conversion tasks.

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, HashMap};

use crate::{MemoryAccessed, SourceInfo};

/// One compiled program as embedded in the capture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub program_id: u64,
    pub name: String,
    #[serde(default)]
    pub instructions: Vec<InstructionInfo>,
}

/// Static description of one instruction. Cost fields describe a single
/// occurrence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstructionInfo {
    pub name: String,
    #[serde(default)]
    pub opcode: String,
    #[serde(default)]
    pub category: String,
    /// Framework op this instruction was lowered from (`scope/name:Type`).
    #[serde(default)]
    pub tf_op_name: String,
    #[serde(default)]
    pub deduplicated_name: String,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub flops: u64,
    #[serde(default)]
    pub model_flops: u64,
    #[serde(default)]
    pub bytes_accessed: u64,
    #[serde(default)]
    pub memory_accessed: Vec<MemoryAccessed>,
    #[serde(default)]
    pub source_info: Option<SourceInfo>,
    #[serde(default)]
    pub fused_children: Vec<InstructionInfo>,
}

impl InstructionInfo {
    /// Fusion children worth reporting; parameters and tuples are plumbing.
    pub fn reportable_children(&self) -> impl Iterator<Item = &InstructionInfo> {
        self.fused_children
            .iter()
            .filter(|c| c.opcode != "parameter" && c.opcode != "tuple")
    }
}

/// Read-only lookup service. Implementations must tolerate concurrent reads
/// from every conversion task.
pub trait ModuleMetadata: Send + Sync {
    fn instruction(&self, module_id: u64, name: &str) -> Option<&InstructionInfo>;

    fn program_names(&self) -> BTreeMap<u64, String>;

    /// Whether any known module performs a backward pass.
    fn is_training(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
struct ModuleEntry {
    name: String,
    instructions: HashMap<String, InstructionInfo>,
    is_training: bool,
}

/// In-memory metadata service built once per conversion.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    modules: BTreeMap<u64, ModuleEntry>,
}

impl ModuleMap {
    pub fn from_modules(modules: &[ModuleInfo]) -> Self {
        let mut out = BTreeMap::new();
        for module in modules {
            let is_training = module.instructions.iter().any(instruction_is_training);
            let instructions = module
                .instructions
                .iter()
                .map(|i| (i.name.clone(), i.clone()))
                .collect();
            if out
                .insert(
                    module.program_id,
                    ModuleEntry {
                        name: module.name.clone(),
                        instructions,
                        is_training,
                    },
                )
                .is_some()
            {
                tracing::warn!("duplicate module for program id {}", module.program_id);
            }
        }
        Self { modules: out }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }
}

impl ModuleMetadata for ModuleMap {
    fn instruction(&self, module_id: u64, name: &str) -> Option<&InstructionInfo> {
        self.modules.get(&module_id)?.instructions.get(name)
    }

    fn program_names(&self) -> BTreeMap<u64, String> {
        self.modules
            .iter()
            .map(|(id, m)| (*id, m.name.clone()))
            .collect()
    }

    fn is_training(&self) -> bool {
        self.modules.values().any(|m| m.is_training)
    }
}

const TRAINING_MARKERS: &[&str] = &[
    "gradients",
    "backward",
    "backprop",
    "applygradient",
    "resourceapply",
];

fn instruction_is_training(instr: &InstructionInfo) -> bool {
    let tf_op = instr.tf_op_name.to_ascii_lowercase();
    let name = instr.name.to_ascii_lowercase();
    TRAINING_MARKERS
        .iter()
        .any(|m| tf_op.contains(m) || name.contains(m))
        || instr.fused_children.iter().any(instruction_is_training)
}
