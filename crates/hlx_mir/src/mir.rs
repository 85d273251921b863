//! MIR data structures and printer

use std::collections::{HashMap, HashSet};

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

index_type!(
    /// Index into `MirModule::functions`
    FunctionId
);
index_type!(
    /// Index into `MirModule::externs`
    ExternId
);
index_type!(
    /// Index into `MirModule::data`
    DataId
);
index_type!(
    /// Index into `MirFunction::blocks`
    BlockId
);
index_type!(
    /// Index into `MirFunction::values`
    ValueId
);

/// Machine-level types. `Bool` is the 1-bit result of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirType {
    Void,
    F64,
    Bool,
    I32,
    Ptr,
}

impl std::fmt::Display for MirType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirType::Void => write!(f, "void"),
            MirType::F64 => write!(f, "double"),
            MirType::Bool => write!(f, "i1"),
            MirType::I32 => write!(f, "i32"),
            MirType::Ptr => write!(f, "ptr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Visible to the linker (the C entry point)
    Export,
    /// Private to the object file
    Local,
}

/// A MIR module
#[derive(Debug)]
pub struct MirModule {
    pub name: String,
    pub functions: Vec<MirFunction>,
    pub externs: Vec<MirExternFunction>,
    pub data: Vec<MirData>,
}

/// A function imported from the C library
#[derive(Debug, Clone)]
pub struct MirExternFunction {
    pub name: String,
    pub params: Vec<MirType>,
    pub return_type: MirType,
    pub is_variadic: bool,
}

/// Read-only bytes with a symbol name
#[derive(Debug, Clone)]
pub struct MirData {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl MirModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: Vec::new(),
            externs: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Add a function without a body
    pub fn declare_function(
        &mut self,
        name: &str,
        params: &[(String, MirType)],
        return_type: MirType,
        linkage: Linkage,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions
            .push(MirFunction::new(name, params, return_type, linkage));
        id
    }

    pub fn declare_extern(
        &mut self,
        name: &str,
        params: Vec<MirType>,
        return_type: MirType,
        is_variadic: bool,
    ) -> ExternId {
        let id = ExternId(self.externs.len() as u32);
        self.externs.push(MirExternFunction {
            name: name.to_string(),
            params,
            return_type,
            is_variadic,
        });
        id
    }

    pub fn add_data(&mut self, name: &str, bytes: Vec<u8>) -> DataId {
        let id = DataId(self.data.len() as u32);
        self.data.push(MirData {
            name: name.to_string(),
            bytes,
        });
        id
    }

    pub fn function(&self, id: FunctionId) -> &MirFunction {
        &self.functions[id.index()]
    }

    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|index| FunctionId(index as u32))
    }

    pub fn callee_name(&self, callee: Callee) -> &str {
        match callee {
            Callee::Function(id) => &self.functions[id.index()].name,
            Callee::Extern(id) => &self.externs[id.index()].name,
        }
    }

    pub fn callee_return_type(&self, callee: Callee) -> MirType {
        match callee {
            Callee::Function(id) => self.functions[id.index()].return_type,
            Callee::Extern(id) => self.externs[id.index()].return_type,
        }
    }

    /// LLVM-style textual listing
    pub fn pretty_print(&self) -> String {
        let mut out = format!("; ModuleID = '{}'\n", self.name);

        if !self.data.is_empty() {
            out.push('\n');
            for data in &self.data {
                out.push_str(&format!(
                    "@{} = private unnamed_addr constant [{} x i8] c\"{}\"\n",
                    data.name,
                    data.bytes.len(),
                    escape_bytes(&data.bytes)
                ));
            }
        }

        for function in &self.functions {
            out.push('\n');
            out.push_str(&function.pretty_print(self));
        }

        if !self.externs.is_empty() {
            out.push('\n');
            for ext in &self.externs {
                let mut params: Vec<_> = ext.params.iter().map(|t| t.to_string()).collect();
                if ext.is_variadic {
                    params.push("...".to_string());
                }
                out.push_str(&format!(
                    "declare {} @{}({})\n",
                    ext.return_type,
                    ext.name,
                    params.join(", ")
                ));
            }
        }

        out
    }
}

/// Name and type of an SSA value. Unnamed values print as `%<n>`.
#[derive(Debug, Clone)]
pub struct ValueInfo {
    pub name: Option<String>,
    pub ty: MirType,
}

/// A MIR function
#[derive(Debug)]
pub struct MirFunction {
    pub name: String,
    pub params: Vec<ValueId>,
    pub return_type: MirType,
    pub linkage: Linkage,
    /// Every block ever created, attached or not
    pub blocks: Vec<BasicBlock>,
    /// Attached blocks in emission order; the first one is the entry
    pub layout: Vec<BlockId>,
    pub values: Vec<ValueInfo>,
    /// Value and block names in use, for uniquing
    names: HashSet<String>,
}

/// A basic block
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub name: String,
    pub insts: Vec<Inst>,
    pub terminator: Option<Terminator>,
}

/// An instruction, with the value it defines if any
#[derive(Debug, Clone)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

#[derive(Debug, Clone)]
pub enum InstKind {
    /// Reserve a stack slot; the result is its address
    Alloca { ty: MirType },
    Load { ty: MirType, ptr: ValueId },
    Store { value: Operand, ptr: ValueId },
    Binary { op: FloatOp, lhs: Operand, rhs: Operand },
    FNeg(Operand),
    FCmp { pred: FloatPredicate, lhs: Operand, rhs: Operand },
    /// Unsigned `i1` to `double`: yields 1.0 or 0.0
    UiToFp(Operand),
    /// Logical negation of an `i1`
    Not(Operand),
    /// Must appear before any other instruction of its block
    Phi { ty: MirType, incoming: Vec<(Operand, BlockId)> },
    Call { callee: Callee, args: Vec<Operand> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl FloatOp {
    fn mnemonic(self) -> &'static str {
        match self {
            FloatOp::Add => "fadd",
            FloatOp::Sub => "fsub",
            FloatOp::Mul => "fmul",
            FloatOp::Div => "fdiv",
            FloatOp::Rem => "frem",
        }
    }
}

/// Ordered comparisons: false if either side is NaN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatPredicate {
    Oeq,
    One,
    Olt,
    Ogt,
    Ole,
    Oge,
}

impl std::fmt::Display for FloatPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FloatPredicate::Oeq => write!(f, "oeq"),
            FloatPredicate::One => write!(f, "one"),
            FloatPredicate::Olt => write!(f, "olt"),
            FloatPredicate::Ogt => write!(f, "ogt"),
            FloatPredicate::Ole => write!(f, "ole"),
            FloatPredicate::Oge => write!(f, "oge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Function(FunctionId),
    Extern(ExternId),
}

/// An instruction operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Value(ValueId),
    F64(f64),
    Bool(bool),
    I32(i32),
    /// Address of a data object
    Data(DataId),
}

/// A block terminator
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Operand,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Ret(Option<Operand>),
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
            Terminator::Ret(_) => Vec::new(),
        }
    }
}

impl MirFunction {
    pub fn new(
        name: &str,
        params: &[(String, MirType)],
        return_type: MirType,
        linkage: Linkage,
    ) -> Self {
        let mut function = Self {
            name: name.to_string(),
            params: Vec::new(),
            return_type,
            linkage,
            blocks: Vec::new(),
            layout: Vec::new(),
            values: Vec::new(),
            names: HashSet::new(),
        };
        for (name, ty) in params {
            let value = function.new_value(Some(name), *ty);
            function.params.push(value);
        }
        function
    }

    /// Declared only; no block was ever attached
    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.index()]
    }

    fn unique_name(&mut self, hint: &str) -> String {
        if self.names.insert(hint.to_string()) {
            return hint.to_string();
        }
        let mut suffix = 1;
        loop {
            let candidate = format!("{}{}", hint, suffix);
            if self.names.insert(candidate.clone()) {
                return candidate;
            }
            suffix += 1;
        }
    }

    fn new_value(&mut self, name: Option<&str>, ty: MirType) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        let name = name.map(|hint| self.unique_name(hint));
        self.values.push(ValueInfo { name, ty });
        id
    }

    /// Create a block that is not yet part of the layout
    pub fn create_block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let name = self.unique_name(name);
        self.blocks.push(BasicBlock {
            name,
            insts: Vec::new(),
            terminator: None,
        });
        id
    }

    pub fn attach_block(&mut self, block: BlockId) {
        if !self.is_attached(block) {
            self.layout.push(block);
        }
    }

    pub fn is_attached(&self, block: BlockId) -> bool {
        self.layout.contains(&block)
    }

    /// Insert a value-producing instruction at `index` within `block`
    pub fn insert_value(
        &mut self,
        block: BlockId,
        index: usize,
        kind: InstKind,
        ty: MirType,
        name: Option<&str>,
    ) -> ValueId {
        let result = self.new_value(name, ty);
        self.blocks[block.index()].insts.insert(
            index,
            Inst {
                result: Some(result),
                kind,
            },
        );
        result
    }

    pub fn append_value(
        &mut self,
        block: BlockId,
        kind: InstKind,
        ty: MirType,
        name: Option<&str>,
    ) -> ValueId {
        let index = self.blocks[block.index()].insts.len();
        self.insert_value(block, index, kind, ty, name)
    }

    /// Append an instruction whose result, if any, is unused
    pub fn append(&mut self, block: BlockId, kind: InstKind) {
        self.blocks[block.index()]
            .insts
            .push(Inst { result: None, kind });
    }

    pub fn set_terminator(&mut self, block: BlockId, terminator: Terminator) {
        self.blocks[block.index()].terminator = Some(terminator);
    }

    /// Attached blocks that branch to `block`, in layout order
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        let mut preds = Vec::new();
        for &id in &self.layout {
            let branches_here = self.blocks[id.index()]
                .terminator
                .as_ref()
                .is_some_and(|t| t.successors().contains(&block));
            if branches_here && !preds.contains(&id) {
                preds.push(id);
            }
        }
        preds
    }

    pub fn operand_type(&self, operand: &Operand) -> MirType {
        match operand {
            Operand::Value(value) => self.values[value.index()].ty,
            Operand::F64(_) => MirType::F64,
            Operand::Bool(_) => MirType::Bool,
            Operand::I32(_) => MirType::I32,
            Operand::Data(_) => MirType::Ptr,
        }
    }

    pub fn pretty_print(&self, module: &MirModule) -> String {
        let names = ValueNames::new(self);

        let params: Vec<_> = self
            .params
            .iter()
            .map(|&p| format!("{} {}", self.value(p).ty, names.get(p)))
            .collect();

        if self.is_declaration() {
            return format!(
                "declare {} @{}({})\n",
                self.return_type,
                self.name,
                params.join(", ")
            );
        }

        let linkage = match self.linkage {
            Linkage::Export => "",
            Linkage::Local => "internal ",
        };
        let mut out = format!(
            "define {}{} @{}({}) {{\n",
            linkage,
            self.return_type,
            self.name,
            params.join(", ")
        );

        for (position, &id) in self.layout.iter().enumerate() {
            if position > 0 {
                out.push('\n');
            }
            let block = self.block(id);
            out.push_str(&format!("{}:\n", block.name));
            for inst in &block.insts {
                out.push_str(&format!("  {}\n", self.print_inst(inst, &names, module)));
            }
            if let Some(terminator) = &block.terminator {
                out.push_str(&format!(
                    "  {}\n",
                    self.print_terminator(terminator, &names, module)
                ));
            }
        }

        out.push_str("}\n");
        out
    }

    fn print_operand(&self, operand: &Operand, names: &ValueNames, module: &MirModule) -> String {
        match operand {
            Operand::Value(value) => names.get(*value),
            Operand::F64(value) => format_double(*value),
            Operand::Bool(value) => value.to_string(),
            Operand::I32(value) => value.to_string(),
            Operand::Data(id) => format!("@{}", module.data[id.index()].name),
        }
    }

    fn typed_operand(&self, operand: &Operand, names: &ValueNames, module: &MirModule) -> String {
        format!(
            "{} {}",
            self.operand_type(operand),
            self.print_operand(operand, names, module)
        )
    }

    fn print_inst(&self, inst: &Inst, names: &ValueNames, module: &MirModule) -> String {
        let operand = |op: &Operand| self.print_operand(op, names, module);

        let body = match &inst.kind {
            InstKind::Alloca { ty } => format!("alloca {}", ty),
            InstKind::Load { ty, ptr } => format!("load {}, ptr {}", ty, names.get(*ptr)),
            InstKind::Store { value, ptr } => format!(
                "store {}, ptr {}",
                self.typed_operand(value, names, module),
                names.get(*ptr)
            ),
            InstKind::Binary { op, lhs, rhs } => {
                format!("{} double {}, {}", op.mnemonic(), operand(lhs), operand(rhs))
            }
            InstKind::FNeg(value) => format!("fneg double {}", operand(value)),
            InstKind::FCmp { pred, lhs, rhs } => {
                format!("fcmp {} double {}, {}", pred, operand(lhs), operand(rhs))
            }
            InstKind::UiToFp(value) => format!("uitofp i1 {} to double", operand(value)),
            InstKind::Not(value) => format!("xor i1 {}, true", operand(value)),
            InstKind::Phi { ty, incoming } => {
                let arms: Vec<_> = incoming
                    .iter()
                    .map(|(value, block)| {
                        format!("[ {}, %{} ]", operand(value), self.block(*block).name)
                    })
                    .collect();
                format!("phi {} {}", ty, arms.join(", "))
            }
            InstKind::Call { callee, args } => {
                let args: Vec<_> = args
                    .iter()
                    .map(|a| self.typed_operand(a, names, module))
                    .collect();
                let return_type = module.callee_return_type(*callee);
                let fn_type = match callee {
                    Callee::Extern(id) if module.externs[id.index()].is_variadic => {
                        let ext = &module.externs[id.index()];
                        let mut params: Vec<_> = ext.params.iter().map(|t| t.to_string()).collect();
                        params.push("...".to_string());
                        format!("{} ({})", return_type, params.join(", "))
                    }
                    _ => return_type.to_string(),
                };
                format!(
                    "call {} @{}({})",
                    fn_type,
                    module.callee_name(*callee),
                    args.join(", ")
                )
            }
        };

        match inst.result {
            Some(result) => format!("{} = {}", names.get(result), body),
            None => body,
        }
    }

    fn print_terminator(
        &self,
        terminator: &Terminator,
        names: &ValueNames,
        module: &MirModule,
    ) -> String {
        match terminator {
            Terminator::Br(target) => format!("br label %{}", self.block(*target).name),
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            } => format!(
                "br i1 {}, label %{}, label %{}",
                self.print_operand(cond, names, module),
                self.block(*then_dest).name,
                self.block(*else_dest).name
            ),
            Terminator::Ret(None) => "ret void".to_string(),
            Terminator::Ret(Some(value)) => format!(
                "ret {} {}",
                self.operand_type(value),
                self.print_operand(value, names, module)
            ),
        }
    }
}

/// Printed names: named values keep their unique name, the rest are
/// numbered in order of definition like LLVM does.
struct ValueNames {
    names: HashMap<ValueId, String>,
}

impl ValueNames {
    fn new(function: &MirFunction) -> Self {
        let mut names = HashMap::new();
        let mut next = 0;
        let mut assign = |value: ValueId, names: &mut HashMap<ValueId, String>| {
            let name = match &function.value(value).name {
                Some(name) => format!("%{}", name),
                None => {
                    let name = format!("%{}", next);
                    next += 1;
                    name
                }
            };
            names.insert(value, name);
        };

        for &param in &function.params {
            assign(param, &mut names);
        }
        for &block in &function.layout {
            for inst in &function.block(block).insts {
                if let Some(result) = inst.result {
                    assign(result, &mut names);
                }
            }
        }

        Self { names }
    }

    fn get(&self, value: ValueId) -> String {
        self.names
            .get(&value)
            .cloned()
            .unwrap_or_else(|| format!("%<detached {}>", value.0))
    }
}

/// LLVM accepts decimal doubles only with a dot
fn format_double(value: f64) -> String {
    let text = format!("{:?}", value);
    if !value.is_finite() || text.contains('.') {
        return text;
    }
    match text.split_once('e') {
        Some((mantissa, exponent)) => format!("{}.0e{}", mantissa, exponent),
        None => format!("{}.0", text),
    }
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &byte in bytes {
        if (byte.is_ascii_graphic() && byte != b'"' && byte != b'\\') || byte == b' ' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\{:02X}", byte));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module() -> MirModule {
        let mut module = MirModule::new("sample");
        let id = module.declare_function(
            "twice",
            &[("x".to_string(), MirType::F64)],
            MirType::F64,
            Linkage::Local,
        );
        let function = &mut module.functions[id.index()];
        let entry = function.create_block("entry");
        function.attach_block(entry);
        let x = function.params[0];
        let sum = function.append_value(
            entry,
            InstKind::Binary {
                op: FloatOp::Add,
                lhs: Operand::Value(x),
                rhs: Operand::Value(x),
            },
            MirType::F64,
            None,
        );
        function.set_terminator(entry, Terminator::Ret(Some(Operand::Value(sum))));
        module
    }

    #[test]
    fn test_names_are_uniqued() {
        let mut function = MirFunction::new(
            "f",
            &[("x".to_string(), MirType::F64)],
            MirType::Void,
            Linkage::Local,
        );
        let first = function.create_block("if.exit");
        let second = function.create_block("if.exit");
        let slot = function.create_block("x");
        assert_eq!(function.block(first).name, "if.exit");
        assert_eq!(function.block(second).name, "if.exit1");
        assert_eq!(function.block(slot).name, "x1");
    }

    #[test]
    fn test_detached_blocks_are_not_in_layout() {
        let mut function = MirFunction::new("f", &[], MirType::Void, Linkage::Local);
        let entry = function.create_block("entry");
        let later = function.create_block("later");
        function.attach_block(entry);
        assert!(function.is_attached(entry));
        assert!(!function.is_attached(later));
        function.attach_block(entry);
        assert_eq!(function.layout, vec![entry]);
    }

    #[test]
    fn test_predecessors_in_layout_order() {
        let mut function = MirFunction::new("f", &[], MirType::Void, Linkage::Local);
        let a = function.create_block("a");
        let b = function.create_block("b");
        let c = function.create_block("c");
        for block in [a, b, c] {
            function.attach_block(block);
        }
        function.set_terminator(
            a,
            Terminator::CondBr {
                cond: Operand::Bool(true),
                then_dest: c,
                else_dest: b,
            },
        );
        function.set_terminator(b, Terminator::Br(c));
        function.set_terminator(c, Terminator::Ret(None));
        assert_eq!(function.predecessors(c), vec![a, b]);
        assert_eq!(function.predecessors(b), vec![a]);
        assert!(function.predecessors(a).is_empty());
    }

    #[test]
    fn test_pretty_print() {
        let module = sample_module();
        let expected = "\
; ModuleID = 'sample'

define internal double @twice(double %x) {
entry:
  %0 = fadd double %x, %x
  ret double %0
}
";
        assert_eq!(module.pretty_print(), expected);
    }

    #[test]
    fn test_print_externs_and_data() {
        let mut module = MirModule::new("m");
        module.add_data("fmt", b"%.15g\n\0".to_vec());
        module.declare_extern("printf", vec![MirType::Ptr], MirType::I32, true);
        let text = module.pretty_print();
        assert!(text.contains("@fmt = private unnamed_addr constant [7 x i8] c\"%.15g\\0A\\00\""));
        assert!(text.contains("declare i32 @printf(ptr, ...)"));
    }

    #[test]
    fn test_format_double() {
        assert_eq!(format_double(1.0), "1.0");
        assert_eq!(format_double(3.14), "3.14");
        assert_eq!(format_double(0.0), "0.0");
        assert_eq!(format_double(1e20), "1.0e20");
    }
}
