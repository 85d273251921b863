//! Cranelift code generation

use std::collections::HashMap;

use cranelift_codegen::Context;
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    AbiParam, Block, FuncRef, Function, GlobalValue, InstBuilder, Signature, StackSlot,
    StackSlotData, StackSlotKind, UserFuncName, Value, types,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use hlx_mir::{
    BlockId, Callee, ExternId, FloatOp, FloatPredicate, FunctionId, InstKind, MirFunction,
    MirModule, MirType, Operand, Terminator, ValueId,
};
use target_lexicon::{BinaryFormat, Triple};
use thiserror::Error;
use tracing::{debug, trace};

/// Prefix of the fixed-arity C wrappers that stand in for variadic imports.
/// `printf` is reached through `hlx_rt_printf`.
pub const RUNTIME_PREFIX: &str = "hlx_rt_";

#[derive(Debug, Error)]
#[error("{message}")]
pub struct CodegenError {
    pub message: String,
}

impl CodegenError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

fn convert_type(ty: MirType, pointer: types::Type) -> Option<types::Type> {
    match ty {
        MirType::Void => None,
        MirType::F64 => Some(types::F64),
        MirType::Bool => Some(types::I8),
        MirType::I32 => Some(types::I32),
        MirType::Ptr => Some(pointer),
    }
}

fn float_cc(pred: FloatPredicate) -> FloatCC {
    match pred {
        FloatPredicate::Oeq => FloatCC::Equal,
        FloatPredicate::One => FloatCC::OrderedNotEqual,
        FloatPredicate::Olt => FloatCC::LessThan,
        FloatPredicate::Ogt => FloatCC::GreaterThan,
        FloatPredicate::Ole => FloatCC::LessThanOrEqual,
        FloatPredicate::Oge => FloatCC::GreaterThanOrEqual,
    }
}

/// Code generator using Cranelift
pub struct Codegen {
    module: ObjectModule,
    ctx: Context,
    builder_ctx: FunctionBuilderContext,
    /// Indexed by MIR `FunctionId`
    func_ids: Vec<FuncId>,
    /// Indexed by MIR `DataId`
    data_ids: Vec<DataId>,
    /// Imports, declared on first call
    extern_ids: HashMap<ExternId, FuncId>,
    /// `frem` has no Cranelift instruction; it calls libm
    fmod: Option<FuncId>,
}

impl Codegen {
    pub fn new(name: &str) -> Result<Self, CodegenError> {
        let host = Triple::host();
        if !matches!(
            host.binary_format,
            BinaryFormat::Elf | BinaryFormat::Macho | BinaryFormat::Coff
        ) {
            return Err(CodegenError::new(format!(
                "unsupported object format for host '{}'",
                host
            )));
        }

        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::new(format!("failed to set opt_level: {}", e)))?;
        flag_builder
            .set("is_pic", "true")
            .map_err(|e| CodegenError::new(format!("failed to set is_pic: {}", e)))?;

        let isa_builder = cranelift_native::builder()
            .map_err(|e| CodegenError::new(format!("failed to create ISA builder: {}", e)))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| CodegenError::new(format!("failed to create ISA: {}", e)))?;
        debug!(triple = %isa.triple(), "created target ISA");

        let builder = ObjectBuilder::new(isa, name, cranelift_module::default_libcall_names())
            .map_err(|e| CodegenError::new(format!("failed to create object builder: {}", e)))?;

        Ok(Self {
            module: ObjectModule::new(builder),
            ctx: Context::new(),
            builder_ctx: FunctionBuilderContext::new(),
            func_ids: Vec::new(),
            data_ids: Vec::new(),
            extern_ids: HashMap::new(),
            fmod: None,
        })
    }

    fn pointer_type(&self) -> types::Type {
        self.module.target_config().pointer_type()
    }

    fn signature(&self, params: &[MirType], return_type: MirType) -> Signature {
        let pointer = self.pointer_type();
        let mut sig = self.module.make_signature();
        for &param in params {
            if let Some(ty) = convert_type(param, pointer) {
                sig.params.push(AbiParam::new(ty));
            }
        }
        if let Some(ty) = convert_type(return_type, pointer) {
            sig.returns.push(AbiParam::new(ty));
        }
        sig
    }

    fn function_signature(&self, function: &MirFunction) -> Signature {
        let params: Vec<_> = function
            .params
            .iter()
            .map(|&p| function.value(p).ty)
            .collect();
        self.signature(&params, function.return_type)
    }

    /// Compile a MIR module
    pub fn compile(&mut self, program: &MirModule) -> Result<(), CodegenError> {
        for data in &program.data {
            let data_id = self
                .module
                .declare_data(&data.name, Linkage::Local, false, false)
                .map_err(|e| {
                    CodegenError::new(format!("failed to declare data '{}': {}", data.name, e))
                })?;
            let mut desc = DataDescription::new();
            desc.define(data.bytes.clone().into_boxed_slice());
            self.module.define_data(data_id, &desc).map_err(|e| {
                CodegenError::new(format!("failed to define data '{}': {}", data.name, e))
            })?;
            self.data_ids.push(data_id);
        }

        // Declare everything first so calls resolve regardless of order
        for function in &program.functions {
            let sig = self.function_signature(function);
            let linkage = if function.is_declaration() {
                Linkage::Import
            } else {
                match function.linkage {
                    hlx_mir::Linkage::Export => Linkage::Export,
                    hlx_mir::Linkage::Local => Linkage::Local,
                }
            };
            let func_id = self
                .module
                .declare_function(&function.name, linkage, &sig)
                .map_err(|e| {
                    CodegenError::new(format!(
                        "failed to declare function '{}': {}",
                        function.name, e
                    ))
                })?;
            self.func_ids.push(func_id);
        }

        for (index, function) in program.functions.iter().enumerate() {
            if !function.is_declaration() {
                self.define_function(program, FunctionId(index as u32))?;
            }
        }

        debug!(
            functions = program.functions.len(),
            imports = self.extern_ids.len() + usize::from(self.fmod.is_some()),
            "compiled module"
        );
        Ok(())
    }

    fn define_function(&mut self, program: &MirModule, id: FunctionId) -> Result<(), CodegenError> {
        let function = program.function(id);
        let func_id = self.func_ids[id.index()];
        let sig = self.function_signature(function);

        self.ctx.func =
            Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);

        let builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_ctx);
        let mut compiler = FunctionCompiler {
            builder,
            module: &mut self.module,
            program,
            function,
            func_ids: &self.func_ids,
            data_ids: &self.data_ids,
            extern_ids: &mut self.extern_ids,
            fmod: &mut self.fmod,
            blocks: HashMap::new(),
            values: HashMap::new(),
            slots: HashMap::new(),
            func_refs: HashMap::new(),
            data_refs: HashMap::new(),
        };
        compiler.compile()?;
        compiler.finish();

        if let Err(errors) = cranelift_codegen::verify_function(&self.ctx.func, self.module.isa()) {
            return Err(CodegenError::new(format!(
                "verifier errors in '{}':\n{}",
                function.name, errors
            )));
        }

        self.module
            .define_function(func_id, &mut self.ctx)
            .map_err(|e| {
                CodegenError::new(format!(
                    "failed to define function '{}': {}",
                    function.name, e
                ))
            })?;
        self.module.clear_context(&mut self.ctx);

        trace!(function = %function.name, "defined function");
        Ok(())
    }

    /// Finish compilation and return the object code
    pub fn finish(self) -> Result<Vec<u8>, CodegenError> {
        self.module
            .finish()
            .emit()
            .map_err(|e| CodegenError::new(format!("failed to emit object code: {}", e)))
    }
}

/// Compiles a single function
struct FunctionCompiler<'a> {
    builder: FunctionBuilder<'a>,
    module: &'a mut ObjectModule,
    program: &'a MirModule,
    function: &'a MirFunction,
    func_ids: &'a [FuncId],
    data_ids: &'a [DataId],
    extern_ids: &'a mut HashMap<ExternId, FuncId>,
    fmod: &'a mut Option<FuncId>,

    blocks: HashMap<BlockId, Block>,
    values: HashMap<ValueId, Value>,
    /// Stack slot behind each alloca
    slots: HashMap<ValueId, StackSlot>,
    func_refs: HashMap<FuncId, FuncRef>,
    data_refs: HashMap<hlx_mir::DataId, GlobalValue>,
}

impl<'a> FunctionCompiler<'a> {
    fn compile(&mut self) -> Result<(), CodegenError> {
        let function = self.function;
        let pointer = self.pointer_type();

        // Phi nodes become block parameters, in order.
        for &id in &function.layout {
            let block = self.builder.create_block();
            for inst in &function.block(id).insts {
                if let InstKind::Phi { ty, .. } = &inst.kind {
                    let ty = convert_type(*ty, pointer)
                        .ok_or_else(|| CodegenError::new("phi of type void"))?;
                    self.builder.append_block_param(block, ty);
                }
            }
            self.blocks.insert(id, block);
        }

        let entry = function.entry().ok_or_else(|| {
            CodegenError::new(format!("function '{}' has no entry block", function.name))
        })?;
        let entry_block = self.block(entry)?;
        self.builder
            .append_block_params_for_function_params(entry_block);
        let params = self.builder.block_params(entry_block).to_vec();
        for (&value, param) in function.params.iter().zip(params) {
            self.values.insert(value, param);
        }

        for &id in &function.layout {
            for inst in &function.block(id).insts {
                if let (InstKind::Alloca { ty }, Some(result)) = (&inst.kind, inst.result) {
                    let size = convert_type(*ty, pointer).map_or(0, |t| t.bytes());
                    let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
                        StackSlotKind::ExplicitSlot,
                        size,
                        3, // align to 8 bytes
                    ));
                    self.slots.insert(result, slot);
                }
            }
        }

        for &id in &function.layout {
            let block = self.block(id)?;
            self.builder.switch_to_block(block);
            self.compile_block(id)?;
        }

        // All predecessors are known now
        self.builder.seal_all_blocks();
        Ok(())
    }

    fn finish(self) {
        self.builder.finalize();
    }

    fn pointer_type(&self) -> types::Type {
        self.module.target_config().pointer_type()
    }

    fn block(&self, id: BlockId) -> Result<Block, CodegenError> {
        self.blocks.get(&id).copied().ok_or_else(|| {
            CodegenError::new(format!(
                "branch to detached block '{}' in '{}'",
                self.function.block(id).name,
                self.function.name
            ))
        })
    }

    fn slot(&self, ptr: ValueId) -> Result<StackSlot, CodegenError> {
        self.slots
            .get(&ptr)
            .copied()
            .ok_or_else(|| CodegenError::new(format!("{:?} is not a stack slot", ptr)))
    }

    fn compile_block(&mut self, id: BlockId) -> Result<(), CodegenError> {
        let function = self.function;
        let mir_block = function.block(id);
        let block = self.block(id)?;

        let mut phi_index = 0;
        for inst in &mir_block.insts {
            let value = match &inst.kind {
                InstKind::Phi { .. } => {
                    let param = self.builder.block_params(block)[phi_index];
                    phi_index += 1;
                    Some(param)
                }
                kind => self.compile_inst(kind)?,
            };
            if let (Some(result), Some(value)) = (inst.result, value) {
                self.values.insert(result, value);
            }
        }

        let terminator = mir_block.terminator.as_ref().ok_or_else(|| {
            CodegenError::new(format!(
                "block '{}' in '{}' has no terminator",
                mir_block.name, function.name
            ))
        })?;
        self.compile_terminator(id, terminator)
    }

    fn compile_inst(&mut self, kind: &InstKind) -> Result<Option<Value>, CodegenError> {
        let value = match kind {
            InstKind::Alloca { .. } => return Ok(None),
            InstKind::Load { ty, ptr } => {
                let slot = self.slot(*ptr)?;
                let ty = convert_type(*ty, self.pointer_type())
                    .ok_or_else(|| CodegenError::new("load of type void"))?;
                self.builder.ins().stack_load(ty, slot, 0)
            }
            InstKind::Store { value, ptr } => {
                let slot = self.slot(*ptr)?;
                let value = self.operand(value)?;
                self.builder.ins().stack_store(value, slot, 0);
                return Ok(None);
            }
            InstKind::Binary { op, lhs, rhs } => {
                let lhs = self.operand(lhs)?;
                let rhs = self.operand(rhs)?;
                match op {
                    FloatOp::Add => self.builder.ins().fadd(lhs, rhs),
                    FloatOp::Sub => self.builder.ins().fsub(lhs, rhs),
                    FloatOp::Mul => self.builder.ins().fmul(lhs, rhs),
                    FloatOp::Div => self.builder.ins().fdiv(lhs, rhs),
                    FloatOp::Rem => {
                        let fmod = self.fmod_ref()?;
                        let call = self.builder.ins().call(fmod, &[lhs, rhs]);
                        self.builder.inst_results(call)[0]
                    }
                }
            }
            InstKind::FNeg(value) => {
                let value = self.operand(value)?;
                self.builder.ins().fneg(value)
            }
            InstKind::FCmp { pred, lhs, rhs } => {
                let lhs = self.operand(lhs)?;
                let rhs = self.operand(rhs)?;
                self.builder.ins().fcmp(float_cc(*pred), lhs, rhs)
            }
            InstKind::UiToFp(value) => {
                let value = self.operand(value)?;
                let wide = self.builder.ins().uextend(types::I32, value);
                self.builder.ins().fcvt_from_uint(types::F64, wide)
            }
            InstKind::Not(value) => {
                let value = self.operand(value)?;
                self.builder.ins().icmp_imm(IntCC::Equal, value, 0)
            }
            InstKind::Phi { .. } => {
                return Err(CodegenError::new("phi nodes must lead their block"));
            }
            InstKind::Call { callee, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.operand(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let func_ref = match callee {
                    Callee::Function(id) => self.function_ref(self.func_ids[id.index()]),
                    Callee::Extern(id) => self.extern_ref(*id, &args)?,
                };
                let call = self.builder.ins().call(func_ref, &args);
                return Ok(self.builder.inst_results(call).first().copied());
            }
        };
        Ok(Some(value))
    }

    fn compile_terminator(&mut self, from: BlockId, terminator: &Terminator) -> Result<(), CodegenError> {
        match terminator {
            Terminator::Br(target) => {
                let args = self.branch_args(from, *target)?;
                let block = self.block(*target)?;
                self.builder.ins().jump(block, &args);
            }
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                let cond = self.operand(cond)?;
                let then_args = self.branch_args(from, *then_dest)?;
                let else_args = self.branch_args(from, *else_dest)?;
                let then_block = self.block(*then_dest)?;
                let else_block = self.block(*else_dest)?;
                self.builder
                    .ins()
                    .brif(cond, then_block, &then_args, else_block, &else_args);
            }
            Terminator::Ret(None) => {
                self.builder.ins().return_(&[]);
            }
            Terminator::Ret(Some(value)) => {
                let value = self.operand(value)?;
                self.builder.ins().return_(&[value]);
            }
        }
        Ok(())
    }

    /// Values flowing into the phi nodes of `to` along the edge from `from`
    fn branch_args(&mut self, from: BlockId, to: BlockId) -> Result<Vec<Value>, CodegenError> {
        let function = self.function;
        let mut args = Vec::new();
        for inst in &function.block(to).insts {
            let InstKind::Phi { incoming, .. } = &inst.kind else {
                continue;
            };
            let (operand, _) = incoming.iter().find(|(_, pred)| *pred == from).ok_or_else(|| {
                CodegenError::new(format!(
                    "phi in '{}' has no value for '{}'",
                    function.block(to).name,
                    function.block(from).name
                ))
            })?;
            args.push(self.operand(operand)?);
        }
        Ok(args)
    }

    fn operand(&mut self, operand: &Operand) -> Result<Value, CodegenError> {
        let value = match operand {
            Operand::Value(id) => {
                return self.values.get(id).copied().ok_or_else(|| {
                    CodegenError::new(format!("{:?} used before its definition", id))
                });
            }
            Operand::F64(value) => self.builder.ins().f64const(*value),
            Operand::Bool(value) => self.builder.ins().iconst(types::I8, i64::from(*value)),
            Operand::I32(value) => self.builder.ins().iconst(types::I32, i64::from(*value)),
            Operand::Data(id) => {
                let gv = self.data_ref(*id);
                let pointer = self.pointer_type();
                self.builder.ins().symbol_value(pointer, gv)
            }
        };
        Ok(value)
    }

    fn function_ref(&mut self, func_id: FuncId) -> FuncRef {
        if let Some(&func_ref) = self.func_refs.get(&func_id) {
            return func_ref;
        }
        let func_ref = self
            .module
            .declare_func_in_func(func_id, self.builder.func);
        self.func_refs.insert(func_id, func_ref);
        func_ref
    }

    fn data_ref(&mut self, id: hlx_mir::DataId) -> GlobalValue {
        if let Some(&gv) = self.data_refs.get(&id) {
            return gv;
        }
        let gv = self
            .module
            .declare_data_in_func(self.data_ids[id.index()], self.builder.func);
        self.data_refs.insert(id, gv);
        gv
    }

    /// Declare an import on first use. A variadic import is replaced by its
    /// fixed-arity wrapper, typed after the arguments of the call.
    fn extern_ref(&mut self, id: ExternId, args: &[Value]) -> Result<FuncRef, CodegenError> {
        if let Some(&func_id) = self.extern_ids.get(&id) {
            return Ok(self.function_ref(func_id));
        }

        let ext = &self.program.externs[id.index()];
        let pointer = self.pointer_type();
        let mut sig = self.module.make_signature();
        let name = if ext.is_variadic {
            for &arg in args {
                let ty = self.builder.func.dfg.value_type(arg);
                sig.params.push(AbiParam::new(ty));
            }
            format!("{}{}", RUNTIME_PREFIX, ext.name)
        } else {
            for &param in &ext.params {
                if let Some(ty) = convert_type(param, pointer) {
                    sig.params.push(AbiParam::new(ty));
                }
            }
            ext.name.clone()
        };
        if let Some(ty) = convert_type(ext.return_type, pointer) {
            sig.returns.push(AbiParam::new(ty));
        }

        let func_id = self
            .module
            .declare_function(&name, Linkage::Import, &sig)
            .map_err(|e| CodegenError::new(format!("failed to declare '{}': {}", name, e)))?;
        self.extern_ids.insert(id, func_id);
        Ok(self.function_ref(func_id))
    }

    fn fmod_ref(&mut self) -> Result<FuncRef, CodegenError> {
        let func_id = match *self.fmod {
            Some(func_id) => func_id,
            None => {
                let mut sig = self.module.make_signature();
                sig.params.push(AbiParam::new(types::F64));
                sig.params.push(AbiParam::new(types::F64));
                sig.returns.push(AbiParam::new(types::F64));
                let func_id = self
                    .module
                    .declare_function("fmod", Linkage::Import, &sig)
                    .map_err(|e| CodegenError::new(format!("failed to declare 'fmod': {}", e)))?;
                *self.fmod = Some(func_id);
                func_id
            }
        };
        Ok(self.function_ref(func_id))
    }
}
