//! Lower the resolved tree to MIR

use crate::mir::*;
use hlx_ast::{BinOp, UnaryOp};
use hlx_hir::*;
use std::collections::HashMap;
use tracing::{debug, trace};

/// `println` renders 15 significant digits and a newline
const PRINT_FORMAT: &[u8] = b"%.15g\n\0";

/// Symbols the builtin `println` needs from the C library
struct Runtime {
    printf: ExternId,
    format: DataId,
}

fn lower_type(ty: Type) -> MirType {
    match ty {
        Type::Void => MirType::Void,
        Type::Number => MirType::F64,
    }
}

/// Lower a resolved program to a MIR module
pub fn lower_program(program: &ResolvedProgram, module_name: &str) -> MirModule {
    let mut module = MirModule::new(module_name);

    // Declare every signature first so calls can target functions lowered later.
    // `FnId` and `FunctionId` share the same indices.
    for function in &program.functions {
        let params: Vec<_> = function
            .params
            .iter()
            .map(|&param| (program.decl(param).name.clone(), MirType::F64))
            .collect();
        module.declare_function(
            &function.name,
            &params,
            lower_type(function.return_type),
            Linkage::Local,
        );
    }

    let runtime = Runtime {
        printf: module.declare_extern("printf", vec![MirType::Ptr], MirType::I32, true),
        format: module.add_data(".str", PRINT_FORMAT.to_vec()),
    };

    for function in &program.functions {
        let ir = &mut module.functions[function.id.index()];
        FunctionLowerer::new(program, function, &runtime, ir).lower();
        trace!(function = %function.name, "lowered function");
    }

    emit_main_wrapper(&mut module);

    debug!(
        functions = module.functions.len(),
        blocks = module
            .functions
            .iter()
            .map(|f| f.layout.len())
            .sum::<usize>(),
        "lowered program"
    );

    module
}

/// Rename the user's `main` and add a C entry point that calls it and exits with 0
fn emit_main_wrapper(module: &mut MirModule) {
    let Some(user_main) = module.function_id("main") else {
        return;
    };
    module.functions[user_main.index()].name = "__builtin_main".to_string();

    let id = module.declare_function("main", &[], MirType::I32, Linkage::Export);
    let main = &mut module.functions[id.index()];
    let entry = main.create_block("entry");
    main.attach_block(entry);
    main.append(
        entry,
        InstKind::Call {
            callee: Callee::Function(user_main),
            args: Vec::new(),
        },
    );
    main.set_terminator(entry, Terminator::Ret(Some(Operand::I32(0))));
}

/// Lowers the body of one function
struct FunctionLowerer<'a> {
    program: &'a ResolvedProgram,
    function: &'a ResolvedFunction,
    runtime: &'a Runtime,
    ir: &'a mut MirFunction,

    /// Stack slot of every parameter and local of this function
    slots: HashMap<DeclId, ValueId>,
    entry: BlockId,
    /// Allocas emitted so far. They fill the head of the entry block, so a
    /// slot is never allocated conditionally or inside a loop.
    alloca_count: usize,
    retval: Option<ValueId>,
    /// Shared exit block, attached only if something branches to it
    return_block: BlockId,
    /// `None` right after a `return`
    current: Option<BlockId>,
}

impl<'a> FunctionLowerer<'a> {
    fn new(
        program: &'a ResolvedProgram,
        function: &'a ResolvedFunction,
        runtime: &'a Runtime,
        ir: &'a mut MirFunction,
    ) -> Self {
        let entry = ir.create_block("entry");
        ir.attach_block(entry);
        let return_block = ir.create_block("return");

        Self {
            program,
            function,
            runtime,
            ir,
            slots: HashMap::new(),
            entry,
            alloca_count: 0,
            retval: None,
            return_block,
            current: Some(entry),
        }
    }

    fn lower(mut self) {
        let function = self.function;
        let program = self.program;

        if function.return_type != Type::Void {
            self.retval = Some(self.alloca("retval"));
        }

        let params = self.ir.params.clone();
        for (&decl, &value) in function.params.iter().zip(&params) {
            let slot = self.alloca(&program.decl(decl).name);
            self.store(Operand::Value(value), slot);
            self.slots.insert(decl, slot);
        }

        if function.is_builtin {
            self.lower_println_body();
        } else {
            self.lower_block(&function.body);
        }

        if !self.ir.predecessors(self.return_block).is_empty() {
            self.br(self.return_block);
            self.ir.attach_block(self.return_block);
            self.switch_to(self.return_block);
        }

        match self.retval {
            None => self.terminate(Terminator::Ret(None)),
            Some(retval) => {
                let value = self.load(retval);
                self.terminate(Terminator::Ret(Some(value)));
            }
        }
    }

    fn lower_println_body(&mut self) {
        let Some(&param) = self.function.params.first() else {
            unreachable!("println takes one parameter");
        };
        let value = self.load(self.slot(param));
        self.effect(InstKind::Call {
            callee: Callee::Extern(self.runtime.printf),
            args: vec![Operand::Data(self.runtime.format), value],
        });
    }

    // === Builder helpers ===

    fn block(&self) -> BlockId {
        match self.current {
            Some(block) => block,
            None => unreachable!("instruction emitted after a return"),
        }
    }

    fn switch_to(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    /// Create a block and attach it right away
    fn append_block(&mut self, name: &str) -> BlockId {
        let block = self.ir.create_block(name);
        self.ir.attach_block(block);
        block
    }

    fn value(&mut self, kind: InstKind, ty: MirType, name: Option<&str>) -> Operand {
        let block = self.block();
        Operand::Value(self.ir.append_value(block, kind, ty, name))
    }

    fn effect(&mut self, kind: InstKind) {
        let block = self.block();
        self.ir.append(block, kind);
    }

    /// No-op once a `return` has ended the block
    fn terminate(&mut self, terminator: Terminator) {
        if let Some(block) = self.current {
            self.ir.set_terminator(block, terminator);
        }
    }

    fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br(target));
    }

    fn cond_br(&mut self, cond: Operand, then_dest: BlockId, else_dest: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            then_dest,
            else_dest,
        });
    }

    fn alloca(&mut self, name: &str) -> ValueId {
        let slot = self.ir.insert_value(
            self.entry,
            self.alloca_count,
            InstKind::Alloca { ty: MirType::F64 },
            MirType::Ptr,
            Some(name),
        );
        self.alloca_count += 1;
        slot
    }

    fn slot(&self, decl: DeclId) -> ValueId {
        match self.slots.get(&decl) {
            Some(&slot) => slot,
            None => unreachable!("declaration {:?} has no stack slot", decl),
        }
    }

    fn load(&mut self, ptr: ValueId) -> Operand {
        self.value(
            InstKind::Load {
                ty: MirType::F64,
                ptr,
            },
            MirType::F64,
            None,
        )
    }

    fn store(&mut self, value: Operand, ptr: ValueId) {
        self.effect(InstKind::Store { value, ptr });
    }

    /// Truthiness: not equal to 0.0
    fn to_bool(&mut self, value: Operand) -> Operand {
        self.value(
            InstKind::FCmp {
                pred: FloatPredicate::One,
                lhs: value,
                rhs: Operand::F64(0.0),
            },
            MirType::Bool,
            Some("to.bool"),
        )
    }

    fn to_double(&mut self, value: Operand) -> Operand {
        self.value(InstKind::UiToFp(value), MirType::F64, Some("to.double"))
    }

    // === Statements ===

    fn lower_block(&mut self, block: &ResolvedBlock) {
        for stmt in &block.stmts {
            self.lower_stmt(stmt);
            // Nothing after a return is reachable.
            if matches!(stmt, ResolvedStmt::Return { .. }) {
                self.current = None;
                break;
            }
        }
    }

    fn lower_stmt(&mut self, stmt: &ResolvedStmt) {
        match stmt {
            ResolvedStmt::Expr(expr) => {
                self.lower_expr(expr);
            }
            ResolvedStmt::Return { value, .. } => {
                if let Some(value) = value {
                    let value = self.lower_value(value);
                    match self.retval {
                        Some(retval) => self.store(value, retval),
                        None => unreachable!("return value in a void function"),
                    }
                }
                self.br(self.return_block);
            }
            ResolvedStmt::If {
                cond,
                then_block,
                else_block,
                ..
            } => self.lower_if(cond, then_block, else_block.as_ref()),
            ResolvedStmt::While { cond, body, .. } => self.lower_while(cond, body),
            ResolvedStmt::Decl { decl, init, .. } => {
                let program = self.program;
                let slot = self.alloca(&program.decl(*decl).name);
                if let Some(init) = init {
                    let value = self.lower_value(init);
                    self.store(value, slot);
                }
                self.slots.insert(*decl, slot);
            }
            ResolvedStmt::Assign { target, value, .. } => {
                let value = self.lower_value(value);
                let slot = self.slot(*target);
                self.store(value, slot);
            }
        }
    }

    fn lower_if(
        &mut self,
        cond: &ResolvedExpr,
        then_block: &ResolvedBlock,
        else_block: Option<&ResolvedBlock>,
    ) {
        // Arms are attached only when control reaches them.
        let true_block = self.ir.create_block("if.true");
        let exit_block = self.ir.create_block("if.exit");
        let false_block = match else_block {
            Some(_) => self.ir.create_block("if.false"),
            None => exit_block,
        };

        let cond = self.lower_value(cond);
        let cond = self.to_bool(cond);
        self.cond_br(cond, true_block, false_block);

        self.ir.attach_block(true_block);
        self.switch_to(true_block);
        self.lower_block(then_block);
        self.br(exit_block);

        if let Some(else_block) = else_block {
            self.ir.attach_block(false_block);
            self.switch_to(false_block);
            self.lower_block(else_block);
            self.br(exit_block);
        }

        self.ir.attach_block(exit_block);
        self.switch_to(exit_block);
    }

    fn lower_while(&mut self, cond: &ResolvedExpr, body: &ResolvedBlock) {
        let header = self.append_block("while.cond");
        let body_block = self.append_block("while.body");
        let exit_block = self.append_block("while.exit");

        self.br(header);

        self.switch_to(header);
        let cond = self.lower_value(cond);
        let cond = self.to_bool(cond);
        self.cond_br(cond, body_block, exit_block);

        self.switch_to(body_block);
        self.lower_block(body);
        self.br(header);

        self.switch_to(exit_block);
    }

    // === Expressions ===

    /// Lower an expression that has a value
    fn lower_value(&mut self, expr: &ResolvedExpr) -> Operand {
        match self.lower_expr(expr) {
            Some(value) => value,
            None => unreachable!("void expression used as a value"),
        }
    }

    /// Returns `None` for calls to void functions
    fn lower_expr(&mut self, expr: &ResolvedExpr) -> Option<Operand> {
        let value = match &expr.kind {
            ResolvedExprKind::Number(value) => Operand::F64(*value),
            ResolvedExprKind::DeclRef(decl) => {
                let slot = self.slot(*decl);
                self.load(slot)
            }
            ResolvedExprKind::Call { callee, args } => return self.lower_call(*callee, args),
            ResolvedExprKind::Binary { left, op, right } => match op {
                BinOp::And => self.lower_logical_value(left, false, right),
                BinOp::Or => self.lower_logical_value(left, true, right),
                _ => self.lower_binary(left, *op, right),
            },
            ResolvedExprKind::Unary { op, expr } => {
                let operand = self.lower_value(expr);
                match op {
                    UnaryOp::Neg => self.value(InstKind::FNeg(operand), MirType::F64, None),
                    UnaryOp::Not => {
                        let truth = self.to_bool(operand);
                        let negated = self.value(InstKind::Not(truth), MirType::Bool, None);
                        self.to_double(negated)
                    }
                }
            }
            ResolvedExprKind::Grouping(inner) => return self.lower_expr(inner),
        };
        Some(value)
    }

    fn lower_call(&mut self, callee: FnId, args: &[ResolvedExpr]) -> Option<Operand> {
        let args: Vec<_> = args.iter().map(|arg| self.lower_value(arg)).collect();
        let kind = InstKind::Call {
            callee: Callee::Function(FunctionId(callee.0)),
            args,
        };

        match lower_type(self.program.function(callee).return_type) {
            MirType::Void => {
                self.effect(kind);
                None
            }
            ty => Some(self.value(kind, ty, None)),
        }
    }

    fn lower_binary(&mut self, left: &ResolvedExpr, op: BinOp, right: &ResolvedExpr) -> Operand {
        let lhs = self.lower_value(left);
        let rhs = self.lower_value(right);

        let arithmetic = |op| InstKind::Binary { op, lhs, rhs };
        let compare = |pred| InstKind::FCmp { pred, lhs, rhs };

        match op {
            BinOp::Add => self.value(arithmetic(FloatOp::Add), MirType::F64, None),
            BinOp::Sub => self.value(arithmetic(FloatOp::Sub), MirType::F64, None),
            BinOp::Mul => self.value(arithmetic(FloatOp::Mul), MirType::F64, None),
            BinOp::Div => self.value(arithmetic(FloatOp::Div), MirType::F64, None),
            BinOp::Mod => self.value(arithmetic(FloatOp::Rem), MirType::F64, None),
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq => {
                let pred = match op {
                    BinOp::Eq => FloatPredicate::Oeq,
                    BinOp::NotEq => FloatPredicate::One,
                    BinOp::Lt => FloatPredicate::Olt,
                    BinOp::Gt => FloatPredicate::Ogt,
                    BinOp::LtEq => FloatPredicate::Ole,
                    _ => FloatPredicate::Oge,
                };
                let truth = self.value(compare(pred), MirType::Bool, None);
                self.to_double(truth)
            }
            BinOp::And | BinOp::Or => unreachable!("short-circuit operators are lowered as branches"),
        }
    }

    /// `a && b` / `a || b` as a value: branch on `a`, evaluate `b` only in the
    /// `rhs` block, and join the truth values with a phi in `merge`.
    fn lower_logical_value(
        &mut self,
        left: &ResolvedExpr,
        is_or: bool,
        right: &ResolvedExpr,
    ) -> Operand {
        let (rhs_name, merge_name) = if is_or {
            ("or.rhs", "or.merge")
        } else {
            ("and.rhs", "and.merge")
        };
        let rhs_block = self.append_block(rhs_name);
        let merge_block = self.append_block(merge_name);

        // `||` is decided when the left side is true, `&&` when it is false.
        let (true_dest, false_dest) = if is_or {
            (merge_block, rhs_block)
        } else {
            (rhs_block, merge_block)
        };
        self.lower_condition(left, true_dest, false_dest);

        self.switch_to(rhs_block);
        let rhs = self.lower_value(right);
        let rhs = self.to_bool(rhs);
        self.br(merge_block);
        let rhs_end = self.block();

        self.switch_to(merge_block);
        let incoming = self
            .ir
            .predecessors(merge_block)
            .into_iter()
            .map(|pred| {
                if pred == rhs_end {
                    (rhs, pred)
                } else {
                    (Operand::Bool(is_or), pred)
                }
            })
            .collect();
        let phi = self.value(
            InstKind::Phi {
                ty: MirType::Bool,
                incoming,
            },
            MirType::Bool,
            None,
        );
        self.to_double(phi)
    }

    /// Lower `expr` as a branch to `true_dest` or `false_dest`. Nested `&&`/`||`
    /// thread their branches through without materializing intermediate truth values.
    fn lower_condition(&mut self, expr: &ResolvedExpr, true_dest: BlockId, false_dest: BlockId) {
        let mut expr = expr;
        while let ResolvedExprKind::Grouping(inner) = &expr.kind {
            expr = inner;
        }

        if let ResolvedExprKind::Binary { left, op, right } = &expr.kind {
            match op {
                BinOp::Or => {
                    let next = self.append_block("or.lhs.false");
                    self.lower_condition(left, true_dest, next);
                    self.switch_to(next);
                    self.lower_condition(right, true_dest, false_dest);
                    return;
                }
                BinOp::And => {
                    let next = self.append_block("and.lhs.true");
                    self.lower_condition(left, next, false_dest);
                    self.switch_to(next);
                    self.lower_condition(right, true_dest, false_dest);
                    return;
                }
                _ => {}
            }
        }

        let value = self.lower_value(expr);
        let truth = self.to_bool(value);
        self.cond_br(truth, true_dest, false_dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Interpreter;
    use hlx_parser::Parser;

    fn lower(source: &str) -> MirModule {
        let output = Parser::parse(source);
        assert!(output.is_success(), "parse errors: {:?}", output.errors);
        let resolution = Resolver::resolve(&output.file);
        let diagnostics = resolution.diagnostics.clone();
        let program = resolution
            .program
            .unwrap_or_else(|| panic!("resolution failed: {:?}", diagnostics));
        lower_program(&program, "test.hlx")
    }

    fn run(source: &str) -> String {
        let module = lower(source);
        let mut interpreter = Interpreter::new(&module);
        let status = interpreter.run_main();
        assert_eq!(status, 0);
        interpreter.output
    }

    fn function<'m>(module: &'m MirModule, name: &str) -> &'m MirFunction {
        let id = module.function_id(name).expect("function exists");
        module.function(id)
    }

    fn block_names(function: &MirFunction) -> Vec<&str> {
        function
            .layout
            .iter()
            .map(|&b| function.block(b).name.as_str())
            .collect()
    }

    const SIDE_EFFECT: &str = "fn sideEffect(): number { println(1); return 1; }\n";

    #[test]
    fn test_and_skips_rhs_when_lhs_false() {
        let source = format!("{}fn main(): void {{ println(0 && sideEffect()); }}", SIDE_EFFECT);
        assert_eq!(run(&source), "0\n");
    }

    #[test]
    fn test_or_skips_rhs_when_lhs_true() {
        let source = format!("{}fn main(): void {{ println(1 || sideEffect()); }}", SIDE_EFFECT);
        assert_eq!(run(&source), "1\n");
    }

    #[test]
    fn test_and_evaluates_rhs_once() {
        let source = format!("{}fn main(): void {{ println(1 && sideEffect()); }}", SIDE_EFFECT);
        assert_eq!(run(&source), "1\n1\n");
    }

    #[test]
    fn test_nested_short_circuit() {
        let source = format!(
            "{}fn main(): void {{\n\
               println(0 && sideEffect() && sideEffect());\n\
               println((1 || sideEffect()) && (0 || 2));\n\
               println(0 || 0 || sideEffect());\n\
               if 0 && sideEffect() {{ println(9); }}\n\
             }}",
            SIDE_EFFECT
        );
        assert_eq!(run(&source), "0\n1\n1\n1\n");
    }

    #[test]
    fn test_nested_logical_threads_branches() {
        let module = lower("fn f(a: number, b: number, c: number): number { return a && b && c; }");
        let names = block_names(function(&module, "f"));
        assert!(names.contains(&"and.lhs.true"));
        // Only the outermost operator materializes a phi.
        let phis = function(&module, "f")
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i.kind, InstKind::Phi { .. }))
            .count();
        assert_eq!(phis, 1);
    }

    #[test]
    fn test_number_formatting() {
        let output = run(
            "fn main(): void { println(3.14); println(1 / 3); println(10 % 3); println(-2.5); println(100000000000000000000); }",
        );
        assert_eq!(output, "3.14\n0.333333333333333\n1\n-2.5\n1e+20\n");
    }

    #[test]
    fn test_comparisons_and_not() {
        let output = run(
            "fn main(): void { println(1 < 2); println(2 <= 1); println(3 == 3); println(3 != 3); println(!0); println(!5); println(2 >= 2); println(1 > 2); }",
        );
        assert_eq!(output, "1\n0\n1\n0\n1\n0\n1\n0\n");
    }

    #[test]
    fn test_while_and_recursion() {
        let output = run(
            "fn fib(n: number): number { if n < 2 { return n; } return fib(n - 1) + fib(n - 2); }\n\
             fn main(): void { var i = 0; while i < 5 { println(fib(i + 5)); i = i + 1; } }",
        );
        assert_eq!(output, "5\n8\n13\n21\n34\n");
    }

    #[test]
    fn test_shadowed_locals_get_separate_slots() {
        let output = run(
            "fn f(x: number): number { let x = x * 10; if x { let x = 7; println(x); } return x; }\n\
             fn main(): void { println(f(2)); }",
        );
        assert_eq!(output, "7\n20\n");
    }

    #[test]
    fn test_allocas_are_hoisted_to_entry() {
        let module = lower(
            "fn main(): void { var i = 0; while i < 3 { let t = i; if t { var u = 1; } i = i + 1; } }",
        );
        let main = function(&module, "__builtin_main");
        let entry = main.block(main.entry().expect("entry"));
        let allocas = entry
            .insts
            .iter()
            .take_while(|i| matches!(i.kind, InstKind::Alloca { .. }))
            .count();
        assert_eq!(allocas, 3);
        for &block in &main.layout[1..] {
            assert!(main
                .block(block)
                .insts
                .iter()
                .all(|i| !matches!(i.kind, InstKind::Alloca { .. })));
        }
    }

    #[test]
    fn test_return_block_only_when_used() {
        let module = lower(
            "fn f(): void { println(1); }\nfn g(): void { return; }\nfn h(): number { return 2; }",
        );
        assert!(!block_names(function(&module, "f")).contains(&"return"));
        assert_eq!(block_names(function(&module, "g")), vec!["entry", "return"]);
        assert_eq!(block_names(function(&module, "h")), vec!["entry", "return"]);
    }

    #[test]
    fn test_if_blocks_attached_in_order() {
        let module = lower(
            "fn f(x: number): number { if x { return 1; } else { return 2; } }",
        );
        assert_eq!(
            block_names(function(&module, "f")),
            vec!["entry", "if.true", "if.false", "if.exit", "return"]
        );
    }

    #[test]
    fn test_every_attached_block_is_terminated() {
        let module = lower(
            "fn f(x: number): number { while x { if x > 3 { return x; } x2(); } return 0 || x; }\n\
             fn x2(): void {}\n\
             fn main(): void { println(f(5)); }",
        );
        for function in &module.functions {
            for &block in &function.layout {
                assert!(
                    function.block(block).terminator.is_some(),
                    "{}: block {} has no terminator",
                    function.name,
                    function.block(block).name
                );
            }
        }
    }

    #[test]
    fn test_main_wrapper() {
        let module = lower("fn main(): void { println(1); }");
        let user_main = function(&module, "__builtin_main");
        assert_eq!(user_main.linkage, Linkage::Local);
        let main = function(&module, "main");
        assert_eq!(main.linkage, Linkage::Export);
        assert_eq!(main.return_type, MirType::I32);
        assert!(module.function_id("println").is_some());
    }

    #[test]
    fn test_module_without_main_has_no_wrapper() {
        let module = lower("fn f(): void {}");
        assert!(module.function_id("main").is_none());
        assert!(module.function_id("__builtin_main").is_none());
    }

    #[test]
    fn test_dump_listing() {
        let module = lower("fn main(): void { println(1 + 2); }");
        let text = module.pretty_print();
        assert!(text.starts_with("; ModuleID = 'test.hlx'\n"));
        assert!(text.contains("@.str = private unnamed_addr constant [7 x i8] c\"%.15g\\0A\\00\""));
        assert!(text.contains("define internal void @println(double %n) {"));
        assert!(text.contains("  %n1 = alloca double\n  store double %n, ptr %n1\n"));
        assert!(text.contains("call i32 (ptr, ...) @printf(ptr @.str, double %0)"));
        assert!(text.contains("define internal void @__builtin_main() {"));
        assert!(text.contains("  %0 = fadd double 1.0, 2.0\n  call void @println(double %0)\n"));
        assert!(text.contains("define i32 @main() {\nentry:\n  call void @__builtin_main()\n  ret i32 0\n}"));
        assert!(text.contains("declare i32 @printf(ptr, ...)"));
        assert_eq!(text, lower("fn main(): void { println(1 + 2); }").pretty_print());
    }
}
