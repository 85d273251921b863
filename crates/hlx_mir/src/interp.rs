//! Reference interpreter for MIR modules, used by the lowering tests.
//! `printf` is emulated for the `%.15g\n` format only.

use crate::mir::*;
use std::collections::HashMap;

const STEP_LIMIT: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Val {
    F64(f64),
    Bool(bool),
    I32(i32),
    /// Index into the interpreter's stack memory
    Slot(usize),
    Data(DataId),
}

pub struct Interpreter<'m> {
    module: &'m MirModule,
    memory: Vec<f64>,
    steps: usize,
    pub output: String,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m MirModule) -> Self {
        Self {
            module,
            memory: Vec::new(),
            steps: 0,
            output: String::new(),
        }
    }

    /// Run the C entry point and return its exit status
    pub fn run_main(&mut self) -> i32 {
        let main = self.module.function_id("main").expect("module has a main");
        match self.call(main, Vec::new()) {
            Some(Val::I32(status)) => status,
            other => panic!("main returned {:?}", other),
        }
    }

    fn call(&mut self, id: FunctionId, args: Vec<Val>) -> Option<Val> {
        let module = self.module;
        let function = module.function(id);
        assert!(!function.is_declaration(), "call to undefined {}", function.name);

        let mut env: HashMap<ValueId, Val> = function.params.iter().copied().zip(args).collect();
        let mut block = function.entry().expect("entry block");
        let mut previous: Option<BlockId> = None;

        loop {
            self.steps += 1;
            assert!(self.steps < STEP_LIMIT, "step limit exceeded");

            let bb = function.block(block);
            for inst in &bb.insts {
                let value = self.exec(function, &inst.kind, &env, previous);
                if let (Some(result), Some(value)) = (inst.result, value) {
                    env.insert(result, value);
                }
            }

            let terminator = bb
                .terminator
                .as_ref()
                .unwrap_or_else(|| panic!("block {} has no terminator", bb.name));
            match terminator {
                Terminator::Br(target) => {
                    previous = Some(block);
                    block = *target;
                }
                Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => {
                    previous = Some(block);
                    block = match self.operand(cond, &env) {
                        Val::Bool(true) => *then_dest,
                        Val::Bool(false) => *else_dest,
                        other => panic!("branch on {:?}", other),
                    };
                }
                Terminator::Ret(value) => return value.map(|v| self.operand(&v, &env)),
            }
        }
    }

    fn operand(&self, operand: &Operand, env: &HashMap<ValueId, Val>) -> Val {
        match operand {
            Operand::Value(id) => *env.get(id).unwrap_or_else(|| panic!("undefined value {:?}", id)),
            Operand::F64(v) => Val::F64(*v),
            Operand::Bool(b) => Val::Bool(*b),
            Operand::I32(n) => Val::I32(*n),
            Operand::Data(id) => Val::Data(*id),
        }
    }

    fn number(&self, operand: &Operand, env: &HashMap<ValueId, Val>) -> f64 {
        match self.operand(operand, env) {
            Val::F64(v) => v,
            other => panic!("expected double, got {:?}", other),
        }
    }

    fn truth(&self, operand: &Operand, env: &HashMap<ValueId, Val>) -> bool {
        match self.operand(operand, env) {
            Val::Bool(b) => b,
            other => panic!("expected i1, got {:?}", other),
        }
    }

    fn slot(&self, ptr: ValueId, env: &HashMap<ValueId, Val>) -> usize {
        match env.get(&ptr) {
            Some(Val::Slot(index)) => *index,
            other => panic!("expected stack slot, got {:?}", other),
        }
    }

    fn exec(
        &mut self,
        function: &MirFunction,
        kind: &InstKind,
        env: &HashMap<ValueId, Val>,
        previous: Option<BlockId>,
    ) -> Option<Val> {
        match kind {
            InstKind::Alloca { .. } => {
                self.memory.push(f64::NAN);
                Some(Val::Slot(self.memory.len() - 1))
            }
            InstKind::Load { ptr, .. } => Some(Val::F64(self.memory[self.slot(*ptr, env)])),
            InstKind::Store { value, ptr } => {
                let slot = self.slot(*ptr, env);
                self.memory[slot] = self.number(value, env);
                None
            }
            InstKind::Binary { op, lhs, rhs } => {
                let (a, b) = (self.number(lhs, env), self.number(rhs, env));
                Some(Val::F64(match op {
                    FloatOp::Add => a + b,
                    FloatOp::Sub => a - b,
                    FloatOp::Mul => a * b,
                    FloatOp::Div => a / b,
                    FloatOp::Rem => a % b,
                }))
            }
            InstKind::FNeg(value) => Some(Val::F64(-self.number(value, env))),
            InstKind::FCmp { pred, lhs, rhs } => {
                let (a, b) = (self.number(lhs, env), self.number(rhs, env));
                let ordered = !a.is_nan() && !b.is_nan();
                Some(Val::Bool(
                    ordered
                        && match pred {
                            FloatPredicate::Oeq => a == b,
                            FloatPredicate::One => a != b,
                            FloatPredicate::Olt => a < b,
                            FloatPredicate::Ogt => a > b,
                            FloatPredicate::Ole => a <= b,
                            FloatPredicate::Oge => a >= b,
                        },
                ))
            }
            InstKind::UiToFp(value) => Some(Val::F64(if self.truth(value, env) { 1.0 } else { 0.0 })),
            InstKind::Not(value) => Some(Val::Bool(!self.truth(value, env))),
            InstKind::Phi { incoming, .. } => {
                let previous = previous.expect("phi in entry block");
                let (value, _) = incoming
                    .iter()
                    .find(|(_, block)| *block == previous)
                    .unwrap_or_else(|| panic!("phi in {} has no incoming edge", function.name));
                Some(self.operand(value, env))
            }
            InstKind::Call { callee, args } => {
                let args: Vec<_> = args.iter().map(|a| self.operand(a, env)).collect();
                match callee {
                    Callee::Function(id) => self.call(*id, args),
                    Callee::Extern(id) => Some(self.call_extern(*id, &args)),
                }
            }
        }
    }

    fn call_extern(&mut self, id: ExternId, args: &[Val]) -> Val {
        let module = self.module;
        assert_eq!(module.externs[id.index()].name, "printf");
        match args {
            [Val::Data(format), Val::F64(value)] => {
                assert_eq!(module.data[format.index()].bytes, b"%.15g\n\0");
                let text = format!("{}\n", format_g(*value, 15));
                self.output.push_str(&text);
                Val::I32(text.len() as i32)
            }
            other => panic!("unsupported printf arguments {:?}", other),
        }
    }
}

/// C's `%.<precision>g`
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = scientific.split_once('e').expect("exponent");
    let exponent: i32 = exponent.parse().expect("numeric exponent");

    if exponent < -4 || exponent >= precision as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exponent.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent) as usize;
        trim_fraction(&format!("{:.*}", decimals, value))
    }
}

fn trim_fraction(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_g() {
        assert_eq!(format_g(3.14, 15), "3.14");
        assert_eq!(format_g(10.0, 15), "10");
        assert_eq!(format_g(1.0 / 3.0, 15), "0.333333333333333");
        assert_eq!(format_g(1e20, 15), "1e+20");
        assert_eq!(format_g(0.0001, 15), "0.0001");
        assert_eq!(format_g(0.00001, 15), "1e-05");
        assert_eq!(format_g(-2.5, 15), "-2.5");
        assert_eq!(format_g(123456789012345.0, 15), "123456789012345");
        assert_eq!(format_g(1234567890123456.0, 15), "1.23456789012346e+15");
    }
}
