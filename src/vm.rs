// The interpreter.
//
// *Execution Model*
//
// A linked image is a flat instruction stream plus a table of named,
// typed variables. Execution starts at the `main` label when the image
// has one, at address zero otherwise, and proceeds in program order until
// an exit instruction stops the loop. Branches are logical addresses,
// i.e. indices into the instruction stream.
//
// *Flags*
//
// Three comparison flags (zero, less, greater) plus the unsigned pair
// (above, below) drive the conditional branches. cmp rewrites all five;
// every arithmetic and bitwise instruction rewrites the zero flag from
// its result so jz/jnz observe the last numeric result. For NaN operands
// cmp clears every flag.
//
// *I/O*
//
// All console traffic goes through the Console trait, so tests capture
// output and feed input without touching the process streams. The real
// implementation flushes after every print; output is observable between
// instructions.
//
// *Trust boundary*
//
// invoke calls into shared libraries through the typed descriptors the
// linker prepared. A misbehaving external function can crash the
// process; load/store dereference raw pointers for the same reason.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use regex::Regex;

use crate::config::Paths;
use crate::error::{Error, Location, Result};
use crate::ffi::{ArgValue, ModuleRegistry, RetValue};
use crate::inst::{Instruction, Opcode, Operand, OperandKind, VarType, Variable};
use crate::program::Image;

// Scratch value produced by operand evaluation. Ints, bytes and pointers
// all evaluate to Int; strings and arrays to their bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
}

// Errors from value operators, located by the caller.
enum EvalError {
    Mismatch(&'static str, &'static str),
    DivideByZero,
}

// Factors out the boiler plate in operator method implementations. The
// match table is the white-list of operand pairs which implement the
// operator; anything not included is a category mismatch.
macro_rules! operator {
    (bin $name:ident { $( $p:pat => $e:expr ),+ } ) => {
        fn $name (&self, other: &Value) -> core::result::Result<Value, EvalError> {
            use Value::*;
            #[allow(unreachable_patterns)]
            match (self, other) {
                $($p => Ok($e)),+ ,
                (a, b) => Err(EvalError::Mismatch(a.type_name(), b.type_name()))
            }
        }
    };
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Value::Int(v) => *v == 0,
            Value::Float(v) => *v == 0.0,
            Value::Str(_) => false,
        }
    }

    operator! { bin add {
        (Int(a),   Int(b))   => Int(a.wrapping_add(*b)),
        (Float(a), Float(b)) => Float(a + b)
    } }

    operator! { bin sub {
        (Int(a),   Int(b))   => Int(a.wrapping_sub(*b)),
        (Float(a), Float(b)) => Float(a - b)
    } }

    operator! { bin mul {
        (Int(a),   Int(b))   => Int(a.wrapping_mul(*b)),
        (Float(a), Float(b)) => Float(a * b)
    } }

    fn div(&self, other: &Value) -> core::result::Result<Value, EvalError> {
        use Value::*;
        match (self, other) {
            (Int(_), Int(0)) => Err(EvalError::DivideByZero),
            (Int(a), Int(b)) => Ok(Int(a.wrapping_div(*b))),
            (Float(_), Float(b)) if *b == 0.0 => Err(EvalError::DivideByZero),
            (Float(a), Float(b)) => Ok(Float(a / b)),
            (a, b) => Err(EvalError::Mismatch(a.type_name(), b.type_name())),
        }
    }

    operator! { bin bitand { (Int(a), Int(b)) => Int(a & b) } }
    operator! { bin bitor  { (Int(a), Int(b)) => Int(a | b) } }
    operator! { bin bitxor { (Int(a), Int(b)) => Int(a ^ b) } }

    fn not(&self) -> core::result::Result<Value, EvalError> {
        match self {
            Value::Int(a) => Ok(Value::Int(!a)),
            v => Err(EvalError::Mismatch(v.type_name(), "int")),
        }
    }
}

// Flag state produced by one cmp. None means the operand categories do
// not compare.
fn compare(a: &Value, b: &Value) -> Option<(bool, bool, bool, bool, bool)> {
    use Value::*;
    match (a, b) {
        (Int(a), Int(b)) => Some((
            a == b,
            a < b,
            a > b,
            (*a as u64) < (*b as u64),
            (*a as u64) > (*b as u64),
        )),
        (Float(a), Float(b)) => {
            if a.is_nan() || b.is_nan() {
                Some((false, false, false, false, false))
            } else {
                Some((a == b, a < b, a > b, a < b, a > b))
            }
        }
        (Str(a), Str(b)) => Some((a == b, a < b, a > b, a < b, a > b)),
        _ => None,
    }
}

// The printf-style specifiers a format string may carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FmtSpec {
    Int,
    Float,
    Str,
    Char,
}

// Extract the specifiers of a format string, in order. `%%` is a literal
// percent sign; anything else after `%` is an error.
pub fn scan_format(fmt: &str) -> core::result::Result<Vec<FmtSpec>, String> {
    let mut specs = Vec::new();
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.next() {
            Some('%') => {}
            Some('s') => specs.push(FmtSpec::Str),
            Some('c') => specs.push(FmtSpec::Char),
            Some('l') => match chars.next() {
                Some('d') => specs.push(FmtSpec::Int),
                Some('f') => specs.push(FmtSpec::Float),
                other => {
                    return Err(format!(
                        "unsupported specifier `%l{}`",
                        other.map(|c| c.to_string()).unwrap_or_default()
                    ));
                }
            },
            Some(c) => return Err(format!("unsupported specifier `%{}`", c)),
            None => return Err("dangling `%`".to_string()),
        }
    }
    Ok(specs)
}

lazy_static! {
    // Longest valid numeric prefix after optional whitespace, the way
    // strtol and strtod take it, so the interpreter and the emitted code
    // agree on to_int/to_float.
    static ref INT_PREFIX: Regex = Regex::new(r"^\s*([+-]?[0-9]+)").unwrap();
    static ref FLOAT_PREFIX: Regex =
        Regex::new(r"^\s*([+-]?[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?)").unwrap();
}

pub fn int_prefix(text: &str) -> Option<i64> {
    let caps = INT_PREFIX.captures(text)?;
    let digits = caps.get(1)?.as_str();
    match digits.parse::<i64>() {
        Ok(v) => Some(v),
        // Out-of-range prefixes saturate like strtol.
        Err(_) => Some(if digits.starts_with('-') {
            i64::MIN
        } else {
            i64::MAX
        }),
    }
}

pub fn float_prefix(text: &str) -> Option<f64> {
    let caps = FLOAT_PREFIX.captures(text)?;
    caps.get(1)?.as_str().parse::<f64>().ok()
}

// The type of control flow an instruction can have.
pub enum ControlFlow {
    Advance,
    Jump(usize),
    Stop(i64),
}

// Where print writes and getline reads.
pub trait Console {
    fn print(&mut self, text: &str) -> Result<()>;
    fn read_line(&mut self) -> Result<String>;
}

// The process streams. Output is flushed per print so another process
// watching the pipe sees it before the next instruction runs.
pub struct Stdio;

impl Console for Stdio {
    fn print(&mut self, text: &str) -> Result<()> {
        let mut out = io::stdout();
        out.write_all(text.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

// The entire VM state. Variables are mutated in place in the image.
pub struct VM<'a> {
    image: &'a mut Image,
    registry: ModuleRegistry,
    library_search: Vec<PathBuf>,
    pc: usize,
    running: bool,
    zero: bool,
    less: bool,
    greater: bool,
    above: bool,
    below: bool,
    call_stack: Vec<usize>,
    exit_code: i64,
}

impl<'a> VM<'a> {
    pub fn new(image: &'a mut Image, paths: &Paths) -> VM<'a> {
        VM {
            image,
            registry: ModuleRegistry::new(),
            library_search: paths.library_search(),
            pc: 0,
            running: false,
            zero: false,
            less: false,
            greater: false,
            above: false,
            below: false,
            call_stack: Vec::new(),
            exit_code: 0,
        }
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    // Run the image until it exits; the result is the program exit code.
    pub fn exec(&mut self, console: &mut impl Console) -> Result<i64> {
        self.pc = self.image.entry as usize;
        self.running = true;
        self.zero = false;
        self.less = false;
        self.greater = false;
        self.above = false;
        self.below = false;
        self.call_stack.clear();
        self.exit_code = 0;

        while self.running {
            if self.pc >= self.image.instructions.len() {
                self.running = false;
                break;
            }
            match self.step(console)? {
                ControlFlow::Advance => self.pc += 1,
                ControlFlow::Jump(address) => self.pc = address,
                ControlFlow::Stop(code) => {
                    self.exit_code = code;
                    self.running = false;
                }
            }
        }
        Ok(self.exit_code)
    }

    fn step(&mut self, console: &mut impl Console) -> Result<ControlFlow> {
        let inst = self.image.instructions[self.pc].clone();
        trace!("{} {} {:?}", self.pc, inst.opcode, self.call_stack);

        use Opcode::*;
        match inst.opcode {
            Mov => self.exec_mov(&inst),
            Load => self.exec_load(&inst),
            Store => self.exec_store(&inst),
            Add | Sub | Mul | Div => self.exec_arith(&inst),
            And | Or | Xor => self.exec_bitwise(&inst),
            Not => self.exec_not(&inst),
            Cmp => self.exec_cmp(&inst),
            Jmp | Je | Jne | Jl | Jle | Jg | Jge | Jz | Jnz | Ja | Jb => {
                self.exec_branch(&inst)
            }
            Call => self.exec_call(&inst),
            Ret => self.exec_ret(&inst),
            Invoke => self.exec_invoke(&inst),
            Print => self.exec_print(&inst, console),
            Getline => self.exec_getline(&inst, console),
            ToInt => self.exec_to_int(&inst),
            ToFloat => self.exec_to_float(&inst),
            LoadChar => self.exec_load_char(&inst),
            Exit => self.exec_exit(&inst),
        }
    }

    // ---- operand access ----------------------------------------------

    fn slot(&self, op: &Operand) -> Result<usize> {
        match op.resolved {
            Some(index) => Ok(index as usize),
            None => Err(Error::Internal(format!("unresolved operand `{}`", op.text))),
        }
    }

    fn target(&self, op: &Operand) -> Result<usize> {
        self.slot(op)
    }

    // Bytes a string or array variable currently holds. Array content
    // ends at the first NUL.
    fn var_bytes(var: &Variable) -> Vec<u8> {
        match &var.ty {
            VarType::Array { .. } => {
                let buffer = var.buffer.as_deref().unwrap_or(&[]);
                let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
                buffer[..end].to_vec()
            }
            _ => var.str_value.clone(),
        }
    }

    fn value(&self, op: &Operand) -> Result<Value> {
        match op.kind {
            OperandKind::ImmInt => op
                .text
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::Internal(format!("bad immediate `{}`", op.text))),
            OperandKind::ImmFloat => op
                .text
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| Error::Internal(format!("bad immediate `{}`", op.text))),
            OperandKind::ImmStr => Ok(Value::Str(op.text.as_bytes().to_vec())),
            OperandKind::Var => {
                let var = &self.image.vars[self.slot(op)?];
                Ok(match &var.ty {
                    VarType::Float => Value::Float(var.float_value),
                    VarType::Byte => Value::Int(var.int_value & 0xff),
                    VarType::Str | VarType::Array { .. } => Value::Str(Self::var_bytes(var)),
                    _ => Value::Int(var.int_value),
                })
            }
            OperandKind::Label => Ok(Value::Int(self.slot(op)? as i64)),
            OperandKind::Extern => {
                Err(Error::Internal(format!("`{}` has no value", op.text)))
            }
        }
    }

    fn eval_error(&self, e: EvalError, loc: &Location) -> Error {
        match e {
            EvalError::DivideByZero => Error::DivideByZero { loc: loc.clone() },
            EvalError::Mismatch(a, b) => Error::TypeMismatch {
                loc: loc.clone(),
                msg: format!("{} and {}", a, b),
            },
        }
    }

    fn assign_numeric(&mut self, slot: usize, value: Value, loc: &Location) -> Result<()> {
        let var = &mut self.image.vars[slot];
        match (&var.ty, value) {
            (VarType::Int, Value::Int(v)) => var.int_value = v,
            (VarType::Ptr, Value::Int(v)) => var.int_value = v,
            (VarType::Extern, Value::Int(v)) => var.int_value = v,
            (VarType::Byte, Value::Int(v)) => var.int_value = v & 0xff,
            (VarType::Float, Value::Float(v)) => var.float_value = v,
            (ty, value) => {
                return Err(Error::TypeMismatch {
                    loc: loc.clone(),
                    msg: format!(
                        "cannot store {} into {} `{}`",
                        value.type_name(),
                        ty,
                        var.name
                    ),
                });
            }
        }
        Ok(())
    }

    // ---- data movement -----------------------------------------------

    fn exec_mov(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let src = self.value(inst.op(1))?;
        let slot = self.slot(inst.op(0))?;
        let ty = self.image.vars[slot].ty.clone();
        match (&ty, src) {
            (VarType::Str, Value::Str(bytes)) => {
                let var = &mut self.image.vars[slot];
                let cap = var.buffer_size as usize;
                // A source that does not fit is cut to cap-1 bytes plus
                // the trailing NUL, and the zero flag records it.
                if bytes.len() <= cap {
                    var.str_value = bytes;
                    self.zero = false;
                } else {
                    var.str_value = bytes[..cap.saturating_sub(1)].to_vec();
                    self.zero = true;
                }
            }
            (VarType::Array { .. }, Value::Str(bytes)) => {
                let var = &mut self.image.vars[slot];
                if let Some(buffer) = var.buffer.as_mut() {
                    self.zero = store_into_buffer(buffer, &bytes);
                }
            }
            (_, src) => self.assign_numeric(slot, src, &inst.loc)?,
        }
        Ok(ControlFlow::Advance)
    }

    fn exec_load(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let address = match self.value(inst.op(1))? {
            Value::Int(v) => v as u64,
            other => {
                return Err(self.eval_error(
                    EvalError::Mismatch(other.type_name(), "ptr"),
                    &inst.loc,
                ));
            }
        };
        if address == 0 {
            return Err(Error::Internal("null pointer dereference".to_string()));
        }
        let value = unsafe { std::ptr::read(address as *const i64) };
        let slot = self.slot(inst.op(0))?;
        self.assign_numeric(slot, Value::Int(value), &inst.loc)?;
        Ok(ControlFlow::Advance)
    }

    fn exec_store(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let address = match self.value(inst.op(1))? {
            Value::Int(v) => v as u64,
            other => {
                return Err(self.eval_error(
                    EvalError::Mismatch(other.type_name(), "ptr"),
                    &inst.loc,
                ));
            }
        };
        if address == 0 {
            return Err(Error::Internal("null pointer dereference".to_string()));
        }
        let value = match self.value(inst.op(0))? {
            Value::Int(v) => v,
            other => {
                return Err(self.eval_error(
                    EvalError::Mismatch(other.type_name(), "int"),
                    &inst.loc,
                ));
            }
        };
        unsafe { std::ptr::write(address as *mut i64, value) };
        Ok(ControlFlow::Advance)
    }

    // ---- arithmetic and logic ----------------------------------------

    fn arith_operands(&self, inst: &Instruction) -> Result<(Value, Value)> {
        if inst.ops.len() == 3 {
            Ok((self.value(inst.op(1))?, self.value(inst.op(2))?))
        } else {
            Ok((self.value(inst.op(0))?, self.value(inst.op(1))?))
        }
    }

    fn exec_arith(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let (a, b) = self.arith_operands(inst)?;
        let result = match inst.opcode {
            Opcode::Add => a.add(&b),
            Opcode::Sub => a.sub(&b),
            Opcode::Mul => a.mul(&b),
            _ => a.div(&b),
        }
        .map_err(|e| self.eval_error(e, &inst.loc))?;
        self.zero = result.is_zero();
        let slot = self.slot(inst.op(0))?;
        self.assign_numeric(slot, result, &inst.loc)?;
        Ok(ControlFlow::Advance)
    }

    fn exec_bitwise(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let (a, b) = self.arith_operands(inst)?;
        let result = match inst.opcode {
            Opcode::And => a.bitand(&b),
            Opcode::Or => a.bitor(&b),
            _ => a.bitxor(&b),
        }
        .map_err(|e| self.eval_error(e, &inst.loc))?;
        self.zero = result.is_zero();
        let slot = self.slot(inst.op(0))?;
        self.assign_numeric(slot, result, &inst.loc)?;
        Ok(ControlFlow::Advance)
    }

    fn exec_not(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let src = if inst.ops.len() == 2 {
            self.value(inst.op(1))?
        } else {
            self.value(inst.op(0))?
        };
        let result = src.not().map_err(|e| self.eval_error(e, &inst.loc))?;
        self.zero = result.is_zero();
        let slot = self.slot(inst.op(0))?;
        self.assign_numeric(slot, result, &inst.loc)?;
        Ok(ControlFlow::Advance)
    }

    // ---- compare and branch ------------------------------------------

    fn exec_cmp(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let a = self.value(inst.op(0))?;
        let b = self.value(inst.op(1))?;
        match compare(&a, &b) {
            Some((zero, less, greater, below, above)) => {
                self.zero = zero;
                self.less = less;
                self.greater = greater;
                self.below = below;
                self.above = above;
                Ok(ControlFlow::Advance)
            }
            None => Err(self.eval_error(
                EvalError::Mismatch(a.type_name(), b.type_name()),
                &inst.loc,
            )),
        }
    }

    fn exec_branch(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        use Opcode::*;
        let take = match inst.opcode {
            Jmp => true,
            Je | Jz => self.zero,
            Jne | Jnz => !self.zero,
            Jl => self.less,
            Jle => self.less || self.zero,
            Jg => self.greater,
            Jge => self.greater || self.zero,
            Ja => self.above,
            Jb => self.below,
            _ => false,
        };
        if take {
            Ok(ControlFlow::Jump(self.target(inst.op(0))?))
        } else {
            Ok(ControlFlow::Advance)
        }
    }

    fn exec_call(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        self.call_stack.push(self.pc + 1);
        Ok(ControlFlow::Jump(self.target(inst.op(0))?))
    }

    fn exec_ret(&mut self, _inst: &Instruction) -> Result<ControlFlow> {
        match self.call_stack.pop() {
            Some(address) => Ok(ControlFlow::Jump(address)),
            None => Err(Error::Internal("call stack underflow".to_string())),
        }
    }

    fn exec_exit(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        match self.value(inst.op(0))? {
            Value::Int(code) => Ok(ControlFlow::Stop(code)),
            other => Err(self.eval_error(
                EvalError::Mismatch(other.type_name(), "int"),
                &inst.loc,
            )),
        }
    }

    // ---- conversions -------------------------------------------------

    fn string_operand(&self, op: &Operand, loc: &Location) -> Result<String> {
        match self.value(op)? {
            Value::Str(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            other => Err(self.eval_error(
                EvalError::Mismatch(other.type_name(), "string"),
                loc,
            )),
        }
    }

    fn exec_to_int(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let text = self.string_operand(inst.op(1), &inst.loc)?;
        let slot = self.slot(inst.op(0))?;
        match int_prefix(&text) {
            Some(v) => {
                self.assign_numeric(slot, Value::Int(v), &inst.loc)?;
                self.zero = false;
            }
            None => {
                self.assign_numeric(slot, Value::Int(0), &inst.loc)?;
                self.zero = true;
            }
        }
        Ok(ControlFlow::Advance)
    }

    fn exec_to_float(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let text = self.string_operand(inst.op(1), &inst.loc)?;
        let slot = self.slot(inst.op(0))?;
        match float_prefix(&text) {
            Some(v) => {
                self.assign_numeric(slot, Value::Float(v), &inst.loc)?;
                self.zero = false;
            }
            None => {
                self.assign_numeric(slot, Value::Float(0.0), &inst.loc)?;
                self.zero = true;
            }
        }
        Ok(ControlFlow::Advance)
    }

    fn exec_load_char(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let text = self.string_operand(inst.op(1), &inst.loc)?;
        let byte = text.as_bytes().first().copied().unwrap_or(0);
        let slot = self.slot(inst.op(0))?;
        self.assign_numeric(slot, Value::Int(byte as i64), &inst.loc)?;
        Ok(ControlFlow::Advance)
    }

    // ---- I/O ---------------------------------------------------------

    fn exec_print(
        &mut self,
        inst: &Instruction,
        console: &mut impl Console,
    ) -> Result<ControlFlow> {
        let fmt = self.string_operand(inst.op(0), &inst.loc)?;
        let specs = scan_format(&fmt).map_err(|msg| Error::FormatMismatch {
            loc: inst.loc.clone(),
            msg,
        })?;
        let args = &inst.ops[1..];
        if specs.len() != args.len() {
            return Err(Error::FormatMismatch {
                loc: inst.loc.clone(),
                msg: format!(
                    "format expects {} arguments, found {}",
                    specs.len(),
                    args.len()
                ),
            });
        }

        let mut values = Vec::new();
        for op in args {
            values.push(self.value(op)?);
        }

        let mut text = String::new();
        let mut next = 0;
        let mut chars = fmt.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                text.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => text.push('%'),
                Some(spec) => {
                    if spec == 'l' {
                        chars.next();
                    }
                    let value = &values[next];
                    match (specs[next], value) {
                        (FmtSpec::Int, Value::Int(v)) => text.push_str(&format!("{}", v)),
                        (FmtSpec::Float, Value::Float(v)) => {
                            text.push_str(&format!("{:.6}", v))
                        }
                        (FmtSpec::Str, Value::Str(bytes)) => {
                            text.push_str(&String::from_utf8_lossy(bytes))
                        }
                        (FmtSpec::Char, Value::Int(v)) => {
                            text.push((*v as u8) as char)
                        }
                        (spec, value) => {
                            return Err(Error::FormatMismatch {
                                loc: inst.loc.clone(),
                                msg: format!(
                                    "argument {} is {}, specifier wants {:?}",
                                    next + 1,
                                    value.type_name(),
                                    spec
                                ),
                            });
                        }
                    }
                    next += 1;
                }
                None => {}
            }
        }
        console.print(&text)?;
        Ok(ControlFlow::Advance)
    }

    fn exec_getline(
        &mut self,
        inst: &Instruction,
        console: &mut impl Console,
    ) -> Result<ControlFlow> {
        let line = console.read_line()?;
        let bytes = line.into_bytes();
        let slot = self.slot(inst.op(0))?;
        let var = &mut self.image.vars[slot];
        // Truncation is silent here and keeps as much as fgets would:
        // everything up to the buffer size less the NUL.
        match &var.ty {
            VarType::Str => {
                let cap = var.buffer_size as usize;
                let n = bytes.len().min(cap);
                var.str_value = bytes[..n].to_vec();
            }
            VarType::Array { count } => {
                let n = bytes.len().min(*count as usize - 1);
                if let Some(buffer) = var.buffer.as_mut() {
                    for b in buffer.iter_mut() {
                        *b = 0;
                    }
                    buffer[..n].copy_from_slice(&bytes[..n]);
                }
            }
            ty => {
                return Err(Error::TypeMismatch {
                    loc: inst.loc.clone(),
                    msg: format!("getline destination `{}` is {}", var.name, ty),
                });
            }
        }
        Ok(ControlFlow::Advance)
    }

    // ---- external calls ----------------------------------------------

    fn exec_invoke(&mut self, inst: &Instruction) -> Result<ControlFlow> {
        let index = self.slot(inst.op(0))?;
        let target = self.image.calls[index].clone();

        // Buffers lent to the callee stay alive in `holders` (immediates)
        // or inside the variables themselves (string and array operands).
        let mut holders: Vec<Vec<u8>> = Vec::new();
        let mut lent: Vec<usize> = Vec::new();
        let mut args = Vec::new();

        for op in &inst.ops[1..] {
            match op.kind {
                OperandKind::ImmFloat | OperandKind::ImmInt => {
                    match self.value(op)? {
                        Value::Float(v) => args.push(ArgValue::Float(v)),
                        Value::Int(v) => args.push(ArgValue::Int(v)),
                        Value::Str(_) => {}
                    }
                }
                OperandKind::ImmStr => {
                    let mut bytes = op.text.as_bytes().to_vec();
                    bytes.push(0);
                    holders.push(bytes);
                    let ptr = holders[holders.len() - 1].as_ptr();
                    args.push(ArgValue::Int(ptr as i64));
                }
                _ => {
                    let slot = self.slot(op)?;
                    let var = &mut self.image.vars[slot];
                    match var.ty.clone() {
                        VarType::Float => args.push(ArgValue::Float(var.float_value)),
                        VarType::Str => {
                            // Rebuild the native buffer: content, NUL,
                            // zero padding out to the declared capacity.
                            let mut buffer = var.str_value.clone();
                            let size = (var.buffer_size as usize + 1).max(buffer.len() + 1);
                            buffer.resize(size, 0);
                            var.buffer = Some(buffer);
                            let ptr = var
                                .buffer
                                .as_ref()
                                .map(|b| b.as_ptr())
                                .unwrap_or(std::ptr::null());
                            args.push(ArgValue::Int(ptr as i64));
                            lent.push(slot);
                        }
                        VarType::Array { .. } => {
                            let ptr = var
                                .buffer
                                .as_ref()
                                .map(|b| b.as_ptr())
                                .unwrap_or(std::ptr::null());
                            args.push(ArgValue::Int(ptr as i64));
                        }
                        _ => args.push(ArgValue::Int(var.int_value)),
                    }
                }
            }
        }

        debug!("invoke {}.{}", target.module, target.symbol);
        let ret = self.registry.call(
            &target.module,
            &target.symbol,
            &target.sig,
            &args,
            &self.library_search,
        )?;

        // The callee may have written into a lent string buffer.
        for slot in lent {
            let var = &mut self.image.vars[slot];
            if let Some(buffer) = &var.buffer {
                let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
                var.str_value = buffer[..end].to_vec();
            }
        }

        // By convention the return value lands in `result` when the
        // program declares it.
        if let Some(slot) = self.image.var_index.get("result").copied() {
            match ret {
                RetValue::Int(v) => {
                    self.assign_numeric(slot, Value::Int(v), &inst.loc)?;
                }
                RetValue::Ptr(v) => {
                    self.assign_numeric(slot, Value::Int(v as i64), &inst.loc)?;
                }
                RetValue::Float(v) => {
                    self.assign_numeric(slot, Value::Float(v), &inst.loc)?;
                }
                RetValue::Void => {}
            }
        }
        Ok(ControlFlow::Advance)
    }
}

// Zero the buffer and copy what fits. The last buffer byte is reserved
// for a NUL, and truncation leaves a NUL slot inside the content area,
// mirroring the native copy helper.
fn store_into_buffer(buffer: &mut Vec<u8>, bytes: &[u8]) -> bool {
    let cap = buffer.len().saturating_sub(1);
    for b in buffer.iter_mut() {
        *b = 0;
    }
    let (n, truncated) = if bytes.len() <= cap {
        (bytes.len(), false)
    } else {
        (cap.saturating_sub(1), true)
    };
    buffer[..n].copy_from_slice(&bytes[..n]);
    truncated
}

// These tests are written against the *behavior* of the VM: programs go
// through the real parser, validator and linker, and any conforming
// implementation should pass them.
#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::Paths;
    use crate::parser::Loader;
    use crate::program::link;
    use crate::validate::validate;

    struct TestConsole {
        out: String,
        input: VecDeque<String>,
    }

    impl TestConsole {
        fn new() -> TestConsole {
            TestConsole {
                out: String::new(),
                input: VecDeque::new(),
            }
        }

        fn with_input(lines: &[&str]) -> TestConsole {
            TestConsole {
                out: String::new(),
                input: lines.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl Console for TestConsole {
        fn print(&mut self, text: &str) -> Result<()> {
            self.out.push_str(text);
            Ok(())
        }

        fn read_line(&mut self) -> Result<String> {
            Ok(self.input.pop_front().unwrap_or_default())
        }
    }

    fn try_build(text: &str) -> Result<Image> {
        let mut loader = Loader::new(Paths::default());
        let mut program = loader.load_source("test.mxvm", text)?;
        validate(&mut program)?;
        link(program)
    }

    fn build(text: &str) -> Image {
        try_build(text).unwrap()
    }

    fn run_with(text: &str, console: &mut TestConsole) -> (Result<i64>, Image) {
        let mut image = build(text);
        let result = {
            let mut vm = VM::new(&mut image, &Paths::default());
            vm.exec(console)
        };
        (result, image)
    }

    fn run(text: &str) -> (i64, String) {
        let mut console = TestConsole::new();
        let (result, _) = run_with(text, &mut console);
        (result.unwrap(), console.out)
    }

    // Errors from any phase, build or run.
    fn run_err(text: &str) -> Error {
        match try_build(text) {
            Err(e) => e,
            Ok(mut image) => {
                let mut console = TestConsole::new();
                let mut vm = VM::new(&mut image, &Paths::default());
                vm.exec(&mut console).unwrap_err()
            }
        }
    }

    #[test]
    fn test_arithmetic_scenario() {
        let (code, out) = run(
            r#"program t {
    section data {
        int a = 2
        int b = 3
        int c
        string fmt = "%ld\n"
    }
    section code {
    main:
        mov c, a
        add c, b
        print fmt, c
        exit 0
    }
}"#,
        );
        assert_eq!(out, "5\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn test_counting_loop() {
        let (code, out) = run(
            r#"program t {
    section data {
        int i = 1
        int limit = 5
        string fmt = "%ld\n"
    }
    section code {
    main:
    loop:
        cmp i, limit
        jg done
        print fmt, i
        add i, 1
        jmp loop
    done:
        exit 0
    }
}"#,
        );
        assert_eq!(out, "1\n2\n3\n4\n5\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn test_exit_code_passes_through() {
        let (code, _) = run("program t { section code {\n exit 7\n } }");
        assert_eq!(code, 7);
    }

    #[test]
    fn test_divide_by_zero() {
        let err = run_err(
            "program t { section data {\n int a = 1\n int z\n } section code {\n div a, z\n exit 0\n } }",
        );
        assert!(matches!(err, Error::DivideByZero { .. }));
        assert!(format!("{}", err).contains("DivideByZero"));
    }

    #[test]
    fn test_float_divide_by_zero() {
        let err = run_err(
            "program t { section data {\n float a = 1.0\n float z\n } section code {\n div a, z\n exit 0\n } }",
        );
        assert!(matches!(err, Error::DivideByZero { .. }));
    }

    #[test]
    fn test_int_overflow_wraps() {
        let (_, out) = run(
            r#"program t {
    section data {
        int a = 9223372036854775807
        string fmt = "%ld\n"
    }
    section code {
        add a, 1
        print fmt, a
        exit 0
    }
}"#,
        );
        assert_eq!(out, "-9223372036854775808\n");
    }

    #[test]
    fn test_string_truncation_sets_zero_flag() {
        let (result, image) = run_with(
            r#"program t {
    section data {
        string s = "hi"
        string big = "hello"
        string yes = "T\n"
    }
    section code {
        mov s, big
        jne done
        print yes
    done:
        exit 0
    }
}"#,
            &mut TestConsole::new(),
        );
        assert_eq!(result.unwrap(), 0);
        let s = image.variable("s").unwrap();
        assert_eq!(s.str_value, b"h");
    }

    #[test]
    fn test_string_truncation_prints_marker() {
        // Same program, observing ZF through je.
        let (_, out) = run(
            r#"program t {
    section data {
        string s = "hi"
        string big = "hello"
        string yes = "T\n"
    }
    section code {
        mov s, big
        je trunc
        exit 0
    trunc:
        print yes
        exit 0
    }
}"#,
        );
        assert_eq!(out, "T\n");
    }

    #[test]
    fn test_call_ret_balance() {
        let text = r#"program t {
    section data {
        int n
        string fmt = "%ld\n"
    }
    section code {
    main:
        call bump
        call bump
        print fmt, n
        exit 0
    bump:
        add n, 1
        ret
    }
}"#;
        let mut image = build(text);
        let mut console = TestConsole::new();
        let mut vm = VM::new(&mut image, &Paths::default());
        let code = vm.exec(&mut console).unwrap();
        assert_eq!(code, 0);
        assert_eq!(vm.call_depth(), 0);
        assert_eq!(console.out, "2\n");
    }

    #[test]
    fn test_ret_without_call() {
        let err = run_err("program t { section code {\n ret\n } }");
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_jz_tracks_arithmetic_result() {
        let (_, out) = run(
            r#"program t {
    section data {
        int a = 5
        string hit = "Z\n"
    }
    section code {
        sub a, a
        jz zero
        exit 1
    zero:
        print hit
        exit 0
    }
}"#,
        );
        assert_eq!(out, "Z\n");
    }

    #[test]
    fn test_unsigned_branches_reinterpret_cmp() {
        // -1 is below 1 signed, above it unsigned.
        let (_, out) = run(
            r#"program t {
    section data {
        int a = -1
        int b = 1
        string s1 = "signed-less\n"
        string s2 = "unsigned-above\n"
    }
    section code {
        cmp a, b
        jl signed_less
        exit 1
    signed_less:
        print s1
        cmp a, b
        ja unsigned_above
        exit 1
    unsigned_above:
        print s2
        exit 0
    }
}"#,
        );
        assert_eq!(out, "signed-less\nunsigned-above\n");
    }

    #[test]
    fn test_string_compare_is_lexicographic() {
        let (_, out) = run(
            r#"program t {
    section data {
        string a = "abc"
        string b = "abd"
        string lt = "lt\n"
    }
    section code {
        cmp a, b
        jl less
        exit 1
    less:
        print lt
        exit 0
    }
}"#,
        );
        assert_eq!(out, "lt\n");
    }

    #[test]
    fn test_compare_flags_exclusive_and_nan_clears() {
        // Finite operands set exactly one of less/equal/greater.
        for (a, b) in &[(1i64, 2i64), (2, 2), (3, 2)] {
            let flags = compare(&Value::Int(*a), &Value::Int(*b)).unwrap();
            let (zero, less, greater, _, _) = flags;
            assert_eq!(
                [zero, less, greater].iter().filter(|f| **f).count(),
                1,
                "{} vs {}",
                a,
                b
            );
        }
        let flags = compare(&Value::Float(f64::NAN), &Value::Float(1.0)).unwrap();
        assert_eq!(flags, (false, false, false, false, false));
        assert_eq!(compare(&Value::Int(1), &Value::Float(1.0)), None);
    }

    #[test]
    fn test_to_int_parses_and_flags_failure() {
        let (_, out) = run(
            r#"program t {
    section data {
        int v
        string good = " 42x"
        string bad = "abc"
        string fmt = "%ld\n"
        string failed = "failed\n"
    }
    section code {
        to_int v, good
        print fmt, v
        to_int v, bad
        jz bad_input
        exit 1
    bad_input:
        print failed
        print fmt, v
        exit 0
    }
}"#,
        );
        assert_eq!(out, "42\nfailed\n0\n");
    }

    #[test]
    fn test_to_float_and_formatting() {
        let (_, out) = run(
            r#"program t {
    section data {
        float f
        string src = "2.5"
        string fmt = "%lf\n"
    }
    section code {
        to_float f, src
        print fmt, f
        exit 0
    }
}"#,
        );
        assert_eq!(out, "2.500000\n");
    }

    #[test]
    fn test_print_specifiers() {
        let (_, out) = run(
            r#"program t {
    section data {
        int n = 65
        float f = 1.5
        string s = "str"
        string fmt = "%ld %lf %s %c %%\n"
    }
    section code {
        print fmt, n, f, s, n
        exit 0
    }
}"#,
        );
        assert_eq!(out, "65 1.500000 str A %\n");
    }

    #[test]
    fn test_print_arity_mismatch() {
        let err = run_err(
            "program t { section data {\n string fmt = \"%ld\"\n } section code {\n print fmt\n exit 0\n } }",
        );
        assert!(matches!(err, Error::FormatMismatch { .. }));
    }

    #[test]
    fn test_print_category_mismatch() {
        let err = run_err(
            "program t { section data {\n string fmt = \"%ld\"\n float f\n } section code {\n print fmt, f\n exit 0\n } }",
        );
        assert!(matches!(err, Error::FormatMismatch { .. }));
    }

    #[test]
    fn test_getline_into_buffer() {
        let text = r#"program t {
    section data {
        int v
        array buf = 32
        string fmt = "%ld\n"
    }
    section code {
        getline buf
        to_int v, buf
        print fmt, v
        exit 0
    }
}"#;
        let mut console = TestConsole::with_input(&["42"]);
        let (result, _) = run_with(text, &mut console);
        assert_eq!(result.unwrap(), 0);
        assert_eq!(console.out, "42\n");
    }

    #[test]
    fn test_getline_truncates_silently() {
        let text = r#"program t {
    section data {
        array buf = 4
        string fmt = "%s\n"
    }
    section code {
        getline buf
        print fmt, buf
        exit 0
    }
}"#;
        let mut console = TestConsole::with_input(&["abcdefgh"]);
        let (result, _) = run_with(text, &mut console);
        assert_eq!(result.unwrap(), 0);
        assert_eq!(console.out, "abc\n");
    }

    #[test]
    fn test_load_char() {
        let (_, out) = run(
            r#"program t {
    section data {
        int c
        string s = "Q"
        string fmt = "%c\n"
    }
    section code {
        load_char c, s
        print fmt, c
        exit 0
    }
}"#,
        );
        assert_eq!(out, "Q\n");
    }

    #[test]
    fn test_mov_rejects_implicit_widening() {
        // int to float travels through to_float only.
        let err = run_err(
            "program t { section data {\n float f\n int n\n } section code {\n mov f, n\n exit 0\n } }",
        );
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_byte_wraps() {
        let (_, out) = run(
            r#"program t {
    section data {
        byte b = 10
        string fmt = "%ld\n"
    }
    section code {
        add b, 250
        print fmt, b
        exit 0
    }
}"#,
        );
        assert_eq!(out, "4\n");
    }

    #[test]
    fn test_numeric_prefixes() {
        assert_eq!(int_prefix(" 42x"), Some(42));
        assert_eq!(int_prefix("-7"), Some(-7));
        assert_eq!(int_prefix("abc"), None);
        assert_eq!(int_prefix("99999999999999999999"), Some(i64::MAX));
        assert_eq!(int_prefix("-99999999999999999999"), Some(i64::MIN));
        assert_eq!(float_prefix("2.5rest"), Some(2.5));
        assert_eq!(float_prefix("1e3"), Some(1000.0));
        assert_eq!(float_prefix("x"), None);
    }

    #[test]
    fn test_scan_format() {
        assert_eq!(
            scan_format("%ld %lf %s %c %%").unwrap(),
            vec![FmtSpec::Int, FmtSpec::Float, FmtSpec::Str, FmtSpec::Char]
        );
        assert!(scan_format("%d").is_err());
        assert!(scan_format("tail%").is_err());
    }
}
