// x86_64 code generation.
//
// The emitter lowers a linked image to one GNU-as file in AT&T syntax,
// System V AMD64, position independent. The observable behavior of the
// assembled binary matches the interpreter: every variable becomes a
// labeled storage location, every IR instruction a fixed native sequence,
// and the five comparison flags live in byte-sized pseudo-flag cells in
// .bss, updated exactly where the interpreter updates its own.
//
// Two choices keep the stack pointer 16-byte aligned at every external
// call: IR call/ret use a software return stack in .bss instead of the
// native one, and stack-passed invoke arguments are padded to 16 bytes.
//
// Output is deterministic byte for byte: variables emit in declaration
// order, extern declarations sorted, literal pools in first-use order,
// and no timestamps anywhere.

use crate::error::{Error, Result};
use crate::ffi::{ArgCat, RetCat};
use crate::inst::{Category, Instruction, Opcode, Operand, OperandKind, VarType, Variable};
use crate::program::Image;
use crate::vm::{scan_format, FmtSpec};

// Integer argument registers, in order.
const INT_ARG_REGS: &[&str] = &["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];
// Registers printf varargs may take after the format string.
const PRINTF_ARG_REGS: &[&str] = &["%rsi", "%rdx", "%rcx", "%r8", "%r9"];

const LIBC_EXTERNS: &[&str] = &[
    "exit", "fflush", "fgets", "fputs", "printf", "stderr", "stdin", "stdout",
    "strcmp", "strlen", "strtod", "strtol",
];

pub fn emit(image: &Image) -> Result<String> {
    Emitter::new(image).run()
}

struct Emitter<'a> {
    image: &'a Image,
    code: String,
    // Literal pools, in first-use order.
    floats: Vec<u64>,
    strings: Vec<Vec<u8>>,
}

impl<'a> Emitter<'a> {
    fn new(image: &'a Image) -> Emitter<'a> {
        Emitter {
            image,
            code: String::new(),
            floats: Vec::new(),
            strings: Vec::new(),
        }
    }

    fn run(mut self) -> Result<String> {
        let image = self.image;
        for (index, inst) in image.instructions.iter().enumerate() {
            self.emit_labels_at(index as u64);
            self.push(&format!(".L{}:", index));
            self.emit_instruction(index, inst)?;
        }
        // A jump past the last instruction stops cleanly.
        self.push(&format!(".L{}:", image.instructions.len()));
        self.op("movl $0, %edi");
        self.op("call exit@PLT");

        let mut out = String::new();
        out.push_str(&self.header());
        out.push_str(&self.data_sections());
        out.push_str("        .text\n        .globl main\nmain:\n");
        out.push_str("        pushq %rbp\n        movq %rsp, %rbp\n");
        if self.image.entry != 0 {
            out.push_str(&format!("        jmp .L{}\n", self.image.entry));
        }
        out.push_str(&self.code);
        out.push_str(HELPERS);
        out.push_str(&self.rodata());
        Ok(out)
    }

    // ---- assembly text plumbing --------------------------------------

    fn push(&mut self, line: &str) {
        self.code.push_str(line);
        self.code.push('\n');
    }

    fn op(&mut self, text: &str) {
        self.code.push_str("        ");
        self.code.push_str(text);
        self.code.push('\n');
    }

    fn header(&self) -> String {
        let mut externs: Vec<String> =
            LIBC_EXTERNS.iter().map(|s| s.to_string()).collect();
        for ext in &self.image.externs {
            externs.push(ext.symbol.clone());
        }
        externs.sort();
        externs.dedup();

        let mut out = format!("# mxvm x86_64 translation of {}\n", self.image.name);
        for name in externs {
            out.push_str(&format!("        .extern {}\n", name));
        }
        out
    }

    fn data_sections(&self) -> String {
        let mut data = String::from("        .data\n");
        let mut bss = String::from("        .bss\n");
        for var in &self.image.vars {
            match &var.ty {
                VarType::Extern => {}
                VarType::Int | VarType::Ptr => {
                    if var.int_value != 0 {
                        data.push_str(&format!(
                            "        .align 8\n{}:\n        .quad {}\n",
                            var.name, var.int_value
                        ));
                    } else {
                        bss.push_str(&format!(
                            "        .align 8\n{}:\n        .zero 8\n",
                            var.name
                        ));
                    }
                }
                VarType::Byte => {
                    if var.int_value != 0 {
                        data.push_str(&format!(
                            "{}:\n        .byte {}\n",
                            var.name,
                            var.int_value & 0xff
                        ));
                    } else {
                        bss.push_str(&format!("{}:\n        .zero 1\n", var.name));
                    }
                }
                VarType::Float => {
                    if var.float_value != 0.0 {
                        data.push_str(&format!(
                            "        .align 8\n{}:\n        .double {:?}\n",
                            var.name, var.float_value
                        ));
                    } else {
                        bss.push_str(&format!(
                            "        .align 8\n{}:\n        .zero 8\n",
                            var.name
                        ));
                    }
                }
                // Strings reserve capacity + 1 so a NUL always follows
                // the content.
                VarType::Str => {
                    let cap = var.buffer_size as usize;
                    if var.str_value.is_empty() {
                        bss.push_str(&format!(
                            "{}:\n        .zero {}\n",
                            var.name,
                            cap + 1
                        ));
                    } else {
                        data.push_str(&format!(
                            "{}:\n        .asciz \"{}\"\n",
                            var.name,
                            escape_bytes(&var.str_value)
                        ));
                        let pad = cap - var.str_value.len();
                        if pad > 0 {
                            data.push_str(&format!("        .zero {}\n", pad));
                        }
                    }
                }
                VarType::Array { count } => {
                    bss.push_str(&format!("{}:\n        .zero {}\n", var.name, count));
                }
            }
        }

        bss.push_str(FLAG_CELLS);
        let mut out = data;
        out.push_str(&bss);
        out
    }

    fn rodata(&self) -> String {
        let mut out = String::from("        .section .rodata\n");
        out.push_str(".LCdiverr:\n        .asciz \"mxvm: DivideByZero\\n\"\n");
        for (i, bits) in self.floats.iter().enumerate() {
            out.push_str(&format!(
                "        .align 8\n.LCf{}:\n        .double {:?}\n",
                i,
                f64::from_bits(*bits)
            ));
        }
        for (i, bytes) in self.strings.iter().enumerate() {
            out.push_str(&format!(
                ".LCs{}:\n        .asciz \"{}\"\n",
                i,
                escape_bytes(bytes)
            ));
        }
        out
    }

    fn emit_labels_at(&mut self, address: u64) {
        let mut names: Vec<String> = self
            .image
            .labels
            .iter()
            .filter(|(_, l)| l.exported && l.address == address)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        for name in names {
            self.code
                .push_str(&format!("        .globl {}\n{}:\n", name, name));
        }
    }

    // ---- operand access ----------------------------------------------

    fn var_of(&self, op: &Operand) -> Result<&Variable> {
        match op.resolved {
            Some(slot) => Ok(&self.image.vars[slot as usize]),
            None => Err(Error::Internal(format!("unresolved operand `{}`", op.text))),
        }
    }

    fn category(&self, op: &Operand) -> Result<Category> {
        Ok(match op.kind {
            OperandKind::ImmInt => Category::Int,
            OperandKind::ImmFloat => Category::Float,
            OperandKind::ImmStr => Category::Str,
            OperandKind::Var => self.var_of(op)?.ty.category(),
            _ => Category::Int,
        })
    }

    fn float_slot(&mut self, value: f64) -> usize {
        let bits = value.to_bits();
        match self.floats.iter().position(|b| *b == bits) {
            Some(i) => i,
            None => {
                self.floats.push(bits);
                self.floats.len() - 1
            }
        }
    }

    fn string_slot(&mut self, bytes: &[u8]) -> usize {
        match self.strings.iter().position(|b| b == bytes) {
            Some(i) => i,
            None => {
                self.strings.push(bytes.to_vec());
                self.strings.len() - 1
            }
        }
    }

    // Load an int-category operand into `reg`.
    fn load_int(&mut self, op: &Operand, reg: &str) -> Result<()> {
        match op.kind {
            OperandKind::ImmInt => {
                let value: i64 = op.text.parse().map_err(|_| {
                    Error::Internal(format!("bad immediate `{}`", op.text))
                })?;
                if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
                    self.op(&format!("movq ${}, {}", value, reg));
                } else {
                    self.op(&format!("movabsq ${}, {}", value, reg));
                }
            }
            OperandKind::Var => {
                let var = self.var_of(op)?;
                let (name, byte) = (var.name.clone(), var.ty == VarType::Byte);
                if byte {
                    self.op(&format!("movzbq {}(%rip), {}", name, reg));
                } else {
                    self.op(&format!("movq {}(%rip), {}", name, reg));
                }
            }
            _ => {
                return Err(Error::Internal(format!(
                    "`{}` is not an integer operand",
                    op.text
                )));
            }
        }
        Ok(())
    }

    // Store %rax into an int-category destination variable.
    fn store_int_rax(&mut self, op: &Operand) -> Result<()> {
        let var = self.var_of(op)?;
        let (name, byte) = (var.name.clone(), var.ty == VarType::Byte);
        if byte {
            self.op(&format!("movb %al, {}(%rip)", name));
        } else {
            self.op(&format!("movq %rax, {}(%rip)", name));
        }
        Ok(())
    }

    fn load_float(&mut self, op: &Operand, xmm: &str) -> Result<()> {
        match op.kind {
            OperandKind::ImmFloat => {
                let value: f64 = op.text.parse().map_err(|_| {
                    Error::Internal(format!("bad immediate `{}`", op.text))
                })?;
                let slot = self.float_slot(value);
                self.op(&format!("movsd .LCf{}(%rip), {}", slot, xmm));
            }
            OperandKind::Var => {
                let name = self.var_of(op)?.name.clone();
                self.op(&format!("movsd {}(%rip), {}", name, xmm));
            }
            _ => {
                return Err(Error::Internal(format!(
                    "`{}` is not a float operand",
                    op.text
                )));
            }
        }
        Ok(())
    }

    // Address of a string or array operand into `reg`.
    fn load_str_addr(&mut self, op: &Operand, reg: &str) -> Result<()> {
        match op.kind {
            OperandKind::ImmStr => {
                let slot = self.string_slot(op.text.as_bytes());
                self.op(&format!("leaq .LCs{}(%rip), {}", slot, reg));
            }
            OperandKind::Var => {
                let name = self.var_of(op)?.name.clone();
                self.op(&format!("leaq {}(%rip), {}", name, reg));
            }
            _ => {
                return Err(Error::Internal(format!(
                    "`{}` is not a string operand",
                    op.text
                )));
            }
        }
        Ok(())
    }

    fn set_zero_flag_from_rax(&mut self) {
        self.op("testq %rax, %rax");
        self.op("sete mxvm_zf(%rip)");
    }

    fn set_zero_flag_from_xmm0(&mut self) {
        self.op("pxor %xmm2, %xmm2");
        self.op("ucomisd %xmm2, %xmm0");
        self.op("setnp %al");
        self.op("sete %cl");
        self.op("andb %cl, %al");
        self.op("movb %al, mxvm_zf(%rip)");
    }

    fn flush_stdout(&mut self) {
        self.op("movq stdout@GOTPCREL(%rip), %rax");
        self.op("movq (%rax), %rdi");
        self.op("call fflush@PLT");
    }

    // ---- per-instruction lowering ------------------------------------

    fn emit_instruction(&mut self, index: usize, inst: &Instruction) -> Result<()> {
        use Opcode::*;
        match inst.opcode {
            Mov => self.emit_mov(inst),
            Load => self.emit_load(inst),
            Store => self.emit_store(inst),
            Add | Sub | Mul | Div => self.emit_arith(index, inst),
            And | Or | Xor => self.emit_bitwise(inst),
            Not => self.emit_not(inst),
            Cmp => self.emit_cmp(index, inst),
            Jmp | Je | Jne | Jl | Jle | Jg | Jge | Jz | Jnz | Ja | Jb => {
                self.emit_branch(inst)
            }
            Call => self.emit_call(index, inst),
            Ret => {
                self.op("decq mxvm_retsp(%rip)");
                self.op("movq mxvm_retsp(%rip), %rax");
                self.op("leaq mxvm_retstack(%rip), %rcx");
                self.op("movq (%rcx,%rax,8), %rax");
                self.op("jmp *%rax");
                Ok(())
            }
            Invoke => self.emit_invoke(inst),
            Print => self.emit_print(inst),
            Getline => self.emit_getline(inst),
            ToInt => self.emit_conversion(inst, "mxvm_to_int"),
            ToFloat => self.emit_conversion(inst, "mxvm_to_float"),
            LoadChar => self.emit_load_char(inst),
            Exit => {
                self.load_int(inst.op(0), "%rdi")?;
                self.op("call exit@PLT");
                Ok(())
            }
        }
    }

    fn emit_mov(&mut self, inst: &Instruction) -> Result<()> {
        let dst = self.var_of(inst.op(0))?;
        let (name, ty, cap) = (dst.name.clone(), dst.ty.clone(), dst.buffer_size);
        match ty.category() {
            Category::Int => {
                self.load_int(inst.op(1), "%rax")?;
                self.store_int_rax(inst.op(0))?;
            }
            Category::Float => {
                self.load_float(inst.op(1), "%xmm0")?;
                self.op(&format!("movsd %xmm0, {}(%rip)", name));
            }
            Category::Str => {
                // Arrays reserve their last byte for the NUL the copy
                // helper writes; string buffers carry an extra slot.
                let size = match ty {
                    VarType::Array { count } => count.saturating_sub(1),
                    _ => cap,
                };
                self.op(&format!("leaq {}(%rip), %rdi", name));
                self.load_str_addr(inst.op(1), "%rsi")?;
                self.op(&format!("movq ${}, %rdx", size));
                self.op("call mxvm_strcopy");
            }
        }
        Ok(())
    }

    fn emit_load(&mut self, inst: &Instruction) -> Result<()> {
        self.load_int(inst.op(1), "%rax")?;
        self.op("movq (%rax), %rax");
        self.store_int_rax(inst.op(0))
    }

    fn emit_store(&mut self, inst: &Instruction) -> Result<()> {
        self.load_int(inst.op(1), "%rcx")?;
        self.load_int(inst.op(0), "%rax")?;
        self.op("movq %rax, (%rcx)");
        Ok(())
    }

    fn arith_sources<'b>(&self, inst: &'b Instruction) -> (&'b Operand, &'b Operand) {
        if inst.ops.len() == 3 {
            (inst.op(1), inst.op(2))
        } else {
            (inst.op(0), inst.op(1))
        }
    }

    fn emit_arith(&mut self, index: usize, inst: &Instruction) -> Result<()> {
        let (a, b) = self.arith_sources(inst);
        let (a, b) = (a.clone(), b.clone());
        if self.category(inst.op(0))? == Category::Float {
            self.load_float(&a, "%xmm0")?;
            self.load_float(&b, "%xmm1")?;
            match inst.opcode {
                Opcode::Add => self.op("addsd %xmm1, %xmm0"),
                Opcode::Sub => self.op("subsd %xmm1, %xmm0"),
                Opcode::Mul => self.op("mulsd %xmm1, %xmm0"),
                _ => {
                    self.op("pxor %xmm2, %xmm2");
                    self.op("ucomisd %xmm2, %xmm1");
                    self.op(&format!("jp .Lfd{}", index));
                    self.op(&format!("jne .Lfd{}", index));
                    self.op("call mxvm_div_zero");
                    self.push(&format!(".Lfd{}:", index));
                    self.op("divsd %xmm1, %xmm0");
                }
            }
            self.set_zero_flag_from_xmm0();
            let name = self.var_of(inst.op(0))?.name.clone();
            self.op(&format!("movsd %xmm0, {}(%rip)", name));
            return Ok(());
        }

        self.load_int(&a, "%rax")?;
        self.load_int(&b, "%rcx")?;
        match inst.opcode {
            Opcode::Add => self.op("addq %rcx, %rax"),
            Opcode::Sub => self.op("subq %rcx, %rax"),
            Opcode::Mul => self.op("imulq %rcx, %rax"),
            _ => {
                self.op("testq %rcx, %rcx");
                self.op(&format!("jne .Ldz{}", index));
                self.op("call mxvm_div_zero");
                self.push(&format!(".Ldz{}:", index));
                // idiv traps on MIN/-1; negation wraps the way the
                // interpreter does.
                self.op("cmpq $-1, %rcx");
                self.op(&format!("jne .Ldv{}", index));
                self.op("negq %rax");
                self.op(&format!("jmp .Lde{}", index));
                self.push(&format!(".Ldv{}:", index));
                self.op("cqto");
                self.op("idivq %rcx");
                self.push(&format!(".Lde{}:", index));
            }
        }
        self.set_zero_flag_from_rax();
        self.store_int_rax(inst.op(0))
    }

    fn emit_bitwise(&mut self, inst: &Instruction) -> Result<()> {
        let (a, b) = self.arith_sources(inst);
        let (a, b) = (a.clone(), b.clone());
        self.load_int(&a, "%rax")?;
        self.load_int(&b, "%rcx")?;
        match inst.opcode {
            Opcode::And => self.op("andq %rcx, %rax"),
            Opcode::Or => self.op("orq %rcx, %rax"),
            _ => self.op("xorq %rcx, %rax"),
        }
        self.set_zero_flag_from_rax();
        self.store_int_rax(inst.op(0))
    }

    fn emit_not(&mut self, inst: &Instruction) -> Result<()> {
        let src = if inst.ops.len() == 2 {
            inst.op(1).clone()
        } else {
            inst.op(0).clone()
        };
        self.load_int(&src, "%rax")?;
        self.op("notq %rax");
        self.set_zero_flag_from_rax();
        self.store_int_rax(inst.op(0))
    }

    fn emit_cmp(&mut self, index: usize, inst: &Instruction) -> Result<()> {
        let a = inst.op(0).clone();
        let b = inst.op(1).clone();
        match self.category(&a)? {
            Category::Int => {
                self.load_int(&a, "%rax")?;
                self.load_int(&b, "%rcx")?;
                self.op("cmpq %rcx, %rax");
                self.op("sete mxvm_zf(%rip)");
                self.op("setl mxvm_lf(%rip)");
                self.op("setg mxvm_gf(%rip)");
                self.op("seta mxvm_af(%rip)");
                self.op("setb mxvm_bf(%rip)");
            }
            Category::Float => {
                self.load_float(&a, "%xmm0")?;
                self.load_float(&b, "%xmm1")?;
                self.op("ucomisd %xmm1, %xmm0");
                self.op(&format!("jp .Lcn{}", index));
                self.op("sete mxvm_zf(%rip)");
                self.op("setb mxvm_lf(%rip)");
                self.op("seta mxvm_gf(%rip)");
                self.op("seta mxvm_af(%rip)");
                self.op("setb mxvm_bf(%rip)");
                self.op(&format!("jmp .Lcd{}", index));
                self.push(&format!(".Lcn{}:", index));
                for flag in &["zf", "lf", "gf", "af", "bf"] {
                    self.op(&format!("movb $0, mxvm_{}(%rip)", flag));
                }
                self.push(&format!(".Lcd{}:", index));
            }
            Category::Str => {
                self.load_str_addr(&a, "%rdi")?;
                self.load_str_addr(&b, "%rsi")?;
                self.op("call mxvm_strcmp");
            }
        }
        Ok(())
    }

    fn emit_branch(&mut self, inst: &Instruction) -> Result<()> {
        let target = inst.op(0).resolved.ok_or_else(|| {
            Error::Internal(format!("unresolved label `{}`", inst.op(0).text))
        })?;
        use Opcode::*;
        match inst.opcode {
            Jmp => {
                self.op(&format!("jmp .L{}", target));
                return Ok(());
            }
            Je | Jz => {
                self.op("cmpb $0, mxvm_zf(%rip)");
                self.op(&format!("jne .L{}", target));
            }
            Jne | Jnz => {
                self.op("cmpb $0, mxvm_zf(%rip)");
                self.op(&format!("je .L{}", target));
            }
            Jl => {
                self.op("cmpb $0, mxvm_lf(%rip)");
                self.op(&format!("jne .L{}", target));
            }
            Jg => {
                self.op("cmpb $0, mxvm_gf(%rip)");
                self.op(&format!("jne .L{}", target));
            }
            Ja => {
                self.op("cmpb $0, mxvm_af(%rip)");
                self.op(&format!("jne .L{}", target));
            }
            Jb => {
                self.op("cmpb $0, mxvm_bf(%rip)");
                self.op(&format!("jne .L{}", target));
            }
            Jle => {
                self.op("movb mxvm_lf(%rip), %al");
                self.op("orb mxvm_zf(%rip), %al");
                self.op("testb %al, %al");
                self.op(&format!("jne .L{}", target));
            }
            Jge => {
                self.op("movb mxvm_gf(%rip), %al");
                self.op("orb mxvm_zf(%rip), %al");
                self.op("testb %al, %al");
                self.op(&format!("jne .L{}", target));
            }
            _ => {}
        }
        Ok(())
    }

    fn emit_call(&mut self, index: usize, inst: &Instruction) -> Result<()> {
        let target = inst.op(0).resolved.ok_or_else(|| {
            Error::Internal(format!("unresolved label `{}`", inst.op(0).text))
        })?;
        self.op("movq mxvm_retsp(%rip), %rax");
        self.op("leaq mxvm_retstack(%rip), %rcx");
        self.op(&format!("leaq .L{}(%rip), %rdx", index + 1));
        self.op("movq %rdx, (%rcx,%rax,8)");
        self.op("incq mxvm_retsp(%rip)");
        self.op(&format!("jmp .L{}", target));
        Ok(())
    }

    fn emit_print(&mut self, inst: &Instruction) -> Result<()> {
        let fmt = self.var_of(inst.op(0))?;
        let fmt_name = fmt.name.clone();
        let fmt_text = String::from_utf8_lossy(&fmt.str_value).into_owned();
        let specs = scan_format(&fmt_text).map_err(|msg| Error::FormatMismatch {
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

        let mut next_int = 0;
        let mut next_float = 0;
        for (spec, op) in specs.iter().zip(args.iter()) {
            let op = op.clone();
            match spec {
                FmtSpec::Float => {
                    if next_float == 8 {
                        return Err(Error::Internal(
                            "too many floating print arguments".to_string(),
                        ));
                    }
                    self.load_float(&op, &format!("%xmm{}", next_float))?;
                    next_float += 1;
                }
                FmtSpec::Str => {
                    let reg = *PRINTF_ARG_REGS.get(next_int).ok_or_else(|| {
                        Error::Internal("too many print arguments".to_string())
                    })?;
                    self.load_str_addr(&op, reg)?;
                    next_int += 1;
                }
                FmtSpec::Int | FmtSpec::Char => {
                    let reg = *PRINTF_ARG_REGS.get(next_int).ok_or_else(|| {
                        Error::Internal("too many print arguments".to_string())
                    })?;
                    self.load_int(&op, reg)?;
                    next_int += 1;
                }
            }
        }
        self.op(&format!("leaq {}(%rip), %rdi", fmt_name));
        self.op(&format!("movl ${}, %eax", next_float));
        self.op("call printf@PLT");
        self.flush_stdout();
        Ok(())
    }

    fn emit_getline(&mut self, inst: &Instruction) -> Result<()> {
        let var = self.var_of(inst.op(0))?;
        let (name, size) = match &var.ty {
            VarType::Array { count } => (var.name.clone(), *count),
            _ => (var.name.clone(), var.buffer_size + 1),
        };
        self.op(&format!("leaq {}(%rip), %rdi", name));
        self.op(&format!("movq ${}, %rsi", size));
        self.op("call mxvm_getline");
        Ok(())
    }

    fn emit_conversion(&mut self, inst: &Instruction, helper: &str) -> Result<()> {
        self.load_str_addr(inst.op(1), "%rdi")?;
        self.op(&format!("call {}", helper));
        if helper == "mxvm_to_float" {
            let name = self.var_of(inst.op(0))?.name.clone();
            self.op(&format!("movsd %xmm0, {}(%rip)", name));
        } else {
            self.store_int_rax(inst.op(0))?;
        }
        Ok(())
    }

    fn emit_load_char(&mut self, inst: &Instruction) -> Result<()> {
        let src = self.var_of(inst.op(1))?.name.clone();
        self.op(&format!("movzbq {}(%rip), %rax", src));
        self.store_int_rax(inst.op(0))
    }

    fn emit_invoke(&mut self, inst: &Instruction) -> Result<()> {
        let index = inst.op(0).resolved.ok_or_else(|| {
            Error::Internal(format!("unresolved invoke `{}`", inst.op(0).text))
        })? as usize;
        let target = self.image.calls[index].clone();
        let args: Vec<Operand> = inst.ops[1..].to_vec();

        // Split by category, preserving relative order within each bank.
        let mut int_args = Vec::new();
        let mut float_args = Vec::new();
        for (cat, op) in target.sig.args.iter().zip(args.iter()) {
            match cat {
                ArgCat::Int => int_args.push(op.clone()),
                ArgCat::Float => float_args.push(op.clone()),
            }
        }
        if int_args.len() > 8 || float_args.len() > 8 {
            return Err(Error::Internal(format!(
                "too many arguments for `{}`",
                target.symbol
            )));
        }

        // Stack-passed integer arguments first, padded to 16 bytes.
        let spill = int_args.len().saturating_sub(INT_ARG_REGS.len());
        let frame = if spill % 2 == 1 {
            spill * 8 + 8
        } else {
            spill * 8
        };
        if frame > 0 {
            self.op(&format!("subq ${}, %rsp", frame));
        }
        for (k, op) in int_args.iter().skip(INT_ARG_REGS.len()).enumerate() {
            self.load_int_or_addr(op, "%rax")?;
            self.op(&format!("movq %rax, {}(%rsp)", k * 8));
        }
        for (k, op) in float_args.iter().enumerate() {
            self.load_float(op, &format!("%xmm{}", k))?;
        }
        for (k, op) in int_args.iter().take(INT_ARG_REGS.len()).enumerate() {
            self.load_int_or_addr(op, INT_ARG_REGS[k])?;
        }
        self.op(&format!("call {}@PLT", target.symbol));
        if frame > 0 {
            self.op(&format!("addq ${}, %rsp", frame));
        }

        // The return value lands in `result` when the program declares
        // one of the matching category.
        if let Some(result) = self.image.variable("result") {
            let (name, cat) = (result.name.clone(), result.ty.category());
            match (target.sig.ret, cat) {
                (RetCat::Int, Category::Int) | (RetCat::Ptr, Category::Int) => {
                    self.op(&format!("movq %rax, {}(%rip)", name));
                }
                (RetCat::Float, Category::Float) => {
                    self.op(&format!("movsd %xmm0, {}(%rip)", name));
                }
                (RetCat::Void, _) => {}
                (ret, _) => {
                    return Err(Error::TypeMismatch {
                        loc: inst.loc.clone(),
                        msg: format!(
                            "`result` cannot hold the {:?} return of `{}`",
                            ret, target.symbol
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    // Integer-bank invoke arguments: plain integers, or addresses of
    // string/array buffers.
    fn load_int_or_addr(&mut self, op: &Operand, reg: &str) -> Result<()> {
        match self.category(op)? {
            Category::Str => self.load_str_addr(op, reg),
            _ => self.load_int(op, reg),
        }
    }
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    for b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(*b as char),
            b => out.push_str(&format!("\\{:03o}", b)),
        }
    }
    out
}

const FLAG_CELLS: &str = "\
mxvm_zf:
        .zero 1
mxvm_lf:
        .zero 1
mxvm_gf:
        .zero 1
mxvm_af:
        .zero 1
mxvm_bf:
        .zero 1
        .align 8
mxvm_retstack:
        .zero 8192
mxvm_retsp:
        .zero 8
";

// Fixed runtime support routines. Helpers are entered by native call, so
// each realigns with a frame before touching libc.
const HELPERS: &str = r#"# ---- runtime helpers ----
mxvm_strcopy:
        pushq %rbp
        movq %rsp, %rbp
        xorq %rcx, %rcx
.Lsc_len:
        cmpb $0, (%rsi,%rcx)
        je .Lsc_have_len
        incq %rcx
        jmp .Lsc_len
.Lsc_have_len:
        cmpq %rdx, %rcx
        jbe .Lsc_fits
        movb $1, mxvm_zf(%rip)
        movq %rdx, %rcx
        testq %rcx, %rcx
        je .Lsc_copy
        subq $1, %rcx
        jmp .Lsc_copy
.Lsc_fits:
        movb $0, mxvm_zf(%rip)
.Lsc_copy:
        xorq %rax, %rax
.Lsc_loop:
        cmpq %rcx, %rax
        je .Lsc_term
        movb (%rsi,%rax), %r8b
        movb %r8b, (%rdi,%rax)
        incq %rax
        jmp .Lsc_loop
.Lsc_term:
        movb $0, (%rdi,%rax)
        popq %rbp
        ret
mxvm_strcmp:
        pushq %rbp
        movq %rsp, %rbp
        call strcmp@PLT
        cmpl $0, %eax
        sete mxvm_zf(%rip)
        setl mxvm_lf(%rip)
        setg mxvm_gf(%rip)
        setg mxvm_af(%rip)
        setl mxvm_bf(%rip)
        popq %rbp
        ret
mxvm_getline:
        pushq %rbp
        movq %rsp, %rbp
        pushq %rbx
        subq $8, %rsp
        movq %rdi, %rbx
        movq stdin@GOTPCREL(%rip), %rdx
        movq (%rdx), %rdx
        call fgets@PLT
        testq %rax, %rax
        je .Lgl_eof
        movq %rbx, %rdi
        call strlen@PLT
        testq %rax, %rax
        je .Lgl_out
        cmpb $10, -1(%rbx,%rax)
        jne .Lgl_out
        movb $0, -1(%rbx,%rax)
        jmp .Lgl_out
.Lgl_eof:
        movb $0, (%rbx)
.Lgl_out:
        addq $8, %rsp
        popq %rbx
        popq %rbp
        ret
mxvm_to_int:
        pushq %rbp
        movq %rsp, %rbp
        subq $16, %rsp
        movq %rdi, -16(%rbp)
        leaq -8(%rbp), %rsi
        movl $10, %edx
        call strtol@PLT
        movq -8(%rbp), %rcx
        cmpq -16(%rbp), %rcx
        sete mxvm_zf(%rip)
        jne .Lti_ok
        xorl %eax, %eax
.Lti_ok:
        leave
        ret
mxvm_to_float:
        pushq %rbp
        movq %rsp, %rbp
        subq $16, %rsp
        movq %rdi, -16(%rbp)
        leaq -8(%rbp), %rsi
        call strtod@PLT
        movq -8(%rbp), %rcx
        cmpq -16(%rbp), %rcx
        sete mxvm_zf(%rip)
        jne .Ltf_ok
        pxor %xmm0, %xmm0
.Ltf_ok:
        leave
        ret
mxvm_div_zero:
        pushq %rbp
        movq %rsp, %rbp
        leaq .LCdiverr(%rip), %rdi
        movq stderr@GOTPCREL(%rip), %rsi
        movq (%rsi), %rsi
        call fputs@PLT
        movl $3, %edi
        call exit@PLT
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::parser::Loader;
    use crate::program::link;
    use crate::validate::validate;

    fn image(text: &str) -> Image {
        let mut loader = Loader::new(Paths::default());
        let mut program = loader.load_source("test.mxvm", text).unwrap();
        validate(&mut program).unwrap();
        link(program).unwrap()
    }

    const SAMPLE: &str = r#"program t {
    section data {
        int a = 2
        int b
        float f = 1.5
        string fmt = "%ld\n"
        string s
        array buf = 32
    }
    section code {
    main:
        mov b, a
        add b, 3
        cmp b, a
        jg big
        div a, b
    big:
        print fmt, b
        mov f, 2.5
        exit 0
    }
}"#;

    #[test]
    fn test_emission_is_deterministic() {
        let img = image(SAMPLE);
        assert_eq!(emit(&img).unwrap(), emit(&img).unwrap());
    }

    #[test]
    fn test_data_layout() {
        let out = emit(&image(SAMPLE)).unwrap();
        assert!(out.contains("a:\n        .quad 2\n"));
        assert!(out.contains("b:\n        .zero 8\n"));
        assert!(out.contains("f:\n        .double 1.5\n"));
        assert!(out.contains("fmt:\n        .asciz \"%ld\\n\"\n"));
        // Uninitialized string: default capacity plus NUL.
        assert!(out.contains("s:\n        .zero 257\n"));
        assert!(out.contains("buf:\n        .zero 32\n"));
        assert!(out.contains("mxvm_zf:"));
    }

    #[test]
    fn test_text_skeleton() {
        let out = emit(&image(SAMPLE)).unwrap();
        assert!(out.contains(".globl main"));
        assert!(out.contains(".L0:"));
        assert!(out.contains("call printf@PLT"));
        assert!(out.contains("call fflush@PLT"));
        assert!(out.contains("call mxvm_div_zero"));
        assert!(out.contains("call exit@PLT"));
        assert!(out.contains(".extern printf"));
    }

    #[test]
    fn test_branch_targets_are_instruction_labels() {
        let out = emit(&image(SAMPLE)).unwrap();
        // cmp is instruction 2, jg targets instruction 5 (print).
        assert!(out.contains("cmpb $0, mxvm_gf(%rip)"));
        assert!(out.contains("jne .L5"));
    }

    #[test]
    fn test_arith_updates_zero_flag() {
        let out = emit(&image(SAMPLE)).unwrap();
        assert!(out.contains("addq %rcx, %rax"));
        assert!(out.contains("sete mxvm_zf(%rip)"));
    }

    #[test]
    fn test_float_literal_pool() {
        let out = emit(&image(SAMPLE)).unwrap();
        assert!(out.contains(".LCf0:\n        .double 2.5"));
        assert!(out.contains("movsd .LCf0(%rip), %xmm0"));
    }

    #[test]
    fn test_string_mov_uses_helper() {
        let out = emit(&image(
            "program t { section data {\n string s = \"abc\"\n string d = \"xy\"\n } section code {\n mov d, s\n exit 0\n } }",
        ))
        .unwrap();
        assert!(out.contains("movq $2, %rdx"));
        assert!(out.contains("call mxvm_strcopy"));
    }

    #[test]
    fn test_call_uses_software_return_stack() {
        let out = emit(&image(
            "program t { section code {\n main:\n call f\n exit 0\n f:\n ret\n } }",
        ))
        .unwrap();
        assert!(out.contains("mxvm_retstack"));
        assert!(out.contains("incq mxvm_retsp(%rip)"));
        assert!(out.contains("jmp *%rax"));
    }

    #[test]
    fn test_entry_jump_when_main_is_not_first() {
        let out = emit(&image(
            "program t { section code {\n f:\n ret\n main:\n exit 0\n } }",
        ))
        .unwrap();
        assert!(out.contains("        jmp .L1\n"));
    }

    #[test]
    fn test_getline_and_to_int_lowering() {
        let out = emit(&image(
            "program t { section data {\n int v\n array buf = 16\n } section code {\n getline buf\n to_int v, buf\n exit 0\n } }",
        ))
        .unwrap();
        assert!(out.contains("movq $16, %rsi"));
        assert!(out.contains("call mxvm_getline"));
        assert!(out.contains("call mxvm_to_int"));
        assert!(out.contains("movq %rax, v(%rip)"));
    }

    #[test]
    fn test_print_format_mismatch_is_reported() {
        let err = emit(&image(
            "program t { section data {\n string fmt = \"%ld\"\n } section code {\n print fmt\n exit 0\n } }",
        ))
        .unwrap_err();
        assert!(matches!(err, Error::FormatMismatch { .. }));
    }

    #[test]
    fn test_escape_bytes() {
        assert_eq!(escape_bytes(b"a\"b\\c\n"), "a\\\"b\\\\c\\n");
        assert_eq!(escape_bytes(&[7]), "\\007");
    }
}
