// The instruction-set data model.
//
// Operands are classified into kinds once, by the validator, and the hot
// paths work from `resolved` indices: a variable reference resolves to a
// slot in the owning unit's variable table, a label reference to an
// instruction address, an invoke target to a call-descriptor index.
//
// The per-opcode operand signatures live in a single static table. Each
// position carries a set of admissible operand kinds, represented with
// BitFlags so the validator can report exactly which kinds were allowed.

use std::collections::HashMap;
use std::fmt;

use enumflags2::BitFlags;

use crate::error::Location;

// The 32 opcodes, case-insensitive on input, lowercase on output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov,
    Load,
    Store,
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Not,
    Cmp,
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    Jz,
    Jnz,
    Ja,
    Jb,
    Call,
    Ret,
    Invoke,
    Print,
    Getline,
    ToInt,
    ToFloat,
    LoadChar,
    Exit,
}

pub const OPCODES: &[(&str, Opcode)] = &[
    ("mov", Opcode::Mov),
    ("load", Opcode::Load),
    ("store", Opcode::Store),
    ("add", Opcode::Add),
    ("sub", Opcode::Sub),
    ("mul", Opcode::Mul),
    ("div", Opcode::Div),
    ("and", Opcode::And),
    ("or", Opcode::Or),
    ("xor", Opcode::Xor),
    ("not", Opcode::Not),
    ("cmp", Opcode::Cmp),
    ("jmp", Opcode::Jmp),
    ("je", Opcode::Je),
    ("jne", Opcode::Jne),
    ("jl", Opcode::Jl),
    ("jle", Opcode::Jle),
    ("jg", Opcode::Jg),
    ("jge", Opcode::Jge),
    ("jz", Opcode::Jz),
    ("jnz", Opcode::Jnz),
    ("ja", Opcode::Ja),
    ("jb", Opcode::Jb),
    ("call", Opcode::Call),
    ("ret", Opcode::Ret),
    ("invoke", Opcode::Invoke),
    ("print", Opcode::Print),
    ("getline", Opcode::Getline),
    ("to_int", Opcode::ToInt),
    ("to_float", Opcode::ToFloat),
    ("load_char", Opcode::LoadChar),
    ("exit", Opcode::Exit),
];

impl Opcode {
    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        let lower = name.to_ascii_lowercase();
        OPCODES
            .iter()
            .find(|(text, _)| *text == lower)
            .map(|(_, op)| *op)
    }

    pub fn mnemonic(self) -> &'static str {
        OPCODES
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(text, _)| *text)
            .unwrap_or("[undefined]")
    }

    pub fn is_jump(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Jmp | Je | Jne | Jl | Jle | Jg | Jge | Jz | Jnz | Ja | Jb | Call
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum OperandKind {
    ImmInt = 0b000001,
    ImmFloat = 0b000010,
    ImmStr = 0b000100,
    Var = 0b001000,
    Label = 0b010000,
    Extern = 0b100000,
}

pub type KindSet = BitFlags<OperandKind>;

#[derive(Clone, Debug, PartialEq)]
pub struct Operand {
    pub text: String,
    pub kind: OperandKind,
    pub resolved: Option<u64>,
}

impl Operand {
    pub fn new(text: &str, kind: OperandKind) -> Operand {
        Operand {
            text: text.to_string(),
            kind,
            resolved: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub ops: Vec<Operand>,
    pub loc: Location,
}

impl Instruction {
    pub fn op(&self, index: usize) -> &Operand {
        &self.ops[index]
    }
}

// Variable types. Arrays are byte buffers; EXTERN names a symbol defined
// outside the current unit and resolved by the linker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarType {
    Int,
    Float,
    Str,
    Ptr,
    Byte,
    Array { count: u64 },
    Extern,
}

// The broad operand categories the runtime distinguishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Category {
    Int,
    Float,
    Str,
}

impl VarType {
    pub fn name(&self) -> &'static str {
        match self {
            VarType::Int => "int",
            VarType::Float => "float",
            VarType::Str => "string",
            VarType::Ptr => "ptr",
            VarType::Byte => "byte",
            VarType::Array { .. } => "array",
            VarType::Extern => "extern",
        }
    }

    // Ints, bytes, pointers and externs all travel as 64-bit integers;
    // strings and arrays are byte buffers.
    pub fn category(&self) -> Category {
        match self {
            VarType::Float => Category::Float,
            VarType::Str | VarType::Array { .. } => Category::Str,
            _ => Category::Int,
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// Default capacity of a string declared without an initializer.
pub const DEFAULT_STR_CAPACITY: u64 = 256;

// Storage for one named variable. Only the fields consistent with `ty`
// are meaningful; the rest stay zero.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name: String,
    pub ty: VarType,
    pub int_value: i64,
    pub float_value: f64,
    pub str_value: Vec<u8>,
    pub buffer: Option<Vec<u8>>,
    pub buffer_size: u64,
    pub is_const: bool,
}

impl Variable {
    pub fn new(name: &str, ty: VarType) -> Variable {
        Variable {
            name: name.to_string(),
            ty,
            int_value: 0,
            float_value: 0.0,
            str_value: Vec::new(),
            buffer: None,
            buffer_size: 0,
            is_const: false,
        }
    }
}

// Operand signature of one opcode. `kinds` lists the admissible kind set
// per position; for variadic opcodes the final entry repeats.
pub struct OpcodeSig {
    pub min: usize,
    pub max: usize,
    pub kinds: Vec<KindSet>,
    pub variadic: bool,
}

impl OpcodeSig {
    fn new(min: usize, max: usize, kinds: Vec<KindSet>) -> OpcodeSig {
        OpcodeSig {
            min,
            max,
            kinds,
            variadic: false,
        }
    }

    fn variadic(min: usize, kinds: Vec<KindSet>) -> OpcodeSig {
        OpcodeSig {
            min,
            max: usize::MAX,
            kinds,
            variadic: true,
        }
    }

    pub fn kind_at(&self, index: usize) -> KindSet {
        match self.kinds.get(index).or_else(|| self.kinds.last()) {
            Some(set) => *set,
            None => BitFlags::empty(),
        }
    }

    pub fn arity_text(&self) -> String {
        if self.variadic {
            format!("at least {}", self.min)
        } else if self.min == self.max {
            format!("{}", self.min)
        } else {
            format!("{} to {}", self.min, self.max)
        }
    }
}

lazy_static! {
    pub static ref SIGNATURES: HashMap<Opcode, OpcodeSig> = {
        use Opcode::*;
        use OperandKind::*;

        let dst: KindSet = BitFlags::from_flag(Var);
        let src: KindSet = Var | ImmInt | ImmFloat;
        let any: KindSet = Var | ImmInt | ImmFloat | ImmStr;
        let target: KindSet = BitFlags::from_flag(Label);
        let symbol: KindSet = BitFlags::from_flag(Extern);

        let mut table = HashMap::new();
        table.insert(Mov, OpcodeSig::new(2, 2, vec![dst, any]));
        table.insert(Load, OpcodeSig::new(2, 2, vec![dst, dst]));
        table.insert(Store, OpcodeSig::new(2, 2, vec![src, dst]));
        for op in &[Add, Sub, Mul, Div, And, Or, Xor] {
            table.insert(*op, OpcodeSig::new(2, 3, vec![dst, src, src]));
        }
        table.insert(Not, OpcodeSig::new(1, 2, vec![dst, src]));
        table.insert(Cmp, OpcodeSig::new(2, 2, vec![any, any]));
        for op in &[Jmp, Je, Jne, Jl, Jle, Jg, Jge, Jz, Jnz, Ja, Jb, Call] {
            table.insert(*op, OpcodeSig::new(1, 1, vec![target]));
        }
        table.insert(Ret, OpcodeSig::new(0, 0, vec![]));
        table.insert(Invoke, OpcodeSig::variadic(1, vec![symbol, any]));
        table.insert(Print, OpcodeSig::variadic(1, vec![dst, any]));
        table.insert(Getline, OpcodeSig::new(1, 1, vec![dst]));
        table.insert(ToInt, OpcodeSig::new(2, 2, vec![dst, dst]));
        table.insert(ToFloat, OpcodeSig::new(2, 2, vec![dst, dst]));
        table.insert(LoadChar, OpcodeSig::new(2, 2, vec![dst, dst]));
        table.insert(Exit, OpcodeSig::new(1, 1, vec![Var | ImmInt]));
        table
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonic_round_trip() {
        assert_eq!(OPCODES.len(), 32);
        for (text, op) in OPCODES {
            assert_eq!(Opcode::from_mnemonic(text), Some(*op));
            assert_eq!(op.mnemonic(), *text);
        }
    }

    #[test]
    fn test_mnemonics_case_insensitive() {
        assert_eq!(Opcode::from_mnemonic("MOV"), Some(Opcode::Mov));
        assert_eq!(Opcode::from_mnemonic("To_Int"), Some(Opcode::ToInt));
        assert_eq!(Opcode::from_mnemonic("bogus"), None);
    }

    #[test]
    fn test_every_opcode_has_a_signature() {
        for (_, op) in OPCODES {
            assert!(SIGNATURES.contains_key(op), "missing sig for {}", op);
        }
    }

    #[test]
    fn test_signature_shapes() {
        let sig = &SIGNATURES[&Opcode::Mov];
        assert_eq!((sig.min, sig.max), (2, 2));
        assert!(sig.kind_at(0).contains(OperandKind::Var));
        assert!(!sig.kind_at(0).contains(OperandKind::ImmInt));
        assert!(sig.kind_at(1).contains(OperandKind::ImmStr));

        let sig = &SIGNATURES[&Opcode::Print];
        assert!(sig.variadic);
        assert_eq!(sig.kind_at(5), sig.kind_at(1));

        let sig = &SIGNATURES[&Opcode::Jmp];
        assert_eq!(sig.kind_at(0), BitFlags::from_flag(OperandKind::Label));
    }

    #[test]
    fn test_categories() {
        assert_eq!(VarType::Int.category(), Category::Int);
        assert_eq!(VarType::Byte.category(), Category::Int);
        assert_eq!(VarType::Ptr.category(), Category::Int);
        assert_eq!(VarType::Float.category(), Category::Float);
        assert_eq!(VarType::Str.category(), Category::Str);
        assert_eq!(VarType::Array { count: 4 }.category(), Category::Str);
    }
}
