// AST for one translation unit.
//
// The tree mirrors the surface grammar: a unit is a program or object
// holding sections, and each section holds declarations, instructions,
// labels, imports or comments. Comments are statements in their own right
// so that printing a parsed unit reproduces them.
//
// Display renders the canonical textual form; parsing the printed text
// yields a structurally identical tree.

use std::fmt;

use crate::error::Location;
use crate::inst::Opcode;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnitKind {
    Program,
    Object,
}

impl UnitKind {
    pub fn keyword(self) -> &'static str {
        match self {
            UnitKind::Program => "program",
            UnitKind::Object => "object",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnitNode {
    pub kind: UnitKind,
    pub name: String,
    pub sections: Vec<SectionNode>,
    pub loc: Location,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SectionKind {
    Data,
    Code,
    Module,
    Object,
}

impl SectionKind {
    pub fn keyword(self) -> &'static str {
        match self {
            SectionKind::Data => "data",
            SectionKind::Code => "code",
            SectionKind::Module => "module",
            SectionKind::Object => "object",
        }
    }

    pub fn from_keyword(name: &str) -> Option<SectionKind> {
        match name {
            "data" => Some(SectionKind::Data),
            "code" => Some(SectionKind::Code),
            "module" => Some(SectionKind::Module),
            "object" => Some(SectionKind::Object),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SectionNode {
    pub kind: SectionKind,
    pub stmts: Vec<Stmt>,
    pub loc: Location,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Var(VarDecl),
    Inst(InstStmt),
    Label(LabelStmt),
    Import(ImportStmt),
    Comment(CommentStmt),
}

// Type keywords accepted in a data section.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeName {
    Int,
    Float,
    Str,
    Ptr,
    Byte,
    Array,
    Extern,
}

impl TypeName {
    pub fn keyword(self) -> &'static str {
        match self {
            TypeName::Int => "int",
            TypeName::Float => "float",
            TypeName::Str => "string",
            TypeName::Ptr => "ptr",
            TypeName::Byte => "byte",
            TypeName::Array => "array",
            TypeName::Extern => "extern",
        }
    }

    pub fn from_keyword(name: &str) -> Option<TypeName> {
        match name {
            "int" => Some(TypeName::Int),
            "float" => Some(TypeName::Float),
            "string" => Some(TypeName::Str),
            "ptr" => Some(TypeName::Ptr),
            "byte" => Some(TypeName::Byte),
            "array" => Some(TypeName::Array),
            "extern" => Some(TypeName::Extern),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct VarDecl {
    pub ty: TypeName,
    pub name: String,
    pub init: Option<Literal>,
    pub loc: Location,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperandExpr {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstStmt {
    pub opcode: Opcode,
    pub operands: Vec<OperandExpr>,
    pub loc: Location,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabelStmt {
    pub name: String,
    pub loc: Location,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportStmt {
    pub name: String,
    pub loc: Location,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommentStmt {
    pub text: String,
    pub loc: Location,
}

// Re-escape a string literal for printing.
pub fn escape(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{}", v),
            Literal::Float(v) => write!(f, "{:?}", v),
            Literal::Str(v) => write!(f, "\"{}\"", escape(v)),
        }
    }
}

impl fmt::Display for OperandExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OperandExpr::Int(v) => write!(f, "{}", v),
            OperandExpr::Float(v) => write!(f, "{:?}", v),
            OperandExpr::Str(v) => write!(f, "\"{}\"", escape(v)),
            OperandExpr::Ident(v) => write!(f, "{}", v),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stmt::Var(decl) => {
                write!(f, "        {} {}", decl.ty.keyword(), decl.name)?;
                if let Some(init) = &decl.init {
                    write!(f, " = {}", init)?;
                }
                writeln!(f)
            }
            Stmt::Inst(inst) => {
                write!(f, "        {}", inst.opcode)?;
                for (i, op) in inst.operands.iter().enumerate() {
                    if i == 0 {
                        write!(f, " {}", op)?;
                    } else {
                        write!(f, ", {}", op)?;
                    }
                }
                writeln!(f)
            }
            Stmt::Label(label) => writeln!(f, "    {}:", label.name),
            Stmt::Import(import) => writeln!(f, "        {}", import.name),
            Stmt::Comment(comment) => writeln!(f, "        {}", comment.text),
        }
    }
}

impl fmt::Display for SectionNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "    section {} {{", self.kind.keyword())?;
        for stmt in &self.stmts {
            write!(f, "{}", stmt)?;
        }
        writeln!(f, "    }}")
    }
}

impl fmt::Display for UnitNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{} {} {{", self.kind.keyword(), self.name)?;
        for section in &self.sections {
            write!(f, "{}", section)?;
        }
        writeln!(f, "}}")
    }
}
