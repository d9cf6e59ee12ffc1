// Recursive-descent parser for IR units and module descriptors, plus the
// loader that walks imports.
//
// The parser works from the token stream with single-token lookahead, so
// every diagnostic carries the exact source position. The loader resolves
// `section object`/`section module` imports against the configured search
// paths and parses each imported unit recursively; units already loaded
// (by canonical path) are skipped, which breaks import cycles.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ast::{
    CommentStmt, ImportStmt, InstStmt, LabelStmt, Literal, OperandExpr, SectionKind,
    SectionNode, Stmt, TypeName, UnitKind, UnitNode, VarDecl,
};
use crate::config::Paths;
use crate::error::{Error, Location, Result};
use crate::ffi::RetCat;
use crate::inst::{
    Instruction, Opcode, Operand, OperandKind, VarType, Variable, DEFAULT_STR_CAPACITY,
};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::program::{ExternalFunction, Module, Program};

pub struct Parser {
    file: String,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(file: &str, source: &str) -> Result<Parser> {
        let tokens = Lexer::new(file, source).scan()?;
        Ok(Parser {
            file: file.to_string(),
            tokens,
            pos: 0,
        })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn location(&self, token: &Token) -> Location {
        token.location(&self.file)
    }

    fn error(&self, token: &Token, msg: String) -> Error {
        Error::Parse {
            loc: self.location(token),
            msg,
        }
    }

    fn expect_id(&mut self) -> Result<Token> {
        let token = self.next();
        if token.kind == TokenKind::Id {
            Ok(token)
        } else {
            Err(self.error(&token, format!("expected identifier, found `{}`", token.lexeme)))
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<Token> {
        let token = self.expect_id()?;
        if token.lexeme == word {
            Ok(token)
        } else {
            Err(self.error(&token, format!("expected `{}`, found `{}`", word, token.lexeme)))
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<Token> {
        let token = self.next();
        if token.kind == TokenKind::Sym && token.lexeme == sym {
            Ok(token)
        } else {
            Err(self.error(&token, format!("expected `{}`, found `{}`", sym, token.lexeme)))
        }
    }

    fn accept_sym(&mut self, sym: &str) -> bool {
        let token = self.peek();
        if token.kind == TokenKind::Sym && token.lexeme == sym {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_sym(&self, sym: &str) -> bool {
        let token = self.peek();
        token.kind == TokenKind::Sym && token.lexeme == sym
    }

    fn skip_newlines(&mut self) {
        while self.peek().kind == TokenKind::Newline {
            self.pos += 1;
        }
    }

    fn skip_blank(&mut self) {
        while matches!(self.peek().kind, TokenKind::Newline | TokenKind::Comment) {
            self.pos += 1;
        }
    }

    // A statement ends at a newline, at a trailing comment, or right
    // before the closing brace of its section.
    fn end_of_statement(&mut self) -> Result<()> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.pos += 1;
                Ok(())
            }
            TokenKind::Comment | TokenKind::Eof => Ok(()),
            TokenKind::Sym if self.at_sym("}") => Ok(()),
            _ => {
                let token = self.peek().clone();
                Err(self.error(&token, format!("expected end of line, found `{}`", token.lexeme)))
            }
        }
    }

    pub fn parse_unit(&mut self) -> Result<UnitNode> {
        self.skip_blank();
        let kw = self.expect_id()?;
        let kind = match kw.lexeme.as_str() {
            "program" => UnitKind::Program,
            "object" => UnitKind::Object,
            other => {
                return Err(self.error(&kw, format!("expected `program` or `object`, found `{}`", other)));
            }
        };
        let name = self.expect_id()?;
        self.expect_sym("{")?;

        let mut sections = Vec::new();
        loop {
            self.skip_blank();
            if self.accept_sym("}") {
                break;
            }
            let kw = self.expect_keyword("section")?;
            sections.push(self.parse_section(&kw)?);
        }

        self.skip_blank();
        let trailing = self.peek().clone();
        if trailing.kind != TokenKind::Eof {
            return Err(self.error(&trailing, format!("trailing input `{}`", trailing.lexeme)));
        }

        Ok(UnitNode {
            kind,
            name: name.lexeme,
            sections,
            loc: self.location(&kw),
        })
    }

    fn parse_section(&mut self, section_kw: &Token) -> Result<SectionNode> {
        let name = self.expect_id()?;
        let kind = SectionKind::from_keyword(&name.lexeme).ok_or_else(|| {
            self.error(&name, format!("unknown section `{}`", name.lexeme))
        })?;
        self.expect_sym("{")?;

        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.accept_sym("}") {
                break;
            }
            if self.peek().kind == TokenKind::Comment {
                let token = self.next();
                stmts.push(Stmt::Comment(CommentStmt {
                    text: token.lexeme.clone(),
                    loc: self.location(&token),
                }));
                continue;
            }
            if self.peek().kind == TokenKind::Eof {
                let token = self.peek().clone();
                return Err(self.error(&token, "unterminated section".to_string()));
            }
            let stmt = match kind {
                SectionKind::Data => self.parse_var_decl()?,
                SectionKind::Code => self.parse_code_stmt()?,
                SectionKind::Module | SectionKind::Object => self.parse_import()?,
            };
            stmts.push(stmt);
        }

        Ok(SectionNode {
            kind,
            stmts,
            loc: self.location(section_kw),
        })
    }

    fn parse_var_decl(&mut self) -> Result<Stmt> {
        let ty_tok = self.expect_id()?;
        let ty = TypeName::from_keyword(&ty_tok.lexeme).ok_or_else(|| {
            self.error(&ty_tok, format!("unknown type `{}`", ty_tok.lexeme))
        })?;
        let name = self.expect_id()?;
        let init = if self.accept_sym("=") {
            Some(self.parse_literal()?)
        } else {
            None
        };
        self.end_of_statement()?;
        Ok(Stmt::Var(VarDecl {
            ty,
            name: name.lexeme,
            init,
            loc: self.location(&ty_tok),
        }))
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        let token = self.next();
        match token.kind {
            TokenKind::Num => self.parse_number(&token).map(|op| match op {
                OperandExpr::Int(v) => Literal::Int(v),
                OperandExpr::Float(v) => Literal::Float(v),
                _ => Literal::Int(0),
            }),
            TokenKind::Str => Ok(Literal::Str(token.lexeme.clone())),
            _ => Err(self.error(&token, format!("expected literal, found `{}`", token.lexeme))),
        }
    }

    fn parse_number(&self, token: &Token) -> Result<OperandExpr> {
        if token.lexeme.contains('.') {
            token.lexeme.parse::<f64>().map(OperandExpr::Float).map_err(|_| {
                self.error(token, format!("InvalidNumber `{}`", token.lexeme))
            })
        } else {
            token.lexeme.parse::<i64>().map(OperandExpr::Int).map_err(|_| {
                self.error(token, format!("integer literal out of range `{}`", token.lexeme))
            })
        }
    }

    fn parse_code_stmt(&mut self) -> Result<Stmt> {
        let head = self.expect_id()?;
        if self.accept_sym(":") {
            self.end_of_statement()?;
            let loc = self.location(&head);
            return Ok(Stmt::Label(LabelStmt {
                name: head.lexeme,
                loc,
            }));
        }

        let opcode = Opcode::from_mnemonic(&head.lexeme).ok_or_else(|| {
            self.error(&head, format!("unknown instruction `{}`", head.lexeme))
        })?;

        let mut operands = Vec::new();
        if !matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::Comment | TokenKind::Eof
        ) && !self.at_sym("}")
        {
            loop {
                let token = self.next();
                let operand = match token.kind {
                    TokenKind::Num => self.parse_number(&token)?,
                    TokenKind::Str => OperandExpr::Str(token.lexeme.clone()),
                    TokenKind::Id => OperandExpr::Ident(token.lexeme.clone()),
                    _ => {
                        return Err(self.error(
                            &token,
                            format!("expected operand, found `{}`", token.lexeme),
                        ));
                    }
                };
                operands.push(operand);
                if !self.accept_sym(",") {
                    break;
                }
            }
        }
        self.end_of_statement()?;

        Ok(Stmt::Inst(InstStmt {
            opcode,
            operands,
            loc: self.location(&head),
        }))
    }

    fn parse_import(&mut self) -> Result<Stmt> {
        let name = self.expect_id()?;
        // Entries may be comma-separated on one line.
        self.accept_sym(",");
        Ok(Stmt::Import(ImportStmt {
            name: name.lexeme.clone(),
            loc: self.location(&name),
        }))
    }

    // A module descriptor lists the functions a shared library offers:
    //
    //     module io {
    //         seed_random
    //         rand_number
    //         to_seconds: float
    //     }
    //
    // Each entry may annotate a return category (default `int`).
    pub fn parse_module(&mut self) -> Result<Module> {
        self.skip_blank();
        self.expect_keyword("module")?;
        let name = self.expect_id()?;
        let mut module = Module::new(&name.lexeme);
        self.expect_sym("{")?;
        loop {
            self.skip_blank();
            if self.accept_sym("}") {
                break;
            }
            if self.peek().kind == TokenKind::Eof {
                let token = self.peek().clone();
                return Err(self.error(&token, "unterminated module descriptor".to_string()));
            }
            let func = self.expect_id()?;
            let ret = if self.accept_sym(":") {
                let cat = self.expect_id()?;
                RetCat::from_keyword(&cat.lexeme).ok_or_else(|| {
                    self.error(&cat, format!("unknown return category `{}`", cat.lexeme))
                })?
            } else {
                RetCat::Int
            };
            self.accept_sym(",");
            module.functions.push(ExternalFunction {
                name: func.lexeme,
                module: name.lexeme.clone(),
                ret,
            });
        }
        Ok(module)
    }
}

pub struct Loader {
    pub paths: Paths,
    loaded: HashSet<PathBuf>,
}

impl Loader {
    pub fn new(paths: Paths) -> Loader {
        Loader {
            paths,
            loaded: HashSet::new(),
        }
    }

    // Load the root unit and, recursively, everything it imports.
    pub fn load(&mut self, path: &Path) -> Result<Program> {
        let source = fs::read_to_string(path)?;
        if let Ok(canonical) = path.canonicalize() {
            self.loaded.insert(canonical);
        }
        let file = path.to_string_lossy().to_string();
        self.load_source(&file, &source)
    }

    // Parse and build a root unit from in-memory text.
    pub fn load_source(&mut self, file: &str, source: &str) -> Result<Program> {
        let unit = Parser::new(file, source)?.parse_unit()?;
        let root_name = unit.name.clone();
        self.build(unit, file, &root_name)
    }

    fn build(&mut self, unit: UnitNode, file: &str, root_name: &str) -> Result<Program> {
        let is_object = unit.kind == UnitKind::Object;
        let mut program = Program::new(&unit.name, is_object, root_name);
        trace!("building unit {} from {}", unit.name, file);

        for section in &unit.sections {
            match section.kind {
                SectionKind::Data => {
                    for stmt in &section.stmts {
                        if let Stmt::Var(decl) = stmt {
                            let var = make_variable(decl)?;
                            if program.var_index.contains_key(&var.name) {
                                return Err(Error::Parse {
                                    loc: decl.loc.clone(),
                                    msg: format!("duplicate variable `{}`", decl.name),
                                });
                            }
                            program.add_variable(var);
                        }
                    }
                }
                SectionKind::Code => {
                    for stmt in &section.stmts {
                        match stmt {
                            Stmt::Label(label) => {
                                let address = program.instructions.len() as u64;
                                program.add_label(&label.name, address, is_object);
                            }
                            Stmt::Inst(inst) => {
                                program.instructions.push(lower_instruction(inst));
                            }
                            _ => {}
                        }
                    }
                }
                SectionKind::Module => {
                    for stmt in &section.stmts {
                        if let Stmt::Import(import) = stmt {
                            if let Some(module) = self.load_module(import)? {
                                program.modules.push(module);
                            }
                        }
                    }
                }
                SectionKind::Object => {
                    for stmt in &section.stmts {
                        if let Stmt::Import(import) = stmt {
                            if let Some(object) = self.load_object(import, root_name)? {
                                program.objects.push(object);
                            }
                        }
                    }
                }
            }
        }

        // Execution must never run off the end of a unit.
        program.instructions.push(Instruction {
            opcode: Opcode::Exit,
            ops: vec![Operand::new("0", OperandKind::ImmInt)],
            loc: unit.loc.clone(),
        });

        Ok(program)
    }

    fn load_object(&mut self, import: &ImportStmt, root_name: &str) -> Result<Option<Program>> {
        let file = format!("{}.mxvm", import.name);
        let path = self
            .paths
            .object_search()
            .iter()
            .map(|dir| dir.join(&file))
            .find(|p| p.exists())
            .ok_or_else(|| Error::Parse {
                loc: import.loc.clone(),
                msg: format!("cannot find object `{}`", import.name),
            })?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !self.loaded.insert(canonical) {
            // Already loaded somewhere in the import graph.
            return Ok(None);
        }

        debug!("loading object {} from {}", import.name, path.display());
        let source = fs::read_to_string(&path)?;
        let name = path.to_string_lossy().to_string();
        let unit = Parser::new(&name, &source)?.parse_unit()?;
        if unit.kind != UnitKind::Object {
            return Err(Error::Parse {
                loc: import.loc.clone(),
                msg: format!("`{}` is not an object unit", import.name),
            });
        }
        Ok(Some(self.build(unit, &name, root_name)?))
    }

    fn load_module(&mut self, import: &ImportStmt) -> Result<Option<Module>> {
        let file = format!("{}.mxvm", import.name);
        let path = self
            .paths
            .module_search()
            .iter()
            .map(|dir| dir.join(&file))
            .find(|p| p.exists())
            .ok_or_else(|| Error::Parse {
                loc: import.loc.clone(),
                msg: format!("cannot find module `{}`", import.name),
            })?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !self.loaded.insert(canonical) {
            return Ok(None);
        }

        debug!("loading module {} from {}", import.name, path.display());
        let source = fs::read_to_string(&path)?;
        let name = path.to_string_lossy().to_string();
        let module = Parser::new(&name, &source)?.parse_module()?;
        Ok(Some(module))
    }
}

fn lower_instruction(inst: &InstStmt) -> Instruction {
    let ops = inst
        .operands
        .iter()
        .map(|op| match op {
            OperandExpr::Int(v) => Operand::new(&format!("{}", v), OperandKind::ImmInt),
            OperandExpr::Float(v) => Operand::new(&format!("{:?}", v), OperandKind::ImmFloat),
            OperandExpr::Str(v) => Operand::new(v, OperandKind::ImmStr),
            // Identifiers are classified by the validator.
            OperandExpr::Ident(v) => Operand::new(v, OperandKind::Var),
        })
        .collect();
    Instruction {
        opcode: inst.opcode,
        ops,
        loc: inst.loc.clone(),
    }
}

fn make_variable(decl: &VarDecl) -> Result<Variable> {
    let mismatch = |want: &str| Error::Parse {
        loc: decl.loc.clone(),
        msg: format!("`{}` initializer must be {}", decl.name, want),
    };

    let mut var = match decl.ty {
        TypeName::Int => Variable::new(&decl.name, VarType::Int),
        TypeName::Float => Variable::new(&decl.name, VarType::Float),
        TypeName::Str => Variable::new(&decl.name, VarType::Str),
        TypeName::Ptr => Variable::new(&decl.name, VarType::Ptr),
        TypeName::Byte => Variable::new(&decl.name, VarType::Byte),
        TypeName::Array => Variable::new(&decl.name, VarType::Array { count: 0 }),
        TypeName::Extern => Variable::new(&decl.name, VarType::Extern),
    };

    match (decl.ty, &decl.init) {
        (TypeName::Int, Some(Literal::Int(v))) => var.int_value = *v,
        (TypeName::Int, Some(_)) => return Err(mismatch("an integer")),
        (TypeName::Byte, Some(Literal::Int(v))) => var.int_value = *v & 0xff,
        (TypeName::Byte, Some(_)) => return Err(mismatch("an integer")),
        (TypeName::Ptr, Some(Literal::Int(v))) => var.int_value = *v,
        (TypeName::Ptr, Some(_)) => return Err(mismatch("an integer address")),
        (TypeName::Float, Some(Literal::Float(v))) => var.float_value = *v,
        (TypeName::Float, Some(Literal::Int(v))) => var.float_value = *v as f64,
        (TypeName::Float, Some(_)) => return Err(mismatch("a number")),
        (TypeName::Str, Some(Literal::Str(text))) => {
            let bytes = text.as_bytes().to_vec();
            var.buffer_size = bytes.len() as u64;
            var.buffer = Some(bytes.clone());
            var.str_value = bytes;
        }
        (TypeName::Str, Some(_)) => return Err(mismatch("a string")),
        (TypeName::Str, None) => var.buffer_size = DEFAULT_STR_CAPACITY,
        (TypeName::Array, Some(Literal::Int(count))) if *count > 0 => {
            let count = *count as u64;
            var.ty = VarType::Array { count };
            var.buffer_size = count;
            var.buffer = Some(vec![0; count as usize]);
        }
        (TypeName::Array, _) => return Err(mismatch("a positive element count")),
        (TypeName::Extern, Some(_)) => return Err(mismatch("absent")),
        (_, None) => {}
    }
    Ok(var)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> UnitNode {
        Parser::new("test.mxvm", text).unwrap().parse_unit().unwrap()
    }

    fn parse_err(text: &str) -> Error {
        match Parser::new("test.mxvm", text) {
            Ok(mut parser) => parser.parse_unit().unwrap_err(),
            Err(e) => e,
        }
    }

    const SAMPLE: &str = r#"program demo {
    section data {
        int a = 2
        int b = 3
        int c
        string greeting = "hi\n"
        // scratch space
        array buf = 16
    }
    section code {
    main:
        mov c, a
        add c, b
        print greeting
        exit 0
    }
}
"#;

    #[test]
    fn test_parse_structure() {
        let unit = parse(SAMPLE);
        assert_eq!(unit.kind, UnitKind::Program);
        assert_eq!(unit.name, "demo");
        assert_eq!(unit.sections.len(), 2);
        assert_eq!(unit.sections[0].kind, SectionKind::Data);
        assert_eq!(unit.sections[0].stmts.len(), 6);
        assert_eq!(unit.sections[1].stmts.len(), 5);
        assert!(matches!(unit.sections[1].stmts[0], Stmt::Label(_)));
    }

    #[test]
    fn test_parse_print_parse_round_trip() {
        // Printing is canonical: a second parse-print cycle is a fixpoint.
        let printed = format!("{}", parse(SAMPLE));
        let reprinted = format!("{}", parse(&printed));
        assert_eq!(printed, reprinted);
        assert_eq!(parse(&printed), parse(&reprinted));
    }

    #[test]
    fn test_round_trip_preserves_comments_and_escapes() {
        let printed = format!("{}", parse(SAMPLE));
        assert!(printed.contains("// scratch space"));
        assert!(printed.contains("\"hi\\n\""));
    }

    #[test]
    fn test_inline_comment_after_instruction() {
        let unit = parse(
            "program p { section code {\n mov a, 1 // set up\n exit 0\n } }",
        );
        let stmts = &unit.sections[0].stmts;
        assert!(matches!(stmts[0], Stmt::Inst(_)));
        assert!(matches!(stmts[1], Stmt::Comment(_)));
        assert!(matches!(stmts[2], Stmt::Inst(_)));
    }

    #[test]
    fn test_operand_forms() {
        let unit = parse(
            "program p { section code {\n mov x, -2\n mov y, 1.5\n mov s, \"z\"\n } }",
        );
        let ops = |i: usize| match &unit.sections[0].stmts[i] {
            Stmt::Inst(inst) => inst.operands.clone(),
            _ => panic!("not an instruction"),
        };
        assert_eq!(ops(0)[1], OperandExpr::Int(-2));
        assert_eq!(ops(1)[1], OperandExpr::Float(1.5));
        assert_eq!(ops(2)[1], OperandExpr::Str("z".to_string()));
    }

    #[test]
    fn test_errors_carry_location() {
        let err = parse_err("program p { section code {\n bogus a\n } }");
        let text = format!("{}", err);
        assert!(text.contains("bogus"));
        assert!(text.contains("test.mxvm:2"));

        let err = parse_err("program p { section nope { } }");
        assert!(format!("{}", err).contains("unknown section"));

        let err = parse_err("object x { section data { int } }");
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_module_descriptor() {
        let text = "module io {\n seed_random\n rand_number\n to_seconds: float\n}";
        let module = Parser::new("io.mxvm", text).unwrap().parse_module().unwrap();
        assert_eq!(module.name, "io");
        assert_eq!(module.id, "libio.so");
        assert_eq!(module.functions.len(), 3);
        assert_eq!(module.functions[0].ret, RetCat::Int);
        assert_eq!(module.functions[2].ret, RetCat::Float);
        assert_eq!(module.functions[2].module, "io");
    }

    #[test]
    fn test_build_program() {
        let mut loader = Loader::new(Paths::default());
        let program = loader.load_source("test.mxvm", SAMPLE).unwrap();
        assert_eq!(program.name, "demo");
        assert!(!program.is_object);
        assert_eq!(program.root_name, "demo");
        assert_eq!(program.vars.len(), 5);
        assert_eq!(program.var_index["c"], 2);
        assert_eq!(program.labels["main"].address, 0);
        assert!(!program.labels["main"].exported);
        // Four parsed instructions plus the implicit trailing exit.
        assert_eq!(program.instructions.len(), 5);
        assert_eq!(program.instructions[4].opcode, Opcode::Exit);
    }

    #[test]
    fn test_variable_initializers() {
        let mut loader = Loader::new(Paths::default());
        let program = loader
            .load_source(
                "t.mxvm",
                "program p { section data {\n float f = 2.5\n byte b = 300\n string s\n string t = \"ab\"\n } }",
            )
            .unwrap();
        let f = program.variable("f").unwrap();
        assert_eq!(f.float_value, 2.5);
        let b = program.variable("b").unwrap();
        assert_eq!(b.int_value, 300 & 0xff);
        let s = program.variable("s").unwrap();
        assert_eq!(s.buffer_size, DEFAULT_STR_CAPACITY);
        assert!(s.buffer.is_none());
        let t = program.variable("t").unwrap();
        assert_eq!(t.buffer_size, 2);
        assert_eq!(t.str_value, b"ab");
    }

    #[test]
    fn test_object_labels_are_exported() {
        let mut loader = Loader::new(Paths::default());
        let program = loader
            .load_source("lib.mxvm", "object lib { section code {\n helper:\n ret\n } }")
            .unwrap();
        assert!(program.is_object);
        assert!(program.labels["helper"].exported);
    }

    #[test]
    fn test_import_cycle_loads_each_unit_once() {
        let dir = std::env::temp_dir().join(format!("mxvm-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("alpha.mxvm"),
            "object alpha { section object {\n beta\n } section code {\n a_entry:\n ret\n } }",
        )
        .unwrap();
        std::fs::write(
            dir.join("beta.mxvm"),
            "object beta { section object {\n alpha\n } section code {\n b_entry:\n ret\n } }",
        )
        .unwrap();
        std::fs::write(
            dir.join("main.mxvm"),
            "program main { section object {\n alpha\n } section code {\n main:\n call alpha.a_entry\n exit 0\n } }",
        )
        .unwrap();

        let mut paths = Paths::default();
        paths.object_path = dir.clone();
        let mut loader = Loader::new(paths);
        let mut program = loader.load(&dir.join("main.mxvm")).unwrap();
        assert_eq!(program.objects.len(), 1);
        assert_eq!(program.objects[0].name, "alpha");
        assert_eq!(program.objects[0].objects.len(), 1);
        assert_eq!(program.objects[0].objects[0].name, "beta");
        // beta's alpha import was a silent no-op.
        assert!(program.objects[0].objects[0].objects.is_empty());

        // The cross-unit call links against the qualified label.
        crate::validate::validate(&mut program).unwrap();
        let image = crate::program::link(program).unwrap();
        assert!(image.labels.contains_key("alpha.a_entry"));
        assert!(image.labels.contains_key("beta.b_entry"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        let mut loader = Loader::new(Paths::default());
        let err = loader
            .load_source("t.mxvm", "program p { section data {\n int a\n int a\n } }")
            .unwrap_err();
        assert!(format!("{}", err).contains("duplicate variable"));
    }
}
