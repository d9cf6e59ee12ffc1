// The linkage model.
//
// Parsing produces a tree: a root Program owning child Programs (object
// units) and Modules (dynamic-library descriptors). Cross-unit references
// are names; the linker resolves them to indices and flattens the tree
// into a single Image the interpreter and the emitter share. No pointers
// cross unit boundaries, so teardown is plain bottom-up drops.
//
// Flattening appends each object unit's instructions after the root's and
// rebases the slot and address indices the per-unit validator assigned.
// Exported object labels enter the merged table under a qualified
// `object.label` name, and under the bare label while that stays
// unambiguous; duplicates demote the bare name to qualified-only.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::ffi::{ArgCat, RetCat, Signature};
use crate::inst::{Category, Instruction, Opcode, OperandKind, VarType, Variable};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Label {
    pub address: u64,
    pub exported: bool,
}

// One external reference recorded by the linker.
#[derive(Clone, Debug, PartialEq)]
pub struct ExternRef {
    pub unit: String,
    pub symbol: String,
    pub is_module: bool,
}

// One function a module descriptor offers.
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalFunction {
    pub name: String,
    pub module: String,
    pub ret: RetCat,
}

// Metadata of a dynamic library from which named functions may be called.
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub id: String,
    pub name: String,
    pub functions: Vec<ExternalFunction>,
}

impl Module {
    pub fn new(name: &str) -> Module {
        Module {
            id: format!("lib{}.so", name),
            name: name.to_string(),
            functions: Vec::new(),
        }
    }
}

// One parsed translation unit. Variables keep declaration order so that
// emitted assembly is stable; the name index is a lookup aside.
#[derive(Clone, Debug)]
pub struct Program {
    pub name: String,
    pub is_object: bool,
    pub root_name: String,
    pub instructions: Vec<Instruction>,
    pub labels: HashMap<String, Label>,
    pub vars: Vec<Variable>,
    pub var_index: HashMap<String, usize>,
    pub objects: Vec<Program>,
    pub modules: Vec<Module>,
    pub externs: Vec<ExternRef>,
}

impl Program {
    pub fn new(name: &str, is_object: bool, root_name: &str) -> Program {
        Program {
            name: name.to_string(),
            is_object,
            root_name: root_name.to_string(),
            instructions: Vec::new(),
            labels: HashMap::new(),
            vars: Vec::new(),
            var_index: HashMap::new(),
            objects: Vec::new(),
            modules: Vec::new(),
            externs: Vec::new(),
        }
    }

    pub fn add_variable(&mut self, var: Variable) -> usize {
        let slot = self.vars.len();
        self.var_index.insert(var.name.clone(), slot);
        self.vars.push(var);
        slot
    }

    pub fn add_label(&mut self, name: &str, address: u64, exported: bool) {
        self.labels.insert(name.to_string(), Label { address, exported });
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.var_index.get(name).map(|slot| &self.vars[*slot])
    }
}

// Call descriptor for one invoke site, fixed at link time.
#[derive(Clone, Debug, PartialEq)]
pub struct CallTarget {
    pub module: String,
    pub symbol: String,
    pub sig: Signature,
}

// The linked executable form: one flat instruction stream, one slot-indexed
// variable table, a merged label map and the extern/call tables.
#[derive(Clone, Debug)]
pub struct Image {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub labels: HashMap<String, Label>,
    pub vars: Vec<Variable>,
    pub var_index: HashMap<String, usize>,
    pub modules: Vec<Module>,
    pub externs: Vec<ExternRef>,
    pub calls: Vec<CallTarget>,
    pub entry: u64,
}

impl Image {
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.var_index.get(name).map(|slot| &self.vars[*slot])
    }
}

pub fn link(root: Program) -> Result<Image> {
    // The entry point is the root's own main, never an imported one.
    let entry = root.labels.get("main").map(|l| l.address).unwrap_or(0);

    let mut image = Image {
        name: root.name.clone(),
        instructions: Vec::new(),
        labels: HashMap::new(),
        vars: Vec::new(),
        var_index: HashMap::new(),
        modules: Vec::new(),
        externs: Vec::new(),
        calls: Vec::new(),
        entry,
    };
    let mut demoted = HashSet::new();

    let is_object = root.is_object;
    flatten(root, &mut image, &mut demoted, !is_object)?;
    resolve_cross_unit(&mut image, &demoted)?;

    debug!(
        "linked {}: {} instructions, {} vars, {} externs",
        image.name,
        image.instructions.len(),
        image.vars.len(),
        image.externs.len()
    );
    Ok(image)
}

fn flatten(
    unit: Program,
    image: &mut Image,
    demoted: &mut HashSet<String>,
    is_root: bool,
) -> Result<()> {
    let code_base = image.instructions.len() as u64;
    let var_base = image.vars.len() as u64;
    let unit_name = unit.name;

    for mut var in unit.vars {
        if var.ty == VarType::Extern {
            image.externs.push(ExternRef {
                unit: unit_name.clone(),
                symbol: var.name.clone(),
                is_module: false,
            });
        }
        if !is_root {
            var.name = format!("{}.{}", unit_name, var.name);
        }
        let slot = image.vars.len();
        image.var_index.insert(var.name.clone(), slot);
        image.vars.push(var);
    }

    for mut inst in unit.instructions {
        for op in &mut inst.ops {
            if let Some(index) = op.resolved {
                match op.kind {
                    OperandKind::Var => op.resolved = Some(index + var_base),
                    OperandKind::Label => op.resolved = Some(index + code_base),
                    _ => {}
                }
            }
        }
        image.instructions.push(inst);
    }

    // Sorted for a stable merge order.
    let mut labels: Vec<(String, Label)> = unit.labels.into_iter().collect();
    labels.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, label) in labels {
        let merged = Label {
            address: label.address + code_base,
            exported: label.exported,
        };
        if is_root {
            image.labels.insert(name, merged);
            continue;
        }
        image
            .labels
            .insert(format!("{}.{}", unit_name, name), merged);
        if demoted.contains(&name) {
            continue;
        }
        if image.labels.contains_key(&name) {
            image.labels.remove(&name);
            demoted.insert(name);
        } else {
            image.labels.insert(name, merged);
        }
    }

    for module in unit.modules {
        if !image.modules.iter().any(|m| m.name == module.name) {
            image.modules.push(module);
        }
    }

    for object in unit.objects {
        flatten(object, image, demoted, false)?;
    }
    Ok(())
}

// Resolve what per-unit validation could not: label references that name
// another unit's exports, and invoke targets, which become typed call
// descriptors here so the interpreter does no lookup per call.
fn resolve_cross_unit(image: &mut Image, demoted: &HashSet<String>) -> Result<()> {
    let mut instructions = std::mem::take(&mut image.instructions);
    let count = instructions.len() as u64;

    for inst in &mut instructions {
        if inst.opcode == Opcode::Invoke {
            let symbol = inst.ops[0].text.clone();
            let func = image
                .modules
                .iter()
                .flat_map(|m| m.functions.iter())
                .find(|f| f.name == symbol)
                .cloned()
                .ok_or_else(|| {
                    Error::SymbolNotFound(format!("{} at {}", symbol, inst.loc))
                })?;
            let mut args = Vec::new();
            for op in &inst.ops[1..] {
                args.push(match op.kind {
                    OperandKind::ImmFloat => ArgCat::Float,
                    OperandKind::Var => {
                        let slot = op.resolved.unwrap_or(0) as usize;
                        match image.vars[slot].ty.category() {
                            Category::Float => ArgCat::Float,
                            // Strings and arrays pass as pointers.
                            _ => ArgCat::Int,
                        }
                    }
                    _ => ArgCat::Int,
                });
            }
            inst.ops[0].resolved = Some(image.calls.len() as u64);
            image.calls.push(CallTarget {
                module: func.module.clone(),
                symbol: symbol.clone(),
                sig: Signature {
                    args,
                    ret: func.ret,
                },
            });
            if !image
                .externs
                .iter()
                .any(|e| e.symbol == symbol && e.is_module)
            {
                image.externs.push(ExternRef {
                    unit: func.module,
                    symbol,
                    is_module: true,
                });
            }
        }

        for op in &mut inst.ops {
            if op.kind != OperandKind::Label {
                continue;
            }
            if op.resolved.is_none() {
                match image.labels.get(&op.text) {
                    Some(label) => op.resolved = Some(label.address),
                    None if demoted.contains(&op.text) => {
                        return Err(Error::AmbiguousSymbol {
                            loc: inst.loc.clone(),
                            name: op.text.clone(),
                        });
                    }
                    None => {
                        return Err(Error::UndefinedLabel {
                            loc: inst.loc.clone(),
                            name: op.text.clone(),
                        });
                    }
                }
            }
            match op.resolved {
                Some(address) if address < count => {}
                _ => {
                    return Err(Error::Internal(format!(
                        "label `{}` resolved out of range",
                        op.text
                    )));
                }
            }
        }
    }

    image.instructions = instructions;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Location;
    use crate::inst::Operand;

    fn inst(opcode: Opcode, ops: Vec<Operand>) -> Instruction {
        Instruction {
            opcode,
            ops,
            loc: Location::new("t.mxvm", 1, 0),
        }
    }

    fn exit_inst() -> Instruction {
        let mut op = Operand::new("0", OperandKind::ImmInt);
        op.resolved = None;
        inst(Opcode::Exit, vec![op])
    }

    fn label_ref(name: &str) -> Operand {
        Operand::new(name, OperandKind::Label)
    }

    // A root program calling into one object unit.
    fn sample_tree() -> Program {
        let mut root = Program::new("main", false, "main");
        root.add_label("main", 0, false);
        root.instructions.push(inst(Opcode::Call, vec![label_ref("helper")]));
        root.instructions.push(exit_inst());

        let mut obj = Program::new("lib", true, "main");
        obj.add_label("helper", 0, true);
        obj.instructions.push(inst(Opcode::Ret, vec![]));
        root.objects.push(obj);
        root
    }

    #[test]
    fn test_object_labels_are_rebased_and_qualified() {
        let image = link(sample_tree()).unwrap();
        assert_eq!(image.instructions.len(), 3);
        assert_eq!(image.labels["lib.helper"].address, 2);
        assert_eq!(image.labels["helper"].address, 2);
        assert!(image.labels["lib.helper"].exported);
        // The cross-unit call resolved to the rebased address.
        assert_eq!(image.instructions[0].ops[0].resolved, Some(2));
        assert_eq!(image.entry, 0);
    }

    #[test]
    fn test_duplicate_bare_labels_demote() {
        let mut root = sample_tree();
        let mut other = Program::new("other", true, "main");
        other.add_label("helper", 0, true);
        other.instructions.push(inst(Opcode::Ret, vec![]));
        root.objects.push(other);

        // An unqualified reference to a demoted name is ambiguous.
        let err = link(root).unwrap_err();
        assert!(matches!(err, Error::AmbiguousSymbol { .. }));
    }

    #[test]
    fn test_qualified_reference_survives_demotion() {
        let mut root = sample_tree();
        root.instructions[0].ops[0] = label_ref("lib.helper");
        let mut other = Program::new("other", true, "main");
        other.add_label("helper", 0, true);
        other.instructions.push(inst(Opcode::Ret, vec![]));
        root.objects.push(other);

        let image = link(root).unwrap();
        assert_eq!(image.instructions[0].ops[0].resolved, Some(2));
        assert!(!image.labels.contains_key("helper"));
        assert!(image.labels.contains_key("other.helper"));
    }

    #[test]
    fn test_unresolved_label_is_reported_with_its_name() {
        let mut root = Program::new("main", false, "main");
        root.instructions.push(inst(Opcode::Jmp, vec![label_ref("nowhere")]));
        root.instructions.push(exit_inst());
        let err = link(root).unwrap_err();
        let text = format!("{}", err);
        assert!(text.contains("nowhere"));
        assert!(matches!(err, Error::UndefinedLabel { .. }));
    }

    #[test]
    fn test_every_label_ref_resolves_in_range() {
        let image = link(sample_tree()).unwrap();
        let count = image.instructions.len() as u64;
        for inst in &image.instructions {
            for op in &inst.ops {
                if op.kind == OperandKind::Label {
                    assert!(op.resolved.unwrap() < count);
                }
            }
        }
    }

    #[test]
    fn test_extern_variables_are_recorded() {
        let mut root = Program::new("main", false, "main");
        root.add_variable(Variable::new("remote", VarType::Extern));
        root.instructions.push(exit_inst());
        let image = link(root).unwrap();
        assert_eq!(
            image.externs,
            vec![ExternRef {
                unit: "main".to_string(),
                symbol: "remote".to_string(),
                is_module: false,
            }]
        );
    }

    #[test]
    fn test_invoke_builds_call_descriptor() {
        let mut root = Program::new("main", false, "main");
        let slot = root.add_variable(Variable::new("n", VarType::Int)) as u64;
        let mut module = Module::new("io");
        module.functions.push(ExternalFunction {
            name: "rand_number".to_string(),
            module: "io".to_string(),
            ret: RetCat::Int,
        });
        root.modules.push(module);

        let mut sym = Operand::new("rand_number", OperandKind::Extern);
        sym.resolved = None;
        let mut arg = Operand::new("n", OperandKind::Var);
        arg.resolved = Some(slot);
        root.instructions.push(inst(Opcode::Invoke, vec![sym, arg]));
        root.instructions.push(exit_inst());

        let image = link(root).unwrap();
        assert_eq!(image.calls.len(), 1);
        assert_eq!(image.calls[0].module, "io");
        assert_eq!(image.calls[0].sig.args, vec![ArgCat::Int]);
        assert_eq!(image.calls[0].sig.ret, RetCat::Int);
        assert_eq!(image.instructions[0].ops[0].resolved, Some(0));
        assert!(image.externs.iter().any(|e| e.is_module));
    }

    #[test]
    fn test_unknown_invoke_symbol() {
        let mut root = Program::new("main", false, "main");
        let sym = Operand::new("nope", OperandKind::Extern);
        root.instructions.push(inst(Opcode::Invoke, vec![sym]));
        root.instructions.push(exit_inst());
        let err = link(root).unwrap_err();
        assert!(matches!(err, Error::SymbolNotFound(_)));
    }
}
