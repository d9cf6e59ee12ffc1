// Semantic validation of one unit tree.
//
// Every instruction is checked against the static signature table: operand
// count, operand kinds, and the operand categories that are knowable
// before run time. Identifier operands are classified here - a label
// position makes the operand a LABEL_REF, an invoke target an EXTERN_REF,
// anything else must name a variable of the containing unit. Variable
// references resolve to table slots and locally-defined labels to
// instruction addresses; label references that name another unit's export
// stay unresolved for the linker.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::inst::{Category, Opcode, OperandKind, VarType, SIGNATURES};
use crate::program::Program;

pub fn validate(program: &mut Program) -> Result<()> {
    validate_unit(program)?;
    for object in &mut program.objects {
        validate(object)?;
    }
    Ok(())
}

fn validate_unit(p: &mut Program) -> Result<()> {
    trace!("validating unit {}", p.name);

    let vars: HashMap<String, (u64, VarType)> = p
        .var_index
        .iter()
        .map(|(name, slot)| (name.clone(), (*slot as u64, p.vars[*slot].ty.clone())))
        .collect();
    let labels: HashMap<String, u64> = p
        .labels
        .iter()
        .map(|(name, label)| (name.clone(), label.address))
        .collect();

    for inst in &mut p.instructions {
        let sig = SIGNATURES.get(&inst.opcode).ok_or_else(|| {
            Error::Internal(format!("no signature for `{}`", inst.opcode))
        })?;

        if inst.ops.len() < sig.min || inst.ops.len() > sig.max {
            return Err(Error::OperandArityMismatch {
                loc: inst.loc.clone(),
                opcode: inst.opcode.mnemonic().to_string(),
                expected: sig.arity_text(),
                found: inst.ops.len(),
            });
        }

        for (i, op) in inst.ops.iter_mut().enumerate() {
            let expected = sig.kind_at(i);

            // Identifiers arrive from the parser as provisional VAR_REFs.
            if op.kind == OperandKind::Var && op.resolved.is_none() {
                if expected.contains(OperandKind::Label) {
                    op.kind = OperandKind::Label;
                    if let Some(address) = labels.get(&op.text) {
                        op.resolved = Some(*address);
                    }
                } else if expected.contains(OperandKind::Extern) {
                    op.kind = OperandKind::Extern;
                } else {
                    match vars.get(&op.text) {
                        Some((slot, _)) => op.resolved = Some(*slot),
                        None => {
                            return Err(Error::UndefinedVariable {
                                loc: inst.loc.clone(),
                                name: op.text.clone(),
                            });
                        }
                    }
                }
            }

            if !expected.contains(op.kind) {
                return Err(Error::TypeMismatch {
                    loc: inst.loc.clone(),
                    msg: format!(
                        "operand {} of `{}` may not be {:?}",
                        i + 1,
                        inst.opcode,
                        op.kind
                    ),
                });
            }
        }

        check_categories(inst, &vars)?;
    }
    Ok(())
}

// Category of an operand, when knowable before run time.
fn known_category(
    op: &crate::inst::Operand,
    vars: &HashMap<String, (u64, VarType)>,
) -> Option<Category> {
    match op.kind {
        OperandKind::ImmInt => Some(Category::Int),
        OperandKind::ImmFloat => Some(Category::Float),
        OperandKind::ImmStr => Some(Category::Str),
        OperandKind::Var => vars.get(&op.text).map(|(_, ty)| ty.category()),
        _ => None,
    }
}

fn check_categories(
    inst: &crate::inst::Instruction,
    vars: &HashMap<String, (u64, VarType)>,
) -> Result<()> {
    use Opcode::*;

    let mismatch = |msg: String| Error::TypeMismatch {
        loc: inst.loc.clone(),
        msg,
    };
    let var_type = |op: &crate::inst::Operand| vars.get(&op.text).map(|(_, ty)| ty.clone());

    match inst.opcode {
        Mov | Cmp => {
            let a = known_category(&inst.ops[0], vars);
            let b = known_category(&inst.ops[1], vars);
            if let (Some(a), Some(b)) = (a, b) {
                if a != b {
                    return Err(mismatch(format!(
                        "`{}` operands must share a category",
                        inst.opcode
                    )));
                }
            }
        }
        Add | Sub | Mul | Div => {
            for op in &inst.ops {
                if known_category(op, vars) == Some(Category::Str) {
                    return Err(mismatch(format!(
                        "`{}` is defined on int and float only",
                        inst.opcode
                    )));
                }
            }
            let cats: Vec<Category> =
                inst.ops.iter().filter_map(|op| known_category(op, vars)).collect();
            if cats.windows(2).any(|w| w[0] != w[1]) {
                return Err(mismatch(format!(
                    "`{}` operands must share a category",
                    inst.opcode
                )));
            }
        }
        And | Or | Xor | Not => {
            for op in &inst.ops {
                match known_category(op, vars) {
                    Some(Category::Int) | None => {}
                    Some(_) => {
                        return Err(mismatch(format!(
                            "`{}` is defined on int only",
                            inst.opcode
                        )));
                    }
                }
            }
        }
        Load | Store => {
            let addr = &inst.ops[1];
            match var_type(addr) {
                Some(VarType::Ptr) | None => {}
                Some(ty) => {
                    return Err(mismatch(format!(
                        "`{}` address must be ptr, `{}` is {}",
                        inst.opcode, addr.text, ty
                    )));
                }
            }
        }
        Print => {
            match var_type(&inst.ops[0]) {
                Some(VarType::Str) | None => {}
                Some(ty) => {
                    return Err(mismatch(format!(
                        "print format must be a string variable, `{}` is {}",
                        inst.ops[0].text, ty
                    )));
                }
            }
        }
        Getline => {
            if let Some(cat) = known_category(&inst.ops[0], vars) {
                if cat != Category::Str {
                    return Err(mismatch(
                        "getline destination must be a string or array buffer".to_string(),
                    ));
                }
            }
        }
        ToInt | ToFloat | LoadChar => {
            if let Some(cat) = known_category(&inst.ops[1], vars) {
                if cat != Category::Str {
                    return Err(mismatch(format!(
                        "`{}` source must be a string or array buffer",
                        inst.opcode
                    )));
                }
            }
            let want = match inst.opcode {
                ToFloat => Category::Float,
                _ => Category::Int,
            };
            if let Some(cat) = known_category(&inst.ops[0], vars) {
                if cat != want {
                    return Err(mismatch(format!(
                        "`{}` destination has the wrong category",
                        inst.opcode
                    )));
                }
            }
        }
        Exit => {
            if let Some(cat) = known_category(&inst.ops[0], vars) {
                if cat != Category::Int {
                    return Err(mismatch("exit code must be an integer".to_string()));
                }
            }
        }
        _ => {}
    }
    Ok(())
}
