// Dynamic-library bridge for the invoke instruction.
//
// A call descriptor (argument categories plus return category) is fixed
// at link time, so the hot path does no reflection: it packs the integer
// and floating arguments into two fixed banks and calls through one of
// two raw function shapes.
//
// The packing relies on the System V AMD64 classification rule that
// integer and floating arguments are assigned to registers independently,
// in order of appearance within their own category. A callee expecting
// any mixture of up to 8 integer and up to 8 floating arguments reads
// exactly the registers and stack slots a caller of the 16-argument shape
// below populates.

use std::collections::HashMap;
use std::path::PathBuf;

use libloading::Library;

use crate::error::{Error, Result};

pub const MAX_INT_ARGS: usize = 8;
pub const MAX_FLOAT_ARGS: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgCat {
    Int,
    Float,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetCat {
    Void,
    Int,
    Float,
    Ptr,
}

impl RetCat {
    pub fn from_keyword(name: &str) -> Option<RetCat> {
        match name {
            "void" => Some(RetCat::Void),
            "int" => Some(RetCat::Int),
            "float" => Some(RetCat::Float),
            "ptr" => Some(RetCat::Ptr),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub args: Vec<ArgCat>,
    pub ret: RetCat,
}

#[derive(Copy, Clone, Debug)]
pub enum ArgValue {
    Int(i64),
    Float(f64),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RetValue {
    Void,
    Int(i64),
    Float(f64),
    Ptr(u64),
}

#[rustfmt::skip]
type RawIntFn = unsafe extern "C" fn(
    i64, i64, i64, i64, i64, i64, i64, i64,
    f64, f64, f64, f64, f64, f64, f64, f64,
) -> i64;

#[rustfmt::skip]
type RawFloatFn = unsafe extern "C" fn(
    i64, i64, i64, i64, i64, i64, i64, i64,
    f64, f64, f64, f64, f64, f64, f64, f64,
) -> f64;

// Open library handles, keyed by module name. Handles are acquired on
// first use and closed when the registry is dropped, on every exit path.
pub struct ModuleRegistry {
    libs: HashMap<String, Library>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            libs: HashMap::new(),
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.libs.len()
    }

    // Call `symbol` from module `name` with the given descriptor. A
    // library opened for a symbol that turns out to be missing is closed
    // before the error is returned, never cached.
    pub fn call(
        &mut self,
        name: &str,
        symbol: &str,
        sig: &Signature,
        args: &[ArgValue],
        search: &[PathBuf],
    ) -> Result<RetValue> {
        let addr = match self.libs.get(name) {
            Some(lib) => Self::resolve(lib, symbol)?,
            None => {
                let lib = Self::open(name, search)?;
                let addr = Self::resolve(&lib, symbol)?;
                self.libs.insert(name.to_string(), lib);
                addr
            }
        };
        dispatch(addr, sig, args)
    }

    fn open(name: &str, search: &[PathBuf]) -> Result<Library> {
        let file = format!("lib{}.so", name);
        let path = search
            .iter()
            .map(|dir| dir.join(&file))
            .find(|p| p.exists());
        let result = match &path {
            Some(p) => unsafe { Library::new(p) },
            // Fall back to the system loader's own search.
            None => unsafe { Library::new(&file) },
        };
        result.map_err(|e| Error::LibraryNotFound(format!("{}: {}", file, e)))
    }

    fn resolve(lib: &Library, symbol: &str) -> Result<*const ()> {
        let name = format!("{}\0", symbol);
        let sym = unsafe { lib.get::<unsafe extern "C" fn()>(name.as_bytes()) };
        match sym {
            Ok(f) => Ok(*f as *const ()),
            Err(e) => Err(Error::SymbolNotFound(format!("{}: {}", symbol, e))),
        }
    }
}

// Split the arguments into the integer and floating banks, padded with
// zeroes, and call through the raw shape selected by the return category.
fn dispatch(addr: *const (), sig: &Signature, args: &[ArgValue]) -> Result<RetValue> {
    let mut ints = [0i64; MAX_INT_ARGS];
    let mut floats = [0f64; MAX_FLOAT_ARGS];
    let mut ni = 0;
    let mut nf = 0;

    for arg in args {
        match arg {
            ArgValue::Int(v) => {
                if ni == MAX_INT_ARGS {
                    return Err(Error::Internal(format!(
                        "more than {} integer arguments in external call",
                        MAX_INT_ARGS
                    )));
                }
                ints[ni] = *v;
                ni += 1;
            }
            ArgValue::Float(v) => {
                if nf == MAX_FLOAT_ARGS {
                    return Err(Error::Internal(format!(
                        "more than {} floating arguments in external call",
                        MAX_FLOAT_ARGS
                    )));
                }
                floats[nf] = *v;
                nf += 1;
            }
        }
    }

    let [i0, i1, i2, i3, i4, i5, i6, i7] = ints;
    let [f0, f1, f2, f3, f4, f5, f6, f7] = floats;

    unsafe {
        match sig.ret {
            RetCat::Float => {
                let f: RawFloatFn = std::mem::transmute(addr);
                Ok(RetValue::Float(f(
                    i0, i1, i2, i3, i4, i5, i6, i7, f0, f1, f2, f3, f4, f5, f6, f7,
                )))
            }
            RetCat::Int => {
                let f: RawIntFn = std::mem::transmute(addr);
                Ok(RetValue::Int(f(
                    i0, i1, i2, i3, i4, i5, i6, i7, f0, f1, f2, f3, f4, f5, f6, f7,
                )))
            }
            RetCat::Ptr => {
                let f: RawIntFn = std::mem::transmute(addr);
                Ok(RetValue::Ptr(f(
                    i0, i1, i2, i3, i4, i5, i6, i7, f0, f1, f2, f3, f4, f5, f6, f7,
                ) as u64))
            }
            RetCat::Void => {
                let f: RawIntFn = std::mem::transmute(addr);
                f(i0, i1, i2, i3, i4, i5, i6, i7, f0, f1, f2, f3, f4, f5, f6, f7);
                Ok(RetValue::Void)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_not_cached() {
        let mut registry = ModuleRegistry::new();
        let sig = Signature {
            args: vec![],
            ret: RetCat::Int,
        };
        let err = registry
            .call("no_such_module", "f", &sig, &[], &[PathBuf::from(".")])
            .unwrap_err();
        assert!(matches!(err, Error::LibraryNotFound(_)));
        assert_eq!(registry.loaded_count(), 0);
    }

    #[test]
    fn test_ret_categories() {
        assert_eq!(RetCat::from_keyword("float"), Some(RetCat::Float));
        assert_eq!(RetCat::from_keyword("void"), Some(RetCat::Void));
        assert_eq!(RetCat::from_keyword("ptr"), Some(RetCat::Ptr));
        assert_eq!(RetCat::from_keyword("int"), Some(RetCat::Int));
        assert_eq!(RetCat::from_keyword("double"), None);
    }

    #[test]
    fn test_too_many_arguments_rejected() {
        let sig = Signature {
            args: vec![ArgCat::Int; 9],
            ret: RetCat::Void,
        };
        let args = vec![ArgValue::Int(0); 9];
        // A null target is never reached: packing fails first.
        let err = dispatch(std::ptr::null(), &sig, &args).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
