//! Best-effort mapping of program counters to symbols.
//!
//! The race reporter hands us raw return addresses recorded in event traces;
//! all we promise in return is "whatever the dynamic linker knows". Line
//! numbers require DWARF and an unwinder, neither of which belongs in the
//! detector's address space, so they are left to offline tooling.

use libc::{c_void, dladdr, Dl_info};
use std::{
    ffi::CStr,
    mem::MaybeUninit,
    path::PathBuf,
    ptr,
};

/// What `dladdr` could tell us about one program counter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymInfo {
    /// Name of the nearest exported symbol at or below the pc, if any.
    pub func: Option<String>,
    /// Path of the object the pc was loaded from.
    pub obj: PathBuf,
    /// Offset of the pc from the symbol's start address. Only meaningful when
    /// `func` is `Some`.
    pub off: usize,
}

/// Resolve `pc` against the loaded objects of the current process.
///
/// Returns `None` if the pc does not fall inside any mapped object. This
/// inherits `dladdr`'s visibility rules: symbols that are not exported
/// (e.g. static functions, or a binary not linked with `--export-dynamic`)
/// resolve to an object but no function name.
pub fn sym_for_pc(pc: usize) -> Option<SymInfo> {
    let mut info = MaybeUninit::<Dl_info>::uninit();
    if unsafe { dladdr(pc as *const c_void, info.as_mut_ptr()) } == 0 {
        return None;
    }
    let info = unsafe { info.assume_init() };
    if info.dli_fname.is_null() {
        return None;
    }
    let obj = PathBuf::from(
        unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned(),
    );
    if info.dli_sname == ptr::null() {
        return Some(SymInfo {
            func: None,
            obj,
            off: 0,
        });
    }
    let func = unsafe { CStr::from_ptr(info.dli_sname) }
        .to_string_lossy()
        .into_owned();
    let off = pc.wrapping_sub(info.dli_saddr as usize);
    Some(SymInfo {
        func: Some(func),
        obj,
        off,
    })
}

#[cfg(test)]
mod tests {
    use super::sym_for_pc;
    use libc::dlsym;
    use std::{ffi::CString, ptr};

    #[test]
    fn resolves_libc_symbol() {
        // An exported symbol with a predictable (unmangled) name.
        let func = CString::new("fflush").unwrap();
        let vaddr = unsafe { dlsym(ptr::null_mut(), func.as_ptr()) };
        assert_ne!(vaddr, ptr::null_mut());
        let sym = sym_for_pc(vaddr as usize).unwrap();
        assert_eq!(sym.func.as_deref(), Some("fflush"));
        assert_eq!(sym.off, 0);
        let name = sym.obj.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("libc"));
    }

    #[test]
    fn mid_function_pc_has_offset() {
        let func = CString::new("fflush").unwrap();
        let vaddr = unsafe { dlsym(ptr::null_mut(), func.as_ptr()) } as usize;
        let sym = sym_for_pc(vaddr + 1).unwrap();
        assert_eq!(sym.func.as_deref(), Some("fflush"));
        assert_eq!(sym.off, 1);
    }

    #[test]
    fn bogus_pc_resolves_to_nothing() {
        // An address no loaded object plausibly occupies.
        assert!(sym_for_pc(1).is_none());
    }

    #[test]
    fn unexported_fn_has_no_name() {
        // Test binaries are not linked with `--export-dynamic`, so a local
        // function maps to an object but not to a symbol.
        let vaddr = unexported_fn_has_no_name as *const fn() as usize;
        if let Some(sym) = sym_for_pc(vaddr) {
            assert!(sym.func.is_none() || sym.off > 0);
        }
    }
}
