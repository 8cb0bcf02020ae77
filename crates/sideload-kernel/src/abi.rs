//! Native module ABI
//!
//! A native module is a shared library exporting one C symbol,
//! [`EXPORTS_SYMBOL`], which returns a pointer to a [`ModuleExports`] table.
//! The table lists the module's top-level types and, for each type, its
//! methods with their parameter counts and entry points.
//!
//! Entry point signatures:
//!
//! - static, no parameters: [`StaticEntry`]
//! - instance, no parameters: [`InstanceEntry`] (receives the constructed instance)
//! - anything with parameters is listed so the host can see it, but the host
//!   never calls it
//!
//! Module authors build the table with [`export_module!`](crate::export_module).

use std::ffi::{CStr, CString, c_char, c_void};

/// ABI version written into every export table
pub const ABI_VERSION: u32 = 1;

/// Symbol a native module must export (NUL terminated)
pub const EXPORTS_SYMBOL: &[u8] = b"_sideload_module_exports\0";

/// Signature of the exported table accessor
pub type ExportsFn = unsafe extern "C" fn() -> *const ModuleExports;

/// Static, parameterless callback
pub type StaticEntry = extern "C" fn();

/// Instance, parameterless callback
pub type InstanceEntry = extern "C" fn(instance: *mut c_void);

/// Default constructor
pub type ConstructFn = extern "C" fn() -> *mut c_void;

/// Destructor paired with [`ConstructFn`]
pub type DestroyFn = extern "C" fn(instance: *mut c_void);

#[repr(C)]
pub struct ModuleExports {
    pub abi_version: u32,
    pub type_count: usize,
    pub types: *const TypeExport,
}

#[repr(C)]
pub struct TypeExport {
    pub name: *const c_char,
    pub construct: Option<ConstructFn>,
    pub destroy: Option<DestroyFn>,
    pub method_count: usize,
    pub methods: *const MethodExport,
}

#[repr(C)]
pub struct MethodExport {
    pub name: *const c_char,
    pub parameter_count: u32,
    pub is_static: bool,
    pub entry: *const c_void,
}

/// Errors reading an export table
#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("Export table pointer is null")]
    NullTable,

    #[error("ABI version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Export table entry has a null {0}")]
    NullPointer(&'static str),

    #[error("Export name is not valid UTF-8: {0}")]
    InvalidName(#[from] std::str::Utf8Error),
}

/// Owned copy of a type entry read from an export table
#[derive(Debug, Clone)]
pub struct ExportedType {
    pub name: String,
    pub construct: Option<ConstructFn>,
    pub destroy: Option<DestroyFn>,
    pub methods: Vec<ExportedMethod>,
}

/// Owned copy of a method entry read from an export table
#[derive(Debug, Clone)]
pub struct ExportedMethod {
    pub name: String,
    pub parameter_count: u32,
    pub is_static: bool,
    pub entry: *const c_void,
}

/// Copy an export table into owned values.
///
/// # Safety
/// `exports` must be null or point to a table laid out as [`ModuleExports`]
/// whose strings and arrays stay valid for the duration of the call. The
/// copied entry points are only valid while the library that exported them
/// stays loaded.
pub unsafe fn read_exports(exports: *const ModuleExports) -> Result<Vec<ExportedType>, AbiError> {
    unsafe {
        let table = exports.as_ref().ok_or(AbiError::NullTable)?;
        if table.abi_version != ABI_VERSION {
            return Err(AbiError::VersionMismatch {
                expected: ABI_VERSION,
                actual: table.abi_version,
            });
        }

        if table.type_count > 0 && table.types.is_null() {
            return Err(AbiError::NullPointer("type table"));
        }

        let mut types = Vec::with_capacity(table.type_count);
        for i in 0..table.type_count {
            let ty = &*table.types.add(i);
            if ty.method_count > 0 && ty.methods.is_null() {
                return Err(AbiError::NullPointer("method table"));
            }
            let mut methods = Vec::with_capacity(ty.method_count);
            for j in 0..ty.method_count {
                let method = &*ty.methods.add(j);
                if method.entry.is_null() {
                    return Err(AbiError::NullPointer("method entry"));
                }
                methods.push(ExportedMethod {
                    name: read_name(method.name)?,
                    parameter_count: method.parameter_count,
                    is_static: method.is_static,
                    entry: method.entry,
                });
            }
            types.push(ExportedType {
                name: read_name(ty.name)?,
                construct: ty.construct,
                destroy: ty.destroy,
                methods,
            });
        }

        Ok(types)
    }
}

unsafe fn read_name(ptr: *const c_char) -> Result<String, AbiError> {
    if ptr.is_null() {
        return Err(AbiError::NullPointer("name"));
    }
    let name = unsafe { CStr::from_ptr(ptr) };
    Ok(name.to_str()?.to_string())
}

/// Builds an [`ExportTable`]
#[derive(Default)]
pub struct ExportTableBuilder {
    types: Vec<TypeBuilder>,
}

impl ExportTableBuilder {
    /// Add a top-level type and return it for method registration
    pub fn add_type(&mut self, name: &str) -> &mut TypeBuilder {
        self.types.push(TypeBuilder {
            name: name.to_string(),
            construct: None,
            destroy: None,
            methods: Vec::new(),
        });
        let last = self.types.len() - 1;
        &mut self.types[last]
    }

    pub fn build(self) -> ExportTable {
        let mut names = Vec::new();
        let mut method_tables = Vec::with_capacity(self.types.len());
        let mut types = Vec::with_capacity(self.types.len());

        for ty in self.types {
            let methods: Box<[MethodExport]> = ty
                .methods
                .into_iter()
                .map(|m| {
                    let name = to_c_string(&m.name);
                    let export = MethodExport {
                        name: name.as_ptr(),
                        parameter_count: m.parameter_count,
                        is_static: m.is_static,
                        entry: m.entry,
                    };
                    names.push(name);
                    export
                })
                .collect();

            let type_name = to_c_string(&ty.name);
            types.push(TypeExport {
                name: type_name.as_ptr(),
                construct: ty.construct,
                destroy: ty.destroy,
                method_count: methods.len(),
                methods: methods.as_ptr(),
            });
            names.push(type_name);
            method_tables.push(methods);
        }

        let types = types.into_boxed_slice();
        let exports = ModuleExports {
            abi_version: ABI_VERSION,
            type_count: types.len(),
            types: types.as_ptr(),
        };

        ExportTable {
            _names: names,
            _methods: method_tables,
            _types: types,
            exports,
        }
    }
}

/// A type being described to the host
pub struct TypeBuilder {
    name: String,
    construct: Option<ConstructFn>,
    destroy: Option<DestroyFn>,
    methods: Vec<MethodBuilder>,
}

struct MethodBuilder {
    name: String,
    parameter_count: u32,
    is_static: bool,
    entry: *const c_void,
}

impl TypeBuilder {
    /// Give the type a default constructor and matching destructor
    pub fn constructor(&mut self, construct: ConstructFn, destroy: DestroyFn) -> &mut Self {
        self.construct = Some(construct);
        self.destroy = Some(destroy);
        self
    }

    pub fn static_method(&mut self, name: &str, entry: StaticEntry) -> &mut Self {
        self.raw_method(name, 0, true, entry as *const c_void)
    }

    pub fn instance_method(&mut self, name: &str, entry: InstanceEntry) -> &mut Self {
        self.raw_method(name, 0, false, entry as *const c_void)
    }

    /// List a method with an arbitrary signature
    pub fn raw_method(
        &mut self,
        name: &str,
        parameter_count: u32,
        is_static: bool,
        entry: *const c_void,
    ) -> &mut Self {
        self.methods.push(MethodBuilder {
            name: name.to_string(),
            parameter_count,
            is_static,
            entry,
        });
        self
    }
}

fn to_c_string(name: &str) -> CString {
    CString::new(name.replace('\0', "")).unwrap_or_default()
}

/// A finished export table.
///
/// Owns every string and array its [`ModuleExports`] points into; the
/// pointers stay valid for as long as the table lives.
pub struct ExportTable {
    _names: Vec<CString>,
    _methods: Vec<Box<[MethodExport]>>,
    _types: Box<[TypeExport]>,
    exports: ModuleExports,
}

// The table is immutable after build and only read through raw pointers.
unsafe impl Send for ExportTable {}
unsafe impl Sync for ExportTable {}

impl ExportTable {
    pub fn builder() -> ExportTableBuilder {
        ExportTableBuilder::default()
    }

    pub fn exports(&self) -> *const ModuleExports {
        &self.exports
    }
}

/// Export a module's types from a native library.
///
/// ```rust,ignore
/// extern "C" fn on_load() {
///     println!("hello from the addon");
/// }
///
/// sideload_kernel::export_module!(|exports| {
///     exports.add_type("Addon").static_method("OnLoad", on_load);
/// });
/// ```
#[macro_export]
macro_rules! export_module {
    (|$builder:ident| $body:block) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _sideload_module_exports() -> *const $crate::abi::ModuleExports {
            static TABLE: ::std::sync::OnceLock<$crate::abi::ExportTable> =
                ::std::sync::OnceLock::new();
            TABLE
                .get_or_init(|| {
                    let mut table = $crate::abi::ExportTable::builder();
                    {
                        let $builder = &mut table;
                        let _ = $body;
                    }
                    table.build()
                })
                .exports()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static LOADS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn on_load() {
        LOADS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn on_tick(_instance: *mut c_void) {}

    extern "C" fn construct() -> *mut c_void {
        Box::into_raw(Box::new(0u32)) as *mut c_void
    }

    extern "C" fn destroy(instance: *mut c_void) {
        unsafe { drop(Box::from_raw(instance as *mut u32)) };
    }

    #[test]
    fn test_table_is_readable_by_host() {
        let mut builder = ExportTable::builder();
        builder
            .add_type("Addon")
            .static_method("OnLoad", on_load)
            .raw_method("OnCommand", 2, true, on_load as *const c_void);
        builder
            .add_type("Ticker")
            .constructor(construct, destroy)
            .instance_method("Tick", on_tick);
        let table = builder.build();

        let types = unsafe { read_exports(table.exports()) }.unwrap();
        assert_eq!(types.len(), 2);

        let addon = &types[0];
        assert_eq!(addon.name, "Addon");
        assert!(addon.construct.is_none());
        assert_eq!(addon.methods.len(), 2);
        assert_eq!(addon.methods[0].name, "OnLoad");
        assert_eq!(addon.methods[0].parameter_count, 0);
        assert!(addon.methods[0].is_static);
        assert_eq!(addon.methods[1].parameter_count, 2);

        let ticker = &types[1];
        assert!(ticker.construct.is_some());
        assert!(!ticker.methods[0].is_static);

        let entry: StaticEntry = unsafe { std::mem::transmute(addon.methods[0].entry) };
        entry();
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejects_other_abi_version() {
        let mut table = ExportTable::builder().build();
        table.exports.abi_version = ABI_VERSION + 1;

        let err = unsafe { read_exports(table.exports()) }.unwrap_err();
        assert!(matches!(err, AbiError::VersionMismatch { .. }));
    }

    #[test]
    fn test_rejects_null_table() {
        let err = unsafe { read_exports(std::ptr::null()) }.unwrap_err();
        assert!(matches!(err, AbiError::NullTable));
    }

    #[test]
    fn test_rejects_counted_but_null_types() {
        let exports = ModuleExports {
            abi_version: ABI_VERSION,
            type_count: 3,
            types: std::ptr::null(),
        };

        let err = unsafe { read_exports(&exports) }.unwrap_err();
        assert!(matches!(err, AbiError::NullPointer("type table")));
    }

    #[test]
    fn test_rejects_counted_but_null_methods() {
        let name = CString::new("Addon").unwrap();
        let ty = TypeExport {
            name: name.as_ptr(),
            construct: None,
            destroy: None,
            method_count: 2,
            methods: std::ptr::null(),
        };
        let exports = ModuleExports {
            abi_version: ABI_VERSION,
            type_count: 1,
            types: &ty,
        };

        let err = unsafe { read_exports(&exports) }.unwrap_err();
        assert!(matches!(err, AbiError::NullPointer("method table")));
    }

    #[test]
    fn test_empty_counts_allow_null_arrays() {
        let exports = ModuleExports {
            abi_version: ABI_VERSION,
            type_count: 0,
            types: std::ptr::null(),
        };

        let types = unsafe { read_exports(&exports) }.unwrap();
        assert!(types.is_empty());
    }

    #[test]
    fn test_interior_nul_is_stripped() {
        let mut builder = ExportTable::builder();
        builder.add_type("Ad\0don");
        let table = builder.build();

        let types = unsafe { read_exports(table.exports()) }.unwrap();
        assert_eq!(types[0].name, "Addon");
    }
}
