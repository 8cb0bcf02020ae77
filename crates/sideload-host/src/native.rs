//! Native module registry
//!
//! A [`RegistryBridge`] for modules built as shared libraries that export a
//! `sideload_kernel::abi` table. Images are never loaded from the watched
//! path: each registration writes its bytes to a fresh staging file and maps
//! that, so the watched file can be overwritten while the old code is live.

use std::collections::HashMap;
use std::ffi::c_void;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::Mutex;
use sideload_kernel::abi::{
    self, ConstructFn, DestroyFn, EXPORTS_SYMBOL, ExportedMethod, ExportedType, ExportsFn,
    InstanceEntry, StaticEntry,
};
use sideload_kernel::{
    CallbackError, CapabilityError, CapabilityResult, ConstructError, HandleId, Instance,
    LoadedModule, ModuleHandle, ModuleMethod, ModuleType, RealmContext, RegistrationRequest,
    RegistryBridge, TrustedImage,
};
use tempfile::{TempDir, TempPath};
use tracing::{debug, info};

const ELF_MAGIC: &[u8] = b"\x7fELF";
const PE_MAGIC: &[u8] = b"MZ";
const MACHO_MAGICS: [[u8; 4]; 5] = [
    [0xfe, 0xed, 0xfa, 0xce],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xca, 0xfe, 0xba, 0xbe],
];

/// Whether `bytes` start like a shared object this platform family produces
fn is_shared_object(bytes: &[u8]) -> bool {
    bytes.starts_with(ELF_MAGIC)
        || bytes.starts_with(PE_MAGIC)
        || MACHO_MAGICS.iter().any(|magic| bytes.starts_with(magic))
}

struct Registered {
    id: HandleId,
    module: Arc<NativeModule>,
}

/// Registry of native modules, keyed by realm context and module name
pub struct NativeRegistry {
    staging: TempDir,
    modules: Mutex<HashMap<(u64, String), Registered>>,
}

impl NativeRegistry {
    /// Stage images under a private temporary directory
    pub fn new() -> CapabilityResult<Self> {
        Ok(Self::with_staging(TempDir::new()?))
    }

    /// Stage images under a private directory inside `parent`
    pub fn in_dir<P: AsRef<Path>>(parent: P) -> CapabilityResult<Self> {
        Ok(Self::with_staging(TempDir::new_in(parent)?))
    }

    fn with_staging(staging: TempDir) -> Self {
        debug!("Staging native modules in {:?}", staging.path());
        Self {
            staging,
            modules: Mutex::new(HashMap::new()),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Names registered for `context`, sorted
    pub fn registered_names(&self, context: &RealmContext) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .lock()
            .keys()
            .filter(|(ctx, _)| *ctx == context.id())
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn stage(&self, name: &str, image: &TrustedImage) -> CapabilityResult<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .suffix(std::env::consts::DLL_SUFFIX)
            .tempfile_in(self.staging.path())?;
        file.write_all(image.as_bytes())?;
        file.flush()?;
        Ok(file.into_temp_path())
    }
}

impl RegistryBridge for NativeRegistry {
    fn adapt_image(
        &self,
        _context: &RealmContext,
        source: &mut dyn Read,
    ) -> CapabilityResult<TrustedImage> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes)?;

        if bytes.is_empty() {
            return Err(CapabilityError::MalformedImage("image is empty".to_string()));
        }
        if !is_shared_object(&bytes) {
            return Err(CapabilityError::MalformedImage(
                "not a shared library image".to_string(),
            ));
        }
        Ok(TrustedImage::from_bytes(bytes))
    }

    fn register(
        &self,
        context: &RealmContext,
        request: RegistrationRequest,
    ) -> CapabilityResult<HandleId> {
        let key = (context.id(), request.name().to_string());
        if self.modules.lock().contains_key(&key) {
            return Err(CapabilityError::AlreadyRegistered(key.1));
        }

        let staged = self.stage(request.name(), request.image())?;
        let module = NativeModule::open(request.name(), staged)?;
        info!(
            "Registered native module {} with {} type(s)",
            request.name(),
            module.types.len()
        );

        let id = HandleId::new();
        self.modules.lock().insert(
            key,
            Registered {
                id,
                module: Arc::new(module),
            },
        );
        Ok(id)
    }

    fn lookup(&self, context: &RealmContext, name: &str) -> CapabilityResult<ModuleHandle> {
        let modules = self.modules.lock();
        let registered = modules
            .get(&(context.id(), name.to_string()))
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;
        let module: Arc<dyn LoadedModule> = registered.module.clone();
        Ok(ModuleHandle::with_id(registered.id, module))
    }

    fn unregister(&self, context: &RealmContext, name: &str, id: HandleId) -> CapabilityResult<()> {
        let key = (context.id(), name.to_string());
        let mut modules = self.modules.lock();
        match modules.get(&key) {
            Some(registered) if registered.id == id => {
                modules.remove(&key);
                debug!("Unregistered native module {}", name);
                Ok(())
            }
            _ => Err(CapabilityError::StaleHandle(id)),
        }
    }
}

/// A library mapped from a staging file
struct NativeModule {
    name: String,
    types: HashMap<String, Arc<NativeType>>,
    _library: Arc<Library>,
    _staged: TempPath,
}

impl NativeModule {
    fn open(name: &str, staged: TempPath) -> CapabilityResult<Self> {
        let library = unsafe {
            Library::new(&*staged)
                .map_err(|e| CapabilityError::Rejected(format!("{}: {}", name, e)))?
        };

        let exported = unsafe {
            let exports: Symbol<ExportsFn> = library.get(EXPORTS_SYMBOL).map_err(|e| {
                CapabilityError::Rejected(format!("{}: missing export table: {}", name, e))
            })?;
            abi::read_exports(exports())
                .map_err(|e| CapabilityError::Rejected(format!("{}: {}", name, e)))?
        };

        let library = Arc::new(library);
        let types = exported
            .into_iter()
            .map(|ty| {
                let ty = NativeType::new(ty, library.clone());
                (ty.name.clone(), Arc::new(ty))
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            types,
            _library: library,
            _staged: staged,
        })
    }
}

impl LoadedModule for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_type(&self, type_name: &str) -> Option<Arc<dyn ModuleType>> {
        self.types
            .get(type_name)
            .map(|ty| ty.clone() as Arc<dyn ModuleType>)
    }
}

struct NativeType {
    name: String,
    construct: Option<ConstructFn>,
    destroy: Option<DestroyFn>,
    methods: HashMap<String, Arc<NativeMethod>>,
    library: Arc<Library>,
}

impl NativeType {
    fn new(exported: ExportedType, library: Arc<Library>) -> Self {
        let methods = exported
            .methods
            .into_iter()
            .map(|method| {
                (
                    method.name.clone(),
                    Arc::new(NativeMethod {
                        export: method,
                        _library: library.clone(),
                    }),
                )
            })
            .collect();
        Self {
            name: exported.name,
            construct: exported.construct,
            destroy: exported.destroy,
            methods,
            library,
        }
    }
}

impl ModuleType for NativeType {
    fn name(&self) -> &str {
        &self.name
    }

    fn construct(&self) -> Result<Instance, ConstructError> {
        let construct = self
            .construct
            .ok_or_else(|| ConstructError::NoDefaultConstructor(self.name.clone()))?;

        let ptr = construct();
        if ptr.is_null() {
            return Err(ConstructError::Failed {
                type_name: self.name.clone(),
                reason: "constructor returned null".to_string(),
            });
        }

        Ok(Instance::new(NativeInstance {
            ptr,
            destroy: self.destroy,
            _library: self.library.clone(),
        }))
    }

    fn find_method(&self, method_name: &str) -> Option<Arc<dyn ModuleMethod>> {
        self.methods
            .get(method_name)
            .map(|method| method.clone() as Arc<dyn ModuleMethod>)
    }
}

/// Instance owned by module code, destroyed through the module's destructor
struct NativeInstance {
    ptr: *mut c_void,
    destroy: Option<DestroyFn>,
    _library: Arc<Library>,
}

// The pointer is only dereferenced by module code, on the realm's task.
unsafe impl Send for NativeInstance {}

impl Drop for NativeInstance {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy {
            destroy(self.ptr);
        }
    }
}

struct NativeMethod {
    export: ExportedMethod,
    _library: Arc<Library>,
}

// Entry points are plain code addresses kept valid by the library handle.
unsafe impl Send for NativeMethod {}
unsafe impl Sync for NativeMethod {}

impl ModuleMethod for NativeMethod {
    fn name(&self) -> &str {
        &self.export.name
    }

    fn parameter_count(&self) -> usize {
        self.export.parameter_count as usize
    }

    fn is_static(&self) -> bool {
        self.export.is_static
    }

    fn invoke(&self, instance: Option<&mut Instance>) -> Result<(), CallbackError> {
        if self.export.is_static {
            let entry = unsafe { std::mem::transmute::<*const c_void, StaticEntry>(self.export.entry) };
            entry();
            return Ok(());
        }

        let target = instance
            .and_then(|instance| instance.downcast_mut::<NativeInstance>())
            .ok_or_else(|| CallbackError::MissingInstance(self.export.name.clone()))?;
        let entry = unsafe { std::mem::transmute::<*const c_void, InstanceEntry>(self.export.entry) };
        entry(target.ptr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn registry() -> (tempfile::TempDir, NativeRegistry) {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = NativeRegistry::in_dir(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn test_adapt_rejects_non_libraries() {
        let (_dir, registry) = registry();
        let ctx = RealmContext::new("client");

        let err = registry
            .adapt_image(&ctx, &mut Cursor::new(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, CapabilityError::MalformedImage(_)));

        let err = registry
            .adapt_image(&ctx, &mut Cursor::new(b"#!/bin/sh\necho hi\n".to_vec()))
            .unwrap_err();
        assert!(matches!(err, CapabilityError::MalformedImage(_)));
    }

    #[test]
    fn test_adapt_accepts_known_headers() {
        let (_dir, registry) = registry();
        let ctx = RealmContext::new("client");

        let headers: [&[u8]; 3] = [
            b"\x7fELF\x02\x01\x01",
            b"MZ\x90\x00",
            &[0xcf, 0xfa, 0xed, 0xfe, 0x07],
        ];
        for header in headers {
            let image = registry
                .adapt_image(&ctx, &mut Cursor::new(header.to_vec()))
                .unwrap();
            assert_eq!(image.as_bytes(), header);
        }
    }

    #[test]
    fn test_truncated_library_is_rejected_without_registration() {
        let (_dir, registry) = registry();
        let ctx = RealmContext::new("client");

        let image = TrustedImage::from_bytes(b"\x7fELF truncated".to_vec());
        let err = registry
            .register(&ctx, RegistrationRequest::new("broken", image))
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Rejected(_)));
        assert!(registry.registered_names(&ctx).is_empty());

        // The staging file went away with the failed registration
        let staged = std::fs::read_dir(registry.staging_dir()).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[test]
    fn test_lookup_unknown_module() {
        let (_dir, registry) = registry();
        let ctx = RealmContext::new("client");
        assert!(matches!(
            registry.lookup(&ctx, "missing"),
            Err(CapabilityError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    mod dispatch {
        use super::*;
        use sideload_kernel::abi::ExportTable;
        use std::sync::atomic::{AtomicUsize, Ordering};

        static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);
        static DESTROYED: AtomicUsize = AtomicUsize::new(0);
        static STATIC_CALLS: AtomicUsize = AtomicUsize::new(0);

        extern "C" fn construct() -> *mut c_void {
            CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
            Box::into_raw(Box::new(0usize)) as *mut c_void
        }

        extern "C" fn construct_null() -> *mut c_void {
            std::ptr::null_mut()
        }

        extern "C" fn destroy(instance: *mut c_void) {
            DESTROYED.fetch_add(1, Ordering::SeqCst);
            unsafe { drop(Box::from_raw(instance as *mut usize)) };
        }

        extern "C" fn on_load() {
            STATIC_CALLS.fetch_add(1, Ordering::SeqCst);
        }

        extern "C" fn tick(instance: *mut c_void) {
            if let Some(count) = unsafe { (instance as *mut usize).as_mut() } {
                *count += 1;
            }
        }

        /// Types exported by a table built in this process, bound to the test binary
        fn types(table: &ExportTable) -> HashMap<String, NativeType> {
            let library: Library = libloading::os::unix::Library::this().into();
            let library = Arc::new(library);
            unsafe { abi::read_exports(table.exports()) }
                .unwrap()
                .into_iter()
                .map(|ty| (ty.name.clone(), NativeType::new(ty, library.clone())))
                .collect()
        }

        fn ticks(instance: &Instance) -> usize {
            let native = instance.downcast_ref::<NativeInstance>().unwrap();
            unsafe { *(native.ptr as *const usize) }
        }

        #[test]
        fn test_construct_invoke_destroy() {
            let mut builder = ExportTable::builder();
            builder
                .add_type("Addon")
                .constructor(construct, destroy)
                .static_method("OnLoad", on_load)
                .instance_method("Tick", tick);
            let table = builder.build();
            let types = types(&table);
            let addon = &types["Addon"];

            let mut instance = addon.construct().unwrap();
            assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), 1);

            let on_load = addon.find_method("OnLoad").unwrap();
            assert!(on_load.is_static());
            assert_eq!(on_load.parameter_count(), 0);
            on_load.invoke(None).unwrap();
            assert_eq!(STATIC_CALLS.load(Ordering::SeqCst), 1);

            let tick = addon.find_method("Tick").unwrap();
            assert!(!tick.is_static());
            tick.invoke(Some(&mut instance)).unwrap();
            tick.invoke(Some(&mut instance)).unwrap();
            assert_eq!(ticks(&instance), 2);

            assert!(matches!(
                tick.invoke(None),
                Err(CallbackError::MissingInstance(_))
            ));
            let mut foreign = Instance::new(0usize);
            assert!(matches!(
                tick.invoke(Some(&mut foreign)),
                Err(CallbackError::MissingInstance(_))
            ));

            assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
            drop(instance);
            assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn test_construct_without_constructor_or_with_null_result() {
            let mut builder = ExportTable::builder();
            builder.add_type("Static").static_method("OnLoad", on_load);
            builder
                .add_type("Broken")
                .constructor(construct_null, destroy)
                .instance_method("Tick", tick);
            let table = builder.build();
            let types = types(&table);

            assert!(matches!(
                types["Static"].construct(),
                Err(ConstructError::NoDefaultConstructor(_))
            ));
            assert!(matches!(
                types["Broken"].construct(),
                Err(ConstructError::Failed { .. })
            ));
            assert!(types["Static"].find_method("Missing").is_none());
        }
    }

    #[test]
    fn test_unregister_unknown_handle_is_stale() {
        let (_dir, registry) = registry();
        let ctx = RealmContext::new("client");
        assert!(matches!(
            registry.unregister(&ctx, "detached", HandleId::new()),
            Err(CapabilityError::StaleHandle(_))
        ));
    }
}
