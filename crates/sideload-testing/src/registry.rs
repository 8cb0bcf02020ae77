//! In-memory registry bridge

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use sideload_kernel::{
    CallbackError, CapabilityError, CapabilityResult, ConstructError, HandleId, Instance,
    LoadedModule, ModuleHandle, ModuleMethod, ModuleType, RealmContext, RegistrationRequest,
    RegistryBridge, TrustedImage,
};

use crate::image::{ConstructBehavior, HEADER, MethodBehavior, MethodSpec, ModuleImage, TypeSpec};

/// One observable interaction with the fake registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    Adapt,
    Register { name: String },
    Lookup { name: String },
    Unregister { name: String, handle: HandleId },
    /// A module method ran
    Callback {
        module: String,
        type_name: String,
        method: String,
    },
}

type Observer = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct Journal {
    calls: Vec<BridgeCall>,
    observations: Vec<bool>,
}

#[derive(Default)]
struct Faults {
    adapter_missing: bool,
    fail_register: bool,
    fail_lookup: bool,
    fail_unregister: bool,
}

struct Entry {
    id: HandleId,
    module: Arc<FakeModule>,
}

/// A [`RegistryBridge`] backed by a map, with switchable failures
#[derive(Default)]
pub struct FakeRegistry {
    live: Mutex<HashMap<(u64, String), Entry>>,
    journal: Arc<Mutex<Journal>>,
    faults: Mutex<Faults>,
    observer: Mutex<Option<Observer>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `adapt_image` fail as if the host adapter could not be found
    pub fn set_adapter_missing(&self, missing: bool) {
        self.faults.lock().adapter_missing = missing;
    }

    pub fn fail_register(&self, fail: bool) {
        self.faults.lock().fail_register = fail;
    }

    pub fn fail_lookup(&self, fail: bool) {
        self.faults.lock().fail_lookup = fail;
    }

    pub fn fail_unregister(&self, fail: bool) {
        self.faults.lock().fail_unregister = fail;
    }

    /// Sample `probe` on every register and unregister call
    pub fn observe(&self, probe: impl Fn() -> bool + Send + Sync + 'static) {
        *self.observer.lock() = Some(Arc::new(probe));
    }

    /// Values `probe` returned, in call order
    pub fn observations(&self) -> Vec<bool> {
        self.journal.lock().observations.clone()
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.journal.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        let mut journal = self.journal.lock();
        journal.calls.clear();
        journal.observations.clear();
    }

    pub fn register_count(&self) -> usize {
        self.count(|call| matches!(call, BridgeCall::Register { .. }))
    }

    pub fn unregister_count(&self) -> usize {
        self.count(|call| matches!(call, BridgeCall::Unregister { .. }))
    }

    /// How many times `module`'s `type_name.method` ran
    pub fn calls_to(&self, module: &str, type_name: &str, method: &str) -> usize {
        self.count(|call| match call {
            BridgeCall::Callback {
                module: m,
                type_name: t,
                method: n,
            } => m == module && t == type_name && n == method,
            _ => false,
        })
    }

    /// Number of modules currently registered
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_registered(&self, context: &RealmContext, name: &str) -> bool {
        self.live
            .lock()
            .contains_key(&(context.id(), name.to_string()))
    }

    fn count(&self, predicate: impl Fn(&BridgeCall) -> bool) -> usize {
        self.journal.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: BridgeCall) {
        self.journal.lock().calls.push(call);
    }

    fn sample(&self) {
        let observer = self.observer.lock().clone();
        if let Some(probe) = observer {
            let value = probe();
            self.journal.lock().observations.push(value);
        }
    }
}

impl RegistryBridge for FakeRegistry {
    fn adapt_image(
        &self,
        _context: &RealmContext,
        source: &mut dyn Read,
    ) -> CapabilityResult<TrustedImage> {
        self.record(BridgeCall::Adapt);
        if self.faults.lock().adapter_missing {
            return Err(CapabilityError::Unavailable("image adapter".to_string()));
        }

        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes)?;
        if !bytes.starts_with(HEADER.as_bytes()) {
            return Err(CapabilityError::MalformedImage("bad header".to_string()));
        }
        Ok(TrustedImage::from_bytes(bytes))
    }

    fn register(
        &self,
        context: &RealmContext,
        request: RegistrationRequest,
    ) -> CapabilityResult<HandleId> {
        self.sample();
        let (name, image) = request.into_parts();
        self.record(BridgeCall::Register { name: name.clone() });

        if self.faults.lock().fail_register {
            return Err(CapabilityError::Rejected(name));
        }

        let key = (context.id(), name.clone());
        if self.live.lock().contains_key(&key) {
            return Err(CapabilityError::AlreadyRegistered(name));
        }

        let text = String::from_utf8(image.into_bytes())
            .map_err(|e| CapabilityError::MalformedImage(e.to_string()))?;
        let types = ModuleImage::parse(&text).map_err(CapabilityError::Rejected)?;
        let module = FakeModule::new(&name, types, self.journal.clone());

        let id = HandleId::new();
        self.live.lock().insert(
            key,
            Entry {
                id,
                module: Arc::new(module),
            },
        );
        Ok(id)
    }

    fn lookup(&self, context: &RealmContext, name: &str) -> CapabilityResult<ModuleHandle> {
        self.record(BridgeCall::Lookup {
            name: name.to_string(),
        });
        if self.faults.lock().fail_lookup {
            return Err(CapabilityError::NotFound(name.to_string()));
        }

        let live = self.live.lock();
        let entry = live
            .get(&(context.id(), name.to_string()))
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;
        let module: Arc<dyn LoadedModule> = entry.module.clone();
        Ok(ModuleHandle::with_id(entry.id, module))
    }

    fn unregister(&self, context: &RealmContext, name: &str, id: HandleId) -> CapabilityResult<()> {
        self.sample();
        self.record(BridgeCall::Unregister {
            name: name.to_string(),
            handle: id,
        });
        if self.faults.lock().fail_unregister {
            return Err(CapabilityError::Rejected(name.to_string()));
        }

        let mut live = self.live.lock();
        let key = (context.id(), name.to_string());
        match live.get(&key) {
            Some(entry) if entry.id == id => {
                live.remove(&key);
                Ok(())
            }
            _ => Err(CapabilityError::StaleHandle(id)),
        }
    }
}

struct FakeModule {
    name: String,
    types: HashMap<String, Arc<FakeType>>,
}

impl FakeModule {
    fn new(name: &str, types: Vec<TypeSpec>, journal: Arc<Mutex<Journal>>) -> Self {
        let types = types
            .into_iter()
            .map(|spec| {
                let ty = FakeType {
                    module: name.to_string(),
                    name: spec.name.clone(),
                    construct: spec.construct,
                    methods: spec
                        .methods
                        .into_iter()
                        .map(|method| {
                            (
                                method.name.clone(),
                                Arc::new(FakeMethod {
                                    module: name.to_string(),
                                    type_name: spec.name.clone(),
                                    spec: method,
                                    journal: journal.clone(),
                                }),
                            )
                        })
                        .collect(),
                };
                (spec.name, Arc::new(ty))
            })
            .collect();
        Self {
            name: name.to_string(),
            types,
        }
    }
}

impl LoadedModule for FakeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_type(&self, type_name: &str) -> Option<Arc<dyn ModuleType>> {
        self.types
            .get(type_name)
            .map(|ty| ty.clone() as Arc<dyn ModuleType>)
    }
}

struct FakeType {
    module: String,
    name: String,
    construct: ConstructBehavior,
    methods: HashMap<String, Arc<FakeMethod>>,
}

/// State of a constructed fake type
pub(crate) struct FakeInstance {
    #[allow(dead_code)]
    type_name: String,
}

impl ModuleType for FakeType {
    fn name(&self) -> &str {
        &self.name
    }

    fn construct(&self) -> Result<Instance, ConstructError> {
        match self.construct {
            ConstructBehavior::Ctor => Ok(Instance::new(FakeInstance {
                type_name: self.name.clone(),
            })),
            ConstructBehavior::Static => Err(ConstructError::NoDefaultConstructor(self.name.clone())),
            ConstructBehavior::CtorFails => Err(ConstructError::Failed {
                type_name: format!("{}.{}", self.module, self.name),
                reason: "constructor threw".to_string(),
            }),
        }
    }

    fn find_method(&self, method_name: &str) -> Option<Arc<dyn ModuleMethod>> {
        self.methods
            .get(method_name)
            .map(|method| method.clone() as Arc<dyn ModuleMethod>)
    }
}

struct FakeMethod {
    module: String,
    type_name: String,
    spec: MethodSpec,
    journal: Arc<Mutex<Journal>>,
}

impl ModuleMethod for FakeMethod {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn parameter_count(&self) -> usize {
        self.spec.parameters
    }

    fn is_static(&self) -> bool {
        self.spec.is_static
    }

    fn invoke(&self, instance: Option<&mut Instance>) -> Result<(), CallbackError> {
        if !self.spec.is_static {
            let has_instance = instance.is_some_and(|i| i.downcast_ref::<FakeInstance>().is_some());
            if !has_instance {
                return Err(CallbackError::MissingInstance(self.spec.name.clone()));
            }
        }

        self.journal.lock().calls.push(BridgeCall::Callback {
            module: self.module.clone(),
            type_name: self.type_name.clone(),
            method: self.spec.name.clone(),
        });

        match self.spec.behavior {
            MethodBehavior::Ok => Ok(()),
            MethodBehavior::Panic => panic!("{} exploded", self.spec.name),
            MethodBehavior::Fail => Err(CallbackError::Failed {
                method: self.spec.name.clone(),
                reason: "callback raised".to_string(),
            }),
        }
    }
}
