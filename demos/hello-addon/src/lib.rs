//! Hello addon
//!
//! Build with `cargo build -p hello-addon`, then copy the library into a realm
//! directory under the `.module` extension, e.g.
//! `cp target/debug/libhello_addon.so sideload/client/hello.module`.
//! Copy it again after a rebuild to see `OnReload` fire.

use std::ffi::c_void;

use sideload_kernel::export_module;

/// Per-instance state, owned by this library
struct Addon {
    greeting: &'static str,
}

extern "C" fn construct() -> *mut c_void {
    Box::into_raw(Box::new(Addon {
        greeting: "hello from the addon",
    })) as *mut c_void
}

extern "C" fn destroy(instance: *mut c_void) {
    if !instance.is_null() {
        unsafe { drop(Box::from_raw(instance as *mut Addon)) };
    }
}

extern "C" fn on_load(instance: *mut c_void) {
    if let Some(addon) = unsafe { (instance as *const Addon).as_ref() } {
        println!("OnLoad: {}", addon.greeting);
    }
}

extern "C" fn on_reload(instance: *mut c_void) {
    if let Some(addon) = unsafe { (instance as *const Addon).as_ref() } {
        println!("OnReload: {}, again", addon.greeting);
    }
}

export_module!(|exports| {
    exports
        .add_type("Addon")
        .constructor(construct, destroy)
        .instance_method("OnLoad", on_load)
        .instance_method("OnReload", on_reload);
});
