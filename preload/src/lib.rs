//! Credential-protection preload shim.
//!
//! Built as a `cdylib` and loaded into the sandboxed command via
//! `LD_PRELOAD`, this library interposes `getenv` and `secure_getenv` so
//! that reads of protected credential variables become one-shot: the first
//! read returns the real value and scrubs the variable from the live
//! process environment; later reads from the same process are answered
//! from an in-memory cache. Any other process inspecting the environment
//! after the legitimate read (e.g. via `/proc/<pid>/environ`) sees
//! nothing.
//!
//! The interposition symbols are only compiled with the `interpose`
//! feature, which the shim build enables explicitly:
//!
//! ```text
//! cargo build -p awf-preload --release --features interpose
//! ```
//!
//! Without the feature this crate is a plain `rlib` exposing the
//! protected-name table to the orchestrator, which must not have its own
//! `getenv` interposed.

pub mod state;

pub use state::{default_protected_names, parse_override, DEBUG_VAR, OVERRIDE_VAR};

#[cfg(all(unix, feature = "interpose"))]
mod interpose {
    use std::collections::HashMap;
    use std::ffi::{CStr, CString};
    use std::sync::{Mutex, MutexGuard, OnceLock};

    use libc::c_char;

    use crate::state::{
        default_protected_names, parse_override, Decision, Shield, DEBUG_VAR, OVERRIDE_VAR,
    };

    extern "C" {
        static mut environ: *mut *mut c_char;
    }

    type GetenvFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;

    /// Everything resolved and decided during one-time initialization.
    struct Runtime {
        shield: Mutex<Shield>,
        /// Cached values handed back to C callers. Entries are never
        /// removed or mutated, so the `CString` buffers (and therefore the
        /// returned pointers) stay valid for the life of the process.
        handout: Mutex<HashMap<String, CString>>,
        real_getenv: GetenvFn,
    }

    static RUNTIME: OnceLock<Runtime> = OnceLock::new();

    fn runtime() -> &'static Runtime {
        RUNTIME.get_or_init(init)
    }

    /// Resolve the next `name` symbol after this library in link order.
    fn resolve(name: &[u8]) -> Option<GetenvFn> {
        let cname = CString::new(name).ok()?;
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            // Function pointers and object pointers share representation
            // on every platform the shim targets.
            Some(unsafe { std::mem::transmute::<*mut libc::c_void, GetenvFn>(sym) })
        }
    }

    fn stderr_line(line: &str) {
        let msg = format!("awf-preload: {line}\n");
        let bytes = msg.as_bytes();
        unsafe {
            libc::write(2, bytes.as_ptr().cast(), bytes.len());
        }
    }

    fn init() -> Runtime {
        let Some(real_getenv) = resolve(b"getenv") else {
            // No safe fallback exists: silently delegating nothing would
            // leave every token exposed.
            stderr_line("FATAL: cannot resolve the real getenv, aborting");
            unsafe { libc::abort() }
        };

        let read = |name: &str| -> Option<String> {
            let cname = CString::new(name).ok()?;
            let ptr = unsafe { real_getenv(cname.as_ptr()) };
            if ptr.is_null() {
                return None;
            }
            unsafe { CStr::from_ptr(ptr) }.to_str().ok().map(str::to_owned)
        };

        let observe_only = read(DEBUG_VAR).as_deref() == Some("1");
        if observe_only {
            stderr_line("DEBUG MODE: interceptions are logged, the environment is NOT scrubbed");
        }

        let protected = match read(OVERRIDE_VAR) {
            Some(raw) => match parse_override(&raw) {
                Some(names) => names,
                None => {
                    stderr_line("override list is empty, keeping the default protected set");
                    default_protected_names()
                }
            },
            None => default_protected_names(),
        };

        Runtime {
            shield: Mutex::new(Shield::new(protected, observe_only)),
            handout: Mutex::new(HashMap::new()),
            real_getenv,
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Remove every `NAME=` entry from the live environment: through the
    /// conventional API and then by sweeping the raw `environ` array, so
    /// duplicated entries injected behind libc's back disappear too.
    fn scrub(name: &str) {
        if let Ok(cname) = CString::new(name) {
            unsafe {
                libc::unsetenv(cname.as_ptr());
            }
        }

        let mut prefix = name.as_bytes().to_vec();
        prefix.push(b'=');
        unsafe {
            let env = environ;
            if env.is_null() {
                return;
            }
            let mut write = env;
            let mut read = env;
            while !(*read).is_null() {
                let entry = CStr::from_ptr(*read).to_bytes();
                if !entry.starts_with(&prefix) {
                    *write = *read;
                    write = write.add(1);
                }
                read = read.add(1);
            }
            *write = std::ptr::null_mut();
        }
    }

    /// Intern a cached value and return a stable C pointer to it.
    fn handout_ptr(rt: &'static Runtime, name: &str, value: &str) -> *mut c_char {
        let mut handout = lock(&rt.handout);
        let entry = handout
            .entry(name.to_owned())
            .or_insert_with(|| CString::new(value).unwrap_or_default());
        entry.as_ptr().cast_mut()
    }

    fn intercept(rt: &'static Runtime, name: *const c_char) -> *mut c_char {
        if name.is_null() {
            return std::ptr::null_mut();
        }
        let Ok(name_str) = unsafe { CStr::from_ptr(name) }.to_str() else {
            return unsafe { (rt.real_getenv)(name) };
        };

        // The lock spans decision, cache update, and environment scrub:
        // no thread of this process can observe the value in the live
        // environment after the first read has returned.
        let mut shield = lock(&rt.shield);
        if !shield.is_protected(name_str) {
            drop(shield);
            return unsafe { (rt.real_getenv)(name) };
        }

        let current_ptr = unsafe { (rt.real_getenv)(name) };
        let current = if current_ptr.is_null() {
            None
        } else {
            unsafe { CStr::from_ptr(current_ptr) }.to_str().ok()
        };

        match shield.decide(name_str, current) {
            Decision::Passthrough => current_ptr,
            Decision::Observe => {
                stderr_line(&format!("{name_str} accessed"));
                current_ptr
            }
            Decision::ReturnAndClear(value) => {
                scrub(name_str);
                stderr_line(&format!("{name_str} accessed and cleared"));
                drop(shield);
                handout_ptr(rt, name_str, &value)
            }
            Decision::ReturnCached(value) => {
                stderr_line(&format!("{name_str} skipped because already cleared"));
                drop(shield);
                handout_ptr(rt, name_str, &value)
            }
            Decision::ReturnNone => std::ptr::null_mut(),
        }
    }

    /// Interposed `getenv(3)`.
    #[no_mangle]
    pub extern "C" fn getenv(name: *const c_char) -> *mut c_char {
        intercept(runtime(), name)
    }

    /// Interposed `secure_getenv(3)`: keeps the documented "nothing under
    /// elevated privileges" contract on top of the one-shot behavior.
    #[no_mangle]
    pub extern "C" fn secure_getenv(name: *const c_char) -> *mut c_char {
        let elevated = unsafe {
            libc::geteuid() != libc::getuid() || libc::getegid() != libc::getgid()
        };
        if elevated {
            return std::ptr::null_mut();
        }
        intercept(runtime(), name)
    }
}
