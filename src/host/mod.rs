//! Loading and driving plugins.
//!
//! ```ignore
//! set_request_handler(|method: &str, request: &[u8]| match method {
//!     "upper" => Ok(request.to_ascii_uppercase()),
//!     _ => Err(ServiceError::unknown_method(method)),
//! });
//!
//! let config = HostConfig::default();
//! for plugin in unsafe { find_plugins("plugins", &config) } {
//!     plugin.start()?;
//!     let response = plugin.call("echo", b"abc")?;
//!     plugin.stop()?;
//! }
//! ```

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use std::{fmt, fs, ptr, thread};

use libloading::Library;
use libc::c_char;

mod config;
mod router;

pub use config::{CallConcurrency, HostConfig};
pub use router::{clear_request_handler, set_request_handler, RequestHandler};

use crate::abi::{
    ApiVersionFn, CallFn, NameFn, StartFn, StopFn, API_VERSION_SYMBOL, CALL_SYMBOL, NAME_SYMBOL,
    START_SYMBOL, STOP_SYMBOL,
};
use crate::buffer::{self, OwnedBuffer};
use crate::reentry::Entered;
use crate::{envelope, ApiVersion, Error, Result};

/// The five functions a plugin exports.
#[derive(Debug, Clone, Copy)]
pub struct PluginSymbols {
    /// `name`
    pub name: NameFn,
    /// `api_version`
    pub api_version: ApiVersionFn,
    /// `start`
    pub start: StartFn,
    /// `stop`
    pub stop: StopFn,
    /// `call`
    pub call: CallFn,
}

impl PluginSymbols {
    /// Look up the exports in a loaded library.
    ///
    /// # Errors
    ///
    /// [`Error::MissingSymbol`] naming the first export that could not be found.
    ///
    /// # Safety
    ///
    /// The exports must have the signatures in [`crate::abi`]. The returned pointers are only
    /// valid while `library` stays loaded.
    pub unsafe fn resolve(library: &Library) -> Result<Self> {
        Ok(Self {
            name: symbol(library, NAME_SYMBOL)?,
            api_version: symbol(library, API_VERSION_SYMBOL)?,
            start: symbol(library, START_SYMBOL)?,
            stop: symbol(library, STOP_SYMBOL)?,
            call: symbol(library, CALL_SYMBOL)?,
        })
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &'static str) -> Result<T> {
    library
        .get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|source| Error::MissingSymbol {
            symbol: name,
            source,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Loaded,
    Running,
    Stopped,
}

impl State {
    fn as_str(self) -> &'static str {
        match self {
            State::Loaded => "loaded",
            State::Running => "running",
            State::Stopped => "stopped",
        }
    }
}

struct PluginInner {
    name: String,
    version: ApiVersion,
    symbols: PluginSymbols,
    config: HostConfig,
    state: RwLock<State>,
    serial: Mutex<()>,
    // Declared last so it is unloaded after everything else is dropped.
    _library: Option<Library>,
}

impl Drop for PluginInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if *state == State::Running {
            log::debug!("stopping plugin `{}` before unloading it", self.name);
            unsafe { (self.symbols.stop)() };
            *state = State::Stopped;
        }
    }
}

/// A loaded plugin. Cloning gives another handle to the same plugin.
///
/// Dropping the last handle of a running plugin stops it before the library is unloaded.
#[derive(Clone)]
pub struct Plugin {
    inner: Arc<PluginInner>,
}

impl Plugin {
    /// Load the plugin library at `path` and negotiate with it.
    ///
    /// # Errors
    ///
    /// [`Error::DynamicLibrary`] if the library cannot be opened, [`Error::MissingSymbol`] if it
    /// lacks an export, and the errors of [`Plugin::from_symbols`].
    ///
    /// # Safety
    ///
    /// Loading a library runs its initialisers, and its exports must follow [`crate::abi`].
    pub unsafe fn load<P>(path: P, config: &HostConfig) -> Result<Self>
    where
        P: AsRef<OsStr>,
    {
        let library = Library::new(path)?;
        let symbols = PluginSymbols::resolve(&library)?;
        Self::negotiate(symbols, Some(library), config)
    }

    /// Negotiate with a plugin whose exports are already linked into the process.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`] or [`Error::UnstableName`] if the plugin does not report a usable
    /// name, [`Error::IncompatibleVersion`] if the host cannot run it.
    ///
    /// # Safety
    ///
    /// The functions must follow [`crate::abi`].
    pub unsafe fn from_symbols(symbols: PluginSymbols, config: &HostConfig) -> Result<Self> {
        Self::negotiate(symbols, None, config)
    }

    unsafe fn negotiate(
        symbols: PluginSymbols,
        library: Option<Library>,
        config: &HostConfig,
    ) -> Result<Self> {
        let name = read_name(symbols.name)?;
        let again = read_name(symbols.name)?;
        if name != again {
            return Err(Error::UnstableName {
                first: name,
                second: again,
            });
        }

        let version = ApiVersion::from_raw((symbols.api_version)());
        if !config.api_version.accepts(version) {
            return Err(Error::IncompatibleVersion {
                plugin: version,
                host: config.api_version,
            });
        }

        log::info!("Loaded plugin `{}` (API version {})", name, version);

        Ok(Self {
            inner: Arc::new(PluginInner {
                name,
                version,
                symbols,
                config: config.clone(),
                state: RwLock::new(State::Loaded),
                serial: Mutex::new(()),
                _library: library,
            }),
        })
    }

    /// The name of the service the plugin exposes.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The API version the plugin declared.
    #[must_use]
    pub fn api_version(&self) -> ApiVersion {
        self.inner.version
    }

    /// Whether the plugin has been started and not yet stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.inner.state.read().unwrap_or_else(PoisonError::into_inner) == State::Running
    }

    /// Start the plugin, handing it the host callback.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the plugin was just loaded, [`Error::Reentrant`] from
    /// inside a call to this plugin. The plugin itself has no way to report a failed start;
    /// check its logs.
    pub fn start(&self) -> Result<()> {
        let _entered = self.enter("start")?;
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        self.require_state(*state, State::Loaded)?;
        unsafe { (self.inner.symbols.start)(Some(router::request)) };
        *state = State::Running;
        log::debug!("started plugin `{}`", self.inner.name);
        Ok(())
    }

    /// Stop the plugin once the calls in flight have returned.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the plugin is running, [`Error::Reentrant`] from inside a
    /// call to this plugin.
    pub fn stop(&self) -> Result<()> {
        let _entered = self.enter("stop")?;
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        self.require_state(*state, State::Running)?;
        unsafe { (self.inner.symbols.stop)() };
        *state = State::Stopped;
        log::debug!("stopped plugin `{}`", self.inner.name);
        Ok(())
    }

    /// Call a method of the plugin's service. Uses the configured call timeout, if any.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the plugin is running, [`Error::Service`] if the plugin
    /// answered with an error, [`Error::EmptyResponse`] or [`Error::MalformedResponse`] if the
    /// answer could not be read, and [`Error::Timeout`] if the call took too long.
    ///
    /// A request handler answering this plugin must not call it again on the same thread: that
    /// fails with [`Error::Reentrant`] instead of waiting for the outer call.
    pub fn call(&self, method: &str, request: &[u8]) -> Result<Vec<u8>> {
        match self.inner.config.call_timeout {
            Some(timeout) => self.call_timeout(method, request, timeout),
            None => self.invoke(method, request),
        }
    }

    /// Call a method on a worker thread and give up waiting after `timeout`. An abandoned call
    /// keeps running, and [`Plugin::stop`] waits for it.
    ///
    /// # Errors
    ///
    /// As [`Plugin::call`], plus [`Error::Io`] if no worker could be spawned and
    /// [`Error::WorkerLost`] if the worker died.
    pub fn call_timeout(&self, method: &str, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        if Entered::is_active(&*self.inner) {
            return Err(self.reentrant(method));
        }
        let (tx, rx) = mpsc::channel();
        let plugin = self.clone();
        let worker_method = method.to_string();
        let request = request.to_vec();
        thread::Builder::new()
            .name(format!("plugin-call-{}", self.inner.name))
            .spawn(move || {
                let _ = tx.send(plugin.invoke(&worker_method, &request));
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "call to `{}` of plugin `{}` timed out after {:?}",
                    method,
                    self.inner.name,
                    timeout
                );
                Err(Error::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::WorkerLost(method.to_string())),
        }
    }

    fn invoke(&self, method: &str, request: &[u8]) -> Result<Vec<u8>> {
        let _entered = self.enter(method)?;
        let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
        self.require_state(*state, State::Running)?;
        let _serial = match self.inner.config.concurrency {
            CallConcurrency::Serialized => {
                Some(self.inner.serial.lock().unwrap_or_else(PoisonError::into_inner))
            }
            CallConcurrency::Concurrent => None,
        };

        let mut response = ptr::null_mut();
        let len = unsafe {
            (self.inner.symbols.call)(
                method.as_ptr().cast::<c_char>(),
                method.len(),
                request.as_ptr(),
                request.len(),
                &mut response,
            )
        };

        let response = unsafe { OwnedBuffer::from_raw(response, len) };
        let Some(response) = response else {
            return Err(Error::EmptyResponse);
        };
        envelope::decode(&response).map(<[u8]>::to_vec)
    }

    fn enter(&self, operation: &str) -> Result<Entered> {
        Entered::enter(&*self.inner).ok_or_else(|| self.reentrant(operation))
    }

    fn reentrant(&self, operation: &str) -> Error {
        log::warn!(
            "refusing re-entrant `{}` on plugin `{}`",
            operation,
            self.inner.name
        );
        Error::Reentrant {
            plugin: self.inner.name.clone(),
            operation: operation.to_string(),
        }
    }

    fn require_state(&self, actual: State, expected: State) -> Result<()> {
        if actual == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                plugin: self.inner.name.clone(),
                expected: expected.as_str(),
                actual: actual.as_str(),
            })
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

unsafe fn read_name(name_fn: NameFn) -> Result<String> {
    let mut name = ptr::null();
    let len = name_fn(&mut name);
    let bytes = buffer::borrow(name, len)?;
    if bytes.is_empty() {
        return Err(Error::InvalidName("the name is empty".to_string()));
    }
    String::from_utf8(bytes.to_vec()).map_err(|err| Error::InvalidName(err.to_string()))
}

/// Load every plugin library in `dir`.
///
/// Files without the platform's library extension are ignored. Libraries that fail to load
/// are logged and skipped, as is a second plugin exposing an already loaded service.
///
/// # Safety
///
/// See [`Plugin::load`]; this loads every library in the directory.
pub unsafe fn find_plugins<P>(dir: P, config: &HostConfig) -> Vec<Plugin>
where
    P: AsRef<Path>,
{
    let mut plugins = Vec::new();
    let entries = match fs::read_dir(dir.as_ref()) {
        Ok(entries) => entries,
        Err(err) => {
            log::error!(
                "Failed to read plugins directory `{}`: {}",
                dir.as_ref().display(),
                err
            );
            return plugins;
        }
    };

    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(err) => log::warn!("Error reading plugin directory entry: {}", err),
        }
    }
    paths.sort();

    let mut names = HashSet::new();
    for path in paths {
        if !path.is_file() || path.extension() != Some(std::env::consts::DLL_EXTENSION.as_ref()) {
            continue;
        }

        match Plugin::load(&path, config) {
            Ok(plugin) => {
                if names.insert(plugin.name().to_string()) {
                    plugins.push(plugin);
                } else {
                    log::warn!(
                        "Skipping plugin `{}`: service `{}` is already loaded",
                        path.display(),
                        plugin.name()
                    );
                }
            }
            Err(err) => {
                log::warn!("Error loading plugin `{}`: {}", path.display(), err);
            }
        }
    }

    plugins
}
