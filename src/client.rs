//! Writing plugins.
//!
//! Implement [`Service`] for a type and hand it to [`plugin_service!`](crate::plugin_service),
//! which exports the five ABI functions and routes them through a static [`Runtime`].
//!
//! ```ignore
//! struct Greeter { host: HostHandle }
//!
//! impl Service for Greeter {
//!     fn start(host: HostHandle) -> Result<Self, ServiceError> {
//!         Ok(Self { host })
//!     }
//!
//!     fn call(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ServiceError> {
//!         match method {
//!             "greet" => Ok(self.host.request("upper", request)?),
//!             _ => Err(ServiceError::unknown_method(method)),
//!         }
//!     }
//! }
//!
//! plugin_service! {
//!     name: "example.greeter.v0.GreeterService",
//!     service: Greeter,
//! }
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, PoisonError, RwLock};

use libc::c_char;

use crate::abi::RequestFn;
use crate::buffer::{read_call, OwnedBuffer};
use crate::envelope::{self, ErrorKind, ServiceError};
use crate::reentry::Entered;
use crate::{panic_message, ApiVersion, Error, Result};

/// A service exposed by a plugin.
pub trait Service: Send + Sync + Sized + 'static {
    /// Called once when the host starts the plugin. The handle can be kept to make requests
    /// into the host until the plugin is stopped.
    ///
    /// # Errors
    ///
    /// An error leaves the plugin stopped. It is logged, as the host has no way to see it.
    fn start(host: HostHandle) -> std::result::Result<Self, ServiceError>;

    /// Handle one request. Errors are sent back to the host inside the response.
    ///
    /// # Errors
    ///
    /// Whatever the operation fails with, [`ServiceError::unknown_method`] for methods the
    /// service does not implement.
    fn call(&self, method: &str, request: &[u8]) -> std::result::Result<Vec<u8>, ServiceError>;

    /// Release whatever `start` acquired. The host handle is revoked once this returns.
    fn stop(self) {}
}

struct HostCallback {
    request_fn: RequestFn,
    live: RwLock<bool>,
}

/// The callback a host passed to `start`.
///
/// Cloning is cheap. All clones stop working together when the plugin is stopped.
#[derive(Clone)]
pub struct HostHandle {
    inner: Arc<HostCallback>,
}

impl HostHandle {
    /// Wrap a host callback.
    #[must_use]
    pub fn new(request_fn: RequestFn) -> Self {
        Self {
            inner: Arc::new(HostCallback {
                request_fn,
                live: RwLock::new(true),
            }),
        }
    }

    /// Send a request to the host and return the raw response envelope.
    ///
    /// # Errors
    ///
    /// [`Error::Revoked`] once the plugin has been stopped, [`Error::EmptyResponse`] if the host
    /// did not answer.
    pub fn request_raw(&self, method: &str, request: &[u8]) -> Result<OwnedBuffer> {
        let live = self.inner.live.read().unwrap_or_else(PoisonError::into_inner);
        if !*live {
            return Err(Error::Revoked);
        }

        let mut response = ptr::null_mut();
        let len = unsafe {
            (self.inner.request_fn)(
                method.as_ptr().cast::<c_char>(),
                method.len(),
                request.as_ptr(),
                request.len(),
                &mut response,
            )
        };
        drop(live);

        let response = unsafe { OwnedBuffer::from_raw(response, len) };
        match response {
            Some(buffer) if !buffer.is_empty() => Ok(buffer),
            _ => Err(Error::EmptyResponse),
        }
    }

    /// Send a request to the host and return the payload of its answer.
    ///
    /// # Errors
    ///
    /// As [`HostHandle::request_raw`], plus [`Error::Service`] when the host answered with an
    /// error and [`Error::MalformedResponse`] when the answer could not be read.
    pub fn request(&self, method: &str, request: &[u8]) -> Result<Vec<u8>> {
        let response = self.request_raw(method, request)?;
        envelope::decode(&response).map(<[u8]>::to_vec)
    }

    /// Whether the handle can still reach the host.
    #[must_use]
    pub fn is_live(&self) -> bool {
        *self.inner.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for requests in flight, then turns every clone of this handle off.
    fn revoke(&self) {
        *self.inner.live.write().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

struct Session<S> {
    service: S,
    host: HostHandle,
}

/// Lifecycle and dispatch for one plugin service. `plugin_service!` keeps one of these in a
/// static and forwards the exported functions to it.
pub struct Runtime<S> {
    name: &'static str,
    version: ApiVersion,
    session: RwLock<Option<Session<S>>>,
}

impl<S: Service> Runtime<S> {
    /// Create a stopped runtime for a service called `name`.
    #[must_use]
    pub const fn new(name: &'static str, version: ApiVersion) -> Self {
        Self {
            name,
            version,
            session: RwLock::new(None),
        }
    }

    /// The service name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Backs the `name` export.
    ///
    /// # Safety
    ///
    /// `out` must be null or valid for a pointer-sized write.
    pub unsafe fn export_name(&self, out: *mut *const u8) -> usize {
        if out.is_null() {
            log::error!("`name` of plugin `{}` called with a null pointer", self.name);
            return 0;
        }
        out.write(self.name.as_ptr());
        self.name.len()
    }

    /// Backs the `api_version` export.
    #[must_use]
    pub fn export_api_version(&self) -> i32 {
        self.version.to_raw()
    }

    /// Whether the service is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Backs the `start` export.
    pub fn start(&self, request_fn: Option<RequestFn>) {
        let Some(request_fn) = request_fn else {
            log::error!("plugin `{}` was started without a host callback", self.name);
            return;
        };
        let Some(_entered) = Entered::enter(self) else {
            log::error!("plugin `{}` was started from inside one of its own calls", self.name);
            return;
        };

        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() {
            log::warn!("plugin `{}` is already started", self.name);
            return;
        }

        let host = HostHandle::new(request_fn);
        match panic::catch_unwind(AssertUnwindSafe(|| S::start(host.clone()))) {
            Ok(Ok(service)) => {
                *session = Some(Session { service, host });
                log::info!("started plugin `{}` (API version {})", self.name, self.version);
            }
            Ok(Err(err)) => {
                host.revoke();
                log::error!("starting plugin `{}` failed: {}", self.name, err);
            }
            Err(payload) => {
                host.revoke();
                log::error!(
                    "starting plugin `{}` panicked: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Backs the `stop` export.
    pub fn stop(&self) {
        let Some(_entered) = Entered::enter(self) else {
            log::error!("plugin `{}` was stopped from inside one of its own calls", self.name);
            return;
        };
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Session { service, host }) = session else {
            log::warn!("plugin `{}` is not started", self.name);
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| service.stop())) {
            log::error!(
                "stopping plugin `{}` panicked: {}",
                self.name,
                panic_message(payload.as_ref())
            );
        }
        host.revoke();
        log::info!("stopped plugin `{}`", self.name);
    }

    /// Run a request against the service.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NotStarted`] outside of `start`/`stop`, [`ErrorKind::Internal`] if the
    /// service panicked, [`ErrorKind::Unavailable`] if the host calls back into this service
    /// on a thread that is already running one of its calls, and whatever the service returns.
    pub fn dispatch(
        &self,
        method: &str,
        request: &[u8],
    ) -> std::result::Result<Vec<u8>, ServiceError> {
        let Some(_entered) = Entered::enter(self) else {
            log::warn!("refusing re-entrant `{}` on plugin `{}`", method, self.name);
            return Err(ServiceError::new(
                ErrorKind::Unavailable,
                format!("plugin `{}` is already busy on this thread", self.name),
            ));
        };
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = session.as_ref() else {
            return Err(ServiceError::new(
                ErrorKind::NotStarted,
                format!("plugin `{}` is not started", self.name),
            ));
        };

        panic::catch_unwind(AssertUnwindSafe(|| session.service.call(method, request)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                log::error!("`{}` of plugin `{}` panicked: {}", method, self.name, message);
                Err(ServiceError::internal(format!("`{method}` panicked: {message}")))
            })
    }

    /// Backs the `call` export.
    ///
    /// # Safety
    ///
    /// The method and request pointers must be valid for their lengths (or null with a zero
    /// length) and `response_ptr` must be null or valid for a pointer-sized write.
    pub unsafe fn export_call(
        &self,
        method_ptr: *const c_char,
        method_len: usize,
        request_ptr: *const u8,
        request_len: usize,
        response_ptr: *mut *mut u8,
    ) -> usize {
        if response_ptr.is_null() {
            log::error!("`call` of plugin `{}` got a null response pointer", self.name);
            return 0;
        }

        let result = read_call(method_ptr.cast(), method_len, request_ptr, request_len)
            .and_then(|(method, request)| self.dispatch(method, request));
        envelope::encode_owned(&result).into_raw(response_ptr)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::buffer::tracking;

    static UPPER_CALLS: AtomicUsize = AtomicUsize::new(0);
    static LAST_REQUEST: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    /// Stand-in host answering `upper` with the ASCII upper-cased request.
    unsafe extern "C" fn fake_host(
        method_ptr: *const c_char,
        method_len: usize,
        request_ptr: *const u8,
        request_len: usize,
        response_ptr: *mut *mut u8,
    ) -> usize {
        let result = read_call(method_ptr.cast(), method_len, request_ptr, request_len).and_then(
            |(method, request)| match method {
                "upper" => {
                    UPPER_CALLS.fetch_add(1, Ordering::SeqCst);
                    *LAST_REQUEST.lock().unwrap() = request.to_vec();
                    Ok(request.to_ascii_uppercase())
                }
                _ => Err(ServiceError::unknown_method(method)),
            },
        );
        envelope::encode_owned(&result).into_raw(response_ptr)
    }

    struct Shouter {
        host: HostHandle,
    }

    impl Service for Shouter {
        fn start(host: HostHandle) -> std::result::Result<Self, ServiceError> {
            Ok(Self { host })
        }

        fn call(&self, method: &str, request: &[u8]) -> std::result::Result<Vec<u8>, ServiceError> {
            match method {
                "shout" => Ok(self.host.request("upper", request)?),
                "explode" => panic!("boom"),
                "" => Ok(b"empty method".to_vec()),
                _ => Err(ServiceError::unknown_method(method)),
            }
        }
    }

    static HOST_WAITING: AtomicUsize = AtomicUsize::new(0);
    static NAPPING: AtomicUsize = AtomicUsize::new(0);
    static NAPPING_AT_STOP: AtomicUsize = AtomicUsize::new(usize::MAX);
    static ARRIVED: AtomicUsize = AtomicUsize::new(0);
    static BOUNCER: Runtime<Waiter> = Runtime::new("test.Bouncer", ApiVersion::new(1, 0));

    /// Stand-in host that is slow to answer `wait` and sends `again` straight back into
    /// [`BOUNCER`].
    unsafe extern "C" fn slow_host(
        method_ptr: *const c_char,
        method_len: usize,
        request_ptr: *const u8,
        request_len: usize,
        response_ptr: *mut *mut u8,
    ) -> usize {
        let result = read_call(method_ptr.cast(), method_len, request_ptr, request_len).and_then(
            |(method, request)| match method {
                "wait" => {
                    HOST_WAITING.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(200));
                    HOST_WAITING.fetch_sub(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }
                "again" => BOUNCER.dispatch("reflect", request),
                _ => Err(ServiceError::unknown_method(method)),
            },
        );
        envelope::encode_owned(&result).into_raw(response_ptr)
    }

    struct Waiter {
        host: HostHandle,
    }

    impl Service for Waiter {
        fn start(host: HostHandle) -> std::result::Result<Self, ServiceError> {
            Ok(Self { host })
        }

        fn call(&self, method: &str, request: &[u8]) -> std::result::Result<Vec<u8>, ServiceError> {
            match method {
                "reflect" => Ok(request.to_vec()),
                "nap" => {
                    NAPPING.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(200));
                    NAPPING.fetch_sub(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }
                // Waits for a second caller to arrive.
                "meet" => {
                    ARRIVED.fetch_add(1, Ordering::SeqCst);
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while ARRIVED.load(Ordering::SeqCst) < 2 {
                        if Instant::now() > deadline {
                            return Err(ServiceError::internal("nobody else arrived"));
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(Vec::new())
                }
                "again" => Ok(self.host.request("again", request)?),
                _ => Err(ServiceError::unknown_method(method)),
            }
        }

        fn stop(self) {
            NAPPING_AT_STOP.store(NAPPING.load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    struct Broken;

    impl Service for Broken {
        fn start(_host: HostHandle) -> std::result::Result<Self, ServiceError> {
            Err(ServiceError::internal("no resources"))
        }

        fn call(&self, _: &str, _: &[u8]) -> std::result::Result<Vec<u8>, ServiceError> {
            Ok(Vec::new())
        }
    }

    fn call(runtime: &Runtime<impl Service>, method: &[u8], request: &[u8]) -> Result<Vec<u8>> {
        let mut out = ptr::null_mut();
        let len = unsafe {
            runtime.export_call(
                method.as_ptr().cast(),
                method.len(),
                request.as_ptr(),
                request.len(),
                &mut out,
            )
        };
        let response = unsafe { OwnedBuffer::from_raw(out, len) }.ok_or(Error::EmptyResponse)?;
        envelope::decode(&response).map(<[u8]>::to_vec)
    }

    fn host_of<S: Service>(runtime: &Runtime<S>) -> HostHandle {
        runtime
            .session
            .read()
            .unwrap()
            .as_ref()
            .map(|s| s.host.clone())
            .unwrap()
    }

    fn kind_of(result: Result<Vec<u8>>) -> ErrorKind {
        match result {
            Err(Error::Service(err)) => err.kind,
            other => panic!("expected a service error, got {other:?}"),
        }
    }

    #[test]
    fn name_is_stable() {
        let runtime = Runtime::<Shouter>::new("test.Shouter", ApiVersion::new(1, 0));
        let (mut a, mut b) = (ptr::null(), ptr::null());
        let len_a = unsafe { runtime.export_name(&mut a) };
        let len_b = unsafe { runtime.export_name(&mut b) };
        assert_eq!(len_a, len_b);
        assert_eq!(a, b);
        assert_eq!(unsafe { std::slice::from_raw_parts(a, len_a) }, b"test.Shouter");
        assert_eq!(unsafe { runtime.export_name(ptr::null_mut()) }, 0);
    }

    #[test]
    fn calls_before_start_are_answered_not_started() {
        let runtime = Runtime::<Shouter>::new("test.Shouter", ApiVersion::new(1, 0));
        assert_eq!(kind_of(call(&runtime, b"shout", b"abc")), ErrorKind::NotStarted);
    }

    #[test]
    fn round_trips_through_the_host() {
        let before = tracking::outstanding();
        let runtime = Runtime::<Shouter>::new("test.Shouter", ApiVersion::new(1, 0));
        runtime.start(Some(fake_host));
        let calls = UPPER_CALLS.load(Ordering::SeqCst);

        assert_eq!(call(&runtime, b"shout", b"abc").unwrap(), b"ABC");
        assert_eq!(UPPER_CALLS.load(Ordering::SeqCst), calls + 1);
        assert_eq!(*LAST_REQUEST.lock().unwrap(), b"abc");

        runtime.stop();
        assert_eq!(tracking::outstanding(), before);
    }

    #[test]
    fn zero_length_inputs_are_valid() {
        let runtime = Runtime::<Shouter>::new("test.Shouter", ApiVersion::new(1, 0));
        runtime.start(Some(fake_host));
        assert_eq!(call(&runtime, b"", b"").unwrap(), b"empty method");
        let response = unsafe {
            let mut out = ptr::null_mut();
            let len = runtime.export_call(ptr::null(), 0, ptr::null(), 0, &mut out);
            OwnedBuffer::from_raw(out, len).unwrap()
        };
        assert_eq!(envelope::decode(&response).unwrap(), b"empty method");
        runtime.stop();
    }

    #[test]
    fn bad_inputs_become_error_responses() {
        let runtime = Runtime::<Shouter>::new("test.Shouter", ApiVersion::new(1, 0));
        runtime.start(Some(fake_host));
        assert_eq!(kind_of(call(&runtime, b"missing", b"")), ErrorKind::UnknownMethod);
        assert_eq!(kind_of(call(&runtime, &[0xff, 0xfe], b"")), ErrorKind::InvalidRequest);
        assert_eq!(kind_of(call(&runtime, b"explode", b"")), ErrorKind::Internal);
        assert_eq!(
            unsafe { runtime.export_call(ptr::null(), 0, ptr::null(), 0, ptr::null_mut()) },
            0
        );
        runtime.stop();
    }

    #[test]
    fn stop_revokes_the_host_handle() {
        let runtime = Runtime::<Shouter>::new("test.Shouter", ApiVersion::new(1, 0));
        runtime.start(Some(fake_host));
        let host = host_of(&runtime);
        assert!(host.is_live());

        runtime.stop();
        assert!(!runtime.is_running());
        assert!(!host.is_live());
        assert!(matches!(host.request("upper", b"late"), Err(Error::Revoked)));
        assert_eq!(kind_of(call(&runtime, b"shout", b"abc")), ErrorKind::NotStarted);
    }

    #[test]
    fn start_is_refused_without_callback_or_twice() {
        let runtime = Runtime::<Shouter>::new("test.Shouter", ApiVersion::new(1, 0));
        runtime.start(None);
        assert!(!runtime.is_running());

        runtime.start(Some(fake_host));
        runtime.start(Some(fake_host));
        assert!(runtime.is_running());
        runtime.stop();
        runtime.stop();
        assert!(!runtime.is_running());
    }

    #[test]
    fn failed_start_leaves_plugin_stopped() {
        let runtime = Runtime::<Broken>::new("test.Broken", ApiVersion::new(1, 0));
        runtime.start(Some(fake_host));
        assert!(!runtime.is_running());
        assert_eq!(kind_of(call(&runtime, b"any", b"")), ErrorKind::NotStarted);
    }

    #[test]
    fn calls_run_concurrently() {
        let runtime = Runtime::<Waiter>::new("test.Waiter", ApiVersion::new(1, 0));
        runtime.start(Some(slow_host));
        thread::scope(|s| {
            let calls: Vec<_> = (0..2).map(|_| s.spawn(|| runtime.dispatch("meet", b""))).collect();
            for call in calls {
                assert!(call.join().unwrap().is_ok());
            }
        });
        runtime.stop();
    }

    #[test]
    fn stop_waits_for_calls_in_flight() {
        let runtime = Runtime::<Waiter>::new("test.Waiter", ApiVersion::new(1, 0));
        runtime.start(Some(slow_host));
        thread::scope(|s| {
            let nap = s.spawn(|| runtime.dispatch("nap", b""));
            while NAPPING.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            runtime.stop();
            assert_eq!(NAPPING_AT_STOP.load(Ordering::SeqCst), 0);
            assert!(nap.join().unwrap().is_ok());
        });
    }

    #[test]
    fn stop_waits_for_host_requests_in_flight() {
        let runtime = Runtime::<Waiter>::new("test.Waiter", ApiVersion::new(1, 0));
        runtime.start(Some(slow_host));
        let host = host_of(&runtime);
        thread::scope(|s| {
            let request = s.spawn(|| host.request("wait", b""));
            while HOST_WAITING.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            runtime.stop();
            assert_eq!(HOST_WAITING.load(Ordering::SeqCst), 0);
            assert!(request.join().unwrap().is_ok());
        });
        assert!(matches!(host.request("wait", b""), Err(Error::Revoked)));
    }

    #[test]
    fn reentrant_dispatch_is_refused() {
        BOUNCER.start(Some(slow_host));
        assert_eq!(kind_of(call(&BOUNCER, b"again", b"x")), ErrorKind::Unavailable);
        assert_eq!(call(&BOUNCER, b"reflect", b"x").unwrap(), b"x");
        BOUNCER.stop();
        assert!(!BOUNCER.is_running());
    }
}
