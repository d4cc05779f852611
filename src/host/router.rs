//! Requests plugins make into the host.
//!
//! `RequestFn` carries no context pointer, so every plugin in the process shares one
//! trampoline and one installed [`RequestHandler`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use libc::c_char;

use crate::buffer::read_call;
use crate::envelope::{self, ErrorKind, ServiceError};
use crate::panic_message;

/// Answers requests plugins send through their host callback.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request from a plugin.
    ///
    /// Runs on the thread that is inside the plugin's `start` or `call`. Calling, starting or
    /// stopping that same plugin from here fails with [`Error::Reentrant`](crate::Error::Reentrant).
    /// Do it from another thread if it has to happen.
    ///
    /// # Errors
    ///
    /// The error is sent back to the plugin inside the response.
    fn handle(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ServiceError>;
}

impl<F> RequestHandler for F
where
    F: Fn(&str, &[u8]) -> Result<Vec<u8>, ServiceError> + Send + Sync + 'static,
{
    fn handle(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ServiceError> {
        self(method, request)
    }
}

static HANDLER: RwLock<Option<Arc<dyn RequestHandler>>> = RwLock::new(None);

/// Install the handler answering plugin requests, replacing any previous one.
pub fn set_request_handler(handler: impl RequestHandler) {
    *HANDLER.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
}

/// Remove the installed handler. Plugin requests are answered `Unavailable` afterwards.
pub fn clear_request_handler() {
    *HANDLER.write().unwrap_or_else(PoisonError::into_inner) = None;
}

fn dispatch(method: &str, request: &[u8]) -> Result<Vec<u8>, ServiceError> {
    let handler = HANDLER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let Some(handler) = handler else {
        log::warn!("plugin requested `{method}` but no request handler is installed");
        return Err(ServiceError::new(
            ErrorKind::Unavailable,
            "the host does not accept requests",
        ));
    };

    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(method, request))).unwrap_or_else(
        |payload| {
            let message = panic_message(payload.as_ref());
            log::error!("handling plugin request `{method}` panicked: {message}");
            Err(ServiceError::internal(format!("`{method}` panicked: {message}")))
        },
    )
}

/// The callback handed to every plugin's `start`.
pub(crate) unsafe extern "C" fn request(
    method_ptr: *const c_char,
    method_len: usize,
    request_ptr: *const u8,
    request_len: usize,
    response_ptr: *mut *mut u8,
) -> usize {
    if response_ptr.is_null() {
        log::error!("plugin request with a null response pointer");
        return 0;
    }

    let result = read_call(method_ptr.cast(), method_len, request_ptr, request_len)
        .and_then(|(method, request)| dispatch(method, request));
    envelope::encode_owned(&result).into_raw(response_ptr)
}
