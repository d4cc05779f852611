//! The raw plugin ABI.
//!
//! A plugin library exports five functions with C linkage. Expressed as a C header:
//!
//! ```c
//! typedef uintptr_t (*RequestFn)(const char *method_ptr, uintptr_t method_len,
//!                                const uint8_t *request_ptr, uintptr_t request_len,
//!                                uint8_t **response_ptr);
//!
//! uintptr_t name(const uint8_t **name);
//! int32_t   api_version(void);
//! void      start(RequestFn request_fn);
//! void      stop(void);
//! uintptr_t call(const char *method_ptr, uintptr_t method_len,
//!                const uint8_t *request_ptr, uintptr_t request_len,
//!                uint8_t **response_ptr);
//! ```
//!
//! The host calls `name`, `api_version`, then `start` exactly once, then any number of `call`s,
//! then `stop` exactly once before unloading. The plugin may invoke the `RequestFn` it was
//! given between `start` returning and `stop` being called.
//!
//! ## Ownership
//!
//! - The name is owned by the plugin and stays valid for as long as the library is loaded.
//! - Method and request buffers are owned by the caller and only valid during the call.
//! - Response buffers are allocated by the callee with the C allocator (`malloc`) and handed
//!   over to the caller, which must release them with `free`. See [`crate::buffer`].
//! - Every response is a [`crate::envelope`]; a zero-length response is an error.

use libc::c_char;

/// Callback the host passes to `start` so the plugin can make requests into the host.
pub type RequestFn = unsafe extern "C" fn(
    method_ptr: *const c_char,
    method_len: usize,
    request_ptr: *const u8,
    request_len: usize,
    response_ptr: *mut *mut u8,
) -> usize;

/// Signature of the `name` export.
pub type NameFn = unsafe extern "C" fn(name: *mut *const u8) -> usize;

/// Signature of the `api_version` export.
pub type ApiVersionFn = unsafe extern "C" fn() -> i32;

/// Signature of the `start` export. The callback is nullable on the C side.
pub type StartFn = unsafe extern "C" fn(request_fn: Option<RequestFn>);

/// Signature of the `stop` export.
pub type StopFn = unsafe extern "C" fn();

/// Signature of the `call` export. It has the same shape as [`RequestFn`].
pub type CallFn = RequestFn;

/// Symbol name of the `name` export.
pub const NAME_SYMBOL: &str = "name";
/// Symbol name of the `api_version` export.
pub const API_VERSION_SYMBOL: &str = "api_version";
/// Symbol name of the `start` export.
pub const START_SYMBOL: &str = "start";
/// Symbol name of the `stop` export.
pub const STOP_SYMBOL: &str = "stop";
/// Symbol name of the `call` export.
pub const CALL_SYMBOL: &str = "call";
