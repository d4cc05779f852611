//! Reference plugin exposing `example.echo.v0.EchoService`.
//!
//! - `echo` asks the host to `upper` the request and answers with the host's response.
//! - `reflect` answers with the request unchanged.
//! - `length` answers with the request length as a little-endian `u64`.

use rpc_plugin::client::{HostHandle, Service};
use rpc_plugin::{plugin_service, ServiceError};

pub struct EchoService {
    host: HostHandle,
}

impl Service for EchoService {
    fn start(host: HostHandle) -> Result<Self, ServiceError> {
        // The library has its own logger, separate from the host's.
        let _ = env_logger::try_init();
        log::debug!("echo service starting");
        Ok(Self { host })
    }

    fn call(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ServiceError> {
        match method {
            "echo" => Ok(self.host.request("upper", request)?),
            "reflect" => Ok(request.to_vec()),
            "length" => Ok((request.len() as u64).to_le_bytes().to_vec()),
            _ => Err(ServiceError::unknown_method(method)),
        }
    }

    fn stop(self) {
        log::debug!("echo service stopping");
    }
}

plugin_service! {
    name: "example.echo.v0.EchoService",
    service: EchoService,
}
