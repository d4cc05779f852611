use std::env;

use example_plugin_host::host_services;
use rpc_plugin::host::{find_plugins, set_request_handler, HostConfig};
use rpc_plugin::{Result, API_VERSION_STR};

fn main() -> Result<()> {
    env_logger::init();

    let dir = env::args()
        .nth(1)
        .or_else(|| env::var("RPC_PLUGIN_DIR").ok())
        .unwrap_or_else(|| "plugins".to_string());

    log::info!("host implements plugin API {API_VERSION_STR}");
    set_request_handler(host_services);

    let config = HostConfig::default();
    let plugins = unsafe { find_plugins(&dir, &config) };
    if plugins.is_empty() {
        log::warn!("no plugins found in `{dir}`");
    }

    for plugin in &plugins {
        plugin.start()?;
    }

    for plugin in &plugins {
        match plugin.call("echo", b"Hello from the host") {
            Ok(response) => println!(
                "{} answered: {}",
                plugin.name(),
                String::from_utf8_lossy(&response)
            ),
            Err(err) => log::error!("calling `{}` failed: {}", plugin.name(), err),
        }
    }

    for plugin in &plugins {
        plugin.stop()?;
    }

    Ok(())
}
