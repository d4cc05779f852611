use proc_macro::TokenStream;
#[cfg(feature = "client")]
use proc_macro2::TokenStream as TokenStream2;

#[cfg(feature = "client")]
mod service;

/// Export a type implementing `rpc_plugin::client::Service` as the plugin's service.
///
/// This generates the five functions every plugin exports (`name`, `api_version`, `start`,
/// `stop` and `call`), so the crate must not define items with those names at its root. Build
/// the crate as a `cdylib`.
///
/// `api_version` defaults to the version of `rpc-plugin` the plugin is built against. Declaring
/// an older minor version lets older hosts load the plugin.
///
/// ## Example
///
/// ```ignore
/// plugin_service! {
///     name: "example.echo.v0.EchoService",
///     service: EchoService,
///     api_version: (1, 0),
/// }
/// ```
#[proc_macro]
#[proc_macro_error2::proc_macro_error]
#[cfg(feature = "client")]
pub fn plugin_service(tokens: TokenStream) -> TokenStream {
    use syn::parse_macro_input;

    let definition = parse_macro_input!(tokens as service::ServiceDefinition);
    expand(&definition).into()
}

#[cfg(feature = "client")]
fn expand(definition: &service::ServiceDefinition) -> TokenStream2 {
    use proc_macro_error2::abort;
    use quote::quote;

    let name = &definition.name;
    let service = &definition.service;

    if name.value().is_empty() {
        abort!(name, "the service name must not be empty");
    }

    let version: TokenStream2 = match &definition.api_version {
        Some((major, minor)) => {
            for part in [major, minor] {
                if part.base10_parse::<u16>().is_err() {
                    abort!(part, "API version parts must fit in 16 bits");
                }
            }
            quote! { ::rpc_plugin::ApiVersion::new(#major, #minor) }
        }
        None => quote! { ::rpc_plugin::API_VERSION },
    };

    quote! {
        static __RPC_PLUGIN_RUNTIME: ::rpc_plugin::client::Runtime<#service> =
            ::rpc_plugin::client::Runtime::new(#name, #version);

        ::rpc_plugin::static_assert!(
            ::rpc_plugin::API_VERSION.accepts(#version),
            "the declared API version is newer than the one rpc-plugin implements"
        );

        /// Get the name of the service the plugin exposes. A pointer to the name is written into
        /// `name`. The caller must not deallocate the name. The length of the name is returned.
        #[no_mangle]
        pub unsafe extern "C" fn name(name: *mut *const u8) -> usize {
            __RPC_PLUGIN_RUNTIME.export_name(name)
        }

        /// The API version the plugin is compatible with. The most significant 16 bits are the
        /// major version number, the least significant 16 bits the minor version number.
        #[no_mangle]
        pub extern "C" fn api_version() -> i32 {
            __RPC_PLUGIN_RUNTIME.export_api_version()
        }

        #[no_mangle]
        pub extern "C" fn start(request_fn: ::core::option::Option<::rpc_plugin::RequestFn>) {
            __RPC_PLUGIN_RUNTIME.start(request_fn)
        }

        #[no_mangle]
        pub extern "C" fn stop() {
            __RPC_PLUGIN_RUNTIME.stop()
        }

        #[no_mangle]
        pub unsafe extern "C" fn call(
            method_ptr: *const ::rpc_plugin::libc::c_char,
            method_len: usize,
            request_ptr: *const u8,
            request_len: usize,
            response_ptr: *mut *mut u8,
        ) -> usize {
            __RPC_PLUGIN_RUNTIME.export_call(
                method_ptr,
                method_len,
                request_ptr,
                request_len,
                response_ptr,
            )
        }

        const _: () = {
            let _: ::rpc_plugin::abi::NameFn = name;
            let _: ::rpc_plugin::abi::ApiVersionFn = api_version;
            let _: ::rpc_plugin::abi::StartFn = start;
            let _: ::rpc_plugin::abi::StopFn = stop;
            let _: ::rpc_plugin::abi::CallFn = call;
        };
    }
}
