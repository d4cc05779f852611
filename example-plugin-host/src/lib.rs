use rpc_plugin::ServiceError;

/// Requests the demo host answers for its plugins.
///
/// - `upper` answers with the request upper-cased (ASCII).
/// - `reverse` answers with the request bytes reversed.
pub fn host_services(method: &str, request: &[u8]) -> Result<Vec<u8>, ServiceError> {
    match method {
        "upper" => Ok(request.to_ascii_uppercase()),
        "reverse" => Ok(request.iter().rev().copied().collect()),
        _ => Err(ServiceError::unknown_method(method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_host_methods() {
        assert_eq!(host_services("upper", b"abc").unwrap(), b"ABC");
        assert_eq!(host_services("reverse", b"abc").unwrap(), b"cba");
        assert!(host_services("other", b"").is_err());
    }
}
