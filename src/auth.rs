use crate::config::AUTH_DISABLED_SENTINEL;
use crate::error::GatewayError;
use axum::http::HeaderMap;

/// Shared bearer-key check. An unset key, or the legacy value `"1"`, turns
/// enforcement off.
#[derive(Clone, Debug)]
pub struct AuthState {
    master_key: Option<String>,
}

impl AuthState {
    pub fn new(master_key: Option<String>) -> Self {
        let master_key = master_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty() && key != AUTH_DISABLED_SENTINEL);
        Self { master_key }
    }

    pub fn enabled(&self) -> bool {
        self.master_key.is_some()
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        let Some(expected) = self.master_key.as_deref() else {
            return Ok(());
        };
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(GatewayError::Unauthorized)?;
        if token == expected {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::http::header::AUTHORIZATION;

    fn headers(auth: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(value) = auth {
            map.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn sentinel_and_unset_disable_enforcement() {
        for key in [None, Some("1".to_string()), Some("  ".to_string())] {
            let auth = AuthState::new(key);
            assert!(!auth.enabled());
            assert!(auth.authorize(&headers(None)).is_ok());
            assert!(auth.authorize(&headers(Some("Bearer anything"))).is_ok());
        }
    }

    #[test]
    fn configured_key_is_enforced() {
        let auth = AuthState::new(Some("sk-master".to_string()));
        assert!(auth.enabled());
        assert!(auth.authorize(&headers(Some("Bearer sk-master"))).is_ok());
        assert!(matches!(
            auth.authorize(&headers(Some("Bearer wrong"))),
            Err(GatewayError::Unauthorized)
        ));
        assert!(auth.authorize(&headers(Some("sk-master"))).is_err());
        assert!(auth.authorize(&headers(None)).is_err());
    }
}
