use crate::config::HubConfig;
use crate::error::HubError;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

/// Resolves `Authorization: Bearer <token>` to a user name.
pub fn bearer_user(headers: &HeaderMap, config: &HubConfig) -> Result<String, HubError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| HubError::Unauthorized("Missing token".to_string()))?;
    let token = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| HubError::Unauthorized("Malformed authorization header".to_string()))?;
    config
        .user_for_token(token)
        .map(str::to_string)
        .ok_or_else(|| HubError::Unauthorized("Invalid token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> HubConfig {
        let mut config = HubConfig::default();
        config.authorized.insert("t0ken".to_string(), "amy".to_string());
        config
    }

    #[test]
    fn known_token_resolves_to_its_user() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t0ken"));
        assert_eq!(bearer_user(&headers, &config()).expect("user"), "amy");
    }

    #[test]
    fn missing_malformed_or_unknown_tokens_are_rejected() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            bearer_user(&headers, &config()),
            Err(HubError::Unauthorized(message)) if message == "Missing token"
        ));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_user(&headers, &config()).is_err());
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(matches!(
            bearer_user(&headers, &config()),
            Err(HubError::Unauthorized(message)) if message == "Invalid token"
        ));
    }
}
