use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;

use super::ApiError;

/// Everything needed to send, and later replay, one API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Extra header sent on every attempt. `Authorization` is managed by the client and
    /// cannot be set here.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if name != reqwest::header::AUTHORIZATION {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }
}

/// An [`ApiRequest`] together with how many times it has been sent.
///
/// A request gets one replay after a 401; a second 401 is final.
#[derive(Debug, Clone)]
pub struct AuthenticatedRequest {
    request: ApiRequest,
    attempts: u32,
}

impl AuthenticatedRequest {
    pub const MAX_ATTEMPTS: u32 = 2;

    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            attempts: 0,
        }
    }

    pub fn request(&self) -> &ApiRequest {
        &self.request
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn can_replay(&self) -> bool {
        self.attempts < Self::MAX_ATTEMPTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_everything_but_authorization() {
        let request = ApiRequest::post("/vendas")
            .query("loja", 7)
            .header(
                HeaderName::from_static("x-terminal"),
                HeaderValue::from_static("caixa-2"),
            )
            .header(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_static("Bearer nope"),
            )
            .json(&serde_json::json!({ "total": 10.5 }))
            .unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.query_pairs(), [("loja".to_string(), "7".to_string())]);
        assert_eq!(request.headers().len(), 1);
        assert_eq!(request.headers()["x-terminal"], "caixa-2");
        assert_eq!(request.body().unwrap()["total"], 10.5);
    }

    #[test]
    fn one_replay_allowed() {
        let mut request = AuthenticatedRequest::new(ApiRequest::get("/produtos"));
        request.record_attempt();
        assert!(request.can_replay());
        request.record_attempt();
        assert!(!request.can_replay());
        assert_eq!(request.attempts(), 2);
    }
}
