//! HTTP implementation of the credential endpoints.

use async_trait::async_trait;
use common::{LoginRequest, Result, TokenGrant};
use serde_json::json;
use session::AuthApi;
use std::sync::Arc;

use crate::interceptors::{InterceptorChain, RequestIdInterceptor, RetryInterceptor, RetryPolicy};
use crate::rest::decode;
use crate::transport::{ApiRequest, Transport};

const LOGIN_PATH: &str = "/api/v1/auth/login";
const EXCHANGE_PATH: &str = "/api/v1/auth/exchange";
const REFRESH_PATH: &str = "/api/v1/auth/refresh";
const LOGOUT_PATH: &str = "/api/v1/auth/logout";

/// Talks to the auth endpoints through its own chain: these calls must
/// never pick up the session's credentials or trigger invalidation.
#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    chain: InterceptorChain,
}

impl HttpAuthApi {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        let chain = InterceptorChain::new(transport)
            .with(RequestIdInterceptor)
            .with(RetryInterceptor::new(retry));
        Self { chain }
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, request: &LoginRequest) -> Result<TokenGrant> {
        let path = match request {
            LoginRequest::Password { .. } => LOGIN_PATH,
            LoginRequest::IdentityProvider { .. } => EXCHANGE_PATH,
        };
        let body = serde_json::to_value(request)?;
        let response = self.chain.execute(ApiRequest::post(path, body)).await?;
        decode(path, response)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let body = json!({ "refresh_token": refresh_token });
        let response = self.chain.execute(ApiRequest::post(REFRESH_PATH, body)).await?;
        decode(REFRESH_PATH, response)
    }

    async fn logout(&self, access_token: &str) -> Result<()> {
        let mut request = ApiRequest::post(LOGOUT_PATH, json!({}));
        request.set_bearer(access_token);
        let response = self.chain.execute(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(response.error())
        }
    }
}
