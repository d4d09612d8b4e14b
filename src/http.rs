//! 下流サービス共通のHTTPクライアント
//!
//! Bearerトークンの付与とエラー変換（`ServiceError`）をまとめる。

use crate::error::ServiceError;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

const USER_AGENT: &str = concat!("receipt-ingest/", env!("CARGO_PKG_VERSION"));

/// APIクライアント（複製は安価）
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// 署名付きURLへの直接転送など、認証なしで使う素のクライアント
    pub fn raw(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        tracing::debug!(path, "GET");
        let response = send(self.request(Method::GET, path)).await?;
        parse_json(response).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ServiceError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        tracing::debug!(path, "POST");
        let response = send(self.request(Method::POST, path).json(body)).await?;
        parse_json(response).await
    }

    /// 応答本文を読まないPOST
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ServiceError> {
        tracing::debug!(path, "POST");
        send(self.request(Method::POST, path).json(body)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), ServiceError> {
        tracing::debug!(path, "DELETE");
        send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }
}

/// 送信して成功ステータスを確認する
async fn send(builder: RequestBuilder) -> Result<Response, ServiceError> {
    let response = builder
        .send()
        .await
        .map_err(|e| ServiceError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), body = %body, "API error");
        return Err(ServiceError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    response
        .json()
        .await
        .map_err(|e| ServiceError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let client = ApiClient::new("https://api.example.com/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/cart"), "https://api.example.com/cart");
        assert_eq!(client.url("cart/3"), "https://api.example.com/cart/3");
    }
}
