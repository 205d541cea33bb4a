use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::config::EtcdConfig;

/// etcd's JSON gateway renders int64 fields as strings.
fn int64_field<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Num(i64),
        Str(String),
    }

    match Option::<Int64>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Int64::Num(n)) => Ok(n),
        Some(Int64::Str(s)) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Key-value access to etcd through its v3 HTTP/JSON gateway. Only the calls
/// the router needs are exposed: point reads, prefix reads and puts.
///
/// Clones share the connection pool and auth token.
#[derive(Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Serialize)]
pub struct RangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_only: Option<bool>,
}

#[derive(Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
    #[serde(default, deserialize_with = "int64_field")]
    pub count: i64,
}

#[derive(Deserialize)]
pub struct KeyValue {
    pub key: String,
    /// Omitted by the gateway for empty values.
    #[serde(default)]
    pub value: String,
}

impl KeyValue {
    /// Decoded `(key, value)`.
    pub fn decode(&self) -> anyhow::Result<(String, String)> {
        Ok((b64_decode(&self.key)?, b64_decode(&self.value)?))
    }
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: Option<String>,
}

pub fn b64_encode(s: &str) -> String {
    STANDARD.encode(s.as_bytes())
}

pub fn b64_decode(s: &str) -> anyhow::Result<String> {
    let bytes = STANDARD.decode(s).context("invalid base64 from etcd")?;
    String::from_utf8(bytes).context("non-utf8 value from etcd")
}

/// Encoded `range_end` covering every key that starts with `prefix`. Empty
/// when no such bound exists (all bytes are 0xff).
pub fn prefix_range_end(prefix: &str) -> String {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return STANDARD.encode(&end);
        }
    }
    String::new()
}

impl EtcdClient {
    /// Use the first endpoint that answers. With credentials configured the
    /// answer is an auth token, otherwise a cheap keys-only range.
    pub async fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        if cfg.endpoints.is_empty() {
            anyhow::bail!("etcd: no endpoints configured");
        }

        let http = reqwest::Client::builder()
            .connect_timeout(cfg.dial_timeout())
            .timeout(cfg.request_timeout())
            .no_proxy()
            .build()?;

        let mut last_error = None;
        for endpoint in &cfg.endpoints {
            let endpoint = endpoint.trim_end_matches('/').to_string();
            match handshake(&http, &endpoint, cfg).await {
                Ok(token) => {
                    info!(endpoint = %endpoint, auth = token.is_some(), "etcd: connected");
                    return Ok(Self {
                        http,
                        endpoint,
                        token,
                    });
                }
                Err(e) => {
                    warn!("etcd: endpoint {} unusable, trying next, error={:#}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("etcd: all endpoints failed")))
    }

    async fn call<B: Serialize>(&self, path: &str, body: &B) -> anyhow::Result<reqwest::Response> {
        let mut req = self.http.post(format!("{}{}", self.endpoint, path)).json(body);
        if let Some(token) = &self.token {
            req = req.header(reqwest::header::AUTHORIZATION, token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("etcd {} returned {}: {}", path, status, body);
        }
        Ok(resp)
    }

    pub async fn range(&self, req: &RangeRequest) -> anyhow::Result<RangeResponse> {
        Ok(self.call("/v3/kv/range", req).await?.json().await?)
    }

    /// `Ok(None)` when the key does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let resp = self
            .range(&RangeRequest {
                key: b64_encode(key),
                range_end: String::new(),
                keys_only: None,
            })
            .await?;
        resp.kvs
            .first()
            .map(|kv| b64_decode(&kv.value))
            .transpose()
    }

    /// Every decoded `(key, value)` under `prefix`, in key order.
    pub async fn get_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
        let resp = self
            .range(&RangeRequest {
                key: b64_encode(prefix),
                range_end: prefix_range_end(prefix),
                keys_only: None,
            })
            .await?;
        resp.kvs.iter().map(KeyValue::decode).collect()
    }

    pub async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let req = PutRequest {
            key: b64_encode(key),
            value: b64_encode(value),
        };
        self.call("/v3/kv/put", &req).await?;
        Ok(())
    }
}

async fn handshake(
    http: &reqwest::Client,
    endpoint: &str,
    cfg: &EtcdConfig,
) -> anyhow::Result<Option<String>> {
    if let (Some(name), Some(password)) = (&cfg.username, &cfg.password) {
        let resp: AuthResponse = http
            .post(format!("{}/v3/auth/authenticate", endpoint))
            .json(&AuthRequest { name, password })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        return Ok(resp.token);
    }

    http.post(format!("{}/v3/kv/range", endpoint))
        .json(&RangeRequest {
            key: b64_encode("/"),
            range_end: String::new(),
            keys_only: Some(true),
        })
        .send()
        .await?
        .error_for_status()?;
    Ok(None)
}
