//! A ready-made HTTP [`Attacker`] built on [`reqwest`].
//!
//! Any response with a status code of 400 or above counts as a failed fire, as does
//! any transport error. The response body is always read in full so the measured
//! time covers the whole exchange.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::str::FromStr;
use url::Url;

use crate::task::{AttackError, Attacker};
use crate::SkeinError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build the client shared by attackers that don't bring their own.
pub fn default_client() -> Result<Client, SkeinError> {
    let builder = Client::builder().user_agent(APP_USER_AGENT);
    #[cfg(feature = "cookies")]
    let builder = builder.cookie_store(true);
    Ok(builder.build()?)
}

/// Fires one HTTP request per call.
#[derive(Clone, Debug)]
pub struct HttpAttacker {
    name: String,
    client: Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<String>,
}

impl HttpAttacker {
    /// A `GET` of `url`, reported under `name`.
    pub fn new(name: &str, url: &str) -> Result<Self, SkeinError> {
        Ok(HttpAttacker {
            name: name.to_string(),
            client: default_client()?,
            method: Method::GET,
            url: Url::parse(url)?,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Share a client between attackers, for example to reuse connections or cookies.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, SkeinError> {
        let invalid = |detail: String| SkeinError::InvalidOption {
            option: format!("header {}", name),
            value: value.to_string(),
            detail,
        };
        let header_name = HeaderName::from_str(name).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Attacker for HttpAttacker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fire(&self) -> Result<(), AttackError> {
        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if let Some(body) = self.body.as_ref() {
            request = request.body(body.clone());
        }
        let response = request.send().await?;
        let status = response.status();
        response.bytes().await?;
        if status.as_u16() >= 400 {
            return Err(format!("{} {}: {}", self.method, self.url.path(), status).into());
        }
        Ok(())
    }
}
