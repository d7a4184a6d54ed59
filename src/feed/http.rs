use reqwest::Client;
use serde_json::{Value, json};

use crate::error::{EngineError, Result};
use crate::feed::source::PollResult;

/// HTTP sampling; 2xx is success. The body is parsed as JSON when possible,
/// otherwise kept as text.
#[derive(Debug, Clone)]
pub struct HttpPoll {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    client: Client,
}

impl PartialEq for HttpPoll {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
            && self.method == other.method
            && self.headers == other.headers
            && self.body == other.body
    }
}

impl HttpPoll {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            client: Client::new(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub(crate) async fn sample(&self) -> Result<PollResult> {
        let method = self
            .method
            .parse::<reqwest::Method>()
            .map_err(|_| EngineError::IllegalArgument(format!("Invalid HTTP method: {}", self.method)))?;

        let mut builder = self.client.request(method, &self.url);
        if let Some(body) = &self.body {
            builder = builder.json(body);
        }
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Execution(format!("{} {} failed: {}", self.method, self.url, e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Execution(format!("Reading {} failed: {}", self.url, e)))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            Ok(PollResult::Success(data))
        } else {
            Ok(PollResult::Failure(json!({
                "status": status.as_u16(),
                "data": data,
            })))
        }
    }
}
