//! API collaborators
//!
//! [`RecordSource`] reads standardized records, [`RecordSink`] writes
//! merged collections. [`HttpApi`] implements both over the blocking
//! `reqwest` client with fixed-delay retries.

use std::time::Duration;

use log::debug;
use mrg_core::StandardizedPatientRecord;
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::payload::Collection;
use crate::retry::RetryPolicy;

const RECORDS_PATH: &str = "std/patientrecords";
const COUNT_PATH: &str = "std/patientrecords/count";

pub trait RecordSource {
    /// Number of distinct person-codes available
    fn count(&self) -> Result<usize>;

    /// Records for the person-code window `[offset, offset + limit)`
    fn fetch_window(&self, limit: usize, offset: usize) -> Result<Vec<StandardizedPatientRecord>>;

    /// Every record for one person-code
    fn fetch_patient(&self, patient_code: &str) -> Result<Vec<StandardizedPatientRecord>>;
}

pub trait RecordSink {
    /// Submit one full collection body
    fn submit(&mut self, collection: Collection, body: &serde_json::Value) -> Result<()>;
}

impl<S: RecordSource + ?Sized> RecordSource for &S {
    fn count(&self) -> Result<usize> {
        (**self).count()
    }

    fn fetch_window(&self, limit: usize, offset: usize) -> Result<Vec<StandardizedPatientRecord>> {
        (**self).fetch_window(limit, offset)
    }

    fn fetch_patient(&self, patient_code: &str) -> Result<Vec<StandardizedPatientRecord>> {
        (**self).fetch_patient(patient_code)
    }
}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn submit(&mut self, collection: Collection, body: &serde_json::Value) -> Result<()> {
        (**self).submit(collection, body)
    }
}

#[derive(Deserialize)]
struct CountResponse {
    count: usize,
}

/// Standardized-record and golden-record API over HTTP
pub struct HttpApi {
    client: Client,
    base_url: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration, token: Option<String>, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpApi {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            retry,
        })
    }

    /// Build from configuration. The bearer token must be present in the
    /// environment variable named by `api.token_env`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let token = std::env::var(&config.api.token_env).map_err(|_| {
            PipelineError::Config(format!(
                "bearer token variable {} is not set for environment {}",
                config.api.token_env, config.environment
            ))
        })?;
        Self::new(
            config.api.base_url.clone(),
            config.request_timeout(),
            Some(token),
            config.retry_policy(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path);
        self.retry.run(&format!("GET {}", path), || {
            debug!("GET {} {:?}", url, query);
            let response = self
                .authorize(self.client.get(&url).query(query))
                .send()?
                .error_for_status()?;
            Ok(response.json::<T>()?)
        })
    }

    fn put_json(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let url = self.url(path);
        self.retry.run(&format!("PUT {}", path), || {
            debug!("PUT {}", url);
            self.authorize(self.client.put(&url).json(body))
                .send()?
                .error_for_status()?;
            Ok(())
        })
    }
}

impl RecordSource for HttpApi {
    fn count(&self) -> Result<usize> {
        Ok(self.get_json::<CountResponse>(COUNT_PATH, &[])?.count)
    }

    fn fetch_window(&self, limit: usize, offset: usize) -> Result<Vec<StandardizedPatientRecord>> {
        self.get_json(
            RECORDS_PATH,
            &[("limit", limit.to_string()), ("offset", offset.to_string())],
        )
    }

    fn fetch_patient(&self, patient_code: &str) -> Result<Vec<StandardizedPatientRecord>> {
        self.get_json(RECORDS_PATH, &[("patient_code", patient_code.to_string())])
    }
}

impl RecordSink for HttpApi {
    fn submit(&mut self, collection: Collection, body: &serde_json::Value) -> Result<()> {
        self.put_json(collection.path(), body)
    }
}
