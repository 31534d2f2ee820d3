//! REST implementation of the control-plane client.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use gantry_core::retry::{Backoff, retry};
use gantry_core::{BuildRecord, Error, LogRecord, Result, Secret, ServiceRecord, StepRecord};

use crate::ControlPlane;

/// Client for a Vela-compatible control plane, scoped to one repository
/// and build.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    token: String,
    /// Separate secret store endpoint; secrets resolve against the
    /// control plane when unset.
    secrets: Option<(Url, String)>,
    repo: String,
    build: i64,
    backoff: Backoff,
}

impl RestClient {
    /// Create an unscoped client. Call [`RestClient::for_build`] before
    /// issuing build-scoped requests.
    pub fn new(base: &str, token: impl Into<String>) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| Error::InvalidConfiguration(format!("server address: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token: token.into(),
            secrets: None,
            repo: String::new(),
            build: 0,
            backoff: Backoff::default(),
        })
    }

    /// Resolve secrets against an external store instead of the control
    /// plane.
    pub fn with_secret_store(mut self, address: &str, token: impl Into<String>) -> Result<Self> {
        let base = Url::parse(address)
            .map_err(|e| Error::InvalidConfiguration(format!("secret backend address: {e}")))?;
        self.secrets = Some((base, token.into()));
        Ok(self)
    }

    /// Scope the client to `org/name` and a build number.
    pub fn for_build(&self, repo_full_name: &str, build: i64) -> Self {
        Self {
            repo: repo_full_name.to_string(),
            build,
            ..self.clone()
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Internal(format!("bad api path {path}: {e}")))
    }

    fn build_path(&self, suffix: &str) -> String {
        format!("/api/v1/repos/{}/builds/{}{}", self.repo, self.build, suffix)
    }

    async fn send<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = self.url(path)?;
        self.dispatch(method, url, &self.token, body).await
    }

    /// Issue one JSON request with bounded backoff on transport errors and
    /// server-side 5xx responses. Exhaustion surfaces as an API error.
    async fn dispatch<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        bearer: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let path = url.path().to_string();
        let result = retry(
            self.backoff,
            || async {
                let mut request = self
                    .http
                    .request(method.clone(), url.clone())
                    .bearer_auth(bearer);
                if let Some(body) = body {
                    request = request.json(body);
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| Error::RuntimeTransient(format!("{path}: {e}")))?;

                let status = response.status();
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(Error::RuntimeTransient(format!("{path}: {status}")));
                }
                if !status.is_success() {
                    return Err(Error::Api(format!("{path}: {status}")));
                }

                response
                    .json::<T>()
                    .await
                    .map_err(|e| Error::Api(format!("{path}: {e}")))
            },
            Error::is_transient,
        )
        .await;

        result.map_err(|e| match e {
            transient @ Error::RuntimeTransient(_) => Error::Api(transient.to_string()),
            other => other,
        })
    }
}

#[async_trait]
impl ControlPlane for RestClient {
    async fn update_build(&self, build: &BuildRecord) -> Result<BuildRecord> {
        self.send(
            Method::PUT,
            &format!("/api/v1/repos/{}/builds/{}", self.repo, self.build),
            Some(build),
        )
        .await
    }

    async fn update_step(&self, step: &StepRecord) -> Result<StepRecord> {
        self.send(
            Method::PUT,
            &self.build_path(&format!("/steps/{}", step.number)),
            Some(step),
        )
        .await
    }

    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord> {
        self.send(
            Method::PUT,
            &self.build_path(&format!("/services/{}", service.number)),
            Some(service),
        )
        .await
    }

    async fn get_step_log(&self, step: i64) -> Result<LogRecord> {
        self.send::<(), _>(
            Method::GET,
            &self.build_path(&format!("/steps/{step}/logs")),
            None,
        )
        .await
    }

    async fn update_step_log(&self, step: i64, data: &[u8]) -> Result<()> {
        let log = LogRecord {
            number: step,
            data: data.to_vec(),
        };
        self.send::<_, LogRecord>(
            Method::PUT,
            &self.build_path(&format!("/steps/{step}/logs")),
            Some(&log),
        )
        .await
        .map(|_| ())
    }

    async fn get_service_log(&self, service: i64) -> Result<LogRecord> {
        self.send::<(), _>(
            Method::GET,
            &self.build_path(&format!("/services/{service}/logs")),
            None,
        )
        .await
    }

    async fn update_service_log(&self, service: i64, data: &[u8]) -> Result<()> {
        let log = LogRecord {
            number: service,
            data: data.to_vec(),
        };
        self.send::<_, LogRecord>(
            Method::PUT,
            &self.build_path(&format!("/services/{service}/logs")),
            Some(&log),
        )
        .await
        .map(|_| ())
    }

    async fn get_secret(&self, engine: &str, key: &str) -> Result<Secret> {
        let path = format!("/api/v1/secrets/{engine}/{key}");
        match &self.secrets {
            Some((base, token)) => {
                let url = base
                    .join(&path)
                    .map_err(|e| Error::Internal(format!("bad secret path {path}: {e}")))?;
                self.dispatch::<(), _>(Method::GET, url, token, None).await
            }
            None => self.send::<(), _>(Method::GET, &path, None).await,
        }
    }
}
