use anyhow::{anyhow, Context as _};
use goodable_protocol::{
    ActRequest, ActResponse, ApprovePlanRequest, ApprovePlanResponse, ConfirmPermissionRequest,
    ConfirmPermissionResponse, ErrorResponse, HealthResponse, HookPermissionRequest,
    HookPermissionResponse, InterruptRequest, InterruptResponse, PendingPermissionsResponse,
    RequestInfo, RequestListResponse,
};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

/// HTTP client for a running goodable server.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
}

impl Client {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let trimmed = base_url.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("server url is empty"));
        }
        let mut base = Url::parse(trimmed).with_context(|| format!("parse server url: {trimmed}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );

        let http = reqwest::Client::builder()
            .user_agent(format!("goodable/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .context("build reqwest client")?;

        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("build url for {path}"))
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> anyhow::Result<T> {
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        decode(resp).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let url = self.url(path)?;
        let resp = self
            .http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        decode(resp).await
    }

    pub async fn health(&self) -> anyhow::Result<HealthResponse> {
        self.get(self.url("health")?).await
    }

    pub async fn act(&self, project_id: &str, req: &ActRequest) -> anyhow::Result<ActResponse> {
        self.post(&format!("chat/{}/act", segment(project_id)?), req)
            .await
    }

    pub async fn request_show(
        &self,
        project_id: &str,
        request_id: &str,
    ) -> anyhow::Result<RequestInfo> {
        let url = self.url(&format!(
            "chat/{}/requests/{}",
            segment(project_id)?,
            segment(request_id)?
        ))?;
        self.get(url).await
    }

    pub async fn request_list(&self, project_id: &str) -> anyhow::Result<RequestListResponse> {
        let url = self.url(&format!("chat/{}/requests", segment(project_id)?))?;
        self.get(url).await
    }

    pub async fn permission_list(
        &self,
        project_id: &str,
    ) -> anyhow::Result<PendingPermissionsResponse> {
        let mut url = self.url("permissions/pending")?;
        url.query_pairs_mut().append_pair("projectId", project_id);
        self.get(url).await
    }

    pub async fn permission_confirm(
        &self,
        permission_id: &str,
        approved: bool,
    ) -> anyhow::Result<ConfirmPermissionResponse> {
        self.post(
            "permissions/confirm",
            &ConfirmPermissionRequest {
                permission_id: permission_id.to_owned(),
                approved,
            },
        )
        .await
    }

    pub async fn approve_plan(
        &self,
        project_id: &str,
        req: &ApprovePlanRequest,
    ) -> anyhow::Result<ApprovePlanResponse> {
        self.post(&format!("chat/{}/approve-plan", segment(project_id)?), req)
            .await
    }

    pub async fn interrupt(
        &self,
        project_id: &str,
        request_id: &str,
    ) -> anyhow::Result<InterruptResponse> {
        self.post(
            &format!("chat/{}/interrupt", segment(project_id)?),
            &InterruptRequest {
                request_id: request_id.to_owned(),
            },
        )
        .await
    }

    pub async fn hook_permission_request(
        &self,
        req: &HookPermissionRequest,
    ) -> anyhow::Result<HookPermissionResponse> {
        self.post("permissions/request", req).await
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
    let status = resp.status();
    let bytes = resp.bytes().await.context("read response body")?;
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorResponse>(&bytes)
            .map(|e| e.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_owned());
        return Err(anyhow!("server returned {status}: {message}"));
    }
    serde_json::from_slice(&bytes).context("decode response")
}

/// Rejects ids that would change the route they are placed in.
fn segment(id: &str) -> anyhow::Result<&str> {
    let id = id.trim();
    if id.is_empty() || id.contains(['/', '?', '#', '%']) || id == "." || id == ".." {
        return Err(anyhow!("invalid id: {id:?}"));
    }
    Ok(id)
}
