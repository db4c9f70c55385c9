//! Axum operator endpoints: synchronous job triggers, subject lookup and
//! blacklisting, proposal listing, export and cancellation.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use margem_core::{today, Population, Proposal, Subject};
use margem_storage::StoreError;
use margem_sync::{
    collect_export_rows, export_proposals_parquet, CancellationJob, CancellationSettings, ImportJob,
    JobScheduler, ProposalRunner, ReconciliationEngine, RunOutcome, SubjectQuery, SyncError,
    TriggerStatus,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "margem-web";

const DEFAULT_PER_PAGE: usize = 50;
const MAX_PER_PAGE: usize = 500;
const EXPORT_PAGE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub extraction: JobScheduler,
    pub proposals: ProposalRunner,
    pub import: ImportJob,
    pub cancellation: CancellationJob,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/subjects", get(subject_search_handler))
        .route("/subjects/eligible", get(eligible_handler))
        .route("/subjects/{taxpayer_id}/blacklist", post(blacklist_handler))
        .route("/proposals", get(proposals_handler))
        .route("/proposals/export", post(export_handler))
        .route("/proposals/run", post(proposal_run_handler))
        .route("/proposals/cancellations", post(cancellation_run_handler))
        .route(
            "/proposals/cancellations/config",
            get(cancellation_settings_handler).put(cancellation_settings_update_handler),
        )
        .route(
            "/proposals/{number}",
            get(proposal_detail_handler).delete(proposal_delete_handler),
        )
        .route("/jobs/{population}/run", post(extraction_run_handler))
        .route("/imports/run", post(import_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "operator endpoints listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(StoreError::SubjectNotFound(key)) => {
                ApiError::NotFound(format!("subject {key} not found"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        SyncError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => {
                error!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct TriggerResponse {
    status: TriggerStatus,
    run_id: Option<Uuid>,
}

fn trigger_response<R>(outcome: RunOutcome<R>) -> Response {
    let status = outcome.status();
    let code = match status {
        TriggerStatus::Completed => StatusCode::OK,
        TriggerStatus::AlreadyRunning => StatusCode::CONFLICT,
        TriggerStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = TriggerResponse {
        status,
        run_id: outcome.run_id(),
    };
    (code, Json(body)).into_response()
}

async fn subject_search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubjectQuery>,
) -> ApiResult<Json<Subject>> {
    if query.taxpayer_id.is_none() && query.registration.is_none() {
        return Err(ApiError::BadRequest(
            "taxpayer_id or registration is required".to_string(),
        ));
    }
    state
        .engine
        .search(&query)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no matching subject".to_string()))
}

#[derive(Debug, Serialize)]
struct EligibleRow {
    taxpayer_id: String,
    name: Option<String>,
    tightest_margin: Option<f64>,
    relationships: usize,
}

async fn eligible_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<EligibleRow>>> {
    let rows = state
        .engine
        .eligible_for_proposal()
        .await?
        .into_iter()
        .map(|s| EligibleRow {
            tightest_margin: s.tightest_eligible_margin(),
            relationships: s.relationships.len(),
            taxpayer_id: s.taxpayer_id,
            name: s.name,
        })
        .collect();
    Ok(Json(rows))
}

async fn blacklist_handler(
    State(state): State<Arc<AppState>>,
    Path(taxpayer_id): Path<String>,
) -> ApiResult<Json<Subject>> {
    Ok(Json(state.engine.toggle_excluded(&taxpayer_id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ProposalPage {
    page: usize,
    per_page: usize,
    proposals: Vec<Proposal>,
}

async fn proposals_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<ProposalPage>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let proposals = state
        .engine
        .store()
        .list_proposals((page - 1) * per_page, per_page)
        .await?;
    Ok(Json(ProposalPage {
        page,
        per_page,
        proposals,
    }))
}

async fn proposal_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
) -> ApiResult<Json<Proposal>> {
    state
        .engine
        .store()
        .find_proposal_by_number(&number)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("proposal {number} not found")))
}

async fn proposal_delete_handler(
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
) -> ApiResult<StatusCode> {
    if state.engine.store().delete_proposal(&number).await? {
        info!(%number, "proposal deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("proposal {number} not found")))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExportQuery {
    /// Only proposals created on this date; all when absent.
    date: Option<NaiveDate>,
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let store = state.engine.store();
    let mut proposals = Vec::new();
    let mut offset = 0;
    loop {
        let page = store.list_proposals(offset, EXPORT_PAGE).await?;
        let fetched = page.len();
        proposals.extend(
            page.into_iter()
                .filter(|p| query.date.map_or(true, |date| p.created_on == date)),
        );
        if fetched < EXPORT_PAGE {
            break;
        }
        offset += fetched;
    }

    let rows = collect_export_rows(store.as_ref(), proposals)
        .await
        .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
    let export = export_proposals_parquet(&rows, query.date.unwrap_or_else(today))
        .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
    info!(rows = export.rows, file = %export.file_name, "proposals exported");

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", export.file_name))
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let digest = HeaderValue::from_str(&export.sha256).map_err(|err| ApiError::Internal(err.to_string()))?;
    let mut response = export.bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/vnd.apache.parquet"));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::HeaderName::from_static("x-content-sha256"), digest);
    Ok(response)
}

async fn extraction_run_handler(
    State(state): State<Arc<AppState>>,
    Path(population): Path<String>,
) -> ApiResult<Response> {
    let population: Population = population
        .parse()
        .map_err(|err: margem_core::UnknownPopulation| ApiError::BadRequest(err.to_string()))?;
    Ok(trigger_response(state.extraction.run(population).await))
}

async fn proposal_run_handler(State(state): State<Arc<AppState>>) -> Response {
    trigger_response(state.proposals.run().await)
}

async fn import_run_handler(State(state): State<Arc<AppState>>) -> Response {
    trigger_response(state.import.run().await)
}

#[derive(Debug, Serialize)]
struct CancellationResponse {
    status: TriggerStatus,
    run_id: Option<Uuid>,
    cancelled: Vec<String>,
    not_found: Vec<String>,
    failed: Vec<String>,
}

async fn cancellation_run_handler(
    State(state): State<Arc<AppState>>,
    Json(numbers): Json<Vec<String>>,
) -> ApiResult<Response> {
    if numbers.iter().all(|n| n.trim().is_empty()) {
        return Err(ApiError::BadRequest("no proposal numbers given".to_string()));
    }
    let outcome = state.cancellation.run(numbers).await;
    let status = outcome.status();
    let code = match status {
        TriggerStatus::Completed => StatusCode::OK,
        TriggerStatus::AlreadyRunning => StatusCode::CONFLICT,
        TriggerStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = CancellationResponse {
        status,
        run_id: outcome.run_id(),
        cancelled: Vec::new(),
        not_found: Vec::new(),
        failed: Vec::new(),
    };
    if let RunOutcome::Completed { report, .. } = outcome {
        body.cancelled = report.cancelled;
        body.not_found = report.not_found;
        body.failed = report.failed;
    }
    Ok((code, Json(body)).into_response())
}

async fn cancellation_settings_handler(State(state): State<Arc<AppState>>) -> Json<CancellationSettings> {
    Json(state.cancellation.settings().await)
}

async fn cancellation_settings_update_handler(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<CancellationSettings>,
) -> ApiResult<Json<CancellationSettings>> {
    state
        .cancellation
        .update_settings(settings)
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(state.cancellation.settings().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use margem_core::{Credential, HistoryEntry, Relationship, SourceRecord};
    use margem_portal::{PortalFixture, ScriptedPortal};
    use margem_storage::MemoryStore;
    use margem_sync::{ExtractionSettings, ProposalSettings, StaticCredentials};
    use serde_json::json;
    use tower::ServiceExt;

    async fn state() -> AppState {
        let engine = Arc::new(ReconciliationEngine::new(Arc::new(MemoryStore::new())));
        let mut record = SourceRecord::new("11111111111");
        record.name = Some("Ana".into());
        let mut relationship = Relationship::new(Some("INSS"), "0042");
        relationship
            .history
            .push(HistoryEntry::on(today()).with_benefit("55,00", "Autorizado"));
        record.relationships.push(relationship);
        engine.upsert_subject(record).await.unwrap();

        let portal = Arc::new(ScriptedPortal::new(PortalFixture::default()));
        let credentials = Arc::new(StaticCredentials(vec![Credential::new("op", "pw")]));
        AppState {
            extraction: JobScheduler::new(
                Arc::clone(&engine),
                portal.clone(),
                credentials.clone(),
                ExtractionSettings::default(),
                None,
            ),
            proposals: ProposalRunner::new(
                Arc::clone(&engine),
                portal.clone(),
                credentials.clone(),
                ProposalSettings::default(),
            ),
            cancellation: CancellationJob::new(
                Arc::clone(&engine),
                portal,
                credentials,
                CancellationSettings {
                    contact_email: "ops@example.com".into(),
                    reason: "desistência".into(),
                    promoter: "Promotora".into(),
                    ..Default::default()
                },
            ),
            import: ImportJob::new(Arc::clone(&engine), "./does-not-exist"),
            engine,
        }
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn subject_search_by_either_key() {
        let app = app(state().await);
        let by_id = app
            .clone()
            .oneshot(request("GET", "/subjects?taxpayer_id=11111111111"))
            .await
            .unwrap();
        assert_eq!(by_id.status(), StatusCode::OK);
        assert_eq!(json(by_id).await["name"], "Ana");

        let by_registration = app
            .clone()
            .oneshot(request("GET", "/subjects?registration=42"))
            .await
            .unwrap();
        assert_eq!(by_registration.status(), StatusCode::OK);

        let missing = app
            .clone()
            .oneshot(request("GET", "/subjects?taxpayer_id=999"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let empty = app.oneshot(request("GET", "/subjects")).await.unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blacklist_toggle_removes_subject_from_eligible_list() {
        let app = app(state().await);
        let eligible = json(app.clone().oneshot(request("GET", "/subjects/eligible")).await.unwrap()).await;
        assert_eq!(eligible.as_array().unwrap().len(), 1);
        assert_eq!(eligible[0]["tightest_margin"], 55.0);

        let toggled = app
            .clone()
            .oneshot(request("POST", "/subjects/11111111111/blacklist"))
            .await
            .unwrap();
        assert_eq!(toggled.status(), StatusCode::OK);
        assert_eq!(json(toggled).await["excluded"], true);

        let eligible = json(app.clone().oneshot(request("GET", "/subjects/eligible")).await.unwrap()).await;
        assert!(eligible.as_array().unwrap().is_empty());

        let unknown = app
            .oneshot(request("POST", "/subjects/000/blacklist"))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn proposals_list_detail_delete_and_export() {
        let state = state().await;
        let store = Arc::clone(state.engine.store());
        let mut proposal = Proposal::partial("11111111111", today());
        proposal.number = Some("00000007".into());
        store.save_proposal(proposal).await.unwrap();
        let app = app(state);

        let page = json(app.clone().oneshot(request("GET", "/proposals?page=1&per_page=10")).await.unwrap()).await;
        assert_eq!(page["proposals"].as_array().unwrap().len(), 1);

        let detail = app
            .clone()
            .oneshot(request("GET", "/proposals/00000007"))
            .await
            .unwrap();
        assert_eq!(detail.status(), StatusCode::OK);

        let export = app
            .clone()
            .oneshot(request("POST", "/proposals/export"))
            .await
            .unwrap();
        assert_eq!(export.status(), StatusCode::OK);
        assert_eq!(
            export.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/vnd.apache.parquet"
        );
        assert!(export.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("proposals_"));
        let bytes = export.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..4], b"PAR1");

        let deleted = app
            .clone()
            .oneshot(request("DELETE", "/proposals/00000007"))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        let gone = app
            .oneshot(request("GET", "/proposals/00000007"))
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn triggers_report_status_and_run_id() {
        let app = app(state().await);
        let extraction = app
            .clone()
            .oneshot(request("POST", "/jobs/priority/run"))
            .await
            .unwrap();
        assert_eq!(extraction.status(), StatusCode::OK);
        let body = json(extraction).await;
        assert_eq!(body["status"], "completed");
        assert!(body["run_id"].is_string());

        let bad = app
            .clone()
            .oneshot(request("POST", "/jobs/weekend/run"))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let import = app.oneshot(request("POST", "/imports/run")).await.unwrap();
        assert_eq!(import.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json(import).await;
        assert_eq!(body["status"], "failed");
        assert!(body["run_id"].is_string());
    }

    #[tokio::test]
    async fn cancellation_submits_forms_and_deletes_proposals() {
        let state = state().await;
        let store = Arc::clone(state.engine.store());
        let mut proposal = Proposal::partial("11111111111", today());
        proposal.number = Some("00000009".into());
        store.save_proposal(proposal).await.unwrap();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/proposals/cancellations",
                json!(["00000009", "00000404"]),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["cancelled"], json!(["00000009"]));
        assert_eq!(body["not_found"], json!(["00000404"]));
        assert!(store.find_proposal_by_number("00000009").await.unwrap().is_none());

        let empty = app
            .oneshot(json_request("POST", "/proposals/cancellations", json!([" "])))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancellation_settings_are_validated_on_update() {
        let app = app(state().await);
        let current = json(
            app.clone()
                .oneshot(request("GET", "/proposals/cancellations/config"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(current["contact_email"], "ops@example.com");

        let blank = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/proposals/cancellations/config",
                json!({ "contact_email": "", "reason": "r", "promoter": "p" }),
            ))
            .await
            .unwrap();
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);

        let updated = app
            .oneshot(json_request(
                "PUT",
                "/proposals/cancellations/config",
                json!({ "contact_email": "new@example.com", "reason": "r", "promoter": "p" }),
            ))
            .await
            .unwrap();
        assert_eq!(updated.status(), StatusCode::OK);
        assert_eq!(json(updated).await["contact_email"], "new@example.com");
    }
}
