//! HTTP surface: the public federation endpoints and the admin API.
//!
//! The federation surface serves cached signed artifacts with their
//! type-specific media types; JSON arrays go out as `application/json`.
//! The admin API under `/api/v1` is a thin JSON wrapper over the admission
//! pipeline and the trust-mark engine. Authentication is handled in front
//! of this service, not here.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Form, Json, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::admission::{self, AdmissionOutcome, AdmissionRequest};
use crate::db::{SubordinateRow, TrustMarkRow, TrustMarkTypeRow};
use crate::error::FederationError;
use crate::server::AppState;
use crate::statement;
use crate::resolver;
use crate::trustmarks::{self, IssueOutcome, IssueRequest, UpdateRequest};

const ENTITY_STATEMENT: &str = "application/entity-statement+jwt";
const TRUST_MARK: &str = "application/trust-mark+jwt";
const TRUST_MARK_STATUS: &str = "application/trust-mark-status+jwt";
const RESOLVE_RESPONSE: &str = "application/resolve-response+jwt";
const JWK_SET: &str = "application/jwk-set+jwt";

/// Build the axum router with the federation and admin endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Federation surface
        .route("/", get(index))
        .route("/.well-known/openid-federation", get(well_known))
        .route("/list", get(list_subordinates))
        .route("/fetch", get(fetch_statement))
        .route("/trust_mark", get(trust_mark))
        .route("/trust_mark_list", get(trust_mark_list))
        .route("/trust_mark_status", post(trust_mark_status))
        .route("/resolve", get(resolve))
        .route("/historical_keys", get(historical_keys))
        // Admin API
        .route("/api/v1/trustmarktypes", post(create_tmt).get(list_tmts))
        .route("/api/v1/trustmarktypes/{id}", get(get_tmt).put(update_tmt))
        .route("/api/v1/trustmarks", post(create_tm).get(list_tms))
        .route("/api/v1/trustmarks/{id}", put(update_tm))
        .route("/api/v1/trustmarks/{id}/renew", post(renew_tm))
        .route("/api/v1/subordinates", post(create_sub).get(list_subs))
        .route("/api/v1/subordinates/{id}", get(get_sub).post(update_sub))
        .route("/api/v1/subordinates/{id}/renew", post(renew_sub))
        .route("/api/v1/subordinates/fetch-config", post(fetch_config))
        .route("/api/v1/server/entity", post(create_server_entity))
        .route("/api/v1/server/historical_keys", post(create_historical_keys))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Error mapping ──────────────────────────────────────────────────────

/// Wrapper turning a `FederationError` into the JSON error response.
pub struct ApiError(pub FederationError);

impl From<FederationError> for ApiError {
    fn from(e: FederationError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FederationError::NotFound(_)
            | FederationError::TypeNotFound(_)
            | FederationError::ChainIncomplete(_) => StatusCode::NOT_FOUND,
            FederationError::AlreadyExists(_) => StatusCode::FORBIDDEN,
            FederationError::Store(_) | FederationError::Cache(_) | FederationError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self.0);
        }
        (status, error_body(self.0.kind(), &self.0.to_string())).into_response()
    }
}

fn error_body(kind: &str, description: &str) -> Json<Value> {
    Json(serde_json::json!({
        "error": kind,
        "error_description": description,
    }))
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, error_body("not_found", what)).into_response()
}

fn missing_param(name: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        error_body("invalid_request", &format!("{name} parameter is required")),
    )
        .into_response()
}

fn jws_response(media_type: &'static str, body: String) -> Response {
    ([(header::CONTENT_TYPE, media_type)], body).into_response()
}

// ── Federation surface ─────────────────────────────────────────────────

async fn index() -> &'static str {
    "Index page."
}

async fn well_known(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    match state.cache.entity_configuration().await? {
        Some(jws) => Ok(jws_response(ENTITY_STATEMENT, jws)),
        None => Ok(not_found("Entity configuration not published.")),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    trust_mark_type: Option<String>,
    // Accepted but deliberately ignored: `trust_marked=false` must not
    // filter the listing.
    #[allow(dead_code)]
    trust_marked: Option<String>,
}

async fn list_subordinates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let mut ids = state.cache.subordinate_ids().await?;
    if let Some(tmtype) = &query.trust_mark_type {
        let marked = state.cache.trust_marked_subjects(tmtype).await?;
        ids.retain(|id| marked.contains(id));
    }
    Ok(Json(ids))
}

#[derive(Deserialize)]
struct FetchQuery {
    sub: Option<String>,
}

async fn fetch_statement(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FetchQuery>,
) -> Result<Response, ApiError> {
    let Some(sub) = query.sub else {
        return Ok(missing_param("sub"));
    };
    match state.cache.subordinate_statement(&sub).await? {
        Some(jws) => Ok(jws_response(ENTITY_STATEMENT, jws)),
        None => Ok(not_found("Subordinate not found.")),
    }
}

#[derive(Deserialize)]
struct TrustMarkQuery {
    trust_mark_type: Option<String>,
    sub: Option<String>,
}

async fn trust_mark(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrustMarkQuery>,
) -> Result<Response, ApiError> {
    let Some(tmtype) = query.trust_mark_type else {
        return Ok(missing_param("trust_mark_type"));
    };
    let Some(sub) = query.sub else {
        return Ok(missing_param("sub"));
    };
    let slot = state.cache.trust_mark(&sub, &tmtype).await?;
    if trustmarks::is_live_mark(slot.as_deref()) {
        Ok(jws_response(TRUST_MARK, slot.unwrap_or_default()))
    } else {
        Ok(not_found("Trust mark not found."))
    }
}

async fn trust_mark_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrustMarkQuery>,
) -> Result<Response, ApiError> {
    let Some(tmtype) = query.trust_mark_type else {
        return Ok(missing_param("trust_mark_type"));
    };
    let subjects = match query.sub {
        Some(sub) => {
            if state.cache.is_trust_marked(&tmtype, &sub).await? {
                vec![sub]
            } else {
                Vec::new()
            }
        }
        None => state.cache.trust_marked_subjects(&tmtype).await?,
    };
    Ok(Json(subjects).into_response())
}

#[derive(Deserialize)]
struct StatusRequest {
    trust_mark: String,
}

async fn trust_mark_status(
    State(state): State<Arc<AppState>>,
    Form(req): Form<StatusRequest>,
) -> Result<Response, ApiError> {
    let token = trustmarks::trust_mark_status(&state, &req.trust_mark).await?;
    Ok(jws_response(TRUST_MARK_STATUS, token))
}

async fn resolve(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let mut sub = None;
    let mut trust_anchor = None;
    let mut entity_types = Vec::new();
    for (key, value) in params {
        match key.as_str() {
            "sub" => sub = Some(value),
            "trust_anchor" => trust_anchor = Some(value),
            "entity_type" => entity_types.push(value),
            _ => {}
        }
    }
    let Some(sub) = sub else {
        return Ok(missing_param("sub"));
    };
    let Some(trust_anchor) = trust_anchor else {
        return Ok(missing_param("trust_anchor"));
    };
    let token = resolver::resolve(&state, &sub, &trust_anchor, &entity_types).await?;
    Ok(jws_response(RESOLVE_RESPONSE, token))
}

async fn historical_keys(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    match state.cache.historical_keys().await? {
        Some(jws) => Ok(jws_response(JWK_SET, jws)),
        None => Ok(not_found("No historical keys published.")),
    }
}

// ── Admin: trust-mark types ────────────────────────────────────────────

#[derive(Serialize)]
struct TrustMarkTypeOut {
    id: i64,
    tmtype: String,
    autorenew: bool,
    valid_for: i64,
    renewal_time: i64,
    active: bool,
}

impl From<TrustMarkTypeRow> for TrustMarkTypeOut {
    fn from(row: TrustMarkTypeRow) -> Self {
        TrustMarkTypeOut {
            id: row.id,
            tmtype: row.tmtype,
            autorenew: row.autorenew,
            valid_for: row.valid_for,
            renewal_time: row.renewal_time,
            active: row.active,
        }
    }
}

#[derive(Deserialize)]
struct TrustMarkTypeCreate {
    tmtype: String,
    autorenew: Option<bool>,
    valid_for: Option<i64>,
    renewal_time: Option<i64>,
    active: Option<bool>,
}

async fn create_tmt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TrustMarkTypeCreate>,
) -> Result<Response, ApiError> {
    let defaults = &state.config.tmtype_defaults;
    let result = state.db.insert_trust_mark_type(
        &req.tmtype,
        req.autorenew.unwrap_or(defaults.autorenew),
        req.valid_for.unwrap_or(defaults.valid_for),
        req.renewal_time.unwrap_or(defaults.renewal_time),
        req.active.unwrap_or(defaults.active),
    );
    match result {
        Ok(row) => Ok((StatusCode::CREATED, Json(TrustMarkTypeOut::from(row))).into_response()),
        Err(e) if crate::db::is_unique_violation(&e) => {
            let existing = state
                .db
                .get_trust_mark_type_by_type(&req.tmtype)
                .map_err(FederationError::from)?
                .ok_or_else(|| FederationError::NotFound(req.tmtype.clone()))?;
            Ok((StatusCode::FORBIDDEN, Json(TrustMarkTypeOut::from(existing))).into_response())
        }
        Err(e) => Err(FederationError::from(e).into()),
    }
}

async fn list_tmts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TrustMarkTypeOut>>, ApiError> {
    let rows = state.db.list_trust_mark_types().map_err(FederationError::from)?;
    Ok(Json(rows.into_iter().map(TrustMarkTypeOut::from).collect()))
}

async fn get_tmt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TrustMarkTypeOut>, ApiError> {
    let row = state
        .db
        .get_trust_mark_type(id)
        .map_err(FederationError::from)?
        .ok_or(FederationError::TypeNotFound(id))?;
    Ok(Json(row.into()))
}

#[derive(Deserialize)]
struct TrustMarkTypeUpdate {
    autorenew: Option<bool>,
    valid_for: Option<i64>,
    renewal_time: Option<i64>,
    active: Option<bool>,
}

async fn update_tmt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<TrustMarkTypeUpdate>,
) -> Result<Json<TrustMarkTypeOut>, ApiError> {
    let row = state
        .db
        .update_trust_mark_type(id, req.autorenew, req.valid_for, req.renewal_time, req.active)
        .map_err(FederationError::from)?
        .ok_or(FederationError::TypeNotFound(id))?;
    Ok(Json(row.into()))
}

// ── Admin: trust marks ─────────────────────────────────────────────────

#[derive(Serialize)]
struct TrustMarkOut {
    id: i64,
    tmt_id: i64,
    domain: String,
    active: bool,
    autorenew: bool,
    valid_for: i64,
    renewal_time: i64,
    mark: Option<String>,
    expire_at: Option<i64>,
    additional_claims: Option<Value>,
}

impl From<TrustMarkRow> for TrustMarkOut {
    fn from(row: TrustMarkRow) -> Self {
        TrustMarkOut {
            id: row.id,
            tmt_id: row.tmt_id,
            domain: row.domain,
            active: row.active,
            autorenew: row.autorenew,
            valid_for: row.valid_for,
            renewal_time: row.renewal_time,
            mark: row.mark,
            expire_at: row.expire_at,
            additional_claims: row.additional_claims,
        }
    }
}

#[derive(Deserialize)]
struct TrustMarkCreate {
    tmt: i64,
    domain: String,
    autorenew: Option<bool>,
    active: Option<bool>,
    valid_for: Option<i64>,
    renewal_time: Option<i64>,
    additional_claims: Option<Value>,
}

async fn create_tm(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TrustMarkCreate>,
) -> Result<Response, ApiError> {
    let outcome = trustmarks::create_trust_mark(
        &state,
        IssueRequest {
            tmt: req.tmt,
            domain: req.domain,
            autorenew: req.autorenew,
            active: req.active,
            valid_for: req.valid_for,
            renewal_time: req.renewal_time,
            additional_claims: req.additional_claims,
        },
    )
    .await?;
    Ok(match outcome {
        IssueOutcome::Created(row) => {
            (StatusCode::CREATED, Json(TrustMarkOut::from(row))).into_response()
        }
        IssueOutcome::Exists(row) => {
            (StatusCode::FORBIDDEN, Json(TrustMarkOut::from(row))).into_response()
        }
    })
}

#[derive(Deserialize)]
struct TrustMarkListAdminQuery {
    domain: Option<String>,
}

async fn list_tms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrustMarkListAdminQuery>,
) -> Result<Json<Vec<TrustMarkOut>>, ApiError> {
    let rows = match query.domain {
        Some(domain) => state.db.list_trust_marks_for_domain(&domain),
        None => state.db.list_trust_marks(),
    }
    .map_err(FederationError::from)?;
    Ok(Json(rows.into_iter().map(TrustMarkOut::from).collect()))
}

async fn renew_tm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TrustMarkOut>, ApiError> {
    let row = trustmarks::renew_trust_mark(&state, id).await?;
    Ok(Json(row.into()))
}

#[derive(Deserialize)]
struct TrustMarkUpdate {
    autorenew: Option<bool>,
    active: Option<bool>,
    additional_claims: Option<Value>,
}

async fn update_tm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<TrustMarkUpdate>,
) -> Result<Json<TrustMarkOut>, ApiError> {
    let row = trustmarks::update_trust_mark(
        &state,
        id,
        UpdateRequest {
            autorenew: req.autorenew,
            active: req.active,
            additional_claims: req.additional_claims,
        },
    )
    .await?;
    Ok(Json(row.into()))
}

// ── Admin: subordinates ────────────────────────────────────────────────

#[derive(Serialize)]
struct SubordinateOut {
    id: i64,
    entityid: String,
    metadata: Value,
    forced_metadata: Value,
    jwks: Option<Value>,
    required_trustmarks: Option<String>,
    valid_for: i64,
    expire_at: i64,
    autorenew: bool,
    active: bool,
    additional_claims: Option<Value>,
}

impl From<SubordinateRow> for SubordinateOut {
    fn from(row: SubordinateRow) -> Self {
        SubordinateOut {
            expire_at: row.expire_at(),
            id: row.id,
            entityid: row.entityid,
            metadata: row.metadata,
            forced_metadata: row.forced_metadata,
            jwks: row.jwks,
            required_trustmarks: row.required_trustmarks,
            valid_for: row.valid_for,
            autorenew: row.autorenew,
            active: row.active,
            additional_claims: row.additional_claims,
        }
    }
}

#[derive(Deserialize)]
struct SubordinateCreate {
    entityid: String,
    metadata: Value,
    forced_metadata: Value,
    jwks: Value,
    required_trustmarks: Option<String>,
    valid_for: Option<i64>,
    autorenew: Option<bool>,
    active: Option<bool>,
    additional_claims: Option<Value>,
}

impl SubordinateCreate {
    fn into_request(self, entityid: String) -> AdmissionRequest {
        AdmissionRequest {
            entityid,
            metadata: self.metadata,
            forced_metadata: self.forced_metadata,
            jwks: self.jwks,
            required_trustmarks: self.required_trustmarks,
            valid_for: self.valid_for,
            autorenew: self.autorenew.unwrap_or(true),
            active: self.active.unwrap_or(true),
            additional_claims: self.additional_claims,
        }
    }
}

async fn create_sub(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubordinateCreate>,
) -> Result<Response, ApiError> {
    let entityid = req.entityid.clone();
    let outcome = admission::add_subordinate(&state, req.into_request(entityid)).await?;
    Ok(match outcome {
        AdmissionOutcome::Created(row) => {
            (StatusCode::CREATED, Json(SubordinateOut::from(row))).into_response()
        }
        AdmissionOutcome::Exists(row) => {
            (StatusCode::FORBIDDEN, Json(SubordinateOut::from(row))).into_response()
        }
    })
}

async fn list_subs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SubordinateOut>>, ApiError> {
    let rows = state.db.list_subordinates().map_err(FederationError::from)?;
    Ok(Json(rows.into_iter().map(SubordinateOut::from).collect()))
}

async fn get_sub(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SubordinateOut>, ApiError> {
    let row = state
        .db
        .get_subordinate(id)
        .map_err(FederationError::from)?
        .ok_or_else(|| FederationError::NotFound(format!("subordinate {id}")))?;
    Ok(Json(row.into()))
}

async fn update_sub(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<SubordinateCreate>,
) -> Result<Json<SubordinateOut>, ApiError> {
    let entityid = req.entityid.clone();
    let row = admission::update_subordinate(&state, id, req.into_request(entityid)).await?;
    Ok(Json(row.into()))
}

async fn renew_sub(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SubordinateOut>, ApiError> {
    let row = admission::renew_subordinate(&state, id).await?;
    Ok(Json(row.into()))
}

#[derive(Deserialize)]
struct FetchConfigRequest {
    url: String,
}

#[derive(Serialize)]
struct FetchConfigOut {
    metadata: Value,
    jwks: Value,
    authority_hints: Option<Value>,
    trust_marks: Option<Value>,
}

async fn fetch_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchConfigRequest>,
) -> Result<Json<FetchConfigOut>, ApiError> {
    let entity = state.fetcher.fetch_self_verified(&req.url).await?;
    Ok(Json(FetchConfigOut {
        metadata: entity.claims.get("metadata").cloned().unwrap_or_default(),
        jwks: entity.claims.get("jwks").cloned().unwrap_or_default(),
        authority_hints: entity.claims.get("authority_hints").cloned(),
        trust_marks: entity.claims.get("trust_marks").cloned(),
    }))
}

// ── Admin: server artifacts ────────────────────────────────────────────

async fn create_server_entity(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let token = statement::create_entity_configuration(&state.config, &state.keys)?;
    state.cache.set_entity_configuration(&token).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"entity_statement": token})),
    )
        .into_response())
}

async fn create_historical_keys(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let token = statement::create_historical_keys_jws(&state.config, &state.keys)?;
    state.cache.set_historical_keys(&token).await?;
    let count = state.keys.historical_keys().len();
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": format!("Historical keys JWT created with {count} keys")
        })),
    )
        .into_response())
}
