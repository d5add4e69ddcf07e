use actix_web::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use actix_web::{web, Error, HttpRequest, HttpResponse, HttpResponseBuilder};
use log::{debug, info};
use serde::Deserialize;

use crate::api::{header_handler, read_payload};
use crate::app_state::AppState;
use crate::policy::PolicyId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub policy_id: PolicyId,
    /// Destination path of the new file.
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChunkParams {
    pub total: u32,
}

/// 200 response carrying the policy's `allowed_origin`, if it has one.
fn ok_for_policy(app_state: &AppState, policy_id: PolicyId) -> HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    if let Some(origin) = app_state
        .coordinator
        .registry()
        .resolve(policy_id)
        .ok()
        .and_then(|policy| policy.allowed_origin.clone())
    {
        builder.insert_header((ACCESS_CONTROL_ALLOW_ORIGIN, origin));
    }
    builder
}

fn ok_for_session(app_state: &AppState, session_id: &str) -> HttpResponseBuilder {
    match app_state.store.get_pending(session_id) {
        Ok(Some(pending)) => ok_for_policy(app_state, pending.policy_id),
        _ => HttpResponse::Ok(),
    }
}

pub async fn issue_token(
    req: HttpRequest,
    body: web::Json<TokenRequest>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let body = body.into_inner();
    debug!("Upload token requested: policy={}, path={}, size={}", body.policy_id, body.path, body.size);

    let issued = app_state
        .coordinator
        .issue(context.user_id, body.policy_id, &body.path, body.size)
        .await?;
    log_mdc::insert("session", &issued.session_id);
    Ok(ok_for_policy(&app_state, body.policy_id).json(issued))
}

pub async fn put_chunk(
    req: HttpRequest,
    path: web::Path<(String, u32)>,
    params: web::Query<ChunkParams>,
    payload: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let (session_id, index) = path.into_inner();
    log_mdc::insert("session", &session_id);

    let data = read_payload(payload).await?;
    let ack = app_state
        .coordinator
        .put_chunk(context.user_id, &session_id, index, params.total, data)
        .await?;
    Ok(ok_for_session(&app_state, &session_id).json(ack))
}

pub async fn finalize(
    req: HttpRequest,
    session_id: web::Path<String>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let session_id = session_id.into_inner();
    log_mdc::insert("session", &session_id);

    let file = app_state.coordinator.finalize(context.user_id, &session_id).await?;
    Ok(ok_for_session(&app_state, &session_id).json(file))
}

pub async fn cancel(
    req: HttpRequest,
    session_id: web::Path<String>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let session_id = session_id.into_inner();
    log_mdc::insert("session", &session_id);

    app_state.coordinator.cancel(context.user_id, &session_id).await?;
    info!("Upload {} cancelled by its owner", session_id);
    Ok(HttpResponse::NoContent().finish())
}
