use actix_web::{web, Error, HttpRequest, HttpResponse};
use bytes::Bytes;
use log::{debug, warn};
use serde_json::json;

use crate::app_state::AppState;
use crate::callback::CallbackRequest;
use crate::error::DriveError;
use crate::policy::PolicyId;

/// Completion notice from a storage provider. Authenticated by the driver
/// of the policy named in the path, never by the `User` header.
pub async fn provider_callback(
    req: HttpRequest,
    path: web::Path<(String, PolicyId, String)>,
    body: Bytes,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let (kind, policy_id, session_id) = path.into_inner();
    log_mdc::insert("session", &session_id);
    debug!("Callback from {} for policy {} ({} bytes)", kind, policy_id, body.len());

    let request = CallbackRequest::from_http(&req, body);
    match app_state
        .coordinator
        .handle_callback(&kind, policy_id, &session_id, &request)
        .await
    {
        Ok(ack) => Ok(HttpResponse::Ok().json(ack)),
        Err(e @ DriveError::QuotaExceeded { .. }) => {
            // The session is aborted at this point. A 5xx would make the
            // provider retry against it.
            warn!("Rejected callback for {}: {}", session_id, e);
            Ok(HttpResponse::Conflict().json(json!({ "error": e.code(), "message": e.to_string() })))
        }
        Err(e) => Err(e.into()),
    }
}
