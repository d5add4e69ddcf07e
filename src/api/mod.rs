//! HTTP surface: upload sessions, provider callbacks, file management and a
//! minimal WebDAV endpoint.
//!
//! Authentication happens upstream; requests arrive with a numeric `User`
//! header naming the caller. Provider callbacks carry no `User` header and
//! are authenticated by their signature instead.

pub mod upload;
pub mod callback;
pub mod files;
pub mod dav;

use actix_web::error::ErrorBadRequest;
use actix_web::{guard, web, Error, HttpRequest};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::warn;

use crate::metadata::UserId;

/// Caller identity taken from the request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
}

pub(crate) fn header_handler(req: &HttpRequest) -> Result<RequestContext, Error> {
    let user_id = req
        .headers()
        .get("User")
        .ok_or_else(|| ErrorBadRequest("Missing User header"))?
        .to_str()
        .map_err(|_| ErrorBadRequest("Invalid User header value"))?
        .trim()
        .parse::<UserId>()
        .map_err(|_| ErrorBadRequest("User header must be a numeric id"))?;

    log_mdc::insert("user", user_id.to_string());
    Ok(RequestContext { user_id })
}

/// Collect a streamed request body.
pub(crate) async fn read_payload(mut payload: web::Payload) -> Result<Bytes, Error> {
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| {
            warn!("Error reading payload chunk: {}", e);
            ErrorBadRequest("Error reading payload")
        })?;
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn dav_method(name: &'static str) -> impl guard::Guard {
    guard::fn_guard(move |ctx| ctx.head().method.as_str() == name)
}

/// Register every route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/upload/token", web::post().to(upload::issue_token))
        .route("/upload/chunk/{session_id}/{index}", web::put().to(upload::put_chunk))
        .route("/upload/finalize/{session_id}", web::post().to(upload::finalize))
        .route("/upload/{session_id}", web::delete().to(upload::cancel))
        .route("/callback/{kind}/{policy_id}/{session_id}", web::post().to(callback::provider_callback))
        .route("/files", web::get().to(files::get_entry))
        .route("/files", web::delete().to(files::delete_entry))
        .route("/files/content", web::get().to(files::download))
        .route("/files/directory", web::post().to(files::create_directory))
        .route("/files/move", web::post().to(files::move_entry))
        .route("/user/quota", web::get().to(files::quota))
        .route("/dav/{path:.*}", web::put().to(dav::put))
        .route("/dav/{path:.*}", web::get().to(dav::get))
        .route("/dav/{path:.*}", web::delete().to(dav::delete))
        .route("/dav/{path:.*}", web::route().guard(dav_method("MKCOL")).to(dav::mkcol))
        .route("/dav/{path:.*}", web::route().guard(dav_method("MOVE")).to(dav::move_entry));
}
