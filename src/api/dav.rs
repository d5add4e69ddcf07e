//! Enough WebDAV for clients that mount the drive: PUT, GET, DELETE,
//! MKCOL and MOVE. PUT goes through the user's default local policy.

use actix_web::error::ErrorBadRequest;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use log::debug;

use crate::api::{header_handler, read_payload};
use crate::app_state::AppState;

const DAV_PREFIX: &str = "/dav";

fn logical_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// `Destination` may be an absolute URL or a path; either way it must point
/// back into the DAV tree.
pub fn destination_path(req: &HttpRequest) -> Result<String, Error> {
    let raw = req
        .headers()
        .get("Destination")
        .ok_or_else(|| ErrorBadRequest("Missing Destination header"))?
        .to_str()
        .map_err(|_| ErrorBadRequest("Invalid Destination header"))?;
    let path = match url::Url::parse(raw) {
        Ok(url) => url.path().to_string(),
        Err(_) => raw.to_string(),
    };
    let decoded = percent_encoding::percent_decode_str(&path).decode_utf8_lossy().into_owned();
    let inner = decoded
        .strip_prefix(DAV_PREFIX)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .ok_or_else(|| ErrorBadRequest("Destination is outside the DAV tree"))?;
    Ok(logical_path(inner))
}

pub async fn put(
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let path = logical_path(&path);
    let data = read_payload(payload).await?;
    debug!("DAV PUT {} ({} bytes)", path, data.len());

    app_state.coordinator.upload_direct(context.user_id, &path, data).await?;
    Ok(HttpResponse::Created().finish())
}

pub async fn get(
    req: HttpRequest,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let (_, data) = app_state.coordinator.download(context.user_id, &logical_path(&path)).await?;
    Ok(HttpResponse::Ok().content_type("application/octet-stream").body(data))
}

pub async fn delete(
    req: HttpRequest,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    app_state.coordinator.tree().delete_path(context.user_id, &logical_path(&path))?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn mkcol(
    req: HttpRequest,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    app_state.coordinator.quota().ensure_user(context.user_id)?;
    app_state.coordinator.tree().mkdir(context.user_id, &logical_path(&path))?;
    Ok(HttpResponse::Created().finish())
}

pub async fn move_entry(
    req: HttpRequest,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let to = destination_path(&req)?;
    app_state.coordinator.tree().move_path(context.user_id, &logical_path(&path), &to)?;
    Ok(HttpResponse::Created().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_destination_path() {
        let req = TestRequest::default()
            .insert_header(("Destination", "http://drive.test/dav/docs/new%20name.txt"))
            .to_http_request();
        assert_eq!(destination_path(&req).unwrap(), "/docs/new name.txt");

        let req = TestRequest::default().insert_header(("Destination", "/dav/a.txt")).to_http_request();
        assert_eq!(destination_path(&req).unwrap(), "/a.txt");

        let req = TestRequest::default().insert_header(("Destination", "/elsewhere/a.txt")).to_http_request();
        assert!(destination_path(&req).is_err());
    }
}
