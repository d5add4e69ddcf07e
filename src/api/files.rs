use actix_web::{web, Error, HttpRequest, HttpResponse};
use log::info;
use serde::{Deserialize, Serialize};

use crate::api::header_handler;
use crate::app_state::AppState;
use crate::tree::FileView;

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default = "root_path")]
    pub path: String,
}

fn root_path() -> String {
    "/".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DirectoryRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResponse {
    #[serde(flatten)]
    pub entry: FileView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileView>>,
}

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    pub quota: u64,
    pub used: u64,
    pub reserved: u64,
    pub available: u64,
}

/// A file's metadata, or a directory with its children.
pub async fn get_entry(
    req: HttpRequest,
    query: web::Query<PathQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let tree = app_state.coordinator.tree();
    app_state.coordinator.quota().ensure_user(context.user_id)?;

    let entry = tree.resolve(context.user_id, &query.path)?;
    let children = if entry.is_dir() {
        Some(tree.list(context.user_id, &query.path)?.iter().map(FileView::from).collect())
    } else {
        None
    };
    Ok(HttpResponse::Ok().json(EntryResponse { entry: FileView::from(&entry), children }))
}

pub async fn download(
    req: HttpRequest,
    query: web::Query<PathQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let (file, data) = app_state.coordinator.download(context.user_id, &query.path).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .insert_header(("Content-Disposition", format!("attachment; filename=\"{}\"", file.name)))
        .body(data))
}

pub async fn delete_entry(
    req: HttpRequest,
    query: web::Query<PathQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let removed = app_state.coordinator.tree().delete_path(context.user_id, &query.path)?;
    info!("Deleted '{}' ({} entries)", query.path, removed.len());
    Ok(HttpResponse::NoContent().finish())
}

pub async fn create_directory(
    req: HttpRequest,
    body: web::Json<DirectoryRequest>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    app_state.coordinator.quota().ensure_user(context.user_id)?;
    let dir = app_state.coordinator.tree().mkdir(context.user_id, &body.path)?;
    Ok(HttpResponse::Created().json(FileView::from(&dir)))
}

pub async fn move_entry(
    req: HttpRequest,
    body: web::Json<MoveRequest>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let moved = app_state.coordinator.tree().move_path(context.user_id, &body.from, &body.to)?;
    Ok(HttpResponse::Ok().json(FileView::from(&moved)))
}

pub async fn quota(req: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let usage = app_state.coordinator.quota().usage(context.user_id)?;
    Ok(HttpResponse::Ok().json(QuotaResponse {
        quota: usage.quota,
        used: usage.used,
        reserved: usage.reserved,
        available: usage.available(),
    }))
}
