use crate::{error::AppError, state::AppState, storage::local::is_stored_file_name};
use actix_web::{web, HttpResponse};
use std::path::Path;

/// Serve a file written by the local audio store, so the URLs it hands out resolve.
pub async fn get_audio_file(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let name = name.into_inner();
    if !is_stored_file_name(&name) {
        return Err(AppError::NotFound(format!("audio file '{}'", name)));
    }

    let directory = state.get_config().storage.directory;
    let bytes = tokio::fs::read(Path::new(&directory).join(&name))
        .await
        .map_err(|_| AppError::NotFound(format!("audio file '{}'", name)))?;

    Ok(HttpResponse::Ok().content_type("audio/wav").body(bytes))
}
