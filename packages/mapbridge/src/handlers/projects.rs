use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use mapbridge_proto::ListError;
use tracing::{error, info};

use crate::AppState;
use crate::auth::AuthUser;
use crate::projects::{self, ArchiveError};

/// `GET /api/project/files/{project}`: recursive listing of the caller's project.
pub async fn list_project_files(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project): Path<String>,
) -> Response {
    let dir = match projects::project_dir(&state.storage, &user.username, &project) {
        Ok(dir) => dir,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match projects::list_project(dir).await {
        Ok(files) => Json(serde_json::json!({ "project": project, "files": files })).into_response(),
        Err(ListError::NotFound(_)) | Err(ListError::NotADirectory(_)) => {
            error_response(StatusCode::NOT_FOUND, format!("project not found: {}", project))
        }
        Err(e) => {
            error!(user = %user.username, project = %project, "Failed to list project: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `DELETE /api/project/delete/{project}`: remove the caller's project.
pub async fn delete_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project): Path<String>,
) -> Response {
    let dir = match projects::project_dir(&state.storage, &user.username, &project) {
        Ok(dir) => dir,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match projects::delete_project(&dir).await {
        Ok(true) => {
            info!(user = %user.username, project = %project, "Project deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, format!("project not found: {}", project)),
        Err(e) => {
            error!(user = %user.username, project = %project, "Failed to delete project: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `GET /api/project/download/{project}`: the caller's project as a zip
/// archive. Metadata is not included.
pub async fn download_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project): Path<String>,
) -> Response {
    let dir = match projects::project_dir(&state.storage, &user.username, &project) {
        Ok(dir) => dir,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match projects::archive_project(dir).await {
        Ok(archive) => {
            info!(user = %user.username, project = %project, bytes = archive.len(), "Project downloaded");
            let disposition = format!("attachment; filename=\"{}.zip\"", project.replace('"', "_"));
            (
                [
                    (header::CONTENT_TYPE, "application/zip".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                archive,
            )
                .into_response()
        }
        Err(ArchiveError::Listing(ListError::NotFound(_) | ListError::NotADirectory(_))) => {
            error_response(StatusCode::NOT_FOUND, format!("project not found: {}", project))
        }
        Err(e) => {
            error!(user = %user.username, project = %project, "Failed to archive project: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
