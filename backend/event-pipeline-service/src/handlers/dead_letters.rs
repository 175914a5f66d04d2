use actix_web::{web, HttpResponse};
use serde::Deserialize;

use super::AppState;
use crate::error::Result;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// GET /dead-letters?limit=N
///
/// Read-only view of the oldest dead-lettered entries. Nothing is removed.
pub async fn list_dead_letters(
    state: web::Data<AppState>,
    query: web::Query<DeadLetterQuery>,
) -> Result<HttpResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let entries = state.queue.dead_letters(limit).await?;
    Ok(HttpResponse::Ok().json(entries))
}
