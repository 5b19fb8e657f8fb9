use actix_web::web;
use actix_web::HttpResponse;
use actix_web::{error, Responder, Result};
use serde::Deserialize;
use system::DocumentId;

use crate::admin::SessionDescription;
use crate::server::ServerState;

pub fn configure_admin_handlers(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .service(web::resource("/sessions").route(web::get().to(list_sessions)))
            .service(web::resource("/sessions/{document_id}").route(web::get().to(show_session))),
    );
}

async fn list_sessions(server: web::Data<ServerState>) -> Result<impl Responder> {
    let sessions: Vec<SessionDescription> = server
        .registry
        .live_sessions()
        .iter()
        .map(|session| SessionDescription::describe(session))
        .collect();
    Ok(HttpResponse::Ok().json(sessions))
}

#[derive(Deserialize)]
pub struct ShowSessionParam {
    document_id: String,
}

async fn show_session(
    path: web::Path<ShowSessionParam>,
    server: web::Data<ServerState>,
) -> Result<impl Responder> {
    let document_id = path
        .document_id
        .parse::<DocumentId>()
        .map_err(|_| error::ErrorBadRequest("invalid document id"))?;
    let session = server
        .registry
        .get(document_id)
        .ok_or_else(|| error::ErrorNotFound("no live session"))?;
    Ok(HttpResponse::Ok().json(SessionDescription::describe(&session)))
}
