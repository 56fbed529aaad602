use std::sync::Arc;
use std::time::Duration;

use actix_web::{delete, get, middleware, post, web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::cache::MemoryStore;
use crate::db::CompanyRecord;
use crate::pipeline::{Orchestrator, Source};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct ScrapeRequest {
    #[serde(alias = "identifier")]
    pub idno: String,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct ScrapeResponse {
    pub success: bool,
    pub message: String,
    pub data: Option<CompanyRecord>,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub idno: String,
    pub status: Option<String>,
    pub in_progress: bool,
    pub data: Option<CompanyRecord>,
}

fn detail(msg: &str) -> serde_json::Value {
    serde_json::json!({ "detail": msg })
}

/// Token verification happens upstream; here we only require that one was sent.
/// The scheme is case-insensitive.
fn has_bearer(req: &HttpRequest) -> bool {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim_start().split_once(' '))
        .is_some_and(|(scheme, token)| {
            scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty()
        })
}

#[get("/")]
async fn health() -> impl Responder {
    web::Json(serde_json::json!({ "service": "Scraper Service", "status": "running" }))
}

#[post("/scrape/")]
async fn scrape(
    req: HttpRequest,
    payload: web::Json<ScrapeRequest>,
    orch: web::Data<Orchestrator>,
) -> HttpResponse {
    if !has_bearer(&req) {
        return HttpResponse::Unauthorized().json(detail("Authentication required"));
    }
    let body = payload.into_inner();
    let idno = body.idno.trim();
    if idno.is_empty() {
        return HttpResponse::BadRequest().json(detail("idno must not be empty"));
    }

    match orch.request(idno, body.force_refresh).await {
        Ok(outcome) => HttpResponse::Ok().json(ScrapeResponse {
            success: true,
            message: outcome.message.to_string(),
            cached: outcome.source == Source::Cached,
            data: outcome.record,
        }),
        Err(e) => {
            error!(idno = %idno, error = %e, "cache read failed");
            HttpResponse::ServiceUnavailable().json(detail("Cache unavailable, retry later"))
        }
    }
}

#[get("/scrape/{idno}")]
async fn scrape_status(
    req: HttpRequest,
    path: web::Path<String>,
    orch: web::Data<Orchestrator>,
) -> HttpResponse {
    if !has_bearer(&req) {
        return HttpResponse::Unauthorized().json(detail("Authentication required"));
    }
    let idno = path.into_inner();
    match orch.status(&idno).await {
        Ok(view) => HttpResponse::Ok().json(StatusResponse {
            idno,
            status: view.marker,
            in_progress: view.in_flight,
            data: view.record,
        }),
        Err(e) => {
            error!(idno = %idno, error = %e, "status read failed");
            HttpResponse::ServiceUnavailable().json(detail("Cache unavailable, retry later"))
        }
    }
}

#[delete("/scrape/{idno}")]
async fn invalidate(
    req: HttpRequest,
    path: web::Path<String>,
    orch: web::Data<Orchestrator>,
) -> HttpResponse {
    if !has_bearer(&req) {
        return HttpResponse::Unauthorized().json(detail("Authentication required"));
    }
    let idno = path.into_inner();
    match orch.invalidate(&idno).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => {
            error!(idno = %idno, error = %e, "cache invalidation failed");
            HttpResponse::ServiceUnavailable().json(detail("Cache unavailable, retry later"))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(scrape)
        .service(scrape_status)
        .service(invalidate);
}

pub async fn serve(bind: &str, orch: Orchestrator, store: Arc<MemoryStore>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tick.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!("purged {} expired cache entries", purged);
            }
        }
    });

    info!("listening on {}", bind);
    let data = web::Data::new(orch);
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(data.clone())
            .configure(configure)
    })
    .bind(bind)?
    .run()
    .await?;
    Ok(())
}

// ── Tests ──
