//! HTTP route handlers.
//!
//! The core is blocking (backend transfers, grid builds, rasterisation);
//! every handler hops onto the blocking pool before calling into it.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use sparmap_core::geo::{FBox, FPoint};
use sparmap_render::{HeatmapRenderer, RenderRequest};
use sparmap_session::SessionManager;

use crate::error::{Result, ServerError};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub renderer: Arc<HeatmapRenderer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", get(query))
        .route("/heatmap", get(heatmap))
        .route("/pos", get(pos))
        .route("/load", get(load))
        .route("/clearsession", get(clearsession))
        .with_state(state)
}

async fn blocking<T, F>(op: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Internal {
            op,
            message: e.to_string(),
        })?
}

#[derive(Deserialize)]
struct QueryParams {
    q: String,
}

async fn query(
    State(st): State<AppState>,
    Query(p): Query<QueryParams>,
) -> Result<Json<serde_json::Value>> {
    let manager = st.manager.clone();
    let (sid, bounds) = blocking("query", move || {
        let (sid, requestor) = manager
            .get_or_create_session(&p.q)
            .map_err(ServerError::session("query"))?;
        let bounds = requestor.bounds().map_err(ServerError::session("query"))?;
        Ok((sid, bounds))
    })
    .await?;

    let bounds_json = if bounds.is_valid() {
        json!([[bounds.ll.x, bounds.ll.y], [bounds.ur.x, bounds.ur.y]])
    } else {
        json!(null)
    };
    Ok(Json(json!({ "qid": sid, "bounds": bounds_json })))
}

#[derive(Deserialize)]
struct HeatmapParams {
    id: String,
    bbox: String,
    width: u32,
    height: u32,
}

async fn heatmap(State(st): State<AppState>, Query(p): Query<HeatmapParams>) -> Result<Response> {
    let view = RenderRequest {
        bbox: parse_bbox(&p.bbox)?,
        width: p.width,
        height: p.height,
    };
    let manager = st.manager.clone();
    let renderer = st.renderer.clone();
    let png = blocking("heatmap", move || {
        let requestor = manager
            .get_session(&p.id)
            .map_err(ServerError::session("heatmap"))?;
        renderer
            .render(&requestor, &view)
            .map_err(ServerError::render("heatmap"))
    })
    .await?;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

#[derive(Deserialize)]
struct PosParams {
    id: String,
    x: f32,
    y: f32,
    rad: f64,
}

async fn pos(
    State(st): State<AppState>,
    Query(p): Query<PosParams>,
) -> Result<Json<serde_json::Value>> {
    let manager = st.manager.clone();
    let result = blocking("pos", move || {
        let requestor = manager
            .get_session(&p.id)
            .map_err(ServerError::session("pos"))?;
        requestor
            .get_nearest_with_attrs(FPoint::new(p.x, p.y), p.rad)
            .map_err(ServerError::session("pos"))
    })
    .await?;

    Ok(Json(match result {
        Some((hit, attrs)) => {
            let attrs: Vec<_> = attrs.into_iter().map(|(k, v)| json!([k, v])).collect();
            json!({
                "hit": true,
                "ll": [hit.pos.x, hit.pos.y],
                "attrs": attrs,
            })
        }
        None => json!({ "hit": false }),
    }))
}

async fn load(State(st): State<AppState>) -> Result<Json<serde_json::Value>> {
    let manager = st.manager.clone();
    let path = blocking("load", move || {
        manager.persist_cache().map_err(ServerError::session("load"))
    })
    .await?;
    Ok(Json(match path {
        Some(p) => json!({ "persisted": p.display().to_string() }),
        None => json!({ "persisted": null }),
    }))
}

#[derive(Deserialize)]
struct ClearParams {
    id: Option<String>,
}

async fn clearsession(
    State(st): State<AppState>,
    Query(p): Query<ClearParams>,
) -> Result<Json<serde_json::Value>> {
    let manager = st.manager.clone();
    let cleared = blocking("clearsession", move || {
        Ok(match p.id {
            Some(id) => usize::from(manager.clear_session(&id)),
            None => manager.clear_all(),
        })
    })
    .await?;
    Ok(Json(json!({ "cleared": cleared })))
}

/// Parse a WMS-style `x0,y0,x1,y1` bbox in web-Mercator units.
fn parse_bbox(s: &str) -> Result<FBox> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ServerError::BadRequest(format!("bad bbox: {e}")))?;
    if parts.len() != 4 {
        return Err(ServerError::BadRequest(format!(
            "bbox needs 4 coordinates, got {}",
            parts.len()
        )));
    }
    let b = FBox::new(FPoint::new(parts[0], parts[1]), FPoint::new(parts[2], parts[3]));
    if !b.is_valid() {
        return Err(ServerError::BadRequest("inverted bbox".into()));
    }
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bbox() {
        let b = parse_bbox("1,2,3,4").unwrap();
        assert_eq!(b.ll, FPoint::new(1.0, 2.0));
        assert_eq!(b.ur, FPoint::new(3.0, 4.0));
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("a,b,c,d").is_err());
        assert!(parse_bbox("3,2,1,4").is_err());
    }
}
