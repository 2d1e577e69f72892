use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::protocol::{API_PREFIX, DEFAULT_RECENT_LIMIT, MAX_RECENT_LIMIT};
use shared::types::{ScanKey, StoredScan};
use crate::error::StoreError;
use crate::store_manager::StoreHandle;

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Deserialize)]
pub struct RecentQuery {
    pub limit: Option<u32>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/scans"), get(get_recent))
        .route(&format!("{API_PREFIX}/scans/count"), get(get_count))
        .route(&format!("{API_PREFIX}/scans/:ip/:port/:service"), get(get_scan))
        .with_state(state)
}

fn internal_error(e: StoreError) -> StatusCode {
    tracing::error!(error = %e, "Failed to query scans");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn get_recent(
    State(state): State<AppState>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<StoredScan>>, StatusCode> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);

    state.store.recent(limit).await.map(Json).map_err(internal_error)
}

async fn get_count(State(state): State<AppState>) -> Result<Json<CountResponse>, StatusCode> {
    state
        .store
        .count_keys()
        .await
        .map(|count| Json(CountResponse { count }))
        .map_err(internal_error)
}

async fn get_scan(
    State(state): State<AppState>,
    Path((ip, port, service)): Path<(String, u16, String)>,
) -> Result<Json<StoredScan>, StatusCode> {
    state
        .store
        .get(ScanKey { ip, port, service })
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::CanonicalRecord;
    use crate::store::ScanDb;

    async fn seeded_state() -> AppState {
        let store = StoreHandle::spawn(ScanDb::open_in_memory().unwrap());
        for (port, ts) in [(80u16, 100i64), (443, 200), (22, 50)] {
            store
                .upsert(CanonicalRecord {
                    key: ScanKey {
                        ip: "192.0.2.1".to_string(),
                        port,
                        service: "svc".to_string(),
                    },
                    timestamp: ts,
                    response: format!("port {}", port),
                })
                .await
                .unwrap();
        }
        AppState { store }
    }

    #[tokio::test]
    async fn test_recent_respects_limit() {
        let state = seeded_state().await;
        let Json(scans) = get_recent(State(state), Query(RecentQuery { limit: Some(2) }))
            .await
            .unwrap();
        let ports: Vec<u16> = scans.iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![443, 80]);
    }

    #[tokio::test]
    async fn test_count() {
        let state = seeded_state().await;
        let Json(body) = get_count(State(state)).await.unwrap();
        assert_eq!(body.count, 3);
    }

    #[tokio::test]
    async fn test_get_scan_found_and_missing() {
        let state = seeded_state().await;

        let Json(scan) = get_scan(
            State(state.clone()),
            Path(("192.0.2.1".to_string(), 443, "svc".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(scan.response, "port 443");

        let missing = get_scan(
            State(state),
            Path(("192.0.2.1".to_string(), 8080, "svc".to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(missing, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_store_failure_is_500() {
        let state = seeded_state().await;
        state.store.shutdown().await.unwrap();
        let err = get_count(State(state)).await.unwrap_err();
        assert_eq!(err, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
