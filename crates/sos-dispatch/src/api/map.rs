use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sos_protocol::{Category, Coordinates, RequestStatus};
use tracing::info;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::error::Error;
use crate::store::Records;

const DEFAULT_LIMIT: usize = 200;
const MAX_LIMIT: usize = 500;

/// Two decimals, roughly a kilometre.
const COORDINATE_DECIMALS: i32 = 2;

const OPEN: [RequestStatus; 2] = [
    RequestStatus::Pending,
    RequestStatus::PendingManualAssignment,
];

#[derive(Debug, Deserialize)]
pub struct HotspotQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

/// An open request as shown on the map. Carries no description and no
/// precise location.
#[derive(Debug, Serialize)]
pub struct MapHotspot {
    pub id: Uuid,
    pub coordinates: Coordinates,
    pub request_type: Category,
    pub timestamp: DateTime<Utc>,
}

fn coarsen(c: Coordinates) -> Coordinates {
    let scale = 10f64.powi(COORDINATE_DECIMALS);
    Coordinates::new((c.lat * scale).round() / scale, (c.lng * scale).round() / scale)
}

/// GET /api/v1/map/hotspots
pub async fn get_hotspots(
    State(records): State<Records>,
    Query(query): Query<HotspotQuery>,
) -> Result<Json<Vec<MapHotspot>>, ApiError> {
    let limit = query.limit.clamp(1, MAX_LIMIT);
    let requests = records
        .recent_requests(&OPEN, limit)
        .await
        .map_err(Error::from)?;

    let hotspots: Vec<MapHotspot> = requests
        .into_iter()
        .map(|r| MapHotspot {
            id: r.request_id,
            coordinates: coarsen(r.coordinates),
            request_type: r.category,
            timestamp: r.created_at,
        })
        .collect();

    info!(count = hotspots.len(), limit, "served map hotspots");
    Ok(Json(hotspots))
}
