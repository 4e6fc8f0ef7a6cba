use async_trait::async_trait;
use serde_json::json;
use sos_protocol::{Availability, Category, Coordinates, Volunteer};

use super::documents::Filter;
use super::records::{Records, VOLUNTEERS, from_document};
use super::StoreResult;

/// Nearest-match lookup over volunteers.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// Verified, available volunteers within `radius_km` of `center` holding
    /// every skill in `required_skills`, nearest first.
    async fn find_nearby(
        &self,
        center: Coordinates,
        radius_km: f64,
        required_skills: &[Category],
    ) -> StoreResult<Vec<Volunteer>>;
}

/// Linear scan over the document store. Fine for the in-process backend; a
/// production deployment plugs a geospatial index in behind the trait.
pub struct StoreGeoLookup {
    records: Records,
}

impl StoreGeoLookup {
    pub fn new(records: Records) -> Self {
        Self { records }
    }
}

#[async_trait]
impl GeoLookup for StoreGeoLookup {
    async fn find_nearby(
        &self,
        center: Coordinates,
        radius_km: f64,
        required_skills: &[Category],
    ) -> StoreResult<Vec<Volunteer>> {
        let filter = required_skills.iter().fold(
            Filter::new()
                .eq("is_verified", json!(true))
                .eq("status", json!(Availability::Available)),
            |filter, skill| filter.contains("skills", json!(skill)),
        );

        let docs = self
            .records
            .documents()
            .find(VOLUNTEERS, &filter, None, None)
            .await?;

        let mut nearby = Vec::with_capacity(docs.len());
        for doc in docs {
            let volunteer: Volunteer = from_document(doc)?;
            let Some(location) = volunteer.current_location else {
                continue;
            };
            let distance = center.distance_km(&location);
            if distance <= radius_km {
                nearby.push((distance, volunteer));
            }
        }

        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(nearby.into_iter().map(|(_, v)| v).collect())
    }
}
