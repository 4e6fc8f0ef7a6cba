//! Matching engine.
//!
//! Pairs help requests with volunteers, either automatically when a request
//! is published or when a volunteer accepts one by hand. A volunteer only
//! ever moves `available → busy` through `Records::claim_volunteer`, which is
//! what keeps a volunteer from being assigned twice.

pub mod validate;

use std::sync::Arc;

use async_trait::async_trait;
use sos_protocol::{
    Assignment, AssignmentsCreated, Availability, HelpRequest, RequestStatus,
    VolunteerStatusChanged,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MatchingSettings;
use crate::error::{Error, Rejection, Result};
use crate::event_bus::{BusClient, MessageHandler};
use crate::store::{GeoLookup, Records, StoreError};

const ASSIGNABLE: [RequestStatus; 2] = [
    RequestStatus::Pending,
    RequestStatus::PendingManualAssignment,
];

/// How an automatically matched request ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Assigned(Assignment),
    /// Nobody qualified nearby; waits for a volunteer to accept it.
    PendingManual,
    /// The nearest candidate was claimed by someone else first. The request
    /// stays `pending`.
    VolunteerContended { volunteer_id: Uuid },
    /// The request id was already persisted by an earlier delivery; nothing
    /// was done.
    Duplicate,
}

#[derive(Clone)]
pub struct Dispatcher {
    records: Records,
    geo: Arc<dyn GeoLookup>,
    bus: BusClient,
    settings: MatchingSettings,
}

impl Dispatcher {
    pub fn new(
        records: Records,
        geo: Arc<dyn GeoLookup>,
        bus: BusClient,
        settings: MatchingSettings,
    ) -> Self {
        Self {
            records,
            geo,
            bus,
            settings,
        }
    }

    /// Automatic path for a request seen on `sos-requests:new`.
    pub async fn process_new_request(&self, request: HelpRequest) -> Result<MatchOutcome> {
        let request = validate::new_request(request).inspect_err(|e| {
            warn!(error = %e, "dropping invalid help request");
        })?;
        let request_id = request.request_id;
        info!(request_id = %request_id, category = %request.category, "processing new request");

        match self.records.insert_request(&request).await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                warn!(request_id = %request_id, "request already received, dropping redelivery");
                return Ok(MatchOutcome::Duplicate);
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "failed to persist request");
                return Err(e.into());
            }
        }

        let candidates = self
            .geo
            .find_nearby(request.coordinates, self.settings.radius_km, &[request.category])
            .await
            .inspect_err(|e| {
                error!(request_id = %request_id, error = %e, "volunteer lookup failed");
            })?;

        let Some(candidate) = candidates.into_iter().next() else {
            let moved = self
                .records
                .transition_request(
                    request_id,
                    &[RequestStatus::Pending],
                    RequestStatus::PendingManualAssignment,
                )
                .await?;
            if !moved {
                warn!(request_id = %request_id, "request left pending before manual fallback");
            }
            info!(request_id = %request_id, "no volunteer nearby, awaiting manual assignment");
            return Ok(MatchOutcome::PendingManual);
        };

        let volunteer_id = candidate.volunteer_id;
        if !self.records.claim_volunteer(volunteer_id, request_id).await? {
            warn!(
                request_id = %request_id,
                volunteer_id = %volunteer_id,
                "volunteer no longer available, assignment aborted"
            );
            return Ok(MatchOutcome::VolunteerContended { volunteer_id });
        }

        let assignment = Assignment::new(request_id, volunteer_id);
        if let Err(e) = self.bus.publish::<AssignmentsCreated>(&assignment).await {
            error!(
                request_id = %request_id,
                volunteer_id = %volunteer_id,
                error = %e,
                "failed to publish assignment"
            );
            self.release_volunteer(volunteer_id, request_id).await;
            return Err(e.into());
        }

        // The assignment is out. From here a failure is a reconciliation gap.
        let marked = self
            .records
            .mark_assigned(
                request_id,
                &[RequestStatus::Pending],
                assignment.assignment_id,
                volunteer_id,
            )
            .await
            .inspect_err(|e| {
                error!(
                    request_id = %request_id,
                    assignment_id = %assignment.assignment_id,
                    error = %e,
                    "reconciliation gap: assignment published but request not marked assigned"
                );
            })?;
        if !marked {
            error!(
                request_id = %request_id,
                assignment_id = %assignment.assignment_id,
                "reconciliation gap: request left pending before it could be marked assigned"
            );
            return Err(Error::ConcurrencyConflict(format!(
                "request {request_id} changed state during assignment"
            )));
        }

        info!(
            request_id = %request_id,
            volunteer_id = %volunteer_id,
            assignment_id = %assignment.assignment_id,
            "request assigned"
        );
        Ok(MatchOutcome::Assigned(assignment))
    }

    /// Manual path: `volunteer_id` takes `request_id`.
    ///
    /// Preconditions are checked in order and reported as a [`Rejection`]
    /// without touching any record. Past the volunteer claim, a failure is
    /// compensated once, best-effort.
    pub async fn accept(&self, request_id: Uuid, volunteer_id: Uuid) -> Result<Assignment> {
        let request = self
            .records
            .get_request(request_id)
            .await?
            .ok_or(Rejection::RequestNotFound)?;
        if !request.status.is_assignable() {
            return Err(Rejection::RequestNotAssignable(request.status).into());
        }

        let volunteer = self
            .records
            .get_volunteer(volunteer_id)
            .await?
            .ok_or(Rejection::VolunteerNotFound)?;
        if !volunteer.is_verified {
            return Err(Rejection::VolunteerNotVerified.into());
        }
        if volunteer.status != Availability::Available {
            return Err(Rejection::VolunteerUnavailable(volunteer.status).into());
        }
        if !volunteer.has_skill(request.category) {
            return Err(Rejection::MissingSkill(request.category).into());
        }

        if !self.records.claim_volunteer(volunteer_id, request_id).await? {
            warn!(
                request_id = %request_id,
                volunteer_id = %volunteer_id,
                "volunteer became unavailable before assignment"
            );
            return Err(Rejection::VolunteerContended.into());
        }

        let assignment = Assignment::new(request_id, volunteer_id);

        // Claim the request before anything is published so two volunteers
        // racing for it cannot both get an assignment out.
        let claimed = match self
            .records
            .mark_assigned(request_id, &ASSIGNABLE, assignment.assignment_id, volunteer_id)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "failed to mark request assigned");
                self.release_volunteer(volunteer_id, request_id).await;
                return Err(e.into());
            }
        };
        if !claimed {
            warn!(
                request_id = %request_id,
                volunteer_id = %volunteer_id,
                "request taken by another volunteer"
            );
            self.release_volunteer(volunteer_id, request_id).await;
            return Err(Rejection::RequestContended.into());
        }

        if let Err(e) = self.bus.publish::<AssignmentsCreated>(&assignment).await {
            error!(
                request_id = %request_id,
                assignment_id = %assignment.assignment_id,
                error = %e,
                "failed to publish assignment, rolling back"
            );
            self.revert_request(&assignment, request.status).await;
            self.release_volunteer(volunteer_id, request_id).await;
            return Err(e.into());
        }

        info!(
            request_id = %request_id,
            volunteer_id = %volunteer_id,
            assignment_id = %assignment.assignment_id,
            "request accepted"
        );
        Ok(assignment)
    }

    async fn release_volunteer(&self, volunteer_id: Uuid, request_id: Uuid) {
        match self.records.release_volunteer(volunteer_id, request_id).await {
            Ok(true) => info!(volunteer_id = %volunteer_id, "volunteer released"),
            Ok(false) => warn!(
                volunteer_id = %volunteer_id,
                request_id = %request_id,
                "volunteer not released, no longer busy with this request"
            ),
            Err(e) => error!(
                volunteer_id = %volunteer_id,
                error = %e,
                "failed to release volunteer, left busy"
            ),
        }
    }

    async fn revert_request(&self, assignment: &Assignment, restore: RequestStatus) {
        let request_id = assignment.request_id;
        match self
            .records
            .revert_assignment(request_id, assignment.assignment_id, restore)
            .await
        {
            Ok(true) => info!(request_id = %request_id, status = %restore, "request reverted"),
            Ok(false) => warn!(request_id = %request_id, "request not reverted, assignment changed"),
            Err(e) => error!(
                request_id = %request_id,
                error = %e,
                "failed to revert request, left assigned"
            ),
        }
    }
}

#[async_trait]
impl MessageHandler<HelpRequest> for Dispatcher {
    async fn handle(&self, request: HelpRequest) -> anyhow::Result<()> {
        self.process_new_request(request).await?;
        Ok(())
    }
}

/// Availability changes are read from the store at match time, so the
/// engine only records them. A volunteer the store does not know is logged.
#[async_trait]
impl MessageHandler<VolunteerStatusChanged> for Dispatcher {
    async fn handle(&self, update: VolunteerStatusChanged) -> anyhow::Result<()> {
        match self.records.get_volunteer(update.volunteer_id).await? {
            Some(volunteer) if volunteer.status == update.status => {
                info!(
                    volunteer_id = %update.volunteer_id,
                    status = %update.status,
                    "volunteer status update"
                );
            }
            Some(volunteer) => {
                debug!(
                    volunteer_id = %update.volunteer_id,
                    announced = %update.status,
                    stored = %volunteer.status,
                    "volunteer status update superseded by a later change"
                );
            }
            None => {
                warn!(volunteer_id = %update.volunteer_id, "status update for unknown volunteer");
            }
        }
        Ok(())
    }
}
