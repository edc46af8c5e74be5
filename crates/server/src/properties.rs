use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use propline_agent::IntakeRuntime;
use propline_core::domain::principal::PrincipalId;
use propline_core::domain::property::{address_key, PropertyRecord, PropertyVerification};
use propline_core::errors::{ApplicationError, InterfaceError};
use propline_db::RepositoryError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct PropertiesState {
    runtime: Arc<IntakeRuntime>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationView {
    pub role_confirmed: String,
    pub account_name: String,
    pub account_number: String,
    pub verified_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyView {
    pub id: String,
    pub principal: String,
    pub address: String,
    pub status: &'static str,
    pub preferences: Option<String>,
    pub role: Option<String>,
    pub registration_cycle: i64,
    pub verification: Option<VerificationView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PropertyRecord> for PropertyView {
    fn from(record: PropertyRecord) -> Self {
        Self {
            id: record.id.0,
            principal: record.principal_id.0,
            address: record.address,
            status: record.status.as_str(),
            preferences: record.preferences,
            role: record.role,
            registration_cycle: record.registration_cycle,
            verification: record.verification.map(|verification| VerificationView {
                role_confirmed: verification.confirmed_role,
                account_name: verification.payout_account_name,
                account_number: verification.payout_account_number,
                verified_at: verification.verified_at,
            }),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub address: String,
    pub role_confirmed: String,
    pub account_name: String,
    pub account_number: String,
    #[serde(default)]
    pub principal: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub property: PropertyView,
    pub graph_synced: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn router(runtime: Arc<IntakeRuntime>) -> Router {
    Router::new()
        .route("/api/v1/properties", get(list_properties))
        .route("/api/v1/properties/verify", post(verify_property))
        .with_state(PropertiesState { runtime })
}

pub async fn list_properties(State(state): State<PropertiesState>) -> ApiResult<Vec<PropertyView>> {
    let correlation_id = correlation_id();
    let properties = state
        .runtime
        .writer()
        .intake()
        .list_properties()
        .await
        .map_err(|error| reject(repository_error(error).into_interface(&correlation_id)))?;

    Ok(Json(properties.into_iter().map(PropertyView::from).collect()))
}

pub async fn verify_property(
    State(state): State<PropertiesState>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<VerifyResponse> {
    let correlation_id = correlation_id();
    let fail = |error: ApplicationError| reject(error.into_interface(&correlation_id));

    let address = request.address.trim();
    let role = request.role_confirmed.trim();
    let account_name = request.account_name.trim();
    let account_number = request.account_number.trim();
    if [address, role, account_name, account_number].iter().any(|value| value.is_empty()) {
        return Err(reject(InterfaceError::BadRequest {
            message: "address, roleConfirmed, accountName and accountNumber are required"
                .to_string(),
            correlation_id: correlation_id.clone(),
        }));
    }
    let principal = match request.principal.as_deref() {
        Some(raw) => Some(PrincipalId::parse(raw).map_err(|error| {
            reject(InterfaceError::BadRequest {
                message: error.to_string(),
                correlation_id: correlation_id.clone(),
            })
        })?),
        None => None,
    };

    let writer = state.runtime.writer();
    let candidates = writer
        .intake()
        .find_properties_by_address_key(&address_key(address))
        .await
        .map_err(|error| fail(repository_error(error)))?;
    let target = select_property(candidates, principal.as_ref(), address).map_err(fail)?;

    let receipt = writer
        .verify(
            &target.id,
            PropertyVerification {
                confirmed_role: role.to_string(),
                payout_account_name: account_name.to_string(),
                payout_account_number: account_number.to_string(),
                verified_at: Utc::now(),
            },
        )
        .await
        .map_err(fail)?;

    let graph_synced = receipt.graph.error().is_none();
    if !graph_synced {
        warn!(
            event_name = "api.verify.graph_degraded",
            correlation_id = %correlation_id,
            property_id = %receipt.property.id.0,
            "verification stored; graph index not updated"
        );
    }
    info!(
        event_name = "api.verify.completed",
        correlation_id = %correlation_id,
        principal = %receipt.property.principal_id,
        property_id = %receipt.property.id.0,
        "property verification recorded"
    );

    Ok(Json(VerifyResponse { property: receipt.property.into(), graph_synced }))
}

/// Picks the property a verification refers to. Without a principal the
/// address must belong to exactly one principal.
fn select_property(
    candidates: Vec<PropertyRecord>,
    principal: Option<&PrincipalId>,
    address: &str,
) -> Result<PropertyRecord, ApplicationError> {
    let mut candidates: Vec<PropertyRecord> = match principal {
        Some(principal) => {
            candidates.into_iter().filter(|record| &record.principal_id == principal).collect()
        }
        None => candidates,
    };

    let principals: BTreeSet<&str> =
        candidates.iter().map(|record| record.principal_id.as_str()).collect();
    if principals.len() > 1 {
        return Err(ApplicationError::Conflict(format!(
            "address `{address}` is registered by {} principals; pass `principal`",
            principals.len()
        )));
    }

    candidates.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ApplicationError::NotFound(format!("no property registered at `{address}`")))
}

fn repository_error(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::NotFound(message) => ApplicationError::NotFound(message),
        RepositoryError::Conflict(message) => ApplicationError::Conflict(message),
        other => ApplicationError::Persistence(other.to_string()),
    }
}

fn reject(error: InterfaceError) -> (StatusCode, Json<ApiError>) {
    let status = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let detail = match &error {
        InterfaceError::BadRequest { message, .. }
        | InterfaceError::NotFound { message, .. }
        | InterfaceError::Conflict { message, .. } => message.clone(),
        InterfaceError::ServiceUnavailable { .. } | InterfaceError::Internal { .. } => {
            error.user_message().to_string()
        }
    };
    (
        status,
        Json(ApiError {
            error: error.user_message(),
            detail,
            correlation_id: error.correlation_id().to_string(),
        }),
    )
}

fn correlation_id() -> String {
    format!("api-{}", Uuid::new_v4().simple())
}
