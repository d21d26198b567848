// TBO Holidays hotel search: REST/JSON with Basic credentials, meal plans
// filtered on the response.

use super::{http_failure, value_as_f64, value_as_id};
use crate::adapter::{AdapterContext, Normalized, RawResponse, Services, SupplierAdapter};
use crate::config::{AuthMode, SupplierConfig, TBO};
use crate::error::{is_retryable_status, SupplierError};
use crate::models::{Offer, SearchCriteria};
use crate::session_pool::SessionPool;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const STATUS_OK: i64 = 200;
const STATUS_NO_RESULTS: i64 = 201;
const RESPONSE_TIME_SECS: u32 = 30;
const DEFAULT_ROOM_NAME: &str = "Standard Room";
const DEFAULT_MEAL_TYPE: &str = "Room_Only";
const DEFAULT_TBO_CURRENCY: &str = "USD";
const CANCEL_DATE_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

pub struct TboAdapter {
    config: SupplierConfig,
    pool: Arc<SessionPool>,
    services: Services,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SearchRequest {
    check_in: String,
    check_out: String,
    hotel_codes: String,
    guest_nationality: String,
    pax_rooms: Vec<PaxRoom>,
    response_time: u32,
    is_detailed_response: bool,
    filters: SearchFilters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PaxRoom {
    adults: u32,
    children: usize,
    children_ages: Vec<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SearchFilters {
    refundable: bool,
    no_of_rooms: u32,
    meal_type: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SearchResponse {
    #[serde(default)]
    status: ResponseStatus,
    #[serde(default)]
    hotel_result: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponseStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HotelResult {
    #[serde(default)]
    hotel_code: Value,
    hotel_name: Option<String>,
    currency: Option<String>,
    #[serde(default)]
    rooms: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoomResult {
    #[serde(default)]
    name: Vec<String>,
    meal_type: Option<String>,
    booking_code: Option<String>,
    #[serde(default)]
    total_fare: Value,
    #[serde(default)]
    cancel_policies: Vec<CancelPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CancelPolicy {
    from_date: Option<String>,
    #[serde(default)]
    cancellation_charge: Value,
}

impl TboAdapter {
    pub fn new(ctx: AdapterContext) -> anyhow::Result<Self> {
        if !matches!(ctx.config.auth, AuthMode::Basic { .. }) {
            anyhow::bail!("{} requires basic credentials", ctx.config.id);
        }
        Ok(Self {
            config: ctx.config,
            pool: ctx.pool,
            services: ctx.services,
        })
    }
}

fn build_request(criteria: &SearchCriteria, hotel_codes: Vec<String>) -> SearchRequest {
    SearchRequest {
        check_in: criteria.check_in.format("%Y-%m-%d").to_string(),
        check_out: criteria.check_out.format("%Y-%m-%d").to_string(),
        hotel_codes: hotel_codes.join(","),
        guest_nationality: criteria.nationality.clone(),
        pax_rooms: vec![PaxRoom {
            adults: criteria.adults,
            children: criteria.children(),
            children_ages: criteria.children_ages.clone(),
        }],
        response_time: RESPONSE_TIME_SECS,
        is_detailed_response: true,
        filters: SearchFilters {
            refundable: false,
            no_of_rooms: 0,
            meal_type: "All",
        },
    }
}

fn parse_response(body: &[u8]) -> Result<SearchResponse, SupplierError> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    match response.status.code {
        STATUS_OK => Ok(response),
        STATUS_NO_RESULTS => Ok(SearchResponse::default()),
        code => {
            let status_code = u16::try_from(code).unwrap_or(0);
            Err(SupplierError::ApiResponseError {
                status_code,
                message: format!(
                    "tbo status {}: {}",
                    code,
                    response.status.description.as_deref().unwrap_or("unknown error")
                ),
                is_retryable: is_retryable_status(status_code),
            })
        }
    }
}

// FromDate of the first zero-charge policy, as ISO-8601 UTC
fn free_cancellation_until(policies: &[CancelPolicy]) -> Option<String> {
    let policy = policies
        .iter()
        .find(|p| value_as_f64(&p.cancellation_charge) == Some(0.0))?;
    let from = policy.from_date.as_deref()?;
    match NaiveDateTime::parse_from_str(from.trim(), CANCEL_DATE_FORMAT) {
        Ok(date) => Some(format!("{}Z", date.format("%Y-%m-%dT%H:%M:%S"))),
        Err(e) => {
            debug!(from, error = %e, "Unparseable cancellation date");
            None
        }
    }
}

fn convert_room(room: Value, supplier_hotel_id: &str, hotel_name: &str, currency: &str) -> Option<Offer> {
    let room: RoomResult = match serde_json::from_value(room) {
        Ok(room) => room,
        Err(e) => {
            debug!(hotel = supplier_hotel_id, error = %e, "Skipping malformed room");
            return None;
        }
    };
    let booking_code = room.booking_code.clone().filter(|c| !c.is_empty())?;
    let total_price = value_as_f64(&room.total_fare)?;

    Some(Offer {
        provider: TBO.to_string(),
        supplier_hotel_id: supplier_hotel_id.to_string(),
        hotel_name: hotel_name.to_string(),
        supplier_room_code: Some(booking_code.clone()),
        room_name: room
            .name
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_ROOM_NAME.to_string()),
        meal_plan: Some(
            room.meal_type
                .clone()
                .unwrap_or_else(|| DEFAULT_MEAL_TYPE.to_string()),
        ),
        total_price,
        currency: currency.to_string(),
        free_cancellation_until: free_cancellation_until(&room.cancel_policies),
        offer_id: Some(booking_code),
        ..Default::default()
    })
}

#[async_trait]
impl SupplierAdapter for TboAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<RawResponse, SupplierError> {
        let hotel_names = self
            .services
            .resolve_hotel_ids(self.id(), &criteria.hotel_names)?;
        let request = build_request(criteria, hotel_names.keys().cloned().collect());

        let session = self.pool.session(&self.config)?;
        let http = session
            .client()
            .post(&self.config.base_url)
            .header("Accept", "application/json")
            .json(&request);
        let reply = session.execute(http, self.config.timeout()).await?;
        info!(supplier = %self.config.id, status = reply.status, bytes = reply.body.len(), "Search response");

        if !reply.is_success() {
            return Err(http_failure(&self.config.id, &reply));
        }
        // Surface TBO status errors before normalization
        parse_response(&reply.body)?;

        Ok(RawResponse::new(reply.body, hotel_names.into_iter().collect()))
    }

    fn normalize(&self, raw: &RawResponse, _criteria: &SearchCriteria) -> Result<Normalized, SupplierError> {
        let mut normalized = Normalized::default();
        if raw.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(normalized);
        }
        let response = parse_response(&raw.body)?;

        for hotel in response.hotel_result {
            let hotel: HotelResult = match serde_json::from_value(hotel) {
                Ok(hotel) => hotel,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed hotel");
                    normalized.dropped += 1;
                    continue;
                }
            };
            let Some(hotel_code) = value_as_id(&hotel.hotel_code) else {
                debug!(rooms = hotel.rooms.len(), "Hotel without HotelCode");
                normalized.dropped += hotel.rooms.len();
                continue;
            };
            let hotel_name = raw
                .hotel_names
                .get(&hotel_code)
                .cloned()
                .or(hotel.hotel_name.filter(|n| !n.is_empty()))
                .unwrap_or_default();
            let currency = hotel
                .currency
                .unwrap_or_else(|| DEFAULT_TBO_CURRENCY.to_string());

            for room in hotel.rooms {
                normalized.push(convert_room(room, &hotel_code, &hotel_name, &currency));
            }
        }

        info!(
            supplier = %self.config.id,
            offers = normalized.offers.len(),
            dropped = normalized.dropped,
            "Normalized response"
        );
        Ok(normalized)
    }
}
