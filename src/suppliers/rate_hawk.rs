//! Rate Hawk (ETG API v3) hotel search.
//!
//! REST/JSON with Basic credentials. Meal plans are filtered on the
//! response, so the criteria go out unchanged.

use super::{http_failure, value_as_f64, value_as_id};
use crate::adapter::{AdapterContext, Normalized, RawResponse, Services, SupplierAdapter};
use crate::config::{AuthMode, SupplierConfig};
use crate::error::SupplierError;
use crate::models::{Offer, SearchCriteria};
use crate::session_pool::SessionPool;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_DAYS_AHEAD: i64 = 730;
const MAX_NIGHTS: i64 = 30;
const MAX_CHILDREN: usize = 4;
const MAX_GUESTS: usize = 6;
const MAX_CHILD_AGE: u32 = 17;

pub struct RateHawkAdapter {
    config: SupplierConfig,
    pool: Arc<SessionPool>,
    services: Services,
}

#[derive(Debug, Serialize)]
struct SearchPayload<'a> {
    checkin: String,
    checkout: String,
    residency: &'a str,
    guests: Vec<GuestRoom>,
    ids: Vec<String>,
    currency: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rooms: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GuestRoom {
    adults: u32,
    children: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Option<ResponseData>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    debug: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResponseData {
    #[serde(default)]
    hotels: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Hotel {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    hid: Value,
    #[serde(default)]
    rates: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Rate {
    match_hash: Option<String>,
    room_name: Option<String>,
    meal: Option<String>,
    payment_options: Option<PaymentOptions>,
    #[serde(default)]
    daily_prices: Vec<Value>,
    #[serde(default)]
    serp_filters: Vec<String>,
    rg_ext: Option<RoomGroupExt>,
    #[serde(default)]
    amenities_data: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentOptions {
    #[serde(default)]
    payment_types: Vec<PaymentType>,
}

#[derive(Debug, Deserialize)]
struct PaymentType {
    #[serde(default)]
    amount: Value,
    currency_code: Option<String>,
    cancellation_penalties: Option<CancellationPenalties>,
}

#[derive(Debug, Deserialize)]
struct CancellationPenalties {
    free_cancellation_before: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RoomGroupExt {
    bathroom: i64,
    view: i64,
    balcony: i64,
    club: i64,
    family: i64,
}

impl RateHawkAdapter {
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

    fn payload<'a>(
        &self,
        criteria: &'a SearchCriteria,
        children: Vec<u32>,
        ids: Vec<String>,
    ) -> SearchPayload<'a> {
        SearchPayload {
            checkin: criteria.check_in.format("%Y-%m-%d").to_string(),
            checkout: criteria.check_out.format("%Y-%m-%d").to_string(),
            residency: &criteria.nationality,
            guests: vec![GuestRoom {
                adults: criteria.adults,
                children,
            }],
            ids,
            currency: &criteria.currency,
            rooms: criteria.rooms,
        }
    }
}

/// Stay and occupancy limits of the search endpoint. Returns the child
/// ages clamped to the accepted range.
fn validate_criteria(criteria: &SearchCriteria, today: NaiveDate) -> Result<Vec<u32>, SupplierError> {
    if criteria.check_in < today {
        return Err(SupplierError::invalid("check_in must be today or later"));
    }
    if (criteria.check_in - today).num_days() > MAX_DAYS_AHEAD {
        return Err(SupplierError::invalid(format!(
            "check_in must be within {} days",
            MAX_DAYS_AHEAD
        )));
    }
    let nights = criteria.nights();
    if nights < 1 {
        return Err(SupplierError::invalid("check_out must be after check_in"));
    }
    if nights > MAX_NIGHTS {
        return Err(SupplierError::invalid(format!(
            "stay must not exceed {} nights",
            MAX_NIGHTS
        )));
    }
    if criteria.children() > MAX_CHILDREN {
        return Err(SupplierError::invalid(format!(
            "too many children ({}), at most {} per room",
            criteria.children(),
            MAX_CHILDREN
        )));
    }
    let guests = criteria.adults as usize + criteria.children();
    if guests > MAX_GUESTS {
        return Err(SupplierError::invalid(format!(
            "too many guests ({}), at most {} per room",
            guests, MAX_GUESTS
        )));
    }

    Ok(criteria
        .children_ages
        .iter()
        .map(|age| (*age).min(MAX_CHILD_AGE))
        .collect())
}

// Errors reported inside a 200 body
fn check_body_error(response: &SearchResponse) -> Result<(), SupplierError> {
    let Some(error) = response.error.as_deref() else {
        return Ok(());
    };
    match error {
        "invalid_params" => {
            let detail = response
                .debug
                .as_ref()
                .and_then(|d| d.get("validation_error"))
                .and_then(Value::as_str)
                .unwrap_or("unknown validation error");
            Err(SupplierError::invalid(format!("rate_hawk validation error: {}", detail)))
        }
        "core_search_error" => Err(SupplierError::ApiResponseError {
            status_code: 200,
            message: "rate_hawk internal search error".to_string(),
            is_retryable: true,
        }),
        other => Err(SupplierError::Other(format!("rate_hawk API error: {}", other))),
    }
}

fn room_features(rate: &Rate) -> Vec<String> {
    let mut features: Vec<String> = Vec::new();

    for filter in &rate.serp_filters {
        let feature = match filter.as_str() {
            "has_bathroom" => "bathroom".to_string(),
            "has_internet" => "internet".to_string(),
            "has_wifi" | "wifi" => "wifi".to_string(),
            other => other.replace("has_", "").replace('_', " "),
        };
        features.push(feature);
    }

    if let Some(ext) = &rate.rg_ext {
        match ext.bathroom {
            2 => features.push("private bathroom".to_string()),
            1 => features.push("shared bathroom".to_string()),
            _ => {}
        }
        if ext.view > 0 {
            features.push("room with view".to_string());
        }
        if ext.balcony > 0 {
            features.push("balcony".to_string());
        }
        if ext.club > 0 {
            features.push("club access".to_string());
        }
        if ext.family > 0 {
            features.push("family friendly".to_string());
        }
    }

    for amenity in &rate.amenities_data {
        features.push(amenity.replace(['-', '_'], " "));
    }

    let mut seen = std::collections::HashSet::new();
    features.retain(|f| seen.insert(f.clone()));
    features
}

fn convert_rate(rate: Value, supplier_hotel_id: &str, hotel_id: &str, hotel_name: &str) -> Option<Offer> {
    let rate: Rate = match serde_json::from_value(rate) {
        Ok(rate) => rate,
        Err(e) => {
            debug!(hotel = supplier_hotel_id, error = %e, "Skipping malformed rate");
            return None;
        }
    };

    let match_hash = rate.match_hash.clone().filter(|h| !h.is_empty())?;
    let room_name = rate.room_name.clone().filter(|n| !n.is_empty())?;
    let payment = rate
        .payment_options
        .as_ref()
        .and_then(|p| p.payment_types.first())?;
    if rate.daily_prices.is_empty() {
        debug!(hotel = supplier_hotel_id, match_hash = %match_hash, "Skipping rate without daily prices");
        return None;
    }

    Some(Offer {
        provider: crate::config::RATE_HAWK.to_string(),
        supplier_hotel_id: supplier_hotel_id.to_string(),
        hotel_id: Some(hotel_id.to_string()),
        hotel_name: hotel_name.to_string(),
        supplier_room_code: Some(match_hash),
        room_name,
        meal_plan: rate.meal.clone(),
        total_price: value_as_f64(&payment.amount).unwrap_or(0.0),
        currency: payment
            .currency_code
            .clone()
            .unwrap_or_else(|| crate::config::DEFAULT_CURRENCY.to_string()),
        room_features: room_features(&rate),
        amenities: rate.amenities_data.clone(),
        free_cancellation_until: payment
            .cancellation_penalties
            .as_ref()
            .and_then(|c| c.free_cancellation_before.clone()),
        ..Default::default()
    })
}

#[async_trait]
impl SupplierAdapter for RateHawkAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<RawResponse, SupplierError> {
        let children = validate_criteria(criteria, Utc::now().date_naive())?;
        let hotel_names = self
            .services
            .resolve_hotel_ids(self.id(), &criteria.hotel_names)?;
        let ids: Vec<String> = hotel_names.keys().cloned().collect();
        let payload = self.payload(criteria, children, ids);

        let session = self.pool.session(&self.config)?;
        let request = session.client().post(&self.config.base_url).json(&payload);
        let reply = session.execute(request, self.config.timeout()).await?;
        info!(supplier = %self.config.id, status = reply.status, bytes = reply.body.len(), "Search response");

        if !reply.is_success() {
            return Err(http_failure(&self.config.id, &reply));
        }
        let response: SearchResponse = serde_json::from_slice(&reply.body)?;
        check_body_error(&response)?;

        Ok(RawResponse::new(reply.body, hotel_names.into_iter().collect()))
    }

    fn normalize(&self, raw: &RawResponse, _criteria: &SearchCriteria) -> Result<Normalized, SupplierError> {
        let mut normalized = Normalized::default();
        if raw.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(normalized);
        }
        let response: SearchResponse = serde_json::from_slice(&raw.body)?;

        let hotels = response.data.map(|d| d.hotels).unwrap_or_default();
        for hotel in hotels {
            let hotel: Hotel = match serde_json::from_value(hotel) {
                Ok(hotel) => hotel,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed hotel");
                    normalized.dropped += 1;
                    continue;
                }
            };
            let Some(supplier_hotel_id) = value_as_id(&hotel.id) else {
                warn!(rates = hotel.rates.len(), "Hotel without id, skipping its rates");
                normalized.dropped += hotel.rates.len();
                continue;
            };
            let hotel_id = value_as_id(&hotel.hid).unwrap_or_else(|| supplier_hotel_id.clone());
            let hotel_name = raw
                .hotel_names
                .get(&supplier_hotel_id)
                .or_else(|| raw.hotel_names.get(&hotel_id))
                .cloned()
                .unwrap_or_else(|| hotel_id.clone());

            for rate in hotel.rates {
                normalized.push(convert_rate(rate, &supplier_hotel_id, &hotel_id, &hotel_name));
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
