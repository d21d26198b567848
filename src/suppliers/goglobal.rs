//! GoGlobal hotel search over SOAP 1.2.
//!
//! The search request is an XML document (credentials included) wrapped as
//! CDATA inside a `MakeRequest` envelope. The answer comes back as JSON in
//! the text of `MakeRequestResult`. Meal plans are filtered by the supplier
//! itself through `FilterRoomBasis`.

use super::{http_failure, value_as_f64, value_as_id};
use crate::adapter::{AdapterContext, Normalized, RawResponse, Services, SupplierAdapter};
use crate::config::{AuthMode, SupplierConfig, DEFAULT_CURRENCY, GOGLOBAL};
use crate::error::SupplierError;
use crate::models::{Offer, SearchCriteria};
use crate::session_pool::SessionPool;
use async_trait::async_trait;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SOAP_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const GOGLOBAL_NS: &str = "http://www.goglobal.travel/";
const OPERATION: &str = "HOTEL_SEARCH_REQUEST";
const REQUEST_TYPE_SEARCH: &str = "11";
const API_VERSION: &str = "2.3";

pub struct GoGlobalAdapter {
    config: SupplierConfig,
    pool: Arc<SessionPool>,
    services: Services,
    agency_id: String,
    username: String,
    password: String,
}

// Request document

#[derive(Debug, Serialize)]
#[serde(rename = "Root", rename_all = "PascalCase")]
struct RequestRoot<'a> {
    header: RequestHeader<'a>,
    main: RequestMain,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RequestHeader<'a> {
    agency: &'a str,
    user: &'a str,
    password: &'a str,
    operation: &'static str,
    operation_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RequestMain {
    #[serde(rename = "@Version")]
    version: &'static str,
    #[serde(rename = "@ResponseFormat")]
    response_format: &'static str,
    #[serde(rename = "@Currency")]
    currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_room_basises: Option<FilterRoomBasises>,
    hotels: RequestHotels,
    arrival_date: String,
    nights: i64,
    rooms: RequestRooms,
}

#[derive(Debug, Serialize)]
struct FilterRoomBasises {
    #[serde(rename = "FilterRoomBasis")]
    codes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RequestHotels {
    #[serde(rename = "HotelId")]
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RequestRooms {
    #[serde(rename = "Room")]
    rooms: Vec<RequestRoom>,
}

#[derive(Debug, Serialize)]
struct RequestRoom {
    #[serde(rename = "@Adults")]
    adults: u32,
    #[serde(rename = "@RoomCount")]
    room_count: u32,
    #[serde(rename = "@ChildCount")]
    child_count: usize,
    #[serde(rename = "ChildAge")]
    child_ages: Vec<u32>,
}

// JSON carried in MakeRequestResult

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "Hotels", default)]
    hotels: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Hotel {
    #[serde(default)]
    hotel_code: Value,
    hotel_name: Option<String>,
    #[serde(default)]
    offers: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HotelOffer {
    #[serde(default)]
    rooms: Vec<String>,
    room_name: Option<String>,
    room_basis: Option<String>,
    #[serde(default)]
    total_price: Value,
    currency: Option<String>,
    hotel_search_code: Option<String>,
    special: Option<String>,
    cancellation_deadline: Option<String>,
}

fn xml_error(err: impl std::fmt::Display) -> SupplierError {
    SupplierError::Other(format!("goglobal request encoding failed: {}", err))
}

impl GoGlobalAdapter {
    pub fn new(ctx: AdapterContext) -> anyhow::Result<Self> {
        let AuthMode::ApiKey {
            agency_id,
            username,
            password,
        } = ctx.config.auth.clone()
        else {
            anyhow::bail!("{} requires agency credentials", ctx.config.id);
        };
        Ok(Self {
            config: ctx.config,
            pool: ctx.pool,
            services: ctx.services,
            agency_id,
            username,
            password,
        })
    }

    fn request_document(&self, criteria: &SearchCriteria, hotel_ids: Vec<String>) -> Result<String, SupplierError> {
        let root = RequestRoot {
            header: RequestHeader {
                agency: &self.agency_id,
                user: &self.username,
                password: &self.password,
                operation: OPERATION,
                operation_type: "Request",
            },
            main: RequestMain {
                version: API_VERSION,
                response_format: "JSON",
                currency: DEFAULT_CURRENCY.to_string(),
                filter_room_basises: criteria
                    .native_meal_code
                    .clone()
                    .map(|code| FilterRoomBasises { codes: vec![code] }),
                hotels: RequestHotels { ids: hotel_ids },
                arrival_date: criteria.check_in.format("%Y-%m-%d").to_string(),
                nights: criteria.nights(),
                rooms: RequestRooms {
                    rooms: vec![RequestRoom {
                        adults: criteria.adults,
                        room_count: 1,
                        child_count: criteria.children(),
                        child_ages: criteria.children_ages.clone(),
                    }],
                },
            },
        };
        quick_xml::se::to_string(&root).map_err(xml_error)
    }
}

fn soap_envelope(document: &str) -> Result<String, SupplierError> {
    let mut writer = Writer::new(Vec::new());

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_error)?;
    let mut envelope = BytesStart::new("soap12:Envelope");
    envelope.push_attribute(("xmlns:soap12", SOAP_NS));
    writer.write_event(Event::Start(envelope)).map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("soap12:Body")))
        .map_err(xml_error)?;

    let mut make_request = BytesStart::new("MakeRequest");
    make_request.push_attribute(("xmlns", GOGLOBAL_NS));
    writer.write_event(Event::Start(make_request)).map_err(xml_error)?;

    writer
        .write_event(Event::Start(BytesStart::new("requestType")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(REQUEST_TYPE_SEARCH)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new("requestType")))
        .map_err(xml_error)?;

    writer
        .write_event(Event::Start(BytesStart::new("xmlRequest")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::CData(BytesCData::new(document)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new("xmlRequest")))
        .map_err(xml_error)?;

    for tag in ["MakeRequest", "soap12:Body", "soap12:Envelope"] {
        writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .map_err(xml_error)?;
    }

    String::from_utf8(writer.into_inner()).map_err(xml_error)
}

/// Text of the first `MakeRequestResult` element, with CDATA markers
/// stripped or entities unescaped. `None` when the envelope has no result.
fn extract_result(envelope: &str) -> Result<Option<String>, SupplierError> {
    let mut reader = Reader::from_str(envelope);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"MakeRequestResult" => {
                let raw = reader
                    .read_text(e.name())
                    .map_err(|err| SupplierError::parse(format!("goglobal envelope: {}", err)))?;
                let raw = format!("{}", raw);
                let raw = raw.trim();
                if let Some(inner) = raw
                    .strip_prefix("<![CDATA[")
                    .and_then(|rest| rest.strip_suffix("]]>"))
                {
                    return Ok(Some(inner.to_string()));
                }
                let text: Cow<str> = quick_xml::escape::unescape(raw)
                    .map_err(|err| SupplierError::parse(format!("goglobal result text: {}", err)))?;
                return Ok(Some(text.into_owned()));
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"MakeRequestResult" => {
                return Ok(Some(String::new()));
            }
            Ok(Event::Eof) => return Ok(None),
            Err(err) => {
                return Err(SupplierError::parse(format!(
                    "goglobal envelope at position {}: {}",
                    reader.error_position(),
                    err
                )))
            }
            _ => (),
        }
    }
}

fn convert_offer(offer: Value, supplier_hotel_id: &str, hotel_name: &str) -> Option<Offer> {
    let offer: HotelOffer = match serde_json::from_value(offer) {
        Ok(offer) => offer,
        Err(e) => {
            debug!(hotel = supplier_hotel_id, error = %e, "Skipping malformed offer");
            return None;
        }
    };

    let search_code = offer.hotel_search_code.filter(|c| !c.is_empty())?;
    let total_price = value_as_f64(&offer.total_price)?;
    let room_name = offer
        .rooms
        .into_iter()
        .next()
        .or(offer.room_name)
        .filter(|n| !n.trim().is_empty())?;

    Some(Offer {
        provider: GOGLOBAL.to_string(),
        supplier_hotel_id: supplier_hotel_id.to_string(),
        hotel_name: hotel_name.to_string(),
        supplier_room_code: Some(search_code),
        room_name,
        meal_plan: Some(offer.room_basis.unwrap_or_else(|| "room_only".to_string())),
        total_price,
        currency: offer.currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        room_features: offer
            .special
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .into_iter()
            .collect(),
        free_cancellation_until: offer.cancellation_deadline,
        ..Default::default()
    })
}

#[async_trait]
impl SupplierAdapter for GoGlobalAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn prepare_request_criteria(&self, criteria: &SearchCriteria) -> SearchCriteria {
        let mut prepared = criteria.clone();
        let Some(code) = criteria.requested_meal_types().next() else {
            return prepared;
        };

        if self.services.meals.should_filter_at_request_level(self.id(), code) {
            prepared.native_meal_code = self.services.meals.native_code_for(self.id(), code);
            debug!(supplier = %self.config.id, code, native = ?prepared.native_meal_code, "Request-level meal filter");
        } else {
            warn!(supplier = %self.config.id, code, "No request-level meal filter for code");
        }
        prepared
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<RawResponse, SupplierError> {
        let hotel_names = self
            .services
            .resolve_hotel_ids(self.id(), &criteria.hotel_names)?;
        let document = self.request_document(criteria, hotel_names.keys().cloned().collect())?;
        let envelope = soap_envelope(&document)?;

        let session = self.pool.session(&self.config)?;
        let request = session
            .client()
            .post(&self.config.base_url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .header("API-Operation", OPERATION)
            .header("API-AgencyID", &self.agency_id)
            .body(envelope);
        let reply = session.execute(request, self.config.timeout()).await?;
        info!(supplier = %self.config.id, status = reply.status, bytes = reply.body.len(), "Search response");

        if !reply.is_success() {
            return Err(http_failure(&self.config.id, &reply));
        }
        Ok(RawResponse::new(reply.body, hotel_names.into_iter().collect()))
    }

    fn normalize(&self, raw: &RawResponse, _criteria: &SearchCriteria) -> Result<Normalized, SupplierError> {
        let envelope = String::from_utf8_lossy(&raw.body);
        let mut normalized = Normalized::default();

        let Some(payload) = extract_result(&envelope)? else {
            warn!(supplier = %self.config.id, "No MakeRequestResult in response");
            return Ok(normalized);
        };
        if payload.trim().is_empty() {
            return Ok(normalized);
        }
        let result: SearchResult = serde_json::from_str(&payload)?;

        for hotel in result.hotels {
            let hotel: Hotel = match serde_json::from_value(hotel) {
                Ok(hotel) => hotel,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed hotel");
                    normalized.dropped += 1;
                    continue;
                }
            };
            let Some(hotel_code) = value_as_id(&hotel.hotel_code) else {
                normalized.dropped += hotel.offers.len();
                continue;
            };
            let hotel_name = raw
                .hotel_names
                .get(&hotel_code)
                .cloned()
                .or(hotel.hotel_name)
                .unwrap_or_default();

            for offer in hotel.offers {
                normalized.push(convert_offer(offer, &hotel_code, &hotel_name));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{MealCodeTable, MealFilterStrategy, RoomCategoryTable};
    use crate::suppliers::test_support;
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> SupplierConfig {
        SupplierConfig::goglobal()
            .with_base_url(base_url)
            .with_auth(AuthMode::ApiKey {
                agency_id: "1521".to_string(),
                username: "AGENT".to_string(),
                password: "secret".to_string(),
            })
    }

    fn adapter(base_url: &str) -> GoGlobalAdapter {
        GoGlobalAdapter::new(test_support::context(config(base_url))).unwrap()
    }

    fn criteria() -> SearchCriteria {
        SearchCriteria::new(
            vec!["Banyan Tree Krabi".to_string()],
            NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(),
            NaiveDate::from_ymd_opt(2025, 8, 18).unwrap(),
        )
        .with_children_ages(vec![10])
    }

    fn result_json() -> Value {
        json!({
            "Header": {"Stats": {"HotelQty": 1}},
            "Hotels": [{
                "HotelCode": 45012,
                "HotelName": "BANYAN TREE KRABI",
                "Offers": [
                    {
                        "HotelSearchCode": "45012/1/BB",
                        "Rooms": ["Deluxe Pool Villa"],
                        "RoomBasis": "BB",
                        "TotalPrice": 1234.5,
                        "Currency": "EUR",
                        "Special": " Free minibar ",
                        "CancellationDeadline": "2025-08-10"
                    },
                    {
                        "HotelSearchCode": "45012/2/RO",
                        "Rooms": ["Garden Villa"],
                        "TotalPrice": "810"
                    },
                    {"Rooms": ["No Code Villa"], "TotalPrice": 100},
                    {"HotelSearchCode": "45012/4/BB", "Rooms": ["Priceless"], "TotalPrice": "tbd"}
                ]
            }]
        })
    }

    fn soap_response(result: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><MakeRequestResponse xmlns="http://www.goglobal.travel/"><MakeRequestResult>{}</MakeRequestResult></MakeRequestResponse></soap:Body></soap:Envelope>"#,
            result
        )
    }

    #[test]
    fn test_request_document_and_envelope() {
        let adapter = adapter("http://localhost");
        let mut prepared = criteria();
        prepared.native_meal_code = Some("BB".to_string());

        let document = adapter
            .request_document(&prepared, vec!["45012".to_string()])
            .unwrap();
        assert!(document.starts_with("<Root><Header><Agency>1521</Agency>"));
        assert!(document.contains("<Operation>HOTEL_SEARCH_REQUEST</Operation>"));
        assert!(document.contains(r#"<Main Version="2.3" ResponseFormat="JSON" Currency="EUR">"#));
        assert!(document.contains("<FilterRoomBasises><FilterRoomBasis>BB</FilterRoomBasis></FilterRoomBasises>"));
        assert!(document.contains("<Hotels><HotelId>45012</HotelId></Hotels>"));
        assert!(document.contains("<ArrivalDate>2025-08-15</ArrivalDate><Nights>3</Nights>"));
        assert!(document.contains(r#"<Room Adults="2" RoomCount="1" ChildCount="1"><ChildAge>10</ChildAge></Room>"#));

        let envelope = soap_envelope(&document).unwrap();
        assert!(envelope.starts_with(r#"<?xml version="1.0" encoding="utf-8"?>"#));
        assert!(envelope.contains("<requestType>11</requestType>"));
        assert!(envelope.contains("<xmlRequest><![CDATA[<Root>"));
        assert!(envelope.ends_with("</MakeRequest></soap12:Body></soap12:Envelope>"));
    }

    #[test]
    fn test_request_without_meal_filter() {
        let document = adapter("http://localhost")
            .request_document(&criteria(), vec!["45012".to_string()])
            .unwrap();
        assert!(!document.contains("FilterRoomBasis"));
    }

    fn adapter_with_meals(config: SupplierConfig) -> GoGlobalAdapter {
        let meals = MealCodeTable::new()
            .with("BB", "goglobal", "BB")
            .with("AI", "goglobal", "AI");
        let mut ctx = test_support::context(config);
        ctx.services = Services::new(
            ctx.services.hotel_ids.clone(),
            Arc::new(meals),
            Arc::new(RoomCategoryTable::new()),
        )
        .with_meal_strategies(std::slice::from_ref(&ctx.config));
        GoGlobalAdapter::new(ctx).unwrap()
    }

    #[test]
    fn test_prepare_maps_first_meal_code() {
        let adapter = adapter_with_meals(config("http://localhost"));

        let original = criteria().with_meal_types(&["AI", "BB"]);
        let prepared = adapter.prepare_request_criteria(&original);
        assert_eq!(prepared.native_meal_code.as_deref(), Some("AI"));
        assert!(original.native_meal_code.is_none());

        let unmapped = adapter.prepare_request_criteria(&criteria().with_meal_types(&["HB"]));
        assert!(unmapped.native_meal_code.is_none());
    }

    #[test]
    fn test_prepare_follows_configured_strategy() {
        let mut response_level = config("http://localhost");
        response_level.meal_strategy = MealFilterStrategy::ResponseLevel;
        let adapter = adapter_with_meals(response_level);

        let prepared = adapter.prepare_request_criteria(&criteria().with_meal_types(&["BB"]));
        assert!(prepared.native_meal_code.is_none());
    }

    #[test]
    fn test_normalize_escaped_result() {
        let adapter = adapter("http://localhost");
        let json = result_json().to_string();
        let body = soap_response(&quick_xml::escape::escape(json.as_str()));
        let mut names = std::collections::HashMap::new();
        names.insert("45012".to_string(), "Banyan Tree Krabi".to_string());

        let normalized = adapter
            .normalize(&RawResponse::new(body, names), &criteria())
            .unwrap();
        assert_eq!(normalized.offers.len(), 2);
        assert_eq!(normalized.dropped, 2);

        let first = &normalized.offers[0];
        assert_eq!(first.hotel_name, "Banyan Tree Krabi");
        assert_eq!(first.supplier_hotel_id, "45012");
        assert_eq!(first.meal_plan.as_deref(), Some("BB"));
        assert_eq!(first.total_price, 1234.5);
        assert_eq!(first.room_features, vec!["Free minibar"]);
        assert_eq!(first.free_cancellation_until.as_deref(), Some("2025-08-10"));

        let second = &normalized.offers[1];
        assert_eq!(second.meal_plan.as_deref(), Some("room_only"));
        assert_eq!(second.total_price, 810.0);
        assert!(second.room_features.is_empty());
    }

    #[test]
    fn test_normalize_cdata_result_and_missing_result() {
        let adapter = adapter("http://localhost");
        let body = soap_response(&format!("<![CDATA[{}]]>", result_json()));
        let normalized = adapter
            .normalize(&RawResponse::new(body, Default::default()), &criteria())
            .unwrap();
        assert_eq!(normalized.offers.len(), 2);
        assert_eq!(normalized.offers[0].hotel_name, "BANYAN TREE KRABI");

        let empty = soap_response(r#"{"Hotels":[]}"#);
        let normalized = adapter
            .normalize(&RawResponse::new(empty, Default::default()), &criteria())
            .unwrap();
        assert!(normalized.offers.is_empty());

        let no_result = "<soap:Envelope><soap:Body/></soap:Envelope>";
        let normalized = adapter
            .normalize(&RawResponse::new(no_result, Default::default()), &criteria())
            .unwrap();
        assert!(normalized.offers.is_empty());
    }

    #[test]
    fn test_normalize_bad_json_is_parse_error() {
        let body = soap_response("not json");
        let err = adapter("http://localhost")
            .normalize(&RawResponse::new(body, Default::default()), &criteria())
            .unwrap_err();
        assert!(matches!(err, SupplierError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_search_sends_soap_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("API-Operation", "HOTEL_SEARCH_REQUEST"))
            .and(header("API-AgencyID", "1521"))
            .and(body_string_contains("<HotelId>45012</HotelId>"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(soap_response(&format!("<![CDATA[{}]]>", result_json()))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        let raw = adapter.search(&criteria()).await.unwrap();
        assert_eq!(raw.hotel_name("45012"), "Banyan Tree Krabi");
        assert_eq!(adapter.normalize(&raw, &criteria()).unwrap().offers.len(), 2);
    }

    #[test]
    fn test_requires_agency_credentials() {
        let config = SupplierConfig::goglobal().with_auth(AuthMode::None);
        assert!(GoGlobalAdapter::new(test_support::context(config)).is_err());
    }
}
