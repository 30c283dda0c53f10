//! Typed carrier operations on top of a [`ToolCaller`].
//!
//! The worker returns the carrier's raw response documents; this module
//! pulls out the few fields the batch engine needs (charges, tracking
//! number, label image, alerts) so the engine never walks raw JSON.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use super::client::ToolCaller;
use super::error::CarrierError;

pub mod tools {
    pub const RATE: &str = "rate_shipment";
    pub const CREATE_SHIPMENT: &str = "create_shipment";
    pub const VOID: &str = "void_shipment";
}

/// A dry-run price for one shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuote {
    pub cost_cents: i64,
    pub currency: String,
    pub warnings: Vec<String>,
}

/// What the carrier hands back after creating a shipment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentReceipt {
    pub tracking_number: String,
    pub shipment_id: String,
    pub cost_cents: i64,
    pub currency: String,
    /// Decoded label document, when the carrier returned one.
    pub label_pdf: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidOutcome {
    pub success: bool,
    pub code: String,
    pub description: String,
}

pub struct CarrierService<C> {
    caller: C,
}

impl<C: ToolCaller> CarrierService<C> {
    pub fn new(caller: C) -> Self {
        Self { caller }
    }

    pub fn caller(&self) -> &C {
        &self.caller
    }

    /// Quote a single shipment without creating it.
    pub async fn rate(&self, request_body: &Value) -> Result<RateQuote, CarrierError> {
        let raw = self
            .caller
            .call_tool(
                tools::RATE,
                json!({"requestoption": "Rate", "request_body": request_body}),
            )
            .await?;
        Ok(normalize_rate(&raw))
    }

    /// Create a live shipment. This charges the account.
    pub async fn create_shipment(
        &self,
        request_body: &Value,
    ) -> Result<ShipmentReceipt, CarrierError> {
        let raw = self
            .caller
            .call_tool(tools::CREATE_SHIPMENT, json!({"request_body": request_body}))
            .await?;
        normalize_shipment(&raw)
    }

    pub async fn void_shipment(&self, shipment_id: &str) -> Result<VoidOutcome, CarrierError> {
        let raw = self
            .caller
            .call_tool(
                tools::VOID,
                json!({"shipmentidentificationnumber": shipment_id}),
            )
            .await?;
        Ok(normalize_void(&raw))
    }
}

/// Prefer negotiated charges when the account has them.
fn pick_charges<'a>(negotiated: &'a Value, published: &'a Value) -> &'a Value {
    match negotiated.get("MonetaryValue") {
        Some(v) if !v.is_null() && v.as_str() != Some("") => negotiated,
        _ => published,
    }
}

fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn currency_of(charges: &Value) -> String {
    charges
        .get("CurrencyCode")
        .and_then(Value::as_str)
        .unwrap_or("USD")
        .to_string()
}

fn normalize_rate(raw: &Value) -> RateQuote {
    let response = &raw["RateResponse"];
    let rated = as_list(&response["RatedShipment"]);
    let first = rated.first().copied().unwrap_or(&Value::Null);

    let charges = pick_charges(
        &first["NegotiatedRateCharges"]["TotalCharge"],
        &first["TotalCharges"],
    );

    let warnings = as_list(&response["Response"]["Alert"])
        .into_iter()
        .chain(as_list(&first["RatedShipmentAlert"]))
        .filter_map(|alert| match alert {
            Value::String(text) => Some(text.clone()),
            other => other
                .get("Description")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .collect();

    RateQuote {
        cost_cents: money_cents(&charges["MonetaryValue"]),
        currency: currency_of(charges),
        warnings,
    }
}

fn normalize_shipment(raw: &Value) -> Result<ShipmentReceipt, CarrierError> {
    let results = &raw["ShipmentResponse"]["ShipmentResults"];
    let shipment_id = results["ShipmentIdentificationNumber"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let packages = as_list(&results["PackageResults"]);
    let first = packages.first().copied().unwrap_or(&Value::Null);

    // Sandbox accounts mask package tracking numbers; fall back to the shipment id.
    let tracking_number = match first["TrackingNumber"].as_str() {
        Some(t) if !t.is_empty() && !t.contains("XXXX") => t.to_string(),
        _ => shipment_id.clone(),
    };
    if tracking_number.is_empty() {
        return Err(CarrierError::MalformedResponse(
            "shipment response carries no tracking number".into(),
        ));
    }

    // The shipment exists at this point; a bad label must not hide it.
    let label_pdf = match first["ShippingLabel"]["GraphicImage"].as_str() {
        Some(encoded) if !encoded.is_empty() => match BASE64.decode(encoded) {
            Ok(pdf) => Some(pdf),
            Err(e) => {
                warn!(tracking = %tracking_number, error = %e, "label image is not valid base64, dropping it");
                None
            }
        },
        _ => None,
    };

    let charges = pick_charges(
        &results["NegotiatedRateCharges"]["TotalCharge"],
        &results["ShipmentCharges"]["TotalCharges"],
    );

    Ok(ShipmentReceipt {
        tracking_number,
        shipment_id,
        cost_cents: money_cents(&charges["MonetaryValue"]),
        currency: currency_of(charges),
        label_pdf,
    })
}

fn normalize_void(raw: &Value) -> VoidOutcome {
    let status = &raw["VoidShipmentResponse"]["SummaryResult"]["Status"];
    let code = status["Code"].as_str().unwrap_or_default().to_string();
    VoidOutcome {
        success: code == "1",
        description: status["Description"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        code,
    }
}

fn money_cents(value: &Value) -> i64 {
    match value {
        Value::String(s) => parse_cents(s),
        Value::Number(n) => parse_cents(&n.to_string()),
        _ => None,
    }
    .unwrap_or(0)
}

/// Parse a decimal currency amount ("12.50") into minor units without
/// going through floating point. Extra fractional digits are truncated.
pub fn parse_cents(amount: &str) -> Option<i64> {
    let amount = amount.trim();
    let (whole, frac) = amount.split_once('.').unwrap_or((amount, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut cents: String = frac.chars().take(2).collect();
    while cents.len() < 2 {
        cents.push('0');
    }
    whole.checked_mul(100)?.checked_add(cents.parse().ok()?)
}
