//! Event kinds, typed payloads and the transport envelope

use crate::messaging::error::{MessagingError, MessagingResult};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize, Serializer};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

/// Closed set of storefront event kinds
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    AsRefStr,
)]
pub enum EventKind {
    /// A product's stock dropped below its reorder threshold
    LowStockAlert,
    /// A customer account was created
    NewCustomerRegistration,
    /// A product was added to the catalog
    NewProductCreation,
    /// An order was placed
    NewOrderCreation,
    /// An invoice must be produced for an order
    InvoiceGeneration,
}

impl EventKind {
    /// All kinds, in declaration order
    pub fn all() -> Vec<EventKind> {
        EventKind::iter().collect()
    }
}

/// Implemented by every typed payload; ties the payload type to its kind.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EventKind;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub current_stock: i64,
    pub threshold: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCustomerRegistration {
    pub customer_id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProductCreation {
    pub product_id: String,
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub initial_stock: i64,
}

/// One line of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price: f64,
}

impl OrderLine {
    pub fn line_total(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderCreation {
    pub order_id: String,
    pub order_number: String,
    pub customer_id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
    pub total: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

/// Full order state captured when the invoice was requested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    #[serde(default)]
    pub lines: Vec<OrderLine>,
    pub subtotal: f64,
    #[serde(default)]
    pub tax: f64,
    pub total: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceGeneration {
    pub order_id: String,
    pub order_number: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub order: OrderSnapshot,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// A domain event with its kind-specific payload.
///
/// Serializes as the bare payload; the kind travels alongside it in the
/// envelope and selects the payload type on decode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainEvent {
    LowStockAlert(LowStockAlert),
    NewCustomerRegistration(NewCustomerRegistration),
    NewProductCreation(NewProductCreation),
    NewOrderCreation(NewOrderCreation),
    InvoiceGeneration(InvoiceGeneration),
}

macro_rules! domain_payload {
    ($($payload:ident),+ $(,)?) => {
        $(
            impl EventPayload for $payload {
                const KIND: EventKind = EventKind::$payload;
            }

            impl From<$payload> for DomainEvent {
                fn from(payload: $payload) -> Self {
                    DomainEvent::$payload(payload)
                }
            }
        )+
    };
}

domain_payload!(
    LowStockAlert,
    NewCustomerRegistration,
    NewProductCreation,
    NewOrderCreation,
    InvoiceGeneration,
);

impl DomainEvent {
    /// Get the event kind
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::LowStockAlert(_) => EventKind::LowStockAlert,
            DomainEvent::NewCustomerRegistration(_) => EventKind::NewCustomerRegistration,
            DomainEvent::NewProductCreation(_) => EventKind::NewProductCreation,
            DomainEvent::NewOrderCreation(_) => EventKind::NewOrderCreation,
            DomainEvent::InvoiceGeneration(_) => EventKind::InvoiceGeneration,
        }
    }

    /// Identifier of the business entity the event is about, for logs
    pub fn entity_id(&self) -> &str {
        match self {
            DomainEvent::LowStockAlert(e) => &e.product_id,
            DomainEvent::NewCustomerRegistration(e) => &e.customer_id,
            DomainEvent::NewProductCreation(e) => &e.product_id,
            DomainEvent::NewOrderCreation(e) => &e.order_id,
            DomainEvent::InvoiceGeneration(e) => &e.order_id,
        }
    }

    /// Decode an untyped payload as the payload type of `kind`
    pub fn from_value(kind: EventKind, payload: serde_json::Value) -> serde_json::Result<Self> {
        match kind {
            EventKind::LowStockAlert => serde_json::from_value(payload).map(Self::LowStockAlert),
            EventKind::NewCustomerRegistration => {
                serde_json::from_value(payload).map(Self::NewCustomerRegistration)
            }
            EventKind::NewProductCreation => {
                serde_json::from_value(payload).map(Self::NewProductCreation)
            }
            EventKind::NewOrderCreation => serde_json::from_value(payload).map(Self::NewOrderCreation),
            EventKind::InvoiceGeneration => {
                serde_json::from_value(payload).map(Self::InvoiceGeneration)
            }
        }
    }
}

/// Transport wrapper placed on the broker for every event
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct EventEnvelope {
    /// Producer-assigned unique id, used for idempotency and tracing
    pub id: Uuid,

    /// When the producer observed the event
    pub occurred_at: DateTime<Utc>,

    /// Event payload
    pub event: DomainEvent,
}

#[derive(Deserialize)]
struct WireEnvelope {
    id: Uuid,
    kind: EventKind,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    id: &'a Uuid,
    kind: EventKind,
    occurred_at: &'a DateTime<Utc>,
    payload: &'a DomainEvent,
}

impl TryFrom<WireEnvelope> for EventEnvelope {
    type Error = serde_json::Error;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        Ok(Self {
            id: wire.id,
            occurred_at: wire.occurred_at,
            event: DomainEvent::from_value(wire.kind, wire.payload)?,
        })
    }
}

impl Serialize for EventEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEnvelopeRef {
            id: &self.id,
            kind: self.kind(),
            occurred_at: &self.occurred_at,
            payload: &self.event,
        }
        .serialize(serializer)
    }
}

impl EventEnvelope {
    /// Wrap an event with a fresh id and the current time
    pub fn new(event: impl Into<DomainEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event: event.into(),
        }
    }

    /// Build an envelope from an untyped JSON payload
    pub fn from_json_payload(kind: EventKind, payload: serde_json::Value) -> MessagingResult<Self> {
        let event = DomainEvent::from_value(kind, payload)
            .map_err(|e| MessagingError::SerializationError(format!("invalid {} payload: {}", kind, e)))?;
        Ok(Self::new(event))
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Encode for transport
    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message body
    pub fn from_slice(body: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(body).map_err(|e| MessagingError::MalformedMessage(e.to_string()))
    }
}
