use chrono::{DateTime, Utc};
use optia_core::CoreError;
use optia_shared::pii::Masked;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle stage of an order. Ordinal order is the only legal advancement
/// path: an order may only ever move to the numerically next status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i16)]
pub enum OrderStatus {
    Created = 0,
    Registered = 1,
    ReadyForDispatch = 2,
    InTransitToBranch = 3,
    ReceivedAtBranch = 4,
    SentToLab = 5,
    ReadyAtLab = 6,
    ReceivedAtCentralBranch = 7,
    ReadyForPickup = 8,
    ReceivedAtOriginBranch = 9,
    DeliveredToCustomer = 10,
}

impl OrderStatus {
    pub const FIRST: OrderStatus = OrderStatus::Created;
    pub const LAST: OrderStatus = OrderStatus::DeliveredToCustomer;

    pub fn ordinal(self) -> i16 {
        self as i16
    }

    /// The only status this one may advance to, if any.
    pub fn next(self) -> Option<OrderStatus> {
        OrderStatus::try_from(self.ordinal() + 1).ok()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Created => "Created",
            OrderStatus::Registered => "Registered",
            OrderStatus::ReadyForDispatch => "ReadyForDispatch",
            OrderStatus::InTransitToBranch => "InTransitToBranch",
            OrderStatus::ReceivedAtBranch => "ReceivedAtBranch",
            OrderStatus::SentToLab => "SentToLab",
            OrderStatus::ReadyAtLab => "ReadyAtLab",
            OrderStatus::ReceivedAtCentralBranch => "ReceivedAtCentralBranch",
            OrderStatus::ReadyForPickup => "ReadyForPickup",
            OrderStatus::ReceivedAtOriginBranch => "ReceivedAtOriginBranch",
            OrderStatus::DeliveredToCustomer => "DeliveredToCustomer",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i16> for OrderStatus {
    type Error = CoreError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OrderStatus::Created),
            1 => Ok(OrderStatus::Registered),
            2 => Ok(OrderStatus::ReadyForDispatch),
            3 => Ok(OrderStatus::InTransitToBranch),
            4 => Ok(OrderStatus::ReceivedAtBranch),
            5 => Ok(OrderStatus::SentToLab),
            6 => Ok(OrderStatus::ReadyAtLab),
            7 => Ok(OrderStatus::ReceivedAtCentralBranch),
            8 => Ok(OrderStatus::ReadyForPickup),
            9 => Ok(OrderStatus::ReceivedAtOriginBranch),
            10 => Ok(OrderStatus::DeliveredToCustomer),
            other => Err(CoreError::InvalidStatus(other)),
        }
    }
}

/// Which lab a job was dispatched to. Required on the SentToLab transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabKind {
    Internal,
    External,
}

impl LabKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LabKind::Internal => "Internal",
            LabKind::External => "External",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Internal" => Some(LabKind::Internal),
            "External" => Some(LabKind::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
}

impl PaymentMethod {
    /// Case-insensitive parse, mirroring how payment methods arrive from the
    /// front desk UI.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "cash" => Some(PaymentMethod::Cash),
            "card" => Some(PaymentMethod::Card),
            "transfer" => Some(PaymentMethod::Transfer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "Cash",
            PaymentMethod::Card => "Card",
            PaymentMethod::Transfer => "Transfer",
        }
    }
}

/// One patient visit/fulfillment job tracked through its lifecycle.
///
/// `balance_due == total.unwrap_or(0) - amount_paid` must hold after every
/// mutation that touches financials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub branch_id: Uuid,
    pub patient_id: Uuid,
    pub created_by: Uuid,
    pub created_by_name: String,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub observations: Option<String>,
    pub total: Option<Decimal>,
    pub amount_paid: Decimal,
    pub balance_due: Decimal,
    // Milestone timestamps, each set at most once (first write wins).
    pub sent_to_lab_at: Option<DateTime<Utc>>,
    pub estimated_delivery_at: Option<DateTime<Utc>>,
    pub received_at_branch_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Immutable audit record of one status transition. Never mutated or deleted;
/// ordered by timestamp to reconstruct an order's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub from_status: OrderStatus,
    pub to_status: OrderStatus,
    pub user_id: Uuid,
    pub user_name: String,
    pub branch_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub note: Option<String>,
    pub lab_kind: Option<LabKind>,
    pub lab_id: Option<Uuid>,
    pub lab_name: Option<String>,
}

/// One billable concept attached to an order. The set of line items is
/// replaced wholesale, never patched individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub label: String,
    pub amount: Decimal,
    pub user_id: Uuid,
    pub user_name: String,
    pub branch_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// An amount applied against an order's total. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub authorization: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Clinical sub-records (owned children, immutable once created)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Eye {
    Right,
    Left,
}

impl Eye {
    pub fn as_str(self) -> &'static str {
        match self {
            Eye::Right => "Right",
            Eye::Left => "Left",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Right" => Some(Eye::Right),
            "Left" => Some(Eye::Left),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvCondition {
    Unaided,
    Corrected,
}

impl AvCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            AvCondition::Unaided => "Unaided",
            AvCondition::Corrected => "Corrected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Unaided" => Some(AvCondition::Unaided),
            "Corrected" => Some(AvCondition::Corrected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RxDistance {
    Far,
    Near,
}

impl RxDistance {
    pub fn as_str(self) -> &'static str {
        match self {
            RxDistance::Far => "Far",
            RxDistance::Near => "Near",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Far" => Some(RxDistance::Far),
            "Near" => Some(RxDistance::Near),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionKind {
    Material,
    Frame,
    ContactLens,
}

impl SelectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionKind::Material => "Material",
            SelectionKind::Frame => "Frame",
            SelectionKind::ContactLens => "ContactLens",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Material" => Some(SelectionKind::Material),
            "Frame" => Some(SelectionKind::Frame),
            "ContactLens" => Some(SelectionKind::ContactLens),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualAcuity {
    pub id: Uuid,
    pub order_id: Uuid,
    pub condition: AvCondition,
    pub eye: Eye,
    /// 20/N denominator, clamped to 10..=200 at creation.
    pub denominator: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxMeasurement {
    pub id: Uuid,
    pub order_id: Uuid,
    pub eye: Eye,
    pub distance: RxDistance,
    pub sph: Option<Decimal>,
    pub cyl: Option<Decimal>,
    pub axis: Option<i32>,
    pub add: Option<Decimal>,
    pub pd: Option<String>,
    pub seg_height: Option<Decimal>,
}

/// A material, frame or contact-lens choice recorded on the prescription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub id: Uuid,
    pub order_id: Uuid,
    pub kind: SelectionKind,
    pub reference_id: Option<Uuid>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub note: Option<String>,
}

// ============================================================================
// Input payloads
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct NewVisualAcuity {
    pub condition: AvCondition,
    pub eye: Eye,
    pub denominator: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRxMeasurement {
    pub eye: Eye,
    pub distance: RxDistance,
    pub sph: Option<Decimal>,
    pub cyl: Option<Decimal>,
    pub axis: Option<i32>,
    pub add: Option<Decimal>,
    pub pd: Option<String>,
    pub seg_height: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSelection {
    pub kind: SelectionKind,
    pub reference_id: Option<Uuid>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub patient_id: Uuid,
    pub observations: Option<String>,
    /// Quoted total at intake, if known. Line items may replace it later.
    pub total: Option<Decimal>,
    #[serde(default)]
    pub acuities: Vec<NewVisualAcuity>,
    #[serde(default)]
    pub rx: Vec<NewRxMeasurement>,
    #[serde(default)]
    pub selections: Vec<NewSelection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLineItem {
    pub label: String,
    pub amount: Decimal,
    pub note: Option<String>,
}

/// Payment as submitted by a caller; the method arrives as free text and must
/// parse to a known enumeration value.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub method: String,
    pub amount: Decimal,
    pub authorization: Option<String>,
    pub note: Option<String>,
}

/// Requested status change, as it arrives over the wire. The destination is
/// a raw ordinal so undefined values can be rejected with a precise error.
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionCommand {
    pub to_status: i16,
    pub note: Option<String>,
    pub lab_kind: Option<String>,
    pub lab_id: Option<Uuid>,
    pub lab_name: Option<String>,
}

/// Grid filters for the orders list.
#[derive(Debug, Clone, Default)]
pub struct OrderQuery {
    pub page: i64,
    pub page_size: i64,
    pub search: Option<String>,
    pub status: Option<OrderStatus>,
}

// ============================================================================
// Read views
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PatientSummary {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<Masked<String>>,
}

/// Full order view: the order plus its owned children and the patient/branch
/// summaries a caller needs to render it.
#[derive(Debug, Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: Order,
    pub patient: PatientSummary,
    pub branch_name: String,
    pub line_items: Vec<LineItem>,
    pub payments: Vec<Payment>,
    pub acuities: Vec<VisualAcuity>,
    pub rx: Vec<RxMeasurement>,
    pub selections: Vec<Selection>,
}

/// One row of the orders grid, including the denormalized tail of the audit
/// trail (most recent lab dispatch info and last activity timestamp).
#[derive(Debug, Clone, Serialize)]
pub struct OrderRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub patient_name: String,
    pub user_name: String,
    pub status: OrderStatus,
    pub total: Option<Decimal>,
    pub amount_paid: Decimal,
    pub balance_due: Decimal,
    pub branch_name: String,
    pub lab_kind: Option<LabKind>,
    pub lab_name: Option<String>,
    pub last_status_at: Option<DateTime<Utc>>,
}

/// Board row for orders currently dispatched to a lab.
#[derive(Debug, Clone, Serialize)]
pub struct LabBoardRow {
    pub id: Uuid,
    pub sent_to_lab_at: Option<DateTime<Utc>>,
    pub patient_name: String,
    pub patient_phone: Option<Masked<String>>,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub balance_due: Decimal,
    pub observations: Option<String>,
    pub estimated_delivery_at: Option<DateTime<Utc>>,
}

/// Recent-visit row for a patient's record card. Financials are re-summed
/// from the payment rows rather than read from the order snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PatientVisitRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub total: Option<Decimal>,
    pub amount_paid: Decimal,
    pub balance_due: Decimal,
    pub branch_name: String,
    pub user_name: String,
}

/// Result of a wholesale line-item replacement.
#[derive(Debug, Serialize)]
pub struct LineItemsView {
    pub order_id: Uuid,
    pub total: Decimal,
    pub items: Vec<LineItem>,
}
