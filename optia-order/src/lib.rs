pub mod history;
pub mod lifecycle;
pub mod memory;
pub mod models;
pub mod reconcile;
pub mod store;
pub mod visibility;

pub use memory::MemoryOrderStore;
pub use models::{
    LabKind, LineItem, Order, OrderStatus, Payment, PaymentMethod, StatusEvent,
};
pub use store::OrderStore;
pub use visibility::OrderScope;
