//! Aggregates module
pub mod product;
pub mod order;
pub mod cart;
pub mod payment;

pub use product::{apply_stock_delta, Product, StockTarget, Variant};
pub use order::{Carrier, Contact, Order, OrderError, OrderItem, OrderParts, OrderStatus, PickupPointRef, ShippingInfo, ShippingMethod};
pub use cart::{Cart, CartItem};
pub use payment::{PaymentError, PaymentMethod, PaymentRecord, PaymentStatus, UnknownValue};
