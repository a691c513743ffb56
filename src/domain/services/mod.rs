//! Pure domain services
pub mod stock_ledger;
pub mod tariff;

pub use stock_ledger::{StockAdjustment, StockLedger};
pub use tariff::{TariffRow, TariffTable};
