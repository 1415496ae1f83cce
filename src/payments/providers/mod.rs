pub mod midtrans;
pub mod xendit;

pub use midtrans::{MidtransConfig, MidtransProvider};
pub use xendit::{XenditConfig, XenditProvider};
