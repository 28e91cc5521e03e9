pub mod identity;
pub mod payment;

pub use identity::{RequesterContext, RequesterRole};
pub use payment::{
    ConfirmRequest, GatewayError, GatewayReceipt, PaymentGateway, PaymentRecord, PaymentRecordError,
    PaymentStatus, RefundRequest,
};
