//! Human-in-the-loop approval: request documents and the relocation gateway.

pub mod gateway;
pub mod request;

pub use gateway::{ApprovalGateway, ApprovalTicket};
pub use request::{ApprovalRequest, Resolution, RiskLevel};
