pub mod attempt;
pub mod channel;
pub mod circuit_breaker;
pub mod fcm;
pub mod health;
pub mod log;
pub mod message;
pub mod preference;
pub mod report;
pub mod request;
pub mod response;
pub mod retry;
pub mod status;
pub mod validation;
