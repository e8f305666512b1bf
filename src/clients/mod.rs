pub mod adapter;
pub mod circuit_breaker;
pub mod database;
pub mod dedup;
pub mod fcm;
pub mod health;
pub mod memory;
pub mod preferences;
pub mod rbmq;
pub mod redis;
pub mod sms;
pub mod store;
pub mod whatsapp;
