/// Event types that bypass per-category opt-outs. Hard opt-outs still apply.
pub const CRITICAL_EVENT_TYPES: &[&str] = &[
    "sla_alert",
    "receipt_delivery",
    "otp",
    "payment_confirmation",
];

/// Event types suppressed over a shorter dedup window.
pub const CRITICAL_DEDUP_EVENT_TYPES: &[&str] = &["payment_confirmation", "receipt_delivery", "otp"];

/// Event type to the preference category that governs it.
pub const PREFERENCE_FIELDS: &[(&str, &str)] = &[
    ("service_update", "service_updates"),
    ("payment_confirmation", "payment_updates"),
    ("payout", "payment_updates"),
    ("commission_update", "earnings_updates"),
    ("kyc_update", "account_updates"),
    ("support_ticket", "support_updates"),
    ("promotion", "marketing"),
];

pub fn is_critical_event(event_type: &str) -> bool {
    CRITICAL_EVENT_TYPES.contains(&event_type)
}

pub fn preference_field(event_type: &str) -> Option<&'static str> {
    PREFERENCE_FIELDS
        .iter()
        .find(|(event, _)| *event == event_type)
        .map(|(_, field)| *field)
}
