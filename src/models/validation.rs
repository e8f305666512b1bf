use anyhow::{Result, anyhow};

pub fn validate_fcm_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(anyhow!("Device token cannot be empty"));
    }

    if token.len() < 20 {
        return Err(anyhow!("Device token too short (minimum 20 characters)"));
    }

    if token.len() > 4096 {
        return Err(anyhow!("Device token too long (maximum 4096 characters)"));
    }

    let valid_chars = token
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.');

    if !valid_chars {
        return Err(anyhow!("Device token contains invalid characters"));
    }

    Ok(())
}

/// E.164: leading '+', 8 to 15 digits.
pub fn validate_phone_number(phone: &str) -> Result<()> {
    let digits = phone
        .strip_prefix('+')
        .ok_or_else(|| anyhow!("Phone number must start with '+'"))?;

    if digits.len() < 8 || digits.len() > 15 {
        return Err(anyhow!("Phone number must have 8 to 15 digits"));
    }

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(anyhow!("Phone number contains non-digit characters"));
    }

    Ok(())
}
