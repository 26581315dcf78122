//! Utility functions for identifiers and code formatting

use bech32::Bech32m;
use uuid7::uuid7;

pub const CODE_LENGTH: usize = 6;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Trims a presented code and returns it only if it is exactly six ASCII
/// digits. Codes stay text throughout so leading zeros survive.
pub fn normalise_code(input: Option<&str>) -> Option<&str> {
    let code = input?.trim();
    if code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit()) {
        Some(code)
    } else {
        None
    }
}

/// Renders a numeric draw as a zero padded six digit code.
pub fn format_code(value: u32) -> String {
    format!("{:0width$}", value, width = CODE_LENGTH)
}
