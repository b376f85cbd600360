//! ASCII servo framing: `<a1,a2,...,an>` with integer degrees, acknowledged by `K`.

use super::ActuatorError;

pub const FRAME_START: char = '<';
pub const FRAME_END: char = '>';
pub const ACK_TOKEN: u8 = b'K';
pub const DEFAULT_BAUD: u32 = 115_200;

/// Encode physical channel values, rounded to whole degrees.
pub fn encode_frame(values: &[f32]) -> String {
    let body: Vec<String> = values
        .iter()
        .map(|v| format!("{}", v.round() as i32))
        .collect();
    format!("{}{}{}", FRAME_START, body.join(","), FRAME_END)
}

/// Parse operator input: `<a,b,c>` or a bare `a,b,c` list.
pub fn parse_channels(input: &str) -> Result<Vec<f32>, ActuatorError> {
    let trimmed = input.trim();
    let inner = match (trimmed.strip_prefix(FRAME_START), trimmed.ends_with(FRAME_END)) {
        (Some(rest), true) => &rest[..rest.len() - 1],
        (None, false) => trimmed,
        _ => {
            return Err(ActuatorError::Malformed(format!(
                "unbalanced frame delimiters in '{}'",
                trimmed
            )))
        }
    };
    if inner.trim().is_empty() {
        return Err(ActuatorError::Malformed("empty pose".to_string()));
    }
    inner
        .split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<f32>()
                .map_err(|_| ActuatorError::Malformed(format!("'{}' is not a number", part)))
        })
        .collect()
}

/// Outcome of reading the controller's reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ack {
    Received,
    Missing,
    Garbled(String),
}

pub fn classify_ack(reply: &[u8]) -> Ack {
    let text = String::from_utf8_lossy(reply);
    let text = text.trim();
    if text.is_empty() {
        Ack::Missing
    } else if text.as_bytes().contains(&ACK_TOKEN) {
        Ack::Received
    } else {
        Ack::Garbled(text.to_string())
    }
}
