//! Topic codec: encode and decode broker topic strings
//!
//! Wire format, slash-delimited:
//!
//! ```text
//! coaty/<version>/<eventTypeName>/<associatedUserId|->/<sourceId>/<messageToken>
//! ```
//!
//! The event type name is the event kind, optionally suffixed with
//! `:<filter>` (object type, channel identifier, or operation name). In
//! readable mode, identifiers carry a sanitized human name prefix before the
//! UUID; decoding always recovers the trailing UUID, so readable and
//! canonical peers interoperate.

use uuid::Uuid;

use crate::error::{CommunicationError, CommunicationResult};
use crate::protocol::events::EventKind;

/// Protocol name, first topic level
pub const PROTOCOL_NAME: &str = "coaty";

/// Protocol version, second topic level
pub const PROTOCOL_VERSION: u32 = 1;

/// Placeholder level for an absent associated user
const NO_USER: &str = "-";

/// Single-level wildcard
const WILDCARD_SINGLE: char = '+';

/// Multi-level wildcard
const WILDCARD_MULTI: char = '#';

const UUID_STR_LEN: usize = 36;

/// Structured topic descriptor; the wire string is derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub version: u32,
    pub kind: EventKind,
    /// Filter suffix of the event type name (object type, channel id, or
    /// operation name), for kinds that admit one
    pub event_filter: Option<String>,
    pub associated_user_id: Option<Uuid>,
    pub source_id: Uuid,
    pub message_token: String,
}

impl Topic {
    /// Build a topic for an outgoing event, validating all fields
    pub fn new(
        kind: EventKind,
        event_filter: Option<&str>,
        associated_user_id: Option<Uuid>,
        source_id: Uuid,
        message_token: &str,
    ) -> CommunicationResult<Self> {
        if let Some(filter) = event_filter {
            if !kind.admits_filter_suffix() {
                return Err(CommunicationError::invalid_topic(format!(
                    "{} events do not admit an event filter",
                    kind.as_str()
                )));
            }
            validate_identifier(filter)?;
        }
        if message_token.is_empty() || contains_forbidden_char(message_token) {
            return Err(CommunicationError::invalid_topic("invalid message token"));
        }
        Ok(Self {
            version: PROTOCOL_VERSION,
            kind,
            event_filter: event_filter.map(str::to_owned),
            associated_user_id,
            source_id,
            message_token: message_token.to_string(),
        })
    }

    /// Encode to the canonical wire string
    pub fn encode(&self) -> String {
        let user_level = match self.associated_user_id {
            Some(id) => id.to_string(),
            None => NO_USER.to_string(),
        };
        format!(
            "{}/{}/{}/{}/{}/{}",
            PROTOCOL_NAME,
            self.version,
            self.event_type_level(),
            user_level,
            self.source_id,
            self.message_token
        )
    }

    /// Encode with name-prefixed identifiers (readable mode)
    ///
    /// Names are sanitized and prefixed to the UUID with an underscore
    /// separator; decoding recovers the UUID from the trailing 36 characters.
    pub fn encode_readable(&self, source_name: &str, user_name: Option<&str>) -> String {
        let user_level = match self.associated_user_id {
            Some(id) => readable_identifier(user_name.unwrap_or(""), id),
            None => NO_USER.to_string(),
        };
        format!(
            "{}/{}/{}/{}/{}/{}",
            PROTOCOL_NAME,
            self.version,
            self.event_type_level(),
            user_level,
            readable_identifier(source_name, self.source_id),
            self.message_token
        )
    }

    /// Decode a wire topic string
    ///
    /// Fails with InvalidTopic on a malformed topic: wrong level count,
    /// wrong protocol name, wildcards or NUL anywhere, an unknown event kind,
    /// a filter suffix on a kind that does not admit one, or an identifier
    /// without a recoverable UUID. Version mismatches are not rejected here;
    /// the dispatcher drops them.
    pub fn decode(topic: &str) -> CommunicationResult<Self> {
        if topic.contains('\u{0}') {
            return Err(CommunicationError::invalid_topic("topic contains NUL"));
        }
        if topic.contains(WILDCARD_SINGLE) || topic.contains(WILDCARD_MULTI) {
            return Err(CommunicationError::invalid_topic(
                "topic contains wildcard characters",
            ));
        }

        let levels: Vec<&str> = topic.split('/').collect();
        if levels.len() != 6 {
            return Err(CommunicationError::invalid_topic(format!(
                "expected 6 levels, got {}",
                levels.len()
            )));
        }
        if levels[0] != PROTOCOL_NAME {
            return Err(CommunicationError::invalid_topic(format!(
                "unknown protocol name '{}'",
                levels[0]
            )));
        }
        let version: u32 = levels[1]
            .parse()
            .map_err(|_| CommunicationError::invalid_topic("version level is not an integer"))?;

        let (kind_name, event_filter) = match levels[2].split_once(':') {
            Some((name, filter)) => (name, Some(filter)),
            None => (levels[2], None),
        };
        let kind = EventKind::from_wire_name(kind_name).ok_or_else(|| {
            CommunicationError::invalid_topic(format!("unknown event type '{kind_name}'"))
        })?;
        if let Some(filter) = event_filter {
            if !kind.admits_filter_suffix() {
                return Err(CommunicationError::invalid_topic(format!(
                    "{kind_name} events do not admit an event filter"
                )));
            }
            if filter.is_empty() {
                return Err(CommunicationError::invalid_topic("empty event filter"));
            }
        }

        let associated_user_id = if levels[3] == NO_USER {
            None
        } else {
            Some(decode_identifier(levels[3])?)
        };
        let source_id = decode_identifier(levels[4])?;

        if levels[5].is_empty() {
            return Err(CommunicationError::invalid_topic("empty message token"));
        }

        Ok(Self {
            version,
            kind,
            event_filter: event_filter.map(str::to_owned),
            associated_user_id,
            source_id,
            message_token: levels[5].to_string(),
        })
    }

    /// Subscription filter for observing events of a kind
    ///
    /// User, source, and token levels are wildcarded; the event filter pins
    /// the event type level when given.
    pub fn subscription_filter(
        kind: EventKind,
        event_filter: Option<&str>,
    ) -> CommunicationResult<String> {
        if let Some(filter) = event_filter {
            validate_identifier(filter)?;
        }
        let level = match event_filter {
            Some(filter) => format!("{}:{}", kind.as_str(), filter),
            None => kind.as_str().to_string(),
        };
        Ok(format!("{PROTOCOL_NAME}/{PROTOCOL_VERSION}/{level}/+/+/+"))
    }

    /// Subscription filter for the responses to one request
    ///
    /// The message token level is pinned; sender and user are wildcarded so
    /// any peer's response matches.
    pub fn response_filter(response_kind: EventKind, message_token: &str) -> String {
        format!(
            "{PROTOCOL_NAME}/{PROTOCOL_VERSION}/{}/+/+/{message_token}",
            response_kind.as_str()
        )
    }

    fn event_type_level(&self) -> String {
        match &self.event_filter {
            Some(filter) => format!("{}:{}", self.kind.as_str(), filter),
            None => self.kind.as_str().to_string(),
        }
    }
}

/// Compose a message token from the sender identity and a counter value
pub fn format_message_token(source_id: Uuid, counter: u64) -> String {
    format!("{source_id}_{counter}")
}

/// Validate an operation name, channel identifier, or object-type filter
///
/// Must be non-empty and free of NUL, `#`, `+`, and `/`.
pub fn validate_identifier(identifier: &str) -> CommunicationResult<()> {
    if identifier.is_empty() {
        return Err(CommunicationError::invalid_operation(
            "identifier must not be empty",
        ));
    }
    if contains_forbidden_char(identifier) {
        return Err(CommunicationError::invalid_operation(format!(
            "identifier '{identifier}' contains a forbidden character"
        )));
    }
    Ok(())
}

/// Validate a raw topic for publishing: non-empty, no NUL, no wildcards
pub fn validate_raw_publish_topic(topic: &str) -> CommunicationResult<()> {
    if topic.is_empty() {
        return Err(CommunicationError::invalid_topic("empty raw topic"));
    }
    if topic.contains('\u{0}') {
        return Err(CommunicationError::invalid_topic("raw topic contains NUL"));
    }
    if topic.contains(WILDCARD_SINGLE) || topic.contains(WILDCARD_MULTI) {
        return Err(CommunicationError::invalid_topic(
            "wildcards are not allowed in published topics",
        ));
    }
    Ok(())
}

/// Validate a raw topic filter for subscribing: non-empty, no NUL
pub fn validate_raw_subscription_filter(filter: &str) -> CommunicationResult<()> {
    if filter.is_empty() {
        return Err(CommunicationError::invalid_topic("empty raw topic filter"));
    }
    if filter.contains('\u{0}') {
        return Err(CommunicationError::invalid_topic(
            "raw topic filter contains NUL",
        ));
    }
    Ok(())
}

/// Replace characters that would break the topic grammar with `_`
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '\u{0}' | '#' | '+' | '/' => '_',
            other => other,
        })
        .collect()
}

fn readable_identifier(name: &str, id: Uuid) -> String {
    format!("{}_{}", sanitize_name(name), id)
}

/// Recover the UUID from a canonical or readable identifier level
fn decode_identifier(level: &str) -> CommunicationResult<Uuid> {
    if let Ok(id) = Uuid::parse_str(level) {
        return Ok(id);
    }
    if level.len() > UUID_STR_LEN {
        if let Some(tail) = level.get(level.len() - UUID_STR_LEN..) {
            if let Ok(id) = Uuid::parse_str(tail) {
                return Ok(id);
            }
        }
    }
    Err(CommunicationError::invalid_topic(format!(
        "identifier level '{level}' carries no UUID"
    )))
}

fn contains_forbidden_char(s: &str) -> bool {
    s.chars()
        .any(|ch| matches!(ch, '\u{0}' | '#' | '+' | '/'))
}
