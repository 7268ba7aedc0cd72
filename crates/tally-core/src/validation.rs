//! # Validation Module
//!
//! Input validation for requests that end up on the terminal or in a query.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Requester (enqueues provisioning work)                       │
//! │  └── THIS MODULE: field presence and terminal limits                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Database (SQLite)                                            │
//! │  ├── NOT NULL constraints                                              │
//! │  ├── CHECK (status IN (...)), CHECK (length(last_error) <= 4000)       │
//! │  └── UNIQUE (device_serial, user_id, event_timestamp)                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Terminal                                                     │
//! │  └── Rejects oversize records with ACK_ERROR                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::{MarkQuery, NewQueueItem};
use crate::{MAX_DEVICE_USER_ID_LEN, MAX_DEVICE_USER_NAME_LEN, MAX_ERROR_TEXT_LEN, MAX_MARK_QUERY_LIMIT};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a terminal enrollment identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 24 bytes (the terminal's fixed record width)
/// - No control characters
///
/// ## Example
/// ```rust
/// use tally_core::validation::validate_device_user_id;
///
/// assert!(validate_device_user_id("1001").is_ok());
/// assert!(validate_device_user_id("").is_err());
/// ```
pub fn validate_device_user_id(user_id: &str) -> ValidationResult<()> {
    let user_id = user_id.trim();

    if user_id.is_empty() {
        return Err(ValidationError::Required {
            field: "device_user_id".to_string(),
        });
    }

    if user_id.len() > MAX_DEVICE_USER_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "device_user_id".to_string(),
            max: MAX_DEVICE_USER_ID_LEN,
        });
    }

    if user_id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidFormat {
            field: "device_user_id".to_string(),
            reason: "must not contain control characters".to_string(),
        });
    }

    Ok(())
}

/// Validates a display name destined for the terminal.
pub fn validate_device_user_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "device_user_name".to_string(),
        });
    }

    if name.len() > MAX_DEVICE_USER_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "device_user_name".to_string(),
            max: MAX_DEVICE_USER_NAME_LEN,
        });
    }

    Ok(())
}

/// Validates a provisioning request before it is enqueued.
pub fn validate_new_queue_item(item: &NewQueueItem) -> ValidationResult<()> {
    validate_device_user_id(&item.device_user_id)?;
    validate_device_user_name(&item.device_user_name)?;
    Ok(())
}

// =============================================================================
// Query Validators
// =============================================================================

/// Validates paging and range bounds of a mark listing.
pub fn validate_mark_query(query: &MarkQuery) -> ValidationResult<()> {
    if query.limit == 0 || query.limit > MAX_MARK_QUERY_LIMIT {
        return Err(ValidationError::OutOfRange {
            field: "limit".to_string(),
            min: 1,
            max: i64::from(MAX_MARK_QUERY_LIMIT),
        });
    }

    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(ValidationError::InvalidFormat {
                field: "from".to_string(),
                reason: "must not be later than 'to'".to_string(),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Normalization
// =============================================================================

/// Cuts an error message to the persisted maximum (4000 characters).
///
/// Counts characters, not bytes, so multi-byte text is never split.
pub fn truncate_error_text(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_TEXT_LEN) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_validate_device_user_id() {
        assert!(validate_device_user_id("1001").is_ok());
        assert!(validate_device_user_id("   ").is_err());
        assert!(validate_device_user_id(&"9".repeat(25)).is_err());
        assert!(validate_device_user_id("10\u{7}01").is_err());
    }

    #[test]
    fn test_validate_device_user_name() {
        assert!(validate_device_user_name("María López").is_ok());
        assert!(validate_device_user_name("").is_err());
        assert!(validate_device_user_name(&"x".repeat(40)).is_err());
    }

    #[test]
    fn test_validate_new_queue_item() {
        let item = NewQueueItem {
            company_id: 1,
            person_id: 2,
            device_user_id: "77".to_string(),
            device_user_name: "Pat".to_string(),
        };
        assert!(validate_new_queue_item(&item).is_ok());

        let nameless = NewQueueItem {
            device_user_name: String::new(),
            ..item
        };
        assert!(validate_new_queue_item(&nameless).is_err());
    }

    #[test]
    fn test_validate_mark_query() {
        assert!(validate_mark_query(&MarkQuery::default()).is_ok());

        let zero = MarkQuery { limit: 0, ..MarkQuery::default() };
        assert!(validate_mark_query(&zero).is_err());

        let huge = MarkQuery { limit: 2001, ..MarkQuery::default() };
        assert!(validate_mark_query(&huge).is_err());

        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let inverted = MarkQuery {
            from: day.and_hms_opt(10, 0, 0),
            to: day.and_hms_opt(9, 0, 0),
            ..MarkQuery::default()
        };
        assert!(validate_mark_query(&inverted).is_err());
    }

    #[test]
    fn test_truncate_error_text() {
        assert_eq!(truncate_error_text("short"), "short");

        let long = "é".repeat(MAX_ERROR_TEXT_LEN + 10);
        let cut = truncate_error_text(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_TEXT_LEN);
    }
}
