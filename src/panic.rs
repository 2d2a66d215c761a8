//! Utilities for working with panic payloads.
//!
//! Listener callbacks run inside `catch_unwind`; these helpers turn the
//! captured payload into something that can be logged.

use std::{any::Any, fmt};

/// Text extracted from a `panic!` payload.
///
/// The payload is downcast to `String` or `&'static str` if possible and falls
/// back to a placeholder otherwise.
///
/// ```
/// use broker_pubsub::panic::format_panic;
/// assert_eq!(format_panic(&"boom").to_string(), "boom");
/// assert_eq!(format_panic(&String::from("boom")).to_string(), "boom");
/// assert!(format_panic(&5_u32).to_string().contains("non-string"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct PanicMessage(String);

impl PanicMessage {
    /// Borrow the extracted text.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Create a [`PanicMessage`] for the given payload.
///
/// Pass the dereferenced payload (`&*payload`) rather than the `Box` itself,
/// otherwise the box is what gets downcast.
pub fn format_panic(panic: &(dyn Any + Send)) -> PanicMessage {
    if let Some(s) = panic.downcast_ref::<String>() {
        PanicMessage(s.clone())
    } else if let Some(s) = panic.downcast_ref::<&'static str>() {
        PanicMessage((*s).to_owned())
    } else {
        PanicMessage("<non-string panic payload>".to_owned())
    }
}
