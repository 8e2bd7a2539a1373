//! W3C `traceparent` propagation through call metadata.
//!
//! The bus extracts a context from incoming metadata, derives a child span
//! for the call and writes it back so every handler sees the same trace id.

use std::collections::BTreeMap;

use uuid::Uuid;

/// Metadata key carrying the propagated context.
pub const TRACEPARENT: &str = "traceparent";

const VERSION: &str = "00";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
    sampled: bool,
}

impl TraceContext {
    /// Start a new trace.
    #[must_use]
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            sampled: true,
        }
    }

    /// Parse a `traceparent` header value.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != VERSION {
            return None;
        }
        if !is_hex_id(trace_id, 32) || !is_hex_id(span_id, 16) || !is_hex(flags, 2) {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;
        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            sampled: flags & 0x01 == 0x01,
        })
    }

    /// A new span in the same trace.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            sampled: self.sampled,
        }
    }

    #[must_use]
    pub fn header(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("{VERSION}-{}-{}-{flags}", self.trace_id, self.span_id)
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Read the context carried by `metadata`, if any is present and valid.
    #[must_use]
    pub fn extract(metadata: &BTreeMap<String, String>) -> Option<Self> {
        metadata.get(TRACEPARENT).and_then(|value| Self::parse(value))
    }

    pub fn inject(&self, metadata: &mut BTreeMap<String, String>) {
        metadata.insert(TRACEPARENT.to_string(), self.header());
    }

    /// Continue the incoming trace (or start one) and write the call's span
    /// back into `metadata`.
    pub fn propagate(metadata: &mut BTreeMap<String, String>) -> Self {
        let context = Self::extract(metadata).map_or_else(Self::root, |parent| parent.child());
        context.inject(metadata);
        context
    }
}

fn new_span_id() -> String {
    format!("{:016x}", Uuid::new_v4().as_u64_pair().0)
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_hex_id(value: &str, len: usize) -> bool {
    is_hex(value, len) && value.chars().any(|c| c != '0')
}
