//! Transport wrapping for confidentiality.
//!
//! The delivery core never looks at bytes; a connection layer wraps its raw
//! byte pipes with a [`SecurityLayer`] and hands the result on as an opaque
//! transport.

use bytes::Bytes;

use crate::core::error::TransportError;

pub trait ByteSender: Send + Sync {
    fn send(&self, bytes: Bytes) -> Result<(), TransportError>;

    fn flush(&self) -> Result<(), TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}

pub trait ByteReceiver: Send + Sync {
    fn received(&self, bytes: Bytes);

    fn exception(&self, error: TransportError);

    fn closed(&self);
}

pub trait SecurityLayer: Send + Sync {
    fn sender(&self, delegate: Box<dyn ByteSender>) -> Box<dyn ByteSender>;

    fn receiver(&self, delegate: Box<dyn ByteReceiver>) -> Box<dyn ByteReceiver>;

    /// Authenticated peer identity, if the layer established one.
    fn user_id(&self) -> Option<&str>;
}

/// Pass-through layer for connections without a negotiated security layer.
#[derive(Debug, Default, Clone)]
pub struct PlainSecurityLayer {
    user_id: Option<String>,
}

impl PlainSecurityLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

impl SecurityLayer for PlainSecurityLayer {
    fn sender(&self, delegate: Box<dyn ByteSender>) -> Box<dyn ByteSender> {
        delegate
    }

    fn receiver(&self, delegate: Box<dyn ByteReceiver>) -> Box<dyn ByteReceiver> {
        delegate
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}
