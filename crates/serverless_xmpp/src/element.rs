//! Stream elements — control elements and typed application stanzas.
//!
//! The stream state machine only interprets the control elements
//! (stream open/close, features, compression negotiation). Everything else
//! travels as an opaque [`Stanza`] and is dispatched to the application.

use serde::{Deserialize, Serialize};

use crate::identity::PeerIdentity;
use crate::presence::PresenceStatus;

pub const STREAM_NAMESPACE: &str = "http://etherx.jabber.org/streams";
pub const CLIENT_NAMESPACE: &str = "jabber:client";
pub const COMPRESS_NAMESPACE: &str = "http://jabber.org/protocol/compress";
pub const CAPS_NAMESPACE: &str = "http://jabber.org/protocol/caps";
pub const DISCO_INFO_NAMESPACE: &str = "http://jabber.org/protocol/disco#info";

/// Version announced by streams that support the features handshake.
pub const STREAM_VERSION: &str = "1.0";

/// A top-level element on a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum Element {
    StreamOpen(StreamHeader),
    StreamClose { namespace: String },
    Features(StreamFeatures),
    Compress { method: String },
    Compressed,
    Failure { namespace: String, condition: String },
    Stanza(Stanza),
}

impl Element {
    /// The closing tag every conformant peer sends.
    pub fn stream_close() -> Self {
        Self::StreamClose {
            namespace: STREAM_NAMESPACE.to_string(),
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StreamOpen(_) => "stream-open",
            Self::StreamClose { .. } => "stream-close",
            Self::Features(_) => "features",
            Self::Compress { .. } => "compress",
            Self::Compressed => "compressed",
            Self::Failure { .. } => "failure",
            Self::Stanza(_) => "stanza",
        }
    }
}

/// Attributes of a stream-open element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StreamHeader {
    /// Whether the sender declared the versioned (features) handshake.
    pub fn is_versioned(&self) -> bool {
        self.version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.trim().parse::<u32>().ok())
            .is_some_and(|major| major >= 1)
    }
}

/// Optional capabilities advertised after the stream is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFeatures {
    #[serde(default)]
    pub compression_methods: Vec<String>,
    /// Namespaces of any other advertised features.
    #[serde(default)]
    pub extras: Vec<String>,
}

// ── Stanzas ────────────────────────────────────────────────────────────

/// An application stanza.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stanza {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerIdentity>,
    pub kind: StanzaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stanza", rename_all = "snake_case")]
pub enum StanzaKind {
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
    },
    Presence {
        available: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        show: Option<PresenceStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    Iq {
        iq_type: IqType,
        payload: IqPayload,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum IqPayload {
    Empty,
    Roster {
        #[serde(default)]
        items: Vec<RosterItem>,
    },
    DiscoInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<String>,
        #[serde(default)]
        identities: Vec<DiscoIdentity>,
        #[serde(default)]
        features: Vec<String>,
    },
    Error {
        condition: ErrorCondition,
    },
    Custom {
        namespace: String,
        #[serde(default)]
        body: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    pub identity: PeerIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    None,
    Both,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoIdentity {
    pub category: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCondition {
    FeatureNotImplemented,
    ServiceUnavailable,
    BadRequest,
}

impl Stanza {
    fn with_kind(to: Option<PeerIdentity>, kind: StanzaKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            from: None,
            to,
            kind,
        }
    }

    /// A chat message to `to`.
    pub fn message(to: PeerIdentity, body: impl Into<String>) -> Self {
        Self::with_kind(
            Some(to),
            StanzaKind::Message {
                body: Some(body.into()),
                thread: None,
            },
        )
    }

    /// An available presence with optional show/status.
    pub fn presence(show: Option<PresenceStatus>, status: Option<String>) -> Self {
        Self::with_kind(
            None,
            StanzaKind::Presence {
                available: true,
                show,
                status,
            },
        )
    }

    /// An unavailable presence.
    pub fn unavailable() -> Self {
        Self::with_kind(
            None,
            StanzaKind::Presence {
                available: false,
                show: None,
                status: None,
            },
        )
    }

    pub fn iq(to: Option<PeerIdentity>, iq_type: IqType, payload: IqPayload) -> Self {
        Self::with_kind(to, StanzaKind::Iq { iq_type, payload })
    }

    pub fn with_from(mut self, from: PeerIdentity) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn iq_type(&self) -> Option<IqType> {
        match &self.kind {
            StanzaKind::Iq { iq_type, .. } => Some(*iq_type),
            _ => None,
        }
    }

    /// Whether this is an IQ that expects a result or error back.
    pub fn is_request(&self) -> bool {
        matches!(self.iq_type(), Some(IqType::Get | IqType::Set))
    }

    pub fn is_presence(&self) -> bool {
        matches!(self.kind, StanzaKind::Presence { .. })
    }

    /// Build a result reply to this request, addressed back to its sender.
    pub fn result_reply(&self, payload: IqPayload) -> Stanza {
        Stanza {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind: StanzaKind::Iq {
                iq_type: IqType::Result,
                payload,
            },
        }
    }

    /// Build an error reply to this request, addressed back to its sender.
    pub fn error_reply(&self, condition: ErrorCondition) -> Stanza {
        Stanza {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind: StanzaKind::Iq {
                iq_type: IqType::Error,
                payload: IqPayload::Error { condition },
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
