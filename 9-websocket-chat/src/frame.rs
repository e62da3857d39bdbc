//! Plain-text wire vocabulary shared by the endpoint and the broker.
//!
//! Frames carry no header or type tag on the wire. Server frames are told
//! apart by a literal prefix, and the first client frame of a connection is
//! the sender's display name. Both conventions are kept for compatibility
//! with existing peers, but inside the crate every frame is a tagged enum.

/// Literal prefix that marks a presence update on the wire.
pub const PRESENCE_PREFIX: &str = "Online Users: ";

/// Separator used between names in a presence roster.
const ROSTER_SEPARATOR: &str = ", ";

/// Frames sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Online-user summary; the text after [`PRESENCE_PREFIX`].
    Presence { users: String },
    /// Anything else, displayed verbatim.
    Chat { text: String },
}

impl Frame {
    /// Classifies an inbound payload.
    ///
    /// Never fails: a payload that does not start with [`PRESENCE_PREFIX`]
    /// is a chat message carrying the payload unchanged. A chat line that
    /// happens to start with the prefix is indistinguishable from a presence
    /// update and is classified as one.
    pub fn classify(payload: &str) -> Self {
        match payload.strip_prefix(PRESENCE_PREFIX) {
            Some(users) => Frame::Presence {
                users: users.to_string(),
            },
            None => Frame::Chat {
                text: payload.to_string(),
            },
        }
    }

    /// Builds a presence frame listing `names` in order.
    pub fn presence<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let users = names
            .into_iter()
            .map(|name| name.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(ROSTER_SEPARATOR);
        Frame::Presence { users }
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Frame::Chat { text: text.into() }
    }

    /// Renders the frame as its wire payload.
    pub fn encode(&self) -> String {
        match self {
            Frame::Presence { users } => format!("{PRESENCE_PREFIX}{users}"),
            Frame::Chat { text } => text.clone(),
        }
    }
}

/// Frames sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Announces the sender's display name. Always the first frame.
    Join { name: String },
    Chat { text: String },
}

impl ClientFrame {
    /// Interprets a client payload given whether the connection has already
    /// joined.
    pub fn decode(payload: &str, joined: bool) -> Self {
        if joined {
            ClientFrame::Chat {
                text: payload.to_string(),
            }
        } else {
            ClientFrame::Join {
                name: payload.to_string(),
            }
        }
    }

    /// Both variants travel as the bare text.
    pub fn encode(&self) -> String {
        match self {
            ClientFrame::Join { name } => name.clone(),
            ClientFrame::Chat { text } => text.clone(),
        }
    }
}
