//! WAS control-channel command codes.

/// Control-channel commands.
///
/// The numeric values occupy a registered space shared with the peer and
/// must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// No operation; legal in both directions, ignored on receipt.
    Nop = 0,
    /// Begin a new request (peer to worker).
    Request = 1,
    /// HTTP method, u32 payload (peer to worker).
    Method = 2,
    /// Request URI (peer to worker).
    Uri = 3,
    /// SCRIPT_NAME attribute (peer to worker).
    ScriptName = 4,
    /// PATH_INFO attribute (peer to worker).
    PathInfo = 5,
    /// Query string (peer to worker).
    QueryString = 6,
    /// A request or response header, `name=value` payload.
    Header = 7,
    /// A WAS parameter, `name=value` payload (peer to worker).
    Parameter = 8,
    /// HTTP response status, u32 payload (worker to peer).
    Status = 9,
    /// The entity on this direction has no body.
    NoData = 10,
    /// A body follows on the corresponding pipe.
    Data = 11,
    /// Declared body length, u64 payload.
    Length = 12,
    /// Stop sending the entity body on this direction.
    Stop = 13,
    /// The body ended early at the given u64 byte offset.
    Premature = 14,
    /// REMOTE_HOST attribute (peer to worker).
    RemoteHost = 15,
    /// Peer to worker: the peer wants metrics for this request.
    /// Worker to peer: one metric sample, f32 value followed by the name.
    Metric = 16,
}

impl Command {
    /// Try to convert a wire code to a command.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Command::Nop),
            1 => Some(Command::Request),
            2 => Some(Command::Method),
            3 => Some(Command::Uri),
            4 => Some(Command::ScriptName),
            5 => Some(Command::PathInfo),
            6 => Some(Command::QueryString),
            7 => Some(Command::Header),
            8 => Some(Command::Parameter),
            9 => Some(Command::Status),
            10 => Some(Command::NoData),
            11 => Some(Command::Data),
            12 => Some(Command::Length),
            13 => Some(Command::Stop),
            14 => Some(Command::Premature),
            15 => Some(Command::RemoteHost),
            16 => Some(Command::Metric),
            _ => None,
        }
    }
}
