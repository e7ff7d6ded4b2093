//! HTTP method wire enum.

use crate::error::ParseError;

/// HTTP request methods.
///
/// The numeric values are the METHOD packet's u32 wire encoding, shared
/// with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Method {
    Head = 1,
    Get = 2,
    Post = 3,
    Put = 4,
    Delete = 5,
    Options = 6,
    Trace = 7,
    Propfind = 8,
    Proppatch = 9,
    Mkcol = 10,
    Copy = 11,
    Move = 12,
    Lock = 13,
    Unlock = 14,
}

impl Method {
    /// Decode a METHOD payload value.
    pub fn from_u32(value: u32) -> Result<Self, ParseError> {
        match value {
            1 => Ok(Method::Head),
            2 => Ok(Method::Get),
            3 => Ok(Method::Post),
            4 => Ok(Method::Put),
            5 => Ok(Method::Delete),
            6 => Ok(Method::Options),
            7 => Ok(Method::Trace),
            8 => Ok(Method::Propfind),
            9 => Ok(Method::Proppatch),
            10 => Ok(Method::Mkcol),
            11 => Ok(Method::Copy),
            12 => Ok(Method::Move),
            13 => Ok(Method::Lock),
            14 => Ok(Method::Unlock),
            other => Err(ParseError::UnknownMethod(other)),
        }
    }

    /// The method name as it appears in an HTTP request line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Head => "HEAD",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Propfind => "PROPFIND",
            Method::Proppatch => "PROPPATCH",
            Method::Mkcol => "MKCOL",
            Method::Copy => "COPY",
            Method::Move => "MOVE",
            Method::Lock => "LOCK",
            Method::Unlock => "UNLOCK",
        }
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::Get
    }
}
