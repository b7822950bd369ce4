//! Minimal request handling for the device's web surface: one request per
//! connection, GET or POST, optional Basic authentication.

mod decode;
mod params;
mod request;
mod response;

use std::io;

pub use decode::{base64_decode_in_place, url_decode_in_place};
pub use params::Params;
pub use request::{read_request, Method, Request, RequestSource, HEADER_CAP, REQUEST_CAP};
pub use response::{write_challenge, write_error, write_ok, write_protocol_error, Status};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("no request arrived before the timeout")]
    Timeout,
    #[error("missing or invalid credentials")]
    Unauthorized,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("malformed base64 field")]
    MalformedEncoding,
    #[error(transparent)]
    Io(#[from] io::Error),
}
