use std::io::{self, Write};

use super::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    ServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::ServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::ServerError => "Server Error",
        }
    }
}

fn write_head<W: Write + ?Sized>(
    out: &mut W,
    status: Status,
    server: &str,
    content_type: &str,
    extra: &[(&str, &str)],
) -> io::Result<()> {
    write!(out, "HTTP/1.1 {} {}\r\n", status.code(), status.reason())?;
    write!(out, "Server: {server}\r\n")?;
    write!(out, "Content-type: {content_type}\r\n")?;
    out.write_all(b"Cache-Control: no-cache, no-store, must-revalidate\r\n")?;
    out.write_all(b"Pragma: no-cache\r\n")?;
    out.write_all(b"Expires: 0\r\n")?;
    out.write_all(b"Connection: close\r\n")?;
    for (name, value) in extra {
        write!(out, "{name}: {value}\r\n")?;
    }
    out.write_all(b"\r\n")
}

/// Error page: full envelope plus a minimal HTML body naming the status.
pub fn write_error<W: Write + ?Sized>(
    out: &mut W,
    server: &str,
    status: Status,
    extra: &[(&str, &str)],
) -> io::Result<()> {
    write_head(out, status, server, "text/html", extra)?;
    let title = format!("{} {}", status.code(), status.reason());
    write!(
        out,
        "<!DOCTYPE html>\n<html><head><title>{title}</title></head>\n<body><h1>{title}</h1></body></html>\r\n"
    )?;
    out.flush()
}

pub fn write_ok<W: Write + ?Sized>(out: &mut W, server: &str, json: &str) -> io::Result<()> {
    write_head(out, Status::Ok, server, "application/json", &[])?;
    out.write_all(json.as_bytes())?;
    out.write_all(b"\r\n")?;
    out.flush()
}

pub fn write_challenge<W: Write + ?Sized>(out: &mut W, server: &str) -> io::Result<()> {
    let realm = format!("Basic realm=\"{server}\"");
    write_error(
        out,
        server,
        Status::Unauthorized,
        &[("WWW-Authenticate", realm.as_str())],
    )
}

/// Answers a failed read. A timeout or broken stream gets no response.
pub fn write_protocol_error<W: Write + ?Sized>(
    out: &mut W,
    server: &str,
    err: &ProtocolError,
) -> io::Result<()> {
    match err {
        ProtocolError::Timeout | ProtocolError::Io(_) => Ok(()),
        ProtocolError::Unauthorized => write_challenge(out, server),
        ProtocolError::MethodNotAllowed => write_error(
            out,
            server,
            Status::MethodNotAllowed,
            &[("Allow", "GET, POST")],
        ),
        ProtocolError::MalformedEncoding => write_error(out, server, Status::BadRequest, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(err: &ProtocolError) -> String {
        let mut out = Vec::new();
        write_protocol_error(&mut out, "WiFiPlug", err).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn unauthorized_carries_challenge() {
        let page = render(&ProtocolError::Unauthorized);
        assert!(page.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(page.contains("WWW-Authenticate: Basic realm=\"WiFiPlug\"\r\n"));
        assert!(page.contains("<h1>401 Unauthorized</h1>"));
    }

    #[test]
    fn method_not_allowed_lists_methods() {
        let page = render(&ProtocolError::MethodNotAllowed);
        assert!(page.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(page.contains("Allow: GET, POST\r\n"));
    }

    #[test]
    fn timeout_writes_nothing() {
        assert_eq!(render(&ProtocolError::Timeout), "");
    }

    #[test]
    fn envelope_disables_caching_and_closes() {
        let mut out = Vec::new();
        write_error(&mut out, "WiFiPlug", Status::NotFound, &[]).unwrap();
        let page = String::from_utf8(out).unwrap();

        for header in [
            "Server: WiFiPlug\r\n",
            "Content-type: text/html\r\n",
            "Cache-Control: no-cache, no-store, must-revalidate\r\n",
            "Pragma: no-cache\r\n",
            "Expires: 0\r\n",
            "Connection: close\r\n",
        ] {
            assert!(page.contains(header), "missing {header:?}");
        }
        assert!(page.contains("\r\n\r\n<!DOCTYPE html>"));
    }

    #[test]
    fn ok_envelope_carries_json() {
        let mut out = Vec::new();
        write_ok(&mut out, "WiFiPlug", "{\"relay\":true}").unwrap();
        let page = String::from_utf8(out).unwrap();
        assert!(page.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(page.contains("Content-type: application/json\r\n"));
        assert!(page.ends_with("\r\n\r\n{\"relay\":true}\r\n"));
    }
}
