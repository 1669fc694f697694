// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    combinator::{opt, recognize},
    error::{make_error, ErrorKind},
    sequence::{pair, preceded, tuple},
    Err, IResult,
};

/// Tunnel establishment method.
pub const CONNECT: &str = "CONNECT";

/// Default port for plain requests.
const HTTP_PORT: u16 = 80;

/// Default port for CONNECT requests.
const HTTPS_PORT: u16 = 443;

/// Parsed first line of an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method.
    pub method: String,

    /// Target host.
    pub host: String,

    /// Target port, if the request named one.
    pub port: Option<u16>,
}

impl Request {
    /// Whether the request establishes a tunnel.
    pub fn is_connect(&self) -> bool {
        self.method == CONNECT
    }

    /// Target port, defaulted by method when the request named none.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(if self.is_connect() {
            HTTPS_PORT
        } else {
            HTTP_PORT
        })
    }

    /// Attempt to parse the first line of `data` into a [`Request`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        let input = std::str::from_utf8(data).ok()?;

        Some(Self::parse_inner(input).ok()?.1)
    }

    /// Attempt to parse `input` into a [`Request`].
    //
    // Non-public method returning `IResult` for cleaner error handling.
    fn parse_inner(input: &str) -> IResult<&str, Self> {
        let (rest, (method, _, _, host, port, _, _)) = tuple((
            take_while1(|c: char| c.is_ascii_alphabetic()),
            char(' '),
            opt(recognize(pair(take_while1(is_scheme_char), tag("://")))),
            take_while1(is_host_char),
            opt(preceded(char(':'), take_while1(|c: char| c.is_ascii_digit()))),
            take_while(is_path_char),
            char(' '),
        ))(input)?;

        let port = match port {
            Some(digits) => Some(
                digits
                    .parse::<u16>()
                    .map_err(|_| Err::Error(make_error(input, ErrorKind::Fail)))?,
            ),
            None => None,
        };

        Ok((
            rest,
            Self {
                method: method.to_string(),
                host: host.to_string(),
                port,
            },
        ))
    }
}

fn is_scheme_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_host_char(c: char) -> bool {
    !c.is_whitespace() && !"'\"<>[]{}|/:".contains(c)
}

fn is_path_char(c: char) -> bool {
    !c.is_whitespace() && !"'\"<>[]{}|".contains(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connect() {
        let request = Request::parse(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").unwrap();

        assert_eq!(request.method, "CONNECT");
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, Some(443));
        assert!(request.is_connect());
        assert_eq!(request.port_or_default(), 443);
    }

    #[test]
    fn parse_get() {
        let request = Request::parse(b"GET example.com HTTP/1.1\r\n\r\n").unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, None);
        assert!(!request.is_connect());
        assert_eq!(request.port_or_default(), 80);
    }

    #[test]
    fn parse_uri_with_scheme_and_path() {
        let request = Request::parse(b"GET http://example.com:8080/index.html HTTP/1.1").unwrap();

        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, Some(8080));
    }

    #[test]
    fn connect_without_port_defaults_to_https() {
        let request = Request::parse(b"CONNECT example.com HTTP/1.1").unwrap();

        assert_eq!(request.port_or_default(), 443);
    }

    #[test]
    fn invalid_requests() {
        // host cannot start with a path
        assert!(Request::parse(b"GET /index.html HTTP/1.1").is_none());
        // missing version means no trailing space after the target
        assert!(Request::parse(b"GET example.com").is_none());
        assert!(Request::parse(b"").is_none());
        assert!(Request::parse(b"\r\n\r\n").is_none());
        // port out of range
        assert!(Request::parse(b"CONNECT example.com:99999 HTTP/1.1").is_none());
        assert!(Request::parse(&[0xff, 0xfe, 0x20]).is_none());
    }
}
