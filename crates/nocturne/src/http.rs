// src/http.rs

/// Request methods the parser recognises. Only GET is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
        }
    }
}

/// Where the request state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Content,
}

/// Result of scanning for one line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line was found and its terminator overwritten with NULs.
    Ok,
    /// Malformed terminator.
    Bad,
    /// No terminator yet; more bytes are needed.
    Open,
}

/// Outcome of parsing and resolving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Not complete yet; wait for more input.
    NoRequest,
    /// A complete GET request was parsed.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    /// The target file is mapped and ready to send.
    FileRequest,
    InternalError,
    ClosedConnection,
}

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_FORM: &str = "Your request has bad syntax.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_FORM: &str = "There was unusual problem serving the requested file.\n";

impl HttpCode {
    /// Status code, reason phrase and canned body for codes that produce a
    /// response. `FileRequest` has no canned body.
    pub fn status(&self) -> Option<(u16, &'static str, Option<&'static str>)> {
        match self {
            HttpCode::FileRequest => Some((200, OK_200_TITLE, None)),
            HttpCode::BadRequest => Some((400, ERROR_400_TITLE, Some(ERROR_400_FORM))),
            HttpCode::ForbiddenRequest => Some((403, ERROR_403_TITLE, Some(ERROR_403_FORM))),
            HttpCode::NoResource => Some((404, ERROR_404_TITLE, Some(ERROR_404_FORM))),
            HttpCode::InternalError => Some((500, ERROR_500_TITLE, Some(ERROR_500_FORM))),
            HttpCode::NoRequest | HttpCode::GetRequest | HttpCode::ClosedConnection => None,
        }
    }

    /// True once parsing has finished one way or another.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HttpCode::NoRequest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_is_case_insensitive_get_only() {
        assert_eq!(Method::from_bytes(b"GET"), Some(Method::Get));
        assert_eq!(Method::from_bytes(b"get"), Some(Method::Get));
        assert_eq!(Method::from_bytes(b"POST"), None);
        assert_eq!(Method::from_bytes(b""), None);
    }

    #[test]
    fn every_error_code_has_a_canned_body() {
        for code in [
            HttpCode::BadRequest,
            HttpCode::ForbiddenRequest,
            HttpCode::NoResource,
            HttpCode::InternalError,
        ] {
            let (_, _, body) = code.status().unwrap();
            assert!(body.unwrap().ends_with('\n'));
        }
        assert_eq!(HttpCode::FileRequest.status(), Some((200, "OK", None)));
        assert_eq!(HttpCode::GetRequest.status(), None);
    }
}
