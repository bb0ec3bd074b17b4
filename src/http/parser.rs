use bytes::Bytes;
use thiserror::Error;

use crate::config::ParserConfig;
use crate::http::charset::CharacterSet;
use crate::http::request::{HttpVersion, Method, RequestLine};
use crate::http::response::StatusCode;
use crate::http::tokenizer::Tokenizer;

/// Delimiters accepted between request-line fields when strict.
const STRICT_DELIMITERS: CharacterSet = CharacterSet::SP;

/// RFC 7230 section 3.5 tolerance: SP, HTAB, VT, FF and bare CR.
const RELAXED_DELIMITERS: CharacterSet = CharacterSet::from_bytes("relaxed-delimiters", b" \t\x0b\x0c\r");

const PERIOD: CharacterSet = CharacterSet::from_bytes("period", b".");

/// The status a caller should answer with when parsing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    BadRequest,
    UriTooLong,
    HeaderFieldsTooLarge,
    MethodNotAllowed,
    VersionNotSupported,
}

impl StatusHint {
    pub fn status(&self) -> StatusCode {
        match self {
            StatusHint::BadRequest => StatusCode::BadRequest,
            StatusHint::UriTooLong => StatusCode::UriTooLong,
            StatusHint::HeaderFieldsTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            StatusHint::MethodNotAllowed => StatusCode::MethodNotAllowed,
            StatusHint::VersionNotSupported => StatusCode::HttpVersionNotSupported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("missing or malformed method")]
    MissingMethod,
    #[error("method exceeds {0} bytes")]
    MethodTooLong(usize),
    #[error("invalid delimiter {0}")]
    BadDelimiter(&'static str),
    #[error("missing protocol version")]
    MissingVersion,
    #[error("missing request target")]
    MissingTarget,
    #[error("request target contains invalid characters")]
    InvalidTarget,
    #[error("request target exceeds {0} bytes")]
    TargetTooLong(usize),
    #[error("request line is not terminated by CRLF")]
    MissingCr,
    #[error("request header exceeds {0} bytes")]
    HeadersTooLarge(usize),
    #[error("HTTP/2 connection preface on an HTTP/1 port")]
    PrefaceNotAllowed,
}

impl ParseFailure {
    pub fn hint(&self) -> StatusHint {
        match self {
            ParseFailure::TargetTooLong(_) => StatusHint::UriTooLong,
            ParseFailure::HeadersTooLarge(_) => StatusHint::HeaderFieldsTooLarge,
            ParseFailure::PrefaceNotAllowed => StatusHint::MethodNotAllowed,
            _ => StatusHint::BadRequest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserState {
    AwaitingFirstLine,
    AwaitingHeaders,
    Done,
    Failed(ParseFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    NeedMoreData,
    /// The request line and the raw header block, including its terminating
    /// empty line. HTTP/1.x only; other versions carry an empty block.
    Parsed(RequestLine, Bytes),
    Failed(ParseFailure, StatusHint),
}

/// Result of one [`RequestParser::parse`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStep {
    /// Bytes at the front of the caller's buffer that the parser is done with.
    pub consumed: usize,
    pub outcome: ParseOutcome,
}

/// Incremental HTTP/1.x request-line and header-block parser.
///
/// Feed it the unconsumed bytes after every read and drop `consumed` bytes
/// from the front of the buffer afterwards. One instance handles exactly one
/// message: once it reports `Parsed` or `Failed` it never consumes again.
#[derive(Debug)]
pub struct RequestParser {
    config: ParserConfig,
    state: ParserState,
    line: Option<RequestLine>,
    line_size: usize,
    header_block: Bytes,
}

impl RequestParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            state: ParserState::AwaitingFirstLine,
            line: None,
            line_size: 0,
            header_block: Bytes::new(),
        }
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn request_line(&self) -> Option<&RequestLine> {
        self.line.as_ref()
    }

    /// Size of the request line including its terminator, once known.
    pub fn first_line_size(&self) -> usize {
        self.line_size
    }

    pub fn parse(&mut self, buf: &[u8]) -> ParseStep {
        let mut consumed = 0;

        if self.state == ParserState::AwaitingFirstLine {
            if self.config.relaxed {
                let skipped = skip_garbage_lines(buf);
                if skipped > 0 {
                    tracing::debug!(skipped, "ignored empty lines ahead of request-line");
                }
                consumed += skipped;
            }

            match self.parse_first_line(&buf[consumed..]) {
                Ok(None) => {
                    return ParseStep {
                        consumed,
                        outcome: ParseOutcome::NeedMoreData,
                    };
                }
                Ok(Some((line, size))) => {
                    tracing::debug!(
                        method = %line.method,
                        target = %String::from_utf8_lossy(&line.target),
                        version = %line.version,
                        "parsed request-line"
                    );
                    consumed += size;
                    self.line_size = size;
                    let expects_headers = line.version.major == 1;
                    self.line = Some(line);
                    self.state = if expects_headers {
                        ParserState::AwaitingHeaders
                    } else {
                        ParserState::Done
                    };
                }
                Err(failure) => self.fail(failure),
            }
        }

        if self.state == ParserState::AwaitingHeaders {
            let input = &buf[consumed..];
            let limit = self.config.max_request_header_size;
            match find_headers_end(input) {
                Some(len) if self.line_size + len > limit => {
                    self.fail(ParseFailure::HeadersTooLarge(limit))
                }
                Some(len) => {
                    self.header_block = Bytes::copy_from_slice(&input[..len]);
                    consumed += len;
                    self.state = ParserState::Done;
                }
                None if self.line_size + input.len() > limit => {
                    self.fail(ParseFailure::HeadersTooLarge(limit))
                }
                None => {
                    tracing::trace!(buffered = input.len(), "waiting for end of headers");
                    return ParseStep {
                        consumed,
                        outcome: ParseOutcome::NeedMoreData,
                    };
                }
            }
        }

        ParseStep {
            consumed,
            outcome: self.terminal_outcome(),
        }
    }

    fn terminal_outcome(&self) -> ParseOutcome {
        match (&self.state, &self.line) {
            (ParserState::Done, Some(line)) => {
                ParseOutcome::Parsed(line.clone(), self.header_block.clone())
            }
            (ParserState::Failed(failure), _) => {
                ParseOutcome::Failed(failure.clone(), failure.hint())
            }
            _ => ParseOutcome::NeedMoreData,
        }
    }

    fn fail(&mut self, failure: ParseFailure) {
        tracing::debug!(error = %failure, "invalid request");
        self.state = ParserState::Failed(failure);
    }

    /// Parses one request line once its terminating LF is buffered.
    ///
    /// Returns the line and its size including the terminator, or `None`
    /// when the line is still incomplete.
    fn parse_first_line(
        &self,
        input: &[u8],
    ) -> Result<Option<(RequestLine, usize)>, ParseFailure> {
        let delimiters = if self.config.relaxed {
            &RELAXED_DELIMITERS
        } else {
            &STRICT_DELIMITERS
        };

        let Some(lf) = input.iter().position(|b| *b == b'\n') else {
            return self.check_partial_line(input, delimiters).map(|()| None);
        };

        let line_size = lf + 1;
        if line_size > self.config.max_request_header_size {
            return Err(self.oversized_line(input, delimiters));
        }

        let mut tok = Tokenizer::new(&input[..lf]);

        // RFC 7230 section 3.5 lets a recipient accept a bare LF terminator
        if !self.config.relaxed && !tok.skip_one_trailing(&CharacterSet::CR) {
            return Err(ParseFailure::MissingCr);
        }

        let method = self.parse_method(&mut tok)?;
        self.skip_delimiter(tok.skip_all(delimiters), "after method")?;

        if self.config.relaxed {
            tok.skip_all_trailing(delimiters);
        }

        let before_version = tok;
        let version = match parse_version_suffix(&mut tok) {
            Some(version) => {
                self.skip_delimiter(tok.skip_all_trailing(delimiters), "before version")?;
                version
            }
            None => {
                tok = before_version;
                if tok.remaining().len() > self.config.max_uri_length {
                    return Err(ParseFailure::TargetTooLong(self.config.max_uri_length));
                }
                // RFC 1945 simple-request: GET with no version at all
                if method != Method::GET {
                    return Err(ParseFailure::MissingVersion);
                }
                tracing::debug!("assuming HTTP/0.9 request-line");
                HttpVersion::HTTP_0_9
            }
        };

        let target = self.parse_target(&mut tok)?;

        if method == Method::PRI {
            return Err(ParseFailure::PrefaceNotAllowed);
        }

        Ok(Some((
            RequestLine {
                method,
                target: Bytes::copy_from_slice(target),
                version,
            },
            line_size,
        )))
    }

    /// Applies the size limit to a request line that has no LF yet.
    fn check_partial_line(
        &self,
        input: &[u8],
        delimiters: &CharacterSet,
    ) -> Result<(), ParseFailure> {
        if input.len() < self.config.max_request_header_size {
            return Ok(());
        }
        Err(self.oversized_line(input, delimiters))
    }

    /// Classifies a request line that outgrew the header limit. Once the
    /// method and its delimiter are seen, the excess belongs to the target.
    fn oversized_line(&self, input: &[u8], delimiters: &CharacterSet) -> ParseFailure {
        let mut tok = Tokenizer::new(input);
        let in_target = tok
            .prefix_limited(&CharacterSet::TCHAR, self.config.max_method_length)
            .is_some()
            && tok.skip_all(delimiters) > 0;
        if in_target {
            ParseFailure::TargetTooLong(self.config.max_uri_length)
        } else {
            ParseFailure::HeadersTooLarge(self.config.max_request_header_size)
        }
    }

    fn parse_method(&self, tok: &mut Tokenizer<'_>) -> Result<Method, ParseFailure> {
        let limit = self.config.max_method_length;
        let token = tok
            .prefix_limited(&CharacterSet::TCHAR, limit)
            .ok_or(ParseFailure::MissingMethod)?;
        if token.len() == limit
            && tok
                .remaining()
                .first()
                .is_some_and(|b| CharacterSet::TCHAR.contains(*b))
        {
            return Err(ParseFailure::MethodTooLong(limit));
        }
        Ok(Method::from_token(token))
    }

    fn skip_delimiter(&self, count: usize, location: &'static str) -> Result<(), ParseFailure> {
        if count == 0 || (count > 1 && !self.config.relaxed) {
            return Err(ParseFailure::BadDelimiter(location));
        }
        Ok(())
    }

    fn parse_target<'a>(&self, tok: &mut Tokenizer<'a>) -> Result<&'a [u8], ParseFailure> {
        let remaining = tok.remaining();
        if remaining.is_empty() {
            return Err(ParseFailure::MissingTarget);
        }
        if remaining.len() > self.config.max_uri_length {
            return Err(ParseFailure::TargetTooLong(self.config.max_uri_length));
        }
        let allowed = if self.config.relaxed {
            &CharacterSet::RELAXED_URI
        } else {
            &CharacterSet::URI
        };
        let target = tok.prefix(allowed).ok_or(ParseFailure::InvalidTarget)?;
        if !tok.at_end() {
            return Err(ParseFailure::InvalidTarget);
        }
        Ok(target)
    }
}

/// Matches `"HTTP/" DIGIT "." DIGIT` at the end of the view.
///
/// Multi-digit numbers are accepted but normalized to 0.0. The tokenizer is
/// left untouched when no version is present.
fn parse_version_suffix(tok: &mut Tokenizer<'_>) -> Option<HttpVersion> {
    if tok.skip_suffix(b"HTTP/1.1") {
        return Some(HttpVersion::HTTP_1_1);
    }
    if tok.skip_suffix(b"HTTP/1.0") {
        return Some(HttpVersion::HTTP_1_0);
    }

    let saved = *tok;
    let parsed = (|| {
        let minor = tok.suffix(&CharacterSet::DIGIT)?;
        tok.skip_one_trailing(&PERIOD).then_some(())?;
        let major = tok.suffix(&CharacterSet::DIGIT)?;
        tok.skip_suffix(b"HTTP/").then_some(())?;
        if major.len() > 1 || minor.len() > 1 {
            return Some(HttpVersion::new(0, 0));
        }
        Some(HttpVersion::new(major[0] - b'0', minor[0] - b'0'))
    })();

    if parsed.is_none() {
        *tok = saved;
    }
    parsed
}

/// Length of the leading run of empty lines (CRLF or bare LF).
fn skip_garbage_lines(buf: &[u8]) -> usize {
    let mut pos = 0;
    loop {
        match &buf[pos..] {
            [b'\n', ..] => pos += 1,
            [b'\r', b'\n', ..] => pos += 2,
            _ => return pos,
        }
    }
}

/// Finds the end of a header block: the first empty line (CRLF or bare LF).
///
/// Returns the block length including that empty line.
fn find_headers_end(input: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    while let Some(offset) = input[line_start..].iter().position(|b| *b == b'\n') {
        let lf = line_start + offset;
        let line = &input[line_start..lf];
        if line.is_empty() || line == b"\r" {
            return Some(lf + 1);
        }
        line_start = lf + 1;
    }
    None
}
