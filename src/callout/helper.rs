//! URL rewrite and store-ID helpers.
//!
//! Helpers speak a line protocol: one query line in, one reply line out.
//!
//! ```text
//! query:  http://example.com/a 192.0.2.7/- - GET
//! reply:  OK rewrite-url="http://mirror.example.com/a" tag=mirrored
//! ```

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::http::request::{Notes, Request};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperQuery {
    pub url: String,
    pub client: IpAddr,
    pub client_fqdn: Option<String>,
    pub user: Option<String>,
    pub method: String,
}

impl HelperQuery {
    pub fn for_request(request: &Request) -> Self {
        Self {
            url: request.effective_uri(),
            client: request.indirect_client_addr,
            client_fqdn: None,
            user: request.helper_user.clone(),
            method: request.method().to_string(),
        }
    }

    /// The query line, without the trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{} {}/{} {} {}",
            self.url,
            self.client,
            self.client_fqdn.as_deref().unwrap_or("-"),
            self.user.as_deref().unwrap_or("-"),
            self.method
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperResult {
    Ok,
    Err,
    /// The helper reported itself broken, or could not be talked to.
    BrokenHelper,
    TimedOut,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperReply {
    pub result: HelperResult,
    pub notes: Notes,
}

impl HelperReply {
    pub fn new(result: HelperResult) -> Self {
        Self {
            result,
            notes: Notes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(HelperResult::Ok)
    }

    pub fn with_note(mut self, key: &str, value: &str) -> Self {
        self.notes.add(key, value);
        self
    }

    /// Parses one reply line: `OK|ERR|BH|TT` followed by `key=value`
    /// pairs. Values may be double-quoted with backslash escapes.
    pub fn parse(line: &str) -> Self {
        let mut words = split_words(line.trim()).into_iter();
        let result = match words.next().as_deref() {
            Some("OK") => HelperResult::Ok,
            Some("ERR") => HelperResult::Err,
            Some("BH") => HelperResult::BrokenHelper,
            Some("TT") => HelperResult::TimedOut,
            Some(other) => HelperResult::Unknown(other.to_string()),
            None => HelperResult::Unknown(String::new()),
        };

        let mut notes = Notes::new();
        for word in words {
            match word.split_once('=') {
                Some((key, value)) if !key.is_empty() => notes.add(key, value),
                _ => debug!(word = %word, "ignoring helper reply word without key"),
            }
        }

        Self { result, notes }
    }
}

/// Splits on unquoted whitespace, removing quotes and escapes.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// An external rewrite collaborator.
///
/// Must tolerate many concurrent callers. Failures are reported in the
/// reply (`BrokenHelper`), never as a panic or an error value.
pub trait RewriteHelper: Send + Sync {
    fn query<'a>(&'a self, query: &'a HelperQuery) -> BoxFuture<'a, HelperReply>;
}

struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Runs a helper program and talks to it over stdin/stdout.
///
/// Queries are serialized: one query is in flight per helper process. The
/// process is started on first use and restarted after an I/O failure.
pub struct ProgramHelper {
    name: String,
    argv: Vec<String>,
    process: Mutex<Option<HelperProcess>>,
}

impl ProgramHelper {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            process: Mutex::new(None),
        }
    }

    fn spawn(&self) -> std::io::Result<HelperProcess> {
        let (program, args) = self.argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty helper command")
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "helper stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "helper stdout unavailable")
        })?;

        debug!(helper = %self.name, pid = ?child.id(), "started helper");
        Ok(HelperProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn exchange(&self, line: &str) -> std::io::Result<String> {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(std::io::Error::other("helper not running"));
        };

        let result = async {
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.write_all(b"\n").await?;
            process.stdin.flush().await?;

            let mut reply = String::new();
            if process.stdout.read_line(&mut reply).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "helper closed its output",
                ));
            }
            Ok(reply)
        }
        .await;

        if result.is_err() {
            if let Some(mut dead) = guard.take() {
                let _ = dead.child.start_kill();
            }
        }
        result
    }
}

impl RewriteHelper for ProgramHelper {
    fn query<'a>(&'a self, query: &'a HelperQuery) -> BoxFuture<'a, HelperReply> {
        Box::pin(async move {
            match self.exchange(&query.to_line()).await {
                Ok(line) => HelperReply::parse(&line),
                Err(e) => {
                    warn!(helper = %self.name, error = %e, "helper I/O failed");
                    HelperReply::new(HelperResult::BrokenHelper)
                }
            }
        })
    }
}
