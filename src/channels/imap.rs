//! Minimal blocking IMAP client over rustls.
//!
//! Just enough IMAP4rev1 for the responder: LOGIN, SELECT, UID SEARCH,
//! UID FETCH with literals, APPEND and LOGOUT. Run it inside
//! `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::ServerName;

/// Error type for IMAP operations.
pub type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Socket read/write timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// One complete server response, literals included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Response text with CRLFs removed; literal markers (`{N}`) are kept.
    pub text: String,
    /// Literal payloads with the text offset right after their `{N}` marker.
    literals: Vec<(usize, Vec<u8>)>,
}

impl Response {
    /// Literal that follows `item` (e.g. `BODY[]`).
    pub fn literal_after(&self, item: &str) -> Option<&[u8]> {
        self.literals
            .iter()
            .find(|(offset, _)| {
                let before = &self.text[..*offset];
                before
                    .rfind('{')
                    .is_some_and(|i| before[..i].trim_end().ends_with(item))
            })
            .map(|(_, data)| data.as_slice())
    }
}

/// An authenticated-or-not IMAP connection.
pub struct ImapSession {
    reader: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapSession {
    /// Connect over implicit TLS and read the greeting.
    pub fn connect(host: &str, port: u16) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((host, port))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(host.to_string())?;
        let conn = ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            reader: BufReader::new(StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };
        let greeting = session.read_response()?;
        if !greeting.text.starts_with("* OK") && !greeting.text.starts_with("* PREAUTH") {
            return Err(format!("Unexpected IMAP greeting: {}", greeting.text).into());
        }
        Ok(session)
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<(), ImapError> {
        self.command(&format!("LOGIN {} {}", quote(username), quote(password)))
            .map_err(|e| format!("IMAP login failed: {e}"))?;
        Ok(())
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), ImapError> {
        self.command(&format!("SELECT {}", quote(mailbox)))?;
        Ok(())
    }

    /// `UID SEARCH <criteria>`, returning matching UIDs in server order.
    pub fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, ImapError> {
        let responses = self.command(&format!("UID SEARCH {criteria}"))?;
        Ok(parse_search(&responses))
    }

    /// `UID FETCH <set> <items>`, returning the untagged FETCH responses.
    pub fn uid_fetch(&mut self, uids: &[u32], items: &str) -> Result<Vec<Response>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let responses = self.command(&format!("UID FETCH {set} {items}"))?;
        Ok(responses
            .into_iter()
            .filter(|r| r.text.starts_with("* ") && r.text.contains(" FETCH "))
            .collect())
    }

    /// `APPEND` a full RFC 5322 message to `mailbox` with `flags`.
    pub fn append(&mut self, mailbox: &str, flags: &str, message: &[u8]) -> Result<(), ImapError> {
        let tag = self.tag();
        let line = format!("{tag} APPEND {} ({flags}) {{{}}}\r\n", quote(mailbox), message.len());
        self.write(line.as_bytes())?;

        let continuation = self.read_response()?;
        if !continuation.text.starts_with('+') {
            return Err(format!("APPEND refused: {}", continuation.text).into());
        }

        self.write(message)?;
        self.write(b"\r\n")?;
        self.read_until_tagged(&tag)?;
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), ImapError> {
        self.command("LOGOUT")?;
        Ok(())
    }

    /// Send a tagged command and collect responses up to the tagged
    /// completion. A `NO` or `BAD` completion is an error.
    pub fn command(&mut self, command: &str) -> Result<Vec<Response>, ImapError> {
        let tag = self.tag();
        self.write(format!("{tag} {command}\r\n").as_bytes())?;
        self.read_until_tagged(&tag)
    }

    fn tag(&mut self) -> String {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ImapError> {
        let stream = self.reader.get_mut();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    fn read_until_tagged(&mut self, tag: &str) -> Result<Vec<Response>, ImapError> {
        let prefix = format!("{tag} ");
        let mut responses = Vec::new();
        loop {
            let response = self.read_response()?;
            if let Some(status) = response.text.strip_prefix(&prefix) {
                if status.starts_with("OK") {
                    return Ok(responses);
                }
                return Err(status.to_string().into());
            }
            responses.push(response);
        }
    }

    /// Read one response, following any `{N}` literals.
    fn read_response(&mut self) -> Result<Response, ImapError> {
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            response.text.push_str(&line);
            match literal_size(&line) {
                Some(size) => {
                    let mut data = vec![0u8; size];
                    self.reader.read_exact(&mut data)?;
                    response.literals.push((response.text.len(), data));
                }
                None => return Ok(response),
            }
        }
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err("IMAP connection closed".into());
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Quote an IMAP string argument.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Size of the literal announced at the end of `line`, if any.
pub fn literal_size(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs listed in `* SEARCH` responses.
pub fn parse_search(responses: &[Response]) -> Vec<u32> {
    responses
        .iter()
        .filter_map(|r| r.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

static UID_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bUID (\d+)").expect("static regex"));
static FLAGS_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bFLAGS \(([^)]*)\)").expect("static regex"));
static LABELS_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bX-GM-LABELS \(([^)]*)\)").expect("static regex"));
static LIST_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)"|([^\s"]+)"#).expect("static regex"));

/// `UID` data item of a FETCH response.
pub fn fetch_uid(text: &str) -> Option<u32> {
    UID_ITEM.captures(text)?[1].parse().ok()
}

/// `FLAGS` of a FETCH response, without the leading backslash.
pub fn fetch_flags(text: &str) -> Vec<String> {
    FLAGS_ITEM
        .captures(text)
        .map(|caps| parse_list(&caps[1]))
        .unwrap_or_default()
}

/// Gmail `X-GM-LABELS` of a FETCH response, without the leading backslash.
pub fn fetch_labels(text: &str) -> Vec<String> {
    LABELS_ITEM
        .captures(text)
        .map(|caps| parse_list(&caps[1]))
        .unwrap_or_default()
}

fn parse_list(list: &str) -> Vec<String> {
    LIST_TOKEN
        .captures_iter(list)
        .filter_map(|caps| {
            let token = match (caps.get(1), caps.get(2)) {
                (Some(quoted), _) => quoted.as_str().replace("\\\"", "\"").replace("\\\\", "\\"),
                (None, Some(atom)) => atom.as_str().to_string(),
                (None, None) => return None,
            };
            let token = token.trim_start_matches('\\').to_string();
            (!token.is_empty()).then_some(token)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(text: &str) -> Response {
        Response {
            text: text.into(),
            literals: vec![],
        }
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(quote("INBOX"), "\"INBOX\"");
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn literal_size_detection() {
        assert_eq!(literal_size("* 1 FETCH (UID 7 BODY[] {342}"), Some(342));
        assert_eq!(literal_size("A0001 APPEND \"Drafts\" () {12+}"), Some(12));
        assert_eq!(literal_size("* OK ready"), None);
        assert_eq!(literal_size("{abc}"), None);
    }

    #[test]
    fn search_results() {
        let responses = vec![response("* SEARCH 3 17 42"), response("* OK noise")];
        assert_eq!(parse_search(&responses), vec![3, 17, 42]);
        assert!(parse_search(&[response("* SEARCH")]).is_empty());
    }

    #[test]
    fn fetch_items() {
        let text = r#"* 12 FETCH (X-GM-LABELS ("\\Important" Clients "Project X") UID 4821 FLAGS (\Flagged $NotJunk) BODY[] {120}"#;
        assert_eq!(fetch_uid(text), Some(4821));
        assert_eq!(fetch_flags(text), vec!["Flagged", "$NotJunk"]);
        assert_eq!(fetch_labels(text), vec!["Important", "Clients", "Project X"]);
    }

    #[test]
    fn fetch_items_missing() {
        let text = "* 1 FETCH (UID 9 FLAGS ())";
        assert_eq!(fetch_uid(text), Some(9));
        assert!(fetch_flags(text).is_empty());
        assert!(fetch_labels(text).is_empty());
    }

    #[test]
    fn literal_after_finds_body() {
        let mut r = Response::default();
        r.text.push_str("* 1 FETCH (UID 5 BODY[] {5}");
        r.literals.push((r.text.len(), b"hello".to_vec()));
        r.text.push(')');
        assert_eq!(r.literal_after("BODY[]"), Some(&b"hello"[..]));
        assert_eq!(r.literal_after("RFC822.HEADER"), None);
    }
}
