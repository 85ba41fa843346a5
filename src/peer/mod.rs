//! Wire-protocol types shared by the SSH client ([`crate::store::ssh`]) and
//! the peer server ([`crate::peer::server`]): percent-encoded command-line
//! tokens, JSON response lines, and the raw-byte `write <n>`/`read <n>`
//! framing used to interleave snapshot payloads with the command channel.
//!
//! Ported from the original tool's `SSHStore.py`: `_Client`/
//! `StoreProxyServer` exchange exactly this shape of message.

pub mod server;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

/// Characters percent-encoded in command tokens: control characters plus
/// space (the token separator) and `%` itself.
const TOKEN_ENCODE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'%');

pub fn encode_token(token: &str) -> String {
    utf8_percent_encode(token, TOKEN_ENCODE_SET).to_string()
}

pub fn decode_token(token: &str) -> String {
    percent_decode_str(token).decode_utf8_lossy().into_owned()
}

/// Builds one command line: space-separated, percent-encoded tokens,
/// terminated by the caller when written (a bare LF).
pub fn encode_command(name: &str, args: &[&str]) -> String {
    let mut parts = vec![encode_token(name)];
    parts.extend(args.iter().map(|a| encode_token(a)));
    parts.join(" ")
}

pub fn decode_command(line: &str) -> Vec<String> {
    line.trim_end_matches(['\n', '\r']).split(' ').map(decode_token).collect()
}

/// Every server error is encoded as this JSON object and reconstituted
/// into the client's error channel.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub error: String,
    pub error_type: String,
    pub command: String,
    pub server: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// A `{size: n}` framing line preceding a `read` response's raw payload, or
/// terminating a stream with `size: 0`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SizeFrame {
    pub size: u64,
}
