//! Server side of the remote-peer protocol (`--server` mode): reads one
//! command line at a time from `input`, dispatches it against a wrapped
//! [`Store`], and writes a single JSON response line (plus any raw payload
//! framing) to `output`.
//!
//! Ported from `SSHStore.py`'s `StoreProxyServer`/`@command` dispatch
//! table; the command set matches `spec.md` §4.7's table one-for-one.

use std::io::{BufRead, Read, Write};

use serde_json::json;
use uuid::Uuid;

use crate::model::Diff;
use crate::peer::{decode_command, ErrorInfo, SizeFrame};
use crate::store::{Mode, Store};

pub struct PeerServer {
    store: Box<dyn Store>,
    mode: Mode,
    pending_read: Option<Box<dyn Read>>,
    pending_write: Option<Box<dyn Write>>,
}

impl PeerServer {
    pub fn new(store: Box<dyn Store>, mode: Mode) -> Self {
        PeerServer {
            store,
            mode,
            pending_read: None,
            pending_write: None,
        }
    }

    /// Processes commands until `quit` or EOF. Returns the process exit
    /// code: 0 on orderly shutdown.
    pub fn run<R: BufRead, W: Write>(&mut self, mut input: R, mut output: W) -> std::io::Result<i32> {
        self.store.open().map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = input.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            let tokens = decode_command(&line);
            let Some(name) = tokens.first().cloned() else { continue };

            if name == "quit" {
                writeln!(output, "{}", json!({"ok": true}))?;
                return Ok(0);
            }

            match self.dispatch(&name, &tokens[1..], &mut input, &mut output) {
                Ok(Some(response)) => writeln!(output, "{response}")?,
                Ok(None) => {}
                Err(e) => {
                    let err = ErrorInfo {
                        error: e,
                        error_type: "StoreError".to_string(),
                        command: name.clone(),
                        server: true,
                        traceback: None,
                    };
                    writeln!(output, "{}", serde_json::to_string(&err).unwrap())?;
                }
            }
        }
        Ok(0)
    }

    fn required_mode(name: &str) -> Mode {
        match name {
            "delete" | "clean" => Mode::Write,
            "receive" | "write" | "info" => Mode::Append,
            _ => Mode::Read,
        }
    }

    fn dispatch<R: BufRead, W: Write>(
        &mut self,
        name: &str,
        args: &[String],
        input: &mut R,
        output: &mut W,
    ) -> Result<Option<String>, String> {
        let required = Self::required_mode(name);
        if self.mode < required {
            return Err(format!(
                "command {name} requires mode {} but session is {}",
                required.as_str(),
                self.mode.as_str()
            ));
        }

        match name {
            "version" => Ok(Some(json!({"version": env!("CARGO_PKG_VERSION")}).to_string())),

            "volumes" => {
                let volumes = self.store.list_volumes().map_err(|e| e.to_string())?;
                let mut out = Vec::new();
                for v in volumes {
                    let paths = self.store.get_paths(v.uuid).unwrap_or_default();
                    out.push(json!({
                        "uuid": v.uuid.to_string(),
                        "gen": v.gen,
                        "total_size": v.total_size,
                        "exclusive_size": v.exclusive_size,
                        "paths": paths,
                    }));
                }
                Ok(Some(json!(out).to_string()))
            }

            "edges" => {
                let from = parse_uuid_token(args.first().map(String::as_str).unwrap_or("None"));
                let edges = self.store.get_edges(from).map_err(|e| e.to_string())?;
                Ok(Some(json!(edges.iter().map(diff_to_json).collect::<Vec<_>>()).to_string()))
            }

            "measure" => {
                let to = parse_uuid_token(args.first().map(String::as_str).unwrap_or("None")).ok_or("missing to uuid")?;
                let from = parse_uuid_token(args.get(1).map(String::as_str).unwrap_or("None"));
                let est_size: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
                let chunk: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(crate::transfer::DEFAULT_CHUNK_SIZE);
                let mut diff = Diff::new(to, from, est_size, true, 0);
                self.store.measure_size(&mut diff, chunk).map_err(|e| e.to_string())?;
                Ok(Some(json!({"size": diff.size}).to_string()))
            }

            "send" => {
                let to = parse_uuid_token(args.first().map(String::as_str).unwrap_or("None")).ok_or("missing to uuid")?;
                let from = parse_uuid_token(args.get(1).map(String::as_str).unwrap_or("None"));
                let diff = Diff::new(to, from, 0, true, 0);
                let reader = self.store.send(&diff).map_err(|e| e.to_string())?;
                self.pending_read = reader;
                Ok(Some(json!({"ok": true}).to_string()))
            }

            "receive" => {
                let path = args.first().cloned().unwrap_or_default();
                let to = parse_uuid_token(args.get(1).map(String::as_str).unwrap_or("None")).ok_or("missing to uuid")?;
                let from = parse_uuid_token(args.get(2).map(String::as_str).unwrap_or("None"));
                let diff = Diff::new(to, from, 0, true, 0);
                let writer = self.store.receive(&diff, &[path]).map_err(|e| e.to_string())?;
                self.pending_write = writer;
                Ok(Some(json!({"ok": true}).to_string()))
            }

            "info" => {
                let path = args.first().cloned().unwrap_or_default();
                let writer = self.store.receive_volume_info(&[path]).map_err(|e| e.to_string())?;
                self.pending_write = writer;
                Ok(Some(json!({"ok": true}).to_string()))
            }

            "read" => {
                let n: usize = args.first().and_then(|s| s.parse().ok()).ok_or("missing byte count")?;
                let Some(reader) = self.pending_read.as_mut() else {
                    return Err("no pending send stream".to_string());
                };
                let mut buf = vec![0u8; n];
                let mut filled = 0;
                while filled < n {
                    let read = reader.read(&mut buf[filled..]).map_err(|e| e.to_string())?;
                    if read == 0 {
                        break;
                    }
                    filled += read;
                }
                let frame = SizeFrame { size: filled as u64 };
                writeln!(output, "{}", serde_json::to_string(&frame).unwrap()).map_err(|e| e.to_string())?;
                output.write_all(&buf[..filled]).map_err(|e| e.to_string())?;
                if filled == 0 {
                    self.pending_read = None;
                }
                // Frame and payload are already written directly above;
                // the caller must not write a second response line.
                Ok(None)
            }

            "write" => {
                let n: usize = args.first().and_then(|s| s.parse().ok()).ok_or("missing byte count")?;
                let mut buf = vec![0u8; n];
                input.read_exact(&mut buf).map_err(|e| e.to_string())?;
                let Some(writer) = self.pending_write.as_mut() else {
                    return Err("no pending receive stream".to_string());
                };
                writer.write_all(&buf).map_err(|e| e.to_string())?;
                Ok(Some(json!({"ok": true}).to_string()))
            }

            "keep" => {
                let to = parse_uuid_token(args.first().map(String::as_str).unwrap_or("None")).ok_or("missing to uuid")?;
                let from = parse_uuid_token(args.get(1).map(String::as_str).unwrap_or("None"));
                let diff = Diff::new(to, from, 0, true, 0);
                self.store.keep(&diff).map_err(|e| e.to_string())?;
                Ok(Some(json!({"ok": true}).to_string()))
            }

            "delete" => {
                self.store.delete_unused(false).map_err(|e| e.to_string())?;
                Ok(Some(json!({"ok": true}).to_string()))
            }
            "listDelete" => {
                self.store.delete_unused(true).map_err(|e| e.to_string())?;
                Ok(Some(json!({"ok": true}).to_string()))
            }
            "clean" => {
                self.store.delete_partials(false).map_err(|e| e.to_string())?;
                Ok(Some(json!({"ok": true}).to_string()))
            }
            "listClean" => {
                self.store.delete_partials(true).map_err(|e| e.to_string())?;
                Ok(Some(json!({"ok": true}).to_string()))
            }

            other => Err(format!("unknown command: {other}")),
        }
    }
}

fn parse_uuid_token(token: &str) -> Option<Uuid> {
    if token == "None" || token == "-" || token.is_empty() {
        return None;
    }
    Uuid::parse_str(token).ok()
}

fn diff_to_json(diff: &Diff) -> serde_json::Value {
    json!({
        "to": diff.to.to_string(),
        "from": diff.from.map(|u| u.to_string()),
        "size": diff.size,
        "size_is_estimated": diff.size_is_estimated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufReader, Cursor};

    use serde_json::Value;

    use crate::store::{ContentLine, StoreError};
    use crate::progress::ShowProgress;

    #[test]
    fn required_mode_enforces_write_for_delete() {
        assert_eq!(PeerServer::required_mode("delete"), Mode::Write);
        assert_eq!(PeerServer::required_mode("edges"), Mode::Read);
        assert_eq!(PeerServer::required_mode("receive"), Mode::Append);
    }

    #[test]
    fn parses_none_and_dash_as_no_parent() {
        assert_eq!(parse_uuid_token("None"), None);
        assert_eq!(parse_uuid_token("-"), None);
        assert_eq!(parse_uuid_token(""), None);
    }

    #[test]
    fn parses_real_uuid() {
        let u = Uuid::new_v4();
        assert_eq!(parse_uuid_token(&u.to_string()), Some(u));
    }

    /// Stands in for an ssh child's stdin/stdout: a fixed set of edges and
    /// payloads, with no real btrfs/S3 backend behind it.
    struct MockStore {
        edges: HashMap<Option<Uuid>, Vec<Diff>>,
        payloads: HashMap<Uuid, Vec<u8>>,
    }

    impl MockStore {
        fn new(edges: Vec<Diff>, payloads: HashMap<Uuid, Vec<u8>>) -> Self {
            let mut by_from: HashMap<Option<Uuid>, Vec<Diff>> = HashMap::new();
            for edge in edges {
                by_from.entry(edge.from).or_default().push(edge);
            }
            MockStore { edges: by_from, payloads }
        }
    }

    impl Store for MockStore {
        fn open(&mut self) -> crate::store::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> crate::store::Result<()> {
            Ok(())
        }
        fn list_volumes(&self) -> crate::store::Result<Vec<crate::model::Volume>> {
            Ok(Vec::new())
        }
        fn list_contents(&self) -> crate::store::Result<Vec<ContentLine>> {
            Ok(Vec::new())
        }
        fn get_paths(&self, _vol: Uuid) -> crate::store::Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn get_edges(&self, from_vol: Option<Uuid>) -> crate::store::Result<Vec<Diff>> {
            Ok(self.edges.get(&from_vol).cloned().unwrap_or_default())
        }
        fn has_edge(&self, diff: &Diff) -> crate::store::Result<bool> {
            Ok(self.edges.get(&diff.from).map(|v| v.iter().any(|d| d.to == diff.to)).unwrap_or(false))
        }
        fn measure_size(&self, _diff: &mut Diff, _chunk_size: usize) -> crate::store::Result<()> {
            Ok(())
        }
        fn send(&mut self, diff: &Diff) -> crate::store::Result<Option<Box<dyn Read>>> {
            let payload = self.payloads.get(&diff.to).cloned().ok_or_else(|| StoreError::NotFound(diff.to.to_string()))?;
            Ok(Some(Box::new(Cursor::new(payload))))
        }
        fn receive(&mut self, _diff: &Diff, _paths: &[String]) -> crate::store::Result<Option<Box<dyn Write>>> {
            Ok(Some(Box::new(Vec::new())))
        }
        fn receive_volume_info(&mut self, _paths: &[String]) -> crate::store::Result<Option<Box<dyn Write>>> {
            Ok(Some(Box::new(Vec::new())))
        }
        fn keep(&mut self, _diff: &Diff) -> crate::store::Result<()> {
            Ok(())
        }
        fn delete_unused(&mut self, _dry_run: bool) -> crate::store::Result<()> {
            Ok(())
        }
        fn delete_partials(&mut self, _dry_run: bool) -> crate::store::Result<()> {
            Ok(())
        }
        fn show_progress(&self) -> ShowProgress {
            ShowProgress::Never
        }
        fn is_remote(&self) -> bool {
            false
        }
    }

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    /// Splits a captured transcript into individual `\n`-terminated lines,
    /// leaving any trailing raw (non-line) payload bytes for the caller to
    /// consume with an explicit byte count.
    fn next_line(buf: &[u8]) -> (&str, &[u8]) {
        let pos = buf.iter().position(|&b| b == b'\n').expect("expected a newline-terminated response line");
        (std::str::from_utf8(&buf[..pos]).unwrap(), &buf[pos + 1..])
    }

    #[test]
    fn s6_ssh_round_trip_lists_edges_then_streams_a_send() {
        let a = uuid(1);
        let b = uuid(2);
        let payload = b"hello, snapshot".to_vec();

        let edges = vec![Diff::new(a, None, 100, false, 0), Diff::new(b, Some(a), 50, false, 0)];
        let mut payloads = HashMap::new();
        payloads.insert(a, payload.clone());
        let store: Box<dyn Store> = Box::new(MockStore::new(edges, payloads));

        let mut server = PeerServer::new(store, Mode::Read);

        let input = format!("edges None\nsend {a} None\nread {}\nread {}\nquit\n", payload.len(), payload.len());
        let input = BufReader::new(Cursor::new(input.into_bytes()));
        let mut output = Vec::new();

        let code = server.run(input, &mut output).unwrap();
        assert_eq!(code, 0);

        let (edges_line, rest) = next_line(&output);
        let edges_json: Value = serde_json::from_str(edges_line).unwrap();
        let edges_arr = edges_json.as_array().unwrap();
        assert_eq!(edges_arr.len(), 1);
        assert_eq!(edges_arr[0]["to"].as_str().unwrap(), a.to_string());
        assert!(edges_arr[0]["from"].is_null());

        let (send_line, rest) = next_line(rest);
        let send_json: Value = serde_json::from_str(send_line).unwrap();
        assert_eq!(send_json["ok"].as_bool(), Some(true));

        let (size_line, rest) = next_line(rest);
        let size_json: Value = serde_json::from_str(size_line).unwrap();
        let size = size_json["size"].as_u64().unwrap() as usize;
        assert_eq!(size, payload.len());
        let (body, rest) = rest.split_at(size);
        assert_eq!(body, payload.as_slice());

        let (eof_line, rest) = next_line(rest);
        let eof_json: Value = serde_json::from_str(eof_line).unwrap();
        assert_eq!(eof_json["size"].as_u64(), Some(0));

        let (quit_line, rest) = next_line(rest);
        let quit_json: Value = serde_json::from_str(quit_line).unwrap();
        assert_eq!(quit_json["ok"].as_bool(), Some(true));
        assert!(rest.is_empty());
    }

    #[test]
    fn unknown_command_surfaces_as_error_without_side_effects() {
        let store: Box<dyn Store> = Box::new(MockStore::new(Vec::new(), HashMap::new()));
        let mut server = PeerServer::new(store, Mode::Read);

        let input = BufReader::new(Cursor::new(b"bogus\nquit\n".to_vec()));
        let mut output = Vec::new();
        server.run(input, &mut output).unwrap();

        let (err_line, _rest) = next_line(&output);
        let err_json: Value = serde_json::from_str(err_line).unwrap();
        assert!(err_json["error"].as_str().unwrap().contains("unknown command"));
        assert_eq!(err_json["server"].as_bool(), Some(true));
    }

    #[test]
    fn mode_enforcement_rejects_write_commands_in_read_session() {
        let store: Box<dyn Store> = Box::new(MockStore::new(Vec::new(), HashMap::new()));
        let mut server = PeerServer::new(store, Mode::Read);

        let input = BufReader::new(Cursor::new(b"delete\nquit\n".to_vec()));
        let mut output = Vec::new();
        server.run(input, &mut output).unwrap();

        let (err_line, _rest) = next_line(&output);
        let err_json: Value = serde_json::from_str(err_line).unwrap();
        assert!(err_json["error"].as_str().unwrap().contains("requires mode"));
    }
}
