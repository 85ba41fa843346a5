//! Client side of the remote-peer protocol (C7): spawns the same program
//! over `ssh` in `--server` mode and proxies every [`Store`] operation as a
//! line-oriented command, with raw-byte framing for `send`/`receive`
//! payloads.
//!
//! Ported from `SSHStore.py`'s `_Client`/`_SSHStream`: a command channel
//! (stdin/stdout of the ssh child) carries percent-encoded tokens and
//! single-line JSON responses, while `write <n>`/`read <n>` frames
//! interleave raw snapshot bytes on the same pipes.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::rc::Rc;

use serde_json::Value;
use uuid::Uuid;

use crate::model::{Diff, Volume};
use crate::peer::{encode_command, ErrorInfo, SizeFrame};
use crate::progress::ShowProgress;
use crate::store::{ContentLine, Mode, Store, StoreError};

/// The ssh child process plus its command channel, shared between
/// `SshStore` and the reader/writer handles it hands out for `send`/
/// `receive`, so those handles don't need a lifetime tied back to
/// `&mut SshStore`.
struct Channel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Channel {
    fn send_command(&mut self, name: &str, args: &[&str]) -> std::io::Result<()> {
        let line = encode_command(name, args);
        writeln!(self.stdin, "{line}")?;
        self.stdin.flush()
    }

    fn read_response(&mut self) -> Result<Value, StoreError> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).map_err(StoreError::Io)?;
        if n == 0 {
            return Err(StoreError::Other("ssh peer closed the connection".to_string()));
        }
        let value: Value = serde_json::from_str(line.trim_end_matches(['\n', '\r']))
            .map_err(|e| StoreError::Other(format!("malformed peer response: {e}")))?;
        if value.get("error").is_some() {
            let info: ErrorInfo = serde_json::from_value(value)
                .map_err(|e| StoreError::Other(format!("malformed peer error: {e}")))?;
            return Err(StoreError::Other(format!(
                "remote peer error in {}: {}{}",
                info.command,
                info.error,
                info.traceback.map(|t| format!("\n{t}")).unwrap_or_default()
            )));
        }
        Ok(value)
    }

    fn call(&mut self, name: &str, args: &[&str]) -> Result<Value, StoreError> {
        self.send_command(name, args).map_err(StoreError::Io)?;
        self.read_response()
    }

    /// Reads a `read <n>` response: a `{size}` JSON line, then exactly
    /// `size` raw bytes. `size == 0` signals end of stream.
    fn read_frame(&mut self, n: usize) -> std::io::Result<Vec<u8>> {
        self.send_command("read", &[&n.to_string()])?;
        let mut line = String::new();
        self.stdout.read_line(&mut line)?;
        let frame: SizeFrame = serde_json::from_str(line.trim_end_matches(['\n', '\r']))
            .map_err(|e| std::io::Error::other(format!("malformed size frame: {e}")))?;
        let mut buf = vec![0u8; frame.size as usize];
        self.stdout.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes a `write <n>` frame: the command line, then the raw bytes
    /// themselves with no terminator, then awaits the server's ack.
    fn write_frame(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.send_command("write", &[&buf.len().to_string()])?;
        self.stdin.write_all(buf)?;
        self.stdin.flush()?;
        self.read_response().map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(())
    }
}

pub struct SshStore {
    host: String,
    user: Option<String>,
    remote_bin: String,
    remote_path: String,
    mode: Mode,
    dry_run: bool,
    show_progress: ShowProgress,

    channel: Option<Rc<RefCell<Channel>>>,
}

impl SshStore {
    pub fn new(
        user: Option<String>,
        host: impl Into<String>,
        remote_path: impl Into<String>,
        mode: Mode,
        dry_run: bool,
        show_progress: ShowProgress,
    ) -> Self {
        SshStore {
            host: host.into(),
            user,
            remote_bin: "subvolsync".to_string(),
            remote_path: remote_path.into(),
            mode,
            dry_run,
            show_progress,
            channel: None,
        }
    }

    /// Overrides the remote binary name invoked after `ssh`; defaults to
    /// `subvolsync`, the name this program installs as.
    pub fn with_remote_bin(mut self, bin: impl Into<String>) -> Self {
        self.remote_bin = bin.into();
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn channel(&self) -> crate::store::Result<Rc<RefCell<Channel>>> {
        self.channel.clone().ok_or_else(|| StoreError::Other("ssh session not open".to_string()))
    }

    /// Drives one request/response round trip over the shared channel.
    /// Takes `&self`: the channel lives behind `Rc<RefCell<_>>` precisely so
    /// that the read-only `Store` trait methods (`get_edges`, `has_edge`,
    /// `measure_size`, `list_volumes`) can still talk to the remote peer.
    fn call(&self, name: &str, args: &[&str]) -> Result<Value, StoreError> {
        self.channel()?.borrow_mut().call(name, args)
    }

    fn uuid_token(u: Option<Uuid>) -> String {
        u.map(|u| u.to_string()).unwrap_or_else(|| "None".to_string())
    }
}

impl Store for SshStore {
    fn open(&mut self) -> crate::store::Result<()> {
        let mut cmd = Command::new("ssh");
        cmd.arg(self.destination())
            .arg(&self.remote_bin)
            .args(["--server", "--mode", self.mode.as_str(), &self.remote_path])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(StoreError::Io)?;
        let stdin = child.stdin.take().expect("ssh child stdin");
        let stdout = BufReader::new(child.stdout.take().expect("ssh child stdout"));
        self.channel = Some(Rc::new(RefCell::new(Channel { child, stdin, stdout })));

        self.call("version", &[])?;
        Ok(())
    }

    fn close(&mut self) -> crate::store::Result<()> {
        if let Some(channel) = self.channel.take() {
            let mut channel = channel.borrow_mut();
            let _ = channel.send_command("quit", &[]);
            let _ = channel.read_response();
            let _ = channel.child.wait();
        }
        Ok(())
    }

    fn list_volumes(&self) -> crate::store::Result<Vec<Volume>> {
        let value = self.call("volumes", &[])?;
        let entries = value.as_array().ok_or_else(|| StoreError::Other("volumes: expected array".to_string()))?;
        let mut out = Vec::new();
        for entry in entries {
            let uuid = entry
                .get("uuid")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| StoreError::Other("volumes: missing uuid".to_string()))?;
            let gen = entry.get("gen").and_then(Value::as_u64).unwrap_or(0);
            let total_size = entry.get("total_size").and_then(Value::as_u64);
            let exclusive_size = entry.get("exclusive_size").and_then(Value::as_u64);
            out.push(Volume::new(uuid, gen).with_sizes(total_size, exclusive_size));
        }
        Ok(out)
    }

    fn list_contents(&self) -> crate::store::Result<Vec<ContentLine>> {
        Ok(self.list_volumes()?.iter().map(|v| v.to_string()).collect())
    }

    fn get_paths(&self, _vol: Uuid) -> crate::store::Result<Vec<String>> {
        // The `volumes` response carries no path list (only the single
        // preferred path the remote peer would itself pick), and no other
        // command exposes it; callers driving an `SshStore` as a sink never
        // need the source-side path, and as a source `send` doesn't consult
        // it either.
        Ok(Vec::new())
    }

    fn get_edges(&self, from_vol: Option<Uuid>) -> crate::store::Result<Vec<Diff>> {
        let value = self.call("edges", &[&Self::uuid_token(from_vol)])?;
        let entries = value.as_array().ok_or_else(|| StoreError::Other("edges: expected array".to_string()))?;
        let mut out = Vec::new();
        for entry in entries {
            let to = entry
                .get("to")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| StoreError::Other("edges: missing to".to_string()))?;
            let from = entry.get("from").and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok());
            let size = entry.get("size").and_then(Value::as_u64).unwrap_or(0);
            let estimated = entry.get("size_is_estimated").and_then(Value::as_bool).unwrap_or(true);
            out.push(Diff::new(to, from, size, estimated, 0));
        }
        Ok(out)
    }

    fn has_edge(&self, diff: &Diff) -> crate::store::Result<bool> {
        Ok(self.get_edges(diff.from)?.iter().any(|e| e.to == diff.to))
    }

    fn measure_size(&self, diff: &mut Diff, chunk_size: usize) -> crate::store::Result<()> {
        let value = self.call(
            "measure",
            &[&diff.to.to_string(), &Self::uuid_token(diff.from), &diff.size.to_string(), &chunk_size.to_string()],
        )?;
        diff.size = value.get("size").and_then(Value::as_u64).ok_or_else(|| StoreError::Other("measure: missing size".to_string()))?;
        diff.size_is_estimated = false;
        Ok(())
    }

    fn send(&mut self, diff: &Diff) -> crate::store::Result<Option<Box<dyn Read>>> {
        if self.dry_run {
            tracing::info!(diff = %diff, "WOULD: send (remote)");
            return Ok(None);
        }
        self.call("send", &[&diff.to.to_string(), &Self::uuid_token(diff.from)])?;
        Ok(Some(Box::new(SshReader { channel: self.channel()?, done: false })))
    }

    fn receive(&mut self, diff: &Diff, paths: &[String]) -> crate::store::Result<Option<Box<dyn Write>>> {
        if self.dry_run {
            tracing::info!(diff = %diff, "WOULD: receive (remote)");
            return Ok(None);
        }
        let path = crate::store::select_receive_path(paths);
        self.call("receive", &[&path, &diff.to.to_string(), &Self::uuid_token(diff.from)])?;
        Ok(Some(Box::new(SshWriter { channel: self.channel()? })))
    }

    fn receive_volume_info(&mut self, paths: &[String]) -> crate::store::Result<Option<Box<dyn Write>>> {
        if self.dry_run {
            return Ok(None);
        }
        let path = crate::store::select_receive_path(paths);
        self.call("info", &[&path])?;
        Ok(Some(Box::new(SshWriter { channel: self.channel()? })))
    }

    fn keep(&mut self, diff: &Diff) -> crate::store::Result<()> {
        self.call("keep", &[&diff.to.to_string(), &Self::uuid_token(diff.from)])?;
        Ok(())
    }

    fn delete_unused(&mut self, dry_run: bool) -> crate::store::Result<()> {
        if dry_run {
            self.call("listDelete", &[])?;
        } else {
            self.call("delete", &[])?;
        }
        Ok(())
    }

    fn delete_partials(&mut self, dry_run: bool) -> crate::store::Result<()> {
        if dry_run {
            self.call("listClean", &[])?;
        } else {
            self.call("clean", &[])?;
        }
        Ok(())
    }

    fn show_progress(&self) -> ShowProgress {
        self.show_progress
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Reader side of an in-flight `send`: each `read()` issues one `read <n>`
/// frame over the shared ssh channel.
struct SshReader {
    channel: Rc<RefCell<Channel>>,
    done: bool,
}

impl Read for SshReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        let chunk = self.channel.borrow_mut().read_frame(buf.len())?;
        if chunk.is_empty() {
            self.done = true;
            return Ok(0);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

/// Writer side of an in-flight `receive`/`info`: each `write()` issues one
/// `write <n>` frame over the shared ssh channel.
struct SshWriter {
    channel: Rc<RefCell<Channel>>,
}

impl Write for SshWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.channel.borrow_mut().write_frame(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_includes_user_when_set() {
        let store = SshStore::new(Some("alice".to_string()), "host.example", "/data", Mode::Read, false, ShowProgress::Never);
        assert_eq!(store.destination(), "alice@host.example");
    }

    #[test]
    fn destination_omits_user_when_unset() {
        let store = SshStore::new(None, "host.example", "/data", Mode::Read, false, ShowProgress::Never);
        assert_eq!(store.destination(), "host.example");
    }

    #[test]
    fn uuid_token_renders_none_for_missing_parent() {
        assert_eq!(SshStore::uuid_token(None), "None");
        let u = Uuid::new_v4();
        assert_eq!(SshStore::uuid_token(Some(u)), u.to_string());
    }
}
