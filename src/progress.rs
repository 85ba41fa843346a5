//! Nestable progress reporting: tracks bytes sent against an optional total,
//! renders one line with elapsed/Mbps/ETA, and is suppressed on a
//! non-interactive terminal.
//!
//! Mirrors the scoped-acquisition contract of `DisplayProgress` in the
//! original tool: callers are expected to `open`, `update` repeatedly, then
//! `close` on every exit path including errors.

use std::cell::RefCell;
use std::io::IsTerminal;
use std::rc::Rc;
use std::time::Instant;

/// Controls whether a reporter renders at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowProgress {
    Always,
    Never,
    /// Render only when stdout is an interactive terminal.
    Auto,
}

impl ShowProgress {
    fn should_render(self) -> bool {
        match self {
            ShowProgress::Always => true,
            ShowProgress::Never => false,
            ShowProgress::Auto => std::io::stdout().is_terminal(),
        }
    }
}

pub type SharedReporter = Rc<RefCell<ProgressReporter>>;

pub struct ProgressReporter {
    label: Option<String>,
    total: Option<u64>,
    show: ShowProgress,
    parent: Option<SharedReporter>,
    /// Bytes already accounted for by the parent before this child's span
    /// started; added to every update forwarded upward.
    parent_offset: u64,
    start: Option<Instant>,
    last_sent: u64,
}

impl ProgressReporter {
    pub fn new(total: Option<u64>, label: Option<String>, show: ShowProgress) -> Self {
        ProgressReporter {
            label,
            total,
            show,
            parent: None,
            parent_offset: 0,
            start: None,
            last_sent: 0,
        }
    }

    /// Creates a child reporter that forwards its updates to `parent`,
    /// offset by `parent_offset` bytes already accounted for.
    pub fn child(parent: SharedReporter, parent_offset: u64, total: Option<u64>, label: Option<String>) -> Self {
        let show = parent.borrow().show;
        ProgressReporter {
            label,
            total,
            show,
            parent: Some(parent),
            parent_offset,
            start: None,
            last_sent: 0,
        }
    }

    pub fn open(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn update(&mut self, bytes_so_far: u64) {
        self.last_sent = bytes_so_far;
        let start = match self.start {
            Some(s) => s,
            None => {
                self.start = Some(Instant::now());
                self.start.unwrap()
            }
        };

        if let Some(parent) = &self.parent {
            parent.borrow_mut().update(self.parent_offset + bytes_so_far);
            return;
        }

        if !self.show.should_render() {
            return;
        }

        let elapsed = start.elapsed().as_secs_f64().max(1e-9);
        let mbps = (bytes_so_far as f64 * 8.0 / 1_000_000.0) / elapsed;
        let eta = match self.total {
            Some(total) if bytes_so_far > 0 && total > bytes_so_far => {
                let remaining = total - bytes_so_far;
                Some(remaining as f64 * elapsed / bytes_so_far as f64)
            }
            _ => None,
        };

        let label = self.label.as_deref().unwrap_or("");
        match (self.total, eta) {
            (Some(total), Some(eta)) => eprint!(
                "\r{label} {}/{} ({mbps:.1} Mbps, ETA {eta:.0}s)    ",
                crate::humanize::humanize(bytes_so_far),
                crate::humanize::humanize(total),
            ),
            _ => eprint!(
                "\r{label} {} ({mbps:.1} Mbps)    ",
                crate::humanize::humanize(bytes_so_far)
            ),
        }
    }

    pub fn close(&mut self) {
        if let Some(parent) = &self.parent {
            parent.borrow_mut().update(self.parent_offset + self.last_sent);
            return;
        }
        if self.show.should_render() {
            eprintln!();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_shown_does_not_panic() {
        let mut p = ProgressReporter::new(Some(100), Some("test".into()), ShowProgress::Never);
        p.open();
        p.update(50);
        p.close();
    }

    #[test]
    fn child_forwards_with_offset() {
        let parent = Rc::new(RefCell::new(ProgressReporter::new(Some(200), None, ShowProgress::Never)));
        parent.borrow_mut().open();
        let mut child = ProgressReporter::child(Rc::clone(&parent), 100, Some(100), None);
        child.open();
        child.update(30);
        assert_eq!(parent.borrow().last_sent, 130);
    }

    #[test]
    fn eta_is_none_at_zero_progress() {
        let mut p = ProgressReporter::new(Some(100), None, ShowProgress::Never);
        p.open();
        p.update(0);
        assert_eq!(p.last_sent, 0);
    }
}
