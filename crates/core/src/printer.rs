//! Explicit output sink handed to every component that reports progress.

use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Printer {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Printer {
    pub fn new<W: Write + Send + 'static>(w: W) -> Self {
        Self { out: Arc::new(Mutex::new(Box::new(w))) }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn sink() -> Self {
        Self::new(std::io::sink())
    }

    /// Printer writing into a shared in-memory buffer.
    pub fn capture() -> (Self, Captured) {
        let buf = Captured::default();
        (Self::new(buf.clone()), buf)
    }

    /// Write one line; write failures are ignored.
    pub fn msgln(&self, line: impl AsRef<str>) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{}", line.as_ref());
            let _ = out.flush();
        }
    }
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Printer")
    }
}

#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn contents(&self) -> String {
        self.0.lock().map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(|l| l.to_string()).collect()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut b) = self.0.lock() {
            b.extend_from_slice(buf);
        }
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
    fn captured_printer_collects_lines() {
        let (p, cap) = Printer::capture();
        p.msgln("adding keda module to the manifest");
        p.clone().msgln(format!("{} module enabled", "keda"));
        assert_eq!(cap.lines(), vec!["adding keda module to the manifest", "keda module enabled"]);
    }
}
