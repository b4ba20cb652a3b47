//! Plain text UI: one aligned row per transaction on stdout.

use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;

use crate::events::{Observer, SessionEvent};
use crate::models::Transaction;

use super::UiContext;

/// How long the final lines get to reach the output on stop.
const DRAIN_WAIT: Duration = Duration::from_secs(2);

pub fn construct(_ctx: &UiContext) -> anyhow::Result<Arc<dyn Observer>> {
    Ok(Arc::new(TextUi::spawn(Box::new(io::stdout()))?))
}

/// Rows are written by a dedicated thread so a stalled stdout never holds up
/// the bus.
pub struct TextUi {
    lines: Mutex<Option<Sender<String>>>,
    drained: Mutex<Receiver<()>>,
}

impl TextUi {
    pub fn spawn(mut out: Box<dyn Write + Send>) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<String>();
        let (done_tx, done_rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("tapline-text".into())
            .spawn(move || {
                for line in rx {
                    if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
                        tracing::debug!("Text ui output closed: {}", e);
                        break;
                    }
                }
                let _ = done_tx.send(());
            })?;
        Ok(Self {
            lines: Mutex::new(Some(tx)),
            drained: Mutex::new(done_rx),
        })
    }

    fn write_line(&self, line: String) -> anyhow::Result<()> {
        let lines = self.lines.lock().map_err(|_| anyhow!("text ui channel poisoned"))?;
        match lines.as_ref() {
            Some(tx) => tx.send(line).map_err(|_| anyhow!("text ui writer has exited")),
            None => Ok(()),
        }
    }

    /// Queue the last line, close the channel and give the writer a bounded
    /// time to empty it.
    fn finish(&self, line: String) -> anyhow::Result<()> {
        let sender = {
            let mut lines = self.lines.lock().map_err(|_| anyhow!("text ui channel poisoned"))?;
            lines.take()
        };
        let Some(sender) = sender else {
            return Ok(());
        };
        let _ = sender.send(line);
        drop(sender);

        let drained = self.drained.lock().map_err(|_| anyhow!("text ui channel poisoned"))?;
        match drained.recv_timeout(DRAIN_WAIT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Text ui output did not drain within {:?}", DRAIN_WAIT);
                Ok(())
            }
        }
    }
}

pub fn format_row(tx: &Transaction) -> String {
    format!(
        "{:<7} {:>3} {:>7} {:>8}  {}",
        tx.method.as_str(),
        tx.response_code,
        tx.duration_str(),
        tx.size_str(),
        tx.uri
    )
}

impl Observer for TextUi {
    fn name(&self) -> &str {
        "text-ui"
    }

    fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()> {
        match event {
            SessionEvent::TransactionObserved(tx) => self.write_line(format_row(tx)),
            SessionEvent::SessionStarted(info) => {
                let mut parts = Vec::new();
                if let Some(addr) = info.proxy {
                    parts.push(format!("proxy {addr}"));
                }
                if let Some(addr) = info.relay_server {
                    parts.push(format!("relay {addr}"));
                }
                if let Some(target) = &info.relay_target {
                    parts.push(format!("relaying from {target}"));
                }
                self.write_line(format!("-- {} ({})", info.mode, parts.join(", ")))
            }
            SessionEvent::SessionStopped => self.finish("-- stopped".into()),
            SessionEvent::SessionFailed { cause } => self.finish(format!("-- failed: {cause}")),
            SessionEvent::EndpointFailed { endpoint, cause } => {
                self.write_line(format!("-- {endpoint} unavailable: {cause}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionInfo;
    use crate::models::{Exchange, HttpMethod};
    use crate::transport::TransportMode;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn rows_follow_lifecycle() {
        let buf = SharedBuf::default();
        let ui = TextUi::spawn(Box::new(buf.clone())).unwrap();

        ui.on_event(&SessionEvent::SessionStarted(SessionInfo {
            mode: TransportMode::DirectProxy,
            proxy: Some("127.0.0.1:8080".parse().unwrap()),
            relay_server: None,
            relay_target: None,
        }))
        .unwrap();

        let mut exchange = Exchange::new(HttpMethod::Delete, "http", "a.test", 80, "/item/1", vec![]);
        exchange.detail.timing.total_ms = Some(12);
        exchange.detail.response_size = Some(0);
        ui.on_event(&SessionEvent::TransactionObserved(Arc::new(
            exchange.finish(204, "No Content"),
        )))
        .unwrap();
        ui.on_event(&SessionEvent::SessionStopped).unwrap();

        assert_eq!(
            buf.text(),
            "-- direct proxy (proxy 127.0.0.1:8080)\n\
             DELETE  204    12ms       0B  http://a.test/item/1\n\
             -- stopped\n"
        );
    }

    /// Blocks every write until released.
    struct GatedWriter {
        gate: Arc<(Mutex<bool>, std::sync::Condvar)>,
        inner: SharedBuf,
    }

    impl Write for GatedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let (open, cvar) = &*self.gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stalled_output_does_not_hold_up_publication() {
        let gate = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
        let buf = SharedBuf::default();
        let ui = TextUi::spawn(Box::new(GatedWriter {
            gate: gate.clone(),
            inner: buf.clone(),
        }))
        .unwrap();

        let started = std::time::Instant::now();
        for path in 0..50 {
            let tx = Exchange::new(HttpMethod::Get, "http", "a.test", 80, &format!("/{path}"), vec![])
                .finish(200, "OK");
            ui.on_event(&SessionEvent::TransactionObserved(Arc::new(tx)))
                .unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(buf.text().is_empty());

        *gate.0.lock().unwrap() = true;
        gate.1.notify_all();
        ui.on_event(&SessionEvent::SessionStopped).unwrap();

        let text = buf.text();
        assert_eq!(text.lines().count(), 51);
        assert!(text.ends_with("-- stopped\n"));
    }
}
